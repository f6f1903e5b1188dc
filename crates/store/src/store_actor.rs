//! Store actor: owns the composed store and processes commands one at a time.
//!
//! External callers communicate via [`StoreHandle`], which sends
//! [`StoreCommand`]s over an mpsc channel. Backend calls run in spawned
//! tasks that report back through a weak sender, so the actor never waits
//! on the network. Lock-free reads go through `ArcSwap`.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use arc_swap::ArcSwap;
use chamber_connector_core::{Backend, ConnectorError, PromptSender, StreamEvent};
use chamber_protocol::{
    ContextUsage, EditPermissionMode, LoadDirection, MessagePage, ModelSelection, Part,
    PermissionRequest, PermissionResponse, SendRequest, Session, StoreEvent,
};
use futures::future::{AbortHandle, Abortable};
use futures::StreamExt;
use tokio::sync::{broadcast, mpsc, oneshot};
use tokio::time::{Instant, MissedTickBehavior};
use tracing::{debug, info, warn};

use crate::error::StoreError;
use crate::persistence::PersistCommand;
use crate::snapshot::StoreSnapshot;
use crate::store::{Effect, PromptDraft, Store};
use crate::store_command::{Reply, ResultReply, StoreCommand};

/// Handle to the running store actor (cheap to Clone).
#[derive(Clone)]
pub struct StoreHandle {
    command_tx: mpsc::Sender<StoreCommand>,
    snapshot: Arc<ArcSwap<StoreSnapshot>>,
    events: broadcast::Sender<StoreEvent>,
}

impl StoreHandle {
    /// Spawn the actor. It stops once every handle clone is dropped.
    pub fn spawn(mut store: Store, backend: Backend, persist_tx: mpsc::Sender<PersistCommand>) -> Self {
        let (command_tx, command_rx) = mpsc::channel(256);
        let (events, _) = broadcast::channel(1024);
        let snapshot = Arc::new(ArcSwap::from_pointee(store.publish().unwrap_or_default()));

        let actor = StoreActor {
            store,
            backend,
            command_tx: command_tx.downgrade(),
            persist_tx,
            snapshot: snapshot.clone(),
            events: events.clone(),
            outbox: Vec::new(),
            started: Instant::now(),
            loading: HashMap::new(),
            paging: HashSet::new(),
            sends: HashMap::new(),
            next_send_id: 0,
        };
        tokio::spawn(actor.run(command_rx));

        StoreHandle {
            command_tx,
            snapshot,
            events,
        }
    }

    /// Lock-free snapshot read. Does not count as a session access.
    pub fn snapshot(&self) -> Arc<StoreSnapshot> {
        self.snapshot.load_full()
    }

    /// Change notifications, sent after the matching snapshot is published
    pub fn subscribe(&self) -> broadcast::Receiver<StoreEvent> {
        self.events.subscribe()
    }

    async fn send(&self, cmd: StoreCommand) -> Result<(), StoreError> {
        self.command_tx
            .send(cmd)
            .await
            .map_err(|_| StoreError::StoreClosed)
    }

    async fn request<T>(&self, build: impl FnOnce(Reply<T>) -> StoreCommand) -> Result<T, StoreError> {
        let (reply, rx) = oneshot::channel();
        self.send(build(reply)).await?;
        rx.await.map_err(|_| StoreError::StoreClosed)
    }

    // -- Sessions --

    /// Switch the current session. An unmaterialized session starts
    /// loading in the background.
    pub async fn set_current_session(&self, session_id: Option<&str>) -> Result<(), StoreError> {
        let session_id = session_id.map(str::to_string);
        self.request(|reply| StoreCommand::SetCurrentSession { session_id, reply })
            .await
    }

    pub async fn upsert_session(&self, session: Session) -> Result<(), StoreError> {
        self.send(StoreCommand::UpsertSession { session }).await
    }

    pub async fn delete_session(&self, session_id: &str) -> Result<(), StoreError> {
        self.send(StoreCommand::DeleteSession {
            session_id: session_id.to_string(),
        })
        .await
    }

    // -- Message window --

    pub async fn load_messages(&self, session_id: &str) -> Result<(), StoreError> {
        let session_id = session_id.to_string();
        self.request(|reply| StoreCommand::LoadMessages { session_id, reply })
            .await?
    }

    pub async fn load_more_messages(
        &self,
        session_id: &str,
        direction: LoadDirection,
    ) -> Result<(), StoreError> {
        let session_id = session_id.to_string();
        self.request(|reply| StoreCommand::LoadMoreMessages {
            session_id,
            direction,
            reply,
        })
        .await?
    }

    pub async fn update_viewport_anchor(&self, session_id: &str, index: usize) -> Result<(), StoreError> {
        self.send(StoreCommand::UpdateViewportAnchor {
            session_id: session_id.to_string(),
            index,
        })
        .await
    }

    pub async fn trim_to_viewport_window(&self, session_id: &str, target: usize) -> Result<(), StoreError> {
        self.send(StoreCommand::TrimToViewportWindow {
            session_id: session_id.to_string(),
            target,
        })
        .await
    }

    /// Returns the ids of the sessions that were unloaded.
    pub async fn evict_least_recently_used(&self) -> Result<Vec<String>, StoreError> {
        self.request(|reply| StoreCommand::EvictLeastRecentlyUsed { reply })
            .await
    }

    // -- Streaming --

    pub async fn add_streaming_part(&self, part: Part, delta: Option<String>) -> Result<(), StoreError> {
        self.send(StoreCommand::AddStreamingPart { part, delta }).await
    }

    pub async fn complete_streaming_message(&self, message_id: &str) -> Result<(), StoreError> {
        self.send(StoreCommand::CompleteStreamingMessage {
            message_id: message_id.to_string(),
        })
        .await
    }

    pub async fn mark_message_stream_settled(&self, message_id: &str) -> Result<bool, StoreError> {
        let message_id = message_id.to_string();
        self.request(|reply| StoreCommand::MarkMessageStreamSettled { message_id, reply })
            .await
    }

    /// Feed an event from the backend's global event feed
    pub async fn ingest(&self, event: StreamEvent) -> Result<(), StoreError> {
        self.send(StoreCommand::Ingest { event }).await
    }

    /// Call after the backend connection was re-established
    pub async fn reset_activity(&self) -> Result<(), StoreError> {
        self.send(StoreCommand::ResetActivity).await
    }

    // -- Prompts --

    /// Resolves once the backend accepted the prompt; the response streams
    /// into the store afterwards.
    pub async fn send_message(&self, draft: PromptDraft) -> Result<(), StoreError> {
        let session_id = draft.session_id.clone();
        let (reply, rx) = oneshot::channel();
        self.send(StoreCommand::SendMessage { draft, reply }).await?;
        rx.await.unwrap_or(Err(StoreError::Aborted(session_id)))
    }

    /// Cancel whatever the session is doing. Safe to call repeatedly.
    pub async fn abort_session(&self, session_id: &str) -> Result<(), StoreError> {
        let session_id = session_id.to_string();
        self.request(|reply| StoreCommand::AbortSession { session_id, reply })
            .await
    }

    // -- Permissions --

    pub async fn add_permission(&self, request: PermissionRequest) -> Result<(), StoreError> {
        self.send(StoreCommand::AddPermission { request }).await
    }

    /// Resolves once the backend accepted the answer. A refused answer puts
    /// the request back in the pending list.
    pub async fn respond_to_permission(
        &self,
        session_id: &str,
        permission_id: &str,
        response: PermissionResponse,
    ) -> Result<(), StoreError> {
        let session_id = session_id.to_string();
        let permission_id = permission_id.to_string();
        self.request(|reply| StoreCommand::RespondToPermission {
            session_id,
            permission_id,
            response,
            reply,
        })
        .await?
    }

    /// `agent` defaults to the session's selected agent.
    pub async fn toggle_session_agent_edit_mode(
        &self,
        session_id: &str,
        agent: Option<&str>,
    ) -> Result<EditPermissionMode, StoreError> {
        let session_id = session_id.to_string();
        let agent = agent.map(str::to_string);
        self.request(|reply| StoreCommand::ToggleSessionAgentEditMode {
            session_id,
            agent,
            reply,
        })
        .await
    }

    pub async fn set_session_agent_edit_mode(
        &self,
        session_id: &str,
        agent: Option<&str>,
        mode: EditPermissionMode,
    ) -> Result<EditPermissionMode, StoreError> {
        let session_id = session_id.to_string();
        let agent = agent.map(str::to_string);
        self.request(|reply| StoreCommand::SetSessionAgentEditMode {
            session_id,
            agent,
            mode,
            reply,
        })
        .await
    }

    pub async fn effective_edit_mode(
        &self,
        session_id: &str,
        agent: Option<&str>,
    ) -> Result<EditPermissionMode, StoreError> {
        let session_id = session_id.to_string();
        let agent = agent.map(str::to_string);
        self.request(|reply| StoreCommand::EffectiveEditMode {
            session_id,
            agent,
            reply,
        })
        .await
    }

    // -- Context usage --

    pub async fn get_context_usage(
        &self,
        session_id: &str,
        context_limit: u64,
        output_limit: Option<u64>,
    ) -> Result<Option<ContextUsage>, StoreError> {
        let session_id = session_id.to_string();
        self.request(|reply| StoreCommand::GetContextUsage {
            session_id,
            context_limit,
            output_limit,
            reply,
        })
        .await
    }

    pub async fn update_session_context_usage(
        &self,
        session_id: &str,
        context_limit: u64,
        output_limit: Option<u64>,
    ) -> Result<(), StoreError> {
        self.send(StoreCommand::UpdateSessionContextUsage {
            session_id: session_id.to_string(),
            context_limit,
            output_limit,
        })
        .await
    }

    // -- Selections --

    pub async fn set_session_model(&self, session_id: &str, model: ModelSelection) -> Result<(), StoreError> {
        self.send(StoreCommand::SetSessionModel {
            session_id: session_id.to_string(),
            model,
        })
        .await
    }

    pub async fn set_session_agent(&self, session_id: &str, agent: &str) -> Result<(), StoreError> {
        self.send(StoreCommand::SetSessionAgent {
            session_id: session_id.to_string(),
            agent: agent.to_string(),
        })
        .await
    }

    pub async fn set_session_agent_model(
        &self,
        session_id: &str,
        agent: &str,
        model: ModelSelection,
    ) -> Result<(), StoreError> {
        self.send(StoreCommand::SetSessionAgentModel {
            session_id: session_id.to_string(),
            agent: agent.to_string(),
            model,
        })
        .await
    }
}

struct InFlightSend {
    id: u64,
    abort: AbortHandle,
}

/// An initial fetch in flight: who waits on it, and the message and part
/// updates for the session that arrived meanwhile.
#[derive(Default)]
struct PendingLoad {
    waiters: Vec<ResultReply>,
    deferred: Vec<StreamEvent>,
}

struct StoreActor {
    store: Store,
    backend: Backend,
    command_tx: mpsc::WeakSender<StoreCommand>,
    persist_tx: mpsc::Sender<PersistCommand>,
    snapshot: Arc<ArcSwap<StoreSnapshot>>,
    events: broadcast::Sender<StoreEvent>,
    /// Events of the command being processed, sent after publishing
    outbox: Vec<StoreEvent>,
    started: Instant,
    /// Sessions with an initial fetch in flight
    loading: HashMap<String, PendingLoad>,
    paging: HashSet<(String, LoadDirection)>,
    sends: HashMap<String, InFlightSend>,
    next_send_id: u64,
}

impl StoreActor {
    async fn run(mut self, mut command_rx: mpsc::Receiver<StoreCommand>) {
        let mut ticker = tokio::time::interval(self.store.config().tick_interval());
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        info!(
            component = "store_actor",
            event = "store_actor.started",
            "Store actor started"
        );

        loop {
            tokio::select! {
                biased;

                _ = ticker.tick() => {
                    let effects = self.store.tick(self.now());
                    self.run_effects(effects, None).await;
                }

                cmd = command_rx.recv() => match cmd {
                    Some(cmd) => self.handle(cmd).await,
                    None => break,
                },
            }
            self.publish();
        }

        for (_, send) in self.sends.drain() {
            send.abort.abort();
        }
        info!(
            component = "store_actor",
            event = "store_actor.stopped",
            "Store actor stopped"
        );
    }

    /// Milliseconds since the actor started
    fn now(&self) -> u64 {
        self.started.elapsed().as_millis() as u64
    }

    fn publish(&mut self) {
        let published = self.store.publish().map(|snapshot| {
            let revision = snapshot.revision;
            self.snapshot.store(Arc::new(snapshot));
            revision
        });
        for event in self.outbox.drain(..) {
            let _ = self.events.send(event);
        }
        if let Some(revision) = published {
            let _ = self.events.send(StoreEvent::SnapshotPublished { revision });
        }
    }

    async fn handle(&mut self, cmd: StoreCommand) {
        let now = self.now();
        match cmd {
            StoreCommand::EffectiveEditMode {
                session_id,
                agent,
                reply,
            } => {
                let _ = reply.send(self.store.effective_edit_mode(&session_id, agent.as_deref()));
            }
            StoreCommand::GetContextUsage {
                session_id,
                context_limit,
                output_limit,
                reply,
            } => {
                let (usage, effects) =
                    self.store
                        .get_context_usage(&session_id, context_limit, output_limit);
                self.run_effects(effects, None).await;
                let _ = reply.send(usage);
            }

            StoreCommand::SetCurrentSession { session_id, reply } => {
                let effects = self.store.set_current_session(session_id.as_deref(), now);
                self.run_effects(effects, None).await;
                if let Some(id) = session_id {
                    if !self.store.is_materialized(&id) {
                        self.start_load(id, None);
                    }
                }
                let _ = reply.send(());
            }
            StoreCommand::UpsertSession { session } => {
                let effects = self.store.upsert_session(session);
                self.run_effects(effects, None).await;
            }
            StoreCommand::DeleteSession { session_id } => {
                self.cancel_prompt(&session_id);
                let pending = self.loading.remove(&session_id).unwrap_or_default();
                for waiter in pending.waiters {
                    let _ = waiter.send(Err(StoreError::Aborted(session_id.clone())));
                }
                let effects = self.store.delete_session(&session_id);
                self.run_effects(effects, None).await;
            }

            StoreCommand::LoadMessages { session_id, reply } => {
                self.store.touch_session(&session_id, now);
                self.start_load(session_id, Some(reply));
            }
            StoreCommand::LoadMoreMessages {
                session_id,
                direction,
                reply,
            } => {
                self.store.touch_session(&session_id, now);
                self.start_page(session_id, direction, reply);
            }
            StoreCommand::UpdateViewportAnchor { session_id, index } => {
                let effects = self.store.update_viewport_anchor(&session_id, index, now);
                self.run_effects(effects, None).await;
            }
            StoreCommand::TrimToViewportWindow { session_id, target } => {
                let effects = self.store.trim_to_viewport_window(&session_id, target, now);
                self.run_effects(effects, None).await;
            }
            StoreCommand::EvictLeastRecentlyUsed { reply } => {
                let effects = self.store.evict_least_recently_used();
                let evicted = effects
                    .iter()
                    .filter_map(|effect| match effect {
                        Effect::Emit(event) => match event.as_ref() {
                            StoreEvent::SessionEvicted { session_id } => Some(session_id.clone()),
                            _ => None,
                        },
                        _ => None,
                    })
                    .collect();
                self.run_effects(effects, None).await;
                let _ = reply.send(evicted);
            }

            StoreCommand::AddStreamingPart { part, delta } => {
                self.ingest(StreamEvent::PartUpdated { part, delta }, now).await;
            }
            StoreCommand::CompleteStreamingMessage { message_id } => {
                let effects = self.store.complete_streaming_message(&message_id, now);
                self.run_effects(effects, None).await;
            }
            StoreCommand::MarkMessageStreamSettled { message_id, reply } => {
                let _ = reply.send(self.store.mark_message_stream_settled(&message_id));
            }
            StoreCommand::Ingest { event } => self.ingest(event, now).await,
            StoreCommand::ResetActivity => {
                let effects = self.store.reset_activity(now);
                self.run_effects(effects, None).await;
            }

            StoreCommand::SendMessage { draft, reply } => {
                self.start_send(draft, reply, now).await;
            }
            StoreCommand::AbortSession { session_id, reply } => {
                let in_flight = self.cancel_prompt(&session_id);
                if in_flight || !self.store.is_idle(&session_id) {
                    self.abort_backend(session_id.clone());
                }
                let effects = self.store.abort_session(&session_id, now);
                self.run_effects(effects, None).await;
                let _ = reply.send(());
            }

            StoreCommand::AddPermission { request } => {
                let effects = self.store.add_permission(request);
                self.run_effects(effects, None).await;
            }
            StoreCommand::RespondToPermission {
                session_id,
                permission_id,
                response,
                reply,
            } => {
                let effects =
                    self.store
                        .respond_to_permission(&session_id, &permission_id, response, now);
                self.run_effects(effects, Some(reply)).await;
            }
            StoreCommand::ToggleSessionAgentEditMode {
                session_id,
                agent,
                reply,
            } => {
                let (mode, effects) = self
                    .store
                    .toggle_session_agent_edit_mode(&session_id, agent.as_deref());
                self.run_effects(effects, None).await;
                let _ = reply.send(mode);
            }
            StoreCommand::SetSessionAgentEditMode {
                session_id,
                agent,
                mode,
                reply,
            } => {
                let (mode, effects) =
                    self.store
                        .set_session_agent_edit_mode(&session_id, agent.as_deref(), mode);
                self.run_effects(effects, None).await;
                let _ = reply.send(mode);
            }

            StoreCommand::UpdateSessionContextUsage {
                session_id,
                context_limit,
                output_limit,
            } => {
                let effects =
                    self.store
                        .update_session_context_usage(&session_id, context_limit, output_limit);
                self.run_effects(effects, None).await;
            }

            StoreCommand::SetSessionModel { session_id, model } => {
                let effects = self.store.set_session_model(&session_id, model);
                self.run_effects(effects, None).await;
            }
            StoreCommand::SetSessionAgent { session_id, agent } => {
                let effects = self.store.set_session_agent(&session_id, &agent);
                self.run_effects(effects, None).await;
            }
            StoreCommand::SetSessionAgentModel {
                session_id,
                agent,
                model,
            } => {
                let effects = self.store.set_session_agent_model(&session_id, &agent, model);
                self.run_effects(effects, None).await;
            }

            StoreCommand::MessagesFetched { session_id, result } => {
                self.finish_load(session_id, result, now).await;
            }
            StoreCommand::PageFetched {
                session_id,
                direction,
                result,
                reply,
            } => {
                self.paging.remove(&(session_id.clone(), direction));
                match result {
                    Ok(page) => {
                        let effects = self.store.page_loaded(&session_id, direction, page, now);
                        self.run_effects(effects, None).await;
                        let _ = reply.send(Ok(()));
                    }
                    Err(source) => {
                        let error = StoreError::TransientFetch {
                            session_id: session_id.clone(),
                            source,
                        };
                        let effects = self.store.load_failed(&session_id, &error);
                        self.run_effects(effects, None).await;
                        let _ = reply.send(Err(error));
                    }
                }
            }
            StoreCommand::StreamClosed {
                session_id,
                send_id,
                aborted,
            } => {
                let current = self.sends.get(&session_id).is_some_and(|s| s.id == send_id);
                if current {
                    self.sends.remove(&session_id);
                    debug!(
                        component = "store_actor",
                        event = "store_actor.stream_closed",
                        session_id = %session_id,
                        aborted,
                        "Prompt stream closed"
                    );
                    let effects = self.store.stream_closed(&session_id, aborted, now);
                    self.run_effects(effects, None).await;
                }
            }
            StoreCommand::PermissionResponded {
                permission_id,
                restore,
                result,
                reply,
            } => match result {
                Ok(()) => {
                    if let Some(reply) = reply {
                        let _ = reply.send(Ok(()));
                    }
                }
                Err(source) => {
                    let error = StoreError::PermissionResponse {
                        permission_id,
                        source,
                    };
                    let effects = self.store.permission_response_failed(restore, &error);
                    self.run_effects(effects, None).await;
                    if let Some(reply) = reply {
                        let _ = reply.send(Err(error));
                    }
                }
            },
        }
    }

    /// Carry out effects in order. `reply` is handed to the first permission
    /// response; without one it is answered right away.
    async fn run_effects(&mut self, effects: Vec<Effect>, mut reply: Option<ResultReply>) {
        for effect in effects {
            match effect {
                Effect::Persist(cmd) => {
                    if self.persist_tx.send(cmd).await.is_err() {
                        warn!(
                            component = "store_actor",
                            event = "store_actor.persist_closed",
                            "Persistence channel closed, write dropped"
                        );
                    }
                }
                Effect::Emit(event) => self.outbox.push(*event),
                Effect::RespondPermission {
                    session_id,
                    permission_id,
                    response,
                    restore,
                } => {
                    let responder = self.backend.permissions.clone();
                    let tx = self.command_tx.clone();
                    let reply = reply.take();
                    tokio::spawn(async move {
                        let result = responder
                            .respond(&session_id, &permission_id, response)
                            .await;
                        if let Some(tx) = tx.upgrade() {
                            let _ = tx
                                .send(StoreCommand::PermissionResponded {
                                    permission_id,
                                    restore,
                                    result,
                                    reply,
                                })
                                .await;
                        }
                    });
                }
                Effect::AbortSession { session_id } => {
                    self.cancel_prompt(&session_id);
                    self.abort_backend(session_id);
                }
            }
        }
        if let Some(reply) = reply {
            let _ = reply.send(Ok(()));
        }
    }

    /// Apply a backend event. Message and part updates for a session whose
    /// first page is still being fetched are also kept for replay, since the
    /// page may predate them.
    async fn ingest(&mut self, event: StreamEvent, now: u64) {
        let session_id = match &event {
            StreamEvent::MessageUpdated(info) => Some(info.session_id.as_str()),
            StreamEvent::PartUpdated { part, .. } => Some(part.session_id.as_str()),
            _ => None,
        };
        if let Some(pending) = session_id.and_then(|id| self.loading.get_mut(id)) {
            pending.deferred.push(event.clone());
        }
        let effects = self.store.ingest(event, now);
        self.run_effects(effects, None).await;
    }

    fn start_load(&mut self, session_id: String, reply: Option<ResultReply>) {
        if self.store.is_materialized(&session_id) {
            if let Some(reply) = reply {
                let _ = reply.send(Ok(()));
            }
            return;
        }
        if let Some(pending) = self.loading.get_mut(&session_id) {
            pending.waiters.extend(reply);
            return;
        }
        self.loading.insert(
            session_id.clone(),
            PendingLoad {
                waiters: reply.into_iter().collect(),
                deferred: Vec::new(),
            },
        );

        let source = self.backend.messages.clone();
        let limit = self.store.window_size();
        let tx = self.command_tx.clone();
        tokio::spawn(async move {
            let result = source.fetch_latest(&session_id, limit).await;
            if let Some(tx) = tx.upgrade() {
                let _ = tx
                    .send(StoreCommand::MessagesFetched { session_id, result })
                    .await;
            }
        });
    }

    async fn finish_load(
        &mut self,
        session_id: String,
        result: Result<MessagePage, ConnectorError>,
        now: u64,
    ) {
        let Some(PendingLoad { waiters, deferred }) = self.loading.remove(&session_id) else {
            debug!(
                component = "store_actor",
                event = "store_actor.fetch_discarded",
                session_id = %session_id,
                "Session was deleted while loading"
            );
            return;
        };
        match result {
            Ok(page) => {
                let effects = self.store.messages_loaded(&session_id, page, now);
                self.run_effects(effects, None).await;
                let effects = self.store.replay_deferred(&session_id, deferred, now);
                self.run_effects(effects, None).await;
                for waiter in waiters {
                    let _ = waiter.send(Ok(()));
                }
            }
            Err(source) => {
                let message = source.to_string();
                let error = StoreError::TransientFetch {
                    session_id: session_id.clone(),
                    source,
                };
                let effects = self.store.load_failed(&session_id, &error);
                self.run_effects(effects, None).await;

                let mut waiters = waiters.into_iter();
                if let Some(first) = waiters.next() {
                    let _ = first.send(Err(error));
                }
                for waiter in waiters {
                    let _ = waiter.send(Err(StoreError::TransientFetch {
                        session_id: session_id.clone(),
                        source: ConnectorError::BackendError(message.clone()),
                    }));
                }
            }
        }
    }

    fn start_page(&mut self, session_id: String, direction: LoadDirection, reply: ResultReply) {
        let Some(cursor) = self.store.page_cursor(&session_id, direction) else {
            let _ = reply.send(Ok(()));
            return;
        };
        if !self.paging.insert((session_id.clone(), direction)) {
            let _ = reply.send(Ok(()));
            return;
        }

        let source = self.backend.messages.clone();
        let limit = self.store.page_size();
        let tx = self.command_tx.clone();
        tokio::spawn(async move {
            let result = source
                .fetch_page(&session_id, direction, &cursor, limit)
                .await;
            if let Some(tx) = tx.upgrade() {
                let _ = tx
                    .send(StoreCommand::PageFetched {
                        session_id,
                        direction,
                        result,
                        reply,
                    })
                    .await;
            }
        });
    }

    async fn start_send(&mut self, draft: PromptDraft, reply: ResultReply, now: u64) {
        let request = match self.store.prepare_send(draft) {
            Ok(request) => request,
            Err(e) => {
                let _ = reply.send(Err(e));
                return;
            }
        };
        let session_id = request.session_id.clone();

        // A new prompt replaces any stream still attached to the session.
        self.cancel_prompt(&session_id);
        let effects = self.store.session_status(&session_id, true, now);
        self.run_effects(effects, None).await;

        self.next_send_id += 1;
        let send_id = self.next_send_id;
        let (abort, registration) = AbortHandle::new_pair();
        self.sends
            .insert(session_id.clone(), InFlightSend { id: send_id, abort });

        info!(
            component = "store_actor",
            event = "store_actor.prompt_sent",
            session_id = %session_id,
            provider_id = %request.provider_id,
            model_id = %request.model_id,
            "Sending prompt"
        );

        let prompts = self.backend.prompts.clone();
        let tx = self.command_tx.clone();
        tokio::spawn(async move {
            let outcome =
                Abortable::new(stream_prompt(prompts, request, tx.clone(), reply), registration).await;
            let aborted = !matches!(outcome, Ok(true));
            if let Some(tx) = tx.upgrade() {
                let _ = tx
                    .send(StoreCommand::StreamClosed {
                        session_id,
                        send_id,
                        aborted,
                    })
                    .await;
            }
        });
    }

    /// Abort the session's prompt task. Returns whether one was running.
    fn cancel_prompt(&mut self, session_id: &str) -> bool {
        match self.sends.remove(session_id) {
            Some(send) => {
                send.abort.abort();
                true
            }
            None => false,
        }
    }

    fn abort_backend(&self, session_id: String) {
        let prompts = self.backend.prompts.clone();
        tokio::spawn(async move {
            if let Err(e) = prompts.abort(&session_id).await {
                warn!(
                    component = "store_actor",
                    event = "store_actor.abort_failed",
                    session_id = %session_id,
                    error = %e,
                    "Backend abort failed"
                );
            }
        });
    }
}

/// Forward a prompt's event stream into the actor. Returns `false` when the
/// backend refused the prompt.
async fn stream_prompt(
    prompts: Arc<dyn PromptSender>,
    request: SendRequest,
    tx: mpsc::WeakSender<StoreCommand>,
    reply: ResultReply,
) -> bool {
    let session_id = request.session_id.clone();
    let mut stream = match prompts.send(request).await {
        Ok(stream) => {
            let _ = reply.send(Ok(()));
            stream
        }
        Err(source) => {
            warn!(
                component = "store_actor",
                event = "store_actor.send_failed",
                session_id = %session_id,
                error = %source,
                "Prompt was not accepted"
            );
            let _ = reply.send(Err(StoreError::Send { session_id, source }));
            return false;
        }
    };

    while let Some(item) = stream.next().await {
        let event = match item {
            Ok(event) => event,
            Err(e) => StreamEvent::Error {
                session_id: Some(session_id.clone()),
                message: e.to_string(),
            },
        };
        let Some(tx) = tx.upgrade() else {
            break;
        };
        if tx.send(StoreCommand::Ingest { event }).await.is_err() {
            break;
        }
    }
    true
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::StoreConfig;
    use crate::runtime::agent_lookup;
    use crate::test_support::{history_message, text_part, FakeBackend};
    use chamber_protocol::{
        ActivityPhase, AgentDefinition, AgentPermission, MessageInfo, MessageRole, StreamPhase,
    };
    use std::time::Duration;
    use tokio::sync::broadcast::error::RecvError;

    fn spawn_with(fake: &Arc<FakeBackend>, config: StoreConfig) -> StoreHandle {
        let backend = fake.backend();
        let store = Store::new(config, agent_lookup(&backend));
        let (persist_tx, mut persist_rx) = mpsc::channel(64);
        tokio::spawn(async move { while persist_rx.recv().await.is_some() {} });
        StoreHandle::spawn(store, backend, persist_tx)
    }

    fn spawn(fake: &Arc<FakeBackend>) -> StoreHandle {
        spawn_with(fake, StoreConfig::default())
    }

    async fn wait_for(
        rx: &mut broadcast::Receiver<StoreEvent>,
        pred: impl Fn(&StoreEvent) -> bool,
    ) -> StoreEvent {
        tokio::time::timeout(Duration::from_secs(60), async {
            loop {
                match rx.recv().await {
                    Ok(event) if pred(&event) => return event,
                    Ok(_) | Err(RecvError::Lagged(_)) => continue,
                    Err(RecvError::Closed) => panic!("event channel closed"),
                }
            }
        })
        .await
        .expect("event not observed")
    }

    async fn eventually(mut check: impl FnMut() -> bool) {
        for _ in 0..500 {
            if check() {
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("condition not reached");
    }

    /// Round-trip through the actor so every earlier command is applied.
    async fn barrier(handle: &StoreHandle) {
        handle.effective_edit_mode("barrier", None).await.unwrap();
    }

    fn model() -> ModelSelection {
        ModelSelection {
            provider_id: "anthropic".into(),
            model_id: "claude-sonnet".into(),
        }
    }

    fn draft(session_id: &str) -> PromptDraft {
        PromptDraft {
            session_id: session_id.into(),
            content: "hello".into(),
            model: Some(model()),
            ..PromptDraft::default()
        }
    }

    fn permission(id: &str, session_id: &str, kind: &str) -> PermissionRequest {
        PermissionRequest {
            id: id.into(),
            permission_type: kind.into(),
            session_id: session_id.into(),
            message_id: format!("{session_id}-m1"),
            call_id: None,
            title: format!("run {kind}"),
            metadata: serde_json::Value::Null,
            created_at: 0,
        }
    }

    fn finished(session_id: &str, message_id: &str) -> MessageInfo {
        let mut info = MessageInfo::placeholder(message_id, session_id, MessageRole::Assistant, 1);
        info.finish = Some("stop".into());
        info
    }

    #[tokio::test(start_paused = true)]
    async fn switching_session_loads_in_background() {
        let fake = FakeBackend::new();
        fake.with_history("a", 10);
        let handle = spawn(&fake);
        let mut events = handle.subscribe();

        handle.set_current_session(Some("a")).await.unwrap();
        wait_for(&mut events, |e| {
            matches!(e, StoreEvent::MessagesLoaded { session_id, .. } if session_id == "a")
        })
        .await;

        let snapshot = handle.snapshot();
        assert_eq!(snapshot.current_session_id.as_deref(), Some("a"));
        assert_eq!(snapshot.messages("a").len(), 10);
    }

    #[tokio::test(start_paused = true)]
    async fn loading_twice_fetches_once() {
        let fake = FakeBackend::new();
        fake.with_history("a", 10);
        let handle = spawn(&fake);

        handle.load_messages("a").await.unwrap();
        handle.load_messages("a").await.unwrap();

        assert_eq!(fake.fetch_calls(), 1);
        assert_eq!(handle.snapshot().messages("a").len(), 10);
    }

    #[tokio::test(start_paused = true)]
    async fn concurrent_loads_share_one_fetch() {
        let fake = FakeBackend::new();
        fake.with_history("a", 10);
        fake.set_fetch_delay(Duration::from_millis(100));
        let handle = spawn(&fake);

        let (first, second) = tokio::join!(handle.load_messages("a"), handle.load_messages("a"));
        first.unwrap();
        second.unwrap();

        assert_eq!(fake.fetch_calls(), 1);
        assert_eq!(handle.snapshot().messages("a").len(), 10);
    }

    #[tokio::test(start_paused = true)]
    async fn parts_streamed_during_first_load_are_kept() {
        let fake = FakeBackend::new();
        let mut reply = history_message("a", 1);
        reply.parts.push(text_part("a", "a-1", "Hel"));
        fake.with_messages("a", vec![history_message("a", 0), reply]);
        fake.set_fetch_delay(Duration::from_millis(100));
        let handle = spawn(&fake);

        let load = tokio::spawn({
            let handle = handle.clone();
            async move { handle.load_messages("a").await }
        });
        eventually(|| fake.fetch_calls() == 1).await;

        // The fetched page still holds "Hel" when these arrive.
        handle
            .add_streaming_part(text_part("a", "a-1", "Hello"), Some("lo".into()))
            .await
            .unwrap();
        handle
            .ingest(StreamEvent::PartUpdated {
                part: text_part("a", "a-live", "Hi"),
                delta: None,
            })
            .await
            .unwrap();
        barrier(&handle).await;
        assert!(handle.snapshot().messages("a").is_empty());

        load.await.unwrap().unwrap();
        handle
            .add_streaming_part(text_part("a", "a-1", "Hello world"), Some(" world".into()))
            .await
            .unwrap();
        barrier(&handle).await;

        let snapshot = handle.snapshot();
        let messages = snapshot.messages("a");
        let ids: Vec<_> = messages.iter().map(|m| m.id()).collect();
        assert_eq!(ids, vec!["a-0", "a-1", "a-live"]);
        assert_eq!(messages[1].parts[0].text(), Some("Hello world"));
        assert_eq!(messages[2].parts[0].text(), Some("Hi"));
    }

    #[tokio::test(start_paused = true)]
    async fn failed_fetch_leaves_state_and_can_be_retried() {
        let fake = FakeBackend::new();
        fake.with_history("a", 10);
        fake.fail_fetches(true);
        let handle = spawn(&fake);

        let err = handle.load_messages("a").await.unwrap_err();
        assert!(matches!(err, StoreError::TransientFetch { ref session_id, .. } if session_id == "a"));
        assert!(err.is_retryable());
        assert!(handle.snapshot().messages("a").is_empty());

        fake.fail_fetches(false);
        handle.load_messages("a").await.unwrap();
        assert_eq!(handle.snapshot().messages("a").len(), 10);
        assert_eq!(fake.fetch_calls(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn load_more_up_prepends_and_trims_the_bottom() {
        let fake = FakeBackend::new();
        fake.with_history("a", 120);
        let handle = spawn(&fake);

        handle.load_messages("a").await.unwrap();
        let snapshot = handle.snapshot();
        assert_eq!(snapshot.messages("a")[0].id(), "a-30");
        assert!(snapshot.memory("a").unwrap().has_more_above);

        handle
            .load_more_messages("a", LoadDirection::Up)
            .await
            .unwrap();
        let snapshot = handle.snapshot();
        let messages = snapshot.messages("a");
        assert_eq!(messages.len(), 90);
        assert_eq!(messages[0].id(), "a-0");
        assert!(!snapshot.memory("a").unwrap().has_more_above);
        assert!(snapshot.memory("a").unwrap().has_more_below);
    }

    #[tokio::test(start_paused = true)]
    async fn explicit_eviction_reports_unloaded_sessions() {
        let fake = FakeBackend::new();
        fake.with_history("a", 4);
        fake.with_history("b", 4);
        let config = StoreConfig {
            max_materialized_sessions: 1,
            auto_evict: false,
            ..StoreConfig::default()
        };
        let handle = spawn_with(&fake, config);

        handle.load_messages("a").await.unwrap();
        handle.set_current_session(Some("b")).await.unwrap();
        handle.load_messages("b").await.unwrap();

        assert_eq!(handle.evict_least_recently_used().await.unwrap(), vec!["a"]);
        let snapshot = handle.snapshot();
        assert!(snapshot.messages("a").is_empty());
        assert_eq!(snapshot.messages("b").len(), 4);
    }

    #[tokio::test(start_paused = true)]
    async fn prompt_streams_then_cools_down_to_idle() {
        let fake = FakeBackend::new();
        fake.script(vec![
            StreamEvent::PartUpdated {
                part: text_part("a", "a-r1", "hi"),
                delta: Some("hi".into()),
            },
            StreamEvent::MessageUpdated(finished("a", "a-r1")),
        ]);
        let handle = spawn(&fake);
        let mut events = handle.subscribe();

        handle.send_message(draft("a")).await.unwrap();
        wait_for(&mut events, |e| {
            matches!(e, StoreEvent::ActivityChanged { phase: ActivityPhase::Cooldown, .. })
        })
        .await;
        wait_for(&mut events, |e| {
            matches!(e, StoreEvent::ActivityChanged { phase: ActivityPhase::Idle, .. })
        })
        .await;

        let sent = fake.sent();
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].model_id, "claude-sonnet");
        assert_eq!(sent[0].agent.as_deref(), Some("build"));

        let snapshot = handle.snapshot();
        assert_eq!(snapshot.activity("a"), ActivityPhase::Idle);
        assert_eq!(snapshot.lifecycles["a-r1"].phase, StreamPhase::Completed);
    }

    #[tokio::test(start_paused = true)]
    async fn send_without_model_is_refused() {
        let fake = FakeBackend::new();
        let handle = spawn(&fake);

        let err = handle
            .send_message(PromptDraft {
                session_id: "a".into(),
                content: "hello".into(),
                ..PromptDraft::default()
            })
            .await
            .unwrap_err();

        assert!(matches!(err, StoreError::NoModelSelected(ref s) if s == "a"));
        assert!(fake.sent().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn abort_is_idempotent() {
        let fake = FakeBackend::new();
        fake.hold_streams(true);
        fake.script(vec![StreamEvent::PartUpdated {
            part: text_part("a", "a-r1", "partial"),
            delta: None,
        }]);
        let handle = spawn(&fake);
        let mut events = handle.subscribe();

        handle.send_message(draft("a")).await.unwrap();
        wait_for(&mut events, |e| {
            matches!(e, StoreEvent::StreamPhaseChanged { phase: StreamPhase::Streaming, .. })
        })
        .await;

        handle.abort_session("a").await.unwrap();
        handle.abort_session("a").await.unwrap();
        barrier(&handle).await;

        let snapshot = handle.snapshot();
        assert_eq!(snapshot.activity("a"), ActivityPhase::Idle);
        assert_eq!(snapshot.lifecycles["a-r1"].phase, StreamPhase::Completed);
        eventually(|| fake.aborts() == vec!["a".to_string()]).await;
    }

    #[tokio::test(start_paused = true)]
    async fn rejecting_a_permission_aborts_the_prompt() {
        let fake = FakeBackend::new();
        fake.hold_streams(true);
        fake.script(vec![StreamEvent::PermissionAsked(permission("p1", "a", "bash"))]);
        let handle = spawn(&fake);
        let mut events = handle.subscribe();

        handle.send_message(draft("a")).await.unwrap();
        wait_for(&mut events, |e| matches!(e, StoreEvent::PermissionPending { .. })).await;
        assert_eq!(handle.snapshot().pending_permissions("a").len(), 1);

        handle
            .respond_to_permission("a", "p1", PermissionResponse::Reject)
            .await
            .unwrap();
        barrier(&handle).await;

        assert_eq!(
            fake.responses(),
            vec![("p1".to_string(), PermissionResponse::Reject)]
        );
        assert!(handle.snapshot().pending_permissions("a").is_empty());
        assert_eq!(handle.snapshot().activity("a"), ActivityPhase::Idle);
        eventually(|| fake.aborts().contains(&"a".to_string())).await;
    }

    #[tokio::test(start_paused = true)]
    async fn refused_response_puts_the_request_back() {
        let fake = FakeBackend::new();
        fake.fail_responses(true);
        let handle = spawn(&fake);

        handle.add_permission(permission("p1", "a", "bash")).await.unwrap();
        barrier(&handle).await;
        assert_eq!(handle.snapshot().pending_permissions("a").len(), 1);

        let err = handle
            .respond_to_permission("a", "p1", PermissionResponse::Once)
            .await
            .unwrap_err();
        assert!(matches!(err, StoreError::PermissionResponse { ref permission_id, .. } if permission_id == "p1"));
        barrier(&handle).await;

        let snapshot = handle.snapshot();
        assert_eq!(snapshot.pending_permissions("a").len(), 1);
        assert_eq!(snapshot.pending_permissions("a")[0].id, "p1");
    }

    #[tokio::test(start_paused = true)]
    async fn edit_requests_are_answered_for_trusted_agents() {
        let fake = FakeBackend::new();
        fake.with_agent(AgentDefinition {
            name: "builder".into(),
            permission: AgentPermission {
                edit: Some(EditPermissionMode::Allow),
                ..AgentPermission::default()
            },
            ..AgentDefinition::default()
        });
        let handle = spawn(&fake);

        handle.set_session_agent("a", "builder").await.unwrap();
        handle.add_permission(permission("p1", "a", "edit")).await.unwrap();

        eventually(|| fake.responses() == vec![("p1".to_string(), PermissionResponse::Once)]).await;
        assert!(handle.snapshot().pending_permissions("a").is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn quiet_streams_cool_down_then_complete() {
        let fake = FakeBackend::new();
        let handle = spawn(&fake);

        handle
            .add_streaming_part(text_part("a", "a-r1", "partial"), None)
            .await
            .unwrap();
        barrier(&handle).await;
        assert_eq!(handle.snapshot().lifecycles["a-r1"].phase, StreamPhase::Streaming);
        assert_eq!(handle.snapshot().activity("a"), ActivityPhase::Busy);

        tokio::time::sleep(Duration::from_millis(2_500)).await;
        barrier(&handle).await;
        assert_eq!(handle.snapshot().lifecycles["a-r1"].phase, StreamPhase::Cooldown);

        tokio::time::sleep(Duration::from_millis(30_000)).await;
        barrier(&handle).await;
        let snapshot = handle.snapshot();
        assert_eq!(snapshot.lifecycles["a-r1"].phase, StreamPhase::Completed);
        assert_eq!(snapshot.activity("a"), ActivityPhase::Idle);
    }

    #[tokio::test(start_paused = true)]
    async fn reset_activity_releases_busy_sessions() {
        let fake = FakeBackend::new();
        let handle = spawn(&fake);

        handle
            .ingest(StreamEvent::SessionStatus {
                session_id: "a".into(),
                busy: true,
            })
            .await
            .unwrap();
        handle
            .add_streaming_part(text_part("b", "b-r1", "partial"), None)
            .await
            .unwrap();
        barrier(&handle).await;
        assert_eq!(handle.snapshot().activity("a"), ActivityPhase::Busy);

        handle.reset_activity().await.unwrap();
        barrier(&handle).await;

        let snapshot = handle.snapshot();
        assert_eq!(snapshot.activity("a"), ActivityPhase::Idle);
        assert_eq!(snapshot.activity("b"), ActivityPhase::Idle);
    }

    #[tokio::test(start_paused = true)]
    async fn dropping_every_handle_closes_the_store() {
        let fake = FakeBackend::new();
        let handle = spawn(&fake);
        let mut events = handle.subscribe();
        drop(handle);

        let closed = tokio::time::timeout(Duration::from_secs(5), async {
            loop {
                if let Err(RecvError::Closed) = events.recv().await {
                    return;
                }
            }
        })
        .await;
        assert!(closed.is_ok());
    }
}
