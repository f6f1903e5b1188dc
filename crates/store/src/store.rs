//! Composed store.
//!
//! Owns one instance of every slice and routes each operation to the slice
//! that owns the data. Operations are synchronous and return the effects the
//! actor must carry out: persistence writes, broadcasts and backend calls.
//! After each command the actor asks for a fresh snapshot; slices whose
//! revision did not move keep their previously published `Arc`s.

use std::collections::HashMap;
use std::sync::Arc;

use chamber_connector_core::StreamEvent;
use chamber_protocol::{
    ActivityPhase, Attachment, ContextUsage, EditPermissionMode, LoadDirection, MessageInfo,
    MessagePage, MessageRole, ModelSelection, Part, PermissionRequest, PermissionResponse,
    SendRequest, Session, StoreEvent,
};
use tracing::{debug, error, info, warn};

use crate::config::StoreConfig;
use crate::context_usage::ContextUsageCache;
use crate::error::StoreError;
use crate::permission::{AgentLookup, GateDecision, PermissionGate};
use crate::persistence::{PersistCommand, PersistKey, PersistedState};
use crate::registry::SessionRegistry;
use crate::selection::SelectionState;
use crate::snapshot::StoreSnapshot;
use crate::streaming::{StreamingTracker, TrackerChange};
use crate::window::{SessionWindowManager, StreamAppend, TrimOutcome};

/// Side effects produced by a store operation
#[derive(Debug)]
pub enum Effect {
    Persist(PersistCommand),
    Emit(Box<StoreEvent>),
    /// Submit a permission answer. `restore` is put back in the pending
    /// list if the backend refuses it.
    RespondPermission {
        session_id: String,
        permission_id: String,
        response: PermissionResponse,
        restore: Option<PermissionRequest>,
    },
    /// Cancel the session's in-flight prompt
    AbortSession { session_id: String },
}

fn emit(effects: &mut Vec<Effect>, event: StoreEvent) {
    effects.push(Effect::Emit(Box::new(event)));
}

/// Prompt as submitted by the UI; unset fields come from the session's
/// selections.
#[derive(Debug, Clone, Default)]
pub struct PromptDraft {
    pub session_id: String,
    pub content: String,
    pub model: Option<ModelSelection>,
    pub agent: Option<String>,
    pub attachments: Vec<Attachment>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct SliceRevisions {
    registry: u64,
    windows: u64,
    tracker: u64,
    gate: u64,
    usage: u64,
    selection: u64,
}

pub struct Store {
    config: StoreConfig,
    registry: SessionRegistry,
    windows: SessionWindowManager,
    tracker: StreamingTracker,
    usage: ContextUsageCache,
    gate: PermissionGate,
    selection: SelectionState,
    /// Last (context, output) limits supplied per session
    limits: HashMap<String, (u64, Option<u64>)>,
    published: StoreSnapshot,
    published_revisions: Option<SliceRevisions>,
    message_revisions: HashMap<String, u64>,
}

impl Store {
    pub fn new(config: StoreConfig, agent_lookup: AgentLookup) -> Self {
        Self {
            registry: SessionRegistry::default(),
            windows: SessionWindowManager::new(&config),
            tracker: StreamingTracker::new(&config),
            usage: ContextUsageCache::new(config.default_output_reservation),
            gate: PermissionGate::new(agent_lookup),
            selection: SelectionState::new(config.default_agent.clone()),
            limits: HashMap::new(),
            published: StoreSnapshot::default(),
            published_revisions: None,
            message_revisions: HashMap::new(),
            config,
        }
    }

    pub fn config(&self) -> &StoreConfig {
        &self.config
    }

    /// Seed selections and pending permissions from disk
    pub fn restore(&mut self, state: PersistedState) {
        self.selection.restore(
            state.session_models,
            state.session_agents,
            state.session_agent_models,
        );
        self.gate
            .restore(state.session_agent_edit_modes, state.pending_permissions);
    }

    // -- Queries ------------------------------------------------------------

    pub fn current_session(&self) -> Option<&str> {
        self.registry.current()
    }

    pub fn is_materialized(&self, session_id: &str) -> bool {
        self.windows.is_materialized(session_id)
    }

    pub fn page_cursor(&self, session_id: &str, direction: LoadDirection) -> Option<String> {
        self.windows.page_cursor(session_id, direction)
    }

    pub fn window_size(&self) -> usize {
        self.windows.window_size()
    }

    pub fn page_size(&self) -> usize {
        self.windows.page_size()
    }

    pub fn is_idle(&self, session_id: &str) -> bool {
        self.tracker.is_idle(session_id)
    }

    pub fn agent_for_session(&self, session_id: &str) -> &str {
        self.selection.agent_for_session(session_id)
    }

    pub fn effective_edit_mode(&self, session_id: &str, agent: Option<&str>) -> EditPermissionMode {
        let agent = agent.unwrap_or_else(|| self.selection.agent_for_session(session_id));
        self.gate.effective_edit_mode(session_id, agent)
    }

    // -- Sessions -----------------------------------------------------------

    pub fn set_current_session(&mut self, session_id: Option<&str>, now: u64) -> Vec<Effect> {
        let mut effects = Vec::new();
        if !self.registry.set_current(session_id) {
            return effects;
        }
        if let Some(id) = session_id {
            self.windows.touch(id, now);
            self.windows.mark_anchor_pending(id);
        }
        emit(
            &mut effects,
            StoreEvent::CurrentSessionChanged {
                session_id: session_id.map(str::to_string),
            },
        );
        effects
    }

    /// Record an access that changes no content
    pub fn touch_session(&mut self, session_id: &str, now: u64) {
        self.windows.touch(session_id, now);
    }

    pub fn upsert_session(&mut self, session: Session) -> Vec<Effect> {
        let mut effects = Vec::new();
        if self.registry.upsert(session.clone()) {
            emit(&mut effects, StoreEvent::SessionUpdated { session });
        }
        effects
    }

    /// Drop every trace of a session from every slice.
    pub fn delete_session(&mut self, session_id: &str) -> Vec<Effect> {
        let mut effects = Vec::new();
        let was_current = self.registry.current() == Some(session_id);

        self.registry.remove(session_id);
        self.windows.remove_session(session_id);
        self.tracker.remove_session(session_id);
        self.usage.remove(session_id);
        self.gate.remove_session(session_id);
        self.selection.remove_session(session_id);
        self.limits.remove(session_id);
        self.message_revisions.remove(session_id);

        info!(
            component = "store",
            event = "store.session_deleted",
            session_id = %session_id,
            "Session removed from store"
        );

        for key in PersistKey::ALL {
            effects.extend(self.persist(key));
        }
        if was_current {
            emit(&mut effects, StoreEvent::CurrentSessionChanged { session_id: None });
        }
        emit(
            &mut effects,
            StoreEvent::SessionDeleted {
                session_id: session_id.to_string(),
            },
        );
        effects
    }

    // -- Message window -----------------------------------------------------

    /// Apply the result of an initial fetch. A session that got
    /// materialized meanwhile is left alone.
    pub fn messages_loaded(&mut self, session_id: &str, page: MessagePage, now: u64) -> Vec<Effect> {
        let mut effects = Vec::new();
        if !self.windows.apply_initial_load(session_id, page, now) {
            debug!(
                component = "store",
                event = "store.load_skipped",
                session_id = %session_id,
                "Session already materialized"
            );
            return effects;
        }
        self.windows
            .set_streaming(session_id, !self.tracker.is_idle(session_id));

        let loaded_count = self.windows.messages(session_id).len();
        info!(
            component = "store",
            event = "store.messages_loaded",
            session_id = %session_id,
            loaded_count,
            "Session materialized"
        );
        emit(
            &mut effects,
            StoreEvent::MessagesLoaded {
                session_id: session_id.to_string(),
                loaded_count,
            },
        );
        self.refresh_usage(session_id, false, &mut effects);

        if self.config.auto_evict {
            effects.extend(self.evict_least_recently_used());
        }
        effects
    }

    pub fn load_failed(&mut self, session_id: &str, error: &StoreError) -> Vec<Effect> {
        warn!(
            component = "store",
            event = "store.load_failed",
            session_id = %session_id,
            error = %error,
            "Message fetch failed"
        );
        let mut effects = Vec::new();
        emit(
            &mut effects,
            StoreEvent::LoadFailed {
                session_id: session_id.to_string(),
                message: error.to_string(),
            },
        );
        effects
    }

    pub fn page_loaded(
        &mut self,
        session_id: &str,
        direction: LoadDirection,
        page: MessagePage,
        now: u64,
    ) -> Vec<Effect> {
        let mut effects = Vec::new();
        let streaming = !self.tracker.is_idle(session_id);
        match self
            .windows
            .apply_page(session_id, direction, page, streaming, now)
        {
            Ok(outcome) => {
                emit(
                    &mut effects,
                    StoreEvent::MessagesLoaded {
                        session_id: session_id.to_string(),
                        loaded_count: self.windows.messages(session_id).len(),
                    },
                );
                if outcome.trimmed > 0 {
                    emit(
                        &mut effects,
                        StoreEvent::MessagesTrimmed {
                            session_id: session_id.to_string(),
                            removed: outcome.trimmed,
                        },
                    );
                }
            }
            Err(e) => self.anchor_cleared(session_id, &e, &mut effects),
        }
        self.refresh_usage(session_id, false, &mut effects);
        effects
    }

    pub fn update_viewport_anchor(&mut self, session_id: &str, index: usize, now: u64) -> Vec<Effect> {
        let mut effects = Vec::new();
        if let Err(e) = self.windows.update_anchor(session_id, index, now) {
            self.anchor_cleared(session_id, &e, &mut effects);
        }
        effects
    }

    fn anchor_cleared(&self, session_id: &str, error: &StoreError, effects: &mut Vec<Effect>) {
        warn!(
            component = "store",
            event = "store.anchor_cleared",
            session_id = %session_id,
            error = %error,
            "Cleared stale viewport anchor"
        );
        emit(
            effects,
            StoreEvent::AnchorCleared {
                session_id: session_id.to_string(),
            },
        );
    }

    pub fn trim_to_viewport_window(&mut self, session_id: &str, target: usize, now: u64) -> Vec<Effect> {
        let mut effects = Vec::new();
        let streaming = !self.tracker.is_idle(session_id);
        match self
            .windows
            .trim_to_viewport_window(session_id, target, streaming, now)
        {
            TrimOutcome::Trimmed { removed } => emit(
                &mut effects,
                StoreEvent::MessagesTrimmed {
                    session_id: session_id.to_string(),
                    removed,
                },
            ),
            TrimOutcome::SkippedStreaming => debug!(
                component = "store",
                event = "store.trim_skipped",
                session_id = %session_id,
                "Trim refused while streaming"
            ),
            TrimOutcome::Unchanged => {}
        }
        effects
    }

    pub fn evict_least_recently_used(&mut self) -> Vec<Effect> {
        let mut effects = Vec::new();
        let current = self.registry.current().map(str::to_string);
        let tracker = &self.tracker;
        let report = self
            .windows
            .evict_least_recently_used(current.as_deref(), |id| tracker.is_idle(id));

        for skipped in &report.skipped {
            debug!(
                component = "store",
                event = "store.eviction_skipped",
                reason = %skipped,
                "Eviction candidate kept"
            );
        }
        for session_id in report.evicted {
            info!(
                component = "store",
                event = "store.session_evicted",
                session_id = %session_id,
                "Evicted least recently used session"
            );
            self.message_revisions.remove(&session_id);
            emit(&mut effects, StoreEvent::SessionEvicted { session_id });
        }
        effects
    }

    // -- Streaming ----------------------------------------------------------

    pub fn add_streaming_part(&mut self, part: Part, delta: Option<String>, now: u64) -> Vec<Effect> {
        let mut effects = Vec::new();
        let user_message = self.windows.message_role(&part.session_id, &part.message_id)
            == Some(MessageRole::User);
        if !user_message {
            let changes = self.tracker.record_part(&part.session_id, &part.message_id, now);
            self.apply_tracker_changes(changes, now, &mut effects);
        }

        let session_id = part.session_id.clone();
        match self.windows.upsert_part(part, delta.as_deref(), now) {
            StreamAppend::Applied => {
                if self.is_idle(&session_id) {
                    self.settle_window(&session_id, now, &mut effects);
                }
            }
            StreamAppend::NotMaterialized | StreamAppend::OutsideWindow => debug!(
                component = "store",
                event = "store.part_deferred",
                session_id = %session_id,
                "Part left for the next load"
            ),
        }
        effects
    }

    /// Message metadata changed. A finished assistant message completes
    /// its lifecycle and refreshes context usage.
    pub fn message_updated(&mut self, info: MessageInfo, now: u64) -> Vec<Effect> {
        let mut effects = Vec::new();
        let session_id = info.session_id.clone();
        let message_id = info.id.clone();
        let finished = info.role == MessageRole::Assistant && info.is_finished();
        let has_tokens = info.tokens.is_some();

        let applied = self.windows.upsert_message_info(info, now) == StreamAppend::Applied;
        if finished {
            let changes = self.tracker.complete(&message_id, now);
            self.apply_tracker_changes(changes, now, &mut effects);
        }
        if applied && self.is_idle(&session_id) {
            self.settle_window(&session_id, now, &mut effects);
        }
        if has_tokens {
            self.refresh_usage(&session_id, true, &mut effects);
        }
        effects
    }

    /// Apply message and part updates that arrived while the session's
    /// first page was being fetched. Stream lifecycles already saw these
    /// events, so only the window and context usage are updated.
    pub fn replay_deferred(&mut self, session_id: &str, events: Vec<StreamEvent>, now: u64) -> Vec<Effect> {
        let mut effects = Vec::new();
        if events.is_empty() || !self.windows.is_materialized(session_id) {
            return effects;
        }
        let mut refresh = false;
        let count = events.len();
        for event in events {
            match event {
                StreamEvent::MessageUpdated(info) => {
                    refresh |= info.tokens.is_some();
                    self.windows.upsert_message_info(info, now);
                }
                StreamEvent::PartUpdated { part, delta } => {
                    self.windows.upsert_part(part, delta.as_deref(), now);
                }
                _ => {}
            }
        }
        debug!(
            component = "store",
            event = "store.deferred_replayed",
            session_id = %session_id,
            count,
            "Replayed updates received during load"
        );
        if self.is_idle(session_id) {
            self.settle_window(session_id, now, &mut effects);
        }
        if refresh {
            self.refresh_usage(session_id, true, &mut effects);
        }
        effects
    }

    pub fn complete_streaming_message(&mut self, message_id: &str, now: u64) -> Vec<Effect> {
        let mut effects = Vec::new();
        let changes = self.tracker.complete(message_id, now);
        self.apply_tracker_changes(changes, now, &mut effects);
        effects
    }

    pub fn mark_message_stream_settled(&mut self, message_id: &str) -> bool {
        self.tracker.mark_settled(message_id)
    }

    pub fn session_status(&mut self, session_id: &str, busy: bool, now: u64) -> Vec<Effect> {
        let mut effects = Vec::new();
        let changes = self.tracker.set_backend_status(session_id, busy, now);
        self.apply_tracker_changes(changes, now, &mut effects);
        effects
    }

    pub fn tick(&mut self, now: u64) -> Vec<Effect> {
        let mut effects = Vec::new();
        let changes = self.tracker.tick(now);
        self.apply_tracker_changes(changes, now, &mut effects);
        effects
    }

    pub fn abort_session(&mut self, session_id: &str, now: u64) -> Vec<Effect> {
        let mut effects = Vec::new();
        let changes = self.tracker.abort_session(session_id, now);
        self.apply_tracker_changes(changes, now, &mut effects);
        effects
    }

    pub fn reset_activity(&mut self, now: u64) -> Vec<Effect> {
        let mut effects = Vec::new();
        let changes = self.tracker.reset_all(now);
        info!(
            component = "store",
            event = "store.activity_reset",
            changes = changes.len(),
            "Reset session activity"
        );
        self.apply_tracker_changes(changes, now, &mut effects);
        effects
    }

    fn apply_tracker_changes(&mut self, changes: Vec<TrackerChange>, now: u64, effects: &mut Vec<Effect>) {
        for change in changes {
            match change {
                TrackerChange::Stream {
                    session_id,
                    message_id,
                    phase,
                } => emit(
                    effects,
                    StoreEvent::StreamPhaseChanged {
                        session_id,
                        message_id,
                        phase,
                    },
                ),
                TrackerChange::Activity { session_id, phase } => {
                    self.windows
                        .set_streaming(&session_id, phase != ActivityPhase::Idle);
                    debug!(
                        component = "store",
                        event = "store.activity_changed",
                        session_id = %session_id,
                        phase = ?phase,
                        "Session activity changed"
                    );
                    if phase == ActivityPhase::Idle {
                        self.settle_window(&session_id, now, effects);
                    }
                    emit(effects, StoreEvent::ActivityChanged { session_id, phase });
                }
            }
        }
    }

    /// Bring a window that grew while streaming back under the bound.
    fn settle_window(&mut self, session_id: &str, now: u64, effects: &mut Vec<Effect>) {
        if self.windows.messages(session_id).len() <= self.windows.window_size() {
            return;
        }
        let target = self.windows.window_size();
        if let TrimOutcome::Trimmed { removed } =
            self.windows
                .trim_to_viewport_window(session_id, target, false, now)
        {
            emit(
                effects,
                StoreEvent::MessagesTrimmed {
                    session_id: session_id.to_string(),
                    removed,
                },
            );
        }
    }

    // -- Context usage ------------------------------------------------------

    pub fn get_context_usage(
        &mut self,
        session_id: &str,
        context_limit: u64,
        output_limit: Option<u64>,
    ) -> (Option<ContextUsage>, Vec<Effect>) {
        let mut effects = Vec::new();
        self.limits
            .insert(session_id.to_string(), (context_limit, output_limit));
        let usage = self.refresh_usage(session_id, false, &mut effects);
        (usage, effects)
    }

    pub fn update_session_context_usage(
        &mut self,
        session_id: &str,
        context_limit: u64,
        output_limit: Option<u64>,
    ) -> Vec<Effect> {
        let mut effects = Vec::new();
        self.limits
            .insert(session_id.to_string(), (context_limit, output_limit));
        self.refresh_usage(session_id, true, &mut effects);
        effects
    }

    fn refresh_usage(&mut self, session_id: &str, force: bool, effects: &mut Vec<Effect>) -> Option<ContextUsage> {
        let Some(&(context_limit, output_limit)) = self.limits.get(session_id) else {
            return self.usage.get(session_id).cloned();
        };
        let before = self.usage.revision();
        let messages = self.windows.messages(session_id);
        let usage = if force {
            self.usage
                .update(session_id, messages, context_limit, output_limit)
                .or_else(|| self.usage.get(session_id).cloned())
        } else {
            self.usage
                .get_or_compute(session_id, messages, context_limit, output_limit)
        };
        if let Some(usage) = usage.as_ref().filter(|_| self.usage.revision() != before) {
            emit(
                effects,
                StoreEvent::ContextUsageUpdated {
                    session_id: session_id.to_string(),
                    usage: usage.clone(),
                },
            );
        }
        usage
    }

    // -- Permissions --------------------------------------------------------

    pub fn add_permission(&mut self, request: PermissionRequest) -> Vec<Effect> {
        let mut effects = Vec::new();
        let agent = self
            .selection
            .agent_for_session(&request.session_id)
            .to_string();

        match self.gate.add_permission(request, &agent) {
            GateDecision::AutoApprove(request) => {
                info!(
                    component = "store",
                    event = "store.permission_auto_approved",
                    session_id = %request.session_id,
                    permission_id = %request.id,
                    permission_type = %request.permission_type,
                    agent = %agent,
                    "Auto-approved permission"
                );
                emit(
                    &mut effects,
                    StoreEvent::PermissionAutoApproved {
                        session_id: request.session_id.clone(),
                        permission_id: request.id.clone(),
                    },
                );
                effects.push(Effect::RespondPermission {
                    session_id: request.session_id,
                    permission_id: request.id,
                    response: PermissionResponse::Once,
                    restore: None,
                });
            }
            GateDecision::Pending(request) => {
                emit(&mut effects, StoreEvent::PermissionPending { request });
                effects.extend(self.persist(PersistKey::PendingPermissions));
            }
            GateDecision::Duplicate => {}
        }
        effects
    }

    /// User answered a pending request. Answers for requests that are no
    /// longer pending are ignored.
    pub fn respond_to_permission(
        &mut self,
        session_id: &str,
        permission_id: &str,
        response: PermissionResponse,
        now: u64,
    ) -> Vec<Effect> {
        let mut effects = Vec::new();
        let request = match self.gate.take_pending(session_id, permission_id) {
            Ok(request) => request,
            Err(e) => {
                warn!(
                    component = "store",
                    event = "store.permission_conflict",
                    error = %e,
                    "Ignoring permission response"
                );
                return effects;
            }
        };

        emit(
            &mut effects,
            StoreEvent::PermissionResolved {
                session_id: session_id.to_string(),
                permission_id: permission_id.to_string(),
                response: Some(response),
            },
        );
        effects.extend(self.persist(PersistKey::PendingPermissions));
        effects.push(Effect::RespondPermission {
            session_id: session_id.to_string(),
            permission_id: permission_id.to_string(),
            response,
            restore: Some(request),
        });

        if response == PermissionResponse::Reject {
            effects.extend(self.abort_session(session_id, now));
            effects.push(Effect::AbortSession {
                session_id: session_id.to_string(),
            });
        }
        effects
    }

    /// The backend refused an answer; the request goes back in the queue.
    pub fn permission_response_failed(
        &mut self,
        restore: Option<PermissionRequest>,
        error: &StoreError,
    ) -> Vec<Effect> {
        let mut effects = Vec::new();
        warn!(
            component = "store",
            event = "store.permission_response_failed",
            error = %error,
            "Permission response was not delivered"
        );
        let Some(request) = restore else {
            return effects;
        };
        let session_id = request.session_id.clone();
        self.gate.restore_pending(request.clone());
        emit(&mut effects, StoreEvent::PermissionPending { request });
        emit(
            &mut effects,
            StoreEvent::Error {
                session_id: Some(session_id),
                message: error.to_string(),
            },
        );
        effects.extend(self.persist(PersistKey::PendingPermissions));
        effects
    }

    /// Answered from another client
    pub fn permission_replied(&mut self, session_id: &str, permission_id: &str) -> Vec<Effect> {
        let mut effects = Vec::new();
        if self.gate.take_pending(session_id, permission_id).is_ok() {
            emit(
                &mut effects,
                StoreEvent::PermissionResolved {
                    session_id: session_id.to_string(),
                    permission_id: permission_id.to_string(),
                    response: None,
                },
            );
            effects.extend(self.persist(PersistKey::PendingPermissions));
        }
        effects
    }

    pub fn toggle_session_agent_edit_mode(
        &mut self,
        session_id: &str,
        agent: Option<&str>,
    ) -> (EditPermissionMode, Vec<Effect>) {
        let agent = self.resolve_agent(session_id, agent);
        let before = self.gate.revision();
        let mode = self.gate.toggle_edit_mode(session_id, &agent);
        (mode, self.edit_mode_effects(session_id, agent, mode, before))
    }

    pub fn set_session_agent_edit_mode(
        &mut self,
        session_id: &str,
        agent: Option<&str>,
        mode: EditPermissionMode,
    ) -> (EditPermissionMode, Vec<Effect>) {
        let agent = self.resolve_agent(session_id, agent);
        let before = self.gate.revision();
        let mode = self.gate.set_edit_mode(session_id, &agent, mode);
        (mode, self.edit_mode_effects(session_id, agent, mode, before))
    }

    fn resolve_agent(&self, session_id: &str, agent: Option<&str>) -> String {
        agent
            .unwrap_or_else(|| self.selection.agent_for_session(session_id))
            .to_string()
    }

    fn edit_mode_effects(
        &self,
        session_id: &str,
        agent: String,
        mode: EditPermissionMode,
        before: u64,
    ) -> Vec<Effect> {
        let mut effects = Vec::new();
        if self.gate.revision() == before {
            return effects;
        }
        info!(
            component = "store",
            event = "store.edit_mode_changed",
            session_id = %session_id,
            agent = %agent,
            mode = ?mode,
            "Edit permission mode changed"
        );
        effects.extend(self.persist(PersistKey::SessionAgentEditModes));
        emit(
            &mut effects,
            StoreEvent::EditModeChanged {
                session_id: session_id.to_string(),
                agent,
                mode,
            },
        );
        effects
    }

    // -- Selections ---------------------------------------------------------

    pub fn set_session_model(&mut self, session_id: &str, model: ModelSelection) -> Vec<Effect> {
        if self.selection.set_session_model(session_id, model) {
            return self.persist(PersistKey::SessionModels).into_iter().collect();
        }
        Vec::new()
    }

    pub fn set_session_agent(&mut self, session_id: &str, agent: &str) -> Vec<Effect> {
        if self.selection.set_session_agent(session_id, agent) {
            return self.persist(PersistKey::SessionAgents).into_iter().collect();
        }
        Vec::new()
    }

    pub fn set_session_agent_model(
        &mut self,
        session_id: &str,
        agent: &str,
        model: ModelSelection,
    ) -> Vec<Effect> {
        if self.selection.set_session_agent_model(session_id, agent, model) {
            return self
                .persist(PersistKey::SessionAgentModels)
                .into_iter()
                .collect();
        }
        Vec::new()
    }

    // -- Prompts ------------------------------------------------------------

    /// Resolve a draft into a backend request using the session's
    /// selections for anything the draft leaves unset.
    pub fn prepare_send(&self, draft: PromptDraft) -> Result<SendRequest, StoreError> {
        let agent = draft
            .agent
            .unwrap_or_else(|| self.selection.agent_for_session(&draft.session_id).to_string());
        let model = draft
            .model
            .or_else(|| self.selection.model_for_session(&draft.session_id).cloned())
            .ok_or_else(|| StoreError::NoModelSelected(draft.session_id.clone()))?;

        Ok(SendRequest {
            session_id: draft.session_id,
            content: draft.content,
            provider_id: model.provider_id,
            model_id: model.model_id,
            agent: Some(agent),
            attachments: draft.attachments,
        })
    }

    /// The prompt stream of a session ended. An aborted stream completes
    /// its messages right away; a finished one cools down.
    pub fn stream_closed(&mut self, session_id: &str, aborted: bool, now: u64) -> Vec<Effect> {
        if aborted {
            self.abort_session(session_id, now)
        } else {
            self.session_status(session_id, false, now)
        }
    }

    // -- Backend events -----------------------------------------------------

    pub fn ingest(&mut self, event: StreamEvent, now: u64) -> Vec<Effect> {
        match event {
            StreamEvent::MessageUpdated(info) => self.message_updated(info, now),
            StreamEvent::PartUpdated { part, delta } => self.add_streaming_part(part, delta, now),
            StreamEvent::MessageCompleted { message_id, .. } => {
                self.complete_streaming_message(&message_id, now)
            }
            StreamEvent::SessionStatus { session_id, busy } => {
                self.session_status(&session_id, busy, now)
            }
            StreamEvent::SessionUpdated(session) => self.upsert_session(session),
            StreamEvent::SessionDeleted { session_id } => self.delete_session(&session_id),
            StreamEvent::PermissionAsked(request) => self.add_permission(request),
            StreamEvent::PermissionReplied {
                session_id,
                permission_id,
            } => self.permission_replied(&session_id, &permission_id),
            StreamEvent::Error {
                session_id,
                message,
            } => {
                warn!(
                    component = "store",
                    event = "store.backend_error",
                    session_id = ?session_id,
                    error = %message,
                    "Backend reported an error"
                );
                let mut effects = Vec::new();
                emit(&mut effects, StoreEvent::Error { session_id, message });
                effects
            }
        }
    }

    // -- Persistence --------------------------------------------------------

    fn persist(&self, key: PersistKey) -> Option<Effect> {
        let result = match key {
            PersistKey::SessionModels => {
                PersistCommand::put(key, &association_list(self.selection.session_models()))
            }
            PersistKey::SessionAgents => {
                PersistCommand::put(key, &association_list(self.selection.session_agents()))
            }
            PersistKey::SessionAgentModels => {
                PersistCommand::put(key, &association_list(self.selection.agent_models()))
            }
            PersistKey::SessionAgentEditModes => {
                PersistCommand::put(key, &association_list(self.gate.overrides()))
            }
            PersistKey::PendingPermissions => {
                PersistCommand::put(key, &association_list(self.gate.pending()))
            }
        };
        match result {
            Ok(command) => Some(Effect::Persist(command)),
            Err(e) => {
                error!(
                    component = "store",
                    event = "store.persist_encode_failed",
                    key = key.as_str(),
                    error = %e,
                    "Failed to encode persisted value"
                );
                None
            }
        }
    }

    // -- Snapshot -----------------------------------------------------------

    fn slice_revisions(&self) -> SliceRevisions {
        SliceRevisions {
            registry: self.registry.revision(),
            windows: self.windows.revision(),
            tracker: self.tracker.revision(),
            gate: self.gate.revision(),
            usage: self.usage.revision(),
            selection: self.selection.revision(),
        }
    }

    /// Build the next snapshot if any slice changed since the last one.
    pub fn publish(&mut self) -> Option<StoreSnapshot> {
        let revisions = self.slice_revisions();
        let previous = self.published_revisions;
        if previous == Some(revisions) {
            return None;
        }
        let changed = |pick: fn(&SliceRevisions) -> u64| {
            previous.map_or(true, |p| pick(&p) != pick(&revisions))
        };

        let mut next = self.published.clone();
        next.revision += 1;

        if changed(|r| r.registry) {
            next.current_session_id = self.registry.current().map(str::to_string);
            next.sessions = Arc::new(self.registry.sessions().clone());
        }

        if changed(|r| r.windows) {
            let mut messages = HashMap::new();
            let mut memory = HashMap::new();
            let mut anchors = HashMap::new();
            let mut message_revisions = HashMap::new();
            for session_id in self.windows.session_ids() {
                let revision = self.windows.session_revision(session_id).unwrap_or(0);
                let reused = self
                    .published
                    .messages
                    .get(session_id)
                    .filter(|_| self.message_revisions.get(session_id) == Some(&revision))
                    .cloned();
                let list =
                    reused.unwrap_or_else(|| Arc::new(self.windows.messages(session_id).to_vec()));
                messages.insert(session_id.clone(), list);
                message_revisions.insert(session_id.clone(), revision);
                if let Some(state) = self.windows.memory(session_id) {
                    memory.insert(session_id.clone(), state.clone());
                }
                if let Some(anchor) = self.windows.anchor(session_id) {
                    anchors.insert(session_id.clone(), anchor.clone());
                }
            }
            self.message_revisions = message_revisions;
            next.messages = Arc::new(messages);
            next.memory = Arc::new(memory);
            next.anchors = Arc::new(anchors);
        }

        if changed(|r| r.tracker) {
            let lifecycles: HashMap<_, _> = self
                .tracker
                .lifecycles()
                .map(|l| (l.message_id.clone(), l.clone()))
                .collect();
            let mut streaming = HashMap::new();
            for lifecycle in lifecycles.values() {
                if let Some(id) = self.tracker.streaming_message_id(&lifecycle.session_id) {
                    streaming.insert(lifecycle.session_id.clone(), id.to_string());
                }
            }
            next.lifecycles = Arc::new(lifecycles);
            next.streaming_message_ids = Arc::new(streaming);
            next.activity = Arc::new(self.tracker.phases().clone());
        }

        if changed(|r| r.gate) {
            next.pending_permissions = Arc::new(self.gate.pending().clone());
            next.edit_mode_overrides = Arc::new(self.gate.overrides().clone());
        }

        if changed(|r| r.usage) {
            next.context_usage = Arc::new(self.usage.entries().clone());
        }

        if changed(|r| r.selection) {
            next.session_models = Arc::new(self.selection.session_models().clone());
            next.session_agents = Arc::new(self.selection.session_agents().clone());
            next.session_agent_models = Arc::new(self.selection.agent_models().clone());
        }

        self.published = next.clone();
        self.published_revisions = Some(revisions);
        Some(next)
    }
}

/// Map as a list of pairs sorted by key, the persisted JSON shape
fn association_list<K, V>(map: &HashMap<K, V>) -> Vec<(&K, &V)>
where
    K: Ord,
{
    let mut list: Vec<(&K, &V)> = map.iter().collect();
    list.sort_by(|a, b| a.0.cmp(b.0));
    list
}
