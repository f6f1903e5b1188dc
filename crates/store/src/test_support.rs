//! Scripted in-memory backend for store tests.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use chamber_connector_core::{
    AgentDirectory, Backend, ConnectorError, EventStream, MessageSource, PermissionResponder,
    PromptSender, StreamEvent,
};
use chamber_protocol::{
    AgentDefinition, LoadDirection, Message, MessageInfo, MessagePage, MessageRole, Part, PartKind,
    PermissionResponse, SendRequest,
};
use futures::stream::{self, StreamExt};

#[derive(Default)]
pub struct FakeBackend {
    history: Mutex<HashMap<String, Vec<Message>>>,
    agents: Mutex<HashMap<String, AgentDefinition>>,
    script: Mutex<Vec<StreamEvent>>,
    sent: Mutex<Vec<SendRequest>>,
    responses: Mutex<Vec<(String, PermissionResponse)>>,
    aborts: Mutex<Vec<String>>,
    fetch_calls: AtomicUsize,
    fetch_delay_ms: AtomicUsize,
    fail_fetch: AtomicBool,
    fail_responses: AtomicBool,
    hold_streams: AtomicBool,
}

impl FakeBackend {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn backend(self: &Arc<Self>) -> Backend {
        Backend::from_single(self.clone())
    }

    /// Give `session_id` a history of `count` alternating user/assistant
    /// messages with ids `{session_id}-{n}`.
    pub fn with_history(&self, session_id: &str, count: usize) {
        let messages = (0..count).map(|n| history_message(session_id, n)).collect();
        lock(&self.history).insert(session_id.to_string(), messages);
    }

    pub fn with_messages(&self, session_id: &str, messages: Vec<Message>) {
        lock(&self.history).insert(session_id.to_string(), messages);
    }

    pub fn with_agent(&self, agent: AgentDefinition) {
        lock(&self.agents).insert(agent.name.clone(), agent);
    }

    /// Events the next prompt stream yields
    pub fn script(&self, events: Vec<StreamEvent>) {
        *lock(&self.script) = events;
    }

    pub fn set_fetch_delay(&self, delay: Duration) {
        self.fetch_delay_ms
            .store(delay.as_millis() as usize, Ordering::SeqCst);
    }

    pub fn fail_fetches(&self, fail: bool) {
        self.fail_fetch.store(fail, Ordering::SeqCst);
    }

    pub fn fail_responses(&self, fail: bool) {
        self.fail_responses.store(fail, Ordering::SeqCst);
    }

    /// Keep prompt streams open after the scripted events
    pub fn hold_streams(&self, hold: bool) {
        self.hold_streams.store(hold, Ordering::SeqCst);
    }

    pub fn fetch_calls(&self) -> usize {
        self.fetch_calls.load(Ordering::SeqCst)
    }

    pub fn sent(&self) -> Vec<SendRequest> {
        lock(&self.sent).clone()
    }

    pub fn responses(&self) -> Vec<(String, PermissionResponse)> {
        lock(&self.responses).clone()
    }

    pub fn aborts(&self) -> Vec<String> {
        lock(&self.aborts).clone()
    }

    async fn before_fetch(&self) -> Result<(), ConnectorError> {
        self.fetch_calls.fetch_add(1, Ordering::SeqCst);
        let delay = self.fetch_delay_ms.load(Ordering::SeqCst);
        if delay > 0 {
            tokio::time::sleep(Duration::from_millis(delay as u64)).await;
        }
        if self.fail_fetch.load(Ordering::SeqCst) {
            return Err(ConnectorError::Unavailable("scripted failure".into()));
        }
        Ok(())
    }
}

fn lock<T>(mutex: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    mutex.lock().unwrap()
}

pub fn history_message(session_id: &str, n: usize) -> Message {
    let role = if n % 2 == 0 {
        MessageRole::User
    } else {
        MessageRole::Assistant
    };
    Message {
        info: MessageInfo::placeholder(&format!("{session_id}-{n}"), session_id, role, n as u64),
        parts: Vec::new(),
    }
}

pub fn text_part(session_id: &str, message_id: &str, text: &str) -> Part {
    Part {
        id: format!("{message_id}-text"),
        session_id: session_id.to_string(),
        message_id: message_id.to_string(),
        kind: PartKind::Text {
            text: text.to_string(),
        },
    }
}

#[async_trait]
impl MessageSource for FakeBackend {
    async fn fetch_latest(&self, session_id: &str, limit: usize) -> Result<MessagePage, ConnectorError> {
        self.before_fetch().await?;
        let history = lock(&self.history);
        let all = history.get(session_id).cloned().unwrap_or_default();
        let start = all.len().saturating_sub(limit);
        Ok(MessagePage {
            has_more_above: start > 0,
            has_more_below: false,
            messages: all[start..].to_vec(),
        })
    }

    async fn fetch_page(
        &self,
        session_id: &str,
        direction: LoadDirection,
        cursor: &str,
        limit: usize,
    ) -> Result<MessagePage, ConnectorError> {
        self.before_fetch().await?;
        let history = lock(&self.history);
        let all = history.get(session_id).cloned().unwrap_or_default();
        let at = all
            .iter()
            .position(|m| m.id() == cursor)
            .ok_or_else(|| ConnectorError::BackendError(format!("unknown cursor {cursor}")))?;
        Ok(match direction {
            LoadDirection::Up => {
                let start = at.saturating_sub(limit);
                MessagePage {
                    has_more_above: start > 0,
                    has_more_below: false,
                    messages: all[start..at].to_vec(),
                }
            }
            LoadDirection::Down => {
                let end = (at + 1 + limit).min(all.len());
                MessagePage {
                    has_more_above: false,
                    has_more_below: end < all.len(),
                    messages: all[at + 1..end].to_vec(),
                }
            }
        })
    }
}

#[async_trait]
impl PromptSender for FakeBackend {
    async fn send(&self, request: SendRequest) -> Result<EventStream, ConnectorError> {
        lock(&self.sent).push(request);
        let events: Vec<_> = std::mem::take(&mut *lock(&self.script))
            .into_iter()
            .map(Ok)
            .collect();
        let scripted = stream::iter(events);
        if self.hold_streams.load(Ordering::SeqCst) {
            Ok(scripted.chain(stream::pending()).boxed())
        } else {
            Ok(scripted.boxed())
        }
    }

    async fn abort(&self, session_id: &str) -> Result<(), ConnectorError> {
        lock(&self.aborts).push(session_id.to_string());
        Ok(())
    }
}

#[async_trait]
impl PermissionResponder for FakeBackend {
    async fn respond(
        &self,
        _session_id: &str,
        permission_id: &str,
        response: PermissionResponse,
    ) -> Result<(), ConnectorError> {
        if self.fail_responses.load(Ordering::SeqCst) {
            return Err(ConnectorError::Timeout(5_000));
        }
        lock(&self.responses).push((permission_id.to_string(), response));
        Ok(())
    }
}

impl AgentDirectory for FakeBackend {
    fn agent(&self, name: &str) -> Option<AgentDefinition> {
        lock(&self.agents).get(name).cloned()
    }
}
