//! Read-only view published after every store command.
//!
//! Each slice is behind its own `Arc`, so a snapshot that only changed one
//! slice shares everything else with its predecessor.

use std::collections::HashMap;
use std::sync::Arc;

use chamber_protocol::{
    ActivityPhase, ContextUsage, EditPermissionMode, Message, ModelSelection, PermissionRequest,
    Session, SessionMemoryState, StreamLifecycle, ViewportAnchor,
};

#[derive(Debug, Clone, Default)]
pub struct StoreSnapshot {
    pub revision: u64,
    pub current_session_id: Option<String>,
    pub sessions: Arc<HashMap<String, Session>>,
    pub messages: Arc<HashMap<String, Arc<Vec<Message>>>>,
    pub memory: Arc<HashMap<String, SessionMemoryState>>,
    pub anchors: Arc<HashMap<String, ViewportAnchor>>,
    /// Keyed by message id
    pub lifecycles: Arc<HashMap<String, StreamLifecycle>>,
    /// session -> most recent live message
    pub streaming_message_ids: Arc<HashMap<String, String>>,
    /// Non-idle sessions only
    pub activity: Arc<HashMap<String, ActivityPhase>>,
    pub pending_permissions: Arc<HashMap<String, Vec<PermissionRequest>>>,
    pub edit_mode_overrides: Arc<HashMap<(String, String), EditPermissionMode>>,
    pub context_usage: Arc<HashMap<String, ContextUsage>>,
    pub session_models: Arc<HashMap<String, ModelSelection>>,
    pub session_agents: Arc<HashMap<String, String>>,
    pub session_agent_models: Arc<HashMap<(String, String), ModelSelection>>,
}

impl StoreSnapshot {
    pub fn current_session(&self) -> Option<&Session> {
        self.current_session_id
            .as_deref()
            .and_then(|id| self.sessions.get(id))
    }

    pub fn messages(&self, session_id: &str) -> &[Message] {
        self.messages
            .get(session_id)
            .map(|m| m.as_slice())
            .unwrap_or(&[])
    }

    pub fn memory(&self, session_id: &str) -> Option<&SessionMemoryState> {
        self.memory.get(session_id)
    }

    pub fn anchor(&self, session_id: &str) -> Option<&ViewportAnchor> {
        self.anchors.get(session_id)
    }

    pub fn streaming_message_id(&self, session_id: &str) -> Option<&str> {
        self.streaming_message_ids.get(session_id).map(String::as_str)
    }

    pub fn activity(&self, session_id: &str) -> ActivityPhase {
        self.activity.get(session_id).copied().unwrap_or_default()
    }

    pub fn pending_permissions(&self, session_id: &str) -> &[PermissionRequest] {
        self.pending_permissions
            .get(session_id)
            .map(Vec::as_slice)
            .unwrap_or(&[])
    }

    pub fn context_usage(&self, session_id: &str) -> Option<&ContextUsage> {
        self.context_usage.get(session_id)
    }

    pub fn edit_mode_override(&self, session_id: &str, agent: &str) -> Option<EditPermissionMode> {
        self.edit_mode_overrides
            .get(&(session_id.to_string(), agent.to_string()))
            .copied()
    }
}
