//! Chamber connector core
//!
//! The store never talks to the agent backend directly. It consumes the
//! traits below, which a transport crate implements on top of whatever wire
//! protocol the backend speaks, and it receives backend activity as
//! [`StreamEvent`]s.

use std::sync::Arc;

use async_trait::async_trait;
use chamber_protocol::{
    AgentDefinition, LoadDirection, MessageInfo, MessagePage, Part, PermissionRequest,
    PermissionResponse, SendRequest, Session,
};
use futures::stream::BoxStream;
use thiserror::Error;

/// Errors that can occur in connectors
#[derive(Debug, Error)]
pub enum ConnectorError {
    #[error("Backend unavailable: {0}")]
    Unavailable(String),

    #[error("Request timed out after {0} ms")]
    Timeout(u64),

    #[error("Session not found: {0}")]
    SessionNotFound(String),

    #[error("JSON serialization error: {0}")]
    JsonError(#[from] serde_json::Error),

    #[error("Channel closed")]
    ChannelClosed,

    #[error("Backend error: {0}")]
    BackendError(String),
}

/// Incremental activity reported by the backend, either on the stream of a
/// prompt this client sent or on the global event feed.
#[derive(Debug, Clone)]
pub enum StreamEvent {
    /// Message metadata created or updated (tokens, finish reason, ...)
    MessageUpdated(MessageInfo),

    /// A part was created or replaced. `delta` carries appended text for
    /// text-like parts when the backend streams increments.
    PartUpdated { part: Part, delta: Option<String> },

    /// The backend finished producing a message
    MessageCompleted {
        session_id: String,
        message_id: String,
    },

    /// Backend session status changed
    SessionStatus { session_id: String, busy: bool },

    /// Session metadata created or changed
    SessionUpdated(Session),

    /// Session deleted on the backend
    SessionDeleted { session_id: String },

    /// Tool permission requested
    PermissionAsked(PermissionRequest),

    /// A permission was answered elsewhere
    PermissionReplied {
        session_id: String,
        permission_id: String,
    },

    /// Error reported for a session
    Error {
        session_id: Option<String>,
        message: String,
    },
}

/// Stream of events produced by one prompt
pub type EventStream = BoxStream<'static, Result<StreamEvent, ConnectorError>>;

/// Message history access
#[async_trait]
pub trait MessageSource: Send + Sync {
    /// Most recent `limit` messages of a session, oldest first
    async fn fetch_latest(&self, session_id: &str, limit: usize)
        -> Result<MessagePage, ConnectorError>;

    /// Up to `limit` messages older (`Up`) or newer (`Down`) than `cursor`
    async fn fetch_page(
        &self,
        session_id: &str,
        direction: LoadDirection,
        cursor: &str,
        limit: usize,
    ) -> Result<MessagePage, ConnectorError>;
}

/// Prompt submission
#[async_trait]
pub trait PromptSender: Send + Sync {
    /// Start a prompt and return the stream of its incremental events
    async fn send(&self, request: SendRequest) -> Result<EventStream, ConnectorError>;

    /// Ask the backend to stop whatever the session is doing
    async fn abort(&self, session_id: &str) -> Result<(), ConnectorError>;
}

/// Permission answers
#[async_trait]
pub trait PermissionResponder: Send + Sync {
    async fn respond(
        &self,
        session_id: &str,
        permission_id: &str,
        response: PermissionResponse,
    ) -> Result<(), ConnectorError>;
}

/// Agent definitions, cached by the transport
pub trait AgentDirectory: Send + Sync {
    fn agent(&self, name: &str) -> Option<AgentDefinition>;
}

/// The backend collaborators the store is constructed with
#[derive(Clone)]
pub struct Backend {
    pub messages: Arc<dyn MessageSource>,
    pub prompts: Arc<dyn PromptSender>,
    pub permissions: Arc<dyn PermissionResponder>,
    pub agents: Arc<dyn AgentDirectory>,
}

impl Backend {
    /// Build a backend from one value implementing every trait
    pub fn from_single<T>(backend: Arc<T>) -> Self
    where
        T: MessageSource + PromptSender + PermissionResponder + AgentDirectory + 'static,
    {
        Self {
            messages: backend.clone(),
            prompts: backend.clone(),
            permissions: backend.clone(),
            agents: backend,
        }
    }
}
