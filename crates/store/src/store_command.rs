//! Commands sent to the store actor from handles and from the actor's own
//! background tasks.

use chamber_connector_core::{ConnectorError, StreamEvent};
use chamber_protocol::{
    ContextUsage, EditPermissionMode, LoadDirection, MessagePage, ModelSelection, Part,
    PermissionRequest, PermissionResponse, Session,
};
use tokio::sync::oneshot;

use crate::error::StoreError;
use crate::store::PromptDraft;

pub type Reply<T> = oneshot::Sender<T>;
pub type ResultReply = Reply<Result<(), StoreError>>;

pub enum StoreCommand {
    // -- Queries --
    EffectiveEditMode {
        session_id: String,
        agent: Option<String>,
        reply: Reply<EditPermissionMode>,
    },
    GetContextUsage {
        session_id: String,
        context_limit: u64,
        output_limit: Option<u64>,
        reply: Reply<Option<ContextUsage>>,
    },

    // -- Sessions --
    SetCurrentSession {
        session_id: Option<String>,
        reply: Reply<()>,
    },
    UpsertSession {
        session: Session,
    },
    DeleteSession {
        session_id: String,
    },

    // -- Message window --
    LoadMessages {
        session_id: String,
        reply: ResultReply,
    },
    LoadMoreMessages {
        session_id: String,
        direction: LoadDirection,
        reply: ResultReply,
    },
    UpdateViewportAnchor {
        session_id: String,
        index: usize,
    },
    TrimToViewportWindow {
        session_id: String,
        target: usize,
    },
    EvictLeastRecentlyUsed {
        reply: Reply<Vec<String>>,
    },

    // -- Streaming --
    AddStreamingPart {
        part: Part,
        delta: Option<String>,
    },
    CompleteStreamingMessage {
        message_id: String,
    },
    MarkMessageStreamSettled {
        message_id: String,
        reply: Reply<bool>,
    },
    Ingest {
        event: StreamEvent,
    },
    ResetActivity,

    // -- Prompts --
    SendMessage {
        draft: PromptDraft,
        reply: ResultReply,
    },
    AbortSession {
        session_id: String,
        reply: Reply<()>,
    },

    // -- Permissions --
    AddPermission {
        request: PermissionRequest,
    },
    RespondToPermission {
        session_id: String,
        permission_id: String,
        response: PermissionResponse,
        reply: ResultReply,
    },
    ToggleSessionAgentEditMode {
        session_id: String,
        agent: Option<String>,
        reply: Reply<EditPermissionMode>,
    },
    SetSessionAgentEditMode {
        session_id: String,
        agent: Option<String>,
        mode: EditPermissionMode,
        reply: Reply<EditPermissionMode>,
    },

    // -- Context usage --
    UpdateSessionContextUsage {
        session_id: String,
        context_limit: u64,
        output_limit: Option<u64>,
    },

    // -- Selections --
    SetSessionModel {
        session_id: String,
        model: ModelSelection,
    },
    SetSessionAgent {
        session_id: String,
        agent: String,
    },
    SetSessionAgentModel {
        session_id: String,
        agent: String,
        model: ModelSelection,
    },

    // -- Background task completions --
    MessagesFetched {
        session_id: String,
        result: Result<MessagePage, ConnectorError>,
    },
    PageFetched {
        session_id: String,
        direction: LoadDirection,
        result: Result<MessagePage, ConnectorError>,
        reply: ResultReply,
    },
    StreamClosed {
        session_id: String,
        send_id: u64,
        aborted: bool,
    },
    PermissionResponded {
        permission_id: String,
        restore: Option<PermissionRequest>,
        result: Result<(), ConnectorError>,
        reply: Option<ResultReply>,
    },
}
