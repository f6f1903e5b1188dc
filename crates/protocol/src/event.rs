//! Store → UI change notifications

use serde::{Deserialize, Serialize};

use crate::types::*;

/// Notifications broadcast by the store after it applied a change.
/// The published snapshot is always at least as new as the event.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum StoreEvent {
    // Snapshot
    SnapshotPublished {
        revision: u64,
    },

    // Sessions
    CurrentSessionChanged {
        session_id: Option<String>,
    },
    SessionUpdated {
        session: Session,
    },
    SessionDeleted {
        session_id: String,
    },

    // Message window
    MessagesLoaded {
        session_id: String,
        loaded_count: usize,
    },
    MessagesTrimmed {
        session_id: String,
        removed: usize,
    },
    SessionEvicted {
        session_id: String,
    },
    AnchorCleared {
        session_id: String,
    },
    LoadFailed {
        session_id: String,
        message: String,
    },

    // Streaming
    StreamPhaseChanged {
        session_id: String,
        message_id: String,
        phase: StreamPhase,
    },
    ActivityChanged {
        session_id: String,
        phase: ActivityPhase,
    },

    // Permissions
    PermissionPending {
        request: PermissionRequest,
    },
    PermissionAutoApproved {
        session_id: String,
        permission_id: String,
    },
    PermissionResolved {
        session_id: String,
        permission_id: String,
        response: Option<PermissionResponse>,
    },
    EditModeChanged {
        session_id: String,
        agent: String,
        mode: EditPermissionMode,
    },

    // Context usage
    ContextUsageUpdated {
        session_id: String,
        usage: ContextUsage,
    },

    Error {
        session_id: Option<String>,
        message: String,
    },
}
