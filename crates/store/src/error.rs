//! Store error taxonomy.
//!
//! Only `TransientFetch`, `PermissionResponse`, `Send`, `NoModelSelected`,
//! `Aborted` and `StoreClosed` ever reach a caller. `StaleAnchor`,
//! `PermissionConflict` and `EvictionSkipped` are produced inside slices and
//! recovered by the store.

use chamber_connector_core::ConnectorError;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum StoreError {
    /// Message or page fetch failed; the session's state is untouched
    #[error("failed to fetch messages for session {session_id}: {source}")]
    TransientFetch {
        session_id: String,
        #[source]
        source: ConnectorError,
    },

    /// The anchor points at a message that is no longer loaded
    #[error("anchor {message_id} is not loaded in session {session_id}")]
    StaleAnchor {
        session_id: String,
        message_id: String,
    },

    /// A response arrived for a permission that is no longer pending
    #[error("permission {permission_id} is not pending in session {session_id}")]
    PermissionConflict {
        session_id: String,
        permission_id: String,
    },

    /// Eviction refused for the current or a non-idle session
    #[error("session {session_id} cannot be evicted: {reason}")]
    EvictionSkipped {
        session_id: String,
        reason: &'static str,
    },

    /// The backend refused a permission response
    #[error("failed to submit permission response for {permission_id}: {source}")]
    PermissionResponse {
        permission_id: String,
        #[source]
        source: ConnectorError,
    },

    /// A prompt could not be started
    #[error("failed to send prompt to session {session_id}: {source}")]
    Send {
        session_id: String,
        #[source]
        source: ConnectorError,
    },

    /// Neither the request nor the session selection names a model
    #[error("no model selected for session {0}")]
    NoModelSelected(String),

    #[error("operation on session {0} was aborted")]
    Aborted(String),

    #[error("store actor is no longer running")]
    StoreClosed,

    #[error("persistence error: {0}")]
    Persistence(#[from] rusqlite::Error),
}

impl StoreError {
    /// Whether the UI can simply retry the operation
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            StoreError::TransientFetch { .. } | StoreError::PermissionResponse { .. }
        )
    }
}

pub type Result<T> = std::result::Result<T, StoreError>;
