//! Chamber Protocol
//!
//! Shared types for the session store, its backend connectors and the UI
//! layer that reads the published snapshot. Everything here is plain data
//! and serializes as JSON.

use uuid::Uuid;

pub mod event;
pub mod types;

pub use event::StoreEvent;
pub use types::*;

/// Generate a new unique ID
pub fn new_id() -> String {
    Uuid::new_v4().to_string()
}
