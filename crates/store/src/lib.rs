//! Chamber Store
//!
//! Working set of an agent chat client: which sessions have messages in
//! memory, which messages are still streaming, how full each context window
//! is, and which tool permissions wait for an answer. One actor owns the
//! state; readers get lock-free snapshots.

pub mod config;
pub mod context_usage;
pub mod error;
pub mod logging;
pub mod paths;
pub mod permission;
pub mod persistence;
pub mod registry;
pub mod runtime;
pub mod selection;
pub mod snapshot;
pub mod store;
pub mod store_actor;
pub mod store_command;
pub mod streaming;
pub mod window;

#[cfg(test)]
mod test_support;

pub use config::StoreConfig;
pub use error::StoreError;
pub use runtime::{RuntimeOptions, StoreRuntime};
pub use snapshot::StoreSnapshot;
pub use store::{PromptDraft, Store};
pub use store_actor::StoreHandle;
