//! Selection persistence: batched SQLite writes of a few JSON values
//!
//! Only small selections survive a restart. Each one is a JSON association
//! list stored under a fixed key in `persisted_state`. Writes are coalesced
//! by key and flushed with `spawn_blocking`.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use chamber_protocol::{EditPermissionMode, ModelSelection, PermissionRequest};
use rusqlite::{params, Connection};
use serde::de::DeserializeOwned;
use serde_json::Value;
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, error, info, warn};

/// Rows in `persisted_state`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PersistKey {
    SessionModels,
    SessionAgents,
    SessionAgentModels,
    SessionAgentEditModes,
    PendingPermissions,
}

impl PersistKey {
    pub const ALL: [PersistKey; 5] = [
        PersistKey::SessionModels,
        PersistKey::SessionAgents,
        PersistKey::SessionAgentModels,
        PersistKey::SessionAgentEditModes,
        PersistKey::PendingPermissions,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            PersistKey::SessionModels => "session_models",
            PersistKey::SessionAgents => "session_agents",
            PersistKey::SessionAgentModels => "session_agent_models",
            PersistKey::SessionAgentEditModes => "session_agent_edit_modes",
            PersistKey::PendingPermissions => "pending_permissions",
        }
    }
}

/// Commands that can be persisted
#[derive(Debug)]
pub enum PersistCommand {
    /// Replace the value stored under `key`
    Put { key: PersistKey, value: Value },
    /// Write everything queued so far, then acknowledge
    Flush { ack: oneshot::Sender<()> },
}

impl PersistCommand {
    pub fn put(key: PersistKey, value: &impl serde::Serialize) -> Result<Self, serde_json::Error> {
        Ok(PersistCommand::Put {
            key,
            value: serde_json::to_value(value)?,
        })
    }
}

/// Everything restored at startup
#[derive(Debug, Clone, Default, PartialEq)]
pub struct PersistedState {
    pub session_models: Vec<(String, ModelSelection)>,
    pub session_agents: Vec<(String, String)>,
    pub session_agent_models: Vec<((String, String), ModelSelection)>,
    pub session_agent_edit_modes: Vec<((String, String), EditPermissionMode)>,
    pub pending_permissions: Vec<(String, Vec<PermissionRequest>)>,
}

/// Persistence writer that batches SQLite writes
pub struct PersistenceWriter {
    rx: mpsc::Receiver<PersistCommand>,
    db_path: PathBuf,
    batch: HashMap<PersistKey, Value>,
    batch_size: usize,
    flush_interval: Duration,
}

impl PersistenceWriter {
    pub fn new(rx: mpsc::Receiver<PersistCommand>, db_path: PathBuf) -> Self {
        Self {
            rx,
            db_path,
            batch: HashMap::new(),
            batch_size: PersistKey::ALL.len(),
            flush_interval: Duration::from_millis(100),
        }
    }

    /// Run the persistence writer (call from tokio::spawn). Returns once
    /// every sender is gone and the last batch is written.
    pub async fn run(mut self) {
        info!(
            component = "persistence",
            event = "persistence.writer_started",
            db_path = %self.db_path.display(),
            "Persistence writer started"
        );

        let mut interval = tokio::time::interval(self.flush_interval);

        loop {
            tokio::select! {
                cmd = self.rx.recv() => match cmd {
                    Some(PersistCommand::Put { key, value }) => {
                        self.batch.insert(key, value);
                        if self.batch.len() >= self.batch_size {
                            self.flush().await;
                        }
                    }
                    Some(PersistCommand::Flush { ack }) => {
                        self.flush().await;
                        let _ = ack.send(());
                    }
                    None => {
                        self.flush().await;
                        break;
                    }
                },

                _ = interval.tick() => {
                    if !self.batch.is_empty() {
                        self.flush().await;
                    }
                }
            }
        }

        debug!(
            component = "persistence",
            event = "persistence.writer_stopped",
            "Persistence writer stopped"
        );
    }

    async fn flush(&mut self) {
        if self.batch.is_empty() {
            return;
        }

        let batch = std::mem::take(&mut self.batch);
        let db_path = self.db_path.clone();

        let result = tokio::task::spawn_blocking(move || flush_batch(&db_path, batch)).await;

        match result {
            Ok(Ok(count)) => {
                debug!(
                    component = "persistence",
                    event = "persistence.flushed",
                    count,
                    "Persisted selections"
                );
            }
            Ok(Err(e)) => {
                error!(
                    component = "persistence",
                    event = "persistence.flush_failed",
                    error = %e,
                    "Persistence flush failed"
                );
            }
            Err(e) => {
                error!(
                    component = "persistence",
                    event = "persistence.flush_panicked",
                    error = %e,
                    "spawn_blocking panicked"
                );
            }
        }
    }
}

fn open(db_path: &Path) -> Result<Connection, rusqlite::Error> {
    let conn = Connection::open(db_path)?;
    conn.execute_batch(
        "PRAGMA journal_mode = WAL;
         PRAGMA busy_timeout = 5000;
         PRAGMA synchronous = NORMAL;
         CREATE TABLE IF NOT EXISTS persisted_state (
             key TEXT PRIMARY KEY,
             value TEXT NOT NULL,
             updated_at INTEGER NOT NULL
         );",
    )?;
    Ok(conn)
}

/// Write one coalesced batch in a single transaction (blocking)
fn flush_batch(db_path: &Path, batch: HashMap<PersistKey, Value>) -> Result<usize, rusqlite::Error> {
    let conn = open(db_path)?;
    let count = batch.len();
    let now = now_millis();

    let tx = conn.unchecked_transaction()?;
    for (key, value) in batch {
        tx.execute(
            "INSERT INTO persisted_state (key, value, updated_at) VALUES (?1, ?2, ?3)
             ON CONFLICT(key) DO UPDATE SET value = excluded.value, updated_at = excluded.updated_at",
            params![key.as_str(), value.to_string(), now],
        )?;
    }
    tx.commit()?;

    Ok(count)
}

fn now_millis() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as i64)
        .unwrap_or(0)
}

/// Read persisted selections (blocking). A missing database yields the
/// empty state; a row that no longer decodes is skipped with a warning.
pub fn read_persisted_state(db_path: &Path) -> Result<PersistedState, rusqlite::Error> {
    if !db_path.exists() {
        return Ok(PersistedState::default());
    }

    let conn = open(db_path)?;
    let mut stmt = conn.prepare("SELECT key, value FROM persisted_state")?;
    let rows: HashMap<String, String> = stmt
        .query_map([], |row| Ok((row.get(0)?, row.get(1)?)))?
        .collect::<Result<_, _>>()?;

    Ok(PersistedState {
        session_models: decode(&rows, PersistKey::SessionModels),
        session_agents: decode(&rows, PersistKey::SessionAgents),
        session_agent_models: decode(&rows, PersistKey::SessionAgentModels),
        session_agent_edit_modes: decode(&rows, PersistKey::SessionAgentEditModes),
        pending_permissions: decode(&rows, PersistKey::PendingPermissions),
    })
}

fn decode<T: DeserializeOwned + Default>(rows: &HashMap<String, String>, key: PersistKey) -> T {
    let Some(raw) = rows.get(key.as_str()) else {
        return T::default();
    };
    match serde_json::from_str(raw) {
        Ok(value) => value,
        Err(e) => {
            warn!(
                component = "persistence",
                event = "persistence.decode_failed",
                key = key.as_str(),
                error = %e,
                "Ignoring unreadable persisted value"
            );
            T::default()
        }
    }
}

/// Load persisted selections off the async runtime
pub async fn load_persisted_state(db_path: PathBuf) -> Result<PersistedState, anyhow::Error> {
    let state = tokio::task::spawn_blocking(move || read_persisted_state(&db_path)).await??;
    Ok(state)
}

/// Create a sender for the persistence writer
pub fn create_persistence_channel() -> (mpsc::Sender<PersistCommand>, mpsc::Receiver<PersistCommand>)
{
    mpsc::channel(1000)
}
