//! Startup and shutdown wiring: data directory, logging, persisted
//! selections, the persistence writer and the store actor.

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context;
use chamber_connector_core::Backend;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::info;

use crate::config::StoreConfig;
use crate::logging::{init_logging, LoggingHandle};
use crate::paths::DataPaths;
use crate::permission::AgentLookup;
use crate::persistence::{
    create_persistence_channel, load_persisted_state, PersistCommand, PersistenceWriter,
};
use crate::store::Store;
use crate::store_actor::StoreHandle;

#[derive(Debug, Clone, Default)]
pub struct RuntimeOptions {
    /// Overrides `CHAMBER_DATA_DIR` and the home directory default
    pub data_dir: Option<PathBuf>,
    /// Defaults to `StoreConfig::from_env()`
    pub config: Option<StoreConfig>,
    /// Install the global file logger
    pub logging: bool,
}

pub struct StoreRuntime {
    handle: StoreHandle,
    persist_tx: mpsc::Sender<PersistCommand>,
    writer: JoinHandle<()>,
    paths: DataPaths,
    _logging: Option<LoggingHandle>,
}

/// Agent definitions are looked up through the backend's directory.
pub fn agent_lookup(backend: &Backend) -> AgentLookup {
    let agents = backend.agents.clone();
    Arc::new(move |name: &str| agents.agent(name))
}

impl StoreRuntime {
    pub async fn start(options: RuntimeOptions, backend: Backend) -> anyhow::Result<Self> {
        let paths = DataPaths::resolve(options.data_dir.as_deref())
            .context("could not determine a data directory")?;
        paths
            .ensure_dirs()
            .with_context(|| format!("failed to create {}", paths.root().display()))?;

        let logging = if options.logging {
            Some(init_logging(&paths)?)
        } else {
            None
        };

        let config = match options.config {
            Some(config) => config.validate()?,
            None => StoreConfig::from_env()?.validate()?,
        };

        let persisted = load_persisted_state(paths.db_path())
            .await
            .context("failed to read persisted selections")?;
        let (persist_tx, persist_rx) = create_persistence_channel();
        let writer = tokio::spawn(PersistenceWriter::new(persist_rx, paths.db_path()).run());

        let mut store = Store::new(config, agent_lookup(&backend));
        store.restore(persisted);
        let handle = StoreHandle::spawn(store, backend, persist_tx.clone());

        info!(
            component = "runtime",
            event = "runtime.started",
            data_dir = %paths.root().display(),
            "Store runtime started"
        );

        Ok(Self {
            handle,
            persist_tx,
            writer,
            paths,
            _logging: logging,
        })
    }

    pub fn handle(&self) -> StoreHandle {
        self.handle.clone()
    }

    pub fn paths(&self) -> &DataPaths {
        &self.paths
    }

    /// Wait until every queued selection write is on disk.
    pub async fn flush(&self) -> anyhow::Result<()> {
        let (ack, done) = oneshot::channel();
        self.persist_tx
            .send(PersistCommand::Flush { ack })
            .await
            .context("persistence writer stopped")?;
        done.await.context("persistence writer stopped")?;
        Ok(())
    }

    /// Stop the actor and wait for the writer to drain. Clones of the
    /// handle held elsewhere keep the actor alive until they are dropped.
    pub async fn shutdown(self) -> anyhow::Result<()> {
        let Self {
            handle,
            persist_tx,
            writer,
            _logging,
            ..
        } = self;
        drop(handle);
        drop(persist_tx);
        writer.await.context("persistence writer panicked")?;
        info!(
            component = "runtime",
            event = "runtime.stopped",
            "Store runtime stopped"
        );
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::FakeBackend;
    use chamber_protocol::{EditPermissionMode, ModelSelection};

    fn options(dir: &std::path::Path) -> RuntimeOptions {
        RuntimeOptions {
            data_dir: Some(dir.to_path_buf()),
            config: Some(StoreConfig::default()),
            logging: false,
        }
    }

    #[tokio::test]
    async fn selections_survive_a_restart() {
        let dir = tempfile::tempdir().unwrap();
        let fake = FakeBackend::new();

        let runtime = StoreRuntime::start(options(dir.path()), fake.backend())
            .await
            .unwrap();
        let handle = runtime.handle();
        handle.set_session_agent("a", "plan").await.unwrap();
        handle
            .set_session_model(
                "a",
                ModelSelection {
                    provider_id: "anthropic".into(),
                    model_id: "claude-sonnet".into(),
                },
            )
            .await
            .unwrap();
        handle
            .set_session_agent_edit_mode("a", None, EditPermissionMode::Allow)
            .await
            .unwrap();
        runtime.flush().await.unwrap();
        drop(handle);
        runtime.shutdown().await.unwrap();

        let runtime = StoreRuntime::start(options(dir.path()), fake.backend())
            .await
            .unwrap();
        let handle = runtime.handle();
        let snapshot = handle.snapshot();
        assert_eq!(snapshot.session_agents.get("a").map(String::as_str), Some("plan"));
        assert_eq!(snapshot.session_models["a"].model_id, "claude-sonnet");
        assert_eq!(
            handle.effective_edit_mode("a", None).await.unwrap(),
            EditPermissionMode::Allow
        );
        drop(handle);
        runtime.shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn invalid_config_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let options = RuntimeOptions {
            config: Some(StoreConfig {
                tick_ms: 0,
                ..StoreConfig::default()
            }),
            ..options(dir.path())
        };

        assert!(StoreRuntime::start(options, FakeBackend::new().backend())
            .await
            .is_err());
    }
}
