//! Wires configuration into a running engine.

use std::sync::Arc;

use anyhow::Result;
use tokio::task::JoinHandle;
use tracing::info;

use crate::config::StudioConfig;
use crate::diagnostics::RuntimeLog;
use crate::generation::{ClaudeCli, Generator, Retrying};
use crate::preview::ProcessPool;
use crate::session::{FileStore, SessionStore};
use crate::workspace::WorkspaceManager;

use super::orchestrator::{Engine, EngineParts};

/// An engine plus the idle-preview sweeper that runs beside it.
pub struct Runtime {
    engine: Arc<Engine>,
    sweeper: JoinHandle<()>,
}

impl Runtime {
    /// Build the production stack: file-backed sessions and the Claude CLI
    /// with rate-limit retries.
    pub fn start(config: &StudioConfig) -> Result<Self> {
        let store = Arc::new(FileStore::new(config.sessions_dir())?);
        let generation = &config.toml.generation;
        let generator = Arc::new(Retrying::new(
            ClaudeCli::new(config.claude_cmd()),
            generation.max_retries,
            config.retry_backoff(),
        ));
        Ok(Self::with_parts(config, store, generator))
    }

    /// Build around a caller-supplied store and generator.
    pub fn with_parts(
        config: &StudioConfig,
        store: Arc<dyn SessionStore>,
        generator: Arc<dyn Generator>,
    ) -> Self {
        let workspaces = WorkspaceManager::new(
            config.workspaces_dir(),
            config.toml.workspace.max_concurrent_commands,
            config.command_timeout(),
        );
        let profiles = config.toml.preview.profiles();
        let pool = ProcessPool::new(
            config.toml.preview.pool_config(),
            profiles.clone(),
            workspaces.clone(),
        );
        let sweeper = pool.spawn_sweeper();
        let runtime_log = Arc::new(RuntimeLog::new(config.toml.diagnostics.runtime_capacity));

        info!(
            workspaces = %config.workspaces_dir().display(),
            max_previews = pool.config().max_processes,
            base_port = pool.config().base_port,
            "engine started"
        );

        let engine = Arc::new(Engine::new(EngineParts {
            store,
            generator,
            workspaces,
            pool,
            profiles,
            runtime_log,
            settle: config.settle(),
        }));
        Self { engine, sweeper }
    }

    pub fn engine(&self) -> &Arc<Engine> {
        &self.engine
    }

    /// Stop the sweeper, abort background work, and stop every preview.
    pub async fn shutdown(self) {
        self.sweeper.abort();
        self.engine.shutdown().await;
        info!("engine stopped");
    }
}
