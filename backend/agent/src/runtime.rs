//! Process-level wiring: config, logging, storage, coordinator, sweeper.

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use agora_config::{RuntimeConfig, load_and_prepare};
use agora_core::{HealthMonitor, LongTermMemory, ModelBackend, SessionStore};
use agora_logging::init_from_config;
use agora_store::SqliteStore;
use anyhow::{Context, Result};
use tokio::task::JoinHandle;
use tracing::{info, instrument};

use crate::coordinator::{CoordinatorBuilder, TurnCoordinator};

/// Optional collaborators supplied by the embedding process.
#[derive(Default)]
pub struct RuntimeParts {
    pub memory: Option<Arc<dyn LongTermMemory>>,
    pub health: Option<Arc<dyn HealthMonitor>>,
}

pub struct Runtime {
    coordinator: Arc<TurnCoordinator>,
    sweeper: JoinHandle<()>,
}

impl Runtime {
    /// Load `path`, set up logging and SQLite, and start the engine.
    #[instrument(skip(backend, parts))]
    pub async fn from_config_file(path: &Path, backend: Arc<dyn ModelBackend>, parts: RuntimeParts) -> Result<Self> {
        let config = load_and_prepare(path)
            .await
            .with_context(|| format!("Failed to load config from {}", path.display()))?;
        init_from_config(&config.logging);

        let store: Arc<dyn SessionStore> = match &config.storage.db_path {
            Some(db) => Arc::new(
                SqliteStore::open(db).with_context(|| format!("Failed to open store at {}", db.display()))?,
            ),
            None => Arc::new(SqliteStore::in_memory()?),
        };
        Self::start(config, store, backend, parts).await
    }

    pub async fn start(
        config: RuntimeConfig,
        store: Arc<dyn SessionStore>,
        backend: Arc<dyn ModelBackend>,
        parts: RuntimeParts,
    ) -> Result<Self> {
        let sweep_every = Duration::from_secs(config.approval.sweep_interval_secs.max(1));
        let max_age = Duration::from_secs(config.approval.max_age_secs);
        let agents = config.agents.len();

        let mut builder = CoordinatorBuilder::new(config, store, backend).standard_tools();
        if let Some(memory) = parts.memory {
            builder = builder.memory(memory);
        }
        if let Some(health) = parts.health {
            builder = builder.health(health);
        }
        let coordinator = builder.build().await?;
        let sweeper = coordinator
            .approval_gate()
            .clone()
            .spawn_sweeper(sweep_every, max_age, coordinator.background_token());
        info!(agents, "[Runtime] Started");
        Ok(Self { coordinator, sweeper })
    }

    pub fn coordinator(&self) -> &Arc<TurnCoordinator> {
        &self.coordinator
    }

    /// Refuse new turns, cancel in-flight ones, and stop the sweeper.
    pub async fn shutdown(self) {
        self.coordinator.shutdown();
        let aborted = self.coordinator.abort_all();
        let _ = self.sweeper.await;
        info!(aborted, "[Runtime] Stopped");
    }
}
