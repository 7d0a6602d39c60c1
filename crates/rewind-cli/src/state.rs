//! Application state wiring the engine to the SQLite repositories.

use anyhow::Context;
use rewind_core::snapshot::time_travel::TimeTravelService;
use rewind_core::workflow::engine::ExecutionEngine;
use rewind_infra::config::{database_url, load_config, resolve_data_dir};
use rewind_infra::sqlite::execution::SqliteExecutionRepository;
use rewind_infra::sqlite::pool::DatabasePool;
use rewind_infra::sqlite::snapshot::SqliteSnapshotRepository;
use rewind_infra::sqlite::workflow::SqliteWorkflowStore;
use rewind_types::config::EngineConfig;

use crate::steps::cli_registry;

/// The engine pinned to the SQLite implementations.
pub type ConcreteEngine =
    ExecutionEngine<SqliteWorkflowStore, SqliteExecutionRepository, SqliteSnapshotRepository>;

pub type ConcreteTimeTravel = TimeTravelService<SqliteExecutionRepository, SqliteSnapshotRepository>;

pub struct AppState {
    pub engine: ConcreteEngine,
    pub workflows: SqliteWorkflowStore,
}

impl AppState {
    /// Resolve the data directory, load config, open the database, and build
    /// the engine.
    pub async fn init() -> anyhow::Result<Self> {
        let data_dir = resolve_data_dir();
        tokio::fs::create_dir_all(&data_dir)
            .await
            .with_context(|| format!("failed to create data directory {}", data_dir.display()))?;

        let config = load_config(&data_dir).await;
        let url = database_url(&config, &data_dir);
        let pool = DatabasePool::new(&url)
            .await
            .with_context(|| format!("failed to open database {url}"))?;
        tracing::debug!(data_dir = %data_dir.display(), url = url.as_str(), "application state ready");

        Ok(Self::with_pool(pool, config.engine))
    }

    pub fn with_pool(pool: DatabasePool, config: EngineConfig) -> Self {
        let workflows = SqliteWorkflowStore::new(pool.clone());
        let engine = ExecutionEngine::new(
            workflows.clone(),
            SqliteExecutionRepository::new(pool.clone()),
            SqliteSnapshotRepository::new(pool),
            cli_registry(),
            config,
        );
        Self { engine, workflows }
    }

    pub fn time_travel(&self) -> ConcreteTimeTravel {
        self.engine.time_travel()
    }
}
