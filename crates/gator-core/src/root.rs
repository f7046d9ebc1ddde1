//! Process-wide wiring for the six shared singletons (§5/§9).
//!
//! `Root::init` is the one place these are constructed; `Root::shutdown`
//! is the one place they are torn down, in the order §5 mandates:
//! Orchestrator, then SandboxMgr, then LogJournal, then Broadcaster, then
//! the Store pool.

use std::sync::Arc;

use gator_db::config::DbConfig;
use gator_db::pool;
use sqlx::SqlitePool;
use tracing::info;

use crate::broadcaster::Broadcaster;
use crate::log_journal::LogJournal;
use crate::mission_driver::{MissionDriver, MissionDriverConfig};
use crate::orchestrator::Orchestrator;
use crate::recovery::Recovery;
use crate::sandbox::{DockerSandboxMgr, SandboxMgr};
use crate::worktree::{GitWorktreeProvider, WorktreeProvider};

/// Everything the HTTP surface and the CLI need, wired once at startup.
pub struct Root {
    pub pool: SqlitePool,
    pub db_config: DbConfig,
    pub orchestrator: Arc<Orchestrator>,
    pub sandbox: Arc<dyn SandboxMgr>,
    pub journal: Arc<LogJournal>,
    pub broadcaster: Arc<Broadcaster>,
    pub worktree: Arc<dyn WorktreeProvider>,
    pub mission_driver: Arc<MissionDriver>,
}

impl Root {
    /// Open the store, run migrations, and wire every singleton. Does not
    /// run Recovery; call [`Root::run_recovery`] once the caller is ready.
    pub async fn init(db_config: DbConfig, mission_driver_config: MissionDriverConfig) -> anyhow::Result<Self> {
        let pool = pool::create_pool(&db_config).await?;
        pool::run_migrations(&pool, DbConfig::migrations_path()).await?;

        let orchestrator = Arc::new(Orchestrator::new(pool.clone()));
        let sandbox: Arc<dyn SandboxMgr> = Arc::new(DockerSandboxMgr::default());
        let journal = Arc::new(LogJournal::new(db_config.app_home.clone()));
        let broadcaster = Arc::new(Broadcaster::new());
        let worktree: Arc<dyn WorktreeProvider> = Arc::new(GitWorktreeProvider);

        let mission_driver = MissionDriver::new(
            pool.clone(),
            Arc::clone(&orchestrator),
            Arc::clone(&sandbox),
            Arc::clone(&journal),
            Arc::clone(&broadcaster),
            Arc::clone(&worktree),
            mission_driver_config,
        );

        Ok(Self { pool, db_config, orchestrator, sandbox, journal, broadcaster, worktree, mission_driver })
    }

    /// Run startup reconciliation (§4.7). Call once, before serving
    /// external requests.
    pub async fn run_recovery(&self) {
        let recovery = Recovery::new(
            self.pool.clone(),
            Arc::clone(&self.sandbox),
            Arc::clone(&self.journal),
            Arc::clone(&self.broadcaster),
        );
        recovery.run().await;
    }

    /// Tear down in the mandated order: Orchestrator, SandboxMgr,
    /// LogJournal, Broadcaster, then the Store pool (§5).
    pub async fn shutdown(&self) {
        info!("shutdown: stopping orchestrator");
        self.orchestrator.cleanup().await;
        info!("shutdown: stopping sandbox runtime");
        self.sandbox.cleanup().await;
        info!("shutdown: closing log journal");
        self.journal.cleanup();
        info!("shutdown: clearing broadcaster");
        self.broadcaster.cleanup();
        info!("shutdown: closing store pool");
        self.pool.close().await;
    }
}
