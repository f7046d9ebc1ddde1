//! Startup reconciliation between persisted state and live sandboxes (§4.7).
//!
//! Runs once, before the HTTP server accepts requests. A per-mission
//! failure is caught and recorded, never aborting the rest of the sweep.

use std::sync::Arc;

use gator_db::models::{MissionState, ProcessStatus, ProcessType};
use gator_db::queries::{audit, missions, processes};
use serde_json::json;
use sqlx::SqlitePool;
use tracing::{info, warn};

use crate::broadcaster::{Broadcaster, EventPayload};
use crate::log_journal::LogJournal;
use crate::orchestrator::ProcessEvent;
use crate::sandbox::SandboxMgr;

const RECOVERABLE_STATES: [MissionState; 3] =
    [MissionState::GeneratingPrd, MissionState::PreparingTasks, MissionState::InProgress];

pub struct Recovery {
    pool: SqlitePool,
    sandbox: Arc<dyn SandboxMgr>,
    journal: Arc<LogJournal>,
    broadcaster: Arc<Broadcaster>,
}

impl Recovery {
    pub fn new(pool: SqlitePool, sandbox: Arc<dyn SandboxMgr>, journal: Arc<LogJournal>, broadcaster: Arc<Broadcaster>) -> Self {
        Self { pool, sandbox, journal, broadcaster }
    }

    pub async fn run(&self) {
        info!("recovery: starting startup reconciliation");

        let in_flight_missions = match missions::find_by_states(&self.pool, &RECOVERABLE_STATES).await {
            Ok(found) => found,
            Err(e) => {
                warn!(error = %e, "recovery: failed to query in-flight missions");
                Vec::new()
            }
        };

        for mission in in_flight_missions {
            if let Err(e) = self.recover_mission(&mission.id).await {
                warn!(mission_id = %mission.id, error = %e, "recovery: failed to recover mission, leaving as-is");
            }
        }

        if let Err(e) = self.sweep_orphaned_containers().await {
            warn!(error = %e, "recovery: orphan sweep failed");
        }

        info!("recovery: startup reconciliation complete");
    }

    async fn recover_mission(&self, mission_id: &str) -> anyhow::Result<()> {
        let running = processes::find_by_mission(&self.pool, mission_id)
            .await?
            .into_iter()
            .filter(|p| p.status == ProcessStatus::Running)
            .collect::<Vec<_>>();

        if running.is_empty() {
            self.mark_mission_failed(mission_id, "No running processes found during recovery").await?;
            return Ok(());
        }

        let mut any_reattached = false;
        for process in &running {
            match self.recover_process(process).await {
                Ok(true) => any_reattached = true,
                Ok(false) => {}
                Err(e) => warn!(process_id = %process.id, error = %e, "recovery: failed to recover process"),
            }
        }

        if any_reattached {
            audit::log(&self.pool, "recovery.mission_reattached", Some("mission"), Some(mission_id), None).await.ok();
        } else {
            self.mark_mission_failed(mission_id, "All processes dead during recovery").await?;
        }
        Ok(())
    }

    /// Returns `Ok(true)` if the process was successfully reattached.
    async fn recover_process(&self, process: &gator_db::models::ProcessRow) -> anyhow::Result<bool> {
        if process.r#type != ProcessType::Container {
            processes::finish(&self.pool, &process.id, ProcessStatus::Error, None).await?;
            audit::log(
                &self.pool,
                "recovery.process_marked_failed",
                Some("process"),
                Some(&process.id),
                Some(json!({"reason": "Local process cannot be recovered"})),
            )
            .await
            .ok();
            return Ok(false);
        }

        let Some(container_id) = &process.container_id else {
            processes::finish(&self.pool, &process.id, ProcessStatus::Error, None).await?;
            audit::log(
                &self.pool,
                "recovery.process_marked_failed",
                Some("process"),
                Some(&process.id),
                Some(json!({"reason": "Container not found"})),
            )
            .await
            .ok();
            return Ok(false);
        };

        match self.sandbox.inspect(container_id).await {
            Ok(state) if state.running => {
                if let Ok(mut events) = self.sandbox.attach_logs(container_id).await {
                    let process_id = process.id.clone();
                    let mission_id = process.mission_id.clone().unwrap_or_default();
                    self.journal.open(&process_id, &mission_id).ok();
                    let journal = Arc::clone(&self.journal);
                    let broadcaster = Arc::clone(&self.broadcaster);
                    tokio::spawn(async move {
                        while let Some(event) = events.recv().await {
                            match event {
                                ProcessEvent::Output { stream, data } => {
                                    journal.write(&process_id, &format!("{data}\n")).ok();
                                    let id = broadcaster.next_event_id(&process_id);
                                    broadcaster.broadcast(&process_id, id, EventPayload::output(stream.as_str(), data));
                                }
                                ProcessEvent::Exit { .. } => {
                                    journal.close(&process_id);
                                    break;
                                }
                            }
                        }
                    });
                }
                audit::log(&self.pool, "recovery.process_reattached", Some("process"), Some(&process.id), None)
                    .await
                    .ok();
                Ok(true)
            }
            Ok(state) => {
                processes::finish(&self.pool, &process.id, ProcessStatus::Error, state.exit_code.map(i64::from)).await?;
                audit::log(
                    &self.pool,
                    "recovery.process_marked_failed",
                    Some("process"),
                    Some(&process.id),
                    Some(json!({"reason": "Container exited", "exitCode": state.exit_code})),
                )
                .await
                .ok();
                Ok(false)
            }
            Err(_) => {
                processes::finish(&self.pool, &process.id, ProcessStatus::Error, None).await?;
                audit::log(
                    &self.pool,
                    "recovery.process_marked_failed",
                    Some("process"),
                    Some(&process.id),
                    Some(json!({"reason": "Container not found"})),
                )
                .await
                .ok();
                Ok(false)
            }
        }
    }

    async fn mark_mission_failed(&self, mission_id: &str, reason: &str) -> anyhow::Result<()> {
        missions::update_fields(&self.pool, mission_id, None, None, None, Some(reason), None).await?;
        missions::update_state(&self.pool, mission_id, MissionState::CompletedFailed, true).await?;
        audit::log(
            &self.pool,
            "recovery.mission_marked_failed",
            Some("mission"),
            Some(mission_id),
            Some(json!({"error": reason})),
        )
        .await
        .ok();
        Ok(())
    }

    async fn sweep_orphaned_containers(&self) -> anyhow::Result<()> {
        let managed = self.sandbox.list_managed().await?;
        for container in managed {
            let owned = processes::find_by_container_id(&self.pool, &container.container_id).await?;
            if owned.is_some() {
                continue;
            }
            self.sandbox.stop(&container.container_id, 5).await.ok();
            self.sandbox.remove(&container.container_id, true).await.ok();
            audit::log(
                &self.pool,
                "recovery.orphaned_container_removed",
                Some("container"),
                Some(&container.container_id),
                None,
            )
            .await
            .ok();
        }
        Ok(())
    }
}
