//! Mission workflow driver (§4.6): the state machine's only writer.
//!
//! Every public method validates the requested transition against the
//! persisted mission state (via `gator_db::queries::missions`' CAS update),
//! then either dispatches an agent process and returns immediately (the
//! transition forward happens later, off of the process's exit event) or
//! synchronously tears down what cancellation requires. Nothing here
//! blocks on a whole mission completing.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;

use gator_db::models::{Mission, MissionState, ProcessStatus, ProcessType, TaskStatus};
use gator_db::queries::processes::NewProcess;
use gator_db::queries::{audit, missions, processes, projects, tasks};
use serde_json::json;
use sqlx::SqlitePool;
use tokio::sync::mpsc;
use tracing::{info, warn};

use crate::broadcaster::{Broadcaster, EventPayload};
use crate::error::{CoreError, CoreResult};
use crate::log_journal::LogJournal;
use crate::orchestrator::{Orchestrator, ProcessEvent, Signal, SpawnLocalOpts, SpawnedProcess};
use crate::sandbox::{CreateOpts, SandboxMgr};
use crate::worktree::WorktreeProvider;

/// A single program invocation, optionally with extra arguments appended
/// at dispatch time (e.g. rejection notes, a task's name).
#[derive(Debug, Clone)]
pub struct CommandTemplate {
    pub program: String,
    pub args: Vec<String>,
}

impl CommandTemplate {
    fn render(&self, extra: &[&str]) -> (String, Vec<String>) {
        let mut args = self.args.clone();
        args.extend(extra.iter().map(|s| s.to_string()));
        (self.program.clone(), args)
    }
}

/// Pluggable commands `MissionDriver` dispatches for each stage (§9 open
/// question: task/PRD execution is a placeholder, not a fixed agent CLI
/// contract). The shipped default is an `echo`-based placeholder.
#[derive(Debug, Clone)]
pub struct MissionDriverConfig {
    pub sandbox_image: Option<String>,
    pub prd_command: CommandTemplate,
    pub tasks_command: CommandTemplate,
    pub task_command: CommandTemplate,
}

impl Default for MissionDriverConfig {
    fn default() -> Self {
        Self {
            sandbox_image: None,
            prd_command: CommandTemplate {
                program: "echo".to_string(),
                args: vec!["Generating PRD".to_string()],
            },
            tasks_command: CommandTemplate {
                program: "echo".to_string(),
                args: vec!["Generating tasks".to_string()],
            },
            task_command: CommandTemplate {
                program: "echo".to_string(),
                args: vec!["Executing task".to_string()],
            },
        }
    }
}

#[derive(Debug, Clone, Copy)]
enum Stage {
    Prd,
    Tasks,
}

impl Stage {
    fn label(self) -> &'static str {
        match self {
            Self::Prd => "PRD generation",
            Self::Tasks => "task generation",
        }
    }

    fn success_state(self) -> MissionState {
        match self {
            Self::Prd => MissionState::PrdReview,
            Self::Tasks => MissionState::TasksReview,
        }
    }

    fn generated_event(self) -> &'static str {
        match self {
            Self::Prd => "mission.prd_generated",
            Self::Tasks => "mission.tasks_generated",
        }
    }
}

/// Drives every mission state transition and the agent/task processes that
/// back it. Shared process-wide; cheap to clone (everything inside is
/// already `Arc`/pool-backed), but callers generally hold one `Arc`.
pub struct MissionDriver {
    pool: SqlitePool,
    orchestrator: Arc<Orchestrator>,
    sandbox: Arc<dyn SandboxMgr>,
    journal: Arc<LogJournal>,
    broadcaster: Arc<Broadcaster>,
    worktree: Arc<dyn WorktreeProvider>,
    config: MissionDriverConfig,
}

impl MissionDriver {
    pub fn new(
        pool: SqlitePool,
        orchestrator: Arc<Orchestrator>,
        sandbox: Arc<dyn SandboxMgr>,
        journal: Arc<LogJournal>,
        broadcaster: Arc<Broadcaster>,
        worktree: Arc<dyn WorktreeProvider>,
        config: MissionDriverConfig,
    ) -> Arc<Self> {
        Arc::new(Self { pool, orchestrator, sandbox, journal, broadcaster, worktree, config })
    }

    async fn get_mission(&self, mission_id: &str) -> CoreResult<Mission> {
        missions::find_by_id(&self.pool, mission_id)
            .await?
            .ok_or_else(|| CoreError::NotFound { kind: "mission", id: mission_id.to_string() })
    }

    /// `DRAFT -> GENERATING_PRD`: provisions the worktree, then dispatches
    /// PRD generation.
    pub async fn start(self: &Arc<Self>, mission_id: &str) -> CoreResult<Mission> {
        let mission = self.get_mission(mission_id).await?;
        let project = projects::find_by_id(&self.pool, &mission.project_id)
            .await?
            .ok_or_else(|| CoreError::NotFound { kind: "project", id: mission.project_id.clone() })?;

        let created = self
            .worktree
            .create_worktree(PathBuf::from(&project.path).as_path(), &mission.feature_name, mission_id)
            .map_err(|e| CoreError::Internal(e.into()))?;

        missions::update_fields(
            &self.pool,
            mission_id,
            Some(&created.worktree_path.display().to_string()),
            None,
            None,
            None,
            None,
        )
        .await?;
        let updated = missions::update_state(&self.pool, mission_id, MissionState::GeneratingPrd, false).await?;
        audit::log(
            &self.pool,
            "mission.started",
            Some("mission"),
            Some(mission_id),
            Some(json!({"branch": created.branch_name})),
        )
        .await
        .ok();

        self.dispatch_agent_stage(mission_id, Stage::Prd, None).await?;
        Ok(updated)
    }

    /// `PRD_REVIEW -> PREPARING_TASKS`: dispatches task-list generation.
    pub async fn approve_prd(self: &Arc<Self>, mission_id: &str) -> CoreResult<Mission> {
        let updated = missions::update_state(&self.pool, mission_id, MissionState::PreparingTasks, false).await?;
        audit::log(&self.pool, "mission.prd_approved", Some("mission"), Some(mission_id), None)
            .await
            .ok();
        self.dispatch_agent_stage(mission_id, Stage::Tasks, None).await?;
        Ok(updated)
    }

    /// `PRD_REVIEW -> GENERATING_PRD`: re-dispatches PRD generation with
    /// the reviewer's notes appended.
    pub async fn reject_prd(self: &Arc<Self>, mission_id: &str, notes: &str) -> CoreResult<Mission> {
        let mission = missions::increment_prd_iterations(&self.pool, mission_id).await?;
        let updated = missions::update_state(&self.pool, mission_id, MissionState::GeneratingPrd, false).await?;
        audit::log(
            &self.pool,
            "mission.prd_rejected",
            Some("mission"),
            Some(mission_id),
            Some(json!({"notes": notes, "iteration": mission.prd_iterations})),
        )
        .await
        .ok();
        self.dispatch_agent_stage(mission_id, Stage::Prd, Some(notes)).await?;
        Ok(updated)
    }

    /// `TASKS_REVIEW -> IN_PROGRESS`: starts task execution in the
    /// background and returns as soon as the transition is persisted.
    pub async fn approve_tasks(self: &Arc<Self>, mission_id: &str) -> CoreResult<Mission> {
        let updated = missions::update_state(&self.pool, mission_id, MissionState::InProgress, false).await?;
        audit::log(&self.pool, "mission.tasks_approved", Some("mission"), Some(mission_id), None)
            .await
            .ok();

        let driver = Arc::clone(self);
        let mid = mission_id.to_string();
        tokio::spawn(async move { driver.run_task_execution(mid).await });

        Ok(updated)
    }

    /// `TASKS_REVIEW -> PREPARING_TASKS`: drops the current task list and
    /// re-dispatches task generation with the reviewer's notes appended.
    pub async fn reject_tasks(self: &Arc<Self>, mission_id: &str, notes: &str) -> CoreResult<Mission> {
        tasks::delete_by_mission(&self.pool, mission_id).await?;
        let mission = missions::increment_tasks_iterations(&self.pool, mission_id).await?;
        let updated = missions::update_state(&self.pool, mission_id, MissionState::PreparingTasks, false).await?;
        audit::log(
            &self.pool,
            "mission.tasks_rejected",
            Some("mission"),
            Some(mission_id),
            Some(json!({"notes": notes, "iteration": mission.tasks_iterations})),
        )
        .await
        .ok();
        self.dispatch_agent_stage(mission_id, Stage::Tasks, Some(notes)).await?;
        Ok(updated)
    }

    /// Kills every tracked process and managed container for the mission,
    /// then transitions it to `COMPLETED_FAILED`. Only valid from a
    /// non-terminal state that has an edge to `COMPLETED_FAILED` in the
    /// transition table (every non-`DRAFT` non-terminal state).
    pub async fn cancel(self: &Arc<Self>, mission_id: &str) -> CoreResult<Mission> {
        let procs = processes::find_by_mission(&self.pool, mission_id).await?;
        for p in procs.iter().filter(|p| p.r#type == ProcessType::Local && !p.status.is_terminal()) {
            self.orchestrator.kill(&p.id, Signal::Term).await.ok();
        }
        tokio::time::sleep(std::time::Duration::from_secs(1)).await;
        for p in &procs {
            if p.r#type == ProcessType::Local && self.orchestrator.is_running(&p.id) {
                self.orchestrator.kill(&p.id, Signal::Kill).await.ok();
            }
        }

        if let Ok(containers) = self.sandbox.list_for_mission(mission_id).await {
            for container in containers {
                self.sandbox.stop(&container.container_id, 10).await.ok();
                self.sandbox.remove(&container.container_id, true).await.ok();
            }
        }
        for p in procs.iter().filter(|p| p.r#type == ProcessType::Container && !p.status.is_terminal()) {
            processes::finish(&self.pool, &p.id, ProcessStatus::Canceled, None).await.ok();
        }

        missions::update_fields(&self.pool, mission_id, None, None, None, Some("Canceled by user"), None).await?;
        let updated = missions::update_state(&self.pool, mission_id, MissionState::CompletedFailed, false).await?;
        audit::log(&self.pool, "mission.canceled", Some("mission"), Some(mission_id), None)
            .await
            .ok();
        Ok(updated)
    }

    async fn dispatch_agent_stage(self: &Arc<Self>, mission_id: &str, stage: Stage, notes: Option<&str>) -> CoreResult<()> {
        let mission = self.get_mission(mission_id).await?;
        let worktree_path = mission
            .worktree_path
            .clone()
            .ok_or_else(|| CoreError::Internal(anyhow::anyhow!("mission has no worktree path")))?;

        let template = match stage {
            Stage::Prd => &self.config.prd_command,
            Stage::Tasks => &self.config.tasks_command,
        };
        let extra: Vec<&str> = notes.into_iter().collect();
        let (command, args) = template.render(&extra);

        let spawned = self
            .orchestrator
            .spawn_local(SpawnLocalOpts {
                command,
                args,
                cwd: Some(PathBuf::from(worktree_path)),
                env: HashMap::new(),
                mission_id: Some(mission_id.to_string()),
            })
            .await?;

        let driver = Arc::clone(self);
        let mid = mission_id.to_string();
        tokio::spawn(async move { driver.run_stage_to_completion(mid, spawned, stage).await });

        Ok(())
    }

    async fn run_stage_to_completion(self: Arc<Self>, mission_id: String, spawned: SpawnedProcess, stage: Stage) {
        let SpawnedProcess { process_id, mut events } = spawned;
        self.journal.open(&process_id, &mission_id).ok();
        let (code, _signal) = self.pump_events(&process_id, &mut events).await;
        self.journal.close(&process_id);

        if code == Some(0) {
            match missions::update_state(&self.pool, &mission_id, stage.success_state(), false).await {
                Ok(_) => {
                    audit::log(&self.pool, stage.generated_event(), Some("mission"), Some(&mission_id), None)
                        .await
                        .ok();
                }
                Err(e) => {
                    // Benign race: e.g. the mission was canceled while the
                    // stage process was still running.
                    warn!(mission_id = %mission_id, error = %e, "stage completion transition skipped");
                }
            }
            return;
        }

        let reason = format!(
            "{} process failed with exit code {}",
            stage.label(),
            code.map(|c| c.to_string()).unwrap_or_else(|| "unknown".to_string())
        );
        missions::update_fields(&self.pool, &mission_id, None, None, None, Some(&reason), None)
            .await
            .ok();
        if let Err(e) = missions::update_state(&self.pool, &mission_id, MissionState::CompletedFailed, false).await {
            warn!(mission_id = %mission_id, error = %e, "stage failure transition skipped");
        }
        audit::log(
            &self.pool,
            "mission.process_failed",
            Some("mission"),
            Some(&mission_id),
            Some(json!({"stage": stage.label(), "exit_code": code})),
        )
        .await
        .ok();
    }

    /// `IN_PROGRESS` task execution (§4.6): runs every task in order,
    /// preferring a shared sandbox container and falling back to local
    /// process execution per task when no container runtime is available.
    async fn run_task_execution(self: Arc<Self>, mission_id: String) {
        let Ok(mission_tasks) = tasks::find_by_mission(&self.pool, &mission_id).await else { return };
        let Ok(mission) = self.get_mission(&mission_id).await else { return };
        let Some(worktree_path) = mission.worktree_path.clone() else { return };

        // §4.4: a container Process row is registered before the container
        // is started, so recovery and `GET /api/processes/:id` can see it
        // the same way they see a local process row.
        let container_row = processes::create(
            &self.pool,
            NewProcess {
                mission_id: Some(&mission_id),
                r#type: ProcessType::Container,
                command: "task execution sandbox",
                cwd: Some(worktree_path.as_str()),
                env: &HashMap::new(),
            },
        )
        .await;

        let (execution_mode, any_failed) = match container_row {
            Ok(row) => {
                let sandbox_created = self
                    .sandbox
                    .create(CreateOpts {
                        image: self.config.sandbox_image.clone(),
                        workdir: "/workspace".to_string(),
                        binds: vec![(PathBuf::from(&worktree_path), "/workspace".to_string())],
                        mission_id: mission_id.clone(),
                        ..Default::default()
                    })
                    .await;

                match sandbox_created {
                    Ok(created) => {
                        processes::update_container_id(&self.pool, &row.id, &created.container_id).await.ok();
                        let (mode, failed) = self
                            .run_tasks_in_container(&mission_id, &row.id, &created.container_id, &mission_tasks)
                            .await;
                        let terminal = if failed { ProcessStatus::Error } else { ProcessStatus::Success };
                        processes::finish(&self.pool, &row.id, terminal, None).await.ok();
                        (mode, failed)
                    }
                    Err(e) => {
                        processes::finish(&self.pool, &row.id, ProcessStatus::Error, None).await.ok();
                        info!(mission_id = %mission_id, error = %e, "no sandbox runtime available, falling back to local execution");
                        ("local", self.run_tasks_locally(&mission_id, &worktree_path, &mission_tasks).await)
                    }
                }
            }
            Err(e) => {
                warn!(mission_id = %mission_id, error = %e, "failed to register container process row, falling back to local execution");
                ("local", self.run_tasks_locally(&mission_id, &worktree_path, &mission_tasks).await)
            }
        };

        let final_state = if any_failed { MissionState::CompletedFailed } else { MissionState::CompletedSuccess };
        if any_failed {
            missions::update_fields(&self.pool, &mission_id, None, None, None, Some("One or more tasks failed"), None)
                .await
                .ok();
        }
        if let Err(e) = missions::update_state(&self.pool, &mission_id, final_state, false).await {
            warn!(mission_id = %mission_id, error = %e, "task execution completion transition skipped");
        }
        audit::log(
            &self.pool,
            "mission.execution_completed",
            Some("mission"),
            Some(&mission_id),
            Some(json!({"allCompleted": !any_failed, "anyFailed": any_failed, "executionMode": execution_mode})),
        )
        .await
        .ok();
    }

    async fn run_tasks_in_container(
        &self,
        mission_id: &str,
        process_id: &str,
        container_id: &str,
        mission_tasks: &[gator_db::models::Task],
    ) -> (&'static str, bool) {
        self.journal.open(process_id, mission_id).ok();
        let mut any_failed = false;

        for task in mission_tasks {
            tasks::update_status(&self.pool, &task.id, TaskStatus::InProgress).await.ok();
            let (_, args) = self.config.task_command.render(&[task.name.as_str()]);
            let argv: Vec<String> = std::iter::once(self.config.task_command.program.clone()).chain(args).collect();

            match self.sandbox.exec(container_id, &argv).await {
                Ok(mut session) => {
                    let (code, _) = self.pump_events(process_id, &mut session.events).await;
                    self.finish_task(task, code).await;
                    any_failed |= code != Some(0);
                }
                Err(e) => {
                    warn!(task_id = %task.id, error = %e, "task exec failed to start");
                    tasks::update_status(&self.pool, &task.id, TaskStatus::Failed).await.ok();
                    any_failed = true;
                }
            }
        }

        self.journal.close(process_id);
        self.sandbox.stop(container_id, 10).await.ok();
        self.sandbox.remove(container_id, true).await.ok();
        ("container", any_failed)
    }

    async fn run_tasks_locally(&self, mission_id: &str, worktree_path: &str, mission_tasks: &[gator_db::models::Task]) -> bool {
        let mut any_failed = false;

        for task in mission_tasks {
            tasks::update_status(&self.pool, &task.id, TaskStatus::InProgress).await.ok();
            let (program, args) = self.config.task_command.render(&[task.name.as_str()]);

            let spawned = self
                .orchestrator
                .spawn_local(SpawnLocalOpts {
                    command: program,
                    args,
                    cwd: Some(PathBuf::from(worktree_path)),
                    env: HashMap::new(),
                    mission_id: Some(mission_id.to_string()),
                })
                .await;

            match spawned {
                Ok(SpawnedProcess { process_id, mut events }) => {
                    self.journal.open(&process_id, mission_id).ok();
                    let (code, _) = self.pump_events(&process_id, &mut events).await;
                    self.journal.close(&process_id);
                    self.finish_task(task, code).await;
                    any_failed |= code != Some(0);
                }
                Err(e) => {
                    warn!(task_id = %task.id, error = %e, "task process failed to spawn");
                    tasks::update_status(&self.pool, &task.id, TaskStatus::Failed).await.ok();
                    any_failed = true;
                }
            }
        }

        any_failed
    }

    async fn finish_task(&self, task: &gator_db::models::Task, exit_code: Option<i32>) {
        let status = if exit_code == Some(0) { TaskStatus::Completed } else { TaskStatus::Failed };
        tasks::update_status(&self.pool, &task.id, status).await.ok();
    }

    /// Drains a process event stream into the journal and broadcaster
    /// until `Exit`, returning its exit code and signal (§4.6 output
    /// wiring contract).
    async fn pump_events(&self, process_id: &str, events: &mut mpsc::Receiver<ProcessEvent>) -> (Option<i32>, Option<i32>) {
        while let Some(event) = events.recv().await {
            match event {
                ProcessEvent::Output { stream, data } => {
                    self.journal.write(process_id, &format!("{data}\n")).ok();
                    let id = self.broadcaster.next_event_id(process_id);
                    self.broadcaster.broadcast(process_id, id, EventPayload::output(stream.as_str(), data));
                }
                ProcessEvent::Exit { code, signal } => {
                    let id = self.broadcaster.next_event_id(process_id);
                    self.broadcaster.broadcast(process_id, id, EventPayload::status("exited"));
                    return (code, signal);
                }
            }
        }
        (None, None)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::log_journal::LogJournal;
    use crate::sandbox::fake::FakeSandboxMgr;
    use crate::worktree::{WorktreeCreated, WorktreeError};
    use gator_test_utils::{create_test_db, write_fake_script};
    use std::path::Path;
    use tempfile::TempDir;

    struct StubWorktreeProvider {
        worktree_path: PathBuf,
    }

    impl WorktreeProvider for StubWorktreeProvider {
        fn create_worktree(&self, _project_path: &Path, _mission_name: &str, _mission_id: &str) -> Result<WorktreeCreated, WorktreeError> {
            Ok(WorktreeCreated { worktree_path: self.worktree_path.clone(), branch_name: "feature/x".to_string() })
        }

        fn remove_worktree(&self, _project_path: &Path, _worktree_path: &Path) -> Result<(), WorktreeError> {
            Ok(())
        }
    }

    async fn new_driver(pool: SqlitePool, worktree_path: PathBuf, sandbox: Arc<dyn SandboxMgr>, config: MissionDriverConfig) -> Arc<MissionDriver> {
        MissionDriver::new(
            pool.clone(),
            Arc::new(Orchestrator::new(pool)),
            sandbox,
            Arc::new(LogJournal::new(worktree_path.clone())),
            Arc::new(Broadcaster::new()),
            Arc::new(StubWorktreeProvider { worktree_path }),
            config,
        )
    }

    async fn wait_for_state(pool: &SqlitePool, mission_id: &str, want: MissionState) -> Mission {
        for _ in 0..200 {
            if let Ok(Some(m)) = missions::find_by_id(pool, mission_id).await {
                if m.state == want {
                    return m;
                }
            }
            tokio::time::sleep(std::time::Duration::from_millis(25)).await;
        }
        panic!("mission did not reach {want:?} in time");
    }

    #[tokio::test]
    async fn start_moves_draft_to_generating_prd_then_prd_review_on_success() {
        let db = create_test_db().await;
        let dir = TempDir::new().unwrap();
        let project = projects::create(&db.pool, "demo", dir.path().to_str().unwrap()).await.unwrap();
        let mission = missions::create(&db.pool, &project.id, "add oauth", None).await.unwrap();

        let config = MissionDriverConfig {
            prd_command: CommandTemplate { program: "true".to_string(), args: vec![] },
            ..Default::default()
        };
        let driver = new_driver(db.pool.clone(), dir.path().to_path_buf(), Arc::new(FakeSandboxMgr::new()), config).await;

        let updated = driver.start(&mission.id).await.unwrap();
        assert_eq!(updated.state, MissionState::GeneratingPrd);

        wait_for_state(&db.pool, &mission.id, MissionState::PrdReview).await;
    }

    #[tokio::test]
    async fn stage_failure_marks_mission_completed_failed() {
        let db = create_test_db().await;
        let dir = TempDir::new().unwrap();
        let project = projects::create(&db.pool, "demo", dir.path().to_str().unwrap()).await.unwrap();
        let mission = missions::create(&db.pool, &project.id, "add oauth", None).await.unwrap();

        let config = MissionDriverConfig {
            prd_command: CommandTemplate { program: "false".to_string(), args: vec![] },
            ..Default::default()
        };
        let driver = new_driver(db.pool.clone(), dir.path().to_path_buf(), Arc::new(FakeSandboxMgr::new()), config).await;

        driver.start(&mission.id).await.unwrap();
        let failed = wait_for_state(&db.pool, &mission.id, MissionState::CompletedFailed).await;
        assert!(failed.failure_reason.unwrap().contains("PRD generation"));
    }

    #[tokio::test]
    async fn reject_prd_increments_iterations_and_redispatches() {
        let db = create_test_db().await;
        let dir = TempDir::new().unwrap();
        let project = projects::create(&db.pool, "demo", dir.path().to_str().unwrap()).await.unwrap();
        let mission = missions::create(&db.pool, &project.id, "add oauth", None).await.unwrap();
        missions::update_state(&db.pool, &mission.id, MissionState::GeneratingPrd, false).await.unwrap();
        missions::update_state(&db.pool, &mission.id, MissionState::PrdReview, false).await.unwrap();

        let config = MissionDriverConfig {
            prd_command: CommandTemplate { program: "true".to_string(), args: vec![] },
            ..Default::default()
        };
        let driver = new_driver(db.pool.clone(), dir.path().to_path_buf(), Arc::new(FakeSandboxMgr::new()), config).await;

        let updated = driver.reject_prd(&mission.id, "be more specific").await.unwrap();
        assert_eq!(updated.state, MissionState::GeneratingPrd);
        assert_eq!(updated.prd_iterations, 1);

        let entries = audit::list(&db.pool, Some("mission"), Some(&mission.id), 10).await.unwrap();
        assert!(entries.iter().any(|e| e.event == "mission.prd_rejected"));
    }

    #[tokio::test]
    async fn approve_tasks_runs_tasks_in_sandbox_to_completion() {
        let db = create_test_db().await;
        let dir = TempDir::new().unwrap();
        let project = projects::create(&db.pool, "demo", dir.path().to_str().unwrap()).await.unwrap();
        let mission = missions::create(&db.pool, &project.id, "add oauth", None).await.unwrap();
        for state in [MissionState::GeneratingPrd, MissionState::PrdReview, MissionState::PreparingTasks, MissionState::TasksReview] {
            missions::update_state(&db.pool, &mission.id, state, false).await.unwrap();
        }
        tasks::create_many(
            &db.pool,
            &mission.id,
            &[gator_db::models::NewTask { name: "one".into(), description: None, agents: vec![], skills: vec![] }],
        )
        .await
        .unwrap();
        missions::update_fields(&db.pool, &mission.id, Some(dir.path().to_str().unwrap()), None, None, None, None)
            .await
            .unwrap();

        let driver = new_driver(db.pool.clone(), dir.path().to_path_buf(), Arc::new(FakeSandboxMgr::new()), MissionDriverConfig::default()).await;
        driver.approve_tasks(&mission.id).await.unwrap();

        wait_for_state(&db.pool, &mission.id, MissionState::CompletedSuccess).await;

        let done_tasks = tasks::find_by_mission(&db.pool, &mission.id).await.unwrap();
        assert_eq!(done_tasks[0].status, TaskStatus::Completed);
    }

    #[tokio::test]
    async fn approve_tasks_falls_back_to_local_when_sandbox_unavailable() {
        let db = create_test_db().await;
        let dir = TempDir::new().unwrap();
        let project = projects::create(&db.pool, "demo", dir.path().to_str().unwrap()).await.unwrap();
        let mission = missions::create(&db.pool, &project.id, "add oauth", None).await.unwrap();
        for state in [MissionState::GeneratingPrd, MissionState::PrdReview, MissionState::PreparingTasks, MissionState::TasksReview] {
            missions::update_state(&db.pool, &mission.id, state, false).await.unwrap();
        }
        let script = write_fake_script(dir.path(), "task.sh", "exit 0\n");
        tasks::create_many(
            &db.pool,
            &mission.id,
            &[gator_db::models::NewTask { name: "one".into(), description: None, agents: vec![], skills: vec![] }],
        )
        .await
        .unwrap();
        missions::update_fields(&db.pool, &mission.id, Some(dir.path().to_str().unwrap()), None, None, None, None)
            .await
            .unwrap();

        let config = MissionDriverConfig {
            task_command: CommandTemplate { program: script.display().to_string(), args: vec![] },
            ..Default::default()
        };
        let driver = new_driver(db.pool.clone(), dir.path().to_path_buf(), Arc::new(FakeSandboxMgr::failing()), config).await;
        driver.approve_tasks(&mission.id).await.unwrap();

        wait_for_state(&db.pool, &mission.id, MissionState::CompletedSuccess).await;
    }

    #[tokio::test]
    async fn cancel_kills_running_process_and_marks_mission_failed() {
        let db = create_test_db().await;
        let dir = TempDir::new().unwrap();
        let project = projects::create(&db.pool, "demo", dir.path().to_str().unwrap()).await.unwrap();
        let mission = missions::create(&db.pool, &project.id, "add oauth", None).await.unwrap();
        missions::update_state(&db.pool, &mission.id, MissionState::GeneratingPrd, false).await.unwrap();

        let script = write_fake_script(dir.path(), "sleepy.sh", "sleep 30\n");
        let driver = new_driver(db.pool.clone(), dir.path().to_path_buf(), Arc::new(FakeSandboxMgr::new()), MissionDriverConfig::default()).await;

        let spawned = driver
            .orchestrator
            .spawn_local(SpawnLocalOpts { command: script.display().to_string(), mission_id: Some(mission.id.clone()), ..Default::default() })
            .await
            .unwrap();
        drop(spawned.events);

        let updated = driver.cancel(&mission.id).await.unwrap();
        assert_eq!(updated.state, MissionState::CompletedFailed);
        assert_eq!(updated.failure_reason.as_deref(), Some("Canceled by user"));
    }
}
