//! Local-process supervisor (§4.5).
//!
//! Spawns programs detached into their own process group, streams their
//! stdout/stderr as `ProcessEvent`s, tracks them in `Store`, and supports
//! kill-tree semantics on cancellation. Mirrors the spawn/stream idiom this
//! codebase already uses for harness subprocesses (`async_stream`-style
//! line-reader loop over piped stdout), generalized to arbitrary commands
//! and to both stdout and stderr.

use std::collections::HashMap;
use std::path::PathBuf;
use std::process::Stdio;
use std::sync::{Arc, Mutex};

use gator_db::models::{ProcessStatus, ProcessType};
use gator_db::queries::processes::{self, NewProcess};
use sqlx::SqlitePool;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::{Child, Command};
use tokio::sync::mpsc;
use tracing::{info, warn};

use crate::error::{CoreError, CoreResult};

/// Signal accepted by `kill` (§4.5).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Signal {
    Term,
    Kill,
}

impl Signal {
    #[cfg(unix)]
    fn as_raw(self) -> i32 {
        match self {
            Self::Term => libc::SIGTERM,
            Self::Kill => libc::SIGKILL,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OutputStream {
    Stdout,
    Stderr,
}

impl OutputStream {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Stdout => "stdout",
            Self::Stderr => "stderr",
        }
    }
}

/// A chunk of output or the terminal event for a spawned process (§4.5).
#[derive(Debug, Clone)]
pub enum ProcessEvent {
    Output { stream: OutputStream, data: String },
    Exit { code: Option<i32>, signal: Option<i32> },
}

/// Parameters for `spawn_local` (§4.5).
#[derive(Debug, Clone, Default)]
pub struct SpawnLocalOpts {
    pub command: String,
    pub args: Vec<String>,
    pub cwd: Option<PathBuf>,
    pub env: HashMap<String, String>,
    pub mission_id: Option<String>,
}

/// The result of a successful spawn: the new process's id and the event
/// stream the caller (typically `MissionDriver`) wires into the journal
/// and broadcaster per the output wiring contract (§4.6).
pub struct SpawnedProcess {
    pub process_id: String,
    pub events: mpsc::Receiver<ProcessEvent>,
}

/// Per-sink queue depth for a process's raw event channel (§4.5, §9).
const EVENT_QUEUE_CAPACITY: usize = 256;

struct Tracked {
    pgid: i32,
}

/// Local-process supervisor. One instance is shared process-wide.
pub struct Orchestrator {
    pool: SqlitePool,
    tracked: Arc<Mutex<HashMap<String, Tracked>>>,
}

impl Orchestrator {
    pub fn new(pool: SqlitePool) -> Self {
        Self {
            pool,
            tracked: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    /// Launch `opts.command` as a new, detached process group. Registers a
    /// `Process` row up front (`QUEUED`), then `RUNNING` once the OS hands
    /// back a pid. Caller env wins over the parent's on key conflict.
    pub async fn spawn_local(&self, opts: SpawnLocalOpts) -> CoreResult<SpawnedProcess> {
        let full_command = if opts.args.is_empty() {
            opts.command.clone()
        } else {
            format!("{} {}", opts.command, opts.args.join(" "))
        };
        let cwd_str = opts.cwd.as_ref().map(|p| p.display().to_string());

        let row = processes::create(
            &self.pool,
            NewProcess {
                mission_id: opts.mission_id.as_deref(),
                r#type: ProcessType::Local,
                command: &full_command,
                cwd: cwd_str.as_deref(),
                env: &opts.env,
            },
        )
        .await?;
        let process_id = row.id.clone();

        let mut cmd = Command::new(&opts.command);
        cmd.args(&opts.args);
        if let Some(cwd) = &opts.cwd {
            cmd.current_dir(cwd);
        }
        for (k, v) in &opts.env {
            cmd.env(k, v);
        }
        cmd.stdin(Stdio::null());
        cmd.stdout(Stdio::piped());
        cmd.stderr(Stdio::piped());
        cmd.kill_on_drop(true);
        #[cfg(unix)]
        cmd.process_group(0);

        let child = match cmd.spawn() {
            Ok(child) => child,
            Err(e) => {
                warn!(process_id, error = %e, "failed to spawn local process");
                processes::finish(&self.pool, &process_id, ProcessStatus::Error, None).await?;
                let (tx, rx) = mpsc::channel(1);
                let _ = tx
                    .send(ProcessEvent::Exit { code: None, signal: None })
                    .await;
                return Ok(SpawnedProcess { process_id, events: rx });
            }
        };

        let pid = child.id().ok_or_else(|| {
            CoreError::Internal(anyhow::anyhow!("spawned child has no pid"))
        })? as i64;
        processes::update_pid(&self.pool, &process_id, pid, pid).await?;
        info!(process_id, pid, command = %full_command, "spawned local process");

        self.tracked
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .insert(process_id.clone(), Tracked { pgid: pid as i32 });

        let (tx, rx) = mpsc::channel(EVENT_QUEUE_CAPACITY);
        let pool = self.pool.clone();
        let tracked = Arc::clone(&self.tracked);
        let supervised_id = process_id.clone();
        tokio::spawn(async move {
            supervise(pool, supervised_id, child, tracked, tx).await;
        });

        Ok(SpawnedProcess { process_id, events: rx })
    }

    /// Signal every process in the tree rooted at `processId`'s pgid.
    /// Races with natural exit are tolerated silently.
    pub async fn kill(&self, process_id: &str, signal: Signal) -> CoreResult<()> {
        let pgid = {
            let tracked = self.tracked.lock().unwrap_or_else(|e| e.into_inner());
            tracked.get(process_id).map(|t| t.pgid)
        };

        // Unknown in-memory (e.g. after a restart): fall back to the
        // persisted row so the process can still be targeted.
        let pgid = match pgid {
            Some(pgid) => Some(pgid),
            None => processes::find_by_id(&self.pool, process_id)
                .await?
                .and_then(|row| row.pgid)
                .map(|p| p as i32),
        };

        if let Some(pgid) = pgid {
            #[cfg(unix)]
            {
                // SAFETY: killpg targets a pgid we created via
                // `process_group(0)` at spawn time. ESRCH (already exited)
                // is an expected race, not an error.
                let rc = unsafe { libc::killpg(pgid, signal.as_raw()) };
                if rc != 0 {
                    let err = std::io::Error::last_os_error();
                    if err.raw_os_error() != Some(libc::ESRCH) {
                        warn!(process_id, pgid, error = %err, "killpg failed");
                    }
                }
            }
        }

        if let Some(row) = processes::find_by_id(&self.pool, process_id).await? {
            if !row.status.is_terminal() {
                processes::finish(&self.pool, process_id, ProcessStatus::Canceled, None).await?;
            }
        }

        Ok(())
    }

    pub fn is_running(&self, process_id: &str) -> bool {
        self.tracked
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .contains_key(process_id)
    }

    pub fn running_ids(&self) -> Vec<String> {
        self.tracked
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .keys()
            .cloned()
            .collect()
    }

    /// Best-effort SIGTERM of every tracked process (shutdown, §5).
    pub async fn cleanup(&self) {
        for id in self.running_ids() {
            if let Err(e) = self.kill(&id, Signal::Term).await {
                warn!(process_id = %id, error = %e, "cleanup: failed to signal process");
            }
        }
    }
}

/// Background task owning one spawned child: reads stdout/stderr
/// concurrently on their own line-reader tasks, waits for exit, records
/// the terminal status, and emits the final `Exit` event.
async fn supervise(
    pool: SqlitePool,
    process_id: String,
    mut child: Child,
    tracked: Arc<Mutex<HashMap<String, Tracked>>>,
    tx: mpsc::Sender<ProcessEvent>,
) {
    let stdout = child.stdout.take();
    let stderr = child.stderr.take();

    let stdout_tx = tx.clone();
    let stdout_task = tokio::spawn(async move {
        let Some(stdout) = stdout else { return };
        let mut lines = BufReader::new(stdout).lines();
        while let Ok(Some(line)) = lines.next_line().await {
            let _ = stdout_tx
                .send(ProcessEvent::Output { stream: OutputStream::Stdout, data: line })
                .await;
        }
    });

    let stderr_tx = tx.clone();
    let stderr_task = tokio::spawn(async move {
        let Some(stderr) = stderr else { return };
        let mut lines = BufReader::new(stderr).lines();
        while let Ok(Some(line)) = lines.next_line().await {
            let _ = stderr_tx
                .send(ProcessEvent::Output { stream: OutputStream::Stderr, data: line })
                .await;
        }
    });

    let wait_result = child.wait().await;
    let _ = stdout_task.await;
    let _ = stderr_task.await;

    tracked
        .lock()
        .unwrap_or_else(|e| e.into_inner())
        .remove(&process_id);

    let (status, exit_code, signal) = match wait_result {
        Ok(exit_status) => {
            #[cfg(unix)]
            let signal = std::os::unix::process::ExitStatusExt::signal(&exit_status);
            #[cfg(not(unix))]
            let signal: Option<i32> = None;

            if signal.is_some() {
                (ProcessStatus::Error, None, signal)
            } else if exit_status.success() {
                (ProcessStatus::Success, exit_status.code(), None)
            } else {
                (ProcessStatus::Error, exit_status.code(), None)
            }
        }
        Err(e) => {
            warn!(process_id, error = %e, "failed to wait on child process");
            (ProcessStatus::Error, None, None)
        }
    };

    if let Err(e) = processes::finish(&pool, &process_id, status, exit_code.map(|c| c as i64)).await {
        warn!(process_id, error = %e, "failed to finalize process row after exit");
    }

    let _ = tx.send(ProcessEvent::Exit { code: exit_code, signal }).await;
}

#[cfg(test)]
mod tests {
    use super::*;
    use gator_test_utils::{create_test_db, write_fake_script};
    use tempfile::TempDir;

    #[tokio::test]
    async fn spawn_local_streams_stdout_lines_in_order() {
        let db = create_test_db().await;
        let dir = TempDir::new().unwrap();
        let script = write_fake_script(dir.path(), "ok.sh", "echo hello\necho world\nexit 0\n");

        let orch = Orchestrator::new(db.pool.clone());
        let mut spawned = orch
            .spawn_local(SpawnLocalOpts {
                command: script.display().to_string(),
                ..Default::default()
            })
            .await
            .unwrap();

        let mut lines = Vec::new();
        while let Some(event) = spawned.events.recv().await {
            match event {
                ProcessEvent::Output { stream: OutputStream::Stdout, data } => lines.push(data),
                ProcessEvent::Exit { .. } => break,
                _ => {}
            }
        }
        assert_eq!(lines, vec!["hello".to_string(), "world".to_string()]);
    }

    #[tokio::test]
    async fn spawn_local_records_queued_then_running_row() {
        let db = create_test_db().await;
        let dir = TempDir::new().unwrap();
        let script = write_fake_script(dir.path(), "noop.sh", "sleep 1\nexit 0\n");

        let orch = Orchestrator::new(db.pool.clone());
        let spawned = orch
            .spawn_local(SpawnLocalOpts {
                command: script.display().to_string(),
                ..Default::default()
            })
            .await
            .unwrap();

        let row = processes::find_by_id(&db.pool, &spawned.process_id)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(row.status, ProcessStatus::Running);
        assert!(row.pid.is_some());
        assert_eq!(row.pid, row.pgid);
        assert!(orch.is_running(&spawned.process_id));
    }

    #[tokio::test]
    async fn spawn_local_exit_code_is_recorded_on_success() {
        let db = create_test_db().await;
        let dir = TempDir::new().unwrap();
        let script = write_fake_script(dir.path(), "ok.sh", "exit 0\n");

        let orch = Orchestrator::new(db.pool.clone());
        let mut spawned = orch
            .spawn_local(SpawnLocalOpts {
                command: script.display().to_string(),
                ..Default::default()
            })
            .await
            .unwrap();

        loop {
            match spawned.events.recv().await {
                Some(ProcessEvent::Exit { code, signal }) => {
                    assert_eq!(code, Some(0));
                    assert_eq!(signal, None);
                    break;
                }
                Some(_) => continue,
                None => panic!("event channel closed before exit"),
            }
        }

        let row = processes::find_by_id(&db.pool, &spawned.process_id)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(row.status, ProcessStatus::Success);
        assert_eq!(row.exit_code, Some(0));
    }

    #[tokio::test]
    async fn spawn_local_nonzero_exit_marks_error() {
        let db = create_test_db().await;
        let dir = TempDir::new().unwrap();
        let script = write_fake_script(dir.path(), "bad.sh", "exit 7\n");

        let orch = Orchestrator::new(db.pool.clone());
        let mut spawned = orch
            .spawn_local(SpawnLocalOpts {
                command: script.display().to_string(),
                ..Default::default()
            })
            .await
            .unwrap();

        while let Some(event) = spawned.events.recv().await {
            if let ProcessEvent::Exit { code, .. } = event {
                assert_eq!(code, Some(7));
                break;
            }
        }

        let row = processes::find_by_id(&db.pool, &spawned.process_id)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(row.status, ProcessStatus::Error);
    }

    #[tokio::test]
    async fn spawn_local_failure_marks_error_and_emits_exit() {
        let db = create_test_db().await;
        let orch = Orchestrator::new(db.pool.clone());

        let mut spawned = orch
            .spawn_local(SpawnLocalOpts {
                command: "/nonexistent/binary/path".to_string(),
                ..Default::default()
            })
            .await
            .unwrap();

        let row = processes::find_by_id(&db.pool, &spawned.process_id)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(row.status, ProcessStatus::Error);

        let event = spawned.events.recv().await.unwrap();
        assert!(matches!(event, ProcessEvent::Exit { code: None, signal: None }));
    }

    #[tokio::test]
    async fn kill_marks_canceled_and_stops_the_process_group() {
        let db = create_test_db().await;
        let dir = TempDir::new().unwrap();
        let script = write_fake_script(dir.path(), "sleepy.sh", "sleep 30\n");

        let orch = Orchestrator::new(db.pool.clone());
        let spawned = orch
            .spawn_local(SpawnLocalOpts {
                command: script.display().to_string(),
                ..Default::default()
            })
            .await
            .unwrap();

        orch.kill(&spawned.process_id, Signal::Kill).await.unwrap();

        let row = processes::find_by_id(&db.pool, &spawned.process_id)
            .await
            .unwrap()
            .unwrap();
        assert!(row.status.is_terminal());
    }

    #[tokio::test]
    async fn kill_on_unknown_process_is_a_noop() {
        let db = create_test_db().await;
        let orch = Orchestrator::new(db.pool.clone());
        orch.kill("proc-does-not-exist", Signal::Term).await.unwrap();
    }
}
