//! Container sandbox runtime (§4.4), shelled out to the `docker` CLI.
//!
//! Mirrors `crate::orchestrator`'s spawn/stream idiom: a managed resource
//! is created, its combined stdout/stderr is turned into a channel of
//! `ProcessEvent`s, and teardown is best-effort and idempotent. No
//! Docker Engine API client is linked in; every operation is a `docker`
//! subprocess invocation, matching how `WorktreeManager` shells `git`.

use std::collections::HashMap;
use std::path::PathBuf;
use std::process::Stdio;

use async_trait::async_trait;
use thiserror::Error;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::Command;
use tokio::sync::mpsc;
use tracing::warn;

use crate::error::{CoreError, CoreResult};
use crate::orchestrator::{OutputStream, ProcessEvent};

const EVENT_QUEUE_CAPACITY: usize = 256;
const DEFAULT_IMAGE: &str = "node:18-alpine";

#[derive(Debug, Error)]
pub enum SandboxError {
    #[error("docker {command}: {message}")]
    Cli { command: String, message: String },

    #[error("container {0} not found")]
    NotFound(String),
}

impl From<SandboxError> for CoreError {
    fn from(err: SandboxError) -> Self {
        match err {
            SandboxError::NotFound(id) => CoreError::NotFound { kind: "container", id },
            SandboxError::Cli { .. } => CoreError::Internal(err.into()),
        }
    }
}

/// Resource caps applied to every managed container (§4.4 defaults).
#[derive(Debug, Clone)]
pub struct ContainerLimits {
    pub memory_bytes: u64,
    pub cpus: f64,
    pub pids_limit: u32,
    pub init: bool,
}

impl Default for ContainerLimits {
    fn default() -> Self {
        Self {
            memory_bytes: 1 << 30,
            cpus: 1.0,
            pids_limit: 100,
            init: true,
        }
    }
}

/// Parameters for `create` (§4.4).
#[derive(Debug, Clone)]
pub struct CreateOpts {
    pub image: Option<String>,
    pub workdir: String,
    pub cmd: Vec<String>,
    pub env: HashMap<String, String>,
    pub binds: Vec<(PathBuf, String)>,
    pub mission_id: String,
    pub limits: ContainerLimits,
}

impl Default for CreateOpts {
    fn default() -> Self {
        Self {
            image: None,
            workdir: "/workspace".to_string(),
            cmd: vec!["sleep".to_string(), "infinity".to_string()],
            env: HashMap::new(),
            binds: Vec::new(),
            mission_id: String::new(),
            limits: ContainerLimits::default(),
        }
    }
}

pub struct CreatedSandbox {
    pub container_id: String,
}

pub struct ContainerState {
    pub running: bool,
    pub exit_code: Option<i32>,
}

#[derive(Debug, Clone)]
pub struct ManagedContainer {
    pub container_id: String,
    pub mission_id: Option<String>,
}

/// A running `docker exec`, owning the receiving end of its event stream.
pub struct ExecSession {
    pub events: mpsc::Receiver<ProcessEvent>,
}

/// Capability set shared with `Orchestrator` (§9): spawn, kill, status,
/// attach output. `MissionDriver` depends on this trait, not on the
/// concrete `docker`-backed implementation, so it can be exercised in
/// tests without a live daemon.
#[async_trait]
pub trait SandboxMgr: Send + Sync {
    async fn create(&self, opts: CreateOpts) -> CoreResult<CreatedSandbox>;
    async fn exec(&self, container_id: &str, argv: &[String]) -> CoreResult<ExecSession>;
    async fn attach_logs(&self, container_id: &str) -> CoreResult<mpsc::Receiver<ProcessEvent>>;
    async fn stop(&self, container_id: &str, grace_seconds: u64) -> CoreResult<()>;
    async fn remove(&self, container_id: &str, force: bool) -> CoreResult<()>;
    async fn inspect(&self, container_id: &str) -> CoreResult<ContainerState>;
    async fn kill(&self, container_id: &str, signal: &str) -> CoreResult<()>;
    async fn list_managed(&self) -> CoreResult<Vec<ManagedContainer>>;
    async fn list_for_mission(&self, mission_id: &str) -> CoreResult<Vec<ManagedContainer>>;
    async fn ping(&self) -> CoreResult<()>;
    async fn pull_if_needed(&self, image: &str) -> CoreResult<()>;
    async fn cleanup(&self);
}

/// `docker`-CLI-backed `SandboxMgr`.
pub struct DockerSandboxMgr {
    docker_bin: String,
}

impl Default for DockerSandboxMgr {
    fn default() -> Self {
        Self::new("docker")
    }
}

impl DockerSandboxMgr {
    pub fn new(docker_bin: impl Into<String>) -> Self {
        Self { docker_bin: docker_bin.into() }
    }

    async fn run(&self, args: &[&str]) -> Result<std::process::Output, SandboxError> {
        Command::new(&self.docker_bin)
            .args(args)
            .output()
            .await
            .map_err(|e| SandboxError::Cli {
                command: args.join(" "),
                message: e.to_string(),
            })
    }

    fn check(command: &str, output: &std::process::Output) -> Result<String, SandboxError> {
        let stdout = String::from_utf8_lossy(&output.stdout).trim().to_string();
        if output.status.success() {
            return Ok(stdout);
        }
        Err(SandboxError::Cli {
            command: command.to_string(),
            message: String::from_utf8_lossy(&output.stderr).trim().to_string(),
        })
    }

    fn is_not_found(message: &str) -> bool {
        let m = message.to_lowercase();
        m.contains("no such container") || m.contains("is already stopped") || m.contains("not running")
    }

    #[cfg(unix)]
    fn current_user_arg() -> String {
        // SAFETY: getuid/getgid never fail.
        unsafe { format!("{}:{}", libc::getuid(), libc::getgid()) }
    }

    #[cfg(not(unix))]
    fn current_user_arg() -> Option<String> {
        None
    }
}

#[async_trait]
impl SandboxMgr for DockerSandboxMgr {
    async fn create(&self, opts: CreateOpts) -> CoreResult<CreatedSandbox> {
        let image = opts.image.unwrap_or_else(|| DEFAULT_IMAGE.to_string());
        self.pull_if_needed(&image).await.ok();

        let memory = opts.limits.memory_bytes.to_string();
        let cpus = opts.limits.cpus.to_string();
        let pids = opts.limits.pids_limit.to_string();
        let mission_label = format!("mission={}", opts.mission_id);

        let mut args: Vec<String> = vec![
            "run".into(),
            "-d".into(),
            "--label".into(),
            "managed=true".into(),
            "--label".into(),
            mission_label,
            "--memory".into(),
            memory,
            "--cpus".into(),
            cpus,
            "--pids-limit".into(),
            pids,
            "-w".into(),
            opts.workdir.clone(),
        ];
        if opts.limits.init {
            args.push("--init".into());
        }
        #[cfg(unix)]
        {
            args.push("--user".into());
            args.push(Self::current_user_arg());
        }
        for (host, container) in &opts.binds {
            args.push("-v".into());
            args.push(format!("{}:{}", host.display(), container));
        }
        for (k, v) in &opts.env {
            args.push("-e".into());
            args.push(format!("{k}={v}"));
        }
        args.push(image);
        args.extend(opts.cmd);

        let arg_refs: Vec<&str> = args.iter().map(String::as_str).collect();
        let output = self.run(&arg_refs).await?;
        let container_id = Self::check("run", &output)?;
        Ok(CreatedSandbox { container_id })
    }

    async fn exec(&self, container_id: &str, argv: &[String]) -> CoreResult<ExecSession> {
        let mut cmd = Command::new(&self.docker_bin);
        cmd.arg("exec").arg(container_id).args(argv);
        cmd.stdin(Stdio::null());
        cmd.stdout(Stdio::piped());
        cmd.stderr(Stdio::piped());
        cmd.kill_on_drop(true);

        let mut child = cmd.spawn().map_err(|e| {
            CoreError::Internal(anyhow::anyhow!("failed to spawn docker exec: {e}"))
        })?;

        let stdout = child.stdout.take();
        let stderr = child.stderr.take();
        let (tx, rx) = mpsc::channel(EVENT_QUEUE_CAPACITY);

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

        tokio::spawn(async move {
            let status = child.wait().await;
            let _ = stdout_task.await;
            let _ = stderr_task.await;
            let code = status.ok().and_then(|s| s.code());
            let _ = tx.send(ProcessEvent::Exit { code, signal: None }).await;
        });

        Ok(ExecSession { events: rx })
    }

    async fn attach_logs(&self, container_id: &str) -> CoreResult<mpsc::Receiver<ProcessEvent>> {
        let mut cmd = Command::new(&self.docker_bin);
        cmd.args(["logs", "-f", "--timestamps", container_id]);
        cmd.stdin(Stdio::null());
        cmd.stdout(Stdio::piped());
        cmd.stderr(Stdio::piped());
        cmd.kill_on_drop(true);

        let mut child = cmd.spawn().map_err(|e| {
            CoreError::Internal(anyhow::anyhow!("failed to spawn docker logs -f: {e}"))
        })?;

        let stdout = child.stdout.take();
        let stderr = child.stderr.take();
        let (tx, rx) = mpsc::channel(EVENT_QUEUE_CAPACITY);

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

        tokio::spawn(async move {
            let _ = child.wait().await;
            let _ = stdout_task.await;
            let _ = stderr_task.await;
            let _ = tx.send(ProcessEvent::Exit { code: None, signal: None }).await;
        });

        Ok(rx)
    }

    async fn stop(&self, container_id: &str, grace_seconds: u64) -> CoreResult<()> {
        let grace = grace_seconds.to_string();
        let output = self.run(&["stop", "-t", &grace, container_id]).await?;
        if output.status.success() {
            return Ok(());
        }
        let message = String::from_utf8_lossy(&output.stderr).trim().to_string();
        if Self::is_not_found(&message) {
            return Ok(());
        }
        Err(CoreError::Internal(anyhow::anyhow!("docker stop {container_id}: {message}")))
    }

    async fn remove(&self, container_id: &str, force: bool) -> CoreResult<()> {
        let mut args = vec!["rm"];
        if force {
            args.push("-f");
        }
        args.push(container_id);
        let output = self.run(&args).await?;
        if output.status.success() {
            return Ok(());
        }
        let message = String::from_utf8_lossy(&output.stderr).trim().to_string();
        if Self::is_not_found(&message) {
            return Ok(());
        }
        Err(CoreError::Internal(anyhow::anyhow!("docker rm {container_id}: {message}")))
    }

    async fn inspect(&self, container_id: &str) -> CoreResult<ContainerState> {
        let output = self
            .run(&[
                "inspect",
                "--format",
                "{{.State.Running}} {{.State.ExitCode}}",
                container_id,
            ])
            .await?;
        if !output.status.success() {
            let message = String::from_utf8_lossy(&output.stderr).trim().to_string();
            if Self::is_not_found(&message) {
                return Err(SandboxError::NotFound(container_id.to_string()).into());
            }
            return Err(CoreError::Internal(anyhow::anyhow!("docker inspect {container_id}: {message}")));
        }
        let stdout = String::from_utf8_lossy(&output.stdout).trim().to_string();
        let mut parts = stdout.split_whitespace();
        let running = parts.next() == Some("true");
        let exit_code = parts.next().and_then(|s| s.parse::<i32>().ok());
        Ok(ContainerState { running, exit_code: if running { None } else { exit_code } })
    }

    async fn kill(&self, container_id: &str, signal: &str) -> CoreResult<()> {
        let output = self.run(&["kill", "-s", signal, container_id]).await?;
        if output.status.success() {
            return Ok(());
        }
        let message = String::from_utf8_lossy(&output.stderr).trim().to_string();
        if Self::is_not_found(&message) {
            return Ok(());
        }
        Err(CoreError::Internal(anyhow::anyhow!("docker kill {container_id}: {message}")))
    }

    async fn list_managed(&self) -> CoreResult<Vec<ManagedContainer>> {
        let output = self
            .run(&[
                "ps",
                "-a",
                "--filter",
                "label=managed=true",
                "--format",
                "{{.ID}}\t{{index .Labels \"mission\"}}",
            ])
            .await?;
        let stdout = Self::check("ps", &output)?;
        Ok(parse_managed_list(&stdout))
    }

    async fn list_for_mission(&self, mission_id: &str) -> CoreResult<Vec<ManagedContainer>> {
        let label = format!("label=mission={mission_id}");
        let output = self
            .run(&[
                "ps",
                "-a",
                "--filter",
                "label=managed=true",
                "--filter",
                &label,
                "--format",
                "{{.ID}}\t{{index .Labels \"mission\"}}",
            ])
            .await?;
        let stdout = Self::check("ps", &output)?;
        Ok(parse_managed_list(&stdout))
    }

    async fn ping(&self) -> CoreResult<()> {
        let output = self.run(&["version", "--format", "{{.Server.Version}}"]).await?;
        Self::check("version", &output).map(|_| ()).map_err(Into::into)
    }

    async fn pull_if_needed(&self, image: &str) -> CoreResult<()> {
        let inspect = self.run(&["image", "inspect", image]).await?;
        if inspect.status.success() {
            return Ok(());
        }
        let output = self.run(&["pull", image]).await?;
        Self::check("pull", &output).map(|_| ())?;
        Ok(())
    }

    async fn cleanup(&self) {
        let Ok(containers) = self.list_managed().await else { return };
        for container in containers {
            if let Err(e) = self.stop(&container.container_id, 10).await {
                warn!(container_id = %container.container_id, error = %e, "cleanup: failed to stop container");
            }
            if let Err(e) = self.remove(&container.container_id, true).await {
                warn!(container_id = %container.container_id, error = %e, "cleanup: failed to remove container");
            }
        }
    }
}

fn parse_managed_list(stdout: &str) -> Vec<ManagedContainer> {
    stdout
        .lines()
        .filter(|l| !l.is_empty())
        .map(|line| {
            let mut parts = line.splitn(2, '\t');
            let id = parts.next().unwrap_or_default().to_string();
            let mission_id = parts.next().filter(|s| !s.is_empty()).map(str::to_string);
            ManagedContainer { container_id: id, mission_id }
        })
        .collect()
}

/// In-memory `SandboxMgr` test double: no `docker` daemon required, used to
/// exercise `MissionDriver`'s container-execution path in unit tests. Not
/// `cfg(test)`-gated since `gator-cli`'s own test suite needs it too.
pub mod fake {
    use super::*;
    use std::sync::Mutex;

    #[derive(Default)]
    pub struct FakeSandboxMgr {
        next_id: Mutex<u64>,
        containers: Mutex<HashMap<String, ManagedContainer>>,
        pub fail_create: bool,
        pub exec_exit_code: i32,
    }

    impl FakeSandboxMgr {
        pub fn new() -> Self {
            Self { exec_exit_code: 0, ..Default::default() }
        }

        pub fn failing() -> Self {
            Self { fail_create: true, ..Default::default() }
        }
    }

    #[async_trait]
    impl SandboxMgr for FakeSandboxMgr {
        async fn create(&self, opts: CreateOpts) -> CoreResult<CreatedSandbox> {
            if self.fail_create {
                return Err(CoreError::Internal(anyhow::anyhow!("no docker daemon available")));
            }
            let mut next_id = self.next_id.lock().unwrap();
            *next_id += 1;
            let container_id = format!("fake-container-{next_id}");
            self.containers.lock().unwrap().insert(
                container_id.clone(),
                ManagedContainer { container_id: container_id.clone(), mission_id: Some(opts.mission_id) },
            );
            Ok(CreatedSandbox { container_id })
        }

        async fn exec(&self, _container_id: &str, _argv: &[String]) -> CoreResult<ExecSession> {
            let (tx, rx) = mpsc::channel(8);
            let code = self.exec_exit_code;
            tokio::spawn(async move {
                let _ = tx
                    .send(ProcessEvent::Output { stream: OutputStream::Stdout, data: "ok".into() })
                    .await;
                let _ = tx.send(ProcessEvent::Exit { code: Some(code), signal: None }).await;
            });
            Ok(ExecSession { events: rx })
        }

        async fn attach_logs(&self, _container_id: &str) -> CoreResult<mpsc::Receiver<ProcessEvent>> {
            let (tx, rx) = mpsc::channel(8);
            tokio::spawn(async move {
                let _ = tx.send(ProcessEvent::Exit { code: None, signal: None }).await;
            });
            Ok(rx)
        }

        async fn stop(&self, _container_id: &str, _grace_seconds: u64) -> CoreResult<()> {
            Ok(())
        }

        async fn remove(&self, container_id: &str, _force: bool) -> CoreResult<()> {
            self.containers.lock().unwrap().remove(container_id);
            Ok(())
        }

        async fn inspect(&self, container_id: &str) -> CoreResult<ContainerState> {
            if self.containers.lock().unwrap().contains_key(container_id) {
                Ok(ContainerState { running: true, exit_code: None })
            } else {
                Err(SandboxError::NotFound(container_id.to_string()).into())
            }
        }

        async fn kill(&self, _container_id: &str, _signal: &str) -> CoreResult<()> {
            Ok(())
        }

        async fn list_managed(&self) -> CoreResult<Vec<ManagedContainer>> {
            Ok(self.containers.lock().unwrap().values().cloned().collect())
        }

        async fn list_for_mission(&self, mission_id: &str) -> CoreResult<Vec<ManagedContainer>> {
            Ok(self
                .containers
                .lock()
                .unwrap()
                .values()
                .filter(|c| c.mission_id.as_deref() == Some(mission_id))
                .cloned()
                .collect())
        }

        async fn ping(&self) -> CoreResult<()> {
            Ok(())
        }

        async fn pull_if_needed(&self, _image: &str) -> CoreResult<()> {
            Ok(())
        }

        async fn cleanup(&self) {
            self.containers.lock().unwrap().clear();
        }
    }
}
