use std::collections::BTreeMap;
use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use parking_lot::Mutex;
use tokio::io::{AsyncRead, AsyncReadExt};
use tokio::process::Command;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::config::{RuntimeKind, SandboxConfig};
use crate::error::{FleetError, Result};
use crate::protocol::{
    JobRequest, JobResponse, NetworkPolicy, RunStatus, Truncated, NON_PROCESS_EXIT_CODE,
    PROTOCOL_VERSION,
};

/// Env keys with this prefix belong to the executor and cannot be set by a job.
pub const RESERVED_ENV_PREFIX: &str = "FLEET_";

const MIN_TIMEOUT: Duration = Duration::from_secs(1);
/// Shared bound on draining both pipes once the outcome is known.
const DRAIN_GRACE: Duration = Duration::from_secs(2);
const RUNTIME_CMD_TIMEOUT: Duration = Duration::from_secs(10);

/// Worst-case time spent after a job's timeout fires: pipe drain plus forced removal.
pub const TEARDOWN_BUDGET: Duration = DRAIN_GRACE.saturating_add(RUNTIME_CMD_TIMEOUT);

/// Bytes captured from one output stream.
#[derive(Debug, Default)]
struct Capture {
    buf: Vec<u8>,
    truncated: bool,
}

impl Capture {
    fn push(&mut self, chunk: &[u8], cap: usize) {
        let room = cap.saturating_sub(self.buf.len());
        if chunk.len() > room {
            self.truncated = true;
        }
        self.buf.extend_from_slice(&chunk[..chunk.len().min(room)]);
    }

    /// Decoded text plus the truncation flag. Invalid UTF-8 becomes U+FFFD,
    /// which can push the text past `cap`; trimming it back counts as truncation.
    fn into_text(self, cap: usize) -> (String, bool) {
        let (text, trimmed) = capped_text(&self.buf, cap);
        (text, self.truncated || trimmed)
    }
}

/// Lossy UTF-8 decode that never exceeds `cap` bytes or splits a character.
/// The flag is set when decoded text had to be cut.
fn capped_text(bytes: &[u8], cap: usize) -> (String, bool) {
    let mut text = String::from_utf8_lossy(bytes).into_owned();
    if text.len() <= cap {
        return (text, false);
    }
    let mut end = cap;
    while !text.is_char_boundary(end) {
        end -= 1;
    }
    text.truncate(end);
    (text, true)
}

/// Drains `reader` to EOF, keeping at most `cap` bytes.
fn spawn_capture<R>(mut reader: R, cap: usize, sink: Arc<Mutex<Capture>>) -> JoinHandle<()>
where
    R: AsyncRead + Unpin + Send + 'static,
{
    tokio::spawn(async move {
        let mut chunk = vec![0u8; 8192];
        loop {
            match reader.read(&mut chunk).await {
                Ok(0) => break,
                Ok(n) => sink.lock().push(&chunk[..n], cap),
                Err(e) => {
                    tracing::debug!(error = %e, "Output stream read failed");
                    break;
                }
            }
        }
    })
}

/// SIGKILL to the group led by `pid`; a group that is already gone is fine.
#[cfg(unix)]
fn kill_process_group(pid: u32) {
    use nix::sys::signal::{killpg, Signal};
    use nix::unistd::Pid;

    let Ok(raw) = i32::try_from(pid) else {
        return;
    };
    if let Err(e) = killpg(Pid::from_raw(raw), Signal::SIGKILL) {
        if e != nix::errno::Errno::ESRCH {
            tracing::debug!(pid, error = %e, "Process group kill failed");
        }
    }
}

#[cfg(not(unix))]
fn kill_process_group(_pid: u32) {}

enum Outcome {
    Exited(std::io::Result<std::process::ExitStatus>),
    TimedOut,
    Cancelled,
}

/// Executes job requests in container sandboxes.
///
/// Every container runs with:
/// - `--network=none` unless the job asks for `restricted` and a network is configured
/// - all capabilities dropped and no privilege escalation (when `harden` is set)
/// - memory and CPU limits
/// - task and job labels, and a predictable name so it can be force-removed
#[derive(Debug, Clone)]
pub struct SandboxExecutor {
    config: SandboxConfig,
}

impl SandboxExecutor {
    pub fn new(config: SandboxConfig) -> Self {
        if config.runtime == RuntimeKind::Direct {
            tracing::warn!("Direct runtime: jobs run on the host without container isolation");
        }
        Self { config }
    }

    pub fn config(&self) -> &SandboxConfig {
        &self.config
    }

    /// `0` means the configured default; never below one second.
    pub fn effective_timeout(&self, requested_secs: u64) -> Duration {
        let timeout = if requested_secs == 0 {
            self.config.default_timeout
        } else {
            Duration::from_secs(requested_secs)
        };
        timeout.max(MIN_TIMEOUT)
    }

    pub fn container_name(request: &JobRequest) -> String {
        format!("fleet-job-{}", request.job_id)
    }

    /// Job env with reserved keys dropped and the task context injected.
    pub fn sandbox_env(request: &JobRequest) -> BTreeMap<String, String> {
        let mut env: BTreeMap<String, String> = request
            .sandbox
            .env
            .iter()
            .filter(|(key, _)| {
                !key.is_empty()
                    && !key.contains('=')
                    && !key.to_ascii_uppercase().starts_with(RESERVED_ENV_PREFIX)
            })
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect();
        env.insert("FLEET_TASK_ID".to_string(), request.task_id.to_string());
        env.insert("FLEET_JOB_ID".to_string(), request.job_id.to_string());
        env
    }

    fn network(&self, policy: NetworkPolicy) -> &str {
        match (policy, self.config.restricted_network.as_deref()) {
            (NetworkPolicy::Restricted, Some(network)) => network,
            _ => "none",
        }
    }

    /// Arguments passed to the container runtime for `request`.
    pub fn container_args(&self, request: &JobRequest) -> Vec<String> {
        let mut args = vec![
            "run".to_string(),
            "--rm".to_string(),
            format!("--name={}", Self::container_name(request)),
            format!("--network={}", self.network(request.sandbox.network_policy)),
        ];

        if self.config.harden {
            args.push("--cap-drop=ALL".to_string());
            args.push("--security-opt=no-new-privileges".to_string());
        }
        if let Some(ref limit) = self.config.memory_limit {
            args.push(format!("--memory={limit}"));
        }
        if let Some(ref limit) = self.config.cpu_limit {
            args.push(format!("--cpus={limit}"));
        }

        args.push(format!("--label=fleet.task_id={}", request.task_id));
        args.push(format!("--label=fleet.job_id={}", request.job_id));
        for (key, value) in Self::sandbox_env(request) {
            args.push("-e".to_string());
            args.push(format!("{key}={value}"));
        }

        let image = if request.sandbox.image.trim().is_empty() {
            self.config.default_image.clone()
        } else {
            request.sandbox.image.clone()
        };
        args.push(image);
        args.extend(request.sandbox.command.iter().cloned());
        args
    }

    fn command(&self, request: &JobRequest) -> Command {
        let mut cmd = match self.config.runtime_binary() {
            Some(binary) => {
                let mut cmd = Command::new(binary);
                cmd.args(self.container_args(request));
                cmd
            }
            None => {
                let (program, args) = request
                    .sandbox
                    .command
                    .split_first()
                    .map(|(p, rest)| (p.as_str(), rest))
                    .unwrap_or(("", &[]));
                let mut cmd = Command::new(program);
                cmd.args(args).envs(Self::sandbox_env(request));
                cmd
            }
        };
        cmd.stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        #[cfg(unix)]
        cmd.process_group(0);
        cmd
    }

    /// Runs one job to completion, timeout, or cancellation.
    ///
    /// Never fails: invocation problems are reported as a `failed` response
    /// with exit code -1.
    pub async fn execute(&self, request: &JobRequest, cancel: CancellationToken) -> JobResponse {
        let started_at = Utc::now();
        let timeout = self.effective_timeout(request.sandbox.timeout_seconds);
        let cap = self.config.max_output_bytes;
        tracing::info!(
            job_id = %request.job_id,
            task_id = %request.task_id,
            runtime = %self.config.runtime,
            image = %request.sandbox.image_or_default(),
            timeout_secs = timeout.as_secs(),
            "Executing job"
        );

        let mut child = match self.command(request).spawn() {
            Ok(child) => child,
            Err(e) => {
                tracing::error!(job_id = %request.job_id, error = %e, "Failed to start sandbox");
                return JobResponse::synthetic_failure(
                    request.task_id,
                    request.job_id,
                    format!("failed to start {}: {e}", self.config.runtime),
                    started_at,
                    Utc::now(),
                );
            }
        };

        let stdout = Arc::new(Mutex::new(Capture::default()));
        let stderr = Arc::new(Mutex::new(Capture::default()));
        let mut readers = Vec::with_capacity(2);
        if let Some(pipe) = child.stdout.take() {
            readers.push(spawn_capture(pipe, cap, stdout.clone()));
        }
        if let Some(pipe) = child.stderr.take() {
            readers.push(spawn_capture(pipe, cap, stderr.clone()));
        }

        let pid = child.id();
        let outcome = tokio::select! {
            status = child.wait() => Outcome::Exited(status),
            _ = tokio::time::sleep(timeout) => Outcome::TimedOut,
            _ = cancel.cancelled() => Outcome::Cancelled,
        };
        let ended_at = Utc::now();

        // The job's whole process group goes with it, so no orphan keeps the pipes open.
        if let Some(pid) = pid {
            kill_process_group(pid);
        }
        if !matches!(outcome, Outcome::Exited(_)) {
            if let Err(e) = child.start_kill() {
                tracing::debug!(job_id = %request.job_id, error = %e, "Kill after deadline failed");
            }
            let _ = child.wait().await;
        }

        let drained = tokio::time::timeout(DRAIN_GRACE, async {
            for reader in readers.iter_mut() {
                let _ = reader.await;
            }
        })
        .await;
        if drained.is_err() {
            tracing::warn!(job_id = %request.job_id, "Output pipes still open after kill");
            for reader in &readers {
                reader.abort();
            }
        }

        if !matches!(outcome, Outcome::Exited(_)) {
            self.force_remove(request).await;
        }

        let (stdout, stdout_truncated) = std::mem::take(&mut *stdout.lock()).into_text(cap);
        let (mut stderr, mut stderr_truncated) =
            std::mem::take(&mut *stderr.lock()).into_text(cap);

        let (status, exit_code) = match outcome {
            Outcome::Exited(Ok(exit)) => match exit.code() {
                Some(0) => (RunStatus::Completed, 0),
                Some(code) => (RunStatus::Failed, code),
                None => (RunStatus::Failed, NON_PROCESS_EXIT_CODE),
            },
            Outcome::Exited(Err(e)) => {
                (stderr, stderr_truncated) =
                    capped_text(format!("wait for sandbox: {e}").as_bytes(), cap);
                (RunStatus::Failed, NON_PROCESS_EXIT_CODE)
            }
            Outcome::TimedOut => (RunStatus::Timeout, NON_PROCESS_EXIT_CODE),
            Outcome::Cancelled => (RunStatus::Failed, NON_PROCESS_EXIT_CODE),
        };

        tracing::info!(
            job_id = %request.job_id,
            status = %status,
            exit_code,
            stdout_truncated,
            stderr_truncated,
            elapsed_ms = (ended_at - started_at).num_milliseconds(),
            "Job finished"
        );

        JobResponse {
            version: PROTOCOL_VERSION,
            task_id: request.task_id,
            job_id: request.job_id,
            status,
            exit_code,
            stdout,
            stderr,
            started_at,
            ended_at,
            truncated: Truncated {
                stdout: stdout_truncated,
                stderr: stderr_truncated,
            },
        }
    }

    /// Removes a container left behind by a killed runtime client.
    async fn force_remove(&self, request: &JobRequest) {
        let Some(binary) = self.config.runtime_binary() else {
            return;
        };
        let name = Self::container_name(request);
        let removal = Command::new(binary)
            .args(["rm", "-f", &name])
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .kill_on_drop(true)
            .status();
        match tokio::time::timeout(RUNTIME_CMD_TIMEOUT, removal).await {
            Ok(Ok(_)) => tracing::debug!(container = %name, "Container removed"),
            Ok(Err(e)) => tracing::warn!(container = %name, error = %e, "Container removal failed"),
            Err(_) => tracing::warn!(container = %name, "Container removal timed out"),
        }
    }

    /// Checks that the container runtime answers `info`.
    pub async fn readiness(&self) -> Result<()> {
        if self.config.runtime == RuntimeKind::Direct {
            return Ok(());
        }
        let binary = self
            .config
            .runtime_binary()
            .ok_or_else(|| FleetError::Executor("no runtime binary configured".to_string()))?;
        let info = Command::new(binary)
            .arg("info")
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .kill_on_drop(true)
            .status();
        match tokio::time::timeout(RUNTIME_CMD_TIMEOUT, info).await {
            Ok(Ok(status)) if status.success() => Ok(()),
            Ok(Ok(status)) => Err(FleetError::Executor(format!(
                "{binary} info exited with {status}"
            ))),
            Ok(Err(e)) => Err(FleetError::Executor(format!("{binary} info: {e}"))),
            Err(_) => Err(FleetError::Executor(format!("{binary} info timed out"))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::SandboxSpec;
    use uuid::Uuid;

    fn request(env: &[(&str, &str)]) -> JobRequest {
        let mut sandbox = SandboxSpec::shell("echo hi");
        sandbox.env = env
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        JobRequest::new(Uuid::new_v4(), Uuid::new_v4(), sandbox)
    }

    #[test]
    fn capture_keeps_prefix_and_flags_overflow() {
        let mut capture = Capture::default();
        capture.push(b"hello", 8);
        capture.push(b" world", 8);
        assert_eq!(capture.buf, b"hello wo");
        assert!(capture.truncated);

        let mut exact = Capture::default();
        exact.push(b"12345678", 8);
        assert!(!exact.truncated);
    }

    #[test]
    fn capped_text_respects_char_boundaries() {
        assert_eq!(capped_text("héllo".as_bytes(), 2), ("h".to_string(), true));
        let (lossy, trimmed) = capped_text(&[b'a', 0xff, b'b'], 10);
        assert_eq!(lossy, "a\u{fffd}b");
        assert!(!trimmed);
    }

    #[test]
    fn invalid_utf8_that_grows_past_cap_is_flagged() {
        let mut capture = Capture::default();
        capture.push(&[0xff; 8], 8);
        assert!(!capture.truncated);
        let (text, truncated) = capture.into_text(8);
        assert_eq!(text, "\u{fffd}\u{fffd}");
        assert!(truncated);
    }

    #[test]
    fn timeout_defaults_and_floor() {
        let executor = SandboxExecutor::new(SandboxConfig {
            default_timeout: Duration::from_secs(42),
            ..SandboxConfig::direct()
        });
        assert_eq!(executor.effective_timeout(0), Duration::from_secs(42));
        assert_eq!(executor.effective_timeout(7), Duration::from_secs(7));

        let tiny = SandboxExecutor::new(SandboxConfig {
            default_timeout: Duration::from_millis(10),
            ..SandboxConfig::direct()
        });
        assert_eq!(tiny.effective_timeout(0), MIN_TIMEOUT);
    }

    #[test]
    fn reserved_env_cannot_be_overridden() {
        let req = request(&[("FLEET_JOB_ID", "spoofed"), ("fleet_task_id", "x"), ("A", "1")]);
        let env = SandboxExecutor::sandbox_env(&req);
        assert_eq!(env["FLEET_JOB_ID"], req.job_id.to_string());
        assert_eq!(env["FLEET_TASK_ID"], req.task_id.to_string());
        assert_eq!(env["A"], "1");
        assert!(!env.contains_key("fleet_task_id"));
    }

    #[test]
    fn container_args_isolate_network_by_default() {
        let executor = SandboxExecutor::new(SandboxConfig::default());
        let mut req = request(&[("GREETING", "hi")]);
        req.sandbox.network_policy = NetworkPolicy::Restricted;
        let args = executor.container_args(&req);

        assert_eq!(&args[..2], ["run", "--rm"]);
        assert!(args.contains(&format!("--name=fleet-job-{}", req.job_id)));
        assert!(args.contains(&"--network=none".to_string()));
        assert!(args.contains(&"--cap-drop=ALL".to_string()));
        assert!(args.contains(&format!("--label=fleet.job_id={}", req.job_id)));
        assert!(args.contains(&"GREETING=hi".to_string()));
        assert_eq!(
            &args[args.len() - 4..],
            ["alpine:latest", "sh", "-c", "echo hi"]
        );
    }

    #[test]
    fn restricted_network_needs_configured_allow_list() {
        let executor = SandboxExecutor::new(SandboxConfig {
            restricted_network: Some("fleet-egress".to_string()),
            ..SandboxConfig::default()
        });
        let mut req = request(&[]);
        assert!(executor.container_args(&req).contains(&"--network=none".to_string()));
        req.sandbox.network_policy = NetworkPolicy::Restricted;
        assert!(executor
            .container_args(&req)
            .contains(&"--network=fleet-egress".to_string()));
    }

    #[tokio::test]
    async fn direct_runtime_is_always_ready() {
        let executor = SandboxExecutor::new(SandboxConfig::direct());
        assert!(executor.readiness().await.is_ok());
    }

    #[tokio::test]
    async fn missing_runtime_binary_is_not_ready() {
        let executor = SandboxExecutor::new(SandboxConfig {
            runtime_binary: Some("/nonexistent/fleet-runtime".to_string()),
            ..SandboxConfig::default()
        });
        assert!(matches!(
            executor.readiness().await,
            Err(FleetError::Executor(_))
        ));
    }
}
