use std::collections::BTreeMap;
use std::path::Path;
use std::process::Stdio;
use std::time::{Duration, Instant};

use tokio::io::{AsyncRead, AsyncReadExt};
use tokio::process::Command;
use tokio::task::JoinHandle;

use crate::sandbox::error::SandboxError;
use crate::sandbox::types::{ExecRequest, ExecResult};

/// Wraps `tokio::process::Command` with env filtering, output limits,
/// deadlines and process-group kill.
///
/// Every command runs as the leader of its own process group. When the
/// deadline passes the whole group gets SIGKILL, so grandchildren
/// (`python train.py &`, shell pipelines) die with it. The group is also
/// swept after a normal exit: nothing started by an action outlives it.
pub struct ProcessSupervisor {
    /// Environment variables to inherit from host (allowlist).
    pub env_allowlist: Vec<String>,
    /// Per-stream byte cap; the remainder is drained and dropped.
    pub max_output_bytes: usize,
    /// How long to wait for pipes to close once the group is dead.
    pub kill_grace: Duration,
}

#[derive(Debug, Default)]
struct Captured {
    bytes: Vec<u8>,
    truncated: bool,
}

impl ProcessSupervisor {
    pub fn new(env_allowlist: Vec<String>, max_output_bytes: usize, kill_grace: Duration) -> Self {
        Self {
            env_allowlist,
            max_output_bytes,
            kill_grace,
        }
    }

    /// Build a filtered env map: only allowlisted host vars + request vars.
    fn build_env(&self, extra: &BTreeMap<String, String>) -> Vec<(String, String)> {
        let mut env: Vec<(String, String)> = Vec::new();
        for key in &self.env_allowlist {
            if let Ok(val) = std::env::var(key) {
                env.push((key.clone(), val));
            }
        }
        for (k, v) in extra {
            env.push((k.clone(), v.clone()));
        }
        env
    }

    /// Run `argv` to completion or until `req.timeout`, capturing output.
    ///
    /// `req.command` is not interpreted here; callers fold it into `argv`
    /// (usually as the last argument of a shell invocation).
    pub async fn exec(
        &self,
        argv: &[String],
        req: &ExecRequest,
        working_dir: &Path,
    ) -> Result<ExecResult, SandboxError> {
        let Some((program, args)) = argv.split_first() else {
            return Err(SandboxError::Exec("empty command".into()));
        };

        let started_at = chrono::Utc::now().timestamp_millis();
        let env = self.build_env(&req.env);
        let cwd = match &req.cwd {
            Some(dir) => working_dir.join(dir.trim_start_matches('/')),
            None => working_dir.to_path_buf(),
        };

        let mut cmd = Command::new(program);
        cmd.args(args);
        cmd.current_dir(&cwd);
        cmd.env_clear();
        cmd.envs(env);
        cmd.stdin(Stdio::null());
        cmd.stdout(Stdio::piped());
        cmd.stderr(Stdio::piped());
        cmd.kill_on_drop(true);
        #[cfg(unix)]
        cmd.process_group(0);

        let start = Instant::now();
        let mut child = cmd
            .spawn()
            .map_err(|e| SandboxError::Exec(format!("spawn failed: {e}")))?;
        let mut group = GroupGuard(child.id());

        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| SandboxError::Exec("stdout not captured".into()))?;
        let stderr = child
            .stderr
            .take()
            .ok_or_else(|| SandboxError::Exec("stderr not captured".into()))?;
        let mut stdout_task = tokio::spawn(read_capped(stdout, self.max_output_bytes));
        let mut stderr_task = tokio::spawn(read_capped(stderr, self.max_output_bytes));

        let (timed_out, exit_code) = match tokio::time::timeout(req.timeout, child.wait()).await {
            Ok(Ok(status)) => (false, status.code()),
            Ok(Err(e)) => {
                group.kill();
                stdout_task.abort();
                stderr_task.abort();
                return Err(SandboxError::Exec(format!("wait failed: {e}")));
            }
            Err(_) => {
                tracing::warn!(
                    pid = ?group.0,
                    timeout_ms = req.timeout.as_millis() as u64,
                    "command exceeded deadline, killing process group"
                );
                group.kill();
                let _ = child.start_kill();
                let _ = tokio::time::timeout(self.kill_grace, child.wait()).await;
                (true, None)
            }
        };

        // Background jobs left in the group would hold the pipes open.
        group.kill();

        let stdout = join_reader(&mut stdout_task, self.kill_grace).await;
        let stderr = join_reader(&mut stderr_task, self.kill_grace).await;

        Ok(ExecResult {
            exit_code,
            stdout: stdout.bytes,
            stderr: stderr.bytes,
            output_truncated: stdout.truncated || stderr.truncated,
            timed_out,
            started_at_unix_ms: started_at,
            elapsed: start.elapsed(),
        })
    }
}

async fn read_capped<R>(mut reader: R, max_bytes: usize) -> Captured
where
    R: AsyncRead + Unpin,
{
    let mut captured = Captured::default();
    let mut chunk = [0u8; 8192];
    loop {
        match reader.read(&mut chunk).await {
            Ok(0) | Err(_) => break,
            Ok(n) => {
                let room = max_bytes.saturating_sub(captured.bytes.len());
                if n > room {
                    captured.truncated = true;
                }
                captured.bytes.extend_from_slice(&chunk[..n.min(room)]);
            }
        }
    }
    captured
}

/// Wait for a pipe reader, giving up after `grace` so a process that
/// escaped the group cannot stall the caller.
async fn join_reader(task: &mut JoinHandle<Captured>, grace: Duration) -> Captured {
    match tokio::time::timeout(grace, &mut *task).await {
        Ok(Ok(captured)) => captured,
        Ok(Err(_)) => Captured::default(),
        Err(_) => {
            task.abort();
            tracing::warn!("output reader did not finish within grace period");
            Captured {
                bytes: Vec::new(),
                truncated: true,
            }
        }
    }
}

/// Kills the command's process group at most once, including when the
/// exec future is dropped mid-flight.
struct GroupGuard(Option<u32>);

impl GroupGuard {
    fn kill(&mut self) {
        kill_process_group(self.0.take());
    }
}

impl Drop for GroupGuard {
    fn drop(&mut self) {
        self.kill();
    }
}

#[cfg(unix)]
fn kill_process_group(pid: Option<u32>) {
    let Some(pid) = pid else { return };
    let Ok(pgid) = libc::pid_t::try_from(pid) else {
        return;
    };
    // Negative pid addresses the group created by `process_group(0)`.
    let rc = unsafe { libc::kill(-pgid, libc::SIGKILL) };
    if rc != 0 {
        let err = std::io::Error::last_os_error();
        if err.raw_os_error() != Some(libc::ESRCH) {
            tracing::warn!(pgid, error = %err, "failed to kill process group");
        }
    }
}

#[cfg(not(unix))]
fn kill_process_group(pid: Option<u32>) {
    tracing::debug!(pid = ?pid, "process group kill not available on this platform");
}
