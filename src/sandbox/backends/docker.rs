use std::collections::BTreeMap;
use std::path::{Component, Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;

use crate::sandbox::error::SandboxError;
use crate::sandbox::handle::SandboxHandle;
use crate::sandbox::local_host::process_supervisor::ProcessSupervisor;
use crate::sandbox::provider::SandboxProvider;
use crate::sandbox::types::*;

const PROVISION_TIMEOUT: Duration = Duration::from_secs(10 * 60);
const CONTROL_TIMEOUT: Duration = Duration::from_secs(60);
/// Exit status of `timeout -s KILL` when the deadline fires (128 + SIGKILL).
const KILLED_BY_TIMEOUT: i32 = 137;

type LiveRegistry = Arc<Mutex<BTreeMap<SandboxId, String>>>;

/// Container-backed sandboxes driven through the `docker` CLI.
///
/// Each sandbox is a detached container kept alive with `sleep infinity`;
/// commands go through `docker exec` wrapped in `timeout -s KILL`, which
/// kills the command's whole process group inside the container. The host
/// side enforces the same deadline plus a grace period as a backstop.
pub struct DockerProvider {
    config: DockerConfig,
    counter: AtomicU64,
    live: LiveRegistry,
    cli: Arc<ProcessSupervisor>,
}

impl DockerProvider {
    pub fn new(config: DockerConfig) -> Result<Self, SandboxError> {
        let cli = ProcessSupervisor::new(
            vec![
                "PATH".into(),
                "HOME".into(),
                "DOCKER_HOST".into(),
                "DOCKER_CONFIG".into(),
                "DOCKER_CONTEXT".into(),
            ],
            config.max_output_bytes,
            config.kill_grace,
        );
        Ok(Self {
            config,
            counter: AtomicU64::new(0),
            live: Arc::new(Mutex::new(BTreeMap::new())),
            cli: Arc::new(cli),
        })
    }

    fn run_args(&self, spec: &SandboxSpec, name: &str) -> Vec<String> {
        let mut args = vec![
            self.config.docker_bin.clone(),
            "run".into(),
            "-d".into(),
            "--name".into(),
            name.into(),
            "--label".into(),
            format!("expgym.workspace={}", spec.workspace_id),
            "-w".into(),
            self.config.workdir.clone(),
            "--network".into(),
            spec.network.docker_arg().into(),
        ];
        for (k, v) in &spec.labels {
            args.push("--label".into());
            args.push(format!("{k}={v}"));
        }
        if let Some(cpus) = spec.resources.cpus {
            args.push("--cpus".into());
            args.push(cpus.to_string());
        }
        if let Some(mem) = spec.resources.memory_mb {
            args.push("--memory".into());
            args.push(format!("{mem}m"));
        }
        if let Some(gpus) = &spec.resources.gpus {
            args.push("--gpus".into());
            args.push(gpus.clone());
        }
        for (k, v) in &spec.env {
            args.push("-e".into());
            args.push(format!("{k}={v}"));
        }
        for mount in &spec.mounts {
            args.push("-v".into());
            let mut binding = format!("{}:{}", mount.host_path.display(), mount.guest_path);
            if mount.read_only {
                binding.push_str(":ro");
            }
            args.push(binding);
        }
        let image = spec
            .image
            .clone()
            .unwrap_or_else(|| self.config.default_image.clone());
        args.extend([image, "sleep".into(), "infinity".into()]);
        args
    }

    async fn docker(&self, args: Vec<String>, timeout: Duration) -> Result<ExecResult, SandboxError> {
        let req = ExecRequest::new(String::new(), timeout);
        self.cli.exec(&args, &req, Path::new(".")).await
    }
}

#[async_trait]
impl SandboxProvider for DockerProvider {
    fn kind(&self) -> SandboxBackendKind {
        SandboxBackendKind::Docker
    }

    async fn acquire(&self, spec: SandboxSpec) -> Result<Box<dyn SandboxHandle>, SandboxError> {
        let seq = self.counter.fetch_add(1, Ordering::SeqCst);
        let name = container_name(&spec.workspace_id, seq);

        tracing::info!(
            container = %name,
            image = spec.image.as_deref().unwrap_or(&self.config.default_image),
            gpus = spec.resources.gpus.as_deref().unwrap_or("none"),
            "acquiring docker sandbox"
        );

        let run = self
            .docker(self.run_args(&spec, &name), PROVISION_TIMEOUT)
            .await
            .map_err(|e| SandboxError::Provision(e.to_string()))?;
        if run.timed_out || run.exit_code != Some(0) {
            // `docker run` can fail after the container was created.
            let _ = self
                .docker(rm_args(&self.config.docker_bin, &name), CONTROL_TIMEOUT)
                .await;
            return Err(SandboxError::Provision(format!(
                "docker run failed (code {:?}): {}",
                run.exit_code,
                String::from_utf8_lossy(&run.stderr).trim()
            )));
        }

        let check = self
            .docker(timeout_check_args(&self.config.docker_bin, &name), CONTROL_TIMEOUT)
            .await
            .map_err(|e| SandboxError::Provision(e.to_string()));
        if let Err(e) = check.and_then(|result| check_timeout_support(&result)) {
            let _ = self
                .docker(rm_args(&self.config.docker_bin, &name), CONTROL_TIMEOUT)
                .await;
            return Err(e);
        }

        lock_registry(&self.live).insert(name.clone(), spec.workspace_id.clone());

        let metadata = SandboxMetadata {
            workspace_id: spec.workspace_id.clone(),
            created_at_unix_ms: chrono::Utc::now().timestamp_millis(),
            labels: spec.labels.clone(),
        };

        Ok(Box::new(DockerHandle {
            name,
            config: self.config.clone(),
            cli: Arc::clone(&self.cli),
            metadata,
            released: AtomicBool::new(false),
            live: Arc::clone(&self.live),
        }))
    }

    async fn list(&self) -> Result<Vec<SandboxSummary>, SandboxError> {
        Ok(lock_registry(&self.live)
            .iter()
            .map(|(id, workspace_id)| SandboxSummary {
                id: id.clone(),
                backend: SandboxBackendKind::Docker,
                workspace_id: workspace_id.clone(),
            })
            .collect())
    }

    fn live_count(&self) -> usize {
        lock_registry(&self.live).len()
    }
}

struct DockerHandle {
    name: String,
    config: DockerConfig,
    cli: Arc<ProcessSupervisor>,
    metadata: SandboxMetadata,
    released: AtomicBool,
    live: LiveRegistry,
}

impl DockerHandle {
    fn ensure_live(&self) -> Result<(), SandboxError> {
        if self.released.load(Ordering::SeqCst) {
            return Err(SandboxError::Released(self.name.clone()));
        }
        Ok(())
    }

    async fn docker(&self, args: Vec<String>, timeout: Duration) -> Result<ExecResult, SandboxError> {
        let req = ExecRequest::new(String::new(), timeout);
        self.cli.exec(&args, &req, Path::new(".")).await
    }

    /// Run a docker CLI command that must succeed.
    async fn docker_ok(&self, args: Vec<String>) -> Result<(), SandboxError> {
        let result = self.docker(args, CONTROL_TIMEOUT).await?;
        if result.exit_code == Some(0) {
            return Ok(());
        }
        Err(classify_cli_failure(&result))
    }

    fn container_path(&self, guest_path: &str) -> Result<String, SandboxError> {
        normalize_guest(&self.config.workdir, guest_path)
    }

    fn exec_args(&self, req: &ExecRequest) -> Vec<String> {
        let cwd = match &req.cwd {
            Some(dir) => normalize_guest(&self.config.workdir, dir)
                .unwrap_or_else(|_| self.config.workdir.clone()),
            None => self.config.workdir.clone(),
        };
        let mut args = vec![
            self.config.docker_bin.clone(),
            "exec".into(),
            "-w".into(),
            cwd,
        ];
        for (k, v) in &req.env {
            args.push("-e".into());
            args.push(format!("{k}={v}"));
        }
        args.extend([
            self.name.clone(),
            "timeout".into(),
            "-s".into(),
            "KILL".into(),
            format!("{:.3}s", req.timeout.as_secs_f64()),
            self.config.shell.clone(),
            "-lc".into(),
            req.command.clone(),
        ]);
        args
    }

    fn scratch_path(&self) -> PathBuf {
        std::env::temp_dir().join(format!("expgym-{}-{}", self.name, uuid::Uuid::new_v4()))
    }
}

#[async_trait]
impl SandboxHandle for DockerHandle {
    fn id(&self) -> &str {
        &self.name
    }

    fn backend_kind(&self) -> SandboxBackendKind {
        SandboxBackendKind::Docker
    }

    fn metadata(&self) -> &SandboxMetadata {
        &self.metadata
    }

    async fn execute(&self, req: ExecRequest) -> Result<ExecResult, SandboxError> {
        self.ensure_live()?;
        tracing::debug!(
            container = %self.name,
            command = %req.command,
            timeout_ms = req.timeout.as_millis() as u64,
            "executing command in docker sandbox"
        );
        let args = self.exec_args(&req);
        let host_deadline = req.timeout.saturating_add(self.config.kill_grace);
        let mut result = self.docker(args, host_deadline).await?;

        let killed_in_container =
            result.exit_code == Some(KILLED_BY_TIMEOUT) && result.elapsed >= req.timeout;
        if killed_in_container || result.timed_out {
            result.timed_out = true;
            result.exit_code = None;
        }
        Ok(result)
    }

    async fn copy_in(&self, host_path: &Path, guest_path: &str) -> Result<(), SandboxError> {
        self.ensure_live()?;
        let meta = std::fs::metadata(host_path)?;
        let target = self.container_path(guest_path)?;
        let parent = if meta.is_dir() {
            target.clone()
        } else {
            parent_of(&target)
        };
        self.docker_ok(vec![
            self.config.docker_bin.clone(),
            "exec".into(),
            self.name.clone(),
            "mkdir".into(),
            "-p".into(),
            parent,
        ])
        .await?;

        // `src/.` copies directory contents rather than nesting the directory.
        let source = if meta.is_dir() {
            format!("{}/.", host_path.display())
        } else {
            host_path.display().to_string()
        };
        self.docker_ok(vec![
            self.config.docker_bin.clone(),
            "cp".into(),
            source,
            format!("{}:{}", self.name, target),
        ])
        .await
    }

    async fn copy_out(&self, guest_path: &str, host_path: &Path) -> Result<(), SandboxError> {
        self.ensure_live()?;
        let source = self.container_path(guest_path)?;
        if let Some(parent) = host_path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        self.docker_ok(vec![
            self.config.docker_bin.clone(),
            "cp".into(),
            format!("{}:{}", self.name, source),
            host_path.display().to_string(),
        ])
        .await
    }

    async fn write_file(&self, guest_path: &str, bytes: &[u8]) -> Result<(), SandboxError> {
        self.ensure_live()?;
        let scratch = self.scratch_path();
        std::fs::write(&scratch, bytes)?;
        let result = self.copy_in(&scratch, guest_path).await;
        let _ = std::fs::remove_file(&scratch);
        result
    }

    async fn read_file(&self, guest_path: &str) -> Result<Vec<u8>, SandboxError> {
        self.ensure_live()?;
        let scratch = self.scratch_path();
        self.copy_out(guest_path, &scratch).await?;
        let bytes = std::fs::read(&scratch);
        let _ = std::fs::remove_file(&scratch);
        Ok(bytes?)
    }

    async fn release(&self) -> Result<(), SandboxError> {
        if self.released.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        tracing::info!(container = %self.name, "releasing docker sandbox");
        let result = self
            .docker(rm_args(&self.config.docker_bin, &self.name), CONTROL_TIMEOUT)
            .await;
        let gone = match &result {
            Ok(r) => {
                r.exit_code == Some(0)
                    || String::from_utf8_lossy(&r.stderr).contains("No such container")
            }
            Err(_) => false,
        };
        if !gone {
            self.released.store(false, Ordering::SeqCst);
            return Err(match result {
                Ok(r) => classify_cli_failure(&r),
                Err(e) => e,
            });
        }
        lock_registry(&self.live).remove(&self.name);
        Ok(())
    }
}

fn lock_registry(
    live: &LiveRegistry,
) -> std::sync::MutexGuard<'_, BTreeMap<SandboxId, String>> {
    live.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

fn rm_args(docker_bin: &str, name: &str) -> Vec<String> {
    vec![docker_bin.into(), "rm".into(), "-f".into(), name.into()]
}

/// Step deadlines rely on coreutils `timeout` inside the image.
fn timeout_check_args(docker_bin: &str, name: &str) -> Vec<String> {
    [docker_bin, "exec", name, "timeout", "-s", "KILL", "5s", "true"]
        .map(String::from)
        .to_vec()
}

fn check_timeout_support(result: &ExecResult) -> Result<(), SandboxError> {
    if result.exit_code == Some(0) {
        return Ok(());
    }
    Err(SandboxError::Provision(format!(
        "image has no working `timeout` command (coreutils is required to enforce step deadlines): exit {:?}: {}",
        result.exit_code,
        String::from_utf8_lossy(&result.stderr).trim()
    )))
}

fn container_name(workspace_id: &str, seq: u64) -> String {
    let safe: String = workspace_id
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() || c == '-' || c == '_' { c } else { '-' })
        .collect();
    format!("expgym-{safe}-{seq}")
}

/// Map a guest path onto an absolute container path under `workdir`,
/// rejecting `..` escapes.
fn normalize_guest(workdir: &str, guest_path: &str) -> Result<String, SandboxError> {
    let guest = Path::new(guest_path);
    let relative = guest.strip_prefix("/").unwrap_or(guest);
    let mut normalized = PathBuf::new();
    for component in relative.components() {
        match component {
            Component::Normal(seg) => normalized.push(seg),
            Component::ParentDir => {
                if !normalized.pop() {
                    return Err(SandboxError::PathEscape(guest_path.to_string()));
                }
            }
            _ => {}
        }
    }
    let joined = Path::new(workdir).join(normalized);
    Ok(joined.to_string_lossy().trim_end_matches('/').to_string())
}

fn parent_of(container_path: &str) -> String {
    Path::new(container_path)
        .parent()
        .map(|p| p.to_string_lossy().to_string())
        .filter(|p| !p.is_empty())
        .unwrap_or_else(|| "/".into())
}

fn classify_cli_failure(result: &ExecResult) -> SandboxError {
    let stderr = String::from_utf8_lossy(&result.stderr).trim().to_string();
    if stderr.contains("No such container") || stderr.contains("is not running") {
        SandboxError::Backend(stderr)
    } else if stderr.contains("Could not find the file") || stderr.contains("No such file") {
        SandboxError::Io(std::io::Error::new(std::io::ErrorKind::NotFound, stderr))
    } else if result.timed_out {
        SandboxError::Backend("docker cli timed out".into())
    } else {
        SandboxError::Backend(format!("docker exited with {:?}: {stderr}", result.exit_code))
    }
}
