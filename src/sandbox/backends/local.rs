use std::collections::BTreeMap;
use std::path::Path;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;

use crate::sandbox::error::SandboxError;
use crate::sandbox::handle::SandboxHandle;
use crate::sandbox::local_host::fs_jail::FsJail;
use crate::sandbox::local_host::process_supervisor::ProcessSupervisor;
use crate::sandbox::provider::SandboxProvider;
use crate::sandbox::types::*;

type LiveRegistry = Arc<Mutex<BTreeMap<SandboxId, String>>>;

/// Best-effort host isolation provider.
///
/// Each sandbox gets its own workspace directory under `config.root_dir`
/// and every command runs in its own process group with a filtered env.
/// NOT a security boundary; use the docker backend for untrusted code.
pub struct LocalProcessProvider {
    config: LocalConfig,
    counter: AtomicU64,
    live: LiveRegistry,
}

impl LocalProcessProvider {
    pub fn new(config: LocalConfig) -> Result<Self, SandboxError> {
        std::fs::create_dir_all(&config.root_dir).map_err(|e| {
            SandboxError::Provision(format!(
                "failed to create sandboxes root {}: {e}",
                config.root_dir.display()
            ))
        })?;
        Ok(Self {
            config,
            counter: AtomicU64::new(0),
            live: Arc::new(Mutex::new(BTreeMap::new())),
        })
    }
}

#[async_trait]
impl SandboxProvider for LocalProcessProvider {
    fn kind(&self) -> SandboxBackendKind {
        SandboxBackendKind::LocalProcess
    }

    async fn acquire(&self, spec: SandboxSpec) -> Result<Box<dyn SandboxHandle>, SandboxError> {
        check_host_resources(&spec)?;

        let seq = self.counter.fetch_add(1, Ordering::SeqCst);
        let sandbox_id = format!("local-{}-{seq}", spec.workspace_id);
        let workspace_dir = self.config.root_dir.join(&spec.workspace_id);

        tracing::info!(
            sandbox_id = %sandbox_id,
            workspace_dir = %workspace_dir.display(),
            "acquiring local sandbox"
        );

        let jail = FsJail::create(workspace_dir)?;
        if let Err(e) = link_mounts(&jail, &spec.mounts) {
            // Partial workspace must not outlive the failed acquire.
            let _ = jail.destroy();
            return Err(e);
        }

        let supervisor = ProcessSupervisor::new(
            self.config.inherit_env_allowlist.clone(),
            self.config.max_output_bytes,
            self.config.kill_grace,
        );

        let metadata = SandboxMetadata {
            workspace_id: spec.workspace_id.clone(),
            created_at_unix_ms: chrono::Utc::now().timestamp_millis(),
            labels: spec.labels.clone(),
        };

        lock_registry(&self.live).insert(sandbox_id.clone(), spec.workspace_id.clone());

        Ok(Box::new(LocalHandle {
            id: sandbox_id,
            jail,
            supervisor,
            metadata,
            env: spec.env,
            shell: self.config.default_shell.clone(),
            released: AtomicBool::new(false),
            live: Arc::clone(&self.live),
        }))
    }

    async fn list(&self) -> Result<Vec<SandboxSummary>, SandboxError> {
        Ok(lock_registry(&self.live)
            .iter()
            .map(|(id, workspace_id)| SandboxSummary {
                id: id.clone(),
                backend: SandboxBackendKind::LocalProcess,
                workspace_id: workspace_id.clone(),
            })
            .collect())
    }

    fn live_count(&self) -> usize {
        lock_registry(&self.live).len()
    }
}

struct LocalHandle {
    id: String,
    jail: FsJail,
    supervisor: ProcessSupervisor,
    metadata: SandboxMetadata,
    /// Per-sandbox env vars (from SandboxSpec.env).
    env: BTreeMap<String, String>,
    shell: Vec<String>,
    released: AtomicBool,
    live: LiveRegistry,
}

impl LocalHandle {
    fn ensure_live(&self) -> Result<(), SandboxError> {
        if self.released.load(Ordering::SeqCst) {
            return Err(SandboxError::Released(self.id.clone()));
        }
        Ok(())
    }
}

#[async_trait]
impl SandboxHandle for LocalHandle {
    fn id(&self) -> &str {
        &self.id
    }

    fn backend_kind(&self) -> SandboxBackendKind {
        SandboxBackendKind::LocalProcess
    }

    fn metadata(&self) -> &SandboxMetadata {
        &self.metadata
    }

    async fn execute(&self, mut req: ExecRequest) -> Result<ExecResult, SandboxError> {
        self.ensure_live()?;
        tracing::debug!(
            sandbox_id = %self.id,
            command = %req.command,
            timeout_ms = req.timeout.as_millis() as u64,
            "executing command in local sandbox"
        );
        for (k, v) in &self.env {
            req.env.entry(k.clone()).or_insert_with(|| v.clone());
        }
        let mut argv = self.shell.clone();
        argv.push(req.command.clone());
        self.supervisor.exec(&argv, &req, self.jail.root()).await
    }

    async fn copy_in(&self, host_path: &Path, guest_path: &str) -> Result<(), SandboxError> {
        self.ensure_live()?;
        self.jail.copy_in(host_path, guest_path)
    }

    async fn copy_out(&self, guest_path: &str, host_path: &Path) -> Result<(), SandboxError> {
        self.ensure_live()?;
        self.jail.copy_out(guest_path, host_path)
    }

    async fn write_file(&self, guest_path: &str, bytes: &[u8]) -> Result<(), SandboxError> {
        self.ensure_live()?;
        self.jail.write_file(guest_path, bytes)
    }

    async fn read_file(&self, guest_path: &str) -> Result<Vec<u8>, SandboxError> {
        self.ensure_live()?;
        self.jail.read_file(guest_path)
    }

    async fn release(&self) -> Result<(), SandboxError> {
        if self.released.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        tracing::info!(sandbox_id = %self.id, "releasing local sandbox");
        if let Err(e) = self.jail.destroy() {
            // Leave it retryable.
            self.released.store(false, Ordering::SeqCst);
            return Err(e);
        }
        lock_registry(&self.live).remove(&self.id);
        Ok(())
    }
}

fn lock_registry(
    live: &LiveRegistry,
) -> std::sync::MutexGuard<'_, BTreeMap<SandboxId, String>> {
    live.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

/// Reject specs the host cannot honor before anything is created.
fn check_host_resources(spec: &SandboxSpec) -> Result<(), SandboxError> {
    if let Some(image) = &spec.image {
        tracing::debug!(image = %image, "local backend ignores container image");
    }
    if spec.resources.gpus.is_some() && which("nvidia-smi").is_none() {
        return Err(SandboxError::Provision(
            "GPU requested but nvidia-smi was not found on PATH".into(),
        ));
    }
    for mount in &spec.mounts {
        if !mount.host_path.exists() {
            return Err(SandboxError::Provision(format!(
                "mount source does not exist: {}",
                mount.host_path.display()
            )));
        }
    }
    Ok(())
}

/// Expose host paths inside the workspace as symlinks. Read-only mounts
/// cannot be enforced on this backend.
fn link_mounts(jail: &FsJail, mounts: &[MountSpec]) -> Result<(), SandboxError> {
    for mount in mounts {
        let target = jail.resolve(&mount.guest_path)?;
        if mount.read_only {
            tracing::warn!(
                guest_path = %mount.guest_path,
                "local backend cannot enforce read-only mounts"
            );
        }
        if let Some(parent) = target.parent() {
            std::fs::create_dir_all(parent)?;
        }
        #[cfg(unix)]
        std::os::unix::fs::symlink(&mount.host_path, &target)?;
        #[cfg(not(unix))]
        return Err(SandboxError::Unsupported("host mounts"));
    }
    Ok(())
}

fn which(bin: &str) -> Option<std::path::PathBuf> {
    std::env::var_os("PATH").and_then(|paths| {
        std::env::split_paths(&paths).find_map(|dir| {
            let full = dir.join(bin);
            if full.is_file() { Some(full) } else { None }
        })
    })
}
