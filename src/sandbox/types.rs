use std::collections::BTreeMap;
use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};

// ── Sandbox identity ────────────────────────────────────────────────

pub type SandboxId = String;

// ── Backend kind ────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SandboxBackendKind {
    LocalProcess,
    Docker,
}

// ── Sandbox spec (input to acquire) ─────────────────────────────────

#[derive(Debug, Clone)]
pub struct SandboxSpec {
    /// Unique per episode; names the workspace directory or container.
    pub workspace_id: String,
    /// Container image; ignored by the local backend.
    pub image: Option<String>,
    pub resources: ResourceHints,
    pub env: BTreeMap<String, String>,
    pub mounts: Vec<MountSpec>,
    pub network: NetworkMode,
    pub labels: BTreeMap<String, String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ResourceHints {
    #[serde(default)]
    pub cpus: Option<f32>,
    #[serde(default)]
    pub memory_mb: Option<u32>,
    /// Docker `--gpus` value, e.g. `all` or `device=0`.
    #[serde(default)]
    pub gpus: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MountSpec {
    pub host_path: PathBuf,
    pub guest_path: String,
    #[serde(default)]
    pub read_only: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NetworkMode {
    #[default]
    Disabled,
    Bridge,
    Host,
}

impl NetworkMode {
    pub fn docker_arg(self) -> &'static str {
        match self {
            NetworkMode::Disabled => "none",
            NetworkMode::Bridge => "bridge",
            NetworkMode::Host => "host",
        }
    }
}

// ── Metadata / status ───────────────────────────────────────────────

#[derive(Debug, Clone)]
pub struct SandboxMetadata {
    pub workspace_id: String,
    pub created_at_unix_ms: i64,
    pub labels: BTreeMap<String, String>,
}

#[derive(Debug, Clone)]
pub struct SandboxSummary {
    pub id: SandboxId,
    pub backend: SandboxBackendKind,
    pub workspace_id: String,
}

// ── Exec model ──────────────────────────────────────────────────────

/// One shell command to run inside the sandbox. Backends hand `command`
/// to their configured shell, so pipes and redirects work as typed.
#[derive(Debug, Clone)]
pub struct ExecRequest {
    pub command: String,
    pub cwd: Option<String>,
    pub env: BTreeMap<String, String>,
    pub timeout: Duration,
}

impl ExecRequest {
    pub fn new(command: impl Into<String>, timeout: Duration) -> Self {
        Self {
            command: command.into(),
            cwd: None,
            env: BTreeMap::new(),
            timeout,
        }
    }
}

#[derive(Debug, Clone)]
pub struct ExecResult {
    /// `None` when the process was killed by a signal (including our own
    /// timeout kill).
    pub exit_code: Option<i32>,
    pub stdout: Vec<u8>,
    pub stderr: Vec<u8>,
    /// Set when either stream hit the supervisor's byte cap.
    pub output_truncated: bool,
    pub timed_out: bool,
    pub started_at_unix_ms: i64,
    pub elapsed: Duration,
}

// ── Backend configs ─────────────────────────────────────────────────

#[derive(Debug, Clone)]
pub struct LocalConfig {
    pub root_dir: PathBuf,
    pub inherit_env_allowlist: Vec<String>,
    pub default_shell: Vec<String>,
    pub max_output_bytes: usize,
    /// How long pipe readers may linger after the process group is killed.
    pub kill_grace: Duration,
}

impl Default for LocalConfig {
    fn default() -> Self {
        Self {
            root_dir: PathBuf::from(""), // must be set by caller
            inherit_env_allowlist: vec!["PATH".into(), "HOME".into(), "LANG".into(), "TERM".into()],
            default_shell: vec!["/bin/bash".into(), "-lc".into()],
            max_output_bytes: 10 * 1024 * 1024, // 10 MB
            kill_grace: Duration::from_secs(2),
        }
    }
}

#[derive(Debug, Clone)]
pub struct DockerConfig {
    pub docker_bin: String,
    pub default_image: String,
    pub workdir: String,
    pub shell: String,
    pub max_output_bytes: usize,
    pub kill_grace: Duration,
}

impl Default for DockerConfig {
    fn default() -> Self {
        Self {
            docker_bin: "docker".into(),
            default_image: "python:3.11-slim".into(),
            workdir: "/workspace".into(),
            shell: "bash".into(),
            max_output_bytes: 10 * 1024 * 1024,
            kill_grace: Duration::from_secs(5),
        }
    }
}

// ── Runtime config selector ─────────────────────────────────────────

#[derive(Debug, Clone)]
pub enum SandboxRuntimeConfig {
    Local(LocalConfig),
    Docker(DockerConfig),
}

// ── Tests ───────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn local_config_default() {
        let lc = LocalConfig::default();
        assert!(lc.root_dir.as_os_str().is_empty()); // must be set by caller
        assert!(lc.inherit_env_allowlist.contains(&"PATH".to_string()));
        assert_eq!(lc.default_shell, vec!["/bin/bash", "-lc"]);
        assert_eq!(lc.max_output_bytes, 10 * 1024 * 1024);
    }

    #[test]
    fn exec_request_new_has_no_env() {
        let req = ExecRequest::new("python train.py", Duration::from_secs(60));
        assert_eq!(req.command, "python train.py");
        assert!(req.cwd.is_none());
        assert!(req.env.is_empty());
        assert_eq!(req.timeout, Duration::from_secs(60));
    }

    #[test]
    fn network_mode_maps_to_docker_flag() {
        assert_eq!(NetworkMode::Disabled.docker_arg(), "none");
        assert_eq!(NetworkMode::Bridge.docker_arg(), "bridge");
        assert_eq!(NetworkMode::default(), NetworkMode::Disabled);
    }

    #[test]
    fn resource_hints_deserialize_partial() {
        let hints: ResourceHints = serde_yaml::from_str("gpus: all\nmemory_mb: 8192\n").unwrap();
        assert_eq!(hints.gpus.as_deref(), Some("all"));
        assert_eq!(hints.memory_mb, Some(8192));
        assert!(hints.cpus.is_none());
    }

    #[test]
    fn types_are_send_sync() {
        fn assert_send_sync<T: Send + Sync>() {}
        assert_send_sync::<SandboxSpec>();
        assert_send_sync::<ExecRequest>();
        assert_send_sync::<ExecResult>();
        assert_send_sync::<SandboxRuntimeConfig>();
    }
}
