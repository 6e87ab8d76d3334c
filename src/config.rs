use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result, bail};
use serde::Deserialize;

use crate::actions::{ActionKind, ActionRegistry};
use crate::episode::controller::{EpisodePlan, StarterFile};
use crate::episode::history::{default_system_prompt, render_template};
use crate::episode::EpisodeLimits;
use crate::ledger::Amount;
use crate::model::RetryPolicy;
use crate::model::openai::OpenAiSettings;
use crate::sandbox::{
    DockerConfig, LocalConfig, MountSpec, NetworkMode, ResourceHints, SandboxRuntimeConfig, SandboxSpec,
};

// ── Process settings ────────────────────────────────────────────────

/// Settings read from environment variables.
#[derive(Debug, Clone)]
pub struct RuntimeConfig {
    pub data_dir: PathBuf,
    pub sentry_dsn: Option<String>,
    pub environment: String,
    pub openai_api_key: Option<String>,
    pub openai_base_url: Option<String>,
}

impl RuntimeConfig {
    pub fn from_env() -> Self {
        Self::from_raw_values(
            std::env::var("EXPGYM_DATA_DIR").ok().as_deref(),
            std::env::var("SENTRY_DSN").ok().as_deref(),
            std::env::var("ENVIRONMENT").ok().as_deref(),
            std::env::var("OPENAI_API_KEY").ok().as_deref(),
            std::env::var("OPENAI_BASE_URL").ok().as_deref(),
        )
    }

    /// Build from raw string values (as they would come from env vars).
    /// Used directly in tests to avoid mutating process-global environment.
    pub fn from_raw_values(
        data_dir: Option<&str>,
        sentry_dsn: Option<&str>,
        environment: Option<&str>,
        openai_api_key: Option<&str>,
        openai_base_url: Option<&str>,
    ) -> Self {
        let non_empty = |v: Option<&str>| v.filter(|s| !s.is_empty()).map(String::from);

        let data_dir = non_empty(data_dir).map(PathBuf::from).unwrap_or_else(|| {
            dirs::home_dir()
                .unwrap_or_else(|| PathBuf::from("."))
                .join(".expgym")
        });

        Self {
            data_dir,
            sentry_dsn: non_empty(sentry_dsn),
            environment: non_empty(environment).unwrap_or_else(|| "local".to_string()),
            openai_api_key: non_empty(openai_api_key),
            openai_base_url: non_empty(openai_base_url),
        }
    }

    pub fn sandboxes_dir(&self) -> PathBuf {
        self.data_dir.join("sandboxes")
    }

    pub fn trajectories_dir(&self) -> PathBuf {
        self.data_dir.join("trajectories")
    }
}

// ── Episode file ────────────────────────────────────────────────────

/// One task's episode configuration, loaded from YAML.
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct EpisodeConfig {
    pub task: TaskConfig,
    #[serde(default)]
    pub agent: AgentConfig,
    /// Enabled actions; all of them when omitted.
    #[serde(default)]
    pub actions: Option<Vec<String>>,
    #[serde(default)]
    pub timeouts: TimeoutConfig,
    #[serde(default)]
    pub limits: LimitsConfig,
    #[serde(default)]
    pub retry: RetryPolicy,
    #[serde(default = "default_max_observation_bytes")]
    pub max_observation_bytes: usize,
    #[serde(default)]
    pub sandbox: SandboxConfig,
    #[serde(default)]
    pub model: OpenAiSettings,
}

fn default_max_observation_bytes() -> usize {
    16 * 1024
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct TaskConfig {
    pub id: String,
    pub description: String,
    #[serde(default)]
    pub starter_files: Vec<StarterFile>,
    #[serde(default)]
    pub setup_commands: Vec<String>,
    #[serde(default)]
    pub validate_command: Option<String>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct AgentConfig {
    /// Placeholders: `{actions}`, `{short_timeout}`, `{long_timeout}`.
    #[serde(default)]
    pub system_template: Option<String>,
    /// Placeholders: `{task_id}`, `{description}`.
    #[serde(default)]
    pub task_template: Option<String>,
    #[serde(default)]
    pub history_window: Option<usize>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields, default)]
pub struct TimeoutConfig {
    pub short_secs: u64,
    pub long_secs: u64,
}

impl Default for TimeoutConfig {
    fn default() -> Self {
        let limits = EpisodeLimits::default();
        Self {
            short_secs: limits.short_timeout_secs,
            long_secs: limits.long_timeout_secs,
        }
    }
}

/// Dollar ceilings are given as decimals; zero means unlimited.
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields, default)]
pub struct LimitsConfig {
    pub cost_usd: f64,
    pub global_cost_usd: f64,
    pub max_steps: u32,
    pub max_wall_secs: u64,
}

impl Default for LimitsConfig {
    fn default() -> Self {
        Self {
            cost_usd: 0.0,
            global_cost_usd: 0.0,
            max_steps: EpisodeLimits::default().max_steps,
            max_wall_secs: 0,
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BackendChoice {
    #[default]
    Local,
    Docker,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct SandboxConfig {
    #[serde(default)]
    pub backend: BackendChoice,
    #[serde(default)]
    pub image: Option<String>,
    #[serde(default)]
    pub resources: ResourceHints,
    #[serde(default)]
    pub mounts: Vec<MountSpec>,
    #[serde(default)]
    pub env: BTreeMap<String, String>,
    #[serde(default)]
    pub network: NetworkMode,
}

/// One day between model retries.
const MAX_BACKOFF_SECS: f64 = 86_400.0;
/// Thirty days of wall time per episode.
const MAX_WALL_SECS: u64 = 30 * 86_400;

impl EpisodeConfig {
    /// Read and validate an episode file. Relative starter-file and mount
    /// paths are resolved against the file's directory.
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read episode config: {}", path.display()))?;
        let mut config = Self::parse(&content)
            .with_context(|| format!("invalid episode config: {}", path.display()))?;
        if let Some(base) = path.parent() {
            config.resolve_paths(base);
        }
        Ok(config)
    }

    pub fn parse(content: &str) -> Result<Self> {
        let config: EpisodeConfig = serde_yaml::from_str(content).context("failed to parse YAML")?;
        config.validate()?;
        Ok(config)
    }

    fn resolve_paths(&mut self, base: &Path) {
        for file in &mut self.task.starter_files {
            if file.source.is_relative() {
                file.source = base.join(&file.source);
            }
        }
        for mount in &mut self.sandbox.mounts {
            if mount.host_path.is_relative() {
                mount.host_path = base.join(&mount.host_path);
            }
        }
    }

    pub fn validate(&self) -> Result<()> {
        if self.task.id.trim().is_empty() {
            bail!("task.id must not be empty");
        }
        if !self
            .task
            .id
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.'))
        {
            bail!("task.id may only contain letters, digits, '-', '_' and '.': {}", self.task.id);
        }
        if self.timeouts.short_secs == 0 || self.timeouts.long_secs == 0 {
            bail!("timeouts must be positive");
        }
        if self.timeouts.short_secs > self.timeouts.long_secs {
            bail!(
                "short timeout ({}s) exceeds long timeout ({}s)",
                self.timeouts.short_secs,
                self.timeouts.long_secs
            );
        }
        dollars("limits.cost_usd", self.limits.cost_usd)?;
        dollars("limits.global_cost_usd", self.limits.global_cost_usd)?;
        if self.max_observation_bytes == 0 {
            bail!("max_observation_bytes must be positive");
        }
        if self.retry.max_attempts == 0 {
            bail!("retry.max_attempts must be at least 1");
        }
        let retry = &self.retry;
        if ![retry.min_backoff_secs, retry.max_backoff_secs, retry.multiplier]
            .iter()
            .all(|v| v.is_finite() && *v >= 0.0)
        {
            bail!("retry backoff values must be finite and non-negative");
        }
        if retry.max_backoff_secs < retry.min_backoff_secs {
            bail!("retry backoff bounds are inconsistent");
        }
        if retry.max_backoff_secs > MAX_BACKOFF_SECS {
            bail!("retry.max_backoff_secs may not exceed {MAX_BACKOFF_SECS}s");
        }
        if self.limits.max_wall_secs > MAX_WALL_SECS {
            bail!("limits.max_wall_secs may not exceed {MAX_WALL_SECS}s");
        }
        let registry = self.registry()?;
        if self.task.validate_command.is_none() && registry.is_enabled(ActionKind::Validate) && self.actions.is_some() {
            bail!("the validate action is enabled but task.validate_command is not set");
        }
        if !registry.is_enabled(ActionKind::Submit) {
            bail!("the submit action cannot be disabled");
        }
        for file in &self.task.starter_files {
            if file.target.trim().is_empty() {
                bail!("starter file {} has an empty target", file.source.display());
            }
        }
        Ok(())
    }

    pub fn registry(&self) -> Result<ActionRegistry> {
        let Some(names) = &self.actions else {
            return Ok(ActionRegistry::default());
        };
        let mut kinds = Vec::with_capacity(names.len());
        for name in names {
            let kind = ActionKind::from_name(name).with_context(|| format!("unknown action in config: {name}"))?;
            kinds.push(kind);
        }
        Ok(ActionRegistry::new(kinds))
    }

    pub fn limits(&self) -> Result<EpisodeLimits> {
        Ok(EpisodeLimits {
            cost_limit: dollars("limits.cost_usd", self.limits.cost_usd)?,
            max_steps: self.limits.max_steps,
            max_wall_secs: self.limits.max_wall_secs,
            short_timeout_secs: self.timeouts.short_secs,
            long_timeout_secs: self.timeouts.long_secs,
            max_observation_bytes: self.max_observation_bytes,
        })
    }

    pub fn global_cost_limit(&self) -> Result<Amount> {
        dollars("limits.global_cost_usd", self.limits.global_cost_usd)
    }

    /// Resolve prompts, registry and limits into a plan.
    pub fn plan(&self) -> Result<EpisodePlan> {
        let registry = self.registry()?;
        let limits = self.limits()?;
        let short = std::time::Duration::from_secs(limits.short_timeout_secs);
        let long = std::time::Duration::from_secs(limits.long_timeout_secs);

        let system_prompt = match &self.agent.system_template {
            Some(template) => {
                let actions = registry.describe();
                let short = crate::episode::history::format_duration(short);
                let long = crate::episode::history::format_duration(long);
                render_template(
                    template,
                    &[
                        ("actions", actions.as_str()),
                        ("short_timeout", short.as_str()),
                        ("long_timeout", long.as_str()),
                    ],
                )
            }
            None => default_system_prompt(&registry, short, long),
        };
        let task_prompt = match &self.agent.task_template {
            Some(template) => render_template(
                template,
                &[
                    ("task_id", self.task.id.as_str()),
                    ("description", self.task.description.as_str()),
                ],
            ),
            None => self.task.description.clone(),
        };

        Ok(EpisodePlan {
            task_id: self.task.id.clone(),
            limits,
            global_cost_limit: self.global_cost_limit()?,
            registry,
            retry: self.retry.clone(),
            sandbox_spec: self.sandbox_spec(),
            system_prompt,
            task_prompt,
            history_window: self.agent.history_window,
            starter_files: self.task.starter_files.clone(),
            setup_commands: self.task.setup_commands.clone(),
            validate_command: self.task.validate_command.clone(),
        })
    }

    /// Workspace id is assigned per episode by the controller.
    pub fn sandbox_spec(&self) -> SandboxSpec {
        SandboxSpec {
            workspace_id: String::new(),
            image: self.sandbox.image.clone(),
            resources: self.sandbox.resources.clone(),
            env: self.sandbox.env.clone(),
            mounts: self.sandbox.mounts.clone(),
            network: self.sandbox.network,
            labels: BTreeMap::new(),
        }
    }

    pub fn sandbox_runtime(&self, runtime: &RuntimeConfig) -> SandboxRuntimeConfig {
        match self.sandbox.backend {
            BackendChoice::Local => SandboxRuntimeConfig::Local(LocalConfig {
                root_dir: runtime.sandboxes_dir(),
                ..LocalConfig::default()
            }),
            BackendChoice::Docker => {
                let mut docker = DockerConfig::default();
                if let Some(image) = &self.sandbox.image {
                    docker.default_image = image.clone();
                }
                SandboxRuntimeConfig::Docker(docker)
            }
        }
    }
}

fn dollars(field: &str, value: f64) -> Result<Amount> {
    Amount::from_dollars(value).with_context(|| format!("{field} must be a non-negative number, got {value}"))
}

#[cfg(test)]
mod tests {
    use super::*;

    const MINIMAL: &str = "task:\n  id: cifar10\n  description: Improve test accuracy.\n";

    const FULL: &str = r#"
task:
  id: cifar10
  description: Improve test accuracy of the baseline.
  starter_files:
    - source: baseline
      target: .
  setup_commands:
    - pip install -r requirements.txt
  validate_command: python evaluate.py
agent:
  system_template: "Actions: {actions}. Short {short_timeout}, long {long_timeout}."
  task_template: "[{task_id}] {description}"
  history_window: 5
actions: [execute, train, validate, read_file, edit_file, submit]
timeouts:
  short_secs: 30
  long_secs: 3600
limits:
  cost_usd: 3.0
  global_cost_usd: 10.5
  max_steps: 20
  max_wall_secs: 7200
retry:
  max_attempts: 3
  min_backoff_secs: 1
  max_backoff_secs: 4
max_observation_bytes: 8000
sandbox:
  backend: docker
  image: pytorch/pytorch:latest
  resources:
    gpus: all
    memory_mb: 16384
  mounts:
    - host_path: /data/cifar
      guest_path: data
      read_only: true
  env:
    PYTHONUNBUFFERED: "1"
  network: bridge
model:
  model: gpt-4o
  temperature: 0.2
  pricing:
    input_per_million: 2.5
    output_per_million: 10
"#;

    #[test]
    fn minimal_config_uses_defaults() {
        let config = EpisodeConfig::parse(MINIMAL).unwrap();
        let plan = config.plan().unwrap();
        assert_eq!(plan.task_id, "cifar10");
        assert_eq!(plan.task_prompt, "Improve test accuracy.");
        assert_eq!(plan.limits, EpisodeLimits::default());
        assert_eq!(plan.global_cost_limit, Amount::ZERO);
        assert_eq!(plan.registry, ActionRegistry::default());
        assert!(plan.system_prompt.contains("timeout 1m"));
        assert_eq!(config.sandbox.backend, BackendChoice::Local);
        assert_eq!(config.retry, RetryPolicy::default());
    }

    #[test]
    fn full_config_resolves_into_plan() {
        let config = EpisodeConfig::parse(FULL).unwrap();
        let plan = config.plan().unwrap();

        assert_eq!(plan.limits.cost_limit, Amount::from_micros(3_000_000));
        assert_eq!(plan.global_cost_limit, Amount::from_micros(10_500_000));
        assert_eq!(plan.limits.max_steps, 20);
        assert_eq!(plan.limits.short_timeout_secs, 30);
        assert_eq!(plan.limits.max_observation_bytes, 8000);
        assert!(!plan.registry.is_enabled(ActionKind::NoOp));
        assert_eq!(plan.history_window, Some(5));
        assert_eq!(plan.task_prompt, "[cifar10] Improve test accuracy of the baseline.");
        assert!(plan.system_prompt.starts_with("Actions: execute, train"));
        assert!(plan.system_prompt.ends_with("Short 30.0s, long 1h."));
        assert_eq!(plan.retry.max_attempts, 3);
        assert_eq!(plan.validate_command.as_deref(), Some("python evaluate.py"));
        assert_eq!(plan.sandbox_spec.network, NetworkMode::Bridge);
        assert_eq!(plan.sandbox_spec.resources.gpus.as_deref(), Some("all"));
        assert_eq!(config.model.model, "gpt-4o");
        assert_eq!(config.model.base_url, "https://api.openai.com/v1");

        let runtime = RuntimeConfig::from_raw_values(Some("/tmp/expgym"), None, None, None, None);
        match config.sandbox_runtime(&runtime) {
            SandboxRuntimeConfig::Docker(d) => assert_eq!(d.default_image, "pytorch/pytorch:latest"),
            other => panic!("expected docker backend, got {other:?}"),
        }
    }

    #[test]
    fn rejects_unknown_action() {
        let yaml = format!("{MINIMAL}actions: [execute, fly, submit]\n");
        let err = EpisodeConfig::parse(&yaml).unwrap_err();
        assert!(format!("{err:#}").contains("unknown action in config: fly"));
    }

    #[test]
    fn rejects_disabled_submit() {
        let yaml = format!("{MINIMAL}actions: [execute]\n");
        let err = EpisodeConfig::parse(&yaml).unwrap_err();
        assert!(err.to_string().contains("submit"));
    }

    #[test]
    fn rejects_negative_cost() {
        let yaml = format!("{MINIMAL}limits:\n  cost_usd: -1\n");
        let err = EpisodeConfig::parse(&yaml).unwrap_err();
        assert!(err.to_string().contains("limits.cost_usd"));
    }

    #[test]
    fn rejects_inverted_timeouts() {
        let yaml = format!("{MINIMAL}timeouts:\n  short_secs: 100\n  long_secs: 10\n");
        assert!(EpisodeConfig::parse(&yaml).is_err());
    }

    #[test]
    fn rejects_unbounded_retry_backoff() {
        for retry in [
            "  max_backoff_secs: .inf\n",
            "  max_backoff_secs: 1e300\n",
            "  multiplier: .nan\n",
            "  multiplier: .inf\n",
        ] {
            let yaml = format!("{MINIMAL}retry:\n{retry}");
            let err = EpisodeConfig::parse(&yaml).unwrap_err();
            assert!(err.to_string().contains("retry"), "{retry}: {err}");
        }
    }

    #[test]
    fn rejects_oversized_wall_limit() {
        let yaml = format!("{MINIMAL}limits:\n  max_wall_secs: 18446744073709551615\n");
        let err = EpisodeConfig::parse(&yaml).unwrap_err();
        assert!(err.to_string().contains("limits.max_wall_secs"));
    }

    #[test]
    fn rejects_unknown_fields() {
        let yaml = format!("{MINIMAL}budget: 3\n");
        assert!(EpisodeConfig::parse(&yaml).is_err());
    }

    #[test]
    fn load_resolves_relative_paths() {
        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().join("episode.yaml");
        std::fs::write(
            &path,
            format!("{MINIMAL}  starter_files:\n    - source: baseline\n      target: .\n"),
        )
        .unwrap();
        let config = EpisodeConfig::load(&path).unwrap();
        assert_eq!(config.task.starter_files[0].source, tmp.path().join("baseline"));
    }

    #[test]
    fn load_missing_file_has_context() {
        let err = EpisodeConfig::load(Path::new("/nonexistent/episode.yaml")).unwrap_err();
        assert!(format!("{err:#}").contains("failed to read episode config"));
    }

    #[test]
    fn runtime_defaults() {
        let rt = RuntimeConfig::from_raw_values(None, Some(""), None, Some("sk-test"), None);
        assert!(rt.data_dir.ends_with(".expgym"));
        assert!(rt.sentry_dsn.is_none());
        assert_eq!(rt.environment, "local");
        assert_eq!(rt.openai_api_key.as_deref(), Some("sk-test"));
        assert!(rt.openai_base_url.is_none());
    }

    #[test]
    fn runtime_explicit_values() {
        let rt = RuntimeConfig::from_raw_values(
            Some("/var/lib/expgym"),
            Some("https://key@sentry.io/1"),
            Some("production"),
            None,
            Some("http://localhost:8000/v1"),
        );
        assert_eq!(rt.data_dir, PathBuf::from("/var/lib/expgym"));
        assert_eq!(rt.trajectories_dir(), PathBuf::from("/var/lib/expgym/trajectories"));
        assert_eq!(rt.sentry_dsn.as_deref(), Some("https://key@sentry.io/1"));
        assert_eq!(rt.environment, "production");
        assert_eq!(rt.openai_base_url.as_deref(), Some("http://localhost:8000/v1"));
    }
}
