use std::time::{Duration, Instant};

use crate::actions::{Action, ActionKind, ParsedAction, TimeoutClass, apply_edit};
use crate::episode::{Episode, ExitStatus, Observation, ObservationSource, truncate_output};
use crate::sandbox::{ExecRequest, SandboxError, SandboxHandle};

/// Fixed per-episode settings for dispatching actions.
#[derive(Debug, Clone)]
pub struct ExecutorSettings {
    pub short_timeout: Duration,
    pub long_timeout: Duration,
    pub max_observation_bytes: usize,
    /// Episode wall-time ceiling; action deadlines never run past it.
    pub wall_time: Option<Duration>,
    /// Command behind the `validate` action.
    pub validate_command: Option<String>,
}

impl ExecutorSettings {
    fn class_timeout(&self, class: TimeoutClass) -> Duration {
        match class {
            TimeoutClass::Short => self.short_timeout,
            TimeoutClass::Long => self.long_timeout,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StepControl {
    Submit,
}

#[derive(Debug, Clone)]
pub struct StepOutcome {
    pub index: u32,
    pub observation: Observation,
    pub control: Option<StepControl>,
}

/// Sandbox failure that leaves the episode unable to continue.
#[derive(Debug, thiserror::Error)]
#[error("step {step}: {source}")]
pub struct StepFault {
    pub step: u32,
    #[source]
    pub source: SandboxError,
}

/// Runs one action against the episode's sandbox.
pub struct StepExecutor<'a> {
    sandbox: &'a dyn SandboxHandle,
    settings: &'a ExecutorSettings,
}

impl<'a> StepExecutor<'a> {
    pub fn new(sandbox: &'a dyn SandboxHandle, settings: &'a ExecutorSettings) -> Self {
        Self { sandbox, settings }
    }

    /// Execute `action`, counting exactly one step on `episode`.
    pub async fn step(&self, episode: &mut Episode, action: &ParsedAction) -> Result<StepOutcome, StepFault> {
        let index = episode.begin_step();
        let started = Instant::now();

        let result = match action {
            ParsedAction::Unrecognized { reason, .. } => Ok((
                Observation::synthetic(format!("Your last reply could not be parsed: {reason}")),
                None,
            )),
            ParsedAction::Action(action) => self.dispatch(episode, action).await,
        };
        let (mut observation, control) = result.map_err(|source| StepFault { step: index, source })?;
        if observation.source != ObservationSource::Sandbox {
            observation.elapsed_ms = started.elapsed().as_millis() as u64;
        }

        tracing::info!(
            step = index,
            action = action.kind().map(|k| k.name()).unwrap_or("unrecognized"),
            exit = ?observation.exit,
            timed_out = observation.timed_out,
            elapsed_ms = observation.elapsed_ms,
            "step completed"
        );

        Ok(StepOutcome { index, observation, control })
    }

    async fn dispatch(
        &self,
        episode: &Episode,
        action: &Action,
    ) -> Result<(Observation, Option<StepControl>), SandboxError> {
        let kind = action.kind();
        match action {
            Action::Submit => return Ok((Observation::control("Submitted."), Some(StepControl::Submit))),
            Action::NoOp => return Ok((Observation::synthetic(""), None)),
            _ => {}
        }
        let Some(timeout) = self.deadline(episode, kind) else {
            return Ok((
                Observation::synthetic("Episode time limit reached; the action was not run."),
                None,
            ));
        };

        let observation = match action {
            Action::Execute { command } | Action::Train { command } => self.run(command, timeout).await?,
            Action::Validate => match &self.settings.validate_command {
                Some(command) => self.run(command, timeout).await?,
                None => Observation::synthetic("Validation is not configured for this task."),
            },
            Action::ReadFile { path } => self.read(path, timeout).await?,
            Action::EditFile { path, range, content } => {
                match tokio::time::timeout(timeout, self.edit(path, *range, content)).await {
                    Ok(result) => result?,
                    Err(_) => timed_out_file_op(timeout),
                }
            }
            Action::Submit | Action::NoOp => Observation::synthetic(""),
        };
        Ok((observation, None))
    }

    /// Class timeout capped by the episode's remaining wall time. `None`
    /// once no time is left.
    fn deadline(&self, episode: &Episode, kind: ActionKind) -> Option<Duration> {
        let class = self.settings.class_timeout(kind.timeout_class()?);
        match self.settings.wall_time {
            Some(limit) => {
                let left = limit.saturating_sub(episode.elapsed());
                (!left.is_zero()).then(|| class.min(left))
            }
            None => Some(class),
        }
    }

    async fn run(&self, command: &str, timeout: Duration) -> Result<Observation, SandboxError> {
        let result = self.sandbox.execute(ExecRequest::new(command, timeout)).await?;
        if result.timed_out {
            tracing::warn!(command = %command, timeout_s = timeout.as_secs_f64(), "action timed out");
        }
        Ok(Observation::from_exec(&result, self.settings.max_observation_bytes, timeout))
    }

    async fn read(&self, path: &str, timeout: Duration) -> Result<Observation, SandboxError> {
        let bytes = match tokio::time::timeout(timeout, self.sandbox.read_file(path)).await {
            Err(_) => return Ok(timed_out_file_op(timeout)),
            Ok(Err(e)) if e.is_path_error() => return Ok(file_error(path, &e)),
            Ok(Err(e)) => return Err(e),
            Ok(Ok(bytes)) => bytes,
        };
        let text = String::from_utf8_lossy(&bytes);
        let total = text.lines().count();
        let mut listing = format!("[File: {path} ({total} lines total)]\n");
        for (i, line) in text.lines().enumerate() {
            listing.push_str(&format!("{:>5} {line}\n", i + 1));
        }
        let (output, truncated) = truncate_output(&listing, self.settings.max_observation_bytes);
        Ok(Observation {
            output,
            truncated,
            exit: ExitStatus::Exited(0),
            elapsed_ms: 0,
            timed_out: false,
            source: ObservationSource::Synthetic,
        })
    }

    async fn edit(
        &self,
        path: &str,
        range: Option<crate::actions::LineRange>,
        content: &str,
    ) -> Result<Observation, SandboxError> {
        let updated = match range {
            None => content.to_string(),
            Some(_) => {
                let original = match self.sandbox.read_file(path).await {
                    Ok(bytes) => String::from_utf8_lossy(&bytes).into_owned(),
                    Err(e) if e.is_path_error() => return Ok(file_error(path, &e)),
                    Err(e) => return Err(e),
                };
                match apply_edit(&original, range, content) {
                    Ok(updated) => updated,
                    Err(message) => return Ok(Observation::synthetic(format!("Edit not applied: {message}"))),
                }
            }
        };
        match self.sandbox.write_file(path, updated.as_bytes()).await {
            Ok(()) => Ok(Observation::synthetic(format!(
                "File updated: {path} ({} lines)",
                updated.lines().count()
            ))),
            Err(e) if e.is_path_error() => Ok(file_error(path, &e)),
            Err(e) => Err(e),
        }
    }
}

fn file_error(path: &str, err: &SandboxError) -> Observation {
    Observation::synthetic(format!("Error accessing {path}: {err}"))
}

fn timed_out_file_op(timeout: Duration) -> Observation {
    Observation {
        output: format!("[file operation timed out after {}s]", timeout.as_secs_f64()),
        truncated: false,
        exit: ExitStatus::TimedOut,
        elapsed_ms: timeout.as_millis() as u64,
        timed_out: true,
        source: ObservationSource::Synthetic,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::actions::LineRange;
    use crate::sandbox::backends::local::LocalProcessProvider;
    use crate::sandbox::{LocalConfig, NetworkMode, ResourceHints, SandboxProvider, SandboxSpec};
    use std::collections::BTreeMap;

    struct Fixture {
        _tmp: tempfile::TempDir,
        provider: LocalProcessProvider,
        handle: Box<dyn SandboxHandle>,
    }

    async fn fixture() -> Fixture {
        let tmp = tempfile::tempdir().unwrap();
        let provider = LocalProcessProvider::new(LocalConfig {
            root_dir: tmp.path().join("sandboxes"),
            ..LocalConfig::default()
        })
        .unwrap();
        let handle = provider
            .acquire(SandboxSpec {
                workspace_id: "exec".into(),
                image: None,
                resources: ResourceHints::default(),
                env: BTreeMap::new(),
                mounts: vec![],
                network: NetworkMode::Disabled,
                labels: BTreeMap::new(),
            })
            .await
            .unwrap();
        Fixture { _tmp: tmp, provider, handle }
    }

    fn settings() -> ExecutorSettings {
        ExecutorSettings {
            short_timeout: Duration::from_secs(5),
            long_timeout: Duration::from_secs(10),
            max_observation_bytes: 4096,
            wall_time: None,
            validate_command: Some("echo accuracy=0.91".into()),
        }
    }

    fn act(action: Action) -> ParsedAction {
        ParsedAction::Action(action)
    }

    #[tokio::test]
    async fn execute_runs_in_sandbox() {
        let f = fixture().await;
        let s = settings();
        let exec = StepExecutor::new(f.handle.as_ref(), &s);
        let mut ep = Episode::new("t");

        let out = exec
            .step(&mut ep, &act(Action::Execute { command: "echo hi; exit 3".into() }))
            .await
            .unwrap();
        assert_eq!(out.index, 0);
        assert_eq!(out.observation.output, "hi\n");
        assert_eq!(out.observation.exit, ExitStatus::Exited(3));
        assert!(out.control.is_none());
        assert_eq!(ep.steps(), 1);
    }

    #[tokio::test]
    async fn slow_action_times_out_and_sandbox_survives() {
        let f = fixture().await;
        let s = ExecutorSettings {
            short_timeout: Duration::from_millis(400),
            ..settings()
        };
        let exec = StepExecutor::new(f.handle.as_ref(), &s);
        let mut ep = Episode::new("t");

        let started = Instant::now();
        let out = exec
            .step(&mut ep, &act(Action::Execute { command: "sleep 120".into() }))
            .await
            .unwrap();
        assert!(out.observation.timed_out);
        assert_eq!(out.observation.exit, ExitStatus::TimedOut);
        assert!(out.observation.elapsed_ms >= 400);
        assert!(started.elapsed() < Duration::from_secs(4));

        let next = exec
            .step(&mut ep, &act(Action::Execute { command: "echo alive".into() }))
            .await
            .unwrap();
        assert_eq!(next.index, 1);
        assert_eq!(next.observation.output.trim(), "alive");
    }

    #[tokio::test]
    async fn unrecognized_never_reaches_sandbox() {
        let f = fixture().await;
        let s = settings();
        let exec = StepExecutor::new(f.handle.as_ref(), &s);
        let mut ep = Episode::new("t");
        let parsed = ParsedAction::Unrecognized {
            raw: "dance".into(),
            reason: "unknown action `dance`".into(),
        };
        let out = exec.step(&mut ep, &parsed).await.unwrap();
        assert_eq!(out.observation.source, ObservationSource::Synthetic);
        assert!(out.observation.output.contains("unknown action `dance`"));
        assert_eq!(ep.steps(), 1);
    }

    #[tokio::test]
    async fn submit_signals_control_without_sandbox() {
        let f = fixture().await;
        let s = settings();
        let exec = StepExecutor::new(f.handle.as_ref(), &s);
        let mut ep = Episode::new("t");
        f.handle.release().await.unwrap();

        let out = exec.step(&mut ep, &act(Action::Submit)).await.unwrap();
        assert_eq!(out.control, Some(StepControl::Submit));
        assert_eq!(out.observation.source, ObservationSource::Control);
        assert_eq!(f.provider.live_count(), 0);
    }

    #[tokio::test]
    async fn edit_then_read_file() {
        let f = fixture().await;
        let s = settings();
        let exec = StepExecutor::new(f.handle.as_ref(), &s);
        let mut ep = Episode::new("t");

        exec.step(&mut ep, &act(Action::EditFile {
            path: "train.py".into(),
            range: None,
            content: "lr = 0.1\nepochs = 1\n".into(),
        }))
        .await
        .unwrap();
        let edited = exec
            .step(&mut ep, &act(Action::EditFile {
                path: "train.py".into(),
                range: Some(LineRange { start: 2, end: 2 }),
                content: "epochs = 10\n".into(),
            }))
            .await
            .unwrap();
        assert!(edited.observation.output.contains("File updated: train.py (2 lines)"));

        let read = exec
            .step(&mut ep, &act(Action::ReadFile { path: "train.py".into() }))
            .await
            .unwrap();
        assert!(read.observation.output.contains("    2 epochs = 10"));
        assert_eq!(ep.steps(), 3);
    }

    #[tokio::test]
    async fn missing_paths_become_observations() {
        let f = fixture().await;
        let s = settings();
        let exec = StepExecutor::new(f.handle.as_ref(), &s);
        let mut ep = Episode::new("t");

        let read = exec
            .step(&mut ep, &act(Action::ReadFile { path: "nope.txt".into() }))
            .await
            .unwrap();
        assert!(read.observation.output.starts_with("Error accessing nope.txt"));

        let escape = exec
            .step(&mut ep, &act(Action::ReadFile { path: "../../etc/passwd".into() }))
            .await
            .unwrap();
        assert!(escape.observation.output.contains("escapes workspace"));

        let bad_range = exec
            .step(&mut ep, &act(Action::EditFile {
                path: "nope.txt".into(),
                range: Some(LineRange { start: 1, end: 1 }),
                content: "x\n".into(),
            }))
            .await
            .unwrap();
        assert!(bad_range.observation.output.starts_with("Error accessing"));
    }

    #[tokio::test]
    async fn released_sandbox_is_a_fault() {
        let f = fixture().await;
        let s = settings();
        let exec = StepExecutor::new(f.handle.as_ref(), &s);
        let mut ep = Episode::new("t");
        f.handle.release().await.unwrap();

        let fault = exec
            .step(&mut ep, &act(Action::Execute { command: "ls".into() }))
            .await
            .unwrap_err();
        assert_eq!(fault.step, 0);
        assert!(matches!(fault.source, SandboxError::Released(_)));
        assert_eq!(ep.steps(), 1);
    }

    #[tokio::test]
    async fn validate_runs_configured_command() {
        let f = fixture().await;
        let s = settings();
        let exec = StepExecutor::new(f.handle.as_ref(), &s);
        let mut ep = Episode::new("t");
        let out = exec.step(&mut ep, &act(Action::Validate)).await.unwrap();
        assert_eq!(out.observation.output.trim(), "accuracy=0.91");
    }

    #[tokio::test]
    async fn deadline_is_capped_by_remaining_wall_time() {
        let f = fixture().await;
        let s = ExecutorSettings {
            long_timeout: Duration::from_secs(3600),
            wall_time: Some(Duration::from_millis(500)),
            ..settings()
        };
        let exec = StepExecutor::new(f.handle.as_ref(), &s);
        let mut ep = Episode::new("t");

        let started = Instant::now();
        let out = exec
            .step(&mut ep, &act(Action::Train { command: "sleep 60".into() }))
            .await
            .unwrap();
        assert!(out.observation.timed_out);
        assert!(started.elapsed() < Duration::from_secs(4));
    }
}
