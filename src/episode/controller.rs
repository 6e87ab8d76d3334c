use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::Instrument;

use crate::actions::{self, ActionRegistry, ParsedAction};
use crate::episode::events::{EpisodeEvent, EpisodeEventType};
use crate::episode::executor::{ExecutorSettings, StepControl, StepExecutor};
use crate::episode::history::{BudgetLine, HistoryBuilder, Turn, render_observation};
use crate::episode::{Episode, EpisodeLimits, EpisodeReport, EpisodeStatus, Observation};
use crate::ledger::{Amount, Ceiling, CostEntry, CostLedger, LedgerError};
use crate::model::{ModelError, ModelProvider, ModelReply, ModelStats, RetryPolicy, call_with_retry};
use crate::sandbox::{ExecRequest, SandboxLease, SandboxProvider, SandboxSpec};
use crate::trajectory::{EpisodeSummary, FORMAT_VERSION, StepRecord, TrajectoryHeader, TrajectoryRecorder};

/// A host file or directory placed in the workspace before step 0.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StarterFile {
    pub source: PathBuf,
    pub target: String,
}

/// Everything fixed at episode start.
#[derive(Debug, Clone)]
pub struct EpisodePlan {
    pub task_id: String,
    pub limits: EpisodeLimits,
    /// Recorded in the trajectory header; enforced by the shared ledger.
    pub global_cost_limit: Amount,
    pub registry: ActionRegistry,
    pub retry: RetryPolicy,
    pub sandbox_spec: SandboxSpec,
    pub system_prompt: String,
    pub task_prompt: String,
    pub history_window: Option<usize>,
    pub starter_files: Vec<StarterFile>,
    pub setup_commands: Vec<String>,
    pub validate_command: Option<String>,
}

impl EpisodePlan {
    fn short_timeout(&self) -> Duration {
        Duration::from_secs(self.limits.short_timeout_secs)
    }

    fn long_timeout(&self) -> Duration {
        Duration::from_secs(self.limits.long_timeout_secs)
    }
}

/// Failures that prevent an episode from starting at all. Anything that
/// goes wrong after the header is written ends the episode with a
/// terminal status instead.
#[derive(Debug, thiserror::Error)]
pub enum ControllerError {
    #[error("episode refused: {0}")]
    Ledger(#[from] LedgerError),

    #[error("failed to start trajectory: {0:#}")]
    Trajectory(anyhow::Error),
}

impl ControllerError {
    /// The shared budget was already spent when the episode asked to start.
    pub fn is_budget_refusal(&self) -> bool {
        matches!(self, ControllerError::Ledger(LedgerError::GlobalBudgetExhausted { .. }))
    }
}

type Outcome = (EpisodeStatus, Option<String>);

fn end(status: EpisodeStatus, reason: impl Into<String>) -> Outcome {
    (status, Some(reason.into()))
}

fn aborted() -> Outcome {
    end(EpisodeStatus::Errored, "aborted")
}

/// What the controller knows about a model turn before its action runs.
struct PendingStep {
    raw_output: String,
    thought: String,
    action: ParsedAction,
    entry: CostEntry,
    attempts: u32,
}

impl PendingStep {
    fn into_record(self, index: u32, observation: Observation, episode: &Episode) -> StepRecord {
        StepRecord {
            step: index,
            raw_output: self.raw_output,
            thought: self.thought,
            action: self.action,
            observation,
            cost_entries: vec![self.entry],
            cumulative_cost: episode.cost(),
            cumulative_elapsed_ms: episode.elapsed().as_millis() as u64,
            model_attempts: self.attempts,
        }
    }
}

// ── Controller ──────────────────────────────────────────────────────

/// Drives one episode from sandbox acquisition to its terminal status.
///
/// The provider, model and ledger are shared; each call to [`run`]
/// owns its own sandbox and trajectory.
///
/// [`run`]: EpisodeController::run
pub struct EpisodeController {
    provider: Arc<dyn SandboxProvider>,
    model: Arc<dyn ModelProvider>,
    ledger: Arc<CostLedger>,
    events_tx: Option<broadcast::Sender<EpisodeEvent>>,
    cancel: CancellationToken,
}

impl EpisodeController {
    pub fn new(provider: Arc<dyn SandboxProvider>, model: Arc<dyn ModelProvider>, ledger: Arc<CostLedger>) -> Self {
        Self {
            provider,
            model,
            ledger,
            events_tx: None,
            cancel: CancellationToken::new(),
        }
    }

    pub fn with_events(mut self, events_tx: broadcast::Sender<EpisodeEvent>) -> Self {
        self.events_tx = Some(events_tx);
        self
    }

    /// Cancelling the token ends the episode as `Errored` ("aborted").
    pub fn with_cancel(mut self, cancel: CancellationToken) -> Self {
        self.cancel = cancel;
        self
    }

    fn emit(&self, episode_id: &str, step: Option<u32>, event_type: EpisodeEventType, message: impl Into<String>) {
        if let Some(tx) = &self.events_tx {
            let _ = tx.send(EpisodeEvent {
                episode_id: episode_id.to_string(),
                timestamp: Utc::now(),
                step,
                event_type,
                message: message.into(),
            });
        }
    }

    /// Run one episode to completion.
    ///
    /// Returns `Err` only when the episode never started (budget refusal
    /// or an unwritable trajectory). Once the header is written every
    /// path releases the sandbox and finalizes the trajectory.
    pub async fn run(
        &self,
        episode_id: &str,
        plan: &EpisodePlan,
        recorder: &mut dyn TrajectoryRecorder,
    ) -> Result<EpisodeReport, ControllerError> {
        let episode = Episode::with_id(episode_id, plan.task_id.as_str());
        self.ledger.open_episode(&episode.id, plan.limits.cost_limit)?;

        let header = TrajectoryHeader {
            format_version: FORMAT_VERSION,
            episode_id: episode.id.clone(),
            task_id: plan.task_id.clone(),
            model: self.model.name().to_string(),
            started_at: episode.started_at,
            limits: plan.limits.clone(),
            global_cost_limit: plan.global_cost_limit,
        };
        if let Err(e) = recorder.begin(&header).await {
            let _ = self.ledger.close_episode(&episode.id);
            return Err(ControllerError::Trajectory(e));
        }

        let short_id = episode.id.chars().take(8).collect::<String>();
        let span = tracing::info_span!("episode", episode = %short_id, task = %plan.task_id);
        Ok(self.execute(episode, plan, recorder).instrument(span).await)
    }

    async fn execute(&self, mut episode: Episode, plan: &EpisodePlan, recorder: &mut dyn TrajectoryRecorder) -> EpisodeReport {
        tracing::info!(model = %self.model.name(), cost_limit = %plan.limits.cost_limit, max_steps = plan.limits.max_steps, "episode started");
        self.emit(&episode.id, None, EpisodeEventType::EpisodeStarted, format!("task {}", plan.task_id));

        let mut stats = ModelStats::default();
        let (status, reason) = match self.prepare(&episode, plan).await {
            Err(outcome) => outcome,
            Ok(lease) => {
                let outcome = self.drive(&mut episode, plan, &lease, recorder, &mut stats).await;
                if let Err(e) = lease.release().await {
                    tracing::error!(error = %e, "failed to release sandbox");
                }
                outcome
            }
        };
        episode.finish(status, reason);
        if let Err(e) = self.ledger.close_episode(&episode.id) {
            tracing::warn!(error = %e, "failed to close ledger account");
        }

        let summary = EpisodeSummary {
            episode_id: episode.id.clone(),
            status: episode.status(),
            reason: episode.reason().map(String::from),
            steps: episode.steps(),
            total_cost: episode.cost(),
            elapsed_ms: episode.elapsed().as_millis() as u64,
            finished_at: Utc::now(),
            model_stats: stats.clone(),
        };
        if let Err(e) = recorder.finalize(&summary).await {
            tracing::error!(error = %format!("{e:#}"), "failed to finalize trajectory");
        }

        match episode.status() {
            EpisodeStatus::Succeeded => tracing::info!(steps = summary.steps, cost = %summary.total_cost, "episode succeeded"),
            EpisodeStatus::Errored | EpisodeStatus::Failed => tracing::error!(
                status = %summary.status,
                reason = summary.reason.as_deref().unwrap_or(""),
                steps = summary.steps,
                "episode ended abnormally"
            ),
            _ => tracing::warn!(
                status = %summary.status,
                reason = summary.reason.as_deref().unwrap_or(""),
                steps = summary.steps,
                cost = %summary.total_cost,
                "episode stopped"
            ),
        }
        self.emit(
            &episode.id,
            None,
            EpisodeEventType::EpisodeFinished,
            format!("{} after {} steps, cost {}", summary.status, summary.steps, summary.total_cost),
        );

        EpisodeReport {
            episode_id: episode.id.clone(),
            task_id: episode.task_id.clone(),
            status: summary.status,
            reason: summary.reason,
            steps: summary.steps,
            total_cost: summary.total_cost,
            elapsed_ms: summary.elapsed_ms,
            model_stats: stats,
            trajectory_path: recorder.location().map(PathBuf::from),
        }
    }

    // ── Setup ───────────────────────────────────────────────────────

    /// Acquire the sandbox, stage starter files and run setup commands.
    async fn prepare(&self, episode: &Episode, plan: &EpisodePlan) -> Result<SandboxLease, Outcome> {
        let mut spec = plan.sandbox_spec.clone();
        spec.workspace_id = episode.id.clone();
        spec.labels.insert("expgym.episode".into(), episode.id.clone());
        spec.labels.insert("expgym.task".into(), plan.task_id.clone());

        let lease = match self.provider.acquire(spec).await {
            Ok(handle) => SandboxLease::new(handle),
            Err(e) => {
                tracing::error!(error = %e, "sandbox provisioning failed");
                return Err(end(EpisodeStatus::Errored, format!("sandbox provisioning failed: {e}")));
            }
        };
        tracing::info!(sandbox_id = %lease.id(), "sandbox acquired");

        if let Err(reason) = self.stage(&lease, plan).await {
            tracing::error!(reason = %reason, "workspace setup failed");
            if let Err(e) = lease.release().await {
                tracing::error!(error = %e, "failed to release sandbox");
            }
            return Err(end(EpisodeStatus::Errored, reason));
        }
        Ok(lease)
    }

    async fn stage(&self, lease: &SandboxLease, plan: &EpisodePlan) -> Result<(), String> {
        for file in &plan.starter_files {
            lease
                .copy_in(&file.source, &file.target)
                .await
                .map_err(|e| format!("failed to stage {}: {e}", file.source.display()))?;
        }
        for command in &plan.setup_commands {
            let result = lease
                .execute(ExecRequest::new(command.as_str(), plan.short_timeout()))
                .await
                .map_err(|e| format!("setup command `{command}` failed: {e}"))?;
            if result.timed_out {
                return Err(format!("setup command `{command}` timed out"));
            }
            if result.exit_code != Some(0) {
                let stderr = String::from_utf8_lossy(&result.stderr);
                return Err(format!(
                    "setup command `{command}` exited with {:?}: {}",
                    result.exit_code,
                    stderr.trim()
                ));
            }
        }
        Ok(())
    }

    // ── Loop ────────────────────────────────────────────────────────

    async fn drive(
        &self,
        episode: &mut Episode,
        plan: &EpisodePlan,
        lease: &SandboxLease,
        recorder: &mut dyn TrajectoryRecorder,
        stats: &mut ModelStats,
    ) -> Outcome {
        let settings = ExecutorSettings {
            short_timeout: plan.short_timeout(),
            long_timeout: plan.long_timeout(),
            max_observation_bytes: plan.limits.max_observation_bytes,
            wall_time: plan.limits.wall_time(),
            validate_command: plan.validate_command.clone(),
        };
        let executor = StepExecutor::new(lease.handle(), &settings);
        let history = HistoryBuilder {
            system_prompt: plan.system_prompt.clone(),
            task_prompt: plan.task_prompt.clone(),
            window: plan.history_window,
        };
        let deadline = plan
            .limits
            .wall_time()
            .and_then(|limit| Instant::now().checked_add(limit.saturating_sub(episode.elapsed())));
        let mut turns: Vec<Turn> = Vec::new();
        let mut recorded: u32 = 0;

        loop {
            if self.cancel.is_cancelled() {
                return aborted();
            }
            match self.ledger.exceeded(&episode.id) {
                Ok(Some(ceiling)) => return end(EpisodeStatus::CostExceeded, ceiling_reason(ceiling, plan)),
                Ok(None) => {}
                Err(e) => return end(EpisodeStatus::Errored, e.to_string()),
            }
            if wall_time_spent(episode, plan) {
                return end(EpisodeStatus::TimedOut, "wall time limit reached");
            }

            // Model call.
            let messages = history.build(&turns);
            let result = tokio::select! {
                biased;
                _ = self.cancel.cancelled() => return aborted(),
                _ = until(deadline) => {
                    return end(EpisodeStatus::TimedOut, "wall time limit reached during model call");
                }
                result = call_with_retry(self.model.as_ref(), &messages, &plan.retry) => result,
            };
            let (reply, attempts) = match result {
                Ok(ok) => ok,
                Err(e @ ModelError::Transient(_)) => {
                    return end(EpisodeStatus::Errored, format!("model retries exhausted: {e}"));
                }
                Err(e) => return end(EpisodeStatus::Failed, e.to_string()),
            };

            // Charge before anything else can fail.
            let entry = match cost_entry(&reply) {
                Ok(entry) => entry,
                Err(reason) => return end(EpisodeStatus::Errored, reason),
            };
            let receipt = match self.ledger.charge(&episode.id, entry.clone()) {
                Ok(receipt) => receipt,
                Err(e) => return end(EpisodeStatus::Errored, e.to_string()),
            };
            episode.set_cost(receipt.episode_total);
            stats.record(&reply, entry.amount);
            self.emit(
                &episode.id,
                Some(episode.steps()),
                EpisodeEventType::ModelCalled,
                format!("{} attempt(s), cost {}", attempts, entry.amount),
            );

            let action = actions::parse(&reply.text, &plan.registry);
            let pending = PendingStep {
                thought: actions::thought(&reply.text),
                raw_output: reply.text,
                action,
                entry,
                attempts,
            };

            // Action.
            let stepped = tokio::select! {
                biased;
                _ = self.cancel.cancelled() => None,
                result = executor.step(episode, &pending.action) => Some(result),
            };
            let outcome = match stepped {
                Some(Ok(outcome)) => outcome,
                Some(Err(fault)) => {
                    let observation = Observation::synthetic(format!("Sandbox failure: {}", fault.source));
                    let record = pending.into_record(fault.step, observation, episode);
                    if let Err(e) = recorder.append(&record).await {
                        tracing::error!(error = %format!("{e:#}"), "failed to record faulted step");
                    }
                    return end(EpisodeStatus::Errored, fault.to_string());
                }
                None => {
                    if episode.steps() > recorded {
                        let record = pending.into_record(recorded, Observation::synthetic("Action aborted."), episode);
                        if let Err(e) = recorder.append(&record).await {
                            tracing::error!(error = %format!("{e:#}"), "failed to record aborted step");
                        }
                    }
                    return aborted();
                }
            };

            let budget = BudgetLine {
                steps: episode.steps(),
                max_steps: plan.limits.max_steps,
                cost: episode.cost(),
                cost_limit: plan.limits.cost_limit,
                elapsed: episode.elapsed(),
            };
            let rendered = render_observation(&outcome.observation, &budget);
            let record = pending.into_record(outcome.index, outcome.observation, episode);
            if let Err(e) = recorder.append(&record).await {
                return end(EpisodeStatus::Errored, format!("trajectory write failed: {e:#}"));
            }
            recorded += 1;
            turns.push(Turn {
                model_output: record.raw_output,
                observation: rendered,
            });
            self.emit(
                &episode.id,
                Some(outcome.index),
                EpisodeEventType::StepCompleted,
                format!(
                    "{} ({})",
                    record.action.kind().map(|k| k.name()).unwrap_or("unrecognized"),
                    episode.cost()
                ),
            );

            // Terminal checks.
            if outcome.control == Some(StepControl::Submit) {
                return (EpisodeStatus::Succeeded, None);
            }
            if let Some(ceiling) = receipt.exceeded {
                return end(EpisodeStatus::CostExceeded, ceiling_reason(ceiling, plan));
            }
            if plan.limits.max_steps > 0 && episode.steps() >= plan.limits.max_steps {
                return end(
                    EpisodeStatus::StepExceeded,
                    format!("step limit of {} reached", plan.limits.max_steps),
                );
            }
            if wall_time_spent(episode, plan) {
                return end(EpisodeStatus::TimedOut, "wall time limit reached");
            }
        }
    }
}

// ── Helpers ─────────────────────────────────────────────────────────

fn cost_entry(reply: &ModelReply) -> Result<CostEntry, String> {
    let (amount, reported) = match reply.cost {
        None => {
            tracing::warn!("model reply carried no cost, recording zero");
            (Amount::ZERO, false)
        }
        Some(dollars) => match Amount::from_dollars(dollars) {
            Some(amount) => (amount, true),
            None => return Err(format!("model reported a malformed cost: {dollars}")),
        },
    };
    let mut entry = CostEntry::usd(amount);
    entry.input_tokens = reply.input_tokens;
    entry.output_tokens = reply.output_tokens;
    entry.reported = reported;
    Ok(entry)
}

fn ceiling_reason(ceiling: Ceiling, plan: &EpisodePlan) -> String {
    match ceiling {
        Ceiling::Episode => format!("episode cost limit of {} reached", plan.limits.cost_limit),
        Ceiling::Global => format!("global cost limit of {} reached", plan.global_cost_limit),
    }
}

fn wall_time_spent(episode: &Episode, plan: &EpisodePlan) -> bool {
    plan.limits.wall_time().is_some_and(|limit| episode.elapsed() >= limit)
}

async fn until(deadline: Option<Instant>) {
    match deadline {
        Some(at) => tokio::time::sleep_until(at).await,
        None => std::future::pending().await,
    }
}
