use std::collections::{BTreeMap, HashMap};
use std::path::PathBuf;
use std::sync::Arc;

use serde::Serialize;
use tokio::sync::{Semaphore, broadcast};
use tokio::task::{self, JoinSet};
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::episode::controller::{EpisodeController, EpisodePlan};
use crate::episode::{EpisodeEvent, EpisodeReport};
use crate::ledger::{Amount, CostLedger};
use crate::model::ModelProvider;
use crate::sandbox::SandboxProvider;
use crate::trajectory::JsonlTrajectoryRecorder;

#[derive(Debug, Clone, Serialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum TrialOutcome {
    Completed(EpisodeReport),
    /// Not started: the shared budget was already spent or the run was
    /// cancelled.
    Refused { reason: String },
    /// Never produced a report: the trajectory could not be opened or
    /// the trial task panicked.
    Failed { reason: String },
}

#[derive(Debug, Clone, Serialize)]
pub struct TrialResult {
    pub trial: usize,
    pub episode_id: String,
    #[serde(flatten)]
    pub outcome: TrialOutcome,
}

impl TrialResult {
    pub fn label(&self) -> String {
        match &self.outcome {
            TrialOutcome::Completed(report) => report.status.to_string(),
            TrialOutcome::Refused { .. } => "refused".into(),
            TrialOutcome::Failed { .. } => "trial_failed".into(),
        }
    }
}

/// Totals across every trial of one run.
#[derive(Debug, Clone, Serialize)]
pub struct RunSummary {
    pub results: Vec<TrialResult>,
    pub counts: BTreeMap<String, usize>,
    pub total_cost: Amount,
}

/// Runs several episodes of one plan concurrently.
///
/// Each trial owns its sandbox and trajectory file; the ledger is shared
/// so the global ceiling covers the whole run.
pub struct TrialRunner {
    provider: Arc<dyn SandboxProvider>,
    model: Arc<dyn ModelProvider>,
    ledger: Arc<CostLedger>,
    output_dir: PathBuf,
    parallel: usize,
    events_tx: Option<broadcast::Sender<EpisodeEvent>>,
    cancel: CancellationToken,
}

impl TrialRunner {
    pub fn new(
        provider: Arc<dyn SandboxProvider>,
        model: Arc<dyn ModelProvider>,
        ledger: Arc<CostLedger>,
        output_dir: PathBuf,
    ) -> Self {
        Self {
            provider,
            model,
            ledger,
            output_dir,
            parallel: 1,
            events_tx: None,
            cancel: CancellationToken::new(),
        }
    }

    pub fn parallel(mut self, parallel: usize) -> Self {
        self.parallel = parallel.max(1);
        self
    }

    pub fn with_events(mut self, events_tx: broadcast::Sender<EpisodeEvent>) -> Self {
        self.events_tx = Some(events_tx);
        self
    }

    pub fn with_cancel(mut self, cancel: CancellationToken) -> Self {
        self.cancel = cancel;
        self
    }

    pub async fn run(&self, plan: EpisodePlan, trials: usize) -> RunSummary {
        let plan = Arc::new(plan);
        let mut controller = EpisodeController::new(self.provider.clone(), self.model.clone(), self.ledger.clone())
            .with_cancel(self.cancel.clone());
        if let Some(tx) = &self.events_tx {
            controller = controller.with_events(tx.clone());
        }
        let controller = Arc::new(controller);
        let semaphore = Arc::new(Semaphore::new(self.parallel));

        tracing::info!(
            task = %plan.task_id,
            trials,
            parallel = self.parallel,
            output_dir = %self.output_dir.display(),
            "starting trials"
        );

        let mut set = JoinSet::new();
        let mut spawned: HashMap<task::Id, (usize, String)> = HashMap::with_capacity(trials);
        for trial in 0..trials {
            let controller = controller.clone();
            let plan = plan.clone();
            let semaphore = semaphore.clone();
            let ledger = self.ledger.clone();
            let cancel = self.cancel.clone();
            let output_dir = self.output_dir.clone();
            let episode_id = Uuid::new_v4().to_string();
            let task_episode_id = episode_id.clone();
            let handle = set.spawn(async move {
                let episode_id = task_episode_id;
                let outcome = match semaphore.acquire_owned().await {
                    Ok(_permit) => run_trial(&controller, &plan, &ledger, &cancel, &output_dir, &episode_id).await,
                    Err(_) => TrialOutcome::Failed { reason: "runner shut down".into() },
                };
                TrialResult { trial, episode_id, outcome }
            });
            spawned.insert(handle.id(), (trial, episode_id));
        }

        let mut results = Vec::with_capacity(trials);
        while let Some(joined) = set.join_next().await {
            match joined {
                Ok(result) => results.push(result),
                Err(e) => {
                    let Some((trial, episode_id)) = spawned.remove(&e.id()) else {
                        tracing::error!(error = %e, "unknown trial task failed");
                        continue;
                    };
                    let reason = if e.is_panic() { "panicked" } else { "cancelled" };
                    tracing::error!(trial, episode = %episode_id, error = %e, "trial task {reason}");
                    results.push(TrialResult {
                        trial,
                        episode_id,
                        outcome: TrialOutcome::Failed { reason: reason.into() },
                    });
                }
            }
        }
        results.sort_by_key(|r| r.trial);

        let mut counts = BTreeMap::new();
        for result in &results {
            *counts.entry(result.label()).or_insert(0) += 1;
        }
        let total_cost = self.ledger.global_spent();
        tracing::info!(task = %plan.task_id, total_cost = %total_cost, ?counts, "trials finished");

        RunSummary { results, counts, total_cost }
    }
}

async fn run_trial(
    controller: &EpisodeController,
    plan: &EpisodePlan,
    ledger: &CostLedger,
    cancel: &CancellationToken,
    output_dir: &std::path::Path,
    episode_id: &str,
) -> TrialOutcome {
    if cancel.is_cancelled() {
        return TrialOutcome::Refused { reason: "run cancelled".into() };
    }
    if ledger.global_exhausted() {
        tracing::warn!(episode = %episode_id, "global cost limit reached, trial not started");
        return TrialOutcome::Refused {
            reason: format!("global cost limit reached ({} spent)", ledger.global_spent()),
        };
    }

    let mut recorder = match JsonlTrajectoryRecorder::create(output_dir, episode_id).await {
        Ok(recorder) => recorder,
        Err(e) => {
            tracing::error!(episode = %episode_id, error = %format!("{e:#}"), "failed to open trajectory");
            return TrialOutcome::Failed { reason: format!("{e:#}") };
        }
    };

    match controller.run(episode_id, plan, &mut recorder).await {
        Ok(report) => TrialOutcome::Completed(report),
        Err(e) => {
            // Nothing was written; leave no empty trajectory behind.
            if let Err(rm) = tokio::fs::remove_file(recorder.path()).await {
                tracing::warn!(path = %recorder.path().display(), error = %rm, "failed to remove empty trajectory");
            }
            if e.is_budget_refusal() {
                tracing::warn!(episode = %episode_id, error = %e, "trial refused");
                TrialOutcome::Refused { reason: e.to_string() }
            } else {
                tracing::error!(episode = %episode_id, error = %e, "trial failed to start");
                TrialOutcome::Failed { reason: e.to_string() }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::actions::ActionRegistry;
    use crate::episode::{EpisodeLimits, EpisodeStatus};
    use crate::model::replay::ReplayTurn;
    use crate::model::{ReplayModel, RetryPolicy};
    use crate::sandbox::backends::local::LocalProcessProvider;
    use crate::sandbox::{LocalConfig, NetworkMode, ResourceHints, SandboxSpec};
    use crate::trajectory::read_trajectory;

    fn plan(cost_limit: Amount) -> EpisodePlan {
        EpisodePlan {
            task_id: "mnist".into(),
            limits: EpisodeLimits {
                cost_limit,
                max_steps: 5,
                short_timeout_secs: 5,
                long_timeout_secs: 10,
                ..EpisodeLimits::default()
            },
            global_cost_limit: Amount::ZERO,
            registry: ActionRegistry::default(),
            retry: RetryPolicy::none(),
            sandbox_spec: SandboxSpec {
                workspace_id: String::new(),
                image: None,
                resources: ResourceHints::default(),
                env: Default::default(),
                mounts: vec![],
                network: NetworkMode::Disabled,
                labels: Default::default(),
            },
            system_prompt: "sys".into(),
            task_prompt: "task".into(),
            history_window: None,
            starter_files: vec![],
            setup_commands: vec![],
            validate_command: None,
        }
    }

    fn provider(tmp: &tempfile::TempDir) -> Arc<LocalProcessProvider> {
        Arc::new(
            LocalProcessProvider::new(LocalConfig {
                root_dir: tmp.path().join("sandboxes"),
                ..LocalConfig::default()
            })
            .unwrap(),
        )
    }

    fn turns(n: usize, text: &str, cost: f64) -> Vec<ReplayTurn> {
        (0..n).map(|_| ReplayTurn::reply(format!("```\n{text}\n```"), cost)).collect()
    }

    #[tokio::test]
    async fn trials_run_concurrently_with_own_sandboxes() {
        let tmp = tempfile::tempdir().unwrap();
        let provider = provider(&tmp);
        let model = Arc::new(ReplayModel::new("replay", turns(3, "submit", 0.25)));
        let ledger = Arc::new(CostLedger::new(Amount::ZERO));
        let out = tmp.path().join("trajectories");

        let runner = TrialRunner::new(provider.clone(), model, ledger.clone(), out.clone()).parallel(3);
        let summary = runner.run(plan(Amount::ZERO), 3).await;

        assert_eq!(summary.results.len(), 3);
        assert_eq!(summary.counts.get("succeeded"), Some(&3));
        assert_eq!(summary.total_cost, Amount::from_micros(750_000));
        assert_eq!(provider.live_count(), 0);

        for result in &summary.results {
            let TrialOutcome::Completed(report) = &result.outcome else {
                panic!("trial {} did not complete", result.trial);
            };
            let path = report.trajectory_path.as_ref().unwrap();
            let t = read_trajectory(path).unwrap();
            assert_eq!(t.header.episode_id, result.episode_id);
            assert_eq!(t.summary.unwrap().status, EpisodeStatus::Succeeded);
        }
    }

    #[tokio::test]
    async fn trials_after_global_ceiling_are_refused() {
        let tmp = tempfile::tempdir().unwrap();
        let provider = provider(&tmp);
        let model = Arc::new(ReplayModel::new("replay", turns(4, "submit", 1.0)));
        let ledger = Arc::new(CostLedger::new(Amount::from_micros(1_000_000)));
        let out = tmp.path().join("trajectories");

        let runner = TrialRunner::new(provider.clone(), model, ledger.clone(), out.clone()).parallel(1);
        let summary = runner.run(plan(Amount::ZERO), 3).await;

        assert_eq!(summary.counts.get("succeeded"), Some(&1));
        assert_eq!(summary.counts.get("refused"), Some(&2));
        assert_eq!(summary.total_cost, Amount::from_micros(1_000_000));
        assert_eq!(std::fs::read_dir(&out).unwrap().count(), 1);
    }

    struct PanickingModel;

    #[async_trait::async_trait]
    impl ModelProvider for PanickingModel {
        fn name(&self) -> &str {
            "panicking"
        }

        async fn send(&self, _history: &[crate::model::HistoryItem]) -> Result<crate::model::ModelReply, crate::model::ModelError> {
            panic!("provider bug");
        }
    }

    #[tokio::test]
    async fn panicked_trial_is_reported_as_failed() {
        let tmp = tempfile::tempdir().unwrap();
        let provider = provider(&tmp);
        let ledger = Arc::new(CostLedger::new(Amount::ZERO));

        let runner = TrialRunner::new(provider, Arc::new(PanickingModel), ledger, tmp.path().join("t")).parallel(2);
        let summary = runner.run(plan(Amount::ZERO), 2).await;

        assert_eq!(summary.results.len(), 2);
        assert_eq!(summary.counts.get("trial_failed"), Some(&2));
        for (i, result) in summary.results.iter().enumerate() {
            assert_eq!(result.trial, i);
            assert!(matches!(&result.outcome, TrialOutcome::Failed { reason } if reason == "panicked"));
        }
    }

    #[tokio::test]
    async fn cancelled_run_refuses_pending_trials() {
        let tmp = tempfile::tempdir().unwrap();
        let provider = provider(&tmp);
        let model = Arc::new(ReplayModel::new("replay", turns(2, "submit", 0.1)));
        let ledger = Arc::new(CostLedger::new(Amount::ZERO));
        let cancel = CancellationToken::new();
        cancel.cancel();

        let runner = TrialRunner::new(provider, model, ledger, tmp.path().join("t")).with_cancel(cancel);
        let summary = runner.run(plan(Amount::ZERO), 2).await;
        assert_eq!(summary.counts.get("refused"), Some(&2));
    }
}
