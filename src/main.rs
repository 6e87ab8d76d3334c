use std::error::Error;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result, bail};
use clap::Parser;
use dotenvy::dotenv;
use tokio_util::sync::CancellationToken;
use tracing_subscriber::EnvFilter;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;

use expgym::config::{EpisodeConfig, RuntimeConfig};
use expgym::episode::{EpisodeEvent, EpisodeEventType};
use expgym::ledger::{Amount, CostLedger};
use expgym::model::openai::OpenAiSettings;
use expgym::model::{ModelProvider, OpenAiCompatibleModel, ReplayModel};
use expgym::runner::{TrialOutcome, TrialRunner};
use expgym::sandbox::{self, SandboxProvider};
use expgym::trajectory::read_trajectory;

#[derive(Parser)]
#[command(name = "expgym", about = "Run model-driven ML experiment episodes in a sandbox")]
enum Cli {
    /// Run one or more episodes of a task
    Run {
        /// Episode configuration (YAML)
        #[arg(long)]
        config: PathBuf,
        /// Model id for the OpenAI-compatible endpoint, or `replay:<script.yaml>`
        #[arg(long)]
        model: String,
        /// Per-episode cost ceiling in dollars (0 = unlimited)
        #[arg(long)]
        cost_limit: Option<f64>,
        /// Ceiling shared by all trials, in dollars (0 = unlimited)
        #[arg(long)]
        global_cost_limit: Option<f64>,
        #[arg(long)]
        step_limit: Option<u32>,
        #[arg(long, default_value_t = 1)]
        trials: usize,
        #[arg(long, default_value_t = 1)]
        parallel: usize,
        /// Where trajectories are written (default: $EXPGYM_DATA_DIR/trajectories)
        #[arg(long)]
        output_dir: Option<PathBuf>,
    },
    /// Print a step summary of a trajectory file
    Inspect {
        trajectory: PathBuf,
    },
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn Error>> {
    dotenv().ok();
    let runtime = RuntimeConfig::from_env();

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("expgym=info"));
    tracing_subscriber::registry()
        .with(filter)
        .with(tracing_tree::HierarchicalLayer::new(2).with_targets(true).with_bracketed_fields(false))
        .with(sentry::integrations::tracing::layer().event_filter(
            |metadata| match *metadata.level() {
                tracing::Level::ERROR => sentry::integrations::tracing::EventFilter::Event,
                tracing::Level::WARN | tracing::Level::INFO => {
                    sentry::integrations::tracing::EventFilter::Breadcrumb
                }
                _ => sentry::integrations::tracing::EventFilter::Ignore,
            },
        ))
        .init();

    let _guard = sentry::init((
        runtime.sentry_dsn.clone().unwrap_or_default(),
        sentry::ClientOptions {
            release: sentry::release_name!(),
            environment: Some(runtime.environment.clone().into()),
            traces_sample_rate: 0.2,
            enable_logs: true,
            ..Default::default()
        },
    ));

    match Cli::parse() {
        Cli::Run {
            config,
            model,
            cost_limit,
            global_cost_limit,
            step_limit,
            trials,
            parallel,
            output_dir,
        } => {
            let overrides = Overrides { cost_limit, global_cost_limit, step_limit };
            run(&runtime, &config, &model, overrides, trials, parallel, output_dir).await?;
        }
        Cli::Inspect { trajectory } => inspect(&trajectory)?,
    }
    Ok(())
}

struct Overrides {
    cost_limit: Option<f64>,
    global_cost_limit: Option<f64>,
    step_limit: Option<u32>,
}

async fn run(
    runtime: &RuntimeConfig,
    config_path: &Path,
    model_id: &str,
    overrides: Overrides,
    trials: usize,
    parallel: usize,
    output_dir: Option<PathBuf>,
) -> Result<()> {
    let mut config = EpisodeConfig::load(config_path)?;
    if let Some(v) = overrides.cost_limit {
        config.limits.cost_usd = v;
    }
    if let Some(v) = overrides.global_cost_limit {
        config.limits.global_cost_usd = v;
    }
    if let Some(v) = overrides.step_limit {
        config.limits.max_steps = v;
    }
    config.validate().context("invalid command-line overrides")?;
    let plan = config.plan()?;

    let model = build_model(runtime, &config.model, model_id)?;
    let provider: Arc<dyn SandboxProvider> = Arc::from(
        sandbox::build_provider(config.sandbox_runtime(runtime)).context("failed to initialize sandbox provider")?,
    );
    let ledger = Arc::new(CostLedger::new(config.global_cost_limit()?));
    let output_dir = output_dir.unwrap_or_else(|| runtime.trajectories_dir());

    let cancel = CancellationToken::new();
    let on_signal = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            tracing::warn!("interrupt received, aborting running episodes");
            on_signal.cancel();
        }
    });

    let (events_tx, mut events_rx) = tokio::sync::broadcast::channel::<EpisodeEvent>(256);
    let progress = tokio::spawn(async move {
        while let Ok(event) = events_rx.recv().await {
            if matches!(
                event.event_type,
                EpisodeEventType::StepCompleted | EpisodeEventType::EpisodeFinished
            ) {
                let id: String = event.episode_id.chars().take(8).collect();
                match event.step {
                    Some(step) => println!("[{id}] step {step}: {}", event.message),
                    None => println!("[{id}] {}", event.message),
                }
            }
        }
    });

    let runner = TrialRunner::new(provider, model, ledger, output_dir)
        .parallel(parallel)
        .with_events(events_tx)
        .with_cancel(cancel);
    let summary = runner.run(plan, trials).await;
    drop(runner);
    let _ = progress.await;

    println!();
    for result in &summary.results {
        match &result.outcome {
            TrialOutcome::Completed(report) => println!(
                "trial {:>3}  {:<14} steps {:>3}  cost {}  {}",
                result.trial,
                report.status.to_string(),
                report.steps,
                report.total_cost,
                report
                    .trajectory_path
                    .as_ref()
                    .map(|p| p.display().to_string())
                    .unwrap_or_default(),
            ),
            TrialOutcome::Refused { reason } | TrialOutcome::Failed { reason } => {
                println!("trial {:>3}  {:<14} {reason}", result.trial, result.label())
            }
        }
    }
    let counts: Vec<String> = summary.counts.iter().map(|(k, v)| format!("{k}={v}")).collect();
    println!("total cost {}  ({})", summary.total_cost, counts.join(", "));
    Ok(())
}

fn build_model(runtime: &RuntimeConfig, settings: &OpenAiSettings, model_id: &str) -> Result<Arc<dyn ModelProvider>> {
    if let Some(script) = model_id.strip_prefix("replay:") {
        let model = ReplayModel::from_file(Path::new(script))?;
        tracing::info!(script = %script, turns = model.remaining(), "using replay model");
        return Ok(Arc::new(model));
    }
    if model_id.is_empty() {
        bail!("--model must not be empty");
    }

    let mut settings = settings.clone();
    settings.model = model_id.to_string();
    if let Some(base_url) = &runtime.openai_base_url {
        settings.base_url = base_url.clone();
    }
    let client = reqwest::Client::builder()
        .connect_timeout(Duration::from_secs(10))
        .timeout(Duration::from_secs(settings.request_timeout_secs))
        .build()
        .context("failed to build HTTP client")?;
    tracing::info!(model = %settings.model, base_url = %settings.base_url, "using OpenAI-compatible model");
    Ok(Arc::new(OpenAiCompatibleModel::new(client, runtime.openai_api_key.clone(), settings)))
}

fn inspect(path: &Path) -> Result<()> {
    let trajectory = read_trajectory(path)?;
    let header = &trajectory.header;
    println!(
        "episode {}  task {}  model {}  started {}",
        header.episode_id, header.task_id, header.model, header.started_at
    );
    for step in &trajectory.steps {
        let action = step.action.kind().map(|k| k.name()).unwrap_or("unrecognized");
        let first_line = step.observation.output.lines().next().unwrap_or("");
        let marker = if step.observation.timed_out { " [timed out]" } else { "" };
        println!(
            "{:>4}  {:<12} {:>8}ms  {}  {}{}",
            step.step, action, step.observation.elapsed_ms, step.cumulative_cost, first_line, marker
        );
    }
    match &trajectory.summary {
        Some(summary) => println!(
            "{}{}  steps {}  cost {}  {} API calls",
            summary.status,
            summary.reason.as_deref().map(|r| format!(" ({r})")).unwrap_or_default(),
            summary.steps,
            summary.total_cost,
            summary.model_stats.api_calls
        ),
        None => println!(
            "no summary: episode did not finish ({} steps, cost {})",
            trajectory.steps.len(),
            trajectory.steps.last().map(|s| s.cumulative_cost).unwrap_or(Amount::ZERO)
        ),
    }
    Ok(())
}
