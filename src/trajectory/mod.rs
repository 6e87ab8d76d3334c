pub mod jsonl;

use std::path::Path;

use anyhow::{Context, Result, bail};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::actions::ParsedAction;
use crate::episode::{EpisodeLimits, EpisodeStatus, Observation};
use crate::ledger::{Amount, CostEntry};
use crate::model::ModelStats;

pub use jsonl::JsonlTrajectoryRecorder;

pub const FORMAT_VERSION: u32 = 1;

// ── Records ─────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TrajectoryHeader {
    pub format_version: u32,
    pub episode_id: String,
    pub task_id: String,
    pub model: String,
    pub started_at: DateTime<Utc>,
    pub limits: EpisodeLimits,
    pub global_cost_limit: Amount,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StepRecord {
    pub step: u32,
    pub raw_output: String,
    #[serde(default)]
    pub thought: String,
    pub action: ParsedAction,
    pub observation: Observation,
    pub cost_entries: Vec<CostEntry>,
    pub cumulative_cost: Amount,
    /// Episode wall time at the end of this step.
    pub cumulative_elapsed_ms: u64,
    pub model_attempts: u32,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EpisodeSummary {
    pub episode_id: String,
    pub status: EpisodeStatus,
    pub reason: Option<String>,
    pub steps: u32,
    pub total_cost: Amount,
    pub elapsed_ms: u64,
    pub finished_at: DateTime<Utc>,
    pub model_stats: ModelStats,
}

/// One line of a trajectory file.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum TrajectoryRecord {
    Header(TrajectoryHeader),
    Step(StepRecord),
    Summary(EpisodeSummary),
}

// ── Recorder ────────────────────────────────────────────────────────

/// Durable, append-only sink for one episode.
#[async_trait]
pub trait TrajectoryRecorder: Send {
    async fn begin(&mut self, header: &TrajectoryHeader) -> Result<()>;
    /// Steps must arrive in order starting at 0.
    async fn append(&mut self, step: &StepRecord) -> Result<()>;
    /// Write the summary. No appends are accepted afterwards.
    async fn finalize(&mut self, summary: &EpisodeSummary) -> Result<()>;

    /// Where the trajectory is persisted, if anywhere.
    fn location(&self) -> Option<&Path> {
        None
    }
}

/// Ordering rules shared by recorders.
#[derive(Debug, Default)]
pub(crate) struct RecorderState {
    begun: bool,
    finalized: bool,
    next_step: u32,
}

impl RecorderState {
    pub(crate) fn check_begin(&self) -> Result<()> {
        if self.begun {
            bail!("trajectory already has a header");
        }
        Ok(())
    }

    pub(crate) fn check_append(&self, step: u32) -> Result<()> {
        if self.finalized {
            bail!("trajectory is finalized; refusing step {step}");
        }
        if !self.begun {
            bail!("trajectory has no header; refusing step {step}");
        }
        if step != self.next_step {
            bail!("non-contiguous step index: expected {}, got {step}", self.next_step);
        }
        Ok(())
    }

    pub(crate) fn check_finalize(&self) -> Result<()> {
        if self.finalized {
            bail!("trajectory already finalized");
        }
        Ok(())
    }

    pub(crate) fn began(&mut self) {
        self.begun = true;
    }

    pub(crate) fn appended(&mut self) {
        self.next_step += 1;
    }

    pub(crate) fn finished(&mut self) {
        self.finalized = true;
    }
}

/// Keeps records in memory. Useful for tests and embedding.
#[derive(Debug, Default)]
pub struct MemoryRecorder {
    pub records: Vec<TrajectoryRecord>,
    state: RecorderState,
}

impl MemoryRecorder {
    pub fn steps(&self) -> Vec<&StepRecord> {
        self.records
            .iter()
            .filter_map(|r| match r {
                TrajectoryRecord::Step(s) => Some(s),
                _ => None,
            })
            .collect()
    }

    pub fn summary(&self) -> Option<&EpisodeSummary> {
        self.records.iter().find_map(|r| match r {
            TrajectoryRecord::Summary(s) => Some(s),
            _ => None,
        })
    }
}

#[async_trait]
impl TrajectoryRecorder for MemoryRecorder {
    async fn begin(&mut self, header: &TrajectoryHeader) -> Result<()> {
        self.state.check_begin()?;
        self.records.push(TrajectoryRecord::Header(header.clone()));
        self.state.began();
        Ok(())
    }

    async fn append(&mut self, step: &StepRecord) -> Result<()> {
        self.state.check_append(step.step)?;
        self.records.push(TrajectoryRecord::Step(step.clone()));
        self.state.appended();
        Ok(())
    }

    async fn finalize(&mut self, summary: &EpisodeSummary) -> Result<()> {
        self.state.check_finalize()?;
        self.records.push(TrajectoryRecord::Summary(summary.clone()));
        self.state.finished();
        Ok(())
    }
}

// ── Reading ─────────────────────────────────────────────────────────

/// A trajectory file loaded for inspection.
#[derive(Debug, Clone)]
pub struct Trajectory {
    pub header: TrajectoryHeader,
    pub steps: Vec<StepRecord>,
    /// Absent when the process died before finalizing.
    pub summary: Option<EpisodeSummary>,
}

/// Load a JSONL trajectory. A torn final line (crash mid-write) is
/// skipped; any other malformed line is an error.
pub fn read_trajectory(path: &Path) -> Result<Trajectory> {
    let raw = std::fs::read_to_string(path)
        .with_context(|| format!("failed to read trajectory {}", path.display()))?;
    let lines: Vec<&str> = raw.lines().filter(|l| !l.trim().is_empty()).collect();

    let mut header = None;
    let mut steps = Vec::new();
    let mut summary = None;
    for (i, line) in lines.iter().enumerate() {
        let record: TrajectoryRecord = match serde_json::from_str(line) {
            Ok(r) => r,
            Err(e) if i + 1 == lines.len() && !raw.ends_with('\n') => {
                tracing::warn!(path = %path.display(), error = %e, "skipping torn final trajectory line");
                break;
            }
            Err(e) => {
                return Err(e).with_context(|| {
                    format!("malformed record on line {} of {}", i + 1, path.display())
                });
            }
        };
        match record {
            TrajectoryRecord::Header(h) => header = Some(h),
            TrajectoryRecord::Step(s) => steps.push(s),
            TrajectoryRecord::Summary(s) => summary = Some(s),
        }
    }

    let header = header.with_context(|| format!("{} has no header record", path.display()))?;
    if header.format_version > FORMAT_VERSION {
        bail!(
            "trajectory format version {} is newer than supported version {FORMAT_VERSION}",
            header.format_version
        );
    }
    Ok(Trajectory { header, steps, summary })
}
