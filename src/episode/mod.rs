pub mod controller;
pub mod events;
pub mod executor;
pub mod history;

use std::fmt;
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::ledger::Amount;
use crate::model::ModelStats;
use crate::sandbox::ExecResult;

pub use controller::{ControllerError, EpisodeController};
pub use events::{EpisodeEvent, EpisodeEventType};
pub use executor::{StepControl, StepExecutor, StepFault, StepOutcome};

// ── Status ──────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EpisodeStatus {
    Running,
    Succeeded,
    Failed,
    CostExceeded,
    StepExceeded,
    TimedOut,
    Errored,
}

impl EpisodeStatus {
    pub fn is_terminal(self) -> bool {
        self != EpisodeStatus::Running
    }
}

impl fmt::Display for EpisodeStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            EpisodeStatus::Running => "running",
            EpisodeStatus::Succeeded => "succeeded",
            EpisodeStatus::Failed => "failed",
            EpisodeStatus::CostExceeded => "cost_exceeded",
            EpisodeStatus::StepExceeded => "step_exceeded",
            EpisodeStatus::TimedOut => "timed_out",
            EpisodeStatus::Errored => "errored",
        };
        f.write_str(s)
    }
}

// ── Limits ──────────────────────────────────────────────────────────

/// Budgets fixed at episode start.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EpisodeLimits {
    /// Per-episode cost ceiling; zero means unlimited.
    pub cost_limit: Amount,
    /// Zero means unlimited.
    pub max_steps: u32,
    /// Episode wall time; zero means unlimited.
    pub max_wall_secs: u64,
    pub short_timeout_secs: u64,
    pub long_timeout_secs: u64,
    /// Observation output bound in bytes.
    pub max_observation_bytes: usize,
}

impl Default for EpisodeLimits {
    fn default() -> Self {
        Self {
            cost_limit: Amount::ZERO,
            max_steps: 50,
            max_wall_secs: 0,
            short_timeout_secs: 60,
            long_timeout_secs: 2 * 60 * 60,
            max_observation_bytes: 16 * 1024,
        }
    }
}

impl EpisodeLimits {
    pub fn wall_time(&self) -> Option<Duration> {
        (self.max_wall_secs > 0).then(|| Duration::from_secs(self.max_wall_secs))
    }
}

// ── Episode ─────────────────────────────────────────────────────────

/// Mutable state of one running episode. Owned by the controller.
#[derive(Debug)]
pub struct Episode {
    pub id: String,
    pub task_id: String,
    pub started_at: DateTime<Utc>,
    started: Instant,
    cost: Amount,
    steps: u32,
    status: EpisodeStatus,
    reason: Option<String>,
}

impl Episode {
    pub fn new(task_id: impl Into<String>) -> Self {
        Self::with_id(uuid::Uuid::new_v4().to_string(), task_id)
    }

    pub fn with_id(id: impl Into<String>, task_id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            task_id: task_id.into(),
            started_at: Utc::now(),
            started: Instant::now(),
            cost: Amount::ZERO,
            steps: 0,
            status: EpisodeStatus::Running,
            reason: None,
        }
    }

    pub fn status(&self) -> EpisodeStatus {
        self.status
    }

    pub fn reason(&self) -> Option<&str> {
        self.reason.as_deref()
    }

    pub fn is_running(&self) -> bool {
        self.status == EpisodeStatus::Running
    }

    pub fn cost(&self) -> Amount {
        self.cost
    }

    pub fn steps(&self) -> u32 {
        self.steps
    }

    pub fn elapsed(&self) -> Duration {
        self.started.elapsed()
    }

    /// Count one step and return its index.
    pub fn begin_step(&mut self) -> u32 {
        let index = self.steps;
        self.steps += 1;
        index
    }

    /// Track the ledger's running total. Totals never go down.
    pub fn set_cost(&mut self, total: Amount) {
        if total < self.cost {
            tracing::warn!(episode = %self.id, current = %self.cost, reported = %total, "ignoring decreasing cost total");
            return;
        }
        self.cost = total;
    }

    /// Assign the terminal status. Only the first call takes effect.
    pub fn finish(&mut self, status: EpisodeStatus, reason: Option<String>) -> bool {
        if self.status.is_terminal() {
            tracing::warn!(
                episode = %self.id,
                current = %self.status,
                attempted = %status,
                "episode already finished, ignoring status change"
            );
            return false;
        }
        if !status.is_terminal() {
            return false;
        }
        self.status = status;
        self.reason = reason;
        true
    }
}

// ── Observation ─────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "code", rename_all = "snake_case")]
pub enum ExitStatus {
    Exited(i32),
    Signaled,
    TimedOut,
    /// Nothing ran (synthetic and control observations).
    None,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ObservationSource {
    Sandbox,
    Synthetic,
    Control,
}

/// What the agent sees after one action.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Observation {
    pub output: String,
    pub truncated: bool,
    pub exit: ExitStatus,
    pub elapsed_ms: u64,
    pub timed_out: bool,
    pub source: ObservationSource,
}

impl Observation {
    /// Feedback produced without touching the sandbox.
    pub fn synthetic(message: impl Into<String>) -> Self {
        Self {
            output: message.into(),
            truncated: false,
            exit: ExitStatus::None,
            elapsed_ms: 0,
            timed_out: false,
            source: ObservationSource::Synthetic,
        }
    }

    pub fn control(message: impl Into<String>) -> Self {
        Self {
            source: ObservationSource::Control,
            ..Self::synthetic(message)
        }
    }

    /// Merge stdout and stderr of a command and bound the result.
    pub fn from_exec(result: &ExecResult, max_bytes: usize, timeout: Duration) -> Self {
        let mut text = String::from_utf8_lossy(&result.stdout).into_owned();
        if !result.stderr.is_empty() {
            if !text.is_empty() && !text.ends_with('\n') {
                text.push('\n');
            }
            text.push_str(&String::from_utf8_lossy(&result.stderr));
        }
        let (mut output, cut) = truncate_output(&text, max_bytes);
        // Appended after truncation so the notice always survives.
        if result.timed_out {
            if !output.is_empty() && !output.ends_with('\n') {
                output.push('\n');
            }
            output.push_str(&format!(
                "[command timed out after {}s and was killed]",
                timeout.as_secs_f64()
            ));
        }
        let exit = match (result.timed_out, result.exit_code) {
            (true, _) => ExitStatus::TimedOut,
            (false, Some(code)) => ExitStatus::Exited(code),
            (false, None) => ExitStatus::Signaled,
        };
        Self {
            output,
            truncated: cut || result.output_truncated,
            exit,
            elapsed_ms: result.elapsed.as_millis() as u64,
            timed_out: result.timed_out,
            source: ObservationSource::Sandbox,
        }
    }
}

/// Cut `text` to at most `max_bytes` on a char boundary, appending a
/// marker with the number of bytes dropped.
pub fn truncate_output(text: &str, max_bytes: usize) -> (String, bool) {
    if text.len() <= max_bytes {
        return (text.to_string(), false);
    }
    let mut cut = max_bytes;
    while cut > 0 && !text.is_char_boundary(cut) {
        cut -= 1;
    }
    let omitted = text.len() - cut;
    (
        format!("{}\n[... output truncated, {omitted} bytes omitted ...]", &text[..cut]),
        true,
    )
}

// ── Report ──────────────────────────────────────────────────────────

/// Returned to the caller once the episode is finalized.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EpisodeReport {
    pub episode_id: String,
    pub task_id: String,
    pub status: EpisodeStatus,
    pub reason: Option<String>,
    pub steps: u32,
    pub total_cost: Amount,
    pub elapsed_ms: u64,
    pub model_stats: ModelStats,
    pub trajectory_path: Option<std::path::PathBuf>,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn exec(stdout: &str, stderr: &str, code: Option<i32>, timed_out: bool) -> ExecResult {
        ExecResult {
            exit_code: code,
            stdout: stdout.as_bytes().to_vec(),
            stderr: stderr.as_bytes().to_vec(),
            output_truncated: false,
            timed_out,
            started_at_unix_ms: 0,
            elapsed: Duration::from_millis(1200),
        }
    }

    #[test]
    fn terminal_status_is_assigned_once() {
        let mut ep = Episode::new("task");
        assert!(ep.is_running());
        assert!(ep.finish(EpisodeStatus::CostExceeded, Some("over".into())));
        assert!(!ep.finish(EpisodeStatus::Succeeded, None));
        assert_eq!(ep.status(), EpisodeStatus::CostExceeded);
        assert_eq!(ep.reason(), Some("over"));
    }

    #[test]
    fn running_is_not_a_terminal_assignment() {
        let mut ep = Episode::new("task");
        assert!(!ep.finish(EpisodeStatus::Running, None));
        assert!(ep.is_running());
    }

    #[test]
    fn step_indices_and_cost_are_monotonic() {
        let mut ep = Episode::new("task");
        assert_eq!(ep.begin_step(), 0);
        assert_eq!(ep.begin_step(), 1);
        assert_eq!(ep.steps(), 2);
        ep.set_cost(Amount::from_micros(10));
        ep.set_cost(Amount::from_micros(5));
        assert_eq!(ep.cost(), Amount::from_micros(10));
    }

    #[test]
    fn truncation_respects_char_boundaries() {
        let text = "héllo wörld";
        let (out, cut) = truncate_output(text, 2);
        assert!(cut);
        assert!(out.starts_with('h'));
        assert!(out.contains(&format!("{} bytes omitted", text.len() - 1)));
        assert_eq!(truncate_output("short", 100), ("short".to_string(), false));
    }

    #[test]
    fn exec_observation_merges_streams() {
        let obs = Observation::from_exec(&exec("out", "err\n", Some(2), false), 1024, Duration::from_secs(60));
        assert_eq!(obs.output, "out\nerr\n");
        assert_eq!(obs.exit, ExitStatus::Exited(2));
        assert_eq!(obs.elapsed_ms, 1200);
        assert_eq!(obs.source, ObservationSource::Sandbox);
    }

    #[test]
    fn timed_out_exec_is_flagged() {
        let obs = Observation::from_exec(&exec("partial", "", None, true), 1024, Duration::from_secs(60));
        assert!(obs.timed_out);
        assert_eq!(obs.exit, ExitStatus::TimedOut);
        assert!(obs.output.contains("timed out after 60s"));
    }

    #[test]
    fn timeout_notice_survives_truncation() {
        let stdout = "x".repeat(4096);
        let obs = Observation::from_exec(&exec(&stdout, "", None, true), 1024, Duration::from_secs(60));
        assert!(obs.truncated);
        assert!(obs.output.contains("bytes omitted"));
        assert!(obs.output.ends_with("[command timed out after 60s and was killed]"));
    }

    #[test]
    fn exit_status_serializes_adjacently() {
        let json = serde_json::to_value(ExitStatus::Exited(1)).unwrap();
        assert_eq!(json, serde_json::json!({"kind": "exited", "code": 1}));
        let json = serde_json::to_value(ExitStatus::TimedOut).unwrap();
        assert_eq!(json, serde_json::json!({"kind": "timed_out"}));
    }
}
