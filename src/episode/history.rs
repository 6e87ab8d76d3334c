use std::time::Duration;

use crate::actions::ActionRegistry;
use crate::episode::{ExitStatus, Observation};
use crate::ledger::Amount;
use crate::model::HistoryItem;

pub const DEFAULT_SYSTEM_PROMPT: &str = "\
You are an autonomous machine learning researcher working inside a sandboxed workspace.
Each reply must end with exactly one command in a fenced code block. Text before the
block is your reasoning. Available actions: {actions}.

  execute <shell command>          run a short command (timeout {short_timeout})
  train <shell command>            run a long training or evaluation job (timeout {long_timeout})
  validate                         run the task's evaluation on the current workspace
  read_file <path>                 print a file
  edit_file <path> [start:end]     replace the file, or lines start..end inclusive,
  <new lines>                      with the lines that follow, up to a line
  end_of_edit                      containing only end_of_edit
  submit                           finish the episode with the current workspace
  no_op                            do nothing this turn
";

/// Replace `{key}` placeholders.
pub fn render_template(template: &str, vars: &[(&str, &str)]) -> String {
    let mut out = template.to_string();
    for (key, value) in vars {
        out = out.replace(&format!("{{{key}}}"), value);
    }
    out
}

pub fn default_system_prompt(registry: &ActionRegistry, short: Duration, long: Duration) -> String {
    let actions = registry.describe();
    let short = format_duration(short);
    let long = format_duration(long);
    render_template(
        DEFAULT_SYSTEM_PROMPT,
        &[
            ("actions", actions.as_str()),
            ("short_timeout", short.as_str()),
            ("long_timeout", long.as_str()),
        ],
    )
}

pub fn format_duration(d: Duration) -> String {
    let secs = d.as_secs();
    if secs >= 3600 && secs % 3600 == 0 {
        format!("{}h", secs / 3600)
    } else if secs >= 60 && secs % 60 == 0 {
        format!("{}m", secs / 60)
    } else {
        format!("{:.1}s", d.as_secs_f64())
    }
}

/// Budget figures shown to the agent after each observation.
#[derive(Debug, Clone, Copy)]
pub struct BudgetLine {
    pub steps: u32,
    pub max_steps: u32,
    pub cost: Amount,
    pub cost_limit: Amount,
    pub elapsed: Duration,
}

impl BudgetLine {
    pub fn render(&self) -> String {
        let steps = if self.max_steps == 0 {
            format!("step {}", self.steps)
        } else {
            format!("step {}/{}", self.steps, self.max_steps)
        };
        let cost = if self.cost_limit.is_zero() {
            format!("cost {}", self.cost)
        } else {
            format!("cost {} of {}", self.cost, self.cost_limit)
        };
        format!("[{steps} | {cost} | elapsed {}s]", self.elapsed.as_secs())
    }
}

/// Text the agent sees for one observation.
pub fn render_observation(obs: &Observation, budget: &BudgetLine) -> String {
    let mut text = if obs.output.trim().is_empty() {
        "(no output)".to_string()
    } else {
        obs.output.trim_end().to_string()
    };
    match obs.exit {
        ExitStatus::Exited(0) | ExitStatus::None => {}
        ExitStatus::Exited(code) => text.push_str(&format!("\n(exit code {code})")),
        ExitStatus::Signaled => text.push_str("\n(killed by signal)"),
        ExitStatus::TimedOut => {}
    }
    text.push('\n');
    text.push_str(&budget.render());
    text
}

/// One completed exchange.
#[derive(Debug, Clone)]
pub struct Turn {
    pub model_output: String,
    pub observation: String,
}

/// Assembles the request for the next model call.
#[derive(Debug, Clone)]
pub struct HistoryBuilder {
    pub system_prompt: String,
    pub task_prompt: String,
    /// Observations older than the last `window` turns are replaced by a
    /// placeholder. `None` keeps everything.
    pub window: Option<usize>,
}

impl HistoryBuilder {
    pub fn build(&self, turns: &[Turn]) -> Vec<HistoryItem> {
        let mut items = Vec::with_capacity(turns.len() * 2 + 2);
        items.push(HistoryItem::system(self.system_prompt.clone()));
        items.push(HistoryItem::user(self.task_prompt.clone()));

        let keep_from = match self.window {
            Some(n) => turns.len().saturating_sub(n),
            None => 0,
        };
        for (i, turn) in turns.iter().enumerate() {
            items.push(HistoryItem::assistant(turn.model_output.clone()));
            if i < keep_from {
                let lines = turn.observation.lines().count();
                items.push(HistoryItem::user(format!("Old output omitted ({lines} lines)")));
            } else {
                items.push(HistoryItem::user(turn.observation.clone()));
            }
        }
        items
    }
}
