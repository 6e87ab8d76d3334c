pub mod parser;

use std::collections::BTreeSet;
use std::fmt;

use serde::{Deserialize, Serialize};

pub use parser::{parse, thought};

// ── Action registry ─────────────────────────────────────────────────

/// Closed set of action names the agent may use.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ActionKind {
    Execute,
    Train,
    Validate,
    ReadFile,
    EditFile,
    Submit,
    NoOp,
}

impl ActionKind {
    pub const ALL: [ActionKind; 7] = [
        ActionKind::Execute,
        ActionKind::Train,
        ActionKind::Validate,
        ActionKind::ReadFile,
        ActionKind::EditFile,
        ActionKind::Submit,
        ActionKind::NoOp,
    ];

    pub fn name(self) -> &'static str {
        match self {
            ActionKind::Execute => "execute",
            ActionKind::Train => "train",
            ActionKind::Validate => "validate",
            ActionKind::ReadFile => "read_file",
            ActionKind::EditFile => "edit_file",
            ActionKind::Submit => "submit",
            ActionKind::NoOp => "no_op",
        }
    }

    /// Look up an action by name. `-` is accepted in place of `_`, and
    /// `terminate` is an alias for `submit`.
    pub fn from_name(name: &str) -> Option<Self> {
        let normalized = name.replace('-', "_");
        if normalized == "terminate" {
            return Some(ActionKind::Submit);
        }
        Self::ALL.into_iter().find(|k| k.name() == normalized)
    }

    /// Deadline class for actions that reach the sandbox.
    pub fn timeout_class(self) -> Option<TimeoutClass> {
        match self {
            ActionKind::Execute | ActionKind::ReadFile | ActionKind::EditFile => {
                Some(TimeoutClass::Short)
            }
            ActionKind::Train | ActionKind::Validate => Some(TimeoutClass::Long),
            ActionKind::Submit | ActionKind::NoOp => None,
        }
    }
}

impl fmt::Display for ActionKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TimeoutClass {
    Short,
    Long,
}

/// The subset of [`ActionKind`] a task enables.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ActionRegistry {
    enabled: BTreeSet<ActionKind>,
}

impl Default for ActionRegistry {
    fn default() -> Self {
        Self {
            enabled: ActionKind::ALL.into_iter().collect(),
        }
    }
}

impl ActionRegistry {
    pub fn new(kinds: impl IntoIterator<Item = ActionKind>) -> Self {
        Self {
            enabled: kinds.into_iter().collect(),
        }
    }

    pub fn is_enabled(&self, kind: ActionKind) -> bool {
        self.enabled.contains(&kind)
    }

    pub fn kinds(&self) -> impl Iterator<Item = ActionKind> + '_ {
        self.enabled.iter().copied()
    }

    /// Comma-separated names, used in corrective feedback.
    pub fn describe(&self) -> String {
        self.enabled
            .iter()
            .map(|k| k.name())
            .collect::<Vec<_>>()
            .join(", ")
    }
}

// ── Parsed actions ──────────────────────────────────────────────────

/// Inclusive, 1-based line range for `edit_file`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct LineRange {
    pub start: usize,
    pub end: usize,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "action", rename_all = "snake_case")]
pub enum Action {
    Execute { command: String },
    Train { command: String },
    Validate,
    ReadFile { path: String },
    EditFile {
        path: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        range: Option<LineRange>,
        content: String,
    },
    Submit,
    NoOp,
}

impl Action {
    pub fn kind(&self) -> ActionKind {
        match self {
            Action::Execute { .. } => ActionKind::Execute,
            Action::Train { .. } => ActionKind::Train,
            Action::Validate => ActionKind::Validate,
            Action::ReadFile { .. } => ActionKind::ReadFile,
            Action::EditFile { .. } => ActionKind::EditFile,
            Action::Submit => ActionKind::Submit,
            Action::NoOp => ActionKind::NoOp,
        }
    }
}

/// Outcome of parsing one model reply. Unrecognized input is a value,
/// not an error: its reason goes back to the model as feedback.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum ParsedAction {
    Action(Action),
    Unrecognized { raw: String, reason: String },
}

impl ParsedAction {
    pub fn kind(&self) -> Option<ActionKind> {
        match self {
            ParsedAction::Action(a) => Some(a.kind()),
            ParsedAction::Unrecognized { .. } => None,
        }
    }

    pub fn is_submit(&self) -> bool {
        self.kind() == Some(ActionKind::Submit)
    }
}

// ── Edits ───────────────────────────────────────────────────────────

/// Apply an `edit_file` body to `original`. Without a range the whole
/// file is replaced. Errors are agent-facing messages.
pub fn apply_edit(original: &str, range: Option<LineRange>, content: &str) -> Result<String, String> {
    let Some(range) = range else {
        return Ok(content.to_string());
    };
    if range.start == 0 || range.start > range.end {
        return Err(format!("invalid line range {}:{}", range.start, range.end));
    }
    let lines: Vec<&str> = original.lines().collect();
    if range.end > lines.len() {
        return Err(format!(
            "line range {}:{} is past the end of the file ({} lines)",
            range.start,
            range.end,
            lines.len()
        ));
    }

    let mut out = String::with_capacity(original.len() + content.len());
    for line in &lines[..range.start - 1] {
        out.push_str(line);
        out.push('\n');
    }
    out.push_str(content);
    if !content.is_empty() && !content.ends_with('\n') {
        out.push('\n');
    }
    for line in &lines[range.end..] {
        out.push_str(line);
        out.push('\n');
    }
    if !original.ends_with('\n') && range.end < lines.len() {
        out.pop();
    }
    Ok(out)
}
