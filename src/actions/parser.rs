use std::sync::LazyLock;

use regex::Regex;

use super::{Action, ActionKind, ActionRegistry, LineRange, ParsedAction};

/// A line that opens or closes a fenced block: three or more backticks,
/// optionally followed by a language tag.
static FENCE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^\s*`{3,}\s*([A-Za-z0-9_+.-]*)\s*$").expect("valid regex"));

const EDIT_TERMINATOR: &str = "end_of_edit";

struct Split {
    command: Option<String>,
    thought: String,
}

/// Split a model reply into the last fenced block and the discussion
/// around it. A fence left open runs to the end of the text.
fn split_reply(raw: &str) -> Split {
    let mut blocks: Vec<Vec<&str>> = Vec::new();
    let mut outside: Vec<&str> = Vec::new();
    let mut current: Option<Vec<&str>> = None;

    for line in raw.lines() {
        let line = line.strip_suffix('\r').unwrap_or(line);
        if current.is_none() {
            if FENCE.is_match(line) {
                current = Some(Vec::new());
            } else {
                outside.push(line);
            }
        } else if FENCE.captures(line).is_some_and(|c| c[1].is_empty()) {
            blocks.extend(current.take());
        } else if let Some(body) = current.as_mut() {
            body.push(line);
        }
    }
    if let Some(body) = current {
        blocks.push(body);
    }

    match blocks.pop() {
        Some(last) => {
            // Earlier blocks are discussion, not commands.
            for block in &blocks {
                outside.extend(block.iter().copied());
            }
            Split {
                command: Some(last.join("\n")),
                thought: outside.join("\n").trim().to_string(),
            }
        }
        None => Split {
            command: None,
            thought: String::new(),
        },
    }
}

/// Discussion text surrounding the command, kept for the trajectory.
pub fn thought(raw: &str) -> String {
    split_reply(raw).thought
}

/// Parse a raw model reply into an action of the registry.
pub fn parse(raw: &str, registry: &ActionRegistry) -> ParsedAction {
    let split = split_reply(raw);
    let text = split.command.unwrap_or_else(|| raw.to_string());
    match parse_command(&text, registry) {
        Ok(action) => ParsedAction::Action(action),
        Err(reason) => ParsedAction::Unrecognized {
            raw: raw.to_string(),
            reason,
        },
    }
}

fn parse_command(text: &str, registry: &ActionRegistry) -> Result<Action, String> {
    // Keep indentation of body lines, drop blank lines around the command.
    let text = text.trim_matches(|c: char| c == '\n' || c == '\r').trim_end();
    let text = text.trim_start_matches(|c: char| c.is_whitespace() && c != '\n');
    if text.trim().is_empty() {
        return Err(format!(
            "no action found. Reply with one command in a fenced block, using one of: {}",
            registry.describe()
        ));
    }

    let (first_line, rest) = match text.split_once('\n') {
        Some((first, rest)) => (first, rest),
        None => (text, ""),
    };
    let first_line = first_line.trim();
    let (name, args) = match first_line.split_once(char::is_whitespace) {
        Some((name, args)) => (name, args.trim()),
        None => (first_line, ""),
    };

    let Some(kind) = ActionKind::from_name(name) else {
        return Err(format!(
            "unknown action `{name}`. Available actions: {}",
            registry.describe()
        ));
    };
    if !registry.is_enabled(kind) {
        return Err(format!(
            "action `{kind}` is not available for this task. Available actions: {}",
            registry.describe()
        ));
    }

    match kind {
        ActionKind::Execute | ActionKind::Train => {
            let command = join_command(args, rest);
            if command.is_empty() {
                return Err(format!("`{kind}` requires a command, e.g. `{kind} python train.py`"));
            }
            Ok(if kind == ActionKind::Execute {
                Action::Execute { command }
            } else {
                Action::Train { command }
            })
        }
        ActionKind::ReadFile => {
            let mut tokens = args.split_whitespace();
            let (Some(path), None) = (tokens.next(), tokens.next()) else {
                return Err("`read_file` takes exactly one path".into());
            };
            if !rest.trim().is_empty() {
                return Err("`read_file` takes exactly one path".into());
            }
            Ok(Action::ReadFile { path: path.to_string() })
        }
        ActionKind::EditFile => parse_edit(args, rest),
        ActionKind::Validate | ActionKind::Submit | ActionKind::NoOp => {
            if !args.is_empty() || !rest.trim().is_empty() {
                return Err(format!("`{kind}` takes no arguments"));
            }
            Ok(match kind {
                ActionKind::Validate => Action::Validate,
                ActionKind::Submit => Action::Submit,
                _ => Action::NoOp,
            })
        }
    }
}

fn join_command(args: &str, rest: &str) -> String {
    let rest = rest.trim_end();
    match (args.is_empty(), rest.trim().is_empty()) {
        (true, true) => String::new(),
        (false, true) => args.to_string(),
        (true, false) => rest.trim_start_matches('\n').to_string(),
        (false, false) => format!("{args}\n{rest}"),
    }
}

fn parse_edit(args: &str, rest: &str) -> Result<Action, String> {
    let usage = "usage: `edit_file <path> [start:end]`, then the new lines, then `end_of_edit`";
    let mut tokens = args.split_whitespace();
    let Some(path) = tokens.next() else {
        return Err(format!("`edit_file` requires a path; {usage}"));
    };
    let range = match tokens.next() {
        None => None,
        Some(spec) => Some(parse_range(spec).ok_or_else(|| {
            format!("invalid line range `{spec}`; expected start:end with 1 <= start <= end")
        })?),
    };
    if tokens.next().is_some() {
        return Err(format!("too many arguments to `edit_file`; {usage}"));
    }

    let mut lines = rest.lines();
    let mut body: Vec<&str> = Vec::new();
    let mut terminated = false;
    for line in lines.by_ref() {
        if line.trim() == EDIT_TERMINATOR {
            terminated = true;
            break;
        }
        body.push(line);
    }
    if !terminated {
        return Err(format!("`edit_file` body is missing the `{EDIT_TERMINATOR}` line; {usage}"));
    }
    if lines.any(|line| !line.trim().is_empty()) {
        return Err(format!("unexpected text after `{EDIT_TERMINATOR}`; {usage}"));
    }

    let mut content = body.join("\n");
    if !body.is_empty() {
        content.push('\n');
    }
    Ok(Action::EditFile {
        path: path.to_string(),
        range,
        content,
    })
}

fn parse_range(spec: &str) -> Option<LineRange> {
    let (start, end) = spec.split_once(':')?;
    let start: usize = start.trim().parse().ok()?;
    let end: usize = end.trim().parse().ok()?;
    (start >= 1 && start <= end).then_some(LineRange { start, end })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn all() -> ActionRegistry {
        ActionRegistry::default()
    }

    fn action(raw: &str) -> Action {
        match parse(raw, &all()) {
            ParsedAction::Action(a) => a,
            ParsedAction::Unrecognized { reason, .. } => panic!("unexpected parse error: {reason}"),
        }
    }

    fn reason(raw: &str) -> String {
        match parse(raw, &all()) {
            ParsedAction::Unrecognized { reason, .. } => reason,
            ParsedAction::Action(a) => panic!("expected parse error, got {a:?}"),
        }
    }

    #[test]
    fn fenced_execute_with_discussion() {
        let raw = "DISCUSSION\nLet's look around first.\n```bash\nexecute ls -la data/\n```\n";
        assert_eq!(action(raw), Action::Execute { command: "ls -la data/".into() });
        assert_eq!(thought(raw), "DISCUSSION\nLet's look around first.");
    }

    #[test]
    fn crlf_and_indentation_are_tolerated() {
        let raw = "ok\r\n```\r\n   train   python train.py --epochs 3  \r\n```\r\n";
        assert_eq!(action(raw), Action::Train { command: "python train.py --epochs 3".into() });
    }

    #[test]
    fn unfenced_reply_is_parsed_whole() {
        assert_eq!(action("  submit \n"), Action::Submit);
        assert_eq!(action("no-op"), Action::NoOp);
    }

    #[test]
    fn last_block_wins_and_missing_close_is_tolerated() {
        let raw = "```\nexecute echo first\n```\nthen\n```\nexecute echo second";
        assert_eq!(action(raw), Action::Execute { command: "echo second".into() });
        assert!(thought(raw).contains("execute echo first"));
    }

    #[test]
    fn multiline_command_is_kept() {
        let raw = "```\nexecute cat > run.sh <<'EOF'\npython train.py\nEOF\n```";
        assert_eq!(
            action(raw),
            Action::Execute { command: "cat > run.sh <<'EOF'\npython train.py\nEOF".into() }
        );
    }

    #[test]
    fn unknown_name_lists_available_actions() {
        let r = reason("```\nfly_to_moon now\n```");
        assert!(r.contains("unknown action `fly_to_moon`"));
        assert!(r.contains("execute, train"));
    }

    #[test]
    fn disabled_action_is_unrecognized() {
        let reg = ActionRegistry::new([ActionKind::Execute, ActionKind::Submit]);
        let parsed = parse("```\ntrain python train.py\n```", &reg);
        let ParsedAction::Unrecognized { raw, reason } = parsed else {
            panic!("train should be disabled");
        };
        assert!(raw.contains("train python"));
        assert!(reason.contains("not available"));
        assert!(reason.contains("execute, submit"));
    }

    #[test]
    fn missing_required_arguments() {
        assert!(reason("```\nexecute\n```").contains("requires a command"));
        assert!(reason("```\nread_file\n```").contains("exactly one path"));
        assert!(reason("```\nread_file a.py b.py\n```").contains("exactly one path"));
        assert!(reason("```\nsubmit now please\n```").contains("no arguments"));
        assert!(reason("").contains("no action found"));
        assert!(reason("```\n\n```").contains("no action found"));
    }

    #[test]
    fn read_file_single_path() {
        assert_eq!(action("```\nread_file src/model.py\n```"), Action::ReadFile { path: "src/model.py".into() });
    }

    #[test]
    fn edit_file_with_range_keeps_indentation() {
        let raw = "```\nedit_file train.py 3:4\n    lr = 0.01\n    epochs = 5\nend_of_edit\n```";
        assert_eq!(
            action(raw),
            Action::EditFile {
                path: "train.py".into(),
                range: Some(LineRange { start: 3, end: 4 }),
                content: "    lr = 0.01\n    epochs = 5\n".into(),
            }
        );
    }

    #[test]
    fn edit_file_whole_file() {
        let raw = "```python\nedit_file notes.md\n# Notes\nend_of_edit\n```";
        assert_eq!(
            action(raw),
            Action::EditFile { path: "notes.md".into(), range: None, content: "# Notes\n".into() }
        );
    }

    #[test]
    fn edit_file_errors() {
        assert!(reason("```\nedit_file a.py\nx = 1\n```").contains("end_of_edit"));
        assert!(reason("```\nedit_file a.py 5:2\nx\nend_of_edit\n```").contains("invalid line range"));
        assert!(reason("```\nedit_file a.py 0:2\nx\nend_of_edit\n```").contains("invalid line range"));
        assert!(reason("```\nedit_file\n```").contains("requires a path"));
    }

    #[test]
    fn text_after_edit_terminator_is_rejected() {
        let r = reason("```\nedit_file a.py\nx = 1\nend_of_edit\npython a.py\n```");
        assert!(r.contains("unexpected text after `end_of_edit`"), "{r}");
        // Trailing blank lines are fine.
        assert!(matches!(action("```\nedit_file a.py\nx = 1\nend_of_edit\n\n```"), Action::EditFile { .. }));
    }

    #[test]
    fn terminate_alias_submits() {
        assert_eq!(action("```\nterminate\n```"), Action::Submit);
    }
}
