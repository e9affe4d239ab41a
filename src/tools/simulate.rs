//! Dry-run simulation of side-effecting tools.
//!
//! In dry-run mode the router never touches the filesystem or spawns
//! processes; it records what each call *would* have done (including a
//! line diff for file writes) and returns a success-looking result so
//! the LLM proceeds normally.

use serde_json::Value;
use std::path::Path;
use std::sync::Mutex;

/// One recorded would-have-run operation.
#[derive(Debug, Clone)]
pub struct SimulatedOperation {
    pub tool: String,
    /// One-line human summary, e.g. `write docs/plan.md (+12 lines)`.
    pub summary: String,
    /// Line diff for file writes; `None` for other tools.
    pub diff: Option<String>,
    pub arguments: Value,
}

/// Collects simulated operations for the duration of one command.
#[derive(Debug, Default)]
pub struct DryRunSimulator {
    operations: Mutex<Vec<SimulatedOperation>>,
}

impl DryRunSimulator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a simulated call and produce the stand-in tool output.
    pub fn simulate(&self, tool: &str, arguments: &Value, cwd: &Path) -> String {
        let (summary, diff, output) = match tool {
            "write" => simulate_write(arguments, cwd),
            "delete_file" => {
                let path = str_arg(arguments, "path");
                (
                    format!("delete {path}"),
                    None,
                    format!("[dry-run] Would delete file: {path}"),
                )
            }
            "search_replace" => {
                let path = str_arg(arguments, "path");
                (
                    format!("edit {path}"),
                    None,
                    format!("[dry-run] Would apply search/replace in: {path}"),
                )
            }
            "run_terminal_cmd" => {
                let command = str_arg(arguments, "command");
                (
                    format!("run `{command}`"),
                    None,
                    format!("[dry-run] Would run command: {command}"),
                )
            }
            other => (
                format!("{other} (simulated)"),
                None,
                format!("[dry-run] Would execute tool: {other}"),
            ),
        };

        self.operations
            .lock()
            .expect("simulator lock poisoned")
            .push(SimulatedOperation {
                tool: tool.to_string(),
                summary,
                diff,
                arguments: arguments.clone(),
            });
        output
    }

    /// All operations recorded so far, in call order.
    pub fn operations(&self) -> Vec<SimulatedOperation> {
        self.operations
            .lock()
            .expect("simulator lock poisoned")
            .clone()
    }

    pub fn clear(&self) {
        self.operations
            .lock()
            .expect("simulator lock poisoned")
            .clear();
    }
}

fn simulate_write(arguments: &Value, cwd: &Path) -> (String, Option<String>, String) {
    let path = str_arg(arguments, "path");
    let new_content = arguments
        .get("content")
        .and_then(Value::as_str)
        .unwrap_or_default();
    let old_content = std::fs::read_to_string(cwd.join(&path)).unwrap_or_default();
    let diff = diff_lines(&old_content, new_content);
    let added = new_content.lines().count();
    let summary = if old_content.is_empty() {
        format!("write {path} (+{added} lines)")
    } else {
        format!("write {path} ({} -> {added} lines)", old_content.lines().count())
    };
    let output = format!("[dry-run] Would write file: {path}\n{diff}");
    (summary, Some(diff), output)
}

fn str_arg<'a>(arguments: &'a Value, key: &str) -> &'a str {
    arguments.get(key).and_then(Value::as_str).unwrap_or("?")
}

/// Minimal line diff: trims the common prefix and suffix, then renders
/// the changed middle as `-`/`+` lines. Good enough for previews.
pub fn diff_lines(old: &str, new: &str) -> String {
    let old_lines: Vec<&str> = old.lines().collect();
    let new_lines: Vec<&str> = new.lines().collect();

    let mut prefix = 0;
    while prefix < old_lines.len()
        && prefix < new_lines.len()
        && old_lines[prefix] == new_lines[prefix]
    {
        prefix += 1;
    }

    let mut suffix = 0;
    while suffix < old_lines.len() - prefix
        && suffix < new_lines.len() - prefix
        && old_lines[old_lines.len() - 1 - suffix] == new_lines[new_lines.len() - 1 - suffix]
    {
        suffix += 1;
    }

    let mut out = String::new();
    for line in &old_lines[prefix..old_lines.len() - suffix] {
        out.push_str("- ");
        out.push_str(line);
        out.push('\n');
    }
    for line in &new_lines[prefix..new_lines.len() - suffix] {
        out.push_str("+ ");
        out.push_str(line);
        out.push('\n');
    }
    if out.is_empty() {
        out.push_str("(no changes)\n");
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_diff_new_file() {
        let diff = diff_lines("", "a\nb");
        assert_eq!(diff, "+ a\n+ b\n");
    }

    #[test]
    fn test_diff_changed_middle() {
        let diff = diff_lines("one\ntwo\nthree", "one\nTWO\nthree");
        assert_eq!(diff, "- two\n+ TWO\n");
    }

    #[test]
    fn test_diff_identical() {
        assert_eq!(diff_lines("same\n", "same\n"), "(no changes)\n");
    }

    #[test]
    fn test_simulate_write_records_diff() {
        let dir = tempfile::tempdir().unwrap();
        let sim = DryRunSimulator::new();
        let output = sim.simulate(
            "write",
            &json!({"path": "out.txt", "content": "hello\nworld"}),
            dir.path(),
        );
        assert!(output.contains("[dry-run] Would write file: out.txt"));
        assert!(output.contains("+ hello"));

        let ops = sim.operations();
        assert_eq!(ops.len(), 1);
        assert_eq!(ops[0].tool, "write");
        assert!(ops[0].summary.contains("+2 lines"));
        assert!(ops[0].diff.as_ref().unwrap().contains("+ world"));
    }

    #[test]
    fn test_simulate_terminal_cmd() {
        let dir = tempfile::tempdir().unwrap();
        let sim = DryRunSimulator::new();
        let output = sim.simulate("run_terminal_cmd", &json!({"command": "rm -rf build"}), dir.path());
        assert!(output.contains("Would run command: rm -rf build"));
        assert!(sim.operations()[0].diff.is_none());
    }

    #[test]
    fn test_clear() {
        let dir = tempfile::tempdir().unwrap();
        let sim = DryRunSimulator::new();
        sim.simulate("delete_file", &json!({"path": "x"}), dir.path());
        sim.clear();
        assert!(sim.operations().is_empty());
    }
}
