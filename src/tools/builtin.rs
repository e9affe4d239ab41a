//! Built-in tool implementations and their provider-facing definitions.
//!
//! Each tool takes its JSON arguments and returns either an output
//! string or an error message; the router wraps errors as
//! `Error: <message>` results so they reach the LLM instead of failing
//! the stage.

use crate::provider::ToolDefinition;
use once_cell::sync::Lazy;
use regex::Regex;
use serde_json::{json, Value};
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::Duration;
use tokio::process::Command;

/// Read tools refuse files larger than this.
pub const MAX_READ_BYTES: u64 = 1024 * 1024;

/// Default timeout for terminal commands.
pub const DEFAULT_CMD_TIMEOUT: Duration = Duration::from_secs(30);

const GREP_MAX_RESULTS: usize = 50;
const SEARCH_MAX_FILES: usize = 10;

/// Tools that only observe state; everything else is side-effecting.
pub const READ_ONLY_TOOLS: &[&str] = &[
    "read_file",
    "list_dir",
    "glob_file_search",
    "grep",
    "codebase_search",
    "query_session",
    "web_search",
];

/// Built-in tools whose effects must not be reapplied on retry.
pub const IDEMPOTENT_TOOLS: &[&str] =
    &["write", "search_replace", "delete_file", "run_terminal_cmd"];

/// Tools that create, edit, or remove files and need path validation.
pub const PATH_MUTATING_TOOLS: &[&str] = &["write", "search_replace", "delete_file"];

pub fn is_read_only(tool: &str) -> bool {
    READ_ONLY_TOOLS.contains(&tool)
}

pub fn is_idempotent(tool: &str) -> bool {
    IDEMPOTENT_TOOLS.contains(&tool)
}

pub fn mutates_path(tool: &str) -> bool {
    PATH_MUTATING_TOOLS.contains(&tool)
}

/// Provider-facing definitions for every built-in tool.
pub fn builtin_definitions() -> Vec<ToolDefinition> {
    fn def(name: &str, description: &str, parameters: Value) -> ToolDefinition {
        ToolDefinition {
            name: name.to_string(),
            description: description.to_string(),
            parameters,
        }
    }

    let path_param = |desc: &str| {
        json!({
            "type": "object",
            "properties": {"path": {"type": "string", "description": desc}},
            "required": ["path"]
        })
    };

    vec![
        def(
            "write",
            "Write a file, creating parent directories as needed. Overwrites existing content.",
            json!({
                "type": "object",
                "properties": {
                    "path": {"type": "string", "description": "File path relative to the project root"},
                    "content": {"type": "string", "description": "Full file content"}
                },
                "required": ["path", "content"]
            }),
        ),
        def(
            "read_file",
            "Read a UTF-8 text file. Files over 1 MiB are refused.",
            path_param("File path to read"),
        ),
        def(
            "search_replace",
            "Replace the first occurrence of a string in a file.",
            json!({
                "type": "object",
                "properties": {
                    "path": {"type": "string"},
                    "search": {"type": "string", "description": "Exact text to find"},
                    "replace": {"type": "string", "description": "Replacement text"}
                },
                "required": ["path", "search", "replace"]
            }),
        ),
        def("delete_file", "Delete a file.", path_param("File path to delete")),
        def(
            "run_terminal_cmd",
            "Run a shell command and capture its output. Default timeout 30s.",
            json!({
                "type": "object",
                "properties": {
                    "command": {"type": "string"},
                    "timeout_ms": {"type": "integer", "description": "Override the default timeout"}
                },
                "required": ["command"]
            }),
        ),
        def("list_dir", "List directory entries.", path_param("Directory path")),
        def(
            "glob_file_search",
            "Find files matching a glob pattern (`*`, `**`, `?`).",
            json!({
                "type": "object",
                "properties": {
                    "pattern": {"type": "string"},
                    "path": {"type": "string", "description": "Directory to search, default project root"}
                },
                "required": ["pattern"]
            }),
        ),
        def(
            "grep",
            "Search file contents with a regex, returning path:line matches.",
            json!({
                "type": "object",
                "properties": {
                    "pattern": {"type": "string"},
                    "path": {"type": "string"},
                    "max_results": {"type": "integer"}
                },
                "required": ["pattern"]
            }),
        ),
        def(
            "codebase_search",
            "Rank project files by relevance to a free-text query.",
            json!({
                "type": "object",
                "properties": {
                    "query": {"type": "string"},
                    "path": {"type": "string"}
                },
                "required": ["query"]
            }),
        ),
        def(
            "query_session",
            "Return metadata about the current session.",
            json!({"type": "object", "properties": {}}),
        ),
        def(
            "web_search",
            "Search the web via the configured search endpoint.",
            json!({
                "type": "object",
                "properties": {"query": {"type": "string"}},
                "required": ["query"]
            }),
        ),
    ]
}

/// Outcome of a built-in tool body: output text or an error message.
pub type ToolOutcome = std::result::Result<String, String>;

fn require_str<'a>(args: &'a Value, key: &str) -> std::result::Result<&'a str, String> {
    args.get(key)
        .and_then(Value::as_str)
        .ok_or_else(|| format!("missing required argument '{key}'"))
}

fn resolve_in(cwd: &Path, path: &str) -> PathBuf {
    let p = Path::new(path);
    if p.is_absolute() {
        p.to_path_buf()
    } else {
        cwd.join(p)
    }
}

pub async fn write_file(cwd: &Path, args: &Value) -> ToolOutcome {
    let path = require_str(args, "path")?;
    let content = require_str(args, "content")?;
    let full = resolve_in(cwd, path);
    if let Some(parent) = full.parent() {
        std::fs::create_dir_all(parent).map_err(|e| format!("cannot create {}: {e}", parent.display()))?;
    }
    std::fs::write(&full, content).map_err(|e| format!("cannot write {path}: {e}"))?;
    Ok(format!("File written: {path} ({} bytes)", content.len()))
}

pub async fn read_file(cwd: &Path, args: &Value) -> ToolOutcome {
    let path = require_str(args, "path")?;
    let full = resolve_in(cwd, path);
    let meta = std::fs::metadata(&full).map_err(|e| format!("cannot read {path}: {e}"))?;
    if meta.len() > MAX_READ_BYTES {
        return Err(format!(
            "{path} is {} bytes, over the {} byte read limit",
            meta.len(),
            MAX_READ_BYTES
        ));
    }
    std::fs::read_to_string(&full).map_err(|e| format!("cannot read {path}: {e}"))
}

pub async fn search_replace(cwd: &Path, args: &Value) -> ToolOutcome {
    let path = require_str(args, "path")?;
    let search = require_str(args, "search")?;
    let replace = require_str(args, "replace")?;
    let full = resolve_in(cwd, path);
    let content = std::fs::read_to_string(&full).map_err(|e| format!("cannot read {path}: {e}"))?;
    let Some(at) = content.find(search) else {
        return Err(format!("search text not found in {path}"));
    };
    let mut updated = String::with_capacity(content.len());
    updated.push_str(&content[..at]);
    updated.push_str(replace);
    updated.push_str(&content[at + search.len()..]);
    std::fs::write(&full, updated).map_err(|e| format!("cannot write {path}: {e}"))?;
    Ok(format!("Replaced first occurrence in {path}"))
}

pub async fn delete_file(cwd: &Path, args: &Value) -> ToolOutcome {
    let path = require_str(args, "path")?;
    let full = resolve_in(cwd, path);
    std::fs::remove_file(&full).map_err(|e| format!("cannot delete {path}: {e}"))?;
    Ok(format!("File deleted: {path}"))
}

pub async fn run_terminal_cmd(cwd: &Path, args: &Value) -> ToolOutcome {
    let command = require_str(args, "command")?;
    let timeout = args
        .get("timeout_ms")
        .and_then(Value::as_u64)
        .map(Duration::from_millis)
        .unwrap_or(DEFAULT_CMD_TIMEOUT);

    let child = Command::new("sh")
        .arg("-c")
        .arg(command)
        .current_dir(cwd)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true)
        .spawn()
        .map_err(|e| format!("cannot spawn command: {e}"))?;

    let output = match tokio::time::timeout(timeout, child.wait_with_output()).await {
        Ok(Ok(output)) => output,
        Ok(Err(e)) => return Err(format!("command failed: {e}")),
        Err(_) => return Err(format!("command timed out after {} ms", timeout.as_millis())),
    };

    let mut text = String::from_utf8_lossy(&output.stdout).into_owned();
    let stderr = String::from_utf8_lossy(&output.stderr);
    if !stderr.trim().is_empty() {
        if !text.is_empty() {
            text.push('\n');
        }
        text.push_str("[stderr]\n");
        text.push_str(stderr.trim_end());
    }
    if !output.status.success() {
        return Err(format!(
            "command exited with {}: {}",
            output.status.code().unwrap_or(-1),
            text.trim()
        ));
    }
    Ok(if text.is_empty() { "(no output)".into() } else { text })
}

pub async fn list_dir(cwd: &Path, args: &Value) -> ToolOutcome {
    let path = require_str(args, "path")?;
    let full = resolve_in(cwd, path);
    let entries = std::fs::read_dir(&full).map_err(|e| format!("cannot list {path}: {e}"))?;
    let mut names: Vec<String> = entries
        .flatten()
        .map(|e| {
            let mut name = e.file_name().to_string_lossy().into_owned();
            if e.file_type().map(|t| t.is_dir()).unwrap_or(false) {
                name.push('/');
            }
            name
        })
        .collect();
    names.sort();
    Ok(if names.is_empty() { "(empty)".into() } else { names.join("\n") })
}

pub async fn glob_file_search(cwd: &Path, args: &Value) -> ToolOutcome {
    let pattern = require_str(args, "pattern")?;
    let root = args
        .get("path")
        .and_then(Value::as_str)
        .map(|p| resolve_in(cwd, p))
        .unwrap_or_else(|| cwd.to_path_buf());

    let re = glob_to_regex(pattern)?;
    let mut matches = Vec::new();
    for file in walk_files(&root) {
        let rel = file
            .strip_prefix(&root)
            .unwrap_or(&file)
            .to_string_lossy()
            .replace('\\', "/");
        if re.is_match(&rel) {
            matches.push(rel);
        }
    }
    matches.sort();
    Ok(if matches.is_empty() {
        format!("No files matching {pattern}")
    } else {
        matches.join("\n")
    })
}

pub async fn grep(cwd: &Path, args: &Value) -> ToolOutcome {
    let pattern = require_str(args, "pattern")?;
    let root = args
        .get("path")
        .and_then(Value::as_str)
        .map(|p| resolve_in(cwd, p))
        .unwrap_or_else(|| cwd.to_path_buf());
    let max_results = args
        .get("max_results")
        .and_then(Value::as_u64)
        .map(|n| n as usize)
        .unwrap_or(GREP_MAX_RESULTS);

    let re = Regex::new(pattern).map_err(|e| format!("invalid pattern: {e}"))?;
    let mut results = Vec::new();
    'files: for file in walk_files(&root) {
        let Some(content) = readable_text(&file) else {
            continue;
        };
        for (line_no, line) in content.lines().enumerate() {
            if re.is_match(line) {
                let rel = file.strip_prefix(&root).unwrap_or(&file).to_string_lossy().into_owned();
                results.push(format!("{rel}:{}:{}", line_no + 1, line.trim_end()));
                if results.len() >= max_results {
                    break 'files;
                }
            }
        }
    }
    Ok(if results.is_empty() { "No matches".into() } else { results.join("\n") })
}

pub async fn codebase_search(cwd: &Path, args: &Value) -> ToolOutcome {
    let query = require_str(args, "query")?;
    let root = args
        .get("path")
        .and_then(Value::as_str)
        .map(|p| resolve_in(cwd, p))
        .unwrap_or_else(|| cwd.to_path_buf());

    let terms: Vec<String> = query
        .split_whitespace()
        .map(|t| t.to_lowercase())
        .filter(|t| t.len() > 2)
        .collect();
    if terms.is_empty() {
        return Err("query has no searchable terms".into());
    }

    let mut scored: Vec<(usize, String, String)> = Vec::new();
    for file in walk_files(&root) {
        let Some(content) = readable_text(&file) else {
            continue;
        };
        let lower = content.to_lowercase();
        let score: usize = terms.iter().map(|t| lower.matches(t.as_str()).count()).sum();
        if score == 0 {
            continue;
        }
        let snippet = content
            .lines()
            .find(|l| {
                let ll = l.to_lowercase();
                terms.iter().any(|t| ll.contains(t.as_str()))
            })
            .unwrap_or_default()
            .trim()
            .to_string();
        let rel = file.strip_prefix(&root).unwrap_or(&file).to_string_lossy().into_owned();
        scored.push((score, rel, snippet));
    }
    scored.sort_by(|a, b| b.0.cmp(&a.0).then_with(|| a.1.cmp(&b.1)));
    scored.truncate(SEARCH_MAX_FILES);

    Ok(if scored.is_empty() {
        "No relevant files".into()
    } else {
        scored
            .into_iter()
            .map(|(score, path, snippet)| format!("{path} (relevance {score}): {snippet}"))
            .collect::<Vec<_>>()
            .join("\n")
    })
}

pub async fn web_search(endpoint: Option<&str>, args: &Value) -> ToolOutcome {
    let query = require_str(args, "query")?;
    let Some(endpoint) = endpoint else {
        return Err("web search endpoint not configured".into());
    };
    let client = reqwest::Client::new();
    let response = client
        .get(endpoint)
        .query(&[("q", query)])
        .send()
        .await
        .map_err(|e| format!("web search request failed: {e}"))?;
    if !response.status().is_success() {
        return Err(format!("web search returned {}", response.status()));
    }
    response
        .text()
        .await
        .map_err(|e| format!("web search response unreadable: {e}"))
}

/// Translate a glob pattern to an anchored regex. `**` crosses path
/// separators, `*` and `?` do not.
fn glob_to_regex(pattern: &str) -> std::result::Result<Regex, String> {
    let mut re = String::from("^");
    let mut chars = pattern.chars().peekable();
    while let Some(ch) = chars.next() {
        match ch {
            '*' => {
                if chars.peek() == Some(&'*') {
                    chars.next();
                    // Swallow a following separator so `**/x` matches `x`.
                    if chars.peek() == Some(&'/') {
                        chars.next();
                        re.push_str("(?:.*/)?");
                    } else {
                        re.push_str(".*");
                    }
                } else {
                    re.push_str("[^/]*");
                }
            }
            '?' => re.push_str("[^/]"),
            '.' | '+' | '(' | ')' | '[' | ']' | '{' | '}' | '^' | '$' | '|' | '\\' => {
                re.push('\\');
                re.push(ch);
            }
            other => re.push(other),
        }
    }
    re.push('$');
    Regex::new(&re).map_err(|e| format!("invalid glob pattern: {e}"))
}

static SKIP_DIRS: Lazy<Vec<&'static str>> = Lazy::new(|| vec![".git", "target", "node_modules"]);

/// Depth-first file walk skipping VCS/build directories and dotfiles.
fn walk_files(root: &Path) -> Vec<PathBuf> {
    let mut files = Vec::new();
    let mut stack = vec![root.to_path_buf()];
    while let Some(dir) = stack.pop() {
        let Ok(entries) = std::fs::read_dir(&dir) else {
            continue;
        };
        for entry in entries.flatten() {
            let path = entry.path();
            let name = entry.file_name().to_string_lossy().into_owned();
            if path.is_dir() {
                if !name.starts_with('.') && !SKIP_DIRS.contains(&name.as_str()) {
                    stack.push(path);
                }
            } else {
                files.push(path);
            }
        }
    }
    files.sort();
    files
}

/// Read a file as text if it is small and not binary.
fn readable_text(path: &Path) -> Option<String> {
    let meta = std::fs::metadata(path).ok()?;
    if meta.len() > MAX_READ_BYTES {
        return None;
    }
    let bytes = std::fs::read(path).ok()?;
    if bytes.contains(&0) {
        return None;
    }
    String::from_utf8(bytes).ok()
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn project() -> tempfile::TempDir {
        let dir = tempfile::tempdir().unwrap();
        std::fs::create_dir_all(dir.path().join("src")).unwrap();
        std::fs::write(dir.path().join("src/main.rs"), "fn main() {\n    start_server();\n}\n").unwrap();
        std::fs::write(dir.path().join("src/server.rs"), "pub fn start_server() {}\n").unwrap();
        std::fs::write(dir.path().join("README.md"), "# demo\nserver docs\n").unwrap();
        dir
    }

    #[tokio::test]
    async fn test_write_and_read_round_trip() {
        let dir = project();
        let out = write_file(dir.path(), &json!({"path": "notes/a.txt", "content": "hi"}))
            .await
            .unwrap();
        assert!(out.contains("File written: notes/a.txt"));
        let content = read_file(dir.path(), &json!({"path": "notes/a.txt"})).await.unwrap();
        assert_eq!(content, "hi");
    }

    #[tokio::test]
    async fn test_read_file_size_cap() {
        let dir = project();
        let big = "x".repeat((MAX_READ_BYTES + 1) as usize);
        std::fs::write(dir.path().join("big.txt"), big).unwrap();
        let err = read_file(dir.path(), &json!({"path": "big.txt"})).await.unwrap_err();
        assert!(err.contains("read limit"));
    }

    #[tokio::test]
    async fn test_search_replace_first_occurrence() {
        let dir = project();
        std::fs::write(dir.path().join("x.txt"), "aaa bbb aaa").unwrap();
        search_replace(
            dir.path(),
            &json!({"path": "x.txt", "search": "aaa", "replace": "ccc"}),
        )
        .await
        .unwrap();
        let content = std::fs::read_to_string(dir.path().join("x.txt")).unwrap();
        assert_eq!(content, "ccc bbb aaa");
    }

    #[tokio::test]
    async fn test_search_replace_missing_text() {
        let dir = project();
        std::fs::write(dir.path().join("x.txt"), "abc").unwrap();
        let err = search_replace(
            dir.path(),
            &json!({"path": "x.txt", "search": "zzz", "replace": "y"}),
        )
        .await
        .unwrap_err();
        assert!(err.contains("not found"));
    }

    #[tokio::test]
    async fn test_delete_file() {
        let dir = project();
        std::fs::write(dir.path().join("x.txt"), "bye").unwrap();
        delete_file(dir.path(), &json!({"path": "x.txt"})).await.unwrap();
        assert!(!dir.path().join("x.txt").exists());
    }

    #[tokio::test]
    async fn test_run_terminal_cmd_captures_output() {
        let dir = project();
        let out = run_terminal_cmd(dir.path(), &json!({"command": "echo hello"})).await.unwrap();
        assert_eq!(out.trim(), "hello");
    }

    #[tokio::test]
    async fn test_run_terminal_cmd_nonzero_exit() {
        let dir = project();
        let err = run_terminal_cmd(dir.path(), &json!({"command": "echo oops >&2; exit 3"}))
            .await
            .unwrap_err();
        assert!(err.contains("exited with 3"));
        assert!(err.contains("oops"));
    }

    #[tokio::test]
    async fn test_run_terminal_cmd_timeout() {
        let dir = project();
        let err = run_terminal_cmd(dir.path(), &json!({"command": "sleep 5", "timeout_ms": 50}))
            .await
            .unwrap_err();
        assert!(err.contains("timed out"));
    }

    #[tokio::test]
    async fn test_list_dir() {
        let dir = project();
        let out = list_dir(dir.path(), &json!({"path": "."})).await.unwrap();
        assert!(out.contains("src/"));
        assert!(out.contains("README.md"));
    }

    #[tokio::test]
    async fn test_glob_file_search() {
        let dir = project();
        let out = glob_file_search(dir.path(), &json!({"pattern": "**/*.rs"})).await.unwrap();
        assert!(out.contains("src/main.rs"));
        assert!(out.contains("src/server.rs"));
        assert!(!out.contains("README.md"));
    }

    #[tokio::test]
    async fn test_glob_single_star_stays_in_dir() {
        let dir = project();
        let out = glob_file_search(dir.path(), &json!({"pattern": "*.md"})).await.unwrap();
        assert!(out.contains("README.md"));
        assert!(!out.contains("main.rs"));
    }

    #[tokio::test]
    async fn test_grep_matches_with_line_numbers() {
        let dir = project();
        let out = grep(dir.path(), &json!({"pattern": "start_server"})).await.unwrap();
        assert!(out.contains("src/main.rs:2:"));
        assert!(out.contains("src/server.rs:1:"));
    }

    #[tokio::test]
    async fn test_grep_respects_max_results() {
        let dir = project();
        let out = grep(dir.path(), &json!({"pattern": ".", "max_results": 2})).await.unwrap();
        assert_eq!(out.lines().count(), 2);
    }

    #[tokio::test]
    async fn test_codebase_search_ranks_by_term_frequency() {
        let dir = project();
        let out = codebase_search(dir.path(), &json!({"query": "server"})).await.unwrap();
        let first = out.lines().next().unwrap();
        assert!(first.contains("relevance"));
    }

    #[tokio::test]
    async fn test_web_search_unconfigured() {
        let err = web_search(None, &json!({"query": "rust"})).await.unwrap_err();
        assert!(err.contains("not configured"));
    }

    #[test]
    fn test_glob_to_regex_shapes() {
        assert!(glob_to_regex("**/*.rs").unwrap().is_match("a/b/c.rs"));
        assert!(glob_to_regex("**/*.rs").unwrap().is_match("top.rs"));
        assert!(!glob_to_regex("*.rs").unwrap().is_match("a/b.rs"));
        assert!(glob_to_regex("src/?.txt").unwrap().is_match("src/a.txt"));
        assert!(!glob_to_regex("src/?.txt").unwrap().is_match("src/ab.txt"));
    }

    #[test]
    fn test_classification() {
        assert!(is_read_only("read_file"));
        assert!(!is_read_only("write"));
        assert!(is_idempotent("run_terminal_cmd"));
        assert!(!is_idempotent("grep"));
        assert!(mutates_path("delete_file"));
        assert!(!mutates_path("run_terminal_cmd"));
    }
}
