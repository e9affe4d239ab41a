//! User-configured shell hooks around tool calls.
//!
//! Hooks are external shell commands matched by tool-name regex and run
//! before (`PreToolUse`) or after (`PostToolUse`) each tool call, with
//! the call details piped as JSON on stdin. Pre hooks may rewrite tool
//! arguments (exit 0 with `updatedInput`) or deny the call (exit 2);
//! every other outcome fails open. Post hooks are strictly
//! informational and can never block.

use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::Mutex;
use std::time::{Duration, SystemTime};
use tokio::io::AsyncWriteExt;
use tokio::process::Command;

/// Default per-hook timeout.
pub const DEFAULT_HOOK_TIMEOUT: Duration = Duration::from_secs(10);

/// One shell command attached to a matcher.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HookCommand {
    pub command: String,

    #[serde(default)]
    pub timeout_ms: Option<u64>,

    /// Post-only: fire-and-forget instead of awaited.
    #[serde(default, rename = "async")]
    pub run_async: bool,
}

/// A regex over tool names with the hooks it contributes.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HookMatcher {
    pub matcher: String,
    pub hooks: Vec<HookCommand>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct HooksConfig {
    #[serde(default, rename = "PreToolUse")]
    pub pre_tool_use: Vec<HookMatcher>,

    #[serde(default, rename = "PostToolUse")]
    pub post_tool_use: Vec<HookMatcher>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
struct HooksFile {
    #[serde(default)]
    hooks: HooksConfig,
}

/// Outcome of the PreToolUse chain for one call.
#[derive(Debug, Clone, PartialEq)]
pub enum PreDecision {
    Allow {
        /// Replacement tool arguments, when a hook rewrote them.
        updated_input: Option<Value>,
    },
    Deny {
        reason: String,
    },
}

/// Context piped to every hook as JSON on stdin.
#[derive(Debug, Clone, Copy)]
pub struct HookInput<'a> {
    pub tool_name: &'a str,
    pub tool_input: &'a Value,
    pub cwd: &'a Path,
    pub session_id: Option<&'a str>,
    /// Present for PostToolUse only.
    pub tool_result: Option<&'a str>,
}

impl HookInput<'_> {
    fn to_json(&self, event: &str) -> Value {
        let mut payload = json!({
            "hook_event_name": event,
            "tool_name": self.tool_name,
            "tool_input": self.tool_input,
            "cwd": self.cwd.to_string_lossy(),
            "session_id": self.session_id,
        });
        if let Some(result) = self.tool_result {
            payload["tool_result"] = json!(result);
        }
        payload
    }
}

struct CachedConfig {
    primary_mtime: Option<SystemTime>,
    secondary_mtime: Option<SystemTime>,
    config: HooksConfig,
}

/// Loads hook configuration lazily and runs matched hooks.
pub struct HookEngine {
    primary: PathBuf,
    secondary: Option<PathBuf>,
    cached: Mutex<Option<CachedConfig>>,
}

impl HookEngine {
    pub fn new(primary: impl Into<PathBuf>) -> Self {
        Self {
            primary: primary.into(),
            secondary: None,
            cached: Mutex::new(None),
        }
    }

    /// Add a secondary config source. Primary matchers override
    /// secondary ones with the same pattern.
    pub fn with_secondary(mut self, secondary: impl Into<PathBuf>) -> Self {
        self.secondary = Some(secondary.into());
        self
    }

    /// Current config, reloading when either source file changed on disk.
    pub fn config(&self) -> HooksConfig {
        let primary_mtime = mtime(&self.primary);
        let secondary_mtime = self.secondary.as_deref().and_then(mtime);

        let mut cached = self.cached.lock().expect("hook config lock poisoned");
        if let Some(c) = cached.as_ref() {
            if c.primary_mtime == primary_mtime && c.secondary_mtime == secondary_mtime {
                return c.config.clone();
            }
        }

        let config = self.load_merged();
        *cached = Some(CachedConfig {
            primary_mtime,
            secondary_mtime,
            config: config.clone(),
        });
        config
    }

    fn load_merged(&self) -> HooksConfig {
        let primary = load_file(&self.primary);
        let secondary = self.secondary.as_deref().map(load_file).unwrap_or_default();
        HooksConfig {
            pre_tool_use: merge_matchers(primary.pre_tool_use, secondary.pre_tool_use),
            post_tool_use: merge_matchers(primary.post_tool_use, secondary.post_tool_use),
        }
    }

    /// Run the PreToolUse chain for a tool call. Hooks run sequentially
    /// in match order; the first deny wins, and argument rewrites feed
    /// into subsequent hooks.
    pub async fn run_pre(&self, input: HookInput<'_>) -> PreDecision {
        let config = self.config();
        let hooks = matched_hooks(&config.pre_tool_use, input.tool_name);

        let mut current_input = input.tool_input.clone();
        for hook in hooks {
            let ctx = HookInput {
                tool_input: &current_input,
                ..input
            };
            match run_hook(&hook, &ctx.to_json("PreToolUse")).await {
                HookOutcome::Completed { exit_code: 0, stdout, .. } => {
                    if let Some(updated) = parse_updated_input(&stdout) {
                        current_input = updated;
                    }
                }
                HookOutcome::Completed { exit_code: 2, stdout, stderr } => {
                    return PreDecision::Deny {
                        reason: deny_reason(&stdout, &stderr),
                    };
                }
                HookOutcome::Completed { exit_code, .. } => {
                    tracing::warn!(
                        command = %hook.command,
                        exit_code,
                        "pre hook exited abnormally, allowing"
                    );
                }
                HookOutcome::TimedOut => {
                    tracing::warn!(command = %hook.command, "pre hook timed out, allowing");
                }
                HookOutcome::SpawnFailed(e) => {
                    tracing::warn!(command = %hook.command, error = %e, "pre hook failed to spawn, allowing");
                }
            }
        }

        let updated_input = (current_input != *input.tool_input).then_some(current_input);
        PreDecision::Allow { updated_input }
    }

    /// Run the PostToolUse chain. Sync hooks are awaited but can never
    /// block the call; async hooks are fire-and-forget.
    pub async fn run_post(&self, input: HookInput<'_>) {
        let config = self.config();
        let hooks = matched_hooks(&config.post_tool_use, input.tool_name);
        let payload = input.to_json("PostToolUse");

        for hook in hooks {
            if hook.run_async {
                let payload = payload.clone();
                tokio::spawn(async move {
                    if let HookOutcome::SpawnFailed(e) = run_hook(&hook, &payload).await {
                        tracing::warn!(command = %hook.command, error = %e, "async post hook failed");
                    }
                });
            } else if let HookOutcome::Completed { exit_code, stderr, .. } =
                run_hook(&hook, &payload).await
            {
                if exit_code != 0 {
                    tracing::warn!(command = %hook.command, exit_code, %stderr, "post hook failed");
                }
            }
        }
    }
}

/// Collect hooks from every matcher whose regex tests positively
/// against the tool name. Invalid patterns are skipped; patterns the
/// safety check flags as ReDoS-risky are skipped with a warning.
fn matched_hooks(matchers: &[HookMatcher], tool_name: &str) -> Vec<HookCommand> {
    let mut hooks = Vec::new();
    for matcher in matchers {
        if is_redos_risky(&matcher.matcher) {
            tracing::warn!(pattern = %matcher.matcher, "skipping ReDoS-risky hook matcher");
            continue;
        }
        match regex::Regex::new(&matcher.matcher) {
            Ok(re) if re.is_match(tool_name) => hooks.extend(matcher.hooks.iter().cloned()),
            Ok(_) => {}
            Err(e) => {
                tracing::warn!(pattern = %matcher.matcher, error = %e, "skipping invalid hook matcher");
            }
        }
    }
    hooks
}

/// Heuristic for catastrophic-backtracking patterns: a quantified group
/// whose body itself carries a quantifier, e.g. `(a+)+` or `(.*)*`.
fn is_redos_risky(pattern: &str) -> bool {
    let bytes = pattern.as_bytes();
    let mut depth_quantified: Vec<bool> = Vec::new();
    let mut i = 0;
    while i < bytes.len() {
        match bytes[i] {
            b'\\' => i += 1,
            b'(' => depth_quantified.push(false),
            b'*' | b'+' => {
                if let Some(inner) = depth_quantified.last_mut() {
                    *inner = true;
                }
            }
            b')' => {
                let inner = depth_quantified.pop().unwrap_or(false);
                let next = bytes.get(i + 1);
                if inner && matches!(next, Some(b'*') | Some(b'+') | Some(b'{')) {
                    return true;
                }
                // Propagate: an outer group containing this one is also
                // quantified-inside once this group gets a quantifier.
                if let (true, Some(outer)) = (inner, depth_quantified.last_mut()) {
                    *outer = true;
                }
            }
            _ => {}
        }
        i += 1;
    }
    false
}

enum HookOutcome {
    Completed {
        exit_code: i32,
        stdout: String,
        stderr: String,
    },
    TimedOut,
    SpawnFailed(std::io::Error),
}

async fn run_hook(hook: &HookCommand, payload: &Value) -> HookOutcome {
    let timeout = hook
        .timeout_ms
        .map(Duration::from_millis)
        .unwrap_or(DEFAULT_HOOK_TIMEOUT);

    let mut child = match Command::new("sh")
        .arg("-c")
        .arg(&hook.command)
        .stdin(Stdio::piped())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true)
        .spawn()
    {
        Ok(child) => child,
        Err(e) => return HookOutcome::SpawnFailed(e),
    };

    if let Some(mut stdin) = child.stdin.take() {
        let bytes = payload.to_string().into_bytes();
        let _ = stdin.write_all(&bytes).await;
        drop(stdin);
    }

    match tokio::time::timeout(timeout, child.wait_with_output()).await {
        Ok(Ok(output)) => HookOutcome::Completed {
            exit_code: output.status.code().unwrap_or(-1),
            stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
            stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
        },
        Ok(Err(e)) => HookOutcome::SpawnFailed(e),
        Err(_) => HookOutcome::TimedOut,
    }
}

fn parse_updated_input(stdout: &str) -> Option<Value> {
    let parsed: Value = serde_json::from_str(stdout.trim()).ok()?;
    parsed
        .get("hookSpecificOutput")?
        .get("updatedInput")
        .cloned()
}

fn deny_reason(stdout: &str, stderr: &str) -> String {
    if let Ok(parsed) = serde_json::from_str::<Value>(stdout.trim()) {
        if let Some(reason) = parsed
            .get("hookSpecificOutput")
            .and_then(|o| o.get("permissionDecisionReason"))
            .and_then(Value::as_str)
        {
            return reason.to_string();
        }
    }
    let stderr = stderr.trim();
    if !stderr.is_empty() {
        return stderr.to_string();
    }
    "Denied by hook".to_string()
}

fn load_file(path: &Path) -> HooksConfig {
    match std::fs::read(path) {
        Ok(bytes) => match serde_json::from_slice::<HooksFile>(&bytes) {
            Ok(file) => file.hooks,
            Err(e) => {
                tracing::warn!(path = %path.display(), error = %e, "invalid hooks config");
                HooksConfig::default()
            }
        },
        Err(_) => HooksConfig::default(),
    }
}

fn merge_matchers(primary: Vec<HookMatcher>, secondary: Vec<HookMatcher>) -> Vec<HookMatcher> {
    let mut merged = primary;
    for matcher in secondary {
        if !merged.iter().any(|m| m.matcher == matcher.matcher) {
            merged.push(matcher);
        }
    }
    merged
}

fn mtime(path: &Path) -> Option<SystemTime> {
    std::fs::metadata(path).and_then(|m| m.modified()).ok()
}
