//! The tool router: catalog, execution, and per-call interception.
//!
//! Routes every tool call emitted by the LLM through the dry-run
//! simulator, PreToolUse hooks, the idempotency store, and path safety
//! checks before the tool body runs. Tool failures never unwind: they
//! come back as `Error: <message>` result strings so the model can see
//! them and recover.

use crate::events::{emit, Event, EventHandler};
use crate::hooks::{HookEngine, HookInput, PreDecision};
use crate::idempotency::{IdempotencyOptions, IdempotencyStore};
use crate::provider::{ToolCall, ToolDefinition};
use crate::tools::builtin;
use crate::tools::simulate::{DryRunSimulator, SimulatedOperation};
use async_trait::async_trait;
use serde_json::{json, Value};
use std::collections::{HashMap, HashSet};
use std::path::{Component, Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

/// Directory (relative to the project root) holding orchestrator state;
/// tools may never write into it.
pub const STATE_DIR_NAME: &str = ".orchestrator-state";

/// Basenames that require a prior read before they may be overwritten.
const PROTECTED_MANIFESTS: &[&str] = &[
    "Cargo.toml",
    "package.json",
    "pyproject.toml",
    "go.mod",
];

/// Directories whose writes are queued for user confirmation at the end
/// of the pipeline instead of landing immediately.
const DEFAULT_CONFIRM_DIRS: &[&str] = &["docs"];

/// The result handed back to the provider for one tool call.
#[derive(Debug, Clone)]
pub struct ToolResult {
    pub tool_call_id: String,
    pub output: String,
}

/// An externally-registered tool provider, exposed to the LLM through a
/// single gateway definition whose arguments are `{tool_name, arguments}`.
#[async_trait]
pub trait ExternalToolBackend: Send + Sync {
    /// Gateway tool name (e.g. `mcp_github`).
    fn name(&self) -> &str;

    fn description(&self) -> &str;

    /// Mutating backends participate in dry-run simulation and
    /// idempotency like the built-in side-effecting tools.
    fn mutating(&self) -> bool;

    async fn execute(&self, tool_name: &str, arguments: &Value)
        -> std::result::Result<String, String>;
}

/// Collaborator that approves or discards queued writes at pipeline end.
#[async_trait]
pub trait WriteApprover: Send + Sync {
    async fn approve(&self, path: &str, content: &str) -> bool;
}

#[derive(Debug, Clone)]
struct PendingWrite {
    path: String,
    content: String,
}

/// Per-command tool execution state plus process-wide collaborators.
pub struct ToolRouter {
    cwd: PathBuf,
    state_dir: PathBuf,
    session_id: Option<String>,
    hooks: Option<Arc<HookEngine>>,
    idempotency: Option<Arc<IdempotencyStore>>,
    web_search_endpoint: Option<String>,
    confirm_dirs: Vec<String>,
    dry_run: AtomicBool,
    simulator: DryRunSimulator,
    pending_writes: Mutex<Vec<PendingWrite>>,
    read_files: Mutex<HashSet<PathBuf>>,
    external: Mutex<HashMap<String, Arc<dyn ExternalToolBackend>>>,
    events: Option<Arc<dyn EventHandler>>,
}

impl ToolRouter {
    pub fn new(cwd: impl Into<PathBuf>) -> Self {
        let cwd = cwd.into();
        let state_dir = cwd.join(STATE_DIR_NAME);
        Self {
            cwd,
            state_dir,
            session_id: None,
            hooks: None,
            idempotency: None,
            web_search_endpoint: None,
            confirm_dirs: DEFAULT_CONFIRM_DIRS.iter().map(|s| s.to_string()).collect(),
            dry_run: AtomicBool::new(false),
            simulator: DryRunSimulator::new(),
            pending_writes: Mutex::new(Vec::new()),
            read_files: Mutex::new(HashSet::new()),
            external: Mutex::new(HashMap::new()),
            events: None,
        }
    }

    pub fn with_hooks(mut self, hooks: Arc<HookEngine>) -> Self {
        self.hooks = Some(hooks);
        self
    }

    pub fn with_idempotency(mut self, store: Arc<IdempotencyStore>) -> Self {
        self.idempotency = Some(store);
        self
    }

    pub fn with_session(mut self, session_id: impl Into<String>) -> Self {
        self.session_id = Some(session_id.into());
        self
    }

    pub fn with_web_search_endpoint(mut self, endpoint: impl Into<String>) -> Self {
        self.web_search_endpoint = Some(endpoint.into());
        self
    }

    pub fn with_confirm_dirs(mut self, dirs: Vec<String>) -> Self {
        self.confirm_dirs = dirs;
        self
    }

    pub fn with_events(mut self, events: Arc<dyn EventHandler>) -> Self {
        self.events = Some(events);
        self
    }

    pub fn register_external(&self, backend: Arc<dyn ExternalToolBackend>) {
        self.external
            .lock()
            .expect("external registry lock poisoned")
            .insert(backend.name().to_string(), backend);
    }

    pub fn set_dry_run(&self, enabled: bool) {
        self.dry_run.store(enabled, Ordering::Relaxed);
    }

    pub fn is_dry_run(&self) -> bool {
        self.dry_run.load(Ordering::Relaxed)
    }

    /// Reset per-command state: pending writes, the read-file set,
    /// dry-run mode, and recorded simulations.
    pub fn reset_for_command(&self) {
        self.pending_writes
            .lock()
            .expect("pending writes lock poisoned")
            .clear();
        self.read_files
            .lock()
            .expect("read files lock poisoned")
            .clear();
        self.dry_run.store(false, Ordering::Relaxed);
        self.simulator.clear();
    }

    /// Operations the dry-run simulator recorded this command.
    pub fn simulated_operations(&self) -> Vec<SimulatedOperation> {
        self.simulator.operations()
    }

    /// The tool definition list for a command, in `allowed` order, plus
    /// gateway definitions for registered external backends.
    pub fn tool_definitions(&self, allowed: &[String]) -> Vec<ToolDefinition> {
        let builtins: HashMap<String, ToolDefinition> = builtin::builtin_definitions()
            .into_iter()
            .map(|d| (d.name.clone(), d))
            .collect();
        let external = self.external.lock().expect("external registry lock poisoned");

        allowed
            .iter()
            .filter_map(|name| {
                if let Some(def) = builtins.get(name) {
                    return Some(def.clone());
                }
                external.get(name).map(|backend| ToolDefinition {
                    name: backend.name().to_string(),
                    description: backend.description().to_string(),
                    parameters: json!({
                        "type": "object",
                        "properties": {
                            "tool_name": {"type": "string"},
                            "arguments": {"type": "object"}
                        },
                        "required": ["tool_name", "arguments"]
                    }),
                })
            })
            .collect()
    }

    /// Execute a batch of tool calls concurrently, preserving result
    /// order. Each call observes the full per-call interception path.
    pub async fn execute_tools(&self, calls: &[ToolCall]) -> Vec<ToolResult> {
        futures::future::join_all(calls.iter().map(|call| self.execute_tool(call))).await
    }

    /// Execute one tool call. Never fails: every problem becomes an
    /// error-result string.
    pub async fn execute_tool(&self, call: &ToolCall) -> ToolResult {
        let output = self
            .execute_with_options(call, IdempotencyOptions::default())
            .await;
        ToolResult {
            tool_call_id: call.id.clone(),
            output,
        }
    }

    pub async fn execute_with_options(
        &self,
        call: &ToolCall,
        options: IdempotencyOptions,
    ) -> String {
        let name = call.name.as_str();
        let external = self
            .external
            .lock()
            .expect("external registry lock poisoned")
            .get(name)
            .cloned();

        let read_only = match &external {
            Some(backend) => !backend.mutating(),
            None => builtin::is_read_only(name),
        };
        let idempotent = match &external {
            Some(backend) => backend.mutating(),
            None => builtin::is_idempotent(name),
        };

        // Dry-run simulation replaces every side-effecting call.
        if self.is_dry_run() && !read_only {
            return self.simulator.simulate(name, &call.arguments, &self.cwd);
        }

        // PreToolUse hooks may rewrite arguments or deny the call.
        let mut arguments = call.arguments.clone();
        if let Some(hooks) = &self.hooks {
            let input = HookInput {
                tool_name: name,
                tool_input: &arguments,
                cwd: &self.cwd,
                session_id: self.session_id.as_deref(),
                tool_result: None,
            };
            match hooks.run_pre(input).await {
                PreDecision::Deny { reason } => {
                    tracing::debug!(tool = name, %reason, "tool call denied by hook");
                    emit(
                        &self.events,
                        Event::HookBlocked {
                            tool: name.to_string(),
                            reason: reason.clone(),
                        },
                    );
                    return format!("Blocked by PreToolUse hook: {reason}");
                }
                PreDecision::Allow { updated_input } => {
                    if let Some(updated) = updated_input {
                        arguments = updated;
                    }
                }
            }
        }

        // Replay a recorded result instead of re-running a side effect.
        if idempotent && !options.force_execute {
            if let Some(store) = &self.idempotency {
                if let Some(recorded) =
                    store.check(name, &arguments, self.session_id.as_deref())
                {
                    return value_to_output(&recorded);
                }
            }
        }

        if builtin::mutates_path(name) {
            if let Err(message) = self.validate_path(name, &arguments) {
                return format!("Error: {message}");
            }
        }

        // Writes into confirmation-gated directories are queued, not run.
        if name == "write" {
            if let Some(queued) = self.try_queue_write(&arguments) {
                return queued;
            }
        }

        let output = match self.run_tool(name, &arguments, external.as_deref()).await {
            Ok(output) => output,
            Err(message) => format!("Error: {message}"),
        };

        if let Some(hooks) = &self.hooks {
            let input = HookInput {
                tool_name: name,
                tool_input: &arguments,
                cwd: &self.cwd,
                session_id: self.session_id.as_deref(),
                tool_result: Some(&output),
            };
            hooks.run_post(input).await;
        }

        // Record success and failure alike, so a failed destructive
        // operation is not silently retried.
        if idempotent {
            if let Some(store) = &self.idempotency {
                store.record(
                    name,
                    &arguments,
                    self.session_id.as_deref(),
                    Value::String(output.clone()),
                );
            }
        }

        output
    }

    async fn run_tool(
        &self,
        name: &str,
        arguments: &Value,
        external: Option<&dyn ExternalToolBackend>,
    ) -> std::result::Result<String, String> {
        if let Some(backend) = external {
            let inner_tool = arguments
                .get("tool_name")
                .and_then(Value::as_str)
                .ok_or_else(|| "missing required argument 'tool_name'".to_string())?;
            let inner_args = arguments.get("arguments").cloned().unwrap_or(json!({}));
            return backend.execute(inner_tool, &inner_args).await;
        }

        match name {
            "write" => builtin::write_file(&self.cwd, arguments).await,
            "read_file" => {
                let output = builtin::read_file(&self.cwd, arguments).await?;
                if let Some(path) = arguments.get("path").and_then(Value::as_str) {
                    self.mark_read(path);
                }
                Ok(output)
            }
            "search_replace" => builtin::search_replace(&self.cwd, arguments).await,
            "delete_file" => builtin::delete_file(&self.cwd, arguments).await,
            "run_terminal_cmd" => builtin::run_terminal_cmd(&self.cwd, arguments).await,
            "list_dir" => builtin::list_dir(&self.cwd, arguments).await,
            "glob_file_search" => builtin::glob_file_search(&self.cwd, arguments).await,
            "grep" => builtin::grep(&self.cwd, arguments).await,
            "codebase_search" => builtin::codebase_search(&self.cwd, arguments).await,
            "query_session" => Ok(json!({
                "session_id": self.session_id,
                "cwd": self.cwd.to_string_lossy(),
                "dry_run": self.is_dry_run(),
            })
            .to_string()),
            "web_search" => {
                builtin::web_search(self.web_search_endpoint.as_deref(), arguments).await
            }
            other => Err(format!("unknown tool '{other}'")),
        }
    }

    /// Reject writes into the orchestrator state directory and
    /// overwrites of protected files that were never read.
    fn validate_path(&self, tool: &str, arguments: &Value) -> std::result::Result<(), String> {
        let Some(path) = arguments.get("path").and_then(Value::as_str) else {
            return Err("missing required argument 'path'".into());
        };
        let normalized = normalize_path(&self.cwd, path);

        if normalized.starts_with(&self.state_dir) {
            return Err(format!(
                "refusing to {tool} inside the orchestrator state directory: {path}"
            ));
        }

        if is_protected(&normalized) && normalized.exists() && !self.was_read(&normalized) {
            return Err(format!(
                "{path} is protected; read it with read_file before modifying"
            ));
        }

        Ok(())
    }

    fn try_queue_write(&self, arguments: &Value) -> Option<String> {
        let path = arguments.get("path").and_then(Value::as_str)?;
        let normalized = normalize_path(&self.cwd, path);
        let gated = self.confirm_dirs.iter().any(|dir| {
            normalized.starts_with(normalize_path(&self.cwd, dir))
        });
        if !gated {
            return None;
        }
        let content = arguments
            .get("content")
            .and_then(Value::as_str)
            .unwrap_or_default()
            .to_string();
        self.pending_writes
            .lock()
            .expect("pending writes lock poisoned")
            .push(PendingWrite {
                path: path.to_string(),
                content,
            });
        Some(format!("Write queued for end-of-run confirmation: {path}"))
    }

    pub fn pending_write_count(&self) -> usize {
        self.pending_writes
            .lock()
            .expect("pending writes lock poisoned")
            .len()
    }

    /// Offer every queued write to the approver; approved files are
    /// committed, the rest discarded. Returns `(path, committed)` pairs.
    pub async fn flush_pending_writes(
        &self,
        approver: &dyn WriteApprover,
    ) -> Vec<(String, bool)> {
        let pending: Vec<PendingWrite> = self
            .pending_writes
            .lock()
            .expect("pending writes lock poisoned")
            .drain(..)
            .collect();

        let mut results = Vec::with_capacity(pending.len());
        for write in pending {
            let approved = approver.approve(&write.path, &write.content).await;
            if approved {
                let args = json!({"path": write.path, "content": write.content});
                if let Err(e) = builtin::write_file(&self.cwd, &args).await {
                    tracing::warn!(path = %write.path, error = %e, "confirmed write failed");
                    results.push((write.path, false));
                    continue;
                }
            }
            results.push((write.path, approved));
        }
        results
    }

    fn mark_read(&self, path: &str) {
        self.read_files
            .lock()
            .expect("read files lock poisoned")
            .insert(normalize_path(&self.cwd, path));
    }

    fn was_read(&self, normalized: &Path) -> bool {
        self.read_files
            .lock()
            .expect("read files lock poisoned")
            .contains(normalized)
    }

    /// Whether a path was successfully read this command.
    pub fn has_read(&self, path: &str) -> bool {
        self.was_read(&normalize_path(&self.cwd, path))
    }
}

/// Lexically normalize a path against a base, resolving `.` and `..`
/// without touching the filesystem.
fn normalize_path(base: &Path, path: &str) -> PathBuf {
    let joined = {
        let p = Path::new(path);
        if p.is_absolute() {
            p.to_path_buf()
        } else {
            base.join(p)
        }
    };
    let mut normalized = PathBuf::new();
    for component in joined.components() {
        match component {
            Component::CurDir => {}
            Component::ParentDir => {
                normalized.pop();
            }
            other => normalized.push(other),
        }
    }
    normalized
}

/// Lock files, environment dotfiles, and dependency manifests.
fn is_protected(path: &Path) -> bool {
    let Some(name) = path.file_name().and_then(|n| n.to_str()) else {
        return false;
    };
    name.ends_with(".lock")
        || name == "package-lock.json"
        || name.starts_with(".env")
        || PROTECTED_MANIFESTS.contains(&name)
}

fn value_to_output(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn call(name: &str, arguments: Value) -> ToolCall {
        ToolCall {
            id: "c1".into(),
            name: name.into(),
            arguments,
        }
    }

    fn router() -> (tempfile::TempDir, ToolRouter) {
        let dir = tempfile::tempdir().unwrap();
        let router = ToolRouter::new(dir.path());
        (dir, router)
    }

    #[tokio::test]
    async fn test_write_then_read() {
        let (_dir, router) = router();
        let result = router
            .execute_tool(&call("write", json!({"path": "a.txt", "content": "hi"})))
            .await;
        assert!(result.output.contains("File written"));
        let result = router.execute_tool(&call("read_file", json!({"path": "a.txt"}))).await;
        assert_eq!(result.output, "hi");
        assert!(router.has_read("a.txt"));
    }

    #[tokio::test]
    async fn test_unknown_tool_is_error_result() {
        let (_dir, router) = router();
        let result = router.execute_tool(&call("teleport", json!({}))).await;
        assert!(result.output.starts_with("Error: unknown tool"));
    }

    #[tokio::test]
    async fn test_oversize_read_not_marked_read() {
        let (dir, router) = router();
        std::fs::write(
            dir.path().join("big.txt"),
            "x".repeat((builtin::MAX_READ_BYTES + 1) as usize),
        )
        .unwrap();
        let result = router.execute_tool(&call("read_file", json!({"path": "big.txt"}))).await;
        assert!(result.output.starts_with("Error:"));
        assert!(!router.has_read("big.txt"));
    }

    #[tokio::test]
    async fn test_state_dir_writes_rejected() {
        let (_dir, router) = router();
        let result = router
            .execute_tool(&call(
                "write",
                json!({"path": ".orchestrator-state/notes.txt", "content": "x"}),
            ))
            .await;
        assert!(result.output.contains("state directory"));
    }

    #[tokio::test]
    async fn test_state_dir_traversal_rejected() {
        let (_dir, router) = router();
        let result = router
            .execute_tool(&call(
                "write",
                json!({"path": "src/../.orchestrator-state/x", "content": "x"}),
            ))
            .await;
        assert!(result.output.contains("state directory"));
    }

    #[tokio::test]
    async fn test_protected_file_requires_prior_read() {
        let (dir, router) = router();
        std::fs::write(dir.path().join("Cargo.toml"), "[package]").unwrap();

        let result = router
            .execute_tool(&call("write", json!({"path": "Cargo.toml", "content": "new"})))
            .await;
        assert!(result.output.contains("protected"));
        assert_eq!(
            std::fs::read_to_string(dir.path().join("Cargo.toml")).unwrap(),
            "[package]"
        );

        router
            .execute_tool(&call("read_file", json!({"path": "Cargo.toml"})))
            .await;
        let result = router
            .execute_tool(&call("write", json!({"path": "Cargo.toml", "content": "new"})))
            .await;
        assert!(result.output.contains("File written"));
    }

    #[tokio::test]
    async fn test_new_protected_file_allowed() {
        let (dir, router) = router();
        // A protected basename that does not exist yet may be created.
        let result = router
            .execute_tool(&call("write", json!({"path": ".env.example", "content": "KEY="})))
            .await;
        assert!(result.output.contains("File written"));
        assert!(dir.path().join(".env.example").exists());
    }

    #[tokio::test]
    async fn test_dry_run_simulates_side_effects() {
        let (dir, router) = router();
        router.set_dry_run(true);
        let result = router
            .execute_tool(&call("write", json!({"path": "a.txt", "content": "hi"})))
            .await;
        assert!(result.output.contains("[dry-run]"));
        assert!(!dir.path().join("a.txt").exists());
        assert_eq!(router.simulated_operations().len(), 1);
    }

    #[tokio::test]
    async fn test_dry_run_read_tools_still_run() {
        let (dir, router) = router();
        std::fs::write(dir.path().join("a.txt"), "real content").unwrap();
        router.set_dry_run(true);
        let result = router.execute_tool(&call("read_file", json!({"path": "a.txt"}))).await;
        assert_eq!(result.output, "real content");
    }

    #[tokio::test]
    async fn test_idempotent_replay_skips_filesystem() {
        let (dir, _) = router();
        let store = Arc::new(IdempotencyStore::new(dir.path().join("idem")));
        let router = ToolRouter::new(dir.path()).with_idempotency(store);

        let args = json!({"path": "a.txt", "content": "hi"});
        router.execute_tool(&call("write", args.clone())).await;
        let mtime_before = std::fs::metadata(dir.path().join("a.txt"))
            .unwrap()
            .modified()
            .unwrap();

        std::thread::sleep(std::time::Duration::from_millis(20));
        let replay = router.execute_tool(&call("write", args)).await;
        assert!(replay.output.contains("File written"));
        let mtime_after = std::fs::metadata(dir.path().join("a.txt"))
            .unwrap()
            .modified()
            .unwrap();
        assert_eq!(mtime_before, mtime_after);
    }

    #[tokio::test]
    async fn test_force_execute_bypasses_replay() {
        let (dir, _) = router();
        let store = Arc::new(IdempotencyStore::new(dir.path().join("idem")));
        let router = ToolRouter::new(dir.path()).with_idempotency(store);

        let args = json!({"path": "a.txt", "content": "hi"});
        router.execute_tool(&call("write", args.clone())).await;
        let before = std::fs::metadata(dir.path().join("a.txt")).unwrap().modified().unwrap();

        std::thread::sleep(std::time::Duration::from_millis(20));
        router
            .execute_with_options(
                &call("write", args),
                IdempotencyOptions {
                    force_execute: true,
                },
            )
            .await;
        let after = std::fs::metadata(dir.path().join("a.txt")).unwrap().modified().unwrap();
        assert!(after > before);
    }

    #[tokio::test]
    async fn test_failed_tool_result_recorded() {
        let (dir, _) = router();
        let store = Arc::new(IdempotencyStore::new(dir.path().join("idem")));
        let router = ToolRouter::new(dir.path()).with_idempotency(store.clone());

        let args = json!({"path": "missing.txt"});
        let first = router.execute_tool(&call("delete_file", args.clone())).await;
        assert!(first.output.starts_with("Error:"));
        // The failure replays rather than re-running the delete.
        let recorded = store.check("delete_file", &args, None).unwrap();
        assert!(recorded.as_str().unwrap().starts_with("Error:"));
    }

    #[tokio::test]
    async fn test_confirm_dir_write_queued() {
        let (dir, router) = router();
        let result = router
            .execute_tool(&call("write", json!({"path": "docs/plan.md", "content": "# Plan"})))
            .await;
        assert!(result.output.contains("queued"));
        assert!(!dir.path().join("docs/plan.md").exists());
        assert_eq!(router.pending_write_count(), 1);
    }

    struct ScriptedApprover(bool);

    #[async_trait]
    impl WriteApprover for ScriptedApprover {
        async fn approve(&self, _path: &str, _content: &str) -> bool {
            self.0
        }
    }

    #[tokio::test]
    async fn test_flush_commits_approved_writes() {
        let (dir, router) = router();
        router
            .execute_tool(&call("write", json!({"path": "docs/plan.md", "content": "# Plan"})))
            .await;
        let results = router.flush_pending_writes(&ScriptedApprover(true)).await;
        assert_eq!(results, vec![("docs/plan.md".to_string(), true)]);
        assert_eq!(
            std::fs::read_to_string(dir.path().join("docs/plan.md")).unwrap(),
            "# Plan"
        );
        assert_eq!(router.pending_write_count(), 0);
    }

    #[tokio::test]
    async fn test_flush_discards_rejected_writes() {
        let (dir, router) = router();
        router
            .execute_tool(&call("write", json!({"path": "docs/plan.md", "content": "# Plan"})))
            .await;
        let results = router.flush_pending_writes(&ScriptedApprover(false)).await;
        assert_eq!(results, vec![("docs/plan.md".to_string(), false)]);
        assert!(!dir.path().join("docs/plan.md").exists());
    }

    #[tokio::test]
    async fn test_hook_denial_blocks_execution() {
        let dir = tempfile::tempdir().unwrap();
        let hooks_path = dir.path().join("hooks.json");
        std::fs::write(
            &hooks_path,
            json!({"hooks": {"PreToolUse": [{"matcher": "^write$", "hooks": [{"command": "exit 2"}]}]}})
                .to_string(),
        )
        .unwrap();
        let router = ToolRouter::new(dir.path())
            .with_hooks(Arc::new(HookEngine::new(hooks_path)));

        let result = router
            .execute_tool(&call("write", json!({"path": "a.txt", "content": "x"})))
            .await;
        assert!(result.output.starts_with("Blocked by PreToolUse hook:"));
        assert!(!dir.path().join("a.txt").exists());
    }

    #[tokio::test]
    async fn test_hook_rewrites_arguments() {
        let dir = tempfile::tempdir().unwrap();
        let hooks_path = dir.path().join("hooks.json");
        std::fs::write(
            &hooks_path,
            json!({"hooks": {"PreToolUse": [{"matcher": "^write$", "hooks": [{
                "command": "echo '{\"hookSpecificOutput\":{\"updatedInput\":{\"path\":\"redirected.txt\",\"content\":\"rewritten\"}}}'"
            }]}]}})
            .to_string(),
        )
        .unwrap();
        let router = ToolRouter::new(dir.path())
            .with_hooks(Arc::new(HookEngine::new(hooks_path)));

        router
            .execute_tool(&call("write", json!({"path": "a.txt", "content": "x"})))
            .await;
        assert!(!dir.path().join("a.txt").exists());
        assert_eq!(
            std::fs::read_to_string(dir.path().join("redirected.txt")).unwrap(),
            "rewritten"
        );
    }

    #[tokio::test]
    async fn test_batch_execution_preserves_order() {
        let (_dir, router) = router();
        let calls = vec![
            ToolCall {
                id: "a".into(),
                name: "write".into(),
                arguments: json!({"path": "1.txt", "content": "one"}),
            },
            ToolCall {
                id: "b".into(),
                name: "write".into(),
                arguments: json!({"path": "2.txt", "content": "two"}),
            },
        ];
        let results = router.execute_tools(&calls).await;
        assert_eq!(results[0].tool_call_id, "a");
        assert_eq!(results[1].tool_call_id, "b");
    }

    struct EchoBackend;

    #[async_trait]
    impl ExternalToolBackend for EchoBackend {
        fn name(&self) -> &str {
            "mcp_echo"
        }
        fn description(&self) -> &str {
            "echoes"
        }
        fn mutating(&self) -> bool {
            false
        }
        async fn execute(
            &self,
            tool_name: &str,
            arguments: &Value,
        ) -> std::result::Result<String, String> {
            Ok(format!("{tool_name}: {arguments}"))
        }
    }

    #[tokio::test]
    async fn test_external_gateway_routing() {
        let (_dir, router) = router();
        router.register_external(Arc::new(EchoBackend));
        let result = router
            .execute_tool(&call(
                "mcp_echo",
                json!({"tool_name": "ping", "arguments": {"n": 1}}),
            ))
            .await;
        assert_eq!(result.output, "ping: {\"n\":1}");
    }

    #[tokio::test]
    async fn test_tool_definitions_follow_allowed_order() {
        let (_dir, router) = router();
        router.register_external(Arc::new(EchoBackend));
        let defs = router.tool_definitions(&[
            "grep".to_string(),
            "mcp_echo".to_string(),
            "write".to_string(),
            "nonexistent".to_string(),
        ]);
        let names: Vec<&str> = defs.iter().map(|d| d.name.as_str()).collect();
        assert_eq!(names, vec!["grep", "mcp_echo", "write"]);
        // Gateway schema shape.
        assert!(defs[1].parameters["properties"]["tool_name"].is_object());
    }

    #[tokio::test]
    async fn test_reset_clears_per_command_state() {
        let (dir, router) = router();
        router.set_dry_run(true);
        router
            .execute_tool(&call("write", json!({"path": "a.txt", "content": "x"})))
            .await;
        std::fs::write(dir.path().join("r.txt"), "x").unwrap();
        router.execute_tool(&call("read_file", json!({"path": "r.txt"}))).await;

        router.reset_for_command();
        assert!(!router.is_dry_run());
        assert!(router.simulated_operations().is_empty());
        assert_eq!(router.pending_write_count(), 0);
        assert!(!router.has_read("r.txt"));
    }

    #[test]
    fn test_normalize_path() {
        let base = Path::new("/project");
        assert_eq!(
            normalize_path(base, "src/../.orchestrator-state/x"),
            PathBuf::from("/project/.orchestrator-state/x")
        );
        assert_eq!(normalize_path(base, "./a/b"), PathBuf::from("/project/a/b"));
        assert_eq!(normalize_path(base, "/abs/p"), PathBuf::from("/abs/p"));
    }

    #[test]
    fn test_protected_basenames() {
        assert!(is_protected(Path::new("/p/Cargo.lock")));
        assert!(is_protected(Path::new("/p/.env")));
        assert!(is_protected(Path::new("/p/.env.local")));
        assert!(is_protected(Path::new("/p/package.json")));
        assert!(is_protected(Path::new("/p/package-lock.json")));
        assert!(!is_protected(Path::new("/p/src/main.rs")));
    }
}
