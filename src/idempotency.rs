//! On-disk idempotency store for side-effecting tools.
//!
//! Replayed calls of an idempotent tool (same tool, args, and session)
//! return the recorded result instead of re-running the side effect.
//! Results are recorded on success *and* on failure, so a failing
//! destructive operation is not silently retried. One small JSON
//! document per key, guarded by sidecar lock files; persistence is
//! best-effort and never fails the tool call.

use crate::cache::{digest_hex, sorted_json};
use chrono::{DateTime, Duration as ChronoDuration, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use std::time::{Duration, Instant};

/// Default record lifetime.
const DEFAULT_TTL_SECS: i64 = 3600;

/// Background prune cadence.
const PRUNE_INTERVAL: Duration = Duration::from_secs(300);

/// Hard cap on persisted records; exceeding it evicts oldest-first.
const MAX_RECORDS: usize = 10_000;

/// How long to wait for a sidecar lock before giving up.
const LOCK_TIMEOUT: Duration = Duration::from_secs(2);

/// One persisted tool result.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IdempotencyRecord {
    pub key: String,
    /// Digest of the sorted args alone; guards against key collisions.
    pub args_hash: String,
    pub tool_name: String,
    pub result: Value,
    #[serde(default)]
    pub session_id: Option<String>,
    pub created_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
}

impl IdempotencyRecord {
    fn expired(&self) -> bool {
        self.expires_at <= Utc::now()
    }
}

/// Per-call options honored by the router.
#[derive(Debug, Clone, Copy, Default)]
pub struct IdempotencyOptions {
    /// Bypass the lookup (always execute) but still record the result.
    pub force_execute: bool,
}

/// On-disk keyed store of side-effecting tool results.
#[derive(Debug)]
pub struct IdempotencyStore {
    dir: PathBuf,
    ttl: ChronoDuration,
    disabled: bool,
    last_prune: Mutex<Instant>,
}

impl IdempotencyStore {
    /// Open (creating if needed) a store rooted at the given directory,
    /// conventionally `<project>/.orchestrator-state/idempotency/`.
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        let dir = dir.into();
        if let Err(e) = std::fs::create_dir_all(&dir) {
            tracing::warn!(dir = %dir.display(), error = %e, "could not create idempotency dir");
        }
        Self {
            dir,
            ttl: ChronoDuration::seconds(DEFAULT_TTL_SECS),
            disabled: false,
            last_prune: Mutex::new(Instant::now()),
        }
    }

    pub fn with_ttl(mut self, ttl: Duration) -> Self {
        self.ttl = ChronoDuration::from_std(ttl).unwrap_or(self.ttl);
        self
    }

    /// Bypass both lookup and store entirely.
    pub fn disabled(mut self) -> Self {
        self.disabled = true;
        self
    }

    pub fn is_disabled(&self) -> bool {
        self.disabled
    }

    /// Derive the record key for a call: tool-name prefix plus a 128-bit
    /// digest of `(tool, sorted args, session?)`.
    pub fn key_for(tool: &str, args: &Value, session_id: Option<&str>) -> String {
        let digest = digest_hex(
            &[tool, &sorted_json(args), session_id.unwrap_or("")],
            128,
        );
        format!("{tool}-{digest}")
    }

    /// Look up the recorded result for a call. Returns `None` on miss,
    /// expiry, collision, or when the store is disabled.
    pub fn check(&self, tool: &str, args: &Value, session_id: Option<&str>) -> Option<Value> {
        if self.disabled {
            return None;
        }
        self.maybe_prune();

        let key = Self::key_for(tool, args, session_id);
        let path = self.record_path(&key);
        let _lock = FileLock::acquire(&path)?;

        let record = match read_record(&path) {
            Some(r) => r,
            None => return None,
        };
        if record.expired() {
            let _ = std::fs::remove_file(&path);
            return None;
        }
        // Collision guard: the stored args must hash to the same value
        // as the current call's.
        if record.args_hash != digest_hex(&[&sorted_json(args)], 128) {
            tracing::warn!(key, "idempotency key collision, ignoring record");
            return None;
        }
        tracing::debug!(tool, key, "idempotency hit, replaying recorded result");
        Some(record.result)
    }

    /// Record a call's result (success or failure). Best-effort: any
    /// persistence failure is logged and swallowed.
    pub fn record(&self, tool: &str, args: &Value, session_id: Option<&str>, result: Value) {
        if self.disabled {
            return;
        }
        let key = Self::key_for(tool, args, session_id);
        let now = Utc::now();
        let record = IdempotencyRecord {
            key: key.clone(),
            args_hash: digest_hex(&[&sorted_json(args)], 128),
            tool_name: tool.to_string(),
            result,
            session_id: session_id.map(|s| s.to_string()),
            created_at: now,
            expires_at: now + self.ttl,
        };

        self.enforce_cap();

        let path = self.record_path(&key);
        let Some(_lock) = FileLock::acquire(&path) else {
            tracing::warn!(key, "could not lock idempotency record for write");
            return;
        };
        match serde_json::to_vec_pretty(&record) {
            Ok(bytes) => {
                if let Err(e) = std::fs::write(&path, bytes) {
                    tracing::warn!(key, error = %e, "failed to persist idempotency record");
                }
            }
            Err(e) => tracing::warn!(key, error = %e, "failed to serialize idempotency record"),
        }
    }

    /// Remove every record for a tool.
    pub fn invalidate_tool(&self, tool: &str) {
        self.remove_matching(|r| r.tool_name == tool);
    }

    /// Remove every record for a session.
    pub fn invalidate_session(&self, session_id: &str) {
        self.remove_matching(|r| r.session_id.as_deref() == Some(session_id));
    }

    /// Remove all records.
    pub fn clear(&self) {
        for path in self.record_files() {
            let _ = std::fs::remove_file(path);
        }
    }

    pub fn len(&self) -> usize {
        self.record_files().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn record_path(&self, key: &str) -> PathBuf {
        self.dir.join(format!("{key}.json"))
    }

    fn record_files(&self) -> Vec<PathBuf> {
        let Ok(entries) = std::fs::read_dir(&self.dir) else {
            return Vec::new();
        };
        entries
            .flatten()
            .map(|e| e.path())
            .filter(|p| p.extension().is_some_and(|ext| ext == "json"))
            .collect()
    }

    fn remove_matching(&self, predicate: impl Fn(&IdempotencyRecord) -> bool) {
        for path in self.record_files() {
            if read_record(&path).is_some_and(|r| predicate(&r)) {
                let _ = std::fs::remove_file(path);
            }
        }
    }

    /// Prune expired records when the cadence interval has elapsed.
    fn maybe_prune(&self) {
        let mut last = self.last_prune.lock().expect("prune lock poisoned");
        if last.elapsed() < PRUNE_INTERVAL {
            return;
        }
        *last = Instant::now();
        drop(last);
        self.remove_matching(|r| r.expired());
    }

    /// Evict oldest-first past the record cap.
    fn enforce_cap(&self) {
        let files = self.record_files();
        if files.len() < MAX_RECORDS {
            return;
        }
        let mut dated: Vec<(PathBuf, DateTime<Utc>)> = files
            .into_iter()
            .filter_map(|p| read_record(&p).map(|r| (p, r.created_at)))
            .collect();
        dated.sort_by_key(|(_, created)| *created);
        let excess = dated.len() + 1 - MAX_RECORDS;
        for (path, _) in dated.into_iter().take(excess) {
            let _ = std::fs::remove_file(path);
        }
    }
}

fn read_record(path: &Path) -> Option<IdempotencyRecord> {
    let bytes = std::fs::read(path).ok()?;
    serde_json::from_slice(&bytes).ok()
}

/// RAII sidecar lock file. Created with `create_new` so acquisition is
/// atomic; waits up to [`LOCK_TIMEOUT`] before giving up.
struct FileLock {
    path: PathBuf,
}

impl FileLock {
    fn acquire(record_path: &Path) -> Option<Self> {
        let path = record_path.with_extension("lock");
        let deadline = Instant::now() + LOCK_TIMEOUT;
        loop {
            match std::fs::OpenOptions::new()
                .write(true)
                .create_new(true)
                .open(&path)
            {
                Ok(_) => return Some(Self { path }),
                Err(e) if e.kind() == std::io::ErrorKind::AlreadyExists => {
                    if Instant::now() >= deadline {
                        tracing::warn!(path = %path.display(), "idempotency lock timeout");
                        return None;
                    }
                    std::thread::sleep(Duration::from_millis(10));
                }
                Err(e) => {
                    tracing::warn!(path = %path.display(), error = %e, "idempotency lock failed");
                    return None;
                }
            }
        }
    }
}

impl Drop for FileLock {
    fn drop(&mut self) {
        let _ = std::fs::remove_file(&self.path);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn store() -> (tempfile::TempDir, IdempotencyStore) {
        let dir = tempfile::tempdir().unwrap();
        let store = IdempotencyStore::new(dir.path());
        (dir, store)
    }

    #[test]
    fn test_miss_then_replay() {
        let (_dir, store) = store();
        let args = json!({"path": "/tmp/x", "content": "hi"});
        assert!(store.check("write", &args, Some("s1")).is_none());

        store.record("write", &args, Some("s1"), json!("File written: /tmp/x"));
        let replay = store.check("write", &args, Some("s1")).unwrap();
        assert_eq!(replay, "File written: /tmp/x");
    }

    #[test]
    fn test_different_args_miss() {
        let (_dir, store) = store();
        store.record("write", &json!({"path": "a"}), None, json!("ok"));
        assert!(store.check("write", &json!({"path": "b"}), None).is_none());
    }

    #[test]
    fn test_session_scoping() {
        let (_dir, store) = store();
        let args = json!({"path": "a"});
        store.record("write", &args, Some("s1"), json!("ok"));
        assert!(store.check("write", &args, Some("s2")).is_none());
        assert!(store.check("write", &args, None).is_none());
    }

    #[test]
    fn test_failure_results_recorded_too() {
        let (_dir, store) = store();
        let args = json!({"path": "/protected"});
        store.record("delete_file", &args, None, json!("Error: permission denied"));
        assert_eq!(
            store.check("delete_file", &args, None).unwrap(),
            "Error: permission denied"
        );
    }

    #[test]
    fn test_expired_record_pruned_on_read() {
        let (_dir, store) = store();
        let store = store.with_ttl(Duration::from_millis(0));
        let args = json!({"x": 1});
        store.record("write", &args, None, json!("ok"));
        assert!(store.check("write", &args, None).is_none());
        assert!(store.is_empty());
    }

    #[test]
    fn test_collision_guard_ignores_mismatched_args_hash() {
        let (dir, store) = store();
        let args = json!({"x": 1});
        store.record("write", &args, None, json!("ok"));

        // Corrupt the stored args_hash to simulate a digest collision.
        let key = IdempotencyStore::key_for("write", &args, None);
        let path = dir.path().join(format!("{key}.json"));
        let mut record: IdempotencyRecord =
            serde_json::from_slice(&std::fs::read(&path).unwrap()).unwrap();
        record.args_hash = "0".repeat(32);
        std::fs::write(&path, serde_json::to_vec(&record).unwrap()).unwrap();

        assert!(store.check("write", &args, None).is_none());
    }

    #[test]
    fn test_invalidate_by_tool_and_session() {
        let (_dir, store) = store();
        store.record("write", &json!({"a": 1}), Some("s1"), json!("1"));
        store.record("delete_file", &json!({"a": 2}), Some("s2"), json!("2"));
        assert_eq!(store.len(), 2);

        store.invalidate_tool("write");
        assert_eq!(store.len(), 1);

        store.invalidate_session("s2");
        assert!(store.is_empty());
    }

    #[test]
    fn test_clear() {
        let (_dir, store) = store();
        store.record("write", &json!({"a": 1}), None, json!("1"));
        store.record("write", &json!({"a": 2}), None, json!("2"));
        store.clear();
        assert!(store.is_empty());
    }

    #[test]
    fn test_disabled_store_is_inert() {
        let dir = tempfile::tempdir().unwrap();
        let store = IdempotencyStore::new(dir.path()).disabled();
        let args = json!({"a": 1});
        store.record("write", &args, None, json!("ok"));
        assert!(store.check("write", &args, None).is_none());
        assert!(store.is_empty());
    }

    #[test]
    fn test_key_prefixed_with_tool_name() {
        let key = IdempotencyStore::key_for("run_terminal_cmd", &json!({}), None);
        assert!(key.starts_with("run_terminal_cmd-"));
        assert_eq!(key.len(), "run_terminal_cmd-".len() + 32);
    }

    #[test]
    fn test_args_order_insensitive() {
        let (_dir, store) = store();
        store.record("write", &json!({"a": 1, "b": 2}), None, json!("ok"));
        assert!(store.check("write", &json!({"b": 2, "a": 1}), None).is_some());
    }

    #[test]
    fn test_stale_lock_blocks_then_best_effort() {
        let (dir, store) = store();
        let args = json!({"a": 1});
        let key = IdempotencyStore::key_for("write", &args, None);
        // A stale lock file makes acquisition time out; the write is
        // skipped but nothing fails.
        std::fs::write(dir.path().join(format!("{key}.lock")), b"").unwrap();
        store.record("write", &args, None, json!("ok"));
        assert!(store.is_empty());
    }
}
