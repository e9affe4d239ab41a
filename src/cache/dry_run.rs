//! Process-lifetime cache of dry-run plans and pre-computed resources.
//!
//! A dry run pre-validates the pipeline, preloads prompts and the agent,
//! pre-resolves static inputs, and records its analysis. The next
//! non-dry execution of the same command with the same arguments
//! consumes the entry (one-shot) and skips the pre-computed work.

use crate::cache::{digest_hex, sorted_json};
use crate::definition::{AgentDefinition, CommandDefinition, PromptDefinition};
use serde_json::{Map, Value};
use std::collections::HashMap;
use std::sync::Mutex;
use std::time::{Duration, Instant};

/// Default entry lifetime.
pub const DEFAULT_TTL: Duration = Duration::from_secs(300);

/// Flags that do not change what a run computes and are excluded from
/// the cache key.
const VOLATILE_FLAGS: &[&str] = &["dryRun", "dry-run", "dry_run", "verbose", "quiet", "progress"];

/// Soft capacity; exceeding it evicts the oldest ~10% of entries.
const MAX_ENTRIES: usize = 50;

/// Everything a dry run pre-computed for the next real execution.
#[derive(Debug, Clone)]
pub struct DryRunCacheEntry {
    pub command_name: String,
    /// Digest of `(name, model, agent, pipeline)`; a mismatch at
    /// consumption time means the command definition changed.
    pub command_hash: String,
    pub created_at: Instant,
    pub ttl: Duration,
    pub planned_stages: Vec<String>,
    /// Analysis recorded during the dry run, injected under the
    /// synthetic stage name `dry_run_cache`.
    pub analysis_outputs: Map<String, Value>,
    /// Stage name → outputs for stages whose results were fully
    /// pre-computed and need not run again.
    pub precomputed_outputs: Option<HashMap<String, Map<String, Value>>>,
    pub preloaded_prompts: HashMap<String, PromptDefinition>,
    pub preloaded_agent: Option<AgentDefinition>,
    pub preresolved_inputs: HashMap<String, Map<String, Value>>,
    pub resolved_args: Vec<Value>,
    pub pipeline_validated: bool,
}

impl DryRunCacheEntry {
    pub fn new(command: &CommandDefinition) -> Self {
        Self {
            command_name: command.name.clone(),
            command_hash: command_hash(command),
            created_at: Instant::now(),
            ttl: DEFAULT_TTL,
            planned_stages: command.pipeline.iter().map(|s| s.stage.clone()).collect(),
            analysis_outputs: Map::new(),
            precomputed_outputs: None,
            preloaded_prompts: HashMap::new(),
            preloaded_agent: None,
            preresolved_inputs: HashMap::new(),
            resolved_args: Vec::new(),
            pipeline_validated: false,
        }
    }

    fn expired(&self) -> bool {
        self.created_at.elapsed() > self.ttl
    }
}

/// Digest of the parts of a command definition that affect execution.
pub fn command_hash(command: &CommandDefinition) -> String {
    let pipeline = serde_json::to_value(&command.pipeline).unwrap_or(Value::Null);
    digest_hex(
        &[
            &command.name,
            command.model.as_deref().unwrap_or(""),
            command.effective_agent().unwrap_or(""),
            &sorted_json(&pipeline),
        ],
        128,
    )
}

/// Cache key over the command name, arguments, and non-volatile flags.
pub fn cache_key(command_name: &str, args: &[Value], flags: &Map<String, Value>) -> String {
    let stable_flags: Map<String, Value> = flags
        .iter()
        .filter(|(k, _)| !VOLATILE_FLAGS.contains(&k.as_str()))
        .map(|(k, v)| (k.clone(), v.clone()))
        .collect();
    digest_hex(
        &[
            command_name,
            &sorted_json(&Value::Array(args.to_vec())),
            &sorted_json(&Value::Object(stable_flags)),
        ],
        64,
    )
}

/// Shared, in-process dry-run cache.
#[derive(Debug, Default)]
pub struct DryRunCache {
    entries: Mutex<HashMap<String, DryRunCacheEntry>>,
}

impl DryRunCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Store an entry, evicting the oldest entries past capacity.
    pub fn store(&self, key: String, entry: DryRunCacheEntry) {
        let mut entries = self.entries.lock().expect("dry-run cache lock poisoned");
        if entries.len() >= MAX_ENTRIES {
            let evict = (MAX_ENTRIES / 10).max(1);
            let mut by_age: Vec<(String, Instant)> = entries
                .iter()
                .map(|(k, e)| (k.clone(), e.created_at))
                .collect();
            by_age.sort_by_key(|(_, created)| *created);
            for (old_key, _) in by_age.into_iter().take(evict) {
                entries.remove(&old_key);
                tracing::debug!(key = %old_key, "evicted dry-run cache entry");
            }
        }
        entries.insert(key, entry);
    }

    /// Consume the entry for a key: removed on return (one-shot), and
    /// also removed — returning `None` — when expired or when the
    /// command definition changed since the dry run.
    pub fn take(&self, key: &str, expected_command_hash: &str) -> Option<DryRunCacheEntry> {
        let mut entries = self.entries.lock().expect("dry-run cache lock poisoned");
        let entry = entries.remove(key)?;
        if entry.expired() {
            tracing::debug!(key, "dry-run cache entry expired");
            return None;
        }
        if entry.command_hash != expected_command_hash {
            tracing::debug!(key, "dry-run cache entry stale: command changed");
            return None;
        }
        Some(entry)
    }

    pub fn len(&self) -> usize {
        self.entries.lock().expect("dry-run cache lock poisoned").len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn clear(&self) {
        self.entries
            .lock()
            .expect("dry-run cache lock poisoned")
            .clear();
    }
}
