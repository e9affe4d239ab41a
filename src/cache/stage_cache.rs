//! Deterministic per-stage output cache.
//!
//! Skips re-execution of deterministic stages. Keyed by stage id, the
//! resolved inputs (optionally restricted to `cache_key_inputs`), and
//! content fingerprints of declared file dependencies. Entries expire by
//! per-stage TTL and are evicted lazily on lookup. Concurrent misses on
//! the same key may compute twice; last write wins.

use crate::cache::{digest_hex, fingerprint_file, sorted_json};
use crate::definition::StageCacheConfig;
use crate::types::StageOutput;
use serde_json::{json, Map, Value};
use std::collections::HashMap;
use std::path::Path;
use std::sync::Mutex;
use std::time::{Duration, Instant};

/// Why a lookup missed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MissReason {
    NoEntry,
    Expired,
    InputsChanged,
    FileDepChanged,
}

/// Result of a cache lookup.
#[derive(Debug)]
pub struct CacheLookup {
    pub hit: bool,
    pub output: Option<StageOutput>,
    pub reason: Option<MissReason>,
    /// The original run's duration, reclaimed on a hit.
    pub saved_time_ms: u64,
}

impl CacheLookup {
    fn miss(reason: MissReason) -> Self {
        Self {
            hit: false,
            output: None,
            reason: Some(reason),
            saved_time_ms: 0,
        }
    }
}

#[derive(Debug, Clone)]
struct Entry {
    key: String,
    inputs_hash: String,
    fingerprints: Vec<(String, String)>,
    outputs: Map<String, Value>,
    prompt: String,
    original_duration_ms: u64,
    created_at: Instant,
    ttl: Duration,
}

/// Process-wide stage output cache.
#[derive(Debug, Default)]
pub struct StageOutputCache {
    entries: Mutex<HashMap<String, Entry>>,
}

impl StageOutputCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Look up a cached output for a stage under the given resolved
    /// inputs and cache configuration.
    pub fn get(
        &self,
        stage_id: &str,
        resolved_inputs: &Map<String, Value>,
        config: &StageCacheConfig,
    ) -> CacheLookup {
        let inputs_hash = hash_inputs(resolved_inputs, config);
        let fingerprints = fingerprint_deps(config);

        let mut entries = self.entries.lock().expect("stage cache lock poisoned");
        let Some(entry) = entries.get(stage_id) else {
            return CacheLookup::miss(MissReason::NoEntry);
        };

        if entry.created_at.elapsed() > entry.ttl {
            entries.remove(stage_id);
            return CacheLookup::miss(MissReason::Expired);
        }
        if entry.inputs_hash != inputs_hash {
            return CacheLookup::miss(MissReason::InputsChanged);
        }
        if entry.fingerprints != fingerprints {
            return CacheLookup::miss(MissReason::FileDepChanged);
        }

        let mut output = StageOutput::success(stage_id, entry.prompt.clone(), entry.outputs.clone());
        output.duration_ms = 0;
        output
            .metadata
            .insert("cached".into(), Value::Bool(true));
        output.metadata.insert(
            "original_duration_ms".into(),
            json!(entry.original_duration_ms),
        );
        tracing::debug!(stage = stage_id, key = %entry.key, "stage cache hit");
        CacheLookup {
            hit: true,
            saved_time_ms: entry.original_duration_ms,
            output: Some(output),
            reason: None,
        }
    }

    /// Store a successful stage output. Failed outputs are never cached.
    pub fn put(
        &self,
        stage_id: &str,
        resolved_inputs: &Map<String, Value>,
        config: &StageCacheConfig,
        output: &StageOutput,
    ) {
        if !output.success {
            return;
        }
        let inputs_hash = hash_inputs(resolved_inputs, config);
        let fingerprints = fingerprint_deps(config);
        let key = digest_hex(
            &[
                stage_id,
                &inputs_hash,
                &fingerprints
                    .iter()
                    .map(|(p, f)| format!("{p}={f}"))
                    .collect::<Vec<_>>()
                    .join(";"),
            ],
            128,
        );
        let entry = Entry {
            key,
            inputs_hash,
            fingerprints,
            outputs: output.outputs.clone(),
            prompt: output.prompt.clone(),
            original_duration_ms: output.duration_ms,
            created_at: Instant::now(),
            ttl: Duration::from_millis(config.ttl_ms),
        };
        self.entries
            .lock()
            .expect("stage cache lock poisoned")
            .insert(stage_id.to_string(), entry);
    }

    pub fn clear(&self) {
        self.entries
            .lock()
            .expect("stage cache lock poisoned")
            .clear();
    }

    pub fn len(&self) -> usize {
        self.entries.lock().expect("stage cache lock poisoned").len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Hash the resolved inputs, restricted to `cache_key_inputs` when set.
fn hash_inputs(inputs: &Map<String, Value>, config: &StageCacheConfig) -> String {
    let restricted: Map<String, Value> = match &config.cache_key_inputs {
        Some(keys) => inputs
            .iter()
            .filter(|(k, _)| keys.contains(k))
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect(),
        None => inputs.clone(),
    };
    digest_hex(&[&sorted_json(&Value::Object(restricted))], 128)
}

/// Sorted content fingerprints of the declared file dependencies.
fn fingerprint_deps(config: &StageCacheConfig) -> Vec<(String, String)> {
    let mut deps: Vec<(String, String)> = config
        .file_dependencies
        .iter()
        .map(|p| (p.clone(), fingerprint_file(Path::new(p))))
        .collect();
    deps.sort();
    deps
}
