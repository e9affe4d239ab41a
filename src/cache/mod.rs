//! Process-lifetime caches: stage outputs and dry-run plans.
//!
//! Both caches are shared by the whole process and safe for concurrent
//! use. Keys are SHA-256 digests over canonicalized (key-sorted) JSON so
//! logically-equal inputs hash identically regardless of insertion order.

pub mod dry_run;
pub mod stage_cache;

pub use dry_run::{DryRunCache, DryRunCacheEntry};
pub use stage_cache::{CacheLookup, MissReason, StageOutputCache};

use serde_json::Value;
use sha2::{Digest, Sha256};
use std::path::Path;

/// SHA-256 over the given parts, hex-encoded and truncated to `bits`.
pub(crate) fn digest_hex(parts: &[&str], bits: usize) -> String {
    let mut hasher = Sha256::new();
    for part in parts {
        hasher.update(part.as_bytes());
        hasher.update([0u8]);
    }
    let hex = format!("{:x}", hasher.finalize());
    hex[..bits / 4].to_string()
}

/// Serialize a value with object keys sorted recursively, so the digest
/// is independent of mapping insertion order.
pub(crate) fn sorted_json(value: &Value) -> String {
    match value {
        Value::Object(map) => {
            let mut keys: Vec<&String> = map.keys().collect();
            keys.sort();
            let fields: Vec<String> = keys
                .into_iter()
                .map(|k| {
                    format!(
                        "{}:{}",
                        serde_json::to_string(k).expect("string serializes"),
                        sorted_json(&map[k])
                    )
                })
                .collect();
            format!("{{{}}}", fields.join(","))
        }
        Value::Array(items) => {
            let rendered: Vec<String> = items.iter().map(sorted_json).collect();
            format!("[{}]", rendered.join(","))
        }
        other => other.to_string(),
    }
}

/// Content fingerprint of a file dependency. Missing or unreadable files
/// fingerprint distinctly so their appearance invalidates the entry.
pub(crate) fn fingerprint_file(path: &Path) -> String {
    match std::fs::read(path) {
        Ok(bytes) => {
            let mut hasher = Sha256::new();
            hasher.update(&bytes);
            format!("{:x}", hasher.finalize())[..32].to_string()
        }
        Err(_) => format!("missing:{}", path.display()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_sorted_json_is_order_independent() {
        let a = json!({"b": 1, "a": {"y": 2, "x": 3}});
        let b = json!({"a": {"x": 3, "y": 2}, "b": 1});
        assert_eq!(sorted_json(&a), sorted_json(&b));
    }

    #[test]
    fn test_digest_truncation() {
        let short = digest_hex(&["a", "b"], 64);
        let long = digest_hex(&["a", "b"], 128);
        assert_eq!(short.len(), 16);
        assert_eq!(long.len(), 32);
        assert!(long.starts_with(&short));
    }

    #[test]
    fn test_digest_separates_parts() {
        // ("ab", "c") and ("a", "bc") must not collide.
        assert_ne!(digest_hex(&["ab", "c"], 128), digest_hex(&["a", "bc"], 128));
    }

    #[test]
    fn test_fingerprint_missing_file() {
        let fp = fingerprint_file(Path::new("/no/such/file/anywhere"));
        assert!(fp.starts_with("missing:"));
    }

    #[test]
    fn test_fingerprint_tracks_content() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("dep.txt");
        std::fs::write(&path, "one").unwrap();
        let first = fingerprint_file(&path);
        std::fs::write(&path, "two").unwrap();
        let second = fingerprint_file(&path);
        assert_ne!(first, second);
    }
}
