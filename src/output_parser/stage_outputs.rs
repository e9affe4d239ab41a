//! Extraction of declared stage outputs from free-form LLM text.
//!
//! The happy path finds a fenced JSON payload and pulls the expected
//! keys from it. When the payload will not parse even after lenient
//! fixes, a key-by-key probe scans the raw text for each expected key
//! and extracts its value with balanced-delimiter scanners. Whatever is
//! still missing afterwards is filled by name-driven defaults.

use crate::output_parser::defaults::apply_default_values;
use crate::output_parser::error::{truncate, ParseError};
use crate::output_parser::extract::{extract_json_payload, sanitize, sibling_json_blocks};
use crate::output_parser::repair::normalize_candidate;
use once_cell::sync::Lazy;
use regex::Regex;
use serde_json::{Map, Value};

/// Hard cap on balanced-scan length for a single extracted value.
const SCAN_CAP: usize = 500_000;

static PRIMITIVE_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"^(?:true|false|null|-?\d+(?:\.\d+)?(?:[eE][+-]?\d+)?)").expect("primitive regex")
});

/// Extract the declared outputs from an LLM response.
///
/// Returns a mapping whose keys are a subset of `expected`; keys with a
/// recognized name shape are defaulted when absent, the rest stay out.
pub fn parse_stage_outputs(content: &str, expected: &[String]) -> Map<String, Value> {
    let mut outputs = Map::new();
    let clean = sanitize(content);

    match parse_primary_payload(&clean) {
        Ok(parsed) => {
            if let Value::Object(map) = &parsed {
                for key in expected {
                    if let Some(v) = map.get(key) {
                        outputs.insert(key.clone(), v.clone());
                    }
                }
            }
            // Missing keys may live in sibling fenced blocks or nested
            // one level down in wrapper objects.
            let siblings = sibling_json_blocks(&clean);
            for key in expected {
                if outputs.contains_key(key) {
                    continue;
                }
                if let Some(v) = siblings.iter().find_map(|b| find_key(b, key)) {
                    outputs.insert(key.clone(), v);
                } else if let Some(v) = find_key(&parsed, key) {
                    outputs.insert(key.clone(), v);
                }
            }
        }
        Err(e) => {
            tracing::debug!(error = %e, "structured parse failed, probing keys");
            for key in expected {
                if let Some(v) = probe_key(&clean, key) {
                    outputs.insert(key.clone(), v);
                }
            }
        }
    }

    apply_default_values(&mut outputs, expected);
    outputs
}

/// Locate and parse the primary JSON payload of a response.
fn parse_primary_payload(clean: &str) -> Result<Value, ParseError> {
    if clean.is_empty() {
        return Err(ParseError::EmptyResponse);
    }
    let candidate = extract_json_payload(clean).unwrap_or_else(|| clean.to_string());
    let normalized = normalize_candidate(&candidate);
    serde_json::from_str(&normalized).map_err(|e| ParseError::InvalidJson {
        reason: e.to_string(),
        candidate: truncate(&normalized, 200),
    })
}

/// Depth-first search for a key anywhere inside a parsed value.
fn find_key(value: &Value, key: &str) -> Option<Value> {
    match value {
        Value::Object(map) => {
            if let Some(v) = map.get(key) {
                return Some(v.clone());
            }
            map.values().find_map(|v| find_key(v, key))
        }
        Value::Array(items) => items.iter().find_map(|v| find_key(v, key)),
        _ => None,
    }
}

/// Key-by-key fallback: find `"key":` in raw text and scan the value by
/// its leading sigil. Last resort is a primitive-or-short-string regex.
fn probe_key(content: &str, key: &str) -> Option<Value> {
    let needle = Regex::new(&format!(r#""{}"\s*:\s*"#, regex::escape(key))).ok()?;
    for m in needle.find_iter(content) {
        let rest = &content[m.end()..];
        let value = match rest.chars().next() {
            Some('"') => scan_string(&rest[1..]).map(Value::String),
            Some('{') => scan_balanced(rest, '{', '}')
                .and_then(|s| serde_json::from_str(&normalize_candidate(s)).ok()),
            Some('[') => scan_balanced(rest, '[', ']')
                .and_then(|s| serde_json::from_str(&normalize_candidate(s)).ok()),
            _ => PRIMITIVE_RE
                .find(rest)
                .and_then(|p| serde_json::from_str(p.as_str()).ok()),
        };
        if value.is_some() {
            return value;
        }
    }
    probe_key_last_resort(content, key)
}

static SHORT_VALUE_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r#"^(?:(true|false|null|-?[\d.]+)|"([^"\n]{0,200})")"#).expect("short value regex")
});

fn probe_key_last_resort(content: &str, key: &str) -> Option<Value> {
    let needle = Regex::new(&format!(r#""{}":\s*"#, regex::escape(key))).ok()?;
    let m = needle.find(content)?;
    let cap = SHORT_VALUE_RE.captures(&content[m.end()..])?;
    if let Some(prim) = cap.get(1) {
        serde_json::from_str(prim.as_str()).ok()
    } else {
        cap.get(2).map(|s| Value::String(s.as_str().to_string()))
    }
}

/// Scan a JSON string body (after the opening quote), handling escapes.
/// Bails out past the scan cap.
fn scan_string(rest: &str) -> Option<String> {
    let mut out = String::new();
    let mut chars = rest.char_indices();
    while let Some((i, ch)) = chars.next() {
        if i > SCAN_CAP {
            return None;
        }
        match ch {
            '\\' => match chars.next()?.1 {
                'n' => out.push('\n'),
                'r' => out.push('\r'),
                't' => out.push('\t'),
                '"' => out.push('"'),
                '\\' => out.push('\\'),
                '/' => out.push('/'),
                'u' => {
                    let hex: String = (0..4).filter_map(|_| chars.next().map(|(_, c)| c)).collect();
                    let code = u32::from_str_radix(&hex, 16).ok()?;
                    out.push(char::from_u32(code)?);
                }
                other => {
                    out.push('\\');
                    out.push(other);
                }
            },
            '"' => return Some(out),
            other => out.push(other),
        }
    }
    None
}

/// Scan a balanced `{...}` or `[...]` region starting at index 0.
fn scan_balanced(text: &str, open: char, close: char) -> Option<&str> {
    let mut depth = 0i32;
    let mut in_string = false;
    let mut escape_next = false;
    for (i, ch) in text.char_indices() {
        if i > SCAN_CAP {
            return None;
        }
        if escape_next {
            escape_next = false;
            continue;
        }
        match ch {
            '\\' if in_string => escape_next = true,
            '"' => in_string = !in_string,
            _ if in_string => {}
            c if c == open => depth += 1,
            c if c == close => {
                depth -= 1;
                if depth == 0 {
                    return Some(&text[..=i]);
                }
            }
            _ => {}
        }
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn expected(keys: &[&str]) -> Vec<String> {
        keys.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn fenced_json_happy_path() {
        let content = "Here you go:\n```json\n{\"y\": \"HELLO\", \"score\": 0.8}\n```";
        let outputs = parse_stage_outputs(content, &expected(&["y", "score"]));
        assert_eq!(outputs["y"], "HELLO");
        assert_eq!(outputs["score"], 0.8);
    }

    #[test]
    fn round_trip_identity() {
        let original = json!({"k1": "v1", "k2": [1, 2], "k3": {"a": true}});
        let content = serde_json::to_string(&original).unwrap();
        let outputs = parse_stage_outputs(&content, &expected(&["k1", "k2", "k3"]));
        assert_eq!(Value::Object(outputs), original);
    }

    #[test]
    fn trailing_comma_in_fence_parses() {
        let content = "```json\n{\"items\": [1, 2, 3,]}\n```";
        let outputs = parse_stage_outputs(content, &expected(&["items"]));
        assert_eq!(outputs["items"], json!([1, 2, 3]));
    }

    #[test]
    fn trailing_json_without_fence() {
        let content = "Analysis complete.\n{\"summary\": \"ok\", \"is_valid\": true}";
        let outputs = parse_stage_outputs(content, &expected(&["summary", "is_valid"]));
        assert_eq!(outputs["summary"], "ok");
        assert_eq!(outputs["is_valid"], true);
    }

    #[test]
    fn missing_key_found_in_sibling_block() {
        let content = "```json\n{\"a\": 1}\n```\nAnd also:\n```json\n{\"b\": 2}\n```";
        let outputs = parse_stage_outputs(content, &expected(&["a", "b"]));
        assert_eq!(outputs["a"], 1);
        assert_eq!(outputs["b"], 2);
    }

    #[test]
    fn missing_key_found_nested() {
        let content = r#"{"wrapper": {"verdict": "pass"}}"#;
        let outputs = parse_stage_outputs(content, &expected(&["verdict"]));
        assert_eq!(outputs["verdict"], "pass");
    }

    #[test]
    fn key_probe_on_unparseable_content() {
        let content = "The output is \"summary\": \"all good\" and \"score\": 0.7 roughly";
        let outputs = parse_stage_outputs(content, &expected(&["summary", "score"]));
        assert_eq!(outputs["summary"], "all good");
        assert_eq!(outputs["score"], 0.7);
    }

    #[test]
    fn key_probe_object_value() {
        // The unclosed trailing array keeps the structural parse from
        // succeeding, so extraction falls back to the key probe.
        let content = "{\"changes\": {\"file\": \"a.rs\"}, \"broken\": [";
        let outputs = parse_stage_outputs(content, &expected(&["changes"]));
        assert_eq!(outputs["changes"], json!({"file": "a.rs"}));
    }

    #[test]
    fn key_probe_array_value() {
        let content = "{\"tags\": [\"x\", \"y\"], \"oops\": {";
        let outputs = parse_stage_outputs(content, &expected(&["tags"]));
        assert_eq!(outputs["tags"], json!(["x", "y"]));
    }

    #[test]
    fn key_probe_escaped_string() {
        let content = r#"broken { "note": "line1\nline\"2\"" tail"#;
        let outputs = parse_stage_outputs(content, &expected(&["note"]));
        assert_eq!(outputs["note"], "line1\nline\"2\"");
    }

    #[test]
    fn defaults_fill_missing_known_shapes() {
        let content = "no json here at all";
        let outputs = parse_stage_outputs(
            content,
            &expected(&["quality_score", "issues", "status", "summary"]),
        );
        assert_eq!(outputs["quality_score"], 0.5);
        assert_eq!(outputs["issues"], json!([]));
        assert_eq!(outputs["status"], "unknown");
        assert!(!outputs.contains_key("summary"));
    }

    #[test]
    fn ansi_and_ctrl_stripped_before_parse() {
        let content = "\x1b[32m```json\n{\"ok\": true}\n```\x1b[0m[CTRL]";
        let outputs = parse_stage_outputs(content, &expected(&["ok"]));
        assert_eq!(outputs["ok"], true);
    }

    #[test]
    fn keys_are_subset_of_expected() {
        let content = r#"{"a": 1, "b": 2, "c": 3}"#;
        let outputs = parse_stage_outputs(content, &expected(&["a"]));
        assert_eq!(outputs.len(), 1);
        assert_eq!(outputs["a"], 1);
    }

    #[test]
    fn scan_balanced_stops_at_depth_zero() {
        assert_eq!(scan_balanced("{\"a\": {\"b\": 1}} tail", '{', '}'), Some("{\"a\": {\"b\": 1}}"));
    }

    #[test]
    fn scan_string_unicode_escape() {
        assert_eq!(scan_string("caf\\u00e9\" rest"), Some("café".to_string()));
    }
}
