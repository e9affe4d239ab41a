//! Deterministic JSON repair for common LLM output errors.
//!
//! Applies a sequence of heuristic fixes to malformed JSON strings
//! produced by LLMs, then validates the result with `serde_json`. No
//! regex is used — all repairs are manual string operations that track
//! string/escape state so quoted content is never touched.

use crate::output_parser::extract::clip_to_json;

/// Normalize a JSON candidate: trim, clip surrounding prose around the
/// first balanced value, then apply lenient fixes.
pub fn normalize_candidate(s: &str) -> String {
    let clipped = clip_to_json(s.trim());
    apply_lenient_fixes(clipped)
}

/// Apply lenient fixes for the malformed-JSON shapes models actually emit.
///
/// Fixes applied (in order):
/// 1. Remove trailing commas before `}` or `]`
/// 2. Collapse duplicate commas
/// 3. Insert missing commas between adjacent `]`/`[` or `}`/`{` at line breaks
pub fn apply_lenient_fixes(s: &str) -> String {
    let fixed = remove_trailing_commas(s);
    let fixed = collapse_duplicate_commas(&fixed);
    insert_missing_commas(&fixed)
}

/// Attempt to repair a broken JSON string.
///
/// Returns the repaired string only if the fixes produced valid JSON
/// that the input was not. Returns `None` if the input was already valid
/// or could not be repaired.
pub fn try_repair_json(broken: &str) -> Option<String> {
    if serde_json::from_str::<serde_json::Value>(broken).is_ok() {
        return None;
    }
    let fixed = apply_lenient_fixes(broken);
    if serde_json::from_str::<serde_json::Value>(&fixed).is_ok() {
        Some(fixed)
    } else {
        None
    }
}

/// Walk `s` outside of strings, invoking `emit` per char with the scan
/// index. Handles escape sequences so quoted content passes through.
fn scan_outside_strings(s: &str, mut handle: impl FnMut(&mut String, &[char], &mut usize)) -> String {
    let chars: Vec<char> = s.chars().collect();
    let len = chars.len();
    let mut result = String::with_capacity(s.len());
    let mut i = 0;
    let mut in_string = false;
    let mut escape_next = false;

    while i < len {
        if escape_next {
            escape_next = false;
            result.push(chars[i]);
            i += 1;
            continue;
        }
        if in_string {
            if chars[i] == '\\' {
                escape_next = true;
            } else if chars[i] == '"' {
                in_string = false;
            }
            result.push(chars[i]);
            i += 1;
            continue;
        }
        if chars[i] == '"' {
            in_string = true;
            result.push(chars[i]);
            i += 1;
            continue;
        }
        handle(&mut result, &chars, &mut i);
    }
    result
}

/// Remove trailing commas before `}` or `]`.
fn remove_trailing_commas(s: &str) -> String {
    scan_outside_strings(s, |result, chars, i| {
        if chars[*i] == ',' {
            let mut j = *i + 1;
            while j < chars.len() && chars[j].is_whitespace() {
                j += 1;
            }
            if j < chars.len() && (chars[j] == '}' || chars[j] == ']') {
                *i += 1;
                return;
            }
        }
        result.push(chars[*i]);
        *i += 1;
    })
}

/// Collapse `,,` runs (with optional interleaved whitespace) to one comma.
fn collapse_duplicate_commas(s: &str) -> String {
    scan_outside_strings(s, |result, chars, i| {
        if chars[*i] == ',' {
            result.push(',');
            let mut j = *i + 1;
            loop {
                let mut k = j;
                while k < chars.len() && chars[k].is_whitespace() {
                    k += 1;
                }
                if k < chars.len() && chars[k] == ',' {
                    j = k + 1;
                } else {
                    break;
                }
            }
            // Preserve whitespace following the last comma in the run.
            *i = j;
            return;
        }
        result.push(chars[*i]);
        *i += 1;
    })
}

/// Insert a comma between adjacent `]`/`[` or `}`/`{` separated only by
/// a line break — a common shape when models emit JSON values per line.
fn insert_missing_commas(s: &str) -> String {
    scan_outside_strings(s, |result, chars, i| {
        let ch = chars[*i];
        result.push(ch);
        if ch == ']' || ch == '}' {
            let mut j = *i + 1;
            let mut saw_newline = false;
            while j < chars.len() && chars[j].is_whitespace() {
                saw_newline |= chars[j] == '\n';
                j += 1;
            }
            if saw_newline && j < chars.len() && (chars[j] == '[' || chars[j] == '{') {
                result.push(',');
            }
        }
        *i += 1;
    })
}
