//! Shared extraction strategies for LLM output parsing.
//!
//! This is the load-bearing module — sanitization, fenced-block
//! extraction with a preference ladder, and bracket matching all live
//! here and are called by every parsing path.

use once_cell::sync::Lazy;
use regex::Regex;

static ANSI_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"\x1b\[[0-9;?]*[ -/]*[@-~]").expect("ANSI escape regex"));

/// Sanitization pipeline applied to every LLM response before parsing.
///
/// Strips ANSI escapes, literal `[CTRL]` markers, and non-whitespace C0
/// control characters, then trims.
pub fn sanitize(text: &str) -> String {
    let without_ansi = ANSI_RE.replace_all(text, "");
    let without_markers = without_ansi.replace("[CTRL]", "");
    without_markers
        .chars()
        .filter(|c| !c.is_control() || matches!(c, '\n' | '\r' | '\t'))
        .collect::<String>()
        .trim()
        .to_string()
}

/// A fenced code block located in a response.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FencedBlock {
    /// Language tag, lowercased; `None` for bare fences.
    pub lang: Option<String>,
    pub content: String,
    /// Whether the closing fence was present.
    pub closed: bool,
}

/// Collect every fenced code block, including a trailing unclosed fence.
pub fn fenced_blocks(text: &str) -> Vec<FencedBlock> {
    let mut blocks = Vec::new();
    let mut search_from = 0;

    while let Some(fence_start) = text[search_from..].find("```") {
        let after_backticks = search_from + fence_start + 3;

        // Language hint runs to the end of the fence line; a fence with
        // no newline at all still counts (tag and content share a line).
        let (lang, content_start) = match text[after_backticks..].find('\n') {
            Some(line_end) => {
                let tag = text[after_backticks..after_backticks + line_end].trim();
                let lang = (!tag.is_empty()).then(|| tag.to_lowercase());
                (lang, after_backticks + line_end + 1)
            }
            None => (None, after_backticks),
        };

        match text[content_start..].find("```") {
            Some(close_offset) => {
                let raw = &text[content_start..content_start + close_offset];
                // Inline form: ```json {...}``` — the tag may precede the
                // payload on the same line with no newline separator.
                let (lang, content) = split_inline_tag(lang, raw);
                blocks.push(FencedBlock {
                    lang,
                    content: content.trim().to_string(),
                    closed: true,
                });
                search_from = content_start + close_offset + 3;
            }
            None => {
                let raw = &text[content_start..];
                let (lang, content) = split_inline_tag(lang, raw);
                blocks.push(FencedBlock {
                    lang,
                    content: content.trim().to_string(),
                    closed: false,
                });
                break;
            }
        }
    }

    blocks
}

fn split_inline_tag(lang: Option<String>, raw: &str) -> (Option<String>, String) {
    if lang.is_some() {
        return (lang, raw.to_string());
    }
    let trimmed = raw.trim_start();
    if let Some(rest) = trimmed.strip_prefix("json") {
        let rest_trimmed = rest.trim_start();
        if rest_trimmed.starts_with('{') || rest_trimmed.starts_with('[') {
            return (Some("json".to_string()), rest_trimmed.to_string());
        }
    }
    (lang, raw.to_string())
}

/// Pick the best JSON payload candidate from fenced blocks.
///
/// Preference order: a closed ```json block, a ```json block with no
/// newline after the tag, an untagged block whose content begins with a
/// JSON delimiter, any fenced content, and finally an unclosed trailing
/// fence. Returns `None` when the text carries no fences at all, in
/// which case the caller should use the whole content.
pub fn extract_json_payload(text: &str) -> Option<String> {
    let blocks = fenced_blocks(text);
    if blocks.is_empty() {
        return None;
    }

    let json_tagged = |b: &&FencedBlock| b.lang.as_deref() == Some("json");
    if let Some(b) = blocks.iter().filter(|b| b.closed).find(json_tagged) {
        return Some(b.content.clone());
    }
    if let Some(b) = blocks.iter().find(json_tagged) {
        return Some(b.content.clone());
    }
    if let Some(b) = blocks.iter().find(|b| {
        b.lang.is_none() && (b.content.starts_with('{') || b.content.starts_with('['))
    }) {
        return Some(b.content.clone());
    }
    if let Some(b) = blocks.iter().find(|b| b.closed) {
        return Some(b.content.clone());
    }
    blocks.last().map(|b| b.content.clone())
}

/// Every fenced block whose content parses as a JSON value, in order.
/// Used when expected keys are missing from the primary payload.
pub fn sibling_json_blocks(text: &str) -> Vec<serde_json::Value> {
    fenced_blocks(text)
        .into_iter()
        .filter_map(|b| serde_json::from_str(&b.content).ok())
        .collect()
}

/// Clip leading/trailing prose around the first balanced JSON value.
///
/// Scans from the first `{` or `[` with nesting- and string-aware
/// matching. Returns the input untouched when no balanced value exists.
pub fn clip_to_json(text: &str) -> &str {
    let start = match text.find(['{', '[']) {
        Some(i) => i,
        None => return text,
    };
    let bytes = text.as_bytes();
    let open = bytes[start] as char;
    let close = if open == '{' { '}' } else { ']' };

    let mut depth = 0i32;
    let mut in_string = false;
    let mut escape_next = false;
    for (i, ch) in text[start..].char_indices() {
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
                    return &text[start..=start + i];
                }
            }
            _ => {}
        }
    }
    text
}

/// Find a bracketed substring by matching open/close delimiters.
///
/// Handles nesting and strings. Prefers later occurrences, which are
/// more likely to be the model's actual answer than examples in prose.
pub fn find_bracketed(text: &str, open: char, close: char) -> Option<&str> {
    let mut best: Option<&str> = None;
    let mut scan_from = 0;

    while scan_from < text.len() {
        let Some(offset) = text[scan_from..].find(open) else {
            break;
        };
        let start = scan_from + offset;
        let mut depth = 0;
        let mut in_string = false;
        let mut escape_next = false;
        let mut found_end = None;

        for (i, ch) in text[start..].char_indices() {
            if escape_next {
                escape_next = false;
                continue;
            }
            if ch == '\\' && in_string {
                escape_next = true;
                continue;
            }
            if ch == '"' {
                in_string = !in_string;
                continue;
            }
            if in_string {
                continue;
            }
            if ch == open {
                depth += 1;
            } else if ch == close {
                depth -= 1;
                if depth == 0 {
                    found_end = Some(start + i);
                    break;
                }
            }
        }

        match found_end {
            Some(end) => {
                best = Some(&text[start..=end]);
                scan_from = end + 1;
            }
            None => break,
        }
    }

    best
}

#[cfg(test)]
mod tests {
    use super::*;

    // ── sanitize ──

    #[test]
    fn sanitize_strips_ansi() {
        let input = "\x1b[31mred\x1b[0m text";
        assert_eq!(sanitize(input), "red text");
    }

    #[test]
    fn sanitize_strips_ctrl_markers_and_controls() {
        let input = "a[CTRL]b\x07c";
        assert_eq!(sanitize(input), "abc");
    }

    #[test]
    fn sanitize_keeps_whitespace_controls() {
        let input = "line1\nline2\tend";
        assert_eq!(sanitize(input), "line1\nline2\tend");
    }

    // ── fenced_blocks ──

    #[test]
    fn fenced_block_with_lang() {
        let input = "Here:\n```json\n{\"a\": 1}\n```";
        let blocks = fenced_blocks(input);
        assert_eq!(blocks.len(), 1);
        assert_eq!(blocks[0].lang.as_deref(), Some("json"));
        assert_eq!(blocks[0].content, "{\"a\": 1}");
        assert!(blocks[0].closed);
    }

    #[test]
    fn fenced_block_unclosed() {
        let input = "```json\n{\"a\": 1}";
        let blocks = fenced_blocks(input);
        assert_eq!(blocks.len(), 1);
        assert!(!blocks[0].closed);
        assert_eq!(blocks[0].content, "{\"a\": 1}");
    }

    #[test]
    fn fenced_block_inline_tag_no_newline() {
        let input = "```json {\"a\": 1}```";
        let blocks = fenced_blocks(input);
        assert_eq!(blocks.len(), 1);
        assert_eq!(blocks[0].lang.as_deref(), Some("json"));
        assert_eq!(blocks[0].content, "{\"a\": 1}");
    }

    #[test]
    fn fenced_blocks_multiple() {
        let input = "```\nfirst\n```\nmid\n```json\n{\"b\":2}\n```";
        let blocks = fenced_blocks(input);
        assert_eq!(blocks.len(), 2);
        assert_eq!(blocks[1].lang.as_deref(), Some("json"));
    }

    // ── extract_json_payload ──

    #[test]
    fn payload_prefers_json_tagged_block() {
        let input = "```\nnot it\n```\n```json\n{\"a\": 1}\n```";
        assert_eq!(extract_json_payload(input).unwrap(), "{\"a\": 1}");
    }

    #[test]
    fn payload_untagged_json_delimiter() {
        let input = "```\n{\"a\": 1}\n```";
        assert_eq!(extract_json_payload(input).unwrap(), "{\"a\": 1}");
    }

    #[test]
    fn payload_falls_back_to_any_fence() {
        let input = "```text\nhello\n```";
        assert_eq!(extract_json_payload(input).unwrap(), "hello");
    }

    #[test]
    fn payload_none_without_fences() {
        assert!(extract_json_payload("{\"a\": 1}").is_none());
    }

    #[test]
    fn payload_unclosed_trailing_fence() {
        let input = "prose\n```json\n{\"a\": 1}";
        assert_eq!(extract_json_payload(input).unwrap(), "{\"a\": 1}");
    }

    // ── clip_to_json ──

    #[test]
    fn clip_removes_prose() {
        let input = "The result is {\"a\": 1} as requested.";
        assert_eq!(clip_to_json(input), "{\"a\": 1}");
    }

    #[test]
    fn clip_handles_nesting_and_strings() {
        let input = "x {\"s\": \"}\", \"n\": {\"i\": 1}} y";
        assert_eq!(clip_to_json(input), "{\"s\": \"}\", \"n\": {\"i\": 1}}");
    }

    #[test]
    fn clip_passthrough_without_json() {
        assert_eq!(clip_to_json("no json"), "no json");
    }

    #[test]
    fn clip_array() {
        assert_eq!(clip_to_json("list: [1, 2] end"), "[1, 2]");
    }

    // ── find_bracketed ──

    #[test]
    fn find_bracketed_prefers_later() {
        let input = r#"[1, 2] and then ["a", "b"]"#;
        assert_eq!(find_bracketed(input, '[', ']'), Some(r#"["a", "b"]"#));
    }

    #[test]
    fn find_bracketed_with_string_containing_brackets() {
        let input = r#"{"text": "hello [world]"}"#;
        assert_eq!(
            find_bracketed(input, '{', '}'),
            Some(r#"{"text": "hello [world]"}"#)
        );
    }

    // ── sibling_json_blocks ──

    #[test]
    fn sibling_blocks_parse_valid_json_only() {
        let input = "```json\n{\"a\":1}\n```\n```\nnot json\n```\n```json\n[2]\n```";
        let blocks = sibling_json_blocks(input);
        assert_eq!(blocks.len(), 2);
        assert_eq!(blocks[0]["a"], 1);
    }
}
