//! Error types for LLM output parsing.

/// Errors returned by output parsing.
///
/// These never escape the stage executor: a parse failure falls back to
/// key-by-key extraction and then to default values, so they surface only
/// in diagnostics.
#[derive(Debug, thiserror::Error)]
pub enum ParseError {
    /// The LLM response was empty or whitespace-only.
    #[error("empty LLM response")]
    EmptyResponse,

    /// JSON was located but failed to parse even after lenient fixes.
    #[error("JSON parsing failed: {reason}")]
    InvalidJson {
        /// The serde error message.
        reason: String,
        /// A truncated copy of the candidate text (max 200 chars).
        candidate: String,
    },

    /// The parsed payload was not a JSON object at the top level.
    #[error("expected a JSON object, got {actual}")]
    NotAnObject { actual: &'static str },
}

/// Truncate a string to at most `max_len` bytes on a char boundary,
/// appending "..." if truncated.
pub(crate) fn truncate(s: &str, max_len: usize) -> String {
    if s.len() <= max_len {
        return s.to_string();
    }
    let mut end = max_len;
    while !s.is_char_boundary(end) {
        end -= 1;
    }
    format!("{}...", &s[..end])
}
