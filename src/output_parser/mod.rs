//! # LLM Output Parser
//!
//! Production-grade extraction of declared stage outputs from messy LLM
//! responses. Handles ANSI noise, markdown fences, malformed JSON, and
//! prose-wrapped payloads without requiring an additional LLM call.
//!
//! The pipeline, stopping at the first success:
//!
//! 1. Sanitize (ANSI escapes, `[CTRL]` markers, stray C0 controls)
//! 2. Locate a fenced JSON payload (preference ladder) or use the whole text
//! 3. Normalize (trim, clip prose, lenient comma fixes) and parse
//! 4. Pull expected keys; scan sibling fences and nested objects for stragglers
//! 5. On parse failure, probe key-by-key with balanced scanners
//! 6. Fill still-missing keys from name-driven defaults

pub mod defaults;
pub mod error;
pub mod extract;
pub mod repair;
pub mod stage_outputs;

pub use defaults::{apply_default_values, default_for};
pub use error::ParseError;
pub use extract::{clip_to_json, fenced_blocks, find_bracketed, sanitize};
pub use repair::{apply_lenient_fixes, normalize_candidate, try_repair_json};
pub use stage_outputs::parse_stage_outputs;
