//! Tool catalog, routing, and dry-run simulation.
//!
//! The router exposes a curated set of built-in tools plus gateway
//! definitions for externally-registered backends, and intercepts every
//! call with hooks, idempotency replay, path safety checks, and
//! simulation when dry-run mode is active.

pub mod builtin;
pub mod router;
pub mod simulate;

pub use builtin::{is_idempotent, is_read_only, MAX_READ_BYTES};
pub use router::{ExternalToolBackend, ToolResult, ToolRouter, WriteApprover, STATE_DIR_NAME};
pub use simulate::{DryRunSimulator, SimulatedOperation};
