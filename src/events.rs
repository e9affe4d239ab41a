//! Event system for pipeline lifecycle hooks.
//!
//! Provides an optional, non-intrusive way to observe command execution.
//! The executors emit events when stages start and finish, tools run,
//! caches hit, and escalations trigger. Users can implement
//! [`EventHandler`] to receive these events for logging, progress
//! tracking, or UIs.

use crate::escalation::EscalationSignal;
use std::sync::Arc;

/// Events emitted during command execution.
#[derive(Debug, Clone)]
pub enum Event {
    /// A pipeline run has started.
    PipelineStart {
        command: String,
        total_stages: usize,
    },
    /// A pipeline run has finished.
    PipelineEnd { command: String, ok: bool },
    /// A stage has started executing.
    StageStart {
        stage: String,
        /// 0-based position in the pipeline.
        index: usize,
    },
    /// A stage has finished executing.
    StageEnd {
        stage: String,
        ok: bool,
        duration_ms: u64,
    },
    /// A stage was skipped (false conditional or precomputed output).
    StageSkipped { stage: String, reason: String },
    /// A stage output was served from the cache.
    CacheHit { stage: String, saved_time_ms: u64 },
    /// A tool call is about to execute.
    ToolCallStart { stage: String, tool: String },
    /// A tool call finished (or was blocked / replayed).
    ToolCallEnd {
        stage: String,
        tool: String,
        ok: bool,
    },
    /// A PreToolUse hook denied a tool call.
    HookBlocked { tool: String, reason: String },
    /// The LLM emitted an escalation signal that met the gate criteria.
    EscalationTriggered {
        stage: String,
        signal: EscalationSignal,
    },
    /// A side-effecting operation was recorded by the dry-run simulator.
    DryRunOperation { tool: String, summary: String },
}

/// Handler for pipeline lifecycle events.
///
/// Entirely optional; the executors work without one.
pub trait EventHandler: Send + Sync {
    fn on_event(&self, event: Event);
}

/// Emit an event if a handler is present. No-op otherwise.
pub(crate) fn emit(handler: &Option<Arc<dyn EventHandler>>, event: Event) {
    if let Some(ref h) = handler {
        h.on_event(event);
    }
}

/// An [`EventHandler`] backed by a closure.
///
/// # Example
///
/// ```
/// use command_engine::events::{Event, FnEventHandler};
/// use std::sync::Arc;
///
/// let handler = Arc::new(FnEventHandler(|event: Event| {
///     if let Event::StageEnd { stage, ok, .. } = event {
///         println!("[{}] ok={}", stage, ok);
///     }
/// }));
/// ```
pub struct FnEventHandler<F: Fn(Event) + Send + Sync>(pub F);

impl<F: Fn(Event) + Send + Sync> EventHandler for FnEventHandler<F> {
    fn on_event(&self, event: Event) {
        (self.0)(event);
    }
}
