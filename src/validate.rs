//! Structural validation of a pipeline before execution.
//!
//! Returns the full list of problems rather than stopping at the first,
//! so callers can render every defect in one pass. Never fails itself.

use crate::definition::PipelineStage;
use std::collections::HashSet;

/// Validate a pipeline, returning a message per structural problem.
/// An empty result means the pipeline is runnable.
pub fn validate_pipeline(stages: &[PipelineStage]) -> Vec<String> {
    let mut messages = Vec::new();

    if stages.is_empty() {
        messages.push("Pipeline must contain at least one stage".to_string());
        return messages;
    }

    let mut seen: HashSet<&str> = HashSet::new();
    for (index, stage) in stages.iter().enumerate() {
        if stage.stage.trim().is_empty() {
            messages.push(format!("Stage {index}: 'stage' must be a non-empty string"));
        }
        if stage.prompt.trim().is_empty() {
            messages.push(format!(
                "Stage {index} ('{}'): 'prompt' must be a non-empty string",
                stage.stage
            ));
        }
        if !stage.stage.trim().is_empty() && !seen.insert(stage.stage.as_str()) {
            messages.push(format!(
                "Stage {index}: duplicate stage name '{}'",
                stage.stage
            ));
        }
    }

    messages
}
