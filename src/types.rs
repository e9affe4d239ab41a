use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// Result of one stage execution.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StageOutput {
    /// Stage identifier from the pipeline definition.
    pub stage: String,

    /// Prompt identifier (`category.name`) the stage was bound to.
    pub prompt: String,

    /// Whether the stage completed successfully.
    pub success: bool,

    /// Parsed outputs keyed by the declared output names, plus `result`
    /// (the final completion text) and `usage`.
    pub outputs: Map<String, Value>,

    /// Error message for failed stages.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,

    /// Wall-clock duration. `0` for cache hits.
    pub duration_ms: u64,

    /// Free-form metadata (`stop_pipeline`, `cached`,
    /// `original_duration_ms`, `stage_context`, escalation guidance, ...).
    #[serde(default)]
    pub metadata: Map<String, Value>,
}

impl StageOutput {
    /// A successful output with the given parsed mapping.
    pub fn success(stage: impl Into<String>, prompt: impl Into<String>, outputs: Map<String, Value>) -> Self {
        Self {
            stage: stage.into(),
            prompt: prompt.into(),
            success: true,
            outputs,
            error: None,
            duration_ms: 0,
            metadata: Map::new(),
        }
    }

    /// A failed output with an error message.
    pub fn failure(stage: impl Into<String>, prompt: impl Into<String>, error: impl Into<String>) -> Self {
        Self {
            stage: stage.into(),
            prompt: prompt.into(),
            success: false,
            outputs: Map::new(),
            error: Some(error.into()),
            duration_ms: 0,
            metadata: Map::new(),
        }
    }

    /// Whether this stage requested controlled early termination.
    pub fn stop_pipeline(&self) -> bool {
        self.metadata
            .get("stop_pipeline")
            .and_then(Value::as_bool)
            .unwrap_or(false)
    }

    /// Mark this stage as requesting controlled early termination.
    pub fn with_stop_pipeline(mut self) -> Self {
        self.metadata.insert("stop_pipeline".into(), Value::Bool(true));
        self
    }

    /// Whether this output was served from the stage cache.
    pub fn cached(&self) -> bool {
        self.metadata
            .get("cached")
            .and_then(Value::as_bool)
            .unwrap_or(false)
    }
}

/// Complete result of one command run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CommandResult {
    /// `true` iff every required stage that ran succeeded.
    pub success: bool,

    /// Shallow merge of every successful stage's outputs.
    pub outputs: Map<String, Value>,

    /// Top-level error for failed runs.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,

    /// Every stage output, in completion order.
    pub stages: Vec<StageOutput>,

    /// Total wall-clock duration of the run.
    pub duration_ms: u64,
}

impl CommandResult {
    /// Assemble a result from completed stage outputs.
    ///
    /// Success requires every required stage *that ran* to have
    /// succeeded; skipped stages do not count against the run.
    pub fn from_stages(stages: Vec<StageOutput>, required: impl Fn(&str) -> bool, duration_ms: u64) -> Self {
        let success = stages.iter().all(|s| s.success || !required(&s.stage));
        let mut outputs = Map::new();
        for stage in stages.iter().filter(|s| s.success) {
            for (k, v) in &stage.outputs {
                outputs.insert(k.clone(), v.clone());
            }
        }
        let error = stages
            .iter()
            .find(|s| !s.success && required(&s.stage))
            .and_then(|s| s.error.clone());
        Self {
            success,
            outputs,
            error,
            stages,
            duration_ms,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn out(stage: &str, key: &str, value: Value) -> StageOutput {
        let mut outputs = Map::new();
        outputs.insert(key.to_string(), value);
        StageOutput::success(stage, "cat.p", outputs)
    }

    #[test]
    fn test_stop_pipeline_flag() {
        let output = out("a", "y", json!(1)).with_stop_pipeline();
        assert!(output.stop_pipeline());
        assert!(!out("a", "y", json!(1)).stop_pipeline());
    }

    #[test]
    fn test_result_merges_successful_outputs() {
        let stages = vec![out("a", "x", json!(1)), out("b", "y", json!(2))];
        let result = CommandResult::from_stages(stages, |_| true, 10);
        assert!(result.success);
        assert_eq!(result.outputs["x"], 1);
        assert_eq!(result.outputs["y"], 2);
    }

    #[test]
    fn test_result_ignores_non_required_failure() {
        let stages = vec![
            out("a", "x", json!(1)),
            StageOutput::failure("b", "cat.p", "boom"),
        ];
        let result = CommandResult::from_stages(stages, |s| s == "a", 10);
        assert!(result.success);
        assert!(result.error.is_none());
        assert!(!result.outputs.contains_key("y"));
    }

    #[test]
    fn test_result_fails_on_required_failure() {
        let stages = vec![
            out("a", "x", json!(1)),
            StageOutput::failure("b", "cat.p", "boom"),
        ];
        let result = CommandResult::from_stages(stages, |_| true, 10);
        assert!(!result.success);
        assert_eq!(result.error.as_deref(), Some("boom"));
        // Partial merge still carries the successful stage's outputs.
        assert_eq!(result.outputs["x"], 1);
    }
}
