use thiserror::Error;

/// Errors produced by the engine and its components.
///
/// Tool failures and hook denials are deliberately absent: per the tool
/// router contract they are returned to the LLM as error-result strings
/// and never unwind. Early pipeline termination is likewise a tagged
/// value on `StageOutput` metadata, not an error.
#[derive(Error, Debug)]
pub enum EngineError {
    /// Structural or input-shape problems detected before execution.
    /// Always fatal for the pipeline.
    #[error("Validation failed: {0}")]
    Validation(String),

    /// A variable reference could not be resolved in strict mode.
    ///
    /// Raised only for `$ENV_*` misses and `$STAGE_*` references to a
    /// missing property of a stage that did run. `$ARG_*`/`$CONTEXT_*`
    /// misses resolve to `"Not specified"` and missing stages to `null`.
    #[error("Variable ${scope}_{path} not found{}", availability_hint(.available))]
    VariableNotFound {
        scope: String,
        path: String,
        /// Keys that were present at the failing lookup site, if any.
        available: Vec<String>,
    },

    /// A required stage failed or execution was cancelled by policy.
    #[error("Stage '{stage}' failed: {message}")]
    Execution { stage: String, message: String },

    /// The LLM provider returned an error; the enclosing stage fails.
    #[error("Provider error: {0}")]
    Provider(String),

    /// The run was cancelled via the cancellation flag.
    #[error("Execution was cancelled")]
    Cancelled,

    /// Filesystem failure outside the tool router (state dirs, config).
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON (de)serialization failure at the serde level.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// Catch-all for other errors.
    #[error("{0}")]
    Other(String),
}

fn availability_hint(available: &[String]) -> String {
    if available.is_empty() {
        String::new()
    } else {
        format!(
            ". Available keys: {}. The LLM may have returned incomplete output.",
            available.join(", ")
        )
    }
}

impl From<anyhow::Error> for EngineError {
    fn from(err: anyhow::Error) -> Self {
        EngineError::Other(err.to_string())
    }
}

pub type Result<T> = std::result::Result<T, EngineError>;
