//! Command, stage, agent, and prompt definitions.
//!
//! These are loaded by an external `DocumentLoader` collaborator (the
//! on-disk format is out of scope here) and are immutable for the
//! duration of a run.

use crate::error::Result;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// A declarative workflow: agent, allowed tools, and an ordered pipeline.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CommandDefinition {
    pub name: String,

    #[serde(default)]
    pub description: String,

    /// Agent persona for the run. May be absent when dynamic agent
    /// selection is enabled, in which case `fallback_agent` is required.
    #[serde(default)]
    pub agent_role: Option<String>,

    #[serde(default)]
    pub fallback_agent: Option<String>,

    #[serde(default)]
    pub model: Option<String>,

    /// Ordered list of tool identifiers the LLM may invoke.
    #[serde(default)]
    pub allowed_tools: Vec<String>,

    /// Knowledge file basenames to load into the system message.
    #[serde(default)]
    pub knowledge_files: Vec<String>,

    pub pipeline: Vec<PipelineStage>,
}

impl CommandDefinition {
    /// The agent role to run with, falling back when none is set.
    pub fn effective_agent(&self) -> Option<&str> {
        self.agent_role
            .as_deref()
            .or(self.fallback_agent.as_deref())
    }
}

/// One pipeline step: a prompt bound to inputs and expected outputs.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PipelineStage {
    /// Identifier, unique within the pipeline.
    pub stage: String,

    /// Prompt identifier of the form `category.name`.
    pub prompt: String,

    /// Parameter name → value; values may contain `$SCOPE_PATH` references.
    #[serde(default)]
    pub inputs: Map<String, Value>,

    /// Ordered list of expected output field names.
    #[serde(default)]
    pub outputs: Vec<String>,

    /// A failed required stage aborts the pipeline at the group boundary.
    #[serde(default = "default_true")]
    pub required: bool,

    /// Adjacent parallel-marked stages form one concurrently-executed group.
    #[serde(default)]
    pub parallel: bool,

    /// Template evaluated to a boolean; false skips the stage.
    #[serde(default)]
    pub conditional: Option<String>,

    #[serde(default)]
    pub cache: Option<StageCacheConfig>,
}

fn default_true() -> bool {
    true
}

impl PipelineStage {
    pub fn new(stage: impl Into<String>, prompt: impl Into<String>) -> Self {
        Self {
            stage: stage.into(),
            prompt: prompt.into(),
            inputs: Map::new(),
            outputs: Vec::new(),
            required: true,
            parallel: false,
            conditional: None,
            cache: None,
        }
    }

    pub fn with_input(mut self, key: impl Into<String>, value: Value) -> Self {
        self.inputs.insert(key.into(), value);
        self
    }

    pub fn with_outputs(mut self, outputs: &[&str]) -> Self {
        self.outputs = outputs.iter().map(|s| s.to_string()).collect();
        self
    }

    pub fn parallel(mut self) -> Self {
        self.parallel = true;
        self
    }

    pub fn optional(mut self) -> Self {
        self.required = false;
        self
    }

    pub fn with_conditional(mut self, template: impl Into<String>) -> Self {
        self.conditional = Some(template.into());
        self
    }

    pub fn with_cache(mut self, cache: StageCacheConfig) -> Self {
        self.cache = Some(cache);
        self
    }
}

/// Per-stage output caching configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StageCacheConfig {
    pub enabled: bool,

    /// Entry lifetime in milliseconds.
    pub ttl_ms: u64,

    /// If set, only these resolved inputs participate in the cache key.
    #[serde(default)]
    pub cache_key_inputs: Option<Vec<String>>,

    /// Files whose content fingerprints participate in the cache key.
    #[serde(default)]
    pub file_dependencies: Vec<String>,
}

impl StageCacheConfig {
    pub fn enabled(ttl_ms: u64) -> Self {
        Self {
            enabled: true,
            ttl_ms,
            cache_key_inputs: None,
            file_dependencies: Vec::new(),
        }
    }
}

/// An agent persona: body text plus decision-making policy.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AgentDefinition {
    pub name: String,

    /// Persona body, prepended to every system message in a run.
    pub content: String,

    #[serde(default)]
    pub decision_making: DecisionMaking,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct DecisionMaking {
    /// Criteria that, when met, require a human gate before continuing.
    #[serde(default)]
    pub escalation_criteria: Vec<String>,
}

/// A parameterized instruction body identified as `category.name`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PromptDefinition {
    pub id: String,
    pub content: String,
}

/// Loads already-validated definitions and project text resources.
///
/// Frontmatter parsing, search paths, and validation all live behind
/// this trait; the engine only consumes its results.
#[async_trait]
pub trait DocumentLoader: Send + Sync {
    async fn load_prompt(&self, id: &str) -> Result<PromptDefinition>;

    async fn load_agent(&self, role: &str) -> Result<AgentDefinition>;

    /// Project-wide guidance text, if the project defines one.
    async fn load_guidance(&self) -> Result<Option<String>> {
        Ok(None)
    }

    /// Knowledge documents filtered by basename, as `(name, content)` pairs.
    async fn load_knowledge(&self, files: &[String]) -> Result<Vec<(String, String)>> {
        let _ = files;
        Ok(Vec::new())
    }
}
