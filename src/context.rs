//! Per-run execution context.
//!
//! Owned by the pipeline executor for the duration of one command run.
//! Carries the run configuration, the variable resolver, and the record
//! of completed stages. [`ExecutionContext::record_stage_completion`] is
//! the only mutation path for stage state, which keeps the parallel-group
//! visibility rules enforceable in one place.

use crate::definition::CommandDefinition;
use crate::provider::Provider;
use crate::resolver::{VariableContext, VariableResolver};
use crate::types::StageOutput;
use serde_json::{Map, Value};
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

/// Session identity for the run.
#[derive(Debug, Clone, Default)]
pub struct SessionInfo {
    pub id: String,
    pub is_resumed: bool,
}

/// Restricts a run to a named subset of stages.
#[derive(Debug, Clone, Default)]
pub struct IsolationSpec {
    /// Stage names or `stage.prompt` pairs to run.
    pub stages: Vec<String>,
    /// Replacement inputs per stage, standing in for upstream outputs.
    pub mock_inputs: HashMap<String, Map<String, Value>>,
    /// Treat every isolated stage as non-required.
    pub relax_required: bool,
}

impl IsolationSpec {
    /// Whether a stage is part of the isolated subset, matched by stage
    /// name or by `stage.prompt`.
    pub fn includes(&self, stage: &str, prompt: &str) -> bool {
        self.stages
            .iter()
            .any(|s| s == stage || s == &format!("{stage}.{prompt}"))
    }
}

/// Mutable state for one command run.
pub struct ExecutionContext {
    pub command_name: String,
    pub args: Vec<Value>,
    /// Flag values, each stored under original, kebab-case, and
    /// snake_case spellings at insertion time.
    pub flags: Map<String, Value>,
    pub agent_role: Option<String>,
    pub model: Option<String>,
    pub mode: Option<String>,
    pub provider: Arc<dyn Provider>,
    pub knowledge_files: Vec<String>,
    pub isolation: Option<IsolationSpec>,
    pub interactive: bool,
    pub allowed_tools: Vec<String>,
    pub session: SessionInfo,
    pub cancellation: Option<Arc<AtomicBool>>,

    resolver: VariableResolver,
    stage_outputs: Vec<StageOutput>,
    completed_stages: HashSet<String>,
}

impl ExecutionContext {
    pub fn new(command: &CommandDefinition, provider: Arc<dyn Provider>) -> Self {
        Self {
            command_name: command.name.clone(),
            args: Vec::new(),
            flags: Map::new(),
            agent_role: command.effective_agent().map(str::to_string),
            model: command.model.clone(),
            mode: None,
            provider,
            knowledge_files: command.knowledge_files.clone(),
            isolation: None,
            interactive: false,
            allowed_tools: command.allowed_tools.clone(),
            session: SessionInfo::default(),
            cancellation: None,
            resolver: VariableResolver::new(VariableContext::new()),
            stage_outputs: Vec::new(),
            completed_stages: HashSet::new(),
        }
    }

    pub fn with_args(mut self, args: Vec<Value>) -> Self {
        self.resolver.context_mut().set_positional_args(&args);
        self.args = args;
        self
    }

    pub fn with_flag(mut self, name: &str, value: Value) -> Self {
        self.set_flag(name, value);
        self
    }

    pub fn with_session(mut self, session: SessionInfo) -> Self {
        self.session = session;
        self
    }

    pub fn with_isolation(mut self, isolation: IsolationSpec) -> Self {
        self.isolation = Some(isolation);
        self
    }

    pub fn with_cancellation(mut self, cancel: Arc<AtomicBool>) -> Self {
        self.cancellation = Some(cancel);
        self
    }

    /// Replace the resolver's variable context (tests, hermetic env).
    pub fn with_variable_context(mut self, mut ctx: VariableContext) -> Self {
        ctx.set_positional_args(&self.args);
        self.resolver = VariableResolver::new(ctx);
        self
    }

    /// Store a flag under its original, kebab-case, and snake_case
    /// spellings, and mirror it into the argument scope so templates can
    /// reference named flags as `$ARG_*`.
    pub fn set_flag(&mut self, name: &str, value: Value) {
        self.resolver.context_mut().set_named_arg(name, value.clone());
        for variant in casing_variants(name) {
            self.flags.insert(variant, value.clone());
        }
    }

    /// Look up a flag by any of its spellings.
    pub fn flag(&self, name: &str) -> Option<&Value> {
        self.flags.get(name)
    }

    /// Whether a flag is present and truthy.
    pub fn flag_enabled(&self, name: &str) -> bool {
        matches!(
            self.flags.get(name),
            Some(Value::Bool(true)) | Some(Value::String(_))
        ) && self.flags.get(name) != Some(&Value::String("false".into()))
    }

    /// Dry-run is requested under either CLI spelling.
    pub fn is_dry_run(&self) -> bool {
        self.flag_enabled("dryRun") || self.flag_enabled("dry-run")
    }

    pub fn resolver(&self) -> &VariableResolver {
        &self.resolver
    }

    pub fn resolver_mut(&mut self) -> &mut VariableResolver {
        &mut self.resolver
    }

    /// Record a completed stage: appends the output, publishes its
    /// outputs to the `$STAGE_*` scope, and marks the stage complete.
    pub fn record_stage_completion(&mut self, output: StageOutput) {
        self.resolver
            .context_mut()
            .add_stage_outputs(&output.stage, &output.outputs);
        self.completed_stages.insert(output.stage.clone());
        self.stage_outputs.push(output);
    }

    /// Publish outputs under a stage name without recording a stage run
    /// (synthetic stages like `user_answers` and `dry_run_cache`).
    pub fn publish_synthetic_outputs(&mut self, stage: &str, outputs: &Map<String, Value>) {
        self.resolver.context_mut().add_stage_outputs(stage, outputs);
    }

    pub fn stage_outputs(&self) -> &[StageOutput] {
        &self.stage_outputs
    }

    pub fn is_completed(&self, stage: &str) -> bool {
        self.completed_stages.contains(stage)
    }

    pub fn take_stage_outputs(&mut self) -> Vec<StageOutput> {
        std::mem::take(&mut self.stage_outputs)
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancellation
            .as_ref()
            .is_some_and(|c| c.load(Ordering::Relaxed))
    }

    pub fn check_cancelled(&self) -> crate::error::Result<()> {
        if self.is_cancelled() {
            return Err(crate::error::EngineError::Cancelled);
        }
        Ok(())
    }
}

impl std::fmt::Debug for ExecutionContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ExecutionContext")
            .field("command_name", &self.command_name)
            .field("args", &self.args.len())
            .field("provider", &self.provider.name())
            .field("interactive", &self.interactive)
            .field("completed_stages", &self.completed_stages)
            .finish()
    }
}

fn casing_variants(name: &str) -> Vec<String> {
    let mut variants = vec![name.to_string()];
    for variant in [kebab(name), snake(name)] {
        if !variants.contains(&variant) {
            variants.push(variant);
        }
    }
    variants
}

fn kebab(name: &str) -> String {
    let mut out = String::with_capacity(name.len() + 4);
    for (i, ch) in name.chars().enumerate() {
        if ch == '_' || ch == '-' {
            out.push('-');
        } else if ch.is_uppercase() {
            if i > 0 {
                out.push('-');
            }
            out.extend(ch.to_lowercase());
        } else {
            out.push(ch);
        }
    }
    out
}

fn snake(name: &str) -> String {
    kebab(name).replace('-', "_")
}
