//! Orchestration of a full command pipeline.
//!
//! Validates, pre-resolves static inputs, schedules stages into groups,
//! and drives them in order: sequential stages record as they finish so
//! later stages see their outputs; parallel stages run concurrently and
//! record in arrival order, observing only prior groups. Required-stage
//! failures abort at the group boundary; `stop_pipeline` is a clean
//! early termination.

use crate::context::ExecutionContext;
use crate::definition::{AgentDefinition, PipelineStage, PromptDefinition};
use crate::error::{EngineError, Result};
use crate::events::{emit, Event};
use crate::resolver::references_scope;
use crate::schedule::{group_stages, StageGroup};
use crate::services::Services;
use crate::stage_executor::{execute_stage, StageOptions};
use crate::types::{CommandResult, StageOutput};
use crate::validate::validate_pipeline;
use futures::stream::{FuturesUnordered, StreamExt};
use serde_json::{json, Map, Value};
use std::collections::HashMap;
use std::time::Instant;

/// Synthetic stage name under which clarifying-question answers are
/// published for `$STAGE_user_answers.*` references.
pub const USER_ANSWERS_STAGE: &str = "user_answers";

/// Work a prior dry run (or the strategy layer) prepared for this run.
#[derive(Default)]
pub struct PipelineOptions {
    /// Stage name → outputs for stages that need not run again.
    pub precomputed: HashMap<String, Map<String, Value>>,
    pub preloaded_prompts: HashMap<String, PromptDefinition>,
    pub preloaded_agent: Option<AgentDefinition>,
    pub preresolved_inputs: HashMap<String, Map<String, Value>>,
    /// Skip structural validation (already performed during a dry run).
    pub pipeline_validated: bool,
}

/// Execute a pipeline with default options.
pub async fn execute_pipeline(
    stages: &[PipelineStage],
    ctx: &mut ExecutionContext,
    services: &Services,
) -> Result<CommandResult> {
    execute_pipeline_with(stages, ctx, services, PipelineOptions::default()).await
}

/// Execute a pipeline with pre-computed work from the strategy layer.
pub async fn execute_pipeline_with(
    stages: &[PipelineStage],
    ctx: &mut ExecutionContext,
    services: &Services,
    options: PipelineOptions,
) -> Result<CommandResult> {
    let started = Instant::now();
    emit(
        &services.events,
        Event::PipelineStart {
            command: ctx.command_name.clone(),
            total_stages: stages.len(),
        },
    );

    // Per-command tool state starts clean; dry-run mode follows flags.
    services.router.reset_for_command();
    if ctx.is_dry_run() {
        services.router.set_dry_run(true);
    }

    if !options.pipeline_validated {
        let problems = validate_pipeline(stages);
        if !problems.is_empty() {
            return Err(EngineError::Validation(problems.join("; ")));
        }
    }

    // Pre-resolve inputs for stages that reference no upstream outputs.
    let mut preresolved = options.preresolved_inputs.clone();
    for stage in stages {
        if preresolved.contains_key(&stage.stage) {
            continue;
        }
        let inputs_value = Value::Object(stage.inputs.clone());
        if references_scope(&inputs_value, "STAGE") {
            continue;
        }
        match ctx.resolver().resolve_inputs(&stage.inputs) {
            Ok(resolved) => {
                preresolved.insert(stage.stage.clone(), resolved);
            }
            Err(e) => {
                // Demoted back to on-demand resolution.
                tracing::debug!(stage = %stage.stage, error = %e, "static pre-resolution deferred");
            }
        }
    }

    let groups = group_stages(stages);
    let required = required_map(stages, ctx);

    let mut aborted = false;
    let mut stopped = false;

    'groups: for group in &groups {
        if aborted || stopped {
            break;
        }

        let eligible = eligible_stages(group, ctx, services, &options);

        if group.parallel {
            // Launch concurrently; collect and record in arrival order.
            let mut outputs = Vec::with_capacity(eligible.len());
            {
                let ctx_ref: &ExecutionContext = ctx;
                let mut futures: FuturesUnordered<_> = eligible
                    .iter()
                    .enumerate()
                    .map(|(i, stage)| {
                        let stage_options = stage_options(stage, &options, &preresolved, ctx_ref);
                        execute_stage(stage, ctx_ref, services, i, stage_options)
                    })
                    .collect();
                while let Some(result) = futures.next().await {
                    outputs.push(result?);
                }
            }

            let mut questions: Vec<(String, Vec<String>)> = Vec::new();
            for output in outputs {
                if let Some(qs) = clarifying_questions(&output) {
                    questions.push((output.stage.clone(), qs));
                }
                if !output.success && required.get(&output.stage).copied().unwrap_or(true) {
                    aborted = true;
                }
                if output.stop_pipeline() {
                    stopped = true;
                }
                ctx.record_stage_completion(output);
            }
            for (stage_name, qs) in questions {
                ask_user(ctx, services, &stage_name, &qs).await;
            }
        } else {
            for (i, stage) in eligible.iter().enumerate() {
                let stage_options = stage_options(stage, &options, &preresolved, ctx);
                let output = execute_stage(stage, ctx, services, i, stage_options).await?;
                let failed = !output.success && required.get(&output.stage).copied().unwrap_or(true);
                let stop = output.stop_pipeline();
                let questions = clarifying_questions(&output).map(|qs| (output.stage.clone(), qs));
                ctx.record_stage_completion(output);

                if let Some((stage_name, qs)) = questions {
                    ask_user(ctx, services, &stage_name, &qs).await;
                }

                if failed {
                    aborted = true;
                    break 'groups;
                }
                if stop {
                    stopped = true;
                    break 'groups;
                }
            }
        }
    }

    // Queued writes are offered for confirmation at the end of the run.
    if services.router.pending_write_count() > 0 {
        if let Some(approver) = &services.approver {
            services.router.flush_pending_writes(approver.as_ref()).await;
        } else {
            tracing::warn!("pending writes discarded: no approver configured");
        }
    }

    let outputs = ctx.take_stage_outputs();
    let result = CommandResult::from_stages(
        outputs,
        |stage| required.get(stage).copied().unwrap_or(true),
        started.elapsed().as_millis() as u64,
    );
    emit(
        &services.events,
        Event::PipelineEnd {
            command: ctx.command_name.clone(),
            ok: result.success,
        },
    );
    Ok(result)
}

/// Filter a group down to the stages that should actually run, applying
/// isolation, precomputed outputs, and conditionals. Skipped
/// precomputed stages are recorded as completed.
fn eligible_stages(
    group: &StageGroup,
    ctx: &mut ExecutionContext,
    services: &Services,
    options: &PipelineOptions,
) -> Vec<PipelineStage> {
    let mut eligible = Vec::new();
    for stage in &group.stages {
        if let Some(isolation) = &ctx.isolation {
            if !isolation.includes(&stage.stage, &stage.prompt) {
                emit(
                    &services.events,
                    Event::StageSkipped {
                        stage: stage.stage.clone(),
                        reason: "outside isolation subset".into(),
                    },
                );
                continue;
            }
        }

        if let Some(outputs) = options.precomputed.get(&stage.stage) {
            let mut output = StageOutput::success(&stage.stage, &stage.prompt, outputs.clone());
            output.metadata.insert("precomputed".into(), json!(true));
            ctx.record_stage_completion(output);
            emit(
                &services.events,
                Event::StageSkipped {
                    stage: stage.stage.clone(),
                    reason: "precomputed by dry run".into(),
                },
            );
            continue;
        }

        if let Some(conditional) = &stage.conditional {
            if !evaluate_conditional(ctx, conditional) {
                emit(
                    &services.events,
                    Event::StageSkipped {
                        stage: stage.stage.clone(),
                        reason: format!("conditional '{conditional}' is false"),
                    },
                );
                continue;
            }
        }

        eligible.push(stage.clone());
    }
    eligible
}

fn stage_options(
    stage: &PipelineStage,
    options: &PipelineOptions,
    preresolved: &HashMap<String, Map<String, Value>>,
    ctx: &ExecutionContext,
) -> StageOptions {
    let mock_inputs = ctx
        .isolation
        .as_ref()
        .and_then(|iso| iso.mock_inputs.get(&stage.stage).cloned());
    StageOptions {
        pre_resolved_inputs: mock_inputs.or_else(|| preresolved.get(&stage.stage).cloned()),
        preloaded_prompt: options.preloaded_prompts.get(&stage.prompt).cloned(),
        preloaded_agent: options.preloaded_agent.clone(),
    }
}

/// Resolve a conditional template and map it to a boolean. Unresolvable
/// templates count as false (the upstream stage was skipped or withheld
/// the property).
fn evaluate_conditional(ctx: &ExecutionContext, conditional: &str) -> bool {
    match ctx.resolver().resolve_string(conditional) {
        Ok(value) => is_truthy(&value),
        Err(e) => {
            tracing::debug!(conditional, error = %e, "conditional unresolvable, skipping stage");
            false
        }
    }
}

fn is_truthy(value: &Value) -> bool {
    match value {
        Value::Null => false,
        Value::Bool(b) => *b,
        Value::Number(n) => n.as_f64().is_some_and(|f| f != 0.0),
        Value::String(s) => {
            let s = s.trim();
            !s.is_empty() && !s.eq_ignore_ascii_case("false")
        }
        Value::Array(items) => !items.is_empty(),
        Value::Object(_) => true,
    }
}

fn clarifying_questions(output: &StageOutput) -> Option<Vec<String>> {
    let questions: Vec<String> = output
        .outputs
        .get("clarifying_questions")?
        .as_array()?
        .iter()
        .filter_map(|q| q.as_str().map(str::to_string))
        .collect();
    (!questions.is_empty()).then_some(questions)
}

async fn ask_user(
    ctx: &mut ExecutionContext,
    services: &Services,
    stage: &str,
    questions: &[String],
) {
    if !ctx.interactive {
        return;
    }
    let Some(qa) = &services.qa else {
        return;
    };
    let answers = qa.ask(stage, questions).await;
    if !answers.is_empty() {
        ctx.publish_synthetic_outputs(USER_ANSWERS_STAGE, &answers);
    }
}

fn required_map(stages: &[PipelineStage], ctx: &ExecutionContext) -> HashMap<String, bool> {
    let relax = ctx
        .isolation
        .as_ref()
        .map(|iso| iso.relax_required)
        .unwrap_or(false);
    stages
        .iter()
        .map(|s| (s.stage.clone(), s.required && !relax))
        .collect()
}
