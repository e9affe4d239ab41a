//! Execution of a single pipeline stage.
//!
//! Resolves inputs, loads resources, builds the messages, drives the
//! bounded tool-use loop against the provider, handles escalation and
//! guided completion, parses the declared outputs, validates them, and
//! writes back to the stage cache. Early termination is a tagged value
//! on the returned `StageOutput`, never an unwind.

use crate::context::ExecutionContext;
use crate::definition::{AgentDefinition, PipelineStage, PromptDefinition};
use crate::error::Result;
use crate::escalation::EscalationDecision;
use crate::events::{emit, Event};
use crate::messages::{build_system_message, build_user_message};
use crate::output_parser::parse_stage_outputs;
use crate::provider::{ChatMessage, CompletionRequest, CompletionResponse, ToolCall, Usage};
use crate::services::Services;
use crate::tools::MAX_READ_BYTES;
use crate::types::StageOutput;
use serde_json::{json, Map, Value};
use std::time::Instant;

/// Upper bound on provider completions in the tool-use loop; after this
/// one final tools-disabled call demands the JSON output directly.
pub const MAX_TOOL_ITERATIONS: usize = 20;

const COMPLETION_TEMPERATURE: f64 = 0.2;
const DEFAULT_MAX_TOKENS: u32 = 4096;

/// Per-stage execution options supplied by the pipeline executor.
#[derive(Default)]
pub struct StageOptions {
    /// Inputs resolved ahead of time (static-input pre-resolution or
    /// isolation mocks); resolved on the fly when absent.
    pub pre_resolved_inputs: Option<Map<String, Value>>,
    pub preloaded_prompt: Option<PromptDefinition>,
    pub preloaded_agent: Option<AgentDefinition>,
}

/// The tool-use loop as an explicit state machine.
enum LoopState {
    AwaitingCompletion,
    ExecutingTools(CompletionResponse),
    Finalizing,
    Done(CompletionResponse),
}

/// Run one stage to completion. Returns `Err` only for cancellation;
/// every other failure is a `StageOutput` with `success = false`.
pub async fn execute_stage(
    stage: &PipelineStage,
    ctx: &ExecutionContext,
    services: &Services,
    index: usize,
    options: StageOptions,
) -> Result<StageOutput> {
    ctx.check_cancelled()?;
    let started = Instant::now();
    emit(
        &services.events,
        Event::StageStart {
            stage: stage.stage.clone(),
            index,
        },
    );

    let mut output = run_stage_inner(stage, ctx, services, options, started).await?;
    if !output.cached() {
        output.duration_ms = started.elapsed().as_millis() as u64;
    }

    emit(
        &services.events,
        Event::StageEnd {
            stage: stage.stage.clone(),
            ok: output.success,
            duration_ms: output.duration_ms,
        },
    );
    Ok(output)
}

async fn run_stage_inner(
    stage: &PipelineStage,
    ctx: &ExecutionContext,
    services: &Services,
    options: StageOptions,
    started: Instant,
) -> Result<StageOutput> {
    // Resolve inputs, preferring what the pipeline executor prepared.
    let mut inputs = match options.pre_resolved_inputs {
        Some(inputs) => inputs,
        None => match ctx.resolver().resolve_inputs(&stage.inputs) {
            Ok(inputs) => inputs,
            Err(e) => {
                return Ok(StageOutput::failure(&stage.stage, &stage.prompt, e.to_string()));
            }
        },
    };
    attach_file_contents(&mut inputs);

    // Cache check before any provider work.
    if let Some(cache_config) = stage.cache.as_ref().filter(|c| c.enabled) {
        let lookup = services.stage_cache.get(&stage.stage, &inputs, cache_config);
        if let Some(mut cached) = lookup.output {
            emit(
                &services.events,
                Event::CacheHit {
                    stage: stage.stage.clone(),
                    saved_time_ms: lookup.saved_time_ms,
                },
            );
            cached
                .metadata
                .insert("stage_context".into(), stage_context(stage, &inputs));
            return Ok(cached);
        } else if let Some(reason) = lookup.reason {
            tracing::debug!(stage = %stage.stage, ?reason, "stage cache miss");
        }
    }

    // Load resources through the document loader.
    let prompt = match options.preloaded_prompt {
        Some(prompt) => prompt,
        None => match services.loader.load_prompt(&stage.prompt).await {
            Ok(prompt) => prompt,
            Err(e) => {
                return Ok(StageOutput::failure(
                    &stage.stage,
                    &stage.prompt,
                    format!("failed to load prompt '{}': {e}", stage.prompt),
                ));
            }
        },
    };
    let agent = match options.preloaded_agent {
        Some(agent) => agent,
        None => match &ctx.agent_role {
            Some(role) => match services.loader.load_agent(role).await {
                Ok(agent) => agent,
                Err(e) => {
                    return Ok(StageOutput::failure(
                        &stage.stage,
                        &stage.prompt,
                        format!("failed to load agent '{role}': {e}"),
                    ));
                }
            },
            None => AgentDefinition::default(),
        },
    };
    let guidance = services.loader.load_guidance().await.unwrap_or_default();
    let knowledge = services
        .loader
        .load_knowledge(&ctx.knowledge_files)
        .await
        .unwrap_or_default();

    let system = build_system_message(
        &agent,
        &prompt,
        guidance.as_deref(),
        &knowledge,
        &stage.outputs,
        &agent.decision_making.escalation_criteria,
    );
    let user = build_user_message(&inputs);

    // Execution config: flag overrides win over the command definition.
    let model = ctx
        .flag("model")
        .and_then(Value::as_str)
        .map(str::to_string)
        .or_else(|| ctx.model.clone());
    let mode = ctx
        .flag("mode")
        .and_then(Value::as_str)
        .map(str::to_string)
        .or_else(|| ctx.mode.clone());
    let tools = services.router.tool_definitions(&ctx.allowed_tools);
    if ctx.is_dry_run() {
        services.router.set_dry_run(true);
    }

    // The tool-use loop.
    let mut messages = vec![ChatMessage::system(system), ChatMessage::user(user)];
    let mut usage = Usage::default();
    let mut state = LoopState::AwaitingCompletion;
    let mut iterations = 0usize;

    let final_response = loop {
        state = match state {
            LoopState::AwaitingCompletion => {
                ctx.check_cancelled()?;
                if iterations >= MAX_TOOL_ITERATIONS {
                    LoopState::Finalizing
                } else {
                    iterations += 1;
                    let request = CompletionRequest {
                        messages: messages.clone(),
                        model: model.clone(),
                        mode: mode.clone(),
                        tools: (!tools.is_empty()).then(|| tools.clone()),
                        temperature: COMPLETION_TEMPERATURE,
                        max_tokens: DEFAULT_MAX_TOKENS,
                    };
                    match ctx.provider.complete(request).await {
                        Ok(response) => {
                            accumulate(&mut usage, response.usage);
                            if response.has_tool_calls() {
                                LoopState::ExecutingTools(response)
                            } else {
                                LoopState::Done(response)
                            }
                        }
                        Err(e) => {
                            return Ok(StageOutput::failure(&stage.stage, &stage.prompt, e.to_string()));
                        }
                    }
                }
            }
            LoopState::ExecutingTools(response) => {
                let calls: Vec<ToolCall> = response.tool_calls.clone().unwrap_or_default();
                messages.push(ChatMessage {
                    role: crate::provider::Role::Assistant,
                    content: response.content.clone(),
                    name: None,
                    tool_calls: Some(calls.clone()),
                    tool_call_id: None,
                });
                for call in &calls {
                    emit(
                        &services.events,
                        Event::ToolCallStart {
                            stage: stage.stage.clone(),
                            tool: call.name.clone(),
                        },
                    );
                }
                let results = services.router.execute_tools(&calls).await;
                for (call, result) in calls.iter().zip(&results) {
                    emit(
                        &services.events,
                        Event::ToolCallEnd {
                            stage: stage.stage.clone(),
                            tool: call.name.clone(),
                            ok: !result.output.starts_with("Error:"),
                        },
                    );
                    messages.push(ChatMessage::tool_result(
                        &result.tool_call_id,
                        &call.name,
                        &result.output,
                    ));
                }
                LoopState::AwaitingCompletion
            }
            LoopState::Finalizing => {
                // Iteration budget exhausted: one last call, tools
                // disabled, demanding the structured output directly.
                ctx.check_cancelled()?;
                messages.push(ChatMessage::user(format!(
                    "Tool budget exhausted. Respond now with ONLY a JSON object containing \
                     these keys: {}. No further tool calls.",
                    stage.outputs.join(", ")
                )));
                let request = CompletionRequest {
                    messages: messages.clone(),
                    model: model.clone(),
                    mode: mode.clone(),
                    tools: None,
                    temperature: COMPLETION_TEMPERATURE,
                    max_tokens: DEFAULT_MAX_TOKENS,
                };
                match ctx.provider.complete(request).await {
                    Ok(response) => {
                        accumulate(&mut usage, response.usage);
                        LoopState::Done(response)
                    }
                    Err(e) => {
                        return Ok(StageOutput::failure(&stage.stage, &stage.prompt, e.to_string()));
                    }
                }
            }
            LoopState::Done(response) => break response,
        };
    };

    // Guided completion: the provider already delivered the final
    // artifact; wrap it and stop the pipeline cleanly.
    if final_response.guided_completion {
        let mut outputs = Map::new();
        outputs.insert("result".into(), json!(final_response.content));
        outputs.insert("usage".into(), usage_value(&usage));
        let mut output = StageOutput::success(&stage.stage, &stage.prompt, outputs);
        output.metadata.insert("guided_completion".into(), json!(true));
        output
            .metadata
            .insert("stage_context".into(), stage_context(stage, &inputs));
        return Ok(output.with_stop_pipeline());
    }

    // Escalation gate, only for agents that declare criteria.
    let mut content = final_response.content.clone();
    let mut escalation_metadata: Option<(String, Value)> = None;
    if !agent.decision_making.escalation_criteria.is_empty() {
        let detection = services.escalation_detector.detect(&content);
        if let Some(error) = &detection.parse_error {
            tracing::warn!(stage = %stage.stage, %error, "malformed escalation signal ignored");
        }
        content = detection.cleaned.clone();
        if let Some(signal) = detection
            .signal
            .filter(|s| services.escalation_detector.should_escalate(s))
        {
            emit(
                &services.events,
                Event::EscalationTriggered {
                    stage: stage.stage.clone(),
                    signal: signal.clone(),
                },
            );
            let decision = match &services.escalation_handler {
                Some(handler) => handler.on_escalation(&stage.stage, &signal).await,
                None => EscalationDecision::Proceed,
            };
            match decision {
                EscalationDecision::Abort => {
                    let mut output = StageOutput::failure(
                        &stage.stage,
                        &stage.prompt,
                        "escalation aborted by user",
                    );
                    output
                        .metadata
                        .insert("escalation".into(), json!(signal));
                    output
                        .metadata
                        .insert("stage_context".into(), stage_context(stage, &inputs));
                    return Ok(output.with_stop_pipeline());
                }
                EscalationDecision::Proceed => {}
                EscalationDecision::Modify { guidance } => {
                    escalation_metadata = Some(("user_guidance".into(), json!(guidance)));
                }
            }
        }
    }

    // Parse the declared outputs; `result` and `usage` always ride along.
    let mut outputs = parse_stage_outputs(&content, &stage.outputs);
    outputs.insert("result".into(), json!(content));
    outputs.insert("usage".into(), usage_value(&usage));

    // Per-stage domain validation.
    if let Some(validator) = services.validators.get(&stage.prompt) {
        if let Err(failure) = validator.validate(&outputs) {
            let mut output =
                StageOutput::failure(&stage.stage, &stage.prompt, failure.message.clone());
            output
                .metadata
                .insert("stage_context".into(), stage_context(stage, &inputs));
            if failure.critical {
                output = output.with_stop_pipeline();
            }
            return Ok(output);
        }
    }

    let mut output = StageOutput::success(&stage.stage, &stage.prompt, outputs);
    if let Some((key, value)) = escalation_metadata {
        output.metadata.insert(key, value);
    }
    output
        .metadata
        .insert("stage_context".into(), stage_context(stage, &inputs));

    // Cache write-back happens only for real, successful runs; the
    // entry keeps the true duration so later hits can report savings.
    if let Some(cache_config) = stage.cache.as_ref().filter(|c| c.enabled) {
        output.duration_ms = started.elapsed().as_millis() as u64;
        services
            .stage_cache
            .put(&stage.stage, &inputs, cache_config, &output);
    }

    Ok(output)
}

/// For every `*_file` / `*_file_arg` / `*_path` input naming an extant
/// file, attach its content under `<key>_content`.
fn attach_file_contents(inputs: &mut Map<String, Value>) {
    let file_keys: Vec<(String, String)> = inputs
        .iter()
        .filter(|(k, _)| {
            k.ends_with("_file") || k.ends_with("_file_arg") || k.ends_with("_path")
        })
        .filter_map(|(k, v)| v.as_str().map(|path| (k.clone(), path.to_string())))
        .collect();

    for (key, path) in file_keys {
        let content_key = format!("{key}_content");
        if inputs.contains_key(&content_key) {
            continue;
        }
        let p = std::path::Path::new(&path);
        let Ok(meta) = std::fs::metadata(p) else {
            continue;
        };
        if !meta.is_file() || meta.len() > MAX_READ_BYTES {
            continue;
        }
        if let Ok(content) = std::fs::read_to_string(p) {
            inputs.insert(content_key, json!(content));
        }
    }
}

fn stage_context(stage: &PipelineStage, inputs: &Map<String, Value>) -> Value {
    json!({
        "stage": stage.stage,
        "prompt": stage.prompt,
        "inputs": inputs,
    })
}

fn accumulate(total: &mut Usage, delta: Option<Usage>) {
    if let Some(delta) = delta {
        total.prompt_tokens += delta.prompt_tokens;
        total.completion_tokens += delta.completion_tokens;
    }
}

fn usage_value(usage: &Usage) -> Value {
    json!({
        "prompt_tokens": usage.prompt_tokens,
        "completion_tokens": usage.completion_tokens,
    })
}
