//! Execution strategy selection.
//!
//! Four strategies, tried in a fixed order with the first match
//! winning: dry-run (simulate and cache a plan), isolation (run a named
//! stage subset), interactive (default plus clarifying questions), and
//! the default pipeline path, which consumes a previously cached
//! dry-run plan when one is still valid.

use crate::cache::dry_run::{cache_key, command_hash, DryRunCacheEntry};
use crate::context::ExecutionContext;
use crate::definition::CommandDefinition;
use crate::error::Result;
use crate::events::{emit, Event};
use crate::pipeline_executor::{execute_pipeline_with, PipelineOptions};
use crate::resolver::references_scope;
use crate::services::Services;
use crate::types::CommandResult;
use crate::validate::validate_pipeline;
use serde_json::{json, Value};
use std::collections::HashMap;

/// Synthetic stage name under which a consumed dry-run plan's analysis
/// outputs are published for `$STAGE_dry_run_cache.*` references.
pub const DRY_RUN_CACHE_STAGE: &str = "dry_run_cache";

/// Select the execution strategy for a command and run it.
pub async fn select_and_execute(
    command: &CommandDefinition,
    mut ctx: ExecutionContext,
    services: &Services,
) -> Result<CommandResult> {
    if ctx.is_dry_run() {
        return execute_dry_run(command, &mut ctx, services).await;
    }
    if ctx.isolation.is_some() {
        tracing::info!(command = %command.name, "running isolated stage subset");
        return execute_pipeline_with(
            &command.pipeline,
            &mut ctx,
            services,
            PipelineOptions::default(),
        )
        .await;
    }
    if ctx.flag_enabled("interactive") {
        ctx.interactive = true;
    }
    execute_default(command, &mut ctx, services).await
}

/// Dry-run strategy: simulate side effects, pre-compute resources, and
/// cache the plan for the next real run.
async fn execute_dry_run(
    command: &CommandDefinition,
    ctx: &mut ExecutionContext,
    services: &Services,
) -> Result<CommandResult> {
    tracing::info!(command = %command.name, "dry run: simulating side effects");
    services.router.reset_for_command();
    services.router.set_dry_run(true);

    let mut entry = DryRunCacheEntry::new(command);
    entry.resolved_args = ctx.args.clone();
    entry.pipeline_validated = validate_pipeline(&command.pipeline).is_empty();

    // Preload the resources a real run will need.
    for stage in &command.pipeline {
        if entry.preloaded_prompts.contains_key(&stage.prompt) {
            continue;
        }
        if let Ok(prompt) = services.loader.load_prompt(&stage.prompt).await {
            entry.preloaded_prompts.insert(stage.prompt.clone(), prompt);
        }
    }
    if let Some(role) = &ctx.agent_role {
        entry.preloaded_agent = services.loader.load_agent(role).await.ok();
    }
    for stage in &command.pipeline {
        if references_scope(&Value::Object(stage.inputs.clone()), "STAGE") {
            continue;
        }
        if let Ok(resolved) = ctx.resolver().resolve_inputs(&stage.inputs) {
            entry.preresolved_inputs.insert(stage.stage.clone(), resolved);
        }
    }

    let options = PipelineOptions {
        precomputed: HashMap::new(),
        preloaded_prompts: entry.preloaded_prompts.clone(),
        preloaded_agent: entry.preloaded_agent.clone(),
        preresolved_inputs: entry.preresolved_inputs.clone(),
        pipeline_validated: entry.pipeline_validated,
    };
    let mut result =
        execute_pipeline_with(&command.pipeline, ctx, services, options).await?;

    // Surface the planned operations and attach them to the result.
    let operations = services.router.simulated_operations();
    for op in &operations {
        emit(
            &services.events,
            Event::DryRunOperation {
                tool: op.tool.clone(),
                summary: op.summary.clone(),
            },
        );
    }
    result.outputs.insert(
        "dry_run".into(),
        json!({
            "planned_stages": entry.planned_stages,
            "operations": operations
                .iter()
                .map(|op| json!({"tool": op.tool, "summary": op.summary, "diff": op.diff}))
                .collect::<Vec<_>>(),
        }),
    );

    // Cache the plan for one-shot consumption by the next real run.
    if result.success {
        entry.analysis_outputs = result.outputs.clone();
        let key = cache_key(&command.name, &ctx.args, &ctx.flags);
        services.dry_run_cache.store(key, entry);
    }

    Ok(result)
}

/// Default strategy: consume a cached dry-run plan when present, then
/// run the pipeline.
async fn execute_default(
    command: &CommandDefinition,
    ctx: &mut ExecutionContext,
    services: &Services,
) -> Result<CommandResult> {
    let key = cache_key(&command.name, &ctx.args, &ctx.flags);
    let options = match services
        .dry_run_cache
        .take(&key, &command_hash(command))
    {
        Some(entry) => {
            tracing::info!(command = %command.name, "consuming cached dry-run plan");
            ctx.publish_synthetic_outputs(DRY_RUN_CACHE_STAGE, &entry.analysis_outputs);
            PipelineOptions {
                precomputed: entry.precomputed_outputs.unwrap_or_default(),
                preloaded_prompts: entry.preloaded_prompts,
                preloaded_agent: entry.preloaded_agent,
                preresolved_inputs: entry.preresolved_inputs,
                pipeline_validated: entry.pipeline_validated,
            }
        }
        None => PipelineOptions::default(),
    };
    execute_pipeline_with(&command.pipeline, ctx, services, options).await
}
