//! # Command Engine
//!
//! Pipeline execution engine for declarative, multi-stage LLM commands.
//!
//! A **command** binds an agent persona, a set of allowed tools, and an
//! ordered pipeline of **stages**; each stage pairs a prompt with typed
//! inputs (resolved from arguments, previous stage outputs, session
//! context, or the environment) and a set of expected structured
//! outputs. The engine drives these pipelines to completion against a
//! pluggable [`Provider`], running a bounded tool-use loop per stage
//! with dry-run simulation, output caching, idempotency supervision,
//! shell-hook interception, and escalation gating.
//!
//! ## Core Concepts
//!
//! - **[`CommandDefinition`]** / **[`PipelineStage`]** — the declarative
//!   shape of a run, loaded by a [`DocumentLoader`] collaborator.
//! - **[`ExecutionContext`]** — per-run state: args, flags, the variable
//!   resolver, and completed stage outputs.
//! - **[`Services`]** — the flat collaborator record (document loader,
//!   tool router, caches, escalation handler, validators).
//! - **[`select_and_execute`]** — strategy selection and execution:
//!   dry-run, isolation, interactive, or the default pipeline path.
//! - **[`Provider`]** — the LLM abstraction; [`MockProvider`] ships for
//!   deterministic tests.
//!
//! ## Quick Start
//!
//! ```no_run
//! use command_engine::{
//!     select_and_execute, CommandDefinition, ExecutionContext, MockProvider, PipelineStage,
//!     Services, ToolRouter,
//! };
//! use serde_json::json;
//! use std::sync::Arc;
//!
//! # struct MyLoader;
//! # #[async_trait::async_trait]
//! # impl command_engine::DocumentLoader for MyLoader {
//! #     async fn load_prompt(&self, id: &str) -> command_engine::Result<command_engine::PromptDefinition> {
//! #         Ok(command_engine::PromptDefinition { id: id.into(), content: "...".into() })
//! #     }
//! #     async fn load_agent(&self, _role: &str) -> command_engine::Result<command_engine::AgentDefinition> {
//! #         Ok(command_engine::AgentDefinition::default())
//! #     }
//! # }
//! #[tokio::main]
//! async fn main() -> command_engine::Result<()> {
//!     let command = CommandDefinition {
//!         name: "summarize".into(),
//!         description: "Summarize a document".into(),
//!         agent_role: Some("analyst".into()),
//!         fallback_agent: None,
//!         model: None,
//!         allowed_tools: vec!["read_file".into()],
//!         knowledge_files: vec![],
//!         pipeline: vec![PipelineStage::new("summarize", "analysis.summarize")
//!             .with_input("source_file", json!("$ARG_1"))
//!             .with_outputs(&["summary", "key_points"])],
//!     };
//!
//!     let services = Services::new(Arc::new(MyLoader), Arc::new(ToolRouter::new(".")));
//!     let provider = Arc::new(MockProvider::fixed(
//!         "```json\n{\"summary\": \"...\", \"key_points\": []}\n```",
//!     ));
//!     let ctx = ExecutionContext::new(&command, provider).with_args(vec![json!("README.md")]);
//!
//!     let result = select_and_execute(&command, ctx, &services).await?;
//!     println!("success: {}", result.success);
//!     Ok(())
//! }
//! ```

pub mod cache;
pub mod context;
pub mod definition;
pub mod error;
pub mod escalation;
pub mod events;
pub mod hooks;
pub mod idempotency;
pub mod messages;
pub mod output_parser;
pub mod pipeline_executor;
pub mod provider;
pub mod resolver;
pub mod schedule;
pub mod services;
pub mod stage_executor;
pub mod strategy;
pub mod tools;
pub mod types;
pub mod validate;
pub mod validators;

pub use cache::{DryRunCache, StageOutputCache};
pub use context::{ExecutionContext, IsolationSpec, SessionInfo};
pub use definition::{
    AgentDefinition, CommandDefinition, DocumentLoader, PipelineStage, PromptDefinition,
    StageCacheConfig,
};
pub use error::{EngineError, Result};
pub use escalation::{
    EscalationDecision, EscalationDetector, EscalationHandler, EscalationSignal, RiskLevel,
};
pub use events::{Event, EventHandler, FnEventHandler};
pub use hooks::{HookEngine, HookMatcher, HooksConfig};
pub use idempotency::{IdempotencyOptions, IdempotencyStore};
pub use pipeline_executor::{execute_pipeline, execute_pipeline_with, PipelineOptions};
pub use provider::{
    ChatMessage, CompletionRequest, CompletionResponse, MockProvider, MockStep, Provider, Role,
    ToolCall, ToolDefinition, Usage,
};
pub use resolver::{VariableContext, VariableResolver};
pub use schedule::{group_stages, StageGroup};
pub use services::{QaCollaborator, Services, StageValidator, ValidationFailure};
pub use stage_executor::{execute_stage, StageOptions};
pub use strategy::select_and_execute;
pub use tools::{ExternalToolBackend, ToolResult, ToolRouter, WriteApprover};
pub use types::{CommandResult, StageOutput};
pub use validate::validate_pipeline;
pub use validators::{CompletenessValidator, ConfidenceValidator};
