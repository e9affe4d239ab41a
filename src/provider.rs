//! Provider trait and normalized request/response types.
//!
//! The [`Provider`] trait abstracts over LLM backends. The engine builds a
//! [`CompletionRequest`] per tool-loop iteration; implementations translate
//! it into whatever their API expects and return a normalized
//! [`CompletionResponse`]. Concrete HTTP providers live outside this crate;
//! [`MockProvider`] ships here so consumers can write deterministic tests.

use crate::error::Result;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;

/// The role of a chat message author.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    System,
    User,
    Assistant,
    /// Carries a tool result back to the model.
    Tool,
}

/// A single message in the conversation sent to the provider.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChatMessage {
    pub role: Role,
    pub content: String,

    /// Tool name, for tool-role messages.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,

    /// Tool calls carried by an assistant message.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tool_calls: Option<Vec<ToolCall>>,

    /// Which call a tool-role message answers.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tool_call_id: Option<String>,
}

impl ChatMessage {
    pub fn system(content: impl Into<String>) -> Self {
        Self::plain(Role::System, content)
    }

    pub fn user(content: impl Into<String>) -> Self {
        Self::plain(Role::User, content)
    }

    pub fn assistant(content: impl Into<String>) -> Self {
        Self::plain(Role::Assistant, content)
    }

    pub fn tool_result(call_id: impl Into<String>, name: impl Into<String>, output: impl Into<String>) -> Self {
        Self {
            role: Role::Tool,
            content: output.into(),
            name: Some(name.into()),
            tool_calls: None,
            tool_call_id: Some(call_id.into()),
        }
    }

    fn plain(role: Role, content: impl Into<String>) -> Self {
        Self {
            role,
            content: content.into(),
            name: None,
            tool_calls: None,
            tool_call_id: None,
        }
    }
}

/// A tool invocation emitted by the model.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolCall {
    pub id: String,
    pub name: String,
    pub arguments: Value,
}

/// A tool made available to the model. The schema is passed verbatim.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolDefinition {
    pub name: String,
    pub description: String,
    pub parameters: Value,
}

/// Token accounting reported by the provider.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
pub struct Usage {
    pub prompt_tokens: u64,
    pub completion_tokens: u64,
}

/// A normalized completion request.
#[derive(Debug, Clone)]
pub struct CompletionRequest {
    pub messages: Vec<ChatMessage>,
    pub model: Option<String>,
    pub mode: Option<String>,
    /// `None` disables tool use for this call.
    pub tools: Option<Vec<ToolDefinition>>,
    pub temperature: f64,
    pub max_tokens: u32,
}

/// A normalized completion response.
#[derive(Debug, Clone, Default)]
pub struct CompletionResponse {
    pub content: String,
    pub tool_calls: Option<Vec<ToolCall>>,
    pub finish_reason: Option<String>,
    pub usage: Option<Usage>,
    /// Provider-supplied signal that this completion already carries a
    /// finished deliverable and the pipeline should stop after this stage.
    pub guided_completion: bool,
}

impl CompletionResponse {
    pub fn text(content: impl Into<String>) -> Self {
        Self {
            content: content.into(),
            finish_reason: Some("stop".into()),
            ..Default::default()
        }
    }

    pub fn has_tool_calls(&self) -> bool {
        self.tool_calls.as_ref().is_some_and(|c| !c.is_empty())
    }
}

/// Abstraction over LLM providers.
///
/// Implementations must accept both zero-tool and tool-enabled calls.
///
/// # Object Safety
///
/// Designed to be used as `Arc<dyn Provider>`.
#[async_trait]
pub trait Provider: Send + Sync {
    async fn complete(&self, request: CompletionRequest) -> Result<CompletionResponse>;

    /// Human-readable name for logging and diagnostics.
    fn name(&self) -> &'static str;
}

/// A scripted step for [`MockProvider`].
#[derive(Debug, Clone)]
pub enum MockStep {
    /// Return this text with no tool calls.
    Text(String),
    /// Return these tool calls (content empty).
    ToolCalls(Vec<ToolCall>),
    /// Return a guided completion carrying this text.
    Guided(String),
}

/// A test provider that returns scripted steps in order.
///
/// Cycles back to the beginning when all steps have been consumed, and
/// records every request it receives for assertion.
pub struct MockProvider {
    steps: Vec<MockStep>,
    index: AtomicUsize,
    requests: Mutex<Vec<CompletionRequest>>,
}

impl MockProvider {
    pub fn new(steps: Vec<MockStep>) -> Self {
        assert!(!steps.is_empty(), "MockProvider requires at least one step");
        Self {
            steps,
            index: AtomicUsize::new(0),
            requests: Mutex::new(Vec::new()),
        }
    }

    /// A provider that always returns the same text.
    pub fn fixed(text: impl Into<String>) -> Self {
        Self::new(vec![MockStep::Text(text.into())])
    }

    /// A provider returning the given texts in order.
    pub fn texts(texts: Vec<String>) -> Self {
        Self::new(texts.into_iter().map(MockStep::Text).collect())
    }

    /// Requests captured so far.
    pub fn requests(&self) -> Vec<CompletionRequest> {
        self.requests.lock().expect("mock lock poisoned").clone()
    }

    /// Number of completions served.
    pub fn calls(&self) -> usize {
        self.index.load(Ordering::Relaxed)
    }

    fn next_step(&self) -> MockStep {
        let idx = self.index.fetch_add(1, Ordering::Relaxed) % self.steps.len();
        self.steps[idx].clone()
    }
}

#[async_trait]
impl Provider for MockProvider {
    async fn complete(&self, request: CompletionRequest) -> Result<CompletionResponse> {
        self.requests.lock().expect("mock lock poisoned").push(request);
        Ok(match self.next_step() {
            MockStep::Text(content) => CompletionResponse::text(content),
            MockStep::ToolCalls(calls) => CompletionResponse {
                finish_reason: Some("tool_calls".into()),
                tool_calls: Some(calls),
                ..Default::default()
            },
            MockStep::Guided(content) => CompletionResponse {
                guided_completion: true,
                ..CompletionResponse::text(content)
            },
        })
    }

    fn name(&self) -> &'static str {
        "mock"
    }
}
