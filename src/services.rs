//! The flat collaborator record handed to the executors.
//!
//! Everything the stage and pipeline executors need beyond the
//! [`ExecutionContext`](crate::context::ExecutionContext) lives here as
//! an explicit dependency — no ambient singletons, no back-pointers
//! between managers.

use crate::cache::{DryRunCache, StageOutputCache};
use crate::definition::DocumentLoader;
use crate::escalation::{EscalationDetector, EscalationHandler};
use crate::events::EventHandler;
use crate::tools::{ToolRouter, WriteApprover};
use async_trait::async_trait;
use serde_json::{Map, Value};
use std::collections::HashMap;
use std::sync::Arc;

/// Collaborator that asks the user clarifying questions mid-run.
#[async_trait]
pub trait QaCollaborator: Send + Sync {
    /// Returns `question -> answer` pairs for the questions asked.
    async fn ask(&self, stage: &str, questions: &[String]) -> Map<String, Value>;
}

/// A per-stage output validator failure.
#[derive(Debug, Clone)]
pub struct ValidationFailure {
    pub message: String,
    /// Critical failures stop the whole pipeline.
    pub critical: bool,
}

/// Domain validation applied to a stage's parsed outputs, keyed by
/// prompt id (e.g. a completeness check for specification prompts).
pub trait StageValidator: Send + Sync {
    fn validate(&self, outputs: &Map<String, Value>) -> Result<(), ValidationFailure>;
}

/// Flat dependency record for one engine instance.
pub struct Services {
    pub loader: Arc<dyn DocumentLoader>,
    pub router: Arc<ToolRouter>,
    pub stage_cache: Arc<StageOutputCache>,
    pub dry_run_cache: Arc<DryRunCache>,
    pub escalation_detector: EscalationDetector,
    pub escalation_handler: Option<Arc<dyn EscalationHandler>>,
    pub qa: Option<Arc<dyn QaCollaborator>>,
    pub approver: Option<Arc<dyn WriteApprover>>,
    /// Validators keyed by prompt id.
    pub validators: HashMap<String, Arc<dyn StageValidator>>,
    pub events: Option<Arc<dyn EventHandler>>,
}

impl Services {
    pub fn new(loader: Arc<dyn DocumentLoader>, router: Arc<ToolRouter>) -> Self {
        Self {
            loader,
            router,
            stage_cache: Arc::new(StageOutputCache::new()),
            dry_run_cache: Arc::new(DryRunCache::new()),
            escalation_detector: EscalationDetector::default(),
            escalation_handler: None,
            qa: None,
            approver: None,
            validators: HashMap::new(),
            events: None,
        }
    }

    pub fn with_stage_cache(mut self, cache: Arc<StageOutputCache>) -> Self {
        self.stage_cache = cache;
        self
    }

    pub fn with_dry_run_cache(mut self, cache: Arc<DryRunCache>) -> Self {
        self.dry_run_cache = cache;
        self
    }

    pub fn with_escalation_detector(mut self, detector: EscalationDetector) -> Self {
        self.escalation_detector = detector;
        self
    }

    pub fn with_escalation_handler(mut self, handler: Arc<dyn EscalationHandler>) -> Self {
        self.escalation_handler = Some(handler);
        self
    }

    pub fn with_qa(mut self, qa: Arc<dyn QaCollaborator>) -> Self {
        self.qa = Some(qa);
        self
    }

    pub fn with_approver(mut self, approver: Arc<dyn WriteApprover>) -> Self {
        self.approver = Some(approver);
        self
    }

    pub fn with_validator(mut self, prompt_id: &str, validator: Arc<dyn StageValidator>) -> Self {
        self.validators.insert(prompt_id.to_string(), validator);
        self
    }

    pub fn with_events(mut self, events: Arc<dyn EventHandler>) -> Self {
        self.events = Some(events);
        self
    }
}
