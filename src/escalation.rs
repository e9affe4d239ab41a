//! Escalation signal detection and the human-gate contract.
//!
//! Agents may embed an `_escalation` JSON block in a response when they
//! hit a criterion that requires human review. The detector locates the
//! block, strips it out of the content, and decides whether the gate
//! should fire. Malformed signals are non-fatal: the content passes
//! through untouched and the parse error is surfaced in diagnostics.

use crate::output_parser::extract::{fenced_blocks, find_bracketed};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Default confidence gate: anything below this triggers escalation.
pub const DEFAULT_CONFIDENCE_THRESHOLD: u8 = 75;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RiskLevel {
    Low,
    #[default]
    Medium,
    High,
    Critical,
}

/// The structured signal parsed from an `_escalation` block.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EscalationSignal {
    #[serde(default)]
    pub requires_escalation: bool,

    /// 0–100; values over 100 are clamped on normalization.
    #[serde(default = "default_confidence")]
    pub confidence: u8,

    #[serde(default)]
    pub risk_level: RiskLevel,

    #[serde(default)]
    pub triggered_criteria: Vec<String>,

    #[serde(default)]
    pub reasoning: String,

    #[serde(default)]
    pub proposed_action: String,
}

fn default_confidence() -> u8 {
    50
}

impl EscalationSignal {
    fn normalized(mut self) -> Self {
        self.confidence = self.confidence.min(100);
        self
    }
}

/// What the detector found in a response.
#[derive(Debug, Clone)]
pub struct Detection {
    /// The response with the `_escalation` block removed. Equal to the
    /// original content when no well-formed block was found.
    pub cleaned: String,
    pub signal: Option<EscalationSignal>,
    /// Set when a block was located but would not parse.
    pub parse_error: Option<String>,
}

/// The human decision returned by an [`EscalationHandler`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EscalationDecision {
    /// Stop the pipeline; the stage fails with `stop_pipeline` set.
    Abort,
    /// Continue as if no escalation happened.
    Proceed,
    /// Continue, recording the user's guidance into the stage metadata.
    Modify { guidance: String },
}

/// External collaborator that gates escalations on a human.
#[async_trait]
pub trait EscalationHandler: Send + Sync {
    async fn on_escalation(&self, stage: &str, signal: &EscalationSignal) -> EscalationDecision;
}

/// Locates and evaluates `_escalation` signals.
#[derive(Debug, Clone, Copy)]
pub struct EscalationDetector {
    pub confidence_threshold: u8,
}

impl Default for EscalationDetector {
    fn default() -> Self {
        Self {
            confidence_threshold: DEFAULT_CONFIDENCE_THRESHOLD,
        }
    }
}

impl EscalationDetector {
    pub fn new(confidence_threshold: u8) -> Self {
        Self {
            confidence_threshold,
        }
    }

    /// Find the `_escalation` block, parse it, and strip it from the
    /// content. Never fails: a malformed block yields the original
    /// content with `parse_error` set.
    pub fn detect(&self, content: &str) -> Detection {
        // Fenced blocks first; a raw trailing object is the fallback
        // for models that skip the fence.
        for block in fenced_blocks(content) {
            if !block.content.contains("\"_escalation\"") {
                continue;
            }
            return match parse_signal(&block.content) {
                Ok(signal) => Detection {
                    cleaned: remove_block(content, &block.content),
                    signal: Some(signal),
                    parse_error: None,
                },
                Err(e) => Detection {
                    cleaned: content.to_string(),
                    signal: None,
                    parse_error: Some(e),
                },
            };
        }

        if let Some(candidate) = find_bracketed(content, '{', '}') {
            if candidate.contains("\"_escalation\"") {
                return match parse_signal(candidate) {
                    Ok(signal) => Detection {
                        cleaned: content.replace(candidate, "").trim().to_string(),
                        signal: Some(signal),
                        parse_error: None,
                    },
                    Err(e) => Detection {
                        cleaned: content.to_string(),
                        signal: None,
                        parse_error: Some(e),
                    },
                };
            }
        }

        Detection {
            cleaned: content.to_string(),
            signal: None,
            parse_error: None,
        }
    }

    /// Whether a parsed signal meets any of the gate criteria.
    pub fn should_escalate(&self, signal: &EscalationSignal) -> bool {
        signal.requires_escalation
            || signal.confidence < self.confidence_threshold
            || matches!(signal.risk_level, RiskLevel::High | RiskLevel::Critical)
            || !signal.triggered_criteria.is_empty()
    }
}

fn parse_signal(text: &str) -> Result<EscalationSignal, String> {
    let value: Value = serde_json::from_str(text.trim()).map_err(|e| e.to_string())?;
    let inner = value
        .get("_escalation")
        .cloned()
        .ok_or_else(|| "missing _escalation key".to_string())?;
    serde_json::from_value::<EscalationSignal>(inner)
        .map(EscalationSignal::normalized)
        .map_err(|e| e.to_string())
}

/// Remove the fenced block that contains the given content.
fn remove_block(content: &str, block_content: &str) -> String {
    let Some(inner_start) = content.find(block_content) else {
        return content.to_string();
    };
    let fence_start = content[..inner_start].rfind("```").unwrap_or(inner_start);
    let after_inner = inner_start + block_content.len();
    let fence_end = content[after_inner..]
        .find("```")
        .map(|i| after_inner + i + 3)
        .unwrap_or(after_inner);
    format!("{}{}", &content[..fence_start], &content[fence_end..])
        .trim()
        .to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn detector() -> EscalationDetector {
        EscalationDetector::default()
    }

    #[test]
    fn test_no_signal() {
        let d = detector().detect("just a normal answer");
        assert!(d.signal.is_none());
        assert!(d.parse_error.is_none());
        assert_eq!(d.cleaned, "just a normal answer");
    }

    #[test]
    fn test_fenced_signal_detected_and_removed() {
        let content = "Work done.\n```json\n{\"_escalation\":{\"requires_escalation\":true,\"risk_level\":\"high\",\"confidence\":40,\"triggered_criteria\":[\"destructive migration\"],\"reasoning\":\"drops table\",\"proposed_action\":\"run migration\"}}\n```";
        let d = detector().detect(content);
        let signal = d.signal.unwrap();
        assert!(signal.requires_escalation);
        assert_eq!(signal.risk_level, RiskLevel::High);
        assert_eq!(signal.confidence, 40);
        assert_eq!(signal.triggered_criteria, vec!["destructive migration"]);
        assert_eq!(d.cleaned, "Work done.");
    }

    #[test]
    fn test_trailing_raw_object() {
        let content = "Answer text.\n{\"_escalation\": {\"requires_escalation\": true}}";
        let d = detector().detect(content);
        assert!(d.signal.unwrap().requires_escalation);
        assert_eq!(d.cleaned, "Answer text.");
    }

    #[test]
    fn test_malformed_signal_is_non_fatal() {
        let content = "Text.\n```json\n{\"_escalation\": {broken\n```";
        let d = detector().detect(content);
        assert!(d.signal.is_none());
        assert!(d.parse_error.is_some());
        assert_eq!(d.cleaned, content);
    }

    #[test]
    fn test_defaults_applied() {
        let content = "{\"_escalation\": {}}";
        let d = detector().detect(content);
        let signal = d.signal.unwrap();
        assert!(!signal.requires_escalation);
        assert_eq!(signal.confidence, 50);
        assert_eq!(signal.risk_level, RiskLevel::Medium);
        assert!(signal.triggered_criteria.is_empty());
    }

    #[test]
    fn test_should_escalate_on_flag() {
        let signal = EscalationSignal {
            requires_escalation: true,
            confidence: 100,
            risk_level: RiskLevel::Low,
            triggered_criteria: vec![],
            reasoning: String::new(),
            proposed_action: String::new(),
        };
        assert!(detector().should_escalate(&signal));
    }

    #[test]
    fn test_should_escalate_on_low_confidence() {
        let signal = EscalationSignal {
            requires_escalation: false,
            confidence: 74,
            risk_level: RiskLevel::Low,
            triggered_criteria: vec![],
            reasoning: String::new(),
            proposed_action: String::new(),
        };
        assert!(detector().should_escalate(&signal));
        assert!(!EscalationDetector::new(50).should_escalate(&signal));
    }

    #[test]
    fn test_should_escalate_on_risk_level() {
        for (level, expected) in [
            (RiskLevel::Low, false),
            (RiskLevel::Medium, false),
            (RiskLevel::High, true),
            (RiskLevel::Critical, true),
        ] {
            let signal = EscalationSignal {
                requires_escalation: false,
                confidence: 100,
                risk_level: level,
                triggered_criteria: vec![],
                reasoning: String::new(),
                proposed_action: String::new(),
            };
            assert_eq!(detector().should_escalate(&signal), expected, "{level:?}");
        }
    }

    #[test]
    fn test_should_escalate_on_criteria() {
        let signal = EscalationSignal {
            requires_escalation: false,
            confidence: 100,
            risk_level: RiskLevel::Low,
            triggered_criteria: vec!["touches auth".into()],
            reasoning: String::new(),
            proposed_action: String::new(),
        };
        assert!(detector().should_escalate(&signal));
    }

    #[test]
    fn test_confidence_clamped() {
        let content = "{\"_escalation\": {\"confidence\": 250}}";
        let d = detector().detect(content);
        assert_eq!(d.signal.unwrap().confidence, 100);
    }
}
