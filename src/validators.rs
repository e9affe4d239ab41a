//! Ready-made stage output validators.
//!
//! Domain checks applied to a stage's parsed outputs before the
//! pipeline moves on. Register them per prompt id on
//! [`Services`](crate::services::Services); a critical failure sets
//! `stop_pipeline` on the failing stage.

use crate::services::{StageValidator, ValidationFailure};
use serde_json::{Map, Value};

/// Requires a set of output fields to be present and non-empty.
///
/// Typical use: a specification-writing prompt must actually produce
/// its sections before implementation stages run against them.
pub struct CompletenessValidator {
    required_fields: Vec<String>,
    critical: bool,
}

impl CompletenessValidator {
    pub fn new(required_fields: &[&str]) -> Self {
        Self {
            required_fields: required_fields.iter().map(|s| s.to_string()).collect(),
            critical: false,
        }
    }

    /// A failure stops the whole pipeline instead of just this stage.
    pub fn critical(mut self) -> Self {
        self.critical = true;
        self
    }
}

impl StageValidator for CompletenessValidator {
    fn validate(&self, outputs: &Map<String, Value>) -> Result<(), ValidationFailure> {
        let missing: Vec<&str> = self
            .required_fields
            .iter()
            .filter(|field| outputs.get(field.as_str()).map_or(true, is_empty))
            .map(String::as_str)
            .collect();
        if missing.is_empty() {
            Ok(())
        } else {
            Err(ValidationFailure {
                message: format!("incomplete output, missing or empty: {}", missing.join(", ")),
                critical: self.critical,
            })
        }
    }
}

/// Requires a numeric confidence output to meet a threshold.
///
/// Accepts a number in `[0, 1]` or the labels `low`/`medium`/`high`
/// (scored 0.25 / 0.5 / 0.9).
pub struct ConfidenceValidator {
    field: String,
    threshold: f64,
    critical: bool,
}

impl ConfidenceValidator {
    pub fn new(field: &str, threshold: f64) -> Self {
        Self {
            field: field.to_string(),
            threshold,
            critical: false,
        }
    }

    pub fn critical(mut self) -> Self {
        self.critical = true;
        self
    }
}

impl StageValidator for ConfidenceValidator {
    fn validate(&self, outputs: &Map<String, Value>) -> Result<(), ValidationFailure> {
        let score = outputs.get(&self.field).and_then(confidence_score);
        match score {
            Some(score) if score >= self.threshold => Ok(()),
            Some(score) => Err(ValidationFailure {
                message: format!(
                    "{} is {score:.2}, below the {:.2} threshold",
                    self.field, self.threshold
                ),
                critical: self.critical,
            }),
            None => Err(ValidationFailure {
                message: format!("{} is missing or not a recognized confidence value", self.field),
                critical: self.critical,
            }),
        }
    }
}

fn confidence_score(value: &Value) -> Option<f64> {
    match value {
        Value::Number(n) => n.as_f64(),
        Value::String(s) => match s.to_lowercase().as_str() {
            "low" => Some(0.25),
            "medium" => Some(0.5),
            "high" => Some(0.9),
            _ => s.parse().ok(),
        },
        _ => None,
    }
}

fn is_empty(value: &Value) -> bool {
    match value {
        Value::Null => true,
        Value::String(s) => s.trim().is_empty(),
        Value::Array(items) => items.is_empty(),
        Value::Object(map) => map.is_empty(),
        _ => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn outputs(value: Value) -> Map<String, Value> {
        value.as_object().unwrap().clone()
    }

    #[test]
    fn test_completeness_passes() {
        let v = CompletenessValidator::new(&["sections", "summary"]);
        let out = outputs(json!({"sections": ["intro"], "summary": "done", "extra": 1}));
        assert!(v.validate(&out).is_ok());
    }

    #[test]
    fn test_completeness_reports_missing_and_empty() {
        let v = CompletenessValidator::new(&["sections", "summary"]);
        let out = outputs(json!({"sections": []}));
        let failure = v.validate(&out).unwrap_err();
        assert!(failure.message.contains("sections"));
        assert!(failure.message.contains("summary"));
        assert!(!failure.critical);
    }

    #[test]
    fn test_completeness_critical() {
        let v = CompletenessValidator::new(&["plan"]).critical();
        let failure = v.validate(&outputs(json!({}))).unwrap_err();
        assert!(failure.critical);
    }

    #[test]
    fn test_confidence_numeric() {
        let v = ConfidenceValidator::new("confidence", 0.7);
        assert!(v.validate(&outputs(json!({"confidence": 0.8}))).is_ok());
        assert!(v.validate(&outputs(json!({"confidence": 0.5}))).is_err());
    }

    #[test]
    fn test_confidence_labels() {
        let v = ConfidenceValidator::new("confidence", 0.7);
        assert!(v.validate(&outputs(json!({"confidence": "high"}))).is_ok());
        assert!(v.validate(&outputs(json!({"confidence": "medium"}))).is_err());
        assert!(v.validate(&outputs(json!({"confidence": "low"}))).is_err());
    }

    #[test]
    fn test_confidence_numeric_string() {
        let v = ConfidenceValidator::new("confidence", 0.7);
        assert!(v.validate(&outputs(json!({"confidence": "0.75"}))).is_ok());
    }

    #[test]
    fn test_confidence_missing_or_unrecognized() {
        let v = ConfidenceValidator::new("confidence", 0.7);
        assert!(v.validate(&outputs(json!({}))).is_err());
        assert!(v.validate(&outputs(json!({"confidence": "sure"}))).is_err());
        assert!(v.validate(&outputs(json!({"confidence": [1]}))).is_err());
    }
}
