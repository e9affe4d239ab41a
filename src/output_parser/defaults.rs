//! Name-driven default values for missing stage outputs.
//!
//! When a declared output never materializes, the field name decides a
//! safe default so downstream stages and validators see a stable shape.
//! Unknown names receive no default and remain absent.

use serde_json::{json, Map, Value};

const OBJECT_NAMES: &[&str] = &[
    "implementation",
    "code_changes",
    "files_modified",
    "breaking_changes",
    "migration_steps",
];

const OBJECT_SUFFIXES: &[&str] = &[
    "_changes",
    "_notes",
    "_config",
    "_context",
    "_metadata",
    "_settings",
    "_results",
];

const LIST_NAMES: &[&str] = &[
    "items",
    "issues",
    "steps",
    "questions",
    "recommendations",
    "blockers",
    "risks",
    "gaps",
    "ambiguities",
];

/// Fill every still-missing expected output with its name-derived default.
pub fn apply_default_values(outputs: &mut Map<String, Value>, expected: &[String]) {
    for name in expected {
        if outputs.contains_key(name) {
            continue;
        }
        if let Some(default) = default_for(name) {
            outputs.insert(name.clone(), default);
        }
    }
}

/// The default value a field name implies, if any.
pub fn default_for(name: &str) -> Option<Value> {
    if name.contains("score") {
        return Some(json!(0.5));
    }
    if name.contains("confidence") {
        return Some(json!("medium"));
    }
    if name.starts_with("is_") || name.starts_with("has_") || name.ends_with("_ready") {
        return Some(json!(false));
    }
    // Object markers take precedence over list markers: names like
    // `migration_steps` carry a list-looking suffix but hold mappings.
    if OBJECT_NAMES.contains(&name) || OBJECT_SUFFIXES.iter().any(|s| name.ends_with(s)) {
        return Some(json!({}));
    }
    if name.ends_with("_list")
        || name.ends_with("_missing")
        || name.starts_with("files_")
        || LIST_NAMES.iter().any(|s| name == *s || name.ends_with(&format!("_{s}")))
    {
        return Some(json!([]));
    }
    if name.contains("status") {
        return Some(json!("unknown"));
    }
    if name.contains("count") || name.ends_with("_num") {
        return Some(json!(0));
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn score_defaults_to_half() {
        assert_eq!(default_for("quality_score"), Some(json!(0.5)));
        // "score" wins over "confidence" for combined names.
        assert_eq!(default_for("confidence_score"), Some(json!(0.5)));
    }

    #[test]
    fn confidence_defaults_to_medium() {
        assert_eq!(default_for("confidence"), Some(json!("medium")));
    }

    #[test]
    fn boolean_markers() {
        assert_eq!(default_for("is_valid"), Some(json!(false)));
        assert_eq!(default_for("has_tests"), Some(json!(false)));
        assert_eq!(default_for("deploy_ready"), Some(json!(false)));
    }

    #[test]
    fn list_markers() {
        assert_eq!(default_for("task_list"), Some(json!([])));
        assert_eq!(default_for("clarifying_questions"), Some(json!([])));
        assert_eq!(default_for("blockers"), Some(json!([])));
        assert_eq!(default_for("files_touched"), Some(json!([])));
        assert_eq!(default_for("fields_missing"), Some(json!([])));
    }

    #[test]
    fn object_markers_beat_list_suffixes() {
        assert_eq!(default_for("migration_steps"), Some(json!({})));
        assert_eq!(default_for("files_modified"), Some(json!({})));
        assert_eq!(default_for("breaking_changes"), Some(json!({})));
        assert_eq!(default_for("review_notes"), Some(json!({})));
    }

    #[test]
    fn status_and_count() {
        assert_eq!(default_for("status"), Some(json!("unknown")));
        assert_eq!(default_for("retry_count"), Some(json!(0)));
        assert_eq!(default_for("line_num"), Some(json!(0)));
    }

    #[test]
    fn unknown_name_has_no_default() {
        assert_eq!(default_for("summary"), None);
    }

    #[test]
    fn apply_fills_only_missing() {
        let mut outputs = Map::new();
        outputs.insert("quality_score".into(), json!(0.9));
        let expected = vec![
            "quality_score".to_string(),
            "issues".to_string(),
            "summary".to_string(),
        ];
        apply_default_values(&mut outputs, &expected);
        assert_eq!(outputs["quality_score"], 0.9);
        assert_eq!(outputs["issues"], json!([]));
        assert!(!outputs.contains_key("summary"));
    }
}
