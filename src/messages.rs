//! Composition of the system and user messages for a stage.
//!
//! The system message stacks project guidance, the agent persona, the
//! prompt body, filtered project knowledge, and — when the stage
//! declares outputs or the agent carries escalation criteria — the
//! output-format and escalation-protocol directives. The user message
//! lists every resolved input, rendering file contents as dedicated
//! blocks.

use crate::definition::{AgentDefinition, PromptDefinition};
use crate::output_parser::default_for;
use crate::resolver::coerce_to_string;
use serde_json::{json, Map, Value};

const SECTION_SEPARATOR: &str = "\n\n---\n\n";

/// Suffixes that mark an input as a file reference; a sibling
/// `<key>_content` input carries the preloaded file body.
const FILE_KEY_SUFFIXES: &[&str] = &["_file", "_file_arg", "_path"];

/// Build the system message for a stage.
pub fn build_system_message(
    agent: &AgentDefinition,
    prompt: &PromptDefinition,
    guidance: Option<&str>,
    knowledge: &[(String, String)],
    expected_outputs: &[String],
    escalation_criteria: &[String],
) -> String {
    let mut sections: Vec<String> = Vec::new();

    if let Some(guidance) = guidance {
        if !guidance.trim().is_empty() {
            sections.push(guidance.trim().to_string());
        }
    }

    sections.push(agent.content.trim().to_string());
    sections.push(prompt.content.trim().to_string());

    if !knowledge.is_empty() {
        let mut block = String::from("# Project Knowledge\n");
        for (name, content) in knowledge {
            block.push_str(&format!("\n## {name}\n{}\n", content.trim()));
        }
        sections.push(block.trim_end().to_string());
    }

    if !expected_outputs.is_empty() {
        sections.push(output_format_directive(expected_outputs));
    }

    if !escalation_criteria.is_empty() {
        sections.push(escalation_directive(escalation_criteria));
    }

    sections.join(SECTION_SEPARATOR)
}

/// Build the user message from the resolved inputs.
pub fn build_user_message(inputs: &Map<String, Value>) -> String {
    let mut lines: Vec<String> = Vec::new();
    let mut file_blocks: Vec<String> = Vec::new();

    for (key, value) in inputs {
        // `<key>_content` entries render inside their file block.
        if key.ends_with("_content") {
            let base = key.trim_end_matches("_content").trim_end_matches('_');
            if inputs.contains_key(base) {
                continue;
            }
        }

        if is_file_key(key) {
            if let Some(Value::String(content)) = inputs.get(&format!("{key}_content")) {
                let path = coerce_to_string(value);
                file_blocks.push(format!("--- File: {path} ---\n{content}\n--- End File ---"));
                lines.push(format!("{key}: {path} (content attached below)"));
                continue;
            }
        }

        lines.push(format!("{key}: {}", coerce_to_string(value)));
    }

    let mut message = String::from("## Inputs\n\n");
    message.push_str(&lines.join("\n"));
    for block in file_blocks {
        message.push_str("\n\n");
        message.push_str(&block);
    }
    message
}

fn is_file_key(key: &str) -> bool {
    FILE_KEY_SUFFIXES.iter().any(|s| key.ends_with(s))
}

fn output_format_directive(expected_outputs: &[String]) -> String {
    let mut skeleton = Map::new();
    for key in expected_outputs {
        skeleton.insert(key.clone(), default_for(key).unwrap_or(json!("...")));
    }
    let example = serde_json::to_string_pretty(&Value::Object(skeleton))
        .unwrap_or_else(|_| "{}".to_string());
    format!(
        "# Output Format\n\nEnd your response with a single JSON object containing exactly \
         these keys: {}.\n\nExample shape:\n```json\n{}\n```",
        expected_outputs.join(", "),
        example
    )
}

fn escalation_directive(criteria: &[String]) -> String {
    let listed: String = criteria
        .iter()
        .map(|c| format!("- {c}"))
        .collect::<Vec<_>>()
        .join("\n");
    format!(
        "# Escalation Protocol\n\nIf any of the following criteria apply to the work you are \
         about to do, append an `_escalation` JSON block to your response and wait for human \
         review:\n{listed}\n\nBlock shape:\n```json\n{{\"_escalation\": {{\"requires_escalation\": true, \
         \"confidence\": 0, \"risk_level\": \"high\", \"triggered_criteria\": [], \
         \"reasoning\": \"...\", \"proposed_action\": \"...\"}}}}\n```"
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::definition::DecisionMaking;
    use serde_json::json;

    fn agent() -> AgentDefinition {
        AgentDefinition {
            name: "engineer".into(),
            content: "You are a careful engineer.".into(),
            decision_making: DecisionMaking::default(),
        }
    }

    fn prompt() -> PromptDefinition {
        PromptDefinition {
            id: "analysis.review".into(),
            content: "Review the provided changes.".into(),
        }
    }

    #[test]
    fn test_system_message_ordering() {
        let msg = build_system_message(
            &agent(),
            &prompt(),
            Some("House style: tabs."),
            &[("arch.md".into(), "We use hexagonal architecture.".into())],
            &["summary".into()],
            &["deletes data".into()],
        );
        let guidance = msg.find("House style").unwrap();
        let persona = msg.find("careful engineer").unwrap();
        let body = msg.find("Review the provided").unwrap();
        let knowledge = msg.find("hexagonal").unwrap();
        let outputs = msg.find("# Output Format").unwrap();
        let escalation = msg.find("# Escalation Protocol").unwrap();
        assert!(guidance < persona && persona < body && body < knowledge);
        assert!(knowledge < outputs && outputs < escalation);
    }

    #[test]
    fn test_optional_sections_omitted() {
        let msg = build_system_message(&agent(), &prompt(), None, &[], &[], &[]);
        assert!(!msg.contains("# Output Format"));
        assert!(!msg.contains("# Escalation Protocol"));
        assert!(!msg.contains("# Project Knowledge"));
        assert_eq!(msg.matches(SECTION_SEPARATOR).count(), 1);
    }

    #[test]
    fn test_output_directive_uses_default_shapes() {
        let msg = build_system_message(
            &agent(),
            &prompt(),
            None,
            &[],
            &["quality_score".into(), "issues".into(), "summary".into()],
            &[],
        );
        assert!(msg.contains("quality_score, issues, summary"));
        assert!(msg.contains("\"quality_score\": 0.5"));
        assert!(msg.contains("\"issues\": []"));
        assert!(msg.contains("\"summary\": \"...\""));
    }

    #[test]
    fn test_user_message_lists_inputs() {
        let mut inputs = Map::new();
        inputs.insert("topic".into(), json!("caching"));
        inputs.insert("depth".into(), json!(3));
        let msg = build_user_message(&inputs);
        assert!(msg.contains("topic: caching"));
        assert!(msg.contains("depth: 3"));
    }

    #[test]
    fn test_user_message_renders_file_blocks() {
        let mut inputs = Map::new();
        inputs.insert("spec_file".into(), json!("docs/spec.md"));
        inputs.insert("spec_file_content".into(), json!("# Spec\nBody."));
        let msg = build_user_message(&inputs);
        assert!(msg.contains("--- File: docs/spec.md ---"));
        assert!(msg.contains("# Spec\nBody."));
        assert!(msg.contains("--- End File ---"));
        // The content is not also listed as a plain input.
        assert!(!msg.contains("spec_file_content:"));
    }

    #[test]
    fn test_user_message_path_suffix_variant() {
        let mut inputs = Map::new();
        inputs.insert("config_path".into(), json!("app.toml"));
        inputs.insert("config_path_content".into(), json!("[app]"));
        let msg = build_user_message(&inputs);
        assert!(msg.contains("--- File: app.toml ---"));
    }

    #[test]
    fn test_orphan_content_key_still_listed() {
        let mut inputs = Map::new();
        inputs.insert("notes_content".into(), json!("standalone"));
        let msg = build_user_message(&inputs);
        assert!(msg.contains("notes_content: standalone"));
    }
}
