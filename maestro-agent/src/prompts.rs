use maestro_core::{ArtifactComponentDefinition, DataComponentDefinition};
use maestro_tool::Tool;
use std::collections::BTreeMap;
use std::sync::Arc;

/// Inputs for the Phase-1 planning prompt.
pub struct PlanningPromptInputs<'a> {
    pub core_prompt: &'a str,
    pub tools: &'a BTreeMap<String, Arc<dyn Tool>>,
    pub artifact_list: &'a str,
    pub data_components: &'a [DataComponentDefinition],
    pub artifact_components: &'a [ArtifactComponentDefinition],
    pub can_transfer: bool,
    pub can_delegate: bool,
    pub structured_output: bool,
}

/// Phase-1 system prompt: core prompt, tool catalog, scoped artifacts,
/// component enumerations, relation flags, and (when structured output is
/// configured) the tools-only directive.
pub fn build_planning_prompt(inputs: &PlanningPromptInputs<'_>) -> String {
    let mut sections = vec![inputs.core_prompt.to_string()];

    if !inputs.tools.is_empty() {
        let mut catalog = String::from("## Available tools\n");
        for (name, tool) in inputs.tools {
            catalog.push_str(&format!("\n### {name}\n{}\n", tool.description()));
            if let Some(schema) = tool.parameters_schema() {
                catalog.push_str(&format!("Input schema: {schema}\n"));
            }
        }
        catalog.push_str("\nCall a tool whenever it gets you closer to the answer.");
        sections.push(catalog);
    }

    if !inputs.artifact_list.is_empty() {
        sections.push(inputs.artifact_list.to_string());
    }

    if !inputs.data_components.is_empty() {
        let list: Vec<String> = inputs
            .data_components
            .iter()
            .map(|c| format!("- {}: {}", c.name, c.description))
            .collect();
        sections.push(format!(
            "The final answer will be produced as these structured components:\n{}",
            list.join("\n")
        ));
    }

    if !inputs.artifact_components.is_empty() {
        let list: Vec<String> = inputs
            .artifact_components
            .iter()
            .map(|c| format!("- {}: {}", c.name, c.description))
            .collect();
        sections.push(format!(
            "Tool results can be saved as artifacts of these types:\n{}",
            list.join("\n")
        ));
    }

    match (inputs.can_transfer, inputs.can_delegate) {
        (true, true) => sections.push(
            "You may hand the conversation to another agent (transfer_to_*) or request a \
             bounded sub-task from one (delegate_to_*)."
                .to_string(),
        ),
        (true, false) => sections.push(
            "You may hand the conversation to another agent via the transfer_to_* tools."
                .to_string(),
        ),
        (false, true) => sections.push(
            "You may request bounded sub-tasks from other agents via the delegate_to_* tools."
                .to_string(),
        ),
        (false, false) => {}
    }

    if inputs.structured_output {
        sections.push(
            "This is the planning phase. Respond ONLY with tool calls — no prose. Gather \
             whatever the structured answer needs, then call `thinking_complete` to finish \
             planning."
                .to_string(),
        );
    }

    sections.join("\n\n")
}

/// Inputs for the Phase-2 structured prompt.
pub struct StructuredPromptInputs<'a> {
    pub core_prompt: &'a str,
    pub data_components: &'a [DataComponentDefinition],
    pub artifact_components: &'a [ArtifactComponentDefinition],
    pub artifact_list: &'a str,
}

/// Phase-2 system prompt: core prompt plus component schemas and the
/// scoped artifact list. No tools.
pub fn build_structured_prompt(inputs: &StructuredPromptInputs<'_>) -> String {
    let mut sections = vec![inputs.core_prompt.to_string()];

    let components: Vec<String> = inputs
        .data_components
        .iter()
        .map(|c| format!("### {}\n{}\nProps schema: {}", c.name, c.description, c.props))
        .collect();
    sections.push(format!(
        "Produce the answer as a `dataComponents` array using these components:\n\n{}",
        components.join("\n\n")
    ));

    if !inputs.artifact_components.is_empty() {
        let list: Vec<String> = inputs
            .artifact_components
            .iter()
            .map(|c| {
                format!(
                    "### ArtifactCreate_{}\n{}\nSummary props: {}",
                    c.name, c.description, c.summary_props
                )
            })
            .collect();
        sections.push(format!(
            "To surface a tool result as an artifact, emit a creation entry:\n\n{}",
            list.join("\n\n")
        ));
    }

    if !inputs.artifact_list.is_empty() {
        sections.push(inputs.artifact_list.to_string());
    }

    sections.join("\n\n")
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn component() -> DataComponentDefinition {
        DataComponentDefinition {
            id: "fact".into(),
            name: "Fact".into(),
            description: "One fact".into(),
            props: json!({"type": "object"}),
        }
    }

    #[test]
    fn test_planning_prompt_structured_directive() {
        let tools = BTreeMap::new();
        let with = build_planning_prompt(&PlanningPromptInputs {
            core_prompt: "You are a router.",
            tools: &tools,
            artifact_list: "",
            data_components: &[component()],
            artifact_components: &[],
            can_transfer: false,
            can_delegate: false,
            structured_output: true,
        });
        assert!(with.contains("thinking_complete"));
        assert!(with.contains("ONLY with tool calls"));

        let without = build_planning_prompt(&PlanningPromptInputs {
            core_prompt: "You are a router.",
            tools: &tools,
            artifact_list: "",
            data_components: &[],
            artifact_components: &[],
            can_transfer: true,
            can_delegate: true,
            structured_output: false,
        });
        assert!(!without.contains("thinking_complete"));
        assert!(without.contains("transfer_to_*"));
        assert!(without.contains("delegate_to_*"));
    }

    #[test]
    fn test_structured_prompt_lists_components() {
        let prompt = build_structured_prompt(&StructuredPromptInputs {
            core_prompt: "You are a router.",
            data_components: &[component()],
            artifact_components: &[],
            artifact_list: "Artifacts available for reference:\n- Doc",
        });
        assert!(prompt.contains("### Fact"));
        assert!(prompt.contains("Artifacts available"));
    }
}
