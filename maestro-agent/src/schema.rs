use maestro_core::{ArtifactComponentDefinition, DataComponentDefinition};
use serde_json::{Value, json};

/// Union item schema for one declared data component.
fn data_component_schema(component: &DataComponentDefinition) -> Value {
    json!({
        "type": "object",
        "description": component.description,
        "properties": {
            "name": { "const": component.name },
            "props": component.props,
        },
        "required": ["name", "props"],
    })
}

/// `ArtifactCreate_<Type>` creation directive schema for one artifact
/// component.
fn artifact_create_schema(component: &ArtifactComponentDefinition) -> Value {
    json!({
        "type": "object",
        "description": format!(
            "Create a {} artifact from a recorded tool result. Selectors are JMESPath \
             expressions evaluated against the tool result.",
            component.name
        ),
        "properties": {
            "name": { "const": format!("ArtifactCreate_{}", component.name) },
            "props": {
                "type": "object",
                "properties": {
                    "id": { "type": "string", "description": "Stable artifact id" },
                    "tool": { "type": "string", "description": "Source tool call id" },
                    "base": { "type": "string", "description": "Base selector applied first" },
                    "summary": {
                        "type": "object",
                        "description": "prop → selector map for the summary view",
                    },
                    "full": {
                        "type": "object",
                        "description": "prop → selector map for the full view",
                    },
                },
                "required": ["id", "tool"],
            },
        },
        "required": ["name", "props"],
    })
}

/// Reference schema for artifacts that already exist.
fn artifact_reference_schema() -> Value {
    json!({
        "type": "object",
        "description": "Reference an artifact created earlier in this conversation.",
        "properties": {
            "name": { "const": "Artifact" },
            "props": {
                "type": "object",
                "properties": {
                    "artifact_id": { "type": "string" },
                    "tool_call_id": { "type": "string" },
                },
                "required": ["artifact_id", "tool_call_id"],
            },
        },
        "required": ["name", "props"],
    })
}

/// The Phase-2 response schema: `{ dataComponents: [union…] }` over every
/// declared data component plus, when artifact components exist, the
/// creation directives and the reference form.
pub fn structured_output_schema(
    data_components: &[DataComponentDefinition],
    artifact_components: &[ArtifactComponentDefinition],
) -> Value {
    let mut variants: Vec<Value> = data_components.iter().map(data_component_schema).collect();
    if !artifact_components.is_empty() {
        variants.extend(artifact_components.iter().map(artifact_create_schema));
        variants.push(artifact_reference_schema());
    }

    json!({
        "type": "object",
        "properties": {
            "dataComponents": {
                "type": "array",
                "items": { "oneOf": variants },
            },
        },
        "required": ["dataComponents"],
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn data_component() -> DataComponentDefinition {
        DataComponentDefinition {
            id: "fact".into(),
            name: "Fact".into(),
            description: "A single fact".into(),
            props: json!({
                "type": "object",
                "properties": { "text": { "type": "string" } },
                "required": ["text"],
            }),
        }
    }

    fn artifact_component() -> ArtifactComponentDefinition {
        ArtifactComponentDefinition {
            id: "doc".into(),
            name: "Document".into(),
            description: "A document".into(),
            summary_props: json!({"type": "object"}),
            full_props: json!({"type": "object"}),
        }
    }

    #[test]
    fn test_union_without_artifacts() {
        let schema = structured_output_schema(&[data_component()], &[]);
        let variants = schema["properties"]["dataComponents"]["items"]["oneOf"].as_array().unwrap();
        assert_eq!(variants.len(), 1);
        assert_eq!(variants[0]["properties"]["name"]["const"], json!("Fact"));
    }

    #[test]
    fn test_union_with_artifacts_adds_create_and_ref() {
        let schema = structured_output_schema(&[data_component()], &[artifact_component()]);
        let variants = schema["properties"]["dataComponents"]["items"]["oneOf"].as_array().unwrap();
        assert_eq!(variants.len(), 3);
        assert_eq!(
            variants[1]["properties"]["name"]["const"],
            json!("ArtifactCreate_Document")
        );
        assert_eq!(variants[2]["properties"]["name"]["const"], json!("Artifact"));
    }
}
