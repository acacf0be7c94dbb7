use maestro_core::Result;
use async_trait::async_trait;
use futures::stream::Stream;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::pin::Pin;

pub type ModelResponseStream = Pin<Box<dyn Stream<Item = Result<ModelResponse>> + Send>>;

/// A chat-capable language model. Implementations always return a stream;
/// non-streaming callers read it to completion and keep the final item.
#[async_trait]
pub trait LanguageModel: Send + Sync {
    fn name(&self) -> &str;
    async fn generate(&self, req: ModelRequest, stream: bool) -> Result<ModelResponseStream>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ModelRole {
    System,
    User,
    Assistant,
    Tool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ModelPart {
    Text { text: String },
    ToolCall { id: String, name: String, args: Value },
    ToolResult { id: String, name: String, result: Value },
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModelMessage {
    pub role: ModelRole,
    pub parts: Vec<ModelPart>,
}

impl ModelMessage {
    pub fn new(role: ModelRole) -> Self {
        Self { role, parts: Vec::new() }
    }

    pub fn text(role: ModelRole, text: impl Into<String>) -> Self {
        Self { role, parts: vec![ModelPart::Text { text: text.into() }] }
    }

    pub fn with_part(mut self, part: ModelPart) -> Self {
        self.parts.push(part);
        self
    }

    /// Concatenated text parts.
    pub fn text_content(&self) -> String {
        self.parts
            .iter()
            .filter_map(|p| match p {
                ModelPart::Text { text } => Some(text.as_str()),
                _ => None,
            })
            .collect::<Vec<_>>()
            .join("")
    }

    pub fn tool_calls(&self) -> Vec<(&str, &str, &Value)> {
        self.parts
            .iter()
            .filter_map(|p| match p {
                ModelPart::ToolCall { id, name, args } => Some((id.as_str(), name.as_str(), args)),
                _ => None,
            })
            .collect()
    }
}

/// Tool surface advertised to the model.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolDeclaration {
    pub name: String,
    pub description: String,
    pub parameters: Value,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ToolChoice {
    #[default]
    Auto,
    Required,
    None,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct GenerationConfig {
    pub temperature: Option<f32>,
    pub top_p: Option<f32>,
    pub max_output_tokens: Option<i32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub response_schema: Option<Value>,
    /// Per-call deadline in seconds, enforced by the caller.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub max_duration_secs: Option<u64>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModelRequest {
    pub model: String,
    pub messages: Vec<ModelMessage>,
    #[serde(skip)]
    pub tools: Vec<ToolDeclaration>,
    #[serde(default)]
    pub tool_choice: ToolChoice,
    pub config: Option<GenerationConfig>,
}

impl ModelRequest {
    pub fn new(model: impl Into<String>, messages: Vec<ModelMessage>) -> Self {
        Self {
            model: model.into(),
            messages,
            tools: Vec::new(),
            tool_choice: ToolChoice::Auto,
            config: None,
        }
    }

    pub fn with_tools(mut self, tools: Vec<ToolDeclaration>) -> Self {
        self.tools = tools;
        self
    }

    pub fn with_tool_choice(mut self, choice: ToolChoice) -> Self {
        self.tool_choice = choice;
        self
    }

    pub fn with_response_schema(mut self, schema: Value) -> Self {
        self.config.get_or_insert_with(GenerationConfig::default).response_schema = Some(schema);
        self
    }

    pub fn with_config(mut self, config: GenerationConfig) -> Self {
        self.config = Some(config);
        self
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum FinishReason {
    Stop,
    ToolCalls,
    MaxTokens,
    Other,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UsageMetadata {
    pub prompt_token_count: i32,
    pub completion_token_count: i32,
    pub total_token_count: i32,
}

/// One streamed item. `partial == true` items carry text deltas; the final
/// item (`turn_complete == true`) carries the full accumulated content
/// including tool calls.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ModelResponse {
    pub content: Option<ModelMessage>,
    pub finish_reason: Option<FinishReason>,
    pub usage: Option<UsageMetadata>,
    pub partial: bool,
    pub turn_complete: bool,
    pub error_code: Option<String>,
    pub error_message: Option<String>,
}

impl ModelResponse {
    pub fn complete(content: ModelMessage, finish_reason: FinishReason) -> Self {
        Self {
            content: Some(content),
            finish_reason: Some(finish_reason),
            usage: None,
            partial: false,
            turn_complete: true,
            error_code: None,
            error_message: None,
        }
    }

    pub fn delta(text: impl Into<String>) -> Self {
        Self {
            content: Some(ModelMessage::text(ModelRole::Assistant, text)),
            finish_reason: None,
            usage: None,
            partial: true,
            turn_complete: false,
            error_code: None,
            error_message: None,
        }
    }

    pub fn text_content(&self) -> String {
        self.content.as_ref().map(|c| c.text_content()).unwrap_or_default()
    }
}
