//! OpenAI-compatible chat-completions provider.
//!
//! Speaks the `/chat/completions` wire format directly over reqwest so any
//! compatible gateway (OpenAI, Azure, local inference servers) can back an
//! agent. Tool calls, JSON-schema response format, and SSE streaming are
//! supported.

use crate::retry::{RetryConfig, execute_with_retry};
use crate::{
    FinishReason, LanguageModel, ModelMessage, ModelPart, ModelRequest, ModelResponse,
    ModelResponseStream, ModelRole, ToolChoice, UsageMetadata,
};
use maestro_core::{MaestroError, Result};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use std::collections::HashMap;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OpenAiCompatibleConfig {
    /// Provider display name used in error messages.
    pub provider_name: String,
    pub api_key: String,
    pub model: String,
    /// Base URL up to but excluding `/chat/completions`.
    pub base_url: String,
    /// Extra headers sent on every request.
    #[serde(default)]
    pub headers: HashMap<String, String>,
}

impl OpenAiCompatibleConfig {
    pub fn new(api_key: impl Into<String>, model: impl Into<String>) -> Self {
        Self {
            provider_name: "openai-compatible".to_string(),
            api_key: api_key.into(),
            model: model.into(),
            base_url: "https://api.openai.com/v1".to_string(),
            headers: HashMap::new(),
        }
    }

    pub fn with_base_url(mut self, base_url: impl Into<String>) -> Self {
        self.base_url = base_url.into();
        self
    }

    pub fn with_provider_name(mut self, name: impl Into<String>) -> Self {
        self.provider_name = name.into();
        self
    }

    pub fn with_header(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.insert(key.into(), value.into());
        self
    }
}

pub struct OpenAiCompatibleModel {
    client: reqwest::Client,
    config: OpenAiCompatibleConfig,
    retry_config: RetryConfig,
}

impl OpenAiCompatibleModel {
    pub fn new(config: OpenAiCompatibleConfig) -> Self {
        Self { client: reqwest::Client::new(), config, retry_config: RetryConfig::default() }
    }

    #[must_use]
    pub fn with_retry_config(mut self, retry_config: RetryConfig) -> Self {
        self.retry_config = retry_config;
        self
    }

    fn endpoint(&self) -> String {
        format!("{}/chat/completions", self.config.base_url.trim_end_matches('/'))
    }

    fn build_body(&self, req: &ModelRequest, stream: bool) -> Value {
        let messages: Vec<Value> = req.messages.iter().flat_map(wire_messages).collect();

        let mut body = json!({
            "model": req.model,
            "messages": messages,
            "stream": stream,
        });

        if !req.tools.is_empty() {
            body["tools"] = Value::Array(
                req.tools
                    .iter()
                    .map(|t| {
                        json!({
                            "type": "function",
                            "function": {
                                "name": t.name,
                                "description": t.description,
                                "parameters": t.parameters,
                            }
                        })
                    })
                    .collect(),
            );
            body["tool_choice"] = match req.tool_choice {
                ToolChoice::Auto => json!("auto"),
                ToolChoice::Required => json!("required"),
                ToolChoice::None => json!("none"),
            };
        }

        if let Some(config) = &req.config {
            if let Some(t) = config.temperature {
                body["temperature"] = json!(t);
            }
            if let Some(p) = config.top_p {
                body["top_p"] = json!(p);
            }
            if let Some(max) = config.max_output_tokens {
                body["max_tokens"] = json!(max);
            }
            if let Some(schema) = &config.response_schema {
                body["response_format"] = json!({
                    "type": "json_schema",
                    "json_schema": { "name": "response", "schema": schema, "strict": false },
                });
            }
        }

        body
    }

    fn request_builder(&self, body: &Value) -> reqwest::RequestBuilder {
        let mut builder = self
            .client
            .post(self.endpoint())
            .bearer_auth(&self.config.api_key)
            .header("Content-Type", "application/json");
        for (key, value) in &self.config.headers {
            builder = builder.header(key, value);
        }
        builder.json(body)
    }

    async fn generate_blocking(&self, req: &ModelRequest) -> Result<ModelResponse> {
        let body = self.build_body(req, false);
        let provider = self.config.provider_name.clone();

        let value = execute_with_retry(&self.retry_config, || {
            let builder = self.request_builder(&body);
            let provider = provider.clone();
            async move {
                let response = builder
                    .send()
                    .await
                    .map_err(|e| MaestroError::Model(format!("{provider}: request failed: {e}")))?;

                let status = response.status();
                if !status.is_success() {
                    let text = response.text().await.unwrap_or_default();
                    return Err(MaestroError::Model(format!(
                        "{provider}: HTTP {status}: {text}"
                    )));
                }

                response
                    .json::<Value>()
                    .await
                    .map_err(|e| MaestroError::Model(format!("{provider}: invalid response: {e}")))
            }
        })
        .await?;

        parse_completion(&value, &self.config.provider_name)
    }
}

#[async_trait]
impl LanguageModel for OpenAiCompatibleModel {
    fn name(&self) -> &str {
        &self.config.model
    }

    async fn generate(&self, req: ModelRequest, stream: bool) -> Result<ModelResponseStream> {
        if !stream {
            let response = self.generate_blocking(&req).await?;
            let s = async_stream::stream! { yield Ok(response); };
            return Ok(Box::pin(s));
        }

        let body = self.build_body(&req, true);
        let provider = self.config.provider_name.clone();
        let response = self
            .request_builder(&body)
            .send()
            .await
            .map_err(|e| MaestroError::Model(format!("{provider}: request failed: {e}")))?;

        let status = response.status();
        if !status.is_success() {
            let text = response.text().await.unwrap_or_default();
            return Err(MaestroError::Model(format!("{provider}: HTTP {status}: {text}")));
        }

        let s = async_stream::stream! {
            use futures::StreamExt;

            let mut bytes_stream = response.bytes_stream();
            let mut buffer = String::new();
            let mut accumulator = StreamAccumulator::default();

            'outer: while let Some(chunk_result) = bytes_stream.next().await {
                let chunk = match chunk_result {
                    Ok(c) => c,
                    Err(e) => {
                        yield Err(MaestroError::Model(format!("{provider}: stream error: {e}")));
                        return;
                    }
                };

                buffer.push_str(&String::from_utf8_lossy(&chunk));

                while let Some(event_end) = buffer.find("\n\n") {
                    let event = buffer[..event_end].to_string();
                    buffer.drain(..event_end + 2);

                    for line in event.lines() {
                        let Some(data) = line.strip_prefix("data:") else { continue };
                        let data = data.trim();
                        if data == "[DONE]" {
                            break 'outer;
                        }
                        match serde_json::from_str::<Value>(data) {
                            Ok(frame) => {
                                if let Some(delta_text) = accumulator.absorb(&frame) {
                                    yield Ok(ModelResponse::delta(delta_text));
                                }
                            }
                            Err(e) => {
                                tracing::debug!(error = %e, "skipping unparseable SSE frame");
                            }
                        }
                    }
                }
            }

            yield Ok(accumulator.finish());
        };

        Ok(Box::pin(s))
    }
}

/// Accumulates streamed chat-completions deltas into the final response.
#[derive(Default)]
struct StreamAccumulator {
    text: String,
    // index → (id, name, arguments json fragments)
    tool_calls: Vec<(String, String, String)>,
    finish_reason: Option<FinishReason>,
    usage: Option<UsageMetadata>,
}

impl StreamAccumulator {
    /// Absorb one frame; returns the text delta if the frame carried one.
    fn absorb(&mut self, frame: &Value) -> Option<String> {
        if let Some(usage) = frame.get("usage").filter(|u| !u.is_null()) {
            self.usage = parse_usage(usage);
        }

        let choice = frame.get("choices")?.get(0)?;

        if let Some(reason) = choice.get("finish_reason").and_then(Value::as_str) {
            self.finish_reason = Some(map_finish_reason(reason));
        }

        let delta = choice.get("delta")?;

        if let Some(calls) = delta.get("tool_calls").and_then(Value::as_array) {
            for call in calls {
                let index = call.get("index").and_then(Value::as_u64).unwrap_or(0) as usize;
                while self.tool_calls.len() <= index {
                    self.tool_calls.push((String::new(), String::new(), String::new()));
                }
                let entry = &mut self.tool_calls[index];
                if let Some(id) = call.get("id").and_then(Value::as_str) {
                    entry.0.push_str(id);
                }
                if let Some(function) = call.get("function") {
                    if let Some(name) = function.get("name").and_then(Value::as_str) {
                        entry.1.push_str(name);
                    }
                    if let Some(args) = function.get("arguments").and_then(Value::as_str) {
                        entry.2.push_str(args);
                    }
                }
            }
        }

        let text = delta.get("content").and_then(Value::as_str)?;
        if text.is_empty() {
            return None;
        }
        self.text.push_str(text);
        Some(text.to_string())
    }

    fn finish(self) -> ModelResponse {
        let mut message = ModelMessage::new(ModelRole::Assistant);
        if !self.text.is_empty() {
            message.parts.push(ModelPart::Text { text: self.text });
        }
        for (id, name, args) in self.tool_calls {
            let args = serde_json::from_str(&args).unwrap_or(Value::String(args));
            message.parts.push(ModelPart::ToolCall { id, name, args });
        }

        let finish_reason = self.finish_reason.unwrap_or(FinishReason::Stop);
        let mut response = ModelResponse::complete(message, finish_reason);
        response.usage = self.usage;
        response
    }
}

/// Expand one abstract message into wire messages; tool results become
/// standalone `role: tool` entries.
fn wire_messages(message: &ModelMessage) -> Vec<Value> {
    let mut out = Vec::new();

    match message.role {
        ModelRole::Tool => {
            for part in &message.parts {
                if let ModelPart::ToolResult { id, result, .. } = part {
                    out.push(json!({
                        "role": "tool",
                        "tool_call_id": id,
                        "content": stringify(result),
                    }));
                }
            }
        }
        ModelRole::Assistant => {
            let text = message.text_content();
            let tool_calls: Vec<Value> = message
                .parts
                .iter()
                .filter_map(|p| match p {
                    ModelPart::ToolCall { id, name, args } => Some(json!({
                        "id": id,
                        "type": "function",
                        "function": { "name": name, "arguments": stringify(args) },
                    })),
                    _ => None,
                })
                .collect();

            let mut entry = json!({ "role": "assistant" });
            entry["content"] = if text.is_empty() { Value::Null } else { json!(text) };
            if !tool_calls.is_empty() {
                entry["tool_calls"] = Value::Array(tool_calls);
            }
            out.push(entry);
        }
        ModelRole::System => {
            out.push(json!({ "role": "system", "content": message.text_content() }));
        }
        ModelRole::User => {
            out.push(json!({ "role": "user", "content": message.text_content() }));
        }
    }

    out
}

fn stringify(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

fn map_finish_reason(reason: &str) -> FinishReason {
    match reason {
        "stop" => FinishReason::Stop,
        "tool_calls" | "function_call" => FinishReason::ToolCalls,
        "length" => FinishReason::MaxTokens,
        _ => FinishReason::Other,
    }
}

fn parse_usage(usage: &Value) -> Option<UsageMetadata> {
    Some(UsageMetadata {
        prompt_token_count: usage.get("prompt_tokens")?.as_i64()? as i32,
        completion_token_count: usage.get("completion_tokens").and_then(Value::as_i64).unwrap_or(0)
            as i32,
        total_token_count: usage.get("total_tokens").and_then(Value::as_i64).unwrap_or(0) as i32,
    })
}

fn parse_completion(value: &Value, provider: &str) -> Result<ModelResponse> {
    let choice = value
        .get("choices")
        .and_then(Value::as_array)
        .and_then(|c| c.first())
        .ok_or_else(|| MaestroError::Model(format!("{provider}: response has no choices")))?;

    let wire_message = choice
        .get("message")
        .ok_or_else(|| MaestroError::Model(format!("{provider}: choice has no message")))?;

    let mut message = ModelMessage::new(ModelRole::Assistant);
    if let Some(text) = wire_message.get("content").and_then(Value::as_str) {
        if !text.is_empty() {
            message.parts.push(ModelPart::Text { text: text.to_string() });
        }
    }
    if let Some(calls) = wire_message.get("tool_calls").and_then(Value::as_array) {
        for call in calls {
            let id = call.get("id").and_then(Value::as_str).unwrap_or_default().to_string();
            let function = call.get("function").cloned().unwrap_or_default();
            let name =
                function.get("name").and_then(Value::as_str).unwrap_or_default().to_string();
            let args_raw = function.get("arguments").and_then(Value::as_str).unwrap_or("{}");
            let args = serde_json::from_str(args_raw)
                .unwrap_or(Value::String(args_raw.to_string()));
            message.parts.push(ModelPart::ToolCall { id, name, args });
        }
    }

    let finish_reason = choice
        .get("finish_reason")
        .and_then(Value::as_str)
        .map(map_finish_reason)
        .unwrap_or(FinishReason::Stop);

    let mut response = ModelResponse::complete(message, finish_reason);
    if let Some(usage) = value.get("usage") {
        response.usage = parse_usage(usage);
    }
    Ok(response)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ToolDeclaration;

    #[test]
    fn test_build_body_with_tools() {
        let model = OpenAiCompatibleModel::new(OpenAiCompatibleConfig::new("key", "gpt-test"));
        let req = ModelRequest::new("gpt-test", vec![ModelMessage::text(ModelRole::User, "hi")])
            .with_tools(vec![ToolDeclaration {
                name: "search".into(),
                description: "Search things".into(),
                parameters: json!({"type": "object"}),
            }])
            .with_tool_choice(ToolChoice::Required);

        let body = model.build_body(&req, false);
        assert_eq!(body["tool_choice"], json!("required"));
        assert_eq!(body["tools"][0]["function"]["name"], json!("search"));
        assert_eq!(body["messages"][0]["role"], json!("user"));
    }

    #[test]
    fn test_wire_messages_tool_result() {
        let msg = ModelMessage::new(ModelRole::Tool).with_part(ModelPart::ToolResult {
            id: "call-1".into(),
            name: "search".into(),
            result: json!({"items": []}),
        });
        let wire = wire_messages(&msg);
        assert_eq!(wire[0]["role"], json!("tool"));
        assert_eq!(wire[0]["tool_call_id"], json!("call-1"));
    }

    #[test]
    fn test_parse_completion_with_tool_calls() {
        let value = json!({
            "choices": [{
                "message": {
                    "content": null,
                    "tool_calls": [{
                        "id": "call-1",
                        "type": "function",
                        "function": { "name": "search", "arguments": "{\"query\":\"k\"}" }
                    }]
                },
                "finish_reason": "tool_calls"
            }],
            "usage": { "prompt_tokens": 10, "completion_tokens": 5, "total_tokens": 15 }
        });

        let response = parse_completion(&value, "test").unwrap();
        assert_eq!(response.finish_reason, Some(FinishReason::ToolCalls));
        let content = response.content.unwrap();
        let calls = content.tool_calls();
        assert_eq!(calls[0].1, "search");
        assert_eq!(calls[0].2, &json!({"query": "k"}));
    }

    #[test]
    fn test_stream_accumulator() {
        let mut acc = StreamAccumulator::default();
        let delta = acc.absorb(&json!({
            "choices": [{ "delta": { "content": "Hel" } }]
        }));
        assert_eq!(delta, Some("Hel".to_string()));
        acc.absorb(&json!({
            "choices": [{ "delta": { "content": "lo" }, "finish_reason": "stop" }]
        }));

        let final_response = acc.finish();
        assert_eq!(final_response.text_content(), "Hello");
        assert!(final_response.turn_complete);
    }

    #[test]
    fn test_stream_accumulator_tool_call_fragments() {
        let mut acc = StreamAccumulator::default();
        acc.absorb(&json!({
            "choices": [{ "delta": { "tool_calls": [
                { "index": 0, "id": "call-1", "function": { "name": "search", "arguments": "{\"qu" } }
            ]}}]
        }));
        acc.absorb(&json!({
            "choices": [{ "delta": { "tool_calls": [
                { "index": 0, "function": { "arguments": "ery\":\"k\"}" } }
            ]}, "finish_reason": "tool_calls" }]
        }));

        let final_response = acc.finish();
        let content = final_response.content.unwrap();
        let calls = content.tool_calls();
        assert_eq!(calls.len(), 1);
        assert_eq!(calls[0].2, &json!({"query": "k"}));
    }
}
