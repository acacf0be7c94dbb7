use crate::{
    A2aTaskRequest, AgentCard, JsonRpcRequest, JsonRpcResponse, MessageSendParams, methods,
};
use maestro_core::{MaestroError, Result};
use futures::stream::Stream;
use serde_json::Value;
use std::collections::HashMap;
use std::pin::Pin;
use std::time::Duration;

pub type FrameStream = Pin<Box<dyn Stream<Item = Result<JsonRpcResponse>> + Send>>;

/// A2A client for same-process delegation (localhost), external agents,
/// and team peers. Headers carry the service token or resolved credentials.
#[derive(Clone)]
pub struct A2aClient {
    http_client: reqwest::Client,
    base_url: String,
    headers: HashMap<String, String>,
}

impl A2aClient {
    pub fn new(base_url: impl Into<String>) -> Self {
        Self {
            http_client: reqwest::Client::new(),
            base_url: base_url.into(),
            headers: HashMap::new(),
        }
    }

    pub fn with_header(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.insert(key.into(), value.into());
        self
    }

    pub fn with_headers(mut self, headers: HashMap<String, String>) -> Self {
        self.headers.extend(headers);
        self
    }

    pub fn with_bearer(self, token: impl std::fmt::Display) -> Self {
        self.with_header("Authorization", format!("Bearer {token}"))
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    /// Fetch the remote agent's discovery card.
    pub async fn resolve_agent_card(base_url: &str) -> Result<AgentCard> {
        let url = format!("{}/.well-known/agent.json", base_url.trim_end_matches('/'));
        let response = reqwest::Client::new()
            .get(&url)
            .timeout(Duration::from_secs(10))
            .send()
            .await
            .map_err(|e| MaestroError::Agent(format!("Failed to fetch agent card: {e}")))?;

        if !response.status().is_success() {
            return Err(MaestroError::Agent(format!(
                "Failed to fetch agent card: HTTP {}",
                response.status()
            )));
        }

        response
            .json()
            .await
            .map_err(|e| MaestroError::Agent(format!("Failed to parse agent card: {e}")))
    }

    async fn post_rpc(&self, url: &str, request: &JsonRpcRequest) -> Result<reqwest::Response> {
        let mut builder = self.http_client.post(url).json(request);
        for (key, value) in &self.headers {
            builder = builder.header(key, value);
        }
        let response = builder
            .send()
            .await
            .map_err(|e| MaestroError::Agent(format!("A2A request failed: {e}")))?;

        if !response.status().is_success() {
            return Err(MaestroError::Agent(format!(
                "A2A request failed: HTTP {}",
                response.status()
            )));
        }
        Ok(response)
    }

    /// Blocking message/send.
    pub async fn send_message(&self, params: MessageSendParams) -> Result<JsonRpcResponse> {
        let request = JsonRpcRequest::new(methods::MESSAGE_SEND, serde_json::to_value(&params)?);
        let response = self.post_rpc(&self.rpc_url(), &request).await?;
        response
            .json()
            .await
            .map_err(|e| MaestroError::Agent(format!("Failed to parse A2A response: {e}")))
    }

    /// Direct agent.invoke with a raw task (used for internal delegation).
    pub async fn invoke(&self, task: A2aTaskRequest) -> Result<JsonRpcResponse> {
        let request = JsonRpcRequest::new(methods::AGENT_INVOKE, serde_json::to_value(&task)?);
        let response = self.post_rpc(&self.rpc_url(), &request).await?;
        response
            .json()
            .await
            .map_err(|e| MaestroError::Agent(format!("Failed to parse A2A response: {e}")))
    }

    /// message/stream over SSE. Yields each JSON-RPC frame as it arrives.
    pub async fn send_streaming_message(&self, params: MessageSendParams) -> Result<FrameStream> {
        let request = JsonRpcRequest::new(methods::MESSAGE_STREAM, serde_json::to_value(&params)?);
        let response = self.post_rpc(&self.stream_url(), &request).await?;

        let stream = async_stream::stream! {
            use futures::StreamExt;

            let mut bytes_stream = response.bytes_stream();
            let mut buffer = String::new();

            while let Some(chunk_result) = bytes_stream.next().await {
                let chunk = match chunk_result {
                    Ok(c) => c,
                    Err(e) => {
                        yield Err(MaestroError::Agent(format!("Stream error: {e}")));
                        break;
                    }
                };

                buffer.push_str(&String::from_utf8_lossy(&chunk));

                // Process complete SSE events
                while let Some(event_end) = buffer.find("\n\n") {
                    let event_data = buffer[..event_end].to_string();
                    buffer.drain(..event_end + 2);

                    let Some(data) = parse_sse_data(&event_data) else { continue };
                    if data.is_empty() {
                        continue;
                    }

                    match serde_json::from_str::<JsonRpcResponse>(&data) {
                        Ok(frame) => yield Ok(frame),
                        Err(e) => {
                            tracing::debug!(error = %e, "failed to parse SSE frame");
                        }
                    }
                }
            }
        };

        Ok(Box::pin(stream))
    }

    fn rpc_url(&self) -> String {
        format!("{}/a2a", self.base_url.trim_end_matches('/'))
    }

    fn stream_url(&self) -> String {
        format!("{}/a2a/stream", self.base_url.trim_end_matches('/'))
    }
}

/// Parse the data field from an SSE event.
fn parse_sse_data(event: &str) -> Option<String> {
    for line in event.lines() {
        if let Some(data) = line.strip_prefix("data:") {
            return Some(data.trim().to_string());
        }
    }
    None
}

/// Extract a result `Value` from a JSON-RPC response or surface its error.
pub fn unwrap_rpc(response: JsonRpcResponse) -> Result<Value> {
    if let Some(error) = response.error {
        return Err(MaestroError::Agent(format!("RPC error {}: {}", error.code, error.message)));
    }
    response.result.ok_or_else(|| MaestroError::Agent("RPC response had no result".to_string()))
}
