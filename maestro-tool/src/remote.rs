//! Remote tool servers (MCP).
//!
//! Connections are cached per `(tenant, project, tool, credentialRef)` and
//! created under a per-key lock so concurrent turns never open duplicate
//! connections. Connections whose transport looks dead are evicted and
//! re-created on the next use.

use crate::postprocess::postprocess_remote_result;
use crate::{Tool, ToolInvocation};
use maestro_core::{MaestroError, RemoteToolDefinition, Result};
use async_trait::async_trait;
use serde_json::{Value, json};
use std::collections::HashMap;
use std::ops::Deref;
use std::sync::Arc;
use tokio::sync::Mutex;

/// Declared tool on a remote server.
#[derive(Debug, Clone)]
pub struct RemoteToolSpec {
    pub name: String,
    pub description: String,
    pub input_schema: Value,
}

/// One live connection to a remote tool server.
#[async_trait]
pub trait RemoteToolConnection: Send + Sync {
    async fn list_tools(&self) -> Result<Vec<RemoteToolSpec>>;
    /// Returns the raw result envelope `{ isError?, content | output }`.
    async fn call_tool(&self, name: &str, args: Value) -> Result<Value>;
}

/// Opens connections; injectable so tests can fake the transport.
#[async_trait]
pub trait RemoteConnectionFactory: Send + Sync {
    async fn connect(
        &self,
        definition: &RemoteToolDefinition,
        headers: &HashMap<String, String>,
    ) -> Result<Arc<dyn RemoteToolConnection>>;
}

/// Errors that indicate the underlying transport died and the connection
/// should be evicted from the cache.
pub fn is_connection_dead_error(error: &str) -> bool {
    let error = error.to_lowercase();
    error.contains("connection closed")
        || error.contains("connection reset")
        || error.contains("broken pipe")
        || error.contains("closed pipe")
        || error.contains("eof")
        || error.contains("session not found")
        || error.contains("transport error")
}

/// Sanitize a JSON schema for model compatibility: some providers reject
/// `$schema`, `$ref`, `definitions`, and `additionalProperties`.
pub fn sanitize_schema(value: &mut Value) {
    if let Value::Object(map) = value {
        map.remove("$schema");
        map.remove("definitions");
        map.remove("$ref");
        map.remove("additionalProperties");
        for (_, v) in map.iter_mut() {
            sanitize_schema(v);
        }
    } else if let Value::Array(arr) = value {
        for v in arr.iter_mut() {
            sanitize_schema(v);
        }
    }
}

/// rmcp-backed connection over streamable HTTP.
pub struct McpConnection {
    client: Mutex<rmcp::service::RunningService<rmcp::RoleClient, ()>>,
}

pub struct McpConnectionFactory;

#[async_trait]
impl RemoteConnectionFactory for McpConnectionFactory {
    async fn connect(
        &self,
        definition: &RemoteToolDefinition,
        headers: &HashMap<String, String>,
    ) -> Result<Arc<dyn RemoteToolConnection>> {
        use rmcp::ServiceExt;
        use rmcp::transport::streamable_http_client::{
            StreamableHttpClientTransport, StreamableHttpClientTransportConfig,
        };

        let mut config = StreamableHttpClientTransportConfig::with_uri(definition.server_url.as_str());

        // Bearer auth rides the transport config; any other resolved
        // headers go on the underlying HTTP client.
        let mut default_headers = reqwest::header::HeaderMap::new();
        for (name, value) in headers {
            if name.eq_ignore_ascii_case("authorization") {
                let token = value.strip_prefix("Bearer ").unwrap_or(value);
                config = config.auth_header(token.to_string());
                continue;
            }
            let header_name = reqwest::header::HeaderName::from_bytes(name.as_bytes())
                .map_err(|e| MaestroError::Tool(format!("invalid header name {name}: {e}")))?;
            let header_value = reqwest::header::HeaderValue::from_str(value)
                .map_err(|e| MaestroError::Tool(format!("invalid header value for {name}: {e}")))?;
            default_headers.insert(header_name, header_value);
        }

        let http_client = reqwest::Client::builder()
            .default_headers(default_headers)
            .build()
            .map_err(|e| MaestroError::Tool(format!("failed to build HTTP client: {e}")))?;

        let transport = StreamableHttpClientTransport::with_client(http_client, config);
        let client = ()
            .serve(transport)
            .await
            .map_err(|e| MaestroError::Tool(format!("failed to connect to tool server: {e}")))?;

        Ok(Arc::new(McpConnection { client: Mutex::new(client) }))
    }
}

#[async_trait]
impl RemoteToolConnection for McpConnection {
    async fn list_tools(&self) -> Result<Vec<RemoteToolSpec>> {
        let client = self.client.lock().await;
        let tools = client
            .list_all_tools()
            .await
            .map_err(|e| MaestroError::Tool(format!("failed to list remote tools: {e}")))?;

        Ok(tools
            .into_iter()
            .map(|tool| {
                let mut schema = Value::Object(tool.input_schema.as_ref().clone());
                sanitize_schema(&mut schema);
                RemoteToolSpec {
                    name: tool.name.to_string(),
                    description: tool.description.map(|d| d.to_string()).unwrap_or_default(),
                    input_schema: schema,
                }
            })
            .collect())
    }

    async fn call_tool(&self, name: &str, args: Value) -> Result<Value> {
        use rmcp::model::{CallToolRequestParam, RawContent};

        let client = self.client.lock().await;
        let arguments = match args {
            Value::Null => None,
            Value::Object(map) if map.is_empty() => None,
            Value::Object(map) => Some(map),
            _ => {
                return Err(MaestroError::Tool(
                    "tool arguments must be an object".to_string(),
                ));
            }
        };
        let mut request = CallToolRequestParam::new(name.to_string());
        if let Some(arguments) = arguments {
            request = request.with_arguments(arguments);
        }
        let result = client
            .call_tool(request)
            .await
            .map_err(|e| MaestroError::Tool(format!("remote tool '{name}' call failed: {e}")))?;

        if result.is_error.unwrap_or(false) {
            let mut message = format!("remote tool '{name}' returned an error");
            for content in &result.content {
                if let Some(text) = content.deref().as_text() {
                    message = format!("{message}: {}", text.text);
                    break;
                }
            }
            // Surface the error envelope; post-processing raises ToolFailed.
            return Ok(json!({ "isError": true, "content": [{ "type": "text", "text": message }] }));
        }

        if let Some(structured) = result.structured_content {
            return Ok(structured);
        }

        let mut text_parts: Vec<String> = Vec::new();
        for content in &result.content {
            if let RawContent::Text(text) = content.deref() {
                text_parts.push(text.text.clone());
            }
        }
        Ok(json!({ "output": text_parts.join("\n") }))
    }
}

/// Cache of live connections keyed by `(tenant, project, tool, credRef)`.
pub struct RemoteConnectionCache {
    factory: Arc<dyn RemoteConnectionFactory>,
    connections: Mutex<HashMap<String, Arc<dyn RemoteToolConnection>>>,
    /// Per-key creation locks so cold connects are single-flight.
    creation_locks: Mutex<HashMap<String, Arc<Mutex<()>>>>,
}

impl RemoteConnectionCache {
    pub fn new(factory: Arc<dyn RemoteConnectionFactory>) -> Self {
        Self {
            factory,
            connections: Mutex::new(HashMap::new()),
            creation_locks: Mutex::new(HashMap::new()),
        }
    }

    pub fn cache_key(
        tenant_id: &str,
        project_id: &str,
        tool_id: &str,
        credential_ref: Option<&str>,
    ) -> String {
        format!("{tenant_id}:{project_id}:{tool_id}:{}", credential_ref.unwrap_or("-"))
    }

    async fn creation_lock(&self, key: &str) -> Arc<Mutex<()>> {
        self.creation_locks
            .lock()
            .await
            .entry(key.to_string())
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone()
    }

    /// Get or open the connection for a key.
    pub async fn get_or_connect(
        &self,
        key: &str,
        definition: &RemoteToolDefinition,
        headers: &HashMap<String, String>,
    ) -> Result<Arc<dyn RemoteToolConnection>> {
        if let Some(connection) = self.connections.lock().await.get(key) {
            return Ok(connection.clone());
        }

        let lock = self.creation_lock(key).await;
        let _guard = lock.lock().await;

        // Another caller may have connected while we waited.
        if let Some(connection) = self.connections.lock().await.get(key) {
            return Ok(connection.clone());
        }

        tracing::info!(key, server = %definition.server_url, "opening remote tool connection");
        let connection = self.factory.connect(definition, headers).await?;
        self.connections.lock().await.insert(key.to_string(), connection.clone());
        Ok(connection)
    }

    pub async fn evict(&self, key: &str) {
        if self.connections.lock().await.remove(key).is_some() {
            tracing::warn!(key, "evicted dead remote tool connection");
        }
    }

    pub async fn len(&self) -> usize {
        self.connections.lock().await.len()
    }
}

/// One remote tool bound to a cached connection.
pub struct RemoteTool {
    spec: RemoteToolSpec,
    cache_key: String,
    definition: RemoteToolDefinition,
    headers: HashMap<String, String>,
    cache: Arc<RemoteConnectionCache>,
    structure_hints: bool,
}

impl RemoteTool {
    pub fn new(
        spec: RemoteToolSpec,
        cache_key: String,
        definition: RemoteToolDefinition,
        headers: HashMap<String, String>,
        cache: Arc<RemoteConnectionCache>,
        structure_hints: bool,
    ) -> Self {
        Self { spec, cache_key, definition, headers, cache, structure_hints }
    }
}

#[async_trait]
impl Tool for RemoteTool {
    fn name(&self) -> &str {
        &self.spec.name
    }

    fn description(&self) -> &str {
        &self.spec.description
    }

    fn parameters_schema(&self) -> Option<Value> {
        Some(self.spec.input_schema.clone())
    }

    async fn execute(&self, _ctx: &ToolInvocation, args: Value) -> Result<Value> {
        let connection =
            self.cache.get_or_connect(&self.cache_key, &self.definition, &self.headers).await?;

        let raw = match connection.call_tool(&self.spec.name, args).await {
            Ok(raw) => raw,
            Err(e) => {
                if is_connection_dead_error(&e.to_string()) {
                    self.cache.evict(&self.cache_key).await;
                }
                return Err(e);
            }
        };

        postprocess_remote_result(&self.spec.name, raw, self.structure_hints)
    }
}
