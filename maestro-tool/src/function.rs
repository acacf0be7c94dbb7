use crate::{Tool, ToolInvocation};
use maestro_core::{FunctionDefinition, MaestroError, Result};
use async_trait::async_trait;
use serde_json::Value;
use std::future::Future;
use std::pin::Pin;
use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::AsyncWriteExt;

type AsyncHandler = Box<
    dyn Fn(ToolInvocation, Value) -> Pin<Box<dyn Future<Output = Result<Value>> + Send>>
        + Send
        + Sync,
>;

/// Closure-backed tool for native Rust handlers.
pub struct FunctionTool {
    name: String,
    description: String,
    handler: AsyncHandler,
    parameters_schema: Option<Value>,
    internal: bool,
}

impl FunctionTool {
    pub fn new<F, Fut>(name: impl Into<String>, description: impl Into<String>, handler: F) -> Self
    where
        F: Fn(ToolInvocation, Value) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<Value>> + Send + 'static,
    {
        Self {
            name: name.into(),
            description: description.into(),
            handler: Box::new(move |ctx, args| Box::pin(handler(ctx, args))),
            parameters_schema: None,
            internal: false,
        }
    }

    pub fn with_parameters_schema(mut self, schema: Value) -> Self {
        self.parameters_schema = Some(schema);
        self
    }

    /// Derive the parameter schema from a typed argument struct.
    pub fn with_parameters_schema_for<T>(mut self) -> Self
    where
        T: schemars::JsonSchema,
    {
        self.parameters_schema = Some(generate_schema::<T>());
        self
    }

    pub fn internal(mut self, internal: bool) -> Self {
        self.internal = internal;
        self
    }
}

#[async_trait]
impl Tool for FunctionTool {
    fn name(&self) -> &str {
        &self.name
    }

    fn description(&self) -> &str {
        &self.description
    }

    fn parameters_schema(&self) -> Option<Value> {
        self.parameters_schema.clone()
    }

    fn is_internal(&self) -> bool {
        self.internal
    }

    async fn execute(&self, ctx: &ToolInvocation, args: Value) -> Result<Value> {
        (self.handler)(ctx.clone(), args).await
    }
}

fn generate_schema<T>() -> Value
where
    T: schemars::JsonSchema,
{
    let mut schema = schemars::schema_for!(T);
    schema.schema.metadata().title = None;
    serde_json::to_value(schema).unwrap_or(Value::Null)
}

/// Execution budget for one sandboxed run.
#[derive(Debug, Clone, Copy)]
pub struct SandboxBudget {
    pub timeout: Duration,
    pub vcpus: u32,
}

impl Default for SandboxBudget {
    fn default() -> Self {
        Self { timeout: Duration::from_secs(30), vcpus: 1 }
    }
}

/// Pluggable executor for user-supplied function code. The `native`
/// provider runs a node subprocess; remote providers can slot in behind
/// the same trait.
#[async_trait]
pub trait SandboxExecutor: Send + Sync {
    fn provider(&self) -> &str;
    async fn execute(&self, code: &str, args: &Value, budget: SandboxBudget) -> Result<Value>;
}

/// Runs function code in a local `node` subprocess. The user code must
/// evaluate to a function (`async (args) => …`); arguments arrive on
/// stdin as JSON and the resolved value is printed as JSON.
pub struct NativeProcessExecutor {
    node_binary: String,
}

impl NativeProcessExecutor {
    pub fn new() -> Self {
        Self { node_binary: "node".to_string() }
    }

    pub fn with_node_binary(mut self, binary: impl Into<String>) -> Self {
        self.node_binary = binary.into();
        self
    }
}

impl Default for NativeProcessExecutor {
    fn default() -> Self {
        Self::new()
    }
}

const NODE_HARNESS: &str = r#"
let input = '';
process.stdin.on('data', (chunk) => { input += chunk; });
process.stdin.on('end', async () => {
    try {
        const payload = JSON.parse(input);
        const fn = eval(payload.code);
        const result = await fn(payload.args);
        process.stdout.write(JSON.stringify({ ok: true, result: result === undefined ? null : result }));
    } catch (err) {
        process.stdout.write(JSON.stringify({ ok: false, error: String(err && err.message || err) }));
    }
});
"#;

#[async_trait]
impl SandboxExecutor for NativeProcessExecutor {
    fn provider(&self) -> &str {
        "native"
    }

    async fn execute(&self, code: &str, args: &Value, budget: SandboxBudget) -> Result<Value> {
        let mut child = tokio::process::Command::new(&self.node_binary)
            .arg("-e")
            .arg(NODE_HARNESS)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| MaestroError::Tool(format!("failed to spawn sandbox: {e}")))?;

        let payload = serde_json::to_vec(&serde_json::json!({ "code": code, "args": args }))?;
        if let Some(mut stdin) = child.stdin.take() {
            stdin
                .write_all(&payload)
                .await
                .map_err(|e| MaestroError::Tool(format!("sandbox stdin write failed: {e}")))?;
            drop(stdin);
        }

        let output = tokio::time::timeout(budget.timeout, child.wait_with_output())
            .await
            .map_err(|_| {
                MaestroError::Tool(format!(
                    "sandboxed function exceeded its {}ms budget",
                    budget.timeout.as_millis()
                ))
            })?
            .map_err(|e| MaestroError::Tool(format!("sandbox failed: {e}")))?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(MaestroError::Tool(format!("sandbox exited with error: {stderr}")));
        }

        let stdout = String::from_utf8_lossy(&output.stdout);
        let parsed: Value = serde_json::from_str(stdout.trim())
            .map_err(|e| MaestroError::Tool(format!("sandbox produced invalid JSON: {e}")))?;

        if parsed.get("ok").and_then(Value::as_bool).unwrap_or(false) {
            Ok(parsed.get("result").cloned().unwrap_or(Value::Null))
        } else {
            let message = parsed
                .get("error")
                .and_then(Value::as_str)
                .unwrap_or("sandboxed function failed");
            Err(MaestroError::Tool(message.to_string()))
        }
    }
}

/// A configured function tool executed through a [`SandboxExecutor`].
pub struct SandboxedFunctionTool {
    definition: FunctionDefinition,
    executor: Arc<dyn SandboxExecutor>,
}

impl SandboxedFunctionTool {
    pub fn new(definition: FunctionDefinition, executor: Arc<dyn SandboxExecutor>) -> Self {
        Self { definition, executor }
    }

    fn budget(&self) -> SandboxBudget {
        let defaults = SandboxBudget::default();
        SandboxBudget {
            timeout: self
                .definition
                .timeout_ms
                .map(Duration::from_millis)
                .unwrap_or(defaults.timeout),
            vcpus: self.definition.vcpus.unwrap_or(defaults.vcpus),
        }
    }
}

#[async_trait]
impl Tool for SandboxedFunctionTool {
    fn name(&self) -> &str {
        &self.definition.name
    }

    fn description(&self) -> &str {
        &self.definition.description
    }

    fn parameters_schema(&self) -> Option<Value> {
        Some(self.definition.input_schema.clone())
    }

    async fn execute(&self, _ctx: &ToolInvocation, args: Value) -> Result<Value> {
        self.executor.execute(&self.definition.execute_code, &args, self.budget()).await
    }
}
