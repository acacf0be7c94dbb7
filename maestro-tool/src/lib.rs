//! # maestro-tool
//!
//! The tool surface for Maestro sub-agents.
//!
//! A [`ToolRegistry`] builds the merged ToolSet for one turn from four
//! sources, in order (later wins on name collision):
//!
//! 1. Remote MCP tool servers, with cached single-flight connections
//! 2. Sandboxed function tools behind a pluggable [`SandboxExecutor`]
//! 3. Relation tools: `transfer_to_*` / `delegate_to_*`
//! 4. Built-ins: `thinking_complete`, `get_reference_artifact`
//!
//! Every tool is wrapped in a [`ToolEnvelope`] that generates tool-call
//! ids, records session events and results, and propagates cancellation.

pub mod builtins;
pub mod function;
pub mod postprocess;
pub mod registry;
pub mod relations;
pub mod remote;
pub mod sanitize;
pub mod tool;
pub mod wrapper;

pub use builtins::{GetReferenceArtifactTool, ThinkingCompleteTool};
pub use function::{
    FunctionTool, NativeProcessExecutor, SandboxBudget, SandboxExecutor, SandboxedFunctionTool,
};
pub use postprocess::{parse_embedded_json, postprocess_remote_result, structure_hints};
pub use registry::{ToolRegistry, ToolSetRequest};
pub use relations::{DelegateConfig, DelegateTool, TransferTool};
pub use remote::{
    McpConnectionFactory, RemoteConnectionCache, RemoteConnectionFactory, RemoteTool,
    RemoteToolConnection, RemoteToolSpec, is_connection_dead_error, sanitize_schema,
};
pub use sanitize::sanitize_tool_name;
pub use tool::{Tool, ToolInvocation, ToolSet, is_internal_tool_name};
pub use wrapper::ToolEnvelope;
