//! # maestro-a2a
//!
//! Agent-to-Agent JSON-RPC protocol: envelope, wire types, transfer
//! envelope helpers, the discovery card, and the HTTP/SSE client used for
//! same-process delegation, external agents, and team peers.

pub mod client;
pub mod jsonrpc;
pub mod types;

pub use client::{A2aClient, FrameStream, unwrap_rpc};
pub use jsonrpc::{JsonRpcError, JsonRpcRequest, JsonRpcResponse, methods};
pub use types::{
    A2aArtifact, A2aMessage, A2aTask, A2aTaskContext, A2aTaskRequest, A2aTaskResult,
    AgentCapabilities, AgentCard, AgentProvider, AgentSkill, MessageSendConfiguration,
    MessageSendParams, Part, Role, TaskQueryParams, TaskResubscribeParams, TaskState, TaskStatus,
    TransferData, extract_transfer, transfer_task,
};
