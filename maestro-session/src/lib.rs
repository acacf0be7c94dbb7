//! # maestro-session
//!
//! Per-turn session state:
//!
//! - [`ToolSessionManager`] - the turn's scratchpad mapping tool-call ids
//!   to recorded arguments and results, shared across every sub-agent in
//!   the turn
//! - [`AgentSessionManager`] / [`AgentSession`] - the per-turn event
//!   ledger, throttled status updates, artifact bookkeeping, and cleanup
//!
//! Session ids equal the turn's stream-request id. Sessions never span
//! user turns.

pub mod agent_session;
pub mod events;
pub mod tool_session;

pub use agent_session::{
    AgentSession, AgentSessionManager, CachedArtifact, CreateSessionRequest, MAX_PENDING_ARTIFACTS,
    StatusUpdateConfig, SummaryEmission, status_update_schema,
};
pub use events::{EventKind, SessionEvent};
pub use tool_session::{ToolCallRecord, ToolSessionData, ToolSessionManager};
