//! # maestro-core
//!
//! Core types and traits for the Maestro multi-agent runtime.
//!
//! ## Overview
//!
//! This crate provides the foundational pieces shared by every other
//! Maestro crate:
//!
//! - The persisted data model: [`Conversation`], [`MessageRecord`],
//!   [`TaskRecord`], [`ArtifactRecord`], [`SubAgentDefinition`] and its
//!   component/relation definitions
//! - [`Repository`] - the storage boundary (reads return `Ok(None)` on
//!   miss, writes are idempotent by primary key)
//! - [`MaestroError`] / [`Result`] - unified error handling
//! - [`render_template`] - the `{var}` placeholder renderer used for
//!   sub-agent prompts and context derivations

pub mod error;
pub mod repository;
pub mod template;
pub mod types;

pub use error::{MaestroError, Result};
pub use repository::{HistoryQuery, NewMessage, Repository};
pub use template::{TemplateMode, render_template};
pub use types::{
    AgentDefinition, AgentWithSubAgents, ArtifactComponentDefinition, ArtifactRecord,
    ContextConfig, ContextDefinition, Conversation, CredentialReference, DataComponentDefinition,
    FunctionDefinition, HistoryConfig, HistoryMode, MessageContent, MessageRecord, MessageRole,
    MessageType, MessageVisibility, ModelSettings, ModelSettingsMap, RelatedAgents, RelationTarget,
    RemoteToolDefinition, RemoteTransport, Scope, StatusComponent, StatusUpdateSettings, StopWhen,
    SubAgentDefinition, TaskRecord, TaskState,
};
