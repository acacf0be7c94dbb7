//! # maestro-model
//!
//! Language model abstraction for the Maestro runtime.
//!
//! The [`LanguageModel`] trait always returns a response stream; callers
//! that do not stream read it to completion and keep the final item. Two
//! providers ship here:
//!
//! - [`OpenAiCompatibleModel`] - chat-completions over any compatible
//!   gateway, with tool calls, JSON-schema response format, and SSE
//!   streaming
//! - [`MockModel`] - a scripted model for tests

pub mod mock;
pub mod openai_compatible;
pub mod retry;
pub mod types;

pub use mock::MockModel;
pub use openai_compatible::{OpenAiCompatibleConfig, OpenAiCompatibleModel};
pub use retry::{RetryConfig, execute_with_retry, is_retryable_model_error, is_retryable_status};
pub use types::{
    FinishReason, GenerationConfig, LanguageModel, ModelMessage, ModelPart, ModelRequest,
    ModelResponse, ModelResponseStream, ModelRole, ToolChoice, ToolDeclaration, UsageMetadata,
};
