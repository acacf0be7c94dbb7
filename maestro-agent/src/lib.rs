//! # maestro-agent
//!
//! The two-phase generation engine.
//!
//! Phase 1 plans against the merged tool surface (streaming text or
//! forced tool calls); Phase 2 produces structured output over the
//! declared data components. A transfer result short-circuits the turn
//! before Phase 2. Conversation history is assembled per the sub-agent's
//! history config and appended as a synthetic user message.

pub mod engine;
pub mod history;
pub mod prompts;
pub mod schema;

pub use engine::{
    Agent, GenerateRequest, GenerationKind, GenerationOutcome, ModelFactory, ResolvedModels,
    resolve_model_settings,
};
pub use history::{
    HistoryScope, format_artifact_list, format_history, load_history, scoped_artifacts,
};
pub use prompts::{
    PlanningPromptInputs, StructuredPromptInputs, build_planning_prompt, build_structured_prompt,
};
pub use schema::structured_output_schema;
