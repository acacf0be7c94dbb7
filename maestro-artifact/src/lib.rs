//! # maestro-artifact
//!
//! Artifact extraction and stream parsing.
//!
//! Two surfaces feed one pipeline: inline `<artifact:create>` /
//! `<artifact:ref>` directives in model text, and structured
//! `ArtifactCreate_<Type>` entries from Phase-2 output. The pipeline
//! projects tool results through JMESPath selectors, validates the summary
//! against the component schema, streams a data part, and schedules
//! background enrichment that persists the artifact with a model-generated
//! name and description.
//!
//! [`StreamParser`] guarantees two invariants: no partial directive ever
//! reaches the wire, and parts are emitted in strict source order.

pub mod enrich;
pub mod extractor;
pub mod parser;
pub mod selector;

pub use enrich::{ArtifactEnricher, MAX_ARTIFACT_RETRIES, PendingArtifact};
pub use extractor::{
    ArtifactExtractor, DirectiveAttrs, is_artifact_create_entry, parse_directive_attrs,
};
pub use parser::{PartialObjectAdapter, StreamParser, StreamPart, find_safe_text_boundary};
pub use selector::{
    apply_base_selector, apply_selector, parse_selector_map, project_props, sanitize_selector,
    validate_against_schema,
};
