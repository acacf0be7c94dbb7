//! # maestro-context
//!
//! Credential and context resolution.
//!
//! - [`CredentialResolver`] turns a named credential reference into HTTP
//!   headers (never logged)
//! - [`ContextResolver`] evaluates a declarative context config per
//!   conversation into a `name → value` map with `$env`, cached until an
//!   [`InvalidationEvent`] clears it

pub mod credential;
pub mod resolver;

pub use credential::CredentialResolver;
pub use resolver::{ContextRequest, ContextResolver, InvalidationEvent};
