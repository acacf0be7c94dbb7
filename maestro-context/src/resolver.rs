use crate::CredentialResolver;
use maestro_core::{
    ContextConfig, ContextDefinition, MaestroError, Repository, Result, Scope, TemplateMode,
    render_template,
};
use serde_json::{Value, json};
use std::collections::HashMap;
use std::sync::{Arc, RwLock};

/// Cache invalidation triggers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InvalidationEvent {
    /// A new turn started for the conversation.
    Invocation,
    /// The inbound request headers changed.
    HeadersChanged,
}

/// Inputs for one resolution pass.
#[derive(Debug, Clone, Default)]
pub struct ContextRequest {
    pub conversation_id: String,
    pub request_headers: HashMap<String, String>,
    /// Strict mode fails on unresolved references instead of tolerating them.
    pub strict: bool,
}

/// Evaluates a declarative [`ContextConfig`] into a `name → value` map,
/// cached per `(conversation, config)`.
pub struct ContextResolver {
    repository: Arc<dyn Repository>,
    credentials: Arc<CredentialResolver>,
    cache: RwLock<HashMap<String, HashMap<String, Value>>>,
}

impl ContextResolver {
    pub fn new(repository: Arc<dyn Repository>, credentials: Arc<CredentialResolver>) -> Self {
        Self { repository, credentials, cache: RwLock::new(HashMap::new()) }
    }

    /// Resolve `config_id` for a conversation. The result is augmented with
    /// a read-only `$env` map of the process environment.
    pub async fn resolve(
        &self,
        scope: &Scope,
        config_id: &str,
        request: &ContextRequest,
    ) -> Result<HashMap<String, Value>> {
        let cache_key = format!("{}:{}", request.conversation_id, config_id);
        if let Some(cached) = self.cache.read().unwrap().get(&cache_key) {
            return Ok(cached.clone());
        }

        let config = self
            .repository
            .get_context_config_by_id(scope, config_id)
            .await?
            .ok_or_else(|| MaestroError::Config(format!("context config not found: {config_id}")))?;

        let resolved = self.evaluate(scope, &config, request).await?;
        self.cache.write().unwrap().insert(cache_key, resolved.clone());
        Ok(resolved)
    }

    /// An empty context still carries `$env`.
    pub fn baseline() -> HashMap<String, Value> {
        let mut map = HashMap::new();
        map.insert("$env".to_string(), env_value());
        map
    }

    pub fn invalidate(&self, conversation_id: &str, config_id: &str, event: InvalidationEvent) {
        tracing::debug!(conversation_id, config_id, ?event, "invalidating context cache");
        self.cache.write().unwrap().remove(&format!("{conversation_id}:{config_id}"));
    }

    async fn evaluate(
        &self,
        scope: &Scope,
        config: &ContextConfig,
        request: &ContextRequest,
    ) -> Result<HashMap<String, Value>> {
        let mut resolved = Self::baseline();

        for (name, definition) in &config.definitions {
            match definition {
                ContextDefinition::Constant { value } => {
                    resolved.insert(name.clone(), value.clone());
                }
                ContextDefinition::RequestHeader { header } => {
                    let value = request
                        .request_headers
                        .iter()
                        .find(|(k, _)| k.eq_ignore_ascii_case(header))
                        .map(|(_, v)| v.clone());
                    match value {
                        Some(v) => {
                            resolved.insert(name.clone(), Value::String(v));
                        }
                        None if request.strict => {
                            return Err(MaestroError::BadRequest(format!(
                                "required request header missing: {header}"
                            )));
                        }
                        None => {
                            tracing::debug!(header, name, "request header absent, tolerated");
                        }
                    }
                }
                ContextDefinition::Credential { credential_reference_id } => {
                    match self
                        .credentials
                        .resolve(scope, credential_reference_id, &resolved)
                        .await
                    {
                        Ok(headers) => {
                            resolved.insert(name.clone(), json!(headers));
                        }
                        Err(e) if request.strict => return Err(e),
                        Err(e) => {
                            tracing::debug!(name, error = %e, "credential definition unresolved, tolerated");
                        }
                    }
                }
                ContextDefinition::Template { template } => {
                    let mode =
                        if request.strict { TemplateMode::Strict } else { TemplateMode::Lenient };
                    let value = render_template(template, &resolved, mode)?;
                    resolved.insert(name.clone(), Value::String(value));
                }
            }
        }

        Ok(resolved)
    }
}

fn env_value() -> Value {
    json!(std::env::vars().collect::<HashMap<String, String>>())
}
