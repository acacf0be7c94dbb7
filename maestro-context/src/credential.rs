use maestro_core::{
    CredentialReference, MaestroError, Repository, Result, Scope, TemplateMode, render_template,
};
use serde_json::Value;
use std::collections::HashMap;
use std::sync::Arc;

/// Resolves a named credential reference into HTTP headers for tool and
/// agent calls. Header material is never logged.
pub struct CredentialResolver {
    repository: Arc<dyn Repository>,
}

impl CredentialResolver {
    pub fn new(repository: Arc<dyn Repository>) -> Self {
        Self { repository }
    }

    /// Resolve `reference_id` into a header map, templating values from the
    /// resolved context.
    pub async fn resolve(
        &self,
        scope: &Scope,
        reference_id: &str,
        context: &HashMap<String, Value>,
    ) -> Result<HashMap<String, String>> {
        let reference = self
            .repository
            .get_credential_reference(scope, reference_id)
            .await?
            .ok_or_else(|| {
                MaestroError::CredentialUnavailable(format!(
                    "credential reference not found: {reference_id}"
                ))
            })?;

        match reference.credential_store_type.as_str() {
            "memory" => self.resolve_memory(&reference, context),
            "env" => self.resolve_env(&reference),
            other => Err(MaestroError::CredentialUnavailable(format!(
                "unsupported credential store type: {other}"
            ))),
        }
    }

    /// Inline headers, with `{context.key}` templating.
    fn resolve_memory(
        &self,
        reference: &CredentialReference,
        context: &HashMap<String, Value>,
    ) -> Result<HashMap<String, String>> {
        let headers = header_params(reference)?;
        let mut resolved = HashMap::new();
        for (name, template) in headers {
            let value = render_template(&template, context, TemplateMode::Lenient)?;
            if value.is_empty() && !template.is_empty() {
                return Err(MaestroError::CredentialUnavailable(format!(
                    "credential header {name} resolved empty for reference {}",
                    reference.id
                )));
            }
            resolved.insert(name, value);
        }
        Ok(resolved)
    }

    /// Headers whose values name process environment variables.
    fn resolve_env(&self, reference: &CredentialReference) -> Result<HashMap<String, String>> {
        let headers = header_params(reference)?;
        let mut resolved = HashMap::new();
        for (name, var) in headers {
            let value = std::env::var(&var).map_err(|_| {
                MaestroError::CredentialUnavailable(format!(
                    "environment variable {var} not set for reference {}",
                    reference.id
                ))
            })?;
            resolved.insert(name, value);
        }
        Ok(resolved)
    }
}

fn header_params(reference: &CredentialReference) -> Result<HashMap<String, String>> {
    let Some(headers) = reference.retrieval_params.get("headers") else {
        return Ok(HashMap::new());
    };
    let map = headers.as_object().ok_or_else(|| {
        MaestroError::CredentialUnavailable(format!(
            "retrieval_params.headers is not an object on reference {}",
            reference.id
        ))
    })?;
    Ok(map
        .iter()
        .filter_map(|(k, v)| v.as_str().map(|s| (k.clone(), s.to_string())))
        .collect())
}
