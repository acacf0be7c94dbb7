use crate::{Tool, ToolInvocation, is_internal_tool_name};
use maestro_core::{MaestroError, Result};
use maestro_session::{AgentSession, SessionEvent, ToolSessionData};
use async_trait::async_trait;
use serde_json::{Value, json};
use std::sync::Arc;

/// Lifecycle envelope around every tool in a ToolSet:
///
/// - generates a tool-call id when the model did not supply one
/// - records start/end events for user-visible tools
/// - records the result in the turn's tool session
/// - propagates cancellation from the turn's token
///
/// Failures are recorded in both sessions and surface as `Tool` errors so
/// the planning loop can feed them back to the model.
pub struct ToolEnvelope {
    inner: Arc<dyn Tool>,
    agent_session: Arc<AgentSession>,
    tool_session: Arc<ToolSessionData>,
    internal: bool,
}

impl ToolEnvelope {
    pub fn wrap(
        inner: Arc<dyn Tool>,
        agent_session: Arc<AgentSession>,
        tool_session: Arc<ToolSessionData>,
    ) -> Arc<dyn Tool> {
        let internal = inner.is_internal() || is_internal_tool_name(inner.name());
        Arc::new(Self { inner, agent_session, tool_session, internal })
    }
}

#[async_trait]
impl Tool for ToolEnvelope {
    fn name(&self) -> &str {
        self.inner.name()
    }

    fn description(&self) -> &str {
        self.inner.description()
    }

    fn parameters_schema(&self) -> Option<Value> {
        self.inner.parameters_schema()
    }

    fn is_internal(&self) -> bool {
        self.internal
    }

    async fn execute(&self, ctx: &ToolInvocation, args: Value) -> Result<Value> {
        let generated;
        let ctx = if ctx.tool_call_id.is_empty() {
            generated = ToolInvocation {
                tool_call_id: format!("call_{}", uuid::Uuid::new_v4()),
                session_id: ctx.session_id.clone(),
                cancellation: ctx.cancellation.clone(),
            };
            &generated
        } else {
            ctx
        };

        if !self.internal {
            self.agent_session.record_event(SessionEvent::tool_call(
                self.inner.name(),
                &ctx.tool_call_id,
                &args,
            ));
        }

        let execution = self.inner.execute(ctx, args.clone());
        let result = tokio::select! {
            _ = ctx.cancellation.cancelled() => Err(MaestroError::Cancelled),
            result = execution => result,
        };

        match result {
            Ok(value) => {
                self.tool_session
                    .record_result(&ctx.tool_call_id, self.inner.name(), args, value.clone())
                    .await;
                if !self.internal {
                    self.agent_session.record_event(SessionEvent::tool_result(
                        self.inner.name(),
                        &ctx.tool_call_id,
                        &value,
                    ));
                }
                Ok(value)
            }
            Err(MaestroError::Cancelled) => Err(MaestroError::Cancelled),
            Err(e) => {
                let message = e.to_string();
                self.tool_session
                    .record_result(
                        &ctx.tool_call_id,
                        self.inner.name(),
                        args,
                        json!({ "error": message }),
                    )
                    .await;
                self.agent_session.record_event(SessionEvent::error(&message));
                Err(MaestroError::Tool(message))
            }
        }
    }
}
