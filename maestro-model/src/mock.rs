use crate::{LanguageModel, ModelRequest, ModelResponse, ModelResponseStream};
use maestro_core::{MaestroError, Result};
use async_trait::async_trait;
use std::sync::Mutex;

/// Scripted model for tests. Each `generate` call pops the next queued
/// turn; a turn is a sequence of responses yielded in order (deltas first,
/// the complete response last).
pub struct MockModel {
    name: String,
    turns: Mutex<Vec<Vec<ModelResponse>>>,
    /// Requests seen, for assertions.
    requests: Mutex<Vec<ModelRequest>>,
}

impl MockModel {
    pub fn new(name: impl Into<String>) -> Self {
        Self { name: name.into(), turns: Mutex::new(Vec::new()), requests: Mutex::new(Vec::new()) }
    }

    /// Queue a turn that yields a single complete response.
    pub fn with_response(self, response: ModelResponse) -> Self {
        self.turns.lock().unwrap().push(vec![response]);
        self
    }

    /// Queue a turn that yields several items (text deltas then final).
    pub fn with_stream(self, responses: Vec<ModelResponse>) -> Self {
        self.turns.lock().unwrap().push(responses);
        self
    }

    pub fn requests(&self) -> Vec<ModelRequest> {
        self.requests.lock().unwrap().clone()
    }

    pub fn calls(&self) -> usize {
        self.requests.lock().unwrap().len()
    }
}

#[async_trait]
impl LanguageModel for MockModel {
    fn name(&self) -> &str {
        &self.name
    }

    async fn generate(&self, req: ModelRequest, _stream: bool) -> Result<ModelResponseStream> {
        self.requests.lock().unwrap().push(req);

        let responses = {
            let mut turns = self.turns.lock().unwrap();
            if turns.is_empty() {
                return Err(MaestroError::Model("mock model has no scripted turns left".into()));
            }
            turns.remove(0)
        };

        let stream = async_stream::stream! {
            for response in responses {
                yield Ok(response);
            }
        };
        Ok(Box::pin(stream))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{FinishReason, ModelMessage, ModelRole};
    use futures::StreamExt;

    #[tokio::test]
    async fn test_mock_pops_turns_in_order() {
        let mock = MockModel::new("mock")
            .with_response(ModelResponse::complete(
                ModelMessage::text(ModelRole::Assistant, "first"),
                FinishReason::Stop,
            ))
            .with_response(ModelResponse::complete(
                ModelMessage::text(ModelRole::Assistant, "second"),
                FinishReason::Stop,
            ));

        let mut s = mock.generate(ModelRequest::new("m", vec![]), false).await.unwrap();
        assert_eq!(s.next().await.unwrap().unwrap().text_content(), "first");
        let mut s = mock.generate(ModelRequest::new("m", vec![]), false).await.unwrap();
        assert_eq!(s.next().await.unwrap().unwrap().text_content(), "second");
        assert_eq!(mock.calls(), 2);
    }

    #[tokio::test]
    async fn test_mock_exhausted_errors() {
        let mock = MockModel::new("mock");
        let err = mock.generate(ModelRequest::new("m", vec![]), false).await.unwrap_err();
        assert!(matches!(err, MaestroError::Model(_)));
    }

    #[tokio::test]
    async fn test_mock_stream_turn() {
        let mock = MockModel::new("mock").with_stream(vec![
            ModelResponse::delta("Hel"),
            ModelResponse::delta("lo"),
            ModelResponse::complete(
                ModelMessage::text(ModelRole::Assistant, "Hello"),
                FinishReason::Stop,
            ),
        ]);

        let items: Vec<_> =
            mock.generate(ModelRequest::new("m", vec![]), true).await.unwrap().collect().await;
        assert_eq!(items.len(), 3);
        assert!(items[0].as_ref().unwrap().partial);
        assert!(items[2].as_ref().unwrap().turn_complete);
    }
}
