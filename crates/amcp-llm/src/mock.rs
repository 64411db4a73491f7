//! In-memory mock provider used by integration tests and the compactor's
//! summary-strategy tests. Never makes a network call.

use crate::provider::{LlmError, LlmProvider, LlmResult, LlmStream};
use crate::types::{LlmRequest, StreamDelta};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;
use tokio_util::sync::CancellationToken;

/// A scripted response: either a plain text reply or a tool call.
#[derive(Clone, Debug)]
pub enum ScriptedTurn {
    Text(String),
    ToolCall { id: String, name: String, arguments: String },
}

/// Replays a fixed sequence of turns, one per `complete_stream` call, then
/// repeats the last turn forever. Grounded on the general shape of a fake
/// adapter used in place of a real network client during tests.
pub struct MockProvider {
    script: Vec<ScriptedTurn>,
    cursor: AtomicUsize,
    requests_seen: Mutex<Vec<LlmRequest>>,
}

impl MockProvider {
    pub fn new(script: Vec<ScriptedTurn>) -> Self {
        Self {
            script,
            cursor: AtomicUsize::new(0),
            requests_seen: Mutex::new(Vec::new()),
        }
    }

    pub fn text_once(reply: impl Into<String>) -> Self {
        Self::new(vec![ScriptedTurn::Text(reply.into())])
    }

    pub fn requests_seen(&self) -> Vec<LlmRequest> {
        self.requests_seen.lock().unwrap().clone()
    }
}

#[async_trait::async_trait]
impl LlmProvider for MockProvider {
    fn name(&self) -> &str {
        "mock"
    }

    fn models(&self) -> &[&str] {
        &["mock-model"]
    }

    async fn complete_stream(
        &self,
        request: LlmRequest,
        cancel: Option<CancellationToken>,
    ) -> LlmResult<LlmStream> {
        if let Some(token) = &cancel {
            if token.is_cancelled() {
                return Err(LlmError::Cancelled);
            }
        }
        self.requests_seen.lock().unwrap().push(request);

        let idx = self.cursor.fetch_add(1, Ordering::SeqCst);
        let turn = self
            .script
            .get(idx)
            .or_else(|| self.script.last())
            .cloned()
            .unwrap_or(ScriptedTurn::Text(String::new()));

        let deltas: Vec<LlmResult<StreamDelta>> = match turn {
            ScriptedTurn::Text(text) => vec![
                Ok(StreamDelta::Text(text)),
                Ok(StreamDelta::Done { stop_reason: Some("end_turn".into()), usage: None }),
            ],
            ScriptedTurn::ToolCall { id, name, arguments } => vec![
                Ok(StreamDelta::ToolCallStart { id: id.clone(), name }),
                Ok(StreamDelta::ToolCallDelta { id: id.clone(), arguments }),
                Ok(StreamDelta::ToolCallEnd { id }),
                Ok(StreamDelta::Done { stop_reason: Some("tool_use".into()), usage: None }),
            ],
        };

        Ok(Box::pin(tokio_stream::iter(deltas)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn replays_scripted_text() {
        let provider = MockProvider::text_once("hello");
        use futures::StreamExt;
        let mut stream = provider
            .complete_stream(LlmRequest::default(), None)
            .await
            .unwrap();
        let mut text = String::new();
        while let Some(delta) = stream.next().await {
            if let StreamDelta::Text(t) = delta.unwrap() {
                text.push_str(&t);
            }
        }
        assert_eq!(text, "hello");
    }

    #[tokio::test]
    async fn respects_cancellation_before_start() {
        let provider = MockProvider::text_once("hello");
        let token = CancellationToken::new();
        token.cancel();
        let result = provider.complete_stream(LlmRequest::default(), Some(token)).await;
        assert!(matches!(result, Err(LlmError::Cancelled)));
    }
}
