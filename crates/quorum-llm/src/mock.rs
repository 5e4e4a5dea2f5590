use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use futures::stream;
use parking_lot::Mutex;

use quorum_core::errors::ProviderError;
use quorum_core::messages::{FinishReason, LlmResponse};
use quorum_core::provider::{EventStream, LlmRequest, ModelHandle, ProviderKind};
use quorum_core::stream::{BlockStart, StreamEvent};

/// Pre-programmed behavior for one generate call.
pub enum MockScript {
    /// Yield a sequence of canonical events.
    Events(Vec<StreamEvent>),
    /// Fail the generate call itself.
    Error(ProviderError),
    /// Wait, then run the inner script.
    Delayed(Duration, Box<MockScript>),
}

impl MockScript {
    /// A streamed text reply split into word-ish fragments.
    pub fn text(text: &str) -> Self {
        let mut events = vec![
            StreamEvent::Start { usage: None },
            StreamEvent::BlockStart { index: 0, block: BlockStart::Text },
        ];
        events.push(StreamEvent::TextDelta { delta: text.to_string() });
        events.push(StreamEvent::BlockStop { index: 0 });
        events.push(StreamEvent::Finish { reason: Some(FinishReason::Stop), usage: None });
        events.push(StreamEvent::Stop);
        Self::Events(events)
    }

    /// A reply that only carries a terminal non-partial payload.
    pub fn complete_only(text: &str) -> Self {
        Self::Events(vec![StreamEvent::Complete {
            response: LlmResponse::text(text),
        }])
    }

    /// A reply requesting one tool invocation, args streamed in fragments.
    pub fn tool_call(id: &str, name: &str, args_json: &str) -> Self {
        let mut events = vec![
            StreamEvent::Start { usage: None },
            StreamEvent::BlockStart {
                index: 0,
                block: BlockStart::ToolUse { id: id.into(), name: name.into() },
            },
        ];
        let mid = args_json.len() / 2;
        events.push(StreamEvent::ToolArgsDelta { index: 0, fragment: args_json[..mid].into() });
        events.push(StreamEvent::ToolArgsDelta { index: 0, fragment: args_json[mid..].into() });
        events.push(StreamEvent::BlockStop { index: 0 });
        events.push(StreamEvent::Stop);
        Self::Events(events)
    }

    /// A stream that fails with an error event mid-flight.
    pub fn stream_error(error: ProviderError) -> Self {
        Self::Events(vec![
            StreamEvent::Start { usage: None },
            StreamEvent::Error { error },
        ])
    }

    pub fn delayed(delay: Duration, inner: MockScript) -> Self {
        Self::Delayed(delay, Box::new(inner))
    }
}

/// Scripted model handle for deterministic tests. Scripts are consumed in
/// call order; every request is recorded for inspection.
pub struct MockModel {
    scripts: Mutex<VecDeque<MockScript>>,
    requests: Mutex<Vec<LlmRequest>>,
    calls: AtomicUsize,
    model: String,
}

impl MockModel {
    pub fn new(scripts: Vec<MockScript>) -> Self {
        Self {
            scripts: Mutex::new(scripts.into()),
            requests: Mutex::new(Vec::new()),
            calls: AtomicUsize::new(0),
            model: "mock-model".into(),
        }
    }

    pub fn call_count(&self) -> usize {
        self.calls.load(Ordering::Relaxed)
    }

    /// Requests received so far, in call order.
    pub fn requests(&self) -> Vec<LlmRequest> {
        self.requests.lock().clone()
    }
}

#[async_trait]
impl ModelHandle for MockModel {
    fn provider(&self) -> ProviderKind {
        ProviderKind::Anthropic
    }

    fn model(&self) -> &str {
        &self.model
    }

    async fn generate(
        &self,
        request: &LlmRequest,
        _streaming: bool,
    ) -> Result<EventStream, ProviderError> {
        self.calls.fetch_add(1, Ordering::Relaxed);
        self.requests.lock().push(request.clone());

        let script = self.scripts.lock().pop_front().ok_or_else(|| {
            ProviderError::UnsupportedModel("no scripted response left".into())
        })?;

        let mut current = script;
        loop {
            match current {
                MockScript::Events(events) => {
                    return Ok(Box::pin(stream::iter(events)));
                }
                MockScript::Error(e) => return Err(e),
                MockScript::Delayed(delay, inner) => {
                    tokio::time::sleep(delay).await;
                    current = *inner;
                }
            }
        }
    }
}
