use std::collections::BTreeMap;

use futures::StreamExt;
use serde_json::Value;

use quorum_core::errors::ProviderError;
use quorum_core::ids::ToolCallId;
use quorum_core::messages::{ContentPart, FinishReason, LlmResponse, ToolCallPart};
use quorum_core::provider::EventStream;
use quorum_core::stream::{BlockStart, StreamEvent};
use quorum_core::tokens::TokenUsage;

/// Live output from the aggregator, forwarded to the caller as it happens.
#[derive(Clone, Debug)]
pub enum AggregatedEvent {
    /// A new visible-text fragment. Carries only the fragment, never the
    /// cumulative buffer.
    TextFragment(String),
    ToolCallStarted { name: String },
}

struct ToolCallBuilder {
    id: String,
    name: String,
    arguments_json: String,
}

/// Per-call accumulator turning canonical incremental events into partial
/// notifications plus exactly one reconciled final response. Created and
/// discarded once per provider call.
pub struct ResponseAggregator {
    text: String,
    thinking: String,
    tools: BTreeMap<usize, ToolCallBuilder>,
    usage: TokenUsage,
    finish: Option<FinishReason>,
    saw_partial_text: bool,
    complete: Option<LlmResponse>,
}

impl Default for ResponseAggregator {
    fn default() -> Self {
        Self::new()
    }
}

impl ResponseAggregator {
    pub fn new() -> Self {
        Self {
            text: String::new(),
            thinking: String::new(),
            tools: BTreeMap::new(),
            usage: TokenUsage::default(),
            finish: None,
            saw_partial_text: false,
            complete: None,
        }
    }

    /// Fold one event into the accumulator. Returns notifications to emit
    /// synchronously, in order. An `Error` event fails the whole call.
    pub fn ingest(&mut self, event: StreamEvent) -> Result<Vec<AggregatedEvent>, ProviderError> {
        let mut out = Vec::new();

        match event {
            StreamEvent::Start { usage } => {
                if let Some(usage) = usage {
                    self.usage.merge(&usage);
                }
            }
            StreamEvent::BlockStart { index, block } => {
                if let BlockStart::ToolUse { id, name } = block {
                    out.push(AggregatedEvent::ToolCallStarted { name: name.clone() });
                    self.tools.insert(
                        index,
                        ToolCallBuilder {
                            id,
                            name,
                            arguments_json: String::new(),
                        },
                    );
                }
            }
            StreamEvent::TextDelta { delta } => {
                self.text.push_str(&delta);
                self.saw_partial_text = true;
                out.push(AggregatedEvent::TextFragment(delta));
            }
            StreamEvent::ThinkingDelta { delta } => {
                self.thinking.push_str(&delta);
            }
            StreamEvent::ToolArgsDelta { index, fragment } => {
                // Fragments for an index we never saw open are dropped, not fatal.
                if let Some(builder) = self.tools.get_mut(&index) {
                    builder.arguments_json.push_str(&fragment);
                }
            }
            StreamEvent::BlockStop { .. } => {}
            StreamEvent::Finish { reason, usage } => {
                if let Some(reason) = reason {
                    self.finish = Some(reason);
                }
                if let Some(usage) = usage {
                    self.usage.merge(&usage);
                }
            }
            StreamEvent::Stop => {}
            StreamEvent::Complete { response } => {
                if let Some(usage) = &response.usage {
                    self.usage.merge(usage);
                }
                if self.finish.is_none() {
                    self.finish = Some(response.finish_reason);
                }
                self.complete = Some(response);
            }
            StreamEvent::Error { error } => return Err(error),
        }

        Ok(out)
    }

    /// Build the one final response.
    ///
    /// Partial text wins: the non-incremental payload is used only when no
    /// partial text fragment was ever observed.
    pub fn finish(self) -> LlmResponse {
        let finish_reason = self.finish.unwrap_or(FinishReason::Stop);
        let usage = if self.usage.is_empty() { None } else { Some(self.usage.clone()) };

        if !self.saw_partial_text {
            if let Some(mut response) = self.complete {
                response.finish_reason = finish_reason;
                if response.usage.is_none() {
                    response.usage = usage;
                }
                return response;
            }
        }

        let mut parts = Vec::new();
        if !self.thinking.is_empty() {
            parts.push(ContentPart::Thinking { text: self.thinking });
        }
        if !self.text.is_empty() {
            parts.push(ContentPart::Text { text: self.text });
        }
        for (_, builder) in self.tools {
            parts.push(ContentPart::ToolCall(ToolCallPart {
                id: ToolCallId::from_raw(builder.id),
                name: builder.name,
                arguments: parse_arguments(&builder.arguments_json),
            }));
        }

        LlmResponse {
            parts,
            usage,
            finish_reason,
        }
    }
}

/// Parse accumulated tool-argument JSON. A parse failure yields an empty
/// object rather than failing the response.
fn parse_arguments(raw: &str) -> Value {
    if raw.is_empty() {
        return Value::Object(serde_json::Map::new());
    }
    serde_json::from_str(raw).unwrap_or_else(|_| Value::Object(serde_json::Map::new()))
}

/// Drive a whole event stream through one aggregator, invoking `on_event`
/// for each live notification as it is produced.
pub async fn drain(
    mut stream: EventStream,
    mut on_event: impl FnMut(AggregatedEvent),
) -> Result<LlmResponse, ProviderError> {
    let mut aggregator = ResponseAggregator::new();
    while let Some(event) = stream.next().await {
        for out in aggregator.ingest(event)? {
            on_event(out);
        }
    }
    Ok(aggregator.finish())
}
