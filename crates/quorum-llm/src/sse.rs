use std::collections::HashMap;

use serde::Deserialize;
use serde_json::Value;

use quorum_core::errors::ProviderError;
use quorum_core::messages::FinishReason;
use quorum_core::stream::{BlockStart, StreamEvent};
use quorum_core::tokens::TokenUsage;

/// State machine translating Anthropic SSE events into canonical stream
/// events. One parser instance lives for the duration of one call.
///
/// A single malformed line is skipped, never fatal; an explicit `error`
/// event terminates the stream with the provider message surfaced verbatim.
#[derive(Default)]
pub struct SseParser {
    block_kinds: HashMap<usize, &'static str>,
}

impl SseParser {
    pub fn new() -> Self {
        Self::default()
    }

    /// Translate a single SSE event into zero or more canonical events.
    pub fn parse_event(&mut self, event_type: &str, data: &str) -> Vec<StreamEvent> {
        let mut events = Vec::new();

        match event_type {
            "message_start" => {
                let usage = serde_json::from_str::<MessageStartEvent>(data)
                    .ok()
                    .and_then(|e| e.message.usage)
                    .map(|u| TokenUsage {
                        input_tokens: u.input_tokens.unwrap_or(0),
                        output_tokens: u.output_tokens.unwrap_or(0),
                    });
                events.push(StreamEvent::Start { usage });
            }

            "content_block_start" => {
                if let Ok(event) = serde_json::from_str::<ContentBlockStartEvent>(data) {
                    let kind = event.content_block.get("type").and_then(|t| t.as_str());
                    let block = match kind {
                        Some("text") => {
                            self.block_kinds.insert(event.index, "text");
                            Some(BlockStart::Text)
                        }
                        Some("thinking") => {
                            self.block_kinds.insert(event.index, "thinking");
                            Some(BlockStart::Thinking)
                        }
                        Some("tool_use") => {
                            self.block_kinds.insert(event.index, "tool_use");
                            let id = event
                                .content_block
                                .get("id")
                                .and_then(|v| v.as_str())
                                .unwrap_or("")
                                .to_string();
                            let name = event
                                .content_block
                                .get("name")
                                .and_then(|v| v.as_str())
                                .unwrap_or("")
                                .to_string();
                            Some(BlockStart::ToolUse { id, name })
                        }
                        _ => None,
                    };
                    if let Some(block) = block {
                        events.push(StreamEvent::BlockStart { index: event.index, block });
                    }
                }
            }

            "content_block_delta" => {
                if let Ok(event) = serde_json::from_str::<ContentBlockDeltaEvent>(data) {
                    match event.delta.get("type").and_then(|t| t.as_str()) {
                        Some("text_delta") => {
                            let text = event
                                .delta
                                .get("text")
                                .and_then(|t| t.as_str())
                                .unwrap_or("");
                            events.push(StreamEvent::TextDelta { delta: text.to_string() });
                        }
                        Some("thinking_delta") => {
                            let thinking = event
                                .delta
                                .get("thinking")
                                .and_then(|t| t.as_str())
                                .unwrap_or("");
                            events.push(StreamEvent::ThinkingDelta {
                                delta: thinking.to_string(),
                            });
                        }
                        Some("input_json_delta") => {
                            // Only forward fragments for an index that
                            // actually opened as a tool_use block.
                            if self.block_kinds.get(&event.index).copied() == Some("tool_use") {
                                let partial = event
                                    .delta
                                    .get("partial_json")
                                    .and_then(|t| t.as_str())
                                    .unwrap_or("");
                                events.push(StreamEvent::ToolArgsDelta {
                                    index: event.index,
                                    fragment: partial.to_string(),
                                });
                            }
                        }
                        // signature_delta and future delta kinds
                        _ => {}
                    }
                }
            }

            "content_block_stop" => {
                if let Ok(event) = serde_json::from_str::<ContentBlockStopEvent>(data) {
                    self.block_kinds.remove(&event.index);
                    events.push(StreamEvent::BlockStop { index: event.index });
                }
            }

            "message_delta" => {
                if let Ok(event) = serde_json::from_str::<MessageDeltaEvent>(data) {
                    let reason = event
                        .delta
                        .as_ref()
                        .and_then(|d| d.stop_reason.as_deref())
                        .filter(|r| !r.is_empty())
                        .map(map_stop_reason);
                    let usage = event.usage.map(|u| TokenUsage {
                        input_tokens: 0,
                        output_tokens: u.output_tokens.unwrap_or(0),
                    });
                    if reason.is_some() || usage.is_some() {
                        events.push(StreamEvent::Finish { reason, usage });
                    }
                }
            }

            "message_stop" => {
                events.push(StreamEvent::Stop);
            }

            "error" => {
                let error = match serde_json::from_str::<ErrorEvent>(data) {
                    Ok(event) => ProviderError::Api {
                        kind: event.error.error_type,
                        message: event.error.message,
                    },
                    Err(_) => ProviderError::Api {
                        kind: "unknown".into(),
                        message: data.to_string(),
                    },
                };
                events.push(StreamEvent::Error { error });
            }

            // ping and anything unrecognized
            _ => {}
        }

        events
    }
}

/// Map a wire stop reason to the canonical finish reason.
pub fn map_stop_reason(reason: &str) -> FinishReason {
    match reason {
        "end_turn" | "stop_sequence" | "tool_use" => FinishReason::Stop,
        "max_tokens" => FinishReason::MaxTokens,
        _ => FinishReason::Unspecified,
    }
}

/// Split raw SSE text into (event_type, data) pairs.
pub fn parse_sse_lines(raw: &str) -> Vec<(String, String)> {
    let mut events = Vec::new();
    let mut current_event = String::new();
    let mut current_data = String::new();

    for line in raw.lines() {
        if let Some(event) = line.strip_prefix("event: ") {
            current_event = event.trim().to_string();
        } else if let Some(data) = line.strip_prefix("data: ") {
            current_data = data.to_string();
        } else if line.is_empty() && !current_event.is_empty() {
            events.push((current_event.clone(), current_data.clone()));
            current_event.clear();
            current_data.clear();
        }
    }

    // Trailing event without a closing blank line
    if !current_event.is_empty() {
        events.push((current_event, current_data));
    }

    events
}

// --- Wire event payloads ---

#[derive(Deserialize)]
struct MessageStartEvent {
    message: MessageStartPayload,
}

#[derive(Deserialize)]
struct MessageStartPayload {
    usage: Option<UsagePayload>,
}

#[derive(Deserialize)]
struct UsagePayload {
    input_tokens: Option<u32>,
    output_tokens: Option<u32>,
}

#[derive(Deserialize)]
struct ContentBlockStartEvent {
    index: usize,
    content_block: Value,
}

#[derive(Deserialize)]
struct ContentBlockDeltaEvent {
    index: usize,
    delta: Value,
}

#[derive(Deserialize)]
struct ContentBlockStopEvent {
    index: usize,
}

#[derive(Deserialize)]
struct MessageDeltaEvent {
    delta: Option<MessageDeltaPayload>,
    usage: Option<UsagePayload>,
}

#[derive(Deserialize)]
struct MessageDeltaPayload {
    stop_reason: Option<String>,
}

#[derive(Deserialize)]
struct ErrorEvent {
    error: ErrorPayload,
}

#[derive(Deserialize)]
struct ErrorPayload {
    #[serde(rename = "type")]
    error_type: String,
    message: String,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn simple_text_stream() {
        let mut parser = SseParser::new();

        let events = parser.parse_event(
            "message_start",
            r#"{"type":"message_start","message":{"id":"msg_1","role":"assistant","usage":{"input_tokens":100,"output_tokens":0}}}"#,
        );
        assert_eq!(events.len(), 1);
        match &events[0] {
            StreamEvent::Start { usage: Some(u) } => assert_eq!(u.input_tokens, 100),
            other => panic!("expected Start, got {other:?}"),
        }

        let events = parser.parse_event(
            "content_block_start",
            r#"{"type":"content_block_start","index":0,"content_block":{"type":"text","text":""}}"#,
        );
        assert!(matches!(
            events[0],
            StreamEvent::BlockStart { index: 0, block: BlockStart::Text }
        ));

        let events = parser.parse_event(
            "content_block_delta",
            r#"{"type":"content_block_delta","index":0,"delta":{"type":"text_delta","text":"Hello"}}"#,
        );
        match &events[0] {
            StreamEvent::TextDelta { delta } => assert_eq!(delta, "Hello"),
            other => panic!("expected TextDelta, got {other:?}"),
        }

        let events = parser.parse_event(
            "content_block_stop",
            r#"{"type":"content_block_stop","index":0}"#,
        );
        assert!(matches!(events[0], StreamEvent::BlockStop { index: 0 }));

        let events = parser.parse_event(
            "message_delta",
            r#"{"type":"message_delta","delta":{"stop_reason":"end_turn"},"usage":{"output_tokens":25}}"#,
        );
        match &events[0] {
            StreamEvent::Finish { reason, usage } => {
                assert_eq!(*reason, Some(FinishReason::Stop));
                assert_eq!(usage.as_ref().unwrap().output_tokens, 25);
            }
            other => panic!("expected Finish, got {other:?}"),
        }

        let events = parser.parse_event("message_stop", r#"{"type":"message_stop"}"#);
        assert!(matches!(events[0], StreamEvent::Stop));
    }

    #[test]
    fn tool_use_stream_keyed_by_index() {
        let mut parser = SseParser::new();

        let events = parser.parse_event(
            "content_block_start",
            r#"{"type":"content_block_start","index":1,"content_block":{"type":"tool_use","id":"toolu_abc","name":"get_kline_data"}}"#,
        );
        match &events[0] {
            StreamEvent::BlockStart { index: 1, block: BlockStart::ToolUse { id, name } } => {
                assert_eq!(id, "toolu_abc");
                assert_eq!(name, "get_kline_data");
            }
            other => panic!("expected tool_use start, got {other:?}"),
        }

        let events = parser.parse_event(
            "content_block_delta",
            r#"{"type":"content_block_delta","index":1,"delta":{"type":"input_json_delta","partial_json":"{\"symbol\""}}"#,
        );
        match &events[0] {
            StreamEvent::ToolArgsDelta { index: 1, fragment } => {
                assert_eq!(fragment, "{\"symbol\"");
            }
            other => panic!("expected ToolArgsDelta, got {other:?}"),
        }
    }

    #[test]
    fn thinking_stream() {
        let mut parser = SseParser::new();

        let events = parser.parse_event(
            "content_block_start",
            r#"{"type":"content_block_start","index":0,"content_block":{"type":"thinking","thinking":""}}"#,
        );
        assert!(matches!(
            events[0],
            StreamEvent::BlockStart { block: BlockStart::Thinking, .. }
        ));

        let events = parser.parse_event(
            "content_block_delta",
            r#"{"type":"content_block_delta","index":0,"delta":{"type":"thinking_delta","thinking":"weighing the odds"}}"#,
        );
        match &events[0] {
            StreamEvent::ThinkingDelta { delta } => assert_eq!(delta, "weighing the odds"),
            other => panic!("expected ThinkingDelta, got {other:?}"),
        }

        // signature deltas are provider bookkeeping, not content
        let events = parser.parse_event(
            "content_block_delta",
            r#"{"type":"content_block_delta","index":0,"delta":{"type":"signature_delta","signature":"sig_xyz"}}"#,
        );
        assert!(events.is_empty());
    }

    #[test]
    fn error_event_surfaces_message_verbatim() {
        let mut parser = SseParser::new();
        let events = parser.parse_event(
            "error",
            r#"{"type":"error","error":{"type":"overloaded_error","message":"server busy"}}"#,
        );
        match &events[0] {
            StreamEvent::Error { error: ProviderError::Api { kind, message } } => {
                assert_eq!(kind, "overloaded_error");
                assert_eq!(message, "server busy");
            }
            other => panic!("expected Error, got {other:?}"),
        }
    }

    #[test]
    fn malformed_line_skipped_not_fatal() {
        let mut parser = SseParser::new();
        assert!(parser.parse_event("content_block_start", "not json at all").is_empty());
        assert!(parser.parse_event("message_delta", "{broken").is_empty());

        // parser still works afterwards
        let events = parser.parse_event("message_stop", "{}");
        assert!(matches!(events[0], StreamEvent::Stop));
    }

    #[test]
    fn unknown_event_types_ignored() {
        let mut parser = SseParser::new();
        assert!(parser.parse_event("ping", "{}").is_empty());
        assert!(parser.parse_event("some_future_event", "{}").is_empty());
    }

    #[test]
    fn stop_reason_mapping() {
        assert_eq!(map_stop_reason("end_turn"), FinishReason::Stop);
        assert_eq!(map_stop_reason("stop_sequence"), FinishReason::Stop);
        assert_eq!(map_stop_reason("tool_use"), FinishReason::Stop);
        assert_eq!(map_stop_reason("max_tokens"), FinishReason::MaxTokens);
        assert_eq!(map_stop_reason("anything_else"), FinishReason::Unspecified);
    }

    #[test]
    fn sse_line_framing() {
        let raw = "event: message_start\ndata: {\"hello\":true}\n\nevent: message_stop\ndata: {}\n\n";
        let events = parse_sse_lines(raw);
        assert_eq!(events.len(), 2);
        assert_eq!(events[0].0, "message_start");
        assert_eq!(events[0].1, "{\"hello\":true}");
        assert_eq!(events[1].0, "message_stop");
    }

    #[test]
    fn sse_trailing_event_without_blank_line() {
        let raw = "event: message_stop\ndata: {}";
        let events = parse_sse_lines(raw);
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].0, "message_stop");
    }
}
