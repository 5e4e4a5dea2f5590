use std::collections::HashSet;
use std::pin::Pin;

use async_trait::async_trait;
use futures::Stream;
use reqwest::Client;
use secrecy::{ExposeSecret, SecretString};
use serde::Deserialize;
use serde_json::{json, Value};
use tracing::instrument;

use quorum_core::config::ProviderConfig;
use quorum_core::errors::ProviderError;
use quorum_core::ids::ToolCallId;
use quorum_core::messages::{ContentPart, FinishReason, LlmResponse, Message, Role, ToolCallPart};
use quorum_core::provider::{EventStream, LlmRequest, ModelHandle, ProviderKind};
use quorum_core::stream::{BlockStart, StreamEvent};
use quorum_core::tokens::TokenUsage;

pub const DEFAULT_BASE_URL: &str = "https://api.openai.com/v1";

/// OpenAI-compatible chat-completions adapter. Also covers the many
/// third-party endpoints speaking the same protocol.
#[derive(Debug)]
pub struct OpenAiModel {
    client: Client,
    base_url: String,
    api_key: SecretString,
    model: String,
    max_tokens: Option<u32>,
}

impl OpenAiModel {
    pub fn new(config: &ProviderConfig, client: Client) -> Result<Self, ProviderError> {
        if config.api_key.expose_secret().is_empty() {
            return Err(ProviderError::MissingCredentials(
                "openai api key is empty".into(),
            ));
        }
        if config.model.is_empty() {
            return Err(ProviderError::UnsupportedModel("model name is empty".into()));
        }

        Ok(Self {
            client,
            base_url: normalize_base_url(config.base_url.as_deref()),
            api_key: config.api_key.clone(),
            model: config.model.clone(),
            max_tokens: config.max_tokens,
        })
    }

    fn build_body(&self, request: &LlmRequest, stream: bool) -> Value {
        let mut body = json!({
            "model": self.model,
            "messages": wire_messages(&request.system, &request.messages),
        });

        if stream {
            body["stream"] = json!(true);
            body["stream_options"] = json!({"include_usage": true});
        }
        if let Some(max) = request.options.max_tokens.or(self.max_tokens) {
            body["max_tokens"] = json!(max);
        }
        if let Some(temp) = request.options.temperature {
            body["temperature"] = json!(temp);
        }
        if let Some(top_p) = request.options.top_p {
            body["top_p"] = json!(top_p);
        }
        if !request.options.stop_sequences.is_empty() {
            body["stop"] = json!(request.options.stop_sequences);
        }
        if !request.tools.is_empty() {
            let tools: Vec<Value> = request
                .tools
                .iter()
                .map(|t| {
                    json!({
                        "type": "function",
                        "function": {
                            "name": t.name,
                            "description": t.description,
                            "parameters": t.input_schema,
                        }
                    })
                })
                .collect();
            body["tools"] = json!(tools);
        }

        body
    }
}

#[async_trait]
impl ModelHandle for OpenAiModel {
    fn provider(&self) -> ProviderKind {
        ProviderKind::OpenAI
    }

    fn model(&self) -> &str {
        &self.model
    }

    #[instrument(skip(self, request), fields(model = %self.model))]
    async fn generate(
        &self,
        request: &LlmRequest,
        streaming: bool,
    ) -> Result<EventStream, ProviderError> {
        let body = self.build_body(request, streaming);

        let resp = self
            .client
            .post(format!("{}/chat/completions", self.base_url))
            .bearer_auth(self.api_key.expose_secret())
            .json(&body)
            .send()
            .await
            .map_err(|e| ProviderError::Network(e.to_string()))?;

        let status = resp.status().as_u16();
        if !(200..400).contains(&status) {
            let body = resp.text().await.unwrap_or_default();
            return Err(ProviderError::from_status(status, body));
        }

        if streaming {
            return Ok(Box::pin(ChunkStream::new(resp.bytes_stream())));
        }

        let payload = resp
            .text()
            .await
            .map_err(|e| ProviderError::Network(e.to_string()))?;
        let wire: WireCompletion = serde_json::from_str(&payload)
            .map_err(|e| ProviderError::Serialization(e.to_string()))?;

        Ok(Box::pin(futures::stream::iter(vec![StreamEvent::Complete {
            response: convert_completion(wire),
        }])))
    }
}

fn normalize_base_url(base_url: Option<&str>) -> String {
    let url = match base_url {
        Some(url) if !url.is_empty() => url.trim_end_matches('/'),
        _ => return DEFAULT_BASE_URL.to_string(),
    };
    if url.ends_with("/v1") {
        url.to_string()
    } else {
        format!("{url}/v1")
    }
}

/// Canonical → chat-completions messages. The protocol has first-class
/// roles for system and tool results, so no same-role merging is needed;
/// thinking parts have no wire encoding here and are dropped.
fn wire_messages(system: &str, messages: &[Message]) -> Vec<Value> {
    let mut wire = Vec::new();
    if !system.is_empty() {
        wire.push(json!({"role": "system", "content": system}));
    }

    for msg in messages {
        match msg.role {
            Role::User => {
                let mut text = String::new();
                for part in &msg.parts {
                    match part {
                        ContentPart::Text { text: t } => text.push_str(t),
                        ContentPart::ToolResult { tool_call_id, result, .. } => {
                            wire.push(json!({
                                "role": "tool",
                                "tool_call_id": tool_call_id.as_str(),
                                "content": result.to_string(),
                            }));
                        }
                        _ => {}
                    }
                }
                if !text.is_empty() {
                    wire.push(json!({"role": "user", "content": text}));
                }
            }
            Role::Model => {
                let text = msg.text_content();
                let tool_calls: Vec<Value> = msg
                    .parts
                    .iter()
                    .filter_map(|p| match p {
                        ContentPart::ToolCall(tc) => Some(json!({
                            "id": tc.id.as_str(),
                            "type": "function",
                            "function": {
                                "name": tc.name,
                                "arguments": tc.arguments.to_string(),
                            }
                        })),
                        _ => None,
                    })
                    .collect();

                let mut entry = json!({"role": "assistant"});
                entry["content"] = if text.is_empty() { Value::Null } else { json!(text) };
                if !tool_calls.is_empty() {
                    entry["tool_calls"] = json!(tool_calls);
                }
                wire.push(entry);
            }
        }
    }

    wire
}

fn map_finish_reason(reason: &str) -> FinishReason {
    match reason {
        "stop" | "tool_calls" => FinishReason::Stop,
        "length" => FinishReason::MaxTokens,
        _ => FinishReason::Unspecified,
    }
}

// --- Wire payloads ---

#[derive(Deserialize)]
struct WireCompletion {
    #[serde(default)]
    choices: Vec<WireChoice>,
    #[serde(default)]
    usage: Option<WireUsage>,
}

#[derive(Deserialize)]
struct WireChoice {
    #[serde(default)]
    message: Option<WireMessage>,
    #[serde(default)]
    delta: Option<WireDelta>,
    #[serde(default)]
    finish_reason: Option<String>,
}

#[derive(Deserialize)]
struct WireMessage {
    #[serde(default)]
    content: Option<String>,
    #[serde(default)]
    tool_calls: Vec<WireToolCall>,
}

#[derive(Deserialize)]
struct WireDelta {
    #[serde(default)]
    content: Option<String>,
    #[serde(default)]
    tool_calls: Vec<WireToolCallDelta>,
}

#[derive(Deserialize)]
struct WireToolCall {
    #[serde(default)]
    id: String,
    function: WireFunction,
}

#[derive(Deserialize)]
struct WireToolCallDelta {
    index: usize,
    #[serde(default)]
    id: Option<String>,
    #[serde(default)]
    function: Option<WireFunctionDelta>,
}

#[derive(Deserialize)]
struct WireFunction {
    name: String,
    #[serde(default)]
    arguments: String,
}

#[derive(Deserialize)]
struct WireFunctionDelta {
    #[serde(default)]
    name: Option<String>,
    #[serde(default)]
    arguments: Option<String>,
}

#[derive(Deserialize)]
struct WireUsage {
    #[serde(default)]
    prompt_tokens: u32,
    #[serde(default)]
    completion_tokens: u32,
}

fn convert_completion(wire: WireCompletion) -> LlmResponse {
    let mut parts = Vec::new();
    let mut finish_reason = FinishReason::Unspecified;

    if let Some(choice) = wire.choices.into_iter().next() {
        if let Some(reason) = choice.finish_reason.as_deref() {
            finish_reason = map_finish_reason(reason);
        }
        if let Some(message) = choice.message {
            if let Some(content) = message.content {
                if !content.is_empty() {
                    parts.push(ContentPart::Text { text: content });
                }
            }
            for tc in message.tool_calls {
                parts.push(ContentPart::ToolCall(ToolCallPart {
                    id: ToolCallId::from_raw(tc.id),
                    name: tc.function.name,
                    arguments: serde_json::from_str(&tc.function.arguments)
                        .unwrap_or_else(|_| Value::Object(serde_json::Map::new())),
                }));
            }
        }
    }

    LlmResponse {
        parts,
        usage: wire.usage.map(|u| TokenUsage {
            input_tokens: u.prompt_tokens,
            output_tokens: u.completion_tokens,
        }),
        finish_reason,
    }
}

/// Chat-completions streams are framed as `data: {json}` lines with a
/// `data: [DONE]` terminator. Tool-call arguments arrive fragmented by
/// tool index; the first fragment for an index carries id and name.
#[derive(Default)]
struct ChunkParser {
    started: bool,
    text_started: bool,
    started_tools: HashSet<usize>,
}

impl ChunkParser {
    /// Tool blocks are offset past the single text block index.
    fn tool_block_index(tool_index: usize) -> usize {
        tool_index + 1
    }

    fn parse_datum(&mut self, datum: &str) -> Vec<StreamEvent> {
        if datum == "[DONE]" {
            return vec![StreamEvent::Stop];
        }

        let chunk: WireCompletion = match serde_json::from_str(datum) {
            Ok(chunk) => chunk,
            // A malformed chunk is skipped, never fatal.
            Err(_) => return Vec::new(),
        };

        let mut events = Vec::new();
        if !self.started {
            self.started = true;
            events.push(StreamEvent::Start { usage: None });
        }

        if let Some(usage) = chunk.usage {
            events.push(StreamEvent::Finish {
                reason: None,
                usage: Some(TokenUsage {
                    input_tokens: usage.prompt_tokens,
                    output_tokens: usage.completion_tokens,
                }),
            });
        }

        let Some(choice) = chunk.choices.into_iter().next() else {
            return events;
        };

        if let Some(delta) = choice.delta {
            if let Some(content) = delta.content {
                if !content.is_empty() {
                    if !self.text_started {
                        self.text_started = true;
                        events.push(StreamEvent::BlockStart { index: 0, block: BlockStart::Text });
                    }
                    events.push(StreamEvent::TextDelta { delta: content });
                }
            }
            for tc in delta.tool_calls {
                let index = Self::tool_block_index(tc.index);
                if self.started_tools.insert(tc.index) {
                    events.push(StreamEvent::BlockStart {
                        index,
                        block: BlockStart::ToolUse {
                            id: tc.id.clone().unwrap_or_default(),
                            name: tc
                                .function
                                .as_ref()
                                .and_then(|f| f.name.clone())
                                .unwrap_or_default(),
                        },
                    });
                }
                if let Some(arguments) = tc.function.and_then(|f| f.arguments) {
                    if !arguments.is_empty() {
                        events.push(StreamEvent::ToolArgsDelta { index, fragment: arguments });
                    }
                }
            }
        }

        if let Some(reason) = choice.finish_reason.as_deref() {
            events.push(StreamEvent::Finish {
                reason: Some(map_finish_reason(reason)),
                usage: None,
            });
        }

        events
    }
}

struct ChunkStream {
    inner: Pin<Box<dyn Stream<Item = Result<bytes::Bytes, reqwest::Error>> + Send>>,
    parser: ChunkParser,
    buffer: String,
    pending: Vec<StreamEvent>,
}

impl ChunkStream {
    fn new(
        byte_stream: impl Stream<Item = Result<bytes::Bytes, reqwest::Error>> + Send + 'static,
    ) -> Self {
        Self {
            inner: Box::pin(byte_stream),
            parser: ChunkParser::default(),
            buffer: String::new(),
            pending: Vec::new(),
        }
    }

    fn parse_frame(&mut self, frame: &str) {
        for line in frame.lines() {
            if let Some(datum) = line.strip_prefix("data: ") {
                let events = self.parser.parse_datum(datum.trim());
                self.pending.extend(events);
            }
        }
    }
}

impl Stream for ChunkStream {
    type Item = StreamEvent;

    fn poll_next(
        mut self: Pin<&mut Self>,
        cx: &mut std::task::Context<'_>,
    ) -> std::task::Poll<Option<Self::Item>> {
        if !self.pending.is_empty() {
            return std::task::Poll::Ready(Some(self.pending.remove(0)));
        }

        loop {
            match self.inner.as_mut().poll_next(cx) {
                std::task::Poll::Ready(Some(Ok(bytes))) => {
                    let text = String::from_utf8_lossy(&bytes).into_owned();
                    self.buffer.push_str(&text);

                    while let Some(pos) = self.buffer.find("\n\n") {
                        let frame = self.buffer[..pos + 2].to_string();
                        self.buffer = self.buffer[pos + 2..].to_string();
                        self.parse_frame(&frame);
                    }

                    if !self.pending.is_empty() {
                        return std::task::Poll::Ready(Some(self.pending.remove(0)));
                    }
                }
                std::task::Poll::Ready(Some(Err(e))) => {
                    return std::task::Poll::Ready(Some(StreamEvent::Error {
                        error: ProviderError::StreamInterrupted(e.to_string()),
                    }));
                }
                std::task::Poll::Ready(None) => {
                    if !self.buffer.is_empty() {
                        let remaining = std::mem::take(&mut self.buffer);
                        self.parse_frame(&remaining);
                        if !self.pending.is_empty() {
                            return std::task::Poll::Ready(Some(self.pending.remove(0)));
                        }
                    }
                    return std::task::Poll::Ready(None);
                }
                std::task::Poll::Pending => return std::task::Poll::Pending,
            }
        }
    }
}
