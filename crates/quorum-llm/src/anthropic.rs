use std::pin::Pin;
use std::time::Duration;

use async_trait::async_trait;
use futures::{Future, Stream};
use reqwest::Client;
use secrecy::{ExposeSecret, SecretString};
use serde::Deserialize;
use serde_json::Value;
use tracing::instrument;

use quorum_core::config::ProviderConfig;
use quorum_core::errors::ProviderError;
use quorum_core::ids::ToolCallId;
use quorum_core::messages::{ContentPart, LlmResponse, ToolCallPart};
use quorum_core::provider::{EventStream, LlmRequest, ModelHandle, ProviderKind};
use quorum_core::stream::StreamEvent;
use quorum_core::tokens::TokenUsage;

use crate::convert;
use crate::sse::{self, SseParser};

pub const DEFAULT_BASE_URL: &str = "https://api.anthropic.com";
pub const ANTHROPIC_VERSION: &str = "2023-06-01";
pub const DEFAULT_MAX_TOKENS: u32 = 4096;

const SSE_IDLE_TIMEOUT: Duration = Duration::from_secs(90);

/// Anthropic Messages API adapter.
#[derive(Debug)]
pub struct AnthropicModel {
    client: Client,
    base_url: String,
    api_key: SecretString,
    model: String,
    max_tokens: u32,
}

impl AnthropicModel {
    pub fn new(config: &ProviderConfig, client: Client) -> Result<Self, ProviderError> {
        if config.api_key.expose_secret().is_empty() {
            return Err(ProviderError::MissingCredentials(
                "anthropic api key is empty".into(),
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
            max_tokens: config.max_tokens.unwrap_or(DEFAULT_MAX_TOKENS),
        })
    }

    fn messages_endpoint(&self) -> String {
        format!("{}/v1/messages", self.base_url)
    }

    async fn do_request(&self, body: &Value, stream: bool) -> Result<reqwest::Response, ProviderError> {
        let mut req = self
            .client
            .post(self.messages_endpoint())
            .header("content-type", "application/json")
            .header("x-api-key", self.api_key.expose_secret())
            .header("anthropic-version", ANTHROPIC_VERSION);
        if stream {
            req = req.header("accept", "text/event-stream");
        }

        let resp = req
            .json(body)
            .send()
            .await
            .map_err(|e| ProviderError::Network(e.to_string()))?;

        let status = resp.status().as_u16();
        if !(200..400).contains(&status) {
            let body = resp.text().await.unwrap_or_default();
            return Err(ProviderError::from_status(status, body));
        }
        Ok(resp)
    }
}

#[async_trait]
impl ModelHandle for AnthropicModel {
    fn provider(&self) -> ProviderKind {
        ProviderKind::Anthropic
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
        let body = convert::build_request_body(request, &self.model, self.max_tokens, streaming);
        let resp = self.do_request(&body, streaming).await?;

        if streaming {
            return Ok(Box::pin(SseStream::new(resp.bytes_stream())));
        }

        let payload = resp
            .text()
            .await
            .map_err(|e| ProviderError::Network(e.to_string()))?;
        let wire: WireResponse = serde_json::from_str(&payload)
            .map_err(|e| ProviderError::Serialization(e.to_string()))?;
        let response = convert_response(wire);

        Ok(Box::pin(futures::stream::iter(vec![StreamEvent::Complete {
            response,
        }])))
    }
}

/// Strip a trailing slash and a user-supplied `/v1` suffix; the endpoint
/// path is appended internally.
fn normalize_base_url(base_url: Option<&str>) -> String {
    let url = match base_url {
        Some(url) if !url.is_empty() => url,
        _ => DEFAULT_BASE_URL,
    };
    let url = url.trim_end_matches('/');
    url.strip_suffix("/v1").unwrap_or(url).to_string()
}

// --- Non-streaming wire response ---

#[derive(Deserialize)]
struct WireResponse {
    #[serde(default)]
    content: Vec<WireBlock>,
    #[serde(default)]
    stop_reason: Option<String>,
    #[serde(default)]
    usage: Option<WireUsage>,
}

#[derive(Deserialize)]
struct WireBlock {
    #[serde(rename = "type")]
    block_type: String,
    #[serde(default)]
    text: Option<String>,
    #[serde(default)]
    thinking: Option<String>,
    #[serde(default)]
    id: Option<String>,
    #[serde(default)]
    name: Option<String>,
    #[serde(default)]
    input: Option<Value>,
}

#[derive(Deserialize)]
struct WireUsage {
    #[serde(default)]
    input_tokens: u32,
    #[serde(default)]
    output_tokens: u32,
}

fn convert_response(wire: WireResponse) -> LlmResponse {
    let mut parts = Vec::new();
    for block in wire.content {
        match block.block_type.as_str() {
            "thinking" => parts.push(ContentPart::Thinking {
                text: block.thinking.unwrap_or_default(),
            }),
            "text" => parts.push(ContentPart::Text {
                text: block.text.unwrap_or_default(),
            }),
            "tool_use" => parts.push(ContentPart::ToolCall(ToolCallPart {
                id: ToolCallId::from_raw(block.id.unwrap_or_default()),
                name: block.name.unwrap_or_default(),
                arguments: parse_input(block.input),
            })),
            _ => {}
        }
    }

    LlmResponse {
        parts,
        usage: wire.usage.map(|u| TokenUsage {
            input_tokens: u.input_tokens,
            output_tokens: u.output_tokens,
        }),
        finish_reason: sse::map_stop_reason(wire.stop_reason.as_deref().unwrap_or("")),
    }
}

fn parse_input(input: Option<Value>) -> Value {
    match input {
        Some(Value::Object(map)) => Value::Object(map),
        Some(Value::String(raw)) => {
            serde_json::from_str(&raw).unwrap_or_else(|_| Value::Object(serde_json::Map::new()))
        }
        _ => Value::Object(serde_json::Map::new()),
    }
}

/// Wraps the response byte stream and yields canonical events, buffering
/// until whole SSE frames are available. If no data arrives within the idle
/// window, the stream fails rather than hanging forever.
struct SseStream {
    inner: Pin<Box<dyn Stream<Item = Result<bytes::Bytes, reqwest::Error>> + Send>>,
    parser: SseParser,
    buffer: String,
    pending: Vec<StreamEvent>,
    idle_deadline: Pin<Box<tokio::time::Sleep>>,
    idle_duration: Duration,
}

impl SseStream {
    fn new(
        byte_stream: impl Stream<Item = Result<bytes::Bytes, reqwest::Error>> + Send + 'static,
    ) -> Self {
        Self::with_idle_timeout(byte_stream, SSE_IDLE_TIMEOUT)
    }

    fn with_idle_timeout(
        byte_stream: impl Stream<Item = Result<bytes::Bytes, reqwest::Error>> + Send + 'static,
        idle_timeout: Duration,
    ) -> Self {
        Self {
            inner: Box::pin(byte_stream),
            parser: SseParser::new(),
            buffer: String::new(),
            pending: Vec::new(),
            idle_deadline: Box::pin(tokio::time::sleep(idle_timeout)),
            idle_duration: idle_timeout,
        }
    }

    fn parse_chunk(&mut self, chunk: &str) {
        for (event_type, data) in sse::parse_sse_lines(chunk) {
            let events = self.parser.parse_event(&event_type, &data);
            self.pending.extend(events);
        }
    }
}

impl Stream for SseStream {
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
                    let new_deadline = tokio::time::Instant::now() + self.idle_duration;
                    self.idle_deadline.as_mut().reset(new_deadline);

                    let text = String::from_utf8_lossy(&bytes).into_owned();
                    self.buffer.push_str(&text);

                    while let Some(pos) = self.buffer.find("\n\n") {
                        let frame = self.buffer[..pos + 2].to_string();
                        self.buffer = self.buffer[pos + 2..].to_string();
                        self.parse_chunk(&frame);
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
                        self.parse_chunk(&remaining);
                        if !self.pending.is_empty() {
                            return std::task::Poll::Ready(Some(self.pending.remove(0)));
                        }
                    }
                    return std::task::Poll::Ready(None);
                }
                std::task::Poll::Pending => {
                    if self.idle_deadline.as_mut().poll(cx).is_ready() {
                        return std::task::Poll::Ready(Some(StreamEvent::Error {
                            error: ProviderError::StreamInterrupted(format!(
                                "idle timeout after {}s",
                                self.idle_duration.as_secs()
                            )),
                        }));
                    }
                    return std::task::Poll::Pending;
                }
            }
        }
    }
}
