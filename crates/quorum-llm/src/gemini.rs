use std::collections::HashMap;
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

pub const DEFAULT_BASE_URL: &str = "https://generativelanguage.googleapis.com";

/// Gemini generateContent adapter. The same wire schema serves both the
/// public Gemini API and Vertex AI; only the endpoint path and auth differ.
#[derive(Debug)]
pub struct GeminiModel {
    client: Client,
    kind: ProviderKind,
    model_url: String,
    api_key: SecretString,
    model: String,
    max_tokens: Option<u32>,
}

impl GeminiModel {
    pub fn new(config: &ProviderConfig, client: Client) -> Result<Self, ProviderError> {
        if config.api_key.expose_secret().is_empty() {
            return Err(ProviderError::MissingCredentials(
                "gemini api key is empty".into(),
            ));
        }
        if config.model.is_empty() {
            return Err(ProviderError::UnsupportedModel("model name is empty".into()));
        }

        let model_url = match config.provider {
            ProviderKind::Gemini => {
                let base = config
                    .base_url
                    .as_deref()
                    .filter(|u| !u.is_empty())
                    .unwrap_or(DEFAULT_BASE_URL)
                    .trim_end_matches('/');
                format!("{base}/v1beta/models/{}", config.model)
            }
            ProviderKind::VertexAI => {
                let project = config
                    .project
                    .as_deref()
                    .filter(|p| !p.is_empty())
                    .ok_or_else(|| {
                        ProviderError::MissingCredentials("vertex ai project is not set".into())
                    })?;
                let location = config
                    .location
                    .as_deref()
                    .filter(|l| !l.is_empty())
                    .ok_or_else(|| {
                        ProviderError::MissingCredentials("vertex ai location is not set".into())
                    })?;
                format!(
                    "https://{location}-aiplatform.googleapis.com/v1/projects/{project}/locations/{location}/publishers/google/models/{}",
                    config.model
                )
            }
            other => {
                return Err(ProviderError::UnsupportedModel(format!(
                    "gemini adapter cannot serve provider {other}"
                )))
            }
        };

        Ok(Self {
            client,
            kind: config.provider,
            model_url,
            api_key: config.api_key.clone(),
            model: config.model.clone(),
            max_tokens: config.max_tokens,
        })
    }

    fn build_body(&self, request: &LlmRequest) -> Value {
        let mut body = json!({
            "contents": wire_contents(&request.messages),
        });

        if !request.system.is_empty() {
            body["systemInstruction"] = json!({"parts": [{"text": request.system}]});
        }
        if !request.tools.is_empty() {
            let declarations: Vec<Value> = request
                .tools
                .iter()
                .map(|t| {
                    json!({
                        "name": t.name,
                        "description": t.description,
                        "parameters": t.input_schema,
                    })
                })
                .collect();
            body["tools"] = json!([{"functionDeclarations": declarations}]);
        }

        let mut generation = serde_json::Map::new();
        if let Some(max) = request.options.max_tokens.or(self.max_tokens) {
            generation.insert("maxOutputTokens".into(), json!(max));
        }
        if let Some(temp) = request.options.temperature {
            generation.insert("temperature".into(), json!(temp));
        }
        if let Some(top_p) = request.options.top_p {
            generation.insert("topP".into(), json!(top_p));
        }
        if !request.options.stop_sequences.is_empty() {
            generation.insert("stopSequences".into(), json!(request.options.stop_sequences));
        }
        if !generation.is_empty() {
            body["generationConfig"] = Value::Object(generation);
        }

        body
    }
}

#[async_trait]
impl ModelHandle for GeminiModel {
    fn provider(&self) -> ProviderKind {
        self.kind
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
        let method = if streaming {
            "streamGenerateContent?alt=sse"
        } else {
            "generateContent"
        };
        let url = format!("{}:{method}", self.model_url);

        let mut req = self.client.post(&url).json(&self.build_body(request));
        req = match self.kind {
            ProviderKind::VertexAI => req.bearer_auth(self.api_key.expose_secret()),
            _ => req.header("x-goog-api-key", self.api_key.expose_secret()),
        };

        let resp = req
            .send()
            .await
            .map_err(|e| ProviderError::Network(e.to_string()))?;

        let status = resp.status().as_u16();
        if !(200..400).contains(&status) {
            let body = resp.text().await.unwrap_or_default();
            return Err(ProviderError::from_status(status, body));
        }

        if streaming {
            return Ok(Box::pin(GeminiStream::new(resp.bytes_stream())));
        }

        let payload = resp
            .text()
            .await
            .map_err(|e| ProviderError::Network(e.to_string()))?;
        let wire: WireResponse = serde_json::from_str(&payload)
            .map_err(|e| ProviderError::Serialization(e.to_string()))?;

        Ok(Box::pin(futures::stream::iter(vec![StreamEvent::Complete {
            response: convert_response(wire),
        }])))
    }
}

/// Canonical → Gemini contents. Function responses need the function name
/// on the wire, which is recovered from the matching tool-call part
/// earlier in the conversation.
fn wire_contents(messages: &[Message]) -> Vec<Value> {
    let mut call_names: HashMap<&str, &str> = HashMap::new();
    for msg in messages {
        for part in &msg.parts {
            if let ContentPart::ToolCall(tc) = part {
                call_names.insert(tc.id.as_str(), tc.name.as_str());
            }
        }
    }

    let mut contents = Vec::new();
    for msg in messages {
        let role = match msg.role {
            Role::Model => "model",
            Role::User => "user",
        };
        let parts: Vec<Value> = msg
            .parts
            .iter()
            .map(|part| match part {
                ContentPart::Text { text } => json!({"text": text}),
                ContentPart::Thinking { text } => json!({"text": text, "thought": true}),
                ContentPart::ToolCall(tc) => json!({
                    "functionCall": {
                        "id": tc.id.as_str(),
                        "name": tc.name,
                        "args": tc.arguments,
                    }
                }),
                ContentPart::ToolResult { tool_call_id, result, .. } => json!({
                    "functionResponse": {
                        "id": tool_call_id.as_str(),
                        "name": call_names.get(tool_call_id.as_str()).copied().unwrap_or(""),
                        "response": result,
                    }
                }),
            })
            .collect();
        if !parts.is_empty() {
            contents.push(json!({"role": role, "parts": parts}));
        }
    }

    contents
}

fn map_finish_reason(reason: &str) -> FinishReason {
    match reason {
        "STOP" => FinishReason::Stop,
        "MAX_TOKENS" => FinishReason::MaxTokens,
        _ => FinishReason::Unspecified,
    }
}

// --- Wire payloads ---

#[derive(Deserialize)]
struct WireResponse {
    #[serde(default)]
    candidates: Vec<WireCandidate>,
    #[serde(default, rename = "usageMetadata")]
    usage_metadata: Option<WireUsage>,
}

#[derive(Deserialize)]
struct WireCandidate {
    #[serde(default)]
    content: Option<WireContent>,
    #[serde(default, rename = "finishReason")]
    finish_reason: Option<String>,
}

#[derive(Deserialize)]
struct WireContent {
    #[serde(default)]
    parts: Vec<WirePart>,
}

#[derive(Deserialize)]
struct WirePart {
    #[serde(default)]
    text: Option<String>,
    #[serde(default)]
    thought: bool,
    #[serde(default, rename = "functionCall")]
    function_call: Option<WireFunctionCall>,
}

#[derive(Deserialize)]
struct WireFunctionCall {
    #[serde(default)]
    id: Option<String>,
    name: String,
    #[serde(default)]
    args: Option<Value>,
}

#[derive(Deserialize)]
struct WireUsage {
    #[serde(default, rename = "promptTokenCount")]
    prompt_token_count: u32,
    #[serde(default, rename = "candidatesTokenCount")]
    candidates_token_count: u32,
}

fn convert_response(wire: WireResponse) -> LlmResponse {
    let mut parts = Vec::new();
    let mut finish_reason = FinishReason::Unspecified;

    if let Some(candidate) = wire.candidates.into_iter().next() {
        if let Some(reason) = candidate.finish_reason.as_deref() {
            finish_reason = map_finish_reason(reason);
        }
        if let Some(content) = candidate.content {
            for part in content.parts {
                if let Some(text) = part.text {
                    if part.thought {
                        parts.push(ContentPart::Thinking { text });
                    } else if !text.is_empty() {
                        parts.push(ContentPart::Text { text });
                    }
                } else if let Some(fc) = part.function_call {
                    parts.push(ContentPart::ToolCall(ToolCallPart {
                        id: ToolCallId::from_raw(fc.id.unwrap_or_default()),
                        name: fc.name,
                        arguments: fc.args.unwrap_or_else(|| Value::Object(serde_json::Map::new())),
                    }));
                }
            }
        }
    }

    LlmResponse {
        parts,
        usage: wire.usage_metadata.map(|u| TokenUsage {
            input_tokens: u.prompt_token_count,
            output_tokens: u.candidates_token_count,
        }),
        finish_reason,
    }
}

/// Incremental chunks are whole `GenerateContentResponse` payloads; text
/// arrives as deltas, function calls arrive whole.
#[derive(Default)]
struct GeminiParser {
    started: bool,
    text_started: bool,
    next_tool_block: usize,
}

impl GeminiParser {
    fn parse_datum(&mut self, datum: &str) -> Vec<StreamEvent> {
        let chunk: WireResponse = match serde_json::from_str(datum) {
            Ok(chunk) => chunk,
            Err(_) => return Vec::new(),
        };

        let mut events = Vec::new();
        if !self.started {
            self.started = true;
            events.push(StreamEvent::Start { usage: None });
        }

        let usage = chunk.usage_metadata.as_ref().map(|u| TokenUsage {
            input_tokens: u.prompt_token_count,
            output_tokens: u.candidates_token_count,
        });

        let mut finish = None;
        if let Some(candidate) = chunk.candidates.into_iter().next() {
            if let Some(reason) = candidate.finish_reason.as_deref() {
                finish = Some(map_finish_reason(reason));
            }
            if let Some(content) = candidate.content {
                for part in content.parts {
                    if let Some(text) = part.text {
                        if text.is_empty() {
                            continue;
                        }
                        if part.thought {
                            events.push(StreamEvent::ThinkingDelta { delta: text });
                        } else {
                            if !self.text_started {
                                self.text_started = true;
                                events.push(StreamEvent::BlockStart {
                                    index: 0,
                                    block: BlockStart::Text,
                                });
                            }
                            events.push(StreamEvent::TextDelta { delta: text });
                        }
                    } else if let Some(fc) = part.function_call {
                        self.next_tool_block += 1;
                        let index = self.next_tool_block;
                        let args = fc
                            .args
                            .unwrap_or_else(|| Value::Object(serde_json::Map::new()));
                        events.push(StreamEvent::BlockStart {
                            index,
                            block: BlockStart::ToolUse {
                                id: fc.id.unwrap_or_default(),
                                name: fc.name,
                            },
                        });
                        events.push(StreamEvent::ToolArgsDelta {
                            index,
                            fragment: args.to_string(),
                        });
                        events.push(StreamEvent::BlockStop { index });
                    }
                }
            }
        }

        if finish.is_some() || usage.is_some() {
            events.push(StreamEvent::Finish { reason: finish, usage });
        }

        events
    }
}

struct GeminiStream {
    inner: Pin<Box<dyn Stream<Item = Result<bytes::Bytes, reqwest::Error>> + Send>>,
    parser: GeminiParser,
    buffer: String,
    pending: Vec<StreamEvent>,
    stopped: bool,
}

impl GeminiStream {
    fn new(
        byte_stream: impl Stream<Item = Result<bytes::Bytes, reqwest::Error>> + Send + 'static,
    ) -> Self {
        Self {
            inner: Box::pin(byte_stream),
            parser: GeminiParser::default(),
            buffer: String::new(),
            pending: Vec::new(),
            stopped: false,
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

impl Stream for GeminiStream {
    type Item = StreamEvent;

    fn poll_next(
        mut self: Pin<&mut Self>,
        cx: &mut std::task::Context<'_>,
    ) -> std::task::Poll<Option<Self::Item>> {
        if !self.pending.is_empty() {
            return std::task::Poll::Ready(Some(self.pending.remove(0)));
        }
        if self.stopped {
            return std::task::Poll::Ready(None);
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
                    self.stopped = true;
                    return std::task::Poll::Ready(Some(StreamEvent::Error {
                        error: ProviderError::StreamInterrupted(e.to_string()),
                    }));
                }
                std::task::Poll::Ready(None) => {
                    if !self.buffer.is_empty() {
                        let remaining = std::mem::take(&mut self.buffer);
                        self.parse_frame(&remaining);
                    }
                    self.stopped = true;
                    self.pending.push(StreamEvent::Stop);
                    return std::task::Poll::Ready(Some(self.pending.remove(0)));
                }
                std::task::Poll::Pending => return std::task::Poll::Pending,
            }
        }
    }
}
