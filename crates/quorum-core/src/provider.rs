use std::pin::Pin;
use std::sync::Arc;

use async_trait::async_trait;
use futures::Stream;
use serde::{Deserialize, Serialize};

use crate::config::ProviderConfig;
use crate::errors::ProviderError;
use crate::messages::Message;
use crate::stream::StreamEvent;
use crate::tools::ToolDefinition;

/// Supported model providers. The factory in the llm crate is the only
/// place new variants are wired up.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ProviderKind {
    OpenAI,
    Gemini,
    VertexAI,
    Anthropic,
}

impl std::fmt::Display for ProviderKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::OpenAI => "openai",
            Self::Gemini => "gemini",
            Self::VertexAI => "vertexai",
            Self::Anthropic => "anthropic",
        };
        f.write_str(s)
    }
}

/// Sampling parameters applied to a single generate call.
#[derive(Clone, Debug, Default)]
pub struct GenerateOptions {
    pub max_tokens: Option<u32>,
    pub temperature: Option<f64>,
    pub top_p: Option<f64>,
    pub stop_sequences: Vec<String>,
}

/// The complete canonical request handed to a provider adapter.
#[derive(Clone, Debug, Default)]
pub struct LlmRequest {
    pub system: String,
    pub messages: Vec<Message>,
    pub tools: Vec<ToolDefinition>,
    pub options: GenerateOptions,
}

impl LlmRequest {
    pub fn user_query(system: impl Into<String>, query: impl Into<String>) -> Self {
        Self {
            system: system.into(),
            messages: vec![Message::user_text(query)],
            ..Default::default()
        }
    }
}

pub type EventStream = Pin<Box<dyn Stream<Item = StreamEvent> + Send>>;

/// A long-lived, provider-bound model capability.
///
/// Creation happens in the factory and must fail fast; `generate` turns the
/// wire response — streaming or not — into canonical incremental events.
#[async_trait]
pub trait ModelHandle: Send + Sync {
    fn provider(&self) -> ProviderKind;
    fn model(&self) -> &str;

    async fn generate(
        &self,
        request: &LlmRequest,
        streaming: bool,
    ) -> Result<EventStream, ProviderError>;
}

/// Model provisioning boundary consumed by the orchestrator. Creation must
/// fail fast — before any call is in flight.
pub trait ModelProvisioner: Send + Sync {
    fn create_model(&self, config: &ProviderConfig) -> Result<Arc<dyn ModelHandle>, ProviderError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn provider_kind_serde() {
        assert_eq!(serde_json::to_string(&ProviderKind::OpenAI).unwrap(), r#""openai""#);
        assert_eq!(serde_json::to_string(&ProviderKind::VertexAI).unwrap(), r#""vertexai""#);
        let parsed: ProviderKind = serde_json::from_str(r#""anthropic""#).unwrap();
        assert_eq!(parsed, ProviderKind::Anthropic);
    }

    #[test]
    fn user_query_constructor() {
        let req = LlmRequest::user_query("be brief", "what moved the index today?");
        assert_eq!(req.system, "be brief");
        assert_eq!(req.messages.len(), 1);
        assert!(req.tools.is_empty());
        assert!(req.options.max_tokens.is_none());
    }
}
