use std::sync::Arc;
use std::time::Duration;

use reqwest::Client;
use tracing::debug;

use quorum_core::config::ProviderConfig;
use quorum_core::errors::ProviderError;
use quorum_core::provider::{ModelHandle, ModelProvisioner, ProviderKind};

use crate::anthropic::AnthropicModel;
use crate::gemini::GeminiModel;
use crate::openai::OpenAiModel;

const CONNECT_TIMEOUT: Duration = Duration::from_secs(30);

/// Builds provider-bound model handles. The one place new providers are
/// wired up. The HTTP client is constructed once by the owning assembly
/// and shared by every handle built here.
#[derive(Clone)]
pub struct ModelFactory {
    client: Client,
}

impl ModelFactory {
    pub fn new(client: Client) -> Self {
        Self { client }
    }

    /// Validation happens here, before any call is in flight.
    pub fn create_model(&self, config: &ProviderConfig) -> Result<Arc<dyn ModelHandle>, ProviderError> {
        let handle: Arc<dyn ModelHandle> = match config.provider {
            ProviderKind::Anthropic => {
                Arc::new(AnthropicModel::new(config, self.client.clone())?)
            }
            ProviderKind::OpenAI => Arc::new(OpenAiModel::new(config, self.client.clone())?),
            ProviderKind::Gemini | ProviderKind::VertexAI => {
                Arc::new(GeminiModel::new(config, self.client.clone())?)
            }
        };
        debug!(provider = %config.provider, model = %config.model, "model handle created");
        Ok(handle)
    }
}

impl ModelProvisioner for ModelFactory {
    fn create_model(&self, config: &ProviderConfig) -> Result<Arc<dyn ModelHandle>, ProviderError> {
        ModelFactory::create_model(self, config)
    }
}

impl Default for ModelFactory {
    fn default() -> Self {
        let client = Client::builder()
            .connect_timeout(CONNECT_TIMEOUT)
            .build()
            .unwrap_or_default();
        Self::new(client)
    }
}
