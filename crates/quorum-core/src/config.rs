use secrecy::SecretString;
use serde::{Deserialize, Serialize};

use crate::provider::ProviderKind;

/// Provider credentials and model binding, supplied by the configuration
/// collaborator. Read-only from this core's perspective.
#[derive(Clone, Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProviderConfig {
    pub provider: ProviderKind,
    #[serde(default)]
    pub base_url: Option<String>,
    pub api_key: SecretString,
    pub model: String,
    #[serde(default)]
    pub max_tokens: Option<u32>,
    #[serde(default)]
    pub temperature: Option<f64>,
    // Vertex AI only
    #[serde(default)]
    pub project: Option<String>,
    #[serde(default)]
    pub location: Option<String>,
}

impl ProviderConfig {
    pub fn new(provider: ProviderKind, api_key: impl Into<String>, model: impl Into<String>) -> Self {
        Self {
            provider,
            base_url: None,
            api_key: SecretString::from(api_key.into()),
            model: model.into(),
            max_tokens: None,
            temperature: None,
            project: None,
            location: None,
        }
    }

    /// Same credentials and endpoint, different model. Used to honor a
    /// per-agent model override.
    pub fn with_model(&self, model: impl Into<String>) -> Self {
        let mut config = self.clone();
        config.model = model.into();
        config
    }
}

fn default_enabled() -> bool {
    true
}

/// One expert's identity and behavior. Immutable once loaded; owned by the
/// configuration collaborator and passed by value into a run.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AgentProfile {
    pub id: String,
    pub name: String,
    pub role: String,
    pub instruction: String,
    #[serde(default)]
    pub tools: Vec<String>,
    #[serde(default)]
    pub model_override: Option<String>,
    #[serde(default)]
    pub priority: i32,
    #[serde(default = "default_enabled")]
    pub enabled: bool,
}

impl AgentProfile {
    pub fn new(id: impl Into<String>, name: impl Into<String>, role: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
            role: role.into(),
            instruction: String::new(),
            tools: Vec::new(),
            model_override: None,
            priority: 0,
            enabled: true,
        }
    }

    pub fn with_instruction(mut self, instruction: impl Into<String>) -> Self {
        self.instruction = instruction.into();
        self
    }

    pub fn with_tools(mut self, tools: Vec<String>) -> Self {
        self.tools = tools;
        self
    }
}
