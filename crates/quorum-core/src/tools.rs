use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// A tool surface advertised to the model. The schema is opaque to this
/// core; it is forwarded to the provider untouched.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ToolDefinition {
    pub name: String,
    pub description: String,
    pub input_schema: Value,
}

#[derive(Debug, thiserror::Error)]
pub enum ToolError {
    #[error("unknown tool: {0}")]
    Unknown(String),
    #[error("tool failed: {0}")]
    Failed(String),
}

/// An invocable tool capability. Arguments and results are opaque
/// structured data passed through without validation.
#[async_trait]
pub trait ToolInvocable: Send + Sync {
    async fn invoke(&self, args: Value) -> Result<Value, ToolError>;
}
