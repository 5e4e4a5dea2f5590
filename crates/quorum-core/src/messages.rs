use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::ids::ToolCallId;
use crate::tokens::TokenUsage;

/// Canonical conversation roles. Wire protocols map `Model` to their
/// assistant role and everything else to their user role.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Role {
    User,
    Model,
}

/// One provider-agnostic content block within a message.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ContentPart {
    Text { text: String },
    /// Model-internal reasoning. Never surfaced as user-visible content;
    /// retained only so a provider-side continuation can reference it.
    Thinking { text: String },
    ToolCall(ToolCallPart),
    ToolResult {
        tool_call_id: ToolCallId,
        result: Value,
        #[serde(default)]
        is_error: bool,
    },
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ToolCallPart {
    pub id: ToolCallId,
    pub name: String,
    pub arguments: Value,
}

/// A canonical conversation turn.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Message {
    pub role: Role,
    pub parts: Vec<ContentPart>,
}

impl Message {
    pub fn user_text(text: impl Into<String>) -> Self {
        Self {
            role: Role::User,
            parts: vec![ContentPart::Text { text: text.into() }],
        }
    }

    pub fn model_text(text: impl Into<String>) -> Self {
        Self {
            role: Role::Model,
            parts: vec![ContentPart::Text { text: text.into() }],
        }
    }

    /// Tool results travel back on the user side of the conversation.
    pub fn tool_result(tool_call_id: ToolCallId, result: Value, is_error: bool) -> Self {
        Self {
            role: Role::User,
            parts: vec![ContentPart::ToolResult {
                tool_call_id,
                result,
                is_error,
            }],
        }
    }

    pub fn text_content(&self) -> String {
        self.parts
            .iter()
            .filter_map(|p| match p {
                ContentPart::Text { text } => Some(text.as_str()),
                _ => None,
            })
            .collect()
    }
}

/// Why a model response stopped.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FinishReason {
    Stop,
    MaxTokens,
    Unspecified,
}

/// One reconciled, final model response.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct LlmResponse {
    pub parts: Vec<ContentPart>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub usage: Option<TokenUsage>,
    pub finish_reason: FinishReason,
}

impl LlmResponse {
    pub fn text(text: impl Into<String>) -> Self {
        Self {
            parts: vec![ContentPart::Text { text: text.into() }],
            usage: None,
            finish_reason: FinishReason::Stop,
        }
    }

    /// Concatenated user-visible text. Thinking parts are excluded.
    pub fn visible_text(&self) -> String {
        self.parts
            .iter()
            .filter_map(|p| match p {
                ContentPart::Text { text } => Some(text.as_str()),
                _ => None,
            })
            .collect()
    }

    pub fn thinking_text(&self) -> String {
        self.parts
            .iter()
            .filter_map(|p| match p {
                ContentPart::Thinking { text } => Some(text.as_str()),
                _ => None,
            })
            .collect()
    }

    pub fn tool_calls(&self) -> Vec<&ToolCallPart> {
        self.parts
            .iter()
            .filter_map(|p| match p {
                ContentPart::ToolCall(tc) => Some(tc),
                _ => None,
            })
            .collect()
    }

    pub fn has_tool_calls(&self) -> bool {
        self.parts.iter().any(|p| matches!(p, ContentPart::ToolCall(_)))
    }
}
