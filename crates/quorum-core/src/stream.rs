use crate::errors::ProviderError;
use crate::messages::{FinishReason, LlmResponse};
use crate::tokens::TokenUsage;

/// Canonical incremental events produced by a provider adapter.
///
/// Streaming calls follow the contract:
///
/// Start → (BlockStart → {TextDelta | ThinkingDelta | ToolArgsDelta}* → BlockStop)* →
/// Finish? → Stop
///
/// Non-streaming calls emit a single `Complete`. `Error` can appear at any
/// point and terminates the stream.
#[derive(Clone, Debug)]
pub enum StreamEvent {
    Start {
        usage: Option<TokenUsage>,
    },
    BlockStart {
        index: usize,
        block: BlockStart,
    },
    TextDelta {
        delta: String,
    },
    ThinkingDelta {
        delta: String,
    },
    /// A fragment of a tool call's JSON arguments, keyed by block index.
    ToolArgsDelta {
        index: usize,
        fragment: String,
    },
    BlockStop {
        index: usize,
    },
    Finish {
        reason: Option<FinishReason>,
        usage: Option<TokenUsage>,
    },
    Stop,
    /// Whole non-incremental payload from a non-streaming call.
    Complete {
        response: LlmResponse,
    },
    Error {
        error: ProviderError,
    },
}

/// The kind of content block opening at a given index.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum BlockStart {
    Text,
    Thinking,
    ToolUse { id: String, name: String },
}

impl StreamEvent {
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Stop | Self::Complete { .. } | Self::Error { .. })
    }

    pub fn is_delta(&self) -> bool {
        matches!(
            self,
            Self::TextDelta { .. } | Self::ThinkingDelta { .. } | Self::ToolArgsDelta { .. }
        )
    }
}
