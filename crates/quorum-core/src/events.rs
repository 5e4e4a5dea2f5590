use serde::{Deserialize, Serialize};

/// What a transcript entry is.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum UtteranceKind {
    Opening,
    Opinion,
    Summary,
}

/// One attributed contribution to a deliberation transcript. Append-only;
/// the ordered sequence of utterances for one deliberation is the transcript.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Utterance {
    pub agent_id: String,
    pub agent_name: String,
    pub role: String,
    pub content: String,
    pub round: u32,
    pub kind: UtteranceKind,
}

/// Transient fine-grained notifications for a live observer. Emitted
/// at-most-once per state change, never replayed.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ProgressEvent {
    AgentStart {
        agent_id: String,
        agent_name: String,
        detail: String,
    },
    AgentDone {
        agent_id: String,
        agent_name: String,
    },
    ToolCall {
        agent_id: String,
        agent_name: String,
        tool: String,
    },
    ToolResult {
        agent_id: String,
        agent_name: String,
        tool: String,
    },
    Streaming {
        agent_id: String,
        agent_name: String,
        fragment: String,
    },
}

impl ProgressEvent {
    pub fn agent_id(&self) -> &str {
        match self {
            Self::AgentStart { agent_id, .. }
            | Self::AgentDone { agent_id, .. }
            | Self::ToolCall { agent_id, .. }
            | Self::ToolResult { agent_id, .. }
            | Self::Streaming { agent_id, .. } => agent_id,
        }
    }

    pub fn event_type(&self) -> &'static str {
        match self {
            Self::AgentStart { .. } => "agent_start",
            Self::AgentDone { .. } => "agent_done",
            Self::ToolCall { .. } => "tool_call",
            Self::ToolResult { .. } => "tool_result",
            Self::Streaming { .. } => "streaming",
        }
    }
}
