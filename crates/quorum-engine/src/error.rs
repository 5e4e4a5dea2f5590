use quorum_core::deadline::ScopeError;
use quorum_core::errors::ProviderError;
use quorum_core::tools::ToolError;

/// Errors surfaced at the single-agent-run boundary. A deadline hit is
/// distinct from everything else so the orchestrator can log-and-skip the
/// agent instead of aborting the deliberation.
#[derive(Debug, thiserror::Error)]
pub enum EngineError {
    #[error("provider error: {0}")]
    Provider(#[from] ProviderError),

    #[error("tool error: {0}")]
    Tool(#[from] ToolError),

    #[error("step deadline exceeded")]
    Timeout,

    #[error("cancelled")]
    Cancelled,

    #[error("{0}")]
    Internal(String),
}

impl From<ScopeError> for EngineError {
    fn from(e: ScopeError) -> Self {
        match e {
            ScopeError::TimedOut => Self::Timeout,
            ScopeError::Cancelled => Self::Cancelled,
        }
    }
}

impl EngineError {
    pub fn is_timeout(&self) -> bool {
        matches!(self, Self::Timeout)
    }
}

/// Hard failures of a whole deliberation. Anything here means no partial
/// transcript is returned.
#[derive(Debug, thiserror::Error)]
pub enum DeliberationError {
    #[error("no provider configuration available")]
    NoProviderConfig,

    #[error("no agents available for deliberation")]
    NoAgents,

    #[error("moderator timed out")]
    ModeratorTimeout,

    #[error("moderator failed: {0}")]
    Moderator(String),

    #[error("model creation failed: {0}")]
    ModelCreation(#[from] ProviderError),

    #[error("deliberation cancelled")]
    Cancelled,
}
