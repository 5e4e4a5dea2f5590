use async_trait::async_trait;

/// One transcript entry handed to the memory collaborator for key-point
/// extraction.
#[derive(Clone, Debug)]
pub struct DiscussionExcerpt {
    pub agent_name: String,
    pub role: String,
    pub content: String,
}

#[derive(Debug, thiserror::Error)]
#[error("memory error: {0}")]
pub struct MemoryError(pub String);

/// External memory collaborator. Every call is best-effort from the
/// orchestrator's point of view; failures degrade, never abort.
#[async_trait]
pub trait MemoryStore: Send + Sync {
    /// Context text to inject ahead of a discussion round. Empty string
    /// when there is nothing relevant.
    async fn build_context(&self, symbol: &str, query: &str) -> String;

    async fn extract_key_points(
        &self,
        entries: &[DiscussionExcerpt],
    ) -> Result<Vec<String>, MemoryError>;

    async fn add_round(
        &self,
        symbol: &str,
        query: &str,
        summary: &str,
        key_points: &[String],
    ) -> Result<(), MemoryError>;
}

const EXCERPT_MAX_CHARS: usize = 80;

/// Fallback extraction when the collaborator cannot produce key points:
/// one clamped excerpt per entry.
pub fn fallback_key_points(entries: &[DiscussionExcerpt]) -> Vec<String> {
    entries
        .iter()
        .map(|entry| {
            let mut content: String = entry.content.chars().take(EXCERPT_MAX_CHARS).collect();
            if entry.content.chars().count() > EXCERPT_MAX_CHARS {
                content.push_str("...");
            }
            format!("{}: {}", entry.agent_name, content)
        })
        .collect()
}
