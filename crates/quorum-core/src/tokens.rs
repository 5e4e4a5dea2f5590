use serde::{Deserialize, Serialize};

/// Per-call token usage as reported by the provider.
///
/// The prompt count arrives once when the call starts; the completion count
/// arrives incrementally and the last non-zero value observed wins.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TokenUsage {
    pub input_tokens: u32,
    pub output_tokens: u32,
}

impl TokenUsage {
    pub fn total_tokens(&self) -> u32 {
        self.input_tokens + self.output_tokens
    }

    /// Fold another observation into this one. Zero fields never overwrite
    /// a previously observed non-zero count.
    pub fn merge(&mut self, other: &TokenUsage) {
        if other.input_tokens > 0 {
            self.input_tokens = other.input_tokens;
        }
        if other.output_tokens > 0 {
            self.output_tokens = other.output_tokens;
        }
    }

    pub fn is_empty(&self) -> bool {
        self.input_tokens == 0 && self.output_tokens == 0
    }
}
