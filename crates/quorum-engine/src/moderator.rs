use std::sync::Arc;

use serde::Deserialize;
use tracing::{instrument, warn};

use quorum_core::config::AgentProfile;
use quorum_core::deadline::DeadlineScope;
use quorum_core::events::Utterance;
use quorum_core::provider::{LlmRequest, ModelHandle};
use quorum_core::request::StockContext;
use quorum_llm::aggregator;

use crate::error::EngineError;

pub const MODERATOR_ID: &str = "moderator";
pub const MODERATOR_NAME: &str = "Moderator";
pub const MODERATOR_ROLE: &str = "panel moderator";

/// The moderator's selection of speakers for a round.
#[derive(Clone, Debug)]
pub struct ModeratorDecision {
    /// Ordered, non-empty subset of agent ids.
    pub selected: Vec<String>,
    pub topic: String,
    pub opening: String,
}

/// The specialized agent that picks speakers, opens the round, and closes
/// it with a summary. Both operations are single non-tool model rounds.
pub struct Moderator {
    model: Arc<dyn ModelHandle>,
}

impl Moderator {
    pub fn new(model: Arc<dyn ModelHandle>) -> Self {
        Self { model }
    }

    #[instrument(skip_all, fields(stock = %stock.symbol))]
    pub async fn analyze(
        &self,
        scope: &DeadlineScope,
        stock: &StockContext,
        query: &str,
        roster: &[AgentProfile],
    ) -> Result<ModeratorDecision, EngineError> {
        let system = "You moderate a panel of stock-research experts. Given the user's \
                      question and the expert roster, pick the experts worth hearing from, \
                      in speaking order, and write a one-or-two sentence opening remark. \
                      Reply with JSON only: \
                      {\"selected\": [\"id\", ...], \"topic\": \"...\", \"opening\": \"...\"}";

        let mut prompt = format!(
            "Stock: {} ({})\nQuestion: {}\n\nExpert roster:\n",
            stock.name, stock.symbol, query
        );
        for profile in roster.iter().filter(|p| p.enabled) {
            prompt.push_str(&format!("- {}: {} ({})\n", profile.id, profile.name, profile.role));
        }

        let request = LlmRequest::user_query(system, prompt);
        let stream = scope.bound(self.model.generate(&request, false)).await??;
        let response = scope.bound(aggregator::drain(stream, |_| {})).await??;

        Ok(parse_decision(&response.visible_text(), roster))
    }

    #[instrument(skip_all, fields(stock = %stock.symbol))]
    pub async fn summarize(
        &self,
        scope: &DeadlineScope,
        stock: &StockContext,
        query: &str,
        history: &[Utterance],
    ) -> Result<String, EngineError> {
        let system = "You moderate a panel of stock-research experts. The discussion is \
                      over. Write a short closing summary for the user: the points of \
                      agreement, the main disagreement if any, and the practical takeaway.";

        let mut prompt = format!(
            "Stock: {} ({})\nQuestion: {}\n\nDiscussion:\n",
            stock.name, stock.symbol, query
        );
        for entry in history {
            prompt.push_str(&format!(
                "- {} ({}): {}\n\n",
                entry.agent_name, entry.role, entry.content
            ));
        }

        let request = LlmRequest::user_query(system, prompt);
        let stream = scope.bound(self.model.generate(&request, false)).await??;
        let response = scope.bound(aggregator::drain(stream, |_| {})).await??;

        Ok(response.visible_text().trim().to_string())
    }
}

#[derive(Deserialize)]
struct RawDecision {
    #[serde(default)]
    selected: Vec<String>,
    #[serde(default)]
    topic: String,
    #[serde(default)]
    opening: String,
}

/// Parse the moderator's JSON reply, tolerating fenced code blocks. Ids
/// unknown to the roster are dropped; an empty result falls back to the
/// full enabled roster in priority order so the round can still happen.
fn parse_decision(text: &str, roster: &[AgentProfile]) -> ModeratorDecision {
    let raw = strip_code_fence(text);
    let parsed: Option<RawDecision> = serde_json::from_str(raw).ok();

    let (mut selected, topic, opening) = match parsed {
        Some(decision) => {
            let known: Vec<String> = decision
                .selected
                .into_iter()
                .filter(|id| roster.iter().any(|p| p.enabled && &p.id == id))
                .collect();
            (known, decision.topic, decision.opening)
        }
        None => {
            warn!("moderator reply was not valid JSON, selecting full roster");
            (Vec::new(), String::new(), String::new())
        }
    };

    if selected.is_empty() {
        let mut enabled: Vec<&AgentProfile> = roster.iter().filter(|p| p.enabled).collect();
        enabled.sort_by_key(|p| p.priority);
        selected = enabled.into_iter().map(|p| p.id.clone()).collect();
    }

    let opening = if opening.is_empty() {
        "Let's hear what the panel makes of this.".to_string()
    } else {
        opening
    };

    ModeratorDecision { selected, topic, opening }
}

fn strip_code_fence(text: &str) -> &str {
    let trimmed = text.trim();
    let Some(rest) = trimmed.strip_prefix("```") else {
        return trimmed;
    };
    let rest = rest.strip_prefix("json").unwrap_or(rest);
    let rest = rest.strip_suffix("```").unwrap_or(rest);
    rest.trim()
}
