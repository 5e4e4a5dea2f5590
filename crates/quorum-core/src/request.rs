use serde::{Deserialize, Serialize};

use crate::config::AgentProfile;

/// The stock a deliberation is about.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StockContext {
    pub symbol: String,
    pub name: String,
    #[serde(default)]
    pub price: f64,
    #[serde(default)]
    pub change_percent: f64,
}

impl StockContext {
    pub fn new(symbol: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            symbol: symbol.into(),
            name: name.into(),
            price: 0.0,
            change_percent: 0.0,
        }
    }
}

/// The caller's holdings in the stock under discussion, if any.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PositionContext {
    pub quantity: f64,
    pub cost_price: f64,
}

/// One deliberation invocation. Constructed per call; not persisted here.
///
/// `agents` carries the explicitly addressed experts (panel mode);
/// `all_agents` carries the full roster the moderator selects from
/// (moderated mode). The two modes are mutually exclusive.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeliberationRequest {
    pub stock: StockContext,
    pub query: String,
    #[serde(default)]
    pub reply_content: Option<String>,
    #[serde(default)]
    pub agents: Vec<AgentProfile>,
    #[serde(default)]
    pub all_agents: Vec<AgentProfile>,
    #[serde(default)]
    pub position: Option<PositionContext>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn request_defaults() {
        let req = DeliberationRequest {
            stock: StockContext::new("sh600519", "Kweichow Moutai"),
            query: "is the pullback over?".into(),
            ..Default::default()
        };
        assert!(req.agents.is_empty());
        assert!(req.all_agents.is_empty());
        assert!(req.position.is_none());
        assert!(req.reply_content.is_none());
    }

    #[test]
    fn request_serde_roundtrip() {
        let req = DeliberationRequest {
            stock: StockContext {
                symbol: "sz000001".into(),
                name: "Ping An Bank".into(),
                price: 10.52,
                change_percent: -1.2,
            },
            query: "worth holding?".into(),
            reply_content: Some("earlier remark".into()),
            agents: vec![AgentProfile::new("technical", "Chart Watcher", "technical analyst")],
            all_agents: vec![],
            position: Some(PositionContext { quantity: 500.0, cost_price: 11.3 }),
        };
        let json = serde_json::to_string(&req).unwrap();
        let parsed: DeliberationRequest = serde_json::from_str(&json).unwrap();
        assert_eq!(parsed.stock.symbol, "sz000001");
        assert_eq!(parsed.agents.len(), 1);
        assert!(parsed.position.is_some());
    }
}
