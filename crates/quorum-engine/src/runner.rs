use std::sync::Arc;

use serde_json::json;
use tracing::{instrument, warn};

use quorum_core::config::AgentProfile;
use quorum_core::deadline::DeadlineScope;
use quorum_core::events::ProgressEvent;
use quorum_core::messages::{Message, Role};
use quorum_core::provider::{GenerateOptions, LlmRequest, ModelHandle};
use quorum_core::request::{PositionContext, StockContext};
use quorum_llm::aggregator::{self, AggregatedEvent};

use crate::error::EngineError;
use crate::registry::ToolRegistry;

/// Callback receiving fine-grained progress for a live observer.
pub type ProgressSink = Arc<dyn Fn(ProgressEvent) + Send + Sync>;

const MAX_TOOL_ROUNDS: u32 = 8;

/// Everything one agent needs to speak once.
#[derive(Clone, Debug)]
pub struct RunInput {
    pub stock: StockContext,
    pub query: String,
    pub reply_content: Option<String>,
    pub position: Option<PositionContext>,
    /// Memory context plus prior speakers' remarks, already formatted.
    pub previous_discussion: String,
}

/// Drives one agent through a single bounded request/response round,
/// including any tool invocations the model requests along the way.
pub struct ExpertRunner {
    model: Arc<dyn ModelHandle>,
    registry: Arc<ToolRegistry>,
}

impl ExpertRunner {
    pub fn new(model: Arc<dyn ModelHandle>, registry: Arc<ToolRegistry>) -> Self {
        Self { model, registry }
    }

    /// Run one agent to completion within `scope`. Returns the assembled
    /// visible text; thinking content is never returned. A deadline hit
    /// surfaces as `EngineError::Timeout`, distinct from other failures.
    #[instrument(skip_all, fields(agent = %profile.id))]
    pub async fn run(
        &self,
        scope: &DeadlineScope,
        profile: &AgentProfile,
        input: &RunInput,
        progress: Option<&ProgressSink>,
    ) -> Result<String, EngineError> {
        let system = compose_system(profile, &input.stock, input.position.as_ref());
        let tools = self.registry.definitions_for(&profile.tools);

        let mut messages = vec![Message::user_text(compose_user(input))];
        let mut visible = String::new();

        for round in 0..MAX_TOOL_ROUNDS {
            scope.check()?;

            let request = LlmRequest {
                system: system.clone(),
                messages: messages.clone(),
                tools: tools.clone(),
                options: GenerateOptions::default(),
            };

            let stream = scope.bound(self.model.generate(&request, true)).await??;

            let before_len = visible.len();
            let response = scope
                .bound(aggregator::drain(stream, |event| match event {
                    AggregatedEvent::TextFragment(fragment) => {
                        visible.push_str(&fragment);
                        if let Some(sink) = progress {
                            sink(ProgressEvent::Streaming {
                                agent_id: profile.id.clone(),
                                agent_name: profile.name.clone(),
                                fragment,
                            });
                        }
                    }
                    AggregatedEvent::ToolCallStarted { name } => {
                        if let Some(sink) = progress {
                            sink(ProgressEvent::ToolCall {
                                agent_id: profile.id.clone(),
                                agent_name: profile.name.clone(),
                                tool: name,
                            });
                        }
                    }
                }))
                .await??;

            // No partial fragments this round: take the terminal payload's
            // text verbatim. Partial fragments win over a duplicate payload.
            if visible.len() == before_len {
                visible.push_str(&response.visible_text());
            }

            let tool_calls: Vec<_> = response.tool_calls().into_iter().cloned().collect();
            messages.push(Message { role: Role::Model, parts: response.parts });

            if tool_calls.is_empty() {
                return Ok(visible);
            }
            if round + 1 == MAX_TOOL_ROUNDS {
                warn!(agent = %profile.id, "tool round budget exhausted");
                return Ok(visible);
            }

            for call in tool_calls {
                scope.check()?;

                let (result, is_error) = match self.registry.resolve(&call.name) {
                    Some(invocable) => {
                        match scope.bound(invocable.invoke(call.arguments.clone())).await? {
                            Ok(value) => (value, false),
                            Err(e) => {
                                warn!(agent = %profile.id, tool = %call.name, error = %e, "tool failed");
                                (json!({"error": e.to_string()}), true)
                            }
                        }
                    }
                    None => {
                        warn!(agent = %profile.id, tool = %call.name, "unknown tool requested");
                        (json!({"error": format!("unknown tool: {}", call.name)}), true)
                    }
                };

                if let Some(sink) = progress {
                    sink(ProgressEvent::ToolResult {
                        agent_id: profile.id.clone(),
                        agent_name: profile.name.clone(),
                        tool: call.name.clone(),
                    });
                }

                messages.push(Message::tool_result(call.id, result, is_error));
            }
        }

        Ok(visible)
    }
}

fn compose_system(
    profile: &AgentProfile,
    stock: &StockContext,
    position: Option<&PositionContext>,
) -> String {
    let mut system = profile.instruction.clone();
    system.push_str(&format!(
        "\n\nStock under discussion: {} ({})",
        stock.name, stock.symbol
    ));
    if stock.price > 0.0 {
        system.push_str(&format!(
            ", last price {:.2} ({:+.2}% today)",
            stock.price, stock.change_percent
        ));
    }
    if let Some(position) = position {
        system.push_str(&format!(
            "\nThe user holds {:.0} shares at an average cost of {:.2}.",
            position.quantity, position.cost_price
        ));
    }
    system
}

fn compose_user(input: &RunInput) -> String {
    let mut text = String::new();
    if !input.previous_discussion.is_empty() {
        text.push_str(&input.previous_discussion);
        text.push('\n');
    }
    if let Some(reply) = input.reply_content.as_deref() {
        if !reply.is_empty() {
            text.push_str(&format!("Quoted message:\n{reply}\n\n"));
        }
    }
    text.push_str(&input.query);
    text
}
