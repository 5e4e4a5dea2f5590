use serde_json::{json, Value};

use quorum_core::messages::{ContentPart, Message, Role};
use quorum_core::provider::LlmRequest;

/// Build the Anthropic Messages API request body from a canonical request.
pub fn build_request_body(
    request: &LlmRequest,
    model: &str,
    default_max_tokens: u32,
    stream: bool,
) -> Value {
    let mut body = json!({
        "model": model,
        "max_tokens": request.options.max_tokens.unwrap_or(default_max_tokens),
        "messages": wire_messages(&request.messages),
    });

    if stream {
        body["stream"] = json!(true);
    }
    if !request.system.is_empty() {
        body["system"] = json!(request.system);
    }
    if let Some(temp) = request.options.temperature {
        body["temperature"] = json!(temp);
    }
    if let Some(top_p) = request.options.top_p {
        body["top_p"] = json!(top_p);
    }
    if !request.options.stop_sequences.is_empty() {
        body["stop_sequences"] = json!(request.options.stop_sequences);
    }
    if !request.tools.is_empty() {
        let tools: Vec<Value> = request
            .tools
            .iter()
            .map(|t| {
                json!({
                    "name": t.name,
                    "description": t.description,
                    "input_schema": t.input_schema,
                })
            })
            .collect();
        body["tools"] = json!(tools);
    }

    body
}

/// Convert canonical messages to the wire message list.
///
/// The wire protocol forbids non-alternating roles, so consecutive messages
/// that map to the same wire role are concatenated into one wire message.
/// Block order is preserved and no content is dropped.
pub fn wire_messages(messages: &[Message]) -> Vec<Value> {
    let mut merged: Vec<(&'static str, Vec<Value>)> = Vec::new();

    for msg in messages {
        let role = wire_role(msg.role);
        let blocks = wire_blocks(&msg.parts);
        if blocks.is_empty() {
            continue;
        }
        match merged.last_mut() {
            Some((last_role, last_blocks)) if *last_role == role => {
                last_blocks.extend(blocks);
            }
            _ => merged.push((role, blocks)),
        }
    }

    merged
        .into_iter()
        .map(|(role, content)| json!({"role": role, "content": content}))
        .collect()
}

fn wire_role(role: Role) -> &'static str {
    match role {
        Role::Model => "assistant",
        Role::User => "user",
    }
}

fn wire_blocks(parts: &[ContentPart]) -> Vec<Value> {
    parts
        .iter()
        .map(|part| match part {
            ContentPart::Text { text } => json!({"type": "text", "text": text}),
            ContentPart::Thinking { text } => json!({"type": "thinking", "thinking": text}),
            ContentPart::ToolCall(tc) => json!({
                "type": "tool_use",
                "id": tc.id.as_str(),
                "name": tc.name,
                "input": tc.arguments,
            }),
            ContentPart::ToolResult { tool_call_id, result, is_error } => {
                let mut block = json!({
                    "type": "tool_result",
                    "tool_use_id": tool_call_id.as_str(),
                    "content": result.to_string(),
                });
                if *is_error {
                    block["is_error"] = json!(true);
                }
                block
            }
        })
        .collect()
}
