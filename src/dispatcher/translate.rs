//! Pure translation of agent `session/update` variants into client-visible
//! update shapes (spec.md §4.5's translation table).

use serde_json::{json, Value};

/// Translate one `session/update` payload into `(translated_kind, value)`.
/// Unknown update kinds are forwarded with `kind = <raw>` and the original
/// fields preserved, rather than dropped.
pub fn translate_update(raw: &Value) -> (String, Value) {
    let kind = raw.get("sessionUpdate").and_then(|v| v.as_str()).unwrap_or("");

    match kind {
        "agent_message_chunk" => {
            let content = raw.get("content").cloned().unwrap_or(Value::Null);
            ("agent_message_chunk".to_string(), json!({ "content": content }))
        }
        "agent_thought_chunk" | "thought_chunk" => {
            let text = raw
                .get("content")
                .and_then(|c| c.get("text"))
                .cloned()
                .unwrap_or(Value::Null);
            ("thought_chunk".to_string(), json!({ "content": { "thought": text } }))
        }
        "tool_call" => {
            let tool_call_id = raw.get("toolCallId").cloned().unwrap_or(Value::Null);
            let tool_name = raw.get("toolName").cloned().unwrap_or(Value::Null);
            let arguments = raw.get("arguments").cloned().unwrap_or(Value::Null);
            let status = raw.get("status").cloned().unwrap_or_else(|| json!("pending"));
            (
                "tool_call".to_string(),
                json!({
                    "toolCall": {
                        "toolCallId": tool_call_id,
                        "toolName": tool_name,
                        "arguments": arguments,
                        "status": status,
                    }
                }),
            )
        }
        "tool_call_update" => {
            let tool_call_id = raw.get("toolCallId").cloned().unwrap_or(Value::Null);
            let status = raw.get("status").cloned().unwrap_or(Value::Null);
            let mut tool_call = serde_json::Map::new();
            tool_call.insert("toolCallId".to_string(), tool_call_id);
            tool_call.insert("status".to_string(), status.clone());
            if status.as_str() == Some("error") {
                tool_call.insert(
                    "error".to_string(),
                    raw.get("result").and_then(|r| r.get("error")).cloned().unwrap_or(Value::Null),
                );
            } else {
                tool_call.insert(
                    "output".to_string(),
                    raw.get("result").and_then(|r| r.get("content")).cloned().unwrap_or(Value::Null),
                );
            }
            ("tool_call_update".to_string(), json!({ "toolCall": Value::Object(tool_call) }))
        }
        "plan" => {
            let steps = raw.get("steps").cloned().unwrap_or_else(|| json!([]));
            ("plan".to_string(), json!({ "plan": { "steps": steps } }))
        }
        "available_commands" => ("available_commands".to_string(), raw.clone()),
        "current_mode_update" => ("current_mode_update".to_string(), raw.clone()),
        "config_options" => ("config_options".to_string(), raw.clone()),
        other => (other.to_string(), raw.clone()),
    }
}
