//! Codex rollout logs.
//!
//! Every line is an envelope `{ "timestamp", "type", "payload" }`. The
//! `session_meta` envelope identifies the session; `response_item` envelopes
//! carry the transcript. `event_msg` and `turn_context` envelopes duplicate
//! UI state and are ignored.

use serde_json::Value;

use super::{flatten_text, parse_timestamp, str_field, truncate_title};
use crate::incremental::LineDecoder;
use crate::models::{ParsedConversation, ParsedMessage};

const ENVELOPE_TYPES: &[&str] = &["session_meta", "response_item", "event_msg", "turn_context"];

pub struct CodexDecoder;

fn push(out: &mut ParsedConversation, role: &str, content: String, envelope: &Value) {
    out.messages.push(ParsedMessage {
        index: out.messages.len() as i64,
        role: role.to_string(),
        content,
        timestamp: envelope.get("timestamp").and_then(parse_timestamp),
    });
}

impl LineDecoder for CodexDecoder {
    fn name(&self) -> &str {
        "codex"
    }

    fn priority(&self) -> i32 {
        20
    }

    fn sniff(&self, record: &Value) -> bool {
        str_field(record, "type")
            .map(|t| ENVELOPE_TYPES.contains(&t))
            .unwrap_or(false)
            && record.get("payload").is_some()
    }

    fn decode(&self, record: &Value, out: &mut ParsedConversation) -> bool {
        let (Some(kind), Some(payload)) = (str_field(record, "type"), record.get("payload")) else {
            return false;
        };

        match kind {
            "session_meta" => {
                if out.external_id.is_none() {
                    out.external_id = str_field(payload, "id").map(String::from);
                }
                if out.project_path.is_none() {
                    out.project_path = str_field(payload, "cwd").map(String::from);
                }
                true
            }
            "response_item" => {
                match str_field(payload, "type") {
                    Some("message") => {
                        let role = str_field(payload, "role").unwrap_or("assistant");
                        let text = payload.get("content").map(flatten_text).unwrap_or_default();
                        if out.title.is_none() && role == "user" && !text.trim().is_empty() {
                            out.title = Some(truncate_title(&text));
                        }
                        push(out, role, text, record);
                    }
                    Some("function_call") | Some("custom_tool_call") => {
                        let name = str_field(payload, "name").unwrap_or("unknown");
                        let args = payload
                            .get("arguments")
                            .or_else(|| payload.get("input"))
                            .cloned()
                            .unwrap_or(Value::Null);
                        let content = serde_json::json!({ "name": name, "input": args }).to_string();
                        push(out, "tool_call", content, record);
                    }
                    Some("function_call_output") | Some("custom_tool_call_output") => {
                        let output = payload.get("output").map(flatten_text).unwrap_or_default();
                        push(out, "tool_result", output, record);
                    }
                    Some("reasoning") => {
                        let text = payload.get("summary").map(flatten_text).unwrap_or_default();
                        push(out, "thinking", text, record);
                    }
                    _ => return false,
                }
                true
            }
            "event_msg" | "turn_context" => true,
            _ => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_rollout_transcript() {
        let mut out = ParsedConversation::new("codex");
        let records = [
            json!({"timestamp": "2025-05-01T12:00:00Z", "type": "session_meta", "payload": {"id": "r-1", "cwd": "/work"}}),
            json!({"type": "response_item", "payload": {"type": "message", "role": "user", "content": [{"type": "input_text", "text": "list files"}]}}),
            json!({"type": "response_item", "payload": {"type": "function_call", "name": "shell", "arguments": "{\"cmd\":[\"ls\"]}", "call_id": "c1"}}),
            json!({"type": "response_item", "payload": {"type": "function_call_output", "call_id": "c1", "output": "a\nb"}}),
            json!({"type": "response_item", "payload": {"type": "reasoning", "summary": [{"type": "summary_text", "text": "done"}]}}),
            json!({"type": "event_msg", "payload": {"type": "token_count"}}),
        ];
        for r in &records {
            assert!(CodexDecoder.decode(r, &mut out));
        }
        assert_eq!(out.external_id.as_deref(), Some("r-1"));
        assert_eq!(out.project_path.as_deref(), Some("/work"));
        assert_eq!(out.title.as_deref(), Some("list files"));
        let roles: Vec<&str> = out.messages.iter().map(|m| m.role.as_str()).collect();
        assert_eq!(roles, vec!["user", "tool_call", "tool_result", "thinking"]);
    }

    #[test]
    fn test_unknown_response_item_counted_as_skipped() {
        let mut out = ParsedConversation::new("codex");
        assert!(!CodexDecoder.decode(
            &json!({"type": "response_item", "payload": {"type": "web_search_call"}}),
            &mut out
        ));
    }
}
