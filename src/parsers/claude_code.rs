//! Claude Code session logs.
//!
//! Data format: JSONL files in `~/.claude/projects/<project>/<session_id>.jsonl`.
//! Each `user` / `assistant` record wraps an API message whose `content` is
//! either a string or an array of blocks (`text`, `thinking`, `tool_use`,
//! `tool_result`). Every block becomes its own message so tool traffic keeps
//! its position in the transcript.

use serde_json::Value;

use super::{flatten_text, parse_timestamp, str_field, truncate_title};
use crate::incremental::LineDecoder;
use crate::models::{FileChange, ParsedConversation, ParsedMessage};

/// Record types that carry no messages but are part of the format.
const METADATA_TYPES: &[&str] = &[
    "summary",
    "system",
    "queue-operation",
    "file-history-snapshot",
];

/// Tools whose `file_path` input modifies a file.
const FILE_TOOLS: &[(&str, &str)] = &[
    ("Write", "write"),
    ("Edit", "edit"),
    ("MultiEdit", "edit"),
    ("NotebookEdit", "notebook_edit"),
];

pub struct ClaudeCodeDecoder;

impl ClaudeCodeDecoder {
    fn push(
        out: &mut ParsedConversation,
        role: &str,
        content: String,
        record: &Value,
    ) -> i64 {
        let index = out.messages.len() as i64;
        out.messages.push(ParsedMessage {
            index,
            role: role.to_string(),
            content,
            timestamp: record.get("timestamp").and_then(parse_timestamp),
        });
        index
    }

    fn decode_block(out: &mut ParsedConversation, role: &str, block: &Value, record: &Value) {
        match str_field(block, "type") {
            Some("thinking") => {
                let text = str_field(block, "thinking").unwrap_or_default().to_string();
                Self::push(out, "thinking", text, record);
            }
            Some("tool_use") => {
                let name = str_field(block, "name").unwrap_or("unknown");
                let input = block.get("input").cloned().unwrap_or(Value::Null);
                let content = serde_json::json!({ "name": name, "input": input }).to_string();
                let index = Self::push(out, "tool_call", content, record);

                if let Some((_, kind)) = FILE_TOOLS.iter().find(|(tool, _)| *tool == name) {
                    let path = input
                        .get("file_path")
                        .or_else(|| input.get("notebook_path"))
                        .and_then(|v| v.as_str());
                    if let Some(path) = path {
                        out.file_changes.push(FileChange {
                            message_index: index,
                            path: path.to_string(),
                            change_kind: kind.to_string(),
                        });
                    }
                }
            }
            Some("tool_result") => {
                let text = block.get("content").map(flatten_text).unwrap_or_default();
                Self::push(out, "tool_result", text, record);
            }
            Some("image") => {
                Self::push(out, role, "[image]".to_string(), record);
            }
            _ => {
                let text = str_field(block, "text")
                    .map(String::from)
                    .unwrap_or_else(|| flatten_text(block));
                Self::push(out, role, text, record);
            }
        }
    }
}

impl LineDecoder for ClaudeCodeDecoder {
    fn name(&self) -> &str {
        "claude-code"
    }

    fn priority(&self) -> i32 {
        30
    }

    fn sniff(&self, record: &Value) -> bool {
        match str_field(record, "type") {
            Some("user") | Some("assistant") => {
                record.get("message").is_some() || record.get("sessionId").is_some()
            }
            Some(t) => {
                (METADATA_TYPES.contains(&t) && record.get("sessionId").is_some())
                    || (t == "summary" && record.get("leafUuid").is_some())
            }
            None => false,
        }
    }

    fn decode(&self, record: &Value, out: &mut ParsedConversation) -> bool {
        let Some(record_type) = str_field(record, "type") else {
            return false;
        };

        if out.external_id.is_none() {
            out.external_id = str_field(record, "sessionId").map(String::from);
        }
        if out.project_path.is_none() {
            out.project_path = str_field(record, "cwd").map(String::from);
        }

        match record_type {
            "user" | "assistant" => {
                let Some(message) = record.get("message") else {
                    return false;
                };
                let role = str_field(message, "role").unwrap_or(record_type);
                match message.get("content") {
                    Some(Value::String(text)) => {
                        if out.title.is_none() && role == "user" {
                            out.title = Some(truncate_title(text));
                        }
                        Self::push(out, role, text.clone(), record);
                    }
                    Some(Value::Array(blocks)) => {
                        if out.title.is_none() && role == "user" {
                            out.title = blocks
                                .iter()
                                .find(|b| str_field(b, "type") == Some("text"))
                                .and_then(|b| str_field(b, "text"))
                                .map(truncate_title);
                        }
                        for block in blocks {
                            Self::decode_block(out, role, block, record);
                        }
                    }
                    _ => return false,
                }
                true
            }
            "summary" => {
                if let Some(summary) = str_field(record, "summary") {
                    out.title = Some(truncate_title(summary));
                }
                true
            }
            other => METADATA_TYPES.contains(&other),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_string_content_message() {
        let mut out = ParsedConversation::new("claude-code");
        let rec = json!({
            "type": "user",
            "sessionId": "sess-1",
            "cwd": "/home/me/proj",
            "timestamp": "2025-03-01T10:00:00Z",
            "message": {"role": "user", "content": "Add a test"}
        });
        assert!(ClaudeCodeDecoder.decode(&rec, &mut out));
        assert_eq!(out.external_id.as_deref(), Some("sess-1"));
        assert_eq!(out.project_path.as_deref(), Some("/home/me/proj"));
        assert_eq!(out.title.as_deref(), Some("Add a test"));
        assert_eq!(out.messages.len(), 1);
        assert!(out.messages[0].timestamp.is_some());
    }

    #[test]
    fn test_blocks_split_into_messages_with_file_changes() {
        let mut out = ParsedConversation::new("claude-code");
        let rec = json!({
            "type": "assistant",
            "sessionId": "sess-1",
            "message": {"role": "assistant", "content": [
                {"type": "thinking", "thinking": "hmm"},
                {"type": "text", "text": "Writing it."},
                {"type": "tool_use", "id": "t1", "name": "Write", "input": {"file_path": "/p/a.rs", "content": "fn main(){}"}}
            ]}
        });
        assert!(ClaudeCodeDecoder.decode(&rec, &mut out));
        let roles: Vec<&str> = out.messages.iter().map(|m| m.role.as_str()).collect();
        assert_eq!(roles, vec!["thinking", "assistant", "tool_call"]);
        assert_eq!(out.file_changes.len(), 1);
        assert_eq!(out.file_changes[0].path, "/p/a.rs");
        assert_eq!(out.file_changes[0].message_index, 2);
        assert_eq!(out.file_changes[0].change_kind, "write");
    }

    #[test]
    fn test_tool_result_and_metadata_records() {
        let mut out = ParsedConversation::new("claude-code");
        let result = json!({
            "type": "user",
            "message": {"role": "user", "content": [
                {"type": "tool_result", "tool_use_id": "t1", "content": [{"type": "text", "text": "ok"}]}
            ]}
        });
        assert!(ClaudeCodeDecoder.decode(&result, &mut out));
        assert_eq!(out.messages[0].role, "tool_result");
        assert_eq!(out.messages[0].content, "ok");

        assert!(ClaudeCodeDecoder.decode(&json!({"type": "summary", "summary": "Refactor", "leafUuid": "x"}), &mut out));
        assert_eq!(out.title.as_deref(), Some("Refactor"));
        assert!(ClaudeCodeDecoder.decode(&json!({"type": "queue-operation", "sessionId": "s"}), &mut out));
        assert!(!ClaudeCodeDecoder.decode(&json!({"type": "mystery"}), &mut out));
        assert_eq!(out.messages.len(), 1);
    }

    #[test]
    fn test_sniff() {
        assert!(ClaudeCodeDecoder.sniff(&json!({"type": "user", "sessionId": "s", "message": {}})));
        assert!(ClaudeCodeDecoder.sniff(&json!({"type": "summary", "summary": "x", "leafUuid": "u"})));
        assert!(!ClaudeCodeDecoder.sniff(&json!({"role": "user", "content": "x"})));
        assert!(!ClaudeCodeDecoder.sniff(&json!({"type": "session_meta", "payload": {}})));
    }
}
