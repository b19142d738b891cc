//! Generic one-message-per-line logs.
//!
//! ```json
//! {"role": "user", "content": "hello", "timestamp": "2025-01-01T00:00:00Z", "session_id": "abc"}
//! ```

use serde_json::Value;

use super::{flatten_text, parse_timestamp, str_field, truncate_title};
use crate::incremental::LineDecoder;
use crate::models::{ParsedConversation, ParsedMessage};

pub struct ChatJsonlDecoder;

impl LineDecoder for ChatJsonlDecoder {
    fn name(&self) -> &str {
        "chat-jsonl"
    }

    fn priority(&self) -> i32 {
        10
    }

    fn sniff(&self, record: &Value) -> bool {
        str_field(record, "role").is_some() && record.get("content").is_some()
    }

    fn decode(&self, record: &Value, out: &mut ParsedConversation) -> bool {
        let Some(role) = str_field(record, "role") else {
            return false;
        };
        let Some(content) = record.get("content") else {
            return false;
        };

        if out.external_id.is_none() {
            out.external_id = str_field(record, "session_id").map(String::from);
        }
        let text = flatten_text(content);
        if out.title.is_none() && role == "user" && !text.trim().is_empty() {
            out.title = Some(truncate_title(&text));
        }

        out.messages.push(ParsedMessage {
            index: out.messages.len() as i64,
            role: role.to_string(),
            content: text,
            timestamp: record.get("timestamp").and_then(parse_timestamp),
        });
        true
    }
}
