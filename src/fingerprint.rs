//! Content hashing.
//!
//! Messages hash individually; a conversation fingerprint chains the message
//! hashes in order, so extending a fingerprint with appended messages yields
//! the same value as fingerprinting the whole sequence at once.

use sha2::{Digest, Sha256};

use crate::models::{EventType, ParsedMessage};

/// Fingerprint of an empty conversation.
pub fn empty_fingerprint() -> String {
    format!("{:x}", Sha256::digest(b""))
}

pub fn message_hash(message: &ParsedMessage) -> String {
    let mut hasher = Sha256::new();
    hasher.update(message.role.as_bytes());
    hasher.update([0u8]);
    hasher.update(message.content.as_bytes());
    hasher.update([0u8]);
    if let Some(ts) = message.timestamp {
        hasher.update(ts.timestamp_millis().to_le_bytes());
    }
    format!("{:x}", hasher.finalize())
}

/// Extend `previous` with `messages`, in order.
pub fn extend_fingerprint(previous: &str, messages: &[ParsedMessage]) -> String {
    messages.iter().fold(previous.to_string(), |acc, m| {
        let mut hasher = Sha256::new();
        hasher.update(acc.as_bytes());
        hasher.update(message_hash(m).as_bytes());
        format!("{:x}", hasher.finalize())
    })
}

pub fn conversation_fingerprint(messages: &[ParsedMessage]) -> String {
    extend_fingerprint(&empty_fingerprint(), messages)
}

/// Hash used to detect retransmitted collector events.
///
/// `serde_json::Value` objects serialize with sorted keys, so logically equal
/// payloads hash equally.
pub fn event_content_hash(event_type: EventType, payload: &serde_json::Value) -> String {
    let canonical = serde_json::json!({
        "event_type": event_type.as_str(),
        "payload": payload,
    });
    format!("{:x}", Sha256::digest(canonical.to_string().as_bytes()))
}

pub fn sha256_hex(bytes: &[u8]) -> String {
    format!("{:x}", Sha256::digest(bytes))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn msg(index: i64, role: &str, content: &str) -> ParsedMessage {
        ParsedMessage {
            index,
            role: role.to_string(),
            content: content.to_string(),
            timestamp: None,
        }
    }

    #[test]
    fn test_chained_fingerprint_matches_full() {
        let all = vec![msg(0, "user", "a"), msg(1, "assistant", "b"), msg(2, "user", "c")];
        let partial = conversation_fingerprint(&all[..1]);
        let extended = extend_fingerprint(&partial, &all[1..]);
        assert_eq!(extended, conversation_fingerprint(&all));
    }

    #[test]
    fn test_fingerprint_is_order_sensitive() {
        let a = vec![msg(0, "user", "a"), msg(1, "user", "b")];
        let b = vec![msg(0, "user", "b"), msg(1, "user", "a")];
        assert_ne!(conversation_fingerprint(&a), conversation_fingerprint(&b));
    }

    #[test]
    fn test_role_content_boundary() {
        assert_ne!(
            message_hash(&msg(0, "us", "erx")),
            message_hash(&msg(0, "user", "x"))
        );
    }

    #[test]
    fn test_event_hash_ignores_key_order() {
        let p1: serde_json::Value = serde_json::from_str(r#"{"a":1,"b":2}"#).unwrap();
        let p2: serde_json::Value = serde_json::from_str(r#"{"b":2,"a":1}"#).unwrap();
        assert_eq!(
            event_content_hash(EventType::Message, &p1),
            event_content_hash(EventType::Message, &p2)
        );
        assert_ne!(
            event_content_hash(EventType::Message, &p1),
            event_content_hash(EventType::Thinking, &p1)
        );
    }
}
