//! Collector wire types and batch planning.
//!
//! [`plan_batch`] is the ordering core of the protocol. It runs against a
//! copy of the session state and either rejects the whole batch or returns
//! a [`BatchPlan`] describing exactly what to apply; nothing is written
//! until the plan is handed to the pipeline.

use std::collections::{HashMap, HashSet};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use super::ProtocolError;
use crate::fingerprint::event_content_hash;
use crate::models::{
    CollectorSession, Event, EventType, FileChange, ParsedConversation, ParsedMessage,
    RecordedEvent,
};
use crate::parsers::{flatten_text, str_field};
use crate::pipeline::COLLECTOR_SOURCE;

// ═══════════════════════════════════════════════════════════════════════
// Wire types
// ═══════════════════════════════════════════════════════════════════════

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RegisterRequest {
    pub workspace_id: String,
    pub collector_type: String,
    pub version: String,
    pub hostname: String,
}

/// Returned once; the API key cannot be retrieved again.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RegisterResponse {
    pub collector_id: String,
    pub workspace_id: String,
    pub api_key: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SubmitRequest {
    pub session_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub workspace_id: Option<String>,
    pub events: Vec<Event>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SubmitResponse {
    pub session_id: String,
    /// Events that produced new content.
    pub accepted: usize,
    /// Events at the expected sequence whose content was already applied.
    pub duplicates: usize,
    /// Events already applied at their sequence, discarded.
    pub retransmitted: usize,
    pub last_sequence: i64,
    pub complete: bool,
    pub conversation_id: Option<String>,
    pub job_id: Option<String>,
}

/// Resumption answer for `GET /collectors/sessions/{session_id}`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionStatus {
    pub session_id: String,
    pub last_sequence: i64,
    pub complete: bool,
    pub conversation_id: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CollectorStatus {
    pub id: String,
    pub workspace_id: String,
    pub collector_type: String,
    pub version: String,
    pub hostname: String,
    pub created_at: DateTime<Utc>,
    pub last_seen_at: Option<DateTime<Utc>>,
    pub last_event_at: Option<DateTime<Utc>>,
}

// ═══════════════════════════════════════════════════════════════════════
// Planning
// ═══════════════════════════════════════════════════════════════════════

/// What a validated batch does to its session.
#[derive(Debug, Clone)]
pub struct BatchPlan {
    /// Session state once the batch is applied.
    pub session: CollectorSession,
    /// Events carrying new content, in sequence order.
    pub accepted: Vec<Event>,
    /// Every event that consumes a sequence number.
    pub recorded: Vec<RecordedEvent>,
    pub duplicates: usize,
    pub retransmitted: usize,
}

impl BatchPlan {
    /// Number of sequence numbers this batch consumes.
    pub fn consumed(&self) -> usize {
        self.recorded.len()
    }
}

/// Content hash of `event`, computing it when the client sent none.
pub fn content_hash(event: &Event) -> String {
    event
        .content_hash
        .clone()
        .unwrap_or_else(|| event_content_hash(event.event_type, &event.payload))
}

/// Validate `events` against `session` and decide what to apply.
///
/// * `recorded` holds stored events for sequence numbers behind the
///   session's expected sequence that appear in the batch.
/// * `known_hashes` holds the batch's content hashes already applied in the
///   session.
pub fn plan_batch(
    session: &CollectorSession,
    events: &[Event],
    recorded: &HashMap<i64, RecordedEvent>,
    known_hashes: &HashSet<String>,
) -> Result<BatchPlan, ProtocolError> {
    let mut next = session.clone();
    let mut plan_recorded: Vec<RecordedEvent> = Vec::new();
    let mut accepted = Vec::new();
    let mut seen: HashSet<String> = HashSet::new();
    let mut duplicates = 0;
    let mut retransmitted = 0;

    for event in events {
        if event.sequence < 1 {
            return Err(ProtocolError::BadRequest(format!(
                "sequence numbers start at 1, got {}",
                event.sequence
            )));
        }
        let hash = content_hash(event);

        if event.sequence < next.expected_sequence {
            let previous = recorded.get(&event.sequence).or_else(|| {
                plan_recorded
                    .iter()
                    .find(|r| r.sequence == event.sequence)
            });
            match previous {
                Some(r) if r.content_hash == hash => {
                    retransmitted += 1;
                    continue;
                }
                _ => {
                    return Err(ProtocolError::SequenceConflict {
                        sequence: event.sequence,
                    })
                }
            }
        }

        if next.complete {
            return Err(ProtocolError::SessionClosed {
                session_id: next.session_id.clone(),
            });
        }
        if event.sequence > next.expected_sequence {
            return Err(ProtocolError::SequenceGap {
                expected: next.expected_sequence,
                received: event.sequence,
            });
        }

        let duplicate = known_hashes.contains(&hash) || seen.contains(&hash);
        seen.insert(hash.clone());
        plan_recorded.push(RecordedEvent {
            sequence: event.sequence,
            event_type: event.event_type,
            content_hash: hash.clone(),
        });
        next.expected_sequence += 1;
        if event.event_type == EventType::SessionEnd {
            next.complete = true;
        }

        if duplicate {
            duplicates += 1;
        } else {
            accepted.push(Event {
                content_hash: Some(hash),
                ..event.clone()
            });
        }
    }

    next.updated_at = Utc::now();
    Ok(BatchPlan {
        session: next,
        accepted,
        recorded: plan_recorded,
        duplicates,
        retransmitted,
    })
}

// ═══════════════════════════════════════════════════════════════════════
// Event ↔ message mapping
// ═══════════════════════════════════════════════════════════════════════

fn payload_text(payload: &Value, keys: &[&str]) -> String {
    keys.iter()
        .find_map(|k| payload.get(*k))
        .map(flatten_text)
        .unwrap_or_else(|| match payload {
            Value::Null => String::new(),
            Value::String(s) => s.clone(),
            other => other.to_string(),
        })
}

/// Turn accepted events into messages. Indices start at 0.
pub fn events_to_conversation(events: &[Event]) -> ParsedConversation {
    let mut out = ParsedConversation::new(COLLECTOR_SOURCE);

    for event in events {
        let payload = &event.payload;
        let (role, content) = match event.event_type {
            EventType::SessionStart => {
                out.title = str_field(payload, "title").map(String::from);
                out.project_path = str_field(payload, "project_path")
                    .or_else(|| str_field(payload, "cwd"))
                    .map(String::from);
                continue;
            }
            EventType::SessionEnd => continue,
            EventType::Message => (
                str_field(payload, "role").unwrap_or("user").to_string(),
                payload_text(payload, &["content", "text"]),
            ),
            EventType::ToolCall => {
                let content = match str_field(payload, "name") {
                    Some(name) => serde_json::json!({
                        "name": name,
                        "input": payload.get("input").cloned().unwrap_or(Value::Null),
                    })
                    .to_string(),
                    None => payload.to_string(),
                };
                let file_path = payload
                    .get("input")
                    .and_then(|i| str_field(i, "file_path"))
                    .or_else(|| str_field(payload, "file_path"));
                if let Some(path) = file_path {
                    out.file_changes.push(FileChange {
                        message_index: out.messages.len() as i64,
                        path: path.to_string(),
                        change_kind: str_field(payload, "change_kind")
                            .unwrap_or("edit")
                            .to_string(),
                    });
                }
                ("tool_call".to_string(), content)
            }
            EventType::ToolResult => (
                "tool_result".to_string(),
                payload_text(payload, &["output", "content"]),
            ),
            EventType::Thinking => (
                "thinking".to_string(),
                payload_text(payload, &["content", "text"]),
            ),
            EventType::Error => (
                "error".to_string(),
                payload_text(payload, &["message", "content"]),
            ),
        };

        out.messages.push(ParsedMessage {
            index: out.messages.len() as i64,
            role,
            content,
            timestamp: event.timestamp,
        });
    }
    out
}

/// Turn a parsed log into a protocol event stream, sequence numbers from 1.
///
/// The stream opens with `session_start`; `close` appends `session_end`.
pub fn conversation_to_events(conversation: &ParsedConversation, close: bool) -> Vec<Event> {
    let mut events = Vec::with_capacity(conversation.messages.len() + 2);
    let mut push = |event_type: EventType, payload: Value, timestamp: Option<DateTime<Utc>>| {
        events.push(Event {
            event_type,
            sequence: events.len() as i64 + 1,
            content_hash: Some(event_content_hash(event_type, &payload)),
            payload,
            timestamp,
        });
    };

    push(
        EventType::SessionStart,
        serde_json::json!({
            "title": conversation.title,
            "project_path": conversation.project_path,
            "source": conversation.source,
            "external_id": conversation.external_id,
        }),
        conversation.started_at(),
    );

    for m in &conversation.messages {
        let (event_type, payload) = match m.role.as_str() {
            "tool_call" => {
                let mut payload = serde_json::from_str::<Value>(&m.content)
                    .ok()
                    .filter(|v| v.is_object())
                    .unwrap_or_else(|| serde_json::json!({ "content": m.content }));
                if let Some(fc) = conversation
                    .file_changes
                    .iter()
                    .find(|fc| fc.message_index == m.index)
                {
                    payload["file_path"] = Value::String(fc.path.clone());
                    payload["change_kind"] = Value::String(fc.change_kind.clone());
                }
                (EventType::ToolCall, payload)
            }
            "tool_result" => (
                EventType::ToolResult,
                serde_json::json!({ "output": m.content }),
            ),
            "thinking" => (
                EventType::Thinking,
                serde_json::json!({ "content": m.content }),
            ),
            "error" => (
                EventType::Error,
                serde_json::json!({ "message": m.content }),
            ),
            role => (
                EventType::Message,
                serde_json::json!({ "role": role, "content": m.content, "index": m.index }),
            ),
        };
        push(event_type, payload, m.timestamp);
    }

    if close {
        push(
            EventType::SessionEnd,
            serde_json::json!({}),
            conversation.ended_at(),
        );
    }
    events
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn event(seq: i64, event_type: EventType, payload: Value) -> Event {
        Event {
            event_type,
            sequence: seq,
            content_hash: None,
            payload,
            timestamp: None,
        }
    }

    fn msg(seq: i64, text: &str) -> Event {
        event(seq, EventType::Message, json!({"role": "user", "content": text}))
    }

    /// Plan against `session`, then fold the plan into the running state the
    /// way the store would.
    fn apply(
        session: &mut CollectorSession,
        history: &mut HashMap<i64, RecordedEvent>,
        events: &[Event],
    ) -> Result<BatchPlan, ProtocolError> {
        let known: HashSet<String> = history.values().map(|r| r.content_hash.clone()).collect();
        let plan = plan_batch(session, events, history, &known)?;
        for r in &plan.recorded {
            history.insert(r.sequence, r.clone());
        }
        *session = plan.session.clone();
        Ok(plan)
    }

    #[test]
    fn test_gap_rejects_whole_batch() {
        let session = CollectorSession::fresh("c", "s");
        let err = plan_batch(
            &session,
            &[msg(1, "a"), msg(2, "b"), msg(4, "d")],
            &HashMap::new(),
            &HashSet::new(),
        )
        .unwrap_err();
        match err {
            ProtocolError::SequenceGap { expected, received } => {
                assert_eq!(expected, 3);
                assert_eq!(received, 4);
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn test_retransmission_adds_nothing() {
        let mut session = CollectorSession::fresh("c", "s");
        let mut history = HashMap::new();
        let first = apply(&mut session, &mut history, &[msg(1, "a"), msg(2, "b"), msg(3, "c")]).unwrap();
        assert_eq!(first.accepted.len(), 3);
        assert_eq!(session.expected_sequence, 4);

        let again = apply(&mut session, &mut history, &[msg(2, "b"), msg(3, "c")]).unwrap();
        assert_eq!(again.consumed(), 0);
        assert_eq!(again.accepted.len(), 0);
        assert_eq!(again.retransmitted, 2);
        assert_eq!(session.expected_sequence, 4);
    }

    #[test]
    fn test_changed_content_behind_expected_conflicts() {
        let mut session = CollectorSession::fresh("c", "s");
        let mut history = HashMap::new();
        apply(&mut session, &mut history, &[msg(1, "a"), msg(2, "b")]).unwrap();
        let err = apply(&mut session, &mut history, &[msg(2, "changed")]).unwrap_err();
        assert!(matches!(err, ProtocolError::SequenceConflict { sequence: 2 }));
    }

    #[test]
    fn test_duplicate_content_consumes_sequence() {
        let mut session = CollectorSession::fresh("c", "s");
        let mut history = HashMap::new();
        apply(&mut session, &mut history, &[msg(1, "same")]).unwrap();
        let plan = apply(&mut session, &mut history, &[msg(2, "same"), msg(3, "new")]).unwrap();
        assert_eq!(plan.duplicates, 1);
        assert_eq!(plan.accepted.len(), 1);
        assert_eq!(plan.consumed(), 2);
        assert_eq!(session.expected_sequence, 4);
    }

    #[test]
    fn test_session_end_closes_session() {
        let mut session = CollectorSession::fresh("c", "s");
        let mut history = HashMap::new();
        apply(
            &mut session,
            &mut history,
            &[msg(1, "a"), event(2, EventType::SessionEnd, json!({}))],
        )
        .unwrap();
        assert!(session.complete);

        let err = apply(&mut session, &mut history, &[msg(3, "late")]).unwrap_err();
        assert!(matches!(err, ProtocolError::SessionClosed { .. }));

        // Resending the closing batch is still a harmless retransmission.
        let plan = apply(
            &mut session,
            &mut history,
            &[msg(1, "a"), event(2, EventType::SessionEnd, json!({}))],
        )
        .unwrap();
        assert_eq!(plan.retransmitted, 2);
    }

    #[test]
    fn test_rejection_leaves_state_untouched() {
        let session = CollectorSession::fresh("c", "s");
        let before = session.clone();
        let _ = plan_batch(&session, &[msg(1, "a"), msg(3, "c")], &HashMap::new(), &HashSet::new());
        assert_eq!(session, before);
    }

    #[test]
    fn test_zero_sequence_is_bad_request() {
        let session = CollectorSession::fresh("c", "s");
        let err = plan_batch(&session, &[msg(0, "a")], &HashMap::new(), &HashSet::new()).unwrap_err();
        assert!(matches!(err, ProtocolError::BadRequest(_)));
    }

    #[test]
    fn test_events_map_to_messages_and_file_changes() {
        let conv = events_to_conversation(&[
            event(1, EventType::SessionStart, json!({"title": "Fix CI", "cwd": "/repo"})),
            msg(2, "why red?"),
            event(3, EventType::ToolCall, json!({"name": "Edit", "input": {"file_path": "/repo/ci.yml"}})),
            event(4, EventType::ToolResult, json!({"output": "ok"})),
            event(5, EventType::Thinking, json!({"content": "hmm"})),
            event(6, EventType::Error, json!({"message": "rate limited"})),
            event(7, EventType::SessionEnd, json!({})),
        ]);
        assert_eq!(conv.title.as_deref(), Some("Fix CI"));
        assert_eq!(conv.project_path.as_deref(), Some("/repo"));
        let roles: Vec<&str> = conv.messages.iter().map(|m| m.role.as_str()).collect();
        assert_eq!(roles, vec!["user", "tool_call", "tool_result", "thinking", "error"]);
        assert_eq!(conv.file_changes.len(), 1);
        assert_eq!(conv.file_changes[0].message_index, 1);
        assert_eq!(conv.messages[2].content, "ok");
    }

    #[test]
    fn test_conversation_to_events_sequences_and_hashes() {
        let mut conv = ParsedConversation::new("chat-jsonl");
        conv.title = Some("t".to_string());
        conv.messages.push(ParsedMessage {
            index: 0,
            role: "user".to_string(),
            content: "hi".to_string(),
            timestamp: None,
        });
        let events = conversation_to_events(&conv, true);
        assert_eq!(
            events.iter().map(|e| e.sequence).collect::<Vec<_>>(),
            vec![1, 2, 3]
        );
        assert_eq!(events[0].event_type, EventType::SessionStart);
        assert_eq!(events[2].event_type, EventType::SessionEnd);
        assert!(events.iter().all(|e| e.content_hash.is_some()));

        let back = events_to_conversation(&events);
        assert_eq!(back.messages.len(), 1);
        assert_eq!(back.messages[0].content, "hi");
        assert_eq!(back.title.as_deref(), Some("t"));
    }
}
