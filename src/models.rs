//! Core data models used throughout the ingestion pipeline.
//!
//! Transient parser output ([`ParsedConversation`], [`ParsedMessage`]) is
//! kept separate from the durable records the [`Store`](crate::store::Store)
//! writes. Job, checkpoint, watch and collector records are what the CLI and
//! HTTP layers read back.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;

// ═══════════════════════════════════════════════════════════════════════
// Parser output
// ═══════════════════════════════════════════════════════════════════════

/// One message decoded from a log record or collector event.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ParsedMessage {
    /// Position within the parse result, starting at 0.
    pub index: i64,
    pub role: String,
    pub content: String,
    pub timestamp: Option<DateTime<Utc>>,
}

/// A file touched by a tool call inside a conversation.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct FileChange {
    /// Index of the message that carried the tool call.
    pub message_index: i64,
    pub path: String,
    /// `write`, `edit`, `notebook_edit`, ... as reported by the agent.
    pub change_kind: String,
}

/// In-memory result of parsing a log file (full or incremental pass).
#[derive(Debug, Clone, Default)]
pub struct ParsedConversation {
    /// Parser name, also used as the conversation's source.
    pub source: String,
    /// Agent-side session identifier, when the log carries one.
    pub external_id: Option<String>,
    pub title: Option<String>,
    pub project_path: Option<String>,
    pub messages: Vec<ParsedMessage>,
    pub file_changes: Vec<FileChange>,
    /// Records that could not be decoded and were skipped.
    pub skipped_records: u64,
}

impl ParsedConversation {
    pub fn new(source: &str) -> Self {
        Self {
            source: source.to_string(),
            ..Default::default()
        }
    }

    pub fn started_at(&self) -> Option<DateTime<Utc>> {
        self.messages.iter().find_map(|m| m.timestamp)
    }

    pub fn ended_at(&self) -> Option<DateTime<Utc>> {
        self.messages.iter().rev().find_map(|m| m.timestamp)
    }
}

// ═══════════════════════════════════════════════════════════════════════
// Checkpoints
// ═══════════════════════════════════════════════════════════════════════

/// Durable per-file state for incremental re-parsing.
///
/// `offset` never exceeds the file size observed when it was written, and
/// `partial_hash` is recomputed every time `offset` moves.
#[derive(Debug, Clone, PartialEq)]
pub struct ParseCheckpoint {
    pub path: PathBuf,
    pub offset: u64,
    pub line_number: u64,
    pub file_size: u64,
    pub partial_hash: String,
    /// Conversation this file feeds, once the first pass has been persisted.
    pub conversation_id: Option<String>,
    pub updated_at: DateTime<Utc>,
}

impl ParseCheckpoint {
    /// Checkpoint positioned at the start of `path`.
    pub fn start(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            offset: 0,
            line_number: 0,
            file_size: 0,
            partial_hash: String::new(),
            conversation_id: None,
            updated_at: Utc::now(),
        }
    }

    pub fn is_fresh(&self) -> bool {
        self.offset == 0
    }
}

// ═══════════════════════════════════════════════════════════════════════
// Jobs
// ═══════════════════════════════════════════════════════════════════════

/// Where a unit of ingestion work came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SourceKind {
    Watch,
    Upload,
    Collector,
}

/// Job lifecycle: `pending → processing → {success | failed | duplicate | skipped}`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JobStatus {
    Pending,
    Processing,
    Success,
    Failed,
    Duplicate,
    Skipped,
}

impl JobStatus {
    pub fn is_terminal(self) -> bool {
        !matches!(self, JobStatus::Pending | JobStatus::Processing)
    }
}

/// Pipeline stage, used to tag failures and timings.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Stage {
    Parse,
    Dedup,
    Persist,
}

macro_rules! str_enum {
    ($ty:ident { $($variant:ident => $s:literal),+ $(,)? }) => {
        impl $ty {
            pub fn as_str(&self) -> &'static str {
                match self {
                    $($ty::$variant => $s),+
                }
            }
        }

        impl fmt::Display for $ty {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(self.as_str())
            }
        }

        impl FromStr for $ty {
            type Err = anyhow::Error;

            fn from_str(s: &str) -> Result<Self, Self::Err> {
                match s {
                    $($s => Ok($ty::$variant),)+
                    other => anyhow::bail!("unknown {}: '{}'", stringify!($ty), other),
                }
            }
        }
    };
}

str_enum!(SourceKind { Watch => "watch", Upload => "upload", Collector => "collector" });
str_enum!(JobStatus {
    Pending => "pending",
    Processing => "processing",
    Success => "success",
    Failed => "failed",
    Duplicate => "duplicate",
    Skipped => "skipped",
});
str_enum!(Stage { Parse => "parse", Dedup => "dedup", Persist => "persist" });
str_enum!(UpdateMode { Skip => "skip", Replace => "replace", Append => "append" });

/// Wall-clock time spent in each stage, in milliseconds.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct StageTimings {
    pub queue_ms: i64,
    pub parse_ms: i64,
    pub dedup_ms: i64,
    pub persist_ms: i64,
}

impl StageTimings {
    pub fn total_ms(&self) -> i64 {
        self.queue_ms + self.parse_ms + self.dedup_ms + self.persist_ms
    }
}

/// One attempt to ingest a single file or event batch.
#[derive(Debug, Clone, Serialize)]
pub struct IngestionJob {
    pub id: String,
    pub source_kind: SourceKind,
    /// File path, or `collector_id/session_id` for collector batches.
    pub source_ref: String,
    pub status: JobStatus,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
    pub timings: StageTimings,
    pub error_stage: Option<Stage>,
    pub error: Option<String>,
    pub incremental: bool,
    pub messages_added: i64,
    pub records_skipped: i64,
    pub conversation_id: Option<String>,
    pub watch_config_id: Option<String>,
}

impl IngestionJob {
    pub fn pending(source_kind: SourceKind, source_ref: impl Into<String>) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            source_kind,
            source_ref: source_ref.into(),
            status: JobStatus::Pending,
            created_at: Utc::now(),
            started_at: None,
            finished_at: None,
            timings: StageTimings::default(),
            error_stage: None,
            error: None,
            incremental: false,
            messages_added: 0,
            records_skipped: 0,
            conversation_id: None,
            watch_config_id: None,
        }
    }
}

// ═══════════════════════════════════════════════════════════════════════
// Conversations
// ═══════════════════════════════════════════════════════════════════════

/// What to do when a conversation with the same external id already exists.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum UpdateMode {
    /// Leave existing data untouched.
    #[default]
    Skip,
    /// Swap the stored conversation for the new parse, atomically.
    Replace,
    /// Add only messages with indices beyond what is stored.
    Append,
}

/// Stored conversation header, as read back from the store.
#[derive(Debug, Clone, Serialize)]
pub struct ConversationRecord {
    pub id: String,
    pub source: String,
    pub external_id: String,
    pub title: Option<String>,
    pub project_path: Option<String>,
    pub message_count: i64,
    pub fingerprint: String,
    pub needs_tagging: bool,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Stored message, as read back from the store.
#[derive(Debug, Clone, Serialize)]
pub struct MessageRecord {
    pub conversation_id: String,
    pub index: i64,
    pub role: String,
    pub content: String,
    pub timestamp: Option<DateTime<Utc>>,
}

// ═══════════════════════════════════════════════════════════════════════
// Watch configurations
// ═══════════════════════════════════════════════════════════════════════

#[derive(Debug, Clone, Serialize)]
pub struct WatchConfiguration {
    pub id: String,
    pub path: PathBuf,
    pub active: bool,
    /// Flag new conversations for the downstream tagger.
    pub auto_tag: bool,
    pub last_started_at: Option<DateTime<Utc>>,
    pub last_stopped_at: Option<DateTime<Utc>>,
    pub error_count: i64,
    pub last_error: Option<String>,
    pub files_ingested: i64,
    pub messages_ingested: i64,
    pub created_at: DateTime<Utc>,
}

impl WatchConfiguration {
    pub fn new(path: impl Into<PathBuf>, auto_tag: bool) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            path: path.into(),
            active: false,
            auto_tag,
            last_started_at: None,
            last_stopped_at: None,
            error_count: 0,
            last_error: None,
            files_ingested: 0,
            messages_ingested: 0,
            created_at: Utc::now(),
        }
    }
}

// ═══════════════════════════════════════════════════════════════════════
// Collectors
// ═══════════════════════════════════════════════════════════════════════

/// A registered remote agent. The API key itself is never stored.
#[derive(Debug, Clone, Serialize)]
pub struct Collector {
    pub id: String,
    pub workspace_id: String,
    pub collector_type: String,
    pub version: String,
    pub hostname: String,
    #[serde(skip)]
    pub key_salt: String,
    #[serde(skip)]
    pub key_hash: String,
    pub created_at: DateTime<Utc>,
    pub last_seen_at: Option<DateTime<Utc>>,
    pub last_event_at: Option<DateTime<Utc>>,
}

/// Server-side state of one collector session.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CollectorSession {
    pub collector_id: String,
    pub session_id: String,
    pub conversation_id: String,
    /// Next sequence number the session will accept; starts at 1.
    pub expected_sequence: i64,
    pub complete: bool,
    pub updated_at: DateTime<Utc>,
}

impl CollectorSession {
    pub fn fresh(collector_id: &str, session_id: &str) -> Self {
        Self {
            collector_id: collector_id.to_string(),
            session_id: session_id.to_string(),
            conversation_id: uuid::Uuid::new_v4().to_string(),
            expected_sequence: 1,
            complete: false,
            updated_at: Utc::now(),
        }
    }

    /// Last sequence number applied, 0 when nothing has been accepted yet.
    pub fn last_sequence(&self) -> i64 {
        self.expected_sequence - 1
    }
}

/// Protocol event types pushed by collectors.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventType {
    SessionStart,
    Message,
    ToolCall,
    ToolResult,
    Thinking,
    Error,
    SessionEnd,
}

str_enum!(EventType {
    SessionStart => "session_start",
    Message => "message",
    ToolCall => "tool_call",
    ToolResult => "tool_result",
    Thinking => "thinking",
    Error => "error",
    SessionEnd => "session_end",
});

/// One protocol event as received from a collector.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Event {
    pub event_type: EventType,
    pub sequence: i64,
    /// Client-computed hash; filled in server-side when absent.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub content_hash: Option<String>,
    #[serde(default)]
    pub payload: serde_json::Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timestamp: Option<DateTime<Utc>>,
}

/// An applied event, as recorded for retransmission checks.
#[derive(Debug, Clone, PartialEq)]
pub struct RecordedEvent {
    pub sequence: i64,
    pub event_type: EventType,
    pub content_hash: String,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_enum_round_trip_strings() {
        assert_eq!("duplicate".parse::<JobStatus>().unwrap(), JobStatus::Duplicate);
        assert_eq!(Stage::Persist.to_string(), "persist");
        assert_eq!("tool_call".parse::<EventType>().unwrap(), EventType::ToolCall);
        assert!("bogus".parse::<UpdateMode>().is_err());
    }

    #[test]
    fn test_terminal_statuses() {
        assert!(!JobStatus::Pending.is_terminal());
        assert!(!JobStatus::Processing.is_terminal());
        assert!(JobStatus::Skipped.is_terminal());
        assert!(JobStatus::Duplicate.is_terminal());
    }

    #[test]
    fn test_event_deserializes_without_hash() {
        let ev: Event = serde_json::from_str(
            r#"{"event_type":"session_start","sequence":1,"payload":{"title":"x"}}"#,
        )
        .unwrap();
        assert_eq!(ev.event_type, EventType::SessionStart);
        assert!(ev.content_hash.is_none());
    }

    #[test]
    fn test_fresh_session_expects_one() {
        let s = CollectorSession::fresh("c", "s");
        assert_eq!(s.expected_sequence, 1);
        assert_eq!(s.last_sequence(), 0);
    }
}
