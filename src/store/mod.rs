//! Persistence gateway.
//!
//! The [`Store`] trait is everything the pipeline, scheduler and collector
//! protocol need from durable storage. Conversation writes go through a
//! single [`Store::persist`] call per job so that a batch's messages, file
//! changes, checkpoint and session advance land together or not at all.
//!
//! Implementations must be `Send + Sync` to be shared across tokio tasks.
//!
//! | Implementation | Use |
//! |----------------|-----|
//! | [`SqliteStore`] | Production (sqlx, one transaction per `persist`) |
//! | [`InMemoryStore`] | Tests (one write lock per `persist`) |

pub mod memory;
pub mod sqlite;

pub use memory::InMemoryStore;
pub use sqlite::SqliteStore;

use anyhow::Result;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::collections::HashSet;
use std::path::Path;

use crate::models::{
    Collector, CollectorSession, ConversationRecord, FileChange, IngestionJob, JobStatus,
    MessageRecord, ParseCheckpoint, ParsedMessage, RecordedEvent, WatchConfiguration,
};

/// Header of a conversation about to be created (or re-created by replace).
#[derive(Debug, Clone)]
pub struct NewConversation {
    pub id: String,
    pub source: String,
    pub external_id: String,
    pub title: Option<String>,
    pub project_path: Option<String>,
    pub needs_tagging: bool,
}

/// What a [`PersistBatch`] does to the conversation it targets.
#[derive(Debug, Clone)]
pub enum PersistAction {
    /// Insert a new conversation.
    Create(NewConversation),
    /// Swap the messages and header of an existing conversation (same id).
    Replace(NewConversation),
    /// Add messages to an existing conversation.
    Append { conversation_id: String },
}

impl PersistAction {
    pub fn conversation_id(&self) -> &str {
        match self {
            PersistAction::Create(c) | PersistAction::Replace(c) => &c.id,
            PersistAction::Append { conversation_id } => conversation_id,
        }
    }
}

/// Advance of a collector session written with its messages.
#[derive(Debug, Clone)]
pub struct SessionUpdate {
    /// Session state after the batch.
    pub session: CollectorSession,
    /// Events consumed by the batch, including duplicate-content ones.
    pub events: Vec<RecordedEvent>,
}

/// All effects of one job, applied atomically.
#[derive(Debug, Clone)]
pub struct PersistBatch {
    pub action: PersistAction,
    /// Messages with their final (absolute) indices.
    pub messages: Vec<ParsedMessage>,
    /// File changes keyed by absolute message index.
    pub file_changes: Vec<FileChange>,
    /// Conversation fingerprint after the batch.
    pub fingerprint: String,
    pub checkpoint: Option<ParseCheckpoint>,
    pub session: Option<SessionUpdate>,
}

/// Filter for [`Store::list_jobs`].
#[derive(Debug, Clone, Default)]
pub struct JobFilter {
    pub status: Option<JobStatus>,
    pub watch_config_id: Option<String>,
    pub limit: Option<i64>,
}

#[async_trait]
pub trait Store: Send + Sync {
    // ── Conversations ───────────────────────────────────────────────

    async fn find_conversation(
        &self,
        source: &str,
        external_id: &str,
    ) -> Result<Option<ConversationRecord>>;

    async fn get_conversation(&self, id: &str) -> Result<Option<ConversationRecord>>;

    async fn list_messages(&self, conversation_id: &str) -> Result<Vec<MessageRecord>>;

    async fn list_file_changes(&self, conversation_id: &str) -> Result<Vec<FileChange>>;

    /// Apply every effect of `batch` in one transaction. Returns the
    /// conversation id.
    async fn persist(&self, batch: PersistBatch) -> Result<String>;

    // ── Checkpoints ─────────────────────────────────────────────────

    async fn load_checkpoint(&self, path: &Path) -> Result<Option<ParseCheckpoint>>;

    async fn save_checkpoint(&self, checkpoint: &ParseCheckpoint) -> Result<()>;

    async fn list_checkpoints(&self) -> Result<Vec<ParseCheckpoint>>;

    // ── Jobs ────────────────────────────────────────────────────────

    async fn insert_job(&self, job: &IngestionJob) -> Result<()>;

    /// Overwrite a non-terminal job. Terminal jobs are immutable.
    async fn update_job(&self, job: &IngestionJob) -> Result<()>;

    async fn get_job(&self, id: &str) -> Result<Option<IngestionJob>>;

    /// Most recent first.
    async fn list_jobs(&self, filter: &JobFilter) -> Result<Vec<IngestionJob>>;

    // ── Watch configurations ────────────────────────────────────────

    async fn insert_watch_config(&self, config: &WatchConfiguration) -> Result<()>;

    async fn get_watch_config(&self, id: &str) -> Result<Option<WatchConfiguration>>;

    async fn list_watch_configs(&self) -> Result<Vec<WatchConfiguration>>;

    /// Flip the activation flag, stamping `last_started_at` / `last_stopped_at`.
    async fn set_watch_active(&self, id: &str, active: bool, at: DateTime<Utc>) -> Result<()>;

    async fn record_watch_error(&self, id: &str, message: &str) -> Result<()>;

    /// Fold a finished job into the configuration's aggregate stats.
    async fn record_watch_job(&self, id: &str, status: JobStatus, messages_added: i64)
        -> Result<()>;

    /// Delete an inactive configuration. Returns `false` when it is active
    /// or does not exist.
    async fn delete_watch_config(&self, id: &str) -> Result<bool>;

    // ── Collectors ──────────────────────────────────────────────────

    async fn insert_collector(&self, collector: &Collector) -> Result<()>;

    async fn get_collector(&self, id: &str) -> Result<Option<Collector>>;

    async fn touch_collector(
        &self,
        id: &str,
        seen_at: DateTime<Utc>,
        event_at: Option<DateTime<Utc>>,
    ) -> Result<()>;

    async fn get_session(
        &self,
        collector_id: &str,
        session_id: &str,
    ) -> Result<Option<CollectorSession>>;

    /// Recorded events of a session at the given sequence numbers.
    async fn recorded_events(
        &self,
        collector_id: &str,
        session_id: &str,
        sequences: &[i64],
    ) -> Result<Vec<RecordedEvent>>;

    /// The subset of `hashes` already applied in the session.
    async fn known_event_hashes(
        &self,
        collector_id: &str,
        session_id: &str,
        hashes: &[String],
    ) -> Result<HashSet<String>>;
}

pub(crate) fn to_millis(ts: DateTime<Utc>) -> i64 {
    ts.timestamp_millis()
}

pub(crate) fn from_millis(ms: i64) -> DateTime<Utc> {
    DateTime::from_timestamp_millis(ms).unwrap_or_default()
}
