//! Ingestion pipeline: parse → deduplicate → persist.
//!
//! Both producers of work feed this module: the watch scheduler (and the
//! `ingest` command) through [`IngestionPipeline::ingest_file`], and the
//! collector protocol handler through [`IngestionPipeline::ingest_events`].
//! Every call records one [`IngestionJob`] with per-stage timings and a
//! terminal status.
//!
//! # Update modes
//!
//! When a fresh parse produces a conversation whose `(source, external_id)`
//! already exists with a different fingerprint, [`UpdateMode`] decides:
//!
//! | Mode | Effect |
//! |------|--------|
//! | `skip` | Leave the stored conversation untouched (job `skipped`) |
//! | `replace` | Swap header and messages in one transaction |
//! | `append` | Store only messages with indices beyond the stored count |
//!
//! Incremental passes that resume from a checkpoint always append.
//!
//! # Serialization
//!
//! A file job holds the `file:` lock for its whole run and the
//! `conversation:` lock around dedup and persist. Collector batches arrive
//! already holding their `session:` lock.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Instant;

use anyhow::Result;
use chrono::Utc;

use crate::collector::protocol::{events_to_conversation, BatchPlan};
use crate::config::IngestSettings;
use crate::error::IngestError;
use crate::fingerprint::{conversation_fingerprint, empty_fingerprint, extend_fingerprint};
use crate::locks::{conversation_key, file_key, session_key, KeyGuard, KeyedLocks};
use crate::models::{
    CollectorSession, FileChange, IngestionJob, JobStatus, ParseCheckpoint, ParsedConversation,
    ParsedMessage, SourceKind, UpdateMode, WatchConfiguration,
};
use crate::parsers::{LogParser, ParserRegistry};
use crate::store::{NewConversation, PersistAction, PersistBatch, SessionUpdate, Store};

/// Conversation source recorded for collector sessions.
pub const COLLECTOR_SOURCE: &str = "collector";

/// One file to ingest.
#[derive(Debug, Clone)]
pub struct FileRequest {
    pub path: PathBuf,
    pub source_kind: SourceKind,
    pub update_mode: UpdateMode,
    pub watch_config_id: Option<String>,
    pub auto_tag: bool,
    pub enqueued_at: Instant,
}

impl FileRequest {
    /// A one-shot upload; always a full parse.
    pub fn upload(path: impl Into<PathBuf>, update_mode: UpdateMode) -> Self {
        Self {
            path: path.into(),
            source_kind: SourceKind::Upload,
            update_mode,
            watch_config_id: None,
            auto_tag: false,
            enqueued_at: Instant::now(),
        }
    }

    /// A file observed by a watch configuration.
    pub fn watched(
        path: impl Into<PathBuf>,
        config: &WatchConfiguration,
        update_mode: UpdateMode,
    ) -> Self {
        Self {
            path: path.into(),
            source_kind: SourceKind::Watch,
            update_mode,
            watch_config_id: Some(config.id.clone()),
            auto_tag: config.auto_tag,
            enqueued_at: Instant::now(),
        }
    }
}

/// An accepted collector batch, planned and ready to apply.
#[derive(Debug, Clone)]
pub struct EventBatch {
    pub collector_id: String,
    pub session_id: String,
    /// Session as stored before the batch; `None` for a new session.
    pub stored: Option<CollectorSession>,
    pub plan: BatchPlan,
    pub received_at: Instant,
    /// Time spent on sequence and content-hash checks.
    pub dedup_ms: i64,
}

/// How a job ended when it did not fail.
#[derive(Debug)]
struct Outcome {
    status: JobStatus,
    conversation_id: Option<String>,
    messages_added: i64,
    note: Option<String>,
}

impl Outcome {
    fn success(conversation_id: String, messages_added: usize) -> Self {
        Self {
            status: JobStatus::Success,
            conversation_id: Some(conversation_id),
            messages_added: messages_added as i64,
            note: None,
        }
    }

    fn duplicate(conversation_id: Option<String>) -> Self {
        Self {
            status: JobStatus::Duplicate,
            conversation_id,
            messages_added: 0,
            note: None,
        }
    }

    fn skipped(conversation_id: Option<String>, note: &str) -> Self {
        Self {
            status: JobStatus::Skipped,
            conversation_id,
            messages_added: 0,
            note: Some(note.to_string()),
        }
    }
}

/// Output of the parse stage for a file.
struct ParsePass {
    conversation: ParsedConversation,
    checkpoint: Option<ParseCheckpoint>,
    /// Conversation this pass continues, when it resumed from a checkpoint.
    resumes: Option<String>,
    /// Offset the pass started from.
    start_offset: u64,
}

fn elapsed_ms(since: Instant) -> i64 {
    since.elapsed().as_millis() as i64
}

/// Shift message indices so the batch follows `base` stored messages.
fn renumber(
    messages: Vec<ParsedMessage>,
    file_changes: Vec<FileChange>,
    base: i64,
) -> (Vec<ParsedMessage>, Vec<FileChange>) {
    let messages = messages
        .into_iter()
        .map(|m| ParsedMessage {
            index: m.index + base,
            ..m
        })
        .collect();
    let file_changes = file_changes
        .into_iter()
        .map(|fc| FileChange {
            message_index: fc.message_index + base,
            ..fc
        })
        .collect();
    (messages, file_changes)
}

/// Run a parser on the blocking pool.
async fn parse_blocking(
    parser: Arc<dyn LogParser>,
    path: &Path,
    checkpoint: Option<ParseCheckpoint>,
) -> Result<ParsePass, IngestError> {
    let owned = path.to_path_buf();
    let joined = tokio::task::spawn_blocking(move || -> Result<ParsePass, IngestError> {
        match checkpoint {
            Some(cp) => {
                let pass = parser.parse_incremental(&owned, &cp)?;
                let resumes = if pass.reset || cp.is_fresh() {
                    None
                } else {
                    cp.conversation_id.clone()
                };
                Ok(ParsePass {
                    conversation: pass.conversation,
                    checkpoint: Some(pass.checkpoint),
                    resumes,
                    start_offset: if pass.reset { 0 } else { cp.offset },
                })
            }
            None => Ok(ParsePass {
                conversation: parser.parse(&owned)?,
                checkpoint: None,
                resumes: None,
                start_offset: 0,
            }),
        }
    })
    .await;
    joined.map_err(|e| IngestError::Parse(format!("parser task failed: {}", e)))?
}

#[derive(Clone)]
pub struct IngestionPipeline {
    store: Arc<dyn Store>,
    registry: ParserRegistry,
    settings: IngestSettings,
    locks: KeyedLocks,
}

impl IngestionPipeline {
    pub fn new(store: Arc<dyn Store>, registry: ParserRegistry, settings: IngestSettings) -> Self {
        Self {
            store,
            registry,
            settings,
            locks: KeyedLocks::new(),
        }
    }

    pub fn store(&self) -> &Arc<dyn Store> {
        &self.store
    }

    pub fn registry(&self) -> &ParserRegistry {
        &self.registry
    }

    pub fn settings(&self) -> &IngestSettings {
        &self.settings
    }

    pub fn locks(&self) -> &KeyedLocks {
        &self.locks
    }

    /// Ingest one file end to end. Per-job failures are recorded on the
    /// returned job; `Err` means the job record itself could not be written.
    pub async fn ingest_file(&self, request: FileRequest) -> Result<IngestionJob> {
        let mut job = IngestionJob::pending(
            request.source_kind,
            request.path.display().to_string(),
        );
        job.watch_config_id = request.watch_config_id.clone();
        self.store.insert_job(&job).await?;

        let _file_lock = self.locks.acquire(&file_key(&request.path)).await;

        job.timings.queue_ms = elapsed_ms(request.enqueued_at);
        job.status = JobStatus::Processing;
        job.started_at = Some(Utc::now());
        self.store.update_job(&job).await?;
        tracing::debug!(job_id = %job.id, path = %request.path.display(), "ingestion job started");

        let result = self.run_file(&request, &mut job).await;
        self.finish(job, result).await
    }

    async fn run_file(
        &self,
        request: &FileRequest,
        job: &mut IngestionJob,
    ) -> Result<Outcome, IngestError> {
        let path = request.path.as_path();

        // ── Parse ───────────────────────────────────────────────────
        let parse_started = Instant::now();
        let Some(parser) = self.registry.select(path)? else {
            job.timings.parse_ms = elapsed_ms(parse_started);
            return Ok(Outcome::skipped(None, "format unrecognized"));
        };

        let incremental = request.source_kind == SourceKind::Watch
            && self.settings.incremental
            && parser.supports_incremental();
        let start = if incremental {
            let stored = self
                .store
                .load_checkpoint(path)
                .await
                .map_err(IngestError::Store)?;
            // A checkpoint that never fed a conversation cannot be resumed.
            Some(
                stored
                    .filter(|cp| cp.conversation_id.is_some())
                    .unwrap_or_else(|| ParseCheckpoint::start(path)),
            )
        } else {
            None
        };

        let mut pass = parse_blocking(parser.clone(), path, start.clone()).await?;
        job.timings.parse_ms = elapsed_ms(parse_started);

        // ── Dedup ───────────────────────────────────────────────────
        let dedup_started = Instant::now();
        let resumed = match &pass.resumes {
            Some(id) => self
                .store
                .get_conversation(id)
                .await
                .map_err(IngestError::Store)?,
            None => None,
        };
        if pass.resumes.is_some() && resumed.is_none() {
            tracing::warn!(
                path = %path.display(),
                "checkpointed conversation is gone; re-parsing from start"
            );
            let reparse_started = Instant::now();
            pass = parse_blocking(parser.clone(), path, Some(ParseCheckpoint::start(path))).await?;
            job.timings.parse_ms += elapsed_ms(reparse_started);
        }
        job.records_skipped = pass.conversation.skipped_records as i64;

        if let Some(existing) = resumed {
            job.incremental = true;
            return self
                .append_increment(pass, existing.id, job, dedup_started)
                .await;
        }

        let conversation = pass.conversation;
        if conversation.messages.is_empty() {
            job.timings.dedup_ms = elapsed_ms(dedup_started);
            return Ok(Outcome::skipped(None, "no messages"));
        }
        let external_id = conversation
            .external_id
            .clone()
            .unwrap_or_else(|| path.display().to_string());
        let _conversation_lock = self
            .locks
            .acquire(&conversation_key(&conversation.source, &external_id))
            .await;

        let fingerprint = conversation_fingerprint(&conversation.messages);
        let existing = self
            .store
            .find_conversation(&conversation.source, &external_id)
            .await
            .map_err(IngestError::Store)?;
        job.timings.dedup_ms = elapsed_ms(dedup_started);

        let checkpoint_for = |id: &str| {
            pass.checkpoint.clone().map(|cp| ParseCheckpoint {
                conversation_id: Some(id.to_string()),
                ..cp
            })
        };

        let header = |id: String, needs_tagging: bool| NewConversation {
            id,
            source: conversation.source.clone(),
            external_id: external_id.clone(),
            title: conversation.title.clone(),
            project_path: conversation.project_path.clone(),
            needs_tagging,
        };

        let batch = match existing {
            Some(e) if e.fingerprint == fingerprint => {
                if let Some(cp) = checkpoint_for(&e.id) {
                    self.save_checkpoint(&cp).await?;
                }
                return Ok(Outcome::duplicate(Some(e.id)));
            }
            Some(e) => match request.update_mode {
                UpdateMode::Skip => {
                    // Unlinked, so a later pass re-parses in full and is skipped again.
                    if let Some(cp) = pass.checkpoint.clone() {
                        self.save_checkpoint(&ParseCheckpoint {
                            conversation_id: None,
                            ..cp
                        })
                        .await?;
                    }
                    return Ok(Outcome::skipped(Some(e.id), "conversation exists (update mode skip)"));
                }
                UpdateMode::Replace => PersistBatch {
                    action: PersistAction::Replace(header(
                        e.id.clone(),
                        e.needs_tagging || request.auto_tag,
                    )),
                    messages: conversation.messages.clone(),
                    file_changes: conversation.file_changes.clone(),
                    fingerprint,
                    checkpoint: checkpoint_for(&e.id),
                    session: None,
                },
                UpdateMode::Append => {
                    let stored = e.message_count;
                    let messages: Vec<ParsedMessage> = conversation
                        .messages
                        .iter()
                        .filter(|m| m.index >= stored)
                        .cloned()
                        .collect();
                    if messages.is_empty() {
                        if let Some(cp) = checkpoint_for(&e.id) {
                            self.save_checkpoint(&cp).await?;
                        }
                        return Ok(Outcome::duplicate(Some(e.id)));
                    }
                    let file_changes = conversation
                        .file_changes
                        .iter()
                        .filter(|fc| fc.message_index >= stored)
                        .cloned()
                        .collect();
                    PersistBatch {
                        action: PersistAction::Append {
                            conversation_id: e.id.clone(),
                        },
                        fingerprint: extend_fingerprint(&e.fingerprint, &messages),
                        messages,
                        file_changes,
                        checkpoint: checkpoint_for(&e.id),
                        session: None,
                    }
                }
            },
            None => {
                let id = uuid::Uuid::new_v4().to_string();
                PersistBatch {
                    action: PersistAction::Create(header(id.clone(), request.auto_tag)),
                    messages: conversation.messages.clone(),
                    file_changes: conversation.file_changes.clone(),
                    fingerprint,
                    checkpoint: checkpoint_for(&id),
                    session: None,
                }
            }
        };

        // ── Persist ─────────────────────────────────────────────────
        self.persist(batch, job).await
    }

    /// Dedup and persist for a pass that resumed from a checkpoint.
    async fn append_increment(
        &self,
        pass: ParsePass,
        conversation_id: String,
        job: &mut IngestionJob,
        dedup_started: Instant,
    ) -> Result<Outcome, IngestError> {
        let ParsePass {
            conversation,
            checkpoint,
            start_offset,
            ..
        } = pass;

        if conversation.messages.is_empty() {
            job.timings.dedup_ms = elapsed_ms(dedup_started);
            // Skipped or metadata-only lines still move the offset.
            if let Some(cp) = checkpoint.filter(|cp| cp.offset != start_offset) {
                self.save_checkpoint(&cp).await?;
            }
            return Ok(Outcome::duplicate(Some(conversation_id)));
        }

        let current = self
            .store
            .get_conversation(&conversation_id)
            .await
            .map_err(IngestError::Store)?
            .ok_or_else(|| IngestError::Store(anyhow::anyhow!(
                "conversation {} disappeared",
                conversation_id
            )))?;
        let _conversation_lock = self
            .locks
            .acquire(&conversation_key(&current.source, &current.external_id))
            .await;
        // Re-read under the lock so the index base is current.
        let current = self
            .store
            .get_conversation(&conversation_id)
            .await
            .map_err(IngestError::Store)?
            .unwrap_or(current);
        job.timings.dedup_ms = elapsed_ms(dedup_started);

        let (messages, file_changes) =
            renumber(conversation.messages, conversation.file_changes, current.message_count);
        let batch = PersistBatch {
            action: PersistAction::Append {
                conversation_id: conversation_id.clone(),
            },
            fingerprint: extend_fingerprint(&current.fingerprint, &messages),
            messages,
            file_changes,
            checkpoint,
            session: None,
        };
        self.persist(batch, job).await
    }

    async fn persist(
        &self,
        batch: PersistBatch,
        job: &mut IngestionJob,
    ) -> Result<Outcome, IngestError> {
        let persist_started = Instant::now();
        let added = batch.messages.len();
        let result = self.store.persist(batch).await;
        job.timings.persist_ms = elapsed_ms(persist_started);
        let id = result.map_err(IngestError::Persist)?;
        Ok(Outcome::success(id, added))
    }

    async fn save_checkpoint(&self, checkpoint: &ParseCheckpoint) -> Result<(), IngestError> {
        self.store
            .save_checkpoint(checkpoint)
            .await
            .map_err(IngestError::Persist)
    }

    /// Apply a planned collector batch. The caller must hold the session's
    /// lock for the whole plan-and-apply sequence.
    pub async fn ingest_events(&self, guard: &KeyGuard, batch: EventBatch) -> Result<IngestionJob> {
        debug_assert_eq!(
            guard.key(),
            session_key(&batch.collector_id, &batch.session_id)
        );

        let mut job = IngestionJob::pending(
            SourceKind::Collector,
            format!("{}/{}", batch.collector_id, batch.session_id),
        );
        job.timings.queue_ms = (elapsed_ms(batch.received_at) - batch.dedup_ms).max(0);
        job.timings.dedup_ms = batch.dedup_ms;
        job.status = JobStatus::Processing;
        job.started_at = Some(Utc::now());
        self.store.insert_job(&job).await?;

        let result = self.run_events(&batch, &mut job).await;
        self.finish(job, result).await
    }

    async fn run_events(
        &self,
        batch: &EventBatch,
        job: &mut IngestionJob,
    ) -> Result<Outcome, IngestError> {
        let plan = &batch.plan;
        if plan.consumed() == 0 {
            return Ok(Outcome::duplicate(
                batch.stored.as_ref().map(|s| s.conversation_id.clone()),
            ));
        }

        // ── Parse ───────────────────────────────────────────────────
        let parse_started = Instant::now();
        let conversation = events_to_conversation(&plan.accepted);
        job.timings.parse_ms = elapsed_ms(parse_started);

        // ── Persist ─────────────────────────────────────────────────
        let conversation_id = plan.session.conversation_id.clone();
        let (action, base, base_fingerprint) = match &batch.stored {
            None => (
                PersistAction::Create(NewConversation {
                    id: conversation_id.clone(),
                    source: COLLECTOR_SOURCE.to_string(),
                    external_id: format!("{}/{}", batch.collector_id, batch.session_id),
                    title: conversation.title.clone(),
                    project_path: conversation.project_path.clone(),
                    needs_tagging: false,
                }),
                0,
                empty_fingerprint(),
            ),
            Some(_) => {
                let current = self
                    .store
                    .get_conversation(&conversation_id)
                    .await
                    .map_err(IngestError::Store)?
                    .ok_or_else(|| {
                        IngestError::Persist(anyhow::anyhow!(
                            "session conversation {} missing",
                            conversation_id
                        ))
                    })?;
                (
                    PersistAction::Append {
                        conversation_id: conversation_id.clone(),
                    },
                    current.message_count,
                    current.fingerprint,
                )
            }
        };

        let (messages, file_changes) =
            renumber(conversation.messages, conversation.file_changes, base);
        let new_content = !plan.accepted.is_empty();
        let outcome = self
            .persist(
                PersistBatch {
                    action,
                    fingerprint: extend_fingerprint(&base_fingerprint, &messages),
                    messages,
                    file_changes,
                    checkpoint: None,
                    session: Some(SessionUpdate {
                        session: plan.session.clone(),
                        events: plan.recorded.clone(),
                    }),
                },
                job,
            )
            .await?;

        if new_content {
            Ok(outcome)
        } else {
            Ok(Outcome::duplicate(outcome.conversation_id))
        }
    }

    /// Record the terminal state of `job` and fold it into watch stats.
    async fn finish(
        &self,
        mut job: IngestionJob,
        result: Result<Outcome, IngestError>,
    ) -> Result<IngestionJob> {
        match result {
            Ok(outcome) => {
                job.status = outcome.status;
                job.conversation_id = outcome.conversation_id;
                job.messages_added = outcome.messages_added;
                job.error = outcome.note;
            }
            Err(err) => {
                job.status = JobStatus::Failed;
                job.error_stage = Some(err.stage());
                job.error = Some(err.to_string());
            }
        }
        job.finished_at = Some(Utc::now());
        self.store.update_job(&job).await?;

        if let Some(config_id) = &job.watch_config_id {
            self.store
                .record_watch_job(config_id, job.status, job.messages_added)
                .await?;
        }

        match job.status {
            JobStatus::Failed => tracing::warn!(
                job_id = %job.id,
                source = %job.source_ref,
                stage = job.error_stage.map(|s| s.as_str()).unwrap_or("-"),
                error = job.error.as_deref().unwrap_or(""),
                "ingestion job failed"
            ),
            status => tracing::info!(
                job_id = %job.id,
                source = %job.source_ref,
                status = %status,
                messages_added = job.messages_added,
                incremental = job.incremental,
                total_ms = job.timings.total_ms(),
                "ingestion job finished"
            ),
        }
        Ok(job)
    }
}
