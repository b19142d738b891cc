//! SQLite-backed [`Store`] implementation.
//!
//! Timestamps are stored as Unix milliseconds. [`Store::persist`] runs in a
//! single transaction: if any statement fails, the conversation, its
//! messages, the checkpoint and the session advance are all rolled back.

use std::collections::HashSet;
use std::path::{Path, PathBuf};

use anyhow::{bail, Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::sqlite::SqliteRow;
use sqlx::{Row, Sqlite, SqlitePool, Transaction};

use super::{from_millis, to_millis, JobFilter, NewConversation, PersistAction, PersistBatch, Store};
use crate::models::{
    Collector, CollectorSession, ConversationRecord, FileChange, IngestionJob, JobStatus,
    MessageRecord, ParseCheckpoint, RecordedEvent, StageTimings, WatchConfiguration,
};

/// SQLite implementation of the [`Store`] trait.
pub struct SqliteStore {
    pool: SqlitePool,
}

impl SqliteStore {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }
}

fn opt_millis(ts: Option<DateTime<Utc>>) -> Option<i64> {
    ts.map(to_millis)
}

fn opt_from_millis(ms: Option<i64>) -> Option<DateTime<Utc>> {
    ms.map(from_millis)
}

fn placeholders(n: usize) -> String {
    vec!["?"; n].join(", ")
}

fn conversation_from_row(row: &SqliteRow) -> ConversationRecord {
    ConversationRecord {
        id: row.get("id"),
        source: row.get("source"),
        external_id: row.get("external_id"),
        title: row.get("title"),
        project_path: row.get("project_path"),
        message_count: row.get("message_count"),
        fingerprint: row.get("fingerprint"),
        needs_tagging: row.get::<i64, _>("needs_tagging") != 0,
        created_at: from_millis(row.get("created_at")),
        updated_at: from_millis(row.get("updated_at")),
    }
}

fn checkpoint_from_row(row: &SqliteRow) -> ParseCheckpoint {
    ParseCheckpoint {
        path: PathBuf::from(row.get::<String, _>("path")),
        offset: row.get::<i64, _>("byte_offset") as u64,
        line_number: row.get::<i64, _>("line_number") as u64,
        file_size: row.get::<i64, _>("file_size") as u64,
        partial_hash: row.get("partial_hash"),
        conversation_id: row.get("conversation_id"),
        updated_at: from_millis(row.get("updated_at")),
    }
}

fn job_from_row(row: &SqliteRow) -> Result<IngestionJob> {
    let error_stage: Option<String> = row.get("error_stage");
    Ok(IngestionJob {
        id: row.get("id"),
        source_kind: row.get::<String, _>("source_kind").parse()?,
        source_ref: row.get("source_ref"),
        status: row.get::<String, _>("status").parse()?,
        created_at: from_millis(row.get("created_at")),
        started_at: opt_from_millis(row.get("started_at")),
        finished_at: opt_from_millis(row.get("finished_at")),
        timings: StageTimings {
            queue_ms: row.get("queue_ms"),
            parse_ms: row.get("parse_ms"),
            dedup_ms: row.get("dedup_ms"),
            persist_ms: row.get("persist_ms"),
        },
        error_stage: error_stage.map(|s| s.parse()).transpose()?,
        error: row.get("error"),
        incremental: row.get::<i64, _>("incremental") != 0,
        messages_added: row.get("messages_added"),
        records_skipped: row.get("records_skipped"),
        conversation_id: row.get("conversation_id"),
        watch_config_id: row.get("watch_config_id"),
    })
}

fn watch_config_from_row(row: &SqliteRow) -> WatchConfiguration {
    WatchConfiguration {
        id: row.get("id"),
        path: PathBuf::from(row.get::<String, _>("path")),
        active: row.get::<i64, _>("active") != 0,
        auto_tag: row.get::<i64, _>("auto_tag") != 0,
        last_started_at: opt_from_millis(row.get("last_started_at")),
        last_stopped_at: opt_from_millis(row.get("last_stopped_at")),
        error_count: row.get("error_count"),
        last_error: row.get("last_error"),
        files_ingested: row.get("files_ingested"),
        messages_ingested: row.get("messages_ingested"),
        created_at: from_millis(row.get("created_at")),
    }
}

fn collector_from_row(row: &SqliteRow) -> Collector {
    Collector {
        id: row.get("id"),
        workspace_id: row.get("workspace_id"),
        collector_type: row.get("collector_type"),
        version: row.get("version"),
        hostname: row.get("hostname"),
        key_salt: row.get("key_salt"),
        key_hash: row.get("key_hash"),
        created_at: from_millis(row.get("created_at")),
        last_seen_at: opt_from_millis(row.get("last_seen_at")),
        last_event_at: opt_from_millis(row.get("last_event_at")),
    }
}

fn session_from_row(row: &SqliteRow) -> CollectorSession {
    CollectorSession {
        collector_id: row.get("collector_id"),
        session_id: row.get("session_id"),
        conversation_id: row.get("conversation_id"),
        expected_sequence: row.get("expected_sequence"),
        complete: row.get::<i64, _>("complete") != 0,
        updated_at: from_millis(row.get("updated_at")),
    }
}

async fn write_checkpoint(
    tx: &mut Transaction<'_, Sqlite>,
    cp: &ParseCheckpoint,
) -> Result<()> {
    sqlx::query(
        r#"
        INSERT INTO parse_checkpoints (path, byte_offset, line_number, file_size,
                                       partial_hash, conversation_id, updated_at)
        VALUES (?, ?, ?, ?, ?, ?, ?)
        ON CONFLICT(path) DO UPDATE SET
            byte_offset = excluded.byte_offset,
            line_number = excluded.line_number,
            file_size = excluded.file_size,
            partial_hash = excluded.partial_hash,
            conversation_id = excluded.conversation_id,
            updated_at = excluded.updated_at
        "#,
    )
    .bind(cp.path.to_string_lossy().to_string())
    .bind(cp.offset as i64)
    .bind(cp.line_number as i64)
    .bind(cp.file_size as i64)
    .bind(&cp.partial_hash)
    .bind(&cp.conversation_id)
    .bind(to_millis(cp.updated_at))
    .execute(&mut **tx)
    .await?;
    Ok(())
}

async fn write_header(
    tx: &mut Transaction<'_, Sqlite>,
    header: &NewConversation,
    message_count: i64,
    fingerprint: &str,
    now: i64,
) -> Result<()> {
    sqlx::query(
        r#"
        INSERT INTO conversations (id, source, external_id, title, project_path,
                                   message_count, fingerprint, needs_tagging,
                                   created_at, updated_at)
        VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
        ON CONFLICT(id) DO UPDATE SET
            title = excluded.title,
            project_path = excluded.project_path,
            message_count = excluded.message_count,
            fingerprint = excluded.fingerprint,
            needs_tagging = excluded.needs_tagging,
            updated_at = excluded.updated_at
        "#,
    )
    .bind(&header.id)
    .bind(&header.source)
    .bind(&header.external_id)
    .bind(&header.title)
    .bind(&header.project_path)
    .bind(message_count)
    .bind(fingerprint)
    .bind(header.needs_tagging as i64)
    .bind(now)
    .bind(now)
    .execute(&mut **tx)
    .await?;
    Ok(())
}

#[async_trait]
impl Store for SqliteStore {
    async fn find_conversation(
        &self,
        source: &str,
        external_id: &str,
    ) -> Result<Option<ConversationRecord>> {
        let row = sqlx::query("SELECT * FROM conversations WHERE source = ? AND external_id = ?")
            .bind(source)
            .bind(external_id)
            .fetch_optional(&self.pool)
            .await?;
        Ok(row.as_ref().map(conversation_from_row))
    }

    async fn get_conversation(&self, id: &str) -> Result<Option<ConversationRecord>> {
        let row = sqlx::query("SELECT * FROM conversations WHERE id = ?")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;
        Ok(row.as_ref().map(conversation_from_row))
    }

    async fn list_messages(&self, conversation_id: &str) -> Result<Vec<MessageRecord>> {
        let rows = sqlx::query(
            r#"
            SELECT conversation_id, message_index, role, content, timestamp
            FROM messages WHERE conversation_id = ?
            ORDER BY message_index
            "#,
        )
        .bind(conversation_id)
        .fetch_all(&self.pool)
        .await?;

        Ok(rows
            .iter()
            .map(|row| MessageRecord {
                conversation_id: row.get("conversation_id"),
                index: row.get("message_index"),
                role: row.get("role"),
                content: row.get("content"),
                timestamp: opt_from_millis(row.get("timestamp")),
            })
            .collect())
    }

    async fn list_file_changes(&self, conversation_id: &str) -> Result<Vec<FileChange>> {
        let rows = sqlx::query(
            r#"
            SELECT message_index, path, change_kind FROM file_changes
            WHERE conversation_id = ? ORDER BY message_index, rowid
            "#,
        )
        .bind(conversation_id)
        .fetch_all(&self.pool)
        .await?;

        Ok(rows
            .iter()
            .map(|row| FileChange {
                message_index: row.get("message_index"),
                path: row.get("path"),
                change_kind: row.get("change_kind"),
            })
            .collect())
    }

    async fn persist(&self, batch: PersistBatch) -> Result<String> {
        let now = to_millis(Utc::now());
        let conv_id = batch.action.conversation_id().to_string();
        let added = batch.messages.len() as i64;

        let mut tx = self.pool.begin().await?;

        match &batch.action {
            PersistAction::Create(header) => {
                let exists: bool =
                    sqlx::query_scalar("SELECT COUNT(*) > 0 FROM conversations WHERE id = ?")
                        .bind(&header.id)
                        .fetch_one(&mut *tx)
                        .await?;
                if exists {
                    bail!("conversation {} already exists", header.id);
                }
                write_header(&mut tx, header, added, &batch.fingerprint, now).await?;
            }
            PersistAction::Replace(header) => {
                sqlx::query("DELETE FROM file_changes WHERE conversation_id = ?")
                    .bind(&header.id)
                    .execute(&mut *tx)
                    .await?;
                sqlx::query("DELETE FROM messages WHERE conversation_id = ?")
                    .bind(&header.id)
                    .execute(&mut *tx)
                    .await?;
                let updated = sqlx::query(
                    r#"
                    UPDATE conversations SET title = ?, project_path = ?, message_count = ?,
                        fingerprint = ?, needs_tagging = ?, updated_at = ?
                    WHERE id = ?
                    "#,
                )
                .bind(&header.title)
                .bind(&header.project_path)
                .bind(added)
                .bind(&batch.fingerprint)
                .bind(header.needs_tagging as i64)
                .bind(now)
                .bind(&header.id)
                .execute(&mut *tx)
                .await?;
                if updated.rows_affected() == 0 {
                    bail!("conversation {} not found", header.id);
                }
            }
            PersistAction::Append { conversation_id } => {
                let updated = sqlx::query(
                    r#"
                    UPDATE conversations
                    SET message_count = message_count + ?, fingerprint = ?, updated_at = ?
                    WHERE id = ?
                    "#,
                )
                .bind(added)
                .bind(&batch.fingerprint)
                .bind(now)
                .bind(conversation_id)
                .execute(&mut *tx)
                .await?;
                if updated.rows_affected() == 0 {
                    bail!("conversation {} not found", conversation_id);
                }
            }
        }

        for m in &batch.messages {
            sqlx::query(
                r#"
                INSERT INTO messages (conversation_id, message_index, role, content, timestamp)
                VALUES (?, ?, ?, ?, ?)
                "#,
            )
            .bind(&conv_id)
            .bind(m.index)
            .bind(&m.role)
            .bind(&m.content)
            .bind(opt_millis(m.timestamp))
            .execute(&mut *tx)
            .await
            .with_context(|| format!("inserting message {} of {}", m.index, conv_id))?;
        }

        for fc in &batch.file_changes {
            sqlx::query(
                "INSERT INTO file_changes (conversation_id, message_index, path, change_kind) VALUES (?, ?, ?, ?)",
            )
            .bind(&conv_id)
            .bind(fc.message_index)
            .bind(&fc.path)
            .bind(&fc.change_kind)
            .execute(&mut *tx)
            .await?;
        }

        if let Some(cp) = &batch.checkpoint {
            write_checkpoint(&mut tx, cp).await?;
        }

        if let Some(update) = &batch.session {
            let s = &update.session;
            sqlx::query(
                r#"
                INSERT INTO collector_sessions (collector_id, session_id, conversation_id,
                                                expected_sequence, complete, updated_at)
                VALUES (?, ?, ?, ?, ?, ?)
                ON CONFLICT(collector_id, session_id) DO UPDATE SET
                    expected_sequence = excluded.expected_sequence,
                    complete = excluded.complete,
                    updated_at = excluded.updated_at
                "#,
            )
            .bind(&s.collector_id)
            .bind(&s.session_id)
            .bind(&s.conversation_id)
            .bind(s.expected_sequence)
            .bind(s.complete as i64)
            .bind(to_millis(s.updated_at))
            .execute(&mut *tx)
            .await?;

            for e in &update.events {
                sqlx::query(
                    r#"
                    INSERT INTO collector_events (collector_id, session_id, sequence,
                                                  event_type, content_hash)
                    VALUES (?, ?, ?, ?, ?)
                    "#,
                )
                .bind(&s.collector_id)
                .bind(&s.session_id)
                .bind(e.sequence)
                .bind(e.event_type.as_str())
                .bind(&e.content_hash)
                .execute(&mut *tx)
                .await
                .with_context(|| format!("recording event {}", e.sequence))?;
            }
        }

        tx.commit().await?;
        Ok(conv_id)
    }

    async fn load_checkpoint(&self, path: &Path) -> Result<Option<ParseCheckpoint>> {
        let row = sqlx::query("SELECT * FROM parse_checkpoints WHERE path = ?")
            .bind(path.to_string_lossy().to_string())
            .fetch_optional(&self.pool)
            .await?;
        Ok(row.as_ref().map(checkpoint_from_row))
    }

    async fn save_checkpoint(&self, checkpoint: &ParseCheckpoint) -> Result<()> {
        let mut tx = self.pool.begin().await?;
        write_checkpoint(&mut tx, checkpoint).await?;
        tx.commit().await?;
        Ok(())
    }

    async fn list_checkpoints(&self) -> Result<Vec<ParseCheckpoint>> {
        let rows = sqlx::query("SELECT * FROM parse_checkpoints")
            .fetch_all(&self.pool)
            .await?;
        Ok(rows.iter().map(checkpoint_from_row).collect())
    }

    async fn insert_job(&self, job: &IngestionJob) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO ingestion_jobs (id, source_kind, source_ref, status, created_at,
                                        started_at, finished_at, queue_ms, parse_ms, dedup_ms,
                                        persist_ms, error_stage, error, incremental,
                                        messages_added, records_skipped, conversation_id,
                                        watch_config_id)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(&job.id)
        .bind(job.source_kind.as_str())
        .bind(&job.source_ref)
        .bind(job.status.as_str())
        .bind(to_millis(job.created_at))
        .bind(opt_millis(job.started_at))
        .bind(opt_millis(job.finished_at))
        .bind(job.timings.queue_ms)
        .bind(job.timings.parse_ms)
        .bind(job.timings.dedup_ms)
        .bind(job.timings.persist_ms)
        .bind(job.error_stage.map(|s| s.as_str()))
        .bind(&job.error)
        .bind(job.incremental as i64)
        .bind(job.messages_added)
        .bind(job.records_skipped)
        .bind(&job.conversation_id)
        .bind(&job.watch_config_id)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn update_job(&self, job: &IngestionJob) -> Result<()> {
        let updated = sqlx::query(
            r#"
            UPDATE ingestion_jobs SET
                status = ?, started_at = ?, finished_at = ?, queue_ms = ?, parse_ms = ?,
                dedup_ms = ?, persist_ms = ?, error_stage = ?, error = ?, incremental = ?,
                messages_added = ?, records_skipped = ?, conversation_id = ?
            WHERE id = ? AND status IN ('pending', 'processing')
            "#,
        )
        .bind(job.status.as_str())
        .bind(opt_millis(job.started_at))
        .bind(opt_millis(job.finished_at))
        .bind(job.timings.queue_ms)
        .bind(job.timings.parse_ms)
        .bind(job.timings.dedup_ms)
        .bind(job.timings.persist_ms)
        .bind(job.error_stage.map(|s| s.as_str()))
        .bind(&job.error)
        .bind(job.incremental as i64)
        .bind(job.messages_added)
        .bind(job.records_skipped)
        .bind(&job.conversation_id)
        .bind(&job.id)
        .execute(&self.pool)
        .await?;
        if updated.rows_affected() == 0 {
            bail!("job {} not found or already finished", job.id);
        }
        Ok(())
    }

    async fn get_job(&self, id: &str) -> Result<Option<IngestionJob>> {
        let row = sqlx::query("SELECT * FROM ingestion_jobs WHERE id = ?")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;
        row.as_ref().map(job_from_row).transpose()
    }

    async fn list_jobs(&self, filter: &JobFilter) -> Result<Vec<IngestionJob>> {
        let rows = sqlx::query(
            r#"
            SELECT * FROM ingestion_jobs
            WHERE (? IS NULL OR status = ?)
              AND (? IS NULL OR watch_config_id = ?)
            ORDER BY created_at DESC, rowid DESC
            LIMIT ?
            "#,
        )
        .bind(filter.status.map(|s| s.as_str()))
        .bind(filter.status.map(|s| s.as_str()))
        .bind(&filter.watch_config_id)
        .bind(&filter.watch_config_id)
        .bind(filter.limit.unwrap_or(-1))
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(job_from_row).collect()
    }

    async fn insert_watch_config(&self, config: &WatchConfiguration) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO watch_configs (id, path, active, auto_tag, last_started_at,
                                       last_stopped_at, error_count, last_error,
                                       files_ingested, messages_ingested, created_at)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(&config.id)
        .bind(config.path.to_string_lossy().to_string())
        .bind(config.active as i64)
        .bind(config.auto_tag as i64)
        .bind(opt_millis(config.last_started_at))
        .bind(opt_millis(config.last_stopped_at))
        .bind(config.error_count)
        .bind(&config.last_error)
        .bind(config.files_ingested)
        .bind(config.messages_ingested)
        .bind(to_millis(config.created_at))
        .execute(&self.pool)
        .await
        .with_context(|| format!("path {} is already watched", config.path.display()))?;
        Ok(())
    }

    async fn get_watch_config(&self, id: &str) -> Result<Option<WatchConfiguration>> {
        let row = sqlx::query("SELECT * FROM watch_configs WHERE id = ?")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;
        Ok(row.as_ref().map(watch_config_from_row))
    }

    async fn list_watch_configs(&self) -> Result<Vec<WatchConfiguration>> {
        let rows = sqlx::query("SELECT * FROM watch_configs ORDER BY created_at, rowid")
            .fetch_all(&self.pool)
            .await?;
        Ok(rows.iter().map(watch_config_from_row).collect())
    }

    async fn set_watch_active(&self, id: &str, active: bool, at: DateTime<Utc>) -> Result<()> {
        let sql = if active {
            "UPDATE watch_configs SET active = 1, last_started_at = ? WHERE id = ?"
        } else {
            "UPDATE watch_configs SET active = 0, last_stopped_at = ? WHERE id = ?"
        };
        let updated = sqlx::query(sql)
            .bind(to_millis(at))
            .bind(id)
            .execute(&self.pool)
            .await?;
        if updated.rows_affected() == 0 {
            bail!("watch configuration {} not found", id);
        }
        Ok(())
    }

    async fn record_watch_error(&self, id: &str, message: &str) -> Result<()> {
        sqlx::query(
            "UPDATE watch_configs SET error_count = error_count + 1, last_error = ? WHERE id = ?",
        )
        .bind(message)
        .bind(id)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn record_watch_job(
        &self,
        id: &str,
        status: JobStatus,
        messages_added: i64,
    ) -> Result<()> {
        match status {
            JobStatus::Success => {
                sqlx::query(
                    r#"
                    UPDATE watch_configs
                    SET files_ingested = files_ingested + 1,
                        messages_ingested = messages_ingested + ?
                    WHERE id = ?
                    "#,
                )
                .bind(messages_added)
                .bind(id)
                .execute(&self.pool)
                .await?;
            }
            JobStatus::Failed => {
                sqlx::query("UPDATE watch_configs SET error_count = error_count + 1 WHERE id = ?")
                    .bind(id)
                    .execute(&self.pool)
                    .await?;
            }
            _ => {}
        }
        Ok(())
    }

    async fn delete_watch_config(&self, id: &str) -> Result<bool> {
        let deleted = sqlx::query("DELETE FROM watch_configs WHERE id = ? AND active = 0")
            .bind(id)
            .execute(&self.pool)
            .await?;
        Ok(deleted.rows_affected() > 0)
    }

    async fn insert_collector(&self, collector: &Collector) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO collectors (id, workspace_id, collector_type, version, hostname,
                                    key_salt, key_hash, created_at, last_seen_at, last_event_at)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(&collector.id)
        .bind(&collector.workspace_id)
        .bind(&collector.collector_type)
        .bind(&collector.version)
        .bind(&collector.hostname)
        .bind(&collector.key_salt)
        .bind(&collector.key_hash)
        .bind(to_millis(collector.created_at))
        .bind(opt_millis(collector.last_seen_at))
        .bind(opt_millis(collector.last_event_at))
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn get_collector(&self, id: &str) -> Result<Option<Collector>> {
        let row = sqlx::query("SELECT * FROM collectors WHERE id = ?")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;
        Ok(row.as_ref().map(collector_from_row))
    }

    async fn touch_collector(
        &self,
        id: &str,
        seen_at: DateTime<Utc>,
        event_at: Option<DateTime<Utc>>,
    ) -> Result<()> {
        sqlx::query(
            r#"
            UPDATE collectors
            SET last_seen_at = ?, last_event_at = COALESCE(?, last_event_at)
            WHERE id = ?
            "#,
        )
        .bind(to_millis(seen_at))
        .bind(opt_millis(event_at))
        .bind(id)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn get_session(
        &self,
        collector_id: &str,
        session_id: &str,
    ) -> Result<Option<CollectorSession>> {
        let row = sqlx::query(
            "SELECT * FROM collector_sessions WHERE collector_id = ? AND session_id = ?",
        )
        .bind(collector_id)
        .bind(session_id)
        .fetch_optional(&self.pool)
        .await?;
        Ok(row.as_ref().map(session_from_row))
    }

    async fn recorded_events(
        &self,
        collector_id: &str,
        session_id: &str,
        sequences: &[i64],
    ) -> Result<Vec<RecordedEvent>> {
        if sequences.is_empty() {
            return Ok(Vec::new());
        }
        let sql = format!(
            "SELECT sequence, event_type, content_hash FROM collector_events \
             WHERE collector_id = ? AND session_id = ? AND sequence IN ({})",
            placeholders(sequences.len())
        );
        let mut query = sqlx::query(&sql).bind(collector_id).bind(session_id);
        for s in sequences {
            query = query.bind(*s);
        }
        let rows = query.fetch_all(&self.pool).await?;
        rows.iter()
            .map(|row| {
                Ok(RecordedEvent {
                    sequence: row.get("sequence"),
                    event_type: row.get::<String, _>("event_type").parse()?,
                    content_hash: row.get("content_hash"),
                })
            })
            .collect()
    }

    async fn known_event_hashes(
        &self,
        collector_id: &str,
        session_id: &str,
        hashes: &[String],
    ) -> Result<HashSet<String>> {
        if hashes.is_empty() {
            return Ok(HashSet::new());
        }
        let sql = format!(
            "SELECT DISTINCT content_hash FROM collector_events \
             WHERE collector_id = ? AND session_id = ? AND content_hash IN ({})",
            placeholders(hashes.len())
        );
        let mut query = sqlx::query_scalar::<_, String>(&sql)
            .bind(collector_id)
            .bind(session_id);
        for h in hashes {
            query = query.bind(h);
        }
        Ok(query.fetch_all(&self.pool).await?.into_iter().collect())
    }
}
