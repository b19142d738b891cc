use anyhow::Result;
use sqlx::SqlitePool;

use crate::config::Config;
use crate::db;

/// Schema statements, applied in order. Every statement is idempotent.
const SCHEMA: &[&str] = &[
    r#"
    CREATE TABLE IF NOT EXISTS watch_configs (
        id TEXT PRIMARY KEY,
        path TEXT NOT NULL UNIQUE,
        active INTEGER NOT NULL DEFAULT 0,
        auto_tag INTEGER NOT NULL DEFAULT 0,
        last_started_at INTEGER,
        last_stopped_at INTEGER,
        error_count INTEGER NOT NULL DEFAULT 0,
        last_error TEXT,
        files_ingested INTEGER NOT NULL DEFAULT 0,
        messages_ingested INTEGER NOT NULL DEFAULT 0,
        created_at INTEGER NOT NULL
    )
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS ingestion_jobs (
        id TEXT PRIMARY KEY,
        source_kind TEXT NOT NULL,
        source_ref TEXT NOT NULL,
        status TEXT NOT NULL,
        created_at INTEGER NOT NULL,
        started_at INTEGER,
        finished_at INTEGER,
        queue_ms INTEGER NOT NULL DEFAULT 0,
        parse_ms INTEGER NOT NULL DEFAULT 0,
        dedup_ms INTEGER NOT NULL DEFAULT 0,
        persist_ms INTEGER NOT NULL DEFAULT 0,
        error_stage TEXT,
        error TEXT,
        incremental INTEGER NOT NULL DEFAULT 0,
        messages_added INTEGER NOT NULL DEFAULT 0,
        records_skipped INTEGER NOT NULL DEFAULT 0,
        conversation_id TEXT,
        watch_config_id TEXT
    )
    "#,
    "CREATE INDEX IF NOT EXISTS idx_jobs_created ON ingestion_jobs(created_at)",
    "CREATE INDEX IF NOT EXISTS idx_jobs_status ON ingestion_jobs(status)",
    r#"
    CREATE TABLE IF NOT EXISTS parse_checkpoints (
        path TEXT PRIMARY KEY,
        byte_offset INTEGER NOT NULL,
        line_number INTEGER NOT NULL,
        file_size INTEGER NOT NULL,
        partial_hash TEXT NOT NULL,
        conversation_id TEXT,
        updated_at INTEGER NOT NULL
    )
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS conversations (
        id TEXT PRIMARY KEY,
        source TEXT NOT NULL,
        external_id TEXT NOT NULL,
        title TEXT,
        project_path TEXT,
        message_count INTEGER NOT NULL DEFAULT 0,
        fingerprint TEXT NOT NULL,
        needs_tagging INTEGER NOT NULL DEFAULT 0,
        created_at INTEGER NOT NULL,
        updated_at INTEGER NOT NULL,
        UNIQUE(source, external_id)
    )
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS messages (
        conversation_id TEXT NOT NULL,
        message_index INTEGER NOT NULL,
        role TEXT NOT NULL,
        content TEXT NOT NULL,
        timestamp INTEGER,
        PRIMARY KEY (conversation_id, message_index),
        FOREIGN KEY (conversation_id) REFERENCES conversations(id)
    )
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS file_changes (
        conversation_id TEXT NOT NULL,
        message_index INTEGER NOT NULL,
        path TEXT NOT NULL,
        change_kind TEXT NOT NULL,
        FOREIGN KEY (conversation_id) REFERENCES conversations(id)
    )
    "#,
    "CREATE INDEX IF NOT EXISTS idx_file_changes_conv ON file_changes(conversation_id)",
    r#"
    CREATE TABLE IF NOT EXISTS collectors (
        id TEXT PRIMARY KEY,
        workspace_id TEXT NOT NULL,
        collector_type TEXT NOT NULL,
        version TEXT NOT NULL,
        hostname TEXT NOT NULL,
        key_salt TEXT NOT NULL,
        key_hash TEXT NOT NULL,
        created_at INTEGER NOT NULL,
        last_seen_at INTEGER,
        last_event_at INTEGER
    )
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS collector_sessions (
        collector_id TEXT NOT NULL,
        session_id TEXT NOT NULL,
        conversation_id TEXT NOT NULL,
        expected_sequence INTEGER NOT NULL,
        complete INTEGER NOT NULL DEFAULT 0,
        updated_at INTEGER NOT NULL,
        PRIMARY KEY (collector_id, session_id)
    )
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS collector_events (
        collector_id TEXT NOT NULL,
        session_id TEXT NOT NULL,
        sequence INTEGER NOT NULL,
        event_type TEXT NOT NULL,
        content_hash TEXT NOT NULL,
        PRIMARY KEY (collector_id, session_id, sequence)
    )
    "#,
    "CREATE INDEX IF NOT EXISTS idx_collector_events_hash ON collector_events(collector_id, session_id, content_hash)",
];

/// Apply the schema to an open pool.
pub async fn apply(pool: &SqlitePool) -> Result<()> {
    for statement in SCHEMA {
        sqlx::query(statement).execute(pool).await?;
    }
    Ok(())
}

/// `convo init`: create the database file and schema.
pub async fn run_migrations(config: &Config) -> Result<()> {
    let pool = db::connect(config).await?;
    apply(&pool).await?;
    tracing::info!(path = %config.db.path.display(), "database initialized");
    println!("Migrations complete.");
    pool.close().await;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[tokio::test]
    async fn test_migrations_are_idempotent() {
        let tmp = TempDir::new().unwrap();
        let config = Config::minimal(tmp.path().join("data/convo.sqlite"));
        run_migrations(&config).await.unwrap();
        run_migrations(&config).await.unwrap();

        let pool = db::connect(&config).await.unwrap();
        let tables: i64 = sqlx::query_scalar(
            "SELECT COUNT(*) FROM sqlite_master WHERE type = 'table' AND name IN \
             ('watch_configs', 'ingestion_jobs', 'parse_checkpoints', 'conversations', \
              'messages', 'file_changes', 'collectors', 'collector_sessions', 'collector_events')",
        )
        .fetch_one(&pool)
        .await
        .unwrap();
        assert_eq!(tables, 9);
    }
}
