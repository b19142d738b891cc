//! One-shot file ingestion (`convo ingest`).
//!
//! Runs a single upload job through the same pipeline the watch scheduler
//! uses, so a file previously picked up by a watch is recognized as a
//! duplicate.

use anyhow::{Context, Result};
use std::path::Path;
use std::sync::Arc;

use crate::config::Config;
use crate::db;
use crate::models::{IngestionJob, UpdateMode};
use crate::parsers::ParserRegistry;
use crate::pipeline::{FileRequest, IngestionPipeline};

/// Ingest `path` as an upload and print the job outcome.
pub async fn run_ingest(config: &Config, path: &Path, mode: Option<UpdateMode>) -> Result<IngestionJob> {
    let path = path
        .canonicalize()
        .with_context(|| format!("cannot resolve {}", path.display()))?;
    let store = Arc::new(db::open_store(config).await?);
    let pipeline = IngestionPipeline::new(
        store,
        ParserRegistry::with_builtins(),
        config.ingest.clone(),
    );
    let mode = mode.unwrap_or(config.ingest.update_mode);

    let job = pipeline.ingest_file(FileRequest::upload(&path, mode)).await?;
    print_job(&job);
    Ok(job)
}

pub(crate) fn print_job(job: &IngestionJob) {
    println!("ingest {}", job.source_ref);
    println!("  job: {}", job.id);
    println!("  status: {}", job.status);
    if let Some(id) = &job.conversation_id {
        println!("  conversation: {}", id);
    }
    println!("  messages added: {}", job.messages_added);
    if job.records_skipped > 0 {
        println!("  malformed records skipped: {}", job.records_skipped);
    }
    if let Some(stage) = job.error_stage {
        println!("  failed stage: {}", stage);
    }
    if let Some(err) = &job.error {
        println!("  note: {}", err);
    }
    println!(
        "  timings: parse {}ms, dedup {}ms, persist {}ms",
        job.timings.parse_ms, job.timings.dedup_ms, job.timings.persist_ms
    );
}
