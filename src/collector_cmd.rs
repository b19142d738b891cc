//! Collector commands: local registration and `convo push`.
//!
//! `push` plays the remote side of the protocol. It parses a log file
//! locally, turns it into numbered events and pushes them with
//! [`CollectorClient`], which handles backoff and gap re-sync. Pushing the
//! same file again, or a longer version of it, is safe: events already
//! applied come back as retransmissions.

use anyhow::{Context, Result};
use std::path::Path;
use std::sync::Arc;

use crate::collector::client::CollectorClient;
use crate::collector::protocol::{conversation_to_events, RegisterRequest, RegisterResponse};
use crate::collector::CollectorService;
use crate::config::Config;
use crate::db;
use crate::parsers::ParserRegistry;
use crate::pipeline::IngestionPipeline;

/// Register a collector directly against the local database.
pub async fn run_register(config: &Config, req: RegisterRequest) -> Result<RegisterResponse> {
    let store = Arc::new(db::open_store(config).await?);
    let pipeline = IngestionPipeline::new(
        store,
        ParserRegistry::with_builtins(),
        config.ingest.clone(),
    );
    let service = CollectorService::new(pipeline, config.collector.clone());
    let resp = service.register(req).await?;

    println!("Registered collector {}", resp.collector_id);
    println!("  workspace: {}", resp.workspace_id);
    println!("  api key:   {}", resp.api_key);
    println!("The API key is shown only once; store it now.");
    Ok(resp)
}

/// Options for [`run_push`].
pub struct PushOptions<'a> {
    pub server: &'a str,
    pub api_key: &'a str,
    pub session: Option<&'a str>,
    pub workspace: Option<&'a str>,
    /// Leave the session open so a longer version of the log can follow.
    pub keep_open: bool,
    pub batch_size: usize,
}

pub async fn run_push(path: &Path, opts: PushOptions<'_>) -> Result<()> {
    let registry = ParserRegistry::with_builtins();
    let owned = path.to_path_buf();
    let conversation = tokio::task::spawn_blocking(move || -> Result<_> {
        let parser = registry
            .select(&owned)?
            .with_context(|| format!("{}: format unrecognized", owned.display()))?;
        Ok(parser.parse(&owned)?)
    })
    .await??;

    let session_id = match opts.session {
        Some(s) => s.to_string(),
        None => conversation
            .external_id
            .clone()
            .or_else(|| path.file_stem().map(|s| s.to_string_lossy().into_owned()))
            .context("cannot derive a session id; pass --session")?,
    };
    let events = conversation_to_events(&conversation, !opts.keep_open);

    let mut client = CollectorClient::new(opts.server, opts.api_key)?
        .with_workspace(opts.workspace.map(str::to_string))
        .with_batch_size(opts.batch_size);
    let summary = client.resume(&session_id, &events).await?;

    println!("push {} → session {}", path.display(), session_id);
    println!("  events: {}", events.len());
    println!("  accepted: {}", summary.accepted);
    println!("  duplicate content: {}", summary.duplicates);
    println!("  retransmitted: {}", summary.retransmitted);
    if summary.resyncs > 0 {
        println!("  re-syncs: {}", summary.resyncs);
    }
    println!("  last sequence: {}", summary.last_sequence);
    if let Some(id) = summary.conversation_id {
        println!("  conversation: {}", id);
    }
    Ok(())
}
