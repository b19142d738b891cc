//! Watch configuration commands (`convo watch ...`).
//!
//! `start` and `stop` only flip the activation flag; the scheduler picks
//! active configurations up in `convo watch run` or `convo serve`.

use anyhow::{bail, Context, Result};
use chrono::Utc;
use std::path::Path;
use std::sync::Arc;

use crate::config::Config;
use crate::db;
use crate::models::WatchConfiguration;
use crate::parsers::ParserRegistry;
use crate::pipeline::IngestionPipeline;
use crate::store::{SqliteStore, Store};
use crate::watch::WatchScheduler;

pub async fn run_watch_add(config: &Config, dir: &Path, auto_tag: bool) -> Result<WatchConfiguration> {
    let dir = dir
        .canonicalize()
        .with_context(|| format!("cannot resolve {}", dir.display()))?;
    if !dir.is_dir() {
        bail!("{} is not a directory", dir.display());
    }
    let store = db::open_store(config).await?;
    let watch = WatchConfiguration::new(dir, auto_tag);
    store.insert_watch_config(&watch).await?;
    println!("Added watch {} for {}", watch.id, watch.path.display());
    Ok(watch)
}

pub async fn run_watch_list(config: &Config) -> Result<()> {
    let store = db::open_store(config).await?;
    let configs = store.list_watch_configs().await?;
    if configs.is_empty() {
        println!("No watch configurations.");
        return Ok(());
    }
    println!(
        "{:<36}  {:<8}  {:>6}  {:>8}  {:>6}  PATH",
        "ID", "STATE", "FILES", "MESSAGES", "ERRORS"
    );
    for c in configs {
        println!(
            "{:<36}  {:<8}  {:>6}  {:>8}  {:>6}  {}{}",
            c.id,
            if c.active { "active" } else { "inactive" },
            c.files_ingested,
            c.messages_ingested,
            c.error_count,
            c.path.display(),
            if c.auto_tag { "  [auto-tag]" } else { "" },
        );
        if let Some(err) = &c.last_error {
            println!("    last error: {}", err);
        }
    }
    Ok(())
}

pub async fn run_watch_remove(config: &Config, id: &str) -> Result<()> {
    let store = db::open_store(config).await?;
    let watch = find(&store, id).await?;
    if watch.active {
        bail!("watch {} is active; stop it before removing", id);
    }
    if !store.delete_watch_config(id).await? {
        bail!("watch {} could not be removed", id);
    }
    println!("Removed watch {}", id);
    Ok(())
}

pub async fn run_watch_set_active(config: &Config, id: &str, active: bool) -> Result<()> {
    let store = db::open_store(config).await?;
    find(&store, id).await?;
    store.set_watch_active(id, active, Utc::now()).await?;
    println!(
        "Watch {} {}",
        id,
        if active { "activated" } else { "deactivated" }
    );
    Ok(())
}

/// Run the scheduler for all active configurations until Ctrl-C.
pub async fn run_watch_run(config: &Config) -> Result<()> {
    let store = Arc::new(db::open_store(config).await?);
    let pipeline = IngestionPipeline::new(
        store,
        ParserRegistry::with_builtins(),
        config.ingest.clone(),
    );
    let scheduler = WatchScheduler::new(pipeline, config.watch.clone())?;
    let running = scheduler.run_all().await?;
    if running == 0 {
        println!("No active watch configurations.");
        scheduler.shutdown().await;
        return Ok(());
    }
    println!("Watching {} configuration(s). Press Ctrl-C to stop.", running);

    tokio::signal::ctrl_c().await?;
    println!("Stopping; waiting for in-flight jobs...");
    scheduler.shutdown().await;
    Ok(())
}

async fn find(store: &SqliteStore, id: &str) -> Result<WatchConfiguration> {
    store
        .get_watch_config(id)
        .await?
        .with_context(|| format!("watch configuration {} not found", id))
}
