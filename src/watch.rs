//! Directory watch scheduler.
//!
//! Every active [`WatchConfiguration`] gets its own worker task. A worker
//! polls its directory on the configured interval, compares what it finds
//! with the sizes and modification times it has already seen, and sends a
//! work item for each new or changed log file over a channel into a shared
//! executor. The executor runs at most `watch.workers` pipeline jobs at once.
//!
//! ```text
//!  worker(config A) ──┐
//!  worker(config B) ──┼──▶ work channel ──▶ executor ──▶ IngestionPipeline
//!  worker(config C) ──┘                        │
//!        ▲                                     │
//!        └──────────── done channel ◀──────────┘
//! ```
//!
//! A worker owns its in-flight set: a file stays in it from the moment it is
//! enqueued until the executor reports the job done, and is never enqueued
//! twice in that window. Stopping a worker prevents new jobs; jobs already
//! running finish normally, and queued items not yet started are dropped.
//!
//! An unreadable directory is recorded on the configuration (once per
//! outage) and the worker keeps polling. A file whose job fails is enqueued
//! again on the next poll, up to [`RETRY_LIMIT`] times while it stays
//! unchanged.

use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::SystemTime;

use anyhow::{anyhow, Context, Result};
use chrono::Utc;
use globset::{Glob, GlobSet, GlobSetBuilder};
use tokio::sync::{mpsc, watch, Mutex, Semaphore};
use tokio::task::{JoinHandle, JoinSet};
use walkdir::WalkDir;

use crate::config::WatchSettings;
use crate::models::{IngestionJob, JobStatus, UpdateMode, WatchConfiguration};
use crate::pipeline::{FileRequest, IngestionPipeline};

/// Consecutive failed jobs tolerated for an unchanged file.
pub const RETRY_LIMIT: u32 = 5;

/// Size and mtime of a file when it was last enqueued.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct Signature {
    len: u64,
    /// `None` when seeded from a checkpoint, which records only the size.
    modified: Option<SystemTime>,
}

impl Signature {
    fn unchanged(&self, current: &Signature) -> bool {
        self.len == current.len && self.modified.map_or(true, |m| current.modified == Some(m))
    }
}

struct WorkItem {
    request: FileRequest,
    stop: watch::Receiver<bool>,
    done: mpsc::UnboundedSender<Completed>,
}

struct Completed {
    path: PathBuf,
    job: Option<IngestionJob>,
}

struct WorkerHandle {
    stop: watch::Sender<bool>,
    task: JoinHandle<()>,
}

/// Supervises one worker per active watch configuration.
pub struct WatchScheduler {
    pipeline: IngestionPipeline,
    settings: WatchSettings,
    excludes: GlobSet,
    work_tx: mpsc::Sender<WorkItem>,
    workers: Mutex<HashMap<String, WorkerHandle>>,
    executor: JoinHandle<()>,
}

fn build_globset(patterns: &[String]) -> Result<GlobSet> {
    let mut builder = GlobSetBuilder::new();
    for pattern in patterns {
        builder.add(Glob::new(pattern)?);
    }
    Ok(builder.build()?)
}

impl WatchScheduler {
    /// Create the scheduler and its executor. No worker runs until
    /// [`start`](Self::start) or [`run_all`](Self::run_all).
    pub fn new(pipeline: IngestionPipeline, settings: WatchSettings) -> Result<Self> {
        let mut excludes = vec!["**/.git/**".to_string()];
        excludes.extend(settings.exclude_globs.iter().cloned());
        let excludes = build_globset(&excludes)?;

        let (work_tx, work_rx) = mpsc::channel(settings.workers.max(1) * 16);
        let executor = tokio::spawn(run_executor(
            pipeline.clone(),
            work_rx,
            settings.workers.max(1),
        ));
        Ok(Self {
            pipeline,
            settings,
            excludes,
            work_tx,
            workers: Mutex::new(HashMap::new()),
            executor,
        })
    }

    /// Activate a configuration and start watching it. Starting a running
    /// configuration is a no-op.
    pub async fn start(&self, id: &str) -> Result<WatchConfiguration> {
        let store = self.pipeline.store();
        let mut workers = self.workers.lock().await;
        if workers.contains_key(id) {
            return store
                .get_watch_config(id)
                .await?
                .ok_or_else(|| anyhow!("watch configuration {} not found", id));
        }
        store.set_watch_active(id, true, Utc::now()).await?;
        let config = store
            .get_watch_config(id)
            .await?
            .ok_or_else(|| anyhow!("watch configuration {} not found", id))?;
        workers.insert(id.to_string(), self.spawn_worker(config.clone()));
        Ok(config)
    }

    /// Deactivate a configuration. Returns once its worker has exited; jobs
    /// it already handed to the executor keep running.
    pub async fn stop(&self, id: &str) -> Result<()> {
        let handle = self.workers.lock().await.remove(id);
        if let Some(handle) = handle {
            stop_worker(id, handle).await;
        }
        self.pipeline
            .store()
            .set_watch_active(id, false, Utc::now())
            .await
    }

    /// Start a worker for every configuration flagged active in the store.
    /// Returns how many are running afterwards.
    pub async fn run_all(&self) -> Result<usize> {
        let configs = self.pipeline.store().list_watch_configs().await?;
        for config in configs.into_iter().filter(|c| c.active) {
            self.start(&config.id).await?;
        }
        Ok(self.workers.lock().await.len())
    }

    /// Ids of configurations with a running worker.
    pub async fn running(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.workers.lock().await.keys().cloned().collect();
        ids.sort();
        ids
    }

    /// Stop every worker without touching activation flags, then wait for
    /// in-flight jobs to finish.
    pub async fn shutdown(self) {
        let handles: Vec<_> = self.workers.lock().await.drain().collect();
        for (id, handle) in handles {
            stop_worker(&id, handle).await;
        }
        drop(self.work_tx);
        if let Err(err) = self.executor.await {
            tracing::error!(error = %err, "watch executor panicked");
        }
    }

    fn spawn_worker(&self, config: WatchConfiguration) -> WorkerHandle {
        let (stop, stop_rx) = watch::channel(false);
        let worker = Worker {
            root: config.path.clone(),
            config,
            pipeline: self.pipeline.clone(),
            settings: self.settings.clone(),
            excludes: self.excludes.clone(),
            update_mode: self.pipeline.settings().update_mode,
            seen: HashMap::new(),
            in_flight: HashSet::new(),
            failures: HashMap::new(),
            retry: HashSet::new(),
            dir_error: false,
        };
        let task = tokio::spawn(worker.run(self.work_tx.clone(), stop_rx));
        WorkerHandle { stop, task }
    }
}

async fn stop_worker(id: &str, handle: WorkerHandle) {
    let _ = handle.stop.send(true);
    if let Err(err) = handle.task.await {
        tracing::error!(watch_id = %id, error = %err, "watch worker panicked");
    }
}

struct Worker {
    config: WatchConfiguration,
    root: PathBuf,
    pipeline: IngestionPipeline,
    settings: WatchSettings,
    excludes: GlobSet,
    update_mode: UpdateMode,
    seen: HashMap<PathBuf, Signature>,
    in_flight: HashSet<PathBuf>,
    /// Consecutive failed jobs per file, reset when the file changes.
    failures: HashMap<PathBuf, u32>,
    /// Files to enqueue on the next poll even if unchanged.
    retry: HashSet<PathBuf>,
    dir_error: bool,
}

impl Worker {
    async fn run(mut self, work_tx: mpsc::Sender<WorkItem>, mut stop_rx: watch::Receiver<bool>) {
        tracing::info!(watch_id = %self.config.id, path = %self.root.display(), "watch started");
        self.seed().await;

        let (done_tx, mut done_rx) = mpsc::unbounded_channel::<Completed>();
        let mut ticker = tokio::time::interval(self.settings.poll_interval());
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

        loop {
            tokio::select! {
                biased;
                changed = stop_rx.changed() => {
                    if changed.is_err() || *stop_rx.borrow() {
                        break;
                    }
                }
                Some(done) = done_rx.recv() => self.complete(done),
                _ = ticker.tick() => {
                    if !self.poll(&work_tx, &stop_rx, &done_tx).await {
                        break;
                    }
                }
            }
        }
        tracing::info!(
            watch_id = %self.config.id,
            in_flight = self.in_flight.len(),
            "watch stopped"
        );
    }

    fn complete(&mut self, done: Completed) {
        self.in_flight.remove(&done.path);
        let failed = match &done.job {
            Some(job) => {
                tracing::debug!(watch_id = %self.config.id, job_id = %job.id, status = %job.status, "watch job done");
                job.status == JobStatus::Failed
            }
            None => true,
        };
        if !failed {
            self.failures.remove(&done.path);
            return;
        }
        let attempts = self.failures.entry(done.path.clone()).or_insert(0);
        *attempts += 1;
        if *attempts <= RETRY_LIMIT {
            self.retry.insert(done.path);
        } else {
            tracing::warn!(
                watch_id = %self.config.id,
                path = %done.path.display(),
                attempts = *attempts,
                "giving up on file until it changes"
            );
        }
    }

    /// Treat files whose checkpoint already covers their current size as seen.
    async fn seed(&mut self) {
        match self.pipeline.store().list_checkpoints().await {
            Ok(checkpoints) => {
                for cp in checkpoints.into_iter().filter(|cp| cp.path.starts_with(&self.root)) {
                    self.seen.insert(
                        cp.path,
                        Signature {
                            len: cp.file_size,
                            modified: None,
                        },
                    );
                }
            }
            Err(err) => {
                tracing::warn!(watch_id = %self.config.id, error = %err, "could not load checkpoints")
            }
        }
    }

    /// One scan. Returns `false` once the executor is gone.
    async fn poll(
        &mut self,
        work_tx: &mpsc::Sender<WorkItem>,
        stop_rx: &watch::Receiver<bool>,
        done_tx: &mpsc::UnboundedSender<Completed>,
    ) -> bool {
        let root = self.root.clone();
        let extensions = self.settings.extensions.clone();
        let excludes = self.excludes.clone();
        let scanned = tokio::task::spawn_blocking(move || scan(&root, &extensions, &excludes))
            .await
            .map_err(anyhow::Error::from)
            .and_then(|r| r);

        let files = match scanned {
            Ok(files) => files,
            Err(err) => {
                if !self.dir_error {
                    self.dir_error = true;
                    let message = format!("{:#}", err);
                    tracing::warn!(watch_id = %self.config.id, error = %message, "watch directory unreadable");
                    if let Err(e) = self
                        .pipeline
                        .store()
                        .record_watch_error(&self.config.id, &message)
                        .await
                    {
                        tracing::error!(watch_id = %self.config.id, error = %e, "could not record watch error");
                    }
                }
                return true;
            }
        };
        if self.dir_error {
            self.dir_error = false;
            tracing::info!(watch_id = %self.config.id, "watch directory readable again");
        }

        let present: HashSet<&PathBuf> = files.iter().map(|(p, _)| p).collect();
        self.seen.retain(|p, _| present.contains(p));
        self.failures.retain(|p, _| present.contains(p));
        self.retry.retain(|p| present.contains(p));

        for (path, signature) in &files {
            if *stop_rx.borrow() {
                break;
            }
            if self.in_flight.contains(path) {
                continue;
            }
            let changed = !self.seen.get(path).is_some_and(|s| s.unchanged(signature));
            let retry = self.retry.remove(path);
            if !changed && !retry {
                continue;
            }
            if changed {
                self.failures.remove(path);
            }
            self.seen.insert(path.clone(), *signature);
            self.in_flight.insert(path.clone());
            let item = WorkItem {
                request: FileRequest::watched(path.clone(), &self.config, self.update_mode),
                stop: stop_rx.clone(),
                done: done_tx.clone(),
            };
            tracing::debug!(watch_id = %self.config.id, path = %path.display(), "enqueued");
            if work_tx.send(item).await.is_err() {
                return false;
            }
        }
        true
    }
}

/// List candidate log files under `root`, sorted by path.
fn scan(root: &Path, extensions: &[String], excludes: &GlobSet) -> Result<Vec<(PathBuf, Signature)>> {
    std::fs::read_dir(root).with_context(|| format!("cannot read {}", root.display()))?;

    let mut files = Vec::new();
    for entry in WalkDir::new(root) {
        let entry = match entry {
            Ok(entry) => entry,
            Err(err) => {
                tracing::debug!(error = %err, "skipping unreadable entry");
                continue;
            }
        };
        if !entry.file_type().is_file() {
            continue;
        }
        let path = entry.path();
        let matches_ext = path
            .extension()
            .and_then(|e| e.to_str())
            .is_some_and(|e| extensions.iter().any(|x| x.eq_ignore_ascii_case(e)));
        if !matches_ext {
            continue;
        }
        let relative = path.strip_prefix(root).unwrap_or(path);
        if excludes.is_match(relative) {
            continue;
        }
        // Vanished between listing and stat; the next poll will tell.
        let Ok(meta) = entry.metadata() else { continue };
        files.push((
            path.to_path_buf(),
            Signature {
                len: meta.len(),
                modified: meta.modified().ok(),
            },
        ));
    }
    files.sort_by(|a, b| a.0.cmp(&b.0));
    Ok(files)
}

async fn run_executor(pipeline: IngestionPipeline, mut rx: mpsc::Receiver<WorkItem>, workers: usize) {
    let semaphore = Arc::new(Semaphore::new(workers));
    let mut tasks = JoinSet::new();
    loop {
        tokio::select! {
            item = rx.recv() => {
                let Some(item) = item else { break };
                let Ok(permit) = semaphore.clone().acquire_owned().await else { break };
                let pipeline = pipeline.clone();
                tasks.spawn(async move {
                    let _permit = permit;
                    execute(&pipeline, item).await;
                });
            }
            Some(joined) = tasks.join_next(), if !tasks.is_empty() => {
                if let Err(err) = joined {
                    tracing::error!(error = %err, "watch job panicked");
                }
            }
        }
    }
    while let Some(joined) = tasks.join_next().await {
        if let Err(err) = joined {
            tracing::error!(error = %err, "watch job panicked");
        }
    }
}

async fn execute(pipeline: &IngestionPipeline, item: WorkItem) {
    let path = item.request.path.clone();
    if *item.stop.borrow() {
        tracing::debug!(path = %path.display(), "watch stopped; dropping queued file");
        let _ = item.done.send(Completed { path, job: None });
        return;
    }
    let job = match pipeline.ingest_file(item.request).await {
        Ok(job) => Some(job),
        Err(err) => {
            tracing::error!(path = %path.display(), error = %format!("{:#}", err), "could not record watch job");
            None
        }
    };
    let _ = item.done.send(Completed { path, job });
}
