//! Watch scheduler scenarios against a SQLite store.

use std::io::Write;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use convo_ingest::config::{Config, IngestSettings, WatchSettings};
use convo_ingest::db;
use convo_ingest::models::{IngestionJob, JobStatus, WatchConfiguration};
use convo_ingest::parsers::ParserRegistry;
use convo_ingest::pipeline::IngestionPipeline;
use convo_ingest::store::{JobFilter, Store};
use convo_ingest::watch::WatchScheduler;
use tempfile::TempDir;

async fn setup(tmp: &TempDir) -> IngestionPipeline {
    let config = Config::minimal(tmp.path().join("convo.sqlite"));
    let store: Arc<dyn Store> = Arc::new(db::open_store(&config).await.unwrap());
    IngestionPipeline::new(store, ParserRegistry::with_builtins(), IngestSettings::default())
}

fn settings() -> WatchSettings {
    WatchSettings {
        poll_interval_ms: 25,
        ..WatchSettings::default()
    }
}

async fn add_watch(pipeline: &IngestionPipeline, dir: &Path) -> String {
    let config = WatchConfiguration::new(dir, false);
    pipeline.store().insert_watch_config(&config).await.unwrap();
    config.id
}

async fn jobs(pipeline: &IngestionPipeline) -> Vec<IngestionJob> {
    pipeline.store().list_jobs(&JobFilter::default()).await.unwrap()
}

async fn wait_until<F, Fut>(mut check: F)
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = bool>,
{
    for _ in 0..1500 {
        if check().await {
            return;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    panic!("condition not reached in time");
}

async fn wait_for_terminal(pipeline: &IngestionPipeline, n: usize) -> Vec<IngestionJob> {
    wait_until(|| async {
        let all = jobs(pipeline).await;
        all.len() >= n && all.iter().all(|j| j.status.is_terminal())
    })
    .await;
    jobs(pipeline).await
}

fn chat_line(i: usize) -> String {
    let role = if i % 2 == 0 { "user" } else { "assistant" };
    format!("{{\"role\":\"{}\",\"content\":\"message number {}\"}}\n", role, i)
}

#[tokio::test]
async fn test_malformed_line_is_skipped() {
    let tmp = TempDir::new().unwrap();
    let dir = tmp.path().join("logs");
    std::fs::create_dir(&dir).unwrap();
    let file = dir.join("a.jsonl");
    let content = format!(
        "{}{}{{\"role\":\"user\",\"content\": <<truncated\n{}",
        chat_line(0),
        chat_line(1),
        chat_line(2)
    );
    std::fs::write(&file, &content).unwrap();

    let pipeline = setup(&tmp).await;
    let id = add_watch(&pipeline, &dir).await;
    let scheduler = WatchScheduler::new(pipeline.clone(), settings()).unwrap();
    scheduler.start(&id).await.unwrap();

    let all = wait_for_terminal(&pipeline, 1).await;
    tokio::time::sleep(Duration::from_millis(150)).await;
    assert_eq!(jobs(&pipeline).await.len(), 1);

    let job = &all[0];
    assert_eq!(job.status, JobStatus::Success);
    assert_eq!(job.messages_added, 3);
    assert_eq!(job.records_skipped, 1);

    let checkpoint = pipeline.store().load_checkpoint(&file).await.unwrap().unwrap();
    assert_eq!(checkpoint.offset, content.len() as u64);
    assert_eq!(checkpoint.line_number, 4);
    assert_eq!(checkpoint.conversation_id, job.conversation_id);

    scheduler.shutdown().await;
}

#[tokio::test]
async fn test_stop_mid_parse_lets_job_finish() {
    let tmp = TempDir::new().unwrap();
    let dir = tmp.path().join("logs");
    std::fs::create_dir(&dir).unwrap();
    let file = dir.join("big.jsonl");
    let lines = 20_000;
    let content: String = (0..lines).map(chat_line).collect();
    std::fs::write(&file, content).unwrap();

    let pipeline = setup(&tmp).await;
    let id = add_watch(&pipeline, &dir).await;
    let scheduler = WatchScheduler::new(pipeline.clone(), settings()).unwrap();
    scheduler.start(&id).await.unwrap();

    wait_until(|| async { !jobs(&pipeline).await.is_empty() }).await;
    scheduler.stop(&id).await.unwrap();

    let all = wait_for_terminal(&pipeline, 1).await;
    assert_eq!(all.len(), 1);
    assert_eq!(all[0].status, JobStatus::Success);
    assert_eq!(all[0].messages_added, lines as i64);

    // Stopped: growth goes unnoticed.
    let mut f = std::fs::OpenOptions::new().append(true).open(&file).unwrap();
    f.write_all(chat_line(lines).as_bytes()).unwrap();
    drop(f);
    tokio::time::sleep(Duration::from_millis(200)).await;
    assert_eq!(jobs(&pipeline).await.len(), 1);

    // Restarted: only the new line is read.
    scheduler.start(&id).await.unwrap();
    let all = wait_for_terminal(&pipeline, 2).await;
    assert_eq!(all[0].status, JobStatus::Success);
    assert!(all[0].incremental);
    assert_eq!(all[0].messages_added, 1);

    scheduler.shutdown().await;
}

#[tokio::test]
async fn test_unreadable_directory_does_not_stop_others() {
    let tmp = TempDir::new().unwrap();
    let good = tmp.path().join("good");
    std::fs::create_dir(&good).unwrap();
    std::fs::write(good.join("a.jsonl"), chat_line(0)).unwrap();

    let pipeline = setup(&tmp).await;
    let broken = add_watch(&pipeline, &tmp.path().join("gone")).await;
    let healthy = add_watch(&pipeline, &good).await;
    pipeline
        .store()
        .set_watch_active(&broken, true, chrono::Utc::now())
        .await
        .unwrap();
    pipeline
        .store()
        .set_watch_active(&healthy, true, chrono::Utc::now())
        .await
        .unwrap();

    let scheduler = WatchScheduler::new(pipeline.clone(), settings()).unwrap();
    assert_eq!(scheduler.run_all().await.unwrap(), 2);

    let all = wait_for_terminal(&pipeline, 1).await;
    assert_eq!(all[0].status, JobStatus::Success);

    let cfg = pipeline.store().get_watch_config(&broken).await.unwrap().unwrap();
    assert_eq!(cfg.error_count, 1);
    assert!(cfg.last_error.is_some());
    assert!(cfg.active);
    assert_eq!(scheduler.running().await.len(), 2);

    scheduler.shutdown().await;
}

#[tokio::test]
async fn test_restart_does_not_rescan_ingested_files() {
    let tmp = TempDir::new().unwrap();
    let dir = tmp.path().join("logs");
    std::fs::create_dir(&dir).unwrap();
    std::fs::write(dir.join("a.jsonl"), chat_line(0) + &chat_line(1)).unwrap();

    let pipeline = setup(&tmp).await;
    let id = add_watch(&pipeline, &dir).await;
    let scheduler = WatchScheduler::new(pipeline.clone(), settings()).unwrap();
    scheduler.start(&id).await.unwrap();
    wait_for_terminal(&pipeline, 1).await;
    scheduler.shutdown().await;

    // Shutdown leaves the configuration active for the next run.
    let cfg = pipeline.store().get_watch_config(&id).await.unwrap().unwrap();
    assert!(cfg.active);
    assert_eq!(cfg.files_ingested, 1);
    assert_eq!(cfg.messages_ingested, 2);

    let scheduler = WatchScheduler::new(pipeline.clone(), settings()).unwrap();
    assert_eq!(scheduler.run_all().await.unwrap(), 1);
    tokio::time::sleep(Duration::from_millis(200)).await;
    assert_eq!(jobs(&pipeline).await.len(), 1);
    scheduler.shutdown().await;
}

#[tokio::test]
async fn test_upload_after_watch_is_duplicate() {
    let tmp = TempDir::new().unwrap();
    let dir = tmp.path().join("logs");
    std::fs::create_dir(&dir).unwrap();
    let file = dir.join("a.jsonl");
    std::fs::write(&file, chat_line(0) + &chat_line(1) + &chat_line(2)).unwrap();

    let pipeline = setup(&tmp).await;
    let id = add_watch(&pipeline, &dir).await;
    let scheduler = WatchScheduler::new(pipeline.clone(), settings()).unwrap();
    scheduler.start(&id).await.unwrap();
    wait_for_terminal(&pipeline, 1).await;
    scheduler.shutdown().await;

    let job = pipeline
        .ingest_file(convo_ingest::pipeline::FileRequest::upload(
            &file,
            Default::default(),
        ))
        .await
        .unwrap();
    assert_eq!(job.status, JobStatus::Duplicate);
    assert_eq!(job.messages_added, 0);
}
