//! Job history (`convo jobs`).

use anyhow::Result;

use crate::config::Config;
use crate::db;
use crate::models::JobStatus;
use crate::store::{JobFilter, Store};

pub async fn run_jobs(config: &Config, limit: i64, status: Option<JobStatus>) -> Result<()> {
    let store = db::open_store(config).await?;
    let jobs = store
        .list_jobs(&JobFilter {
            status,
            watch_config_id: None,
            limit: Some(limit),
        })
        .await?;

    if jobs.is_empty() {
        println!("No jobs.");
        return Ok(());
    }
    for job in jobs {
        println!(
            "{}  {:<10}  {:<9}  +{:<5} {:>6}ms  {}",
            job.created_at.format("%Y-%m-%d %H:%M:%S"),
            job.status.as_str(),
            job.source_kind.as_str(),
            job.messages_added,
            job.timings.total_ms(),
            job.source_ref,
        );
        if let Some(err) = &job.error {
            match job.error_stage {
                Some(stage) => println!("    {} failed: {}", stage, err),
                None => println!("    {}", err),
            }
        }
    }
    Ok(())
}
