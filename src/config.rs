//! TOML configuration.
//!
//! A single file drives the database location, the HTTP bind address, the
//! watch scheduler, ingestion policy, collector limits and logging. Every
//! section except `[db]` is optional and falls back to defaults.
//!
//! ```toml
//! [db]
//! path = "./data/convo.sqlite"
//!
//! [server]
//! bind = "127.0.0.1:7340"
//!
//! [watch]
//! poll_interval_ms = 2000
//! extensions = ["jsonl", "json"]
//!
//! [ingest]
//! update_mode = "skip"
//! ```

use anyhow::{Context, Result};
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::logging::LogConfig;
use crate::models::UpdateMode;

#[derive(Debug, Deserialize, Clone)]
pub struct Config {
    pub db: DbConfig,
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub watch: WatchSettings,
    #[serde(default)]
    pub ingest: IngestSettings,
    #[serde(default)]
    pub collector: CollectorSettings,
    #[serde(default)]
    pub logging: LogConfig,
}

#[derive(Debug, Deserialize, Clone)]
pub struct DbConfig {
    pub path: PathBuf,
}

#[derive(Debug, Deserialize, Clone)]
pub struct ServerConfig {
    #[serde(default = "default_bind")]
    pub bind: String,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind: default_bind(),
        }
    }
}

fn default_bind() -> String {
    "127.0.0.1:7340".to_string()
}

/// Scheduler settings shared by every watch configuration.
#[derive(Debug, Deserialize, Clone)]
pub struct WatchSettings {
    #[serde(default = "default_poll_interval_ms")]
    pub poll_interval_ms: u64,
    #[serde(default = "default_extensions")]
    pub extensions: Vec<String>,
    #[serde(default)]
    pub exclude_globs: Vec<String>,
    /// Number of jobs the pipeline executor runs concurrently.
    #[serde(default = "default_workers")]
    pub workers: usize,
}

impl Default for WatchSettings {
    fn default() -> Self {
        Self {
            poll_interval_ms: default_poll_interval_ms(),
            extensions: default_extensions(),
            exclude_globs: Vec::new(),
            workers: default_workers(),
        }
    }
}

impl WatchSettings {
    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }
}

fn default_poll_interval_ms() -> u64 {
    2000
}
fn default_extensions() -> Vec<String> {
    vec!["jsonl".to_string(), "json".to_string()]
}
fn default_workers() -> usize {
    4
}

#[derive(Debug, Deserialize, Clone)]
pub struct IngestSettings {
    #[serde(default)]
    pub update_mode: UpdateMode,
    #[serde(default = "default_true")]
    pub incremental: bool,
}

impl Default for IngestSettings {
    fn default() -> Self {
        Self {
            update_mode: UpdateMode::default(),
            incremental: true,
        }
    }
}

fn default_true() -> bool {
    true
}

#[derive(Debug, Deserialize, Clone)]
pub struct CollectorSettings {
    #[serde(default = "default_max_batch_events")]
    pub max_batch_events: usize,
}

impl Default for CollectorSettings {
    fn default() -> Self {
        Self {
            max_batch_events: default_max_batch_events(),
        }
    }
}

fn default_max_batch_events() -> usize {
    500
}

impl Config {
    /// All-defaults configuration pointing at `db_path`.
    pub fn minimal(db_path: impl Into<PathBuf>) -> Self {
        Self {
            db: DbConfig {
                path: db_path.into(),
            },
            server: ServerConfig::default(),
            watch: WatchSettings::default(),
            ingest: IngestSettings::default(),
            collector: CollectorSettings::default(),
            logging: LogConfig::default(),
        }
    }

    fn validate(&self) -> Result<()> {
        if self.watch.poll_interval_ms == 0 {
            anyhow::bail!("watch.poll_interval_ms must be > 0");
        }
        if self.watch.workers == 0 {
            anyhow::bail!("watch.workers must be >= 1");
        }
        if self.watch.extensions.is_empty() {
            anyhow::bail!("watch.extensions must list at least one extension");
        }
        if self.collector.max_batch_events == 0 {
            anyhow::bail!("collector.max_batch_events must be >= 1");
        }
        for pattern in &self.watch.exclude_globs {
            globset::Glob::new(pattern)
                .with_context(|| format!("invalid watch.exclude_globs pattern: {}", pattern))?;
        }
        Ok(())
    }
}

pub fn load_config(path: &Path) -> Result<Config> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read config file: {}", path.display()))?;

    let config: Config = toml::from_str(&content).with_context(|| "Failed to parse config file")?;
    config.validate()?;

    Ok(config)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse(toml_src: &str) -> Result<Config> {
        let config: Config = toml::from_str(toml_src)?;
        config.validate()?;
        Ok(config)
    }

    #[test]
    fn test_minimal_file_uses_defaults() {
        let cfg = parse("[db]\npath = \"/tmp/x.sqlite\"\n").unwrap();
        assert_eq!(cfg.server.bind, "127.0.0.1:7340");
        assert_eq!(cfg.watch.poll_interval_ms, 2000);
        assert_eq!(cfg.watch.extensions, vec!["jsonl", "json"]);
        assert_eq!(cfg.ingest.update_mode, UpdateMode::Skip);
        assert!(cfg.ingest.incremental);
        assert_eq!(cfg.collector.max_batch_events, 500);
    }

    #[test]
    fn test_update_mode_parsed() {
        let cfg = parse("[db]\npath = \"x\"\n[ingest]\nupdate_mode = \"append\"\n").unwrap();
        assert_eq!(cfg.ingest.update_mode, UpdateMode::Append);
    }

    #[test]
    fn test_zero_poll_interval_rejected() {
        let err = parse("[db]\npath = \"x\"\n[watch]\npoll_interval_ms = 0\n").unwrap_err();
        assert!(err.to_string().contains("poll_interval_ms"));
    }

    #[test]
    fn test_bad_exclude_glob_rejected() {
        assert!(parse("[db]\npath = \"x\"\n[watch]\nexclude_globs = [\"a[\"]\n").is_err());
    }
}
