//! Per-job failure taxonomy.
//!
//! Per-record problems (a malformed line) never surface here; they are
//! counted on the parse result. An [`IngestError`] fails one job and carries
//! the stage it failed in. Protocol rejections live in
//! [`collector::ProtocolError`](crate::collector::ProtocolError).

use std::path::PathBuf;

use crate::models::Stage;

#[derive(Debug, thiserror::Error)]
pub enum IngestError {
    #[error("file not found: {}", .0.display())]
    FileNotFound(PathBuf),

    #[error("failed to read {}: {source}", path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("parse error: {0}")]
    Parse(String),

    #[error("persist failed: {0:#}")]
    Persist(anyhow::Error),

    #[error("store error: {0:#}")]
    Store(anyhow::Error),
}

impl IngestError {
    pub fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        let path = path.into();
        if source.kind() == std::io::ErrorKind::NotFound {
            IngestError::FileNotFound(path)
        } else {
            IngestError::Io { path, source }
        }
    }

    /// Stage a job should be tagged with when this error ends it.
    pub fn stage(&self) -> Stage {
        match self {
            IngestError::FileNotFound(_) | IngestError::Io { .. } | IngestError::Parse(_) => {
                Stage::Parse
            }
            IngestError::Store(_) => Stage::Dedup,
            IngestError::Persist(_) => Stage::Persist,
        }
    }
}
