//! Error types for the monitoring core.

use std::path::PathBuf;
use std::time::Duration;

use thiserror::Error;

#[derive(Debug, Error)]
pub enum MonitorError {
    #[error("capture of session '{session}' timed out after {timeout:?}")]
    CaptureTimeout { session: String, timeout: Duration },

    #[error("session '{0}' not found")]
    SessionNotFound(String),

    #[error("tmux command failed: {0}")]
    CommandFailed(String),

    #[error("failed to write completion records to {}: {source}", path.display())]
    PersistenceWriteFailed {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("completion records at {} are corrupt: {detail}", path.display())]
    PersistenceCorrupt { path: PathBuf, detail: String },

    #[error("tmux io error: {0}")]
    Io(#[from] std::io::Error),
}

impl MonitorError {
    /// Whether the monitored session is gone for good.
    pub fn is_not_found(&self) -> bool {
        matches!(self, MonitorError::SessionNotFound(_))
    }
}

pub type Result<T> = std::result::Result<T, MonitorError>;
