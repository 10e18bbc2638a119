mod client;
mod heuristics;

pub use client::TmuxClient;
pub use heuristics::{
    recent_lines, resolve, AgentStatus, MarkerHits, MarkerPatterns, MarkerRules,
    ALERT_WINDOW_LINES, WORKING_WINDOW_LINES,
};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::error::Result;

/// Timing signals tmux keeps for a session, as unix seconds.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct SessionActivity {
    /// When the session was created
    pub created_at: Option<f64>,
    /// Last time the session saw any input or output
    pub last_activity: Option<f64>,
}

/// Reads the rendered text of a monitored session.
#[async_trait]
pub trait ScreenSource: Send + Sync {
    /// Visible screen plus up to `history_lines` of scrollback.
    async fn capture(&self, session_id: &str, history_lines: u32) -> Result<String>;

    /// Exactly what is on screen right now, no scrollback.
    async fn capture_visible(&self, session_id: &str) -> Result<String>;
}

/// Enumerates the sessions that currently exist.
#[async_trait]
pub trait SessionLister: Send + Sync {
    async fn list_sessions(&self) -> Result<Vec<String>>;

    /// Creation and last-activity times, when the multiplexer exposes them.
    async fn activity(&self, _session_id: &str) -> Result<Option<SessionActivity>> {
        Ok(None)
    }
}
