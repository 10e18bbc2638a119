//! Notification delivery.
//!
//! The core hands a structured [`Notification`] to `notify`; plain sinks only
//! see `deliver(session, message) -> bool`. Failures are logged by the caller
//! and never retried here.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::process::Command;
use tokio::sync::mpsc;
use tracing::{info, warn};

use crate::tmux::{recent_lines, AgentStatus};

/// Screen lines quoted at the end of a notification.
const TAIL_LINES: usize = 5;

#[async_trait]
pub trait EventSink: Send + Sync {
    async fn deliver(&self, session_id: &str, message: &str) -> bool;

    /// Sinks that can use the reason and status override this.
    async fn notify(&self, notification: &Notification) -> bool {
        self.deliver(&notification.session_id, &notification.message)
            .await
    }
}

/// Why a session is being surfaced.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NotifyReason {
    /// Left the working state
    Finished,
    /// Started asking for input
    NeedsInput,
    /// Output settled without an explicit completion marker
    WentQuiet,
}

impl NotifyReason {
    fn describe(self, status: AgentStatus) -> &'static str {
        match (self, status) {
            (NotifyReason::NeedsInput, _) => "needs your input",
            (_, AgentStatus::Error) => "hit an error",
            (NotifyReason::Finished, _) => "finished working",
            (NotifyReason::WentQuiet, _) => "went quiet",
        }
    }
}

/// A delivered (or attempted) notification, as shown on the dashboard.
#[derive(Debug, Clone)]
pub struct Notification {
    pub session_id: String,
    /// `None` for plain messages that did not come from a monitor.
    pub reason: Option<NotifyReason>,
    pub status: AgentStatus,
    pub message: String,
    pub at: chrono::DateTime<chrono::Local>,
}

impl Notification {
    pub fn new(session_id: &str, reason: NotifyReason, status: AgentStatus, screen: &str) -> Self {
        Self {
            session_id: session_id.to_string(),
            reason: Some(reason),
            status,
            message: format_message(session_id, reason, status, screen),
            at: chrono::Local::now(),
        }
    }

    fn plain(session_id: &str, message: &str) -> Self {
        Self {
            session_id: session_id.to_string(),
            reason: None,
            status: AgentStatus::Unknown,
            message: message.to_string(),
            at: chrono::Local::now(),
        }
    }

    pub fn headline(&self) -> &str {
        self.message.lines().next().unwrap_or_default()
    }

    /// Quoted screen lines after the headline, blank separators dropped.
    pub fn tail(&self) -> impl Iterator<Item = &str> {
        self.message
            .lines()
            .skip(1)
            .filter(|line| !line.trim().is_empty())
    }
}

/// Build the message text: one headline plus the tail of the screen.
pub fn format_message(
    session_id: &str,
    reason: NotifyReason,
    status: AgentStatus,
    screen: &str,
) -> String {
    let mut message = format!("[{session_id}] {}", reason.describe(status));
    let tail: Vec<&str> = recent_lines(screen, TAIL_LINES * 3)
        .into_iter()
        .filter(|line| !line.trim().is_empty())
        .collect();
    let tail = &tail[tail.len().saturating_sub(TAIL_LINES)..];
    if !tail.is_empty() {
        message.push_str("\n\n");
        message.push_str(&tail.join("\n"));
    }
    message
}

/// Writes notifications to the log.
pub struct LogSink;

#[async_trait]
impl EventSink for LogSink {
    async fn deliver(&self, session_id: &str, message: &str) -> bool {
        info!(session = %session_id, "{message}");
        true
    }
}

/// Runs an external command with the message as its last argument.
pub struct CommandSink {
    program: String,
    args: Vec<String>,
    timeout: Duration,
}

impl CommandSink {
    /// `None` when the command line is empty.
    pub fn new(command: &[String], timeout: Duration) -> Option<Self> {
        let (program, args) = command.split_first()?;
        Some(Self {
            program: program.clone(),
            args: args.to_vec(),
            timeout,
        })
    }
}

#[async_trait]
impl EventSink for CommandSink {
    async fn deliver(&self, session_id: &str, message: &str) -> bool {
        let status = Command::new(&self.program)
            .args(&self.args)
            .arg(message)
            .env("HERALD_SESSION", session_id)
            .env("HERALD_MESSAGE", message)
            .stdin(std::process::Stdio::null())
            .stdout(std::process::Stdio::null())
            .stderr(std::process::Stdio::null())
            .kill_on_drop(true)
            .status();

        match tokio::time::timeout(self.timeout, status).await {
            Ok(Ok(status)) if status.success() => true,
            Ok(Ok(status)) => {
                warn!(session = %session_id, program = %self.program, %status, "notify command failed");
                false
            }
            Ok(Err(e)) => {
                warn!(session = %session_id, program = %self.program, "notify command error: {e}");
                false
            }
            Err(_) => {
                warn!(session = %session_id, program = %self.program, "notify command timed out");
                false
            }
        }
    }
}

/// Forwards notifications to the dashboard.
pub struct ChannelSink {
    tx: mpsc::UnboundedSender<Notification>,
}

impl ChannelSink {
    pub fn new(tx: mpsc::UnboundedSender<Notification>) -> Self {
        Self { tx }
    }
}

#[async_trait]
impl EventSink for ChannelSink {
    async fn deliver(&self, session_id: &str, message: &str) -> bool {
        self.tx.send(Notification::plain(session_id, message)).is_ok()
    }

    async fn notify(&self, notification: &Notification) -> bool {
        self.tx.send(notification.clone()).is_ok()
    }
}

/// Delivers to every sink; succeeds if any of them did.
pub struct FanoutSink {
    sinks: Vec<Arc<dyn EventSink>>,
}

impl FanoutSink {
    pub fn new(sinks: Vec<Arc<dyn EventSink>>) -> Self {
        Self { sinks }
    }
}

#[async_trait]
impl EventSink for FanoutSink {
    async fn deliver(&self, session_id: &str, message: &str) -> bool {
        let mut any = false;
        for sink in &self.sinks {
            any |= sink.deliver(session_id, message).await;
        }
        any
    }

    async fn notify(&self, notification: &Notification) -> bool {
        let mut any = false;
        for sink in &self.sinks {
            any |= sink.notify(notification).await;
        }
        any
    }
}
