use std::process::{Output, Stdio};
use std::time::Duration;

use async_trait::async_trait;
use tokio::process::Command;

use super::{ScreenSource, SessionActivity, SessionLister};
use crate::error::{MonitorError, Result};

/// Client for interacting with tmux via CLI
#[derive(Debug, Clone)]
pub struct TmuxClient {
    /// Path to tmux binary
    tmux_path: String,
    /// Hard bound on every tmux invocation
    timeout: Duration,
}

impl TmuxClient {
    pub fn new(timeout: Duration) -> Self {
        Self {
            tmux_path: "tmux".to_string(),
            timeout,
        }
    }

    /// Check if tmux server is running
    pub async fn is_server_running(&self) -> bool {
        Command::new(&self.tmux_path)
            .arg("list-sessions")
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .status()
            .await
            .map(|s| s.success())
            .unwrap_or(false)
    }

    /// Run tmux with `args`, killing it if it outlives the timeout.
    async fn run(&self, session_id: &str, args: &[&str]) -> Result<Output> {
        let child = Command::new(&self.tmux_path)
            .args(args)
            .stdin(Stdio::null())
            .kill_on_drop(true)
            .output();

        match tokio::time::timeout(self.timeout, child).await {
            Ok(output) => Ok(output?),
            Err(_) => Err(MonitorError::CaptureTimeout {
                session: session_id.to_string(),
                timeout: self.timeout,
            }),
        }
    }

    async fn capture_pane(&self, session_id: &str, extra: &[&str]) -> Result<String> {
        let target = pane_target(session_id);
        let mut args = vec!["capture-pane", "-p", "-t", target.as_str()];
        args.extend_from_slice(extra);

        let output = self.run(session_id, &args).await?;
        if !output.status.success() {
            return Err(command_error(session_id, &output));
        }
        Ok(String::from_utf8_lossy(&output.stdout).into_owned())
    }

    /// Get the command to attach to a session (for external execution)
    pub fn attach_command(&self, session_id: &str) -> Vec<String> {
        vec![
            self.tmux_path.clone(),
            "attach-session".to_string(),
            "-t".to_string(),
            exact_target(session_id),
        ]
    }
}

impl Default for TmuxClient {
    fn default() -> Self {
        Self::new(Duration::from_secs(5))
    }
}

/// `=name` makes tmux match the session name exactly instead of by prefix.
fn exact_target(session_id: &str) -> String {
    format!("={session_id}")
}

/// Active pane of the exactly-named session. Pane-level commands do not
/// resolve a bare `=name`, the trailing colon is required.
fn pane_target(session_id: &str) -> String {
    format!("={session_id}:")
}

fn command_error(session_id: &str, output: &Output) -> MonitorError {
    let stderr = String::from_utf8_lossy(&output.stderr);
    if is_missing_session(&stderr) {
        MonitorError::SessionNotFound(session_id.to_string())
    } else {
        MonitorError::CommandFailed(stderr.trim().to_string())
    }
}

fn is_missing_session(stderr: &str) -> bool {
    stderr.contains("can't find session")
        || stderr.contains("can't find pane")
        || stderr.contains("can't find window")
        || stderr.contains("no server running")
        || stderr.contains("session not found")
}

fn parse_session_names(stdout: &str) -> Vec<String> {
    stdout
        .lines()
        .map(str::trim)
        .filter(|line| !line.is_empty())
        .map(String::from)
        .collect()
}

fn parse_activity_line(line: &str) -> Option<SessionActivity> {
    let parts: Vec<&str> = line.trim().split('|').collect();
    if parts.len() < 2 {
        return None;
    }

    let seconds = |s: &str| s.parse::<f64>().ok().filter(|v| *v > 0.0);
    Some(SessionActivity {
        created_at: seconds(parts[0]),
        last_activity: seconds(parts[1]),
    })
}

#[async_trait]
impl ScreenSource for TmuxClient {
    async fn capture(&self, session_id: &str, history_lines: u32) -> Result<String> {
        let start_line = format!("-{history_lines}");
        self.capture_pane(session_id, &["-J", "-S", start_line.as_str()])
            .await
    }

    async fn capture_visible(&self, session_id: &str) -> Result<String> {
        self.capture_pane(session_id, &[]).await
    }
}

#[async_trait]
impl SessionLister for TmuxClient {
    /// List all tmux session names
    async fn list_sessions(&self) -> Result<Vec<String>> {
        let output = self
            .run("", &["list-sessions", "-F", "#{session_name}"])
            .await?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            if stderr.contains("no server running") || stderr.contains("no sessions") {
                return Ok(Vec::new());
            }
            return Err(MonitorError::CommandFailed(stderr.trim().to_string()));
        }

        Ok(parse_session_names(&String::from_utf8_lossy(&output.stdout)))
    }

    async fn activity(&self, session_id: &str) -> Result<Option<SessionActivity>> {
        let target = pane_target(session_id);
        let output = self
            .run(
                session_id,
                &[
                    "display-message",
                    "-p",
                    "-t",
                    target.as_str(),
                    "#{session_created}|#{session_activity}",
                ],
            )
            .await?;

        if !output.status.success() {
            return Err(command_error(session_id, &output));
        }

        Ok(parse_activity_line(&String::from_utf8_lossy(&output.stdout)))
    }
}
