//! In-memory fakes for the external collaborators.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;

use crate::error::{MonitorError, Result};
use crate::notify::EventSink;
use crate::tmux::{ScreenSource, SessionActivity, SessionLister};

/// Scripted screens keyed by session; also acts as the session lister.
#[derive(Default)]
pub struct FakeScreens {
    screens: Mutex<HashMap<String, String>>,
    /// Overrides what `capture_visible` returns
    visible: Mutex<HashMap<String, String>>,
    timeouts: Mutex<HashSet<String>>,
    activity: Mutex<HashMap<String, SessionActivity>>,
    history_calls: Mutex<HashMap<String, usize>>,
    visible_calls: Mutex<HashMap<String, usize>>,
}

impl FakeScreens {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set(&self, session: &str, text: &str) {
        self.screens
            .lock()
            .insert(session.to_string(), text.to_string());
    }

    pub fn set_visible(&self, session: &str, text: &str) {
        self.visible
            .lock()
            .insert(session.to_string(), text.to_string());
    }

    pub fn clear_visible(&self, session: &str) {
        self.visible.lock().remove(session);
    }

    pub fn remove(&self, session: &str) {
        self.screens.lock().remove(session);
        self.visible.lock().remove(session);
    }

    pub fn set_timeout(&self, session: &str, timing_out: bool) {
        let mut timeouts = self.timeouts.lock();
        if timing_out {
            timeouts.insert(session.to_string());
        } else {
            timeouts.remove(session);
        }
    }

    pub fn set_activity(&self, session: &str, activity: SessionActivity) {
        self.activity.lock().insert(session.to_string(), activity);
    }

    pub fn history_captures(&self, session: &str) -> usize {
        self.history_calls.lock().get(session).copied().unwrap_or(0)
    }

    pub fn visible_captures(&self, session: &str) -> usize {
        self.visible_calls.lock().get(session).copied().unwrap_or(0)
    }

    fn read(&self, session: &str) -> Result<String> {
        if self.timeouts.lock().contains(session) {
            return Err(MonitorError::CaptureTimeout {
                session: session.to_string(),
                timeout: Duration::from_secs(5),
            });
        }
        self.screens
            .lock()
            .get(session)
            .cloned()
            .ok_or_else(|| MonitorError::SessionNotFound(session.to_string()))
    }
}

#[async_trait]
impl ScreenSource for FakeScreens {
    async fn capture(&self, session_id: &str, _history_lines: u32) -> Result<String> {
        *self
            .history_calls
            .lock()
            .entry(session_id.to_string())
            .or_default() += 1;
        self.read(session_id)
    }

    async fn capture_visible(&self, session_id: &str) -> Result<String> {
        *self
            .visible_calls
            .lock()
            .entry(session_id.to_string())
            .or_default() += 1;
        let text = self.read(session_id)?;
        Ok(self
            .visible
            .lock()
            .get(session_id)
            .cloned()
            .unwrap_or(text))
    }
}

#[async_trait]
impl SessionLister for FakeScreens {
    async fn list_sessions(&self) -> Result<Vec<String>> {
        let mut names: Vec<String> = self.screens.lock().keys().cloned().collect();
        names.sort();
        Ok(names)
    }

    async fn activity(&self, session_id: &str) -> Result<Option<SessionActivity>> {
        Ok(self.activity.lock().get(session_id).copied())
    }
}

/// Sink that records every delivery and answers with a configurable result.
pub struct RecordingSink {
    delivered: Mutex<Vec<(String, String)>>,
    succeed: AtomicBool,
}

impl RecordingSink {
    pub fn new() -> Self {
        Self {
            delivered: Mutex::new(Vec::new()),
            succeed: AtomicBool::new(true),
        }
    }

    pub fn failing() -> Self {
        let sink = Self::new();
        sink.succeed.store(false, Ordering::SeqCst);
        sink
    }

    pub fn deliveries(&self) -> Vec<(String, String)> {
        self.delivered.lock().clone()
    }

    pub fn count(&self) -> usize {
        self.delivered.lock().len()
    }
}

#[async_trait]
impl EventSink for RecordingSink {
    async fn deliver(&self, session_id: &str, message: &str) -> bool {
        self.delivered
            .lock()
            .push((session_id.to_string(), message.to_string()));
        self.succeed.load(Ordering::SeqCst)
    }
}

/// Lister with a fixed answer, independent of which screens exist.
#[derive(Default)]
pub struct StaticLister {
    names: Mutex<Vec<String>>,
}

impl StaticLister {
    pub fn new(names: &[&str]) -> Self {
        let lister = Self::default();
        lister.set(names);
        lister
    }

    pub fn set(&self, names: &[&str]) {
        *self.names.lock() = names.iter().map(|n| n.to_string()).collect();
    }
}

#[async_trait]
impl SessionLister for StaticLister {
    async fn list_sessions(&self) -> Result<Vec<String>> {
        Ok(self.names.lock().clone())
    }
}
