use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::RwLock;

use crate::notify::NotifyReason;
use crate::quiet::ScreenHash;
use crate::tmux::AgentStatus;

/// Lifecycle of the monitor watching a session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum MonitorPhase {
    /// Started, no successful capture yet
    #[default]
    New,
    Polling,
    /// Session is gone; the monitor has exited
    Terminated,
}

/// Everything tracked about one monitored session.
#[derive(Debug, Clone)]
pub struct Session {
    pub id: String,
    pub phase: MonitorPhase,
    /// State used for transition decisions
    pub last_state: AgentStatus,
    /// Latest observation; `Unknown` while captures are failing
    pub observed: AgentStatus,
    pub screen_hash: Option<ScreenHash>,
    /// When the screen content last changed
    pub last_activity: Option<Instant>,
    pub notification_sent: bool,
    pub last_notification: Option<Instant>,
    pub last_notified_state: Option<AgentStatus>,
    pub capture_failures: u32,
}

impl Session {
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            phase: MonitorPhase::New,
            last_state: AgentStatus::Unknown,
            observed: AgentStatus::Unknown,
            screen_hash: None,
            last_activity: None,
            notification_sent: false,
            last_notification: None,
            last_notified_state: None,
            capture_failures: 0,
        }
    }

    /// Decide whether moving to `current` warrants a notification.
    ///
    /// `last_state` is the previous state and `notification_sent` must
    /// already reflect any reset for this poll. Within the cooldown only a
    /// real transition to a state other than the last notified one passes.
    pub fn should_notify(
        &self,
        current: AgentStatus,
        quiet: bool,
        now: Instant,
        cooldown: Duration,
    ) -> Option<NotifyReason> {
        let reason = transition_trigger(self.last_state, current, quiet)?;
        if self.notification_sent {
            return None;
        }

        if let Some(last) = self.last_notification {
            let cooling = now.saturating_duration_since(last) < cooldown;
            let fresh_target =
                reason != NotifyReason::WentQuiet && self.last_notified_state != Some(current);
            if cooling && !fresh_target {
                return None;
            }
        }

        Some(reason)
    }

    pub fn record_notification(&mut self, state: AgentStatus, now: Instant) {
        self.notification_sent = true;
        self.last_notification = Some(now);
        self.last_notified_state = Some(state);
    }
}

/// The raw notify-worthy condition, before cooldown and dedupe.
pub fn transition_trigger(
    previous: AgentStatus,
    current: AgentStatus,
    quiet: bool,
) -> Option<NotifyReason> {
    if current == AgentStatus::WaitingForInput && previous != AgentStatus::WaitingForInput {
        Some(NotifyReason::NeedsInput)
    } else if previous == AgentStatus::Working
        && !matches!(current, AgentStatus::Working | AgentStatus::Unknown)
    {
        Some(NotifyReason::Finished)
    } else if quiet && current != AgentStatus::Working {
        Some(NotifyReason::WentQuiet)
    } else {
        None
    }
}

/// A state change, kept only long enough to log and decide on it.
#[derive(Debug, Clone)]
pub struct StateTransition {
    pub session_id: String,
    pub from: AgentStatus,
    pub to: AgentStatus,
    pub at: Instant,
}

/// Single map of session id → latest published `Session`.
///
/// Each monitor publishes its own entry; everyone else reads copies.
#[derive(Debug, Clone, Default)]
pub struct SessionRegistry {
    inner: Arc<RwLock<HashMap<String, Session>>>,
}

impl SessionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn publish(&self, session: &Session) {
        self.inner
            .write()
            .insert(session.id.clone(), session.clone());
    }

    pub fn remove(&self, session_id: &str) -> Option<Session> {
        self.inner.write().remove(session_id)
    }

    pub fn get(&self, session_id: &str) -> Option<Session> {
        self.inner.read().get(session_id).cloned()
    }

    pub fn contains(&self, session_id: &str) -> bool {
        self.inner.read().contains_key(session_id)
    }

    pub fn ids(&self) -> Vec<String> {
        self.inner.read().keys().cloned().collect()
    }

    /// Copies of every session, sorted by id.
    pub fn snapshot(&self) -> Vec<Session> {
        let mut sessions: Vec<Session> = self.inner.read().values().cloned().collect();
        sessions.sort_by(|a, b| a.id.cmp(&b.id));
        sessions
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const COOLDOWN: Duration = Duration::from_secs(30);

    fn session(last_state: AgentStatus) -> Session {
        let mut session = Session::new("s");
        session.last_state = last_state;
        session
    }

    #[test]
    fn leaving_working_notifies() {
        let now = Instant::now();
        for current in [AgentStatus::Idle, AgentStatus::Error] {
            assert_eq!(
                session(AgentStatus::Working).should_notify(current, false, now, COOLDOWN),
                Some(NotifyReason::Finished)
            );
        }
    }

    #[test]
    fn staying_working_or_losing_capture_does_not_notify() {
        let now = Instant::now();
        let s = session(AgentStatus::Working);
        assert_eq!(s.should_notify(AgentStatus::Working, false, now, COOLDOWN), None);
        assert_eq!(s.should_notify(AgentStatus::Working, true, now, COOLDOWN), None);
        assert_eq!(s.should_notify(AgentStatus::Unknown, false, now, COOLDOWN), None);
    }

    #[test]
    fn entering_waiting_notifies() {
        let now = Instant::now();
        for previous in [AgentStatus::Idle, AgentStatus::Working, AgentStatus::Unknown] {
            assert_eq!(
                session(previous).should_notify(AgentStatus::WaitingForInput, false, now, COOLDOWN),
                Some(NotifyReason::NeedsInput)
            );
        }
        assert_eq!(
            session(AgentStatus::WaitingForInput).should_notify(
                AgentStatus::WaitingForInput,
                false,
                now,
                COOLDOWN
            ),
            None
        );
    }

    #[test]
    fn idle_to_idle_needs_quiet() {
        let now = Instant::now();
        let s = session(AgentStatus::Idle);
        assert_eq!(s.should_notify(AgentStatus::Idle, false, now, COOLDOWN), None);
        assert_eq!(
            s.should_notify(AgentStatus::Idle, true, now, COOLDOWN),
            Some(NotifyReason::WentQuiet)
        );
    }

    #[test]
    fn sent_flag_blocks_repeat() {
        let now = Instant::now();
        let mut s = session(AgentStatus::Idle);
        s.notification_sent = true;
        assert_eq!(s.should_notify(AgentStatus::Idle, true, now, COOLDOWN), None);
    }

    #[test]
    fn cooldown_blocks_same_target() {
        let start = Instant::now();
        let mut s = session(AgentStatus::Working);
        s.record_notification(AgentStatus::Idle, start);
        s.notification_sent = false;

        let soon = start + Duration::from_secs(10);
        assert_eq!(s.should_notify(AgentStatus::Idle, false, soon, COOLDOWN), None);

        let later = start + Duration::from_secs(31);
        assert_eq!(
            s.should_notify(AgentStatus::Idle, false, later, COOLDOWN),
            Some(NotifyReason::Finished)
        );
    }

    #[test]
    fn cooldown_lets_a_different_target_through() {
        let start = Instant::now();
        let mut s = session(AgentStatus::Working);
        s.record_notification(AgentStatus::Idle, start);
        s.notification_sent = false;

        let soon = start + Duration::from_secs(5);
        assert_eq!(
            s.should_notify(AgentStatus::WaitingForInput, false, soon, COOLDOWN),
            Some(NotifyReason::NeedsInput)
        );
        s.last_state = AgentStatus::Idle;
        assert_eq!(s.should_notify(AgentStatus::Idle, true, soon, COOLDOWN), None);
    }

    #[test]
    fn cooldown_holds_over_a_flapping_sequence() {
        // Working/Idle flapping every poll must deliver exactly once per window.
        let start = Instant::now();
        let mut s = Session::new("s");
        let mut deliveries: Vec<(Instant, AgentStatus)> = Vec::new();

        for tick in 0..40u64 {
            let now = start + Duration::from_secs(tick * 3);
            let current = if tick % 2 == 0 {
                AgentStatus::Working
            } else {
                AgentStatus::Idle
            };
            if current != s.last_state {
                s.notification_sent = false;
            }
            if s.should_notify(current, false, now, COOLDOWN).is_some() {
                s.record_notification(current, now);
                deliveries.push((now, current));
            }
            s.last_state = current;
        }

        assert!(deliveries.len() > 1);
        for pair in deliveries.windows(2) {
            let (earlier, later) = (pair[0], pair[1]);
            assert!(
                later.0 - earlier.0 >= COOLDOWN || later.1 != earlier.1,
                "deliveries too close: {pair:?}"
            );
        }
    }

    #[test]
    fn registry_snapshot_is_sorted_copy() {
        let registry = SessionRegistry::new();
        registry.publish(&Session::new("b"));
        registry.publish(&Session::new("a"));

        let mut snapshot = registry.snapshot();
        assert_eq!(snapshot[0].id, "a");
        snapshot[0].notification_sent = true;
        assert!(!registry.get("a").unwrap().notification_sent);

        registry.remove("a");
        assert!(!registry.contains("a"));
        assert_eq!(registry.ids(), vec!["b".to_string()]);
    }
}
