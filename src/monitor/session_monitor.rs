use std::sync::Arc;
use std::time::Instant;

use tokio::sync::watch;
use tracing::{debug, info, warn};

use super::session::{MonitorPhase, Session, SessionRegistry, StateTransition};
use crate::analyzer::StateAnalyzer;
use crate::completion::CompletionStore;
use crate::config::MonitorConfig;
use crate::error::MonitorError;
use crate::notify::{EventSink, Notification, NotifyReason};
use crate::quiet::QuietCompletionDetector;
use crate::tmux::AgentStatus;

/// Shared collaborators handed to every monitor.
pub struct MonitorContext {
    pub analyzer: Arc<StateAnalyzer>,
    pub quiet: Arc<QuietCompletionDetector>,
    pub completions: Arc<CompletionStore>,
    pub sink: Arc<dyn EventSink>,
    pub sessions: SessionRegistry,
    pub settings: MonitorConfig,
}

impl MonitorContext {
    /// Remove every trace of a session except its completion record.
    pub fn purge(&self, session_id: &str) {
        self.analyzer.forget(session_id);
        self.quiet.forget(session_id);
        self.sessions.remove(session_id);
    }

    /// Whether any in-memory state remains for the session.
    pub fn holds_state_for(&self, session_id: &str) -> bool {
        self.analyzer.is_cached(session_id)
            || self.quiet.is_tracking(session_id)
            || self.sessions.contains(session_id)
    }
}

/// What one poll did.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PollOutcome {
    Observed(AgentStatus),
    Notified(NotifyReason),
    CaptureFailed,
    Terminated,
}

/// Polls one session and decides when it needs attention.
pub struct SessionMonitor {
    ctx: Arc<MonitorContext>,
    session: Session,
}

impl SessionMonitor {
    pub fn new(ctx: Arc<MonitorContext>, session_id: impl Into<String>) -> Self {
        let session = Session::new(session_id);
        ctx.sessions.publish(&session);
        Self { ctx, session }
    }

    pub fn session(&self) -> &Session {
        &self.session
    }

    /// Poll until the session disappears or `shutdown` flips.
    pub async fn run(mut self, mut shutdown: watch::Receiver<bool>) {
        let interval = self.ctx.settings.poll_interval();
        info!(session = %self.session.id, "monitor started");

        loop {
            tokio::select! {
                outcome = self.poll_once() => {
                    if outcome == PollOutcome::Terminated {
                        return;
                    }
                }
                _ = shutdown.changed() => break,
            }

            tokio::select! {
                _ = tokio::time::sleep(interval) => {}
                _ = shutdown.changed() => break,
            }
        }

        debug!(session = %self.session.id, "monitor stopped");
    }

    /// One capture → classify → decide → notify cycle.
    pub async fn poll_once(&mut self) -> PollOutcome {
        let id = self.session.id.clone();
        let analyzer = Arc::clone(&self.ctx.analyzer);

        let captured = match analyzer.state(&id).await {
            Ok(status) => analyzer.screen(&id).await.map(|screen| (status, screen)),
            Err(e) => Err(e),
        };
        let (status, screen) = match captured {
            Ok(reading) => reading,
            Err(e) => return self.capture_failed(e),
        };

        if self.session.phase == MonitorPhase::New {
            self.session.phase = MonitorPhase::Polling;
            debug!(session = %id, ?status, "first capture");
        }
        self.session.capture_failures = 0;

        let now = Instant::now();
        let observation = self.ctx.quiet.observe(&id, &screen, status);
        if observation.changed {
            self.session.screen_hash = Some(observation.hash);
            self.session.last_activity = Some(now);
        }

        let previous = self.session.last_state;
        if status != previous || observation.changed {
            self.session.notification_sent = false;
        }

        let cooldown = self.ctx.settings.cooldown();
        let mut current = status;
        let mut message_screen = screen;
        let mut reason = self
            .session
            .should_notify(current, observation.quiet, now, cooldown);

        // Confirm against exactly what is visible before acting.
        if reason.is_some() {
            match analyzer.fresh_state(&id).await {
                Ok(fresh) => {
                    current = fresh.status;
                    message_screen = fresh.screen;
                    let still_quiet = observation.quiet
                        && !matches!(
                            current,
                            AgentStatus::Working | AgentStatus::Error | AgentStatus::WaitingForInput
                        );
                    reason = self.session.should_notify(current, still_quiet, now, cooldown);
                }
                Err(e) => return self.capture_failed(e),
            }
        }

        if current != previous {
            let transition = StateTransition {
                session_id: id.clone(),
                from: previous,
                to: current,
                at: now,
            };
            debug!(
                session = %transition.session_id,
                from = ?transition.from,
                to = ?transition.to,
                "state transition"
            );
        }
        self.session.last_state = current;
        self.session.observed = current;

        let outcome = match reason {
            Some(reason) => {
                self.notify(reason, current, &message_screen, now).await;
                PollOutcome::Notified(reason)
            }
            None => PollOutcome::Observed(current),
        };

        self.ctx.sessions.publish(&self.session);
        outcome
    }

    async fn notify(&mut self, reason: NotifyReason, state: AgentStatus, screen: &str, now: Instant) {
        let id = self.session.id.clone();

        // Recorded before delivery so a failing sink cannot skew wait times.
        self.ctx.completions.mark_completion(&id, false);

        let notification = Notification::new(&id, reason, state, screen);
        let delivery = self.ctx.sink.notify(&notification);
        let delivered =
            match tokio::time::timeout(self.ctx.settings.delivery_timeout(), delivery).await {
                Ok(delivered) => delivered,
                Err(_) => {
                    warn!(session = %id, "notification delivery timed out");
                    false
                }
            };

        if delivered {
            info!(session = %id, ?reason, ?state, "notified");
        } else {
            warn!(session = %id, ?reason, "notification was not delivered");
        }

        self.session.record_notification(state, now);
    }

    fn capture_failed(&mut self, error: MonitorError) -> PollOutcome {
        if error.is_not_found() {
            return self.terminate();
        }

        self.session.capture_failures += 1;
        if self.session.capture_failures == 1 {
            warn!(session = %self.session.id, "capture failed: {error}");
        } else {
            debug!(
                session = %self.session.id,
                failures = self.session.capture_failures,
                "capture still failing: {error}"
            );
        }
        self.session.observed = AgentStatus::Unknown;
        self.ctx.sessions.publish(&self.session);
        PollOutcome::CaptureFailed
    }

    fn terminate(&mut self) -> PollOutcome {
        info!(session = %self.session.id, "session gone, monitor terminating");
        self.session.phase = MonitorPhase::Terminated;
        self.ctx.purge(&self.session.id);
        PollOutcome::Terminated
    }
}
