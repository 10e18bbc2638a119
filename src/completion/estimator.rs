use std::time::Duration;

use super::{WaitSource, WaitTime};
use crate::tmux::{AgentStatus, MarkerRules, SessionActivity};

/// Guesses how long a session has been waiting when no completion was
/// recorded, from tmux's own timestamps and what is still on screen.
pub struct FallbackEstimator {
    rules: MarkerRules,
    max_age: Duration,
}

impl FallbackEstimator {
    pub fn new(rules: MarkerRules, max_age: Duration) -> Self {
        Self { rules, max_age }
    }

    pub fn estimate(
        &self,
        now: f64,
        activity: Option<SessionActivity>,
        screen: Option<&str>,
    ) -> WaitTime {
        if let Some(text) = screen {
            if self.rules.classify(Some(text)) == AgentStatus::Working {
                return WaitTime::estimated(Duration::ZERO, WaitSource::StillWorking);
            }
        }

        let activity = activity.unwrap_or_default();
        if let Some(last) = activity.last_activity {
            let source = match screen {
                Some(text) if self.rules.has_completion_hint(text) => WaitSource::CompletedOnScreen,
                _ => WaitSource::LastActivity,
            };
            return WaitTime::estimated(self.since(now, last), source);
        }

        if let Some(created) = activity.created_at {
            return WaitTime::estimated(self.since(now, created), WaitSource::SessionCreated);
        }

        WaitTime::estimated(Duration::ZERO, WaitSource::Unknown)
    }

    fn since(&self, now: f64, then: f64) -> Duration {
        let secs = (now - then).max(0.0);
        Duration::from_secs_f64(secs).min(self.max_age)
    }
}
