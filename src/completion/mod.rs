//! Wait-time tracking: how long has a session been waiting on its user.
//!
//! Values derived from a recorded completion are accurate. Everything else
//! (repaired timestamps, fallback estimates) is flagged as an estimate so the
//! caller can present it as one.

mod estimator;
mod store;

pub use estimator::FallbackEstimator;
pub use store::{
    load_records, now_epoch, write_records, CompletionSettings, CompletionStore, RecordLookup,
    ValidationReport,
};

use std::sync::Arc;
use std::time::Duration;

use tracing::debug;

use crate::analyzer::StateAnalyzer;
use crate::tmux::SessionLister;

/// Where a wait time came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WaitSource {
    /// A recorded completion
    Recorded,
    /// A recorded completion that had to be repaired
    Corrected,
    /// Last tmux activity, with completion keywords on screen
    CompletedOnScreen,
    /// Last tmux activity only
    LastActivity,
    /// Session creation time
    SessionCreated,
    /// Still busy, nothing to wait on
    StillWorking,
    Unknown,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct WaitTime {
    pub duration: Duration,
    pub accurate: bool,
    pub source: WaitSource,
}

impl WaitTime {
    pub fn recorded(duration: Duration) -> Self {
        Self {
            duration,
            accurate: true,
            source: WaitSource::Recorded,
        }
    }

    pub fn estimated(duration: Duration, source: WaitSource) -> Self {
        Self {
            duration,
            accurate: false,
            source,
        }
    }

    /// Compact human form; estimates carry a leading `~`.
    pub fn display(&self) -> String {
        let secs = self.duration.as_secs();
        let body = if secs < 60 {
            format!("{secs}s")
        } else if secs < 3600 {
            format!("{}m {}s", secs / 60, secs % 60)
        } else {
            format!("{}h {}m", secs / 3600, (secs % 3600) / 60)
        };
        if self.accurate {
            body
        } else {
            format!("~{body}")
        }
    }
}

fn seconds_since(now: f64, then: f64) -> Duration {
    Duration::from_secs_f64((now - then).max(0.0))
}

/// Answers wait-time queries: recorded completions first, estimates second.
pub struct WaitTimeTracker {
    store: Arc<CompletionStore>,
    estimator: FallbackEstimator,
    lister: Arc<dyn SessionLister>,
    analyzer: Arc<StateAnalyzer>,
}

impl WaitTimeTracker {
    pub fn new(
        store: Arc<CompletionStore>,
        lister: Arc<dyn SessionLister>,
        analyzer: Arc<StateAnalyzer>,
    ) -> Self {
        let estimator =
            FallbackEstimator::new(analyzer.rules().clone(), store.settings().max_age);
        Self {
            store,
            estimator,
            lister,
            analyzer,
        }
    }

    pub fn store(&self) -> &Arc<CompletionStore> {
        &self.store
    }

    pub async fn wait_time(&self, session_id: &str) -> WaitTime {
        let now = now_epoch();
        match self.store.lookup_at(session_id, now) {
            RecordLookup::Recorded(ts) => WaitTime::recorded(seconds_since(now, ts)),
            RecordLookup::Corrected(ts) => {
                WaitTime::estimated(seconds_since(now, ts), WaitSource::Corrected)
            }
            RecordLookup::Missing => {
                let activity = match self.lister.activity(session_id).await {
                    Ok(activity) => activity,
                    Err(e) => {
                        debug!(session = %session_id, "no activity info: {e}");
                        None
                    }
                };
                let screen = self.analyzer.screen(session_id).await.ok();
                self.estimator.estimate(now, activity, screen.as_deref())
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::CacheConfig;
    use crate::testing::FakeScreens;
    use crate::tmux::{MarkerRules, SessionActivity};

    fn tracker(screens: Arc<FakeScreens>) -> WaitTimeTracker {
        let analyzer = Arc::new(StateAnalyzer::new(
            screens.clone(),
            MarkerRules::default(),
            50,
            &CacheConfig::default(),
        ));
        let store = Arc::new(CompletionStore::in_memory(CompletionSettings::default()));
        WaitTimeTracker::new(store, screens, analyzer)
    }

    #[tokio::test]
    async fn mark_then_wait_is_accurate_and_near_zero() {
        let tracker = tracker(Arc::new(FakeScreens::new()));
        tracker.store().mark_completion("s", false);

        let wait = tracker.wait_time("s").await;
        assert!(wait.accurate);
        assert_eq!(wait.source, WaitSource::Recorded);
        assert!(wait.duration < Duration::from_secs(2));
    }

    #[tokio::test]
    async fn future_record_is_reported_as_estimate() {
        let tracker = tracker(Arc::new(FakeScreens::new()));
        tracker.store().insert_raw("s", now_epoch() + 3600.0);

        let wait = tracker.wait_time("s").await;
        assert!(!wait.accurate);
        assert_eq!(wait.source, WaitSource::Corrected);
        assert!(wait.duration >= Duration::from_secs(170));
        assert!(wait.duration <= Duration::from_secs(190));
    }

    #[tokio::test]
    async fn missing_record_uses_estimator() {
        let screens = Arc::new(FakeScreens::new());
        screens.set("s", "All done ✓\n$ ");
        screens.set_activity(
            "s",
            SessionActivity {
                created_at: Some(now_epoch() - 3600.0),
                last_activity: Some(now_epoch() - 120.0),
            },
        );
        let tracker = tracker(screens);

        let wait = tracker.wait_time("s").await;
        assert!(!wait.accurate);
        assert_eq!(wait.source, WaitSource::CompletedOnScreen);
        assert!(wait.duration >= Duration::from_secs(118));
    }

    #[test]
    fn display_marks_estimates() {
        assert_eq!(WaitTime::recorded(Duration::from_secs(42)).display(), "42s");
        assert_eq!(
            WaitTime::estimated(Duration::from_secs(125), WaitSource::LastActivity).display(),
            "~2m 5s"
        );
        assert_eq!(
            WaitTime::recorded(Duration::from_secs(2 * 3600 + 120)).display(),
            "2h 2m"
        );
    }
}
