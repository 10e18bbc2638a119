//! Discovery and lifecycle management for session monitors.
//!
//! The supervisor task is the only owner of the monitor handle map, which is
//! what guarantees at most one live monitor per session id.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::{interval, interval_at, Instant, MissedTickBehavior};
use tracing::{debug, error, info, warn};

use super::session_monitor::{MonitorContext, SessionMonitor};
use crate::completion::now_epoch;
use crate::config::SupervisorConfig;
use crate::error::Result;
use crate::tmux::SessionLister;

struct MonitorHandle {
    shutdown: watch::Sender<bool>,
    task: JoinHandle<()>,
}

/// What a discovery tick changed.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct DiscoveryReport {
    pub started: Vec<String>,
    pub stopped: Vec<String>,
    pub restarted: Vec<String>,
}

impl DiscoveryReport {
    pub fn is_empty(&self) -> bool {
        self.started.is_empty() && self.stopped.is_empty() && self.restarted.is_empty()
    }
}

/// Entries dropped by a cache sweep.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct SweepReport {
    pub cache_entries: usize,
    pub quiet_trackers: usize,
    pub completions: usize,
}

pub struct MonitorSupervisor {
    ctx: Arc<MonitorContext>,
    lister: Arc<dyn SessionLister>,
    config: SupervisorConfig,
    join_timeout: Duration,
    monitors: HashMap<String, MonitorHandle>,
}

impl MonitorSupervisor {
    pub fn new(
        ctx: Arc<MonitorContext>,
        lister: Arc<dyn SessionLister>,
        config: SupervisorConfig,
    ) -> Self {
        let join_timeout = ctx.settings.join_timeout();
        Self {
            ctx,
            lister,
            config,
            join_timeout,
            monitors: HashMap::new(),
        }
    }

    pub fn context(&self) -> &Arc<MonitorContext> {
        &self.ctx
    }

    /// Ids with a monitor handle, sorted.
    pub fn monitored(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.monitors.keys().cloned().collect();
        ids.sort();
        ids
    }

    /// Whether a monitor for the session exists and has not exited.
    pub fn is_running(&self, session_id: &str) -> bool {
        self.monitors
            .get(session_id)
            .is_some_and(|handle| !handle.task.is_finished())
    }

    /// Reconcile running monitors with the sessions that exist right now.
    pub async fn discover_once(&mut self) -> Result<DiscoveryReport> {
        let listed: Vec<String> = self
            .lister
            .list_sessions()
            .await?
            .into_iter()
            .filter(|id| !self.config.ignore.contains(id))
            .collect();
        let alive: HashSet<&str> = listed.iter().map(String::as_str).collect();
        let mut report = DiscoveryReport::default();

        let vanished: Vec<String> = self
            .monitors
            .keys()
            .filter(|id| !alive.contains(id.as_str()))
            .cloned()
            .collect();
        for id in vanished {
            self.stop(&id).await;
            self.ctx.purge(&id);
            info!(session = %id, "session vanished, monitor stopped");
            report.stopped.push(id);
        }

        // Leftovers from monitors that exited on their own
        for id in self.ctx.sessions.ids() {
            if !alive.contains(id.as_str()) && !self.monitors.contains_key(&id) {
                self.ctx.purge(&id);
            }
        }

        for id in &listed {
            let finished = self.monitors.get(id).map(|handle| handle.task.is_finished());
            match finished {
                Some(false) => continue,
                Some(true) => {
                    if let Some(handle) = self.monitors.remove(id) {
                        if let Err(e) = handle.task.await {
                            if e.is_panic() {
                                error!(session = %id, "monitor panicked, restarting");
                            }
                        }
                    }
                    self.spawn(id);
                    report.restarted.push(id.clone());
                }
                None => {
                    self.spawn(id);
                    report.started.push(id.clone());
                }
            }
        }

        Ok(report)
    }

    fn spawn(&mut self, session_id: &str) {
        let (shutdown, rx) = watch::channel(false);
        let monitor = SessionMonitor::new(Arc::clone(&self.ctx), session_id);
        let task = tokio::spawn(monitor.run(rx));
        self.monitors
            .insert(session_id.to_string(), MonitorHandle { shutdown, task });
        debug!(session = %session_id, "monitor spawned");
    }

    /// Signal a monitor and wait for it, aborting it if it will not stop.
    async fn stop(&mut self, session_id: &str) {
        let Some(mut handle) = self.monitors.remove(session_id) else {
            return;
        };
        let _ = handle.shutdown.send(true);

        match tokio::time::timeout(self.join_timeout, &mut handle.task).await {
            Ok(Ok(())) => {}
            Ok(Err(e)) if e.is_panic() => {
                error!(session = %session_id, "monitor panicked while stopping");
            }
            Ok(Err(_)) => {}
            Err(_) => {
                warn!(session = %session_id, "monitor did not stop in time, aborting");
                handle.task.abort();
            }
        }
    }

    /// Drop expired cache entries and stale completion records.
    pub fn sweep(&self) -> SweepReport {
        SweepReport {
            cache_entries: self.ctx.analyzer.prune_expired(),
            quiet_trackers: self.ctx.quiet.prune_idle(self.config.sweep_interval()),
            completions: self.ctx.completions.prune_stale_at(now_epoch()),
        }
    }

    /// Stop every monitor.
    pub async fn shutdown_all(&mut self) {
        let ids: Vec<String> = self.monitors.keys().cloned().collect();
        for id in ids {
            self.stop(&id).await;
        }
    }

    /// Discovery and sweep loop; returns after stopping all monitors once
    /// `shutdown` flips.
    pub async fn run(mut self, mut shutdown: watch::Receiver<bool>) {
        let mut discovery = interval(self.config.discovery_interval());
        discovery.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let sweep_every = self.config.sweep_interval();
        let mut sweep = interval_at(Instant::now() + sweep_every, sweep_every);
        sweep.set_missed_tick_behavior(MissedTickBehavior::Delay);

        info!("supervisor started");
        loop {
            tokio::select! {
                _ = discovery.tick() => match self.discover_once().await {
                    Ok(report) if !report.is_empty() => info!(
                        started = report.started.len(),
                        stopped = report.stopped.len(),
                        restarted = report.restarted.len(),
                        "discovery"
                    ),
                    Ok(_) => {}
                    Err(e) => warn!("session discovery failed: {e}"),
                },
                _ = sweep.tick() => {
                    let report = self.sweep();
                    debug!(?report, "cache sweep");
                }
                _ = shutdown.changed() => break,
            }
        }

        self.shutdown_all().await;
        info!("supervisor stopped");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::analyzer::StateAnalyzer;
    use crate::completion::{CompletionSettings, CompletionStore};
    use crate::config::{CacheConfig, MonitorConfig};
    use crate::monitor::SessionRegistry;
    use crate::quiet::QuietCompletionDetector;
    use crate::testing::{FakeScreens, RecordingSink, StaticLister};
    use crate::tmux::MarkerRules;

    fn context(screens: Arc<FakeScreens>) -> Arc<MonitorContext> {
        Arc::new(MonitorContext {
            analyzer: Arc::new(StateAnalyzer::new(
                screens,
                MarkerRules::default(),
                50,
                &CacheConfig::default(),
            )),
            quiet: Arc::new(QuietCompletionDetector::new(MarkerRules::default(), 3)),
            completions: Arc::new(CompletionStore::in_memory(CompletionSettings::default())),
            sink: Arc::new(RecordingSink::new()),
            sessions: SessionRegistry::new(),
            settings: MonitorConfig::default(),
        })
    }

    async fn wait_until(mut condition: impl FnMut() -> bool) {
        for _ in 0..200 {
            if condition() {
                return;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        panic!("condition not reached");
    }

    #[tokio::test]
    async fn starts_one_monitor_per_session() {
        let screens = Arc::new(FakeScreens::new());
        screens.set("a", "$ ");
        screens.set("b", "$ ");
        let mut supervisor =
            MonitorSupervisor::new(context(screens.clone()), screens, SupervisorConfig::default());

        let report = supervisor.discover_once().await.unwrap();
        assert_eq!(report.started, vec!["a".to_string(), "b".to_string()]);
        assert!(supervisor.is_running("a"));

        let report = supervisor.discover_once().await.unwrap();
        assert!(report.is_empty());
        assert_eq!(supervisor.monitored(), vec!["a".to_string(), "b".to_string()]);

        supervisor.shutdown_all().await;
        assert!(supervisor.monitored().is_empty());
    }

    #[tokio::test]
    async fn vanished_session_is_fully_purged() {
        let screens = Arc::new(FakeScreens::new());
        screens.set("a", "$ ");
        screens.set("x", "file1.txt\nuser@host$ ");
        let ctx = context(screens.clone());
        let mut supervisor =
            MonitorSupervisor::new(ctx.clone(), screens.clone(), SupervisorConfig::default());

        supervisor.discover_once().await.unwrap();
        wait_until(|| ctx.quiet.is_tracking("x")).await;
        assert!(ctx.holds_state_for("x"));

        screens.remove("x");
        let report = supervisor.discover_once().await.unwrap();
        assert_eq!(report.stopped, vec!["x".to_string()]);
        assert!(!ctx.holds_state_for("x"));
        assert!(!supervisor.is_running("x"));
        assert!(supervisor.is_running("a"));

        supervisor.shutdown_all().await;
    }

    #[tokio::test]
    async fn ignored_sessions_are_not_monitored() {
        let screens = Arc::new(FakeScreens::new());
        screens.set("herald", "$ ");
        screens.set("agent", "$ ");
        let config = SupervisorConfig {
            ignore: vec!["herald".to_string()],
            ..Default::default()
        };
        let mut supervisor = MonitorSupervisor::new(context(screens.clone()), screens, config);

        let report = supervisor.discover_once().await.unwrap();
        assert_eq!(report.started, vec!["agent".to_string()]);
        supervisor.shutdown_all().await;
    }

    #[tokio::test]
    async fn exited_monitor_is_restarted() {
        // Listed but not capturable: the monitor terminates on its first poll.
        let screens = Arc::new(FakeScreens::new());
        let lister = Arc::new(StaticLister::new(&["ghost"]));
        let mut supervisor =
            MonitorSupervisor::new(context(screens), lister, SupervisorConfig::default());

        let report = supervisor.discover_once().await.unwrap();
        assert_eq!(report.started, vec!["ghost".to_string()]);
        wait_until(|| !supervisor.is_running("ghost")).await;

        let report = supervisor.discover_once().await.unwrap();
        assert_eq!(report.restarted, vec!["ghost".to_string()]);
        supervisor.shutdown_all().await;
    }

    #[tokio::test]
    async fn run_stops_monitors_on_shutdown() {
        let screens = Arc::new(FakeScreens::new());
        screens.set("a", "$ ");
        let ctx = context(screens.clone());
        let supervisor =
            MonitorSupervisor::new(ctx.clone(), screens, SupervisorConfig::default());
        let (tx, rx) = watch::channel(false);

        let task = tokio::spawn(supervisor.run(rx));
        wait_until(|| ctx.sessions.contains("a")).await;
        tx.send(true).unwrap();
        tokio::time::timeout(Duration::from_secs(5), task)
            .await
            .unwrap()
            .unwrap();
    }

    #[tokio::test]
    async fn sweep_drops_stale_completions() {
        let screens = Arc::new(FakeScreens::new());
        let ctx = context(screens.clone());
        ctx.completions.insert_raw("old", now_epoch() - 13.0 * 3600.0);
        ctx.completions.insert_raw("recent", now_epoch() - 60.0);
        let supervisor = MonitorSupervisor::new(ctx.clone(), screens, SupervisorConfig::default());

        let report = supervisor.sweep();
        assert_eq!(report.completions, 1);
        assert!(ctx.completions.last_completion("recent").is_some());
    }
}
