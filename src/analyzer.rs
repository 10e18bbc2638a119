//! Screen capture caching and state classification.
//!
//! Two read modes are offered. [`StateAnalyzer::state`] goes through short
//! lived screen and state caches and includes a bounded amount of
//! scrollback; it is what general polling and the dashboard use.
//! [`StateAnalyzer::fresh_state`] bypasses every cache and captures only the
//! visible screen, so notification decisions never act on stale scrollback.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::RwLock;
use tracing::debug;

use crate::config::{CacheConfig, Config};
use crate::error::Result;
use crate::tmux::{AgentStatus, MarkerRules, ScreenSource};

#[derive(Debug, Clone)]
struct CachedScreen {
    text: String,
    captured_at: Instant,
}

#[derive(Debug, Clone, Copy)]
struct CachedState {
    status: AgentStatus,
    computed_at: Instant,
}

/// Result of a cache-bypassing read.
#[derive(Debug, Clone)]
pub struct FreshReading {
    pub status: AgentStatus,
    pub screen: String,
}

pub struct StateAnalyzer {
    source: Arc<dyn ScreenSource>,
    rules: MarkerRules,
    history_lines: u32,
    screen_ttl: Duration,
    state_ttl: Duration,
    screens: RwLock<HashMap<String, CachedScreen>>,
    states: RwLock<HashMap<String, CachedState>>,
}

impl StateAnalyzer {
    pub fn new(
        source: Arc<dyn ScreenSource>,
        rules: MarkerRules,
        history_lines: u32,
        cache: &CacheConfig,
    ) -> Self {
        Self {
            source,
            rules,
            history_lines,
            screen_ttl: cache.screen_ttl(),
            state_ttl: cache.state_ttl(),
            screens: RwLock::new(HashMap::new()),
            states: RwLock::new(HashMap::new()),
        }
    }

    pub fn from_config(source: Arc<dyn ScreenSource>, config: &Config) -> anyhow::Result<Self> {
        Ok(Self::new(
            source,
            config.marker_rules()?,
            config.monitor.history_lines,
            &config.cache,
        ))
    }

    pub fn rules(&self) -> &MarkerRules {
        &self.rules
    }

    /// Classify text without touching any cache.
    pub fn classify(&self, text: Option<&str>) -> AgentStatus {
        self.rules.classify(text)
    }

    /// Screen text with scrollback, served from cache while fresh.
    pub async fn screen(&self, session_id: &str) -> Result<String> {
        if let Some(text) = self.cached_screen(session_id) {
            return Ok(text);
        }

        let text = self.source.capture(session_id, self.history_lines).await?;
        self.screens.write().insert(
            session_id.to_string(),
            CachedScreen {
                text: text.clone(),
                captured_at: Instant::now(),
            },
        );
        Ok(text)
    }

    /// Cached-mode classification. Capture failures propagate so the caller
    /// can tell a vanished session from a transient error.
    pub async fn state(&self, session_id: &str) -> Result<AgentStatus> {
        if let Some(status) = self.cached_state(session_id) {
            return Ok(status);
        }

        let text = self.screen(session_id).await?;
        let status = self.classify(Some(&text));
        self.states.write().insert(
            session_id.to_string(),
            CachedState {
                status,
                computed_at: Instant::now(),
            },
        );
        Ok(status)
    }

    /// No cache, no history: classify exactly what is visible right now.
    pub async fn fresh_state(&self, session_id: &str) -> Result<FreshReading> {
        let screen = self.source.capture_visible(session_id).await?;
        let status = self.classify(Some(&screen));
        debug!(session = %session_id, ?status, "fresh classification");
        Ok(FreshReading { status, screen })
    }

    fn cached_screen(&self, session_id: &str) -> Option<String> {
        let screens = self.screens.read();
        screens
            .get(session_id)
            .filter(|entry| entry.captured_at.elapsed() < self.screen_ttl)
            .map(|entry| entry.text.clone())
    }

    fn cached_state(&self, session_id: &str) -> Option<AgentStatus> {
        let states = self.states.read();
        states
            .get(session_id)
            .filter(|entry| entry.computed_at.elapsed() < self.state_ttl)
            .map(|entry| entry.status)
    }

    /// Drop every cache entry for a session.
    pub fn forget(&self, session_id: &str) {
        self.screens.write().remove(session_id);
        self.states.write().remove(session_id);
    }

    /// Remove expired entries; returns how many were dropped.
    pub fn prune_expired(&self) -> usize {
        let mut removed = 0;
        {
            let mut screens = self.screens.write();
            let before = screens.len();
            screens.retain(|_, entry| entry.captured_at.elapsed() < self.screen_ttl);
            removed += before - screens.len();
        }
        {
            let mut states = self.states.write();
            let before = states.len();
            states.retain(|_, entry| entry.computed_at.elapsed() < self.state_ttl);
            removed += before - states.len();
        }
        removed
    }

    /// Whether any cache still holds an entry for the session.
    pub fn is_cached(&self, session_id: &str) -> bool {
        self.screens.read().contains_key(session_id) || self.states.read().contains_key(session_id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::FakeScreens;

    fn analyzer(source: Arc<FakeScreens>, cache: CacheConfig) -> StateAnalyzer {
        StateAnalyzer::new(source, MarkerRules::default(), 50, &cache)
    }

    fn long_ttl() -> CacheConfig {
        CacheConfig {
            screen_ttl_ms: 60_000,
            state_ttl_ms: 60_000,
        }
    }

    #[tokio::test]
    async fn cached_state_reuses_capture() {
        let screens = Arc::new(FakeScreens::new());
        screens.set("a", "⠋ Building (esc to interrupt)");
        let analyzer = analyzer(screens.clone(), long_ttl());

        assert_eq!(analyzer.state("a").await.unwrap(), AgentStatus::Working);
        screens.set("a", "done\n$ ");
        assert_eq!(analyzer.state("a").await.unwrap(), AgentStatus::Working);
        assert_eq!(screens.history_captures("a"), 1);
    }

    #[tokio::test]
    async fn fresh_state_bypasses_cache() {
        let screens = Arc::new(FakeScreens::new());
        screens.set("a", "⠋ Building (esc to interrupt)");
        let analyzer = analyzer(screens.clone(), long_ttl());

        assert_eq!(analyzer.state("a").await.unwrap(), AgentStatus::Working);
        screens.set("a", "Error: build failed");
        let fresh = analyzer.fresh_state("a").await.unwrap();
        assert_eq!(fresh.status, AgentStatus::Error);
        assert_eq!(fresh.screen, "Error: build failed");
        assert_eq!(screens.visible_captures("a"), 1);
    }

    #[tokio::test]
    async fn expired_cache_recaptures() {
        let screens = Arc::new(FakeScreens::new());
        screens.set("a", "$ ");
        let analyzer = analyzer(
            screens.clone(),
            CacheConfig {
                screen_ttl_ms: 0,
                state_ttl_ms: 0,
            },
        );

        analyzer.state("a").await.unwrap();
        analyzer.state("a").await.unwrap();
        assert_eq!(screens.history_captures("a"), 2);
        assert_eq!(analyzer.prune_expired(), 2);
        assert!(!analyzer.is_cached("a"));
    }

    #[tokio::test]
    async fn capture_errors_propagate() {
        let screens = Arc::new(FakeScreens::new());
        let analyzer = analyzer(screens, long_ttl());
        let err = analyzer.state("missing").await.unwrap_err();
        assert!(err.is_not_found());
        assert!(!analyzer.is_cached("missing"));
    }

    #[tokio::test]
    async fn forget_clears_both_caches() {
        let screens = Arc::new(FakeScreens::new());
        screens.set("a", "$ ");
        let analyzer = analyzer(screens, long_ttl());
        analyzer.state("a").await.unwrap();
        assert!(analyzer.is_cached("a"));
        analyzer.forget("a");
        assert!(!analyzer.is_cached("a"));
    }
}
