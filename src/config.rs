use std::ops::RangeInclusive;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{ensure, Context, Result};
use serde::{Deserialize, Serialize};

use crate::tmux::{MarkerPatterns, MarkerRules};

/// Directory under `$HOME` holding config, state and logs.
pub const APP_DIR: &str = ".agent-herald";

const CONFIG_FILE: &str = "config.toml";
const COMPLETIONS_FILE: &str = "completions.json";
const LOG_FILE: &str = "herald.log";

/// Bounds for interval and timeout settings, in seconds.
const SECONDS_RANGE: RangeInclusive<u64> = 1..=86_400;
/// Bounds for `completion.max_age_hours`.
const MAX_AGE_HOURS_RANGE: RangeInclusive<u64> = 1..=8_760;

/// Top-level configuration from `~/.agent-herald/config.toml`.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub monitor: MonitorConfig,
    pub supervisor: SupervisorConfig,
    pub cache: CacheConfig,
    pub completion: CompletionConfig,
    pub markers: MarkerPatterns,
    pub notify: NotifyConfig,
}

/// Per-session polling and notification behavior.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct MonitorConfig {
    pub poll_interval_secs: u64,
    pub cooldown_secs: u64,
    pub capture_timeout_secs: u64,
    pub delivery_timeout_secs: u64,
    /// Scrollback lines included in cached captures
    pub history_lines: u32,
    /// Consecutive identical polls before a quiet completion fires
    pub quiet_polls: u32,
    /// How long the supervisor waits for a stopping monitor
    pub join_timeout_secs: u64,
}

impl Default for MonitorConfig {
    fn default() -> Self {
        Self {
            poll_interval_secs: 3,
            cooldown_secs: 30,
            capture_timeout_secs: 5,
            delivery_timeout_secs: 10,
            history_lines: 50,
            quiet_polls: 3,
            join_timeout_secs: 2,
        }
    }
}

impl MonitorConfig {
    pub fn poll_interval(&self) -> Duration {
        Duration::from_secs(self.poll_interval_secs)
    }

    pub fn cooldown(&self) -> Duration {
        Duration::from_secs(self.cooldown_secs)
    }

    pub fn capture_timeout(&self) -> Duration {
        Duration::from_secs(self.capture_timeout_secs)
    }

    pub fn delivery_timeout(&self) -> Duration {
        Duration::from_secs(self.delivery_timeout_secs)
    }

    pub fn join_timeout(&self) -> Duration {
        Duration::from_secs(self.join_timeout_secs)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SupervisorConfig {
    pub discovery_interval_secs: u64,
    pub sweep_interval_secs: u64,
    /// Session names never monitored (e.g. the one running the dashboard)
    pub ignore: Vec<String>,
}

impl Default for SupervisorConfig {
    fn default() -> Self {
        Self {
            discovery_interval_secs: 5,
            sweep_interval_secs: 300,
            ignore: Vec::new(),
        }
    }
}

impl SupervisorConfig {
    pub fn discovery_interval(&self) -> Duration {
        Duration::from_secs(self.discovery_interval_secs)
    }

    pub fn sweep_interval(&self) -> Duration {
        Duration::from_secs(self.sweep_interval_secs)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CacheConfig {
    pub screen_ttl_ms: u64,
    pub state_ttl_ms: u64,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            screen_ttl_ms: 1_000,
            state_ttl_ms: 500,
        }
    }
}

impl CacheConfig {
    pub fn screen_ttl(&self) -> Duration {
        Duration::from_millis(self.screen_ttl_ms)
    }

    pub fn state_ttl(&self) -> Duration {
        Duration::from_millis(self.state_ttl_ms)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CompletionConfig {
    /// Where completion timestamps are persisted; defaults under `APP_DIR`
    pub state_file: Option<PathBuf>,
    pub dedupe_window_secs: u64,
    pub max_age_hours: u64,
    pub validation_interval_secs: u64,
    /// Future timestamps are clamped to this many seconds ago
    pub future_clamp_secs: u64,
}

impl Default for CompletionConfig {
    fn default() -> Self {
        Self {
            state_file: None,
            dedupe_window_secs: 30,
            max_age_hours: 12,
            validation_interval_secs: 300,
            future_clamp_secs: 180,
        }
    }
}

/// External notification command, e.g. `["notify-send", "agent-herald"]`.
/// The message is appended as the final argument.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct NotifyConfig {
    pub command: Option<Vec<String>>,
}

impl Config {
    /// Compile the configured marker patterns.
    pub fn marker_rules(&self) -> Result<MarkerRules> {
        MarkerRules::compile(&self.markers).context("invalid pattern in [markers]")
    }

    /// Reject values the runtime cannot work with, such as zero intervals.
    pub fn validate(&self) -> Result<()> {
        let m = &self.monitor;
        let s = &self.supervisor;
        for (key, value) in [
            ("monitor.poll_interval_secs", m.poll_interval_secs),
            ("monitor.capture_timeout_secs", m.capture_timeout_secs),
            ("monitor.delivery_timeout_secs", m.delivery_timeout_secs),
            ("monitor.join_timeout_secs", m.join_timeout_secs),
            ("supervisor.discovery_interval_secs", s.discovery_interval_secs),
            ("supervisor.sweep_interval_secs", s.sweep_interval_secs),
        ] {
            in_range(key, value, &SECONDS_RANGE)?;
        }
        in_range(
            "completion.max_age_hours",
            self.completion.max_age_hours,
            &MAX_AGE_HOURS_RANGE,
        )?;
        ensure!(m.quiet_polls >= 1, "monitor.quiet_polls must be at least 1");
        Ok(())
    }

    pub fn completions_path(&self) -> PathBuf {
        self.completion
            .state_file
            .clone()
            .unwrap_or_else(|| app_dir().join(COMPLETIONS_FILE))
    }
}

fn in_range(key: &str, value: u64, range: &RangeInclusive<u64>) -> Result<()> {
    ensure!(
        range.contains(&value),
        "{key} = {value} is out of range ({}..={})",
        range.start(),
        range.end()
    );
    Ok(())
}

pub fn app_dir() -> PathBuf {
    dirs::home_dir().unwrap_or_default().join(APP_DIR)
}

pub fn default_config_path() -> PathBuf {
    app_dir().join(CONFIG_FILE)
}

pub fn default_log_path() -> PathBuf {
    app_dir().join(LOG_FILE)
}

/// Load configuration from `path`.
///
/// Falls back to defaults if the file is missing.
pub fn load(path: &Path) -> Result<Config> {
    if !path.exists() {
        return Ok(Config::default());
    }
    let contents = std::fs::read_to_string(path)
        .with_context(|| format!("failed to read {}", path.display()))?;
    let config: Config =
        toml::from_str(&contents).with_context(|| format!("failed to parse {}", path.display()))?;
    config
        .validate()
        .with_context(|| format!("invalid settings in {}", path.display()))?;
    config.marker_rules()?;
    Ok(config)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn missing_file_yields_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let config = load(&dir.path().join("nope.toml")).unwrap();
        assert_eq!(config.monitor.poll_interval_secs, 3);
        assert_eq!(config.monitor.cooldown(), Duration::from_secs(30));
        assert_eq!(config.supervisor.discovery_interval(), Duration::from_secs(5));
        assert_eq!(config.completion.max_age_hours, 12);
    }

    #[test]
    fn partial_file_keeps_other_defaults() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(
            file,
            "[monitor]\ncooldown_secs = 10\n\n[supervisor]\nignore = [\"herald\"]\n\n[markers]\nworking = [\"BUSY\"]"
        )
        .unwrap();

        let config = load(file.path()).unwrap();
        assert_eq!(config.monitor.cooldown_secs, 10);
        assert_eq!(config.monitor.poll_interval_secs, 3);
        assert_eq!(config.supervisor.ignore, vec!["herald".to_string()]);
        assert_eq!(config.markers.working, vec!["BUSY".to_string()]);
        assert!(!config.markers.error.is_empty());
    }

    #[test]
    fn invalid_marker_pattern_fails_load() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "[markers]\nerror = [\"(oops\"]").unwrap();
        assert!(load(file.path()).is_err());
    }

    #[test]
    fn zero_intervals_fail_load() {
        for body in [
            "[supervisor]\ndiscovery_interval_secs = 0",
            "[supervisor]\nsweep_interval_secs = 0",
            "[monitor]\npoll_interval_secs = 0",
            "[monitor]\nquiet_polls = 0",
        ] {
            let mut file = tempfile::NamedTempFile::new().unwrap();
            writeln!(file, "{body}").unwrap();
            let err = load(file.path()).unwrap_err();
            assert!(format!("{err:#}").contains("invalid settings"), "{body}");
        }
    }

    #[test]
    fn absurd_max_age_fails_validation() {
        let mut config = Config::default();
        config.completion.max_age_hours = u64::MAX;
        let err = config.validate().unwrap_err();
        assert!(err.to_string().contains("completion.max_age_hours"));
        assert!(Config::default().validate().is_ok());
    }

    #[test]
    fn explicit_state_file_wins() {
        let mut config = Config::default();
        config.completion.state_file = Some(PathBuf::from("/tmp/herald.json"));
        assert_eq!(config.completions_path(), PathBuf::from("/tmp/herald.json"));
    }
}
