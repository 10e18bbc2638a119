use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tracing::{debug, info, warn};

use crate::config::CompletionConfig;
use crate::error::{MonitorError, Result};

/// Current wall-clock time as fractional unix seconds.
pub fn now_epoch() -> f64 {
    chrono::Utc::now().timestamp_millis() as f64 / 1000.0
}

/// Timestamps this close to `now` are not treated as being in the future.
const FUTURE_TOLERANCE_SECS: f64 = 1.0;

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct CompletionSettings {
    pub dedupe_window: Duration,
    pub max_age: Duration,
    pub validation_interval: Duration,
    pub future_clamp: Duration,
}

impl Default for CompletionSettings {
    fn default() -> Self {
        Self::from(&CompletionConfig::default())
    }
}

impl From<&CompletionConfig> for CompletionSettings {
    fn from(config: &CompletionConfig) -> Self {
        Self {
            dedupe_window: Duration::from_secs(config.dedupe_window_secs),
            max_age: Duration::from_secs(config.max_age_hours.saturating_mul(3600)),
            validation_interval: Duration::from_secs(config.validation_interval_secs),
            future_clamp: Duration::from_secs(config.future_clamp_secs),
        }
    }
}

/// What the store knows about a session's last completion.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum RecordLookup {
    /// A real, plausible completion timestamp
    Recorded(f64),
    /// A timestamp that had to be repaired; treat the result as an estimate
    Corrected(f64),
    /// No usable record
    Missing,
}

/// Counts from a validation pass.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ValidationReport {
    pub clamped: usize,
    pub discarded: usize,
}

impl ValidationReport {
    fn is_dirty(&self) -> bool {
        self.clamped + self.discarded > 0
    }
}

#[derive(Debug, Default)]
struct Inner {
    records: HashMap<String, f64>,
    /// Records repaired since their last real completion
    corrected: HashSet<String>,
    last_validation: Option<f64>,
}

/// Session id → unix seconds of the last confirmed completion.
///
/// The in-memory map is authoritative; the JSON file is rewritten whole on
/// every change and read once at startup.
pub struct CompletionStore {
    path: Option<PathBuf>,
    settings: CompletionSettings,
    inner: Arc<Mutex<Inner>>,
    persist_lock: Arc<Mutex<()>>,
}

impl CompletionStore {
    /// Open the store at `path`. Unreadable or corrupt files start empty.
    pub fn open(path: PathBuf, settings: CompletionSettings) -> Self {
        let records = match load_records(&path) {
            Ok(records) => {
                debug!(path = %path.display(), count = records.len(), "loaded completion records");
                records
            }
            Err(e) => {
                warn!("{e}; starting with no completion records");
                HashMap::new()
            }
        };

        Self {
            path: Some(path),
            settings,
            inner: Arc::new(Mutex::new(Inner {
                records,
                ..Default::default()
            })),
            persist_lock: Arc::new(Mutex::new(())),
        }
    }

    /// A store that never touches disk.
    pub fn in_memory(settings: CompletionSettings) -> Self {
        Self {
            path: None,
            settings,
            inner: Arc::new(Mutex::new(Inner::default())),
            persist_lock: Arc::new(Mutex::new(())),
        }
    }

    pub fn settings(&self) -> &CompletionSettings {
        &self.settings
    }

    /// Record a completion for the session now. Returns whether the stored
    /// timestamp changed.
    pub fn mark_completion(&self, session_id: &str, force: bool) -> bool {
        self.mark_completion_at(session_id, force, now_epoch())
    }

    /// Marks within the dedupe window of an existing record are skipped
    /// unless `force` is set.
    pub fn mark_completion_at(&self, session_id: &str, force: bool, now: f64) -> bool {
        {
            let mut inner = self.inner.lock();
            if !force {
                if let Some(&previous) = inner.records.get(session_id) {
                    let age = now - previous;
                    if (0.0..self.settings.dedupe_window.as_secs_f64()).contains(&age) {
                        debug!(session = %session_id, age, "skipping duplicate completion mark");
                        return false;
                    }
                }
            }
            inner.records.insert(session_id.to_string(), now);
            inner.corrected.remove(session_id);
        }

        self.save();
        true
    }

    pub fn last_completion(&self, session_id: &str) -> Option<f64> {
        self.inner.lock().records.get(session_id).copied()
    }

    /// Look up a session's record, repairing it if it is implausible.
    pub fn lookup_at(&self, session_id: &str, now: f64) -> RecordLookup {
        let mut report = self.validate_if_due(now);

        let lookup = {
            let mut inner = self.inner.lock();
            match inner.records.get(session_id).copied() {
                None => RecordLookup::Missing,
                Some(ts) => match self.repair(ts, now) {
                    Repair::Keep => {
                        if inner.corrected.contains(session_id) {
                            RecordLookup::Corrected(ts)
                        } else {
                            RecordLookup::Recorded(ts)
                        }
                    }
                    Repair::Clamp(fixed) => {
                        warn!(session = %session_id, ts, fixed, "completion timestamp in the future, clamped");
                        inner.records.insert(session_id.to_string(), fixed);
                        inner.corrected.insert(session_id.to_string());
                        report.clamped += 1;
                        RecordLookup::Corrected(fixed)
                    }
                    Repair::Discard => {
                        info!(session = %session_id, ts, "discarding stale completion timestamp");
                        inner.records.remove(session_id);
                        inner.corrected.remove(session_id);
                        report.discarded += 1;
                        RecordLookup::Missing
                    }
                },
            }
        };

        if report.is_dirty() {
            self.save();
        }
        lookup
    }

    fn validate_if_due(&self, now: f64) -> ValidationReport {
        let due = {
            let inner = self.inner.lock();
            inner
                .last_validation
                .map_or(true, |last| now - last >= self.settings.validation_interval.as_secs_f64())
        };
        if due {
            self.validate_at(now)
        } else {
            ValidationReport::default()
        }
    }

    /// Full validation pass over every record. Does not persist on its own.
    pub fn validate_at(&self, now: f64) -> ValidationReport {
        let mut report = ValidationReport::default();
        let mut inner = self.inner.lock();
        inner.last_validation = Some(now);

        let ids: Vec<String> = inner.records.keys().cloned().collect();
        for id in ids {
            let Some(ts) = inner.records.get(&id).copied() else {
                continue;
            };
            match self.repair(ts, now) {
                Repair::Keep => {}
                Repair::Clamp(fixed) => {
                    inner.records.insert(id.clone(), fixed);
                    inner.corrected.insert(id);
                    report.clamped += 1;
                }
                Repair::Discard => {
                    inner.records.remove(&id);
                    inner.corrected.remove(&id);
                    report.discarded += 1;
                }
            }
        }

        if report.is_dirty() {
            info!(
                clamped = report.clamped,
                discarded = report.discarded,
                "repaired completion records"
            );
        }
        report
    }

    /// Drop records older than the max age. Used by the periodic sweep.
    pub fn prune_stale_at(&self, now: f64) -> usize {
        let max_age = self.settings.max_age.as_secs_f64();
        let removed = {
            let mut inner = self.inner.lock();
            let before = inner.records.len();
            inner.records.retain(|_, ts| now - *ts <= max_age);
            let Inner {
                records, corrected, ..
            } = &mut *inner;
            corrected.retain(|id| records.contains_key(id));
            before - records.len()
        };
        if removed > 0 {
            self.save();
        }
        removed
    }

    fn repair(&self, ts: f64, now: f64) -> Repair {
        if !ts.is_finite() || now - ts > self.settings.max_age.as_secs_f64() {
            Repair::Discard
        } else if ts > now + FUTURE_TOLERANCE_SECS {
            Repair::Clamp(now - self.settings.future_clamp.as_secs_f64())
        } else {
            Repair::Keep
        }
    }

    /// Rewrite the backing file. Failures are logged; memory stays authoritative.
    ///
    /// Inside a tokio runtime the write runs on the blocking pool. Every write
    /// snapshots the map when it runs, so the last one always writes the
    /// newest state.
    fn save(&self) {
        let Some(write) = self.writer() else {
            return;
        };
        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                handle.spawn_blocking(write);
            }
            Err(_) => write(),
        }
    }

    /// Write the current records and wait for the write to finish.
    pub async fn flush(&self) {
        if let Some(write) = self.writer() {
            if let Err(e) = tokio::task::spawn_blocking(write).await {
                warn!("completion flush failed: {e}");
            }
        }
    }

    fn writer(&self) -> Option<impl FnOnce() + Send + 'static> {
        let path = self.path.clone()?;
        let inner = Arc::clone(&self.inner);
        let persist_lock = Arc::clone(&self.persist_lock);
        Some(move || {
            let _guard = persist_lock.lock();
            let snapshot = inner.lock().records.clone();
            if let Err(e) = write_records(&path, &snapshot) {
                warn!("{e}");
            }
        })
    }

    #[cfg(test)]
    pub(crate) fn insert_raw(&self, session_id: &str, ts: f64) {
        self.inner.lock().records.insert(session_id.to_string(), ts);
    }
}

enum Repair {
    Keep,
    Clamp(f64),
    Discard,
}

/// Read the persisted map. A missing file is an empty map.
pub fn load_records(path: &Path) -> Result<HashMap<String, f64>> {
    let contents = match std::fs::read_to_string(path) {
        Ok(contents) => contents,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(HashMap::new()),
        Err(e) => {
            return Err(MonitorError::PersistenceCorrupt {
                path: path.to_path_buf(),
                detail: e.to_string(),
            })
        }
    };

    let mut records: HashMap<String, f64> =
        serde_json::from_str(&contents).map_err(|e| MonitorError::PersistenceCorrupt {
            path: path.to_path_buf(),
            detail: e.to_string(),
        })?;
    records.retain(|_, ts| ts.is_finite());
    Ok(records)
}

/// Write the map via a temp file and rename so readers never see a torn file.
pub fn write_records(path: &Path, records: &HashMap<String, f64>) -> Result<()> {
    let write_failed = |source| MonitorError::PersistenceWriteFailed {
        path: path.to_path_buf(),
        source,
    };

    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent).map_err(write_failed)?;
    }
    let json = serde_json::to_string_pretty(records)
        .map_err(|e| write_failed(std::io::Error::new(std::io::ErrorKind::InvalidData, e)))?;
    let tmp = path.with_extension("json.tmp");
    std::fs::write(&tmp, json).map_err(write_failed)?;
    std::fs::rename(&tmp, path).map_err(write_failed)?;
    Ok(())
}
