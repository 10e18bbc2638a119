//! Detection of completions that leave no explicit marker behind.
//!
//! A command like `ls` finishes without printing "done"; the only signal is
//! that the screen stops changing. Each observation hashes the screen and a
//! quiet completion fires once the same hash has been seen for
//! `required_polls` consecutive polls, the session is not busy or asking for
//! something, and there is real output on screen.

use std::collections::{HashMap, VecDeque};
use std::time::{Duration, Instant};

use parking_lot::RwLock;
use sha2::{Digest, Sha256};

use crate::tmux::{AgentStatus, MarkerRules};

pub type ScreenHash = [u8; 32];

/// Extra snapshots kept beyond the stability requirement.
const HISTORY_SLACK: usize = 2;

/// Hash of the screen with trailing whitespace and blank padding removed,
/// so cursor blinks and tmux row padding do not count as changes.
pub fn hash_screen(text: &str) -> ScreenHash {
    let mut lines: Vec<&str> = text.lines().map(str::trim_end).collect();
    while lines.last().is_some_and(|l| l.is_empty()) {
        lines.pop();
    }

    let mut hasher = Sha256::new();
    for line in lines {
        hasher.update(line.as_bytes());
        hasher.update(b"\n");
    }
    hasher.finalize().into()
}

#[derive(Debug, Clone)]
struct QuietTracker {
    hashes: VecDeque<ScreenHash>,
    stable_polls: u32,
    /// Already fired for the current hash
    fired: bool,
    quiet: bool,
    last_seen: Instant,
}

impl QuietTracker {
    fn new() -> Self {
        Self {
            hashes: VecDeque::new(),
            stable_polls: 0,
            fired: false,
            quiet: false,
            last_seen: Instant::now(),
        }
    }
}

/// Outcome of feeding one snapshot to the detector.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct QuietObservation {
    pub hash: ScreenHash,
    /// Screen differs from the previous snapshot
    pub changed: bool,
    /// Consecutive polls with this exact screen
    pub stable_polls: u32,
    /// A quiet completion fired on this observation
    pub quiet: bool,
}

pub struct QuietCompletionDetector {
    rules: MarkerRules,
    required_polls: u32,
    trackers: RwLock<HashMap<String, QuietTracker>>,
}

impl QuietCompletionDetector {
    pub fn new(rules: MarkerRules, required_polls: u32) -> Self {
        Self {
            rules,
            required_polls: required_polls.max(1),
            trackers: RwLock::new(HashMap::new()),
        }
    }

    fn window(&self) -> usize {
        self.required_polls as usize + HISTORY_SLACK
    }

    /// Record a snapshot and report whether it completes a quiet period.
    pub fn observe(&self, session_id: &str, screen: &str, status: AgentStatus) -> QuietObservation {
        let hash = hash_screen(screen);
        let required = self.required_polls as usize;
        let window = self.window();

        let mut trackers = self.trackers.write();
        let tracker = trackers
            .entry(session_id.to_string())
            .or_insert_with(QuietTracker::new);

        let changed = tracker.hashes.back() != Some(&hash);
        if changed {
            tracker.stable_polls = 1;
            tracker.fired = false;
        } else {
            tracker.stable_polls = tracker.stable_polls.saturating_add(1);
        }

        tracker.hashes.push_back(hash);
        while tracker.hashes.len() > window {
            tracker.hashes.pop_front();
        }
        tracker.last_seen = Instant::now();

        let stable = tracker.hashes.len() >= required
            && tracker.hashes.iter().rev().take(required).all(|h| *h == hash);
        let eligible = !matches!(
            status,
            AgentStatus::Working | AgentStatus::Error | AgentStatus::WaitingForInput
        );

        let quiet = eligible && stable && !tracker.fired && self.rules.has_output(screen);
        if quiet {
            tracker.fired = true;
        }
        tracker.quiet = quiet;

        QuietObservation {
            hash,
            changed,
            stable_polls: tracker.stable_polls,
            quiet,
        }
    }

    /// Whether the latest observation for the session was a quiet completion.
    pub fn is_quiet(&self, session_id: &str) -> bool {
        self.trackers
            .read()
            .get(session_id)
            .is_some_and(|t| t.quiet)
    }

    pub fn forget(&self, session_id: &str) {
        self.trackers.write().remove(session_id);
    }

    pub fn is_tracking(&self, session_id: &str) -> bool {
        self.trackers.read().contains_key(session_id)
    }

    /// Drop trackers that have not been fed for `max_idle`.
    pub fn prune_idle(&self, max_idle: Duration) -> usize {
        let mut trackers = self.trackers.write();
        let before = trackers.len();
        trackers.retain(|_, t| t.last_seen.elapsed() < max_idle);
        before - trackers.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const LISTING: &str = "file1.txt\nfile2.py\nuser@host$ ";

    fn detector() -> QuietCompletionDetector {
        QuietCompletionDetector::new(MarkerRules::default(), 3)
    }

    #[test]
    fn fires_on_third_identical_poll() {
        let detector = detector();
        let first = detector.observe("s", LISTING, AgentStatus::Idle);
        assert!(first.changed);
        assert!(!first.quiet);
        assert!(!detector.observe("s", LISTING, AgentStatus::Idle).quiet);
        let third = detector.observe("s", LISTING, AgentStatus::Idle);
        assert!(third.quiet);
        assert_eq!(third.stable_polls, 3);
        assert!(detector.is_quiet("s"));
    }

    #[test]
    fn fires_once_per_stable_screen() {
        let detector = detector();
        for _ in 0..3 {
            detector.observe("s", LISTING, AgentStatus::Idle);
        }
        assert!(!detector.observe("s", LISTING, AgentStatus::Idle).quiet);
        assert!(!detector.is_quiet("s"));
    }

    #[test]
    fn never_fires_while_busy_or_asking() {
        let detector = detector();
        for status in [
            AgentStatus::Working,
            AgentStatus::Error,
            AgentStatus::WaitingForInput,
        ] {
            detector.forget("s");
            for _ in 0..5 {
                assert!(!detector.observe("s", LISTING, status).quiet);
            }
        }
    }

    #[test]
    fn empty_prompt_is_not_a_completion() {
        let detector = detector();
        for _ in 0..5 {
            assert!(!detector.observe("s", "user@host:~$ \n\n", AgentStatus::Idle).quiet);
        }
    }

    #[test]
    fn change_restarts_the_count() {
        let detector = detector();
        detector.observe("s", LISTING, AgentStatus::Idle);
        detector.observe("s", LISTING, AgentStatus::Idle);
        let changed = detector.observe("s", "file3.rs\nuser@host$ ", AgentStatus::Idle);
        assert!(changed.changed);
        assert_eq!(changed.stable_polls, 1);
        assert!(!detector.observe("s", "file3.rs\nuser@host$ ", AgentStatus::Idle).quiet);
        assert!(detector.observe("s", "file3.rs\nuser@host$ ", AgentStatus::Idle).quiet);
    }

    #[test]
    fn trailing_padding_does_not_change_hash() {
        assert_eq!(hash_screen("a\nb"), hash_screen("a  \nb\n\n\n"));
        assert_ne!(hash_screen("a\nb"), hash_screen("a\nc"));
    }

    #[test]
    fn sessions_are_independent() {
        let detector = detector();
        for _ in 0..2 {
            detector.observe("a", LISTING, AgentStatus::Idle);
        }
        assert!(!detector.observe("b", LISTING, AgentStatus::Idle).quiet);
        assert!(detector.observe("a", LISTING, AgentStatus::Idle).quiet);
    }

    #[test]
    fn forget_and_prune() {
        let detector = detector();
        detector.observe("a", LISTING, AgentStatus::Idle);
        detector.observe("b", LISTING, AgentStatus::Idle);
        detector.forget("a");
        assert!(!detector.is_tracking("a"));
        assert_eq!(detector.prune_idle(Duration::ZERO), 1);
        assert!(!detector.is_tracking("b"));
    }
}
