use once_cell::sync::Lazy;
use regex::{RegexSet, RegexSetBuilder};
use serde::{Deserialize, Serialize};

/// Activity state of a monitored session, inferred from its screen.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
pub enum AgentStatus {
    /// An error marker is visible near the bottom of the screen
    Error,
    /// Agent is waiting for the user (confirmation, choice)
    WaitingForInput,
    /// Agent is actively processing and can be interrupted
    Working,
    /// Nothing is happening, usually parked at a prompt
    Idle,
    /// Status cannot be determined (capture failed)
    #[default]
    Unknown,
}

impl AgentStatus {
    /// Priority rank; lower wins when several detectors fire.
    pub fn priority(self) -> u8 {
        match self {
            AgentStatus::Error => 0,
            AgentStatus::WaitingForInput => 1,
            AgentStatus::Working => 2,
            AgentStatus::Idle => 3,
            AgentStatus::Unknown => 4,
        }
    }

    pub fn label(self) -> &'static str {
        match self {
            AgentStatus::Error => "error",
            AgentStatus::WaitingForInput => "waiting for input",
            AgentStatus::Working => "working",
            AgentStatus::Idle => "idle",
            AgentStatus::Unknown => "unknown",
        }
    }
}

/// Error and input-wait markers only count in this many trailing lines.
pub const ALERT_WINDOW_LINES: usize = 10;

/// Working markers only count in this many trailing lines.
pub const WORKING_WINDOW_LINES: usize = 20;

pub const DEFAULT_ERROR_MARKERS: &[&str] = &[
    r"Error:",
    r"Failed:",
    r"Exception:",
    r"^Traceback \(most recent call last\)",
    r"panicked at",
    r"^fatal:",
];

pub const DEFAULT_WAITING_MARKERS: &[&str] = &[
    r"Do you want to .*\?",
    r"Would you like to .*\?",
    r"^\s*[❯>]\s*1\.\s+\S",
    r"^\s*\d\.\s+(Yes|No)\b",
    r"(?i)\[y/n\]",
    r"(?i)\(y/n\)",
    r"(?i)press enter to continue",
    r"(?i)waiting for (your )?input",
];

pub const DEFAULT_WORKING_MARKERS: &[&str] = &[
    r"(?i)esc to interrupt",
    r"(?i)ctrl\+c to interrupt",
    r"[⠋⠙⠹⠸⠼⠴⠦⠧⠇⠏]",
    r"^\s*[✻✽✶✢✳·*]\s+\w+…",
    r"(?i)running in (the )?background",
    r"Running…",
    r"Thinking…",
];

pub const DEFAULT_PROMPT_MARKERS: &[&str] = &[
    r"^\s*[>❯$#%]\s*$",
    r"^\S+@\S+.*[$#%]\s*$",
    r"^[\w.~/-]+[$#%>]\s*$",
    r"^[\s─━│╭╮╰╯┌┐└┘]*[>❯]?[\s─━│╭╮╰╯┌┐└┘]*$",
    r"\? for shortcuts",
];

pub const DEFAULT_COMPLETION_MARKERS: &[&str] = &[
    r"(?i)\b(done|completed?|finished|success(fully)?)\b",
    r"[✓✔]",
    r"(?i)total (cost|duration)",
];

/// Raw marker patterns, one regex per entry. Loaded from the `[markers]`
/// config table; anything left out falls back to the built-in lists.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct MarkerPatterns {
    pub error: Vec<String>,
    pub waiting: Vec<String>,
    pub working: Vec<String>,
    pub prompt: Vec<String>,
    pub completion: Vec<String>,
}

impl Default for MarkerPatterns {
    fn default() -> Self {
        fn owned(list: &[&str]) -> Vec<String> {
            list.iter().map(|s| s.to_string()).collect()
        }
        Self {
            error: owned(DEFAULT_ERROR_MARKERS),
            waiting: owned(DEFAULT_WAITING_MARKERS),
            working: owned(DEFAULT_WORKING_MARKERS),
            prompt: owned(DEFAULT_PROMPT_MARKERS),
            completion: owned(DEFAULT_COMPLETION_MARKERS),
        }
    }
}

/// Which marker families fired inside their detection windows.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct MarkerHits {
    pub error: bool,
    pub waiting: bool,
    pub working: bool,
}

/// Pick the winning state from a set of hits.
///
/// Idle is the fallback, so a visible working marker always beats an
/// idle-looking prompt regardless of where the prompt sits on screen.
pub fn resolve(hits: MarkerHits) -> AgentStatus {
    [
        (hits.error, AgentStatus::Error),
        (hits.waiting, AgentStatus::WaitingForInput),
        (hits.working, AgentStatus::Working),
    ]
    .into_iter()
    .filter(|(fired, _)| *fired)
    .map(|(_, status)| status)
    .min_by_key(|status| status.priority())
    .unwrap_or(AgentStatus::Idle)
}

/// Last `n` lines of `content`, ignoring blank padding at the bottom.
///
/// tmux pads the visible screen with empty rows below the cursor; those must
/// not push real output out of the window.
pub fn recent_lines(content: &str, n: usize) -> Vec<&str> {
    let mut lines: Vec<&str> = content.lines().collect();
    while lines.last().is_some_and(|l| l.trim().is_empty()) {
        lines.pop();
    }
    let start = lines.len().saturating_sub(n);
    lines.split_off(start)
}

/// Compiled marker rules used to classify screen text.
#[derive(Debug, Clone)]
pub struct MarkerRules {
    error: RegexSet,
    waiting: RegexSet,
    working: RegexSet,
    prompt: RegexSet,
    completion: RegexSet,
}

static DEFAULT_RULES: Lazy<MarkerRules> =
    Lazy::new(|| MarkerRules::compile(&MarkerPatterns::default()).unwrap());

fn build_set(patterns: &[String]) -> Result<RegexSet, regex::Error> {
    RegexSetBuilder::new(patterns).multi_line(true).build()
}

impl MarkerRules {
    pub fn compile(patterns: &MarkerPatterns) -> Result<Self, regex::Error> {
        Ok(Self {
            error: build_set(&patterns.error)?,
            waiting: build_set(&patterns.waiting)?,
            working: build_set(&patterns.working)?,
            prompt: build_set(&patterns.prompt)?,
            completion: build_set(&patterns.completion)?,
        })
    }

    /// Scan the bounded recent windows for each marker family.
    pub fn scan(&self, content: &str) -> MarkerHits {
        let alert = recent_lines(content, ALERT_WINDOW_LINES).join("\n");
        let working = recent_lines(content, WORKING_WINDOW_LINES).join("\n");

        MarkerHits {
            error: self.error.is_match(&alert),
            waiting: self.waiting.is_match(&alert),
            working: self.working.is_match(&working),
        }
    }

    /// Classify a screen snapshot. `None` means the capture failed.
    pub fn classify(&self, content: Option<&str>) -> AgentStatus {
        match content {
            None => AgentStatus::Unknown,
            Some(text) if text.trim().is_empty() => AgentStatus::Idle,
            Some(text) => resolve(self.scan(text)),
        }
    }

    /// Whether a line is prompt chrome (an empty prompt, box border, hint).
    pub fn is_prompt_line(&self, line: &str) -> bool {
        line.trim().is_empty() || self.prompt.is_match(line)
    }

    /// Whether the screen holds anything besides prompt chrome.
    pub fn has_output(&self, content: &str) -> bool {
        content.lines().any(|line| !self.is_prompt_line(line))
    }

    /// Whether completion-looking keywords are visible near the bottom.
    pub fn has_completion_hint(&self, content: &str) -> bool {
        let recent = recent_lines(content, WORKING_WINDOW_LINES).join("\n");
        self.completion.is_match(&recent)
    }
}

impl Default for MarkerRules {
    fn default() -> Self {
        DEFAULT_RULES.clone()
    }
}
