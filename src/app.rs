use std::collections::VecDeque;
use std::time::{Duration, Instant};

use anyhow::Result;
use crossterm::event::{KeyCode, KeyEvent, KeyModifiers};
use ratatui::{
    layout::{Constraint, Direction, Layout, Rect},
    style::{Color, Modifier, Style},
    text::{Line, Span},
    widgets::{Block, Borders, List, ListItem, ListState, Paragraph, Wrap},
    Frame,
};

use agent_herald::completion::{WaitSource, WaitTime};
use agent_herald::monitor::{MonitorPhase, Session};
use agent_herald::notify::Notification;
use agent_herald::tmux::AgentStatus;

use crate::actions::Action;

/// Notifications kept for the side panel.
const NOTIFICATION_HISTORY: usize = 50;

pub struct Theme {
    pub fg: Color,
    pub accent: Color,
    pub dim: Color,
    pub success: Color,
    pub warning: Color,
    pub error: Color,
}

impl Default for Theme {
    fn default() -> Self {
        Self {
            fg: Color::Rgb(220, 220, 220),
            accent: Color::Rgb(217, 119, 87),
            dim: Color::Rgb(100, 100, 100),
            success: Color::Rgb(80, 200, 120),
            warning: Color::Rgb(255, 193, 7),
            error: Color::Rgb(220, 53, 69),
        }
    }
}

impl Theme {
    fn status_color(&self, status: AgentStatus) -> Color {
        match status {
            AgentStatus::Working => self.warning,
            AgentStatus::Idle => self.success,
            AgentStatus::WaitingForInput => self.accent,
            AgentStatus::Error => self.error,
            AgentStatus::Unknown => self.dim,
        }
    }
}

/// One row of the dashboard, snapshotted from the monitor registry.
#[derive(Debug, Clone)]
pub struct SessionView {
    pub id: String,
    pub state: AgentStatus,
    pub observed: AgentStatus,
    pub phase: MonitorPhase,
    pub notification_sent: bool,
    pub since_notification: Option<Duration>,
    pub capture_failures: u32,
    pub wait: WaitTime,
}

impl SessionView {
    pub fn new(session: &Session, wait: WaitTime, now: Instant) -> Self {
        Self {
            id: session.id.clone(),
            state: session.last_state,
            observed: session.observed,
            phase: session.phase,
            notification_sent: session.notification_sent,
            since_notification: session
                .last_notification
                .map(|at| now.saturating_duration_since(at)),
            capture_failures: session.capture_failures,
            wait,
        }
    }
}

fn status_icon(status: AgentStatus) -> &'static str {
    match status {
        AgentStatus::Working => "● ",
        AgentStatus::Idle => "● ",
        AgentStatus::WaitingForInput => "? ",
        AgentStatus::Error => "✗ ",
        AgentStatus::Unknown => "○ ",
    }
}

fn phase_label(phase: MonitorPhase) -> &'static str {
    match phase {
        MonitorPhase::New => "starting",
        MonitorPhase::Polling => "polling",
        MonitorPhase::Terminated => "terminated",
    }
}

fn source_label(source: WaitSource) -> &'static str {
    match source {
        WaitSource::Recorded => "recorded completion",
        WaitSource::Corrected => "corrected completion",
        WaitSource::CompletedOnScreen => "tmux activity, completion on screen",
        WaitSource::LastActivity => "tmux activity",
        WaitSource::SessionCreated => "session created",
        WaitSource::StillWorking => "still working",
        WaitSource::Unknown => "unknown",
    }
}

pub struct App {
    pub sessions: Vec<SessionView>,
    pub list_state: ListState,
    pub notifications: VecDeque<Notification>,
    /// Current message to display
    pub error_message: Option<String>,
    pub theme: Theme,
    pub pending_actions: Vec<Action>,
}

impl App {
    pub fn new() -> Self {
        let mut list_state = ListState::default();
        list_state.select(Some(0));

        Self {
            sessions: Vec::new(),
            list_state,
            notifications: VecDeque::new(),
            error_message: None,
            theme: Theme::default(),
            pending_actions: Vec::new(),
        }
    }

    pub fn selected_session(&self) -> Option<&SessionView> {
        self.list_state
            .selected()
            .and_then(|i| self.sessions.get(i))
    }

    /// Take pending actions (drains the queue)
    pub fn take_pending_actions(&mut self) -> Vec<Action> {
        std::mem::take(&mut self.pending_actions)
    }

    /// Handle an action and return whether to quit
    pub fn handle_action(&mut self, action: Action) -> Result<bool> {
        match action {
            Action::KeyPress(key) => self.handle_key(key),
            Action::SessionsUpdated(sessions) => {
                let selected_id = self.selected_session().map(|s| s.id.clone());
                self.sessions = sessions;
                // Keep the cursor on the same session when the order shifts
                let index = selected_id
                    .and_then(|id| self.sessions.iter().position(|s| s.id == id))
                    .unwrap_or_else(|| {
                        self.list_state
                            .selected()
                            .unwrap_or(0)
                            .min(self.sessions.len().saturating_sub(1))
                    });
                self.list_state.select(Some(index));
                Ok(false)
            }
            Action::Notified(notification) => {
                self.notifications.push_front(notification);
                self.notifications.truncate(NOTIFICATION_HISTORY);
                Ok(false)
            }
            Action::Error(msg) => {
                self.error_message = Some(msg);
                Ok(false)
            }
            Action::Quit => Ok(true),
            Action::AttachSession(_) => Ok(false),
        }
    }

    fn handle_key(&mut self, key: KeyEvent) -> Result<bool> {
        self.error_message = None;

        match key.code {
            KeyCode::Char('q') => return Ok(true),
            KeyCode::Char('j') | KeyCode::Down => self.next_session(),
            KeyCode::Char('k') | KeyCode::Up => self.previous_session(),
            KeyCode::Enter => {
                if let Some(session) = self.selected_session() {
                    self.pending_actions
                        .push(Action::AttachSession(session.id.clone()));
                }
            }
            KeyCode::Char('c') if key.modifiers.contains(KeyModifiers::CONTROL) => {
                return Ok(true);
            }
            _ => {}
        }
        Ok(false)
    }

    fn next_session(&mut self) {
        if self.sessions.is_empty() {
            return;
        }
        let i = match self.list_state.selected() {
            Some(i) if i >= self.sessions.len() - 1 => 0,
            Some(i) => i + 1,
            None => 0,
        };
        self.list_state.select(Some(i));
    }

    fn previous_session(&mut self) {
        if self.sessions.is_empty() {
            return;
        }
        let i = match self.list_state.selected() {
            Some(0) => self.sessions.len() - 1,
            Some(i) => i - 1,
            None => 0,
        };
        self.list_state.select(Some(i));
    }

    pub fn render(&mut self, frame: &mut Frame) {
        let chunks = Layout::default()
            .direction(Direction::Vertical)
            .constraints([
                Constraint::Length(3), // Header
                Constraint::Min(0),    // Main content
                Constraint::Length(3), // Footer/status
            ])
            .split(frame.area());

        self.render_header(frame, chunks[0]);
        self.render_main(frame, chunks[1]);
        self.render_footer(frame, chunks[2]);
    }

    fn render_header(&self, frame: &mut Frame, area: Rect) {
        let waiting = self
            .sessions
            .iter()
            .filter(|s| matches!(s.state, AgentStatus::WaitingForInput | AgentStatus::Error))
            .count();
        let title = Paragraph::new(Line::from(vec![
            Span::styled(
                " AgentHerald ",
                Style::default()
                    .fg(self.theme.accent)
                    .add_modifier(Modifier::BOLD),
            ),
            Span::styled(
                format!(
                    "│ {} sessions, {} need attention",
                    self.sessions.len(),
                    waiting
                ),
                Style::default().fg(self.theme.dim),
            ),
        ]))
        .block(
            Block::default()
                .borders(Borders::ALL)
                .border_style(Style::default().fg(self.theme.dim)),
        );
        frame.render_widget(title, area);
    }

    fn render_main(&mut self, frame: &mut Frame, area: Rect) {
        let columns = Layout::default()
            .direction(Direction::Horizontal)
            .constraints([Constraint::Percentage(40), Constraint::Percentage(60)])
            .split(area);
        let right = Layout::default()
            .direction(Direction::Vertical)
            .constraints([Constraint::Length(10), Constraint::Min(0)])
            .split(columns[1]);

        self.render_session_list(frame, columns[0]);
        self.render_detail_pane(frame, right[0]);
        self.render_notifications(frame, right[1]);
    }

    fn render_session_list(&mut self, frame: &mut Frame, area: Rect) {
        let items: Vec<ListItem> = if self.sessions.is_empty() {
            vec![ListItem::new(Line::from(Span::styled(
                "  No tmux sessions to monitor.",
                Style::default().fg(self.theme.dim),
            )))]
        } else {
            self.sessions
                .iter()
                .map(|session| {
                    let icon = Span::styled(
                        status_icon(session.state),
                        Style::default().fg(self.theme.status_color(session.state)),
                    );
                    let name = Span::styled(&session.id, Style::default().fg(self.theme.fg));
                    let wait = Span::styled(
                        format!("  {}", session.wait.display()),
                        Style::default().fg(self.theme.dim),
                    );
                    ListItem::new(Line::from(vec![icon, name, wait]))
                })
                .collect()
        };

        let list = List::new(items)
            .block(
                Block::default()
                    .title(" Sessions ")
                    .borders(Borders::ALL)
                    .border_style(Style::default().fg(self.theme.dim)),
            )
            .highlight_style(
                Style::default()
                    .bg(Color::Rgb(50, 50, 50))
                    .add_modifier(Modifier::BOLD),
            )
            .highlight_symbol("▶ ");

        frame.render_stateful_widget(list, area, &mut self.list_state);
    }

    fn detail_line<'a>(&self, label: &'a str, value: String, color: Color) -> Line<'a> {
        Line::from(vec![
            Span::styled(label, Style::default().fg(self.theme.dim)),
            Span::styled(value, Style::default().fg(color)),
        ])
    }

    fn render_detail_pane(&self, frame: &mut Frame, area: Rect) {
        let content = if let Some(session) = self.selected_session() {
            let fg = self.theme.fg;
            let notified = match session.since_notification {
                Some(ago) => format!("{}s ago", ago.as_secs()),
                None => "never".to_string(),
            };
            let mut lines = vec![
                self.detail_line("Session: ", session.id.clone(), fg),
                self.detail_line(
                    "State: ",
                    session.state.label().to_string(),
                    self.theme.status_color(session.state),
                ),
                self.detail_line(
                    "Observed: ",
                    session.observed.label().to_string(),
                    self.theme.status_color(session.observed),
                ),
                self.detail_line("Monitor: ", phase_label(session.phase).to_string(), fg),
                self.detail_line(
                    "Waiting: ",
                    format!(
                        "{} ({})",
                        session.wait.display(),
                        source_label(session.wait.source)
                    ),
                    fg,
                ),
                self.detail_line(
                    "Notified: ",
                    format!(
                        "{notified}{}",
                        if session.notification_sent { ", pending change" } else { "" }
                    ),
                    fg,
                ),
            ];
            if session.capture_failures > 0 {
                lines.push(self.detail_line(
                    "Capture failures: ",
                    session.capture_failures.to_string(),
                    self.theme.error,
                ));
            }
            lines
        } else {
            vec![Line::from(Span::styled(
                "No session selected",
                Style::default().fg(self.theme.dim),
            ))]
        };

        let detail = Paragraph::new(content).block(
            Block::default()
                .title(" Details ")
                .borders(Borders::ALL)
                .border_style(Style::default().fg(self.theme.dim)),
        );
        frame.render_widget(detail, area);
    }

    fn render_notifications(&self, frame: &mut Frame, area: Rect) {
        let lines: Vec<Line> = if self.notifications.is_empty() {
            vec![Line::from(Span::styled(
                "Nothing yet.",
                Style::default().fg(self.theme.dim),
            ))]
        } else {
            self.notifications
                .iter()
                .flat_map(|n| self.notification_lines(n))
                .collect()
        };

        let panel = Paragraph::new(lines).wrap(Wrap { trim: false }).block(
            Block::default()
                .title(" Notifications ")
                .borders(Borders::ALL)
                .border_style(Style::default().fg(self.theme.dim)),
        );
        frame.render_widget(panel, area);
    }

    /// Headline with time and icon, then the quoted screen lines indented.
    fn notification_lines<'a>(&self, n: &'a Notification) -> Vec<Line<'a>> {
        let mut lines = vec![Line::from(vec![
            Span::styled(
                format!("{} ", n.at.format("%H:%M:%S")),
                Style::default().fg(self.theme.dim),
            ),
            Span::styled(
                status_icon(n.status),
                Style::default().fg(self.theme.status_color(n.status)),
            ),
            Span::styled(n.headline(), Style::default().fg(self.theme.fg)),
        ])];
        lines.extend(n.tail().map(|line| {
            Line::from(Span::styled(
                format!("    {line}"),
                Style::default().fg(self.theme.dim),
            ))
        }));
        lines
    }

    fn render_footer(&self, frame: &mut Frame, area: Rect) {
        let content = if let Some(ref msg) = self.error_message {
            Line::from(Span::styled(
                format!(" {} ", msg),
                Style::default().fg(self.theme.error),
            ))
        } else {
            Line::from(Span::styled(
                " q: Quit │ j/k: Navigate │ Enter: Attach ",
                Style::default().fg(self.theme.dim),
            ))
        };

        let footer = Paragraph::new(content).block(
            Block::default()
                .borders(Borders::ALL)
                .border_style(Style::default().fg(self.theme.dim)),
        );
        frame.render_widget(footer, area);
    }
}
