use crossterm::event::KeyEvent;

use agent_herald::notify::Notification;

use crate::app::SessionView;

/// Actions that can be dispatched through the application
#[derive(Debug, Clone)]
pub enum Action {
    /// A key was pressed
    KeyPress(KeyEvent),
    /// Fresh view of every monitored session
    SessionsUpdated(Vec<SessionView>),
    /// A notification went out
    Notified(Notification),
    /// An error occurred
    Error(String),
    /// Request to quit the application
    Quit,
    /// Attach to a session
    AttachSession(String),
}
