use crossterm::event::KeyEvent;
use std::path::PathBuf;

/// Actions that can be dispatched through the application
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Action {
    /// A key was pressed
    KeyPress(KeyEvent),
    /// Refresh the session list right away
    Refresh,
    /// Hand the terminal to a session
    AttachSession(String),
    /// Create a session in `workdir`, then attach to it
    CreateSession { name: String, workdir: PathBuf },
    /// Delete a session, or forget a headless record whose session is gone
    DeleteSession(String),
    RenameSession { old: String, new: String },
    /// Launch a headless agent run
    LaunchHeadless(HeadlessRequest),
    /// Open the output view of a headless session
    OpenHeadless(String),
    /// Type a line into a headless session
    SendInput { session: String, text: String },
    /// Kill the tmux session behind a headless run, keeping its record
    KillHeadless(String),
}

/// Everything the headless form collects
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HeadlessRequest {
    pub workdir: PathBuf,
    pub agent: String,
    pub model: Option<String>,
    pub instruction: String,
}
