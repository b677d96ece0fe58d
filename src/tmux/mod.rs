mod client;
mod heuristics;

pub use client::TmuxClient;
pub use heuristics::AgentDetector;

use serde::{Deserialize, Serialize};
use std::path::Path;
use thiserror::Error;

/// Errors raised by the tmux backend
#[derive(Debug, Error)]
pub enum TmuxError {
    /// The tmux binary could not be executed
    #[error("failed to run tmux: {0}")]
    Spawn(#[from] std::io::Error),
    /// tmux ran but reported a failure
    #[error("tmux {command} failed: {stderr}")]
    Command { command: String, stderr: String },
}

/// Runtime state of a session's processes, recomputed on every refresh
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct SessionRuntimeStatus {
    /// The backend still knows this session
    pub exists: bool,
    /// At least one pane's process is alive
    pub running: bool,
    /// Highest exit code observed across dead panes
    pub exit_code: Option<i32>,
}

impl SessionRuntimeStatus {
    pub fn missing() -> Self {
        Self::default()
    }
}

/// Display status of a headless session
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HeadlessStatus {
    Running,
    WaitingInput,
    Completed,
    Missing,
    Unknown,
}

impl HeadlessStatus {
    pub fn from_runtime(status: Option<&SessionRuntimeStatus>, waiting_input: bool) -> Self {
        match status {
            None => HeadlessStatus::Unknown,
            Some(s) if !s.exists => HeadlessStatus::Missing,
            Some(s) if s.running && waiting_input => HeadlessStatus::WaitingInput,
            Some(s) if s.running => HeadlessStatus::Running,
            Some(_) => HeadlessStatus::Completed,
        }
    }

    pub fn label(self) -> &'static str {
        match self {
            HeadlessStatus::Running => "running",
            HeadlessStatus::WaitingInput => "waiting_input",
            HeadlessStatus::Completed => "completed",
            HeadlessStatus::Missing => "missing",
            HeadlessStatus::Unknown => "unknown",
        }
    }

    pub fn icon(self) -> &'static str {
        match self {
            HeadlessStatus::Running => "⏳",
            HeadlessStatus::WaitingInput => "⌛",
            HeadlessStatus::Completed => "✅",
            HeadlessStatus::Missing => "⚠️",
            HeadlessStatus::Unknown => "",
        }
    }
}

/// Represents a tmux session as shown in the dashboard
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SessionInfo {
    /// Session name
    pub name: String,
    /// Whether any client is attached
    pub attached: bool,
    /// Number of windows
    pub windows: usize,
    /// Whether the session looks like an AI agent session
    pub is_ai_session: bool,
    /// Detected agent, if recognizable
    pub ai_agent: Option<String>,
    pub is_headless: bool,
    pub headless_agent: Option<String>,
    pub headless_model: Option<String>,
    pub headless_status: Option<HeadlessStatus>,
    pub headless_exit_code: Option<i32>,
}

impl SessionInfo {
    pub fn new(name: impl Into<String>, attached: bool, windows: usize) -> Self {
        Self {
            name: name.into(),
            attached,
            windows,
            ..Default::default()
        }
    }
}

/// Ordering applied to the session list
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SortMode {
    Activity,
    Name,
    #[default]
    AiFirst,
    WindowsCount,
}

impl SortMode {
    pub fn next(self) -> Self {
        match self {
            SortMode::Activity => SortMode::Name,
            SortMode::Name => SortMode::AiFirst,
            SortMode::AiFirst => SortMode::WindowsCount,
            SortMode::WindowsCount => SortMode::Activity,
        }
    }

    pub fn label(self) -> &'static str {
        match self {
            SortMode::Activity => "activity",
            SortMode::Name => "name",
            SortMode::AiFirst => "ai_first",
            SortMode::WindowsCount => "windows_count",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value.trim().to_lowercase().as_str() {
            "activity" => Some(SortMode::Activity),
            "name" => Some(SortMode::Name),
            "ai_first" | "ai" => Some(SortMode::AiFirst),
            "windows_count" | "windows" => Some(SortMode::WindowsCount),
            _ => None,
        }
    }
}

/// Session-name-safe form of the directory's last component.
///
/// Anything outside alphanumerics, `-` and `_` becomes `_`; tmux would
/// otherwise rewrite `.` and `:` behind our back.
pub fn project_name(workdir: &Path) -> String {
    let resolved = workdir.canonicalize().unwrap_or_else(|_| workdir.to_path_buf());
    resolved
        .file_name()
        .map(|n| {
            n.to_string_lossy()
                .chars()
                .map(|c| if c.is_alphanumeric() || c == '-' || c == '_' { c } else { '_' })
                .collect::<String>()
        })
        .filter(|n| !n.is_empty())
        .unwrap_or_else(|| "session".to_string())
}

pub fn sort_sessions(sessions: &mut [SessionInfo], mode: SortMode) {
    match mode {
        SortMode::Name => sessions.sort_by_key(|s| s.name.to_lowercase()),
        SortMode::Activity => sessions.sort_by_key(|s| (!s.attached, s.name.to_lowercase())),
        SortMode::AiFirst => sessions.sort_by_key(|s| (!s.is_ai_session, s.name.to_lowercase())),
        SortMode::WindowsCount => {
            sessions.sort_by_key(|s| (std::cmp::Reverse(s.windows), s.name.to_lowercase()))
        }
    }
}

/// Operations the dashboard needs from the session multiplexer.
///
/// The tmux CLI binding is [`TmuxClient`]; tests substitute an in-memory fake.
#[allow(async_fn_in_trait)]
pub trait SessionBackend {
    async fn list_sessions(&self) -> Result<Vec<SessionInfo>, TmuxError>;

    async fn create_session(&self, name: &str, workdir: &Path) -> Result<(), TmuxError>;

    /// Create a detached session whose first window runs `argv`
    async fn create_session_with_command(
        &self,
        name: &str,
        argv: &[String],
        workdir: &Path,
    ) -> Result<(), TmuxError>;

    async fn kill_session(&self, name: &str) -> Result<(), TmuxError>;

    async fn rename_session(&self, old: &str, new: &str) -> Result<(), TmuxError>;

    async fn capture_pane_text(&self, name: &str) -> Result<Vec<String>, TmuxError>;

    /// Type `text` into the session's first window followed by Enter
    async fn send_keys(&self, name: &str, text: &str) -> Result<(), TmuxError>;

    /// Never fails: an unreachable backend reports the session as missing
    async fn runtime_status(&self, name: &str) -> SessionRuntimeStatus;

    /// Command line that hands the terminal to the session; the caller runs it
    fn attach_command(&self, name: &str) -> Vec<String>;
}
