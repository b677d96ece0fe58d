use anyhow::Result;
use crossterm::event::{KeyCode, KeyEvent, KeyModifiers};
use ratatui::{
    layout::{Constraint, Direction, Layout, Rect},
    style::{Color, Modifier, Style},
    text::{Line, Span},
    widgets::{Block, Borders, Clear, List, ListItem, ListState, Paragraph, Wrap},
    Frame,
};
use std::collections::HashSet;
use std::path::PathBuf;
use std::time::Instant;

use crate::actions::{Action, HeadlessRequest};
use crate::config::{Config, HeadlessConfig};
use crate::headless::reconcile::StatusMap;
use crate::headless_view::HeadlessView;
use crate::tmux::{project_name, sort_sessions, SessionInfo, SortMode};

/// Theme colors inspired by Claude Code
pub struct Theme {
    pub bg: Color,
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
            bg: Color::Rgb(30, 30, 30),
            fg: Color::Rgb(220, 220, 220),
            accent: Color::Rgb(217, 119, 87), // Claude orange
            dim: Color::Rgb(100, 100, 100),
            success: Color::Rgb(80, 200, 120),
            warning: Color::Rgb(255, 193, 7),
            error: Color::Rgb(220, 53, 69),
        }
    }
}

/// What a yes/no dialog is asking about
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Confirm {
    Delete(String),
    KillHeadless(String),
}

/// Input mode for the application
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum InputMode {
    Normal,
    Filtering,
    Creating,
    Renaming(String),
    Confirming(Confirm),
    HeadlessForm,
    HeadlessInput,
    Help,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StatusLevel {
    Info,
    Warning,
    Error,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StatusMessage {
    pub text: String,
    pub level: StatusLevel,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FormField {
    Workdir,
    Agent,
    Model,
    Instruction,
}

impl FormField {
    fn next(self) -> Self {
        match self {
            FormField::Workdir => FormField::Agent,
            FormField::Agent => FormField::Model,
            FormField::Model => FormField::Instruction,
            FormField::Instruction => FormField::Workdir,
        }
    }

    fn previous(self) -> Self {
        match self {
            FormField::Workdir => FormField::Instruction,
            FormField::Agent => FormField::Workdir,
            FormField::Model => FormField::Agent,
            FormField::Instruction => FormField::Model,
        }
    }
}

/// State of the headless launch dialog
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HeadlessForm {
    pub workdir: String,
    pub agents: Vec<String>,
    pub agent_index: usize,
    pub model: String,
    pub instruction: String,
    pub field: FormField,
}

enum FormOutcome {
    Continue,
    Cancel,
    Submit(HeadlessRequest),
    Invalid(String),
}

impl HeadlessForm {
    fn new(config: &HeadlessConfig, workdir: String) -> Self {
        let agents: Vec<String> = config.agent_names().into_iter().map(str::to_string).collect();
        let agent_index = agents
            .iter()
            .position(|a| *a == config.default_agent)
            .unwrap_or(0);
        let mut form = Self {
            workdir,
            agents,
            agent_index,
            model: String::new(),
            instruction: String::new(),
            field: FormField::Instruction,
        };
        form.reset_model(config);
        form
    }

    pub fn agent(&self) -> &str {
        self.agents.get(self.agent_index).map(String::as_str).unwrap_or("")
    }

    fn reset_model(&mut self, config: &HeadlessConfig) {
        self.model = config
            .default_model_for(self.agent())
            .map(str::to_string)
            .or_else(|| config.models_for(self.agent()).first().cloned())
            .unwrap_or_default();
    }

    fn cycle_agent(&mut self, config: &HeadlessConfig, forward: bool) {
        if self.agents.is_empty() {
            return;
        }
        let len = self.agents.len();
        self.agent_index = if forward {
            (self.agent_index + 1) % len
        } else {
            (self.agent_index + len - 1) % len
        };
        self.reset_model(config);
    }

    /// Step through the configured models, then back to "no model"
    fn cycle_model(&mut self, config: &HeadlessConfig) {
        let models = config.models_for(self.agent());
        if models.is_empty() {
            return;
        }
        self.model = match models.iter().position(|m| *m == self.model) {
            Some(idx) if idx + 1 < models.len() => models[idx + 1].clone(),
            Some(_) => String::new(),
            None => models[0].clone(),
        };
    }

    fn text_field(&mut self) -> Option<&mut String> {
        match self.field {
            FormField::Workdir => Some(&mut self.workdir),
            FormField::Model => Some(&mut self.model),
            FormField::Instruction => Some(&mut self.instruction),
            FormField::Agent => None,
        }
    }

    fn handle_key(&mut self, key: KeyEvent, config: &HeadlessConfig) -> FormOutcome {
        match key.code {
            KeyCode::Esc => return FormOutcome::Cancel,
            KeyCode::Down => self.field = self.field.next(),
            KeyCode::Up | KeyCode::BackTab => self.field = self.field.previous(),
            KeyCode::Tab => match self.field {
                FormField::Agent => self.cycle_agent(config, true),
                FormField::Model => self.cycle_model(config),
                _ => self.field = self.field.next(),
            },
            KeyCode::Left if self.field == FormField::Agent => self.cycle_agent(config, false),
            KeyCode::Right if self.field == FormField::Agent => self.cycle_agent(config, true),
            KeyCode::Enter if self.field != FormField::Instruction => {
                self.field = self.field.next()
            }
            KeyCode::Enter => return self.submit(),
            KeyCode::Backspace => {
                if let Some(text) = self.text_field() {
                    text.pop();
                }
            }
            KeyCode::Char(c) => {
                if let Some(text) = self.text_field() {
                    text.push(c);
                }
            }
            _ => {}
        }
        FormOutcome::Continue
    }

    fn submit(&self) -> FormOutcome {
        let instruction = self.instruction.trim();
        if instruction.is_empty() {
            return FormOutcome::Invalid("Instruction is required".to_string());
        }
        let workdir = self.workdir.trim();
        if workdir.is_empty() {
            return FormOutcome::Invalid("Working directory is required".to_string());
        }
        let model = self.model.trim();
        FormOutcome::Submit(HeadlessRequest {
            workdir: expand_home(workdir),
            agent: self.agent().to_string(),
            model: (!model.is_empty()).then(|| model.to_string()),
            instruction: instruction.to_string(),
        })
    }
}

/// Main application state
pub struct App {
    /// Sessions as reported by the last refresh
    pub sessions: Vec<SessionInfo>,
    /// Indices into `sessions` in display order
    visible: Vec<usize>,
    /// Currently selected row of `visible`
    pub list_state: ListState,
    /// Current message to display (info or error)
    pub status: Option<StatusMessage>,
    /// Theme
    pub theme: Theme,
    /// Current input mode
    pub input_mode: InputMode,
    /// Text input buffer
    pub input_buffer: String,
    pub filter: String,
    pub sort_mode: SortMode,
    pub preview: Vec<String>,
    preview_stale: bool,
    pub headless_view: Option<HeadlessView>,
    pub form: Option<HeadlessForm>,
    dry_run: bool,
    headless_config: HeadlessConfig,
    /// Pending action queue
    pending_actions: Vec<Action>,
}

impl App {
    pub fn new(config: &Config) -> Self {
        let mut list_state = ListState::default();
        list_state.select(Some(0));

        Self {
            sessions: Vec::new(),
            visible: Vec::new(),
            list_state,
            status: None,
            theme: Theme::default(),
            input_mode: InputMode::Normal,
            input_buffer: String::new(),
            filter: String::new(),
            sort_mode: config.sort_mode,
            preview: Vec::new(),
            preview_stale: true,
            headless_view: None,
            form: None,
            dry_run: config.dry_run,
            headless_config: config.headless.clone(),
            pending_actions: Vec::new(),
        }
    }

    /// Get the currently selected session
    pub fn selected_session(&self) -> Option<&SessionInfo> {
        self.list_state
            .selected()
            .and_then(|i| self.visible.get(i))
            .and_then(|&idx| self.sessions.get(idx))
    }

    /// Sessions in display order
    pub fn visible_sessions(&self) -> impl Iterator<Item = &SessionInfo> {
        self.visible.iter().filter_map(|&idx| self.sessions.get(idx))
    }

    /// Take pending actions (drains the queue)
    pub fn take_pending_actions(&mut self) -> Vec<Action> {
        std::mem::take(&mut self.pending_actions)
    }

    /// The session whose preview needs fetching, if the selection moved
    pub fn take_preview_request(&mut self) -> Option<SessionInfo> {
        if !self.preview_stale || self.headless_view.is_some() {
            return None;
        }
        self.preview_stale = false;
        self.selected_session().cloned()
    }

    pub fn set_preview(&mut self, lines: Vec<String>) {
        self.preview = lines;
    }

    pub fn set_status(&mut self, text: impl Into<String>, level: StatusLevel) {
        self.status = Some(StatusMessage {
            text: text.into(),
            level,
        });
    }

    /// Replace the session list, keeping the selection on the same session when possible
    pub fn set_sessions(&mut self, sessions: Vec<SessionInfo>) {
        let selected = self.selected_session().map(|s| s.name.clone());
        self.sessions = sessions;
        self.rebuild_visible(selected.as_deref());
        self.preview_stale = true;
    }

    pub fn open_headless(&mut self, view: HeadlessView) {
        self.headless_view = Some(view);
        self.input_mode = InputMode::Normal;
    }

    /// Advance timers; polls the open headless view when it is due
    pub fn tick(&mut self, now: Instant) {
        if let Some(view) = self.headless_view.as_mut() {
            view.tick(now);
        }
    }

    pub fn apply_runtime(&mut self, statuses: &StatusMap) {
        if let Some(view) = self.headless_view.as_mut() {
            if let Some(status) = statuses.get(view.name()) {
                view.set_runtime(*status);
            }
        }
    }

    /// Handle an action and return whether to quit
    pub fn handle_action(&mut self, action: Action) -> Result<bool> {
        match action {
            Action::KeyPress(key) => self.handle_key(key),
            other => {
                self.pending_actions.push(other);
                Ok(false)
            }
        }
    }

    fn rebuild_visible(&mut self, keep: Option<&str>) {
        let needle = self.filter.to_lowercase();
        let mut matching: Vec<SessionInfo> = self
            .sessions
            .iter()
            .filter(|s| needle.is_empty() || s.name.to_lowercase().contains(&needle))
            .cloned()
            .collect();
        sort_sessions(&mut matching, self.sort_mode);

        // Interactive sessions first, then headless runs
        let order: Vec<&str> = matching
            .iter()
            .filter(|s| !s.is_headless)
            .chain(matching.iter().filter(|s| s.is_headless))
            .map(|s| s.name.as_str())
            .collect();
        self.visible = order
            .iter()
            .filter_map(|name| self.sessions.iter().position(|s| s.name == *name))
            .collect();

        let index = keep
            .and_then(|name| {
                self.visible
                    .iter()
                    .position(|&idx| self.sessions[idx].name == name)
            })
            .or_else(|| self.list_state.selected())
            .unwrap_or(0);
        if self.visible.is_empty() {
            self.list_state.select(Some(0));
        } else {
            self.list_state.select(Some(index.min(self.visible.len() - 1)));
        }
    }

    fn handle_key(&mut self, key: KeyEvent) -> Result<bool> {
        if key.code == KeyCode::Char('c') && key.modifiers.contains(KeyModifiers::CONTROL) {
            return Ok(true);
        }

        // Clear the message on any key press
        if self.status.is_some() && self.input_mode == InputMode::Normal {
            self.status = None;
        }

        match self.input_mode.clone() {
            InputMode::Normal if self.headless_view.is_some() => self.handle_headless_key(key),
            InputMode::Normal => self.handle_normal_key(key),
            InputMode::Filtering => self.handle_filter_key(key),
            InputMode::Creating => self.handle_creating_key(key),
            InputMode::Renaming(old) => self.handle_renaming_key(key, old),
            InputMode::Confirming(confirm) => self.handle_confirming_key(key, confirm),
            InputMode::HeadlessForm => self.handle_form_key(key),
            InputMode::HeadlessInput => self.handle_headless_input_key(key),
            InputMode::Help => {
                self.input_mode = InputMode::Normal;
                Ok(false)
            }
        }
    }

    fn handle_normal_key(&mut self, key: KeyEvent) -> Result<bool> {
        match key.code {
            KeyCode::Char('q') => return Ok(true),
            KeyCode::Char('j') | KeyCode::Down => self.next_session(),
            KeyCode::Char('k') | KeyCode::Up => self.previous_session(),
            KeyCode::Enter => match self.selected_session() {
                Some(session) if session.is_headless => {
                    let name = session.name.clone();
                    self.pending_actions.push(Action::OpenHeadless(name));
                }
                Some(session) => {
                    let name = session.name.clone();
                    self.pending_actions.push(Action::AttachSession(name));
                }
                None => self.set_status("No sessions to attach", StatusLevel::Warning),
            },
            KeyCode::Char('n') => {
                self.input_mode = InputMode::Creating;
                self.input_buffer.clear();
            }
            KeyCode::Char('H') => {
                let workdir = std::env::current_dir()
                    .map(|p| p.display().to_string())
                    .unwrap_or_default();
                self.form = Some(HeadlessForm::new(&self.headless_config, workdir));
                self.input_mode = InputMode::HeadlessForm;
            }
            KeyCode::Char('d') => match self.selected_session() {
                None => self.set_status("No sessions to delete", StatusLevel::Warning),
                Some(_) if self.dry_run => {
                    self.set_status("Dry-run enabled. Delete blocked.", StatusLevel::Warning)
                }
                Some(session) => {
                    self.input_mode = InputMode::Confirming(Confirm::Delete(session.name.clone()))
                }
            },
            KeyCode::Char('R') => match self.selected_session() {
                None => self.set_status("No sessions to rename", StatusLevel::Warning),
                Some(session) if session.is_headless => self.set_status(
                    "Headless sessions cannot be renamed",
                    StatusLevel::Warning,
                ),
                Some(session) => {
                    let old = session.name.clone();
                    self.input_buffer = old.clone();
                    self.input_mode = InputMode::Renaming(old);
                }
            },
            KeyCode::Char('r') => self.pending_actions.push(Action::Refresh),
            KeyCode::Char('s') => {
                self.sort_mode = self.sort_mode.next();
                let keep = self.selected_session().map(|s| s.name.clone());
                self.rebuild_visible(keep.as_deref());
                self.set_status(format!("Sort mode: {}", self.sort_mode.label()), StatusLevel::Info);
            }
            KeyCode::Char('/') => {
                self.input_mode = InputMode::Filtering;
            }
            KeyCode::Char('?') | KeyCode::F(1) => self.input_mode = InputMode::Help,
            KeyCode::Esc if !self.filter.is_empty() => {
                self.filter.clear();
                self.rebuild_visible(None);
            }
            _ => {}
        }
        Ok(false)
    }

    fn handle_headless_key(&mut self, key: KeyEvent) -> Result<bool> {
        let Some(view) = self.headless_view.as_mut() else {
            return Ok(false);
        };
        let name = view.name().to_string();
        match key.code {
            KeyCode::Char('q') | KeyCode::Esc => {
                self.headless_view = None;
                self.preview_stale = true;
                self.pending_actions.push(Action::Refresh);
            }
            KeyCode::Char('p') => view.show_prompt = !view.show_prompt,
            KeyCode::Char('o') => {
                view.show_raw = !view.show_raw;
                view.scroll = 0;
            }
            KeyCode::Char('r') => view.request_refresh(),
            KeyCode::Char('a') => self.pending_actions.push(Action::AttachSession(name)),
            KeyCode::Char('i') => {
                self.input_buffer.clear();
                self.input_mode = InputMode::HeadlessInput;
            }
            KeyCode::Char('k') => {
                self.input_mode = InputMode::Confirming(Confirm::KillHeadless(name));
            }
            KeyCode::Up | KeyCode::PageUp => view.scroll = view.scroll.saturating_add(1),
            KeyCode::Down | KeyCode::PageDown => view.scroll = view.scroll.saturating_sub(1),
            KeyCode::End => view.scroll = 0,
            _ => {}
        }
        Ok(false)
    }

    fn handle_filter_key(&mut self, key: KeyEvent) -> Result<bool> {
        match key.code {
            KeyCode::Enter => self.input_mode = InputMode::Normal,
            KeyCode::Esc => {
                self.filter.clear();
                self.input_mode = InputMode::Normal;
            }
            KeyCode::Backspace => {
                self.filter.pop();
            }
            KeyCode::Char(c) => self.filter.push(c),
            _ => return Ok(false),
        }
        self.rebuild_visible(None);
        self.preview_stale = true;
        Ok(false)
    }

    fn handle_creating_key(&mut self, key: KeyEvent) -> Result<bool> {
        match key.code {
            KeyCode::Enter => {
                let workdir = std::env::current_dir().unwrap_or_else(|_| PathBuf::from("."));
                let base = if self.input_buffer.is_empty() {
                    project_name(&workdir)
                } else {
                    self.input_buffer.clone()
                };
                let existing: HashSet<&str> = self.sessions.iter().map(|s| s.name.as_str()).collect();
                let name = unique_name(&base, &existing);
                self.pending_actions.push(Action::CreateSession { name, workdir });
                self.input_buffer.clear();
                self.input_mode = InputMode::Normal;
            }
            KeyCode::Esc => {
                self.input_buffer.clear();
                self.input_mode = InputMode::Normal;
                self.set_status("Create canceled", StatusLevel::Warning);
            }
            KeyCode::Char(c) => {
                // Only allow valid session name characters
                if c.is_alphanumeric() || c == '-' || c == '_' {
                    self.input_buffer.push(c);
                }
            }
            KeyCode::Backspace => {
                self.input_buffer.pop();
            }
            _ => {}
        }
        Ok(false)
    }

    fn handle_renaming_key(&mut self, key: KeyEvent, old: String) -> Result<bool> {
        match key.code {
            KeyCode::Enter => {
                let new = self.input_buffer.trim().to_string();
                if new.is_empty() {
                    self.set_status("Rename canceled", StatusLevel::Warning);
                } else if new == old {
                    self.set_status("Name unchanged", StatusLevel::Warning);
                } else {
                    self.pending_actions.push(Action::RenameSession { old, new });
                }
                self.input_buffer.clear();
                self.input_mode = InputMode::Normal;
            }
            KeyCode::Esc => {
                self.input_buffer.clear();
                self.input_mode = InputMode::Normal;
            }
            KeyCode::Char(c) => {
                if c.is_alphanumeric() || c == '-' || c == '_' {
                    self.input_buffer.push(c);
                }
            }
            KeyCode::Backspace => {
                self.input_buffer.pop();
            }
            _ => {}
        }
        Ok(false)
    }

    fn handle_confirming_key(&mut self, key: KeyEvent, confirm: Confirm) -> Result<bool> {
        match key.code {
            KeyCode::Char('y') | KeyCode::Char('Y') | KeyCode::Enter => {
                let action = match confirm {
                    Confirm::Delete(name) => Action::DeleteSession(name),
                    Confirm::KillHeadless(name) => Action::KillHeadless(name),
                };
                self.pending_actions.push(action);
                self.input_mode = InputMode::Normal;
            }
            KeyCode::Char('n') | KeyCode::Char('N') | KeyCode::Esc => {
                self.input_mode = InputMode::Normal;
                self.set_status("Canceled", StatusLevel::Warning);
            }
            _ => {}
        }
        Ok(false)
    }

    fn handle_form_key(&mut self, key: KeyEvent) -> Result<bool> {
        let Some(form) = self.form.as_mut() else {
            self.input_mode = InputMode::Normal;
            return Ok(false);
        };
        match form.handle_key(key, &self.headless_config) {
            FormOutcome::Continue => {}
            FormOutcome::Cancel => {
                self.form = None;
                self.input_mode = InputMode::Normal;
                self.set_status("Headless create canceled", StatusLevel::Warning);
            }
            FormOutcome::Invalid(message) => self.set_status(message, StatusLevel::Error),
            FormOutcome::Submit(request) => {
                self.form = None;
                self.input_mode = InputMode::Normal;
                self.pending_actions.push(Action::LaunchHeadless(request));
            }
        }
        Ok(false)
    }

    fn handle_headless_input_key(&mut self, key: KeyEvent) -> Result<bool> {
        match key.code {
            KeyCode::Enter => {
                let text = std::mem::take(&mut self.input_buffer);
                if let (Some(view), false) = (self.headless_view.as_ref(), text.trim().is_empty()) {
                    self.pending_actions.push(Action::SendInput {
                        session: view.name().to_string(),
                        text,
                    });
                }
                self.input_mode = InputMode::Normal;
            }
            KeyCode::Esc => {
                self.input_buffer.clear();
                self.input_mode = InputMode::Normal;
            }
            KeyCode::Char(c) => self.input_buffer.push(c),
            KeyCode::Backspace => {
                self.input_buffer.pop();
            }
            _ => {}
        }
        Ok(false)
    }

    fn next_session(&mut self) {
        if self.visible.is_empty() {
            return;
        }
        let i = match self.list_state.selected() {
            Some(i) if i + 1 < self.visible.len() => i + 1,
            _ => 0,
        };
        self.list_state.select(Some(i));
        self.preview_stale = true;
    }

    fn previous_session(&mut self) {
        if self.visible.is_empty() {
            return;
        }
        let i = match self.list_state.selected() {
            Some(0) | None => self.visible.len() - 1,
            Some(i) => i - 1,
        };
        self.list_state.select(Some(i));
        self.preview_stale = true;
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
        match &self.headless_view {
            Some(view) => view.render(frame, chunks[1], &self.theme),
            None => self.render_main(frame, chunks[1]),
        }
        self.render_footer(frame, chunks[2]);

        // Render modal dialogs on top
        match self.input_mode.clone() {
            InputMode::Creating => self.render_input_dialog(
                frame,
                " Create New Session ",
                "Enter session name (empty uses the project name):",
            ),
            InputMode::Renaming(old) => {
                self.render_input_dialog(frame, " Rename Session ", &format!("New name for '{}':", old))
            }
            InputMode::HeadlessInput => {
                self.render_input_dialog(frame, " Send Input ", "Text to send to the agent:")
            }
            InputMode::Confirming(confirm) => self.render_confirm_dialog(frame, &confirm),
            InputMode::HeadlessForm => self.render_form_dialog(frame),
            InputMode::Help => self.render_help_dialog(frame),
            InputMode::Normal | InputMode::Filtering => {}
        }
    }

    fn render_header(&self, frame: &mut Frame, area: Rect) {
        let mut spans = vec![
            Span::styled(
                " tmux-dashboard ",
                Style::default()
                    .fg(self.theme.accent)
                    .add_modifier(Modifier::BOLD),
            ),
            Span::styled(
                format!("│ sort: {} ", self.sort_mode.label()),
                Style::default().fg(self.theme.dim),
            ),
        ];
        if !self.filter.is_empty() {
            spans.push(Span::styled(
                format!("│ filter: {} ", self.filter),
                Style::default().fg(self.theme.fg),
            ));
        }
        if self.dry_run {
            spans.push(Span::styled(
                "│ DRY RUN ",
                Style::default().fg(self.theme.warning),
            ));
        }
        let title = Paragraph::new(Line::from(spans)).block(
            Block::default()
                .borders(Borders::ALL)
                .border_style(Style::default().fg(self.theme.dim)),
        );
        frame.render_widget(title, area);
    }

    fn render_main(&mut self, frame: &mut Frame, area: Rect) {
        let chunks = Layout::default()
            .direction(Direction::Horizontal)
            .constraints([
                Constraint::Percentage(40), // Session list
                Constraint::Percentage(60), // Preview pane
            ])
            .split(area);

        self.render_session_list(frame, chunks[0]);
        self.render_preview_pane(frame, chunks[1]);
    }

    fn session_item(&self, session: &SessionInfo) -> ListItem<'static> {
        let mut spans = Vec::new();
        if session.is_headless {
            let status = session.headless_status;
            let icon = status.map(|s| s.icon()).filter(|i| !i.is_empty()).unwrap_or("·");
            spans.push(Span::styled(format!("{} ", icon), Style::default().fg(self.theme.accent)));
            spans.push(Span::styled(session.name.clone(), Style::default().fg(self.theme.fg)));
            let mut detail = session.headless_agent.clone().unwrap_or_default();
            if let Some(model) = &session.headless_model {
                detail.push_str(&format!("·{}", model));
            }
            if let Some(code) = session.headless_exit_code {
                detail.push_str(&format!(" exit {}", code));
            }
            spans.push(Span::styled(format!("  [{}]", detail), Style::default().fg(self.theme.dim)));
        } else {
            let icon = if session.attached {
                Span::styled("● ", Style::default().fg(self.theme.success))
            } else {
                Span::styled("○ ", Style::default().fg(self.theme.dim))
            };
            spans.push(icon);
            spans.push(Span::styled(session.name.clone(), Style::default().fg(self.theme.fg)));
            spans.push(Span::styled(
                format!("  {}w", session.windows),
                Style::default().fg(self.theme.dim),
            ));
            if session.is_ai_session {
                let agent = session.ai_agent.clone().unwrap_or_else(|| "ai".to_string());
                spans.push(Span::styled(format!(" 🤖 {}", agent), Style::default().fg(self.theme.accent)));
            }
        }
        ListItem::new(Line::from(spans))
    }

    fn render_session_list(&mut self, frame: &mut Frame, area: Rect) {
        let items: Vec<ListItem> = if self.visible.is_empty() {
            let hint = if self.filter.is_empty() {
                "  No sessions found. Press 'n' to create one."
            } else {
                "  No sessions match the filter."
            };
            vec![ListItem::new(Line::from(Span::styled(
                hint,
                Style::default().fg(self.theme.dim),
            )))]
        } else {
            self.visible_sessions().map(|s| self.session_item(s)).collect()
        };

        let headless_count = self.visible_sessions().filter(|s| s.is_headless).count();
        let title = format!(
            " Sessions ({} interactive · {} headless) ",
            self.visible.len() - headless_count,
            headless_count
        );
        let list = List::new(items)
            .block(
                Block::default()
                    .title(title)
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

    fn render_preview_pane(&self, frame: &mut Frame, area: Rect) {
        let (title, content) = match self.selected_session() {
            Some(session) => {
                let lines: Vec<Line> = self
                    .preview
                    .iter()
                    .map(|l| Line::from(Span::styled(l.clone(), Style::default().fg(self.theme.fg))))
                    .collect();
                (format!(" Preview: {} ", session.name), lines)
            }
            None => (
                " Preview ".to_string(),
                vec![
                    Line::from(Span::styled(
                        "No session selected",
                        Style::default().fg(self.theme.dim),
                    )),
                    Line::from(""),
                    Line::from(Span::styled(
                        "Press 'n' to create a session or 'H' to launch a headless agent",
                        Style::default().fg(self.theme.dim),
                    )),
                ],
            ),
        };

        let detail = Paragraph::new(content).block(
            Block::default()
                .title(title)
                .borders(Borders::ALL)
                .border_style(Style::default().fg(self.theme.dim)),
        );
        frame.render_widget(detail, area);
    }

    fn render_footer(&self, frame: &mut Frame, area: Rect) {
        let help_text = if self.headless_view.is_some() {
            " q: Back │ p: Prompt │ o: Raw │ a: Attach │ i: Input │ k: Kill │ r: Refresh "
        } else {
            " q: Quit │ Enter: Open │ n: New │ H: Headless │ d: Delete │ R: Rename │ s: Sort │ /: Filter │ ?: Help "
        };

        let content = if self.input_mode == InputMode::Filtering {
            Line::from(Span::styled(
                format!(" /{}_", self.filter),
                Style::default().fg(self.theme.accent),
            ))
        } else if let Some(ref msg) = self.status {
            let color = match msg.level {
                StatusLevel::Info => self.theme.success,
                StatusLevel::Warning => self.theme.warning,
                StatusLevel::Error => self.theme.error,
            };
            Line::from(Span::styled(format!(" {} ", msg.text), Style::default().fg(color)))
        } else {
            Line::from(Span::styled(help_text, Style::default().fg(self.theme.dim)))
        };

        let footer = Paragraph::new(content).block(
            Block::default()
                .borders(Borders::ALL)
                .border_style(Style::default().fg(self.theme.dim)),
        );
        frame.render_widget(footer, area);
    }

    fn render_input_dialog(&self, frame: &mut Frame, title: &str, prompt: &str) {
        let area = centered_rect(50, 20, frame.area());

        frame.render_widget(Clear, area);

        let block = Block::default()
            .title(title.to_string())
            .borders(Borders::ALL)
            .border_style(Style::default().fg(self.theme.accent));

        let inner = block.inner(area);
        frame.render_widget(block, area);

        let text = vec![
            Line::from(""),
            Line::from(Span::styled(prompt.to_string(), Style::default().fg(self.theme.fg))),
            Line::from(""),
            Line::from(Span::styled(
                format!("▶ {}_", self.input_buffer),
                Style::default()
                    .fg(self.theme.accent)
                    .add_modifier(Modifier::BOLD),
            )),
            Line::from(""),
            Line::from(Span::styled(
                "Press Enter to confirm, Esc to cancel",
                Style::default().fg(self.theme.dim),
            )),
        ];

        frame.render_widget(Paragraph::new(text), inner);
    }

    fn render_confirm_dialog(&self, frame: &mut Frame, confirm: &Confirm) {
        let area = centered_rect(50, 20, frame.area());

        frame.render_widget(Clear, area);

        let (title, question, warning) = match confirm {
            Confirm::Delete(name) => {
                let session = self.sessions.iter().find(|s| &s.name == name);
                let missing = session.is_some_and(|s| {
                    s.headless_status == Some(crate::tmux::HeadlessStatus::Missing)
                });
                let kind = if session.is_some_and(|s| s.attached) {
                    "attached session"
                } else {
                    "session"
                };
                let warning = if missing {
                    "The tmux session is gone; only the record is removed."
                } else {
                    "This will terminate running processes."
                };
                (" Confirm Delete ", format!("Delete {} '{}'?", kind, name), warning)
            }
            Confirm::KillHeadless(name) => (
                " Confirm Kill ",
                format!("Kill headless session '{}'?", name),
                "The agent process will be terminated.",
            ),
        };

        let block = Block::default()
            .title(title)
            .borders(Borders::ALL)
            .border_style(Style::default().fg(self.theme.error));

        let inner = block.inner(area);
        frame.render_widget(block, area);

        let text = vec![
            Line::from(""),
            Line::from(Span::styled(question, Style::default().fg(self.theme.fg))),
            Line::from(""),
            Line::from(Span::styled(warning, Style::default().fg(self.theme.warning))),
            Line::from(""),
            Line::from(Span::styled(
                "Press 'y' to confirm, 'n' or Esc to cancel",
                Style::default().fg(self.theme.dim),
            )),
        ];

        frame.render_widget(Paragraph::new(text), inner);
    }

    fn render_form_dialog(&self, frame: &mut Frame) {
        let Some(form) = &self.form else {
            return;
        };
        let area = centered_rect(70, 50, frame.area());
        frame.render_widget(Clear, area);

        let block = Block::default()
            .title(" Launch Headless Agent ")
            .borders(Borders::ALL)
            .border_style(Style::default().fg(self.theme.accent));
        let inner = block.inner(area);
        frame.render_widget(block, area);

        let models = self.headless_config.models_for(form.agent());
        let model_hint = if models.is_empty() {
            String::new()
        } else {
            format!("  (Tab: {})", models.join(", "))
        };
        let model_value = if form.model.is_empty() {
            "(default)".to_string()
        } else {
            form.model.clone()
        };
        let fields = [
            (FormField::Workdir, "Directory", form.workdir.clone()),
            (FormField::Agent, "Agent", format!("◀ {} ▶", form.agent())),
            (FormField::Model, "Model", format!("{}{}", model_value, model_hint)),
            (FormField::Instruction, "Instruction", form.instruction.clone()),
        ];

        let mut text = vec![Line::from("")];
        for (field, label, value) in fields {
            let focused = form.field == field;
            let marker = if focused { "▶ " } else { "  " };
            let cursor = if focused && field != FormField::Agent { "_" } else { "" };
            let value_style = if focused {
                Style::default().fg(self.theme.accent).add_modifier(Modifier::BOLD)
            } else {
                Style::default().fg(self.theme.fg)
            };
            text.push(Line::from(vec![
                Span::styled(format!("{}{:<12}", marker, label), Style::default().fg(self.theme.dim)),
                Span::styled(format!("{}{}", value, cursor), value_style),
            ]));
        }
        text.push(Line::from(""));
        text.push(Line::from(Span::styled(
            "↑/↓ move │ Tab cycle agent/model │ Enter launch │ Esc cancel",
            Style::default().fg(self.theme.dim),
        )));

        frame.render_widget(Paragraph::new(text).wrap(Wrap { trim: false }), inner);
    }

    fn render_help_dialog(&self, frame: &mut Frame) {
        let area = centered_rect(60, 70, frame.area());
        frame.render_widget(Clear, area);

        let entries = [
            ("↑/↓ j/k", "Navigate sessions"),
            ("Enter", "Attach, or open a headless session"),
            ("n", "Create session"),
            ("H", "Launch headless agent"),
            ("d", "Delete session"),
            ("R", "Rename session"),
            ("r", "Refresh list"),
            ("s", "Cycle sort mode"),
            ("/", "Filter by name"),
            ("q / Ctrl+C", "Quit"),
            ("", ""),
            ("p / o", "Headless: full prompt / raw output"),
            ("a / i / k", "Headless: attach / send input / kill"),
        ];
        let text: Vec<Line> = entries
            .iter()
            .map(|(key, help)| {
                Line::from(vec![
                    Span::styled(format!(" {:<12}", key), Style::default().fg(self.theme.accent)),
                    Span::styled(help.to_string(), Style::default().fg(self.theme.fg)),
                ])
            })
            .collect();

        let help = Paragraph::new(text).block(
            Block::default()
                .title(" Help (any key to close) ")
                .borders(Borders::ALL)
                .border_style(Style::default().fg(self.theme.accent)),
        );
        frame.render_widget(help, area);
    }
}

fn expand_home(value: &str) -> PathBuf {
    match (value.strip_prefix("~/"), dirs::home_dir()) {
        (Some(rest), Some(home)) => home.join(rest),
        _ if value == "~" => dirs::home_dir().unwrap_or_else(|| PathBuf::from(value)),
        _ => PathBuf::from(value),
    }
}

/// `base`, or `base-N` for the first free N
fn unique_name(base: &str, existing: &HashSet<&str>) -> String {
    if !existing.contains(base) {
        return base.to_string();
    }
    (2..)
        .map(|n| format!("{}-{}", base, n))
        .find(|candidate| !existing.contains(candidate.as_str()))
        .unwrap_or_else(|| base.to_string())
}

/// Helper function to create a centered rectangle
fn centered_rect(percent_x: u16, percent_y: u16, r: Rect) -> Rect {
    let popup_layout = Layout::default()
        .direction(Direction::Vertical)
        .constraints([
            Constraint::Percentage((100 - percent_y) / 2),
            Constraint::Percentage(percent_y),
            Constraint::Percentage((100 - percent_y) / 2),
        ])
        .split(r);

    Layout::default()
        .direction(Direction::Horizontal)
        .constraints([
            Constraint::Percentage((100 - percent_x) / 2),
            Constraint::Percentage(percent_x),
            Constraint::Percentage((100 - percent_x) / 2),
        ])
        .split(popup_layout[1])[1]
}
