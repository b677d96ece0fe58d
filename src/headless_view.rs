//! Focused view of one headless session: status line, prompt and output.

use ratatui::{
    layout::{Constraint, Direction, Layout, Rect},
    style::{Modifier, Style},
    text::{Line, Span},
    widgets::{Block, Borders, Paragraph, Wrap},
    Frame,
};
use std::time::{Duration, Instant};

use crate::app::Theme;
use crate::headless::classify::line_label;
use crate::headless::{summarize_prompt, HeadlessLogTail, HeadlessSession};
use crate::tmux::{HeadlessStatus, SessionRuntimeStatus};

const SPINNER: [&str; 4] = ["|", "/", "-", "\\"];

pub struct HeadlessView {
    pub session: HeadlessSession,
    tail: HeadlessLogTail,
    lines: Vec<String>,
    pub show_prompt: bool,
    pub show_raw: bool,
    base_refresh: Duration,
    refresh: Duration,
    next_poll: Instant,
    seen_event: Option<Instant>,
    waiting_threshold: Duration,
    runtime: Option<SessionRuntimeStatus>,
    spinner: usize,
    /// Output lines scrolled up from the bottom
    pub scroll: u16,
}

impl HeadlessView {
    pub fn new(
        session: HeadlessSession,
        max_events: usize,
        base_refresh: Duration,
        waiting_threshold: Duration,
        now: Instant,
    ) -> Self {
        let tail = HeadlessLogTail::new(session.output_path.clone(), max_events);
        let base_refresh = base_refresh.max(Duration::from_millis(100));
        Self {
            session,
            tail,
            lines: Vec::new(),
            show_prompt: false,
            show_raw: false,
            base_refresh,
            refresh: base_refresh,
            next_poll: now,
            seen_event: None,
            waiting_threshold,
            runtime: None,
            spinner: 0,
            scroll: 0,
        }
    }

    pub fn name(&self) -> &str {
        &self.session.session_name
    }

    pub fn refresh_interval(&self) -> Duration {
        self.refresh
    }

    /// Poll the tail if its interval elapsed; returns whether a poll happened
    pub fn tick(&mut self, now: Instant) -> bool {
        self.spinner = (self.spinner + 1) % SPINNER.len();
        if now < self.next_poll {
            return false;
        }
        self.poll(now);
        true
    }

    /// Poll on the next tick regardless of backoff
    pub fn request_refresh(&mut self) {
        self.refresh = self.base_refresh;
        self.next_poll = Instant::now();
    }

    fn poll(&mut self, now: Instant) {
        self.lines = self.tail.poll();

        let latest = self.tail.last_event_at();
        if latest.is_some() && latest != self.seen_event {
            self.refresh = self.base_refresh;
        } else {
            self.refresh = (self.refresh + self.base_refresh).min(self.base_refresh * 2);
        }
        self.seen_event = latest;
        self.next_poll = now + self.refresh;
    }

    pub fn set_runtime(&mut self, status: SessionRuntimeStatus) {
        self.runtime = Some(status);
    }

    pub fn status(&self, now: Instant) -> HeadlessStatus {
        let running = self.runtime.is_some_and(|s| s.running);
        let waiting = self.tail.is_waiting_input(running, self.waiting_threshold, now);
        HeadlessStatus::from_runtime(self.runtime.as_ref(), waiting)
    }

    pub fn exit_code(&self) -> Option<i32> {
        self.runtime
            .and_then(|s| s.exit_code)
            .or(self.session.exit_code)
    }

    pub fn status_line(&self, now: Instant) -> String {
        let status = self.status(now);
        let mut parts = Vec::new();

        let label = match status {
            HeadlessStatus::Completed => match self.exit_code() {
                Some(code) => format!("{} completed (exit {})", status.icon(), code),
                None => format!("{} completed", status.icon()),
            },
            HeadlessStatus::Running => {
                format!("{} running {}", status.icon(), SPINNER[self.spinner])
            }
            HeadlessStatus::Unknown => status.label().to_string(),
            _ => format!("{} {}", status.icon(), status.label()),
        };
        parts.push(label);

        if matches!(status, HeadlessStatus::Running | HeadlessStatus::WaitingInput) {
            parts.push(format!("idle {}s", self.tail.idle_for(now).as_secs()));
        }
        parts.push(format!(
            "elapsed {}",
            format_duration(now.saturating_duration_since(self.tail.started_at()))
        ));
        if let Some(file) = self.session.output_path.file_name() {
            parts.push(file.to_string_lossy().into_owned());
        }
        parts.push(format!(
            "refresh {}s",
            self.refresh_interval().as_secs_f32().round() as u64
        ));

        parts.join(" │ ")
    }

    /// Output lines for the current toggle
    pub fn output_lines(&self) -> Vec<String> {
        if self.show_raw {
            self.tail.raw_lines()
        } else if self.lines.is_empty() {
            self.tail.lines()
        } else {
            self.lines.clone()
        }
    }

    pub fn prompt_lines(&self) -> Vec<String> {
        if self.show_prompt {
            self.session.instruction.lines().map(str::to_string).collect()
        } else {
            summarize_prompt(&self.session.instruction, 3)
                .into_iter()
                .map(|line| format!("• {}", line))
                .collect()
        }
    }

    pub fn render(&self, frame: &mut Frame, area: Rect, theme: &Theme) {
        let prompt = self.prompt_lines();
        let prompt_height = (prompt.len() as u16 + 2).min(area.height / 2).max(3);
        let chunks = Layout::default()
            .direction(Direction::Vertical)
            .constraints([
                Constraint::Length(3),
                Constraint::Length(prompt_height),
                Constraint::Min(0),
            ])
            .split(area);

        let now = Instant::now();
        let status_color = match self.status(now) {
            HeadlessStatus::Running => theme.warning,
            HeadlessStatus::WaitingInput => theme.accent,
            HeadlessStatus::Completed if self.exit_code().unwrap_or(0) == 0 => theme.success,
            HeadlessStatus::Completed | HeadlessStatus::Missing => theme.error,
            HeadlessStatus::Unknown => theme.dim,
        };
        let mut title = format!(" {} ({}", self.session.session_name, self.session.agent);
        if let Some(model) = &self.session.model {
            title.push_str(&format!(" · {}", model));
        }
        title.push_str(") ");

        let status = Paragraph::new(Line::from(Span::styled(
            self.status_line(now),
            Style::default().fg(status_color),
        )))
        .block(
            Block::default()
                .title(Span::styled(
                    title,
                    Style::default().fg(theme.accent).add_modifier(Modifier::BOLD),
                ))
                .borders(Borders::ALL)
                .border_style(Style::default().fg(theme.dim)),
        );
        frame.render_widget(status, chunks[0]);

        let prompt_title = if self.show_prompt { " Prompt " } else { " Prompt (summary) " };
        let prompt = Paragraph::new(
            prompt
                .into_iter()
                .map(|l| Line::from(Span::styled(l, Style::default().fg(theme.fg))))
                .collect::<Vec<_>>(),
        )
        .wrap(Wrap { trim: false })
        .block(
            Block::default()
                .title(prompt_title)
                .borders(Borders::ALL)
                .border_style(Style::default().fg(theme.dim)),
        );
        frame.render_widget(prompt, chunks[1]);

        let output_area = chunks[2];
        let lines = self.output_lines();
        let visible = output_area.height.saturating_sub(2) as usize;
        let end = lines.len().saturating_sub(self.scroll as usize);
        let start = end.saturating_sub(visible);
        let styled: Vec<Line> = lines[start..end]
            .iter()
            .map(|line| Line::from(Span::styled(line.clone(), self.line_style(line, theme))))
            .collect();

        let output_title = if self.show_raw { " Output (raw) " } else { " Output " };
        let output = Paragraph::new(styled).block(
            Block::default()
                .title(output_title)
                .borders(Borders::ALL)
                .border_style(Style::default().fg(theme.dim)),
        );
        frame.render_widget(output, output_area);
    }

    fn line_style(&self, line: &str, theme: &Theme) -> Style {
        if self.show_raw {
            return Style::default().fg(theme.fg);
        }
        match line_label(line).as_deref() {
            Some("raw") => Style::default().fg(theme.dim),
            Some("error") | Some("warning") => Style::default().fg(theme.error),
            Some("reasoning") | Some("thinking") => Style::default().fg(theme.dim),
            Some("tool") | Some("command") => Style::default().fg(theme.warning),
            Some("turn.completed") | Some("done") => Style::default().fg(theme.success),
            _ => Style::default().fg(theme.fg),
        }
    }
}

/// `1h02m03s`, `4m05s` or `6s`
pub fn format_duration(duration: Duration) -> String {
    let total = duration.as_secs();
    let (hours, minutes, seconds) = (total / 3600, (total % 3600) / 60, total % 60);
    if hours > 0 {
        format!("{}h{:02}m{:02}s", hours, minutes, seconds)
    } else if minutes > 0 {
        format!("{}m{:02}s", minutes, seconds)
    } else {
        format!("{}s", seconds)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use tempfile::TempDir;

    fn view(dir: &TempDir, base: Duration) -> HeadlessView {
        let session = HeadlessSession::new(
            "headless-codex-demo-1",
            "codex",
            "Fix the parser. Add tests. Ship it.",
            dir.path(),
            dir.path().join("out.jsonl"),
        );
        HeadlessView::new(session, 50, base, Duration::from_secs(20), Instant::now())
    }

    #[test]
    fn test_format_duration() {
        assert_eq!(format_duration(Duration::from_secs(6)), "6s");
        assert_eq!(format_duration(Duration::from_secs(245)), "4m05s");
        assert_eq!(format_duration(Duration::from_secs(3723)), "1h02m03s");
    }

    #[test]
    fn test_backoff_widens_and_resets() {
        let dir = TempDir::new().unwrap();
        let base = Duration::from_secs(5);
        let mut view = view(&dir, base);
        let start = Instant::now();

        assert!(view.tick(start));
        assert_eq!(view.refresh_interval(), base * 2);
        assert!(!view.tick(start + Duration::from_secs(1)));

        fs::write(dir.path().join("out.jsonl"), "hello\n").unwrap();
        assert!(view.tick(start + Duration::from_secs(10)));
        assert_eq!(view.refresh_interval(), base);
        assert_eq!(view.output_lines(), vec!["raw: hello"]);

        assert!(view.tick(start + Duration::from_secs(15)));
        assert_eq!(view.refresh_interval(), base * 2);
        assert!(view.tick(start + Duration::from_secs(25)));
        assert_eq!(view.refresh_interval(), base * 2);
    }

    #[test]
    fn test_status_line_for_completed_run() {
        let dir = TempDir::new().unwrap();
        let mut view = view(&dir, Duration::from_secs(5));
        view.set_runtime(SessionRuntimeStatus { exists: true, running: false, exit_code: Some(2) });

        let line = view.status_line(Instant::now());
        assert!(line.starts_with("✅ completed (exit 2)"));
        assert!(line.contains("out.jsonl"));
        assert!(!line.contains("idle"));
    }

    #[test]
    fn test_status_waiting_after_threshold() {
        let dir = TempDir::new().unwrap();
        let mut view = view(&dir, Duration::from_secs(5));
        view.set_runtime(SessionRuntimeStatus { exists: true, running: true, exit_code: None });

        let later = Instant::now() + Duration::from_secs(30);
        assert_eq!(view.status(later), HeadlessStatus::WaitingInput);
        assert!(view.status_line(later).contains("waiting_input"));
        assert_eq!(view.status(Instant::now()), HeadlessStatus::Running);
    }

    #[test]
    fn test_prompt_toggle() {
        let dir = TempDir::new().unwrap();
        let mut view = view(&dir, Duration::from_secs(5));
        assert_eq!(view.prompt_lines(), vec!["• Fix the parser.", "• Add tests.", "• Ship it."]);

        view.show_prompt = true;
        assert_eq!(view.prompt_lines(), vec!["Fix the parser. Add tests. Ship it."]);
    }

    #[test]
    fn test_raw_toggle() {
        let dir = TempDir::new().unwrap();
        let mut view = view(&dir, Duration::from_secs(5));
        fs::write(dir.path().join("out.jsonl"), "{\"type\": \"output\", \"content\": \"x\"}\n").unwrap();
        view.tick(Instant::now());

        assert_eq!(view.output_lines(), vec!["💬 output: x"]);
        view.show_raw = true;
        assert_eq!(view.output_lines(), vec![r#"{"type": "output", "content": "x"}"#]);
    }
}
