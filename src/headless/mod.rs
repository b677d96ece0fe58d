//! Headless agent sessions: metadata, naming, and command rendering.
//!
//! A headless session is a tmux session whose only job is running a
//! non-interactive agent CLI that writes its output to a file. The metadata
//! lives in [`registry`], the output is followed by [`tail`], and
//! [`reconcile`] keeps both in line with what tmux reports.

pub mod classify;
pub mod reconcile;
pub mod registry;
pub mod tail;

pub use registry::{HeadlessRegistry, HeadlessUpdate};
pub use tail::HeadlessLogTail;

use chrono::{DateTime, Local, Utc};
use once_cell::sync::Lazy;
use regex::Regex;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashSet;
use std::path::{Path, PathBuf};
use thiserror::Error;

/// Metadata describing one headless agent invocation
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HeadlessSession {
    pub session_name: String,
    pub agent: String,
    pub model: Option<String>,
    pub flow: Option<String>,
    pub instruction: String,
    pub workdir: PathBuf,
    pub output_path: PathBuf,
    pub created_at: DateTime<Utc>,
    /// Rendered shell command, kept for diagnostics
    pub command: Option<String>,
    pub completed_at: Option<DateTime<Utc>>,
    pub exit_code: Option<i32>,
    pub last_raw_line: Option<String>,
}

impl HeadlessSession {
    pub fn new(
        session_name: impl Into<String>,
        agent: impl Into<String>,
        instruction: impl Into<String>,
        workdir: impl Into<PathBuf>,
        output_path: impl Into<PathBuf>,
    ) -> Self {
        Self {
            session_name: session_name.into(),
            agent: agent.into(),
            model: None,
            flow: None,
            instruction: instruction.into(),
            workdir: workdir.into(),
            output_path: output_path.into(),
            created_at: Utc::now(),
            command: None,
            completed_at: None,
            exit_code: None,
            last_raw_line: None,
        }
    }

    pub fn with_model(mut self, model: Option<String>) -> Self {
        self.model = model.filter(|m| !m.trim().is_empty());
        self
    }

    pub fn with_command(mut self, command: Option<String>) -> Self {
        self.command = command;
        self
    }

    /// Build a session from a stored JSON document.
    ///
    /// Optional fields of the wrong type read as absent. A document without
    /// `session_name`, `agent`, `workdir` or `output_path` is rejected.
    pub fn from_value(value: &Value) -> Option<Self> {
        let map = value.as_object()?;
        let text = |key: &str| {
            map.get(key)
                .and_then(Value::as_str)
                .map(str::to_string)
                .filter(|s| !s.is_empty())
        };
        let timestamp = |key: &str| {
            map.get(key)
                .and_then(Value::as_str)
                .and_then(|s| DateTime::parse_from_rfc3339(s.trim()).ok())
                .map(|dt| dt.with_timezone(&Utc))
        };

        Some(Self {
            session_name: text("session_name")?,
            agent: text("agent")?,
            model: text("model"),
            flow: text("flow"),
            instruction: text("instruction").unwrap_or_default(),
            workdir: PathBuf::from(text("workdir")?),
            output_path: PathBuf::from(text("output_path")?),
            created_at: timestamp("created_at").unwrap_or_else(Utc::now),
            command: text("command"),
            completed_at: timestamp("completed_at"),
            exit_code: map
                .get("exit_code")
                .and_then(Value::as_i64)
                .and_then(|c| i32::try_from(c).ok()),
            last_raw_line: text("last_raw_line"),
        })
    }
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum CommandError {
    #[error("command template for agent '{0}' needs a model")]
    ModelRequired(String),
    #[error("command template is empty")]
    EmptyTemplate,
}

static RE_PLACEHOLDER: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"\{(instruction|output|cwd|agent|model)\}").unwrap());

/// Render an agent command template into an argv for tmux.
///
/// Every substitution is shell-quoted. The raw values are also exported as
/// `TMUX_DASHBOARD_HEADLESS_*` variables so wrapper scripts can read them.
pub fn render_headless_command(
    template: &str,
    instruction: &str,
    output_path: &Path,
    workdir: &Path,
    agent: &str,
    model: Option<&str>,
) -> Result<Vec<String>, CommandError> {
    if template.trim().is_empty() {
        return Err(CommandError::EmptyTemplate);
    }
    let model = model.filter(|m| !m.trim().is_empty());
    if template.contains("{model}") && model.is_none() {
        return Err(CommandError::ModelRequired(agent.to_string()));
    }

    let output = output_path.to_string_lossy();
    let cwd = workdir.to_string_lossy();
    let model = model.unwrap_or("");

    let rendered = RE_PLACEHOLDER.replace_all(template, |caps: &regex::Captures| {
        let value = match &caps[1] {
            "instruction" => instruction,
            "output" => output.as_ref(),
            "cwd" => cwd.as_ref(),
            "agent" => agent,
            _ => model,
        };
        shell_words::quote(value).into_owned()
    });

    let env = [
        ("TMUX_DASHBOARD_HEADLESS_INSTRUCTION", instruction),
        ("TMUX_DASHBOARD_HEADLESS_OUTPUT", output.as_ref()),
        ("TMUX_DASHBOARD_HEADLESS_CWD", cwd.as_ref()),
        ("TMUX_DASHBOARD_HEADLESS_AGENT", agent),
        ("TMUX_DASHBOARD_HEADLESS_MODEL", model),
    ];
    let exports = env
        .iter()
        .map(|(key, value)| format!("{}={}", key, shell_words::quote(value)))
        .collect::<Vec<_>>()
        .join(" ");

    Ok(vec![
        "/bin/sh".to_string(),
        "-lc".to_string(),
        format!("export {}; {}", exports, rendered.trim()),
    ])
}

/// `headless-<agent>-<project>-<timestamp>`, suffixed with `-N` on collision
pub fn build_headless_session_name(
    agent: &str,
    project: &str,
    existing: &HashSet<String>,
    now: DateTime<Local>,
) -> String {
    let base = format!(
        "headless-{}-{}-{}",
        sanitize_component(agent),
        sanitize_component(project),
        now.format("%Y%m%d-%H%M%S")
    );
    if !existing.contains(&base) {
        return base;
    }
    (2..)
        .map(|n| format!("{}-{}", base, n))
        .find(|candidate| !existing.contains(candidate))
        .unwrap_or(base)
}

/// tmux rewrites `.` and `:` in session names, so neither may survive
static RE_UNSAFE_COMPONENT: Lazy<Regex> = Lazy::new(|| Regex::new(r"[^A-Za-z0-9_-]+").unwrap());

fn sanitize_component(value: &str) -> String {
    let cleaned = RE_UNSAFE_COMPONENT.replace_all(&value.trim().to_lowercase(), "-").into_owned();
    let cleaned = cleaned.trim_matches('-');
    if cleaned.is_empty() {
        "headless".to_string()
    } else {
        cleaned.to_string()
    }
}

static RE_SENTENCE_END: Lazy<Regex> = Lazy::new(|| Regex::new(r"[.!?]\s+").unwrap());

/// Condense an instruction into `bullets` short lines
pub fn summarize_prompt(text: &str, bullets: usize) -> Vec<String> {
    let bullets = bullets.max(1);
    let normalized = text.split_whitespace().collect::<Vec<_>>().join(" ");
    if normalized.is_empty() {
        let mut summary = vec!["(empty)".to_string()];
        summary.resize(bullets, "...".to_string());
        return summary;
    }

    let mut sentences = Vec::new();
    let mut start = 0;
    for m in RE_SENTENCE_END.find_iter(&normalized) {
        sentences.push(normalized[start..m.start() + 1].trim().to_string());
        start = m.end();
    }
    sentences.push(normalized[start..].trim().to_string());
    sentences.retain(|s| !s.is_empty());
    if sentences.len() >= bullets {
        sentences.truncate(bullets);
        return sentences;
    }

    let words: Vec<&str> = normalized.split(' ').collect();
    let total = words.len();
    (0..bullets)
        .map(|idx| {
            let from = (idx * total + bullets / 2) / bullets;
            let to = ((idx + 1) * total + bullets / 2) / bullets;
            let chunk = words[from..to.min(total)].join(" ");
            if chunk.is_empty() {
                "...".to_string()
            } else {
                chunk
            }
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use serde_json::json;

    #[test]
    fn test_from_value_requires_core_fields() {
        let full = json!({
            "session_name": "headless-codex-api-1",
            "agent": "codex",
            "workdir": "/tmp/api",
            "output_path": "/tmp/out.jsonl",
            "created_at": "2026-01-02T03:04:05Z",
            "exit_code": "not a number",
        });
        let session = HeadlessSession::from_value(&full).unwrap();
        assert_eq!(session.agent, "codex");
        assert_eq!(session.exit_code, None);
        assert_eq!(session.instruction, "");
        assert_eq!(session.created_at.to_rfc3339(), "2026-01-02T03:04:05+00:00");

        let mut missing = full.clone();
        missing["workdir"] = json!("");
        assert!(HeadlessSession::from_value(&missing).is_none());

        assert!(HeadlessSession::from_value(&json!(["not", "an", "object"])).is_none());
    }

    #[test]
    fn test_render_command_quotes_substitutions() {
        let argv = render_headless_command(
            "codex exec --json -C {cwd} {instruction} > {output}",
            "fix the bug; rm -rf /",
            Path::new("/tmp/out file.jsonl"),
            Path::new("/work"),
            "codex",
            None,
        )
        .unwrap();

        assert_eq!(argv[0], "/bin/sh");
        assert_eq!(argv[1], "-lc");
        assert!(argv[2].contains("codex exec --json -C /work 'fix the bug; rm -rf /' > '/tmp/out file.jsonl'"));
        assert!(argv[2].starts_with("export TMUX_DASHBOARD_HEADLESS_INSTRUCTION="));
    }

    #[test]
    fn test_render_command_does_not_expand_placeholders_in_values() {
        let argv = render_headless_command(
            "run {instruction} {output}",
            "{output}",
            Path::new("/o"),
            Path::new("/w"),
            "a",
            None,
        )
        .unwrap();
        assert!(argv[2].ends_with("run '{output}' /o"));
    }

    #[test]
    fn test_render_command_requires_model_when_templated() {
        let err = render_headless_command(
            "claude --model {model} -p {instruction}",
            "hi",
            Path::new("/o"),
            Path::new("/w"),
            "claude",
            Some("  "),
        )
        .unwrap_err();
        assert_eq!(err, CommandError::ModelRequired("claude".to_string()));
    }

    #[test]
    fn test_session_name_is_unique_and_sanitized() {
        let now = Local.with_ymd_and_hms(2026, 3, 4, 5, 6, 7).unwrap();
        let mut existing = HashSet::new();

        let name = build_headless_session_name("Codex", "My Project!", &existing, now);
        assert_eq!(name, "headless-codex-my-project-20260304-050607");

        existing.insert(name.clone());
        existing.insert(format!("{}-2", name));
        let next = build_headless_session_name("Codex", "My Project!", &existing, now);
        assert_eq!(next, format!("{}-3", name));

        let fallback = build_headless_session_name("codex", "///", &HashSet::new(), now);
        assert!(fallback.starts_with("headless-codex-headless-"));
    }

    #[test]
    fn test_session_name_drops_dots_and_colons() {
        let now = Local.with_ymd_and_hms(2026, 1, 1, 0, 0, 0).unwrap();
        for project in ["my.app", "next.js", "example.com:8080"] {
            let name = build_headless_session_name("codex", project, &HashSet::new(), now);
            assert!(!name.contains('.') && !name.contains(':'), "{}", name);
        }
        let name = build_headless_session_name("codex", "my.app", &HashSet::new(), now);
        assert_eq!(name, "headless-codex-my-app-20260101-000000");
    }

    #[test]
    fn test_summarize_prompt() {
        assert_eq!(summarize_prompt("", 3), vec!["(empty)", "...", "..."]);
        assert_eq!(
            summarize_prompt("Fix tests. Update docs!  Ship it? Then rest.", 3),
            vec!["Fix tests.", "Update docs!", "Ship it?"]
        );
        assert_eq!(
            summarize_prompt("one two three four five six", 3),
            vec!["one two", "three four", "five six"]
        );
        assert_eq!(summarize_prompt("solo", 3), vec!["...", "solo", "..."]);
    }
}
