//! Incremental reader for a headless agent's output file.
//!
//! The file is appended to by a process we do not control, in any mix of
//! JSON Lines, pretty-printed JSON, SSE `event:`/`data:` framing and plain
//! text. Each poll reads only the bytes added since the previous poll, holds
//! back an unterminated last line, and keeps at most `max_events` parsed
//! events.

use serde_json::Value;
use std::collections::VecDeque;
use std::fs::File;
use std::io::{self, Read, Seek, SeekFrom};
use std::path::PathBuf;
use std::time::{Duration, Instant};
use tracing::debug;

use super::classify::EventClassifier;

pub const WAITING_FOR_OUTPUT: &str = "(waiting for output)";
pub const READ_FAILED: &str = "(failed to read output)";

/// Visual separator placed between event groups
pub const EVENT_SEPARATOR: &str = "│";

/// Accumulated multi-line JSON beyond this is flushed as raw text
const MAX_JSON_BUFFER: usize = 20_000;

/// An unterminated line longer than this is flushed as raw text
const MAX_PENDING_LINE: usize = 64 * 1024;

/// Upper bound on bytes consumed by a single poll; the rest waits for the next one
const MAX_READ_PER_POLL: u64 = 4 * 1024 * 1024;

pub struct HeadlessLogTail {
    path: PathBuf,
    max_events: usize,
    offset: u64,
    /// Bytes after the last newline, waiting for the rest of their line
    pending: Vec<u8>,
    /// Lines of a JSON value that has not closed yet
    json_buffer: String,
    events: VecDeque<Vec<String>>,
    raw_events: VecDeque<String>,
    classifier: EventClassifier,
    started_at: Instant,
    last_event_at: Option<Instant>,
}

impl HeadlessLogTail {
    pub fn new(path: impl Into<PathBuf>, max_events: usize) -> Self {
        Self::with_classifier(path, max_events, EventClassifier::default())
    }

    pub fn with_classifier(
        path: impl Into<PathBuf>,
        max_events: usize,
        classifier: EventClassifier,
    ) -> Self {
        Self {
            path: path.into(),
            max_events: max_events.max(1),
            offset: 0,
            pending: Vec::new(),
            json_buffer: String::new(),
            events: VecDeque::new(),
            raw_events: VecDeque::new(),
            classifier,
            started_at: Instant::now(),
            last_event_at: None,
        }
    }

    pub fn started_at(&self) -> Instant {
        self.started_at
    }

    pub fn last_event_at(&self) -> Option<Instant> {
        self.last_event_at
    }

    /// Time since the last event, or since the tail started if none arrived yet
    pub fn idle_for(&self, now: Instant) -> Duration {
        now.saturating_duration_since(self.last_event_at.unwrap_or(self.started_at))
    }

    /// A running agent that has been silent for `threshold` is probably waiting on a prompt.
    /// A zero threshold disables the check.
    pub fn is_waiting_input(&self, running: bool, threshold: Duration, now: Instant) -> bool {
        running && !threshold.is_zero() && self.idle_for(now) >= threshold
    }

    /// Consume whatever was appended since the last call and return the display lines
    pub fn poll(&mut self) -> Vec<String> {
        let size = match std::fs::metadata(&self.path) {
            Ok(meta) => meta.len(),
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                return vec![WAITING_FOR_OUTPUT.to_string()];
            }
            Err(e) => {
                debug!(path = %self.path.display(), error = %e, "failed to stat headless output");
                return vec![READ_FAILED.to_string()];
            }
        };

        if size < self.offset {
            debug!(path = %self.path.display(), "headless output truncated, restarting tail");
            self.reset();
        }

        let chunk = match self.read_new() {
            Ok(chunk) => chunk,
            Err(e) => {
                debug!(path = %self.path.display(), error = %e, "failed to read headless output");
                return vec![READ_FAILED.to_string()];
            }
        };
        if chunk.is_empty() {
            return self.lines();
        }

        self.pending.extend_from_slice(&chunk);
        if let Some(last_newline) = self.pending.iter().rposition(|b| *b == b'\n') {
            let rest = self.pending.split_off(last_newline + 1);
            let complete = std::mem::replace(&mut self.pending, rest);

            for raw_line in complete[..complete.len() - 1].split(|b| *b == b'\n') {
                let line = String::from_utf8_lossy(raw_line);
                if let Some(normalized) = normalize_stream_line(&line) {
                    self.ingest_line(normalized);
                }
            }
        }

        if self.pending.len() > MAX_PENDING_LINE {
            debug!(
                path = %self.path.display(),
                bytes = self.pending.len(),
                "flushing oversized partial line"
            );
            let overflow = std::mem::take(&mut self.pending);
            self.push_raw(String::from_utf8_lossy(&overflow).trim());
        }

        self.lines()
    }

    /// Parsed events, flattened with separators between groups
    pub fn lines(&self) -> Vec<String> {
        if self.events.is_empty() {
            return vec![WAITING_FOR_OUTPUT.to_string()];
        }
        let mut lines = Vec::new();
        for group in &self.events {
            if !lines.is_empty() {
                lines.push(EVENT_SEPARATOR.to_string());
            }
            lines.extend(group.iter().cloned());
        }
        lines
    }

    /// The source text behind each event, for the raw output toggle
    pub fn raw_lines(&self) -> Vec<String> {
        if self.raw_events.is_empty() {
            return vec![WAITING_FOR_OUTPUT.to_string()];
        }
        self.raw_events
            .iter()
            .flat_map(|raw| raw.lines().map(str::to_string))
            .collect()
    }

    fn reset(&mut self) {
        self.offset = 0;
        self.pending.clear();
        self.json_buffer.clear();
        self.events.clear();
        self.raw_events.clear();
        self.started_at = Instant::now();
        self.last_event_at = None;
    }

    fn read_new(&mut self) -> io::Result<Vec<u8>> {
        let mut file = File::open(&self.path)?;
        file.seek(SeekFrom::Start(self.offset))?;
        let mut chunk = Vec::new();
        file.take(MAX_READ_PER_POLL).read_to_end(&mut chunk)?;
        self.offset += chunk.len() as u64;
        Ok(chunk)
    }

    fn ingest_line(&mut self, line: &str) {
        if matches!(line, "[DONE]" | "DONE") {
            let payload = serde_json::json!({"type": "done", "message": "completed"});
            self.push_event(self.classifier.summarize(&payload), line.to_string());
            return;
        }

        if !self.json_buffer.is_empty() {
            let mut candidate = std::mem::take(&mut self.json_buffer);
            candidate.push('\n');
            candidate.push_str(line);
            self.drain_json(&candidate);
            return;
        }

        if looks_like_json(line) {
            self.drain_json(line);
            return;
        }

        self.push_raw(line);
    }

    /// Decode as many complete JSON values as `data` holds.
    ///
    /// An unfinished value is kept for the next line; text that cannot be the
    /// start of a JSON value is recorded as raw.
    fn drain_json(&mut self, data: &str) {
        let mut rest = data.trim_start();
        while !rest.is_empty() {
            let mut stream = serde_json::Deserializer::from_str(rest).into_iter::<Value>();
            match stream.next() {
                Some(Ok(value)) => {
                    let consumed = stream.byte_offset();
                    let summary = self.classifier.summarize(&value);
                    self.push_event(summary, rest[..consumed].trim().to_string());
                    rest = rest[consumed..].trim_start();
                }
                Some(Err(e)) if e.is_eof() => {
                    self.json_buffer = rest.to_string();
                    if self.json_buffer.len() > MAX_JSON_BUFFER {
                        let overflow = std::mem::take(&mut self.json_buffer);
                        self.push_raw(&overflow);
                    }
                    return;
                }
                Some(Err(_)) => {
                    self.push_raw(rest);
                    return;
                }
                None => return,
            }
        }
    }

    fn push_raw(&mut self, text: &str) {
        self.push_event(vec![format!("raw: {}", text)], text.to_string());
    }

    fn push_event(&mut self, lines: Vec<String>, raw: String) {
        if self.events.len() >= self.max_events {
            self.events.pop_front();
        }
        if self.raw_events.len() >= self.max_events {
            self.raw_events.pop_front();
        }
        self.events.push_back(lines);
        self.raw_events.push_back(raw);
        self.last_event_at = Some(Instant::now());
    }
}

/// Strip SSE framing; `None` means the line carries no payload
fn normalize_stream_line(line: &str) -> Option<&str> {
    let stripped = line.trim();
    if stripped.is_empty() || stripped.starts_with("event:") {
        return None;
    }
    if let Some(data) = stripped.strip_prefix("data:") {
        let data = data.trim();
        return if data.is_empty() { None } else { Some(data) };
    }
    Some(stripped)
}

fn looks_like_json(line: &str) -> bool {
    line.trim_start().starts_with(['{', '['])
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs::{self, OpenOptions};
    use std::io::Write;
    use std::path::Path;
    use tempfile::TempDir;

    fn append(path: &Path, text: &str) {
        let mut file = OpenOptions::new().create(true).append(true).open(path).unwrap();
        file.write_all(text.as_bytes()).unwrap();
    }

    fn event_lines(lines: &[String]) -> Vec<&String> {
        lines.iter().filter(|l| l.as_str() != EVENT_SEPARATOR).collect()
    }

    #[test]
    fn test_missing_file_waits() {
        let dir = TempDir::new().unwrap();
        let mut tail = HeadlessLogTail::new(dir.path().join("nope.jsonl"), 5);
        assert_eq!(tail.poll(), vec![WAITING_FOR_OUTPUT]);
    }

    #[test]
    fn test_value_split_across_polls_yields_one_event() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("out.jsonl");
        let mut tail = HeadlessLogTail::new(&path, 5);

        append(&path, r#"{"type": "output", "content": "hel"#);
        assert_eq!(tail.poll(), vec![WAITING_FOR_OUTPUT]);

        append(&path, "lo\"}\n");
        let split = tail.poll();
        assert_eq!(split, vec!["💬 output: hello"]);

        let whole_path = dir.path().join("whole.jsonl");
        fs::write(&whole_path, "{\"type\": \"output\", \"content\": \"hello\"}\n").unwrap();
        let mut whole = HeadlessLogTail::new(&whole_path, 5);
        assert_eq!(whole.poll(), split);
    }

    #[test]
    fn test_partial_second_line_is_held_back() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("out.jsonl");
        let mut tail = HeadlessLogTail::new(&path, 5);

        let two = r#"{"type": "output", "content": "world"}"#;
        append(&path, &format!("{}\n{}", r#"{"type": "output", "content": "hello"}"#, &two[..8]));
        let lines = tail.poll();
        assert!(lines.iter().any(|l| l.contains("output: hello")));
        assert!(!lines.iter().any(|l| l.contains("world")));

        append(&path, &format!("{}\n", &two[8..]));
        let lines = tail.poll();
        assert_eq!(event_lines(&lines).len(), 2);
        assert!(lines.iter().any(|l| l.contains("output: world")));
    }

    #[test]
    fn test_sse_framing() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("out.jsonl");
        append(
            &path,
            "event: message\ndata: {\"type\": \"output\", \"content\": \"hi\"}\n\ndata:\ndata: [DONE]\n",
        );
        let mut tail = HeadlessLogTail::new(&path, 5);

        assert_eq!(
            tail.poll(),
            vec!["💬 output: hi", EVENT_SEPARATOR, "✅ done: completed"]
        );
        assert_eq!(tail.raw_lines(), vec![r#"{"type": "output", "content": "hi"}"#, "[DONE]"]);
    }

    #[test]
    fn test_multiline_json() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("out.jsonl");
        append(&path, "{\n  \"type\": \"output\",\n\n  \"content\": \"pretty\"\n}\n");
        let mut tail = HeadlessLogTail::new(&path, 5);

        assert_eq!(tail.poll(), vec!["💬 output: pretty"]);
        assert_eq!(tail.raw_lines().len(), 4);
    }

    #[test]
    fn test_several_values_on_one_line() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("out.jsonl");
        append(&path, "{\"type\": \"turn.started\"} {\"type\": \"thread.started\"}\n");
        let mut tail = HeadlessLogTail::new(&path, 5);

        assert_eq!(
            tail.poll(),
            vec!["▶️ turn.started", EVENT_SEPARATOR, "🧵 thread.started"]
        );
    }

    #[test]
    fn test_plain_and_bracketed_text_is_raw() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("out.jsonl");
        append(&path, "compiling crate\n[INFO] starting up\n{not json}\n");
        let mut tail = HeadlessLogTail::new(&path, 10);

        let lines = tail.poll();
        assert_eq!(
            event_lines(&lines),
            vec!["raw: compiling crate", "raw: [INFO] starting up", "raw: {not json}"]
        );
    }

    #[test]
    fn test_truncation_resets_state() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("out.jsonl");
        fs::write(&path, "{\"type\": \"output\", \"content\": \"first-longer\"}\n").unwrap();
        let mut tail = HeadlessLogTail::new(&path, 5);
        assert!(tail.poll()[0].contains("first-longer"));

        fs::write(&path, "{\"type\": \"output\", \"content\": \"x\"}\n").unwrap();
        let lines = tail.poll();
        assert_eq!(lines, vec!["💬 output: x"]);
        assert_eq!(tail.raw_lines().len(), 1);
    }

    #[test]
    fn test_unbounded_json_is_flushed_as_raw() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("out.jsonl");
        let mut tail = HeadlessLogTail::new(&path, 5);

        append(&path, "{\"type\": \"output\", \"content\": [\n");
        for _ in 0..2_000 {
            append(&path, "\"0123456789\",\n");
        }
        let lines = tail.poll();

        assert!(tail.json_buffer.len() <= MAX_JSON_BUFFER);
        assert!(lines.iter().any(|l| l.starts_with("raw: {")));
    }

    #[test]
    fn test_oversized_partial_line_is_flushed_as_raw() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("out.jsonl");
        let mut tail = HeadlessLogTail::new(&path, 5);

        append(&path, &"x".repeat(MAX_PENDING_LINE * 3));
        let lines = tail.poll();
        assert!(tail.pending.len() <= MAX_PENDING_LINE);
        assert_eq!(lines.len(), 1);
        assert!(lines[0].starts_with("raw: xxx"));

        append(&path, "\n{\"type\": \"output\", \"content\": \"ok\"}\n");
        let lines = tail.poll();
        assert!(tail.pending.is_empty());
        assert_eq!(lines.last().map(String::as_str), Some("💬 output: ok"));
    }

    #[test]
    fn test_event_ring_is_bounded() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("out.jsonl");
        let text: String = (0..10).map(|i| format!("line {}\n", i)).collect();
        append(&path, &text);
        let mut tail = HeadlessLogTail::new(&path, 3);

        let lines = tail.poll();
        assert_eq!(event_lines(&lines), vec!["raw: line 7", "raw: line 8", "raw: line 9"]);
        assert_eq!(tail.raw_lines(), vec!["line 7", "line 8", "line 9"]);
    }

    #[test]
    fn test_no_new_data_returns_same_lines() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("out.jsonl");
        append(&path, "hello\n");
        let mut tail = HeadlessLogTail::new(&path, 3);

        let first = tail.poll();
        let stamp = tail.last_event_at();
        assert_eq!(tail.poll(), first);
        assert_eq!(tail.last_event_at(), stamp);
    }

    #[test]
    fn test_waiting_input_detection() {
        let dir = TempDir::new().unwrap();
        let mut tail = HeadlessLogTail::new(dir.path().join("out.jsonl"), 5);
        let threshold = Duration::from_secs(20);

        let now = tail.started_at() + Duration::from_secs(25);
        assert!(tail.is_waiting_input(true, threshold, now));
        assert!(!tail.is_waiting_input(false, threshold, now));
        assert!(!tail.is_waiting_input(true, Duration::ZERO, now));

        tail.last_event_at = Some(now);
        assert!(!tail.is_waiting_input(true, threshold, now + Duration::from_secs(5)));
    }
}
