//! JSON Lines audit log.
//!
//! The terminal belongs to the dashboard, so events go only to the log file,
//! one JSON object per line.

use std::fs::{self, File, OpenOptions};
use std::io;
use std::path::Path;
use std::sync::Mutex;
use tracing_subscriber::fmt::writer::BoxMakeWriter;
use tracing_subscriber::prelude::*;
use tracing_subscriber::EnvFilter;

/// Install the global subscriber. Returns false when the log file could not
/// be opened and events are discarded instead.
pub fn init(log_path: &Path) -> bool {
    let (writer, opened) = match open_log_file(log_path) {
        Ok(file) => (BoxMakeWriter::new(Mutex::new(file)), true),
        Err(_) => (BoxMakeWriter::new(io::sink), false),
    };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

    let _ = subscriber(writer, filter).try_init();
    opened
}

fn subscriber(
    writer: BoxMakeWriter,
    filter: EnvFilter,
) -> impl tracing::Subscriber + Send + Sync + 'static {
    tracing_subscriber::registry().with(filter).with(
        tracing_subscriber::fmt::layer()
            .json()
            .with_target(true)
            .with_current_span(false)
            .with_ansi(false)
            .with_writer(writer),
    )
}

fn open_log_file(path: &Path) -> io::Result<File> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)?;
    }
    OpenOptions::new().create(true).append(true).open(path)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::Value;
    use tempfile::TempDir;

    #[test]
    fn test_events_are_json_lines() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("nested/log.jsonl");
        let file = open_log_file(&path).unwrap();

        let subscriber = subscriber(BoxMakeWriter::new(Mutex::new(file)), EnvFilter::new("info"));
        tracing::subscriber::with_default(subscriber, || {
            tracing::info!(session = "work", event = "attach", "attaching session");
            tracing::debug!("filtered out");
        });

        let text = fs::read_to_string(&path).unwrap();
        let lines: Vec<&str> = text.lines().collect();
        assert_eq!(lines.len(), 1);

        let record: Value = serde_json::from_str(lines[0]).unwrap();
        assert_eq!(record["level"], "INFO");
        assert_eq!(record["fields"]["message"], "attaching session");
        assert_eq!(record["fields"]["session"], "work");
        assert_eq!(record["fields"]["event"], "attach");
    }

    #[test]
    fn test_open_log_file_appends() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("log.jsonl");
        fs::write(&path, "existing\n").unwrap();

        {
            use std::io::Write;
            let mut file = open_log_file(&path).unwrap();
            writeln!(file, "more").unwrap();
        }
        assert_eq!(fs::read_to_string(&path).unwrap(), "existing\nmore\n");
    }
}
