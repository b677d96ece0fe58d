use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::{Map, Value};
use std::fs::{self, OpenOptions};
use std::io;
use std::path::{Path, PathBuf};
use thiserror::Error;
use tracing::{debug, warn};

use super::HeadlessSession;

#[derive(Debug, Error)]
pub enum RegistryError {
    #[error("{path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("failed to encode metadata: {0}")]
    Serialize(#[from] serde_json::Error),
}

/// Fields the reconciler may change after a session was recorded
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct HeadlessUpdate {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub exit_code: Option<i32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_raw_line: Option<String>,
}

/// One JSON document per headless session under `state_dir`
#[derive(Debug, Clone)]
pub struct HeadlessRegistry {
    state_dir: PathBuf,
    output_dir: PathBuf,
}

impl HeadlessRegistry {
    pub fn new(state_dir: impl Into<PathBuf>, output_dir: impl Into<PathBuf>) -> Self {
        Self {
            state_dir: state_dir.into(),
            output_dir: output_dir.into(),
        }
    }

    pub fn metadata_path(&self, session_name: &str) -> PathBuf {
        self.state_dir.join(format!("{}.json", safe_filename(session_name)))
    }

    /// Where a new session's agent output should be written
    pub fn output_path(&self, session_name: &str) -> PathBuf {
        self.output_dir.join(format!("{}.jsonl", safe_filename(session_name)))
    }

    /// Create both directories; failing here means the dashboard cannot run
    pub fn ensure_dirs(&self) -> Result<(), RegistryError> {
        for dir in [&self.state_dir, &self.output_dir] {
            fs::create_dir_all(dir).map_err(|source| RegistryError::Io {
                path: dir.clone(),
                source,
            })?;
        }
        Ok(())
    }

    /// Write the full document and make sure the output file exists
    pub fn record(&self, session: &HeadlessSession) -> Result<(), RegistryError> {
        self.ensure_dirs()?;
        if let Some(parent) = session.output_path.parent() {
            fs::create_dir_all(parent).map_err(|source| RegistryError::Io {
                path: parent.to_path_buf(),
                source,
            })?;
        }

        let value = serde_json::to_value(session)?;
        self.write_document(&session.session_name, &value)?;

        OpenOptions::new()
            .create(true)
            .append(true)
            .open(&session.output_path)
            .map_err(|source| RegistryError::Io {
                path: session.output_path.clone(),
                source,
            })?;
        Ok(())
    }

    /// Read-merge-write `changes` into the stored document.
    ///
    /// An unreadable document is only replaced when `base` is given; without
    /// it the file is left untouched and `None` is returned.
    pub fn update(
        &self,
        session_name: &str,
        changes: &HeadlessUpdate,
        base: Option<&HeadlessSession>,
    ) -> Option<HeadlessSession> {
        let path = self.metadata_path(session_name);
        let current = fs::read_to_string(&path)
            .ok()
            .and_then(|text| serde_json::from_str::<Value>(&text).ok())
            .and_then(|value| match value {
                Value::Object(map) => Some(map),
                _ => None,
            });

        let mut document: Map<String, Value> = match (current, base) {
            (Some(map), _) => map,
            (None, Some(base)) => {
                warn!(session = %session_name, "metadata unreadable, rebuilding from memory");
                match serde_json::to_value(base) {
                    Ok(Value::Object(map)) => map,
                    _ => return None,
                }
            }
            (None, None) => {
                warn!(session = %session_name, "metadata unreadable, update refused");
                return None;
            }
        };

        if let Ok(Value::Object(patch)) = serde_json::to_value(changes) {
            document.extend(patch);
        }

        let value = Value::Object(document);
        let merged = HeadlessSession::from_value(&value)?;
        if let Err(e) = self.write_document(session_name, &value) {
            warn!(session = %session_name, error = %e, "failed to write metadata");
            return None;
        }
        Some(merged)
    }

    pub fn get(&self, session_name: &str) -> Option<HeadlessSession> {
        read_session(&self.metadata_path(session_name))
    }

    /// Every readable record, keyed by session name; corrupt files are skipped
    pub fn load_all(&self) -> Vec<HeadlessSession> {
        let entries = match fs::read_dir(&self.state_dir) {
            Ok(entries) => entries,
            Err(_) => return Vec::new(),
        };

        let mut sessions: Vec<HeadlessSession> = entries
            .flatten()
            .map(|entry| entry.path())
            .filter(|path| path.extension().is_some_and(|ext| ext == "json"))
            .filter_map(|path| {
                let session = read_session(&path);
                if session.is_none() {
                    debug!(path = %path.display(), "skipping unreadable headless metadata");
                }
                session
            })
            .collect();
        sessions.sort_by(|a, b| a.session_name.cmp(&b.session_name));
        sessions
    }

    /// Delete the record; a missing file is not an error
    pub fn forget(&self, session_name: &str) {
        let path = self.metadata_path(session_name);
        match fs::remove_file(&path) {
            Ok(()) => {}
            Err(e) if e.kind() == io::ErrorKind::NotFound => {}
            Err(e) => warn!(session = %session_name, error = %e, "failed to remove metadata"),
        }
    }

    /// Whole-document write through a temp file so readers never see half a document
    fn write_document(&self, session_name: &str, value: &Value) -> Result<(), RegistryError> {
        let path = self.metadata_path(session_name);
        let tmp = path.with_extension("json.tmp");
        let text = serde_json::to_string_pretty(value)?;
        let io_err = |source| RegistryError::Io {
            path: path.clone(),
            source,
        };
        fs::create_dir_all(&self.state_dir).map_err(io_err)?;
        fs::write(&tmp, text).map_err(io_err)?;
        fs::rename(&tmp, &path).map_err(io_err)?;
        Ok(())
    }
}

fn read_session(path: &Path) -> Option<HeadlessSession> {
    let text = fs::read_to_string(path).ok()?;
    let value: Value = serde_json::from_str(&text).ok()?;
    HeadlessSession::from_value(&value)
}

fn safe_filename(name: &str) -> String {
    name.chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || matches!(c, '_' | '.' | '-') {
                c
            } else {
                '_'
            }
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn registry(dir: &TempDir) -> HeadlessRegistry {
        HeadlessRegistry::new(dir.path().join("meta"), dir.path().join("out"))
    }

    fn session(dir: &TempDir, name: &str) -> HeadlessSession {
        HeadlessSession::new(
            name,
            "codex",
            "write tests",
            dir.path(),
            dir.path().join("out").join(format!("{}.jsonl", name)),
        )
        .with_model(Some("gpt-5-codex".to_string()))
    }

    #[test]
    fn test_record_creates_dirs_and_output_file() {
        let dir = TempDir::new().unwrap();
        let registry = registry(&dir);
        let session = session(&dir, "headless-a");

        registry.record(&session).unwrap();

        assert!(session.output_path.exists());
        assert_eq!(registry.get("headless-a"), Some(session));
    }

    #[test]
    fn test_load_all_skips_corrupt_and_incomplete_records() {
        let dir = TempDir::new().unwrap();
        let registry = registry(&dir);
        registry.record(&session(&dir, "good")).unwrap();
        fs::write(registry.metadata_path("corrupt"), "{not json").unwrap();
        fs::write(
            registry.metadata_path("partial"),
            r#"{"session_name": "partial", "agent": "codex"}"#,
        )
        .unwrap();

        let all = registry.load_all();
        assert_eq!(all.len(), 1);
        assert_eq!(all[0].session_name, "good");
    }

    #[test]
    fn test_load_all_without_state_dir_is_empty() {
        let dir = TempDir::new().unwrap();
        assert!(registry(&dir).load_all().is_empty());
    }

    #[test]
    fn test_update_merges_into_existing_document() {
        let dir = TempDir::new().unwrap();
        let registry = registry(&dir);
        let original = session(&dir, "merge");
        registry.record(&original).unwrap();

        let changes = HeadlessUpdate {
            exit_code: Some(3),
            last_raw_line: Some("done".to_string()),
            ..Default::default()
        };
        let merged = registry.update("merge", &changes, None).unwrap();

        assert_eq!(merged.exit_code, Some(3));
        assert_eq!(merged.last_raw_line.as_deref(), Some("done"));
        assert_eq!(merged.model, original.model);
        assert_eq!(registry.get("merge"), Some(merged));
    }

    #[test]
    fn test_update_keeps_unknown_fields() {
        let dir = TempDir::new().unwrap();
        let registry = registry(&dir);
        let mut value = serde_json::to_value(session(&dir, "extra")).unwrap();
        value["custom"] = serde_json::json!("keep me");
        fs::create_dir_all(dir.path().join("meta")).unwrap();
        fs::write(registry.metadata_path("extra"), value.to_string()).unwrap();

        let changes = HeadlessUpdate {
            exit_code: Some(0),
            ..Default::default()
        };
        registry.update("extra", &changes, None).unwrap();

        let stored: Value =
            serde_json::from_str(&fs::read_to_string(registry.metadata_path("extra")).unwrap())
                .unwrap();
        assert_eq!(stored["custom"], "keep me");
        assert_eq!(stored["exit_code"], 0);
    }

    #[test]
    fn test_update_refuses_corrupt_without_base() {
        let dir = TempDir::new().unwrap();
        let registry = registry(&dir);
        let path = registry.metadata_path("bad-session");
        fs::create_dir_all(path.parent().unwrap()).unwrap();
        fs::write(&path, "{not json").unwrap();

        let changes = HeadlessUpdate {
            exit_code: Some(2),
            ..Default::default()
        };
        assert!(registry.update("bad-session", &changes, None).is_none());
        assert_eq!(fs::read_to_string(&path).unwrap(), "{not json");
    }

    #[test]
    fn test_update_uses_base_on_corrupt() {
        let dir = TempDir::new().unwrap();
        let registry = registry(&dir);
        let base = session(&dir, "headless-recover");
        let path = registry.metadata_path(&base.session_name);
        fs::create_dir_all(path.parent().unwrap()).unwrap();
        fs::write(&path, "{not json").unwrap();

        let changes = HeadlessUpdate {
            exit_code: Some(7),
            ..Default::default()
        };
        let merged = registry.update(&base.session_name, &changes, Some(&base)).unwrap();
        assert_eq!(merged.exit_code, Some(7));

        let data: Value = serde_json::from_str(&fs::read_to_string(&path).unwrap()).unwrap();
        assert_eq!(data["session_name"], base.session_name.as_str());
        assert_eq!(data["agent"], "codex");
        assert_eq!(data["workdir"], dir.path().to_str().unwrap());
        assert_eq!(data["output_path"], base.output_path.to_str().unwrap());
        assert_eq!(data["exit_code"], 7);
    }

    #[test]
    fn test_forget_is_idempotent() {
        let dir = TempDir::new().unwrap();
        let registry = registry(&dir);
        registry.record(&session(&dir, "gone")).unwrap();

        registry.forget("gone");
        registry.forget("gone");
        assert!(registry.get("gone").is_none());
    }

    #[test]
    fn test_safe_filename() {
        assert_eq!(safe_filename("a/b c:d"), "a_b_c_d");
        assert_eq!(safe_filename("headless-codex_1.2"), "headless-codex_1.2");
    }
}
