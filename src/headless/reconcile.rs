//! Keeps headless metadata in line with what the session backend reports.

use chrono::Utc;
use std::collections::{HashMap, HashSet};
use std::fs::{self, File};
use std::io::{Read, Seek, SeekFrom};
use std::path::Path;
use std::process::Stdio;
use std::time::{Duration, SystemTime};
use tokio::process::Command;
use tracing::{debug, info, warn};

use super::{summarize_prompt, HeadlessRegistry, HeadlessSession, HeadlessUpdate};
use crate::tmux::{HeadlessStatus, SessionBackend, SessionInfo, SessionRuntimeStatus};

pub type StatusMap = HashMap<String, SessionRuntimeStatus>;
pub type HeadlessMap = HashMap<String, HeadlessSession>;

/// Trailing bytes scanned for the last output line
const LAST_LINE_WINDOW: u64 = 4096;

/// Prompt bullets included in a completion notification
const NOTIFY_PROMPT_BULLETS: usize = 3;

/// Query the backend once per tracked name
pub async fn collect_status<B, I>(backend: &B, names: I) -> StatusMap
where
    B: SessionBackend,
    I: IntoIterator,
    I::Item: AsRef<str>,
{
    let mut statuses = StatusMap::new();
    for name in names {
        let name = name.as_ref();
        let status = backend.runtime_status(name).await;
        statuses.insert(name.to_string(), status);
    }
    statuses
}

/// Completion stamps that could not be written yet, keyed by session name
pub type UnsavedMap = HashMap<String, HeadlessUpdate>;

/// Stamp completion on sessions that stopped running since the last sync.
///
/// A session with `completed_at` already set is never touched again. A stamp
/// that fails to persist is kept in `unsaved`, applied to the in-memory record
/// on every later sync and written again, but reported only once. When
/// `notify_command` is given, a notification is sent for each newly finished
/// session. Returns the names finalized by this call.
pub fn sync_completion(
    registry: &HeadlessRegistry,
    headless: &mut HeadlessMap,
    unsaved: &mut UnsavedMap,
    statuses: &StatusMap,
    notify_command: Option<&str>,
) -> Vec<String> {
    let mut finished = Vec::new();
    unsaved.retain(|name, _| headless.contains_key(name));

    for (name, session) in headless.iter_mut() {
        if session.completed_at.is_some() {
            unsaved.remove(name);
            continue;
        }

        if let Some(changes) = unsaved.get(name).cloned() {
            match registry.update(name, &changes, Some(&*session)) {
                Some(merged) => {
                    *session = merged;
                    unsaved.remove(name);
                }
                None => apply_update(session, &changes),
            }
            continue;
        }

        let Some(status) = statuses.get(name) else {
            continue;
        };
        if status.running {
            continue;
        }

        let changes = HeadlessUpdate {
            completed_at: Some(Utc::now()),
            exit_code: status.exit_code,
            last_raw_line: read_last_raw_line(&session.output_path),
        };

        match registry.update(name, &changes, Some(&*session)) {
            Some(merged) => *session = merged,
            None => {
                warn!(session = %name, "failed to persist headless completion");
                apply_update(session, &changes);
                unsaved.insert(name.clone(), changes);
            }
        }

        info!(
            session = %name,
            event = "headless_completed",
            exit_code = ?session.exit_code,
            "headless session finished"
        );
        if let Some(command) = notify_command {
            notify(command, &completion_message(session));
        }
        finished.push(name.clone());
    }

    finished.sort();
    finished
}

fn apply_update(session: &mut HeadlessSession, changes: &HeadlessUpdate) {
    session.completed_at = changes.completed_at;
    session.exit_code = changes.exit_code;
    session.last_raw_line = changes.last_raw_line.clone();
}

/// Remove every headless session that is no longer running.
///
/// A backend session that still exists is killed first; if the kill fails the
/// record is kept so the user can retry. Returns the names removed.
pub async fn auto_cleanup<B: SessionBackend>(
    backend: &B,
    registry: &HeadlessRegistry,
    headless: &mut HeadlessMap,
    statuses: &StatusMap,
) -> Vec<String> {
    let mut names: Vec<String> = headless.keys().cloned().collect();
    names.sort();

    let mut removed = Vec::new();
    for name in names {
        let status = match statuses.get(&name) {
            Some(status) => *status,
            None => backend.runtime_status(&name).await,
        };
        if status.running {
            continue;
        }

        if status.exists {
            if let Err(e) = backend.kill_session(&name).await {
                warn!(session = %name, error = %e, "failed to kill finished headless session");
                continue;
            }
        }

        registry.forget(&name);
        headless.remove(&name);
        info!(session = %name, event = "headless_cleanup", "removed finished headless session");
        removed.push(name);
    }
    removed
}

/// Overlay headless fields onto the listing and add entries for records the backend lost
pub fn apply_metadata(
    mut sessions: Vec<SessionInfo>,
    headless: &HeadlessMap,
    statuses: &StatusMap,
    waiting_input: &HashSet<String>,
) -> Vec<SessionInfo> {
    let mut seen = HashSet::new();

    for session in sessions.iter_mut() {
        let Some(meta) = headless.get(&session.name) else {
            continue;
        };
        seen.insert(session.name.clone());

        let status = statuses.get(&session.name);
        session.is_headless = true;
        session.is_ai_session = true;
        session.ai_agent = session.ai_agent.take().or_else(|| Some(meta.agent.clone()));
        session.headless_agent = Some(meta.agent.clone());
        session.headless_model = meta.model.clone();
        session.headless_status = Some(HeadlessStatus::from_runtime(
            status,
            waiting_input.contains(&session.name),
        ));
        session.headless_exit_code = status.and_then(|s| s.exit_code).or(meta.exit_code);
    }

    let mut missing: Vec<&HeadlessSession> = headless
        .values()
        .filter(|meta| !seen.contains(&meta.session_name))
        .collect();
    missing.sort_by(|a, b| a.session_name.cmp(&b.session_name));

    for meta in missing {
        let status = match statuses.get(&meta.session_name) {
            Some(status) if status.exists => {
                HeadlessStatus::from_runtime(Some(status), waiting_input.contains(&meta.session_name))
            }
            _ => HeadlessStatus::Missing,
        };
        sessions.push(SessionInfo {
            name: meta.session_name.clone(),
            attached: false,
            windows: 0,
            is_ai_session: true,
            ai_agent: Some(meta.agent.clone()),
            is_headless: true,
            headless_agent: Some(meta.agent.clone()),
            headless_model: meta.model.clone(),
            headless_status: Some(status),
            headless_exit_code: meta.exit_code,
        });
    }

    sessions
}

/// Running sessions whose output file has not changed for `threshold`.
///
/// This is the list-level approximation; an open headless view uses its
/// tail's event clock instead.
pub fn waiting_sessions(
    headless: &HeadlessMap,
    statuses: &StatusMap,
    threshold: Duration,
    now: SystemTime,
) -> HashSet<String> {
    if threshold.is_zero() {
        return HashSet::new();
    }
    headless
        .values()
        .filter(|meta| statuses.get(&meta.session_name).is_some_and(|s| s.running))
        .filter(|meta| {
            let modified = fs::metadata(&meta.output_path).and_then(|m| m.modified());
            let since = modified.unwrap_or_else(|_| meta.created_at.into());
            now.duration_since(since).unwrap_or_default() >= threshold
        })
        .map(|meta| meta.session_name.clone())
        .collect()
}

/// Last non-blank line of the file, looking only at its trailing window
pub fn read_last_raw_line(path: &Path) -> Option<String> {
    let mut file = File::open(path).ok()?;
    let len = file.metadata().ok()?.len();
    file.seek(SeekFrom::Start(len.saturating_sub(LAST_LINE_WINDOW)))
        .ok()?;
    let mut tail = Vec::new();
    file.read_to_end(&mut tail).ok()?;

    String::from_utf8_lossy(&tail)
        .lines()
        .rev()
        .map(str::trim)
        .find(|line| !line.is_empty())
        .map(str::to_string)
}

fn completion_message(session: &HeadlessSession) -> String {
    let exit = session
        .exit_code
        .map(|code| code.to_string())
        .unwrap_or_else(|| "?".to_string());
    let prompt: Vec<String> = summarize_prompt(&session.instruction, NOTIFY_PROMPT_BULLETS)
        .into_iter()
        .map(|line| format!("- {}", line))
        .collect();
    let last: String = session
        .last_raw_line
        .as_deref()
        .unwrap_or("(no output)")
        .chars()
        .take(200)
        .collect();

    [
        format!("Headless done: {}", session.session_name),
        format!("Agent: {}", session.agent),
        format!("Model: {}", session.model.as_deref().unwrap_or("default")),
        format!("Flow: {}", session.flow.as_deref().unwrap_or("-")),
        format!("Path: {}", session.workdir.display()),
        format!("Exit: {}", exit),
        format!("Output: {}", session.output_path.display()),
        format!("Prompt:\n{}", prompt.join("\n")),
        format!("Last raw:\n{}", last),
    ]
    .join("\n")
}

/// Fire-and-forget `<command> <message>`
fn notify(command: &str, message: &str) {
    let spawned = Command::new(command)
        .arg(message)
        .stdin(Stdio::null())
        .stdout(Stdio::null())
        .stderr(Stdio::null())
        .spawn();
    match spawned {
        Ok(_) => debug!(command = %command, "sent completion notification"),
        Err(e) => warn!(command = %command, error = %e, "completion notification failed"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tmux::TmuxError;
    use std::fs;
    use std::sync::Mutex;
    use tempfile::TempDir;

    #[derive(Default)]
    struct FakeBackend {
        statuses: StatusMap,
        kills: Mutex<Vec<String>>,
        fail_kills: bool,
    }

    impl SessionBackend for FakeBackend {
        async fn list_sessions(&self) -> Result<Vec<SessionInfo>, TmuxError> {
            Ok(Vec::new())
        }

        async fn create_session(&self, _name: &str, _workdir: &Path) -> Result<(), TmuxError> {
            Ok(())
        }

        async fn create_session_with_command(
            &self,
            _name: &str,
            _argv: &[String],
            _workdir: &Path,
        ) -> Result<(), TmuxError> {
            Ok(())
        }

        async fn kill_session(&self, name: &str) -> Result<(), TmuxError> {
            if self.fail_kills {
                return Err(TmuxError::Command {
                    command: "kill-session".to_string(),
                    stderr: "denied".to_string(),
                });
            }
            self.kills.lock().unwrap().push(name.to_string());
            Ok(())
        }

        async fn rename_session(&self, _old: &str, _new: &str) -> Result<(), TmuxError> {
            Ok(())
        }

        async fn capture_pane_text(&self, _name: &str) -> Result<Vec<String>, TmuxError> {
            Ok(Vec::new())
        }

        async fn send_keys(&self, _name: &str, _text: &str) -> Result<(), TmuxError> {
            Ok(())
        }

        async fn runtime_status(&self, name: &str) -> SessionRuntimeStatus {
            self.statuses.get(name).copied().unwrap_or_default()
        }

        fn attach_command(&self, name: &str) -> Vec<String> {
            vec!["attach".to_string(), name.to_string()]
        }
    }

    fn running() -> SessionRuntimeStatus {
        SessionRuntimeStatus { exists: true, running: true, exit_code: None }
    }

    fn exited(code: i32) -> SessionRuntimeStatus {
        SessionRuntimeStatus { exists: true, running: false, exit_code: Some(code) }
    }

    fn setup(dir: &TempDir, names: &[&str]) -> (HeadlessRegistry, HeadlessMap) {
        let registry = HeadlessRegistry::new(dir.path().join("meta"), dir.path().join("out"));
        let mut map = HeadlessMap::new();
        for name in names {
            let session = HeadlessSession::new(
                *name,
                "codex",
                "do things",
                dir.path(),
                registry.output_path(name),
            );
            registry.record(&session).unwrap();
            map.insert(name.to_string(), session);
        }
        (registry, map)
    }

    #[tokio::test]
    async fn test_collect_status_queries_each_name() {
        let backend = FakeBackend {
            statuses: [("a".to_string(), running())].into_iter().collect(),
            ..Default::default()
        };
        let statuses = collect_status(&backend, ["a", "b"]).await;

        assert_eq!(statuses.len(), 2);
        assert!(statuses["a"].running);
        assert!(!statuses["b"].exists);
    }

    #[tokio::test]
    async fn test_auto_cleanup_scenario() {
        let dir = TempDir::new().unwrap();
        let (registry, mut map) = setup(&dir, &["s1", "s2", "s3"]);
        let statuses: StatusMap = [
            ("s1".to_string(), running()),
            ("s2".to_string(), exited(0)),
            ("s3".to_string(), SessionRuntimeStatus::missing()),
        ]
        .into_iter()
        .collect();
        let backend = FakeBackend::default();

        let removed = auto_cleanup(&backend, &registry, &mut map, &statuses).await;

        assert_eq!(removed, vec!["s2", "s3"]);
        assert_eq!(*backend.kills.lock().unwrap(), vec!["s2".to_string()]);
        assert!(registry.get("s1").is_some());
        assert!(registry.get("s2").is_none());
        assert!(registry.get("s3").is_none());
        assert!(map.contains_key("s1"));
        assert_eq!(map.len(), 1);
    }

    #[tokio::test]
    async fn test_auto_cleanup_keeps_record_when_kill_fails() {
        let dir = TempDir::new().unwrap();
        let (registry, mut map) = setup(&dir, &["stuck"]);
        let statuses: StatusMap = [("stuck".to_string(), exited(1))].into_iter().collect();
        let backend = FakeBackend {
            fail_kills: true,
            ..Default::default()
        };

        let removed = auto_cleanup(&backend, &registry, &mut map, &statuses).await;

        assert!(removed.is_empty());
        assert!(registry.get("stuck").is_some());
    }

    #[tokio::test]
    async fn test_auto_cleanup_queries_backend_for_unknown_status() {
        let dir = TempDir::new().unwrap();
        let (registry, mut map) = setup(&dir, &["live"]);
        let backend = FakeBackend {
            statuses: [("live".to_string(), running())].into_iter().collect(),
            ..Default::default()
        };

        let removed = auto_cleanup(&backend, &registry, &mut map, &StatusMap::new()).await;

        assert!(removed.is_empty());
        assert!(map.contains_key("live"));
    }

    #[test]
    fn test_sync_completion_is_idempotent() {
        let dir = TempDir::new().unwrap();
        let (registry, mut map) = setup(&dir, &["job"]);
        fs::write(registry.output_path("job"), "first\n\n  last line  \n\n").unwrap();
        let statuses: StatusMap = [("job".to_string(), exited(3))].into_iter().collect();

        let mut unsaved = UnsavedMap::new();

        let finished = sync_completion(&registry, &mut map, &mut unsaved, &statuses, None);
        assert_eq!(finished, vec!["job"]);
        assert!(unsaved.is_empty());

        let stored = registry.get("job").unwrap();
        let stamp = stored.completed_at.unwrap();
        assert_eq!(stored.exit_code, Some(3));
        assert_eq!(stored.last_raw_line.as_deref(), Some("last line"));
        assert_eq!(map["job"].completed_at, Some(stamp));

        let before = fs::read_to_string(registry.metadata_path("job")).unwrap();
        assert!(sync_completion(&registry, &mut map, &mut unsaved, &statuses, None).is_empty());
        assert_eq!(fs::read_to_string(registry.metadata_path("job")).unwrap(), before);
    }

    #[test]
    fn test_sync_completion_skips_running_and_unknown() {
        let dir = TempDir::new().unwrap();
        let (registry, mut map) = setup(&dir, &["busy", "unseen"]);
        let statuses: StatusMap = [("busy".to_string(), running())].into_iter().collect();

        let mut unsaved = UnsavedMap::new();

        assert!(sync_completion(&registry, &mut map, &mut unsaved, &statuses, None).is_empty());
        assert!(registry.get("busy").unwrap().completed_at.is_none());
        assert!(registry.get("unseen").unwrap().completed_at.is_none());
    }

    #[test]
    fn test_sync_completion_reports_once_when_write_fails() {
        let dir = TempDir::new().unwrap();
        let (registry, _) = setup(&dir, &["job"]);
        let blocker = registry.metadata_path("job").with_extension("json.tmp");
        fs::create_dir_all(&blocker).unwrap();
        let statuses: StatusMap = [("job".to_string(), exited(1))].into_iter().collect();
        let mut unsaved = UnsavedMap::new();

        let reload = || -> HeadlessMap {
            registry
                .load_all()
                .into_iter()
                .map(|session| (session.session_name.clone(), session))
                .collect()
        };

        let mut map = reload();
        let finished = sync_completion(&registry, &mut map, &mut unsaved, &statuses, None);
        assert_eq!(finished, vec!["job"]);
        assert!(registry.get("job").unwrap().completed_at.is_none());
        let stamp = map["job"].completed_at.unwrap();

        for _ in 0..3 {
            let mut map = reload();
            assert!(sync_completion(&registry, &mut map, &mut unsaved, &statuses, None).is_empty());
            assert_eq!(map["job"].completed_at, Some(stamp));
            assert_eq!(map["job"].exit_code, Some(1));
        }

        fs::remove_dir(&blocker).unwrap();
        let mut map = reload();
        assert!(sync_completion(&registry, &mut map, &mut unsaved, &statuses, None).is_empty());
        assert!(unsaved.is_empty());
        assert_eq!(registry.get("job").unwrap().completed_at, Some(stamp));
    }

    #[test]
    fn test_apply_metadata_overlays_and_synthesizes() {
        let dir = TempDir::new().unwrap();
        let (_registry, mut map) = setup(&dir, &["headless-live", "headless-gone"]);
        map.get_mut("headless-gone").unwrap().exit_code = Some(2);
        let statuses: StatusMap = [
            ("headless-live".to_string(), running()),
            ("headless-gone".to_string(), SessionRuntimeStatus::missing()),
        ]
        .into_iter()
        .collect();
        let sessions = vec![
            SessionInfo::new("work", true, 2),
            SessionInfo::new("headless-live", false, 1),
        ];
        let waiting: HashSet<String> = ["headless-live".to_string()].into_iter().collect();

        let merged = apply_metadata(sessions, &map, &statuses, &waiting);

        assert_eq!(merged.len(), 3);
        assert!(!merged[0].is_headless);

        let live = &merged[1];
        assert!(live.is_headless);
        assert_eq!(live.headless_agent.as_deref(), Some("codex"));
        assert_eq!(live.headless_status, Some(HeadlessStatus::WaitingInput));

        let gone: Vec<_> = merged.iter().filter(|s| s.name == "headless-gone").collect();
        assert_eq!(gone.len(), 1);
        assert!(!gone[0].attached);
        assert_eq!(gone[0].windows, 0);
        assert!(gone[0].is_headless);
        assert_eq!(gone[0].headless_status, Some(HeadlessStatus::Missing));
        assert_eq!(gone[0].headless_exit_code, Some(2));
    }

    #[test]
    fn test_apply_metadata_without_status_is_missing() {
        let dir = TempDir::new().unwrap();
        let (_registry, map) = setup(&dir, &["orphan"]);

        let merged = apply_metadata(Vec::new(), &map, &StatusMap::new(), &HashSet::new());

        assert_eq!(merged.len(), 1);
        assert_eq!(merged[0].headless_status, Some(HeadlessStatus::Missing));
    }

    #[test]
    fn test_waiting_sessions_uses_output_age() {
        let dir = TempDir::new().unwrap();
        let (registry, map) = setup(&dir, &["quiet", "done"]);
        fs::write(registry.output_path("quiet"), "hi\n").unwrap();
        let statuses: StatusMap = [
            ("quiet".to_string(), running()),
            ("done".to_string(), exited(0)),
        ]
        .into_iter()
        .collect();
        let threshold = Duration::from_secs(20);

        let later = SystemTime::now() + Duration::from_secs(60);
        let waiting = waiting_sessions(&map, &statuses, threshold, later);
        assert_eq!(waiting, ["quiet".to_string()].into_iter().collect());

        assert!(waiting_sessions(&map, &statuses, threshold, SystemTime::now()).is_empty());
        assert!(waiting_sessions(&map, &statuses, Duration::ZERO, later).is_empty());
    }

    #[test]
    fn test_read_last_raw_line_bounded_window() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("big.log");
        let mut text = "x".repeat(10_000);
        text.push_str("\nfinal answer\n   \n");
        fs::write(&path, text).unwrap();

        assert_eq!(read_last_raw_line(&path).as_deref(), Some("final answer"));

        fs::write(&path, "").unwrap();
        assert_eq!(read_last_raw_line(&path), None);
        assert_eq!(read_last_raw_line(&dir.path().join("absent")), None);
    }

    #[test]
    fn test_completion_message() {
        let dir = TempDir::new().unwrap();
        let mut session = HeadlessSession::new(
            "h1",
            "claude",
            "Fix the parser. Add tests. Update the docs.",
            dir.path(),
            dir.path().join("o.jsonl"),
        );
        let message = completion_message(&session);
        assert!(message.starts_with("Headless done: h1\nAgent: claude\nModel: default\n"));
        assert!(message.contains("Exit: ?"));
        assert!(message.contains(&format!("Path: {}", dir.path().display())));
        assert!(message.contains(&format!("Output: {}", dir.path().join("o.jsonl").display())));
        assert!(message.contains("Prompt:\n- Fix the parser.\n- Add tests.\n- Update the docs."));
        assert!(message.ends_with("Last raw:\n(no output)"));

        session.model = Some("gpt-5".to_string());
        session.exit_code = Some(0);
        session.last_raw_line = Some("ok".to_string());
        let message = completion_message(&session);
        assert!(message.contains("Model: gpt-5"));
        assert!(message.contains("Exit: 0"));
        assert!(message.ends_with("Last raw:\nok"));
    }
}
