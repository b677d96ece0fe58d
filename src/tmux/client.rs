use std::path::Path;
use std::process::{Output, Stdio};
use tokio::process::Command;

use super::heuristics::AgentDetector;
use super::{SessionBackend, SessionInfo, SessionRuntimeStatus, TmuxError};

/// Client for interacting with tmux via CLI
pub struct TmuxClient {
    /// Path to tmux binary
    tmux_path: String,
    /// Server socket name (`tmux -L`); the default server when unset
    socket: Option<String>,
}

impl TmuxClient {
    pub fn new() -> Self {
        Self {
            tmux_path: "tmux".to_string(),
            socket: None,
        }
    }

    /// Talk to a private server instead of the user's default one
    #[cfg(test)]
    fn with_socket(socket: impl Into<String>) -> Self {
        Self {
            socket: Some(socket.into()),
            ..Self::new()
        }
    }

    fn base_args(&self) -> Vec<String> {
        match &self.socket {
            Some(socket) => vec!["-L".to_string(), socket.clone()],
            None => Vec::new(),
        }
    }

    async fn run<S: AsRef<std::ffi::OsStr>>(&self, args: &[S]) -> Result<Output, TmuxError> {
        let output = Command::new(&self.tmux_path)
            .args(self.base_args())
            .args(args)
            .stdin(Stdio::null())
            .output()
            .await?;
        Ok(output)
    }

    /// Run a tmux command and fail on non-zero exit
    async fn run_checked<S: AsRef<std::ffi::OsStr>>(
        &self,
        command: &str,
        args: &[S],
    ) -> Result<Output, TmuxError> {
        let output = self.run(args).await?;
        if !output.status.success() {
            return Err(TmuxError::Command {
                command: command.to_string(),
                stderr: String::from_utf8_lossy(&output.stderr).trim().to_string(),
            });
        }
        Ok(output)
    }

    async fn pane_commands(&self, name: &str) -> Vec<String> {
        match self
            .run(&["list-panes", "-s", "-t", &session_target(name), "-F", "#{pane_current_command}"])
            .await
        {
            Ok(output) if output.status.success() => String::from_utf8_lossy(&output.stdout)
                .lines()
                .map(str::trim)
                .filter(|l| !l.is_empty())
                .map(str::to_string)
                .collect(),
            _ => Vec::new(),
        }
    }

    /// The session with the most recent activity or attach time
    pub async fn most_recent_session(&self) -> Result<Option<SessionInfo>, TmuxError> {
        let output = self
            .run(&[
                "list-sessions",
                "-F",
                "#{session_name}|#{session_attached}|#{session_windows}|#{session_activity}|#{session_last_attached}",
            ])
            .await?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            if is_no_server(&stderr) {
                return Ok(None);
            }
            return Err(TmuxError::Command {
                command: "list-sessions".to_string(),
                stderr: stderr.trim().to_string(),
            });
        }

        let stdout = String::from_utf8_lossy(&output.stdout);
        Ok(stdout
            .lines()
            .filter_map(parse_activity_line)
            .max_by_key(|(_, score)| *score)
            .map(|(session, _)| session))
    }

    async fn rename_window(&self, session: &str, window_name: &str) {
        let _ = self
            .run(&["rename-window", "-t", &window_target(session), window_name])
            .await;
    }
}

impl Default for TmuxClient {
    fn default() -> Self {
        Self::new()
    }
}

impl SessionBackend for TmuxClient {
    /// List all tmux sessions
    async fn list_sessions(&self) -> Result<Vec<SessionInfo>, TmuxError> {
        let output = self
            .run(&[
                "list-sessions",
                "-F",
                "#{session_name}|#{session_attached}|#{session_windows}",
            ])
            .await?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            if is_no_server(&stderr) {
                return Ok(Vec::new());
            }
            return Err(TmuxError::Command {
                command: "list-sessions".to_string(),
                stderr: stderr.trim().to_string(),
            });
        }

        let stdout = String::from_utf8_lossy(&output.stdout);
        let mut sessions = Vec::new();

        for line in stdout.lines() {
            if let Some(mut session) = parse_session_line(line) {
                let commands = self.pane_commands(&session.name).await;
                let (is_ai, agent) =
                    AgentDetector::detect(&session.name, commands.iter().map(String::as_str));
                session.is_ai_session = is_ai;
                session.ai_agent = agent;
                sessions.push(session);
            }
        }

        Ok(sessions)
    }

    async fn create_session(&self, name: &str, workdir: &Path) -> Result<(), TmuxError> {
        let dir = workdir.to_string_lossy().to_string();
        self.run_checked("new-session", &["new-session", "-d", "-s", name, "-c", &dir])
            .await?;
        self.rename_window(name, name).await;
        Ok(())
    }

    /// The pane is created with remain-on-exit set before the command starts,
    /// so a fast-exiting agent still leaves its exit status behind.
    async fn create_session_with_command(
        &self,
        name: &str,
        argv: &[String],
        workdir: &Path,
    ) -> Result<(), TmuxError> {
        if argv.is_empty() {
            return Err(TmuxError::Command {
                command: "new-session".to_string(),
                stderr: "command missing".to_string(),
            });
        }
        let dir = workdir.to_string_lossy().to_string();

        self.run_checked("new-session", &["new-session", "-d", "-s", name, "-c", &dir])
            .await?;
        self.run_checked(
            "set-option",
            &["set-option", "-w", "-t", &window_target(name), "remain-on-exit", "on"],
        )
        .await?;

        let mut respawn = vec![
            "respawn-pane".to_string(),
            "-k".to_string(),
            "-t".to_string(),
            window_target(name),
            "-c".to_string(),
            dir,
        ];
        respawn.extend(argv.iter().cloned());
        self.run_checked("respawn-pane", &respawn).await?;

        self.rename_window(name, name).await;
        Ok(())
    }

    /// Kill a session
    async fn kill_session(&self, name: &str) -> Result<(), TmuxError> {
        self.run_checked("kill-session", &["kill-session", "-t", &session_target(name)])
            .await?;
        Ok(())
    }

    async fn rename_session(&self, old: &str, new: &str) -> Result<(), TmuxError> {
        self.run_checked(
            "rename-session",
            &["rename-session", "-t", &session_target(old), new],
        )
        .await?;
        self.rename_window(new, new).await;
        Ok(())
    }

    async fn capture_pane_text(&self, name: &str) -> Result<Vec<String>, TmuxError> {
        let output = self
            .run_checked("capture-pane", &["capture-pane", "-p", "-t", &window_target(name)])
            .await?;
        let stdout = String::from_utf8_lossy(&output.stdout);
        let mut lines: Vec<String> = stdout.lines().map(str::to_string).collect();
        while lines.last().is_some_and(|l| l.trim().is_empty()) {
            lines.pop();
        }
        Ok(lines)
    }

    async fn send_keys(&self, name: &str, text: &str) -> Result<(), TmuxError> {
        let target = window_target(name);
        self.run_checked("send-keys", &["send-keys", "-t", &target, "-l", text])
            .await?;
        self.run_checked("send-keys", &["send-keys", "-t", &target, "Enter"])
            .await?;
        Ok(())
    }

    async fn runtime_status(&self, name: &str) -> SessionRuntimeStatus {
        let output = match self
            .run(&[
                "list-panes",
                "-s",
                "-t",
                &session_target(name),
                "-F",
                "#{pane_dead}::#{pane_exit_status}",
            ])
            .await
        {
            Ok(output) => output,
            Err(_) => return SessionRuntimeStatus::missing(),
        };

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr).to_lowercase();
            if stderr.contains("can't find session") || is_no_server(&stderr) {
                return SessionRuntimeStatus::missing();
            }
            return SessionRuntimeStatus {
                exists: true,
                running: false,
                exit_code: None,
            };
        }

        parse_runtime_status(&String::from_utf8_lossy(&output.stdout))
    }

    /// Get the command to attach to a session (for external execution)
    fn attach_command(&self, name: &str) -> Vec<String> {
        // Inside tmux, attaching would nest; switch the current client instead
        let verb = if std::env::var_os("TMUX").is_some() {
            "switch-client"
        } else {
            "attach-session"
        };
        let mut argv = vec![self.tmux_path.clone()];
        argv.extend(self.base_args());
        argv.extend([verb.to_string(), "-t".to_string(), session_target(name)]);
        argv
    }
}

/// `=name` matches the session exactly; a bare name falls back to prefix matching
fn session_target(name: &str) -> String {
    format!("={}", name)
}

/// Current window (and its active pane) of exactly `name`
fn window_target(name: &str) -> String {
    format!("={}:", name)
}

fn is_no_server(stderr: &str) -> bool {
    let lowered = stderr.to_lowercase();
    lowered.contains("no server running")
        || lowered.contains("no sessions")
        || lowered.contains("error connecting")
}

fn parse_attached(value: &str) -> bool {
    value.trim().parse::<u32>().map(|n| n > 0).unwrap_or(false)
}

/// Parse `name|attached|windows`
fn parse_session_line(line: &str) -> Option<SessionInfo> {
    if line.trim().is_empty() {
        return None;
    }
    // Session names may contain '|', so split from the right
    let mut parts = line.rsplitn(3, '|');
    let windows = parts.next()?;
    let attached = parts.next()?;
    let name = parts.next()?;
    Some(SessionInfo::new(
        name,
        parse_attached(attached),
        windows.trim().parse().unwrap_or(0),
    ))
}

/// Parse `name|attached|windows|activity|last_attached` into a session and its recency score
fn parse_activity_line(line: &str) -> Option<(SessionInfo, u64)> {
    let mut parts = line.rsplitn(3, '|');
    let last_attached: u64 = parts.next()?.trim().parse().unwrap_or(0);
    let activity: u64 = parts.next()?.trim().parse().unwrap_or(0);
    let session = parse_session_line(parts.next()?)?;
    Some((session, activity.max(last_attached)))
}

/// Parse `pane_dead::pane_exit_status` lines for every pane of a session
fn parse_runtime_status(stdout: &str) -> SessionRuntimeStatus {
    let mut running = false;
    let mut exit_code: Option<i32> = None;
    let mut saw_pane = false;

    for line in stdout.lines().map(str::trim).filter(|l| !l.is_empty()) {
        saw_pane = true;
        let (dead, code) = line.split_once("::").unwrap_or((line, ""));
        if dead.trim() == "0" {
            running = true;
        }
        if let Ok(code) = code.trim().parse::<i32>() {
            exit_code = Some(exit_code.map_or(code, |prev| prev.max(code)));
        }
    }

    SessionRuntimeStatus {
        exists: true,
        running: saw_pane && running,
        exit_code,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_session_line() {
        let session = parse_session_line("work|1|3").unwrap();
        assert_eq!(session.name, "work");
        assert!(session.attached);
        assert_eq!(session.windows, 3);

        let session = parse_session_line("a|b|0|2").unwrap();
        assert_eq!(session.name, "a|b");
        assert!(!session.attached);

        assert!(parse_session_line("").is_none());
        assert!(parse_session_line("broken").is_none());
    }

    #[test]
    fn test_parse_activity_line_scores_latest_timestamp() {
        let (session, score) = parse_activity_line("api|0|2|1700000100|1700000500").unwrap();
        assert_eq!(session.name, "api");
        assert_eq!(score, 1700000500);

        let (_, score) = parse_activity_line("web|1|1|1700000900|").unwrap();
        assert_eq!(score, 1700000900);
    }

    #[test]
    fn test_parse_runtime_status_running_pane() {
        let status = parse_runtime_status("1::0\n0::\n");
        assert!(status.exists);
        assert!(status.running);
        assert_eq!(status.exit_code, Some(0));
    }

    #[test]
    fn test_parse_runtime_status_max_exit_code() {
        let status = parse_runtime_status("1::2\n1::7\n");
        assert!(!status.running);
        assert_eq!(status.exit_code, Some(7));
    }

    #[test]
    fn test_parse_runtime_status_no_panes() {
        let status = parse_runtime_status("\n");
        assert!(status.exists);
        assert!(!status.running);
        assert_eq!(status.exit_code, None);
    }

    #[test]
    fn test_targets_are_exact() {
        assert_eq!(session_target("app"), "=app");
        assert_eq!(window_target("app"), "=app:");
    }

    #[test]
    fn test_attach_command_targets_exact_session() {
        let argv = TmuxClient::new().attach_command("app");
        assert_eq!(argv.last().map(String::as_str), Some("=app"));
        assert_eq!(argv[argv.len() - 2], "-t");
    }

    fn tmux_available() -> bool {
        std::process::Command::new("tmux")
            .arg("-V")
            .output()
            .map(|o| o.status.success())
            .unwrap_or(false)
    }

    #[tokio::test]
    async fn test_prefix_name_does_not_match_sibling_session() {
        if !tmux_available() {
            return;
        }
        let dir = tempfile::TempDir::new().unwrap();
        let client = TmuxClient::with_socket(format!("tmux-dashboard-test-{}", std::process::id()));

        client.create_session("work-a-2", dir.path()).await.unwrap();

        let status = client.runtime_status("work-a").await;
        assert!(!status.exists);
        assert!(client.capture_pane_text("work-a").await.is_err());
        assert!(client.send_keys("work-a", "echo hi").await.is_err());
        assert!(client.rename_session("work-a", "renamed").await.is_err());
        assert!(client.kill_session("work-a").await.is_err());

        let names: Vec<String> = client
            .list_sessions()
            .await
            .unwrap()
            .into_iter()
            .map(|s| s.name)
            .collect();
        assert_eq!(names, vec!["work-a-2".to_string()]);
        assert!(client.runtime_status("work-a-2").await.exists);

        let _ = client.run(&["kill-server"]).await;
    }
}
