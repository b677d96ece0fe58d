//! What to do when another dashboard already holds the instance lock.

use clap::ValueEnum;
use nix::sys::signal::{kill, Signal};
use nix::unistd::Pid;
use serde::{Deserialize, Serialize};
use std::process::Stdio;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::process::Command;
use tokio::time::{sleep, timeout, Instant};
use tracing::{error, info, warn};

use super::{InstanceLock, LockInfo};
use crate::tmux::{SessionBackend, TmuxClient};

const TAKEOVER_GRACE: Duration = Duration::from_secs(3);
const TAKEOVER_POLL: Duration = Duration::from_millis(100);
const PS_TIMEOUT: Duration = Duration::from_secs(1);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize, ValueEnum)]
#[serde(rename_all = "snake_case")]
pub enum ConflictAction {
    /// Attach to the most recently active tmux session
    #[default]
    Attach,
    /// Quit quietly
    Exit,
    /// Terminate the running dashboard and take its place
    Takeover,
    /// Ask on the terminal
    Prompt,
}

impl ConflictAction {
    /// Unknown values resolve to `Attach`
    pub fn parse(value: &str) -> Self {
        match value.trim().to_lowercase().as_str() {
            "exit" => ConflictAction::Exit,
            "takeover" => ConflictAction::Takeover,
            "prompt" => ConflictAction::Prompt,
            _ => ConflictAction::Attach,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConflictOutcome {
    /// The holder is gone; try to acquire again
    Retry,
    /// Nothing left to do in this process
    Exit,
}

pub async fn handle_conflict(
    lock: &InstanceLock,
    action: ConflictAction,
    client: &TmuxClient,
) -> ConflictOutcome {
    let info = lock.get_lock_info();
    info!(holder = ?info.holder_pid, action = ?action, "another dashboard holds the lock");

    let mut action = action;
    if action == ConflictAction::Prompt {
        action = prompt_action(&info).await;
    }

    if action == ConflictAction::Takeover {
        if terminate_holder(lock, &info).await {
            return ConflictOutcome::Retry;
        }
        action = ConflictAction::Attach;
    }

    if action == ConflictAction::Exit {
        info!("dashboard locked, exiting");
        return ConflictOutcome::Exit;
    }

    attach_most_recent(client).await;
    ConflictOutcome::Exit
}

async fn attach_most_recent(client: &TmuxClient) {
    let session = match client.most_recent_session().await {
        Ok(Some(session)) => session,
        Ok(None) => {
            info!("another dashboard running, no sessions to attach");
            return;
        }
        Err(e) => {
            error!(error = %e, "failed to find a session to attach");
            return;
        }
    };

    info!(session = %session.name, event = "auto_attach", "attaching instead of starting a second dashboard");
    let argv = client.attach_command(&session.name);
    let Some((program, args)) = argv.split_first() else {
        return;
    };
    if let Err(e) = Command::new(program).args(args).status().await {
        error!(session = %session.name, error = %e, "attach failed");
    }
}

/// SIGTERM the holder if it really is a dashboard, then wait for the lock to free up
async fn terminate_holder(lock: &InstanceLock, info: &LockInfo) -> bool {
    let Some(pid) = info.holder_pid.filter(|pid| *pid != std::process::id()) else {
        if !lock.is_locked() {
            lock.remove_stale_files();
            return true;
        }
        warn!(event = "lock_takeover", "no valid pid to terminate");
        return false;
    };

    match ps_field(pid, "args").await {
        Some(args) if looks_like_dashboard(&args) => {}
        _ => {
            warn!(event = "lock_takeover", pid, "process does not look like tmux-dashboard");
            return false;
        }
    }

    let Ok(raw) = i32::try_from(pid) else {
        return false;
    };
    if let Err(e) = kill(Pid::from_raw(raw), Signal::SIGTERM) {
        error!(event = "lock_takeover", pid, error = %e, "failed to signal lock holder");
        return false;
    }

    let deadline = Instant::now() + TAKEOVER_GRACE;
    while Instant::now() < deadline {
        if !lock.is_locked() {
            info!(event = "lock_takeover", pid, "previous dashboard terminated");
            return true;
        }
        sleep(TAKEOVER_POLL).await;
    }
    warn!(event = "lock_takeover", pid, "lock still held after termination attempt");
    false
}

fn looks_like_dashboard(args: &str) -> bool {
    args.contains("tmux-dashboard") || args.contains("tmux_dashboard")
}

/// One `ps -o <field>=` column for `pid`
async fn ps_field(pid: u32, field: &str) -> Option<String> {
    let mut ps = Command::new("ps");
    ps.args(["-p", &pid.to_string(), "-o", &format!("{}=", field)])
        .stdin(Stdio::null())
        .kill_on_drop(true);
    let output = timeout(PS_TIMEOUT, ps.output()).await.ok()?.ok()?;
    if !output.status.success() {
        return None;
    }
    let value = String::from_utf8_lossy(&output.stdout).trim().to_string();
    if value.is_empty() {
        None
    } else {
        Some(value)
    }
}

async fn prompt_action(info: &LockInfo) -> ConflictAction {
    let pid = info
        .holder_pid
        .map(|pid| pid.to_string())
        .unwrap_or_else(|| "unknown".to_string());
    let tty = match info.holder_pid {
        Some(pid) => ps_field(pid, "tty").await,
        None => None,
    };

    let mut stderr = tokio::io::stderr();
    let banner = format!(
        "tmux-dashboard: another instance is running.\nPID: {}  TTY: {}\nChoose: [a] attach  [k] take over  [q] exit\n",
        pid,
        tty.as_deref().unwrap_or("unknown")
    );
    let _ = stderr.write_all(banner.as_bytes()).await;

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    loop {
        let _ = stderr.write_all(b"> ").await;
        let _ = stderr.flush().await;
        match lines.next_line().await {
            Ok(Some(line)) => {
                if let Some(action) = parse_choice(&line) {
                    return action;
                }
            }
            // Closed stdin means nobody is there to answer
            _ => return ConflictAction::Attach,
        }
    }
}

fn parse_choice(input: &str) -> Option<ConflictAction> {
    match input.trim().to_lowercase().as_str() {
        "" | "a" | "attach" => Some(ConflictAction::Attach),
        "k" | "kill" | "takeover" => Some(ConflictAction::Takeover),
        "q" | "quit" | "exit" => Some(ConflictAction::Exit),
        _ => None,
    }
}
