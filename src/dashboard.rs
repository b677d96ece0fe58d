//! Session operations behind the UI.
//!
//! [`Dashboard`] owns the backend, the headless registry and the in-memory
//! headless metadata. The event loop hands it [`Action`]s and renders what
//! comes back; it never draws anything itself.

use anyhow::{anyhow, bail, Context, Result};
use chrono::Local;
use std::collections::HashSet;
use std::time::SystemTime;
use tracing::{info, warn};

use crate::actions::{Action, HeadlessRequest};
use crate::config::Config;
use crate::headless::reconcile::{
    apply_metadata, auto_cleanup, collect_status, read_last_raw_line, sync_completion,
    waiting_sessions, HeadlessMap, StatusMap, UnsavedMap,
};
use crate::headless::{
    build_headless_session_name, render_headless_command, summarize_prompt, HeadlessRegistry,
    HeadlessSession,
};
use crate::tmux::{project_name, SessionBackend, SessionInfo};

/// Bullets shown for a headless prompt in the preview pane
const PREVIEW_PROMPT_BULLETS: usize = 3;

/// Result of one refresh cycle
#[derive(Debug, Default)]
pub struct RefreshReport {
    pub sessions: Vec<SessionInfo>,
    /// Set when the backend listing failed; `sessions` then holds only headless records
    pub error: Option<String>,
    pub finished: Vec<String>,
    pub cleaned: Vec<String>,
    pub statuses: StatusMap,
}

/// What an executed action wants the UI to do next
#[derive(Debug, Default, PartialEq, Eq)]
pub struct Outcome {
    pub message: String,
    /// Attach to this session right away
    pub attach: Option<String>,
    /// Open the headless view for this session
    pub open_headless: Option<String>,
}

impl Outcome {
    fn message(text: impl Into<String>) -> Self {
        Self {
            message: text.into(),
            ..Self::default()
        }
    }
}

pub struct Dashboard<B> {
    backend: B,
    registry: HeadlessRegistry,
    config: Config,
    headless: HeadlessMap,
    /// Completion stamps still waiting to reach disk
    unsaved: UnsavedMap,
}

impl<B: SessionBackend> Dashboard<B> {
    pub fn new(backend: B, config: Config) -> Self {
        let registry = HeadlessRegistry::new(
            config.headless.state_dir.clone(),
            config.headless.output_dir.clone(),
        );
        Self {
            backend,
            registry,
            config,
            headless: HeadlessMap::new(),
            unsaved: UnsavedMap::new(),
        }
    }

    pub fn backend(&self) -> &B {
        &self.backend
    }

    /// Create the headless state and output directories
    pub fn ensure_dirs(&self) -> Result<()> {
        self.registry
            .ensure_dirs()
            .context("failed to create headless directories")
    }

    /// Reload metadata, reconcile it with the backend, and list everything to show
    pub async fn refresh(&mut self) -> RefreshReport {
        self.headless = self
            .registry
            .load_all()
            .into_iter()
            .map(|session| (session.session_name.clone(), session))
            .collect();

        let names: Vec<String> = self.headless.keys().cloned().collect();
        let statuses = collect_status(&self.backend, &names).await;
        let finished = sync_completion(
            &self.registry,
            &mut self.headless,
            &mut self.unsaved,
            &statuses,
            self.config.headless.notify_command(),
        );
        let cleaned = if self.config.headless.auto_cleanup {
            auto_cleanup(&self.backend, &self.registry, &mut self.headless, &statuses).await
        } else {
            Vec::new()
        };

        let (listed, error) = match self.backend.list_sessions().await {
            Ok(sessions) => (sessions, None),
            Err(e) => {
                warn!(error = %e, "failed to list sessions");
                (Vec::new(), Some(e.to_string()))
            }
        };

        let waiting = waiting_sessions(
            &self.headless,
            &statuses,
            self.config.headless.waiting_threshold,
            SystemTime::now(),
        );
        let sessions = apply_metadata(listed, &self.headless, &statuses, &waiting);

        RefreshReport {
            sessions,
            error,
            finished,
            cleaned,
            statuses,
        }
    }

    pub fn headless_session(&self, name: &str) -> Option<HeadlessSession> {
        self.headless
            .get(name)
            .cloned()
            .or_else(|| self.registry.get(name))
    }

    /// Lines for the preview pane
    pub async fn preview(&self, session: &SessionInfo) -> Vec<String> {
        if let Some(meta) = self.headless.get(&session.name) {
            return self.headless_preview(session, meta);
        }
        match self.backend.capture_pane_text(&session.name).await {
            Ok(lines) => {
                let keep = self.config.preview_lines;
                let skip = lines.len().saturating_sub(keep);
                lines.into_iter().skip(skip).collect()
            }
            Err(e) => vec![format!("Preview unavailable: {}", e)],
        }
    }

    fn headless_preview(&self, session: &SessionInfo, meta: &HeadlessSession) -> Vec<String> {
        let status = session
            .headless_status
            .map(|s| s.label())
            .unwrap_or("unknown");
        let mut lines = vec![
            format!("Agent:   {}", meta.agent),
            format!("Model:   {}", meta.model.as_deref().unwrap_or("(default)")),
            format!("Status:  {}", status),
            format!("Workdir: {}", meta.workdir.display()),
            String::new(),
            "Prompt:".to_string(),
        ];
        lines.extend(
            summarize_prompt(&meta.instruction, PREVIEW_PROMPT_BULLETS)
                .into_iter()
                .map(|line| format!("  • {}", line)),
        );
        lines.push(String::new());
        let last = meta
            .last_raw_line
            .clone()
            .or_else(|| read_last_raw_line(&meta.output_path))
            .unwrap_or_else(|| "(no output yet)".to_string());
        lines.push(format!("Last:    {}", last));
        lines
    }

    /// Run a session-changing action
    pub async fn execute(&mut self, action: &Action) -> Result<Outcome> {
        match action {
            Action::CreateSession { name, workdir } => {
                self.backend.create_session(name, workdir).await?;
                info!(session = %name, event = "create", "created session");
                Ok(Outcome {
                    message: format!("Session '{}' created", name),
                    attach: Some(name.clone()),
                    open_headless: None,
                })
            }
            Action::DeleteSession(name) => self.delete_session(name).await,
            Action::RenameSession { old, new } => {
                if self.headless.contains_key(old) {
                    bail!("headless sessions cannot be renamed");
                }
                self.backend.rename_session(old, new).await?;
                info!(session = %old, new_name = %new, event = "rename", "renamed session");
                Ok(Outcome::message(format!("Renamed '{}' to '{}'", old, new)))
            }
            Action::LaunchHeadless(request) => self.launch_headless(request).await,
            Action::SendInput { session, text } => {
                self.backend.send_keys(session, text).await?;
                info!(session = %session, event = "send_input", "sent input to headless session");
                Ok(Outcome::message("Input sent"))
            }
            Action::KillHeadless(name) => {
                if self.config.dry_run {
                    return Ok(Outcome::message("Dry-run enabled. Kill blocked."));
                }
                self.backend.kill_session(name).await?;
                info!(session = %name, event = "headless_kill", "killed headless session");
                Ok(Outcome::message(format!("Killed '{}'", name)))
            }
            other => Err(anyhow!("not a session operation: {:?}", other)),
        }
    }

    async fn delete_session(&mut self, name: &str) -> Result<Outcome> {
        if self.config.dry_run {
            return Ok(Outcome::message("Dry-run enabled. Delete blocked."));
        }

        if self.headless.contains_key(name) || self.registry.get(name).is_some() {
            let status = self.backend.runtime_status(name).await;
            if status.exists {
                self.backend
                    .kill_session(name)
                    .await
                    .with_context(|| format!("failed to kill '{}'", name))?;
            }
            self.registry.forget(name);
            self.headless.remove(name);
            info!(session = %name, event = "delete", headless = true, "deleted headless session");
            return Ok(Outcome::message(format!("Deleted '{}'", name)));
        }

        self.backend.kill_session(name).await?;
        info!(session = %name, event = "delete", "deleted session");
        Ok(Outcome::message(format!("Deleted '{}'", name)))
    }

    async fn launch_headless(&mut self, request: &HeadlessRequest) -> Result<Outcome> {
        let workdir = &request.workdir;
        if !workdir.is_dir() {
            bail!("not a directory: {}", workdir.display());
        }
        let template = self
            .config
            .headless
            .template(&request.agent)
            .ok_or_else(|| anyhow!("unknown agent '{}'", request.agent))?
            .to_string();

        let mut existing: HashSet<String> = match self.backend.list_sessions().await {
            Ok(sessions) => sessions.into_iter().map(|s| s.name).collect(),
            Err(_) => HashSet::new(),
        };
        existing.extend(self.registry.load_all().into_iter().map(|s| s.session_name));
        let name = build_headless_session_name(
            &request.agent,
            &project_name(workdir),
            &existing,
            Local::now(),
        );

        let output_path = self.registry.output_path(&name);
        let argv = render_headless_command(
            &template,
            &request.instruction,
            &output_path,
            workdir,
            &request.agent,
            request.model.as_deref(),
        )?;

        let session = HeadlessSession::new(
            name.clone(),
            request.agent.clone(),
            request.instruction.clone(),
            workdir.clone(),
            output_path,
        )
        .with_model(request.model.clone())
        .with_command(argv.get(2).cloned());
        // Record first so the output file exists before the agent starts writing
        self.registry
            .record(&session)
            .context("failed to record headless session")?;

        if let Err(e) = self
            .backend
            .create_session_with_command(&name, &argv, workdir)
            .await
        {
            self.registry.forget(&name);
            return Err(e).context("failed to start headless session");
        }
        self.headless.insert(name.clone(), session);
        info!(
            session = %name,
            agent = %request.agent,
            model = ?request.model,
            event = "headless_launch",
            "launched headless session"
        );

        Ok(Outcome {
            message: format!("Launched '{}'", name),
            attach: None,
            open_headless: Some(name),
        })
    }
}
