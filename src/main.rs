use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use crossterm::event::{self, Event, KeyEventKind};
use std::path::PathBuf;
use std::process::Stdio;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::mpsc;
use tracing::{error, info, warn};

mod actions;
mod app;
mod config;
mod dashboard;
mod headless;
mod headless_view;
mod lock;
mod logging;
mod tmux;

use actions::Action;
use app::{App, StatusLevel};
use config::Config;
use dashboard::Dashboard;
use headless_view::HeadlessView;
use lock::{handle_conflict, ConflictAction, ConflictOutcome, InstanceLock};
use tmux::{SessionBackend, TmuxClient};

/// Redraw cadence for spinners and the headless tail
const TICK: Duration = Duration::from_millis(250);

#[derive(Parser)]
#[command(name = "tmux-dashboard", version, about)]
struct Cli {
    /// Config file (defaults to $TMUX_DASHBOARD_CONFIG or ~/.config/tmux-dashboard/config.json)
    #[arg(long, value_name = "PATH")]
    config: Option<PathBuf>,

    /// What to do when another dashboard is already running
    #[arg(long, value_enum)]
    conflict_action: Option<ConflictAction>,

    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Subcommand)]
enum Command {
    /// Print the instance lock state as JSON and exit
    LockStatus,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let mut config = Config::load(cli.config.as_deref());
    if let Some(action) = cli.conflict_action {
        config.conflict_action = action;
    }

    if !logging::init(&config.log_path) {
        eprintln!(
            "tmux-dashboard: cannot open log file {}, logging disabled",
            config.log_path.display()
        );
    }

    let lock = InstanceLock::new(config.lock_file.clone(), config.pid_file.clone());

    if let Some(Command::LockStatus) = cli.command {
        println!("{}", serde_json::to_string_pretty(&lock.get_lock_info())?);
        return Ok(());
    }

    loop {
        if lock
            .acquire(config.lock_timeout)
            .context("failed to acquire the instance lock")?
        {
            break;
        }
        match handle_conflict(&lock, config.conflict_action, &TmuxClient::new()).await {
            ConflictOutcome::Retry => continue,
            ConflictOutcome::Exit => return Ok(()),
        }
    }

    info!(
        pid = std::process::id(),
        config = %config.config_path.display(),
        event = "startup",
        "dashboard starting"
    );
    let result = run(config).await;
    lock.release();

    if let Err(ref e) = result {
        error!(error = %e, "dashboard exited with an error");
    } else {
        info!(event = "shutdown", "dashboard stopped");
    }
    result
}

async fn run(config: Config) -> Result<()> {
    let mut dashboard = Dashboard::new(TmuxClient::new(), config.clone());
    dashboard.ensure_dirs()?;

    let mut app = App::new(&config);

    // Create event channel
    let (tx, mut rx) = mpsc::unbounded_channel::<Action>();

    // Set while a child process owns the terminal
    let paused = Arc::new(AtomicBool::new(false));

    // Spawn input handler
    let input_paused = paused.clone();
    tokio::task::spawn_blocking(move || {
        while !tx.is_closed() {
            if input_paused.load(Ordering::SeqCst) {
                std::thread::sleep(Duration::from_millis(50));
                continue;
            }
            if !event::poll(Duration::from_millis(100)).unwrap_or(false) {
                continue;
            }
            if input_paused.load(Ordering::SeqCst) {
                continue;
            }
            if let Ok(Event::Key(key)) = event::read() {
                if key.kind == KeyEventKind::Press {
                    let _ = tx.send(Action::KeyPress(key));
                }
            }
        }
    });

    // Initialize terminal
    let mut terminal = ratatui::init();

    let mut refresh = tokio::time::interval(config.refresh_interval);
    let mut tick = tokio::time::interval(TICK);

    // Main event loop
    let result: Result<()> = loop {
        // Render
        if let Err(e) = terminal.draw(|f| app.render(f)) {
            break Err(e.into());
        }

        // Process any pending actions from the app
        for pending in app.take_pending_actions() {
            match pending {
                Action::Refresh => refresh_sessions(&mut dashboard, &mut app).await,
                Action::AttachSession(ref name) => {
                    terminal = attach(&mut dashboard, &mut app, name, &paused).await;
                }
                Action::OpenHeadless(ref name) => open_headless(&dashboard, &mut app, name, &config),
                ref action => match dashboard.execute(action).await {
                    Ok(outcome) => {
                        app.set_status(outcome.message, StatusLevel::Info);
                        refresh_sessions(&mut dashboard, &mut app).await;
                        if let Some(name) = outcome.open_headless {
                            open_headless(&dashboard, &mut app, &name, &config);
                        }
                        if let Some(name) = outcome.attach {
                            terminal = attach(&mut dashboard, &mut app, &name, &paused).await;
                        }
                    }
                    Err(e) => {
                        warn!(action = ?action, error = %e, "action failed");
                        app.set_status(format!("{:#}", e), StatusLevel::Error);
                    }
                },
            }
        }

        if let Some(session) = app.take_preview_request() {
            let lines = dashboard.preview(&session).await;
            app.set_preview(lines);
        }

        // Handle events from channel
        tokio::select! {
            Some(action) = rx.recv() => {
                match app.handle_action(action) {
                    Ok(true) => break Ok(()),
                    Ok(false) => {}
                    Err(e) => break Err(e),
                }
            }
            _ = refresh.tick() => refresh_sessions(&mut dashboard, &mut app).await,
            _ = tick.tick() => app.tick(Instant::now()),
        }
    };

    // Restore terminal
    ratatui::restore();
    result
}

async fn refresh_sessions<B: SessionBackend>(dashboard: &mut Dashboard<B>, app: &mut App) {
    let report = dashboard.refresh().await;
    if let Some(e) = report.error {
        app.set_status(format!("tmux: {}", e), StatusLevel::Error);
    }
    for name in &report.finished {
        app.set_status(format!("Headless session '{}' finished", name), StatusLevel::Info);
    }
    if !report.cleaned.is_empty() {
        app.set_status(
            format!("Cleaned up {}", report.cleaned.join(", ")),
            StatusLevel::Info,
        );
    }
    app.apply_runtime(&report.statuses);
    app.set_sessions(report.sessions);
}

fn open_headless<B: SessionBackend>(
    dashboard: &Dashboard<B>,
    app: &mut App,
    name: &str,
    config: &Config,
) {
    match dashboard.headless_session(name) {
        Some(session) => {
            info!(session = %name, event = "headless_open", "opening headless view");
            app.open_headless(HeadlessView::new(
                session,
                config.headless.max_events,
                config.headless.refresh,
                config.headless.waiting_threshold,
                Instant::now(),
            ));
        }
        None => app.set_status(
            format!("No headless metadata for '{}'", name),
            StatusLevel::Error,
        ),
    }
}

/// Hand the terminal to `tmux attach` and take it back when the user detaches
async fn attach<B: SessionBackend>(
    dashboard: &mut Dashboard<B>,
    app: &mut App,
    name: &str,
    paused: &AtomicBool,
) -> ratatui::DefaultTerminal {
    info!(session = %name, event = "attach", "attaching session");
    paused.store(true, Ordering::SeqCst);
    // Suspend TUI and attach to session
    ratatui::restore();

    let cmd = dashboard.backend().attach_command(name);
    let status = match cmd.split_first() {
        Some((program, args)) => std::process::Command::new(program)
            .args(args)
            .stdin(Stdio::inherit())
            .stdout(Stdio::inherit())
            .stderr(Stdio::inherit())
            .status(),
        None => Err(std::io::Error::new(
            std::io::ErrorKind::InvalidInput,
            "empty attach command",
        )),
    };

    // Resume TUI
    let terminal = ratatui::init();
    paused.store(false, Ordering::SeqCst);

    match status {
        Ok(exit) if exit.success() => {}
        Ok(exit) => {
            warn!(session = %name, status = %exit, "attach exited with failure");
            app.set_status(format!("Attach to '{}' failed ({})", name, exit), StatusLevel::Error);
        }
        Err(e) => {
            error!(session = %name, error = %e, "attach failed");
            app.set_status(format!("Failed to attach: {}", e), StatusLevel::Error);
        }
    }
    refresh_sessions(dashboard, app).await;
    terminal
}
