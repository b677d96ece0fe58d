//! Dashboard configuration: a JSON file overlaid with `TMUX_DASHBOARD_*` environment variables.

use serde::Deserialize;
use serde_json::Value;
use std::collections::{BTreeMap, HashMap};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::warn;

use crate::lock::ConflictAction;
use crate::tmux::SortMode;

const ENV_PREFIX: &str = "TMUX_DASHBOARD_";

/// Agent templates shipped with the dashboard.
/// The selected model reaches the CLI through the exported environment variable.
const DEFAULT_AGENT_TEMPLATES: &[(&str, &str)] = &[
    (
        "codex",
        "codex exec --json --skip-git-repo-check \
         ${TMUX_DASHBOARD_HEADLESS_MODEL:+-m \"$TMUX_DASHBOARD_HEADLESS_MODEL\"} \
         -C {cwd} {instruction} > {output} 2>&1",
    ),
    (
        "claude",
        "claude -p {instruction} \
         ${TMUX_DASHBOARD_HEADLESS_MODEL:+--model \"$TMUX_DASHBOARD_HEADLESS_MODEL\"} \
         --output-format stream-json --verbose > {output} 2>&1",
    ),
];

/// A model list in the config file may be a single string or an array
#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum ModelList {
    One(String),
    Many(Vec<String>),
}

impl ModelList {
    fn into_vec(self) -> Vec<String> {
        match self {
            ModelList::One(model) => split_list(&model),
            ModelList::Many(models) => models
                .into_iter()
                .map(|m| m.trim().to_string())
                .filter(|m| !m.is_empty())
                .collect(),
        }
    }
}

/// On-disk shape; every field optional so a partial file still loads
#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct FileConfig {
    log_path: Option<String>,
    sort_mode: Option<String>,
    dry_run: Option<bool>,
    preview_lines: Option<Value>,
    refresh_interval_ms: Option<Value>,
    conflict_action: Option<String>,
    lock_file: Option<String>,
    pid_file: Option<String>,
    lock_timeout_secs: Option<f64>,
    headless_state_dir: Option<String>,
    headless_output_dir: Option<String>,
    headless_refresh_seconds: Option<Value>,
    headless_max_events: Option<Value>,
    headless_waiting_seconds: Option<Value>,
    headless_default_agent: Option<String>,
    headless_agents: HashMap<String, String>,
    headless_models: HashMap<String, ModelList>,
    headless_default_models: HashMap<String, String>,
    headless_auto_cleanup: Option<bool>,
    headless_notify_on_complete: Option<bool>,
    headless_notify_command: Option<String>,
}

#[derive(Debug, Clone)]
pub struct Config {
    pub config_path: PathBuf,
    pub log_path: PathBuf,
    pub sort_mode: SortMode,
    /// Blocks session deletion
    pub dry_run: bool,
    pub preview_lines: usize,
    pub refresh_interval: Duration,
    pub conflict_action: ConflictAction,
    pub lock_file: PathBuf,
    pub pid_file: PathBuf,
    pub lock_timeout: Duration,
    pub headless: HeadlessConfig,
}

#[derive(Debug, Clone)]
pub struct HeadlessConfig {
    pub state_dir: PathBuf,
    pub output_dir: PathBuf,
    pub refresh: Duration,
    pub max_events: usize,
    /// Idle time after which a running agent counts as waiting for input; zero disables
    pub waiting_threshold: Duration,
    pub default_agent: String,
    pub agents: BTreeMap<String, String>,
    pub models: HashMap<String, Vec<String>>,
    pub default_models: HashMap<String, String>,
    pub auto_cleanup: bool,
    pub notify_on_complete: bool,
    pub notify_command: String,
}

impl HeadlessConfig {
    pub fn template(&self, agent: &str) -> Option<&str> {
        self.agents.get(agent).map(String::as_str)
    }

    pub fn agent_names(&self) -> Vec<&str> {
        self.agents.keys().map(String::as_str).collect()
    }

    /// Models offered for `agent`, falling back to the `*` entry
    pub fn models_for(&self, agent: &str) -> &[String] {
        self.models
            .get(agent)
            .filter(|models| !models.is_empty())
            .or_else(|| self.models.get("*"))
            .map(Vec::as_slice)
            .unwrap_or(&[])
    }

    pub fn default_model_for(&self, agent: &str) -> Option<&str> {
        self.default_models
            .get(agent)
            .or_else(|| self.default_models.get("*"))
            .map(String::as_str)
            .filter(|m| !m.is_empty())
    }

    /// The command to notify with, when notifications are on
    pub fn notify_command(&self) -> Option<&str> {
        if self.notify_on_complete && !self.notify_command.trim().is_empty() {
            Some(self.notify_command.as_str())
        } else {
            None
        }
    }
}

impl Config {
    /// Load from `explicit`, `$TMUX_DASHBOARD_CONFIG` or the default path, then apply the environment
    pub fn load(explicit: Option<&Path>) -> Self {
        let home = dirs::home_dir().unwrap_or_else(|| PathBuf::from("."));
        Self::load_with(explicit, &home, |key| std::env::var(key).ok())
    }

    fn load_with(explicit: Option<&Path>, home: &Path, env: impl Fn(&str) -> Option<String>) -> Self {
        let env_value = |name: &str| {
            env(&format!("{}{}", ENV_PREFIX, name)).filter(|v| !v.trim().is_empty())
        };
        let expand = |value: &str| expand_home(value.trim(), home);

        let config_path = match explicit {
            Some(path) => path.to_path_buf(),
            None => env_value("CONFIG")
                .map(|p| expand(&p))
                .unwrap_or_else(|| home.join(".config/tmux-dashboard/config.json")),
        };
        let file = read_file_config(&config_path);

        let state_root = home.join(".local/state/tmux-dashboard");
        let path_setting = |env_name: &str, file_value: &Option<String>, default: PathBuf| {
            env_value(env_name)
                .or_else(|| file_value.clone().filter(|v| !v.trim().is_empty()))
                .map(|p| expand(&p))
                .unwrap_or(default)
        };
        let count_setting = |env_name: &str, file_value: &Option<Value>, default: u64, allow_zero: bool| {
            env_value(env_name)
                .map(Value::String)
                .or_else(|| file_value.clone())
                .and_then(|v| parse_count(&v, allow_zero))
                .unwrap_or(default)
        };
        let flag_setting = |env_name: &str, file_value: Option<bool>, default: bool| match env(
            &format!("{}{}", ENV_PREFIX, env_name),
        ) {
            Some(value) => parse_bool(&value),
            None => file_value.unwrap_or(default),
        };

        let log_path = path_setting("LOG", &file.log_path, state_root.join("log.jsonl"));
        let lock_file = path_setting("LOCK_FILE", &file.lock_file, state_root.join("lock"));
        let pid_file = path_setting("PID_FILE", &file.pid_file, state_root.join("pid"));
        let state_dir = path_setting(
            "HEADLESS_STATE_DIR",
            &file.headless_state_dir,
            state_root.join("headless"),
        );
        let output_dir = path_setting(
            "HEADLESS_OUTPUT_DIR",
            &file.headless_output_dir,
            state_dir.join("output"),
        );

        let sort_mode = env_value("SORT_MODE")
            .or(file.sort_mode.clone())
            .and_then(|v| SortMode::parse(&v))
            .unwrap_or_default();
        let conflict_action = env_value("CONFLICT_ACTION")
            .or(file.conflict_action.clone())
            .map(|v| ConflictAction::parse(&v))
            .unwrap_or_default();
        let lock_timeout = env_value("LOCK_TIMEOUT")
            .and_then(|v| v.trim().parse::<f64>().ok())
            .or(file.lock_timeout_secs)
            .filter(|secs| secs.is_finite() && *secs >= 0.0)
            .map(|secs| Duration::try_from_secs_f64(secs).unwrap_or(Duration::MAX))
            .unwrap_or(Duration::from_secs(5));

        let mut agents: BTreeMap<String, String> = DEFAULT_AGENT_TEMPLATES
            .iter()
            .map(|(name, template)| (name.to_string(), template.to_string()))
            .collect();
        for (name, template) in file.headless_agents {
            let name = name.trim().to_lowercase();
            if !name.is_empty() && !template.trim().is_empty() {
                agents.insert(name, template);
            }
        }
        let names: Vec<String> = agents.keys().cloned().collect();
        for name in names {
            let key = format!("HEADLESS_{}_CMD", env_key(&name));
            if let Some(template) = env_value(&key) {
                agents.insert(name, template);
            }
        }

        let mut models: HashMap<String, Vec<String>> = file
            .headless_models
            .into_iter()
            .map(|(agent, list)| (agent.trim().to_lowercase(), list.into_vec()))
            .collect();
        if let Some(list) = env_value("HEADLESS_MODELS") {
            models.insert("*".to_string(), split_list(&list));
        }
        let mut default_models: HashMap<String, String> = file
            .headless_default_models
            .into_iter()
            .map(|(agent, model)| (agent.trim().to_lowercase(), model.trim().to_string()))
            .collect();
        if let Some(model) = env_value("HEADLESS_DEFAULT_MODEL") {
            default_models.insert("*".to_string(), model.trim().to_string());
        }

        let default_agent = env_value("HEADLESS_DEFAULT_AGENT")
            .or(file.headless_default_agent)
            .map(|a| a.trim().to_lowercase())
            .filter(|a| agents.contains_key(a))
            .unwrap_or_else(|| "codex".to_string());

        let headless = HeadlessConfig {
            state_dir,
            output_dir,
            refresh: Duration::from_secs(count_setting(
                "HEADLESS_REFRESH_SECONDS",
                &file.headless_refresh_seconds,
                5,
                false,
            )),
            max_events: count_setting("HEADLESS_MAX_EVENTS", &file.headless_max_events, 200, false)
                as usize,
            waiting_threshold: Duration::from_secs(count_setting(
                "HEADLESS_WAITING_SECONDS",
                &file.headless_waiting_seconds,
                20,
                true,
            )),
            default_agent,
            agents,
            models,
            default_models,
            auto_cleanup: flag_setting("HEADLESS_AUTO_CLEANUP", file.headless_auto_cleanup, false),
            notify_on_complete: flag_setting(
                "HEADLESS_NOTIFY_ON_COMPLETE",
                file.headless_notify_on_complete,
                false,
            ),
            notify_command: env_value("HEADLESS_NOTIFY_COMMAND")
                .or(file.headless_notify_command)
                .unwrap_or_else(|| "t2me".to_string()),
        };

        Config {
            config_path,
            log_path,
            sort_mode,
            dry_run: flag_setting("DRY_RUN", file.dry_run, false),
            preview_lines: count_setting("PREVIEW_LINES", &file.preview_lines, 15, false) as usize,
            refresh_interval: Duration::from_millis(count_setting(
                "REFRESH_MS",
                &file.refresh_interval_ms,
                1000,
                false,
            )),
            conflict_action,
            lock_file,
            pid_file,
            lock_timeout,
            headless,
        }
    }
}

fn read_file_config(path: &Path) -> FileConfig {
    let text = match fs::read_to_string(path) {
        Ok(text) => text,
        Err(_) => return FileConfig::default(),
    };
    match serde_json::from_str(&text) {
        Ok(config) => config,
        Err(e) => {
            warn!(path = %path.display(), error = %e, "ignoring unreadable config file");
            FileConfig::default()
        }
    }
}

fn expand_home(value: &str, home: &Path) -> PathBuf {
    if value == "~" {
        return home.to_path_buf();
    }
    match value.strip_prefix("~/") {
        Some(rest) => home.join(rest),
        None => PathBuf::from(value),
    }
}

fn parse_bool(value: &str) -> bool {
    matches!(
        value.trim().to_lowercase().as_str(),
        "1" | "true" | "yes" | "y" | "on"
    )
}

/// Non-negative integer from a JSON number or numeric string; zero only when allowed
fn parse_count(value: &Value, allow_zero: bool) -> Option<u64> {
    let parsed = match value {
        Value::Number(n) => n.as_u64(),
        Value::String(s) => s.trim().parse::<u64>().ok(),
        _ => None,
    }?;
    if parsed == 0 && !allow_zero {
        None
    } else {
        Some(parsed)
    }
}

fn split_list(value: &str) -> Vec<String> {
    value
        .split(',')
        .map(str::trim)
        .filter(|m| !m.is_empty())
        .map(str::to_string)
        .collect()
}

fn env_key(agent: &str) -> String {
    agent
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() { c.to_ascii_uppercase() } else { '_' })
        .collect()
}
