//! Configuration (§7 ambient). Priority: CLI/env > `{data_dir}/config.toml`
//! > built-in default, same layering as the teacher's `DaemonConfig`. The
//! rollout fields (`rollout_percent`, `allowlist`, `canary`) are hot-reloaded
//! via the same `notify`-backed watcher the teacher uses for `log`/
//! `session_prune_days`, since flipping a tenant's rollout bucket must not
//! require a daemon restart.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use serde::Deserialize;
use tokio::sync::RwLock;
use tracing::{error, info, warn};

use crate::domain::RolloutMode;

const DEFAULT_PORT: u16 = 4700;
const DEFAULT_MAX_REWORK_ATTEMPTS: u32 = 3;
const DEFAULT_CHECKPOINT_KEEP_COUNT: usize = 5;
const DEFAULT_APPROVAL_TIMEOUT_SECS: u64 = 24 * 60 * 60;
const DEFAULT_HEARTBEAT_STALE_SECONDS: i64 = 60;
const DEFAULT_GATE_TIMEOUT_SECS: u64 = 3600;
const DEFAULT_ROLLOUT_PERCENT: i32 = 0;

#[derive(Debug, Clone, Deserialize, Default, serde::Serialize)]
pub struct GateCommandProfile {
    pub command: Vec<String>,
    pub timeout_secs: Option<u64>,
}

#[derive(Deserialize, Default)]
struct TomlConfig {
    port: Option<u16>,
    log: Option<String>,
    max_rework_attempts: Option<u32>,
    checkpoint_keep_count: Option<usize>,
    approval_timeout_secs: Option<u64>,
    heartbeat_stale_seconds: Option<i64>,
    gate_timeout_secs: Option<u64>,
    rollout_mode: Option<String>,
    rollout_percent: Option<i32>,
    rollout_allowlist: Option<Vec<String>>,
    rollout_canary: Option<bool>,
    gate: Option<std::collections::HashMap<String, GateCommandProfile>>,
}

fn load_toml(data_dir: &Path) -> Option<TomlConfig> {
    let path = data_dir.join("config.toml");
    let contents = std::fs::read_to_string(&path).ok()?;
    match toml::from_str::<TomlConfig>(&contents) {
        Ok(cfg) => Some(cfg),
        Err(e) => {
            error!(path = %path.display(), err = %e, "failed to parse config.toml — using defaults");
            None
        }
    }
}

fn parse_rollout_mode(s: &str) -> Option<RolloutMode> {
    match s {
        "off" => Some(RolloutMode::Off),
        "shadow" => Some(RolloutMode::Shadow),
        "enforced" => Some(RolloutMode::Enforced),
        _ => None,
    }
}

#[derive(Debug, Clone)]
pub struct SibylConfig {
    pub port: u16,
    pub data_dir: PathBuf,
    pub log: String,
    /// Ralph Loop cap: gate/review failures at or past this count terminate
    /// the task orchestrator with `rework_limit` rather than retrying again.
    pub max_rework_attempts: u32,
    pub checkpoint_keep_count: usize,
    pub approval_timeout_secs: u64,
    /// Heartbeats older than this make a runner ineligible for routing.
    pub heartbeat_stale_seconds: i64,
    pub gate_timeout_secs: u64,
    pub rollout_mode: RolloutMode,
    pub rollout_percent: i32,
    pub rollout_allowlist: Vec<String>,
    pub rollout_canary: bool,
    /// Per-gate-kind shell command overrides (e.g. `[gate.lint]`).
    pub gates: std::collections::HashMap<String, GateCommandProfile>,
    /// Shared secret runners present on `runner.auth`.
    pub runner_auth_token: String,
}

impl SibylConfig {
    /// Build config from CLI/env args plus the optional TOML file.
    pub fn new(port: Option<u16>, data_dir: Option<PathBuf>, log: Option<String>) -> Self {
        let data_dir = data_dir.unwrap_or_else(default_data_dir);
        let toml = load_toml(&data_dir).unwrap_or_default();

        let port = port.or(toml.port).unwrap_or(DEFAULT_PORT);
        let log = log.or(toml.log).unwrap_or_else(|| "info".to_string());
        let max_rework_attempts = toml.max_rework_attempts.unwrap_or(DEFAULT_MAX_REWORK_ATTEMPTS);
        let checkpoint_keep_count = toml
            .checkpoint_keep_count
            .unwrap_or(DEFAULT_CHECKPOINT_KEEP_COUNT);
        let approval_timeout_secs = toml
            .approval_timeout_secs
            .unwrap_or(DEFAULT_APPROVAL_TIMEOUT_SECS);
        let heartbeat_stale_seconds = toml
            .heartbeat_stale_seconds
            .unwrap_or(DEFAULT_HEARTBEAT_STALE_SECONDS);
        let gate_timeout_secs = toml.gate_timeout_secs.unwrap_or(DEFAULT_GATE_TIMEOUT_SECS);

        let rollout_mode = toml
            .rollout_mode
            .as_deref()
            .and_then(parse_rollout_mode)
            .unwrap_or(RolloutMode::Off);
        let rollout_percent = toml.rollout_percent.unwrap_or(DEFAULT_ROLLOUT_PERCENT);
        let rollout_allowlist = toml.rollout_allowlist.unwrap_or_default();
        let rollout_canary = toml.rollout_canary.unwrap_or(false);
        let gates = toml.gate.unwrap_or_default();

        let runner_auth_token = std::env::var("SIBYL_RUNNER_TOKEN").unwrap_or_default();

        Self {
            port,
            data_dir,
            log,
            max_rework_attempts,
            checkpoint_keep_count,
            approval_timeout_secs,
            heartbeat_stale_seconds,
            gate_timeout_secs,
            rollout_mode,
            rollout_percent,
            rollout_allowlist,
            rollout_canary,
            gates,
            runner_auth_token,
        }
    }

    pub fn gate_profile(&self, kind: &str) -> Option<&GateCommandProfile> {
        self.gates.get(kind)
    }
}

// ─── Hot-reloadable subset ──────────────────────────────────────────────────

/// Fields that can change without restarting the daemon: rollout knobs and
/// the log level. Everything else (port, data_dir) requires a restart.
#[derive(Debug, Clone)]
pub struct HotConfig {
    pub log_level: String,
    pub rollout_mode: RolloutMode,
    pub rollout_percent: i32,
    pub rollout_allowlist: Vec<String>,
    pub rollout_canary: bool,
}

pub struct ConfigWatcher {
    pub hot: Arc<RwLock<HotConfig>>,
    _watcher: notify_debouncer_full::Debouncer<
        notify_debouncer_full::notify::RecommendedWatcher,
        notify_debouncer_full::FileIdMap,
    >,
}

impl ConfigWatcher {
    pub fn start(data_dir: &Path) -> Option<Self> {
        let config_path = data_dir.join("config.toml");
        let initial = load_hot_config(&config_path);
        let hot = Arc::new(RwLock::new(initial));

        let hot_clone = hot.clone();
        let config_path_clone = config_path.clone();
        let rt_handle = tokio::runtime::Handle::current();

        let watcher = notify_debouncer_full::new_debouncer(
            std::time::Duration::from_secs(2),
            None,
            move |result: notify_debouncer_full::DebounceEventResult| {
                if let Ok(events) = result {
                    let relevant = events.iter().any(|e| {
                        use notify_debouncer_full::notify::EventKind;
                        matches!(e.event.kind, EventKind::Modify(_) | EventKind::Create(_))
                    });
                    if relevant {
                        let hot = hot_clone.clone();
                        let path = config_path_clone.clone();
                        rt_handle.spawn(async move {
                            let new_config = load_hot_config(&path);
                            let mut guard = hot.write().await;
                            if guard.rollout_percent != new_config.rollout_percent
                                || guard.rollout_mode != new_config.rollout_mode
                                || guard.rollout_allowlist != new_config.rollout_allowlist
                                || guard.log_level != new_config.log_level
                            {
                                info!(
                                    rollout_percent = new_config.rollout_percent,
                                    rollout_mode = ?new_config.rollout_mode,
                                    "config.toml reloaded"
                                );
                                *guard = new_config;
                            }
                        });
                    }
                }
            },
        );

        match watcher {
            Ok(mut debouncer) => {
                use notify_debouncer_full::notify::Watcher as _;
                let watch_path = config_path.parent().unwrap_or_else(|| Path::new("."));
                if let Err(e) = debouncer
                    .watcher()
                    .watch(watch_path, notify_debouncer_full::notify::RecursiveMode::NonRecursive)
                {
                    warn!("config watcher failed to start: {e} — hot-reload disabled");
                    return None;
                }
                info!(path = %config_path.display(), "config hot-reload watcher started");
                Some(Self {
                    hot,
                    _watcher: debouncer,
                })
            }
            Err(e) => {
                warn!("config watcher creation failed: {e} — hot-reload disabled");
                None
            }
        }
    }
}

fn load_hot_config(path: &Path) -> HotConfig {
    let toml = std::fs::read_to_string(path)
        .ok()
        .and_then(|s| toml::from_str::<TomlConfig>(&s).ok())
        .unwrap_or_default();
    HotConfig {
        log_level: toml.log.unwrap_or_else(|| "info".to_string()),
        rollout_mode: toml
            .rollout_mode
            .as_deref()
            .and_then(parse_rollout_mode)
            .unwrap_or(RolloutMode::Off),
        rollout_percent: toml.rollout_percent.unwrap_or(DEFAULT_ROLLOUT_PERCENT),
        rollout_allowlist: toml.rollout_allowlist.unwrap_or_default(),
        rollout_canary: toml.rollout_canary.unwrap_or(false),
    }
}

fn default_data_dir() -> PathBuf {
    #[cfg(target_os = "macos")]
    {
        if let Ok(home) = std::env::var("HOME") {
            return PathBuf::from(home)
                .join("Library")
                .join("Application Support")
                .join("sibyl");
        }
    }
    #[cfg(target_os = "linux")]
    {
        if let Ok(xdg) = std::env::var("XDG_DATA_HOME") {
            return PathBuf::from(xdg).join("sibyl");
        }
        if let Ok(home) = std::env::var("HOME") {
            return PathBuf::from(home).join(".local").join("share").join("sibyl");
        }
    }
    #[cfg(target_os = "windows")]
    {
        if let Ok(appdata) = std::env::var("APPDATA") {
            return PathBuf::from(appdata).join("sibyl");
        }
    }
    PathBuf::from(".sibyl")
}
