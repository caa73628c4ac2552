use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{FlowloomError, Result};

/// Top-level flowloom configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AppConfig {
    #[serde(default)]
    pub interpreter: InterpreterConfig,
    #[serde(default)]
    pub sandbox: SandboxConfig,
    #[serde(default)]
    pub supervisor: SupervisorConfig,
    #[serde(default)]
    pub coordinator: CoordinatorConfig,
    #[serde(default)]
    pub watchers: WatcherConfig,
    #[serde(default)]
    pub log: LogConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InterpreterConfig {
    /// Pause after each node so progress stays observable.
    #[serde(default = "default_step_delay_ms")]
    pub step_delay_ms: u64,
    /// Shorter pause after `edge_start`.
    #[serde(default = "default_edge_delay_ms")]
    pub edge_delay_ms: u64,
    /// Upper bound on node visits per run (0 = unlimited).
    #[serde(default = "default_max_steps")]
    pub max_steps: usize,
}

impl Default for InterpreterConfig {
    fn default() -> Self {
        Self {
            step_delay_ms: default_step_delay_ms(),
            edge_delay_ms: default_edge_delay_ms(),
            max_steps: default_max_steps(),
        }
    }
}

impl InterpreterConfig {
    pub fn step_delay(&self) -> Duration {
        Duration::from_millis(self.step_delay_ms)
    }

    pub fn edge_delay(&self) -> Duration {
        Duration::from_millis(self.edge_delay_ms)
    }

    /// No delays; for previews and tests.
    pub fn immediate() -> Self {
        Self {
            step_delay_ms: 0,
            edge_delay_ms: 0,
            ..Self::default()
        }
    }
}

fn default_step_delay_ms() -> u64 { 900 }
fn default_edge_delay_ms() -> u64 { 300 }
fn default_max_steps() -> usize { 10_000 }

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SandboxConfig {
    /// Memory ceiling for one script's Lua state.
    #[serde(default = "default_memory_limit")]
    pub memory_limit_bytes: usize,
    /// Timeout applied by the network capability to each request.
    #[serde(default = "default_http_timeout")]
    pub http_timeout_secs: u64,
    /// Directory of reusable `*.lua` scripts.
    #[serde(default)]
    pub scripts_dir: Option<String>,
}

impl Default for SandboxConfig {
    fn default() -> Self {
        Self {
            memory_limit_bytes: default_memory_limit(),
            http_timeout_secs: default_http_timeout(),
            scripts_dir: None,
        }
    }
}

fn default_memory_limit() -> usize { 32 * 1024 * 1024 }
fn default_http_timeout() -> u64 { 30 }

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SupervisorConfig {
    /// JSON file holding the run registry.
    #[serde(default = "default_registry_path")]
    pub registry_path: String,
    /// Capacity of each run's control channel.
    #[serde(default = "default_control_buffer")]
    pub control_buffer: usize,
    /// How often an active run's heartbeat is refreshed and written out.
    #[serde(default = "default_heartbeat_interval_ms")]
    pub heartbeat_interval_ms: u64,
    /// Finished runs kept per project. Older ones are dropped when the
    /// project starts a new run.
    #[serde(default = "default_keep_finished")]
    pub keep_finished_per_project: usize,
}

impl Default for SupervisorConfig {
    fn default() -> Self {
        Self {
            registry_path: default_registry_path(),
            control_buffer: default_control_buffer(),
            heartbeat_interval_ms: default_heartbeat_interval_ms(),
            keep_finished_per_project: default_keep_finished(),
        }
    }
}

impl SupervisorConfig {
    pub fn registry_path(&self) -> PathBuf {
        expand_home(&self.registry_path)
    }

    pub fn heartbeat_interval(&self) -> Duration {
        Duration::from_millis(self.heartbeat_interval_ms.max(1))
    }
}

fn default_registry_path() -> String { "~/.flowloom/runs.json".to_string() }
fn default_control_buffer() -> usize { 64 }
fn default_heartbeat_interval_ms() -> u64 { 5_000 }
fn default_keep_finished() -> usize { 10 }

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CoordinatorConfig {
    #[serde(default = "default_poll_interval_ms")]
    pub poll_interval_ms: u64,
}

impl Default for CoordinatorConfig {
    fn default() -> Self {
        Self {
            poll_interval_ms: default_poll_interval_ms(),
        }
    }
}

impl CoordinatorConfig {
    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms.max(1))
    }
}

fn default_poll_interval_ms() -> u64 { 500 }

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WatcherConfig {
    /// Per-watcher delivery buffer; a full buffer drops events for that watcher.
    #[serde(default = "default_watcher_buffer")]
    pub buffer: usize,
}

impl Default for WatcherConfig {
    fn default() -> Self {
        Self {
            buffer: default_watcher_buffer(),
        }
    }
}

fn default_watcher_buffer() -> usize { 256 }

/// Logging and run journal configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LogConfig {
    /// `tracing_subscriber` filter used when `RUST_LOG` is unset.
    #[serde(default = "default_log_filter")]
    pub filter: String,
    /// Directory for per-run JSONL journals. Disabled when absent.
    #[serde(default)]
    pub journal_dir: Option<String>,
    /// 1 = lifecycle, 2 = + node/edge events, 3 = + logs and var snapshots.
    #[serde(default = "default_journal_level")]
    pub journal_level: u8,
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            filter: default_log_filter(),
            journal_dir: None,
            journal_level: default_journal_level(),
        }
    }
}

impl LogConfig {
    pub fn journal_dir(&self) -> Option<PathBuf> {
        self.journal_dir.as_deref().map(expand_home)
    }
}

fn default_log_filter() -> String { "flowloom=info,warn".to_string() }
fn default_journal_level() -> u8 { 2 }

impl AppConfig {
    /// Load config from a TOML file, with env var expansion.
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .map_err(|_| FlowloomError::ConfigNotFound(path.display().to_string()))?;

        // Expand ${ENV_VAR} references
        let expanded = expand_env_vars(&content);

        toml::from_str(&expanded).map_err(|e| FlowloomError::Config(e.to_string()))
    }

    /// Load `path` if it exists, otherwise fall back to defaults.
    pub fn load_or_default(path: &Path) -> Result<Self> {
        if path.exists() {
            Self::load(path)
        } else {
            Ok(Self::default())
        }
    }
}

/// Expand `${ENV_VAR}` patterns in a string.
fn expand_env_vars(input: &str) -> String {
    let mut result = String::with_capacity(input.len());
    let mut chars = input.chars().peekable();

    while let Some(c) = chars.next() {
        if c == '$' && chars.peek() == Some(&'{') {
            chars.next(); // consume '{'
            let mut var_name = String::new();
            for c in chars.by_ref() {
                if c == '}' {
                    break;
                }
                var_name.push(c);
            }
            match std::env::var(&var_name) {
                Ok(val) => result.push_str(&val),
                Err(_) => {
                    // Keep original if env var not set
                    result.push_str(&format!("${{{}}}", var_name));
                }
            }
        } else {
            result.push(c);
        }
    }
    result
}

/// Resolve a leading `~/` against `$HOME`.
pub fn expand_home(path: &str) -> PathBuf {
    if let Some(rest) = path.strip_prefix("~/") {
        if let Some(home) = std::env::var_os("HOME") {
            return PathBuf::from(home).join(rest);
        }
    }
    PathBuf::from(path)
}
