//! Configuration schema definitions.

use std::collections::{BTreeMap, HashMap};
use std::path::PathBuf;

use chrono::NaiveTime;
use serde::{Deserialize, Serialize};

use crate::loader::ConfigLoader;

/// Root configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub runtime: RuntimeConfig,

    #[serde(default)]
    pub registry: RegistryConfig,

    #[serde(default)]
    pub supervision: SupervisionConfig,

    /// Per-daemon configuration entries, keyed by daemon name.
    #[serde(default)]
    pub daemons: HashMap<String, DaemonConfiguration>,
}

impl Config {
    /// Look up the configuration entry for a daemon.
    pub fn daemon(&self, name: &str) -> Option<&DaemonConfiguration> {
        self.daemons.get(name)
    }
}

/// Process-level runtime settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RuntimeConfig {
    /// Selected application environment.
    #[serde(default = "default_environment")]
    pub environment: String,

    /// Root directory for per-daemon pid files.
    #[serde(default = "default_pid_root")]
    pub pid_root: String,

    /// Directory for per-daemon log files. Console only when unset.
    #[serde(default)]
    pub log_dir: Option<String>,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            environment: default_environment(),
            pid_root: default_pid_root(),
            log_dir: None,
        }
    }
}

impl RuntimeConfig {
    /// Pid root with `~` expanded.
    pub fn pid_root_path(&self) -> PathBuf {
        PathBuf::from(ConfigLoader::expand_path(&self.pid_root))
    }

    /// Log directory with `~` expanded.
    pub fn log_dir_path(&self) -> Option<PathBuf> {
        self.log_dir
            .as_deref()
            .map(|dir| PathBuf::from(ConfigLoader::expand_path(dir)))
    }
}

pub fn default_environment() -> String {
    "production".to_string()
}

/// Base directory for Lifeline state, `~/.lifeline`.
pub fn lifeline_home() -> PathBuf {
    dirs::home_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join(".lifeline")
}

fn default_pid_root() -> String {
    lifeline_home().join("run").display().to_string()
}

/// Registry storage settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RegistryConfig {
    /// SQLite database path, or `:memory:`.
    #[serde(default = "default_registry_path")]
    pub path: String,
}

impl Default for RegistryConfig {
    fn default() -> Self {
        Self {
            path: default_registry_path(),
        }
    }
}

impl RegistryConfig {
    /// Whether the registry lives only in memory.
    pub fn is_in_memory(&self) -> bool {
        self.path == ":memory:"
    }

    /// Database path with `~` expanded.
    pub fn database_path(&self) -> PathBuf {
        PathBuf::from(ConfigLoader::expand_path(&self.path))
    }
}

fn default_registry_path() -> String {
    lifeline_home().join("registry.db").display().to_string()
}

/// What the loop does when a daemon's work step fails.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum WorkErrorPolicy {
    /// Log the failure and carry on with the next tick.
    #[default]
    Continue,
    /// Shut the daemon down through the normal shutdown path.
    Terminate,
}

/// Supervision loop settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SupervisionConfig {
    #[serde(default)]
    pub on_work_error: WorkErrorPolicy,

    /// A heartbeat older than `stall_factor * maxInterval` marks a daemon stalled.
    #[serde(default = "default_stall_factor")]
    pub stall_factor: u32,
}

impl Default for SupervisionConfig {
    fn default() -> Self {
        Self {
            on_work_error: WorkErrorPolicy::default(),
            stall_factor: default_stall_factor(),
        }
    }
}

fn default_stall_factor() -> u32 {
    3
}

/// Configuration entry for a single daemon.
///
/// Key names follow the persisted configuration blob (`maxInterval`,
/// `runStart`, `runEnd`); unknown keys are kept for the daemon program.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct DaemonConfiguration {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub interval: Option<f64>,

    #[serde(default, rename = "maxInterval", skip_serializing_if = "Option::is_none")]
    pub max_interval: Option<f64>,

    #[serde(default, rename = "runStart", skip_serializing_if = "Option::is_none")]
    pub run_start: Option<String>,

    #[serde(default, rename = "runEnd", skip_serializing_if = "Option::is_none")]
    pub run_end: Option<String>,

    #[serde(flatten)]
    pub extra: BTreeMap<String, serde_json::Value>,
}

impl DaemonConfiguration {
    /// Interval used when none is configured.
    pub const DEFAULT_INTERVAL: f64 = 10.0;

    /// Configured base interval in seconds.
    pub fn base_interval(&self) -> f64 {
        self.interval.unwrap_or(Self::DEFAULT_INTERVAL)
    }

    /// Configured maximum interval, `interval * 10` when absent.
    pub fn effective_max_interval(&self) -> f64 {
        self.max_interval.unwrap_or(self.base_interval() * 10.0)
    }

    /// Overlay `other` on top of `self`; set values in `other` win.
    pub fn merge(&mut self, other: &DaemonConfiguration) {
        if other.interval.is_some() {
            self.interval = other.interval;
        }
        if other.max_interval.is_some() {
            self.max_interval = other.max_interval;
        }
        if other.run_start.is_some() {
            self.run_start = other.run_start.clone();
        }
        if other.run_end.is_some() {
            self.run_end = other.run_end.clone();
        }
        for (key, value) in &other.extra {
            self.extra.insert(key.clone(), value.clone());
        }
    }

    /// Parsed `(runStart, runEnd)` when both are present.
    ///
    /// Returns `Err` with the offending value if either fails to parse.
    pub fn window_bounds(&self) -> Result<Option<(NaiveTime, NaiveTime)>, String> {
        match (&self.run_start, &self.run_end) {
            (Some(start), Some(end)) => {
                let begin = parse_time_of_day(start).ok_or_else(|| start.clone())?;
                let end = parse_time_of_day(end).ok_or_else(|| end.clone())?;
                Ok(Some((begin, end)))
            }
            _ => Ok(None),
        }
    }
}

/// Parse a time of day such as `20:15` or `06:00:30`.
pub fn parse_time_of_day(value: &str) -> Option<NaiveTime> {
    let value = value.trim();
    NaiveTime::parse_from_str(value, "%H:%M:%S")
        .or_else(|_| NaiveTime::parse_from_str(value, "%H:%M"))
        .ok()
}

#[cfg(test)]
#[path = "schema_tests.rs"]
mod tests;
