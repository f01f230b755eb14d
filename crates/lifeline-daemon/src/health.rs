//! Health classification for external monitors.

use std::fmt;

use chrono::{DateTime, Duration, Utc};
use serde::Serialize;

use crate::registry::DaemonStatus;

/// Observed condition of a daemon.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum HealthState {
    /// Not registered and no live process.
    Stopped,
    /// Live process with a recent heartbeat.
    Running,
    /// Live process whose heartbeat is too old.
    Stalled,
    /// Registered as running but the process is gone.
    Dead,
}

impl fmt::Display for HealthState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            HealthState::Stopped => "stopped",
            HealthState::Running => "running",
            HealthState::Stalled => "stalled",
            HealthState::Dead => "dead",
        };
        f.write_str(label)
    }
}

/// Registry status, liveness and the resulting classification.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct HealthReport {
    pub state: HealthState,
    pub started: Option<DateTime<Utc>>,
    pub heartbeat: Option<DateTime<Utc>>,
    /// Seconds since the last heartbeat, or since start when none was written.
    pub heartbeat_age: Option<i64>,
    /// Age in seconds above which a live daemon counts as stalled.
    pub stall_threshold: i64,
}

impl HealthReport {
    /// Classify a daemon from its registry status and a liveness probe.
    ///
    /// A heartbeat older than `stall_factor * max_interval` seconds marks a
    /// live daemon as stalled.
    pub fn classify(
        status: &DaemonStatus,
        alive: bool,
        now: DateTime<Utc>,
        max_interval: f64,
        stall_factor: u32,
    ) -> Self {
        let stall_threshold = (max_interval.max(0.0) * f64::from(stall_factor)).ceil() as i64;
        let last_seen = status.heartbeat.or(status.started);
        let heartbeat_age = last_seen.map(|at| (now - at).num_seconds().max(0));

        let state = match (status.started.is_some(), alive) {
            (false, false) => HealthState::Stopped,
            (true, false) => HealthState::Dead,
            (_, true) => match last_seen {
                Some(at) if now - at > Duration::seconds(stall_threshold) => HealthState::Stalled,
                _ => HealthState::Running,
            },
        };

        Self {
            state,
            started: status.started,
            heartbeat: status.heartbeat,
            heartbeat_age,
            stall_threshold,
        }
    }
}
