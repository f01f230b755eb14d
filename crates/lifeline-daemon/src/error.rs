//! Daemon supervision errors.

use std::path::PathBuf;
use thiserror::Error;

/// Errors that can occur while supervising a daemon.
#[derive(Debug, Error)]
pub enum DaemonError {
    /// No controller exists for the host, or a platform capability is absent.
    #[error("Operating system `{0}` not (yet) supported")]
    UnsupportedPlatform(String),

    /// Fork, pid-file, signal or service-control failure.
    #[error("Process control failed: {0}")]
    ProcessControl(String),

    /// The pid file is missing or names a process that does not respond.
    #[error("Stale daemon state: {0}")]
    StaleState(String),

    /// Registry read or write failure.
    #[error("Persistence error: {0}")]
    Persistence(String),

    /// Another live process holds the pid file.
    #[error("Daemon already running (PID file: {path}, PID: {pid})")]
    AlreadyRunning { path: PathBuf, pid: u32 },

    /// Failed to create PID file.
    #[error("Failed to create PID file at {path}: {reason}")]
    PidFileCreation { path: PathBuf, reason: String },

    /// Failed to read PID file.
    #[error("Failed to read PID file at {path}: {reason}")]
    PidFileRead { path: PathBuf, reason: String },

    /// Failed to remove PID file.
    #[error("Failed to remove PID file at {path}: {reason}")]
    PidFileRemoval { path: PathBuf, reason: String },

    /// The effective configuration cannot drive the loop.
    #[error("Invalid configuration for {name}: {reason}")]
    InvalidConfiguration { name: String, reason: String },

    /// Failed to set up signal handlers.
    #[error("Failed to set up signal handlers: {0}")]
    SignalSetup(String),

    /// The work step failed under the terminate policy.
    #[error("Work step of {name} failed: {source}")]
    Work {
        name: String,
        #[source]
        source: anyhow::Error,
    },

    /// IO error.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Coarse classification used for policy decisions.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    UnsupportedPlatform,
    ProcessControl,
    StaleState,
    Persistence,
    Configuration,
    Work,
}

impl DaemonError {
    /// Which part of the error taxonomy this error belongs to.
    pub fn kind(&self) -> ErrorKind {
        match self {
            DaemonError::UnsupportedPlatform(_) => ErrorKind::UnsupportedPlatform,
            DaemonError::StaleState(_) => ErrorKind::StaleState,
            DaemonError::Persistence(_) => ErrorKind::Persistence,
            DaemonError::InvalidConfiguration { .. } => ErrorKind::Configuration,
            DaemonError::Work { .. } => ErrorKind::Work,
            DaemonError::ProcessControl(_)
            | DaemonError::AlreadyRunning { .. }
            | DaemonError::PidFileCreation { .. }
            | DaemonError::PidFileRead { .. }
            | DaemonError::PidFileRemoval { .. }
            | DaemonError::SignalSetup(_)
            | DaemonError::Io(_) => ErrorKind::ProcessControl,
        }
    }

    /// Whether the error must stop the process.
    pub fn is_fatal(&self) -> bool {
        !matches!(self.kind(), ErrorKind::StaleState | ErrorKind::Persistence)
    }
}

impl From<tokio_rusqlite::Error> for DaemonError {
    fn from(err: tokio_rusqlite::Error) -> Self {
        DaemonError::Persistence(err.to_string())
    }
}

impl From<serde_json::Error> for DaemonError {
    fn from(err: serde_json::Error) -> Self {
        DaemonError::Persistence(format!("configuration blob: {}", err))
    }
}
