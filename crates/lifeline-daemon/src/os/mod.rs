//! Operating-system process control.
//!
//! One capability set, two mechanisms: [`PosixController`] forks and talks
//! through pid files and signals, [`WindowsController`] registers a service
//! and reads the last control message. [`ControllerFactory`] picks one per
//! process.

mod factory;
mod posix;
mod windows;

use std::fmt;
use std::path::PathBuf;

use async_trait::async_trait;
use serde::Serialize;

use crate::descriptor::DaemonDescriptor;
use crate::error::DaemonError;

pub use factory::{ControllerFactory, ControllerSettings};
pub use posix::{FORKED_PREFIX, PosixController};
pub use windows::{
    ControlCell, ControlMessage, ServiceState, WindowsController, parse_sc_state,
};

/// Result of [`ProcessController::daemonize`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DaemonizeOutcome {
    /// This is the original process after a fork; it must report and exit.
    Parent { child_pid: u32 },
    /// This process continues as the running daemon.
    Daemon,
}

/// A platform capability and whether the current runtime provides it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Requirement {
    pub name: String,
    pub description: String,
    pub present: bool,
}

impl Requirement {
    pub fn new(name: impl Into<String>, description: impl Into<String>, present: bool) -> Self {
        Self {
            name: name.into(),
            description: description.into(),
            present,
        }
    }
}

/// Process lifecycle primitives for one platform family.
#[async_trait]
pub trait ProcessController: Send + Sync {
    fn family(&self) -> PlatformFamily;

    /// Refuse to go further when another instance owns the daemon.
    ///
    /// Runs before the registry record is touched.
    async fn preflight(&self, _descriptor: &DaemonDescriptor) -> Result<(), DaemonError> {
        Ok(())
    }

    /// Detach the calling process into a background daemon.
    async fn daemonize(&self, descriptor: &DaemonDescriptor)
    -> Result<DaemonizeOutcome, DaemonError>;

    /// Liveness check consulted at the top of every tick.
    ///
    /// `Ok(false)` is a requested stop. `Err(StaleState)` means the daemon
    /// died or lost its pid file without being asked to stop.
    async fn is_running(&self, descriptor: &DaemonDescriptor) -> Result<bool, DaemonError>;

    /// Launch the daemon out of process. Returns its pid when known.
    async fn start(&self, descriptor: &DaemonDescriptor) -> Result<Option<u32>, DaemonError>;

    /// Ask a running daemon to stop.
    async fn stop(&self, descriptor: &DaemonDescriptor) -> Result<(), DaemonError>;

    /// Remove any remaining process artifacts and kill a leftover process.
    async fn die_daemon(&self, descriptor: &DaemonDescriptor) -> Result<(), DaemonError>;

    /// External probe used by status reporting. Does not read cancellation.
    async fn is_alive(&self, descriptor: &DaemonDescriptor) -> Result<bool, DaemonError>;

    /// Capabilities this variant depends on.
    fn requirements(&self) -> Vec<Requirement>;

    /// Resolves once a stop has been requested.
    ///
    /// Only cuts the end-of-tick sleep short. The stop itself is still
    /// observed through [`is_running`](Self::is_running).
    async fn stop_requested(&self) {
        std::future::pending::<()>().await
    }

    /// Consume a pending reload request, if the platform has one.
    fn take_reload(&self) -> bool {
        false
    }
}

/// Command line used to launch `run <name>` in another process.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LaunchCommand {
    pub program: PathBuf,
    pub environment: String,
    pub config: Option<PathBuf>,
}

impl LaunchCommand {
    pub fn new(program: impl Into<PathBuf>, environment: impl Into<String>) -> Self {
        Self {
            program: program.into(),
            environment: environment.into(),
            config: None,
        }
    }

    /// Launcher for the currently running executable.
    pub fn current(environment: &str, config: Option<PathBuf>) -> Result<Self, DaemonError> {
        let program = std::env::current_exe().map_err(|e| {
            DaemonError::ProcessControl(format!("Cannot locate current executable: {}", e))
        })?;
        Ok(Self {
            program,
            environment: environment.to_string(),
            config,
        })
    }

    pub fn with_config(mut self, config: impl Into<PathBuf>) -> Self {
        self.config = Some(config.into());
        self
    }

    /// `run <name> --verbose --env=<env> [--config <path>]`
    pub fn run_args(&self, name: &str) -> Vec<String> {
        let mut args = vec![
            "run".to_string(),
            name.to_string(),
            "--verbose".to_string(),
            format!("--env={}", self.environment),
        ];
        if let Some(config) = &self.config {
            args.push("--config".to_string());
            args.push(config.display().to_string());
        }
        args
    }

    /// Single command line string, each part quoted when it contains spaces.
    pub fn command_line(&self, name: &str) -> String {
        std::iter::once(self.program.display().to_string())
            .chain(self.run_args(name))
            .map(|part| {
                if part.contains(' ') {
                    format!("\"{}\"", part)
                } else {
                    part
                }
            })
            .collect::<Vec<_>>()
            .join(" ")
    }
}

/// Controller family a platform maps to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PlatformFamily {
    Posix,
    Windows,
}

impl fmt::Display for PlatformFamily {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PlatformFamily::Posix => write!(f, "posix"),
            PlatformFamily::Windows => write!(f, "windows"),
        }
    }
}

/// Operating system name as reported by the runtime.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Platform {
    name: String,
}

const POSIX_SYSTEMS: &[&str] = &[
    "linux",
    "macos",
    "darwin",
    "freebsd",
    "netbsd",
    "openbsd",
    "dragonfly",
    "solaris",
    "illumos",
];

impl Platform {
    /// The platform this binary was built for.
    pub fn detect() -> Self {
        Self::named(std::env::consts::OS)
    }

    pub fn named(name: impl Into<String>) -> Self {
        Self { name: name.into() }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Map the platform to a controller family.
    pub fn family(&self) -> Result<PlatformFamily, DaemonError> {
        let lower = self.name.to_ascii_lowercase();
        if lower.starts_with("win") {
            Ok(PlatformFamily::Windows)
        } else if POSIX_SYSTEMS.contains(&lower.as_str()) {
            Ok(PlatformFamily::Posix)
        } else {
            Err(DaemonError::UnsupportedPlatform(self.name.clone()))
        }
    }
}

impl fmt::Display for Platform {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.name)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_platform_family() {
        assert_eq!(Platform::named("linux").family().unwrap(), PlatformFamily::Posix);
        assert_eq!(Platform::named("Darwin").family().unwrap(), PlatformFamily::Posix);
        assert_eq!(Platform::named("windows").family().unwrap(), PlatformFamily::Windows);
        assert_eq!(Platform::named("WINNT").family().unwrap(), PlatformFamily::Windows);
        assert!(matches!(
            Platform::named("haiku").family(),
            Err(DaemonError::UnsupportedPlatform(_))
        ));
    }

    #[test]
    fn test_detect_matches_build_target() {
        assert_eq!(Platform::detect().name(), std::env::consts::OS);
    }

    #[test]
    fn test_run_args() {
        let launcher = LaunchCommand::new("/usr/bin/lifeline", "staging");
        assert_eq!(
            launcher.run_args("daemon:cac:test"),
            vec!["run", "daemon:cac:test", "--verbose", "--env=staging"]
        );

        let launcher = launcher.with_config("/etc/lifeline/staging.toml");
        let args = launcher.run_args("daemon:cac:test");
        assert_eq!(&args[4..], &["--config", "/etc/lifeline/staging.toml"]);
    }

    #[test]
    fn test_command_line_quotes_spaces() {
        let launcher = LaunchCommand::new("C:\\Program Files\\lifeline.exe", "production");
        assert_eq!(
            launcher.command_line("mailer"),
            "\"C:\\Program Files\\lifeline.exe\" run mailer --verbose --env=production"
        );
    }
}
