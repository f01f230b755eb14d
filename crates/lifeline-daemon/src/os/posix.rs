//! Fork, pid-file and signal based process control.

use std::fs;
use std::path::{Path, PathBuf};
use std::process::Stdio;

use async_trait::async_trait;
use tracing::{debug, info, warn};

use super::{DaemonizeOutcome, LaunchCommand, PlatformFamily, ProcessController, Requirement};
use crate::descriptor::DaemonDescriptor;
use crate::error::DaemonError;
use crate::pid::PidFile;
use crate::signal::{DaemonSignal, SignalFlags, send_signal_to_pid};

/// Prefix of the line the forking parent prints to stdout.
pub const FORKED_PREFIX: &str = "Process forked to PID:";

/// Process control through fork, pid files and signals.
#[derive(Debug, Clone)]
pub struct PosixController {
    pid_root: PathBuf,
    launcher: LaunchCommand,
    flags: SignalFlags,
}

impl PosixController {
    pub fn new(pid_root: impl Into<PathBuf>, launcher: LaunchCommand) -> Self {
        Self {
            pid_root: pid_root.into(),
            launcher,
            flags: SignalFlags::new(),
        }
    }

    pub fn pid_root(&self) -> &Path {
        &self.pid_root
    }

    /// Flags written by the signal tasks.
    pub fn flags(&self) -> &SignalFlags {
        &self.flags
    }

    pub fn pid_file(&self, descriptor: &DaemonDescriptor) -> PidFile {
        PidFile::for_daemon(&self.pid_root, descriptor)
    }

    #[cfg(unix)]
    fn detach(&self, pid_file: &PidFile) -> Result<DaemonizeOutcome, DaemonError> {
        use nix::sys::stat::{Mode, umask};
        use nix::unistd::{ForkResult, dup2, fork, setsid};
        use std::os::unix::io::AsRawFd;

        // SAFETY: the runtime is single threaded, so the child starts with a
        // consistent copy of the only thread that exists.
        match unsafe { fork() } {
            Ok(ForkResult::Parent { child }) => {
                let child_pid = child.as_raw() as u32;
                debug!("Forked daemon child {}", child_pid);
                return Ok(DaemonizeOutcome::Parent { child_pid });
            }
            Ok(ForkResult::Child) => {}
            Err(e) => {
                return Err(DaemonError::ProcessControl(format!(
                    "Process could not be forked: {}",
                    e
                )));
            }
        }

        setsid()
            .map_err(|e| DaemonError::ProcessControl(format!("setsid failed: {}", e)))?;
        umask(Mode::empty());

        // Detached from the terminal; diagnostics go to the log file if any.
        let dev_null = fs::OpenOptions::new()
            .read(true)
            .write(true)
            .open("/dev/null")
            .map_err(|e| {
                DaemonError::ProcessControl(format!("Failed to open /dev/null: {}", e))
            })?;
        let fd = dev_null.as_raw_fd();
        dup2(fd, 0).ok();
        dup2(fd, 1).ok();
        dup2(fd, 2).ok();

        pid_file.write_pid().map_err(|e| {
            DaemonError::ProcessControl(format!("Could not write pid file: {}", e))
        })?;
        self.flags.install()?;

        info!("Process daemonized (PID: {})", std::process::id());
        Ok(DaemonizeOutcome::Daemon)
    }

    #[cfg(not(unix))]
    fn detach(&self, _pid_file: &PidFile) -> Result<DaemonizeOutcome, DaemonError> {
        Err(DaemonError::UnsupportedPlatform(
            "fork is not available on this platform".to_string(),
        ))
    }

    fn pid_root_writable(&self) -> bool {
        fs::create_dir_all(&self.pid_root).is_ok()
            && fs::metadata(&self.pid_root)
                .map(|meta| !meta.permissions().readonly())
                .unwrap_or(false)
    }
}

#[async_trait]
impl ProcessController for PosixController {
    fn family(&self) -> PlatformFamily {
        PlatformFamily::Posix
    }

    async fn preflight(&self, descriptor: &DaemonDescriptor) -> Result<(), DaemonError> {
        self.pid_file(descriptor).ensure_available()
    }

    async fn daemonize(
        &self,
        descriptor: &DaemonDescriptor,
    ) -> Result<DaemonizeOutcome, DaemonError> {
        let pid_file = self.pid_file(descriptor);
        pid_file.ensure_available()?;

        info!("Daemonizing {}", descriptor.name());
        self.detach(&pid_file)
    }

    async fn is_running(&self, descriptor: &DaemonDescriptor) -> Result<bool, DaemonError> {
        if self.flags.is_shutdown_requested() {
            return Ok(false);
        }

        let pid_file = self.pid_file(descriptor);
        let Some(pid) = pid_file.read_pid()? else {
            return Err(DaemonError::StaleState(format!(
                "Daemon pid file not found: {}",
                pid_file.path().display()
            )));
        };

        if !PidFile::is_process_running(pid) {
            return Err(DaemonError::StaleState(format!(
                "Daemon not responding (PID {})",
                pid
            )));
        }

        Ok(true)
    }

    async fn start(&self, descriptor: &DaemonDescriptor) -> Result<Option<u32>, DaemonError> {
        let args = self.launcher.run_args(descriptor.name());
        debug!(
            "Launching {} {}",
            self.launcher.program.display(),
            args.join(" ")
        );

        let output = tokio::process::Command::new(&self.launcher.program)
            .args(&args)
            .stdin(Stdio::null())
            .output()
            .await
            .map_err(|e| {
                DaemonError::ProcessControl(format!(
                    "Failed to execute {}: {}",
                    self.launcher.program.display(),
                    e
                ))
            })?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(DaemonError::ProcessControl(format!(
                "Failed to start daemon {}: {}",
                descriptor.name(),
                stderr.trim()
            )));
        }

        let stdout = String::from_utf8_lossy(&output.stdout);
        let pid = parse_forked_pid(&stdout);
        info!("Started daemon {} (PID: {:?})", descriptor.name(), pid);
        Ok(pid)
    }

    async fn stop(&self, descriptor: &DaemonDescriptor) -> Result<(), DaemonError> {
        let pid = self.pid_file(descriptor).read_pid()?.ok_or_else(|| {
            DaemonError::ProcessControl("Cannot find pid. Is daemon running?".to_string())
        })?;

        send_signal_to_pid(pid, DaemonSignal::Shutdown).map_err(|e| {
            DaemonError::ProcessControl(format!("Failed to send stop signal: {}", e))
        })
    }

    async fn die_daemon(&self, descriptor: &DaemonDescriptor) -> Result<(), DaemonError> {
        let pid_file = self.pid_file(descriptor);
        let Some(pid) = pid_file.take()? else {
            debug!("No pid file for {}, nothing to kill", descriptor.name());
            return Ok(());
        };

        if pid == std::process::id() {
            debug!("Pid file of {} named this process", descriptor.name());
            return Ok(());
        }

        if !PidFile::is_process_running(pid) {
            warn!(
                "Removed stale pid file of {} (PID {} not running)",
                descriptor.name(),
                pid
            );
            return Ok(());
        }

        send_signal_to_pid(pid, DaemonSignal::Kill)
    }

    async fn is_alive(&self, descriptor: &DaemonDescriptor) -> Result<bool, DaemonError> {
        Ok(self
            .pid_file(descriptor)
            .read_pid()?
            .is_some_and(PidFile::is_process_running))
    }

    fn requirements(&self) -> Vec<Requirement> {
        vec![
            Requirement::new("fork", "Process forking and session detach", cfg!(unix)),
            Requirement::new("signals", "POSIX signal delivery", cfg!(unix)),
            Requirement::new(
                "pid-root",
                format!("Writable pid root at {}", self.pid_root.display()),
                self.pid_root_writable(),
            ),
        ]
    }

    async fn stop_requested(&self) {
        self.flags.shutdown_notified().await
    }

    fn take_reload(&self) -> bool {
        self.flags.take_reload()
    }
}

/// Child pid from the forking parent's output.
fn parse_forked_pid(output: &str) -> Option<u32> {
    output.lines().find_map(|line| {
        line.trim()
            .strip_prefix(FORKED_PREFIX)
            .and_then(|rest| rest.trim().parse().ok())
    })
}

#[cfg(test)]
#[path = "posix_tests.rs"]
mod tests;
