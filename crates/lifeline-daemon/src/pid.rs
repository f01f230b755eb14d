//! PID file management for daemon processes.

use std::fs::{self, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};

use tracing::{debug, info, warn};

use crate::descriptor::DaemonDescriptor;
use crate::error::DaemonError;

/// Mode of the pid file itself.
pub const PID_FILE_MODE: u32 = 0o644;

/// Mode of the per-daemon pid directory.
pub const PID_DIR_MODE: u32 = 0o775;

/// PID file of a single daemon.
#[derive(Debug, Clone)]
pub struct PidFile {
    path: PathBuf,
}

impl PidFile {
    /// Create a new PID file manager.
    pub fn new<P: AsRef<Path>>(path: P) -> Self {
        Self {
            path: path.as_ref().to_path_buf(),
        }
    }

    /// PID file at `{pid_root}/{sanitized}/{sanitized}.pid`.
    pub fn for_daemon(pid_root: &Path, descriptor: &DaemonDescriptor) -> Self {
        Self::new(descriptor.pid_file_path(pid_root))
    }

    /// Get the PID file path.
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Check if a PID file exists.
    pub fn exists(&self) -> bool {
        self.path.exists()
    }

    /// Read the PID from the file.
    pub fn read_pid(&self) -> Result<Option<u32>, DaemonError> {
        if !self.exists() {
            return Ok(None);
        }

        let contents = fs::read_to_string(&self.path).map_err(|e| DaemonError::PidFileRead {
            path: self.path.clone(),
            reason: e.to_string(),
        })?;

        let contents = contents.trim();
        if contents.is_empty() {
            return Ok(None);
        }

        let pid = contents
            .parse::<u32>()
            .map_err(|e| DaemonError::PidFileRead {
                path: self.path.clone(),
                reason: format!("Invalid PID format: {}", e),
            })?;

        Ok(Some(pid))
    }

    /// Write the current process PID to the file.
    pub fn write_pid(&self) -> Result<(), DaemonError> {
        self.write_pid_value(std::process::id())
    }

    /// Write a specific PID value to the file.
    pub fn write_pid_value(&self, pid: u32) -> Result<(), DaemonError> {
        if let Some(parent) = self.path.parent() {
            self.ensure_directory(parent)?;
        }

        let mut file = OpenOptions::new()
            .write(true)
            .create(true)
            .truncate(true)
            .open(&self.path)
            .map_err(|e| DaemonError::PidFileCreation {
                path: self.path.clone(),
                reason: e.to_string(),
            })?;

        write!(file, "{}", pid).map_err(|e| DaemonError::PidFileCreation {
            path: self.path.clone(),
            reason: e.to_string(),
        })?;

        set_mode(&self.path, PID_FILE_MODE).map_err(|e| DaemonError::PidFileCreation {
            path: self.path.clone(),
            reason: format!("Could not chmod pid file: {}", e),
        })?;

        info!("PID file created: {} (PID: {})", self.path.display(), pid);
        Ok(())
    }

    fn ensure_directory(&self, dir: &Path) -> Result<(), DaemonError> {
        if dir.exists() {
            return Ok(());
        }

        fs::create_dir_all(dir).map_err(|e| DaemonError::PidFileCreation {
            path: self.path.clone(),
            reason: format!("Could not make pid file directory {}: {}", dir.display(), e),
        })?;

        set_mode(dir, PID_DIR_MODE).map_err(|e| DaemonError::PidFileCreation {
            path: self.path.clone(),
            reason: format!("Could not chmod pid file directory: {}", e),
        })
    }

    /// Remove the PID file.
    pub fn remove(&self) -> Result<(), DaemonError> {
        if !self.exists() {
            return Ok(());
        }

        fs::remove_file(&self.path).map_err(|e| DaemonError::PidFileRemoval {
            path: self.path.clone(),
            reason: e.to_string(),
        })?;

        info!("PID file removed: {}", self.path.display());
        Ok(())
    }

    /// Read the recorded PID and delete the file in one step.
    ///
    /// The file is removed even when its content cannot be parsed.
    pub fn take(&self) -> Result<Option<u32>, DaemonError> {
        let pid = self.read_pid();
        if self.exists() {
            debug!("Taking PID file: {}", self.path.display());
            self.remove()?;
        }
        pid
    }

    /// Check if a process with the given PID is running.
    #[cfg(unix)]
    pub fn is_process_running(pid: u32) -> bool {
        use nix::sys::signal::kill;
        use nix::unistd::Pid;

        let Ok(raw) = i32::try_from(pid) else {
            return false;
        };
        // Signal 0 only probes for existence
        kill(Pid::from_raw(raw), None).is_ok()
    }

    #[cfg(not(unix))]
    pub fn is_process_running(_pid: u32) -> bool {
        // No probe on non-Unix systems
        true
    }

    /// Refuse when a live process holds the file; clear it when stale.
    pub fn ensure_available(&self) -> Result<(), DaemonError> {
        if let Some(existing_pid) = self.read_pid()? {
            if Self::is_process_running(existing_pid) {
                return Err(DaemonError::AlreadyRunning {
                    path: self.path.clone(),
                    pid: existing_pid,
                });
            }

            warn!(
                "Removing stale PID file (PID {} not running): {}",
                existing_pid,
                self.path.display()
            );
            self.remove()?;
        }
        Ok(())
    }
}

#[cfg(unix)]
fn set_mode(path: &Path, mode: u32) -> std::io::Result<()> {
    use std::os::unix::fs::PermissionsExt;
    fs::set_permissions(path, fs::Permissions::from_mode(mode))
}

#[cfg(not(unix))]
fn set_mode(_path: &Path, _mode: u32) -> std::io::Result<()> {
    Ok(())
}

#[cfg(test)]
#[path = "pid_tests.rs"]
mod tests;
