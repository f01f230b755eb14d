//! Signal handling for daemon processes.
//!
//! Signal tasks only flip atomic flags or reap children. The loop reads the
//! flags at the top of each tick.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use tokio::sync::Notify;
use tracing::{debug, info};

use crate::error::DaemonError;

/// Signal type for daemon control.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DaemonSignal {
    /// Graceful shutdown (SIGTERM, SIGINT).
    Shutdown,
    /// Reload configuration (SIGHUP).
    Reload,
    /// Unmaskable kill (SIGKILL).
    Kill,
}

impl std::fmt::Display for DaemonSignal {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            DaemonSignal::Shutdown => write!(f, "SHUTDOWN"),
            DaemonSignal::Reload => write!(f, "RELOAD"),
            DaemonSignal::Kill => write!(f, "KILL"),
        }
    }
}

/// Cancellation and reload flags shared with the signal tasks.
#[derive(Debug, Clone, Default)]
pub struct SignalFlags {
    shutdown_requested: Arc<AtomicBool>,
    reload_requested: Arc<AtomicBool>,
    shutdown_notify: Arc<Notify>,
}

impl SignalFlags {
    pub fn new() -> Self {
        Self::default()
    }

    /// Request shutdown.
    pub fn request_shutdown(&self) {
        debug!("Shutdown requested");
        self.shutdown_requested.store(true, Ordering::SeqCst);
        self.shutdown_notify.notify_one();
    }

    /// Request configuration reload.
    pub fn request_reload(&self) {
        debug!("Reload requested");
        self.reload_requested.store(true, Ordering::SeqCst);
    }

    /// Check if shutdown has been requested.
    pub fn is_shutdown_requested(&self) -> bool {
        self.shutdown_requested.load(Ordering::SeqCst)
    }

    /// Check if reload has been requested.
    pub fn is_reload_requested(&self) -> bool {
        self.reload_requested.load(Ordering::SeqCst)
    }

    /// Wait until shutdown has been requested.
    pub async fn shutdown_notified(&self) {
        if self.is_shutdown_requested() {
            return;
        }
        self.shutdown_notify.notified().await;
    }

    /// Consume a pending reload request.
    pub fn take_reload(&self) -> bool {
        self.reload_requested.swap(false, Ordering::SeqCst)
    }

    /// Install OS signal tasks (Unix).
    ///
    /// Must be called from within a tokio runtime, after any fork.
    #[cfg(unix)]
    pub fn install(&self) -> Result<(), DaemonError> {
        use tokio::signal::unix::{SignalKind, signal};

        let mut sigterm =
            signal(SignalKind::terminate()).map_err(|e| DaemonError::SignalSetup(e.to_string()))?;
        let flags = self.clone();
        tokio::spawn(async move {
            while sigterm.recv().await.is_some() {
                info!("Received SIGTERM");
                flags.request_shutdown();
            }
        });

        let mut sigint =
            signal(SignalKind::interrupt()).map_err(|e| DaemonError::SignalSetup(e.to_string()))?;
        let flags = self.clone();
        tokio::spawn(async move {
            while sigint.recv().await.is_some() {
                info!("Received SIGINT");
                flags.request_shutdown();
            }
        });

        let mut sighup =
            signal(SignalKind::hangup()).map_err(|e| DaemonError::SignalSetup(e.to_string()))?;
        let flags = self.clone();
        tokio::spawn(async move {
            while sighup.recv().await.is_some() {
                info!("Received SIGHUP - requesting config reload");
                flags.request_reload();
            }
        });

        let mut sigchld =
            signal(SignalKind::child()).map_err(|e| DaemonError::SignalSetup(e.to_string()))?;
        tokio::spawn(async move {
            while sigchld.recv().await.is_some() {
                let reaped = reap_children();
                debug!("Reaped {} child process(es)", reaped);
            }
        });

        info!("OS signal handlers installed (SIGTERM, SIGINT, SIGHUP, SIGCHLD)");
        Ok(())
    }

    /// Install OS signal tasks (non-Unix fallback).
    #[cfg(not(unix))]
    pub fn install(&self) -> Result<(), DaemonError> {
        let flags = self.clone();

        tokio::spawn(async move {
            if let Ok(()) = tokio::signal::ctrl_c().await {
                info!("Received Ctrl+C");
                flags.request_shutdown();
            }
        });

        info!("OS signal handlers installed (Ctrl+C only)");
        Ok(())
    }
}

/// Reap every child that has already terminated, without blocking.
///
/// Returns the number of children reaped.
#[cfg(unix)]
pub fn reap_children() -> usize {
    use nix::sys::wait::{WaitPidFlag, WaitStatus, waitpid};
    use nix::unistd::Pid;

    let mut reaped = 0;
    loop {
        match waitpid(Pid::from_raw(-1), Some(WaitPidFlag::WNOHANG)) {
            Ok(WaitStatus::StillAlive) | Err(_) => break,
            Ok(_) => reaped += 1,
        }
    }
    reaped
}

#[cfg(not(unix))]
pub fn reap_children() -> usize {
    0
}

/// Send a signal to a running daemon process.
#[cfg(unix)]
pub fn send_signal_to_pid(pid: u32, signal: DaemonSignal) -> Result<(), DaemonError> {
    use nix::sys::signal::{Signal, kill};
    use nix::unistd::Pid;

    let nix_signal = match signal {
        DaemonSignal::Shutdown => Signal::SIGTERM,
        DaemonSignal::Reload => Signal::SIGHUP,
        DaemonSignal::Kill => Signal::SIGKILL,
    };

    let raw = i32::try_from(pid)
        .map_err(|_| DaemonError::ProcessControl(format!("PID {} out of range", pid)))?;

    kill(Pid::from_raw(raw), nix_signal).map_err(|e| {
        DaemonError::ProcessControl(format!("Failed to send {} to PID {}: {}", signal, pid, e))
    })?;

    info!("Sent {} to PID {}", signal, pid);
    Ok(())
}

#[cfg(not(unix))]
pub fn send_signal_to_pid(_pid: u32, _signal: DaemonSignal) -> Result<(), DaemonError> {
    Err(DaemonError::UnsupportedPlatform(
        "signals are not available on this platform".to_string(),
    ))
}

#[cfg(test)]
#[path = "signal_tests.rs"]
mod tests;
