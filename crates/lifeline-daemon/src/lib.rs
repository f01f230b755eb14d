//! # Lifeline Daemon
//!
//! Supervision core for long-running background programs.
//!
//! ## Features
//!
//! - Adaptive polling interval with capped backoff and a daily time window
//! - PID files that prevent duplicate instances
//! - Signal handling (SIGTERM/SIGINT stop, SIGHUP reload, SIGCHLD reaping)
//! - Process control behind one trait, with POSIX fork and Windows service variants
//! - Persisted registry of start and heartbeat timestamps (SQLite or in-memory)
//! - Health classification for external monitors
//!
//! ## Usage
//!
//! ```rust,ignore
//! use lifeline_daemon::{ControllerFactory, DaemonLoopBuilder, DaemonRegistry, SqliteStore};
//!
//! let controller = factory.controller(None)?;
//! let registry = DaemonRegistry::new(Arc::new(SqliteStore::new(db_path)));
//! let mut daemon = DaemonLoopBuilder::new(program, controller, registry)
//!     .provider(Arc::new(config))
//!     .bootstrap()
//!     .await?;
//! daemon.run().await?;
//! ```

pub mod daemon_loop;
pub mod descriptor;
pub mod error;
pub mod health;
pub mod os;
pub mod pid;
pub mod program;
pub mod registry;
pub mod scheduler;
pub mod signal;

// Re-exports
pub use daemon_loop::{DaemonLoop, DaemonLoopBuilder, LoopOutcome, LoopState, StopReason};
pub use descriptor::{sanitize, DaemonDescriptor};
pub use error::{DaemonError, ErrorKind};
pub use health::{HealthReport, HealthState};
pub use os::{
    ControllerFactory, ControllerSettings, DaemonizeOutcome, LaunchCommand, Platform,
    PlatformFamily, PosixController, ProcessController, Requirement, WindowsController,
    FORKED_PREFIX,
};
pub use pid::PidFile;
pub use program::{
    ConfigurationProvider, DaemonProgram, ProgramCatalog, ProgramRegistration, TickContext,
};
pub use registry::{DaemonRecord, DaemonRegistry, DaemonStatus, DaemonStore, MemoryStore, SqliteStore};
pub use scheduler::{is_in_window, IntervalScheduler, TimeWindow};
pub use signal::{DaemonSignal, SignalFlags};
