//! CLI definitions for Lifeline.

use std::path::PathBuf;

use clap::{Parser, Subcommand};

/// Lifeline CLI.
#[derive(Debug, Parser)]
#[command(name = "lifeline")]
#[command(about = "Supervisor for long-running background daemons")]
#[command(version)]
pub(crate) struct Cli {
    /// Configuration file path (default: config/{env}.toml when present)
    #[arg(short, long, global = true)]
    pub config: Option<PathBuf>,

    /// Application environment
    #[arg(short, long, global = true, env = "LIFELINE_ENV")]
    pub env: Option<String>,

    /// Verbose diagnostic output
    #[arg(short, long, global = true)]
    pub verbose: bool,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Debug, Subcommand)]
pub(crate) enum Commands {
    /// Run a daemon: register, detach and supervise it
    Run {
        /// Registered daemon name
        name: String,
    },

    /// Launch a daemon in the background
    Start {
        /// Registered daemon name
        name: String,
    },

    /// Ask a running daemon to stop
    Stop {
        /// Registered daemon name
        name: String,
    },

    /// Show registry timestamps, liveness and health
    Status {
        /// Registered daemon name
        name: String,

        /// Print the report as JSON
        #[arg(long)]
        json: bool,
    },

    /// Store a new configuration for a daemon's next run
    Configure {
        /// Registered daemon name
        name: String,

        /// Base polling interval in seconds
        #[arg(long)]
        interval: Option<f64>,

        /// Maximum polling interval in seconds
        #[arg(long)]
        max_interval: Option<f64>,

        /// Start of the daily time window (HH:MM)
        #[arg(long)]
        run_start: Option<String>,

        /// End of the daily time window (HH:MM)
        #[arg(long)]
        run_end: Option<String>,
    },

    /// Check the platform capabilities daemons need
    Requirements {
        /// Operating system to check instead of the host (e.g. linux, windows)
        #[arg(long)]
        os: Option<String>,
    },

    /// List registered daemons
    List,
}

impl Commands {
    /// Daemon the command acts on, if any.
    pub(crate) fn daemon_name(&self) -> Option<&str> {
        match self {
            Commands::Run { name }
            | Commands::Start { name }
            | Commands::Stop { name }
            | Commands::Status { name, .. }
            | Commands::Configure { name, .. } => Some(name),
            Commands::Requirements { .. } | Commands::List => None,
        }
    }
}

/// Rewrite single-dash long flags into the form clap expects.
///
/// `-verbose` becomes `--verbose`; everything else passes through.
pub(crate) fn normalize_args<I>(args: I) -> Vec<String>
where
    I: IntoIterator<Item = String>,
{
    args.into_iter()
        .map(|arg| match arg.as_str() {
            "-verbose" => "--verbose".to_string(),
            _ => arg,
        })
        .collect()
}
