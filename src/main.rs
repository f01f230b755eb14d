//! Lifeline - supervisor for long-running background daemons.
//!
//! Main entry point for the Lifeline CLI.

mod cli;
mod cmd_daemon;
mod programs;
mod register;

use std::path::PathBuf;

use clap::Parser;
use tracing::{debug, warn};
use tracing_appender::rolling::{RollingFileAppender, Rotation};
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use lifeline_config::{default_environment, ConfigLoader, ConfigValidator};
use lifeline_daemon::ProgramCatalog;

use crate::cli::{normalize_args, Cli, Commands};
use crate::cmd_daemon::{handle_command, Context};
use crate::register::program_catalog;

/// Directory and file stem of a daemon's log file.
#[derive(Debug, PartialEq)]
struct LogTarget {
    dir: PathBuf,
    stem: String,
}

/// Only `run` logs to a file: `{log_dir}/{sanitized name}.log`.
fn log_target(command: &Commands, catalog: &ProgramCatalog) -> Option<LogTarget> {
    if !matches!(command, Commands::Run { .. }) {
        return None;
    }
    let program = catalog.create(command.daemon_name()?)?;
    let descriptor = program.descriptor();
    descriptor.log_dir().map(|dir| LogTarget {
        dir: dir.to_path_buf(),
        stem: descriptor.sanitized_name(),
    })
}

fn init_tracing(verbose: bool, target: Option<LogTarget>) -> anyhow::Result<()> {
    // The file writer is blocking: a background writer thread would not
    // survive the fork into the daemon process.
    let file_layer = match target {
        Some(target) => {
            std::fs::create_dir_all(&target.dir)?;
            let appender = RollingFileAppender::builder()
                .rotation(Rotation::NEVER)
                .filename_prefix(target.stem)
                .filename_suffix("log")
                .build(&target.dir)?;
            Some(fmt::layer().with_writer(appender).with_ansi(false))
        }
        None => None,
    };

    let default_level = if verbose { "debug" } else { "info" };
    let env_filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));

    tracing_subscriber::registry()
        .with(env_filter)
        .with(fmt::layer().with_target(true).with_ansi(true))
        .with(file_layer)
        .init();

    Ok(())
}

#[tokio::main(flavor = "current_thread")]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse_from(normalize_args(std::env::args()));

    let environment = cli.env.clone().unwrap_or_else(default_environment);
    let config_path = cli.config.as_deref().map(std::path::absolute).transpose()?;
    let config = ConfigLoader::load_for_environment(&environment, config_path.as_deref())?;
    let warnings = ConfigValidator::validate(&config)?.into_result()?;

    let catalog = program_catalog(config.runtime.log_dir_path());
    init_tracing(cli.verbose, log_target(&cli.command, &catalog))?;

    for warning in warnings {
        warn!("Config {}: {}", warning.path, warning.message);
    }
    debug!("Environment: {}", environment);

    let ctx = Context::new(config, config_path, catalog)?;
    handle_command(cli.command, &ctx).await
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_log_target_for_run() {
        let catalog = program_catalog(Some(PathBuf::from("/tmp/lifeline-logs")));
        let command = Commands::Run {
            name: "daemon:cac:test".to_string(),
        };
        assert_eq!(
            log_target(&command, &catalog),
            Some(LogTarget {
                dir: PathBuf::from("/tmp/lifeline-logs"),
                stem: "daemon_cac_test".to_string(),
            })
        );
    }

    #[test]
    fn test_no_log_target_without_log_dir_or_for_other_commands() {
        let catalog = program_catalog(None);
        let run = Commands::Run {
            name: "daemon:cac:test".to_string(),
        };
        assert_eq!(log_target(&run, &catalog), None);

        let catalog = program_catalog(Some(PathBuf::from("/tmp/lifeline-logs")));
        assert_eq!(log_target(&Commands::List, &catalog), None);
        let unknown = Commands::Run {
            name: "daemon:missing".to_string(),
        };
        assert_eq!(log_target(&unknown, &catalog), None);
    }
}
