//! Daemon subcommand handlers for Lifeline.

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{anyhow, bail, Context as _};
use chrono::Utc;
use tracing::{debug, info, warn};

use lifeline_config::{Config, ConfigLoader, DaemonConfiguration};
use lifeline_daemon::program::{check_configuration, effective_configuration};
use lifeline_daemon::{
    ConfigurationProvider, ControllerFactory, ControllerSettings, DaemonError, DaemonLoopBuilder,
    DaemonProgram, DaemonRegistry, HealthReport, LaunchCommand, LoopOutcome, MemoryStore,
    ProgramCatalog, SqliteStore, FORKED_PREFIX,
};

use crate::cli::Commands;

/// Everything a command handler needs.
pub(crate) struct Context {
    pub config: Config,
    pub config_path: Option<PathBuf>,
    pub catalog: ProgramCatalog,
    pub factory: ControllerFactory,
}

impl Context {
    pub(crate) fn new(
        config: Config,
        config_path: Option<PathBuf>,
        catalog: ProgramCatalog,
    ) -> anyhow::Result<Self> {
        let launcher = LaunchCommand::current(&config.runtime.environment, config_path.clone())?;
        let factory = ControllerFactory::new(ControllerSettings {
            pid_root: config.runtime.pid_root_path(),
            launcher,
        });
        Ok(Self {
            config,
            config_path,
            catalog,
            factory,
        })
    }

    fn program(&self, name: &str) -> anyhow::Result<Box<dyn DaemonProgram>> {
        self.catalog.create(name).ok_or_else(|| {
            anyhow!(
                "Unknown daemon `{}`. Use `lifeline list` to see registered daemons",
                name
            )
        })
    }

    fn registry(&self) -> DaemonRegistry {
        open_registry(&self.config)
    }

    fn provider(&self) -> Arc<dyn ConfigurationProvider> {
        Arc::new(FileProvider {
            environment: self.config.runtime.environment.clone(),
            path: self.config_path.clone(),
            fallback: self.config.clone(),
        })
    }
}

/// Registry backend selected by `[registry] path`.
pub(crate) fn open_registry(config: &Config) -> DaemonRegistry {
    if config.registry.is_in_memory() {
        debug!("Using in-memory registry");
        DaemonRegistry::new(Arc::new(MemoryStore::new()))
    } else {
        DaemonRegistry::new(Arc::new(SqliteStore::new(config.registry.database_path())))
    }
}

/// Re-reads the configuration file on every lookup so reloads see edits.
struct FileProvider {
    environment: String,
    path: Option<PathBuf>,
    fallback: Config,
}

impl ConfigurationProvider for FileProvider {
    fn configuration(&self, name: &str) -> Result<Option<DaemonConfiguration>, DaemonError> {
        match ConfigLoader::load_for_environment(&self.environment, self.path.as_deref()) {
            Ok(config) => Ok(config.daemon(name).cloned()),
            Err(e) => {
                warn!("Could not re-read configuration, using the loaded one: {}", e);
                self.fallback.configuration(name)
            }
        }
    }
}

/// Dispatch a daemon command.
pub(crate) async fn handle_command(command: Commands, ctx: &Context) -> anyhow::Result<()> {
    match command {
        Commands::Run { name } => daemon_run(ctx, &name).await,
        Commands::Start { name } => daemon_start(ctx, &name).await,
        Commands::Stop { name } => daemon_stop(ctx, &name).await,
        Commands::Status { name, json } => daemon_status(ctx, &name, json).await,
        Commands::Configure {
            name,
            interval,
            max_interval,
            run_start,
            run_end,
        } => {
            let overlay = DaemonConfiguration {
                interval,
                max_interval,
                run_start,
                run_end,
                ..Default::default()
            };
            daemon_configure(ctx, &name, overlay).await
        }
        Commands::Requirements { os } => requirements(ctx, os.as_deref()),
        Commands::List => list(ctx),
    }
}

/// Bootstrap and run a daemon in this process.
async fn daemon_run(ctx: &Context, name: &str) -> anyhow::Result<()> {
    let program = ctx.program(name)?;
    let controller = ctx.factory.controller(None)?;

    let mut daemon = DaemonLoopBuilder::new(program, controller, ctx.registry())
        .provider(ctx.provider())
        .on_work_error(ctx.config.supervision.on_work_error)
        .bootstrap()
        .await
        .with_context(|| format!("Cannot bootstrap daemon {}", name))?;

    match daemon.run().await? {
        LoopOutcome::Detached { child_pid } => {
            println!("{} {}", FORKED_PREFIX, child_pid);
        }
        LoopOutcome::Terminated { reason, ticks } => {
            info!(
                "Daemon {} terminated after {} ticks ({:?})",
                name, ticks, reason
            );
        }
    }
    Ok(())
}

/// Launch the daemon in the background.
async fn daemon_start(ctx: &Context, name: &str) -> anyhow::Result<()> {
    let program = ctx.program(name)?;
    let controller = ctx.factory.controller(None)?;

    match controller.start(program.descriptor()).await? {
        Some(pid) => println!("Daemon {} started (PID {})", name, pid),
        None => println!("Daemon {} start requested", name),
    }
    Ok(())
}

/// Ask the daemon to stop.
async fn daemon_stop(ctx: &Context, name: &str) -> anyhow::Result<()> {
    let program = ctx.program(name)?;
    let controller = ctx.factory.controller(None)?;

    controller.stop(program.descriptor()).await?;
    println!("Stop requested for daemon {}", name);
    Ok(())
}

/// Print registry timestamps, liveness and the health classification.
async fn daemon_status(ctx: &Context, name: &str, json: bool) -> anyhow::Result<()> {
    let program = ctx.program(name)?;
    let controller = ctx.factory.controller(None)?;
    let registry = ctx.registry();

    let status = registry.status(name).await?;
    let alive = match controller.is_alive(program.descriptor()).await {
        Ok(alive) => alive,
        Err(e) => {
            debug!("Liveness probe for {} failed: {}", name, e);
            false
        }
    };

    let stored = registry.stored_configuration(name).await?;
    let provided = ctx.provider().configuration(name)?;
    let configuration = effective_configuration(
        program.default_configuration(),
        provided.as_ref(),
        stored.as_ref(),
    );

    let report = HealthReport::classify(
        &status,
        alive,
        Utc::now(),
        configuration.effective_max_interval(),
        ctx.config.supervision.stall_factor,
    );

    if json {
        println!("{}", serde_json::to_string_pretty(&report)?);
        return Ok(());
    }

    let show = |value: Option<chrono::DateTime<Utc>>| {
        value
            .map(|t| t.to_rfc3339())
            .unwrap_or_else(|| "-".to_string())
    };
    println!("Daemon:    {}", name);
    println!("State:     {}", report.state);
    println!("Started:   {}", show(report.started));
    println!("Heartbeat: {}", show(report.heartbeat));
    if let Some(age) = report.heartbeat_age {
        println!("Age:       {}s (stalled after {}s)", age, report.stall_threshold);
    }
    Ok(())
}

/// Persist a new configuration for the daemon's next run.
async fn daemon_configure(
    ctx: &Context,
    name: &str,
    overlay: DaemonConfiguration,
) -> anyhow::Result<()> {
    let program = ctx.program(name)?;
    let registry = ctx.registry();

    let mut configuration = match registry.stored_configuration(name).await? {
        Some(stored) => stored,
        None => {
            let provided = ctx.provider().configuration(name)?;
            effective_configuration(program.default_configuration(), provided.as_ref(), None)
        }
    };
    configuration.merge(&overlay);

    for warning in check_configuration(name, &configuration)? {
        warn!("{}", warning);
    }
    registry.store_configuration(name, &configuration).await?;
    registry.close().await?;

    println!(
        "Stored configuration for {}: {}",
        name,
        serde_json::to_string(&configuration)?
    );
    Ok(())
}

/// Print the capability report; fail when anything is missing.
fn requirements(ctx: &Context, os: Option<&str>) -> anyhow::Result<()> {
    let requirements = ctx.factory.requirements(os)?;

    for requirement in &requirements {
        let mark = if requirement.present { "ok" } else { "missing" };
        println!(
            "[{:>7}] {} - {}",
            mark, requirement.name, requirement.description
        );
    }

    let missing: Vec<_> = requirements
        .iter()
        .filter(|r| !r.present)
        .map(|r| r.name.as_str())
        .collect();
    if !missing.is_empty() {
        bail!("Missing requirements: {}", missing.join(", "));
    }
    Ok(())
}

/// Print every registered program.
fn list(ctx: &Context) -> anyhow::Result<()> {
    if ctx.catalog.is_empty() {
        println!("No daemons registered");
        return Ok(());
    }

    for registration in ctx.catalog.iter() {
        let program = registration.create();
        let log = program
            .descriptor()
            .log_file()
            .map(|path| path.display().to_string())
            .unwrap_or_else(|| "-".to_string());
        println!(
            "{}\t{}\t{}",
            registration.name(),
            registration.description(),
            log
        );
    }
    Ok(())
}
