//! The supervision loop.
//!
//! A daemon moves through
//! `Registering -> Daemonizing -> Running -> ShuttingDown -> Unregistering -> Terminated`.
//! While running, every tick probes the controller, writes a heartbeat,
//! runs the program's work step when inside the time window, lets the
//! program drop its caches and then sleeps for the current interval. The
//! end-of-tick sleep is the only place the loop waits; a stop request ends
//! it early.

use std::fmt;
use std::sync::Arc;

use chrono::{Local, NaiveTime};
use lifeline_config::{DaemonConfiguration, WorkErrorPolicy};
use tracing::{debug, error, info, warn};

use crate::descriptor::DaemonDescriptor;
use crate::error::{DaemonError, ErrorKind};
use crate::os::{DaemonizeOutcome, ProcessController};
use crate::program::{
    check_configuration, effective_configuration, ConfigurationProvider, DaemonProgram,
    TickContext,
};
use crate::registry::DaemonRegistry;
use crate::scheduler::{is_in_window, IntervalScheduler, TimeWindow};

/// Lifecycle state of a [`DaemonLoop`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LoopState {
    Registering,
    Daemonizing,
    Running,
    ShuttingDown,
    Unregistering,
    Terminated,
}

impl fmt::Display for LoopState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            LoopState::Registering => "registering",
            LoopState::Daemonizing => "daemonizing",
            LoopState::Running => "running",
            LoopState::ShuttingDown => "shutting down",
            LoopState::Unregistering => "unregistering",
            LoopState::Terminated => "terminated",
        };
        f.write_str(label)
    }
}

/// Why the running phase ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StopReason {
    /// The controller reported a requested stop.
    Requested,
    /// The pid file is gone or names a dead process.
    Stale,
    /// The liveness probe itself failed.
    ProbeFailed,
}

/// How [`DaemonLoop::run`] finished.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LoopOutcome {
    /// This is the original process after a fork. It should report the
    /// child pid and exit.
    Detached { child_pid: u32 },
    /// The daemon went through the full shutdown path.
    Terminated { reason: StopReason, ticks: u64 },
}

type Clock = Arc<dyn Fn() -> NaiveTime + Send + Sync>;

/// Assembles a [`DaemonLoop`].
pub struct DaemonLoopBuilder {
    program: Box<dyn DaemonProgram>,
    controller: Arc<dyn ProcessController>,
    registry: DaemonRegistry,
    provider: Option<Arc<dyn ConfigurationProvider>>,
    policy: WorkErrorPolicy,
    clock: Clock,
}

impl DaemonLoopBuilder {
    pub fn new(
        program: Box<dyn DaemonProgram>,
        controller: Arc<dyn ProcessController>,
        registry: DaemonRegistry,
    ) -> Self {
        Self {
            program,
            controller,
            registry,
            provider: None,
            policy: WorkErrorPolicy::default(),
            clock: Arc::new(|| Local::now().time()),
        }
    }

    /// Source of per-daemon configuration entries.
    pub fn provider(mut self, provider: Arc<dyn ConfigurationProvider>) -> Self {
        self.provider = Some(provider);
        self
    }

    /// What to do when the work step fails.
    pub fn on_work_error(mut self, policy: WorkErrorPolicy) -> Self {
        self.policy = policy;
        self
    }

    /// Time of day used for window checks. Defaults to local time.
    pub fn clock<F>(mut self, clock: F) -> Self
    where
        F: Fn() -> NaiveTime + Send + Sync + 'static,
    {
        self.clock = Arc::new(clock);
        self
    }

    /// Resolve the effective configuration and build the loop.
    pub async fn bootstrap(self) -> Result<DaemonLoop, DaemonError> {
        let mut daemon = DaemonLoop {
            program: self.program,
            controller: self.controller,
            registry: self.registry,
            provider: self.provider,
            policy: self.policy,
            clock: self.clock,
            configuration: DaemonConfiguration::default(),
            scheduler: IntervalScheduler::from_configuration(&DaemonConfiguration::default()),
            window: None,
            state: LoopState::Registering,
            history: Vec::new(),
        };
        daemon.resolve_configuration().await?;
        debug!(
            "Bootstrapped {} (interval {}s, max {}s)",
            daemon.program.descriptor().name(),
            daemon.scheduler.base(),
            daemon.scheduler.max()
        );
        Ok(daemon)
    }
}

/// A bootstrapped daemon, ready to [`run`](DaemonLoop::run).
pub struct DaemonLoop {
    program: Box<dyn DaemonProgram>,
    controller: Arc<dyn ProcessController>,
    registry: DaemonRegistry,
    provider: Option<Arc<dyn ConfigurationProvider>>,
    policy: WorkErrorPolicy,
    clock: Clock,
    configuration: DaemonConfiguration,
    scheduler: IntervalScheduler,
    window: Option<TimeWindow>,
    state: LoopState,
    history: Vec<LoopState>,
}

impl DaemonLoop {
    pub fn descriptor(&self) -> &DaemonDescriptor {
        self.program.descriptor()
    }

    /// Effective configuration currently driving the loop.
    pub fn configuration(&self) -> &DaemonConfiguration {
        &self.configuration
    }

    pub fn scheduler(&self) -> &IntervalScheduler {
        &self.scheduler
    }

    pub fn window(&self) -> Option<&TimeWindow> {
        self.window.as_ref()
    }

    pub fn state(&self) -> LoopState {
        self.state
    }

    /// Every state entered so far, in order.
    pub fn history(&self) -> &[LoopState] {
        &self.history
    }

    /// Register, daemonize and supervise until stopped.
    ///
    /// In the parent of a fork this returns [`LoopOutcome::Detached`] right
    /// after daemonizing. A live instance found by the controller's preflight
    /// stops the run before the registry is written. A registry failure
    /// during registration is fatal; later registry failures are logged and
    /// the loop carries on.
    pub async fn run(&mut self) -> Result<LoopOutcome, DaemonError> {
        let descriptor = self.program.descriptor().clone();
        let name = descriptor.name().to_string();
        if !self.history.is_empty() {
            return Err(DaemonError::ProcessControl(format!(
                "Daemon loop for {} already ran",
                name
            )));
        }

        self.enter(LoopState::Registering);
        self.controller.preflight(&descriptor).await?;
        self.registry.register(&name, &self.configuration).await?;
        if let Err(e) = self.registry.close().await {
            warn!("Could not close registry before daemonizing: {}", e);
        }

        info!("Starting daemon {}", name);
        self.enter(LoopState::Daemonizing);
        if let DaemonizeOutcome::Parent { child_pid } =
            self.controller.daemonize(&descriptor).await?
        {
            return Ok(LoopOutcome::Detached { child_pid });
        }

        self.enter(LoopState::Running);
        let mut ticks = 0u64;
        let mut work_failure = None;
        let reason = loop {
            if self.controller.take_reload() {
                info!("Reloading configuration of {}", name);
                if let Err(e) = self.resolve_configuration().await {
                    warn!("Reload of {} failed, keeping previous configuration: {}", name, e);
                }
            }

            match self.controller.is_running(&descriptor).await {
                Ok(true) => {}
                Ok(false) => {
                    info!("Stop requested for daemon {}", name);
                    break StopReason::Requested;
                }
                Err(e) if e.kind() == ErrorKind::StaleState => {
                    warn!("Daemon {} lost its process state: {}", name, e);
                    break StopReason::Stale;
                }
                Err(e) => {
                    error!("Liveness probe for {} failed: {}", name, e);
                    break StopReason::ProbeFailed;
                }
            }

            if let Err(e) = self.registry.heartbeat(&name).await {
                error!("Heartbeat for {} failed: {}", name, e);
            }

            ticks += 1;
            if is_in_window(self.window.as_ref(), (self.clock)()) {
                let mut ctx = TickContext::new(&mut self.scheduler, &self.configuration, ticks);
                if let Err(e) = self.program.execute(&mut ctx).await {
                    error!("Work step of {} failed: {:#}", name, e);
                    if self.policy == WorkErrorPolicy::Terminate {
                        work_failure = Some(e);
                        break StopReason::Requested;
                    }
                }
            } else {
                debug!("Outside the time window of {}, skipping work", name);
            }

            self.program.release_caches();

            let pause = self.scheduler.sleep_duration();
            debug!("Sleeping for {} seconds", pause.as_secs());
            tokio::select! {
                _ = tokio::time::sleep(pause) => {}
                _ = self.controller.stop_requested() => {
                    debug!("Sleep of {} cut short by a stop request", name);
                }
            }
        };

        self.enter(LoopState::ShuttingDown);
        info!("Shutting down daemon {}", name);

        self.enter(LoopState::Unregistering);
        if let Err(e) = self.registry.unregister(&name).await {
            error!("Unregistering {} failed: {}", name, e);
        }

        self.enter(LoopState::Terminated);
        if let Err(e) = self.controller.die_daemon(&descriptor).await {
            warn!("Final cleanup of {} failed: {}", name, e);
        }

        match work_failure {
            Some(source) => Err(DaemonError::Work { name, source }),
            None => Ok(LoopOutcome::Terminated { reason, ticks }),
        }
    }

    fn enter(&mut self, state: LoopState) {
        debug!("Daemon {} is {}", self.program.descriptor().name(), state);
        self.state = state;
        self.history.push(state);
    }

    /// Recompute configuration, scheduler and window. Leaves the current
    /// ones untouched on error.
    async fn resolve_configuration(&mut self) -> Result<(), DaemonError> {
        let name = self.program.descriptor().name().to_string();
        let provided = match &self.provider {
            Some(provider) => provider.configuration(&name)?,
            None => None,
        };
        let stored = self.registry.stored_configuration(&name).await?;

        let configuration = effective_configuration(
            self.program.default_configuration(),
            provided.as_ref(),
            stored.as_ref(),
        );
        for warning in check_configuration(&name, &configuration)? {
            debug!("{}", warning);
        }

        self.scheduler = IntervalScheduler::from_configuration(&configuration);
        self.window = TimeWindow::from_configuration(&configuration);
        self.configuration = configuration;
        Ok(())
    }
}

#[cfg(test)]
#[path = "daemon_loop_tests.rs"]
mod tests;
