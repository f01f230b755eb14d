//! Daemon programs: the work a supervised daemon performs each tick.
//!
//! The hosting binary registers its programs in a [`ProgramCatalog`]; the
//! supervision loop only ever sees a [`DaemonProgram`] trait object.

use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use lifeline_config::{Config, ConfigValidator, DaemonConfiguration, ValidationResult};

use crate::descriptor::DaemonDescriptor;
use crate::error::DaemonError;
use crate::scheduler::IntervalScheduler;

/// Daemon-specific logic driven by the supervision loop.
#[async_trait]
pub trait DaemonProgram: Send + Sync {
    /// Name, description and log destination.
    fn descriptor(&self) -> &DaemonDescriptor;

    /// Configuration used when neither the provider nor the registry has one.
    fn default_configuration(&self) -> DaemonConfiguration {
        DaemonConfiguration::default()
    }

    /// One work step. Only called while inside the configured time window.
    async fn execute(&mut self, ctx: &mut TickContext<'_>) -> anyhow::Result<()>;

    /// Drop transient caches between ticks.
    fn release_caches(&mut self) {}
}

/// What a work step may see and adjust during one tick.
pub struct TickContext<'a> {
    scheduler: &'a mut IntervalScheduler,
    configuration: &'a DaemonConfiguration,
    tick: u64,
}

impl<'a> TickContext<'a> {
    pub fn new(
        scheduler: &'a mut IntervalScheduler,
        configuration: &'a DaemonConfiguration,
        tick: u64,
    ) -> Self {
        Self {
            scheduler,
            configuration,
            tick,
        }
    }

    /// Back off: widen the polling interval.
    pub fn slow_down(&mut self) {
        self.scheduler.slow_down();
    }

    /// Return to the base polling interval.
    pub fn speed_up(&mut self) {
        self.scheduler.speed_up();
    }

    /// Current polling interval in seconds.
    pub fn interval(&self) -> f64 {
        self.scheduler.current()
    }

    pub fn configuration(&self) -> &DaemonConfiguration {
        self.configuration
    }

    /// 1-based tick counter.
    pub fn tick(&self) -> u64 {
        self.tick
    }
}

/// Source of per-daemon configuration entries.
pub trait ConfigurationProvider: Send + Sync {
    /// Entry for `name`, if one is configured.
    fn configuration(&self, name: &str) -> Result<Option<DaemonConfiguration>, DaemonError>;
}

impl ConfigurationProvider for Config {
    fn configuration(&self, name: &str) -> Result<Option<DaemonConfiguration>, DaemonError> {
        Ok(self.daemon(name).cloned())
    }
}

/// Merge program defaults, the provider entry and the stored blob, later wins.
pub fn effective_configuration(
    defaults: DaemonConfiguration,
    provided: Option<&DaemonConfiguration>,
    stored: Option<&DaemonConfiguration>,
) -> DaemonConfiguration {
    let mut effective = defaults;
    for layer in [provided, stored].into_iter().flatten() {
        effective.merge(layer);
    }
    effective
}

/// Validate an effective configuration before it drives a loop.
///
/// Returns the warning messages on success.
pub fn check_configuration(
    name: &str,
    configuration: &DaemonConfiguration,
) -> Result<Vec<String>, DaemonError> {
    let mut result = ValidationResult::default();
    ConfigValidator::validate_daemon(name, configuration, &mut result);
    result
        .into_result()
        .map(|warnings| {
            warnings
                .into_iter()
                .map(|w| format!("{}: {}", w.path, w.message))
                .collect()
        })
        .map_err(|e| DaemonError::InvalidConfiguration {
            name: name.to_string(),
            reason: e.to_string(),
        })
}

type ProgramFactory = Arc<dyn Fn() -> Box<dyn DaemonProgram> + Send + Sync>;

/// A program the hosting binary knows how to build.
#[derive(Clone)]
pub struct ProgramRegistration {
    name: String,
    description: String,
    factory: ProgramFactory,
}

impl ProgramRegistration {
    pub fn new<F>(name: impl Into<String>, description: impl Into<String>, factory: F) -> Self
    where
        F: Fn() -> Box<dyn DaemonProgram> + Send + Sync + 'static,
    {
        Self {
            name: name.into(),
            description: description.into(),
            factory: Arc::new(factory),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn description(&self) -> &str {
        &self.description
    }

    /// Build a fresh program instance.
    pub fn create(&self) -> Box<dyn DaemonProgram> {
        (self.factory)()
    }
}

impl fmt::Debug for ProgramRegistration {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ProgramRegistration")
            .field("name", &self.name)
            .field("description", &self.description)
            .finish_non_exhaustive()
    }
}

/// Registered programs, ordered by name.
#[derive(Debug, Clone, Default)]
pub struct ProgramCatalog {
    programs: BTreeMap<String, ProgramRegistration>,
}

impl ProgramCatalog {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a registration, replacing any previous one with the same name.
    pub fn register(&mut self, registration: ProgramRegistration) {
        self.programs
            .insert(registration.name.clone(), registration);
    }

    pub fn get(&self, name: &str) -> Option<&ProgramRegistration> {
        self.programs.get(name)
    }

    /// Build the program registered as `name`.
    pub fn create(&self, name: &str) -> Option<Box<dyn DaemonProgram>> {
        self.get(name).map(ProgramRegistration::create)
    }

    pub fn iter(&self) -> impl Iterator<Item = &ProgramRegistration> {
        self.programs.values()
    }

    pub fn len(&self) -> usize {
        self.programs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.programs.is_empty()
    }
}
