//! Platform detection and controller construction.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;

use once_cell::sync::OnceCell;
use parking_lot::Mutex;
use tracing::debug;

use super::{
    LaunchCommand, Platform, PlatformFamily, PosixController, ProcessController, Requirement,
    WindowsController,
};
use crate::error::DaemonError;

/// What a controller needs to be built.
#[derive(Debug, Clone)]
pub struct ControllerSettings {
    pub pid_root: PathBuf,
    pub launcher: LaunchCommand,
}

/// Detects the host platform once and hands out one controller per family.
///
/// Owned by the caller and passed where needed; nothing here is global.
pub struct ControllerFactory {
    settings: ControllerSettings,
    platform: OnceCell<Platform>,
    controllers: Mutex<HashMap<PlatformFamily, Arc<dyn ProcessController>>>,
}

impl ControllerFactory {
    pub fn new(settings: ControllerSettings) -> Self {
        Self {
            settings,
            platform: OnceCell::new(),
            controllers: Mutex::new(HashMap::new()),
        }
    }

    /// Factory that reports `platform` instead of probing the host.
    pub fn with_platform(settings: ControllerSettings, platform: Platform) -> Self {
        let factory = Self::new(settings);
        let _ = factory.platform.set(platform);
        factory
    }

    /// Host platform, probed on first use.
    pub fn determine_os(&self) -> &Platform {
        self.platform.get_or_init(|| {
            let platform = Platform::detect();
            debug!("Detected operating system: {}", platform);
            platform
        })
    }

    /// Controller for `os`, or for the host when `None`.
    ///
    /// Built on first request and reused afterwards.
    pub fn controller(&self, os: Option<&str>) -> Result<Arc<dyn ProcessController>, DaemonError> {
        let family = match os {
            Some(name) => Platform::named(name).family()?,
            None => self.determine_os().family()?,
        };

        let mut controllers = self.controllers.lock();
        let controller = controllers
            .entry(family)
            .or_insert_with(|| self.build(family))
            .clone();
        Ok(controller)
    }

    /// Requirement report of the controller for `os`.
    pub fn requirements(&self, os: Option<&str>) -> Result<Vec<Requirement>, DaemonError> {
        Ok(self.controller(os)?.requirements())
    }

    fn build(&self, family: PlatformFamily) -> Arc<dyn ProcessController> {
        debug!("Building {} process controller", family);
        match family {
            PlatformFamily::Posix => Arc::new(PosixController::new(
                self.settings.pid_root.clone(),
                self.settings.launcher.clone(),
            )),
            PlatformFamily::Windows => {
                Arc::new(WindowsController::new(self.settings.launcher.clone()))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn settings() -> ControllerSettings {
        ControllerSettings {
            pid_root: PathBuf::from("/tmp/lifeline-factory-test"),
            launcher: LaunchCommand::new("/usr/bin/lifeline", "testing"),
        }
    }

    #[test]
    fn test_determine_os_is_cached() {
        let factory = ControllerFactory::new(settings());
        let first = factory.determine_os() as *const Platform;
        let second = factory.determine_os() as *const Platform;
        assert_eq!(first, second);
        assert_eq!(factory.determine_os().name(), std::env::consts::OS);
    }

    #[test]
    fn test_controller_is_memoized() {
        let factory = ControllerFactory::with_platform(settings(), Platform::named("linux"));
        let first = factory.controller(None).unwrap();
        let second = factory.controller(None).unwrap();
        assert!(Arc::ptr_eq(&first, &second));
        assert_eq!(first.family(), PlatformFamily::Posix);
    }

    #[test]
    fn test_explicit_os_selects_family() {
        let factory = ControllerFactory::with_platform(settings(), Platform::named("linux"));
        let windows = factory.controller(Some("Windows")).unwrap();
        assert_eq!(windows.family(), PlatformFamily::Windows);

        let posix = factory.controller(None).unwrap();
        assert!(!Arc::ptr_eq(&windows, &posix));
    }

    #[test]
    fn test_unsupported_platform() {
        let factory = ControllerFactory::with_platform(settings(), Platform::named("plan9"));
        assert!(matches!(
            factory.controller(None),
            Err(DaemonError::UnsupportedPlatform(_))
        ));
    }

    #[test]
    fn test_requirements_for_windows() {
        let factory = ControllerFactory::with_platform(settings(), Platform::named("linux"));
        let requirements = factory.requirements(Some("windows")).unwrap();
        assert!(requirements.iter().any(|r| r.name == "sc.exe"));
    }
}
