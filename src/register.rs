//! Program registration for Lifeline.

use std::path::PathBuf;

use lifeline_daemon::{ProgramCatalog, ProgramRegistration};

use crate::programs::TestDaemon;

/// Every daemon program this binary can run.
///
/// Programs log to `log_dir` when one is configured.
pub(crate) fn program_catalog(log_dir: Option<PathBuf>) -> ProgramCatalog {
    let mut catalog = ProgramCatalog::new();

    catalog.register(ProgramRegistration::new(
        TestDaemon::NAME,
        TestDaemon::DESCRIPTION,
        move || Box::new(TestDaemon::new(log_dir.clone())),
    ));

    catalog
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_catalog_contains_test_daemon() {
        let catalog = program_catalog(None);
        let registration = catalog.get("daemon:cac:test").unwrap();
        assert_eq!(registration.description(), "This is a test daemon");

        let program = registration.create();
        assert_eq!(program.descriptor().name(), "daemon:cac:test");
        assert!(program.descriptor().log_file().is_none());
    }

    #[test]
    fn test_log_dir_reaches_programs() {
        let catalog = program_catalog(Some(PathBuf::from("/tmp/lifeline-logs")));
        let program = catalog.create("daemon:cac:test").unwrap();
        assert_eq!(
            program.descriptor().log_file(),
            Some(PathBuf::from("/tmp/lifeline-logs/daemon_cac_test.log"))
        );
    }
}
