//! Daemon programs bundled with the binary.

use std::path::PathBuf;

use async_trait::async_trait;
use tracing::{debug, info};

use lifeline_config::DaemonConfiguration;
use lifeline_daemon::{DaemonDescriptor, DaemonProgram, TickContext};

/// Heartbeat-only daemon used to exercise the supervision machinery.
pub(crate) struct TestDaemon {
    descriptor: DaemonDescriptor,
    runs: u64,
}

impl TestDaemon {
    pub(crate) const NAME: &'static str = "daemon:cac:test";
    pub(crate) const DESCRIPTION: &'static str = "This is a test daemon";

    pub(crate) fn new(log_dir: Option<PathBuf>) -> Self {
        let descriptor = DaemonDescriptor::new(Self::NAME, Self::DESCRIPTION);
        Self {
            descriptor: match log_dir {
                Some(dir) => descriptor.with_log_dir(dir),
                None => descriptor,
            },
            runs: 0,
        }
    }
}

#[async_trait]
impl DaemonProgram for TestDaemon {
    fn descriptor(&self) -> &DaemonDescriptor {
        &self.descriptor
    }

    fn default_configuration(&self) -> DaemonConfiguration {
        DaemonConfiguration {
            interval: Some(10.0),
            max_interval: Some(300.0),
            ..Default::default()
        }
    }

    async fn execute(&mut self, ctx: &mut TickContext<'_>) -> anyhow::Result<()> {
        self.runs += 1;
        info!("Test daemon run");
        debug!(
            runs = self.runs,
            tick = ctx.tick(),
            interval = ctx.interval(),
            "Test daemon tick"
        );
        Ok(())
    }
}
