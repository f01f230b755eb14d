//! Full daemon lifecycle against recording fakes.
//!
//! A fresh daemon with `interval = 1` and no time window, whose controller
//! reports running for two ticks and stopped on the third.

use std::collections::VecDeque;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use lifeline_config::DaemonConfiguration;
use lifeline_daemon::{
    DaemonDescriptor, DaemonError, DaemonLoopBuilder, DaemonProgram, DaemonRecord,
    DaemonRegistry, DaemonStore, DaemonizeOutcome, LoopOutcome, LoopState, MemoryStore,
    PlatformFamily, ProcessController, Requirement, StopReason, TickContext,
};
use parking_lot::Mutex;

type Trace = Arc<Mutex<Vec<String>>>;

fn push(trace: &Trace, event: &str) {
    trace.lock().push(event.to_string());
}

/// Records registry writes, delegating storage to a [`MemoryStore`].
struct RecordingStore {
    inner: MemoryStore,
    trace: Trace,
}

#[async_trait]
impl DaemonStore for RecordingStore {
    async fn fetch_record(&self, name: &str) -> Result<Option<DaemonRecord>, DaemonError> {
        self.inner.fetch_record(name).await
    }

    async fn insert_record(&self, record: DaemonRecord) -> Result<(), DaemonError> {
        push(&self.trace, "register");
        self.inner.insert_record(record).await
    }

    async fn update_started(&self, name: &str, started: DateTime<Utc>) -> Result<(), DaemonError> {
        push(&self.trace, "register");
        self.inner.update_started(name, started).await
    }

    async fn update_heartbeat(&self, name: &str, at: DateTime<Utc>) -> Result<(), DaemonError> {
        push(&self.trace, "heartbeat");
        self.inner.update_heartbeat(name, at).await
    }

    async fn clear_runtime(&self, name: &str) -> Result<(), DaemonError> {
        push(&self.trace, "unregister");
        self.inner.clear_runtime(name).await
    }

    async fn upsert_configuration(
        &self,
        name: &str,
        configuration: String,
    ) -> Result<(), DaemonError> {
        self.inner.upsert_configuration(name, configuration).await
    }

    async fn close(&self) -> Result<(), DaemonError> {
        self.inner.close().await
    }

    async fn reconnect(&self) -> Result<(), DaemonError> {
        self.inner.reconnect().await
    }
}

struct ScriptedController {
    running: Mutex<VecDeque<bool>>,
    trace: Trace,
}

#[async_trait]
impl ProcessController for ScriptedController {
    fn family(&self) -> PlatformFamily {
        PlatformFamily::Posix
    }

    async fn daemonize(&self, _: &DaemonDescriptor) -> Result<DaemonizeOutcome, DaemonError> {
        Ok(DaemonizeOutcome::Daemon)
    }

    async fn is_running(&self, _: &DaemonDescriptor) -> Result<bool, DaemonError> {
        Ok(self.running.lock().pop_front().unwrap_or(false))
    }

    async fn start(&self, _: &DaemonDescriptor) -> Result<Option<u32>, DaemonError> {
        Ok(None)
    }

    async fn stop(&self, _: &DaemonDescriptor) -> Result<(), DaemonError> {
        Ok(())
    }

    async fn die_daemon(&self, _: &DaemonDescriptor) -> Result<(), DaemonError> {
        // No pid file was ever written, so there is nothing to kill.
        push(&self.trace, "die");
        Ok(())
    }

    async fn is_alive(&self, _: &DaemonDescriptor) -> Result<bool, DaemonError> {
        Ok(false)
    }

    fn requirements(&self) -> Vec<Requirement> {
        Vec::new()
    }
}

struct CountingProgram {
    descriptor: DaemonDescriptor,
    trace: Trace,
}

#[async_trait]
impl DaemonProgram for CountingProgram {
    fn descriptor(&self) -> &DaemonDescriptor {
        &self.descriptor
    }

    fn default_configuration(&self) -> DaemonConfiguration {
        DaemonConfiguration {
            interval: Some(1.0),
            max_interval: Some(10.0),
            ..Default::default()
        }
    }

    async fn execute(&mut self, _ctx: &mut TickContext<'_>) -> anyhow::Result<()> {
        push(&self.trace, "work");
        Ok(())
    }
}

#[tokio::test(start_paused = true)]
async fn test_full_lifecycle_trace() {
    let trace: Trace = Arc::default();
    let store = Arc::new(RecordingStore {
        inner: MemoryStore::new(),
        trace: trace.clone(),
    });
    let registry = DaemonRegistry::new(store.clone());
    let controller = Arc::new(ScriptedController {
        running: Mutex::new(VecDeque::from([true, true])),
        trace: trace.clone(),
    });
    let program = CountingProgram {
        descriptor: DaemonDescriptor::new("daemon:cac:test", "This is a test daemon"),
        trace: trace.clone(),
    };

    let mut daemon = DaemonLoopBuilder::new(Box::new(program), controller, registry.clone())
        .bootstrap()
        .await
        .unwrap();
    assert!(daemon.window().is_none());

    let outcome = daemon.run().await.unwrap();

    assert_eq!(
        outcome,
        LoopOutcome::Terminated {
            reason: StopReason::Requested,
            ticks: 2
        }
    );
    assert_eq!(
        *trace.lock(),
        vec![
            "register",
            "heartbeat",
            "work",
            "heartbeat",
            "work",
            "unregister",
            "die"
        ]
    );
    assert_eq!(
        daemon.history(),
        [
            LoopState::Registering,
            LoopState::Daemonizing,
            LoopState::Running,
            LoopState::ShuttingDown,
            LoopState::Unregistering,
            LoopState::Terminated,
        ]
    );

    let status = registry.status("daemon:cac:test").await.unwrap();
    assert!(status.started.is_none());
    assert!(status.heartbeat.is_none());
    assert_eq!(
        registry.stored_configuration("daemon:cac:test").await.unwrap(),
        Some(DaemonConfiguration {
            interval: Some(1.0),
            max_interval: Some(10.0),
            ..Default::default()
        })
    );
}

#[tokio::test(start_paused = true)]
async fn test_second_run_keeps_first_configuration() {
    let trace: Trace = Arc::default();
    let registry = DaemonRegistry::new(Arc::new(RecordingStore {
        inner: MemoryStore::new(),
        trace: trace.clone(),
    }));

    for _ in 0..2 {
        let controller = Arc::new(ScriptedController {
            running: Mutex::new(VecDeque::from([true])),
            trace: trace.clone(),
        });
        let program = CountingProgram {
            descriptor: DaemonDescriptor::new("daemon:cac:test", "This is a test daemon"),
            trace: trace.clone(),
        };
        let mut daemon = DaemonLoopBuilder::new(Box::new(program), controller, registry.clone())
            .bootstrap()
            .await
            .unwrap();
        daemon.run().await.unwrap();
    }

    let registers = trace.lock().iter().filter(|e| *e == "register").count();
    assert_eq!(registers, 2);
    assert!(registry
        .stored_configuration("daemon:cac:test")
        .await
        .unwrap()
        .is_some());
}
