//! In-process daemon store.

use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;

use super::{DaemonRecord, DaemonStore};
use crate::error::DaemonError;

/// Daemon store kept in memory. Used for `:memory:` registries and tests.
///
/// [`MemoryStore::fail_next`] makes the next operations fail with a
/// persistence error, as a dropped database connection would.
#[derive(Debug, Default)]
pub struct MemoryStore {
    records: Mutex<HashMap<String, DaemonRecord>>,
    failures: AtomicUsize,
    reconnects: AtomicUsize,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Fail the next `count` operations.
    pub fn fail_next(&self, count: usize) {
        self.failures.store(count, Ordering::SeqCst);
    }

    /// Number of reconnects performed so far.
    pub fn reconnects(&self) -> usize {
        self.reconnects.load(Ordering::SeqCst)
    }

    /// Snapshot of a record.
    pub fn record(&self, name: &str) -> Option<DaemonRecord> {
        self.records.lock().get(name).cloned()
    }

    fn check(&self) -> Result<(), DaemonError> {
        let pending = self
            .failures
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1));
        match pending {
            Ok(_) => Err(DaemonError::Persistence(
                "connection to registry lost".to_string(),
            )),
            Err(_) => Ok(()),
        }
    }

    fn update<F>(&self, name: &str, f: F) -> Result<(), DaemonError>
    where
        F: FnOnce(&mut DaemonRecord),
    {
        self.check()?;
        if let Some(record) = self.records.lock().get_mut(name) {
            f(record);
        }
        Ok(())
    }
}

#[async_trait]
impl DaemonStore for MemoryStore {
    async fn fetch_record(&self, name: &str) -> Result<Option<DaemonRecord>, DaemonError> {
        self.check()?;
        Ok(self.record(name))
    }

    async fn insert_record(&self, record: DaemonRecord) -> Result<(), DaemonError> {
        self.check()?;
        self.records.lock().insert(record.name.clone(), record);
        Ok(())
    }

    async fn update_started(&self, name: &str, started: DateTime<Utc>) -> Result<(), DaemonError> {
        self.update(name, |record| record.started = Some(started))
    }

    async fn update_heartbeat(&self, name: &str, at: DateTime<Utc>) -> Result<(), DaemonError> {
        self.update(name, |record| record.heartbeat = Some(at))
    }

    async fn clear_runtime(&self, name: &str) -> Result<(), DaemonError> {
        self.update(name, |record| {
            record.started = None;
            record.heartbeat = None;
        })
    }

    async fn upsert_configuration(
        &self,
        name: &str,
        configuration: String,
    ) -> Result<(), DaemonError> {
        self.check()?;
        self.records
            .lock()
            .entry(name.to_string())
            .and_modify(|record| record.configuration = configuration.clone())
            .or_insert_with(|| DaemonRecord {
                name: name.to_string(),
                configuration,
                started: None,
                heartbeat: None,
            });
        Ok(())
    }

    async fn close(&self) -> Result<(), DaemonError> {
        Ok(())
    }

    async fn reconnect(&self) -> Result<(), DaemonError> {
        self.reconnects.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}
