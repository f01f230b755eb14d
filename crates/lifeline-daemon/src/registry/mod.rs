//! Persisted daemon state.
//!
//! One record per daemon name: the serialized configuration plus the
//! `started` and `heartbeat` timestamps external monitors read.

mod memory;
mod schema;
mod sqlite;

use std::future::Future;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use lifeline_config::DaemonConfiguration;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::error::{DaemonError, ErrorKind};

pub use memory::MemoryStore;
pub use schema::init_schema;
pub use sqlite::SqliteStore;

/// Persisted row for one daemon.
#[derive(Debug, Clone, PartialEq)]
pub struct DaemonRecord {
    pub name: String,
    /// JSON encoding of the daemon configuration.
    pub configuration: String,
    pub started: Option<DateTime<Utc>>,
    pub heartbeat: Option<DateTime<Utc>>,
}

/// Runtime timestamps of a daemon, both absent when it is not running.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DaemonStatus {
    pub started: Option<DateTime<Utc>>,
    pub heartbeat: Option<DateTime<Utc>>,
}

/// Backing store for daemon records.
#[async_trait]
pub trait DaemonStore: Send + Sync {
    async fn fetch_record(&self, name: &str) -> Result<Option<DaemonRecord>, DaemonError>;

    async fn insert_record(&self, record: DaemonRecord) -> Result<(), DaemonError>;

    async fn update_started(&self, name: &str, started: DateTime<Utc>) -> Result<(), DaemonError>;

    async fn update_heartbeat(&self, name: &str, at: DateTime<Utc>) -> Result<(), DaemonError>;

    /// Clear `started` and `heartbeat`, keeping the configuration.
    async fn clear_runtime(&self, name: &str) -> Result<(), DaemonError>;

    /// Replace the stored configuration, creating the record if needed.
    async fn upsert_configuration(&self, name: &str, configuration: String)
    -> Result<(), DaemonError>;

    /// Release connections. The next operation reopens them.
    async fn close(&self) -> Result<(), DaemonError>;

    /// Drop and reopen connections.
    async fn reconnect(&self) -> Result<(), DaemonError>;
}

/// Register, heartbeat and unregister daemons against a [`DaemonStore`].
///
/// A persistence failure triggers one reconnect and one retry before the
/// error is returned.
#[derive(Clone)]
pub struct DaemonRegistry {
    store: Arc<dyn DaemonStore>,
}

impl DaemonRegistry {
    pub fn new(store: Arc<dyn DaemonStore>) -> Self {
        Self { store }
    }

    pub fn store(&self) -> &Arc<dyn DaemonStore> {
        &self.store
    }

    /// Create the record, or only refresh `started` when it already exists.
    pub async fn register(
        &self,
        name: &str,
        configuration: &DaemonConfiguration,
    ) -> Result<(), DaemonError> {
        let blob = serde_json::to_string(configuration)?;
        let now = Utc::now();

        let existing = self
            .with_reconnect("register", move |store| store.fetch_record(name))
            .await?;

        if existing.is_some() {
            debug!("Daemon {} already registered, refreshing start time", name);
            self.with_reconnect("register", move |store| store.update_started(name, now))
                .await
        } else {
            debug!("Registering daemon {}", name);
            let record = DaemonRecord {
                name: name.to_string(),
                configuration: blob,
                started: Some(now),
                heartbeat: None,
            };
            self.with_reconnect("register", move |store| {
                store.insert_record(record.clone())
            })
            .await
        }
    }

    /// Set `heartbeat` to now.
    pub async fn heartbeat(&self, name: &str) -> Result<(), DaemonError> {
        let now = Utc::now();
        self.with_reconnect("heartbeat", move |store| store.update_heartbeat(name, now))
            .await
    }

    /// Clear both timestamps. The configuration stays stored.
    pub async fn unregister(&self, name: &str) -> Result<(), DaemonError> {
        self.with_reconnect("unregister", move |store| store.clear_runtime(name))
            .await
    }

    /// Current `(started, heartbeat)` pair.
    pub async fn status(&self, name: &str) -> Result<DaemonStatus, DaemonError> {
        let record = self
            .with_reconnect("status", move |store| store.fetch_record(name))
            .await?;
        Ok(record
            .map(|record| DaemonStatus {
                started: record.started,
                heartbeat: record.heartbeat,
            })
            .unwrap_or_default())
    }

    /// Persist a new configuration for the next run.
    pub async fn store_configuration(
        &self,
        name: &str,
        configuration: &DaemonConfiguration,
    ) -> Result<(), DaemonError> {
        let blob = serde_json::to_string(configuration)?;
        self.with_reconnect("store configuration", move |store| {
            store.upsert_configuration(name, blob.clone())
        })
        .await
    }

    /// The stored configuration, if the daemon has a record.
    pub async fn stored_configuration(
        &self,
        name: &str,
    ) -> Result<Option<DaemonConfiguration>, DaemonError> {
        let record = self
            .with_reconnect("load configuration", move |store| store.fetch_record(name))
            .await?;
        match record {
            Some(record) => Ok(Some(serde_json::from_str(&record.configuration)?)),
            None => Ok(None),
        }
    }

    /// Release store connections, e.g. before forking.
    pub async fn close(&self) -> Result<(), DaemonError> {
        self.store.close().await
    }

    async fn with_reconnect<'a, T, F, Fut>(&'a self, action: &str, op: F) -> Result<T, DaemonError>
    where
        F: Fn(&'a dyn DaemonStore) -> Fut,
        Fut: Future<Output = Result<T, DaemonError>>,
    {
        match op(self.store.as_ref()).await {
            Err(e) if e.kind() == ErrorKind::Persistence => {
                warn!("Registry {} failed: {}. Reconnecting", action, e);
                self.store.reconnect().await?;
                op(self.store.as_ref()).await
            }
            other => other,
        }
    }
}

#[cfg(test)]
#[path = "registry_tests.rs"]
mod tests;
