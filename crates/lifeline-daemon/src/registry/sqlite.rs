//! SQLite daemon store.

use std::path::{Path, PathBuf};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rusqlite::params;
use tokio::sync::Mutex;
use tokio_rusqlite::Connection;
use tracing::{debug, warn};

use super::schema::init_schema;
use super::{DaemonRecord, DaemonStore};
use crate::error::DaemonError;

/// File-backed daemon store.
///
/// The connection opens lazily and can be closed at any time; the next
/// operation reopens it.
pub struct SqliteStore {
    path: PathBuf,
    conn: Mutex<Option<Connection>>,
}

impl SqliteStore {
    /// Store at `path`, opened on first use.
    pub fn new(path: impl AsRef<Path>) -> Self {
        Self {
            path: path.as_ref().to_path_buf(),
            conn: Mutex::new(None),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    async fn connect(path: &Path) -> Result<Connection, DaemonError> {
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent).map_err(|e| {
                    DaemonError::Persistence(format!(
                        "Cannot create registry directory {}: {}",
                        parent.display(),
                        e
                    ))
                })?;
            }
        }

        let conn = Connection::open(path.to_path_buf())
            .await
            .map_err(|e| DaemonError::Persistence(format!("Cannot open registry: {}", e)))?;

        conn.call(|conn| Ok(init_schema(conn)?)).await?;

        debug!("Opened registry at {}", path.display());
        Ok(conn)
    }

    async fn connection(&self) -> Result<Connection, DaemonError> {
        let mut guard = self.conn.lock().await;
        if let Some(conn) = guard.as_ref() {
            return Ok(conn.clone());
        }
        let conn = Self::connect(&self.path).await?;
        *guard = Some(conn.clone());
        Ok(conn)
    }

    async fn execute(&self, sql: &'static str, args: Vec<Option<String>>) -> Result<(), DaemonError> {
        let conn = self.connection().await?;
        conn.call(move |conn| {
            conn.execute(sql, rusqlite::params_from_iter(args.iter()))?;
            Ok(())
        })
        .await?;
        Ok(())
    }
}

fn parse_timestamp(value: Option<String>) -> Option<DateTime<Utc>> {
    value
        .as_deref()
        .and_then(|s| DateTime::parse_from_rfc3339(s).ok())
        .map(|dt| dt.with_timezone(&Utc))
}

#[async_trait]
impl DaemonStore for SqliteStore {
    async fn fetch_record(&self, name: &str) -> Result<Option<DaemonRecord>, DaemonError> {
        let conn = self.connection().await?;
        let name = name.to_string();
        let record = conn
            .call(move |conn| {
                let mut stmt = conn.prepare(
                    "SELECT name, configuration, started, heartbeat FROM daemon WHERE name = ?1",
                )?;

                let row = stmt.query_row([&name], |row| {
                    Ok((
                        row.get::<_, String>(0)?,
                        row.get::<_, String>(1)?,
                        row.get::<_, Option<String>>(2)?,
                        row.get::<_, Option<String>>(3)?,
                    ))
                });

                match row {
                    Ok(row) => Ok(Some(row)),
                    Err(rusqlite::Error::QueryReturnedNoRows) => Ok(None),
                    Err(e) => Err(e.into()),
                }
            })
            .await?;

        Ok(record.map(|(name, configuration, started, heartbeat)| DaemonRecord {
            name,
            configuration,
            started: parse_timestamp(started),
            heartbeat: parse_timestamp(heartbeat),
        }))
    }

    async fn insert_record(&self, record: DaemonRecord) -> Result<(), DaemonError> {
        let conn = self.connection().await?;
        conn.call(move |conn| {
            conn.execute(
                "INSERT INTO daemon (name, configuration, started, heartbeat)
                 VALUES (?1, ?2, ?3, ?4)",
                params![
                    record.name,
                    record.configuration,
                    record.started.map(|t| t.to_rfc3339()),
                    record.heartbeat.map(|t| t.to_rfc3339()),
                ],
            )?;
            Ok(())
        })
        .await?;
        Ok(())
    }

    async fn update_started(&self, name: &str, started: DateTime<Utc>) -> Result<(), DaemonError> {
        self.execute(
            "UPDATE daemon SET started = ?1 WHERE name = ?2",
            vec![Some(started.to_rfc3339()), Some(name.to_string())],
        )
        .await
    }

    async fn update_heartbeat(&self, name: &str, at: DateTime<Utc>) -> Result<(), DaemonError> {
        self.execute(
            "UPDATE daemon SET heartbeat = ?1 WHERE name = ?2",
            vec![Some(at.to_rfc3339()), Some(name.to_string())],
        )
        .await
    }

    async fn clear_runtime(&self, name: &str) -> Result<(), DaemonError> {
        self.execute(
            "UPDATE daemon SET started = NULL, heartbeat = NULL WHERE name = ?1",
            vec![Some(name.to_string())],
        )
        .await
    }

    async fn upsert_configuration(
        &self,
        name: &str,
        configuration: String,
    ) -> Result<(), DaemonError> {
        self.execute(
            "INSERT INTO daemon (name, configuration) VALUES (?1, ?2)
             ON CONFLICT(name) DO UPDATE SET configuration = excluded.configuration",
            vec![Some(name.to_string()), Some(configuration)],
        )
        .await
    }

    async fn close(&self) -> Result<(), DaemonError> {
        let conn = self.conn.lock().await.take();
        if let Some(conn) = conn {
            conn.close().await?;
            debug!("Closed registry at {}", self.path.display());
        }
        Ok(())
    }

    async fn reconnect(&self) -> Result<(), DaemonError> {
        if let Err(e) = self.close().await {
            warn!("Closing registry before reconnect failed: {}", e);
        }
        self.connection().await?;
        Ok(())
    }
}
