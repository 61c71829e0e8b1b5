//! Durable backing for the service registry
//!
//! The registry's in-memory map is the read path; stores only see writes
//! plus the warm-up read at startup.

use async_trait::async_trait;
use parking_lot::RwLock;
use sqlx::{postgres::PgRow, PgPool, Row};
use std::collections::HashMap;

use crate::{
    models::{ServiceRegistration, ServiceStatus},
    Error, Result,
};

/// Write-through persistence for registrations, upsert-by-id
#[async_trait]
pub trait RegistrationStore: Send + Sync {
    /// Insert or replace the row with `registration.id`
    async fn upsert(&self, registration: &ServiceRegistration) -> Result<()>;

    /// Remove a row; returns false if it did not exist
    async fn delete(&self, id: &str) -> Result<bool>;

    /// Every registration whose status is not `stopping`
    async fn load_active(&self) -> Result<Vec<ServiceRegistration>>;
}

/// Postgres-backed registration store
#[derive(Clone)]
pub struct PgRegistrationStore {
    pool: PgPool,
}

impl PgRegistrationStore {
    #[must_use]
    pub const fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    fn row_to_registration(row: &PgRow) -> Result<ServiceRegistration> {
        let status: String = row.try_get("status")?;
        let port: i32 = row.try_get("port")?;
        let endpoints: String = row.try_get("endpoints")?;
        let metadata: String = row.try_get("metadata")?;
        let tags: String = row.try_get("tags")?;

        Ok(ServiceRegistration {
            id: row.try_get("id")?,
            name: row.try_get("name")?,
            version: row.try_get("version")?,
            host: row.try_get("host")?,
            port: u16::try_from(port).map_err(|_| Error::Deserialization {
                context: format!("port {port} out of range"),
            })?,
            protocol: row.try_get("protocol")?,
            endpoints: serde_json::from_str(&endpoints)?,
            metadata: serde_json::from_str(&metadata)?,
            tags: serde_json::from_str(&tags)?,
            registered_at: row.try_get("registered_at")?,
            last_heartbeat: row.try_get("last_heartbeat")?,
            status: status.parse()?,
        })
    }
}

#[async_trait]
impl RegistrationStore for PgRegistrationStore {
    async fn upsert(&self, registration: &ServiceRegistration) -> Result<()> {
        sqlx::query(
            "INSERT INTO service_registrations
                 (id, name, version, host, port, protocol, endpoints, metadata, tags, registered_at, last_heartbeat, status)
             VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12)
             ON CONFLICT (id) DO UPDATE SET
                 name = EXCLUDED.name,
                 version = EXCLUDED.version,
                 host = EXCLUDED.host,
                 port = EXCLUDED.port,
                 protocol = EXCLUDED.protocol,
                 endpoints = EXCLUDED.endpoints,
                 metadata = EXCLUDED.metadata,
                 tags = EXCLUDED.tags,
                 last_heartbeat = EXCLUDED.last_heartbeat,
                 status = EXCLUDED.status",
        )
        .bind(&registration.id)
        .bind(&registration.name)
        .bind(&registration.version)
        .bind(&registration.host)
        .bind(i32::from(registration.port))
        .bind(&registration.protocol)
        .bind(serde_json::to_string(&registration.endpoints)?)
        .bind(serde_json::to_string(&registration.metadata)?)
        .bind(serde_json::to_string(&registration.tags)?)
        .bind(registration.registered_at)
        .bind(registration.last_heartbeat)
        .bind(registration.status.as_str())
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    async fn delete(&self, id: &str) -> Result<bool> {
        let result = sqlx::query("DELETE FROM service_registrations WHERE id = $1")
            .bind(id)
            .execute(&self.pool)
            .await?;

        Ok(result.rows_affected() > 0)
    }

    async fn load_active(&self) -> Result<Vec<ServiceRegistration>> {
        let rows = sqlx::query(
            "SELECT id, name, version, host, port, protocol, endpoints, metadata, tags,
                    registered_at, last_heartbeat, status
             FROM service_registrations
             WHERE status <> $1",
        )
        .bind(ServiceStatus::Stopping.as_str())
        .fetch_all(&self.pool)
        .await?;

        let mut registrations = Vec::with_capacity(rows.len());
        for row in &rows {
            match Self::row_to_registration(row) {
                Ok(registration) => registrations.push(registration),
                Err(e) => {
                    let id: String = row.try_get("id").unwrap_or_default();
                    tracing::warn!(service_id = %id, error = %e, "Skipping unreadable registration row");
                }
            }
        }

        Ok(registrations)
    }
}

/// In-process store for single-node deployments and tests
#[derive(Debug, Default)]
pub struct MemoryRegistrationStore {
    rows: RwLock<HashMap<String, ServiceRegistration>>,
}

impl MemoryRegistrationStore {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Seed the store, e.g. with registrations left over from a previous run
    #[must_use]
    pub fn with_registrations(registrations: impl IntoIterator<Item = ServiceRegistration>) -> Self {
        let rows = registrations
            .into_iter()
            .map(|registration| (registration.id.clone(), registration))
            .collect();
        Self {
            rows: RwLock::new(rows),
        }
    }

    #[must_use]
    pub fn get(&self, id: &str) -> Option<ServiceRegistration> {
        self.rows.read().get(id).cloned()
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.rows.read().len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.rows.read().is_empty()
    }
}

#[async_trait]
impl RegistrationStore for MemoryRegistrationStore {
    async fn upsert(&self, registration: &ServiceRegistration) -> Result<()> {
        self.rows
            .write()
            .insert(registration.id.clone(), registration.clone());
        Ok(())
    }

    async fn delete(&self, id: &str) -> Result<bool> {
        Ok(self.rows.write().remove(id).is_some())
    }

    async fn load_active(&self) -> Result<Vec<ServiceRegistration>> {
        Ok(self
            .rows
            .read()
            .values()
            .filter(|registration| registration.status != ServiceStatus::Stopping)
            .cloned()
            .collect())
    }
}
