//! Shared fixtures for unit tests

use async_trait::async_trait;
use chrono::Utc;
use std::time::Duration;

use courier_core::{MemoryRegistrationStore, RegistrationStore, ServiceDescriptor, ServiceRegistration};

pub fn descriptor(name: &str, host: &str, port: u16) -> ServiceDescriptor {
    ServiceDescriptor::new(name, host, port).with_version("1.0.0")
}

/// A registration whose last heartbeat was `age_secs` ago
pub fn stale_registration(name: &str, age_secs: i64) -> ServiceRegistration {
    let now = Utc::now();
    let mut registration = ServiceRegistration::from_descriptor(
        format!("{name}-{}", uuid::Uuid::new_v4().simple()),
        descriptor(name, "10.0.0.5", 8080),
        now,
    );
    registration.last_heartbeat = now - chrono::Duration::seconds(age_secs);
    registration
}

/// Store whose every operation fails
pub struct FailingStore;

#[async_trait]
impl RegistrationStore for FailingStore {
    async fn upsert(&self, _registration: &ServiceRegistration) -> courier_core::Result<()> {
        Err(courier_core::Error::Internal("store unavailable".to_string()))
    }

    async fn delete(&self, _id: &str) -> courier_core::Result<bool> {
        Err(courier_core::Error::Internal("store unavailable".to_string()))
    }

    async fn load_active(&self) -> courier_core::Result<Vec<ServiceRegistration>> {
        Err(courier_core::Error::Internal("store unavailable".to_string()))
    }
}

/// In-memory store whose upserts take `delay` to land
pub struct SlowStore {
    inner: MemoryRegistrationStore,
    delay: Duration,
}

impl SlowStore {
    pub fn new(delay: Duration) -> Self {
        Self {
            inner: MemoryRegistrationStore::new(),
            delay,
        }
    }

    pub const fn inner(&self) -> &MemoryRegistrationStore {
        &self.inner
    }
}

#[async_trait]
impl RegistrationStore for SlowStore {
    async fn upsert(&self, registration: &ServiceRegistration) -> courier_core::Result<()> {
        tokio::time::sleep(self.delay).await;
        self.inner.upsert(registration).await
    }

    async fn delete(&self, id: &str) -> courier_core::Result<bool> {
        self.inner.delete(id).await
    }

    async fn load_active(&self) -> courier_core::Result<Vec<ServiceRegistration>> {
        self.inner.load_active().await
    }
}
