//! Service registry
//!
//! The in-memory map is authoritative for reads. Every mutation is written
//! through to a [`RegistrationStore`]; registration and deregistration wait
//! for the store, heartbeat and status updates persist in the background.
//! Store writes are serialized, and a background write for an id that has
//! left the map is dropped, so a removed registration never comes back.

use chrono::Utc;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{Mutex, RwLock};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use courier_core::metrics::discovery::REGISTERED_SERVICES;
use courier_core::{
    RegistrationStore, ServiceDescriptor, ServiceQuery, ServiceRegistration, ServiceStatus,
};

use crate::error::{Error, Result};

#[derive(Debug, Clone)]
pub struct RegistryConfig {
    /// Registrations without a heartbeat for longer than this are removed
    pub registration_ttl: Duration,
    pub cleanup_interval: Duration,
}

impl Default for RegistryConfig {
    fn default() -> Self {
        Self {
            registration_ttl: Duration::from_secs(90),
            cleanup_interval: Duration::from_secs(30),
        }
    }
}

impl From<&courier_core::config::RegistryConfig> for RegistryConfig {
    fn from(config: &courier_core::config::RegistryConfig) -> Self {
        Self {
            registration_ttl: Duration::from_secs(config.registration_ttl_seconds),
            cleanup_interval: Duration::from_secs(config.cleanup_interval_seconds.max(1)),
        }
    }
}

pub struct ServiceRegistry {
    store: Arc<dyn RegistrationStore>,
    services: Arc<RwLock<HashMap<String, ServiceRegistration>>>,
    store_writes: Arc<Mutex<()>>,
    config: RegistryConfig,
    cancel_token: CancellationToken,
}

impl ServiceRegistry {
    /// Create a registry and warm its cache from the store.
    ///
    /// A store that cannot be read leaves the cache empty; the registry is
    /// still usable.
    pub async fn new(store: Arc<dyn RegistrationStore>, config: RegistryConfig) -> Self {
        let registry = Self {
            store,
            services: Arc::new(RwLock::new(HashMap::new())),
            store_writes: Arc::new(Mutex::new(())),
            config,
            cancel_token: CancellationToken::new(),
        };
        registry.warm_cache().await;
        registry
    }

    async fn warm_cache(&self) {
        match self.store.load_active().await {
            Ok(registrations) => {
                let mut services = self.services.write().await;
                for registration in registrations {
                    services.insert(registration.id.clone(), registration);
                }
                REGISTERED_SERVICES.set(services.len() as i64);
                info!(count = services.len(), "Loaded registrations from store");
            }
            Err(e) => {
                error!(error = %e, "Failed to load registrations, starting with an empty registry");
            }
        }
    }

    #[must_use]
    pub const fn config(&self) -> &RegistryConfig {
        &self.config
    }

    /// Register a service instance and return its generated id.
    ///
    /// Fails without touching the cache if the store rejects the write.
    pub async fn register(&self, descriptor: ServiceDescriptor) -> Result<String> {
        if descriptor.name.trim().is_empty() {
            return Err(Error::InvalidInput("Service name cannot be empty".to_string()));
        }
        if descriptor.host.trim().is_empty() {
            return Err(Error::InvalidInput("Service host cannot be empty".to_string()));
        }
        if descriptor.port == 0 {
            return Err(Error::InvalidInput("Service port cannot be 0".to_string()));
        }

        let id = format!("{}-{}", descriptor.name, uuid::Uuid::new_v4().simple());
        let registration = ServiceRegistration::from_descriptor(id.clone(), descriptor, Utc::now());

        self.store.upsert(&registration).await?;

        let mut services = self.services.write().await;
        info!(
            service_id = %id,
            name = %registration.name,
            version = %registration.version,
            address = %registration.base_url(),
            "Service registered"
        );
        services.insert(id.clone(), registration);
        REGISTERED_SERVICES.set(services.len() as i64);

        Ok(id)
    }

    pub async fn deregister(&self, service_id: &str) -> Result<()> {
        let removed = {
            let mut services = self.services.write().await;
            let removed = services.remove(service_id);
            REGISTERED_SERVICES.set(services.len() as i64);
            removed
        };
        let Some(registration) = removed else {
            return Err(Error::NotFound(format!("Service {service_id} is not registered")));
        };

        {
            let _write = self.store_writes.lock().await;
            self.store.delete(service_id).await?;
        }
        info!(service_id, name = %registration.name, "Service deregistered");
        Ok(())
    }

    /// Registrations matching every set field of `query`, oldest first
    pub async fn discover(&self, query: &ServiceQuery) -> Vec<ServiceRegistration> {
        let services = self.services.read().await;
        let mut matches: Vec<ServiceRegistration> = services
            .values()
            .filter(|registration| query.matches(registration))
            .cloned()
            .collect();
        matches.sort_by(|a, b| a.registered_at.cmp(&b.registered_at).then_with(|| a.id.cmp(&b.id)));
        matches
    }

    pub async fn update_heartbeat(&self, service_id: &str) -> Result<()> {
        let snapshot = {
            let mut services = self.services.write().await;
            let registration = services
                .get_mut(service_id)
                .ok_or_else(|| Error::NotFound(format!("Service {service_id} is not registered")))?;
            registration.last_heartbeat = Utc::now();
            registration.clone()
        };

        debug!(service_id, "Heartbeat recorded");
        self.persist_in_background(snapshot, "heartbeat");
        Ok(())
    }

    /// Set a registration's status, merging `details` into its metadata
    pub async fn update_status(
        &self,
        service_id: &str,
        status: ServiceStatus,
        details: Option<HashMap<String, String>>,
    ) -> Result<()> {
        let snapshot = {
            let mut services = self.services.write().await;
            let registration = services
                .get_mut(service_id)
                .ok_or_else(|| Error::NotFound(format!("Service {service_id} is not registered")))?;
            if registration.status != status {
                info!(service_id, from = %registration.status, to = %status, "Service status changed");
            }
            registration.status = status;
            if let Some(details) = details {
                registration.metadata.extend(details);
            }
            registration.clone()
        };

        self.persist_in_background(snapshot, "status");
        Ok(())
    }

    fn persist_in_background(&self, registration: ServiceRegistration, what: &'static str) {
        let store = Arc::clone(&self.store);
        let services = Arc::clone(&self.services);
        let store_writes = Arc::clone(&self.store_writes);
        tokio::spawn(async move {
            let _write = store_writes.lock().await;
            if !services.read().await.contains_key(&registration.id) {
                debug!(service_id = %registration.id, update = what, "Registration removed, skipping persist");
                return;
            }
            if let Err(e) = store.upsert(&registration).await {
                warn!(service_id = %registration.id, update = what, error = %e, "Failed to persist registration update");
            }
        });
    }

    pub async fn get_service(&self, service_id: &str) -> Option<ServiceRegistration> {
        self.services.read().await.get(service_id).cloned()
    }

    pub async fn get_all_services(&self) -> Vec<ServiceRegistration> {
        self.discover(&ServiceQuery::all()).await
    }

    /// Remove every registration past its TTL; returns the removed ids
    pub async fn cleanup(&self) -> Vec<String> {
        let now = Utc::now();
        let ttl = self.config.registration_ttl;

        let expired: Vec<ServiceRegistration> = {
            let mut services = self.services.write().await;
            let ids: Vec<String> = services
                .values()
                .filter(|registration| registration.is_expired(ttl, now))
                .map(|registration| registration.id.clone())
                .collect();
            let expired = ids.iter().filter_map(|id| services.remove(id)).collect();
            REGISTERED_SERVICES.set(services.len() as i64);
            expired
        };

        let _write = self.store_writes.lock().await;
        for registration in &expired {
            warn!(
                service_id = %registration.id,
                name = %registration.name,
                last_heartbeat = %registration.last_heartbeat,
                "Removing expired registration"
            );
            if let Err(e) = self.store.delete(&registration.id).await {
                warn!(service_id = %registration.id, error = %e, "Failed to delete expired registration from store");
            }
        }

        expired.into_iter().map(|registration| registration.id).collect()
    }

    /// Run [`cleanup`](Self::cleanup) every `cleanup_interval` until
    /// [`shutdown`](Self::shutdown)
    pub fn start_cleanup(self: &Arc<Self>) -> tokio::task::JoinHandle<()> {
        let registry = Arc::downgrade(self);
        let cancel_token = self.cancel_token.clone();
        let cleanup_interval = self.config.cleanup_interval;

        tokio::spawn(async move {
            let mut timer = tokio::time::interval(cleanup_interval);
            timer.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

            loop {
                tokio::select! {
                    () = cancel_token.cancelled() => {
                        info!("Registry cleanup stopped");
                        break;
                    }
                    _ = timer.tick() => {
                        let Some(registry) = registry.upgrade() else {
                            break;
                        };
                        let removed = registry.cleanup().await;
                        if !removed.is_empty() {
                            info!(count = removed.len(), "Expired registrations removed");
                        }
                    }
                }
            }
        })
    }

    pub fn shutdown(&self) {
        self.cancel_token.cancel();
    }
}
