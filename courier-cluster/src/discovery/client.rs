//! Discovery facade for one process
//!
//! Owns this process's self-registration (with its heartbeat task) and
//! exposes discovery and health lookups to RPC clients.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use courier_core::config::DiscoveryConfig;
use courier_core::{ServiceDescriptor, ServiceQuery, ServiceRegistration, ServiceStatus};

use super::current;
use super::health_monitor::{HealthCheckResult, HealthCheckSpec, HealthMonitor};
use super::registry::ServiceRegistry;
use crate::error::{Error, Result};

#[derive(Debug, Clone)]
pub struct DiscoveryClientConfig {
    pub heartbeat_interval: Duration,
}

impl Default for DiscoveryClientConfig {
    fn default() -> Self {
        Self {
            heartbeat_interval: Duration::from_secs(30),
        }
    }
}

impl From<&DiscoveryConfig> for DiscoveryClientConfig {
    fn from(config: &DiscoveryConfig) -> Self {
        Self {
            heartbeat_interval: Duration::from_secs(config.heartbeat_interval_seconds.max(1)),
        }
    }
}

struct ActiveRegistration {
    id: String,
    cancel: CancellationToken,
    heartbeat: JoinHandle<()>,
}

pub struct ServiceDiscoveryClient {
    registry: Arc<ServiceRegistry>,
    health_monitor: Arc<HealthMonitor>,
    config: DiscoveryClientConfig,
    active: Mutex<Option<ActiveRegistration>>,
}

impl ServiceDiscoveryClient {
    #[must_use]
    pub fn new(
        registry: Arc<ServiceRegistry>,
        health_monitor: Arc<HealthMonitor>,
        config: DiscoveryClientConfig,
    ) -> Self {
        Self {
            registry,
            health_monitor,
            config,
            active: Mutex::new(None),
        }
    }

    #[must_use]
    pub const fn registry(&self) -> &Arc<ServiceRegistry> {
        &self.registry
    }

    #[must_use]
    pub const fn health_monitor(&self) -> &Arc<HealthMonitor> {
        &self.health_monitor
    }

    /// Register this process and keep the registration alive.
    ///
    /// Starts the heartbeat task and, when `health_check` is given, a health
    /// monitor for the new registration. A process registers at most once.
    pub async fn register_service(
        &self,
        descriptor: ServiceDescriptor,
        health_check: Option<HealthCheckSpec>,
    ) -> Result<String> {
        let mut active = self.active.lock().await;
        if let Some(existing) = active.as_ref() {
            return Err(Error::AlreadyRegistered(existing.id.clone()));
        }

        let id = self.registry.register(descriptor).await?;
        let (cancel, heartbeat) = self.spawn_heartbeat(id.clone());

        if let Some(spec) = health_check {
            self.health_monitor.start_monitoring(&id, spec);
        }
        if let Some(registration) = self.registry.get_service(&id).await {
            current::init(registration);
        }

        info!(
            service_id = %id,
            heartbeat_secs = self.config.heartbeat_interval.as_secs(),
            "Self-registration active"
        );
        *active = Some(ActiveRegistration {
            id: id.clone(),
            cancel,
            heartbeat,
        });
        Ok(id)
    }

    fn spawn_heartbeat(&self, service_id: String) -> (CancellationToken, JoinHandle<()>) {
        let registry = Arc::clone(&self.registry);
        let cancel = CancellationToken::new();
        let cancelled = cancel.clone();
        let heartbeat_interval = self.config.heartbeat_interval;

        let handle = tokio::spawn(async move {
            let mut timer = tokio::time::interval(heartbeat_interval);
            timer.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            // Registration already stamped the first heartbeat
            timer.tick().await;

            loop {
                tokio::select! {
                    biased;
                    () = cancelled.cancelled() => break,
                    _ = timer.tick() => {
                        if let Err(e) = registry.update_heartbeat(&service_id).await {
                            warn!(service_id = %service_id, error = %e, "Heartbeat failed");
                        }
                    }
                }
            }
            debug!(service_id = %service_id, "Heartbeat task stopped");
        });

        (cancel, handle)
    }

    /// Stop the heartbeat and health monitor, then remove the registration
    pub async fn deregister_service(&self) -> Result<()> {
        let Some(active) = self.active.lock().await.take() else {
            return Err(Error::NotFound("No active self-registration".to_string()));
        };

        active.cancel.cancel();
        if let Err(e) = active.heartbeat.await {
            warn!(service_id = %active.id, error = %e, "Heartbeat task ended abnormally");
        }
        self.health_monitor.stop_monitoring(&active.id);
        current::teardown();

        self.registry.deregister(&active.id).await?;
        info!(service_id = %active.id, "Self-registration removed");
        Ok(())
    }

    pub async fn update_service_status(
        &self,
        status: ServiceStatus,
        details: Option<HashMap<String, String>>,
    ) -> Result<()> {
        let id = self
            .registration_id()
            .await
            .ok_or_else(|| Error::NotFound("No active self-registration".to_string()))?;

        self.registry.update_status(&id, status, details).await?;
        if let Some(registration) = self.registry.get_service(&id).await {
            current::init(registration);
        }
        Ok(())
    }

    pub async fn discover_services(&self, query: &ServiceQuery) -> Vec<ServiceRegistration> {
        self.registry.discover(query).await
    }

    /// Health-monitor some other registration
    pub fn watch_service(&self, service_id: &str, spec: HealthCheckSpec) {
        self.health_monitor.start_monitoring(service_id, spec);
    }

    pub fn unwatch_service(&self, service_id: &str) -> bool {
        self.health_monitor.stop_monitoring(service_id)
    }

    #[must_use]
    pub fn health_status(&self, service_id: &str) -> Option<HealthCheckResult> {
        self.health_monitor.get_health_status(service_id)
    }

    pub async fn registration_id(&self) -> Option<String> {
        self.active.lock().await.as_ref().map(|active| active.id.clone())
    }

    /// Deregister if registered and stop every monitor; safe to call twice
    pub async fn shutdown(&self) {
        if self.registration_id().await.is_some() {
            if let Err(e) = self.deregister_service().await {
                error!(error = %e, "Failed to deregister during shutdown");
            }
        }
        self.health_monitor.shutdown().await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::discovery::health_monitor::HealthStatus;
    use crate::discovery::registry::RegistryConfig;
    use crate::rpc::transport::{MockTransport, TransportResponse};
    use crate::test_helpers::descriptor;
    use courier_core::MemoryRegistrationStore;
    use serde_json::Value;

    async fn discovery_client(transport: MockTransport) -> (ServiceDiscoveryClient, Arc<MemoryRegistrationStore>) {
        let store = Arc::new(MemoryRegistrationStore::new());
        let registry = Arc::new(ServiceRegistry::new(store.clone(), RegistryConfig::default()).await);
        let monitor = Arc::new(HealthMonitor::new(Arc::new(transport)));
        let client = ServiceDiscoveryClient::new(
            registry,
            monitor,
            DiscoveryClientConfig {
                heartbeat_interval: Duration::from_secs(10),
            },
        );
        (client, store)
    }

    #[tokio::test]
    async fn test_register_twice_is_rejected() {
        let (client, _) = discovery_client(MockTransport::new()).await;
        let id = client
            .register_service(descriptor("orders", "10.0.0.5", 8080), None)
            .await
            .unwrap();

        let err = client
            .register_service(descriptor("orders", "10.0.0.5", 8080), None)
            .await
            .unwrap_err();
        assert!(matches!(err, Error::AlreadyRegistered(existing) if existing == id));
        assert_eq!(client.registry().get_all_services().await.len(), 1);

        client.shutdown().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_heartbeat_keeps_registration_fresh() {
        let (client, _) = discovery_client(MockTransport::new()).await;
        let id = client
            .register_service(descriptor("orders", "10.0.0.5", 8080), None)
            .await
            .unwrap();
        let registered = client.registry().get_service(&id).await.unwrap();

        // Wall clock moves independently of the paused tokio clock
        std::thread::sleep(std::time::Duration::from_millis(5));
        tokio::time::sleep(Duration::from_secs(11)).await;

        let refreshed = client.registry().get_service(&id).await.unwrap();
        assert!(refreshed.last_heartbeat > registered.last_heartbeat);

        client.shutdown().await;
    }

    #[tokio::test]
    async fn test_deregister_without_registration_is_not_found() {
        let (client, _) = discovery_client(MockTransport::new()).await;
        assert!(matches!(
            client.deregister_service().await.unwrap_err(),
            Error::NotFound(_)
        ));
        assert!(matches!(
            client
                .update_service_status(ServiceStatus::Healthy, None)
                .await
                .unwrap_err(),
            Error::NotFound(_)
        ));
    }

    #[tokio::test]
    async fn test_shutdown_removes_registration_and_is_idempotent() {
        let (client, store) = discovery_client(MockTransport::new()).await;
        let id = client
            .register_service(descriptor("orders", "10.0.0.5", 8080), None)
            .await
            .unwrap();
        assert!(store.get(&id).is_some());

        client.shutdown().await;
        client.shutdown().await;
        assert!(client.registry().get_service(&id).await.is_none());
        assert!(store.get(&id).is_none());
        assert!(client.registration_id().await.is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn test_watch_service_reports_health() {
        let mut transport = MockTransport::new();
        transport
            .expect_send()
            .returning(|_| Ok(TransportResponse::new(200, Value::Null)));
        let (client, _) = discovery_client(transport).await;

        client.watch_service(
            "billing-1",
            HealthCheckSpec::new("http://10.0.0.6:8080/health").with_interval(Duration::from_secs(5)),
        );
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert_eq!(
            client.health_status("billing-1").unwrap().status,
            HealthStatus::Healthy
        );

        assert!(client.unwatch_service("billing-1"));
        assert!(client.health_status("billing-1").is_none());
    }

    #[tokio::test]
    async fn test_discover_services_delegates_to_registry() {
        let (client, _) = discovery_client(MockTransport::new()).await;
        client
            .registry()
            .register(descriptor("billing", "10.0.0.6", 8080))
            .await
            .unwrap();

        let found = client
            .discover_services(&ServiceQuery::by_name("billing"))
            .await;
        assert_eq!(found.len(), 1);
        assert!(client
            .discover_services(&ServiceQuery::by_name("orders"))
            .await
            .is_empty());
    }
}
