//! Lazily built clients, one per target service

use dashmap::DashMap;
use std::collections::HashMap;
use std::sync::Arc;
use tracing::info;

use courier_core::config::ClientConfig;

use super::client::{InterServiceClient, InterServiceClientConfig};
use super::metrics::MetricsSnapshot;
use super::transport::Transport;
use crate::discovery::ServiceDiscoveryClient;
use crate::error::Result;

/// Shares one discovery client and transport across every target
pub struct ServiceClients {
    discovery: Arc<ServiceDiscoveryClient>,
    transport: Arc<dyn Transport>,
    config: ClientConfig,
    clients: DashMap<String, Arc<InterServiceClient>>,
}

impl ServiceClients {
    #[must_use]
    pub fn new(
        discovery: Arc<ServiceDiscoveryClient>,
        transport: Arc<dyn Transport>,
        config: ClientConfig,
    ) -> Self {
        Self {
            discovery,
            transport,
            config,
            clients: DashMap::new(),
        }
    }

    /// Client for `target`, created on first use
    pub async fn client(&self, target: &str) -> Result<Arc<InterServiceClient>> {
        if let Some(client) = self.clients.get(target) {
            return Ok(Arc::clone(client.value()));
        }

        let client = Arc::new(
            InterServiceClient::new(
                InterServiceClientConfig::from_client_config(target, &self.config),
                Arc::clone(&self.discovery),
                Arc::clone(&self.transport),
            )
            .await?,
        );

        // Another task may have built one concurrently; keep the first
        let entry = self.clients.entry(target.to_string()).or_insert(client);
        Ok(Arc::clone(entry.value()))
    }

    #[must_use]
    pub fn targets(&self) -> Vec<String> {
        self.clients.iter().map(|entry| entry.key().clone()).collect()
    }

    #[must_use]
    pub fn metrics(&self) -> HashMap<String, MetricsSnapshot> {
        self.clients
            .iter()
            .map(|entry| (entry.key().clone(), entry.value().get_metrics()))
            .collect()
    }

    /// Shut down every client, then the shared discovery client
    pub async fn shutdown(&self) {
        let count = self.clients.len();
        for entry in self.clients.iter() {
            entry.value().shutdown();
        }
        self.clients.clear();
        self.discovery.shutdown().await;
        info!(clients = count, "Service clients shut down");
    }
}
