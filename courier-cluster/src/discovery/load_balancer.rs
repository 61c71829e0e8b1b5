//! Instance selection for one target service
//!
//! Holds the client-side pool of known instances with live connection
//! counts. Unhealthy instances are skipped when the strategy requires
//! health.

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use rand::RngExt;
use serde::Serialize;
use std::collections::HashMap;
use tracing::{debug, info, warn};

use courier_core::config::{LoadBalancingConfig, LoadBalancingStrategy};
use courier_core::{ServiceRegistration, ServiceStatus};

/// Registration metadata key carrying an instance's selection weight
pub const WEIGHT_METADATA_KEY: &str = "weight";

/// One addressable instance of the target service
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ServiceInstance {
    pub id: String,
    pub host: String,
    pub port: u16,
    pub protocol: String,
    pub weight: u32,
    pub healthy: bool,
    /// In-flight requests issued through this balancer
    pub connections: u32,
    pub last_health_check: Option<DateTime<Utc>>,
}

impl ServiceInstance {
    #[must_use]
    pub fn new(id: impl Into<String>, host: impl Into<String>, port: u16) -> Self {
        Self {
            id: id.into(),
            host: host.into(),
            port,
            protocol: "http".to_string(),
            weight: 1,
            healthy: true,
            connections: 0,
            last_health_check: None,
        }
    }

    #[must_use]
    pub const fn with_weight(mut self, weight: u32) -> Self {
        self.weight = weight;
        self
    }

    #[must_use]
    pub const fn with_connections(mut self, connections: u32) -> Self {
        self.connections = connections;
        self
    }

    #[must_use]
    pub const fn with_healthy(mut self, healthy: bool) -> Self {
        self.healthy = healthy;
        self
    }

    /// Weight comes from `metadata["weight"]`, defaulting to 1
    #[must_use]
    pub fn from_registration(registration: &ServiceRegistration) -> Self {
        let weight = registration
            .metadata
            .get(WEIGHT_METADATA_KEY)
            .and_then(|w| w.parse().ok())
            .unwrap_or(1);

        Self {
            id: registration.id.clone(),
            host: registration.host.clone(),
            port: registration.port,
            protocol: registration.protocol.clone(),
            weight,
            healthy: !matches!(
                registration.status,
                ServiceStatus::Unhealthy | ServiceStatus::Stopping
            ),
            connections: 0,
            last_health_check: None,
        }
    }

    #[must_use]
    pub fn url(&self) -> String {
        format!("{}://{}:{}", self.protocol, self.host, self.port)
    }
}

/// Picks one candidate out of a non-empty slice
pub trait SelectionStrategy: Send + Sync + std::fmt::Debug {
    fn kind(&self) -> LoadBalancingStrategy;

    /// Returns an index into `candidates`; `cursor` is the pool's rotation state
    fn select(&self, candidates: &[&ServiceInstance], cursor: &mut usize) -> usize;
}

#[derive(Debug, Default)]
pub struct RoundRobin;

impl SelectionStrategy for RoundRobin {
    fn kind(&self) -> LoadBalancingStrategy {
        LoadBalancingStrategy::RoundRobin
    }

    fn select(&self, candidates: &[&ServiceInstance], cursor: &mut usize) -> usize {
        let index = *cursor % candidates.len();
        *cursor = (index + 1) % candidates.len();
        index
    }
}

/// Fewest in-flight requests, first candidate on ties
#[derive(Debug, Default)]
pub struct LeastConnections;

impl SelectionStrategy for LeastConnections {
    fn kind(&self) -> LoadBalancingStrategy {
        LoadBalancingStrategy::LeastConnections
    }

    fn select(&self, candidates: &[&ServiceInstance], _cursor: &mut usize) -> usize {
        candidates
            .iter()
            .enumerate()
            .min_by_key(|(_, instance)| instance.connections)
            .map_or(0, |(index, _)| index)
    }
}

#[derive(Debug, Default)]
pub struct Random;

impl SelectionStrategy for Random {
    fn kind(&self) -> LoadBalancingStrategy {
        LoadBalancingStrategy::Random
    }

    fn select(&self, candidates: &[&ServiceInstance], _cursor: &mut usize) -> usize {
        rand::rng().random_range(0..candidates.len())
    }
}

/// Probability proportional to weight; configured overrides win over
/// instance weights. A pool whose weights sum to zero yields the first
/// candidate.
#[derive(Debug, Default)]
pub struct Weighted {
    overrides: HashMap<String, u32>,
}

impl Weighted {
    #[must_use]
    pub const fn new(overrides: HashMap<String, u32>) -> Self {
        Self { overrides }
    }

    fn weight_of(&self, instance: &ServiceInstance) -> u64 {
        u64::from(
            self.overrides
                .get(&instance.id)
                .copied()
                .unwrap_or(instance.weight),
        )
    }
}

impl SelectionStrategy for Weighted {
    fn kind(&self) -> LoadBalancingStrategy {
        LoadBalancingStrategy::Weighted
    }

    fn select(&self, candidates: &[&ServiceInstance], _cursor: &mut usize) -> usize {
        let total: u64 = candidates.iter().map(|i| self.weight_of(i)).sum();
        if total == 0 {
            return 0;
        }

        let mut draw = rand::rng().random_range(0..total);
        for (index, instance) in candidates.iter().enumerate() {
            let weight = self.weight_of(instance);
            if draw < weight {
                return index;
            }
            draw -= weight;
        }
        0
    }
}

#[must_use]
pub fn strategy_for(config: &LoadBalancingConfig) -> Box<dyn SelectionStrategy> {
    match config.strategy {
        LoadBalancingStrategy::RoundRobin => Box::new(RoundRobin),
        LoadBalancingStrategy::LeastConnections => Box::new(LeastConnections),
        LoadBalancingStrategy::Random => Box::new(Random),
        LoadBalancingStrategy::Weighted => Box::new(Weighted::new(config.weights.clone())),
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct LoadBalancerStats {
    pub service_name: String,
    pub strategy: LoadBalancingStrategy,
    pub total_instances: usize,
    pub healthy_instances: usize,
    pub unhealthy_instances: usize,
    pub total_connections: u64,
}

#[derive(Debug, Default)]
struct Pool {
    instances: Vec<ServiceInstance>,
    cursor: usize,
}

#[derive(Debug)]
pub struct LoadBalancer {
    service_name: String,
    health_check_required: bool,
    strategy: Box<dyn SelectionStrategy>,
    pool: Mutex<Pool>,
}

impl LoadBalancer {
    #[must_use]
    pub fn new(service_name: impl Into<String>, config: &LoadBalancingConfig) -> Self {
        Self {
            service_name: service_name.into(),
            health_check_required: config.health_check_required,
            strategy: strategy_for(config),
            pool: Mutex::new(Pool::default()),
        }
    }

    #[must_use]
    pub fn service_name(&self) -> &str {
        &self.service_name
    }

    /// Insert or replace by id; a replaced instance keeps its connection count
    pub fn add_instance(&self, mut instance: ServiceInstance) {
        let mut pool = self.pool.lock();
        if let Some(existing) = pool.instances.iter_mut().find(|i| i.id == instance.id) {
            instance.connections = existing.connections;
            *existing = instance;
        } else {
            debug!(
                service = %self.service_name,
                instance_id = %instance.id,
                url = %instance.url(),
                "Instance added to pool"
            );
            pool.instances.push(instance);
        }
    }

    /// Swap the whole pool in one step, carrying connection counts over by id
    pub fn replace_instances(&self, instances: Vec<ServiceInstance>) {
        let mut pool = self.pool.lock();
        let connections: HashMap<String, u32> = pool
            .instances
            .iter()
            .map(|i| (i.id.clone(), i.connections))
            .collect();

        pool.instances = instances
            .into_iter()
            .map(|mut instance| {
                instance.connections = connections.get(&instance.id).copied().unwrap_or(0);
                instance
            })
            .collect();
        if pool.cursor >= pool.instances.len() {
            pool.cursor = 0;
        }
    }

    pub fn remove_instance(&self, instance_id: &str) -> bool {
        let mut pool = self.pool.lock();
        let before = pool.instances.len();
        pool.instances.retain(|i| i.id != instance_id);
        let removed = pool.instances.len() != before;
        if pool.cursor >= pool.instances.len() {
            pool.cursor = 0;
        }
        if removed {
            debug!(service = %self.service_name, instance_id, "Instance removed from pool");
        }
        removed
    }

    /// Returns false when the instance is not in the pool
    pub fn update_instance_health(&self, instance_id: &str, healthy: bool) -> bool {
        let mut pool = self.pool.lock();
        let Some(instance) = pool.instances.iter_mut().find(|i| i.id == instance_id) else {
            return false;
        };

        instance.last_health_check = Some(Utc::now());
        if instance.healthy != healthy {
            instance.healthy = healthy;
            if healthy {
                info!(service = %self.service_name, instance_id, "Instance marked healthy");
            } else {
                warn!(service = %self.service_name, instance_id, "Instance marked unhealthy");
            }
        }
        true
    }

    /// Next instance per strategy, `None` when no eligible instance exists
    #[must_use]
    pub fn get_next_instance(&self) -> Option<ServiceInstance> {
        let mut guard = self.pool.lock();
        let pool = &mut *guard;

        let candidates: Vec<&ServiceInstance> = pool
            .instances
            .iter()
            .filter(|i| !self.health_check_required || i.healthy)
            .collect();
        if candidates.is_empty() {
            return None;
        }

        let index = self.strategy.select(&candidates, &mut pool.cursor);
        candidates.get(index).map(|instance| (*instance).clone())
    }

    pub fn increment_connections(&self, instance_id: &str) {
        let mut pool = self.pool.lock();
        if let Some(instance) = pool.instances.iter_mut().find(|i| i.id == instance_id) {
            instance.connections = instance.connections.saturating_add(1);
        }
    }

    pub fn decrement_connections(&self, instance_id: &str) {
        let mut pool = self.pool.lock();
        if let Some(instance) = pool.instances.iter_mut().find(|i| i.id == instance_id) {
            instance.connections = instance.connections.saturating_sub(1);
        }
    }

    #[must_use]
    pub fn get_statistics(&self) -> LoadBalancerStats {
        let pool = self.pool.lock();
        let healthy = pool.instances.iter().filter(|i| i.healthy).count();
        LoadBalancerStats {
            service_name: self.service_name.clone(),
            strategy: self.strategy.kind(),
            total_instances: pool.instances.len(),
            healthy_instances: healthy,
            unhealthy_instances: pool.instances.len() - healthy,
            total_connections: pool.instances.iter().map(|i| u64::from(i.connections)).sum(),
        }
    }

    #[must_use]
    pub fn instances(&self) -> Vec<ServiceInstance> {
        self.pool.lock().instances.clone()
    }

    pub fn clear(&self) {
        let mut pool = self.pool.lock();
        pool.instances.clear();
        pool.cursor = 0;
    }
}
