pub mod client;
pub mod current;
pub mod health_monitor;
pub mod load_balancer;
pub mod registry;

pub use client::{DiscoveryClientConfig, ServiceDiscoveryClient};
pub use health_monitor::{HealthCheckResult, HealthCheckSpec, HealthMonitor, HealthStatus, MonitoringStats};
pub use load_balancer::{
    strategy_for, LeastConnections, LoadBalancer, LoadBalancerStats, Random, RoundRobin, SelectionStrategy,
    ServiceInstance, Weighted,
};
pub use registry::{RegistryConfig, ServiceRegistry};
