pub mod discovery;
pub mod error;
pub mod resilience;
pub mod rpc;

mod util;

#[cfg(test)]
pub(crate) mod test_helpers;

pub use discovery::{
    HealthCheckResult, HealthCheckSpec, HealthMonitor, HealthStatus, LoadBalancer, ServiceDiscoveryClient,
    ServiceInstance, ServiceRegistry,
};
pub use error::{Error, Result, ServiceError, TransportErrorCode};
pub use resilience::{CircuitBreaker, CircuitBreakerConfig, CircuitState};
pub use rpc::{InterServiceClient, InterServiceClientConfig, RequestOptions, ServiceClients, ServiceResponse};
