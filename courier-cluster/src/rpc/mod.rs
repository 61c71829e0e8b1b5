pub mod client;
pub mod metrics;
pub mod pool;
pub mod retry;
pub mod transport;
pub mod types;

pub use client::{InterServiceClient, InterServiceClientConfig};
pub use metrics::{MetricsSnapshot, ServiceMetrics};
pub use pool::ServiceClients;
pub use retry::RetryConfig;
pub use transport::{ReqwestTransport, Transport, TransportRequest, TransportResponse};
pub use types::{RequestOptions, ServiceRequest, ServiceResponse};
