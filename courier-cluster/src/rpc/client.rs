//! Resilient client for one target service
//!
//! Every call runs the same pipeline: pick an instance, send through the
//! circuit breaker with a timeout, and retry classified failures with
//! exponential backoff. Breaker rejections are never retried.

use chrono::Utc;
use http::Method;
use parking_lot::Mutex;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use courier_core::config::{ClientConfig, LoadBalancingConfig};
use courier_core::metrics::rpc::{RPC_REQUESTS_TOTAL, RPC_REQUEST_DURATION, RPC_RETRIES_TOTAL};
use courier_core::{ServiceQuery, ServiceStatus};

use super::metrics::{MetricsSnapshot, ServiceMetrics};
use super::retry::RetryConfig;
use super::transport::{
    Transport, TransportRequest, TransportResponse, CORRELATION_ID_HEADER, REQUEST_ID_HEADER,
};
use super::types::{join_url, RequestOptions, ServiceRequest, ServiceResponse};
use crate::discovery::{
    HealthStatus, LoadBalancer, LoadBalancerStats, ServiceDiscoveryClient, ServiceInstance,
};
use crate::error::{Error, Result, ServiceError, TransportErrorCode};
use crate::resilience::{CircuitBreaker, CircuitBreakerConfig, CircuitBreakerMetrics};

#[derive(Debug, Clone)]
pub struct InterServiceClientConfig {
    pub target_service: String,
    /// Fixed base URL used instead of discovered instances
    pub base_url: Option<String>,
    pub default_timeout: Duration,
    pub retry: RetryConfig,
    pub circuit_breaker: CircuitBreakerConfig,
    pub load_balancing: LoadBalancingConfig,
}

impl InterServiceClientConfig {
    #[must_use]
    pub fn new(target_service: impl Into<String>) -> Self {
        Self {
            target_service: target_service.into(),
            base_url: None,
            default_timeout: Duration::from_secs(30),
            retry: RetryConfig::default(),
            circuit_breaker: CircuitBreakerConfig::default(),
            load_balancing: LoadBalancingConfig::default(),
        }
    }

    #[must_use]
    pub fn from_client_config(target_service: &str, config: &ClientConfig) -> Self {
        Self {
            target_service: target_service.to_string(),
            base_url: config.base_urls.get(target_service).cloned(),
            default_timeout: Duration::from_millis(config.request_timeout_ms),
            retry: RetryConfig::from(&config.retry),
            circuit_breaker: CircuitBreakerConfig::from(&config.circuit_breaker),
            load_balancing: config.load_balancing.clone(),
        }
    }

    #[must_use]
    pub fn with_base_url(mut self, base_url: impl Into<String>) -> Self {
        self.base_url = Some(base_url.into());
        self
    }

    #[must_use]
    pub const fn with_timeout(mut self, timeout: Duration) -> Self {
        self.default_timeout = timeout;
        self
    }

    #[must_use]
    pub fn with_retry(mut self, retry: RetryConfig) -> Self {
        self.retry = retry;
        self
    }

    #[must_use]
    pub const fn with_circuit_breaker(mut self, circuit_breaker: CircuitBreakerConfig) -> Self {
        self.circuit_breaker = circuit_breaker;
        self
    }

    #[must_use]
    pub fn with_load_balancing(mut self, load_balancing: LoadBalancingConfig) -> Self {
        self.load_balancing = load_balancing;
        self
    }

    pub fn validate(&self) -> Result<()> {
        if self.target_service.trim().is_empty() {
            return Err(Error::Configuration("Target service cannot be empty".to_string()));
        }
        if let Some(base_url) = &self.base_url {
            url::Url::parse(base_url)
                .map_err(|e| Error::Configuration(format!("Invalid base URL {base_url}: {e}")))?;
        }
        if self.default_timeout.is_zero() {
            return Err(Error::Configuration("Request timeout must be positive".to_string()));
        }
        if self.circuit_breaker.failure_threshold == 0 {
            return Err(Error::Configuration("Circuit breaker failure threshold must be non-zero".to_string()));
        }
        if self.circuit_breaker.half_open_max_calls == 0 {
            return Err(Error::Configuration("Circuit breaker half-open calls must be non-zero".to_string()));
        }
        if !self.retry.backoff_multiplier.is_finite() || self.retry.backoff_multiplier < 1.0 {
            return Err(Error::Configuration(format!(
                "Backoff multiplier must be >= 1.0, got {}",
                self.retry.backoff_multiplier
            )));
        }
        if self.retry.initial_delay > self.retry.max_delay {
            return Err(Error::Configuration("Initial retry delay must not exceed max delay".to_string()));
        }
        Ok(())
    }
}

/// Outcome of the retry loop: the final result plus how many attempts ran
struct Attempted {
    result: Result<(TransportResponse, Option<String>)>,
    attempts: u32,
}

pub struct InterServiceClient {
    config: InterServiceClientConfig,
    transport: Arc<dyn Transport>,
    discovery: Arc<ServiceDiscoveryClient>,
    circuit_breaker: CircuitBreaker,
    load_balancer: LoadBalancer,
    metrics: Mutex<ServiceMetrics>,
}

impl InterServiceClient {
    /// Build a client and seed its instance pool from discovery.
    ///
    /// An empty discovery result is not an error; the pool is refreshed
    /// again on the first call that finds it empty.
    pub async fn new(
        config: InterServiceClientConfig,
        discovery: Arc<ServiceDiscoveryClient>,
        transport: Arc<dyn Transport>,
    ) -> Result<Self> {
        config.validate()?;

        let client = Self {
            circuit_breaker: CircuitBreaker::new(
                config.target_service.clone(),
                config.circuit_breaker.clone(),
            ),
            load_balancer: LoadBalancer::new(config.target_service.clone(), &config.load_balancing),
            config,
            transport,
            discovery,
            metrics: Mutex::new(ServiceMetrics::new()),
        };

        if client.config.base_url.is_none() {
            client.refresh_instances().await;
        }
        info!(
            target_service = %client.config.target_service,
            strategy = %client.config.load_balancing.strategy,
            instances = client.load_balancer.get_statistics().total_instances,
            "Inter-service client ready"
        );
        Ok(client)
    }

    #[must_use]
    pub fn target_service(&self) -> &str {
        &self.config.target_service
    }

    #[must_use]
    pub const fn load_balancer(&self) -> &LoadBalancer {
        &self.load_balancer
    }

    #[must_use]
    pub const fn circuit_breaker(&self) -> &CircuitBreaker {
        &self.circuit_breaker
    }

    /// Rebuild the pool from the registry, overlaying monitored health.
    ///
    /// Returns the number of instances now in the pool.
    pub async fn refresh_instances(&self) -> usize {
        let query = ServiceQuery::by_name(self.config.target_service.clone());
        let registrations = self.discovery.discover_services(&query).await;

        let instances: Vec<ServiceInstance> = registrations
            .iter()
            .filter(|registration| registration.status != ServiceStatus::Stopping)
            .map(|registration| {
                let mut instance = ServiceInstance::from_registration(registration);
                if let Some(health) = self.discovery.health_status(&registration.id) {
                    if health.status == HealthStatus::Unhealthy {
                        instance.healthy = false;
                    }
                    instance.last_health_check = Some(health.timestamp);
                }
                instance
            })
            .collect();

        let count = instances.len();
        self.load_balancer.replace_instances(instances);
        if count == 0 {
            warn!(target_service = %self.config.target_service, "No instances discovered");
        } else {
            debug!(target_service = %self.config.target_service, count, "Instance pool refreshed");
        }
        count
    }

    pub async fn request(
        &self,
        method: Method,
        path: &str,
        options: RequestOptions,
    ) -> std::result::Result<ServiceResponse, ServiceError> {
        let request = ServiceRequest::stamp(&self.config.target_service, method, path, options);
        let started = Instant::now();
        self.metrics.lock().record_request();

        debug!(
            target_service = %request.target,
            method = %request.method,
            path = %request.path,
            request_id = %request.id,
            correlation_id = %request.correlation_id,
            "Sending inter-service request"
        );

        let Attempted { result, attempts } = self.execute_with_retry(&request).await;
        let processing_time = started.elapsed();
        RPC_REQUEST_DURATION
            .with_label_values(&[request.target.as_str()])
            .observe(processing_time.as_secs_f64());

        match result {
            Ok((response, instance_id)) => {
                self.metrics.lock().record_success(processing_time);
                RPC_REQUESTS_TOTAL
                    .with_label_values(&[request.target.as_str(), "success"])
                    .inc();
                debug!(
                    request_id = %request.id,
                    status = response.status,
                    attempts,
                    elapsed_ms = processing_time.as_millis() as u64,
                    "Inter-service request succeeded"
                );

                Ok(ServiceResponse {
                    request_id: request.id,
                    correlation_id: request.correlation_id,
                    status: response.status,
                    headers: response.headers,
                    body: response.body,
                    instance_id,
                    attempts,
                    processing_time,
                    timestamp: Utc::now(),
                })
            }
            Err(err) => {
                self.metrics.lock().record_failure(processing_time);
                RPC_REQUESTS_TOTAL
                    .with_label_values(&[request.target.as_str(), err.code()])
                    .inc();

                let retryable = self.config.retry.is_retryable(&err);
                let service_error = ServiceError::from_error(&err, retryable, &request, attempts);
                warn!(
                    target_service = %request.target,
                    request_id = %request.id,
                    correlation_id = %request.correlation_id,
                    code = %service_error.code,
                    attempts,
                    error = %err,
                    "Inter-service request failed"
                );
                Err(service_error)
            }
        }
    }

    async fn execute_with_retry(&self, request: &ServiceRequest) -> Attempted {
        let mut backoff = self.config.retry.backoff();
        let mut attempts = 0u32;
        loop {
            attempts += 1;
            let err = match self.attempt_once(request).await {
                Ok(ok) => {
                    return Attempted {
                        result: Ok(ok),
                        attempts,
                    };
                }
                Err(err) => err,
            };
            self.metrics.lock().record_attempt_error(&err);

            let next_delay = if self.config.retry.is_retryable(&err) {
                backoff.next()
            } else {
                None
            };
            let Some(delay) = next_delay else {
                return Attempted {
                    result: Err(err),
                    attempts,
                };
            };

            self.metrics.lock().record_retry();
            RPC_RETRIES_TOTAL
                .with_label_values(&[request.target.as_str()])
                .inc();
            debug!(
                request_id = %request.id,
                attempt = attempts,
                delay_ms = delay.as_millis() as u64,
                error = %err,
                "Retrying inter-service request"
            );

            tokio::time::sleep(delay).await;
        }
    }

    async fn attempt_once(&self, request: &ServiceRequest) -> Result<(TransportResponse, Option<String>)> {
        let override_url = request.base_url.clone().or_else(|| self.config.base_url.clone());
        let (base_url, instance_id) = match override_url {
            Some(base_url) => (base_url, None),
            None => {
                let instance = self
                    .select_instance()
                    .await
                    .ok_or_else(|| Error::NoInstanceAvailable(self.config.target_service.clone()))?;
                (instance.url(), Some(instance.id))
            }
        };
        let url = join_url(&base_url, &request.path);

        if let Some(id) = &instance_id {
            self.load_balancer.increment_connections(id);
        }
        let result = self.circuit_breaker.execute(|| self.send(request, &url)).await;
        if let Some(id) = &instance_id {
            self.load_balancer.decrement_connections(id);
            match &result {
                Ok(_) => {
                    self.load_balancer.update_instance_health(id, true);
                }
                Err(err) if err.is_connection_error() => {
                    self.load_balancer.update_instance_health(id, false);
                }
                Err(_) => {}
            }
        }

        result.map(|response| (response, instance_id))
    }

    async fn select_instance(&self) -> Option<ServiceInstance> {
        if let Some(instance) = self.load_balancer.get_next_instance() {
            return Some(instance);
        }
        debug!(target_service = %self.config.target_service, "No eligible instance, refreshing pool");
        self.refresh_instances().await;
        self.load_balancer.get_next_instance()
    }

    async fn send(&self, request: &ServiceRequest, url: &str) -> Result<TransportResponse> {
        let timeout = request.timeout.unwrap_or(self.config.default_timeout);

        let mut headers = request.headers.clone();
        headers.insert(CORRELATION_ID_HEADER.to_string(), request.correlation_id.clone());
        headers.insert(REQUEST_ID_HEADER.to_string(), request.id.clone());

        let transport_request = TransportRequest {
            method: request.method.clone(),
            url: url.to_string(),
            headers,
            body: request.body.clone(),
            timeout,
        };

        let response = match tokio::time::timeout(timeout, self.transport.send(transport_request)).await {
            Ok(result) => result?,
            Err(_) => {
                return Err(Error::transport(
                    TransportErrorCode::TimedOut,
                    format!("{} {url} timed out after {}ms", request.method, timeout.as_millis()),
                ));
            }
        };

        if response.is_success() {
            Ok(response)
        } else {
            Err(Error::Status {
                status: response.status,
                url: url.to_string(),
                body: response.body,
            })
        }
    }

    pub async fn get(&self, path: &str, options: RequestOptions) -> std::result::Result<ServiceResponse, ServiceError> {
        self.request(Method::GET, path, options).await
    }

    pub async fn post(&self, path: &str, options: RequestOptions) -> std::result::Result<ServiceResponse, ServiceError> {
        self.request(Method::POST, path, options).await
    }

    pub async fn put(&self, path: &str, options: RequestOptions) -> std::result::Result<ServiceResponse, ServiceError> {
        self.request(Method::PUT, path, options).await
    }

    pub async fn patch(&self, path: &str, options: RequestOptions) -> std::result::Result<ServiceResponse, ServiceError> {
        self.request(Method::PATCH, path, options).await
    }

    pub async fn delete(&self, path: &str, options: RequestOptions) -> std::result::Result<ServiceResponse, ServiceError> {
        self.request(Method::DELETE, path, options).await
    }

    #[must_use]
    pub fn get_metrics(&self) -> MetricsSnapshot {
        self.metrics.lock().snapshot()
    }

    #[must_use]
    pub fn get_circuit_breaker_metrics(&self) -> CircuitBreakerMetrics {
        self.circuit_breaker.get_metrics()
    }

    #[must_use]
    pub fn get_load_balancer_stats(&self) -> LoadBalancerStats {
        self.load_balancer.get_statistics()
    }

    /// Release this client's instance pool.
    ///
    /// The discovery client is shared with other targets and the process's
    /// own registration, so it is left running; [`ServiceClients::shutdown`]
    /// or the owner of the discovery client tears it down.
    ///
    /// [`ServiceClients::shutdown`]: super::ServiceClients::shutdown
    pub fn shutdown(&self) {
        self.load_balancer.clear();
        info!(target_service = %self.config.target_service, "Inter-service client shut down");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::discovery::{DiscoveryClientConfig, HealthMonitor, RegistryConfig, ServiceRegistry};
    use crate::resilience::CircuitState;
    use crate::rpc::transport::MockTransport;
    use crate::test_helpers::descriptor;
    use courier_core::MemoryRegistrationStore;
    use mockall::Sequence;
    use serde_json::{json, Value};

    async fn discovery() -> Arc<ServiceDiscoveryClient> {
        let registry = Arc::new(
            ServiceRegistry::new(Arc::new(MemoryRegistrationStore::new()), RegistryConfig::default()).await,
        );
        let monitor = Arc::new(HealthMonitor::new(Arc::new(MockTransport::new())));
        Arc::new(ServiceDiscoveryClient::new(
            registry,
            monitor,
            DiscoveryClientConfig::default(),
        ))
    }

    async fn discovery_with_orders() -> (Arc<ServiceDiscoveryClient>, String) {
        let discovery = discovery().await;
        let id = discovery
            .registry()
            .register(descriptor("orders", "10.0.0.5", 8080).with_status(ServiceStatus::Healthy))
            .await
            .unwrap();
        (discovery, id)
    }

    fn config() -> InterServiceClientConfig {
        InterServiceClientConfig::new("orders").with_retry(RetryConfig::default().with_jitter(false))
    }

    fn respond(status: u16, body: Value) -> Result<TransportResponse> {
        Ok(TransportResponse::new(status, body))
    }

    #[tokio::test]
    async fn test_shutdown_leaves_shared_discovery_running() {
        let (discovery, _) = discovery_with_orders().await;
        let own_id = discovery
            .register_service(descriptor("me", "10.0.0.9", 9000), None)
            .await
            .unwrap();

        let orders = InterServiceClient::new(config(), discovery.clone(), Arc::new(MockTransport::new()))
            .await
            .unwrap();
        let billing = InterServiceClient::new(
            InterServiceClientConfig::new("billing"),
            discovery.clone(),
            Arc::new(MockTransport::new()),
        )
        .await
        .unwrap();
        assert_eq!(orders.get_load_balancer_stats().total_instances, 1);

        orders.shutdown();

        assert_eq!(orders.get_load_balancer_stats().total_instances, 0);
        assert_eq!(discovery.registration_id().await, Some(own_id));
        assert_eq!(billing.target_service(), "billing");
        assert_eq!(
            discovery
                .discover_services(&ServiceQuery::by_name("orders"))
                .await
                .len(),
            1
        );

        discovery.shutdown().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_retries_until_success() {
        let (discovery, id) = discovery_with_orders().await;
        let mut transport = MockTransport::new();
        let mut seq = Sequence::new();
        transport
            .expect_send()
            .times(2)
            .in_sequence(&mut seq)
            .returning(|_| respond(503, json!({"error": "busy"})));
        transport
            .expect_send()
            .times(1)
            .in_sequence(&mut seq)
            .returning(|_| respond(200, json!({"id": 1})));

        let client = InterServiceClient::new(config(), discovery, Arc::new(transport))
            .await
            .unwrap();
        let response = client.get("/orders/1", RequestOptions::new()).await.unwrap();

        assert_eq!(response.status, 200);
        assert_eq!(response.body, json!({"id": 1}));
        assert_eq!(response.attempts, 3);
        assert_eq!(response.instance_id, Some(id));

        let metrics = client.get_metrics();
        assert_eq!(metrics.total_requests, 1);
        assert_eq!(metrics.successful_requests, 1);
        assert_eq!(metrics.retries, 2);
        assert_eq!(client.get_load_balancer_stats().total_connections, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_non_retryable_status_fails_immediately() {
        let (discovery, _) = discovery_with_orders().await;
        let mut transport = MockTransport::new();
        transport
            .expect_send()
            .times(1)
            .returning(|_| respond(404, json!({"error": "missing"})));

        let client = InterServiceClient::new(config(), discovery, Arc::new(transport))
            .await
            .unwrap();
        let err = client.get("/orders/404", RequestOptions::new()).await.unwrap_err();

        assert_eq!(err.code, "http_status");
        assert_eq!(err.status, Some(404));
        assert_eq!(err.body, Some(json!({"error": "missing"})));
        assert!(!err.retryable);
        assert_eq!(err.attempts, 1);
        assert_eq!(client.get_metrics().retries, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_retries_are_bounded() {
        let (discovery, _) = discovery_with_orders().await;
        let mut transport = MockTransport::new();
        transport
            .expect_send()
            .times(4)
            .returning(|_| respond(503, Value::Null));

        let client = InterServiceClient::new(config(), discovery, Arc::new(transport))
            .await
            .unwrap();
        let err = client.get("/orders", RequestOptions::new()).await.unwrap_err();

        assert_eq!(err.attempts, 4);
        assert!(err.retryable);
        assert_eq!(err.status, Some(503));
        let metrics = client.get_metrics();
        assert_eq!(metrics.retries, 3);
        assert_eq!(metrics.failed_requests, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_open_breaker_fails_fast_without_retry() {
        let (discovery, _) = discovery_with_orders().await;
        let mut transport = MockTransport::new();
        transport
            .expect_send()
            .times(2)
            .returning(|_| respond(500, Value::Null));

        let config = config()
            .with_retry(RetryConfig::default().with_max_retries(0))
            .with_circuit_breaker(CircuitBreakerConfig {
                failure_threshold: 2,
                ..CircuitBreakerConfig::default()
            });
        let client = InterServiceClient::new(config, discovery, Arc::new(transport))
            .await
            .unwrap();

        client.get("/a", RequestOptions::new()).await.unwrap_err();
        client.get("/a", RequestOptions::new()).await.unwrap_err();
        assert_eq!(client.circuit_breaker().get_state(), CircuitState::Open);

        let err = client.get("/a", RequestOptions::new()).await.unwrap_err();
        assert_eq!(err.code, "circuit_open");
        assert_eq!(err.breaker_state, Some(CircuitState::Open));
        assert!(!err.retryable);
        assert_eq!(err.attempts, 1);
        assert_eq!(client.get_metrics().circuit_breaker_trips, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_breaker_rejection_not_retried_even_with_retries_left() {
        let (discovery, _) = discovery_with_orders().await;
        let mut transport = MockTransport::new();
        transport.expect_send().never();

        let client = InterServiceClient::new(config(), discovery, Arc::new(transport))
            .await
            .unwrap();
        client.circuit_breaker().force_state(CircuitState::Open);

        let err = client.get("/a", RequestOptions::new()).await.unwrap_err();
        assert!(err.is_circuit_open());
        assert_eq!(err.attempts, 1);
        assert_eq!(client.get_metrics().retries, 0);
    }

    #[tokio::test]
    async fn test_tracing_headers_are_sent() {
        let (discovery, _) = discovery_with_orders().await;
        let mut transport = MockTransport::new();
        transport
            .expect_send()
            .withf(|request| {
                request.headers.get(CORRELATION_ID_HEADER).map(String::as_str) == Some("corr-42")
                    && request
                        .headers
                        .get(REQUEST_ID_HEADER)
                        .is_some_and(|id| id.starts_with("req_"))
                    && request.headers.get("x-tenant").map(String::as_str) == Some("acme")
                    && request.url == "http://10.0.0.5:8080/orders"
                    && request.method == Method::POST
                    && request.body == Some(json!({"sku": "abc"}))
            })
            .times(1)
            .returning(|_| respond(201, json!({"id": 9})));

        let client = InterServiceClient::new(config(), discovery, Arc::new(transport))
            .await
            .unwrap();
        let response = client
            .post(
                "/orders",
                RequestOptions::new()
                    .with_correlation_id("corr-42")
                    .with_header("x-tenant", "acme")
                    .with_json(json!({"sku": "abc"})),
            )
            .await
            .unwrap();

        assert_eq!(response.correlation_id, "corr-42");
        assert!(response.request_id.starts_with("req_"));
    }

    #[tokio::test]
    async fn test_no_instance_fails_without_sending() {
        let discovery = discovery().await;
        let mut transport = MockTransport::new();
        transport.expect_send().never();

        let client = InterServiceClient::new(config(), discovery, Arc::new(transport))
            .await
            .unwrap();
        let err = client.get("/orders", RequestOptions::new()).await.unwrap_err();

        assert_eq!(err.code, "no_instance_available");
        assert!(!err.retryable);
        assert_eq!(err.attempts, 1);
    }

    #[tokio::test]
    async fn test_late_registration_is_found_on_refresh() {
        let discovery = discovery().await;
        let mut transport = MockTransport::new();
        transport
            .expect_send()
            .times(1)
            .returning(|_| respond(200, Value::Null));

        let client = InterServiceClient::new(config(), discovery.clone(), Arc::new(transport))
            .await
            .unwrap();
        assert_eq!(client.get_load_balancer_stats().total_instances, 0);

        discovery
            .registry()
            .register(descriptor("orders", "10.0.0.7", 8080))
            .await
            .unwrap();
        client.get("/orders", RequestOptions::new()).await.unwrap();
        assert_eq!(client.get_load_balancer_stats().total_instances, 1);
    }

    #[tokio::test]
    async fn test_base_url_override_bypasses_discovery() {
        let discovery = discovery().await;
        let mut transport = MockTransport::new();
        let mut seq = Sequence::new();
        transport
            .expect_send()
            .withf(|request| request.url == "http://fixed:9000/api/orders")
            .times(1)
            .in_sequence(&mut seq)
            .returning(|_| respond(200, Value::Null));
        transport
            .expect_send()
            .withf(|request| request.url == "http://other:9100/orders")
            .times(1)
            .in_sequence(&mut seq)
            .returning(|_| respond(200, Value::Null));

        let client = InterServiceClient::new(
            config().with_base_url("http://fixed:9000/api/"),
            discovery,
            Arc::new(transport),
        )
        .await
        .unwrap();

        let response = client.get("/orders", RequestOptions::new()).await.unwrap();
        assert!(response.instance_id.is_none());

        client
            .get("orders", RequestOptions::new().with_base_url("http://other:9100"))
            .await
            .unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_timeout_is_classified_and_retried() {
        struct Slow;

        #[async_trait::async_trait]
        impl Transport for Slow {
            async fn send(&self, _request: TransportRequest) -> Result<TransportResponse> {
                tokio::time::sleep(Duration::from_secs(60)).await;
                Ok(TransportResponse::new(200, Value::Null))
            }
        }

        let (discovery, _) = discovery_with_orders().await;
        let client = InterServiceClient::new(
            config().with_retry(RetryConfig::default().with_max_retries(1).with_jitter(false)),
            discovery,
            Arc::new(Slow),
        )
        .await
        .unwrap();

        let err = client
            .get("/slow", RequestOptions::new().with_timeout(Duration::from_secs(2)))
            .await
            .unwrap_err();
        assert_eq!(err.code, "timed_out");
        assert!(err.retryable);
        assert_eq!(err.attempts, 2);
        assert_eq!(client.get_metrics().timeout_errors, 2);
    }

    #[tokio::test]
    async fn test_connection_failure_marks_instance_unhealthy() {
        let (discovery, _) = discovery_with_orders().await;
        let mut transport = MockTransport::new();
        transport.expect_send().times(1).returning(|_| {
            Err(Error::transport(
                TransportErrorCode::ConnectionRefused,
                "connection refused",
            ))
        });

        let client = InterServiceClient::new(
            config().with_retry(RetryConfig::default().with_max_retries(0)),
            discovery,
            Arc::new(transport),
        )
        .await
        .unwrap();

        let err = client.get("/orders", RequestOptions::new()).await.unwrap_err();
        assert_eq!(err.code, "connection_refused");
        let stats = client.get_load_balancer_stats();
        assert_eq!(stats.unhealthy_instances, 1);
        assert_eq!(client.get_metrics().connection_errors, 1);
    }

    #[tokio::test]
    async fn test_invalid_base_url_is_rejected() {
        let discovery = discovery().await;
        let result = InterServiceClient::new(
            config().with_base_url("not a url"),
            discovery,
            Arc::new(MockTransport::new()),
        )
        .await;
        assert!(matches!(result, Err(Error::Configuration(_))));
    }

    #[tokio::test]
    async fn test_unusable_breaker_and_retry_settings_are_rejected() {
        let zero_trials = CircuitBreakerConfig {
            half_open_max_calls: 0,
            ..CircuitBreakerConfig::default()
        };
        let zero_threshold = CircuitBreakerConfig {
            failure_threshold: 0,
            ..CircuitBreakerConfig::default()
        };
        let shrinking = RetryConfig {
            backoff_multiplier: 0.5,
            ..RetryConfig::default()
        };
        let inverted = RetryConfig::default().with_initial_delay(Duration::from_secs(60));

        for config in [
            config().with_circuit_breaker(zero_trials),
            config().with_circuit_breaker(zero_threshold),
            config().with_retry(shrinking),
            config().with_retry(inverted),
        ] {
            assert!(matches!(config.validate(), Err(Error::Configuration(_))));
            let result = InterServiceClient::new(config, discovery().await, Arc::new(MockTransport::new())).await;
            assert!(matches!(result, Err(Error::Configuration(_))));
        }
        assert!(config().validate().is_ok());
    }
}
