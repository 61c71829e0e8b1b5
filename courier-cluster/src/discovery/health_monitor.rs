//! Periodic HTTP health probing of registered services
//!
//! Each monitored service gets its own loop, cancelled through a
//! per-monitor token. The first probe runs as soon as monitoring starts.

use chrono::{DateTime, Utc};
use parking_lot::{Mutex, RwLock};
use serde::Serialize;
use serde_json::Value;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use courier_core::config::DiscoveryConfig;
use courier_core::metrics::discovery::HEALTH_CHECKS_TOTAL;

use crate::error::{Error, TransportErrorCode};
use crate::rpc::transport::{Transport, TransportRequest, TransportResponse};

/// How to probe one service
#[derive(Debug, Clone)]
pub struct HealthCheckSpec {
    /// Absolute URL of the health endpoint
    pub endpoint: String,
    pub interval: Duration,
    pub timeout: Duration,
    /// Extra attempts after a transport failure within one check
    pub retries: u32,
    /// Exact status to expect; any 2xx when unset
    pub expected_status: Option<u16>,
    /// Body must equal this JSON value when set
    pub expected_response: Option<Value>,
}

impl HealthCheckSpec {
    #[must_use]
    pub fn new(endpoint: impl Into<String>) -> Self {
        Self {
            endpoint: endpoint.into(),
            interval: Duration::from_secs(30),
            timeout: Duration::from_secs(5),
            retries: 2,
            expected_status: None,
            expected_response: None,
        }
    }

    #[must_use]
    pub fn from_config(endpoint: impl Into<String>, config: &DiscoveryConfig) -> Self {
        Self {
            interval: Duration::from_secs(config.health_check_interval_seconds),
            timeout: Duration::from_secs(config.health_check_timeout_seconds),
            retries: config.health_check_retries,
            ..Self::new(endpoint)
        }
    }

    #[must_use]
    pub const fn with_interval(mut self, interval: Duration) -> Self {
        self.interval = interval;
        self
    }

    #[must_use]
    pub const fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    #[must_use]
    pub const fn with_retries(mut self, retries: u32) -> Self {
        self.retries = retries;
        self
    }

    #[must_use]
    pub const fn with_expected_status(mut self, status: u16) -> Self {
        self.expected_status = Some(status);
        self
    }

    #[must_use]
    pub fn with_expected_response(mut self, body: Value) -> Self {
        self.expected_response = Some(body);
        self
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum HealthStatus {
    Healthy,
    Unhealthy,
    Unknown,
}

impl HealthStatus {
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Healthy => "healthy",
            Self::Unhealthy => "unhealthy",
            Self::Unknown => "unknown",
        }
    }
}

impl std::fmt::Display for HealthStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct HealthCheckResult {
    pub status: HealthStatus,
    pub timestamp: DateTime<Utc>,
    #[serde(rename = "response_time_ms", serialize_with = "crate::util::serialize_duration_ms")]
    pub response_time: Duration,
    pub status_code: Option<u16>,
    /// Probes issued for this check
    pub attempts: u32,
    /// Response body of the deciding probe
    pub details: Option<Value>,
    pub errors: Vec<String>,
}

impl HealthCheckResult {
    fn unknown() -> Self {
        Self {
            status: HealthStatus::Unknown,
            timestamp: Utc::now(),
            response_time: Duration::ZERO,
            status_code: None,
            attempts: 0,
            details: None,
            errors: Vec::new(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct MonitoringStats {
    pub active_monitors: usize,
    pub healthy: usize,
    pub unhealthy: usize,
    pub unknown: usize,
    pub total_checks: u64,
}

struct MonitorHandle {
    cancel: CancellationToken,
    task: JoinHandle<()>,
}

pub struct HealthMonitor {
    transport: Arc<dyn Transport>,
    monitors: Mutex<HashMap<String, MonitorHandle>>,
    results: Arc<RwLock<HashMap<String, HealthCheckResult>>>,
    total_checks: Arc<AtomicU64>,
}

impl HealthMonitor {
    #[must_use]
    pub fn new(transport: Arc<dyn Transport>) -> Self {
        Self {
            transport,
            monitors: Mutex::new(HashMap::new()),
            results: Arc::new(RwLock::new(HashMap::new())),
            total_checks: Arc::new(AtomicU64::new(0)),
        }
    }

    /// Start probing `service_id`, replacing any monitor already running for it.
    ///
    /// The status reads `Unknown` until the first check completes.
    pub fn start_monitoring(&self, service_id: &str, spec: HealthCheckSpec) {
        let mut monitors = self.monitors.lock();
        if let Some(previous) = monitors.remove(service_id) {
            previous.cancel.cancel();
            debug!(service_id, "Replacing existing health monitor");
        }

        self.results
            .write()
            .insert(service_id.to_string(), HealthCheckResult::unknown());

        let cancel = CancellationToken::new();
        let task = tokio::spawn(Self::monitor_loop(
            service_id.to_string(),
            spec.clone(),
            Arc::clone(&self.transport),
            Arc::clone(&self.results),
            Arc::clone(&self.total_checks),
            cancel.clone(),
        ));
        monitors.insert(service_id.to_string(), MonitorHandle { cancel, task });

        info!(
            service_id,
            endpoint = %spec.endpoint,
            interval_secs = spec.interval.as_secs(),
            "Health monitoring started"
        );
    }

    async fn monitor_loop(
        service_id: String,
        spec: HealthCheckSpec,
        transport: Arc<dyn Transport>,
        results: Arc<RwLock<HashMap<String, HealthCheckResult>>>,
        total_checks: Arc<AtomicU64>,
        cancel: CancellationToken,
    ) {
        let mut timer = tokio::time::interval(spec.interval.max(Duration::from_millis(1)));
        timer.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                biased;
                () = cancel.cancelled() => break,
                _ = timer.tick() => {}
            }

            let result = tokio::select! {
                biased;
                () = cancel.cancelled() => break,
                result = run_check(transport.as_ref(), &spec) => result,
            };

            total_checks.fetch_add(1, Ordering::Relaxed);
            HEALTH_CHECKS_TOTAL
                .with_label_values(&[result.status.as_str()])
                .inc();

            let mut latest = results.write();
            // A replaced monitor must not overwrite its successor's state
            if cancel.is_cancelled() {
                break;
            }
            let previous = latest.get(&service_id).map(|r| r.status);
            if previous != Some(result.status) {
                match result.status {
                    HealthStatus::Healthy => {
                        info!(service_id = %service_id, "Service is healthy");
                    }
                    _ => {
                        warn!(
                            service_id = %service_id,
                            status = %result.status,
                            errors = ?result.errors,
                            "Service health degraded"
                        );
                    }
                }
            }
            latest.insert(service_id.clone(), result);
        }

        debug!(service_id = %service_id, "Health monitor stopped");
    }

    /// Run one check against `spec` without recording the result
    pub async fn check(&self, spec: &HealthCheckSpec) -> HealthCheckResult {
        run_check(self.transport.as_ref(), spec).await
    }

    /// Returns false when `service_id` was not monitored
    pub fn stop_monitoring(&self, service_id: &str) -> bool {
        let handle = self.monitors.lock().remove(service_id);
        // Cancel first so a check finishing now cannot re-insert its result
        if let Some(handle) = &handle {
            handle.cancel.cancel();
        }
        self.results.write().remove(service_id);

        if handle.is_some() {
            info!(service_id, "Health monitoring stopped");
        }
        handle.is_some()
    }

    #[must_use]
    pub fn get_health_status(&self, service_id: &str) -> Option<HealthCheckResult> {
        self.results.read().get(service_id).cloned()
    }

    #[must_use]
    pub fn get_all_health_statuses(&self) -> HashMap<String, HealthCheckResult> {
        self.results.read().clone()
    }

    #[must_use]
    pub fn get_monitoring_stats(&self) -> MonitoringStats {
        let active_monitors = self.monitors.lock().len();
        let results = self.results.read();
        let count = |status: HealthStatus| results.values().filter(|r| r.status == status).count();

        MonitoringStats {
            active_monitors,
            healthy: count(HealthStatus::Healthy),
            unhealthy: count(HealthStatus::Unhealthy),
            unknown: count(HealthStatus::Unknown),
            total_checks: self.total_checks.load(Ordering::Relaxed),
        }
    }

    /// Cancel every monitor and wait for the loops to exit
    pub async fn shutdown(&self) {
        let handles: Vec<MonitorHandle> = self.monitors.lock().drain().map(|(_, h)| h).collect();
        for handle in &handles {
            handle.cancel.cancel();
        }
        let stopped = handles.len();
        futures::future::join_all(handles.into_iter().map(|h| h.task)).await;
        if stopped > 0 {
            info!(count = stopped, "Health monitors shut down");
        }
    }
}

impl Drop for HealthMonitor {
    fn drop(&mut self) {
        for (_, handle) in self.monitors.get_mut().drain() {
            handle.cancel.cancel();
        }
    }
}

/// One check: up to `retries + 1` probes, retrying only transport failures
async fn run_check(transport: &dyn Transport, spec: &HealthCheckSpec) -> HealthCheckResult {
    let started = Instant::now();
    let mut errors = Vec::new();

    for attempt in 1..=spec.retries.saturating_add(1) {
        let probe_started = Instant::now();
        let request = TransportRequest::get(spec.endpoint.clone(), spec.timeout);
        let outcome = match tokio::time::timeout(spec.timeout, transport.send(request)).await {
            Ok(outcome) => outcome,
            Err(_) => Err(Error::transport(
                TransportErrorCode::TimedOut,
                format!("health check timed out after {}ms", spec.timeout.as_millis()),
            )),
        };

        match outcome {
            Ok(response) => {
                return evaluate(spec, response, probe_started.elapsed(), attempt, errors);
            }
            Err(e) => {
                debug!(endpoint = %spec.endpoint, attempt, error = %e, "Health probe failed");
                errors.push(e.to_string());
            }
        }
    }

    HealthCheckResult {
        status: HealthStatus::Unhealthy,
        timestamp: Utc::now(),
        response_time: started.elapsed(),
        status_code: None,
        attempts: spec.retries.saturating_add(1),
        details: None,
        errors,
    }
}

fn evaluate(
    spec: &HealthCheckSpec,
    response: TransportResponse,
    response_time: Duration,
    attempts: u32,
    mut errors: Vec<String>,
) -> HealthCheckResult {
    let status_ok = match spec.expected_status {
        Some(expected) => response.status == expected,
        None => response.is_success(),
    };
    if !status_ok {
        errors.push(match spec.expected_status {
            Some(expected) => format!("unexpected status {} (expected {expected})", response.status),
            None => format!("unexpected status {}", response.status),
        });
    }

    let body_ok = spec
        .expected_response
        .as_ref()
        .is_none_or(|expected| *expected == response.body);
    if !body_ok {
        errors.push("response body did not match expected response".to_string());
    }

    HealthCheckResult {
        status: if status_ok && body_ok {
            HealthStatus::Healthy
        } else {
            HealthStatus::Unhealthy
        },
        timestamp: Utc::now(),
        response_time,
        status_code: Some(response.status),
        attempts,
        details: Some(response.body),
        errors,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::rpc::transport::MockTransport;
    use mockall::Sequence;
    use serde_json::json;

    fn refused() -> Error {
        Error::transport(TransportErrorCode::ConnectionRefused, "connection refused")
    }

    fn spec() -> HealthCheckSpec {
        HealthCheckSpec::new("http://10.0.0.5:8080/health")
            .with_interval(Duration::from_secs(10))
            .with_timeout(Duration::from_secs(1))
    }

    #[tokio::test]
    async fn test_always_failing_endpoint_makes_retries_plus_one_attempts() {
        let mut transport = MockTransport::new();
        transport.expect_send().times(3).returning(|_| Err(refused()));
        let monitor = HealthMonitor::new(Arc::new(transport));

        let result = monitor.check(&spec().with_retries(2)).await;
        assert_eq!(result.status, HealthStatus::Unhealthy);
        assert_eq!(result.attempts, 3);
        assert_eq!(result.errors.len(), 3);
        assert!(result.status_code.is_none());
    }

    #[tokio::test]
    async fn test_retry_recovers_after_transport_failure() {
        let mut transport = MockTransport::new();
        let mut seq = Sequence::new();
        transport
            .expect_send()
            .times(1)
            .in_sequence(&mut seq)
            .returning(|_| Err(refused()));
        transport
            .expect_send()
            .times(1)
            .in_sequence(&mut seq)
            .returning(|_| Ok(TransportResponse::new(200, json!({"status": "ok"}))));
        let monitor = HealthMonitor::new(Arc::new(transport));

        let result = monitor.check(&spec()).await;
        assert_eq!(result.status, HealthStatus::Healthy);
        assert_eq!(result.attempts, 2);
        assert_eq!(result.status_code, Some(200));
    }

    #[tokio::test]
    async fn test_bad_status_is_not_retried() {
        let mut transport = MockTransport::new();
        transport
            .expect_send()
            .times(1)
            .returning(|_| Ok(TransportResponse::new(503, Value::Null)));
        let monitor = HealthMonitor::new(Arc::new(transport));

        let result = monitor.check(&spec()).await;
        assert_eq!(result.status, HealthStatus::Unhealthy);
        assert_eq!(result.status_code, Some(503));
        assert_eq!(result.attempts, 1);
    }

    #[tokio::test]
    async fn test_expected_status_and_body() {
        let mut transport = MockTransport::new();
        transport
            .expect_send()
            .returning(|_| Ok(TransportResponse::new(204, json!({"status": "ok", "db": "up"}))));
        let monitor = HealthMonitor::new(Arc::new(transport));

        let healthy = monitor
            .check(
                &spec()
                    .with_expected_status(204)
                    .with_expected_response(json!({"db": "up", "status": "ok"})),
            )
            .await;
        assert_eq!(healthy.status, HealthStatus::Healthy);

        let wrong_status = monitor.check(&spec().with_expected_status(200)).await;
        assert_eq!(wrong_status.status, HealthStatus::Unhealthy);

        let wrong_body = monitor
            .check(&spec().with_expected_response(json!({"status": "ok"})))
            .await;
        assert_eq!(wrong_body.status, HealthStatus::Unhealthy);
        assert_eq!(wrong_body.errors.len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_request_timeout_counts_as_failure() {
        struct Hanging;

        #[async_trait::async_trait]
        impl Transport for Hanging {
            async fn send(&self, _request: TransportRequest) -> crate::Result<TransportResponse> {
                std::future::pending().await
            }
        }

        let monitor = HealthMonitor::new(Arc::new(Hanging));
        let result = monitor.check(&spec().with_retries(0)).await;
        assert_eq!(result.status, HealthStatus::Unhealthy);
        assert_eq!(result.attempts, 1);
        assert!(result.errors[0].contains("timed out"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_monitoring_lifecycle() {
        let mut transport = MockTransport::new();
        transport
            .expect_send()
            .returning(|_| Ok(TransportResponse::new(200, Value::Null)));
        let monitor = HealthMonitor::new(Arc::new(transport));

        monitor.start_monitoring("orders-1", spec());
        assert_eq!(
            monitor.get_health_status("orders-1").unwrap().status,
            HealthStatus::Unknown
        );

        // Let the immediate first probe run
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert_eq!(
            monitor.get_health_status("orders-1").unwrap().status,
            HealthStatus::Healthy
        );

        tokio::time::sleep(Duration::from_secs(25)).await;
        let stats = monitor.get_monitoring_stats();
        assert_eq!(stats.active_monitors, 1);
        assert_eq!(stats.healthy, 1);
        assert_eq!(stats.total_checks, 3);

        assert!(monitor.stop_monitoring("orders-1"));
        assert!(!monitor.stop_monitoring("orders-1"));
        assert!(monitor.get_health_status("orders-1").is_none());
        assert_eq!(monitor.get_monitoring_stats().active_monitors, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_stop_during_in_flight_check_leaves_no_result() {
        struct Gated(Arc<tokio::sync::Notify>);

        #[async_trait::async_trait]
        impl Transport for Gated {
            async fn send(&self, _request: TransportRequest) -> crate::Result<TransportResponse> {
                self.0.notified().await;
                Ok(TransportResponse::new(200, Value::Null))
            }
        }

        let gate = Arc::new(tokio::sync::Notify::new());
        let monitor = HealthMonitor::new(Arc::new(Gated(gate.clone())));
        monitor.start_monitoring("orders-1", spec().with_timeout(Duration::from_secs(60)));
        tokio::time::sleep(Duration::from_millis(10)).await;

        assert!(monitor.stop_monitoring("orders-1"));
        gate.notify_waiters();
        tokio::time::sleep(Duration::from_millis(10)).await;

        assert!(monitor.get_health_status("orders-1").is_none());
        assert!(monitor.get_all_health_statuses().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_restart_replaces_monitor() {
        let mut transport = MockTransport::new();
        transport
            .expect_send()
            .returning(|_| Ok(TransportResponse::new(200, Value::Null)));
        let monitor = HealthMonitor::new(Arc::new(transport));

        monitor.start_monitoring("orders-1", spec());
        monitor.start_monitoring("orders-1", spec());
        tokio::time::sleep(Duration::from_millis(10)).await;

        let stats = monitor.get_monitoring_stats();
        assert_eq!(stats.active_monitors, 1);
        assert_eq!(stats.total_checks, 1);

        monitor.shutdown().await;
        assert_eq!(monitor.get_monitoring_stats().active_monitors, 0);
    }
}
