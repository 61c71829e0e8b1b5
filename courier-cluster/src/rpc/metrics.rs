//! Per-client request metrics over a bounded response-time window

use serde::Serialize;
use std::collections::VecDeque;
use std::time::Duration;

use crate::error::Error;

/// Response times kept for the average and percentiles
pub const RESPONSE_TIME_WINDOW: usize = 1000;

#[derive(Debug, Default)]
pub struct ServiceMetrics {
    response_times: VecDeque<Duration>,
    total_requests: u64,
    successful_requests: u64,
    failed_requests: u64,
    retries: u64,
    timeout_errors: u64,
    connection_errors: u64,
    circuit_breaker_trips: u64,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct MetricsSnapshot {
    pub total_requests: u64,
    pub successful_requests: u64,
    pub failed_requests: u64,
    pub retries: u64,
    pub timeout_errors: u64,
    pub connection_errors: u64,
    pub circuit_breaker_trips: u64,
    pub average_response_time_ms: f64,
    pub p95_response_time_ms: f64,
    pub p99_response_time_ms: f64,
    pub samples: usize,
}

impl ServiceMetrics {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record_request(&mut self) {
        self.total_requests += 1;
    }

    pub fn record_success(&mut self, elapsed: Duration) {
        self.successful_requests += 1;
        self.push_response_time(elapsed);
    }

    pub fn record_failure(&mut self, elapsed: Duration) {
        self.failed_requests += 1;
        self.push_response_time(elapsed);
    }

    pub fn record_retry(&mut self) {
        self.retries += 1;
    }

    /// Count one failed attempt by its class
    pub fn record_attempt_error(&mut self, err: &Error) {
        if err.is_timeout() {
            self.timeout_errors += 1;
        } else if err.is_connection_error() {
            self.connection_errors += 1;
        } else if err.is_circuit_open() {
            self.circuit_breaker_trips += 1;
        }
    }

    fn push_response_time(&mut self, elapsed: Duration) {
        if self.response_times.len() == RESPONSE_TIME_WINDOW {
            self.response_times.pop_front();
        }
        self.response_times.push_back(elapsed);
    }

    #[must_use]
    pub fn snapshot(&self) -> MetricsSnapshot {
        let mut samples: Vec<f64> = self
            .response_times
            .iter()
            .map(|d| d.as_secs_f64() * 1000.0)
            .collect();
        samples.sort_by(f64::total_cmp);

        let average = if samples.is_empty() {
            0.0
        } else {
            samples.iter().sum::<f64>() / samples.len() as f64
        };

        MetricsSnapshot {
            total_requests: self.total_requests,
            successful_requests: self.successful_requests,
            failed_requests: self.failed_requests,
            retries: self.retries,
            timeout_errors: self.timeout_errors,
            connection_errors: self.connection_errors,
            circuit_breaker_trips: self.circuit_breaker_trips,
            average_response_time_ms: average,
            p95_response_time_ms: percentile(&samples, 0.95),
            p99_response_time_ms: percentile(&samples, 0.99),
            samples: samples.len(),
        }
    }
}

/// Nearest-rank percentile over sorted samples
fn percentile(sorted: &[f64], p: f64) -> f64 {
    if sorted.is_empty() {
        return 0.0;
    }
    let rank = (p * sorted.len() as f64).ceil() as usize;
    sorted[rank.saturating_sub(1).min(sorted.len() - 1)]
}
