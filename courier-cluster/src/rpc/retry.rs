//! Retry policy: which failures to retry and how long to wait between attempts

use backon::{BackoffBuilder, ExponentialBackoff, ExponentialBuilder};
use rand::RngExt;
use std::collections::HashSet;
use std::time::Duration;
use tracing::warn;

use courier_core::config::RetrySettings;

use crate::error::{Error, TransportErrorCode};

/// Fraction of the base delay added or removed by jitter
const JITTER_RATIO: f64 = 0.25;

#[derive(Debug, Clone)]
pub struct RetryConfig {
    pub max_retries: u32,
    pub initial_delay: Duration,
    pub max_delay: Duration,
    pub backoff_multiplier: f64,
    pub jitter: bool,
    pub retryable_status_codes: HashSet<u16>,
    pub retryable_error_codes: HashSet<TransportErrorCode>,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_retries: 3,
            initial_delay: Duration::from_millis(1000),
            max_delay: Duration::from_millis(30_000),
            backoff_multiplier: 2.0,
            jitter: true,
            retryable_status_codes: HashSet::from([408, 429, 500, 502, 503, 504]),
            retryable_error_codes: HashSet::from([
                TransportErrorCode::ConnectionReset,
                TransportErrorCode::NameNotFound,
                TransportErrorCode::TimedOut,
                TransportErrorCode::ConnectionRefused,
            ]),
        }
    }
}

impl From<&RetrySettings> for RetryConfig {
    fn from(settings: &RetrySettings) -> Self {
        let retryable_error_codes = settings
            .retryable_error_codes
            .iter()
            .filter_map(|name| match name.parse() {
                Ok(code) => Some(code),
                Err(e) => {
                    warn!(error = %e, "Ignoring retryable error code");
                    None
                }
            })
            .collect();

        Self {
            max_retries: settings.max_retries,
            initial_delay: Duration::from_millis(settings.initial_delay_ms),
            max_delay: Duration::from_millis(settings.max_delay_ms),
            backoff_multiplier: settings.backoff_multiplier,
            jitter: settings.jitter,
            retryable_status_codes: settings.retryable_status_codes.iter().copied().collect(),
            retryable_error_codes,
        }
    }
}

impl RetryConfig {
    #[must_use]
    pub const fn with_max_retries(mut self, max_retries: u32) -> Self {
        self.max_retries = max_retries;
        self
    }

    #[must_use]
    pub const fn with_initial_delay(mut self, delay: Duration) -> Self {
        self.initial_delay = delay;
        self
    }

    #[must_use]
    pub const fn with_jitter(mut self, jitter: bool) -> Self {
        self.jitter = jitter;
        self
    }

    /// Base delays before each of the `max_retries` retries, without jitter:
    /// `min(initial * multiplier^n, max_delay)` for n = 0, 1, ...
    #[must_use]
    pub fn schedule(&self) -> ExponentialBackoff {
        ExponentialBuilder::default()
            .with_min_delay(self.initial_delay)
            .with_factor(self.backoff_multiplier as f32)
            .with_max_delay(self.max_delay)
            .with_max_times(self.max_retries as usize)
            .build()
    }

    /// Delays for one call's retries, jittered ±25% when enabled and never
    /// above `max_delay`; exhausted once `max_retries` delays were taken
    pub fn backoff(&self) -> impl Iterator<Item = Duration> + '_ {
        self.schedule().map(|base| self.jittered(base.min(self.max_delay)))
    }

    fn jittered(&self, base: Duration) -> Duration {
        if !self.jitter || base.is_zero() {
            return base;
        }
        let factor = 1.0 + rand::rng().random_range(-JITTER_RATIO..=JITTER_RATIO);
        base.mul_f64(factor).min(self.max_delay)
    }

    /// Transport failures by code, HTTP failures by status, nothing else
    #[must_use]
    pub fn is_retryable(&self, err: &Error) -> bool {
        match err {
            Error::Transport { code, .. } => self.retryable_error_codes.contains(code),
            Error::Status { status, .. } => self.retryable_status_codes.contains(status),
            _ => false,
        }
    }
}
