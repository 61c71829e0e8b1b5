use chrono::{DateTime, Utc};
use http::Method;
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::Value;
use std::collections::HashMap;
use std::time::Duration;

use courier_core::logging::{generate_correlation_id, generate_request_id};

use crate::error::ServiceError;

/// Per-call options for [`InterServiceClient`](super::InterServiceClient)
#[derive(Debug, Clone, Default)]
pub struct RequestOptions {
    pub headers: HashMap<String, String>,
    pub body: Option<Value>,
    /// Overrides the client's default timeout for this call
    pub timeout: Option<Duration>,
    /// Propagated from an inbound request when set, generated otherwise
    pub correlation_id: Option<String>,
    /// Bypasses instance selection for this call
    pub base_url: Option<String>,
}

impl RequestOptions {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn with_header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.insert(name.into(), value.into());
        self
    }

    #[must_use]
    pub fn with_json(mut self, body: Value) -> Self {
        self.body = Some(body);
        self
    }

    #[must_use]
    pub const fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    #[must_use]
    pub fn with_correlation_id(mut self, correlation_id: impl Into<String>) -> Self {
        self.correlation_id = Some(correlation_id.into());
        self
    }

    #[must_use]
    pub fn with_base_url(mut self, base_url: impl Into<String>) -> Self {
        self.base_url = Some(base_url.into());
        self
    }
}

/// A stamped outbound request, fixed for every attempt of one call
#[derive(Debug, Clone)]
pub struct ServiceRequest {
    pub id: String,
    pub correlation_id: String,
    pub target: String,
    pub method: Method,
    pub path: String,
    pub headers: HashMap<String, String>,
    pub body: Option<Value>,
    pub timeout: Option<Duration>,
    pub base_url: Option<String>,
    pub timestamp: DateTime<Utc>,
}

impl ServiceRequest {
    #[must_use]
    pub fn stamp(target: &str, method: Method, path: &str, options: RequestOptions) -> Self {
        Self {
            id: generate_request_id(),
            correlation_id: options
                .correlation_id
                .unwrap_or_else(generate_correlation_id),
            target: target.to_string(),
            method,
            path: path.to_string(),
            headers: options.headers,
            body: options.body,
            timeout: options.timeout,
            base_url: options.base_url,
            timestamp: Utc::now(),
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct ServiceResponse {
    pub request_id: String,
    pub correlation_id: String,
    pub status: u16,
    pub headers: HashMap<String, String>,
    pub body: Value,
    /// Instance that served the call, `None` when a base URL override was used
    pub instance_id: Option<String>,
    pub attempts: u32,
    #[serde(rename = "processing_time_ms", serialize_with = "crate::util::serialize_duration_ms")]
    pub processing_time: Duration,
    pub timestamp: DateTime<Utc>,
}

impl ServiceResponse {
    /// Decode the body into a typed value
    pub fn json<T: DeserializeOwned>(&self) -> Result<T, serde_json::Error> {
        serde_json::from_value(self.body.clone())
    }
}

impl ServiceError {
    pub(crate) fn from_error(
        err: &crate::Error,
        retryable: bool,
        request: &ServiceRequest,
        attempts: u32,
    ) -> Self {
        let (status, body) = match err {
            crate::Error::Status { status, body, .. } => (Some(*status), Some(body.clone())),
            _ => (None, None),
        };
        let breaker_state = match err {
            crate::Error::CircuitOpen { state, .. } => Some(*state),
            _ => None,
        };

        Self {
            code: err.code().to_string(),
            message: err.to_string(),
            retryable,
            status,
            body,
            breaker_state,
            target: request.target.clone(),
            correlation_id: request.correlation_id.clone(),
            request_id: request.id.clone(),
            attempts,
        }
    }
}

/// Join a base URL and a request path with exactly one slash between them
#[must_use]
pub fn join_url(base_url: &str, path: &str) -> String {
    if path.is_empty() {
        return base_url.to_string();
    }
    format!(
        "{}/{}",
        base_url.trim_end_matches('/'),
        path.trim_start_matches('/')
    )
}
