//! Outbound HTTP seam shared by RPC calls and health probes

use async_trait::async_trait;
use http::Method;
use serde_json::Value;
use std::collections::HashMap;
use std::time::Duration;

use crate::error::{Error, Result, TransportErrorCode};

pub const CORRELATION_ID_HEADER: &str = "x-correlation-id";
pub const REQUEST_ID_HEADER: &str = "x-request-id";

#[derive(Debug, Clone)]
pub struct TransportRequest {
    pub method: Method,
    pub url: String,
    pub headers: HashMap<String, String>,
    pub body: Option<Value>,
    pub timeout: Duration,
}

impl TransportRequest {
    #[must_use]
    pub fn get(url: impl Into<String>, timeout: Duration) -> Self {
        Self {
            method: Method::GET,
            url: url.into(),
            headers: HashMap::new(),
            body: None,
            timeout,
        }
    }
}

/// A response of any status; callers decide what counts as failure
#[derive(Debug, Clone, PartialEq)]
pub struct TransportResponse {
    pub status: u16,
    pub headers: HashMap<String, String>,
    /// Parsed JSON, a string for non-JSON bodies, `Null` when empty
    pub body: Value,
}

impl TransportResponse {
    #[must_use]
    pub fn new(status: u16, body: Value) -> Self {
        Self {
            status,
            headers: HashMap::new(),
            body,
        }
    }

    #[must_use]
    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.status)
    }
}

#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait Transport: Send + Sync {
    async fn send(&self, request: TransportRequest) -> Result<TransportResponse>;
}

/// `reqwest`-backed transport
#[derive(Debug, Clone)]
pub struct ReqwestTransport {
    client: reqwest::Client,
}

impl ReqwestTransport {
    pub fn new() -> Result<Self> {
        let client = reqwest::Client::builder()
            .user_agent(concat!("courier/", env!("CARGO_PKG_VERSION")))
            .build()
            .map_err(|e| Error::Configuration(format!("Failed to build HTTP client: {e}")))?;
        Ok(Self { client })
    }

    #[must_use]
    pub const fn with_client(client: reqwest::Client) -> Self {
        Self { client }
    }
}

#[async_trait]
impl Transport for ReqwestTransport {
    async fn send(&self, request: TransportRequest) -> Result<TransportResponse> {
        let mut builder = self
            .client
            .request(request.method, &request.url)
            .timeout(request.timeout);
        for (name, value) in &request.headers {
            builder = builder.header(name.as_str(), value.as_str());
        }
        if let Some(body) = &request.body {
            builder = builder.json(body);
        }

        let response = builder.send().await.map_err(|e| classify_reqwest_error(&e))?;

        let status = response.status().as_u16();
        let headers = response
            .headers()
            .iter()
            .filter_map(|(name, value)| {
                value
                    .to_str()
                    .ok()
                    .map(|value| (name.as_str().to_string(), value.to_string()))
            })
            .collect();
        let bytes = response.bytes().await.map_err(|e| classify_reqwest_error(&e))?;

        Ok(TransportResponse {
            status,
            headers,
            body: parse_body(&bytes),
        })
    }
}

fn parse_body(bytes: &[u8]) -> Value {
    if bytes.is_empty() {
        return Value::Null;
    }
    serde_json::from_slice(bytes)
        .unwrap_or_else(|_| Value::String(String::from_utf8_lossy(bytes).into_owned()))
}

/// Map a reqwest failure onto the retry policy's error codes
#[must_use]
pub fn classify_reqwest_error(err: &reqwest::Error) -> Error {
    let code = if err.is_timeout() {
        TransportErrorCode::TimedOut
    } else {
        classify_error_chain(err)
    };
    Error::transport(code, err.to_string())
}

/// Walk the source chain looking for an I/O kind or a resolver failure.
///
/// Falls back to message matching for wrapped errors (hyper, DNS resolvers)
/// that only surface the cause in their Display output.
fn classify_error_chain(err: &(dyn std::error::Error + 'static)) -> TransportErrorCode {
    let mut current = Some(err);
    while let Some(err) = current {
        if let Some(io_err) = err.downcast_ref::<std::io::Error>() {
            match io_err.kind() {
                std::io::ErrorKind::ConnectionRefused => return TransportErrorCode::ConnectionRefused,
                std::io::ErrorKind::ConnectionReset
                | std::io::ErrorKind::ConnectionAborted
                | std::io::ErrorKind::BrokenPipe
                | std::io::ErrorKind::UnexpectedEof => return TransportErrorCode::ConnectionReset,
                std::io::ErrorKind::TimedOut => return TransportErrorCode::TimedOut,
                _ => {}
            }
        }

        let message = err.to_string().to_lowercase();
        if message.contains("dns error")
            || message.contains("failed to lookup address")
            || message.contains("name or service not known")
            || message.contains("no such host")
        {
            return TransportErrorCode::NameNotFound;
        }
        if message.contains("connection refused") {
            return TransportErrorCode::ConnectionRefused;
        }
        if message.contains("connection reset") {
            return TransportErrorCode::ConnectionReset;
        }

        current = err.source();
    }
    TransportErrorCode::Other
}
