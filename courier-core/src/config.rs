use config::{Config as ConfigBuilder, ConfigError, Environment, File};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeSet, HashMap};
use std::path::Path;

/// Application configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub service: ServiceConfig,
    pub database: DatabaseConfig,
    pub registry: RegistryConfig,
    pub discovery: DiscoveryConfig,
    pub client: ClientConfig,
    pub logging: LoggingConfig,
}

/// Descriptor this process publishes about itself on self-registration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServiceConfig {
    pub name: String,
    pub version: String,
    pub host: String,
    pub port: u16,
    pub protocol: String,
    pub endpoints: Vec<String>,
    pub tags: BTreeSet<String>,
    pub metadata: HashMap<String, String>,
    /// Path probed by peers, relative to the service base URL (e.g. "/health")
    pub health_endpoint: Option<String>,
}

impl Default for ServiceConfig {
    fn default() -> Self {
        Self {
            name: "courier".to_string(),
            version: env!("CARGO_PKG_VERSION").to_string(),
            host: "127.0.0.1".to_string(),
            port: 8080,
            protocol: "http".to_string(),
            endpoints: Vec::new(),
            tags: BTreeSet::new(),
            metadata: HashMap::new(),
            health_endpoint: Some("/health".to_string()),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DatabaseConfig {
    /// Postgres URL; empty runs the registry on the in-memory store
    pub url: String,
    pub max_connections: u32,
    pub min_connections: u32,
    pub connect_timeout_seconds: u64,
    pub idle_timeout_seconds: u64,
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            url: String::new(),
            max_connections: 10,
            min_connections: 1,
            connect_timeout_seconds: 10,
            idle_timeout_seconds: 600,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RegistryConfig {
    pub registration_ttl_seconds: u64,
    pub cleanup_interval_seconds: u64,
}

impl Default for RegistryConfig {
    fn default() -> Self {
        Self {
            registration_ttl_seconds: 90,
            cleanup_interval_seconds: 30,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DiscoveryConfig {
    pub heartbeat_interval_seconds: u64,
    pub health_check_interval_seconds: u64,
    pub health_check_timeout_seconds: u64,
    pub health_check_retries: u32,
}

impl Default for DiscoveryConfig {
    fn default() -> Self {
        Self {
            heartbeat_interval_seconds: 30,
            health_check_interval_seconds: 30,
            health_check_timeout_seconds: 5,
            health_check_retries: 2,
        }
    }
}

/// Load balancing strategy
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LoadBalancingStrategy {
    /// Cursor over the pool, advanced on every selection
    #[default]
    RoundRobin,
    /// Instance with the fewest open connections
    LeastConnections,
    /// Uniform random selection
    Random,
    /// Random selection proportional to instance weight
    Weighted,
}

impl LoadBalancingStrategy {
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::RoundRobin => "round_robin",
            Self::LeastConnections => "least_connections",
            Self::Random => "random",
            Self::Weighted => "weighted",
        }
    }
}

impl std::fmt::Display for LoadBalancingStrategy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoadBalancingConfig {
    pub strategy: LoadBalancingStrategy,
    pub health_check_required: bool,
    /// Weight overrides keyed by instance id
    pub weights: HashMap<String, u32>,
}

impl Default for LoadBalancingConfig {
    fn default() -> Self {
        Self {
            strategy: LoadBalancingStrategy::RoundRobin,
            health_check_required: true,
            weights: HashMap::new(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RetrySettings {
    pub max_retries: u32,
    pub initial_delay_ms: u64,
    pub max_delay_ms: u64,
    pub backoff_multiplier: f64,
    pub jitter: bool,
    pub retryable_status_codes: Vec<u16>,
    /// Transport failure codes to retry, see [`TRANSPORT_ERROR_CODES`]
    pub retryable_error_codes: Vec<String>,
}

/// Every transport failure code the client classifies
pub const TRANSPORT_ERROR_CODES: [&str; 5] = [
    "connection_reset",
    "name_not_found",
    "timed_out",
    "connection_refused",
    "transport",
];

impl Default for RetrySettings {
    fn default() -> Self {
        Self {
            max_retries: 3,
            initial_delay_ms: 1000,
            max_delay_ms: 30_000,
            backoff_multiplier: 2.0,
            jitter: true,
            retryable_status_codes: vec![408, 429, 500, 502, 503, 504],
            retryable_error_codes: TRANSPORT_ERROR_CODES[..4].iter().map(ToString::to_string).collect(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CircuitBreakerSettings {
    pub failure_threshold: u32,
    pub recovery_timeout_ms: u64,
    pub half_open_max_calls: u32,
}

impl Default for CircuitBreakerSettings {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            recovery_timeout_ms: 60_000,
            half_open_max_calls: 3,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ClientConfig {
    pub request_timeout_ms: u64,
    pub load_balancing: LoadBalancingConfig,
    pub retry: RetrySettings,
    pub circuit_breaker: CircuitBreakerSettings,
    /// Fixed base URLs per target service, bypassing discovery
    pub base_urls: HashMap<String, String>,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            request_timeout_ms: 30_000,
            load_balancing: LoadBalancingConfig::default(),
            retry: RetrySettings::default(),
            circuit_breaker: CircuitBreakerSettings::default(),
            base_urls: HashMap::new(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    pub level: String,
    pub format: String, // "json" or "pretty"
    pub file_path: Option<String>,
    /// Extra `target=level` filter directives applied after the level
    #[serde(default)]
    pub directives: Vec<String>,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            format: "pretty".to_string(),
            file_path: None,
            directives: Vec::new(),
        }
    }
}

impl Config {
    /// Load configuration from multiple sources with priority:
    /// 1. Environment variables (highest priority)
    /// 2. Config file (if provided)
    /// 3. Defaults (lowest priority)
    pub fn load(config_file: Option<&str>) -> Result<Self, ConfigError> {
        let mut builder = ConfigBuilder::builder();

        if let Some(path) = config_file {
            if Path::new(path).exists() {
                builder = builder.add_source(File::with_name(path));
            }
        }

        // COURIER_SERVICE__NAME, COURIER_CLIENT__RETRY__MAX_RETRIES, ...
        builder = builder.add_source(
            Environment::with_prefix("COURIER")
                .prefix_separator("_")
                .separator("__")
                .try_parsing(true),
        );

        let config = builder.build()?;
        config.try_deserialize()
    }

    /// Load from environment variables only (for Docker/K8s)
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::load(None)
    }

    /// Load from file path
    pub fn from_file(path: &str) -> Result<Self, ConfigError> {
        Self::load(Some(path))
    }

    /// Collect every configuration problem instead of stopping at the first one
    pub fn validate(&self) -> Result<(), Vec<String>> {
        let mut errors = Vec::new();

        if self.service.name.trim().is_empty() {
            errors.push("service.name must not be empty".to_string());
        }
        if self.service.host.trim().is_empty() {
            errors.push("service.host must not be empty".to_string());
        }
        if self.service.port == 0 {
            errors.push("service.port must be non-zero".to_string());
        }
        if self.registry.registration_ttl_seconds == 0 {
            errors.push("registry.registration_ttl_seconds must be non-zero".to_string());
        }
        if self.registry.cleanup_interval_seconds == 0 {
            errors.push("registry.cleanup_interval_seconds must be non-zero".to_string());
        }
        if self.discovery.heartbeat_interval_seconds == 0 {
            errors.push("discovery.heartbeat_interval_seconds must be non-zero".to_string());
        }
        if self.discovery.heartbeat_interval_seconds >= self.registry.registration_ttl_seconds {
            errors.push(format!(
                "discovery.heartbeat_interval_seconds ({}) must be shorter than registry.registration_ttl_seconds ({})",
                self.discovery.heartbeat_interval_seconds, self.registry.registration_ttl_seconds
            ));
        }
        if self.client.request_timeout_ms == 0 {
            errors.push("client.request_timeout_ms must be non-zero".to_string());
        }
        if self.client.retry.backoff_multiplier < 1.0 {
            errors.push("client.retry.backoff_multiplier must be >= 1.0".to_string());
        }
        if self.client.retry.initial_delay_ms > self.client.retry.max_delay_ms {
            errors.push("client.retry.initial_delay_ms must not exceed max_delay_ms".to_string());
        }
        for code in &self.client.retry.retryable_error_codes {
            if !TRANSPORT_ERROR_CODES.contains(&code.as_str()) {
                errors.push(format!(
                    "client.retry.retryable_error_codes: unknown code {code:?}, expected one of {}",
                    TRANSPORT_ERROR_CODES.join(", ")
                ));
            }
        }
        if self.client.circuit_breaker.failure_threshold == 0 {
            errors.push("client.circuit_breaker.failure_threshold must be non-zero".to_string());
        }
        if self.client.circuit_breaker.half_open_max_calls == 0 {
            errors.push("client.circuit_breaker.half_open_max_calls must be non-zero".to_string());
        }
        if !matches!(self.logging.format.as_str(), "json" | "pretty") {
            errors.push(format!("logging.format must be \"json\" or \"pretty\", got {:?}", self.logging.format));
        }

        if errors.is_empty() {
            Ok(())
        } else {
            Err(errors)
        }
    }

    /// Base URL this process serves on
    #[must_use]
    pub fn service_address(&self) -> String {
        format!("{}://{}:{}", self.service.protocol, self.service.host, self.service.port)
    }
}
