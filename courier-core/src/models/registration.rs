//! Service registration records and discovery queries

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeSet, HashMap};
use std::str::FromStr;
use std::time::Duration;

use crate::error::Error;

/// Lifecycle status a registrant reports about itself
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ServiceStatus {
    #[default]
    Starting,
    Healthy,
    Unhealthy,
    Stopping,
}

impl ServiceStatus {
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Starting => "starting",
            Self::Healthy => "healthy",
            Self::Unhealthy => "unhealthy",
            Self::Stopping => "stopping",
        }
    }
}

impl std::fmt::Display for ServiceStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ServiceStatus {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "starting" => Ok(Self::Starting),
            "healthy" => Ok(Self::Healthy),
            "unhealthy" => Ok(Self::Unhealthy),
            "stopping" => Ok(Self::Stopping),
            other => Err(Error::InvalidInput(format!("Unknown service status: {other}"))),
        }
    }
}

/// What a process publishes when it registers; the registry assigns id and timestamps
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServiceDescriptor {
    pub name: String,
    pub version: String,
    pub host: String,
    pub port: u16,
    #[serde(default = "default_protocol")]
    pub protocol: String,
    #[serde(default)]
    pub endpoints: Vec<String>,
    #[serde(default)]
    pub metadata: HashMap<String, String>,
    #[serde(default)]
    pub tags: BTreeSet<String>,
    #[serde(default)]
    pub status: ServiceStatus,
}

fn default_protocol() -> String {
    "http".to_string()
}

impl ServiceDescriptor {
    #[must_use]
    pub fn new(name: impl Into<String>, host: impl Into<String>, port: u16) -> Self {
        Self {
            name: name.into(),
            version: "0.0.0".to_string(),
            host: host.into(),
            port,
            protocol: default_protocol(),
            endpoints: Vec::new(),
            metadata: HashMap::new(),
            tags: BTreeSet::new(),
            status: ServiceStatus::Starting,
        }
    }

    #[must_use]
    pub fn with_version(mut self, version: impl Into<String>) -> Self {
        self.version = version.into();
        self
    }

    #[must_use]
    pub fn with_protocol(mut self, protocol: impl Into<String>) -> Self {
        self.protocol = protocol.into();
        self
    }

    #[must_use]
    pub fn with_endpoint(mut self, endpoint: impl Into<String>) -> Self {
        self.endpoints.push(endpoint.into());
        self
    }

    #[must_use]
    pub fn with_tag(mut self, tag: impl Into<String>) -> Self {
        self.tags.insert(tag.into());
        self
    }

    #[must_use]
    pub fn with_metadata(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.metadata.insert(key.into(), value.into());
        self
    }

    #[must_use]
    pub const fn with_status(mut self, status: ServiceStatus) -> Self {
        self.status = status;
        self
    }
}

/// A running service instance as held by the registry
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ServiceRegistration {
    pub id: String,
    pub name: String,
    pub version: String,
    pub host: String,
    pub port: u16,
    pub protocol: String,
    pub endpoints: Vec<String>,
    pub metadata: HashMap<String, String>,
    pub tags: BTreeSet<String>,
    pub registered_at: DateTime<Utc>,
    pub last_heartbeat: DateTime<Utc>,
    pub status: ServiceStatus,
}

impl ServiceRegistration {
    /// Stamp a descriptor with its id; `registered_at` and `last_heartbeat` both become `now`
    #[must_use]
    pub fn from_descriptor(id: String, descriptor: ServiceDescriptor, now: DateTime<Utc>) -> Self {
        Self {
            id,
            name: descriptor.name,
            version: descriptor.version,
            host: descriptor.host,
            port: descriptor.port,
            protocol: descriptor.protocol,
            endpoints: descriptor.endpoints,
            metadata: descriptor.metadata,
            tags: descriptor.tags,
            registered_at: now,
            last_heartbeat: now,
            status: descriptor.status,
        }
    }

    /// True once `now - last_heartbeat` exceeds `ttl`
    #[must_use]
    pub fn is_expired(&self, ttl: Duration, now: DateTime<Utc>) -> bool {
        let elapsed = now.signed_duration_since(self.last_heartbeat);
        elapsed.to_std().is_ok_and(|elapsed| elapsed > ttl)
    }

    #[must_use]
    pub fn base_url(&self) -> String {
        format!("{}://{}:{}", self.protocol, self.host, self.port)
    }
}

/// AND-combined discovery filter; unset fields match everything
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ServiceQuery {
    pub name: Option<String>,
    pub status: Option<ServiceStatus>,
    pub version: Option<String>,
    /// Every listed tag must be present on the registration
    pub tags: Vec<String>,
    /// Every listed key must be present with an equal value
    pub metadata: HashMap<String, String>,
}

impl ServiceQuery {
    #[must_use]
    pub fn all() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn by_name(name: impl Into<String>) -> Self {
        Self {
            name: Some(name.into()),
            ..Self::default()
        }
    }

    #[must_use]
    pub const fn with_status(mut self, status: ServiceStatus) -> Self {
        self.status = Some(status);
        self
    }

    #[must_use]
    pub fn with_version(mut self, version: impl Into<String>) -> Self {
        self.version = Some(version.into());
        self
    }

    #[must_use]
    pub fn with_tag(mut self, tag: impl Into<String>) -> Self {
        self.tags.push(tag.into());
        self
    }

    #[must_use]
    pub fn with_metadata(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.metadata.insert(key.into(), value.into());
        self
    }

    #[must_use]
    pub fn matches(&self, registration: &ServiceRegistration) -> bool {
        if self.name.as_ref().is_some_and(|name| *name != registration.name) {
            return false;
        }
        if self.status.is_some_and(|status| status != registration.status) {
            return false;
        }
        if self.version.as_ref().is_some_and(|version| *version != registration.version) {
            return false;
        }
        if !self.tags.iter().all(|tag| registration.tags.contains(tag)) {
            return false;
        }
        self.metadata
            .iter()
            .all(|(key, value)| registration.metadata.get(key) == Some(value))
    }
}
