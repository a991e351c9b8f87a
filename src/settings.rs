//! Settings file for the `logs-collector` binary
//!
//! A YAML document describing where collected logs are forwarded and how the
//! collector listens:
//!
//! ```yaml
//! aggregator:
//!   host: agg.local
//!   port: 9000
//! filters:
//!   - name: grep
//!     match: "*"
//!     params:
//!       - { key: Regex, value: "level error" }
//! parsers:
//!   - name: json
//!     format: json
//! ```

use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::info;

use crate::collector::provisioner::{
    ProvisionParams, DEFAULT_HTTP_PORT, DEFAULT_HTTP_PORT_ID, DEFAULT_TCP_PORT,
    DEFAULT_TCP_PORT_ID,
};
use crate::collector::readiness::{PollPolicy, DEFAULT_MAX_ATTEMPTS};
use crate::collector::resources::DEFAULT_COLLECTOR_IMAGE;
use crate::collector::types::{Filter, Parser};
use crate::error::{Error, Result};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Settings {
    pub aggregator: AggregatorSettings,

    #[serde(default)]
    pub ports: PortSettings,

    /// Applied in order
    #[serde(default)]
    pub filters: Vec<Filter>,

    #[serde(default)]
    pub parsers: Vec<Parser>,

    #[serde(default)]
    pub readiness: ReadinessSettings,

    #[serde(default = "default_image")]
    pub image: String,
}

/// Remote endpoint receiving forwarded logs
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AggregatorSettings {
    pub host: String,
    pub port: u16,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PortSettings {
    #[serde(default = "default_http_port")]
    pub http: u16,
    #[serde(default = "default_tcp_port")]
    pub tcp: u16,
    #[serde(default = "default_http_port_id")]
    pub http_id: String,
    #[serde(default = "default_tcp_port_id")]
    pub tcp_id: String,
}

impl Default for PortSettings {
    fn default() -> Self {
        Self {
            http: default_http_port(),
            tcp: default_tcp_port(),
            http_id: default_http_port_id(),
            tcp_id: default_tcp_port_id(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ReadinessSettings {
    #[serde(default = "default_interval_secs")]
    pub interval_secs: u64,
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
}

impl Default for ReadinessSettings {
    fn default() -> Self {
        Self {
            interval_secs: default_interval_secs(),
            max_attempts: default_max_attempts(),
        }
    }
}

fn default_http_port() -> u16 {
    DEFAULT_HTTP_PORT
}

fn default_tcp_port() -> u16 {
    DEFAULT_TCP_PORT
}

fn default_http_port_id() -> String {
    DEFAULT_HTTP_PORT_ID.to_string()
}

fn default_tcp_port_id() -> String {
    DEFAULT_TCP_PORT_ID.to_string()
}

fn default_interval_secs() -> u64 {
    1
}

fn default_max_attempts() -> u32 {
    DEFAULT_MAX_ATTEMPTS
}

fn default_image() -> String {
    DEFAULT_COLLECTOR_IMAGE.to_string()
}

impl Settings {
    /// Read and validate a settings file
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let settings = Self::from_yaml(&content)?;
        info!("Loaded settings from {:?}", path);
        Ok(settings)
    }

    pub fn from_yaml(content: &str) -> Result<Self> {
        let settings: Settings = serde_yaml::from_str(content)?;
        settings.validate()?;
        Ok(settings)
    }

    pub fn validate(&self) -> Result<()> {
        self.poll_policy()?;
        if self.image.trim().is_empty() {
            return Err(Error::ConfigError("image must not be empty".to_string()));
        }
        if self.ports.http == 0 || self.ports.tcp == 0 {
            return Err(Error::ConfigError(
                "collector ports must be non-zero".to_string(),
            ));
        }
        self.provision_params().validate()
    }

    pub fn provision_params(&self) -> ProvisionParams {
        ProvisionParams {
            aggregator_host: self.aggregator.host.clone(),
            aggregator_port: self.aggregator.port,
            http_port: self.ports.http,
            tcp_port: self.ports.tcp,
            http_port_id: self.ports.http_id.clone(),
            tcp_port_id: self.ports.tcp_id.clone(),
            filters: self.filters.clone(),
            parsers: self.parsers.clone(),
        }
    }

    pub fn poll_policy(&self) -> Result<PollPolicy> {
        PollPolicy::new(
            Duration::from_secs(self.readiness.interval_secs),
            self.readiness.max_attempts,
        )
    }
}
