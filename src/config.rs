//! Gateway configuration loaded from YAML.

use std::collections::HashSet;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;

use http::Uri;
use serde::Deserialize;
use thiserror::Error;

use crate::epp::{DEFAULT_DECISION_TIMEOUT, DEFAULT_DECISION_URI};
use crate::shim::PickerTls;
use crate::store::Route;

/// Upper bound on a pool endpoint's weight.
pub const MAX_ENDPOINT_WEIGHT: u32 = 1_000_000;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config file {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to parse YAML config: {0}")]
    Parse(#[from] serde_yaml::Error),

    #[error("invalid config: {0}")]
    Invalid(String),
}

/// Where the decision service is reached.
#[derive(Debug, Clone, Deserialize)]
pub struct DecisionConfig {
    #[serde(default = "default_decision_uri")]
    pub uri: String,
    #[serde(default = "default_decision_timeout_ms")]
    pub timeout_ms: u64,
}

impl Default for DecisionConfig {
    fn default() -> Self {
        Self {
            uri: default_decision_uri(),
            timeout_ms: default_decision_timeout_ms(),
        }
    }
}

/// The in-process endpoint picker shim.
#[derive(Debug, Clone, Deserialize)]
pub struct ShimConfig {
    /// Serve the shim from this process. Disable when it runs elsewhere.
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default = "default_shim_listen")]
    pub listen: SocketAddr,
    /// How endpoint pickers are dialled.
    #[serde(default)]
    pub tls: PickerTls,
}

impl Default for ShimConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            listen: default_shim_listen(),
            tls: PickerTls::default(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct UpstreamConfig {
    /// Consecutive connection failures before a pool endpoint is skipped.
    #[serde(default = "default_failure_threshold")]
    pub failure_threshold: u32,
}

impl Default for UpstreamConfig {
    fn default() -> Self {
        Self {
            failure_threshold: default_failure_threshold(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct GatewayConfig {
    #[serde(default = "default_listen")]
    pub listen: SocketAddr,
    #[serde(default = "default_health_listen")]
    pub health_listen: SocketAddr,
    /// Status returned when a request for a picker route lacks its
    /// routing variables.
    #[serde(default = "default_precondition_failure_status")]
    pub precondition_failure_status: u16,
    #[serde(default)]
    pub decision: DecisionConfig,
    #[serde(default)]
    pub shim: ShimConfig,
    #[serde(default)]
    pub upstream: UpstreamConfig,
    #[serde(default)]
    pub routes: Vec<Route>,
}

fn default_listen() -> SocketAddr {
    SocketAddr::from(([0, 0, 0, 0], 8080))
}

fn default_health_listen() -> SocketAddr {
    SocketAddr::from(([0, 0, 0, 0], 8081))
}

fn default_shim_listen() -> SocketAddr {
    SocketAddr::from(([127, 0, 0, 1], 54800))
}

fn default_precondition_failure_status() -> u16 {
    500
}

fn default_decision_uri() -> String {
    DEFAULT_DECISION_URI.to_string()
}

fn default_decision_timeout_ms() -> u64 {
    DEFAULT_DECISION_TIMEOUT.as_millis() as u64
}

fn default_failure_threshold() -> u32 {
    3
}

fn default_true() -> bool {
    true
}

impl GatewayConfig {
    /// Reads, parses and validates a config file.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        tracing::info!("Loading gateway config from: {}", path.display());
        let yaml = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_yaml(&yaml)
    }

    pub fn from_yaml(yaml: &str) -> Result<Self, ConfigError> {
        let config: Self = serde_yaml::from_str(yaml)?;
        config.validate()?;
        Ok(config)
    }

    pub fn decision_uri(&self) -> Result<Uri, ConfigError> {
        let uri: Uri = self.decision.uri.parse().map_err(|e| {
            ConfigError::Invalid(format!("decision.uri {:?}: {}", self.decision.uri, e))
        })?;
        if uri.authority().is_none() {
            return Err(ConfigError::Invalid(format!(
                "decision.uri {:?} has no host",
                self.decision.uri
            )));
        }
        Ok(uri)
    }

    pub fn decision_timeout(&self) -> Duration {
        Duration::from_millis(self.decision.timeout_ms)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if !(400..=599).contains(&self.precondition_failure_status) {
            return Err(ConfigError::Invalid(format!(
                "precondition_failure_status must be an error status, got {}",
                self.precondition_failure_status
            )));
        }
        self.decision_uri()?;
        if self.decision.timeout_ms == 0 {
            return Err(ConfigError::Invalid("decision.timeout_ms must be positive".into()));
        }

        let mut ids = HashSet::new();
        for route in &self.routes {
            if route.id.is_empty() {
                return Err(ConfigError::Invalid("route id must not be empty".into()));
            }
            if !ids.insert(route.id.as_str()) {
                return Err(ConfigError::Invalid(format!("duplicate route id {:?}", route.id)));
            }
            validate_route(route)?;
        }
        Ok(())
    }
}

fn validate_route(route: &Route) -> Result<(), ConfigError> {
    let invalid = |msg: String| ConfigError::Invalid(format!("route {:?}: {}", route.id, msg));

    // The id becomes a path segment of the internal path.
    if route.id.contains(['?', '#']) {
        return Err(invalid("id must not contain '?' or '#'".into()));
    }
    if let Some(path) = &route.path {
        if !path.value.starts_with('/') {
            return Err(invalid(format!("path {:?} must start with '/'", path.value)));
        }
    }
    if route.pool.endpoints.is_empty() {
        return Err(invalid(format!("pool {:?} has no endpoints", route.pool.name)));
    }
    for endpoint in &route.pool.endpoints {
        endpoint
            .address
            .parse::<SocketAddr>()
            .map_err(|e| invalid(format!("endpoint {:?}: {}", endpoint.address, e)))?;
        if endpoint.weight > MAX_ENDPOINT_WEIGHT {
            return Err(invalid(format!(
                "endpoint {:?} weight {} exceeds {}",
                endpoint.address, endpoint.weight, MAX_ENDPOINT_WEIGHT
            )));
        }
    }
    if let Some(picker) = route.endpoint_picker() {
        if picker.host.is_empty() {
            return Err(invalid("endpoint picker host must not be empty".into()));
        }
        if picker.port == 0 {
            return Err(invalid("endpoint picker port must not be 0".into()));
        }
    }
    Ok(())
}
