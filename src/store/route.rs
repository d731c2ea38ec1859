//! Route definitions.

use serde::Deserialize;

/// Prefix of the internal paths requests continue at after resolution.
pub const INTERNAL_PATH_PREFIX: &str = "/_epp-internal/";

/// How a path is matched.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PathMatchType {
    Exact,
    Prefix,
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct PathMatch {
    #[serde(rename = "type")]
    pub kind: PathMatchType,
    pub value: String,
}

/// What happens when the endpoint picker gives no endpoint.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureMode {
    /// Fall back to the pool's own endpoints.
    #[default]
    FailOpen,
    /// Fail the request.
    FailClose,
}

/// Endpoint picker serving a pool.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct EndpointPickerRef {
    pub host: String,
    pub port: u16,
    #[serde(default)]
    pub failure_mode: FailureMode,
}

/// A backend instance of a pool.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct Endpoint {
    /// `IP:PORT`.
    pub address: String,
    #[serde(default = "default_weight")]
    pub weight: u32,
}

fn default_weight() -> u32 {
    1
}

/// A set of model server endpoints, optionally fronted by an endpoint picker.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct Pool {
    pub name: String,
    pub endpoints: Vec<Endpoint>,
    #[serde(default)]
    pub endpoint_picker: Option<EndpointPickerRef>,
}

/// Routes matching requests to a pool.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct Route {
    pub id: String,
    /// Exact or `*.` wildcard hostnames. Empty matches every host.
    #[serde(default)]
    pub hostnames: Vec<String>,
    /// No path matches every path.
    #[serde(default)]
    pub path: Option<PathMatch>,
    pub pool: Pool,
}

impl Route {
    /// Internal path the request continues at once the picker was asked.
    pub fn internal_path(&self) -> String {
        format!("{}{}", INTERNAL_PATH_PREFIX, self.id)
    }

    pub fn endpoint_picker(&self) -> Option<&EndpointPickerRef> {
        self.pool.endpoint_picker.as_ref()
    }
}
