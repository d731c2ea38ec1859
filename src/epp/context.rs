//! Per-request state consumed and produced by the endpoint resolver.

use std::collections::HashMap;

use bytes::Bytes;
use http::{HeaderMap, Method};

use super::QueryArgs;

/// Variable holding the endpoint picker host.
pub const EPP_HOST_VAR: &str = "epp_host";
/// Variable holding the endpoint picker port.
pub const EPP_PORT_VAR: &str = "epp_port";
/// Variable holding the internal path the request continues at.
pub const EPP_INTERNAL_PATH_VAR: &str = "epp_internal_path";
/// Variable written with the `host:port` picked for the request.
pub const WORKLOAD_ENDPOINT_VAR: &str = "inference_workload_endpoint";

/// Named string variables attached to a single in-flight request.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Variables {
    values: HashMap<String, String>,
}

impl Variables {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns the value of `name`, if set.
    pub fn get(&self, name: &str) -> Option<&str> {
        self.values.get(name).map(String::as_str)
    }

    /// Returns the value of `name` only when it is set and not empty.
    pub fn get_non_empty(&self, name: &str) -> Option<&str> {
        self.get(name).filter(|v| !v.is_empty())
    }

    pub fn set(&mut self, name: impl Into<String>, value: impl Into<String>) {
        self.values.insert(name.into(), value.into());
    }
}

/// The slice of an inbound request that the resolver reads and writes.
///
/// Built by the gateway for each request that targets an inference pool.
/// Owned by that request's task, so no synchronisation is needed.
#[derive(Debug, Clone)]
pub struct RequestContext {
    pub method: Method,
    pub headers: HeaderMap,
    pub body: Bytes,
    pub args: QueryArgs,
    pub variables: Variables,
}

impl RequestContext {
    /// Creates a context with no variables set.
    pub fn new(method: Method, headers: HeaderMap, body: Bytes, args: QueryArgs) -> Self {
        Self {
            method,
            headers,
            body,
            args,
            variables: Variables::new(),
        }
    }

    /// The workload endpoint chosen by the picker, if resolution succeeded.
    pub fn workload_endpoint(&self) -> Option<&str> {
        self.variables.get(WORKLOAD_ENDPOINT_VAR)
    }
}
