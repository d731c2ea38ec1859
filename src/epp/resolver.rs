//! Endpoint resolution filter.
//!
//! Asks the decision service which workload endpoint should serve a
//! request, records the answer in the request context and then continues
//! processing at the configured internal path. Decision failures never
//! fail the request; only missing routing variables do.

use std::fmt;
use std::sync::Arc;

use http::header::HeaderName;
use http::{HeaderValue, StatusCode};
use http_body_util::BodyExt;
use thiserror::Error;

use super::context::{
    RequestContext, EPP_HOST_VAR, EPP_INTERNAL_PATH_VAR, EPP_PORT_VAR, WORKLOAD_ENDPOINT_VAR,
};
use super::{DecisionClient, DecisionError, DecisionRequest};

/// Header telling the decision service which endpoint picker host to ask.
pub const EPP_HOST_HEADER: HeaderName = HeaderName::from_static("x-epp-host");
/// Header telling the decision service which endpoint picker port to ask.
pub const EPP_PORT_HEADER: HeaderName = HeaderName::from_static("x-epp-port");
/// Response header carrying the picked `host:port`.
pub const ENDPOINT_HEADER: HeaderName = HeaderName::from_static("x-gateway-destination-endpoint");

/// Routing variables are missing. The request cannot be handled.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ResolveError {
    #[error("missing required variables: epp_host and/or epp_port")]
    MissingRoutingVariables,

    #[error("missing required variable: epp_internal_path")]
    MissingInternalPath,
}

/// Result of consulting the decision service.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DecisionOutcome {
    /// The picker chose an endpoint.
    Resolved { endpoint: String },
    /// The decision service answered without a usable endpoint.
    Declined { status: StatusCode, body: String },
    /// The decision service could not be reached or its answer not read.
    Unavailable { reason: String },
}

impl fmt::Display for DecisionOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Resolved { endpoint } => {
                write!(f, "found inference endpoint from EndpointPicker: {}", endpoint)
            }
            Self::Declined { status, body } => write!(
                f,
                "could not get specific inference endpoint from EndpointPicker; status: {}; body: {}",
                status.as_u16(),
                body
            ),
            Self::Unavailable { reason } => {
                write!(f, "error contacting EndpointPicker: {}", reason)
            }
        }
    }
}

/// What a completed resolution did.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Resolution {
    pub outcome: DecisionOutcome,
    /// Path handed to the [`Forwarder`], query string included.
    pub continuation: String,
}

impl Resolution {
    pub fn endpoint(&self) -> Option<&str> {
        match &self.outcome {
            DecisionOutcome::Resolved { endpoint } => Some(endpoint),
            _ => None,
        }
    }
}

/// Continues request processing at an internal path.
///
/// Called exactly once per resolution that passes the precondition
/// checks, after the decision query has settled.
pub trait Forwarder: Send {
    fn forward(&mut self, path: String);
}

/// Resolves workload endpoints through a [`DecisionClient`].
#[derive(Clone)]
pub struct EndpointResolver {
    client: Arc<dyn DecisionClient>,
}

impl EndpointResolver {
    pub fn new(client: Arc<dyn DecisionClient>) -> Self {
        Self { client }
    }

    /// Resolves the endpoint for `ctx` and forwards to its internal path.
    ///
    /// Returns an error, without querying or forwarding, when `epp_host`,
    /// `epp_port` or `epp_internal_path` is missing.
    pub async fn resolve<F>(
        &self,
        ctx: &mut RequestContext,
        forwarder: &mut F,
    ) -> Result<Resolution, ResolveError>
    where
        F: Forwarder + ?Sized,
    {
        let (host, port) = match (
            ctx.variables.get_non_empty(EPP_HOST_VAR),
            ctx.variables.get_non_empty(EPP_PORT_VAR),
        ) {
            (Some(host), Some(port)) => (host.to_string(), port.to_string()),
            _ => return Err(ResolveError::MissingRoutingVariables),
        };
        let internal_path = ctx
            .variables
            .get_non_empty(EPP_INTERNAL_PATH_VAR)
            .ok_or(ResolveError::MissingInternalPath)?
            .to_string();

        let outcome = self.decide(ctx, &host, &port).await;
        match &outcome {
            DecisionOutcome::Resolved { endpoint } => {
                ctx.variables.set(WORKLOAD_ENDPOINT_VAR, endpoint.as_str());
                tracing::info!(endpoint = %endpoint, "{}", outcome);
            }
            _ => tracing::error!(epp_host = %host, epp_port = %port, "{}", outcome),
        }

        // The internal rewrite drops the original URI, so carry the args over.
        let continuation = format!("{}{}", internal_path, ctx.args.to_suffix());
        forwarder.forward(continuation.clone());

        Ok(Resolution {
            outcome,
            continuation,
        })
    }

    async fn decide(&self, ctx: &RequestContext, host: &str, port: &str) -> DecisionOutcome {
        let request = match decision_request(ctx, host, port) {
            Ok(request) => request,
            Err(e) => return DecisionOutcome::Unavailable { reason: e.to_string() },
        };

        let response = match self.client.query(request).await {
            Ok(response) => response,
            Err(e) => return DecisionOutcome::Unavailable { reason: e.to_string() },
        };

        let status = response.status();
        let endpoint = response
            .headers()
            .get(&ENDPOINT_HEADER)
            .and_then(|v| v.to_str().ok())
            .filter(|v| !v.is_empty())
            .map(str::to_string);

        match endpoint {
            Some(endpoint) if status == StatusCode::OK => DecisionOutcome::Resolved { endpoint },
            _ => match response.into_body().collect().await {
                Ok(collected) => DecisionOutcome::Declined {
                    status,
                    body: String::from_utf8_lossy(&collected.to_bytes()).into_owned(),
                },
                Err(e) => DecisionOutcome::Unavailable { reason: e.to_string() },
            },
        }
    }
}

/// Builds the decision query: inbound method, headers and body with the
/// picker host and port headers overlaid.
fn decision_request(
    ctx: &RequestContext,
    host: &str,
    port: &str,
) -> Result<DecisionRequest, DecisionError> {
    let mut headers = ctx.headers.clone();
    headers.insert(EPP_HOST_HEADER, header_value(EPP_HOST_VAR, host)?);
    headers.insert(EPP_PORT_HEADER, header_value(EPP_PORT_VAR, port)?);

    Ok(DecisionRequest {
        method: ctx.method.clone(),
        headers,
        body: ctx.body.clone(),
    })
}

fn header_value(var: &str, value: &str) -> Result<HeaderValue, DecisionError> {
    HeaderValue::from_str(value)
        .map_err(|e| DecisionError::InvalidRequest(format!("{} {:?}: {}", var, value, e)))
}
