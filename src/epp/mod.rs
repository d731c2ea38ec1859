//! Endpoint picker resolution.
//!
//! Consults the endpoint picker through the local decision service for
//! every inference request, records the chosen workload endpoint in the
//! request context and hands control back to the gateway at an internal
//! path.

mod args;
mod client;
mod context;
mod resolver;

pub use args::QueryArgs;
pub use client::{
    full_body, DecisionBody, DecisionClient, DecisionError, DecisionRequest, DecisionResponse,
    HttpDecisionClient, strip_hop_by_hop, DEFAULT_DECISION_TIMEOUT, DEFAULT_DECISION_URI,
};
pub use context::{
    RequestContext, Variables, EPP_HOST_VAR, EPP_INTERNAL_PATH_VAR, EPP_PORT_VAR,
    WORKLOAD_ENDPOINT_VAR,
};
pub use resolver::{
    DecisionOutcome, EndpointResolver, Forwarder, Resolution, ResolveError, ENDPOINT_HEADER,
    EPP_HOST_HEADER, EPP_PORT_HEADER,
};
