//! HTTP request routing and load balancing.
//!
//! Matches incoming requests to inference routes, resolves workload
//! endpoints for pools fronted by an endpoint picker and balances the
//! rest over pool endpoints with health tracking.

mod direct;
mod gateway;
mod router;
mod upstream;

pub use gateway::{GatewayCtx, InferenceGateway};
pub use router::Router;
pub use upstream::{HealthTracker, LoadBalancer};
