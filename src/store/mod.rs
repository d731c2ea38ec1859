//! Route storage for the inference gateway.
//!
//! Provides thread-safe storage for the routes loaded from configuration,
//! indexed by id and by their internal continuation path.

mod route;
mod route_store;

pub use route::{Endpoint, EndpointPickerRef, FailureMode, PathMatch, PathMatchType, Pool, Route};
pub use route_store::RouteStore;
