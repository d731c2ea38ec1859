//! Local HTTP front for the endpoint picker.
//!
//! The resolver speaks plain HTTP to `127.0.0.1:54800`; this module turns
//! each of those requests into an Envoy ext_proc exchange with the picker
//! named in the `X-EPP-Host`/`X-EPP-Port` headers.

mod connector;
mod handler;
mod server;

pub use connector::{ExtProcConnector, GrpcConnector, PickerTls};
pub use handler::{join_host_port, pick_endpoint, ShimError};
pub use server::{start_shim_server, ShimService};
