//! HTTP health server for Kubernetes probes.
//!
//! `/healthz` reports liveness. `/readyz` reports ready once a route set
//! has been loaded into the store.

use std::convert::Infallible;
use std::net::SocketAddr;
use std::sync::Arc;

use async_trait::async_trait;
use http_body_util::Full;
use hyper::body::Bytes;
use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper::{Request, Response, StatusCode};
use hyper_util::rt::TokioIo;
use pingora_core::server::ShutdownWatch;
use pingora_core::services::background::BackgroundService;
use tokio::net::TcpListener;

use crate::store::RouteStore;

/// Answers a probe for `path`.
pub fn probe(path: &str, store: &RouteStore) -> Response<Full<Bytes>> {
    match path {
        "/healthz" => text(StatusCode::OK, "ok"),
        "/readyz" if store.version() > 0 => text(StatusCode::OK, "ok"),
        "/readyz" => text(StatusCode::SERVICE_UNAVAILABLE, "routes not loaded"),
        _ => text(StatusCode::NOT_FOUND, "not found"),
    }
}

fn text(status: StatusCode, body: &'static str) -> Response<Full<Bytes>> {
    let mut response = Response::new(Full::new(Bytes::from_static(body.as_bytes())));
    *response.status_mut() = status;
    response
}

/// Starts the HTTP health server on the given address.
///
/// Runs indefinitely, accepting connections and handling health requests.
pub async fn start_health_server(addr: SocketAddr, store: Arc<RouteStore>) -> std::io::Result<()> {
    let listener = TcpListener::bind(addr).await?;
    tracing::info!(%addr, "health server listening");

    loop {
        let (stream, _) = listener.accept().await?;
        let io = TokioIo::new(stream);
        let store = Arc::clone(&store);

        tokio::spawn(async move {
            let service = service_fn(move |req: Request<hyper::body::Incoming>| {
                let response = probe(req.uri().path(), &store);
                async move { Ok::<_, Infallible>(response) }
            });

            if let Err(e) = http1::Builder::new().serve_connection(io, service).await {
                tracing::debug!(error = %e, "health connection error");
            }
        });
    }
}

/// Runs the health server as a Pingora background service.
pub struct HealthService {
    addr: SocketAddr,
    store: Arc<RouteStore>,
}

impl HealthService {
    pub fn new(addr: SocketAddr, store: Arc<RouteStore>) -> Self {
        Self { addr, store }
    }
}

#[async_trait]
impl BackgroundService for HealthService {
    async fn start(&self, mut shutdown: ShutdownWatch) {
        tokio::select! {
            result = start_health_server(self.addr, Arc::clone(&self.store)) => {
                if let Err(e) = result {
                    tracing::error!(addr = %self.addr, error = %e, "health server stopped");
                }
            }
            _ = shutdown.changed() => {
                tracing::info!("health server shutting down");
            }
        }
    }
}
