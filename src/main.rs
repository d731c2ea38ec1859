//! Pingora-based inference gateway.
//!
//! Routes requests for inference pools to the workload endpoint chosen by
//! the pool's endpoint picker, asking it through a local decision service.

mod config;
mod epp;
mod gen;
mod health;
mod proxy;
mod shim;
mod store;

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use pingora_core::server::Server;
use pingora_core::services::background::background_service;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use config::GatewayConfig;
use epp::{EndpointResolver, HttpDecisionClient};
use health::HealthService;
use proxy::{HealthTracker, InferenceGateway, LoadBalancer, Router};
use shim::{GrpcConnector, ShimService};
use store::RouteStore;

// Re-export generated types for convenience
pub use gen::envoy::config::core::v3 as core_api;
pub use gen::envoy::service::ext_proc::v3 as ext_proc_api;

#[derive(Parser)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Path to the YAML gateway configuration
    #[arg(short, long, default_value = "/etc/epp-gateway/config.yaml")]
    config: PathBuf,

    /// Validate the configuration and exit
    #[arg(long, default_value = "false")]
    check: bool,
}

fn main() {
    // Initialize tracing
    tracing_subscriber::registry()
        .with(tracing_subscriber::fmt::layer())
        .with(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    match run(Args::parse()) {
        Ok(Some(server)) => server.run_forever(),
        Ok(None) => {}
        Err(e) => {
            tracing::error!(error = %format!("{:#}", e), "epp-gateway failed to start");
            std::process::exit(1);
        }
    }
}

/// Builds the server. Returns `None` when only checking the configuration.
fn run(args: Args) -> Result<Option<Server>> {
    let config = GatewayConfig::load(&args.config)
        .with_context(|| format!("loading {}", args.config.display()))?;
    if args.check {
        tracing::info!(routes = config.routes.len(), "configuration is valid");
        return Ok(None);
    }

    tracing::info!(listen = %config.listen, routes = config.routes.len(), "epp-gateway starting");

    let store = Arc::new(RouteStore::new());
    let version = store.update_routes(config.routes.clone(), 1);
    tracing::info!(routes = store.route_count(), version = version, "routes loaded");

    let decision = HttpDecisionClient::new(config.decision_uri()?, config.decision_timeout());
    tracing::info!(uri = %decision.uri(), "decision service configured");
    let tracker = Arc::new(HealthTracker::new(config.upstream.failure_threshold));
    let gateway = InferenceGateway::new(
        Router::new(Arc::clone(&store)),
        EndpointResolver::new(Arc::new(decision)),
        LoadBalancer::new(tracker),
        config.precondition_failure_status,
    );

    let mut server =
        Server::new(None).map_err(|e| anyhow::anyhow!("creating pingora server: {}", e))?;
    server.bootstrap();

    let mut proxy = pingora_proxy::http_proxy_service(&server.configuration, gateway);
    proxy.add_tcp(&config.listen.to_string());
    server.add_service(proxy);

    if config.shim.enabled {
        let connector =
            GrpcConnector::new(config.shim.tls).context("building endpoint picker TLS config")?;
        let shim = ShimService::new(config.shim.listen, connector);
        server.add_service(background_service("endpoint picker shim", shim));
    } else {
        tracing::info!(uri = %config.decision.uri, "using external decision service");
    }

    let health = HealthService::new(config.health_listen, store);
    server.add_service(background_service("health", health));

    Ok(Some(server))
}
