//! HTTP/1 listener for the endpoint picker shim.

use std::convert::Infallible;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use hyper::body::Incoming;
use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper::Request;
use hyper_util::rt::{TokioIo, TokioTimer};
use pingora_core::server::ShutdownWatch;
use pingora_core::services::background::BackgroundService;
use tokio::net::TcpListener;

use super::{pick_endpoint, ExtProcConnector};

const HEADER_READ_TIMEOUT: Duration = Duration::from_secs(10);

/// Starts the shim on the given address.
///
/// Runs indefinitely, serving each connection on its own task.
pub async fn start_shim_server<C>(addr: SocketAddr, connector: Arc<C>) -> std::io::Result<()>
where
    C: ExtProcConnector + 'static,
{
    let listener = TcpListener::bind(addr).await?;
    tracing::info!(%addr, "endpoint picker shim listening");

    loop {
        let (stream, _) = listener.accept().await?;
        let io = TokioIo::new(stream);
        let connector = Arc::clone(&connector);

        tokio::spawn(async move {
            let service = service_fn(move |req: Request<Incoming>| {
                let connector = Arc::clone(&connector);
                async move { Ok::<_, Infallible>(pick_endpoint(connector.as_ref(), req).await) }
            });

            if let Err(e) = http1::Builder::new()
                .timer(TokioTimer::new())
                .header_read_timeout(HEADER_READ_TIMEOUT)
                .serve_connection(io, service)
                .await
            {
                tracing::debug!(error = %e, "shim connection error");
            }
        });
    }
}

/// Runs the shim as a Pingora background service.
pub struct ShimService<C> {
    addr: SocketAddr,
    connector: Arc<C>,
}

impl<C> ShimService<C> {
    pub fn new(addr: SocketAddr, connector: C) -> Self {
        Self {
            addr,
            connector: Arc::new(connector),
        }
    }
}

#[async_trait]
impl<C> BackgroundService for ShimService<C>
where
    C: ExtProcConnector + 'static,
{
    async fn start(&self, mut shutdown: ShutdownWatch) {
        tokio::select! {
            result = start_shim_server(self.addr, Arc::clone(&self.connector)) => {
                if let Err(e) = result {
                    tracing::error!(addr = %self.addr, error = %e, "endpoint picker shim stopped");
                }
            }
            _ = shutdown.changed() => {
                tracing::info!("endpoint picker shim shutting down");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::TcpListener as StdTcpListener;

    use crate::shim::GrpcConnector;

    /// Raw HTTP/1 POST, returning status code and body.
    async fn raw_post(addr: SocketAddr, headers: &str, body: &str) -> (u16, String) {
        use tokio::io::{AsyncReadExt, AsyncWriteExt};
        use tokio::net::TcpStream;

        let mut stream = TcpStream::connect(addr).await.unwrap();
        let request = format!(
            "POST / HTTP/1.1\r\nHost: {}\r\n{}Content-Length: {}\r\nConnection: close\r\n\r\n{}",
            addr,
            headers,
            body.len(),
            body
        );
        stream.write_all(request.as_bytes()).await.unwrap();

        let mut response = String::new();
        stream.read_to_string(&mut response).await.unwrap();

        let status_line = response.lines().next().unwrap();
        let status_code: u16 = status_line
            .split_whitespace()
            .nth(1)
            .unwrap()
            .parse()
            .unwrap();
        let body = response
            .split("\r\n\r\n")
            .nth(1)
            .unwrap_or("")
            .to_string();

        (status_code, body)
    }

    #[tokio::test]
    async fn test_server_rejects_query_without_picker_headers() {
        let listener = StdTcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);

        let handle = tokio::spawn(async move {
            let _ = start_shim_server(addr, Arc::new(GrpcConnector::plaintext())).await;
        });

        tokio::time::sleep(tokio::time::Duration::from_millis(50)).await;

        let (status, body) = raw_post(addr, "", "{}").await;
        assert_eq!(status, 400);
        assert!(body.contains("X-EPP-Host"));

        handle.abort();
    }

    #[tokio::test]
    async fn test_server_reports_unreachable_picker() {
        let listener = StdTcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);

        let dead = StdTcpListener::bind("127.0.0.1:0").unwrap();
        let dead_port = dead.local_addr().unwrap().port();
        drop(dead);

        let handle = tokio::spawn(async move {
            let _ = start_shim_server(addr, Arc::new(GrpcConnector::plaintext())).await;
        });

        tokio::time::sleep(tokio::time::Duration::from_millis(50)).await;

        let headers = format!("X-EPP-Host: 127.0.0.1\r\nX-EPP-Port: {}\r\n", dead_port);
        let (status, _) = raw_post(addr, &headers, "{\"model\":\"m\"}").await;
        assert_eq!(status, 502);

        handle.abort();
    }
}
