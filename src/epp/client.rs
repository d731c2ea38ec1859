//! Transport used to reach the local decision service.

use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use http::header::{self, HeaderName};
use http::{HeaderMap, Method, Request, Response, Uri};
use http_body_util::combinators::UnsyncBoxBody;
use http_body_util::{BodyExt, Full};
use hyper_util::client::legacy::connect::HttpConnector;
use hyper_util::client::legacy::Client;
use hyper_util::rt::TokioExecutor;
use thiserror::Error;

/// Address of the endpoint picker shim served next to the gateway.
pub const DEFAULT_DECISION_URI: &str = "http://127.0.0.1:54800";

/// Default upper bound on waiting for the decision service to answer.
pub const DEFAULT_DECISION_TIMEOUT: Duration = Duration::from_secs(60);

/// Headers scoped to a single connection.
const HOP_BY_HOP: [HeaderName; 8] = [
    header::CONNECTION,
    HeaderName::from_static("keep-alive"),
    HeaderName::from_static("proxy-connection"),
    header::TE,
    header::TRAILER,
    header::TRANSFER_ENCODING,
    header::UPGRADE,
    header::EXPECT,
];

/// Removes hop-by-hop headers, including any named by `Connection`.
pub fn strip_hop_by_hop(headers: &mut HeaderMap) {
    let listed: Vec<HeaderName> = headers
        .get_all(header::CONNECTION)
        .iter()
        .filter_map(|v| v.to_str().ok())
        .flat_map(|v| v.split(','))
        .filter_map(|name| HeaderName::from_bytes(name.trim().as_bytes()).ok())
        .collect();
    for name in listed.iter().chain(HOP_BY_HOP.iter()) {
        headers.remove(name);
    }
}

/// Failure to obtain a response from the decision service.
#[derive(Debug, Error)]
pub enum DecisionError {
    #[error("request to decision service failed: {0}")]
    Transport(String),

    #[error("decision service did not respond within {0:?}")]
    Timeout(Duration),

    #[error("invalid decision request: {0}")]
    InvalidRequest(String),

    #[error("failed to read decision response body: {0}")]
    Body(String),
}

/// Lazily read body of a decision response.
pub type DecisionBody = UnsyncBoxBody<Bytes, DecisionError>;

/// Response of the decision service. The body is only read when needed.
pub type DecisionResponse = Response<DecisionBody>;

/// A query to the decision service, derived from the inbound request.
#[derive(Debug, Clone)]
pub struct DecisionRequest {
    pub method: Method,
    pub headers: HeaderMap,
    pub body: Bytes,
}

/// Sends decision queries. Injected into the resolver so tests can
/// substitute a scripted client.
#[async_trait]
pub trait DecisionClient: Send + Sync {
    async fn query(&self, request: DecisionRequest) -> Result<DecisionResponse, DecisionError>;
}

/// Wraps an in-memory body as a [`DecisionBody`].
pub fn full_body(bytes: impl Into<Bytes>) -> DecisionBody {
    Full::new(bytes.into())
        .map_err(|never| match never {})
        .boxed_unsync()
}

/// HTTP/1 decision client backed by a pooled hyper client.
pub struct HttpDecisionClient {
    client: Client<HttpConnector, Full<Bytes>>,
    uri: Uri,
    timeout: Duration,
}

impl HttpDecisionClient {
    pub fn new(uri: Uri, timeout: Duration) -> Self {
        let client = Client::builder(TokioExecutor::new()).build_http();
        Self {
            client,
            uri,
            timeout,
        }
    }

    pub fn uri(&self) -> &Uri {
        &self.uri
    }
}

#[async_trait]
impl DecisionClient for HttpDecisionClient {
    async fn query(&self, request: DecisionRequest) -> Result<DecisionResponse, DecisionError> {
        let mut outbound = Request::builder()
            .method(request.method)
            .uri(self.uri.clone())
            .body(Full::new(request.body))
            .map_err(|e| DecisionError::InvalidRequest(e.to_string()))?;
        *outbound.headers_mut() = request.headers;
        // The body is re-framed from the buffered bytes.
        strip_hop_by_hop(outbound.headers_mut());

        let response = tokio::time::timeout(self.timeout, self.client.request(outbound))
            .await
            .map_err(|_| DecisionError::Timeout(self.timeout))?
            .map_err(|e| DecisionError::Transport(e.to_string()))?;

        Ok(response.map(|body| {
            body.map_err(|e| DecisionError::Body(e.to_string()))
                .boxed_unsync()
        }))
    }
}
