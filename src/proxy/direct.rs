//! Forwarding for requests whose body Pingora cannot replay upstream.
//!
//! The decision query consumes the request body. Pingora replays a body
//! from its retry buffer, which holds at most 64 KiB. When a body of
//! unknown length overflows it, the request is sent to the chosen
//! backend from here and the response is streamed back to the client.

use std::net::SocketAddr;

use bytes::Bytes;
use http::header::{CONTENT_LENGTH, TRANSFER_ENCODING};
use http::{HeaderValue, Request, Response, StatusCode, Uri};
use http_body_util::{BodyExt, Full};
use hyper::body::Incoming;
use hyper_util::client::legacy::connect::HttpConnector;
use hyper_util::client::legacy::Client;
use hyper_util::rt::TokioExecutor;
use pingora_core::prelude::*;
use pingora_http::{RequestHeader, ResponseHeader};
use pingora_proxy::Session;
use thiserror::Error;

use crate::epp::strip_hop_by_hop;

#[derive(Debug, Error)]
pub enum DirectError {
    #[error("invalid upstream request: {0}")]
    Request(#[from] http::Error),

    #[error("failed to connect to upstream: {0}")]
    Connect(String),

    #[error("upstream request failed: {0}")]
    Upstream(String),
}

impl DirectError {
    pub fn is_connect(&self) -> bool {
        matches!(self, Self::Connect(_))
    }
}

/// HTTP/1 client for pool and workload endpoints.
pub struct DirectForwarder {
    client: Client<HttpConnector, Full<Bytes>>,
}

impl Default for DirectForwarder {
    fn default() -> Self {
        Self::new()
    }
}

impl DirectForwarder {
    pub fn new() -> Self {
        Self {
            client: Client::builder(TokioExecutor::new()).build_http(),
        }
    }

    /// Sends the request described by `head` to `backend` at
    /// `path_and_query`, with `body` as a fixed-length body.
    pub async fn send(
        &self,
        backend: SocketAddr,
        head: &RequestHeader,
        path_and_query: &str,
        body: Bytes,
    ) -> Result<Response<Incoming>, DirectError> {
        let uri = Uri::builder()
            .scheme("http")
            .authority(backend.to_string())
            .path_and_query(path_and_query)
            .build()?;
        let length = body.len();
        let mut request = Request::builder()
            .method(head.method.clone())
            .uri(uri)
            .body(Full::new(body))?;
        *request.headers_mut() = head.headers.clone();
        strip_hop_by_hop(request.headers_mut());
        request
            .headers_mut()
            .insert(CONTENT_LENGTH, HeaderValue::from(length));

        self.client.request(request).await.map_err(|e| {
            if e.is_connect() {
                DirectError::Connect(e.to_string())
            } else {
                DirectError::Upstream(e.to_string())
            }
        })
    }
}

/// Converts an upstream response head for the downstream session.
///
/// Hop-by-hop headers are dropped. Bodies without a length are re-framed
/// as chunked when `chunked` is set, which HTTP/1 clients need.
pub fn response_header(parts: &http::response::Parts, chunked: bool) -> Result<ResponseHeader> {
    let mut headers = parts.headers.clone();
    strip_hop_by_hop(&mut headers);

    let mut header = ResponseHeader::build(parts.status, Some(headers.len() + 1))?;
    for (name, value) in headers.iter() {
        header.append_header(name.clone(), value.clone())?;
    }
    let bodiless = parts.status == StatusCode::NO_CONTENT || parts.status == StatusCode::NOT_MODIFIED;
    if chunked && !bodiless && !headers.contains_key(CONTENT_LENGTH) {
        header.insert_header(TRANSFER_ENCODING, "chunked")?;
    }
    Ok(header)
}

/// Streams an upstream response to the client.
pub async fn relay(session: &mut Session, response: Response<Incoming>) -> Result<()> {
    let (parts, mut body) = response.into_parts();
    let header = response_header(&parts, !session.is_http2())?;
    session.write_response_header(Box::new(header), false).await?;

    while let Some(frame) = body.frame().await {
        let frame = frame.map_err(|e| Error::explain(ErrorType::ReadError, e.to_string()))?;
        if let Ok(data) = frame.into_data() {
            session.write_response_body(Some(data), false).await?;
        }
    }
    session.as_downstream_mut().finish_body().await
}
