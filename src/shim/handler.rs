//! Translates one decision query into an ext_proc exchange.

use std::fmt::Display;

use bytes::Bytes;
use http::{HeaderMap, HeaderValue, Request, Response, StatusCode};
use http_body_util::{BodyExt, Full};
use hyper::body::Body;
use thiserror::Error;

use crate::core_api::{HeaderMap as ProtoHeaderMap, HeaderValue as ProtoHeaderValue};
use crate::epp::{ENDPOINT_HEADER, EPP_HOST_HEADER, EPP_PORT_HEADER};
use crate::ext_proc_api::{
    processing_request, processing_response, CommonResponse, HttpBody, HttpHeaders,
    ProcessingRequest,
};

use super::ExtProcConnector;

/// Reasons the shim could not produce a decision.
#[derive(Debug, Error)]
pub enum ShimError {
    #[error("missing at least one of required headers: X-EPP-Host and X-EPP-Port")]
    MissingHeaders,

    #[error("error reading request body: {0}")]
    ReadBody(String),

    #[error("error building body request: request body is empty")]
    EmptyBody,

    #[error("error creating gRPC client: {0}")]
    Client(#[from] tonic::transport::Error),

    #[error("error opening ext_proc stream: {0}")]
    OpenStream(tonic::Status),

    #[error("error receiving from ext_proc: {0}")]
    Receive(tonic::Status),
}

impl ShimError {
    /// HTTP status reported back to the resolver.
    pub fn status(&self) -> StatusCode {
        match self {
            Self::MissingHeaders => StatusCode::BAD_REQUEST,
            Self::ReadBody(_) | Self::EmptyBody | Self::Client(_) => {
                StatusCode::INTERNAL_SERVER_ERROR
            }
            Self::OpenStream(_) | Self::Receive(_) => StatusCode::BAD_GATEWAY,
        }
    }
}

/// What the picker answered.
#[derive(Debug, PartialEq, Eq)]
enum PickerReply {
    Endpoint(Option<String>),
    Immediate { status: StatusCode, body: Bytes },
}

/// Handles a decision query and answers with the picked endpoint in the
/// `X-Gateway-Destination-Endpoint` header.
///
/// Never fails: every error is mapped to an HTTP status with the error
/// text as body.
pub async fn pick_endpoint<C, B>(connector: &C, request: Request<B>) -> Response<Full<Bytes>>
where
    C: ExtProcConnector + ?Sized,
    B: Body,
    B::Error: Display,
{
    match exchange(connector, request).await {
        Ok(PickerReply::Endpoint(endpoint)) => {
            let mut response = plain_response(StatusCode::OK, Bytes::new());
            if let Some(value) = endpoint.and_then(|e| HeaderValue::from_str(&e).ok()) {
                response.headers_mut().insert(ENDPOINT_HEADER, value);
            }
            response
        }
        Ok(PickerReply::Immediate { status, body }) => {
            tracing::error!(code = status.as_u16(), body = %String::from_utf8_lossy(&body), "received immediate response");
            plain_response(status, body)
        }
        Err(e) => {
            tracing::error!(error = %e, "error contacting EndpointPicker");
            plain_response(e.status(), Bytes::from(e.to_string()))
        }
    }
}

async fn exchange<C, B>(connector: &C, request: Request<B>) -> Result<PickerReply, ShimError>
where
    C: ExtProcConnector + ?Sized,
    B: Body,
    B::Error: Display,
{
    let (parts, body) = request.into_parts();
    let (host, port) = match (
        header_str(&parts.headers, EPP_HOST_HEADER.as_str()),
        header_str(&parts.headers, EPP_PORT_HEADER.as_str()),
    ) {
        (Some(host), Some(port)) => (host, port),
        _ => return Err(ShimError::MissingHeaders),
    };

    let target = join_host_port(host, port);
    tracing::info!(endpoint_picker = %target, "Getting inference workload endpoint from EndpointPicker");

    let body = body
        .collect()
        .await
        .map_err(|e| ShimError::ReadBody(e.to_string()))?
        .to_bytes();
    if body.is_empty() {
        return Err(ShimError::EmptyBody);
    }

    let mut client = connector.connect(&target)?;
    let outbound = tokio_stream::iter(vec![headers_request(&parts.headers), body_request(body)]);
    let mut inbound = client
        .process(outbound)
        .await
        .map_err(ShimError::OpenStream)?
        .into_inner();

    let mut endpoint = None;
    while let Some(message) = inbound.message().await.map_err(ShimError::Receive)? {
        let common = match message.response {
            Some(processing_response::Response::ImmediateResponse(immediate)) => {
                let code = immediate.status.map(|s| s.code).unwrap_or_default();
                let status = u16::try_from(code)
                    .ok()
                    .and_then(|c| StatusCode::from_u16(c).ok())
                    .unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
                return Ok(PickerReply::Immediate {
                    status,
                    body: Bytes::from(immediate.body),
                });
            }
            Some(processing_response::Response::RequestHeaders(r)) => r.response,
            Some(processing_response::Response::RequestBody(r)) => r.response,
            _ => None,
        };
        if let Some(found) = common.as_ref().and_then(destination_endpoint) {
            tracing::info!(endpoint = %found, "Found endpoint");
            endpoint = Some(found);
        }
    }

    Ok(PickerReply::Endpoint(endpoint))
}

/// Joins host and port, bracketing IPv6 literals.
pub fn join_host_port(host: &str, port: &str) -> String {
    if host.contains(':') && !host.starts_with('[') {
        format!("[{}]:{}", host, port)
    } else {
        format!("{}:{}", host, port)
    }
}

fn header_str<'a>(headers: &'a HeaderMap, name: &str) -> Option<&'a str> {
    headers
        .get(name)
        .and_then(|v| v.to_str().ok())
        .filter(|v| !v.is_empty())
}

/// Header message for the picker. Names are lowercased, as HTTP/2 and the
/// picker expect, and each value of a repeated header is sent separately.
fn headers_request(headers: &HeaderMap) -> ProcessingRequest {
    let headers = headers
        .iter()
        .map(|(name, value)| ProtoHeaderValue {
            key: name.as_str().to_ascii_lowercase(),
            value: String::from_utf8_lossy(value.as_bytes()).into_owned(),
            raw_value: Vec::new(),
        })
        .collect();

    ProcessingRequest {
        request: Some(processing_request::Request::RequestHeaders(HttpHeaders {
            headers: Some(ProtoHeaderMap { headers }),
            end_of_stream: false,
        })),
    }
}

fn body_request(body: Bytes) -> ProcessingRequest {
    ProcessingRequest {
        request: Some(processing_request::Request::RequestBody(HttpBody {
            body: body.to_vec(),
            end_of_stream: true,
        })),
    }
}

/// Extracts the destination endpoint from a header mutation, preferring
/// the raw value.
fn destination_endpoint(response: &CommonResponse) -> Option<String> {
    response
        .header_mutation
        .as_ref()?
        .set_headers
        .iter()
        .filter_map(|option| option.header.as_ref())
        .filter(|h| h.key.eq_ignore_ascii_case(ENDPOINT_HEADER.as_str()))
        .map(|h| {
            if h.raw_value.is_empty() {
                h.value.clone()
            } else {
                String::from_utf8_lossy(&h.raw_value).into_owned()
            }
        })
        .filter(|v| !v.is_empty())
        .last()
}

fn plain_response(status: StatusCode, body: Bytes) -> Response<Full<Bytes>> {
    let mut response = Response::new(Full::new(body));
    *response.status_mut() = status;
    response.headers_mut().insert(
        http::header::CONTENT_TYPE,
        HeaderValue::from_static("text/plain; charset=utf-8"),
    );
    response
}
