//! Pingora ProxyHttp implementation for the inference gateway.
//!
//! Requests for routes whose pool is fronted by an endpoint picker are
//! resolved to a workload endpoint before an upstream peer is chosen.
//! Other routes are balanced over their pool directly. The body read for
//! resolution is replayed upstream in full.

use std::net::SocketAddr;
use std::sync::Arc;

use async_trait::async_trait;
use bytes::{Bytes, BytesMut};
use http::Uri;
use pingora_core::prelude::*;
use pingora_core::upstreams::peer::HttpPeer;
use pingora_http::RequestHeader;
use pingora_proxy::{ProxyHttp, Session};

use crate::epp::{
    EndpointResolver, Forwarder, QueryArgs, RequestContext, EPP_HOST_VAR, EPP_INTERNAL_PATH_VAR,
    EPP_PORT_VAR,
};
use crate::store::{FailureMode, Route};

use super::direct::{self, DirectForwarder};
use super::{LoadBalancer, Router};

/// Capacity of Pingora's retry buffer.
pub const RETRY_BUFFER_LIMIT: usize = 64 * 1024;

/// Per-request context for the gateway proxy.
#[derive(Default)]
pub struct GatewayCtx {
    /// Route the request matched.
    pub route: Option<Arc<Route>>,
    /// Endpoint chosen by the picker.
    pub workload_endpoint: Option<String>,
    /// Query string carried by the continuation, without `?`.
    pub upstream_query: Option<String>,
    /// Whether the request went through endpoint resolution.
    pub resolved: bool,
    /// The upstream address selected for this request.
    pub backend_address: Option<String>,
    /// Set when `backend_address` came from the pool and feeds health tracking.
    pub from_pool: bool,
    /// Request body read for the decision query, sent upstream in place
    /// of the retry buffer's tail.
    pub replay_body: Option<Bytes>,
}

/// Records the internal path a resolution continues at.
#[derive(Debug, Default)]
pub struct InternalRedirect {
    path: Option<String>,
}

impl InternalRedirect {
    pub fn into_path(self) -> Option<String> {
        self.path
    }
}

impl Forwarder for InternalRedirect {
    fn forward(&mut self, path: String) {
        self.path = Some(path);
    }
}

/// Where a request is sent upstream.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum UpstreamChoice {
    /// The endpoint picked for this request.
    Workload(String),
    /// An endpoint of the route's pool.
    Pool,
    /// No upstream; fail with the given status.
    Reject(u16),
}

/// Gateway proxy that resolves and routes inference requests.
pub struct InferenceGateway {
    router: Router,
    resolver: EndpointResolver,
    balancer: LoadBalancer,
    direct: DirectForwarder,
    precondition_status: u16,
}

impl InferenceGateway {
    pub fn new(
        router: Router,
        resolver: EndpointResolver,
        balancer: LoadBalancer,
        precondition_status: u16,
    ) -> Self {
        Self {
            router,
            resolver,
            balancer,
            direct: DirectForwarder::new(),
            precondition_status,
        }
    }

    /// Runs endpoint resolution for a request matched to `route` and
    /// re-enters routing at the continuation path.
    ///
    /// Returns the route owning the continuation and the continuation
    /// itself. Precondition failures map to the configured status.
    pub async fn resolve(
        &self,
        route: &Route,
        epp: &mut RequestContext,
    ) -> Result<(Arc<Route>, String)> {
        let mut redirect = InternalRedirect::default();
        let resolution = self
            .resolver
            .resolve(epp, &mut redirect)
            .await
            .map_err(|e| {
                tracing::error!(route = %route.id, error = %e, "endpoint resolution not possible");
                Error::explain(ErrorType::HTTPStatus(self.precondition_status), e.to_string())
            })?;

        let continuation = redirect
            .into_path()
            .unwrap_or_else(|| resolution.continuation.clone());
        let (internal_path, _) = split_continuation(&continuation);
        tracing::debug!(
            route = %route.id,
            picked = resolution.endpoint().unwrap_or("-"),
            continuation = %continuation,
            "continuing at internal path"
        );
        let target = self.router.find_internal(internal_path).ok_or_else(|| {
            Error::explain(
                ErrorType::HTTPStatus(500),
                format!("no route for internal path {}", internal_path),
            )
        })?;

        Ok((target, continuation))
    }

    /// Builds the resolution context for a picker route.
    fn epp_context(session: &Session, route: &Route, body: Bytes) -> RequestContext {
        let req = session.req_header();
        let mut epp = RequestContext::new(
            req.method.clone(),
            req.headers.clone(),
            body,
            QueryArgs::parse(req.uri.query()),
        );
        if let Some(picker) = route.endpoint_picker() {
            epp.variables.set(EPP_HOST_VAR, picker.host.as_str());
            epp.variables.set(EPP_PORT_VAR, picker.port.to_string());
        }
        epp.variables.set(EPP_INTERNAL_PATH_VAR, route.internal_path());
        epp
    }

    /// Reads the whole request body.
    ///
    /// Returns the body and whether Pingora can still send it upstream.
    /// Retry buffering starts once the rest of a body of known length
    /// fits the buffer, so the buffered tail marks the body for replay.
    async fn buffer_body(session: &mut Session) -> Result<(Bytes, bool)> {
        let length = declared_length(session.req_header());
        let mut body = BytesMut::new();
        loop {
            if replay_window_open(length, body.len()) {
                session.enable_retry_buffering();
            }
            match session.read_request_body().await? {
                Some(chunk) => body.extend_from_slice(&chunk),
                None => break,
            }
        }
        let replayable = body.is_empty() || session.get_retry_buffer().is_some();
        Ok((body.freeze(), replayable))
    }

    /// Picks the backend for a routed request and records it in `ctx`.
    fn select_backend(&self, ctx: &mut GatewayCtx) -> Result<SocketAddr> {
        let route = ctx
            .route
            .clone()
            .ok_or_else(|| Error::explain(ErrorType::InternalError, "request was not routed"))?;

        let address = match choose_upstream(&route, ctx.workload_endpoint.as_deref()) {
            UpstreamChoice::Workload(endpoint) => endpoint,
            UpstreamChoice::Pool => {
                let endpoint = self.balancer.next(&route.pool).ok_or_else(|| {
                    Error::explain(
                        ErrorType::HTTPStatus(503),
                        format!("no healthy endpoint in pool {}", route.pool.name),
                    )
                })?;
                ctx.from_pool = true;
                endpoint.address.clone()
            }
            UpstreamChoice::Reject(status) => {
                return Err(Error::explain(
                    ErrorType::HTTPStatus(status),
                    format!(
                        "invalid picked endpoint {:?} for pool {}",
                        ctx.workload_endpoint.as_deref().unwrap_or(""),
                        route.pool.name
                    ),
                ));
            }
        };

        let addr = parse_backend_address(&address)
            .map_err(|e| Error::explain(ErrorType::InternalError, e))?;
        ctx.backend_address = Some(address);
        Ok(addr)
    }

    fn record_connect(&self, ctx: &GatewayCtx, connected: bool) {
        let (true, Some(addr)) = (ctx.from_pool, &ctx.backend_address) else {
            return;
        };
        let tracker = self.balancer.health_tracker();
        if connected {
            tracker.record_success(addr);
        } else if tracker.record_failure(addr) {
            let healthy = ctx
                .route
                .as_ref()
                .map(|r| tracker.healthy_count(&r.pool.endpoints))
                .unwrap_or(0);
            tracing::warn!(endpoint = %addr, healthy = healthy, "pool endpoint marked unhealthy");
        }
    }

    /// Sends a resolved request whose body Pingora cannot replay.
    async fn forward_direct(
        &self,
        session: &mut Session,
        ctx: &mut GatewayCtx,
        body: Bytes,
    ) -> Result<()> {
        let backend = self.select_backend(ctx)?;
        let uri = upstream_uri(session.req_header().uri.path(), ctx.upstream_query.as_deref())
            .map_err(|e| Error::explain(ErrorType::InternalError, e.to_string()))?;
        tracing::debug!(
            backend = %backend,
            bytes = body.len(),
            "request body exceeds retry buffer, forwarding directly"
        );

        let response = match self
            .direct
            .send(backend, session.req_header(), &uri.to_string(), body)
            .await
        {
            Ok(response) => response,
            Err(e) => {
                self.record_connect(ctx, !e.is_connect());
                return Err(Error::explain(ErrorType::HTTPStatus(502), e.to_string()));
            }
        };
        self.record_connect(ctx, true);
        direct::relay(session, response).await
    }
}

#[async_trait]
impl ProxyHttp for InferenceGateway {
    type CTX = GatewayCtx;

    fn new_ctx(&self) -> Self::CTX {
        GatewayCtx::default()
    }

    async fn request_filter(&self, session: &mut Session, ctx: &mut Self::CTX) -> Result<bool> {
        let host_header = session
            .req_header()
            .headers
            .get("host")
            .and_then(|v| v.to_str().ok());
        let authority = session.req_header().uri.authority().map(|a| a.as_str());

        let host = extract_host_for_routing(host_header, authority);
        let path = session.req_header().uri.path().to_string();

        let route = self.router.find_route(&host, &path).ok_or_else(|| {
            Error::explain(
                ErrorType::HTTPStatus(404),
                format!("no route for host={} path={}", host, path),
            )
        })?;

        if route.endpoint_picker().is_none() {
            ctx.route = Some(route);
            return Ok(false);
        }

        let (body, replayable) = Self::buffer_body(session).await?;
        let mut epp = Self::epp_context(session, &route, body.clone());
        let (target, continuation) = self.resolve(&route, &mut epp).await?;

        let (_, query) = split_continuation(&continuation);
        ctx.upstream_query = query.map(str::to_string);
        ctx.workload_endpoint = epp.workload_endpoint().map(str::to_string);
        ctx.resolved = true;
        ctx.route = Some(target);

        if !replayable {
            self.forward_direct(session, ctx, body).await?;
            return Ok(true);
        }
        if !body.is_empty() {
            ctx.replay_body = Some(body);
        }
        Ok(false)
    }

    async fn upstream_peer(
        &self,
        _session: &mut Session,
        ctx: &mut Self::CTX,
    ) -> Result<Box<HttpPeer>> {
        let addr = self.select_backend(ctx)?;
        Ok(Box::new(HttpPeer::new(addr, false, String::new())))
    }

    async fn request_body_filter(
        &self,
        _session: &mut Session,
        body: &mut Option<Bytes>,
        _end_of_stream: bool,
        ctx: &mut Self::CTX,
    ) -> Result<()> {
        replay_full_body(body, ctx.replay_body.as_ref());
        Ok(())
    }

    async fn upstream_request_filter(
        &self,
        session: &mut Session,
        upstream_request: &mut RequestHeader,
        ctx: &mut Self::CTX,
    ) -> Result<()> {
        if !ctx.resolved {
            return Ok(());
        }
        let uri = upstream_uri(session.req_header().uri.path(), ctx.upstream_query.as_deref())
            .map_err(|e| Error::explain(ErrorType::InternalError, e.to_string()))?;
        upstream_request.set_uri(uri);
        Ok(())
    }

    async fn connected_to_upstream(
        &self,
        _session: &mut Session,
        _reused: bool,
        _peer: &HttpPeer,
        _fd: std::os::unix::io::RawFd,
        _digest: Option<&pingora_core::protocols::Digest>,
        ctx: &mut Self::CTX,
    ) -> Result<()> {
        self.record_connect(ctx, true);
        Ok(())
    }

    fn fail_to_connect(
        &self,
        _session: &mut Session,
        _peer: &HttpPeer,
        ctx: &mut Self::CTX,
        e: Box<Error>,
    ) -> Box<Error> {
        self.record_connect(ctx, false);
        e
    }

    async fn logging(&self, session: &mut Session, _e: Option<&Error>, ctx: &mut Self::CTX) {
        let status = session
            .response_written()
            .map(|r| r.status.as_u16())
            .unwrap_or(0);

        let method = session.req_header().method.as_str();
        let path = session.req_header().uri.path();
        let route = ctx.route.as_ref().map(|r| r.id.as_str()).unwrap_or("-");
        let backend = ctx.backend_address.as_deref().unwrap_or("-");

        tracing::info!(
            method = method,
            path = path,
            status = status,
            route = route,
            backend = backend,
            picked = ctx.workload_endpoint.is_some(),
            "request completed"
        );
    }
}

/// Decides where a routed request goes upstream.
///
/// A picked endpoint that parses as `ip:port` wins. No endpoint, or an
/// empty one, falls back to the pool. An endpoint that does not parse
/// is rejected on `fail_close` routes and falls back to the pool
/// otherwise.
pub fn choose_upstream(route: &Route, workload_endpoint: Option<&str>) -> UpstreamChoice {
    let endpoint = match workload_endpoint {
        None | Some("") => return UpstreamChoice::Pool,
        Some(endpoint) => endpoint,
    };
    if endpoint.parse::<SocketAddr>().is_ok() {
        return UpstreamChoice::Workload(endpoint.to_string());
    }
    match route.endpoint_picker().map(|p| p.failure_mode) {
        Some(FailureMode::FailClose) => UpstreamChoice::Reject(500),
        Some(FailureMode::FailOpen) | None => UpstreamChoice::Pool,
    }
}

/// Body length announced by the request head. Chunked bodies have none.
pub fn declared_length(req: &RequestHeader) -> Option<usize> {
    if req.headers.contains_key(http::header::TRANSFER_ENCODING) {
        return None;
    }
    req.headers
        .get(http::header::CONTENT_LENGTH)?
        .to_str()
        .ok()?
        .trim()
        .parse()
        .ok()
}

/// Whether retry buffering should be on before the next body read, given
/// the declared length and the bytes read so far.
///
/// Pingora replays its retry buffer only if it is non-empty and never
/// overflowed. A body of unknown length is buffered from the start.
pub fn replay_window_open(length: Option<usize>, read: usize) -> bool {
    match length {
        Some(length) => length.saturating_sub(read) <= RETRY_BUFFER_LIMIT,
        None => read == 0,
    }
}

/// Replaces the replayed buffer tail with the whole body.
pub fn replay_full_body(body: &mut Option<Bytes>, full: Option<&Bytes>) {
    if let (Some(full), true) = (full, body.is_some()) {
        *body = Some(full.clone());
    }
}

/// Splits a continuation into its path and query string.
pub fn split_continuation(continuation: &str) -> (&str, Option<&str>) {
    match continuation.split_once('?') {
        Some((path, query)) => (path, Some(query)),
        None => (continuation, None),
    }
}

/// Builds the upstream request URI from the client's path and the
/// continuation's query string.
pub fn upstream_uri(path: &str, query: Option<&str>) -> Result<Uri, http::uri::InvalidUri> {
    match query {
        Some(query) if !query.is_empty() => format!("{}?{}", path, query).parse(),
        _ => path.parse(),
    }
}

/// Parses a backend address string into a SocketAddr.
///
/// Expects format "IP:PORT" (e.g., "192.168.1.1:8080" or "[::1]:8080").
pub fn parse_backend_address(address: &str) -> Result<SocketAddr, String> {
    address
        .parse::<SocketAddr>()
        .map_err(|e| format!("invalid backend address '{}': {}", address, e))
}

/// Extracts the host for routing from request headers.
///
/// Priority:
/// 1. Host header (preferred)
/// 2. :authority pseudo-header (HTTP/2 fallback)
///
/// Port is stripped if present.
/// Returns empty string if neither is available.
pub fn extract_host_for_routing(host_header: Option<&str>, authority: Option<&str>) -> String {
    let raw_host = host_header.or(authority).unwrap_or("");

    // Handle IPv6: [::1]:8080 -> [::1]
    if raw_host.starts_with('[') {
        if let Some(bracket_end) = raw_host.find(']') {
            return raw_host[..=bracket_end].to_string();
        }
    }

    raw_host
        .rsplit_once(':')
        .map(|(host, _)| host.to_string())
        .unwrap_or_else(|| raw_host.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    use std::sync::Mutex;

    use http::{HeaderMap, Method, Response};

    use crate::epp::{
        full_body, DecisionClient, DecisionError, DecisionRequest, DecisionResponse, ENDPOINT_HEADER,
    };
    use crate::proxy::HealthTracker;
    use crate::store::{Endpoint, EndpointPickerRef, PathMatch, PathMatchType, Pool, RouteStore};

    // ========== Test Helpers ==========

    struct FixedClient {
        endpoint: Option<&'static str>,
        requests: Mutex<Vec<DecisionRequest>>,
    }

    #[async_trait]
    impl DecisionClient for FixedClient {
        async fn query(
            &self,
            request: DecisionRequest,
        ) -> std::result::Result<DecisionResponse, DecisionError> {
            self.requests.lock().unwrap().push(request);
            let response = match self.endpoint {
                Some(endpoint) => Response::builder()
                    .status(200)
                    .header(ENDPOINT_HEADER, endpoint)
                    .body(full_body(Bytes::new())),
                None => Response::builder()
                    .status(404)
                    .body(full_body("no endpoints available")),
            };
            Ok(response.unwrap())
        }
    }

    fn picker_route(id: &str, failure_mode: FailureMode) -> Route {
        Route {
            id: id.to_string(),
            hostnames: vec!["models.example.com".to_string()],
            path: Some(PathMatch {
                kind: PathMatchType::Prefix,
                value: "/v1".to_string(),
            }),
            pool: Pool {
                name: "vllm".to_string(),
                endpoints: vec![Endpoint {
                    address: "10.0.0.1:8000".to_string(),
                    weight: 1,
                }],
                endpoint_picker: Some(EndpointPickerRef {
                    host: "epp.default.svc".to_string(),
                    port: 9002,
                    failure_mode,
                }),
            },
        }
    }

    fn plain_route(id: &str) -> Route {
        let mut route = picker_route(id, FailureMode::FailOpen);
        route.pool.endpoint_picker = None;
        route
    }

    fn gateway(routes: Vec<Route>, endpoint: Option<&'static str>) -> (InferenceGateway, Arc<FixedClient>) {
        let store = Arc::new(RouteStore::new());
        store.update_routes(routes, 1);
        let client = Arc::new(FixedClient {
            endpoint,
            requests: Mutex::new(Vec::new()),
        });
        let gateway = InferenceGateway::new(
            Router::new(store),
            EndpointResolver::new(client.clone()),
            LoadBalancer::new(Arc::new(HealthTracker::new(3))),
            500,
        );
        (gateway, client)
    }

    fn epp_context(route: &Route, query: Option<&str>) -> RequestContext {
        let mut epp = RequestContext::new(
            Method::POST,
            HeaderMap::new(),
            Bytes::from_static(b"{\"model\":\"llama\"}"),
            QueryArgs::parse(query),
        );
        let picker = route.endpoint_picker().unwrap();
        epp.variables.set(EPP_HOST_VAR, picker.host.as_str());
        epp.variables.set(EPP_PORT_VAR, picker.port.to_string());
        epp.variables.set(EPP_INTERNAL_PATH_VAR, route.internal_path());
        epp
    }

    // ========== Phase 1: Address and Host Parsing ==========

    #[test]
    fn test_parse_address_valid_ipv4_with_port() {
        let addr = parse_backend_address("192.168.1.1:8080").unwrap();
        assert_eq!(addr.ip().to_string(), "192.168.1.1");
        assert_eq!(addr.port(), 8080);
    }

    #[test]
    fn test_parse_address_missing_port() {
        let result = parse_backend_address("192.168.1.1");
        assert!(result.unwrap_err().contains("invalid backend address"));
    }

    #[test]
    fn test_parse_address_ipv6_with_port() {
        let addr = parse_backend_address("[::1]:8080").unwrap();
        assert!(addr.ip().is_ipv6());
    }

    #[test]
    fn test_extract_host_prefers_host_header() {
        assert_eq!(
            extract_host_for_routing(Some("host.com"), Some("authority.com")),
            "host.com"
        );
        assert_eq!(extract_host_for_routing(None, Some("authority.com")), "authority.com");
    }

    #[test]
    fn test_extract_host_strips_port() {
        assert_eq!(extract_host_for_routing(Some("example.com:8080"), None), "example.com");
        assert_eq!(extract_host_for_routing(Some("[::1]:8080"), None), "[::1]");
        assert_eq!(extract_host_for_routing(None, None), "");
    }

    // ========== Phase 2: Continuation Handling ==========

    #[test]
    fn test_split_continuation() {
        assert_eq!(split_continuation("/_epp-internal/r"), ("/_epp-internal/r", None));
        assert_eq!(
            split_continuation("/_epp-internal/r?a=1&b=2"),
            ("/_epp-internal/r", Some("a=1&b=2"))
        );
    }

    #[test]
    fn test_upstream_uri_keeps_original_path() {
        let uri = upstream_uri("/v1/completions", Some("a=1&b=2")).unwrap();
        assert_eq!(uri.path(), "/v1/completions");
        assert_eq!(uri.query(), Some("a=1&b=2"));

        let uri = upstream_uri("/v1/completions", None).unwrap();
        assert_eq!(uri.to_string(), "/v1/completions");
    }

    #[test]
    fn test_internal_redirect_records_path() {
        let mut redirect = InternalRedirect::default();
        redirect.forward("/_epp-internal/r?x=1".to_string());
        assert_eq!(redirect.into_path().as_deref(), Some("/_epp-internal/r?x=1"));
    }

    // ========== Phase 3: Upstream Choice ==========

    #[test]
    fn test_workload_endpoint_wins() {
        let route = picker_route("r", FailureMode::FailClose);
        assert_eq!(
            choose_upstream(&route, Some("10.0.0.9:8000")),
            UpstreamChoice::Workload("10.0.0.9:8000".to_string())
        );
    }

    #[test]
    fn test_no_endpoint_uses_pool_in_both_modes() {
        for mode in [FailureMode::FailOpen, FailureMode::FailClose] {
            let route = picker_route("r", mode);
            assert_eq!(choose_upstream(&route, None), UpstreamChoice::Pool);
            assert_eq!(choose_upstream(&route, Some("")), UpstreamChoice::Pool);
        }
    }

    #[test]
    fn test_invalid_endpoint_rejected_on_fail_close() {
        let route = picker_route("r", FailureMode::FailClose);
        assert_eq!(choose_upstream(&route, Some("vllm-0:8000")), UpstreamChoice::Reject(500));
    }

    #[test]
    fn test_invalid_endpoint_falls_back_on_fail_open() {
        let route = picker_route("r", FailureMode::FailOpen);
        assert_eq!(choose_upstream(&route, Some("vllm-0:8000")), UpstreamChoice::Pool);
        assert_eq!(choose_upstream(&plain_route("r"), Some("not an address")), UpstreamChoice::Pool);
    }

    #[test]
    fn test_route_without_picker_uses_pool() {
        assert_eq!(choose_upstream(&plain_route("r"), None), UpstreamChoice::Pool);
    }

    // ========== Phase 4: Body Replay ==========

    /// Reads `body` in `chunk`-sized pieces the way `buffer_body` does and
    /// returns what the retry buffer would hold, or None on overflow.
    fn retry_buffer_after_read(body: &Bytes, length: Option<usize>, chunk: usize) -> Option<Bytes> {
        let mut buffer: Option<Vec<u8>> = None;
        let mut read = 0;
        for piece in body.chunks(chunk) {
            if replay_window_open(length, read) && buffer.is_none() {
                buffer = Some(Vec::new());
            }
            if let Some(buffer) = buffer.as_mut() {
                buffer.extend_from_slice(piece);
            }
            read += piece.len();
        }
        buffer
            .filter(|b| !b.is_empty() && b.len() <= RETRY_BUFFER_LIMIT)
            .map(Bytes::from)
    }

    #[test]
    fn test_declared_length() {
        let mut req = RequestHeader::build("POST", b"/v1/completions", None).unwrap();
        assert_eq!(declared_length(&req), None);

        req.insert_header("content-length", "204800").unwrap();
        assert_eq!(declared_length(&req), Some(204800));

        req.insert_header("transfer-encoding", "chunked").unwrap();
        assert_eq!(declared_length(&req), None);
    }

    #[test]
    fn test_replay_window_opens_for_the_tail() {
        assert!(!replay_window_open(Some(200 * 1024), 0));
        assert!(!replay_window_open(Some(200 * 1024), 128 * 1024));
        assert!(replay_window_open(Some(200 * 1024), 136 * 1024));
        assert!(replay_window_open(Some(10), 0));
        assert!(replay_window_open(None, 0));
        assert!(!replay_window_open(None, 1));
    }

    #[test]
    fn test_body_over_retry_buffer_replays_in_full() {
        let len = 200 * 1024 + 17;
        let body = Bytes::from((0..len).map(|i| (i % 251) as u8).collect::<Vec<u8>>());

        for chunk in [RETRY_BUFFER_LIMIT, 16 * 1024, 4096] {
            let tail = retry_buffer_after_read(&body, Some(len), chunk)
                .unwrap_or_else(|| panic!("no replayable tail for {} byte reads", chunk));
            assert!(tail.len() < len);
            assert!(body.ends_with(&tail));

            let mut replayed = Some(tail);
            replay_full_body(&mut replayed, Some(&body));
            assert_eq!(replayed.as_ref(), Some(&body));
        }
    }

    #[test]
    fn test_unknown_length_body_over_retry_buffer_is_not_replayable() {
        let body = Bytes::from(vec![b'x'; 100 * 1024]);
        assert!(retry_buffer_after_read(&body, None, 16 * 1024).is_none());

        let small = Bytes::from(vec![b'x'; 1024]);
        assert_eq!(retry_buffer_after_read(&small, None, 256), Some(small));
    }

    #[test]
    fn test_replay_leaves_end_of_stream_and_plain_requests_alone() {
        let full = Bytes::from_static(b"whole body");

        let mut end = None;
        replay_full_body(&mut end, Some(&full));
        assert!(end.is_none());

        let mut chunk = Some(Bytes::from_static(b"chunk"));
        replay_full_body(&mut chunk, None);
        assert_eq!(chunk, Some(Bytes::from_static(b"chunk")));
    }

    // ========== Phase 5: Resolution ==========

    #[tokio::test]
    async fn test_resolve_sets_endpoint_and_reenters_route() {
        let route = picker_route("default/chat", FailureMode::FailClose);
        let (gateway, client) = gateway(vec![route.clone()], Some("10.0.0.7:8000"));
        let mut epp = epp_context(&route, Some("stream=true"));

        let (target, continuation) = gateway.resolve(&route, &mut epp).await.unwrap();

        assert_eq!(target.id, "default/chat");
        assert_eq!(continuation, "/_epp-internal/default/chat?stream=true");
        assert_eq!(epp.workload_endpoint(), Some("10.0.0.7:8000"));
        assert_eq!(client.requests.lock().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_resolve_declined_leaves_endpoint_unset() {
        let route = picker_route("default/chat", FailureMode::FailClose);
        let (gateway, _client) = gateway(vec![route.clone()], None);
        let mut epp = epp_context(&route, None);

        let (target, continuation) = gateway.resolve(&route, &mut epp).await.unwrap();

        assert_eq!(target.id, "default/chat");
        assert_eq!(continuation, "/_epp-internal/default/chat");
        assert!(epp.workload_endpoint().is_none());
        assert_eq!(choose_upstream(&target, None), UpstreamChoice::Pool);
    }

    #[tokio::test]
    async fn test_resolve_missing_variables_uses_precondition_status() {
        let route = picker_route("default/chat", FailureMode::FailOpen);
        let (gateway, client) = gateway(vec![route.clone()], Some("10.0.0.7:8000"));
        let mut epp = RequestContext::new(Method::GET, HeaderMap::new(), Bytes::new(), QueryArgs::default());

        let err = gateway.resolve(&route, &mut epp).await.unwrap_err();

        assert_eq!(err.etype(), &ErrorType::HTTPStatus(500));
        assert!(client.requests.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_resolve_unknown_internal_path_is_500() {
        let route = picker_route("default/chat", FailureMode::FailOpen);
        // The store does not know the route, so the continuation cannot re-enter.
        let (gateway, _client) = gateway(vec![], Some("10.0.0.7:8000"));
        let mut epp = epp_context(&route, None);

        let err = gateway.resolve(&route, &mut epp).await.unwrap_err();

        assert_eq!(err.etype(), &ErrorType::HTTPStatus(500));
    }

    // ========== Phase 6: Gateway Struct ==========

    #[test]
    fn test_gateway_is_send_sync() {
        fn assert_send_sync<T: Send + Sync>() {}
        assert_send_sync::<InferenceGateway>();
    }

    #[test]
    fn test_gateway_ctx_default() {
        let ctx = GatewayCtx::default();
        assert!(ctx.route.is_none());
        assert!(ctx.backend_address.is_none());
        assert!(ctx.replay_body.is_none());
        assert!(!ctx.resolved);
    }
}
