//! HTTP Server - the Ingress data path
//!
//! Routes by Host header and path, forwards to the selected instance, and
//! maps routing failures to client-visible statuses. Every request on the
//! data path is routed; `GET /metrics` and `GET /healthz` live on a separate
//! admin listener so they never shadow an Ingress rule.

use crate::error::{KgRouteError, RoutingError};
use crate::proxy::metrics::{
    encode_metrics, metrics_content_type, REQUEST_DURATION, ROUTED_REQUESTS_TOTAL,
};
use crate::proxy::upstream::{ForwardRequest, HyperUpstream};
use crate::topology::dispatch::{Dispatcher, InboundRequest, Upstream};
use crate::topology::matcher::normalize_host;
use http_body_util::{BodyExt, Full, LengthLimitError, Limited};
use hyper::body::{Body, Bytes};
use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper::{header, Method, Request, Response, StatusCode};
use hyper_util::rt::TokioIo;
use std::convert::Infallible;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Instant;
use tokio::net::TcpListener;
use tracing::{debug, error, info};
use uuid::Uuid;

const REQUEST_ID_HEADER: &str = "x-request-id";

/// Request body cap when none is configured
pub const DEFAULT_MAX_BODY_BYTES: usize = 10 * 1024 * 1024;

/// HTTP front for the routing topology
pub struct ProxyServer<U = HyperUpstream> {
    bind_addr: String,
    dispatcher: Arc<Dispatcher>,
    upstream: Arc<U>,
    max_body_bytes: usize,
}

impl ProxyServer<HyperUpstream> {
    pub fn new(bind_addr: String, dispatcher: Arc<Dispatcher>) -> Self {
        Self::with_upstream(bind_addr, dispatcher, HyperUpstream)
    }
}

impl<U> ProxyServer<U>
where
    U: Upstream<Request = ForwardRequest, Response = Response<Bytes>> + 'static,
{
    pub fn with_upstream(bind_addr: String, dispatcher: Arc<Dispatcher>, upstream: U) -> Self {
        Self {
            bind_addr,
            dispatcher,
            upstream: Arc::new(upstream),
            max_body_bytes: DEFAULT_MAX_BODY_BYTES,
        }
    }

    /// Reject request bodies larger than `limit` with 413
    pub fn with_max_body_bytes(mut self, limit: usize) -> Self {
        self.max_body_bytes = limit;
        self
    }

    /// Bind the configured address and serve until the task is dropped
    pub async fn serve(self) -> Result<(), KgRouteError> {
        let listener = TcpListener::bind(&self.bind_addr).await?;
        self.serve_listener(listener).await
    }

    /// Serve connections accepted on `listener`
    pub async fn serve_listener(self, listener: TcpListener) -> Result<(), KgRouteError> {
        let local_addr = listener.local_addr()?;
        info!("Listening on http://{}", local_addr);

        loop {
            let (stream, peer_addr) = match listener.accept().await {
                Ok(accepted) => accepted,
                Err(e) => {
                    error!("Accept error on {}: {}", local_addr, e);
                    continue;
                }
            };
            debug!("Accepted connection from {}", peer_addr);

            let dispatcher = Arc::clone(&self.dispatcher);
            let upstream = Arc::clone(&self.upstream);
            let max_body_bytes = self.max_body_bytes;

            tokio::spawn(async move {
                let io = TokioIo::new(stream);
                let service = service_fn(move |req: Request<hyper::body::Incoming>| {
                    let dispatcher = Arc::clone(&dispatcher);
                    let upstream = Arc::clone(&upstream);
                    async move {
                        handle_request(req, peer_addr, &dispatcher, upstream.as_ref(), max_body_bytes)
                            .await
                    }
                });

                if let Err(e) = http1::Builder::new().serve_connection(io, service).await {
                    debug!("Connection error: {}", e);
                }
            });
        }
    }
}

/// Admin listener answering `GET /metrics` and `GET /healthz`
pub struct AdminServer {
    bind_addr: String,
}

impl AdminServer {
    pub fn new(bind_addr: String) -> Self {
        Self { bind_addr }
    }

    pub async fn serve(self) -> Result<(), KgRouteError> {
        let listener = TcpListener::bind(&self.bind_addr).await?;
        self.serve_listener(listener).await
    }

    pub async fn serve_listener(self, listener: TcpListener) -> Result<(), KgRouteError> {
        let local_addr = listener.local_addr()?;
        info!("Admin endpoints on http://{}", local_addr);

        loop {
            let (stream, peer_addr) = match listener.accept().await {
                Ok(accepted) => accepted,
                Err(e) => {
                    error!("Accept error on {}: {}", local_addr, e);
                    continue;
                }
            };
            debug!("Accepted admin connection from {}", peer_addr);

            tokio::spawn(async move {
                let service = service_fn(|req: Request<hyper::body::Incoming>| async move {
                    Ok::<_, Infallible>(handle_admin_request(&req))
                });
                if let Err(e) = http1::Builder::new()
                    .serve_connection(TokioIo::new(stream), service)
                    .await
                {
                    debug!("Admin connection error: {}", e);
                }
            });
        }
    }
}

/// Built-in endpoints of the admin listener
pub fn handle_admin_request<B>(req: &Request<B>) -> Response<Full<Bytes>> {
    if *req.method() != Method::GET {
        return text_response(StatusCode::METHOD_NOT_ALLOWED, "Method Not Allowed");
    }
    match req.uri().path() {
        "/healthz" => text_response(StatusCode::OK, "ok"),
        "/metrics" => metrics_response(),
        _ => text_response(StatusCode::NOT_FOUND, "Not Found"),
    }
}

/// Route one request and forward it to the selected instance
pub async fn handle_request<B, U>(
    req: Request<B>,
    client: SocketAddr,
    dispatcher: &Dispatcher,
    upstream: &U,
    max_body_bytes: usize,
) -> Result<Response<Full<Bytes>>, Infallible>
where
    B: Body,
    B::Error: Into<Box<dyn std::error::Error + Send + Sync>>,
    U: Upstream<Request = ForwardRequest, Response = Response<Bytes>>,
{
    let request_id = req
        .headers()
        .get(REQUEST_ID_HEADER)
        .and_then(|v| v.to_str().ok())
        .map(|s| s.to_string())
        .unwrap_or_else(|| Uuid::new_v4().to_string());

    let start = Instant::now();
    let host = request_host(&req);
    let path_and_query = req
        .uri()
        .path_and_query()
        .map(|pq| pq.as_str().to_string())
        .unwrap_or_else(|| "/".to_string());
    let inbound = InboundRequest::new(&host, &path_and_query).with_client(client);

    info!(
        request_id = %request_id,
        http.request.method = %req.method(),
        host = %inbound.host,
        url.path = %inbound.path,
        "Incoming HTTP request"
    );

    let (mut parts, body) = req.into_parts();
    let body = match Limited::new(body, max_body_bytes).collect().await {
        Ok(collected) => collected.to_bytes(),
        Err(e) if e.is::<LengthLimitError>() => {
            debug!(request_id = %request_id, limit = max_body_bytes, "Request body too large");
            return Ok(text_response(StatusCode::PAYLOAD_TOO_LARGE, "Payload Too Large"));
        }
        Err(e) => {
            debug!("Failed to read request body: {}", e);
            return Ok(text_response(StatusCode::BAD_REQUEST, "Bad Request"));
        }
    };
    if let Ok(value) = header::HeaderValue::from_str(&request_id) {
        parts.headers.insert(REQUEST_ID_HEADER, value);
    }
    let forward = ForwardRequest {
        method: parts.method,
        headers: parts.headers,
        body,
    };

    let (mut response, outcome, host_label) = match dispatcher.dispatch(upstream, &inbound, forward).await {
        Ok((_target, response)) => (
            response.map(Full::new),
            "success",
            normalize_host(&inbound.host),
        ),
        Err(e) => {
            let host_label = match e {
                RoutingError::RouteNotFound { .. } => "unmatched".to_string(),
                _ => normalize_host(&inbound.host),
            };
            (error_response(&e), e.outcome(), host_label)
        }
    };

    ROUTED_REQUESTS_TOTAL
        .with_label_values(&[host_label.as_str(), outcome, response.status().as_str()])
        .inc();
    REQUEST_DURATION
        .with_label_values(&[outcome])
        .observe(start.elapsed().as_secs_f64());

    debug!(
        request_id = %request_id,
        status = response.status().as_u16(),
        outcome,
        duration_ms = start.elapsed().as_millis() as u64,
        "Request completed"
    );
    if let Ok(value) = header::HeaderValue::from_str(&request_id) {
        response.headers_mut().insert(REQUEST_ID_HEADER, value);
    }

    Ok(response)
}

/// Host header, falling back to the request URI authority
fn request_host<B>(req: &Request<B>) -> String {
    req.headers()
        .get(header::HOST)
        .and_then(|v| v.to_str().ok())
        .map(str::to_string)
        .or_else(|| req.uri().host().map(str::to_string))
        .unwrap_or_default()
}

fn error_response(err: &RoutingError) -> Response<Full<Bytes>> {
    let status =
        StatusCode::from_u16(err.status_code()).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
    text_response(status, &err.to_string())
}

fn text_response(status: StatusCode, body: &str) -> Response<Full<Bytes>> {
    let mut response = Response::new(Full::new(Bytes::from(body.to_string())));
    *response.status_mut() = status;
    response.headers_mut().insert(
        header::CONTENT_TYPE,
        header::HeaderValue::from_static("text/plain; charset=utf-8"),
    );
    response
}

fn metrics_response() -> Response<Full<Bytes>> {
    match encode_metrics() {
        Ok(buffer) => {
            let mut response = Response::new(Full::new(Bytes::from(buffer)));
            response.headers_mut().insert(
                header::CONTENT_TYPE,
                header::HeaderValue::from_static(metrics_content_type()),
            );
            response
        }
        Err(e) => {
            error!("{}", e);
            text_response(StatusCode::INTERNAL_SERVER_ERROR, "Internal Server Error")
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::apis::ingress::BackendPort;
    use crate::apis::manifests::Declarations;
    use crate::apis::service::TargetPort;
    use crate::apis::workload::ContainerPort;
    use crate::config::SimulationConfig;
    use crate::error::UpstreamError;
    use crate::topology::dispatch::Target;
    use crate::topology::instance::simulate_instances;
    use crate::topology::resolver::LoadBalancePolicy;
    use crate::topology::snapshot::SnapshotStore;
    use async_trait::async_trait;
    use http_body_util::Empty;
    use std::net::Ipv4Addr;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    const MANIFESTS: &str = include_str!("../../../deploy/knowledge-graph.yaml");
    const HOST: &str = "knowledgegraph.example.com";
    const LIMIT: usize = DEFAULT_MAX_BODY_BYTES;

    fn client() -> SocketAddr {
        "192.0.2.10:40000".parse().expect("valid address")
    }

    fn dispatcher_for(decl: Declarations, sim: SimulationConfig) -> Dispatcher {
        let instances = simulate_instances(&decl.workloads, &sim);
        let store = Arc::new(SnapshotStore::new());
        store.publish(Arc::new(decl), instances);
        Dispatcher::new(store, LoadBalancePolicy::RoundRobin, Duration::from_secs(2))
    }

    fn request(host: &str, uri: &str) -> Request<Empty<Bytes>> {
        Request::builder()
            .uri(uri)
            .header(header::HOST, host)
            .body(Empty::<Bytes>::new())
            .expect("valid request")
    }

    async fn body_text(response: Response<Full<Bytes>>) -> String {
        let bytes = response
            .into_body()
            .collect()
            .await
            .expect("Full body never fails")
            .to_bytes();
        String::from_utf8_lossy(&bytes).to_string()
    }

    /// Upstream answering with the forwarded URI and counting calls
    #[derive(Default)]
    struct CountingUpstream(AtomicUsize);

    #[async_trait]
    impl Upstream for CountingUpstream {
        type Request = ForwardRequest;
        type Response = Response<Bytes>;

        async fn send(
            &self,
            target: &Target,
            _request: ForwardRequest,
        ) -> Result<Response<Bytes>, UpstreamError> {
            self.0.fetch_add(1, Ordering::SeqCst);
            Ok(Response::new(Bytes::from(target.forwarded_uri.clone())))
        }
    }

    /// Shipped manifests with the Ingress backend port corrected to 80
    fn corrected_dispatcher() -> Dispatcher {
        let mut decl = Declarations::from_yaml_str(MANIFESTS).expect("Should parse");
        decl.routes[0].backend_port = BackendPort::Number(80);
        dispatcher_for(decl, SimulationConfig::default())
    }

    #[test]
    fn test_admin_healthz_and_metrics() {
        let response = handle_admin_request(&request(HOST, "/healthz"));
        assert_eq!(response.status(), StatusCode::OK);

        let response = handle_admin_request(&request(HOST, "/metrics"));
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(
            response.headers().get(header::CONTENT_TYPE).and_then(|v| v.to_str().ok()),
            Some(metrics_content_type())
        );

        let response = handle_admin_request(&request(HOST, "/api"));
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn test_builtin_paths_are_routed_on_the_data_path() {
        let dispatcher = corrected_dispatcher();
        let upstream = CountingUpstream::default();

        for (calls, path) in ["/api", "/metrics", "/healthz"].into_iter().enumerate() {
            let response = handle_request(request(HOST, path), client(), &dispatcher, &upstream, LIMIT)
                .await
                .expect("Infallible");
            assert_eq!(response.status(), StatusCode::OK);
            assert_eq!(body_text(response).await, "/", "{} should be rewritten to /", path);
            assert_eq!(upstream.0.load(Ordering::SeqCst), calls + 1, "{} should reach the backend", path);
        }
    }

    #[tokio::test]
    async fn test_oversized_body_is_413() {
        let dispatcher = corrected_dispatcher();
        let upstream = CountingUpstream::default();

        let oversized = Request::builder()
            .method(Method::POST)
            .uri("/graph/import")
            .header(header::HOST, HOST)
            .body(Full::new(Bytes::from(vec![b'x'; 64])))
            .expect("valid request");
        let response = handle_request(oversized, client(), &dispatcher, &upstream, 32)
            .await
            .expect("Infallible");
        assert_eq!(response.status(), StatusCode::PAYLOAD_TOO_LARGE);
        assert_eq!(upstream.0.load(Ordering::SeqCst), 0, "Nothing should be forwarded");

        let within = Request::builder()
            .method(Method::POST)
            .uri("/graph/import")
            .header(header::HOST, HOST)
            .body(Full::new(Bytes::from(vec![b'x'; 32])))
            .expect("valid request");
        let response = handle_request(within, client(), &dispatcher, &upstream, 32)
            .await
            .expect("Infallible");
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(upstream.0.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_unknown_host_is_404() {
        let decl = Declarations::from_yaml_str(MANIFESTS).expect("Should parse");
        let dispatcher = dispatcher_for(decl, SimulationConfig::default());

        let response = handle_request(request("other.example.com", "/"), client(), &dispatcher, &HyperUpstream, LIMIT)
            .await
            .expect("Infallible");
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
        assert!(
            response.headers().contains_key(REQUEST_ID_HEADER),
            "Responses should carry a request id"
        );
    }

    #[tokio::test]
    async fn test_declared_port_is_502() {
        let decl = Declarations::from_yaml_str(MANIFESTS).expect("Should parse");
        let dispatcher = dispatcher_for(decl, SimulationConfig::default());

        let response = handle_request(request(HOST, "/"), client(), &dispatcher, &HyperUpstream, LIMIT)
            .await
            .expect("Infallible");
        assert_eq!(response.status(), StatusCode::BAD_GATEWAY);
        assert!(body_text(response).await.contains("exposes no port 8000"));
    }

    #[tokio::test]
    async fn test_unready_instances_are_503() {
        let decl = Declarations::from_yaml_str(MANIFESTS).expect("Should parse");
        let sim = SimulationConfig {
            ready: false,
            ..SimulationConfig::default()
        };
        let dispatcher = dispatcher_for(decl, sim);

        let response = handle_request(request(HOST, "/"), client(), &dispatcher, &HyperUpstream, LIMIT)
            .await
            .expect("Infallible");
        assert_eq!(response.status(), StatusCode::SERVICE_UNAVAILABLE);
    }

    #[tokio::test]
    async fn test_end_to_end_through_server() {
        // Backend answering with the URI it received
        let backend = TcpListener::bind("127.0.0.1:0").await.expect("Should bind");
        let backend_port = backend.local_addr().expect("Should have address").port();
        tokio::spawn(async move {
            while let Ok((stream, _)) = backend.accept().await {
                tokio::spawn(async move {
                    let service = service_fn(|req: Request<hyper::body::Incoming>| async move {
                        Ok::<_, Infallible>(Response::new(Full::new(Bytes::from(
                            req.uri().to_string(),
                        ))))
                    });
                    let _ = http1::Builder::new()
                        .serve_connection(TokioIo::new(stream), service)
                        .await;
                });
            }
        });

        // Corrected backend port, instances on loopback at the backend port
        let mut decl = Declarations::from_yaml_str(MANIFESTS).expect("Should parse");
        decl.routes[0].backend_port = BackendPort::Number(80);
        decl.services[0].ports[0].target_port = TargetPort::Number(backend_port);
        decl.workloads[0].replicas = 1;
        decl.workloads[0].containers[0].ports = vec![ContainerPort::tcp(backend_port)];
        let sim = SimulationConfig {
            address_base: Ipv4Addr::new(127, 0, 0, 0),
            first_host: 1,
            ready: true,
        };
        let dispatcher = Arc::new(dispatcher_for(decl, sim));

        let front = TcpListener::bind("127.0.0.1:0").await.expect("Should bind");
        let front_addr = front.local_addr().expect("Should have address");
        let server = ProxyServer::new(front_addr.to_string(), dispatcher);
        tokio::spawn(server.serve_listener(front));

        let stream = tokio::net::TcpStream::connect(front_addr)
            .await
            .expect("Should connect to front");
        let (mut sender, conn) = hyper::client::conn::http1::handshake(TokioIo::new(stream))
            .await
            .expect("Should handshake");
        tokio::spawn(conn);

        let response = sender
            .send_request(request(HOST, "/graph/nodes?limit=5"))
            .await
            .expect("Front should answer");
        assert_eq!(response.status(), StatusCode::OK);
        let body = response
            .into_body()
            .collect()
            .await
            .expect("Should read body")
            .to_bytes();
        assert_eq!(body.as_ref(), b"/?limit=5", "Path rewritten to / with query kept");
    }
}
