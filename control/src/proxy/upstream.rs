//! HTTP/1 upstream - forwards a request to the selected instance
//!
//! One connection per request: connect, handshake, send, read the whole
//! response. The dispatcher bounds the entire exchange with its timeout.

use crate::error::UpstreamError;
use crate::topology::dispatch::{Target, Upstream};
use async_trait::async_trait;
use http_body_util::{BodyExt, Full};
use hyper::body::Bytes;
use hyper::header::{self, HeaderMap};
use hyper::{Method, Request, Response};
use hyper_util::rt::TokioIo;
use tokio::net::TcpStream;
use tracing::debug;

/// Hop-by-hop headers that must not be forwarded
const HOP_BY_HOP: &[&str] = &[
    "connection",
    "keep-alive",
    "proxy-connection",
    "proxy-authorization",
    "te",
    "trailer",
    "transfer-encoding",
    "upgrade",
    "content-length",
];

/// Drop hop-by-hop headers, including any the `connection` header names
fn strip_hop_by_hop(headers: &mut HeaderMap) {
    let listed: Vec<String> = headers
        .get_all(header::CONNECTION)
        .iter()
        .filter_map(|v| v.to_str().ok())
        .flat_map(|v| v.split(','))
        .map(|token| token.trim().to_ascii_lowercase())
        .filter(|token| !token.is_empty())
        .collect();

    for name in HOP_BY_HOP {
        headers.remove(*name);
    }
    for name in &listed {
        headers.remove(name.as_str());
    }
}

/// A buffered request ready to be forwarded
#[derive(Debug, Clone, Default)]
pub struct ForwardRequest {
    pub method: Method,
    pub headers: HeaderMap,
    pub body: Bytes,
}

/// Forwards over a fresh HTTP/1 connection
#[derive(Debug, Clone, Copy, Default)]
pub struct HyperUpstream;

#[async_trait]
impl Upstream for HyperUpstream {
    type Request = ForwardRequest;
    type Response = Response<Bytes>;

    async fn send(
        &self,
        target: &Target,
        request: ForwardRequest,
    ) -> Result<Response<Bytes>, UpstreamError> {
        let addr = target.endpoint.to_socket_addr();

        let stream = TcpStream::connect(addr)
            .await
            .map_err(|e| UpstreamError::Connect(e.to_string()))?;
        let io = TokioIo::new(stream);

        let (mut sender, conn) = hyper::client::conn::http1::handshake(io)
            .await
            .map_err(|e| UpstreamError::Protocol(e.to_string()))?;

        // Spawn connection driver
        tokio::spawn(async move {
            if let Err(e) = conn.await {
                debug!("Backend connection error: {}", e);
            }
        });

        let mut forwarded_headers = request.headers;
        strip_hop_by_hop(&mut forwarded_headers);
        let mut builder = Request::builder()
            .method(request.method)
            .uri(target.forwarded_uri.as_str());
        if let Some(headers) = builder.headers_mut() {
            *headers = forwarded_headers;
        }
        let backend_request = builder
            .body(Full::new(request.body))
            .map_err(|e| UpstreamError::Protocol(e.to_string()))?;

        let response = sender
            .send_request(backend_request)
            .await
            .map_err(|e| UpstreamError::Protocol(e.to_string()))?;

        let (mut parts, body) = response.into_parts();
        strip_hop_by_hop(&mut parts.headers);
        let body = body
            .collect()
            .await
            .map_err(|e| UpstreamError::Protocol(e.to_string()))?
            .to_bytes();

        Ok(Response::from_parts(parts, body))
    }
}
