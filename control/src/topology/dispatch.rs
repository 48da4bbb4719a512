//! Request dispatch: route match → member selection → bounded upstream call
//!
//! Each request reads one snapshot and never writes topology state. Checks
//! run in a fixed order: route, backend Service, ready members, Service
//! port, instance target port, then the upstream call under a timeout.

use crate::error::{Mismatch, RoutingError, UpstreamError};
use crate::topology::resolver::{flow_key, LoadBalancePolicy};
use crate::topology::snapshot::SnapshotStore;
use async_trait::async_trait;
use common::Endpoint;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};

/// Per-request progress, reported through tracing
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RequestStage {
    Received,
    HostMatched,
    PathMatched,
    Rewritten,
    Dispatched,
    Success,
}

/// What the router needs to know about an incoming request
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InboundRequest {
    pub host: String,
    pub path: String,
    pub query: Option<String>,
    pub client: Option<SocketAddr>,
}

impl InboundRequest {
    /// Split `path_and_query` at the first `?`
    pub fn new(host: &str, path_and_query: &str) -> Self {
        let (path, query) = match path_and_query.split_once('?') {
            Some((path, query)) => (path, Some(query.to_string())),
            None => (path_and_query, None),
        };
        Self {
            host: host.to_string(),
            path: if path.is_empty() { "/".to_string() } else { path.to_string() },
            query,
            client: None,
        }
    }

    pub fn with_client(mut self, client: SocketAddr) -> Self {
        self.client = Some(client);
        self
    }
}

/// Selected backend for one request
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Target {
    pub service: Arc<str>,
    pub instance: String,
    pub endpoint: Endpoint,
    /// Rewritten path plus the original query string
    pub forwarded_uri: String,
    /// Snapshot generation the decision was made against
    pub generation: u64,
}

/// Transport to a selected backend
#[async_trait]
pub trait Upstream: Send + Sync {
    type Request: Send;
    type Response: Send;

    async fn send(
        &self,
        target: &Target,
        request: Self::Request,
    ) -> Result<Self::Response, UpstreamError>;
}

/// Routes requests against the current snapshot
pub struct Dispatcher {
    store: Arc<SnapshotStore>,
    policy: LoadBalancePolicy,
    backend_timeout: Duration,
}

impl Dispatcher {
    pub fn new(store: Arc<SnapshotStore>, policy: LoadBalancePolicy, backend_timeout: Duration) -> Self {
        Self {
            store,
            policy,
            backend_timeout,
        }
    }

    pub fn store(&self) -> &Arc<SnapshotStore> {
        &self.store
    }

    pub fn backend_timeout(&self) -> Duration {
        self.backend_timeout
    }

    /// Decide where a request goes without contacting the backend
    pub fn plan(&self, request: &InboundRequest) -> Result<Target, RoutingError> {
        let snapshot = self.store.load();
        debug!(stage = ?RequestStage::Received, host = %request.host, path = %request.path, generation = snapshot.generation());

        let route = snapshot.routes().match_request(&request.host, &request.path)?;
        debug!(stage = ?RequestStage::HostMatched, host = ?route.host);
        debug!(stage = ?RequestStage::PathMatched, matched = %route.matched_path, service = %route.service);

        let forwarded_uri = route.forwarded_uri(request.query.as_deref());
        debug!(stage = ?RequestStage::Rewritten, forwarded = %forwarded_uri);

        let entry = snapshot
            .service(&route.service)
            .ok_or_else(|| Mismatch::UnknownService {
                service: route.service.to_string(),
            })?;

        if entry.members.is_empty() {
            return Err(RoutingError::BackendUnavailable {
                service: route.service.to_string(),
            });
        }

        let port = entry
            .record
            .port(&route.backend_port)
            .ok_or_else(|| Mismatch::ServicePortNotExposed {
                service: route.service.to_string(),
                port: route.backend_port.to_string(),
            })?;

        let flow = request.client.as_ref().map(flow_key);
        let member = entry
            .members
            .pick(self.policy, flow)
            .ok_or_else(|| RoutingError::BackendUnavailable {
                service: route.service.to_string(),
            })?;

        let target_port = port
            .target_port
            .resolve(&member.ports)
            .ok_or_else(|| Mismatch::TargetPortNotExposed {
                service: route.service.to_string(),
                instance: member.name.clone(),
                target_port: port.target_port.to_string(),
            })?;

        Ok(Target {
            service: Arc::clone(&route.service),
            instance: member.name.clone(),
            endpoint: Endpoint::new(member.addr, target_port),
            forwarded_uri,
            generation: snapshot.generation(),
        })
    }

    /// Route a request and forward it through `upstream`
    ///
    /// Dropping the returned future before it completes leaves no trace.
    pub async fn dispatch<U: Upstream>(
        &self,
        upstream: &U,
        request: &InboundRequest,
        body: U::Request,
    ) -> Result<(Target, U::Response), RoutingError> {
        let target = match self.plan(request) {
            Ok(target) => target,
            Err(e) => {
                debug!(host = %request.host, path = %request.path, outcome = e.outcome(), "Request not dispatched: {}", e);
                return Err(e);
            }
        };

        debug!(
            stage = ?RequestStage::Dispatched,
            service = %target.service,
            instance = %target.instance,
            endpoint = %target.endpoint
        );

        match tokio::time::timeout(self.backend_timeout, upstream.send(&target, body)).await {
            Ok(Ok(response)) => {
                debug!(stage = ?RequestStage::Success, endpoint = %target.endpoint);
                Ok((target, response))
            }
            Ok(Err(e)) => {
                warn!(endpoint = %target.endpoint, instance = %target.instance, "Upstream failed: {}", e);
                Err(RoutingError::Upstream {
                    endpoint: target.endpoint.to_string(),
                    reason: e.to_string(),
                })
            }
            Err(_) => {
                warn!(
                    endpoint = %target.endpoint,
                    timeout_ms = self.backend_timeout.as_millis() as u64,
                    "Upstream timed out"
                );
                Err(RoutingError::Timeout {
                    endpoint: target.endpoint.to_string(),
                    timeout_ms: self.backend_timeout.as_millis() as u64,
                })
            }
        }
    }
}
