use thiserror::Error;

use crate::topology::validation::Finding;

/// Per-request routing failures
///
/// Every variant terminates the request with a client-visible status.
/// Nothing on the request path is retried.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum RoutingError {
    #[error("no route for host '{host}' and path '{path}'")]
    RouteNotFound { host: String, path: String },

    #[error("service '{service}' has no ready instances")]
    BackendUnavailable { service: String },

    #[error("configuration mismatch: {0}")]
    ConfigurationMismatch(#[from] Mismatch),

    #[error("backend {endpoint} did not answer within {timeout_ms}ms")]
    Timeout { endpoint: String, timeout_ms: u64 },

    #[error("backend {endpoint} failed: {reason}")]
    Upstream { endpoint: String, reason: String },
}

impl RoutingError {
    /// HTTP status reported to the client
    pub fn status_code(&self) -> u16 {
        match self {
            RoutingError::RouteNotFound { .. } => 404,
            RoutingError::BackendUnavailable { .. } => 503,
            RoutingError::ConfigurationMismatch(_) => 502,
            RoutingError::Upstream { .. } => 502,
            RoutingError::Timeout { .. } => 504,
        }
    }

    /// Stable label for metrics and logs
    pub fn outcome(&self) -> &'static str {
        match self {
            RoutingError::RouteNotFound { .. } => "route_not_found",
            RoutingError::BackendUnavailable { .. } => "backend_unavailable",
            RoutingError::ConfigurationMismatch(_) => "configuration_mismatch",
            RoutingError::Upstream { .. } => "upstream_error",
            RoutingError::Timeout { .. } => "timeout",
        }
    }
}

/// Referential inconsistencies between declared resources, found at request time
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum Mismatch {
    #[error("route backend '{service}' does not name a declared service")]
    UnknownService { service: String },

    #[error("service '{service}' exposes no port {port}")]
    ServicePortNotExposed { service: String, port: String },

    #[error("instance '{instance}' does not expose target port {target_port} of service '{service}'")]
    TargetPortNotExposed {
        service: String,
        instance: String,
        target_port: String,
    },
}

/// Failures reaching a selected backend
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum UpstreamError {
    #[error("connect failed: {0}")]
    Connect(String),

    #[error("protocol error: {0}")]
    Protocol(String),
}

/// Manifest loading and conversion errors
#[derive(Error, Debug)]
pub enum ManifestError {
    #[error("failed to read manifests from {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("invalid YAML: {0}")]
    Yaml(#[from] serde_yaml::Error),

    #[error("{kind} '{name}': {reason}")]
    Invalid {
        kind: &'static str,
        name: String,
        reason: String,
    },
}

impl ManifestError {
    pub(crate) fn invalid(kind: &'static str, name: &str, reason: impl Into<String>) -> Self {
        ManifestError::Invalid {
            kind,
            name: name.to_string(),
            reason: reason.into(),
        }
    }
}

/// Strict-mode validation failure
#[derive(Error, Debug)]
#[error("{} configuration finding(s) in strict mode", .findings.len())]
pub struct ValidationError {
    pub findings: Vec<Finding>,
}

/// Reconciliation-side conditions, never surfaced on the request path
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ReconcileError {
    #[error("instance '{instance}' unhealthy: {reason}")]
    InstanceUnhealthy { instance: String, reason: String },
}

/// Top-level errors for the controller binary
#[derive(Error, Debug)]
pub enum KgRouteError {
    #[error(transparent)]
    Manifest(#[from] ManifestError),

    #[error(transparent)]
    Validation(#[from] ValidationError),

    #[error("configuration error: {0}")]
    Config(String),

    #[error("Kubernetes error: {0}")]
    Kubernetes(#[from] kube::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_codes_follow_error_class() {
        let not_found = RoutingError::RouteNotFound {
            host: "other.example.com".to_string(),
            path: "/".to_string(),
        };
        let unavailable = RoutingError::BackendUnavailable {
            service: "knowledge-graph-service".to_string(),
        };
        let mismatch = RoutingError::from(Mismatch::ServicePortNotExposed {
            service: "knowledge-graph-service".to_string(),
            port: "8000".to_string(),
        });
        let timeout = RoutingError::Timeout {
            endpoint: "10.244.0.10:8080".to_string(),
            timeout_ms: 5000,
        };

        assert_eq!(not_found.status_code(), 404);
        assert_eq!(unavailable.status_code(), 503);
        assert_eq!(mismatch.status_code(), 502);
        assert_eq!(timeout.status_code(), 504);
        assert_eq!(mismatch.outcome(), "configuration_mismatch");
    }

    #[test]
    fn test_mismatch_message_names_port() {
        let err = RoutingError::from(Mismatch::ServicePortNotExposed {
            service: "knowledge-graph-service".to_string(),
            port: "8000".to_string(),
        });
        assert_eq!(
            err.to_string(),
            "configuration mismatch: service 'knowledge-graph-service' exposes no port 8000"
        );
    }
}
