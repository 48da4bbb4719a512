//! Ingress → RouteRule conversion
//!
//! Each `rules[].http.paths[]` entry becomes one RouteRule. Declaration order
//! is preserved in `RouteRule::order` and is the final tie-break when two
//! rules match a request equally well.

use crate::error::ManifestError;
use k8s_openapi::api::networking::v1::{HTTPIngressPath, Ingress};
use serde::{Deserialize, Serialize};
use std::fmt;
use tracing::warn;

/// Annotation carrying the rewrite directive
pub const REWRITE_TARGET_ANNOTATION: &str = "nginx.ingress.kubernetes.io/rewrite-target";

/// `pathType` of an Ingress path
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum PathType {
    Exact,
    Prefix,
    ImplementationSpecific,
}

impl PathType {
    fn parse(value: &str) -> Option<Self> {
        match value {
            "Exact" => Some(PathType::Exact),
            "Prefix" => Some(PathType::Prefix),
            "ImplementationSpecific" => Some(PathType::ImplementationSpecific),
            _ => None,
        }
    }
}

/// `backend.service.port`: a number or the name of a Service port
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum BackendPort {
    Number(u16),
    Name(String),
}

impl fmt::Display for BackendPort {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            BackendPort::Number(n) => write!(f, "{}", n),
            BackendPort::Name(name) => f.write_str(name),
        }
    }
}

/// Host/path → backend Service mapping
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RouteRule {
    /// Ingress the rule was declared in
    pub ingress: String,
    /// `None` matches any host
    pub host: Option<String>,
    pub path: String,
    pub path_type: PathType,
    /// Replacement for the whole forwarded path
    pub rewrite_target: Option<String>,
    pub backend_service: String,
    pub backend_port: BackendPort,
    /// Position across all declared rules
    pub order: usize,
}

/// Flatten an Ingress into route rules, numbering them from `first_order`
pub fn rules_from_ingress(
    ingress: &Ingress,
    first_order: usize,
) -> Result<Vec<RouteRule>, ManifestError> {
    let name = ingress
        .metadata
        .name
        .clone()
        .ok_or_else(|| ManifestError::invalid("Ingress", "<unnamed>", "missing metadata.name"))?;

    let rewrite_target = ingress
        .metadata
        .annotations
        .as_ref()
        .and_then(|a| a.get(REWRITE_TARGET_ANNOTATION))
        .cloned();

    let mut rules = Vec::new();
    let Some(spec) = &ingress.spec else {
        return Ok(rules);
    };

    if spec.default_backend.is_some() {
        warn!(ingress = %name, "defaultBackend is not routed; only host/path rules are");
    }

    for rule in spec.rules.iter().flatten() {
        let host = rule.host.as_ref().map(|h| h.to_ascii_lowercase());
        let Some(http) = &rule.http else {
            continue;
        };
        for path in &http.paths {
            rules.push(route_rule(
                &name,
                host.clone(),
                path,
                rewrite_target.clone(),
                first_order + rules.len(),
            )?);
        }
    }

    Ok(rules)
}

fn route_rule(
    ingress: &str,
    host: Option<String>,
    path: &HTTPIngressPath,
    rewrite_target: Option<String>,
    order: usize,
) -> Result<RouteRule, ManifestError> {
    let path_type = PathType::parse(&path.path_type).ok_or_else(|| {
        ManifestError::invalid(
            "Ingress",
            ingress,
            format!("unknown pathType '{}'", path.path_type),
        )
    })?;

    let service = path.backend.service.as_ref().ok_or_else(|| {
        ManifestError::invalid("Ingress", ingress, "only service backends are supported")
    })?;

    let backend_port = match &service.port {
        Some(port) => match (port.number, &port.name) {
            (Some(n), _) => BackendPort::Number(u16::try_from(n).map_err(|_| {
                ManifestError::invalid("Ingress", ingress, format!("backend port {} out of range", n))
            })?),
            (None, Some(name)) => BackendPort::Name(name.clone()),
            (None, None) => {
                return Err(ManifestError::invalid(
                    "Ingress",
                    ingress,
                    "backend port needs a number or a name",
                ))
            }
        },
        None => {
            return Err(ManifestError::invalid(
                "Ingress",
                ingress,
                format!("backend '{}' has no port", service.name),
            ))
        }
    };

    Ok(RouteRule {
        ingress: ingress.to_string(),
        host,
        // Kubernetes defaults an empty path to "/"
        path: path.path.clone().unwrap_or_else(|| "/".to_string()),
        path_type,
        rewrite_target,
        backend_service: service.name.clone(),
        backend_port,
        order,
    })
}

/// Validate an Ingress path
///
/// Rules:
/// - Must not be empty
/// - Must start with "/"
/// - Must not contain double slashes
pub fn validate_path(path: &str) -> Result<(), String> {
    if path.is_empty() {
        return Err("Path cannot be empty".to_string());
    }

    if !path.starts_with('/') {
        return Err(format!("Path '{}' must start with '/'", path));
    }

    if path.contains("//") {
        return Err(format!("Path '{}' cannot contain double slashes", path));
    }

    Ok(())
}

/// Validate hostname according to DNS-1123 subdomain rules
///
/// Rules:
/// - Lowercase alphanumeric characters, hyphens, and dots only
/// - Labels must not start or end with a hyphen
/// - Must not have empty labels
/// - Can start with wildcard "*."
/// - Max length 253 characters
pub fn validate_hostname(hostname: &str) -> Result<(), String> {
    if hostname.is_empty() {
        return Err("Hostname cannot be empty".to_string());
    }

    if hostname.len() > 253 {
        return Err(format!("Hostname '{}' exceeds 253 characters", hostname));
    }

    let hostname_to_check = hostname.strip_prefix("*.").unwrap_or(hostname);
    if hostname_to_check.is_empty() {
        return Err("Hostname cannot be just '*.'".to_string());
    }

    for label in hostname_to_check.split('.') {
        if label.is_empty() {
            return Err(format!("Hostname '{}' has an empty label", hostname));
        }
        if label.len() > 63 {
            return Err(format!("Hostname label '{}' exceeds 63 characters", label));
        }
        if label.starts_with('-') || label.ends_with('-') {
            return Err(format!(
                "Hostname label '{}' cannot start or end with '-'",
                label
            ));
        }
        if let Some(c) = label
            .chars()
            .find(|c| !c.is_ascii_lowercase() && !c.is_ascii_digit() && *c != '-')
        {
            return Err(format!(
                "Hostname '{}' contains invalid character '{}'",
                hostname, c
            ));
        }
    }

    Ok(())
}
