//! Eager consistency checks across the declared resources
//!
//! Lenient mode reports findings as warnings and routes anyway; strict mode
//! refuses to load a declaration set with any finding.

use crate::apis::ingress::{validate_hostname, validate_path};
use crate::apis::manifests::Declarations;
use crate::error::ValidationError;
use std::fmt;
use thiserror::Error;
use tracing::warn;

/// One inconsistency in the declared resources
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum Issue {
    #[error("pod template has no labels")]
    EmptyLabels,

    #[error("selector {selector} is not satisfied by the pod template labels")]
    SelectorNotInLabels { selector: String },

    #[error("selector {selector} matches no declared workload")]
    ServiceSelectsNothing { selector: String },

    #[error("targetPort {target_port} of port {port} is not exposed by workload '{workload}'")]
    TargetPortNotExposed {
        port: u16,
        target_port: String,
        workload: String,
    },

    #[error("backend service '{service}' is not declared")]
    UnknownBackendService { service: String },

    #[error("backend port {port} is not exposed by service '{service}'")]
    BackendPortNotExposed { service: String, port: String },

    #[error("{0}")]
    InvalidHostname(String),

    #[error("{0}")]
    InvalidPath(String),
}

/// An issue attributed to a resource (`Kind/name`)
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Finding {
    pub resource: String,
    pub issue: Issue,
}

impl Finding {
    fn new(kind: &str, name: &str, issue: Issue) -> Self {
        Self {
            resource: format!("{}/{}", kind, name),
            issue,
        }
    }
}

impl fmt::Display for Finding {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.resource, self.issue)
    }
}

/// All findings for a declaration set, in resource order
pub fn validate(decl: &Declarations) -> Vec<Finding> {
    let mut findings = Vec::new();

    for workload in &decl.workloads {
        if workload.labels.is_empty() {
            findings.push(Finding::new("Deployment", &workload.name, Issue::EmptyLabels));
        }
        if !workload.selector.matches(&workload.labels) {
            findings.push(Finding::new(
                "Deployment",
                &workload.name,
                Issue::SelectorNotInLabels {
                    selector: workload.selector.to_string(),
                },
            ));
        }
    }

    for service in &decl.services {
        let selected: Vec<_> = decl
            .workloads
            .iter()
            .filter(|w| service.selector.matches(&w.labels))
            .collect();

        if selected.is_empty() {
            findings.push(Finding::new(
                "Service",
                &service.name,
                Issue::ServiceSelectsNothing {
                    selector: service.selector.to_string(),
                },
            ));
            continue;
        }

        for port in &service.ports {
            for workload in &selected {
                let ports: Vec<_> = workload.container_ports().cloned().collect();
                if port.target_port.resolve(&ports).is_none() {
                    findings.push(Finding::new(
                        "Service",
                        &service.name,
                        Issue::TargetPortNotExposed {
                            port: port.port,
                            target_port: port.target_port.to_string(),
                            workload: workload.name.clone(),
                        },
                    ));
                }
            }
        }
    }

    for route in &decl.routes {
        if let Some(host) = &route.host {
            if let Err(e) = validate_hostname(host) {
                findings.push(Finding::new("Ingress", &route.ingress, Issue::InvalidHostname(e)));
            }
        }
        if let Err(e) = validate_path(&route.path) {
            findings.push(Finding::new("Ingress", &route.ingress, Issue::InvalidPath(e)));
        }

        match decl.service(&route.backend_service) {
            None => findings.push(Finding::new(
                "Ingress",
                &route.ingress,
                Issue::UnknownBackendService {
                    service: route.backend_service.clone(),
                },
            )),
            Some(service) if service.port(&route.backend_port).is_none() => {
                findings.push(Finding::new(
                    "Ingress",
                    &route.ingress,
                    Issue::BackendPortNotExposed {
                        service: service.name.clone(),
                        port: route.backend_port.to_string(),
                    },
                ))
            }
            Some(_) => {}
        }
    }

    findings
}

/// Apply the validation policy
///
/// Strict mode fails on any finding. Lenient mode logs each finding and
/// returns them.
pub fn enforce(decl: &Declarations, strict: bool) -> Result<Vec<Finding>, ValidationError> {
    let findings = validate(decl);
    if strict && !findings.is_empty() {
        return Err(ValidationError { findings });
    }
    for finding in &findings {
        warn!(resource = %finding.resource, "Configuration finding: {}", finding.issue);
    }
    Ok(findings)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::apis::ingress::BackendPort;

    const MANIFESTS: &str = include_str!("../../../deploy/knowledge-graph.yaml");

    fn shipped() -> Declarations {
        Declarations::from_yaml_str(MANIFESTS).expect("Should parse shipped manifests")
    }

    #[test]
    fn test_shipped_manifests_have_one_finding() {
        let findings = validate(&shipped());

        assert_eq!(
            findings,
            vec![Finding {
                resource: "Ingress/knowledge-graph-ingress".to_string(),
                issue: Issue::BackendPortNotExposed {
                    service: "knowledge-graph-service".to_string(),
                    port: "8000".to_string(),
                },
            }]
        );
        assert_eq!(
            findings[0].to_string(),
            "Ingress/knowledge-graph-ingress: backend port 8000 is not exposed by service 'knowledge-graph-service'"
        );
    }

    #[test]
    fn test_corrected_manifests_are_clean() {
        let mut decl = shipped();
        decl.routes[0].backend_port = BackendPort::Number(80);
        assert!(validate(&decl).is_empty());
    }

    #[test]
    fn test_selector_typo_is_reported() {
        let mut decl = shipped();
        decl.services[0].selector =
            crate::topology::labels::Selector::from_pairs([("app", "knowlege-graph")]);

        let findings = validate(&decl);
        assert!(findings.iter().any(|f| matches!(
            f.issue,
            Issue::ServiceSelectsNothing { .. }
        )));
    }

    #[test]
    fn test_target_port_not_exposed() {
        let mut decl = shipped();
        decl.services[0].ports[0].target_port =
            crate::apis::service::TargetPort::Number(9090);

        let findings = validate(&decl);
        assert!(findings.iter().any(|f| matches!(
            &f.issue,
            Issue::TargetPortNotExposed { port: 80, workload, .. } if workload == "knowledge-graph"
        )));
    }

    #[test]
    fn test_unknown_backend_service() {
        let mut decl = shipped();
        decl.routes[0].backend_service = "missing".to_string();

        let findings = validate(&decl);
        assert!(findings
            .iter()
            .any(|f| matches!(&f.issue, Issue::UnknownBackendService { service } if service == "missing")));
    }

    #[test]
    fn test_strict_mode_refuses_findings() {
        let err = enforce(&shipped(), true).expect_err("Strict mode should refuse");
        assert_eq!(err.findings.len(), 1);

        let findings = enforce(&shipped(), false).expect("Lenient mode should load");
        assert_eq!(findings.len(), 1);
    }
}
