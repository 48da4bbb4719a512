//! Multi-document manifest loading
//!
//! Reads the Deployment, Service and Ingress documents of a YAML stream into
//! the typed declaration set. Documents of other kinds are skipped.

use crate::apis::ingress::{rules_from_ingress, RouteRule};
use crate::apis::service::ServiceRecord;
use crate::apis::workload::WorkloadSpec;
use crate::error::ManifestError;
use crate::topology::validation::{self, Finding};
use k8s_openapi::api::apps::v1::Deployment;
use k8s_openapi::api::core::v1::Service;
use k8s_openapi::api::networking::v1::Ingress;
use serde::Deserialize;
use std::path::Path;
use tracing::{debug, warn};

/// The declared resource set
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Declarations {
    pub workloads: Vec<WorkloadSpec>,
    pub services: Vec<ServiceRecord>,
    /// All route rules, in declaration order
    pub routes: Vec<RouteRule>,
}

impl Declarations {
    /// Parse a multi-document YAML stream
    pub fn from_yaml_str(raw: &str) -> Result<Self, ManifestError> {
        let mut declarations = Declarations::default();

        for document in serde_yaml::Deserializer::from_str(raw) {
            let value = serde_yaml::Value::deserialize(document)?;
            if value.is_null() {
                continue;
            }

            let kind = value
                .get("kind")
                .and_then(|k| k.as_str())
                .unwrap_or_default()
                .to_string();

            match kind.as_str() {
                "Deployment" => {
                    let deployment: Deployment = serde_yaml::from_value(value)?;
                    declarations
                        .workloads
                        .push(WorkloadSpec::try_from(&deployment)?);
                }
                "Service" => {
                    let service: Service = serde_yaml::from_value(value)?;
                    declarations
                        .services
                        .push(ServiceRecord::try_from(&service)?);
                }
                "Ingress" => {
                    let ingress: Ingress = serde_yaml::from_value(value)?;
                    let rules = rules_from_ingress(&ingress, declarations.routes.len())?;
                    declarations.routes.extend(rules);
                }
                other => {
                    warn!(kind = %other, "Skipping manifest document of unsupported kind");
                }
            }
        }

        debug!(
            workloads = declarations.workloads.len(),
            services = declarations.services.len(),
            routes = declarations.routes.len(),
            "Parsed manifests"
        );

        Ok(declarations)
    }

    /// Read and parse a manifest file
    pub fn load(path: &Path) -> Result<Self, ManifestError> {
        let raw = std::fs::read_to_string(path).map_err(|source| ManifestError::Io {
            path: path.display().to_string(),
            source,
        })?;
        Self::from_yaml_str(&raw)
    }

    pub fn service(&self, name: &str) -> Option<&ServiceRecord> {
        self.services.iter().find(|s| s.name == name)
    }

    pub fn workload(&self, name: &str) -> Option<&WorkloadSpec> {
        self.workloads.iter().find(|w| w.name == name)
    }

    /// Consistency findings across the declared resources
    pub fn validate(&self) -> Vec<Finding> {
        validation::validate(self)
    }
}
