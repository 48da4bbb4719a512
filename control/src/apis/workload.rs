//! Deployment → WorkloadSpec conversion

use crate::error::ManifestError;
use crate::topology::labels::{Labels, Selector};
use k8s_openapi::api::apps::v1::Deployment;
use k8s_openapi::api::core::v1::Container;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Transport protocol of a declared port
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Protocol {
    #[default]
    TCP,
    UDP,
    SCTP,
}

impl FromStr for Protocol {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "TCP" => Ok(Protocol::TCP),
            "UDP" => Ok(Protocol::UDP),
            "SCTP" => Ok(Protocol::SCTP),
            other => Err(format!("unsupported protocol '{}'", other)),
        }
    }
}

impl fmt::Display for Protocol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Protocol::TCP => "TCP",
            Protocol::UDP => "UDP",
            Protocol::SCTP => "SCTP",
        };
        f.write_str(name)
    }
}

/// A port a container listens on
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ContainerPort {
    pub name: Option<String>,
    pub number: u16,
    pub protocol: Protocol,
}

impl ContainerPort {
    pub fn tcp(number: u16) -> Self {
        Self {
            name: None,
            number,
            protocol: Protocol::TCP,
        }
    }

    pub fn named(mut self, name: &str) -> Self {
        self.name = Some(name.to_string());
        self
    }
}

/// One container of the pod template
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ContainerSpec {
    pub name: String,
    pub image: String,
    pub ports: Vec<ContainerPort>,
}

/// Desired running state of a workload
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorkloadSpec {
    pub name: String,
    pub namespace: String,
    pub replicas: u32,
    /// `spec.selector.matchLabels`
    pub selector: Selector,
    /// `spec.template.metadata.labels`
    pub labels: Labels,
    pub containers: Vec<ContainerSpec>,
}

impl WorkloadSpec {
    /// Image of the first container
    pub fn image(&self) -> Option<&str> {
        self.containers.first().map(|c| c.image.as_str())
    }

    /// Every port exposed by any container of the template
    pub fn container_ports(&self) -> impl Iterator<Item = &ContainerPort> {
        self.containers.iter().flat_map(|c| c.ports.iter())
    }
}

impl TryFrom<&Deployment> for WorkloadSpec {
    type Error = ManifestError;

    fn try_from(deployment: &Deployment) -> Result<Self, Self::Error> {
        let name = deployment
            .metadata
            .name
            .clone()
            .ok_or_else(|| ManifestError::invalid("Deployment", "<unnamed>", "missing metadata.name"))?;
        let namespace = deployment
            .metadata
            .namespace
            .clone()
            .unwrap_or_else(|| "default".to_string());

        let spec = deployment
            .spec
            .as_ref()
            .ok_or_else(|| ManifestError::invalid("Deployment", &name, "missing spec"))?;

        // Kubernetes defaults an absent replica count to 1
        let replicas = spec.replicas.unwrap_or(1);
        let replicas = u32::try_from(replicas).map_err(|_| {
            ManifestError::invalid(
                "Deployment",
                &name,
                format!("replicas must be >= 0, got {}", replicas),
            )
        })?;

        let selector = Selector::new(spec.selector.match_labels.clone().unwrap_or_default());
        let labels = spec
            .template
            .metadata
            .as_ref()
            .and_then(|m| m.labels.clone())
            .unwrap_or_default();

        let containers = spec
            .template
            .spec
            .as_ref()
            .map(|pod| {
                pod.containers
                    .iter()
                    .map(|c| container_spec("Deployment", &name, c))
                    .collect::<Result<Vec<_>, _>>()
            })
            .transpose()?
            .unwrap_or_default();

        Ok(Self {
            name,
            namespace,
            replicas,
            selector,
            labels,
            containers,
        })
    }
}

/// Convert a k8s container, attributing errors to `kind`/`owner`
pub(crate) fn container_spec(
    kind: &'static str,
    owner: &str,
    container: &Container,
) -> Result<ContainerSpec, ManifestError> {
    let ports = container
        .ports
        .iter()
        .flatten()
        .map(|p| {
            let number = u16::try_from(p.container_port).map_err(|_| {
                ManifestError::invalid(
                    kind,
                    owner,
                    format!("containerPort {} out of range", p.container_port),
                )
            })?;
            let protocol = p
                .protocol
                .as_deref()
                .map(Protocol::from_str)
                .transpose()
                .map_err(|e| ManifestError::invalid(kind, owner, e))?
                .unwrap_or_default();
            Ok(ContainerPort {
                name: p.name.clone(),
                number,
                protocol,
            })
        })
        .collect::<Result<Vec<_>, ManifestError>>()?;

    Ok(ContainerSpec {
        name: container.name.clone(),
        image: container.image.clone().unwrap_or_default(),
        ports,
    })
}
