//! Service → ServiceRecord conversion

use crate::apis::ingress::BackendPort;
use crate::apis::workload::{ContainerPort, Protocol};
use crate::error::ManifestError;
use crate::topology::labels::Selector;
use k8s_openapi::api::core::v1::Service;
use k8s_openapi::apimachinery::pkg::util::intstr::IntOrString;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// `spec.type` of a Service
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum ServiceType {
    #[default]
    ClusterIP,
    NodePort,
    LoadBalancer,
    ExternalName,
}

impl FromStr for ServiceType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "ClusterIP" => Ok(ServiceType::ClusterIP),
            "NodePort" => Ok(ServiceType::NodePort),
            "LoadBalancer" => Ok(ServiceType::LoadBalancer),
            "ExternalName" => Ok(ServiceType::ExternalName),
            other => Err(format!("unknown service type '{}'", other)),
        }
    }
}

/// `targetPort`: a container port number or a container port name
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum TargetPort {
    Number(u16),
    Named(String),
}

impl TargetPort {
    /// Container port on `ports` this target resolves to
    pub fn resolve(&self, ports: &[ContainerPort]) -> Option<u16> {
        match self {
            TargetPort::Number(n) => ports.iter().find(|p| p.number == *n).map(|p| p.number),
            TargetPort::Named(name) => ports
                .iter()
                .find(|p| p.name.as_deref() == Some(name.as_str()))
                .map(|p| p.number),
        }
    }
}

impl fmt::Display for TargetPort {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TargetPort::Number(n) => write!(f, "{}", n),
            TargetPort::Named(name) => f.write_str(name),
        }
    }
}

/// One entry of `spec.ports`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServicePortSpec {
    pub name: Option<String>,
    pub port: u16,
    pub target_port: TargetPort,
    pub protocol: Protocol,
}

/// Stable virtual endpoint for a label-selected instance set
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServiceRecord {
    pub name: String,
    pub namespace: String,
    pub service_type: ServiceType,
    pub selector: Selector,
    pub ports: Vec<ServicePortSpec>,
}

impl ServiceRecord {
    /// Service port a route backend refers to, by number or by name
    pub fn port(&self, backend: &BackendPort) -> Option<&ServicePortSpec> {
        match backend {
            BackendPort::Number(n) => self.ports.iter().find(|p| p.port == *n),
            BackendPort::Name(name) => self
                .ports
                .iter()
                .find(|p| p.name.as_deref() == Some(name.as_str())),
        }
    }
}

impl TryFrom<&Service> for ServiceRecord {
    type Error = ManifestError;

    fn try_from(service: &Service) -> Result<Self, Self::Error> {
        let name = service
            .metadata
            .name
            .clone()
            .ok_or_else(|| ManifestError::invalid("Service", "<unnamed>", "missing metadata.name"))?;
        let namespace = service
            .metadata
            .namespace
            .clone()
            .unwrap_or_else(|| "default".to_string());

        let spec = service
            .spec
            .as_ref()
            .ok_or_else(|| ManifestError::invalid("Service", &name, "missing spec"))?;

        let service_type = spec
            .type_
            .as_deref()
            .map(ServiceType::from_str)
            .transpose()
            .map_err(|e| ManifestError::invalid("Service", &name, e))?
            .unwrap_or_default();

        let selector = Selector::new(spec.selector.clone().unwrap_or_default());

        let mut ports = Vec::new();
        for p in spec.ports.iter().flatten() {
            let port = u16::try_from(p.port).map_err(|_| {
                ManifestError::invalid("Service", &name, format!("port {} out of range", p.port))
            })?;
            // An absent targetPort defaults to the service port
            let target_port = match &p.target_port {
                Some(IntOrString::Int(n)) => TargetPort::Number(u16::try_from(*n).map_err(|_| {
                    ManifestError::invalid("Service", &name, format!("targetPort {} out of range", n))
                })?),
                Some(IntOrString::String(s)) => match s.parse::<u16>() {
                    Ok(n) => TargetPort::Number(n),
                    Err(_) => TargetPort::Named(s.clone()),
                },
                None => TargetPort::Number(port),
            };
            let protocol = p
                .protocol
                .as_deref()
                .map(Protocol::from_str)
                .transpose()
                .map_err(|e| ManifestError::invalid("Service", &name, e))?
                .unwrap_or_default();

            ports.push(ServicePortSpec {
                name: p.name.clone(),
                port,
                target_port,
                protocol,
            });
        }

        Ok(Self {
            name,
            namespace,
            service_type,
            selector,
            ports,
        })
    }
}
