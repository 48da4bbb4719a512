//! Declared resources: manifest loading and Kubernetes conversions
//!
//! Converts `apps/v1 Deployment`, `v1 Service` and `networking.k8s.io/v1
//! Ingress` objects into the typed declaration model, and watches Pods in
//! Kubernetes mode.

pub mod ingress;
pub mod manifests;
pub mod pod_watcher;
pub mod service;
pub mod workload;
