//! Pod watcher for Kubernetes mode
//!
//! Watches Pods in one namespace and mirrors them into the instance
//! registry. A Pod counts as ready when its `Ready` condition is `True` and
//! it has been assigned an IP.

use crate::apis::workload::container_spec;
use crate::error::KgRouteError;
use crate::topology::instance::{Instance, InstanceRegistry};
use futures::StreamExt;
use k8s_openapi::api::core::v1::Pod;
use kube::runtime::watcher;
use kube::runtime::watcher::Config as WatcherConfig;
use kube::{api::Api, Client, ResourceExt};
use std::collections::HashSet;
use std::net::IpAddr;
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Watch Pods in `namespace` and keep `registry` in sync
pub async fn watch_pods(
    client: Client,
    namespace: &str,
    registry: Arc<InstanceRegistry>,
) -> Result<(), KgRouteError> {
    let api: Api<Pod> = Api::namespaced(client, namespace);
    let watcher = watcher(api, WatcherConfig::default());
    let mut sync = PodSync::new(registry);

    futures::pin_mut!(watcher);

    info!(namespace = %namespace, "Starting Pod watcher");

    while let Some(event) = watcher.next().await {
        match event {
            Ok(event) => sync.apply(event),
            Err(e) => {
                warn!("Pod watcher error: {}", e);
            }
        }
    }

    Ok(())
}

/// Applies watcher events to the registry
///
/// A relist (`Init`, `InitApply`..., `InitDone`) replaces the registry
/// contents: Pods deleted while the watch was down are pruned on `InitDone`.
pub struct PodSync {
    registry: Arc<InstanceRegistry>,
    relisted: Option<HashSet<String>>,
}

impl PodSync {
    pub fn new(registry: Arc<InstanceRegistry>) -> Self {
        Self {
            registry,
            relisted: None,
        }
    }

    pub fn apply(&mut self, event: watcher::Event<Pod>) {
        match event {
            watcher::Event::Apply(pod) => self.apply_pod(&pod),
            watcher::Event::InitApply(pod) => {
                if let Some(seen) = self.relisted.as_mut() {
                    seen.insert(pod.name_any());
                }
                self.apply_pod(&pod);
            }
            watcher::Event::Delete(pod) => {
                debug!(pod = %pod.name_any(), "Pod deleted");
                self.registry.remove(&pod.name_any());
            }
            watcher::Event::Init => {
                debug!("Pod watcher relisting");
                self.relisted = Some(HashSet::new());
            }
            watcher::Event::InitDone => {
                let seen = self.relisted.take().unwrap_or_default();
                let mut pruned = 0;
                for instance in self.registry.list() {
                    if !seen.contains(&instance.name) && self.registry.remove(&instance.name).is_some() {
                        pruned += 1;
                    }
                }
                info!(
                    instances = self.registry.len(),
                    pruned,
                    "Pod watcher initial sync complete"
                );
            }
        }
    }

    fn apply_pod(&self, pod: &Pod) {
        match instance_from_pod(pod) {
            Some(instance) => {
                self.registry.upsert(instance);
            }
            None => {
                // No IP yet, or no usable spec; forget any earlier state
                debug!(pod = %pod.name_any(), "Pod not routable yet");
                self.registry.remove(&pod.name_any());
            }
        }
    }
}

/// Registry view of a Pod, `None` while it has no address
pub fn instance_from_pod(pod: &Pod) -> Option<Instance> {
    let name = pod.name_any();
    let status = pod.status.as_ref()?;
    let addr: IpAddr = match status.pod_ip.as_deref()?.parse() {
        Ok(addr) => addr,
        Err(e) => {
            warn!(pod = %name, "Unparseable pod IP: {}", e);
            return None;
        }
    };

    let ready = status
        .conditions
        .iter()
        .flatten()
        .any(|c| c.type_ == "Ready" && c.status == "True");

    let ports = pod
        .spec
        .as_ref()
        .map(|spec| {
            spec.containers
                .iter()
                .filter_map(|c| match container_spec("Pod", &name, c) {
                    Ok(spec) => Some(spec.ports),
                    Err(e) => {
                        warn!(pod = %name, "Skipping container ports: {}", e);
                        None
                    }
                })
                .flatten()
                .collect()
        })
        .unwrap_or_default();

    let workload = pod
        .metadata
        .owner_references
        .iter()
        .flatten()
        .find(|o| o.controller == Some(true))
        .map(|o| o.name.clone());

    Some(Instance {
        name,
        workload,
        addr,
        labels: pod.labels().clone(),
        ports,
        ready,
    })
}
