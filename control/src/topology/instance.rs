//! Running instances and the registry they are reported into
//!
//! The registry is the only mutable topology state. Instance sources (the
//! simulator, the Pod watcher, the health checker) write into it; the
//! reconciler reads it when rebuilding the snapshot.

use crate::apis::workload::{ContainerPort, WorkloadSpec};
use crate::config::SimulationConfig;
use crate::topology::labels::Labels;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::net::{IpAddr, Ipv4Addr};
use std::sync::{Arc, RwLock};
use tokio::sync::Notify;
use tracing::debug;

/// One running copy of a workload
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Instance {
    pub name: String,
    /// Owning workload, when known
    pub workload: Option<String>,
    pub addr: IpAddr,
    pub labels: Labels,
    pub ports: Vec<ContainerPort>,
    pub ready: bool,
}

impl Instance {
    /// Whether this instance exposes container port `number`
    pub fn exposes(&self, number: u16) -> bool {
        self.ports.iter().any(|p| p.number == number)
    }
}

/// Instance set keyed by name
#[derive(Debug, Default)]
pub struct InstanceRegistry {
    instances: RwLock<BTreeMap<String, Instance>>,
    changed: Arc<Notify>,
}

impl InstanceRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Seed a registry from a list of instances
    pub fn with_instances(instances: impl IntoIterator<Item = Instance>) -> Self {
        let registry = Self::new();
        {
            let mut map = registry.write();
            for instance in instances {
                map.insert(instance.name.clone(), instance);
            }
        }
        registry
    }

    /// Insert or replace an instance; returns true when the registry changed
    pub fn upsert(&self, instance: Instance) -> bool {
        let changed = {
            let mut map = self.write();
            match map.get(&instance.name) {
                Some(existing) if *existing == instance => false,
                _ => {
                    debug!(instance = %instance.name, ready = instance.ready, "Instance updated");
                    map.insert(instance.name.clone(), instance);
                    true
                }
            }
        };
        if changed {
            self.changed.notify_one();
        }
        changed
    }

    pub fn remove(&self, name: &str) -> Option<Instance> {
        let removed = self.write().remove(name);
        if removed.is_some() {
            debug!(instance = %name, "Instance removed");
            self.changed.notify_one();
        }
        removed
    }

    /// Flip readiness; returns true when the flag actually changed
    pub fn set_ready(&self, name: &str, ready: bool) -> bool {
        let changed = {
            let mut map = self.write();
            match map.get_mut(name) {
                Some(instance) if instance.ready != ready => {
                    instance.ready = ready;
                    true
                }
                _ => false,
            }
        };
        if changed {
            self.changed.notify_one();
        }
        changed
    }

    pub fn get(&self, name: &str) -> Option<Instance> {
        self.read().get(name).cloned()
    }

    /// All instances, ordered by name
    pub fn list(&self) -> Vec<Instance> {
        self.read().values().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.read().is_empty()
    }

    /// Handle woken whenever the registry changes
    pub fn changed(&self) -> Arc<Notify> {
        Arc::clone(&self.changed)
    }

    fn read(&self) -> std::sync::RwLockReadGuard<'_, BTreeMap<String, Instance>> {
        self.instances.read().unwrap_or_else(|e| e.into_inner())
    }

    fn write(&self) -> std::sync::RwLockWriteGuard<'_, BTreeMap<String, Instance>> {
        self.instances.write().unwrap_or_else(|e| e.into_inner())
    }
}

/// Materialize `replicas` instances for every workload
///
/// Instances carry the pod template labels and container ports. Addresses
/// are assigned sequentially from `config.address_base + config.first_host`.
pub fn simulate_instances(workloads: &[WorkloadSpec], config: &SimulationConfig) -> Vec<Instance> {
    let base = u32::from(config.address_base);
    let mut host = config.first_host;
    let mut instances = Vec::new();

    for workload in workloads {
        let ports: Vec<ContainerPort> = workload.container_ports().cloned().collect();
        for replica in 0..workload.replicas {
            instances.push(Instance {
                name: format!("{}-{}", workload.name, replica),
                workload: Some(workload.name.clone()),
                addr: IpAddr::V4(Ipv4Addr::from(base.wrapping_add(host))),
                labels: workload.labels.clone(),
                ports: ports.clone(),
                ready: config.ready,
            });
            host += 1;
        }
    }

    instances
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::apis::workload::ContainerSpec;
    use crate::topology::labels::Selector;

    fn workload(replicas: u32) -> WorkloadSpec {
        let labels: Labels = [("app".to_string(), "knowledge-graph".to_string())].into();
        WorkloadSpec {
            name: "knowledge-graph".to_string(),
            namespace: "default".to_string(),
            replicas,
            selector: Selector::new(labels.clone()),
            labels,
            containers: vec![ContainerSpec {
                name: "knowledge-graph".to_string(),
                image: "knowledge-graph:latest".to_string(),
                ports: vec![ContainerPort::tcp(8080)],
            }],
        }
    }

    fn instance(name: &str, ready: bool) -> Instance {
        Instance {
            name: name.to_string(),
            workload: None,
            addr: IpAddr::V4(Ipv4Addr::new(10, 244, 0, 10)),
            labels: Labels::new(),
            ports: vec![ContainerPort::tcp(8080)],
            ready,
        }
    }

    #[test]
    fn test_simulated_addresses_and_names() {
        let instances = simulate_instances(&[workload(2)], &SimulationConfig::default());

        assert_eq!(instances.len(), 2);
        assert_eq!(instances[0].name, "knowledge-graph-0");
        assert_eq!(instances[0].addr, IpAddr::V4(Ipv4Addr::new(10, 244, 0, 10)));
        assert_eq!(instances[1].addr, IpAddr::V4(Ipv4Addr::new(10, 244, 0, 11)));
        assert!(instances.iter().all(|i| i.ready && i.exposes(8080)));
    }

    #[test]
    fn test_zero_replicas_yield_no_instances() {
        assert!(simulate_instances(&[workload(0)], &SimulationConfig::default()).is_empty());
    }

    #[test]
    fn test_upsert_is_idempotent() {
        let registry = InstanceRegistry::new();
        assert!(registry.upsert(instance("a", true)));
        assert!(!registry.upsert(instance("a", true)), "Same instance should not count as a change");
        assert!(registry.upsert(instance("a", false)));
        assert_eq!(registry.len(), 1);
    }

    #[test]
    fn test_set_ready_reports_transitions() {
        let registry = InstanceRegistry::with_instances([instance("a", true)]);

        assert!(registry.set_ready("a", false));
        assert!(!registry.set_ready("a", false));
        assert!(!registry.set_ready("missing", true));
        assert_eq!(registry.get("a").map(|i| i.ready), Some(false));
    }

    #[tokio::test]
    async fn test_change_notification() {
        let registry = InstanceRegistry::new();
        let changed = registry.changed();

        registry.upsert(instance("a", true));

        // notify_one stores a permit, so the wait completes immediately
        tokio::time::timeout(std::time::Duration::from_millis(100), changed.notified())
            .await
            .expect("Should be notified of the change");
    }
}
