//! Immutable topology snapshots and the store that publishes them
//!
//! A snapshot freezes declarations, instances, the compiled route table and
//! per-Service membership. Readers clone the current `Arc<Snapshot>` and
//! never observe a partially applied update.

use crate::apis::manifests::Declarations;
use crate::apis::service::ServiceRecord;
use crate::proxy::metrics::{READY_MEMBERS, SNAPSHOT_GENERATION};
use crate::topology::instance::Instance;
use crate::topology::matcher::RouteTable;
use crate::topology::resolver::{resolve, MemberSet};
use std::collections::HashMap;
use std::sync::{Arc, Mutex, RwLock};
use tracing::info;

/// One Service with its frozen member list
#[derive(Debug)]
pub struct ServiceEntry {
    pub record: ServiceRecord,
    pub members: MemberSet,
}

/// Point-in-time view of the routing topology
#[derive(Debug)]
pub struct Snapshot {
    generation: u64,
    declarations: Arc<Declarations>,
    instances: Vec<Instance>,
    routes: RouteTable,
    services: HashMap<String, ServiceEntry>,
}

impl Snapshot {
    /// Generation 0: nothing declared, nothing routable
    pub fn empty() -> Self {
        Self::build(0, Arc::new(Declarations::default()), Vec::new())
    }

    /// Compile declarations and instances into a snapshot
    pub fn build(generation: u64, declarations: Arc<Declarations>, mut instances: Vec<Instance>) -> Self {
        instances.sort_by(|a, b| a.name.cmp(&b.name));

        let services = declarations
            .services
            .iter()
            .map(|record| {
                let members = MemberSet::new(resolve(&instances, &record.selector));
                (
                    record.name.clone(),
                    ServiceEntry {
                        record: record.clone(),
                        members,
                    },
                )
            })
            .collect();

        Self {
            generation,
            routes: RouteTable::new(&declarations.routes),
            declarations,
            instances,
            services,
        }
    }

    pub fn generation(&self) -> u64 {
        self.generation
    }

    pub fn declarations(&self) -> &Declarations {
        &self.declarations
    }

    pub fn instances(&self) -> &[Instance] {
        &self.instances
    }

    pub fn routes(&self) -> &RouteTable {
        &self.routes
    }

    pub fn service(&self, name: &str) -> Option<&ServiceEntry> {
        self.services.get(name)
    }

    /// Ready members of a Service, empty for an unknown name
    pub fn members(&self, service: &str) -> &[Instance] {
        self.services
            .get(service)
            .map(|entry| entry.members.members())
            .unwrap_or_default()
    }

    fn same_content(&self, declarations: &Declarations, instances: &[Instance]) -> bool {
        *self.declarations == *declarations && self.instances == instances
    }
}

/// Publisher of the current snapshot
#[derive(Debug)]
pub struct SnapshotStore {
    current: RwLock<Arc<Snapshot>>,
    /// Serializes publishers so generations stay strictly increasing
    publish_lock: Mutex<()>,
}

impl Default for SnapshotStore {
    fn default() -> Self {
        Self::new()
    }
}

impl SnapshotStore {
    pub fn new() -> Self {
        Self {
            current: RwLock::new(Arc::new(Snapshot::empty())),
            publish_lock: Mutex::new(()),
        }
    }

    /// Current snapshot
    pub fn load(&self) -> Arc<Snapshot> {
        let current = self.current.read().unwrap_or_else(|e| e.into_inner());
        Arc::clone(&current)
    }

    pub fn generation(&self) -> u64 {
        self.load().generation
    }

    /// Publish a snapshot built from `declarations` and `instances`
    ///
    /// Returns the new generation, or `None` when the content is identical
    /// to the current snapshot and nothing was published.
    pub fn publish(&self, declarations: Arc<Declarations>, mut instances: Vec<Instance>) -> Option<u64> {
        let _guard = self.publish_lock.lock().unwrap_or_else(|e| e.into_inner());

        instances.sort_by(|a, b| a.name.cmp(&b.name));
        let previous = self.load();
        if previous.same_content(&declarations, &instances) {
            return None;
        }

        let generation = previous.generation + 1;
        let snapshot = Arc::new(Snapshot::build(generation, declarations, instances));
        record_snapshot_metrics(&previous, &snapshot);

        {
            let mut current = self.current.write().unwrap_or_else(|e| e.into_inner());
            *current = Arc::clone(&snapshot);
        }

        info!(
            generation,
            services = snapshot.services.len(),
            instances = snapshot.instances.len(),
            "Published topology snapshot"
        );
        Some(generation)
    }
}

fn record_snapshot_metrics(previous: &Snapshot, next: &Snapshot) {
    SNAPSHOT_GENERATION.set(next.generation as i64);
    for name in previous.services.keys() {
        if !next.services.contains_key(name) {
            let _ = READY_MEMBERS.remove_label_values(&[name.as_str()]);
        }
    }
    for (name, entry) in &next.services {
        READY_MEMBERS
            .with_label_values(&[name.as_str()])
            .set(entry.members.len() as i64);
    }
}
