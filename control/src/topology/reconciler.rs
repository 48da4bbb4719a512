//! Reconciler - rebuilds the snapshot from declarations and instances
//!
//! Runs as an independent task woken by a periodic tick or by a registry
//! change. Identical rebuilds publish nothing.

use crate::apis::manifests::Declarations;
use crate::topology::instance::InstanceRegistry;
use crate::topology::snapshot::SnapshotStore;
use std::sync::{Arc, RwLock};
use std::time::Duration;
use tokio::time::interval;
use tracing::{debug, info};

pub struct Reconciler {
    declarations: RwLock<Arc<Declarations>>,
    registry: Arc<InstanceRegistry>,
    store: Arc<SnapshotStore>,
    interval: Duration,
}

impl Reconciler {
    pub fn new(
        declarations: Declarations,
        registry: Arc<InstanceRegistry>,
        store: Arc<SnapshotStore>,
        interval: Duration,
    ) -> Self {
        Self {
            declarations: RwLock::new(Arc::new(declarations)),
            registry,
            store,
            interval,
        }
    }

    pub fn declarations(&self) -> Arc<Declarations> {
        let current = self.declarations.read().unwrap_or_else(|e| e.into_inner());
        Arc::clone(&current)
    }

    pub fn store(&self) -> &Arc<SnapshotStore> {
        &self.store
    }

    /// Replace the declaration set and publish the result
    pub fn declare(&self, declarations: Declarations) -> Option<u64> {
        {
            let mut current = self.declarations.write().unwrap_or_else(|e| e.into_inner());
            *current = Arc::new(declarations);
        }
        self.reconcile_once()
    }

    /// Rebuild and publish; `None` when nothing changed
    pub fn reconcile_once(&self) -> Option<u64> {
        let generation = self
            .store
            .publish(self.declarations(), self.registry.list());
        match generation {
            Some(generation) => debug!(generation, "Reconciled topology"),
            None => debug!("Topology unchanged"),
        }
        generation
    }

    /// Reconcile on every tick and on every registry change
    pub async fn run(self: Arc<Self>) {
        let changed = self.registry.changed();
        let mut ticker = interval(self.interval);

        info!(interval_secs = self.interval.as_secs(), "Starting reconciler");

        loop {
            tokio::select! {
                _ = ticker.tick() => {}
                _ = changed.notified() => {
                    debug!("Instance registry changed");
                }
            }
            self.reconcile_once();
        }
    }
}
