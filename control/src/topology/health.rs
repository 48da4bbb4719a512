//! Active Health Checking
//!
//! Probes instances periodically and flips their readiness in the registry
//! after consecutive failures or successes. Each flip triggers a snapshot
//! rebuild through the registry's change notification.

use crate::config::HealthCheckConfig;
use crate::error::ReconcileError;
use crate::proxy::metrics::HEALTH_TRANSITIONS_TOTAL;
use crate::topology::instance::{Instance, InstanceRegistry};
use async_trait::async_trait;
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::net::TcpStream;
use tokio::time::interval;
use tracing::{debug, info, warn};

/// A liveness check against one instance
#[async_trait]
pub trait Probe: Send + Sync {
    async fn probe(&self, instance: &Instance) -> Result<(), String>;
}

/// TCP connect to the instance's first container port
#[derive(Debug, Clone)]
pub struct TcpProbe {
    timeout: Duration,
}

impl TcpProbe {
    pub fn new(timeout: Duration) -> Self {
        Self { timeout }
    }
}

#[async_trait]
impl Probe for TcpProbe {
    async fn probe(&self, instance: &Instance) -> Result<(), String> {
        let port = instance
            .ports
            .first()
            .map(|p| p.number)
            .ok_or_else(|| "no container port to probe".to_string())?;
        let addr = SocketAddr::new(instance.addr, port);

        match tokio::time::timeout(self.timeout, TcpStream::connect(addr)).await {
            Ok(Ok(_stream)) => Ok(()),
            Ok(Err(e)) => Err(format!("connect to {} failed: {}", addr, e)),
            Err(_) => Err(format!(
                "connect to {} timed out after {}ms",
                addr,
                self.timeout.as_millis()
            )),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum HealthStatus {
    Healthy,
    Unhealthy,
}

#[derive(Debug, Clone)]
struct InstanceHealthState {
    status: HealthStatus,
    consecutive_successes: u32,
    consecutive_failures: u32,
}

impl InstanceHealthState {
    fn new(ready: bool) -> Self {
        Self {
            status: if ready {
                HealthStatus::Healthy
            } else {
                HealthStatus::Unhealthy
            },
            consecutive_successes: 0,
            consecutive_failures: 0,
        }
    }

    fn record_success(&mut self, config: &HealthCheckConfig) {
        self.consecutive_successes += 1;
        self.consecutive_failures = 0;
        if self.consecutive_successes >= config.healthy_threshold {
            self.status = HealthStatus::Healthy;
        }
    }

    fn record_failure(&mut self, config: &HealthCheckConfig) {
        self.consecutive_failures += 1;
        self.consecutive_successes = 0;
        if self.consecutive_failures >= config.unhealthy_threshold {
            self.status = HealthStatus::Unhealthy;
        }
    }
}

/// Probes every registered instance and drives its readiness
pub struct HealthChecker<P> {
    config: HealthCheckConfig,
    registry: Arc<InstanceRegistry>,
    probe: P,
    states: Mutex<HashMap<String, InstanceHealthState>>,
}

impl HealthChecker<TcpProbe> {
    /// Checker using TCP connect probes with the configured timeout
    pub fn tcp(config: HealthCheckConfig, registry: Arc<InstanceRegistry>) -> Self {
        let probe = TcpProbe::new(Duration::from_millis(config.timeout_ms));
        Self::new(config, registry, probe)
    }
}

impl<P: Probe> HealthChecker<P> {
    pub fn new(config: HealthCheckConfig, registry: Arc<InstanceRegistry>, probe: P) -> Self {
        Self {
            config,
            registry,
            probe,
            states: Mutex::new(HashMap::new()),
        }
    }

    /// Probe all instances once; returns the instances that went unhealthy
    pub async fn check_once(&self) -> Vec<ReconcileError> {
        let instances = self.registry.list();
        let mut unhealthy = Vec::new();

        self.lock_states()
            .retain(|name, _| instances.iter().any(|i| &i.name == name));

        for instance in &instances {
            let result = self.probe.probe(instance).await;

            let status = {
                let mut states = self.lock_states();
                let state = states
                    .entry(instance.name.clone())
                    .or_insert_with(|| InstanceHealthState::new(instance.ready));
                match &result {
                    Ok(()) => {
                        state.record_success(&self.config);
                        debug!(
                            instance = %instance.name,
                            consecutive_successes = state.consecutive_successes,
                            "Health check succeeded"
                        );
                    }
                    Err(reason) => {
                        state.record_failure(&self.config);
                        debug!(
                            instance = %instance.name,
                            consecutive_failures = state.consecutive_failures,
                            "Health check failed: {}", reason
                        );
                    }
                }
                state.status
            };

            // Compared with the registry flag each round; Pod watcher upserts can reset it
            let healthy = status == HealthStatus::Healthy;
            if instance.ready == healthy || !self.registry.set_ready(&instance.name, healthy) {
                continue;
            }

            HEALTH_TRANSITIONS_TOTAL
                .with_label_values(&[instance.name.as_str(), if healthy { "ready" } else { "unready" }])
                .inc();

            if healthy {
                info!(instance = %instance.name, "Instance recovered; marked ready");
            } else {
                let event = ReconcileError::InstanceUnhealthy {
                    instance: instance.name.clone(),
                    reason: result.err().unwrap_or_default(),
                };
                warn!(instance = %instance.name, "{}; marked unready", event);
                unhealthy.push(event);
            }
        }

        unhealthy
    }

    /// Probe on the configured interval until the task is dropped
    pub async fn run(self: Arc<Self>) {
        let mut timer = interval(Duration::from_secs(self.config.interval_secs.max(1)));
        info!(
            interval_secs = self.config.interval_secs,
            timeout_ms = self.config.timeout_ms,
            "Starting health checks"
        );
        loop {
            timer.tick().await;
            self.check_once().await;
        }
    }

    fn lock_states(&self) -> std::sync::MutexGuard<'_, HashMap<String, InstanceHealthState>> {
        self.states.lock().unwrap_or_else(|e| e.into_inner())
    }
}
