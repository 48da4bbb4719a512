//! Configuration for the kgroute controller
//!
//! Loaded from an optional JSON file (`KGROUTE_CONFIG`) and overridden by
//! `KGROUTE_*` environment variables.

use crate::error::KgRouteError;
use crate::topology::resolver::LoadBalancePolicy;
use serde::{Deserialize, Serialize};
use std::env;
use std::net::Ipv4Addr;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Controller configuration
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ControllerConfig {
    /// Multi-document YAML holding the Deployment, Service and Ingress
    #[serde(default = "default_manifests_path")]
    pub manifests_path: PathBuf,

    /// Listener address for the ingress data path
    #[serde(default = "default_bind_addr")]
    pub bind_addr: String,

    /// Admin listener for `/metrics` and `/healthz`, kept off the routed data path
    #[serde(default = "default_metrics_addr")]
    pub metrics_addr: String,

    /// Largest request body buffered for forwarding (default: 10 MiB)
    #[serde(default = "default_max_body_bytes")]
    pub max_body_bytes: usize,

    /// Watch Pods in a cluster instead of simulating instances
    #[serde(default = "default_false")]
    pub k8s_mode: bool,

    /// Namespace watched in Kubernetes mode
    #[serde(default = "default_namespace")]
    pub namespace: String,

    /// Member selection policy
    #[serde(default)]
    pub load_balancing: LoadBalancePolicy,

    /// Validate the manifests, report findings and exit
    #[serde(default = "default_false")]
    pub validate_only: bool,

    #[serde(default)]
    pub timeouts: TimeoutConfig,

    #[serde(default)]
    pub reconcile: ReconcileConfig,

    #[serde(default)]
    pub health_check: HealthCheckConfig,

    #[serde(default)]
    pub simulation: SimulationConfig,

    #[serde(default)]
    pub validation: ValidationConfig,
}

/// Bounded waits on the request path
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct TimeoutConfig {
    /// Upper bound for reaching a backend and reading its response (default: 5000ms)
    #[serde(default = "default_backend_timeout")]
    pub backend_timeout_ms: u64,
}

impl TimeoutConfig {
    pub fn backend_timeout(&self) -> Duration {
        Duration::from_millis(self.backend_timeout_ms)
    }
}

impl Default for TimeoutConfig {
    fn default() -> Self {
        Self {
            backend_timeout_ms: default_backend_timeout(),
        }
    }
}

/// Snapshot rebuild cadence
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ReconcileConfig {
    /// Periodic resync interval in seconds (default: 10s)
    #[serde(default = "default_reconcile_interval")]
    pub interval_secs: u64,
}

impl Default for ReconcileConfig {
    fn default() -> Self {
        Self {
            interval_secs: default_reconcile_interval(),
        }
    }
}

/// Active health checking of instances
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct HealthCheckConfig {
    /// Enable active health checking (default: false)
    #[serde(default = "default_false")]
    pub enabled: bool,

    /// Probe interval in seconds (default: 5s)
    #[serde(default = "default_health_check_interval")]
    pub interval_secs: u64,

    /// Probe timeout in milliseconds (default: 2000ms)
    #[serde(default = "default_health_check_timeout")]
    pub timeout_ms: u64,

    /// Consecutive failures before marking unready (default: 3)
    #[serde(default = "default_unhealthy_threshold")]
    pub unhealthy_threshold: u32,

    /// Consecutive successes before marking ready (default: 2)
    #[serde(default = "default_healthy_threshold")]
    pub healthy_threshold: u32,
}

impl Default for HealthCheckConfig {
    fn default() -> Self {
        Self {
            enabled: default_false(),
            interval_secs: default_health_check_interval(),
            timeout_ms: default_health_check_timeout(),
            unhealthy_threshold: default_unhealthy_threshold(),
            healthy_threshold: default_healthy_threshold(),
        }
    }
}

/// Standalone-mode instance simulation
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct SimulationConfig {
    /// Network the simulated instance addresses are drawn from
    #[serde(default = "default_address_base")]
    pub address_base: Ipv4Addr,

    /// Host index of the first simulated instance
    #[serde(default = "default_first_host")]
    pub first_host: u32,

    /// Whether simulated instances start ready
    #[serde(default = "default_true")]
    pub ready: bool,
}

impl Default for SimulationConfig {
    fn default() -> Self {
        Self {
            address_base: default_address_base(),
            first_host: default_first_host(),
            ready: default_true(),
        }
    }
}

/// Eager consistency checks
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct ValidationConfig {
    /// Refuse to start when any finding is reported (default: false)
    #[serde(default = "default_false")]
    pub strict: bool,
}

fn default_manifests_path() -> PathBuf {
    PathBuf::from("deploy/knowledge-graph.yaml")
}

fn default_bind_addr() -> String {
    "127.0.0.1:8080".to_string()
}

fn default_metrics_addr() -> String {
    "127.0.0.1:9090".to_string()
}

fn default_max_body_bytes() -> usize {
    10 * 1024 * 1024
}

fn default_namespace() -> String {
    "default".to_string()
}

fn default_false() -> bool {
    false
}

fn default_true() -> bool {
    true
}

fn default_backend_timeout() -> u64 {
    5000
}

fn default_reconcile_interval() -> u64 {
    10
}

fn default_health_check_interval() -> u64 {
    5
}

fn default_health_check_timeout() -> u64 {
    2000
}

fn default_unhealthy_threshold() -> u32 {
    3
}

fn default_healthy_threshold() -> u32 {
    2
}

fn default_address_base() -> Ipv4Addr {
    Ipv4Addr::new(10, 244, 0, 0)
}

fn default_first_host() -> u32 {
    10
}

impl Default for ControllerConfig {
    fn default() -> Self {
        Self {
            manifests_path: default_manifests_path(),
            bind_addr: default_bind_addr(),
            metrics_addr: default_metrics_addr(),
            max_body_bytes: default_max_body_bytes(),
            k8s_mode: default_false(),
            namespace: default_namespace(),
            load_balancing: LoadBalancePolicy::default(),
            validate_only: default_false(),
            timeouts: TimeoutConfig::default(),
            reconcile: ReconcileConfig::default(),
            health_check: HealthCheckConfig::default(),
            simulation: SimulationConfig::default(),
            validation: ValidationConfig::default(),
        }
    }
}

impl ControllerConfig {
    /// Read a JSON configuration file; missing sections take their defaults
    pub fn from_file(path: &Path) -> Result<Self, KgRouteError> {
        let raw = std::fs::read_to_string(path)?;
        serde_json::from_str(&raw)
            .map_err(|e| KgRouteError::Config(format!("{}: {}", path.display(), e)))
    }

    /// File from `KGROUTE_CONFIG` (if set), then environment overrides
    pub fn load() -> Result<Self, KgRouteError> {
        let base = match env::var("KGROUTE_CONFIG") {
            Ok(path) => Self::from_file(Path::new(&path))?,
            Err(_) => Self::default(),
        };
        base.with_env_overrides(|key| env::var(key).ok())
    }

    /// Apply `KGROUTE_*` overrides read through `lookup`
    pub fn with_env_overrides<F>(mut self, lookup: F) -> Result<Self, KgRouteError>
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(val) = lookup("KGROUTE_MANIFESTS") {
            self.manifests_path = PathBuf::from(val);
        }
        if let Some(val) = lookup("KGROUTE_BIND_ADDR") {
            self.bind_addr = val;
        }
        if let Some(val) = lookup("KGROUTE_METRICS_ADDR") {
            self.metrics_addr = val;
        }
        if let Some(val) = lookup("KGROUTE_K8S_MODE") {
            self.k8s_mode = parse_flag("KGROUTE_K8S_MODE", &val)?;
        }
        if let Some(val) = lookup("KGROUTE_NAMESPACE") {
            self.namespace = val;
        }
        if let Some(val) = lookup("KGROUTE_STRICT") {
            self.validation.strict = parse_flag("KGROUTE_STRICT", &val)?;
        }
        if let Some(val) = lookup("KGROUTE_VALIDATE_ONLY") {
            self.validate_only = parse_flag("KGROUTE_VALIDATE_ONLY", &val)?;
        }
        if let Some(val) = lookup("KGROUTE_LB_POLICY") {
            self.load_balancing = val.parse().map_err(KgRouteError::Config)?;
        }
        if let Some(val) = lookup("KGROUTE_BACKEND_TIMEOUT_MS") {
            self.timeouts.backend_timeout_ms = val.parse().map_err(|e| {
                KgRouteError::Config(format!("KGROUTE_BACKEND_TIMEOUT_MS '{}': {}", val, e))
            })?;
        }
        Ok(self)
    }
}

fn parse_flag(key: &str, value: &str) -> Result<bool, KgRouteError> {
    match value.to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Ok(true),
        "0" | "false" | "no" | "off" => Ok(false),
        other => Err(KgRouteError::Config(format!(
            "{} must be a boolean, got '{}'",
            key, other
        ))),
    }
}
