use anyhow::{Context, Result};
use kgroute::apis::manifests::Declarations;
use kgroute::apis::pod_watcher::watch_pods;
use kgroute::config::ControllerConfig;
use kgroute::error::KgRouteError;
use kgroute::proxy::server::{AdminServer, ProxyServer};
use kgroute::topology::dispatch::Dispatcher;
use kgroute::topology::health::HealthChecker;
use kgroute::topology::instance::{simulate_instances, InstanceRegistry};
use kgroute::topology::reconciler::Reconciler;
use kgroute::topology::snapshot::SnapshotStore;
use kgroute::topology::validation;
use std::sync::Arc;
use std::time::Duration;
use tokio::signal;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

#[cfg(not(target_env = "msvc"))]
#[global_allocator]
static GLOBAL: tikv_jemallocator::Jemalloc = tikv_jemallocator::Jemalloc;

/// kgroute - Ingress data path for the declared knowledge-graph topology
#[tokio::main]
async fn main() -> Result<()> {
    // Initialize rustls crypto provider (needed for Kubernetes TLS client)
    rustls::crypto::ring::default_provider()
        .install_default()
        .ok(); // Ignore error if already installed

    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let config = ControllerConfig::load().context("Failed to load configuration")?;

    let declarations = Declarations::load(&config.manifests_path).with_context(|| {
        format!("Failed to load manifests from {}", config.manifests_path.display())
    })?;
    info!(
        manifests = %config.manifests_path.display(),
        workloads = declarations.workloads.len(),
        services = declarations.services.len(),
        routes = declarations.routes.len(),
        "Loaded declarations"
    );

    if config.validate_only {
        let findings = validation::validate(&declarations);
        for finding in &findings {
            println!("{}", finding);
        }
        println!("{} finding(s)", findings.len());
        if config.validation.strict && !findings.is_empty() {
            std::process::exit(1);
        }
        return Ok(());
    }

    validation::enforce(&declarations, config.validation.strict)?;

    let registry = Arc::new(InstanceRegistry::new());
    let store = Arc::new(SnapshotStore::new());
    let mut handles = vec![];

    if config.k8s_mode {
        info!(namespace = %config.namespace, "Kubernetes mode - watching Pods");
        let client = kube::Client::try_default()
            .await
            .map_err(KgRouteError::Kubernetes)?;
        let pod_registry = Arc::clone(&registry);
        let namespace = config.namespace.clone();
        handles.push(tokio::spawn(async move {
            if let Err(e) = watch_pods(client, &namespace, pod_registry).await {
                error!("Pod watcher error: {}", e);
            }
        }));
    } else {
        let instances = simulate_instances(&declarations.workloads, &config.simulation);
        info!(
            instances = instances.len(),
            ready = config.simulation.ready,
            "Standalone mode - simulating instances"
        );
        for instance in instances {
            registry.upsert(instance);
        }
    }

    let reconciler = Arc::new(Reconciler::new(
        declarations,
        Arc::clone(&registry),
        Arc::clone(&store),
        Duration::from_secs(config.reconcile.interval_secs.max(1)),
    ));
    reconciler.reconcile_once();
    handles.push(tokio::spawn(Arc::clone(&reconciler).run()));

    if config.health_check.enabled {
        let checker = Arc::new(HealthChecker::tcp(
            config.health_check.clone(),
            Arc::clone(&registry),
        ));
        handles.push(tokio::spawn(checker.run()));
    } else if config.k8s_mode {
        warn!("Active health checking disabled; relying on Pod readiness");
    }

    let dispatcher = Arc::new(Dispatcher::new(
        store,
        config.load_balancing,
        config.timeouts.backend_timeout(),
    ));
    let server = ProxyServer::new(config.bind_addr.clone(), dispatcher)
        .with_max_body_bytes(config.max_body_bytes);

    let admin = AdminServer::new(config.metrics_addr.clone());
    handles.push(tokio::spawn(async move {
        if let Err(e) = admin.serve().await {
            error!("Admin server error: {}", e);
        }
    }));

    info!(
        bind_addr = %config.bind_addr,
        metrics_addr = %config.metrics_addr,
        policy = %config.load_balancing,
        backend_timeout_ms = config.timeouts.backend_timeout_ms,
        "Starting Ingress data path"
    );
    info!("Press Ctrl-C to exit.");

    tokio::select! {
        result = server.serve() => {
            if let Err(e) = result {
                error!("Server error: {}", e);
            }
        }
        _ = signal::ctrl_c() => {
            info!("Shutdown signal received");
        }
    }

    for handle in handles {
        handle.abort();
    }

    Ok(())
}
