//! Percona DBaaS control plane
//!
//! Main entry point. Wires the store, client registry, version service and
//! monitoring credentials together, registers clusters found in the
//! kubeconfig directory and runs the inventory synchronizer.

use std::path::Path;
use std::sync::Arc;

use tokio::signal;
use tracing::{error, info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use dbaas_controlplane::{
    adapters::KubeClientFactory,
    config::Config,
    metrics,
    monitoring::GrafanaCredentials,
    reconcilers::DbClusterSynchronizer,
    registry::ClientRegistry,
    services::{Context, KubernetesService, RegisterRequest},
    store::MemoryStore,
    version::VersionServiceClient,
};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    init_tracing();

    info!(version = env!("CARGO_PKG_VERSION"), "Starting DBaaS control plane");

    let config = Config::from_env()?;
    config.log();

    let store = Arc::new(MemoryStore::new());
    let registry = Arc::new(ClientRegistry::new(store.clone(), Arc::new(KubeClientFactory)));
    let versions = Arc::new(VersionServiceClient::new(config.version_service_url.clone())?);
    let credentials = Arc::new(GrafanaCredentials::new(
        config.grafana_url.clone(),
        config.grafana_auth.clone(),
    )?);

    let metrics_port = config.metrics_port;
    let kubeconfig_dir = config.kubeconfig_dir.clone();
    let context = Arc::new(Context::new(config, store, registry, versions, credentials));

    let metrics_handle = tokio::spawn(metrics::serve(metrics_port));
    info!("Metrics server starting on port {}", metrics_port);

    if let Some(dir) = kubeconfig_dir {
        register_from_dir(&KubernetesService::new(context.clone()), &dir).await;
    }

    let synchronizer = DbClusterSynchronizer::new(context.clone());
    let sync_loop = synchronizer.run(context.launcher.token());
    metrics::set_ready(true);

    tokio::select! {
        _ = sync_loop => {
            error!("Inventory synchronizer exited unexpectedly");
        }
        _ = metrics_handle => {
            error!("Metrics server exited unexpectedly");
        }
        _ = shutdown_signal() => {
            info!("Received shutdown signal, stopping control plane");
        }
    }

    metrics::set_ready(false);
    context.launcher.shutdown().await;
    info!("DBaaS control plane stopped");
    Ok(())
}

/// Register every `*.yaml` kubeconfig in `dir` under its file stem
async fn register_from_dir(service: &KubernetesService, dir: &Path) {
    let mut entries = match tokio::fs::read_dir(dir).await {
        Ok(entries) => entries,
        Err(e) => {
            warn!(dir = %dir.display(), error = %e, "Cannot read kubeconfig directory");
            return;
        }
    };

    loop {
        let entry = match entries.next_entry().await {
            Ok(Some(entry)) => entry,
            Ok(None) => break,
            Err(e) => {
                warn!(dir = %dir.display(), error = %e, "Cannot list kubeconfig directory");
                break;
            }
        };
        let path = entry.path();
        let is_yaml = path
            .extension()
            .map(|ext| ext == "yaml" || ext == "yml")
            .unwrap_or(false);
        let Some(name) = path.file_stem().and_then(|s| s.to_str()).filter(|_| is_yaml) else {
            continue;
        };

        let kubeconfig = match tokio::fs::read_to_string(&path).await {
            Ok(kubeconfig) => kubeconfig,
            Err(e) => {
                warn!(path = %path.display(), error = %e, "Cannot read kubeconfig");
                continue;
            }
        };
        match service.register_cluster(RegisterRequest::new(name, kubeconfig)).await {
            Ok(()) => info!(cluster = %name, "Registered cluster from kubeconfig directory"),
            Err(e @ dbaas_controlplane::Error::AlreadyExists(_)) => {
                info!(cluster = %name, reason = %e, "Cluster already registered")
            }
            Err(e) => error!(cluster = %name, error = %e, "Cannot register cluster"),
        }
    }
}

/// Initialize tracing subscriber
fn init_tracing() {
    let env_filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("info,kube=warn,hyper=warn"));

    tracing_subscriber::registry()
        .with(env_filter)
        .with(tracing_subscriber::fmt::layer().json())
        .init();
}

/// Wait for shutdown signal (SIGTERM or SIGINT)
async fn shutdown_signal() {
    let ctrl_c = async {
        signal::ctrl_c()
            .await
            .expect("Failed to install CTRL+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("Failed to install SIGTERM handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            info!("Received CTRL+C signal");
        }
        _ = terminate => {
            info!("Received SIGTERM signal");
        }
    }
}
