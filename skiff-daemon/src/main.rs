use std::net::SocketAddr;
use std::sync::Arc;

use tokio_util::sync::CancellationToken;
use tracing::info;

use skiff_core::{observability, InprocessStore, RegistryConfig, SkiffError, Store};

mod api;
mod exec;
mod pipeline;
mod proto_convert;

use pipeline::{Pipeline, PipelineConfig};

/// Daemon settings, read from the environment at startup.
struct DaemonConfig {
    listen_addr: SocketAddr,
    registry: RegistryConfig,
    basedomain: String,
    storage: String,
}

impl DaemonConfig {
    fn from_env() -> Result<Self, Box<dyn std::error::Error>> {
        let listen_addr = env_or("SKIFF_LISTEN_ADDR", "127.0.0.1:44134")
            .parse::<SocketAddr>()
            .map_err(|e| format!("invalid SKIFF_LISTEN_ADDR: {}", e))?;

        let registry = RegistryConfig {
            url: env_or("SKIFF_REGISTRY_URL", "localhost:5000"),
            org: env_or("SKIFF_REGISTRY_ORG", "skiff"),
            auth: env_or("SKIFF_REGISTRY_AUTH", ""),
        };

        Ok(Self {
            listen_addr,
            registry,
            basedomain: env_or("SKIFF_BASEDOMAIN", ""),
            storage: env_or("SKIFF_STORAGE", "inprocess"),
        })
    }
}

fn env_or(key: &str, default: &str) -> String {
    std::env::var(key).unwrap_or_else(|_| default.to_string())
}

/// Cancel `token` once SIGINT or SIGTERM arrives.
fn watch_shutdown_signal(token: CancellationToken) {
    tokio::spawn(async move {
        let ctrl_c = async {
            if tokio::signal::ctrl_c().await.is_err() {
                std::future::pending::<()>().await;
            }
        };

        #[cfg(unix)]
        let terminate = async {
            match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
                Ok(mut sig) => {
                    sig.recv().await;
                }
                Err(_) => std::future::pending::<()>().await,
            }
        };

        #[cfg(not(unix))]
        let terminate = std::future::pending::<()>();

        tokio::select! {
            _ = ctrl_c => info!("Received SIGINT (Ctrl+C)"),
            _ = terminate => info!("Received SIGTERM"),
        }

        token.cancel();
    });
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Initialize observability FIRST
    observability::init()?;

    info!("skiff daemon starting");

    let config = DaemonConfig::from_env()?;

    let store: Arc<dyn Store> = match config.storage.as_str() {
        "inprocess" => Arc::new(InprocessStore::new()),
        other => {
            return Err(Box::new(SkiffError::InvalidConfig {
                reason: format!("unknown SKIFF_STORAGE backend {:?}", other),
            }) as Box<dyn std::error::Error>)
        }
    };

    let docker = Arc::new(exec::DockerCli::new()?);
    let helm = Arc::new(exec::HelmCli::new()?);
    info!(registry = %config.registry.url, "delegates initialized");

    let pipeline = Arc::new(Pipeline::new(
        store.clone(),
        docker.clone(),
        docker,
        helm,
        PipelineConfig { registry: config.registry, basedomain: config.basedomain },
    ));

    // Shutdown cancels every in-flight run through its child tokens, then
    // the server drains.
    let shutdown = CancellationToken::new();
    watch_shutdown_signal(shutdown.clone());

    let service = api::SkiffServiceImpl::new(pipeline, store, shutdown.clone());

    info!("skiff daemon ready");
    api::start_api_server(service, config.listen_addr, shutdown).await?;

    info!("skiff daemon shutting down");
    Ok(())
}
