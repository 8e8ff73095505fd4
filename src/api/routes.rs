//! HTTP route definitions and server start-up.

use std::future::IntoFuture;
use std::sync::Arc;

use axum::Router;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tower_http::trace::TraceLayer;

use super::volumes;
use crate::config::Config;
use crate::secrets::{
    LoadBalancer, ProducerRegistry, RemoteProducer, SrvLoadBalancer, StaticLoadBalancer,
};
use crate::types::SecretSource;
use crate::volume::{MemoryFs, Mounter, NoopMounter, OsFs, VolumeFs, VolumeManager};

/// Shared application state.
pub struct AppState {
    pub manager: VolumeManager,
}

/// Build the application router around a volume manager.
pub fn router(manager: VolumeManager) -> Router {
    let state = Arc::new(AppState { manager });
    Router::new()
        .merge(volumes::routes())
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

/// Build the volume manager described by `config`. Fetches in flight are
/// aborted when `cancel` fires.
pub fn build_manager(config: &Config, cancel: CancellationToken) -> anyhow::Result<VolumeManager> {
    let balancer: Arc<dyn LoadBalancer> = match &config.srv {
        Some(name) => {
            tracing::info!(srv = %name, nameserver = ?config.nameserver, "Discovering secret service via SRV");
            Arc::new(SrvLoadBalancer::new(name.clone(), config.nameserver)?)
        }
        None => {
            tracing::info!(backends = ?config.backends, "Using static secret service endpoints");
            Arc::new(StaticLoadBalancer::new(config.backends.clone()))
        }
    };
    if !config.tls_verify {
        tracing::warn!("Secret service certificates will not be verified");
    }
    let talos = RemoteProducer::new(balancer)
        .with_timeout(config.fetch_timeout)
        .with_tls_verification(config.tls_verify)
        .with_cancellation(cancel);
    let producers = ProducerRegistry::new().with(SecretSource::Talos, Arc::new(talos));

    let (mounter, fs): (Arc<dyn Mounter>, Arc<dyn VolumeFs>) = if config.virtual_fs {
        tracing::info!("Using in-memory filesystem and no-op mounter");
        (
            Arc::new(NoopMounter::new(&config.root)),
            Arc::new(MemoryFs::with_dir(&config.root)?),
        )
    } else {
        if !config.root.is_dir() {
            anyhow::bail!("volume root {} is not a directory", config.root.display());
        }
        tracing::info!("Using host filesystem and tmpfs mounter");
        (host_mounter(config), Arc::new(OsFs))
    };

    let mut manager = VolumeManager::new(mounter, producers)
        .with_filesystem(fs)
        .with_metadata_file(config.metadata_file.clone())
        .with_dir_mode(config.dir_mode)
        .with_file_mode(config.file_mode);
    if let Some(name) = &config.merged_secrets_file {
        manager = manager.with_merged_secrets_file(name.clone());
    }
    Ok(manager)
}

#[cfg(target_os = "linux")]
fn host_mounter(config: &Config) -> Arc<dyn Mounter> {
    Arc::new(
        crate::volume::TmpfsMounter::new(&config.root)
            .with_max_size_mb(config.max_size_mb)
            .with_mode(config.mount_mode),
    )
}

#[cfg(not(target_os = "linux"))]
fn host_mounter(config: &Config) -> Arc<dyn Mounter> {
    Arc::new(NoopMounter::new(&config.root))
}

/// Start the HTTP server.
pub async fn serve(config: Config) -> anyhow::Result<()> {
    let fetches = CancellationToken::new();
    let manager = build_manager(&config, fetches.clone())?;
    let app = router(manager);

    let addr = config.bind_addr();
    let listener = TcpListener::bind(&addr).await?;
    tracing::info!("Server listening on {}", addr);

    // Setup graceful shutdown on SIGTERM/SIGINT
    let shutdown = CancellationToken::new();
    tokio::spawn(shutdown_signal(shutdown.clone()));

    let mut server = tokio::spawn(
        axum::serve(listener, app)
            .with_graceful_shutdown(shutdown.clone().cancelled_owned())
            .into_future(),
    );

    let grace = config.shutdown_grace;
    tokio::select! {
        result = &mut server => result??,
        _ = async {
            shutdown.cancelled().await;
            tokio::time::sleep(grace).await;
        } => {
            tracing::warn!("In-flight requests still running after {:?}, aborting", grace);
            fetches.cancel();
            server.abort();
        }
    }

    Ok(())
}

/// Wait for SIGINT or SIGTERM, then trigger `shutdown`.
async fn shutdown_signal(shutdown: CancellationToken) {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::error!("Failed to install Ctrl+C handler: {}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                tracing::error!("Failed to install SIGTERM handler: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }

    tracing::info!("Shutdown signal received, draining in-flight requests");
    shutdown.cancel();
}
