//! secret-volume - HTTP Server Entry Point
//!
//! Starts the HTTP server that creates and destroys secret volumes.

use secret_volume::{api, config::Config};
use tracing::info;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize logging
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "secret_volume=info,tower_http=info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    // Load configuration
    let config = Config::from_env()?;
    info!(
        "Loaded configuration: root={} virtual={} backends={}",
        config.root.display(),
        config.virtual_fs,
        config.backends.join(",")
    );

    api::serve(config).await?;

    Ok(())
}
