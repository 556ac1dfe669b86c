//! tether-server entry point.
//!
//! Serves the tether protocol on a Unix socket against a manifest-backed
//! host. Configuration comes from `TETHER_*` environment variables (see
//! [`ServerConfig::from_env`]); `TETHER_HOST_MANIFEST` names the manifest.

mod host;

use host::StaticHost;
use std::sync::Arc;
use tether_core::{Server, ServerConfig};
use tokio::signal::unix::{signal, SignalKind};
use tokio_util::sync::CancellationToken;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Logs go to stderr
    tracing_subscriber::registry()
        .with(
            EnvFilter::from_default_env()
                .add_directive("tether_server=info".parse()?)
                .add_directive("tether_core=info".parse()?),
        )
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();

    tracing::info!("Starting tether server");

    let config = ServerConfig::from_env();
    tracing::info!(?config, "Configuration loaded");

    let host = match std::env::var("TETHER_HOST_MANIFEST") {
        Ok(path) => StaticHost::from_file(path)?,
        Err(_) => {
            tracing::info!("TETHER_HOST_MANIFEST not set, using built-in manifest");
            StaticHost::default()
        }
    };

    let server = Server::bind(config, Arc::new(host))?;

    let shutdown = CancellationToken::new();
    let trigger = shutdown.clone();
    let mut terminate = signal(SignalKind::terminate())?;
    tokio::spawn(async move {
        tokio::select! {
            result = tokio::signal::ctrl_c() => {
                if let Err(e) = result {
                    tracing::error!(error = %e, "Failed to listen for ctrl-c");
                }
            }
            _ = terminate.recv() => {}
        }
        tracing::info!("Received shutdown signal");
        trigger.cancel();
    });

    server.serve(shutdown).await?;
    tracing::info!("tether server stopped");
    Ok(())
}
