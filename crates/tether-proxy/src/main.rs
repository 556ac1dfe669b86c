//! tether-proxy: token-checked TCP front-end for a local tether server.
//!
//! Each TCP connection carries one frame `{token, payload}`. With a matching
//! token, `payload` is forwarded to the tether Unix socket and the single
//! response frame is relayed back; otherwise the connection is closed
//! without a reply.

mod config;
mod relay;

use config::ProxyConfig;
use relay::Relay;
use std::sync::Arc;
use tokio::net::TcpListener;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Logs go to stderr
    tracing_subscriber::registry()
        .with(EnvFilter::from_default_env().add_directive("tether_proxy=info".parse()?))
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();

    let config = ProxyConfig::from_env()?;
    tracing::info!(?config, "Configuration loaded");
    config.validate_warn();

    let listener = TcpListener::bind(config.listen_addr).await?;
    tracing::info!(
        addr = %config.listen_addr,
        upstream = %config.socket_path.display(),
        "Proxy listening"
    );

    let relay = Arc::new(Relay::new(&config));
    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                tracing::info!("Received shutdown signal");
                break;
            }
            accepted = listener.accept() => match accepted {
                Ok((stream, peer)) => {
                    let relay = Arc::clone(&relay);
                    tokio::spawn(async move {
                        match relay.handle(stream).await {
                            Ok(()) => tracing::debug!(%peer, "Relayed exchange"),
                            Err(relay::RelayError::TokenMismatch) => {
                                tracing::warn!(%peer, "Rejected connection: token mismatch")
                            }
                            Err(e) => tracing::debug!(%peer, error = %e, "Connection closed"),
                        }
                    });
                }
                Err(e) => tracing::error!(error = %e, "Failed to accept connection"),
            },
        }
    }

    tracing::info!("tether proxy stopped");
    Ok(())
}
