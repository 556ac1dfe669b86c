//! Unix-socket server: one request/response exchange per connection.

use crate::config::ServerConfig;
use crate::dispatcher::Dispatcher;
use crate::error::CoreError;
use crate::host::Host;
use crate::protocol::Response;
use crate::transport;
use bytes::Bytes;
use std::fs::Permissions;
use std::os::unix::fs::{FileTypeExt, PermissionsExt};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::UnixListener;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// Error sent instead of a response that does not fit in one frame.
const OVERSIZED_RESPONSE: &str = "response exceeds maximum message size";

/// A bound, not yet serving, server.
pub struct Server {
    listener: UnixListener,
    socket_path: PathBuf,
    max_message_size: usize,
    read_timeout: Duration,
    dispatcher: Arc<Dispatcher>,
}

impl Server {
    /// Validate `config`, bind the socket and build the dispatcher.
    ///
    /// A stale socket left by a previous process is removed first. The new
    /// socket is made accessible to its owner only.
    pub fn bind(config: ServerConfig, host: Arc<dyn Host>) -> Result<Self, CoreError> {
        config.validate()?;
        let socket_path = config.socket_path.clone();

        remove_stale_socket(&socket_path)?;
        let listener = UnixListener::bind(&socket_path)?;
        std::fs::set_permissions(&socket_path, Permissions::from_mode(0o600))?;
        info!(path = %socket_path.display(), "Listening for connections");

        Ok(Self {
            listener,
            socket_path,
            max_message_size: config.max_message_size,
            read_timeout: config.timeout,
            dispatcher: Arc::new(Dispatcher::new(&config, host)),
        })
    }

    /// Path of the listening socket.
    pub fn socket_path(&self) -> &Path {
        &self.socket_path
    }

    /// The dispatcher handling requests.
    pub fn dispatcher(&self) -> &Dispatcher {
        &self.dispatcher
    }

    /// Accept connections until `shutdown` fires, then remove the socket.
    ///
    /// Exchanges already in progress keep running on their own tasks.
    pub async fn serve(self, shutdown: CancellationToken) -> Result<(), CoreError> {
        loop {
            tokio::select! {
                _ = shutdown.cancelled() => {
                    info!("Shutdown requested");
                    break;
                }
                accepted = self.listener.accept() => match accepted {
                    Ok((stream, _addr)) => {
                        debug!("Accepted connection");
                        let dispatcher = Arc::clone(&self.dispatcher);
                        let max = self.max_message_size;
                        let read_timeout = self.read_timeout;
                        tokio::spawn(async move {
                            if let Err(e) = handle_connection(stream, &dispatcher, max, read_timeout).await {
                                debug!(error = %e, "Connection dropped");
                            }
                        });
                    }
                    Err(e) => {
                        error!(error = %e, "Failed to accept connection");
                    }
                },
            }
        }

        drop(self.listener);
        match std::fs::remove_file(&self.socket_path) {
            Ok(()) => debug!(path = %self.socket_path.display(), "Removed socket"),
            Err(e) => warn!(path = %self.socket_path.display(), error = %e, "Could not remove socket"),
        }
        Ok(())
    }
}

/// Serve one exchange.
///
/// Framing failures (oversized declared length, early close, no complete
/// request within `read_timeout`) return an error and the connection is
/// dropped without a reply.
async fn handle_connection<S>(
    stream: S,
    dispatcher: &Dispatcher,
    max_message_size: usize,
    read_timeout: Duration,
) -> Result<(), CoreError>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let mut frames = transport::framed(stream, max_message_size);

    let request = tokio::time::timeout(read_timeout, transport::read_frame(&mut frames))
        .await
        .map_err(|_| {
            CoreError::Io(std::io::Error::new(
                std::io::ErrorKind::TimedOut,
                "no request received in time",
            ))
        })??;
    let Some(body) = request else {
        debug!("Client closed without sending a request");
        return Ok(());
    };

    let response = dispatcher.dispatch_bytes(&body).await;
    let mut encoded = serde_json::to_vec(&response)?;
    if encoded.len() > max_message_size {
        warn!(bytes = encoded.len(), max = max_message_size, "Response too large");
        encoded = serde_json::to_vec(&Response::error(OVERSIZED_RESPONSE))?;
    }

    transport::write_frame(&mut frames, Bytes::from(encoded)).await
}

fn remove_stale_socket(path: &Path) -> Result<(), CoreError> {
    match std::fs::symlink_metadata(path) {
        Ok(meta) if meta.file_type().is_socket() => {
            std::fs::remove_file(path)?;
            debug!(path = %path.display(), "Removed stale socket");
            Ok(())
        }
        Ok(_) => Err(CoreError::Config(format!(
            "{} exists and is not a socket",
            path.display()
        ))),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(e.into()),
    }
}
