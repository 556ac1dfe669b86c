//! Token-checked relay of one framed exchange.

use crate::config::ProxyConfig;
use bytes::Bytes;
use serde::Deserialize;
use serde_json::Value;
use tether_core::transport::{self, FramedStream};
use tether_core::{Client, CoreError};
use tokio::io::{AsyncRead, AsyncWrite};

/// Why a connection was closed without a reply.
#[derive(Debug, thiserror::Error)]
pub enum RelayError {
    #[error("framing: {0}")]
    Frame(CoreError),

    #[error("client closed before sending a frame")]
    Empty,

    #[error("malformed envelope: {0}")]
    Envelope(#[from] serde_json::Error),

    #[error("token mismatch")]
    TokenMismatch,

    #[error("upstream: {0}")]
    Upstream(CoreError),
}

/// Envelope sent by proxy clients.
#[derive(Debug, Deserialize)]
struct Envelope {
    token: String,
    payload: Value,
}

/// Relays authenticated frames to the tether server.
#[derive(Debug, Clone)]
pub struct Relay {
    token: String,
    max_message_size: usize,
    upstream: Client,
}

impl Relay {
    /// Create a relay from the proxy configuration.
    pub fn new(config: &ProxyConfig) -> Self {
        Self {
            token: config.token.clone(),
            max_message_size: config.max_message_size,
            upstream: Client::new(&config.socket_path)
                .with_max_message_size(config.max_message_size)
                .with_timeout(config.upstream_timeout),
        }
    }

    /// Serve one connection: check the token, forward the payload, relay the
    /// reply verbatim. Any failure closes the connection without a reply.
    pub async fn handle<S>(&self, stream: S) -> Result<(), RelayError>
    where
        S: AsyncRead + AsyncWrite + Unpin,
    {
        let mut frames: FramedStream<S> = transport::framed(stream, self.max_message_size);

        let body = transport::read_frame(&mut frames)
            .await
            .map_err(RelayError::Frame)?
            .ok_or(RelayError::Empty)?;
        let envelope: Envelope = serde_json::from_slice(&body)?;

        if !tokens_match(envelope.token.as_bytes(), self.token.as_bytes()) {
            return Err(RelayError::TokenMismatch);
        }

        let payload = Bytes::from(serde_json::to_vec(&envelope.payload)?);
        tracing::debug!(bytes = payload.len(), "Forwarding payload");
        let reply = self
            .upstream
            .call_raw(payload)
            .await
            .map_err(RelayError::Upstream)?;

        transport::write_frame(&mut frames, reply)
            .await
            .map_err(RelayError::Frame)
    }
}

/// Compare secrets without short-circuiting on the first differing byte.
fn tokens_match(given: &[u8], expected: &[u8]) -> bool {
    if given.len() != expected.len() {
        return false;
    }
    given
        .iter()
        .zip(expected)
        .fold(0u8, |acc, (a, b)| acc | (a ^ b))
        == 0
}
