//! Length-prefixed framing and a one-shot client.
//!
//! A frame is a 4-byte unsigned big-endian length followed by that many
//! bytes of UTF-8 JSON. Each connection carries exactly one request frame and
//! one response frame.

use crate::error::CoreError;
use crate::protocol::{Request, Response};
use bytes::{Bytes, BytesMut};
use futures::{SinkExt, StreamExt};
use std::io;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::UnixStream;
use tokio_util::codec::{Framed, LengthDelimitedCodec};

/// A stream wrapped in the frame codec.
pub type FramedStream<S> = Framed<S, LengthDelimitedCodec>;

/// Build the frame codec with the given maximum body size.
pub fn codec(max_message_size: usize) -> LengthDelimitedCodec {
    LengthDelimitedCodec::builder()
        .length_field_length(4)
        .big_endian()
        .max_frame_length(max_message_size)
        .new_codec()
}

/// Wrap `stream` in the frame codec.
pub fn framed<S>(stream: S, max_message_size: usize) -> FramedStream<S>
where
    S: AsyncRead + AsyncWrite,
{
    Framed::new(stream, codec(max_message_size))
}

/// Read one frame.
///
/// Returns `Ok(None)` if the peer closed before sending anything. An
/// oversized declared length or a close in the middle of a frame is an error.
pub async fn read_frame<S>(frames: &mut FramedStream<S>) -> Result<Option<BytesMut>, CoreError>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    match frames.next().await {
        Some(Ok(body)) => Ok(Some(body)),
        Some(Err(e)) => Err(e.into()),
        None => Ok(None),
    }
}

/// Write one frame and flush it.
pub async fn write_frame<S>(frames: &mut FramedStream<S>, body: Bytes) -> Result<(), CoreError>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    frames.send(body).await?;
    Ok(())
}

/// Client performing one request/response exchange per call.
#[derive(Debug, Clone)]
pub struct Client {
    socket_path: PathBuf,
    max_message_size: usize,
    timeout: Option<Duration>,
}

impl Client {
    /// Create a client for the server listening on `socket_path`.
    pub fn new(socket_path: impl Into<PathBuf>) -> Self {
        Self {
            socket_path: socket_path.into(),
            max_message_size: crate::config::DEFAULT_MAX_MESSAGE_SIZE,
            timeout: None,
        }
    }

    /// Set the largest frame accepted in either direction.
    pub fn with_max_message_size(mut self, bytes: usize) -> Self {
        self.max_message_size = bytes;
        self
    }

    /// Give up on exchanges that take longer than `timeout`.
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    /// Socket this client connects to.
    pub fn socket_path(&self) -> &Path {
        &self.socket_path
    }

    /// Send a request and decode the response envelope.
    pub async fn call(&self, request: &Request) -> Result<Response, CoreError> {
        let body = serde_json::to_vec(request)?;
        tracing::debug!(method = %request.method, bytes = body.len(), "Sending request");
        let reply = self.call_raw(Bytes::from(body)).await?;
        Ok(serde_json::from_slice(&reply)?)
    }

    /// Send raw frame bytes and return the raw response body.
    pub async fn call_raw(&self, body: Bytes) -> Result<Bytes, CoreError> {
        match self.timeout {
            Some(limit) => tokio::time::timeout(limit, self.exchange(body))
                .await
                .map_err(|_| {
                    tracing::warn!(
                        path = %self.socket_path.display(),
                        timeout_ms = limit.as_millis() as u64,
                        "Request timed out"
                    );
                    CoreError::Io(io::Error::new(io::ErrorKind::TimedOut, "request timed out"))
                })?,
            None => self.exchange(body).await,
        }
    }

    async fn exchange(&self, body: Bytes) -> Result<Bytes, CoreError> {
        let stream = UnixStream::connect(&self.socket_path).await?;
        let mut frames = framed(stream, self.max_message_size);
        write_frame(&mut frames, body).await?;

        match read_frame(&mut frames).await? {
            Some(reply) => Ok(reply.freeze()),
            None => Err(CoreError::Io(io::Error::new(
                io::ErrorKind::UnexpectedEof,
                "connection closed without a response",
            ))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::sync::atomic::{AtomicU64, Ordering};
    use tokio::io::AsyncWriteExt;
    use tokio::net::UnixListener;

    static COUNTER: AtomicU64 = AtomicU64::new(0);

    fn socket_path() -> PathBuf {
        let id = COUNTER.fetch_add(1, Ordering::SeqCst);
        std::env::temp_dir().join(format!("tether-transport-{}-{}.sock", std::process::id(), id))
    }

    #[tokio::test]
    async fn test_frame_layout() {
        let (client, server) = tokio::io::duplex(64);
        let mut writer = framed(client, 1024);
        write_frame(&mut writer, Bytes::from_static(b"{}")).await.unwrap();
        drop(writer);

        let mut raw = Vec::new();
        let mut server = server;
        tokio::io::AsyncReadExt::read_to_end(&mut server, &mut raw)
            .await
            .unwrap();
        assert_eq!(raw, [0, 0, 0, 2, b'{', b'}']);
    }

    #[tokio::test]
    async fn test_oversized_frame_is_rejected() {
        let (mut client, server) = tokio::io::duplex(64);
        client.write_all(&100u32.to_be_bytes()).await.unwrap();
        client.write_all(b"x").await.unwrap();

        let mut frames = framed(server, 16);
        assert!(read_frame(&mut frames).await.is_err());
    }

    #[tokio::test]
    async fn test_truncated_frame_is_an_error() {
        let (mut client, server) = tokio::io::duplex(64);
        client.write_all(&[0, 0, 0, 10, b'{']).await.unwrap();
        drop(client);

        let mut frames = framed(server, 1024);
        assert!(read_frame(&mut frames).await.is_err());
    }

    #[tokio::test]
    async fn test_clean_close_is_none() {
        let (client, server) = tokio::io::duplex(64);
        drop(client);
        let mut frames = framed(server, 1024);
        assert!(read_frame(&mut frames).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_client_round_trip() {
        let path = socket_path();
        let _ = std::fs::remove_file(&path);
        let listener = UnixListener::bind(&path).unwrap();

        let server = tokio::spawn(async move {
            let (stream, _) = listener.accept().await.unwrap();
            let mut frames = framed(stream, 1024);
            let body = read_frame(&mut frames).await.unwrap().unwrap();
            let request = Request::from_slice(&body).unwrap();
            let reply = serde_json::to_vec(&Response::success(json!(request.method))).unwrap();
            write_frame(&mut frames, Bytes::from(reply)).await.unwrap();
        });

        let client = Client::new(&path).with_timeout(Duration::from_secs(5));
        let response = client
            .call(&Request::new("list_tools", json!({})))
            .await
            .unwrap();
        assert_eq!(response, Response::success(json!("list_tools")));

        server.await.unwrap();
        std::fs::remove_file(&path).ok();
    }

    #[tokio::test]
    async fn test_client_reports_missing_response() {
        let path = socket_path();
        let _ = std::fs::remove_file(&path);
        let listener = UnixListener::bind(&path).unwrap();

        let server = tokio::spawn(async move {
            let (stream, _) = listener.accept().await.unwrap();
            let mut frames = framed(stream, 1024);
            let _ = read_frame(&mut frames).await;
        });

        let err = Client::new(&path)
            .call_raw(Bytes::from_static(b"{}"))
            .await
            .unwrap_err();
        assert!(matches!(err, CoreError::Io(_)));

        server.await.unwrap();
        std::fs::remove_file(&path).ok();
    }
}
