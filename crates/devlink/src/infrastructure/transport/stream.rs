//! [`TransportHandle`] over any async byte stream.
//!
//! TCP sockets, Unix sockets, serial ports and in-memory pipes all look the
//! same once they implement `AsyncRead + AsyncWrite`.  `StreamHandle` adds
//! the handle contract on top: bounded reads, end-of-stream as
//! [`LinkError::Closed`], and an idempotent close.
//!
//! A single `receive` returns whatever one read produced, which may be part
//! of a frame or several frames; reassembly is the session's job.

use std::time::Duration;

use async_trait::async_trait;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tracing::debug;

use crate::application::transport::{LinkError, TransportHandle};

/// Default size of the per-read buffer.
const DEFAULT_READ_BUFFER: usize = 16 * 1024;

/// An open stream owned by one session.
pub struct StreamHandle<S> {
    stream: Option<S>,
    read_buf: Vec<u8>,
}

impl<S> StreamHandle<S>
where
    S: AsyncRead + AsyncWrite + Unpin + Send,
{
    pub fn new(stream: S) -> Self {
        Self::with_read_buffer(stream, DEFAULT_READ_BUFFER)
    }

    /// Uses a read buffer of `size` bytes (at least 1).
    pub fn with_read_buffer(stream: S, size: usize) -> Self {
        Self {
            stream: Some(stream),
            read_buf: vec![0u8; size.max(1)],
        }
    }

    pub fn is_open(&self) -> bool {
        self.stream.is_some()
    }
}

#[async_trait]
impl<S> TransportHandle for StreamHandle<S>
where
    S: AsyncRead + AsyncWrite + Unpin + Send,
{
    async fn send(&mut self, bytes: &[u8]) -> Result<(), LinkError> {
        let stream = self.stream.as_mut().ok_or(LinkError::HandleClosed)?;
        stream.write_all(bytes).await.map_err(LinkError::from_io)?;
        stream.flush().await.map_err(LinkError::from_io)
    }

    async fn receive(&mut self, timeout: Duration) -> Result<Vec<u8>, LinkError> {
        let stream = self.stream.as_mut().ok_or(LinkError::HandleClosed)?;
        match tokio::time::timeout(timeout, stream.read(&mut self.read_buf)).await {
            Err(_) => Err(LinkError::Timeout(timeout)),
            Ok(Err(e)) => Err(LinkError::from_io(e)),
            Ok(Ok(0)) => Err(LinkError::Closed),
            Ok(Ok(n)) => Ok(self.read_buf[..n].to_vec()),
        }
    }

    async fn close(&mut self) {
        if let Some(mut stream) = self.stream.take() {
            if let Err(e) = stream.shutdown().await {
                debug!("stream shutdown failed: {e}");
            }
        }
    }
}
