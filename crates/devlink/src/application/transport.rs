//! The byte-channel contract between a session and a device endpoint.
//!
//! A [`Transport`] knows how to reach devices of one kind (TCP port, serial
//! line, in-memory simulator, ...).  Opening it yields a
//! [`TransportHandle`]: an exclusively owned, bidirectional byte channel to
//! exactly one device.  The transport never looks inside the bytes it moves;
//! framing belongs to the protocol codec.
//!
//! # Handle lifecycle
//!
//! ```text
//! open ──> send / receive ... ──> close
//!                                   │
//!                                   └─ close again: no-op
//! ```
//!
//! After `close`, `send` and `receive` fail with [`LinkError::HandleClosed`].

use std::time::Duration;

use async_trait::async_trait;
use devlink_core::DeviceDescriptor;
use thiserror::Error;

/// Failure to establish a channel to a device.
#[derive(Debug, Error)]
pub enum ConnectError {
    /// Nothing is listening at the address, or the device is not attached.
    #[error("device not found at {address}")]
    NotFound { address: String },

    /// The endpoint exists but this process may not open it.
    #[error("permission denied opening {address}")]
    PermissionDenied { address: String },

    /// The channel did not open within the connect timeout.
    #[error("timed out after {timeout:?} connecting to {address}")]
    Timeout { address: String, timeout: Duration },

    /// Any other I/O failure while opening.
    #[error("I/O error connecting to {address}: {source}")]
    Io {
        address: String,
        #[source]
        source: std::io::Error,
    },

    /// The channel opened but the device refused the protocol handshake.
    #[error("handshake with {address} failed: {reason}")]
    Handshake { address: String, reason: String },
}

/// Failure of an open channel.
#[derive(Debug, Error)]
pub enum LinkError {
    /// The peer closed the channel or the link dropped.
    #[error("link closed by peer")]
    Closed,

    /// The handle was already closed by its owner.
    #[error("transport handle is closed")]
    HandleClosed,

    /// No data arrived (or could be written) within the bound.
    #[error("no progress on link within {0:?}")]
    Timeout(Duration),

    /// Any other I/O failure on the channel.
    #[error("link I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl LinkError {
    /// Classifies an I/O error from a read or write on an open stream.
    pub fn from_io(err: std::io::Error) -> Self {
        use std::io::ErrorKind;
        match err.kind() {
            ErrorKind::UnexpectedEof
            | ErrorKind::BrokenPipe
            | ErrorKind::ConnectionReset
            | ErrorKind::ConnectionAborted => LinkError::Closed,
            _ => LinkError::Io(err),
        }
    }
}

/// Opens byte channels to devices.
#[async_trait]
pub trait Transport: Send + Sync {
    /// Opens a channel to `device`, giving up after `timeout`.
    ///
    /// # Errors
    ///
    /// Returns a [`ConnectError`] describing why the device is unreachable.
    async fn open(
        &self,
        device: &DeviceDescriptor,
        timeout: Duration,
    ) -> Result<Box<dyn TransportHandle>, ConnectError>;
}

/// An open, exclusively owned byte channel to one device.
#[async_trait]
pub trait TransportHandle: Send {
    /// Writes all of `bytes` to the device.
    ///
    /// # Errors
    ///
    /// [`LinkError::Closed`] if the link dropped, [`LinkError::HandleClosed`]
    /// after [`close`](Self::close).
    async fn send(&mut self, bytes: &[u8]) -> Result<(), LinkError>;

    /// Waits up to `timeout` for the next bytes from the device.
    ///
    /// Returns a non-empty buffer; end of stream is reported as
    /// [`LinkError::Closed`].
    ///
    /// # Errors
    ///
    /// [`LinkError::Timeout`] when nothing arrives in time.
    async fn receive(&mut self, timeout: Duration) -> Result<Vec<u8>, LinkError>;

    /// Releases the channel.  Calling it more than once is a no-op.
    async fn close(&mut self);
}
