//! TCP transport.
//!
//! Devices that expose their control channel on a TCP port (directly, or via
//! a port forwarded by a debug bridge) are reached at `host:port`.  The
//! descriptor's address is used verbatim.
//!
//! # Portability note
//!
//! This module uses only the `tokio::net::TcpStream` API, which works
//! identically on Windows, Linux, and macOS.

use std::io::ErrorKind;
use std::time::Duration;

use async_trait::async_trait;
use devlink_core::DeviceDescriptor;
use tokio::net::TcpStream;
use tracing::{debug, warn};

use crate::application::transport::{ConnectError, Transport, TransportHandle};
use crate::infrastructure::transport::stream::StreamHandle;

/// Opens TCP connections to device control ports.
#[derive(Debug, Clone, Default)]
pub struct TcpTransport;

impl TcpTransport {
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl Transport for TcpTransport {
    async fn open(
        &self,
        device: &DeviceDescriptor,
        timeout: Duration,
    ) -> Result<Box<dyn TransportHandle>, ConnectError> {
        let address = device.address.clone();
        let stream = match tokio::time::timeout(timeout, TcpStream::connect(address.as_str())).await
        {
            Err(_) => return Err(ConnectError::Timeout { address, timeout }),
            Ok(Err(e)) => return Err(classify_connect_error(address, e)),
            Ok(Ok(stream)) => stream,
        };

        // Commands are small and strictly request/response.
        if let Err(e) = stream.set_nodelay(true) {
            warn!("could not disable Nagle on {address}: {e}");
        }
        debug!(device = %device.id, %address, "TCP link open");
        Ok(Box::new(StreamHandle::new(stream)))
    }
}

fn classify_connect_error(address: String, err: std::io::Error) -> ConnectError {
    match err.kind() {
        ErrorKind::ConnectionRefused | ErrorKind::NotFound | ErrorKind::AddrNotAvailable => {
            ConnectError::NotFound { address }
        }
        ErrorKind::PermissionDenied => ConnectError::PermissionDenied { address },
        ErrorKind::TimedOut => ConnectError::Timeout {
            address,
            timeout: Duration::ZERO,
        },
        _ => ConnectError::Io {
            address,
            source: err,
        },
    }
}
