//! Device identity.
//!
//! A device has no mutable state of its own from devlink's point of view: it
//! is a logical identifier plus the endpoint address a transport needs to
//! reach it.  Every operation opens a fresh transport from the descriptor.

use std::fmt;

use serde::{Deserialize, Serialize};

/// Logical identifier for a device, e.g. `"phone"` or a serial number.
///
/// Used as the key for per-device serialization at the call site.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct DeviceId(String);

impl DeviceId {
    /// Creates a device id from any string-like value.
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Returns the id as a string slice.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for DeviceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for DeviceId {
    fn from(value: &str) -> Self {
        Self::new(value)
    }
}

/// Everything a transport needs to open a channel to one device endpoint.
///
/// The `address` is transport specific: `host:port` for TCP, a socket path or
/// serial device path for other transports.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeviceDescriptor {
    /// Logical identifier of the device.
    pub id: DeviceId,
    /// Transport-specific endpoint address.
    pub address: String,
}

impl DeviceDescriptor {
    /// Creates a descriptor for `id` reachable at `address`.
    pub fn new(id: impl Into<DeviceId>, address: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            address: address.into(),
        }
    }
}

impl From<String> for DeviceId {
    fn from(value: String) -> Self {
        Self(value)
    }
}

impl fmt::Display for DeviceDescriptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} ({})", self.id, self.address)
    }
}
