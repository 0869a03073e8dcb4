//! Infrastructure layer for devlink.
//!
//! Contains the concrete adapters: device transports (TCP, generic streams,
//! a simulated device), the HTTP package downloader, the per-device request
//! queue, TOML config storage, and the caller-facing command bridge.
//!
//! **Dependency rule**: this layer may depend on `application` and
//! `devlink_core`, but MUST NOT be imported by the `application` layer.

pub mod command_bridge;
pub mod device_queue;
pub mod downloader;
pub mod storage;
pub mod transport;
