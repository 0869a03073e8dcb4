//! Application layer: device sessions and the operations built on them.
//!
//! Everything here talks to the outside world through traits
//! ([`transport::Transport`], [`download::PackageDownloader`]) so the whole
//! layer can be exercised against an in-memory device.
//!
//! # Sub-modules
//!
//! - **`transport`**   – The byte-channel contract every device link satisfies.
//! - **`session`**     – One connect → execute → disconnect lifecycle with
//!   guaranteed release of the underlying handle.
//! - **`app_manager`** – The operation-level API: device info, app listings,
//!   launch/close/uninstall, and package install.
//! - **`install`**     – The staged install job and its compensating cleanup.
//! - **`download`**    – The package downloader contract.
//! - **`error`**       – The closed error taxonomy returned to callers.

pub mod app_manager;
pub mod download;
pub mod error;
pub mod install;
pub mod session;
pub mod transport;
