//! Package download contract.
//!
//! Installing from a URL needs the package bytes before any device session is
//! opened.  The fetch itself is an external concern; the install workflow
//! only depends on this trait.

use async_trait::async_trait;
use bytes::Bytes;
use thiserror::Error;

/// Why a package could not be fetched.
#[derive(Debug, Error)]
pub enum DownloadError {
    /// The URL does not parse.
    #[error("invalid package URL {url:?}: {reason}")]
    InvalidUrl { url: String, reason: String },

    /// Only `http` and `https` are fetched.
    #[error("unsupported URL scheme {scheme:?} in {url}")]
    UnsupportedScheme { url: String, scheme: String },

    /// The server answered with a non-success status.
    #[error("server returned HTTP {status} for {url}")]
    Status { url: String, status: u16 },

    /// The package exceeds the configured size limit.
    #[error("package at {url} is larger than the {limit}-byte limit")]
    TooLarge { url: String, limit: u64 },

    /// The server returned no bytes.
    #[error("package at {url} is empty")]
    Empty { url: String },

    /// The request did not complete within the download timeout.
    #[error("download of {url} timed out")]
    Timeout { url: String },

    /// Connection or protocol failure while downloading.
    #[error("download of {url} failed: {reason}")]
    Request { url: String, reason: String },
}

/// Fetches package bytes by URL.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait PackageDownloader: Send + Sync {
    /// Downloads the whole package at `url`.
    ///
    /// # Errors
    ///
    /// Returns a [`DownloadError`]; implementations do not retry.
    async fn fetch(&self, url: &str) -> Result<Bytes, DownloadError>;
}
