//! HTTP package downloader.
//!
//! Fetches an install package over `http`/`https` with `reqwest`.  The body
//! is streamed chunk by chunk so an oversized package is rejected as soon as
//! it crosses the limit instead of after it has been buffered.  Requests are
//! never retried.

use std::time::Duration;

use async_trait::async_trait;
use bytes::{Bytes, BytesMut};
use reqwest::Url;
use tracing::{debug, info};

use crate::application::download::{DownloadError, PackageDownloader};

/// [`PackageDownloader`] backed by a shared `reqwest::Client`.
#[derive(Debug, Clone)]
pub struct HttpDownloader {
    client: reqwest::Client,
    max_bytes: u64,
}

impl HttpDownloader {
    /// Builds a downloader whose requests time out after `timeout` and whose
    /// packages may be at most `max_bytes` long.
    ///
    /// # Errors
    ///
    /// Returns the `reqwest` error if the TLS backend cannot be initialised.
    pub fn new(timeout: Duration, max_bytes: u64) -> Result<Self, reqwest::Error> {
        let client = reqwest::Client::builder().timeout(timeout).build()?;
        Ok(Self { client, max_bytes })
    }
}

#[async_trait]
impl PackageDownloader for HttpDownloader {
    async fn fetch(&self, url: &str) -> Result<Bytes, DownloadError> {
        let parsed = validate_url(url)?;
        let request_error = |e: reqwest::Error| map_request_error(url, e);

        let mut response = self
            .client
            .get(parsed)
            .send()
            .await
            .map_err(request_error)?;

        let status = response.status();
        if !status.is_success() {
            return Err(DownloadError::Status {
                url: url.to_string(),
                status: status.as_u16(),
            });
        }

        let too_large = || DownloadError::TooLarge {
            url: url.to_string(),
            limit: self.max_bytes,
        };
        if response.content_length().is_some_and(|len| len > self.max_bytes) {
            return Err(too_large());
        }

        let mut body = BytesMut::new();
        while let Some(chunk) = response.chunk().await.map_err(request_error)? {
            if (body.len() + chunk.len()) as u64 > self.max_bytes {
                return Err(too_large());
            }
            body.extend_from_slice(&chunk);
        }
        debug!(url, bytes = body.len(), "download finished");

        if body.is_empty() {
            return Err(DownloadError::Empty {
                url: url.to_string(),
            });
        }
        info!("downloaded {} bytes from {url}", body.len());
        Ok(body.freeze())
    }
}

/// Parses `url` and accepts only `http` and `https`.
fn validate_url(url: &str) -> Result<Url, DownloadError> {
    let parsed = Url::parse(url).map_err(|e| DownloadError::InvalidUrl {
        url: url.to_string(),
        reason: e.to_string(),
    })?;
    match parsed.scheme() {
        "http" | "https" => Ok(parsed),
        other => Err(DownloadError::UnsupportedScheme {
            url: url.to_string(),
            scheme: other.to_string(),
        }),
    }
}

fn map_request_error(url: &str, err: reqwest::Error) -> DownloadError {
    if err.is_timeout() {
        DownloadError::Timeout {
            url: url.to_string(),
        }
    } else {
        DownloadError::Request {
            url: url.to_string(),
            reason: err.to_string(),
        }
    }
}
