//! Shared fixtures for the devlink integration tests.

#![allow(dead_code)]

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use devlink::application::app_manager::AppManager;
use devlink::application::download::{DownloadError, PackageDownloader};
use devlink::application::install::InstallSettings;
use devlink::application::session::SessionConfig;
use devlink::application::transport::Transport;
use devlink_core::DeviceDescriptor;

pub fn descriptor() -> DeviceDescriptor {
    DeviceDescriptor::new("sim", "sim://0")
}

/// Short timeouts so failure paths finish quickly.
pub fn session_config() -> SessionConfig {
    SessionConfig {
        connect_timeout: Duration::from_millis(200),
        command_timeout: Duration::from_millis(50),
        ..SessionConfig::default()
    }
}

/// Small chunks so even tiny packages take several `UploadChunk`s.
pub fn install_settings() -> InstallSettings {
    InstallSettings {
        chunk_size: 4,
        poll_interval: Duration::from_millis(1),
        install_timeout: Duration::from_millis(100),
    }
}

pub fn manager(transport: Arc<dyn Transport>, downloader: Arc<StaticDownloader>) -> AppManager {
    AppManager::new(transport, downloader, session_config(), install_settings())
}

/// Serves a fixed body (or a fixed failure) and counts fetches.
#[derive(Debug)]
pub struct StaticDownloader {
    body: Option<Bytes>,
    fetches: AtomicUsize,
}

impl StaticDownloader {
    pub fn serving(body: &'static [u8]) -> Arc<Self> {
        Arc::new(Self {
            body: Some(Bytes::from_static(body)),
            fetches: AtomicUsize::new(0),
        })
    }

    /// Every fetch answers HTTP 404.
    pub fn not_found() -> Arc<Self> {
        Arc::new(Self {
            body: None,
            fetches: AtomicUsize::new(0),
        })
    }

    pub fn fetches(&self) -> usize {
        self.fetches.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl PackageDownloader for StaticDownloader {
    async fn fetch(&self, url: &str) -> Result<Bytes, DownloadError> {
        self.fetches.fetch_add(1, Ordering::SeqCst);
        self.body.clone().ok_or_else(|| DownloadError::Status {
            url: url.to_string(),
            status: 404,
        })
    }
}
