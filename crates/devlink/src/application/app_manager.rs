//! Operation-level API.
//!
//! Every public operation opens its own [`DeviceSession`], runs, and
//! disconnects before returning, whatever the outcome.  Nothing is cached
//! between calls; the device is the source of truth.
//!
//! # Retry policy
//!
//! Commands for which [`CommandKind::is_retryable`] holds (the `get_*`
//! queries) are retried exactly once, in a fresh session, when the first
//! attempt ends in a command timeout.  Mutations (launch, close, uninstall,
//! install) are never retried: a timed-out mutation may still have taken
//! effect on the device.
//!
//! # Install rollback
//!
//! Once the upload has begun, a failure triggers the stage's compensating
//! action (`AbortUpload`).  It runs on the same session when that session is
//! still `Ready`, otherwise on a freshly opened one.  If the cleanup succeeds
//! the caller receives the original error unchanged, so a device rejection
//! is still a [`ManagerError::Device`].  If it fails the caller receives
//! [`ManagerError::CleanupFailed`] carrying both errors.
//!
//! Dropping an install future mid-upload closes the link through
//! [`DeviceSession`]'s `Drop` but sends no `AbortUpload`; the device is left
//! to discard the partial upload itself.

use std::sync::Arc;

use devlink_core::{
    AppDescriptor, Command, CommandKind, CompensatingAction, DeviceDescriptor, DeviceInfo,
    InstallStage, Response, MAX_STRING_LEN,
};
use tracing::{info, instrument, warn};

use crate::application::download::{DownloadError, PackageDownloader};
use crate::application::error::ManagerError;
use crate::application::install::{InstallJob, InstallSettings};
use crate::application::session::{unexpected_response, DeviceSession, SessionConfig};
use crate::application::transport::Transport;

/// Runs device operations through short-lived sessions.
pub struct AppManager {
    transport: Arc<dyn Transport>,
    downloader: Arc<dyn PackageDownloader>,
    session_config: SessionConfig,
    install_settings: InstallSettings,
}

impl AppManager {
    pub fn new(
        transport: Arc<dyn Transport>,
        downloader: Arc<dyn PackageDownloader>,
        session_config: SessionConfig,
        install_settings: InstallSettings,
    ) -> Self {
        Self {
            transport,
            downloader,
            session_config,
            install_settings,
        }
    }

    // ── Reads ─────────────────────────────────────────────────────────────────

    #[instrument(skip(self), fields(device = %device.id))]
    pub async fn get_device_info(
        &self,
        device: &DeviceDescriptor,
    ) -> Result<DeviceInfo, ManagerError> {
        match self.execute(device, &Command::GetDeviceInfo).await? {
            Response::DeviceInfo(info) => Ok(info),
            other => Err(unexpected_response(CommandKind::GetDeviceInfo, &other)),
        }
    }

    #[instrument(skip(self), fields(device = %device.id))]
    pub async fn get_running_apps(
        &self,
        device: &DeviceDescriptor,
    ) -> Result<Vec<AppDescriptor>, ManagerError> {
        self.app_list(device, Command::ListRunningApps).await
    }

    #[instrument(skip(self), fields(device = %device.id))]
    pub async fn get_installed_apps(
        &self,
        device: &DeviceDescriptor,
    ) -> Result<Vec<AppDescriptor>, ManagerError> {
        self.app_list(device, Command::ListInstalledApps).await
    }

    // ── Mutations ─────────────────────────────────────────────────────────────

    #[instrument(skip(self), fields(device = %device.id))]
    pub async fn launch_app(
        &self,
        device: &DeviceDescriptor,
        app_id: &str,
    ) -> Result<(), ManagerError> {
        check_len("app_id", app_id)?;
        let cmd = Command::LaunchApp {
            app_id: app_id.to_string(),
        };
        self.acknowledged(device, &cmd).await
    }

    #[instrument(skip(self), fields(device = %device.id))]
    pub async fn close_app(
        &self,
        device: &DeviceDescriptor,
        app_id: &str,
    ) -> Result<(), ManagerError> {
        check_len("app_id", app_id)?;
        let cmd = Command::CloseApp {
            app_id: app_id.to_string(),
        };
        self.acknowledged(device, &cmd).await
    }

    /// Removes an installed app.  An app the device does not know fails with
    /// the device's `AppNotFound`.
    #[instrument(skip(self), fields(device = %device.id))]
    pub async fn uninstall_app(
        &self,
        device: &DeviceDescriptor,
        app_id: &str,
    ) -> Result<(), ManagerError> {
        check_len("app_id", app_id)?;
        let cmd = Command::UninstallApp {
            app_id: app_id.to_string(),
        };
        self.acknowledged(device, &cmd).await
    }

    /// Downloads the package at `url` and installs it under `label`.
    ///
    /// Returns the app id the device assigned.  The download happens before
    /// any session is opened, so a failed download never touches the device.
    #[instrument(skip(self), fields(device = %device.id))]
    pub async fn install_packaged_app_from_url(
        &self,
        device: &DeviceDescriptor,
        url: &str,
        label: &str,
    ) -> Result<String, ManagerError> {
        check_len("label", label)?;
        let package = self.downloader.fetch(url).await?;
        if package.is_empty() {
            return Err(DownloadError::Empty {
                url: url.to_string(),
            }
            .into());
        }
        info!(bytes = package.len(), "package downloaded");

        let mut session = self.session(device);
        session.connect().await?;

        let mut job = InstallJob::new(package, label, self.install_settings.clone());
        let result = match job.run(&mut session).await {
            Ok(app_id) => Ok(app_id),
            Err(cause) => {
                let stage = job.stage();
                match job.fail() {
                    Some(action) => Err(self
                        .roll_back(&job, action, stage, cause, &mut session)
                        .await),
                    None => Err(cause),
                }
            }
        };
        session.disconnect().await;
        result
    }

    // ── Internals ─────────────────────────────────────────────────────────────

    fn session(&self, device: &DeviceDescriptor) -> DeviceSession {
        DeviceSession::new(
            Arc::clone(&self.transport),
            device.clone(),
            self.session_config.clone(),
        )
    }

    /// One session, one command.  The session is disconnected on every path.
    async fn run_once(
        &self,
        device: &DeviceDescriptor,
        cmd: &Command,
    ) -> Result<Response, ManagerError> {
        let mut session = self.session(device);
        let result = match session.connect().await {
            Ok(()) => session.execute(cmd).await,
            Err(e) => Err(e),
        };
        session.disconnect().await;
        result
    }

    /// [`run_once`](Self::run_once), plus one more attempt for a retryable
    /// command that timed out.
    async fn execute(
        &self,
        device: &DeviceDescriptor,
        cmd: &Command,
    ) -> Result<Response, ManagerError> {
        match self.run_once(device, cmd).await {
            Err(e) if e.is_timeout() && cmd.kind().is_retryable() => {
                warn!("{} timed out, retrying once: {e}", cmd.kind());
                self.run_once(device, cmd).await
            }
            other => other,
        }
    }

    async fn app_list(
        &self,
        device: &DeviceDescriptor,
        cmd: Command,
    ) -> Result<Vec<AppDescriptor>, ManagerError> {
        match self.execute(device, &cmd).await? {
            Response::AppList(apps) => Ok(apps),
            other => Err(unexpected_response(cmd.kind(), &other)),
        }
    }

    async fn acknowledged(
        &self,
        device: &DeviceDescriptor,
        cmd: &Command,
    ) -> Result<(), ManagerError> {
        match self.execute(device, cmd).await? {
            Response::Ack => Ok(()),
            other => Err(unexpected_response(cmd.kind(), &other)),
        }
    }

    async fn roll_back(
        &self,
        job: &InstallJob,
        action: CompensatingAction,
        stage: InstallStage,
        cause: ManagerError,
        session: &mut DeviceSession,
    ) -> ManagerError {
        warn!(upload_id = %job.upload_id(), %stage, "install failed, rolling back: {cause}");

        let cleanup = if session.is_ready() {
            job.compensate(action, session).await
        } else {
            session.disconnect().await;
            let mut fresh = self.session(session.device());
            let outcome = match fresh.connect().await {
                Ok(()) => job.compensate(action, &mut fresh).await,
                Err(e) => Err(e),
            };
            fresh.disconnect().await;
            outcome
        };

        match cleanup {
            Ok(()) => {
                info!(upload_id = %job.upload_id(), %stage, "partial upload removed");
                cause
            }
            Err(cleanup) => {
                warn!(upload_id = %job.upload_id(), "rollback failed: {cleanup}");
                ManagerError::CleanupFailed {
                    stage,
                    cause: Box::new(cause),
                    cleanup: Box::new(cleanup),
                }
            }
        }
    }
}

/// Rejects strings the wire format would have to cut short.
fn check_len(field: &'static str, value: &str) -> Result<(), ManagerError> {
    if value.len() > MAX_STRING_LEN {
        return Err(ManagerError::ArgumentTooLong {
            field,
            len: value.len(),
            max: MAX_STRING_LEN,
        });
    }
    Ok(())
}
