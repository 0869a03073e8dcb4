//! Staged package install.
//!
//! An [`InstallJob`] drives one package through
//! `Uploading → Installing → Verifying → Done` on an already connected
//! session:
//!
//! 1. **Uploading** – the package is streamed as `UploadChunk` commands, each
//!    acknowledged with the running byte count.
//! 2. **Installing** – `InstallApp` asks the device to install the artifact.
//! 3. **Verifying** – `QueryInstall` is polled until the device reports the
//!    installed app id, or the install timeout runs out.
//!
//! The job records the stage it reached, so when a step fails the caller
//! knows which [`CompensatingAction`] to run.  Running it is
//! [`InstallJob::compensate`]; deciding which session to run it on belongs
//! to the app manager.

use std::time::Duration;

use bytes::Bytes;
use devlink_core::protocol::MAX_PAYLOAD_LEN;
use devlink_core::{
    Command, CommandKind, CompensatingAction, DecodeError, DeviceErrorCode, InstallStage,
    InstallStatus, Response,
};
use tokio::time::Instant;
use tracing::{debug, info};
use uuid::Uuid;

use crate::application::error::ManagerError;
use crate::application::session::{unexpected_response, DeviceSession};

/// Payload bytes of an `UploadChunk` frame that are not package data:
/// upload id, offset, total length, and the data length prefix.
const UPLOAD_CHUNK_OVERHEAD: usize = 16 + 8 + 8 + 4;

/// Largest chunk that still fits in one frame.
pub const MAX_UPLOAD_CHUNK: usize = MAX_PAYLOAD_LEN - UPLOAD_CHUNK_OVERHEAD;

/// Tuning for the install workflow.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InstallSettings {
    /// Bytes per `UploadChunk`; clamped to `1..=MAX_UPLOAD_CHUNK`.
    pub chunk_size: usize,
    /// Pause between `QueryInstall` polls.
    pub poll_interval: Duration,
    /// Total time allowed for verification.
    pub install_timeout: Duration,
}

impl Default for InstallSettings {
    fn default() -> Self {
        Self {
            chunk_size: 64 * 1024,
            poll_interval: Duration::from_millis(500),
            install_timeout: Duration::from_secs(120),
        }
    }
}

impl InstallSettings {
    fn effective_chunk_size(&self) -> usize {
        self.chunk_size.clamp(1, MAX_UPLOAD_CHUNK)
    }
}

/// Ephemeral state of one package install.  Never persisted.
#[derive(Debug)]
pub struct InstallJob {
    upload_id: Uuid,
    label: String,
    package: Bytes,
    stage: InstallStage,
    settings: InstallSettings,
}

impl InstallJob {
    /// Creates a job in the `Uploading` stage with a fresh upload id.
    pub fn new(package: Bytes, label: impl Into<String>, settings: InstallSettings) -> Self {
        Self {
            upload_id: Uuid::new_v4(),
            label: label.into(),
            package,
            stage: InstallStage::Uploading,
            settings,
        }
    }

    pub fn upload_id(&self) -> Uuid {
        self.upload_id
    }

    pub fn stage(&self) -> InstallStage {
        self.stage
    }

    /// Runs every stage on `session` and returns the installed app id.
    ///
    /// # Errors
    ///
    /// Returns the first failure; [`stage`](Self::stage) then names the
    /// stage that failed.
    pub async fn run(&mut self, session: &mut DeviceSession) -> Result<String, ManagerError> {
        self.upload(session).await?;
        self.advance();

        let status = self.start_install(session).await?;
        self.advance();

        let app_id = match status {
            InstallStatus::Installed { app_id } => app_id,
            InstallStatus::Pending => self.verify(session).await?,
        };
        self.advance();

        info!(upload_id = %self.upload_id, %app_id, "install complete");
        Ok(app_id)
    }

    /// Marks the job failed and returns the action that undoes the stage it
    /// failed in.
    pub fn fail(&mut self) -> Option<CompensatingAction> {
        let action = self.stage.compensation();
        self.stage = InstallStage::Failed;
        action
    }

    /// Runs `action` on `session`.
    ///
    /// A device that no longer knows the upload has nothing to clean up, so
    /// `UnknownUpload` counts as success.
    pub async fn compensate(
        &self,
        action: CompensatingAction,
        session: &mut DeviceSession,
    ) -> Result<(), ManagerError> {
        match action {
            CompensatingAction::AbortUpload => {
                let cmd = Command::AbortUpload {
                    upload_id: self.upload_id,
                };
                match session.execute(&cmd).await {
                    Ok(Response::Ack) => {
                        debug!(upload_id = %self.upload_id, "upload aborted");
                        Ok(())
                    }
                    Ok(other) => Err(unexpected_response(CommandKind::AbortUpload, &other)),
                    Err(e)
                        if e.device_error().map(|d| d.code)
                            == Some(DeviceErrorCode::UnknownUpload) =>
                    {
                        debug!(upload_id = %self.upload_id, "nothing to abort");
                        Ok(())
                    }
                    Err(e) => Err(e),
                }
            }
        }
    }

    fn advance(&mut self) {
        if let Some(next) = self.stage.next() {
            debug!(upload_id = %self.upload_id, "install stage: {} -> {next}", self.stage);
            self.stage = next;
        }
    }

    async fn upload(&self, session: &mut DeviceSession) -> Result<(), ManagerError> {
        let total_len = self.package.len() as u64;
        let chunk_size = self.settings.effective_chunk_size();

        for (index, chunk) in self.package.chunks(chunk_size).enumerate() {
            let offset = (index * chunk_size) as u64;
            let expected = offset + chunk.len() as u64;
            let cmd = Command::UploadChunk {
                upload_id: self.upload_id,
                offset,
                total_len,
                data: chunk.to_vec(),
            };
            match session.execute(&cmd).await? {
                Response::UploadAck {
                    upload_id,
                    received,
                } if upload_id == self.upload_id && received == expected => {
                    debug!(received, total_len, "chunk acknowledged");
                }
                Response::UploadAck { received, .. } => {
                    return Err(DecodeError::Malformed(format!(
                        "device acknowledged {received} bytes, expected {expected}"
                    ))
                    .into());
                }
                other => return Err(unexpected_response(CommandKind::UploadChunk, &other)),
            }
        }
        info!(upload_id = %self.upload_id, bytes = total_len, "upload complete");
        Ok(())
    }

    async fn start_install(
        &self,
        session: &mut DeviceSession,
    ) -> Result<InstallStatus, ManagerError> {
        let cmd = Command::InstallApp {
            upload_id: self.upload_id,
            label: self.label.clone(),
        };
        match session.execute(&cmd).await? {
            Response::InstallStatus(status) => Ok(status),
            other => Err(unexpected_response(CommandKind::InstallApp, &other)),
        }
    }

    async fn verify(&self, session: &mut DeviceSession) -> Result<String, ManagerError> {
        let deadline = Instant::now() + self.settings.install_timeout;
        let cmd = Command::QueryInstall {
            upload_id: self.upload_id,
        };
        loop {
            tokio::time::sleep(self.settings.poll_interval).await;
            match session.execute(&cmd).await? {
                Response::InstallStatus(InstallStatus::Installed { app_id }) => return Ok(app_id),
                Response::InstallStatus(InstallStatus::Pending) => {}
                other => return Err(unexpected_response(CommandKind::QueryInstall, &other)),
            }
            if Instant::now() >= deadline {
                return Err(ManagerError::CommandTimeout {
                    command: CommandKind::QueryInstall,
                    timeout: self.settings.install_timeout,
                });
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    use devlink_core::{DeviceDescriptor, DeviceInfo};

    use crate::application::session::SessionConfig;
    use crate::infrastructure::transport::SimulatedDevice;

    fn settings(chunk_size: usize) -> InstallSettings {
        InstallSettings {
            chunk_size,
            poll_interval: Duration::from_millis(1),
            install_timeout: Duration::from_millis(200),
        }
    }

    async fn connected(device: &SimulatedDevice) -> DeviceSession {
        let mut session = DeviceSession::new(
            Arc::new(device.clone()),
            DeviceDescriptor::new("sim", "sim://0"),
            SessionConfig {
                command_timeout: Duration::from_millis(100),
                ..SessionConfig::default()
            },
        );
        session.connect().await.expect("connect");
        session
    }

    fn device() -> SimulatedDevice {
        SimulatedDevice::new(DeviceInfo {
            model: "Test".to_string(),
            os_version: "1".to_string(),
            device_id: "T-1".to_string(),
        })
    }

    #[tokio::test]
    async fn test_package_is_split_into_chunks() {
        // Arrange: 10 bytes in chunks of 4 → 3 UploadChunk commands
        let device = device();
        let mut session = connected(&device).await;
        let mut job = InstallJob::new(Bytes::from_static(b"0123456789"), "Clock", settings(4));

        // Act
        let app_id = job.run(&mut session).await.expect("install");

        // Assert
        assert_eq!(app_id, "app://clock");
        assert_eq!(job.stage(), InstallStage::Done);
        let stats = device.stats();
        assert_eq!(stats.count(CommandKind::UploadChunk), 3);
        assert_eq!(stats.count(CommandKind::InstallApp), 1);
        assert_eq!(stats.count(CommandKind::QueryInstall), 1);
    }

    #[tokio::test]
    async fn test_immediate_install_skips_polling() {
        let device = device();
        device.install_polls(0);
        let mut session = connected(&device).await;
        let mut job = InstallJob::new(Bytes::from_static(b"pkg"), "notes", settings(1024));

        job.run(&mut session).await.expect("install");

        assert_eq!(device.stats().count(CommandKind::QueryInstall), 0);
    }

    #[tokio::test]
    async fn test_install_that_never_completes_times_out_while_verifying() {
        // Arrange
        let device = device();
        device.install_polls(u32::MAX);
        let mut session = connected(&device).await;
        let mut job = InstallJob::new(Bytes::from_static(b"pkg"), "slow", settings(1024));

        // Act
        let err = job.run(&mut session).await.unwrap_err();

        // Assert
        assert!(matches!(
            err,
            ManagerError::CommandTimeout {
                command: CommandKind::QueryInstall,
                ..
            }
        ));
        assert_eq!(job.stage(), InstallStage::Verifying);
        assert!(session.is_ready(), "polling timeout leaves the link usable");
    }

    #[tokio::test]
    async fn test_rejected_install_fails_in_installing_stage_and_compensates() {
        // Arrange
        let device = device();
        device.reject_install(DeviceErrorCode::SignatureInvalid);
        let mut session = connected(&device).await;
        let mut job = InstallJob::new(Bytes::from_static(b"pkg"), "bad", settings(1024));

        // Act
        let err = job.run(&mut session).await.unwrap_err();
        let failed_in = job.stage();
        let action = job.fail().expect("compensation");
        job.compensate(action, &mut session).await.expect("abort");

        // Assert
        assert_eq!(
            err.device_error().map(|d| d.code),
            Some(DeviceErrorCode::SignatureInvalid)
        );
        assert_eq!(failed_in, InstallStage::Installing);
        assert_eq!(job.stage(), InstallStage::Failed);
        assert_eq!(device.pending_uploads(), 0);
    }

    #[tokio::test]
    async fn test_compensating_unknown_upload_is_success() {
        let device = device();
        let mut session = connected(&device).await;
        let job = InstallJob::new(Bytes::from_static(b"pkg"), "never-sent", settings(1024));

        let result = job
            .compensate(CompensatingAction::AbortUpload, &mut session)
            .await;

        assert!(result.is_ok());
    }

    #[test]
    fn test_chunk_size_is_clamped_to_frame_limit() {
        assert_eq!(settings(0).effective_chunk_size(), 1);
        assert_eq!(settings(usize::MAX).effective_chunk_size(), MAX_UPLOAD_CHUNK);
    }
}
