//! The closed error taxonomy returned by every devlink operation.
//!
//! Callers match on [`ManagerError`] directly, or use [`ManagerError::kind`]
//! when the error has to cross a process boundary as a plain string.

use std::time::Duration;

use devlink_core::{CommandKind, DecodeError, DeviceErrorCode, DeviceFailure, InstallStage};
use thiserror::Error;

use crate::application::download::DownloadError;
use crate::application::session::SessionState;
use crate::application::transport::{ConnectError, LinkError};

/// The device understood a command and refused it.
///
/// The device's own code and message are preserved verbatim.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("device rejected {command}: {code}: {message}")]
pub struct DeviceError {
    /// The command the device rejected.
    pub command: CommandKind,
    pub code: DeviceErrorCode,
    pub message: String,
}

impl DeviceError {
    pub fn from_failure(command: CommandKind, failure: DeviceFailure) -> Self {
        Self {
            command,
            code: failure.code,
            message: failure.message,
        }
    }
}

/// Every way a device operation can fail.
#[derive(Debug, Error)]
pub enum ManagerError {
    #[error("cannot connect: {0}")]
    Connect(#[from] ConnectError),

    #[error("link failure: {0}")]
    Link(#[from] LinkError),

    #[error("protocol error: {0}")]
    Decode(#[from] DecodeError),

    /// No complete response arrived within the command timeout.
    #[error("{command} timed out after {timeout:?}")]
    CommandTimeout {
        command: CommandKind,
        timeout: Duration,
    },

    #[error(transparent)]
    Device(#[from] DeviceError),

    #[error(transparent)]
    Download(#[from] DownloadError),

    /// The session was asked to do something its current state forbids.
    #[error("cannot {operation} while session is {state}")]
    InvalidState {
        operation: &'static str,
        state: SessionState,
    },

    /// A string argument is longer than a protocol string field can carry.
    #[error("{field} is {len} bytes, longer than the {max}-byte limit")]
    ArgumentTooLong {
        field: &'static str,
        len: usize,
        max: usize,
    },

    /// The device identifier is not in the configured registry.
    #[error("unknown device {0:?}")]
    UnknownDevice(String),

    /// An install failed after the upload began and removing the partial
    /// artifact failed too.  The device may hold leftover data.
    #[error("install failed while {stage} ({cause}); cleanup also failed: {cleanup}")]
    CleanupFailed {
        stage: InstallStage,
        cause: Box<ManagerError>,
        cleanup: Box<ManagerError>,
    },
}

impl ManagerError {
    /// Stable machine-readable name of the error category.
    pub fn kind(&self) -> &'static str {
        match self {
            ManagerError::Connect(_) => "connect",
            ManagerError::Link(_) => "link",
            ManagerError::Decode(_) => "decode",
            ManagerError::CommandTimeout { .. } => "command_timeout",
            ManagerError::Device(_) => "device",
            ManagerError::Download(_) => "download",
            ManagerError::InvalidState { .. } => "invalid_state",
            ManagerError::ArgumentTooLong { .. } => "argument_too_long",
            ManagerError::UnknownDevice(_) => "unknown_device",
            ManagerError::CleanupFailed { .. } => "cleanup_failed",
        }
    }

    /// Returns `true` for a command that went unanswered in time.
    pub fn is_timeout(&self) -> bool {
        matches!(self, ManagerError::CommandTimeout { .. })
    }

    /// The device's own rejection, if one is at the root of this error.
    ///
    /// Looks through [`ManagerError::CleanupFailed`], so an install the device
    /// refused still reports the device's code when its cleanup failed too.
    pub fn device_error(&self) -> Option<&DeviceError> {
        match self {
            ManagerError::Device(e) => Some(e),
            ManagerError::CleanupFailed { cause, .. } => cause.device_error(),
            _ => None,
        }
    }

    /// The install stage that failed, for a failed cleanup.
    pub fn install_stage(&self) -> Option<InstallStage> {
        match self {
            ManagerError::CleanupFailed { stage, .. } => Some(*stage),
            _ => None,
        }
    }
}
