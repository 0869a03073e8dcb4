//! All devlink protocol message types.
//!
//! The host sends [`Command`]s; the device answers each with exactly one
//! [`Response`].  Message type codes below `0x80` are commands, codes from
//! `0x80` up are responses.

use std::fmt;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

// ── Protocol constants ────────────────────────────────────────────────────────

/// Current protocol version byte.
pub const PROTOCOL_VERSION: u8 = 0x01;

/// Total size of the common frame header in bytes.
pub const HEADER_SIZE: usize = 16;

/// Largest payload a frame may declare.  Anything bigger is treated as a
/// corrupted header rather than a reason to allocate.
pub const MAX_PAYLOAD_LEN: usize = 1024 * 1024;

/// Longest string field, in UTF-8 bytes, the 2-byte length prefix can carry.
pub const MAX_STRING_LEN: usize = u16::MAX as usize;

// ── Message type codes ────────────────────────────────────────────────────────

/// All message type codes carried in the frame header.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[repr(u8)]
pub enum MessageType {
    // Commands (0x01–0x7F)
    Hello = 0x01,
    GetDeviceInfo = 0x02,
    ListRunningApps = 0x03,
    ListInstalledApps = 0x04,
    UploadChunk = 0x05,
    InstallApp = 0x06,
    QueryInstall = 0x07,
    AbortUpload = 0x08,
    UninstallApp = 0x09,
    LaunchApp = 0x0A,
    CloseApp = 0x0B,
    // Responses (0x80–0xFF)
    HelloAck = 0x81,
    DeviceInfo = 0x82,
    AppList = 0x83,
    Ack = 0x84,
    UploadAck = 0x85,
    InstallStatus = 0x86,
    Failure = 0xFF,
}

impl TryFrom<u8> for MessageType {
    type Error = ();

    fn try_from(value: u8) -> Result<Self, ()> {
        match value {
            0x01 => Ok(MessageType::Hello),
            0x02 => Ok(MessageType::GetDeviceInfo),
            0x03 => Ok(MessageType::ListRunningApps),
            0x04 => Ok(MessageType::ListInstalledApps),
            0x05 => Ok(MessageType::UploadChunk),
            0x06 => Ok(MessageType::InstallApp),
            0x07 => Ok(MessageType::QueryInstall),
            0x08 => Ok(MessageType::AbortUpload),
            0x09 => Ok(MessageType::UninstallApp),
            0x0A => Ok(MessageType::LaunchApp),
            0x0B => Ok(MessageType::CloseApp),
            0x81 => Ok(MessageType::HelloAck),
            0x82 => Ok(MessageType::DeviceInfo),
            0x83 => Ok(MessageType::AppList),
            0x84 => Ok(MessageType::Ack),
            0x85 => Ok(MessageType::UploadAck),
            0x86 => Ok(MessageType::InstallStatus),
            0xFF => Ok(MessageType::Failure),
            _ => Err(()),
        }
    }
}

// ── Commands ──────────────────────────────────────────────────────────────────

/// The kind of a [`Command`], without its parameters.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum CommandKind {
    Hello,
    GetDeviceInfo,
    ListRunningApps,
    ListInstalledApps,
    UploadChunk,
    InstallApp,
    QueryInstall,
    AbortUpload,
    UninstallApp,
    LaunchApp,
    CloseApp,
}

impl CommandKind {
    /// Returns `true` for the standalone queries, which may be resent once in
    /// a new session after a timeout.
    ///
    /// `Hello` and `QueryInstall` only occur inside a session or an install
    /// and are never resent on their own.
    pub fn is_retryable(self) -> bool {
        matches!(
            self,
            CommandKind::GetDeviceInfo
                | CommandKind::ListRunningApps
                | CommandKind::ListInstalledApps
        )
    }

    /// The response type a successful answer to this command carries.
    ///
    /// [`MessageType::Failure`] is acceptable for every command.
    pub fn expected_response(self) -> MessageType {
        match self {
            CommandKind::Hello => MessageType::HelloAck,
            CommandKind::GetDeviceInfo => MessageType::DeviceInfo,
            CommandKind::ListRunningApps | CommandKind::ListInstalledApps => MessageType::AppList,
            CommandKind::UploadChunk => MessageType::UploadAck,
            CommandKind::InstallApp | CommandKind::QueryInstall => MessageType::InstallStatus,
            CommandKind::AbortUpload
            | CommandKind::UninstallApp
            | CommandKind::LaunchApp
            | CommandKind::CloseApp => MessageType::Ack,
        }
    }

    /// The header code this command is sent with.
    pub fn message_type(self) -> MessageType {
        match self {
            CommandKind::Hello => MessageType::Hello,
            CommandKind::GetDeviceInfo => MessageType::GetDeviceInfo,
            CommandKind::ListRunningApps => MessageType::ListRunningApps,
            CommandKind::ListInstalledApps => MessageType::ListInstalledApps,
            CommandKind::UploadChunk => MessageType::UploadChunk,
            CommandKind::InstallApp => MessageType::InstallApp,
            CommandKind::QueryInstall => MessageType::QueryInstall,
            CommandKind::AbortUpload => MessageType::AbortUpload,
            CommandKind::UninstallApp => MessageType::UninstallApp,
            CommandKind::LaunchApp => MessageType::LaunchApp,
            CommandKind::CloseApp => MessageType::CloseApp,
        }
    }
}

impl fmt::Display for CommandKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

/// A request sent from the host to the device.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command {
    /// Version handshake sent once per session right after the link opens.
    Hello {
        protocol_version: u8,
        client_name: String,
    },
    GetDeviceInfo,
    ListRunningApps,
    ListInstalledApps,
    /// One chunk of a package upload.  `offset` is the position of `data`
    /// within the whole package of `total_len` bytes.
    UploadChunk {
        upload_id: Uuid,
        offset: u64,
        total_len: u64,
        data: Vec<u8>,
    },
    /// Install the fully uploaded artifact `upload_id`.
    InstallApp { upload_id: Uuid, label: String },
    /// Ask whether the install started from `upload_id` has completed.
    QueryInstall { upload_id: Uuid },
    /// Discard the artifact `upload_id` and cancel any install started from it.
    AbortUpload { upload_id: Uuid },
    UninstallApp { app_id: String },
    LaunchApp { app_id: String },
    CloseApp { app_id: String },
}

impl Command {
    /// Returns the parameterless kind of this command.
    pub fn kind(&self) -> CommandKind {
        match self {
            Command::Hello { .. } => CommandKind::Hello,
            Command::GetDeviceInfo => CommandKind::GetDeviceInfo,
            Command::ListRunningApps => CommandKind::ListRunningApps,
            Command::ListInstalledApps => CommandKind::ListInstalledApps,
            Command::UploadChunk { .. } => CommandKind::UploadChunk,
            Command::InstallApp { .. } => CommandKind::InstallApp,
            Command::QueryInstall { .. } => CommandKind::QueryInstall,
            Command::AbortUpload { .. } => CommandKind::AbortUpload,
            Command::UninstallApp { .. } => CommandKind::UninstallApp,
            Command::LaunchApp { .. } => CommandKind::LaunchApp,
            Command::CloseApp { .. } => CommandKind::CloseApp,
        }
    }

    /// Returns the header code for this command.
    pub fn message_type(&self) -> MessageType {
        self.kind().message_type()
    }
}

// ── Responses ─────────────────────────────────────────────────────────────────

/// Immutable snapshot of device metadata.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeviceInfo {
    /// Hardware model name, e.g. `"Nokia 8110 4G"`.
    pub model: String,
    /// OS / firmware version string.
    pub os_version: String,
    /// Unique device identifier (serial number or IMEI-derived id).
    pub device_id: String,
}

/// One application as reported by the device.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AppDescriptor {
    /// Stable identifier, distinct from the display name.
    pub app_id: String,
    /// Human-readable display name.
    pub name: String,
    /// Version string as declared by the app manifest.
    pub version: String,
    /// Whether the app is currently running.
    pub running: bool,
}

/// Progress of an install started with [`Command::InstallApp`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum InstallStatus {
    /// The device is still installing.
    Pending,
    /// The install completed and the app is registered as `app_id`.
    Installed { app_id: String },
}

/// Application-level error codes reported by the device.
///
/// Unknown codes are preserved in [`DeviceErrorCode::Other`] rather than
/// collapsed into a generic failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum DeviceErrorCode {
    AppNotFound,
    OperationRefused,
    StorageFull,
    SignatureInvalid,
    UnknownUpload,
    InvalidPackage,
    Busy,
    Other(u16),
}

impl DeviceErrorCode {
    /// Maps a wire code to its variant.
    pub fn from_u16(code: u16) -> Self {
        match code {
            0x0001 => DeviceErrorCode::AppNotFound,
            0x0002 => DeviceErrorCode::OperationRefused,
            0x0003 => DeviceErrorCode::StorageFull,
            0x0004 => DeviceErrorCode::SignatureInvalid,
            0x0005 => DeviceErrorCode::UnknownUpload,
            0x0006 => DeviceErrorCode::InvalidPackage,
            0x0007 => DeviceErrorCode::Busy,
            other => DeviceErrorCode::Other(other),
        }
    }

    /// Returns the wire code.
    pub fn as_u16(self) -> u16 {
        match self {
            DeviceErrorCode::AppNotFound => 0x0001,
            DeviceErrorCode::OperationRefused => 0x0002,
            DeviceErrorCode::StorageFull => 0x0003,
            DeviceErrorCode::SignatureInvalid => 0x0004,
            DeviceErrorCode::UnknownUpload => 0x0005,
            DeviceErrorCode::InvalidPackage => 0x0006,
            DeviceErrorCode::Busy => 0x0007,
            DeviceErrorCode::Other(code) => code,
        }
    }
}

impl fmt::Display for DeviceErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DeviceErrorCode::Other(code) => write!(f, "error 0x{code:04X}"),
            known => write!(f, "{known:?}"),
        }
    }
}

/// A structured rejection reported by the device.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeviceFailure {
    pub code: DeviceErrorCode,
    pub message: String,
}

impl DeviceFailure {
    pub fn new(code: DeviceErrorCode, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
        }
    }
}

/// A reply sent from the device to the host.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Response {
    /// Answer to [`Command::Hello`].
    HelloAck { protocol_version: u8, accepted: bool },
    DeviceInfo(DeviceInfo),
    /// Answer to both listing commands, in device-reported order.
    AppList(Vec<AppDescriptor>),
    /// Generic success with no payload.
    Ack,
    /// Answer to [`Command::UploadChunk`]: total bytes the device now holds.
    UploadAck { upload_id: Uuid, received: u64 },
    InstallStatus(InstallStatus),
    /// The device rejected the command.
    Failure(DeviceFailure),
}

impl Response {
    /// Returns the header code for this response.
    pub fn message_type(&self) -> MessageType {
        match self {
            Response::HelloAck { .. } => MessageType::HelloAck,
            Response::DeviceInfo(_) => MessageType::DeviceInfo,
            Response::AppList(_) => MessageType::AppList,
            Response::Ack => MessageType::Ack,
            Response::UploadAck { .. } => MessageType::UploadAck,
            Response::InstallStatus(_) => MessageType::InstallStatus,
            Response::Failure(_) => MessageType::Failure,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_message_type_round_trips_through_u8() {
        for t in [
            MessageType::Hello,
            MessageType::UploadChunk,
            MessageType::CloseApp,
            MessageType::HelloAck,
            MessageType::InstallStatus,
            MessageType::Failure,
        ] {
            assert_eq!(MessageType::try_from(t as u8), Ok(t));
        }
    }

    #[test]
    fn test_unknown_message_type_is_rejected() {
        assert!(MessageType::try_from(0x50).is_err());
        assert!(MessageType::try_from(0x00).is_err());
    }

    #[test]
    fn test_only_standalone_queries_are_retryable() {
        assert!(CommandKind::GetDeviceInfo.is_retryable());
        assert!(CommandKind::ListRunningApps.is_retryable());
        assert!(CommandKind::ListInstalledApps.is_retryable());
        assert!(!CommandKind::Hello.is_retryable());
        assert!(!CommandKind::QueryInstall.is_retryable());
        assert!(!CommandKind::InstallApp.is_retryable());
        assert!(!CommandKind::UninstallApp.is_retryable());
        assert!(!CommandKind::LaunchApp.is_retryable());
        assert!(!CommandKind::CloseApp.is_retryable());
        assert!(!CommandKind::UploadChunk.is_retryable());
    }

    #[test]
    fn test_listing_commands_expect_app_list() {
        assert_eq!(
            CommandKind::ListRunningApps.expected_response(),
            MessageType::AppList
        );
        assert_eq!(
            CommandKind::ListInstalledApps.expected_response(),
            MessageType::AppList
        );
        assert_eq!(CommandKind::CloseApp.expected_response(), MessageType::Ack);
    }

    #[test]
    fn test_command_kind_matches_message_type() {
        let cmd = Command::LaunchApp {
            app_id: "app://clock".to_string(),
        };
        assert_eq!(cmd.kind(), CommandKind::LaunchApp);
        assert_eq!(cmd.message_type(), MessageType::LaunchApp);
    }

    #[test]
    fn test_device_error_code_preserves_unknown_values() {
        let code = DeviceErrorCode::from_u16(0x0BAD);
        assert_eq!(code, DeviceErrorCode::Other(0x0BAD));
        assert_eq!(code.as_u16(), 0x0BAD);
        assert_eq!(code.to_string(), "error 0x0BAD");
    }

    #[test]
    fn test_device_error_code_known_values_round_trip() {
        for code in [
            DeviceErrorCode::AppNotFound,
            DeviceErrorCode::OperationRefused,
            DeviceErrorCode::StorageFull,
            DeviceErrorCode::SignatureInvalid,
            DeviceErrorCode::UnknownUpload,
            DeviceErrorCode::InvalidPackage,
            DeviceErrorCode::Busy,
        ] {
            assert_eq!(DeviceErrorCode::from_u16(code.as_u16()), code);
        }
    }
}
