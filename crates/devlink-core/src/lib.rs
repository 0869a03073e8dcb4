//! # devlink-core
//!
//! Shared library for devlink containing the device control protocol codec,
//! the command/response message types, and the domain entities used by the
//! install workflow.
//!
//! It has zero dependencies on OS APIs, async runtimes, or network sockets.
//! Everything here is pure data transformation, so it can be tested without a
//! device attached.
//!
//! # Architecture overview
//!
//! devlink manages applications on a connected device: it queries device
//! metadata, lists running and installed apps, installs packages, and
//! launches, closes or uninstalls apps.  Every interaction is a short-lived
//! request/response conversation over a byte channel.
//!
//! - **`protocol`** – How bytes travel over the link.  Commands and responses
//!   are encoded into a compact binary frame (16-byte header + payload) and
//!   decoded back into typed Rust values on the other end.  A
//!   [`FrameDecoder`] reassembles frames that arrive split across reads.
//!
//! - **`domain`** – Device descriptors and the install stage machine.

pub mod domain;
pub mod protocol;

pub use domain::device::{DeviceDescriptor, DeviceId};
pub use domain::install::{CompensatingAction, InstallStage};
pub use protocol::codec::{
    command_from_frame, decode_command, decode_response, encode_command, encode_response,
    response_from_frame, DecodeError, Frame, FrameDecoder,
};
pub use protocol::messages::{
    AppDescriptor, Command, CommandKind, DeviceErrorCode, DeviceFailure, DeviceInfo,
    InstallStatus, Response, MAX_STRING_LEN,
};
