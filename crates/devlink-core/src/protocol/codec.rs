//! Binary codec for encoding and decoding devlink protocol frames.
//!
//! Wire format:
//! ```text
//! [version:1][msg_type:1][flags:2][payload_len:4][request_id:8][payload:N]
//! ```
//! Total header size: 16 bytes. All multi-byte integers are big-endian.
//! Strings carry a 2-byte length prefix, byte blobs a 4-byte length prefix,
//! UUIDs are 16 raw bytes.
//!
//! Every response echoes the `request_id` of the command it answers.  The
//! `flags` field is reserved: written as zero, ignored on decode.
//!
//! # Streams
//!
//! A single `receive` from the transport may return part of a frame, or
//! several frames at once.  [`FrameDecoder`] accumulates bytes and hands out
//! complete [`Frame`]s; the typed decode functions then turn a frame into a
//! [`Command`] or [`Response`].

use thiserror::Error;
use uuid::Uuid;

use crate::protocol::messages::{
    AppDescriptor, Command, CommandKind, DeviceErrorCode, DeviceFailure, DeviceInfo,
    InstallStatus, MessageType, Response, HEADER_SIZE, MAX_PAYLOAD_LEN, MAX_STRING_LEN,
    PROTOCOL_VERSION,
};

/// Errors that can occur while decoding frames.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum DecodeError {
    /// The data ended before a complete frame or field was available.
    #[error("truncated data: need {needed} bytes, got {available}")]
    Truncated { needed: usize, available: usize },

    /// The bytes do not form a valid frame (bad version, unknown type, invalid
    /// field value, oversized length, trailing garbage, ...).
    #[error("malformed frame: {0}")]
    Malformed(String),

    /// A well-formed response arrived, but not the one the command calls for.
    #[error("unexpected response to {expected}: got {got:?}")]
    UnexpectedKind {
        expected: CommandKind,
        got: MessageType,
    },
}

/// One complete frame split into header fields and raw payload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    pub message_type: MessageType,
    pub request_id: u64,
    pub payload: Vec<u8>,
}

// ── Public API ────────────────────────────────────────────────────────────────

/// Encodes a [`Command`] into a complete frame.
///
/// Pure and total: every well-formed command encodes.
///
/// # Examples
///
/// ```rust
/// use devlink_core::protocol::{decode_command, encode_command, Command};
///
/// let cmd = Command::LaunchApp { app_id: "app://clock".into() };
/// let bytes = encode_command(&cmd, 7);
/// let (decoded, request_id, consumed) = decode_command(&bytes).unwrap();
/// assert_eq!(decoded, cmd);
/// assert_eq!(request_id, 7);
/// assert_eq!(consumed, bytes.len());
/// ```
pub fn encode_command(cmd: &Command, request_id: u64) -> Vec<u8> {
    let mut payload = Vec::new();
    match cmd {
        Command::Hello {
            protocol_version,
            client_name,
        } => {
            payload.push(*protocol_version);
            write_length_prefixed_string(&mut payload, client_name);
        }
        Command::GetDeviceInfo | Command::ListRunningApps | Command::ListInstalledApps => {}
        Command::UploadChunk {
            upload_id,
            offset,
            total_len,
            data,
        } => {
            payload.extend_from_slice(upload_id.as_bytes());
            payload.extend_from_slice(&offset.to_be_bytes());
            payload.extend_from_slice(&total_len.to_be_bytes());
            write_blob(&mut payload, data);
        }
        Command::InstallApp { upload_id, label } => {
            payload.extend_from_slice(upload_id.as_bytes());
            write_length_prefixed_string(&mut payload, label);
        }
        Command::QueryInstall { upload_id } | Command::AbortUpload { upload_id } => {
            payload.extend_from_slice(upload_id.as_bytes());
        }
        Command::UninstallApp { app_id }
        | Command::LaunchApp { app_id }
        | Command::CloseApp { app_id } => {
            write_length_prefixed_string(&mut payload, app_id);
        }
    }
    encode_frame(cmd.message_type(), request_id, &payload)
}

/// Encodes a [`Response`] into a complete frame.  Used by the device side.
pub fn encode_response(resp: &Response, request_id: u64) -> Vec<u8> {
    let mut payload = Vec::new();
    match resp {
        Response::HelloAck {
            protocol_version,
            accepted,
        } => {
            payload.push(*protocol_version);
            payload.push(u8::from(*accepted));
        }
        Response::DeviceInfo(info) => {
            write_length_prefixed_string(&mut payload, &info.model);
            write_length_prefixed_string(&mut payload, &info.os_version);
            write_length_prefixed_string(&mut payload, &info.device_id);
        }
        Response::AppList(apps) => {
            let count = apps.len().min(u16::MAX as usize);
            payload.extend_from_slice(&(count as u16).to_be_bytes());
            for app in &apps[..count] {
                write_length_prefixed_string(&mut payload, &app.app_id);
                write_length_prefixed_string(&mut payload, &app.name);
                write_length_prefixed_string(&mut payload, &app.version);
                payload.push(u8::from(app.running));
            }
        }
        Response::Ack => {}
        Response::UploadAck {
            upload_id,
            received,
        } => {
            payload.extend_from_slice(upload_id.as_bytes());
            payload.extend_from_slice(&received.to_be_bytes());
        }
        Response::InstallStatus(status) => match status {
            InstallStatus::Pending => {
                payload.push(0x00);
                write_length_prefixed_string(&mut payload, "");
            }
            InstallStatus::Installed { app_id } => {
                payload.push(0x01);
                write_length_prefixed_string(&mut payload, app_id);
            }
        },
        Response::Failure(failure) => {
            payload.extend_from_slice(&failure.code.as_u16().to_be_bytes());
            write_length_prefixed_string(&mut payload, &failure.message);
        }
    }
    encode_frame(resp.message_type(), request_id, &payload)
}

/// Decodes one command frame from the beginning of `bytes`.
///
/// Returns the command, its request id, and the number of bytes consumed.
///
/// # Errors
///
/// [`DecodeError::Truncated`] if `bytes` holds less than one frame,
/// [`DecodeError::Malformed`] for invalid content, and
/// [`DecodeError::UnexpectedKind`] is never returned here.
pub fn decode_command(bytes: &[u8]) -> Result<(Command, u64, usize), DecodeError> {
    let (frame, consumed) = split_complete_frame(bytes)?;
    let cmd = command_from_frame(&frame)?;
    Ok((cmd, frame.request_id, consumed))
}

/// Decodes one response frame from the beginning of `bytes`, checking that it
/// answers a command of kind `expected`.
///
/// Returns the response, its request id, and the number of bytes consumed.
///
/// # Errors
///
/// [`DecodeError::Truncated`] if the frame (or a field inside it) is cut
/// short, [`DecodeError::Malformed`] for invalid content, and
/// [`DecodeError::UnexpectedKind`] when the response type does not match
/// `expected`.
///
/// # Examples
///
/// ```rust
/// use devlink_core::protocol::{decode_response, encode_response, CommandKind, Response};
///
/// let bytes = encode_response(&Response::Ack, 3);
/// let (resp, request_id, _) = decode_response(&bytes, CommandKind::LaunchApp).unwrap();
/// assert_eq!(resp, Response::Ack);
/// assert_eq!(request_id, 3);
/// ```
pub fn decode_response(
    bytes: &[u8],
    expected: CommandKind,
) -> Result<(Response, u64, usize), DecodeError> {
    let (frame, consumed) = split_complete_frame(bytes)?;
    let resp = response_from_frame(&frame, expected)?;
    Ok((resp, frame.request_id, consumed))
}

/// Parses the payload of a command frame.
///
/// # Errors
///
/// Returns [`DecodeError::Malformed`] if the frame carries a response type.
pub fn command_from_frame(frame: &Frame) -> Result<Command, DecodeError> {
    let mut r = PayloadReader::new(&frame.payload);
    let cmd = match frame.message_type {
        MessageType::Hello => Command::Hello {
            protocol_version: r.read_u8("Hello.protocol_version")?,
            client_name: r.read_length_prefixed_string("Hello.client_name")?,
        },
        MessageType::GetDeviceInfo => Command::GetDeviceInfo,
        MessageType::ListRunningApps => Command::ListRunningApps,
        MessageType::ListInstalledApps => Command::ListInstalledApps,
        MessageType::UploadChunk => Command::UploadChunk {
            upload_id: r.read_uuid("UploadChunk.upload_id")?,
            offset: r.read_u64("UploadChunk.offset")?,
            total_len: r.read_u64("UploadChunk.total_len")?,
            data: r.read_blob("UploadChunk.data")?,
        },
        MessageType::InstallApp => Command::InstallApp {
            upload_id: r.read_uuid("InstallApp.upload_id")?,
            label: r.read_length_prefixed_string("InstallApp.label")?,
        },
        MessageType::QueryInstall => Command::QueryInstall {
            upload_id: r.read_uuid("QueryInstall.upload_id")?,
        },
        MessageType::AbortUpload => Command::AbortUpload {
            upload_id: r.read_uuid("AbortUpload.upload_id")?,
        },
        MessageType::UninstallApp => Command::UninstallApp {
            app_id: r.read_length_prefixed_string("UninstallApp.app_id")?,
        },
        MessageType::LaunchApp => Command::LaunchApp {
            app_id: r.read_length_prefixed_string("LaunchApp.app_id")?,
        },
        MessageType::CloseApp => Command::CloseApp {
            app_id: r.read_length_prefixed_string("CloseApp.app_id")?,
        },
        other => {
            return Err(DecodeError::Malformed(format!(
                "expected a command frame, got {other:?}"
            )))
        }
    };
    r.finish(frame.message_type)?;
    Ok(cmd)
}

/// Parses the payload of a response frame answering a command of kind
/// `expected`.
///
/// # Errors
///
/// See [`decode_response`].
pub fn response_from_frame(frame: &Frame, expected: CommandKind) -> Result<Response, DecodeError> {
    let got = frame.message_type;
    if got != expected.expected_response() && got != MessageType::Failure {
        return Err(DecodeError::UnexpectedKind { expected, got });
    }

    let mut r = PayloadReader::new(&frame.payload);
    let resp = match got {
        MessageType::HelloAck => Response::HelloAck {
            protocol_version: r.read_u8("HelloAck.protocol_version")?,
            accepted: r.read_bool("HelloAck.accepted")?,
        },
        MessageType::DeviceInfo => Response::DeviceInfo(DeviceInfo {
            model: r.read_length_prefixed_string("DeviceInfo.model")?,
            os_version: r.read_length_prefixed_string("DeviceInfo.os_version")?,
            device_id: r.read_length_prefixed_string("DeviceInfo.device_id")?,
        }),
        MessageType::AppList => {
            let count = r.read_u16("AppList.count")? as usize;
            let mut apps = Vec::with_capacity(count.min(256));
            for _ in 0..count {
                apps.push(AppDescriptor {
                    app_id: r.read_length_prefixed_string("AppList.app_id")?,
                    name: r.read_length_prefixed_string("AppList.name")?,
                    version: r.read_length_prefixed_string("AppList.version")?,
                    running: r.read_bool("AppList.running")?,
                });
            }
            Response::AppList(apps)
        }
        MessageType::Ack => Response::Ack,
        MessageType::UploadAck => Response::UploadAck {
            upload_id: r.read_uuid("UploadAck.upload_id")?,
            received: r.read_u64("UploadAck.received")?,
        },
        MessageType::InstallStatus => {
            let state = r.read_u8("InstallStatus.state")?;
            let app_id = r.read_length_prefixed_string("InstallStatus.app_id")?;
            match state {
                0x00 => Response::InstallStatus(InstallStatus::Pending),
                0x01 if !app_id.is_empty() => {
                    Response::InstallStatus(InstallStatus::Installed { app_id })
                }
                0x01 => {
                    return Err(DecodeError::Malformed(
                        "InstallStatus: installed without an app id".to_string(),
                    ))
                }
                other => {
                    return Err(DecodeError::Malformed(format!(
                        "InstallStatus: unknown state {other}"
                    )))
                }
            }
        }
        MessageType::Failure => {
            let code = DeviceErrorCode::from_u16(r.read_u16("Failure.code")?);
            let message = r.read_length_prefixed_string("Failure.message")?;
            Response::Failure(DeviceFailure { code, message })
        }
        // Command types were rejected by the expected-kind check above.
        other => return Err(DecodeError::UnexpectedKind { expected, got: other }),
    };
    r.finish(got)?;
    Ok(resp)
}

// ── Streaming decoder ─────────────────────────────────────────────────────────

/// Reassembles frames from a byte stream.
///
/// Push whatever the transport delivered, then call [`next_frame`] until it
/// returns `Ok(None)`.  A single `push` may complete zero, one, or many
/// frames.
///
/// [`next_frame`]: FrameDecoder::next_frame
///
/// # Examples
///
/// ```rust
/// use devlink_core::protocol::{encode_response, FrameDecoder, Response};
///
/// let bytes = encode_response(&Response::Ack, 1);
/// let mut decoder = FrameDecoder::new();
/// decoder.push(&bytes[..5]);
/// assert!(decoder.next_frame().unwrap().is_none());
/// decoder.push(&bytes[5..]);
/// assert!(decoder.next_frame().unwrap().is_some());
/// ```
#[derive(Debug, Default)]
pub struct FrameDecoder {
    buf: Vec<u8>,
}

impl FrameDecoder {
    /// Creates an empty decoder.
    pub fn new() -> Self {
        Self::default()
    }

    /// Appends newly received bytes.
    pub fn push(&mut self, bytes: &[u8]) {
        self.buf.extend_from_slice(bytes);
    }

    /// Returns the next complete frame, or `None` when more bytes are needed.
    ///
    /// # Errors
    ///
    /// Returns [`DecodeError::Malformed`] as soon as a header is invalid; the
    /// stream cannot be resynchronised after that.
    pub fn next_frame(&mut self) -> Result<Option<Frame>, DecodeError> {
        match try_split_frame(&self.buf)? {
            Some((frame, consumed)) => {
                self.buf.drain(..consumed);
                Ok(Some(frame))
            }
            None => Ok(None),
        }
    }

    /// Declares the end of the stream.
    ///
    /// # Errors
    ///
    /// Returns [`DecodeError::Truncated`] if a partial frame is still
    /// buffered.
    pub fn finish(&self) -> Result<(), DecodeError> {
        if self.buf.is_empty() {
            return Ok(());
        }
        Err(DecodeError::Truncated {
            needed: self.needed_len(),
            available: self.buf.len(),
        })
    }

    /// Discards all buffered bytes.
    pub fn clear(&mut self) {
        self.buf.clear();
    }

    fn needed_len(&self) -> usize {
        if self.buf.len() < HEADER_SIZE {
            return HEADER_SIZE;
        }
        HEADER_SIZE + read_payload_len(&self.buf)
    }
}

// ── Frame helpers ─────────────────────────────────────────────────────────────

fn encode_frame(message_type: MessageType, request_id: u64, payload: &[u8]) -> Vec<u8> {
    let mut buf = Vec::with_capacity(HEADER_SIZE + payload.len());
    buf.push(PROTOCOL_VERSION);
    buf.push(message_type as u8);
    buf.extend_from_slice(&0u16.to_be_bytes()); // flags
    buf.extend_from_slice(&(payload.len() as u32).to_be_bytes());
    buf.extend_from_slice(&request_id.to_be_bytes());
    buf.extend_from_slice(payload);
    buf
}

fn read_payload_len(header: &[u8]) -> usize {
    u32::from_be_bytes([header[4], header[5], header[6], header[7]]) as usize
}

/// Validates the header at the start of `bytes` and splits off one frame if
/// it is complete.
fn try_split_frame(bytes: &[u8]) -> Result<Option<(Frame, usize)>, DecodeError> {
    if bytes.len() < HEADER_SIZE {
        return Ok(None);
    }

    let version = bytes[0];
    if version != PROTOCOL_VERSION {
        return Err(DecodeError::Malformed(format!(
            "unsupported protocol version: {version}"
        )));
    }

    let type_byte = bytes[1];
    let message_type = MessageType::try_from(type_byte).map_err(|_| {
        DecodeError::Malformed(format!("unknown message type: 0x{type_byte:02X}"))
    })?;

    // bytes[2..4] are flags – ignored on decode

    let payload_len = read_payload_len(bytes);
    if payload_len > MAX_PAYLOAD_LEN {
        return Err(DecodeError::Malformed(format!(
            "payload length {payload_len} exceeds limit {MAX_PAYLOAD_LEN}"
        )));
    }

    let total = HEADER_SIZE + payload_len;
    if bytes.len() < total {
        return Ok(None);
    }

    let mut id_bytes = [0u8; 8];
    id_bytes.copy_from_slice(&bytes[8..16]);
    let frame = Frame {
        message_type,
        request_id: u64::from_be_bytes(id_bytes),
        payload: bytes[HEADER_SIZE..total].to_vec(),
    };
    Ok(Some((frame, total)))
}

/// Like [`try_split_frame`] but treats an incomplete frame as truncation.
fn split_complete_frame(bytes: &[u8]) -> Result<(Frame, usize), DecodeError> {
    try_split_frame(bytes)?.ok_or_else(|| {
        let needed = if bytes.len() < HEADER_SIZE {
            HEADER_SIZE
        } else {
            HEADER_SIZE + read_payload_len(bytes)
        };
        DecodeError::Truncated {
            needed,
            available: bytes.len(),
        }
    })
}

// ── Payload helpers ───────────────────────────────────────────────────────────

/// Writes a 2-byte length prefix followed by the UTF-8 string bytes.
///
/// Strings longer than [`MAX_STRING_LEN`] bytes are cut at the last character
/// boundary that fits; callers validate lengths before building a command.
fn write_length_prefixed_string(buf: &mut Vec<u8>, s: &str) {
    let mut len = s.len().min(MAX_STRING_LEN);
    while !s.is_char_boundary(len) {
        len -= 1;
    }
    buf.extend_from_slice(&(len as u16).to_be_bytes());
    buf.extend_from_slice(&s.as_bytes()[..len]);
}

/// Writes a 4-byte length prefix followed by the raw bytes.
fn write_blob(buf: &mut Vec<u8>, data: &[u8]) {
    let len = data.len().min(u32::MAX as usize);
    buf.extend_from_slice(&(len as u32).to_be_bytes());
    buf.extend_from_slice(&data[..len]);
}

/// Forward-only cursor over a payload.
struct PayloadReader<'a> {
    buf: &'a [u8],
    pos: usize,
}

impl<'a> PayloadReader<'a> {
    fn new(buf: &'a [u8]) -> Self {
        Self { buf, pos: 0 }
    }

    fn take(&mut self, n: usize, context: &str) -> Result<&'a [u8], DecodeError> {
        let end = self.pos + n;
        if self.buf.len() < end {
            tracing::trace!("{context}: need {end} bytes, got {}", self.buf.len());
            return Err(DecodeError::Truncated {
                needed: end,
                available: self.buf.len(),
            });
        }
        let slice = &self.buf[self.pos..end];
        self.pos = end;
        Ok(slice)
    }

    fn read_u8(&mut self, context: &str) -> Result<u8, DecodeError> {
        Ok(self.take(1, context)?[0])
    }

    fn read_bool(&mut self, context: &str) -> Result<bool, DecodeError> {
        match self.read_u8(context)? {
            0x00 => Ok(false),
            0x01 => Ok(true),
            other => Err(DecodeError::Malformed(format!(
                "{context}: invalid boolean byte {other}"
            ))),
        }
    }

    fn read_u16(&mut self, context: &str) -> Result<u16, DecodeError> {
        let b = self.take(2, context)?;
        Ok(u16::from_be_bytes([b[0], b[1]]))
    }

    fn read_u32(&mut self, context: &str) -> Result<u32, DecodeError> {
        let b = self.take(4, context)?;
        Ok(u32::from_be_bytes([b[0], b[1], b[2], b[3]]))
    }

    fn read_u64(&mut self, context: &str) -> Result<u64, DecodeError> {
        let b = self.take(8, context)?;
        let mut arr = [0u8; 8];
        arr.copy_from_slice(b);
        Ok(u64::from_be_bytes(arr))
    }

    fn read_uuid(&mut self, context: &str) -> Result<Uuid, DecodeError> {
        let b = self.take(16, context)?;
        let mut arr = [0u8; 16];
        arr.copy_from_slice(b);
        Ok(Uuid::from_bytes(arr))
    }

    /// Reads a 2-byte length prefix and then that many UTF-8 bytes.
    fn read_length_prefixed_string(&mut self, context: &str) -> Result<String, DecodeError> {
        let len = self.read_u16(context)? as usize;
        let bytes = self.take(len, context)?;
        std::str::from_utf8(bytes)
            .map(str::to_string)
            .map_err(|e| DecodeError::Malformed(format!("{context}: invalid UTF-8: {e}")))
    }

    /// Reads a 4-byte length prefix and then that many raw bytes.
    fn read_blob(&mut self, context: &str) -> Result<Vec<u8>, DecodeError> {
        let len = self.read_u32(context)? as usize;
        Ok(self.take(len, context)?.to_vec())
    }

    fn finish(&self, message_type: MessageType) -> Result<(), DecodeError> {
        if self.pos == self.buf.len() {
            Ok(())
        } else {
            Err(DecodeError::Malformed(format!(
                "{message_type:?}: {} trailing bytes",
                self.buf.len() - self.pos
            )))
        }
    }
}

// ── Tests ─────────────────────────────────────────────────────────────────────
