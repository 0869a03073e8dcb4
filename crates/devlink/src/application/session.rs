//! Device session: one connect → execute → disconnect lifecycle.
//!
//! # State machine
//!
//! ```text
//!                connect()                 execute()
//! Disconnected ───────────> Connecting ──> Ready <──────> Executing
//!      ^                        │           │                 │
//!      │                        v           │ disconnect()    v
//!      └──── cleanup ──────── Failed <──────┼──────────── (link / codec
//!      ^                                    │              failure)
//!      └────────────────────────────────────┘
//! ```
//!
//! - `connect` opens the transport and performs the `Hello` handshake.  If
//!   either step fails the session passes through `Failed`, closes whatever
//!   was opened, and ends in `Disconnected`.
//! - `execute` is only valid in `Ready`.  A device-reported failure is an
//!   answer, so the session stays `Ready`.  A transport, codec, or timeout
//!   failure ends the session: it is closed and cannot be used again.
//! - `disconnect` is valid in every state and closes the handle at most once.
//!
//! # Guaranteed release
//!
//! The transport handle lives in an `Option` and is `take()`n by whichever
//! path releases it first.  If the session is dropped while the handle is
//! still open (the caller's future was cancelled mid-command, say), `Drop`
//! spawns the close on the current tokio runtime.

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use devlink_core::protocol::{SequenceCounter, PROTOCOL_VERSION};
use devlink_core::{
    encode_command, response_from_frame, Command, CommandKind, DecodeError, DeviceDescriptor,
    FrameDecoder, Response,
};
use tokio::time::Instant;
use tracing::{debug, info, instrument, trace, warn};

use crate::application::error::{DeviceError, ManagerError};
use crate::application::transport::{ConnectError, LinkError, Transport, TransportHandle};

/// Timeouts and identity used by every session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionConfig {
    /// Bound on opening the transport.
    pub connect_timeout: Duration,
    /// Bound on one command: send plus the complete response.
    pub command_timeout: Duration,
    /// Name announced in the `Hello` handshake.
    pub client_name: String,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            connect_timeout: Duration::from_secs(5),
            command_timeout: Duration::from_secs(10),
            client_name: "devlink".to_string(),
        }
    }
}

/// Lifecycle state of a [`DeviceSession`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SessionState {
    Disconnected,
    Connecting,
    Ready,
    Executing,
    Failed,
}

impl fmt::Display for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            SessionState::Disconnected => "disconnected",
            SessionState::Connecting => "connecting",
            SessionState::Ready => "ready",
            SessionState::Executing => "executing",
            SessionState::Failed => "failed",
        };
        f.write_str(s)
    }
}

/// A single logical interaction with one device over one transport handle.
pub struct DeviceSession {
    transport: Arc<dyn Transport>,
    device: DeviceDescriptor,
    config: SessionConfig,
    state: SessionState,
    handle: Option<Box<dyn TransportHandle>>,
    decoder: FrameDecoder,
    request_ids: SequenceCounter,
    /// Set once `connect` has been attempted; sessions are single-use.
    spent: bool,
}

impl DeviceSession {
    /// Creates a disconnected session for `device`.
    pub fn new(
        transport: Arc<dyn Transport>,
        device: DeviceDescriptor,
        config: SessionConfig,
    ) -> Self {
        Self {
            transport,
            device,
            config,
            state: SessionState::Disconnected,
            handle: None,
            decoder: FrameDecoder::new(),
            request_ids: SequenceCounter::new(),
            spent: false,
        }
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    pub fn device(&self) -> &DeviceDescriptor {
        &self.device
    }

    /// Returns `true` if commands can be executed.
    pub fn is_ready(&self) -> bool {
        self.state == SessionState::Ready
    }

    /// Opens the transport and performs the protocol handshake.
    ///
    /// # Errors
    ///
    /// - [`ManagerError::InvalidState`] if this session was already used.
    /// - [`ManagerError::Connect`] if the transport cannot be opened or the
    ///   device rejects the handshake.
    /// - Link, decode, or timeout errors from the handshake exchange.
    ///
    /// On any error the session ends `Disconnected` with nothing left open.
    #[instrument(skip(self), fields(device = %self.device.id))]
    pub async fn connect(&mut self) -> Result<(), ManagerError> {
        if self.spent || self.state != SessionState::Disconnected {
            return Err(ManagerError::InvalidState {
                operation: "connect",
                state: self.state,
            });
        }
        self.spent = true;
        self.state = SessionState::Connecting;

        debug!(address = %self.device.address, "opening transport");
        let handle = match self
            .transport
            .open(&self.device, self.config.connect_timeout)
            .await
        {
            Ok(handle) => handle,
            Err(e) => {
                warn!("transport open failed: {e}");
                self.fail().await;
                return Err(e.into());
            }
        };
        self.handle = Some(handle);

        if let Err(e) = self.handshake().await {
            warn!("handshake failed: {e}");
            self.fail().await;
            return Err(e);
        }

        self.state = SessionState::Ready;
        info!("session ready");
        Ok(())
    }

    /// Sends `cmd` and waits for its response.
    ///
    /// # Errors
    ///
    /// - [`ManagerError::InvalidState`] unless the session is `Ready`.
    /// - [`ManagerError::Device`] when the device rejects the command; the
    ///   session stays `Ready`.
    /// - [`ManagerError::Link`], [`ManagerError::Decode`] or
    ///   [`ManagerError::CommandTimeout`]; the session is closed first.
    #[instrument(skip(self, cmd), fields(device = %self.device.id, command = %cmd.kind()))]
    pub async fn execute(&mut self, cmd: &Command) -> Result<Response, ManagerError> {
        if self.state != SessionState::Ready {
            return Err(ManagerError::InvalidState {
                operation: "execute",
                state: self.state,
            });
        }
        self.state = SessionState::Executing;

        match self.exchange(cmd).await {
            Ok(Response::Failure(failure)) => {
                self.state = SessionState::Ready;
                let err = DeviceError::from_failure(cmd.kind(), failure);
                debug!("device rejected command: {err}");
                Err(err.into())
            }
            Ok(resp) => {
                self.state = SessionState::Ready;
                trace!(response = ?resp.message_type(), "command completed");
                Ok(resp)
            }
            Err(e) => {
                warn!("command failed, closing session: {e}");
                self.fail().await;
                Err(e)
            }
        }
    }

    /// Closes the transport if it is open.  Valid in every state; calling it
    /// again is a no-op.
    pub async fn disconnect(&mut self) {
        self.spent = true;
        if self.handle.is_some() {
            debug!(device = %self.device.id, "disconnecting");
        }
        self.release().await;
    }

    // ── Internals ─────────────────────────────────────────────────────────────

    async fn handshake(&mut self) -> Result<(), ManagerError> {
        let hello = Command::Hello {
            protocol_version: PROTOCOL_VERSION,
            client_name: self.config.client_name.clone(),
        };
        let reason = match self.exchange(&hello).await? {
            Response::HelloAck {
                protocol_version,
                accepted: true,
            } if protocol_version == PROTOCOL_VERSION => return Ok(()),
            Response::HelloAck {
                protocol_version, ..
            } if protocol_version != PROTOCOL_VERSION => format!(
                "device speaks protocol version {protocol_version}, expected {PROTOCOL_VERSION}"
            ),
            Response::HelloAck { .. } => "device refused the session".to_string(),
            Response::Failure(f) => {
                format!("device refused the session: {}: {}", f.code, f.message)
            }
            other => {
                return Err(unexpected_response(CommandKind::Hello, &other));
            }
        };
        Err(ConnectError::Handshake {
            address: self.device.address.clone(),
            reason,
        }
        .into())
    }

    /// One request/response round trip, with the whole exchange bounded by
    /// the command timeout.
    async fn exchange(&mut self, cmd: &Command) -> Result<Response, ManagerError> {
        let kind = cmd.kind();
        let timeout = self.config.command_timeout;
        let timed_out = || ManagerError::CommandTimeout {
            command: kind,
            timeout,
        };

        let handle = self
            .handle
            .as_mut()
            .ok_or(ManagerError::Link(LinkError::HandleClosed))?;
        let request_id = self.request_ids.next();
        let bytes = encode_command(cmd, request_id);
        let deadline = Instant::now() + timeout;

        trace!(request_id, len = bytes.len(), "sending {kind}");
        match tokio::time::timeout(timeout, handle.send(&bytes)).await {
            Err(_) | Ok(Err(LinkError::Timeout(_))) => return Err(timed_out()),
            Ok(Err(e)) => return Err(e.into()),
            Ok(Ok(())) => {}
        }

        let frame = loop {
            if let Some(frame) = self.decoder.next_frame()? {
                break frame;
            }
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                return Err(timed_out());
            }
            match tokio::time::timeout(remaining, handle.receive(remaining)).await {
                Err(_) | Ok(Err(LinkError::Timeout(_))) => return Err(timed_out()),
                Ok(Err(LinkError::Closed)) => {
                    // A partial frame at end of stream is a truncated response.
                    self.decoder.finish()?;
                    return Err(LinkError::Closed.into());
                }
                Ok(Err(e)) => return Err(e.into()),
                Ok(Ok(chunk)) => self.decoder.push(&chunk),
            }
        };

        if frame.request_id != request_id {
            return Err(DecodeError::Malformed(format!(
                "response carries request id {}, expected {request_id}",
                frame.request_id
            ))
            .into());
        }
        Ok(response_from_frame(&frame, kind)?)
    }

    async fn fail(&mut self) {
        self.state = SessionState::Failed;
        self.release().await;
    }

    async fn release(&mut self) {
        if let Some(mut handle) = self.handle.take() {
            handle.close().await;
            debug!(device = %self.device.id, "transport closed");
        }
        self.decoder.clear();
        self.state = SessionState::Disconnected;
    }
}

impl Drop for DeviceSession {
    fn drop(&mut self) {
        let Some(mut handle) = self.handle.take() else {
            return;
        };
        match tokio::runtime::Handle::try_current() {
            Ok(runtime) => {
                debug!(device = %self.device.id, "dropped while open, closing in background");
                runtime.spawn(async move {
                    handle.close().await;
                });
            }
            Err(_) => {
                warn!(device = %self.device.id, "dropped outside a runtime, handle left open");
            }
        }
    }
}

impl fmt::Debug for DeviceSession {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DeviceSession")
            .field("device", &self.device)
            .field("state", &self.state)
            .field("open", &self.handle.is_some())
            .finish()
    }
}

/// Error for a response that decoded cleanly but is not what the operation
/// asked for.
pub(crate) fn unexpected_response(expected: CommandKind, got: &Response) -> ManagerError {
    DecodeError::UnexpectedKind {
        expected,
        got: got.message_type(),
    }
    .into()
}

// ── Tests ─────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::VecDeque;
    use std::sync::Mutex;

    use async_trait::async_trait;
    use devlink_core::protocol::HEADER_SIZE;
    use devlink_core::{
        decode_command, encode_response, AppDescriptor, DeviceErrorCode, DeviceFailure,
    };

    // ── Scripted transport ────────────────────────────────────────────────────

    /// What the scripted device does with the next command it receives.
    enum Reply {
        /// Answer with this response, echoing the request id.
        Answer(Response),
        /// Answer with this response under a different request id.
        WrongId(Response),
        /// Answer with only the first `n` bytes, then end the stream.
        Cut(Response, usize),
        /// Never answer.
        Silence,
        /// Drop the link.
        Hangup,
    }

    #[derive(Default)]
    struct Log {
        opens: Mutex<usize>,
        closes: Mutex<usize>,
        commands: Mutex<Vec<CommandKind>>,
    }

    struct ScriptedTransport {
        replies: Arc<Mutex<VecDeque<Reply>>>,
        log: Arc<Log>,
        refuse: bool,
    }

    impl ScriptedTransport {
        fn new(replies: Vec<Reply>) -> Self {
            Self {
                replies: Arc::new(Mutex::new(replies.into())),
                log: Arc::new(Log::default()),
                refuse: false,
            }
        }
    }

    struct ScriptedHandle {
        replies: Arc<Mutex<VecDeque<Reply>>>,
        log: Arc<Log>,
        pending: Vec<u8>,
        eof: bool,
    }

    #[async_trait]
    impl Transport for ScriptedTransport {
        async fn open(
            &self,
            device: &DeviceDescriptor,
            _timeout: Duration,
        ) -> Result<Box<dyn TransportHandle>, ConnectError> {
            if self.refuse {
                return Err(ConnectError::NotFound {
                    address: device.address.clone(),
                });
            }
            *self.log.opens.lock().unwrap() += 1;
            Ok(Box::new(ScriptedHandle {
                replies: Arc::clone(&self.replies),
                log: Arc::clone(&self.log),
                pending: Vec::new(),
                eof: false,
            }))
        }
    }

    #[async_trait]
    impl TransportHandle for ScriptedHandle {
        async fn send(&mut self, bytes: &[u8]) -> Result<(), LinkError> {
            let (cmd, id, _) = decode_command(bytes).expect("session sent a valid frame");
            self.log.commands.lock().unwrap().push(cmd.kind());
            let reply = self.replies.lock().unwrap().pop_front().unwrap_or(Reply::Silence);
            match reply {
                Reply::Answer(r) => self.pending = encode_response(&r, id),
                Reply::WrongId(r) => self.pending = encode_response(&r, id + 100),
                Reply::Cut(r, n) => {
                    self.pending = encode_response(&r, id)[..n].to_vec();
                    self.eof = true;
                }
                Reply::Silence => {}
                Reply::Hangup => self.eof = true,
            }
            Ok(())
        }

        async fn receive(&mut self, timeout: Duration) -> Result<Vec<u8>, LinkError> {
            if !self.pending.is_empty() {
                return Ok(std::mem::take(&mut self.pending));
            }
            if self.eof {
                return Err(LinkError::Closed);
            }
            Err(LinkError::Timeout(timeout))
        }

        async fn close(&mut self) {
            *self.log.closes.lock().unwrap() += 1;
        }
    }

    fn hello_ack() -> Reply {
        Reply::Answer(Response::HelloAck {
            protocol_version: PROTOCOL_VERSION,
            accepted: true,
        })
    }

    fn session_for(transport: &Arc<ScriptedTransport>) -> DeviceSession {
        let config = SessionConfig {
            command_timeout: Duration::from_millis(50),
            ..SessionConfig::default()
        };
        DeviceSession::new(
            Arc::clone(transport) as Arc<dyn Transport>,
            DeviceDescriptor::new("phone", "scripted"),
            config,
        )
    }

    fn closes(t: &ScriptedTransport) -> usize {
        *t.log.closes.lock().unwrap()
    }

    // ── connect ──────────────────────────────────────────────────────────────

    #[tokio::test]
    async fn test_connect_performs_hello_and_becomes_ready() {
        // Arrange
        let transport = Arc::new(ScriptedTransport::new(vec![hello_ack()]));
        let mut session = session_for(&transport);

        // Act
        session.connect().await.expect("connect");

        // Assert
        assert_eq!(session.state(), SessionState::Ready);
        assert_eq!(
            *transport.log.commands.lock().unwrap(),
            vec![CommandKind::Hello]
        );
    }

    #[tokio::test]
    async fn test_connect_refused_ends_disconnected_without_close() {
        let mut transport = ScriptedTransport::new(vec![]);
        transport.refuse = true;
        let transport = Arc::new(transport);
        let mut session = session_for(&transport);

        let err = session.connect().await.unwrap_err();

        assert!(matches!(err, ManagerError::Connect(ConnectError::NotFound { .. })));
        assert_eq!(session.state(), SessionState::Disconnected);
        assert_eq!(closes(&transport), 0, "nothing was opened");
    }

    #[tokio::test]
    async fn test_handshake_version_mismatch_closes_opened_handle() {
        // Arrange
        let transport = Arc::new(ScriptedTransport::new(vec![Reply::Answer(
            Response::HelloAck {
                protocol_version: 0x02,
                accepted: false,
            },
        )]));
        let mut session = session_for(&transport);

        // Act
        let err = session.connect().await.unwrap_err();

        // Assert
        assert!(matches!(
            err,
            ManagerError::Connect(ConnectError::Handshake { .. })
        ));
        assert_eq!(session.state(), SessionState::Disconnected);
        assert_eq!(closes(&transport), 1);
    }

    #[tokio::test]
    async fn test_session_cannot_be_reconnected() {
        let transport = Arc::new(ScriptedTransport::new(vec![hello_ack(), hello_ack()]));
        let mut session = session_for(&transport);
        session.connect().await.unwrap();
        session.disconnect().await;

        let err = session.connect().await.unwrap_err();

        assert!(matches!(
            err,
            ManagerError::InvalidState {
                operation: "connect",
                ..
            }
        ));
        assert_eq!(*transport.log.opens.lock().unwrap(), 1);
    }

    // ── execute ──────────────────────────────────────────────────────────────

    #[tokio::test]
    async fn test_execute_returns_typed_response() {
        let apps = vec![AppDescriptor {
            app_id: "app://clock".to_string(),
            name: "Clock".to_string(),
            version: "1.0".to_string(),
            running: true,
        }];
        let transport = Arc::new(ScriptedTransport::new(vec![
            hello_ack(),
            Reply::Answer(Response::AppList(apps.clone())),
        ]));
        let mut session = session_for(&transport);
        session.connect().await.unwrap();

        let resp = session.execute(&Command::ListRunningApps).await.unwrap();

        assert_eq!(resp, Response::AppList(apps));
        assert!(session.is_ready());
    }

    #[tokio::test]
    async fn test_execute_before_connect_is_invalid_state() {
        let transport = Arc::new(ScriptedTransport::new(vec![]));
        let mut session = session_for(&transport);

        let err = session.execute(&Command::GetDeviceInfo).await.unwrap_err();

        assert!(matches!(
            err,
            ManagerError::InvalidState {
                operation: "execute",
                state: SessionState::Disconnected
            }
        ));
    }

    #[tokio::test]
    async fn test_device_failure_keeps_session_ready() {
        // Arrange
        let transport = Arc::new(ScriptedTransport::new(vec![
            hello_ack(),
            Reply::Answer(Response::Failure(DeviceFailure::new(
                DeviceErrorCode::AppNotFound,
                "no app://ghost",
            ))),
            Reply::Answer(Response::Ack),
        ]));
        let mut session = session_for(&transport);
        session.connect().await.unwrap();

        // Act
        let err = session
            .execute(&Command::UninstallApp {
                app_id: "app://ghost".to_string(),
            })
            .await
            .unwrap_err();
        let next = session
            .execute(&Command::LaunchApp {
                app_id: "app://clock".to_string(),
            })
            .await;

        // Assert
        let device = err.device_error().expect("device error");
        assert_eq!(device.code, DeviceErrorCode::AppNotFound);
        assert_eq!(device.command, CommandKind::UninstallApp);
        assert_eq!(next.unwrap(), Response::Ack);
        assert_eq!(closes(&transport), 0);
    }

    #[tokio::test]
    async fn test_link_drop_closes_session_exactly_once() {
        let transport = Arc::new(ScriptedTransport::new(vec![hello_ack(), Reply::Hangup]));
        let mut session = session_for(&transport);
        session.connect().await.unwrap();

        let err = session.execute(&Command::GetDeviceInfo).await.unwrap_err();
        session.disconnect().await;
        session.disconnect().await;

        assert!(matches!(err, ManagerError::Link(LinkError::Closed)));
        assert_eq!(session.state(), SessionState::Disconnected);
        assert_eq!(closes(&transport), 1);
    }

    #[tokio::test]
    async fn test_truncated_response_is_decode_error() {
        // Arrange: the device sends the header and half the payload, then EOF
        let transport = Arc::new(ScriptedTransport::new(vec![
            hello_ack(),
            Reply::Cut(
                Response::DeviceInfo(devlink_core::DeviceInfo {
                    model: "Model X".to_string(),
                    os_version: "2.5".to_string(),
                    device_id: "serial-1".to_string(),
                }),
                HEADER_SIZE + 6,
            ),
        ]));
        let mut session = session_for(&transport);
        session.connect().await.unwrap();

        // Act
        let err = session.execute(&Command::GetDeviceInfo).await.unwrap_err();

        // Assert
        assert!(matches!(
            err,
            ManagerError::Decode(DecodeError::Truncated { .. })
        ));
        assert_eq!(session.state(), SessionState::Disconnected);
        assert_eq!(closes(&transport), 1);
    }

    #[tokio::test]
    async fn test_mismatched_request_id_is_malformed() {
        let transport = Arc::new(ScriptedTransport::new(vec![
            hello_ack(),
            Reply::WrongId(Response::Ack),
        ]));
        let mut session = session_for(&transport);
        session.connect().await.unwrap();

        let err = session
            .execute(&Command::CloseApp {
                app_id: "app://clock".to_string(),
            })
            .await
            .unwrap_err();

        assert!(matches!(err, ManagerError::Decode(DecodeError::Malformed(_))));
        assert_eq!(closes(&transport), 1);
    }

    #[tokio::test]
    async fn test_silent_device_times_out_and_closes() {
        let transport = Arc::new(ScriptedTransport::new(vec![hello_ack(), Reply::Silence]));
        let mut session = session_for(&transport);
        session.connect().await.unwrap();

        let err = session.execute(&Command::ListInstalledApps).await.unwrap_err();

        assert!(matches!(
            err,
            ManagerError::CommandTimeout {
                command: CommandKind::ListInstalledApps,
                ..
            }
        ));
        assert_eq!(closes(&transport), 1);
    }

    // ── disconnect / drop ────────────────────────────────────────────────────

    #[tokio::test]
    async fn test_disconnect_on_fresh_session_is_noop() {
        let transport = Arc::new(ScriptedTransport::new(vec![]));
        let mut session = session_for(&transport);

        session.disconnect().await;

        assert_eq!(session.state(), SessionState::Disconnected);
        assert_eq!(closes(&transport), 0);
    }

    #[tokio::test]
    async fn test_dropping_open_session_closes_in_background() {
        // Arrange
        let transport = Arc::new(ScriptedTransport::new(vec![hello_ack()]));
        let mut session = session_for(&transport);
        session.connect().await.unwrap();

        // Act
        drop(session);
        for _ in 0..3 {
            tokio::task::yield_now().await;
        }

        // Assert
        assert_eq!(closes(&transport), 1);
    }

    #[test]
    fn test_state_display_is_lowercase() {
        assert_eq!(SessionState::Executing.to_string(), "executing");
    }
}
