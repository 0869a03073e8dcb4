//! In-memory simulated device.
//!
//! [`SimulatedDevice`] speaks the device side of the wire protocol: it decodes
//! command frames, keeps installed and running app tables, assembles package
//! uploads, and reports install completion after a configurable number of
//! status polls.  It implements [`Transport`] directly, so a session opened on
//! it goes through exactly the same framing and state machine as one opened on
//! TCP.
//!
//! # Fault injection
//!
//! | Setter                      | Effect                                                       |
//! |-----------------------------|--------------------------------------------------------------|
//! | `refuse_connections`        | `open` fails with `ConnectError::NotFound`                   |
//! | `drop_link_after_frames(n)` | next link answers `n` frames, then goes dead                 |
//! | `stall_responses(kind, n)`  | the next `n` commands of `kind` are never answered           |
//! | `reject_install(code)`      | `InstallApp` fails with `code`                               |
//! | `fail_abort`                | `AbortUpload` is refused                                     |
//! | `truncate_next_response(k)` | the next reply to `k` is cut in half and the stream ends     |
//! | `install_polls(n)`          | installs complete on the `n`th `QueryInstall` (0: at once)   |
//!
//! Every open and close is counted in [`SimStats`], which is how tests check
//! that each handle is released exactly once.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use async_trait::async_trait;
use devlink_core::protocol::PROTOCOL_VERSION;
use devlink_core::{
    command_from_frame, encode_response, AppDescriptor, Command, CommandKind, DeviceDescriptor,
    DeviceErrorCode, DeviceFailure, DeviceInfo, FrameDecoder, InstallStatus, Response,
};
use tracing::{debug, trace};
use uuid::Uuid;

use crate::application::transport::{ConnectError, LinkError, Transport, TransportHandle};

/// Default storage limit for a single upload.
const DEFAULT_STORAGE_LIMIT: u64 = 64 * 1024 * 1024;

/// Open/close bookkeeping and the log of commands the device received.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct SimStats {
    /// Links successfully opened.
    pub opened: usize,
    /// Links released by their first `close`.
    pub released: usize,
    /// Every `close` call, including repeats.
    pub close_calls: usize,
    /// Commands received, in order, across all links.
    pub commands: Vec<CommandKind>,
}

impl SimStats {
    /// Links opened but not yet closed.
    pub fn open_links(&self) -> usize {
        self.opened - self.released
    }

    /// How many commands of `kind` the device received.
    pub fn count(&self, kind: CommandKind) -> usize {
        self.commands.iter().filter(|k| **k == kind).count()
    }
}

#[derive(Debug)]
struct Upload {
    total_len: u64,
    data: Vec<u8>,
}

#[derive(Debug)]
struct PendingInstall {
    app: AppDescriptor,
    polls_left: u32,
}

#[derive(Debug, Default)]
struct Faults {
    refuse_connections: bool,
    drop_link_after_frames: Option<usize>,
    stalls: HashMap<CommandKind, usize>,
    reject_install: Option<DeviceErrorCode>,
    fail_abort: bool,
    truncate_next: Option<CommandKind>,
}

#[derive(Debug)]
struct DeviceState {
    info: DeviceInfo,
    protocol_version: u8,
    apps: Vec<AppDescriptor>,
    uploads: HashMap<Uuid, Upload>,
    installs: HashMap<Uuid, PendingInstall>,
    install_polls: u32,
    storage_limit: u64,
    faults: Faults,
    stats: SimStats,
}

/// What the device does with one received frame.
enum Outcome {
    Reply(Response),
    Stall,
}

/// A fake device reachable through [`Transport::open`].
///
/// Cloning yields another handle to the same device.
#[derive(Debug, Clone)]
pub struct SimulatedDevice {
    state: Arc<Mutex<DeviceState>>,
}

impl SimulatedDevice {
    /// Creates a device with no apps installed.
    pub fn new(info: DeviceInfo) -> Self {
        Self {
            state: Arc::new(Mutex::new(DeviceState {
                info,
                protocol_version: PROTOCOL_VERSION,
                apps: Vec::new(),
                uploads: HashMap::new(),
                installs: HashMap::new(),
                install_polls: 1,
                storage_limit: DEFAULT_STORAGE_LIMIT,
                faults: Faults::default(),
                stats: SimStats::default(),
            })),
        }
    }

    /// A handset with a few preinstalled apps, used by `devlink --simulate`.
    pub fn demo() -> Self {
        Self::new(DeviceInfo {
            model: "Simulated Handset".to_string(),
            os_version: "2.5.4".to_string(),
            device_id: "SIM-0001".to_string(),
        })
        .with_app(app("app://clock", "Clock", true))
        .with_app(app("app://camera", "Camera", false))
        .with_app(app("app://notes", "Notes", false))
    }

    /// Adds a preinstalled app.
    pub fn with_app(self, app: AppDescriptor) -> Self {
        self.lock().apps.push(app);
        self
    }

    // ── Fault injection ───────────────────────────────────────────────────────

    pub fn refuse_connections(&self, refuse: bool) {
        self.lock().faults.refuse_connections = refuse;
    }

    /// The next opened link answers `frames` frames, then drops.
    pub fn drop_link_after_frames(&self, frames: usize) {
        self.lock().faults.drop_link_after_frames = Some(frames);
    }

    /// The next `times` commands of `kind` get no reply.
    pub fn stall_responses(&self, kind: CommandKind, times: usize) {
        self.lock().faults.stalls.insert(kind, times);
    }

    pub fn reject_install(&self, code: DeviceErrorCode) {
        self.lock().faults.reject_install = Some(code);
    }

    pub fn fail_abort(&self, fail: bool) {
        self.lock().faults.fail_abort = fail;
    }

    /// The next reply to `kind` is cut in half and the stream ends.
    pub fn truncate_next_response(&self, kind: CommandKind) {
        self.lock().faults.truncate_next = Some(kind);
    }

    /// Number of `QueryInstall` polls before an install completes.
    pub fn install_polls(&self, polls: u32) {
        self.lock().install_polls = polls;
    }

    /// Protocol version the device answers `Hello` with.
    pub fn speak_protocol_version(&self, version: u8) {
        self.lock().protocol_version = version;
    }

    // ── Inspection ────────────────────────────────────────────────────────────

    pub fn installed_apps(&self) -> Vec<AppDescriptor> {
        self.lock().apps.clone()
    }

    /// Upload artifacts currently held on the device.
    pub fn pending_uploads(&self) -> usize {
        self.lock().uploads.len()
    }

    pub fn stats(&self) -> SimStats {
        self.lock().stats.clone()
    }

    fn lock(&self) -> MutexGuard<'_, DeviceState> {
        // Poisoning only means another holder panicked; the tables are still usable.
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }
}

/// Builds an [`AppDescriptor`] for seeding a simulated device.
pub fn app(app_id: &str, name: &str, running: bool) -> AppDescriptor {
    AppDescriptor {
        app_id: app_id.to_string(),
        name: name.to_string(),
        version: "1.0.0".to_string(),
        running,
    }
}

#[async_trait]
impl Transport for SimulatedDevice {
    async fn open(
        &self,
        device: &DeviceDescriptor,
        _timeout: Duration,
    ) -> Result<Box<dyn TransportHandle>, ConnectError> {
        let mut state = self.lock();
        if state.faults.refuse_connections {
            return Err(ConnectError::NotFound {
                address: device.address.clone(),
            });
        }
        state.stats.opened += 1;
        let drop_after = state.faults.drop_link_after_frames.take();
        debug!(device = %device.id, "simulated link opened");
        Ok(Box::new(SimulatedLink {
            device: self.clone(),
            decoder: FrameDecoder::new(),
            outbox: Vec::new(),
            frames: 0,
            drop_after,
            link_down: false,
            closed: false,
        }))
    }
}

/// One open link to a [`SimulatedDevice`].
struct SimulatedLink {
    device: SimulatedDevice,
    decoder: FrameDecoder,
    outbox: Vec<u8>,
    frames: usize,
    drop_after: Option<usize>,
    link_down: bool,
    closed: bool,
}

#[async_trait]
impl TransportHandle for SimulatedLink {
    async fn send(&mut self, bytes: &[u8]) -> Result<(), LinkError> {
        if self.closed {
            return Err(LinkError::HandleClosed);
        }
        if self.link_down {
            return Err(LinkError::Closed);
        }
        self.decoder.push(bytes);
        loop {
            let frame = match self.decoder.next_frame() {
                Ok(Some(frame)) => frame,
                Ok(None) => return Ok(()),
                Err(e) => {
                    debug!("simulated device got garbage, hanging up: {e}");
                    self.link_down = true;
                    return Ok(());
                }
            };
            if self.drop_after == Some(self.frames) {
                debug!(after = self.frames, "simulated link dropped");
                self.link_down = true;
                return Ok(());
            }
            self.frames += 1;

            let Ok(cmd) = command_from_frame(&frame) else {
                self.link_down = true;
                return Ok(());
            };
            let kind = cmd.kind();
            let mut state = self.device.lock();
            state.stats.commands.push(kind);
            match state.handle(cmd) {
                Outcome::Stall => trace!("stalling {kind}"),
                Outcome::Reply(resp) => {
                    let bytes = encode_response(&resp, frame.request_id);
                    if state.faults.truncate_next == Some(kind) {
                        state.faults.truncate_next = None;
                        self.outbox.extend_from_slice(&bytes[..bytes.len() / 2]);
                        self.link_down = true;
                    } else {
                        self.outbox.extend_from_slice(&bytes);
                    }
                }
            }
        }
    }

    async fn receive(&mut self, timeout: Duration) -> Result<Vec<u8>, LinkError> {
        if self.closed {
            return Err(LinkError::HandleClosed);
        }
        if !self.outbox.is_empty() {
            return Ok(std::mem::take(&mut self.outbox));
        }
        if self.link_down {
            return Err(LinkError::Closed);
        }
        tokio::time::sleep(timeout).await;
        Err(LinkError::Timeout(timeout))
    }

    async fn close(&mut self) {
        let mut state = self.device.lock();
        state.stats.close_calls += 1;
        if !self.closed {
            self.closed = true;
            state.stats.released += 1;
        }
    }
}

// ── Device behaviour ──────────────────────────────────────────────────────────

fn failure(code: DeviceErrorCode, message: impl Into<String>) -> Outcome {
    Outcome::Reply(Response::Failure(DeviceFailure::new(code, message)))
}

/// Derives a stable app id from an install label.
fn app_id_for(label: &str) -> String {
    let slug: String = label
        .trim()
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() {
                c.to_ascii_lowercase()
            } else {
                '-'
            }
        })
        .collect();
    if slug.is_empty() {
        "app://unnamed".to_string()
    } else {
        format!("app://{slug}")
    }
}

impl DeviceState {
    fn handle(&mut self, cmd: Command) -> Outcome {
        let kind = cmd.kind();
        if let Some(left) = self.faults.stalls.get_mut(&kind) {
            if *left > 0 {
                *left -= 1;
                return Outcome::Stall;
            }
        }

        match cmd {
            Command::Hello {
                protocol_version, ..
            } => Outcome::Reply(Response::HelloAck {
                protocol_version: self.protocol_version,
                accepted: protocol_version == self.protocol_version,
            }),
            Command::GetDeviceInfo => Outcome::Reply(Response::DeviceInfo(self.info.clone())),
            Command::ListRunningApps => Outcome::Reply(Response::AppList(
                self.apps.iter().filter(|a| a.running).cloned().collect(),
            )),
            Command::ListInstalledApps => Outcome::Reply(Response::AppList(self.apps.clone())),
            Command::UploadChunk {
                upload_id,
                offset,
                total_len,
                data,
            } => self.upload_chunk(upload_id, offset, total_len, data),
            Command::InstallApp { upload_id, label } => self.install(upload_id, &label),
            Command::QueryInstall { upload_id } => self.query_install(upload_id),
            Command::AbortUpload { upload_id } => {
                if self.faults.fail_abort {
                    return failure(DeviceErrorCode::OperationRefused, "abort refused");
                }
                let had_upload = self.uploads.remove(&upload_id).is_some();
                let had_install = self.installs.remove(&upload_id).is_some();
                if had_upload || had_install {
                    Outcome::Reply(Response::Ack)
                } else {
                    failure(DeviceErrorCode::UnknownUpload, format!("no upload {upload_id}"))
                }
            }
            Command::UninstallApp { app_id } => match self.find(&app_id) {
                Some(i) => {
                    self.apps.remove(i);
                    Outcome::Reply(Response::Ack)
                }
                None => failure(
                    DeviceErrorCode::AppNotFound,
                    format!("{app_id} is not installed"),
                ),
            },
            Command::LaunchApp { app_id } => self.set_running(&app_id, true),
            Command::CloseApp { app_id } => self.set_running(&app_id, false),
        }
    }

    fn find(&self, app_id: &str) -> Option<usize> {
        self.apps.iter().position(|a| a.app_id == app_id)
    }

    fn set_running(&mut self, app_id: &str, running: bool) -> Outcome {
        match self.find(app_id) {
            Some(i) => {
                self.apps[i].running = running;
                Outcome::Reply(Response::Ack)
            }
            None => failure(
                DeviceErrorCode::AppNotFound,
                format!("{app_id} is not installed"),
            ),
        }
    }

    fn upload_chunk(
        &mut self,
        upload_id: Uuid,
        offset: u64,
        total_len: u64,
        data: Vec<u8>,
    ) -> Outcome {
        if total_len > self.storage_limit {
            return failure(DeviceErrorCode::StorageFull, "package does not fit");
        }
        let upload = self.uploads.entry(upload_id).or_insert_with(|| Upload {
            total_len,
            data: Vec::new(),
        });
        if upload.total_len != total_len || upload.data.len() as u64 != offset {
            return failure(
                DeviceErrorCode::OperationRefused,
                format!("expected offset {} of {}", upload.data.len(), upload.total_len),
            );
        }
        if offset + data.len() as u64 > total_len {
            return failure(DeviceErrorCode::InvalidPackage, "chunk overruns declared length");
        }
        upload.data.extend_from_slice(&data);
        Outcome::Reply(Response::UploadAck {
            upload_id,
            received: upload.data.len() as u64,
        })
    }

    fn install(&mut self, upload_id: Uuid, label: &str) -> Outcome {
        let Some(upload) = self.uploads.get(&upload_id) else {
            return failure(DeviceErrorCode::UnknownUpload, format!("no upload {upload_id}"));
        };
        if upload.data.len() as u64 != upload.total_len {
            return failure(DeviceErrorCode::InvalidPackage, "upload incomplete");
        }
        if let Some(code) = self.faults.reject_install {
            return failure(code, "install rejected");
        }

        let app = AppDescriptor {
            app_id: app_id_for(label),
            name: if label.is_empty() {
                "Unnamed".to_string()
            } else {
                label.to_string()
            },
            version: "1.0.0".to_string(),
            running: false,
        };
        if self.install_polls == 0 {
            return Outcome::Reply(Response::InstallStatus(self.complete(upload_id, app)));
        }
        self.installs.insert(
            upload_id,
            PendingInstall {
                app,
                polls_left: self.install_polls,
            },
        );
        Outcome::Reply(Response::InstallStatus(InstallStatus::Pending))
    }

    fn query_install(&mut self, upload_id: Uuid) -> Outcome {
        let Some(pending) = self.installs.get_mut(&upload_id) else {
            return failure(DeviceErrorCode::UnknownUpload, format!("no install {upload_id}"));
        };
        pending.polls_left = pending.polls_left.saturating_sub(1);
        if pending.polls_left > 0 {
            return Outcome::Reply(Response::InstallStatus(InstallStatus::Pending));
        }
        match self.installs.remove(&upload_id) {
            Some(done) => {
                Outcome::Reply(Response::InstallStatus(self.complete(upload_id, done.app)))
            }
            None => failure(DeviceErrorCode::UnknownUpload, format!("no install {upload_id}")),
        }
    }

    fn complete(&mut self, upload_id: Uuid, app: AppDescriptor) -> InstallStatus {
        self.uploads.remove(&upload_id);
        let app_id = app.app_id.clone();
        match self.find(&app_id) {
            Some(i) => self.apps[i] = app,
            None => self.apps.push(app),
        }
        InstallStatus::Installed { app_id }
    }
}

// ── Fleet ─────────────────────────────────────────────────────────────────────

/// Several simulated devices, selected by descriptor address.
#[derive(Debug, Clone, Default)]
pub struct SimulatedFleet {
    devices: HashMap<String, SimulatedDevice>,
}

impl SimulatedFleet {
    pub fn new() -> Self {
        Self::default()
    }

    /// Makes `device` reachable at `address`.
    pub fn with_device(mut self, address: impl Into<String>, device: SimulatedDevice) -> Self {
        self.devices.insert(address.into(), device);
        self
    }

    pub fn device(&self, address: &str) -> Option<&SimulatedDevice> {
        self.devices.get(address)
    }
}

#[async_trait]
impl Transport for SimulatedFleet {
    async fn open(
        &self,
        device: &DeviceDescriptor,
        timeout: Duration,
    ) -> Result<Box<dyn TransportHandle>, ConnectError> {
        match self.devices.get(&device.address) {
            Some(sim) => sim.open(device, timeout).await,
            None => Err(ConnectError::NotFound {
                address: device.address.clone(),
            }),
        }
    }
}

// ── Tests ─────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use devlink_core::{decode_response, encode_command};

    fn descriptor() -> DeviceDescriptor {
        DeviceDescriptor::new("sim", "sim://0")
    }

    async fn round_trip(link: &mut Box<dyn TransportHandle>, cmd: &Command) -> Response {
        link.send(&encode_command(cmd, 1)).await.unwrap();
        let bytes = link.receive(Duration::from_millis(10)).await.unwrap();
        decode_response(&bytes, cmd.kind()).unwrap().0
    }

    #[tokio::test]
    async fn test_launch_then_list_running() {
        // Arrange
        let device = SimulatedDevice::demo();
        let mut link = device.open(&descriptor(), Duration::from_secs(1)).await.unwrap();

        // Act
        round_trip(
            &mut link,
            &Command::LaunchApp {
                app_id: "app://notes".to_string(),
            },
        )
        .await;
        let running = round_trip(&mut link, &Command::ListRunningApps).await;

        // Assert
        let Response::AppList(apps) = running else {
            panic!("expected app list");
        };
        let ids: Vec<_> = apps.iter().map(|a| a.app_id.as_str()).collect();
        assert_eq!(ids, vec!["app://clock", "app://notes"]);
    }

    #[tokio::test]
    async fn test_out_of_order_chunk_is_refused() {
        let device = SimulatedDevice::demo();
        let mut link = device.open(&descriptor(), Duration::from_secs(1)).await.unwrap();

        let resp = round_trip(
            &mut link,
            &Command::UploadChunk {
                upload_id: Uuid::new_v4(),
                offset: 4,
                total_len: 8,
                data: vec![0; 4],
            },
        )
        .await;

        assert!(matches!(
            resp,
            Response::Failure(DeviceFailure {
                code: DeviceErrorCode::OperationRefused,
                ..
            })
        ));
    }

    #[tokio::test]
    async fn test_close_is_counted_once_per_link() {
        let device = SimulatedDevice::demo();
        let mut link = device.open(&descriptor(), Duration::from_secs(1)).await.unwrap();

        link.close().await;
        link.close().await;

        let stats = device.stats();
        assert_eq!(stats.released, 1);
        assert_eq!(stats.close_calls, 2);
        assert_eq!(stats.open_links(), 0);
        assert!(matches!(
            link.send(&[0]).await,
            Err(LinkError::HandleClosed)
        ));
    }

    #[tokio::test]
    async fn test_stalled_command_times_out_on_receive() {
        let device = SimulatedDevice::demo();
        device.stall_responses(CommandKind::GetDeviceInfo, 1);
        let mut link = device.open(&descriptor(), Duration::from_secs(1)).await.unwrap();

        link.send(&encode_command(&Command::GetDeviceInfo, 1))
            .await
            .unwrap();
        let result = link.receive(Duration::from_millis(5)).await;

        assert!(matches!(result, Err(LinkError::Timeout(_))));
        assert_eq!(device.stats().count(CommandKind::GetDeviceInfo), 1);
    }

    #[tokio::test]
    async fn test_dropped_link_reports_closed() {
        let device = SimulatedDevice::demo();
        device.drop_link_after_frames(0);
        let mut link = device.open(&descriptor(), Duration::from_secs(1)).await.unwrap();

        link.send(&encode_command(&Command::ListInstalledApps, 1))
            .await
            .unwrap();

        assert!(matches!(
            link.receive(Duration::from_millis(5)).await,
            Err(LinkError::Closed)
        ));
        assert!(device.stats().commands.is_empty());
    }

    #[tokio::test]
    async fn test_fleet_unknown_address_is_not_found() {
        let fleet = SimulatedFleet::new().with_device("sim://a", SimulatedDevice::demo());

        let result = fleet
            .open(&DeviceDescriptor::new("b", "sim://b"), Duration::from_secs(1))
            .await;

        assert!(matches!(result, Err(ConnectError::NotFound { .. })));
    }

    #[test]
    fn test_app_id_is_derived_from_label() {
        assert_eq!(app_id_for("My Game"), "app://my-game");
        assert_eq!(app_id_for("  "), "app://unnamed");
    }
}
