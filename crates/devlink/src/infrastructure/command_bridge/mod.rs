//! Command bridge: the caller-facing operation API.
//!
//! Front ends (the `devlink` CLI, a desktop shell, a message-bus adapter)
//! call one async function per operation with plain parameters: a device
//! identifier from the registry, an app id, a URL.  The bridge resolves the
//! identifier, optionally queues the call behind other work on the same
//! device, and delegates to [`AppManager`].  Session and transport types never
//! cross this boundary.
//!
//! # Data Transfer Objects (DTOs)
//!
//! Results are returned as small serialisable structs (`DeviceInfoDto`,
//! `AppDto`, `InstallDto`) so the JSON shape seen by front ends does not move
//! when the wire types do.
//!
//! # `CommandResult<T>` wrapper
//!
//! [`CommandResult::from_result`] turns any operation outcome into the same
//! JSON shape: `{ success, data, error, kind }`.  `kind` is the stable error
//! category from [`ManagerError::kind`], so consumers can branch on it
//! without parsing messages.

use std::collections::HashMap;
use std::future::Future;

use devlink_core::{AppDescriptor, DeviceDescriptor, DeviceId, DeviceInfo};
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::application::app_manager::AppManager;
use crate::application::error::ManagerError;
use crate::infrastructure::device_queue::DeviceQueue;
use crate::infrastructure::storage::config::AppConfig;

// ── Data Transfer Objects ─────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeviceInfoDto {
    pub model: String,
    pub os_version: String,
    pub device_id: String,
}

impl From<DeviceInfo> for DeviceInfoDto {
    fn from(info: DeviceInfo) -> Self {
        Self {
            model: info.model,
            os_version: info.os_version,
            device_id: info.device_id,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AppDto {
    pub app_id: String,
    pub name: String,
    pub version: String,
    pub running: bool,
}

impl From<AppDescriptor> for AppDto {
    fn from(app: AppDescriptor) -> Self {
        Self {
            app_id: app.app_id,
            name: app.name,
            version: app.version,
            running: app.running,
        }
    }
}

/// Outcome of a successful install.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InstallDto {
    pub app_id: String,
}

/// Unified response envelope.
#[derive(Debug, Serialize, Deserialize)]
pub struct CommandResult<T: Serialize> {
    pub success: bool,
    pub data: Option<T>,
    pub error: Option<String>,
    /// Error category, see [`ManagerError::kind`].
    pub kind: Option<String>,
}

impl<T: Serialize> CommandResult<T> {
    pub fn ok(data: T) -> Self {
        Self {
            success: true,
            data: Some(data),
            error: None,
            kind: None,
        }
    }

    pub fn err(msg: impl Into<String>) -> Self {
        Self {
            success: false,
            data: None,
            error: Some(msg.into()),
            kind: None,
        }
    }

    pub fn from_result(result: Result<T, ManagerError>) -> Self {
        match result {
            Ok(data) => Self::ok(data),
            Err(e) => Self {
                kind: Some(e.kind().to_string()),
                ..Self::err(e.to_string())
            },
        }
    }
}

// ── Bridge ────────────────────────────────────────────────────────────────────

/// Resolves device identifiers and runs operations on them.
pub struct CommandBridge {
    manager: AppManager,
    devices: HashMap<DeviceId, DeviceDescriptor>,
    queue: Option<DeviceQueue>,
}

impl CommandBridge {
    /// Creates a bridge over `devices`.  With `serialize_per_device` set,
    /// operations on the same device address run one at a time.
    pub fn new(
        manager: AppManager,
        devices: impl IntoIterator<Item = DeviceDescriptor>,
        serialize_per_device: bool,
    ) -> Self {
        Self {
            manager,
            devices: devices.into_iter().map(|d| (d.id.clone(), d)).collect(),
            queue: serialize_per_device.then(DeviceQueue::new),
        }
    }

    /// Creates a bridge over the devices registered in `config`.
    pub fn from_config(manager: AppManager, config: &AppConfig) -> Self {
        Self::new(
            manager,
            config.devices.iter().map(|d| d.descriptor()),
            config.manager.serialize_per_device,
        )
    }

    /// Looks up `device_id` in the registry.
    ///
    /// # Errors
    ///
    /// [`ManagerError::UnknownDevice`] if it is not registered.
    pub fn resolve(&self, device_id: &str) -> Result<&DeviceDescriptor, ManagerError> {
        self.devices
            .get(&DeviceId::new(device_id))
            .ok_or_else(|| ManagerError::UnknownDevice(device_id.to_string()))
    }

    pub async fn get_device_info(&self, device_id: &str) -> Result<DeviceInfoDto, ManagerError> {
        let device = self.resolve(device_id)?;
        let info = self
            .serialized(device, self.manager.get_device_info(device))
            .await?;
        Ok(info.into())
    }

    pub async fn get_running_apps(&self, device_id: &str) -> Result<Vec<AppDto>, ManagerError> {
        let device = self.resolve(device_id)?;
        let apps = self
            .serialized(device, self.manager.get_running_apps(device))
            .await?;
        Ok(apps.into_iter().map(AppDto::from).collect())
    }

    pub async fn get_installed_apps(&self, device_id: &str) -> Result<Vec<AppDto>, ManagerError> {
        let device = self.resolve(device_id)?;
        let apps = self
            .serialized(device, self.manager.get_installed_apps(device))
            .await?;
        Ok(apps.into_iter().map(AppDto::from).collect())
    }

    pub async fn launch_app(&self, device_id: &str, app_id: &str) -> Result<(), ManagerError> {
        let device = self.resolve(device_id)?;
        self.serialized(device, self.manager.launch_app(device, app_id))
            .await
    }

    pub async fn close_app(&self, device_id: &str, app_id: &str) -> Result<(), ManagerError> {
        let device = self.resolve(device_id)?;
        self.serialized(device, self.manager.close_app(device, app_id))
            .await
    }

    pub async fn uninstall_app(&self, device_id: &str, app_id: &str) -> Result<(), ManagerError> {
        let device = self.resolve(device_id)?;
        self.serialized(device, self.manager.uninstall_app(device, app_id))
            .await
    }

    pub async fn install_packaged_app_from_url(
        &self,
        device_id: &str,
        url: &str,
        label: &str,
    ) -> Result<InstallDto, ManagerError> {
        let device = self.resolve(device_id)?;
        let app_id = self
            .serialized(
                device,
                self.manager.install_packaged_app_from_url(device, url, label),
            )
            .await?;
        Ok(InstallDto { app_id })
    }

    async fn serialized<T>(&self, device: &DeviceDescriptor, op: impl Future<Output = T>) -> T {
        match &self.queue {
            Some(queue) => {
                debug!(device = %device.id, address = %device.address, "queued");
                queue.run(&device.address, op).await
            }
            None => op.await,
        }
    }
}

// ── Tests ─────────────────────────────────────────────────────────────────────
