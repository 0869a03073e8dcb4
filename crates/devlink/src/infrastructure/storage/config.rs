//! TOML-based configuration for devlink.
//!
//! Reads `AppConfig` from the platform-appropriate path:
//! - Windows:  `%APPDATA%\Devlink\config.toml`
//! - Linux:    `~/.config/devlink/config.toml`
//! - macOS:    `~/Library/Application Support/Devlink/config.toml`
//!
//! A missing file is not an error: every field has a default, so the tool
//! works on first run and with config files written by older versions.
//!
//! ```toml
//! [manager]
//! log_level = "debug"
//! default_device = "bench-phone"
//!
//! [session]
//! command_timeout_ms = 5000
//!
//! [[devices]]
//! id = "bench-phone"
//! address = "192.168.1.40:5555"
//! ```

use std::path::{Path, PathBuf};
use std::time::Duration;

use devlink_core::DeviceDescriptor;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::application::install::InstallSettings;
use crate::application::session::SessionConfig;

/// Error type for configuration file operations.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// The platform config directory could not be determined.
    #[error("could not determine platform config directory")]
    NoPlatformConfigDir,

    /// A file system I/O error occurred.
    #[error("I/O error accessing config at {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// The TOML content could not be parsed.
    #[error("failed to parse config TOML: {0}")]
    Parse(#[from] toml::de::Error),
}

// ── Config schema types ───────────────────────────────────────────────────────

/// Top-level configuration stored on disk.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct AppConfig {
    #[serde(default)]
    pub manager: ManagerSection,
    #[serde(default)]
    pub session: SessionSection,
    #[serde(default)]
    pub download: DownloadSection,
    /// Device registry; operations name devices by `id`.
    #[serde(default)]
    pub devices: Vec<DeviceEntry>,
}

/// General behaviour.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ManagerSection {
    /// `tracing` level used when `RUST_LOG` is unset.
    #[serde(default = "default_log_level")]
    pub log_level: String,
    /// Device used when none is named on the command line.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub default_device: Option<String>,
    /// Run at most one operation per device at a time.
    #[serde(default = "default_true")]
    pub serialize_per_device: bool,
}

/// Session and install timing.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct SessionSection {
    #[serde(default = "default_connect_timeout_ms")]
    pub connect_timeout_ms: u64,
    #[serde(default = "default_command_timeout_ms")]
    pub command_timeout_ms: u64,
    /// Total time allowed for the device to finish installing.
    #[serde(default = "default_install_timeout_secs")]
    pub install_timeout_secs: u64,
    #[serde(default = "default_poll_interval_ms")]
    pub poll_interval_ms: u64,
    /// Bytes per `UploadChunk`.
    #[serde(default = "default_upload_chunk_size")]
    pub upload_chunk_size: usize,
}

/// Package download limits.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct DownloadSection {
    #[serde(default = "default_download_timeout_secs")]
    pub timeout_secs: u64,
    #[serde(default = "default_max_package_bytes")]
    pub max_package_bytes: u64,
}

/// One known device.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct DeviceEntry {
    pub id: String,
    /// Transport address, e.g. `host:port`.
    pub address: String,
}

impl DeviceEntry {
    pub fn descriptor(&self) -> DeviceDescriptor {
        DeviceDescriptor::new(self.id.as_str(), self.address.as_str())
    }
}

// ── Default helpers ───────────────────────────────────────────────────────────

fn default_log_level() -> String {
    "info".to_string()
}
fn default_true() -> bool {
    true
}
fn default_connect_timeout_ms() -> u64 {
    5_000
}
fn default_command_timeout_ms() -> u64 {
    10_000
}
fn default_install_timeout_secs() -> u64 {
    120
}
fn default_poll_interval_ms() -> u64 {
    500
}
fn default_upload_chunk_size() -> usize {
    64 * 1024
}
fn default_download_timeout_secs() -> u64 {
    60
}
fn default_max_package_bytes() -> u64 {
    256 * 1024 * 1024
}

impl Default for ManagerSection {
    fn default() -> Self {
        Self {
            log_level: default_log_level(),
            default_device: None,
            serialize_per_device: default_true(),
        }
    }
}

impl Default for SessionSection {
    fn default() -> Self {
        Self {
            connect_timeout_ms: default_connect_timeout_ms(),
            command_timeout_ms: default_command_timeout_ms(),
            install_timeout_secs: default_install_timeout_secs(),
            poll_interval_ms: default_poll_interval_ms(),
            upload_chunk_size: default_upload_chunk_size(),
        }
    }
}

impl Default for DownloadSection {
    fn default() -> Self {
        Self {
            timeout_secs: default_download_timeout_secs(),
            max_package_bytes: default_max_package_bytes(),
        }
    }
}

impl AppConfig {
    pub fn session_config(&self) -> SessionConfig {
        SessionConfig {
            connect_timeout: Duration::from_millis(self.session.connect_timeout_ms),
            command_timeout: Duration::from_millis(self.session.command_timeout_ms),
            ..SessionConfig::default()
        }
    }

    pub fn install_settings(&self) -> InstallSettings {
        InstallSettings {
            chunk_size: self.session.upload_chunk_size,
            poll_interval: Duration::from_millis(self.session.poll_interval_ms),
            install_timeout: Duration::from_secs(self.session.install_timeout_secs),
        }
    }

    pub fn download_timeout(&self) -> Duration {
        Duration::from_secs(self.download.timeout_secs)
    }
}

// ── Config repository ─────────────────────────────────────────────────────────

/// Resolves the full path to the default config file.
///
/// # Errors
///
/// Returns [`ConfigError::NoPlatformConfigDir`] if the base directory cannot be
/// determined.
pub fn config_file_path() -> Result<PathBuf, ConfigError> {
    Ok(platform_config_dir()
        .ok_or(ConfigError::NoPlatformConfigDir)?
        .join("config.toml"))
}

/// Loads `AppConfig` from the default location, or defaults if absent.
///
/// # Errors
///
/// See [`load_config_from`].
pub fn load_config() -> Result<AppConfig, ConfigError> {
    load_config_from(&config_file_path()?)
}

/// Loads `AppConfig` from `path`, returning `AppConfig::default()` if the file
/// does not exist.
///
/// # Errors
///
/// Returns [`ConfigError::Io`] for file-system errors other than "not found",
/// and [`ConfigError::Parse`] if the TOML is malformed.
pub fn load_config_from(path: &Path) -> Result<AppConfig, ConfigError> {
    match std::fs::read_to_string(path) {
        Ok(content) => Ok(toml::from_str(&content)?),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(AppConfig::default()),
        Err(e) => Err(ConfigError::Io {
            path: path.to_path_buf(),
            source: e,
        }),
    }
}

fn platform_config_dir() -> Option<PathBuf> {
    #[cfg(target_os = "windows")]
    {
        std::env::var_os("APPDATA").map(|p| PathBuf::from(p).join("Devlink"))
    }

    #[cfg(target_os = "linux")]
    {
        let base = std::env::var_os("XDG_CONFIG_HOME")
            .map(PathBuf::from)
            .or_else(|| std::env::var_os("HOME").map(|h| PathBuf::from(h).join(".config")))?;
        Some(base.join("devlink"))
    }

    #[cfg(target_os = "macos")]
    {
        std::env::var_os("HOME").map(|h| {
            PathBuf::from(h)
                .join("Library")
                .join("Application Support")
                .join("Devlink")
        })
    }

    #[cfg(not(any(target_os = "windows", target_os = "linux", target_os = "macos")))]
    {
        None
    }
}

// ── Tests ─────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use uuid::Uuid;

    fn temp_path() -> PathBuf {
        std::env::temp_dir()
            .join(format!("devlink_test_{}", Uuid::new_v4()))
            .join("config.toml")
    }

    #[test]
    fn test_default_config_values() {
        // Arrange / Act
        let cfg = AppConfig::default();

        // Assert
        assert_eq!(cfg.manager.log_level, "info");
        assert!(cfg.manager.serialize_per_device);
        assert_eq!(cfg.session.command_timeout_ms, 10_000);
        assert_eq!(cfg.session.upload_chunk_size, 64 * 1024);
        assert!(cfg.devices.is_empty());
    }

    #[test]
    fn test_empty_toml_is_all_defaults() {
        let cfg: AppConfig = toml::from_str("").expect("deserialize empty");
        assert_eq!(cfg, AppConfig::default());
    }

    #[test]
    fn test_partial_section_overrides_only_named_fields() {
        // Arrange
        let toml_str = r#"
[session]
command_timeout_ms = 2500

[[devices]]
id = "bench"
address = "10.0.0.7:5555"
"#;

        // Act
        let cfg: AppConfig = toml::from_str(toml_str).expect("deserialize partial");

        // Assert
        assert_eq!(cfg.session.command_timeout_ms, 2500);
        assert_eq!(cfg.session.connect_timeout_ms, 5_000);
        assert_eq!(cfg.devices.len(), 1);
        let bench = cfg.devices[0].descriptor();
        assert_eq!(bench.id.as_str(), "bench");
        assert_eq!(bench.address, "10.0.0.7:5555");
    }

    #[test]
    fn test_session_and_install_settings_are_derived() {
        let mut cfg = AppConfig::default();
        cfg.session.command_timeout_ms = 750;
        cfg.session.poll_interval_ms = 20;
        cfg.session.install_timeout_secs = 3;

        let session = cfg.session_config();
        let install = cfg.install_settings();

        assert_eq!(session.command_timeout, Duration::from_millis(750));
        assert_eq!(install.poll_interval, Duration::from_millis(20));
        assert_eq!(install.install_timeout, Duration::from_secs(3));
    }

    #[test]
    fn test_invalid_toml_is_parse_error() {
        let path = temp_path();
        std::fs::create_dir_all(path.parent().unwrap()).unwrap();
        std::fs::write(&path, "[[[ not valid toml").unwrap();

        let result = load_config_from(&path);

        assert!(matches!(result, Err(ConfigError::Parse(_))));
        std::fs::remove_dir_all(path.parent().unwrap()).ok();
    }

    #[test]
    fn test_missing_file_yields_defaults() {
        let result = load_config_from(Path::new("/nonexistent/devlink/config.toml"));
        assert_eq!(result.unwrap(), AppConfig::default());
    }

    #[test]
    fn test_load_reads_registry_from_file() {
        // Arrange
        let path = temp_path();
        std::fs::create_dir_all(path.parent().unwrap()).unwrap();
        let content = r#"
[manager]
default_device = "bench"

[[devices]]
id = "bench"
address = "10.0.0.7:5555"
"#;
        std::fs::write(&path, content).unwrap();

        // Act
        let loaded = load_config_from(&path).expect("load");

        // Assert
        assert_eq!(loaded.manager.default_device.as_deref(), Some("bench"));
        assert_eq!(loaded.devices[0].address, "10.0.0.7:5555");

        // Cleanup
        std::fs::remove_dir_all(path.parent().unwrap()).ok();
    }

    #[test]
    fn test_config_file_path_ends_with_config_toml() {
        if let Ok(path) = config_file_path() {
            assert!(path.ends_with("config.toml"), "got {path:?}");
        }
    }
}
