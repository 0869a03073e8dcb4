//! devlink command-line entry point.
//!
//! Runs one operation against one device and prints the outcome as a JSON
//! `CommandResult` on stdout.  Logs go to stderr.
//!
//! # Usage
//!
//! ```text
//! devlink [--config PATH] [--device ID | --address HOST:PORT] [--simulate] <COMMAND>
//!
//! Commands:
//!   info                     Device model, OS version and id
//!   running                  Apps currently running
//!   installed                Apps installed
//!   install URL [--label L]  Download a package and install it
//!   uninstall APP            Remove an installed app
//!   launch APP               Start an app
//!   close APP                Stop an app
//! ```
//!
//! # Environment variable overrides
//!
//! | Variable          | Description                                   |
//! |-------------------|-----------------------------------------------|
//! | `DEVLINK_CONFIG`  | Config file path (default: platform dir)      |
//! | `DEVLINK_DEVICE`  | Device id from the `[[devices]]` registry     |
//! | `DEVLINK_ADDRESS` | Ad-hoc device address, bypasses the registry  |
//! | `RUST_LOG`        | Log filter; overrides `manager.log_level`     |
//!
//! The exit status is 0 when the operation succeeded and 1 otherwise.

use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;

use anyhow::{bail, Context};
use clap::{Parser, Subcommand};
use devlink::application::app_manager::AppManager;
use devlink::application::error::ManagerError;
use devlink::application::transport::Transport;
use devlink::infrastructure::command_bridge::{CommandBridge, CommandResult};
use devlink::infrastructure::downloader::HttpDownloader;
use devlink::infrastructure::storage::config::{load_config, load_config_from, AppConfig};
use devlink::infrastructure::transport::{SimulatedDevice, TcpTransport};
use devlink_core::DeviceDescriptor;
use serde::Serialize;
use tracing::{debug, info};
use tracing_subscriber::EnvFilter;

/// Device id used for `--address` and `--simulate` targets.
const AD_HOC_DEVICE: &str = "cli";

// ── CLI argument definitions ──────────────────────────────────────────────────

/// Inspect and manage applications on a connected device.
#[derive(Debug, Parser)]
#[command(name = "devlink", about = "Manage applications on a connected device", version)]
struct Cli {
    /// Config file to use instead of the platform default.
    #[arg(long, env = "DEVLINK_CONFIG")]
    config: Option<PathBuf>,

    /// Device id from the config registry.
    #[arg(long, env = "DEVLINK_DEVICE", conflicts_with = "address")]
    device: Option<String>,

    /// Device address (`host:port`), bypassing the registry.
    #[arg(long, env = "DEVLINK_ADDRESS")]
    address: Option<String>,

    /// Talk to a built-in simulated device instead of real hardware.
    #[arg(long)]
    simulate: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Print device model, OS version and id.
    Info,
    /// List running apps.
    Running,
    /// List installed apps.
    Installed,
    /// Download a package and install it.
    Install {
        url: String,
        /// Display label; defaults to the package file name.
        #[arg(long)]
        label: Option<String>,
    },
    /// Remove an installed app.
    Uninstall { app_id: String },
    /// Start an app.
    Launch { app_id: String },
    /// Stop a running app.
    Close { app_id: String },
}

// ── Entry point ───────────────────────────────────────────────────────────────

#[tokio::main]
async fn main() -> anyhow::Result<ExitCode> {
    let cli = Cli::parse();

    let config = match &cli.config {
        Some(path) => load_config_from(path)
            .with_context(|| format!("failed to load config from {}", path.display()))?,
        None => load_config().context("failed to load config")?,
    };

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new(&config.manager.log_level)),
        )
        .with_writer(std::io::stderr)
        .init();

    let (bridge, device_id) = build_bridge(&cli, &config)?;
    info!(device = %device_id, "devlink {:?}", cli.command);

    let ok = match cli.command {
        Command::Info => emit(bridge.get_device_info(&device_id).await)?,
        Command::Running => emit(bridge.get_running_apps(&device_id).await)?,
        Command::Installed => emit(bridge.get_installed_apps(&device_id).await)?,
        Command::Install { url, label } => {
            let label = label.unwrap_or_else(|| label_from_url(&url));
            emit(
                bridge
                    .install_packaged_app_from_url(&device_id, &url, &label)
                    .await,
            )?
        }
        Command::Uninstall { app_id } => emit(bridge.uninstall_app(&device_id, &app_id).await)?,
        Command::Launch { app_id } => emit(bridge.launch_app(&device_id, &app_id).await)?,
        Command::Close { app_id } => emit(bridge.close_app(&device_id, &app_id).await)?,
    };

    Ok(if ok { ExitCode::SUCCESS } else { ExitCode::FAILURE })
}

/// Wires transport, downloader and registry, and picks the target device id.
fn build_bridge(cli: &Cli, config: &AppConfig) -> anyhow::Result<(CommandBridge, String)> {
    let transport: Arc<dyn Transport> = if cli.simulate {
        Arc::new(SimulatedDevice::demo())
    } else {
        Arc::new(TcpTransport::new())
    };
    let downloader =
        HttpDownloader::new(config.download_timeout(), config.download.max_package_bytes)
            .context("failed to initialise HTTP client")?;
    let manager = AppManager::new(
        transport,
        Arc::new(downloader),
        config.session_config(),
        config.install_settings(),
    );

    let mut devices: Vec<DeviceDescriptor> =
        config.devices.iter().map(|d| d.descriptor()).collect();

    let device_id = if cli.simulate || cli.address.is_some() {
        let address = cli.address.clone().unwrap_or_else(|| "sim://demo".to_string());
        devices.push(DeviceDescriptor::new(AD_HOC_DEVICE, address));
        AD_HOC_DEVICE.to_string()
    } else {
        match cli.device.clone().or_else(|| config.manager.default_device.clone()) {
            Some(id) => id,
            None => bail!("no device selected: pass --device, --address or --simulate"),
        }
    };
    debug!(registered = devices.len(), "device registry loaded");

    let bridge = CommandBridge::new(manager, devices, config.manager.serialize_per_device);
    Ok((bridge, device_id))
}

/// Prints `result` as a JSON envelope and reports whether it succeeded.
fn emit<T: Serialize>(result: Result<T, ManagerError>) -> anyhow::Result<bool> {
    let envelope = CommandResult::from_result(result);
    let json = serde_json::to_string_pretty(&envelope).context("failed to encode result")?;
    println!("{json}");
    Ok(envelope.success)
}

/// `https://host/path/Maps-1.2.pkg?x=1` → `Maps-1.2`.
fn label_from_url(url: &str) -> String {
    let path = url.split(['?', '#']).next().unwrap_or(url);
    let file = path.rsplit('/').next().unwrap_or(path);
    let stem = file.rsplit_once('.').map_or(file, |(stem, _)| stem);
    if stem.is_empty() {
        "app".to_string()
    } else {
        stem.to_string()
    }
}

// ── Tests ─────────────────────────────────────────────────────────────────────
