//! Typed access to an Android guest through the `adb` command-line tool.
//!
//! [`DeviceBridge`] is the seam the installer talks to; [`AdbBridge`] is the
//! process-backed implementation. Every verb is one independent adb
//! invocation, so the bridge is safe to share, but it does not stop two
//! callers from installing onto the same guest at once.

mod adb;
mod device;
mod error;
pub mod ids;
pub mod parse;

use std::path::{Path, PathBuf};
use std::time::Duration;

use async_trait::async_trait;

pub use adb::{adb_path, AdbBridge, DEFAULT_POLL_INTERVAL};
pub use device::{DeviceConnection, DeviceStatus, InstallOptions, InstallOutcome, PushOutcome};
pub use error::BridgeError;

/// Property that flips to `1` once the guest finished booting.
pub const BOOT_COMPLETED_PROP: &str = "sys.boot_completed";
pub const SDK_LEVEL_PROP: &str = "ro.build.version.sdk";

#[async_trait]
pub trait DeviceBridge: Send + Sync {
    async fn list_devices(&self) -> Result<Vec<DeviceConnection>, BridgeError>;

    /// Polls until a device is ready and booted, or `timeout` elapses.
    async fn ensure_ready(&self, timeout: Duration) -> Result<DeviceConnection, BridgeError>;

    async fn install_units(
        &self,
        paths: &[PathBuf],
        options: &InstallOptions,
    ) -> Result<InstallOutcome, BridgeError>;

    async fn push_file(&self, local: &Path, remote: &str) -> Result<PushOutcome, BridgeError>;

    async fn run_shell(&self, command: &str) -> Result<String, BridgeError>;

    async fn uninstall(&self, package_id: &str, keep_data: bool) -> Result<(), BridgeError>;

    async fn connect(&self, _addr: &str) -> Result<String, BridgeError> {
        Ok(String::new())
    }

    async fn disconnect(&self) -> Result<(), BridgeError> {
        Ok(())
    }

    async fn list_packages(&self) -> Result<Vec<String>, BridgeError> {
        let output = self.run_shell("pm list packages").await?;
        Ok(parse::parse_packages(&output))
    }

    async fn logcat(&self, lines: u32) -> Result<String, BridgeError> {
        self.run_shell(&format!("logcat -d -t {lines}")).await
    }

    async fn api_level(&self) -> Result<Option<u32>, BridgeError> {
        let output = self
            .run_shell(&format!("getprop {SDK_LEVEL_PROP}"))
            .await?;
        Ok(output.trim().parse().ok())
    }
}
