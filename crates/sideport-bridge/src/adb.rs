use std::{
    io,
    path::{Path, PathBuf},
    process::{Output, Stdio},
    sync::Mutex,
    time::Duration,
};

use async_trait::async_trait;
use sideport_util::read_env_trimmed;
use tokio::{process::Command, time::Instant};
use tracing::{debug, info, warn};

use crate::device::{DeviceConnection, InstallOptions, InstallOutcome, PushOutcome};
use crate::error::BridgeError;
use crate::ids::{canonicalize_adb_serial, same_device};
use crate::parse::{
    format_adb_output, install_succeeded, looks_like_connection_loss, parse_devices,
    parse_push_bytes,
};
use crate::{DeviceBridge, BOOT_COMPLETED_PROP};

pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_secs(2);
const PROP_TIMEOUT: Duration = Duration::from_secs(2);

#[derive(Debug)]
enum AdbFailure {
    NotFound,
    Io(String),
    Exit {
        status: i32,
        stdout: String,
        stderr: String,
    },
}

pub fn adb_path() -> PathBuf {
    if let Some(path) = read_env_trimmed("SIDEPORT_ADB_PATH") {
        return PathBuf::from(path);
    }
    if let Some(path) = read_env_trimmed("ADB_PATH") {
        return PathBuf::from(path);
    }
    if let Some(sdk_root) =
        read_env_trimmed("ANDROID_SDK_ROOT").or_else(|| read_env_trimmed("ANDROID_HOME"))
    {
        let tools = PathBuf::from(&sdk_root).join("platform-tools");
        for name in ["adb", "adb.exe"] {
            let candidate = tools.join(name);
            if candidate.exists() {
                return candidate;
            }
        }
    }
    PathBuf::from("adb")
}

fn format_adb_failure_message(status: i32, stdout: &str, stderr: &str) -> String {
    let detail = format_adb_output(stdout, stderr);
    if detail.trim().is_empty() {
        format!("adb command failed with exit {status}")
    } else {
        format!("adb command failed with exit {status}: {}", detail.trim())
    }
}

impl AdbFailure {
    fn into_bridge_error(self, adb: &Path) -> BridgeError {
        match self {
            AdbFailure::NotFound => BridgeError::BridgeUnavailable(format!(
                "{} not found (set SIDEPORT_ADB_PATH or ANDROID_SDK_ROOT)",
                adb.display()
            )),
            AdbFailure::Io(msg) => {
                BridgeError::BridgeUnavailable(format!("failed to run {}: {msg}", adb.display()))
            }
            AdbFailure::Exit {
                status,
                stdout,
                stderr,
            } => {
                let message = format_adb_failure_message(status, &stdout, &stderr);
                if looks_like_connection_loss(&stdout) || looks_like_connection_loss(&stderr) {
                    BridgeError::ConnectionLost(message)
                } else {
                    BridgeError::CommandFailed(message)
                }
            }
        }
    }
}

fn combined_output(output: &Output) -> String {
    let stdout = String::from_utf8_lossy(&output.stdout);
    let stderr = String::from_utf8_lossy(&output.stderr);
    format!("{}{}", stdout, stderr).trim().to_string()
}

/// [`DeviceBridge`] backed by the adb executable. Remembers the serial of the
/// last device that was seen ready and targets it with `-s`.
///
/// A bridge built with [`AdbBridge::with_serial`] is pinned: it only ever
/// targets that serial and waits for it rather than falling back to another
/// ready device.
pub struct AdbBridge {
    adb: PathBuf,
    poll_interval: Duration,
    pinned: Option<String>,
    serial_hint: Mutex<Option<String>>,
}

impl Default for AdbBridge {
    fn default() -> Self {
        Self::new()
    }
}

impl AdbBridge {
    pub fn new() -> Self {
        Self::with_adb_path(adb_path())
    }

    pub fn with_adb_path(adb: impl Into<PathBuf>) -> Self {
        Self {
            adb: adb.into(),
            poll_interval: DEFAULT_POLL_INTERVAL,
            pinned: None,
            serial_hint: Mutex::new(None),
        }
    }

    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }

    /// Pins the bridge to one device instead of whichever is ready first.
    pub fn with_serial(mut self, serial: impl AsRef<str>) -> Self {
        let serial = canonicalize_adb_serial(serial.as_ref());
        self.pinned = Some(serial.clone());
        self.set_hint(Some(serial));
        self
    }

    pub fn adb(&self) -> &Path {
        &self.adb
    }

    pub fn pinned_serial(&self) -> Option<&str> {
        self.pinned.as_deref()
    }

    /// The serial device verbs are sent to. A pinned serial always wins.
    pub fn serial_hint(&self) -> Option<String> {
        if let Some(pinned) = &self.pinned {
            return Some(pinned.clone());
        }
        self.serial_hint
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .clone()
    }

    fn set_hint(&self, serial: Option<String>) {
        if self.pinned.is_some() {
            return;
        }
        *self
            .serial_hint
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner()) = serial;
    }

    async fn output(&self, args: &[&str]) -> Result<Output, AdbFailure> {
        let mut cmd = Command::new(&self.adb);
        cmd.args(args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped());
        let output = cmd.output().await.map_err(|e| {
            if e.kind() == io::ErrorKind::NotFound {
                AdbFailure::NotFound
            } else {
                AdbFailure::Io(e.to_string())
            }
        })?;

        if output.status.success() {
            Ok(output)
        } else {
            Err(AdbFailure::Exit {
                status: output.status.code().unwrap_or(-1),
                stdout: String::from_utf8_lossy(&output.stdout).to_string(),
                stderr: String::from_utf8_lossy(&output.stderr).to_string(),
            })
        }
    }

    /// Runs a device-scoped verb, prefixed with `-s <hint>` when one is known.
    async fn device_output(&self, args: &[&str]) -> Result<Output, BridgeError> {
        let serial = self.serial_hint();
        let mut full: Vec<&str> = Vec::with_capacity(args.len() + 2);
        if let Some(serial) = serial.as_deref() {
            full.push("-s");
            full.push(serial);
        }
        full.extend_from_slice(args);
        debug!("adb {}", full.join(" "));

        match self.output(&full).await {
            Ok(output) => Ok(output),
            Err(failure) => {
                let err = failure.into_bridge_error(&self.adb);
                if matches!(err, BridgeError::ConnectionLost(_)) && serial.is_some() {
                    self.set_hint(None);
                }
                Err(err)
            }
        }
    }

    async fn get_prop(&self, serial: &str, prop: &str) -> Option<String> {
        let args = ["-s", serial, "shell", "getprop", prop];
        match tokio::time::timeout(PROP_TIMEOUT, self.output(&args)).await {
            Ok(Ok(output)) => {
                let value = String::from_utf8_lossy(&output.stdout).trim().to_string();
                (!value.is_empty()).then_some(value)
            }
            _ => None,
        }
    }

    fn pick_ready(&self, devices: &[DeviceConnection]) -> Option<DeviceConnection> {
        if let Some(pinned) = &self.pinned {
            return devices
                .iter()
                .find(|d| d.is_ready() && same_device(&d.identifier, pinned))
                .cloned();
        }
        if let Some(hint) = self.serial_hint() {
            if let Some(found) = devices
                .iter()
                .find(|d| d.is_ready() && same_device(&d.identifier, &hint))
            {
                return Some(found.clone());
            }
        }
        devices.iter().find(|d| d.is_ready()).cloned()
    }
}

#[async_trait]
impl DeviceBridge for AdbBridge {
    async fn list_devices(&self) -> Result<Vec<DeviceConnection>, BridgeError> {
        let output = self
            .output(&["devices"])
            .await
            .map_err(|e| e.into_bridge_error(&self.adb))?;
        Ok(parse_devices(&String::from_utf8_lossy(&output.stdout)))
    }

    async fn ensure_ready(&self, timeout: Duration) -> Result<DeviceConnection, BridgeError> {
        let deadline = Instant::now() + timeout;
        let mut last_seen = String::from("no devices");
        loop {
            match self.list_devices().await {
                Ok(devices) => {
                    if let Some(device) = self.pick_ready(&devices) {
                        let booted = self
                            .get_prop(&device.identifier, BOOT_COMPLETED_PROP)
                            .await;
                        if booted.as_deref() == Some("1") {
                            info!("device {} ready", device.identifier);
                            self.set_hint(Some(device.identifier.clone()));
                            return Ok(device);
                        }
                        last_seen = format!("{} booting", device.identifier);
                    } else if let Some(pinned) = &self.pinned {
                        last_seen = match devices
                            .iter()
                            .find(|d| same_device(&d.identifier, pinned))
                        {
                            Some(d) => format!("{pinned} {}", d.status.as_str()),
                            None => format!("{pinned} not attached"),
                        };
                    } else if !devices.is_empty() {
                        last_seen = devices
                            .iter()
                            .map(|d| format!("{} {}", d.identifier, d.status.as_str()))
                            .collect::<Vec<_>>()
                            .join(", ");
                    }
                }
                Err(err @ BridgeError::BridgeUnavailable(_)) => return Err(err),
                Err(err) => {
                    debug!("device poll failed: {err}");
                    last_seen = err.to_string();
                }
            }

            let now = Instant::now();
            if now >= deadline {
                return Err(BridgeError::ConnectionLost(format!(
                    "no ready device within {}s ({last_seen})",
                    timeout.as_secs()
                )));
            }
            tokio::time::sleep(self.poll_interval.min(deadline - now)).await;
        }
    }

    async fn install_units(
        &self,
        paths: &[PathBuf],
        options: &InstallOptions,
    ) -> Result<InstallOutcome, BridgeError> {
        if paths.is_empty() {
            return Err(BridgeError::CommandFailed("no units to install".into()));
        }
        let path_args: Vec<String> = paths.iter().map(|p| p.display().to_string()).collect();
        let verb = if paths.len() == 1 {
            "install"
        } else {
            "install-multiple"
        };
        let mut args = vec![verb];
        args.extend(options.flags());
        args.extend(path_args.iter().map(String::as_str));

        let output = self.device_output(&args).await?;
        let text = combined_output(&output);
        if install_succeeded(&text) {
            Ok(InstallOutcome {
                units: paths.len(),
                output: text,
            })
        } else {
            Err(BridgeError::CommandFailed(text))
        }
    }

    async fn push_file(&self, local: &Path, remote: &str) -> Result<PushOutcome, BridgeError> {
        let local = local.display().to_string();
        let output = self.device_output(&["push", &local, remote]).await?;
        let text = combined_output(&output);
        Ok(PushOutcome {
            bytes: parse_push_bytes(&text),
            output: text,
        })
    }

    async fn run_shell(&self, command: &str) -> Result<String, BridgeError> {
        let output = self.device_output(&["shell", command]).await?;
        Ok(String::from_utf8_lossy(&output.stdout).to_string())
    }

    async fn uninstall(&self, package_id: &str, keep_data: bool) -> Result<(), BridgeError> {
        let mut args = vec!["uninstall"];
        if keep_data {
            args.push("-k");
        }
        args.push(package_id);
        let output = self.device_output(&args).await?;
        let text = combined_output(&output);
        if install_succeeded(&text) {
            Ok(())
        } else {
            Err(BridgeError::CommandFailed(text))
        }
    }

    async fn connect(&self, addr: &str) -> Result<String, BridgeError> {
        let serial = canonicalize_adb_serial(addr);
        let output = self
            .output(&["connect", serial.as_str()])
            .await
            .map_err(|e| e.into_bridge_error(&self.adb))?;
        // adb exits 0 even when the connection was refused.
        let text = combined_output(&output);
        if text.contains("connected to") {
            self.set_hint(Some(serial));
            Ok(text)
        } else {
            warn!("adb connect {serial}: {text}");
            Err(BridgeError::ConnectionLost(if text.is_empty() {
                format!("adb connect {serial}: no output")
            } else {
                text
            }))
        }
    }

    async fn disconnect(&self) -> Result<(), BridgeError> {
        self.output(&["disconnect"])
            .await
            .map_err(|e| e.into_bridge_error(&self.adb))?;
        self.set_hint(None);
        Ok(())
    }

    async fn logcat(&self, lines: u32) -> Result<String, BridgeError> {
        let lines = lines.to_string();
        let output = self.device_output(&["logcat", "-d", "-t", &lines]).await?;
        Ok(String::from_utf8_lossy(&output.stdout).to_string())
    }
}
