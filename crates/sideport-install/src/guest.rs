use std::{process::Stdio, sync::Arc, time::Duration};

use async_trait::async_trait;
use sideport_bridge::{ids::canonicalize_adb_serial, parse::format_adb_output, BridgeError, DeviceBridge};
use tokio::process::Command;
use tracing::{debug, info, warn};

use crate::profile::ResourceProfile;

pub const DEFAULT_CONNECT_ATTEMPTS: u32 = 30;
pub const DEFAULT_CONNECT_INTERVAL: Duration = Duration::from_secs(2);

/// Brings a guest to the point where the bridge can reach it.
#[async_trait]
pub trait GuestProvisioner: Send + Sync {
    async fn ensure_running(
        &self,
        profile: &ResourceProfile,
        bridge: &dyn DeviceBridge,
    ) -> Result<(), BridgeError>;

    /// Keys the lease held while this guest is started and awaited.
    fn guest_key(&self) -> String;
}

/// A guest someone else manages: a plugged-in phone, an emulator already
/// running.
#[derive(Clone, Debug)]
pub struct AttachedGuest {
    key: String,
}

impl AttachedGuest {
    pub fn new(key: impl Into<String>) -> Self {
        Self { key: key.into() }
    }
}

impl Default for AttachedGuest {
    fn default() -> Self {
        Self::new("attached")
    }
}

#[async_trait]
impl GuestProvisioner for AttachedGuest {
    async fn ensure_running(
        &self,
        _profile: &ResourceProfile,
        _bridge: &dyn DeviceBridge,
    ) -> Result<(), BridgeError> {
        Ok(())
    }

    fn guest_key(&self) -> String {
        self.key.clone()
    }
}

/// A network guest started on demand by a shell command, typically
/// Cuttlefish's `launch_cvd --daemon`.
#[derive(Clone, Debug)]
pub struct CommandGuest {
    addr: String,
    start_command: String,
    connect_attempts: u32,
    connect_interval: Duration,
}

impl CommandGuest {
    pub fn new(addr: impl AsRef<str>, start_command: impl Into<String>) -> Self {
        Self {
            addr: canonicalize_adb_serial(addr.as_ref()),
            start_command: start_command.into(),
            connect_attempts: DEFAULT_CONNECT_ATTEMPTS,
            connect_interval: DEFAULT_CONNECT_INTERVAL,
        }
    }

    pub fn with_connect_retry(mut self, attempts: u32, interval: Duration) -> Self {
        self.connect_attempts = attempts.max(1);
        self.connect_interval = interval;
        self
    }

    pub fn addr(&self) -> &str {
        &self.addr
    }

    /// The start command with profile flags appended, skipping any flag the
    /// command already sets.
    pub fn launch_command(&self, profile: &ResourceProfile) -> String {
        profile
            .launch_args()
            .iter()
            .fold(self.start_command.clone(), |command, arg| {
                let flag = arg.split('=').next().unwrap_or(arg);
                append_arg_once(command, flag, arg)
            })
    }

    async fn launch(&self, profile: &ResourceProfile) -> Result<(), BridgeError> {
        let command = self.launch_command(profile);
        info!("starting guest: {command}");
        let output = Command::new("sh")
            .arg("-c")
            .arg(&command)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .output()
            .await
            .map_err(|e| {
                BridgeError::BridgeUnavailable(format!("failed to run guest start command: {e}"))
            })?;
        if output.status.success() {
            return Ok(());
        }
        let log = format_adb_output(
            &String::from_utf8_lossy(&output.stdout),
            &String::from_utf8_lossy(&output.stderr),
        );
        Err(BridgeError::CommandFailed(format!(
            "guest start command exited with {}: {}",
            output.status.code().unwrap_or(-1),
            log.trim()
        )))
    }
}

fn args_has_flag(command: &str, flag: &str) -> bool {
    let prefix = format!("{flag}=");
    command
        .split_whitespace()
        .any(|part| part == flag || part.starts_with(&prefix))
}

fn append_arg_once(mut command: String, flag: &str, arg: &str) -> String {
    if args_has_flag(&command, flag) {
        return command;
    }
    if !command.is_empty() {
        command.push(' ');
    }
    command.push_str(arg);
    command
}

#[async_trait]
impl GuestProvisioner for CommandGuest {
    async fn ensure_running(
        &self,
        profile: &ResourceProfile,
        bridge: &dyn DeviceBridge,
    ) -> Result<(), BridgeError> {
        match bridge.connect(&self.addr).await {
            Ok(_) => {
                debug!("guest {} already reachable", self.addr);
                return Ok(());
            }
            Err(err @ BridgeError::BridgeUnavailable(_)) => return Err(err),
            Err(err) => debug!("guest {} not reachable yet: {err}", self.addr),
        }

        self.launch(profile).await?;

        let mut last = None;
        for attempt in 1..=self.connect_attempts {
            match bridge.connect(&self.addr).await {
                Ok(_) => {
                    info!("guest {} reachable after {attempt} attempt(s)", self.addr);
                    return Ok(());
                }
                Err(err @ BridgeError::BridgeUnavailable(_)) => return Err(err),
                Err(err) => last = Some(err),
            }
            if attempt < self.connect_attempts {
                tokio::time::sleep(self.connect_interval).await;
            }
        }
        let err = last.unwrap_or_else(|| {
            BridgeError::ConnectionLost(format!("guest {} unreachable", self.addr))
        });
        warn!("guest {} did not come up: {err}", self.addr);
        Err(err)
    }

    fn guest_key(&self) -> String {
        self.addr.clone()
    }
}

/// A `CommandGuest` when a start command is configured, else an attached
/// guest keyed by its canonical address.
pub fn provisioner_for(addr: &str, start_command: Option<String>) -> Arc<dyn GuestProvisioner> {
    match start_command {
        Some(command) => Arc::new(CommandGuest::new(addr, command)),
        None => Arc::new(AttachedGuest::new(canonicalize_adb_serial(addr))),
    }
}
