use serde::Serialize;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum DeviceStatus {
    Ready,
    Offline,
    Unauthorized,
    Unknown,
}

impl DeviceStatus {
    /// Maps the state column of `adb devices`.
    pub fn from_adb_state(state: &str) -> Self {
        match state {
            "device" => DeviceStatus::Ready,
            "offline" => DeviceStatus::Offline,
            "unauthorized" => DeviceStatus::Unauthorized,
            _ => DeviceStatus::Unknown,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            DeviceStatus::Ready => "ready",
            DeviceStatus::Offline => "offline",
            DeviceStatus::Unauthorized => "unauthorized",
            DeviceStatus::Unknown => "unknown",
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct DeviceConnection {
    pub identifier: String,
    pub status: DeviceStatus,
}

impl DeviceConnection {
    pub fn new(identifier: impl Into<String>, status: DeviceStatus) -> Self {
        Self {
            identifier: identifier.into(),
            status,
        }
    }

    pub fn is_ready(&self) -> bool {
        self.status == DeviceStatus::Ready
    }
}

/// Flags for `install` / `install-multiple`.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct InstallOptions {
    /// `-r`: replace an existing installation.
    pub replace: bool,
    /// `-d`: allow a lower version code.
    pub allow_downgrade: bool,
    /// `-g`: grant all runtime permissions.
    pub grant_permissions: bool,
}

impl Default for InstallOptions {
    fn default() -> Self {
        Self {
            replace: true,
            allow_downgrade: false,
            grant_permissions: false,
        }
    }
}

impl InstallOptions {
    pub(crate) fn flags(&self) -> Vec<&'static str> {
        let mut flags = Vec::new();
        if self.replace {
            flags.push("-r");
        }
        if self.allow_downgrade {
            flags.push("-d");
        }
        if self.grant_permissions {
            flags.push("-g");
        }
        flags
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct InstallOutcome {
    pub units: usize,
    pub output: String,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct PushOutcome {
    pub bytes: Option<u64>,
    pub output: String,
}
