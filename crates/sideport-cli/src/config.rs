use std::{fs, io, path::PathBuf, time::Duration};

use serde::{Deserialize, Serialize};
use sideport_install::DEFAULT_PROFILE;
use sideport_util::{
    expand_user, read_env_trimmed, state_file_path, DEFAULT_AGENT_CLIENT_ADDR,
    DEFAULT_BOOT_TIMEOUT_SECS, DEFAULT_GUEST_ADDR,
};

const CONFIG_FILE: &str = "config.json";

/// On-disk settings. Every field is optional; environment variables win over
/// the file and command-line flags win over both.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub(crate) struct FileConfig {
    pub(crate) adb_path: Option<String>,
    pub(crate) guest_addr: Option<String>,
    pub(crate) guest_start_cmd: Option<String>,
    pub(crate) boot_timeout_secs: Option<u64>,
    pub(crate) profile: Option<String>,
    pub(crate) agent_addr: Option<String>,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub(crate) struct Settings {
    pub(crate) adb_path: Option<PathBuf>,
    pub(crate) guest_addr: String,
    pub(crate) guest_start_cmd: Option<String>,
    pub(crate) boot_timeout: Duration,
    pub(crate) profile: String,
    pub(crate) agent_addr: String,
}

pub(crate) fn config_path() -> PathBuf {
    state_file_path(CONFIG_FILE)
}

fn read_file_config() -> FileConfig {
    let path = config_path();
    match fs::read_to_string(&path) {
        Ok(data) => match serde_json::from_str::<FileConfig>(&data) {
            Ok(cfg) => cfg,
            Err(err) => {
                eprintln!("Failed to parse {}: {err}", path.display());
                FileConfig::default()
            }
        },
        Err(err) => {
            if err.kind() != io::ErrorKind::NotFound {
                eprintln!("Failed to read {}: {err}", path.display());
            }
            FileConfig::default()
        }
    }
}

/// The agent listens on a wildcard address; clients dial loopback instead.
fn dialable(addr: String) -> String {
    match addr.strip_prefix("0.0.0.0:") {
        Some(port) => format!("127.0.0.1:{port}"),
        None => addr,
    }
}

fn non_empty(value: Option<String>) -> Option<String> {
    value
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
}

impl Settings {
    pub(crate) fn load() -> Self {
        Self::resolve(read_file_config(), read_env_trimmed)
    }

    pub(crate) fn resolve(file: FileConfig, env: impl Fn(&str) -> Option<String>) -> Self {
        let pick = |key: &str, from_file: Option<String>| env(key).or(non_empty(from_file));
        Self {
            adb_path: pick("SIDEPORT_ADB_PATH", file.adb_path).map(|p| expand_user(&p)),
            guest_addr: pick("SIDEPORT_GUEST_ADDR", file.guest_addr)
                .unwrap_or_else(|| DEFAULT_GUEST_ADDR.into()),
            guest_start_cmd: pick("SIDEPORT_GUEST_START_CMD", file.guest_start_cmd),
            boot_timeout: Duration::from_secs(
                env("SIDEPORT_BOOT_TIMEOUT_SECS")
                    .and_then(|v| v.parse().ok())
                    .or(file.boot_timeout_secs)
                    .unwrap_or(DEFAULT_BOOT_TIMEOUT_SECS),
            ),
            profile: pick("SIDEPORT_PROFILE", file.profile)
                .unwrap_or_else(|| DEFAULT_PROFILE.into()),
            agent_addr: dialable(
                pick("SIDEPORT_AGENT_ADDR", file.agent_addr)
                    .unwrap_or_else(|| DEFAULT_AGENT_CLIENT_ADDR.into()),
            ),
        }
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use super::*;

    fn env_of(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key| map.get(key).cloned()
    }

    #[test]
    fn defaults_without_file_or_env() {
        let settings = Settings::resolve(FileConfig::default(), env_of(&[]));
        assert_eq!(settings.adb_path, None);
        assert_eq!(settings.guest_addr, "127.0.0.1:6520");
        assert_eq!(settings.boot_timeout, Duration::from_secs(120));
        assert_eq!(settings.profile, "balanced");
        assert_eq!(settings.agent_addr, "127.0.0.1:9008");
    }

    #[test]
    fn environment_overrides_file() {
        let file: FileConfig = serde_json::from_str(
            r#"{"guest_addr":"127.0.0.1:6521","profile":"minimal","boot_timeout_secs":30,"guest_start_cmd":"  "}"#,
        )
        .unwrap();
        let settings = Settings::resolve(
            file,
            env_of(&[
                ("SIDEPORT_PROFILE", "performance"),
                ("SIDEPORT_AGENT_ADDR", "0.0.0.0:9100"),
            ]),
        );
        assert_eq!(settings.guest_addr, "127.0.0.1:6521");
        assert_eq!(settings.profile, "performance");
        assert_eq!(settings.boot_timeout, Duration::from_secs(30));
        assert_eq!(settings.guest_start_cmd, None);
        assert_eq!(settings.agent_addr, "127.0.0.1:9100");
    }

    #[test]
    fn unknown_file_keys_are_ignored() {
        let file: FileConfig =
            serde_json::from_str(r#"{"adb_path":"/opt/adb","theme":"dark"}"#).unwrap();
        assert_eq!(file.adb_path.as_deref(), Some("/opt/adb"));
    }
}
