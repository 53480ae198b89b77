use std::path::PathBuf;

use sideport_telemetry as telemetry;

pub const DEFAULT_GUEST_ADDR: &str = "127.0.0.1:6520";
pub const DEFAULT_AGENT_ADDR: &str = "0.0.0.0:9008";
pub const DEFAULT_AGENT_CLIENT_ADDR: &str = "127.0.0.1:9008";
pub const DEFAULT_BOOT_TIMEOUT_SECS: u64 = 120;

pub fn env_addr(key: &str, default: &str) -> String {
    std::env::var(key).unwrap_or_else(|_| default.to_string())
}

pub fn read_env_trimmed(key: &str) -> Option<String> {
    let value = std::env::var(key).ok()?;
    let trimmed = value.trim();
    if trimmed.is_empty() {
        None
    } else {
        Some(trimmed.to_string())
    }
}

pub fn agent_addr() -> String {
    env_addr("SIDEPORT_AGENT_ADDR", DEFAULT_AGENT_ADDR)
}

pub fn data_dir() -> PathBuf {
    if let Some(dir) = read_env_trimmed("SIDEPORT_DATA_DIR") {
        return expand_user(&dir);
    }
    if let Ok(home) = std::env::var("HOME") {
        PathBuf::from(home).join(".local/share/sideport")
    } else {
        PathBuf::from("/tmp/sideport")
    }
}

pub fn state_dir() -> PathBuf {
    data_dir().join("state")
}

pub fn state_file_path(file_name: &str) -> PathBuf {
    state_dir().join(file_name)
}

/// Root for per-job extraction directories.
pub fn scratch_dir() -> PathBuf {
    data_dir().join("scratch")
}

pub fn locks_dir() -> PathBuf {
    state_dir().join("locks")
}

pub fn expand_user(path: &str) -> PathBuf {
    if path == "~" || path.starts_with("~/") {
        if let Ok(home) = std::env::var("HOME") {
            let rest = path.strip_prefix("~/").unwrap_or("");
            return PathBuf::from(home).join(rest);
        }
    }
    PathBuf::from(path)
}

pub fn now_millis() -> i64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as i64
}

pub fn init_tracing() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env().add_directive("info".parse()?),
        )
        .with_writer(std::io::stderr)
        .init();
    Ok(())
}

pub fn init_app_telemetry(app_name: &'static str, app_version: &'static str, component: &str) {
    telemetry::init_with_env(app_name, app_version);
    telemetry::event("service.start", &[("component", component)]);
}

/// Records the stop event and waits for the telemetry writer. Call before the
/// process exits, including through `std::process::exit`.
pub fn finish_app_telemetry(component: &str, outcome: &str) {
    telemetry::event(
        "service.stop",
        &[("component", component), ("outcome", outcome)],
    );
    telemetry::shutdown();
}
