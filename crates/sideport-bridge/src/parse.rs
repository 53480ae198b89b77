//! Text scraping of adb output. Nothing outside this crate should need to know
//! what adb prints.

use crate::device::{DeviceConnection, DeviceStatus};

const DEVICES_HEADER: &str = "List of devices attached";
const INSTALL_SUCCESS: &str = "Success";
const PACKAGE_PREFIX: &str = "package:";

const CONNECTION_LOSS_MARKERS: [&str; 7] = [
    "no devices/emulators found",
    "device offline",
    "device unauthorized",
    "device not found",
    "' not found",
    "error: closed",
    "error: protocol fault",
];

pub fn parse_devices(output: &str) -> Vec<DeviceConnection> {
    let mut devices = Vec::new();
    for line in output.lines() {
        let line = line.trim();
        // adb may print daemon start-up chatter before the header.
        if line.is_empty() || line.starts_with(DEVICES_HEADER) || line.starts_with('*') {
            continue;
        }
        let mut parts = line.split_whitespace();
        let (Some(identifier), Some(state)) = (parts.next(), parts.next()) else {
            continue;
        };
        devices.push(DeviceConnection::new(
            identifier,
            DeviceStatus::from_adb_state(state),
        ));
    }
    devices
}

pub fn install_succeeded(output: &str) -> bool {
    output.contains(INSTALL_SUCCESS)
}

pub fn parse_packages(output: &str) -> Vec<String> {
    output
        .lines()
        .filter_map(|line| line.trim().strip_prefix(PACKAGE_PREFIX))
        .map(|id| id.trim().to_string())
        .filter(|id| !id.is_empty())
        .collect()
}

/// Byte count from a push summary such as
/// `x.obb: 1 file pushed, 0 skipped. 38.2 MB/s (5242880 bytes in 0.131s)`.
pub fn parse_push_bytes(output: &str) -> Option<u64> {
    output.lines().rev().find_map(|line| {
        let open = line.rfind('(')?;
        let rest = &line[open + 1..];
        let (count, tail) = rest.split_once(' ')?;
        if tail.starts_with("bytes") {
            count.parse().ok()
        } else {
            None
        }
    })
}

pub fn looks_like_connection_loss(output: &str) -> bool {
    let lower = output.to_ascii_lowercase();
    CONNECTION_LOSS_MARKERS
        .iter()
        .any(|marker| lower.contains(marker))
}

pub fn format_adb_output(stdout: &str, stderr: &str) -> String {
    let stdout = stdout.trim();
    let stderr = stderr.trim();
    let mut out = String::new();

    if !stdout.is_empty() {
        out.push_str("stdout:\n");
        out.push_str(stdout);
        out.push('\n');
    }
    if !stderr.is_empty() {
        out.push_str("stderr:\n");
        out.push_str(stderr);
        out.push('\n');
    }

    out
}
