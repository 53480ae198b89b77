const LOOPBACK_PREFIXES: [&str; 5] = ["localhost:", "127.0.0.1:", "0.0.0.0:", "[::1]:", "[::]:"];

/// The form adb itself reports after `adb connect`: loopback becomes
/// `127.0.0.1:<port>`. Non-network serials are returned trimmed.
pub fn canonicalize_adb_serial(addr: &str) -> String {
    let addr = addr.trim();
    if !addr.contains(':') {
        return addr.to_string();
    }
    let lower = addr.to_ascii_lowercase();
    for prefix in LOOPBACK_PREFIXES {
        if let Some(port) = lower.strip_prefix(prefix) {
            return format!("127.0.0.1:{port}");
        }
    }
    addr.to_string()
}

pub fn same_device(a: &str, b: &str) -> bool {
    canonicalize_adb_serial(a).eq_ignore_ascii_case(&canonicalize_adb_serial(b))
}
