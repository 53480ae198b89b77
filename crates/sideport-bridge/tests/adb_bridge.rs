#![cfg(unix)]

use std::fs;
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serial_test::serial;
use sideport_bridge::{AdbBridge, BridgeError, DeviceBridge, DeviceStatus, InstallOptions};
use tempfile::TempDir;

/// Writes an executable `adb` stand-in that appends its argv to `calls.log`
/// and then runs `body`.
fn fake_adb(dir: &Path, body: &str) -> PathBuf {
    let log = dir.join("calls.log");
    let script = dir.join("adb");
    let text = format!(
        "#!/bin/sh\necho \"$*\" >> '{}'\n{}\n",
        log.display(),
        body
    );
    fs::write(&script, text).unwrap();
    fs::set_permissions(&script, fs::Permissions::from_mode(0o755)).unwrap();
    script
}

fn calls(dir: &Path) -> Vec<String> {
    fs::read_to_string(dir.join("calls.log"))
        .unwrap_or_default()
        .lines()
        .map(str::to_string)
        .collect()
}

const READY_DEVICE: &str = r#"
case "$*" in
  devices) printf 'List of devices attached\n127.0.0.1:6520\tdevice\n' ;;
  *getprop\ sys.boot_completed) echo 1 ;;
  *install-multiple*) echo "Success" ;;
  *install\ *) echo "Success" ;;
  *push*) echo "x.obb: 1 file pushed, 0 skipped. (1024 bytes in 0.001s)" ;;
  *"pm list packages"*) printf 'package:com.example.game\npackage:com.android.settings\n' ;;
  *) ;;
esac
"#;

#[tokio::test]
#[serial]
async fn ready_device_is_remembered_and_targeted() {
    let tmp = TempDir::new().unwrap();
    let adb = fake_adb(tmp.path(), READY_DEVICE);
    let bridge = AdbBridge::with_adb_path(adb).with_poll_interval(Duration::from_millis(20));

    let device = bridge.ensure_ready(Duration::from_secs(5)).await.unwrap();
    assert_eq!(device.identifier, "127.0.0.1:6520");
    assert_eq!(device.status, DeviceStatus::Ready);
    assert_eq!(bridge.serial_hint().as_deref(), Some("127.0.0.1:6520"));

    let units = vec![
        PathBuf::from("/tmp/base.apk"),
        PathBuf::from("/tmp/split_a.apk"),
        PathBuf::from("/tmp/split_b.apk"),
    ];
    let outcome = bridge
        .install_units(&units, &InstallOptions::default())
        .await
        .unwrap();
    assert_eq!(outcome.units, 3);

    let packages = bridge.list_packages().await.unwrap();
    assert_eq!(packages, vec!["com.example.game", "com.android.settings"]);

    let log = calls(tmp.path());
    assert_eq!(log[0], "devices");
    assert_eq!(log[1], "-s 127.0.0.1:6520 shell getprop sys.boot_completed");
    assert_eq!(
        log[2],
        "-s 127.0.0.1:6520 install-multiple -r /tmp/base.apk /tmp/split_a.apk /tmp/split_b.apk"
    );
}

#[tokio::test]
#[serial]
async fn single_unit_uses_plain_install() {
    let tmp = TempDir::new().unwrap();
    let adb = fake_adb(tmp.path(), READY_DEVICE);
    let bridge = AdbBridge::with_adb_path(adb);

    let options = InstallOptions {
        grant_permissions: true,
        ..InstallOptions::default()
    };
    bridge
        .install_units(&[PathBuf::from("/tmp/app.apk")], &options)
        .await
        .unwrap();
    assert_eq!(calls(tmp.path()), vec!["install -r -g /tmp/app.apk"]);
}

#[tokio::test]
#[serial]
async fn push_reports_transferred_bytes() {
    let tmp = TempDir::new().unwrap();
    let adb = fake_adb(tmp.path(), READY_DEVICE);
    let bridge = AdbBridge::with_adb_path(adb).with_serial("localhost:6520");

    let outcome = bridge
        .push_file(
            Path::new("/tmp/main.1.com.example.game.obb"),
            "/sdcard/Android/obb/com.example.game/main.1.com.example.game.obb",
        )
        .await
        .unwrap();
    assert_eq!(outcome.bytes, Some(1024));
    assert_eq!(
        calls(tmp.path()),
        vec![
            "-s 127.0.0.1:6520 push /tmp/main.1.com.example.game.obb /sdcard/Android/obb/com.example.game/main.1.com.example.game.obb"
        ]
    );
}

#[tokio::test]
#[serial]
async fn rejected_install_is_a_command_failure() {
    let tmp = TempDir::new().unwrap();
    let adb = fake_adb(
        tmp.path(),
        "echo 'Failure [INSTALL_FAILED_UPDATE_INCOMPATIBLE]'",
    );
    let bridge = AdbBridge::with_adb_path(adb);

    let err = bridge
        .install_units(&[PathBuf::from("/tmp/app.apk")], &InstallOptions::default())
        .await
        .unwrap_err();
    match err {
        BridgeError::CommandFailed(detail) => {
            assert!(detail.contains("INSTALL_FAILED_UPDATE_INCOMPATIBLE"))
        }
        other => panic!("unexpected {other:?}"),
    }
}

#[tokio::test]
#[serial]
async fn lost_device_clears_the_hint() {
    let tmp = TempDir::new().unwrap();
    let adb = fake_adb(
        tmp.path(),
        r#"case "$*" in
  connect*) echo "connected to 127.0.0.1:6520" ;;
  *) echo "adb: device '127.0.0.1:6520' not found" >&2; exit 1 ;;
esac"#,
    );
    let bridge = AdbBridge::with_adb_path(adb);
    bridge.connect("127.0.0.1:6520").await.unwrap();
    assert_eq!(bridge.serial_hint().as_deref(), Some("127.0.0.1:6520"));

    let err = bridge.run_shell("echo hi").await.unwrap_err();
    assert_eq!(err.kind(), "bridge.connection_lost");
    assert_eq!(bridge.serial_hint(), None);
}

#[tokio::test]
#[serial]
async fn pinned_serial_survives_lost_connections() {
    let tmp = TempDir::new().unwrap();
    let adb = fake_adb(
        tmp.path(),
        "echo \"adb: device '127.0.0.1:6520' not found\" >&2\nexit 1",
    );
    let bridge = AdbBridge::with_adb_path(adb).with_serial("127.0.0.1:6520");

    let err = bridge.run_shell("echo hi").await.unwrap_err();
    assert_eq!(err.kind(), "bridge.connection_lost");
    assert_eq!(bridge.serial_hint().as_deref(), Some("127.0.0.1:6520"));
}

#[tokio::test]
#[serial]
async fn pinned_device_is_awaited_instead_of_another_ready_one() {
    let tmp = TempDir::new().unwrap();
    let adb = fake_adb(
        tmp.path(),
        r#"case "$*" in
  devices) printf 'List of devices attached\nemulator-5554\toffline\nemulator-5556\tdevice\n' ;;
  *getprop\ sys.boot_completed) echo 1 ;;
  *) ;;
esac"#,
    );
    let bridge = AdbBridge::with_adb_path(adb)
        .with_poll_interval(Duration::from_millis(20))
        .with_serial("emulator-5554");

    let err = bridge
        .ensure_ready(Duration::from_millis(150))
        .await
        .unwrap_err();
    assert!(matches!(err, BridgeError::ConnectionLost(_)), "{err:?}");
    assert!(err.detail().contains("emulator-5554 offline"), "{err}");
    assert_eq!(bridge.serial_hint().as_deref(), Some("emulator-5554"));

    let log = calls(tmp.path());
    assert!(log.len() >= 2);
    assert!(log.iter().all(|c| c == "devices"), "{log:?}");

    bridge.connect("127.0.0.1:6520").await.ok();
    assert_eq!(bridge.serial_hint().as_deref(), Some("emulator-5554"));
}

#[tokio::test]
#[serial]
async fn readiness_times_out_without_devices() {
    let tmp = TempDir::new().unwrap();
    let adb = fake_adb(tmp.path(), "printf 'List of devices attached\\n'");
    let bridge = AdbBridge::with_adb_path(adb).with_poll_interval(Duration::from_millis(20));

    let err = bridge
        .ensure_ready(Duration::from_millis(150))
        .await
        .unwrap_err();
    assert!(matches!(err, BridgeError::ConnectionLost(_)), "{err:?}");
    assert!(calls(tmp.path()).len() >= 2);
}

#[tokio::test]
#[serial]
async fn booting_device_is_not_ready() {
    let tmp = TempDir::new().unwrap();
    let adb = fake_adb(
        tmp.path(),
        r#"case "$*" in
  devices) printf 'List of devices attached\nemulator-5554\tdevice\n' ;;
  *) echo 0 ;;
esac"#,
    );
    let bridge = AdbBridge::with_adb_path(adb).with_poll_interval(Duration::from_millis(20));

    let err = bridge
        .ensure_ready(Duration::from_millis(100))
        .await
        .unwrap_err();
    assert!(err.detail().contains("emulator-5554 booting"), "{err}");
}

#[tokio::test]
#[serial]
async fn missing_adb_is_unavailable() {
    let tmp = TempDir::new().unwrap();
    let bridge = AdbBridge::with_adb_path(tmp.path().join("no-such-adb"));

    let err = bridge
        .ensure_ready(Duration::from_secs(30))
        .await
        .unwrap_err();
    assert!(matches!(err, BridgeError::BridgeUnavailable(_)), "{err:?}");
}

#[tokio::test]
#[serial]
async fn connect_requires_confirmation() {
    let tmp = TempDir::new().unwrap();
    let adb = fake_adb(
        tmp.path(),
        r#"case "$*" in
  "connect 127.0.0.1:6520") echo "connected to 127.0.0.1:6520" ;;
  connect*) echo "failed to connect to '10.0.0.9:5555': Connection refused" ;;
esac"#,
    );
    let bridge = AdbBridge::with_adb_path(adb);

    bridge.connect("localhost:6520").await.unwrap();
    assert_eq!(bridge.serial_hint().as_deref(), Some("127.0.0.1:6520"));

    let err = bridge.connect("10.0.0.9:5555").await.unwrap_err();
    assert_eq!(err.kind(), "bridge.connection_lost");

    bridge.disconnect().await.unwrap();
    assert_eq!(bridge.serial_hint(), None);
}
