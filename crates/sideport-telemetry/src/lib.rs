//! Opt-in local telemetry: usage events appended to a JSONL file and crash
//! reports written next to it. Nothing leaves the machine.
//!
//! Events are queued to a writer thread. Short-lived processes call
//! [`shutdown`] before exiting so queued events reach the disk.

use std::collections::BTreeMap;
use std::fs::{self, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::{sync_channel, Receiver, SyncSender};
use std::sync::{Arc, Mutex, MutexGuard, OnceLock};
use std::thread::JoinHandle;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use serde::Serialize;

const QUEUE_CAPACITY: usize = 256;
const MAX_EVENT_BYTES: u64 = 2 * 1024 * 1024;
const EVENTS_FILE: &str = "events.jsonl";
const FLUSH_TIMEOUT: Duration = Duration::from_secs(2);

#[derive(Clone)]
pub struct TelemetryOptions {
    pub app_name: &'static str,
    pub app_version: &'static str,
    pub usage_enabled: bool,
    pub crash_enabled: bool,
    pub machine_id: Option<String>,
}

pub struct Telemetry {
    app_name: String,
    app_version: String,
    session_id: String,
    dir: PathBuf,
    machine_id: Mutex<Option<String>>,
    usage_enabled: AtomicBool,
    crash_enabled: AtomicBool,
    queue: Mutex<Option<SyncSender<Message>>>,
    writer: Mutex<Option<JoinHandle<()>>>,
}

enum Message {
    Event(TelemetryEvent),
    Flush(SyncSender<()>),
}

#[derive(Serialize)]
struct TelemetryEvent {
    event_type: String,
    at_unix_millis: i64,
    app: String,
    version: String,
    session_id: String,
    machine_id: Option<String>,
    properties: BTreeMap<String, String>,
}

#[derive(Serialize)]
struct CrashReport {
    at_unix_millis: i64,
    app: String,
    version: String,
    session_id: String,
    message: String,
    location: Option<String>,
    backtrace: Option<String>,
}

static TELEMETRY: OnceLock<Arc<Telemetry>> = OnceLock::new();

/// Installs the process-wide instance, or updates the flags of the existing
/// one.
pub fn init(options: TelemetryOptions) -> Arc<Telemetry> {
    if let Some(existing) = TELEMETRY.get() {
        existing.apply(&options);
        return Arc::clone(existing);
    }

    let telemetry = Telemetry::start(&options, app_dir(options.app_name));
    install_panic_hook(Arc::clone(&telemetry));
    let _ = TELEMETRY.set(Arc::clone(&telemetry));
    telemetry
}

pub fn init_with_env(app_name: &'static str, app_version: &'static str) -> Arc<Telemetry> {
    init(TelemetryOptions {
        app_name,
        app_version,
        usage_enabled: env_flag("SIDEPORT_TELEMETRY"),
        crash_enabled: env_flag("SIDEPORT_TELEMETRY_CRASH"),
        machine_id: std::env::var("SIDEPORT_TELEMETRY_MACHINE_ID").ok(),
    })
}

/// Records a usage event if telemetry was initialised and enabled.
pub fn event(event_type: &str, properties: &[(&str, &str)]) {
    if let Some(telemetry) = TELEMETRY.get() {
        telemetry.event(event_type, properties);
    }
}

/// Blocks until every event queued so far has been written.
pub fn flush() {
    if let Some(telemetry) = TELEMETRY.get() {
        telemetry.flush();
    }
}

/// Flushes, then stops the writer thread. Later events are dropped.
pub fn shutdown() {
    if let Some(telemetry) = TELEMETRY.get() {
        telemetry.shutdown();
    }
}

impl Telemetry {
    fn start(options: &TelemetryOptions, dir: PathBuf) -> Arc<Self> {
        let (sender, receiver) = sync_channel(QUEUE_CAPACITY);
        let writer_dir = dir.clone();
        let writer = std::thread::Builder::new()
            .name("telemetry-writer".into())
            .spawn(move || drain(&writer_dir, receiver));
        let (queue, writer) = match writer {
            Ok(handle) => (Some(sender), Some(handle)),
            Err(err) => {
                eprintln!("telemetry: failed to start writer: {err}");
                (None, None)
            }
        };
        Arc::new(Self {
            app_name: options.app_name.to_string(),
            app_version: options.app_version.to_string(),
            session_id: new_session_id(),
            dir,
            machine_id: Mutex::new(options.machine_id.clone()),
            usage_enabled: AtomicBool::new(options.usage_enabled),
            crash_enabled: AtomicBool::new(options.crash_enabled),
            queue: Mutex::new(queue),
            writer: Mutex::new(writer),
        })
    }

    fn apply(&self, options: &TelemetryOptions) {
        self.usage_enabled
            .store(options.usage_enabled, Ordering::Relaxed);
        self.crash_enabled
            .store(options.crash_enabled, Ordering::Relaxed);
        if options.machine_id.is_some() {
            *lock(&self.machine_id) = options.machine_id.clone();
        }
    }

    fn enqueue(&self, message: Message) -> bool {
        match lock(&self.queue).as_ref() {
            Some(queue) => queue.try_send(message).is_ok(),
            None => false,
        }
    }

    pub fn event(&self, event_type: &str, properties: &[(&str, &str)]) {
        if !self.usage_enabled.load(Ordering::Relaxed) {
            return;
        }
        self.enqueue(Message::Event(self.build_event(event_type, properties)));
    }

    pub fn flush(&self) {
        let (ack, done) = sync_channel(1);
        // A full queue still drains; wait for room rather than give up.
        let sent = match lock(&self.queue).as_ref() {
            Some(queue) => queue.send(Message::Flush(ack)).is_ok(),
            None => false,
        };
        if sent && done.recv_timeout(FLUSH_TIMEOUT).is_err() {
            eprintln!("telemetry: writer did not flush in time");
        }
    }

    pub fn shutdown(&self) {
        self.flush();
        lock(&self.queue).take();
        if let Some(writer) = lock(&self.writer).take() {
            let _ = writer.join();
        }
    }

    fn build_event(&self, event_type: &str, properties: &[(&str, &str)]) -> TelemetryEvent {
        let properties = properties
            .iter()
            .filter(|(key, _)| !key.trim().is_empty())
            .map(|(key, value)| ((*key).to_string(), (*value).to_string()))
            .collect();
        TelemetryEvent {
            event_type: event_type.to_string(),
            at_unix_millis: now_millis(),
            app: self.app_name.clone(),
            version: self.app_version.clone(),
            session_id: self.session_id.clone(),
            machine_id: lock(&self.machine_id).clone(),
            properties,
        }
    }

    fn crash_report(&self, message: String, location: Option<String>, backtrace: Option<String>) {
        if !self.crash_enabled.load(Ordering::Relaxed) {
            return;
        }
        let report = CrashReport {
            at_unix_millis: now_millis(),
            app: self.app_name.clone(),
            version: self.app_version.clone(),
            session_id: self.session_id.clone(),
            message,
            location,
            backtrace,
        };
        write_crash_report(&self.dir.join("crashes"), &report);
        if self.usage_enabled.load(Ordering::Relaxed) {
            self.enqueue(Message::Event(self.build_event("crash", &[])));
        }
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

fn drain(dir: &Path, receiver: Receiver<Message>) {
    while let Ok(message) = receiver.recv() {
        match message {
            Message::Event(event) => write_event(dir, &event),
            Message::Flush(ack) => {
                let _ = ack.send(());
            }
        }
    }
}

fn install_panic_hook(telemetry: Arc<Telemetry>) {
    let default_hook = std::panic::take_hook();
    std::panic::set_hook(Box::new(move |info| {
        let message = if let Some(msg) = info.payload().downcast_ref::<&str>() {
            (*msg).to_string()
        } else if let Some(msg) = info.payload().downcast_ref::<String>() {
            msg.clone()
        } else {
            "panic".to_string()
        };
        let location = info
            .location()
            .map(|loc| format!("{}:{}", loc.file(), loc.line()));
        let backtrace = Some(format!("{:?}", std::backtrace::Backtrace::capture()));
        telemetry.crash_report(message, location, backtrace);
        default_hook(info);
    }));
}

fn write_event(dir: &Path, event: &TelemetryEvent) {
    if let Err(err) = fs::create_dir_all(dir) {
        eprintln!("telemetry: failed to create {}: {err}", dir.display());
        return;
    }

    let path = dir.join(EVENTS_FILE);
    if rotate_if_needed(&path, MAX_EVENT_BYTES).is_err() {
        return;
    }

    let mut file = match OpenOptions::new().create(true).append(true).open(&path) {
        Ok(file) => file,
        Err(err) => {
            eprintln!("telemetry: failed to open {}: {err}", path.display());
            return;
        }
    };
    if let Ok(line) = serde_json::to_string(event) {
        let _ = writeln!(file, "{line}");
    }
}

fn rotate_if_needed(path: &Path, max_bytes: u64) -> std::io::Result<()> {
    if let Ok(meta) = fs::metadata(path) {
        if meta.len() >= max_bytes {
            let rotated = path.with_extension("jsonl.1");
            let _ = fs::remove_file(&rotated);
            fs::rename(path, rotated)?;
        }
    }
    Ok(())
}

fn write_crash_report(dir: &Path, report: &CrashReport) {
    if let Err(err) = fs::create_dir_all(dir) {
        eprintln!("telemetry: failed to create {}: {err}", dir.display());
        return;
    }
    let filename = format!(
        "crash-{}-{}.json",
        report.at_unix_millis,
        std::process::id()
    );
    if let Ok(file) = OpenOptions::new()
        .create(true)
        .write(true)
        .open(dir.join(filename))
    {
        let _ = serde_json::to_writer_pretty(file, report);
    }
}

// Duplicated from sideport-util, which depends on this crate.
fn app_dir(app_name: &str) -> PathBuf {
    let base = match std::env::var("SIDEPORT_DATA_DIR") {
        Ok(dir) if !dir.trim().is_empty() => PathBuf::from(dir.trim()),
        _ => match std::env::var("HOME") {
            Ok(home) => PathBuf::from(home).join(".local/share/sideport"),
            Err(_) => PathBuf::from("/tmp/sideport"),
        },
    };
    base.join("telemetry").join(app_name)
}

fn env_flag(name: &str) -> bool {
    match std::env::var(name) {
        Ok(value) => matches!(
            value.trim().to_ascii_lowercase().as_str(),
            "1" | "true" | "yes" | "on"
        ),
        Err(_) => false,
    }
}

fn now_millis() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as i64
}

fn new_session_id() -> String {
    format!("{:x}-{:x}", now_millis(), std::process::id())
}
