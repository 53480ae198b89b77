use std::{
    collections::HashMap,
    fs,
    future::Future,
    io,
    path::{Path, PathBuf},
    sync::{Arc, Mutex},
    time::Duration,
};

use sideport_bridge::{ids::canonicalize_adb_serial, BridgeError, DeviceBridge, InstallOptions};
use sideport_package::{check_source, inspect, PackageDescriptor};
use sideport_telemetry as telemetry;
use sideport_util::{locks_dir, scratch_dir, DEFAULT_BOOT_TIMEOUT_SECS};
use tempfile::TempDir;
use tokio::sync::watch;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::error::{JobError, JobFailure};
use crate::guest::GuestProvisioner;
use crate::jobs::{JobHandle, JobRecord, JobSnapshot, Phase};
use crate::lock::{GuestLocks, LockScope};
use crate::profile::ResourceProfile;
use crate::validate::{validate, HostProbe};

/// Share of the overall fraction covered by auxiliary pushes.
const AUX_SPAN: f64 = 0.2;

#[derive(Clone, Debug)]
pub struct OrchestratorConfig {
    /// Parent of the per-job extraction directories.
    pub scratch_root: PathBuf,
    pub lock_dir: PathBuf,
    pub boot_timeout: Duration,
    pub install_options: InstallOptions,
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            scratch_root: scratch_dir(),
            lock_dir: locks_dir(),
            boot_timeout: Duration::from_secs(DEFAULT_BOOT_TIMEOUT_SECS),
            install_options: InstallOptions::default(),
        }
    }
}

struct Inner {
    bridge: Arc<dyn DeviceBridge>,
    guest: Arc<dyn GuestProvisioner>,
    host: Arc<dyn HostProbe>,
    config: OrchestratorConfig,
    jobs: Mutex<HashMap<String, Arc<JobRecord>>>,
    locks: GuestLocks,
}

/// Runs installation jobs. Cheap to clone; clones share the job table.
#[derive(Clone)]
pub struct Orchestrator {
    inner: Arc<Inner>,
}

impl Orchestrator {
    pub fn new(
        bridge: Arc<dyn DeviceBridge>,
        guest: Arc<dyn GuestProvisioner>,
        host: Arc<dyn HostProbe>,
        config: OrchestratorConfig,
    ) -> Self {
        let locks = GuestLocks::new(config.lock_dir.clone());
        Self {
            inner: Arc::new(Inner {
                bridge,
                guest,
                host,
                config,
                jobs: Mutex::new(HashMap::new()),
                locks,
            }),
        }
    }

    fn record(&self, handle: &JobHandle) -> Option<Arc<JobRecord>> {
        self.inner
            .jobs
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .get(handle.id())
            .cloned()
    }

    /// Starts a job in the background. Must be called from within a tokio
    /// runtime. Nothing is created when the source is missing or not an
    /// `.apk`/`.xapk`.
    pub fn start(
        &self,
        source: impl AsRef<Path>,
        profile: ResourceProfile,
    ) -> Result<JobHandle, JobError> {
        let source = source.as_ref().to_path_buf();
        let kind = check_source(&source)?;

        let id = Uuid::new_v4().to_string();
        let (record, cancel_rx) = JobRecord::new(id.clone(), source.clone(), profile.name.clone());
        let record = Arc::new(record);
        self.inner
            .jobs
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .insert(id.clone(), record.clone());

        info!("job {id}: installing {} ({})", source.display(), profile.name);
        telemetry::event(
            "install.started",
            &[
                ("job_id", id.as_str()),
                ("source_kind", kind.as_str()),
                ("profile", profile.name.as_str()),
            ],
        );

        let inner = self.inner.clone();
        tokio::spawn(run_job(inner, record, cancel_rx, source, profile));
        Ok(JobHandle::from(id))
    }

    pub fn progress(&self, handle: &JobHandle) -> Option<JobSnapshot> {
        self.record(handle).map(|r| r.snapshot())
    }

    /// Requests cancellation; the job fails with `cancelled` at its next
    /// checkpoint. False for unknown or finished jobs.
    pub fn cancel(&self, handle: &JobHandle) -> bool {
        let Some(record) = self.record(handle) else {
            return false;
        };
        let requested = record.request_cancel();
        if requested {
            info!("job {handle}: cancellation requested");
        }
        requested
    }

    pub fn subscribe(&self, handle: &JobHandle) -> Option<watch::Receiver<JobSnapshot>> {
        self.record(handle).map(|r| r.subscribe())
    }

    /// Resolves with the terminal snapshot.
    pub async fn wait(&self, handle: &JobHandle) -> Option<JobSnapshot> {
        let mut rx = self.subscribe(handle)?;
        loop {
            {
                let snapshot = rx.borrow_and_update();
                if snapshot.is_terminal() {
                    return Some(snapshot.clone());
                }
            }
            if rx.changed().await.is_err() {
                return Some(rx.borrow().clone());
            }
        }
    }

    /// Drops a finished job's record. Running jobs are kept.
    pub fn forget(&self, handle: &JobHandle) -> bool {
        let mut jobs = self.inner.jobs.lock().unwrap_or_else(|p| p.into_inner());
        match jobs.get(handle.id()) {
            Some(record) if record.snapshot().is_terminal() => {
                jobs.remove(handle.id());
                true
            }
            _ => false,
        }
    }

    pub fn jobs(&self) -> Vec<JobSnapshot> {
        let mut out: Vec<JobSnapshot> = self
            .inner
            .jobs
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .values()
            .map(|r| r.snapshot())
            .collect();
        out.sort_by(|a, b| a.started_at.cmp(&b.started_at).then(a.id.cmp(&b.id)));
        out
    }
}

async fn run_job(
    inner: Arc<Inner>,
    record: Arc<JobRecord>,
    mut cancel_rx: watch::Receiver<bool>,
    source: PathBuf,
    profile: ResourceProfile,
) {
    let id = record.snapshot().id;
    let mut scratch = None;
    let result = run_phases(
        &inner,
        &record,
        &mut cancel_rx,
        &source,
        &profile,
        &mut scratch,
    )
    .await;
    if let Some(dir) = scratch {
        remove_scratch(&id, dir).await;
    }
    match result {
        Ok(()) => {
            record.advance(Phase::Completed);
            info!("job {id}: completed");
        }
        Err(err) => {
            let phase = record.snapshot().phase;
            warn!("job {id}: failed during {phase}: {err}");
            record.fail(JobFailure::from(&err));
        }
    }

    let done = record.snapshot();
    let outcome = done
        .failure
        .as_ref()
        .map(|f| f.kind.as_str())
        .unwrap_or("ok");
    let warnings = done.warnings.len().to_string();
    telemetry::event(
        "install.finished",
        &[
            ("job_id", id.as_str()),
            ("phase", done.phase.as_str()),
            ("outcome", outcome),
            ("warnings", warnings.as_str()),
        ],
    );
}

fn checkpoint(cancel_rx: &watch::Receiver<bool>) -> Result<(), JobError> {
    if *cancel_rx.borrow() {
        Err(JobError::Cancelled)
    } else {
        Ok(())
    }
}

fn enter(
    record: &JobRecord,
    cancel_rx: &watch::Receiver<bool>,
    phase: Phase,
) -> Result<(), JobError> {
    checkpoint(cancel_rx)?;
    record.advance(phase);
    Ok(())
}

async fn cancel_signal(cancel_rx: &mut watch::Receiver<bool>) {
    loop {
        if *cancel_rx.borrow_and_update() {
            return;
        }
        if cancel_rx.changed().await.is_err() {
            std::future::pending::<()>().await;
        }
    }
}

/// Races `fut` against cancellation; `fut` is dropped if cancellation wins.
/// Only used for waits that have no effect on the guest.
async fn interruptible<F: Future>(
    cancel_rx: &mut watch::Receiver<bool>,
    fut: F,
) -> Result<F::Output, JobError> {
    checkpoint(cancel_rx)?;
    tokio::select! {
        out = fut => Ok(out),
        _ = cancel_signal(cancel_rx) => Err(JobError::Cancelled),
    }
}

fn blocking_join_error(what: &str, err: tokio::task::JoinError) -> JobError {
    JobError::io(what.to_string(), io::Error::other(err))
}

async fn create_scratch(root: PathBuf) -> Result<TempDir, JobError> {
    tokio::task::spawn_blocking(move || {
        fs::create_dir_all(&root)
            .map_err(|e| JobError::io(format!("creating {}", root.display()), e))?;
        tempfile::Builder::new()
            .prefix("job-")
            .tempdir_in(&root)
            .map_err(|e| JobError::io("creating scratch directory", e))
    })
    .await
    .map_err(|e| blocking_join_error("scratch worker", e))?
}

/// Extracted archives can be large; deleting them stays off the async
/// workers and finishes before the job reports its terminal state.
async fn remove_scratch(id: &str, dir: TempDir) {
    let path = dir.path().to_path_buf();
    match tokio::task::spawn_blocking(move || dir.close()).await {
        Ok(Ok(())) => debug!("job {id}: removed {}", path.display()),
        Ok(Err(err)) => warn!("job {id}: could not remove {}: {err}", path.display()),
        Err(err) => warn!("job {id}: scratch cleanup worker failed: {err}"),
    }
}

async fn run_phases(
    inner: &Inner,
    record: &JobRecord,
    cancel_rx: &mut watch::Receiver<bool>,
    source: &Path,
    profile: &ResourceProfile,
    scratch: &mut Option<TempDir>,
) -> Result<(), JobError> {
    let id = record.snapshot().id;

    // parsing
    checkpoint(cancel_rx)?;
    let path = source.to_path_buf();
    let inspected = tokio::task::spawn_blocking(move || inspect(&path))
        .await
        .map_err(|e| blocking_join_error("archive worker", e))??;
    record.set_package_id(inspected.package_id());

    // extracting
    enter(record, cancel_rx, Phase::Extracting)?;
    let dir = create_scratch(inner.config.scratch_root.clone()).await?;
    let dest = dir.path().to_path_buf();
    *scratch = Some(dir);
    let descriptor = tokio::task::spawn_blocking(move || inspected.extract(&dest))
        .await
        .map_err(|e| blocking_join_error("archive worker", e))??;
    info!(
        "job {id}: {} has {} unit(s), {} auxiliary file(s)",
        descriptor.label(),
        descriptor.units().len(),
        descriptor.auxiliary_files().len()
    );

    // validating
    enter(record, cancel_rx, Phase::Validating)?;
    validate(profile, &inner.host.capacity())?;

    // preparing-guest
    enter(record, cancel_rx, Phase::PreparingGuest)?;
    let device = {
        let key = inner.guest.guest_key();
        let _boot =
            interruptible(cancel_rx, inner.locks.acquire(LockScope::Boot, &key)).await??;
        interruptible(
            cancel_rx,
            inner.guest.ensure_running(profile, inner.bridge.as_ref()),
        )
        .await??;
        interruptible(
            cancel_rx,
            inner.bridge.ensure_ready(inner.config.boot_timeout),
        )
        .await??
    };
    if !device.is_ready() {
        return Err(BridgeError::ConnectionLost(format!(
            "{} is {}",
            device.identifier,
            device.status.as_str()
        ))
        .into());
    }
    // Guest keys name configurations; the device lease is what keeps two
    // configurations that resolve to one serial from installing at once.
    let serial = canonicalize_adb_serial(&device.identifier);
    let _device =
        interruptible(cancel_rx, inner.locks.acquire(LockScope::Device, &serial)).await??;

    // installing
    enter(record, cancel_rx, Phase::Installing)?;
    warn_on_api_level(inner, record, &descriptor).await;
    let installed = inner
        .bridge
        .install_units(descriptor.units(), &inner.config.install_options)
        .await;
    checkpoint(cancel_rx)?;
    let outcome = installed?;
    info!(
        "job {id}: installed {} on {}",
        descriptor.package_id(),
        device.identifier
    );
    debug!("job {id}: {}", outcome.output.trim());

    // configuring-auxiliary-data
    enter(record, cancel_rx, Phase::ConfiguringAuxiliaryData)?;
    push_auxiliary_data(inner, record, cancel_rx, &descriptor).await
}

async fn warn_on_api_level(inner: &Inner, record: &JobRecord, descriptor: &PackageDescriptor) {
    let Some(min_sdk) = descriptor.min_sdk_version() else {
        return;
    };
    match inner.bridge.api_level().await {
        Ok(Some(level)) if level < min_sdk => {
            let message =
                format!("guest API level {level} is below the package minimum {min_sdk}");
            warn!("job {}: {message}", record.snapshot().id);
            record.add_warning(message);
        }
        Ok(_) => {}
        Err(err) => warn!("could not read guest API level: {err}"),
    }
}

/// Best effort: every failure becomes a job warning.
async fn push_auxiliary_data(
    inner: &Inner,
    record: &JobRecord,
    cancel_rx: &watch::Receiver<bool>,
    descriptor: &PackageDescriptor,
) -> Result<(), JobError> {
    let files = descriptor.auxiliary_files();
    if files.is_empty() {
        return Ok(());
    }
    let id = record.snapshot().id;
    let base = Phase::ConfiguringAuxiliaryData
        .entry_fraction()
        .unwrap_or_default();

    let remote_dir = files[0].remote_dir();
    if let Err(err) = inner
        .bridge
        .run_shell(&format!("mkdir -p {remote_dir}"))
        .await
    {
        let message = format!("could not create {remote_dir}: {err}");
        warn!("job {id}: {message}");
        record.add_warning(message);
    }

    let total = files.len();
    for (index, file) in files.iter().enumerate() {
        checkpoint(cancel_rx)?;
        let remote = file.remote_path();
        match inner.bridge.push_file(file.source(), &remote).await {
            Ok(pushed) => info!(
                "job {id}: pushed {} ({} bytes)",
                file.file_name(),
                pushed
                    .bytes
                    .map(|b| b.to_string())
                    .unwrap_or_else(|| "?".into())
            ),
            Err(err) => {
                let message = format!("failed to push {} to {remote}: {err}", file.file_name());
                warn!("job {id}: {message}");
                record.add_warning(message);
            }
        }
        record.set_fraction(base + AUX_SPAN * (index + 1) as f64 / total as f64);
    }
    Ok(())
}
