use std::{
    collections::HashMap,
    fs::{self, File, OpenOptions},
    path::{Path, PathBuf},
    sync::{Arc, Mutex},
};

use fs2::FileExt;
use tokio::sync::{Mutex as AsyncMutex, OwnedMutexGuard};
use tracing::info;

use crate::error::JobError;

/// What a lease serializes. Boot leases cover starting a guest and waiting
/// for it; device leases cover everything sent to one resolved device, so two
/// guest configurations that land on the same serial still take turns.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) enum LockScope {
    Boot,
    Device,
}

impl LockScope {
    fn as_str(self) -> &'static str {
        match self {
            LockScope::Boot => "boot",
            LockScope::Device => "device",
        }
    }
}

/// An async mutex per key inside this process, and an exclusive file lock
/// across processes.
pub(crate) struct GuestLocks {
    dir: PathBuf,
    local: Mutex<HashMap<String, Arc<AsyncMutex<()>>>>,
}

pub(crate) struct GuestLease {
    file: File,
    _local: OwnedMutexGuard<()>,
}

impl Drop for GuestLease {
    fn drop(&mut self) {
        let _ = FileExt::unlock(&self.file);
    }
}

pub(crate) fn lock_file_path(dir: &Path, scope: LockScope, key: &str) -> PathBuf {
    let name: String = key
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() || c == '-' || c == '.' { c } else { '_' })
        .collect();
    dir.join(format!("{}-{name}.lock", scope.as_str()))
}

impl GuestLocks {
    pub(crate) fn new(dir: PathBuf) -> Self {
        Self {
            dir,
            local: Mutex::new(HashMap::new()),
        }
    }

    pub(crate) async fn acquire(
        &self,
        scope: LockScope,
        key: &str,
    ) -> Result<GuestLease, JobError> {
        let path = lock_file_path(&self.dir, scope, key);
        let slot = {
            let mut local = self.local.lock().unwrap_or_else(|p| p.into_inner());
            local.entry(path.display().to_string()).or_default().clone()
        };
        let guard = match slot.clone().try_lock_owned() {
            Ok(guard) => guard,
            Err(_) => {
                info!("waiting for another job holding {} {key}", scope.as_str());
                slot.lock_owned().await
            }
        };

        fs::create_dir_all(&self.dir)
            .map_err(|e| JobError::io(format!("creating {}", self.dir.display()), e))?;
        let file = OpenOptions::new()
            .create(true)
            .truncate(false)
            .write(true)
            .open(&path)
            .map_err(|e| JobError::io(format!("opening {}", path.display()), e))?;

        let file = if file.try_lock_exclusive().is_ok() {
            file
        } else {
            info!("{} {key} is locked by another process; waiting", scope.as_str());
            tokio::task::spawn_blocking(move || file.lock_exclusive().map(|_| file))
                .await
                .map_err(|e| JobError::io("guest lock worker", std::io::Error::other(e)))?
                .map_err(|e| JobError::io(format!("locking {}", path.display()), e))?
        };

        Ok(GuestLease {
            file,
            _local: guard,
        })
    }
}
