use std::thread;

use serde::Serialize;
use thiserror::Error;

use crate::profile::ResourceProfile;

/// Share of host physical memory a guest may claim.
pub const MEMORY_CEILING_PERCENT: u64 = 80;

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ResourceError {
    #[error("profile needs {required_mb} MB of memory but only {available_mb} MB may be used")]
    InsufficientMemory { required_mb: u64, available_mb: u64 },

    #[error("profile needs {required} CPU cores but the host has {available}")]
    InsufficientCores { required: u32, available: u32 },
}

impl ResourceError {
    pub fn kind(&self) -> &'static str {
        match self {
            ResourceError::InsufficientMemory { .. } => "resource.insufficient_memory",
            ResourceError::InsufficientCores { .. } => "resource.insufficient_cores",
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
pub struct HostCapacity {
    pub memory_mb: u64,
    pub logical_cores: u32,
}

impl HostCapacity {
    pub fn detect() -> Self {
        Self {
            memory_mb: host_memory_mb().unwrap_or(0),
            logical_cores: thread::available_parallelism()
                .map(|n| n.get() as u32)
                .unwrap_or(1),
        }
    }

    /// Memory a guest may use under the ceiling.
    pub fn usable_memory_mb(&self) -> u64 {
        self.memory_mb * MEMORY_CEILING_PERCENT / 100
    }
}

#[cfg(unix)]
fn host_memory_mb() -> Option<u64> {
    let pages = unsafe { libc::sysconf(libc::_SC_PHYS_PAGES) };
    let page_size = unsafe { libc::sysconf(libc::_SC_PAGESIZE) };
    if pages > 0 && page_size > 0 {
        Some(pages as u64 * page_size as u64 / (1024 * 1024))
    } else {
        None
    }
}

#[cfg(not(unix))]
fn host_memory_mb() -> Option<u64> {
    None
}

/// Source of host capacity; swapped out in tests.
pub trait HostProbe: Send + Sync {
    fn capacity(&self) -> HostCapacity;
}

#[derive(Clone, Copy, Debug, Default)]
pub struct SystemHost;

impl HostProbe for SystemHost {
    fn capacity(&self) -> HostCapacity {
        HostCapacity::detect()
    }
}

/// Fixed capacity, for dry runs and tests.
#[derive(Clone, Copy, Debug)]
pub struct StaticHost(pub HostCapacity);

impl HostProbe for StaticHost {
    fn capacity(&self) -> HostCapacity {
        self.0
    }
}

pub fn validate(profile: &ResourceProfile, host: &HostCapacity) -> Result<(), ResourceError> {
    let available_mb = host.usable_memory_mb();
    if profile.memory_mb > available_mb {
        return Err(ResourceError::InsufficientMemory {
            required_mb: profile.memory_mb,
            available_mb,
        });
    }
    if profile.cpu_cores > host.logical_cores {
        return Err(ResourceError::InsufficientCores {
            required: profile.cpu_cores,
            available: host.logical_cores,
        });
    }
    Ok(())
}
