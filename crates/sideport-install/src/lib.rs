//! Installation jobs: validate the requested resources, bring a guest up,
//! install the package units and push auxiliary data, one phase at a time.

mod error;
pub mod guest;
mod jobs;
mod lock;
mod orchestrator;
pub mod profile;
pub mod validate;

pub use error::{JobError, JobFailure};
pub use guest::{provisioner_for, AttachedGuest, CommandGuest, GuestProvisioner};
pub use jobs::{JobHandle, JobSnapshot, Phase};
pub use orchestrator::{Orchestrator, OrchestratorConfig};
pub use profile::{DisplayConfig, ResourceProfile, DEFAULT_PROFILE};
pub use validate::{validate, HostCapacity, HostProbe, ResourceError, StaticHost, SystemHost};
