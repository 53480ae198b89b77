use std::path::Path;

use sideport_install::{JobSnapshot, Orchestrator, Phase, ResourceProfile};
use tracing::warn;

use crate::failure::Failure;

/// Profile overrides given on the command line.
#[derive(Clone, Copy, Debug, Default)]
pub(crate) struct ProfileOverrides {
    pub(crate) cpus: Option<u32>,
    pub(crate) memory_mb: Option<u64>,
    pub(crate) storage_mb: Option<u64>,
}

/// Named preset with any overrides applied. An overridden preset is reported
/// as `<name>+custom`.
pub(crate) fn resolve_profile(
    name: &str,
    overrides: ProfileOverrides,
) -> Result<ResourceProfile, Failure> {
    let mut profile = ResourceProfile::preset(name).ok_or_else(|| {
        let known: Vec<String> = ResourceProfile::presets()
            .into_iter()
            .map(|p| p.name)
            .collect();
        Failure::new(
            "profile.unknown",
            format!("unknown profile {name:?} (known: {})", known.join(", ")),
        )
    })?;
    let customized =
        overrides.cpus.is_some() || overrides.memory_mb.is_some() || overrides.storage_mb.is_some();
    if let Some(cpus) = overrides.cpus {
        profile = profile.with_cpu_cores(cpus);
    }
    if let Some(memory_mb) = overrides.memory_mb {
        profile = profile.with_memory_mb(memory_mb);
    }
    if let Some(storage_mb) = overrides.storage_mb {
        profile = profile.with_storage_mb(storage_mb);
    }
    if customized {
        profile.name = format!("{}+custom", profile.name);
    }
    Ok(profile)
}

fn progress_line(snapshot: &JobSnapshot) -> String {
    let percent = (snapshot.fraction * 100.0).round() as u32;
    match (&snapshot.package_id, snapshot.phase) {
        (Some(id), Phase::Installing | Phase::Completed) => {
            format!("[{percent:>3}%] {} {id}", snapshot.phase)
        }
        _ => format!("[{percent:>3}%] {}", snapshot.phase),
    }
}

/// Starts a job and follows it to its terminal state, printing each step.
/// The first Ctrl-C requests cancellation; the job still reports how it
/// ended.
pub(crate) async fn follow_install(
    orchestrator: &Orchestrator,
    source: &Path,
    profile: ResourceProfile,
    quiet: bool,
) -> Result<JobSnapshot, Failure> {
    let handle = orchestrator.start(source, profile)?;
    let mut rx = orchestrator
        .subscribe(&handle)
        .ok_or_else(|| Failure::new("job.unknown", format!("job {handle} disappeared")))?;
    if !quiet {
        eprintln!("job {handle}");
    }

    let mut last_line = String::new();
    let mut cancel_requested = false;
    let snapshot = loop {
        let snapshot = rx.borrow_and_update().clone();
        let line = progress_line(&snapshot);
        if !quiet && line != last_line {
            println!("{line}");
            last_line = line;
        }
        if snapshot.is_terminal() {
            break snapshot;
        }
        tokio::select! {
            changed = rx.changed() => {
                if changed.is_err() {
                    break rx.borrow().clone();
                }
            }
            signal = tokio::signal::ctrl_c(), if !cancel_requested => {
                if let Err(err) = signal {
                    warn!("failed to listen for Ctrl-C: {err}");
                }
                cancel_requested = true;
                eprintln!("cancelling job {handle}...");
                orchestrator.cancel(&handle);
            }
        }
    };
    orchestrator.forget(&handle);
    Ok(snapshot)
}
