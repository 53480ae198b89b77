use std::{fmt, path::PathBuf};

use serde::Serialize;
use sideport_util::now_millis;
use tokio::sync::watch;
use tracing::warn;

use crate::error::JobFailure;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum Phase {
    Parsing,
    Extracting,
    Validating,
    PreparingGuest,
    Installing,
    ConfiguringAuxiliaryData,
    Completed,
    Failed,
}

impl Phase {
    pub fn as_str(self) -> &'static str {
        match self {
            Phase::Parsing => "parsing",
            Phase::Extracting => "extracting",
            Phase::Validating => "validating",
            Phase::PreparingGuest => "preparing-guest",
            Phase::Installing => "installing",
            Phase::ConfiguringAuxiliaryData => "configuring-auxiliary-data",
            Phase::Completed => "completed",
            Phase::Failed => "failed",
        }
    }

    pub fn is_terminal(self) -> bool {
        matches!(self, Phase::Completed | Phase::Failed)
    }

    /// The phase that follows on success.
    pub fn next(self) -> Option<Phase> {
        match self {
            Phase::Parsing => Some(Phase::Extracting),
            Phase::Extracting => Some(Phase::Validating),
            Phase::Validating => Some(Phase::PreparingGuest),
            Phase::PreparingGuest => Some(Phase::Installing),
            Phase::Installing => Some(Phase::ConfiguringAuxiliaryData),
            Phase::ConfiguringAuxiliaryData => Some(Phase::Completed),
            Phase::Completed | Phase::Failed => None,
        }
    }

    /// Progress fraction on entering the phase. `Failed` keeps whatever the
    /// job had reached.
    pub fn entry_fraction(self) -> Option<f64> {
        match self {
            Phase::Parsing => Some(0.0),
            Phase::Extracting => Some(0.1),
            Phase::Validating => Some(0.2),
            Phase::PreparingGuest => Some(0.3),
            Phase::Installing => Some(0.4),
            Phase::ConfiguringAuxiliaryData => Some(0.6),
            Phase::Completed => Some(1.0),
            Phase::Failed => None,
        }
    }

    pub fn can_transition_to(self, to: Phase) -> bool {
        if self.is_terminal() {
            return false;
        }
        to == Phase::Failed || self.next() == Some(to)
    }
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct JobHandle {
    id: String,
}

impl JobHandle {
    pub fn id(&self) -> &str {
        &self.id
    }
}

impl From<String> for JobHandle {
    fn from(id: String) -> Self {
        Self { id }
    }
}

impl fmt::Display for JobHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.id)
    }
}

#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct JobSnapshot {
    pub id: String,
    pub source: PathBuf,
    pub profile: String,
    pub phase: Phase,
    pub fraction: f64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub package_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub failure: Option<JobFailure>,
    pub warnings: Vec<String>,
    pub started_at: i64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub finished_at: Option<i64>,
}

impl JobSnapshot {
    pub fn is_terminal(&self) -> bool {
        self.phase.is_terminal()
    }
}

/// One job's observable state plus its cancellation flag. Only the runner
/// task writes to it, through the transition methods below.
pub(crate) struct JobRecord {
    snapshot: watch::Sender<JobSnapshot>,
    cancel: watch::Sender<bool>,
}

impl JobRecord {
    pub(crate) fn new(id: String, source: PathBuf, profile: String) -> (Self, watch::Receiver<bool>) {
        let snapshot = JobSnapshot {
            id,
            source,
            profile,
            phase: Phase::Parsing,
            fraction: 0.0,
            package_id: None,
            failure: None,
            warnings: Vec::new(),
            started_at: now_millis(),
            finished_at: None,
        };
        let (snapshot_tx, _) = watch::channel(snapshot);
        let (cancel_tx, cancel_rx) = watch::channel(false);
        (
            Self {
                snapshot: snapshot_tx,
                cancel: cancel_tx,
            },
            cancel_rx,
        )
    }

    pub(crate) fn snapshot(&self) -> JobSnapshot {
        self.snapshot.borrow().clone()
    }

    pub(crate) fn subscribe(&self) -> watch::Receiver<JobSnapshot> {
        self.snapshot.subscribe()
    }

    pub(crate) fn request_cancel(&self) -> bool {
        if self.snapshot.borrow().phase.is_terminal() {
            return false;
        }
        self.cancel.send_replace(true);
        true
    }

    /// Moves to `to` if that is a legal transition. Returns whether it moved.
    pub(crate) fn advance(&self, to: Phase) -> bool {
        self.snapshot.send_if_modified(|s| {
            if !s.phase.can_transition_to(to) {
                warn!("job {}: refusing transition {} -> {}", s.id, s.phase, to);
                return false;
            }
            s.phase = to;
            if let Some(fraction) = to.entry_fraction() {
                s.fraction = s.fraction.max(fraction);
            }
            if to.is_terminal() {
                s.finished_at = Some(now_millis());
            }
            true
        })
    }

    pub(crate) fn fail(&self, failure: JobFailure) -> bool {
        self.snapshot.send_if_modified(|s| {
            if !s.phase.can_transition_to(Phase::Failed) {
                return false;
            }
            s.phase = Phase::Failed;
            s.failure = Some(failure);
            s.finished_at = Some(now_millis());
            true
        })
    }

    /// Raises the fraction within the current phase; never lowers it.
    pub(crate) fn set_fraction(&self, fraction: f64) {
        self.snapshot.send_if_modified(|s| {
            let fraction = fraction.clamp(0.0, 1.0);
            if s.phase.is_terminal() || fraction <= s.fraction {
                return false;
            }
            s.fraction = fraction;
            true
        });
    }

    pub(crate) fn add_warning(&self, message: String) {
        self.snapshot.send_modify(|s| s.warnings.push(message));
    }

    pub(crate) fn set_package_id(&self, package_id: &str) {
        self.snapshot
            .send_modify(|s| s.package_id = Some(package_id.to_string()));
    }
}
