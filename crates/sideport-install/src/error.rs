use std::io;

use serde::Serialize;
use sideport_bridge::BridgeError;
use sideport_package::ParseError;
use thiserror::Error;

use crate::validate::ResourceError;

#[derive(Debug, Error)]
pub enum JobError {
    #[error(transparent)]
    Parse(#[from] ParseError),

    #[error(transparent)]
    Bridge(#[from] BridgeError),

    #[error(transparent)]
    Resource(#[from] ResourceError),

    #[error("installation cancelled")]
    Cancelled,

    #[error("{context}: {source}")]
    Io {
        context: String,
        #[source]
        source: io::Error,
    },
}

impl JobError {
    pub(crate) fn io(context: impl Into<String>, source: io::Error) -> Self {
        JobError::Io {
            context: context.into(),
            source,
        }
    }

    pub fn kind(&self) -> &'static str {
        match self {
            JobError::Parse(err) => err.kind(),
            JobError::Bridge(err) => err.kind(),
            JobError::Resource(err) => err.kind(),
            JobError::Cancelled => "cancelled",
            JobError::Io { .. } => "io",
        }
    }

    /// Raw tool output, when the failure came from one.
    pub fn detail(&self) -> Option<&str> {
        match self {
            JobError::Bridge(err) => Some(err.detail()),
            _ => None,
        }
    }
}

/// Terminal failure recorded on a job.
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct JobFailure {
    pub kind: String,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub detail: Option<String>,
}

impl From<&JobError> for JobFailure {
    fn from(err: &JobError) -> Self {
        Self {
            kind: err.kind().to_string(),
            message: err.to_string(),
            detail: err.detail().map(str::to_string),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn failures_keep_classification_and_raw_output() {
        let err = JobError::from(BridgeError::CommandFailed(
            "Failure [INSTALL_FAILED_NO_MATCHING_ABIS]".into(),
        ));
        let failure = JobFailure::from(&err);
        assert_eq!(failure.kind, "bridge.command_failed");
        assert!(failure.message.contains("INSTALL_FAILED_NO_MATCHING_ABIS"));
        assert_eq!(
            failure.detail.as_deref(),
            Some("Failure [INSTALL_FAILED_NO_MATCHING_ABIS]")
        );

        let cancelled = JobFailure::from(&JobError::Cancelled);
        assert_eq!(cancelled.kind, "cancelled");
        assert_eq!(cancelled.detail, None);

        let parse = JobFailure::from(&JobError::from(ParseError::NoBaseUnit {
            units: vec!["split_a.apk".into()],
        }));
        assert_eq!(parse.kind, "parse.no_base_unit");
    }
}
