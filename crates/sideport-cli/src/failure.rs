use std::{fmt, io};

use sideport_bridge::BridgeError;
use sideport_install::{JobError, JobFailure, ResourceError};
use sideport_package::ParseError;

/// A command's terminal error: a stable classification, a message and, for
/// tool failures, the raw captured output.
#[derive(Debug)]
pub(crate) struct Failure {
    pub(crate) kind: String,
    pub(crate) message: String,
    pub(crate) detail: Option<String>,
}

impl Failure {
    pub(crate) fn new(kind: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            kind: kind.into(),
            message: message.into(),
            detail: None,
        }
    }
}

impl fmt::Display for Failure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "error[{}]: {}", self.kind, self.message)
    }
}

impl std::error::Error for Failure {}

impl From<BridgeError> for Failure {
    fn from(err: BridgeError) -> Self {
        let detail = Some(err.detail().to_string()).filter(|d| !d.is_empty());
        Self {
            kind: err.kind().into(),
            message: err.to_string(),
            detail,
        }
    }
}

impl From<ParseError> for Failure {
    fn from(err: ParseError) -> Self {
        Self::new(err.kind(), err.to_string())
    }
}

impl From<ResourceError> for Failure {
    fn from(err: ResourceError) -> Self {
        Self::new(err.kind(), err.to_string())
    }
}

impl From<JobError> for Failure {
    fn from(err: JobError) -> Self {
        JobFailure::from(&err).into()
    }
}

impl From<JobFailure> for Failure {
    fn from(failure: JobFailure) -> Self {
        Self {
            kind: failure.kind,
            message: failure.message,
            detail: failure.detail,
        }
    }
}

impl From<io::Error> for Failure {
    fn from(err: io::Error) -> Self {
        Self::new("io", err.to_string())
    }
}

impl From<serde_json::Error> for Failure {
    fn from(err: serde_json::Error) -> Self {
        Self::new("json", err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bridge_failures_keep_tool_output() {
        let failure = Failure::from(BridgeError::CommandFailed(
            "Failure [INSTALL_FAILED_OLDER_SDK]".into(),
        ));
        assert_eq!(failure.kind, "bridge.command_failed");
        assert_eq!(
            failure.detail.as_deref(),
            Some("Failure [INSTALL_FAILED_OLDER_SDK]")
        );
        assert!(failure.to_string().starts_with("error[bridge.command_failed]: "));
    }

    #[test]
    fn cancelled_jobs_classify_as_cancelled() {
        let failure = Failure::from(JobError::Cancelled);
        assert_eq!(failure.kind, "cancelled");
        assert_eq!(failure.detail, None);
    }
}
