use thiserror::Error;

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum BridgeError {
    /// The adb executable could not be located or started.
    #[error("device bridge unavailable: {0}")]
    BridgeUnavailable(String),

    /// No ready device, the device went away mid-command, or readiness timed out.
    #[error("device connection lost: {0}")]
    ConnectionLost(String),

    #[error("device command failed: {0}")]
    CommandFailed(String),
}

impl BridgeError {
    pub fn kind(&self) -> &'static str {
        match self {
            BridgeError::BridgeUnavailable(_) => "bridge.unavailable",
            BridgeError::ConnectionLost(_) => "bridge.connection_lost",
            BridgeError::CommandFailed(_) => "bridge.command_failed",
        }
    }

    pub fn detail(&self) -> &str {
        match self {
            BridgeError::BridgeUnavailable(d)
            | BridgeError::ConnectionLost(d)
            | BridgeError::CommandFailed(d) => d,
        }
    }
}
