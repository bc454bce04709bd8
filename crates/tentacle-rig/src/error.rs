//! Error types for the tentacle rig

use crate::types::TentacleId;
use std::time::Duration;
use thiserror::Error;

/// Result type for rig operations
pub type RigResult<T> = Result<T, RigError>;

/// Errors that can occur while driving the rig
#[derive(Error, Debug)]
pub enum RigError {
    /// A bounded wait on hardware ran out of time
    #[error("Timed out after {timeout:?} waiting for {what}")]
    HardwareTimeout { what: String, timeout: Duration },

    /// Two infra controllers report the same serial
    #[error("Duplicate tentacle serial {serial} at {first} and {second}")]
    DuplicateSerial {
        serial: String,
        first: String,
        second: String,
    },

    /// Rail name or rail not wired on this hardware revision
    #[error("Unknown rail: {0}")]
    UnknownRail(String),

    /// Another boot sequence is already running on the tentacle
    #[error("Tentacle {0} is busy with another boot sequence")]
    Busy(TentacleId),

    /// Tentacle is leased by someone else
    #[error("Tentacle {0} is already in use")]
    AlreadyInUse(TentacleId),

    /// Operation called in a boot state that does not allow it
    #[error("Invalid state for tentacle {tentacle}: {message}")]
    InvalidState { tentacle: TentacleId, message: String },

    /// Firmware flashing failed
    #[error("Flashing {tentacle} failed: {cause}")]
    Flash {
        tentacle: TentacleId,
        cause: FlashCause,
    },

    /// No assignment of tentacles satisfies a testbed
    #[error("Role '{role}' cannot be satisfied: {reason}")]
    UnsatisfiableRequest { role: String, reason: String },

    /// Relay board, USB enumeration or host tooling failure
    #[error("Infrastructure error: {0}")]
    Infra(String),

    /// Serial string is not a valid tentacle serial
    #[error("Invalid tentacle serial: {0}")]
    InvalidSerial(String),

    /// USB port path could not be parsed
    #[error("Invalid USB port path: {0}")]
    InvalidPortPath(String),

    /// Tentacle is not known to the inventory
    #[error("Unknown tentacle: {0}")]
    UnknownTentacle(String),

    /// Invalid configuration
    #[error("Invalid configuration: {0}")]
    Config(String),

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON error
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

/// Why a flash attempt failed
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum FlashCause {
    /// A flashing step exceeded its time bound
    #[error("timed out after {timeout:?} waiting for {what}")]
    Timeout { what: String, timeout: Duration },

    /// The programming tool exited unsuccessfully
    #[error("{programmer} exited with {code:?}: {stderr}")]
    ToolExit {
        programmer: String,
        code: Option<i32>,
        stderr: String,
    },

    /// The programming tool could not be run
    #[error("{programmer} could not be run: {message}")]
    ToolUnavailable { programmer: String, message: String },

    /// Tentacle did not come back in application mode
    #[error("expected application mode after flashing, found {found}")]
    ReEnumeration { found: String },

    /// Copy to the bootloader volume failed
    #[error("copy to bootloader volume failed: {0}")]
    Copy(String),

    /// Artifact bytes do not match the recorded checksum
    #[error("checksum mismatch: expected {expected}, got {actual}")]
    ChecksumMismatch { expected: String, actual: String },

    /// Artifact file cannot be used
    #[error("artifact unusable: {0}")]
    Artifact(String),

    /// Artifact was built for a different MCU
    #[error("artifact targets {artifact}, tentacle carries {tentacle}")]
    McuMismatch { artifact: String, tentacle: String },

    /// Bootloader device lacks what the chosen strategy needs
    #[error("bootloader device unusable: {0}")]
    Device(String),

    /// Hardware failed underneath the flash
    #[error("hardware failure: {0}")]
    Hardware(String),
}

impl RigError {
    /// Create a hardware timeout error
    pub fn timeout(what: impl Into<String>, timeout: Duration) -> Self {
        RigError::HardwareTimeout {
            what: what.into(),
            timeout,
        }
    }

    /// Create an infrastructure error
    pub fn infra(msg: impl Into<String>) -> Self {
        RigError::Infra(msg.into())
    }

    /// Create a configuration error
    pub fn config(msg: impl Into<String>) -> Self {
        RigError::Config(msg.into())
    }

    /// Create a busy error
    pub fn busy(tentacle: &TentacleId) -> Self {
        RigError::Busy(tentacle.clone())
    }

    /// Create an invalid state error
    pub fn invalid_state(tentacle: &TentacleId, msg: impl Into<String>) -> Self {
        RigError::InvalidState {
            tentacle: tentacle.clone(),
            message: msg.into(),
        }
    }

    /// Create a flash error
    pub fn flash(tentacle: &TentacleId, cause: FlashCause) -> Self {
        RigError::Flash {
            tentacle: tentacle.clone(),
            cause,
        }
    }

    /// Create an unsatisfiable request error
    pub fn unsatisfiable(role: impl Into<String>, reason: impl Into<String>) -> Self {
        RigError::UnsatisfiableRequest {
            role: role.into(),
            reason: reason.into(),
        }
    }

    /// Whether a fresh attempt on the same hardware may succeed
    pub fn is_transient(&self) -> bool {
        match self {
            RigError::HardwareTimeout { .. } => true,
            RigError::Flash { cause, .. } => matches!(
                cause,
                FlashCause::Timeout { .. }
                    | FlashCause::ToolExit { .. }
                    | FlashCause::ReEnumeration { .. }
                    | FlashCause::Copy(_)
            ),
            _ => false,
        }
    }

    /// Whether the failure lies with the rig rather than the board under test
    pub fn is_infra(&self) -> bool {
        match self {
            RigError::Infra(_)
            | RigError::Io(_)
            | RigError::DuplicateSerial { .. }
            | RigError::UnknownRail(_)
            | RigError::Config(_) => true,
            RigError::Flash { cause, .. } => matches!(
                cause,
                FlashCause::ToolUnavailable { .. } | FlashCause::Hardware(_)
            ),
            _ => false,
        }
    }
}

impl From<tokio::task::JoinError> for RigError {
    fn from(err: tokio::task::JoinError) -> Self {
        RigError::Infra(format!("background task failed: {err}"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_transient_classification() {
        assert!(RigError::timeout("bootloader", Duration::from_secs(3)).is_transient());
        assert!(!RigError::infra("relay board gone").is_transient());

        let id = TentacleId::new("e46340474b4c1331").unwrap();
        let tool = RigError::flash(
            &id,
            FlashCause::ToolExit {
                programmer: "picotool".into(),
                code: Some(1),
                stderr: "no device".into(),
            },
        );
        assert!(tool.is_transient());
        assert!(!tool.is_infra());

        let mismatch = RigError::flash(
            &id,
            FlashCause::McuMismatch {
                artifact: "rp2".into(),
                tentacle: "esp32".into(),
            },
        );
        assert!(!mismatch.is_transient());
    }

    #[test]
    fn test_infra_classification() {
        assert!(RigError::infra("x").is_infra());
        assert!(RigError::UnknownRail("bogus".into()).is_infra());
        assert!(!RigError::timeout("x", Duration::from_millis(1)).is_infra());
    }

    #[test]
    fn test_error_display() {
        let err = RigError::unsatisfiable("dut", "no tentacle with mcu=rp2");
        assert_eq!(
            err.to_string(),
            "Role 'dut' cannot be satisfied: no tentacle with mcu=rp2"
        );
    }
}
