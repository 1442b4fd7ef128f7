//! Error types for the focal plane CAN controller
//!
//! One error enum covers the whole engine so that callers can match on the
//! failure taxonomy: transport faults, firmware rejections, timeouts,
//! trajectory failures, and the fleet-level safety refusals.

use std::collections::BTreeMap;
use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::identifier::ResponseCode;
use crate::types::PositionerId;

/// Standard result type for controller operations
pub type Result<T> = std::result::Result<T, FpsError>;

/// Errors produced by the command engine and the fleet coordinator
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum FpsError {
    /// The bus interface failed while a command was in flight
    #[error("transport error on interface {interface}: {message}")]
    Transport {
        /// Interface index the failure was observed on
        interface: usize,
        /// Describes the disconnect, corruption, or write failure
        message: String,
    },

    /// A reply carried a non-accepting response code
    #[error("{command} rejected by positioner {positioner}: {code:?}")]
    Command {
        /// Opcode name
        command: &'static str,
        /// Positioner that refused
        positioner: PositionerId,
        /// The response code it sent back
        code: ResponseCode,
    },

    /// No reply arrived within the command's timeout
    #[error("{command} to {positioner} timed out after {timeout:?}")]
    Timeout {
        /// Opcode name
        command: &'static str,
        /// Addressed positioner (or broadcast)
        positioner: PositionerId,
        /// The timeout that fired
        timeout: Duration,
    },

    /// The command was cancelled before completing
    #[error("command was cancelled")]
    Cancelled,

    /// A trajectory failed; the per-positioner reasons are attached
    #[error("{0}")]
    Trajectory(#[from] TrajectoryFailure),

    /// A trajectory failed structural validation before any frame was sent
    #[error("invalid trajectory for positioner {positioner}: {message}")]
    InvalidTrajectory {
        /// Positioner whose samples are malformed
        positioner: PositionerId,
        /// What failed validation
        message: String,
    },

    /// A non-safe command was submitted while the fleet is locked
    #[error("fleet is locked; only safe commands may be scheduled")]
    Locked,

    /// A command addressed a disabled positioner
    #[error("positioner {0} is disabled")]
    PositionerDisabled(PositionerId),

    /// A move or trajectory would violate the configured bounds
    #[error("safe mode violation: {message}")]
    SafeModeViolation {
        /// What bound would be violated and by which positioner
        message: String,
    },

    /// Another controller instance already operates this FPS
    #[error("another controller instance holds the lock at {path}")]
    AlreadyRunning {
        /// Path of the contested lockfile
        path: PathBuf,
    },

    /// Configuration layering produced an unusable state
    #[error("invalid configuration: {message}")]
    InvalidConfiguration {
        /// What could not be reconciled
        message: String,
    },

    /// A command addressed a positioner the FPS has never seen
    #[error("positioner {0} is not known to this FPS")]
    UnknownPositioner(PositionerId),

    /// All uids for a `(command, positioner)` pair are in flight
    #[error("uid pool exhausted for {command} on positioner {positioner}")]
    UidPoolExhausted {
        /// Opcode name
        command: &'static str,
        /// Positioner whose pool ran dry
        positioner: PositionerId,
    },

    /// A broadcast was requested for an opcode that forbids it
    #[error("{command} cannot be broadcast")]
    NotBroadcastable {
        /// Opcode name
        command: &'static str,
    },

    /// A frame failed structural validation
    #[error("malformed frame: {message}")]
    MalformedFrame {
        /// What was wrong with it
        message: String,
    },

    /// Underlying I/O failure outside a specific interface
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

impl FpsError {
    /// Whether retrying the same operation can reasonably succeed
    ///
    /// Transport faults and timeouts are transient; refusals, validation
    /// failures, and safety gates are not.
    pub const fn is_recoverable(&self) -> bool {
        matches!(
            self,
            FpsError::Transport { .. } | FpsError::Timeout { .. } | FpsError::Io(_)
        )
    }
}

/// Per-positioner reason a trajectory failed
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TrajectoryFailureReason {
    /// SEND_NEW_TRAJECTORY was not accepted
    NotAcceptedNew,
    /// A SEND_TRAJECTORY_DATA message was not accepted
    NotAcceptedData,
    /// TRAJECTORY_DATA_END was not accepted
    NotAcceptedEnd,
    /// DISPLACEMENT_COMPLETED was still set one second after start
    DidNotStart,
    /// Motion ended away from the final sample
    DidNotReach,
    /// A collision latched during the move
    Collided,
    /// The move was aborted (operator or fleet lock)
    Aborted,
    /// The bus interface failed mid-operation
    InterfaceError,
    /// A frame could not be written
    TransmitError,
    /// No reply within the step's timeout
    Timeout,
}

/// A failed trajectory with its per-positioner reason map
#[derive(Debug, Clone, Error, Serialize, Deserialize)]
#[error("trajectory failed ({message}) [{}]", format_failed(.failed))]
pub struct TrajectoryFailure {
    /// Overall description of the failure
    pub message: String,
    /// Reason per positioner that did not complete
    pub failed: BTreeMap<PositionerId, TrajectoryFailureReason>,
}

fn format_failed(failed: &BTreeMap<PositionerId, TrajectoryFailureReason>) -> String {
    failed
        .iter()
        .map(|(id, reason)| format!("{id}: {reason:?}"))
        .collect::<Vec<_>>()
        .join(", ")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_recoverable_taxonomy() {
        let transport = FpsError::Transport {
            interface: 0,
            message: "connection reset".into(),
        };
        assert!(transport.is_recoverable());
        assert!(!FpsError::Locked.is_recoverable());
        assert!(!FpsError::PositionerDisabled(PositionerId::new(13)).is_recoverable());
    }

    #[test]
    fn test_trajectory_failure_display() {
        let mut failed = BTreeMap::new();
        failed.insert(PositionerId::new(8), TrajectoryFailureReason::Collided);
        failed.insert(PositionerId::new(4), TrajectoryFailureReason::Aborted);

        let err = TrajectoryFailure {
            message: "collision during monitor".into(),
            failed,
        };
        let text = err.to_string();
        assert!(text.contains("4: Aborted"));
        assert!(text.contains("8: Collided"));
    }
}
