//! Firmware command opcodes and the command registry
//!
//! Every opcode the controller can issue is described by a [`CommandSpec`]:
//! how many replies to expect, the default timeout, whether the command is
//! "safe" (permitted while the fleet is locked or a positioner is disabled),
//! whether it may be broadcast, whether bootloader firmware accepts it, and
//! which opcode aborts it, if any.
//!
//! The registry is a plain lookup, not a type hierarchy; command execution is
//! table-driven from here.

use core::time::Duration;

/// Firmware command opcodes
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[repr(u8)]
pub enum CommandId {
    /// Ask a positioner to report its id
    GetId = 1,
    /// Read the firmware version triple
    GetFirmwareVersion = 2,
    /// Read the 32-bit status word
    GetStatus = 3,

    /// Move both axes to an absolute position
    GotoAbsolutePosition = 10,
    /// Read the current axis positions in motor steps
    GetActualPosition = 11,
    /// Set the cruise speed for both axes, in RPM
    SetSpeed = 12,
    /// Set the motor current for both axes
    SetCurrent = 13,
    /// Stop the current trajectory and clear collision flags
    StopTrajectory = 14,

    /// Open a trajectory upload, declaring the per-axis sample counts
    SendNewTrajectory = 20,
    /// One `(position, time)` trajectory sample
    SendTrajectoryData = 21,
    /// Close a trajectory upload
    TrajectoryDataEnd = 22,
    /// Abort motion, preserving latched collision flags
    SendTrajectoryAbort = 23,
    /// Start the uploaded trajectory on every addressed positioner
    StartTrajectory = 24,

    /// Start the motor calibration routine
    StartMotorCalibration = 30,
    /// Start the datum calibration routine
    StartDatumCalibration = 31,
    /// Start the cogging torque calibration routine
    StartCoggingCalibration = 32,
    /// Persist the calibration currently in RAM
    SaveInternalCalibration = 33,

    /// Enable the precise-move profile on the alpha axis
    SwitchOnPreciseMoveAlpha = 40,
    /// Disable the precise-move profile on the alpha axis
    SwitchOffPreciseMoveAlpha = 41,
    /// Enable the precise-move profile on the beta axis
    SwitchOnPreciseMoveBeta = 42,
    /// Disable the precise-move profile on the beta axis
    SwitchOffPreciseMoveBeta = 43,
    /// Turn the fiber back-illumination LED on
    SwitchLedOn = 44,
    /// Turn the fiber back-illumination LED off
    SwitchLedOff = 45,

    /// Enter the firmware upgrade protocol
    StartFirmwareUpgrade = 50,
    /// One chunk of a firmware image
    SendFirmwareData = 51,
}

/// Reply accounting mode for a command
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReplyExpectation {
    /// One acceptance per outbound message; complete when all are in
    AckPerMessage,
    /// Collect whatever arrives until the timeout fires
    UntilTimeout,
}

/// Static description of a command opcode
#[derive(Debug, Clone, Copy)]
pub struct CommandSpec {
    /// Human-readable name, used in logs and errors
    pub name: &'static str,
    /// How replies are counted toward completion
    pub replies: ReplyExpectation,
    /// Timeout applied when the caller does not override it
    pub default_timeout: Duration,
    /// Permitted while the fleet is locked or on disabled positioners
    pub safe: bool,
    /// May be addressed to `positioner_id = 0`
    pub broadcast: bool,
    /// Accepted by bootloader firmware
    pub bootloader_ok: bool,
    /// Opcode issued when this command is cancelled mid-flight
    pub abort_form: Option<CommandId>,
}

const fn spec(
    name: &'static str,
    replies: ReplyExpectation,
    timeout_ms: u64,
    safe: bool,
    broadcast: bool,
    bootloader_ok: bool,
    abort_form: Option<CommandId>,
) -> CommandSpec {
    CommandSpec {
        name,
        replies,
        default_timeout: Duration::from_millis(timeout_ms),
        safe,
        broadcast,
        bootloader_ok,
        abort_form,
    }
}

impl CommandId {
    /// All opcodes known to this controller, in opcode order.
    pub const ALL: [CommandId; 25] = [
        CommandId::GetId,
        CommandId::GetFirmwareVersion,
        CommandId::GetStatus,
        CommandId::GotoAbsolutePosition,
        CommandId::GetActualPosition,
        CommandId::SetSpeed,
        CommandId::SetCurrent,
        CommandId::StopTrajectory,
        CommandId::SendNewTrajectory,
        CommandId::SendTrajectoryData,
        CommandId::TrajectoryDataEnd,
        CommandId::SendTrajectoryAbort,
        CommandId::StartTrajectory,
        CommandId::StartMotorCalibration,
        CommandId::StartDatumCalibration,
        CommandId::StartCoggingCalibration,
        CommandId::SaveInternalCalibration,
        CommandId::SwitchOnPreciseMoveAlpha,
        CommandId::SwitchOffPreciseMoveAlpha,
        CommandId::SwitchOnPreciseMoveBeta,
        CommandId::SwitchOffPreciseMoveBeta,
        CommandId::SwitchLedOn,
        CommandId::SwitchLedOff,
        CommandId::StartFirmwareUpgrade,
        CommandId::SendFirmwareData,
    ];

    /// Raw opcode value
    pub const fn as_u8(self) -> u8 {
        self as u8
    }

    /// Decode a raw opcode
    ///
    /// Returns `None` for opcodes this controller does not know; the reply
    /// demultiplexer logs and drops those frames.
    pub const fn from_u8(raw: u8) -> Option<Self> {
        Some(match raw {
            1 => Self::GetId,
            2 => Self::GetFirmwareVersion,
            3 => Self::GetStatus,
            10 => Self::GotoAbsolutePosition,
            11 => Self::GetActualPosition,
            12 => Self::SetSpeed,
            13 => Self::SetCurrent,
            14 => Self::StopTrajectory,
            20 => Self::SendNewTrajectory,
            21 => Self::SendTrajectoryData,
            22 => Self::TrajectoryDataEnd,
            23 => Self::SendTrajectoryAbort,
            24 => Self::StartTrajectory,
            30 => Self::StartMotorCalibration,
            31 => Self::StartDatumCalibration,
            32 => Self::StartCoggingCalibration,
            33 => Self::SaveInternalCalibration,
            40 => Self::SwitchOnPreciseMoveAlpha,
            41 => Self::SwitchOffPreciseMoveAlpha,
            42 => Self::SwitchOnPreciseMoveBeta,
            43 => Self::SwitchOffPreciseMoveBeta,
            44 => Self::SwitchLedOn,
            45 => Self::SwitchLedOff,
            50 => Self::StartFirmwareUpgrade,
            51 => Self::SendFirmwareData,
            _ => return None,
        })
    }

    /// Registry entry for this opcode
    pub const fn spec(self) -> CommandSpec {
        use ReplyExpectation::{AckPerMessage, UntilTimeout};

        match self {
            Self::GetId => spec("GET_ID", UntilTimeout, 1_000, true, true, true, None),
            Self::GetFirmwareVersion => {
                spec("GET_FIRMWARE_VERSION", AckPerMessage, 1_000, true, true, true, None)
            }
            Self::GetStatus => spec("GET_STATUS", AckPerMessage, 500, true, true, true, None),
            Self::GotoAbsolutePosition => spec(
                "GOTO_ABSOLUTE_POSITION",
                AckPerMessage,
                2_000,
                false,
                false,
                false,
                Some(Self::SendTrajectoryAbort),
            ),
            Self::GetActualPosition => {
                spec("GET_ACTUAL_POSITION", AckPerMessage, 500, true, true, false, None)
            }
            Self::SetSpeed => spec("SET_SPEED", AckPerMessage, 1_000, false, true, false, None),
            Self::SetCurrent => spec("SET_CURRENT", AckPerMessage, 1_000, false, true, false, None),
            Self::StopTrajectory => {
                spec("STOP_TRAJECTORY", AckPerMessage, 1_000, true, true, false, None)
            }
            Self::SendNewTrajectory => spec(
                "SEND_NEW_TRAJECTORY",
                AckPerMessage,
                5_000,
                false,
                false,
                false,
                Some(Self::SendTrajectoryAbort),
            ),
            Self::SendTrajectoryData => spec(
                "SEND_TRAJECTORY_DATA",
                AckPerMessage,
                5_000,
                false,
                false,
                false,
                Some(Self::SendTrajectoryAbort),
            ),
            Self::TrajectoryDataEnd => spec(
                "TRAJECTORY_DATA_END",
                AckPerMessage,
                5_000,
                false,
                false,
                false,
                Some(Self::SendTrajectoryAbort),
            ),
            Self::SendTrajectoryAbort => {
                spec("SEND_TRAJECTORY_ABORT", AckPerMessage, 1_000, true, true, false, None)
            }
            Self::StartTrajectory => spec(
                "START_TRAJECTORY",
                AckPerMessage,
                1_000,
                false,
                true,
                false,
                Some(Self::SendTrajectoryAbort),
            ),
            Self::StartMotorCalibration => {
                spec("START_MOTOR_CALIBRATION", AckPerMessage, 2_000, false, false, false, None)
            }
            Self::StartDatumCalibration => {
                spec("START_DATUM_CALIBRATION", AckPerMessage, 2_000, false, false, false, None)
            }
            Self::StartCoggingCalibration => {
                spec("START_COGGING_CALIBRATION", AckPerMessage, 2_000, false, false, false, None)
            }
            Self::SaveInternalCalibration => {
                spec("SAVE_INTERNAL_CALIBRATION", AckPerMessage, 2_000, false, false, false, None)
            }
            Self::SwitchOnPreciseMoveAlpha => {
                spec("SWITCH_ON_PRECISE_MOVE_ALPHA", AckPerMessage, 1_000, false, true, false, None)
            }
            Self::SwitchOffPreciseMoveAlpha => spec(
                "SWITCH_OFF_PRECISE_MOVE_ALPHA",
                AckPerMessage,
                1_000,
                false,
                true,
                false,
                None,
            ),
            Self::SwitchOnPreciseMoveBeta => {
                spec("SWITCH_ON_PRECISE_MOVE_BETA", AckPerMessage, 1_000, false, true, false, None)
            }
            Self::SwitchOffPreciseMoveBeta => spec(
                "SWITCH_OFF_PRECISE_MOVE_BETA",
                AckPerMessage,
                1_000,
                false,
                true,
                false,
                None,
            ),
            Self::SwitchLedOn => spec("SWITCH_LED_ON", AckPerMessage, 1_000, true, true, false, None),
            Self::SwitchLedOff => {
                spec("SWITCH_LED_OFF", AckPerMessage, 1_000, true, true, false, None)
            }
            Self::StartFirmwareUpgrade => {
                spec("START_FIRMWARE_UPGRADE", AckPerMessage, 10_000, false, false, true, None)
            }
            Self::SendFirmwareData => {
                spec("SEND_FIRMWARE_DATA", AckPerMessage, 15_000, false, false, true, None)
            }
        }
    }

    /// Human-readable opcode name
    pub const fn name(self) -> &'static str {
        self.spec().name
    }

    /// Whether this opcode is permitted while the fleet is locked
    pub const fn is_safe(self) -> bool {
        self.spec().safe
    }
}

impl core::fmt::Display for CommandId {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        write!(f, "{}", self.name())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_opcode_round_trip() {
        for id in CommandId::ALL {
            assert_eq!(CommandId::from_u8(id.as_u8()), Some(id));
        }
    }

    #[test]
    fn test_unknown_opcode() {
        assert_eq!(CommandId::from_u8(0), None);
        assert_eq!(CommandId::from_u8(99), None);
    }

    #[test]
    fn test_safe_set_is_read_only_or_stopping() {
        let safe: Vec<_> = CommandId::ALL.iter().filter(|c| c.is_safe()).collect();
        assert!(safe.contains(&&CommandId::GetStatus));
        assert!(safe.contains(&&CommandId::StopTrajectory));
        assert!(safe.contains(&&CommandId::SendTrajectoryAbort));
        assert!(!safe.contains(&&CommandId::GotoAbsolutePosition));
        assert!(!safe.contains(&&CommandId::StartTrajectory));
        assert!(!safe.contains(&&CommandId::SendNewTrajectory));
    }

    #[test]
    fn test_motion_opcodes_have_abort_form() {
        assert_eq!(
            CommandId::GotoAbsolutePosition.spec().abort_form,
            Some(CommandId::SendTrajectoryAbort)
        );
        assert_eq!(
            CommandId::StartTrajectory.spec().abort_form,
            Some(CommandId::SendTrajectoryAbort)
        );
        assert_eq!(CommandId::GetStatus.spec().abort_form, None);
    }

    #[test]
    fn test_timeouts_are_positive() {
        for id in CommandId::ALL {
            assert!(id.spec().default_timeout > Duration::ZERO, "{}", id.name());
        }
    }

    #[test]
    fn test_bootloader_subset() {
        for id in CommandId::ALL {
            let s = id.spec();
            if s.bootloader_ok {
                assert!(
                    matches!(
                        id,
                        CommandId::GetId
                            | CommandId::GetFirmwareVersion
                            | CommandId::GetStatus
                            | CommandId::StartFirmwareUpgrade
                            | CommandId::SendFirmwareData
                    ),
                    "{} unexpectedly bootloader-ok",
                    s.name
                );
            }
        }
    }
}
