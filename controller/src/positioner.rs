//! Per-positioner state
//!
//! A [`Positioner`] is the coordinator's record of one robot: last known
//! angles, raw status word, firmware, discovered bus location, and policy
//! flags. It is mutated only by the coordinator's state task; everyone else
//! works on snapshots (the type is plain data and cheap to clone).

use fps_comms_shared::status::DecodedStatus;
use fps_comms_shared::types::{
    steps_to_degrees, BusRef, FirmwareVersion, PositionerId,
};

/// Policy and lifecycle flags
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PositionerFlags {
    /// Excluded from all non-safe commands and trajectories; sticky across
    /// re-initialization
    pub disabled: bool,
    /// Did not respond during discovery
    pub offline: bool,
    /// Firmware-side collision detection has been switched off
    pub no_collision_detect: bool,
    /// Running open-loop (no encoder feedback)
    pub open_loop: bool,
    /// Currently in bootloader mode
    pub bootloader: bool,
    /// Went through the initialization sequence
    pub initialized: bool,
}

/// The coordinator's record of one positioner
#[derive(Debug, Clone)]
pub struct Positioner {
    /// CAN id
    pub id: PositionerId,
    /// Last known alpha angle, degrees; `None` until first read
    pub alpha: Option<f64>,
    /// Last known beta angle, degrees; `None` until first read
    pub beta: Option<f64>,
    /// Last raw status word
    pub status_raw: Option<u32>,
    /// Reported firmware version
    pub firmware: Option<FirmwareVersion>,
    /// Interface and bus it answers on
    pub bus: Option<BusRef>,
    /// Policy flags
    pub flags: PositionerFlags,
}

impl Positioner {
    /// A blank record for a newly seen id
    pub fn new(id: PositionerId) -> Self {
        Self {
            id,
            alpha: None,
            beta: None,
            status_raw: None,
            firmware: None,
            bus: None,
            flags: PositionerFlags::default(),
        }
    }

    /// Status decoded against this positioner's firmware
    ///
    /// Falls back to the 4.1+ layout when the firmware is not yet known.
    pub fn status(&self) -> Option<DecodedStatus> {
        let raw = self.status_raw?;
        let firmware = self
            .firmware
            .unwrap_or(FirmwareVersion::new(4, 1, 0));
        Some(DecodedStatus::decode(raw, &firmware))
    }

    /// Whether either axis has a latched collision
    pub fn is_collided(&self) -> bool {
        self.status().is_some_and(|s| s.is_collided())
    }

    /// Whether the last commanded displacement has finished
    pub fn has_displacement_completed(&self) -> bool {
        self.status().is_some_and(|s| s.has_displacement_completed())
    }

    /// Whether non-safe commands may address this positioner
    pub fn is_available(&self) -> bool {
        !self.flags.disabled && !self.flags.offline && !self.flags.bootloader
    }

    /// Apply a status reply; returns whether the word changed
    pub(crate) fn apply_status(&mut self, raw: u32) -> bool {
        let changed = self.status_raw != Some(raw);
        self.status_raw = Some(raw);
        if let Some(status) = self.status() {
            if !status.is_bootloader() {
                self.flags.open_loop = !status.is_closed_loop();
            }
        }
        changed
    }

    /// Apply a firmware reply
    pub(crate) fn apply_firmware(&mut self, version: FirmwareVersion) {
        self.flags.bootloader = version.is_bootloader();
        self.firmware = Some(version);
    }

    /// Apply a position reply given the configured steps-per-revolution
    pub(crate) fn apply_position(&mut self, alpha_steps: i32, beta_steps: i32, motor_steps: u32) {
        self.alpha = Some(steps_to_degrees(alpha_steps, motor_steps));
        self.beta = Some(steps_to_degrees(beta_steps, motor_steps));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use fps_comms_shared::status::StatusV41;
    use fps_comms_shared::types::DEFAULT_MOTOR_STEPS;

    #[test]
    fn test_new_positioner_has_no_position() {
        let p = Positioner::new(PositionerId::new(4));
        assert!(p.alpha.is_none());
        assert!(p.status().is_none());
        assert!(p.is_available());
    }

    #[test]
    fn test_status_decoding_uses_firmware() {
        let mut p = Positioner::new(PositionerId::new(4));
        p.apply_firmware(FirmwareVersion::new(4, 0, 21));
        // 0x2000 is a collision in the 4.0 layout only.
        assert!(p.apply_status(0x2000));
        assert!(p.is_collided());

        p.apply_firmware(FirmwareVersion::new(4, 1, 0));
        assert!(!p.is_collided());
    }

    #[test]
    fn test_apply_status_reports_changes() {
        let mut p = Positioner::new(PositionerId::new(4));
        let word = StatusV41::SYSTEM_INITIALIZED.bits();
        assert!(p.apply_status(word));
        assert!(!p.apply_status(word));
        assert!(p.apply_status(word | StatusV41::DISPLACEMENT_COMPLETED.bits()));
    }

    #[test]
    fn test_bootloader_flag_follows_firmware() {
        let mut p = Positioner::new(PositionerId::new(4));
        p.apply_firmware(FirmwareVersion::new(4, 0x80, 0));
        assert!(p.flags.bootloader);
        assert!(!p.is_available());
    }

    #[test]
    fn test_position_conversion() {
        let mut p = Positioner::new(PositionerId::new(4));
        let steps = fps_comms_shared::types::degrees_to_steps(90.0, DEFAULT_MOTOR_STEPS);
        p.apply_position(steps, -steps, DEFAULT_MOTOR_STEPS);
        assert!((p.alpha.unwrap() - 90.0).abs() < 1e-6);
        assert!((p.beta.unwrap() + 90.0).abs() < 1e-6);
    }
}
