//! Common data types for the focal plane CAN controller
//!
//! This module defines the fundamental types used throughout the controller,
//! ensuring type safety and clear interfaces between the wire layer, the
//! scheduler and the fleet coordinator.

use core::fmt;

use serde::{Deserialize, Serialize};

/// Identifier of a positioner on the CAN network
///
/// Valid positioner ids are `1..=2047` (the arbitration id reserves 11 bits
/// for them). Id `0` is the broadcast address heard by every positioner; no
/// positioner object ever carries it.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize,
)]
#[serde(transparent)]
pub struct PositionerId(pub u16);

impl PositionerId {
    /// The reserved broadcast address.
    pub const BROADCAST: Self = Self(0);

    /// Largest id representable in the 11-bit arbitration field.
    pub const MAX: u16 = (1 << 11) - 1;

    /// Create a new positioner id
    pub const fn new(id: u16) -> Self {
        Self(id)
    }

    /// Get the raw id value
    pub const fn value(&self) -> u16 {
        self.0
    }

    /// Whether this id addresses every positioner on the bus
    pub const fn is_broadcast(&self) -> bool {
        self.0 == 0
    }
}

impl fmt::Display for PositionerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_broadcast() {
            write!(f, "broadcast")
        } else {
            write!(f, "{}", self.0)
        }
    }
}

/// Command nonce disambiguating in-flight commands
///
/// A small integer allocated per `(command_id, positioner_id)` pair. `0` is
/// reserved for broadcasts and is never issued for a per-positioner command.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Uid(pub u8);

impl Uid {
    /// The uid carried by every broadcast frame.
    pub const BROADCAST: Self = Self(0);

    /// Largest uid representable in the 6-bit arbitration field.
    pub const MAX: u8 = (1 << 6) - 1;

    /// Create a new uid
    pub const fn new(uid: u8) -> Self {
        Self(uid)
    }

    /// Get the raw uid value
    pub const fn value(&self) -> u8 {
        self.0
    }
}

/// Location of a positioner on the transport fabric
///
/// Assigned at discovery from the first reply received and used by the
/// scheduler to route unicast frames.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct BusRef {
    /// Index of the bus interface within the controller
    pub interface: usize,
    /// Bus index within that interface
    pub bus: usize,
}

impl BusRef {
    /// Create a new bus reference
    pub const fn new(interface: usize, bus: usize) -> Self {
        Self { interface, bus }
    }
}

impl fmt::Display for BusRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.interface, self.bus)
    }
}

/// Firmware version triple reported by a positioner
///
/// A minor version of `0x80` marks bootloader mode, entered for roughly ten
/// seconds after power-up. Bootloader firmware accepts only the firmware
/// upgrade command set and reports status through a narrower decoder.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct FirmwareVersion {
    /// Major version
    pub major: u16,
    /// Minor version; `0x80` means bootloader
    pub minor: u16,
    /// Patch version
    pub patch: u16,
}

/// Minor version value that marks bootloader firmware.
pub const BOOTLOADER_MINOR: u16 = 0x80;

impl FirmwareVersion {
    /// Create a new firmware version
    pub const fn new(major: u16, minor: u16, patch: u16) -> Self {
        Self {
            major,
            minor,
            patch,
        }
    }

    /// Whether this version marks bootloader mode
    pub const fn is_bootloader(&self) -> bool {
        self.minor == BOOTLOADER_MINOR
    }

    /// Whether the 4.1+ status decoder applies to this firmware
    ///
    /// Firmware 4.0 and 4.1 interpret the high and low halves of the status
    /// word differently; everything at or above 4.1 uses the newer layout.
    pub const fn uses_v41_status(&self) -> bool {
        self.major > 4 || (self.major == 4 && self.minor >= 1 && !self.is_bootloader())
    }
}

impl fmt::Display for FirmwareVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:02}.{:02}.{:02}", self.major, self.minor, self.patch)
    }
}

/// Default number of motor steps per full revolution (2^30).
pub const DEFAULT_MOTOR_STEPS: u32 = 1 << 30;

/// Wire time unit for trajectory samples, in seconds.
pub const TIME_STEP: f64 = 0.0005;

/// Convert an angle in degrees to signed motor steps
///
/// Negative angles are valid; positioners park below zero after datuming.
pub fn degrees_to_steps(degrees: f64, motor_steps: u32) -> i32 {
    (degrees * f64::from(motor_steps) / 360.0).round() as i32
}

/// Convert signed motor steps to an angle in degrees
pub fn steps_to_degrees(steps: i32, motor_steps: u32) -> f64 {
    f64::from(steps) * 360.0 / f64::from(motor_steps)
}

/// Convert a time in seconds to wire ticks
pub fn seconds_to_ticks(seconds: f64) -> u32 {
    (seconds / TIME_STEP).round() as u32
}

/// Convert wire ticks to a time in seconds
pub fn ticks_to_seconds(ticks: u32) -> f64 {
    f64::from(ticks) * TIME_STEP
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_abs_diff_eq;

    #[test]
    fn test_broadcast_id() {
        assert!(PositionerId::BROADCAST.is_broadcast());
        assert!(!PositionerId::new(4).is_broadcast());
        assert_eq!(PositionerId::new(13).value(), 13);
    }

    #[test]
    fn test_bootloader_detection() {
        let normal = FirmwareVersion::new(4, 1, 0);
        let bootloader = FirmwareVersion::new(4, 0x80, 3);

        assert!(!normal.is_bootloader());
        assert!(bootloader.is_bootloader());
        assert!(normal.uses_v41_status());
        assert!(!bootloader.uses_v41_status());
        assert!(!FirmwareVersion::new(4, 0, 21).uses_v41_status());
    }

    #[test]
    fn test_step_conversion_round_trip() {
        for degrees in [-5.0, 0.0, 45.0, 90.0, 180.0, 359.99, 365.0] {
            let steps = degrees_to_steps(degrees, DEFAULT_MOTOR_STEPS);
            let back = steps_to_degrees(steps, DEFAULT_MOTOR_STEPS);
            assert_abs_diff_eq!(back, degrees, epsilon = 1e-6);
        }
    }

    #[test]
    fn test_step_conversion_negative() {
        let steps = degrees_to_steps(-10.0, DEFAULT_MOTOR_STEPS);
        assert!(steps < 0);
        assert_abs_diff_eq!(
            steps_to_degrees(steps, DEFAULT_MOTOR_STEPS),
            -10.0,
            epsilon = 1e-6
        );
    }

    #[test]
    fn test_tick_conversion() {
        assert_eq!(seconds_to_ticks(1.0), 2000);
        assert_abs_diff_eq!(ticks_to_seconds(2000), 1.0, epsilon = 1e-12);
    }
}
