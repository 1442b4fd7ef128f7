//! Positioner status word decoders
//!
//! The firmware reports a 32-bit status word whose bit layout changed between
//! firmware 4.0 and 4.1, and which means something else entirely while a
//! positioner sits in its bootloader. Rather than scattering version checks,
//! the three layouts are decoded into [`DecodedStatus`], and all code that
//! inspects status goes through its canonical predicates.

use bitflags::bitflags;

use crate::types::FirmwareVersion;

bitflags! {
    /// Status bits reported by firmware 4.1 and later
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct StatusV41: u32 {
        /// Boot sequence finished
        const SYSTEM_INITIALIZED        = 0x0000_0001;
        /// Alpha axis has found its datum
        const DATUM_ALPHA_INITIALIZED   = 0x0000_0020;
        /// Beta axis has found its datum
        const DATUM_BETA_INITIALIZED    = 0x0000_0040;
        /// A trajectory upload is open
        const RECEIVING_TRAJECTORY      = 0x0000_0100;
        /// The last commanded displacement has finished
        const DISPLACEMENT_COMPLETED    = 0x0000_0200;
        /// Alpha trajectory fully received
        const TRAJECTORY_ALPHA_RECEIVED = 0x0000_1000;
        /// Beta trajectory fully received
        const TRAJECTORY_BETA_RECEIVED  = 0x0000_2000;
        /// Collision latched on the alpha axis
        const COLLISION_ALPHA           = 0x0004_0000;
        /// Collision latched on the beta axis
        const COLLISION_BETA            = 0x0008_0000;
        /// Alpha axis is under closed-loop control
        const CLOSED_LOOP_ALPHA         = 0x0400_0000;
        /// Beta axis is under closed-loop control
        const CLOSED_LOOP_BETA          = 0x0800_0000;
        /// Precise-move profile active on alpha
        const PRECISE_POSITIONING_ALPHA = 0x1000_0000;
        /// Precise-move profile active on beta
        const PRECISE_POSITIONING_BETA  = 0x2000_0000;
    }
}

bitflags! {
    /// Status bits reported by firmware 4.0
    ///
    /// The 4.0 layout predates the split collision bits and packs the
    /// motion flags lower in the word.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct StatusV40: u32 {
        /// Boot sequence finished
        const SYSTEM_INITIALIZED      = 0x0000_0001;
        /// Alpha axis has found its datum
        const DATUM_ALPHA_INITIALIZED = 0x0000_0010;
        /// Beta axis has found its datum
        const DATUM_BETA_INITIALIZED  = 0x0000_0020;
        /// A trajectory upload is open
        const RECEIVING_TRAJECTORY    = 0x0000_0100;
        /// The last commanded displacement has finished
        const DISPLACEMENT_COMPLETED  = 0x0000_0400;
        /// Collision latched on the alpha axis
        const COLLISION_ALPHA         = 0x0000_2000;
        /// Collision latched on the beta axis
        const COLLISION_BETA          = 0x0000_4000;
        /// Both axes under closed-loop control
        const CLOSED_LOOP             = 0x0001_0000;
    }
}

bitflags! {
    /// Status bits reported by bootloader firmware
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct BootloaderStatus: u32 {
        /// Bootloader is up
        const BOOTLOADER_INIT          = 0x0000_0001;
        /// Bootloader window expired without an upgrade
        const BOOTLOADER_TIMEOUT       = 0x0000_0002;
        /// A firmware image transfer is in progress
        const RECEIVING_NEW_FIRMWARE   = 0x0000_0100;
        /// A full image was received
        const NEW_FIRMWARE_RECEIVED    = 0x0000_0200;
        /// Image checksum verified
        const NEW_FIRMWARE_CHECK_OK    = 0x0000_0400;
        /// Image checksum failed
        const NEW_FIRMWARE_CHECK_BAD   = 0x0000_0800;
    }
}

/// A status word decoded against the layout its firmware uses
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DecodedStatus {
    /// Firmware 4.0 layout
    V40(StatusV40),
    /// Firmware 4.1+ layout
    V41(StatusV41),
    /// Bootloader layout
    Bootloader(BootloaderStatus),
}

impl DecodedStatus {
    /// Decode a raw status word using the layout for `firmware`
    pub fn decode(raw: u32, firmware: &FirmwareVersion) -> Self {
        if firmware.is_bootloader() {
            Self::Bootloader(BootloaderStatus::from_bits_retain(raw))
        } else if firmware.uses_v41_status() {
            Self::V41(StatusV41::from_bits_retain(raw))
        } else {
            Self::V40(StatusV40::from_bits_retain(raw))
        }
    }

    /// Raw 32-bit word this status was decoded from
    pub const fn bits(&self) -> u32 {
        match self {
            Self::V40(s) => s.bits(),
            Self::V41(s) => s.bits(),
            Self::Bootloader(s) => s.bits(),
        }
    }

    /// Whether the positioner finished booting
    pub fn is_system_initialized(&self) -> bool {
        match self {
            Self::V40(s) => s.contains(StatusV40::SYSTEM_INITIALIZED),
            Self::V41(s) => s.contains(StatusV41::SYSTEM_INITIALIZED),
            Self::Bootloader(s) => s.contains(BootloaderStatus::BOOTLOADER_INIT),
        }
    }

    /// Whether both axes have found their datums
    pub fn is_datum_initialized(&self) -> bool {
        match self {
            Self::V40(s) => s.contains(
                StatusV40::DATUM_ALPHA_INITIALIZED | StatusV40::DATUM_BETA_INITIALIZED,
            ),
            Self::V41(s) => s.contains(
                StatusV41::DATUM_ALPHA_INITIALIZED | StatusV41::DATUM_BETA_INITIALIZED,
            ),
            Self::Bootloader(_) => false,
        }
    }

    /// Whether the last commanded displacement has finished
    pub fn has_displacement_completed(&self) -> bool {
        match self {
            Self::V40(s) => s.contains(StatusV40::DISPLACEMENT_COMPLETED),
            Self::V41(s) => s.contains(StatusV41::DISPLACEMENT_COMPLETED),
            Self::Bootloader(_) => false,
        }
    }

    /// Whether a collision is latched on either axis
    pub fn is_collided(&self) -> bool {
        match self {
            Self::V40(s) => {
                s.intersects(StatusV40::COLLISION_ALPHA | StatusV40::COLLISION_BETA)
            }
            Self::V41(s) => {
                s.intersects(StatusV41::COLLISION_ALPHA | StatusV41::COLLISION_BETA)
            }
            Self::Bootloader(_) => false,
        }
    }

    /// Whether both axes run under closed-loop control
    pub fn is_closed_loop(&self) -> bool {
        match self {
            Self::V40(s) => s.contains(StatusV40::CLOSED_LOOP),
            Self::V41(s) => {
                s.contains(StatusV41::CLOSED_LOOP_ALPHA | StatusV41::CLOSED_LOOP_BETA)
            }
            Self::Bootloader(_) => false,
        }
    }

    /// Whether this word came from bootloader firmware
    pub const fn is_bootloader(&self) -> bool {
        matches!(self, Self::Bootloader(_))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const FW_V40: FirmwareVersion = FirmwareVersion::new(4, 0, 21);
    const FW_V41: FirmwareVersion = FirmwareVersion::new(4, 1, 0);
    const FW_BOOT: FirmwareVersion = FirmwareVersion::new(4, 0x80, 0);

    #[test]
    fn test_layout_selection() {
        assert!(matches!(DecodedStatus::decode(0, &FW_V40), DecodedStatus::V40(_)));
        assert!(matches!(DecodedStatus::decode(0, &FW_V41), DecodedStatus::V41(_)));
        assert!(matches!(
            DecodedStatus::decode(0, &FW_BOOT),
            DecodedStatus::Bootloader(_)
        ));
    }

    #[test]
    fn test_collision_bits_differ_between_layouts() {
        // 0x2000 is a collision in 4.0 but not in 4.1.
        assert!(DecodedStatus::decode(0x2000, &FW_V40).is_collided());
        assert!(!DecodedStatus::decode(0x2000, &FW_V41).is_collided());

        assert!(DecodedStatus::decode(0x0004_0000, &FW_V41).is_collided());
        assert!(DecodedStatus::decode(0x0008_0000, &FW_V41).is_collided());
    }

    #[test]
    fn test_displacement_completed() {
        assert!(DecodedStatus::decode(0x200, &FW_V41).has_displacement_completed());
        assert!(DecodedStatus::decode(0x400, &FW_V40).has_displacement_completed());
        assert!(!DecodedStatus::decode(0x200, &FW_BOOT).has_displacement_completed());
    }

    #[test]
    fn test_datum_requires_both_axes() {
        let alpha_only = StatusV41::SYSTEM_INITIALIZED | StatusV41::DATUM_ALPHA_INITIALIZED;
        assert!(!DecodedStatus::V41(alpha_only).is_datum_initialized());

        let both = alpha_only | StatusV41::DATUM_BETA_INITIALIZED;
        assert!(DecodedStatus::V41(both).is_datum_initialized());
    }

    #[test]
    fn test_unknown_bits_are_retained() {
        let decoded = DecodedStatus::decode(0xFFFF_FFFF, &FW_V41);
        assert_eq!(decoded.bits(), 0xFFFF_FFFF);
        assert!(decoded.is_collided());
    }
}
