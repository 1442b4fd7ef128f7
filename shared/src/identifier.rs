//! 29-bit CAN arbitration identifier codec
//!
//! Every frame exchanged with the positioners packs four fields into the
//! extended CAN arbitration id, from most to least significant bit:
//!
//! ```text
//! | positioner_id (11) | command_id (8) | uid (6) | response_code (4) |
//! ```
//!
//! Commands are sent with `response_code = 0`; positioners echo the
//! identifier back with the response code filled in, which is what lets the
//! scheduler demultiplex replies to the owning command without any payload
//! inspection.

use crate::types::{PositionerId, Uid};

/// Width of the positioner id field in bits.
pub const POSITIONER_ID_BITS: u32 = 11;
/// Width of the command id field in bits.
pub const COMMAND_ID_BITS: u32 = 8;
/// Width of the uid field in bits.
pub const UID_BITS: u32 = 6;
/// Width of the response code field in bits.
pub const RESPONSE_CODE_BITS: u32 = 4;

const RESPONSE_SHIFT: u32 = 0;
const UID_SHIFT: u32 = RESPONSE_CODE_BITS;
const COMMAND_SHIFT: u32 = RESPONSE_CODE_BITS + UID_BITS;
const POSITIONER_SHIFT: u32 = RESPONSE_CODE_BITS + UID_BITS + COMMAND_ID_BITS;

const RESPONSE_MASK: u32 = (1 << RESPONSE_CODE_BITS) - 1;
const UID_MASK: u32 = (1 << UID_BITS) - 1;
const COMMAND_MASK: u32 = (1 << COMMAND_ID_BITS) - 1;
const POSITIONER_MASK: u32 = (1 << POSITIONER_ID_BITS) - 1;

/// Decoded arbitration identifier
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Identifier {
    /// Addressed (or replying) positioner; `0` is broadcast
    pub positioner_id: PositionerId,
    /// Raw command opcode
    pub command_id: u8,
    /// Command nonce; `0` on broadcast frames
    pub uid: Uid,
    /// Response code; `0` (accepted) on outbound frames
    pub response_code: u8,
}

impl Identifier {
    /// Build an identifier for an outbound command frame
    pub const fn command(positioner_id: PositionerId, command_id: u8, uid: Uid) -> Self {
        Self {
            positioner_id,
            command_id,
            uid,
            response_code: 0,
        }
    }

    /// Pack the four fields into a 29-bit arbitration id
    pub const fn encode(&self) -> u32 {
        ((self.positioner_id.value() as u32 & POSITIONER_MASK) << POSITIONER_SHIFT)
            | ((self.command_id as u32 & COMMAND_MASK) << COMMAND_SHIFT)
            | ((self.uid.value() as u32 & UID_MASK) << UID_SHIFT)
            | ((self.response_code as u32 & RESPONSE_MASK) << RESPONSE_SHIFT)
    }

    /// Unpack a 29-bit arbitration id into its four fields
    pub const fn decode(arbitration_id: u32) -> Self {
        Self {
            positioner_id: PositionerId::new(
                ((arbitration_id >> POSITIONER_SHIFT) & POSITIONER_MASK) as u16,
            ),
            command_id: ((arbitration_id >> COMMAND_SHIFT) & COMMAND_MASK) as u8,
            uid: Uid::new(((arbitration_id >> UID_SHIFT) & UID_MASK) as u8),
            response_code: ((arbitration_id >> RESPONSE_SHIFT) & RESPONSE_MASK) as u8,
        }
    }

    /// Decoded response code of this identifier
    pub const fn response(&self) -> ResponseCode {
        ResponseCode::from_bits(self.response_code)
    }
}

/// Response codes carried in the low 4 bits of a reply identifier
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ResponseCode {
    /// Command accepted and executed (or queued)
    CommandAccepted,
    /// A parameter was outside the firmware's accepted range
    ValueOutOfRange,
    /// The uploaded trajectory was malformed or incomplete
    InvalidTrajectory,
    /// A motion command arrived while the positioner was already moving
    AlreadyInMotion,
    /// Motion refused because the datum has not been initialized
    DatumNotInitialized,
    /// The command cannot be issued as a broadcast
    InvalidBroadcastCommand,
    /// The command is not available while in bootloader mode
    InvalidBootloaderCommand,
    /// The opcode is not known to this firmware
    UnknownCommand,
    /// The payload failed firmware-side validation
    InvalidValue,
    /// The positioner refused because a collision flag is latched
    CollisionDetected,
    /// A code this controller does not know
    Reserved(u8),
}

impl ResponseCode {
    /// Decode the 4-bit wire value
    pub const fn from_bits(bits: u8) -> Self {
        match bits {
            0 => Self::CommandAccepted,
            1 => Self::ValueOutOfRange,
            2 => Self::InvalidTrajectory,
            3 => Self::AlreadyInMotion,
            4 => Self::DatumNotInitialized,
            5 => Self::InvalidBroadcastCommand,
            6 => Self::InvalidBootloaderCommand,
            7 => Self::UnknownCommand,
            8 => Self::InvalidValue,
            9 => Self::CollisionDetected,
            other => Self::Reserved(other),
        }
    }

    /// Encode back to the 4-bit wire value
    pub const fn bits(&self) -> u8 {
        match self {
            Self::CommandAccepted => 0,
            Self::ValueOutOfRange => 1,
            Self::InvalidTrajectory => 2,
            Self::AlreadyInMotion => 3,
            Self::DatumNotInitialized => 4,
            Self::InvalidBroadcastCommand => 5,
            Self::InvalidBootloaderCommand => 6,
            Self::UnknownCommand => 7,
            Self::InvalidValue => 8,
            Self::CollisionDetected => 9,
            Self::Reserved(other) => *other,
        }
    }

    /// Whether the reply counts as an acceptance
    pub const fn is_accepted(&self) -> bool {
        matches!(self, Self::CommandAccepted)
    }

    /// Whether the firmware did not recognise the opcode
    pub const fn is_unknown_command(&self) -> bool {
        matches!(self, Self::UnknownCommand)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn test_field_widths_sum_to_29() {
        assert_eq!(
            POSITIONER_ID_BITS + COMMAND_ID_BITS + UID_BITS + RESPONSE_CODE_BITS,
            29
        );
    }

    #[test]
    fn test_encode_known_layout() {
        let id = Identifier {
            positioner_id: PositionerId::new(4),
            command_id: 3,
            uid: Uid::new(1),
            response_code: 0,
        };
        // 4 << 18 | 3 << 10 | 1 << 4
        assert_eq!(id.encode(), (4 << 18) | (3 << 10) | (1 << 4));
    }

    #[test]
    fn test_broadcast_encodes_to_low_positioner_bits() {
        let id = Identifier::command(PositionerId::BROADCAST, 24, Uid::BROADCAST);
        assert_eq!(Identifier::decode(id.encode()).positioner_id, PositionerId::BROADCAST);
        assert_eq!(Identifier::decode(id.encode()).uid, Uid::BROADCAST);
    }

    #[test]
    fn test_response_code_round_trip() {
        for bits in 0..16u8 {
            assert_eq!(ResponseCode::from_bits(bits).bits(), bits);
        }
    }

    proptest! {
        #[test]
        fn prop_identifier_round_trip(
            positioner in 0u16..=PositionerId::MAX,
            command in 0u8..=u8::MAX,
            uid in 0u8..=Uid::MAX,
            response in 0u8..16,
        ) {
            let id = Identifier {
                positioner_id: PositionerId::new(positioner),
                command_id: command,
                uid: Uid::new(uid),
                response_code: response,
            };
            let decoded = Identifier::decode(id.encode());
            prop_assert_eq!(decoded, id);
            // The encoded value must fit the 29-bit extended frame space.
            prop_assert!(id.encode() < (1 << 29));
        }
    }
}
