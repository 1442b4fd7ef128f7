//! CAN frame records and payload codecs
//!
//! Frames are plain value records. All multi-byte payload integers are
//! little-endian; angles travel as signed 32-bit motor steps and speeds as
//! unsigned integer RPM clipped to the device bounds.

use crate::error::{FpsError, Result};
use crate::identifier::{Identifier, ResponseCode};
use crate::types::{BusRef, FirmwareVersion, PositionerId, Uid};

/// Maximum CAN payload length in bytes.
pub const MAX_PAYLOAD: usize = 8;

/// Lowest speed the firmware accepts, in RPM.
pub const MIN_SPEED_RPM: u32 = 0;
/// Highest speed the firmware accepts, in RPM.
pub const MAX_SPEED_RPM: u32 = 5_000;

/// An outbound or inbound CAN frame, before transport tagging
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CanMessage {
    /// 29-bit arbitration identifier
    pub arbitration_id: u32,
    /// Payload, at most [`MAX_PAYLOAD`] bytes
    pub data: Vec<u8>,
}

impl CanMessage {
    /// Build a frame from a decoded identifier and payload
    pub fn new(identifier: Identifier, data: Vec<u8>) -> Result<Self> {
        if data.len() > MAX_PAYLOAD {
            return Err(FpsError::MalformedFrame {
                message: format!("payload of {} bytes exceeds CAN limit", data.len()),
            });
        }
        Ok(Self {
            arbitration_id: identifier.encode(),
            data,
        })
    }

    /// Decode the arbitration identifier of this frame
    pub const fn identifier(&self) -> Identifier {
        Identifier::decode(self.arbitration_id)
    }
}

/// A reply frame, demultiplexed and tagged with its origin
#[derive(Debug, Clone)]
pub struct Reply {
    /// Raw opcode echoed by the positioner
    pub command_id: u8,
    /// Replying positioner
    pub positioner_id: PositionerId,
    /// Echoed command nonce
    pub uid: Uid,
    /// Decoded response code
    pub response_code: ResponseCode,
    /// Reply payload
    pub data: Vec<u8>,
    /// Interface and bus the reply arrived on
    pub bus: BusRef,
}

impl Reply {
    /// Build a reply record from a raw received frame
    pub fn from_frame(arbitration_id: u32, data: Vec<u8>, bus: BusRef) -> Self {
        let id = Identifier::decode(arbitration_id);
        Self {
            command_id: id.command_id,
            positioner_id: id.positioner_id,
            uid: id.uid,
            response_code: id.response(),
            data,
            bus,
        }
    }

    /// Whether the positioner accepted the command
    pub const fn is_accepted(&self) -> bool {
        self.response_code.is_accepted()
    }
}

fn le_u16(data: &[u8], offset: usize) -> Result<u16> {
    let bytes: [u8; 2] = data
        .get(offset..offset + 2)
        .and_then(|s| s.try_into().ok())
        .ok_or_else(|| FpsError::MalformedFrame {
            message: format!("payload too short for u16 at offset {offset}"),
        })?;
    Ok(u16::from_le_bytes(bytes))
}

fn le_u32(data: &[u8], offset: usize) -> Result<u32> {
    let bytes: [u8; 4] = data
        .get(offset..offset + 4)
        .and_then(|s| s.try_into().ok())
        .ok_or_else(|| FpsError::MalformedFrame {
            message: format!("payload too short for u32 at offset {offset}"),
        })?;
    Ok(u32::from_le_bytes(bytes))
}

fn le_i32(data: &[u8], offset: usize) -> Result<i32> {
    Ok(le_u32(data, offset)? as i32)
}

/// Encode a two-axis position payload in motor steps
pub fn encode_position(alpha_steps: i32, beta_steps: i32) -> Vec<u8> {
    let mut data = Vec::with_capacity(8);
    data.extend_from_slice(&alpha_steps.to_le_bytes());
    data.extend_from_slice(&beta_steps.to_le_bytes());
    data
}

/// Decode a two-axis position payload in motor steps
pub fn decode_position(data: &[u8]) -> Result<(i32, i32)> {
    Ok((le_i32(data, 0)?, le_i32(data, 4)?))
}

/// Encode a two-axis speed payload, clipping to the device bounds
pub fn encode_speed(alpha_rpm: u32, beta_rpm: u32) -> Vec<u8> {
    let alpha = alpha_rpm.clamp(MIN_SPEED_RPM, MAX_SPEED_RPM);
    let beta = beta_rpm.clamp(MIN_SPEED_RPM, MAX_SPEED_RPM);
    let mut data = Vec::with_capacity(8);
    data.extend_from_slice(&alpha.to_le_bytes());
    data.extend_from_slice(&beta.to_le_bytes());
    data
}

/// Decode a two-axis speed payload
pub fn decode_speed(data: &[u8]) -> Result<(u32, u32)> {
    Ok((le_u32(data, 0)?, le_u32(data, 4)?))
}

/// Encode a two-axis motor current payload
pub fn encode_current(alpha: u32, beta: u32) -> Vec<u8> {
    let mut data = Vec::with_capacity(8);
    data.extend_from_slice(&alpha.to_le_bytes());
    data.extend_from_slice(&beta.to_le_bytes());
    data
}

/// Encode one trajectory sample: position in steps, time in wire ticks
pub fn encode_trajectory_sample(steps: i32, ticks: u32) -> Vec<u8> {
    let mut data = Vec::with_capacity(8);
    data.extend_from_slice(&steps.to_le_bytes());
    data.extend_from_slice(&ticks.to_le_bytes());
    data
}

/// Decode one trajectory sample
pub fn decode_trajectory_sample(data: &[u8]) -> Result<(i32, u32)> {
    Ok((le_i32(data, 0)?, le_u32(data, 4)?))
}

/// Encode the per-axis sample counts opening a trajectory upload
pub fn encode_sample_counts(alpha: u32, beta: u32) -> Vec<u8> {
    let mut data = Vec::with_capacity(8);
    data.extend_from_slice(&alpha.to_le_bytes());
    data.extend_from_slice(&beta.to_le_bytes());
    data
}

/// Decode the per-axis sample counts of a SEND_NEW_TRAJECTORY payload
pub fn decode_sample_counts(data: &[u8]) -> Result<(u32, u32)> {
    Ok((le_u32(data, 0)?, le_u32(data, 4)?))
}

/// Decode a GET_STATUS reply into the raw 32-bit status word
pub fn decode_status_word(data: &[u8]) -> Result<u32> {
    le_u32(data, 0)
}

/// Encode a status word the way firmware reports it
pub fn encode_status_word(status: u32) -> Vec<u8> {
    status.to_le_bytes().to_vec()
}

/// Decode a GET_FIRMWARE_VERSION reply (three little-endian u16 fields)
pub fn decode_firmware_version(data: &[u8]) -> Result<FirmwareVersion> {
    Ok(FirmwareVersion::new(
        le_u16(data, 0)?,
        le_u16(data, 2)?,
        le_u16(data, 4)?,
    ))
}

/// Encode a firmware version the way firmware reports it
pub fn encode_firmware_version(version: &FirmwareVersion) -> Vec<u8> {
    let mut data = Vec::with_capacity(6);
    data.extend_from_slice(&version.major.to_le_bytes());
    data.extend_from_slice(&version.minor.to_le_bytes());
    data.extend_from_slice(&version.patch.to_le_bytes());
    data
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_payload_length_limit() {
        let id = Identifier::command(PositionerId::new(4), 3, Uid::new(1));
        assert!(CanMessage::new(id, vec![0; 8]).is_ok());
        assert!(CanMessage::new(id, vec![0; 9]).is_err());
    }

    #[test]
    fn test_position_round_trip() {
        let data = encode_position(-1_491_308, 536_870_912);
        assert_eq!(data.len(), 8);
        assert_eq!(decode_position(&data).unwrap(), (-1_491_308, 536_870_912));
    }

    #[test]
    fn test_speed_is_clipped() {
        let data = encode_speed(9_999, 1_000);
        assert_eq!(decode_speed(&data).unwrap(), (MAX_SPEED_RPM, 1_000));
    }

    #[test]
    fn test_firmware_version_round_trip() {
        let version = FirmwareVersion::new(4, 1, 0);
        let decoded = decode_firmware_version(&encode_firmware_version(&version)).unwrap();
        assert_eq!(decoded, version);
    }

    #[test]
    fn test_short_payload_is_rejected() {
        assert!(decode_position(&[0, 1, 2]).is_err());
        assert!(decode_status_word(&[]).is_err());
    }

    #[test]
    fn test_reply_from_frame_decodes_identifier() {
        let id = Identifier {
            positioner_id: PositionerId::new(8),
            command_id: 3,
            uid: Uid::new(5),
            response_code: 0,
        };
        let reply = Reply::from_frame(id.encode(), vec![1, 0, 0, 0], BusRef::new(0, 1));
        assert_eq!(reply.positioner_id, PositionerId::new(8));
        assert_eq!(reply.uid, Uid::new(5));
        assert!(reply.is_accepted());
        assert_eq!(reply.bus, BusRef::new(0, 1));
    }
}
