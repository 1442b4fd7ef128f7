//! The simulated fleet: frame-in, replies-out
//!
//! [`SimFleet`] owns the positioner models and implements the bus side of
//! the protocol: unicast frames reach one positioner, broadcasts reach all
//! of them, and every reply echoes the request identifier with the response
//! code filled in. Time is supplied by the caller, which keeps the fleet
//! deterministic under a paused test clock.

use std::collections::BTreeMap;

use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rand::SeedableRng;

use fps_comms_shared::commands::CommandId;
use fps_comms_shared::identifier::{Identifier, ResponseCode};
use fps_comms_shared::types::{PositionerId, DEFAULT_MOTOR_STEPS};
use fps_comms_shared::wire::CanMessage;

use crate::positioner::SimPositioner;

/// A fleet of simulated positioners behind one virtual bus
#[derive(Debug)]
pub struct SimFleet {
    positioners: BTreeMap<PositionerId, SimPositioner>,
    motor_steps: u32,
    /// Multiplier applied to trajectory durations; tests compress time
    pub time_scale: f64,
    jitter: Option<StdRng>,
    frame_log: Vec<CanMessage>,
}

impl SimFleet {
    /// An empty fleet playing trajectories in real time
    pub fn new() -> Self {
        Self {
            positioners: BTreeMap::new(),
            motor_steps: DEFAULT_MOTOR_STEPS,
            time_scale: 1.0,
            jitter: None,
            frame_log: Vec::new(),
        }
    }

    /// An empty fleet with trajectory durations compressed by `time_scale`
    pub fn with_time_scale(time_scale: f64) -> Self {
        Self {
            time_scale,
            ..Self::new()
        }
    }

    /// Shuffle broadcast reply order with a seeded generator
    pub fn with_reply_jitter(mut self, seed: u64) -> Self {
        self.jitter = Some(StdRng::seed_from_u64(seed));
        self
    }

    /// Add a positioner model
    pub fn add(&mut self, positioner: SimPositioner) {
        self.positioners.insert(positioner.id, positioner);
    }

    /// Add a default firmware-4.1.0 positioner
    pub fn add_default(&mut self, id: u16) {
        self.add(SimPositioner::new(id));
    }

    /// Number of positioners on the bus
    pub fn len(&self) -> usize {
        self.positioners.len()
    }

    /// Whether the bus is empty
    pub fn is_empty(&self) -> bool {
        self.positioners.is_empty()
    }

    /// Shared view of one positioner
    pub fn positioner(&self, id: PositionerId) -> Option<&SimPositioner> {
        self.positioners.get(&id)
    }

    /// Mutable view of one positioner, for fault injection
    pub fn positioner_mut(&mut self, id: PositionerId) -> Option<&mut SimPositioner> {
        self.positioners.get_mut(&id)
    }

    /// Latch a collision on one positioner
    pub fn set_collided(&mut self, id: PositionerId) {
        if let Some(p) = self.positioners.get_mut(&id) {
            p.set_collided();
        }
    }

    /// Complete any motions whose deadline has passed
    pub fn advance(&mut self, now: f64) {
        for positioner in self.positioners.values_mut() {
            positioner.advance(now);
        }
    }

    /// Every frame the bus has seen, in arrival order
    ///
    /// Tests assert on wire behavior through this log.
    pub fn frame_log(&self) -> &[CanMessage] {
        &self.frame_log
    }

    /// Number of logged frames carrying `command`
    pub fn frames_with_command(&self, command: CommandId) -> usize {
        self.frame_log
            .iter()
            .filter(|m| m.identifier().command_id == command.as_u8())
            .count()
    }

    /// Forget all logged frames
    pub fn clear_frame_log(&mut self) {
        self.frame_log.clear();
    }

    /// Process one inbound frame and collect the replies it provokes
    ///
    /// Unknown opcodes get no reply at all, mirroring firmware that does not
    /// acknowledge frames it cannot parse.
    pub fn handle_frame(&mut self, now: f64, message: &CanMessage) -> Vec<CanMessage> {
        self.frame_log.push(message.clone());
        let id = message.identifier();
        let Some(command) = CommandId::from_u8(id.command_id) else {
            return Vec::new();
        };

        let motor_steps = self.motor_steps;
        let time_scale = self.time_scale;

        let targets: Vec<PositionerId> = if id.positioner_id.is_broadcast() {
            self.positioners.keys().copied().collect()
        } else {
            self.positioners
                .keys()
                .copied()
                .filter(|&p| p == id.positioner_id)
                .collect()
        };

        let mut replies = Vec::with_capacity(targets.len());
        for target in targets {
            let Some(positioner) = self.positioners.get_mut(&target) else {
                continue;
            };
            let Some((code, data)) =
                positioner.handle(now, command, &message.data, motor_steps, time_scale)
            else {
                continue;
            };
            replies.push(reply_frame(target, id, code, data));
        }

        if let Some(rng) = self.jitter.as_mut() {
            replies.shuffle(rng);
        }
        replies
    }
}

impl Default for SimFleet {
    fn default() -> Self {
        Self::new()
    }
}

fn reply_frame(
    from: PositionerId,
    request: Identifier,
    code: ResponseCode,
    data: Vec<u8>,
) -> CanMessage {
    let identifier = Identifier {
        positioner_id: from,
        command_id: request.command_id,
        uid: request.uid,
        response_code: code.bits(),
    };
    CanMessage {
        arbitration_id: identifier.encode(),
        data,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use fps_comms_shared::types::Uid;
    use fps_comms_shared::wire;

    fn frame(positioner: u16, command: CommandId, uid: u8, data: Vec<u8>) -> CanMessage {
        let identifier = Identifier::command(
            PositionerId::new(positioner),
            command.as_u8(),
            Uid::new(uid),
        );
        CanMessage {
            arbitration_id: identifier.encode(),
            data,
        }
    }

    #[test]
    fn test_broadcast_reaches_every_positioner() {
        let mut fleet = SimFleet::new();
        for id in [4, 8, 13] {
            fleet.add_default(id);
        }

        let replies = fleet.handle_frame(0.0, &frame(0, CommandId::GetStatus, 0, Vec::new()));
        assert_eq!(replies.len(), 3);

        let mut ids: Vec<u16> = replies
            .iter()
            .map(|r| r.identifier().positioner_id.value())
            .collect();
        ids.sort_unstable();
        assert_eq!(ids, vec![4, 8, 13]);
    }

    #[test]
    fn test_unicast_reaches_one() {
        let mut fleet = SimFleet::new();
        fleet.add_default(4);
        fleet.add_default(8);

        let replies = fleet.handle_frame(0.0, &frame(4, CommandId::GetStatus, 1, Vec::new()));
        assert_eq!(replies.len(), 1);
        assert_eq!(replies[0].identifier().positioner_id, PositionerId::new(4));
        assert_eq!(replies[0].identifier().uid, Uid::new(1));
    }

    #[test]
    fn test_unknown_opcode_is_silent() {
        let mut fleet = SimFleet::new();
        fleet.add_default(4);
        let replies = fleet.handle_frame(0.0, &frame(4, CommandId::GetStatus, 1, Vec::new()));
        assert_eq!(replies.len(), 1);

        let identifier = Identifier::command(PositionerId::new(4), 99, Uid::new(1));
        let bogus = CanMessage {
            arbitration_id: identifier.encode(),
            data: Vec::new(),
        };
        assert!(fleet.handle_frame(0.0, &bogus).is_empty());
    }

    #[test]
    fn test_status_reply_decodes() {
        let mut fleet = SimFleet::new();
        fleet.add_default(4);

        let replies = fleet.handle_frame(0.0, &frame(4, CommandId::GetStatus, 2, Vec::new()));
        let status = wire::decode_status_word(&replies[0].data).unwrap();
        assert_ne!(status & 0x1, 0); // SYSTEM_INITIALIZED
    }

    #[test]
    fn test_jitter_is_deterministic() {
        let mut a = SimFleet::new().with_reply_jitter(7);
        let mut b = SimFleet::new().with_reply_jitter(7);
        for id in 1..=16 {
            a.add_default(id);
            b.add_default(id);
        }
        let request = frame(0, CommandId::GetStatus, 0, Vec::new());
        let ra: Vec<u32> = a
            .handle_frame(0.0, &request)
            .iter()
            .map(|m| m.arbitration_id)
            .collect();
        let rb: Vec<u32> = b
            .handle_frame(0.0, &request)
            .iter()
            .map(|m| m.arbitration_id)
            .collect();
        assert_eq!(ra, rb);
    }
}
