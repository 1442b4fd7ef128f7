//! Behavioral model of a single positioner's firmware
//!
//! A [`SimPositioner`] answers the command set the way real firmware does,
//! including trajectory upload bookkeeping, motion playback, bootloader-mode
//! refusals, and the abort/stop distinction in how collision flags survive.

use fps_comms_shared::commands::CommandId;
use fps_comms_shared::identifier::ResponseCode;
use fps_comms_shared::status::{BootloaderStatus, StatusV41};
use fps_comms_shared::types::{
    steps_to_degrees, ticks_to_seconds, FirmwareVersion, PositionerId,
};
use fps_comms_shared::wire;

/// An open trajectory upload
#[derive(Debug, Clone, Default)]
struct Upload {
    expected_alpha: u32,
    expected_beta: u32,
    alpha: Vec<(i32, u32)>,
    beta: Vec<(i32, u32)>,
    closed: bool,
}

/// An in-progress motion
#[derive(Debug, Clone, Copy)]
struct Motion {
    target_alpha: f64,
    target_beta: f64,
    ends_at: f64,
}

/// One simulated positioner
#[derive(Debug, Clone)]
pub struct SimPositioner {
    /// CAN id of this positioner
    pub id: PositionerId,
    /// Current alpha angle in degrees
    pub alpha: f64,
    /// Current beta angle in degrees
    pub beta: f64,
    /// Firmware version it reports
    pub firmware: FirmwareVersion,
    /// Raw status word it reports
    pub status: u32,
    /// Last commanded speed, RPM per axis
    pub speed_rpm: (u32, u32),
    muted: bool,
    drop_replies: u32,
    ignore_start: bool,
    upload: Option<Upload>,
    motion: Option<Motion>,
}

impl SimPositioner {
    /// A datum-initialized, idle positioner running firmware 4.1.0
    pub fn new(id: u16) -> Self {
        let status = StatusV41::SYSTEM_INITIALIZED
            | StatusV41::DATUM_ALPHA_INITIALIZED
            | StatusV41::DATUM_BETA_INITIALIZED
            | StatusV41::DISPLACEMENT_COMPLETED
            | StatusV41::CLOSED_LOOP_ALPHA
            | StatusV41::CLOSED_LOOP_BETA;
        Self {
            id: PositionerId::new(id),
            alpha: 0.0,
            beta: 180.0,
            firmware: FirmwareVersion::new(4, 1, 0),
            status: status.bits(),
            speed_rpm: (1_000, 1_000),
            muted: false,
            drop_replies: 0,
            ignore_start: false,
            upload: None,
            motion: None,
        }
    }

    /// A positioner still sitting in its bootloader window
    pub fn bootloader(id: u16) -> Self {
        Self {
            firmware: FirmwareVersion::new(4, 0x80, 0),
            status: BootloaderStatus::BOOTLOADER_INIT.bits(),
            ..Self::new(id)
        }
    }

    /// Stop answering frames entirely
    pub fn set_muted(&mut self, muted: bool) {
        self.muted = muted;
    }

    /// Swallow the next `count` replies, then answer normally again
    pub fn drop_next_replies(&mut self, count: u32) {
        self.drop_replies = count;
    }

    /// Acknowledge START_TRAJECTORY but never begin moving
    pub fn set_ignore_start(&mut self, ignore: bool) {
        self.ignore_start = ignore;
    }

    /// Latch a collision on the beta axis and freeze motion
    ///
    /// The displacement never completes; the collision bit survives until a
    /// STOP_TRAJECTORY clears it.
    pub fn set_collided(&mut self) {
        self.status |= StatusV41::COLLISION_BETA.bits();
        self.status &= !StatusV41::DISPLACEMENT_COMPLETED.bits();
        self.motion = None;
    }

    /// Whether a collision flag is latched
    pub fn is_collided(&self) -> bool {
        StatusV41::from_bits_retain(self.status)
            .intersects(StatusV41::COLLISION_ALPHA | StatusV41::COLLISION_BETA)
    }

    /// Whether the positioner is currently playing a trajectory
    pub fn is_moving(&self) -> bool {
        self.motion.is_some()
    }

    /// Complete any motion whose deadline has passed
    pub fn advance(&mut self, now: f64) {
        if let Some(motion) = self.motion {
            if now >= motion.ends_at {
                self.alpha = motion.target_alpha;
                self.beta = motion.target_beta;
                self.status |= StatusV41::DISPLACEMENT_COMPLETED.bits();
                self.motion = None;
            }
        }
    }

    /// Handle one addressed frame
    ///
    /// Returns the response code and reply payload, or `None` when the
    /// positioner stays silent (muted, dropping, or an unknown opcode that
    /// real firmware would not acknowledge either).
    pub fn handle(
        &mut self,
        now: f64,
        command: CommandId,
        data: &[u8],
        motor_steps: u32,
        time_scale: f64,
    ) -> Option<(ResponseCode, Vec<u8>)> {
        if self.muted {
            return None;
        }
        if self.drop_replies > 0 {
            self.drop_replies -= 1;
            return None;
        }

        self.advance(now);

        if self.firmware.is_bootloader() && !command.spec().bootloader_ok {
            return Some((ResponseCode::InvalidBootloaderCommand, Vec::new()));
        }

        let accepted = (ResponseCode::CommandAccepted, Vec::new());
        Some(match command {
            CommandId::GetId => (
                ResponseCode::CommandAccepted,
                u32::from(self.id.value()).to_le_bytes().to_vec(),
            ),
            CommandId::GetFirmwareVersion => (
                ResponseCode::CommandAccepted,
                wire::encode_firmware_version(&self.firmware),
            ),
            CommandId::GetStatus => (
                ResponseCode::CommandAccepted,
                wire::encode_status_word(self.status),
            ),
            CommandId::GetActualPosition => (
                ResponseCode::CommandAccepted,
                wire::encode_position(
                    fps_comms_shared::types::degrees_to_steps(self.alpha, motor_steps),
                    fps_comms_shared::types::degrees_to_steps(self.beta, motor_steps),
                ),
            ),
            CommandId::SetSpeed => match wire::decode_speed(data) {
                Ok(speed) => {
                    self.speed_rpm = speed;
                    accepted
                }
                Err(_) => (ResponseCode::InvalidValue, Vec::new()),
            },
            CommandId::GotoAbsolutePosition => {
                self.handle_goto(now, data, motor_steps, time_scale)
            }
            CommandId::SendNewTrajectory => self.handle_new_trajectory(data),
            CommandId::SendTrajectoryData => self.handle_trajectory_data(data),
            CommandId::TrajectoryDataEnd => self.handle_trajectory_end(),
            CommandId::StartTrajectory => self.handle_start(now, motor_steps, time_scale),
            CommandId::StopTrajectory => {
                self.motion = None;
                self.upload = None;
                self.status &= !(StatusV41::COLLISION_ALPHA | StatusV41::COLLISION_BETA).bits();
                self.status &= !self.upload_bits();
                self.status |= StatusV41::DISPLACEMENT_COMPLETED.bits();
                accepted
            }
            CommandId::SendTrajectoryAbort => {
                // Collision bits survive an abort; only a stop clears them.
                self.motion = None;
                self.upload = None;
                self.status &= !self.upload_bits();
                self.status |= StatusV41::DISPLACEMENT_COMPLETED.bits();
                accepted
            }
            CommandId::SetCurrent
            | CommandId::StartMotorCalibration
            | CommandId::StartDatumCalibration
            | CommandId::StartCoggingCalibration
            | CommandId::SaveInternalCalibration
            | CommandId::SwitchOnPreciseMoveAlpha
            | CommandId::SwitchOffPreciseMoveAlpha
            | CommandId::SwitchOnPreciseMoveBeta
            | CommandId::SwitchOffPreciseMoveBeta
            | CommandId::SwitchLedOn
            | CommandId::SwitchLedOff
            | CommandId::StartFirmwareUpgrade
            | CommandId::SendFirmwareData => accepted,
        })
    }

    fn upload_bits(&self) -> u32 {
        (StatusV41::RECEIVING_TRAJECTORY
            | StatusV41::TRAJECTORY_ALPHA_RECEIVED
            | StatusV41::TRAJECTORY_BETA_RECEIVED)
            .bits()
    }

    fn handle_goto(
        &mut self,
        now: f64,
        data: &[u8],
        motor_steps: u32,
        time_scale: f64,
    ) -> (ResponseCode, Vec<u8>) {
        if self.is_collided() {
            return (ResponseCode::CollisionDetected, Vec::new());
        }
        match wire::decode_position(data) {
            Ok((alpha_steps, beta_steps)) => {
                self.status &= !StatusV41::DISPLACEMENT_COMPLETED.bits();
                self.motion = Some(Motion {
                    target_alpha: steps_to_degrees(alpha_steps, motor_steps),
                    target_beta: steps_to_degrees(beta_steps, motor_steps),
                    ends_at: now + time_scale,
                });
                (ResponseCode::CommandAccepted, Vec::new())
            }
            Err(_) => (ResponseCode::InvalidValue, Vec::new()),
        }
    }

    fn handle_new_trajectory(&mut self, data: &[u8]) -> (ResponseCode, Vec<u8>) {
        if self.is_collided() {
            return (ResponseCode::CollisionDetected, Vec::new());
        }
        match wire::decode_sample_counts(data) {
            Ok((alpha, beta)) if alpha > 0 && beta > 0 => {
                self.upload = Some(Upload {
                    expected_alpha: alpha,
                    expected_beta: beta,
                    ..Upload::default()
                });
                self.status |= StatusV41::RECEIVING_TRAJECTORY.bits();
                (ResponseCode::CommandAccepted, Vec::new())
            }
            Ok(_) => (ResponseCode::InvalidTrajectory, Vec::new()),
            Err(_) => (ResponseCode::InvalidValue, Vec::new()),
        }
    }

    fn handle_trajectory_data(&mut self, data: &[u8]) -> (ResponseCode, Vec<u8>) {
        let Some(upload) = self.upload.as_mut() else {
            return (ResponseCode::InvalidTrajectory, Vec::new());
        };
        let Ok(sample) = wire::decode_trajectory_sample(data) else {
            return (ResponseCode::InvalidValue, Vec::new());
        };

        // Alpha samples arrive first, then beta.
        if (upload.alpha.len() as u32) < upload.expected_alpha {
            upload.alpha.push(sample);
        } else if (upload.beta.len() as u32) < upload.expected_beta {
            upload.beta.push(sample);
        } else {
            return (ResponseCode::InvalidTrajectory, Vec::new());
        }
        (ResponseCode::CommandAccepted, Vec::new())
    }

    fn handle_trajectory_end(&mut self) -> (ResponseCode, Vec<u8>) {
        let Some(upload) = self.upload.as_mut() else {
            return (ResponseCode::InvalidTrajectory, Vec::new());
        };
        if (upload.alpha.len() as u32) != upload.expected_alpha
            || (upload.beta.len() as u32) != upload.expected_beta
        {
            return (ResponseCode::InvalidTrajectory, Vec::new());
        }
        upload.closed = true;
        self.status &= !StatusV41::RECEIVING_TRAJECTORY.bits();
        self.status |=
            (StatusV41::TRAJECTORY_ALPHA_RECEIVED | StatusV41::TRAJECTORY_BETA_RECEIVED).bits();
        (ResponseCode::CommandAccepted, Vec::new())
    }

    fn handle_start(
        &mut self,
        now: f64,
        motor_steps: u32,
        time_scale: f64,
    ) -> (ResponseCode, Vec<u8>) {
        if self.is_collided() {
            return (ResponseCode::CollisionDetected, Vec::new());
        }
        let Some(upload) = self.upload.take() else {
            // Nothing uploaded: firmware acknowledges and stays put.
            return (ResponseCode::CommandAccepted, Vec::new());
        };
        if !upload.closed {
            self.upload = Some(upload);
            return (ResponseCode::InvalidTrajectory, Vec::new());
        }
        if self.ignore_start {
            return (ResponseCode::CommandAccepted, Vec::new());
        }

        let duration_ticks = upload
            .alpha
            .last()
            .map(|s| s.1)
            .max(upload.beta.last().map(|s| s.1))
            .unwrap_or(0);
        let target_alpha = upload
            .alpha
            .last()
            .map_or(self.alpha, |s| steps_to_degrees(s.0, motor_steps));
        let target_beta = upload
            .beta
            .last()
            .map_or(self.beta, |s| steps_to_degrees(s.0, motor_steps));

        self.status &= !StatusV41::DISPLACEMENT_COMPLETED.bits();
        self.status &= !self.upload_bits();
        self.motion = Some(Motion {
            target_alpha,
            target_beta,
            ends_at: now + ticks_to_seconds(duration_ticks) * time_scale,
        });
        (ResponseCode::CommandAccepted, Vec::new())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_abs_diff_eq;
    use fps_comms_shared::types::{degrees_to_steps, DEFAULT_MOTOR_STEPS};

    const STEPS: u32 = DEFAULT_MOTOR_STEPS;

    fn upload_two_point(p: &mut SimPositioner, alpha_end: f64, beta_end: f64, ticks: u32) {
        let (code, _) = p
            .handle(0.0, CommandId::SendNewTrajectory, &wire::encode_sample_counts(2, 2), STEPS, 1.0)
            .unwrap();
        assert_eq!(code, ResponseCode::CommandAccepted);

        for (end, start) in [(alpha_end, 0.0), (beta_end, 180.0)] {
            for (angle, t) in [(start, 0), (end, ticks)] {
                let payload = wire::encode_trajectory_sample(degrees_to_steps(angle, STEPS), t);
                let (code, _) = p
                    .handle(0.0, CommandId::SendTrajectoryData, &payload, STEPS, 1.0)
                    .unwrap();
                assert_eq!(code, ResponseCode::CommandAccepted);
            }
        }

        let (code, _) = p
            .handle(0.0, CommandId::TrajectoryDataEnd, &[], STEPS, 1.0)
            .unwrap();
        assert_eq!(code, ResponseCode::CommandAccepted);
    }

    #[test]
    fn test_trajectory_playback() {
        let mut p = SimPositioner::new(4);
        upload_two_point(&mut p, 90.0, 45.0, 2000); // one second of motion

        let (code, _) = p.handle(0.0, CommandId::StartTrajectory, &[], STEPS, 1.0).unwrap();
        assert_eq!(code, ResponseCode::CommandAccepted);
        assert!(p.is_moving());

        p.advance(0.5);
        assert!(p.is_moving());

        p.advance(1.5);
        assert!(!p.is_moving());
        assert_abs_diff_eq!(p.alpha, 90.0, epsilon = 1e-3);
        assert_abs_diff_eq!(p.beta, 45.0, epsilon = 1e-3);
        assert!(StatusV41::from_bits_retain(p.status).contains(StatusV41::DISPLACEMENT_COMPLETED));
    }

    #[test]
    fn test_abort_preserves_collision_stop_clears_it() {
        let mut p = SimPositioner::new(8);
        p.set_collided();
        assert!(p.is_collided());

        let (code, _) = p
            .handle(0.0, CommandId::SendTrajectoryAbort, &[], STEPS, 1.0)
            .unwrap();
        assert_eq!(code, ResponseCode::CommandAccepted);
        assert!(p.is_collided());

        let (code, _) = p.handle(0.0, CommandId::StopTrajectory, &[], STEPS, 1.0).unwrap();
        assert_eq!(code, ResponseCode::CommandAccepted);
        assert!(!p.is_collided());
    }

    #[test]
    fn test_collided_refuses_motion() {
        let mut p = SimPositioner::new(8);
        p.set_collided();
        let (code, _) = p
            .handle(0.0, CommandId::StartTrajectory, &[], STEPS, 1.0)
            .unwrap();
        assert_eq!(code, ResponseCode::CollisionDetected);
    }

    #[test]
    fn test_bootloader_refuses_motion_commands() {
        let mut p = SimPositioner::bootloader(13);
        let (code, _) = p
            .handle(0.0, CommandId::StartTrajectory, &[], STEPS, 1.0)
            .unwrap();
        assert_eq!(code, ResponseCode::InvalidBootloaderCommand);

        let (code, data) = p
            .handle(0.0, CommandId::GetFirmwareVersion, &[], STEPS, 1.0)
            .unwrap();
        assert_eq!(code, ResponseCode::CommandAccepted);
        assert!(wire::decode_firmware_version(&data).unwrap().is_bootloader());
    }

    #[test]
    fn test_sample_count_mismatch_rejected_at_end() {
        let mut p = SimPositioner::new(4);
        p.handle(0.0, CommandId::SendNewTrajectory, &wire::encode_sample_counts(2, 1), STEPS, 1.0)
            .unwrap();
        p.handle(
            0.0,
            CommandId::SendTrajectoryData,
            &wire::encode_trajectory_sample(0, 0),
            STEPS,
            1.0,
        )
        .unwrap();

        let (code, _) = p.handle(0.0, CommandId::TrajectoryDataEnd, &[], STEPS, 1.0).unwrap();
        assert_eq!(code, ResponseCode::InvalidTrajectory);
    }

    #[test]
    fn test_muted_positioner_is_silent() {
        let mut p = SimPositioner::new(4);
        p.set_muted(true);
        assert!(p.handle(0.0, CommandId::GetStatus, &[], STEPS, 1.0).is_none());
    }
}
