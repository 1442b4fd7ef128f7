//! The trajectory engine
//!
//! Drives the chunked upload protocol and monitors execution:
//!
//! 1. upload per positioner: SEND_NEW_TRAJECTORY with the per-axis sample
//!    counts, SEND_TRAJECTORY_DATA in chunks (each chunk one command whose
//!    messages carry distinct round-robin uids), TRAJECTORY_DATA_END;
//! 2. on any upload failure, broadcast SEND_TRAJECTORY_ABORT so no
//!    half-transmitted trajectory is ever left armed;
//! 3. broadcast START_TRAJECTORY and stamp the start time;
//! 4. poll status and position until every involved positioner reports
//!    DISPLACEMENT_COMPLETED, is not collided, and sits within the reach
//!    tolerance of its final sample, or until the did-not-start check,
//!    a collision lock, an operator abort, or the deadline ends it;
//! 5. always write the diagnostic dump, success or not.
//!
//! Aborts use SEND_TRAJECTORY_ABORT, never STOP_TRAJECTORY: a stop would
//! clear latched collision flags the operator still needs to see. Every
//! abort is followed by a short cooldown before any further command.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use fps_comms_shared::commands::CommandId;
use fps_comms_shared::error::{
    FpsError, Result, TrajectoryFailure, TrajectoryFailureReason,
};
use fps_comms_shared::trajectory::{Trajectory, TrajectoryData};
use fps_comms_shared::types::{degrees_to_steps, seconds_to_ticks, PositionerId};
use fps_comms_shared::wire;
use serde::Serialize;
use tokio::task::JoinSet;
use tokio::time::{interval, sleep, Instant};
use tracing::{debug, info, warn};

use crate::command::CommandRequest;
use crate::fps::Fps;
use crate::positioner::Positioner;
use crate::scheduler::CanScheduler;

/// One trajectory execution
pub(crate) struct TrajectoryEngine<'a> {
    fps: &'a Fps,
    trajectory: &'a Trajectory,
    involved: Vec<PositionerId>,
    ends: BTreeMap<PositionerId, (f64, f64)>,
    failed: BTreeMap<PositionerId, TrajectoryFailureReason>,
}

impl<'a> TrajectoryEngine<'a> {
    pub(crate) fn new(fps: &'a Fps, trajectory: &'a Trajectory) -> Self {
        Self {
            fps,
            trajectory,
            involved: trajectory.positioner_ids(),
            ends: trajectory.end_positions(),
            failed: BTreeMap::new(),
        }
    }

    /// Run the trajectory to a terminal state
    pub(crate) async fn run(mut self) -> Result<()> {
        let start_wall = Utc::now();
        self.fps.set_moving(true);

        let outcome = self.execute().await;

        self.fps.set_moving(false);
        if outcome.is_ok() {
            self.fps.record_trajectory_executed();
        }
        self.fps.emit(crate::events::FpsEvent::TrajectoryFinished {
            success: outcome.is_ok(),
        });
        self.write_dump(start_wall, Utc::now());

        outcome
    }

    async fn execute(&mut self) -> Result<()> {
        // Watch the operator abort signal from before the first frame so an
        // abort racing the upload is not missed.
        let mut abort_rx = self.fps.abort_epoch();
        let initial_epoch = *abort_rx.borrow_and_update();

        self.upload().await;
        if !self.failed.is_empty() {
            self.abort_fleet().await;
            return Err(self.failure("trajectory upload failed"));
        }

        if let Err(error) = self
            .fps
            .scheduler()
            .execute(CommandRequest::broadcast(CommandId::StartTrajectory))
            .await
        {
            // A collision lock can race the start broadcast; that is a
            // collision outcome, not a start failure.
            if self.fps.is_locked() || matches!(error, FpsError::Cancelled | FpsError::Locked) {
                let table = self.fps.positioners();
                for id in self.involved.clone() {
                    let reason = if table.get(&id).is_some_and(Positioner::is_collided) {
                        TrajectoryFailureReason::Collided
                    } else {
                        TrajectoryFailureReason::Aborted
                    };
                    self.failed.insert(id, reason);
                }
                self.abort_fleet().await;
                return Err(self.failure("fleet locked during trajectory start"));
            }
            warn!(%error, "start broadcast failed");
            for id in self.involved.clone() {
                self.failed.insert(id, TrajectoryFailureReason::DidNotStart);
            }
            self.abort_fleet().await;
            return Err(self.failure("start was not acknowledged"));
        }

        let started = Instant::now();
        info!(
            positioners = self.involved.len(),
            duration = self.trajectory.duration(),
            "trajectory started"
        );
        self.fps.emit(crate::events::FpsEvent::TrajectoryStarted {
            positioners: self.involved.clone(),
            duration: self.trajectory.duration(),
        });

        self.monitor(started, &mut abort_rx, initial_epoch).await
    }

    /// Steps 2-4: open, transmit, and close the upload on every positioner
    async fn upload(&mut self) {
        let chunk_size = self.fps.config().trajectory.chunk_size;
        let motor_steps = self.fps.config().motor_steps;

        let mut uploads: JoinSet<(PositionerId, std::result::Result<(), TrajectoryFailureReason>)> =
            JoinSet::new();
        for (&id, data) in &self.trajectory.0 {
            let scheduler = Arc::clone(self.fps.scheduler());
            let data = data.clone();
            uploads.spawn(async move {
                (
                    id,
                    upload_one(&scheduler, id, &data, chunk_size, motor_steps).await,
                )
            });
        }

        while let Some(joined) = uploads.join_next().await {
            match joined {
                Ok((_, Ok(()))) => {}
                Ok((id, Err(reason))) => {
                    warn!(positioner = %id, ?reason, "trajectory upload failed");
                    self.failed.insert(id, reason);
                }
                Err(error) => {
                    warn!(%error, "upload task aborted");
                }
            }
        }
    }

    /// Step 6: poll until done, failed, aborted, or out of time
    async fn monitor(
        &mut self,
        started: Instant,
        abort_rx: &mut tokio::sync::watch::Receiver<u64>,
        initial_epoch: u64,
    ) -> Result<()> {
        let cfg = self.fps.config().trajectory.clone();
        let duration = self.trajectory.duration();
        let deadline = duration * (1.0 + cfg.timeout_margin) + cfg.start_check_delay + 2.0;
        let mut start_checked = false;

        let mut poll = interval(Duration::from_secs_f64(cfg.monitor_interval));
        poll.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = poll.tick() => {}
                changed = abort_rx.changed() => {
                    let aborted = changed.is_ok() && *abort_rx.borrow() != initial_epoch;
                    if aborted {
                        debug!("operator abort observed");
                        for id in self.involved.clone() {
                            self.failed
                                .entry(id)
                                .or_insert(TrajectoryFailureReason::Aborted);
                        }
                        // The abort broadcast was already issued by the
                        // abort call; only the cooldown remains.
                        self.cooldown().await;
                        return Err(self.failure("trajectory aborted"));
                    }
                    continue;
                }
            }

            // Refresh the fleet view. Both are safe commands, so they pass
            // the gate even when a collision has locked the fleet. The
            // monitor interval doubles as the reply window.
            let window = Duration::from_secs_f64(cfg.monitor_interval);
            let _ = self
                .fps
                .scheduler()
                .execute(CommandRequest::broadcast(CommandId::GetStatus).with_timeout(window))
                .await;
            let _ = self
                .fps
                .scheduler()
                .execute(
                    CommandRequest::broadcast(CommandId::GetActualPosition).with_timeout(window),
                )
                .await;

            let table = self.fps.positioners();

            if self.fps.is_locked() {
                for id in self.involved.clone() {
                    let reason = if table.get(&id).is_some_and(Positioner::is_collided) {
                        TrajectoryFailureReason::Collided
                    } else {
                        TrajectoryFailureReason::Aborted
                    };
                    self.failed.insert(id, reason);
                }
                self.abort_fleet().await;
                return Err(self.failure("fleet locked during trajectory"));
            }

            if self.all_done(&table) {
                debug!("all positioners reached their targets");
                return Ok(());
            }

            let elapsed = started.elapsed().as_secs_f64();

            if !start_checked && elapsed >= cfg.start_check_delay {
                start_checked = true;
                for id in self.involved.clone() {
                    let Some(positioner) = table.get(&id) else {
                        continue;
                    };
                    // Completed already but nowhere near the target: the
                    // move never began.
                    if positioner.has_displacement_completed() && !self.reached(positioner) {
                        self.failed.insert(id, TrajectoryFailureReason::DidNotStart);
                    }
                }
                if !self.failed.is_empty() {
                    self.abort_fleet().await;
                    return Err(self.failure("trajectory did not start"));
                }
            }

            if elapsed > deadline {
                for id in self.involved.clone() {
                    let done = table
                        .get(&id)
                        .is_some_and(|p| p.has_displacement_completed() && self.reached(p));
                    if !done {
                        self.failed.insert(id, TrajectoryFailureReason::DidNotReach);
                    }
                }
                self.abort_fleet().await;
                return Err(self.failure("positioners did not reach their targets"));
            }
        }
    }

    fn all_done(&self, table: &BTreeMap<PositionerId, Positioner>) -> bool {
        self.involved.iter().all(|id| {
            table.get(id).is_some_and(|p| {
                p.has_displacement_completed() && !p.is_collided() && self.reached(p)
            })
        })
    }

    fn reached(&self, positioner: &Positioner) -> bool {
        let tolerance = self.fps.config().trajectory.reach_tolerance;
        let Some(&(end_alpha, end_beta)) = self.ends.get(&positioner.id) else {
            return false;
        };
        match (positioner.alpha, positioner.beta) {
            (Some(alpha), Some(beta)) => {
                (alpha - end_alpha).abs() <= tolerance && (beta - end_beta).abs() <= tolerance
            }
            _ => false,
        }
    }

    /// Broadcast the abort and sit out the cooldown
    async fn abort_fleet(&self) {
        let abort = CommandRequest::broadcast(CommandId::SendTrajectoryAbort).fire_and_forget();
        if let Err(error) = self.fps.scheduler().execute(abort).await {
            warn!(%error, "abort broadcast failed");
        }
        self.cooldown().await;
    }

    async fn cooldown(&self) {
        sleep(Duration::from_secs_f64(
            self.fps.config().trajectory.abort_cooldown,
        ))
        .await;
    }

    fn failure(&self, message: &str) -> FpsError {
        FpsError::Trajectory(TrajectoryFailure {
            message: message.into(),
            failed: self.failed.clone(),
        })
    }

    /// Step 8: best-effort diagnostic record, written on every outcome
    fn write_dump(&self, start_time: DateTime<Utc>, end_time: DateTime<Utc>) {
        let Some(dir) = self.fps.config().dump_dir.clone() else {
            return;
        };

        let table = self.fps.positioners();
        let record = TrajectoryDump {
            start_time,
            end_time,
            duration: self.trajectory.duration(),
            positioners: self
                .involved
                .iter()
                .map(|id| {
                    let position = table
                        .get(id)
                        .map(|p| FinalPosition {
                            alpha: p.alpha,
                            beta: p.beta,
                        })
                        .unwrap_or_default();
                    (*id, position)
                })
                .collect(),
            failed_positioners: self.failed.clone(),
        };

        let path = dir.join(format!(
            "trajectory-{}.json",
            start_time.format("%Y%m%dT%H%M%S%3f")
        ));
        let written = std::fs::create_dir_all(&dir)
            .and_then(|()| {
                let body = serde_json::to_vec_pretty(&record)?;
                std::fs::write(&path, body)
            });
        match written {
            Ok(()) => debug!(path = %path.display(), "trajectory dump written"),
            Err(error) => warn!(%error, "trajectory dump not written"),
        }
    }
}

/// Upload one positioner's paths: open, chunked data, end
async fn upload_one(
    scheduler: &Arc<CanScheduler>,
    id: PositionerId,
    data: &TrajectoryData,
    chunk_size: usize,
    motor_steps: u32,
) -> std::result::Result<(), TrajectoryFailureReason> {
    let counts =
        wire::encode_sample_counts(data.alpha.len() as u32, data.beta.len() as u32);
    let open = CommandRequest::unicast(CommandId::SendNewTrajectory, id).with_payload(counts);
    scheduler
        .execute(open)
        .await
        .map_err(|e| upload_reason(&e, TrajectoryFailureReason::NotAcceptedNew))?;

    // Alpha first, then beta; chunks of one axis are never interleaved
    // with another chunk for the same positioner.
    for axis in [&data.alpha, &data.beta] {
        for chunk in axis.chunks(chunk_size) {
            let payloads = chunk
                .iter()
                .map(|point| {
                    wire::encode_trajectory_sample(
                        degrees_to_steps(point.angle, motor_steps),
                        seconds_to_ticks(point.time),
                    )
                })
                .collect();
            let request = CommandRequest::unicast(CommandId::SendTrajectoryData, id)
                .with_payloads(payloads);
            scheduler
                .execute(request)
                .await
                .map_err(|e| upload_reason(&e, TrajectoryFailureReason::NotAcceptedData))?;
        }
    }

    let end = CommandRequest::unicast(CommandId::TrajectoryDataEnd, id);
    scheduler
        .execute(end)
        .await
        .map_err(|e| upload_reason(&e, TrajectoryFailureReason::NotAcceptedEnd))?;
    Ok(())
}

fn upload_reason(error: &FpsError, rejected: TrajectoryFailureReason) -> TrajectoryFailureReason {
    match error {
        FpsError::Command { .. } => rejected,
        FpsError::Timeout { .. } => TrajectoryFailureReason::Timeout,
        FpsError::Transport { .. } | FpsError::Io(_) => TrajectoryFailureReason::TransmitError,
        FpsError::Cancelled | FpsError::Locked => TrajectoryFailureReason::Aborted,
        _ => TrajectoryFailureReason::InterfaceError,
    }
}

/// On-disk diagnostic record for one trajectory
#[derive(Debug, Serialize)]
struct TrajectoryDump {
    start_time: DateTime<Utc>,
    end_time: DateTime<Utc>,
    duration: f64,
    positioners: BTreeMap<PositionerId, FinalPosition>,
    failed_positioners: BTreeMap<PositionerId, TrajectoryFailureReason>,
}

#[derive(Debug, Default, Serialize)]
struct FinalPosition {
    alpha: Option<f64>,
    beta: Option<f64>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_upload_reason_mapping() {
        let rejected = FpsError::Command {
            command: "SEND_NEW_TRAJECTORY",
            positioner: PositionerId::new(4),
            code: fps_comms_shared::identifier::ResponseCode::InvalidTrajectory,
        };
        assert_eq!(
            upload_reason(&rejected, TrajectoryFailureReason::NotAcceptedNew),
            TrajectoryFailureReason::NotAcceptedNew
        );

        let timeout = FpsError::Timeout {
            command: "SEND_TRAJECTORY_DATA",
            positioner: PositionerId::new(4),
            timeout: Duration::from_secs(5),
        };
        assert_eq!(
            upload_reason(&timeout, TrajectoryFailureReason::NotAcceptedData),
            TrajectoryFailureReason::Timeout
        );

        let transport = FpsError::Transport {
            interface: 0,
            message: "gone".into(),
        };
        assert_eq!(
            upload_reason(&transport, TrajectoryFailureReason::NotAcceptedEnd),
            TrajectoryFailureReason::TransmitError
        );
    }
}
