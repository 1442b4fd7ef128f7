//! End-to-end tests over the virtual interface and the simulated fleet
//!
//! The fleet runs with compressed trajectory time so real motions finish in
//! tens of milliseconds; everything else (discovery, exclusion, locking,
//! transport failures) exercises the same paths a hardware profile would.

use std::collections::BTreeMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use fps_comms_controller::bus::virtual_bus::VirtualBusControl;
use fps_comms_controller::shared::commands::CommandId;
use fps_comms_controller::shared::error::{FpsError, TrajectoryFailureReason};
use fps_comms_controller::shared::trajectory::{Trajectory, TrajectoryData};
use fps_comms_controller::shared::types::{BusRef, PositionerId};
use fps_comms_controller::{
    CommandRequest, CommandState, Fps, FpsConfig, FpsEvent, FpsRequest, FpsResponse,
};
use fps_comms_simulation::SimFleet;
use tokio::time::sleep;

const P4: PositionerId = PositionerId::new(4);
const P8: PositionerId = PositionerId::new(8);
const P13: PositionerId = PositionerId::new(13);

fn test_config() -> FpsConfig {
    let mut config = FpsConfig::default();
    config.pollers.status_interval = 0.2;
    config.pollers.position_interval = 0.5;
    config.pollers.timeout = 0.3;
    config.trajectory.monitor_interval = 0.05;
    config.trajectory.abort_cooldown = 0.05;
    config
}

fn setup(ids: &[u16]) -> (Fps, Arc<Mutex<SimFleet>>, VirtualBusControl) {
    let mut fleet = SimFleet::with_time_scale(0.01);
    for &id in ids {
        fleet.add_default(id);
    }
    let fleet = Arc::new(Mutex::new(fleet));
    let (fps, control) =
        Fps::with_virtual_fleet(test_config(), Arc::clone(&fleet)).expect("coordinator");
    (fps, fleet, control)
}

fn frames(fleet: &Arc<Mutex<SimFleet>>, command: CommandId) -> usize {
    fleet.lock().unwrap().frames_with_command(command)
}

fn clear_frames(fleet: &Arc<Mutex<SimFleet>>) {
    fleet.lock().unwrap().clear_frame_log();
}

/// A trajectory moving every listed positioner to `(alpha, beta)` over
/// `duration` seconds of nominal motion.
fn trajectory_to(ids: &[PositionerId], alpha: f64, beta: f64, duration: f64) -> Trajectory {
    let mut data = BTreeMap::new();
    for &id in ids {
        data.insert(
            id,
            TrajectoryData::from_pairs(
                [(0.0, 0.0), (alpha, duration)],
                [(180.0, 0.0), (beta, duration)],
            ),
        );
    }
    Trajectory::new(data)
}

#[tokio::test]
async fn test_s1_discovery() {
    let (fps, _fleet, _control) = setup(&[4, 8, 13]);

    let count = fps.initialize().await.unwrap();
    assert_eq!(count, 3);

    let table = fps.positioners();
    let ids: Vec<u16> = table.keys().map(|id| id.value()).collect();
    assert_eq!(ids, vec![4, 8, 13]);

    for positioner in table.values() {
        let firmware = positioner.firmware.unwrap();
        assert_eq!((firmware.major, firmware.minor, firmware.patch), (4, 1, 0));
        assert!(positioner.status().unwrap().is_system_initialized());
        assert!(positioner.flags.initialized);
    }

    fps.shutdown().await;
}

#[tokio::test]
async fn test_s2_unicast_goto() {
    let (fps, fleet, _control) = setup(&[4]);
    fps.initialize().await.unwrap();

    let before = fps.positioner(P4).unwrap();
    assert_eq!(before.alpha, Some(0.0));
    assert_eq!(before.beta, Some(180.0));

    clear_frames(&fleet);
    fps.goto(P4, 90.0, 45.0, None).await.unwrap();

    assert_eq!(frames(&fleet, CommandId::SendNewTrajectory), 1);
    // Two endpoint samples per axis.
    assert_eq!(frames(&fleet, CommandId::SendTrajectoryData), 4);
    assert_eq!(frames(&fleet, CommandId::TrajectoryDataEnd), 1);
    assert_eq!(frames(&fleet, CommandId::StartTrajectory), 1);

    let after = fps.positioner(P4).unwrap();
    assert!((after.alpha.unwrap() - 90.0).abs() <= 0.1);
    assert!((after.beta.unwrap() - 45.0).abs() <= 0.1);
    assert_eq!(fps.state().trajectories_executed, 1);

    fps.shutdown().await;
}

#[tokio::test]
async fn test_s3_broadcast_status_with_partial_replies() {
    let (fps, fleet, _control) = setup(&[4, 8, 13]);
    fps.initialize().await.unwrap();

    let status_before = fps.positioner(P13).unwrap().status_raw;
    fleet
        .lock()
        .unwrap()
        .positioner_mut(P13)
        .unwrap()
        .set_muted(true);

    let result = fps
        .send_command(
            CommandRequest::broadcast(CommandId::GetStatus)
                .with_timeout(Duration::from_secs(1)),
        )
        .await
        .unwrap();

    assert_eq!(result.state, CommandState::Done);
    assert_eq!(result.replies.len(), 2);
    let replied: Vec<PositionerId> = result.replies.iter().map(|r| r.positioner_id).collect();
    assert!(replied.contains(&P4) && replied.contains(&P8));

    // The silent positioner's status is left exactly as it was.
    assert_eq!(fps.positioner(P13).unwrap().status_raw, status_before);

    fps.shutdown().await;
}

#[tokio::test]
async fn test_s4_collision_during_trajectory() {
    let (fps, fleet, _control) = setup(&[4, 8]);
    fps.initialize().await.unwrap();
    clear_frames(&fleet);
    let mut events = fps.subscribe();

    // 300 s nominal, 3 s at the test time scale: long enough that the
    // collision lands mid-motion.
    let trajectory = trajectory_to(&[P4, P8], 90.0, 100.0, 300.0);
    let runner = {
        let fps = fps.clone();
        tokio::spawn(async move { fps.send_trajectory(&trajectory).await })
    };

    sleep(Duration::from_millis(1500)).await;
    fleet.lock().unwrap().set_collided(P8);

    let error = runner.await.unwrap().unwrap_err();
    let FpsError::Trajectory(failure) = error else {
        panic!("expected a trajectory failure, got {error}");
    };
    assert_eq!(failure.failed[&P8], TrajectoryFailureReason::Collided);
    assert_eq!(failure.failed[&P4], TrajectoryFailureReason::Aborted);

    let state = fps.state();
    assert!(state.locked);
    assert_eq!(state.locked_by.iter().copied().collect::<Vec<_>>(), vec![P8]);
    assert!(frames(&fleet, CommandId::SendTrajectoryAbort) >= 1);

    let mut saw_locked = false;
    let mut saw_finished = false;
    while let Ok(event) = events.try_recv() {
        match event {
            FpsEvent::Locked { by } => {
                saw_locked = true;
                assert!(by.contains(&P8));
            }
            FpsEvent::TrajectoryFinished { success } => {
                saw_finished = true;
                assert!(!success);
            }
            _ => {}
        }
    }
    assert!(saw_locked && saw_finished);

    fps.shutdown().await;
}

#[tokio::test]
async fn test_control_plane_requests() {
    let (fps, _fleet, _control) = setup(&[4]);
    fps.initialize().await.unwrap();

    let response = fps.handle_request(FpsRequest::GetStatus(None)).await.unwrap();
    let FpsResponse::Positioners(list) = response else {
        panic!("expected snapshots");
    };
    assert_eq!(list.len(), 1);

    fps.handle_request(FpsRequest::Disable(P4)).await.unwrap();
    assert!(fps.positioner(P4).unwrap().flags.disabled);

    let error = fps
        .handle_request(FpsRequest::Goto {
            id: P4,
            alpha: 10.0,
            beta: 170.0,
        })
        .await
        .unwrap_err();
    assert!(matches!(error, FpsError::PositionerDisabled(_)));

    fps.handle_request(FpsRequest::Enable(P4)).await.unwrap();
    assert!(!fps.positioner(P4).unwrap().flags.disabled);

    fps.shutdown().await;
}

#[tokio::test]
async fn test_s5_interface_disconnect_and_recovery() {
    let (fps, fleet, control) = setup(&[4]);
    fps.initialize().await.unwrap();

    // A query that will still be in flight when the link drops.
    fleet
        .lock()
        .unwrap()
        .positioner_mut(P4)
        .unwrap()
        .set_muted(true);
    let handle = fps
        .scheduler()
        .submit(
            CommandRequest::unicast(CommandId::GetStatus, P4)
                .with_timeout(Duration::from_secs(5)),
        )
        .unwrap();

    sleep(Duration::from_millis(200)).await;
    control.disconnect();

    let error = handle.wait().await.unwrap_err();
    assert!(matches!(error, FpsError::Transport { .. }), "got {error}");

    // Recovery: reconnect, re-initialize, and command again.
    control.reconnect();
    fleet
        .lock()
        .unwrap()
        .positioner_mut(P4)
        .unwrap()
        .set_muted(false);
    sleep(Duration::from_millis(100)).await;

    assert_eq!(fps.initialize().await.unwrap(), 1);
    let result = fps
        .send_command(CommandRequest::unicast(CommandId::GetStatus, P4))
        .await
        .unwrap();
    assert_eq!(result.state, CommandState::Done);

    fps.shutdown().await;
}

#[tokio::test]
async fn test_s6_disabled_positioner_rejects_trajectory() {
    let (fps, fleet, _control) = setup(&[4, 13]);
    fps.initialize().await.unwrap();

    fps.disable(P13);
    clear_frames(&fleet);

    let trajectory = trajectory_to(&[P4, P13], 90.0, 100.0, 10.0);
    let error = fps.send_trajectory(&trajectory).await.unwrap_err();
    assert!(matches!(error, FpsError::PositionerDisabled(id) if id == P13));

    // Validation failed before anything touched the wire.
    assert_eq!(frames(&fleet, CommandId::SendNewTrajectory), 0);
    assert_eq!(frames(&fleet, CommandId::StartTrajectory), 0);

    fps.shutdown().await;
}

#[tokio::test]
async fn test_lock_gate_blocks_non_safe_commands() {
    let (fps, fleet, _control) = setup(&[4]);
    fps.initialize().await.unwrap();

    fps.lock();
    clear_frames(&fleet);

    // Non-safe submissions are refused synchronously, before any frame.
    let error = fps
        .scheduler()
        .submit(
            CommandRequest::unicast(CommandId::SetSpeed, P4)
                .with_payload(fps_comms_controller::shared::wire::encode_speed(500, 500)),
        )
        .unwrap_err();
    assert!(matches!(error, FpsError::Locked));

    let error = fps.goto(P4, 10.0, 170.0, None).await.unwrap_err();
    assert!(matches!(error, FpsError::Locked));

    assert_eq!(frames(&fleet, CommandId::SetSpeed), 0);
    assert_eq!(frames(&fleet, CommandId::SendNewTrajectory), 0);
    assert_eq!(frames(&fleet, CommandId::StartTrajectory), 0);

    // Safe commands still pass the gate.
    let result = fps
        .send_command(CommandRequest::unicast(CommandId::GetStatus, P4))
        .await
        .unwrap();
    assert_eq!(result.state, CommandState::Done);

    fps.unlock();
    assert!(!fps.is_locked());

    fps.shutdown().await;
}

#[tokio::test]
async fn test_invalid_trajectory_never_touches_the_wire() {
    let (fps, fleet, _control) = setup(&[4]);
    fps.initialize().await.unwrap();
    clear_frames(&fleet);

    // Decreasing sample times fail validation.
    let mut data = BTreeMap::new();
    data.insert(
        P4,
        TrajectoryData::from_pairs([(0.0, 5.0), (90.0, 1.0)], [(180.0, 0.0), (100.0, 5.0)]),
    );
    let error = fps
        .send_trajectory(&Trajectory::new(data))
        .await
        .unwrap_err();
    assert!(matches!(error, FpsError::InvalidTrajectory { .. }));

    assert_eq!(frames(&fleet, CommandId::SendNewTrajectory), 0);
    assert_eq!(frames(&fleet, CommandId::SendTrajectoryData), 0);
    assert_eq!(frames(&fleet, CommandId::StartTrajectory), 0);

    fps.shutdown().await;
}

#[tokio::test]
async fn test_abort_during_monitor() {
    let (fps, fleet, _control) = setup(&[4]);
    fps.initialize().await.unwrap();
    clear_frames(&fleet);

    let trajectory = trajectory_to(&[P4], 90.0, 100.0, 300.0);
    let runner = {
        let fps = fps.clone();
        tokio::spawn(async move { fps.send_trajectory(&trajectory).await })
    };

    sleep(Duration::from_millis(1500)).await;
    fps.abort().await.unwrap();

    let error = runner.await.unwrap().unwrap_err();
    let FpsError::Trajectory(failure) = error else {
        panic!("expected a trajectory failure, got {error}");
    };
    assert_eq!(failure.failed[&P4], TrajectoryFailureReason::Aborted);
    assert!(frames(&fleet, CommandId::SendTrajectoryAbort) >= 1);

    // No further motion frames until an explicit unlock.
    clear_frames(&fleet);
    let error = fps.goto(P4, 10.0, 170.0, None).await.unwrap_err();
    assert!(matches!(error, FpsError::Locked));
    assert_eq!(frames(&fleet, CommandId::SendNewTrajectory), 0);

    fps.unlock();
    fps.goto(P4, 1.0, 179.0, None).await.unwrap();

    fps.shutdown().await;
}

#[tokio::test]
async fn test_idempotent_shutdown() {
    let (fps, fleet, _control) = setup(&[4]);
    fps.initialize().await.unwrap();

    fps.shutdown().await;
    sleep(Duration::from_millis(300)).await;
    clear_frames(&fleet);

    fps.shutdown().await; // second shutdown: no errors, no frames

    sleep(Duration::from_millis(500)).await;
    assert!(fleet.lock().unwrap().frame_log().is_empty());
}

#[tokio::test]
async fn test_exclusion_one_command_per_key() {
    let (fps, fleet, _control) = setup(&[4]);
    // No initialize: no pollers in the way. Route the positioner manually.
    fps.scheduler().set_route(P4, BusRef::new(0, 0));
    fleet
        .lock()
        .unwrap()
        .positioner_mut(P4)
        .unwrap()
        .set_muted(true);

    let request = CommandRequest::unicast(CommandId::GetStatus, P4)
        .with_timeout(Duration::from_secs(1));

    let first = fps.scheduler().submit(request.clone()).unwrap();
    sleep(Duration::from_millis(100)).await;
    assert_eq!(fps.scheduler().uids_in_use(CommandId::GetStatus, P4), 1);

    let second = fps.scheduler().submit(request).unwrap();
    sleep(Duration::from_millis(200)).await;
    // The second command is queued behind the exclusion key, not running.
    assert_eq!(fps.scheduler().uids_in_use(CommandId::GetStatus, P4), 1);

    assert!(matches!(
        first.wait().await.unwrap_err(),
        FpsError::Timeout { .. }
    ));
    assert!(matches!(
        second.wait().await.unwrap_err(),
        FpsError::Timeout { .. }
    ));
    assert_eq!(fps.scheduler().uids_in_use(CommandId::GetStatus, P4), 0);

    fps.shutdown().await;
}

#[tokio::test]
async fn test_broadcast_blocks_unicast_of_same_opcode() {
    let (fps, fleet, _control) = setup(&[4]);
    fps.scheduler().set_route(P4, BusRef::new(0, 0));
    fleet
        .lock()
        .unwrap()
        .positioner_mut(P4)
        .unwrap()
        .set_muted(true);

    let broadcast = fps
        .scheduler()
        .submit(
            CommandRequest::broadcast(CommandId::GetStatus)
                .with_timeout(Duration::from_millis(800)),
        )
        .unwrap();
    sleep(Duration::from_millis(100)).await;

    let unicast = fps
        .scheduler()
        .submit(
            CommandRequest::unicast(CommandId::GetStatus, P4)
                .with_timeout(Duration::from_millis(500)),
        )
        .unwrap();
    sleep(Duration::from_millis(300)).await;

    // Only the broadcast frame is on the wire; the unicast waits its turn.
    assert_eq!(frames(&fleet, CommandId::GetStatus), 1);

    let _ = broadcast.outcome().await;
    let _ = unicast.outcome().await;
    assert_eq!(frames(&fleet, CommandId::GetStatus), 2);

    fps.shutdown().await;
}

#[tokio::test]
async fn test_trajectory_dump_is_written() {
    let dir = tempfile::tempdir().unwrap();

    let mut fleet = SimFleet::with_time_scale(0.01);
    fleet.add_default(4);
    let fleet = Arc::new(Mutex::new(fleet));

    let mut config = test_config();
    config.dump_dir = Some(dir.path().to_path_buf());
    let (fps, _control) = Fps::with_virtual_fleet(config, Arc::clone(&fleet)).unwrap();

    fps.initialize().await.unwrap();
    fps.goto(P4, 45.0, 120.0, None).await.unwrap();

    let dumps: Vec<_> = std::fs::read_dir(dir.path())
        .unwrap()
        .filter_map(|entry| entry.ok())
        .collect();
    assert_eq!(dumps.len(), 1);

    let body = std::fs::read_to_string(dumps[0].path()).unwrap();
    let record: serde_json::Value = serde_json::from_str(&body).unwrap();
    assert!(record["failed_positioners"].as_object().unwrap().is_empty());
    assert!(record["positioners"]["4"]["alpha"].as_f64().is_some());

    fps.shutdown().await;
}
