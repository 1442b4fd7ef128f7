//! The in-process control plane: typed events and requests
//!
//! The coordinator publishes [`FpsEvent`]s on a broadcast channel and
//! answers [`FpsRequest`]s; an external operator surface (TCP line
//! protocol, JSON schema) would sit on top of these types, but is not part
//! of this crate.

use std::collections::BTreeSet;

use fps_comms_shared::trajectory::Trajectory;
use fps_comms_shared::types::PositionerId;

use crate::positioner::Positioner;

/// Which poller raised an alert
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PollerKind {
    /// The status poller
    Status,
    /// The position poller
    Position,
}

/// Events published by the coordinator
#[derive(Debug, Clone)]
pub enum FpsEvent {
    /// A positioner's status word changed
    StatusChanged {
        /// Positioner whose status changed
        id: PositionerId,
        /// New raw status word
        raw: u32,
    },
    /// A positioner's measured position changed
    PositionChanged {
        /// Positioner that moved
        id: PositionerId,
        /// Alpha angle, degrees
        alpha: f64,
        /// Beta angle, degrees
        beta: f64,
    },
    /// A trajectory started executing
    TrajectoryStarted {
        /// Positioners involved
        positioners: Vec<PositionerId>,
        /// Expected duration in seconds
        duration: f64,
    },
    /// A trajectory reached a terminal state
    TrajectoryFinished {
        /// Whether every positioner completed
        success: bool,
    },
    /// The fleet locked after a collision
    Locked {
        /// Positioners whose collision bits triggered the lock
        by: BTreeSet<PositionerId>,
    },
    /// An operator cleared the lock
    Unlocked,
    /// A positioner was discovered or manually added
    PositionerAdded {
        /// The new positioner
        id: PositionerId,
    },
    /// Discovery finished
    DiscoveryComplete {
        /// Number of positioners that answered
        count: usize,
    },
    /// An interface dropped and is reconnecting
    TransportReset {
        /// Affected interface
        interface: usize,
    },
    /// A poller failed twice in a row; polling continues
    PollerAlert {
        /// Which poller
        kind: PollerKind,
    },
}

/// Requests the coordinator accepts
#[derive(Debug, Clone)]
pub enum FpsRequest {
    /// Move one positioner to an absolute position
    Goto {
        /// Positioner to move
        id: PositionerId,
        /// Target alpha, degrees
        alpha: f64,
        /// Target beta, degrees
        beta: f64,
    },
    /// Execute a multi-positioner trajectory
    SendTrajectory(Trajectory),
    /// Abort all motion
    Abort,
    /// Lock the fleet
    Lock,
    /// Clear the fleet lock
    Unlock,
    /// Clear a positioner's disabled flag
    Enable(PositionerId),
    /// Mark a positioner disabled
    Disable(PositionerId),
    /// Re-run discovery and initialization
    Reload,
    /// Snapshot one positioner, or the whole fleet
    GetStatus(Option<PositionerId>),
}

/// Replies to [`FpsRequest`]s
#[derive(Debug, Clone)]
pub enum FpsResponse {
    /// The request was carried out
    Ack,
    /// Requested snapshots
    Positioners(Vec<Positioner>),
}
