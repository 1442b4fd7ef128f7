//! # Focal Plane CAN Controller
//!
//! The command and trajectory engine for a focal plane system: a fleet of
//! up to ~500 two-axis fiber positioners addressed over a multi-bus CAN
//! fabric. The crate provides:
//!
//! - bus interfaces (multibus TCP gateway, SLCAN, SocketCAN, and an
//!   in-process virtual bus), all identical from the scheduler's view;
//! - the CAN scheduler: per-`(command_id, positioner_id)` exclusion,
//!   broadcast serialization, uid-matched reply routing, backpressured
//!   fan-out, and transport quarantine;
//! - awaitable command objects with timeout and cancellation semantics;
//! - the [`Fps`](fps::Fps) coordinator: discovery, pollers, collision
//!   locking, and the operation surface;
//! - the trajectory engine: chunked upload, start, monitoring, abort
//!   semantics, and diagnostic dumps;
//! - layered configuration and the single-instance lockfile.

#![forbid(unsafe_code)]
#![warn(missing_docs)]
#![warn(rust_2018_idioms)]

pub mod bus;
pub mod command;
pub mod config;
pub mod events;
pub mod fps;
pub mod lockfile;
pub mod positioner;
pub mod scheduler;
mod trajectory;

// Re-export commonly used types
pub use command::{CommandHandle, CommandOptions, CommandRequest, CommandResult, CommandState, Target};
pub use config::{FpsConfig, InterfaceType};
pub use events::{FpsEvent, FpsRequest, FpsResponse};
pub use fps::{Fps, FpsState};
pub use lockfile::InstanceLock;
pub use positioner::{Positioner, PositionerFlags};
pub use scheduler::CanScheduler;

// The protocol layer, re-exported for downstream callers
pub use fps_comms_shared as shared;
