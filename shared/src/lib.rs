//! # Focal Plane CAN Shared Library
//!
//! Shared wire protocol and data model for the focal plane system (FPS)
//! controller: the arbitration identifier codec, the firmware command
//! registry, status word decoders, payload codecs, and the trajectory data
//! model. This crate is runtime-agnostic; the tokio engine lives in
//! `fps-comms-controller` and the virtual fleet in `fps-comms-simulation`.

#![forbid(unsafe_code)]
#![warn(missing_docs)]
#![warn(rust_2018_idioms)]
#![warn(trivial_casts, trivial_numeric_casts)]
#![warn(unused_qualifications)]

pub mod commands;
pub mod error;
pub mod identifier;
pub mod status;
pub mod trajectory;
pub mod types;
pub mod wire;

// Re-export commonly used types
pub use commands::{CommandId, CommandSpec, ReplyExpectation};
pub use error::{FpsError, Result, TrajectoryFailure, TrajectoryFailureReason};
pub use identifier::{Identifier, ResponseCode};
pub use status::DecodedStatus;
pub use trajectory::{Trajectory, TrajectoryData, TrajectoryLimits, TrajectoryPoint};
pub use types::{BusRef, FirmwareVersion, PositionerId, Uid};
pub use wire::{CanMessage, Reply};
