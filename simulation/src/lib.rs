//! # Focal Plane Fleet Simulation
//!
//! A deterministic, in-process model of a positioner fleet used by the
//! controller's virtual bus interface and by integration tests. The fleet
//! answers the firmware command set (discovery, status and position
//! queries, trajectory upload and playback, abort/stop semantics) and
//! supports fault injection: latched collisions, muted positioners, dropped
//! replies, and moves that never start.
//!
//! Time never comes from the wall clock; callers pass `now` in, so the
//! model stays reproducible under a paused test clock.

#![forbid(unsafe_code)]
#![warn(missing_docs)]
#![warn(rust_2018_idioms)]

pub mod fleet;
pub mod positioner;

pub use fleet::SimFleet;
pub use positioner::SimPositioner;
