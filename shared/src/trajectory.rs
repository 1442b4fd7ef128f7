//! Trajectory data model, validation and chunking
//!
//! A trajectory maps positioner ids to two time-sampled paths, one per axis.
//! The on-disk format is a JSON object keyed by positioner id, each value
//! holding `alpha` and `beta` arrays of `[angle_degrees, time_seconds]`
//! pairs; the same shape can be built in memory. Validation runs before any
//! frame is emitted: a rejected trajectory never touches the wire.

use std::collections::BTreeMap;
use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::error::{FpsError, Result};
use crate::types::PositionerId;

/// Number of samples the firmware accepts per upload chunk.
pub const DEFAULT_SAMPLES_PER_CHUNK: usize = 3;

/// One `(angle, time)` waypoint
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(from = "(f64, f64)", into = "(f64, f64)")]
pub struct TrajectoryPoint {
    /// Axis angle in degrees
    pub angle: f64,
    /// Time from motion start in seconds
    pub time: f64,
}

impl From<(f64, f64)> for TrajectoryPoint {
    fn from((angle, time): (f64, f64)) -> Self {
        Self { angle, time }
    }
}

impl From<TrajectoryPoint> for (f64, f64) {
    fn from(point: TrajectoryPoint) -> Self {
        (point.angle, point.time)
    }
}

/// The sampled path of a single axis
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(transparent)]
pub struct AxisPath(pub Vec<TrajectoryPoint>);

impl AxisPath {
    /// Build a path from `(angle, time)` pairs
    pub fn from_pairs(pairs: impl IntoIterator<Item = (f64, f64)>) -> Self {
        Self(pairs.into_iter().map(TrajectoryPoint::from).collect())
    }

    /// Number of samples
    pub fn len(&self) -> usize {
        self.0.len()
    }

    /// Whether the path has no samples
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Final waypoint, if any
    pub fn end(&self) -> Option<&TrajectoryPoint> {
        self.0.last()
    }

    /// Time of the last sample, or zero for an empty path
    pub fn duration(&self) -> f64 {
        self.end().map_or(0.0, |p| p.time)
    }

    /// Upload chunks of at most `samples_per_chunk` samples, in order
    pub fn chunks(&self, samples_per_chunk: usize) -> impl Iterator<Item = &[TrajectoryPoint]> {
        self.0.chunks(samples_per_chunk.max(1))
    }
}

/// Both axis paths of one positioner
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TrajectoryData {
    /// Alpha axis samples
    pub alpha: AxisPath,
    /// Beta axis samples
    pub beta: AxisPath,
}

impl TrajectoryData {
    /// Build from per-axis `(angle, time)` pairs
    pub fn from_pairs(
        alpha: impl IntoIterator<Item = (f64, f64)>,
        beta: impl IntoIterator<Item = (f64, f64)>,
    ) -> Self {
        Self {
            alpha: AxisPath::from_pairs(alpha),
            beta: AxisPath::from_pairs(beta),
        }
    }

    /// End position as `(alpha, beta)` degrees, if both axes have samples
    pub fn end_position(&self) -> Option<(f64, f64)> {
        Some((self.alpha.end()?.angle, self.beta.end()?.angle))
    }
}

/// Per-axis validation bounds
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TrajectoryLimits {
    /// Accepted alpha range in degrees, inclusive
    pub alpha_range: (f64, f64),
    /// Accepted beta range in degrees, inclusive
    pub beta_range: (f64, f64),
    /// When safe mode is on, beta must stay at or above this angle
    pub min_beta: Option<f64>,
}

impl Default for TrajectoryLimits {
    fn default() -> Self {
        Self {
            alpha_range: (-10.0, 370.0),
            beta_range: (-10.0, 370.0),
            min_beta: None,
        }
    }
}

/// A multi-positioner trajectory
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Trajectory(pub BTreeMap<PositionerId, TrajectoryData>);

impl Trajectory {
    /// Build a trajectory from an in-memory map
    pub fn new(data: BTreeMap<PositionerId, TrajectoryData>) -> Self {
        Self(data)
    }

    /// Parse a trajectory from its JSON text form
    pub fn from_json(text: &str) -> Result<Self> {
        serde_json::from_str(text).map_err(|e| FpsError::MalformedFrame {
            message: format!("trajectory JSON: {e}"),
        })
    }

    /// Load a trajectory from a JSON file
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let text = std::fs::read_to_string(path)?;
        Self::from_json(&text)
    }

    /// Positioner ids included in this trajectory
    pub fn positioner_ids(&self) -> Vec<PositionerId> {
        self.0.keys().copied().collect()
    }

    /// Number of positioners addressed
    pub fn len(&self) -> usize {
        self.0.len()
    }

    /// Whether the trajectory addresses no positioners
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Longest sample time across every positioner and axis, in seconds
    pub fn duration(&self) -> f64 {
        self.0
            .values()
            .flat_map(|d| [d.alpha.duration(), d.beta.duration()])
            .fold(0.0, f64::max)
    }

    /// Final `(alpha, beta)` per positioner
    pub fn end_positions(&self) -> BTreeMap<PositionerId, (f64, f64)> {
        self.0
            .iter()
            .filter_map(|(id, data)| data.end_position().map(|end| (*id, end)))
            .collect()
    }

    /// Validate every path against `limits`
    ///
    /// Checks, per positioner and axis: at least one sample, non-negative
    /// and non-decreasing times, and angles within the configured bounds.
    /// With safe mode on, beta may not drop below `min_beta` anywhere.
    pub fn validate(&self, limits: &TrajectoryLimits) -> Result<()> {
        if self.is_empty() {
            return Err(FpsError::InvalidTrajectory {
                positioner: PositionerId::BROADCAST,
                message: "trajectory addresses no positioners".into(),
            });
        }

        for (&id, data) in &self.0 {
            validate_axis(id, "alpha", &data.alpha, limits.alpha_range)?;
            validate_axis(id, "beta", &data.beta, limits.beta_range)?;

            if let Some(min_beta) = limits.min_beta {
                for point in &data.beta.0 {
                    if point.angle < min_beta {
                        return Err(FpsError::SafeModeViolation {
                            message: format!(
                                "positioner {id}: beta sample {:.3} below safe minimum {min_beta:.3}",
                                point.angle
                            ),
                        });
                    }
                }
            }
        }

        Ok(())
    }
}

fn validate_axis(
    id: PositionerId,
    axis: &str,
    path: &AxisPath,
    range: (f64, f64),
) -> Result<()> {
    if path.is_empty() {
        return Err(FpsError::InvalidTrajectory {
            positioner: id,
            message: format!("{axis} axis has no samples"),
        });
    }

    let mut last_time = 0.0;
    for (index, point) in path.0.iter().enumerate() {
        if point.time < 0.0 {
            return Err(FpsError::InvalidTrajectory {
                positioner: id,
                message: format!("{axis} sample {index} has negative time {}", point.time),
            });
        }
        if point.time < last_time {
            return Err(FpsError::InvalidTrajectory {
                positioner: id,
                message: format!(
                    "{axis} sample {index} time {} decreases from {last_time}",
                    point.time
                ),
            });
        }
        last_time = point.time;

        if point.angle < range.0 || point.angle > range.1 {
            return Err(FpsError::SafeModeViolation {
                message: format!(
                    "positioner {id}: {axis} sample {index} angle {:.3} outside [{:.1}, {:.1}]",
                    point.angle, range.0, range.1
                ),
            });
        }
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn two_point(id: u16, alpha_end: f64, beta_end: f64, duration: f64) -> Trajectory {
        let mut map = BTreeMap::new();
        map.insert(
            PositionerId::new(id),
            TrajectoryData::from_pairs(
                [(0.0, 0.0), (alpha_end, duration)],
                [(180.0, 0.0), (beta_end, duration)],
            ),
        );
        Trajectory::new(map)
    }

    #[test]
    fn test_json_round_trip() {
        let text = r#"{"4": {"alpha": [[0.0, 0.0], [90.0, 12.5]], "beta": [[180.0, 0.0], [45.0, 12.5]]}}"#;
        let trajectory = Trajectory::from_json(text).unwrap();

        assert_eq!(trajectory.positioner_ids(), vec![PositionerId::new(4)]);
        assert_eq!(trajectory.duration(), 12.5);
        let end = trajectory.end_positions()[&PositionerId::new(4)];
        assert_eq!(end, (90.0, 45.0));

        let back = serde_json::to_string(&trajectory).unwrap();
        assert_eq!(Trajectory::from_json(&back).unwrap(), trajectory);
    }

    #[test]
    fn test_validation_accepts_negative_start() {
        let mut map = BTreeMap::new();
        map.insert(
            PositionerId::new(4),
            TrajectoryData::from_pairs([(-5.0, 0.0), (90.0, 10.0)], [(0.0, 0.0), (45.0, 10.0)]),
        );
        Trajectory::new(map)
            .validate(&TrajectoryLimits::default())
            .unwrap();
    }

    #[test]
    fn test_validation_rejects_empty_axis() {
        let mut map = BTreeMap::new();
        map.insert(
            PositionerId::new(4),
            TrajectoryData::from_pairs([], [(0.0, 0.0)]),
        );
        let err = Trajectory::new(map)
            .validate(&TrajectoryLimits::default())
            .unwrap_err();
        assert!(matches!(err, FpsError::InvalidTrajectory { .. }));
    }

    #[test]
    fn test_validation_rejects_decreasing_time() {
        let mut map = BTreeMap::new();
        map.insert(
            PositionerId::new(4),
            TrajectoryData::from_pairs([(0.0, 5.0), (10.0, 1.0)], [(0.0, 0.0)]),
        );
        assert!(Trajectory::new(map)
            .validate(&TrajectoryLimits::default())
            .is_err());
    }

    #[test]
    fn test_safe_mode_min_beta() {
        let trajectory = two_point(4, 90.0, 45.0, 10.0);
        let limits = TrajectoryLimits {
            min_beta: Some(160.0),
            ..TrajectoryLimits::default()
        };
        let err = trajectory.validate(&limits).unwrap_err();
        assert!(matches!(err, FpsError::SafeModeViolation { .. }));

        // Without safe mode the same trajectory passes.
        trajectory.validate(&TrajectoryLimits::default()).unwrap();
    }

    #[test]
    fn test_chunking_preserves_order() {
        let path = AxisPath::from_pairs((0..7).map(|i| (f64::from(i), f64::from(i))));
        let chunks: Vec<_> = path.chunks(DEFAULT_SAMPLES_PER_CHUNK).collect();
        assert_eq!(chunks.len(), 3);
        assert_eq!(chunks[0].len(), 3);
        assert_eq!(chunks[2].len(), 1);
        assert_eq!(chunks[2][0].angle, 6.0);
    }
}
