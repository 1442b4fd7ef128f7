//! Layered controller configuration
//!
//! Precedence, lowest to highest: built-in defaults, the system file
//! (`/etc/fps/fps.toml`), the user file (`~/.config/fps/fps.toml`), an
//! explicit file passed by the caller, and finally `FPS_`-prefixed
//! environment variables (`FPS_POLLERS__STATUS_INTERVAL=2.5`). A merge that
//! produces an unusable state is rejected with `InvalidConfiguration`.

use std::path::{Path, PathBuf};
use std::time::Duration;

use config::{Config, Environment, File};
use fps_comms_shared::error::{FpsError, Result};
use fps_comms_shared::identifier;
use fps_comms_shared::trajectory::TrajectoryLimits;
use fps_comms_shared::types::{DEFAULT_MOTOR_STEPS, PositionerId, Uid};
use serde::{Deserialize, Serialize};

/// Which transport the CAN profile uses
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum InterfaceType {
    /// In-process virtual bus over the simulated fleet
    Virtual,
    /// Multibus TCP gateway
    Tcp,
    /// SLCAN serial adapter
    Slcan,
    /// Kernel SocketCAN device
    Socketcan,
}

/// One physical channel of the CAN profile
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ChannelConfig {
    /// Gateway host (TCP profiles)
    pub host: Option<String>,
    /// Gateway port (TCP profiles)
    pub port: Option<u16>,
    /// Device path or kernel name (serial and SocketCAN profiles)
    pub device: Option<String>,
    /// Number of buses carried by this channel
    pub buses: usize,
}

/// The CAN profile: transport type and its channels
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CanProfile {
    /// Transport variant
    pub interface_type: InterfaceType,
    /// One entry per interface
    pub channels: Vec<ChannelConfig>,
    /// Bus bitrate in bit/s; forwarded to adapters that set it themselves
    pub bitrate: u32,
    /// Gateway health ping period, seconds
    pub ping_interval: f64,
}

impl Default for CanProfile {
    fn default() -> Self {
        Self {
            interface_type: InterfaceType::Virtual,
            channels: vec![ChannelConfig {
                buses: 1,
                ..ChannelConfig::default()
            }],
            bitrate: 1_000_000,
            ping_interval: 5.0,
        }
    }
}

/// Poller cadence
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PollerConfig {
    /// Status poll period, seconds
    pub status_interval: f64,
    /// Position poll period, seconds
    pub position_interval: f64,
    /// Per-poll reply window, seconds
    pub timeout: f64,
}

impl Default for PollerConfig {
    fn default() -> Self {
        Self {
            status_interval: 1.0,
            position_interval: 5.0,
            timeout: 1.0,
        }
    }
}

/// Trajectory engine tunables
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TrajectoryConfig {
    /// Samples per upload chunk
    pub chunk_size: usize,
    /// How close to the final sample counts as arrived, degrees
    pub reach_tolerance: f64,
    /// Delay before the did-not-start check, seconds
    pub start_check_delay: f64,
    /// Monitor poll period, seconds
    pub monitor_interval: f64,
    /// Quiet period after an abort or stop, seconds
    pub abort_cooldown: f64,
    /// Extra wait beyond the nominal duration before declaring
    /// `DID_NOT_REACH`, as a fraction of the duration
    pub timeout_margin: f64,
}

impl Default for TrajectoryConfig {
    fn default() -> Self {
        Self {
            chunk_size: fps_comms_shared::trajectory::DEFAULT_SAMPLES_PER_CHUNK,
            reach_tolerance: 0.1,
            start_check_delay: 1.0,
            monitor_interval: 0.5,
            abort_cooldown: 0.5,
            timeout_margin: 0.5,
        }
    }
}

/// Safe mode: extra bounds applied to every move
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SafeModeConfig {
    /// Whether safe mode is enforced
    pub enabled: bool,
    /// Lowest beta angle a trajectory may visit, degrees
    pub min_beta: f64,
}

impl Default for SafeModeConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            min_beta: 160.0,
        }
    }
}

/// Arbitration identifier field widths
///
/// The codec is compiled with fixed widths; these knobs exist so a profile
/// written for different firmware fails loudly instead of framing garbage.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct IdentifierConfig {
    /// Positioner id field width, bits
    pub positioner_id_bits: u32,
    /// Command id field width, bits
    pub command_id_bits: u32,
    /// Uid field width, bits
    pub uid_bits: u32,
    /// Response code field width, bits
    pub response_code_bits: u32,
}

impl Default for IdentifierConfig {
    fn default() -> Self {
        Self {
            positioner_id_bits: identifier::POSITIONER_ID_BITS,
            command_id_bits: identifier::COMMAND_ID_BITS,
            uid_bits: identifier::UID_BITS,
            response_code_bits: identifier::RESPONSE_CODE_BITS,
        }
    }
}

/// Complete controller configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct FpsConfig {
    /// CAN transport profile
    pub profile: CanProfile,
    /// Poller cadence
    pub pollers: PollerConfig,
    /// Trajectory engine tunables
    pub trajectory: TrajectoryConfig,
    /// Safe mode bounds
    pub safe_mode: SafeModeConfig,
    /// Identifier layout cross-check
    pub identifier: IdentifierConfig,
    /// Motor steps per revolution
    pub motor_steps: u32,
    /// Output reduction between motor and axis
    pub gear_ratio: f64,
    /// Default cruise speed set at initialization, RPM
    pub default_speed_rpm: u32,
    /// Positioners that stay disabled across re-initialization
    pub disabled_positioners: Vec<u16>,
    /// Single-instance lockfile; `None` disables the check
    pub lockfile_path: Option<PathBuf>,
    /// Where trajectory diagnostic dumps land; `None` disables them
    pub dump_dir: Option<PathBuf>,
}

impl Default for FpsConfig {
    fn default() -> Self {
        Self {
            profile: CanProfile::default(),
            pollers: PollerConfig::default(),
            trajectory: TrajectoryConfig::default(),
            safe_mode: SafeModeConfig::default(),
            identifier: IdentifierConfig::default(),
            motor_steps: DEFAULT_MOTOR_STEPS,
            gear_ratio: 1024.0,
            default_speed_rpm: 1_000,
            disabled_positioners: Vec::new(),
            lockfile_path: None,
            dump_dir: None,
        }
    }
}

impl FpsConfig {
    /// Load with the default layering and no explicit file
    pub fn load() -> Result<Self> {
        Self::load_from(None)
    }

    /// Load with the default layering plus an optional explicit file
    pub fn load_from(explicit: Option<&Path>) -> Result<Self> {
        let mut builder = Config::builder()
            .add_source(Config::try_from(&Self::default()).map_err(invalid)?)
            .add_source(File::from(Path::new("/etc/fps/fps.toml")).required(false));

        if let Some(home) = std::env::var_os("HOME") {
            let user_file = PathBuf::from(home).join(".config/fps/fps.toml");
            builder = builder.add_source(File::from(user_file).required(false));
        }
        if let Some(path) = explicit {
            builder = builder.add_source(File::from(path));
        }
        builder = builder.add_source(Environment::with_prefix("FPS").separator("__"));

        let merged: Self = builder
            .build()
            .map_err(invalid)?
            .try_deserialize()
            .map_err(invalid)?;
        merged.validate()?;
        Ok(merged)
    }

    /// Reject unusable merges
    pub fn validate(&self) -> Result<()> {
        if self.identifier != IdentifierConfig::default() {
            return Err(FpsError::InvalidConfiguration {
                message: format!(
                    "identifier widths {:?} do not match this controller's wire layout",
                    self.identifier
                ),
            });
        }
        if self.trajectory.chunk_size == 0
            || self.trajectory.chunk_size > usize::from(Uid::MAX)
        {
            return Err(FpsError::InvalidConfiguration {
                message: format!(
                    "trajectory chunk size {} outside 1..={}",
                    self.trajectory.chunk_size,
                    Uid::MAX
                ),
            });
        }
        if self.pollers.status_interval <= 0.0 || self.pollers.position_interval <= 0.0 {
            return Err(FpsError::InvalidConfiguration {
                message: "poller intervals must be positive".into(),
            });
        }
        if self.trajectory.reach_tolerance <= 0.0 {
            return Err(FpsError::InvalidConfiguration {
                message: "reach tolerance must be positive".into(),
            });
        }
        if self.trajectory.monitor_interval <= 0.0 || self.trajectory.start_check_delay <= 0.0 {
            return Err(FpsError::InvalidConfiguration {
                message: "trajectory monitor timings must be positive".into(),
            });
        }
        if self.motor_steps == 0 || self.gear_ratio <= 0.0 {
            return Err(FpsError::InvalidConfiguration {
                message: "motor geometry must be positive".into(),
            });
        }
        if self.profile.interface_type != InterfaceType::Virtual
            && self.profile.channels.is_empty()
        {
            return Err(FpsError::InvalidConfiguration {
                message: "hardware CAN profile has no channels".into(),
            });
        }
        Ok(())
    }

    /// Trajectory validation bounds derived from this configuration
    pub fn limits(&self) -> TrajectoryLimits {
        TrajectoryLimits {
            min_beta: self.safe_mode.enabled.then_some(self.safe_mode.min_beta),
            ..TrajectoryLimits::default()
        }
    }

    /// The configured sticky-disabled set
    pub fn disabled_set(&self) -> Vec<PositionerId> {
        self.disabled_positioners
            .iter()
            .map(|&id| PositionerId::new(id))
            .collect()
    }

    /// Status poll period
    pub fn status_interval(&self) -> Duration {
        Duration::from_secs_f64(self.pollers.status_interval)
    }

    /// Position poll period
    pub fn position_interval(&self) -> Duration {
        Duration::from_secs_f64(self.pollers.position_interval)
    }

    /// Per-poll reply window
    pub fn poller_timeout(&self) -> Duration {
        Duration::from_secs_f64(self.pollers.timeout)
    }

    /// Axis speed in degrees per second for a motor speed in RPM
    pub fn rpm_to_deg_per_sec(&self, rpm: u32) -> f64 {
        f64::from(rpm) * 360.0 / 60.0 / self.gear_ratio
    }
}

fn invalid(error: config::ConfigError) -> FpsError {
    FpsError::InvalidConfiguration {
        message: error.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_defaults_validate() {
        FpsConfig::default().validate().unwrap();
    }

    #[test]
    fn test_explicit_file_overrides_defaults() {
        let mut file = tempfile::NamedTempFile::with_suffix(".toml").unwrap();
        writeln!(
            file,
            "default_speed_rpm = 500\n[pollers]\nstatus_interval = 2.5"
        )
        .unwrap();

        let config = FpsConfig::load_from(Some(file.path())).unwrap();
        assert_eq!(config.default_speed_rpm, 500);
        assert_eq!(config.pollers.status_interval, 2.5);
        // Untouched knobs keep their defaults.
        assert_eq!(config.trajectory.reach_tolerance, 0.1);
    }

    #[test]
    fn test_bad_merge_is_rejected() {
        let mut file = tempfile::NamedTempFile::with_suffix(".toml").unwrap();
        writeln!(file, "[trajectory]\nchunk_size = 0").unwrap();

        let error = FpsConfig::load_from(Some(file.path())).unwrap_err();
        assert!(matches!(error, FpsError::InvalidConfiguration { .. }));
    }

    #[test]
    fn test_identifier_width_mismatch_is_rejected() {
        let mut file = tempfile::NamedTempFile::with_suffix(".toml").unwrap();
        writeln!(file, "[identifier]\nuid_bits = 8").unwrap();

        let error = FpsConfig::load_from(Some(file.path())).unwrap_err();
        assert!(matches!(error, FpsError::InvalidConfiguration { .. }));
    }

    #[test]
    fn test_safe_mode_limits() {
        let mut config = FpsConfig::default();
        assert!(config.limits().min_beta.is_none());

        config.safe_mode.enabled = true;
        assert_eq!(config.limits().min_beta, Some(160.0));
    }

    #[test]
    fn test_speed_conversion() {
        let config = FpsConfig::default();
        // 1000 RPM through a 1024:1 reduction is a little under 6 deg/s.
        let speed = config.rpm_to_deg_per_sec(1_000);
        assert!(speed > 5.0 && speed < 6.0);
    }
}
