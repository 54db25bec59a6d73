//! Flat-field run configuration
//!
//! Loaded from JSON, every field except the exposure time functions has a
//! default:
//!
//! ```json
//! {
//!   "functions": { "V": "exp(-0.9*(h+3.9))", "R": "exp(-1.1*(h+4.2))" },
//!   "target_count": 30000,
//!   "pointing": { "type": "anti_sun", "altitude_deg": 80 },
//!   "log_path": "/var/lib/nightshade/flatfield.csv"
//! }
//! ```

use crate::ephemeris::SolarEphemeris;
use crate::error::{Result, SkyFlatsError};
use crate::pointing::{AntiSunPointing, SkyFlatsPointing, StaticPointing};
use crate::PercentRect;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

/// Configuration of the flat fielder
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FlatFielderConfig {
    /// Exposure time function f(h) in seconds per filter, `h` is the solar
    /// altitude in degrees
    #[serde(default)]
    pub functions: BTreeMap<String, String>,

    /// Median counts to aim for
    #[serde(default = "default_target_count")]
    pub target_count: f64,

    /// Shortest exposure time in seconds usable for flats
    #[serde(default = "default_min_exptime")]
    pub min_exptime: f64,

    /// Longest exposure time in seconds usable for flats
    #[serde(default = "default_max_exptime")]
    pub max_exptime: f64,

    /// Window in percent of the full frame used for test exposures
    #[serde(default = "default_test_frame")]
    pub test_frame: PercentRect,

    /// Window in percent of the trimmed frame used to measure counts
    #[serde(default = "default_counts_frame")]
    pub counts_frame: PercentRect,

    /// Allowed deviation from `target_count` as fraction of it
    #[serde(default = "default_allowed_offset_frac")]
    pub allowed_offset_frac: f64,

    /// Frames with a lower median are not used to adapt the exposure time
    #[serde(default = "default_min_counts")]
    pub min_counts: f64,

    /// CSV log of stored flats, disabled if unset
    #[serde(default)]
    pub log_path: Option<PathBuf>,

    #[serde(default)]
    pub pointing: PointingConfig,

    #[serde(default)]
    pub deviation_policy: DeviationPolicy,

    /// Sleep between checks while it is too early
    #[serde(default = "default_wait_interval_secs")]
    pub wait_interval_secs: f64,

    /// Time between the two solar altitudes compared to decide dusk or dawn
    #[serde(default = "default_twilight_lookahead_mins")]
    pub twilight_lookahead_mins: i64,
}

impl Default for FlatFielderConfig {
    fn default() -> Self {
        Self {
            functions: BTreeMap::new(),
            target_count: default_target_count(),
            min_exptime: default_min_exptime(),
            max_exptime: default_max_exptime(),
            test_frame: default_test_frame(),
            counts_frame: default_counts_frame(),
            allowed_offset_frac: default_allowed_offset_frac(),
            min_counts: default_min_counts(),
            log_path: None,
            pointing: PointingConfig::default(),
            deviation_policy: DeviationPolicy::default(),
            wait_interval_secs: default_wait_interval_secs(),
            twilight_lookahead_mins: default_twilight_lookahead_mins(),
        }
    }
}

fn default_target_count() -> f64 {
    30000.0
}

fn default_min_exptime() -> f64 {
    0.5
}

fn default_max_exptime() -> f64 {
    5.0
}

fn default_test_frame() -> PercentRect {
    PercentRect::new(45.0, 45.0, 10.0, 10.0)
}

fn default_counts_frame() -> PercentRect {
    PercentRect::new(25.0, 25.0, 75.0, 75.0)
}

fn default_allowed_offset_frac() -> f64 {
    0.2
}

fn default_min_counts() -> f64 {
    100.0
}

fn default_wait_interval_secs() -> f64 {
    10.0
}

fn default_twilight_lookahead_mins() -> i64 {
    10
}

impl FlatFielderConfig {
    /// Add an exposure time function for a filter
    pub fn with_function(mut self, filter: impl Into<String>, function: impl Into<String>) -> Self {
        self.functions.insert(filter.into(), function.into());
        self
    }

    pub fn from_json_str(json: &str) -> Result<Self> {
        let config: Self = serde_json::from_str(json)?;
        config.validate()?;
        Ok(config)
    }

    pub fn from_json_file(path: impl AsRef<Path>) -> Result<Self> {
        let content = std::fs::read_to_string(path.as_ref())?;
        Self::from_json_str(&content)
    }

    pub fn validate(&self) -> Result<()> {
        let invalid = |msg: String| Err(SkyFlatsError::InvalidConfig(msg));

        if !(self.min_exptime > 0.0) {
            return invalid(format!("min_exptime must be positive, got {}", self.min_exptime));
        }
        if !(self.max_exptime >= self.min_exptime) {
            return invalid(format!(
                "max_exptime ({}) must not be less than min_exptime ({})",
                self.max_exptime, self.min_exptime
            ));
        }
        if !(self.target_count > 0.0) {
            return invalid(format!("target_count must be positive, got {}", self.target_count));
        }
        if !self.test_frame.is_valid() {
            return invalid(format!("test_frame is not a valid percent window: {:?}", self.test_frame));
        }
        if !self.counts_frame.is_valid() {
            return invalid(format!("counts_frame is not a valid percent window: {:?}", self.counts_frame));
        }
        if !(self.allowed_offset_frac >= 0.0) {
            return invalid(format!(
                "allowed_offset_frac must not be negative, got {}",
                self.allowed_offset_frac
            ));
        }
        if !(self.wait_interval_secs >= 0.0) || !self.wait_interval_secs.is_finite() {
            return invalid(format!("wait_interval_secs must not be negative, got {}", self.wait_interval_secs));
        }
        if self.twilight_lookahead_mins <= 0 {
            return invalid(format!(
                "twilight_lookahead_mins must be positive, got {}",
                self.twilight_lookahead_mins
            ));
        }
        self.pointing.validate()
    }
}

/// Where to point the telescope for sky flats
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum PointingConfig {
    /// Fixed horizontal position
    Static { altitude_deg: f64, azimuth_deg: f64 },
    /// Opposite the sun at a fixed altitude
    AntiSun {
        #[serde(default = "default_anti_sun_altitude")]
        altitude_deg: f64,
        /// Do not move for smaller changes of the target azimuth
        #[serde(default = "default_min_move_deg")]
        min_move_deg: f64,
    },
}

impl Default for PointingConfig {
    fn default() -> Self {
        PointingConfig::AntiSun {
            altitude_deg: default_anti_sun_altitude(),
            min_move_deg: default_min_move_deg(),
        }
    }
}

fn default_anti_sun_altitude() -> f64 {
    80.0
}

fn default_min_move_deg() -> f64 {
    1.0
}

impl PointingConfig {
    fn validate(&self) -> Result<()> {
        let altitude = match self {
            PointingConfig::Static { altitude_deg, .. } => *altitude_deg,
            PointingConfig::AntiSun { altitude_deg, min_move_deg } => {
                if !(*min_move_deg >= 0.0) {
                    return Err(SkyFlatsError::InvalidConfig(format!(
                        "min_move_deg must not be negative, got {}",
                        min_move_deg
                    )));
                }
                *altitude_deg
            }
        };
        if !(0.0..=90.0).contains(&altitude) {
            return Err(SkyFlatsError::InvalidConfig(format!(
                "pointing altitude must be within 0..=90°, got {}",
                altitude
            )));
        }
        Ok(())
    }

    /// Create the pointing strategy
    pub fn build(&self, ephemeris: Arc<dyn SolarEphemeris>) -> Box<dyn SkyFlatsPointing> {
        match self {
            PointingConfig::Static {
                altitude_deg,
                azimuth_deg,
            } => Box::new(StaticPointing::new(*altitude_deg, *azimuth_deg)),
            PointingConfig::AntiSun {
                altitude_deg,
                min_move_deg,
            } => Box::new(AntiSunPointing::new(*altitude_deg, *min_move_deg, ephemeris)),
        }
    }
}

/// What to do with a flat whose counts deviate more than allowed from the target
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DeviationPolicy {
    /// Do not count or log it; the next frame uses the corrected exposure time
    #[default]
    Reject,
    /// Count and log it anyway
    Accept,
}

/// Configuration of the driving loop
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunnerConfig {
    /// Abort the run after this long
    #[serde(default = "default_max_duration_secs")]
    pub max_duration_secs: u64,

    /// Pause between two steps
    #[serde(default = "default_step_interval_ms")]
    pub step_interval_ms: u64,

    /// Stop telescope motion when the run ends
    #[serde(default = "default_stop_telescope")]
    pub stop_telescope: bool,
}

impl Default for RunnerConfig {
    fn default() -> Self {
        Self {
            max_duration_secs: default_max_duration_secs(),
            step_interval_ms: default_step_interval_ms(),
            stop_telescope: default_stop_telescope(),
        }
    }
}

fn default_max_duration_secs() -> u64 {
    3600
}

fn default_step_interval_ms() -> u64 {
    100
}

fn default_stop_telescope() -> bool {
    true
}
