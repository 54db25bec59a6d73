//! Nightshade Sky Flats - Automated Twilight Flat-Field Calibration
//!
//! Points the telescope at a patch of twilight sky, exposes repeatedly,
//! measures the signal level and adapts the exposure time while the sky
//! brightness changes, then stores a fixed number of calibration frames.
//!
//! The core is [`FlatFielder`], a step-driven state machine:
//!
//! ```text
//! INIT ──► WAITING ──► TESTING ──► RUNNING ──► FINISHED
//!            ▲  │        ▲  │        │  │
//!            └──┘        └──┼────────┘  │
//!                           └───────────┴──► FINISHED (window passed)
//! ```
//!
//! Each call to [`FlatFielder::step`] performs exactly one unit of work
//! (wait, test exposure, or stored exposure). The caller, usually
//! [`FlatFieldRunner`], keeps calling until [`FlatFieldState::Finished`]
//! or until the run is aborted.
//!
//! Devices are reached through the capability traits in [`device_ops`];
//! [`simulation`] provides a complete simulated observatory for testing
//! without hardware.

use serde::{Deserialize, Serialize};
use std::fmt;

pub mod abort;
pub mod clock;
pub mod config;
pub mod device_ops;
pub mod ephemeris;
pub mod error;
pub mod exposure;
pub mod expression;
pub mod flat_fielder;
pub mod image;
pub mod pointing;
pub mod run_log;
pub mod runner;
pub mod simulation;

pub use abort::{AbortToken, WaitOutcome};
pub use clock::{Clock, SimulatedClock, SystemClock};
pub use config::{DeviationPolicy, FlatFielderConfig, PointingConfig, RunnerConfig};
pub use device_ops::{Camera, CameraBinning, CameraWindow, FilterWheel, ImageRef, ImageStore, Telescope};
pub use ephemeris::{SolarEphemeris, SunEphemeris, SunPosition};
pub use error::{DeviceError, DeviceResult, Result, SkyFlatsError};
pub use exposure::{ExposureFeedback, FrameAnalysis, TimingWindow};
pub use expression::ExposureModel;
pub use flat_fielder::FlatFielder;
pub use image::FrameData;
pub use pointing::{AntiSunPointing, SkyFlatsPointing, StaticPointing};
pub use run_log::{LogRow, RunLog};
pub use runner::{FlatFieldRunner, FlatFieldSummary};

/// State of the flat-field state machine
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FlatFieldState {
    /// Nothing done yet for this run
    Init,
    /// Devices are in position, waiting for the sky to reach the exposure window
    Waiting,
    /// Taking test exposures that are analysed but not stored
    Testing,
    /// Taking and storing flat fields
    Running,
    /// Terminal, only left via `reset()`
    Finished,
}

impl fmt::Display for FlatFieldState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            FlatFieldState::Init => "init",
            FlatFieldState::Waiting => "waiting",
            FlatFieldState::Testing => "testing",
            FlatFieldState::Running => "running",
            FlatFieldState::Finished => "finished",
        };
        f.write_str(name)
    }
}

/// Which twilight we are in
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Twilight {
    /// Sun is setting, sky gets darker, required exposure time grows
    Dusk,
    /// Sun is rising, sky gets brighter, required exposure time shrinks
    Dawn,
}

impl fmt::Display for Twilight {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Twilight::Dusk => f.write_str("dusk"),
            Twilight::Dawn => f.write_str("dawn"),
        }
    }
}

/// Frame type requested from the camera
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ImageType {
    Bias,
    Dark,
    Object,
    SkyFlat,
}

/// Pixel window on the detector
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct PixelRect {
    pub left: u32,
    pub top: u32,
    pub width: u32,
    pub height: u32,
}

impl PixelRect {
    pub fn new(left: u32, top: u32, width: u32, height: u32) -> Self {
        Self { left, top, width, height }
    }

    /// Exclusive right edge
    pub fn right(&self) -> u32 {
        self.left.saturating_add(self.width)
    }

    /// Exclusive bottom edge
    pub fn bottom(&self) -> u32 {
        self.top.saturating_add(self.height)
    }

    pub fn area(&self) -> u64 {
        self.width as u64 * self.height as u64
    }

    pub fn is_empty(&self) -> bool {
        self.width == 0 || self.height == 0
    }
}

impl fmt::Display for PixelRect {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}x{} at {},{}", self.width, self.height, self.left, self.top)
    }
}

/// Window given in percent of some reference area
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct PercentRect {
    pub left: f64,
    pub top: f64,
    pub width: f64,
    pub height: f64,
}

impl PercentRect {
    pub fn new(left: f64, top: f64, width: f64, height: f64) -> Self {
        Self { left, top, width, height }
    }

    /// Whether all values are percentages and the window is not empty
    pub fn is_valid(&self) -> bool {
        let in_range = |v: f64| (0.0..=100.0).contains(&v);
        in_range(self.left)
            && in_range(self.top)
            && in_range(self.width)
            && in_range(self.height)
            && self.width > 0.0
            && self.height > 0.0
    }

    /// Resolve to a pixel window inside `area`, clipped to its edges.
    pub fn within(&self, area: &PixelRect) -> PixelRect {
        let width = area.width as f64;
        let height = area.height as f64;

        let left = ((self.left / 100.0 * width) as u32).min(area.width);
        let top = ((self.top / 100.0 * height) as u32).min(area.height);
        let w = ((self.width / 100.0 * width) as u32).min(area.width - left);
        let h = ((self.height / 100.0 * height) as u32).min(area.height - top);

        PixelRect::new(area.left + left, area.top + top, w, h)
    }
}

/// Position on the sky in horizontal coordinates
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct HorizontalPosition {
    /// Altitude above horizon in degrees
    pub altitude_deg: f64,
    /// Azimuth in degrees, north = 0, east = 90
    pub azimuth_deg: f64,
}

impl HorizontalPosition {
    pub fn new(altitude_deg: f64, azimuth_deg: f64) -> Self {
        Self {
            altitude_deg,
            azimuth_deg: azimuth_deg.rem_euclid(360.0),
        }
    }
}

impl fmt::Display for HorizontalPosition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "alt={:.2}°, az={:.2}°", self.altitude_deg, self.azimuth_deg)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_percent_rect_within_full_frame() {
        let full = PixelRect::new(0, 0, 1000, 500);
        let test_frame = PercentRect::new(45.0, 45.0, 10.0, 10.0);
        assert_eq!(test_frame.within(&full), PixelRect::new(450, 225, 100, 50));
    }

    #[test]
    fn test_percent_rect_within_offset_area() {
        let trimmed = PixelRect::new(10, 20, 200, 100);
        let frame = PercentRect::new(25.0, 25.0, 50.0, 50.0);
        assert_eq!(frame.within(&trimmed), PixelRect::new(60, 45, 100, 50));
    }

    #[test]
    fn test_percent_rect_is_clipped() {
        let full = PixelRect::new(0, 0, 100, 100);
        let counts_frame = PercentRect::new(25.0, 25.0, 100.0, 100.0);
        let window = counts_frame.within(&full);
        assert_eq!(window.right(), 100);
        assert_eq!(window.bottom(), 100);
        assert_eq!(window.width, 75);
    }

    #[test]
    fn test_pixel_rect_edges_saturate() {
        let rect = PixelRect::new(10, 20, u32::MAX, u32::MAX);
        assert_eq!(rect.right(), u32::MAX);
        assert_eq!(rect.bottom(), u32::MAX);
    }

    #[test]
    fn test_percent_rect_validation() {
        assert!(PercentRect::new(25.0, 25.0, 75.0, 75.0).is_valid());
        assert!(!PercentRect::new(-1.0, 25.0, 75.0, 75.0).is_valid());
        assert!(!PercentRect::new(0.0, 0.0, 0.0, 10.0).is_valid());
        assert!(!PercentRect::new(0.0, 0.0, 101.0, 10.0).is_valid());
    }

    #[test]
    fn test_horizontal_position_wraps_azimuth() {
        let pos = HorizontalPosition::new(80.0, 450.0);
        assert_eq!(pos.azimuth_deg, 90.0);
        let pos = HorizontalPosition::new(80.0, -90.0);
        assert_eq!(pos.azimuth_deg, 270.0);
    }

    #[test]
    fn test_state_display() {
        assert_eq!(FlatFieldState::Testing.to_string(), "testing");
        assert_eq!(Twilight::Dawn.to_string(), "dawn");
    }
}
