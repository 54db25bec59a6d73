//! Exposure time feedback control
//!
//! Two questions are answered here:
//! - is an exposure time too early, in range or too late for flat fields
//!   (depends on the twilight direction)?
//! - given the measured median of a frame, what exposure time should the
//!   next frame use?

use crate::Twilight;
use serde::{Deserialize, Serialize};

/// Smallest single-step correction of the exposure time
pub const MIN_CORRECTION: f64 = 0.1;
/// Largest single-step correction, also used when a frame has no signal above bias
pub const MAX_CORRECTION: f64 = 10.0;

/// Where an exposure time lies relative to the flat-field window
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TimingWindow {
    /// Sky not yet at the right brightness, keep waiting
    TooEarly,
    InRange,
    /// Flat-field time has passed
    TooLate,
}

/// Classify `exptime` against `[min_exptime, max_exptime]`.
///
/// At dusk the required exposure time grows, so exceeding the maximum means
/// the window has passed and staying below the minimum means the sky is still
/// too bright. At dawn it shrinks and both senses are swapped.
pub fn classify(twilight: Twilight, exptime: f64, min_exptime: f64, max_exptime: f64) -> TimingWindow {
    match twilight {
        Twilight::Dusk if exptime > max_exptime => TimingWindow::TooLate,
        Twilight::Dusk if exptime < min_exptime => TimingWindow::TooEarly,
        Twilight::Dawn if exptime < min_exptime => TimingWindow::TooLate,
        Twilight::Dawn if exptime > max_exptime => TimingWindow::TooEarly,
        _ => TimingWindow::InRange,
    }
}

/// Factor to scale the exposure time by so the signal above bias reaches the target.
///
/// Always within `[MIN_CORRECTION, MAX_CORRECTION]`. A median at or below
/// the bias level carries no usable signal and gets the maximum correction.
pub fn correction_factor(target_count: f64, bias_level: f64, median: f64) -> f64 {
    let signal = median - bias_level;
    if !(signal > 0.0) {
        return MAX_CORRECTION;
    }
    let factor = (target_count - bias_level) / signal;
    if factor.is_nan() {
        return MAX_CORRECTION;
    }
    factor.clamp(MIN_CORRECTION, MAX_CORRECTION)
}

/// Relative deviation of `median` from `target_count`
pub fn deviation(median: f64, target_count: f64) -> f64 {
    (1.0 - median / target_count).abs()
}

/// Result of analysing one flat field
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum FrameAnalysis {
    /// Median below the noise floor; exposure time left unchanged
    LowSignal { median: f64 },
    /// Close enough to the target; `exptime` is the corrected exposure time
    Usable { median: f64, factor: f64, exptime: f64 },
    /// Further from the target than allowed; the correction still applies
    Deviating {
        median: f64,
        deviation: f64,
        factor: f64,
        exptime: f64,
    },
}

impl FrameAnalysis {
    pub fn median(&self) -> f64 {
        match self {
            FrameAnalysis::LowSignal { median }
            | FrameAnalysis::Usable { median, .. }
            | FrameAnalysis::Deviating { median, .. } => *median,
        }
    }

    /// Exposure time for the next frame, `None` if it must not change
    pub fn next_exptime(&self) -> Option<f64> {
        match self {
            FrameAnalysis::LowSignal { .. } => None,
            FrameAnalysis::Usable { exptime, .. } | FrameAnalysis::Deviating { exptime, .. } => Some(*exptime),
        }
    }
}

/// Feedback controller parameters
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ExposureFeedback {
    pub target_count: f64,
    pub min_counts: f64,
    pub allowed_offset_frac: f64,
}

impl ExposureFeedback {
    /// Analyse a frame exposed for `exptime` seconds that measured `median`
    pub fn analyse(&self, median: f64, bias_level: f64, exptime: f64) -> FrameAnalysis {
        if !(median >= self.min_counts) {
            return FrameAnalysis::LowSignal { median };
        }

        let factor = correction_factor(self.target_count, bias_level, median);
        let exptime = exptime * factor;
        let deviation = deviation(median, self.target_count);

        if deviation > self.allowed_offset_frac {
            FrameAnalysis::Deviating {
                median,
                deviation,
                factor,
                exptime,
            }
        } else {
            FrameAnalysis::Usable { median, factor, exptime }
        }
    }
}
