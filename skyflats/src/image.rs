//! Downloaded frame data and signal measurement
//!
//! Pixels are stored row-major as raw 16 bit ADU. The trim section marks the
//! usable (non-overscan) part of the detector; measurement windows given in
//! percent are always resolved relative to it.

use crate::{PercentRect, PixelRect};
use serde::{Deserialize, Serialize};

/// Decoded frame with minimal metadata
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FrameData {
    pub width: u32,
    pub height: u32,
    pub data: Vec<u16>,
    /// Usable detector region, `None` means the whole frame
    #[serde(default)]
    pub trim: Option<PixelRect>,
}

impl FrameData {
    /// Returns `None` if `data` does not hold exactly `width * height` pixels
    pub fn new(width: u32, height: u32, data: Vec<u16>) -> Option<Self> {
        if data.len() as u64 != width as u64 * height as u64 {
            return None;
        }
        Some(Self {
            width,
            height,
            data,
            trim: None,
        })
    }

    /// Frame with every pixel set to `value`
    pub fn filled(width: u32, height: u32, value: u16) -> Self {
        Self {
            width,
            height,
            data: vec![value; width as usize * height as usize],
            trim: None,
        }
    }

    pub fn with_trim(mut self, trim: PixelRect) -> Self {
        self.trim = Some(trim);
        self
    }

    pub fn full_area(&self) -> PixelRect {
        PixelRect::new(0, 0, self.width, self.height)
    }

    /// Trim section clipped to the frame
    pub fn trimmed_area(&self) -> PixelRect {
        match self.trim {
            Some(trim) => clip(&trim, &self.full_area()),
            None => self.full_area(),
        }
    }

    /// Median over all pixels, including overscan
    pub fn median(&self) -> Option<f64> {
        median_u16(self.data.clone())
    }

    /// Median over a pixel window, clipped to the frame
    pub fn median_of(&self, window: &PixelRect) -> Option<f64> {
        median_u16(self.window_pixels(window))
    }

    /// Median over a percent window of the trimmed area
    pub fn median_in(&self, frame: &PercentRect) -> Option<f64> {
        let window = frame.within(&self.trimmed_area());
        self.median_of(&window)
    }

    /// Copy the pixels of a window, clipped to the frame
    pub fn window_pixels(&self, window: &PixelRect) -> Vec<u16> {
        let window = clip(window, &self.full_area());
        let row_len = self.width as usize;
        let mut pixels = Vec::with_capacity(window.area() as usize);
        for y in window.top..window.bottom() {
            let start = y as usize * row_len + window.left as usize;
            let end = start + window.width as usize;
            if let Some(row) = self.data.get(start..end) {
                pixels.extend_from_slice(row);
            }
        }
        pixels
    }
}

fn clip(rect: &PixelRect, bounds: &PixelRect) -> PixelRect {
    let left = rect.left.clamp(bounds.left, bounds.right());
    let top = rect.top.clamp(bounds.top, bounds.bottom());
    let right = rect.right().clamp(left, bounds.right());
    let bottom = rect.bottom().clamp(top, bounds.bottom());
    PixelRect::new(left, top, right - left, bottom - top)
}

/// Median of raw pixel values; for an even count the mean of the two middle values
pub fn median_u16(mut pixels: Vec<u16>) -> Option<f64> {
    let n = pixels.len();
    if n == 0 {
        return None;
    }

    let mid = n / 2;
    let (lower, upper, _) = pixels.select_nth_unstable(mid);
    let upper = *upper as f64;
    if n % 2 == 1 {
        return Some(upper);
    }

    let below = lower.iter().copied().max().map(f64::from).unwrap_or(upper);
    Some((below + upper) / 2.0)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ramp(width: u32, height: u32) -> FrameData {
        let data = (0..width * height).map(|v| v as u16).collect();
        FrameData::new(width, height, data).unwrap()
    }

    #[test]
    fn test_median_odd_and_even() {
        assert_eq!(median_u16(vec![5, 1, 3]), Some(3.0));
        assert_eq!(median_u16(vec![4, 1, 3, 2]), Some(2.5));
        assert_eq!(median_u16(vec![7]), Some(7.0));
        assert_eq!(median_u16(Vec::new()), None);
    }

    #[test]
    fn test_new_rejects_wrong_length() {
        assert!(FrameData::new(10, 10, vec![0; 99]).is_none());
        assert!(FrameData::new(10, 10, vec![0; 100]).is_some());
    }

    #[test]
    fn test_window_pixels() {
        let frame = ramp(4, 3);
        assert_eq!(frame.window_pixels(&PixelRect::new(1, 1, 2, 2)), vec![5, 6, 9, 10]);
        assert_eq!(frame.window_pixels(&PixelRect::new(3, 2, 1, 1)), vec![11]);
    }

    #[test]
    fn test_window_is_clipped_to_frame() {
        let frame = ramp(4, 3);
        assert_eq!(frame.window_pixels(&PixelRect::new(3, 2, 10, 10)), vec![11]);
        assert!(frame.window_pixels(&PixelRect::new(10, 10, 2, 2)).is_empty());
    }

    #[test]
    fn test_median_in_uses_trim_section() {
        // bright overscan columns on the right must not affect the measurement
        let mut frame = FrameData::filled(100, 100, 1000);
        for y in 0..100 {
            for x in 80..100 {
                frame.data[y * 100 + x] = 60000;
            }
        }
        let frame = frame.with_trim(PixelRect::new(0, 0, 80, 100));

        let counts_frame = PercentRect::new(25.0, 25.0, 75.0, 75.0);
        assert_eq!(frame.median_in(&counts_frame), Some(1000.0));

        // without the trim section the window reaches into the overscan
        let untrimmed = FrameData {
            trim: None,
            ..frame.clone()
        };
        assert!(untrimmed.median_of(&PixelRect::new(60, 0, 40, 100)).unwrap() > 1000.0);
    }

    #[test]
    fn test_trimmed_area_is_clipped() {
        let frame = FrameData::filled(50, 40, 0).with_trim(PixelRect::new(10, 10, 100, 100));
        assert_eq!(frame.trimmed_area(), PixelRect::new(10, 10, 40, 30));
    }

    #[test]
    fn test_oversized_trim_section_is_clipped() {
        let frame = FrameData::filled(50, 40, 1200).with_trim(PixelRect::new(5, 5, u32::MAX, u32::MAX));
        assert_eq!(frame.trimmed_area(), PixelRect::new(5, 5, 45, 35));
        assert_eq!(frame.median_in(&PercentRect::new(25.0, 25.0, 75.0, 75.0)), Some(1200.0));
    }
}
