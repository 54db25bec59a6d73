//! Pointing strategies for sky flats
//!
//! A strategy decides where on the twilight sky the telescope should look
//! and issues the move. It is called once during initialisation and again
//! before every stored flat, so strategies that follow the sun can refine
//! the position while the run progresses.

use crate::device_ops::Telescope;
use crate::ephemeris::SolarEphemeris;
use crate::error::DeviceResult;
use crate::HorizontalPosition;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::sync::Arc;

#[async_trait]
pub trait SkyFlatsPointing: Send + Sync {
    /// Move the telescope to the flat-field position for time `now`
    async fn point(&mut self, telescope: &dyn Telescope, now: DateTime<Utc>) -> DeviceResult<()>;

    /// Forget everything about the previous run
    fn reset(&mut self);
}

/// Fixed horizontal position, slewed to once per run
#[derive(Debug, Clone)]
pub struct StaticPointing {
    position: HorizontalPosition,
    in_position: bool,
}

impl StaticPointing {
    pub fn new(altitude_deg: f64, azimuth_deg: f64) -> Self {
        Self {
            position: HorizontalPosition::new(altitude_deg, azimuth_deg),
            in_position: false,
        }
    }

    pub fn position(&self) -> HorizontalPosition {
        self.position
    }
}

#[async_trait]
impl SkyFlatsPointing for StaticPointing {
    async fn point(&mut self, telescope: &dyn Telescope, _now: DateTime<Utc>) -> DeviceResult<()> {
        if self.in_position {
            return Ok(());
        }
        tracing::info!("Moving telescope to {}...", self.position);
        telescope.point(self.position).await?;
        self.in_position = true;
        Ok(())
    }

    fn reset(&mut self) {
        self.in_position = false;
    }
}

/// Points opposite the sun at a fixed altitude, where the twilight sky is
/// most uniform.
pub struct AntiSunPointing {
    altitude_deg: f64,
    min_move_deg: f64,
    ephemeris: Arc<dyn SolarEphemeris>,
    last: Option<HorizontalPosition>,
}

impl AntiSunPointing {
    pub fn new(altitude_deg: f64, min_move_deg: f64, ephemeris: Arc<dyn SolarEphemeris>) -> Self {
        Self {
            altitude_deg,
            min_move_deg,
            ephemeris,
            last: None,
        }
    }

    /// Target position for time `now`
    pub fn target(&self, now: DateTime<Utc>) -> HorizontalPosition {
        let sun = self.ephemeris.sun_alt_az(now);
        HorizontalPosition::new(self.altitude_deg, sun.azimuth_deg + 180.0)
    }

    /// Last position the telescope was moved to successfully
    pub fn last_position(&self) -> Option<HorizontalPosition> {
        self.last
    }
}

/// Smallest angle between two azimuths in degrees
fn azimuth_distance(a: f64, b: f64) -> f64 {
    let d = (a - b).rem_euclid(360.0);
    d.min(360.0 - d)
}

#[async_trait]
impl SkyFlatsPointing for AntiSunPointing {
    async fn point(&mut self, telescope: &dyn Telescope, now: DateTime<Utc>) -> DeviceResult<()> {
        let target = self.target(now);

        if let Some(last) = self.last {
            let drift = azimuth_distance(last.azimuth_deg, target.azimuth_deg);
            if drift <= self.min_move_deg {
                tracing::debug!("Anti-solar position drifted {:.2}°, not moving", drift);
                return Ok(());
            }
        }

        tracing::info!("Moving telescope to anti-solar position {}...", target);
        telescope.point(target).await?;
        self.last = Some(target);
        Ok(())
    }

    fn reset(&mut self) {
        self.last = None;
    }
}
