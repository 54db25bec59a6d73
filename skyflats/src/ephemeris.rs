//! Solar ephemeris
//!
//! Low-precision solar position (better than ~0.1° over several decades
//! around J2000), plenty for deciding when the twilight sky is usable.

use crate::Twilight;
use chrono::{DateTime, Datelike, Timelike, Utc};

/// Position of the sun for the observing site
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SunPosition {
    pub altitude_deg: f64,
    pub azimuth_deg: f64,
}

/// Source of solar positions for the observing site
pub trait SolarEphemeris: Send + Sync {
    fn sun_alt_az(&self, at: DateTime<Utc>) -> SunPosition;
}

/// Solar ephemeris for a fixed site
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SunEphemeris {
    /// Geodetic latitude in degrees, north positive
    pub latitude_deg: f64,
    /// Longitude in degrees, east positive
    pub longitude_deg: f64,
}

impl SunEphemeris {
    pub fn new(latitude_deg: f64, longitude_deg: f64) -> Self {
        Self {
            latitude_deg,
            longitude_deg,
        }
    }
}

impl SolarEphemeris for SunEphemeris {
    fn sun_alt_az(&self, at: DateTime<Utc>) -> SunPosition {
        let jd = julian_day(&at);
        let (ra_deg, dec_deg) = solar_equatorial(jd);

        let lst_deg = local_sidereal_degrees(jd, self.longitude_deg);
        let ha = (lst_deg - ra_deg).to_radians();
        let dec = dec_deg.to_radians();
        let lat = self.latitude_deg.to_radians();

        let sin_alt = lat.sin() * dec.sin() + lat.cos() * dec.cos() * ha.cos();
        let altitude = sin_alt.clamp(-1.0, 1.0).asin();

        // azimuth from north through east
        let azimuth = (-ha.sin() * dec.cos()).atan2(dec.sin() * lat.cos() - dec.cos() * lat.sin() * ha.cos());

        SunPosition {
            altitude_deg: altitude.to_degrees(),
            azimuth_deg: azimuth.to_degrees().rem_euclid(360.0),
        }
    }
}

/// Decide the twilight direction by comparing the solar altitude now with the
/// altitude `lookahead` later: falling means dusk, otherwise dawn.
pub fn twilight_direction(
    ephemeris: &dyn SolarEphemeris,
    now: DateTime<Utc>,
    lookahead: chrono::Duration,
) -> Twilight {
    let sun_now = ephemeris.sun_alt_az(now);
    let sun_later = ephemeris.sun_alt_az(now + lookahead);
    if sun_later.altitude_deg < sun_now.altitude_deg {
        Twilight::Dusk
    } else {
        Twilight::Dawn
    }
}

/// Julian Day for a UTC timestamp
pub fn julian_day(dt: &DateTime<Utc>) -> f64 {
    let year = dt.year();
    let month = dt.month();
    let day = dt.day();

    let (y, m) = if month <= 2 {
        (year - 1, month + 12)
    } else {
        (year, month)
    };

    let a = y / 100;
    let b = 2 - a + a / 4;

    let jd = (365.25 * (y as f64 + 4716.0)).floor()
        + (30.6001 * (m as f64 + 1.0)).floor()
        + day as f64
        + b as f64
        - 1524.5;

    let seconds = dt.hour() as f64 * 3600.0
        + dt.minute() as f64 * 60.0
        + dt.second() as f64
        + dt.nanosecond() as f64 * 1e-9;

    jd + seconds / 86400.0
}

/// Local mean sidereal time in degrees
fn local_sidereal_degrees(jd: f64, longitude_deg: f64) -> f64 {
    let d = jd - 2451545.0;
    let t = d / 36525.0;

    let gmst = 280.46061837 + 360.98564736629 * d + 0.000387933 * t * t - t * t * t / 38710000.0;

    (gmst + longitude_deg).rem_euclid(360.0)
}

/// Apparent solar right ascension and declination in degrees
fn solar_equatorial(jd: f64) -> (f64, f64) {
    // Days since J2000.0
    let n = jd - 2451545.0;

    // Mean longitude and mean anomaly (degrees)
    let l = (280.460 + 0.9856474 * n).rem_euclid(360.0);
    let g = (357.528 + 0.9856003 * n).rem_euclid(360.0).to_radians();

    // Ecliptic longitude
    let lambda = (l + 1.915 * g.sin() + 0.020 * (2.0 * g).sin()).to_radians();

    // Obliquity of the ecliptic
    let epsilon = (23.439 - 0.0000004 * n).to_radians();

    let ra = (epsilon.cos() * lambda.sin()).atan2(lambda.cos());
    let dec = (epsilon.sin() * lambda.sin()).asin();

    (ra.to_degrees().rem_euclid(360.0), dec.to_degrees())
}
