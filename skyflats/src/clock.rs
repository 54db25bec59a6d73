//! Time sources
//!
//! The flat fielder never calls `Utc::now()` directly: solar altitude is
//! always evaluated at the time reported by a [`Clock`], so simulated runs
//! can move through a whole twilight in seconds.

use chrono::{DateTime, Utc};
use std::time::Duration;

pub trait Clock: Send + Sync {
    fn now(&self) -> DateTime<Utc>;
}

/// Wall clock
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }
}

/// Clock anchored to tokio time, optionally running faster than real time.
///
/// Under `#[tokio::test(start_paused = true)]` tokio time only advances when
/// every task sleeps, so a simulated run executes instantly while the clock
/// still reports consistent timestamps.
#[derive(Debug, Clone)]
pub struct SimulatedClock {
    origin: DateTime<Utc>,
    started: tokio::time::Instant,
    speed: f64,
}

impl SimulatedClock {
    pub fn new(origin: DateTime<Utc>) -> Self {
        Self::with_speed(origin, 1.0)
    }

    /// Clock where one real second corresponds to `speed` simulated seconds
    pub fn with_speed(origin: DateTime<Utc>, speed: f64) -> Self {
        Self {
            origin,
            started: tokio::time::Instant::now(),
            speed: if speed > 0.0 { speed } else { 1.0 },
        }
    }

    pub fn speed(&self) -> f64 {
        self.speed
    }

    /// Real time needed for `simulated` to pass on this clock
    pub fn real_duration(&self, simulated: Duration) -> Duration {
        simulated.div_f64(self.speed)
    }
}

impl Clock for SimulatedClock {
    fn now(&self) -> DateTime<Utc> {
        let elapsed = self.started.elapsed().as_secs_f64() * self.speed;
        self.origin + chrono::Duration::microseconds((elapsed * 1e6) as i64)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[tokio::test(start_paused = true)]
    async fn test_simulated_clock_follows_tokio_time() {
        let origin = Utc.with_ymd_and_hms(2024, 3, 20, 18, 0, 0).unwrap();
        let clock = SimulatedClock::new(origin);
        assert_eq!(clock.now(), origin);

        tokio::time::sleep(Duration::from_secs(600)).await;
        assert_eq!(clock.now(), origin + chrono::Duration::minutes(10));
    }

    #[tokio::test(start_paused = true)]
    async fn test_simulated_clock_speed() {
        let origin = Utc.with_ymd_and_hms(2024, 3, 20, 18, 0, 0).unwrap();
        let clock = SimulatedClock::with_speed(origin, 60.0);

        tokio::time::sleep(Duration::from_secs(10)).await;
        assert_eq!(clock.now(), origin + chrono::Duration::minutes(10));
        assert_eq!(clock.real_duration(Duration::from_secs(120)), Duration::from_secs(2));
    }

    #[test]
    fn test_invalid_speed_falls_back_to_real_time() {
        let clock = SimulatedClock::with_speed(Utc::now(), 0.0);
        assert_eq!(clock.speed(), 1.0);
    }
}
