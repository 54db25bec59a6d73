//! Simulated twilight observatory
//!
//! Telescope, filter wheel and camera that behave like the real devices
//! (motion and exposures take time, frames have bias, overscan, noise and a
//! sky level that follows the sun), for tests and dry runs without hardware.
//! All devices share one [`SimulatedClock`]; with a speed-up a complete
//! twilight passes in a minute of real time.

use crate::clock::{Clock, SimulatedClock};
use crate::device_ops::{Camera, CameraBinning, CameraWindow, FilterWheel, ImageRef, ImageStore, Telescope};
use crate::ephemeris::{SolarEphemeris, SunPosition};
use crate::error::{DeviceError, DeviceResult};
use crate::image::FrameData;
use crate::{HorizontalPosition, ImageType, PixelRect};
use async_trait::async_trait;
use chrono::{DateTime, TimeZone, Utc};
use rand::Rng;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

// =============================================================================
// SUN
// =============================================================================

/// Sun moving linearly in altitude and azimuth, good enough for the half hour
/// of a twilight.
#[derive(Debug, Clone)]
pub struct LinearSolarTrack {
    pub origin: DateTime<Utc>,
    pub altitude_deg: f64,
    pub altitude_rate_deg_per_min: f64,
    pub azimuth_deg: f64,
    pub azimuth_rate_deg_per_min: f64,
}

impl LinearSolarTrack {
    /// Setting sun, just below the horizon at `origin`
    pub fn dusk(origin: DateTime<Utc>) -> Self {
        Self {
            origin,
            altitude_deg: -1.0,
            altitude_rate_deg_per_min: -0.15,
            azimuth_deg: 280.0,
            azimuth_rate_deg_per_min: 0.2,
        }
    }

    /// Rising sun, deep in nautical twilight at `origin`
    pub fn dawn(origin: DateTime<Utc>) -> Self {
        Self {
            origin,
            altitude_deg: -8.0,
            altitude_rate_deg_per_min: 0.15,
            azimuth_deg: 75.0,
            azimuth_rate_deg_per_min: 0.2,
        }
    }
}

impl SolarEphemeris for LinearSolarTrack {
    fn sun_alt_az(&self, at: DateTime<Utc>) -> SunPosition {
        let minutes = (at - self.origin).num_milliseconds() as f64 / 60_000.0;
        SunPosition {
            altitude_deg: self.altitude_deg + self.altitude_rate_deg_per_min * minutes,
            azimuth_deg: (self.azimuth_deg + self.azimuth_rate_deg_per_min * minutes).rem_euclid(360.0),
        }
    }
}

// =============================================================================
// SKY AND DETECTOR
// =============================================================================

/// Twilight sky brightness as seen by an unbinned pixel
#[derive(Debug, Clone)]
pub struct SkyModel {
    /// Counts per second per pixel at the reference altitude
    pub rate_at_reference: f64,
    pub reference_altitude_deg: f64,
    /// Natural log of the brightness change per degree of solar altitude
    pub slope_per_deg: f64,
    /// Relative throughput per filter, 1.0 if missing
    pub filter_throughput: HashMap<String, f64>,
}

impl Default for SkyModel {
    /// Matches the exposure time function `exp(-0.9*(h+3.9))` for a target of
    /// 30000 counts above a bias of 1000
    fn default() -> Self {
        Self {
            rate_at_reference: 29000.0,
            reference_altitude_deg: -3.9,
            slope_per_deg: 0.9,
            filter_throughput: HashMap::new(),
        }
    }
}

impl SkyModel {
    /// Counts per second per unbinned pixel
    pub fn rate(&self, altitude_deg: f64, filter: &str) -> f64 {
        let throughput = self.filter_throughput.get(filter).copied().unwrap_or(1.0);
        throughput * self.rate_at_reference * (self.slope_per_deg * (altitude_deg - self.reference_altitude_deg)).exp()
    }
}

#[derive(Debug, Clone, Copy)]
pub struct SimDetector {
    pub width: u32,
    pub height: u32,
    /// Overscan columns at the right edge, not exposed to light
    pub overscan: u32,
    pub bias: u16,
    /// Amplitude of uniform noise in counts
    pub noise: u16,
}

impl Default for SimDetector {
    fn default() -> Self {
        Self {
            width: 400,
            height: 300,
            overscan: 16,
            bias: 1000,
            noise: 15,
        }
    }
}

// =============================================================================
// FAILURE SCRIPTING
// =============================================================================

/// Make upcoming device operations fail
#[derive(Debug, Default)]
pub struct FailureScript {
    exposures: AtomicU32,
    downloads: AtomicU32,
    slews: AtomicU32,
    filter_changes: AtomicU32,
}

impl FailureScript {
    /// The next `n` exposures time out
    pub fn fail_exposures(&self, n: u32) {
        self.exposures.store(n, Ordering::SeqCst);
    }

    pub fn fail_downloads(&self, n: u32) {
        self.downloads.store(n, Ordering::SeqCst);
    }

    pub fn fail_slews(&self, n: u32) {
        self.slews.store(n, Ordering::SeqCst);
    }

    pub fn fail_filter_changes(&self, n: u32) {
        self.filter_changes.store(n, Ordering::SeqCst);
    }

    fn take(counter: &AtomicU32) -> bool {
        counter
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok()
    }
}

// =============================================================================
// DEVICES
// =============================================================================

pub struct SimTelescope {
    clock: Arc<SimulatedClock>,
    failures: Arc<FailureScript>,
    slew_time: Duration,
    position: Mutex<Option<HorizontalPosition>>,
    moves: Mutex<Vec<HorizontalPosition>>,
    stopped: AtomicBool,
}

impl SimTelescope {
    pub fn position(&self) -> Option<HorizontalPosition> {
        *lock(&self.position)
    }

    /// All positions moved to, in order
    pub fn moves(&self) -> Vec<HorizontalPosition> {
        lock(&self.moves).clone()
    }

    pub fn is_stopped(&self) -> bool {
        self.stopped.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Telescope for SimTelescope {
    async fn point(&self, position: HorizontalPosition) -> DeviceResult<()> {
        tracing::info!("[SIM] Slewing to {}", position);
        tokio::time::sleep(self.clock.real_duration(self.slew_time)).await;
        if FailureScript::take(&self.failures.slews) {
            return Err(DeviceError::failed("telescope", "slew did not settle"));
        }
        self.stopped.store(false, Ordering::SeqCst);
        *lock(&self.position) = Some(position);
        lock(&self.moves).push(position);
        Ok(())
    }

    async fn stop_motion(&self) -> DeviceResult<()> {
        tracing::info!("[SIM] Stopping telescope");
        self.stopped.store(true, Ordering::SeqCst);
        Ok(())
    }
}

pub struct SimFilterWheel {
    clock: Arc<SimulatedClock>,
    failures: Arc<FailureScript>,
    change_time: Duration,
    current: Arc<Mutex<String>>,
}

impl SimFilterWheel {
    pub fn current(&self) -> String {
        lock(&self.current).clone()
    }
}

#[async_trait]
impl FilterWheel for SimFilterWheel {
    async fn set_filter(&self, name: &str) -> DeviceResult<()> {
        tracing::info!("[SIM] Changing filter to {}", name);
        tokio::time::sleep(self.clock.real_duration(self.change_time)).await;
        if FailureScript::take(&self.failures.filter_changes) {
            return Err(DeviceError::timeout("filterwheel", "set_filter", self.change_time));
        }
        *lock(&self.current) = name.to_string();
        Ok(())
    }
}

/// One exposure taken by the simulated camera
#[derive(Debug, Clone, PartialEq)]
pub struct ExposureRecord {
    pub exposure_time_ms: u64,
    pub image_type: ImageType,
    pub broadcast: bool,
    pub filter: String,
    pub binning: u32,
    pub window: PixelRect,
    pub sun_altitude_deg: f64,
}

#[derive(Debug, Clone, Copy)]
struct CameraSettings {
    binning: u32,
    /// `None` is the full frame
    window: Option<PixelRect>,
}

pub struct SimCamera {
    detector: SimDetector,
    sky: SkyModel,
    readout_time: Duration,
    clock: Arc<SimulatedClock>,
    sun: Arc<dyn SolarEphemeris>,
    filter: Arc<Mutex<String>>,
    store: Arc<MemoryImageStore>,
    failures: Arc<FailureScript>,
    settings: Mutex<CameraSettings>,
    exposures: Mutex<Vec<ExposureRecord>>,
    aborts: AtomicU32,
}

impl SimCamera {
    pub fn exposures(&self) -> Vec<ExposureRecord> {
        lock(&self.exposures).clone()
    }

    /// Exposures of the given type
    pub fn exposures_of(&self, image_type: ImageType) -> Vec<ExposureRecord> {
        lock(&self.exposures)
            .iter()
            .filter(|e| e.image_type == image_type)
            .cloned()
            .collect()
    }

    pub fn abort_requests(&self) -> u32 {
        self.aborts.load(Ordering::SeqCst)
    }

    fn full_frame_for(&self, binning: u32) -> PixelRect {
        PixelRect::new(0, 0, self.detector.width / binning, self.detector.height / binning)
    }

    /// Render a frame for the current settings
    fn render(&self, settings: CameraSettings, image_type: ImageType, exposure: f64, altitude_deg: f64, filter: &str) -> FrameData {
        let binning = settings.binning;
        let full = self.full_frame_for(binning);
        let window = settings.window.unwrap_or(full);
        let science_right = full.width.saturating_sub(self.detector.overscan / binning);

        let signal = match image_type {
            ImageType::SkyFlat | ImageType::Object => {
                self.sky.rate(altitude_deg, filter) * exposure * (binning * binning) as f64
            }
            ImageType::Bias | ImageType::Dark => 0.0,
        };

        let bias = self.detector.bias as f64;
        let noise = self.detector.noise as f64;
        let mut rng = rand::thread_rng();
        let mut data = Vec::with_capacity(window.area() as usize);
        for _y in 0..window.height {
            for x in 0..window.width {
                let lit = window.left + x < science_right;
                let level = if lit { bias + signal } else { bias };
                let value = level + rng.gen_range(-noise..=noise);
                data.push(value.clamp(0.0, u16::MAX as f64) as u16);
            }
        }

        let trim_width = science_right.saturating_sub(window.left).min(window.width);
        FrameData {
            width: window.width,
            height: window.height,
            data,
            trim: Some(PixelRect::new(0, 0, trim_width, window.height)),
        }
    }
}

#[async_trait]
impl Camera for SimCamera {
    async fn expose(&self, exposure_time_ms: u64, image_type: ImageType, broadcast: bool) -> DeviceResult<ImageRef> {
        let settings = *lock(&self.settings);
        let filter = lock(&self.filter).clone();
        let exposure = Duration::from_millis(exposure_time_ms);

        let middle = self.clock.now() + chrono::Duration::milliseconds(exposure_time_ms as i64 / 2);
        let altitude_deg = self.sun.sun_alt_az(middle).altitude_deg;

        tracing::debug!(
            "[SIM] Exposing {:?} for {}ms in {} at {}x{} binning",
            image_type,
            exposure_time_ms,
            filter,
            settings.binning,
            settings.binning
        );
        tokio::time::sleep(self.clock.real_duration(exposure + self.readout_time)).await;

        let window = settings.window.unwrap_or_else(|| self.full_frame_for(settings.binning));
        let index = {
            let mut exposures = lock(&self.exposures);
            exposures.push(ExposureRecord {
                exposure_time_ms,
                image_type,
                broadcast,
                filter: filter.clone(),
                binning: settings.binning,
                window,
                sun_altitude_deg: altitude_deg,
            });
            exposures.len()
        };

        if FailureScript::take(&self.failures.exposures) {
            return Err(DeviceError::timeout("camera", "expose", exposure + self.readout_time));
        }

        let frame = self.render(settings, image_type, exposure.as_secs_f64(), altitude_deg, &filter);
        let name = format!("sim-{:05}.fits", index);
        self.store.insert(&name, frame);
        Ok(ImageRef::new(name))
    }

    async fn abort_exposure(&self) -> DeviceResult<()> {
        tracing::info!("[SIM] Abort exposure requested");
        self.aborts.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    fn binning(&self) -> Option<&dyn CameraBinning> {
        Some(self)
    }

    fn window(&self) -> Option<&dyn CameraWindow> {
        Some(self)
    }
}

#[async_trait]
impl CameraBinning for SimCamera {
    async fn set_binning(&self, x: u32, y: u32) -> DeviceResult<()> {
        if x == 0 || x != y {
            return Err(DeviceError::failed("camera", format!("unsupported binning {}x{}", x, y)));
        }
        let mut settings = lock(&self.settings);
        settings.binning = x;
        // the window is given in binned pixels and no longer valid
        settings.window = None;
        Ok(())
    }
}

#[async_trait]
impl CameraWindow for SimCamera {
    async fn full_frame(&self) -> DeviceResult<PixelRect> {
        let binning = lock(&self.settings).binning;
        Ok(self.full_frame_for(binning))
    }

    async fn set_window(&self, window: PixelRect) -> DeviceResult<()> {
        let mut settings = lock(&self.settings);
        let full = self.full_frame_for(settings.binning);
        if window.is_empty() || window.right() > full.right() || window.bottom() > full.bottom() {
            return Err(DeviceError::failed("camera", format!("window {} outside of {}", window, full)));
        }
        settings.window = Some(window);
        Ok(())
    }
}

/// Images kept in memory by name
#[derive(Default)]
pub struct MemoryImageStore {
    frames: Mutex<HashMap<String, FrameData>>,
    failures: Arc<FailureScript>,
}

impl MemoryImageStore {
    pub fn insert(&self, name: &str, frame: FrameData) {
        lock(&self.frames).insert(name.to_string(), frame);
    }

    pub fn len(&self) -> usize {
        lock(&self.frames).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[async_trait]
impl ImageStore for MemoryImageStore {
    async fn download(&self, image: &ImageRef) -> DeviceResult<FrameData> {
        if FailureScript::take(&self.failures.downloads) {
            return Err(DeviceError::Download {
                image: image.to_string(),
                message: "checksum mismatch".to_string(),
            });
        }
        lock(&self.frames).get(image.as_str()).cloned().ok_or_else(|| DeviceError::Download {
            image: image.to_string(),
            message: "no such image".to_string(),
        })
    }
}

// =============================================================================
// OBSERVATORY
// =============================================================================

/// Parameters of a simulated observatory
#[derive(Debug, Clone)]
pub struct SimulationConfig {
    /// Simulated seconds per real second
    pub speed: f64,
    pub sun: LinearSolarTrack,
    pub sky: SkyModel,
    pub detector: SimDetector,
    pub slew_secs: f64,
    pub filter_change_secs: f64,
    pub readout_secs: f64,
}

impl SimulationConfig {
    pub fn dusk() -> Self {
        Self::with_sun(LinearSolarTrack::dusk(default_origin()))
    }

    pub fn dawn() -> Self {
        Self::with_sun(LinearSolarTrack::dawn(default_origin()))
    }

    pub fn with_sun(sun: LinearSolarTrack) -> Self {
        Self {
            speed: 1.0,
            sun,
            sky: SkyModel::default(),
            detector: SimDetector::default(),
            slew_secs: 20.0,
            filter_change_secs: 3.0,
            readout_secs: 2.0,
        }
    }
}

impl Default for SimulationConfig {
    fn default() -> Self {
        Self::dusk()
    }
}

fn default_origin() -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2024, 3, 20, 18, 0, 0)
        .single()
        .unwrap_or_else(Utc::now)
}

/// Complete simulated setup sharing one clock
pub struct SimulatedObservatory {
    pub clock: Arc<SimulatedClock>,
    pub sun: Arc<LinearSolarTrack>,
    pub telescope: SimTelescope,
    pub filter_wheel: SimFilterWheel,
    pub camera: SimCamera,
    pub image_store: Arc<MemoryImageStore>,
    pub failures: Arc<FailureScript>,
}

impl SimulatedObservatory {
    /// Must be called inside a tokio runtime, the clock starts now
    pub fn new(config: SimulationConfig) -> Self {
        let clock = Arc::new(SimulatedClock::with_speed(config.sun.origin, config.speed));
        let sun = Arc::new(config.sun);
        let failures = Arc::new(FailureScript::default());
        let image_store = Arc::new(MemoryImageStore {
            frames: Mutex::new(HashMap::new()),
            failures: failures.clone(),
        });
        let current_filter = Arc::new(Mutex::new(String::new()));

        let telescope = SimTelescope {
            clock: clock.clone(),
            failures: failures.clone(),
            slew_time: Duration::from_secs_f64(config.slew_secs.max(0.0)),
            position: Mutex::new(None),
            moves: Mutex::new(Vec::new()),
            stopped: AtomicBool::new(false),
        };
        let filter_wheel = SimFilterWheel {
            clock: clock.clone(),
            failures: failures.clone(),
            change_time: Duration::from_secs_f64(config.filter_change_secs.max(0.0)),
            current: current_filter.clone(),
        };
        let camera = SimCamera {
            detector: config.detector,
            sky: config.sky,
            readout_time: Duration::from_secs_f64(config.readout_secs.max(0.0)),
            clock: clock.clone(),
            sun: sun.clone(),
            filter: current_filter,
            store: image_store.clone(),
            failures: failures.clone(),
            settings: Mutex::new(CameraSettings {
                binning: 1,
                window: None,
            }),
            exposures: Mutex::new(Vec::new()),
            aborts: AtomicU32::new(0),
        };

        Self {
            clock,
            sun,
            telescope,
            filter_wheel,
            camera,
            image_store,
            failures,
        }
    }

    pub fn now(&self) -> DateTime<Utc> {
        self.clock.now()
    }

    pub fn sun_altitude(&self) -> f64 {
        self.sun.sun_alt_az(self.clock.now()).altitude_deg
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sky_model_matches_default_function() {
        let sky = SkyModel::default();
        for h in [-2.5, -3.9, -5.0] {
            let exptime = (-0.9 * (h + 3.9f64)).exp();
            let counts = sky.rate(h, "V") * exptime;
            assert!((counts - 29000.0).abs() < 1e-6, "h={h}: {counts}");
        }
    }

    #[test]
    fn test_filter_throughput() {
        let mut sky = SkyModel::default();
        sky.filter_throughput.insert("B".to_string(), 0.5);
        assert!((sky.rate(-3.9, "B") - 14500.0).abs() < 1e-9);
        assert!((sky.rate(-3.9, "unknown") - 29000.0).abs() < 1e-9);
    }

    #[test]
    fn test_linear_solar_track() {
        let track = LinearSolarTrack::dusk(default_origin());
        let later = track.sun_alt_az(default_origin() + chrono::Duration::minutes(10));
        assert!((later.altitude_deg + 2.5).abs() < 1e-9);
        assert!((later.azimuth_deg - 282.0).abs() < 1e-9);
    }

    #[tokio::test(start_paused = true)]
    async fn test_flat_frame_levels() {
        // sun at the reference altitude, so a 1s flat is far from saturation
        let sun = LinearSolarTrack {
            altitude_deg: -3.9,
            ..LinearSolarTrack::dusk(default_origin())
        };
        let obs = SimulatedObservatory::new(SimulationConfig::with_sun(sun));
        obs.filter_wheel.set_filter("V").await.unwrap();

        let bias = obs.camera.expose(0, ImageType::Bias, false).await.unwrap();
        let bias = obs.image_store.download(&bias).await.unwrap();
        assert!((bias.median().unwrap() - 1000.0).abs() <= 15.0);

        let flat = obs.camera.expose(1000, ImageType::SkyFlat, true).await.unwrap();
        let flat = obs.image_store.download(&flat).await.unwrap();
        let altitude = obs.camera.exposures()[1].sun_altitude_deg;
        let expected = 1000.0 + SkyModel::default().rate(altitude, "V");
        let measured = flat.median_in(&crate::PercentRect::new(25.0, 25.0, 75.0, 75.0)).unwrap();
        assert!((measured - expected).abs() < 20.0, "{measured} vs {expected}");

        // the overscan only has bias
        let overscan = flat.median_of(&PixelRect::new(390, 0, 10, 300)).unwrap();
        assert!((overscan - 1000.0).abs() <= 15.0);
        assert_eq!(flat.trimmed_area(), PixelRect::new(0, 0, 384, 300));
    }

    #[tokio::test(start_paused = true)]
    async fn test_binning_and_window() {
        let obs = SimulatedObservatory::new(SimulationConfig::dusk());
        let binning = obs.camera.binning().unwrap();
        let window = obs.camera.window().unwrap();

        binning.set_binning(2, 2).await.unwrap();
        assert_eq!(window.full_frame().await.unwrap(), PixelRect::new(0, 0, 200, 150));
        assert!(window.set_window(PixelRect::new(150, 0, 100, 10)).await.is_err());
        window.set_window(PixelRect::new(90, 67, 20, 15)).await.unwrap();
        assert!(binning.set_binning(2, 1).await.is_err());

        let image = obs.camera.expose(500, ImageType::SkyFlat, false).await.unwrap();
        let frame = obs.image_store.download(&image).await.unwrap();
        assert_eq!((frame.width, frame.height), (20, 15));
        assert_eq!(obs.camera.exposures()[0].binning, 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_scripted_failures() {
        let obs = SimulatedObservatory::new(SimulationConfig::dusk());
        obs.failures.fail_exposures(1);
        obs.failures.fail_downloads(1);
        obs.failures.fail_slews(1);

        assert!(obs.camera.expose(100, ImageType::SkyFlat, false).await.unwrap_err().is_timeout());
        let image = obs.camera.expose(100, ImageType::SkyFlat, false).await.unwrap();
        assert!(obs.image_store.download(&image).await.is_err());
        assert!(obs.image_store.download(&image).await.is_ok());

        let target = HorizontalPosition::new(80.0, 90.0);
        assert!(obs.telescope.point(target).await.is_err());
        obs.telescope.point(target).await.unwrap();
        assert_eq!(obs.telescope.position(), Some(target));
    }

    #[tokio::test(start_paused = true)]
    async fn test_devices_take_simulated_time() {
        let mut config = SimulationConfig::dusk();
        config.speed = 10.0;
        let obs = SimulatedObservatory::new(config);
        let start = obs.now();

        obs.telescope.point(HorizontalPosition::new(80.0, 100.0)).await.unwrap();
        let elapsed = (obs.now() - start).num_milliseconds();
        assert!((20_000..21_000).contains(&elapsed), "elapsed {elapsed}ms");
    }
}
