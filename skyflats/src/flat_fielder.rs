//! Sky flat-field state machine
//!
//! [`FlatFielder::step`] performs one unit of work per call:
//!
//! | State    | Work                                                | Next                         |
//! |----------|-----------------------------------------------------|------------------------------|
//! | INIT     | window check, binning, bias, twilight, point+filter | WAITING / FINISHED           |
//! | WAITING  | evaluate exposure time function (wide band)         | WAITING / TESTING / FINISHED |
//! | TESTING  | test exposure in sub-window, adapt exposure time    | TESTING / RUNNING / FINISHED |
//! | RUNNING  | re-point, stored exposure, adapt, log               | TESTING / RUNNING / FINISHED |
//! | FINISHED | nothing                                             | FINISHED                     |
//!
//! Device failures never escape a step: the frame is dropped, the failure is
//! logged and the same state is tried again on the next call.

use crate::abort::{AbortToken, WaitOutcome};
use crate::clock::Clock;
use crate::config::{DeviationPolicy, FlatFielderConfig};
use crate::device_ops::{wait_all, Camera, FilterWheel, ImageRef, ImageStore, Telescope};
use crate::ephemeris::{twilight_direction, SolarEphemeris};
use crate::error::Result;
use crate::exposure::{classify, ExposureFeedback, FrameAnalysis, TimingWindow};
use crate::expression::ExposureModel;
use crate::image::FrameData;
use crate::pointing::SkyFlatsPointing;
use crate::run_log::{LogRow, RunLog};
use crate::{FlatFieldState, ImageType, Twilight};
use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

/// Mutable state of one calibration run
#[derive(Debug, Clone)]
struct RunState {
    state: FlatFieldState,
    twilight: Option<Twilight>,
    filter: String,
    binning: u32,
    exposures_requested: u32,
    /// Current exposure time in seconds
    exptime: f64,
    bias_level: Option<f64>,
    last_median: Option<f64>,
    exposures_done: u32,
    /// Seconds of stored exposures
    exptime_done: f64,
}

impl Default for RunState {
    fn default() -> Self {
        Self {
            state: FlatFieldState::Init,
            twilight: None,
            filter: String::new(),
            binning: 1,
            exposures_requested: 0,
            exptime: 0.0,
            bias_level: None,
            last_median: None,
            exposures_done: 0,
            exptime_done: 0.0,
        }
    }
}

/// Automated sky flat fielding.
///
/// Not safe for concurrent `step()` calls; the driving loop owns the
/// instance and calls it sequentially.
pub struct FlatFielder {
    config: FlatFielderConfig,
    models: HashMap<String, ExposureModel>,
    feedback: ExposureFeedback,
    pointing: Box<dyn SkyFlatsPointing>,
    ephemeris: Arc<dyn SolarEphemeris>,
    clock: Arc<dyn Clock>,
    image_store: Arc<dyn ImageStore>,
    run_log: Option<RunLog>,
    abort: AbortToken,
    run: RunState,
}

impl FlatFielder {
    /// Create a flat fielder, compiling the exposure time function of every filter.
    ///
    /// Fails if the configuration is invalid or any function does not compile.
    pub fn new(
        config: FlatFielderConfig,
        ephemeris: Arc<dyn SolarEphemeris>,
        clock: Arc<dyn Clock>,
        image_store: Arc<dyn ImageStore>,
    ) -> Result<Self> {
        config.validate()?;

        let mut models = HashMap::new();
        for (filter, function) in &config.functions {
            let model = ExposureModel::compile(filter, function)?;
            tracing::debug!("Exposure time function for filter {}: {}", filter, model);
            models.insert(filter.clone(), model);
        }

        let feedback = ExposureFeedback {
            target_count: config.target_count,
            min_counts: config.min_counts,
            allowed_offset_frac: config.allowed_offset_frac,
        };
        let pointing = config.pointing.build(ephemeris.clone());
        let run_log = config.log_path.as_ref().map(RunLog::new);

        Ok(Self {
            config,
            models,
            feedback,
            pointing,
            ephemeris,
            clock,
            image_store,
            run_log,
            abort: AbortToken::new(),
            run: RunState::default(),
        })
    }

    /// Run the next step of the state machine and return the resulting state.
    ///
    /// `filter_name`, `count` and `binning` describe the active request and
    /// are expected to stay the same for a whole run.
    pub async fn step(
        &mut self,
        telescope: &dyn Telescope,
        camera: &dyn Camera,
        filter_wheel: &dyn FilterWheel,
        filter_name: &str,
        count: u32,
        binning: u32,
    ) -> FlatFieldState {
        self.run.filter = filter_name.to_string();
        self.run.binning = binning.max(1);
        self.run.exposures_requested = count;

        match self.run.state {
            FlatFieldState::Init => self.init_system(telescope, camera, filter_wheel).await,
            FlatFieldState::Waiting => self.wait().await,
            FlatFieldState::Testing => self.testing(camera).await,
            FlatFieldState::Running => self.flat_field(telescope, camera).await,
            FlatFieldState::Finished => {}
        }

        self.run.state
    }

    /// Start over: back to INIT with progress, bias and twilight forgotten.
    ///
    /// A pending abort is kept, so an abort requested before a run starts
    /// still stops it.
    pub fn reset(&mut self) {
        self.run = RunState::default();
        self.pointing.reset();
    }

    /// Request abort. The current step completes, pending waits return early
    pub fn abort(&self) {
        tracing::info!("Aborting flat fielding...");
        self.abort.abort();
    }

    /// Token shared with whoever may abort the run.
    ///
    /// Once aborted it stays aborted until [`AbortToken::clear`] is called;
    /// [`FlatFieldRunner::run`](crate::FlatFieldRunner::run) clears it when
    /// the run ends.
    pub fn abort_token(&self) -> AbortToken {
        self.abort.clone()
    }

    pub fn state(&self) -> FlatFieldState {
        self.run.state
    }

    pub fn images_done(&self) -> u32 {
        self.run.exposures_done
    }

    /// Total exposure time of stored flats in seconds
    pub fn total_exposure_time(&self) -> f64 {
        self.run.exptime_done
    }

    pub fn twilight(&self) -> Option<Twilight> {
        self.run.twilight
    }

    /// Current exposure time in seconds
    pub fn exptime(&self) -> f64 {
        self.run.exptime
    }

    pub fn bias_level(&self) -> Option<f64> {
        self.run.bias_level
    }

    pub fn last_median(&self) -> Option<f64> {
        self.run.last_median
    }

    pub fn has_model(&self, filter: &str) -> bool {
        self.models.contains_key(filter)
    }

    // =========================================================================
    // STATES
    // =========================================================================

    async fn init_system(&mut self, telescope: &dyn Telescope, camera: &dyn Camera, filter_wheel: &dyn FilterWheel) {
        if self.run.twilight.is_none() {
            let lookahead = chrono::Duration::minutes(self.config.twilight_lookahead_mins);
            let twilight = twilight_direction(self.ephemeris.as_ref(), self.clock.now(), lookahead);
            tracing::info!("We are currently in {} twilight.", twilight);
            self.run.twilight = Some(twilight);
        }

        if !self.update_exptime_from_model() {
            return;
        }
        if self.wide_band() == TimingWindow::TooLate {
            tracing::info!("Missed flat-fielding time, finishing task...");
            self.finish();
            return;
        }
        tracing::info!("Flat-field time is still coming, keep going...");

        if let Some(binning) = camera.binning() {
            let b = self.run.binning;
            tracing::info!("Setting binning to {}x{}...", b, b);
            if let Err(e) = binning.set_binning(b, b).await {
                tracing::warn!("Failed to set binning, retrying: {}", e);
                return;
            }
        }

        if self.run.bias_level.is_none() {
            match self.measure_bias(camera).await {
                Some(level) => self.run.bias_level = Some(level),
                None => {
                    tracing::warn!("No BIAS level available, cannot continue yet");
                    return;
                }
            }
        }

        tracing::info!("Setting filter to {}...", self.run.filter);
        let now = self.clock.now();
        let prepare = wait_all(
            self.pointing.point(telescope, now),
            filter_wheel.set_filter(&self.run.filter),
        );
        match self.abort.wait_for(prepare, None).await {
            WaitOutcome::Completed(Ok(())) => {}
            WaitOutcome::Completed(Err(e)) => {
                tracing::error!("Failed to move telescope or set filter: {}", e);
                return;
            }
            WaitOutcome::Cancelled | WaitOutcome::TimedOut => {
                tracing::warn!("Initialisation aborted");
                return;
            }
        }
        tracing::info!("Finished initializing system.");

        tracing::info!("Waiting for flat-field time...");
        self.run.state = FlatFieldState::Waiting;
    }

    async fn wait(&mut self) {
        if !self.update_exptime_from_model() {
            return;
        }

        match self.wide_band() {
            TimingWindow::TooEarly => {
                tracing::info!("Sleeping a little...");
                self.sleep().await;
            }
            TimingWindow::InRange => {
                tracing::info!("Starting to take test flat-fields...");
                self.run.state = FlatFieldState::Testing;
            }
            TimingWindow::TooLate => {
                tracing::info!("Missed flat-fielding time, finishing task...");
                self.finish();
            }
        }
    }

    async fn testing(&mut self, camera: &dyn Camera) {
        if !self.set_window(camera, true).await {
            return;
        }

        tracing::info!("Exposing test flat field for {:.2}s...", self.run.exptime);
        let image = match self.expose(camera, self.run.exptime, ImageType::SkyFlat, false).await {
            Some(image) => image,
            None => return,
        };

        match self.analyse_image(&image).await {
            None | Some(FrameAnalysis::LowSignal { .. }) => return,
            Some(_) => {}
        }

        match self.narrow_band() {
            TimingWindow::TooEarly => {
                tracing::info!("Sleeping a little...");
                self.sleep().await;
            }
            TimingWindow::InRange => {
                tracing::info!("Starting to store flat-fields...");
                self.run.state = FlatFieldState::Running;
            }
            TimingWindow::TooLate => {
                tracing::info!("Missed flat-fielding time, finishing task...");
                self.finish();
            }
        }
    }

    async fn flat_field(&mut self, telescope: &dyn Telescope, camera: &dyn Camera) {
        if self.run.exposures_done >= self.run.exposures_requested {
            tracing::info!("Finished all requested flat-fields.");
            self.finish();
            return;
        }

        if !self.set_window(camera, false).await {
            return;
        }

        let now = self.clock.now();
        match self.abort.wait_for(self.pointing.point(telescope, now), None).await {
            WaitOutcome::Completed(Ok(())) => {}
            WaitOutcome::Completed(Err(e)) => {
                tracing::error!("Failed to move telescope: {}", e);
                return;
            }
            WaitOutcome::Cancelled | WaitOutcome::TimedOut => {
                tracing::warn!("Pointing aborted");
                return;
            }
        }

        let started = self.clock.now();
        let exptime = self.run.exptime;
        tracing::info!(
            "Exposing flat field {}/{} for {:.2}s...",
            self.run.exposures_done + 1,
            self.run.exposures_requested,
            exptime
        );
        let image = match self.expose(camera, exptime, ImageType::SkyFlat, true).await {
            Some(image) => image,
            None => return,
        };

        let analysis = match self.analyse_image(&image).await {
            None | Some(FrameAnalysis::LowSignal { .. }) => return,
            Some(analysis) => analysis,
        };
        let stored = match analysis {
            FrameAnalysis::Deviating { .. } => self.config.deviation_policy == DeviationPolicy::Accept,
            _ => true,
        };

        if stored {
            self.run.exposures_done += 1;
            self.run.exptime_done += exptime;
            self.write_log(started, exptime);

            if self.run.exposures_done >= self.run.exposures_requested {
                tracing::info!("Finished all requested flat-fields.");
                self.finish();
                return;
            }
        } else {
            tracing::info!(
                "Flat field with median of {:.0} not stored, retrying with new exposure time...",
                analysis.median()
            );
        }

        match self.narrow_band() {
            TimingWindow::TooEarly => {
                tracing::info!("Going back to testing...");
                self.run.state = FlatFieldState::Testing;
            }
            TimingWindow::InRange => {}
            TimingWindow::TooLate => {
                tracing::info!("Missed flat-fielding time, finishing task...");
                self.finish();
            }
        }
    }

    // =========================================================================
    // HELPERS
    // =========================================================================

    fn finish(&mut self) {
        self.run.state = FlatFieldState::Finished;
    }

    /// Set the exposure time from the model for the current filter.
    ///
    /// Finishes the run and returns false if that is impossible.
    fn update_exptime_from_model(&mut self) -> bool {
        let model = match self.models.get(&self.run.filter) {
            Some(model) => model,
            None => {
                tracing::error!("No exposure time function for filter {}, finishing task...", self.run.filter);
                self.finish();
                return false;
            }
        };

        let sun = self.ephemeris.sun_alt_az(self.clock.now());
        let binning = self.run.binning as f64;
        let exptime = model.evaluate(sun.altitude_deg) / (binning * binning);

        if !exptime.is_finite() {
            tracing::error!(
                "Exposure time function '{}' gives {} at solar elevation of {:.2}°, finishing task...",
                model,
                exptime,
                sun.altitude_deg
            );
            self.finish();
            return false;
        }

        tracing::info!(
            "Calculated optimal exposure time of {:.2}s in {}x{} at solar elevation of {:.2}°.",
            exptime,
            self.run.binning,
            self.run.binning,
            sun.altitude_deg
        );
        self.run.exptime = exptime;
        true
    }

    fn timing(&self, min_exptime: f64, max_exptime: f64) -> TimingWindow {
        match self.run.twilight {
            Some(twilight) => classify(twilight, self.run.exptime, min_exptime, max_exptime),
            None => TimingWindow::InRange,
        }
    }

    /// Tolerant band used while waiting for the flat-field window
    fn wide_band(&self) -> TimingWindow {
        self.timing(self.config.min_exptime * 0.5, self.config.max_exptime * 2.0)
    }

    fn narrow_band(&self) -> TimingWindow {
        self.timing(self.config.min_exptime, self.config.max_exptime)
    }

    async fn sleep(&self) {
        let interval = Duration::from_secs_f64(self.config.wait_interval_secs);
        if self.abort.sleep(interval).await.is_cancelled() {
            tracing::debug!("Sleep interrupted by abort");
        }
    }

    async fn measure_bias(&self, camera: &dyn Camera) -> Option<f64> {
        tracing::info!("Taking BIAS image to determine median level...");

        if !self.set_window(camera, false).await {
            return None;
        }
        let image = self.expose(camera, 0.0, ImageType::Bias, false).await?;
        let frame = self.download(&image).await?;

        match frame.median() {
            Some(level) => {
                tracing::info!("Found median BIAS level of {:.2}...", level);
                Some(level)
            }
            None => {
                tracing::warn!("BIAS image {} contains no pixels", image);
                None
            }
        }
    }

    /// Set the camera window to the test frame or the full frame.
    ///
    /// Cameras without windowing are skipped. Returns false on failure.
    async fn set_window(&self, camera: &dyn Camera, testing: bool) -> bool {
        let window = match camera.window() {
            Some(window) => window,
            None => return true,
        };

        let full_frame = match window.full_frame().await {
            Ok(frame) => frame,
            Err(e) => {
                tracing::warn!("Failed to get full frame: {}", e);
                return false;
            }
        };
        let target = if testing {
            self.config.test_frame.within(&full_frame)
        } else {
            full_frame
        };

        tracing::info!(
            "Setting camera window to {}x{} at {},{}...",
            target.width,
            target.height,
            target.left,
            target.top
        );
        match window.set_window(target).await {
            Ok(()) => true,
            Err(e) => {
                tracing::warn!("Failed to set camera window: {}", e);
                false
            }
        }
    }

    /// Expose, requesting the camera to abort if the run is aborted meanwhile
    async fn expose(&self, camera: &dyn Camera, exptime: f64, image_type: ImageType, broadcast: bool) -> Option<ImageRef> {
        let exposure_time_ms = (exptime * 1000.0) as u64;
        match self
            .abort
            .wait_for(camera.expose(exposure_time_ms, image_type, broadcast), None)
            .await
        {
            WaitOutcome::Completed(Ok(image)) => Some(image),
            WaitOutcome::Completed(Err(e)) if e.is_timeout() => {
                tracing::warn!("Exposure timed out, discarding frame: {}", e);
                None
            }
            WaitOutcome::Completed(Err(e)) => {
                tracing::error!("Exposure failed: {}", e);
                None
            }
            WaitOutcome::Cancelled | WaitOutcome::TimedOut => {
                tracing::warn!("Exposure aborted");
                if let Err(e) = camera.abort_exposure().await {
                    tracing::warn!("Failed to abort exposure: {}", e);
                }
                None
            }
        }
    }

    async fn download(&self, image: &ImageRef) -> Option<FrameData> {
        match self.image_store.download(image).await {
            Ok(frame) => Some(frame),
            Err(e) => {
                tracing::warn!("Could not download image {}: {}", image, e);
                None
            }
        }
    }

    /// Measure a flat and adapt the exposure time. `None` if the image could
    /// not be measured at all.
    async fn analyse_image(&mut self, image: &ImageRef) -> Option<FrameAnalysis> {
        let frame = self.download(image).await?;
        let median = match frame.median_in(&self.config.counts_frame) {
            Some(median) => median,
            None => {
                tracing::warn!("Counts frame of image {} contains no pixels", image);
                return None;
            }
        };
        self.run.last_median = Some(median);
        tracing::info!("Got a flat field with median counts of {:.2}.", median);

        let bias_level = self.run.bias_level.unwrap_or(0.0);
        let analysis = self.feedback.analyse(median, bias_level, self.run.exptime);

        match analysis {
            FrameAnalysis::LowSignal { median } => {
                tracing::warn!(
                    "Median counts ({:.0}) too low, retrying last image with same exposure time...",
                    median
                );
            }
            FrameAnalysis::Deviating { deviation, factor, .. } => {
                tracing::warn!(
                    "Deviation from target count ({:.1}%) is larger than allowed ({:.1}%).",
                    deviation * 100.0,
                    self.config.allowed_offset_frac * 100.0
                );
                tracing::debug!("Exposure time correction factor {:.3}", factor);
            }
            FrameAnalysis::Usable { factor, .. } => {
                tracing::debug!("Exposure time correction factor {:.3}", factor);
            }
        }

        if let Some(exptime) = analysis.next_exptime() {
            tracing::info!("Calculated new exposure time to be {:.2}s.", exptime);
            self.run.exptime = exptime;
        }
        Some(analysis)
    }

    fn write_log(&self, started: DateTime<Utc>, exptime: f64) {
        let log = match &self.run_log {
            Some(log) => log,
            None => return,
        };

        let sun = self.ephemeris.sun_alt_az(started);
        let row = LogRow {
            datetime: started,
            solalt: sun.altitude_deg,
            exptime,
            counts: self.config.target_count,
            filter: self.run.filter.clone(),
            binning: self.run.binning,
        };
        if let Err(e) = log.append(row) {
            tracing::error!("Could not write flat-field log {}: {}", log.path().display(), e);
        }
    }
}
