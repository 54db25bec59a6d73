//! Driving loop for a flat-field run
//!
//! Calls [`FlatFielder::step`] until the run is finished, aborted or has
//! taken too long, then parks the telescope.

use crate::abort::AbortToken;
use crate::config::RunnerConfig;
use crate::device_ops::{Camera, FilterWheel, Telescope};
use crate::error::{Result, SkyFlatsError};
use crate::flat_fielder::FlatFielder;
use crate::FlatFieldState;
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Outcome of a run
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FlatFieldSummary {
    pub final_state: FlatFieldState,
    pub images_done: u32,
    pub total_exposure_time_secs: f64,
    /// Run was aborted, by request or because it took too long
    pub aborted: bool,
    pub timed_out: bool,
}

pub struct FlatFieldRunner {
    fielder: FlatFielder,
    config: RunnerConfig,
}

impl FlatFieldRunner {
    pub fn new(fielder: FlatFielder, config: RunnerConfig) -> Self {
        Self { fielder, config }
    }

    pub fn fielder(&self) -> &FlatFielder {
        &self.fielder
    }

    /// Abort the run from elsewhere
    pub fn abort_token(&self) -> AbortToken {
        self.fielder.abort_token()
    }

    /// Take `count` flats in `filter` at `binning`.
    ///
    /// Only fails if there is no exposure time function for `filter`; device
    /// problems are handled inside the steps.
    pub async fn run(
        &mut self,
        telescope: &dyn Telescope,
        camera: &dyn Camera,
        filter_wheel: &dyn FilterWheel,
        filter: &str,
        count: u32,
        binning: u32,
    ) -> Result<FlatFieldSummary> {
        if !self.fielder.has_model(filter) {
            return Err(SkyFlatsError::UnknownFilter(filter.to_string()));
        }

        self.fielder.reset();
        let token = self.fielder.abort_token();

        tracing::info!(
            "Starting sky flats: {} x {} at {}x{} binning",
            count,
            filter,
            binning,
            binning
        );

        let max_duration = Duration::from_secs(self.config.max_duration_secs);
        let deadline = tokio::time::Instant::now() + max_duration;
        let watchdog = {
            let token = token.clone();
            tokio::spawn(async move {
                tokio::time::sleep_until(deadline).await;
                tracing::warn!("Flat fielding did not finish within {}s, aborting...", max_duration.as_secs());
                token.abort();
            })
        };

        let step_interval = Duration::from_millis(self.config.step_interval_ms);
        let mut state = self.fielder.state();
        while !token.is_aborted() {
            state = self
                .fielder
                .step(telescope, camera, filter_wheel, filter, count, binning)
                .await;
            if state == FlatFieldState::Finished {
                break;
            }
            token.sleep(step_interval).await;
        }
        watchdog.abort();

        let aborted = token.is_aborted();
        let timed_out = aborted && tokio::time::Instant::now() >= deadline;
        if aborted && !timed_out {
            tracing::info!("Flat fielding aborted in state {}", state);
        }
        token.clear();

        if self.config.stop_telescope {
            if let Err(e) = telescope.stop_motion().await {
                tracing::warn!("Failed to stop telescope: {}", e);
            }
        }

        let summary = FlatFieldSummary {
            final_state: state,
            images_done: self.fielder.images_done(),
            total_exposure_time_secs: self.fielder.total_exposure_time(),
            aborted,
            timed_out,
        };
        tracing::info!(
            "Sky flats done: {} images, {:.1}s total exposure time",
            summary.images_done,
            summary.total_exposure_time_secs
        );
        Ok(summary)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::FlatFielderConfig;
    use crate::simulation::{SimulatedObservatory, SimulationConfig};
    use crate::ImageType;

    fn fielder(obs: &SimulatedObservatory) -> FlatFielder {
        let config = FlatFielderConfig::default().with_function("V", "exp(-0.9*(h+3.9))");
        FlatFielder::new(config, obs.sun.clone(), obs.clock.clone(), obs.image_store.clone()).unwrap()
    }

    #[tokio::test(start_paused = true)]
    async fn test_unknown_filter_is_rejected() {
        let obs = SimulatedObservatory::new(SimulationConfig::dusk());
        let mut runner = FlatFieldRunner::new(fielder(&obs), RunnerConfig::default());
        let result = runner
            .run(&obs.telescope, &obs.camera, &obs.filter_wheel, "Ha", 5, 1)
            .await;
        assert!(matches!(result, Err(SkyFlatsError::UnknownFilter(f)) if f == "Ha"));
        assert!(obs.camera.exposures().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_dusk_run_completes() {
        let obs = SimulatedObservatory::new(SimulationConfig::dusk());
        let mut runner = FlatFieldRunner::new(fielder(&obs), RunnerConfig::default());

        let summary = runner
            .run(&obs.telescope, &obs.camera, &obs.filter_wheel, "V", 10, 1)
            .await
            .unwrap();

        assert_eq!(summary.final_state, FlatFieldState::Finished);
        assert_eq!(summary.images_done, 10);
        assert!(!summary.aborted);
        assert!(!summary.timed_out);
        assert!(obs.telescope.is_stopped());
        assert_eq!(obs.camera.exposures_of(ImageType::Bias).len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_run_times_out() {
        let obs = SimulatedObservatory::new(SimulationConfig::dusk());
        let config = RunnerConfig {
            max_duration_secs: 60,
            ..Default::default()
        };
        let mut runner = FlatFieldRunner::new(fielder(&obs), config);

        // the sky is still far too bright after one minute
        let summary = runner
            .run(&obs.telescope, &obs.camera, &obs.filter_wheel, "V", 10, 1)
            .await
            .unwrap();

        assert_eq!(summary.final_state, FlatFieldState::Waiting);
        assert!(summary.aborted);
        assert!(summary.timed_out);
        assert_eq!(summary.images_done, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_abort_from_outside() {
        let obs = SimulatedObservatory::new(SimulationConfig::dusk());
        let mut runner = FlatFieldRunner::new(fielder(&obs), RunnerConfig::default());
        let token = runner.abort_token();

        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_secs(120)).await;
            token.abort();
        });

        let summary = runner
            .run(&obs.telescope, &obs.camera, &obs.filter_wheel, "V", 10, 1)
            .await
            .unwrap();
        assert!(summary.aborted);
        assert!(!summary.timed_out);
        assert_ne!(summary.final_state, FlatFieldState::Finished);
        assert!(obs.telescope.is_stopped());
    }

    #[tokio::test(start_paused = true)]
    async fn test_abort_before_run_is_honoured() {
        let obs = SimulatedObservatory::new(SimulationConfig::dusk());
        let mut runner = FlatFieldRunner::new(fielder(&obs), RunnerConfig::default());
        runner.abort_token().abort();

        let summary = runner
            .run(&obs.telescope, &obs.camera, &obs.filter_wheel, "V", 10, 1)
            .await
            .unwrap();
        assert!(summary.aborted);
        assert_eq!(summary.final_state, FlatFieldState::Init);
        assert!(obs.camera.exposures().is_empty());

        // the flag is cleared once the run is over
        assert!(!runner.abort_token().is_aborted());
        let summary = runner
            .run(&obs.telescope, &obs.camera, &obs.filter_wheel, "V", 3, 1)
            .await
            .unwrap();
        assert!(!summary.aborted);
        assert_eq!(summary.images_done, 3);
    }
}
