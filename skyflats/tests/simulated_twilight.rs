//! Whole flat-field runs against the simulated observatory

use nightshade_skyflats::simulation::{LinearSolarTrack, SimulatedObservatory, SimulationConfig};
use nightshade_skyflats::{
    FlatFieldRunner, FlatFieldState, FlatFielder, FlatFielderConfig, ImageType, RunLog, RunnerConfig, Twilight,
};

const FUNCTION: &str = "exp(-0.9*(h+3.9))";

fn runner_for(obs: &SimulatedObservatory, config: FlatFielderConfig) -> FlatFieldRunner {
    let fielder = FlatFielder::new(config, obs.sun.clone(), obs.clock.clone(), obs.image_store.clone()).unwrap();
    FlatFieldRunner::new(fielder, RunnerConfig::default())
}

#[tokio::test(start_paused = true)]
async fn dusk_run_stores_requested_flats() {
    let dir = tempfile::tempdir().unwrap();
    let log_path = dir.path().join("flats").join("dusk.csv");
    let config = FlatFielderConfig {
        log_path: Some(log_path.clone()),
        ..FlatFielderConfig::default().with_function("R", FUNCTION)
    };

    let obs = SimulatedObservatory::new(SimulationConfig::dusk());
    let mut runner = runner_for(&obs, config);
    let summary = runner
        .run(&obs.telescope, &obs.camera, &obs.filter_wheel, "R", 12, 2)
        .await
        .unwrap();

    assert_eq!(summary.final_state, FlatFieldState::Finished);
    assert_eq!(summary.images_done, 12);
    assert_eq!(runner.fielder().twilight(), Some(Twilight::Dusk));
    assert_eq!(obs.filter_wheel.current(), "R");

    // stored flats are broadcast, used the requested binning and stayed in range
    let flats = obs.camera.exposures_of(ImageType::SkyFlat);
    let stored: Vec<_> = flats.iter().filter(|e| e.broadcast).collect();
    assert!(stored.len() >= 12);
    assert!(stored.iter().all(|e| e.binning == 2 && e.filter == "R"));
    assert!(stored.iter().all(|e| (500..=5000).contains(&e.exposure_time_ms)));
    assert!(flats.iter().any(|e| !e.broadcast), "no test exposures taken");

    // one row per stored flat, in time order, with the sun going down
    let rows = RunLog::new(&log_path).read_all().unwrap();
    assert_eq!(rows.len(), 12);
    assert!(rows.windows(2).all(|w| w[0].datetime < w[1].datetime));
    assert!(rows.windows(2).all(|w| w[0].solalt > w[1].solalt));
    assert!(rows.iter().all(|r| r.binning == 2 && r.filter == "R" && r.counts == 30000.0));
    let total: f64 = rows.iter().map(|r| r.exptime).sum();
    assert!((total - summary.total_exposure_time_secs).abs() < 1e-6);
}

#[tokio::test(start_paused = true)]
async fn dawn_run_from_json_configuration() {
    let dir = tempfile::tempdir().unwrap();
    let log_path = dir.path().join("dawn.csv");
    let config_path = dir.path().join("skyflats.json");
    let json = serde_json::json!({
        "functions": { "B": FUNCTION },
        "min_exptime": 1.0,
        "max_exptime": 8.0,
        "pointing": { "type": "static", "altitude_deg": 75.0, "azimuth_deg": 250.0 },
        "log_path": log_path,
        "wait_interval_secs": 5.0
    });
    std::fs::write(&config_path, serde_json::to_string_pretty(&json).unwrap()).unwrap();
    let config = FlatFielderConfig::from_json_file(&config_path).unwrap();

    let obs = SimulatedObservatory::new(SimulationConfig::dawn());
    let mut runner = runner_for(&obs, config);
    let summary = runner
        .run(&obs.telescope, &obs.camera, &obs.filter_wheel, "B", 8, 1)
        .await
        .unwrap();

    assert_eq!(summary.final_state, FlatFieldState::Finished);
    assert_eq!(summary.images_done, 8);
    assert_eq!(runner.fielder().twilight(), Some(Twilight::Dawn));

    // static pointing: one slew for the whole run
    let moves = obs.telescope.moves();
    assert_eq!(moves.len(), 1);
    assert_eq!(moves[0].azimuth_deg, 250.0);

    // the sky brightens, so exposure times get shorter
    let rows = RunLog::new(&log_path).read_all().unwrap();
    assert_eq!(rows.len(), 8);
    assert!(rows.windows(2).all(|w| w[0].solalt < w[1].solalt));
    assert!(rows[0].exptime > rows[7].exptime);
    assert!(rows.iter().all(|r| (1.0..=8.0).contains(&r.exptime)));
}

#[tokio::test(start_paused = true)]
async fn late_start_finishes_without_exposing() {
    let sun = LinearSolarTrack {
        altitude_deg: -7.0,
        ..LinearSolarTrack::dusk(SimulationConfig::dusk().sun.origin)
    };
    let obs = SimulatedObservatory::new(SimulationConfig::with_sun(sun));
    let mut runner = runner_for(&obs, FlatFielderConfig::default().with_function("V", FUNCTION));

    let summary = runner
        .run(&obs.telescope, &obs.camera, &obs.filter_wheel, "V", 10, 1)
        .await
        .unwrap();

    assert_eq!(summary.final_state, FlatFieldState::Finished);
    assert_eq!(summary.images_done, 0);
    assert!(obs.camera.exposures().is_empty());
    assert!(obs.telescope.moves().is_empty());
}

#[tokio::test(start_paused = true)]
async fn device_failures_do_not_stop_the_run() {
    let obs = SimulatedObservatory::new(SimulationConfig::dusk());
    obs.failures.fail_exposures(2);
    obs.failures.fail_downloads(1);
    obs.failures.fail_slews(1);
    obs.failures.fail_filter_changes(1);

    let mut runner = runner_for(&obs, FlatFielderConfig::default().with_function("V", FUNCTION));
    let summary = runner
        .run(&obs.telescope, &obs.camera, &obs.filter_wheel, "V", 6, 1)
        .await
        .unwrap();

    assert_eq!(summary.final_state, FlatFieldState::Finished);
    assert_eq!(summary.images_done, 6);
    assert!(!summary.aborted);
    // the bias frame had to be repeated
    assert!(obs.camera.exposures_of(ImageType::Bias).len() > 1);
    assert!(runner.fielder().bias_level().is_some());
}

#[tokio::test(start_paused = true)]
async fn runner_can_be_reused_for_another_filter() {
    let config = FlatFielderConfig::default()
        .with_function("V", FUNCTION)
        .with_function("B", "exp(-0.9*(h+3.7))");
    let obs = SimulatedObservatory::new(SimulationConfig::dusk());
    let mut runner = runner_for(&obs, config);

    let first = runner
        .run(&obs.telescope, &obs.camera, &obs.filter_wheel, "B", 4, 1)
        .await
        .unwrap();
    let second = runner
        .run(&obs.telescope, &obs.camera, &obs.filter_wheel, "V", 4, 1)
        .await
        .unwrap();

    assert_eq!(first.images_done, 4);
    assert_eq!(second.images_done, 4);
    assert_eq!(obs.filter_wheel.current(), "V");
    // every run measures its own bias
    assert_eq!(obs.camera.exposures_of(ImageType::Bias).len(), 2);
}
