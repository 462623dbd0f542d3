//! Integration tests for the window controller and its reports.
//!
//! This test validates:
//! 1. One batch window and two half-overlapping incremental windows over the
//!    same data agree on the static parameters
//! 2. Cancelled windows do not move the carried estimate
//! 3. Per-window parameter and covariance reports land on disk as JSON
//! 4. Configuration loading from a file
//! 5. Rear-axle data under the default configuration solves with the front
//!    geometry held at its initial value

use egocalib_core::synthetic::vehicle::uniform_stamps;
use egocalib_core::synthetic::VehicleScenario;
use egocalib_core::{Axle, Extrinsic, PoseMeasurement, WheelMeasurement, WheelOdometryParams};
use egocalib_optim::{CancelToken, NonHolonomicNoise, SolveStatus};
use egocalib_pipeline::*;

enum Record {
    Pose(PoseMeasurement),
    Wheel(WheelMeasurement),
}

impl Record {
    fn timestamp(&self) -> f64 {
        match self {
            Record::Pose(p) => p.timestamp,
            Record::Wheel(w) => w.timestamp,
        }
    }
}

/// Both streams over `0..11.9 s`, merged in time order. Front and rear records
/// share stamps, so they are offset to keep the odometry stream increasing.
fn records(scenario: &VehicleScenario) -> Vec<Record> {
    let rear: Vec<f64> = (0..121).map(|k| 0.1 + k as f64 * 0.097).collect();
    let front: Vec<f64> = rear.iter().map(|t| t + 0.031).collect();
    let mut out: Vec<Record> = scenario
        .pose_measurements(&uniform_stamps(0.0, 0.1, 120))
        .into_iter()
        .map(Record::Pose)
        .collect();
    out.extend(scenario.wheel_measurements(&rear, Axle::Rear).into_iter().map(Record::Wheel));
    out.extend(scenario.wheel_measurements(&front, Axle::Front).into_iter().map(Record::Wheel));
    out.sort_by(|a, b| a.timestamp().total_cmp(&b.timestamp()));
    out
}

fn options(mode: WindowMode, duration: f64) -> CalibratorOptions {
    let mut opts = CalibratorOptions {
        window_duration: duration,
        verbose: false,
        front_wheels: true,
        window: WindowConfig {
            mode,
            ..WindowConfig::default()
        },
        ..CalibratorOptions::default()
    };
    opts.splines.knots_per_second = 4.0;
    opts.odometry.constraints = NonHolonomicNoise {
        vy_variance: 1e-2,
        vz_variance: 1e-2,
    };
    opts
}

fn initial(truth: &WheelOdometryParams) -> CalibrationEstimate {
    let wheels = WheelOdometryParams {
        rear_half_track: truth.rear_half_track + 0.02,
        rear_left_radius: 0.31,
        rear_right_radius: 0.31,
        front_left_radius: 0.31,
        front_right_radius: 0.31,
        ..*truth
    };
    CalibrationEstimate::new(wheels, Extrinsic::identity())
}

fn run(ctl: &mut WindowController, data: Vec<Record>) -> Vec<WindowOutcome> {
    let mut outcomes = Vec::new();
    for record in data {
        let solved = match record {
            Record::Pose(p) => ctl.push_pose(p),
            Record::Wheel(w) => ctl.push_wheel(w),
        }
        .unwrap();
        outcomes.extend(solved);
    }
    outcomes.extend(ctl.flush().unwrap());
    outcomes
}

#[test]
fn incremental_windows_agree_with_one_batch() {
    let scenario = VehicleScenario::default();

    let mut batch = WindowController::new(
        &options(WindowMode::Batch, 100.0),
        initial(&scenario.wheels),
    )
    .unwrap();
    let batch_out = run(&mut batch, records(&scenario));
    assert_eq!(batch_out.len(), 1);
    assert_eq!(batch_out[0].status(), SolveStatus::Converged);

    let mut incremental = WindowController::new(
        &options(WindowMode::Incremental { retain: 4.0 }, 8.0),
        initial(&scenario.wheels),
    )
    .unwrap();
    let inc_out = run(&mut incremental, records(&scenario));
    assert_eq!(inc_out.len(), 2);
    assert_eq!(inc_out[0].index, 0);
    assert_eq!(inc_out[1].index, 1);
    assert!(inc_out[0].span.0.abs() < 1e-12);
    assert!((inc_out[0].span.1 - 8.0).abs() < 0.11);
    assert!((inc_out[1].span.0 - 4.0).abs() < 0.11, "{:?}", inc_out[1].span);
    assert!(inc_out.iter().all(|o| o.status() == SolveStatus::Converged));
    assert_eq!(incremental.buffered(), (0, 0));

    let a = batch.estimate();
    let b = incremental.estimate();
    assert!(
        (a.odometry_delay - b.odometry_delay).abs() < 0.003,
        "delay {} vs {}",
        a.odometry_delay,
        b.odometry_delay
    );
    assert!((a.odometry_delay - scenario.odometry_delay).abs() < 0.005);
    for (x, y) in [
        (a.wheels.rear_left_radius, b.wheels.rear_left_radius),
        (a.wheels.rear_right_radius, b.wheels.rear_right_radius),
        (a.wheels.rear_half_track, b.wheels.rear_half_track),
        (a.wheels.front_left_radius, b.wheels.front_left_radius),
    ] {
        assert!((x - y).abs() < 0.005, "{x} vs {y}");
    }
    let dt = (a.extrinsic.translation - b.extrinsic.translation).abs();
    assert!(dt.max() < 0.02, "translation {dt:?}");

    // Estimates carry forward: window 1 starts where window 0 ended.
    let first = &inc_out[0].calibration;
    assert!((first.odometry_delay - scenario.odometry_delay).abs() < 0.01);
    assert!(inc_out[1].sum_log_diag_r.is_some_and(f64::is_finite));
}

#[test]
fn cancelled_window_keeps_the_previous_estimate() {
    let scenario = VehicleScenario::default();
    let start = initial(&scenario.wheels);
    let token = CancelToken::new();
    token.cancel();
    let mut ctl = WindowController::new(&options(WindowMode::Batch, 5.0), start)
        .unwrap()
        .with_cancel_token(token);

    let outcomes = run(&mut ctl, records(&scenario));
    assert_eq!(outcomes.len(), 3);
    assert!(outcomes.iter().all(|o| o.status() == SolveStatus::Cancelled));
    assert_eq!(*ctl.estimate(), start);
}

#[test]
fn window_reports_are_written_per_window() {
    let scenario = VehicleScenario::default();
    let mut ctl = WindowController::new(
        &options(WindowMode::Batch, 100.0),
        initial(&scenario.wheels),
    )
    .unwrap();
    let outcome = run(&mut ctl, records(&scenario)).remove(0);

    let dir = tempfile::tempdir().unwrap();
    let out = dir.path().join("reports");
    let (params_path, cov_path) = write_window_reports(&out, &outcome).unwrap();
    assert!(params_path.ends_with("window_0000_parameters.json"));
    assert!(cov_path.ends_with("window_0000_covariance.json"));

    let params: ParameterReport =
        serde_json::from_str(&std::fs::read_to_string(&params_path).unwrap()).unwrap();
    assert_eq!(params.window, 0);
    assert_eq!(params.status, SolveStatus::Converged);
    assert_eq!(params.parameters.len(), 19);
    assert_eq!(params.parameters["steering/a1"], 1.0);
    assert_eq!(params.parameters["wheels/wheelbase"], scenario.wheels.wheelbase);
    assert!((params.parameters["delay/odometry"] - scenario.odometry_delay).abs() < 0.005);
    assert!(params.parameters.contains_key("extrinsic/rotation/z"));

    let cov: CovarianceReport =
        serde_json::from_str(&std::fs::read_to_string(&cov_path).unwrap()).unwrap();
    assert!(cov.sum_log_diag_r.is_some());
    // Fixed parameters have no marginal variance.
    assert!(!cov.variances.contains_key("wheels/wheelbase"));
    assert!(!cov.variances.contains_key("delay/pose"));
    assert!(!cov.variances.contains_key("steering/a0"));
    assert!(cov.variances["delay/odometry"] > 0.0);
    assert!(cov.variances["wheels/rear_left_radius"] > 0.0);
}

#[test]
fn rear_only_stream_solves_with_default_options() {
    let scenario = VehicleScenario::default();
    let opts = CalibratorOptions {
        window_duration: 100.0,
        verbose: false,
        ..CalibratorOptions::default()
    };
    let start = initial(&scenario.wheels);
    let mut ctl = WindowController::new(&opts, start).unwrap();

    let rear: Vec<f64> = (0..121).map(|k| 0.1 + k as f64 * 0.097).collect();
    let mut data: Vec<Record> = scenario
        .pose_measurements(&uniform_stamps(0.0, 0.1, 120))
        .into_iter()
        .map(Record::Pose)
        .collect();
    data.extend(scenario.wheel_measurements(&rear, Axle::Rear).into_iter().map(Record::Wheel));
    data.sort_by(|a, b| a.timestamp().total_cmp(&b.timestamp()));

    let outcomes = run(&mut ctl, data);
    assert_eq!(outcomes.len(), 1);
    let outcome = &outcomes[0];
    assert_eq!(outcome.status(), SolveStatus::Converged);
    assert_eq!(outcome.calibration.assembly.front_wheel_terms, 0);
    assert!(outcome.sum_log_diag_r.is_some_and(f64::is_finite));

    let estimate = ctl.estimate();
    assert_eq!(estimate.wheels.front_left_radius, start.wheels.front_left_radius);
    assert_eq!(estimate.wheels.front_right_radius, start.wheels.front_right_radius);
    assert_eq!(estimate.wheels.wheelbase, start.wheels.wheelbase);
    assert_eq!(estimate.steering, start.steering);
    assert!((estimate.wheels.rear_left_radius - scenario.wheels.rear_left_radius).abs() < 0.005);
    assert!(!outcome.variances.iter().any(|(name, _)| name.starts_with("wheels/front")));
}

#[test]
fn configuration_loads_from_file() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("calibrator.json");
    let opts = options(WindowMode::Incremental { retain: 2.0 }, 6.0);
    std::fs::write(&path, serde_json::to_string_pretty(&opts).unwrap()).unwrap();
    assert_eq!(CalibratorOptions::from_path(&path).unwrap(), opts);

    let err = CalibratorOptions::from_path(dir.path().join("missing.json")).unwrap_err();
    assert!(format!("{err:#}").contains("missing.json"));
}
