//! Delay-aware calibration of wheel odometry against a pose sensor.
//!
//! Estimates, jointly with the control points of a continuous-time trajectory
//! of the pose sensor:
//! - per-stream time delays (`delay/pose`, `delay/odometry`),
//! - the odometry-to-reference extrinsic (`extrinsic/translation`,
//!   `extrinsic/rotation`),
//! - wheel geometry and radii (`wheels`),
//! - the steering polynomial (`steering`) when records carry steering
//!   readings.
//!
//! Geometry that no assembled term can see is held at its initial value: the
//! wheelbase and front wheels without front-axle terms, the steering
//! polynomial without steering readings.
//!
//! Calibration blocks are registered after the trajectory so their columns
//! trail in the solver's factor.

use egocalib_core::{
    check_monotonic, speed_yaw_pair, wheel_ground_speeds, Axle, BSplinePose, CalibError, Extrinsic,
    PoseMeasurement, Real, SplineOptions, SteeringParams, Vec3, WheelMeasurement, WheelOdometryParams,
};
use log::{debug, info, warn};
use nalgebra::{DMatrix, DVector};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::ops::Range;

use crate::backend::{
    BackendSolveOptions, CancelToken, GaussNewtonBackend, OptimBackend, SolveStatus,
};
use crate::diagnostics::TriangularFactor;
use crate::factors::{
    FactorKind, NonHolonomicErrorTerm, PoseErrorTerm, PriorErrorTerm, SteeringErrorTerm, WheelErrorTerm,
};
use crate::ir::{Bound, FixedMask, ParamId, ProblemIR, ResidualBlock};
use crate::robust::RobustLoss;
use crate::trajectory::{curve_from_params, register_control_points, SplineWindow};

pub const POSE_DELAY: &str = "delay/pose";
pub const ODOMETRY_DELAY: &str = "delay/odometry";
pub const EXTRINSIC_TRANSLATION: &str = "extrinsic/translation";
pub const EXTRINSIC_ROTATION: &str = "extrinsic/rotation";
pub const WHEELS: &str = "wheels";
pub const STEERING: &str = "steering";

const AXES: [&str; 3] = ["x", "y", "z"];

/// Report name of element `index` of a calibration block.
pub fn element_name(block: &str, index: usize) -> String {
    match block {
        WHEELS => match WheelOdometryParams::NAMES.get(index) {
            Some(name) => format!("{WHEELS}/{name}"),
            None => format!("{WHEELS}/{index}"),
        },
        STEERING if index < SteeringParams::DIM => {
            format!("{STEERING}/{}", SteeringParams::NAMES[index])
        }
        EXTRINSIC_TRANSLATION | EXTRINSIC_ROTATION if index < 3 => {
            format!("{block}/{}", AXES[index])
        }
        POSE_DELAY | ODOMETRY_DELAY => block.to_string(),
        _ => format!("{block}/{index}"),
    }
}

/// Measurement streams of one calibration run.
#[derive(Debug, Clone)]
pub struct OdometryDataset {
    pub poses: Vec<PoseMeasurement>,
    pub wheels: Vec<WheelMeasurement>,
}

impl OdometryDataset {
    pub fn new(poses: Vec<PoseMeasurement>, wheels: Vec<WheelMeasurement>) -> Result<Self, CalibError> {
        if poses.len() < 2 {
            return Err(CalibError::invalid(format!(
                "need at least 2 pose measurements, got {}",
                poses.len()
            )));
        }
        for p in &poses {
            p.validate()?;
        }
        for w in &wheels {
            w.validate()?;
        }
        check_monotonic(&poses, "pose")?;
        check_monotonic(&wheels, "odometry")?;
        Ok(Self { poses, wheels })
    }

    /// Time span of the pose stream.
    pub fn span(&self) -> (Real, Real) {
        match (self.poses.first(), self.poses.last()) {
            (Some(a), Some(b)) => (a.timestamp, b.timestamp),
            _ => (0.0, 0.0),
        }
    }
}

/// Starting point of the optimization.
#[derive(Debug, Clone)]
pub struct OdometryInit {
    pub trajectory: BSplinePose,
    pub wheels: WheelOdometryParams,
    pub steering: SteeringParams,
    pub extrinsic: Extrinsic,
    pub pose_delay: Real,
    pub odometry_delay: Real,
}

impl OdometryInit {
    /// Fits the initial trajectory to the pose stream; delays start at zero
    /// and the steering reading starts as the steering angle.
    pub fn fit(
        dataset: &OdometryDataset,
        spline: &SplineOptions,
        wheels: WheelOdometryParams,
        extrinsic: Extrinsic,
    ) -> Result<Self, CalibError> {
        Ok(Self {
            trajectory: BSplinePose::fit_measurements(&dataset.poses, spline)?,
            wheels,
            steering: SteeringParams::default(),
            extrinsic,
            pose_delay: 0.0,
            odometry_delay: 0.0,
        })
    }
}

/// How a calibration parameter enters the problem.
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ParamPrior {
    /// Estimated without a prior.
    #[default]
    Free,
    /// Held at its initial value.
    Fixed,
    /// Estimated with a Gaussian prior around its initial value.
    Gaussian { variance: Real },
}

impl ParamPrior {
    /// `None` is free, `0` is fixed, a positive value is a Gaussian prior.
    pub fn from_variance(variance: Option<Real>) -> Result<Self, CalibError> {
        match variance {
            None => Ok(ParamPrior::Free),
            Some(v) if v == 0.0 => Ok(ParamPrior::Fixed),
            Some(v) if v.is_finite() && v > 0.0 => Ok(ParamPrior::Gaussian { variance: v }),
            Some(v) => Err(CalibError::invalid(format!(
                "prior variance must be non-negative, got {v}"
            ))),
        }
    }

    pub fn is_fixed(&self) -> bool {
        matches!(self, ParamPrior::Fixed)
    }

    pub fn variance(&self) -> Option<Real> {
        match self {
            ParamPrior::Gaussian { variance } => Some(*variance),
            _ => None,
        }
    }
}

/// Per-element priors of the wheel block.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct WheelParamPriors {
    pub wheelbase: ParamPrior,
    pub rear_half_track: ParamPrior,
    pub front_half_track: ParamPrior,
    pub rear_left_radius: ParamPrior,
    pub rear_right_radius: ParamPrior,
    pub front_left_radius: ParamPrior,
    pub front_right_radius: ParamPrior,
}

impl WheelParamPriors {
    /// Priors in [`WheelOdometryParams::NAMES`] order.
    pub fn as_array(&self) -> [ParamPrior; WheelOdometryParams::DIM] {
        [
            self.wheelbase,
            self.rear_half_track,
            self.front_half_track,
            self.rear_left_radius,
            self.rear_right_radius,
            self.front_left_radius,
            self.front_right_radius,
        ]
    }

    pub fn all(prior: ParamPrior) -> Self {
        Self {
            wheelbase: prior,
            rear_half_track: prior,
            front_half_track: prior,
            rear_left_radius: prior,
            rear_right_radius: prior,
            front_left_radius: prior,
            front_right_radius: prior,
        }
    }
}

impl Default for WheelParamPriors {
    /// Wheelbase and front track are only seen by front-axle records.
    fn default() -> Self {
        Self {
            wheelbase: ParamPrior::Fixed,
            front_half_track: ParamPrior::Fixed,
            ..Self::all(ParamPrior::Free)
        }
    }
}

/// Noise of the non-holonomic constraint.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct NonHolonomicNoise {
    pub vy_variance: Real,
    pub vz_variance: Real,
}

/// Solve options for odometry calibration.
#[derive(Debug, Clone, PartialEq)]
pub struct OdometrySolveOptions {
    pub pose_loss: RobustLoss,
    pub wheel_loss: RobustLoss,
    pub constraint_loss: RobustLoss,
    /// Adds a non-holonomic term per rear-axle record when set.
    pub non_holonomic: Option<NonHolonomicNoise>,
    /// Use front-axle records; ignored (and counted) otherwise.
    pub use_front_wheels: bool,
    pub wheel_priors: WheelParamPriors,
    /// Priors on `a0..a3` of the steering polynomial.
    pub steering_priors: [ParamPrior; SteeringParams::DIM],
    pub extrinsic_translation: ParamPrior,
    pub extrinsic_rotation: ParamPrior,
    pub pose_delay: ParamPrior,
    pub odometry_delay: ParamPrior,
    /// Symmetric bound on both delays (s).
    pub delay_bound: Real,
    /// Hold the trajectory at its initial fit.
    pub fix_trajectory: bool,
}

impl Default for OdometrySolveOptions {
    fn default() -> Self {
        Self {
            pose_loss: RobustLoss::None,
            wheel_loss: RobustLoss::None,
            constraint_loss: RobustLoss::None,
            non_holonomic: None,
            use_front_wheels: false,
            wheel_priors: WheelParamPriors::default(),
            steering_priors: [ParamPrior::Free; SteeringParams::DIM],
            extrinsic_translation: ParamPrior::Free,
            extrinsic_rotation: ParamPrior::Fixed,
            pose_delay: ParamPrior::Fixed,
            odometry_delay: ParamPrior::Free,
            delay_bound: 0.05,
            fix_trajectory: false,
        }
    }
}

/// Counts of what went into the problem and what was left out.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct AssemblyReport {
    pub pose_terms: usize,
    pub wheel_terms: usize,
    /// Wheel terms of front-axle records.
    pub front_wheel_terms: usize,
    pub steering_terms: usize,
    pub constraint_terms: usize,
    pub prior_terms: usize,
    /// Odometry records whose predicted velocity is zero at the initial guess.
    pub skipped_zero_velocity: usize,
    /// Records whose delay range leaves the trajectory span.
    pub skipped_out_of_span: usize,
    /// Front-axle records while front wheels are disabled.
    pub ignored_front_axle: usize,
}

impl AssemblyReport {
    pub fn skipped(&self) -> usize {
        self.skipped_zero_velocity + self.skipped_out_of_span
    }
}

/// Result of odometry calibration.
#[derive(Debug, Clone)]
pub struct OdometryCalibration {
    pub trajectory: BSplinePose,
    pub wheels: WheelOdometryParams,
    pub steering: SteeringParams,
    pub extrinsic: Extrinsic,
    pub pose_delay: Real,
    pub odometry_delay: Real,
    pub status: SolveStatus,
    pub iterations: usize,
    pub initial_cost: f64,
    pub final_cost: f64,
    pub assembly: AssemblyReport,
    /// Factor at the returned estimate; see [`crate::BackendSolution::factor`].
    pub factor: Option<TriangularFactor>,
}

struct CalibrationIds {
    pose_delay: ParamId,
    odometry_delay: ParamId,
    translation: ParamId,
    rotation: ParamId,
    wheels: ParamId,
    steering: ParamId,
}

fn vector_mask(prior: ParamPrior, dim: usize) -> FixedMask {
    if prior.is_fixed() {
        FixedMask::all_fixed(dim)
    } else {
        FixedMask::all_free()
    }
}

fn fixed_indices(priors: &[ParamPrior]) -> Vec<usize> {
    priors
        .iter()
        .enumerate()
        .filter(|(_, p)| p.is_fixed())
        .map(|(i, _)| i)
        .collect()
}

/// `true` when the record's axle would read zero speed and zero yaw rate.
fn is_standstill(v_odo: &Vec3, w_odo: &Vec3, wheels: &WheelOdometryParams, axle: Axle) -> bool {
    let half_track = wheels.half_track(axle);
    let (left, right) = wheel_ground_speeds(v_odo, w_odo, wheels.wheelbase, half_track, axle);
    let (speed, yaw) = speed_yaw_pair(left, right, half_track);
    speed.abs() < f64::EPSILON && yaw.abs() < f64::EPSILON
}

fn register_calibration(
    init: &OdometryInit,
    opts: &OdometrySolveOptions,
    ir: &mut ProblemIR,
    initial: &mut HashMap<String, DVector<f64>>,
) -> CalibrationIds {
    let delay_bounds = Some(vec![Bound::symmetric(0, opts.delay_bound)]);
    let pose_delay = ir.add_param_block(
        POSE_DELAY,
        1,
        vector_mask(opts.pose_delay, 1),
        delay_bounds.clone(),
    );
    initial.insert(POSE_DELAY.to_string(), DVector::from_element(1, init.pose_delay));
    let odometry_delay = ir.add_param_block(
        ODOMETRY_DELAY,
        1,
        vector_mask(opts.odometry_delay, 1),
        delay_bounds,
    );
    initial.insert(ODOMETRY_DELAY.to_string(), DVector::from_element(1, init.odometry_delay));

    let translation = ir.add_param_block(
        EXTRINSIC_TRANSLATION,
        3,
        vector_mask(opts.extrinsic_translation, 3),
        None,
    );
    initial.insert(
        EXTRINSIC_TRANSLATION.to_string(),
        DVector::from_column_slice(init.extrinsic.translation.as_slice()),
    );
    let rotation = ir.add_param_block(
        EXTRINSIC_ROTATION,
        3,
        vector_mask(opts.extrinsic_rotation, 3),
        None,
    );
    initial.insert(
        EXTRINSIC_ROTATION.to_string(),
        DVector::from_column_slice(init.extrinsic.rotation.as_slice()),
    );

    let wheels = ir.add_param_block(
        WHEELS,
        WheelOdometryParams::DIM,
        FixedMask::fix_indices(&fixed_indices(&opts.wheel_priors.as_array())),
        None,
    );
    initial.insert(WHEELS.to_string(), init.wheels.to_dvec());
    let steering = ir.add_param_block(
        STEERING,
        SteeringParams::DIM,
        FixedMask::fix_indices(&fixed_indices(&opts.steering_priors)),
        None,
    );
    initial.insert(STEERING.to_string(), init.steering.to_dvec());

    CalibrationIds {
        pose_delay,
        odometry_delay,
        translation,
        rotation,
        wheels,
        steering,
    }
}

fn add_prior(
    ir: &mut ProblemIR,
    report: &mut AssemblyReport,
    id: ParamId,
    mean: DVector<f64>,
    priors: &[ParamPrior],
) -> Result<(), CalibError> {
    let variances: Vec<Option<Real>> = priors.iter().map(ParamPrior::variance).collect();
    if variances.iter().all(Option::is_none) {
        return Ok(());
    }
    let term = PriorErrorTerm::from_variances(mean, &variances)?;
    ir.add_residual_block(ResidualBlock::new(
        vec![id],
        RobustLoss::None,
        FactorKind::Prior(term),
    ));
    report.prior_terms += 1;
    Ok(())
}

/// Window for a record, `None` when its delay range leaves the span.
fn window_for(curve: &BSplinePose, stamp: Real, delay_bound: Real) -> Result<Option<SplineWindow>, CalibError> {
    match SplineWindow::covering(curve.layout(), stamp, delay_bound) {
        Ok(w) => Ok(Some(w)),
        Err(CalibError::OutOfRangeQuery { .. }) => Ok(None),
        Err(e) => Err(e),
    }
}

fn window_params(window: &SplineWindow, control: &[ParamId], tail: &[ParamId]) -> Vec<ParamId> {
    control[window.first()..window.first() + window.count()]
        .iter()
        .chain(tail)
        .copied()
        .collect()
}

/// Build IR for odometry calibration.
pub fn build_odometry_ir(
    dataset: &OdometryDataset,
    init: &OdometryInit,
    opts: &OdometrySolveOptions,
) -> Result<(ProblemIR, HashMap<String, DVector<f64>>, AssemblyReport), CalibError> {
    if !(opts.delay_bound.is_finite() && opts.delay_bound >= 0.0) {
        return Err(CalibError::invalid(format!(
            "delay bound must be non-negative, got {}",
            opts.delay_bound
        )));
    }
    for (name, delay) in [(POSE_DELAY, init.pose_delay), (ODOMETRY_DELAY, init.odometry_delay)] {
        if !delay.is_finite() || delay.abs() > opts.delay_bound {
            return Err(CalibError::invalid(format!(
                "initial {name} {delay} exceeds the delay bound {}",
                opts.delay_bound
            )));
        }
    }
    init.wheels.validate()?;
    if init.steering.to_dvec().iter().any(|v| !v.is_finite()) {
        return Err(CalibError::invalid("initial steering coefficients must be finite"));
    }
    for loss in [opts.pose_loss, opts.wheel_loss, opts.constraint_loss] {
        loss.validate().map_err(CalibError::InvalidInput)?;
    }

    let mut ir = ProblemIR::new();
    let mut initial = HashMap::new();
    let mut report = AssemblyReport::default();
    let curve = &init.trajectory;

    let control = register_control_points(curve, &mut ir, &mut initial, opts.fix_trajectory);
    let ids = register_calibration(init, opts, &mut ir, &mut initial);

    for m in &dataset.poses {
        let Some(window) = window_for(curve, m.timestamp, opts.delay_bound)? else {
            report.skipped_out_of_span += 1;
            continue;
        };
        let params = window_params(&window, &control, &[ids.pose_delay]);
        let term = PoseErrorTerm::new(m, window)?;
        ir.add_residual_block(ResidualBlock::new(
            params,
            opts.pose_loss,
            FactorKind::Pose(term),
        ));
        report.pose_terms += 1;
    }
    if report.pose_terms == 0 {
        return Err(CalibError::invalid(
            "no pose measurement lies inside the trajectory span",
        ));
    }

    for m in &dataset.wheels {
        if m.axle == Axle::Front && !opts.use_front_wheels {
            report.ignored_front_axle += 1;
            continue;
        }
        let Some(window) = window_for(curve, m.timestamp, opts.delay_bound)? else {
            report.skipped_out_of_span += 1;
            continue;
        };

        let sample = curve.evaluate(m.timestamp + init.odometry_delay)?;
        let (v_o, w_o) = init
            .extrinsic
            .odometry_velocities(&sample.linear_velocity_body(), &sample.angular_velocity_body());
        if is_standstill(&v_o, &w_o, &init.wheels, m.axle) {
            report.skipped_zero_velocity += 1;
            continue;
        }

        let tail = [ids.odometry_delay, ids.translation, ids.rotation];
        if let (Some(noise), Axle::Rear) = (opts.non_holonomic, m.axle) {
            let term = NonHolonomicErrorTerm::new(
                m.timestamp,
                noise.vy_variance,
                noise.vz_variance,
                window.clone(),
            )?;
            ir.add_residual_block(ResidualBlock::new(
                window_params(&window, &control, &tail),
                opts.constraint_loss,
                FactorKind::NonHolonomic(term),
            ));
            report.constraint_terms += 1;
        }

        let calibration = [ids.odometry_delay, ids.translation, ids.rotation, ids.wheels, ids.steering];
        if let Some(reading) = m.steering {
            let term = SteeringErrorTerm::new(m.timestamp, reading, window.clone())?;
            ir.add_residual_block(ResidualBlock::new(
                window_params(&window, &control, &calibration),
                opts.wheel_loss,
                FactorKind::Steering(term),
            ));
            report.steering_terms += 1;
        }

        let term = WheelErrorTerm::new(m, window.clone())?;
        let used = if term.is_steered() {
            &calibration[..]
        } else {
            &calibration[..4]
        };
        ir.add_residual_block(ResidualBlock::new(
            window_params(&window, &control, used),
            opts.wheel_loss,
            FactorKind::Wheel(term),
        ));
        report.wheel_terms += 1;
        if m.axle == Axle::Front {
            report.front_wheel_terms += 1;
        }
    }

    let mut wheel_priors = opts.wheel_priors.as_array();
    if report.front_wheel_terms == 0 {
        let front = [
            WheelOdometryParams::WHEELBASE,
            WheelOdometryParams::FRONT_HALF_TRACK,
            WheelOdometryParams::FRONT_LEFT_RADIUS,
            WheelOdometryParams::FRONT_RIGHT_RADIUS,
        ];
        if front.iter().any(|&i| !wheel_priors[i].is_fixed()) {
            info!("no front-axle terms: holding the wheelbase and front wheels at their initial values");
        }
        for i in front {
            wheel_priors[i] = ParamPrior::Fixed;
        }
        ir.params[ids.wheels.0].fixed = FixedMask::fix_indices(&fixed_indices(&wheel_priors));
    }
    let mut steering_priors = opts.steering_priors;
    if report.steering_terms == 0 {
        if steering_priors.iter().any(|p| !p.is_fixed()) {
            info!("no steering readings: holding the steering polynomial at its initial value");
        }
        steering_priors = [ParamPrior::Fixed; SteeringParams::DIM];
        ir.params[ids.steering.0].fixed = FixedMask::all_fixed(SteeringParams::DIM);
    }

    add_prior(
        &mut ir,
        &mut report,
        ids.pose_delay,
        DVector::from_element(1, init.pose_delay),
        &[opts.pose_delay],
    )?;
    add_prior(
        &mut ir,
        &mut report,
        ids.odometry_delay,
        DVector::from_element(1, init.odometry_delay),
        &[opts.odometry_delay],
    )?;
    add_prior(
        &mut ir,
        &mut report,
        ids.translation,
        DVector::from_column_slice(init.extrinsic.translation.as_slice()),
        &[opts.extrinsic_translation; 3],
    )?;
    add_prior(
        &mut ir,
        &mut report,
        ids.rotation,
        DVector::from_column_slice(init.extrinsic.rotation.as_slice()),
        &[opts.extrinsic_rotation; 3],
    )?;
    add_prior(
        &mut ir,
        &mut report,
        ids.wheels,
        init.wheels.to_dvec(),
        &wheel_priors,
    )?;
    add_prior(
        &mut ir,
        &mut report,
        ids.steering,
        init.steering.to_dvec(),
        &steering_priors,
    )?;

    if report.skipped() > 0 {
        warn!(
            "skipped {} zero-velocity and {} out-of-span measurements",
            report.skipped_zero_velocity, report.skipped_out_of_span
        );
    }
    debug!("odometry problem: {report:?}");

    ir.validate()
        .map_err(|e| CalibError::invalid(e.to_string()))?;
    Ok((ir, initial, report))
}

fn block<'a>(params: &'a HashMap<String, DVector<f64>>, name: &str) -> Result<&'a DVector<f64>, CalibError> {
    params
        .get(name)
        .ok_or_else(|| CalibError::invalid(format!("solution is missing {name}")))
}

fn vec3(v: &DVector<f64>) -> Vec3 {
    Vec3::new(v[0], v[1], v[2])
}

/// Optimize odometry calibration with the Gauss-Newton backend.
///
/// An exhausted iteration budget is reported through
/// [`OdometryCalibration::status`], not as an error.
pub fn optimize_odometry(
    dataset: &OdometryDataset,
    init: &OdometryInit,
    opts: &OdometrySolveOptions,
    backend_opts: &BackendSolveOptions,
    cancel: Option<&CancelToken>,
) -> Result<OdometryCalibration, CalibError> {
    let (ir, initial, assembly) = build_odometry_ir(dataset, init, opts)?;
    let solution = GaussNewtonBackend.solve(&ir, &initial, backend_opts, cancel)?;

    let trajectory = curve_from_params(&init.trajectory, &solution.params)?;
    let wheels = WheelOdometryParams::from_dvec(block(&solution.params, WHEELS)?)?;
    let steering = SteeringParams::from_dvec(block(&solution.params, STEERING)?)?;
    let extrinsic = Extrinsic::new(
        vec3(block(&solution.params, EXTRINSIC_TRANSLATION)?),
        vec3(block(&solution.params, EXTRINSIC_ROTATION)?),
    );
    let pose_delay = block(&solution.params, POSE_DELAY)?[0];
    let odometry_delay = block(&solution.params, ODOMETRY_DELAY)?[0];
    info!(
        "odometry calibration {:?} after {} iterations: cost {:.6e} -> {:.6e}, delay {:.4} s",
        solution.status, solution.iterations, solution.initial_cost, solution.final_cost, odometry_delay
    );

    Ok(OdometryCalibration {
        trajectory,
        wheels,
        steering,
        extrinsic,
        pose_delay,
        odometry_delay,
        status: solution.status,
        iterations: solution.iterations,
        initial_cost: solution.initial_cost,
        final_cost: solution.final_cost,
        assembly,
        factor: solution.factor,
    })
}

impl OdometryCalibration {
    /// Treats an exhausted iteration budget as an error.
    pub fn into_converged(self) -> Result<Self, CalibError> {
        match self.status {
            SolveStatus::IterationLimit => Err(CalibError::ConvergenceFailure {
                iterations: self.iterations,
                cost: self.final_cost,
            }),
            _ => Ok(self),
        }
    }

    /// Trailing factor columns of the free calibration parameters; `None`
    /// without a factor or without free calibration parameters.
    pub fn calibration_columns(&self) -> Option<Range<usize>> {
        let factor = self.factor.as_ref()?;
        let start = factor
            .columns()
            .iter()
            .position(|c| !c.block.starts_with("traj/"))?;
        Some(start..factor.dim())
    }

    /// Report names of the free calibration parameters, in column order.
    pub fn calibration_names(&self) -> Vec<String> {
        match (&self.factor, self.calibration_columns()) {
            (Some(factor), Some(range)) => factor.columns()[range]
                .iter()
                .map(|c| element_name(&c.block, c.index))
                .collect(),
            _ => Vec::new(),
        }
    }

    /// Marginal covariance of the free calibration parameters.
    pub fn calibration_covariance(&self) -> Result<DMatrix<f64>, CalibError> {
        let (factor, range) = self.free_range()?;
        factor.marginal_covariance(range)
    }

    /// `Σ ln R_ii` over the free calibration parameters.
    pub fn sum_log_diag_r(&self) -> Result<f64, CalibError> {
        let (factor, range) = self.free_range()?;
        factor.sum_log_diag(range)
    }

    fn free_range(&self) -> Result<(&TriangularFactor, Range<usize>), CalibError> {
        let factor = self.factor.as_ref().ok_or_else(|| {
            CalibError::invalid(format!("no factor at the {:?} estimate", self.status))
        })?;
        let range = self
            .calibration_columns()
            .ok_or_else(|| CalibError::invalid("no calibration parameter is free"))?;
        Ok((factor, range))
    }

    /// Every calibration parameter value keyed by report name.
    pub fn parameter_entries(&self) -> Vec<(String, Real)> {
        let mut out: Vec<(String, Real)> = self
            .wheels
            .to_dvec()
            .iter()
            .enumerate()
            .map(|(i, v)| (element_name(WHEELS, i), *v))
            .collect();
        out.extend(
            self.steering
                .to_dvec()
                .iter()
                .enumerate()
                .map(|(i, v)| (element_name(STEERING, i), *v)),
        );
        for (name, v) in [
            (EXTRINSIC_TRANSLATION, self.extrinsic.translation),
            (EXTRINSIC_ROTATION, self.extrinsic.rotation),
        ] {
            out.extend((0..3).map(|i| (element_name(name, i), v[i])));
        }
        out.push((POSE_DELAY.to_string(), self.pose_delay));
        out.push((ODOMETRY_DELAY.to_string(), self.odometry_delay));
        out
    }

    /// Marginal variances of the free calibration parameters.
    pub fn variance_entries(&self) -> Result<Vec<(String, Real)>, CalibError> {
        let cov = self.calibration_covariance()?;
        Ok(self
            .calibration_names()
            .into_iter()
            .enumerate()
            .map(|(i, name)| (name, cov[(i, i)]))
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use egocalib_core::synthetic::vehicle::{uniform_stamps, Oscillation};
    use egocalib_core::synthetic::{VehicleMotion, VehicleScenario};
    use egocalib_core::Mat2;

    fn dataset(scenario: &VehicleScenario) -> OdometryDataset {
        let poses = scenario.pose_measurements(&uniform_stamps(0.0, 0.1, 40));
        let wheels = scenario.wheel_measurements(&uniform_stamps(0.02, 0.1, 39), Axle::Rear);
        OdometryDataset::new(poses, wheels).unwrap()
    }

    fn init(data: &OdometryDataset) -> OdometryInit {
        OdometryInit::fit(
            data,
            &SplineOptions::default(),
            WheelOdometryParams::default(),
            Extrinsic::identity(),
        )
        .unwrap()
    }

    #[test]
    fn element_names_follow_blocks() {
        assert_eq!(element_name(WHEELS, 3), "wheels/rear_left_radius");
        assert_eq!(element_name(EXTRINSIC_TRANSLATION, 2), "extrinsic/translation/z");
        assert_eq!(element_name(ODOMETRY_DELAY, 0), "delay/odometry");
    }

    #[test]
    fn prior_from_variance() {
        assert_eq!(ParamPrior::from_variance(None).unwrap(), ParamPrior::Free);
        assert_eq!(ParamPrior::from_variance(Some(0.0)).unwrap(), ParamPrior::Fixed);
        assert_eq!(
            ParamPrior::from_variance(Some(0.5)).unwrap(),
            ParamPrior::Gaussian { variance: 0.5 }
        );
        assert!(ParamPrior::from_variance(Some(-1.0)).is_err());
    }

    #[test]
    fn ir_counts_terms_and_orders_calibration_last() {
        let scenario = VehicleScenario::default();
        let data = dataset(&scenario);
        let opts = OdometrySolveOptions {
            non_holonomic: Some(NonHolonomicNoise {
                vy_variance: 0.1,
                vz_variance: 0.1,
            }),
            wheel_priors: WheelParamPriors {
                rear_left_radius: ParamPrior::Gaussian { variance: 1e-4 },
                ..WheelParamPriors::default()
            },
            ..OdometrySolveOptions::default()
        };
        let (ir, initial, report) = build_odometry_ir(&data, &init(&data), &opts).unwrap();
        assert_eq!(
            report.pose_terms + report.wheel_terms + report.skipped_out_of_span,
            40 + 39
        );
        assert_eq!(report.wheel_terms, report.constraint_terms);
        assert_eq!(report.prior_terms, 1);
        assert!(report.wheel_terms > 30);

        let last_traj = ir
            .params
            .iter()
            .rposition(|p| p.name.starts_with("traj/"))
            .unwrap();
        let first_calib = ir.param_by_name(POSE_DELAY).unwrap();
        assert_eq!(first_calib.0, last_traj + 1);
        assert_eq!(initial.len(), ir.params.len());
        let wheels = &ir.params[ir.param_by_name(WHEELS).unwrap().0];
        assert!(wheels.fixed.is_fixed(WheelOdometryParams::WHEELBASE));
        assert!(!wheels.fixed.is_fixed(WheelOdometryParams::REAR_LEFT_RADIUS));
    }

    #[test]
    fn front_axle_is_ignored_unless_enabled() {
        let scenario = VehicleScenario::default();
        let poses = scenario.pose_measurements(&uniform_stamps(0.0, 0.1, 40));
        let wheels = scenario.wheel_measurements(&uniform_stamps(1.0, 0.5, 4), Axle::Front);
        let data = OdometryDataset::new(poses, wheels).unwrap();
        let (_, _, report) =
            build_odometry_ir(&data, &init(&data), &OdometrySolveOptions::default()).unwrap();
        assert_eq!(report.ignored_front_axle, 4);
        assert_eq!(report.wheel_terms, 0);

        let opts = OdometrySolveOptions {
            use_front_wheels: true,
            ..OdometrySolveOptions::default()
        };
        let (_, _, report) = build_odometry_ir(&data, &init(&data), &opts).unwrap();
        assert_eq!(report.ignored_front_axle, 0);
        assert_eq!(report.wheel_terms, 4);
        assert_eq!(report.front_wheel_terms, 4);
    }

    #[test]
    fn standstill_follows_the_record_axle() {
        let wheels = WheelOdometryParams::default();
        // Sliding sideways: the rear wheels do not turn, the front ones do.
        let slide = Vec3::new(0.0, 2.0, 0.0);
        assert!(is_standstill(&slide, &Vec3::zeros(), &wheels, Axle::Rear));
        assert!(!is_standstill(&slide, &Vec3::zeros(), &wheels, Axle::Front));

        // Turning on the spot about the rear axle centre.
        let spin = Vec3::new(0.0, 0.0, 0.5);
        assert!(!is_standstill(&Vec3::zeros(), &spin, &wheels, Axle::Rear));
        for axle in [Axle::Rear, Axle::Front] {
            assert!(is_standstill(&Vec3::zeros(), &Vec3::zeros(), &wheels, axle));
        }
    }

    #[test]
    fn unseen_geometry_is_held_fixed() {
        let scenario = VehicleScenario::default();
        let data = dataset(&scenario);
        let opts = OdometrySolveOptions {
            wheel_priors: WheelParamPriors::all(ParamPrior::Gaussian { variance: 1e-2 }),
            ..OdometrySolveOptions::default()
        };
        let (ir, _, report) = build_odometry_ir(&data, &init(&data), &opts).unwrap();
        assert_eq!(report.front_wheel_terms, 0);
        assert_eq!(report.steering_terms, 0);
        // Only the wheel block keeps a prior, over the rear elements.
        assert_eq!(report.prior_terms, 1);

        let wheels = &ir.params[ir.param_by_name(WHEELS).unwrap().0];
        for i in [
            WheelOdometryParams::WHEELBASE,
            WheelOdometryParams::FRONT_HALF_TRACK,
            WheelOdometryParams::FRONT_LEFT_RADIUS,
            WheelOdometryParams::FRONT_RIGHT_RADIUS,
        ] {
            assert!(wheels.fixed.is_fixed(i), "{}", WheelOdometryParams::NAMES[i]);
        }
        for i in [
            WheelOdometryParams::REAR_HALF_TRACK,
            WheelOdometryParams::REAR_LEFT_RADIUS,
            WheelOdometryParams::REAR_RIGHT_RADIUS,
        ] {
            assert!(!wheels.fixed.is_fixed(i), "{}", WheelOdometryParams::NAMES[i]);
        }
        let steering = &ir.params[ir.param_by_name(STEERING).unwrap().0];
        assert!(steering.fixed.is_all_fixed(SteeringParams::DIM));
    }

    #[test]
    fn steering_readings_add_terms_and_free_the_polynomial() {
        let scenario = VehicleScenario::default();
        let poses = scenario.pose_measurements(&uniform_stamps(0.0, 0.1, 40));
        let wheels = scenario
            .steered_wheel_measurements(&uniform_stamps(0.05, 0.1, 39), Axle::Front)
            .unwrap();
        let data = OdometryDataset::new(poses, wheels).unwrap();
        let opts = OdometrySolveOptions {
            use_front_wheels: true,
            ..OdometrySolveOptions::default()
        };
        let (ir, _, report) = build_odometry_ir(&data, &init(&data), &opts).unwrap();
        assert!(report.front_wheel_terms > 30);
        assert_eq!(report.steering_terms, report.front_wheel_terms);

        let steering = &ir.params[ir.param_by_name(STEERING).unwrap().0];
        assert!((0..SteeringParams::DIM).all(|i| !steering.fixed.is_fixed(i)));
        let wheels = &ir.params[ir.param_by_name(WHEELS).unwrap().0];
        assert!(!wheels.fixed.is_fixed(WheelOdometryParams::FRONT_LEFT_RADIUS));
        let steered = ir
            .residuals
            .iter()
            .filter(|r| matches!(&r.factor, FactorKind::Wheel(t) if t.is_steered()))
            .count();
        assert_eq!(steered, report.front_wheel_terms);
        assert_eq!(element_name(STEERING, 1), "steering/a1");
    }

    #[test]
    fn standstill_records_are_skipped_and_counted() {
        let flat = Oscillation::new(0.0, 0.0, 0.0);
        let motion = VehicleMotion {
            base_speed: 0.0,
            speed: flat,
            yaw: flat,
            pitch: flat,
            roll: flat,
        };
        let scenario = VehicleScenario {
            motion,
            extrinsic: Extrinsic::identity(),
            pose_sigma: 0.0,
            ..VehicleScenario::default()
        };
        let poses = scenario.pose_measurements(&uniform_stamps(0.0, 0.1, 30));
        let wheels: Vec<WheelMeasurement> = uniform_stamps(0.5, 0.1, 20)
            .into_iter()
            .map(|t| WheelMeasurement::new(t, Axle::Rear, 0.0, 0.0, Mat2::identity() * 1e-4))
            .collect();
        let data = OdometryDataset::new(poses, wheels).unwrap();
        let (_, _, report) =
            build_odometry_ir(&data, &init(&data), &OdometrySolveOptions::default()).unwrap();
        assert_eq!(report.skipped_zero_velocity, 20);
        assert_eq!(report.wheel_terms, 0);
    }

    #[test]
    fn rejects_initial_delay_outside_bound() {
        let data = dataset(&VehicleScenario::default());
        let mut start = init(&data);
        start.odometry_delay = 0.2;
        assert!(matches!(
            build_odometry_ir(&data, &start, &OdometrySolveOptions::default()),
            Err(CalibError::InvalidInput(_))
        ));
    }

    #[test]
    fn dataset_rejects_decreasing_stamps() {
        let scenario = VehicleScenario::default();
        let mut poses = scenario.pose_measurements(&uniform_stamps(0.0, 0.1, 5));
        poses.swap(1, 2);
        assert!(OdometryDataset::new(poses, Vec::new()).is_err());
    }
}
