//! Calibrator configuration.
//!
//! One immutable value, deserialized once from JSON and passed by reference to
//! the window controller. Keys without a `serde(default)` are required.

use anyhow::{Context, Result};
use egocalib_core::{
    Axle, CalibError, Mat2, PoseMeasurement, Real, SplineOptions, SteeringParams, Vec3,
    WheelMeasurement, WheelOdometryParams,
};
use egocalib_optim::{
    BackendSolveOptions, NonHolonomicNoise, OdometrySolveOptions, ParamPrior, RobustLoss,
    WheelParamPriors,
};
use serde::{Deserialize, Serialize};
use std::path::Path;

/// Trajectory spline settings.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct SplineConfig {
    pub translation_lambda: Real,
    pub rotation_lambda: Real,
    pub knots_per_second: Real,
    #[serde(default = "default_order")]
    pub order: usize,
    #[serde(default = "default_max_segments")]
    pub max_segments: usize,
}

fn default_order() -> usize {
    4
}

fn default_max_segments() -> usize {
    2000
}

/// Per-wheel encoder rate variances ((rad/s)²).
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct WheelNoise {
    pub left_variance: Real,
    pub right_variance: Real,
}

/// Odometry noise settings.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct OdometryConfig {
    pub wheel_noise: WheelNoise,
    /// Non-holonomic constraint variances ((m/s)²).
    pub constraints: NonHolonomicNoise,
    /// Variance of the raw steering reading.
    #[serde(default = "default_steering_variance")]
    pub steering_variance: Real,
}

fn default_steering_variance() -> Real {
    1e-4
}

/// Declared variances of pose measurements built by [`CalibratorOptions::pose_measurement`].
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PoseNoise {
    pub translation_variance: Real,
    pub rotation_variance: Real,
}

impl Default for PoseNoise {
    fn default() -> Self {
        Self {
            translation_variance: 1e-4,
            rotation_variance: 1e-4,
        }
    }
}

/// Robust loss per measurement type.
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct RobustConfig {
    pub pose: RobustLoss,
    pub wheel: RobustLoss,
    pub constraint: RobustLoss,
}

/// Prior variance per calibration parameter: absent is free, `0` is fixed.
///
/// A missing `priors` section takes [`PriorConfig::default`]; a present one
/// replaces it, so keys it omits are free.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct PriorConfig {
    #[serde(default)]
    pub wheelbase: Option<Real>,
    #[serde(default)]
    pub rear_half_track: Option<Real>,
    #[serde(default)]
    pub front_half_track: Option<Real>,
    #[serde(default)]
    pub rear_left_radius: Option<Real>,
    #[serde(default)]
    pub rear_right_radius: Option<Real>,
    #[serde(default)]
    pub front_left_radius: Option<Real>,
    #[serde(default)]
    pub front_right_radius: Option<Real>,
    /// Steering polynomial `a0..a3`.
    #[serde(default)]
    pub steering: [Option<Real>; SteeringParams::DIM],
    #[serde(default)]
    pub extrinsic_translation: Option<Real>,
    #[serde(default)]
    pub extrinsic_rotation: Option<Real>,
    #[serde(default)]
    pub pose_delay: Option<Real>,
    #[serde(default)]
    pub odometry_delay: Option<Real>,
}

impl Default for PriorConfig {
    fn default() -> Self {
        Self {
            wheelbase: Some(0.0),
            rear_half_track: None,
            front_half_track: Some(0.0),
            rear_left_radius: None,
            rear_right_radius: None,
            front_left_radius: None,
            front_right_radius: None,
            steering: [None; SteeringParams::DIM],
            extrinsic_translation: None,
            extrinsic_rotation: None,
            pose_delay: Some(0.0),
            odometry_delay: None,
        }
    }
}

impl PriorConfig {
    pub fn wheel_priors(&self) -> Result<WheelParamPriors, CalibError> {
        Ok(WheelParamPriors {
            wheelbase: ParamPrior::from_variance(self.wheelbase)?,
            rear_half_track: ParamPrior::from_variance(self.rear_half_track)?,
            front_half_track: ParamPrior::from_variance(self.front_half_track)?,
            rear_left_radius: ParamPrior::from_variance(self.rear_left_radius)?,
            rear_right_radius: ParamPrior::from_variance(self.rear_right_radius)?,
            front_left_radius: ParamPrior::from_variance(self.front_left_radius)?,
            front_right_radius: ParamPrior::from_variance(self.front_right_radius)?,
        })
    }

    pub fn steering_priors(&self) -> Result<[ParamPrior; SteeringParams::DIM], CalibError> {
        let mut out = [ParamPrior::Free; SteeringParams::DIM];
        for (prior, variance) in out.iter_mut().zip(self.steering) {
            *prior = ParamPrior::from_variance(variance)?;
        }
        Ok(out)
    }
}

/// What happens to a window's measurements after it is solved.
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum WindowMode {
    /// Discard everything and start fresh.
    #[default]
    Batch,
    /// Keep the trailing `retain` seconds and warm-start the next trajectory
    /// from the solved one.
    Incremental { retain: Real },
}

/// Window lifecycle settings.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct WindowConfig {
    pub mode: WindowMode,
    /// Buffered measurement count (both streams) that forces a solve.
    pub max_measurements: usize,
    /// Fewer pose measurements than this are not solved on flush.
    pub min_pose_measurements: usize,
}

impl Default for WindowConfig {
    fn default() -> Self {
        Self {
            mode: WindowMode::Batch,
            max_measurements: 100_000,
            min_pose_measurements: 10,
        }
    }
}

fn default_true() -> bool {
    true
}

/// Configuration of a calibration run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CalibratorOptions {
    /// Target window duration (s).
    pub window_duration: Real,
    /// Log solver iterations at `info` instead of `debug`.
    pub verbose: bool,
    /// Symmetric bound on the stream delays (s).
    pub delay_bound: Real,
    pub splines: SplineConfig,
    pub odometry: OdometryConfig,

    #[serde(default)]
    pub pose_noise: PoseNoise,
    #[serde(default)]
    pub solver: BackendSolveOptions,
    #[serde(default)]
    pub robust: RobustConfig,
    #[serde(default)]
    pub priors: PriorConfig,
    #[serde(default)]
    pub window: WindowConfig,
    #[serde(default = "default_true")]
    pub estimate_extrinsic_translation: bool,
    #[serde(default)]
    pub estimate_extrinsic_rotation: bool,
    #[serde(default)]
    pub front_wheels: bool,
    #[serde(default = "default_true")]
    pub non_holonomic: bool,
}

impl Default for CalibratorOptions {
    fn default() -> Self {
        Self {
            window_duration: 10.0,
            verbose: true,
            delay_bound: 0.05,
            splines: SplineConfig {
                translation_lambda: 1e-6,
                rotation_lambda: 1e-6,
                knots_per_second: 5.0,
                order: default_order(),
                max_segments: default_max_segments(),
            },
            odometry: OdometryConfig {
                wheel_noise: WheelNoise {
                    left_variance: 1e-3,
                    right_variance: 1e-3,
                },
                constraints: NonHolonomicNoise {
                    vy_variance: 1e-1,
                    vz_variance: 1e-1,
                },
                steering_variance: default_steering_variance(),
            },
            pose_noise: PoseNoise::default(),
            solver: BackendSolveOptions::default(),
            robust: RobustConfig::default(),
            priors: PriorConfig::default(),
            window: WindowConfig::default(),
            estimate_extrinsic_translation: true,
            estimate_extrinsic_rotation: false,
            front_wheels: false,
            non_holonomic: true,
        }
    }
}

fn positive(name: &str, value: Real) -> Result<(), CalibError> {
    if value.is_finite() && value > 0.0 {
        Ok(())
    } else {
        Err(CalibError::invalid(format!("{name} must be positive, got {value}")))
    }
}

fn non_negative(name: &str, value: Real) -> Result<(), CalibError> {
    if value.is_finite() && value >= 0.0 {
        Ok(())
    } else {
        Err(CalibError::invalid(format!("{name} must be non-negative, got {value}")))
    }
}

impl CalibratorOptions {
    /// Parses and validates a JSON document.
    pub fn from_json_str(json: &str) -> Result<Self, CalibError> {
        let opts: Self = serde_json::from_str(json)
            .map_err(|e| CalibError::invalid(format!("configuration: {e}")))?;
        opts.validate()?;
        Ok(opts)
    }

    /// Reads, parses and validates a JSON file.
    pub fn from_path(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read configuration {}", path.display()))?;
        let opts = Self::from_json_str(&text)
            .with_context(|| format!("invalid configuration {}", path.display()))?;
        Ok(opts)
    }

    pub fn validate(&self) -> Result<(), CalibError> {
        positive("window_duration", self.window_duration)?;
        non_negative("delay_bound", self.delay_bound)?;
        positive("splines.knots_per_second", self.splines.knots_per_second)?;
        non_negative("splines.translation_lambda", self.splines.translation_lambda)?;
        non_negative("splines.rotation_lambda", self.splines.rotation_lambda)?;
        if self.splines.order < 2 {
            return Err(CalibError::invalid(format!(
                "splines.order must be at least 2, got {}",
                self.splines.order
            )));
        }
        positive("odometry.wheel_noise.left_variance", self.odometry.wheel_noise.left_variance)?;
        positive("odometry.wheel_noise.right_variance", self.odometry.wheel_noise.right_variance)?;
        positive("odometry.constraints.vy_variance", self.odometry.constraints.vy_variance)?;
        positive("odometry.constraints.vz_variance", self.odometry.constraints.vz_variance)?;
        positive("odometry.steering_variance", self.odometry.steering_variance)?;
        positive("pose_noise.translation_variance", self.pose_noise.translation_variance)?;
        positive("pose_noise.rotation_variance", self.pose_noise.rotation_variance)?;
        if let WindowMode::Incremental { retain } = self.window.mode {
            non_negative("window.mode.retain", retain)?;
            if retain >= self.window_duration {
                return Err(CalibError::invalid(format!(
                    "retained tail {retain} s must be shorter than the window ({} s)",
                    self.window_duration
                )));
            }
        }
        for loss in [self.robust.pose, self.robust.wheel, self.robust.constraint] {
            loss.validate().map_err(CalibError::InvalidInput)?;
        }
        self.solver.validate()?;
        self.solve_options().map(|_| ())
    }

    pub fn spline_options(&self) -> SplineOptions {
        SplineOptions {
            order: self.splines.order,
            knots_per_second: self.splines.knots_per_second,
            max_segments: self.splines.max_segments,
            translation_lambda: self.splines.translation_lambda,
            rotation_lambda: self.splines.rotation_lambda,
        }
    }

    pub fn backend_options(&self) -> BackendSolveOptions {
        BackendSolveOptions {
            verbosity: self.solver.verbosity.max(usize::from(self.verbose)),
            ..self.solver.clone()
        }
    }

    pub fn solve_options(&self) -> Result<OdometrySolveOptions, CalibError> {
        let gated = |estimate: bool, variance: Option<Real>| {
            if estimate {
                ParamPrior::from_variance(variance)
            } else {
                Ok(ParamPrior::Fixed)
            }
        };
        Ok(OdometrySolveOptions {
            pose_loss: self.robust.pose,
            wheel_loss: self.robust.wheel,
            constraint_loss: self.robust.constraint,
            non_holonomic: self.non_holonomic.then_some(self.odometry.constraints),
            use_front_wheels: self.front_wheels,
            wheel_priors: self.priors.wheel_priors()?,
            steering_priors: self.priors.steering_priors()?,
            extrinsic_translation: gated(
                self.estimate_extrinsic_translation,
                self.priors.extrinsic_translation,
            )?,
            extrinsic_rotation: gated(
                self.estimate_extrinsic_rotation,
                self.priors.extrinsic_rotation,
            )?,
            pose_delay: ParamPrior::from_variance(self.priors.pose_delay)?,
            odometry_delay: ParamPrior::from_variance(self.priors.odometry_delay)?,
            delay_bound: self.delay_bound,
            fix_trajectory: false,
        })
    }

    /// Pose record with the configured declared noise.
    pub fn pose_measurement(&self, timestamp: Real, translation: Vec3, rotation: Vec3) -> PoseMeasurement {
        PoseMeasurement::with_variances(
            timestamp,
            translation,
            rotation,
            self.pose_noise.translation_variance,
            self.pose_noise.rotation_variance,
        )
    }

    /// Encoder record whose pair covariance follows from the configured
    /// per-wheel variances and the `nominal` geometry.
    pub fn wheel_measurement(
        &self,
        timestamp: Real,
        axle: Axle,
        left_rate: Real,
        right_rate: Real,
        nominal: &WheelOdometryParams,
    ) -> WheelMeasurement {
        let covariance: Mat2 = nominal.pair_covariance(
            axle,
            self.odometry.wheel_noise.left_variance,
            self.odometry.wheel_noise.right_variance,
        );
        WheelMeasurement::new(timestamp, axle, left_rate, right_rate, covariance)
    }

    /// Encoder record carrying a raw steering reading with the configured
    /// steering variance.
    pub fn steered_wheel_measurement(
        &self,
        timestamp: Real,
        axle: Axle,
        rates: (Real, Real),
        steering: Real,
        nominal: &WheelOdometryParams,
    ) -> WheelMeasurement {
        self.wheel_measurement(timestamp, axle, rates.0, rates.1, nominal)
            .with_steering(steering, self.odometry.steering_variance)
    }
}
