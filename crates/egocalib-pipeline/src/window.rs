//! Window lifecycle: buffering, solve triggers and carry-forward.

use crate::config::{CalibratorOptions, WindowMode};
use egocalib_core::{
    disambiguate_rotvec, BSplinePose, CalibError, Extrinsic, PoseMeasurement, Real, SplineOptions,
    SteeringParams, Timestamped, Vec3, Vec6, WheelMeasurement, WheelOdometryParams,
};
use egocalib_optim::{
    optimize_odometry, BackendSolveOptions, CancelToken, OdometryCalibration, OdometryDataset,
    OdometryInit, OdometrySolveOptions, SolveStatus,
};
use log::{debug, info, warn};
use serde::{Deserialize, Serialize};

/// Static parameter estimates carried from one window to the next.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct CalibrationEstimate {
    pub wheels: WheelOdometryParams,
    pub steering: SteeringParams,
    pub extrinsic: Extrinsic,
    pub pose_delay: Real,
    pub odometry_delay: Real,
}

impl CalibrationEstimate {
    /// Nominal geometry with zero delays and the identity steering map.
    pub fn new(wheels: WheelOdometryParams, extrinsic: Extrinsic) -> Self {
        Self {
            wheels,
            steering: SteeringParams::default(),
            extrinsic,
            pose_delay: 0.0,
            odometry_delay: 0.0,
        }
    }
}

impl Default for CalibrationEstimate {
    fn default() -> Self {
        Self::new(WheelOdometryParams::default(), Extrinsic::identity())
    }
}

impl From<&OdometryCalibration> for CalibrationEstimate {
    fn from(c: &OdometryCalibration) -> Self {
        Self {
            wheels: c.wheels,
            steering: c.steering,
            extrinsic: c.extrinsic,
            pose_delay: c.pose_delay,
            odometry_delay: c.odometry_delay,
        }
    }
}

/// Result of one solved window.
#[derive(Debug, Clone)]
pub struct WindowOutcome {
    /// Zero-based window counter.
    pub index: usize,
    /// First and last pose stamp of the window.
    pub span: (Real, Real),
    pub calibration: OdometryCalibration,
    /// Marginal variances of the free calibration parameters.
    pub variances: Vec<(String, Real)>,
    /// `Σ ln R_ii` over the free calibration parameters, if any is free.
    pub sum_log_diag_r: Option<Real>,
}

impl WindowOutcome {
    pub fn status(&self) -> SolveStatus {
        self.calibration.status
    }
}

/// Buffers both measurement streams and solves a window whenever the
/// configured duration or measurement ceiling is reached.
///
/// Windows are solved strictly in order on the calling thread. Wheel
/// parameters, extrinsic and delays carry forward from every window whose
/// solve converged or ran out of iterations.
#[derive(Debug)]
pub struct WindowController {
    mode: WindowMode,
    window_duration: Real,
    max_measurements: usize,
    min_pose_measurements: usize,
    spline: SplineOptions,
    solve: OdometrySolveOptions,
    backend: BackendSolveOptions,
    estimate: CalibrationEstimate,
    poses: Vec<PoseMeasurement>,
    wheels: Vec<WheelMeasurement>,
    last_pose: Option<Real>,
    last_wheel: Option<Real>,
    previous: Option<BSplinePose>,
    solved: usize,
    cancel: Option<CancelToken>,
}

fn check_order(last: Option<Real>, stamp: Real, stream: &str) -> Result<(), CalibError> {
    match last {
        Some(prev) if stamp <= prev => Err(CalibError::invalid(format!(
            "{stream} timestamp {stamp} does not follow {prev}"
        ))),
        _ => Ok(()),
    }
}

impl WindowController {
    pub fn new(options: &CalibratorOptions, initial: CalibrationEstimate) -> Result<Self, CalibError> {
        options.validate()?;
        initial.wheels.validate()?;
        Ok(Self {
            mode: options.window.mode,
            window_duration: options.window_duration,
            max_measurements: options.window.max_measurements,
            min_pose_measurements: options.window.min_pose_measurements.max(2),
            spline: options.spline_options(),
            solve: options.solve_options()?,
            backend: options.backend_options(),
            estimate: initial,
            poses: Vec::new(),
            wheels: Vec::new(),
            last_pose: None,
            last_wheel: None,
            previous: None,
            solved: 0,
            cancel: None,
        })
    }

    /// Solves observe `token` between iterations.
    pub fn with_cancel_token(mut self, token: CancelToken) -> Self {
        self.cancel = Some(token);
        self
    }

    pub fn estimate(&self) -> &CalibrationEstimate {
        &self.estimate
    }

    /// Buffered `(pose, odometry)` measurement counts.
    pub fn buffered(&self) -> (usize, usize) {
        (self.poses.len(), self.wheels.len())
    }

    /// Number of windows solved so far.
    pub fn windows_solved(&self) -> usize {
        self.solved
    }

    /// Buffers a pose and solves the window if it is due.
    pub fn push_pose(&mut self, m: PoseMeasurement) -> Result<Option<WindowOutcome>, CalibError> {
        m.validate()?;
        check_order(self.last_pose, m.timestamp, "pose")?;
        self.last_pose = Some(m.timestamp);
        self.poses.push(m);
        self.solve_if_due()
    }

    /// Buffers an odometry record and solves the window if it is due.
    pub fn push_wheel(&mut self, m: WheelMeasurement) -> Result<Option<WindowOutcome>, CalibError> {
        m.validate()?;
        check_order(self.last_wheel, m.timestamp, "odometry")?;
        self.last_wheel = Some(m.timestamp);
        self.wheels.push(m);
        self.solve_if_due()
    }

    /// Solves whatever is buffered and empties the buffers.
    ///
    /// Returns `Ok(None)` when too few poses remain for a window.
    pub fn flush(&mut self) -> Result<Option<WindowOutcome>, CalibError> {
        let poses = std::mem::take(&mut self.poses);
        let wheels = std::mem::take(&mut self.wheels);
        if poses.len() < self.min_pose_measurements {
            if !poses.is_empty() {
                warn!(
                    "dropping final {} poses and {} odometry records: below the window minimum",
                    poses.len(),
                    wheels.len()
                );
            }
            return Ok(None);
        }
        self.solve_window(poses, wheels).map(Some)
    }

    fn pose_span(&self) -> Real {
        match (self.poses.first(), self.poses.last()) {
            (Some(a), Some(b)) => b.timestamp - a.timestamp,
            _ => 0.0,
        }
    }

    fn solve_if_due(&mut self) -> Result<Option<WindowOutcome>, CalibError> {
        let by_duration = self.pose_span() >= self.window_duration;
        let by_count = self.poses.len() + self.wheels.len() >= self.max_measurements;
        if !(by_duration || by_count) {
            return Ok(None);
        }
        let end = match self.poses.last() {
            Some(p) => p.timestamp,
            None => {
                warn!(
                    "measurement ceiling reached without poses, dropping {} odometry records",
                    self.wheels.len()
                );
                self.wheels.clear();
                return Ok(None);
            }
        };
        let (poses, wheels) = self.split_at(end);
        if poses.len() < self.min_pose_measurements {
            warn!(
                "measurement ceiling reached with {} poses, dropping the window",
                poses.len()
            );
            return Ok(None);
        }
        self.solve_window(poses, wheels).map(Some)
    }

    /// Takes the window ending at `end` out of the buffers and leaves behind
    /// what the next window keeps.
    fn split_at(&mut self, end: Real) -> (Vec<PoseMeasurement>, Vec<WheelMeasurement>) {
        let keep_from = match self.mode {
            WindowMode::Batch => None,
            WindowMode::Incremental { retain } => Some(end - retain),
        };
        let poses = std::mem::take(&mut self.poses);
        let all_wheels = std::mem::take(&mut self.wheels);
        let (wheels, later): (Vec<_>, Vec<_>) =
            all_wheels.into_iter().partition(|w| w.timestamp <= end);
        self.wheels = later;
        if let Some(cut) = keep_from {
            self.poses = retained(&poses, cut);
            let mut tail = retained(&wheels, cut);
            tail.append(&mut self.wheels);
            self.wheels = tail;
        }
        (poses, wheels)
    }

    fn solve_window(
        &mut self,
        poses: Vec<PoseMeasurement>,
        wheels: Vec<WheelMeasurement>,
    ) -> Result<WindowOutcome, CalibError> {
        let index = self.solved;
        self.solved += 1;
        let dataset = OdometryDataset::new(poses, wheels)?;
        let span = dataset.span();
        debug!(
            "window {index}: {:.3}..{:.3} s, {} poses, {} odometry records",
            span.0,
            span.1,
            dataset.poses.len(),
            dataset.wheels.len()
        );

        let trajectory = self.initial_trajectory(&dataset)?;
        let init = OdometryInit {
            trajectory,
            wheels: self.estimate.wheels,
            steering: self.estimate.steering,
            extrinsic: self.estimate.extrinsic,
            pose_delay: self.estimate.pose_delay,
            odometry_delay: self.estimate.odometry_delay,
        };
        let calibration = optimize_odometry(
            &dataset,
            &init,
            &self.solve,
            &self.backend,
            self.cancel.as_ref(),
        )?;

        match calibration.status {
            SolveStatus::Converged => {}
            SolveStatus::IterationLimit => warn!(
                "window {index} did not converge in {} iterations, carrying its estimate forward",
                calibration.iterations
            ),
            SolveStatus::Cancelled => {
                warn!("window {index} cancelled, estimate not carried forward");
            }
        }
        let (variances, sum_log_diag_r) = match calibration.calibration_columns() {
            Some(_) => (
                calibration.variance_entries()?,
                Some(calibration.sum_log_diag_r()?),
            ),
            None => (Vec::new(), None),
        };
        if calibration.status != SolveStatus::Cancelled {
            self.estimate = CalibrationEstimate::from(&calibration);
            self.previous = match self.mode {
                WindowMode::Incremental { .. } => Some(calibration.trajectory.clone()),
                WindowMode::Batch => None,
            };
        }
        info!(
            "window {index} solved: odometry delay {:.4} s, cost {:.6e}",
            calibration.odometry_delay, calibration.final_cost
        );
        Ok(WindowOutcome {
            index,
            span,
            calibration,
            variances,
            sum_log_diag_r,
        })
    }

    /// Fits the window's starting curve, sampling the previous window's
    /// optimised trajectory wherever it covers a pose stamp.
    fn initial_trajectory(&self, dataset: &OdometryDataset) -> Result<BSplinePose, CalibError> {
        let Some(previous) = &self.previous else {
            return BSplinePose::fit_measurements(&dataset.poses, &self.spline);
        };
        let (start, end) = previous.time_span();
        let times: Vec<Real> = dataset.poses.iter().map(|p| p.timestamp).collect();
        let mut samples: Vec<Vec6> = Vec::with_capacity(times.len());
        let mut reused = 0usize;
        for p in &dataset.poses {
            let mut pose = if p.timestamp >= start && p.timestamp <= end {
                reused += 1;
                previous.pose(p.timestamp)?
            } else {
                p.pose()
            };
            if let Some(prev) = samples.last() {
                let prev_rot: Vec3 = prev.fixed_rows::<3>(3).into_owned();
                let rot: Vec3 = pose.fixed_rows::<3>(3).into_owned();
                pose.fixed_rows_mut::<3>(3)
                    .copy_from(&disambiguate_rotvec(&prev_rot, &rot));
            }
            samples.push(pose);
        }
        debug!("warm start reuses {reused} of {} pose stamps", times.len());
        BSplinePose::fit_samples(&times, &samples, &self.spline)
    }
}

fn retained<M: Timestamped + Clone>(stream: &[M], cut: Real) -> Vec<M> {
    stream
        .iter()
        .filter(|m| m.timestamp() >= cut)
        .cloned()
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::WindowConfig;
    use egocalib_core::synthetic::vehicle::uniform_stamps;
    use egocalib_core::synthetic::VehicleScenario;
    use egocalib_core::Axle;

    fn options(mode: WindowMode, duration: Real) -> CalibratorOptions {
        CalibratorOptions {
            window_duration: duration,
            verbose: false,
            window: WindowConfig {
                mode,
                ..WindowConfig::default()
            },
            ..CalibratorOptions::default()
        }
    }

    fn controller(mode: WindowMode, duration: Real) -> WindowController {
        WindowController::new(&options(mode, duration), CalibrationEstimate::default()).unwrap()
    }

    #[test]
    fn out_of_order_stamps_are_rejected() {
        let scenario = VehicleScenario::default();
        let poses = scenario.pose_measurements(&[0.0, 0.1]);
        let mut ctl = controller(WindowMode::Batch, 10.0);
        ctl.push_pose(poses[1]).unwrap();
        assert!(matches!(ctl.push_pose(poses[0]), Err(CalibError::InvalidInput(_))));
        assert!(matches!(ctl.push_pose(poses[1]), Err(CalibError::InvalidInput(_))));
        assert_eq!(ctl.buffered(), (1, 0));

        let wheels = scenario.wheel_measurements(&[0.5, 0.4], Axle::Rear);
        ctl.push_wheel(wheels[0]).unwrap();
        assert!(ctl.push_wheel(wheels[1]).is_err());
        assert_eq!(ctl.buffered(), (1, 1));
    }

    #[test]
    fn batch_split_keeps_only_later_records() {
        let scenario = VehicleScenario::default();
        let mut ctl = controller(WindowMode::Batch, 10.0);
        ctl.poses = scenario.pose_measurements(&uniform_stamps(0.0, 0.5, 5));
        ctl.wheels = scenario.wheel_measurements(&uniform_stamps(0.25, 0.5, 5), Axle::Rear);
        let (poses, wheels) = ctl.split_at(2.0);
        assert_eq!(poses.len(), 5);
        assert_eq!(wheels.len(), 4);
        assert_eq!(ctl.buffered(), (0, 1));
        assert_eq!(ctl.wheels[0].timestamp, 2.25);
    }

    #[test]
    fn incremental_split_retains_the_tail() {
        let scenario = VehicleScenario::default();
        let mut ctl = controller(WindowMode::Incremental { retain: 1.0 }, 10.0);
        ctl.poses = scenario.pose_measurements(&uniform_stamps(0.0, 0.5, 5));
        ctl.wheels = scenario.wheel_measurements(&uniform_stamps(0.25, 0.5, 5), Axle::Rear);
        let (poses, wheels) = ctl.split_at(2.0);
        assert_eq!((poses.len(), wheels.len()), (5, 4));
        let kept: Vec<Real> = ctl.poses.iter().map(|p| p.timestamp).collect();
        assert_eq!(kept, vec![1.0, 1.5, 2.0]);
        let kept: Vec<Real> = ctl.wheels.iter().map(|w| w.timestamp).collect();
        assert_eq!(kept, vec![1.25, 1.75, 2.25]);
    }

    #[test]
    fn flush_below_minimum_drops_the_buffer() {
        let scenario = VehicleScenario::default();
        let mut ctl = controller(WindowMode::Batch, 10.0);
        for p in scenario.pose_measurements(&uniform_stamps(0.0, 0.1, 5)) {
            assert!(ctl.push_pose(p).unwrap().is_none());
        }
        assert!(ctl.flush().unwrap().is_none());
        assert_eq!(ctl.buffered(), (0, 0));
        assert_eq!(ctl.windows_solved(), 0);
    }

    #[test]
    fn retain_must_be_shorter_than_the_window() {
        let opts = options(WindowMode::Incremental { retain: 10.0 }, 10.0);
        assert!(WindowController::new(&opts, CalibrationEstimate::default()).is_err());
    }
}
