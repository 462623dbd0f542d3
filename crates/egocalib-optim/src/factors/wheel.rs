use egocalib_core::{
    ackermann_angles, kinematic_steering_angle, lit, odometry_velocities, speed_yaw_pair, steered_ground_speeds,
    steering_angle, wheel_ground_speeds, Axle, CalibError, Mat2, Real, SteeringParams, SteeringReading,
    WheelMeasurement, WheelOdometryParams,
};
use nalgebra::{DMatrix, DVector, Matrix1, Matrix2, RealField, SMatrix, SVector, Vector1, Vector2, Vector3};
use num_dual::{jacobian, DualSVec64};

use super::{expect_params, sqrt_information, ErrorTerm, FactorEval};
use crate::trajectory::{BodyVelocities, SplineWindow, TrajectorySample};

const WHEEL_INPUTS: usize = 19;
const STEERED_INPUTS: usize = 23;
const CONSTRAINT_INPUTS: usize = 12;

const WHEELS_AT: usize = 12;
const STEERING_AT: usize = WHEELS_AT + WheelOdometryParams::DIM;

fn vec3<T: RealField>(z: &[T], at: usize) -> Vector3<T> {
    Vector3::new(z[at].clone(), z[at + 1].clone(), z[at + 2].clone())
}

/// Odometry-frame `(v_o, ω_o)` from `z = [v_ref, ω_ref, t_extr, θ_extr, ..]`.
fn odometry_frame<T: RealField>(z: &[T]) -> (Vector3<T>, Vector3<T>) {
    odometry_velocities(&vec3(z, 0), &vec3(z, 3), &vec3(z, 6), &vec3(z, 9))
}

/// Predicted minus measured `(speed, yaw rate)`.
///
/// `z = [v_ref(3), ω_ref(3), t_extr(3), θ_extr(3), wheel params(7)]`, followed
/// by the steering coefficients(4) when a steering `reading` is given. With a
/// reading the front wheels roll along their Ackermann headings; without one
/// they roll along their contact velocity.
fn wheel_model<T: RealField>(
    z: &[T],
    axle: Axle,
    left_rate: f64,
    right_rate: f64,
    reading: Option<f64>,
) -> Vector2<T> {
    let (v_o, w_o) = odometry_frame(z);
    let p = &z[WHEELS_AT..STEERING_AT];
    let (e, r_left, r_right) = match axle {
        Axle::Rear => (
            p[WheelOdometryParams::REAR_HALF_TRACK].clone(),
            p[WheelOdometryParams::REAR_LEFT_RADIUS].clone(),
            p[WheelOdometryParams::REAR_RIGHT_RADIUS].clone(),
        ),
        Axle::Front => (
            p[WheelOdometryParams::FRONT_HALF_TRACK].clone(),
            p[WheelOdometryParams::FRONT_LEFT_RADIUS].clone(),
            p[WheelOdometryParams::FRONT_RIGHT_RADIUS].clone(),
        ),
    };
    let wheelbase = p[WheelOdometryParams::WHEELBASE].clone();
    let (left, right) = match reading {
        Some(s) => {
            let centre = steering_angle(&z[STEERING_AT..STEERING_AT + SteeringParams::DIM], lit::<T>(s));
            let angles = ackermann_angles(centre, wheelbase.clone(), e.clone());
            steered_ground_speeds(&v_o, &w_o, wheelbase, e.clone(), angles)
        }
        None => wheel_ground_speeds(&v_o, &w_o, wheelbase, e.clone(), axle),
    };
    let (speed, yaw) = speed_yaw_pair(left, right, e.clone());
    let (measured_speed, measured_yaw) = speed_yaw_pair(
        r_left * lit::<T>(left_rate),
        r_right * lit::<T>(right_rate),
        e,
    );
    Vector2::new(speed - measured_speed, yaw - measured_yaw)
}

/// Calibrated steering angle minus the kinematic one.
///
/// `z = [v_ref(3), ω_ref(3), t_extr(3), θ_extr(3), wheel params(7), steering(4)]`.
fn steering_model<T: RealField>(z: &[T], reading: f64) -> Vector1<T> {
    let (v_o, w_o) = odometry_frame(z);
    let wheelbase = z[WHEELS_AT + WheelOdometryParams::WHEELBASE].clone();
    let predicted = steering_angle(&z[STEERING_AT..STEERING_AT + SteeringParams::DIM], lit::<T>(reading));
    Vector1::new(predicted - kinematic_steering_angle(&v_o, &w_o, wheelbase))
}

/// Lateral and vertical odometry-frame velocity.
///
/// `z = [v_ref(3), ω_ref(3), t_extr(3), θ_extr(3)]`.
fn constraint_model<T: RealField>(z: &[T]) -> Vector2<T> {
    let (v_o, _) = odometry_frame(z);
    Vector2::new(v_o.y.clone(), v_o.z.clone())
}

/// Jacobian blocks for the trajectory and delay parameters given
/// `∂r/∂[v; ω]` of a velocity-driven residual.
fn velocity_chain<const R: usize>(
    sqrt_info: &SMatrix<f64, R, R>,
    d_velocity: &SMatrix<f64, R, 6>,
    sample: &TrajectorySample,
    velocities: &BodyVelocities,
    count: usize,
) -> Vec<DMatrix<f64>> {
    let weighted = sqrt_info * d_velocity;
    let mut blocks = Vec::with_capacity(count + 1);
    for i in 0..count {
        let local = i.wrapping_sub(sample.offset());
        if local < sample.active() {
            let block = weighted * velocities.d_control[local];
            blocks.push(DMatrix::from_column_slice(R, 6, block.as_slice()));
        } else {
            blocks.push(DMatrix::zeros(R, 6));
        }
    }
    let d_delay = weighted * velocities.d_time;
    blocks.push(DMatrix::from_column_slice(R, 1, d_delay.as_slice()));
    blocks
}

/// Splits an input Jacobian into `∂r/∂[v; ω]` and whitened blocks of the
/// given widths for the inputs that follow.
fn split_inputs<const R: usize, const N: usize>(
    h: &SMatrix<f64, R, N>,
    sqrt_info: &SMatrix<f64, R, R>,
    widths: &[usize],
) -> (SMatrix<f64, R, 6>, Vec<DMatrix<f64>>) {
    let d_velocity = h.fixed_view::<R, 6>(0, 0).into_owned();
    let mut at = 6;
    let blocks = widths
        .iter()
        .map(|&w| {
            let block = sqrt_info * h.view((0, at), (R, w));
            at += w;
            DMatrix::from_column_slice(R, w, block.as_slice())
        })
        .collect();
    (d_velocity, blocks)
}

/// `[v_ref; ω_ref]` followed by the flattened parameter blocks.
fn stack_inputs(velocities: &BodyVelocities, extra: &[&DVector<f64>]) -> Vec<f64> {
    velocities
        .linear
        .iter()
        .chain(velocities.angular.iter())
        .chain(extra.iter().flat_map(|b| b.iter()))
        .copied()
        .collect()
}

/// Samples the window at the delayed stamp; `params = [traj.., delay, rest..]`.
fn delayed_inputs(
    window: &SplineWindow,
    stamp: Real,
    params: &[&DVector<f64>],
) -> Result<(TrajectorySample, BodyVelocities, Vec<f64>), CalibError> {
    let (control, rest) = params.split_at(window.count());
    let sample = window.sample(stamp + rest[0][0], control)?;
    let velocities = sample.body_velocities();
    let z = stack_inputs(&velocities, &rest[1..]);
    Ok((sample, velocities, z))
}

/// Wheel encoder pair of one axle against the trajectory.
///
/// The trajectory's body velocities at `τ + δ` are moved into the odometry
/// frame through the extrinsic, turned into wheel ground speeds by the
/// kinematic model, and compared with the encoder rates scaled by the wheel
/// radii, all as a `(speed, yaw rate)` pair. A front-axle record that carries
/// a steering reading also depends on the steering coefficients.
#[derive(Debug, Clone, PartialEq)]
pub struct WheelErrorTerm {
    stamp: Real,
    axle: Axle,
    left_rate: Real,
    right_rate: Real,
    steering: Option<Real>,
    sqrt_info: Mat2,
    window: SplineWindow,
}

impl WheelErrorTerm {
    pub fn new(measurement: &WheelMeasurement, window: SplineWindow) -> Result<Self, CalibError> {
        measurement.validate()?;
        let steering = match measurement.axle {
            Axle::Front => measurement.steering.map(|s| s.value),
            Axle::Rear => None,
        };
        Ok(Self {
            stamp: measurement.timestamp,
            axle: measurement.axle,
            left_rate: measurement.left_rate,
            right_rate: measurement.right_rate,
            steering,
            sqrt_info: sqrt_information(&measurement.covariance)?,
            window,
        })
    }

    pub fn axle(&self) -> Axle {
        self.axle
    }

    /// `true` when the front wheels follow the measured steering angle.
    pub fn is_steered(&self) -> bool {
        self.steering.is_some()
    }

    fn inputs(
        &self,
        params: &[&DVector<f64>],
    ) -> Result<(TrajectorySample, BodyVelocities, Vec<f64>), CalibError> {
        expect_params(self.label(), params, &self.param_dims())?;
        delayed_inputs(&self.window, self.stamp, params)
    }
}

impl ErrorTerm for WheelErrorTerm {
    fn label(&self) -> &'static str {
        "wheel"
    }

    fn residual_dim(&self) -> usize {
        2
    }

    fn param_dims(&self) -> Vec<usize> {
        let mut dims = vec![6; self.window.count()];
        dims.extend_from_slice(&[1, 3, 3, WheelOdometryParams::DIM]);
        if self.is_steered() {
            dims.push(SteeringParams::DIM);
        }
        dims
    }

    fn evaluate_residual(&self, params: &[&DVector<f64>]) -> Result<DVector<f64>, CalibError> {
        let (_, _, z) = self.inputs(params)?;
        let r = self.sqrt_info * wheel_model(&z, self.axle, self.left_rate, self.right_rate, self.steering);
        Ok(DVector::from_column_slice(r.as_slice()))
    }

    fn evaluate_jacobians(&self, params: &[&DVector<f64>]) -> Result<FactorEval, CalibError> {
        let (sample, velocities, z) = self.inputs(params)?;
        let (axle, left_rate, right_rate, steering) = (self.axle, self.left_rate, self.right_rate, self.steering);
        let (r, d_velocity, calibration) = if steering.is_some() {
            let (r, h) = jacobian(
                |z: SVector<DualSVec64<STEERED_INPUTS>, STEERED_INPUTS>| {
                    wheel_model(z.as_slice(), axle, left_rate, right_rate, steering)
                },
                SVector::<f64, STEERED_INPUTS>::from_column_slice(&z),
            );
            let widths = [3, 3, WheelOdometryParams::DIM, SteeringParams::DIM];
            let (d_velocity, blocks) = split_inputs(&h, &self.sqrt_info, &widths);
            (r, d_velocity, blocks)
        } else {
            let (r, h) = jacobian(
                |z: SVector<DualSVec64<WHEEL_INPUTS>, WHEEL_INPUTS>| {
                    wheel_model(z.as_slice(), axle, left_rate, right_rate, None)
                },
                SVector::<f64, WHEEL_INPUTS>::from_column_slice(&z),
            );
            let (d_velocity, blocks) = split_inputs(&h, &self.sqrt_info, &[3, 3, WheelOdometryParams::DIM]);
            (r, d_velocity, blocks)
        };

        let mut jacobians = velocity_chain(
            &self.sqrt_info,
            &d_velocity,
            &sample,
            &velocities,
            self.window.count(),
        );
        jacobians.extend(calibration);

        let residual = self.sqrt_info * r;
        Ok(FactorEval {
            residual: DVector::from_column_slice(residual.as_slice()),
            jacobians,
        })
    }
}

/// Steering reading against the trajectory.
///
/// The steering polynomial maps the raw reading to a centre steering angle,
/// which must match the heading of the front axle's centre in the odometry
/// frame at `τ + δ`.
#[derive(Debug, Clone, PartialEq)]
pub struct SteeringErrorTerm {
    stamp: Real,
    reading: Real,
    sqrt_info: Matrix1<f64>,
    window: SplineWindow,
}

impl SteeringErrorTerm {
    pub fn new(stamp: Real, reading: SteeringReading, window: SplineWindow) -> Result<Self, CalibError> {
        if !(reading.value.is_finite() && reading.variance.is_finite() && reading.variance > 0.0) {
            return Err(CalibError::invalid(format!(
                "steering reading at t={stamp} needs a finite value and a positive variance"
            )));
        }
        Ok(Self {
            stamp,
            reading: reading.value,
            sqrt_info: Matrix1::new(1.0 / reading.variance.sqrt()),
            window,
        })
    }
}

impl ErrorTerm for SteeringErrorTerm {
    fn label(&self) -> &'static str {
        "steering"
    }

    fn residual_dim(&self) -> usize {
        1
    }

    fn param_dims(&self) -> Vec<usize> {
        let mut dims = vec![6; self.window.count()];
        dims.extend_from_slice(&[1, 3, 3, WheelOdometryParams::DIM, SteeringParams::DIM]);
        dims
    }

    fn evaluate_residual(&self, params: &[&DVector<f64>]) -> Result<DVector<f64>, CalibError> {
        expect_params(self.label(), params, &self.param_dims())?;
        let (_, _, z) = delayed_inputs(&self.window, self.stamp, params)?;
        let r = self.sqrt_info * steering_model(&z, self.reading);
        Ok(DVector::from_column_slice(r.as_slice()))
    }

    fn evaluate_jacobians(&self, params: &[&DVector<f64>]) -> Result<FactorEval, CalibError> {
        expect_params(self.label(), params, &self.param_dims())?;
        let (sample, velocities, z) = delayed_inputs(&self.window, self.stamp, params)?;
        let reading = self.reading;
        let (r, h) = jacobian(
            |z: SVector<DualSVec64<STEERED_INPUTS>, STEERED_INPUTS>| steering_model(z.as_slice(), reading),
            SVector::<f64, STEERED_INPUTS>::from_column_slice(&z),
        );
        let widths = [3, 3, WheelOdometryParams::DIM, SteeringParams::DIM];
        let (d_velocity, calibration) = split_inputs(&h, &self.sqrt_info, &widths);
        let mut jacobians = velocity_chain(
            &self.sqrt_info,
            &d_velocity,
            &sample,
            &velocities,
            self.window.count(),
        );
        jacobians.extend(calibration);

        let residual = self.sqrt_info * r;
        Ok(FactorEval {
            residual: DVector::from_column_slice(residual.as_slice()),
            jacobians,
        })
    }
}

/// Non-holonomic constraint: the odometry frame does not slide sideways or
/// leave the ground, `(v_o,y, v_o,z) ≈ 0`.
#[derive(Debug, Clone, PartialEq)]
pub struct NonHolonomicErrorTerm {
    stamp: Real,
    sqrt_info: Mat2,
    window: SplineWindow,
}

impl NonHolonomicErrorTerm {
    pub fn new(
        stamp: Real,
        lateral_variance: Real,
        vertical_variance: Real,
        window: SplineWindow,
    ) -> Result<Self, CalibError> {
        let covariance = Matrix2::new(lateral_variance, 0.0, 0.0, vertical_variance);
        Ok(Self {
            stamp,
            sqrt_info: sqrt_information(&covariance)?,
            window,
        })
    }
}

impl ErrorTerm for NonHolonomicErrorTerm {
    fn label(&self) -> &'static str {
        "non_holonomic"
    }

    fn residual_dim(&self) -> usize {
        2
    }

    fn param_dims(&self) -> Vec<usize> {
        let mut dims = vec![6; self.window.count()];
        dims.extend_from_slice(&[1, 3, 3]);
        dims
    }

    fn evaluate_residual(&self, params: &[&DVector<f64>]) -> Result<DVector<f64>, CalibError> {
        expect_params(self.label(), params, &self.param_dims())?;
        let (_, _, z) = delayed_inputs(&self.window, self.stamp, params)?;
        let r = self.sqrt_info * constraint_model(&z);
        Ok(DVector::from_column_slice(r.as_slice()))
    }

    fn evaluate_jacobians(&self, params: &[&DVector<f64>]) -> Result<FactorEval, CalibError> {
        expect_params(self.label(), params, &self.param_dims())?;
        let (sample, velocities, z) = delayed_inputs(&self.window, self.stamp, params)?;
        let (r, h) = jacobian(
            |z: SVector<DualSVec64<CONSTRAINT_INPUTS>, CONSTRAINT_INPUTS>| constraint_model(z.as_slice()),
            SVector::<f64, CONSTRAINT_INPUTS>::from_column_slice(&z),
        );
        let (d_velocity, extrinsic) = split_inputs(&h, &self.sqrt_info, &[3, 3]);
        let mut jacobians = velocity_chain(
            &self.sqrt_info,
            &d_velocity,
            &sample,
            &velocities,
            self.window.count(),
        );
        jacobians.extend(extrinsic);

        let residual = self.sqrt_info * r;
        Ok(FactorEval {
            residual: DVector::from_column_slice(residual.as_slice()),
            jacobians,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::trajectory::SplineWindow;
    use egocalib_core::synthetic::{vehicle::uniform_stamps, VehicleScenario};
    use egocalib_core::{BSplinePose, SplineOptions, Vec3};

    struct Fixture {
        scenario: VehicleScenario,
        curve: BSplinePose,
    }

    fn fixture() -> Fixture {
        let scenario = VehicleScenario {
            pose_sigma: 0.0,
            wheel_sigma: 0.0,
            steering_sigma: 0.0,
            min_declared_sigma: 1e-2,
            ..VehicleScenario::default()
        };
        let poses = scenario.pose_measurements(&uniform_stamps(0.0, 0.02, 301));
        let opts = SplineOptions {
            knots_per_second: 10.0,
            translation_lambda: 1e-10,
            rotation_lambda: 1e-10,
            ..SplineOptions::default()
        };
        let curve = BSplinePose::fit_measurements(&poses, &opts).unwrap();
        Fixture { scenario, curve }
    }

    fn params_for(
        f: &Fixture,
        w: &SplineWindow,
        delay: f64,
        wheels: &WheelOdometryParams,
        steering: Option<&SteeringParams>,
    ) -> Vec<DVector<f64>> {
        let mut out: Vec<DVector<f64>> = (w.first()..w.first() + w.count())
            .map(|i| DVector::from_column_slice(f.curve.control_points()[i].as_slice()))
            .collect();
        let extr = f.scenario.extrinsic;
        out.push(DVector::from_element(1, delay));
        out.push(DVector::from_column_slice(extr.translation.as_slice()));
        out.push(DVector::from_column_slice(extr.rotation.as_slice()));
        out.push(wheels.to_dvec());
        if let Some(steering) = steering {
            out.push(steering.to_dvec());
        }
        out
    }

    fn refs(params: &[DVector<f64>]) -> Vec<&DVector<f64>> {
        params.iter().collect()
    }

    /// Odometry-frame velocities of the fitted curve at `t`.
    fn curve_velocities(f: &Fixture, t: f64) -> (Vec3, Vec3) {
        let s = f.curve.evaluate(t).unwrap();
        f.scenario
            .extrinsic
            .odometry_velocities(&s.linear_velocity_body(), &s.angular_velocity_body())
    }

    /// Encoder record that agrees exactly with the fitted curve, optionally
    /// with a steering reading.
    fn consistent_record(f: &Fixture, stamp: f64, axle: Axle, steered: bool) -> WheelMeasurement {
        let truth = &f.scenario;
        let p = &truth.wheels;
        let (v_o, w_o) = curve_velocities(f, stamp + truth.odometry_delay);
        let e = p.half_track(axle);
        let centre = kinematic_steering_angle(&v_o, &w_o, p.wheelbase);
        let (left, right) = if steered {
            let angles = ackermann_angles(centre, p.wheelbase, e);
            steered_ground_speeds(&v_o, &w_o, p.wheelbase, e, angles)
        } else {
            wheel_ground_speeds(&v_o, &w_o, p.wheelbase, e, axle)
        };
        let (rl, rr) = p.radii(axle);
        let covariance = p.pair_covariance(axle, 1e-4, 1e-4);
        let m = WheelMeasurement::new(stamp, axle, left / rl, right / rr, covariance);
        if steered {
            m.with_steering(truth.steering.reading_for(centre).unwrap(), 1e-4)
        } else {
            m
        }
    }

    #[test]
    fn wheel_residual_vanishes_at_truth() {
        let f = fixture();
        let stamp = 2.5;
        let w = SplineWindow::covering(f.curve.layout(), stamp, 0.05).unwrap();
        let delay = f.scenario.odometry_delay;
        for (axle, steered) in [(Axle::Rear, false), (Axle::Front, false), (Axle::Front, true)] {
            let m = consistent_record(&f, stamp, axle, steered);
            let term = WheelErrorTerm::new(&m, w.clone()).unwrap();
            assert_eq!(term.is_steered(), steered);
            let steering = steered.then_some(&f.scenario.steering);
            let truth = params_for(&f, &w, delay, &f.scenario.wheels, steering);
            let r = term.evaluate_residual(&refs(&truth)).unwrap();
            assert!(r.norm() < 1e-9, "{axle:?} steered={steered}: {r:?}");

            let mut wheels = f.scenario.wheels;
            match axle {
                Axle::Rear => wheels.rear_left_radius += 0.01,
                Axle::Front => wheels.front_right_radius += 0.01,
            }
            let bad = params_for(&f, &w, delay, &wheels, steering);
            let r_bad = term.evaluate_residual(&refs(&bad)).unwrap();
            assert!(r_bad.norm() > 5.0, "{axle:?} steered={steered}: {r_bad:?}");
        }
    }

    #[test]
    fn steering_residual_vanishes_at_truth() {
        let f = fixture();
        let stamp = 4.1;
        let w = SplineWindow::covering(f.curve.layout(), stamp, 0.05).unwrap();
        let m = consistent_record(&f, stamp, Axle::Front, true);
        let reading = m.steering.unwrap();
        let term = SteeringErrorTerm::new(stamp, reading, w.clone()).unwrap();
        let delay = f.scenario.odometry_delay;
        let truth = params_for(&f, &w, delay, &f.scenario.wheels, Some(&f.scenario.steering));
        let r = term.evaluate_residual(&refs(&truth)).unwrap();
        assert!(r.norm() < 1e-9, "{r:?}");

        let biased = SteeringParams {
            a0: f.scenario.steering.a0 + 0.01,
            ..f.scenario.steering
        };
        let bad = params_for(&f, &w, delay, &f.scenario.wheels, Some(&biased));
        let r_bad = term.evaluate_residual(&refs(&bad)).unwrap();
        // 0.01 rad against a 0.01 rad sigma.
        assert!((r_bad[0] - 1.0).abs() < 1e-6, "{r_bad:?}");

        let zero = SteeringReading {
            value: 0.0,
            variance: 0.0,
        };
        assert!(SteeringErrorTerm::new(stamp, zero, w).is_err());
    }

    #[test]
    fn wheel_model_is_exactly_zero_on_consistent_inputs() {
        let scenario = VehicleScenario::default();
        let t = 4.2;
        let v_o = scenario.motion.linear_velocity_body(t);
        let w_o = scenario.motion.angular_velocity_body(t);
        // Reference-frame velocities consistent with the odometry motion.
        let c = scenario.extrinsic.rotation_matrix();
        let w_i = c * w_o;
        let v_i = c * v_o - w_i.cross(&scenario.extrinsic.translation);
        let mut z = vec![v_i.x, v_i.y, v_i.z, w_i.x, w_i.y, w_i.z];
        z.extend_from_slice(scenario.extrinsic.translation.as_slice());
        z.extend_from_slice(scenario.extrinsic.rotation.as_slice());
        z.extend(scenario.wheels.to_dvec().iter());
        for axle in [Axle::Rear, Axle::Front] {
            let (l, r) = wheel_ground_speeds(
                &v_o,
                &w_o,
                scenario.wheels.wheelbase,
                scenario.wheels.half_track(axle),
                axle,
            );
            let (rl, rr) = scenario.wheels.radii(axle);
            let res = wheel_model(&z, axle, l / rl, r / rr, None);
            assert!(res.norm() < 1e-12, "{axle:?}: {res:?}");
        }

        // Planar truth: the steered model agrees with the rolling one.
        let (l, r) = wheel_ground_speeds(
            &v_o,
            &w_o,
            scenario.wheels.wheelbase,
            scenario.wheels.front_half_track,
            Axle::Front,
        );
        let (rl, rr) = scenario.wheels.radii(Axle::Front);
        let reading = scenario.steering.reading_for(scenario.true_steering_angle(t)).unwrap();
        z.extend(scenario.steering.to_dvec().iter());
        let res = wheel_model(&z, Axle::Front, l / rl, r / rr, Some(reading));
        assert!(res.norm() < 1e-12, "steered: {res:?}");
        assert!(steering_model(&z, reading).norm() < 1e-12);
    }

    fn check_jacobians(term: &dyn ErrorTerm, params: &[DVector<f64>]) {
        let eval = term.evaluate_jacobians(&refs(params)).unwrap();
        assert_eq!(eval.jacobians.len(), params.len());
        let h = 1e-6;
        for (b, block) in params.iter().enumerate() {
            for k in 0..block.len() {
                let mut up = params.to_vec();
                let mut down = params.to_vec();
                up[b][k] += h;
                down[b][k] -= h;
                let ru = term.evaluate_residual(&refs(&up)).unwrap();
                let rd = term.evaluate_residual(&refs(&down)).unwrap();
                let fd = (ru - rd) / (2.0 * h);
                let analytic = eval.jacobians[b].column(k);
                let scale = fd.norm().max(1.0);
                assert!(
                    (&fd - analytic).norm() < 1e-5 * scale,
                    "{} block {b} column {k}: {fd:?} vs {analytic:?}",
                    term.label()
                );
            }
        }
    }

    #[test]
    fn jacobians_match_finite_differences() {
        let f = fixture();
        let stamp = 3.33;
        let w = SplineWindow::covering(f.curve.layout(), stamp, 0.05).unwrap();
        let mut wheels = f.scenario.wheels;
        wheels.rear_left_radius += 0.01;
        let steering = SteeringParams {
            a2: 0.05,
            a3: -0.02,
            ..f.scenario.steering
        };
        let mut params = params_for(&f, &w, 0.013, &wheels, Some(&steering));
        params[w.count() + 2] = DVector::from_column_slice(&[0.02, -0.03, 0.05]);
        let unsteered = &params[..params.len() - 1];

        for axle in [Axle::Rear, Axle::Front] {
            let m = &f.scenario.wheel_measurements(&[stamp], axle)[0];
            let term = WheelErrorTerm::new(m, w.clone()).unwrap();
            check_jacobians(&term, unsteered);
        }

        let m = consistent_record(&f, stamp, Axle::Front, true);
        let steered = WheelErrorTerm::new(&m, w.clone()).unwrap();
        check_jacobians(&steered, &params);
        let reading = m.steering.unwrap();
        let term = SteeringErrorTerm::new(stamp, reading, w.clone()).unwrap();
        check_jacobians(&term, &params);

        let nhc = NonHolonomicErrorTerm::new(stamp, 1e-2, 1e-2, w.clone()).unwrap();
        check_jacobians(&nhc, &unsteered[..unsteered.len() - 1]);
    }

    #[test]
    fn rear_records_ignore_steering() {
        let f = fixture();
        let w = SplineWindow::covering(f.curve.layout(), 2.0, 0.05).unwrap();
        let m = consistent_record(&f, 2.0, Axle::Rear, false).with_steering(0.1, 1e-4);
        let term = WheelErrorTerm::new(&m, w.clone()).unwrap();
        assert!(!term.is_steered());
        assert_eq!(term.param_dims().len(), w.count() + 4);
    }
}
