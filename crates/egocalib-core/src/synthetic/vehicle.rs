//! Synthetic non-holonomic vehicle.
//!
//! The odometry frame moves with body velocity `(s(t), 0, 0)` and a
//! roll/pitch/yaw attitude made of sinusoids, so the vehicle never slips
//! sideways and the lever arm of every extrinsic axis is excited. The
//! reference (pose) sensor is rigidly attached through an [`Extrinsic`].

use nalgebra::Rotation3;
use std::f64::consts::TAU;

use crate::{
    kinematic_steering_angle, matrix_to_rotvec, rotvec_to_matrix, speed_yaw_pair, unwrap_rotvecs,
    wheel_ground_speeds, Axle, CalibError, Extrinsic, Mat3, PoseMeasurement, Real, SteeringParams, Stream,
    Vec3, WheelMeasurement, WheelOdometryParams,
};

use super::GaussianNoise;

/// One sinusoidal channel `a · sin(2π f t + φ)`.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Oscillation {
    pub amplitude: Real,
    pub frequency: Real,
    pub phase: Real,
}

impl Oscillation {
    pub fn new(amplitude: Real, frequency: Real, phase: Real) -> Self {
        Self {
            amplitude,
            frequency,
            phase,
        }
    }

    fn value(&self, t: Real) -> Real {
        self.amplitude * (TAU * self.frequency * t + self.phase).sin()
    }

    fn rate(&self, t: Real) -> Real {
        self.amplitude * TAU * self.frequency * (TAU * self.frequency * t + self.phase).cos()
    }
}

/// Ground-truth motion of the odometry frame.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct VehicleMotion {
    pub base_speed: Real,
    pub speed: Oscillation,
    pub yaw: Oscillation,
    pub pitch: Oscillation,
    pub roll: Oscillation,
}

impl Default for VehicleMotion {
    fn default() -> Self {
        Self {
            base_speed: 3.0,
            speed: Oscillation::new(1.0, 0.13, 0.4),
            yaw: Oscillation::new(0.8, 0.07, 0.0),
            pitch: Oscillation::new(0.06, 0.31, 1.1),
            roll: Oscillation::new(0.08, 0.23, 2.3),
        }
    }
}

const INTEGRATION_STEP: Real = 1e-3;

impl VehicleMotion {
    /// Forward speed `s(t)`.
    pub fn forward_speed(&self, t: Real) -> Real {
        self.base_speed + self.speed.value(t)
    }

    /// Rotation from the odometry frame to the world frame.
    pub fn orientation(&self, t: Real) -> Mat3 {
        Rotation3::from_euler_angles(self.roll.value(t), self.pitch.value(t), self.yaw.value(t))
            .into_inner()
    }

    pub fn linear_velocity_body(&self, t: Real) -> Vec3 {
        Vec3::new(self.forward_speed(t), 0.0, 0.0)
    }

    /// Body angular velocity from the Z-Y-X Euler rates.
    pub fn angular_velocity_body(&self, t: Real) -> Vec3 {
        let (phi, theta) = (self.roll.value(t), self.pitch.value(t));
        let (dphi, dtheta, dpsi) = (self.roll.rate(t), self.pitch.rate(t), self.yaw.rate(t));
        Vec3::new(
            dphi - dpsi * theta.sin(),
            dtheta * phi.cos() + dpsi * theta.cos() * phi.sin(),
            -dtheta * phi.sin() + dpsi * theta.cos() * phi.cos(),
        )
    }

    /// World position, integrated from the origin at `t = 0` (Simpson rule).
    pub fn position(&self, t: Real) -> Vec3 {
        let mut n = (t.abs() / INTEGRATION_STEP).ceil() as usize;
        n = (n.max(2) + 1) & !1;
        let h = t / n as Real;
        let f = |tau: Real| self.orientation(tau) * self.linear_velocity_body(tau);
        let mut sum = f(0.0) + f(t);
        for i in 1..n {
            let w = if i % 2 == 1 { 4.0 } else { 2.0 };
            sum += f(i as Real * h) * w;
        }
        sum * (h / 3.0)
    }
}

/// Ground truth plus sensor setup for generating measurement streams.
#[derive(Debug, Clone, PartialEq)]
pub struct VehicleScenario {
    pub motion: VehicleMotion,
    pub extrinsic: Extrinsic,
    pub wheels: WheelOdometryParams,
    pub steering: SteeringParams,
    pub pose_delay: Real,
    pub odometry_delay: Real,
    /// Standard deviation of pose translation (m) and rotation (rad) noise.
    pub pose_sigma: Real,
    /// Standard deviation of wheel rate noise (rad/s).
    pub wheel_sigma: Real,
    /// Standard deviation of the steering reading noise.
    pub steering_sigma: Real,
    /// Floor applied to the declared standard deviations.
    pub min_declared_sigma: Real,
    pub seed: u64,
}

impl Default for VehicleScenario {
    fn default() -> Self {
        Self {
            motion: VehicleMotion::default(),
            extrinsic: Extrinsic::new(Vec3::new(0.1, 0.0, 0.2), Vec3::zeros()),
            wheels: WheelOdometryParams::default(),
            steering: SteeringParams {
                a0: 0.02,
                a1: 1.1,
                a2: 0.0,
                a3: 0.0,
            },
            pose_delay: 0.0,
            odometry_delay: 0.02,
            pose_sigma: 1e-3,
            wheel_sigma: 1e-3,
            steering_sigma: 1e-3,
            min_declared_sigma: 1e-4,
            seed: 0x5EED,
        }
    }
}

impl VehicleScenario {
    /// World pose `(position, rotation)` of the reference sensor.
    pub fn reference_pose(&self, t: Real) -> (Vec3, Mat3) {
        let c_wo = self.motion.orientation(t);
        let c_io = self.extrinsic.rotation_matrix();
        let c_wi = c_wo * c_io.transpose();
        let p_i = self.motion.position(t) - c_wi * self.extrinsic.translation;
        (p_i, c_wi)
    }

    /// Noisy pose measurements stamped at `stamps`, with unwrapped rotations.
    pub fn pose_measurements(&self, stamps: &[Real]) -> Vec<PoseMeasurement> {
        let noise = GaussianNoise::new(self.seed ^ stream_tag(Stream::Pose), self.pose_sigma);
        let declared = self.pose_sigma.max(self.min_declared_sigma).powi(2);
        let mut rotations = Vec::with_capacity(stamps.len());
        let mut translations = Vec::with_capacity(stamps.len());
        for (i, &tau) in stamps.iter().enumerate() {
            let (p, c) = self.reference_pose(tau + self.pose_delay);
            let dr = rotvec_to_matrix(&noise.sample3(1, i));
            translations.push(p + noise.sample3(0, i));
            rotations.push(matrix_to_rotvec(&(c * dr)));
        }
        unwrap_rotvecs(&mut rotations);
        stamps
            .iter()
            .zip(translations)
            .zip(rotations)
            .map(|((&tau, p), r)| PoseMeasurement::with_variances(tau, p, r, declared, declared))
            .collect()
    }

    /// Noisy encoder records of one axle stamped at `stamps`.
    pub fn wheel_measurements(&self, stamps: &[Real], axle: Axle) -> Vec<WheelMeasurement> {
        let channel = match axle {
            Axle::Rear => 0,
            Axle::Front => 1,
        };
        let noise = GaussianNoise::new(self.seed ^ stream_tag(Stream::Odometry), self.wheel_sigma);
        let declared = self.wheel_sigma.max(self.min_declared_sigma).powi(2);
        let covariance = self.wheels.pair_covariance(axle, declared, declared);
        let (rl, rr) = self.wheels.radii(axle);
        stamps
            .iter()
            .enumerate()
            .map(|(i, &tau)| {
                let t = tau + self.odometry_delay;
                let (left, right) = wheel_ground_speeds(
                    &self.motion.linear_velocity_body(t),
                    &self.motion.angular_velocity_body(t),
                    self.wheels.wheelbase,
                    self.wheels.half_track(axle),
                    axle,
                );
                WheelMeasurement::new(
                    tau,
                    axle,
                    left / rl + noise.sample(2 * channel, i),
                    right / rr + noise.sample(2 * channel + 1, i),
                    covariance,
                )
            })
            .collect()
    }

    /// Encoder records of one axle that also carry the raw steering reading.
    pub fn steered_wheel_measurements(&self, stamps: &[Real], axle: Axle) -> Result<Vec<WheelMeasurement>, CalibError> {
        let noise = GaussianNoise::new(self.seed ^ stream_tag(Stream::Odometry), self.steering_sigma);
        let declared = self.steering_sigma.max(self.min_declared_sigma).powi(2);
        let channel = match axle {
            Axle::Rear => 4,
            Axle::Front => 5,
        };
        self.wheel_measurements(stamps, axle)
            .into_iter()
            .enumerate()
            .map(|(i, m)| {
                let angle = self.true_steering_angle(m.timestamp + self.odometry_delay);
                let reading = self.steering.reading_for(angle)?;
                Ok(m.with_steering(reading + noise.sample(channel, i), declared))
            })
            .collect()
    }

    /// Centre steering angle at true time `t`.
    pub fn true_steering_angle(&self, t: Real) -> Real {
        kinematic_steering_angle(
            &self.motion.linear_velocity_body(t),
            &self.motion.angular_velocity_body(t),
            self.wheels.wheelbase,
        )
    }

    /// True `(speed, yaw rate)` pair of an axle at true time `t`.
    pub fn true_pair(&self, t: Real, axle: Axle) -> (Real, Real) {
        let (left, right) = wheel_ground_speeds(
            &self.motion.linear_velocity_body(t),
            &self.motion.angular_velocity_body(t),
            self.wheels.wheelbase,
            self.wheels.half_track(axle),
            axle,
        );
        speed_yaw_pair(left, right, self.wheels.half_track(axle))
    }
}

fn stream_tag(stream: Stream) -> u64 {
    match stream {
        Stream::Pose => 0x0A11_CE00,
        Stream::Odometry => 0x0B0B_0000,
    }
}

/// Evenly spaced stamps `start, start + step, ..` (`count` of them).
pub fn uniform_stamps(start: Real, step: Real, count: usize) -> Vec<Real> {
    (0..count).map(|i| start + step * i as Real).collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::skew;

    #[test]
    fn angular_velocity_matches_attitude_derivative() {
        let motion = VehicleMotion::default();
        let t = 3.7;
        let h = 1e-6;
        let cdot = (motion.orientation(t + h) - motion.orientation(t - h)) / (2.0 * h);
        let omega_hat = motion.orientation(t).transpose() * cdot;
        let expected = skew(&motion.angular_velocity_body(t));
        assert!((omega_hat - expected).norm() < 1e-6);
    }

    #[test]
    fn position_derivative_is_heading_times_speed() {
        let motion = VehicleMotion::default();
        let t = 2.3;
        let h = 1e-3;
        let v = (motion.position(t + h) - motion.position(t - h)) / (2.0 * h);
        let expected = motion.orientation(t) * motion.linear_velocity_body(t);
        assert!((v - expected).norm() < 1e-5, "{v:?} vs {expected:?}");
    }

    #[test]
    fn noiseless_pose_stream_is_rigidly_attached() {
        let scenario = VehicleScenario {
            pose_sigma: 0.0,
            ..VehicleScenario::default()
        };
        let poses = scenario.pose_measurements(&[1.0]);
        let c_wi = rotvec_to_matrix(&poses[0].rotation);
        let p_o = poses[0].translation + c_wi * scenario.extrinsic.translation;
        assert!((p_o - scenario.motion.position(1.0)).norm() < 1e-12);
    }

    #[test]
    fn steering_readings_map_back_to_the_true_angle() {
        let scenario = VehicleScenario {
            steering_sigma: 0.0,
            ..VehicleScenario::default()
        };
        let stamps = uniform_stamps(0.5, 0.5, 10);
        let records = scenario.steered_wheel_measurements(&stamps, Axle::Front).unwrap();
        let mut largest: Real = 0.0;
        for m in &records {
            let reading = m.steering.unwrap();
            let angle = scenario.true_steering_angle(m.timestamp + scenario.odometry_delay);
            assert!((scenario.steering.angle(reading.value) - angle).abs() < 1e-12);
            largest = largest.max(angle.abs());
        }
        assert!(largest > 0.1, "the path must actually steer: {largest}");
    }
}
