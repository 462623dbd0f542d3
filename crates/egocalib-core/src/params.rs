//! Static calibration parameters and the vehicle kinematic model.
//!
//! Frames: the *reference* frame is the pose sensor, the *odometry* frame sits
//! at the middle of the rear axle with `x` forward, `y` left and `z` up.

use nalgebra::{DVector, RealField, Vector3};
use serde::{Deserialize, Serialize};

use crate::{lit, rotvec_to_matrix, Axle, CalibError, Mat2, Mat3, Real, Vec3};

/// Geometry and wheel radii of a four-wheeled vehicle.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct WheelOdometryParams {
    /// Distance between rear and front axle (m).
    pub wheelbase: Real,
    /// Half of the rear track width (m).
    pub rear_half_track: Real,
    /// Half of the front track width (m).
    pub front_half_track: Real,
    pub rear_left_radius: Real,
    pub rear_right_radius: Real,
    pub front_left_radius: Real,
    pub front_right_radius: Real,
}

impl WheelOdometryParams {
    pub const DIM: usize = 7;

    /// Element names in vector order.
    pub const NAMES: [&'static str; 7] = [
        "wheelbase",
        "rear_half_track",
        "front_half_track",
        "rear_left_radius",
        "rear_right_radius",
        "front_left_radius",
        "front_right_radius",
    ];

    pub const WHEELBASE: usize = 0;
    pub const REAR_HALF_TRACK: usize = 1;
    pub const FRONT_HALF_TRACK: usize = 2;
    pub const REAR_LEFT_RADIUS: usize = 3;
    pub const REAR_RIGHT_RADIUS: usize = 4;
    pub const FRONT_LEFT_RADIUS: usize = 5;
    pub const FRONT_RIGHT_RADIUS: usize = 6;

    pub fn to_dvec(&self) -> DVector<Real> {
        DVector::from_vec(vec![
            self.wheelbase,
            self.rear_half_track,
            self.front_half_track,
            self.rear_left_radius,
            self.rear_right_radius,
            self.front_left_radius,
            self.front_right_radius,
        ])
    }

    pub fn from_dvec(v: &DVector<Real>) -> Result<Self, CalibError> {
        if v.len() != Self::DIM {
            return Err(CalibError::invalid(format!(
                "wheel parameters expect {} values, got {}",
                Self::DIM,
                v.len()
            )));
        }
        Ok(Self {
            wheelbase: v[0],
            rear_half_track: v[1],
            front_half_track: v[2],
            rear_left_radius: v[3],
            rear_right_radius: v[4],
            front_left_radius: v[5],
            front_right_radius: v[6],
        })
    }

    pub fn half_track(&self, axle: Axle) -> Real {
        match axle {
            Axle::Rear => self.rear_half_track,
            Axle::Front => self.front_half_track,
        }
    }

    /// `(left, right)` radii of an axle.
    pub fn radii(&self, axle: Axle) -> (Real, Real) {
        match axle {
            Axle::Rear => (self.rear_left_radius, self.rear_right_radius),
            Axle::Front => (self.front_left_radius, self.front_right_radius),
        }
    }

    /// Covariance of the `(speed, yaw rate)` pair from per-wheel rate variances.
    pub fn pair_covariance(&self, axle: Axle, left_variance: Real, right_variance: Real) -> Mat2 {
        let (rl, rr) = self.radii(axle);
        let e = self.half_track(axle);
        let vl = rl * rl * left_variance;
        let vr = rr * rr * right_variance;
        Mat2::new(
            (vl + vr) / 4.0,
            (vr - vl) / (4.0 * e),
            (vr - vl) / (4.0 * e),
            (vl + vr) / (4.0 * e * e),
        )
    }

    pub fn validate(&self) -> Result<(), CalibError> {
        for (name, value) in Self::NAMES.iter().zip(self.to_dvec().iter()) {
            if !value.is_finite() || *value <= 0.0 {
                return Err(CalibError::invalid(format!(
                    "wheel parameter {name} must be positive, got {value}"
                )));
            }
        }
        Ok(())
    }
}

impl Default for WheelOdometryParams {
    fn default() -> Self {
        Self {
            wheelbase: 2.7,
            rear_half_track: 0.75,
            front_half_track: 0.75,
            rear_left_radius: 0.3,
            rear_right_radius: 0.3,
            front_left_radius: 0.3,
            front_right_radius: 0.3,
        }
    }
}

/// Map from the raw steering reading `s` to the steering angle of the front
/// axle's centre, `φ = a0 + a1·s + a2·s² + a3·s³` (rad).
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct SteeringParams {
    pub a0: Real,
    pub a1: Real,
    pub a2: Real,
    pub a3: Real,
}

impl SteeringParams {
    pub const DIM: usize = 4;

    pub const NAMES: [&'static str; 4] = ["a0", "a1", "a2", "a3"];

    pub fn to_dvec(&self) -> DVector<Real> {
        DVector::from_vec(vec![self.a0, self.a1, self.a2, self.a3])
    }

    pub fn from_dvec(v: &DVector<Real>) -> Result<Self, CalibError> {
        if v.len() != Self::DIM {
            return Err(CalibError::invalid(format!(
                "steering parameters expect {} values, got {}",
                Self::DIM,
                v.len()
            )));
        }
        Ok(Self {
            a0: v[0],
            a1: v[1],
            a2: v[2],
            a3: v[3],
        })
    }

    /// Steering angle for a raw reading.
    pub fn angle(&self, reading: Real) -> Real {
        steering_angle(&[self.a0, self.a1, self.a2, self.a3], reading)
    }

    /// Raw reading that maps to `angle`, by Newton iteration from the
    /// linear inverse.
    pub fn reading_for(&self, angle: Real) -> Result<Real, CalibError> {
        if self.a1 == 0.0 {
            return Err(CalibError::invalid("steering gain a1 is zero"));
        }
        let mut s = (angle - self.a0) / self.a1;
        for _ in 0..20 {
            let slope = self.a1 + 2.0 * self.a2 * s + 3.0 * self.a3 * s * s;
            if slope == 0.0 {
                break;
            }
            let step = (self.angle(s) - angle) / slope;
            s -= step;
            if step.abs() < 1e-15 {
                break;
            }
        }
        if (self.angle(s) - angle).abs() > 1e-9 {
            return Err(CalibError::invalid(format!(
                "steering map cannot reach angle {angle}"
            )));
        }
        Ok(s)
    }
}

impl Default for SteeringParams {
    /// The reading is the angle.
    fn default() -> Self {
        Self {
            a0: 0.0,
            a1: 1.0,
            a2: 0.0,
            a3: 0.0,
        }
    }
}

/// Rigid transform from the odometry frame to the reference frame.
///
/// `x_ref = C · x_odo + translation`, with `C = exp([rotation]x)`.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Extrinsic {
    /// Odometry origin expressed in the reference frame (m).
    pub translation: Vec3,
    /// Rotation vector of `C`.
    pub rotation: Vec3,
}

impl Extrinsic {
    pub fn new(translation: Vec3, rotation: Vec3) -> Self {
        Self {
            translation,
            rotation,
        }
    }

    pub fn identity() -> Self {
        Self::new(Vec3::zeros(), Vec3::zeros())
    }

    pub fn rotation_matrix(&self) -> Mat3 {
        rotvec_to_matrix(&self.rotation)
    }

    /// Odometry-frame velocities from reference-frame body velocities.
    pub fn odometry_velocities(&self, linear: &Vec3, angular: &Vec3) -> (Vec3, Vec3) {
        odometry_velocities(linear, angular, &self.translation, &self.rotation)
    }
}

impl Default for Extrinsic {
    fn default() -> Self {
        Self::identity()
    }
}

/// Maps reference-frame body velocities into the odometry frame.
///
/// `v_o = Cᵀ (v_i + ω_i × t)`, `ω_o = Cᵀ ω_i`.
pub fn odometry_velocities<T: RealField>(
    linear: &Vector3<T>,
    angular: &Vector3<T>,
    translation: &Vector3<T>,
    rotation: &Vector3<T>,
) -> (Vector3<T>, Vector3<T>) {
    let ct = rotvec_to_matrix(rotation).transpose();
    let v = &ct * (linear + angular.cross(translation));
    let w = ct * angular;
    (v, w)
}

/// Ground speeds `(left, right)` of an axle's wheels.
///
/// Contact points sit at `(0, ±e, 0)` for the rear axle and `(L, ±e, 0)` for
/// the front axle. Rear wheels roll along `x`; front wheels are steered, so
/// their speed is the signed norm of the planar contact velocity.
pub fn wheel_ground_speeds<T: RealField>(
    v_odo: &Vector3<T>,
    w_odo: &Vector3<T>,
    wheelbase: T,
    half_track: T,
    axle: Axle,
) -> (T, T) {
    let x = match axle {
        Axle::Rear => T::zero(),
        Axle::Front => wheelbase,
    };
    let left = v_odo + w_odo.cross(&Vector3::new(x.clone(), half_track.clone(), T::zero()));
    let right = v_odo + w_odo.cross(&Vector3::new(x, -half_track, T::zero()));
    match axle {
        Axle::Rear => (left.x.clone(), right.x.clone()),
        Axle::Front => (steered_speed(&left), steered_speed(&right)),
    }
}

fn steered_speed<T: RealField>(v: &Vector3<T>) -> T {
    let planar = (v.x.clone() * v.x.clone() + v.y.clone() * v.y.clone()).sqrt();
    if v.x >= T::zero() {
        planar
    } else {
        -planar
    }
}

/// `(speed, yaw rate)` pair from the two wheel speeds of an axle.
pub fn speed_yaw_pair<T: RealField>(left: T, right: T, half_track: T) -> (T, T) {
    let speed = (left.clone() + right.clone()) * lit::<T>(0.5);
    let yaw = (right - left) / (half_track * lit::<T>(2.0));
    (speed, yaw)
}

/// Horner evaluation of the steering polynomial `coeffs = [a0, a1, a2, a3]`.
pub fn steering_angle<T: RealField>(coeffs: &[T], reading: T) -> T {
    coeffs
        .iter()
        .rev()
        .fold(T::zero(), |acc, a| acc * reading.clone() + a.clone())
}

/// Centre steering angle that makes the front axle roll without lateral
/// slip: the heading of the velocity of the point `(L, 0, 0)`.
///
/// Reversing flips the heading so the angle stays in `(-π/2, π/2]`.
pub fn kinematic_steering_angle<T: RealField>(v_odo: &Vector3<T>, w_odo: &Vector3<T>, wheelbase: T) -> T {
    let lateral = v_odo.y.clone() + w_odo.z.clone() * wheelbase;
    let forward = v_odo.x.clone();
    if forward < T::zero() {
        (-lateral).atan2(-forward)
    } else {
        lateral.atan2(forward)
    }
}

/// Angles `(left, right)` of the front wheels for a centre angle `φ` under
/// Ackermann geometry, `tan φ_l,r = L tan φ / (L ∓ e tan φ)`.
pub fn ackermann_angles<T: RealField>(centre: T, wheelbase: T, half_track: T) -> (T, T) {
    let (sin, cos) = (centre.clone().sin(), centre.cos());
    let along = wheelbase.clone() * cos;
    let across = wheelbase * sin.clone();
    let offset = half_track * sin;
    let left = across.clone().atan2(along.clone() - offset.clone());
    let right = across.atan2(along + offset);
    (left, right)
}

/// Ground speeds `(left, right)` of the front wheels rolling along the
/// headings `angles`: the contact velocity projected on each wheel plane.
pub fn steered_ground_speeds<T: RealField>(
    v_odo: &Vector3<T>,
    w_odo: &Vector3<T>,
    wheelbase: T,
    half_track: T,
    angles: (T, T),
) -> (T, T) {
    let left = v_odo + w_odo.cross(&Vector3::new(wheelbase.clone(), half_track.clone(), T::zero()));
    let right = v_odo + w_odo.cross(&Vector3::new(wheelbase, -half_track, T::zero()));
    let roll = |v: &Vector3<T>, angle: T| v.x.clone() * angle.clone().cos() + v.y.clone() * angle.sin();
    (roll(&left, angles.0), roll(&right, angles.1))
}
