//! Timestamped measurement records.
//!
//! Records are immutable once ingested. Timestamps are in seconds on the clock
//! of the producing stream; angles are in radians.

use serde::{Deserialize, Serialize};

use crate::{join6, CalibError, Mat2, Mat6, Real, Vec3, Vec6};

/// Asynchronous sensor stream; each stream carries its own delay estimate.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Stream {
    Pose,
    Odometry,
}

impl Stream {
    pub const ALL: [Stream; 2] = [Stream::Pose, Stream::Odometry];

    pub fn name(self) -> &'static str {
        match self {
            Stream::Pose => "pose",
            Stream::Odometry => "odometry",
        }
    }
}

/// Wheel axle an encoder pair belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Axle {
    Rear,
    Front,
}

/// Anything that carries a stream timestamp.
pub trait Timestamped {
    fn timestamp(&self) -> Real;
}

/// Pose of the reference sensor in the world frame.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct PoseMeasurement {
    pub timestamp: Real,
    pub translation: Vec3,
    /// Rotation vector of the sensor-to-world rotation.
    pub rotation: Vec3,
    /// Covariance of `[translation; rotation]`.
    pub covariance: Mat6,
}

impl PoseMeasurement {
    pub fn new(timestamp: Real, translation: Vec3, rotation: Vec3, covariance: Mat6) -> Self {
        Self {
            timestamp,
            translation,
            rotation,
            covariance,
        }
    }

    /// Measurement with independent translation and rotation variances.
    pub fn with_variances(
        timestamp: Real,
        translation: Vec3,
        rotation: Vec3,
        translation_variance: Real,
        rotation_variance: Real,
    ) -> Self {
        let mut covariance = Mat6::zeros();
        for i in 0..3 {
            covariance[(i, i)] = translation_variance;
            covariance[(i + 3, i + 3)] = rotation_variance;
        }
        Self::new(timestamp, translation, rotation, covariance)
    }

    /// Stacked `[translation; rotation]`.
    pub fn pose(&self) -> Vec6 {
        join6(&self.translation, &self.rotation)
    }

    pub fn validate(&self) -> Result<(), CalibError> {
        if !self.timestamp.is_finite() {
            return Err(CalibError::invalid("pose timestamp is not finite"));
        }
        if !(self.translation.iter().all(|v| v.is_finite()) && self.rotation.iter().all(|v| v.is_finite())) {
            return Err(CalibError::invalid(format!(
                "pose at t={} has non-finite values",
                self.timestamp
            )));
        }
        if self.covariance.cholesky().is_none() {
            return Err(CalibError::invalid(format!(
                "pose covariance at t={} is not positive definite",
                self.timestamp
            )));
        }
        Ok(())
    }
}

impl Timestamped for PoseMeasurement {
    fn timestamp(&self) -> Real {
        self.timestamp
    }
}

/// Raw steering sensor reading taken with an encoder record.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct SteeringReading {
    /// Uncalibrated reading; mapped to an angle by the steering polynomial.
    pub value: Real,
    /// Variance of the derived steering angle (rad²).
    pub variance: Real,
}

/// Encoder rates of one axle.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct WheelMeasurement {
    pub timestamp: Real,
    pub axle: Axle,
    /// Left wheel angular rate (rad/s).
    pub left_rate: Real,
    /// Right wheel angular rate (rad/s).
    pub right_rate: Real,
    /// Covariance of the derived `(speed, yaw rate)` pair.
    pub covariance: Mat2,
    #[serde(default)]
    pub steering: Option<SteeringReading>,
}

impl WheelMeasurement {
    pub fn new(timestamp: Real, axle: Axle, left_rate: Real, right_rate: Real, covariance: Mat2) -> Self {
        Self {
            timestamp,
            axle,
            left_rate,
            right_rate,
            covariance,
            steering: None,
        }
    }

    /// Attaches the steering reading sampled at the same instant.
    pub fn with_steering(mut self, value: Real, variance: Real) -> Self {
        self.steering = Some(SteeringReading { value, variance });
        self
    }

    pub fn validate(&self) -> Result<(), CalibError> {
        if !(self.timestamp.is_finite() && self.left_rate.is_finite() && self.right_rate.is_finite()) {
            return Err(CalibError::invalid(format!(
                "wheel measurement at t={} has non-finite values",
                self.timestamp
            )));
        }
        if self.covariance.cholesky().is_none() {
            return Err(CalibError::invalid(format!(
                "wheel covariance at t={} is not positive definite",
                self.timestamp
            )));
        }
        if let Some(steering) = self.steering {
            if !(steering.value.is_finite() && steering.variance.is_finite() && steering.variance > 0.0) {
                return Err(CalibError::invalid(format!(
                    "steering reading at t={} needs a finite value and a positive variance",
                    self.timestamp
                )));
            }
        }
        Ok(())
    }
}

impl Timestamped for WheelMeasurement {
    fn timestamp(&self) -> Real {
        self.timestamp
    }
}

/// Checks that a stream is non-decreasing in time.
pub fn check_monotonic<M: Timestamped>(stream: &[M], name: &str) -> Result<(), CalibError> {
    for (i, w) in stream.windows(2).enumerate() {
        if w[1].timestamp() < w[0].timestamp() {
            return Err(CalibError::invalid(format!(
                "{name} timestamps decrease at index {}: {} < {}",
                i + 1,
                w[1].timestamp(),
                w[0].timestamp()
            )));
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rejects_indefinite_covariance() {
        let mut m = PoseMeasurement::with_variances(0.0, Vec3::zeros(), Vec3::zeros(), 1e-4, 1e-4);
        assert!(m.validate().is_ok());
        m.covariance[(4, 4)] = 0.0;
        assert!(matches!(m.validate(), Err(CalibError::InvalidInput(_))));
    }

    #[test]
    fn detects_decreasing_stream() {
        let cov = Mat2::identity();
        let stream = [
            WheelMeasurement::new(0.0, Axle::Rear, 1.0, 1.0, cov),
            WheelMeasurement::new(0.2, Axle::Rear, 1.0, 1.0, cov),
            WheelMeasurement::new(0.1, Axle::Rear, 1.0, 1.0, cov),
        ];
        assert!(check_monotonic(&stream[..2], "wheels").is_ok());
        assert!(check_monotonic(&stream, "wheels").is_err());
    }

    #[test]
    fn steering_reading_needs_positive_variance() {
        let cov = Mat2::identity();
        let m = WheelMeasurement::new(0.0, Axle::Front, 1.0, 1.0, cov);
        assert!(m.with_steering(0.1, 1e-4).validate().is_ok());
        assert!(m.with_steering(0.1, 0.0).validate().is_err());
        assert!(m.with_steering(Real::NAN, 1e-4).validate().is_err());
    }
}
