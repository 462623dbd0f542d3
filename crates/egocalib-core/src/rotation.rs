//! Rotation-vector (axis-angle) parameterization.
//!
//! The rotation half of every trajectory control point and of the extrinsic
//! rotation is stored as a rotation vector `r = θ·a`. The functions here are
//! generic over [`RealField`] so the same code evaluates on `f64` and on dual
//! numbers; small-angle branches use Taylor expansions to keep derivatives
//! finite at the identity.

use nalgebra::{Matrix3, RealField, Rotation3, Vector3};
use std::f64::consts::TAU;

use crate::{lit, Mat3, Real, Vec3};

const SMALL_ANGLE_SQ: f64 = 1e-10;

/// Cross-product matrix `[v]x`.
pub fn skew<T: RealField>(v: &Vector3<T>) -> Matrix3<T> {
    Matrix3::new(
        T::zero(),
        -v.z.clone(),
        v.y.clone(),
        v.z.clone(),
        T::zero(),
        -v.x.clone(),
        -v.y.clone(),
        v.x.clone(),
        T::zero(),
    )
}

/// Rotation matrix `exp([r]x)` (Rodrigues).
pub fn rotvec_to_matrix<T: RealField>(r: &Vector3<T>) -> Matrix3<T> {
    let theta2 = r.norm_squared();
    let k = skew(r);
    let (a, b) = if theta2 > lit(SMALL_ANGLE_SQ) {
        let theta = theta2.clone().sqrt();
        (
            theta.clone().sin() / theta.clone(),
            (T::one() - theta.cos()) / theta2,
        )
    } else {
        (
            T::one() - theta2.clone() / lit(6.0),
            lit::<T>(0.5) - theta2 / lit(24.0),
        )
    };
    let k2 = &k * &k;
    Matrix3::identity() + k * a + k2 * b
}

/// Right Jacobian of the exponential map.
///
/// For `C(t) = exp([r(t)]x)` the body angular velocity is `J_r(r) · ṙ`.
pub fn right_jacobian<T: RealField>(r: &Vector3<T>) -> Matrix3<T> {
    let theta2 = r.norm_squared();
    let k = skew(r);
    let (b, c) = if theta2 > lit(SMALL_ANGLE_SQ) {
        let theta = theta2.clone().sqrt();
        let theta3 = theta2.clone() * theta.clone();
        (
            (T::one() - theta.clone().cos()) / theta2,
            (theta.clone() - theta.sin()) / theta3,
        )
    } else {
        (
            lit::<T>(0.5) - theta2.clone() / lit(24.0),
            lit::<T>(1.0 / 6.0) - theta2 / lit(120.0),
        )
    };
    let k2 = &k * &k;
    Matrix3::identity() - k * b + k2 * c
}

/// Left Jacobian of the exponential map, `J_l(r) = J_r(-r)`.
///
/// For `C(t) = exp([r(t)]x)` the world angular velocity is `J_l(r) · ṙ`.
pub fn left_jacobian<T: RealField>(r: &Vector3<T>) -> Matrix3<T> {
    right_jacobian(&(-r.clone()))
}

/// Rotation vector of a rotation matrix, with angle in `[0, π]`.
pub fn matrix_to_rotvec(m: &Mat3) -> Vec3 {
    Rotation3::from_matrix_unchecked(*m).scaled_axis()
}

/// Picks the representation of `current` closest to `previous`.
///
/// All rotation vectors `current + 2πs·a` (integer `s`, `a` the rotation axis)
/// describe the same rotation. The returned one minimizes the Euclidean
/// distance to `previous`, which removes the ±2π jumps a plain logarithm
/// produces when a sequence crosses the half-turn boundary.
pub fn disambiguate_rotvec(previous: &Vec3, current: &Vec3) -> Vec3 {
    let angle = current.norm();
    let axis = if angle > 1e-12 {
        current / angle
    } else {
        let prev_angle = previous.norm();
        if prev_angle <= 1e-12 {
            return *current;
        }
        previous / prev_angle
    };
    let s = (axis.dot(&(previous - current)) / TAU).round();
    current + axis * (s * TAU)
}

/// Disambiguates a sequence of rotation vectors in place, sample by sample.
pub fn unwrap_rotvecs(seq: &mut [Vec3]) {
    for i in 1..seq.len() {
        seq[i] = disambiguate_rotvec(&seq[i - 1], &seq[i]);
    }
}

/// Angle of the relative rotation between two rotation vectors.
pub fn rotvec_angle_between(a: &Vec3, b: &Vec3) -> Real {
    let rel = rotvec_to_matrix(a).transpose() * rotvec_to_matrix(b);
    matrix_to_rotvec(&rel).norm()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::f64::consts::PI;

    #[test]
    fn exp_log_round_trip() {
        for r in [
            Vec3::new(0.1, -0.2, 0.3),
            Vec3::new(1e-7, 0.0, -2e-7),
            Vec3::new(0.0, 2.5, 0.4),
        ] {
            let m = rotvec_to_matrix(&r);
            let back = matrix_to_rotvec(&m);
            assert!((back - r).norm() < 1e-9, "{r:?} -> {back:?}");
            assert!((m.transpose() * m - Mat3::identity()).norm() < 1e-12);
        }
    }

    #[test]
    fn right_jacobian_matches_finite_difference() {
        let r = Vec3::new(0.4, -0.3, 0.8);
        let rdot = Vec3::new(0.2, 0.5, -0.1);
        let h = 1e-6;
        let c0 = rotvec_to_matrix(&(r - rdot * h));
        let c1 = rotvec_to_matrix(&(r + rdot * h));
        let cdot = (c1 - c0) / (2.0 * h);
        let omega_hat = rotvec_to_matrix(&r).transpose() * cdot;
        let omega = Vec3::new(omega_hat[(2, 1)], omega_hat[(0, 2)], omega_hat[(1, 0)]);
        let expected = right_jacobian(&r) * rdot;
        assert!((omega - expected).norm() < 1e-7, "{omega:?} vs {expected:?}");
    }

    #[test]
    fn small_angle_branch_is_continuous() {
        let tiny = Vec3::new(3e-6, -2e-6, 1e-6);
        let just_above = tiny * 10.0;
        let m_small = rotvec_to_matrix(&tiny);
        let m_exact = Rotation3::from_scaled_axis(tiny).into_inner();
        assert!((m_small - m_exact).norm() < 1e-14);
        let j = right_jacobian(&just_above);
        assert!((j - Mat3::identity()).norm() < 1e-4);
    }

    #[test]
    fn disambiguation_across_half_turn() {
        let axis = Vec3::z();
        let deg = PI / 180.0;
        let prev = axis * (179.0 * deg);
        // 181° about +z canonicalises to 179° about -z.
        let raw = matrix_to_rotvec(&rotvec_to_matrix(&(axis * (181.0 * deg))));
        assert!((raw - prev).norm() > PI, "log should jump: {raw:?}");
        let fixed = disambiguate_rotvec(&prev, &raw);
        assert!((fixed - prev).norm() < PI, "jump not removed: {fixed:?}");
        assert!((fixed - axis * (181.0 * deg)).norm() < 1e-9);
        assert!(rotvec_angle_between(&fixed, &raw) < 1e-9);
    }

    #[test]
    fn unwrap_keeps_full_spin_continuous() {
        let mut seq: Vec<Vec3> = (0..40)
            .map(|i| {
                let angle = i as f64 * 0.3;
                matrix_to_rotvec(&rotvec_to_matrix(&(Vec3::new(0.0, 0.0, 1.0) * angle)))
            })
            .collect();
        unwrap_rotvecs(&mut seq);
        for w in seq.windows(2) {
            assert!((w[1] - w[0]).norm() < 0.31);
        }
        assert!((seq[39].z - 39.0 * 0.3).abs() < 1e-9);
    }

    #[test]
    fn identity_sample_follows_previous_axis() {
        let prev = Vec3::new(0.0, TAU - 0.05, 0.0);
        let fixed = disambiguate_rotvec(&prev, &Vec3::zeros());
        assert!((fixed - Vec3::new(0.0, TAU, 0.0)).norm() < 1e-12);
    }
}
