use nalgebra::{Matrix2, Matrix3, Matrix6, RealField, SVector, Vector2, Vector3};

pub type Real = f64;

pub type Vec2 = Vector2<Real>;
pub type Vec3 = Vector3<Real>;
pub type Vec6 = SVector<Real, 6>;
pub type Mat2 = Matrix2<Real>;
pub type Mat3 = Matrix3<Real>;
pub type Mat6 = Matrix6<Real>;

/// Converts an `f64` literal into any real field (plain floats or dual numbers).
#[inline]
pub fn lit<T: RealField>(x: f64) -> T {
    nalgebra::convert(x)
}

/// Splits a 6-vector `[p; r]` into its translation and rotation halves.
#[inline]
pub fn split6(v: &Vec6) -> (Vec3, Vec3) {
    (
        Vec3::new(v[0], v[1], v[2]),
        Vec3::new(v[3], v[4], v[5]),
    )
}

/// Stacks translation and rotation halves into a 6-vector `[p; r]`.
#[inline]
pub fn join6(p: &Vec3, r: &Vec3) -> Vec6 {
    Vec6::from_column_slice(&[p.x, p.y, p.z, r.x, r.y, r.z])
}
