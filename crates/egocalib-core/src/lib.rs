//! Core math and data primitives for `egocalib`.
//!
//! This crate contains:
//! - linear algebra type aliases (`Real`, `Vec3`, `Vec6`, ...),
//! - rotation-vector algebra generic over `nalgebra::RealField` so it can be
//!   differentiated with dual numbers,
//! - a uniform B-spline pose curve that is fitted once from pose samples and
//!   then exposes its control points as estimation state,
//! - measurement records and calibration parameter types,
//! - the error taxonomy shared by every crate in the workspace,
//! - a deterministic synthetic vehicle for tests and demos.

/// Error taxonomy.
pub mod error;
/// Linear algebra type aliases and helpers.
pub mod math;
/// Timestamped measurement records.
pub mod measurement;
/// Static calibration parameters and extrinsics.
pub mod params;
/// Rotation-vector parameterization.
pub mod rotation;
/// Uniform B-spline pose curve.
pub mod spline;
/// Synthetic datasets.
pub mod synthetic;

pub use error::*;
pub use math::*;
pub use measurement::*;
pub use params::*;
pub use rotation::*;
pub use spline::*;
