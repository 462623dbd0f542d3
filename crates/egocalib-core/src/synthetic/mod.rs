//! Deterministic synthetic datasets for tests and demos.

pub mod noise;
pub mod vehicle;

pub use noise::GaussianNoise;
pub use vehicle::{VehicleMotion, VehicleScenario};
