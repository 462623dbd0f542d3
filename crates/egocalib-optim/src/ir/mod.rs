//! Backend-agnostic intermediate representation of a calibration problem.
//!
//! The IR is an arena of parameter blocks addressed by stable [`ParamId`]
//! handles plus a list of residual blocks that reference those handles.
//! Problem builders emit IR; backends compile and solve it.

mod types;

pub use types::*;
