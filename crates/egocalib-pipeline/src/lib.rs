//! Run-level plumbing for odometry calibration.
//!
//! A [`CalibratorOptions`] value is deserialized once from JSON and handed to a
//! [`WindowController`], which buffers the pose and odometry streams, solves a
//! window whenever the configured duration is covered, and carries the static
//! estimates forward. Each solved window can be persisted with
//! [`write_window_reports`].

pub mod config;
pub mod report;
pub mod window;

pub use crate::config::{CalibratorOptions, WindowConfig, WindowMode};
pub use crate::report::{write_window_reports, CovarianceReport, ParameterReport};
pub use crate::window::{CalibrationEstimate, WindowController, WindowOutcome};
