//! Calibration problems assembled on top of the IR.

pub mod odometry;
