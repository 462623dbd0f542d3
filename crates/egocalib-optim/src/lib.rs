//! Delay-aware calibration problems and the solver they run on.
//!
//! Problems are described by a backend-agnostic IR: an arena of parameter
//! blocks addressed by [`ir::ParamId`] and residual blocks that reference them.
//! Error terms evaluate whitened residuals with Jacobians, the robust policy
//! re-weights them, and the Gauss-Newton backend returns the solved blocks
//! together with the triangular factor used by the diagnostics.

pub mod backend;
pub mod diagnostics;
pub mod factors;
pub mod ir;
pub mod problems;
pub mod robust;
pub mod trajectory;

pub use crate::backend::{
    BackendSolution, BackendSolveOptions, CancelToken, GaussNewtonBackend, OptimBackend,
    SolveStatus,
};
pub use crate::diagnostics::{ColumnInfo, SparseUpper, TriangularFactor};
pub use crate::problems::odometry::{
    build_odometry_ir, optimize_odometry, AssemblyReport, NonHolonomicNoise, OdometryCalibration,
    OdometryDataset, OdometryInit, OdometrySolveOptions, ParamPrior, WheelParamPriors,
};
pub use crate::robust::RobustLoss;
