//! Backends that solve the IR.
//!
//! A backend validates the IR, minimizes the robustified cost over the free
//! parameter columns, and returns the solved parameter map together with the
//! upper-triangular factor of the final linearization, which the diagnostics
//! use for covariance and observability queries.

mod gauss_newton;
mod sparse_qr;

use egocalib_core::CalibError;
use nalgebra::DVector;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use crate::diagnostics::TriangularFactor;
use crate::ir::ProblemIR;

pub use gauss_newton::GaussNewtonBackend;

/// Backend-agnostic solver options.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BackendSolveOptions {
    /// Maximum number of Gauss-Newton iterations.
    pub max_iters: usize,
    /// Logs one line per iteration at `info` when non-zero (`debug` otherwise).
    pub verbosity: usize,
    /// Relative step size below which the solver stops.
    pub step_tolerance: f64,
    /// Relative cost decrease below which the solver stops.
    pub cost_tolerance: f64,
    /// Relative size of a diagonal entry of the column-normalized `R` below
    /// which its column counts as unobservable.
    pub rank_tolerance: f64,
    /// Scale Jacobian columns to unit norm before the factorization.
    pub column_normalization: bool,
    /// Worker threads for residual and Jacobian evaluation.
    pub threads: usize,
    /// Maximum number of step halvings when a full step increases the cost.
    pub max_step_halvings: usize,
}

impl Default for BackendSolveOptions {
    fn default() -> Self {
        Self {
            max_iters: 30,
            verbosity: 0,
            step_tolerance: 1e-9,
            cost_tolerance: 1e-10,
            rank_tolerance: 1e-10,
            column_normalization: true,
            threads: 1,
            max_step_halvings: 8,
        }
    }
}

impl BackendSolveOptions {
    pub fn validate(&self) -> Result<(), CalibError> {
        if self.max_iters == 0 {
            return Err(CalibError::invalid("max_iters must be at least 1"));
        }
        for (name, value) in [
            ("step_tolerance", self.step_tolerance),
            ("cost_tolerance", self.cost_tolerance),
            ("rank_tolerance", self.rank_tolerance),
        ] {
            if !value.is_finite() || value < 0.0 {
                return Err(CalibError::invalid(format!(
                    "{name} must be non-negative, got {value}"
                )));
            }
        }
        Ok(())
    }
}

/// How a solve ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SolveStatus {
    /// A convergence test was met.
    Converged,
    /// The iteration budget ran out first.
    IterationLimit,
    /// The cancel token was raised between iterations.
    Cancelled,
}

/// Cooperative cancellation flag shared with the caller.
///
/// The backend checks it at iteration boundaries and returns the estimate it
/// has so far with [`SolveStatus::Cancelled`].
#[derive(Debug, Clone, Default)]
pub struct CancelToken(Arc<AtomicBool>);

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

/// Solver output from a backend.
///
/// The `params` map uses the IR parameter block names.
#[derive(Debug, Clone)]
pub struct BackendSolution {
    /// Optimized parameter vectors keyed by block name.
    pub params: HashMap<String, DVector<f64>>,
    /// Robustified cost `½ Σ ρ(|r|²)` at the initial values.
    pub initial_cost: f64,
    /// Robustified cost at the returned values.
    pub final_cost: f64,
    pub iterations: usize,
    pub status: SolveStatus,
    /// Factor of the whitened, re-weighted Jacobian at the returned values.
    ///
    /// `None` when a cancelled or iteration-limited solve stopped at a point
    /// whose Jacobian is rank deficient; a converged solve always has one.
    pub factor: Option<TriangularFactor>,
}

impl BackendSolution {
    /// Treats an exhausted iteration budget as an error.
    pub fn into_converged(self) -> Result<Self, CalibError> {
        match self.status {
            SolveStatus::IterationLimit => Err(CalibError::ConvergenceFailure {
                iterations: self.iterations,
                cost: self.final_cost,
            }),
            _ => Ok(self),
        }
    }
}

/// Backend interface implemented by solvers.
pub trait OptimBackend {
    /// Solve a compiled IR with the provided initial parameters.
    fn solve(
        &self,
        ir: &ProblemIR,
        initial: &HashMap<String, DVector<f64>>,
        opts: &BackendSolveOptions,
        cancel: Option<&CancelToken>,
    ) -> Result<BackendSolution, CalibError>;
}
