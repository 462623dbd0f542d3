//! Error terms.
//!
//! Each measurement type has one error term that evaluates a whitened
//! residual and its Jacobian blocks (one per parameter block, in the order of
//! the residual block's parameter list). [`FactorKind`] closes the set so the
//! backend dispatches statically.

mod pose;
mod prior;
mod wheel;

use egocalib_core::CalibError;
use nalgebra::{DMatrix, DVector, SMatrix};

pub use pose::PoseErrorTerm;
pub use prior::PriorErrorTerm;
pub use wheel::{NonHolonomicErrorTerm, SteeringErrorTerm, WheelErrorTerm};

/// Whitened residual with its Jacobian blocks.
#[derive(Debug, Clone)]
pub struct FactorEval {
    pub residual: DVector<f64>,
    /// `residual_dim × block_dim` matrix per parameter block.
    pub jacobians: Vec<DMatrix<f64>>,
}

/// Common capability of every error term.
pub trait ErrorTerm {
    /// Short name used in diagnostics.
    fn label(&self) -> &'static str;

    fn residual_dim(&self) -> usize;

    /// Expected dimension of each parameter block, in order.
    fn param_dims(&self) -> Vec<usize>;

    /// Whitened residual.
    fn evaluate_residual(&self, params: &[&DVector<f64>]) -> Result<DVector<f64>, CalibError>;

    /// Whitened residual and Jacobian blocks.
    fn evaluate_jacobians(&self, params: &[&DVector<f64>]) -> Result<FactorEval, CalibError>;
}

/// Closed set of error terms understood by the backends.
#[derive(Debug, Clone, PartialEq)]
pub enum FactorKind {
    /// Parameters: `[traj/i.., delay]`.
    Pose(PoseErrorTerm),
    /// Parameters: `[traj/i.., delay, extrinsic translation, extrinsic rotation, wheels]`,
    /// plus `steering` for a steered front-axle record.
    Wheel(WheelErrorTerm),
    /// Parameters: `[traj/i.., delay, extrinsic translation, extrinsic rotation, wheels, steering]`.
    Steering(SteeringErrorTerm),
    /// Parameters: `[traj/i.., delay, extrinsic translation, extrinsic rotation]`.
    NonHolonomic(NonHolonomicErrorTerm),
    /// Parameters: `[block]`.
    Prior(PriorErrorTerm),
}

macro_rules! dispatch {
    ($self:ident, $term:ident => $body:expr) => {
        match $self {
            FactorKind::Pose($term) => $body,
            FactorKind::Wheel($term) => $body,
            FactorKind::Steering($term) => $body,
            FactorKind::NonHolonomic($term) => $body,
            FactorKind::Prior($term) => $body,
        }
    };
}

impl ErrorTerm for FactorKind {
    fn label(&self) -> &'static str {
        dispatch!(self, t => t.label())
    }

    fn residual_dim(&self) -> usize {
        dispatch!(self, t => t.residual_dim())
    }

    fn param_dims(&self) -> Vec<usize> {
        dispatch!(self, t => t.param_dims())
    }

    fn evaluate_residual(&self, params: &[&DVector<f64>]) -> Result<DVector<f64>, CalibError> {
        dispatch!(self, t => t.evaluate_residual(params))
    }

    fn evaluate_jacobians(&self, params: &[&DVector<f64>]) -> Result<FactorEval, CalibError> {
        dispatch!(self, t => t.evaluate_jacobians(params))
    }
}

/// Square-root information `W` with `WᵀW = Σ⁻¹`.
///
/// Uses `W = L⁻¹` for the Cholesky factor `Σ = L Lᵀ`.
pub fn sqrt_information<const N: usize>(
    covariance: &SMatrix<f64, N, N>,
) -> Result<SMatrix<f64, N, N>, CalibError> {
    let chol = covariance
        .clone_owned()
        .cholesky()
        .ok_or_else(|| CalibError::invalid("measurement covariance is not positive definite"))?;
    chol.l()
        .solve_lower_triangular(&SMatrix::<f64, N, N>::identity())
        .ok_or_else(|| CalibError::invalid("measurement covariance is singular"))
}

/// Checks the number of parameter blocks handed to an error term.
fn expect_params(label: &str, params: &[&DVector<f64>], dims: &[usize]) -> Result<(), CalibError> {
    if params.len() != dims.len() {
        return Err(CalibError::invalid(format!(
            "{label} expects {} parameter blocks, got {}",
            dims.len(),
            params.len()
        )));
    }
    for (slot, (p, d)) in params.iter().zip(dims).enumerate() {
        if p.len() != *d {
            return Err(CalibError::invalid(format!(
                "{label} parameter {slot} has dim {}, expected {d}",
                p.len()
            )));
        }
    }
    Ok(())
}
