use egocalib_core::CalibError;
use nalgebra::{DMatrix, DVector};

use super::{expect_params, ErrorTerm, FactorEval};

/// Diagonal Gaussian prior `diag(s) · (x - mean)` on one parameter block.
///
/// Components with `s = 0` carry no prior.
#[derive(Debug, Clone, PartialEq)]
pub struct PriorErrorTerm {
    mean: DVector<f64>,
    sqrt_info: DVector<f64>,
}

impl PriorErrorTerm {
    pub fn new(mean: DVector<f64>, sqrt_info: DVector<f64>) -> Self {
        Self { mean, sqrt_info }
    }

    /// Prior from per-component variances; `None` leaves a component free.
    pub fn from_variances(mean: DVector<f64>, variances: &[Option<f64>]) -> Result<Self, CalibError> {
        if variances.len() != mean.len() {
            return Err(CalibError::invalid(format!(
                "prior expects {} variances, got {}",
                mean.len(),
                variances.len()
            )));
        }
        let mut sqrt_info = DVector::zeros(mean.len());
        for (i, v) in variances.iter().enumerate() {
            if let Some(v) = v {
                if !(v.is_finite() && *v > 0.0) {
                    return Err(CalibError::invalid(format!(
                        "prior variance must be positive, got {v}"
                    )));
                }
                sqrt_info[i] = 1.0 / v.sqrt();
            }
        }
        Ok(Self::new(mean, sqrt_info))
    }
}

impl ErrorTerm for PriorErrorTerm {
    fn label(&self) -> &'static str {
        "prior"
    }

    fn residual_dim(&self) -> usize {
        self.mean.len()
    }

    fn param_dims(&self) -> Vec<usize> {
        vec![self.mean.len()]
    }

    fn evaluate_residual(&self, params: &[&DVector<f64>]) -> Result<DVector<f64>, CalibError> {
        expect_params(self.label(), params, &self.param_dims())?;
        Ok((params[0] - &self.mean).component_mul(&self.sqrt_info))
    }

    fn evaluate_jacobians(&self, params: &[&DVector<f64>]) -> Result<FactorEval, CalibError> {
        let residual = self.evaluate_residual(params)?;
        Ok(FactorEval {
            residual,
            jacobians: vec![DMatrix::from_diagonal(&self.sqrt_info)],
        })
    }
}
