use anyhow::{ensure, Result};
use std::collections::HashSet;

use crate::factors::{ErrorTerm, FactorKind};
use crate::robust::RobustLoss;

/// Identifier for a parameter block in the IR.
///
/// This is stable within a `ProblemIR` instance and is used by residual blocks
/// to reference their parameter dependencies.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ParamId(pub usize);

/// Bounds for a single parameter index.
///
/// Bounds are applied after each update.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Bound {
    pub idx: usize,
    pub lower: f64,
    pub upper: f64,
}

impl Bound {
    pub fn symmetric(idx: usize, magnitude: f64) -> Self {
        Self {
            idx,
            lower: -magnitude,
            upper: magnitude,
        }
    }
}

/// Fixed parameter mask for a block.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct FixedMask {
    fixed_indices: HashSet<usize>,
}

impl FixedMask {
    /// Creates a mask with no fixed indices.
    pub fn all_free() -> Self {
        Self {
            fixed_indices: HashSet::new(),
        }
    }

    /// Creates a mask with all indices fixed.
    pub fn all_fixed(dim: usize) -> Self {
        Self {
            fixed_indices: (0..dim).collect(),
        }
    }

    /// Creates a mask from an explicit list of indices.
    pub fn fix_indices(indices: &[usize]) -> Self {
        Self {
            fixed_indices: indices.iter().copied().collect(),
        }
    }

    /// Returns `true` if the index is fixed.
    pub fn is_fixed(&self, idx: usize) -> bool {
        self.fixed_indices.contains(&idx)
    }

    /// Returns `true` if all indices `[0, dim)` are fixed.
    pub fn is_all_fixed(&self, dim: usize) -> bool {
        (0..dim).all(|i| self.is_fixed(i))
    }

    /// Iterates over fixed indices.
    pub fn iter(&self) -> impl Iterator<Item = usize> + '_ {
        self.fixed_indices.iter().copied()
    }

    /// Returns `true` if no indices are fixed.
    pub fn is_empty(&self) -> bool {
        self.fixed_indices.is_empty()
    }
}

/// Parameter block definition in the IR.
#[derive(Debug, Clone)]
pub struct ParamBlock {
    pub id: ParamId,
    pub name: String,
    pub dim: usize,
    pub fixed: FixedMask,
    pub bounds: Option<Vec<Bound>>,
}

/// Residual block definition in the IR.
///
/// The order of `params` must match the factor's expected parameter order.
#[derive(Debug, Clone)]
pub struct ResidualBlock {
    pub params: Vec<ParamId>,
    pub loss: RobustLoss,
    pub factor: FactorKind,
    pub residual_dim: usize,
}

impl ResidualBlock {
    /// Builds a block whose residual dimension is taken from the factor.
    pub fn new(params: Vec<ParamId>, loss: RobustLoss, factor: FactorKind) -> Self {
        let residual_dim = factor.residual_dim();
        Self {
            params,
            loss,
            factor,
            residual_dim,
        }
    }
}

/// Backend-agnostic optimization problem representation.
#[derive(Debug, Default, Clone)]
pub struct ProblemIR {
    pub params: Vec<ParamBlock>,
    pub residuals: Vec<ResidualBlock>,
}

impl ProblemIR {
    /// Creates an empty IR.
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds a parameter block and returns its `ParamId`.
    pub fn add_param_block(
        &mut self,
        name: impl Into<String>,
        dim: usize,
        fixed: FixedMask,
        bounds: Option<Vec<Bound>>,
    ) -> ParamId {
        let id = ParamId(self.params.len());
        self.params.push(ParamBlock {
            id,
            name: name.into(),
            dim,
            fixed,
            bounds,
        });
        id
    }

    /// Adds a residual block to the IR.
    pub fn add_residual_block(&mut self, residual: ResidualBlock) {
        self.residuals.push(residual);
    }

    /// Finds a parameter by name.
    pub fn param_by_name(&self, name: &str) -> Option<ParamId> {
        self.params.iter().find(|p| p.name == name).map(|p| p.id)
    }

    /// Total number of rows of the stacked residual vector.
    pub fn residual_rows(&self) -> usize {
        self.residuals.iter().map(|r| r.residual_dim).sum()
    }

    /// Validates internal consistency and factor expectations.
    pub fn validate(&self) -> Result<()> {
        let mut names = HashSet::new();
        for (idx, param) in self.params.iter().enumerate() {
            ensure!(
                param.id.0 == idx,
                "param id mismatch: expected {}, got {:?}",
                idx,
                param.id
            );
            ensure!(param.dim > 0, "param {} has zero dimension", param.name);
            ensure!(
                names.insert(param.name.as_str()),
                "duplicate param name {}",
                param.name
            );
            for fixed_idx in param.fixed.iter() {
                ensure!(
                    fixed_idx < param.dim,
                    "param {} fixed index {} out of range",
                    param.name,
                    fixed_idx
                );
            }
            if let Some(bounds) = &param.bounds {
                for bound in bounds {
                    ensure!(
                        bound.idx < param.dim,
                        "param {} bound index {} out of range",
                        param.name,
                        bound.idx
                    );
                    ensure!(
                        bound.lower <= bound.upper,
                        "param {} bound lower {} > upper {}",
                        param.name,
                        bound.lower,
                        bound.upper
                    );
                }
            }
        }

        for (r_idx, residual) in self.residuals.iter().enumerate() {
            ensure!(
                residual.residual_dim == residual.factor.residual_dim(),
                "residual {} dim {} does not match factor expectation {}",
                r_idx,
                residual.residual_dim,
                residual.factor.residual_dim()
            );
            for param in &residual.params {
                ensure!(
                    param.0 < self.params.len(),
                    "residual {} references missing param {:?}",
                    r_idx,
                    param
                );
            }
            let expected = residual.factor.param_dims();
            ensure!(
                residual.params.len() == expected.len(),
                "residual {} ({}) requires {} params, got {}",
                r_idx,
                residual.factor.label(),
                expected.len(),
                residual.params.len()
            );
            for (slot, (param, dim)) in residual.params.iter().zip(&expected).enumerate() {
                let block = &self.params[param.0];
                ensure!(
                    block.dim == *dim,
                    "residual {} ({}) expects a {}D block in slot {}, got {} with dim {}",
                    r_idx,
                    residual.factor.label(),
                    dim,
                    slot,
                    block.name,
                    block.dim
                );
            }
        }

        Ok(())
    }
}
