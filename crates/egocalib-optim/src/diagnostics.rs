//! Covariance and observability queries on the solver's triangular factor.
//!
//! With `J = Q R` for the whitened Jacobian at the solution, the information
//! matrix is `RᵀR`. For a trailing column range `[a, n)` the Schur complement
//! of the leading columns is `R_tᵀR_t` with `R_t = R[a..n, a..n]`, so marginals
//! never need the full inverse.

use egocalib_core::CalibError;
use nalgebra::{DMatrix, DVector};
use std::ops::Range;

/// Origin of one column of the factor.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ColumnInfo {
    /// IR parameter block name.
    pub block: String,
    /// Element index inside the block.
    pub index: usize,
}

impl ColumnInfo {
    pub fn name(&self) -> String {
        format!("{}[{}]", self.block, self.index)
    }
}

/// Square upper-triangular matrix stored as sorted sparse rows.
///
/// Row `i` holds `(column, value)` pairs with `i <= column < n`. A row that
/// does not start at its own column has a zero diagonal.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct SparseUpper {
    rows: Vec<Vec<(usize, f64)>>,
}

impl SparseUpper {
    pub fn from_rows(rows: Vec<Vec<(usize, f64)>>) -> Result<Self, CalibError> {
        let n = rows.len();
        for (i, row) in rows.iter().enumerate() {
            let sorted = row.windows(2).all(|w| w[0].0 < w[1].0);
            if !sorted || row.first().is_some_and(|e| e.0 < i) || row.last().is_some_and(|e| e.0 >= n) {
                return Err(CalibError::invalid(format!(
                    "row {i} of a {n}x{n} upper-triangular factor is not sorted above the diagonal"
                )));
            }
        }
        Ok(Self { rows })
    }

    /// Upper triangle of a dense square matrix, exact zeros dropped.
    pub fn from_dense(m: &DMatrix<f64>) -> Self {
        let rows = (0..m.nrows())
            .map(|i| {
                (i..m.ncols())
                    .filter(|&j| m[(i, j)] != 0.0)
                    .map(|j| (j, m[(i, j)]))
                    .collect()
            })
            .collect();
        Self { rows }
    }

    pub fn to_dense(&self) -> DMatrix<f64> {
        let n = self.dim();
        let mut m = DMatrix::zeros(n, n);
        for (i, row) in self.rows.iter().enumerate() {
            for &(j, v) in row {
                m[(i, j)] = v;
            }
        }
        m
    }

    pub fn dim(&self) -> usize {
        self.rows.len()
    }

    pub fn nnz(&self) -> usize {
        self.rows.iter().map(Vec::len).sum()
    }

    pub fn diag(&self, i: usize) -> f64 {
        match self.rows[i].first() {
            Some(&(j, v)) if j == i => v,
            _ => 0.0,
        }
    }

    pub fn row(&self, i: usize) -> &[(usize, f64)] {
        &self.rows[i]
    }

    /// Back substitution `R x = b`; `None` on a zero diagonal.
    pub fn solve_upper(&self, b: &DVector<f64>) -> Option<DVector<f64>> {
        let n = self.dim();
        let mut x = b.clone();
        for i in (0..n).rev() {
            let d = self.diag(i);
            if d == 0.0 {
                return None;
            }
            let off: f64 = self.rows[i][1..].iter().map(|&(j, v)| v * x[j]).sum();
            x[i] = (x[i] - off) / d;
        }
        Some(x)
    }

    /// Multiplies column `j` by `scale[j]`.
    pub fn scale_columns(&mut self, scale: &DVector<f64>) {
        for row in &mut self.rows {
            for (j, v) in row.iter_mut() {
                *v *= scale[*j];
            }
        }
    }

    /// Leading `k` columns of `Y` with `R_tᵀ Y = E` over the trailing block
    /// starting at `range.start`, by scatter forward substitution.
    fn trailing_inverse(&self, range: &Range<usize>) -> Option<DMatrix<f64>> {
        let n = self.dim();
        let a = range.start;
        let mut y = DMatrix::zeros(n - a, range.len());
        for (col, target) in range.clone().enumerate() {
            let mut acc = vec![0.0; n - a];
            acc[target - a] = 1.0;
            for i in a..n {
                let d = self.diag(i);
                if d == 0.0 {
                    return None;
                }
                let yi = acc[i - a] / d;
                y[(i - a, col)] = yi;
                if yi != 0.0 {
                    for &(j, v) in &self.rows[i][1..] {
                        acc[j - a] -= v * yi;
                    }
                }
            }
        }
        Some(y)
    }
}

/// Upper-triangular factor `R` of the final linearization.
///
/// Columns follow the free parameters in IR order; calibration parameters are
/// registered after the trajectory, so they form the trailing block.
#[derive(Debug, Clone, PartialEq)]
pub struct TriangularFactor {
    r: SparseUpper,
    columns: Vec<ColumnInfo>,
    column_scale: DVector<f64>,
    rank_tolerance: f64,
}

impl TriangularFactor {
    /// `column_scale[i]` is the norm column `i` was divided by before the
    /// factorization (`1` without normalization); `r` is the unscaled factor.
    pub fn new(
        r: SparseUpper,
        columns: Vec<ColumnInfo>,
        column_scale: DVector<f64>,
        rank_tolerance: f64,
    ) -> Result<Self, CalibError> {
        let n = columns.len();
        if r.dim() != n || column_scale.len() != n {
            return Err(CalibError::invalid(format!(
                "factor is {0}x{0} with {1} scales for {n} columns",
                r.dim(),
                column_scale.len()
            )));
        }
        Ok(Self {
            r,
            columns,
            column_scale,
            rank_tolerance,
        })
    }

    pub fn empty() -> Self {
        Self {
            r: SparseUpper::default(),
            columns: Vec::new(),
            column_scale: DVector::zeros(0),
            rank_tolerance: 0.0,
        }
    }

    /// Stored entries of `R`.
    pub fn nnz(&self) -> usize {
        self.r.nnz()
    }

    pub fn columns(&self) -> &[ColumnInfo] {
        &self.columns
    }

    pub fn dim(&self) -> usize {
        self.columns.len()
    }

    /// Column range of a parameter block, if any of its elements is free.
    ///
    /// Free elements of a block are contiguous.
    pub fn block_columns(&self, block: &str) -> Option<Range<usize>> {
        let start = self.columns.iter().position(|c| c.block == block)?;
        let len = self.columns[start..]
            .iter()
            .take_while(|c| c.block == block)
            .count();
        Some(start..start + len)
    }

    /// Marginal covariance of the columns in `range`.
    pub fn marginal_covariance(&self, range: Range<usize>) -> Result<DMatrix<f64>, CalibError> {
        check_range(self.dim(), &range)?;
        let tail = range.start..self.dim();
        let scaled: Vec<f64> = tail
            .clone()
            .map(|i| self.r.diag(i) / self.column_scale[i])
            .collect();
        check_rank(&scaled, self.rank_tolerance, tail.start, |i| {
            self.columns[i].name()
        })?;
        solve_marginal(&self.r, range)
    }

    /// `Σ ln R_ii` over `range`; half the log-determinant of the information
    /// carried by those columns after the preceding ones are eliminated.
    pub fn sum_log_diag(&self, range: Range<usize>) -> Result<f64, CalibError> {
        sum_log_diag_r(&self.r, range)
    }
}

fn sum_log_diag_r(r: &SparseUpper, range: Range<usize>) -> Result<f64, CalibError> {
    check_range(r.dim(), &range)?;
    range
        .map(|i| {
            let d = r.diag(i).abs();
            if d > 0.0 {
                Ok(d.ln())
            } else {
                Err(CalibError::ObservabilityFailure {
                    column: i,
                    parameter: format!("column {i}"),
                })
            }
        })
        .sum()
}

fn check_range(n: usize, range: &Range<usize>) -> Result<(), CalibError> {
    if range.start >= range.end || range.end > n {
        return Err(CalibError::invalid(format!(
            "column range {range:?} is empty or exceeds {n} columns"
        )));
    }
    Ok(())
}

fn check_rank(
    diag: &[f64],
    tolerance: f64,
    first: usize,
    name: impl Fn(usize) -> String,
) -> Result<(), CalibError> {
    let max = diag.iter().fold(0.0_f64, |m, d| m.max(d.abs()));
    for (k, d) in diag.iter().enumerate() {
        if !(*d > 0.0) || d.abs() <= tolerance * max {
            let column = first + k;
            return Err(CalibError::ObservabilityFailure {
                column,
                parameter: name(column),
            });
        }
    }
    Ok(())
}

/// Leading `k×k` block of `(R_tᵀR_t)⁻¹` via `R_tᵀ Y = E`, `Σ = YᵀY`.
fn solve_marginal(r: &SparseUpper, range: Range<usize>) -> Result<DMatrix<f64>, CalibError> {
    let a = range.start;
    let y = r
        .trailing_inverse(&range)
        .ok_or(CalibError::ObservabilityFailure {
            column: a,
            parameter: format!("column {a}"),
        })?;
    Ok(y.transpose() * y)
}
