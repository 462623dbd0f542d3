//! Row-oriented Givens QR of a sparse least-squares system.
//!
//! Rows are merged one at a time into a sparse upper-triangular `R`, with the
//! right-hand side rotated alongside, so `R` and `Qᵀb` come out without ever
//! forming `Q`. Columns keep their natural order: the trailing columns of `R`
//! stay the trailing parameters of the problem, which the marginal covariance
//! and `Σ ln R_ii` queries rely on.

use nalgebra::DVector;

use crate::diagnostics::SparseUpper;
use egocalib_core::CalibError;

type SparseRow = Vec<(usize, f64)>;

/// `R` with non-negative diagonal and the leading `n` entries of `Qᵀb`.
pub(crate) struct GivensQr {
    pub r: SparseUpper,
    pub qtb: DVector<f64>,
}

/// Factors the `rows × n` system given as sorted sparse rows with right-hand
/// side `rhs`. A column that never receives a pivot leaves an empty row in
/// `R`, which reads back as a zero diagonal.
pub(crate) fn givens_qr(n: usize, rows: Vec<SparseRow>, rhs: &[f64]) -> Result<GivensQr, CalibError> {
    if rows.len() != rhs.len() {
        return Err(CalibError::invalid(format!(
            "{} sparse rows with {} right-hand side entries",
            rows.len(),
            rhs.len()
        )));
    }
    let mut r: Vec<SparseRow> = vec![Vec::new(); n];
    let mut qtb = DVector::zeros(n);

    for (mut row, mut b) in rows.into_iter().zip(rhs.iter().copied()) {
        row.retain(|e| e.1 != 0.0);
        while let Some(&(k, a)) = row.first() {
            if k >= n {
                return Err(CalibError::invalid(format!("column {k} outside {n} columns")));
            }
            if r[k].is_empty() {
                if a < 0.0 {
                    row.iter_mut().for_each(|e| e.1 = -e.1);
                    b = -b;
                }
                r[k] = row;
                qtb[k] = b;
                break;
            }
            let d = r[k][0].1;
            let h = d.hypot(a);
            let (c, s) = (d / h, a / h);
            let (pivot, rest) = rotate(&r[k], &row, c, s);
            r[k] = pivot;
            row = rest;
            let bk = qtb[k];
            qtb[k] = c * bk + s * b;
            b = -s * bk + c * b;
        }
    }
    Ok(GivensQr {
        r: SparseUpper::from_rows(r)?,
        qtb,
    })
}

/// Applies the rotation `[c s; -s c]` to the pivot row `x` and incoming row
/// `y`, which share their leading column. The incoming row loses that column.
fn rotate(x: &[(usize, f64)], y: &[(usize, f64)], c: f64, s: f64) -> (SparseRow, SparseRow) {
    let mut top = Vec::with_capacity(x.len() + y.len());
    let mut bottom = Vec::with_capacity(x.len() + y.len());
    let lead = x[0].0;
    let (mut i, mut j) = (0, 0);
    while i < x.len() || j < y.len() {
        let (col, u, v) = match (x.get(i), y.get(j)) {
            (Some(&(cx, u)), Some(&(cy, v))) if cx == cy => {
                i += 1;
                j += 1;
                (cx, u, v)
            }
            (Some(&(cx, u)), Some(&(cy, _))) if cx < cy => {
                i += 1;
                (cx, u, 0.0)
            }
            (Some(&(cx, u)), None) => {
                i += 1;
                (cx, u, 0.0)
            }
            (_, Some(&(cy, v))) => {
                j += 1;
                (cy, 0.0, v)
            }
            (None, None) => break,
        };
        let upper = c * u + s * v;
        if upper != 0.0 || col == lead {
            top.push((col, upper));
        }
        let lower = -s * u + c * v;
        if col != lead && lower != 0.0 {
            bottom.push((col, lower));
        }
    }
    (top, bottom)
}
