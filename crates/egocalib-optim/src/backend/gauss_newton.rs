use egocalib_core::CalibError;
use faer::sparse::{Argsort, Pair, SparseColMat, SymbolicSparseColMat};
use log::Level;
use nalgebra::DVector;
use std::collections::HashMap;

use super::sparse_qr::{givens_qr, GivensQr};
use crate::backend::{BackendSolution, BackendSolveOptions, CancelToken, OptimBackend, SolveStatus};
use crate::diagnostics::{ColumnInfo, SparseUpper, TriangularFactor};
use crate::factors::{ErrorTerm, FactorEval};
use crate::ir::{ParamBlock, ProblemIR};
use crate::robust::RobustKernel;

/// Costs below this are treated as an exact fit.
const MIN_COST: f64 = 1e-24;

/// Undamped Gauss-Newton on a sparse Jacobian, solved through Givens QR.
///
/// Each iteration stacks the whitened, robustly re-weighted residuals and
/// their Jacobian over the free columns into a `faer` sparse matrix whose
/// pattern is fixed when the problem is set up, optionally scales the
/// columns to unit norm, and solves `R Δ = -Qᵀ r`. A step that does not
/// reduce the cost is halved until it does; if none does, the current point
/// is returned as converged.
#[derive(Debug, Clone, Copy, Default)]
pub struct GaussNewtonBackend;

/// Maps free parameter elements to Jacobian columns.
#[derive(Debug, Clone)]
struct ColumnLayout {
    /// `blocks[p][e]` is the column of element `e` of parameter `p`.
    blocks: Vec<Vec<Option<usize>>>,
    columns: Vec<ColumnInfo>,
}

impl ColumnLayout {
    fn new(ir: &ProblemIR) -> Self {
        let mut columns = Vec::new();
        let blocks = ir
            .params
            .iter()
            .map(|p| {
                (0..p.dim)
                    .map(|e| {
                        if p.fixed.is_fixed(e) {
                            None
                        } else {
                            columns.push(ColumnInfo {
                                block: p.name.clone(),
                                index: e,
                            });
                            Some(columns.len() - 1)
                        }
                    })
                    .collect()
            })
            .collect();
        Self { blocks, columns }
    }

    fn len(&self) -> usize {
        self.columns.len()
    }

    fn unobservable(&self, column: usize) -> CalibError {
        CalibError::ObservabilityFailure {
            column,
            parameter: self.columns[column].name(),
        }
    }
}

/// Residual block evaluated at one linearization point.
struct BlockLinearization {
    rho: f64,
    sqrt_weight: f64,
    eval: FactorEval,
}

/// Stacked re-weighted system `J Δ ≈ -r`.
struct Linearization {
    jacobian: SparseColMat<usize, f64>,
    residual: DVector<f64>,
    cost: f64,
}

/// Column-scaled QR of a linearization.
struct Factorization {
    r_scaled: SparseUpper,
    scale: DVector<f64>,
    step: DVector<f64>,
}

impl Factorization {
    fn into_factor(self, layout: &ColumnLayout, rank_tolerance: f64) -> Result<TriangularFactor, CalibError> {
        let mut r = self.r_scaled;
        r.scale_columns(&self.scale);
        TriangularFactor::new(r, layout.columns.clone(), self.scale, rank_tolerance)
    }
}

/// Fixed sparsity of the Jacobian; entries are filled in pattern order.
struct JacobianPattern {
    symbolic: SymbolicSparseColMat<usize>,
    order: Argsort<usize>,
}

struct Problem<'a> {
    ir: &'a ProblemIR,
    layout: ColumnLayout,
    kernels: Vec<RobustKernel>,
    row_offsets: Vec<usize>,
    rows: usize,
    pattern: JacobianPattern,
    threads: usize,
}

/// Visits every `(row, column, block slot, element, residual row)` entry of
/// the Jacobian in a fixed order.
fn for_each_entry(
    ir: &ProblemIR,
    layout: &ColumnLayout,
    row_offsets: &[usize],
    mut visit: impl FnMut(usize, usize, usize, usize, usize, usize),
) {
    for (i, residual) in ir.residuals.iter().enumerate() {
        for (slot, id) in residual.params.iter().enumerate() {
            for (e, column) in layout.blocks[id.0].iter().enumerate() {
                let Some(c) = column else { continue };
                for k in 0..residual.residual_dim {
                    visit(i, row_offsets[i] + k, *c, slot, e, k);
                }
            }
        }
    }
}

impl<'a> Problem<'a> {
    fn new(ir: &'a ProblemIR, threads: usize) -> Result<Self, CalibError> {
        let kernels = ir
            .residuals
            .iter()
            .map(|r| {
                r.loss.validate().map_err(CalibError::InvalidInput)?;
                Ok(RobustKernel::new(r.loss, r.residual_dim))
            })
            .collect::<Result<Vec<_>, CalibError>>()?;
        let row_offsets: Vec<usize> = ir
            .residuals
            .iter()
            .scan(0, |next, r| {
                let at = *next;
                *next += r.residual_dim;
                Some(at)
            })
            .collect();
        let rows = ir.residual_rows();
        let layout = ColumnLayout::new(ir);

        let mut indices = Vec::new();
        for_each_entry(ir, &layout, &row_offsets, |_, row, c, _, _, _| {
            indices.push(Pair::new(row, c));
        });
        let (symbolic, order) = SymbolicSparseColMat::try_new_from_indices(rows, layout.len(), &indices)
            .map_err(|e| CalibError::invalid(format!("jacobian sparsity pattern: {e:?}")))?;

        Ok(Self {
            ir,
            layout,
            kernels,
            row_offsets,
            rows,
            pattern: JacobianPattern { symbolic, order },
            threads: threads.max(1),
        })
    }

    fn initial_values(&self, initial: &HashMap<String, DVector<f64>>) -> Result<Vec<DVector<f64>>, CalibError> {
        self.ir
            .params
            .iter()
            .map(|p| {
                let v = initial.get(&p.name).ok_or_else(|| {
                    CalibError::invalid(format!(
                        "initial values missing parameter {} (id {:?})",
                        p.name, p.id
                    ))
                })?;
                if v.len() != p.dim {
                    return Err(CalibError::invalid(format!(
                        "initial dimension mismatch for {}: expected {}, got {}",
                        p.name,
                        p.dim,
                        v.len()
                    )));
                }
                if v.iter().any(|x| !x.is_finite()) {
                    return Err(CalibError::invalid(format!(
                        "initial value of {} is not finite",
                        p.name
                    )));
                }
                let mut v = v.clone();
                clamp(p, &mut v);
                Ok(v)
            })
            .collect()
    }

    fn block_params<'v>(&self, index: usize, values: &'v [DVector<f64>]) -> Vec<&'v DVector<f64>> {
        self.ir.residuals[index]
            .params
            .iter()
            .map(|id| &values[id.0])
            .collect()
    }

    fn cost(&self, values: &[DVector<f64>]) -> Result<f64, CalibError> {
        let rhos = evaluate_blocks(self.ir.residuals.len(), self.threads, |i| {
            let r = self.ir.residuals[i]
                .factor
                .evaluate_residual(&self.block_params(i, values))?;
            Ok(self.kernels[i].rho_and_weight(r.norm_squared()).0)
        })?;
        Ok(0.5 * rhos.iter().sum::<f64>())
    }

    fn linearize(&self, values: &[DVector<f64>]) -> Result<Linearization, CalibError> {
        let blocks = evaluate_blocks(self.ir.residuals.len(), self.threads, |i| {
            let eval = self.ir.residuals[i]
                .factor
                .evaluate_jacobians(&self.block_params(i, values))?;
            let (rho, weight) = self.kernels[i].rho_and_weight(eval.residual.norm_squared());
            Ok(BlockLinearization {
                rho,
                sqrt_weight: weight.sqrt(),
                eval,
            })
        })?;

        let mut residual = DVector::zeros(self.rows);
        let mut cost = 0.0;
        for (i, block) in blocks.iter().enumerate() {
            let dim = block.eval.residual.len();
            cost += 0.5 * block.rho;
            residual
                .rows_mut(self.row_offsets[i], dim)
                .copy_from(&(&block.eval.residual * block.sqrt_weight));
        }

        let mut values = Vec::with_capacity(self.pattern.symbolic.compute_nnz());
        for_each_entry(self.ir, &self.layout, &self.row_offsets, |i, _, _, slot, e, k| {
            let block = &blocks[i];
            values.push(block.sqrt_weight * block.eval.jacobians[slot][(k, e)]);
        });
        let jacobian = SparseColMat::new_from_argsort(self.pattern.symbolic.clone(), &self.pattern.order, values.as_slice())
            .map_err(|e| CalibError::invalid(format!("sparse jacobian: {e:?}")))?;
        Ok(Linearization {
            jacobian,
            residual,
            cost,
        })
    }

    fn factorize(&self, lin: &Linearization, opts: &BackendSolveOptions) -> Result<Factorization, CalibError> {
        let n = self.layout.len();
        let jac = lin.jacobian.as_ref();
        let mut scale = DVector::from_element(n, 1.0);
        let mut rows = vec![Vec::new(); jac.nrows()];
        for c in 0..n {
            let values = jac.val_of_col(c);
            let norm = values.iter().map(|v| v * v).sum::<f64>().sqrt();
            if !(norm > 0.0) || !norm.is_finite() {
                return Err(self.layout.unobservable(c));
            }
            if opts.column_normalization {
                scale[c] = norm;
            }
            for (&row, &v) in jac.symbolic().row_idx_of_col_raw(c).iter().zip(values) {
                rows[row].push((c, v / scale[c]));
            }
        }

        let rhs: Vec<f64> = lin.residual.iter().map(|r| -r).collect();
        let GivensQr { r: r_scaled, qtb } = givens_qr(n, rows, &rhs)?;
        let max_diag = (0..n).fold(0.0_f64, |m, i| m.max(r_scaled.diag(i)));
        for i in 0..n {
            if r_scaled.diag(i) <= opts.rank_tolerance * max_diag {
                return Err(self.layout.unobservable(i));
            }
        }

        let z = r_scaled
            .solve_upper(&qtb)
            .ok_or_else(|| self.layout.unobservable(n.saturating_sub(1)))?;
        let step = z.component_div(&scale);
        Ok(Factorization {
            r_scaled,
            scale,
            step,
        })
    }

    fn apply(&self, values: &[DVector<f64>], step: &DVector<f64>, alpha: f64) -> Vec<DVector<f64>> {
        self.ir
            .params
            .iter()
            .zip(values)
            .zip(&self.layout.blocks)
            .map(|((p, v), columns)| {
                let mut v = v.clone();
                for (e, column) in columns.iter().enumerate() {
                    if let Some(c) = column {
                        v[e] += alpha * step[*c];
                    }
                }
                clamp(p, &mut v);
                v
            })
            .collect()
    }

    fn free_norm(&self, values: &[DVector<f64>]) -> f64 {
        values
            .iter()
            .zip(&self.layout.blocks)
            .flat_map(|(v, columns)| {
                columns
                    .iter()
                    .enumerate()
                    .filter(|(_, c)| c.is_some())
                    .map(move |(e, _)| v[e] * v[e])
            })
            .sum::<f64>()
            .sqrt()
    }
}

fn clamp(param: &ParamBlock, v: &mut DVector<f64>) {
    if let Some(bounds) = &param.bounds {
        for b in bounds {
            v[b.idx] = v[b.idx].clamp(b.lower, b.upper);
        }
    }
}

/// Evaluates `f` for every residual block, split over up to `threads`
/// scoped workers. Results keep block order.
fn evaluate_blocks<T, F>(count: usize, threads: usize, f: F) -> Result<Vec<T>, CalibError>
where
    T: Send,
    F: Fn(usize) -> Result<T, CalibError> + Sync,
{
    if threads <= 1 || count < 2 * threads {
        return (0..count).map(f).collect();
    }
    let chunk = count.div_ceil(threads);
    std::thread::scope(|scope| {
        let f = &f;
        let handles: Vec<_> = (0..count)
            .step_by(chunk)
            .map(|start| {
                let end = (start + chunk).min(count);
                scope.spawn(move || (start..end).map(f).collect::<Result<Vec<T>, CalibError>>())
            })
            .collect();
        let mut out = Vec::with_capacity(count);
        for handle in handles {
            match handle.join() {
                Ok(part) => out.extend(part?),
                Err(payload) => std::panic::resume_unwind(payload),
            }
        }
        Ok(out)
    })
}

impl OptimBackend for GaussNewtonBackend {
    fn solve(
        &self,
        ir: &ProblemIR,
        initial: &HashMap<String, DVector<f64>>,
        opts: &BackendSolveOptions,
        cancel: Option<&CancelToken>,
    ) -> Result<BackendSolution, CalibError> {
        opts.validate()?;
        ir.validate()
            .map_err(|e| CalibError::invalid(e.to_string()))?;
        let problem = Problem::new(ir, opts.threads)?;
        let n = problem.layout.len();
        if problem.rows < n {
            return Err(problem.layout.unobservable(problem.rows));
        }
        let level = if opts.verbosity > 0 {
            Level::Info
        } else {
            Level::Debug
        };

        let mut values = problem.initial_values(initial)?;
        let mut lin = problem.linearize(&values)?;
        let initial_cost = lin.cost;
        let mut status = SolveStatus::IterationLimit;
        let mut iterations = 0;
        log::log!(
            level,
            "gauss-newton: {} residual rows, {} free columns, initial cost {:.6e}",
            problem.rows,
            n,
            initial_cost
        );

        if n == 0 {
            status = SolveStatus::Converged;
        }
        while status == SolveStatus::IterationLimit && iterations < opts.max_iters {
            if cancel.is_some_and(CancelToken::is_cancelled) {
                status = SolveStatus::Cancelled;
                break;
            }
            let step = problem.factorize(&lin, opts)?.step;

            let mut alpha = 1.0;
            let mut accepted = None;
            for _ in 0..=opts.max_step_halvings {
                let candidate = problem.apply(&values, &step, alpha);
                let cost = problem.cost(&candidate)?;
                if cost < lin.cost {
                    accepted = Some((candidate, cost));
                    break;
                }
                alpha *= 0.5;
            }
            iterations += 1;

            let Some((candidate, cost)) = accepted else {
                log::log!(level, "iter {iterations:>3}: no descent along the step, stopping");
                status = SolveStatus::Converged;
                break;
            };
            let step_norm = alpha * step.norm();
            let decrease = (lin.cost - cost) / lin.cost.max(f64::MIN_POSITIVE);
            values = candidate;
            lin = problem.linearize(&values)?;
            log::log!(
                level,
                "iter {iterations:>3}: cost {:.6e} (-{:.3e} rel), step {:.3e}, alpha {alpha}",
                lin.cost,
                decrease,
                step_norm
            );

            let x_norm = problem.free_norm(&values);
            if step_norm <= opts.step_tolerance * (x_norm + opts.step_tolerance)
                || decrease <= opts.cost_tolerance
                || lin.cost < MIN_COST
            {
                status = SolveStatus::Converged;
            }
        }
        if status == SolveStatus::IterationLimit {
            log::warn!(
                "gauss-newton stopped after {iterations} iterations at cost {:.6e}",
                lin.cost
            );
        }

        let factor = if n == 0 {
            Some(TriangularFactor::empty())
        } else {
            let factored = problem
                .factorize(&lin, opts)
                .and_then(|f| f.into_factor(&problem.layout, opts.rank_tolerance));
            match factored {
                Ok(factor) => {
                    log::log!(level, "gauss-newton: factor with {} stored entries", factor.nnz());
                    Some(factor)
                }
                Err(e) if status == SolveStatus::Converged => return Err(e),
                Err(e) => {
                    log::warn!("no factor at the {status:?} estimate: {e}");
                    None
                }
            }
        };

        let params = ir
            .params
            .iter()
            .zip(values)
            .map(|(p, v)| (p.name.clone(), v))
            .collect();
        Ok(BackendSolution {
            params,
            initial_cost,
            final_cost: lin.cost,
            iterations,
            status,
            factor,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::factors::{FactorKind, PriorErrorTerm};
    use crate::ir::{Bound, FixedMask, ResidualBlock};
    use crate::robust::RobustLoss;
    use nalgebra::DMatrix;

    fn sparse(dense: &DMatrix<f64>) -> SparseColMat<usize, f64> {
        let mut indices = Vec::new();
        let mut values = Vec::new();
        for c in 0..dense.ncols() {
            for r in 0..dense.nrows() {
                if dense[(r, c)] != 0.0 {
                    indices.push(Pair::new(r, c));
                    values.push(dense[(r, c)]);
                }
            }
        }
        let (symbolic, order) =
            SymbolicSparseColMat::try_new_from_indices(dense.nrows(), dense.ncols(), &indices).unwrap();
        SparseColMat::new_from_argsort(symbolic, &order, values.as_slice()).unwrap()
    }

    fn prior(mean: &[f64], sigma: f64) -> FactorKind {
        FactorKind::Prior(PriorErrorTerm::new(
            DVector::from_column_slice(mean),
            DVector::from_element(mean.len(), 1.0 / sigma),
        ))
    }

    fn single_block(fixed: FixedMask, bounds: Option<Vec<Bound>>) -> (ProblemIR, HashMap<String, DVector<f64>>) {
        let mut ir = ProblemIR::new();
        let x = ir.add_param_block("x", 3, fixed, bounds);
        ir.add_residual_block(ResidualBlock::new(
            vec![x],
            RobustLoss::None,
            prior(&[1.0, -2.0, 0.5], 0.1),
        ));
        let initial = HashMap::from([("x".to_string(), DVector::zeros(3))]);
        (ir, initial)
    }

    #[test]
    fn linear_problem_converges_in_one_step() {
        let (ir, initial) = single_block(FixedMask::all_free(), None);
        let sol = GaussNewtonBackend
            .solve(&ir, &initial, &BackendSolveOptions::default(), None)
            .unwrap();
        assert_eq!(sol.status, SolveStatus::Converged);
        assert!((&sol.params["x"] - DVector::from_column_slice(&[1.0, -2.0, 0.5])).norm() < 1e-12);
        assert!(sol.final_cost < 1e-20);
        assert!(sol.initial_cost > 100.0);
        // Information of a prior with sigma 0.1 is 100.
        let cov = sol.factor.as_ref().unwrap().marginal_covariance(0..3).unwrap();
        assert!((cov - DMatrix::identity(3, 3) * 0.01).norm() < 1e-12);
    }

    #[test]
    fn fixed_elements_and_bounds_are_respected() {
        let (ir, initial) = single_block(
            FixedMask::fix_indices(&[1]),
            Some(vec![Bound::symmetric(0, 0.25)]),
        );
        let sol = GaussNewtonBackend
            .solve(&ir, &initial, &BackendSolveOptions::default(), None)
            .unwrap();
        let x = &sol.params["x"];
        assert_eq!(x[1], 0.0);
        assert!((x[0] - 0.25).abs() < 1e-12);
        assert!((x[2] - 0.5).abs() < 1e-9);
        assert_eq!(sol.factor.as_ref().map(TriangularFactor::dim), Some(2));
    }

    #[test]
    fn unconstrained_block_is_unobservable() {
        let (mut ir, mut initial) = single_block(FixedMask::all_free(), None);
        ir.add_param_block("b", 1, FixedMask::all_free(), None);
        initial.insert("b".to_string(), DVector::zeros(1));
        match GaussNewtonBackend.solve(&ir, &initial, &BackendSolveOptions::default(), None) {
            Err(CalibError::ObservabilityFailure { column, parameter }) => {
                assert_eq!(column, 3);
                assert_eq!(parameter, "b[0]");
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn duplicate_column_is_rank_deficient() {
        let mut ir = ProblemIR::new();
        ir.add_param_block("a", 1, FixedMask::all_free(), None);
        ir.add_param_block("b", 1, FixedMask::all_free(), None);
        let problem = Problem::new(&ir, 1).unwrap();
        let lin = Linearization {
            jacobian: sparse(&DMatrix::from_row_slice(3, 2, &[1.0, 1.0, 2.0, 2.0, -3.0, -3.0])),
            residual: DVector::from_column_slice(&[1.0, 0.0, 2.0]),
            cost: 2.5,
        };
        let opts = BackendSolveOptions::default();
        match problem.factorize(&lin, &opts) {
            Err(CalibError::ObservabilityFailure { column, .. }) => assert_eq!(column, 1),
            Err(other) => panic!("unexpected {other:?}"),
            Ok(_) => panic!("duplicate column accepted"),
        }

        let j = DMatrix::from_row_slice(3, 2, &[1.0, 0.0, 0.0, 2.0, 1.0, 1.0]);
        let lin = Linearization {
            jacobian: sparse(&j),
            ..lin
        };
        let f = problem.factorize(&lin, &opts).unwrap();
        let expected = -(j.transpose() * &j).try_inverse().unwrap() * j.transpose() * &lin.residual;
        assert!((f.step - expected).norm() < 1e-12);
    }

    #[test]
    fn cancelled_token_stops_before_first_iteration() {
        let (ir, initial) = single_block(FixedMask::all_free(), None);
        let token = CancelToken::new();
        token.cancel();
        let sol = GaussNewtonBackend
            .solve(&ir, &initial, &BackendSolveOptions::default(), Some(&token))
            .unwrap();
        assert_eq!(sol.status, SolveStatus::Cancelled);
        assert_eq!(sol.iterations, 0);
        assert_eq!(sol.params["x"], DVector::zeros(3));
        assert!(sol.factor.is_some());
    }

    #[test]
    fn cancelled_rank_deficient_solve_keeps_its_estimate() {
        let mut ir = ProblemIR::new();
        let a = ir.add_param_block("a", 1, FixedMask::all_free(), None);
        ir.add_param_block("b", 1, FixedMask::all_free(), None);
        // Two rows, neither of which sees b.
        for target in [1.0, 3.0] {
            ir.add_residual_block(ResidualBlock::new(vec![a], RobustLoss::None, prior(&[target], 1.0)));
        }
        let initial = HashMap::from([
            ("a".to_string(), DVector::zeros(1)),
            ("b".to_string(), DVector::zeros(1)),
        ]);
        let token = CancelToken::new();
        token.cancel();
        let sol = GaussNewtonBackend
            .solve(&ir, &initial, &BackendSolveOptions::default(), Some(&token))
            .unwrap();
        assert_eq!(sol.status, SolveStatus::Cancelled);
        assert!(sol.factor.is_none());
        assert!(sol.final_cost > 0.0);
    }

    #[test]
    fn threaded_evaluation_matches_serial() {
        let mut ir = ProblemIR::new();
        let x = ir.add_param_block("x", 2, FixedMask::all_free(), None);
        for k in 0..40 {
            let t = k as f64 * 0.1;
            ir.add_residual_block(ResidualBlock::new(
                vec![x],
                RobustLoss::Huber { scale: 1.0 },
                prior(&[t.sin(), t.cos()], 0.5),
            ));
        }
        let initial = HashMap::from([("x".to_string(), DVector::from_element(2, 3.0))]);
        let serial = GaussNewtonBackend
            .solve(&ir, &initial, &BackendSolveOptions::default(), None)
            .unwrap();
        let opts = BackendSolveOptions {
            threads: 4,
            ..BackendSolveOptions::default()
        };
        let threaded = GaussNewtonBackend.solve(&ir, &initial, &opts, None).unwrap();
        assert!((&serial.params["x"] - &threaded.params["x"]).norm() < 1e-12);
        assert!((serial.final_cost - threaded.final_cost).abs() < 1e-12);
    }

    #[test]
    fn missing_initial_value_is_invalid_input() {
        let (ir, _) = single_block(FixedMask::all_free(), None);
        let err = GaussNewtonBackend
            .solve(&ir, &HashMap::new(), &BackendSolveOptions::default(), None)
            .unwrap_err();
        assert!(matches!(err, CalibError::InvalidInput(_)));
    }
}
