//! Per-window JSON reports keyed by parameter element name.

use crate::window::WindowOutcome;
use anyhow::{Context, Result};
use egocalib_core::Real;
use egocalib_optim::{AssemblyReport, SolveStatus};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

/// Estimated value of every calibration parameter.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ParameterReport {
    pub window: usize,
    pub start: Real,
    pub end: Real,
    pub status: SolveStatus,
    pub iterations: usize,
    pub final_cost: Real,
    pub assembly: AssemblyReport,
    pub parameters: BTreeMap<String, Real>,
}

/// Marginal variance of every free calibration parameter.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CovarianceReport {
    pub window: usize,
    pub sum_log_diag_r: Option<Real>,
    pub variances: BTreeMap<String, Real>,
}

impl From<&WindowOutcome> for ParameterReport {
    fn from(o: &WindowOutcome) -> Self {
        Self {
            window: o.index,
            start: o.span.0,
            end: o.span.1,
            status: o.calibration.status,
            iterations: o.calibration.iterations,
            final_cost: o.calibration.final_cost,
            assembly: o.calibration.assembly,
            parameters: o.calibration.parameter_entries().into_iter().collect(),
        }
    }
}

impl From<&WindowOutcome> for CovarianceReport {
    fn from(o: &WindowOutcome) -> Self {
        Self {
            window: o.index,
            sum_log_diag_r: o.sum_log_diag_r,
            variances: o.variances.iter().cloned().collect(),
        }
    }
}

fn write_json<T: Serialize>(path: &Path, value: &T) -> Result<()> {
    let json = serde_json::to_string_pretty(value)?;
    std::fs::write(path, json).with_context(|| format!("failed to write {}", path.display()))
}

/// Writes `window_NNNN_parameters.json` and `window_NNNN_covariance.json`
/// into `dir`, creating it if needed. Returns both paths.
pub fn write_window_reports(dir: impl AsRef<Path>, outcome: &WindowOutcome) -> Result<(PathBuf, PathBuf)> {
    let dir = dir.as_ref();
    std::fs::create_dir_all(dir)
        .with_context(|| format!("failed to create report directory {}", dir.display()))?;
    let params = dir.join(format!("window_{:04}_parameters.json", outcome.index));
    let covariance = dir.join(format!("window_{:04}_covariance.json", outcome.index));
    write_json(&params, &ParameterReport::from(outcome))?;
    write_json(&covariance, &CovarianceReport::from(outcome))?;
    Ok((params, covariance))
}
