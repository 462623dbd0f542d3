use thiserror::Error;

/// Failure classes surfaced by calibration operations.
///
/// The variants map to how a caller is expected to react: input errors are
/// fixed by rejecting the offending record or configuration, convergence
/// failures can be retried with a different setup, observability failures
/// point at the calibration design itself, and out-of-range queries are
/// contract violations of the current operation.
#[derive(Debug, Error, Clone, PartialEq)]
pub enum CalibError {
    /// Malformed or out-of-range measurement or configuration value.
    #[error("invalid input: {0}")]
    InvalidInput(String),
    /// Iteration budget exhausted before the convergence test was met.
    #[error("solver did not converge in {iterations} iterations (cost {cost:.6e})")]
    ConvergenceFailure { iterations: usize, cost: f64 },
    /// Rank-deficient information for a parameter.
    #[error("parameter {parameter} (column {column}) is not observable")]
    ObservabilityFailure { column: usize, parameter: String },
    /// Trajectory evaluated outside its fitted span.
    #[error("time {time} is outside the trajectory span [{start}, {end}]")]
    OutOfRangeQuery { time: f64, start: f64, end: f64 },
}

impl CalibError {
    pub fn invalid(msg: impl Into<String>) -> Self {
        Self::InvalidInput(msg.into())
    }

    /// Returns `true` for failures that may succeed with a different solver
    /// setup on the same data.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::ConvergenceFailure { .. })
    }
}
