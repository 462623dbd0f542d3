use egocalib_core::{disambiguate_rotvec, join6, split6, CalibError, Mat6, PoseMeasurement, Real, Vec6};
use nalgebra::{DMatrix, DVector};

use super::{expect_params, sqrt_information, ErrorTerm, FactorEval};
use crate::trajectory::{SplineWindow, TrajectorySample};

/// Direct pose measurement against the trajectory.
///
/// Residual: `W · ([p(τ+δ); r(τ+δ)] - [p_m; r_m])` where the measured
/// rotation vector is re-expressed next to the curve's before differencing.
#[derive(Debug, Clone, PartialEq)]
pub struct PoseErrorTerm {
    stamp: Real,
    measured: Vec6,
    sqrt_info: Mat6,
    window: SplineWindow,
}

impl PoseErrorTerm {
    pub fn new(measurement: &PoseMeasurement, window: SplineWindow) -> Result<Self, CalibError> {
        measurement.validate()?;
        Ok(Self {
            stamp: measurement.timestamp,
            measured: measurement.pose(),
            sqrt_info: sqrt_information(&measurement.covariance)?,
            window,
        })
    }

    fn sample(&self, params: &[&DVector<f64>]) -> Result<TrajectorySample, CalibError> {
        expect_params(self.label(), params, &self.param_dims())?;
        let (control, rest) = params.split_at(self.window.count());
        self.window.sample(self.stamp + rest[0][0], control)
    }

    fn whitened_error(&self, sample: &TrajectorySample) -> Vec6 {
        let (_, r) = split6(&sample.pose.value);
        let (pm, rm) = split6(&self.measured);
        let measured = join6(&pm, &disambiguate_rotvec(&r, &rm));
        self.sqrt_info * (sample.pose.value - measured)
    }
}

impl ErrorTerm for PoseErrorTerm {
    fn label(&self) -> &'static str {
        "pose"
    }

    fn residual_dim(&self) -> usize {
        6
    }

    fn param_dims(&self) -> Vec<usize> {
        let mut dims = vec![6; self.window.count()];
        dims.push(1);
        dims
    }

    fn evaluate_residual(&self, params: &[&DVector<f64>]) -> Result<DVector<f64>, CalibError> {
        let sample = self.sample(params)?;
        Ok(DVector::from_column_slice(self.whitened_error(&sample).as_slice()))
    }

    fn evaluate_jacobians(&self, params: &[&DVector<f64>]) -> Result<FactorEval, CalibError> {
        let sample = self.sample(params)?;
        let residual = DVector::from_column_slice(self.whitened_error(&sample).as_slice());

        let mut jacobians = Vec::with_capacity(self.window.count() + 1);
        for i in 0..self.window.count() {
            let local = i.wrapping_sub(sample.offset());
            if local < sample.active() {
                let block = self.sqrt_info * sample.pose_weight(local);
                jacobians.push(DMatrix::from_column_slice(6, 6, block.as_slice()));
            } else {
                jacobians.push(DMatrix::zeros(6, 6));
            }
        }
        let d_delay = self.sqrt_info * sample.pose_rate();
        jacobians.push(DMatrix::from_column_slice(6, 1, d_delay.as_slice()));

        Ok(FactorEval {
            residual,
            jacobians,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use egocalib_core::synthetic::{vehicle::uniform_stamps, VehicleScenario};
    use egocalib_core::{BSplinePose, SplineOptions};

    fn setup(stamp: f64) -> (PoseErrorTerm, Vec<DVector<f64>>) {
        let scenario = VehicleScenario::default();
        let poses = scenario.pose_measurements(&uniform_stamps(0.0, 0.1, 50));
        let curve = BSplinePose::fit_measurements(&poses, &SplineOptions::default()).unwrap();
        let window = SplineWindow::covering(curve.layout(), stamp, 0.05).unwrap();
        let measured = scenario.pose_measurements(&[stamp])[0];
        let mut params: Vec<DVector<f64>> = (window.first()..window.first() + window.count())
            .map(|i| DVector::from_column_slice(curve.control_points()[i].as_slice()))
            .collect();
        params.push(DVector::from_element(1, 0.0));
        (PoseErrorTerm::new(&measured, window).unwrap(), params)
    }

    #[test]
    fn residual_is_small_on_the_fitted_curve() {
        let (term, params) = setup(2.43);
        let refs: Vec<&DVector<f64>> = params.iter().collect();
        let r = term.evaluate_residual(&refs).unwrap();
        // Whitened by sigma = 1e-3; the fit smooths the noise.
        assert!(r.norm() < 10.0, "{r:?}");
    }

    #[test]
    fn delay_and_control_jacobians_match_finite_differences() {
        let (term, mut params) = setup(3.07);
        let last = params.len() - 1;
        params[last][0] = 0.013;
        let refs: Vec<&DVector<f64>> = params.iter().collect();
        let eval = term.evaluate_jacobians(&refs).unwrap();

        let h = 1e-6;
        for b in [0, 2, last] {
            for k in 0..params[b].len() {
                let mut up = params.clone();
                let mut down = params.clone();
                up[b][k] += h;
                down[b][k] -= h;
                let ru = term.evaluate_residual(&up.iter().collect::<Vec<_>>()).unwrap();
                let rd = term.evaluate_residual(&down.iter().collect::<Vec<_>>()).unwrap();
                let fd = (ru - rd) / (2.0 * h);
                let analytic = eval.jacobians[b].column(k);
                assert!(
                    (&fd - analytic).norm() < 1e-4 * fd.norm().max(1.0),
                    "block {b} column {k}: {fd:?} vs {analytic:?}"
                );
            }
        }
        assert!(eval.jacobians[last].norm() > 1.0);
    }
}
