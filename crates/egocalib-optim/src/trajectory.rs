//! Trajectory design variable.
//!
//! Adopts the control points of a [`BSplinePose`] as IR parameter blocks
//! (`traj/{i}`, 6D each) and evaluates the curve from solver-side parameter
//! vectors. Every quantity comes back with its derivatives with respect to the
//! control points and to time, so error terms can chain-rule through the
//! curve without touching the basis themselves.

use std::collections::HashMap;

use egocalib_core::{
    right_jacobian, rotvec_to_matrix, BSplinePose, CalibError, PoseSample, Real, SegmentBasis,
    SplineLayout, Vec3, Vec6,
};
use nalgebra::{DVector, Matrix6, SVector, Vector3};
use num_dual::{jacobian, DualSVec64};

use crate::ir::{FixedMask, ParamId, ProblemIR};

/// IR name of control point `i`.
pub fn control_point_name(i: usize) -> String {
    format!("traj/{i}")
}

/// Registers every control point of `curve` as a 6D parameter block.
///
/// Returns the handles in control-point order.
pub fn register_control_points(
    curve: &BSplinePose,
    ir: &mut ProblemIR,
    initial: &mut HashMap<String, DVector<f64>>,
    fixed: bool,
) -> Vec<ParamId> {
    curve
        .control_points()
        .iter()
        .enumerate()
        .map(|(i, c)| {
            let name = control_point_name(i);
            let mask = if fixed {
                FixedMask::all_fixed(6)
            } else {
                FixedMask::all_free()
            };
            let id = ir.add_param_block(name.clone(), 6, mask, None);
            initial.insert(name, DVector::from_column_slice(c.as_slice()));
            id
        })
        .collect()
}

/// Rebuilds the curve from solved control-point vectors.
pub fn curve_from_params(
    template: &BSplinePose,
    params: &HashMap<String, DVector<f64>>,
) -> Result<BSplinePose, CalibError> {
    let control_points = (0..template.control_points().len())
        .map(|i| {
            let name = control_point_name(i);
            let v = params
                .get(&name)
                .ok_or_else(|| CalibError::invalid(format!("missing control point {name}")))?;
            if v.len() != 6 {
                return Err(CalibError::invalid(format!(
                    "control point {name} has {} entries",
                    v.len()
                )));
            }
            Ok(Vec6::from_column_slice(v.as_slice()))
        })
        .collect::<Result<Vec<_>, _>>()?;
    BSplinePose::from_control_points(template.layout().clone(), control_points)
}

/// Contiguous run of control points an error term depends on.
///
/// The run covers every segment the term can reach while its delay stays
/// inside `[-delay_bound, delay_bound]`, so the term's parameter list does
/// not change during optimization.
#[derive(Debug, Clone, PartialEq)]
pub struct SplineWindow {
    layout: SplineLayout,
    first: usize,
    count: usize,
}

impl SplineWindow {
    /// Window for a measurement stamped `stamp`; fails if any admissible
    /// delay would take the query out of the curve span.
    pub fn covering(layout: &SplineLayout, stamp: Real, delay_bound: Real) -> Result<Self, CalibError> {
        let lo = layout.segment_index(stamp - delay_bound)?;
        let hi = layout.segment_index(stamp + delay_bound)?;
        Ok(Self {
            layout: layout.clone(),
            first: lo,
            count: hi - lo + layout.order(),
        })
    }

    /// Global index of the first control point.
    pub fn first(&self) -> usize {
        self.first
    }

    /// Number of control points in the window.
    pub fn count(&self) -> usize {
        self.count
    }

    /// Evaluates the curve at `t` from the window's control points.
    ///
    /// `control[j]` is the 6-vector of control point `first + j`.
    pub fn sample(&self, t: Real, control: &[&DVector<f64>]) -> Result<TrajectorySample, CalibError> {
        if control.len() != self.count {
            return Err(CalibError::invalid(format!(
                "trajectory window expects {} control points, got {}",
                self.count,
                control.len()
            )));
        }
        let basis = self.layout.basis(t)?;
        if basis.first < self.first || basis.first + basis.len() > self.first + self.count {
            return Err(CalibError::OutOfRangeQuery {
                time: t,
                start: self.layout.start() + self.first as Real * self.layout.knot_spacing(),
                end: self.layout.start()
                    + (self.first + self.count + 1 - self.layout.order()) as Real
                        * self.layout.knot_spacing(),
            });
        }
        let offset = basis.first - self.first;
        let pose = basis.combine(|i| Vec6::from_column_slice(control[i - self.first].as_slice()));
        Ok(TrajectorySample {
            pose,
            offset,
            basis,
        })
    }
}

/// Curve state at one instant plus the basis needed for the chain rule.
#[derive(Debug, Clone)]
pub struct TrajectorySample {
    pub pose: PoseSample,
    offset: usize,
    basis: SegmentBasis,
}

/// Body-frame velocities with their derivatives.
#[derive(Debug, Clone)]
pub struct BodyVelocities {
    pub linear: Vec3,
    pub angular: Vec3,
    /// `∂[v; ω]/∂c_j` for the active control points of the segment.
    pub d_control: Vec<Matrix6<f64>>,
    /// `∂[v; ω]/∂t`.
    pub d_time: Vec6,
}

impl TrajectorySample {
    /// Local index (within the window) of the first active control point.
    pub fn offset(&self) -> usize {
        self.offset
    }

    /// Number of active control points.
    pub fn active(&self) -> usize {
        self.basis.len()
    }

    /// Weight of active control point `j`: `∂pose/∂c_j = w_j · I₆`.
    pub fn pose_weight(&self, j: usize) -> f64 {
        self.basis.values[j]
    }

    /// `∂pose/∂t`.
    pub fn pose_rate(&self) -> Vec6 {
        self.pose.first_derivative
    }

    /// Body linear velocity `Cᵀ ṗ` and angular velocity `J_r(r) ṙ`.
    pub fn body_velocities(&self) -> BodyVelocities {
        let p = &self.pose;
        let y0 = SVector::<f64, 9>::from_column_slice(&[
            p.value[3],
            p.value[4],
            p.value[5],
            p.first_derivative[3],
            p.first_derivative[4],
            p.first_derivative[5],
            p.first_derivative[0],
            p.first_derivative[1],
            p.first_derivative[2],
        ]);
        let (f, g) = jacobian(
            |y: SVector<DualSVec64<9>, 9>| {
                let r = Vector3::new(y[0].clone(), y[1].clone(), y[2].clone());
                let rdot = Vector3::new(y[3].clone(), y[4].clone(), y[5].clone());
                let pdot = Vector3::new(y[6].clone(), y[7].clone(), y[8].clone());
                let v = rotvec_to_matrix(&r).transpose() * pdot;
                let w = right_jacobian(&r) * rdot;
                SVector::<DualSVec64<9>, 6>::from_column_slice(&[
                    v[0].clone(),
                    v[1].clone(),
                    v[2].clone(),
                    w[0].clone(),
                    w[1].clone(),
                    w[2].clone(),
                ])
            },
            y0,
        );

        let g_r = g.fixed_view::<6, 3>(0, 0);
        let g_rdot = g.fixed_view::<6, 3>(0, 3);
        let g_pdot = g.fixed_view::<6, 3>(0, 6);

        let d_control = (0..self.basis.len())
            .map(|j| {
                let w = self.basis.values[j];
                let dw = self.basis.first_derivative[j];
                let mut block = Matrix6::zeros();
                block.fixed_view_mut::<6, 3>(0, 0).copy_from(&(g_pdot * dw));
                block
                    .fixed_view_mut::<6, 3>(0, 3)
                    .copy_from(&(g_r * w + g_rdot * dw));
                block
            })
            .collect();

        let rdot = p.first_derivative.fixed_rows::<3>(3).into_owned();
        let rddot = p.second_derivative.fixed_rows::<3>(3).into_owned();
        let pddot = p.second_derivative.fixed_rows::<3>(0).into_owned();
        let d_time = g_r * rdot + g_rdot * rddot + g_pdot * pddot;

        BodyVelocities {
            linear: Vec3::new(f[0], f[1], f[2]),
            angular: Vec3::new(f[3], f[4], f[5]),
            d_control,
            d_time,
        }
    }
}
