//! Uniform B-spline pose curve.
//!
//! The curve maps time to a 6-vector `[p; r]` (position and rotation vector)
//! and is evaluated with the matrix form of the uniform B-spline basis:
//!
//! `x(t) = [1, u, .., u^(k-1)] · M · [c_s, .., c_(s+k-1)]ᵀ`, `u = (t - t_s) / Δt`
//!
//! where `k` is the order and `M` the constant basis matrix. Control points are
//! stored as plain 6-vectors so the optimizer can adopt them as parameter
//! blocks.

use nalgebra::{DMatrix, DVector};
use serde::{Deserialize, Serialize};

use crate::{
    join6, left_jacobian, right_jacobian, rotvec_to_matrix, split6, unwrap_rotvecs, CalibError,
    Mat3, PoseMeasurement, Real, Vec3, Vec6,
};

/// Knot density and smoothing used when fitting a curve to pose samples.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct SplineOptions {
    /// Spline order (degree + 1).
    pub order: usize,
    /// Target number of knots per second of data.
    pub knots_per_second: Real,
    /// Upper bound on the number of segments.
    pub max_segments: usize,
    /// Second-difference penalty on the translation control points.
    pub translation_lambda: Real,
    /// Second-difference penalty on the rotation control points.
    pub rotation_lambda: Real,
}

impl Default for SplineOptions {
    fn default() -> Self {
        Self {
            order: 4,
            knots_per_second: 5.0,
            max_segments: 2000,
            translation_lambda: 1e-6,
            rotation_lambda: 1e-6,
        }
    }
}

impl SplineOptions {
    /// Number of segments for `count` samples covering `duration` seconds.
    ///
    /// Dense data gets `knots_per_second · duration` segments, sparse data one
    /// segment per sample; the result is clamped to `[1, max_segments]`.
    pub fn segments_for(&self, count: usize, duration: Real) -> usize {
        if duration <= 0.0 {
            return 1;
        }
        let rate = count as Real / duration;
        let segments = if rate > self.knots_per_second {
            (self.knots_per_second * duration).round() as usize
        } else {
            count
        };
        segments.clamp(1, self.max_segments.max(1))
    }
}

/// Basis weights of one segment and their time derivatives.
///
/// `values[j]` is the weight of control point `first + j`; it is also the
/// derivative of the curve value with respect to that control point.
#[derive(Debug, Clone, PartialEq)]
pub struct SegmentBasis {
    pub first: usize,
    pub values: DVector<Real>,
    pub first_derivative: DVector<Real>,
    pub second_derivative: DVector<Real>,
}

impl SegmentBasis {
    /// Blends control points into a [`PoseSample`].
    ///
    /// `control(i)` must return the control point with global index `i`.
    pub fn combine(&self, mut control: impl FnMut(usize) -> Vec6) -> PoseSample {
        let mut sample = PoseSample::default();
        for j in 0..self.values.len() {
            let c = control(self.first + j);
            sample.value += c * self.values[j];
            sample.first_derivative += c * self.first_derivative[j];
            sample.second_derivative += c * self.second_derivative[j];
        }
        sample
    }

    /// Number of control points the segment depends on.
    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }
}

/// Knot layout of a uniform B-spline.
#[derive(Debug, Clone, PartialEq)]
pub struct SplineLayout {
    order: usize,
    start: Real,
    knot_spacing: Real,
    segments: usize,
    basis: DMatrix<Real>,
}

impl SplineLayout {
    pub fn new(order: usize, start: Real, end: Real, segments: usize) -> Result<Self, CalibError> {
        if order < 2 {
            return Err(CalibError::invalid(format!(
                "spline order must be at least 2, got {order}"
            )));
        }
        if segments == 0 {
            return Err(CalibError::invalid("spline needs at least one segment"));
        }
        if !(start.is_finite() && end.is_finite()) || end <= start {
            return Err(CalibError::invalid(format!(
                "invalid spline span [{start}, {end}]"
            )));
        }
        Ok(Self {
            order,
            start,
            knot_spacing: (end - start) / segments as Real,
            segments,
            basis: basis_matrix(order),
        })
    }

    pub fn order(&self) -> usize {
        self.order
    }

    pub fn start(&self) -> Real {
        self.start
    }

    pub fn end(&self) -> Real {
        self.start + self.knot_spacing * self.segments as Real
    }

    pub fn knot_spacing(&self) -> Real {
        self.knot_spacing
    }

    pub fn segments(&self) -> usize {
        self.segments
    }

    pub fn num_control_points(&self) -> usize {
        self.segments + self.order - 1
    }

    fn tolerance(&self) -> Real {
        1e-9 * self.knot_spacing
    }

    /// Returns `true` if `t` lies inside the fitted span.
    pub fn contains(&self, t: Real) -> bool {
        t >= self.start - self.tolerance() && t <= self.end() + self.tolerance()
    }

    /// Segment index of an in-span time.
    pub fn segment_index(&self, t: Real) -> Result<usize, CalibError> {
        if !self.contains(t) {
            return Err(self.out_of_range(t));
        }
        Ok(self.clamped_segment(t))
    }

    /// Basis weights at `t`; fails outside the fitted span.
    pub fn basis(&self, t: Real) -> Result<SegmentBasis, CalibError> {
        let segment = self.segment_index(t)?;
        Ok(self.basis_in_segment(segment, t))
    }

    /// Basis weights at `t`, continuing the boundary polynomials up to
    /// `margin` seconds past either end of the span.
    pub fn basis_extrapolated(&self, t: Real, margin: Real) -> Result<SegmentBasis, CalibError> {
        let margin = margin.max(0.0);
        if !(t >= self.start - margin - self.tolerance()
            && t <= self.end() + margin + self.tolerance())
        {
            return Err(self.out_of_range(t));
        }
        Ok(self.basis_in_segment(self.clamped_segment(t), t))
    }

    fn out_of_range(&self, t: Real) -> CalibError {
        CalibError::OutOfRangeQuery {
            time: t,
            start: self.start,
            end: self.end(),
        }
    }

    fn clamped_segment(&self, t: Real) -> usize {
        let s = ((t - self.start) / self.knot_spacing).floor();
        if s <= 0.0 {
            0
        } else {
            (s as usize).min(self.segments - 1)
        }
    }

    fn basis_in_segment(&self, segment: usize, t: Real) -> SegmentBasis {
        let k = self.order;
        let dt = self.knot_spacing;
        let u = (t - self.start) / dt - segment as Real;

        let mut powers = DVector::zeros(k);
        let mut d_powers = DVector::zeros(k);
        let mut dd_powers = DVector::zeros(k);
        for i in 0..k {
            powers[i] = u.powi(i as i32);
            if i >= 1 {
                d_powers[i] = i as Real * u.powi(i as i32 - 1) / dt;
            }
            if i >= 2 {
                dd_powers[i] = (i * (i - 1)) as Real * u.powi(i as i32 - 2) / (dt * dt);
            }
        }

        let mt = self.basis.transpose();
        SegmentBasis {
            first: segment,
            values: &mt * powers,
            first_derivative: &mt * d_powers,
            second_derivative: &mt * dd_powers,
        }
    }
}

/// Basis matrix of a uniform B-spline of order `k`.
///
/// Row `i` holds the coefficients of `u^i`, column `j` belongs to the `j`-th
/// control point of the segment.
fn basis_matrix(k: usize) -> DMatrix<Real> {
    let n = k - 1;
    let norm = factorial(n);
    DMatrix::from_fn(k, k, |i, j| {
        let mut sum = 0.0;
        for s in j..k {
            let sign = if (s - j) % 2 == 0 { 1.0 } else { -1.0 };
            sum += sign * binomial(k, s - j) * ((n - s) as Real).powi((n - i) as i32);
        }
        binomial(n, i) * sum / norm
    })
}

fn factorial(n: usize) -> Real {
    (1..=n).map(|v| v as Real).product()
}

fn binomial(n: usize, k: usize) -> Real {
    if k > n {
        return 0.0;
    }
    factorial(n) / (factorial(k) * factorial(n - k))
}

/// Curve value and time derivatives at one instant.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PoseSample {
    /// `[p; r]`
    pub value: Vec6,
    /// `[ṗ; ṙ]`
    pub first_derivative: Vec6,
    /// `[p̈; r̈]`
    pub second_derivative: Vec6,
}

impl Default for PoseSample {
    fn default() -> Self {
        Self {
            value: Vec6::zeros(),
            first_derivative: Vec6::zeros(),
            second_derivative: Vec6::zeros(),
        }
    }
}

impl PoseSample {
    pub fn position(&self) -> Vec3 {
        split6(&self.value).0
    }

    pub fn rotation_vector(&self) -> Vec3 {
        split6(&self.value).1
    }

    /// Rotation from the moving frame to the world frame.
    pub fn orientation(&self) -> Mat3 {
        rotvec_to_matrix(&self.rotation_vector())
    }

    pub fn linear_velocity_world(&self) -> Vec3 {
        split6(&self.first_derivative).0
    }

    pub fn linear_velocity_body(&self) -> Vec3 {
        self.orientation().transpose() * self.linear_velocity_world()
    }

    pub fn angular_velocity_body(&self) -> Vec3 {
        let (_, rdot) = split6(&self.first_derivative);
        right_jacobian(&self.rotation_vector()) * rdot
    }

    pub fn angular_velocity_world(&self) -> Vec3 {
        let (_, rdot) = split6(&self.first_derivative);
        left_jacobian(&self.rotation_vector()) * rdot
    }

    pub fn linear_acceleration_world(&self) -> Vec3 {
        split6(&self.second_derivative).0
    }
}

/// Pose curve: a uniform B-spline over `[p; r]` control points.
#[derive(Debug, Clone, PartialEq)]
pub struct BSplinePose {
    layout: SplineLayout,
    control_points: Vec<Vec6>,
}

impl BSplinePose {
    pub fn from_control_points(
        layout: SplineLayout,
        control_points: Vec<Vec6>,
    ) -> Result<Self, CalibError> {
        if control_points.len() != layout.num_control_points() {
            return Err(CalibError::invalid(format!(
                "layout expects {} control points, got {}",
                layout.num_control_points(),
                control_points.len()
            )));
        }
        Ok(Self {
            layout,
            control_points,
        })
    }

    /// Regularized least-squares fit to pose samples.
    ///
    /// The rotation halves of `poses` must already be disambiguated (see
    /// [`unwrap_rotvecs`]). The penalty terms weight squared second
    /// differences of consecutive control points.
    pub fn fit(
        order: usize,
        times: &[Real],
        poses: &[Vec6],
        segments: usize,
        translation_lambda: Real,
        rotation_lambda: Real,
    ) -> Result<Self, CalibError> {
        if times.len() != poses.len() {
            return Err(CalibError::invalid(format!(
                "{} timestamps but {} poses",
                times.len(),
                poses.len()
            )));
        }
        if times.len() < 2 {
            return Err(CalibError::invalid("need at least two samples to fit a curve"));
        }
        if times.windows(2).any(|w| w[1] < w[0]) {
            return Err(CalibError::invalid("sample timestamps must be non-decreasing"));
        }
        if times.iter().any(|t| !t.is_finite()) || poses.iter().any(|p| !p.iter().all(|v| v.is_finite())) {
            return Err(CalibError::invalid("non-finite sample"));
        }
        if translation_lambda < 0.0 || rotation_lambda < 0.0 {
            return Err(CalibError::invalid("smoothing penalties must be non-negative"));
        }

        let layout = SplineLayout::new(order, times[0], times[times.len() - 1], segments)?;
        let n = layout.num_control_points();

        let mut normal = DMatrix::<Real>::zeros(n, n);
        let mut rhs = DMatrix::<Real>::zeros(n, 6);
        for (t, y) in times.iter().zip(poses) {
            let b = layout.basis(*t)?;
            for a in 0..order {
                let row = b.first + a;
                for c in 0..order {
                    normal[(row, b.first + c)] += b.values[a] * b.values[c];
                }
                for d in 0..6 {
                    rhs[(row, d)] += b.values[a] * y[d];
                }
            }
        }

        let penalty = second_difference_gram(n);
        let translation = solve_penalized(&normal, &penalty, translation_lambda, &rhs.columns(0, 3).into_owned())?;
        let rotation = solve_penalized(&normal, &penalty, rotation_lambda, &rhs.columns(3, 3).into_owned())?;

        let control_points = (0..n)
            .map(|i| {
                join6(
                    &Vec3::new(translation[(i, 0)], translation[(i, 1)], translation[(i, 2)]),
                    &Vec3::new(rotation[(i, 0)], rotation[(i, 1)], rotation[(i, 2)]),
                )
            })
            .collect();
        Self::from_control_points(layout, control_points)
    }

    /// Fits a curve to pose measurements with the knot density of `opts`.
    pub fn fit_measurements(
        measurements: &[PoseMeasurement],
        opts: &SplineOptions,
    ) -> Result<Self, CalibError> {
        let times: Vec<Real> = measurements.iter().map(|m| m.timestamp).collect();
        let mut rotations: Vec<Vec3> = measurements.iter().map(|m| m.rotation).collect();
        unwrap_rotvecs(&mut rotations);
        let poses: Vec<Vec6> = measurements
            .iter()
            .zip(&rotations)
            .map(|(m, r)| join6(&m.translation, r))
            .collect();
        Self::fit_samples(&times, &poses, opts)
    }

    /// Fits a curve to `[p; r]` samples with the knot density of `opts`.
    pub fn fit_samples(times: &[Real], poses: &[Vec6], opts: &SplineOptions) -> Result<Self, CalibError> {
        let duration = match (times.first(), times.last()) {
            (Some(a), Some(b)) => b - a,
            _ => 0.0,
        };
        let segments = opts.segments_for(times.len(), duration);
        Self::fit(
            opts.order,
            times,
            poses,
            segments,
            opts.translation_lambda,
            opts.rotation_lambda,
        )
    }

    pub fn layout(&self) -> &SplineLayout {
        &self.layout
    }

    pub fn time_span(&self) -> (Real, Real) {
        (self.layout.start(), self.layout.end())
    }

    pub fn control_points(&self) -> &[Vec6] {
        &self.control_points
    }

    pub fn control_point(&self, i: usize) -> Option<&Vec6> {
        self.control_points.get(i)
    }

    /// Value and derivatives at `t`; fails outside the fitted span.
    pub fn evaluate(&self, t: Real) -> Result<PoseSample, CalibError> {
        let basis = self.layout.basis(t)?;
        Ok(basis.combine(|i| self.control_points[i]))
    }

    /// Like [`evaluate`](Self::evaluate) but tolerates `margin` seconds of
    /// extrapolation beyond the span.
    pub fn evaluate_extrapolated(&self, t: Real, margin: Real) -> Result<PoseSample, CalibError> {
        let basis = self.layout.basis_extrapolated(t, margin)?;
        Ok(basis.combine(|i| self.control_points[i]))
    }

    pub fn pose(&self, t: Real) -> Result<Vec6, CalibError> {
        Ok(self.evaluate(t)?.value)
    }

    pub fn position(&self, t: Real) -> Result<Vec3, CalibError> {
        Ok(self.evaluate(t)?.position())
    }

    pub fn orientation(&self, t: Real) -> Result<Mat3, CalibError> {
        Ok(self.evaluate(t)?.orientation())
    }

    pub fn linear_velocity_body(&self, t: Real) -> Result<Vec3, CalibError> {
        Ok(self.evaluate(t)?.linear_velocity_body())
    }

    pub fn angular_velocity_body(&self, t: Real) -> Result<Vec3, CalibError> {
        Ok(self.evaluate(t)?.angular_velocity_body())
    }
}

fn second_difference_gram(n: usize) -> DMatrix<Real> {
    let mut gram = DMatrix::zeros(n, n);
    if n < 3 {
        return gram;
    }
    let stencil = [1.0, -2.0, 1.0];
    for row in 0..n - 2 {
        for a in 0..3 {
            for b in 0..3 {
                gram[(row + a, row + b)] += stencil[a] * stencil[b];
            }
        }
    }
    gram
}

fn solve_penalized(
    normal: &DMatrix<Real>,
    penalty: &DMatrix<Real>,
    lambda: Real,
    rhs: &DMatrix<Real>,
) -> Result<DMatrix<Real>, CalibError> {
    let system = normal + penalty * lambda;
    let chol = system.cholesky().ok_or_else(|| {
        CalibError::invalid(
            "curve fit is underdetermined; raise the smoothing penalty or lower the knot density",
        )
    })?;
    Ok(chol.solve(rhs))
}
