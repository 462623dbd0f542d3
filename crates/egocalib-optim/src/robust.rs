//! Robust re-weighting of residual blocks.
//!
//! Each residual block carries a [`RobustLoss`] fixed when the block is
//! created. The backend turns it into a [`RobustKernel`] for the block's
//! residual dimension and applies iteratively re-weighted least squares:
//! evaluate the whitened residual `r`, compute `w(|r|²)`, and scale both the
//! residual and its Jacobian rows by `sqrt(w)` before the linear solve.

use serde::{Deserialize, Serialize};

/// Smallest weight a kernel returns; keeps every weight in `(0, 1]`.
pub const MIN_WEIGHT: f64 = 1e-12;

/// Robust loss attached to a residual block.
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum RobustLoss {
    #[default]
    None,
    /// Quadratic up to `scale` (in whitened units), linear beyond.
    Huber { scale: f64 },
    /// `scale² · ln(1 + s / scale²)`.
    Cauchy { scale: f64 },
    /// Blake-Zisserman mixture of a Gaussian inlier model and a uniform
    /// outlier floor.
    ///
    /// The weight equals `cut_weight` where the squared whitened residual
    /// reaches the χ² quantile of the residual dimension at
    /// `inlier_probability`.
    BlakeZisserman {
        inlier_probability: f64,
        cut_weight: f64,
    },
}

impl RobustLoss {
    /// Checks the policy parameters.
    pub fn validate(&self) -> Result<(), String> {
        match *self {
            RobustLoss::None => Ok(()),
            RobustLoss::Huber { scale } | RobustLoss::Cauchy { scale } => {
                if scale.is_finite() && scale > 0.0 {
                    Ok(())
                } else {
                    Err(format!("robust scale must be positive, got {scale}"))
                }
            }
            RobustLoss::BlakeZisserman {
                inlier_probability,
                cut_weight,
            } => {
                if !(inlier_probability > 0.0 && inlier_probability < 1.0) {
                    return Err(format!(
                        "inlier probability must be in (0, 1), got {inlier_probability}"
                    ));
                }
                if !(cut_weight > 0.0 && cut_weight < 1.0) {
                    return Err(format!("cut weight must be in (0, 1), got {cut_weight}"));
                }
                Ok(())
            }
        }
    }
}

/// A [`RobustLoss`] specialized to one residual dimension.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum RobustKernel {
    None,
    Huber { delta: f64 },
    Cauchy { c: f64 },
    BlakeZisserman { epsilon: f64 },
}

impl RobustKernel {
    pub fn new(loss: RobustLoss, dim: usize) -> Self {
        match loss {
            RobustLoss::None => RobustKernel::None,
            RobustLoss::Huber { scale } => RobustKernel::Huber { delta: scale },
            RobustLoss::Cauchy { scale } => RobustKernel::Cauchy { c: scale },
            RobustLoss::BlakeZisserman {
                inlier_probability,
                cut_weight,
            } => {
                let k2 = chi_squared_quantile(dim.max(1), inlier_probability);
                RobustKernel::BlakeZisserman {
                    epsilon: (-k2).exp() * (1.0 - cut_weight) / cut_weight,
                }
            }
        }
    }

    /// Robust loss `rho(s)` and IRLS weight `w(s)` for a squared whitened
    /// residual norm `s`.
    pub fn rho_and_weight(self, s: f64) -> (f64, f64) {
        match self {
            RobustKernel::None => (s, 1.0),
            RobustKernel::Huber { delta } => {
                let r = s.sqrt();
                if r <= delta {
                    (s, 1.0)
                } else {
                    (2.0 * delta * r - delta * delta, (delta / r).max(MIN_WEIGHT))
                }
            }
            RobustKernel::Cauchy { c } => {
                let t = s / (c * c);
                (c * c * (1.0 + t).ln(), (1.0 / (1.0 + t)).max(MIN_WEIGHT))
            }
            RobustKernel::BlakeZisserman { epsilon } => {
                let es = (-s).exp();
                let rho = (1.0 + epsilon).ln() - (es + epsilon).ln();
                (rho, (es / (es + epsilon)).max(MIN_WEIGHT))
            }
        }
    }

    pub fn weight(self, s: f64) -> f64 {
        self.rho_and_weight(s).1
    }
}

/// Quantile of the χ² distribution with `dof` degrees of freedom.
///
/// Bisection on the regularized lower incomplete gamma function
/// `P(dof/2, x/2)`.
pub fn chi_squared_quantile(dof: usize, p: f64) -> f64 {
    let a = dof as f64 / 2.0;
    let cdf = |x: f64| regularized_gamma_p(a, x / 2.0);
    let mut lo = 0.0;
    let mut hi = dof as f64 + 10.0 * (2.0 * dof as f64).sqrt() + 10.0;
    while cdf(hi) < p {
        hi *= 2.0;
    }
    for _ in 0..200 {
        let mid = 0.5 * (lo + hi);
        if cdf(mid) < p {
            lo = mid;
        } else {
            hi = mid;
        }
        if hi - lo <= 1e-12 * hi.max(1.0) {
            break;
        }
    }
    0.5 * (lo + hi)
}

/// `ln Γ(a)` for positive integer or half-integer `a`.
fn ln_gamma_half_integer(a: f64) -> f64 {
    let mut x = a;
    let mut acc = 0.0;
    while x > 1.0 {
        x -= 1.0;
        acc += x.ln();
    }
    if (x - 0.5).abs() < 1e-12 {
        acc + 0.5 * std::f64::consts::PI.ln()
    } else {
        acc
    }
}

fn regularized_gamma_p(a: f64, x: f64) -> f64 {
    if x <= 0.0 {
        return 0.0;
    }
    let prefactor = (-x + a * x.ln() - ln_gamma_half_integer(a)).exp();
    if x < a + 1.0 {
        let mut term = 1.0 / a;
        let mut sum = term;
        let mut ap = a;
        for _ in 0..500 {
            ap += 1.0;
            term *= x / ap;
            sum += term;
            if term.abs() < sum.abs() * f64::EPSILON {
                break;
            }
        }
        (prefactor * sum).min(1.0)
    } else {
        // Modified Lentz continued fraction for Q(a, x).
        let tiny = 1e-300;
        let mut b = x + 1.0 - a;
        let mut c = 1.0 / tiny;
        let mut d = 1.0 / b;
        let mut h = d;
        for i in 1..500 {
            let an = -(i as f64) * (i as f64 - a);
            b += 2.0;
            d = an * d + b;
            if d.abs() < tiny {
                d = tiny;
            }
            c = b + an / c;
            if c.abs() < tiny {
                c = tiny;
            }
            d = 1.0 / d;
            let delta = d * c;
            h *= delta;
            if (delta - 1.0).abs() < f64::EPSILON {
                break;
            }
        }
        (1.0 - prefactor * h).max(0.0)
    }
}
