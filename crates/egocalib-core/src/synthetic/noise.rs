//! Deterministic Gaussian noise.
//!
//! Samples are a pure function of `(seed, stream, index)`: a SplitMix64 hash
//! feeds a Box-Muller transform. Datasets stay identical across platforms and
//! across runs, and drawing one sample never shifts another.

use crate::{Real, Vec3};

/// Zero-mean Gaussian noise with standard deviation `sigma`.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct GaussianNoise {
    pub seed: u64,
    pub sigma: Real,
}

impl GaussianNoise {
    pub fn new(seed: u64, sigma: Real) -> Self {
        Self { seed, sigma }
    }

    /// Scalar sample for a `(stream, index)` key.
    pub fn sample(&self, stream: usize, index: usize) -> Real {
        if self.sigma == 0.0 {
            return 0.0;
        }
        let key = mix_key(self.seed, stream, index);
        // (0, 1] keeps the logarithm finite.
        let u1 = 1.0 - u64_to_unit_f64(splitmix64(key));
        let u2 = u64_to_unit_f64(splitmix64(key ^ 0x94D0_49BB_1331_11EB));
        let z = (-2.0 * u1.ln()).sqrt() * (std::f64::consts::TAU * u2).cos();
        self.sigma * z
    }

    /// Three independent samples for a `(stream, index)` key.
    pub fn sample3(&self, stream: usize, index: usize) -> Vec3 {
        Vec3::new(
            self.sample(3 * stream, index),
            self.sample(3 * stream + 1, index),
            self.sample(3 * stream + 2, index),
        )
    }
}

#[inline]
fn mix_key(seed: u64, stream: usize, index: usize) -> u64 {
    seed ^ (stream as u64).wrapping_mul(0x9E37_79B9_7F4A_7C15)
        ^ (index as u64).wrapping_mul(0xBF58_476D_1CE4_E5B9)
}

#[inline]
fn splitmix64(mut x: u64) -> u64 {
    x = x.wrapping_add(0x9E37_79B9_7F4A_7C15);
    let mut z = x;
    z = (z ^ (z >> 30)).wrapping_mul(0xBF58_476D_1CE4_E5B9);
    z = (z ^ (z >> 27)).wrapping_mul(0x94D0_49BB_1331_11EB);
    z ^ (z >> 31)
}

#[inline]
fn u64_to_unit_f64(x: u64) -> Real {
    // Top 53 bits -> [0, 1).
    (x >> 11) as Real * (1.0 / ((1u64 << 53) as Real))
}
