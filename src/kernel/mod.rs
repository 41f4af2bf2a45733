//! Hot numeric kernels.
//!
//! The weighted correlation metrics reduce a patch to three sums over its
//! weighted voxels. [`MomentKernel`] computes them; the SIMD variant is
//! selected at compile time with the `simd` feature.

/// Weighted sums over a patch's samples.
///
/// With weights `w`, weighted zero-mean base `wb = w (b - mean_b)` and
/// source values `s`: `sum_ws = Σ w s`, `sum_ws2 = Σ w s²`, `dot = Σ wb s`.
#[derive(Clone, Copy, Debug, Default, PartialEq)]
pub struct Moments {
    pub sum_ws: f64,
    pub sum_ws2: f64,
    pub dot: f64,
}

impl Moments {
    /// Weighted Pearson correlation given the base's weighted sum of squared
    /// deviations and the total weight. Returns 0 for a flat source.
    pub fn correlation(&self, sum_w: f64, var_b: f64) -> f64 {
        if sum_w <= 0.0 || var_b <= 0.0 {
            return 0.0;
        }
        let var_s = self.sum_ws2 - self.sum_ws * self.sum_ws / sum_w;
        if var_s <= 1e-12 * self.sum_ws2.abs().max(1e-30) {
            return 0.0;
        }
        (self.dot / (var_b * var_s).sqrt()).clamp(-1.0, 1.0)
    }
}

/// Kernel computing [`Moments`].
pub trait MomentKernel {
    /// All three slices have the same length.
    fn moments(weights: &[f32], wb: &[f32], src: &[f32]) -> Moments;
}

pub mod scalar;

#[cfg(feature = "simd")]
pub mod simd;

#[cfg(feature = "rayon")]
pub mod rayon;

#[cfg(not(feature = "simd"))]
pub(crate) use scalar::MomentsScalar as ActiveMoments;
#[cfg(feature = "simd")]
pub(crate) use simd::MomentsSimd as ActiveMoments;
