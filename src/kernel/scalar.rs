//! Scalar reference kernels.

use crate::kernel::{MomentKernel, Moments};

/// Scalar weighted-moment kernel.
pub struct MomentsScalar;

impl MomentKernel for MomentsScalar {
    fn moments(weights: &[f32], wb: &[f32], src: &[f32]) -> Moments {
        let mut out = Moments::default();
        for ((&w, &b), &s) in weights.iter().zip(wb).zip(src) {
            let (w, b, s) = (w as f64, b as f64, s as f64);
            let ws = w * s;
            out.sum_ws += ws;
            out.sum_ws2 += ws * s;
            out.dot += b * s;
        }
        out
    }
}
