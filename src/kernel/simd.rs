//! SIMD-accelerated kernels using the `wide` crate.
//!
//! The sample loop is vectorized 8 lanes at a time with `f32x8`; partial
//! sums are flushed to `f64` every block to limit rounding drift.

use crate::kernel::{MomentKernel, Moments};
use wide::f32x8;

const LANES: usize = 8;
/// Lane blocks accumulated in `f32` before flushing to `f64`.
const FLUSH_BLOCKS: usize = 64;

/// Load 8 f32 values into f32x8.
#[inline]
fn load_f32x8(slice: &[f32]) -> f32x8 {
    f32x8::from([
        slice[0], slice[1], slice[2], slice[3], slice[4], slice[5], slice[6], slice[7],
    ])
}

/// Horizontal sum of f32x8.
#[inline]
fn hsum(v: f32x8) -> f64 {
    v.to_array().iter().map(|&x| x as f64).sum()
}

/// SIMD weighted-moment kernel.
pub struct MomentsSimd;

impl MomentKernel for MomentsSimd {
    fn moments(weights: &[f32], wb: &[f32], src: &[f32]) -> Moments {
        let n = weights.len().min(wb.len()).min(src.len());
        let simd_end = n / LANES * LANES;
        let mut out = Moments::default();

        let mut i = 0;
        while i < simd_end {
            let block_end = (i + FLUSH_BLOCKS * LANES).min(simd_end);
            let mut ws_vec = f32x8::ZERO;
            let mut ws2_vec = f32x8::ZERO;
            let mut dot_vec = f32x8::ZERO;
            while i < block_end {
                let w = load_f32x8(&weights[i..]);
                let b = load_f32x8(&wb[i..]);
                let s = load_f32x8(&src[i..]);
                let ws = w * s;
                ws_vec += ws;
                ws2_vec += ws * s;
                dot_vec += b * s;
                i += LANES;
            }
            out.sum_ws += hsum(ws_vec);
            out.sum_ws2 += hsum(ws2_vec);
            out.dot += hsum(dot_vec);
        }

        // Scalar remainder
        for idx in simd_end..n {
            let (w, b, s) = (weights[idx] as f64, wb[idx] as f64, src[idx] as f64);
            out.sum_ws += w * s;
            out.sum_ws2 += w * s * s;
            out.dot += b * s;
        }
        out
    }
}
