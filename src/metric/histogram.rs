//! Joint-histogram metrics: mutual information, normalized mutual
//! information and Hellinger distance.
//!
//! Each sample votes into the four bins around its fractional
//! `(base, source)` bin position with bilinear weights, scaled by the voxel
//! weight.

use crate::metric::{MetricContext, PatchSamples};

const MIN_BINS: usize = 8;
const MAX_BINS: usize = 64;

/// Bins per axis for `n` samples: cube root, clamped to `8..=64`.
pub fn bin_count(n: usize) -> usize {
    ((n as f64).cbrt().round() as usize).clamp(MIN_BINS, MAX_BINS)
}

/// Fractional bin position of `v` within `range`, clamped to the bins.
#[inline]
pub fn bin_position(v: f32, range: (f32, f32), nbins: usize) -> f32 {
    let span = (range.1 - range.0).max(f32::MIN_POSITIVE);
    let top = (nbins - 1) as f32;
    ((v - range.0) / span * top).clamp(0.0, top)
}

/// Normalized joint histogram, row-major `[base_bin * nbins + source_bin]`.
struct Joint {
    nbins: usize,
    pxy: Vec<f64>,
    px: Vec<f64>,
    py: Vec<f64>,
}

fn joint(ctx: &MetricContext, s: &PatchSamples, src: &[f32]) -> Option<Joint> {
    let nbins = s.nbins;
    let top = nbins - 1;
    let mut pxy = vec![0.0f64; nbins * nbins];
    let range = ctx.source_range();
    for ((&w, &bx), &v) in s.weights.iter().zip(&s.base_bin).zip(src) {
        let by = bin_position(v, range, nbins);
        let (x0, y0) = (bx.floor() as usize, by.floor() as usize);
        let (x1, y1) = ((x0 + 1).min(top), (y0 + 1).min(top));
        let (fx, fy) = ((bx - x0 as f32) as f64, (by - y0 as f32) as f64);
        let w = w as f64;
        pxy[x0 * nbins + y0] += w * (1.0 - fx) * (1.0 - fy);
        pxy[x1 * nbins + y0] += w * fx * (1.0 - fy);
        pxy[x0 * nbins + y1] += w * (1.0 - fx) * fy;
        pxy[x1 * nbins + y1] += w * fx * fy;
    }
    let total: f64 = pxy.iter().sum();
    if total <= 0.0 {
        return None;
    }
    let mut px = vec![0.0f64; nbins];
    let mut py = vec![0.0f64; nbins];
    for x in 0..nbins {
        for y in 0..nbins {
            let p = pxy[x * nbins + y] / total;
            pxy[x * nbins + y] = p;
            px[x] += p;
            py[y] += p;
        }
    }
    Some(Joint { nbins, pxy, px, py })
}

fn entropy(p: &[f64]) -> f64 {
    p.iter().filter(|&&v| v > 0.0).map(|&v| -v * v.ln()).sum()
}

impl Joint {
    fn mutual_info(&self) -> f64 {
        let mut mi = 0.0;
        for x in 0..self.nbins {
            for y in 0..self.nbins {
                let p = self.pxy[x * self.nbins + y];
                let q = self.px[x] * self.py[y];
                if p > 0.0 && q > 0.0 {
                    mi += p * (p / q).ln();
                }
            }
        }
        mi
    }

    /// Squared Hellinger distance between `p(x,y)` and `p(x) p(y)`.
    fn hellinger(&self) -> f64 {
        let mut affinity = 0.0;
        for x in 0..self.nbins {
            for y in 0..self.nbins {
                affinity += (self.pxy[x * self.nbins + y] * self.px[x] * self.py[y]).sqrt();
            }
        }
        (1.0 - affinity).max(0.0)
    }
}

/// Cost `-MI`.
pub(crate) fn mutual_info_cost(ctx: &MetricContext, s: &PatchSamples, src: &mut [f32]) -> f64 {
    joint(ctx, s, src).map_or(0.0, |j| -j.mutual_info())
}

/// Cost `H(x,y) / (H(x) + H(y))`, in `[0.5, 1]`.
pub(crate) fn normalized_mutual_info_cost(
    ctx: &MetricContext,
    s: &PatchSamples,
    src: &mut [f32],
) -> f64 {
    let Some(j) = joint(ctx, s, src) else {
        return 1.0;
    };
    let marginal = entropy(&j.px) + entropy(&j.py);
    if marginal <= 0.0 {
        return 1.0;
    }
    entropy(&j.pxy) / marginal
}

/// Cost `-H²` (larger statistical dependence is better).
pub(crate) fn hellinger_cost(ctx: &MetricContext, s: &PatchSamples, src: &mut [f32]) -> f64 {
    joint(ctx, s, src).map_or(0.0, |j| -j.hellinger())
}
