//! Local Pearson correlation over small blocks.
//!
//! Each patch is tiled into cubes of edge
//! [`LOCAL_BLOCK`](crate::metric::LOCAL_BLOCK); the weighted
//! Pearson correlation is computed per block and averaged with block weights.
//! Blocks with too few samples or a flat base/source are left out. The
//! minimizing variant suits contrasts that are inversely related.

use crate::metric::{MetricContext, PatchSamples};

/// Blocks with fewer samples than this are ignored.
const MIN_BLOCK_SAMPLES: usize = 5;

#[derive(Clone, Copy, Default)]
struct BlockSums {
    n: usize,
    w: f64,
    wb: f64,
    wbb: f64,
    ws: f64,
    wss: f64,
    wbs: f64,
}

/// Block-weighted mean of local correlations.
pub(crate) fn local_pearson(s: &PatchSamples, src: &[f32]) -> f64 {
    let mut sums = vec![BlockSums::default(); s.block_count];
    for (((&blk, &w), &b), &v) in s.blocks.iter().zip(&s.weights).zip(&s.base).zip(src) {
        let acc = &mut sums[blk as usize];
        let (w, b, v) = (w as f64, b as f64, v as f64);
        acc.n += 1;
        acc.w += w;
        acc.wb += w * b;
        acc.wbb += w * b * b;
        acc.ws += w * v;
        acc.wss += w * v * v;
        acc.wbs += w * b * v;
    }
    let mut num = 0.0f64;
    let mut den = 0.0f64;
    for acc in sums.iter().filter(|a| a.n >= MIN_BLOCK_SAMPLES && a.w > 0.0) {
        let vb = acc.wbb - acc.wb * acc.wb / acc.w;
        let vs = acc.wss - acc.ws * acc.ws / acc.w;
        if vb <= 1e-9 * acc.wbb.max(1e-30) || vs <= 1e-9 * acc.wss.max(1e-30) {
            continue;
        }
        let cov = acc.wbs - acc.wb * acc.ws / acc.w;
        let r = (cov / (vb * vs).sqrt()).clamp(-1.0, 1.0);
        num += acc.w * r;
        den += acc.w;
    }
    if den > 0.0 {
        num / den
    } else {
        0.0
    }
}

/// Cost `lpc`.
pub(crate) fn local_pearson_min_cost(_ctx: &MetricContext, s: &PatchSamples, src: &mut [f32]) -> f64 {
    local_pearson(s, src)
}

/// Cost `-lpc`.
pub(crate) fn local_pearson_max_cost(_ctx: &MetricContext, s: &PatchSamples, src: &mut [f32]) -> f64 {
    -local_pearson(s, src)
}
