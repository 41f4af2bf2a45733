//! Similarity metrics between the base and the warped source.
//!
//! Every metric is a cost to be minimized and is evaluated only over the
//! weighted voxels of one patch. Per-run statistics live in
//! [`MetricContext`]; per-patch precomputation (the analogue of a template
//! plan: weighted zero-mean base values, histogram bin positions, local block
//! ids) lives in [`PatchSamples`]. Dispatch goes through a function table
//! indexed by [`Metric`].

use crate::basis::PatchBox;
use crate::kernel::{ActiveMoments, MomentKernel};
use crate::util::math::quantile_sorted;
use crate::volume::Volume;

pub mod histogram;
pub mod local;

/// Similarity metric.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum Metric {
    /// Pearson correlation of values clipped to robust percentile bounds.
    #[default]
    ClippedPearson = 0,
    /// Plain weighted Pearson correlation.
    Pearson = 1,
    /// Hellinger distance between the joint histogram and its marginals.
    Hellinger = 2,
    /// Mutual information.
    MutualInfo = 3,
    /// Normalized mutual information.
    NormalizedMutualInfo = 4,
    /// Mean local Pearson correlation, minimized.
    LocalPearsonMin = 5,
    /// Mean local Pearson correlation, maximized.
    LocalPearsonMax = 6,
}

/// Cost function signature. `src` holds the warped source at each sample
/// and may be modified in place.
pub type CostFn = fn(&MetricContext, &PatchSamples, &mut [f32]) -> f64;

const COST_TABLE: [CostFn; 7] = [
    clipped_pearson_cost,
    pearson_cost,
    histogram::hellinger_cost,
    histogram::mutual_info_cost,
    histogram::normalized_mutual_info_cost,
    local::local_pearson_min_cost,
    local::local_pearson_max_cost,
];

impl Metric {
    /// All metrics in table order.
    pub const ALL: [Metric; 7] = [
        Metric::ClippedPearson,
        Metric::Pearson,
        Metric::Hellinger,
        Metric::MutualInfo,
        Metric::NormalizedMutualInfo,
        Metric::LocalPearsonMin,
        Metric::LocalPearsonMax,
    ];

    /// Cost function for this metric.
    pub fn cost_fn(self) -> CostFn {
        COST_TABLE[self as usize]
    }

    /// Short name used in logs.
    pub fn name(self) -> &'static str {
        match self {
            Metric::ClippedPearson => "clipped-pearson",
            Metric::Pearson => "pearson",
            Metric::Hellinger => "hellinger",
            Metric::MutualInfo => "mi",
            Metric::NormalizedMutualInfo => "nmi",
            Metric::LocalPearsonMin => "lpc",
            Metric::LocalPearsonMax => "lpa",
        }
    }

    /// Local metrics work on small blocks inside each patch.
    pub fn is_local(self) -> bool {
        matches!(self, Metric::LocalPearsonMin | Metric::LocalPearsonMax)
    }

    pub(crate) fn uses_histogram(self) -> bool {
        matches!(
            self,
            Metric::Hellinger | Metric::MutualInfo | Metric::NormalizedMutualInfo
        )
    }
}

/// Lower and upper robust percentiles for clipping.
const CLIP_LO: f64 = 0.02;
const CLIP_HI: f64 = 0.98;

/// Per-run statistics shared by all patches.
#[derive(Clone, Debug)]
pub struct MetricContext {
    metric: Metric,
    base_clip: (f32, f32),
    source_clip: (f32, f32),
    base_range: (f32, f32),
    source_range: (f32, f32),
}

fn weighted_values(vol: &Volume, weight: &Volume) -> Vec<f32> {
    vol.data()
        .iter()
        .zip(weight.data())
        .filter(|&(_, &w)| w > 0.0)
        .map(|(&v, _)| v)
        .collect()
}

fn clip_bounds(values: &[f32]) -> (f32, f32) {
    let mut pos: Vec<f32> = values.iter().copied().filter(|v| *v > 0.0).collect();
    if pos.is_empty() {
        return (0.0, 0.0);
    }
    pos.sort_by(|a, b| a.total_cmp(b));
    let lo = quantile_sorted(&pos, CLIP_LO);
    let hi = quantile_sorted(&pos, CLIP_HI).max(lo);
    (lo, hi)
}

fn value_range(values: &[f32]) -> (f32, f32) {
    let (lo, hi) = values
        .iter()
        .fold((f32::INFINITY, f32::NEG_INFINITY), |(lo, hi), &v| {
            (lo.min(v), hi.max(v))
        });
    if !lo.is_finite() || !hi.is_finite() {
        return (0.0, 1.0);
    }
    if hi - lo <= f32::EPSILON * hi.abs().max(1.0) {
        (lo, lo + 1.0)
    } else {
        (lo, hi)
    }
}

impl MetricContext {
    /// Gathers per-run statistics over voxels with positive weight.
    pub fn new(metric: Metric, base: &Volume, source: &Volume, weight: &Volume) -> Self {
        let b = weighted_values(base, weight);
        let s = weighted_values(source, weight);
        Self {
            metric,
            base_clip: clip_bounds(&b),
            source_clip: clip_bounds(&s),
            base_range: value_range(&b),
            source_range: value_range(&s),
        }
    }

    pub fn metric(&self) -> Metric {
        self.metric
    }

    /// Cost of the warped source samples `src` for `samples`.
    pub fn cost(&self, samples: &PatchSamples, src: &mut [f32]) -> f64 {
        (self.metric.cost_fn())(self, samples, src)
    }

    pub(crate) fn source_clip(&self) -> (f32, f32) {
        self.source_clip
    }

    pub(crate) fn source_range(&self) -> (f32, f32) {
        self.source_range
    }
}

/// Edge length of the blocks used by local metrics.
pub const LOCAL_BLOCK: usize = 7;

/// Weighted voxels of one patch, with base-side precomputation.
#[derive(Clone, Debug)]
pub struct PatchSamples {
    /// Voxel coordinates relative to the patch start.
    offsets: Vec<[u32; 3]>,
    weights: Vec<f32>,
    base: Vec<f32>,
    wb: Vec<f32>,
    sum_w: f64,
    var_b: f64,
    nbins: usize,
    base_bin: Vec<f32>,
    blocks: Vec<u32>,
    block_count: usize,
}

impl PatchSamples {
    /// Collects the weighted voxels of `pbox`.
    pub fn new(ctx: &MetricContext, base: &Volume, weight: &Volume, pbox: &PatchBox) -> Self {
        let grid = base.grid();
        let [s0, s1, s2] = pbox.start;
        let [w0, w1, w2] = pbox.width;
        let nblk = [w0, w1, w2].map(|w| w.div_ceil(LOCAL_BLOCK));
        let clip = ctx.metric == Metric::ClippedPearson;
        let mut offsets = Vec::new();
        let mut weights = Vec::new();
        let mut values = Vec::new();
        let mut blocks = Vec::new();
        for k in 0..w2 {
            for j in 0..w1 {
                for i in 0..w0 {
                    let idx = grid.index(s0 + i, s1 + j, s2 + k);
                    let w = weight.data()[idx];
                    if w <= 0.0 {
                        continue;
                    }
                    let mut b = base.data()[idx];
                    if clip {
                        b = b.clamp(ctx.base_clip.0, ctx.base_clip.1);
                    }
                    offsets.push([i as u32, j as u32, k as u32]);
                    weights.push(w);
                    values.push(b);
                    let blk = (i / LOCAL_BLOCK)
                        + nblk[0] * ((j / LOCAL_BLOCK) + nblk[1] * (k / LOCAL_BLOCK));
                    blocks.push(blk as u32);
                }
            }
        }

        let mut samples = Self {
            offsets,
            weights,
            base: values,
            wb: Vec::new(),
            sum_w: 0.0,
            var_b: 0.0,
            nbins: 0,
            base_bin: Vec::new(),
            blocks,
            block_count: nblk[0] * nblk[1] * nblk[2],
        };
        samples.refresh_base(ctx);
        samples
    }

    /// Replaces the base values (in sample order), e.g. when the base itself
    /// is warped.
    pub(crate) fn rebase(&mut self, ctx: &MetricContext, values: &[f32]) {
        let clip = ctx.metric == Metric::ClippedPearson;
        self.base.clear();
        self.base.extend(values.iter().map(|&b| {
            if clip {
                b.clamp(ctx.base_clip.0, ctx.base_clip.1)
            } else {
                b
            }
        }));
        self.refresh_base(ctx);
    }

    fn refresh_base(&mut self, ctx: &MetricContext) {
        self.sum_w = self.weights.iter().map(|&w| w as f64).sum();
        let mean = if self.sum_w > 0.0 {
            self.weights
                .iter()
                .zip(&self.base)
                .map(|(&w, &b)| w as f64 * b as f64)
                .sum::<f64>()
                / self.sum_w
        } else {
            0.0
        };
        let mut var_b = 0.0f64;
        self.wb.clear();
        self.wb.extend(self.weights.iter().zip(&self.base).map(|(&w, &b)| {
            let d = b as f64 - mean;
            var_b += w as f64 * d * d;
            (w as f64 * d) as f32
        }));
        self.var_b = var_b;

        self.nbins = histogram::bin_count(self.weights.len());
        self.base_bin.clear();
        if ctx.metric.uses_histogram() {
            let (range, nbins) = (ctx.base_range, self.nbins);
            self.base_bin
                .extend(self.base.iter().map(|&b| histogram::bin_position(b, range, nbins)));
        }
    }

    /// Number of weighted voxels.
    pub fn len(&self) -> usize {
        self.weights.len()
    }

    pub fn is_empty(&self) -> bool {
        self.weights.is_empty()
    }

    /// Voxel offsets relative to the patch start, in sample order.
    pub fn offsets(&self) -> &[[u32; 3]] {
        &self.offsets
    }

    pub fn weights(&self) -> &[f32] {
        &self.weights
    }

    pub fn base(&self) -> &[f32] {
        &self.base
    }

    /// Total weight.
    pub fn sum_w(&self) -> f64 {
        self.sum_w
    }

    /// True when the base is flat over the samples.
    pub fn base_is_flat(&self) -> bool {
        self.var_b <= 1e-12 * self.sum_w.max(1e-30)
    }
}

fn pearson_cost(_ctx: &MetricContext, s: &PatchSamples, src: &mut [f32]) -> f64 {
    let m = ActiveMoments::moments(&s.weights, &s.wb, src);
    -m.correlation(s.sum_w, s.var_b)
}

fn clipped_pearson_cost(ctx: &MetricContext, s: &PatchSamples, src: &mut [f32]) -> f64 {
    let (lo, hi) = ctx.source_clip();
    for v in src.iter_mut() {
        *v = v.clamp(lo, hi);
    }
    pearson_cost(ctx, s, src)
}

#[cfg(test)]
mod tests {
    use super::{Metric, MetricContext, PatchSamples};
    use crate::basis::PatchBox;
    use crate::volume::{Grid, Volume};

    fn setup(metric: Metric) -> (MetricContext, PatchSamples, Vec<f32>) {
        let grid = Grid::new([14, 14, 14]).unwrap();
        let base = Volume::from_fn(grid, |i, j, k| {
            let d = (i as f32 - 6.5).powi(2) + (j as f32 - 7.0).powi(2) + (k as f32 - 6.0).powi(2);
            10.0 + 0.8 * i as f32 + 100.0 * (-d / 12.0).exp()
        });
        let weight = Volume::from_fn(grid, |_, _, _| 1.0);
        let ctx = MetricContext::new(metric, &base, &base, &weight);
        let pbox = PatchBox {
            start: [0, 0, 0],
            width: [14, 14, 14],
        };
        let samples = PatchSamples::new(&ctx, &base, &weight, &pbox);
        let values = samples.base().to_vec();
        (ctx, samples, values)
    }

    #[test]
    fn identical_images_are_optimal() {
        for metric in Metric::ALL {
            let (ctx, samples, values) = setup(metric);
            let mut same = values.clone();
            let best = ctx.cost(&samples, &mut same);
            let mut shuffled: Vec<f32> = values.iter().rev().copied().collect();
            let worse = ctx.cost(&samples, &mut shuffled);
            match metric {
                Metric::LocalPearsonMin => assert!(best > worse, "{metric:?}: {best} vs {worse}"),
                _ => assert!(best < worse, "{metric:?}: {best} vs {worse}"),
            }
        }
    }

    #[test]
    fn pearson_cost_is_minus_one_for_affine_copy() {
        let (ctx, samples, values) = setup(Metric::Pearson);
        let mut scaled: Vec<f32> = values.iter().map(|v| 2.0 * v + 5.0).collect();
        assert!((ctx.cost(&samples, &mut scaled) + 1.0).abs() < 1e-6);
    }

    #[test]
    fn table_order_matches_variants() {
        for (i, metric) in Metric::ALL.iter().enumerate() {
            assert_eq!(*metric as usize, i);
        }
    }
}
