//! One patch problem: optimize a polynomial increment over a box.
//!
//! The increment `h` is composed into the current warp,
//! `D(x) = h(x) + W(x + h(x))`, and the cost is the metric between the base
//! and the source sampled at `x + D(x)` plus the deformation penalty of `D`
//! over the box. In plus-minus mode the base side is warped by
//! `-h(x) + W_minus(x - h(x))` and both composites are penalized.

use crate::basis::{BasisKind, PatchBasis, PatchBox};
use crate::metric::{MetricContext, PatchSamples};
use crate::optim::{minimize, OptimizerConfig};
use crate::penalty::{deformation_gradient, energy_density, patch_penalty, PenaltyConfig};
use crate::resample::{sample_raw, Border, Interp};
use crate::volume::Volume;
use crate::warp::DisplacementField;

/// Patches with fewer weighted voxels than this fraction are skipped.
pub const MIN_WEIGHTED_FRACTION: f64 = 0.05;

/// Inputs shared by every patch of one level.
pub(crate) struct Problem<'a> {
    pub base: &'a Volume,
    pub source: &'a Volume,
    pub weight: &'a Volume,
    pub metric: &'a MetricContext,
    pub penalty: PenaltyConfig,
    pub level: usize,
    pub active_axes: [bool; 3],
    pub interp: Interp,
    pub optimizer: OptimizerConfig,
    /// Budget multiplier.
    pub effort: usize,
}

/// Warp state a patch is composed into.
#[derive(Clone, Copy)]
pub(crate) enum Current<'a> {
    Single(&'a DisplacementField),
    PlusMinus {
        plus: &'a DisplacementField,
        minus: &'a DisplacementField,
    },
}

/// Reusable per-worker buffers.
#[derive(Default)]
pub(crate) struct PatchScratch {
    full: Vec<f64>,
    incr: [Vec<f32>; 3],
    plus: [Vec<f32>; 3],
    minus: [Vec<f32>; 3],
    src: Vec<f32>,
    base: Vec<f32>,
}

impl PatchScratch {
    fn prepare(&mut self, n: usize, samples: usize) {
        for buf in self
            .incr
            .iter_mut()
            .chain(self.plus.iter_mut())
            .chain(self.minus.iter_mut())
        {
            buf.clear();
            buf.resize(n, 0.0);
        }
        self.src.clear();
        self.src.resize(samples, 0.0);
        self.base.clear();
        self.base.resize(samples, 0.0);
    }
}

/// New composite displacements for every voxel of a box.
#[derive(Clone, Debug)]
pub(crate) struct PatchUpdate {
    pub pbox: PatchBox,
    pub plus: [Vec<f32>; 3],
    pub minus: Option<[Vec<f32>; 3]>,
}

impl PatchUpdate {
    /// Writes the box into the running warp(s).
    pub fn apply(&self, plus: &mut DisplacementField, minus: Option<&mut DisplacementField>) {
        write_box(plus, &self.pbox, &self.plus);
        if let (Some(field), Some(values)) = (minus, &self.minus) {
            write_box(field, &self.pbox, values);
        }
    }
}

fn write_box(field: &mut DisplacementField, pbox: &PatchBox, values: &[Vec<f32>; 3]) {
    let grid = *field.grid();
    let [w0, w1, w2] = pbox.width;
    let [s0, s1, s2] = pbox.start;
    for k in 0..w2 {
        for j in 0..w1 {
            for i in 0..w0 {
                let li = pbox.local_index(i, j, k);
                let idx = grid.index(s0 + i, s1 + j, s2 + k);
                field.set(idx, [values[0][li], values[1][li], values[2][li]]);
            }
        }
    }
}

/// Result of one patch.
#[derive(Clone, Debug)]
pub(crate) enum PatchOutcome {
    /// Too few weighted voxels, or a flat base.
    Skipped,
    /// Optimized without beating the current warp.
    Unchanged {
        cost: f64,
        parameters: usize,
        evaluations: usize,
    },
    Improved {
        update: PatchUpdate,
        kind: BasisKind,
        /// Free parameters over every basis tried.
        parameters: usize,
        initial_cost: f64,
        cost: f64,
        evaluations: usize,
    },
}

/// Fills `out` with `sign * h + field(x + sign * h)` over the box.
fn composite(
    field: &DisplacementField,
    pbox: &PatchBox,
    incr: &[Vec<f32>; 3],
    sign: f32,
    out: &mut [Vec<f32>; 3],
) {
    let grid = field.grid();
    let [w0, w1, w2] = pbox.width;
    let [s0, s1, s2] = pbox.start;
    for k in 0..w2 {
        for j in 0..w1 {
            for i in 0..w0 {
                let li = pbox.local_index(i, j, k);
                let h = [sign * incr[0][li], sign * incr[1][li], sign * incr[2][li]];
                let (gi, gj, gk) = (s0 + i, s1 + j, s2 + k);
                let d = if h == [0.0; 3] {
                    field.at(grid.index(gi, gj, gk))
                } else {
                    let w = field.sample([
                        gi as f64 + h[0] as f64,
                        gj as f64 + h[1] as f64,
                        gk as f64 + h[2] as f64,
                    ]);
                    [
                        h[0] + w[0] as f32,
                        h[1] + w[1] as f32,
                        h[2] + w[2] as f32,
                    ]
                };
                for axis in 0..3 {
                    out[axis][li] = d[axis];
                }
            }
        }
    }
}

fn box_penalty(cfg: &PenaltyConfig, level: usize, pbox: &PatchBox, comps: &[Vec<f32>; 3]) -> f64 {
    let dims = pbox.width;
    let comps = [comps[0].as_slice(), comps[1].as_slice(), comps[2].as_slice()];
    let energies = (0..pbox.len()).map(|li| {
        let i = li % dims[0];
        let j = (li / dims[0]) % dims[1];
        let k = li / (dims[0] * dims[1]);
        energy_density(&deformation_gradient(comps, dims, [i, j, k]))
    });
    patch_penalty(cfg, level, energies)
}

/// Cost evaluation for one basis over one box.
struct Objective<'p, 's> {
    problem: &'p Problem<'p>,
    current: Current<'p>,
    pbox: PatchBox,
    basis: PatchBasis,
    samples: PatchSamples,
    scratch: &'s mut PatchScratch,
}

impl Objective<'_, '_> {
    fn set_params(&mut self, x: &[f64]) {
        let s = &mut *self.scratch;
        s.full.clear();
        s.full.resize(self.basis.kind().param_count(), 0.0);
        self.basis.expand(x, &mut s.full);
        let [i0, i1, i2] = &mut s.incr;
        self.basis
            .evaluate(&s.full, [i0.as_mut_slice(), i1.as_mut_slice(), i2.as_mut_slice()]);
        match self.current {
            Current::Single(field) => composite(field, &self.pbox, &s.incr, 1.0, &mut s.plus),
            Current::PlusMinus { plus, minus } => {
                composite(plus, &self.pbox, &s.incr, 1.0, &mut s.plus);
                composite(minus, &self.pbox, &s.incr, -1.0, &mut s.minus);
            }
        }
    }

    fn cost(&mut self, x: &[f64]) -> f64 {
        self.set_params(x);
        let p = self.problem;
        let s = &mut *self.scratch;
        let start = self.pbox.start;
        let sdims = p.source.dims();
        let plus_minus = matches!(self.current, Current::PlusMinus { .. });
        for (n, off) in self.samples.offsets().iter().enumerate() {
            let li = self.pbox.local_index(off[0] as usize, off[1] as usize, off[2] as usize);
            let x0 = [0, 1, 2].map(|a| (start[a] + off[a] as usize) as f64);
            let q = [0, 1, 2].map(|a| x0[a] + s.plus[a][li] as f64);
            s.src[n] = sample_raw(p.source.data(), sdims, q, p.interp, Border::Zero);
            if plus_minus {
                let q = [0, 1, 2].map(|a| x0[a] + s.minus[a][li] as f64);
                s.base[n] = sample_raw(p.base.data(), sdims, q, p.interp, Border::Zero);
            }
        }
        if plus_minus {
            self.samples.rebase(p.metric, &s.base);
        }
        let mut cost = p.metric.cost(&self.samples, &mut s.src);
        if p.penalty.is_enabled() {
            cost += box_penalty(&p.penalty, p.level, &self.pbox, &s.plus);
            if plus_minus {
                cost += box_penalty(&p.penalty, p.level, &self.pbox, &s.minus);
            }
        }
        cost
    }
}

/// Lowest-cost improvement found so far in [`solve_patch`].
struct Best {
    update: PatchUpdate,
    kind: BasisKind,
    initial_cost: f64,
    cost: f64,
}

/// Optimizes the increment over `pbox` for each basis in `kinds` and keeps
/// the lowest cost.
pub(crate) fn solve_patch(
    problem: &Problem<'_>,
    current: Current<'_>,
    pbox: PatchBox,
    kinds: &[BasisKind],
    scratch: &mut PatchScratch,
) -> PatchOutcome {
    let samples = PatchSamples::new(problem.metric, problem.base, problem.weight, &pbox);
    if (samples.len() as f64) < MIN_WEIGHTED_FRACTION * pbox.len() as f64 || samples.base_is_flat()
    {
        return PatchOutcome::Skipped;
    }

    let mut best: Option<Best> = None;
    let mut evaluations = 0;
    let mut start_cost = f64::INFINITY;
    let mut parameters = 0;
    for &kind in kinds {
        let basis = PatchBasis::new(kind, pbox, problem.active_axes);
        let n = basis.active().len();
        if n == 0 || samples.len() < 2 * n {
            continue;
        }
        scratch.prepare(pbox.len(), samples.len());
        let mut obj = Objective {
            problem,
            current,
            pbox,
            basis,
            samples: samples.clone(),
            scratch: &mut *scratch,
        };
        let budget = problem.optimizer.evals_per_param * n * problem.effort.max(1);
        let res = minimize(|x| obj.cost(x), n, &problem.optimizer, budget);
        evaluations += res.evaluations;
        parameters += n;
        start_cost = start_cost.min(res.initial_cost);
        if !res.improved() {
            continue;
        }
        if best.as_ref().is_some_and(|b| b.cost <= res.cost) {
            continue;
        }
        obj.set_params(&res.x);
        let s = &*obj.scratch;
        let update = PatchUpdate {
            pbox,
            plus: s.plus.clone(),
            minus: matches!(current, Current::PlusMinus { .. }).then(|| s.minus.clone()),
        };
        best = Some(Best {
            update,
            kind,
            initial_cost: res.initial_cost,
            cost: res.cost,
        });
    }

    match best {
        Some(Best {
            update,
            kind,
            initial_cost,
            cost,
        }) => PatchOutcome::Improved {
            update,
            kind,
            parameters,
            initial_cost,
            cost,
            evaluations,
        },
        _ if evaluations == 0 => PatchOutcome::Skipped,
        _ => PatchOutcome::Unchanged {
            cost: start_cost,
            parameters,
            evaluations,
        },
    }
}

#[cfg(test)]
mod tests {
    use super::{solve_patch, Current, PatchOutcome, PatchScratch, Problem};
    use crate::basis::{BasisKind, PatchBox};
    use crate::metric::{Metric, MetricContext};
    use crate::optim::OptimizerConfig;
    use crate::penalty::PenaltyConfig;
    use crate::resample::Interp;
    use crate::volume::{Grid, Volume};
    use crate::warp::DisplacementField;

    fn blob(grid: Grid, cx: f32) -> Volume {
        Volume::from_fn(grid, |i, j, _| {
            let d = (i as f32 - cx).powi(2) + (j as f32 - 10.0).powi(2);
            20.0 + 100.0 * (-d / 20.0).exp()
        })
    }

    #[test]
    fn shifted_blob_improves_and_stays_consistent() {
        let grid = Grid::new([21, 21, 1]).unwrap();
        let base = blob(grid, 10.0);
        let source = blob(grid, 10.6);
        let weight = Volume::from_fn(grid, |_, _, _| 1.0);
        let metric = MetricContext::new(Metric::Pearson, &base, &source, &weight);
        let problem = Problem {
            base: &base,
            source: &source,
            weight: &weight,
            metric: &metric,
            penalty: PenaltyConfig::default(),
            level: 0,
            active_axes: [true, true, false],
            interp: Interp::Linear,
            optimizer: OptimizerConfig::default(),
            effort: 1,
        };
        let warp = DisplacementField::identity(grid);
        let pbox = PatchBox {
            start: [0, 0, 0],
            width: [21, 21, 1],
        };
        let mut scratch = PatchScratch::default();
        let out = solve_patch(
            &problem,
            Current::Single(&warp),
            pbox,
            &[BasisKind::Cubic],
            &mut scratch,
        );
        let PatchOutcome::Improved {
            update,
            initial_cost,
            cost,
            parameters,
            ..
        } = out
        else {
            panic!("expected an improvement, got {out:?}");
        };
        assert!(cost < initial_cost);
        // Planar boxes only move the value function in x and y.
        assert_eq!(parameters, 8);
        let center = pbox.local_index(10, 10, 0);
        assert!(update.plus[0][center] > 0.0);
        assert_eq!(update.plus[2][center], 0.0);
        assert!(update.minus.is_none());
    }

    #[test]
    fn both_bases_count_towards_the_totals() {
        let grid = Grid::new([21, 21, 1]).unwrap();
        let base = blob(grid, 10.0);
        let source = blob(grid, 10.6);
        let weight = Volume::from_fn(grid, |_, _, _| 1.0);
        let metric = MetricContext::new(Metric::Pearson, &base, &source, &weight);
        let problem = Problem {
            base: &base,
            source: &source,
            weight: &weight,
            metric: &metric,
            penalty: PenaltyConfig::default(),
            level: 0,
            active_axes: [true, true, false],
            interp: Interp::Linear,
            optimizer: OptimizerConfig::default(),
            effort: 1,
        };
        let warp = DisplacementField::identity(grid);
        let pbox = PatchBox {
            start: [0, 0, 0],
            width: [21, 21, 1],
        };
        let out = solve_patch(
            &problem,
            Current::Single(&warp),
            pbox,
            &[BasisKind::Cubic, BasisKind::Quintic],
            &mut PatchScratch::default(),
        );
        let PatchOutcome::Improved {
            parameters,
            evaluations,
            initial_cost,
            cost,
            ..
        } = out
        else {
            panic!("expected an improvement, got {out:?}");
        };
        assert!(parameters > 8, "{parameters}");
        assert!(evaluations > parameters);
        assert!(cost < initial_cost);
    }

    #[test]
    fn empty_weight_is_skipped() {
        let grid = Grid::new([12, 12, 1]).unwrap();
        let base = blob(grid, 6.0);
        let weight = Volume::zeros(grid);
        let ones = Volume::from_fn(grid, |_, _, _| 1.0);
        let metric = MetricContext::new(Metric::Pearson, &base, &base, &ones);
        let problem = Problem {
            base: &base,
            source: &base,
            weight: &weight,
            metric: &metric,
            penalty: PenaltyConfig::default(),
            level: 0,
            active_axes: [true; 3],
            interp: Interp::Linear,
            optimizer: OptimizerConfig::default(),
            effort: 1,
        };
        let warp = DisplacementField::identity(grid);
        let pbox = PatchBox {
            start: [0, 0, 0],
            width: [12, 12, 1],
        };
        let out = solve_patch(
            &problem,
            Current::Single(&warp),
            pbox,
            &[BasisKind::Cubic],
            &mut PatchScratch::default(),
        );
        assert!(matches!(out, PatchOutcome::Skipped));
    }
}
