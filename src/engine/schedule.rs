//! Patch schedule: widths per level, the patch lattice and conflict-free
//! waves.
//!
//! Level 0 is one patch covering the grid. Level `k` shrinks every axis to
//! the odd width `floor((n + 1) * 0.75^k)`, never below the minimum patch.
//! Axes shorter than [`PATCH_FLOOR`] are never subdivided. Patches overlap by
//! about half their width; the visiting order flips on odd levels.

use crate::basis::PatchBox;
use crate::engine::config::PATCH_FLOOR;
use crate::util::math::make_odd_down;

/// Width shrink factor per level.
pub const SHRINK: f64 = 0.75;

/// Patch edges at `level`.
pub fn level_widths(dims: [usize; 3], level: usize, min_patch: usize) -> [usize; 3] {
    let factor = SHRINK.powi(level as i32);
    dims.map(|n| {
        if n < PATCH_FLOOR {
            return n;
        }
        let w = make_odd_down(((n + 1) as f64 * factor).floor() as usize);
        w.max(min_patch).min(n)
    })
}

/// First level at which every axis has reached its smallest width.
pub fn last_level(dims: [usize; 3], min_patch: usize) -> usize {
    let floor = dims.map(|n| if n < PATCH_FLOOR { n } else { min_patch.min(n) });
    let mut level = 0;
    while level_widths(dims, level, min_patch)
        .iter()
        .zip(&floor)
        .any(|(w, f)| w > f)
    {
        level += 1;
    }
    level
}

/// Patch starts along one axis of length `n` for patches of width `w`.
fn axis_starts(n: usize, w: usize) -> Vec<usize> {
    if w >= n {
        return vec![0];
    }
    let span = n - w;
    let step = (w + 1) / 2;
    let m = span.div_ceil(step) + 1;
    (0..m)
        .map(|i| ((i * span) as f64 / (m - 1) as f64).round() as usize)
        .collect()
}

/// Overlapping patches covering the grid, x fastest. `reverse` flips the
/// visiting order.
pub fn lattice(dims: [usize; 3], widths: [usize; 3], reverse: bool) -> Vec<PatchBox> {
    let starts = [0, 1, 2].map(|a| axis_starts(dims[a], widths[a]));
    let mut boxes = Vec::with_capacity(starts.iter().map(Vec::len).product());
    for &z in &starts[2] {
        for &y in &starts[1] {
            for &x in &starts[0] {
                boxes.push(PatchBox {
                    start: [x, y, z],
                    width: widths,
                });
            }
        }
    }
    if reverse {
        boxes.reverse();
    }
    boxes
}

/// Groups patch indices into waves of mutually disjoint boxes.
///
/// Greedy first-fit in visiting order; every index appears exactly once and
/// each wave keeps the visiting order.
pub fn waves(boxes: &[PatchBox]) -> Vec<Vec<usize>> {
    let mut out: Vec<Vec<usize>> = Vec::new();
    for (idx, pbox) in boxes.iter().enumerate() {
        let slot = out
            .iter()
            .position(|wave| wave.iter().all(|&other| !boxes[other].overlaps(pbox)));
        match slot {
            Some(w) => out[w].push(idx),
            None => out.push(vec![idx]),
        }
    }
    out
}

/// Everything needed to run one level.
#[derive(Clone, Debug)]
pub struct LevelPlan {
    pub level: usize,
    pub widths: [usize; 3],
    pub boxes: Vec<PatchBox>,
    pub waves: Vec<Vec<usize>>,
}

impl LevelPlan {
    pub fn new(dims: [usize; 3], level: usize, min_patch: usize, reverse: bool) -> Self {
        let widths = level_widths(dims, level, min_patch);
        let boxes = lattice(dims, widths, reverse);
        let waves = waves(&boxes);
        Self {
            level,
            widths,
            boxes,
            waves,
        }
    }
}

/// Levels `first..=min(last_level, max_level)`. Empty when `first` is past
/// the last level.
pub fn plan_levels(
    dims: [usize; 3],
    min_patch: usize,
    first: usize,
    max_level: usize,
) -> Vec<LevelPlan> {
    let last = last_level(dims, min_patch).min(max_level);
    (first..=last)
        .map(|level| LevelPlan::new(dims, level, min_patch, level % 2 == 1))
        .collect()
}
