//! Dense displacement fields.
//!
//! A [`DisplacementField`] stores, for every voxel `x` of its grid, a
//! displacement `d(x)` in voxel index units of that grid. It represents the
//! map `T(x) = x + d(x)` from base coordinates to source coordinates, so the
//! warped source is `S(T(x))`. Off-grid values of a field are read by
//! trilinear interpolation with linear extrapolation beyond the edges.

use crate::penalty::{deformation_gradient, energy_density};
use crate::resample::{sample_raw, Border, Interp};
use crate::trace::{trace_event, trace_warn};
use crate::util::{Mat3, QwarpError, QwarpResult};
use crate::volume::pyramid::half_len;
use crate::volume::{Affine, Grid, Pads, Volume};

pub mod catenate;

/// Result of a fixed-point inversion.
#[derive(Clone, Debug)]
pub struct Inversion {
    /// Best inverse estimate found.
    pub field: DisplacementField,
    /// Whether the update fell below the tolerance.
    pub converged: bool,
    /// Largest remaining `|e(x) + d(x + e(x))|` in voxels.
    pub residual: f64,
    pub iterations: usize,
}

/// Displacement field on a grid, one 3-vector per voxel.
#[derive(Clone, Debug, PartialEq)]
pub struct DisplacementField {
    grid: Grid,
    comps: [Vec<f32>; 3],
}

impl DisplacementField {
    /// Zero displacement on `grid`.
    pub fn identity(grid: Grid) -> Self {
        let n = grid.len();
        Self {
            grid,
            comps: [vec![0.0; n], vec![0.0; n], vec![0.0; n]],
        }
    }

    /// Wraps three component arrays (x-fastest, voxel units).
    pub fn from_components(grid: Grid, comps: [Vec<f32>; 3]) -> QwarpResult<Self> {
        let needed = grid.len();
        for c in &comps {
            if c.len() != needed {
                return Err(QwarpError::BufferTooSmall {
                    needed,
                    got: c.len(),
                });
            }
        }
        Ok(Self { grid, comps })
    }

    /// Field filled from a function of voxel coordinates.
    pub fn from_fn(grid: Grid, mut f: impl FnMut(usize, usize, usize) -> [f32; 3]) -> Self {
        let mut out = Self::identity(grid);
        for idx in 0..grid.len() {
            let [i, j, k] = grid.coords(idx);
            let d = f(i, j, k);
            for (axis, v) in d.into_iter().enumerate() {
                out.comps[axis][idx] = v;
            }
        }
        out
    }

    /// Field realizing a world-space affine map.
    ///
    /// `matrix` maps base world coordinates to source world coordinates; the
    /// resulting displacement is `A^-1 M A i - i` for grid affine `A`.
    pub fn from_affine(grid: Grid, matrix: &Affine) -> QwarpResult<Self> {
        let inv = grid.affine().inverse().ok_or(QwarpError::InvalidConfig(
            "grid affine is not invertible".to_string(),
        ))?;
        let index_map = inv.then_after(&matrix.then_after(grid.affine()));
        Ok(Self::from_fn(grid, |i, j, k| {
            let p = [i as f64, j as f64, k as f64];
            let q = index_map.apply(p);
            [
                (q[0] - p[0]) as f32,
                (q[1] - p[1]) as f32,
                (q[2] - p[2]) as f32,
            ]
        }))
    }

    /// Follows this warp by a world-space affine map: `T'(x) = M(T(x))`.
    ///
    /// `matrix` maps base world coordinates to source world coordinates, as
    /// for [`from_affine`](Self::from_affine). The affine part is applied
    /// exactly instead of being sampled as a field.
    pub fn then_affine(&self, matrix: &Affine) -> QwarpResult<Self> {
        let grid = self.grid;
        let inv = grid.affine().inverse().ok_or(QwarpError::InvalidConfig(
            "grid affine is not invertible".to_string(),
        ))?;
        let index_map = inv.then_after(&matrix.then_after(grid.affine()));
        let mut out = Self::identity(grid);
        for idx in 0..grid.len() {
            let [i, j, k] = grid.coords(idx);
            let p = [i as f64, j as f64, k as f64];
            let d = self.at(idx);
            let q = index_map.apply([p[0] + d[0] as f64, p[1] + d[1] as f64, p[2] + d[2] as f64]);
            out.set(
                idx,
                [
                    (q[0] - p[0]) as f32,
                    (q[1] - p[1]) as f32,
                    (q[2] - p[2]) as f32,
                ],
            );
        }
        Ok(out)
    }

    pub fn grid(&self) -> &Grid {
        &self.grid
    }

    pub fn dims(&self) -> [usize; 3] {
        self.grid.dims()
    }

    /// Component array for `axis` (0 = x).
    pub fn component(&self, axis: usize) -> &[f32] {
        &self.comps[axis]
    }

    pub fn component_mut(&mut self, axis: usize) -> &mut [f32] {
        &mut self.comps[axis]
    }

    /// All three components as slices.
    pub fn components(&self) -> [&[f32]; 3] {
        [&self.comps[0], &self.comps[1], &self.comps[2]]
    }

    pub fn into_components(self) -> [Vec<f32>; 3] {
        self.comps
    }

    /// Displacement stored at linear index `idx`.
    #[inline]
    pub fn at(&self, idx: usize) -> [f32; 3] {
        [self.comps[0][idx], self.comps[1][idx], self.comps[2][idx]]
    }

    #[inline]
    pub(crate) fn set(&mut self, idx: usize, d: [f32; 3]) {
        self.comps[0][idx] = d[0];
        self.comps[1][idx] = d[1];
        self.comps[2][idx] = d[2];
    }

    /// Interpolated displacement at a fractional voxel coordinate.
    #[inline]
    pub fn sample(&self, p: [f64; 3]) -> [f64; 3] {
        let dims = self.dims();
        [0, 1, 2].map(|axis| {
            sample_raw(&self.comps[axis], dims, p, Interp::Linear, Border::Extend) as f64
        })
    }

    /// Mapped position `T(p) = p + d(p)`.
    #[inline]
    pub fn transform(&self, p: [f64; 3]) -> [f64; 3] {
        let d = self.sample(p);
        [p[0] + d[0], p[1] + d[1], p[2] + d[2]]
    }

    /// Largest displacement magnitude in voxels.
    pub fn max_norm(&self) -> f64 {
        (0..self.grid.len())
            .map(|idx| {
                let d = self.at(idx);
                ((d[0] * d[0] + d[1] * d[1] + d[2] * d[2]) as f64).sqrt()
            })
            .fold(0.0, f64::max)
    }

    /// Mean displacement vector over all voxels.
    pub fn mean(&self) -> [f64; 3] {
        let n = self.grid.len() as f64;
        [0, 1, 2].map(|axis| self.comps[axis].iter().map(|&v| v as f64).sum::<f64>() / n)
    }

    /// Multiplies every displacement by `factor`.
    pub fn scaled(&self, factor: f32) -> Self {
        let mut out = self.clone();
        for c in &mut out.comps {
            for v in c.iter_mut() {
                *v *= factor;
            }
        }
        out
    }

    /// Composition `outer ∘ inner`: apply `inner` first, then `outer`.
    ///
    /// `new_d(x) = inner(x) + outer(x + inner(x))`. Both fields must share
    /// the same grid.
    pub fn compose(outer: &DisplacementField, inner: &DisplacementField) -> QwarpResult<Self> {
        check_same(outer, inner)?;
        let grid = inner.grid;
        let mut out = Self::identity(grid);
        for idx in 0..grid.len() {
            let [i, j, k] = grid.coords(idx);
            let h = inner.at(idx);
            let y = [
                i as f64 + h[0] as f64,
                j as f64 + h[1] as f64,
                k as f64 + h[2] as f64,
            ];
            let o = outer.sample(y);
            out.set(
                idx,
                [
                    h[0] + o[0] as f32,
                    h[1] + o[1] as f32,
                    h[2] + o[2] as f32,
                ],
            );
        }
        Ok(out)
    }

    /// Approximate inverse via the fixed point `e = -d(x + e)`.
    ///
    /// Never fails: when the iteration cap is hit first, the best estimate
    /// is returned with `converged == false`.
    pub fn invert(&self, tolerance: f64, max_iter: usize) -> Inversion {
        let grid = self.grid;
        let mut cur = self.scaled(-1.0);
        let mut best = cur.clone();
        let mut best_residual = self.inverse_residual(&cur);
        let mut step = 1.0f32;
        let mut converged = best_residual <= tolerance;
        let mut iterations = 0;
        while !converged && iterations < max_iter {
            iterations += 1;
            let mut next = Self::identity(grid);
            let mut change = 0.0f64;
            for idx in 0..grid.len() {
                let [i, j, k] = grid.coords(idx);
                let e = cur.at(idx);
                let y = [
                    i as f64 + e[0] as f64,
                    j as f64 + e[1] as f64,
                    k as f64 + e[2] as f64,
                ];
                let d = self.sample(y);
                let mut upd = [0.0f32; 3];
                for axis in 0..3 {
                    let target = -d[axis] as f32;
                    upd[axis] = e[axis] + step * (target - e[axis]);
                    change = change.max((upd[axis] - e[axis]).abs() as f64);
                }
                next.set(idx, upd);
            }
            let residual = self.inverse_residual(&next);
            if residual < best_residual {
                best_residual = residual;
                best = next.clone();
            } else {
                // Oscillation; damp the update.
                step = (step * 0.5).max(0.05);
            }
            cur = next;
            converged = best_residual <= tolerance || change <= 0.1 * tolerance;
        }
        if !converged {
            trace_warn!(
                residual = best_residual,
                iterations,
                "warp inversion did not converge"
            );
        }
        trace_event!("invert", residual = best_residual, iterations = iterations);
        Inversion {
            field: best,
            converged,
            residual: best_residual,
            iterations,
        }
    }

    /// Largest `|e(x) + d(x + e(x))|` over the grid.
    fn inverse_residual(&self, inv: &DisplacementField) -> f64 {
        let grid = self.grid;
        let mut worst = 0.0f64;
        for idx in 0..grid.len() {
            let [i, j, k] = grid.coords(idx);
            let e = inv.at(idx);
            let y = [
                i as f64 + e[0] as f64,
                j as f64 + e[1] as f64,
                k as f64 + e[2] as f64,
            ];
            let d = self.sample(y);
            for axis in 0..3 {
                worst = worst.max((e[axis] as f64 + d[axis]).abs());
            }
        }
        worst
    }

    /// Grows or crops each face.
    ///
    /// New voxels take linearly extrapolated edge displacements; the grid
    /// origin moves so that kept voxels keep their world position.
    pub fn extend(&self, pads: Pads) -> QwarpResult<Self> {
        let grid = self.grid.padded(pads)?;
        let shift = [pads[0] as f64, pads[2] as f64, pads[4] as f64];
        let mut out = Self::identity(grid);
        for idx in 0..grid.len() {
            let [i, j, k] = grid.coords(idx);
            let p = [i as f64 - shift[0], j as f64 - shift[1], k as f64 - shift[2]];
            let d = self.sample(p);
            out.set(idx, [d[0] as f32, d[1] as f32, d[2] as f32]);
        }
        Ok(out)
    }

    /// Deformation gradient `I + grad d` at voxel `(i, j, k)`.
    pub fn jacobian(&self, i: usize, j: usize, k: usize) -> Mat3 {
        deformation_gradient(self.components(), self.dims(), [i, j, k])
    }

    /// Sum of Neo-Hookean energy densities over the whole field.
    pub fn energy(&self) -> f64 {
        let grid = self.grid;
        (0..grid.len())
            .map(|idx| {
                let c = grid.coords(idx);
                energy_density(&self.jacobian(c[0], c[1], c[2]))
            })
            .sum()
    }

    /// Warps `vol` (defined on this field's grid): `out(x) = vol(x + d(x))`.
    pub fn apply(&self, vol: &Volume, interp: Interp, border: Border) -> QwarpResult<Volume> {
        vol.check_same_grid(&self.grid, "warped volume")?;
        let grid = self.grid;
        let dims = vol.dims();
        let mut out = Volume::zeros(grid);
        let data = out.data_mut();
        for (idx, value) in data.iter_mut().enumerate() {
            let [i, j, k] = grid.coords(idx);
            let d = self.at(idx);
            let p = [
                i as f64 + d[0] as f64,
                j as f64 + d[1] as f64,
                k as f64 + d[2] as f64,
            ];
            *value = sample_raw(vol.data(), dims, p, interp, border);
        }
        Ok(out)
    }

    /// Upsamples a field computed on the factor-two downsampled version of
    /// `fine`.
    ///
    /// Along each reduced axis, `d_fine(x) = 2 d_coarse((x - 0.5) / 2)`.
    pub fn upsample2(&self, fine: Grid) -> QwarpResult<Self> {
        let fdims = fine.dims();
        let cdims = self.dims();
        let expected = fdims.map(half_len);
        if expected != cdims {
            return Err(QwarpError::GridMismatch {
                what: "coarse warp",
                expected,
                got: cdims,
            });
        }
        let reduced = fdims.map(|n| n >= 2);
        let mut out = Self::identity(fine);
        for idx in 0..fine.len() {
            let c = fine.coords(idx);
            let mut p = [0.0f64; 3];
            for axis in 0..3 {
                p[axis] = if reduced[axis] {
                    (c[axis] as f64 - 0.5) / 2.0
                } else {
                    c[axis] as f64
                };
            }
            let d = self.sample(p);
            let mut v = [0.0f32; 3];
            for axis in 0..3 {
                let s = if reduced[axis] { 2.0 } else { 1.0 };
                v[axis] = (s * d[axis]) as f32;
            }
            out.set(idx, v);
        }
        Ok(out)
    }

    /// Displacements converted to world units (`L d` for the grid's linear
    /// part `L`).
    pub fn world_displacements(&self) -> [Vec<f32>; 3] {
        let lin = self.grid.affine().linear();
        let n = self.grid.len();
        let mut out = [vec![0.0f32; n], vec![0.0f32; n], vec![0.0f32; n]];
        for idx in 0..n {
            let d = self.at(idx);
            let w = lin.apply([d[0] as f64, d[1] as f64, d[2] as f64]);
            for axis in 0..3 {
                out[axis][idx] = w[axis] as f32;
            }
        }
        out
    }
}

fn check_same(a: &DisplacementField, b: &DisplacementField) -> QwarpResult<()> {
    if a.dims() != b.dims() {
        return Err(QwarpError::GridMismatch {
            what: "composed warp",
            expected: a.dims(),
            got: b.dims(),
        });
    }
    Ok(())
}
