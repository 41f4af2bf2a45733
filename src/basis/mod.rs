//! Hermite polynomial bases for incremental patch warps.
//!
//! A patch is a sub-box of the grid. Along each axis, voxel `s + i` of a box
//! of width `w` maps to `t = -1 + 2i / (w - 1)` (`t = 0` when `w == 1`). The
//! one-dimensional shape functions vanish together with their first
//! derivative at `t = ±1` (and, for the quintic family, their second
//! derivative), so an increment is zero and flat on the box faces.
//!
//! Each displacement component is a tensor-product sum
//! `scale * pmax * sum p[a,b,c] f_a(tx) f_b(ty) f_c(tz)` with `p` in `[-1, 1]`,
//! where `scale` is the smallest active half-width. This bounds the gradient
//! of an increment well below one, keeping it invertible.

/// Basis family.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum BasisKind {
    /// Two functions per axis: 24 parameters.
    Cubic,
    /// Three functions per axis: 81 parameters.
    Quintic,
}

impl BasisKind {
    /// Shape functions per axis.
    pub fn funcs_per_axis(&self) -> usize {
        match self {
            BasisKind::Cubic => 2,
            BasisKind::Quintic => 3,
        }
    }

    /// Total parameters per patch (all three components).
    pub fn param_count(&self) -> usize {
        let k = self.funcs_per_axis();
        3 * k * k * k
    }

    /// Coefficient bound applied to parameters in `[-1, 1]`.
    pub fn pmax(&self) -> f64 {
        match self {
            BasisKind::Cubic => 0.0333,
            BasisKind::Quintic => 0.0222,
        }
    }

    /// Value of shape function `f` at `t` in `[-1, 1]`.
    pub fn shape(&self, f: usize, t: f64) -> f64 {
        let a = t.abs();
        if a >= 1.0 {
            return 0.0;
        }
        let m = 1.0 - a;
        match (self, f) {
            (BasisKind::Cubic, 0) => m * m * (1.0 + 2.0 * a),
            (BasisKind::Cubic, 1) => t * m * m,
            (BasisKind::Quintic, 0) => m * m * m * (1.0 + 3.0 * a + 6.0 * a * a),
            (BasisKind::Quintic, 1) => t * m * m * m * (1.0 + 3.0 * a),
            (BasisKind::Quintic, 2) => 0.5 * t * t * m * m * m,
            _ => 0.0,
        }
    }
}

/// Integer sub-box of a grid.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct PatchBox {
    pub start: [usize; 3],
    pub width: [usize; 3],
}

impl PatchBox {
    pub fn len(&self) -> usize {
        self.width[0] * self.width[1] * self.width[2]
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Linear index inside the box.
    #[inline]
    pub fn local_index(&self, i: usize, j: usize, k: usize) -> usize {
        i + self.width[0] * (j + self.width[1] * k)
    }

    /// True when the two boxes share at least one voxel.
    pub fn overlaps(&self, other: &PatchBox) -> bool {
        (0..3).all(|axis| {
            let a0 = self.start[axis];
            let a1 = a0 + self.width[axis];
            let b0 = other.start[axis];
            let b1 = b0 + other.width[axis];
            a0 < b1 && b0 < a1
        })
    }
}

/// Basis tables for one patch box.
#[derive(Clone, Debug)]
pub struct PatchBasis {
    kind: BasisKind,
    pbox: PatchBox,
    scale: f64,
    /// `tables[axis][pos * k + f]`.
    tables: [Vec<f64>; 3],
    active: Vec<usize>,
}

impl PatchBasis {
    /// Builds tables for `pbox`. `active_axes[c]` enables displacement
    /// component `c`.
    pub fn new(kind: BasisKind, pbox: PatchBox, active_axes: [bool; 3]) -> Self {
        let k = kind.funcs_per_axis();
        let tables = [0, 1, 2].map(|axis| {
            let w = pbox.width[axis];
            let mut tab = vec![0.0f64; w * k];
            for pos in 0..w {
                let t = if w == 1 {
                    0.0
                } else {
                    -1.0 + 2.0 * pos as f64 / (w - 1) as f64
                };
                for f in 0..k {
                    tab[pos * k + f] = kind.shape(f, t);
                }
            }
            tab
        });
        let scale = (0..3)
            .filter(|&axis| pbox.width[axis] > 1)
            .map(|axis| 0.5 * (pbox.width[axis] - 1) as f64)
            .fold(f64::INFINITY, f64::min);
        let scale = if scale.is_finite() { scale } else { 0.0 };

        // Functions other than the value function are identically zero on
        // an axis of width one.
        let mut active = Vec::new();
        for comp in 0..3 {
            if !active_axes[comp] {
                continue;
            }
            for c in 0..k {
                for b in 0..k {
                    for a in 0..k {
                        let flat = [a, b, c];
                        if (0..3).any(|axis| pbox.width[axis] == 1 && flat[axis] > 0) {
                            continue;
                        }
                        active.push(param_index(k, comp, a, b, c));
                    }
                }
            }
        }
        Self {
            kind,
            pbox,
            scale,
            tables,
            active,
        }
    }

    pub fn kind(&self) -> BasisKind {
        self.kind
    }

    pub fn patch_box(&self) -> &PatchBox {
        &self.pbox
    }

    /// Indices of the full parameter vector that the optimizer may move.
    pub fn active(&self) -> &[usize] {
        &self.active
    }

    /// Expands an active-parameter vector into the full coefficient vector.
    pub fn expand(&self, x: &[f64], full: &mut [f64]) {
        full.fill(0.0);
        for (&slot, &v) in self.active.iter().zip(x) {
            full[slot] = v;
        }
    }

    /// Evaluates the increment over the whole box into three component
    /// buffers of length `pbox.len()` (voxel units).
    pub fn evaluate(&self, full: &[f64], out: [&mut [f32]; 3]) {
        let k = self.kind.funcs_per_axis();
        let [wx, wy, wz] = self.pbox.width;
        let amp = self.scale * self.kind.pmax();
        let mut t1 = vec![0.0f64; k * k];
        let mut t2 = vec![0.0f64; k];
        for (comp, dst) in out.into_iter().enumerate() {
            let coeffs = &full[comp * k * k * k..(comp + 1) * k * k * k];
            if coeffs.iter().all(|&c| c == 0.0) {
                dst.fill(0.0);
                continue;
            }
            for z in 0..wz {
                let fz = &self.tables[2][z * k..(z + 1) * k];
                for b in 0..k {
                    for a in 0..k {
                        t1[b * k + a] = (0..k)
                            .map(|c| coeffs[(c * k + b) * k + a] * fz[c])
                            .sum();
                    }
                }
                for y in 0..wy {
                    let fy = &self.tables[1][y * k..(y + 1) * k];
                    for (a, slot) in t2.iter_mut().enumerate() {
                        *slot = (0..k).map(|b| t1[b * k + a] * fy[b]).sum();
                    }
                    let row = wx * (y + wy * z);
                    for x in 0..wx {
                        let fx = &self.tables[0][x * k..(x + 1) * k];
                        let v: f64 = (0..k).map(|a| t2[a] * fx[a]).sum();
                        dst[row + x] = (amp * v) as f32;
                    }
                }
            }
        }
    }
}

/// Flat index of coefficient `(comp, a, b, c)`, x function fastest.
#[inline]
pub fn param_index(k: usize, comp: usize, a: usize, b: usize, c: usize) -> usize {
    ((comp * k + c) * k + b) * k + a
}

#[cfg(test)]
mod tests {
    use super::{param_index, BasisKind, PatchBasis, PatchBox};

    #[test]
    fn parameter_counts() {
        assert_eq!(BasisKind::Cubic.param_count(), 24);
        assert_eq!(BasisKind::Quintic.param_count(), 81);
    }

    #[test]
    fn shapes_vanish_flat_at_the_edges() {
        for kind in [BasisKind::Cubic, BasisKind::Quintic] {
            for f in 0..kind.funcs_per_axis() {
                let h = 1e-4;
                let edge = kind.shape(f, 1.0 - h);
                assert!(edge.abs() < 1e-6, "{kind:?} f{f} value {edge}");
                let slope = (kind.shape(f, 1.0 - h) - kind.shape(f, 1.0 - 2.0 * h)) / h;
                assert!(slope.abs() < 1e-2, "{kind:?} f{f} slope {slope}");
            }
            assert_eq!(kind.shape(0, 0.0), 1.0);
        }
    }

    #[test]
    fn increment_is_zero_on_box_faces() {
        let pbox = PatchBox {
            start: [0, 0, 0],
            width: [9, 9, 9],
        };
        let basis = PatchBasis::new(BasisKind::Cubic, pbox, [true; 3]);
        assert_eq!(basis.active().len(), 24);
        let full: Vec<f64> = (0..24).map(|i| if i % 2 == 0 { 1.0 } else { -0.5 }).collect();
        let n = pbox.len();
        let (mut dx, mut dy, mut dz) = (vec![0.0; n], vec![0.0; n], vec![0.0; n]);
        basis.evaluate(&full, [&mut dx, &mut dy, &mut dz]);
        for j in 0..9 {
            for k in 0..9 {
                assert_eq!(dx[pbox.local_index(0, j, k)], 0.0);
                assert_eq!(dy[pbox.local_index(8, j, k)], 0.0);
            }
        }
        // Value function product peaks at the center with amplitude 4 * pmax.
        let center = dx[pbox.local_index(4, 4, 4)];
        assert!((center - (4.0 * 0.0333) as f32).abs() < 1e-6);
    }

    #[test]
    fn planar_boxes_drop_z_terms() {
        let pbox = PatchBox {
            start: [0, 0, 0],
            width: [9, 9, 1],
        };
        let basis = PatchBasis::new(BasisKind::Quintic, pbox, [true, true, false]);
        // 2 components * 3 * 3 functions.
        assert_eq!(basis.active().len(), 18);
        assert!(basis.active().contains(&param_index(3, 1, 2, 2, 0)));
    }

    #[test]
    fn overlap_test() {
        let a = PatchBox {
            start: [0, 0, 0],
            width: [5, 5, 5],
        };
        let b = PatchBox {
            start: [5, 0, 0],
            width: [5, 5, 5],
        };
        let c = PatchBox {
            start: [4, 4, 4],
            width: [5, 5, 5],
        };
        assert!(!a.overlaps(&b));
        assert!(a.overlaps(&c));
    }
}
