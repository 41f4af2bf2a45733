//! Neo-Hookean elastic penalty on displacement fields.
//!
//! For a deformation gradient `F = I + grad d` with `J = det F` the energy
//! density is `tr(F^T F) J^(-2/3) - 3` (shear) plus `(J - 1)^2 / J` (bulk).
//! Both terms vanish at the identity and grow without bound as the map
//! approaches a fold; folded voxels (`J <= 0`) get a fixed large value.

use crate::util::Mat3;

/// Energy assigned to a voxel whose Jacobian determinant is not positive.
pub const FOLD_ENERGY: f64 = 1.0e4;

/// Penalty settings.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct PenaltyConfig {
    /// Overall factor; `0` disables the penalty.
    pub factor: f64,
    /// Energy below this value is free.
    pub cut: f64,
    /// Scale the factor with the refinement level.
    pub progressive: bool,
}

impl Default for PenaltyConfig {
    fn default() -> Self {
        Self {
            factor: 1.0,
            cut: 1.0,
            progressive: true,
        }
    }
}

impl PenaltyConfig {
    /// Normalizes a user-provided cut value.
    ///
    /// Values in `(0, 1]` are used as is, values in `(1, 10]` are read as
    /// tenths, anything else falls back to `1`.
    pub fn normalized_cut(raw: f64) -> f64 {
        if raw > 0.0 && raw <= 1.0 {
            raw
        } else if raw > 1.0 && raw <= 10.0 {
            0.1 * raw
        } else {
            1.0
        }
    }

    /// Effective factor at `level`.
    pub fn factor_at(&self, level: usize) -> f64 {
        if self.progressive {
            self.factor * level.max(1) as f64
        } else {
            self.factor
        }
    }

    pub fn is_enabled(&self) -> bool {
        self.factor > 0.0
    }
}

/// Energy density of a single deformation gradient.
pub fn energy_density(f: &Mat3) -> f64 {
    let j = f.det();
    if j <= 0.0 || !j.is_finite() {
        return FOLD_ENERGY;
    }
    let shear = f.frobenius_sq() * j.powf(-2.0 / 3.0) - 3.0;
    let bulk = (j - 1.0) * (j - 1.0) / j;
    (shear.max(0.0) + bulk).min(FOLD_ENERGY)
}

/// Deformation gradient of a displacement field stored as three x-fastest
/// component arrays of shape `dims`, at voxel `(i, j, k)`.
///
/// Central differences inside, one-sided at the edges, zero along axes of
/// length one.
pub fn deformation_gradient(comps: [&[f32]; 3], dims: [usize; 3], at: [usize; 3]) -> Mat3 {
    let strides = [1, dims[0], dims[0] * dims[1]];
    let idx = at[0] + dims[0] * (at[1] + dims[1] * at[2]);
    let mut f = Mat3::IDENTITY;
    for axis in 0..3 {
        let n = dims[axis];
        if n < 2 {
            continue;
        }
        let p = at[axis];
        let (lo, hi, span) = if p == 0 {
            (idx, idx + strides[axis], 1.0)
        } else if p == n - 1 {
            (idx - strides[axis], idx, 1.0)
        } else {
            (idx - strides[axis], idx + strides[axis], 2.0)
        };
        for (comp, data) in comps.iter().enumerate() {
            f.0[comp][axis] += (data[hi] - data[lo]) as f64 / span;
        }
    }
    f
}

/// Level-scaled penalty over a set of energy densities.
///
/// Returns `factor(level) * mean(max(0, e - cut)^4)`.
pub fn patch_penalty(cfg: &PenaltyConfig, level: usize, energies: impl Iterator<Item = f64>) -> f64 {
    if !cfg.is_enabled() {
        return 0.0;
    }
    let mut sum = 0.0f64;
    let mut count = 0usize;
    for e in energies {
        let excess = (e - cfg.cut).max(0.0);
        let sq = excess * excess;
        sum += sq * sq;
        count += 1;
    }
    if count == 0 {
        return 0.0;
    }
    cfg.factor_at(level) * sum / count as f64
}

#[cfg(test)]
mod tests {
    use super::{deformation_gradient, energy_density, patch_penalty, PenaltyConfig, FOLD_ENERGY};
    use crate::util::Mat3;

    #[test]
    fn identity_has_zero_energy() {
        assert!(energy_density(&Mat3::IDENTITY).abs() < 1e-12);
    }

    #[test]
    fn rotation_is_free_but_scaling_is_not() {
        let (s, c) = 0.3f64.sin_cos();
        let rot = Mat3([[c, -s, 0.0], [s, c, 0.0], [0.0, 0.0, 1.0]]);
        assert!(energy_density(&rot).abs() < 1e-9);
        let grow = Mat3([[1.2, 0.0, 0.0], [0.0, 1.2, 0.0], [0.0, 0.0, 1.2]]);
        assert!(energy_density(&grow) > 0.0);
        let shear = Mat3([[1.0, 0.4, 0.0], [0.0, 1.0, 0.0], [0.0, 0.0, 1.0]]);
        assert!(energy_density(&shear) > 0.0);
    }

    #[test]
    fn folded_voxels_get_fixed_energy() {
        let flip = Mat3([[-1.0, 0.0, 0.0], [0.0, 1.0, 0.0], [0.0, 0.0, 1.0]]);
        assert_eq!(energy_density(&flip), FOLD_ENERGY);
    }

    #[test]
    fn gradient_of_linear_field() {
        let dims = [5, 4, 3];
        let n = 60;
        let mut dx = vec![0.0f32; n];
        let dy = vec![0.0f32; n];
        let dz = vec![0.0f32; n];
        for k in 0..3 {
            for j in 0..4 {
                for i in 0..5 {
                    dx[i + 5 * (j + 4 * k)] = 0.1 * j as f32;
                }
            }
        }
        for at in [[0, 0, 0], [2, 1, 1], [4, 3, 2]] {
            let f = deformation_gradient([&dx, &dy, &dz], dims, at);
            assert!((f.0[0][1] - 0.1).abs() < 1e-6);
            assert!((f.0[0][0] - 1.0).abs() < 1e-6);
        }
    }

    #[test]
    fn penalty_scales_with_level_and_cut() {
        let cfg = PenaltyConfig::default();
        let e = [0.5, 3.0];
        let p1 = patch_penalty(&cfg, 1, e.iter().copied());
        let p4 = patch_penalty(&cfg, 4, e.iter().copied());
        assert!((p1 - 8.0).abs() < 1e-12);
        assert!((p4 - 32.0).abs() < 1e-12);
        let old = PenaltyConfig {
            progressive: false,
            ..Default::default()
        };
        assert!((patch_penalty(&old, 4, e.iter().copied()) - 8.0).abs() < 1e-12);
        let off = PenaltyConfig {
            factor: 0.0,
            ..Default::default()
        };
        assert_eq!(patch_penalty(&off, 4, e.iter().copied()), 0.0);
    }

    #[test]
    fn cut_normalization() {
        assert_eq!(PenaltyConfig::normalized_cut(0.5), 0.5);
        assert!((PenaltyConfig::normalized_cut(4.0) - 0.4).abs() < 1e-12);
        assert_eq!(PenaltyConfig::normalized_cut(-2.0), 1.0);
        assert_eq!(PenaltyConfig::normalized_cut(50.0), 1.0);
    }
}
