//! Automatic weight volume construction.
//!
//! The weight emphasizes the bright, connected foreground of the base:
//! absolute value, edge fade, top clip, median then Gaussian smoothing,
//! bottom clip, largest connected cluster, one erosion, largest cluster
//! again, normalization to a maximum of one, then an optional power,
//! binarization and dilation.

use std::collections::VecDeque;

use crate::util::math::clip_level;
use crate::util::{QwarpError, QwarpResult};
use crate::volume::filter::{gaussian_blur, median_filter};
use crate::volume::Volume;

/// Automatic weight settings.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct WeightConfig {
    /// Replace positive weights by one.
    pub binary: bool,
    /// Dilation steps applied to a binary weight.
    pub dilation: usize,
    /// Exponent applied after normalization.
    pub power: f64,
    /// Median filter radius in voxels.
    pub median_radius: f64,
    /// Gaussian FWHM in voxels.
    pub blur_fwhm: f64,
}

impl Default for WeightConfig {
    fn default() -> Self {
        Self {
            binary: false,
            dilation: 0,
            power: 1.0,
            median_radius: 2.25,
            blur_fwhm: 4.5,
        }
    }
}

/// Builds a weight volume from `base`.
pub fn auto_weight(base: &Volume, cfg: &WeightConfig) -> QwarpResult<Volume> {
    let (lo, hi) = base.min_max();
    if hi - lo <= f32::EPSILON * hi.abs().max(lo.abs()).max(1.0) {
        return Err(QwarpError::DegenerateVolume {
            reason: "constant image cannot produce a weight",
        });
    }

    let mut wt = base.clone();
    for v in wt.data_mut() {
        *v = v.abs();
    }
    fade_edges(&mut wt);

    let top = 3.0 * clip_level(wt.data(), 0.5);
    if top > 0.0 {
        for v in wt.data_mut() {
            *v = v.min(top);
        }
    }

    let mut wt = median_filter(&wt, cfg.median_radius);
    if cfg.blur_fwhm > 0.0 {
        wt = gaussian_blur(&wt, cfg.blur_fwhm);
    }

    let (_, max) = wt.min_max();
    let bottom = (0.05 * max).max(0.33 * clip_level(wt.data(), 0.33));
    for v in wt.data_mut() {
        if *v < bottom {
            *v = 0.0;
        }
    }

    keep_largest_cluster(&mut wt);
    erode(&mut wt);
    keep_largest_cluster(&mut wt);

    let mut wt = normalize_weight(wt)?;
    if cfg.power > 0.0 && (cfg.power - 1.0).abs() > 1e-12 {
        for v in wt.data_mut() {
            *v = v.powf(cfg.power as f32);
        }
    }
    if cfg.binary {
        for v in wt.data_mut() {
            *v = if *v > 0.0 { 1.0 } else { 0.0 };
        }
        for _ in 0..cfg.dilation {
            dilate(&mut wt);
        }
    }
    Ok(wt)
}

/// Clamps negatives to zero and scales the maximum to one.
pub fn normalize_weight(mut wt: Volume) -> QwarpResult<Volume> {
    let max = wt.data().iter().copied().fold(0.0f32, f32::max);
    if max <= 0.0 || !max.is_finite() {
        return Err(QwarpError::ZeroWeight);
    }
    for v in wt.data_mut() {
        *v = (*v / max).max(0.0);
    }
    Ok(wt)
}

/// Zeroes a slab of `min(0.05 n + 3, (n - 1) / 5)` voxels on each face.
fn fade_edges(vol: &mut Volume) {
    let dims = vol.dims();
    let slab = dims.map(|n| {
        if n < 2 {
            0
        } else {
            ((0.05 * n as f64) as usize + 3).min((n - 1) / 5)
        }
    });
    let grid = *vol.grid();
    let data = vol.data_mut();
    for (idx, v) in data.iter_mut().enumerate() {
        let c = grid.coords(idx);
        if (0..3).any(|a| slab[a] > 0 && (c[a] < slab[a] || c[a] >= dims[a] - slab[a])) {
            *v = 0.0;
        }
    }
}

fn neighbors(dims: [usize; 3], c: [usize; 3]) -> impl Iterator<Item = [usize; 3]> {
    const STEPS: [(usize, isize); 6] = [(0, -1), (0, 1), (1, -1), (1, 1), (2, -1), (2, 1)];
    STEPS.iter().filter_map(move |&(axis, d)| {
        let p = c[axis] as isize + d;
        if p < 0 || p >= dims[axis] as isize {
            return None;
        }
        let mut n = c;
        n[axis] = p as usize;
        Some(n)
    })
}

/// Zeroes every positive voxel outside the largest face-connected cluster.
fn keep_largest_cluster(vol: &mut Volume) {
    let grid = *vol.grid();
    let dims = grid.dims();
    let mut label = vec![0u32; grid.len()];
    let mut sizes = vec![0usize];
    let mut queue = VecDeque::new();
    for seed in 0..grid.len() {
        if vol.data()[seed] <= 0.0 || label[seed] != 0 {
            continue;
        }
        let id = sizes.len() as u32;
        let mut size = 0;
        label[seed] = id;
        queue.push_back(seed);
        while let Some(idx) = queue.pop_front() {
            size += 1;
            for n in neighbors(dims, grid.coords(idx)) {
                let nidx = grid.index(n[0], n[1], n[2]);
                if label[nidx] == 0 && vol.data()[nidx] > 0.0 {
                    label[nidx] = id;
                    queue.push_back(nidx);
                }
            }
        }
        sizes.push(size);
    }
    let Some((best, _)) = sizes.iter().enumerate().skip(1).max_by_key(|&(_, &s)| s) else {
        return;
    };
    for (v, &l) in vol.data_mut().iter_mut().zip(&label) {
        if l as usize != best {
            *v = 0.0;
        }
    }
}

/// Removes positive voxels that touch a zero face neighbor.
fn erode(vol: &mut Volume) {
    let grid = *vol.grid();
    let dims = grid.dims();
    let src = vol.data().to_vec();
    for (idx, v) in vol.data_mut().iter_mut().enumerate() {
        if src[idx] <= 0.0 {
            continue;
        }
        if neighbors(dims, grid.coords(idx)).any(|n| src[grid.index(n[0], n[1], n[2])] <= 0.0) {
            *v = 0.0;
        }
    }
}

/// Sets zero voxels next to a positive one to one.
fn dilate(vol: &mut Volume) {
    let grid = *vol.grid();
    let dims = grid.dims();
    let src = vol.data().to_vec();
    for (idx, v) in vol.data_mut().iter_mut().enumerate() {
        if src[idx] > 0.0 {
            continue;
        }
        if neighbors(dims, grid.coords(idx)).any(|n| src[grid.index(n[0], n[1], n[2])] > 0.0) {
            *v = 1.0;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::{auto_weight, normalize_weight, WeightConfig};
    use crate::util::QwarpError;
    use crate::volume::{Grid, Volume};

    fn blob(grid: Grid) -> Volume {
        let [nx, ny, nz] = grid.dims();
        let c = [nx as f32 / 2.0, ny as f32 / 2.0, nz as f32 / 2.0];
        Volume::from_fn(grid, |i, j, k| {
            let d2 = (i as f32 - c[0]).powi(2) + (j as f32 - c[1]).powi(2) + (k as f32 - c[2]).powi(2);
            if d2 < 36.0 {
                100.0
            } else {
                0.0
            }
        })
    }

    #[test]
    fn constant_image_is_rejected() {
        let grid = Grid::new([10, 10, 10]).unwrap();
        let flat = Volume::from_fn(grid, |_, _, _| 7.0);
        assert!(matches!(
            auto_weight(&flat, &WeightConfig::default()),
            Err(QwarpError::DegenerateVolume { .. })
        ));
    }

    #[test]
    fn weight_covers_the_foreground() {
        let grid = Grid::new([24, 24, 24]).unwrap();
        let wt = auto_weight(&blob(grid), &WeightConfig::default()).unwrap();
        let (lo, hi) = wt.min_max();
        assert_eq!(hi, 1.0);
        assert!(lo >= 0.0);
        assert!(wt.at(12, 12, 12) > 0.5);
        assert_eq!(wt.at(1, 1, 1), 0.0);
    }

    #[test]
    fn binary_weight_is_zero_or_one() {
        let grid = Grid::new([24, 24, 1]).unwrap();
        let cfg = WeightConfig {
            binary: true,
            dilation: 2,
            ..Default::default()
        };
        let wt = auto_weight(&blob(grid), &cfg).unwrap();
        assert!(wt.data().iter().all(|&v| v == 0.0 || v == 1.0));
        assert_eq!(wt.at(12, 12, 0), 1.0);
    }

    #[test]
    fn zero_weight_is_an_error() {
        let grid = Grid::new([4, 4, 4]).unwrap();
        assert_eq!(
            normalize_weight(Volume::zeros(grid)),
            Err(QwarpError::ZeroWeight)
        );
    }
}
