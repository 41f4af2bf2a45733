//! Black-box smoothing transforms applied before optimization.

use crate::volume::Volume;

/// FWHM to standard deviation conversion factor.
const FWHM_TO_SIGMA: f64 = 0.424_660_900_144_009_5;

/// Pre-blur request decoded from a signed amount.
#[derive(Clone, Copy, Debug, PartialEq)]
pub enum Smoothing {
    /// No smoothing.
    None,
    /// Gaussian blur with the given FWHM in voxels.
    Gaussian(f64),
    /// Median filter with the given radius in voxels.
    Median(f64),
}

impl Smoothing {
    /// Decodes a blur amount: values `>= 0.5` are a Gaussian FWHM, values
    /// `<= -1` a median radius, anything in between means no smoothing.
    pub fn from_amount(amount: f64) -> Self {
        if amount >= 0.5 {
            Smoothing::Gaussian(amount)
        } else if amount <= -1.0 {
            Smoothing::Median(-amount)
        } else {
            Smoothing::None
        }
    }

    /// Applies the smoothing, returning a new volume.
    pub fn apply(&self, vol: &Volume) -> Volume {
        match *self {
            Smoothing::None => vol.clone(),
            Smoothing::Gaussian(fwhm) => gaussian_blur(vol, fwhm),
            Smoothing::Median(radius) => median_filter(vol, radius),
        }
    }
}

fn gaussian_taps(fwhm: f64) -> Vec<f32> {
    let sigma = (fwhm * FWHM_TO_SIGMA).max(1e-6);
    let radius = (3.0 * sigma).ceil().max(1.0) as isize;
    let mut taps: Vec<f64> = (-radius..=radius)
        .map(|d| (-(d as f64).powi(2) / (2.0 * sigma * sigma)).exp())
        .collect();
    let sum: f64 = taps.iter().sum();
    for t in &mut taps {
        *t /= sum;
    }
    taps.into_iter().map(|t| t as f32).collect()
}

/// Separable Gaussian blur with clamped edges; axes of length one are skipped.
pub fn gaussian_blur(vol: &Volume, fwhm: f64) -> Volume {
    let taps = gaussian_taps(fwhm);
    let radius = (taps.len() / 2) as isize;
    let dims = vol.dims();
    let mut cur = vol.clone();
    for axis in 0..3 {
        let n = dims[axis];
        if n < 2 {
            continue;
        }
        let stride = match axis {
            0 => 1,
            1 => dims[0],
            _ => dims[0] * dims[1],
        };
        let total = cur.data().len();
        let out = cur.data_mut();
        let mut line = vec![0.0f32; n];
        for base in 0..total {
            // Visit each line once, from its first voxel.
            if (base / stride) % n != 0 {
                continue;
            }
            for (p, slot) in line.iter_mut().enumerate() {
                *slot = out[base + p * stride];
            }
            for pos in 0..n {
                let mut acc = 0.0f32;
                for (t, w) in taps.iter().enumerate() {
                    let q = (pos as isize + t as isize - radius).clamp(0, n as isize - 1);
                    acc += w * line[q as usize];
                }
                out[base + pos * stride] = acc;
            }
        }
    }
    cur
}

/// Median over a ball of the given radius (a disc for planar data).
pub fn median_filter(vol: &Volume, radius: f64) -> Volume {
    let [nx, ny, nz] = vol.dims();
    let r = radius.max(1.0);
    let ri = r.floor() as isize;
    let rz = if nz == 1 { 0 } else { ri };
    let mut offsets = Vec::new();
    for dk in -rz..=rz {
        for dj in -ri..=ri {
            for di in -ri..=ri {
                if ((di * di + dj * dj + dk * dk) as f64) <= r * r + 1e-6 {
                    offsets.push((di, dj, dk));
                }
            }
        }
    }
    let mut window = Vec::with_capacity(offsets.len());
    let mut out = vol.clone();
    let data = out.data_mut();
    for k in 0..nz {
        for j in 0..ny {
            for i in 0..nx {
                window.clear();
                for &(di, dj, dk) in &offsets {
                    let (x, y, z) = (i as isize + di, j as isize + dj, k as isize + dk);
                    if x < 0 || y < 0 || z < 0 {
                        continue;
                    }
                    if let Some(v) = vol.get(x as usize, y as usize, z as usize) {
                        window.push(v);
                    }
                }
                let mid = window.len() / 2;
                window.select_nth_unstable_by(mid, |a, b| a.total_cmp(b));
                data[vol.grid().index(i, j, k)] = window[mid];
            }
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::{gaussian_blur, median_filter, Smoothing};
    use crate::volume::{Grid, Volume};

    #[test]
    fn blur_rule_decodes_amounts() {
        assert_eq!(Smoothing::from_amount(0.0), Smoothing::None);
        assert_eq!(Smoothing::from_amount(0.49), Smoothing::None);
        assert_eq!(Smoothing::from_amount(2.0), Smoothing::Gaussian(2.0));
        assert_eq!(Smoothing::from_amount(-0.5), Smoothing::None);
        assert_eq!(Smoothing::from_amount(-1.5), Smoothing::Median(1.5));
    }

    #[test]
    fn gaussian_preserves_constant_and_mass() {
        let grid = Grid::new([9, 9, 9]).unwrap();
        let flat = Volume::from_fn(grid, |_, _, _| 3.0);
        let blurred = gaussian_blur(&flat, 2.5);
        assert!(blurred.data().iter().all(|v| (v - 3.0).abs() < 1e-5));

        let spike = Volume::from_fn(grid, |i, j, k| if (i, j, k) == (4, 4, 4) { 1.0 } else { 0.0 });
        let blurred = gaussian_blur(&spike, 2.0);
        let total: f32 = blurred.data().iter().sum();
        assert!((total - 1.0).abs() < 1e-4);
        assert!(blurred.at(4, 4, 4) < 1.0);
    }

    #[test]
    fn median_removes_isolated_spike() {
        let grid = Grid::new([7, 7, 1]).unwrap();
        let spike = Volume::from_fn(grid, |i, j, _| if (i, j) == (3, 3) { 100.0 } else { 1.0 });
        let filtered = median_filter(&spike, 1.5);
        assert_eq!(filtered.at(3, 3, 0), 1.0);
    }
}
