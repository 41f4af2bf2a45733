//! Factor-two volume downsampling for the coarse pre-pass.
//!
//! Each output voxel is the mean of a 2x2x2 block: `dst = sum(block) / 8`.
//! Axes of length one are left alone, so planar data stays planar. Output
//! voxel `c` sits at input index `2c + 0.5` along each reduced axis.

use crate::volume::{Affine, Grid, Volume};
use crate::util::QwarpResult;

/// Returns the reduced length of one axis.
pub(crate) fn half_len(n: usize) -> usize {
    if n < 2 {
        n
    } else {
        n / 2
    }
}

/// Grid of the downsampled volume, with geometry matching block centers.
pub fn downsampled_grid(grid: &Grid) -> QwarpResult<Grid> {
    let dims = grid.dims();
    let out = dims.map(half_len);
    let mut scale = [[0.0f64; 4]; 3];
    let mut shift = [0.0f64; 3];
    for axis in 0..3 {
        let reduced = dims[axis] >= 2;
        scale[axis][axis] = if reduced { 2.0 } else { 1.0 };
        shift[axis] = if reduced { 0.5 } else { 0.0 };
        scale[axis][3] = shift[axis];
    }
    let coarse_to_fine = Affine(scale);
    Grid::with_affine(out, grid.affine().then_after(&coarse_to_fine))
}

/// Averages 2x2x2 blocks (2x2 for planar data).
pub fn downsample2(vol: &Volume) -> QwarpResult<Volume> {
    let grid = downsampled_grid(vol.grid())?;
    let [nx, ny, nz] = vol.dims();
    let [ox, oy, oz] = grid.dims();
    let step = |n: usize| if n >= 2 { 2 } else { 1 };
    let (sx, sy, sz) = (step(nx), step(ny), step(nz));
    let norm = 1.0 / (sx * sy * sz) as f32;
    let mut data = Vec::with_capacity(grid.len());
    for k in 0..oz {
        for j in 0..oy {
            for i in 0..ox {
                let mut sum = 0.0f32;
                for dk in 0..sz {
                    for dj in 0..sy {
                        for di in 0..sx {
                            sum += vol.at(i * sx + di, j * sy + dj, k * sz + dk);
                        }
                    }
                }
                data.push(sum * norm);
            }
        }
    }
    Volume::new(grid, data)
}
