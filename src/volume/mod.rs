//! Dense 3D scalar volumes and their sampling grids.
//!
//! Voxel data is stored x-fastest: the linear index of `(i, j, k)` is
//! `i + nx * (j + ny * k)`. A [`Grid`] pairs the dimensions with an
//! index-to-world [`Affine`] so that padding, cropping and warp conformance
//! checks can be expressed as integer voxel offsets.

use crate::util::{Mat3, QwarpError, QwarpResult};

pub mod filter;
#[cfg(feature = "image-io")]
pub mod io;
pub mod pad;
pub mod pyramid;

/// Per-face voxel counts `[x_lo, x_hi, y_lo, y_hi, z_lo, z_hi]`.
///
/// Positive entries add zero slices, negative entries crop slices.
pub type Pads = [isize; 6];

/// Index-to-world affine map stored as a 3x4 matrix.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct Affine(pub [[f64; 4]; 3]);

impl Affine {
    /// Identity map (world coordinates equal voxel indices).
    pub const IDENTITY: Affine = Affine([
        [1.0, 0.0, 0.0, 0.0],
        [0.0, 1.0, 0.0, 0.0],
        [0.0, 0.0, 1.0, 0.0],
    ]);

    /// Axis-aligned map with the given spacing and origin.
    pub fn from_spacing(spacing: [f64; 3], origin: [f64; 3]) -> Self {
        Affine([
            [spacing[0], 0.0, 0.0, origin[0]],
            [0.0, spacing[1], 0.0, origin[1]],
            [0.0, 0.0, spacing[2], origin[2]],
        ])
    }

    /// Returns the linear 3x3 part.
    pub fn linear(&self) -> Mat3 {
        let m = &self.0;
        Mat3([
            [m[0][0], m[0][1], m[0][2]],
            [m[1][0], m[1][1], m[1][2]],
            [m[2][0], m[2][1], m[2][2]],
        ])
    }

    /// Returns the translation column.
    pub fn offset(&self) -> [f64; 3] {
        [self.0[0][3], self.0[1][3], self.0[2][3]]
    }

    /// Builds an affine map from a linear part and translation.
    pub fn from_parts(linear: Mat3, offset: [f64; 3]) -> Self {
        let l = &linear.0;
        Affine([
            [l[0][0], l[0][1], l[0][2], offset[0]],
            [l[1][0], l[1][1], l[1][2], offset[1]],
            [l[2][0], l[2][1], l[2][2], offset[2]],
        ])
    }

    /// Maps a point.
    pub fn apply(&self, p: [f64; 3]) -> [f64; 3] {
        let v = self.linear().apply(p);
        let o = self.offset();
        [v[0] + o[0], v[1] + o[1], v[2] + o[2]]
    }

    /// Returns the inverse map, if the linear part is invertible.
    pub fn inverse(&self) -> Option<Affine> {
        let inv = self.linear().inverse()?;
        let t = inv.apply(self.offset());
        Some(Affine::from_parts(inv, [-t[0], -t[1], -t[2]]))
    }

    /// Composition `self ∘ rhs` (apply `rhs` first).
    pub fn then_after(&self, rhs: &Affine) -> Affine {
        let linear = self.linear().mul(&rhs.linear());
        let offset = self.apply(rhs.offset());
        Affine::from_parts(linear, offset)
    }

    /// Same map with the index origin moved to `shift` (in voxel units).
    pub(crate) fn shifted(&self, shift: [f64; 3]) -> Affine {
        Affine::from_parts(self.linear(), self.apply(shift))
    }
}

/// Sampling grid: dimensions plus index-to-world geometry.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct Grid {
    dims: [usize; 3],
    affine: Affine,
}

impl Grid {
    /// Creates a grid with unit spacing at the world origin.
    pub fn new(dims: [usize; 3]) -> QwarpResult<Self> {
        Self::with_affine(dims, Affine::IDENTITY)
    }

    /// Creates a grid with explicit geometry.
    pub fn with_affine(dims: [usize; 3], affine: Affine) -> QwarpResult<Self> {
        let [nx, ny, nz] = dims;
        let invalid = QwarpError::InvalidDimensions { nx, ny, nz };
        if nx == 0 || ny == 0 || nz == 0 {
            return Err(invalid);
        }
        nx.checked_mul(ny)
            .and_then(|v| v.checked_mul(nz))
            .ok_or(invalid)?;
        if affine.linear().inverse().is_none() {
            return Err(QwarpError::InvalidConfig(
                "grid affine has a singular linear part".to_string(),
            ));
        }
        Ok(Self { dims, affine })
    }

    /// Returns `[nx, ny, nz]`.
    pub fn dims(&self) -> [usize; 3] {
        self.dims
    }

    /// Returns the index-to-world map.
    pub fn affine(&self) -> &Affine {
        &self.affine
    }

    /// Number of voxels.
    pub fn len(&self) -> usize {
        self.dims[0] * self.dims[1] * self.dims[2]
    }

    /// Grids are never empty; provided for API symmetry with `len`.
    pub fn is_empty(&self) -> bool {
        false
    }

    /// Linear index of voxel `(i, j, k)`.
    #[inline]
    pub fn index(&self, i: usize, j: usize, k: usize) -> usize {
        i + self.dims[0] * (j + self.dims[1] * k)
    }

    /// Inverse of [`Grid::index`].
    #[inline]
    pub fn coords(&self, idx: usize) -> [usize; 3] {
        let nx = self.dims[0];
        let ny = self.dims[1];
        [idx % nx, (idx / nx) % ny, idx / (nx * ny)]
    }

    /// Returns true when the grid has a single slice along z.
    pub fn is_planar(&self) -> bool {
        self.dims[2] == 1
    }

    /// Returns the grid obtained by padding (or cropping) each face.
    pub fn padded(&self, pads: Pads) -> QwarpResult<Grid> {
        let mut dims = [0usize; 3];
        for axis in 0..3 {
            let n = self.dims[axis] as isize + pads[2 * axis] + pads[2 * axis + 1];
            if n <= 0 {
                let [nx, ny, nz] = self.dims;
                return Err(QwarpError::InvalidDimensions { nx, ny, nz });
            }
            dims[axis] = n as usize;
        }
        let shift = [-pads[0] as f64, -pads[2] as f64, -pads[4] as f64];
        Grid::with_affine(dims, self.affine.shifted(shift))
    }

    /// Integer voxel offset of `other`'s origin inside this grid.
    ///
    /// Returns `Some(o)` when both grids share the same linear geometry and
    /// `other`'s voxel `(0,0,0)` coincides with this grid's voxel `o`.
    pub fn conform_offset(&self, other: &Grid) -> Option<[isize; 3]> {
        let scale = self
            .affine
            .linear()
            .0
            .iter()
            .flatten()
            .fold(0.0f64, |acc, v| acc.max(v.abs()))
            .max(1e-12);
        if self.affine.linear().max_abs_diff(&other.affine.linear()) > 1e-4 * scale {
            return None;
        }
        let inv = self.affine.inverse()?;
        let pos = inv.apply(other.affine.offset());
        let mut out = [0isize; 3];
        for axis in 0..3 {
            let r = pos[axis].round();
            if (pos[axis] - r).abs() > 1e-3 {
                return None;
            }
            out[axis] = r as isize;
        }
        Some(out)
    }

    /// Pads that turn this grid into `target`, if the grids conform.
    pub fn pads_to(&self, target: &Grid) -> Option<Pads> {
        let off = target.conform_offset(self)?;
        let mut pads = [0isize; 6];
        for axis in 0..3 {
            pads[2 * axis] = off[axis];
            pads[2 * axis + 1] =
                target.dims[axis] as isize - self.dims[axis] as isize - off[axis];
        }
        Some(pads)
    }
}

/// Dense single-channel volume.
#[derive(Clone, Debug, PartialEq)]
pub struct Volume {
    grid: Grid,
    data: Vec<f32>,
}

impl Volume {
    /// Wraps a buffer whose length must equal the grid size.
    pub fn new(grid: Grid, data: Vec<f32>) -> QwarpResult<Self> {
        let needed = grid.len();
        if data.len() < needed {
            return Err(QwarpError::BufferTooSmall {
                needed,
                got: data.len(),
            });
        }
        if data.len() > needed {
            let [nx, ny, nz] = grid.dims();
            return Err(QwarpError::InvalidDimensions { nx, ny, nz });
        }
        Ok(Self { grid, data })
    }

    /// All-zero volume on `grid`.
    pub fn zeros(grid: Grid) -> Self {
        Self {
            data: vec![0.0; grid.len()],
            grid,
        }
    }

    /// Volume filled from a function of voxel coordinates.
    pub fn from_fn(grid: Grid, mut f: impl FnMut(usize, usize, usize) -> f32) -> Self {
        let [nx, ny, nz] = grid.dims();
        let mut data = Vec::with_capacity(grid.len());
        for k in 0..nz {
            for j in 0..ny {
                for i in 0..nx {
                    data.push(f(i, j, k));
                }
            }
        }
        Self { grid, data }
    }

    pub fn grid(&self) -> &Grid {
        &self.grid
    }

    pub fn dims(&self) -> [usize; 3] {
        self.grid.dims()
    }

    pub fn data(&self) -> &[f32] {
        &self.data
    }

    pub fn data_mut(&mut self) -> &mut [f32] {
        &mut self.data
    }

    pub fn into_data(self) -> Vec<f32> {
        self.data
    }

    /// Value at `(i, j, k)`; panics when out of range.
    #[inline]
    pub fn at(&self, i: usize, j: usize, k: usize) -> f32 {
        self.data[self.grid.index(i, j, k)]
    }

    /// Value at `(i, j, k)` or `None` when out of range.
    pub fn get(&self, i: usize, j: usize, k: usize) -> Option<f32> {
        let [nx, ny, nz] = self.dims();
        if i >= nx || j >= ny || k >= nz {
            return None;
        }
        self.data.get(self.grid.index(i, j, k)).copied()
    }

    /// Returns `(min, max)` over all voxels.
    pub fn min_max(&self) -> (f32, f32) {
        self.data
            .iter()
            .fold((f32::INFINITY, f32::NEG_INFINITY), |(lo, hi), &v| {
                (lo.min(v), hi.max(v))
            })
    }

    /// Returns true if any voxel is negative.
    pub fn has_negatives(&self) -> bool {
        self.data.iter().any(|v| *v < 0.0)
    }

    /// Replaces negative values by zero.
    pub fn clip_negatives(&mut self) {
        for v in &mut self.data {
            if *v < 0.0 {
                *v = 0.0;
            }
        }
    }

    /// Returns a copy with each face padded by zeros or cropped.
    ///
    /// Padding then cropping by the same amounts restores the data exactly.
    pub fn zeropad(&self, pads: Pads) -> QwarpResult<Volume> {
        let grid = self.grid.padded(pads)?;
        let mut out = Volume::zeros(grid);
        let [nx, ny, nz] = self.dims();
        let [ox, oy, oz] = grid.dims();
        for k in 0..nz {
            let kk = k as isize + pads[4];
            if kk < 0 || kk >= oz as isize {
                continue;
            }
            for j in 0..ny {
                let jj = j as isize + pads[2];
                if jj < 0 || jj >= oy as isize {
                    continue;
                }
                // Contiguous x-run that survives cropping.
                let i0 = (-pads[0]).max(0) as usize;
                let i1 = (nx as isize).min(ox as isize - pads[0]).max(0) as usize;
                if i0 >= i1 {
                    continue;
                }
                let src = self.grid.index(i0, j, k);
                let dst = grid.index((i0 as isize + pads[0]) as usize, jj as usize, kk as usize);
                out.data[dst..dst + (i1 - i0)].copy_from_slice(&self.data[src..src + (i1 - i0)]);
            }
        }
        Ok(out)
    }

    /// Ensures `other` lives on exactly this volume's grid.
    pub(crate) fn check_same_grid(&self, other: &Grid, what: &'static str) -> QwarpResult<()> {
        if self.dims() != other.dims() {
            return Err(QwarpError::GridMismatch {
                what,
                expected: self.dims(),
                got: other.dims(),
            });
        }
        if self.grid.conform_offset(other) != Some([0, 0, 0]) {
            return Err(QwarpError::NonConformingGrid { what });
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::{Affine, Grid, Volume};

    #[test]
    fn index_and_coords_agree() {
        let grid = Grid::new([4, 3, 2]).unwrap();
        for idx in 0..grid.len() {
            let [i, j, k] = grid.coords(idx);
            assert_eq!(grid.index(i, j, k), idx);
        }
    }

    #[test]
    fn padded_grid_keeps_world_positions() {
        let grid = Grid::with_affine([5, 5, 5], Affine::from_spacing([2.0, 1.0, 1.5], [3.0, 0.0, -1.0]))
            .unwrap();
        let padded = grid.padded([2, 1, 0, 3, 1, 1]).unwrap();
        assert_eq!(padded.dims(), [8, 8, 7]);
        assert_eq!(grid.conform_offset(&padded), Some([-2, 0, -1]));
        assert_eq!(padded.conform_offset(&grid), Some([2, 0, 1]));
        assert_eq!(grid.pads_to(&padded), Some([2, 1, 0, 3, 1, 1]));
    }

    #[test]
    fn zeropad_then_crop_restores_data() {
        let grid = Grid::new([5, 4, 3]).unwrap();
        let vol = Volume::from_fn(grid, |i, j, k| (i + 10 * j + 100 * k) as f32);
        let pads = [2, 3, 1, 0, 4, 2];
        let padded = vol.zeropad(pads).unwrap();
        assert_eq!(padded.dims(), [10, 5, 9]);
        assert_eq!(padded.at(2, 1, 4), vol.at(0, 0, 0));
        assert_eq!(padded.at(0, 0, 0), 0.0);
        let crop = pads.map(|p| -p);
        let restored = padded.zeropad(crop).unwrap();
        assert_eq!(restored, vol);
    }

    #[test]
    fn rejects_wrong_buffer_length() {
        let grid = Grid::new([2, 2, 2]).unwrap();
        assert!(Volume::new(grid, vec![0.0; 7]).is_err());
        assert!(Volume::new(grid, vec![0.0; 9]).is_err());
    }
}
