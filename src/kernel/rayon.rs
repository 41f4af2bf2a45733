//! Rayon-parallel resampling (feature-gated).
//!
//! Final output warping is embarrassingly parallel; slices along z are
//! distributed over the thread pool.

use crate::resample::{sample_raw, Border, Interp};
use crate::util::QwarpResult;
use crate::volume::Volume;
use crate::warp::DisplacementField;
use rayon::prelude::*;

/// Slice-parallel version of [`DisplacementField::apply`].
pub fn apply_par(
    field: &DisplacementField,
    vol: &Volume,
    interp: Interp,
    border: Border,
) -> QwarpResult<Volume> {
    vol.check_same_grid(field.grid(), "warped volume")?;
    let grid = *field.grid();
    let [nx, ny, _] = grid.dims();
    let dims = vol.dims();
    let slice_len = nx * ny;
    let mut out = Volume::zeros(grid);
    out.data_mut()
        .par_chunks_mut(slice_len)
        .enumerate()
        .for_each(|(k, slice)| {
            for (offset, value) in slice.iter_mut().enumerate() {
                let idx = k * slice_len + offset;
                let d = field.at(idx);
                let p = [
                    (offset % nx) as f64 + d[0] as f64,
                    (offset / nx) as f64 + d[1] as f64,
                    k as f64 + d[2] as f64,
                ];
                *value = sample_raw(vol.data(), dims, p, interp, border);
            }
        });
    Ok(out)
}
