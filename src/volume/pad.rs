//! Automatic zero-padding amounts.
//!
//! Patches near the grid edge need room to move; the base is padded so that
//! every face carries enough empty slices outside its foreground bounding box.

use crate::util::math::clip_level;
use crate::volume::{Pads, Volume};

/// Smallest number of empty slices required on a padded face.
pub const MIN_EMPTY_SLICES: usize = 9;

/// Fraction of the axis length required as empty slices on each face.
const EMPTY_FRACTION: f64 = 0.1111;

/// Inclusive voxel bounding box of values above `threshold`, per axis.
pub fn bounding_box(vol: &Volume, threshold: f32) -> Option<[(usize, usize); 3]> {
    let mut lo = [usize::MAX; 3];
    let mut hi = [0usize; 3];
    let mut any = false;
    for (idx, &v) in vol.data().iter().enumerate() {
        if v <= threshold {
            continue;
        }
        any = true;
        let c = vol.grid().coords(idx);
        for axis in 0..3 {
            lo[axis] = lo[axis].min(c[axis]);
            hi[axis] = hi[axis].max(c[axis]);
        }
    }
    any.then(|| [(lo[0], hi[0]), (lo[1], hi[1]), (lo[2], hi[2])])
}

/// Computes per-face padding for `base`.
///
/// The foreground is everything above `0.33 * clip_level(0.22)`. Each face
/// of an axis longer than one voxel needs `max(9, round(0.1111 * n))` empty
/// slices; missing ones become padding. `min_pad` raises every padded face
/// to at least that amount and `extra_pad` is added on top.
pub fn auto_padding(base: &Volume, min_pad: usize, extra_pad: usize) -> Pads {
    let dims = base.dims();
    let threshold = 0.33 * clip_level(base.data(), 0.22);
    let bbox = bounding_box(base, threshold);
    let mut pads = [0isize; 6];
    for axis in 0..3 {
        let n = dims[axis];
        if n == 1 {
            continue;
        }
        let need = ((EMPTY_FRACTION * n as f64).round() as usize).max(MIN_EMPTY_SLICES);
        let (empty_lo, empty_hi) = match bbox {
            Some(b) => (b[axis].0, n - 1 - b[axis].1),
            None => (0, 0),
        };
        for (face, empty) in [(0, empty_lo), (1, empty_hi)] {
            let pad = need.saturating_sub(empty).max(min_pad) + extra_pad;
            pads[2 * axis + face] = pad as isize;
        }
    }
    pads
}
