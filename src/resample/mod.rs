//! Interpolation of volumes at fractional voxel coordinates.
//!
//! Coordinates are in voxel index units of the sampled grid. Kernels are
//! separable; each axis contributes a short run of taps whose indices are
//! clamped into the grid. Axes of length one always use a single tap.

use crate::volume::Volume;

/// Interpolation kernel.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum Interp {
    /// Trilinear (2 taps per axis), used inside the optimizer.
    #[default]
    Linear,
    /// Catmull-Rom cubic (4 taps per axis).
    Cubic,
    /// Hann-windowed sinc with 5 lobes (10 taps per axis), for final output.
    WSinc5,
}

impl Interp {
    /// Number of taps per axis.
    pub fn taps(&self) -> usize {
        match self {
            Interp::Linear => 2,
            Interp::Cubic => 4,
            Interp::WSinc5 => 10,
        }
    }
}

/// Handling of samples outside the grid.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum Border {
    /// Points more than half a voxel outside the grid read as zero.
    #[default]
    Zero,
    /// Values continue linearly from the edge.
    Extend,
}

const MAX_TAPS: usize = 10;
const WSINC_RADIUS: f64 = 5.0;

#[derive(Clone, Copy)]
struct AxisTaps {
    idx: [usize; MAX_TAPS],
    w: [f32; MAX_TAPS],
    len: usize,
}

impl AxisTaps {
    fn single() -> Self {
        let mut w = [0.0; MAX_TAPS];
        w[0] = 1.0;
        Self {
            idx: [0; MAX_TAPS],
            w,
            len: 1,
        }
    }
}

fn catmull_rom(t: f64) -> f64 {
    let t = t.abs();
    if t < 1.0 {
        1.5 * t * t * t - 2.5 * t * t + 1.0
    } else if t < 2.0 {
        -0.5 * t * t * t + 2.5 * t * t - 4.0 * t + 2.0
    } else {
        0.0
    }
}

fn wsinc5(t: f64) -> f64 {
    let a = t.abs();
    if a >= WSINC_RADIUS {
        return 0.0;
    }
    if a < 1e-9 {
        return 1.0;
    }
    let px = std::f64::consts::PI * t;
    let window = 0.5 * (1.0 + (std::f64::consts::PI * t / WSINC_RADIUS).cos());
    px.sin() / px * window
}

/// Taps for one axis. `x` must already be inside `[0, n-1]` unless the
/// kernel is linear, where out-of-range `x` extrapolates the edge segment.
fn axis_taps(x: f64, n: usize, interp: Interp) -> AxisTaps {
    if n == 1 {
        return AxisTaps::single();
    }
    let last = (n - 1) as isize;
    let mut taps = AxisTaps {
        idx: [0; MAX_TAPS],
        w: [0.0; MAX_TAPS],
        len: 0,
    };
    match interp {
        Interp::Linear => {
            let i0 = (x.floor() as isize).clamp(0, last - 1);
            let f = x - i0 as f64;
            taps.idx[0] = i0 as usize;
            taps.idx[1] = (i0 + 1) as usize;
            taps.w[0] = (1.0 - f) as f32;
            taps.w[1] = f as f32;
            taps.len = 2;
        }
        Interp::Cubic | Interp::WSinc5 => {
            let half = (interp.taps() / 2) as isize;
            let base = x.floor() as isize;
            let mut sum = 0.0f64;
            let mut weights = [0.0f64; MAX_TAPS];
            for t in 0..interp.taps() {
                let i = base - half + 1 + t as isize;
                let d = x - i as f64;
                let w = match interp {
                    Interp::Cubic => catmull_rom(d),
                    _ => wsinc5(d),
                };
                weights[t] = w;
                sum += w;
                taps.idx[t] = i.clamp(0, last) as usize;
            }
            let norm = if sum.abs() > 1e-12 { 1.0 / sum } else { 1.0 };
            for t in 0..interp.taps() {
                taps.w[t] = (weights[t] * norm) as f32;
            }
            taps.len = interp.taps();
        }
    }
    taps
}

fn interp_at(data: &[f32], dims: [usize; 3], p: [f64; 3], interp: Interp) -> f32 {
    let tx = axis_taps(p[0], dims[0], interp);
    let ty = axis_taps(p[1], dims[1], interp);
    let tz = axis_taps(p[2], dims[2], interp);
    let nx = dims[0];
    let nxy = nx * dims[1];
    let mut acc = 0.0f32;
    for c in 0..tz.len {
        let wz = tz.w[c];
        if wz == 0.0 {
            continue;
        }
        let oz = tz.idx[c] * nxy;
        for b in 0..ty.len {
            let wyz = ty.w[b] * wz;
            if wyz == 0.0 {
                continue;
            }
            let row = oz + ty.idx[b] * nx;
            let mut line = 0.0f32;
            for a in 0..tx.len {
                line += tx.w[a] * data[row + tx.idx[a]];
            }
            acc += wyz * line;
        }
    }
    acc
}

/// Samples raw x-fastest data of shape `dims` at voxel coordinate `p`.
pub fn sample_raw(data: &[f32], dims: [usize; 3], p: [f64; 3], interp: Interp, border: Border) -> f32 {
    let mut clamped = p;
    let mut excess = [0.0f64; 3];
    let mut outside = false;
    for axis in 0..3 {
        let hi = (dims[axis] - 1) as f64;
        if dims[axis] == 1 {
            clamped[axis] = 0.0;
            continue;
        }
        if p[axis] < 0.0 || p[axis] > hi {
            outside = true;
            clamped[axis] = p[axis].clamp(0.0, hi);
            excess[axis] = p[axis] - clamped[axis];
        }
    }
    if !outside {
        return interp_at(data, dims, p, interp);
    }
    match border {
        Border::Zero => {
            if excess.iter().any(|e| e.abs() > 0.5) {
                0.0
            } else {
                interp_at(data, dims, clamped, interp)
            }
        }
        Border::Extend => {
            if interp == Interp::Linear {
                // The edge segment continues linearly on its own.
                let mut q = p;
                for axis in 0..3 {
                    if dims[axis] == 1 {
                        q[axis] = 0.0;
                    }
                }
                return interp_at(data, dims, q, interp);
            }
            let edge = interp_at(data, dims, clamped, interp);
            let mut value = edge;
            for axis in 0..3 {
                if excess[axis] == 0.0 {
                    continue;
                }
                let mut inner = clamped;
                inner[axis] -= excess[axis].signum();
                let slope = edge - interp_at(data, dims, inner, interp);
                value += excess[axis].abs() as f32 * slope;
            }
            value
        }
    }
}

/// Samples `vol` at voxel coordinate `p`.
#[inline]
pub fn sample(vol: &Volume, p: [f64; 3], interp: Interp, border: Border) -> f32 {
    sample_raw(vol.data(), vol.dims(), p, interp, border)
}

#[cfg(test)]
mod tests {
    use super::{sample, Border, Interp};
    use crate::volume::{Grid, Volume};

    fn ramp() -> Volume {
        let grid = Grid::new([12, 10, 8]).unwrap();
        Volume::from_fn(grid, |i, j, k| 2.0 * i as f32 + 0.5 * j as f32 - k as f32 + 3.0)
    }

    #[test]
    fn kernels_reproduce_grid_values() {
        let vol = ramp();
        for interp in [Interp::Linear, Interp::Cubic, Interp::WSinc5] {
            let v = sample(&vol, [5.0, 4.0, 3.0], interp, Border::Zero);
            assert!((v - vol.at(5, 4, 3)).abs() < 1e-4, "{interp:?} gave {v}");
        }
    }

    #[test]
    fn linear_and_cubic_reproduce_ramps_inside() {
        let vol = ramp();
        let p = [5.3, 4.7, 3.25];
        let expected = 2.0 * 5.3 + 0.5 * 4.7 - 3.25 + 3.0;
        for interp in [Interp::Linear, Interp::Cubic] {
            let v = sample(&vol, p, interp, Border::Zero);
            assert!((v as f64 - expected).abs() < 1e-3, "{interp:?} gave {v}");
        }
    }

    #[test]
    fn borders_differ_outside_grid() {
        let vol = ramp();
        let p = [-2.0, 4.0, 3.0];
        assert_eq!(sample(&vol, p, Interp::Linear, Border::Zero), 0.0);
        let ext = sample(&vol, p, Interp::Linear, Border::Extend);
        assert!((ext - (2.0 * -2.0 + 0.5 * 4.0 - 3.0 + 3.0)).abs() < 1e-4);
        let ext_cubic = sample(&vol, p, Interp::Cubic, Border::Extend);
        assert!((ext_cubic - ext).abs() < 1e-3);
    }

    #[test]
    fn planar_axis_ignores_z() {
        let grid = Grid::new([6, 6, 1]).unwrap();
        let vol = Volume::from_fn(grid, |i, _, _| i as f32);
        let v = sample(&vol, [2.5, 1.0, 0.7], Interp::Linear, Border::Zero);
        assert!((v - 2.5).abs() < 1e-6);
    }
}
