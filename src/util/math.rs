//! Small dense linear algebra and order-statistic helpers.

/// Row-major 3x3 matrix used for deformation gradients and affine parts.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct Mat3(pub [[f64; 3]; 3]);

impl Mat3 {
    /// Identity matrix.
    pub const IDENTITY: Mat3 = Mat3([[1.0, 0.0, 0.0], [0.0, 1.0, 0.0], [0.0, 0.0, 1.0]]);

    /// Returns the determinant.
    pub fn det(&self) -> f64 {
        let m = &self.0;
        m[0][0] * (m[1][1] * m[2][2] - m[1][2] * m[2][1])
            - m[0][1] * (m[1][0] * m[2][2] - m[1][2] * m[2][0])
            + m[0][2] * (m[1][0] * m[2][1] - m[1][1] * m[2][0])
    }

    /// Returns the inverse, or `None` when the matrix is (nearly) singular.
    pub fn inverse(&self) -> Option<Mat3> {
        let det = self.det();
        if !det.is_finite() || det.abs() < 1e-12 {
            return None;
        }
        let m = &self.0;
        let inv_det = 1.0 / det;
        let mut out = [[0.0; 3]; 3];
        out[0][0] = (m[1][1] * m[2][2] - m[1][2] * m[2][1]) * inv_det;
        out[0][1] = (m[0][2] * m[2][1] - m[0][1] * m[2][2]) * inv_det;
        out[0][2] = (m[0][1] * m[1][2] - m[0][2] * m[1][1]) * inv_det;
        out[1][0] = (m[1][2] * m[2][0] - m[1][0] * m[2][2]) * inv_det;
        out[1][1] = (m[0][0] * m[2][2] - m[0][2] * m[2][0]) * inv_det;
        out[1][2] = (m[0][2] * m[1][0] - m[0][0] * m[1][2]) * inv_det;
        out[2][0] = (m[1][0] * m[2][1] - m[1][1] * m[2][0]) * inv_det;
        out[2][1] = (m[0][1] * m[2][0] - m[0][0] * m[2][1]) * inv_det;
        out[2][2] = (m[0][0] * m[1][1] - m[0][1] * m[1][0]) * inv_det;
        Some(Mat3(out))
    }

    /// Matrix product `self * rhs`.
    pub fn mul(&self, rhs: &Mat3) -> Mat3 {
        let mut out = [[0.0; 3]; 3];
        for (r, row) in out.iter_mut().enumerate() {
            for (c, value) in row.iter_mut().enumerate() {
                *value = (0..3).map(|k| self.0[r][k] * rhs.0[k][c]).sum();
            }
        }
        Mat3(out)
    }

    /// Applies the matrix to a column vector.
    pub fn apply(&self, v: [f64; 3]) -> [f64; 3] {
        let m = &self.0;
        [
            m[0][0] * v[0] + m[0][1] * v[1] + m[0][2] * v[2],
            m[1][0] * v[0] + m[1][1] * v[1] + m[1][2] * v[2],
            m[2][0] * v[0] + m[2][1] * v[1] + m[2][2] * v[2],
        ]
    }

    /// Sum of squared entries, i.e. `trace(M^T M)`.
    pub fn frobenius_sq(&self) -> f64 {
        self.0.iter().flatten().map(|v| v * v).sum()
    }

    /// Largest absolute entry difference against `other`.
    pub fn max_abs_diff(&self, other: &Mat3) -> f64 {
        self.0
            .iter()
            .flatten()
            .zip(other.0.iter().flatten())
            .map(|(a, b)| (a - b).abs())
            .fold(0.0, f64::max)
    }
}

/// Rounds down to an odd number (never below 1).
pub(crate) fn make_odd_down(n: usize) -> usize {
    if n == 0 {
        1
    } else if n % 2 == 0 {
        n - 1
    } else {
        n
    }
}

/// Quantile of an ascending slice using linear interpolation between ranks.
pub(crate) fn quantile_sorted(sorted: &[f32], q: f64) -> f32 {
    match sorted.len() {
        0 => 0.0,
        1 => sorted[0],
        len => {
            let pos = q.clamp(0.0, 1.0) * (len - 1) as f64;
            let lo = pos.floor() as usize;
            let hi = (lo + 1).min(len - 1);
            let frac = (pos - lo as f64) as f32;
            sorted[lo] + frac * (sorted[hi] - sorted[lo])
        }
    }
}

/// Iterative "clip level" separating foreground from dark background.
///
/// Starts from `mfrac` times the median of all positive values, then
/// repeatedly replaces the level with `mfrac` times the median of the values
/// at or above the current level until it stops moving. Returns 0 when no
/// value is positive.
pub(crate) fn clip_level(values: &[f32], mfrac: f32) -> f32 {
    let mut pos: Vec<f32> = values.iter().copied().filter(|v| *v > 0.0).collect();
    if pos.is_empty() {
        return 0.0;
    }
    pos.sort_by(|a, b| a.total_cmp(b));
    let mut level = mfrac * quantile_sorted(&pos, 0.5);
    for _ in 0..66 {
        let start = pos.partition_point(|v| *v < level);
        if start >= pos.len() {
            break;
        }
        let next = mfrac * quantile_sorted(&pos[start..], 0.5);
        let moved = (next - level).abs();
        level = next;
        if moved <= 1e-6 * level.abs().max(1e-12) {
            break;
        }
    }
    level
}
