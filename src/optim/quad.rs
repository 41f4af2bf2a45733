//! Quadratic 1D fitting for the coordinate model.

/// Gradient and curvature of the parabola through `(-a, fm)`, `(0, f0)` and
/// `(b, fp)`.
///
/// Either step may be zero when the coordinate sits on a bound; the
/// curvature is then unknown and returned as `0`. Non-finite samples give
/// `None`.
pub fn fit_parabola(a: f64, b: f64, fm: f64, f0: f64, fp: f64) -> Option<(f64, f64)> {
    if !f0.is_finite() {
        return None;
    }
    let has_m = a > 0.0 && fm.is_finite();
    let has_p = b > 0.0 && fp.is_finite();
    match (has_m, has_p) {
        (true, true) => {
            let dp = (fp - f0) / b;
            let dm = (fm - f0) / a;
            let h = 2.0 * (dp + dm) / (a + b);
            let g = dp - 0.5 * h * b;
            Some((g, h))
        }
        (false, true) => Some(((fp - f0) / b, 0.0)),
        (true, false) => Some(((f0 - fm) / a, 0.0)),
        (false, false) => None,
    }
}

/// Minimizing step for the model `g t + h t^2 / 2` restricted to
/// `[-lo, hi]`.
///
/// Uses the Newton step when the curvature is positive, otherwise moves to
/// the bound that the slope points to.
pub fn model_step(g: f64, h: f64, lo: f64, hi: f64) -> f64 {
    let eps = 1e-12;
    let step = if h > eps {
        -g / h
    } else if g > 0.0 {
        -lo
    } else if g < 0.0 {
        hi
    } else {
        0.0
    };
    step.clamp(-lo, hi)
}

#[cfg(test)]
mod tests {
    use super::{fit_parabola, model_step};

    #[test]
    fn symmetric_fit_recovers_parabola() {
        let f = |x: f64| 2.0 + 0.5 * x + 1.5 * x * x;
        let (g, h) = fit_parabola(0.3, 0.3, f(-0.3), f(0.0), f(0.3)).unwrap();
        assert!((g - 0.5).abs() < 1e-9);
        assert!((h - 3.0).abs() < 1e-9);
    }

    #[test]
    fn asymmetric_fit_recovers_parabola() {
        let f = |x: f64| (x - 0.25).powi(2);
        let (g, h) = fit_parabola(0.1, 0.4, f(-0.1), f(0.0), f(0.4)).unwrap();
        assert!((g + 0.5).abs() < 1e-9);
        assert!((h - 2.0).abs() < 1e-9);
        assert!((model_step(g, h, 0.5, 0.5) - 0.25).abs() < 1e-9);
    }

    #[test]
    fn one_sided_fit_has_no_curvature() {
        let (g, h) = fit_parabola(0.0, 0.2, f64::NAN, 1.0, 1.2).unwrap();
        assert!((g - 1.0).abs() < 1e-9);
        assert_eq!(h, 0.0);
        assert_eq!(model_step(g, h, 0.3, 0.0), -0.3);
    }

    #[test]
    fn non_finite_center_is_rejected() {
        assert!(fit_parabola(0.1, 0.1, 1.0, f64::NAN, 1.0).is_none());
    }
}
