//! Bounded derivative-free minimization.
//!
//! Parameters live in the box `[-1, 1]^n` and start at the origin. Each
//! iteration samples every coordinate at `±rho` (clipped to the box), fits a
//! separable quadratic model from those `2n + 1` values, and evaluates the
//! model minimizer inside the trust region. The radius grows after a
//! well-predicted step and halves when nothing improves. The best point
//! seen is always returned, so the result is never worse than the start.
//!
//! The model is diagonal: one parabola per coordinate and no cross terms
//! between parameters. It is not a full quadratic interpolation model of
//! the NEWUOA kind, so strongly coupled parameters converge more slowly
//! than the radius schedule alone suggests.

mod quad;

pub use quad::{fit_parabola, model_step};

/// Optimizer settings.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct OptimizerConfig {
    /// Initial trust radius.
    pub rho_begin: f64,
    /// Stop once the radius drops below this.
    pub rho_end: f64,
    /// Evaluation budget per free parameter.
    pub evals_per_param: usize,
}

impl Default for OptimizerConfig {
    fn default() -> Self {
        Self {
            rho_begin: 0.5,
            rho_end: 0.02,
            evals_per_param: 20,
        }
    }
}

/// Outcome of one minimization.
#[derive(Clone, Debug, PartialEq)]
pub struct OptimizeResult {
    pub x: Vec<f64>,
    pub cost: f64,
    /// Cost at the origin.
    pub initial_cost: f64,
    pub evaluations: usize,
}

impl OptimizeResult {
    /// True when the result beats the starting point.
    pub fn improved(&self) -> bool {
        self.cost < self.initial_cost
    }
}

struct Tracker<F> {
    f: F,
    evals: usize,
    best_x: Vec<f64>,
    best_f: f64,
}

impl<F: FnMut(&[f64]) -> f64> Tracker<F> {
    fn eval(&mut self, x: &[f64]) -> f64 {
        self.evals += 1;
        let v = (self.f)(x);
        let v = if v.is_finite() { v } else { f64::INFINITY };
        if v < self.best_f {
            self.best_f = v;
            self.best_x.clear();
            self.best_x.extend_from_slice(x);
        }
        v
    }
}

/// Minimizes `f` over `[-1, 1]^n` starting from zero, using at most
/// `budget` evaluations.
pub fn minimize<F>(f: F, n: usize, cfg: &OptimizerConfig, budget: usize) -> OptimizeResult
where
    F: FnMut(&[f64]) -> f64,
{
    let mut t = Tracker {
        f,
        evals: 0,
        best_x: vec![0.0; n],
        best_f: f64::INFINITY,
    };
    let mut x = vec![0.0f64; n];
    let initial_cost = t.eval(&x);
    let mut fx = initial_cost;
    let mut rho = cfg.rho_begin.clamp(cfg.rho_end.max(1e-6), 1.0);
    let mut grad = vec![0.0f64; n];
    let mut curv = vec![0.0f64; n];
    let mut step = vec![0.0f64; n];
    let mut trial = vec![0.0f64; n];

    while n > 0 && rho >= cfg.rho_end && t.evals + 2 * n < budget {
        // Coordinate samples.
        for i in 0..n {
            let lo = (1.0 + x[i]).min(rho);
            let hi = (1.0 - x[i]).min(rho);
            trial.copy_from_slice(&x);
            let fp = if hi > 0.0 {
                trial[i] = x[i] + hi;
                t.eval(&trial)
            } else {
                f64::NAN
            };
            let fm = if lo > 0.0 {
                trial[i] = x[i] - lo;
                t.eval(&trial)
            } else {
                f64::NAN
            };
            let (g, h) = fit_parabola(lo, hi, fm, fx, fp).unwrap_or((0.0, 0.0));
            grad[i] = g;
            curv[i] = h;
            step[i] = model_step(g, h, lo, hi);
        }

        // Model step.
        let predicted: f64 = (0..n)
            .map(|i| -(grad[i] * step[i] + 0.5 * curv[i].max(0.0) * step[i] * step[i]))
            .sum();
        for i in 0..n {
            trial[i] = (x[i] + step[i]).clamp(-1.0, 1.0);
        }
        let f_trial = if step.iter().any(|s| *s != 0.0) {
            t.eval(&trial)
        } else {
            f64::INFINITY
        };

        if t.best_f < fx {
            let ratio = if predicted > 0.0 {
                (fx - f_trial) / predicted
            } else {
                0.0
            };
            x.copy_from_slice(&t.best_x);
            fx = t.best_f;
            if ratio > 0.7 {
                rho = (2.0 * rho).min(1.0);
            } else if ratio < 0.1 {
                rho *= 0.5;
            }
        } else {
            rho *= 0.5;
        }
    }

    OptimizeResult {
        x: t.best_x,
        cost: t.best_f,
        initial_cost,
        evaluations: t.evals,
    }
}

#[cfg(test)]
mod tests {
    use super::{minimize, OptimizerConfig};

    #[test]
    fn finds_interior_minimum_of_quadratic() {
        let target = [0.3, -0.45, 0.1];
        let f = |x: &[f64]| {
            x.iter()
                .zip(target)
                .enumerate()
                .map(|(i, (a, b))| (i + 1) as f64 * (a - b).powi(2))
                .sum::<f64>()
        };
        let res = minimize(f, 3, &OptimizerConfig::default(), 200);
        assert!(res.improved());
        for (a, b) in res.x.iter().zip(target) {
            assert!((a - b).abs() < 0.02, "{a} vs {b}");
        }
    }

    #[test]
    fn respects_the_box() {
        let f = |x: &[f64]| -x[0] + x[1];
        let res = minimize(f, 2, &OptimizerConfig::default(), 100);
        assert!((res.x[0] - 1.0).abs() < 1e-12);
        assert!((res.x[1] + 1.0).abs() < 1e-12);
        assert!(res.x.iter().all(|v| v.abs() <= 1.0));
    }

    #[test]
    fn never_worse_than_start() {
        let f = |x: &[f64]| x.iter().map(|v| v.abs()).sum::<f64>();
        let res = minimize(f, 4, &OptimizerConfig::default(), 60);
        assert_eq!(res.initial_cost, 0.0);
        assert_eq!(res.cost, 0.0);
        assert!(res.x.iter().all(|v| *v == 0.0));
    }

    #[test]
    fn stays_within_budget() {
        let mut calls = 0usize;
        let f = |x: &[f64]| {
            calls += 1;
            x.iter().map(|v| (v - 0.2).powi(2)).sum::<f64>()
        };
        let res = minimize(f, 5, &OptimizerConfig::default(), 40);
        assert!(res.evaluations <= 40);
        assert_eq!(calls, res.evaluations);
    }
}
