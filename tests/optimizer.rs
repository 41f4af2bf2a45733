use qwarp::{minimize, OptimizerConfig};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

#[test]
fn coupled_bowl_is_descended() {
    let f = |x: &[f64]| (x[0] + x[1] - 0.4).powi(2) + 2.0 * (x[0] - x[1]).powi(2);
    let res = minimize(f, 2, &OptimizerConfig::default(), 200);
    assert!(res.improved());
    assert!(res.cost < 0.01 * res.initial_cost, "{res:?}");
    assert!(res.evaluations <= 200);
}

#[test]
fn random_separable_targets_are_found() {
    let mut rng = StdRng::seed_from_u64(42);
    let n = 8;
    let target: Vec<f64> = (0..n).map(|_| rng.random_range(-0.8..0.8)).collect();
    let scale: Vec<f64> = (0..n).map(|_| rng.random_range(0.5..4.0)).collect();
    let f = |x: &[f64]| {
        x.iter()
            .zip(&target)
            .zip(&scale)
            .map(|((a, t), s)| s * (a - t).powi(2))
            .sum::<f64>()
    };
    let res = minimize(f, n, &OptimizerConfig::default(), 20 * n);
    for (a, t) in res.x.iter().zip(&target) {
        assert!((a - t).abs() < 0.05, "{a} vs {t}");
    }
}

#[test]
fn tiny_budget_returns_the_start() {
    let f = |x: &[f64]| (x[0] - 0.5).powi(2);
    let res = minimize(f, 1, &OptimizerConfig::default(), 1);
    assert_eq!(res.evaluations, 1);
    assert_eq!(res.x, vec![0.0]);
    assert_eq!(res.cost, res.initial_cost);
}
