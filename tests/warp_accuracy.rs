use qwarp::{DisplacementField, Grid, RegistrationConfig, RegistrationInput, Volume, Warper};

const N: usize = 32;
const INNER: std::ops::Range<usize> = 11..21;

fn blob(cx: f32, cy: f32) -> Volume {
    let grid = Grid::new([N, N, 1]).unwrap();
    Volume::from_fn(grid, |i, j, _| {
        let d = (i as f32 - cx).powi(2) + (j as f32 - cy).powi(2);
        100.0 * (-d / 40.0).exp()
    })
}

fn register(cfg: RegistrationConfig, base: &Volume, source: &Volume) -> qwarp::RegistrationOutput {
    Warper::new()
        .with_config(cfg)
        .register(RegistrationInput::new(base, source))
        .unwrap()
}

/// Largest per-component difference over voxels at least `margin` from the
/// x/y borders.
fn max_diff_inside(a: &DisplacementField, b: &DisplacementField, margin: usize) -> f32 {
    let grid = *a.grid();
    let mut worst = 0.0f32;
    for j in margin..N - margin {
        for i in margin..N - margin {
            let idx = grid.index(i, j, 0);
            let (p, q) = (a.at(idx), b.at(idx));
            for axis in 0..3 {
                worst = worst.max((p[axis] - q[axis]).abs());
            }
        }
    }
    worst
}

fn mean_x_inner(field: &DisplacementField) -> f32 {
    let grid = *field.grid();
    let mut sum = 0.0;
    for j in INNER {
        for i in INNER {
            sum += field.at(grid.index(i, j, 0))[0];
        }
    }
    sum / (INNER.len() * INNER.len()) as f32
}

#[test]
fn level_zero_recovers_sub_voxel_shifts() {
    let base = blob(16.0, 16.0);
    for shift in [0.3f32, 0.5, 0.8] {
        let source = blob(16.0 + shift, 16.0);
        let cfg = RegistrationConfig {
            max_level: 0,
            ..RegistrationConfig::default()
        };
        let out = register(cfg, &base, &source);
        let mean = mean_x_inner(&out.warp);
        assert!((mean - shift).abs() < 0.1, "shift {shift}: mean {mean}");
    }
}

#[test]
fn inverting_twice_returns_the_engine_warp() {
    let base = blob(16.0, 16.0);
    let source = blob(16.8, 15.6);
    let cfg = RegistrationConfig {
        max_level: 2,
        min_patch: 9,
        ..RegistrationConfig::default()
    };
    let warp = register(cfg, &base, &source).warp;
    assert!(warp.max_norm() > 0.3, "{}", warp.max_norm());

    let once = warp.invert(1e-4, 100);
    let twice = once.field.invert(1e-4, 100);
    let diff = max_diff_inside(&twice.field, &warp, 4);
    assert!(diff < 0.05, "max diff {diff}");
}

#[test]
fn plus_minus_halves_recombine() {
    let base = blob(16.0, 16.0);
    let source = blob(16.8, 15.6);
    let cfg = RegistrationConfig {
        plus_minus: true,
        max_level: 2,
        min_patch: 9,
        ..RegistrationConfig::default()
    };
    let out = register(cfg, &base, &source);
    let pm = out.plus_minus.as_ref().unwrap();

    // Not a pure translation.
    let plus = pm.plus.component(0);
    let (lo, hi) = plus
        .iter()
        .fold((f32::MAX, f32::MIN), |(lo, hi), &v| (lo.min(v), hi.max(v)));
    assert!(hi - lo > 0.05, "plus warp is flat: {lo}..{hi}");

    let recombined = DisplacementField::compose(&out.warp, &pm.minus).unwrap();
    let diff = max_diff_inside(&recombined, &pm.plus, 4);
    assert!(diff < 0.03, "max |V o Wm - Wp| = {diff}");
}
