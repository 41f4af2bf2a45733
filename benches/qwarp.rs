use criterion::{criterion_group, criterion_main, Criterion};
use qwarp::{
    Border, DisplacementField, Grid, Interp, OptimizerConfig, RegistrationConfig,
    RegistrationInput, Volume, Warper,
};
use std::hint::black_box;

fn make_volume(dims: [usize; 3]) -> Volume {
    let grid = Grid::new(dims).unwrap();
    Volume::from_fn(grid, |i, j, k| {
        let x = i as f32 * 0.31;
        let y = j as f32 * 0.23;
        let z = k as f32 * 0.17;
        100.0 + 40.0 * (x.sin() * y.cos() + 0.5 * (x + z).cos())
    })
}

fn swirl(grid: Grid, amount: f32) -> DisplacementField {
    let [nx, ny, _] = grid.dims();
    let (cx, cy) = (nx as f32 / 2.0, ny as f32 / 2.0);
    DisplacementField::from_fn(grid, |i, j, _| {
        let dx = (i as f32 - cx) / cx;
        let dy = (j as f32 - cy) / cy;
        let fall = (-(dx * dx + dy * dy) * 2.0).exp();
        [-dy * amount * fall, dx * amount * fall, 0.0]
    })
}

fn bench_resample(c: &mut Criterion) {
    let vol = make_volume([48, 48, 32]);
    let field = swirl(*vol.grid(), 1.5);

    for (name, interp) in [
        ("apply_linear", Interp::Linear),
        ("apply_cubic", Interp::Cubic),
        ("apply_wsinc5", Interp::WSinc5),
    ] {
        c.bench_function(name, |b| {
            b.iter(|| black_box(field.apply(&vol, interp, Border::Zero).unwrap()));
        });
    }

    c.bench_function("compose_fields", |b| {
        b.iter(|| black_box(DisplacementField::compose(&field, &field).unwrap()));
    });

    c.bench_function("invert_field", |b| {
        b.iter(|| black_box(field.invert(1e-3, 40)));
    });
}

fn bench_register(c: &mut Criterion) {
    let base = make_volume([40, 40, 1]);
    let source = swirl(*base.grid(), 1.0)
        .apply(&base, Interp::Cubic, Border::Extend)
        .unwrap();

    let config = RegistrationConfig {
        max_level: 2,
        min_patch: 15,
        blur_base: 0.0,
        blur_source: 0.0,
        optimizer: OptimizerConfig {
            evals_per_param: 8,
            ..OptimizerConfig::default()
        },
        ..RegistrationConfig::default()
    };
    let warper = Warper::new().with_config(config.clone());
    c.bench_function("register_planar_40_levels_0_2", |b| {
        b.iter(|| black_box(warper.register(RegistrationInput::new(&base, &source)).unwrap()));
    });

    if cfg!(feature = "rayon") {
        let warper_par = Warper::new().with_config(RegistrationConfig {
            parallel: true,
            ..config
        });
        c.bench_function("register_planar_40_levels_0_2_parallel", |b| {
            b.iter(|| {
                black_box(
                    warper_par
                        .register(RegistrationInput::new(&base, &source))
                        .unwrap(),
                )
            });
        });
    }
}

criterion_group!(benches, bench_resample, bench_register);
criterion_main!(benches);
