use qwarp::{Grid, Metric, MetricContext, PatchBox, PatchSamples, Volume};

const DIMS: [usize; 3] = [30, 30, 1];

fn pattern(shift: f32, invert: bool) -> Volume {
    let grid = Grid::new(DIMS).unwrap();
    Volume::from_fn(grid, |i, j, _| {
        let x = i as f32 + shift;
        let y = j as f32;
        let v = 50.0 + 20.0 * (x * 0.35).sin() * (y * 0.25).cos() + 0.5 * x;
        if invert {
            150.0 - v
        } else {
            v
        }
    })
}

fn cost(metric: Metric, base: &Volume, source: &Volume) -> f64 {
    let grid = Grid::new(DIMS).unwrap();
    let weight = Volume::from_fn(grid, |_, _, _| 1.0);
    let ctx = MetricContext::new(metric, base, source, &weight);
    let pbox = PatchBox {
        start: [0, 0, 0],
        width: DIMS,
    };
    let samples = PatchSamples::new(&ctx, base, &weight, &pbox);
    let mut src: Vec<f32> = samples
        .offsets()
        .iter()
        .map(|o| source.at(o[0] as usize, o[1] as usize, o[2] as usize))
        .collect();
    ctx.cost(&samples, &mut src)
}

#[test]
fn same_contrast_prefers_alignment() {
    let base = pattern(0.0, false);
    let aligned = pattern(0.0, false);
    let shifted = pattern(3.0, false);
    for metric in [
        Metric::ClippedPearson,
        Metric::Pearson,
        Metric::Hellinger,
        Metric::MutualInfo,
        Metric::NormalizedMutualInfo,
        Metric::LocalPearsonMax,
    ] {
        let good = cost(metric, &base, &aligned);
        let bad = cost(metric, &base, &shifted);
        assert!(good < bad, "{metric:?}: {good} vs {bad}");
    }
}

#[test]
fn inverted_contrast_needs_a_statistical_metric() {
    let base = pattern(0.0, false);
    let aligned = pattern(0.0, true);
    let shifted = pattern(3.0, true);
    for metric in [
        Metric::Hellinger,
        Metric::MutualInfo,
        Metric::NormalizedMutualInfo,
        Metric::LocalPearsonMin,
    ] {
        let good = cost(metric, &base, &aligned);
        let bad = cost(metric, &base, &shifted);
        assert!(good < bad, "{metric:?}: {good} vs {bad}");
    }
    // Plain correlation is maximally wrong on inverted contrast.
    assert!(cost(Metric::Pearson, &base, &aligned) > 0.99);
}
