use qwarp::basis::PatchBox;
use qwarp::engine::schedule::{last_level, level_widths, plan_levels};

fn overlaps(a: &PatchBox, b: &PatchBox) -> bool {
    (0..3).all(|ax| {
        a.start[ax] < b.start[ax] + b.width[ax] && b.start[ax] < a.start[ax] + a.width[ax]
    })
}

#[test]
fn every_level_covers_the_grid() {
    let dims = [61, 47, 33];
    let plans = plan_levels(dims, 13, 0, 99);
    assert_eq!(plans.len(), last_level(dims, 13) + 1);
    for plan in &plans {
        let mut hit = vec![false; dims[0] * dims[1] * dims[2]];
        for b in &plan.boxes {
            for k in b.start[2]..b.start[2] + b.width[2] {
                for j in b.start[1]..b.start[1] + b.width[1] {
                    for i in b.start[0]..b.start[0] + b.width[0] {
                        hit[i + dims[0] * (j + dims[1] * k)] = true;
                    }
                }
            }
        }
        assert!(hit.iter().all(|&h| h), "level {} leaves holes", plan.level);
    }
}

#[test]
fn waves_partition_the_boxes_without_overlap() {
    for plan in plan_levels([40, 40, 1], 9, 0, 99) {
        let mut seen: Vec<usize> = plan.waves.iter().flatten().copied().collect();
        seen.sort_unstable();
        assert_eq!(seen, (0..plan.boxes.len()).collect::<Vec<_>>());
        for wave in &plan.waves {
            for (n, &a) in wave.iter().enumerate() {
                for &b in &wave[n + 1..] {
                    assert!(!overlaps(&plan.boxes[a], &plan.boxes[b]));
                }
            }
        }
    }
}

#[test]
fn widths_are_odd_and_never_increase() {
    let dims = [80, 64, 50];
    let mut prev = dims;
    for level in 1..=last_level(dims, 15) {
        let w = level_widths(dims, level, 15);
        for ax in 0..3 {
            assert!(w[ax] <= prev[ax]);
            assert!(w[ax] >= 15);
            assert_eq!(w[ax] % 2, 1, "{w:?} at level {level}");
        }
        prev = w;
    }
}

#[test]
fn starting_level_and_cap_trim_the_plan() {
    let dims = [50, 50, 50];
    let plans = plan_levels(dims, 9, 2, 4);
    let levels: Vec<usize> = plans.iter().map(|p| p.level).collect();
    assert_eq!(levels, vec![2, 3, 4]);
    assert!(plan_levels(dims, 9, last_level(dims, 9) + 1, 99).is_empty());
}
