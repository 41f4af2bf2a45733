use qwarp::{
    Affine, DisplacementField, Grid, QwarpError, QwarpResult, TransformLoader, WarpChain,
};
use std::collections::HashMap;

struct MemoryLoader {
    warps: HashMap<&'static str, DisplacementField>,
    matrices: HashMap<&'static str, Affine>,
}

impl TransformLoader for MemoryLoader {
    fn load_warp(&self, name: &str) -> QwarpResult<DisplacementField> {
        self.warps.get(name).cloned().ok_or(QwarpError::TransformLoad {
            name: name.to_string(),
            reason: "not found".to_string(),
        })
    }

    fn load_matrix(&self, name: &str) -> QwarpResult<Affine> {
        self.matrices.get(name).copied().ok_or(QwarpError::TransformLoad {
            name: name.to_string(),
            reason: "not found".to_string(),
        })
    }
}

fn swirl(grid: Grid) -> DisplacementField {
    let [nx, ny, _] = grid.dims();
    let (cx, cy) = (nx as f32 / 2.0, ny as f32 / 2.0);
    DisplacementField::from_fn(grid, |i, j, _| {
        let dx = (i as f32 - cx) / cx;
        let dy = (j as f32 - cy) / cy;
        let fall = (-(dx * dx + dy * dy) * 3.0).exp();
        [-dy * 0.8 * fall, dx * 0.8 * fall, 0.0]
    })
}

fn loader(grid: Grid) -> MemoryLoader {
    let mut warps = HashMap::new();
    warps.insert("swirl", swirl(grid));
    let mut matrices = HashMap::new();
    matrices.insert(
        "shift.1D",
        Affine([[1.0, 0.0, 0.0, 0.5], [0.0, 1.0, 0.0, -0.25], [0.0, 0.0, 1.0, 0.0]]),
    );
    MemoryLoader { warps, matrices }
}

#[test]
fn warp_and_its_inverse_cancel() {
    let grid = Grid::new([24, 24, 8]).unwrap();
    let chain = WarpChain::parse("swirl INV(swirl)").unwrap();
    let total = chain.load(&loader(grid), 1e-4, 50).unwrap().evaluate(grid).unwrap();
    let inner = total.at(grid.index(15, 10, 4));
    assert!(inner.iter().all(|v| v.abs() < 1e-2), "{inner:?}");
}

#[test]
fn matrix_file_adds_a_translation() {
    let grid = Grid::new([16, 16, 4]).unwrap();
    let chain = WarpChain::parse("shift.1D IDENT(base)").unwrap();
    let total = chain.load(&loader(grid), 1e-4, 50).unwrap().evaluate(grid).unwrap();
    let d = total.at(grid.index(3, 7, 1));
    assert!((d[0] - 0.5).abs() < 1e-6 && (d[1] + 0.25).abs() < 1e-6, "{d:?}");
}

#[test]
fn inverse_matrix_is_resolved_at_load() {
    let grid = Grid::new([16, 16, 4]).unwrap();
    let chain = WarpChain::parse("INV(shift.1D) MATRIX(1 0 0 0.5 0 1 0 -0.25 0 0 1 0)").unwrap();
    let total = chain.load(&loader(grid), 1e-4, 50).unwrap().evaluate(grid).unwrap();
    assert!(total.max_norm() < 1e-5);
}

#[test]
fn missing_names_fail_to_load() {
    let grid = Grid::new([16, 16, 4]).unwrap();
    let chain = WarpChain::parse("nowhere").unwrap();
    assert!(matches!(
        chain.load(&loader(grid), 1e-4, 50),
        Err(QwarpError::TransformLoad { .. })
    ));
}

#[test]
fn larger_field_asks_for_padding() {
    let grid = Grid::new([16, 16, 4]).unwrap();
    let big = grid.padded([2, 3, 0, 0, 0, 0]).unwrap();
    let mut l = loader(grid);
    l.warps.insert("big", DisplacementField::identity(big));
    let loaded = WarpChain::parse("big").unwrap().load(&l, 1e-4, 50).unwrap();
    assert_eq!(loaded.required_pads(&grid).unwrap(), [2, 3, 0, 0, 0, 0]);
}
