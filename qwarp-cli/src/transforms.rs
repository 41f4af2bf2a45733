//! On-disk warp records and the file-backed transform loader.

use qwarp::{Affine, DisplacementField, Grid, QwarpError, QwarpResult, TransformLoader};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};

/// Displacement field as JSON: grid dimensions, index-to-world affine and
/// the three displacement components in voxel units, x fastest.
#[derive(Debug, Deserialize, Serialize)]
pub struct WarpFile {
    pub dims: [usize; 3],
    pub affine: [[f64; 4]; 3],
    pub dx: Vec<f32>,
    pub dy: Vec<f32>,
    pub dz: Vec<f32>,
}

impl WarpFile {
    pub fn from_field(field: &DisplacementField) -> Self {
        let [dx, dy, dz] = field.components().map(|c| c.to_vec());
        Self {
            dims: field.dims(),
            affine: field.grid().affine().0,
            dx,
            dy,
            dz,
        }
    }

    pub fn into_field(self) -> QwarpResult<DisplacementField> {
        let grid = Grid::with_affine(self.dims, Affine(self.affine))?;
        DisplacementField::from_components(grid, [self.dx, self.dy, self.dz])
    }
}

pub fn write_warp(path: &Path, field: &DisplacementField) -> Result<(), Box<dyn std::error::Error>> {
    let json = serde_json::to_string(&WarpFile::from_field(field))?;
    fs::write(path, json)?;
    Ok(())
}

/// Parses a 3x4 matrix file: twelve numbers, row major, `#` starts a
/// comment.
pub fn parse_matrix(text: &str) -> Result<Affine, String> {
    let values: Vec<f64> = text
        .lines()
        .map(|line| line.split('#').next().unwrap_or(""))
        .flat_map(str::split_whitespace)
        .map(|tok| tok.parse::<f64>().map_err(|e| format!("'{tok}': {e}")))
        .collect::<Result<_, _>>()?;
    if values.len() != 12 {
        return Err(format!("expected 12 numbers, found {}", values.len()));
    }
    let mut m = [[0.0f64; 4]; 3];
    for (slot, v) in m.iter_mut().flatten().zip(values) {
        *slot = v;
    }
    Ok(Affine(m))
}

/// Resolves chain names relative to a directory.
pub struct FileLoader {
    pub root: PathBuf,
}

impl FileLoader {
    fn read(&self, name: &str) -> QwarpResult<String> {
        fs::read_to_string(self.root.join(name)).map_err(|e| QwarpError::TransformLoad {
            name: name.to_string(),
            reason: e.to_string(),
        })
    }
}

impl TransformLoader for FileLoader {
    fn load_warp(&self, name: &str) -> QwarpResult<DisplacementField> {
        let text = self.read(name)?;
        let file: WarpFile =
            serde_json::from_str(&text).map_err(|e| QwarpError::TransformLoad {
                name: name.to_string(),
                reason: e.to_string(),
            })?;
        file.into_field()
    }

    fn load_matrix(&self, name: &str) -> QwarpResult<Affine> {
        let text = self.read(name)?;
        parse_matrix(&text).map_err(|reason| QwarpError::TransformLoad {
            name: name.to_string(),
            reason,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::{parse_matrix, WarpFile};
    use qwarp::{DisplacementField, Grid};

    #[test]
    fn matrix_files_allow_comments() {
        let m = parse_matrix("# shift\n1 0 0 2\n0 1 0 0 # row\n0 0 1 0\n").unwrap();
        assert_eq!(m.0[0], [1.0, 0.0, 0.0, 2.0]);
        assert!(parse_matrix("1 2 3").is_err());
    }

    #[test]
    fn warp_record_round_trips() {
        let grid = Grid::new([3, 2, 1]).unwrap();
        let field = DisplacementField::from_fn(grid, |i, j, _| [i as f32, j as f32, 0.0]);
        let json = serde_json::to_string(&WarpFile::from_field(&field)).unwrap();
        let back: WarpFile = serde_json::from_str(&json).unwrap();
        assert_eq!(back.into_field().unwrap().components(), field.components());
    }
}
