//! Parser and evaluator for catenated warp strings.
//!
//! A chain is a whitespace-separated list of items, the rightmost applied
//! first:
//!
//! ```text
//! item  := "INV(" item ")" | "IDENT(" name ")" | "MATRIX(" 12 numbers ")" | name
//! ```
//!
//! Names ending in `.1D` or `.txt` are 3x4 affine matrix files; every other
//! name is a displacement field. Loading is delegated to a
//! [`TransformLoader`] so the parser stays free of file formats.

use crate::util::{QwarpError, QwarpResult};
use crate::volume::{Affine, Grid, Pads};
use crate::warp::DisplacementField;

/// One parsed chain item.
#[derive(Clone, Debug, PartialEq)]
pub enum ChainItem {
    /// Named displacement field.
    Warp(String),
    /// Named affine matrix file.
    MatrixFile(String),
    /// Inline affine matrix (row-major 3x4, world coordinates).
    Matrix(Affine),
    /// Identity on the named dataset's grid.
    Identity(String),
    /// Inverse of the wrapped item.
    Inverse(Box<ChainItem>),
}

/// Parsed chain, stored left to right as written.
#[derive(Clone, Debug, PartialEq)]
pub struct WarpChain {
    items: Vec<ChainItem>,
}

/// Source of named transforms.
pub trait TransformLoader {
    /// Loads a displacement field (voxel units of its own grid).
    fn load_warp(&self, name: &str) -> QwarpResult<DisplacementField>;
    /// Loads a world-space affine matrix.
    fn load_matrix(&self, name: &str) -> QwarpResult<Affine>;
}

/// A chain item after loading.
#[derive(Clone, Debug)]
pub enum LoadedTransform {
    Field(DisplacementField),
    Affine(Affine),
    Identity,
}

/// Chain with every named transform loaded and inverses resolved.
#[derive(Clone, Debug)]
pub struct LoadedChain {
    transforms: Vec<LoadedTransform>,
}

fn is_matrix_name(name: &str) -> bool {
    let lower = name.to_ascii_lowercase();
    lower.ends_with(".1d") || lower.ends_with(".txt")
}

struct Parser<'a> {
    src: &'a str,
    pos: usize,
}

impl<'a> Parser<'a> {
    fn rest(&self) -> &'a str {
        &self.src[self.pos..]
    }

    fn skip_ws(&mut self) {
        let trimmed = self.rest().trim_start();
        self.pos = self.src.len() - trimmed.len();
    }

    fn err(&self, reason: &'static str) -> QwarpError {
        QwarpError::CatenationSyntax {
            pos: self.pos,
            reason,
        }
    }

    fn eat(&mut self, prefix: &str) -> bool {
        if self.rest().starts_with(prefix) {
            self.pos += prefix.len();
            true
        } else {
            false
        }
    }

    fn expect_close(&mut self) -> QwarpResult<()> {
        self.skip_ws();
        if self.eat(")") {
            Ok(())
        } else {
            Err(self.err("expected ')'"))
        }
    }

    fn name(&mut self) -> QwarpResult<String> {
        self.skip_ws();
        let rest = self.rest();
        let len = rest
            .find(|c: char| c.is_whitespace() || c == '(' || c == ')')
            .unwrap_or(rest.len());
        if len == 0 {
            return Err(self.err("expected a transform name"));
        }
        self.pos += len;
        Ok(rest[..len].to_string())
    }

    fn item(&mut self) -> QwarpResult<ChainItem> {
        self.skip_ws();
        if self.eat("INV(") {
            let inner = self.item()?;
            self.expect_close()?;
            return Ok(ChainItem::Inverse(Box::new(inner)));
        }
        if self.eat("IDENT(") {
            let name = self.name()?;
            self.expect_close()?;
            return Ok(ChainItem::Identity(name));
        }
        if self.eat("MATRIX(") {
            return self.matrix();
        }
        let name = self.name()?;
        if is_matrix_name(&name) {
            Ok(ChainItem::MatrixFile(name))
        } else {
            Ok(ChainItem::Warp(name))
        }
    }

    fn matrix(&mut self) -> QwarpResult<ChainItem> {
        let rest = self.rest();
        let end = rest.find(')').ok_or_else(|| self.err("unterminated MATRIX("))?;
        let values: Vec<f64> = rest[..end]
            .split(|c: char| c == ',' || c.is_whitespace())
            .filter(|s| !s.is_empty())
            .map(str::parse)
            .collect::<Result<_, _>>()
            .map_err(|_| self.err("MATRIX( entries must be numbers"))?;
        if values.len() != 12 {
            return Err(self.err("MATRIX( needs exactly 12 numbers"));
        }
        self.pos += end + 1;
        let mut m = [[0.0f64; 4]; 3];
        for (r, row) in m.iter_mut().enumerate() {
            row.copy_from_slice(&values[4 * r..4 * r + 4]);
        }
        Ok(ChainItem::Matrix(Affine(m)))
    }
}

impl WarpChain {
    /// Parses a chain string.
    pub fn parse(src: &str) -> QwarpResult<Self> {
        let mut parser = Parser { src, pos: 0 };
        let mut items = Vec::new();
        loop {
            parser.skip_ws();
            if parser.rest().is_empty() {
                break;
            }
            if parser.rest().starts_with(')') {
                return Err(parser.err("unbalanced ')'"));
            }
            items.push(parser.item()?);
        }
        if items.is_empty() {
            return Err(QwarpError::CatenationSyntax {
                pos: 0,
                reason: "empty warp chain",
            });
        }
        Ok(Self { items })
    }

    /// Items as written, leftmost first.
    pub fn items(&self) -> &[ChainItem] {
        &self.items
    }

    /// Loads every item and resolves inverses.
    pub fn load(
        &self,
        loader: &dyn TransformLoader,
        invert_tolerance: f64,
        invert_max_iter: usize,
    ) -> QwarpResult<LoadedChain> {
        let transforms = self
            .items
            .iter()
            .map(|item| load_item(item, loader, invert_tolerance, invert_max_iter))
            .collect::<QwarpResult<Vec<_>>>()?;
        Ok(LoadedChain { transforms })
    }
}

fn load_item(
    item: &ChainItem,
    loader: &dyn TransformLoader,
    tol: f64,
    max_iter: usize,
) -> QwarpResult<LoadedTransform> {
    Ok(match item {
        ChainItem::Warp(name) => LoadedTransform::Field(loader.load_warp(name)?),
        ChainItem::MatrixFile(name) => LoadedTransform::Affine(loader.load_matrix(name)?),
        ChainItem::Matrix(m) => LoadedTransform::Affine(*m),
        ChainItem::Identity(_) => LoadedTransform::Identity,
        ChainItem::Inverse(inner) => match load_item(inner, loader, tol, max_iter)? {
            LoadedTransform::Field(f) => LoadedTransform::Field(f.invert(tol, max_iter).field),
            LoadedTransform::Affine(m) => {
                LoadedTransform::Affine(m.inverse().ok_or_else(|| QwarpError::TransformLoad {
                    name: "INV(matrix)".to_string(),
                    reason: "matrix is singular".to_string(),
                })?)
            }
            LoadedTransform::Identity => LoadedTransform::Identity,
        },
    })
}

impl LoadedChain {
    /// Extra padding `grid` needs so every loaded field fits inside it.
    ///
    /// Fields that do not conform to `grid` are an error.
    pub fn required_pads(&self, grid: &Grid) -> QwarpResult<Pads> {
        let mut need = [0isize; 6];
        for t in &self.transforms {
            if let LoadedTransform::Field(f) = t {
                let pads = f
                    .grid()
                    .pads_to(grid)
                    .ok_or(QwarpError::NonConformingGrid { what: "initial warp" })?;
                for (n, p) in need.iter_mut().zip(pads) {
                    // A negative pad means the field sticks out on that face.
                    *n = (*n).max(-p);
                }
            }
        }
        Ok(need)
    }

    /// Composes the chain onto `grid`, rightmost transform first.
    ///
    /// Fields smaller than `grid` are extended by linear extrapolation;
    /// larger ones are cropped.
    pub fn evaluate(&self, grid: Grid) -> QwarpResult<DisplacementField> {
        let mut total = DisplacementField::identity(grid);
        for t in self.transforms.iter().rev() {
            let field = match t {
                LoadedTransform::Identity => continue,
                LoadedTransform::Affine(m) => DisplacementField::from_affine(grid, m)?,
                LoadedTransform::Field(f) => {
                    let pads = f
                        .grid()
                        .pads_to(&grid)
                        .ok_or(QwarpError::NonConformingGrid { what: "initial warp" })?;
                    if pads == [0; 6] {
                        f.clone()
                    } else {
                        f.extend(pads)?
                    }
                }
            };
            total = DisplacementField::compose(&field, &total)?;
        }
        Ok(total)
    }
}
