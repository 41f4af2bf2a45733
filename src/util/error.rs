//! Error types for qwarp.

use thiserror::Error;

/// Result alias for qwarp operations.
pub type Result<T> = std::result::Result<T, QwarpError>;

/// Errors that can occur while preparing or running a registration.
///
/// Every variant is fatal for the call that returns it. Per-patch optimizer
/// failures and inversion non-convergence are not errors; they are reported
/// through [`crate::engine::RunReport`] instead.
#[derive(Debug, Error, PartialEq)]
pub enum QwarpError {
    /// Volume dimensions are zero or overflow.
    #[error("invalid dimensions: {nx}x{ny}x{nz}")]
    InvalidDimensions { nx: usize, ny: usize, nz: usize },
    /// The provided buffer does not match the requested dimensions.
    #[error("buffer too small: needed {needed}, got {got}")]
    BufferTooSmall { needed: usize, got: usize },
    /// Two inputs that must share a sampling grid do not.
    #[error("grid mismatch for {what}: expected {expected:?}, got {got:?}")]
    GridMismatch {
        what: &'static str,
        expected: [usize; 3],
        got: [usize; 3],
    },
    /// Two grids are not related by an integer voxel offset.
    #[error("grid of {what} does not conform with the base grid")]
    NonConformingGrid { what: &'static str },
    /// No axis is long enough to hold the smallest allowed patch.
    #[error("grid {dims:?} is too small for warping")]
    GridTooSmall { dims: [usize; 3] },
    /// A configuration value is out of range or inconsistent with the inputs.
    #[error("invalid configuration: {0}")]
    InvalidConfig(String),
    /// Two options were requested that cannot be combined.
    #[error("conflicting options: {0}")]
    ConflictingOptions(&'static str),
    /// The weight volume has no positive entry.
    #[error("weight volume is not positive anywhere")]
    ZeroWeight,
    /// A volume is unusable for the requested operation.
    #[error("degenerate volume: {reason}")]
    DegenerateVolume { reason: &'static str },
    /// A catenated warp string could not be parsed.
    #[error("warp chain syntax error at byte {pos}: {reason}")]
    CatenationSyntax { pos: usize, reason: &'static str },
    /// A named transform in a warp chain could not be loaded.
    #[error("cannot load transform '{name}': {reason}")]
    TransformLoad { name: String, reason: String },
    /// The affine pre-alignment step failed or produced no usable output.
    #[error("affine pre-alignment failed: {reason}")]
    PreAlign { reason: String },
    /// Image decoding or encoding failed.
    #[cfg(feature = "image-io")]
    #[error("image io: {reason}")]
    ImageIo { reason: String },
}
