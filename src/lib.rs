//! Qwarp is a CPU-first nonlinear volume registration library.
//!
//! A source volume is aligned to a base volume by a displacement field built
//! from many small polynomial patch warps, composed level by level from the
//! whole grid down to a minimum patch size. Each patch minimizes a weighted
//! similarity cost plus a Neo-Hookean deformation penalty that keeps the
//! warp invertible.
//!
//! Optional features: `rayon` (parallel patch waves and output resampling),
//! `simd` (vectorized correlation moments), `image-io` (2D grayscale I/O) and
//! `tracing` (spans and events).

pub mod basis;
pub mod engine;
pub mod kernel;
pub mod metric;
pub mod optim;
pub mod penalty;
pub mod resample;
mod trace;
pub mod util;
pub mod volume;
pub mod warp;
pub mod weight;

pub use basis::{BasisKind, PatchBasis, PatchBox};
pub use engine::{
    LevelRange, LevelReport, LevelSnapshot, NegativeHandling, PlusMinusOutput, PreAlign,
    PreAligned, PreAligner, RegistrationConfig, RegistrationInput, RegistrationOutput, RunReport,
    Warper,
};
pub use metric::{Metric, MetricContext, PatchSamples};
pub use optim::{minimize, OptimizeResult, OptimizerConfig};
pub use penalty::PenaltyConfig;
pub use resample::{Border, Interp};
pub use util::{Mat3, QwarpError, QwarpResult};
pub use volume::filter::Smoothing;
pub use volume::{Affine, Grid, Pads, Volume};
pub use warp::catenate::{ChainItem, LoadedChain, LoadedTransform, TransformLoader, WarpChain};
pub use warp::{DisplacementField, Inversion};
pub use weight::{auto_weight, normalize_weight, WeightConfig};
