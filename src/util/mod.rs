//! Shared utility helpers.

pub mod error;
pub(crate) mod math;

pub use error::{QwarpError, Result as QwarpResult};
pub use math::Mat3;
