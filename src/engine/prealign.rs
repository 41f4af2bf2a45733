//! Affine pre-alignment.
//!
//! An external affine registration can run before the nonlinear one. It
//! returns the source resampled onto the base grid, which replaces the
//! source for the whole run, and the affine matrix it found. The matrix is
//! composed into the output warp so the result maps base coordinates onto
//! the original source.

use std::fmt;

use crate::util::{QwarpError, QwarpResult};
use crate::volume::{Affine, Volume};

/// Pre-alignment request.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct PreAlign {
    /// Extra options handed verbatim to the aligner.
    pub extra_opts: String,
    /// Only resample the source onto the base grid; no affine is fitted.
    pub resample_only: bool,
}

/// What a [`PreAligner`] produces.
#[derive(Clone, Debug)]
pub struct PreAligned {
    /// Source resampled onto the base grid.
    pub source: Volume,
    /// World-space map from base coordinates to source coordinates. Absent
    /// when only resampling.
    pub matrix: Option<Affine>,
}

/// Runs the affine step, usually by calling out to another program.
///
/// The call is synchronous. Any failure is fatal for the registration.
pub trait PreAligner: fmt::Debug + Sync {
    fn prealign(&self, base: &Volume, source: &Volume, opts: &PreAlign)
        -> QwarpResult<PreAligned>;
}

/// Pre-alignment state carried to the output stage.
#[derive(Debug)]
pub(crate) struct Alignment<'a> {
    pub matrix: Affine,
    /// Original source, when it lies on the base grid and can be resampled
    /// through the composed warp directly.
    pub original: Option<&'a Volume>,
}

/// Calls `aligner` and checks what it returned.
///
/// Resampling is skipped when the source already lies on the base grid.
pub(crate) fn run_prealign(
    aligner: &dyn PreAligner,
    base: &Volume,
    source: &Volume,
    opts: &PreAlign,
    warnings: &mut Vec<String>,
) -> QwarpResult<Option<PreAligned>> {
    if opts.resample_only && source.grid() == base.grid() {
        warnings.push("source is already on the base grid; resampling skipped".into());
        return Ok(None);
    }
    let mut out = aligner.prealign(base, source, opts)?;
    if out.source.dims() != base.dims() {
        return Err(QwarpError::PreAlign {
            reason: format!(
                "aligned source has dims {:?}, base has {:?}",
                out.source.dims(),
                base.dims()
            ),
        });
    }
    if opts.resample_only {
        out.matrix = None;
    } else if out.matrix.is_none() {
        return Err(QwarpError::PreAlign {
            reason: "no affine matrix was produced".into(),
        });
    }
    // The aligner may tag its output with its own geometry; the samples are
    // on the base grid either way.
    out.source = Volume::new(*base.grid(), out.source.into_data())?;
    Ok(Some(out))
}

#[cfg(test)]
mod tests {
    use super::{run_prealign, PreAlign, PreAligned, PreAligner};
    use crate::util::{QwarpError, QwarpResult};
    use crate::volume::{Affine, Grid, Volume};

    #[derive(Debug)]
    struct Fixed {
        dims: [usize; 3],
        matrix: Option<Affine>,
    }

    impl PreAligner for Fixed {
        fn prealign(&self, _: &Volume, _: &Volume, _: &PreAlign) -> QwarpResult<PreAligned> {
            let grid = Grid::new(self.dims)?;
            Ok(PreAligned {
                source: Volume::zeros(grid),
                matrix: self.matrix,
            })
        }
    }

    fn vol(dims: [usize; 3]) -> Volume {
        Volume::zeros(Grid::new(dims).unwrap())
    }

    #[test]
    fn wrong_grid_is_rejected() {
        let aligner = Fixed {
            dims: [10, 10, 10],
            matrix: Some(Affine::IDENTITY),
        };
        let err = run_prealign(
            &aligner,
            &vol([12, 12, 12]),
            &vol([14, 14, 14]),
            &PreAlign::default(),
            &mut Vec::new(),
        )
        .unwrap_err();
        assert!(matches!(err, QwarpError::PreAlign { .. }));
    }

    #[test]
    fn registration_needs_a_matrix() {
        let aligner = Fixed {
            dims: [12, 12, 12],
            matrix: None,
        };
        let err = run_prealign(
            &aligner,
            &vol([12, 12, 12]),
            &vol([14, 14, 14]),
            &PreAlign::default(),
            &mut Vec::new(),
        )
        .unwrap_err();
        assert!(matches!(err, QwarpError::PreAlign { .. }));
    }

    #[test]
    fn resampling_on_the_same_grid_is_skipped() {
        let aligner = Fixed {
            dims: [1, 1, 1],
            matrix: None,
        };
        let opts = PreAlign {
            resample_only: true,
            ..Default::default()
        };
        let mut warnings = Vec::new();
        let out = run_prealign(
            &aligner,
            &vol([12, 12, 12]),
            &vol([12, 12, 12]),
            &opts,
            &mut warnings,
        )
        .unwrap();
        assert!(out.is_none());
        assert_eq!(warnings.len(), 1);
    }

    #[test]
    fn resampling_drops_any_matrix() {
        let aligner = Fixed {
            dims: [12, 12, 12],
            matrix: Some(Affine::IDENTITY),
        };
        let opts = PreAlign {
            resample_only: true,
            ..Default::default()
        };
        let out = run_prealign(
            &aligner,
            &vol([12, 12, 12]),
            &vol([20, 20, 20]),
            &opts,
            &mut Vec::new(),
        )
        .unwrap()
        .unwrap();
        assert!(out.matrix.is_none());
        assert_eq!(out.source.dims(), [12, 12, 12]);
    }
}
