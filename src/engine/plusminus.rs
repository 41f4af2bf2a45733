//! Plus-minus outputs.
//!
//! The optimization grows two coupled warps: the source is read through
//! `Wp` and the base through `Wm`, and every patch increment enters `Wp`
//! with a plus sign and `Wm` with a minus sign. The warp taking the base onto
//! the source is `V = Wp ∘ Wm⁻¹`.

use crate::resample::{Border, Interp};
use crate::trace::trace_warn;
use crate::util::QwarpResult;
use crate::volume::Volume;
use crate::warp::DisplacementField;

/// The two half warps and the images they produce.
#[derive(Clone, Debug)]
pub struct PlusMinusOutput {
    /// Source-side warp.
    pub plus: DisplacementField,
    /// Base-side warp.
    pub minus: DisplacementField,
    /// Base resampled through `minus`.
    pub warped_base: Volume,
    /// Source resampled through `plus`.
    pub warped_source: Volume,
}

impl PlusMinusOutput {
    /// Resamples both inputs through their half warps.
    pub(crate) fn new(
        plus: DisplacementField,
        minus: DisplacementField,
        base: &Volume,
        source: &Volume,
        interp: Interp,
    ) -> QwarpResult<Self> {
        let warped_base = minus.apply(base, interp, Border::Zero)?;
        let warped_source = plus.apply(source, interp, Border::Zero)?;
        Ok(Self {
            plus,
            minus,
            warped_base,
            warped_source,
        })
    }

    /// Crops or grows every field and image by `pads`.
    pub(crate) fn repad(&self, pads: [isize; 6], warps_too: bool) -> QwarpResult<Self> {
        let (plus, minus) = if warps_too {
            (self.plus.extend(pads)?, self.minus.extend(pads)?)
        } else {
            (self.plus.clone(), self.minus.clone())
        };
        Ok(Self {
            plus,
            minus,
            warped_base: self.warped_base.zeropad(pads)?,
            warped_source: self.warped_source.zeropad(pads)?,
        })
    }
}

/// Combined warp `Wp ∘ Wm⁻¹`, with the inversion residual.
pub(crate) fn combined_warp(
    plus: &DisplacementField,
    minus: &DisplacementField,
    tolerance: f64,
    max_iter: usize,
) -> QwarpResult<(DisplacementField, f64)> {
    let inv = minus.invert(tolerance, max_iter);
    if !inv.converged {
        trace_warn!(residual = inv.residual, "minus warp inversion did not converge");
    }
    let combined = DisplacementField::compose(plus, &inv.field)?;
    Ok((combined, inv.residual))
}

#[cfg(test)]
mod tests {
    use super::combined_warp;
    use crate::volume::Grid;
    use crate::warp::DisplacementField;

    #[test]
    fn opposite_shifts_combine_to_their_difference() {
        let grid = Grid::new([12, 12, 12]).unwrap();
        let plus = DisplacementField::from_fn(grid, |_, _, _| [0.4, 0.0, 0.0]);
        let minus = DisplacementField::from_fn(grid, |_, _, _| [-0.4, 0.0, 0.0]);
        let (v, residual) = combined_warp(&plus, &minus, 1e-4, 30).unwrap();
        assert!(residual < 1e-3);
        let d = v.at(grid.index(6, 6, 6));
        assert!((d[0] - 0.8).abs() < 1e-3, "{d:?}");
        assert!(d[1].abs() < 1e-6 && d[2].abs() < 1e-6);
    }
}
