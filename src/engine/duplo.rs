//! Half-resolution pre-pass.
//!
//! Base, source and weight are downsampled by two, the whole level sequence
//! runs on the coarse grid with a halved minimum patch, and the resulting
//! warp is upsampled to seed the full-resolution run.

use crate::engine::config::{RegistrationConfig, DEFAULT_MAX_LEVEL, PATCH_FLOOR};
use crate::engine::level::{run_levels, LevelContext, LevelReport, WarpState};
use crate::engine::pool::ScratchPool;
use crate::engine::schedule::{last_level, plan_levels};
use crate::metric::{Metric, MetricContext};
use crate::trace::{trace_event, trace_span};
use crate::util::math::make_odd_down;
use crate::util::QwarpResult;
use crate::volume::pyramid::downsample2;
use crate::volume::Volume;
use crate::warp::DisplacementField;
use crate::weight::normalize_weight;

/// True when every non-degenerate axis holds at least three minimum patches.
pub fn duplo_eligible(dims: [usize; 3], min_patch: usize) -> bool {
    dims.iter().all(|&n| n == 1 || n >= 3 * min_patch)
}

/// Minimum patch used on the coarse grid.
pub fn coarse_min_patch(min_patch: usize) -> usize {
    make_odd_down(min_patch / 2).max(PATCH_FLOOR)
}

/// Output of the coarse pass.
pub(crate) struct CoarseResult {
    /// Coarse warp upsampled to the fine grid.
    pub warp: DisplacementField,
    pub levels: Vec<LevelReport>,
    /// Level at which the fine run should start.
    pub next_level: usize,
}

/// Runs the coarse pass on already padded and smoothed images.
pub(crate) fn coarse_pass(
    base: &Volume,
    source: &Volume,
    weight: &Volume,
    metric: Metric,
    cfg: &RegistrationConfig,
    active_axes: [bool; 3],
    pool: &ScratchPool,
) -> QwarpResult<CoarseResult> {
    let cbase = downsample2(base)?;
    let csource = downsample2(source)?;
    let cweight = normalize_weight(downsample2(weight)?)?;
    let cdims = cbase.dims();
    let min_patch = coarse_min_patch(cfg.min_patch);
    let _span = trace_span!("duplo", dims = ?cdims, min_patch = min_patch).entered();

    let coarse_cfg = RegistrationConfig {
        min_patch,
        ..cfg.clone()
    };
    let metric_ctx = MetricContext::new(metric, &cbase, &csource, &cweight);
    let plans = plan_levels(cdims, min_patch, 0, DEFAULT_MAX_LEVEL);
    let final_level = plans.last().map_or(0, |p| p.level);
    let ctx = LevelContext {
        base: &cbase,
        source: &csource,
        weight: &cweight,
        metric: &metric_ctx,
        cfg: &coarse_cfg,
        active_axes: [0, 1, 2].map(|a| active_axes[a] && cdims[a] > 1),
        final_level,
        pool,
    };
    let mut state = WarpState {
        plus: DisplacementField::identity(*cbase.grid()),
        minus: None,
    };
    let levels = run_levels(&ctx, &plans, &mut state, None);
    let warp = state.plus.upsample2(*base.grid())?;

    let fine_last = last_level(base.dims(), cfg.min_patch);
    let next_level = (final_level + 1).min(fine_last);
    trace_event!("duplo_done", coarse_levels = levels.len(), next_level = next_level);
    Ok(CoarseResult {
        warp,
        levels,
        next_level,
    })
}

#[cfg(test)]
mod tests {
    use super::{coarse_min_patch, duplo_eligible};

    #[test]
    fn coarse_patch_is_halved_and_floored() {
        assert_eq!(coarse_min_patch(25), 11);
        assert_eq!(coarse_min_patch(31), 15);
        assert_eq!(coarse_min_patch(9), 9);
    }

    #[test]
    fn eligibility_needs_three_patches_per_axis() {
        assert!(duplo_eligible([75, 80, 1], 25));
        assert!(!duplo_eligible([75, 74, 90], 25));
    }
}
