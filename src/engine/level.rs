//! Level driver: sweeps the patch lattice and folds accepted patches into
//! the running warp.
//!
//! Patches of one wave never overlap. They are all solved against the warp
//! as it stood at the start of the wave, then written back in visiting
//! order, so serial and parallel runs produce the same field.

use crate::basis::{BasisKind, PatchBox};
use crate::engine::config::RegistrationConfig;
use crate::engine::patch::{solve_patch, Current, PatchOutcome, Problem};
use crate::engine::pool::ScratchPool;
use crate::engine::schedule::{waves, LevelPlan};
use crate::metric::MetricContext;
use crate::trace::{trace_event, trace_span};
use crate::volume::Volume;
use crate::warp::DisplacementField;

#[cfg(feature = "rayon")]
use rayon::prelude::*;

/// Summary of one level.
#[derive(Clone, Debug, PartialEq)]
pub struct LevelReport {
    pub level: usize,
    pub patch_width: [usize; 3],
    /// Patches visited, over all sweeps.
    pub patches: usize,
    pub skipped: usize,
    pub improved: usize,
    /// Cost evaluations.
    pub evaluations: usize,
    /// Free parameters optimized.
    pub parameters: usize,
    /// Summed starting cost of optimized patches.
    pub cost_before: f64,
    /// Summed final cost of optimized patches.
    pub cost_after: f64,
    /// Quintic basis won at least once.
    pub used_quintic: bool,
}

impl LevelReport {
    fn new(plan: &LevelPlan) -> Self {
        Self {
            level: plan.level,
            patch_width: plan.widths,
            patches: 0,
            skipped: 0,
            improved: 0,
            evaluations: 0,
            parameters: 0,
            cost_before: 0.0,
            cost_after: 0.0,
            used_quintic: false,
        }
    }
}

/// Warp(s) being refined.
#[derive(Clone, Debug)]
pub(crate) struct WarpState {
    pub plus: DisplacementField,
    /// Base-side warp in plus-minus mode.
    pub minus: Option<DisplacementField>,
}

impl WarpState {
    fn current(&self) -> Current<'_> {
        match &self.minus {
            Some(minus) => Current::PlusMinus {
                plus: &self.plus,
                minus,
            },
            None => Current::Single(&self.plus),
        }
    }
}

/// Images and settings shared by all levels of one resolution.
pub(crate) struct LevelContext<'a> {
    pub base: &'a Volume,
    pub source: &'a Volume,
    pub weight: &'a Volume,
    pub metric: &'a MetricContext,
    pub cfg: &'a RegistrationConfig,
    pub active_axes: [bool; 3],
    /// Last level of this run, for the final-level basis choice.
    pub final_level: usize,
    pub pool: &'a ScratchPool,
}

/// Bases to try at `level`.
pub(crate) fn basis_kinds(
    cfg: &RegistrationConfig,
    level: usize,
    final_level: usize,
) -> &'static [BasisKind] {
    if cfg.quintic_only {
        &[BasisKind::Quintic]
    } else if level == 0 && cfg.quintic_level0 {
        &[BasisKind::Cubic, BasisKind::Quintic]
    } else if level == final_level && level > 0 && cfg.quintic_final {
        &[BasisKind::Quintic]
    } else {
        &[BasisKind::Cubic]
    }
}

/// Runs one level, including the reverse sweep when requested.
pub(crate) fn run_level(ctx: &LevelContext<'_>, plan: &LevelPlan, state: &mut WarpState) -> LevelReport {
    let level = plan.level;
    let _span = trace_span!("level", level = level, patches = plan.boxes.len()).entered();
    let problem = Problem {
        base: ctx.base,
        source: ctx.source,
        weight: ctx.weight,
        metric: ctx.metric,
        penalty: ctx.cfg.penalty,
        level,
        active_axes: ctx.active_axes,
        interp: ctx.cfg.inner_interp,
        optimizer: ctx.cfg.optimizer,
        effort: ctx.cfg.effort(level),
    };
    let kinds = basis_kinds(ctx.cfg, level, ctx.final_level);
    let mut report = LevelReport::new(plan);

    sweep(ctx, &problem, kinds, &plan.boxes, &plan.waves, state, &mut report);
    if ctx.cfg.reverse_sweep(level) && plan.boxes.len() > 1 {
        let reversed: Vec<PatchBox> = plan.boxes.iter().rev().copied().collect();
        let groups = waves(&reversed);
        sweep(ctx, &problem, kinds, &reversed, &groups, state, &mut report);
    }

    trace_event!(
        "level_done",
        level = level,
        improved = report.improved,
        skipped = report.skipped,
        cost_before = report.cost_before,
        cost_after = report.cost_after
    );
    report
}

fn sweep(
    ctx: &LevelContext<'_>,
    problem: &Problem<'_>,
    kinds: &[BasisKind],
    boxes: &[PatchBox],
    groups: &[Vec<usize>],
    state: &mut WarpState,
    report: &mut LevelReport,
) {
    for wave in groups {
        let outcomes = solve_wave(ctx, problem, kinds, boxes, wave, state.current());
        for outcome in outcomes {
            report.patches += 1;
            match outcome {
                PatchOutcome::Skipped => report.skipped += 1,
                PatchOutcome::Unchanged {
                    cost,
                    parameters,
                    evaluations,
                } => {
                    report.evaluations += evaluations;
                    report.parameters += parameters;
                    report.cost_before += cost;
                    report.cost_after += cost;
                }
                PatchOutcome::Improved {
                    update,
                    kind,
                    parameters,
                    initial_cost,
                    cost,
                    evaluations,
                } => {
                    report.improved += 1;
                    report.evaluations += evaluations;
                    report.parameters += parameters;
                    report.cost_before += initial_cost;
                    report.cost_after += cost;
                    report.used_quintic |= kind == BasisKind::Quintic;
                    update.apply(&mut state.plus, state.minus.as_mut());
                }
            }
        }
    }
}

fn solve_wave(
    ctx: &LevelContext<'_>,
    problem: &Problem<'_>,
    kinds: &[BasisKind],
    boxes: &[PatchBox],
    wave: &[usize],
    current: Current<'_>,
) -> Vec<PatchOutcome> {
    #[cfg(feature = "rayon")]
    if ctx.cfg.parallel && wave.len() > 1 {
        return wave
            .par_iter()
            .map(|&b| {
                ctx.pool
                    .with(|scratch| solve_patch(problem, current, boxes[b], kinds, scratch))
            })
            .collect();
    }
    wave.iter()
        .map(|&b| {
            ctx.pool
                .with(|scratch| solve_patch(problem, current, boxes[b], kinds, scratch))
        })
        .collect()
}

/// Warp as it stood after one level.
#[derive(Clone, Debug, PartialEq)]
pub struct LevelSnapshot {
    pub level: usize,
    /// Source-side warp after the level.
    pub warp: DisplacementField,
}

/// Runs `plans` in order, returning one report per level. When `snapshots`
/// is given, the warp after each level is pushed onto it.
pub(crate) fn run_levels(
    ctx: &LevelContext<'_>,
    plans: &[LevelPlan],
    state: &mut WarpState,
    mut snapshots: Option<&mut Vec<LevelSnapshot>>,
) -> Vec<LevelReport> {
    plans
        .iter()
        .map(|plan| {
            let report = run_level(ctx, plan, state);
            if let Some(out) = snapshots.as_deref_mut() {
                out.push(LevelSnapshot {
                    level: plan.level,
                    warp: state.plus.clone(),
                });
            }
            report
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::basis_kinds;
    use crate::basis::BasisKind;
    use crate::engine::config::RegistrationConfig;

    #[test]
    fn basis_choice_per_level() {
        let cfg = RegistrationConfig::default();
        assert_eq!(basis_kinds(&cfg, 0, 5), &[BasisKind::Cubic, BasisKind::Quintic]);
        assert_eq!(basis_kinds(&cfg, 5, 5), &[BasisKind::Cubic]);
        let cfg = RegistrationConfig {
            quintic_final: true,
            ..Default::default()
        };
        assert_eq!(basis_kinds(&cfg, 5, 5), &[BasisKind::Quintic]);
        let cfg = RegistrationConfig {
            quintic_only: true,
            ..Default::default()
        };
        assert_eq!(basis_kinds(&cfg, 2, 5), &[BasisKind::Quintic]);
    }
}
