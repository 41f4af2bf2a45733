//! Registration engine.
//!
//! [`Warper`] validates the inputs, optionally hands the source to an affine
//! pre-aligner, pads and smooths the volumes, builds the weight, runs the
//! optional half-resolution pass and then the level schedule, and finally
//! resamples the source through the optimized warp.

pub mod config;
pub mod duplo;
pub mod level;
pub(crate) mod patch;
pub mod plusminus;
pub(crate) mod pool;
pub mod prealign;
pub mod schedule;

pub use config::{LevelRange, NegativeHandling, RegistrationConfig};
pub use level::{LevelReport, LevelSnapshot};
pub use plusminus::PlusMinusOutput;
pub use prealign::{PreAlign, PreAligned, PreAligner};

use crate::engine::config::PATCH_FLOOR;
use crate::engine::level::{run_levels, LevelContext, WarpState};
use crate::engine::pool::ScratchPool;
use crate::engine::prealign::{run_prealign, Alignment};
use crate::engine::schedule::plan_levels;
use crate::metric::{Metric, MetricContext};
use crate::resample::{Border, Interp};
use crate::trace::{trace_event, trace_span, trace_warn};
use crate::util::{QwarpError, QwarpResult};
use crate::volume::filter::Smoothing;
use crate::volume::pad::auto_padding;
use crate::volume::{Affine, Pads, Volume};
use crate::warp::DisplacementField;
use crate::weight::{auto_weight, normalize_weight};

/// Inputs to one registration.
#[derive(Clone, Copy, Debug)]
pub struct RegistrationInput<'a> {
    pub base: &'a Volume,
    pub source: &'a Volume,
    /// Weight on the base grid; built automatically when absent.
    pub weight: Option<&'a Volume>,
    /// Nonzero voxels are excluded from the cost.
    pub emask: Option<&'a Volume>,
    /// Starting warp on a grid conforming with the base grid.
    pub initial_warp: Option<&'a DisplacementField>,
    /// Runs the affine step requested by `RegistrationConfig::prealign`.
    pub prealigner: Option<&'a dyn PreAligner>,
}

impl<'a> RegistrationInput<'a> {
    pub fn new(base: &'a Volume, source: &'a Volume) -> Self {
        Self {
            base,
            source,
            weight: None,
            emask: None,
            initial_warp: None,
            prealigner: None,
        }
    }

    pub fn with_weight(mut self, weight: &'a Volume) -> Self {
        self.weight = Some(weight);
        self
    }

    pub fn with_emask(mut self, emask: &'a Volume) -> Self {
        self.emask = Some(emask);
        self
    }

    pub fn with_initial_warp(mut self, warp: &'a DisplacementField) -> Self {
        self.initial_warp = Some(warp);
        self
    }

    pub fn with_prealigner(mut self, aligner: &'a dyn PreAligner) -> Self {
        self.prealigner = Some(aligner);
        self
    }
}

/// Diagnostics of one run.
#[derive(Clone, Debug, PartialEq)]
pub struct RunReport {
    /// Metric actually used.
    pub metric: Metric,
    /// Clipped Pearson was replaced because of negative values.
    pub metric_substituted: bool,
    /// Padding applied to the base grid.
    pub pads: Pads,
    /// Levels of the half-resolution pass.
    pub coarse_levels: Vec<LevelReport>,
    /// Levels of the full-resolution run.
    pub levels: Vec<LevelReport>,
    /// Non-fatal conflicts and substitutions, in the order they happened.
    pub warnings: Vec<String>,
    /// Residual of the inverse warp, when one was computed.
    pub inverse_residual: Option<f64>,
    /// Warp after each full-resolution level, on the output grid. Filled
    /// only with `save_levels`.
    pub level_warps: Vec<LevelSnapshot>,
}

impl RunReport {
    /// Free parameters optimized over the whole run.
    pub fn parameters_optimized(&self) -> usize {
        self.coarse_levels
            .iter()
            .chain(&self.levels)
            .map(|l| l.parameters)
            .sum()
    }

    /// Patches that improved the warp.
    pub fn patches_improved(&self) -> usize {
        self.coarse_levels
            .iter()
            .chain(&self.levels)
            .map(|l| l.improved)
            .sum()
    }

    fn warn(&mut self, msg: String) {
        trace_warn!("{msg}");
        self.warnings.push(msg);
    }
}

/// Result of [`Warper::register`].
#[derive(Clone, Debug)]
pub struct RegistrationOutput {
    /// Warp taking base coordinates to source coordinates. Lives on the base
    /// grid, or on the padded grid when `pad_warp` is set.
    pub warp: DisplacementField,
    /// Source resampled onto the base grid.
    pub warped: Volume,
    pub inverse: Option<DisplacementField>,
    pub plus_minus: Option<PlusMinusOutput>,
    /// Affine found by the pre-aligner. Already composed into `warp`.
    pub prealign_matrix: Option<Affine>,
    pub report: RunReport,
}

/// Nonlinear registration entry point.
#[derive(Clone, Debug, Default)]
pub struct Warper {
    config: RegistrationConfig,
}

impl Warper {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_config(mut self, config: RegistrationConfig) -> Self {
        self.config = config;
        self
    }

    pub fn config(&self) -> &RegistrationConfig {
        &self.config
    }

    /// Registers `input.source` to `input.base`.
    pub fn register(&self, input: RegistrationInput<'_>) -> QwarpResult<RegistrationOutput> {
        let (cfg, mut warnings) = self.config.resolve()?;
        let _span = trace_span!("register", metric = cfg.metric.name()).entered();

        let aligned = match &cfg.prealign {
            Some(opts) => {
                let aligner = input.prealigner.ok_or_else(|| {
                    QwarpError::InvalidConfig(
                        "pre-alignment requested without a pre-aligner".into(),
                    )
                })?;
                let _span = trace_span!("prealign", resample_only = opts.resample_only).entered();
                run_prealign(aligner, input.base, input.source, opts, &mut warnings)?
            }
            None => None,
        };
        let original = input.source;
        let alignment = aligned
            .as_ref()
            .and_then(|a| a.matrix)
            .map(|matrix| Alignment {
                matrix,
                original: (original.grid() == input.base.grid()).then_some(original),
            });
        let input = match &aligned {
            Some(a) => RegistrationInput {
                source: &a.source,
                ..input
            },
            None => input,
        };

        let mut report = RunReport {
            metric: cfg.metric,
            metric_substituted: false,
            pads: [0; 6],
            coarse_levels: Vec::new(),
            levels: Vec::new(),
            warnings: Vec::new(),
            inverse_residual: None,
            level_warps: Vec::new(),
        };
        for w in warnings {
            report.warn(w);
        }

        let active_axes = validate(&cfg, &input)?;
        let workers = if cfg.parallel { cfg.workers } else { 1 };

        #[cfg(feature = "rayon")]
        if cfg.parallel && cfg.workers > 0 {
            let pool = rayon::ThreadPoolBuilder::new()
                .num_threads(cfg.workers)
                .build()
                .map_err(|e| QwarpError::InvalidConfig(format!("worker pool: {e}")))?;
            return pool.install(|| {
                run(&cfg, input, alignment.as_ref(), active_axes, workers, report)
            });
        }
        run(&cfg, input, alignment.as_ref(), active_axes, workers, report)
    }
}

/// Fatal checks on the inputs. Returns the displacement components that may
/// move.
fn validate(cfg: &RegistrationConfig, input: &RegistrationInput<'_>) -> QwarpResult<[bool; 3]> {
    let base = input.base;
    let grid = *base.grid();
    base.check_same_grid(input.source.grid(), "source")?;
    if std::ptr::eq(base.data().as_ptr(), input.source.data().as_ptr()) {
        return Err(QwarpError::ConflictingOptions(
            "base and source are the same volume",
        ));
    }
    if let Some(w) = input.weight {
        base.check_same_grid(w.grid(), "weight")?;
    }
    if let Some(m) = input.emask {
        base.check_same_grid(m.grid(), "exclusion mask")?;
    }
    let dims = grid.dims();
    if dims.iter().all(|&n| n < PATCH_FLOOR) {
        return Err(QwarpError::GridTooSmall { dims });
    }
    if input.initial_warp.is_some() {
        if cfg.plus_minus {
            return Err(QwarpError::ConflictingOptions(
                "plus-minus cannot start from an initial warp",
            ));
        }
        if cfg.duplo {
            return Err(QwarpError::ConflictingOptions(
                "duplo cannot start from an initial warp",
            ));
        }
        if cfg.prealign.as_ref().is_some_and(|p| !p.resample_only) {
            return Err(QwarpError::ConflictingOptions(
                "affine pre-alignment cannot start from an initial warp",
            ));
        }
    }
    let active = [0, 1, 2].map(|a| !cfg.disable_axes[a] && dims[a] > 1);
    if !active.iter().any(|&a| a) {
        return Err(QwarpError::ConflictingOptions(
            "no displacement component can move on this grid",
        ));
    }
    Ok(active)
}

/// Padding for the base grid: automatic amounts, widened so that an initial
/// warp larger than the base fits.
fn padding(
    cfg: &RegistrationConfig,
    base: &Volume,
    initial: Option<&DisplacementField>,
) -> QwarpResult<Pads> {
    let mut pads = if cfg.zero_pad {
        auto_padding(base, cfg.min_pad, cfg.extra_pad)
    } else {
        [0; 6]
    };
    if let Some(field) = initial {
        let to_base = field
            .grid()
            .pads_to(base.grid())
            .ok_or(QwarpError::NonConformingGrid {
                what: "initial warp",
            })?;
        for (p, t) in pads.iter_mut().zip(to_base) {
            *p = (*p).max(-t);
        }
    }
    Ok(pads)
}

fn run(
    cfg: &RegistrationConfig,
    input: RegistrationInput<'_>,
    alignment: Option<&Alignment<'_>>,
    active_axes: [bool; 3],
    workers: usize,
    mut report: RunReport,
) -> QwarpResult<RegistrationOutput> {
    let mut base = input.base.clone();
    let mut source = input.source.clone();

    // Negative values.
    let (neg_base, neg_source) = (base.has_negatives(), source.has_negatives());
    let mut metric = cfg.metric;
    if neg_base || neg_source {
        let which = match (neg_base, neg_source) {
            (true, true) => "base and source",
            (true, false) => "base",
            _ => "source",
        };
        match cfg.negatives {
            NegativeHandling::ClipToZero => {
                base.clip_negatives();
                source.clip_negatives();
                report.warn(format!("negative values in {which} set to zero"));
            }
            NegativeHandling::SwitchMetric if metric == Metric::ClippedPearson => {
                metric = Metric::Pearson;
                report.metric = metric;
                report.metric_substituted = true;
                report.warn(format!(
                    "negative values in {which}; using {} instead of {}",
                    Metric::Pearson.name(),
                    Metric::ClippedPearson.name()
                ));
            }
            NegativeHandling::SwitchMetric => {}
        }
    }

    // Padding.
    let pads = padding(cfg, &base, input.initial_warp)?;
    report.pads = pads;
    if pads != [0; 6] {
        base = base.zeropad(pads)?;
        source = source.zeropad(pads)?;
    }
    let grid = *base.grid();
    trace_event!("padding", voxels = grid.len(), pad_total = pads.iter().sum::<isize>());

    // Weight.
    let mut weight = match input.weight {
        Some(w) => normalize_weight(w.zeropad(pads)?)?,
        None => auto_weight(&base, &cfg.weight)?,
    };
    if let Some(mask) = input.emask {
        let mask = mask.zeropad(pads)?;
        for (w, &m) in weight.data_mut().iter_mut().zip(mask.data()) {
            if m != 0.0 {
                *w = 0.0;
            }
        }
        weight = normalize_weight(weight)?;
    }

    // Smoothing.
    let base_s = Smoothing::from_amount(cfg.blur_base).apply(&base);
    let source_s = Smoothing::from_amount(cfg.blur_source).apply(&source);

    let pool = ScratchPool::new(workers.max(rayon_threads(cfg)));
    let mut state = WarpState {
        plus: match input.initial_warp {
            Some(field) => {
                let to_grid = field
                    .grid()
                    .pads_to(&grid)
                    .ok_or(QwarpError::NonConformingGrid {
                        what: "initial warp",
                    })?;
                field.extend(to_grid)?
            }
            None => DisplacementField::identity(grid),
        },
        minus: cfg.plus_minus.then(|| DisplacementField::identity(grid)),
    };

    // Half-resolution pass.
    let mut first_level = cfg.init_level;
    if cfg.duplo {
        if duplo::duplo_eligible(grid.dims(), cfg.min_patch) {
            let coarse = duplo::coarse_pass(
                &base_s,
                &source_s,
                &weight,
                metric,
                cfg,
                active_axes,
                &pool,
            )?;
            state.plus = coarse.warp;
            first_level = coarse.next_level;
            report.coarse_levels = coarse.levels;
        } else {
            report.warn(format!(
                "grid {:?} is too small for duplo; running at full resolution only",
                grid.dims()
            ));
        }
    }

    // Full-resolution levels.
    let metric_ctx = MetricContext::new(metric, &base_s, &source_s, &weight);
    let plans = plan_levels(grid.dims(), cfg.min_patch, first_level, cfg.max_level);
    if plans.is_empty() {
        report.warn(format!(
            "initial level {first_level} is past the last level; no optimization done"
        ));
    }
    let ctx = LevelContext {
        base: &base_s,
        source: &source_s,
        weight: &weight,
        metric: &metric_ctx,
        cfg,
        active_axes,
        final_level: plans.last().map_or(first_level, |p| p.level),
        pool: &pool,
    };
    let mut snapshots = Vec::new();
    let keep = cfg.save_levels.then_some(&mut snapshots);
    report.levels = run_levels(&ctx, &plans, &mut state, keep);
    report.level_warps = snapshots;

    finish(cfg, state, &base, &source, pads, alignment, report)
}

/// Affine composition, output resampling, inverse and un-padding.
fn finish(
    cfg: &RegistrationConfig,
    state: WarpState,
    base: &Volume,
    source: &Volume,
    pads: Pads,
    alignment: Option<&Alignment<'_>>,
    mut report: RunReport,
) -> QwarpResult<RegistrationOutput> {
    let crop = pads.map(|p| -p);
    let (warp, plus_minus) = match state.minus {
        Some(minus) => {
            let (combined, residual) = plusminus::combined_warp(
                &state.plus,
                &minus,
                cfg.invert_tolerance,
                cfg.invert_max_iter,
            )?;
            if residual > cfg.invert_tolerance {
                report.warn(format!(
                    "minus warp inverted with residual {residual:.3e}"
                ));
            }
            let pm = PlusMinusOutput::new(state.plus, minus, base, source, cfg.final_interp)?;
            (combined, Some(pm.repad(crop, !cfg.pad_warp)?))
        }
        None => (state.plus, None),
    };

    // With a pre-alignment matrix the output warp reaches the original
    // source, which is resampled once through it when it shares the base
    // grid.
    let total = alignment
        .map(|a| warp.then_affine(&a.matrix))
        .transpose()?;
    let mut warped = match (alignment.and_then(|a| a.original), &total) {
        (Some(original), Some(total)) => {
            apply_warp(cfg, &total.extend(crop)?, original, cfg.final_interp)?
        }
        _ => apply_warp(cfg, &warp, source, cfg.final_interp)?.zeropad(crop)?,
    };
    let warp = total.unwrap_or(warp);
    if cfg.negatives == NegativeHandling::ClipToZero {
        warped.clip_negatives();
    }

    let inverse = if cfg.inverse {
        let inv = warp.invert(cfg.invert_tolerance, cfg.invert_max_iter);
        report.inverse_residual = Some(inv.residual);
        if !inv.converged {
            report.warn(format!(
                "inverse warp did not converge (residual {:.3e})",
                inv.residual
            ));
        }
        Some(if cfg.pad_warp {
            inv.field
        } else {
            inv.field.extend(crop)?
        })
    } else {
        None
    };
    let warp = if cfg.pad_warp { warp } else { warp.extend(crop)? };
    report.level_warps = std::mem::take(&mut report.level_warps)
        .into_iter()
        .map(|mut snap| -> QwarpResult<LevelSnapshot> {
            if let Some(a) = alignment {
                snap.warp = snap.warp.then_affine(&a.matrix)?;
            }
            if !cfg.pad_warp {
                snap.warp = snap.warp.extend(crop)?;
            }
            Ok(snap)
        })
        .collect::<QwarpResult<_>>()?;

    trace_event!(
        "register_done",
        levels = report.levels.len(),
        improved = report.patches_improved(),
        max_displacement = warp.max_norm()
    );
    Ok(RegistrationOutput {
        warp,
        warped,
        inverse,
        plus_minus,
        prealign_matrix: alignment.map(|a| a.matrix),
        report,
    })
}

fn apply_warp(
    cfg: &RegistrationConfig,
    warp: &DisplacementField,
    vol: &Volume,
    interp: Interp,
) -> QwarpResult<Volume> {
    #[cfg(feature = "rayon")]
    if cfg.parallel {
        return crate::kernel::rayon::apply_par(warp, vol, interp, Border::Zero);
    }
    #[cfg(not(feature = "rayon"))]
    let _ = cfg;
    warp.apply(vol, interp, Border::Zero)
}

#[cfg(feature = "rayon")]
fn rayon_threads(cfg: &RegistrationConfig) -> usize {
    if cfg.parallel {
        rayon::current_num_threads()
    } else {
        1
    }
}

#[cfg(not(feature = "rayon"))]
fn rayon_threads(_cfg: &RegistrationConfig) -> usize {
    1
}
