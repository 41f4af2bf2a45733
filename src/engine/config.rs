//! Registration configuration and option resolution.

use crate::engine::prealign::PreAlign;
use crate::metric::Metric;
use crate::optim::OptimizerConfig;
use crate::penalty::PenaltyConfig;
use crate::resample::Interp;
use crate::util::{QwarpError, QwarpResult};
use crate::weight::WeightConfig;

/// Smallest patch edge the schedule will produce.
pub const PATCH_FLOOR: usize = 9;
/// Default minimum patch edge.
pub const DEFAULT_MIN_PATCH: usize = 25;
/// Default (and largest) final level.
pub const DEFAULT_MAX_LEVEL: usize = 99;
/// Largest accepted initial level.
pub const MAX_INIT_LEVEL: usize = 19;
/// Default FWHM (voxels) for the base and source blurs.
pub const DEFAULT_BLUR: f64 = 2.345;

/// Inclusive range of levels.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct LevelRange {
    pub first: usize,
    pub last: usize,
}

impl LevelRange {
    /// Range `0..=last`.
    pub fn up_to(last: usize) -> Self {
        Self { first: 0, last }
    }

    pub fn contains(&self, level: usize) -> bool {
        (self.first..=self.last).contains(&level)
    }
}

impl Default for LevelRange {
    fn default() -> Self {
        Self { first: 0, last: 66 }
    }
}

/// What to do when base or source has negative values.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum NegativeHandling {
    /// Keep the values and replace clipped Pearson by plain Pearson.
    #[default]
    SwitchMetric,
    /// Clamp negatives to zero in the inputs and the output.
    ClipToZero,
}

/// Configuration for [`Warper`](crate::Warper).
#[derive(Clone, Debug, PartialEq)]
pub struct RegistrationConfig {
    pub metric: Metric,
    /// Patch edge at which refinement stops (odd, at least 9).
    pub min_patch: usize,
    /// Last level to run.
    pub max_level: usize,
    /// First level to run.
    pub init_level: usize,
    /// Solve at half resolution first.
    pub duplo: bool,
    /// Levels with a doubled budget and an extra reverse sweep.
    pub workhard: Option<LevelRange>,
    /// Levels with a quadrupled budget.
    pub superhard: Option<LevelRange>,
    pub penalty: PenaltyConfig,
    /// Base blur: positive FWHM for Gaussian, `<= -1` for median of radius
    /// `|blur|`, anything else disables it.
    pub blur_base: f64,
    pub blur_source: f64,
    /// Displacement components to freeze (x, y, z).
    pub disable_axes: [bool; 3],
    /// Pad the grid automatically around the foreground.
    pub zero_pad: bool,
    /// Return the warp on the padded grid.
    pub pad_warp: bool,
    /// Voxels added to every automatic pad.
    pub extra_pad: usize,
    /// Lower bound for every automatic pad.
    pub min_pad: usize,
    pub negatives: NegativeHandling,
    /// Try the quintic basis at level 0.
    pub quintic_level0: bool,
    /// Use the quintic basis at the final level.
    pub quintic_final: bool,
    /// Use the quintic basis at every level.
    pub quintic_only: bool,
    /// Split the warp symmetrically between base and source.
    pub plus_minus: bool,
    /// Affine pre-alignment run before the nonlinear levels.
    pub prealign: Option<PreAlign>,
    /// Keep a snapshot of the warp after every level.
    pub save_levels: bool,
    /// Interpolation used while optimizing.
    pub inner_interp: Interp,
    /// Interpolation used for the output volume.
    pub final_interp: Interp,
    pub optimizer: OptimizerConfig,
    /// Optimize independent patches on the rayon pool.
    pub parallel: bool,
    /// Worker threads; zero uses the global pool.
    pub workers: usize,
    /// Also compute the inverse warp.
    pub inverse: bool,
    pub invert_tolerance: f64,
    pub invert_max_iter: usize,
    pub weight: WeightConfig,
}

impl Default for RegistrationConfig {
    fn default() -> Self {
        Self {
            metric: Metric::default(),
            min_patch: DEFAULT_MIN_PATCH,
            max_level: DEFAULT_MAX_LEVEL,
            init_level: 0,
            duplo: false,
            workhard: None,
            superhard: None,
            penalty: PenaltyConfig::default(),
            blur_base: DEFAULT_BLUR,
            blur_source: DEFAULT_BLUR,
            disable_axes: [false; 3],
            zero_pad: true,
            pad_warp: false,
            extra_pad: 0,
            min_pad: 0,
            negatives: NegativeHandling::default(),
            quintic_level0: true,
            quintic_final: false,
            quintic_only: false,
            plus_minus: false,
            prealign: None,
            save_levels: false,
            inner_interp: Interp::Linear,
            final_interp: Interp::WSinc5,
            optimizer: OptimizerConfig::default(),
            parallel: false,
            workers: 0,
            inverse: false,
            invert_tolerance: 1e-3,
            invert_max_iter: 40,
            weight: WeightConfig::default(),
        }
    }
}

impl RegistrationConfig {
    /// Validates the options and resolves conflicts between them.
    ///
    /// Returns the effective configuration and the warnings emitted while
    /// resolving. Conflicts that cannot be resolved are errors.
    pub fn resolve(&self) -> QwarpResult<(Self, Vec<String>)> {
        let mut cfg = self.clone();
        let mut warnings = Vec::new();

        if cfg.disable_axes.iter().all(|&d| d) {
            return Err(QwarpError::ConflictingOptions(
                "all displacement components are disabled",
            ));
        }
        if let Some(pre) = &cfg.prealign {
            if cfg.plus_minus {
                return Err(QwarpError::ConflictingOptions(
                    "affine pre-alignment cannot be combined with plus-minus",
                ));
            }
            if !pre.resample_only && cfg.init_level > 0 {
                return Err(QwarpError::ConflictingOptions(
                    "affine pre-alignment cannot be combined with an initial level",
                ));
            }
        }
        if cfg.save_levels && cfg.zero_pad {
            warnings.push("level snapshots are not kept when zero-padding; turned off".into());
            cfg.save_levels = false;
        }
        if cfg.duplo && cfg.plus_minus {
            warnings.push("duplo is not available with plus-minus; duplo turned off".into());
            cfg.duplo = false;
        }
        if cfg.duplo && (cfg.init_level > 0 || cfg.max_level < DEFAULT_MAX_LEVEL) {
            return Err(QwarpError::ConflictingOptions(
                "duplo cannot be combined with an initial or maximum level",
            ));
        }

        if cfg.min_patch < PATCH_FLOOR {
            warnings.push(format!(
                "minimum patch {} raised to {PATCH_FLOOR}",
                cfg.min_patch
            ));
            cfg.min_patch = PATCH_FLOOR;
        } else if cfg.min_patch % 2 == 0 {
            warnings.push(format!(
                "minimum patch {} lowered to {}",
                cfg.min_patch,
                cfg.min_patch - 1
            ));
            cfg.min_patch -= 1;
        }
        if cfg.init_level > MAX_INIT_LEVEL {
            warnings.push(format!(
                "initial level {} clamped to {MAX_INIT_LEVEL}",
                cfg.init_level
            ));
            cfg.init_level = MAX_INIT_LEVEL;
        }
        if cfg.max_level > DEFAULT_MAX_LEVEL {
            cfg.max_level = DEFAULT_MAX_LEVEL;
        }
        if cfg.max_level < cfg.init_level {
            return Err(QwarpError::InvalidConfig(format!(
                "maximum level {} is below initial level {}",
                cfg.max_level, cfg.init_level
            )));
        }
        if cfg.metric.is_local() && cfg.max_level > 0 {
            warnings.push(format!(
                "{} is unreliable on small patches; consider a lower maximum level",
                cfg.metric.name()
            ));
        }
        if cfg.quintic_only && !cfg.quintic_level0 {
            warnings.push("quintic-only re-enables the quintic basis at level 0".into());
            cfg.quintic_level0 = true;
        }

        for (name, range) in [("workhard", cfg.workhard), ("superhard", cfg.superhard)] {
            if let Some(r) = range {
                if r.first > r.last {
                    return Err(QwarpError::InvalidConfig(format!(
                        "{name} range {}:{} is empty",
                        r.first, r.last
                    )));
                }
            }
        }

        if !cfg.penalty.factor.is_finite() || cfg.penalty.factor < 0.0 {
            return Err(QwarpError::InvalidConfig(format!(
                "penalty factor must be non-negative, got {}",
                cfg.penalty.factor
            )));
        }
        cfg.penalty.cut = PenaltyConfig::normalized_cut(cfg.penalty.cut);

        if !cfg.blur_base.is_finite() || !cfg.blur_source.is_finite() {
            return Err(QwarpError::InvalidConfig("blur amounts must be finite".into()));
        }
        let opt = &cfg.optimizer;
        if opt.evals_per_param == 0
            || opt.rho_end <= 0.0
            || opt.rho_begin > 1.0
            || opt.rho_end > opt.rho_begin
        {
            return Err(QwarpError::InvalidConfig(format!(
                "optimizer needs 0 < rho_end <= rho_begin <= 1 and a positive budget, got {opt:?}"
            )));
        }
        if cfg.invert_tolerance <= 0.0 || cfg.invert_max_iter == 0 {
            return Err(QwarpError::InvalidConfig(
                "inversion needs a positive tolerance and iteration count".into(),
            ));
        }
        if cfg.weight.power <= 0.0 || !cfg.weight.power.is_finite() {
            return Err(QwarpError::InvalidConfig(format!(
                "weight power must be positive, got {}",
                cfg.weight.power
            )));
        }
        if cfg.parallel && !cfg!(feature = "rayon") {
            warnings.push("parallel requested without the rayon feature; running serially".into());
            cfg.parallel = false;
        }

        Ok((cfg, warnings))
    }

    /// Budget multiplier at `level`.
    pub(crate) fn effort(&self, level: usize) -> usize {
        let mut m = 1;
        if self.workhard.is_some_and(|r| r.contains(level)) {
            m *= 2;
        }
        if self.superhard.is_some_and(|r| r.contains(level)) {
            m *= 4;
        }
        m
    }

    /// True when `level` gets an extra sweep in reverse patch order.
    pub(crate) fn reverse_sweep(&self, level: usize) -> bool {
        self.workhard.is_some_and(|r| r.contains(level))
    }
}

#[cfg(test)]
mod tests {
    use super::{LevelRange, RegistrationConfig, PATCH_FLOOR};
    use crate::engine::prealign::PreAlign;
    use crate::metric::Metric;
    use crate::util::QwarpError;

    #[test]
    fn defaults_resolve_cleanly() {
        let (cfg, warnings) = RegistrationConfig::default().resolve().unwrap();
        assert!(warnings.is_empty(), "{warnings:?}");
        assert_eq!(cfg, RegistrationConfig::default());
    }

    #[test]
    fn min_patch_is_made_odd_and_floored() {
        let cfg = RegistrationConfig {
            min_patch: 4,
            ..Default::default()
        };
        assert_eq!(cfg.resolve().unwrap().0.min_patch, PATCH_FLOOR);
        let cfg = RegistrationConfig {
            min_patch: 16,
            ..Default::default()
        };
        let (cfg, warnings) = cfg.resolve().unwrap();
        assert_eq!(cfg.min_patch, 15);
        assert_eq!(warnings.len(), 1);
    }

    #[test]
    fn plus_minus_disables_duplo() {
        let cfg = RegistrationConfig {
            duplo: true,
            plus_minus: true,
            ..Default::default()
        };
        let (cfg, warnings) = cfg.resolve().unwrap();
        assert!(!cfg.duplo);
        assert_eq!(warnings.len(), 1);
    }

    #[test]
    fn duplo_with_levels_is_fatal() {
        let cfg = RegistrationConfig {
            duplo: true,
            init_level: 2,
            ..Default::default()
        };
        assert!(matches!(
            cfg.resolve(),
            Err(QwarpError::ConflictingOptions(_))
        ));
    }

    #[test]
    fn all_axes_disabled_is_fatal() {
        let cfg = RegistrationConfig {
            disable_axes: [true; 3],
            ..Default::default()
        };
        assert!(matches!(
            cfg.resolve(),
            Err(QwarpError::ConflictingOptions(_))
        ));
    }

    #[test]
    fn penalty_cut_is_normalized() {
        let mut cfg = RegistrationConfig::default();
        cfg.penalty.cut = 5.0;
        assert!((cfg.resolve().unwrap().0.penalty.cut - 0.5).abs() < 1e-12);
    }

    #[test]
    fn local_metric_warns_above_level_zero() {
        let cfg = RegistrationConfig {
            metric: Metric::LocalPearsonMax,
            ..Default::default()
        };
        assert_eq!(cfg.resolve().unwrap().1.len(), 1);
    }

    #[test]
    fn prealign_with_plus_minus_is_fatal() {
        let cfg = RegistrationConfig {
            plus_minus: true,
            prealign: Some(PreAlign::default()),
            ..Default::default()
        };
        assert!(matches!(
            cfg.resolve(),
            Err(QwarpError::ConflictingOptions(_))
        ));
        let cfg = RegistrationConfig {
            init_level: 1,
            prealign: Some(PreAlign::default()),
            ..Default::default()
        };
        assert!(cfg.resolve().is_err());
    }

    #[test]
    fn zero_padding_turns_off_level_snapshots() {
        let cfg = RegistrationConfig {
            save_levels: true,
            ..Default::default()
        };
        let (cfg, warnings) = cfg.resolve().unwrap();
        assert!(!cfg.save_levels);
        assert_eq!(warnings.len(), 1);
        let cfg = RegistrationConfig {
            save_levels: true,
            zero_pad: false,
            ..Default::default()
        };
        let (cfg, warnings) = cfg.resolve().unwrap();
        assert!(cfg.save_levels);
        assert!(warnings.is_empty());
    }

    #[test]
    fn effort_multiplies() {
        let cfg = RegistrationConfig {
            workhard: Some(LevelRange::up_to(3)),
            superhard: Some(LevelRange { first: 2, last: 5 }),
            ..Default::default()
        };
        assert_eq!(cfg.effort(0), 2);
        assert_eq!(cfg.effort(2), 8);
        assert_eq!(cfg.effort(5), 4);
        assert_eq!(cfg.effort(6), 1);
        assert!(cfg.reverse_sweep(3));
        assert!(!cfg.reverse_sweep(4));
    }
}
