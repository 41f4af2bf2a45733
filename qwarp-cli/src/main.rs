use clap::Parser;
use qwarp::volume::io::{load_gray_volume, save_gray_volume};
use qwarp::{
    Interp, LevelRange, LevelReport, Metric, NegativeHandling, OptimizerConfig, PenaltyConfig,
    PreAlign, RegistrationConfig, RegistrationInput, RegistrationOutput, Volume, WarpChain,
    Warper, WeightConfig,
};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use tracing_subscriber::EnvFilter;

mod prealign;
mod transforms;

use prealign::CommandAligner;
use transforms::{write_warp, FileLoader};

const SCHEMA_JSON: &str = include_str!(concat!(env!("CARGO_MANIFEST_DIR"), "/config.schema.json"));
const EXAMPLE_JSON: &str =
    include_str!(concat!(env!("CARGO_MANIFEST_DIR"), "/config.example.json"));

#[derive(Parser, Debug)]
#[command(author, version, about = "Qwarp CLI (JSON config driven)")]
struct Cli {
    /// Path to the JSON configuration file.
    #[arg(short, long, value_name = "FILE", default_value = "config.json")]
    config: PathBuf,
    /// Print the JSON schema and exit.
    #[arg(long)]
    print_schema: bool,
    /// Print an example config and exit.
    #[arg(long)]
    print_example: bool,
    /// Enable tracing output for performance profiling.
    #[arg(long)]
    trace: bool,
    /// Override the configured metric.
    #[arg(long, value_enum)]
    metric: Option<MetricConfig>,
    /// Override the configured maximum level.
    #[arg(long)]
    max_level: Option<usize>,
}

#[derive(Clone, Copy, Debug, Deserialize, clap::ValueEnum)]
#[serde(rename_all = "snake_case")]
enum MetricConfig {
    ClippedPearson,
    Pearson,
    Hellinger,
    Mi,
    Nmi,
    Lpc,
    Lpa,
}

impl From<MetricConfig> for Metric {
    fn from(value: MetricConfig) -> Self {
        match value {
            MetricConfig::ClippedPearson => Metric::ClippedPearson,
            MetricConfig::Pearson => Metric::Pearson,
            MetricConfig::Hellinger => Metric::Hellinger,
            MetricConfig::Mi => Metric::MutualInfo,
            MetricConfig::Nmi => Metric::NormalizedMutualInfo,
            MetricConfig::Lpc => Metric::LocalPearsonMin,
            MetricConfig::Lpa => Metric::LocalPearsonMax,
        }
    }
}

#[derive(Clone, Copy, Debug, Deserialize)]
#[serde(rename_all = "snake_case")]
enum InterpConfig {
    Linear,
    Cubic,
    Wsinc5,
}

impl From<InterpConfig> for Interp {
    fn from(value: InterpConfig) -> Self {
        match value {
            InterpConfig::Linear => Interp::Linear,
            InterpConfig::Cubic => Interp::Cubic,
            InterpConfig::Wsinc5 => Interp::WSinc5,
        }
    }
}

#[derive(Clone, Copy, Debug, Deserialize)]
#[serde(rename_all = "snake_case")]
enum NegativesConfig {
    SwitchMetric,
    ClipToZero,
}

impl From<NegativesConfig> for NegativeHandling {
    fn from(value: NegativesConfig) -> Self {
        match value {
            NegativesConfig::SwitchMetric => NegativeHandling::SwitchMetric,
            NegativesConfig::ClipToZero => NegativeHandling::ClipToZero,
        }
    }
}

#[derive(Debug, Deserialize)]
#[serde(default)]
struct PenaltyJson {
    factor: f64,
    cut: f64,
    /// `false` keeps the factor fixed across levels.
    progressive: bool,
}

impl Default for PenaltyJson {
    fn default() -> Self {
        let cfg = PenaltyConfig::default();
        Self {
            factor: cfg.factor,
            cut: cfg.cut,
            progressive: cfg.progressive,
        }
    }
}

#[derive(Debug, Deserialize)]
#[serde(default)]
struct OptimizerJson {
    rho_begin: f64,
    rho_end: f64,
    evals_per_param: usize,
}

impl Default for OptimizerJson {
    fn default() -> Self {
        let cfg = OptimizerConfig::default();
        Self {
            rho_begin: cfg.rho_begin,
            rho_end: cfg.rho_end,
            evals_per_param: cfg.evals_per_param,
        }
    }
}

#[derive(Debug, Deserialize)]
#[serde(default)]
struct WeightJson {
    binary: bool,
    dilation: usize,
    power: f64,
    median_radius: f64,
    blur_fwhm: f64,
}

impl Default for WeightJson {
    fn default() -> Self {
        let cfg = WeightConfig::default();
        Self {
            binary: cfg.binary,
            dilation: cfg.dilation,
            power: cfg.power,
            median_radius: cfg.median_radius,
            blur_fwhm: cfg.blur_fwhm,
        }
    }
}

#[derive(Debug, Deserialize)]
#[serde(default)]
struct PreAlignJson {
    /// Affine registration program, called like 3dAllineate.
    program: String,
    /// Extra arguments, split on whitespace.
    extra_opts: String,
    resample_only: bool,
}

impl Default for PreAlignJson {
    fn default() -> Self {
        Self {
            program: "3dAllineate".to_string(),
            extra_opts: String::new(),
            resample_only: false,
        }
    }
}

#[derive(Debug, Deserialize)]
#[serde(default)]
struct RegistrationJson {
    metric: MetricConfig,
    min_patch: usize,
    max_level: usize,
    init_level: usize,
    duplo: bool,
    /// Inclusive `[first, last]` level range.
    workhard: Option<[usize; 2]>,
    superhard: Option<[usize; 2]>,
    penalty: PenaltyJson,
    blur_base: f64,
    blur_source: f64,
    disable_axes: [bool; 3],
    zero_pad: bool,
    pad_warp: bool,
    extra_pad: usize,
    min_pad: usize,
    negatives: NegativesConfig,
    quintic_level0: bool,
    quintic_final: bool,
    quintic_only: bool,
    plus_minus: bool,
    prealign: Option<PreAlignJson>,
    save_levels: bool,
    inner_interp: InterpConfig,
    final_interp: InterpConfig,
    optimizer: OptimizerJson,
    parallel: bool,
    workers: usize,
    inverse: bool,
    invert_tolerance: f64,
    invert_max_iter: usize,
    weight: WeightJson,
}

impl Default for RegistrationJson {
    fn default() -> Self {
        let cfg = RegistrationConfig::default();
        Self {
            metric: MetricConfig::ClippedPearson,
            min_patch: cfg.min_patch,
            max_level: cfg.max_level,
            init_level: cfg.init_level,
            duplo: cfg.duplo,
            workhard: None,
            superhard: None,
            penalty: PenaltyJson::default(),
            blur_base: cfg.blur_base,
            blur_source: cfg.blur_source,
            disable_axes: cfg.disable_axes,
            zero_pad: cfg.zero_pad,
            pad_warp: cfg.pad_warp,
            extra_pad: cfg.extra_pad,
            min_pad: cfg.min_pad,
            negatives: NegativesConfig::SwitchMetric,
            quintic_level0: cfg.quintic_level0,
            quintic_final: cfg.quintic_final,
            quintic_only: cfg.quintic_only,
            plus_minus: cfg.plus_minus,
            prealign: None,
            save_levels: cfg.save_levels,
            inner_interp: InterpConfig::Linear,
            final_interp: InterpConfig::Wsinc5,
            optimizer: OptimizerJson::default(),
            parallel: cfg.parallel,
            workers: cfg.workers,
            inverse: cfg.inverse,
            invert_tolerance: cfg.invert_tolerance,
            invert_max_iter: cfg.invert_max_iter,
            weight: WeightJson::default(),
        }
    }
}

fn level_range(range: Option<[usize; 2]>) -> Option<LevelRange> {
    range.map(|[first, last]| LevelRange { first, last })
}

impl From<&RegistrationJson> for RegistrationConfig {
    fn from(j: &RegistrationJson) -> Self {
        Self {
            metric: j.metric.into(),
            min_patch: j.min_patch,
            max_level: j.max_level,
            init_level: j.init_level,
            duplo: j.duplo,
            workhard: level_range(j.workhard),
            superhard: level_range(j.superhard),
            penalty: PenaltyConfig {
                factor: j.penalty.factor,
                cut: j.penalty.cut,
                progressive: j.penalty.progressive,
            },
            blur_base: j.blur_base,
            blur_source: j.blur_source,
            disable_axes: j.disable_axes,
            zero_pad: j.zero_pad,
            pad_warp: j.pad_warp,
            extra_pad: j.extra_pad,
            min_pad: j.min_pad,
            negatives: j.negatives.into(),
            quintic_level0: j.quintic_level0,
            quintic_final: j.quintic_final,
            quintic_only: j.quintic_only,
            plus_minus: j.plus_minus,
            prealign: j.prealign.as_ref().map(|p| PreAlign {
                extra_opts: p.extra_opts.clone(),
                resample_only: p.resample_only,
            }),
            save_levels: j.save_levels,
            inner_interp: j.inner_interp.into(),
            final_interp: j.final_interp.into(),
            optimizer: OptimizerConfig {
                rho_begin: j.optimizer.rho_begin,
                rho_end: j.optimizer.rho_end,
                evals_per_param: j.optimizer.evals_per_param,
            },
            parallel: j.parallel,
            workers: j.workers,
            inverse: j.inverse,
            invert_tolerance: j.invert_tolerance,
            invert_max_iter: j.invert_max_iter,
            weight: WeightConfig {
                binary: j.weight.binary,
                dilation: j.weight.dilation,
                power: j.weight.power,
                median_radius: j.weight.median_radius,
                blur_fwhm: j.weight.blur_fwhm,
            },
        }
    }
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct Config {
    base_path: String,
    source_path: String,
    weight_path: Option<String>,
    emask_path: Option<String>,
    /// Catenated initial warp, resolved relative to the config file.
    initial_warp: Option<String>,
    output_path: Option<String>,
    warp_path: Option<String>,
    inverse_path: Option<String>,
    /// Plus-minus outputs: `<prefix>_plus.json`, `<prefix>_minus.json`,
    /// `<prefix>_base.png`, `<prefix>_source.png`.
    plus_minus_prefix: Option<String>,
    /// Pre-alignment matrix (twelve numbers, row major).
    prealign_matrix_path: Option<String>,
    /// Level snapshots: `<prefix>_level<NN>.json`, needs
    /// `registration.save_levels`.
    level_prefix: Option<String>,
    report_path: Option<String>,
    registration: RegistrationJson,
}

#[derive(Debug, Serialize)]
struct LevelRecord {
    level: usize,
    patch_width: [usize; 3],
    patches: usize,
    skipped: usize,
    improved: usize,
    cost_before: f64,
    cost_after: f64,
}

impl From<&LevelReport> for LevelRecord {
    fn from(value: &LevelReport) -> Self {
        Self {
            level: value.level,
            patch_width: value.patch_width,
            patches: value.patches,
            skipped: value.skipped,
            improved: value.improved,
            cost_before: value.cost_before,
            cost_after: value.cost_after,
        }
    }
}

#[derive(Debug, Serialize)]
struct Output {
    metric: &'static str,
    metric_substituted: bool,
    pads: [isize; 6],
    parameters_optimized: usize,
    max_displacement: f64,
    mean_displacement: [f64; 3],
    inverse_residual: Option<f64>,
    prealign_matrix: Option<[[f64; 4]; 3]>,
    saved_levels: usize,
    coarse_levels: Vec<LevelRecord>,
    levels: Vec<LevelRecord>,
    warnings: Vec<String>,
}

impl Output {
    fn new(result: &RegistrationOutput) -> Self {
        let (report, warp) = (&result.report, &result.warp);
        Self {
            metric: report.metric.name(),
            metric_substituted: report.metric_substituted,
            pads: report.pads,
            parameters_optimized: report.parameters_optimized(),
            max_displacement: warp.max_norm(),
            mean_displacement: warp.mean(),
            inverse_residual: report.inverse_residual,
            prealign_matrix: result.prealign_matrix.map(|m| m.0),
            saved_levels: report.level_warps.len(),
            coarse_levels: report.coarse_levels.iter().map(LevelRecord::from).collect(),
            levels: report.levels.iter().map(LevelRecord::from).collect(),
            warnings: report.warnings.clone(),
        }
    }
}

fn load_optional(path: &Option<String>) -> Result<Option<Volume>, Box<dyn std::error::Error>> {
    Ok(match path {
        Some(p) => Some(load_gray_volume(p)?),
        None => None,
    })
}

fn main() -> Result<(), Box<dyn std::error::Error>> {
    let cli = Cli::parse();

    if cli.trace {
        tracing_subscriber::fmt()
            .with_env_filter(EnvFilter::from_default_env().add_directive("qwarp=info".parse()?))
            .with_target(false)
            .init();
    }

    if cli.print_schema {
        println!("{SCHEMA_JSON}");
        return Ok(());
    }
    if cli.print_example {
        println!("{EXAMPLE_JSON}");
        return Ok(());
    }

    let config_text = fs::read_to_string(&cli.config)?;
    let mut config: Config = serde_json::from_str(&config_text)?;
    if config.base_path.is_empty() || config.source_path.is_empty() {
        return Err("base_path and source_path must be set in the config".into());
    }
    if let Some(metric) = cli.metric {
        config.registration.metric = metric;
    }
    if let Some(level) = cli.max_level {
        config.registration.max_level = level;
    }

    let base = load_gray_volume(&config.base_path)?;
    let source = load_gray_volume(&config.source_path)?;
    let weight = load_optional(&config.weight_path)?;
    let emask = load_optional(&config.emask_path)?;
    let reg_cfg = RegistrationConfig::from(&config.registration);
    tracing::info!(dims = ?base.dims(), metric = reg_cfg.metric.name(), "inputs loaded");

    let initial = match &config.initial_warp {
        Some(chain) => {
            let root = cli
                .config
                .parent()
                .map(Path::to_path_buf)
                .unwrap_or_default();
            let loaded = WarpChain::parse(chain)?.load(
                &FileLoader { root },
                reg_cfg.invert_tolerance,
                reg_cfg.invert_max_iter,
            )?;
            let pads = loaded.required_pads(base.grid())?;
            Some(loaded.evaluate(base.grid().padded(pads)?)?)
        }
        None => None,
    };

    let mut input = RegistrationInput::new(&base, &source);
    if let Some(w) = &weight {
        input = input.with_weight(w);
    }
    if let Some(m) = &emask {
        input = input.with_emask(m);
    }
    if let Some(f) = &initial {
        input = input.with_initial_warp(f);
    }
    let aligner = config.registration.prealign.as_ref().map(|p| CommandAligner {
        program: p.program.clone(),
        base_path: PathBuf::from(&config.base_path),
        source_path: PathBuf::from(&config.source_path),
    });
    if let Some(a) = &aligner {
        input = input.with_prealigner(a);
    }

    let result = Warper::new().with_config(reg_cfg).register(input)?;

    if let Some(path) = &config.output_path {
        save_gray_volume(path, &result.warped)?;
    }
    if let Some(path) = &config.warp_path {
        write_warp(Path::new(path), &result.warp)?;
    }
    if let (Some(path), Some(inv)) = (&config.inverse_path, &result.inverse) {
        write_warp(Path::new(path), inv)?;
    }
    if let (Some(prefix), Some(pm)) = (&config.plus_minus_prefix, &result.plus_minus) {
        write_warp(Path::new(&format!("{prefix}_plus.json")), &pm.plus)?;
        write_warp(Path::new(&format!("{prefix}_minus.json")), &pm.minus)?;
        save_gray_volume(format!("{prefix}_base.png"), &pm.warped_base)?;
        save_gray_volume(format!("{prefix}_source.png"), &pm.warped_source)?;
    }
    if let (Some(path), Some(m)) = (&config.prealign_matrix_path, &result.prealign_matrix) {
        let text = m
            .0
            .iter()
            .map(|row| row.map(|v| v.to_string()).join(" "))
            .collect::<Vec<_>>()
            .join("\n");
        fs::write(path, text + "\n")?;
    }
    if let Some(prefix) = &config.level_prefix {
        for snap in &result.report.level_warps {
            write_warp(
                Path::new(&format!("{prefix}_level{:02}.json", snap.level)),
                &snap.warp,
            )?;
        }
    }

    tracing::info!(
        levels = result.report.levels.len(),
        improved = result.report.patches_improved(),
        "registration finished"
    );
    let output = Output::new(&result);
    let json = serde_json::to_string_pretty(&output)?;
    match config.report_path {
        Some(path) => fs::write(path, json)?,
        None => println!("{json}"),
    }

    Ok(())
}
