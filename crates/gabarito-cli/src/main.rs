//! gabarito: decode answer-sheet images from the command line.
//!
//! Prints one JSON response per input image (NDJSON, in argument order)
//! on stdout. Logs and diagnostics reports go to stderr.
//!
//! # Usage
//!
//! ```text
//! cargo run --release --bin gabarito -- --templates templates/two-block.toml [OPTIONS] <IMAGES>...
//! ```
//!
//! The exit status is non-zero when any image yields `status = "error"`.

#![allow(clippy::print_stdout, clippy::print_stderr)]

use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::time::{Duration, Instant};

use anyhow::{Context, Result, bail};
use clap::{Parser, ValueEnum};
use gabarito_pipeline::{
    BlocksRead, BubbleTemplate, Clock, DownsampleFilter, Engine, PipelineConfig, ProcessingResult,
    SheetRequest, Status, TemplateSet, UnreadablePolicy,
};
use tracing::{debug, info, warn};

/// Decode photographed or scanned answer sheets.
#[derive(Parser)]
#[command(name = "gabarito", version)]
struct Cli {
    /// Input images (PNG, JPEG, BMP, WebP).
    #[arg(required = true)]
    images: Vec<PathBuf>,

    /// Template file (`.toml` or `.json`) with one or more `templates`.
    #[arg(long)]
    templates: PathBuf,

    /// Template id to decode against. Optional when the file defines
    /// exactly one template.
    #[arg(long)]
    template: Option<String>,

    /// Pipeline configuration file (TOML). Missing fields use defaults.
    #[arg(long, conflicts_with = "config_json")]
    config: Option<PathBuf>,

    /// Full pipeline config as a JSON string.
    #[arg(long)]
    config_json: Option<String>,

    /// Working resolution for fiducial search (longest side in pixels).
    #[arg(long)]
    working_resolution: Option<u32>,

    /// Downsample filter for the fiducial search image.
    #[arg(long, value_enum)]
    downsample_filter: Option<Filter>,

    /// Per-image time budget in milliseconds.
    #[arg(long)]
    time_budget_ms: Option<u64>,

    /// Worker threads (defaults to the number of cores).
    #[arg(long, value_parser = clap::builder::RangedU64ValueParser::<usize>::new().range(1..))]
    threads: Option<usize>,

    /// Treat a sheet on which no block can be read as an error.
    #[arg(long)]
    fail_unreadable: bool,

    /// Declared media type of every input (e.g. `image/jpeg`).
    #[arg(long)]
    content_type: Option<String>,

    /// Pretty-print JSON output.
    #[arg(long)]
    pretty: bool,

    /// Emit the full audit document (scores, quality, defects) instead
    /// of the wire response.
    #[arg(long)]
    audit: bool,

    /// Print a per-stage diagnostics report to stderr for each image.
    #[arg(long)]
    diagnostics: bool,

    /// Write each rectified block as `<stem>_block_<n>.png` into this
    /// directory.
    #[arg(long)]
    dump_blocks: Option<PathBuf>,

    /// Increase log verbosity (-v info, -vv debug, -vvv trace).
    /// `RUST_LOG` takes precedence when set.
    #[arg(short, long, action = clap::ArgAction::Count)]
    verbose: u8,
}

/// Downsample resampling filter selection.
#[derive(Clone, Copy, ValueEnum)]
enum Filter {
    /// Disabled: search the full-resolution image.
    Disabled,
    /// Nearest-neighbor (fastest, blocky).
    Nearest,
    /// Bilinear interpolation (fast, decent quality).
    Triangle,
    /// Bicubic Catmull-Rom (moderate, good quality).
    CatmullRom,
    /// Gaussian (moderate, smooth).
    Gaussian,
    /// Lanczos with 3 lobes (slowest, sharpest).
    Lanczos3,
}

impl From<Filter> for DownsampleFilter {
    fn from(f: Filter) -> Self {
        match f {
            Filter::Disabled => Self::Disabled,
            Filter::Nearest => Self::Nearest,
            Filter::Triangle => Self::Triangle,
            Filter::CatmullRom => Self::CatmullRom,
            Filter::Gaussian => Self::Gaussian,
            Filter::Lanczos3 => Self::Lanczos3,
        }
    }
}

fn main() -> ExitCode {
    let cli = Cli::parse();
    init_logging(cli.verbose);

    match run(&cli) {
        Ok(true) => ExitCode::SUCCESS,
        Ok(false) => ExitCode::FAILURE,
        Err(e) => {
            eprintln!("error: {e:#}");
            ExitCode::FAILURE
        }
    }
}

fn init_logging(verbose: u8) {
    let default = match verbose {
        0 => "warn",
        1 => "info",
        2 => "debug",
        _ => "trace",
    };
    tracing_subscriber::fmt()
        .with_writer(std::io::stderr)
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(default)),
        )
        .init();
}

/// Process every image. Returns `Ok(false)` when any image failed.
fn run(cli: &Cli) -> Result<bool> {
    let config = config_from_cli(cli)?;
    let templates = load_templates(&cli.templates)?;
    let template = select_template(&templates, cli.template.as_deref())?;
    info!(
        template = %template.id,
        images = cli.images.len(),
        "decoding"
    );

    let results = if cli.diagnostics || cli.dump_blocks.is_some() {
        if let Some(dir) = &cli.dump_blocks {
            std::fs::create_dir_all(dir)
                .with_context(|| format!("creating {}", dir.display()))?;
        }
        cli.images
            .iter()
            .map(|path| process_one(cli, path, &template, &config))
            .collect::<Result<Vec<_>>>()?
    } else {
        process_batch(cli, templates, &template.id, config)?
    };

    let mut all_ok = true;
    for result in &results {
        all_ok &= result.status == Status::Success;
        let json = if cli.audit {
            gabarito_export::to_audit_json(result, cli.pretty)?
        } else {
            gabarito_export::to_json(result, cli.pretty)?
        };
        println!("{json}");
    }
    Ok(all_ok)
}

/// Build the pipeline configuration: file or JSON first, then flags.
fn config_from_cli(cli: &Cli) -> Result<PipelineConfig> {
    let mut config = if let Some(json) = &cli.config_json {
        serde_json::from_str(json).context("parsing --config-json")?
    } else if let Some(path) = &cli.config {
        let text = std::fs::read_to_string(path)
            .with_context(|| format!("reading {}", path.display()))?;
        toml::from_str(&text).with_context(|| format!("parsing {}", path.display()))?
    } else {
        PipelineConfig::default()
    };

    if let Some(r) = cli.working_resolution {
        config.working_resolution = r;
    }
    if let Some(f) = cli.downsample_filter {
        config.downsample_filter = f.into();
    }
    if cli.time_budget_ms.is_some() {
        config.time_budget_ms = cli.time_budget_ms;
    }
    if cli.threads.is_some() {
        config.worker_threads = cli.threads;
    }
    if cli.fail_unreadable {
        config.unreadable_policy = UnreadablePolicy::Fail;
    }
    config.validate()?;
    debug!(?config, "pipeline configuration");
    Ok(config)
}

fn load_templates(path: &Path) -> Result<TemplateSet> {
    let text =
        std::fs::read_to_string(path).with_context(|| format!("reading {}", path.display()))?;
    let is_json = path
        .extension()
        .is_some_and(|ext| ext.eq_ignore_ascii_case("json"));
    let set = if is_json {
        TemplateSet::from_json_str(&text)
    } else {
        TemplateSet::from_toml_str(&text)
    };
    set.with_context(|| format!("loading templates from {}", path.display()))
}

fn select_template(set: &TemplateSet, id: Option<&str>) -> Result<BubbleTemplate> {
    let template = match id {
        Some(id) => set.get(id),
        None => set.sole(),
    };
    match (template, id) {
        (Some(t), _) => Ok(BubbleTemplate::clone(t)),
        (None, Some(id)) => bail!(
            "unknown template {id:?} (available: {})",
            set.ids().collect::<Vec<_>>().join(", ")
        ),
        (None, None) => bail!(
            "--template is required when the file defines several templates ({})",
            set.ids().collect::<Vec<_>>().join(", ")
        ),
    }
}

/// Error result for an input that could not be read at all.
fn unreadable_input(path: &Path, e: &std::io::Error) -> ProcessingResult {
    warn!(path = %path.display(), error = %e, "cannot read input");
    ProcessingResult {
        status: Status::Error,
        blocks: Vec::new(),
        message: Some(format!("cannot read {}: {e}", path.display())),
    }
}

/// Decode all images concurrently on an [`Engine`].
fn process_batch(
    cli: &Cli,
    templates: TemplateSet,
    template_id: &str,
    config: PipelineConfig,
) -> Result<Vec<ProcessingResult>> {
    let engine = Engine::new(templates, config)?;
    let mut unreadable = Vec::new();
    let mut requests = Vec::new();
    for (i, path) in cli.images.iter().enumerate() {
        match std::fs::read(path) {
            Ok(bytes) => requests.push(SheetRequest {
                bytes,
                content_type: cli.content_type.clone(),
                template_id: template_id.to_owned(),
            }),
            Err(e) => unreadable.push((i, unreadable_input(path, &e))),
        }
    }

    let mut decoded = engine.process_batch(&requests).into_iter();
    let mut unreadable = unreadable.into_iter().peekable();
    let results = (0..cli.images.len())
        .filter_map(|i| match unreadable.next_if(|(j, _)| *j == i) {
            Some((_, result)) => Some(result),
            None => decoded.next(),
        })
        .collect();
    Ok(results)
}

/// Decode one image in a single pass, optionally reporting diagnostics
/// and dumping rectified blocks.
fn process_one(
    cli: &Cli,
    path: &Path,
    template: &BubbleTemplate,
    config: &PipelineConfig,
) -> Result<ProcessingResult> {
    let bytes = match std::fs::read(path) {
        Ok(bytes) => bytes,
        Err(e) => return Ok(unreadable_input(path, &e)),
    };

    let mut dumped = Ok(());
    let (result, diagnostics) = gabarito_pipeline::inspect_with_diagnostics(
        &bytes,
        cli.content_type.as_deref(),
        template,
        config,
        &StdClock,
        |read| {
            if let Some(dir) = &cli.dump_blocks {
                dumped = dump_blocks(dir, path, read);
            }
        },
    );
    dumped?;

    if cli.diagnostics {
        eprintln!("{}\n{}", path.display(), diagnostics.report());
        eprintln!();
    }
    Ok(result)
}

/// Write each rectified block as `<stem>_block_<n>.png` under `dir`.
fn dump_blocks(dir: &Path, path: &Path, read: &BlocksRead) -> Result<()> {
    let stem = path
        .file_stem()
        .and_then(|s| s.to_str())
        .unwrap_or("sheet");
    for (number, raster) in read.rectified() {
        let out = dir.join(format!("{stem}_block_{number}.png"));
        raster
            .save(&out)
            .with_context(|| format!("writing {}", out.display()))?;
        debug!(path = %out.display(), "rectified block written");
    }
    Ok(())
}

/// [`Clock`] implementation backed by [`std::time::Instant`].
struct StdClock;

impl Clock for StdClock {
    type Instant = Instant;

    fn now(&self) -> Instant {
        Instant::now()
    }

    fn elapsed(&self, since: &Instant) -> Duration {
        since.elapsed()
    }
}
