//! CLI binary for comicmill.
//!
//! A thin shim over the library crate that maps CLI flags to `JobOptions`
//! and renders batch progress. The same executable doubles as the worker
//! process: when invoked with the hidden worker argument it drops straight
//! into the worker loop, before any CLI parsing happens.

use anyhow::{Context, Result};
use clap::{Args, Parser, Subcommand};
use comicmill::{
    CollisionPolicy, CropSpec, EmbeddedResolution, ExtendSpec, FileOutcome, FolderContents,
    JobMode, JobOptions, JobProgressCallback, JobSummary, Orchestrator, OutputFormat, PageFormat,
    ProgressCallback, ResizeMode, Stage, TransformExecution,
};
use indicatif::{ProgressBar, ProgressStyle};
use std::io;
use std::path::PathBuf;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tracing_subscriber::EnvFilter;

// ── ANSI colour helpers (no extra deps) ──────────────────────────────────────

fn green(s: &str) -> String {
    format!("\x1b[32m{s}\x1b[0m")
}
fn red(s: &str) -> String {
    format!("\x1b[31m{s}\x1b[0m")
}
fn yellow(s: &str) -> String {
    format!("\x1b[33m{s}\x1b[0m")
}
fn dim(s: &str) -> String {
    format!("\x1b[2m{s}\x1b[0m")
}
fn bold(s: &str) -> String {
    format!("\x1b[1m{s}\x1b[0m")
}

// ── CLI progress callback using indicatif ────────────────────────────────────

/// Terminal progress callback: one bar over the batch, per-file result lines
/// printed above it. Page progress within a file is shown in the bar's
/// message, stage by stage.
struct CliProgressCallback {
    bar: ProgressBar,
    current_file: Mutex<String>,
}

impl CliProgressCallback {
    fn new() -> Arc<Self> {
        let bar = ProgressBar::new(0);
        let style = ProgressStyle::with_template(
            "{spinner:.cyan} {prefix:.bold}  [{bar:42.green/238}] {pos}/{len} files  {msg}",
        )
        .unwrap_or_else(|_| ProgressStyle::default_bar())
        .progress_chars("█▉▊▋▌▍▎▏  ");
        bar.set_style(style);
        bar.set_prefix("Processing");
        bar.enable_steady_tick(Duration::from_millis(80));
        Arc::new(Self {
            bar,
            current_file: Mutex::new(String::new()),
        })
    }

    fn file_label(&self) -> String {
        self.current_file.lock().unwrap().clone()
    }
}

impl JobProgressCallback for CliProgressCallback {
    fn on_job_start(&self, total_files: usize) {
        self.bar.set_length(total_files as u64);
    }

    fn on_file_start(&self, _index: usize, _total: usize, path: &PathBuf) {
        let name = path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| path.display().to_string());
        self.bar.set_message(name.clone());
        *self.current_file.lock().unwrap() = name;
    }

    fn on_stage_start(&self, _index: usize, stage: Stage) {
        self.bar
            .set_message(format!("{}  {}", self.file_label(), dim(&stage.to_string())));
    }

    fn on_page_progress(&self, _index: usize, stage: Stage, current: usize, total: usize) {
        self.bar.set_message(format!(
            "{}  {}",
            self.file_label(),
            dim(&format!("{stage} {current}/{total}"))
        ));
    }

    fn on_file_complete(&self, _index: usize, outcome: &FileOutcome) {
        let name = self.file_label();
        match outcome {
            FileOutcome::Succeeded { outputs, elapsed } => {
                let target = outputs
                    .first()
                    .map(|p| p.display().to_string())
                    .unwrap_or_default();
                self.bar.println(format!(
                    "  {} {}  →  {}  {}",
                    green("✓"),
                    name,
                    target,
                    dim(&format!("{:.1}s", elapsed.as_secs_f64())),
                ));
            }
            FileOutcome::Errored { error } => {
                let mut msg = error.to_string();
                if msg.len() > 100 {
                    let cut = (0..=99).rev().find(|&i| msg.is_char_boundary(i)).unwrap_or(0);
                    msg.truncate(cut);
                    msg.push('\u{2026}');
                }
                self.bar.println(format!("  {} {}", red("✗"), red(&msg)));
            }
            FileOutcome::Skipped { existing } => {
                self.bar.println(format!(
                    "  {} {}  {}",
                    yellow("↷"),
                    name,
                    dim(&format!("exists: {}", existing.display())),
                ));
            }
            FileOutcome::Cancelled => {
                self.bar
                    .println(format!("  {} {}  {}", yellow("–"), name, dim("cancelled")));
            }
        }
        self.bar.inc(1);
    }

    fn on_job_complete(&self, _summary: &JobSummary) {
        self.bar.finish_and_clear();
    }
}

const AFTER_HELP: &str = r#"EXAMPLES:
  # Convert archives to cbz, resized to 1920px tall
  comicmill convert --height 1920 -o out/ issue-01.cbz issue-02.pdf

  # Convert a whole library folder, preserving subfolders
  comicmill convert -o converted/ ~/comics/

  # Split one big archive into three volumes
  comicmill convert --split 3 -o out/ omnibus.cbz

  # Everything into one PDF
  comicmill create --to pdf --name "Collected Edition" -o out/ ch1.cbz ch2.cbz ch3/

  # Unpack archives into folders of page images
  comicmill extract -o pages/ issue-01.cbz

  # Re-encode pages as webp at 80% scale
  comicmill convert --page-format webp --scale 80 -o out/ issue-01.cbz

PAGE ORDER:
  cbz/zip:  archive entry name order
  epub:     image entry path order
  pdf:      document page order
  folder:   file name order (recursive)

WORKER PROCESSES:
  Decoding runs in separate worker processes so corrupt files cannot crash
  the batch. --no-isolation runs everything in-process instead;
  --memory-limit caps each worker's address space (Unix only).

ENVIRONMENT VARIABLES:
  RUST_LOG            Tracing filter (e.g. comicmill=debug)
  PDFIUM_LIB_PATH     Path to an existing libpdfium shared library
"#;

/// Convert, create, and extract comic archives in batches.
#[derive(Parser, Debug)]
#[command(
    name = "comicmill",
    version,
    about = "Convert, create, and extract comic archives (cbz, pdf, epub, folders)",
    arg_required_else_help = true,
    color = clap::ColorChoice::Auto,
    after_long_help = AFTER_HELP
)]
struct Cli {
    #[command(subcommand)]
    command: Command,

    /// Enable DEBUG-level tracing logs.
    #[arg(short, long, global = true)]
    verbose: bool,

    /// Suppress all output except errors.
    #[arg(short, long, global = true)]
    quiet: bool,

    /// Disable the progress bar.
    #[arg(long, global = true)]
    no_progress: bool,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Convert each input into its own output container.
    Convert(JobArgs),
    /// Aggregate all inputs into one output container.
    Create(JobArgs),
    /// Unpack each input into a folder of page images.
    Extract(JobArgs),
}

#[derive(Args, Debug)]
struct JobArgs {
    /// Input files and folders.
    #[arg(required = true)]
    inputs: Vec<PathBuf>,

    /// Output directory.
    #[arg(short, long)]
    output: PathBuf,

    /// Output container format (ignored by `extract`).
    #[arg(long = "to", value_enum, default_value = "cbz")]
    format: FormatArg,

    /// Output base name (`create` only; default: first input's name).
    #[arg(long)]
    name: Option<String>,

    /// Re-encode every page as this format.
    #[arg(long, value_enum)]
    page_format: Option<PageFormatArg>,

    /// JPEG re-encode quality (1-100).
    #[arg(long, default_value_t = 90, value_parser = clap::value_parser!(u8).range(1..=100))]
    quality: u8,

    /// Resize pages to this height in pixels, preserving aspect ratio.
    #[arg(long, conflicts_with_all = ["width", "scale"])]
    height: Option<u32>,

    /// Resize pages to this width in pixels, preserving aspect ratio.
    #[arg(long, conflicts_with = "scale")]
    width: Option<u32>,

    /// Resize pages to a percentage of their original size (1-800).
    #[arg(long)]
    scale: Option<u32>,

    /// Crop pixels from each edge: LEFT,TOP,RIGHT,BOTTOM.
    #[arg(long, value_parser = parse_edges)]
    crop: Option<[u32; 4]>,

    /// Brightness delta (-255 to 255).
    #[arg(long, default_value_t = 0, allow_hyphen_values = true)]
    brightness: i32,

    /// Saturation multiplier (0.0 grayscale, 1.0 unchanged).
    #[arg(long, default_value_t = 1.0)]
    saturation: f32,

    /// Add a border on each edge: LEFT,TOP,RIGHT,BOTTOM.
    #[arg(long, value_parser = parse_edges)]
    extend: Option<[u32; 4]>,

    /// Border colour as RRGGBB hex.
    #[arg(long, default_value = "000000", value_parser = parse_color)]
    extend_color: [u8; 3],

    /// Split each output into N volumes.
    #[arg(long, default_value_t = 1, value_parser = clap::value_parser!(u32).range(1..))]
    split: u32,

    /// What to do when an output name already exists.
    #[arg(long, value_enum, default_value = "rename")]
    on_collision: CollisionArg,

    /// How to interpret folders passed as inputs.
    #[arg(long, value_enum, default_value = "comics")]
    folders_contain: FoldersArg,

    /// PDF page images: extract embedded rasters or render at --dpi.
    #[arg(long, value_enum, default_value = "prefer-embedded")]
    embedded: EmbeddedArg,

    /// Render DPI for rasterised PDF pages (72-400).
    #[arg(long, default_value_t = 150, value_parser = clap::value_parser!(u32).range(72..=400))]
    dpi: u32,

    /// Password for encrypted PDF inputs.
    #[arg(long)]
    password: Option<String>,

    /// Run page transforms through a worker pool instead of sequentially.
    #[arg(long)]
    pooled: bool,

    /// Transform pool size (default: half the hardware threads).
    #[arg(long)]
    workers: Option<usize>,

    /// Run decoders in-process instead of in worker processes.
    #[arg(long)]
    no_isolation: bool,

    /// Worker address-space cap in MiB; 0 disables the cap (Unix only).
    #[arg(long, default_value_t = 2048)]
    memory_limit: u64,

    /// Drop ComicInfo.xml sidecars instead of carrying them through.
    #[arg(long)]
    no_comic_info: bool,

    /// Parent directory for temp workspaces (default: system temp dir).
    #[arg(long)]
    scratch_dir: Option<PathBuf>,
}

#[derive(clap::ValueEnum, Clone, Copy, Debug)]
enum FormatArg {
    Cbz,
    Pdf,
    Folder,
}

#[derive(clap::ValueEnum, Clone, Copy, Debug)]
enum PageFormatArg {
    Jpeg,
    Png,
    Webp,
}

#[derive(clap::ValueEnum, Clone, Copy, Debug)]
enum CollisionArg {
    Overwrite,
    Rename,
    Skip,
}

#[derive(clap::ValueEnum, Clone, Copy, Debug)]
enum FoldersArg {
    Comics,
    Images,
}

#[derive(clap::ValueEnum, Clone, Copy, Debug)]
enum EmbeddedArg {
    PreferEmbedded,
    FixedDpi,
    RequireEmbedded,
}

fn parse_edges(s: &str) -> Result<[u32; 4], String> {
    let parts: Vec<&str> = s.split(',').map(str::trim).collect();
    if parts.len() != 4 {
        return Err("expected LEFT,TOP,RIGHT,BOTTOM".to_string());
    }
    let mut edges = [0u32; 4];
    for (slot, part) in edges.iter_mut().zip(&parts) {
        *slot = part
            .parse()
            .map_err(|_| format!("invalid edge value '{part}'"))?;
    }
    Ok(edges)
}

fn parse_color(s: &str) -> Result<[u8; 3], String> {
    let hex = s.trim_start_matches('#');
    if hex.len() != 6 {
        return Err("expected RRGGBB hex".to_string());
    }
    let value = u32::from_str_radix(hex, 16).map_err(|_| format!("invalid hex colour '{s}'"))?;
    Ok([(value >> 16) as u8, (value >> 8) as u8, value as u8])
}

fn main() -> std::process::ExitCode {
    // Worker mode bypasses the CLI entirely; the supervisor speaks the wire
    // protocol over stdin/stdout and any clap output would corrupt it.
    if std::env::args()
        .nth(1)
        .is_some_and(|a| a == comicmill::worker::WORKER_ARG)
    {
        return comicmill::worker::worker_main();
    }

    match run() {
        Ok(code) => code,
        Err(e) => {
            eprintln!("{} {e:#}", red("error:"));
            std::process::ExitCode::FAILURE
        }
    }
}

#[tokio::main]
async fn run() -> Result<std::process::ExitCode> {
    let cli = Cli::parse();

    // The bar owns the terminal while it runs; keep library logs down to
    // errors unless the user asks for more.
    let show_progress = !cli.quiet && !cli.no_progress;
    let filter = if cli.verbose {
        "debug"
    } else if cli.quiet || show_progress {
        "error"
    } else {
        "info"
    };
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(filter)))
        .with_writer(io::stderr)
        .init();

    let (mode, args) = match &cli.command {
        Command::Convert(args) => (JobMode::Convert, args),
        Command::Create(args) => (JobMode::Create, args),
        Command::Extract(args) => (JobMode::Extract, args),
    };
    let options = build_options(mode, args)?;

    let mut orchestrator = Orchestrator::new(options);
    if show_progress {
        let cb = CliProgressCallback::new();
        orchestrator = orchestrator.with_progress(cb as ProgressCallback);
    }

    let summary = orchestrator
        .run(args.inputs.clone())
        .await
        .context("batch failed")?;

    if !cli.quiet {
        let c = &summary.counters;
        let tick = if c.errors == 0 { green("✔") } else { yellow("⚠") };
        eprintln!("{tick} {}", bold(&summary.headline()));
        for (path, cause) in &summary.failed_files {
            eprintln!("   {} {}: {}", red("✗"), path.display(), dim(cause));
        }
    }

    Ok(if summary.counters.errors == 0 {
        std::process::ExitCode::SUCCESS
    } else {
        std::process::ExitCode::FAILURE
    })
}

/// Map CLI args to `JobOptions`.
fn build_options(mode: JobMode, args: &JobArgs) -> Result<JobOptions> {
    let mut builder = JobOptions::builder(mode, &args.output)
        .output_format(match args.format {
            FormatArg::Cbz => OutputFormat::Cbz,
            FormatArg::Pdf => OutputFormat::Pdf,
            FormatArg::Folder => OutputFormat::Folder,
        })
        .jpeg_quality(args.quality)
        .brightness(args.brightness)
        .saturation(args.saturation)
        .split_count(args.split)
        .on_collision(match args.on_collision {
            CollisionArg::Overwrite => CollisionPolicy::Overwrite,
            CollisionArg::Rename => CollisionPolicy::Rename,
            CollisionArg::Skip => CollisionPolicy::Skip,
        })
        .input_folders_contain(match args.folders_contain {
            FoldersArg::Comics => FolderContents::Comics,
            FoldersArg::Images => FolderContents::Images,
        })
        .embedded_resolution(match args.embedded {
            EmbeddedArg::PreferEmbedded => EmbeddedResolution::PreferEmbedded,
            EmbeddedArg::FixedDpi => EmbeddedResolution::FixedDpi,
            EmbeddedArg::RequireEmbedded => EmbeddedResolution::RequireEmbedded,
        })
        .dpi(args.dpi)
        .isolate_workers(!args.no_isolation)
        .worker_memory_limit_mb((args.memory_limit > 0).then_some(args.memory_limit))
        .keep_comic_info(!args.no_comic_info);

    if let Some(name) = &args.name {
        builder = builder.output_name(name);
    }
    if let Some(f) = args.page_format {
        builder = builder.page_format(match f {
            PageFormatArg::Jpeg => PageFormat::Jpeg,
            PageFormatArg::Png => PageFormat::Png,
            PageFormatArg::Webp => PageFormat::Webp,
        });
    }
    if let Some(h) = args.height {
        builder = builder.resize(ResizeMode::FitHeight(h));
    } else if let Some(w) = args.width {
        builder = builder.resize(ResizeMode::FitWidth(w));
    } else if let Some(p) = args.scale {
        builder = builder.resize(ResizeMode::Percent(p));
    }
    if let Some([left, top, right, bottom]) = args.crop {
        builder = builder.crop(CropSpec {
            left,
            top,
            right,
            bottom,
        });
    }
    if let Some([left, top, right, bottom]) = args.extend {
        builder = builder.extend(ExtendSpec {
            left,
            top,
            right,
            bottom,
            color: args.extend_color,
        });
    }
    if args.pooled {
        builder = builder.transform_execution(TransformExecution::Pooled);
    }
    if let Some(workers) = args.workers {
        builder = builder.max_workers(workers);
    }
    if let Some(dir) = &args.scratch_dir {
        builder = builder.scratch_dir(dir);
    }
    if let Some(pwd) = &args.password {
        builder = builder.password(pwd);
    }

    builder.build().context("invalid options")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn edge_and_colour_parsers() {
        assert_eq!(parse_edges("1, 2,3,4").unwrap(), [1, 2, 3, 4]);
        assert!(parse_edges("1,2,3").is_err());
        assert_eq!(parse_color("#ff8000").unwrap(), [255, 128, 0]);
        assert!(parse_color("red").is_err());
    }

    #[test]
    fn cli_maps_to_job_options() {
        let cli = Cli::parse_from([
            "comicmill", "convert", "in.cbz", "-o", "out/", "--height", "1920", "--split", "2",
            "--on-collision", "skip", "--no-isolation",
        ]);
        let Command::Convert(args) = &cli.command else {
            panic!("expected convert");
        };
        let options = build_options(JobMode::Convert, args).unwrap();
        assert_eq!(options.resize, Some(ResizeMode::FitHeight(1920)));
        assert_eq!(options.split_count, 2);
        assert_eq!(options.on_collision, CollisionPolicy::Skip);
        assert!(!options.isolate_workers);
    }
}
