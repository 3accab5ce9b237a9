//! # Slidestitch CLI
//!
//! Command-line interface for the slidestitch library.
//! Converts directories of slide fragments into tiled TIFF pyramids.

use std::io::IsTerminal;
use std::path::PathBuf;

use anyhow::{bail, Context, Result};
use clap::Parser;
use log::{error, warn};
use slidestitch::{Compression, ConvertOptions, SlideOutcome, TiffPyramidEncoder};

mod cli;

/// Command-line interface for slidestitch
#[derive(Parser)]
#[command(name = "slidestitch")]
#[command(about = "Reassembles tiled slide fragments into a single pyramidal TIFF")]
#[command(long_about = "Reassembles tiled slide fragments into a single pyramidal TIFF:
  slidestitch slides/case-01                 # Convert one slide into ./output/
  slidestitch slides/* -o converted/         # Convert every slide directory
  slidestitch slides/* --anonymize           # Name outputs DP0001, DP0002, ...

Each SLIDE_DIR holds fragment manifests (<name>.json) with their frame
files (<name>.tiles). Slides whose output already exists are skipped.")]
#[command(version = env!("SLIDESTITCH_VERSION"))]
struct Cli {
    /// Slide directories, one per slide
    #[arg(value_name = "SLIDE_DIR", required = true)]
    slides: Vec<PathBuf>,

    /// Output directory
    #[arg(short, long, default_value = "./output/")]
    outdir: PathBuf,

    /// Worker threads per fragment [default: number of CPUs]
    #[arg(short = 'n', long)]
    workers: Option<usize>,

    /// Name outputs DP0001, DP0002, ... instead of the directory name
    #[arg(short, long)]
    anonymize: bool,

    /// Page compression: none, lzw or deflate
    #[arg(long, default_value = "lzw")]
    compression: Compression,

    /// Background color of uncovered cells as RRGGBB
    #[arg(long, default_value = "FFFFFF", value_parser = parse_color)]
    background: [u8; 3],

    /// Enable verbose logging
    #[arg(short, long)]
    verbose: bool,
}

/// Parse a `RRGGBB` hex color
fn parse_color(value: &str) -> std::result::Result<[u8; 3], String> {
    let hex = value.trim_start_matches('#');
    if hex.len() != 6 || !hex.is_ascii() {
        return Err(format!("expected RRGGBB, got '{value}'"));
    }
    let mut rgb = [0u8; 3];
    for (i, channel) in rgb.iter_mut().enumerate() {
        *channel = u8::from_str_radix(&hex[2 * i..2 * i + 2], 16)
            .map_err(|_| format!("expected RRGGBB, got '{value}'"))?;
    }
    Ok(rgb)
}

fn main() {
    if let Err(e) = run() {
        error!("❌ Error: {e:#}");
        std::process::exit(1);
    }
}

fn run() -> Result<()> {
    let cli = Cli::parse();

    // Initialize logging to stderr; RUST_LOG wins over --verbose
    let default_filter = if cli.verbose { "debug" } else { "info" };
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(default_filter))
        .target(env_logger::Target::Stderr)
        .init();

    if cli.verbose {
        eprintln!("🔬 Slidestitch v{} starting...", env!("SLIDESTITCH_VERSION"));
    }

    for dir in cli.slides.iter().filter(|d| !d.is_dir()) {
        warn!("{} is not a directory, it will be logged as failed", dir.display());
    }
    std::fs::create_dir_all(&cli.outdir)
        .with_context(|| format!("cannot create output directory {}", cli.outdir.display()))?;
    eprintln!("📁 Saving to: {}", cli.outdir.display());

    let workers = cli.workers.unwrap_or_else(num_cpus::get);
    if workers == 0 {
        bail!("--workers must be at least 1");
    }

    let progress = std::io::stderr().is_terminal().then(|| {
        cli::ProgressManager::new(&format!(
            "🧩 Converting {} slide(s) with {} worker(s)",
            cli.slides.len(),
            workers
        ))
    });
    let options = ConvertOptions {
        workers,
        background: cli.background,
        anonymize: cli.anonymize,
        compression: cli.compression,
        progress: progress.as_ref().map(|p| p.callback()),
    };

    let encoder = TiffPyramidEncoder::new(options.compression);
    let report = slidestitch::convert_directories(&cli.slides, &cli.outdir, &encoder, &options)
        .context("conversion run aborted")?;
    if let Some(progress) = &progress {
        progress.finish();
    }

    for outcome in &report.outcomes {
        match outcome {
            SlideOutcome::Converted(summary) => eprintln!(
                "✅ {} -> {} ({}x{} px, {}x)",
                summary.name,
                summary.output.display(),
                summary.geometry.canvas_width,
                summary.geometry.canvas_height,
                summary.metadata.magnification
            ),
            SlideOutcome::Skipped { name, output } => {
                eprintln!("⏭️  {} skipped, {} already exists", name, output.display())
            }
            SlideOutcome::Failed { name, reason } => eprintln!("❌ {name}: {reason}"),
        }
    }

    match &report.log_path {
        None => eprintln!("No error detected, empty log deleted."),
        Some(log) => eprintln!("📝 Failures logged to {}", log.display()),
    }

    let failed = report.failed();
    if !failed.is_empty() {
        bail!("{} slide(s) failed: {}", failed.len(), failed.join(", "));
    }
    Ok(())
}
