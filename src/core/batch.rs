//! Per-slide conversion driver
//!
//! Each input directory is one slide. A slide is converted end to end:
//! fragments are loaded, the highest magnification is selected, the level is
//! merged into a temporary canvas and handed to the pyramid encoder. A failed
//! slide is logged and recorded in the run's failure log; the run continues
//! with the next slide.

use std::error::Error as _;
use std::fs::{File, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};

use chrono::Local;
use log::{debug, error, info, warn};

use crate::core::dispatch::{ProgressCallback, WorkerPool};
use crate::core::error::{Error, Result};
use crate::core::fragment_file::{discover_fragments, FragmentFile};
use crate::core::geometry::GridGeometry;
use crate::core::level::{select_base_level, FragmentReport, LevelMerger};
use crate::core::pyramid::{Compression, PyramidEncoder, SlideMetadata};
use crate::core::source::{mpp_from_magnification, TileSource};

const OUTPUT_EXTENSION: &str = "tiff";
const CANVAS_SUFFIX: &str = "_temp.canvas";

/// Options for a conversion run
#[derive(Clone)]
pub struct ConvertOptions {
    /// Worker threads per fragment dispatch
    pub workers: usize,
    /// RGB value of cells no fragment covers
    pub background: [u8; 3],
    /// Replace slide names with `DP0001`, `DP0002`, ...
    pub anonymize: bool,
    pub compression: Compression,
    pub progress: Option<ProgressCallback>,
}

impl Default for ConvertOptions {
    fn default() -> Self {
        Self {
            workers: num_cpus::get(),
            background: [255, 255, 255],
            anonymize: false,
            compression: Compression::default(),
            progress: None,
        }
    }
}

impl std::fmt::Debug for ConvertOptions {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConvertOptions")
            .field("workers", &self.workers)
            .field("background", &self.background)
            .field("anonymize", &self.anonymize)
            .field("compression", &self.compression)
            .field("progress", &self.progress.is_some())
            .finish()
    }
}

/// Result of one converted slide
#[derive(Debug, Clone)]
pub struct SlideSummary {
    pub name: String,
    pub output: PathBuf,
    pub metadata: SlideMetadata,
    pub geometry: GridGeometry,
    pub complete: bool,
    pub filled_cells: u64,
    pub fragments: Vec<FragmentReport>,
}

/// What happened to one input directory
#[derive(Debug)]
pub enum SlideOutcome {
    Converted(SlideSummary),
    /// The output already existed
    Skipped { name: String, output: PathBuf },
    Failed { name: String, reason: String },
}

impl SlideOutcome {
    pub fn name(&self) -> &str {
        match self {
            SlideOutcome::Converted(summary) => &summary.name,
            SlideOutcome::Skipped { name, .. } | SlideOutcome::Failed { name, .. } => name,
        }
    }
}

/// Outcome of a whole run
#[derive(Debug, Default)]
pub struct RunReport {
    pub outcomes: Vec<SlideOutcome>,
    /// Failure log, `None` when it was empty and removed
    pub log_path: Option<PathBuf>,
}

impl RunReport {
    pub fn converted(&self) -> usize {
        self.outcomes
            .iter()
            .filter(|o| matches!(o, SlideOutcome::Converted(_)))
            .count()
    }

    pub fn skipped(&self) -> usize {
        self.outcomes
            .iter()
            .filter(|o| matches!(o, SlideOutcome::Skipped { .. }))
            .count()
    }

    /// Names of the slides that failed
    pub fn failed(&self) -> Vec<&str> {
        self.outcomes
            .iter()
            .filter(|o| matches!(o, SlideOutcome::Failed { .. }))
            .map(SlideOutcome::name)
            .collect()
    }
}

/// Output path of a slide
pub fn output_path(outdir: &Path, name: &str) -> PathBuf {
    outdir.join(format!("{name}.{OUTPUT_EXTENSION}"))
}

/// Temporary canvas path of a slide
pub fn canvas_path(outdir: &Path, name: &str) -> PathBuf {
    outdir.join(format!("{name}{CANVAS_SUFFIX}"))
}

/// Convert one slide from its fragments
///
/// The temporary canvas is deleted after a successful encode and kept when
/// the encoder fails.
pub fn convert_slide(
    name: &str,
    sources: Vec<Box<dyn TileSource>>,
    outdir: &Path,
    encoder: &dyn PyramidEncoder,
    options: &ConvertOptions,
) -> Result<SlideSummary> {
    let (magnification, level) = select_base_level(sources)?;
    let metadata = SlideMetadata {
        magnification,
        mpp: mpp_from_magnification(magnification),
    };
    info!(
        "Slide {}: {} fragment(s) at {}x ({} µm/px)",
        name,
        level.len(),
        metadata.magnification,
        metadata.mpp
    );

    let pool = WorkerPool::new(options.workers)?;
    let merger = LevelMerger {
        pool: &pool,
        background: options.background,
        progress: options.progress.clone(),
    };
    let merged = merger.merge(&level, &canvas_path(outdir, name))?;

    let output = output_path(outdir, name);
    if let Err(e) = encoder.encode(&merged.store, &metadata, &output) {
        warn!(
            "Keeping canvas {} after encode failure",
            merged.store.path().display()
        );
        if output.exists() {
            if let Err(cleanup) = std::fs::remove_file(&output) {
                warn!("Could not remove partial output {}: {cleanup}", output.display());
            }
        }
        return Err(match e {
            Error::Encode(_) => e,
            other => Error::Encode(other.to_string()),
        });
    }

    let canvas = merged.store.path().to_path_buf();
    if let Err(e) = merged.store.remove() {
        warn!("Could not remove canvas {}: {e}", canvas.display());
    }
    info!("Slide {} written to {}", name, output.display());

    Ok(SlideSummary {
        name: name.to_string(),
        output,
        metadata,
        geometry: merged.geometry,
        complete: merged.complete,
        filled_cells: merged.filled_cells,
        fragments: merged.fragments,
    })
}

/// Open every fragment in a slide directory
///
/// Fragments that fail to open are skipped with a warning.
pub fn load_fragments<P: AsRef<Path>>(dir: P) -> Result<Vec<Box<dyn TileSource>>> {
    let dir = dir.as_ref();
    if !dir.is_dir() {
        return Err(Error::InvalidInput(format!("{} is not a directory", dir.display())));
    }
    let mut sources: Vec<Box<dyn TileSource>> = Vec::new();
    for manifest in discover_fragments(dir)? {
        match FragmentFile::open(&manifest) {
            Ok(fragment) => sources.push(Box::new(fragment)),
            Err(e) => warn!("Skipping {}: {e}", manifest.display()),
        }
    }
    if sources.is_empty() {
        return Err(Error::InvalidInput(format!(
            "no readable fragments in {}",
            dir.display()
        )));
    }
    Ok(sources)
}

/// Convert every slide directory into `outdir`
///
/// Only failing to prepare `outdir` or the failure log aborts the run.
pub fn convert_directories(
    dirs: &[PathBuf],
    outdir: &Path,
    encoder: &dyn PyramidEncoder,
    options: &ConvertOptions,
) -> Result<RunReport> {
    std::fs::create_dir_all(outdir).map_err(|e| Error::store_io(outdir, e))?;
    let mut log = FailureLog::create(outdir)?;
    let mut report = RunReport::default();

    for (i, dir) in dirs.iter().enumerate() {
        let name = slide_name(dir, i, options.anonymize);
        info!("[{}/{}] {} ({})", i + 1, dirs.len(), name, dir.display());

        let output = output_path(outdir, &name);
        if output.exists() {
            info!("Skipping {}: {} already exists", name, output.display());
            report.outcomes.push(SlideOutcome::Skipped { name, output });
            continue;
        }

        let converted = load_fragments(dir)
            .and_then(|sources| convert_slide(&name, sources, outdir, encoder, options));
        match converted {
            Ok(summary) => report.outcomes.push(SlideOutcome::Converted(summary)),
            Err(e) => {
                let reason = cause_chain(&e);
                error!("Slide {} failed: {}", name, reason);
                log.record(&name, &reason)?;
                report.outcomes.push(SlideOutcome::Failed { name, reason });
            }
        }
    }

    report.log_path = log.finish()?;
    Ok(report)
}

fn slide_name(dir: &Path, index: usize, anonymize: bool) -> String {
    if anonymize {
        return format!("DP{:04}", index + 1);
    }
    dir.file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_else(|| format!("slide{:04}", index + 1))
}

fn cause_chain(err: &Error) -> String {
    let mut message = err.to_string();
    let mut source = std::error::Error::source(err);
    while let Some(cause) = source {
        let text = cause.to_string();
        // Variants already render their direct source
        if !message.ends_with(&text) {
            message.push_str(": ");
            message.push_str(&text);
        }
        source = cause.source();
    }
    message
}

/// Per-run log of failed slides
pub struct FailureLog {
    path: PathBuf,
    file: File,
    entries: usize,
}

impl FailureLog {
    /// Open `conversion_log_<date>_<HH>h<MM>.log` in `outdir`
    pub fn create(outdir: &Path) -> Result<Self> {
        let stamp = Local::now().format("%Y-%m-%d_%Hh%M");
        let path = outdir.join(format!("conversion_log_{stamp}.log"));
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .map_err(|e| Error::store_io(&path, e))?;
        Ok(Self {
            path,
            file,
            entries: 0,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn record(&mut self, slide: &str, reason: &str) -> Result<()> {
        let now = Local::now().format("%Y-%m-%d %H:%M:%S");
        writeln!(self.file, "{now} - ERROR - Slide {slide} failed: {reason}")
            .map_err(|e| Error::store_io(&self.path, e))?;
        self.entries += 1;
        Ok(())
    }

    /// Close the log, removing it when nothing was written
    pub fn finish(mut self) -> Result<Option<PathBuf>> {
        self.file.flush().map_err(|e| Error::store_io(&self.path, e))?;
        let len = self
            .file
            .metadata()
            .map_err(|e| Error::store_io(&self.path, e))?
            .len();
        if self.entries == 0 && len == 0 {
            drop(self.file);
            std::fs::remove_file(&self.path).map_err(|e| Error::store_io(&self.path, e))?;
            debug!("Removed empty failure log {}", self.path.display());
            return Ok(None);
        }
        Ok(Some(self.path))
    }
}
