//! # Slidestitch Library
//!
//! Reassembles a full-resolution slide image from fragment files that each
//! carry part of the tile grid, and writes it out as a tiled pyramid.
//!
//! ## Features
//!
//! - **Mixed addressing**: sequential fragments placed by tile offset next to
//!   sparse fragments that anchor every tile explicitly
//! - **Parallel writes**: tiles of a fragment are written concurrently into a
//!   disk-backed canvas, one file handle per worker
//! - **Gap filling**: cells no fragment covers get a background color
//! - **Per-slide isolation**: a failing slide is logged and the run continues
//!
//! ## Basic Usage
//!
//! ```rust,no_run
//! use std::path::PathBuf;
//!
//! fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let report = slidestitch::convert(&[PathBuf::from("./slides/case-01")], "./output")?;
//!     for name in report.failed() {
//!         eprintln!("failed: {name}");
//!     }
//!     Ok(())
//! }
//! ```
//!
//! ## Progress Tracking
//!
//! ```rust,no_run
//! use std::path::PathBuf;
//! use std::sync::Arc;
//! use slidestitch::ConvertOptions;
//!
//! fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let options = ConvertOptions {
//!         workers: 4,
//!         progress: Some(Arc::new(|done: u64, total: u64| println!("{done}/{total} tiles"))),
//!         ..Default::default()
//!     };
//!     let slides = [PathBuf::from("./slides/case-01")];
//!     slidestitch::convert_with_options(&slides, "./output", &options)?;
//!     Ok(())
//! }
//! ```

use std::path::{Path, PathBuf};

mod core;

pub use crate::core::batch::{
    canvas_path, convert_directories, convert_slide, load_fragments, output_path, ConvertOptions,
    FailureLog, RunReport, SlideOutcome, SlideSummary,
};
pub use crate::core::canvas::{CanvasHandle, CanvasStore};
pub use crate::core::color::{to_rgb, ColorSpace, CANVAS_CHANNELS};
pub use crate::core::coverage::CoverageIndex;
pub use crate::core::dispatch::{partition, DispatchStats, ProgressCallback, TileDispatcher, WorkerPool};
pub use crate::core::error::{Error, Result};
pub use crate::core::fill::fill_background;
pub use crate::core::fragment_file::{discover_fragments, FragmentFile, FragmentManifest};
pub use crate::core::geometry::{DeclaredExtent, GridGeometry, TilePosition};
pub use crate::core::level::{
    plan_fragments, select_base_level, FragmentReport, LevelMerger, MergedLevel, PlannedFragment,
};
pub use crate::core::pyramid::{Compression, PyramidEncoder, SlideMetadata, TiffPyramidEncoder};
pub use crate::core::source::{
    classify, magnification_from_mpp, mpp_from_magnification, Addressing, AddressingMode,
    Fragment, FragmentDescriptor, PixelAnchor, RawTile, TileRequest, TileSource,
};

/// Convert slide directories into TIFF pyramids with default options
///
/// # Arguments
/// * `dirs` - One directory per slide, each holding fragment manifests
/// * `outdir` - Destination directory, created if missing
pub fn convert<P: AsRef<Path>>(dirs: &[PathBuf], outdir: P) -> Result<RunReport> {
    convert_with_options(dirs, outdir, &ConvertOptions::default())
}

/// Convert slide directories with custom options
pub fn convert_with_options<P: AsRef<Path>>(
    dirs: &[PathBuf],
    outdir: P,
    options: &ConvertOptions,
) -> Result<RunReport> {
    let encoder = TiffPyramidEncoder::new(options.compression);
    convert_directories(dirs, outdir.as_ref(), &encoder, options)
}
