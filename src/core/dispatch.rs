//! Worker pool and tile dispatch
//!
//! A fragment's tile indices are cut into contiguous batches, one per worker.
//! Every batch opens its own canvas handle and writes the tiles whose global
//! positions follow from the closed-form mapping `offset + j -> (row, col)`.
//! Distinct indices map to distinct tiles, so batches never touch the same
//! region and need no locking.

use std::ops::Range;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use log::debug;
use rayon::prelude::*;

use crate::core::canvas::CanvasStore;
use crate::core::color::{self, CANVAS_CHANNELS};
use crate::core::coverage::CoverageIndex;
use crate::core::error::{Error, Result};
use crate::core::geometry::GridGeometry;
use crate::core::source::{Fragment, TileRequest, TileSource};

/// Progress callback, called with `(done, total)`
///
/// Each fragment first reports `(0, total)` from the dispatching thread, then
/// once per written tile from the workers. Worker calls may arrive out of
/// order, so `done` is not monotonic across calls.
pub type ProgressCallback = Arc<dyn Fn(u64, u64) + Send + Sync>;

/// Fixed-size pool of worker threads
///
/// [`WorkerPool::run`] blocks until every batch has finished.
pub struct WorkerPool {
    pool: rayon::ThreadPool,
    workers: usize,
}

impl WorkerPool {
    pub fn new(workers: usize) -> Result<Self> {
        if workers == 0 {
            return Err(Error::InvalidInput("worker count must be at least 1".to_string()));
        }
        let pool = rayon::ThreadPoolBuilder::new()
            .num_threads(workers)
            .thread_name(|i| format!("slidestitch-worker-{i}"))
            .build()
            .map_err(|e| Error::InvalidInput(format!("failed to start worker pool: {e}")))?;
        Ok(Self { pool, workers })
    }

    pub fn workers(&self) -> usize {
        self.workers
    }

    /// Run `task` over every batch in parallel and return the first failure
    pub fn run<T, F>(&self, batches: &[T], task: F) -> Result<()>
    where
        T: Sync,
        F: Fn(&T) -> Result<()> + Send + Sync,
    {
        self.pool
            .install(|| batches.par_iter().try_for_each(|batch| task(batch)))
    }
}

/// Split `0..count` into contiguous batches of `ceil(count / workers)` indices
pub fn partition(count: u64, workers: usize) -> Vec<Range<u64>> {
    if count == 0 {
        return Vec::new();
    }
    let size = count.div_ceil(workers.max(1) as u64);
    (0..count)
        .step_by(size as usize)
        .map(|start| start..(start + size).min(count))
        .collect()
}

/// Tiles written by one dispatch
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct DispatchStats {
    /// Tiles read from the source
    pub real_tiles: u64,
    /// Tiles the coverage index marked as absent
    pub background_tiles: u64,
}

/// Drives one fragment's tiles into the canvas
pub struct TileDispatcher<'a> {
    pub geometry: &'a GridGeometry,
    pub store: &'a CanvasStore,
    pub pool: &'a WorkerPool,
    pub background: [u8; 3],
    pub progress: Option<ProgressCallback>,
}

impl TileDispatcher<'_> {
    /// Write every tile of `fragment` exactly once
    ///
    /// With a coverage index, cells without an anchor receive the background
    /// color and the source is not asked for them.
    pub fn dispatch(
        &self,
        fragment: &Fragment,
        source: &dyn TileSource,
        coverage: Option<&CoverageIndex>,
    ) -> Result<DispatchStats> {
        if usize::from(self.store.channels()) != CANVAS_CHANNELS {
            return Err(Error::InvalidInput(format!(
                "canvas has {} channels, tiles are converted to {}",
                self.store.channels(),
                CANVAS_CHANNELS
            )));
        }
        let last = fragment.tile_offset.saturating_add(fragment.tile_count);
        if last > self.geometry.cell_count() {
            return Err(Error::InvalidInput(format!(
                "fragment '{}' ends at tile {}, grid has {} cells",
                fragment.name,
                last,
                self.geometry.cell_count()
            )));
        }

        let batches = partition(fragment.tile_count, self.pool.workers());
        debug!(
            "Dispatching {} tiles of '{}' in {} batches",
            fragment.tile_count,
            fragment.name,
            batches.len()
        );

        let background_tile = self.background.repeat(self.geometry.tile_pixels());
        let real = AtomicU64::new(0);
        let blank = AtomicU64::new(0);
        let done = AtomicU64::new(0);
        if let Some(progress) = &self.progress {
            progress(0, fragment.tile_count);
        }

        self.pool.run(&batches, |range| {
            let mut handle = self.store.handle()?;
            for j in range.clone() {
                let request = TileRequest {
                    index: j,
                    local: self.geometry.position(0, j),
                    global: self.geometry.position(fragment.tile_offset, j),
                };

                let covered = coverage.map_or(true, |index| index.has_tile(request.global));
                if covered {
                    let pixels = self.fetch(fragment, source, request)?;
                    handle.write_tile(request.global, &pixels)?;
                    real.fetch_add(1, Ordering::Relaxed);
                } else {
                    handle.write_tile(request.global, &background_tile)?;
                    blank.fetch_add(1, Ordering::Relaxed);
                }

                let finished = done.fetch_add(1, Ordering::Relaxed) + 1;
                if let Some(progress) = &self.progress {
                    progress(finished, fragment.tile_count);
                }
            }
            handle.sync()
        })?;

        Ok(DispatchStats {
            real_tiles: real.into_inner(),
            background_tiles: blank.into_inner(),
        })
    }

    fn fetch(
        &self,
        fragment: &Fragment,
        source: &dyn TileSource,
        request: TileRequest,
    ) -> Result<Vec<u8>> {
        let raw = source.read_tile(request)?;
        let rgb = color::to_rgb(&raw.pixels, raw.color_space, self.background)
            .map_err(|e| Error::source_read(&fragment.name, format!("tile {}: {e}", request.index)))?;

        let expected = self.geometry.tile_pixels() * CANVAS_CHANNELS;
        if rgb.len() != expected {
            return Err(Error::source_read(
                &fragment.name,
                format!(
                    "tile {} has {} RGB bytes, expected {}",
                    request.index,
                    rgb.len(),
                    expected
                ),
            ));
        }
        Ok(rgb)
    }
}
