//! Background fill pass
//!
//! After all fragments of a sparse level are written, any cell that still holds
//! only zeros was never written and gets the background color. Cells are
//! independent, so rows of cells are spread over the worker pool.

use std::sync::atomic::{AtomicU64, Ordering};

use log::info;

use crate::core::canvas::CanvasStore;
use crate::core::dispatch::{partition, WorkerPool};
use crate::core::error::Result;
use crate::core::geometry::GridGeometry;

/// Fill never-written cells with `background`; returns the number filled
pub fn fill_background(
    store: &CanvasStore,
    pool: &WorkerPool,
    background: &[u8],
) -> Result<u64> {
    let geometry: GridGeometry = *store.geometry();
    let tile_bytes = store.tile_bytes();
    let background_tile: Vec<u8> = background
        .iter()
        .copied()
        .cycle()
        .take(tile_bytes)
        .collect();

    let filled = AtomicU64::new(0);
    let batches = partition(geometry.cell_count(), pool.workers());

    pool.run(&batches, |range| {
        let mut handle = store.handle()?;
        let mut tile = vec![0u8; tile_bytes];
        for cell in range.clone() {
            let pos = geometry.position(0, cell);
            handle.read_tile_into(pos, &mut tile)?;
            if tile.iter().all(|&b| b == 0) {
                handle.write_tile(pos, &background_tile)?;
                filled.fetch_add(1, Ordering::Relaxed);
            }
        }
        handle.sync()
    })?;

    let filled = filled.into_inner();
    info!(
        "Filled {} of {} cells with background",
        filled,
        geometry.cell_count()
    );
    Ok(filled)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::geometry::{DeclaredExtent, TilePosition};
    use tempfile::TempDir;

    const WHITE: [u8; 3] = [255, 255, 255];

    fn store(dir: &TempDir) -> CanvasStore {
        let g = GridGeometry::resolve(DeclaredExtent {
            total_rows: 6,
            total_cols: 8,
            tile_width: 2,
            tile_height: 2,
        })
        .unwrap();
        CanvasStore::create(dir.path().join("fill.canvas"), g, 3).unwrap()
    }

    #[test]
    fn test_fills_only_unwritten_cells() {
        let dir = TempDir::new().unwrap();
        let store = store(&dir);
        let mut h = store.handle().unwrap();
        let data = vec![7u8; 12];
        h.write_tile(TilePosition::new(0, 0), &data).unwrap();
        // A tile that is mostly black but not all zero counts as written
        let mut dark = vec![0u8; 12];
        dark[11] = 1;
        h.write_tile(TilePosition::new(2, 3), &dark).unwrap();

        let pool = WorkerPool::new(3).unwrap();
        let filled = fill_background(&store, &pool, &WHITE).unwrap();
        assert_eq!(filled, 10);

        assert_eq!(h.read_tile(TilePosition::new(0, 0)).unwrap(), data);
        assert_eq!(h.read_tile(TilePosition::new(2, 3)).unwrap(), dark);
        assert_eq!(h.read_tile(TilePosition::new(1, 1)).unwrap(), vec![255u8; 12]);
    }

    #[test]
    fn test_fill_is_idempotent() {
        let dir = TempDir::new().unwrap();
        let store = store(&dir);
        store
            .handle()
            .unwrap()
            .write_tile(TilePosition::new(1, 2), &[3u8; 12])
            .unwrap();

        let pool = WorkerPool::new(2).unwrap();
        fill_background(&store, &pool, &WHITE).unwrap();
        let first = store.read_raster().unwrap();
        let filled_again = fill_background(&store, &pool, &WHITE).unwrap();
        let second = store.read_raster().unwrap();

        assert_eq!(filled_again, 0);
        assert_eq!(first, second);
    }

    #[test]
    fn test_background_pattern_repeats_per_pixel() {
        let dir = TempDir::new().unwrap();
        let store = store(&dir);
        let pool = WorkerPool::new(1).unwrap();
        fill_background(&store, &pool, &[10, 20, 30]).unwrap();
        let tile = store.handle().unwrap().read_tile(TilePosition::new(0, 0)).unwrap();
        assert_eq!(tile, [10, 20, 30].repeat(4));
    }
}
