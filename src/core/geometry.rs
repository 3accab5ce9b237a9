//! Tile grid geometry for one magnification level
//!
//! The grid is derived once from a representative fragment. Row and column
//! counts are ceiling divisions, so the canvas may overhang the true image
//! extent by less than one tile on the right and bottom edges.

use crate::core::error::{Error, Result};

/// Declared pixel extents and tile size of a fragment
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DeclaredExtent {
    /// Total image height in pixels
    pub total_rows: u64,
    /// Total image width in pixels
    pub total_cols: u64,
    pub tile_width: u32,
    pub tile_height: u32,
}

/// Position of a tile in a row-major tile grid
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct TilePosition {
    pub row: u32,
    pub col: u32,
}

impl TilePosition {
    pub fn new(row: u32, col: u32) -> Self {
        Self { row, col }
    }
}

/// Immutable canvas grid of a level
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct GridGeometry {
    pub tile_width: u32,
    pub tile_height: u32,
    pub row_count: u32,
    pub col_count: u32,
    pub canvas_width: u64,
    pub canvas_height: u64,
}

impl GridGeometry {
    /// Resolve the grid from a fragment's declared extent
    pub fn resolve(extent: DeclaredExtent) -> Result<Self> {
        if extent.tile_width == 0 || extent.tile_height == 0 {
            return Err(Error::Geometry(format!(
                "tile size must be non-zero, got {}x{}",
                extent.tile_width, extent.tile_height
            )));
        }
        if extent.total_rows == 0 || extent.total_cols == 0 {
            return Err(Error::Geometry(format!(
                "image extent must be positive, got {}x{}",
                extent.total_cols, extent.total_rows
            )));
        }

        let row_count = extent.total_rows.div_ceil(u64::from(extent.tile_height));
        let col_count = extent.total_cols.div_ceil(u64::from(extent.tile_width));
        let row_count = u32::try_from(row_count)
            .map_err(|_| Error::Geometry(format!("{row_count} tile rows exceed the grid limit")))?;
        let col_count = u32::try_from(col_count)
            .map_err(|_| Error::Geometry(format!("{col_count} tile columns exceed the grid limit")))?;

        Ok(Self {
            tile_width: extent.tile_width,
            tile_height: extent.tile_height,
            row_count,
            col_count,
            canvas_width: u64::from(col_count) * u64::from(extent.tile_width),
            canvas_height: u64::from(row_count) * u64::from(extent.tile_height),
        })
    }

    /// Number of cells in the grid
    pub fn cell_count(&self) -> u64 {
        u64::from(self.row_count) * u64::from(self.col_count)
    }

    /// Pixels in one tile
    pub fn tile_pixels(&self) -> usize {
        self.tile_width as usize * self.tile_height as usize
    }

    /// Row-major position of tile `offset + j`
    ///
    /// With `col_count = 10`, `offset = 30` and `j = 25` this is row 5, column 5.
    pub fn position(&self, offset: u64, j: u64) -> TilePosition {
        let num = offset + j;
        let cols = u64::from(self.col_count);
        // row < row_count whenever num < cell_count, which fits in u32
        TilePosition {
            row: (num / cols) as u32,
            col: (num % cols) as u32,
        }
    }

    /// Row-major linear index of a position
    pub fn linear_index(&self, pos: TilePosition) -> u64 {
        u64::from(pos.row) * u64::from(self.col_count) + u64::from(pos.col)
    }

    /// Whether a position lies inside the grid
    pub fn contains(&self, pos: TilePosition) -> bool {
        pos.row < self.row_count && pos.col < self.col_count
    }

    /// Tile cell holding the pixel `(x, y)`
    pub fn tile_of_pixel(&self, x: u64, y: u64) -> Option<TilePosition> {
        let col = u32::try_from(x / u64::from(self.tile_width)).ok()?;
        let row = u32::try_from(y / u64::from(self.tile_height)).ok()?;
        Some(TilePosition { row, col })
    }

    /// Top-left pixel of a tile cell
    pub fn pixel_origin(&self, pos: TilePosition) -> (u64, u64) {
        (
            u64::from(pos.col) * u64::from(self.tile_width),
            u64::from(pos.row) * u64::from(self.tile_height),
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn extent(rows: u64, cols: u64, tw: u32, th: u32) -> DeclaredExtent {
        DeclaredExtent {
            total_rows: rows,
            total_cols: cols,
            tile_width: tw,
            tile_height: th,
        }
    }

    #[test]
    fn test_exact_multiple() {
        let g = GridGeometry::resolve(extent(768, 1024, 256, 256)).unwrap();
        assert_eq!(g.row_count, 3);
        assert_eq!(g.col_count, 4);
        assert_eq!(g.canvas_width, 1024);
        assert_eq!(g.canvas_height, 768);
        assert_eq!(g.cell_count(), 12);
    }

    #[test]
    fn test_overhang_rounds_up() {
        let g = GridGeometry::resolve(extent(700, 1000, 256, 256)).unwrap();
        assert_eq!(g.row_count, 3);
        assert_eq!(g.col_count, 4);
        assert_eq!(g.canvas_width, 1024);
        assert_eq!(g.canvas_height, 768);
    }

    #[test]
    fn test_canvas_covers_extent() {
        for tile in [1u32, 7, 64, 240, 256, 512] {
            for total in [1u64, 2, 255, 256, 257, 1000, 4096, 99_999] {
                let g = GridGeometry::resolve(extent(total, total + 3, tile, tile)).unwrap();
                assert!(g.canvas_height >= total);
                assert!(g.canvas_width >= total + 3);
                assert!(g.canvas_height - total < u64::from(tile));
                assert_eq!(g.canvas_height == total, total % u64::from(tile) == 0);
                assert_eq!(g.canvas_width, u64::from(g.col_count) * u64::from(tile));
            }
        }
    }

    #[test]
    fn test_zero_tile_rejected() {
        let err = GridGeometry::resolve(extent(100, 100, 0, 256)).unwrap_err();
        assert!(matches!(err, Error::Geometry(_)));
        let err = GridGeometry::resolve(extent(100, 100, 256, 0)).unwrap_err();
        assert!(matches!(err, Error::Geometry(_)));
    }

    #[test]
    fn test_zero_extent_rejected() {
        assert!(GridGeometry::resolve(extent(0, 100, 256, 256)).is_err());
        assert!(GridGeometry::resolve(extent(100, 0, 256, 256)).is_err());
    }

    #[test]
    fn test_position_with_offset() {
        let g = GridGeometry::resolve(extent(2560, 2560, 256, 256)).unwrap();
        assert_eq!(g.col_count, 10);
        assert_eq!(g.position(30, 25), TilePosition::new(5, 5));
        assert_eq!(g.position(0, 9), TilePosition::new(0, 9));
        assert_eq!(g.position(0, 10), TilePosition::new(1, 0));
        assert_eq!(g.linear_index(TilePosition::new(5, 5)), 55);
    }

    #[test]
    fn test_pixel_conversions() {
        let g = GridGeometry::resolve(extent(768, 1024, 256, 128)).unwrap();
        assert_eq!(g.tile_of_pixel(256, 0), Some(TilePosition::new(0, 1)));
        assert_eq!(g.tile_of_pixel(300, 130), Some(TilePosition::new(1, 1)));
        assert_eq!(g.pixel_origin(TilePosition::new(2, 3)), (768, 256));
        assert!(g.contains(TilePosition::new(5, 3)));
        assert!(!g.contains(TilePosition::new(6, 0)));
    }
}
