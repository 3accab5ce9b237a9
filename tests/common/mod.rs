//! Shared fixtures for the integration tests
#![allow(dead_code)]

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use slidestitch::{
    ColorSpace, DeclaredExtent, Error, FragmentDescriptor, FragmentFile, FragmentManifest,
    RawTile, Result, TilePosition, TileRequest, TileSource,
};

/// Color of fragment tile `n`; never zero
pub fn tile_color(seed: u8, n: u64) -> [u8; 3] {
    [seed.max(1), (n % 256) as u8, ((n / 256) % 256) as u8]
}

pub fn solid_tile(color: [u8; 3], pixels: usize) -> Vec<u8> {
    color.repeat(pixels)
}

pub fn extent(cols: u64, rows: u64, tile: u32) -> DeclaredExtent {
    DeclaredExtent {
        total_rows: rows,
        total_cols: cols,
        tile_width: tile,
        tile_height: tile,
    }
}

/// In-memory fragment with solid-colored tiles
pub struct MemorySource {
    descriptor: FragmentDescriptor,
    seed: u8,
    /// Frame index per anchored grid cell
    anchored: HashMap<TilePosition, u64>,
    fail_at: Option<u64>,
}

impl MemorySource {
    /// Sequential fragment; tile `j` has color `tile_color(seed, j)`
    pub fn sequential(name: &str, extent: DeclaredExtent, offset: u64, frames: u64, seed: u8) -> Self {
        Self {
            descriptor: descriptor(name, extent, offset, frames, None),
            seed,
            anchored: HashMap::new(),
            fail_at: None,
        }
    }

    /// Explicit fragment anchored at zero-based tile cells `(row, col)`;
    /// frame `k` has color `tile_color(seed, k)`
    pub fn explicit(name: &str, extent: DeclaredExtent, offset: u64, cells: &[(u32, u32)], seed: u8) -> Self {
        let tw = u64::from(extent.tile_width);
        let th = u64::from(extent.tile_height);
        let positions = cells
            .iter()
            .map(|&(row, col)| (u64::from(col) * tw + 1, u64::from(row) * th + 1))
            .collect();
        let anchored = cells
            .iter()
            .enumerate()
            .map(|(k, &(row, col))| (TilePosition::new(row, col), k as u64))
            .collect();
        Self {
            descriptor: descriptor(name, extent, offset, cells.len() as u64, Some(positions)),
            seed,
            anchored,
            fail_at: None,
        }
    }

    pub fn with_spacing(mut self, spacing_mm: Option<f64>) -> Self {
        self.descriptor.pixel_spacing_mm = spacing_mm;
        self
    }

    /// Fail when tile `index` is requested
    pub fn failing_at(mut self, index: u64) -> Self {
        self.fail_at = Some(index);
        self
    }

    pub fn boxed(self) -> Box<dyn TileSource> {
        Box::new(self)
    }
}

fn descriptor(
    name: &str,
    extent: DeclaredExtent,
    offset: u64,
    frames: u64,
    positions: Option<Vec<(u64, u64)>>,
) -> FragmentDescriptor {
    FragmentDescriptor {
        name: name.to_string(),
        extent,
        tile_offset: offset,
        frame_count: frames,
        frame_positions: positions,
        pixel_spacing_mm: Some(0.000_242_5),
        color_space: ColorSpace::Rgb,
    }
}

impl TileSource for MemorySource {
    fn descriptor(&self) -> &FragmentDescriptor {
        &self.descriptor
    }

    fn read_tile(&self, request: TileRequest) -> Result<RawTile> {
        if self.fail_at == Some(request.index) {
            return Err(Error::source_read(&self.descriptor.name, "injected failure"));
        }
        let frame = if self.descriptor.frame_positions.is_some() {
            *self.anchored.get(&request.global).ok_or_else(|| {
                Error::source_read(&self.descriptor.name, "no anchor at requested cell")
            })?
        } else {
            request.index
        };
        let pixels = self.descriptor.extent.tile_width as usize * self.descriptor.extent.tile_height as usize;
        Ok(RawTile {
            pixels: solid_tile(tile_color(self.seed, frame), pixels),
            color_space: ColorSpace::Rgb,
        })
    }
}

/// Write a dense single-fragment slide directory of `cols x rows` tiles
pub fn write_dense_slide(root: &Path, name: &str, cols: u64, rows: u64, tile: u32) -> PathBuf {
    let dir = root.join(name);
    std::fs::create_dir_all(&dir).unwrap();
    let frames = cols * rows;
    let manifest = FragmentManifest {
        total_pixel_rows: rows * u64::from(tile),
        total_pixel_cols: cols * u64::from(tile),
        tile_width: tile,
        tile_height: tile,
        tile_offset: 0,
        frame_count: frames,
        samples_per_pixel: 3,
        photometric: ColorSpace::Rgb,
        pixel_spacing_mm: Some(0.000_25),
        frame_positions: None,
    };
    let pixels = (tile * tile) as usize;
    let data: Vec<u8> = (0..frames)
        .flat_map(|j| solid_tile(tile_color(9, j), pixels))
        .collect();
    FragmentFile::write(&dir, "level0", &manifest, &data).unwrap();
    dir
}
