//! Pyramid encoding of a finished canvas
//!
//! The base page is the full canvas; each following page halves both sides
//! until the longest side fits in one tile. Pages are written as a BigTIFF
//! with the slide description on the first page.
//!
//! Nothing holds a whole page in memory. Every page is written as strips of
//! one tile row, read band by band from a canvas. A reduced page is first
//! staged on a scratch canvas next to the output, built from two bands of the
//! page above it at a time.

use std::fmt;
use std::fs::File;
use std::io::BufWriter;
use std::path::{Path, PathBuf};
use std::str::FromStr;

use image::imageops::{self, FilterType};
use image::RgbImage;
use log::{debug, info, warn};
use tiff::encoder::compression::{
    Compression as TiffCompression, Deflate, Lzw, Uncompressed,
};
use tiff::encoder::{colortype, TiffEncoder};
use tiff::tags::Tag;
use tiff::TiffError;

use crate::core::canvas::CanvasStore;
use crate::core::color::CANVAS_CHANNELS;
use crate::core::error::{Error, Result};
use crate::core::geometry::{DeclaredExtent, GridGeometry};

/// Descriptive metadata handed to the encoder with a level
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SlideMetadata {
    pub magnification: f64,
    /// Microns per pixel at the base page
    pub mpp: f64,
}

impl SlideMetadata {
    /// Aperio-style image description
    pub fn description(&self) -> String {
        format!(
            "Aperio Fake |AppMag = {:.1}|MPP = {}",
            self.magnification, self.mpp
        )
    }
}

/// Page compression
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Compression {
    None,
    #[default]
    Lzw,
    Deflate,
}

impl FromStr for Compression {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "none" => Ok(Compression::None),
            "lzw" => Ok(Compression::Lzw),
            "deflate" => Ok(Compression::Deflate),
            other => Err(format!(
                "unknown compression '{other}', expected none, lzw or deflate"
            )),
        }
    }
}

impl fmt::Display for Compression {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Compression::None => "none",
            Compression::Lzw => "lzw",
            Compression::Deflate => "deflate",
        };
        f.write_str(name)
    }
}

/// Turns a finished canvas into the output artifact
pub trait PyramidEncoder: Send + Sync {
    fn encode(&self, store: &CanvasStore, metadata: &SlideMetadata, output: &Path) -> Result<()>;
}

/// BigTIFF pyramid writer
#[derive(Debug, Clone, Copy, Default)]
pub struct TiffPyramidEncoder {
    pub compression: Compression,
}

impl TiffPyramidEncoder {
    pub fn new(compression: Compression) -> Self {
        Self { compression }
    }
}

impl PyramidEncoder for TiffPyramidEncoder {
    fn encode(&self, store: &CanvasStore, metadata: &SlideMetadata, output: &Path) -> Result<()> {
        if usize::from(store.channels()) != CANVAS_CHANNELS {
            return Err(Error::Encode(format!(
                "canvas has {} channels, pages are RGB",
                store.channels()
            )));
        }
        let g = store.geometry();
        let base = Page {
            store: PageStore::Canvas(store),
            width: u32::try_from(g.canvas_width)
                .map_err(|_| Error::Encode(format!("canvas width {} exceeds TIFF limits", g.canvas_width)))?,
            height: u32::try_from(g.canvas_height)
                .map_err(|_| Error::Encode(format!("canvas height {} exceeds TIFF limits", g.canvas_height)))?,
        };
        info!(
            "Encoding {}x{} canvas to {} ({} compression)",
            base.width,
            base.height,
            output.display(),
            self.compression
        );

        let file = File::create(output).map_err(|e| Error::Encode(format!("{}: {e}", output.display())))?;
        let description = metadata.description();
        let pages = match self.compression {
            Compression::None => write_pyramid(file, base, &description, output, Uncompressed),
            Compression::Lzw => write_pyramid(file, base, &description, output, Lzw),
            Compression::Deflate => write_pyramid(file, base, &description, output, Deflate::default()),
        }?;
        debug!("Wrote {} page(s) to {}", pages, output.display());
        Ok(())
    }
}

/// Canvas backing one pyramid page
enum PageStore<'a> {
    Canvas(&'a CanvasStore),
    Scratch(ScratchCanvas),
}

/// Staging canvas for a reduced page, deleted on drop
struct ScratchCanvas(CanvasStore);

impl Drop for ScratchCanvas {
    fn drop(&mut self) {
        if let Err(e) = std::fs::remove_file(self.0.path()) {
            warn!("Could not remove scratch canvas {}: {e}", self.0.path().display());
        }
    }
}

/// One page of the pyramid; the canvas may overhang its pixel size
struct Page<'a> {
    store: PageStore<'a>,
    width: u32,
    height: u32,
}

impl Page<'_> {
    fn store(&self) -> &CanvasStore {
        match &self.store {
            PageStore::Canvas(store) => store,
            PageStore::Scratch(scratch) => &scratch.0,
        }
    }

    fn is_last(&self, tile_side: u32) -> bool {
        self.width.max(self.height) <= tile_side || (self.width == 1 && self.height == 1)
    }

    /// Stage the next page, half this one's size, on a scratch canvas at `path`
    fn halve(&self, path: PathBuf) -> Result<Page<'static>> {
        let source = self.store().geometry();
        let (width, height) = (self.width.div_ceil(2), self.height.div_ceil(2));
        let geometry = GridGeometry::resolve(DeclaredExtent {
            total_rows: u64::from(height),
            total_cols: u64::from(width),
            tile_width: source.tile_width,
            tile_height: source.tile_height,
        })?;
        let scratch = ScratchCanvas(CanvasStore::create(&path, geometry, CANVAS_CHANNELS as u16)?);
        debug!("Staging {}x{} page in {}", width, height, path.display());

        let mut reader = self.store().handle()?;
        let mut writer = scratch.0.handle()?;
        for tile_row in 0..geometry.row_count {
            // Two source bands shrink into one
            let mut lines = reader.read_band(2 * tile_row, self.width.into(), self.height.into())?;
            if 2 * tile_row + 1 < source.row_count {
                lines.extend(reader.read_band(2 * tile_row + 1, self.width.into(), self.height.into())?);
            }
            let rows = (lines.len() / (self.width as usize * CANVAS_CHANNELS)) as u32;
            let band = RgbImage::from_raw(self.width, rows, lines)
                .ok_or_else(|| Error::Encode("page band does not match its size".to_string()))?;
            let reduced = imageops::resize(&band, width, rows.div_ceil(2), FilterType::Triangle);
            writer.write_band(tile_row, reduced.as_raw(), width.into())?;
        }
        writer.sync()?;

        Ok(Page {
            store: PageStore::Scratch(scratch),
            width,
            height,
        })
    }
}

/// Scratch canvas path for page `level` of `output`
fn scratch_path(output: &Path, level: usize) -> PathBuf {
    output.with_extension(format!("page{level}.canvas"))
}

fn tiff_error(e: TiffError) -> Error {
    Error::Encode(e.to_string())
}

/// Write `base` and its halvings; returns the number of pages
fn write_pyramid<D>(
    file: File,
    base: Page<'_>,
    description: &str,
    output: &Path,
    compression: D,
) -> Result<usize>
where
    D: TiffCompression + Clone,
{
    let g = base.store().geometry();
    let tile_side = g.tile_width.max(g.tile_height);
    let mut encoder = TiffEncoder::new_big(BufWriter::new(file)).map_err(tiff_error)?;

    let mut page = base;
    let mut level = 0;
    loop {
        let geometry = *page.store().geometry();
        let mut image = encoder
            .new_image_with_compression::<colortype::RGB8, _>(page.width, page.height, compression.clone())
            .map_err(tiff_error)?;
        if level == 0 {
            image.encoder().write_tag(Tag::ImageDescription, description).map_err(tiff_error)?;
        } else {
            // Reduced-resolution page
            image.encoder().write_tag(Tag::NewSubfileType, 1u32).map_err(tiff_error)?;
        }
        image.rows_per_strip(geometry.tile_height).map_err(tiff_error)?;

        let mut handle = page.store().handle()?;
        for tile_row in 0..geometry.row_count {
            let band = handle.read_band(tile_row, page.width.into(), page.height.into())?;
            image.write_strip(&band).map_err(tiff_error)?;
        }
        image.finish().map_err(tiff_error)?;
        debug!("Pyramid page {}: {}x{}", level, page.width, page.height);

        if page.is_last(tile_side) {
            return Ok(level + 1);
        }
        level += 1;
        page = page.halve(scratch_path(output, level))?;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::geometry::{DeclaredExtent, GridGeometry, TilePosition};
    use std::io::BufReader;
    use tempfile::TempDir;
    use tiff::decoder::{Decoder, DecodingResult};

    fn canvas(dir: &TempDir) -> CanvasStore {
        let g = GridGeometry::resolve(DeclaredExtent {
            total_rows: 8,
            total_cols: 16,
            tile_width: 4,
            tile_height: 4,
        })
        .unwrap();
        let store = CanvasStore::create(dir.path().join("pyr.canvas"), g, 3).unwrap();
        let mut h = store.handle().unwrap();
        for row in 0..2 {
            for col in 0..4 {
                let shade = (row * 4 + col) as u8 * 20;
                h.write_tile(TilePosition::new(row, col), &vec![shade; 48]).unwrap();
            }
        }
        store
    }

    #[test]
    fn test_description_format() {
        let meta = SlideMetadata {
            magnification: 40.0,
            mpp: 0.2425,
        };
        assert_eq!(meta.description(), "Aperio Fake |AppMag = 40.0|MPP = 0.2425");

        let low = SlideMetadata {
            magnification: 2.5,
            mpp: 3.88,
        };
        assert_eq!(low.description(), "Aperio Fake |AppMag = 2.5|MPP = 3.88");
    }

    #[test]
    fn test_compression_from_str() {
        assert_eq!("LZW".parse::<Compression>().unwrap(), Compression::Lzw);
        assert_eq!("none".parse::<Compression>().unwrap(), Compression::None);
        assert_eq!("deflate".parse::<Compression>().unwrap(), Compression::Deflate);
        assert!("jpeg".parse::<Compression>().is_err());
        assert_eq!(Compression::default().to_string(), "lzw");
    }

    #[test]
    fn test_halve_keeps_odd_edges() {
        let dir = TempDir::new().unwrap();
        let store = canvas(&dir);
        let base = Page {
            store: PageStore::Canvas(&store),
            width: 16,
            height: 8,
        };
        let half = base.halve(dir.path().join("half.canvas")).unwrap();
        assert_eq!((half.width, half.height), (8, 4));
        assert!(!half.is_last(4));

        let quarter = half.halve(dir.path().join("quarter.canvas")).unwrap();
        assert_eq!((quarter.width, quarter.height), (4, 2));
        assert!(quarter.is_last(4));
        let odd = quarter.halve(dir.path().join("odd.canvas")).unwrap();
        assert_eq!((odd.width, odd.height), (2, 1));
        assert_eq!(odd.store().geometry().row_count, 1);

        let path = half.store().path().to_path_buf();
        assert!(path.exists());
        drop(half);
        assert!(!path.exists());
    }

    #[test]
    fn test_uniform_canvas_keeps_color_on_every_page() {
        let dir = TempDir::new().unwrap();
        let g = GridGeometry::resolve(DeclaredExtent {
            total_rows: 12,
            total_cols: 20,
            tile_width: 4,
            tile_height: 4,
        })
        .unwrap();
        let store = CanvasStore::create(dir.path().join("flat.canvas"), g, 3).unwrap();
        let mut h = store.handle().unwrap();
        for row in 0..3 {
            for col in 0..5 {
                h.write_tile(TilePosition::new(row, col), &[10, 20, 30].repeat(16)).unwrap();
            }
        }
        let output = dir.path().join("flat.tiff");
        let meta = SlideMetadata {
            magnification: 40.0,
            mpp: 0.2425,
        };
        TiffPyramidEncoder::new(Compression::Lzw).encode(&store, &meta, &output).unwrap();

        let mut decoder = Decoder::new(BufReader::new(File::open(&output).unwrap())).unwrap();
        let mut sizes = Vec::new();
        loop {
            let (w, h) = decoder.dimensions().unwrap();
            sizes.push((w, h));
            let DecodingResult::U8(pixels) = decoder.read_image().unwrap() else {
                panic!("expected 8-bit samples");
            };
            assert_eq!(pixels, [10, 20, 30].repeat((w * h) as usize), "page {w}x{h}");
            if !decoder.more_images() {
                break;
            }
            decoder.next_image().unwrap();
        }
        // 5 > 4 keeps halving once more
        assert_eq!(sizes, vec![(20, 12), (10, 6), (5, 3), (3, 2)]);

        // Scratch pages are gone, the canvas is left to the caller
        let mut left: Vec<_> = std::fs::read_dir(dir.path())
            .unwrap()
            .map(|e| e.unwrap().file_name().to_string_lossy().into_owned())
            .collect();
        left.sort();
        assert_eq!(left, vec!["flat.canvas", "flat.tiff"]);
    }

    #[test]
    fn test_encode_writes_readable_tiff() {
        for compression in [Compression::None, Compression::Lzw, Compression::Deflate] {
            let dir = TempDir::new().unwrap();
            let store = canvas(&dir);
            let output = dir.path().join("slide.tiff");
            let meta = SlideMetadata {
                magnification: 20.0,
                mpp: 0.485,
            };
            TiffPyramidEncoder::new(compression)
                .encode(&store, &meta, &output)
                .unwrap();

            let mut decoder = Decoder::new(BufReader::new(File::open(&output).unwrap())).unwrap();
            assert_eq!(decoder.dimensions().unwrap(), (16, 8));
            let description = decoder.get_tag_ascii_string(Tag::ImageDescription).unwrap();
            assert_eq!(description, "Aperio Fake |AppMag = 20.0|MPP = 0.485");
            assert_eq!(decoder.get_tag_u32(Tag::RowsPerStrip).unwrap(), 4);

            let DecodingResult::U8(pixels) = decoder.read_image().unwrap() else {
                panic!("expected 8-bit samples");
            };
            assert_eq!(pixels, store.read_raster().unwrap());

            assert!(decoder.more_images());
            decoder.next_image().unwrap();
            assert_eq!(decoder.dimensions().unwrap(), (8, 4));
            assert_eq!(decoder.get_tag_u32(Tag::NewSubfileType).unwrap(), 1);
            decoder.next_image().unwrap();
            assert_eq!(decoder.dimensions().unwrap(), (4, 2));
            assert!(!decoder.more_images());
        }
    }
}
