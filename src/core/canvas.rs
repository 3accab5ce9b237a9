//! Canvas store - persisted tile-aligned raster for one level
//!
//! # File layout
//!
//! ```text
//! offset  size  field
//!      0     4  magic "SSCV"
//!      4     2  version
//!      6     2  channels
//!      8     4  tile width
//!     12     4  tile height
//!     16     4  row count
//!     20     4  column count
//!     24     8  created (unix seconds)
//!     32    24  reserved
//!     56     8  CRC-64 of bytes 0..56
//!     64     -  tiles, row-major, each tile a contiguous interleaved block
//! ```
//!
//! The file is pre-sized at creation, so a tile that was never written reads
//! back as zeros. Each worker opens its own [`CanvasHandle`] with its own file
//! descriptor and cursor; tiles occupy disjoint byte ranges and the header is
//! never rewritten after creation, so concurrent writes to different tiles
//! cannot interfere.

use std::fs::{File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

use crc::{Crc, CRC_64_GO_ISO};
use log::debug;

use crate::core::error::{Error, Result};
use crate::core::geometry::{GridGeometry, TilePosition};

const MAGIC: u32 = 0x5643_5353; // "SSCV"
const VERSION: u16 = 1;
const HEADER_LEN: u64 = 64;
const CRC_SPAN: usize = 56;

const CRC64: Crc<u64> = Crc::<u64>::new(&CRC_64_GO_ISO);

/// Description of a persisted canvas
#[derive(Debug, Clone)]
pub struct CanvasStore {
    path: PathBuf,
    geometry: GridGeometry,
    channels: u16,
}

impl CanvasStore {
    /// Create an empty canvas file, replacing any previous file at `path`
    pub fn create<P: AsRef<Path>>(path: P, geometry: GridGeometry, channels: u16) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        if channels == 0 {
            return Err(Error::InvalidInput("canvas needs at least one channel".to_string()));
        }

        let store = Self {
            path,
            geometry,
            channels,
        };
        let total = store.body_len()?.checked_add(HEADER_LEN).ok_or_else(|| {
            Error::StoreFormat("canvas size overflows the file offset range".to_string())
        })?;

        let mut file = File::create(&store.path).map_err(|e| Error::store_io(&store.path, e))?;
        file.write_all(&store.encode_header())
            .map_err(|e| Error::store_io(&store.path, e))?;
        file.set_len(total)
            .map_err(|e| Error::store_io(&store.path, e))?;
        file.sync_all().map_err(|e| Error::store_io(&store.path, e))?;

        debug!(
            "Created canvas {} ({}x{} px, {}x{} tiles of {}x{})",
            store.path.display(),
            geometry.canvas_width,
            geometry.canvas_height,
            geometry.col_count,
            geometry.row_count,
            geometry.tile_width,
            geometry.tile_height
        );
        Ok(store)
    }

    /// Open an existing canvas file and validate its header
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        let mut file = File::open(&path).map_err(|e| Error::store_io(&path, e))?;
        let mut header = [0u8; HEADER_LEN as usize];
        file.read_exact(&mut header)
            .map_err(|e| Error::store_io(&path, e))?;

        let (geometry, channels) = decode_header(&header)?;
        let store = Self {
            path,
            geometry,
            channels,
        };

        let actual = file
            .metadata()
            .map_err(|e| Error::store_io(&store.path, e))?
            .len();
        let expected = HEADER_LEN + store.body_len()?;
        if actual != expected {
            return Err(Error::StoreFormat(format!(
                "{} is {} bytes, expected {}",
                store.path.display(),
                actual,
                expected
            )));
        }
        Ok(store)
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn geometry(&self) -> &GridGeometry {
        &self.geometry
    }

    pub fn channels(&self) -> u16 {
        self.channels
    }

    /// Bytes in one tile
    pub fn tile_bytes(&self) -> usize {
        self.geometry.tile_pixels() * usize::from(self.channels)
    }

    /// Open an independent read/write handle
    pub fn handle(&self) -> Result<CanvasHandle> {
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .open(&self.path)
            .map_err(|e| Error::store_io(&self.path, e))?;
        Ok(CanvasHandle {
            file,
            path: self.path.clone(),
            geometry: self.geometry,
            channels: usize::from(self.channels),
            tile_bytes: self.tile_bytes(),
        })
    }

    /// Read the whole canvas as a row-major interleaved raster
    pub fn read_raster(&self) -> Result<Vec<u8>> {
        let g = &self.geometry;
        let len = usize::try_from(g.canvas_width)
            .ok()
            .and_then(|w| w.checked_mul(usize::from(self.channels)))
            .and_then(|stride| usize::try_from(g.canvas_height).ok()?.checked_mul(stride))
            .ok_or_else(|| Error::StoreFormat("canvas does not fit in memory".to_string()))?;

        let mut raster = Vec::with_capacity(len);
        let mut handle = self.handle()?;
        for row in 0..g.row_count {
            raster.extend_from_slice(&handle.read_band(row, g.canvas_width, g.canvas_height)?);
        }
        Ok(raster)
    }

    /// Delete the canvas file
    pub fn remove(self) -> Result<()> {
        std::fs::remove_file(&self.path).map_err(|e| Error::store_io(&self.path, e))
    }

    fn body_len(&self) -> Result<u64> {
        (self.tile_bytes() as u64)
            .checked_mul(self.geometry.cell_count())
            .ok_or_else(|| Error::StoreFormat("canvas size overflows u64".to_string()))
    }

    fn encode_header(&self) -> [u8; HEADER_LEN as usize] {
        let g = &self.geometry;
        let created = chrono::Utc::now().timestamp().max(0) as u64;

        let mut header = [0u8; HEADER_LEN as usize];
        header[0..4].copy_from_slice(&MAGIC.to_le_bytes());
        header[4..6].copy_from_slice(&VERSION.to_le_bytes());
        header[6..8].copy_from_slice(&self.channels.to_le_bytes());
        header[8..12].copy_from_slice(&g.tile_width.to_le_bytes());
        header[12..16].copy_from_slice(&g.tile_height.to_le_bytes());
        header[16..20].copy_from_slice(&g.row_count.to_le_bytes());
        header[20..24].copy_from_slice(&g.col_count.to_le_bytes());
        header[24..32].copy_from_slice(&created.to_le_bytes());
        let crc = CRC64.checksum(&header[..CRC_SPAN]);
        header[CRC_SPAN..].copy_from_slice(&crc.to_le_bytes());
        header
    }
}

fn decode_header(header: &[u8; HEADER_LEN as usize]) -> Result<(GridGeometry, u16)> {
    let u16_at = |at: usize| u16::from_le_bytes([header[at], header[at + 1]]);
    let u32_at = |at: usize| {
        u32::from_le_bytes([header[at], header[at + 1], header[at + 2], header[at + 3]])
    };

    if u32_at(0) != MAGIC {
        return Err(Error::StoreFormat("not a canvas file (bad magic)".to_string()));
    }
    let version = u16_at(4);
    if version != VERSION {
        return Err(Error::StoreFormat(format!("unsupported canvas version {version}")));
    }
    let mut crc_bytes = [0u8; 8];
    crc_bytes.copy_from_slice(&header[CRC_SPAN..]);
    if CRC64.checksum(&header[..CRC_SPAN]) != u64::from_le_bytes(crc_bytes) {
        return Err(Error::StoreFormat("canvas header checksum mismatch".to_string()));
    }

    let channels = u16_at(6);
    let tile_width = u32_at(8);
    let tile_height = u32_at(12);
    let row_count = u32_at(16);
    let col_count = u32_at(20);
    if channels == 0 || tile_width == 0 || tile_height == 0 || row_count == 0 || col_count == 0 {
        return Err(Error::StoreFormat("canvas header declares an empty grid".to_string()));
    }

    let geometry = GridGeometry {
        tile_width,
        tile_height,
        row_count,
        col_count,
        canvas_width: u64::from(col_count) * u64::from(tile_width),
        canvas_height: u64::from(row_count) * u64::from(tile_height),
    };
    Ok((geometry, channels))
}

/// One worker's view of the canvas
///
/// Reads and writes are whole tiles at tile-aligned positions.
pub struct CanvasHandle {
    file: File,
    path: PathBuf,
    geometry: GridGeometry,
    channels: usize,
    tile_bytes: usize,
}

impl CanvasHandle {
    /// Write one tile; `pixels` must be exactly one tile
    pub fn write_tile(&mut self, pos: TilePosition, pixels: &[u8]) -> Result<()> {
        if pixels.len() != self.tile_bytes {
            return Err(Error::InvalidInput(format!(
                "tile at ({}, {}) is {} bytes, expected {}",
                pos.row,
                pos.col,
                pixels.len(),
                self.tile_bytes
            )));
        }
        let at = self.tile_start(pos)?;
        self.file
            .seek(SeekFrom::Start(at))
            .and_then(|_| self.file.write_all(pixels))
            .map_err(|e| Error::store_io(&self.path, e))
    }

    /// Read one tile into a caller buffer of exactly one tile
    pub fn read_tile_into(&mut self, pos: TilePosition, buf: &mut [u8]) -> Result<()> {
        if buf.len() != self.tile_bytes {
            return Err(Error::InvalidInput(format!(
                "read buffer is {} bytes, expected {}",
                buf.len(),
                self.tile_bytes
            )));
        }
        let at = self.tile_start(pos)?;
        self.file
            .seek(SeekFrom::Start(at))
            .and_then(|_| self.file.read_exact(buf))
            .map_err(|e| Error::store_io(&self.path, e))
    }

    /// Read one tile
    pub fn read_tile(&mut self, pos: TilePosition) -> Result<Vec<u8>> {
        let mut buf = vec![0u8; self.tile_bytes];
        self.read_tile_into(pos, &mut buf)?;
        Ok(buf)
    }

    /// Read one row of tiles as row-major pixel lines
    ///
    /// The band is cropped to an image of `width` x `height` pixels anchored
    /// at the canvas origin, so edge bands may be narrower and shorter than
    /// the tiles they come from.
    pub fn read_band(&mut self, tile_row: u32, width: u64, height: u64) -> Result<Vec<u8>> {
        let g = self.geometry;
        let (_, y0) = g.pixel_origin(TilePosition::new(tile_row, 0));
        let rows = height.saturating_sub(y0).min(u64::from(g.tile_height)) as usize;
        let stride = self.band_stride(width)?;
        let tile_stride = g.tile_width as usize * self.channels;

        let mut band = vec![0u8; rows * stride];
        let mut tile = vec![0u8; self.tile_bytes];
        for col in 0..g.col_count {
            let x0 = col as usize * tile_stride;
            if x0 >= stride {
                break;
            }
            let len = tile_stride.min(stride - x0);
            self.read_tile_into(TilePosition::new(tile_row, col), &mut tile)?;
            for (ty, line) in tile.chunks_exact(tile_stride).take(rows).enumerate() {
                let start = ty * stride + x0;
                band[start..start + len].copy_from_slice(&line[..len]);
            }
        }
        Ok(band)
    }

    /// Write row-major pixel lines of `width` pixels as one row of tiles
    ///
    /// The band holds at most one tile height of lines. Tile pixels the band
    /// does not reach are written as zero.
    pub fn write_band(&mut self, tile_row: u32, band: &[u8], width: u64) -> Result<()> {
        let g = self.geometry;
        let stride = self.band_stride(width)?;
        if stride == 0 || band.len() % stride != 0 || band.len() / stride > g.tile_height as usize {
            return Err(Error::InvalidInput(format!(
                "band of {} bytes is not whole lines of {} pixels within one tile row",
                band.len(),
                width
            )));
        }
        let rows = band.len() / stride;
        let tile_stride = g.tile_width as usize * self.channels;

        let mut tile = vec![0u8; self.tile_bytes];
        for col in 0..g.col_count {
            tile.fill(0);
            let x0 = col as usize * tile_stride;
            if x0 < stride {
                let len = tile_stride.min(stride - x0);
                for ty in 0..rows {
                    let start = ty * stride + x0;
                    tile[ty * tile_stride..ty * tile_stride + len].copy_from_slice(&band[start..start + len]);
                }
            }
            self.write_tile(TilePosition::new(tile_row, col), &tile)?;
        }
        Ok(())
    }

    /// Flush written tiles to disk
    pub fn sync(&mut self) -> Result<()> {
        self.file
            .sync_data()
            .map_err(|e| Error::store_io(&self.path, e))
    }

    fn band_stride(&self, width: u64) -> Result<usize> {
        if width > self.geometry.canvas_width {
            return Err(Error::InvalidInput(format!(
                "band width {} exceeds canvas width {}",
                width, self.geometry.canvas_width
            )));
        }
        Ok(width as usize * self.channels)
    }

    fn tile_start(&self, pos: TilePosition) -> Result<u64> {
        if !self.geometry.contains(pos) {
            return Err(Error::InvalidInput(format!(
                "tile ({}, {}) is outside the {}x{} grid",
                pos.row, pos.col, self.geometry.row_count, self.geometry.col_count
            )));
        }
        Ok(HEADER_LEN + self.geometry.linear_index(pos) * self.tile_bytes as u64)
    }
}
