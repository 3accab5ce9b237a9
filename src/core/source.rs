//! Fragment sources and addressing classification
//!
//! A [`TileSource`] is the reader side of one fragment: it declares the grid
//! geometry, the tile offset and per-tile anchors, and hands out raw tile
//! buffers on demand. [`classify`] turns the declared metadata into a
//! [`Fragment`] that the dispatcher can drive.

use crate::core::color::ColorSpace;
use crate::core::error::{Error, Result};
use crate::core::geometry::{DeclaredExtent, TilePosition};

/// Reference magnification of the scanner calibration
const REFERENCE_MAGNIFICATION: f64 = 40.0;

/// Microns per pixel at the reference magnification
const REFERENCE_MPP: f64 = 0.2425;

/// Metadata a fragment declares about itself
#[derive(Debug, Clone, PartialEq)]
pub struct FragmentDescriptor {
    /// Human-readable identity, used in logs and errors
    pub name: String,
    pub extent: DeclaredExtent,
    /// Index of the first tile in row-major canvas order
    pub tile_offset: u64,
    /// Number of frames physically present in the fragment
    pub frame_count: u64,
    /// One-based `(x, y)` pixel anchors, one per frame, when the source declares them
    pub frame_positions: Option<Vec<(u64, u64)>>,
    /// Pixel spacing in millimetres per pixel
    pub pixel_spacing_mm: Option<f64>,
    pub color_space: ColorSpace,
}

impl FragmentDescriptor {
    /// Magnification derived from the declared pixel spacing
    pub fn magnification(&self) -> Option<f64> {
        self.pixel_spacing_mm
            .filter(|mm| *mm > 0.0 && mm.is_finite())
            .map(|mm| magnification_from_mpp(mm * 1000.0))
    }
}

/// One tile fetch issued by the dispatcher
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TileRequest {
    /// Index within the fragment
    pub index: u64,
    /// Position in the fragment's own grid (row-major from zero)
    pub local: TilePosition,
    /// Position in the level canvas (row-major from the tile offset)
    pub global: TilePosition,
}

/// Raw tile pixels as stored in the source
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RawTile {
    pub pixels: Vec<u8>,
    pub color_space: ColorSpace,
}

/// Reader side of a fragment
pub trait TileSource: Send + Sync {
    /// Declared metadata
    fn descriptor(&self) -> &FragmentDescriptor;

    /// Fetch one tile's raw pixels
    fn read_tile(&self, request: TileRequest) -> Result<RawTile>;
}

/// How a fragment addresses its tiles
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AddressingMode {
    /// Tile `j` sits at row-major index `offset + j`
    Sequential,
    /// Tiles declare their own pixel anchors
    Explicit,
}

/// Zero-based pixel anchor of a tile
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct PixelAnchor {
    pub x: u64,
    pub y: u64,
}

/// Addressing of a classified fragment
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Addressing {
    Sequential,
    Explicit(Vec<PixelAnchor>),
}

impl Addressing {
    pub fn mode(&self) -> AddressingMode {
        match self {
            Addressing::Sequential => AddressingMode::Sequential,
            Addressing::Explicit(_) => AddressingMode::Explicit,
        }
    }
}

/// A fragment ready for dispatch
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Fragment {
    pub name: String,
    pub tile_offset: u64,
    pub tile_count: u64,
    pub addressing: Addressing,
}

impl Fragment {
    pub fn mode(&self) -> AddressingMode {
        self.addressing.mode()
    }
}

/// Determine how a fragment addresses its tiles
///
/// A fragment is Explicit iff it declares per-frame anchors. Anchors are
/// declared one-based and returned zero-based.
pub fn classify(descriptor: &FragmentDescriptor) -> Result<Addressing> {
    let Some(positions) = &descriptor.frame_positions else {
        return Ok(Addressing::Sequential);
    };

    let anchors = positions
        .iter()
        .enumerate()
        .map(|(frame, &(x, y))| {
            match (x.checked_sub(1), y.checked_sub(1)) {
                (Some(x), Some(y)) => Ok(PixelAnchor { x, y }),
                _ => Err(Error::source_read(
                    &descriptor.name,
                    format!("frame {frame} declares anchor ({x}, {y}), anchors are one-based"),
                )),
            }
        })
        .collect::<Result<Vec<_>>>()?;

    Ok(Addressing::Explicit(anchors))
}

/// Nominal magnification for a resolution in microns per pixel
pub fn magnification_from_mpp(mpp: f64) -> f64 {
    REFERENCE_MAGNIFICATION * 2f64.powf((REFERENCE_MPP / mpp).log2().round())
}

/// Nominal microns per pixel for a magnification
pub fn mpp_from_magnification(magnification: f64) -> f64 {
    REFERENCE_MPP * 2f64.powf((REFERENCE_MAGNIFICATION / magnification).log2().round())
}
