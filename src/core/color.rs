//! Color-space conversion of source tiles to canvas RGB
//!
//! Source fragments tag their pixel data with a photometric interpretation.
//! The canvas always stores 8-bit interleaved RGB.

use serde::{Deserialize, Serialize};

use crate::core::error::{Error, Result};

/// Channels stored per canvas pixel
pub const CANVAS_CHANNELS: usize = 3;

/// Photometric interpretation of a source tile
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ColorSpace {
    #[serde(rename = "RGB")]
    Rgb,
    #[serde(rename = "RGBA")]
    Rgba,
    #[serde(rename = "YBR_FULL")]
    YbrFull,
    /// Chroma subsampled on disk, delivered expanded to one sample triple per pixel
    #[serde(rename = "YBR_FULL_422")]
    YbrFull422,
    #[serde(rename = "MONOCHROME1")]
    Monochrome1,
    #[serde(rename = "MONOCHROME2")]
    Monochrome2,
}

impl ColorSpace {
    /// Samples per pixel of the buffer delivered for this color space
    pub fn samples_per_pixel(self) -> usize {
        match self {
            ColorSpace::Rgb | ColorSpace::YbrFull | ColorSpace::YbrFull422 => 3,
            ColorSpace::Rgba => 4,
            ColorSpace::Monochrome1 | ColorSpace::Monochrome2 => 1,
        }
    }

    /// Parse a photometric interpretation tag
    pub fn from_tag(tag: &str) -> Option<Self> {
        match tag.trim() {
            "RGB" => Some(ColorSpace::Rgb),
            "RGBA" => Some(ColorSpace::Rgba),
            "YBR_FULL" => Some(ColorSpace::YbrFull),
            "YBR_FULL_422" => Some(ColorSpace::YbrFull422),
            "MONOCHROME1" => Some(ColorSpace::Monochrome1),
            "MONOCHROME2" => Some(ColorSpace::Monochrome2),
            _ => None,
        }
    }
}

/// Convert a tile buffer to canvas RGB
///
/// `background` is used to composite RGBA pixels, the way transparent regions of
/// a slide render over a white page.
pub fn to_rgb(pixels: &[u8], color_space: ColorSpace, background: [u8; 3]) -> Result<Vec<u8>> {
    let spp = color_space.samples_per_pixel();
    if pixels.len() % spp != 0 {
        return Err(Error::InvalidInput(format!(
            "{} bytes is not a whole number of {:?} pixels",
            pixels.len(),
            color_space
        )));
    }

    let out = match color_space {
        ColorSpace::Rgb => pixels.to_vec(),
        ColorSpace::YbrFull | ColorSpace::YbrFull422 => pixels
            .chunks_exact(3)
            .flat_map(|p| ybr_to_rgb(p[0], p[1], p[2]))
            .collect(),
        ColorSpace::Monochrome2 => pixels.iter().flat_map(|&v| [v, v, v]).collect(),
        ColorSpace::Monochrome1 => pixels
            .iter()
            .flat_map(|&v| {
                let v = 255 - v;
                [v, v, v]
            })
            .collect(),
        ColorSpace::Rgba => pixels
            .chunks_exact(4)
            .flat_map(|p| composite(p, background))
            .collect(),
    };
    Ok(out)
}

/// Full-range YCbCr to RGB
fn ybr_to_rgb(y: u8, cb: u8, cr: u8) -> [u8; 3] {
    let y = f32::from(y);
    let cb = f32::from(cb) - 128.0;
    let cr = f32::from(cr) - 128.0;
    let r = y + 1.402 * cr;
    let g = y - 0.344_136 * cb - 0.714_136 * cr;
    let b = y + 1.772 * cb;
    [clamp_u8(r), clamp_u8(g), clamp_u8(b)]
}

fn composite(p: &[u8], background: [u8; 3]) -> [u8; 3] {
    let alpha = u32::from(p[3]);
    let mut out = [0u8; 3];
    for c in 0..3 {
        let fg = u32::from(p[c]) * alpha;
        let bg = u32::from(background[c]) * (255 - alpha);
        out[c] = ((fg + bg + 127) / 255) as u8;
    }
    out
}

fn clamp_u8(v: f32) -> u8 {
    v.round().clamp(0.0, 255.0) as u8
}
