//! On-disk fragment reader
//!
//! A fragment is a JSON manifest `<stem>.json` next to a raw frame file
//! `<stem>.tiles`. Frames are stored back to back, each one tile of
//! interleaved samples. Sequential fragments are read by frame index;
//! explicit fragments are read by the grid cell of each frame's anchor.

use std::collections::HashMap;
use std::fs::File;
use std::io::{BufReader, BufWriter, Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};

use crate::core::color::ColorSpace;
use crate::core::error::{Error, Result};
use crate::core::geometry::{DeclaredExtent, GridGeometry, TilePosition};
use crate::core::source::{classify, Addressing, FragmentDescriptor, RawTile, TileRequest, TileSource};

const MANIFEST_EXTENSION: &str = "json";
const FRAMES_EXTENSION: &str = "tiles";

/// Fragment manifest as stored on disk
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FragmentManifest {
    pub total_pixel_rows: u64,
    pub total_pixel_cols: u64,
    pub tile_width: u32,
    pub tile_height: u32,
    #[serde(default)]
    pub tile_offset: u64,
    pub frame_count: u64,
    pub samples_per_pixel: u16,
    pub photometric: ColorSpace,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pixel_spacing_mm: Option<f64>,
    /// One-based `[x, y]` pixel anchors, one per frame
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub frame_positions: Option<Vec<[u64; 2]>>,
}

impl FragmentManifest {
    fn frame_bytes(&self) -> u64 {
        u64::from(self.tile_width) * u64::from(self.tile_height) * u64::from(self.samples_per_pixel)
    }
}

/// A fragment backed by a manifest and a frame file
pub struct FragmentFile {
    descriptor: FragmentDescriptor,
    frames: Mutex<File>,
    frames_path: PathBuf,
    frame_bytes: usize,
    /// Grid cell of each explicit frame's anchor
    anchored_frames: HashMap<TilePosition, u64>,
}

impl FragmentFile {
    /// Open a fragment from its manifest path
    pub fn open<P: AsRef<Path>>(manifest_path: P) -> Result<Self> {
        let manifest_path = manifest_path.as_ref();
        let name = fragment_name(manifest_path);
        let fail = |reason: String| Error::source_read(&name, reason);

        let reader = File::open(manifest_path)
            .map(BufReader::new)
            .map_err(|e| fail(format!("cannot open manifest: {e}")))?;
        let manifest: FragmentManifest = serde_json::from_reader(reader)
            .map_err(|e| fail(format!("invalid manifest: {e}")))?;

        if usize::from(manifest.samples_per_pixel) != manifest.photometric.samples_per_pixel() {
            return Err(fail(format!(
                "{:?} needs {} samples per pixel, manifest declares {}",
                manifest.photometric,
                manifest.photometric.samples_per_pixel(),
                manifest.samples_per_pixel
            )));
        }
        if let Some(positions) = &manifest.frame_positions {
            if positions.len() as u64 != manifest.frame_count {
                return Err(fail(format!(
                    "{} frame positions for {} frames",
                    positions.len(),
                    manifest.frame_count
                )));
            }
        }

        let frames_path = manifest_path.with_extension(FRAMES_EXTENSION);
        let frames = File::open(&frames_path)
            .map_err(|e| fail(format!("cannot open {}: {e}", frames_path.display())))?;
        let frame_bytes = manifest.frame_bytes();
        let actual = frames
            .metadata()
            .map_err(|e| fail(format!("cannot stat {}: {e}", frames_path.display())))?
            .len();
        if actual != frame_bytes * manifest.frame_count {
            return Err(fail(format!(
                "{} holds {} bytes, {} frames of {} bytes expected",
                frames_path.display(),
                actual,
                manifest.frame_count,
                frame_bytes
            )));
        }

        let descriptor = FragmentDescriptor {
            name,
            extent: DeclaredExtent {
                total_rows: manifest.total_pixel_rows,
                total_cols: manifest.total_pixel_cols,
                tile_width: manifest.tile_width,
                tile_height: manifest.tile_height,
            },
            tile_offset: manifest.tile_offset,
            frame_count: manifest.frame_count,
            frame_positions: manifest
                .frame_positions
                .map(|p| p.into_iter().map(|[x, y]| (x, y)).collect()),
            pixel_spacing_mm: manifest.pixel_spacing_mm,
            color_space: manifest.photometric,
        };

        let mut anchored_frames = HashMap::new();
        if let Addressing::Explicit(anchors) = classify(&descriptor)? {
            let geometry = GridGeometry::resolve(descriptor.extent)?;
            for (frame, anchor) in anchors.iter().enumerate() {
                let Some(pos) = geometry.tile_of_pixel(anchor.x, anchor.y) else {
                    continue;
                };
                if let Some(previous) = anchored_frames.insert(pos, frame as u64) {
                    return Err(Error::source_read(
                        &descriptor.name,
                        format!(
                            "frames {previous} and {frame} are both anchored in cell ({}, {})",
                            pos.row, pos.col
                        ),
                    ));
                }
            }
        }

        Ok(Self {
            descriptor,
            frames: Mutex::new(frames),
            frames_path,
            frame_bytes: frame_bytes as usize,
            anchored_frames,
        })
    }

    /// Write a manifest and its frame file; returns the manifest path
    pub fn write<P: AsRef<Path>>(
        dir: P,
        stem: &str,
        manifest: &FragmentManifest,
        frames: &[u8],
    ) -> Result<PathBuf> {
        let dir = dir.as_ref();
        if frames.len() as u64 != manifest.frame_bytes() * manifest.frame_count {
            return Err(Error::InvalidInput(format!(
                "{} frame bytes for {} frames of {} bytes",
                frames.len(),
                manifest.frame_count,
                manifest.frame_bytes()
            )));
        }

        let manifest_path = dir.join(format!("{stem}.{MANIFEST_EXTENSION}"));
        let writer = BufWriter::new(File::create(&manifest_path)?);
        serde_json::to_writer_pretty(writer, manifest)
            .map_err(|e| Error::InvalidInput(format!("cannot serialize manifest: {e}")))?;

        let mut writer = BufWriter::new(File::create(manifest_path.with_extension(FRAMES_EXTENSION))?);
        writer.write_all(frames)?;
        writer.flush()?;
        Ok(manifest_path)
    }

    fn frame_for(&self, request: TileRequest) -> Option<u64> {
        if self.descriptor.frame_positions.is_some() {
            self.anchored_frames.get(&request.global).copied()
        } else {
            Some(request.index)
        }
    }
}

impl TileSource for FragmentFile {
    fn descriptor(&self) -> &FragmentDescriptor {
        &self.descriptor
    }

    fn read_tile(&self, request: TileRequest) -> Result<RawTile> {
        let name = &self.descriptor.name;
        let frame = self
            .frame_for(request)
            .filter(|&f| f < self.descriptor.frame_count)
            .ok_or_else(|| {
                Error::source_read(
                    name,
                    format!(
                        "no frame for tile {} at ({}, {})",
                        request.index, request.global.row, request.global.col
                    ),
                )
            })?;

        let mut pixels = vec![0u8; self.frame_bytes];
        {
            let mut file = self.frames.lock();
            file.seek(SeekFrom::Start(frame * self.frame_bytes as u64))
                .and_then(|_| file.read_exact(&mut pixels))
                .map_err(|e| {
                    Error::source_read(
                        name,
                        format!("frame {frame} of {}: {e}", self.frames_path.display()),
                    )
                })?;
        }

        Ok(RawTile {
            pixels,
            color_space: self.descriptor.color_space,
        })
    }
}

/// Manifest files in a slide directory, sorted by name
pub fn discover_fragments<P: AsRef<Path>>(dir: P) -> Result<Vec<PathBuf>> {
    let mut manifests: Vec<PathBuf> = std::fs::read_dir(dir.as_ref())?
        .filter_map(|entry| entry.ok().map(|e| e.path()))
        .filter(|p| p.is_file() && p.extension().is_some_and(|ext| ext == MANIFEST_EXTENSION))
        .collect();
    manifests.sort();
    Ok(manifests)
}

fn fragment_name(manifest_path: &Path) -> String {
    manifest_path
        .file_stem()
        .map(|s| s.to_string_lossy().into_owned())
        .unwrap_or_else(|| manifest_path.display().to_string())
}
