//! Level merge orchestration
//!
//! A level is every fragment sharing one magnification. Fragments are written
//! one after another in ascending tile-offset order; tiles within a fragment
//! are written in parallel. The level is complete when every fragment was
//! sequential and covered its whole span, otherwise a background fill pass
//! runs over the finished canvas.

use std::path::Path;

use log::{debug, info, warn};

use crate::core::canvas::CanvasStore;
use crate::core::color::CANVAS_CHANNELS;
use crate::core::coverage::CoverageIndex;
use crate::core::dispatch::{DispatchStats, ProgressCallback, TileDispatcher, WorkerPool};
use crate::core::error::{Error, Result};
use crate::core::fill::fill_background;
use crate::core::geometry::GridGeometry;
use crate::core::source::{classify, Addressing, AddressingMode, Fragment, TileSource};

/// A fragment with its place in the level
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PlannedFragment {
    /// Index into the caller's source list
    pub source_index: usize,
    pub fragment: Fragment,
    /// Cells between this fragment's offset and the next fragment's offset
    pub span: u64,
    /// Sequential and covering its whole span
    pub dense: bool,
}

/// Outcome of one fragment's dispatch
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FragmentReport {
    pub name: String,
    pub mode: AddressingMode,
    pub tile_offset: u64,
    pub tile_count: u64,
    pub stats: DispatchStats,
}

/// A fully written level canvas
#[derive(Debug)]
pub struct MergedLevel {
    pub store: CanvasStore,
    pub geometry: GridGeometry,
    /// No fill pass was needed
    pub complete: bool,
    pub filled_cells: u64,
    pub fragments: Vec<FragmentReport>,
}

/// Order fragments by offset, validate them against the grid and size them
///
/// Fragments must share the representative's declared geometry, start at
/// distinct offsets inside the grid, and a sequential fragment may not declare
/// more frames than fit before the next fragment begins.
pub fn plan_fragments(
    sources: &[Box<dyn TileSource>],
    geometry: &GridGeometry,
) -> Result<Vec<PlannedFragment>> {
    let mut order: Vec<usize> = (0..sources.len()).collect();
    order.sort_by_key(|&i| sources[i].descriptor().tile_offset);

    let cells = geometry.cell_count();
    let mut planned = Vec::with_capacity(order.len());

    for (k, &i) in order.iter().enumerate() {
        let d = sources[i].descriptor();
        let reference = GridGeometry::resolve(d.extent)?;
        if reference != *geometry {
            return Err(Error::Geometry(format!(
                "fragment '{}' declares a {}x{} grid of {}x{} tiles, level uses {}x{} of {}x{}",
                d.name,
                reference.col_count,
                reference.row_count,
                reference.tile_width,
                reference.tile_height,
                geometry.col_count,
                geometry.row_count,
                geometry.tile_width,
                geometry.tile_height
            )));
        }
        if d.tile_offset >= cells {
            return Err(Error::InvalidInput(format!(
                "fragment '{}' starts at tile {}, grid has {} cells",
                d.name, d.tile_offset, cells
            )));
        }

        let next = order.get(k + 1).map(|&n| sources[n].descriptor());
        let end = next.map_or(cells, |n| n.tile_offset);
        if let Some(n) = next {
            if n.tile_offset == d.tile_offset {
                return Err(Error::Overlap {
                    first: d.name.clone(),
                    second: n.name.clone(),
                    detail: format!("both start at tile {}", d.tile_offset),
                });
            }
        }
        let span = end - d.tile_offset;

        let addressing = classify(d)?;
        if addressing == Addressing::Sequential && d.frame_count > span {
            return Err(match next {
                Some(n) => Error::Overlap {
                    first: d.name.clone(),
                    second: n.name.clone(),
                    detail: format!(
                        "{} tiles from offset {} run past offset {}",
                        d.frame_count, d.tile_offset, n.tile_offset
                    ),
                },
                None => Error::InvalidInput(format!(
                    "fragment '{}' declares {} tiles from offset {}, grid has {} cells",
                    d.name, d.frame_count, d.tile_offset, cells
                )),
            });
        }

        // Explicit anchors may land anywhere in the span, so every cell is visited
        let tile_count = match addressing {
            Addressing::Sequential => span.min(d.frame_count),
            Addressing::Explicit(_) => span,
        };
        let dense = addressing == Addressing::Sequential && tile_count == span;
        planned.push(PlannedFragment {
            source_index: i,
            fragment: Fragment {
                name: d.name.clone(),
                tile_offset: d.tile_offset,
                tile_count,
                addressing,
            },
            span,
            dense,
        });
    }
    Ok(planned)
}

/// Merges the fragments of one level into a canvas
pub struct LevelMerger<'a> {
    pub pool: &'a WorkerPool,
    pub background: [u8; 3],
    pub progress: Option<ProgressCallback>,
}

impl LevelMerger<'_> {
    /// Build the level canvas at `canvas_path`
    ///
    /// On failure the partially written canvas is removed; it is never resumed.
    pub fn merge(&self, sources: &[Box<dyn TileSource>], canvas_path: &Path) -> Result<MergedLevel> {
        let representative = sources
            .iter()
            .min_by_key(|s| s.descriptor().tile_offset)
            .ok_or_else(|| Error::InvalidInput("level has no fragments".to_string()))?;
        let geometry = GridGeometry::resolve(representative.descriptor().extent)?;
        let plan = plan_fragments(sources, &geometry)?;

        info!(
            "Level grid {}x{} tiles of {}x{} px ({}x{} canvas), {} fragment(s)",
            geometry.col_count,
            geometry.row_count,
            geometry.tile_width,
            geometry.tile_height,
            geometry.canvas_width,
            geometry.canvas_height,
            plan.len()
        );

        let store = CanvasStore::create(canvas_path, geometry, CANVAS_CHANNELS as u16)?;
        match self.write_level(sources, &plan, &store) {
            Ok((complete, filled_cells, fragments)) => Ok(MergedLevel {
                store,
                geometry,
                complete,
                filled_cells,
                fragments,
            }),
            Err(e) => {
                if let Err(cleanup) = store.remove() {
                    warn!("Could not remove partial canvas: {cleanup}");
                }
                Err(e)
            }
        }
    }

    fn write_level(
        &self,
        sources: &[Box<dyn TileSource>],
        plan: &[PlannedFragment],
        store: &CanvasStore,
    ) -> Result<(bool, u64, Vec<FragmentReport>)> {
        let geometry = *store.geometry();
        let dispatcher = TileDispatcher {
            geometry: &geometry,
            store,
            pool: self.pool,
            background: self.background,
            progress: self.progress.clone(),
        };

        let mut complete = true;
        let mut reports = Vec::with_capacity(plan.len());
        for planned in plan {
            let fragment = &planned.fragment;
            let coverage = match &fragment.addressing {
                Addressing::Explicit(anchors) => Some(CoverageIndex::build(anchors, &geometry)),
                Addressing::Sequential => None,
            };
            debug!(
                "Fragment '{}': {:?}, offset {}, {} of {} tiles{}",
                fragment.name,
                fragment.mode(),
                fragment.tile_offset,
                fragment.tile_count,
                planned.span,
                coverage
                    .as_ref()
                    .map(|c| format!(", {} anchors", c.len()))
                    .unwrap_or_default()
            );

            let source = sources[planned.source_index].as_ref();
            let stats = dispatcher.dispatch(fragment, source, coverage.as_ref())?;
            complete &= planned.dense;

            reports.push(FragmentReport {
                name: fragment.name.clone(),
                mode: fragment.mode(),
                tile_offset: fragment.tile_offset,
                tile_count: fragment.tile_count,
                stats,
            });
        }

        let filled = if complete {
            debug!("Level is dense, skipping background fill");
            0
        } else {
            fill_background(store, self.pool, &self.background)?
        };
        Ok((complete, filled, reports))
    }
}

/// Keep only the fragments of the highest magnification
///
/// Fragments without a usable pixel spacing cannot be placed in a level and
/// are dropped with a warning.
pub fn select_base_level(
    sources: Vec<Box<dyn TileSource>>,
) -> Result<(f64, Vec<Box<dyn TileSource>>)> {
    let mut best: Option<f64> = None;
    let mut tagged = Vec::with_capacity(sources.len());
    for source in sources {
        match source.descriptor().magnification() {
            Some(mag) => {
                best = Some(best.map_or(mag, |b| b.max(mag)));
                tagged.push((mag, source));
            }
            None => warn!(
                "Skipping fragment '{}': no pixel spacing declared",
                source.descriptor().name
            ),
        }
    }

    let magnification =
        best.ok_or_else(|| Error::InvalidInput("no fragment declares a magnification".to_string()))?;
    let level: Vec<_> = tagged
        .into_iter()
        .filter(|(mag, _)| *mag == magnification)
        .map(|(_, source)| source)
        .collect();
    Ok((magnification, level))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::color::ColorSpace;
    use crate::core::geometry::DeclaredExtent;
    use crate::core::source::{FragmentDescriptor, RawTile, TileRequest};

    struct StubSource {
        descriptor: FragmentDescriptor,
    }

    impl TileSource for StubSource {
        fn descriptor(&self) -> &FragmentDescriptor {
            &self.descriptor
        }

        fn read_tile(&self, _request: TileRequest) -> Result<RawTile> {
            Ok(RawTile {
                pixels: vec![1; 4 * 4 * 3],
                color_space: ColorSpace::Rgb,
            })
        }
    }

    fn stub(name: &str, offset: u64, frames: u64, spacing: Option<f64>) -> Box<dyn TileSource> {
        Box::new(StubSource {
            descriptor: FragmentDescriptor {
                name: name.to_string(),
                extent: DeclaredExtent {
                    total_rows: 12,
                    total_cols: 16,
                    tile_width: 4,
                    tile_height: 4,
                },
                tile_offset: offset,
                frame_count: frames,
                frame_positions: None,
                pixel_spacing_mm: spacing,
                color_space: ColorSpace::Rgb,
            },
        })
    }

    fn explicit_stub(name: &str, offset: u64, positions: Vec<(u64, u64)>) -> Box<dyn TileSource> {
        let mut source = StubSource {
            descriptor: stub(name, offset, positions.len() as u64, None).descriptor().clone(),
        };
        source.descriptor.frame_positions = Some(positions);
        Box::new(source)
    }

    fn grid() -> GridGeometry {
        GridGeometry::resolve(DeclaredExtent {
            total_rows: 12,
            total_cols: 16,
            tile_width: 4,
            tile_height: 4,
        })
        .unwrap()
    }

    #[test]
    fn test_plan_orders_by_offset() {
        let sources = vec![stub("b", 6, 6, None), stub("a", 0, 6, None)];
        let plan = plan_fragments(&sources, &grid()).unwrap();
        assert_eq!(plan[0].fragment.name, "a");
        assert_eq!(plan[0].source_index, 1);
        assert_eq!(plan[0].span, 6);
        assert_eq!(plan[1].fragment.name, "b");
        assert_eq!(plan[1].span, 6);
        assert!(plan.iter().all(|p| p.dense));
    }

    #[test]
    fn test_plan_short_fragment_is_not_dense() {
        let sources = vec![stub("a", 0, 4, None), stub("b", 6, 6, None)];
        let plan = plan_fragments(&sources, &grid()).unwrap();
        assert_eq!(plan[0].fragment.tile_count, 4);
        assert!(!plan[0].dense);
        assert!(plan[1].dense);
    }

    #[test]
    fn test_plan_explicit_fragment_visits_whole_span() {
        // Two anchors, the second at cell (2, 3) far past the frame count
        let sources = vec![explicit_stub("sparse", 0, vec![(1, 1), (13, 9)])];
        let plan = plan_fragments(&sources, &grid()).unwrap();
        assert_eq!(plan[0].span, 12);
        assert_eq!(plan[0].fragment.tile_count, 12);
        assert!(!plan[0].dense);

        let sources = vec![stub("a", 0, 4, None), explicit_stub("b", 4, vec![(1, 9)])];
        let plan = plan_fragments(&sources, &grid()).unwrap();
        assert_eq!(plan[1].fragment.tile_count, 8);
    }

    #[test]
    fn test_plan_rejects_overrun() {
        let sources = vec![stub("a", 0, 8, None), stub("b", 6, 6, None)];
        let err = plan_fragments(&sources, &grid()).unwrap_err();
        match err {
            Error::Overlap { first, second, .. } => {
                assert_eq!(first, "a");
                assert_eq!(second, "b");
            }
            other => panic!("expected overlap, got {other}"),
        }
    }

    #[test]
    fn test_plan_rejects_shared_offset() {
        let sources = vec![stub("a", 3, 3, None), stub("b", 3, 3, None)];
        assert!(matches!(
            plan_fragments(&sources, &grid()).unwrap_err(),
            Error::Overlap { .. }
        ));
    }

    #[test]
    fn test_plan_rejects_offset_outside_grid() {
        let sources = vec![stub("a", 12, 1, None)];
        assert!(matches!(
            plan_fragments(&sources, &grid()).unwrap_err(),
            Error::InvalidInput(_)
        ));
    }

    #[test]
    fn test_plan_rejects_last_fragment_past_grid() {
        let sources = vec![stub("a", 10, 3, None)];
        assert!(matches!(
            plan_fragments(&sources, &grid()).unwrap_err(),
            Error::InvalidInput(_)
        ));
    }

    #[test]
    fn test_plan_rejects_mismatched_geometry() {
        let mut other = StubSource {
            descriptor: stub("b", 6, 6, None).descriptor().clone(),
        };
        other.descriptor.extent.tile_width = 8;
        let sources: Vec<Box<dyn TileSource>> = vec![stub("a", 0, 6, None), Box::new(other)];
        assert!(matches!(
            plan_fragments(&sources, &grid()).unwrap_err(),
            Error::Geometry(_)
        ));
    }

    #[test]
    fn test_select_highest_magnification() {
        let sources = vec![
            stub("low", 0, 12, Some(0.000_97)),
            stub("high-b", 6, 6, Some(0.000_242_5)),
            stub("none", 0, 12, None),
            stub("high-a", 0, 6, Some(0.000_25)),
        ];
        let (mag, level) = select_base_level(sources).unwrap();
        assert_eq!(mag, 40.0);
        let names: Vec<_> = level.iter().map(|s| s.descriptor().name.clone()).collect();
        assert_eq!(names, vec!["high-b", "high-a"]);
    }

    #[test]
    fn test_select_without_spacing_fails() {
        let err = select_base_level(vec![stub("a", 0, 12, None)]).err().unwrap();
        assert!(matches!(err, Error::InvalidInput(_)));
    }
}
