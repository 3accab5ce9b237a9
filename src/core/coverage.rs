//! Spatial coverage index for explicitly addressed fragments
//!
//! Anchors are indexed as tile-grid coordinates in an R-tree. A grid cell has
//! real data iff its nearest anchor is at distance exactly zero.

use rstar::{PointDistance, RTree, RTreeObject, AABB};

use crate::core::geometry::{GridGeometry, TilePosition};
use crate::core::source::PixelAnchor;

/// Anchor cell stored in the R-tree, `[col, row]`
#[derive(Clone, Copy, Debug, PartialEq)]
struct AnchorCell {
    coords: [f64; 2],
}

impl RTreeObject for AnchorCell {
    type Envelope = AABB<[f64; 2]>;

    fn envelope(&self) -> Self::Envelope {
        AABB::from_point(self.coords)
    }
}

impl PointDistance for AnchorCell {
    fn distance_2(&self, point: &[f64; 2]) -> f64 {
        let dx = self.coords[0] - point[0];
        let dy = self.coords[1] - point[1];
        dx * dx + dy * dy
    }

    fn contains_point(&self, point: &[f64; 2]) -> bool {
        self.coords == *point
    }
}

/// Exact-match membership index over a fragment's anchors
///
/// Read-only after construction, so it can be shared by reference across a
/// fragment's workers.
pub struct CoverageIndex {
    tree: RTree<AnchorCell>,
}

impl CoverageIndex {
    /// Build from zero-based pixel anchors
    pub fn build(anchors: &[PixelAnchor], geometry: &GridGeometry) -> Self {
        let cells = anchors
            .iter()
            .filter_map(|a| geometry.tile_of_pixel(a.x, a.y))
            .map(|pos| AnchorCell {
                coords: cell_point(pos),
            })
            .collect();

        Self {
            tree: RTree::bulk_load(cells),
        }
    }

    /// Whether a tile-grid position is a declared anchor
    pub fn has_tile(&self, pos: TilePosition) -> bool {
        let query = cell_point(pos);
        self.tree
            .nearest_neighbor(&query)
            .is_some_and(|nearest| nearest.distance_2(&query) == 0.0)
    }

    /// Number of indexed anchors
    pub fn len(&self) -> usize {
        self.tree.size()
    }

    pub fn is_empty(&self) -> bool {
        self.tree.size() == 0
    }
}

// u32 grid coordinates are exact in f64
fn cell_point(pos: TilePosition) -> [f64; 2] {
    [f64::from(pos.col), f64::from(pos.row)]
}
