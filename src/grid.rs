//! Quad-tree tile grid and feature partitioning.
//!
//! At zoom `z` the world is split into `2^z x 2^z` tiles, each `360 / 2^z`
//! degrees wide and `180 / 2^z` degrees tall. Columns grow eastward from -180
//! and rows grow southward from +90, matching the usual XYZ convention.

use std::collections::BTreeMap;
use std::fmt;

use crate::bounds::{BoundingBox, ZoomLevel, WORLD_HEIGHT, WORLD_WIDTH};
use crate::config::MAX_SUPPORTED_ZOOM;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TileCoordinate {
    pub z: ZoomLevel,
    pub x: u32,
    pub y: u32,
}

impl TileCoordinate {
    pub fn new(z: ZoomLevel, x: u32, y: u32) -> Self {
        TileCoordinate { z, x, y }
    }

    /// Whether `x` and `y` fall inside the grid for this zoom.
    pub fn is_valid(&self) -> bool {
        if self.z > MAX_SUPPORTED_ZOOM {
            return false;
        }
        let n = tiles_per_axis(self.z);
        self.x < n && self.y < n
    }

    /// Geographic extent of the tile.
    pub fn extent(&self) -> BoundingBox {
        let width = tile_width(self.z);
        let height = tile_height(self.z);
        let xmin = -180.0 + self.x as f64 * width;
        let ymax = 90.0 - self.y as f64 * height;
        BoundingBox {
            xmin,
            ymin: ymax - height,
            xmax: xmin + width,
            ymax,
        }
    }
}

impl fmt::Display for TileCoordinate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}/{}", self.z, self.x, self.y)
    }
}

pub fn tiles_per_axis(zoom: ZoomLevel) -> u32 {
    1u32 << zoom
}

pub fn tile_width(zoom: ZoomLevel) -> f64 {
    WORLD_WIDTH / tiles_per_axis(zoom) as f64
}

pub fn tile_height(zoom: ZoomLevel) -> f64 {
    WORLD_HEIGHT / tiles_per_axis(zoom) as f64
}

fn clamp_index(index: f64, zoom: ZoomLevel) -> u32 {
    let max = (tiles_per_axis(zoom) - 1) as f64;
    index.floor().clamp(0.0, max) as u32
}

/// Column containing longitude `lon`, clamped to the grid.
pub fn column_for_lon(lon: f64, zoom: ZoomLevel) -> u32 {
    clamp_index((lon + 180.0) / tile_width(zoom), zoom)
}

/// Row containing latitude `lat`, clamped to the grid.
pub fn row_for_lat(lat: f64, zoom: ZoomLevel) -> u32 {
    clamp_index((90.0 - lat) / tile_height(zoom), zoom)
}

fn padded(bounds: &BoundingBox, zoom: ZoomLevel, margin: f64) -> BoundingBox {
    bounds
        .expand(margin * tile_width(zoom), margin * tile_height(zoom))
        .clamp_to_world()
}

/// Inclusive column and row ranges under `bbox`.
fn index_range(bbox: &BoundingBox, zoom: ZoomLevel) -> ((u32, u32), (u32, u32)) {
    (
        (column_for_lon(bbox.xmin, zoom), column_for_lon(bbox.xmax, zoom)),
        (row_for_lat(bbox.ymax, zoom), row_for_lat(bbox.ymin, zoom)),
    )
}

/// Tiles whose extent intersects `bounds` padded by `margin` tiles on every
/// side, in row-major order (y then x). Never empty for finite bounds.
pub fn covering_tiles(bounds: &BoundingBox, zoom: ZoomLevel, margin: f64) -> Vec<TileCoordinate> {
    let padded = padded(bounds, zoom, margin);
    let ((x0, x1), (y0, y1)) = index_range(&padded, zoom);

    (y0..=y1)
        .flat_map(|y| (x0..=x1).map(move |x| TileCoordinate::new(zoom, x, y)))
        .filter(|tile| tile.extent().intersects(&padded))
        .collect()
}

/// Upper bound on `covering_tiles(bounds, zoom, margin).len()`, computed
/// without enumerating the tiles.
pub fn covering_tile_count(bounds: &BoundingBox, zoom: ZoomLevel, margin: f64) -> u64 {
    let ((x0, x1), (y0, y1)) = index_range(&padded(bounds, zoom, margin), zoom);
    (u64::from(x1 - x0) + 1) * (u64::from(y1 - y0) + 1)
}

/// Assignment of features (by index into the input slice) to tiles. Only
/// tiles that received at least one feature are kept.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Partition {
    zoom: ZoomLevel,
    tiles: BTreeMap<TileCoordinate, Vec<usize>>,
}

impl Partition {
    /// Assigns each feature box to every tile covering `bounds` at `zoom`
    /// that it intersects. Per-tile feature lists keep input order.
    pub fn new(
        bounds: &BoundingBox,
        zoom: ZoomLevel,
        margin: f64,
        feature_boxes: &[BoundingBox],
    ) -> Self {
        let padded = padded(bounds, zoom, margin);
        let ((px0, px1), (py0, py1)) = index_range(&padded, zoom);
        let mut tiles: BTreeMap<TileCoordinate, Vec<usize>> = BTreeMap::new();

        for (index, fbox) in feature_boxes.iter().enumerate() {
            // Widen the candidate range by one tile so float error at tile
            // edges is settled by the exact rectangle test below.
            let ((x0, x1), (y0, y1)) = index_range(fbox, zoom);
            let (x0, x1) = (x0.saturating_sub(1).max(px0), x1.saturating_add(1).min(px1));
            let (y0, y1) = (y0.saturating_sub(1).max(py0), y1.saturating_add(1).min(py1));

            for y in y0..=y1 {
                for x in x0..=x1 {
                    let tile = TileCoordinate::new(zoom, x, y);
                    let extent = tile.extent();
                    if extent.intersects(&padded) && fbox.intersects(&extent) {
                        tiles.entry(tile).or_default().push(index);
                    }
                }
            }
        }

        Partition { zoom, tiles }
    }

    pub fn zoom(&self) -> ZoomLevel {
        self.zoom
    }

    /// Tiles with at least one feature.
    pub fn tiles(&self) -> impl Iterator<Item = &TileCoordinate> {
        self.tiles.keys()
    }

    pub fn tile_count(&self) -> usize {
        self.tiles.len()
    }

    /// Tiles with their feature indices, in `(z, x, y)` order.
    pub fn assigned(&self) -> impl Iterator<Item = (&TileCoordinate, &[usize])> {
        self.tiles
            .iter()
            .map(|(tile, features)| (tile, features.as_slice()))
    }

    pub fn features_for(&self, tile: &TileCoordinate) -> &[usize] {
        self.tiles.get(tile).map(Vec::as_slice).unwrap_or(&[])
    }

    /// Tiles a given feature was assigned to.
    pub fn tiles_for_feature(&self, feature: usize) -> Vec<TileCoordinate> {
        self.tiles
            .iter()
            .filter(|(_, features)| features.contains(&feature))
            .map(|(tile, _)| *tile)
            .collect()
    }
}
