//! Bounding boxes and zoom selection.

use log::{debug, warn};
use serde::Serialize;

use crate::engine::QueryEngine;
use crate::error::{Error, Result};
use crate::fingerprint::Query;

pub type ZoomLevel = u8;

pub const WORLD_WIDTH: f64 = 360.0;
pub const WORLD_HEIGHT: f64 = 180.0;

/// Geographic bounding box in degrees.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct BoundingBox {
    pub xmin: f64,
    pub ymin: f64,
    pub xmax: f64,
    pub ymax: f64,
}

impl BoundingBox {
    pub fn new(xmin: f64, ymin: f64, xmax: f64, ymax: f64) -> Result<Self> {
        let bbox = BoundingBox {
            xmin,
            ymin,
            xmax,
            ymax,
        };
        if !bbox.is_finite() {
            return Err(Error::InvalidExtent(format!(
                "non-finite bounds {}",
                bbox
            )));
        }
        if xmin > xmax || ymin > ymax {
            return Err(Error::InvalidExtent(format!("inverted bounds {}", bbox)));
        }
        Ok(bbox)
    }

    /// The box of a single point.
    pub fn point(x: f64, y: f64) -> Self {
        BoundingBox {
            xmin: x,
            ymin: y,
            xmax: x,
            ymax: y,
        }
    }

    pub fn from_rect(rect: geo::Rect<f64>) -> Self {
        let (min, max) = (rect.min(), rect.max());
        BoundingBox {
            xmin: min.x,
            ymin: min.y,
            xmax: max.x,
            ymax: max.y,
        }
    }

    pub fn width(&self) -> f64 {
        self.xmax - self.xmin
    }

    pub fn height(&self) -> f64 {
        self.ymax - self.ymin
    }

    pub fn is_finite(&self) -> bool {
        self.xmin.is_finite() && self.ymin.is_finite() && self.xmax.is_finite() && self.ymax.is_finite()
    }

    pub fn union(&self, other: &BoundingBox) -> BoundingBox {
        BoundingBox {
            xmin: self.xmin.min(other.xmin),
            ymin: self.ymin.min(other.ymin),
            xmax: self.xmax.max(other.xmax),
            ymax: self.ymax.max(other.ymax),
        }
    }

    /// Union of many boxes; `None` when the iterator is empty.
    pub fn union_all<'a>(boxes: impl IntoIterator<Item = &'a BoundingBox>) -> Option<BoundingBox> {
        boxes.into_iter().fold(None, |acc, bbox| match acc {
            None => Some(*bbox),
            Some(acc) => Some(acc.union(bbox)),
        })
    }

    /// Closed-interval rectangle test: boxes sharing an edge intersect.
    pub fn intersects(&self, other: &BoundingBox) -> bool {
        !(self.xmin > other.xmax
            || self.xmax < other.xmin
            || self.ymin > other.ymax
            || self.ymax < other.ymin)
    }

    pub fn contains(&self, other: &BoundingBox) -> bool {
        self.xmin <= other.xmin
            && self.ymin <= other.ymin
            && self.xmax >= other.xmax
            && self.ymax >= other.ymax
    }

    pub fn expand(&self, dx: f64, dy: f64) -> BoundingBox {
        BoundingBox {
            xmin: self.xmin - dx,
            ymin: self.ymin - dy,
            xmax: self.xmax + dx,
            ymax: self.ymax + dy,
        }
    }

    pub fn clamp_to_world(&self) -> BoundingBox {
        BoundingBox {
            xmin: self.xmin.clamp(-180.0, 180.0),
            ymin: self.ymin.clamp(-90.0, 90.0),
            xmax: self.xmax.clamp(-180.0, 180.0),
            ymax: self.ymax.clamp(-90.0, 90.0),
        }
    }

    /// `[[xmin, ymin], [xmax, ymax]]`, the shape map frontends expect.
    pub fn corners(&self) -> [[f64; 2]; 2] {
        [[self.xmin, self.ymin], [self.xmax, self.ymax]]
    }
}

impl std::fmt::Display for BoundingBox {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "({}, {}, {}, {})",
            self.xmin, self.ymin, self.xmax, self.ymax
        )
    }
}

impl Serialize for BoundingBox {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        self.corners().serialize(serializer)
    }
}

/// `floor(log2(360 / width))` without any clamping.
///
/// Widths of zero (a single point or a vertical line) have no finite zoom, and
/// widths of a whole world or more would need a negative one; both are
/// rejected.
pub fn zoom_for_width(width: f64) -> Result<u32> {
    if !width.is_finite() || width <= 0.0 {
        return Err(Error::InvalidExtent(format!(
            "bounding box width {} has no finite zoom",
            width
        )));
    }
    if width >= WORLD_WIDTH {
        return Err(Error::InvalidExtent(format!(
            "bounding box width {} spans the whole world",
            width
        )));
    }
    Ok((WORLD_WIDTH / width).log2().floor() as u32)
}

/// Zoom level for a data extent, capped at `max_zoom`.
pub fn zoom_for_bounds(bounds: &BoundingBox, max_zoom: ZoomLevel) -> Result<ZoomLevel> {
    let zoom = zoom_for_width(bounds.width())?;
    if zoom > max_zoom as u32 {
        warn!(
            "zoom {} for extent {} exceeds the maximum, using {}",
            zoom, bounds, max_zoom
        );
        return Ok(max_zoom);
    }
    Ok(zoom as ZoomLevel)
}

/// Bounds and zoom of a query's result set.
#[derive(Clone, Copy, Debug, PartialEq, Serialize)]
pub struct Extent {
    pub bounds: BoundingBox,
    pub zoom: ZoomLevel,
}

/// Asks the engine for the extent of `query` and derives its zoom level.
pub async fn estimate_bounds<E: QueryEngine + ?Sized>(
    engine: &E,
    query: &Query,
    geometry_column: &str,
    max_zoom: ZoomLevel,
) -> Result<Extent> {
    let bounds = engine
        .bounds(query, geometry_column)
        .await?
        .ok_or_else(|| Error::InvalidExtent("query returned no geometries".into()))?;
    let bounds = BoundingBox::new(bounds.xmin, bounds.ymin, bounds.xmax, bounds.ymax)?;
    let zoom = zoom_for_bounds(&bounds, max_zoom)?;
    debug!("extent {} -> zoom {}", bounds, zoom);
    Ok(Extent { bounds, zoom })
}
