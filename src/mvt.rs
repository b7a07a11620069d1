//! MVT (Mapbox Vector Tile) encoding.
//!
//! Features are projected from degrees into the tile's local integer grid
//! (`0..extent` on both axes, origin at the top-left corner) and written as
//! zigzag/delta encoded command streams. Property keys and values are
//! deduplicated per layer in first-seen order, so encoding is deterministic.
//!
//! Reference: <https://github.com/mapbox/vector-tile-spec>

use std::collections::HashMap;

use geo::orient::{Direction, Orient};
use geo::{Coord, Geometry, LineString, Polygon};
use log::warn;
use prost::Message;

use crate::error::Error;
use crate::feature::{Feature, PropertyValue};
use crate::grid::{tile_height, tile_width, TileCoordinate};
use crate::vector_tile::tile::{self, GeomType};
use crate::vector_tile::Tile;

const CMD_MOVE_TO: u32 = 1;
const CMD_LINE_TO: u32 = 2;
const CMD_CLOSE_PATH: u32 = 7;

const LAYER_VERSION: u32 = 2;

/// Tile-space coordinates are kept within +/-2^29 so command deltas fit `i32`.
const MAX_TILE_COORD: f64 = (1u32 << 29) as f64;

#[inline]
pub fn zigzag_encode(n: i32) -> u32 {
    ((n << 1) ^ (n >> 31)) as u32
}

#[inline]
pub fn zigzag_decode(n: u32) -> i32 {
    ((n >> 1) as i32) ^ -((n & 1) as i32)
}

/// Packs a command id with its repeat count.
#[inline]
pub fn command_encode(command_id: u32, count: u32) -> u32 {
    (command_id & 0x7) | (count << 3)
}

#[inline]
pub fn command_decode(command: u32) -> (u32, u32) {
    (command & 0x7, command >> 3)
}

/// Maps degrees onto one tile's integer grid. Y is flipped: latitude grows
/// north, tile rows grow down.
#[derive(Clone, Copy, Debug)]
pub struct TileTransform {
    xmin: f64,
    ymax: f64,
    x_scale: f64,
    y_scale: f64,
}

impl TileTransform {
    pub fn new(tile: &TileCoordinate, extent: u32) -> Self {
        let bounds = tile.extent();
        TileTransform {
            xmin: bounds.xmin,
            ymax: bounds.ymax,
            x_scale: extent as f64 / tile_width(tile.z),
            y_scale: extent as f64 / tile_height(tile.z),
        }
    }

    pub fn apply(&self, coord: Coord<f64>) -> Result<(i32, i32), String> {
        let x = ((coord.x - self.xmin) * self.x_scale).round();
        let y = ((self.ymax - coord.y) * self.y_scale).round();
        let range = -MAX_TILE_COORD..=MAX_TILE_COORD;
        if !range.contains(&x) || !range.contains(&y) {
            return Err(format!(
                "coordinate ({}, {}) cannot be placed in the tile",
                coord.x, coord.y
            ));
        }
        Ok((x as i32, y as i32))
    }

    fn apply_all<'a>(
        &self,
        coords: impl IntoIterator<Item = &'a Coord<f64>>,
    ) -> Result<Vec<(i32, i32)>, String> {
        let mut points: Vec<(i32, i32)> = Vec::new();
        for coord in coords {
            let point = self.apply(*coord)?;
            // Collapse runs that round onto the same tile unit
            if points.last() != Some(&point) {
                points.push(point);
            }
        }
        Ok(points)
    }
}

/// Accumulates a command stream, tracking the cursor for delta encoding.
#[derive(Default)]
struct CommandWriter {
    commands: Vec<u32>,
    cursor: (i32, i32),
}

impl CommandWriter {
    fn push_points(&mut self, points: &[(i32, i32)]) {
        for &(x, y) in points {
            self.commands.push(zigzag_encode(x - self.cursor.0));
            self.commands.push(zigzag_encode(y - self.cursor.1));
            self.cursor = (x, y);
        }
    }

    fn move_to(&mut self, points: &[(i32, i32)]) {
        self.commands
            .push(command_encode(CMD_MOVE_TO, points.len() as u32));
        self.push_points(points);
    }

    fn line_to(&mut self, points: &[(i32, i32)]) {
        self.commands
            .push(command_encode(CMD_LINE_TO, points.len() as u32));
        self.push_points(points);
    }

    fn close_path(&mut self) {
        self.commands.push(command_encode(CMD_CLOSE_PATH, 1));
    }

    fn line(&mut self, points: &[(i32, i32)]) {
        self.move_to(&points[..1]);
        self.line_to(&points[1..]);
    }

    fn ring(&mut self, points: &[(i32, i32)]) {
        self.line(points);
        self.close_path();
    }
}

/// A geometry flattened to a single MVT geometry type.
enum Shape {
    Points(Vec<Coord<f64>>),
    Lines(Vec<LineString<f64>>),
    Polygons(Vec<Polygon<f64>>),
}

impl Shape {
    fn kind(&self) -> GeomType {
        match self {
            Shape::Points(_) => GeomType::Point,
            Shape::Lines(_) => GeomType::Linestring,
            Shape::Polygons(_) => GeomType::Polygon,
        }
    }

    fn extend(&mut self, other: Shape) -> Result<(), String> {
        match (self, other) {
            (Shape::Points(a), Shape::Points(b)) => a.extend(b),
            (Shape::Lines(a), Shape::Lines(b)) => a.extend(b),
            (Shape::Polygons(a), Shape::Polygons(b)) => a.extend(b),
            _ => return Err("geometry collection mixes geometry types".into()),
        }
        Ok(())
    }

    fn from_geometry(geometry: &Geometry<f64>) -> Result<Option<Shape>, String> {
        let shape = match geometry {
            Geometry::Point(p) => Shape::Points(vec![p.0]),
            Geometry::MultiPoint(mp) => Shape::Points(mp.iter().map(|p| p.0).collect()),
            Geometry::Line(l) => Shape::Lines(vec![LineString::new(vec![l.start, l.end])]),
            Geometry::LineString(ls) => Shape::Lines(vec![ls.clone()]),
            Geometry::MultiLineString(mls) => Shape::Lines(mls.0.clone()),
            Geometry::Polygon(p) => Shape::Polygons(vec![p.clone()]),
            Geometry::MultiPolygon(mp) => Shape::Polygons(mp.0.clone()),
            Geometry::Rect(r) => Shape::Polygons(vec![r.to_polygon()]),
            Geometry::Triangle(t) => Shape::Polygons(vec![t.to_polygon()]),
            Geometry::GeometryCollection(gc) => {
                let mut merged: Option<Shape> = None;
                for member in gc.iter() {
                    let Some(shape) = Shape::from_geometry(member)? else {
                        continue;
                    };
                    match merged.as_mut() {
                        Some(acc) => acc.extend(shape)?,
                        None => merged = Some(shape),
                    }
                }
                return Ok(merged);
            }
        };
        Ok(Some(shape))
    }
}

/// Ring points in tile space without the closing duplicate, or `None` when
/// fewer than three distinct points survive rounding.
fn ring_points(ring: &LineString<f64>, transform: &TileTransform) -> Result<Option<Vec<(i32, i32)>>, String> {
    let mut points = transform.apply_all(ring.coords())?;
    if points.len() > 1 && points.first() == points.last() {
        points.pop();
    }
    Ok(if points.len() >= 3 { Some(points) } else { None })
}

/// Encodes a geometry into an MVT command stream for one tile.
///
/// Returns `Ok(None)` when nothing drawable remains after rounding, for
/// example a line shorter than one tile unit.
pub fn encode_geometry(
    geometry: &Geometry<f64>,
    transform: &TileTransform,
) -> Result<Option<(GeomType, Vec<u32>)>, String> {
    let shape = match Shape::from_geometry(geometry)? {
        Some(shape) => shape,
        None => return Ok(None),
    };
    let kind = shape.kind();
    let mut writer = CommandWriter::default();

    match shape {
        Shape::Points(coords) => {
            let mut points = Vec::with_capacity(coords.len());
            for coord in coords {
                points.push(transform.apply(coord)?);
            }
            if !points.is_empty() {
                writer.move_to(&points);
            }
        }
        Shape::Lines(lines) => {
            for line in &lines {
                let points = transform.apply_all(line.coords())?;
                if points.len() >= 2 {
                    writer.line(&points);
                }
            }
        }
        Shape::Polygons(polygons) => {
            for polygon in polygons {
                // Exteriors need a positive area in y-down tile space, which
                // is clockwise in degrees.
                let polygon = polygon.orient(Direction::Reversed);
                let exterior = match ring_points(polygon.exterior(), transform)? {
                    Some(points) => points,
                    None => continue,
                };
                writer.ring(&exterior);
                for interior in polygon.interiors() {
                    if let Some(points) = ring_points(interior, transform)? {
                        writer.ring(&points);
                    }
                }
            }
        }
    }

    if writer.commands.is_empty() {
        return Ok(None);
    }
    Ok(Some((kind, writer.commands)))
}

/// Decodes a command stream back into absolute tile-space paths, one per
/// MoveTo. Closing points are not repeated.
pub fn decode_geometry(commands: &[u32]) -> Vec<Vec<(i32, i32)>> {
    let mut paths: Vec<Vec<(i32, i32)>> = Vec::new();
    let mut cursor = (0i32, 0i32);
    let mut i = 0;
    while i < commands.len() {
        let (id, count) = command_decode(commands[i]);
        i += 1;
        match id {
            CMD_MOVE_TO | CMD_LINE_TO => {
                for _ in 0..count {
                    if i + 1 >= commands.len() {
                        break;
                    }
                    cursor.0 += zigzag_decode(commands[i]);
                    cursor.1 += zigzag_decode(commands[i + 1]);
                    i += 2;
                    if id == CMD_MOVE_TO {
                        paths.push(vec![cursor]);
                    } else if let Some(path) = paths.last_mut() {
                        path.push(cursor);
                    }
                }
            }
            _ => {}
        }
    }
    paths
}

#[derive(Clone, Debug, PartialEq, Eq, Hash)]
enum ValueKey {
    Int(i64),
    Double(u64),
    Text(String),
    Bool(bool),
}

impl From<&PropertyValue> for ValueKey {
    fn from(value: &PropertyValue) -> Self {
        match value {
            PropertyValue::Int(v) => ValueKey::Int(*v),
            PropertyValue::Double(v) => ValueKey::Double(v.to_bits()),
            PropertyValue::Text(v) => ValueKey::Text(v.clone()),
            PropertyValue::Bool(v) => ValueKey::Bool(*v),
        }
    }
}

fn to_mvt_value(value: &PropertyValue) -> tile::Value {
    match value {
        PropertyValue::Int(v) if *v < 0 => tile::Value {
            sint_value: Some(*v),
            ..Default::default()
        },
        PropertyValue::Int(v) => tile::Value {
            int_value: Some(*v),
            ..Default::default()
        },
        PropertyValue::Double(v) => tile::Value {
            double_value: Some(*v),
            ..Default::default()
        },
        PropertyValue::Text(v) => tile::Value {
            string_value: Some(v.clone()),
            ..Default::default()
        },
        PropertyValue::Bool(v) => tile::Value {
            bool_value: Some(*v),
            ..Default::default()
        },
    }
}

/// Builds one layer, interning keys and values.
pub struct LayerBuilder {
    name: String,
    extent: u32,
    features: Vec<tile::Feature>,
    keys: Vec<String>,
    key_index: HashMap<String, u32>,
    values: Vec<tile::Value>,
    value_index: HashMap<ValueKey, u32>,
}

impl LayerBuilder {
    pub fn new(name: impl Into<String>, extent: u32) -> Self {
        LayerBuilder {
            name: name.into(),
            extent,
            features: Vec::new(),
            keys: Vec::new(),
            key_index: HashMap::new(),
            values: Vec::new(),
            value_index: HashMap::new(),
        }
    }

    fn key(&mut self, key: &str) -> u32 {
        if let Some(&idx) = self.key_index.get(key) {
            return idx;
        }
        let idx = self.keys.len() as u32;
        self.keys.push(key.to_string());
        self.key_index.insert(key.to_string(), idx);
        idx
    }

    fn value(&mut self, value: &PropertyValue) -> u32 {
        let key = ValueKey::from(value);
        if let Some(&idx) = self.value_index.get(&key) {
            return idx;
        }
        let idx = self.values.len() as u32;
        self.values.push(to_mvt_value(value));
        self.value_index.insert(key, idx);
        idx
    }

    /// Adds a feature; returns `Ok(false)` if it vanished at this tile's
    /// resolution.
    pub fn add_feature(&mut self, feature: &Feature, transform: &TileTransform) -> Result<bool, Error> {
        let encoded = encode_geometry(&feature.geometry, transform).map_err(|reason| {
            Error::Encoding {
                feature: feature.row,
                reason,
            }
        })?;
        let (kind, geometry) = match encoded {
            Some(encoded) => encoded,
            None => return Ok(false),
        };

        let mut tags = Vec::with_capacity(feature.properties.len() * 2);
        for (key, value) in &feature.properties {
            tags.push(self.key(key));
            tags.push(self.value(value));
        }

        self.features.push(tile::Feature {
            id: feature.id,
            tags,
            r#type: Some(kind as i32),
            geometry,
        });
        Ok(true)
    }

    pub fn num_features(&self) -> usize {
        self.features.len()
    }

    pub fn build(self) -> tile::Layer {
        tile::Layer {
            version: LAYER_VERSION,
            name: self.name,
            features: self.features,
            keys: self.keys,
            values: self.values,
            extent: Some(self.extent),
        }
    }
}

/// Result of encoding one tile.
#[derive(Debug)]
pub struct EncodedTile {
    pub data: Vec<u8>,
    pub features: usize,
    /// Features that could not be encoded and were left out.
    pub skipped: Vec<Error>,
}

/// Encodes the features assigned to a tile into a single-layer payload.
#[derive(Clone, Debug)]
pub struct TileEncoder {
    layer_name: String,
    extent: u32,
}

impl TileEncoder {
    pub fn new(layer_name: impl Into<String>, extent: u32) -> Self {
        TileEncoder {
            layer_name: layer_name.into(),
            extent,
        }
    }

    pub fn encode<'a>(
        &self,
        coord: &TileCoordinate,
        features: impl IntoIterator<Item = &'a Feature>,
    ) -> EncodedTile {
        let transform = TileTransform::new(coord, self.extent);
        let mut layer = LayerBuilder::new(self.layer_name.clone(), self.extent);
        let mut skipped = Vec::new();

        for feature in features {
            if let Err(e) = layer.add_feature(feature, &transform) {
                warn!("tile {}: {}", coord, e);
                skipped.push(e);
            }
        }

        let count = layer.num_features();
        let tile = Tile {
            layers: vec![layer.build()],
        };
        EncodedTile {
            data: tile.encode_to_vec(),
            features: count,
            skipped,
        }
    }
}

pub fn decode_tile(data: &[u8]) -> Result<Tile, prost::DecodeError> {
    Tile::decode(data)
}
