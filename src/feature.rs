//! Row ingestion: turns engine rows into typed features.

use geo::{BoundingRect, Geometry};
use geozero::wkb::Wkb;
use geozero::ToGeo;
use log::warn;
use wkt::TryFromWkt;

use crate::bounds::BoundingBox;
use crate::error::Error;
use crate::schema::Schema;

/// A scalar property value.
#[derive(Clone, Debug, PartialEq)]
pub enum PropertyValue {
    Int(i64),
    Double(f64),
    Text(String),
    Bool(bool),
}

impl From<i64> for PropertyValue {
    fn from(v: i64) -> Self {
        PropertyValue::Int(v)
    }
}

impl From<f64> for PropertyValue {
    fn from(v: f64) -> Self {
        PropertyValue::Double(v)
    }
}

impl From<&str> for PropertyValue {
    fn from(v: &str) -> Self {
        PropertyValue::Text(v.to_string())
    }
}

impl From<String> for PropertyValue {
    fn from(v: String) -> Self {
        PropertyValue::Text(v)
    }
}

impl From<bool> for PropertyValue {
    fn from(v: bool) -> Self {
        PropertyValue::Bool(v)
    }
}

/// A geometry value as delivered by the engine.
#[derive(Clone, Debug, PartialEq)]
pub enum GeometryValue {
    Wkb(Vec<u8>),
    /// Hex encoded WKB, optionally prefixed with `\x` or `0x`.
    HexWkb(String),
    Wkt(String),
}

impl GeometryValue {
    pub fn decode(&self) -> Result<Geometry<f64>, String> {
        match self {
            GeometryValue::Wkb(bytes) => decode_wkb(bytes),
            GeometryValue::HexWkb(text) => {
                let text = text.trim();
                let digits = text
                    .strip_prefix("\\x")
                    .or_else(|| text.strip_prefix("0x"))
                    .unwrap_or(text);
                let bytes = hex::decode(digits).map_err(|e| format!("invalid hex WKB: {}", e))?;
                decode_wkb(&bytes)
            }
            GeometryValue::Wkt(text) => Geometry::<f64>::try_from_wkt_str(text)
                .map_err(|e| format!("invalid WKT: {}", e)),
        }
    }
}

fn decode_wkb(bytes: &[u8]) -> Result<Geometry<f64>, String> {
    Wkb(bytes.to_vec())
        .to_geo()
        .map_err(|e| format!("invalid WKB: {}", e))
}

/// One result row, with property values aligned to
/// [`Schema::property_columns`].
#[derive(Clone, Debug, PartialEq)]
pub struct Row {
    pub geometry: Option<GeometryValue>,
    pub properties: Vec<Option<PropertyValue>>,
}

/// A decoded row ready for tiling.
#[derive(Clone, Debug, PartialEq)]
pub struct Feature {
    /// Position of the row in the query result.
    pub row: usize,
    pub id: Option<u64>,
    pub geometry: Geometry<f64>,
    pub bbox: BoundingBox,
    /// Non-null properties in schema order.
    pub properties: Vec<(String, PropertyValue)>,
}

/// Decodes rows into features.
///
/// Rows whose geometry is null, malformed, empty, or non-finite are skipped
/// and reported; one bad row never aborts the rest. An integer index value
/// becomes the feature id and is left out of the properties; other index
/// values stay as ordinary properties.
pub fn decode_rows(schema: &Schema, rows: &[Row]) -> (Vec<Feature>, Vec<Error>) {
    let columns = schema.property_columns();
    let index_column = schema.index_column();
    let mut features = Vec::with_capacity(rows.len());
    let mut skipped = Vec::new();

    for (row_number, row) in rows.iter().enumerate() {
        match decode_row(row_number, row, &columns, index_column) {
            Ok(feature) => features.push(feature),
            Err(e) => {
                warn!("skipping row {}: {}", row_number, e);
                skipped.push(e);
            }
        }
    }

    (features, skipped)
}

fn decode_row(
    row_number: usize,
    row: &Row,
    columns: &[&str],
    index_column: &str,
) -> Result<Feature, Error> {
    let fail = |reason: String| Error::Encoding {
        feature: row_number,
        reason,
    };

    let geometry = row
        .geometry
        .as_ref()
        .ok_or_else(|| fail("null geometry".into()))?
        .decode()
        .map_err(fail)?;
    let rect = geometry
        .bounding_rect()
        .ok_or_else(|| fail("empty geometry".into()))?;
    let bbox = BoundingBox::from_rect(rect);
    if !bbox.is_finite() {
        return Err(fail("non-finite coordinates".into()));
    }

    let mut id = None;
    let mut properties = Vec::with_capacity(columns.len());
    for (name, value) in columns.iter().zip(row.properties.iter()) {
        let value = match value {
            Some(value) => value,
            None => continue,
        };
        if *name == index_column {
            if let PropertyValue::Int(v) = value {
                if let Ok(v) = u64::try_from(*v) {
                    id = Some(v);
                    continue;
                }
            }
        }
        properties.push((name.to_string(), value.clone()));
    }

    Ok(Feature {
        row: row_number,
        id,
        geometry,
        bbox,
        properties,
    })
}
