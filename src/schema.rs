//! Result-set schemas and the tile metadata derived from them.

use serde::ser::SerializeMap;
use serde::{Serialize, Serializer};

use crate::bounds::{BoundingBox, Extent, ZoomLevel};
use crate::error::{Error, Result};

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ColumnType {
    Integer,
    Double,
    Text,
    Boolean,
    Date,
    Geometry,
    /// Any engine type without a closer match; delivered as text.
    Other,
}

impl ColumnType {
    /// Property type name understood by the map frontend.
    pub fn property_type(&self) -> &'static str {
        match self {
            ColumnType::Integer | ColumnType::Double => "number",
            ColumnType::Boolean => "boolean",
            ColumnType::Date => "date",
            ColumnType::Geometry => "geometry",
            ColumnType::Text | ColumnType::Other => "string",
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Column {
    pub name: String,
    pub column_type: ColumnType,
}

impl Column {
    pub fn new(name: impl Into<String>, column_type: ColumnType) -> Self {
        Column {
            name: name.into(),
            column_type,
        }
    }
}

/// Columns of a query result, checked once when the result is ingested.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Schema {
    columns: Vec<Column>,
    geometry_column: usize,
    index_column: usize,
}

impl Schema {
    /// Builds a schema, requiring both the geometry and the index column.
    pub fn validate(columns: Vec<Column>, geometry_column: &str, index_column: &str) -> Result<Schema> {
        for (i, column) in columns.iter().enumerate() {
            if columns[..i].iter().any(|c| c.name == column.name) {
                return Err(Error::Schema(format!(
                    "duplicate column \"{}\"",
                    column.name
                )));
            }
        }

        let position = |name: &str| columns.iter().position(|c| c.name == name);
        let geometry_column = position(geometry_column).ok_or_else(|| {
            Error::Schema(format!("no \"{}\" geometry column found", geometry_column))
        })?;
        let index_column = position(index_column)
            .ok_or_else(|| Error::Schema(format!("no \"{}\" column found", index_column)))?;
        if geometry_column == index_column {
            return Err(Error::Schema(
                "geometry and index columns must differ".into(),
            ));
        }

        Ok(Schema {
            columns,
            geometry_column,
            index_column,
        })
    }

    pub fn columns(&self) -> &[Column] {
        &self.columns
    }

    pub fn geometry_column(&self) -> &str {
        &self.columns[self.geometry_column].name
    }

    pub fn index_column(&self) -> &str {
        &self.columns[self.index_column].name
    }

    /// Every column except the geometry, in result order.
    pub fn properties(&self) -> impl Iterator<Item = &Column> {
        let geometry_column = self.geometry_column;
        self.columns
            .iter()
            .enumerate()
            .filter(move |(i, _)| *i != geometry_column)
            .map(|(_, column)| column)
    }

    pub fn property_columns(&self) -> Vec<&str> {
        self.properties().map(|c| c.name.as_str()).collect()
    }

    pub fn metadata(&self) -> TileMetadata {
        TileMetadata {
            id_property: self.index_column().to_string(),
            properties: self
                .properties()
                .map(|c| (c.name.clone(), c.column_type.property_type()))
                .collect(),
        }
    }
}

/// Property description consumed by the map frontend:
/// `{ "idProperty": ..., "properties": { column: { "type": ... } } }`.
#[derive(Clone, Debug, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TileMetadata {
    pub id_property: String,
    #[serde(serialize_with = "serialize_properties")]
    pub properties: Vec<(String, &'static str)>,
}

#[derive(Serialize)]
struct PropertyType<'a> {
    #[serde(rename = "type")]
    kind: &'a str,
}

fn serialize_properties<S: Serializer>(
    properties: &[(String, &'static str)],
    serializer: S,
) -> std::result::Result<S::Ok, S::Error> {
    let mut map = serializer.serialize_map(Some(properties.len()))?;
    for (name, kind) in properties {
        map.serialize_entry(name, &PropertyType { kind })?;
    }
    map.end()
}

/// Everything a frontend needs to display a tile set.
#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct MvtInfo {
    pub metadata: TileMetadata,
    pub bounds: BoundingBox,
    pub zoom: ZoomLevel,
}

impl MvtInfo {
    pub fn new(metadata: TileMetadata, extent: Extent) -> Self {
        MvtInfo {
            metadata,
            bounds: extent.bounds,
            zoom: extent.zoom,
        }
    }
}

/// Locates a persisted tile set.
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct MvtSource {
    pub project_id: String,
    pub dataset_id: String,
    pub table_id: String,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn columns() -> Vec<Column> {
        vec![
            Column::new("geoid", ColumnType::Text),
            Column::new("geom", ColumnType::Geometry),
            Column::new("pop", ColumnType::Integer),
            Column::new("density", ColumnType::Double),
            Column::new("coastal", ColumnType::Boolean),
            Column::new("updated", ColumnType::Date),
        ]
    }

    #[test]
    fn test_missing_columns() {
        let err = Schema::validate(columns(), "the_geom", "geoid").unwrap_err();
        assert!(matches!(err, Error::Schema(_)));

        let err = Schema::validate(columns(), "geom", "cartodb_id").unwrap_err();
        assert!(err.to_string().contains("cartodb_id"));
    }

    #[test]
    fn test_duplicate_columns() {
        let mut cols = columns();
        cols.push(Column::new("pop", ColumnType::Double));
        assert!(matches!(
            Schema::validate(cols, "geom", "geoid"),
            Err(Error::Schema(_))
        ));
    }

    #[test]
    fn test_property_columns_skip_geometry() {
        let schema = Schema::validate(columns(), "geom", "geoid").unwrap();
        assert_eq!(
            vec!["geoid", "pop", "density", "coastal", "updated"],
            schema.property_columns()
        );
        assert_eq!("geom", schema.geometry_column());
        assert_eq!("geoid", schema.index_column());
    }

    #[test]
    fn test_metadata_json() {
        let schema = Schema::validate(columns(), "geom", "geoid").unwrap();
        let json = serde_json::to_value(schema.metadata()).unwrap();

        assert_eq!(
            serde_json::json!({
                "idProperty": "geoid",
                "properties": {
                    "geoid": {"type": "string"},
                    "pop": {"type": "number"},
                    "density": {"type": "number"},
                    "coastal": {"type": "boolean"},
                    "updated": {"type": "date"},
                }
            }),
            json
        );
    }

    #[test]
    fn test_mvt_info_json() {
        let schema = Schema::validate(columns(), "geom", "geoid").unwrap();
        let extent = Extent {
            bounds: BoundingBox::new(0.0, 0.0, 1.0, 1.0).unwrap(),
            zoom: 8,
        };
        let json = serde_json::to_value(MvtInfo::new(schema.metadata(), extent)).unwrap();

        assert_eq!(serde_json::json!([[0.0, 0.0], [1.0, 1.0]]), json["bounds"]);
        assert_eq!(serde_json::json!(8), json["zoom"]);
        assert_eq!(serde_json::json!("geoid"), json["metadata"]["idProperty"]);
    }
}
