//! Query engine backed by a PostGIS database.
//!
//! User queries are wrapped in a common table expression so that every
//! aggregate runs inside the database and only the final rows cross the wire.

use async_trait::async_trait;
use futures::TryStreamExt;
use log::debug;
use sqlx::postgres::PgRow;
use sqlx::{Column as _, PgPool, Row as _, TypeInfo as _};

use crate::bounds::BoundingBox;
use crate::engine::QueryEngine;
use crate::error::{Error, Result};
use crate::feature::{GeometryValue, PropertyValue, Row};
use crate::fingerprint::Query;
use crate::schema::{Column, ColumnType, Schema};

pub struct PostgisEngine {
    pool: PgPool,
}

impl PostgisEngine {
    pub fn new(pool: PgPool) -> Self {
        PostgisEngine { pool }
    }

    pub async fn connect(url: &str) -> Result<Self> {
        Ok(PostgisEngine::new(PgPool::connect(url).await?))
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }
}

/// Quotes an identifier for interpolation into SQL.
pub fn quote_ident(name: &str) -> String {
    format!("\"{}\"", name.replace('"', "\"\""))
}

/// Maps a Postgres type name onto the column types the tiler understands.
pub fn column_type_for(type_name: &str) -> ColumnType {
    match type_name.to_ascii_uppercase().as_str() {
        "INT2" | "INT4" | "INT8" | "SMALLINT" | "INTEGER" | "BIGINT" => ColumnType::Integer,
        "FLOAT4" | "FLOAT8" | "REAL" | "DOUBLE PRECISION" | "NUMERIC" => ColumnType::Double,
        "BOOL" | "BOOLEAN" => ColumnType::Boolean,
        "TEXT" | "VARCHAR" | "BPCHAR" | "CHAR" | "NAME" => ColumnType::Text,
        "DATE" | "TIMESTAMP" | "TIMESTAMPTZ" => ColumnType::Date,
        "GEOMETRY" | "GEOGRAPHY" => ColumnType::Geometry,
        _ => ColumnType::Other,
    }
}

pub mod sql {
    use super::quote_ident;
    use crate::fingerprint::Query;
    use crate::schema::{ColumnType, Schema};

    /// Alias of the decoded geometry in [`rows`].
    pub const GEOMETRY_ALIAS: &str = "__geometry";

    fn with_query(query: &Query) -> String {
        let body = query.as_str().trim().trim_end_matches(';');
        format!("WITH q AS ({})", body)
    }

    pub fn text_length(query: &Query, geometry_column: &str) -> String {
        format!(
            "{} SELECT COALESCE(SUM(CHAR_LENGTH(ST_AsText(q.{}))), 0)::float8 FROM q",
            with_query(query),
            quote_ident(geometry_column)
        )
    }

    pub fn bounds(query: &Query, geometry_column: &str) -> String {
        format!(
            "{} SELECT ST_XMin(e)::float8, ST_YMin(e)::float8, ST_XMax(e)::float8, ST_YMax(e)::float8 \
             FROM (SELECT ST_Extent(q.{}) AS e FROM q) AS extent",
            with_query(query),
            quote_ident(geometry_column)
        )
    }

    pub fn sample(query: &Query) -> String {
        format!("{} SELECT * FROM q LIMIT 1", with_query(query))
    }

    /// Geometry as WKB first, then every property column cast to a type the
    /// decoder reads directly.
    pub fn rows(query: &Query, schema: &Schema) -> String {
        let mut columns = vec![format!(
            "ST_AsBinary(q.{}) AS {}",
            quote_ident(schema.geometry_column()),
            quote_ident(GEOMETRY_ALIAS)
        )];
        columns.extend(schema.properties().map(|column| {
            let cast = match column.column_type {
                ColumnType::Integer => "::int8",
                ColumnType::Double => "::float8",
                ColumnType::Boolean => "",
                _ => "::text",
            };
            format!("q.{}{}", quote_ident(&column.name), cast)
        }));
        format!("{} SELECT {} FROM q", with_query(query), columns.join(", "))
    }
}

fn decode_row(schema: &Schema, row: &PgRow) -> Result<Row> {
    let geometry = row
        .try_get::<Option<Vec<u8>>, _>(0)?
        .map(GeometryValue::Wkb);

    let mut properties = Vec::new();
    for (i, column) in schema.properties().enumerate() {
        let index = i + 1;
        let value = match column.column_type {
            ColumnType::Integer => row.try_get::<Option<i64>, _>(index)?.map(PropertyValue::Int),
            ColumnType::Double => row.try_get::<Option<f64>, _>(index)?.map(PropertyValue::Double),
            ColumnType::Boolean => row.try_get::<Option<bool>, _>(index)?.map(PropertyValue::Bool),
            _ => row.try_get::<Option<String>, _>(index)?.map(PropertyValue::Text),
        };
        properties.push(value);
    }

    Ok(Row {
        geometry,
        properties,
    })
}

#[async_trait]
impl QueryEngine for PostgisEngine {
    async fn geometry_text_length(&self, query: &Query, geometry_column: &str) -> Result<f64> {
        let sql = sql::text_length(query, geometry_column);
        debug!("{}", sql);
        let row = sqlx::query(&sql).fetch_one(&self.pool).await?;
        Ok(row.try_get(0)?)
    }

    async fn bounds(&self, query: &Query, geometry_column: &str) -> Result<Option<BoundingBox>> {
        let sql = sql::bounds(query, geometry_column);
        debug!("{}", sql);
        let row = sqlx::query(&sql).fetch_one(&self.pool).await?;

        // ST_Extent over no rows yields NULL, and so does every accessor.
        let xmin: Option<f64> = row.try_get(0)?;
        let ymin: Option<f64> = row.try_get(1)?;
        let xmax: Option<f64> = row.try_get(2)?;
        let ymax: Option<f64> = row.try_get(3)?;
        match (xmin, ymin, xmax, ymax) {
            (Some(xmin), Some(ymin), Some(xmax), Some(ymax)) => Ok(Some(BoundingBox {
                xmin,
                ymin,
                xmax,
                ymax,
            })),
            _ => Ok(None),
        }
    }

    async fn schema(
        &self,
        query: &Query,
        geometry_column: &str,
        index_column: &str,
    ) -> Result<Schema> {
        let sql = sql::sample(query);
        debug!("{}", sql);
        let row = sqlx::query(&sql)
            .fetch_optional(&self.pool)
            .await?
            .ok_or_else(|| Error::Schema("query returned no rows".into()))?;

        let columns = row
            .columns()
            .iter()
            .map(|c| Column::new(c.name(), column_type_for(c.type_info().name())))
            .collect();
        Schema::validate(columns, geometry_column, index_column)
    }

    async fn rows(&self, query: &Query, schema: &Schema) -> Result<Vec<Row>> {
        let sql = sql::rows(query, schema);
        debug!("{}", sql);

        let mut rows = Vec::new();
        let mut stream = sqlx::query(&sql).fetch(&self.pool);
        while let Some(row) = stream.try_next().await? {
            rows.push(decode_row(schema, &row)?);
        }

        Ok(rows)
    }
}
