//! An engine serving canned results from memory.
//!
//! Results are registered per query text. Useful for tests and for tiling
//! data that is already at hand.

use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::RwLock;

use async_trait::async_trait;
use geo::BoundingRect;
use wkt::ToWkt;

use crate::bounds::BoundingBox;
use crate::engine::QueryEngine;
use crate::error::{Error, Result};
use crate::feature::Row;
use crate::fingerprint::Query;
use crate::schema::{Column, Schema};

#[derive(Clone, Debug)]
struct MemoryResult {
    columns: Vec<Column>,
    rows: Vec<Row>,
}

#[derive(Debug, Default)]
pub struct MemoryEngine {
    results: RwLock<HashMap<Query, MemoryResult>>,
    executions: AtomicUsize,
}

impl MemoryEngine {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers the result of `query`. `rows` carry properties for every
    /// column except the geometry, in column order.
    pub fn with_result(self, query: impl Into<Query>, columns: Vec<Column>, rows: Vec<Row>) -> Self {
        self.insert(query, columns, rows);
        self
    }

    pub fn insert(&self, query: impl Into<Query>, columns: Vec<Column>, rows: Vec<Row>) {
        self.results
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .insert(query.into(), MemoryResult { columns, rows });
    }

    /// Number of queries executed so far.
    pub fn executions(&self) -> usize {
        self.executions.load(Ordering::SeqCst)
    }

    fn execute(&self, query: &Query) -> Result<MemoryResult> {
        self.executions.fetch_add(1, Ordering::SeqCst);
        self.results
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .get(query)
            .cloned()
            .ok_or_else(|| Error::Engine(format!("no result registered for query {:?}", query.as_str())))
    }

    /// Executes `query`, failing like a database would when it selects a
    /// column the result does not have.
    fn select(&self, query: &Query, column: &str) -> Result<MemoryResult> {
        let result = self.execute(query)?;
        if !result.columns.iter().any(|c| c.name == column) {
            return Err(Error::Engine(format!("column q.{} does not exist", column)));
        }
        Ok(result)
    }
}

#[async_trait]
impl QueryEngine for MemoryEngine {
    async fn geometry_text_length(&self, query: &Query, geometry_column: &str) -> Result<f64> {
        let result = self.select(query, geometry_column)?;
        let mut length = 0usize;
        for row in &result.rows {
            if let Some(Ok(geometry)) = row.geometry.as_ref().map(|g| g.decode()) {
                length += geometry.wkt_string().chars().count();
            }
        }
        Ok(length as f64)
    }

    async fn bounds(&self, query: &Query, geometry_column: &str) -> Result<Option<BoundingBox>> {
        let result = self.select(query, geometry_column)?;
        let boxes: Vec<BoundingBox> = result
            .rows
            .iter()
            .filter_map(|row| row.geometry.as_ref()?.decode().ok()?.bounding_rect())
            .map(BoundingBox::from_rect)
            .collect();
        Ok(BoundingBox::union_all(&boxes))
    }

    async fn schema(
        &self,
        query: &Query,
        geometry_column: &str,
        index_column: &str,
    ) -> Result<Schema> {
        let result = self.execute(query)?;
        if result.rows.is_empty() {
            return Err(Error::Schema("query returned no rows".into()));
        }
        Schema::validate(result.columns, geometry_column, index_column)
    }

    async fn rows(&self, query: &Query, schema: &Schema) -> Result<Vec<Row>> {
        let result = self.execute(query)?;
        let width = schema.property_columns().len();
        if let Some(row) = result.rows.iter().find(|row| row.properties.len() != width) {
            return Err(Error::Schema(format!(
                "row has {} properties, expected {}",
                row.properties.len(),
                width
            )));
        }
        Ok(result.rows)
    }
}
