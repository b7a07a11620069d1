//! The external query engine seam.

use async_trait::async_trait;
use log::info;
use serde::Serialize;

use crate::bounds::BoundingBox;
use crate::error::Result;
use crate::feature::Row;
use crate::fingerprint::Query;
use crate::schema::Schema;

pub mod memory;
pub mod postgis;

/// Bytes per character of WKT text, as observed when downloading results.
pub const WKT_SIZE_FACTOR: f64 = 0.425;

/// Executes queries against the data engine. Every method is one round trip.
#[async_trait]
pub trait QueryEngine: Send + Sync {
    /// Total length of the geometry column rendered as WKT.
    async fn geometry_text_length(&self, query: &Query, geometry_column: &str) -> Result<f64>;

    /// Union of all geometry bounds, or `None` for an empty result. Not
    /// validated; see [`crate::bounds::estimate_bounds`].
    async fn bounds(&self, query: &Query, geometry_column: &str) -> Result<Option<BoundingBox>>;

    /// Column layout of the result, validated for the required columns.
    async fn schema(
        &self,
        query: &Query,
        geometry_column: &str,
        index_column: &str,
    ) -> Result<Schema>;

    /// All rows of the result, with properties aligned to
    /// [`Schema::property_columns`].
    async fn rows(&self, query: &Query, schema: &Schema) -> Result<Vec<Row>>;
}

#[derive(Clone, Copy, Debug, PartialEq, Serialize)]
pub struct SizeEstimate {
    pub bytes: f64,
}

impl SizeEstimate {
    pub fn from_text_length(length: f64) -> Self {
        SizeEstimate {
            bytes: length * WKT_SIZE_FACTOR,
        }
    }

    /// Whether a result this size is cheaper to download than to tile.
    pub fn is_small(&self, limit: f64) -> bool {
        self.bytes < limit
    }
}

/// Estimates the download size of `query`'s geometries.
pub async fn estimate_size<E: QueryEngine + ?Sized>(
    engine: &E,
    query: &Query,
    geometry_column: &str,
    limit: f64,
) -> Result<SizeEstimate> {
    info!("Estimating size. This may take a few seconds");
    let estimate = SizeEstimate::from_text_length(engine.geometry_text_length(query, geometry_column).await?);
    if estimate.is_small(limit) {
        info!("small dataset ({:.2} KB)", estimate.bytes / 1024.0);
    } else {
        info!("big dataset ({:.2} MB)", estimate.bytes / 1024.0 / 1024.0);
    }
    Ok(estimate)
}
