//! # Query Tiler
//!
//! Turns the result of an arbitrary spatial SQL query into a cached set of
//! Mapbox Vector Tiles.
//!
//! ## Current status
//!
//! The tiling pipeline is complete and deterministic, but trait and method
//! signatures may still change. We are releasing this code as 0.x until the
//! interface has stabilized.
//!
//! ## Current features
//!
//! Given a [`engine::QueryEngine`] (PostGIS out of the box) and a
//! [`store::TileStore`], a [`pipeline::TileGenerator`] will:
//!
//! * fingerprint the query text and skip all work when its tiles are stored,
//! * estimate the result's bounds and pick a zoom level from its width,
//! * assign every feature to the tiles of an equirectangular quad grid,
//! * encode one single-layer vector tile per non-empty tile, and
//! * persist the whole set atomically under the fingerprint.
//!
//! Stored tiles are served back through the [`TileSource`] trait.
//!
//! ## Known Limitations
//!
//! Tiles use a plain longitude/latitude grid rather than web mercator, and
//! every tile set is generated at a single zoom level. Geometries are not
//! clipped to tile bounds; renderers are expected to handle the overscan.

#![deny(warnings)]

use async_trait::async_trait;

/// This is the main trait for reading tiles back. It is presently rather
/// barebones, but is open for future expansion.
#[async_trait]
pub trait TileSource {
    /// Returns the encoded tile at `zoom/x/y`, or `None` when the tile set
    /// holds no features there.
    async fn render_mvt(&self, zoom: u8, x: u32, y: u32) -> error::Result<Option<Vec<u8>>>;
}

pub mod bounds;
pub mod config;
pub mod engine;
pub mod error;
pub mod feature;
pub mod fingerprint;
pub mod grid;
pub mod mvt;
pub mod pipeline;
pub mod schema;
pub mod store;
pub mod vector_tile;

pub use config::TilerConfig;
pub use error::{Error, PipelineError, Result};
pub use fingerprint::{Fingerprint, Query};
pub use pipeline::{Generation, TileGenerator};
