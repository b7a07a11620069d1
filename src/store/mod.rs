//! Persistence of generated tile sets, keyed by query fingerprint.

use std::collections::BTreeMap;

use async_trait::async_trait;

use crate::bounds::Extent;
use crate::error::Result;
use crate::fingerprint::Fingerprint;
use crate::grid::TileCoordinate;
use crate::TileSource;

pub mod memory;
pub mod postgres;

/// Every encoded tile of one query, plus the extent they were cut from.
/// Tiles without features are not stored.
#[derive(Clone, Debug, PartialEq)]
pub struct TileSet {
    pub fingerprint: Fingerprint,
    pub extent: Extent,
    pub tiles: BTreeMap<TileCoordinate, Vec<u8>>,
}

impl TileSet {
    pub fn tile_count(&self) -> usize {
        self.tiles.len()
    }

    /// Encoded size of all tiles in bytes.
    pub fn size(&self) -> usize {
        self.tiles.values().map(Vec::len).sum()
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum CreateOutcome {
    Created,
    /// Another writer persisted the same fingerprint first. The stored set
    /// was left untouched.
    AlreadyExists,
}

/// A durable table of tile sets.
///
/// Writes are all or nothing: readers either see every tile of a set or
/// none of them.
#[async_trait]
pub trait TileStore: Send + Sync {
    async fn exists(&self, fingerprint: &Fingerprint) -> Result<bool>;

    async fn create(&self, tileset: &TileSet) -> Result<CreateOutcome>;

    /// Writes `tileset`, discarding any set stored under its fingerprint.
    async fn replace(&self, tileset: &TileSet) -> Result<()>;

    async fn tile(&self, fingerprint: &Fingerprint, coord: &TileCoordinate) -> Result<Option<Vec<u8>>>;

    async fn tileset(&self, fingerprint: &Fingerprint) -> Result<Option<TileSet>>;
}

/// Serves the tiles of one stored tile set.
pub struct CachedTiles<'a, S: ?Sized> {
    store: &'a S,
    fingerprint: Fingerprint,
}

impl<'a, S: TileStore + ?Sized> CachedTiles<'a, S> {
    pub fn new(store: &'a S, fingerprint: Fingerprint) -> Self {
        CachedTiles { store, fingerprint }
    }

    pub fn fingerprint(&self) -> &Fingerprint {
        &self.fingerprint
    }
}

#[async_trait]
impl<'a, S: TileStore + ?Sized> TileSource for CachedTiles<'a, S> {
    async fn render_mvt(&self, zoom: u8, x: u32, y: u32) -> Result<Option<Vec<u8>>> {
        let coord = TileCoordinate::new(zoom, x, y);
        if !coord.is_valid() {
            return Ok(None);
        }
        self.store.tile(&self.fingerprint, &coord).await
    }
}
