use std::collections::HashMap;
use std::sync::RwLock;

use async_trait::async_trait;

use crate::error::Result;
use crate::fingerprint::Fingerprint;
use crate::grid::TileCoordinate;
use crate::store::{CreateOutcome, TileSet, TileStore};

/// Process-local tile store. Each set is inserted under a single lock, so
/// partial sets are never visible.
#[derive(Debug, Default)]
pub struct MemoryTileStore {
    tilesets: RwLock<HashMap<Fingerprint, TileSet>>,
}

impl MemoryTileStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.tilesets.read().unwrap_or_else(|e| e.into_inner()).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[async_trait]
impl TileStore for MemoryTileStore {
    async fn exists(&self, fingerprint: &Fingerprint) -> Result<bool> {
        Ok(self
            .tilesets
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .contains_key(fingerprint))
    }

    async fn create(&self, tileset: &TileSet) -> Result<CreateOutcome> {
        let mut tilesets = self.tilesets.write().unwrap_or_else(|e| e.into_inner());
        if tilesets.contains_key(&tileset.fingerprint) {
            return Ok(CreateOutcome::AlreadyExists);
        }
        tilesets.insert(tileset.fingerprint.clone(), tileset.clone());
        Ok(CreateOutcome::Created)
    }

    async fn replace(&self, tileset: &TileSet) -> Result<()> {
        self.tilesets
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .insert(tileset.fingerprint.clone(), tileset.clone());
        Ok(())
    }

    async fn tile(&self, fingerprint: &Fingerprint, coord: &TileCoordinate) -> Result<Option<Vec<u8>>> {
        Ok(self
            .tilesets
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .get(fingerprint)
            .and_then(|set| set.tiles.get(coord).cloned()))
    }

    async fn tileset(&self, fingerprint: &Fingerprint) -> Result<Option<TileSet>> {
        Ok(self
            .tilesets
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .get(fingerprint)
            .cloned())
    }
}
