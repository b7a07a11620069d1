//! Tile sets stored in a Postgres schema named after the tile dataset.
//!
//! Two tables are used: `tilesets` holds one row per fingerprint with its
//! extent, and `tiles` holds the encoded payloads. A set and its tiles are
//! always written in one transaction.

use std::collections::BTreeMap;

use async_trait::async_trait;
use log::{debug, info};
use sqlx::{PgPool, Postgres, Row as _, Transaction};

use crate::bounds::{BoundingBox, Extent};
use crate::engine::postgis::quote_ident;
use crate::error::{Error, Result};
use crate::fingerprint::Fingerprint;
use crate::grid::TileCoordinate;
use crate::store::{CreateOutcome, TileSet, TileStore};

pub struct PgTileStore {
    pool: PgPool,
    dataset: String,
}

pub mod sql {
    use crate::engine::postgis::quote_ident;

    fn table(dataset: &str, name: &str) -> String {
        format!("{}.{}", quote_ident(dataset), quote_ident(name))
    }

    pub fn create_tables(dataset: &str) -> Vec<String> {
        let tilesets = table(dataset, "tilesets");
        vec![
            format!("CREATE SCHEMA IF NOT EXISTS {}", quote_ident(dataset)),
            format!(
                "CREATE TABLE IF NOT EXISTS {} (\
                 fingerprint TEXT PRIMARY KEY, \
                 zoom INT2 NOT NULL, \
                 xmin FLOAT8 NOT NULL, ymin FLOAT8 NOT NULL, \
                 xmax FLOAT8 NOT NULL, ymax FLOAT8 NOT NULL, \
                 created_at TIMESTAMPTZ NOT NULL DEFAULT now())",
                tilesets
            ),
            format!(
                "CREATE TABLE IF NOT EXISTS {} (\
                 fingerprint TEXT NOT NULL REFERENCES {} (fingerprint) ON DELETE CASCADE, \
                 z INT2 NOT NULL, x INT4 NOT NULL, y INT4 NOT NULL, \
                 data BYTEA NOT NULL, \
                 PRIMARY KEY (fingerprint, z, x, y))",
                table(dataset, "tiles"),
                tilesets
            ),
        ]
    }

    pub fn exists(dataset: &str) -> String {
        format!(
            "SELECT EXISTS (SELECT 1 FROM {} WHERE fingerprint = $1)",
            table(dataset, "tilesets")
        )
    }

    pub fn insert_tileset(dataset: &str) -> String {
        format!(
            "INSERT INTO {} (fingerprint, zoom, xmin, ymin, xmax, ymax) \
             VALUES ($1, $2, $3, $4, $5, $6) ON CONFLICT (fingerprint) DO NOTHING",
            table(dataset, "tilesets")
        )
    }

    pub fn delete_tileset(dataset: &str) -> String {
        format!(
            "DELETE FROM {} WHERE fingerprint = $1",
            table(dataset, "tilesets")
        )
    }

    pub fn insert_tiles(dataset: &str) -> String {
        format!(
            "INSERT INTO {} (fingerprint, z, x, y, data) \
             SELECT $1, * FROM UNNEST($2::int2[], $3::int4[], $4::int4[], $5::bytea[])",
            table(dataset, "tiles")
        )
    }

    pub fn select_tileset(dataset: &str) -> String {
        format!(
            "SELECT zoom, xmin, ymin, xmax, ymax FROM {} WHERE fingerprint = $1",
            table(dataset, "tilesets")
        )
    }

    pub fn select_tile(dataset: &str) -> String {
        format!(
            "SELECT data FROM {} WHERE fingerprint = $1 AND z = $2 AND x = $3 AND y = $4",
            table(dataset, "tiles")
        )
    }

    pub fn select_tiles(dataset: &str) -> String {
        format!(
            "SELECT z, x, y, data FROM {} WHERE fingerprint = $1",
            table(dataset, "tiles")
        )
    }
}

fn corrupt(what: &str) -> Error {
    Error::Engine(format!("stored tile set has an invalid {}", what))
}

impl PgTileStore {
    pub fn new(pool: PgPool, dataset: impl Into<String>) -> Self {
        PgTileStore {
            pool,
            dataset: dataset.into(),
        }
    }

    /// Creates the dataset schema and its tables if they are missing.
    pub async fn ensure_tables(&self) -> Result<()> {
        for statement in sql::create_tables(&self.dataset) {
            debug!("{}", statement);
            sqlx::query(&statement).execute(&self.pool).await?;
        }
        info!("tile dataset {} ready", quote_ident(&self.dataset));
        Ok(())
    }

    async fn insert(&self, tx: &mut Transaction<'_, Postgres>, tileset: &TileSet) -> Result<bool> {
        let bounds = &tileset.extent.bounds;
        let inserted = sqlx::query(&sql::insert_tileset(&self.dataset))
            .bind(tileset.fingerprint.as_str())
            .bind(i16::from(tileset.extent.zoom))
            .bind(bounds.xmin)
            .bind(bounds.ymin)
            .bind(bounds.xmax)
            .bind(bounds.ymax)
            .execute(&mut **tx)
            .await?
            .rows_affected();
        if inserted == 0 {
            return Ok(false);
        }

        let mut zs: Vec<i16> = Vec::with_capacity(tileset.tiles.len());
        let mut xs: Vec<i32> = Vec::with_capacity(tileset.tiles.len());
        let mut ys: Vec<i32> = Vec::with_capacity(tileset.tiles.len());
        let mut data: Vec<Vec<u8>> = Vec::with_capacity(tileset.tiles.len());
        for (coord, tile) in &tileset.tiles {
            zs.push(i16::from(coord.z));
            xs.push(i32::try_from(coord.x).map_err(|_| corrupt("tile column"))?);
            ys.push(i32::try_from(coord.y).map_err(|_| corrupt("tile row"))?);
            data.push(tile.clone());
        }

        sqlx::query(&sql::insert_tiles(&self.dataset))
            .bind(tileset.fingerprint.as_str())
            .bind(zs)
            .bind(xs)
            .bind(ys)
            .bind(data)
            .execute(&mut **tx)
            .await?;

        Ok(true)
    }
}

#[async_trait]
impl TileStore for PgTileStore {
    async fn exists(&self, fingerprint: &Fingerprint) -> Result<bool> {
        let row = sqlx::query(&sql::exists(&self.dataset))
            .bind(fingerprint.as_str())
            .fetch_one(&self.pool)
            .await?;
        Ok(row.try_get(0)?)
    }

    async fn create(&self, tileset: &TileSet) -> Result<CreateOutcome> {
        let mut tx = self.pool.begin().await?;
        if self.insert(&mut tx, tileset).await? {
            tx.commit().await?;
            Ok(CreateOutcome::Created)
        } else {
            tx.rollback().await?;
            Ok(CreateOutcome::AlreadyExists)
        }
    }

    async fn replace(&self, tileset: &TileSet) -> Result<()> {
        let mut tx = self.pool.begin().await?;
        sqlx::query(&sql::delete_tileset(&self.dataset))
            .bind(tileset.fingerprint.as_str())
            .execute(&mut *tx)
            .await?;
        self.insert(&mut tx, tileset).await?;
        tx.commit().await?;
        Ok(())
    }

    async fn tile(&self, fingerprint: &Fingerprint, coord: &TileCoordinate) -> Result<Option<Vec<u8>>> {
        let (Ok(x), Ok(y)) = (i32::try_from(coord.x), i32::try_from(coord.y)) else {
            return Ok(None);
        };
        let row = sqlx::query(&sql::select_tile(&self.dataset))
            .bind(fingerprint.as_str())
            .bind(i16::from(coord.z))
            .bind(x)
            .bind(y)
            .fetch_optional(&self.pool)
            .await?;
        match row {
            Some(row) => Ok(Some(row.try_get(0)?)),
            None => Ok(None),
        }
    }

    async fn tileset(&self, fingerprint: &Fingerprint) -> Result<Option<TileSet>> {
        let Some(row) = sqlx::query(&sql::select_tileset(&self.dataset))
            .bind(fingerprint.as_str())
            .fetch_optional(&self.pool)
            .await?
        else {
            return Ok(None);
        };

        let zoom: i16 = row.try_get(0)?;
        let extent = Extent {
            bounds: BoundingBox::new(row.try_get(1)?, row.try_get(2)?, row.try_get(3)?, row.try_get(4)?)?,
            zoom: u8::try_from(zoom).map_err(|_| corrupt("zoom"))?,
        };

        let mut tiles = BTreeMap::new();
        for row in sqlx::query(&sql::select_tiles(&self.dataset))
            .bind(fingerprint.as_str())
            .fetch_all(&self.pool)
            .await?
        {
            let z: i16 = row.try_get(0)?;
            let x: i32 = row.try_get(1)?;
            let y: i32 = row.try_get(2)?;
            let data: Vec<u8> = row.try_get(3)?;
            let coord = TileCoordinate::new(
                u8::try_from(z).map_err(|_| corrupt("zoom"))?,
                u32::try_from(x).map_err(|_| corrupt("tile column"))?,
                u32::try_from(y).map_err(|_| corrupt("tile row"))?,
            );
            tiles.insert(coord, data);
        }

        Ok(Some(TileSet {
            fingerprint: fingerprint.clone(),
            extent,
            tiles,
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_generate_table_sql() {
        let statements = sql::create_tables("mvt_pool");
        assert_eq!(3, statements.len());
        assert_eq!("CREATE SCHEMA IF NOT EXISTS \"mvt_pool\"", statements[0]);
        assert!(statements[1].contains("\"mvt_pool\".\"tilesets\""));
        assert!(statements[2].contains("REFERENCES \"mvt_pool\".\"tilesets\" (fingerprint) ON DELETE CASCADE"));
    }

    #[test]
    fn test_generate_write_sql() {
        let sql = sql::insert_tileset("mvt_pool");
        assert!(sql.starts_with("INSERT INTO \"mvt_pool\".\"tilesets\""));
        assert!(sql.ends_with("ON CONFLICT (fingerprint) DO NOTHING"));

        let sql = sql::insert_tiles("mvt_pool");
        assert!(sql.contains("UNNEST($2::int2[], $3::int4[], $4::int4[], $5::bytea[])"));
    }
}
