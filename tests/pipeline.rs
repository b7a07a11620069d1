use std::collections::BTreeSet;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use async_trait::async_trait;

use query_tiler::bounds::BoundingBox;
use query_tiler::engine::memory::MemoryEngine;
use query_tiler::error::{Error, Stage};
use query_tiler::feature::{GeometryValue, PropertyValue, Row};
use query_tiler::fingerprint::Fingerprint;
use query_tiler::grid::TileCoordinate;
use query_tiler::mvt::decode_tile;
use query_tiler::pipeline::{PipelineState, SourcePlan, TileGenerator};
use query_tiler::schema::{Column, ColumnType};
use query_tiler::store::memory::MemoryTileStore;
use query_tiler::store::{CreateOutcome, TileSet, TileStore};
use query_tiler::{Query, TileSource, TilerConfig};

const UNIT_SQUARE: &str = "SELECT geoid, geom, name FROM unit_square";
const SINGLE_POINT: &str = "SELECT geoid, geom, name FROM one_point";
const NOTHING: &str = "SELECT geoid, geom, name FROM unit_square WHERE false";
const SLIVER: &str = "SELECT geoid, geom, name FROM meridian";

fn columns() -> Vec<Column> {
    vec![
        Column::new("geoid", ColumnType::Integer),
        Column::new("geom", ColumnType::Geometry),
        Column::new("name", ColumnType::Text),
    ]
}

fn row(id: i64, wkt: &str, name: &str) -> Row {
    Row {
        geometry: Some(GeometryValue::Wkt(wkt.to_string())),
        properties: vec![Some(PropertyValue::Int(id)), Some(PropertyValue::Text(name.to_string()))],
    }
}

fn engine() -> MemoryEngine {
    MemoryEngine::new()
        .with_result(
            UNIT_SQUARE,
            columns(),
            vec![
                row(1, "POLYGON((0 0, 1 0, 1 1, 0 1, 0 0))", "square"),
                row(2, "POINT(0.25 0.75)", "corner"),
                row(3, "LINESTRING(0 0, 1 1)", "diagonal"),
                Row {
                    geometry: None,
                    properties: vec![Some(PropertyValue::Int(4)), None],
                },
            ],
        )
        .with_result(
            SINGLE_POINT,
            columns(),
            vec![row(1, "POINT(10 10)", "lonely")],
        )
        .with_result(NOTHING, columns(), vec![])
        .with_result(
            SLIVER,
            columns(),
            vec![row(1, "LINESTRING(0 -80, 0.0001 80)", "meridian")],
        )
}

fn generator<S: TileStore>(store: S) -> TileGenerator<MemoryEngine, S> {
    TileGenerator::new(TilerConfig::new("analytics"), engine(), store).unwrap()
}

fn feature_ids(tileset: &TileSet) -> BTreeSet<u64> {
    tileset
        .tiles
        .values()
        .flat_map(|data| {
            let tile = decode_tile(data).unwrap();
            assert_eq!(1, tile.layers.len());
            assert_eq!("default", tile.layers[0].name);
            tile.layers[0]
                .features
                .iter()
                .filter_map(|f| f.id)
                .collect::<Vec<_>>()
        })
        .collect()
}

#[tokio::test]
async fn test_unit_square_end_to_end() {
    let generator = generator(MemoryTileStore::new());
    let query = Query::new(UNIT_SQUARE);

    let generation = generator.ensure_generated(&query).await.unwrap();
    assert!(generation.generated);
    assert_eq!(
        vec![
            PipelineState::Idle,
            PipelineState::Estimating,
            PipelineState::Partitioning,
            PipelineState::Encoding,
            PipelineState::Persisting,
            PipelineState::Done,
        ],
        generation.history
    );

    let report = generation.report.unwrap();
    assert_eq!(8, report.zoom);
    assert_eq!(BoundingBox::new(0.0, 0.0, 1.0, 1.0).unwrap(), report.bounds);
    assert_eq!(3, report.feature_count);
    assert_eq!(vec![3], report.skipped_features);
    assert!(report.tile_count >= 1);

    let stored = generator
        .store()
        .tileset(&query.fingerprint())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(report.tile_count, stored.tile_count());
    assert!(stored.tiles.keys().all(|t| t.z == 8 && t.is_valid()));
    assert_eq!(BTreeSet::from([1, 2, 3]), feature_ids(&stored));

    // The square's interior lies in column 128, row 126.
    let tile = generator.tiles(&query).render_mvt(8, 128, 126).await.unwrap();
    assert!(tile.is_some());
}

#[tokio::test]
async fn test_cache_idempotence() {
    let generator = generator(MemoryTileStore::new());
    let query = Query::new(UNIT_SQUARE);

    let first = generator.ensure_generated(&query).await.unwrap();
    let stored = generator.store().tileset(&first.fingerprint).await.unwrap();
    let executions = generator.engine().executions();

    let second = generator.ensure_generated(&query).await.unwrap();
    assert!(first.generated);
    assert!(!second.generated);
    assert!(second.report.is_none());
    assert_eq!(first.fingerprint, second.fingerprint);
    assert_eq!(vec![PipelineState::Idle], second.history);

    // A hit never reaches the engine.
    assert_eq!(executions, generator.engine().executions());
    assert_eq!(stored, generator.store().tileset(&first.fingerprint).await.unwrap());
    assert_eq!(1, generator.store().len());
}

#[tokio::test]
async fn test_generation_is_deterministic() {
    let a = generator(MemoryTileStore::new());
    let b = generator(MemoryTileStore::new());
    let query = Query::new(UNIT_SQUARE);

    let (first, _) = a.build_tileset(&query).await.unwrap();
    let (second, _) = b.build_tileset(&query).await.unwrap();
    assert_eq!(first, second);
    assert!(a.store().is_empty());
}

#[tokio::test]
async fn test_single_point_is_invalid_extent() {
    let generator = generator(MemoryTileStore::new());
    let query = Query::new(SINGLE_POINT);

    let err = generator.ensure_generated(&query).await.unwrap_err();
    assert_eq!(Stage::Estimating, err.stage);
    assert_eq!(query.fingerprint(), err.fingerprint);
    assert!(matches!(err.source, Error::InvalidExtent(_)));
    assert!(!err.is_retryable());
    assert!(generator.store().is_empty());
}

#[tokio::test]
async fn test_missing_index_column_is_schema_error() {
    let mut config = TilerConfig::new("analytics");
    config.index_column = "cartodb_id".to_string();
    let generator = TileGenerator::new(config, engine(), MemoryTileStore::new()).unwrap();

    let err = generator
        .ensure_generated(&Query::new(UNIT_SQUARE))
        .await
        .unwrap_err();
    assert_eq!(Stage::Estimating, err.stage);
    assert!(matches!(err.source, Error::Schema(_)));
    assert!(generator.store().is_empty());
}

#[tokio::test]
async fn test_misnamed_geometry_column_is_schema_error() {
    let mut config = TilerConfig::new("analytics");
    config.geometry_column = "the_geom".to_string();
    let generator = TileGenerator::new(config, engine(), MemoryTileStore::new()).unwrap();
    let query = Query::new(UNIT_SQUARE);

    let err = generator.ensure_generated(&query).await.unwrap_err();
    assert_eq!(Stage::Estimating, err.stage);
    assert!(matches!(err.source, Error::Schema(_)), "{:?}", err.source);
    // Only the schema lookup ran.
    assert_eq!(1, generator.engine().executions());
    assert!(generator.store().is_empty());

    assert!(matches!(generator.plan(&query).await, Err(Error::Schema(_))));
    assert!(matches!(generator.fetch_bounds(&query).await, Err(Error::Schema(_))));
    assert!(matches!(generator.fetch_mvt_info(&query).await, Err(Error::Schema(_))));
}

#[tokio::test]
async fn test_empty_result_is_schema_error() {
    let generator = generator(MemoryTileStore::new());
    let query = Query::new(NOTHING);

    let err = generator.ensure_generated(&query).await.unwrap_err();
    assert_eq!(Stage::Estimating, err.stage);
    assert!(matches!(err.source, Error::Schema(_)), "{:?}", err.source);
    assert!(generator.store().is_empty());
}

#[tokio::test]
async fn test_tall_sliver_exceeds_tile_limit() {
    let generator = generator(MemoryTileStore::new());
    let query = Query::new(SLIVER);

    let err = generator.ensure_generated(&query).await.unwrap_err();
    assert_eq!(Stage::Partitioning, err.stage);
    assert!(matches!(err.source, Error::InvalidExtent(_)), "{:?}", err.source);
    // Rows are never fetched.
    assert_eq!(3, generator.engine().executions());
    assert!(generator.store().is_empty());
}

#[tokio::test]
async fn test_regenerate_replaces() {
    let generator = generator(MemoryTileStore::new());
    let query = Query::new(UNIT_SQUARE);

    let first = generator.ensure_generated(&query).await.unwrap();
    let again = generator.regenerate(&query).await.unwrap();
    assert!(again.generated);
    assert_eq!(first.fingerprint, again.fingerprint);
    assert_eq!(first.report, again.report);
    assert_eq!(1, generator.store().len());
}

#[tokio::test]
async fn test_metadata_and_plan() {
    let generator = generator(MemoryTileStore::new());
    let query = Query::new(UNIT_SQUARE);

    let info = generator.fetch_mvt_info(&query).await.unwrap();
    assert_eq!(8, info.zoom);
    assert_eq!("geoid", info.metadata.id_property);

    let source = generator.mvt_source(&query);
    assert_eq!("analytics", source.project_id);
    assert_eq!("mvt_pool", source.dataset_id);
    assert_eq!(query.fingerprint().to_string(), source.table_id);

    let plan = generator.plan(&query).await.unwrap();
    assert!(matches!(plan, SourcePlan::Inline(_)));
    assert!(plan.estimate().bytes > 0.0);

    let features = generator.download(&query).await.unwrap();
    assert_eq!(3, features.len());
}

/// A store whose existence check always fails.
struct UnreachableStore;

#[async_trait]
impl TileStore for UnreachableStore {
    async fn exists(&self, _: &Fingerprint) -> query_tiler::Result<bool> {
        Err(Error::Engine("connection refused".into()))
    }

    async fn create(&self, _: &TileSet) -> query_tiler::Result<CreateOutcome> {
        panic!("create must not be reached");
    }

    async fn replace(&self, _: &TileSet) -> query_tiler::Result<()> {
        panic!("replace must not be reached");
    }

    async fn tile(&self, _: &Fingerprint, _: &TileCoordinate) -> query_tiler::Result<Option<Vec<u8>>> {
        Ok(None)
    }

    async fn tileset(&self, _: &Fingerprint) -> query_tiler::Result<Option<TileSet>> {
        Ok(None)
    }
}

#[tokio::test]
async fn test_cache_unavailable() {
    let generator = generator(UnreachableStore);

    let err = generator
        .ensure_generated(&Query::new(UNIT_SQUARE))
        .await
        .unwrap_err();
    assert_eq!(Stage::CacheCheck, err.stage);
    assert!(matches!(err.source, Error::CacheUnavailable(_)));
    assert!(err.is_retryable());
    assert_eq!(0, generator.engine().executions());
}

/// Fails the first `failures` writes, then delegates to a memory store.
struct FlakyStore {
    inner: MemoryTileStore,
    failures: usize,
    attempts: AtomicUsize,
}

impl FlakyStore {
    fn new(failures: usize) -> Self {
        FlakyStore {
            inner: MemoryTileStore::new(),
            failures,
            attempts: AtomicUsize::new(0),
        }
    }
}

#[async_trait]
impl TileStore for FlakyStore {
    async fn exists(&self, fingerprint: &Fingerprint) -> query_tiler::Result<bool> {
        self.inner.exists(fingerprint).await
    }

    async fn create(&self, tileset: &TileSet) -> query_tiler::Result<CreateOutcome> {
        if self.attempts.fetch_add(1, Ordering::SeqCst) < self.failures {
            return Err(Error::Engine("write timed out".into()));
        }
        self.inner.create(tileset).await
    }

    async fn replace(&self, tileset: &TileSet) -> query_tiler::Result<()> {
        self.inner.replace(tileset).await
    }

    async fn tile(&self, fingerprint: &Fingerprint, coord: &TileCoordinate) -> query_tiler::Result<Option<Vec<u8>>> {
        self.inner.tile(fingerprint, coord).await
    }

    async fn tileset(&self, fingerprint: &Fingerprint) -> query_tiler::Result<Option<TileSet>> {
        self.inner.tileset(fingerprint).await
    }
}

#[tokio::test]
async fn test_persist_is_retried_once() {
    let generator = generator(FlakyStore::new(1));
    let query = Query::new(UNIT_SQUARE);

    let generation = generator.ensure_generated(&query).await.unwrap();
    assert!(generation.generated);
    assert_eq!(2, generator.store().attempts.load(Ordering::SeqCst));
    assert!(generator.store().exists(&query.fingerprint()).await.unwrap());
}

#[tokio::test]
async fn test_persist_failure_leaves_nothing() {
    let generator = generator(FlakyStore::new(2));
    let query = Query::new(UNIT_SQUARE);

    let err = generator.ensure_generated(&query).await.unwrap_err();
    assert_eq!(Stage::Persisting, err.stage);
    assert!(matches!(err.source, Error::Persist(_)));
    assert_eq!(2, generator.store().attempts.load(Ordering::SeqCst));
    assert!(!generator.store().exists(&query.fingerprint()).await.unwrap());
}

/// Reports every set as missing, as if another writer always got there
/// between the existence check and the create.
struct RacingStore {
    inner: Arc<MemoryTileStore>,
}

#[async_trait]
impl TileStore for RacingStore {
    async fn exists(&self, _: &Fingerprint) -> query_tiler::Result<bool> {
        Ok(false)
    }

    async fn create(&self, tileset: &TileSet) -> query_tiler::Result<CreateOutcome> {
        self.inner.create(tileset).await
    }

    async fn replace(&self, tileset: &TileSet) -> query_tiler::Result<()> {
        self.inner.replace(tileset).await
    }

    async fn tile(&self, fingerprint: &Fingerprint, coord: &TileCoordinate) -> query_tiler::Result<Option<Vec<u8>>> {
        self.inner.tile(fingerprint, coord).await
    }

    async fn tileset(&self, fingerprint: &Fingerprint) -> query_tiler::Result<Option<TileSet>> {
        self.inner.tileset(fingerprint).await
    }
}

#[tokio::test]
async fn test_concurrent_generation_both_succeed() {
    let shared = Arc::new(MemoryTileStore::new());
    let a = generator(RacingStore {
        inner: shared.clone(),
    });
    let b = generator(RacingStore {
        inner: shared.clone(),
    });
    let query = Query::new(UNIT_SQUARE);

    let (first, second) = tokio::join!(a.ensure_generated(&query), b.ensure_generated(&query));
    assert!(first.unwrap().generated);
    assert!(second.unwrap().generated);
    assert_eq!(1, shared.len());
}
