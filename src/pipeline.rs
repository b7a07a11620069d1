//! Tile generation pipeline.
//!
//! A run moves through `Idle -> Estimating -> Partitioning -> Encoding ->
//! Persisting -> Done`, or ends in `Failed` from any non-terminal state. The
//! [`TileGenerator`] drives runs and gates them on the tile store, so a query
//! is only ever tiled when its fingerprint is not stored yet.

use std::collections::{BTreeMap, BTreeSet};
use std::fmt;

use log::{debug, info, warn};
use serde::Serialize;

use crate::bounds::{estimate_bounds, BoundingBox, Extent, ZoomLevel};
use crate::config::TilerConfig;
use crate::engine::{estimate_size, QueryEngine, SizeEstimate};
use crate::error::{Error, PipelineError, Result, Stage};
use crate::feature::{decode_rows, Feature};
use crate::fingerprint::{Fingerprint, Query};
use crate::grid::{covering_tile_count, Partition};
use crate::mvt::TileEncoder;
use crate::schema::{MvtInfo, MvtSource, Schema, TileMetadata};
use crate::store::{CachedTiles, CreateOutcome, TileSet, TileStore};

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum PipelineState {
    Idle,
    Estimating,
    Partitioning,
    Encoding,
    Persisting,
    Done,
    Failed,
}

impl PipelineState {
    pub fn is_terminal(self) -> bool {
        matches!(self, PipelineState::Done | PipelineState::Failed)
    }

    pub fn can_transition_to(self, next: PipelineState) -> bool {
        use PipelineState::*;

        match (self, next) {
            (Idle, Estimating)
            | (Estimating, Partitioning)
            | (Partitioning, Encoding)
            | (Encoding, Persisting)
            | (Persisting, Done) => true,
            (from, Failed) => !from.is_terminal(),
            _ => false,
        }
    }
}

impl fmt::Display for PipelineState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

/// Tracks the state of a single run.
#[derive(Clone, Debug)]
pub struct PipelineRun {
    fingerprint: Fingerprint,
    state: PipelineState,
    history: Vec<PipelineState>,
}

impl PipelineRun {
    pub fn new(fingerprint: Fingerprint) -> Self {
        PipelineRun {
            fingerprint,
            state: PipelineState::Idle,
            history: vec![PipelineState::Idle],
        }
    }

    pub fn fingerprint(&self) -> &Fingerprint {
        &self.fingerprint
    }

    pub fn state(&self) -> PipelineState {
        self.state
    }

    /// Every state the run has been in, oldest first.
    pub fn history(&self) -> &[PipelineState] {
        &self.history
    }

    pub fn advance(&mut self, next: PipelineState) -> Result<()> {
        if !self.state.can_transition_to(next) {
            return Err(Error::InvalidTransition {
                from: self.state,
                to: next,
            });
        }
        debug!("{}: {} -> {}", self.fingerprint, self.state, next);
        self.state = next;
        self.history.push(next);
        Ok(())
    }

    /// Moves the run to `Failed` and wraps `source` for the caller.
    pub fn fail(&mut self, stage: Stage, source: Error) -> PipelineError {
        if !self.state.is_terminal() {
            debug!("{}: {} -> {}", self.fingerprint, self.state, PipelineState::Failed);
            self.state = PipelineState::Failed;
            self.history.push(PipelineState::Failed);
        }
        PipelineError::new(self.fingerprint.clone(), stage, source)
    }

    fn step<T>(&mut self, stage: Stage, result: Result<T>) -> std::result::Result<T, PipelineError> {
        result.map_err(|e| self.fail(stage, e))
    }
}

/// Summary of one generated tile set.
#[derive(Clone, Debug, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct GenerationReport {
    pub zoom: ZoomLevel,
    pub bounds: BoundingBox,
    pub tile_count: usize,
    pub feature_count: usize,
    /// Rows left out because their geometry could not be decoded or encoded.
    pub skipped_features: Vec<usize>,
    pub estimated_size: SizeEstimate,
}

/// Outcome of [`TileGenerator::ensure_generated`].
#[derive(Clone, Debug)]
pub struct Generation {
    pub fingerprint: Fingerprint,
    /// `false` when the tile set was already stored and nothing ran.
    pub generated: bool,
    pub report: Option<GenerationReport>,
    pub history: Vec<PipelineState>,
}

/// How a frontend should load a query's data.
#[derive(Clone, Debug, PartialEq)]
pub enum SourcePlan {
    /// Small enough to download the features directly.
    Inline(SizeEstimate),
    Tiles(SizeEstimate),
}

impl SourcePlan {
    pub fn estimate(&self) -> SizeEstimate {
        match self {
            SourcePlan::Inline(estimate) | SourcePlan::Tiles(estimate) => *estimate,
        }
    }
}

pub struct TileGenerator<E, S> {
    config: TilerConfig,
    engine: E,
    store: S,
    encoder: TileEncoder,
}

impl<E: QueryEngine, S: TileStore> TileGenerator<E, S> {
    pub fn new(config: TilerConfig, engine: E, store: S) -> Result<Self> {
        config.validate()?;
        let encoder = TileEncoder::new(config.layer_name.clone(), config.tile_extent);
        Ok(TileGenerator {
            config,
            engine,
            store,
            encoder,
        })
    }

    pub fn config(&self) -> &TilerConfig {
        &self.config
    }

    pub fn engine(&self) -> &E {
        &self.engine
    }

    pub fn store(&self) -> &S {
        &self.store
    }

    /// Where the tile set of `query` lives once generated.
    pub fn mvt_source(&self, query: &Query) -> MvtSource {
        MvtSource {
            project_id: self.config.project_id.clone(),
            dataset_id: self.config.tile_dataset.clone(),
            table_id: query.fingerprint().to_string(),
        }
    }

    /// Serves the stored tiles of `query`.
    pub fn tiles(&self, query: &Query) -> CachedTiles<'_, S> {
        CachedTiles::new(&self.store, query.fingerprint())
    }

    /// Estimates the download size of `query`. The schema is validated
    /// first so a missing column is reported as such.
    pub async fn estimated_data_size(&self, query: &Query) -> Result<SizeEstimate> {
        let schema = self.schema(query).await?;
        self.estimate_for(query, &schema).await
    }

    async fn estimate_for(&self, query: &Query, schema: &Schema) -> Result<SizeEstimate> {
        estimate_size(
            &self.engine,
            query,
            schema.geometry_column(),
            self.config.data_size_limit,
        )
        .await
    }

    /// Decides between downloading `query` whole and tiling it.
    pub async fn plan(&self, query: &Query) -> Result<SourcePlan> {
        let estimate = self.estimated_data_size(query).await?;
        if estimate.is_small(self.config.data_size_limit) {
            Ok(SourcePlan::Inline(estimate))
        } else {
            Ok(SourcePlan::Tiles(estimate))
        }
    }

    async fn schema(&self, query: &Query) -> Result<Schema> {
        self.engine
            .schema(query, &self.config.geometry_column, &self.config.index_column)
            .await
    }

    pub async fn fetch_bounds(&self, query: &Query) -> Result<Extent> {
        let schema = self.schema(query).await?;
        self.bounds_for(query, &schema).await
    }

    async fn bounds_for(&self, query: &Query, schema: &Schema) -> Result<Extent> {
        estimate_bounds(
            &self.engine,
            query,
            schema.geometry_column(),
            self.config.max_zoom,
        )
        .await
    }

    pub async fn fetch_mvt_metadata(&self, query: &Query) -> Result<TileMetadata> {
        Ok(self.schema(query).await?.metadata())
    }

    pub async fn fetch_mvt_info(&self, query: &Query) -> Result<MvtInfo> {
        let schema = self.schema(query).await?;
        let extent = self.bounds_for(query, &schema).await?;
        Ok(MvtInfo::new(schema.metadata(), extent))
    }

    /// Downloads and decodes every row of `query`, skipping bad geometries.
    pub async fn download(&self, query: &Query) -> Result<Vec<Feature>> {
        let schema = self.schema(query).await?;
        let rows = self.engine.rows(query, &schema).await?;
        let (features, _) = decode_rows(&schema, &rows);
        Ok(features)
    }

    /// Tiles `query` without touching the store.
    pub async fn build_tileset(
        &self,
        query: &Query,
    ) -> std::result::Result<(TileSet, GenerationReport), PipelineError> {
        let mut run = PipelineRun::new(query.fingerprint());
        self.build(&mut run, query).await
    }

    /// Makes sure the tile set of `query` is stored, generating it on a miss.
    ///
    /// A hit returns without running a single engine query.
    pub async fn ensure_generated(&self, query: &Query) -> std::result::Result<Generation, PipelineError> {
        let fingerprint = query.fingerprint();
        let mut run = PipelineRun::new(fingerprint.clone());

        let exists = self.store.exists(&fingerprint).await;
        let exists = run.step(
            Stage::CacheCheck,
            exists.map_err(|e| Error::CacheUnavailable(Box::new(e))),
        )?;
        if exists {
            info!("tile set {} already generated", fingerprint);
            return Ok(Generation {
                fingerprint,
                generated: false,
                report: None,
                history: run.history,
            });
        }

        info!("tile set {} missing, generating", fingerprint);
        self.generate(run, query, false).await
    }

    /// Rebuilds the tile set of `query` and overwrites any stored copy.
    pub async fn regenerate(&self, query: &Query) -> std::result::Result<Generation, PipelineError> {
        let run = PipelineRun::new(query.fingerprint());
        info!("regenerating tile set {}", run.fingerprint());
        self.generate(run, query, true).await
    }

    async fn generate(
        &self,
        mut run: PipelineRun,
        query: &Query,
        replace: bool,
    ) -> std::result::Result<Generation, PipelineError> {
        let (tileset, report) = self.build(&mut run, query).await?;
        self.persist(&mut run, &tileset, replace).await?;
        let done = run.advance(PipelineState::Done);
        run.step(Stage::Persisting, done)?;

        info!(
            "tile set {}: {} tiles ({} bytes) at zoom {}, {} features, {} skipped",
            tileset.fingerprint,
            report.tile_count,
            tileset.size(),
            report.zoom,
            report.feature_count,
            report.skipped_features.len()
        );
        Ok(Generation {
            fingerprint: tileset.fingerprint,
            generated: true,
            report: Some(report),
            history: run.history,
        })
    }

    async fn build(
        &self,
        run: &mut PipelineRun,
        query: &Query,
    ) -> std::result::Result<(TileSet, GenerationReport), PipelineError> {
        let estimating = run.advance(PipelineState::Estimating);
        run.step(Stage::Estimating, estimating)?;
        // Nothing may touch the geometry column before the schema is known
        // to have it.
        let schema = self.schema(query).await;
        let schema = run.step(Stage::Estimating, schema)?;
        let estimate = self.estimate_for(query, &schema).await;
        let estimate = run.step(Stage::Estimating, estimate)?;
        let extent = self.bounds_for(query, &schema).await;
        let extent = run.step(Stage::Estimating, extent)?;

        let partitioning = run.advance(PipelineState::Partitioning);
        run.step(Stage::Partitioning, partitioning)?;
        let candidates = covering_tile_count(&extent.bounds, extent.zoom, self.config.overscan_margin);
        if candidates > self.config.max_tiles {
            return Err(run.fail(
                Stage::Partitioning,
                Error::InvalidExtent(format!(
                    "extent {} spans up to {} tiles at zoom {}, more than maxTiles {}",
                    extent.bounds, candidates, extent.zoom, self.config.max_tiles
                )),
            ));
        }
        let rows = self.engine.rows(query, &schema).await;
        let rows = run.step(Stage::Partitioning, rows)?;
        let (features, rejected) = decode_rows(&schema, &rows);
        if features.is_empty() {
            return Err(run.fail(
                Stage::Partitioning,
                Error::Schema(format!(
                    "none of {} rows has a usable \"{}\" geometry",
                    rows.len(),
                    schema.geometry_column()
                )),
            ));
        }
        let boxes: Vec<BoundingBox> = features.iter().map(|f| f.bbox).collect();
        let partition = Partition::new(
            &extent.bounds,
            extent.zoom,
            self.config.overscan_margin,
            &boxes,
        );
        debug!(
            "{}: {} tiles with features at zoom {}",
            run.fingerprint(),
            partition.tile_count(),
            partition.zoom()
        );

        let encoding = run.advance(PipelineState::Encoding);
        run.step(Stage::Encoding, encoding)?;
        let mut skipped: BTreeSet<usize> = rejected.iter().filter_map(skipped_row).collect();
        let mut tiles = BTreeMap::new();
        for (coord, indices) in partition.assigned() {
            let encoded = self
                .encoder
                .encode(coord, indices.iter().map(|&i| &features[i]));
            skipped.extend(encoded.skipped.iter().filter_map(skipped_row));
            if encoded.features > 0 {
                tiles.insert(*coord, encoded.data);
            }
        }
        if !skipped.is_empty() {
            warn!("{}: skipped {} features", run.fingerprint(), skipped.len());
        }

        let report = GenerationReport {
            zoom: extent.zoom,
            bounds: extent.bounds,
            tile_count: tiles.len(),
            feature_count: features.len(),
            skipped_features: skipped.into_iter().collect(),
            estimated_size: estimate,
        };
        let tileset = TileSet {
            fingerprint: run.fingerprint().clone(),
            extent,
            tiles,
        };
        Ok((tileset, report))
    }

    /// Writes `tileset`, retrying a failed write once. Losing a create race
    /// to another writer counts as success.
    async fn persist(
        &self,
        run: &mut PipelineRun,
        tileset: &TileSet,
        replace: bool,
    ) -> std::result::Result<(), PipelineError> {
        let persisting = run.advance(PipelineState::Persisting);
        run.step(Stage::Persisting, persisting)?;

        let mut retried = false;
        loop {
            let result = if replace {
                self.store.replace(tileset).await.map(|_| CreateOutcome::Created)
            } else {
                self.store.create(tileset).await
            };
            match result {
                Ok(CreateOutcome::Created) => return Ok(()),
                Ok(CreateOutcome::AlreadyExists) => {
                    info!("tile set {} was stored concurrently", tileset.fingerprint);
                    return Ok(());
                }
                Err(e) if !retried => {
                    warn!("storing tile set {} failed, retrying: {}", tileset.fingerprint, e);
                    retried = true;
                }
                Err(e) => return Err(run.fail(Stage::Persisting, Error::Persist(Box::new(e)))),
            }
        }
    }
}

fn skipped_row(error: &Error) -> Option<usize> {
    match error {
        Error::Encoding { feature, .. } => Some(*feature),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;
    use PipelineState::*;

    #[rstest]
    #[case(Idle, Estimating)]
    #[case(Estimating, Partitioning)]
    #[case(Partitioning, Encoding)]
    #[case(Encoding, Persisting)]
    #[case(Persisting, Done)]
    #[case(Idle, Failed)]
    #[case(Encoding, Failed)]
    fn test_legal_transitions(#[case] from: PipelineState, #[case] to: PipelineState) {
        assert!(from.can_transition_to(to));
    }

    #[rstest]
    #[case(Idle, Partitioning)]
    #[case(Estimating, Encoding)]
    #[case(Persisting, Estimating)]
    #[case(Done, Failed)]
    #[case(Failed, Idle)]
    #[case(Done, Estimating)]
    #[case(Encoding, Encoding)]
    fn test_illegal_transitions(#[case] from: PipelineState, #[case] to: PipelineState) {
        assert!(!from.can_transition_to(to));
    }

    #[test]
    fn test_run_rejects_skipping_states() {
        let mut run = PipelineRun::new(Query::new("SELECT 1").fingerprint());
        run.advance(Estimating).unwrap();

        let err = run.advance(Persisting).unwrap_err();
        assert!(matches!(
            err,
            Error::InvalidTransition {
                from: Estimating,
                to: Persisting
            }
        ));
        assert_eq!(Estimating, run.state());
    }

    #[test]
    fn test_run_failure() {
        let mut run = PipelineRun::new(Query::new("SELECT 1").fingerprint());
        run.advance(Estimating).unwrap();

        let err = run.fail(Stage::Estimating, Error::InvalidExtent("single point".into()));
        assert_eq!(Stage::Estimating, err.stage);
        assert_eq!(&Query::new("SELECT 1").fingerprint(), &err.fingerprint);
        assert!(!err.is_retryable());
        assert_eq!(&[Idle, Estimating, Failed], run.history());
        assert!(run.advance(Partitioning).is_err());
    }
}
