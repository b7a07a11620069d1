use std::fmt;

use crate::fingerprint::Fingerprint;

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("invalid extent: {0}")]
    InvalidExtent(String),

    #[error("schema mismatch: {0}")]
    Schema(String),

    #[error("tile cache unavailable: {0}")]
    CacheUnavailable(#[source] Box<Error>),

    #[error("failed to encode feature {feature}: {reason}")]
    Encoding { feature: usize, reason: String },

    #[error("failed to persist tile set: {0}")]
    Persist(#[source] Box<Error>),

    #[error("invalid pipeline transition from {from} to {to}")]
    InvalidTransition {
        from: crate::pipeline::PipelineState,
        to: crate::pipeline::PipelineState,
    },

    #[error("invalid configuration: {0}")]
    Config(String),

    #[error("invalid YAML in tiler configuration")]
    Yaml(#[from] serde_yaml::Error),

    #[error("query engine error: {0}")]
    Engine(String),

    #[error("database error")]
    Database(#[from] sqlx::Error),
}

/// The step of a pipeline run that produced an error.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Stage {
    CacheCheck,
    Estimating,
    Partitioning,
    Encoding,
    Persisting,
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Stage::CacheCheck => "cache check",
            Stage::Estimating => "estimating",
            Stage::Partitioning => "partitioning",
            Stage::Encoding => "encoding",
            Stage::Persisting => "persisting",
        };
        f.write_str(name)
    }
}

/// Error surfaced by the tile generator, tagged with the tile set it was
/// working on and the stage that failed.
#[derive(Debug, thiserror::Error)]
#[error("tile set {fingerprint} failed while {stage}: {source}")]
pub struct PipelineError {
    pub fingerprint: Fingerprint,
    pub stage: Stage,
    #[source]
    pub source: Error,
}

impl PipelineError {
    pub fn new(fingerprint: Fingerprint, stage: Stage, source: Error) -> Self {
        PipelineError {
            fingerprint,
            stage,
            source,
        }
    }

    /// Whether retrying the whole `ensure_generated` call may succeed.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self.source,
            Error::CacheUnavailable(_) | Error::Persist(_) | Error::Engine(_) | Error::Database(_)
        )
    }
}
