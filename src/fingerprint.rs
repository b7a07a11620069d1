//! Content addressing for queries.

use std::fmt;
use std::sync::Arc;

use sha2::{Digest, Sha256};

/// SQL text submitted for tiling. Immutable once created.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct Query(Arc<str>);

impl Query {
    pub fn new(sql: impl Into<String>) -> Self {
        Query(Arc::from(sql.into()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn fingerprint(&self) -> Fingerprint {
        Fingerprint::of(self)
    }
}

impl From<&str> for Query {
    fn from(sql: &str) -> Self {
        Query::new(sql)
    }
}

impl From<String> for Query {
    fn from(sql: String) -> Self {
        Query::new(sql)
    }
}

/// Hex SHA-256 of the query text. Used as cache key and tile set id.
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Fingerprint(String);

impl Fingerprint {
    pub fn of(query: &Query) -> Self {
        let digest = Sha256::digest(query.as_str().as_bytes());
        Fingerprint(format!("{:x}", digest))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for Fingerprint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}
