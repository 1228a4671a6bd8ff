//! Error taxonomy for the revision engine

use crate::fingerprint::Fingerprint;
use std::fmt;
use std::path::PathBuf;

/// Result type for engine operations
pub type Result<T> = std::result::Result<T, EngineError>;

/// Identity of one tracked file: an (owner, alias) pair
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct EntityId {
    pub owner: String,
    pub alias: String,
}

impl EntityId {
    /// Build an identity, rejecting empty owner or alias
    pub fn new(owner: &str, alias: &str) -> Result<Self> {
        if owner.is_empty() {
            return Err(EngineError::InvalidName("owner must not be empty".into()));
        }
        if alias.is_empty() {
            return Err(EngineError::InvalidName("alias must not be empty".into()));
        }
        Ok(Self {
            owner: owner.to_string(),
            alias: alias.to_string(),
        })
    }
}

impl fmt::Display for EntityId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.owner, self.alias)
    }
}

/// Errors surfaced by the engine and its backends
#[derive(Debug, thiserror::Error)]
pub enum EngineError {
    #[error("Invalid name: {0}")]
    InvalidName(String),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("{0} is not tracked")]
    NotTracked(EntityId),

    #[error("{0} is already tracked")]
    AlreadyTracked(EntityId),

    #[error("{0}: nothing to commit, content matches the current revision")]
    NoChanges(EntityId),

    #[error("{entity}: no revision {fingerprint}")]
    UnknownRevision {
        entity: EntityId,
        fingerprint: Fingerprint,
    },

    #[error("Corrupt payload: {0}")]
    CorruptPayload(String),

    #[error("Integrity check failed: expected {expected}, found {actual}")]
    Integrity {
        expected: Fingerprint,
        actual: Fingerprint,
    },

    #[error("Staging source {path:?}: {source}")]
    Staging {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("{op} failed for {entity}: {source}")]
    Backend {
        op: &'static str,
        entity: String,
        #[source]
        source: BackendError,
    },
}

impl EngineError {
    /// Wrap a backend failure with the operation and entity it belongs to
    pub fn backend(
        op: &'static str,
        entity: impl fmt::Display,
        source: impl Into<BackendError>,
    ) -> Self {
        EngineError::Backend {
            op,
            entity: entity.to_string(),
            source: source.into(),
        }
    }

    /// True for the "nothing to commit" signal, which is not a fault
    pub fn is_no_changes(&self) -> bool {
        matches!(self, EngineError::NoChanges(_))
    }
}

/// Failures of the persistence layer underneath a backend
#[derive(Debug, thiserror::Error)]
pub enum BackendError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("SQLite error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Encoding error: {0}")]
    Encoding(#[from] bincode::Error),

    #[error("Layout error: {0}")]
    Layout(String),
}

/// Closure adapter for `map_err` at backend call sites
pub(crate) fn wrap<'a, E: Into<BackendError>>(
    op: &'static str,
    entity: &'a EntityId,
) -> impl FnOnce(E) -> EngineError + 'a {
    move |e| EngineError::backend(op, entity, e)
}
