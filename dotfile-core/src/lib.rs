//! Dotfile Core Library
//!
//! Revision engine for individually tracked configuration files:
//! - Content fingerprints and the zstd payload codec
//! - Immutable commits and the append-only revision history
//! - Storage abstraction with local, SQLite and in-memory backends
//! - Staging sources (working files and uploaded blobs)
//! - Read views, configuration and cross-backend replay

pub mod backend;
pub mod codec;
pub mod commit;
pub mod config;
pub mod error;
pub mod fingerprint;
pub mod history;
pub mod migrate;
pub mod staging;
pub mod storage;
pub mod views;

pub use backend::{LocalBackend, MemoryBackend, SqliteBackend};
pub use commit::{Commit, CommitSummary, INITIAL_MESSAGE};
pub use config::{BackendKind, Config, ConfigError};
pub use error::{BackendError, EngineError, EntityId, Result};
pub use fingerprint::Fingerprint;
pub use history::RevisionHistory;
pub use staging::{StagingSource, UploadedBlob, WorkingFile};
pub use storage::{scoped, Backend, Handle, TrackedFile};
pub use views::{FileSnapshot, FileSummary, TrackingData};
