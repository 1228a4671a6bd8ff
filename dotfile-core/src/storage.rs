//! Storage abstraction
//!
//! Callers program against [`Backend`] and the per-file [`TrackedFile`] handle.
//! The local, sqlite and memory backends all implement the same contract, so
//! commit/checkout/read semantics do not depend on where history lives.

use crate::commit::{Commit, CommitSummary, INITIAL_MESSAGE};
use crate::error::{EngineError, EntityId, Result};
use crate::fingerprint::Fingerprint;
use crate::views::{FileSnapshot, FileSummary, TrackingData};
use chrono::FixedOffset;

/// Owned handle to one tracked file
pub type Handle = Box<dyn TrackedFile + Send>;

/// A concrete storage implementation
pub trait Backend: Send + Sync {
    /// Short name used in logs
    fn name(&self) -> &'static str;

    /// Handle for an entity that may not be initialized yet
    ///
    /// Fails with `NotFound` if the owner is unknown to the backend.
    fn track(&self, owner: &str, alias: &str) -> Result<Handle>;

    /// Handle for an entity that already has history
    fn open(&self, owner: &str, alias: &str) -> Result<Handle> {
        let mut handle = self.track(owner, alias)?;
        if !handle.is_tracked()? {
            let entity = handle.entity().clone();
            handle.close()?;
            return Err(EngineError::NotTracked(entity));
        }
        Ok(handle)
    }

    /// Delete an entity and every commit it owns
    fn remove(&self, owner: &str, alias: &str) -> Result<()>;

    /// List an owner's files without loading their content
    fn summaries(&self, owner: &str, offset: &FixedOffset) -> Result<Vec<FileSummary>>;
}

/// Scoped handle to one tracked file
///
/// Mutations are all-or-nothing. `close` must be called once the caller is
/// done; it makes pending writes durable and is a no-op on a closed handle.
pub trait TrackedFile {
    fn entity(&self) -> &EntityId;

    fn is_tracked(&self) -> Result<bool>;

    /// Path of the real file this entity tracks
    fn path(&self) -> Result<String>;

    /// Summary of the commit the current pointer references
    fn current(&self) -> Result<CommitSummary>;

    /// Decompressed content of the current commit
    fn current_content(&self) -> Result<Vec<u8>>;

    /// Decompressed content of the newest commit carrying `fingerprint`
    fn content_at(&self, fingerprint: &Fingerprint) -> Result<Vec<u8>>;

    /// Commit summaries, newest first
    fn history(&self) -> Result<Vec<CommitSummary>>;

    /// Record `commit` as the first revision of a new entity
    fn initialize_with(&mut self, path: &str, commit: Commit) -> Result<CommitSummary>;

    /// Append `commit` and advance the current pointer to it
    fn append(&mut self, commit: Commit) -> Result<CommitSummary>;

    /// Move the current pointer to `fingerprint` and return that content
    fn checkout(&mut self, fingerprint: &Fingerprint) -> Result<Vec<u8>>;

    fn close(&mut self) -> Result<()>;

    fn initialize(&mut self, path: &str, content: &[u8]) -> Result<CommitSummary> {
        if self.is_tracked()? {
            return Err(EngineError::AlreadyTracked(self.entity().clone()));
        }
        self.initialize_with(path, Commit::new(content, INITIAL_MESSAGE)?)
    }

    fn commit(&mut self, content: &[u8], message: &str) -> Result<CommitSummary> {
        let current = self.current()?;
        crate::history::ensure_changed(self.entity(), &current.hash, &Fingerprint::of(content))?;
        self.append(Commit::new(content, message)?)
    }

    fn snapshot(&self) -> Result<FileSnapshot> {
        build_snapshot(self)
    }

    fn tracking_data(&self) -> Result<TrackingData> {
        build_tracking_data(self)
    }
}

/// Current snapshot view of `file`
pub fn build_snapshot<F: TrackedFile + ?Sized>(file: &F) -> Result<FileSnapshot> {
    let current = file.current()?;
    let entity = file.entity();
    Ok(FileSnapshot {
        owner: entity.owner.clone(),
        alias: entity.alias.clone(),
        path: file.path()?,
        hash: current.hash,
        content: file.current_content()?,
    })
}

/// Structured tracking record of `file`
pub fn build_tracking_data<F: TrackedFile + ?Sized>(file: &F) -> Result<TrackingData> {
    Ok(TrackingData {
        path: file.path()?,
        revision: file.current()?.hash,
        commits: file.history()?,
    })
}

/// Run `f` against `handle` and close it on every exit path
///
/// An error from `f` takes precedence over an error from `close`.
pub fn scoped<T>(
    mut handle: Handle,
    f: impl FnOnce(&mut dyn TrackedFile) -> Result<T>,
) -> Result<T> {
    let result = f(handle.as_mut());
    let closed = handle.close();
    let value = result?;
    closed?;
    Ok(value)
}
