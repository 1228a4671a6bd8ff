//! In-memory backend
//!
//! Keeps every entity's [`RevisionHistory`] in process memory. Used by tests and
//! as a staging target when replaying history between backends. The map only
//! holds initialized entities; lookups of unknown aliases never insert.

use crate::commit::{Commit, CommitSummary};
use crate::error::{EngineError, EntityId, Result};
use crate::fingerprint::Fingerprint;
use crate::history::RevisionHistory;
use crate::storage::{Backend, Handle, TrackedFile};
use crate::views::{FileSnapshot, FileSummary, TrackingData};
use chrono::FixedOffset;
use std::collections::BTreeMap;
use std::sync::{Arc, PoisonError, RwLock};

#[derive(Debug)]
struct Entry {
    path: String,
    history: RevisionHistory,
    updated_at: i64,
}

type Slot = Arc<RwLock<Entry>>;
type Entities = Arc<RwLock<BTreeMap<EntityId, Slot>>>;

/// Process-local backend
#[derive(Default)]
pub struct MemoryBackend {
    entities: Entities,
}

impl MemoryBackend {
    pub fn new() -> Self {
        Self::default()
    }
}

impl Backend for MemoryBackend {
    fn name(&self) -> &'static str {
        "memory"
    }

    fn track(&self, owner: &str, alias: &str) -> Result<Handle> {
        Ok(Box::new(MemoryFile {
            entity: EntityId::new(owner, alias)?,
            entities: self.entities.clone(),
        }))
    }

    fn remove(&self, owner: &str, alias: &str) -> Result<()> {
        let entity = EntityId::new(owner, alias)?;
        let removed = self
            .entities
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(&entity);
        if removed.is_none() {
            return Err(EngineError::NotTracked(entity));
        }
        Ok(())
    }

    fn summaries(&self, owner: &str, offset: &FixedOffset) -> Result<Vec<FileSummary>> {
        let entities = self.entities.read().unwrap_or_else(PoisonError::into_inner);
        let mut result = Vec::new();
        for (id, slot) in entities.iter().filter(|(id, _)| id.owner == owner) {
            let entry = slot.read().unwrap_or_else(PoisonError::into_inner);
            result.push(FileSummary::new(
                owner,
                id.alias.clone(),
                entry.path.clone(),
                entry.history.len(),
                entry.updated_at,
                offset,
            ));
        }
        Ok(result)
    }
}

struct MemoryFile {
    entity: EntityId,
    entities: Entities,
}

impl MemoryFile {
    fn slot(&self) -> Result<Slot> {
        self.entities
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(&self.entity)
            .cloned()
            .ok_or_else(|| EngineError::NotTracked(self.entity.clone()))
    }

    fn read<T>(&self, f: impl FnOnce(&Entry) -> Result<T>) -> Result<T> {
        let slot = self.slot()?;
        let guard = slot.read().unwrap_or_else(PoisonError::into_inner);
        f(&guard)
    }

    fn write<T>(&self, f: impl FnOnce(&mut Entry) -> Result<T>) -> Result<T> {
        let slot = self.slot()?;
        let mut guard = slot.write().unwrap_or_else(PoisonError::into_inner);
        f(&mut guard)
    }
}

impl TrackedFile for MemoryFile {
    fn entity(&self) -> &EntityId {
        &self.entity
    }

    fn is_tracked(&self) -> Result<bool> {
        Ok(self
            .entities
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .contains_key(&self.entity))
    }

    fn path(&self) -> Result<String> {
        self.read(|e| Ok(e.path.clone()))
    }

    fn current(&self) -> Result<CommitSummary> {
        self.read(|e| Ok(e.history.current()?.summary()))
    }

    fn current_content(&self) -> Result<Vec<u8>> {
        self.read(|e| e.history.current()?.verified_content())
    }

    fn content_at(&self, fingerprint: &Fingerprint) -> Result<Vec<u8>> {
        self.read(|e| {
            let index = e.history.find(fingerprint).ok_or_else(|| EngineError::UnknownRevision {
                entity: self.entity.clone(),
                fingerprint: *fingerprint,
            })?;
            e.history.entries()[index].verified_content()
        })
    }

    fn history(&self) -> Result<Vec<CommitSummary>> {
        self.read(|e| Ok(e.history.list().collect()))
    }

    fn initialize_with(&mut self, path: &str, commit: Commit) -> Result<CommitSummary> {
        let mut entities = self.entities.write().unwrap_or_else(PoisonError::into_inner);
        if entities.contains_key(&self.entity) {
            return Err(EngineError::AlreadyTracked(self.entity.clone()));
        }
        let mut history = RevisionHistory::new(self.entity.clone());
        let updated_at = commit.timestamp();
        let summary = history.initialize(commit)?.summary();
        let entry = Entry {
            path: path.to_string(),
            history,
            updated_at,
        };
        entities.insert(self.entity.clone(), Arc::new(RwLock::new(entry)));
        Ok(summary)
    }

    fn append(&mut self, commit: Commit) -> Result<CommitSummary> {
        self.write(|e| {
            let updated_at = commit.timestamp();
            let summary = e.history.append(commit)?.summary();
            e.updated_at = updated_at;
            Ok(summary)
        })
    }

    fn checkout(&mut self, fingerprint: &Fingerprint) -> Result<Vec<u8>> {
        self.write(|e| {
            let content = e.history.checkout(fingerprint)?;
            e.updated_at = chrono::Utc::now().timestamp();
            Ok(content)
        })
    }

    fn close(&mut self) -> Result<()> {
        Ok(())
    }

    fn snapshot(&self) -> Result<FileSnapshot> {
        self.read(|e| {
            let current = e.history.current()?;
            Ok(FileSnapshot {
                owner: self.entity.owner.clone(),
                alias: self.entity.alias.clone(),
                path: e.path.clone(),
                hash: *current.fingerprint(),
                content: current.verified_content()?,
            })
        })
    }

    fn tracking_data(&self) -> Result<TrackingData> {
        self.read(|e| {
            Ok(TrackingData {
                path: e.path.clone(),
                revision: *e.history.current()?.fingerprint(),
                commits: e.history.list().collect(),
            })
        })
    }
}
