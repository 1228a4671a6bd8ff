//! Revision history of one tracked file
//!
//! Entries are chronological and append-only. Checkout only moves the current
//! pointer; it never truncates or reorders the recorded sequence.

use crate::commit::{Commit, CommitSummary};
use crate::error::{EngineError, EntityId, Result};
use crate::fingerprint::Fingerprint;

/// Initialize is only valid on an entity with no commits
pub fn ensure_untracked(entity: &EntityId, len: usize) -> Result<()> {
    if len > 0 {
        return Err(EngineError::AlreadyTracked(entity.clone()));
    }
    Ok(())
}

/// Append is a no-op signal when the candidate matches the current revision
pub fn ensure_changed(
    entity: &EntityId,
    current: &Fingerprint,
    candidate: &Fingerprint,
) -> Result<()> {
    if current == candidate {
        return Err(EngineError::NoChanges(entity.clone()));
    }
    Ok(())
}

/// Ordered commits plus the index of the current one
#[derive(Debug, Clone)]
pub struct RevisionHistory {
    entity: EntityId,
    entries: Vec<Commit>,
    current: usize,
}

impl RevisionHistory {
    /// Empty history for an entity that has not been initialized
    pub fn new(entity: EntityId) -> Self {
        Self {
            entity,
            entries: Vec::new(),
            current: 0,
        }
    }

    pub fn entity(&self) -> &EntityId {
        &self.entity
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// The current commit, `NotTracked` while the history is empty
    pub fn current(&self) -> Result<&Commit> {
        self.entries
            .get(self.current)
            .ok_or_else(|| EngineError::NotTracked(self.entity.clone()))
    }

    pub fn current_index(&self) -> Option<usize> {
        if self.entries.is_empty() { None } else { Some(self.current) }
    }

    /// Index of the newest entry carrying `fingerprint`
    pub fn find(&self, fingerprint: &Fingerprint) -> Option<usize> {
        self.entries.iter().rposition(|c| c.fingerprint() == fingerprint)
    }

    pub fn get(&self, index: usize) -> Option<&Commit> {
        self.entries.get(index)
    }

    /// Chronological entries, oldest first
    pub fn entries(&self) -> &[Commit] {
        &self.entries
    }

    /// Record the first commit and make it current
    pub fn initialize(&mut self, commit: Commit) -> Result<&Commit> {
        ensure_untracked(&self.entity, self.entries.len())?;
        self.entries.push(commit);
        self.current = 0;
        Ok(&self.entries[0])
    }

    /// Append a commit and advance the current pointer to it
    pub fn append(&mut self, commit: Commit) -> Result<&Commit> {
        let current = self.current()?.fingerprint();
        ensure_changed(&self.entity, current, commit.fingerprint())?;
        self.entries.push(commit);
        self.current = self.entries.len() - 1;
        Ok(&self.entries[self.current])
    }

    /// Point current at the newest commit with `fingerprint` and return its content
    pub fn checkout(&mut self, fingerprint: &Fingerprint) -> Result<Vec<u8>> {
        self.current()?;
        let index = self.find(fingerprint).ok_or_else(|| EngineError::UnknownRevision {
            entity: self.entity.clone(),
            fingerprint: *fingerprint,
        })?;
        let content = self.entries[index].verified_content()?;
        self.current = index;
        Ok(content)
    }

    /// Summaries newest first; the iterator can be cloned to restart it
    pub fn list(&self) -> impl Iterator<Item = CommitSummary> + Clone + '_ {
        self.entries.iter().rev().map(Commit::summary)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const CONTENT: &[u8] = b"Testing content. Stored as a blob.";
    const UPDATED: &[u8] = b"Testing content. Stored as a blob.\n New content!\n";

    fn history() -> RevisionHistory {
        RevisionHistory::new(EntityId::new("genericusername", "testalias").unwrap())
    }

    #[test]
    fn test_initialize_once() {
        let mut h = history();
        h.initialize(Commit::new(CONTENT, "Initial commit").unwrap()).unwrap();
        assert_eq!(h.len(), 1);
        assert_eq!(h.current().unwrap().verified_content().unwrap(), CONTENT);

        let again = h.initialize(Commit::new(b"other", "again").unwrap());
        assert!(matches!(again, Err(EngineError::AlreadyTracked(_))));
        assert_eq!(h.len(), 1);
    }

    #[test]
    fn test_append_and_list_newest_first() {
        let mut h = history();
        h.initialize(Commit::new(CONTENT, "Initial commit").unwrap()).unwrap();
        h.append(Commit::new(UPDATED, "test commit").unwrap()).unwrap();

        let list: Vec<_> = h.list().collect();
        assert_eq!(list.len(), 2);
        assert_eq!(list[0].message, "test commit");
        assert_eq!(list[1].hash, Fingerprint::of(CONTENT));
        assert_eq!(h.current().unwrap().fingerprint(), &Fingerprint::of(UPDATED));

        let restarted = h.list();
        assert_eq!(restarted.clone().count(), restarted.count());
    }

    #[test]
    fn test_append_unchanged_is_no_changes() {
        let mut h = history();
        h.initialize(Commit::new(CONTENT, "Initial commit").unwrap()).unwrap();
        let err = h.append(Commit::new(CONTENT, "same").unwrap()).unwrap_err();
        assert!(err.is_no_changes());
        assert_eq!(h.len(), 1);
    }

    #[test]
    fn test_append_requires_history() {
        let mut h = history();
        let err = h.append(Commit::new(CONTENT, "m").unwrap()).unwrap_err();
        assert!(matches!(err, EngineError::NotTracked(_)));
    }

    #[test]
    fn test_checkout_keeps_entries() {
        let mut h = history();
        h.initialize(Commit::new(CONTENT, "Initial commit").unwrap()).unwrap();
        h.append(Commit::new(UPDATED, "test commit").unwrap()).unwrap();

        let content = h.checkout(&Fingerprint::of(CONTENT)).unwrap();
        assert_eq!(content, CONTENT);
        assert_eq!(h.len(), 2);
        assert_eq!(h.current_index(), Some(0));

        // Appending after a checkout continues the sequence
        h.append(Commit::new(b"third", "third").unwrap()).unwrap();
        assert_eq!(h.len(), 3);
        assert_eq!(h.current_index(), Some(2));
    }

    #[test]
    fn test_checkout_unknown_leaves_current() {
        let mut h = history();
        h.initialize(Commit::new(CONTENT, "Initial commit").unwrap()).unwrap();
        let err = h.checkout(&Fingerprint::of(b"missing")).unwrap_err();
        assert!(matches!(err, EngineError::UnknownRevision { .. }));
        assert_eq!(h.current_index(), Some(0));
    }

    #[test]
    fn test_checkout_resolves_newest_duplicate() {
        let mut h = history();
        h.initialize(Commit::new(b"a", "a").unwrap()).unwrap();
        h.append(Commit::new(b"b", "b").unwrap()).unwrap();
        h.checkout(&Fingerprint::of(b"a")).unwrap();
        h.append(Commit::new(b"b", "b again").unwrap()).unwrap();
        assert_eq!(h.find(&Fingerprint::of(b"b")), Some(2));
    }
}
