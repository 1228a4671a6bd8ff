//! Local single-user backend
//!
//! Layout on disk:
//! ```text
//! {root}/{owner}/{alias}/
//!   HEAD                              JSON: path, commit count, current index
//!   commits/{seq}.bin                 commit records (bincode), append-only
//!   objects/{hash[0..2]}/{hash[2..]}  compressed payloads, content-addressed
//! {root}/{owner}/.locks/{alias}       exclusive lock held during mutations
//! ```
//!
//! `HEAD` is replaced by rename as the last step of every mutation, so readers
//! see either the old or the new state. Every file is synced before it is
//! renamed into place, and the directories holding records and objects are
//! synced before `HEAD` moves. Records beyond `HEAD.len` left behind by a
//! failed mutation are invisible and get overwritten by the next one.
//!
//! Lock files live outside the entity directory and are never deleted, so a
//! removal cannot hand two mutators different lock inodes.

use crate::commit::{self, Commit, CommitSummary};
use crate::error::{wrap, BackendError, EngineError, EntityId, Result};
use crate::fingerprint::Fingerprint;
use crate::history;
use crate::storage::{Backend, Handle, TrackedFile};
use crate::views::{FileSnapshot, FileSummary, TrackingData};
use chrono::FixedOffset;
use fs2::FileExt;
use serde::{Deserialize, Serialize};
use std::fs::{self, File, OpenOptions};
use std::io::{self, ErrorKind, Write};
use std::path::{Path, PathBuf};

/// Directory under each owner holding the per-entity lock files
const LOCK_DIR: &str = ".locks";

/// Pointer file: everything a reader needs to interpret the commit log
#[derive(Debug, Clone, Serialize, Deserialize)]
struct Head {
    alias: String,
    path: String,
    len: usize,
    current: usize,
    updated_at: i64,
}

/// On-disk commit record; the payload lives in the object store
#[derive(Debug, Clone, Serialize, Deserialize)]
struct CommitRecord {
    hash: Fingerprint,
    message: String,
    timestamp: i64,
}

impl CommitRecord {
    fn summary(&self) -> CommitSummary {
        CommitSummary {
            hash: self.hash,
            message: self.message.clone(),
            timestamp: self.timestamp,
        }
    }
}

/// Escape a name into a single path component
///
/// ASCII alphanumerics, `_`, `-` and non-leading `.` are kept; every other
/// byte becomes `%XX`. The mapping is injective, and no escaped name starts
/// with a dot, so it never collides with [`LOCK_DIR`].
pub fn escape_component(name: &str) -> String {
    let mut out = String::with_capacity(name.len());
    for (i, b) in name.bytes().enumerate() {
        let keep = b.is_ascii_alphanumeric() || b == b'_' || b == b'-' || (b == b'.' && i > 0);
        if keep {
            out.push(b as char);
        } else {
            out.push_str(&format!("%{:02X}", b));
        }
    }
    out
}

fn sync_dir(dir: &Path) -> io::Result<()> {
    if cfg!(unix) {
        File::open(dir)?.sync_all()?;
    }
    Ok(())
}

/// Create `dir` and its missing ancestors, syncing every parent that gained an entry
fn create_dirs(dir: &Path) -> io::Result<()> {
    if dir.as_os_str().is_empty() || dir.is_dir() {
        return Ok(());
    }
    if let Some(parent) = dir.parent() {
        create_dirs(parent)?;
    }
    match fs::create_dir(dir) {
        Ok(()) => {}
        Err(e) if e.kind() == ErrorKind::AlreadyExists => return Ok(()),
        Err(e) => return Err(e),
    }
    match dir.parent() {
        Some(parent) if !parent.as_os_str().is_empty() => sync_dir(parent),
        _ => Ok(()),
    }
}

/// Filesystem backend rooted at one directory
#[derive(Debug, Clone)]
pub struct LocalBackend {
    root: PathBuf,
}

impl LocalBackend {
    /// Open or create a store at the given path
    pub fn open(root: &Path) -> Result<Self> {
        fs::create_dir_all(root)
            .map_err(|e| EngineError::backend("open store", root.display(), e))?;
        Ok(Self {
            root: root.to_path_buf(),
        })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn owner_dir(&self, owner: &str) -> PathBuf {
        self.root.join(escape_component(owner))
    }

    fn file(&self, entity: EntityId) -> LocalFile {
        let owner_dir = self.owner_dir(&entity.owner);
        let alias = escape_component(&entity.alias);
        LocalFile {
            dir: owner_dir.join(&alias),
            lock_path: owner_dir.join(LOCK_DIR).join(alias),
            entity,
            unsynced: false,
            closed: false,
        }
    }
}

impl Backend for LocalBackend {
    fn name(&self) -> &'static str {
        "local"
    }

    fn track(&self, owner: &str, alias: &str) -> Result<Handle> {
        let entity = EntityId::new(owner, alias)?;
        Ok(Box::new(self.file(entity)))
    }

    fn remove(&self, owner: &str, alias: &str) -> Result<()> {
        let file = self.file(EntityId::new(owner, alias)?);
        let _lock = file.lock(false)?;
        if file.read_head()?.is_none() {
            return Err(EngineError::NotTracked(file.entity.clone()));
        }
        // Dropping HEAD untracks the entity before its history is deleted
        fs::remove_file(file.head_path()).map_err(wrap("remove", &file.entity))?;
        fs::remove_dir_all(&file.dir).map_err(wrap("remove", &file.entity))?;
        if let Some(owner_dir) = file.dir.parent() {
            sync_dir(owner_dir).map_err(wrap("remove", &file.entity))?;
        }
        tracing::info!("Removed {} and its history", file.entity);
        Ok(())
    }

    fn summaries(&self, owner: &str, offset: &FixedOffset) -> Result<Vec<FileSummary>> {
        let owner_dir = self.owner_dir(owner);
        let entries = match fs::read_dir(&owner_dir) {
            Ok(entries) => entries,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(EngineError::backend("list files", owner, e)),
        };
        let mut result = Vec::new();
        for entry in entries {
            let entry = entry.map_err(|e| EngineError::backend("list files", owner, e))?;
            // Escaped aliases never start with a dot; the lock directory does
            if entry.file_name().to_string_lossy().starts_with('.') {
                continue;
            }
            let head_path = entry.path().join("HEAD");
            let data = match fs::read(&head_path) {
                Ok(data) => data,
                Err(e) if matches!(e.kind(), ErrorKind::NotFound | ErrorKind::NotADirectory) => {
                    continue;
                }
                Err(e) => return Err(EngineError::backend("list files", owner, e)),
            };
            let head: Head = serde_json::from_slice(&data)
                .map_err(|e| EngineError::backend("list files", owner, e))?;
            result.push(FileSummary::new(
                owner,
                head.alias,
                head.path,
                head.len,
                head.updated_at,
                offset,
            ));
        }
        result.sort_by(|a, b| a.alias.cmp(&b.alias));
        Ok(result)
    }
}

/// Handle to one entity directory
struct LocalFile {
    entity: EntityId,
    dir: PathBuf,
    lock_path: PathBuf,
    /// `HEAD` was replaced and the entity directory has not been synced since
    unsynced: bool,
    closed: bool,
}

impl LocalFile {
    fn head_path(&self) -> PathBuf {
        self.dir.join("HEAD")
    }

    fn record_path(&self, seq: usize) -> PathBuf {
        self.dir.join("commits").join(format!("{}.bin", seq))
    }

    fn object_path(&self, hash: &Fingerprint) -> PathBuf {
        let hex = hash.to_hex();
        self.dir.join("objects").join(&hex[..2]).join(&hex[2..])
    }

    /// Take the entity's exclusive lock; released when the file is dropped
    ///
    /// Without `create`, an entity that has no directory is rejected before
    /// any lock file is made for it.
    fn lock(&self, create: bool) -> Result<File> {
        if !create && !self.dir.exists() {
            return Err(EngineError::NotTracked(self.entity.clone()));
        }
        if let Some(parent) = self.lock_path.parent() {
            create_dirs(parent).map_err(wrap("lock", &self.entity))?;
        }
        let file = OpenOptions::new()
            .create(true)
            .truncate(false)
            .write(true)
            .open(&self.lock_path)
            .map_err(wrap("lock", &self.entity))?;
        file.lock_exclusive().map_err(wrap("lock", &self.entity))?;
        Ok(file)
    }

    fn read_head(&self) -> Result<Option<Head>> {
        match fs::read(self.head_path()) {
            Ok(data) => {
                let head = serde_json::from_slice(&data).map_err(wrap("read HEAD", &self.entity))?;
                Ok(Some(head))
            }
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(None),
            Err(e) => Err(EngineError::backend("read HEAD", &self.entity, e)),
        }
    }

    fn head(&self) -> Result<Head> {
        self.read_head()?
            .ok_or_else(|| EngineError::NotTracked(self.entity.clone()))
    }

    fn load_record(&self, seq: usize) -> Result<CommitRecord> {
        let data = fs::read(self.record_path(seq)).map_err(wrap("read commit", &self.entity))?;
        bincode::deserialize(&data).map_err(wrap("read commit", &self.entity))
    }

    fn load_records(&self, head: &Head) -> Result<Vec<CommitRecord>> {
        (0..head.len).map(|seq| self.load_record(seq)).collect()
    }

    fn load_content(&self, hash: &Fingerprint) -> Result<Vec<u8>> {
        let payload = fs::read(self.object_path(hash)).map_err(wrap("read object", &self.entity))?;
        commit::verify(hash, &payload)
    }

    /// Write via a synced temp file and rename so the target is never half written
    fn write_atomic(&mut self, path: &Path, data: &[u8]) -> Result<()> {
        let parent = path.parent().ok_or_else(|| {
            let layout = BackendError::Layout(format!("{:?} has no parent", path));
            EngineError::backend("write", &self.entity, layout)
        })?;
        create_dirs(parent).map_err(wrap("write", &self.entity))?;
        let tmp = path.with_extension("tmp");
        let mut file = File::create(&tmp).map_err(wrap("write", &self.entity))?;
        file.write_all(data).map_err(wrap("write", &self.entity))?;
        file.sync_all().map_err(wrap("write", &self.entity))?;
        fs::rename(&tmp, path).map_err(wrap("write", &self.entity))?;
        self.closed = false;
        Ok(())
    }

    /// Write a file `HEAD` will reference and make its directory entry durable
    fn write_referenced(&mut self, path: &Path, data: &[u8]) -> Result<()> {
        self.write_atomic(path, data)?;
        if let Some(parent) = path.parent() {
            sync_dir(parent).map_err(wrap("write", &self.entity))?;
        }
        Ok(())
    }

    /// Store a payload unless the object store already has it
    fn store_object(&mut self, commit: &Commit) -> Result<()> {
        let path = self.object_path(commit.fingerprint());
        if path.exists() {
            return Ok(());
        }
        self.write_referenced(&path, commit.payload())
    }

    fn store_record(&mut self, seq: usize, commit: &Commit) -> Result<()> {
        let record = CommitRecord {
            hash: *commit.fingerprint(),
            message: commit.message().to_string(),
            timestamp: commit.timestamp(),
        };
        let data = bincode::serialize(&record).map_err(wrap("write commit", &self.entity))?;
        self.write_referenced(&self.record_path(seq), &data)
    }

    fn save_head(&mut self, head: &Head) -> Result<()> {
        let data = serde_json::to_vec_pretty(head).map_err(wrap("write HEAD", &self.entity))?;
        self.write_atomic(&self.head_path(), &data)?;
        self.unsynced = true;
        Ok(())
    }
}

impl TrackedFile for LocalFile {
    fn entity(&self) -> &EntityId {
        &self.entity
    }

    fn is_tracked(&self) -> Result<bool> {
        Ok(self.read_head()?.is_some())
    }

    fn path(&self) -> Result<String> {
        Ok(self.head()?.path)
    }

    fn current(&self) -> Result<CommitSummary> {
        let head = self.head()?;
        Ok(self.load_record(head.current)?.summary())
    }

    fn current_content(&self) -> Result<Vec<u8>> {
        let current = self.current()?;
        tracing::debug!("Reading current revision {} of {}", current.hash, self.entity);
        self.load_content(&current.hash)
    }

    fn content_at(&self, fingerprint: &Fingerprint) -> Result<Vec<u8>> {
        let head = self.head()?;
        let records = self.load_records(&head)?;
        if !records.iter().any(|r| r.hash == *fingerprint) {
            return Err(EngineError::UnknownRevision {
                entity: self.entity.clone(),
                fingerprint: *fingerprint,
            });
        }
        self.load_content(fingerprint)
    }

    fn history(&self) -> Result<Vec<CommitSummary>> {
        let head = self.head()?;
        let records = self.load_records(&head)?;
        Ok(records.iter().rev().map(CommitRecord::summary).collect())
    }

    fn initialize_with(&mut self, path: &str, commit: Commit) -> Result<CommitSummary> {
        let _lock = self.lock(true)?;
        let len = self.read_head()?.map(|h| h.len).unwrap_or(0);
        history::ensure_untracked(&self.entity, len)?;

        self.store_object(&commit)?;
        self.store_record(0, &commit)?;
        self.save_head(&Head {
            alias: self.entity.alias.clone(),
            path: path.to_string(),
            len: 1,
            current: 0,
            updated_at: commit.timestamp(),
        })?;
        tracing::info!("Initialized {} at {}", self.entity, commit.fingerprint());
        Ok(commit.summary())
    }

    fn append(&mut self, commit: Commit) -> Result<CommitSummary> {
        let _lock = self.lock(false)?;
        let mut head = self.head()?;
        let current = self.load_record(head.current)?;
        history::ensure_changed(&self.entity, &current.hash, commit.fingerprint())?;

        self.store_object(&commit)?;
        self.store_record(head.len, &commit)?;
        head.current = head.len;
        head.len += 1;
        head.updated_at = commit.timestamp();
        self.save_head(&head)?;
        tracing::info!("Committed {} to {}", commit.fingerprint(), self.entity);
        Ok(commit.summary())
    }

    fn checkout(&mut self, fingerprint: &Fingerprint) -> Result<Vec<u8>> {
        let _lock = self.lock(false)?;
        let mut head = self.head()?;
        let records = self.load_records(&head)?;
        let index = records
            .iter()
            .rposition(|r| r.hash == *fingerprint)
            .ok_or_else(|| EngineError::UnknownRevision {
                entity: self.entity.clone(),
                fingerprint: *fingerprint,
            })?;
        let content = self.load_content(fingerprint)?;

        head.current = index;
        head.updated_at = chrono::Utc::now().timestamp();
        self.save_head(&head)?;
        tracing::info!("Checked out {} for {}", fingerprint, self.entity);
        Ok(content)
    }

    fn close(&mut self) -> Result<()> {
        if self.closed {
            return Ok(());
        }
        if self.unsynced {
            match sync_dir(&self.dir) {
                Ok(()) => {}
                // Removed by a later operation
                Err(e) if e.kind() == ErrorKind::NotFound => {}
                Err(e) => return Err(EngineError::backend("close", &self.entity, e)),
            }
            self.unsynced = false;
        }
        self.closed = true;
        Ok(())
    }

    // Records below HEAD.len and objects are immutable, so one HEAD read
    // pins every value returned here to the same revision.
    fn snapshot(&self) -> Result<FileSnapshot> {
        let head = self.head()?;
        let current = self.load_record(head.current)?;
        Ok(FileSnapshot {
            owner: self.entity.owner.clone(),
            alias: self.entity.alias.clone(),
            content: self.load_content(&current.hash)?,
            path: head.path,
            hash: current.hash,
        })
    }

    fn tracking_data(&self) -> Result<TrackingData> {
        let head = self.head()?;
        let records = self.load_records(&head)?;
        let revision = records.get(head.current).map(|r| r.hash).ok_or_else(|| {
            let layout =
                BackendError::Layout(format!("current index {} out of range", head.current));
            EngineError::backend("read tracking data", &self.entity, layout)
        })?;
        Ok(TrackingData {
            path: head.path,
            revision,
            commits: records.iter().rev().map(CommitRecord::summary).collect(),
        })
    }
}
