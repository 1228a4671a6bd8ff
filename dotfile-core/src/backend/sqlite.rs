//! SQLite-backed multi-tenant backend
//!
//! Commits are rows in `commits`; each `files` row points to its current commit
//! through `current_commit_id`. The database runs in WAL mode so readers on
//! other connections never block behind a writer.
//!
//! Every handle owns its own connection. The first mutation on a handle starts
//! an immediate transaction, each mutation runs inside a savepoint, and
//! `close` commits. A handle dropped without `close` rolls back.

use crate::commit::{self, Commit, CommitSummary};
use crate::error::{wrap, BackendError, EngineError, EntityId, Result};
use crate::fingerprint::Fingerprint;
use crate::history;
use crate::storage::{build_snapshot, build_tracking_data, Backend, Handle, TrackedFile};
use crate::views::{FileSnapshot, FileSummary, TrackingData};
use chrono::{FixedOffset, Utc};
use rusqlite::{params, Connection, OptionalExtension, Row, TransactionBehavior};
use std::cell::Cell;
use std::path::{Path, PathBuf};
use std::time::Duration;

const SCHEMA: &str = "
CREATE TABLE IF NOT EXISTS users (
    id INTEGER PRIMARY KEY,
    username TEXT NOT NULL UNIQUE,
    created_at INTEGER NOT NULL
);
CREATE TABLE IF NOT EXISTS reserved_usernames (
    username TEXT PRIMARY KEY
) WITHOUT ROWID;
CREATE TABLE IF NOT EXISTS files (
    id INTEGER PRIMARY KEY,
    user_id INTEGER NOT NULL REFERENCES users(id) ON DELETE CASCADE,
    alias TEXT NOT NULL,
    path TEXT NOT NULL,
    current_commit_id INTEGER REFERENCES commits(id),
    created_at INTEGER NOT NULL,
    updated_at INTEGER NOT NULL,
    UNIQUE(user_id, alias)
);
CREATE TABLE IF NOT EXISTS commits (
    id INTEGER PRIMARY KEY,
    file_id INTEGER NOT NULL REFERENCES files(id) ON DELETE CASCADE,
    hash TEXT NOT NULL,
    message TEXT NOT NULL,
    revision BLOB NOT NULL,
    timestamp INTEGER NOT NULL
);
CREATE INDEX IF NOT EXISTS commits_file_hash ON commits(file_id, hash);
";

fn connect(path: &Path) -> rusqlite::Result<Connection> {
    let conn = Connection::open(path)?;
    conn.busy_timeout(Duration::from_secs(5))?;
    conn.pragma_update(None, "journal_mode", "WAL")?;
    conn.pragma_update(None, "foreign_keys", "ON")?;
    Ok(conn)
}

fn parse_hash(hash: &str) -> std::result::Result<Fingerprint, BackendError> {
    Fingerprint::from_hex(hash)
        .map_err(|e| BackendError::Layout(format!("bad commit hash {:?}: {}", hash, e)))
}

/// Typed view of a `files` row
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileRow {
    pub id: i64,
    pub path: String,
    pub current_commit_id: Option<i64>,
    pub updated_at: i64,
}

impl FileRow {
    const COLUMNS: &'static str = "id, path, current_commit_id, updated_at";

    pub fn from_row(row: &Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            id: row.get(0)?,
            path: row.get(1)?,
            current_commit_id: row.get(2)?,
            updated_at: row.get(3)?,
        })
    }
}

/// Typed view of a `commits` row, without its payload
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommitRow {
    pub id: i64,
    pub hash: String,
    pub message: String,
    pub timestamp: i64,
}

impl CommitRow {
    const COLUMNS: &'static str = "commits.id, commits.hash, commits.message, commits.timestamp";

    pub fn from_row(row: &Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            id: row.get(0)?,
            hash: row.get(1)?,
            message: row.get(2)?,
            timestamp: row.get(3)?,
        })
    }

    pub fn summary(&self) -> std::result::Result<CommitSummary, BackendError> {
        Ok(CommitSummary {
            hash: parse_hash(&self.hash)?,
            message: self.message.clone(),
            timestamp: self.timestamp,
        })
    }
}

/// Hosted backend over one SQLite database file
#[derive(Debug, Clone)]
pub struct SqliteBackend {
    path: PathBuf,
}

impl SqliteBackend {
    /// Open the database, creating the schema if it does not exist
    pub fn open(path: &Path) -> Result<Self> {
        let conn = connect(path)
            .map_err(|e| EngineError::backend("open database", path.display(), e))?;
        conn.execute_batch(SCHEMA)
            .map_err(|e| EngineError::backend("create schema", path.display(), e))?;
        tracing::debug!("Opened SQLite store at {:?}", path);
        Ok(Self {
            path: path.to_path_buf(),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn connect(&self, op: &'static str, target: &str) -> Result<Connection> {
        connect(&self.path).map_err(|e| EngineError::backend(op, target, e))
    }

    fn user_id(conn: &Connection, username: &str) -> rusqlite::Result<Option<i64>> {
        conn.query_row("SELECT id FROM users WHERE username = ?1", [username], |r| r.get(0))
            .optional()
    }

    /// Reserve identifiers that owners may not claim
    pub fn seed_reserved<S: AsRef<str>>(&self, names: &[S]) -> Result<()> {
        let mut conn = self.connect("seed reserved names", "reserved_usernames")?;
        let run = |conn: &mut Connection| -> rusqlite::Result<()> {
            let tx = conn.transaction()?;
            for name in names {
                tx.execute(
                    "INSERT OR IGNORE INTO reserved_usernames (username) VALUES (?1)",
                    [name.as_ref()],
                )?;
            }
            tx.commit()
        };
        run(&mut conn)
            .map_err(|e| EngineError::backend("seed reserved names", "reserved_usernames", e))
    }

    pub fn is_reserved(&self, username: &str) -> Result<bool> {
        let conn = self.connect("check reserved name", username)?;
        conn.query_row(
            "SELECT EXISTS(SELECT 1 FROM reserved_usernames WHERE username = ?1)",
            [username],
            |r| r.get(0),
        )
        .map_err(|e| EngineError::backend("check reserved name", username, e))
    }

    /// Create an owner account
    pub fn register_owner(&self, username: &str) -> Result<()> {
        if username.is_empty() {
            return Err(EngineError::InvalidName("username must not be empty".into()));
        }
        if self.is_reserved(username)? {
            return Err(EngineError::InvalidName(format!("username {:?} is reserved", username)));
        }
        let conn = self.connect("register owner", username)?;
        if Self::user_id(&conn, username)
            .map_err(|e| EngineError::backend("register owner", username, e))?
            .is_some()
        {
            return Err(EngineError::InvalidName(format!("username {:?} is taken", username)));
        }
        conn.execute(
            "INSERT INTO users (username, created_at) VALUES (?1, ?2)",
            params![username, Utc::now().timestamp()],
        )
        .map_err(|e| EngineError::backend("register owner", username, e))?;
        tracing::info!("Registered owner {}", username);
        Ok(())
    }

    pub fn owner_exists(&self, username: &str) -> Result<bool> {
        let conn = self.connect("find owner", username)?;
        Ok(Self::user_id(&conn, username)
            .map_err(|e| EngineError::backend("find owner", username, e))?
            .is_some())
    }
}

impl Backend for SqliteBackend {
    fn name(&self) -> &'static str {
        "sqlite"
    }

    fn track(&self, owner: &str, alias: &str) -> Result<Handle> {
        let entity = EntityId::new(owner, alias)?;
        let conn = self.connect("open", &entity.to_string())?;
        let user_id = Self::user_id(&conn, owner)
            .map_err(wrap("open", &entity))?
            .ok_or_else(|| EngineError::NotFound(format!("owner {:?}", owner)))?;
        Ok(Box::new(SqliteFile {
            entity,
            user_id,
            conn,
            in_transaction: false,
            reading: Cell::new(false),
        }))
    }

    fn remove(&self, owner: &str, alias: &str) -> Result<()> {
        let entity = EntityId::new(owner, alias)?;
        let mut conn = self.connect("remove", &entity.to_string())?;
        let tx = conn
            .transaction_with_behavior(TransactionBehavior::Immediate)
            .map_err(wrap("remove", &entity))?;
        let user_id = Self::user_id(&tx, owner)
            .map_err(wrap("remove", &entity))?
            .ok_or_else(|| EngineError::NotFound(format!("owner {:?}", owner)))?;
        // Commits go with the file row through ON DELETE CASCADE
        let deleted = tx
            .execute("DELETE FROM files WHERE user_id = ?1 AND alias = ?2", params![user_id, alias])
            .map_err(wrap("remove", &entity))?;
        if deleted == 0 {
            return Err(EngineError::NotTracked(entity));
        }
        tx.commit().map_err(wrap("remove", &entity))?;
        tracing::info!("Removed {} and its history", entity);
        Ok(())
    }

    fn summaries(&self, owner: &str, offset: &FixedOffset) -> Result<Vec<FileSummary>> {
        let conn = self.connect("list files", owner)?;
        if Self::user_id(&conn, owner)
            .map_err(|e| EngineError::backend("list files", owner, e))?
            .is_none()
        {
            return Err(EngineError::NotFound(format!("owner {:?}", owner)));
        }
        let mut stmt = conn
            .prepare_cached(
                "SELECT files.alias, files.path, COUNT(commits.id), files.updated_at
                 FROM users
                 JOIN files ON files.user_id = users.id
                 LEFT JOIN commits ON commits.file_id = files.id
                 WHERE users.username = ?1
                 GROUP BY files.id
                 ORDER BY files.alias",
            )
            .map_err(|e| EngineError::backend("list files", owner, e))?;
        let rows = stmt
            .query_map([owner], |row| {
                let alias: String = row.get(0)?;
                let path: String = row.get(1)?;
                let count: i64 = row.get(2)?;
                let updated_at: i64 = row.get(3)?;
                Ok((alias, path, count, updated_at))
            })
            .map_err(|e| EngineError::backend("list files", owner, e))?;

        let mut result = Vec::new();
        for row in rows {
            let (alias, path, count, updated_at) =
                row.map_err(|e| EngineError::backend("list files", owner, e))?;
            result.push(FileSummary::new(owner, alias, path, count as usize, updated_at, offset));
        }
        Ok(result)
    }
}

fn file_row(conn: &Connection, user_id: i64, alias: &str) -> rusqlite::Result<Option<FileRow>> {
    conn.query_row(
        &format!("SELECT {} FROM files WHERE user_id = ?1 AND alias = ?2", FileRow::COLUMNS),
        params![user_id, alias],
        FileRow::from_row,
    )
    .optional()
}

fn commit_row(conn: &Connection, commit_id: i64) -> rusqlite::Result<CommitRow> {
    conn.query_row(
        &format!("SELECT {} FROM commits WHERE id = ?1", CommitRow::COLUMNS),
        [commit_id],
        CommitRow::from_row,
    )
}

fn newest_commit_with_hash(
    conn: &Connection,
    file_id: i64,
    hash: &Fingerprint,
) -> rusqlite::Result<Option<CommitRow>> {
    conn.query_row(
        &format!(
            "SELECT {} FROM commits WHERE file_id = ?1 AND hash = ?2 ORDER BY id DESC LIMIT 1",
            CommitRow::COLUMNS
        ),
        params![file_id, hash.to_hex()],
        CommitRow::from_row,
    )
    .optional()
}

fn payload(conn: &Connection, commit_id: i64) -> rusqlite::Result<Vec<u8>> {
    conn.query_row("SELECT revision FROM commits WHERE id = ?1", [commit_id], |r| r.get(0))
}

fn insert_commit(conn: &Connection, file_id: i64, commit: &Commit) -> rusqlite::Result<i64> {
    conn.execute(
        "INSERT INTO commits (file_id, hash, message, revision, timestamp)
         VALUES (?1, ?2, ?3, ?4, ?5)",
        params![
            file_id,
            commit.fingerprint().to_hex(),
            commit.message(),
            commit.payload(),
            commit.timestamp()
        ],
    )?;
    Ok(conn.last_insert_rowid())
}

/// Move the file's pointer and confirm, in the same transaction, that it
/// resolves to a commit with the expected hash
fn point_to(
    conn: &Connection,
    entity: &EntityId,
    op: &'static str,
    file_id: i64,
    commit_id: i64,
    expected: &Fingerprint,
    updated_at: i64,
) -> Result<()> {
    conn.execute(
        "UPDATE files SET current_commit_id = ?1, updated_at = ?2 WHERE id = ?3",
        params![commit_id, updated_at, file_id],
    )
    .map_err(wrap(op, entity))?;
    let hash: String = conn
        .query_row(
            "SELECT commits.hash FROM files
             JOIN commits ON files.current_commit_id = commits.id
             WHERE files.id = ?1",
            [file_id],
            |r| r.get(0),
        )
        .map_err(wrap(op, entity))?;
    let actual = parse_hash(&hash).map_err(wrap(op, entity))?;
    if actual != *expected {
        return Err(EngineError::Integrity {
            expected: *expected,
            actual,
        });
    }
    Ok(())
}

/// Handle to one `files` row
struct SqliteFile {
    entity: EntityId,
    user_id: i64,
    conn: Connection,
    in_transaction: bool,
    reading: Cell<bool>,
}

impl SqliteFile {
    fn file(&self, op: &'static str) -> Result<FileRow> {
        file_row(&self.conn, self.user_id, &self.entity.alias)
            .map_err(wrap(op, &self.entity))?
            .ok_or_else(|| EngineError::NotTracked(self.entity.clone()))
    }

    fn current_row(&self, op: &'static str) -> Result<CommitRow> {
        let file = self.file(op)?;
        let commit_id = file.current_commit_id.ok_or_else(|| {
            let layout = BackendError::Layout("file has no current commit".into());
            EngineError::backend(op, &self.entity, layout)
        })?;
        commit_row(&self.conn, commit_id).map_err(wrap(op, &self.entity))
    }

    fn load_content(&self, op: &'static str, row: &CommitRow) -> Result<Vec<u8>> {
        let hash = parse_hash(&row.hash).map_err(wrap(op, &self.entity))?;
        let payload = payload(&self.conn, row.id).map_err(wrap(op, &self.entity))?;
        commit::verify(&hash, &payload)
    }

    /// Run a read spanning several statements against one snapshot
    fn consistent<T>(&self, op: &'static str, f: impl FnOnce() -> Result<T>) -> Result<T> {
        if self.in_transaction || self.reading.get() {
            return f();
        }
        self.conn.execute_batch("BEGIN DEFERRED").map_err(wrap(op, &self.entity))?;
        self.reading.set(true);
        let result = f();
        self.reading.set(false);
        let ended = self.conn.execute_batch("COMMIT").map_err(wrap(op, &self.entity));
        let value = result?;
        ended?;
        Ok(value)
    }

    /// Run one mutation inside a savepoint of the handle's transaction
    fn mutate<T>(
        &mut self,
        op: &'static str,
        f: impl FnOnce(&Connection, &EntityId, i64) -> Result<T>,
    ) -> Result<T> {
        if !self.in_transaction {
            self.conn
                .execute_batch("BEGIN IMMEDIATE")
                .map_err(wrap(op, &self.entity))?;
            self.in_transaction = true;
        }
        self.conn.execute_batch("SAVEPOINT mutation").map_err(wrap(op, &self.entity))?;
        match f(&self.conn, &self.entity, self.user_id) {
            Ok(value) => {
                self.conn.execute_batch("RELEASE mutation").map_err(wrap(op, &self.entity))?;
                Ok(value)
            }
            Err(e) => {
                let undone = self.conn.execute_batch("ROLLBACK TO mutation; RELEASE mutation");
                if let Err(rollback) = undone {
                    tracing::warn!("Rollback of {} for {} failed: {}", op, self.entity, rollback);
                }
                Err(e)
            }
        }
    }
}

impl TrackedFile for SqliteFile {
    fn entity(&self) -> &EntityId {
        &self.entity
    }

    fn is_tracked(&self) -> Result<bool> {
        Ok(file_row(&self.conn, self.user_id, &self.entity.alias)
            .map_err(wrap("check tracked", &self.entity))?
            .is_some())
    }

    fn path(&self) -> Result<String> {
        Ok(self.file("read path")?.path)
    }

    fn current(&self) -> Result<CommitSummary> {
        self.current_row("read current")?
            .summary()
            .map_err(wrap("read current", &self.entity))
    }

    fn current_content(&self) -> Result<Vec<u8>> {
        self.consistent("read content", || {
            let row = self.current_row("read content")?;
            tracing::debug!("Reading current revision {} of {}", row.hash, self.entity);
            self.load_content("read content", &row)
        })
    }

    fn content_at(&self, fingerprint: &Fingerprint) -> Result<Vec<u8>> {
        self.consistent("read revision", || {
            let file = self.file("read revision")?;
            let row = newest_commit_with_hash(&self.conn, file.id, fingerprint)
                .map_err(wrap("read revision", &self.entity))?
                .ok_or_else(|| EngineError::UnknownRevision {
                    entity: self.entity.clone(),
                    fingerprint: *fingerprint,
                })?;
            self.load_content("read revision", &row)
        })
    }

    fn history(&self) -> Result<Vec<CommitSummary>> {
        let file = self.file("read history")?;
        let mut stmt = self
            .conn
            .prepare_cached(&format!(
                "SELECT {} FROM commits WHERE file_id = ?1 ORDER BY id DESC",
                CommitRow::COLUMNS
            ))
            .map_err(wrap("read history", &self.entity))?;
        let rows = stmt
            .query_map([file.id], CommitRow::from_row)
            .map_err(wrap("read history", &self.entity))?;
        let mut result = Vec::new();
        for row in rows {
            let row = row.map_err(wrap("read history", &self.entity))?;
            result.push(row.summary().map_err(wrap("read history", &self.entity))?);
        }
        Ok(result)
    }

    fn initialize_with(&mut self, path: &str, commit: Commit) -> Result<CommitSummary> {
        let summary = self.mutate("initialize", |conn, entity, user_id| {
            let existing =
                file_row(conn, user_id, &entity.alias).map_err(wrap("initialize", entity))?;
            if existing.is_some() {
                return Err(EngineError::AlreadyTracked(entity.clone()));
            }
            let now = Utc::now().timestamp();
            conn.execute(
                "INSERT INTO files (user_id, alias, path, created_at, updated_at)
                 VALUES (?1, ?2, ?3, ?4, ?5)",
                params![user_id, entity.alias, path, now, commit.timestamp()],
            )
            .map_err(wrap("initialize", entity))?;
            let file_id = conn.last_insert_rowid();
            let commit_id =
                insert_commit(conn, file_id, &commit).map_err(wrap("initialize", entity))?;
            let (hash, timestamp) = (commit.fingerprint(), commit.timestamp());
            point_to(conn, entity, "initialize", file_id, commit_id, hash, timestamp)?;
            Ok(commit.summary())
        })?;
        tracing::info!("Initialized {} at {}", self.entity, summary.hash);
        Ok(summary)
    }

    fn append(&mut self, commit: Commit) -> Result<CommitSummary> {
        let summary = self.mutate("commit", |conn, entity, user_id| {
            let file = file_row(conn, user_id, &entity.alias)
                .map_err(wrap("commit", entity))?
                .ok_or_else(|| EngineError::NotTracked(entity.clone()))?;
            let current_id = file.current_commit_id.ok_or_else(|| {
                let layout = BackendError::Layout("file has no current commit".into());
                EngineError::backend("commit", entity, layout)
            })?;
            let current = commit_row(conn, current_id).map_err(wrap("commit", entity))?;
            let current_hash = parse_hash(&current.hash).map_err(wrap("commit", entity))?;
            history::ensure_changed(entity, &current_hash, commit.fingerprint())?;

            let commit_id = insert_commit(conn, file.id, &commit).map_err(wrap("commit", entity))?;
            let (hash, timestamp) = (commit.fingerprint(), commit.timestamp());
            point_to(conn, entity, "commit", file.id, commit_id, hash, timestamp)?;
            Ok(commit.summary())
        })?;
        tracing::info!("Committed {} to {}", summary.hash, self.entity);
        Ok(summary)
    }

    fn checkout(&mut self, fingerprint: &Fingerprint) -> Result<Vec<u8>> {
        let content = self.mutate("checkout", |conn, entity, user_id| {
            let file = file_row(conn, user_id, &entity.alias)
                .map_err(wrap("checkout", entity))?
                .ok_or_else(|| EngineError::NotTracked(entity.clone()))?;
            let row = newest_commit_with_hash(conn, file.id, fingerprint)
                .map_err(wrap("checkout", entity))?
                .ok_or_else(|| EngineError::UnknownRevision {
                    entity: entity.clone(),
                    fingerprint: *fingerprint,
                })?;
            let stored = payload(conn, row.id).map_err(wrap("checkout", entity))?;
            let content = commit::verify(fingerprint, &stored)?;
            let now = Utc::now().timestamp();
            point_to(conn, entity, "checkout", file.id, row.id, fingerprint, now)?;
            Ok(content)
        })?;
        tracing::info!("Checked out {} for {}", fingerprint, self.entity);
        Ok(content)
    }

    fn close(&mut self) -> Result<()> {
        if !self.in_transaction {
            return Ok(());
        }
        self.conn.execute_batch("COMMIT").map_err(wrap("close", &self.entity))?;
        self.in_transaction = false;
        Ok(())
    }

    fn snapshot(&self) -> Result<FileSnapshot> {
        self.consistent("read snapshot", || build_snapshot(self))
    }

    fn tracking_data(&self) -> Result<TrackingData> {
        self.consistent("read tracking data", || build_tracking_data(self))
    }
}

impl Drop for SqliteFile {
    fn drop(&mut self) {
        if self.in_transaction {
            tracing::warn!("Handle for {} dropped without close, rolling back", self.entity);
            if let Err(e) = self.conn.execute_batch("ROLLBACK") {
                tracing::warn!("Rollback for {} failed: {}", self.entity, e);
            }
        }
    }
}
