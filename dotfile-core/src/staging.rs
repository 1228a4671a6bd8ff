//! Staging sources: the not-yet-committed content a commit reads from

use crate::commit::CommitSummary;
use crate::error::{EngineError, Result};
use crate::fingerprint::Fingerprint;
use crate::storage::TrackedFile;
use std::fs;
use std::path::PathBuf;

/// Provider of the user's latest edit
pub trait StagingSource {
    /// Tracked path as the user wrote it (`~` is kept unexpanded)
    fn path(&self) -> &str;

    fn read(&self) -> Result<Vec<u8>>;

    /// Bring the source in line with `content` after a successful operation
    fn sync(&mut self, content: &[u8]) -> Result<()>;
}

/// A real file on the local machine
#[derive(Debug, Clone)]
pub struct WorkingFile {
    path: String,
    resolved: PathBuf,
}

impl WorkingFile {
    pub fn new(path: &str) -> Result<Self> {
        let resolved = shellexpand::full(path)
            .map_err(|e| EngineError::Staging {
                path: PathBuf::from(path),
                source: std::io::Error::new(std::io::ErrorKind::InvalidInput, e.to_string()),
            })?
            .into_owned();
        Ok(Self {
            path: path.to_string(),
            resolved: PathBuf::from(resolved),
        })
    }

    /// Expanded location on disk
    pub fn resolved(&self) -> &PathBuf {
        &self.resolved
    }

    fn staging_error(&self, source: std::io::Error) -> EngineError {
        EngineError::Staging {
            path: self.resolved.clone(),
            source,
        }
    }
}

impl StagingSource for WorkingFile {
    fn path(&self) -> &str {
        &self.path
    }

    fn read(&self) -> Result<Vec<u8>> {
        fs::read(&self.resolved).map_err(|e| self.staging_error(e))
    }

    fn sync(&mut self, content: &[u8]) -> Result<()> {
        if let Some(parent) = self.resolved.parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent).map_err(|e| self.staging_error(e))?;
            }
        }
        fs::write(&self.resolved, content).map_err(|e| self.staging_error(e))?;
        tracing::debug!("Wrote {} bytes to {:?}", content.len(), self.resolved);
        Ok(())
    }
}

/// Content uploaded to the hosted service
///
/// Held only for the duration of one request; `sync` drops it.
#[derive(Debug, Clone, Default)]
pub struct UploadedBlob {
    path: String,
    content: Option<Vec<u8>>,
}

impl UploadedBlob {
    pub fn new(path: impl Into<String>, content: Vec<u8>) -> Self {
        Self {
            path: path.into(),
            content: Some(content),
        }
    }

    pub fn is_consumed(&self) -> bool {
        self.content.is_none()
    }
}

impl StagingSource for UploadedBlob {
    fn path(&self) -> &str {
        &self.path
    }

    fn read(&self) -> Result<Vec<u8>> {
        self.content.clone().ok_or_else(|| EngineError::Staging {
            path: PathBuf::from(&self.path),
            source: std::io::Error::new(std::io::ErrorKind::NotFound, "upload already consumed"),
        })
    }

    fn sync(&mut self, _content: &[u8]) -> Result<()> {
        self.content = None;
        Ok(())
    }
}

/// Start tracking the file behind `source`
pub fn init_from(
    file: &mut dyn TrackedFile,
    source: &mut dyn StagingSource,
) -> Result<CommitSummary> {
    let content = source.read()?;
    let summary = file.initialize(source.path(), &content)?;
    source.sync(&content)?;
    Ok(summary)
}

/// Commit the source's content if it differs from the current revision
pub fn commit_from(
    file: &mut dyn TrackedFile,
    source: &mut dyn StagingSource,
    message: &str,
) -> Result<CommitSummary> {
    let content = source.read()?;
    let summary = file.commit(&content, message)?;
    source.sync(&content)?;
    Ok(summary)
}

/// Make `fingerprint` current and write it back to the source
pub fn checkout_into(
    file: &mut dyn TrackedFile,
    source: &mut dyn StagingSource,
    fingerprint: &Fingerprint,
) -> Result<Vec<u8>> {
    let content = file.checkout(fingerprint)?;
    source.sync(&content)?;
    Ok(content)
}

/// Whether the source differs from the current revision
pub fn has_changes(file: &dyn TrackedFile, source: &dyn StagingSource) -> Result<bool> {
    let current = file.current()?;
    Ok(Fingerprint::of(&source.read()?) != current.hash)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::MemoryBackend;
    use crate::storage::Backend;
    use tempfile::TempDir;

    #[test]
    fn test_working_file_cycle() {
        let tmp = TempDir::new().unwrap();
        let target = tmp.path().join("dotfile").join("test-file.txt");
        fs::create_dir_all(target.parent().unwrap()).unwrap();
        fs::write(&target, "Testing content. Stored as a blob.").unwrap();

        let backend = MemoryBackend::new();
        let mut file = backend.track("genericusername", "testalias").unwrap();
        let mut source = WorkingFile::new(target.to_str().unwrap()).unwrap();

        let first = init_from(file.as_mut(), &mut source).unwrap();
        assert!(!has_changes(file.as_ref(), &source).unwrap());

        fs::write(&target, "Testing content. Stored as a blob.\n New content!\n").unwrap();
        assert!(has_changes(file.as_ref(), &source).unwrap());
        commit_from(file.as_mut(), &mut source, "test commit").unwrap();

        let err = commit_from(file.as_mut(), &mut source, "again").unwrap_err();
        assert!(err.is_no_changes());

        checkout_into(file.as_mut(), &mut source, &first.hash).unwrap();
        assert_eq!(fs::read(&target).unwrap(), b"Testing content. Stored as a blob.");
        assert_eq!(file.history().unwrap().len(), 2);
    }

    #[test]
    fn test_missing_working_file() {
        let tmp = TempDir::new().unwrap();
        let source = WorkingFile::new(tmp.path().join("absent").to_str().unwrap()).unwrap();
        assert!(matches!(source.read(), Err(EngineError::Staging { .. })));
    }

    #[test]
    fn test_tilde_is_expanded_but_kept_as_path() {
        let source = WorkingFile::new("~/.bashrc").unwrap();
        assert_eq!(source.path(), "~/.bashrc");
        assert!(!source.resolved().starts_with("~"));
    }

    #[test]
    fn test_uploaded_blob_is_consumed() {
        let backend = MemoryBackend::new();
        let mut file = backend.track("alice", "vimrc").unwrap();
        let mut blob = UploadedBlob::new("~/.vimrc", b"set nu".to_vec());
        init_from(file.as_mut(), &mut blob).unwrap();
        assert!(blob.is_consumed());
        assert_eq!(file.path().unwrap(), "~/.vimrc");
        assert!(blob.read().is_err());
    }
}
