//! Commit model
//!
//! A commit is an immutable snapshot of one tracked file: the fingerprint of
//! its content, a message, a timestamp and the compressed content itself.

use crate::codec;
use crate::error::{EngineError, Result};
use crate::fingerprint::Fingerprint;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Message recorded on the commit created by Initialize
pub const INITIAL_MESSAGE: &str = "Initial commit";

/// Immutable revision of a tracked file
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Commit {
    fingerprint: Fingerprint,
    message: String,
    timestamp: i64,
    payload: Vec<u8>,
}

impl Commit {
    /// Snapshot `content` with the current time
    pub fn new(content: &[u8], message: &str) -> Result<Self> {
        Ok(Self {
            fingerprint: Fingerprint::of(content),
            message: message.to_string(),
            timestamp: Utc::now().timestamp(),
            payload: codec::compress(content)?,
        })
    }

    /// Rebuild a stored commit; the payload is checked lazily on read
    pub fn from_parts(
        fingerprint: Fingerprint,
        message: String,
        timestamp: i64,
        payload: Vec<u8>,
    ) -> Self {
        Self {
            fingerprint,
            message,
            timestamp,
            payload,
        }
    }

    pub fn fingerprint(&self) -> &Fingerprint {
        &self.fingerprint
    }

    pub fn message(&self) -> &str {
        &self.message
    }

    /// Commit timestamp (Unix seconds)
    pub fn timestamp(&self) -> i64 {
        self.timestamp
    }

    pub fn time(&self) -> DateTime<Utc> {
        DateTime::from_timestamp(self.timestamp, 0).unwrap_or_default()
    }

    /// Compressed content as stored by backends
    pub fn payload(&self) -> &[u8] {
        &self.payload
    }

    /// Decompress and check the content against the fingerprint
    pub fn verified_content(&self) -> Result<Vec<u8>> {
        verify(&self.fingerprint, &self.payload)
    }

    pub fn summary(&self) -> CommitSummary {
        CommitSummary {
            hash: self.fingerprint,
            message: self.message.clone(),
            timestamp: self.timestamp,
        }
    }
}

/// Decompress `payload` and require that it hashes to `expected`
pub fn verify(expected: &Fingerprint, payload: &[u8]) -> Result<Vec<u8>> {
    let content = codec::decompress(payload)?;
    let actual = Fingerprint::of(&content);
    if actual != *expected {
        return Err(EngineError::Integrity {
            expected: *expected,
            actual,
        });
    }
    Ok(content)
}

/// Commit metadata without its payload
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CommitSummary {
    pub hash: Fingerprint,
    pub message: String,
    pub timestamp: i64,
}

impl CommitSummary {
    pub fn time(&self) -> DateTime<Utc> {
        DateTime::from_timestamp(self.timestamp, 0).unwrap_or_default()
    }
}
