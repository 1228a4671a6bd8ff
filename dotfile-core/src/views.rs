//! Read-only projections handed to display layers

use crate::commit::CommitSummary;
use crate::fingerprint::Fingerprint;
use chrono::{DateTime, FixedOffset};
use serde::{Deserialize, Serialize};

/// Display format for summary timestamps
pub const TIME_FORMAT: &str = "%B %-d, %Y %-I:%M%P";

/// Current content of a tracked file together with its identity
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct FileSnapshot {
    pub owner: String,
    pub alias: String,
    pub path: String,
    pub hash: Fingerprint,
    #[serde(serialize_with = "serialize_lossy")]
    pub content: Vec<u8>,
}

impl FileSnapshot {
    /// Content as text, replacing invalid UTF-8
    pub fn text(&self) -> String {
        String::from_utf8_lossy(&self.content).into_owned()
    }
}

fn serialize_lossy<S: serde::Serializer>(content: &[u8], serializer: S) -> Result<S::Ok, S::Error> {
    serializer.serialize_str(&String::from_utf8_lossy(content))
}

/// One row of an owner's file listing
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct FileSummary {
    pub owner: String,
    pub alias: String,
    pub path: String,
    pub num_commits: usize,
    pub updated_at: String,
}

impl FileSummary {
    pub fn new(
        owner: &str,
        alias: String,
        path: String,
        num_commits: usize,
        updated_at: i64,
        offset: &FixedOffset,
    ) -> Self {
        Self {
            owner: owner.to_string(),
            alias,
            path,
            num_commits,
            updated_at: format_time(updated_at, offset),
        }
    }
}

/// Render a Unix timestamp in the caller's timezone
pub fn format_time(timestamp: i64, offset: &FixedOffset) -> String {
    DateTime::from_timestamp(timestamp, 0)
        .unwrap_or_default()
        .with_timezone(offset)
        .format(TIME_FORMAT)
        .to_string()
}

/// Machine-readable tracking record of one file
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TrackingData {
    pub path: String,
    pub revision: Fingerprint,
    pub commits: Vec<CommitSummary>,
}
