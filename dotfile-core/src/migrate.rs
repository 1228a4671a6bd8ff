//! Moving a tracked file's history between backends

use crate::codec;
use crate::commit::{Commit, CommitSummary};
use crate::error::Result;
use crate::fingerprint::Fingerprint;
use crate::storage::TrackedFile;

/// Replay every commit of `src` into the empty entity behind `dst`
///
/// Commits keep their fingerprint, message and timestamp. After the replay
/// `dst` points at the same revision `src` does.
pub fn replay(src: &dyn TrackedFile, dst: &mut dyn TrackedFile) -> Result<CommitSummary> {
    let path = src.path()?;
    let current = src.current()?;
    let mut commits = src.history()?;
    commits.reverse();

    let mut replayed: Vec<Fingerprint> = Vec::with_capacity(commits.len());
    for summary in commits {
        let content = src.content_at(&summary.hash)?;
        let hash = summary.hash;
        let payload = codec::compress(&content)?;
        let commit = Commit::from_parts(hash, summary.message, summary.timestamp, payload);
        if replayed.is_empty() {
            dst.initialize_with(&path, commit)?;
        } else {
            // The source committed this after checking out an older revision
            if dst.current()?.hash == hash {
                if let Some(other) = replayed.iter().rev().find(|h| **h != hash) {
                    dst.checkout(other)?;
                }
            }
            dst.append(commit)?;
        }
        replayed.push(hash);
    }

    if dst.current()?.hash != current.hash {
        dst.checkout(&current.hash)?;
    }
    tracing::info!(
        "Replayed {} commits of {} into {}",
        replayed.len(),
        src.entity(),
        dst.entity()
    );
    dst.current()
}
