use std::path::{Path, PathBuf};

use crate::commit::CommitRecord;
use crate::error::Result;

/// A snapshot archive written to local storage
#[derive(Debug, Clone)]
pub struct SnapshotInfo {
    pub path: PathBuf,
    pub bytes: u64,
    /// Hex-encoded SHA-256 of the archive as received
    pub sha256: String,
}

/// Read-only access to a remote source-control host
pub trait RemoteRepository {
    /// List the commits of `branch`, latest first.
    /// Ties on commit time are broken by id, also descending.
    fn list_commits(&self, user: &str, repo: &str, branch: &str) -> Result<Vec<CommitRecord>>;

    /// Latest commit of `branch`, or `None` if the branch has no commits.
    fn latest_commit(&self, user: &str, repo: &str, branch: &str) -> Result<Option<CommitRecord>> {
        Ok(self.list_commits(user, repo, branch)?.into_iter().next())
    }

    /// Download the snapshot archive of `reference` (branch name or commit id)
    /// to `dest`. Never retries; `dest` only exists if the whole body arrived.
    fn fetch_snapshot(
        &self,
        user: &str,
        repo: &str,
        reference: &str,
        dest: &Path,
    ) -> Result<SnapshotInfo>;
}
