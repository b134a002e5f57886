use serde::{Deserialize, Serialize};

use crate::commit::{parse_commit_date, CommitRecord, COMMIT_DATE_FORMAT};
use crate::error::Result;

/// The persisted form of the applied commit (versioninfo.json)
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
#[serde(deny_unknown_fields)]
pub struct VersionState {
    pub id: String,
    pub message: String,
    /// `YYYY-MM-DDTHH:MM:SS`, optionally followed by a UTC offset
    pub committed_date: String,
}

impl VersionState {
    pub fn into_commit(self) -> Result<CommitRecord> {
        let committed_at = parse_commit_date(&self.committed_date)?;
        Ok(CommitRecord::new(self.id, self.message, committed_at))
    }
}

impl From<&CommitRecord> for VersionState {
    fn from(commit: &CommitRecord) -> Self {
        VersionState {
            id: commit.id().to_string(),
            message: commit.message().to_string(),
            committed_date: commit.committed_at().format(COMMIT_DATE_FORMAT).to_string(),
        }
    }
}
