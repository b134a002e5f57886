use crate::commit::CommitRecord;
use crate::error::Result;

/// Persistence for the commit currently applied to the installation.
pub trait VersionStore {
    /// Read the applied commit.
    /// Returns the sentinel empty commit if nothing has been recorded yet;
    /// an existing but unparseable record is an error.
    fn load(&self) -> Result<CommitRecord>;

    /// Atomically replace the applied commit.
    /// Implementations must never expose a half-written record to readers
    /// (temp file + rename or equivalent).
    fn save(&self, commit: &CommitRecord) -> Result<()>;
}
