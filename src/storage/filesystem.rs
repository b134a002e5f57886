use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};

use tempfile::NamedTempFile;

use super::traits::VersionStore;
use super::state::VersionState;
use crate::commit::CommitRecord;
use crate::error::{IoContext, Result, UpdateError};

/// Version store backed by a single JSON file
pub struct FileVersionStore {
    path: PathBuf,
}

impl FileVersionStore {
    /// Create a store for the given version-state file
    pub fn new<P: AsRef<Path>>(path: P) -> Self {
        FileVersionStore {
            path: path.as_ref().to_path_buf(),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn parent_dir(&self) -> PathBuf {
        match self.path.parent() {
            Some(parent) if !parent.as_os_str().is_empty() => parent.to_path_buf(),
            _ => PathBuf::from("."),
        }
    }
}

impl VersionStore for FileVersionStore {
    fn load(&self) -> Result<CommitRecord> {
        if !self.path.is_file() {
            tracing::debug!("No version state at {:?}, using empty baseline", self.path);
            return Ok(CommitRecord::empty());
        }

        let content = fs::read_to_string(&self.path)
            .fs_context(|| format!("Failed to read version state {:?}", self.path))?;
        let state: VersionState = serde_json::from_str(&content).map_err(|e| {
            UpdateError::Format(format!("invalid version state {:?}: {}", self.path, e))
        })?;

        state.into_commit()
    }

    fn save(&self, commit: &CommitRecord) -> Result<()> {
        let dir = self.parent_dir();
        fs::create_dir_all(&dir)
            .fs_context(|| format!("Failed to create directory {:?}", dir))?;

        let json = serde_json::to_string_pretty(&VersionState::from(commit))
            .map_err(|e| UpdateError::Format(format!("cannot serialize version state: {}", e)))?;

        // 1. Write to a temp file in the same directory (removed on drop if we bail)
        let mut temp = NamedTempFile::new_in(&dir)
            .fs_context(|| format!("Failed to create temp file in {:?}", dir))?;
        temp.write_all(json.as_bytes())
            .fs_context(|| format!("Failed to write {:?}", temp.path()))?;
        temp.flush()
            .fs_context(|| format!("Failed to flush {:?}", temp.path()))?;
        temp.as_file()
            .sync_all()
            .fs_context(|| format!("Failed to sync {:?}", temp.path()))?;

        // 2. Atomic rename (atomic on POSIX systems)
        temp.persist(&self.path).map_err(|e| UpdateError::Filesystem {
            context: format!("Failed to replace {:?}", self.path),
            source: e.error,
        })?;

        tracing::info!("Recorded applied commit {} in {:?}", commit.id(), self.path);
        Ok(())
    }
}
