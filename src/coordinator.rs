//! Check-and-deploy pipeline.
//!
//! Phases: `Idle -> Checking -> {UpToDate, UpdateAvailable} -> BackingUp ->
//! Downloading -> Extracting -> Done`, with `Failed` reachable from every
//! active phase. Deploys are serialized across processes by a lock file in
//! the staging directory.

use std::{
    fmt,
    fs::{self, OpenOptions},
    io::{self, Write},
    path::{Path, PathBuf},
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
};

use crate::archive::{
    local_now, purge_downloads, snapshot_filename, ArchiveExtractor, BackupArchiver,
};
use crate::commit::{is_update_available, CommitRecord};
use crate::config::{InstallLayout, OriginConfig};
use crate::error::{IoContext, Result, UpdateError};
use crate::remote::{RemoteRepository, SnapshotInfo};
use crate::storage::VersionStore;

const LOCK_FILE: &str = ".deploy.lock";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UpdatePhase {
    Idle,
    Checking,
    UpToDate,
    UpdateAvailable,
    BackingUp,
    Downloading,
    Extracting,
    Done,
    Failed,
}

impl fmt::Display for UpdatePhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            UpdatePhase::Idle => "idle",
            UpdatePhase::Checking => "checking",
            UpdatePhase::UpToDate => "up-to-date",
            UpdatePhase::UpdateAvailable => "update-available",
            UpdatePhase::BackingUp => "backing-up",
            UpdatePhase::Downloading => "downloading",
            UpdatePhase::Extracting => "extracting",
            UpdatePhase::Done => "done",
            UpdatePhase::Failed => "failed",
        };
        write!(f, "{}", name)
    }
}

/// Result of comparing the remote branch with the applied commit
#[derive(Debug, Clone)]
pub struct UpdateCheck {
    /// `None` when the remote branch has no commits
    pub latest: Option<CommitRecord>,
    pub baseline: CommitRecord,
}

impl UpdateCheck {
    pub fn is_update_available(&self) -> bool {
        self.latest
            .as_ref()
            .is_some_and(|latest| is_update_available(latest, &self.baseline))
    }
}

/// What a successful deploy did
#[derive(Debug, Clone)]
pub struct DeployReport {
    pub commit: CommitRecord,
    pub backup_path: PathBuf,
    pub snapshot: SnapshotInfo,
    pub members_extracted: usize,
}

/// Orchestrates check -> backup -> download -> extract -> record
pub struct UpdateCoordinator<R, V> {
    remote: R,
    store: V,
    layout: InstallLayout,
    branch_type: String,
    phase: UpdatePhase,
    cancel: Arc<AtomicBool>,
}

impl<R: RemoteRepository, V: VersionStore> UpdateCoordinator<R, V> {
    pub fn new(remote: R, store: V, layout: InstallLayout) -> Self {
        Self {
            remote,
            store,
            layout,
            branch_type: "master".to_string(),
            phase: UpdatePhase::Idle,
            cancel: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Track `branch_type` from the origin's branch map instead of "master"
    pub fn with_branch_type(mut self, branch_type: impl Into<String>) -> Self {
        self.branch_type = branch_type.into();
        self
    }

    pub fn phase(&self) -> UpdatePhase {
        self.phase
    }

    /// Setting this flag stops a deploy before its next phase or archive member
    pub fn cancel_flag(&self) -> Arc<AtomicBool> {
        Arc::clone(&self.cancel)
    }

    /// The applied commit (the empty sentinel if nothing was deployed yet)
    pub fn baseline(&self) -> Result<CommitRecord> {
        self.store.load()
    }

    pub fn check(&mut self, origin: &OriginConfig) -> Result<UpdateCheck> {
        self.enter(UpdatePhase::Checking);
        let result = self.resolve(origin);
        match &result {
            Ok(check) if check.is_update_available() => self.enter(UpdatePhase::UpdateAvailable),
            Ok(_) => self.enter(UpdatePhase::UpToDate),
            Err(e) => self.fail(e),
        }
        result
    }

    /// True iff the latest remote commit is strictly newer than the applied one
    pub fn check_for_updates(&mut self, origin: &OriginConfig) -> Result<bool> {
        Ok(self.check(origin)?.is_update_available())
    }

    /// Back up the installation, download the latest snapshot, extract it
    /// over the installation and record the deployed commit.
    ///
    /// Deploys unconditionally; callers gate on [`Self::check_for_updates`].
    /// A failure aborts the remaining steps without rolling back; the backup
    /// path is logged as soon as it exists.
    pub fn deploy_update(&mut self, origin: &OriginConfig) -> Result<DeployReport> {
        let result = self.run_deploy(origin);
        if let Err(e) = &result {
            self.fail(e);
        }
        result
    }

    /// Remove staged snapshot downloads
    pub fn purge_downloads(&self) -> Result<Vec<PathBuf>> {
        purge_downloads(self.layout.staging_dir())
    }

    fn resolve(&self, origin: &OriginConfig) -> Result<UpdateCheck> {
        let branch = origin.branch(&self.branch_type)?;
        let baseline = self.store.load()?;
        let latest = self.remote.latest_commit(&origin.user, &origin.repo, branch)?;

        match &latest {
            Some(latest) => tracing::info!(
                "Latest {}/{}@{}: {} (applied: {})",
                origin.user,
                origin.repo,
                branch,
                latest,
                baseline
            ),
            None => tracing::warn!("{}/{}@{} has no commits", origin.user, origin.repo, branch),
        }

        Ok(UpdateCheck { latest, baseline })
    }

    fn run_deploy(&mut self, origin: &OriginConfig) -> Result<DeployReport> {
        let staging_dir = self.layout.staging_dir().to_path_buf();
        fs::create_dir_all(&staging_dir)
            .fs_context(|| format!("Failed to create staging directory {:?}", staging_dir))?;
        let _lock = DeployLock::acquire(&staging_dir)?;

        self.enter(UpdatePhase::Checking);
        let branch = origin.branch(&self.branch_type)?.to_string();
        let commit = self
            .remote
            .latest_commit(&origin.user, &origin.repo, &branch)?
            .ok_or_else(|| UpdateError::EmptyBranch(branch.clone()))?;
        self.enter(UpdatePhase::UpdateAvailable);

        // 1. Backup must be complete before anything is overwritten
        self.checkpoint(UpdatePhase::BackingUp)?;
        let archiver = BackupArchiver::new(
            self.layout.backup_dir(),
            &staging_dir,
            self.layout.canonical_root(),
        );
        let backup_path = archiver.create_backup(self.layout.install_root())?;
        tracing::info!("Backup written to {:?}", backup_path);

        // 2. Download pinned to the resolved commit so the recorded version
        //    matches the extracted tree even if the branch moves meanwhile
        self.checkpoint(UpdatePhase::Downloading)?;
        let dest = staging_dir.join(snapshot_filename(local_now()));
        let snapshot = self
            .remote
            .fetch_snapshot(&origin.user, &origin.repo, commit.id(), &dest)?;

        // 3. Extract
        self.checkpoint(UpdatePhase::Extracting)?;
        let extractor = ArchiveExtractor::new(self.layout.canonical_root())
            .with_cancel_flag(Arc::clone(&self.cancel));
        let summary = extractor.extract(
            &snapshot.path,
            self.layout.extract_root(),
            &origin.user,
            &origin.repo,
        )?;

        // 4. Record
        self.store.save(&commit)?;
        self.enter(UpdatePhase::Done);

        Ok(DeployReport {
            commit,
            backup_path,
            snapshot,
            members_extracted: summary.members,
        })
    }

    /// Enter `phase` unless cancellation was requested
    fn checkpoint(&mut self, phase: UpdatePhase) -> Result<()> {
        if self.cancel.load(Ordering::SeqCst) {
            tracing::warn!("Deploy cancelled before {}", phase);
            return Err(UpdateError::Cancelled);
        }
        self.enter(phase);
        Ok(())
    }

    fn enter(&mut self, phase: UpdatePhase) {
        tracing::debug!("{} -> {}", self.phase, phase);
        self.phase = phase;
    }

    fn fail(&mut self, error: &UpdateError) {
        tracing::error!("Update failed while {}: {}", self.phase, error);
        self.phase = UpdatePhase::Failed;
    }
}

/// Exclusive deploy lock, released on drop.
///
/// A crashed deploy leaves the file behind; it has to be removed by hand.
struct DeployLock {
    path: PathBuf,
}

impl DeployLock {
    fn acquire(dir: &Path) -> Result<Self> {
        let path = dir.join(LOCK_FILE);
        let mut file = match OpenOptions::new().write(true).create_new(true).open(&path) {
            Ok(file) => file,
            Err(e) if e.kind() == io::ErrorKind::AlreadyExists => {
                return Err(UpdateError::DeployInProgress(path));
            }
            Err(e) => {
                return Err(UpdateError::Filesystem {
                    context: format!("Failed to create lock {:?}", path),
                    source: e,
                })
            }
        };
        let lock = Self { path };
        writeln!(file, "{}", std::process::id())
            .fs_context(|| format!("Failed to write lock {:?}", lock.path))?;
        Ok(lock)
    }
}

impl Drop for DeployLock {
    fn drop(&mut self) {
        if let Err(e) = fs::remove_file(&self.path) {
            tracing::warn!("Failed to release deploy lock {:?}: {}", self.path, e);
        }
    }
}
