use std::{
    fs,
    io,
    path::{Component, Path, PathBuf},
};

use chrono::NaiveDateTime;
use flate2::{write::GzEncoder, Compression};
use tempfile::NamedTempFile;
use walkdir::WalkDir;

use super::naming::{backup_filename, is_snapshot_filename, local_now};
use crate::error::{IoContext, Result, UpdateError};

/// Directories that belong to a build rather than the installation
const BUILD_DIR: &str = "build";
/// Version-control metadata directories
const VCS_DIRS: &[&str] = &[".git", ".hg", ".svn", ".bzr"];
/// Compiled artifacts that are regenerated on demand
const COMPILED_EXTENSIONS: &[&str] = &["pyc", "pyo", "o", "obj", "class"];

/// Decides which paths stay out of a backup.
///
/// Purely lexical: nothing is looked up on disk, so the answer for a path
/// never depends on whether it exists.
#[derive(Debug, Clone)]
pub struct ExclusionPolicy {
    excluded_dirs: Vec<PathBuf>,
}

impl ExclusionPolicy {
    pub fn new(backup_dir: impl Into<PathBuf>, staging_dir: impl Into<PathBuf>) -> Self {
        Self {
            excluded_dirs: vec![backup_dir.into(), staging_dir.into()],
        }
    }

    /// The same policy with excluded directories expressed relative to
    /// `root`, for matching paths relative to `root`
    pub fn relative_to(&self, root: &Path) -> Self {
        let excluded_dirs = self
            .excluded_dirs
            .iter()
            .map(|dir| {
                dir.strip_prefix(root)
                    .map(Path::to_path_buf)
                    .unwrap_or_else(|_| dir.clone())
            })
            .filter(|dir| !dir.as_os_str().is_empty())
            .collect();
        Self { excluded_dirs }
    }

    pub fn is_excluded(&self, path: &Path) -> bool {
        if self.excluded_dirs.iter().any(|dir| path.starts_with(dir)) {
            return true;
        }

        let excluded_segment = path.components().any(|c| match c {
            Component::Normal(name) => name
                .to_str()
                .is_some_and(|n| n == BUILD_DIR || VCS_DIRS.contains(&n)),
            _ => false,
        });
        if excluded_segment {
            return true;
        }

        path.extension()
            .and_then(|ext| ext.to_str())
            .is_some_and(|ext| COMPILED_EXTENSIONS.contains(&ext))
    }
}

/// Writes exclusion-filtered gzip tar backups of the installation tree
pub struct BackupArchiver {
    backup_dir: PathBuf,
    policy: ExclusionPolicy,
    canonical_root: String,
}

impl BackupArchiver {
    /// Backups go to `backup_dir`; members are stored under `canonical_root`
    /// so a backup has the same layout as an extracted snapshot.
    pub fn new(
        backup_dir: impl Into<PathBuf>,
        staging_dir: impl Into<PathBuf>,
        canonical_root: impl Into<String>,
    ) -> Self {
        let backup_dir = backup_dir.into();
        Self {
            policy: ExclusionPolicy::new(backup_dir.clone(), staging_dir),
            backup_dir,
            canonical_root: canonical_root.into(),
        }
    }

    pub fn create_backup(&self, root: &Path) -> Result<PathBuf> {
        self.create_backup_at(root, local_now())
    }

    /// Archive everything under `root` into `backup_<timestamp>.tar.gz`.
    ///
    /// The archive is synced and renamed into place before this returns, so
    /// a returned path always names a complete backup.
    pub fn create_backup_at(&self, root: &Path, at: NaiveDateTime) -> Result<PathBuf> {
        if !root.is_dir() {
            return Err(UpdateError::Filesystem {
                context: format!("Cannot back up {:?}", root),
                source: io::Error::new(io::ErrorKind::NotFound, "installation root is missing"),
            });
        }

        fs::create_dir_all(&self.backup_dir)
            .fs_context(|| format!("Failed to create backup directory {:?}", self.backup_dir))?;
        let target = self.backup_dir.join(backup_filename(at));
        tracing::info!("Backing up {:?} to {:?}", root, target);

        let temp = NamedTempFile::new_in(&self.backup_dir)
            .fs_context(|| format!("Failed to create temp file in {:?}", self.backup_dir))?;
        let mut builder = tar::Builder::new(GzEncoder::new(temp.as_file(), Compression::default()));
        builder.follow_symlinks(false);

        let policy = self.policy.relative_to(root);
        let walker = WalkDir::new(root)
            .follow_links(false)
            .sort_by_file_name()
            .into_iter()
            .filter_entry(|entry| {
                let relative = entry.path().strip_prefix(root).unwrap_or(entry.path());
                relative.as_os_str().is_empty() || !policy.is_excluded(relative)
            });

        let mut files = 0usize;
        for entry in walker {
            let entry = entry.map_err(|e| UpdateError::Filesystem {
                context: format!("Failed to walk {:?}", root),
                source: io::Error::from(e),
            })?;
            let relative = entry.path().strip_prefix(root).unwrap_or(entry.path());
            let name = Path::new(&self.canonical_root).join(relative);

            builder
                .append_path_with_name(entry.path(), &name)
                .fs_context(|| format!("Failed to archive {:?}", entry.path()))?;
            if !entry.file_type().is_dir() {
                files += 1;
            }
        }

        let encoder = builder
            .into_inner()
            .fs_context(|| format!("Failed to finish archive {:?}", temp.path()))?;
        encoder
            .finish()
            .fs_context(|| format!("Failed to finish compression {:?}", temp.path()))?;
        temp.as_file()
            .sync_all()
            .fs_context(|| format!("Failed to sync {:?}", temp.path()))?;
        temp.persist(&target).map_err(|e| UpdateError::Filesystem {
            context: format!("Failed to move backup into {:?}", target),
            source: e.error,
        })?;

        tracing::info!("Backup complete: {} entries in {:?}", files, target);
        Ok(target)
    }
}

/// Delete staged snapshot downloads (`tarball_<timestamp>.tar.gz`) from
/// `staging_dir`. Anything else in the directory is left alone.
pub fn purge_downloads(staging_dir: &Path) -> Result<Vec<PathBuf>> {
    if !staging_dir.is_dir() {
        return Ok(Vec::new());
    }

    let mut removed = Vec::new();
    let entries = fs::read_dir(staging_dir)
        .fs_context(|| format!("Failed to list {:?}", staging_dir))?;
    for entry in entries {
        let entry = entry.fs_context(|| format!("Failed to list {:?}", staging_dir))?;
        let is_file = entry.file_type().map(|t| t.is_file()).unwrap_or(false);
        let matches = entry.file_name().to_str().is_some_and(is_snapshot_filename);
        if !(is_file && matches) {
            continue;
        }

        let path = entry.path();
        fs::remove_file(&path).fs_context(|| format!("Failed to remove {:?}", path))?;
        tracing::info!("Removed staged snapshot {:?}", path);
        removed.push(path);
    }

    removed.sort();
    Ok(removed)
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeSet;
    use std::fs::File;

    use chrono::NaiveDate;
    use flate2::read::GzDecoder;
    use tempfile::TempDir;

    use super::*;

    fn fixed() -> NaiveDateTime {
        NaiveDate::from_ymd_opt(2024, 3, 5)
            .unwrap()
            .and_hms_opt(7, 8, 9)
            .unwrap()
    }

    fn archive_names(path: &Path) -> BTreeSet<String> {
        let mut archive = tar::Archive::new(GzDecoder::new(File::open(path).unwrap()));
        archive
            .entries()
            .unwrap()
            .map(|e| {
                e.unwrap()
                    .path()
                    .unwrap()
                    .to_string_lossy()
                    .trim_end_matches('/')
                    .to_string()
            })
            .collect()
    }

    fn write(root: &Path, rel: &str, contents: &str) {
        let path = root.join(rel);
        fs::create_dir_all(path.parent().unwrap()).unwrap();
        fs::write(path, contents).unwrap();
    }

    #[test]
    fn test_exclusion_predicate() {
        let policy = ExclusionPolicy::new("/opt/tfutils/backups", "/opt/tfutils/versions");

        assert!(policy.is_excluded(Path::new("/opt/tfutils/backups/x.tar.gz")));
        assert!(policy.is_excluded(Path::new(
            "/opt/tfutils/versions/tarball_2024_03_05_07_08_09.tar.gz"
        )));
        assert!(policy.is_excluded(Path::new("/opt/tfutils/build/out.o")));
        assert!(policy.is_excluded(Path::new("/opt/tfutils/lib/build/artifact.txt")));
        assert!(policy.is_excluded(Path::new("/opt/tfutils/.git/HEAD")));
        assert!(policy.is_excluded(Path::new("/opt/tfutils/.svn/entries")));
        assert!(policy.is_excluded(Path::new("/opt/tfutils/pkg/module.pyc")));
        assert!(policy.is_excluded(Path::new("/opt/tfutils/java/Main.class")));

        assert!(!policy.is_excluded(Path::new("/opt/tfutils/src/main.go")));
        assert!(!policy.is_excluded(Path::new("/opt/tfutils/builder/notes.txt")));
        assert!(!policy.is_excluded(Path::new("/opt/tfutils/backups-old/readme")));
        assert!(!policy.is_excluded(Path::new("/opt/tfutils/src/module.py")));
    }

    #[test]
    fn test_relative_policy() {
        let root = Path::new("/opt/tfutils");
        let policy = ExclusionPolicy::new("/opt/tfutils/backups", "/var/staging").relative_to(root);

        assert!(policy.is_excluded(Path::new("backups/x.tar.gz")));
        assert!(!policy.is_excluded(Path::new("src/main.go")));
        assert!(!policy.is_excluded(Path::new("staging/file")));
    }

    #[test]
    fn test_backup_applies_exclusions() {
        let temp = TempDir::new().unwrap();
        let root = temp.path().join("tfutils");
        write(&root, "src/main.go", "package main");
        write(&root, "README", "readme");
        write(&root, "build/out.o", "obj");
        write(&root, ".git/HEAD", "ref: refs/heads/master");
        write(&root, "pkg/module.pyc", "bytecode");
        write(&root, "backups/backup_2020_01_01_00_00_00.tar.gz", "old backup");
        write(&root, "versions/tarball_2020_01_01_00_00_00.tar.gz", "old snapshot");

        let archiver = BackupArchiver::new(root.join("backups"), root.join("versions"), "tfutils");
        let backup = archiver.create_backup_at(&root, fixed()).unwrap();

        assert_eq!(backup, root.join("backups/backup_2024_03_05_07_08_09.tar.gz"));
        let names = archive_names(&backup);
        let expected: BTreeSet<String> = [
            "tfutils",
            "tfutils/README",
            "tfutils/pkg",
            "tfutils/src",
            "tfutils/src/main.go",
        ]
        .into_iter()
        .map(String::from)
        .collect();
        assert_eq!(names, expected);
    }

    #[test]
    fn test_backup_outside_root_creates_directory() {
        let temp = TempDir::new().unwrap();
        let root = temp.path().join("install");
        write(&root, "bin/tool", "#!/bin/sh");
        let backup_dir = temp.path().join("elsewhere/backups");

        let archiver = BackupArchiver::new(&backup_dir, root.join("versions"), "install");
        let backup = archiver.create_backup(&root).unwrap();

        assert!(backup.starts_with(&backup_dir));
        let name = backup.file_name().unwrap().to_str().unwrap();
        assert!(crate::archive::naming::is_backup_filename(name));
        assert!(archive_names(&backup).contains("install/bin/tool"));
    }

    #[test]
    fn test_backup_missing_root() {
        let temp = TempDir::new().unwrap();
        let archiver = BackupArchiver::new(temp.path().join("b"), temp.path().join("s"), "x");
        let err = archiver.create_backup(&temp.path().join("missing")).unwrap_err();
        assert!(matches!(err, UpdateError::Filesystem { .. }));
    }

    #[test]
    fn test_purge_downloads_is_targeted() {
        let temp = TempDir::new().unwrap();
        let staging = temp.path();
        write(staging, "tarball_2024_03_05_07_08_09.tar.gz", "a");
        write(staging, "tarball_2024_03_06_07_08_09.tar.gz", "b");
        write(staging, "origin.json", "{}");
        write(staging, "versioninfo.json", "{}");
        write(staging, "tarball_latest.tar.gz", "c");
        write(staging, "backup_2024_03_05_07_08_09.tar.gz", "d");
        fs::create_dir(staging.join("tarball_2024_03_07_07_08_09.tar.gz")).unwrap();

        let removed = purge_downloads(staging).unwrap();
        assert_eq!(
            removed,
            vec![
                staging.join("tarball_2024_03_05_07_08_09.tar.gz"),
                staging.join("tarball_2024_03_06_07_08_09.tar.gz"),
            ]
        );

        assert!(staging.join("origin.json").exists());
        assert!(staging.join("versioninfo.json").exists());
        assert!(staging.join("tarball_latest.tar.gz").exists());
        assert!(staging.join("backup_2024_03_05_07_08_09.tar.gz").exists());
        assert!(staging.join("tarball_2024_03_07_07_08_09.tar.gz").is_dir());
    }

    #[test]
    fn test_purge_missing_directory() {
        let temp = TempDir::new().unwrap();
        assert!(purge_downloads(&temp.path().join("nope")).unwrap().is_empty());
    }
}
