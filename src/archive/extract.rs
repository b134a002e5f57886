use std::{
    ffi::OsStr,
    fs::{self, File},
    io::{BufReader, Read},
    path::{Component, Path, PathBuf},
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
};

use flate2::read::GzDecoder;
use tar::{Archive, Entry, EntryType};

use crate::error::{IoContext, Result, UpdateError};

/// Outcome of an extraction
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ExtractSummary {
    /// Files, directories and links written
    pub members: usize,
    /// Metadata entries and special files that were not written
    pub skipped: usize,
}

/// Unpacks a gzip tar snapshot, renaming its per-download top-level
/// directory (`<user>-<repo>-<sha>`) to a fixed canonical root.
pub struct ArchiveExtractor {
    canonical_root: String,
    cancel: Option<Arc<AtomicBool>>,
}

impl ArchiveExtractor {
    pub fn new(canonical_root: impl Into<String>) -> Self {
        Self {
            canonical_root: canonical_root.into(),
            cancel: None,
        }
    }

    /// Stop between members once `flag` is set
    pub fn with_cancel_flag(mut self, flag: Arc<AtomicBool>) -> Self {
        self.cancel = Some(flag);
        self
    }

    /// Extract `archive_path` into `destination_root/<canonical_root>`.
    ///
    /// Every member path is validated before anything is written for it:
    /// absolute paths, `..` components, members that do not start with the
    /// snapshot's top-level directory, and paths or links that resolve outside
    /// the canonical root (following links already on disk) abort the
    /// extraction with an archive error. Members already written stay in place.
    pub fn extract(
        &self,
        archive_path: &Path,
        destination_root: &Path,
        user: &str,
        repo: &str,
    ) -> Result<ExtractSummary> {
        tracing::info!(
            "Extracting {:?} into {:?} as {}/",
            archive_path,
            destination_root,
            self.canonical_root
        );

        let file = File::open(archive_path)
            .map_err(|e| UpdateError::Archive(format!("cannot open {:?}: {}", archive_path, e)))?;
        fs::create_dir_all(destination_root)
            .fs_context(|| format!("Failed to create directory {:?}", destination_root))?;
        let resolved_root = fs::canonicalize(destination_root)
            .fs_context(|| format!("Failed to resolve {:?}", destination_root))?;

        let mut archive = Archive::new(GzDecoder::new(BufReader::new(file)));
        let entries = archive
            .entries()
            .map_err(|e| UpdateError::Archive(format!("cannot read {:?}: {}", archive_path, e)))?;

        let mut summary = ExtractSummary::default();
        for entry in entries {
            if self.is_cancelled() {
                tracing::warn!("Extraction cancelled after {} members", summary.members);
                return Err(UpdateError::Cancelled);
            }

            let mut entry = entry.map_err(|e| {
                UpdateError::Archive(format!("malformed member in {:?}: {}", archive_path, e))
            })?;
            if self.unpack_member(&mut entry, &resolved_root, user, repo)? {
                summary.members += 1;
            } else {
                summary.skipped += 1;
            }
        }

        tracing::info!(
            "Extracted {} members ({} skipped)",
            summary.members,
            summary.skipped
        );
        Ok(summary)
    }

    fn is_cancelled(&self) -> bool {
        self.cancel
            .as_ref()
            .is_some_and(|flag| flag.load(Ordering::SeqCst))
    }

    /// Returns false when the member was skipped
    fn unpack_member<R: Read>(
        &self,
        entry: &mut Entry<'_, R>,
        destination_root: &Path,
        user: &str,
        repo: &str,
    ) -> Result<bool> {
        let entry_type = entry.header().entry_type();
        if entry_type.is_pax_global_extensions() {
            return Ok(false);
        }

        let raw = entry
            .path()
            .map_err(|e| UpdateError::Archive(format!("unreadable member path: {}", e)))?
            .into_owned();
        check_member_path(&raw)?;

        let relative = rewrite_member_path(&raw, user, repo, &self.canonical_root);
        if relative.as_os_str().is_empty() {
            return Ok(false);
        }
        self.check_snapshot_root(&raw, &relative)?;
        let snapshot_root = destination_root.join(&self.canonical_root);
        let dst = destination_root.join(&relative);
        tracing::debug!("{:?} -> {:?}", raw, dst);

        if entry_type.is_dir() {
            resolve_within(&snapshot_root, &dst)?;
            fs::create_dir_all(&dst)
                .fs_context(|| format!("Failed to create directory {:?}", dst))?;
            return Ok(true);
        }

        let parent = dst.parent().unwrap_or(destination_root);
        let resolved_parent = resolve_within(&snapshot_root, parent)?;
        fs::create_dir_all(parent)
            .fs_context(|| format!("Failed to create directory {:?}", parent))?;

        match entry_type {
            EntryType::Symlink => {
                let target = link_target(entry, &raw)?;
                if link_escapes(&snapshot_root, &resolved_parent, &target) {
                    return Err(UpdateError::Archive(format!(
                        "symlink {:?} -> {:?} escapes the destination",
                        raw, target
                    )));
                }
                remove_existing(&dst)?;
                entry
                    .unpack(&dst)
                    .map_err(|e| UpdateError::Archive(format!("cannot unpack {:?}: {}", raw, e)))?;
                // Targets routed through other links are only known once resolved
                if let Ok(resolved) = fs::canonicalize(&dst) {
                    if !resolved.starts_with(&snapshot_root) {
                        remove_existing(&dst)?;
                        return Err(UpdateError::Archive(format!(
                            "symlink {:?} resolves outside the destination to {:?}",
                            raw, resolved
                        )));
                    }
                }
            }
            EntryType::Link => {
                // Hard link targets name another member of the same archive
                let target = link_target(entry, &raw)?;
                check_member_path(&target)?;
                let target = rewrite_member_path(&target, user, repo, &self.canonical_root);
                self.check_snapshot_root(&raw, &target)?;
                let source = destination_root.join(&target);
                let resolved = fs::canonicalize(&source).map_err(|e| {
                    UpdateError::Archive(format!("hard link {:?} -> {:?}: {}", raw, target, e))
                })?;
                if !resolved.starts_with(&snapshot_root) {
                    return Err(UpdateError::Archive(format!(
                        "hard link {:?} -> {:?} resolves outside the destination",
                        raw, target
                    )));
                }
                remove_existing(&dst)?;
                fs::hard_link(&resolved, &dst)
                    .fs_context(|| format!("Failed to link {:?} to {:?}", dst, resolved))?;
            }
            EntryType::Regular | EntryType::Continuous | EntryType::GNUSparse => {
                // Never write through a link left by a previous install
                remove_existing(&dst)?;
                entry
                    .unpack(&dst)
                    .map_err(|e| UpdateError::Archive(format!("cannot unpack {:?}: {}", raw, e)))?;
            }
            other => {
                tracing::warn!("Skipping {:?} member {:?}", other, raw);
                return Ok(false);
            }
        }

        Ok(true)
    }

    /// Members must land under the canonical root once rewritten
    fn check_snapshot_root(&self, raw: &Path, relative: &Path) -> Result<()> {
        let root = Component::Normal(OsStr::new(&self.canonical_root));
        if relative.components().next() == Some(root) {
            Ok(())
        } else {
            Err(UpdateError::Archive(format!("member {:?} is outside the snapshot root", raw)))
        }
    }
}

/// Replace a leading `<user>-<repo>-<anything>` segment with `canonical_root`.
///
/// Only the first segment is considered; the comparison ignores ASCII case
/// since hosts normalise owner names. `.` components are dropped.
pub fn rewrite_member_path(path: &Path, user: &str, repo: &str, canonical_root: &str) -> PathBuf {
    let prefix = format!("{}-{}-", user, repo);
    let mut components = path
        .components()
        .filter(|c| !matches!(c, Component::CurDir));

    let mut out = PathBuf::new();
    match components.next() {
        Some(Component::Normal(first)) => {
            let first_str = first.to_string_lossy();
            let matches = first_str.len() > prefix.len()
                && first_str
                    .get(..prefix.len())
                    .is_some_and(|head| head.eq_ignore_ascii_case(&prefix));
            if matches {
                out.push(canonical_root);
            } else {
                out.push(first);
            }
        }
        Some(other) => out.push(other.as_os_str()),
        None => return out,
    }
    for component in components {
        out.push(component.as_os_str());
    }
    out
}

fn check_member_path(path: &Path) -> Result<()> {
    for component in path.components() {
        match component {
            Component::Prefix(_) | Component::RootDir => {
                return Err(UpdateError::Archive(format!(
                    "absolute member path {:?}",
                    path
                )));
            }
            Component::ParentDir => {
                return Err(UpdateError::Archive(format!(
                    "member path {:?} traverses a parent directory",
                    path
                )));
            }
            Component::CurDir | Component::Normal(_) => {}
        }
    }
    Ok(())
}

fn link_target<R: Read>(entry: &Entry<'_, R>, raw: &Path) -> Result<PathBuf> {
    entry
        .link_name()
        .map_err(|e| UpdateError::Archive(format!("unreadable link target for {:?}: {}", raw, e)))?
        .map(|target| target.into_owned())
        .ok_or_else(|| UpdateError::Archive(format!("link {:?} has no target", raw)))
}

/// Resolve `path` through any links already on disk and require the result
/// to stay under `root` (itself already resolved). Components that do not
/// exist yet are taken as plain directories to be created.
fn resolve_within(root: &Path, path: &Path) -> Result<PathBuf> {
    let mut existing = path;
    let mut missing = Vec::new();
    let resolved = loop {
        match fs::canonicalize(existing) {
            Ok(resolved) => break resolved,
            // Exists but does not resolve: a dangling link
            Err(_) if fs::symlink_metadata(existing).is_ok() => {
                return Err(UpdateError::Archive(format!(
                    "{:?} passes through unresolvable link {:?}",
                    path, existing
                )));
            }
            Err(_) => match (existing.parent(), existing.file_name()) {
                (Some(parent), Some(name)) => {
                    missing.push(name);
                    existing = parent;
                }
                _ => return Err(UpdateError::Archive(format!("cannot resolve {:?}", path))),
            },
        }
    };

    let resolved = missing.into_iter().rev().fold(resolved, |acc, name| acc.join(name));
    if resolved.starts_with(root) {
        Ok(resolved)
    } else {
        Err(UpdateError::Archive(format!(
            "{:?} resolves outside the destination to {:?}",
            path, resolved
        )))
    }
}

/// Whether a symlink in `parent` (resolved) pointing at `target` would
/// resolve outside `root`.
fn link_escapes(root: &Path, parent: &Path, target: &Path) -> bool {
    let mut resolved = parent.to_path_buf();
    for component in target.components() {
        match component {
            Component::Prefix(_) | Component::RootDir => return true,
            Component::CurDir => {}
            Component::ParentDir => {
                if !resolved.pop() {
                    return true;
                }
            }
            Component::Normal(name) => resolved.push(name),
        }
        if !resolved.starts_with(root) {
            return true;
        }
    }
    false
}

fn remove_existing(path: &Path) -> Result<()> {
    match fs::symlink_metadata(path) {
        Ok(meta) if !meta.is_dir() => {
            fs::remove_file(path).fs_context(|| format!("Failed to replace {:?}", path))
        }
        _ => Ok(()),
    }
}

#[cfg(test)]
mod tests {
    use flate2::{write::GzEncoder, Compression};
    use tar::{Builder, Header};
    use tempfile::TempDir;

    use super::*;

    enum Member<'a> {
        File(&'a str, &'a [u8]),
        Dir(&'a str),
        Symlink(&'a str, &'a str),
        GlobalHeader,
    }

    /// Build headers byte-by-byte so hostile names survive tar's own checks
    fn raw_header(name: &str, entry_type: EntryType, size: u64, link: Option<&str>) -> Header {
        let mut header = Header::new_gnu();
        {
            let old = header.as_old_mut();
            old.name[..name.len()].copy_from_slice(name.as_bytes());
            if let Some(link) = link {
                old.linkname[..link.len()].copy_from_slice(link.as_bytes());
            }
        }
        header.set_entry_type(entry_type);
        header.set_size(size);
        header.set_mode(if entry_type == EntryType::Directory { 0o755 } else { 0o644 });
        header.set_mtime(1_700_000_000);
        header.set_cksum();
        header
    }

    fn write_archive(path: &Path, members: &[Member<'_>]) {
        let file = File::create(path).unwrap();
        let mut builder = Builder::new(GzEncoder::new(file, Compression::default()));
        for member in members {
            match member {
                Member::File(name, data) => {
                    let header = raw_header(name, EntryType::Regular, data.len() as u64, None);
                    builder.append(&header, *data).unwrap();
                }
                Member::Dir(name) => {
                    let header = raw_header(name, EntryType::Directory, 0, None);
                    builder.append(&header, std::io::empty()).unwrap();
                }
                Member::Symlink(name, target) => {
                    let header = raw_header(name, EntryType::Symlink, 0, Some(target));
                    builder.append(&header, std::io::empty()).unwrap();
                }
                Member::GlobalHeader => {
                    let body = b"52 comment=0123456789abcdef0123456789abcdef01234567\n";
                    let header = raw_header(
                        "pax_global_header",
                        EntryType::XGlobalHeader,
                        body.len() as u64,
                        None,
                    );
                    builder.append(&header, &body[..]).unwrap();
                }
            }
        }
        builder.into_inner().unwrap().finish().unwrap();
    }

    #[test]
    fn test_rewrite_member_path() {
        let rewritten = rewrite_member_path(
            Path::new("alice-myrepo-abcdef1/src/main.go"),
            "alice",
            "myrepo",
            "tfutils",
        );
        assert_eq!(rewritten, PathBuf::from("tfutils/src/main.go"));
    }

    #[test]
    fn test_rewrite_only_touches_leading_segment() {
        let path = Path::new("alice-myrepo-abc/alice-myrepo-def/file");
        assert_eq!(
            rewrite_member_path(path, "alice", "myrepo", "tfutils"),
            PathBuf::from("tfutils/alice-myrepo-def/file")
        );

        let nested = Path::new("docs/alice-myrepo-def/file");
        assert_eq!(
            rewrite_member_path(nested, "alice", "myrepo", "tfutils"),
            PathBuf::from("docs/alice-myrepo-def/file")
        );
    }

    #[test]
    fn test_rewrite_requires_suffix_and_matching_names() {
        for raw in ["alice-myrepo-", "bob-myrepo-abc/x", "alice-other-abc/x", "alice-myrepo/x"] {
            assert_eq!(
                rewrite_member_path(Path::new(raw), "alice", "myrepo", "tfutils"),
                PathBuf::from(raw),
                "{raw} should be left alone"
            );
        }
    }

    #[test]
    fn test_rewrite_is_idempotent() {
        let once = rewrite_member_path(
            Path::new("./Alice-MyRepo-abc/src/lib.rs"),
            "alice",
            "myrepo",
            "tfutils",
        );
        let twice = rewrite_member_path(&once, "alice", "myrepo", "tfutils");
        assert_eq!(once, PathBuf::from("tfutils/src/lib.rs"));
        assert_eq!(twice, once);
    }

    #[test]
    fn test_link_escapes() {
        let root = Path::new("/srv/dest");
        let bin = Path::new("/srv/dest/tfutils/bin");
        let top = Path::new("/srv/dest/tfutils");
        assert!(!link_escapes(root, bin, Path::new("../lib/tool")));
        assert!(!link_escapes(root, top, Path::new("docs/README.md")));
        assert!(!link_escapes(root, top, Path::new("..")));
        assert!(link_escapes(root, top, Path::new("../../etc/passwd")));
        assert!(link_escapes(root, top, Path::new("/etc/passwd")));
        assert!(link_escapes(root, root, Path::new("../dest/x")));
    }

    #[test]
    fn test_extract_renames_top_level_directory() {
        let temp = TempDir::new().unwrap();
        let archive = temp.path().join("tarball_2024_03_05_07_08_09.tar.gz");
        write_archive(
            &archive,
            &[
                Member::GlobalHeader,
                Member::Dir("alice-myrepo-abcdef1/"),
                Member::Dir("alice-myrepo-abcdef1/src/"),
                Member::File("alice-myrepo-abcdef1/src/main.go", b"package main\n"),
                Member::File("alice-myrepo-abcdef1/README", b"hello\n"),
            ],
        );

        let dest = temp.path().join("install");
        let summary = ArchiveExtractor::new("tfutils")
            .extract(&archive, &dest, "alice", "myrepo")
            .unwrap();

        assert_eq!(summary.members, 4);
        assert_eq!(summary.skipped, 1);
        assert_eq!(
            fs::read_to_string(dest.join("tfutils/src/main.go")).unwrap(),
            "package main\n"
        );
        assert_eq!(fs::read_to_string(dest.join("tfutils/README")).unwrap(), "hello\n");
        assert!(!dest.join("alice-myrepo-abcdef1").exists());
        assert!(!dest.join("pax_global_header").exists());
    }

    #[test]
    fn test_extract_overwrites_existing_files() {
        let temp = TempDir::new().unwrap();
        let dest = temp.path().join("install");
        fs::create_dir_all(dest.join("tfutils")).unwrap();
        fs::write(dest.join("tfutils/README"), "old contents that are longer").unwrap();
        fs::write(dest.join("tfutils/local.cfg"), "keep me").unwrap();

        let archive = temp.path().join("snapshot.tar.gz");
        write_archive(&archive, &[Member::File("alice-myrepo-1234567/README", b"new")]);

        ArchiveExtractor::new("tfutils")
            .extract(&archive, &dest, "alice", "myrepo")
            .unwrap();

        assert_eq!(fs::read_to_string(dest.join("tfutils/README")).unwrap(), "new");
        assert_eq!(fs::read_to_string(dest.join("tfutils/local.cfg")).unwrap(), "keep me");
    }

    #[test]
    fn test_extract_rejects_parent_traversal() {
        let temp = TempDir::new().unwrap();
        let archive = temp.path().join("evil.tar.gz");
        write_archive(
            &archive,
            &[
                Member::File("alice-myrepo-abc/ok.txt", b"fine"),
                Member::File("alice-myrepo-abc/../../escaped.txt", b"evil"),
            ],
        );

        let dest = temp.path().join("a/b");
        let err = ArchiveExtractor::new("tfutils")
            .extract(&archive, &dest, "alice", "myrepo")
            .unwrap_err();

        assert!(matches!(err, UpdateError::Archive(_)));
        assert!(!temp.path().join("escaped.txt").exists());
        assert!(!temp.path().join("a/escaped.txt").exists());
    }

    #[test]
    fn test_extract_rejects_absolute_member() {
        let temp = TempDir::new().unwrap();
        let archive = temp.path().join("evil.tar.gz");
        let outside = temp.path().join("outside.txt");
        let name = outside.to_string_lossy().into_owned();
        write_archive(&archive, &[Member::File(&name, b"evil")]);

        let err = ArchiveExtractor::new("tfutils")
            .extract(&archive, &temp.path().join("dest"), "alice", "myrepo")
            .unwrap_err();

        assert!(matches!(err, UpdateError::Archive(_)));
        assert!(!outside.exists());
    }

    #[cfg(unix)]
    #[test]
    fn test_extract_symlinks() {
        let temp = TempDir::new().unwrap();
        let archive = temp.path().join("links.tar.gz");
        write_archive(
            &archive,
            &[
                Member::File("alice-myrepo-abc/docs/guide.md", b"guide"),
                Member::Symlink("alice-myrepo-abc/GUIDE", "docs/guide.md"),
            ],
        );

        let dest = temp.path().join("dest");
        ArchiveExtractor::new("tfutils")
            .extract(&archive, &dest, "alice", "myrepo")
            .unwrap();
        assert_eq!(fs::read_to_string(dest.join("tfutils/GUIDE")).unwrap(), "guide");

        let evil = temp.path().join("evil.tar.gz");
        write_archive(&evil, &[Member::Symlink("alice-myrepo-abc/etc", "../../../etc")]);
        let err = ArchiveExtractor::new("tfutils")
            .extract(&evil, &dest, "alice", "myrepo")
            .unwrap_err();
        assert!(matches!(err, UpdateError::Archive(_)));
        assert!(!dest.join("tfutils/etc").exists());
    }

    #[cfg(unix)]
    #[test]
    fn test_extract_rejects_chained_symlinks() {
        let temp = TempDir::new().unwrap();
        let archive = temp.path().join("chain.tar.gz");
        write_archive(
            &archive,
            &[
                Member::Dir("alice-myrepo-abc/"),
                Member::Symlink("alice-myrepo-abc/a", ".."),
                Member::Symlink("alice-myrepo-abc/a/b", ".."),
                Member::File("alice-myrepo-abc/a/b/escaped.txt", b"evil"),
            ],
        );

        let dest = temp.path().join("dest");
        let err = ArchiveExtractor::new("tfutils")
            .extract(&archive, &dest, "alice", "myrepo")
            .unwrap_err();

        assert!(matches!(err, UpdateError::Archive(_)));
        assert!(!temp.path().join("escaped.txt").exists());
        assert!(!dest.join("escaped.txt").exists());
        assert!(!dest.join("b").exists());
    }

    #[cfg(unix)]
    #[test]
    fn test_extract_does_not_follow_existing_links_out() {
        let temp = TempDir::new().unwrap();
        let outside = temp.path().join("outside");
        fs::create_dir_all(&outside).unwrap();
        let dest = temp.path().join("dest");
        fs::create_dir_all(dest.join("tfutils")).unwrap();
        std::os::unix::fs::symlink(&outside, dest.join("tfutils/data")).unwrap();

        let archive = temp.path().join("snapshot.tar.gz");
        write_archive(&archive, &[Member::File("alice-myrepo-abc/data/payload.txt", b"payload")]);

        let err = ArchiveExtractor::new("tfutils")
            .extract(&archive, &dest, "alice", "myrepo")
            .unwrap_err();

        assert!(matches!(err, UpdateError::Archive(_)));
        assert!(!outside.join("payload.txt").exists());
    }

    #[test]
    fn test_extract_rejects_members_outside_snapshot_root() {
        let temp = TempDir::new().unwrap();
        let dest = temp.path().join("dest");

        for (i, name) in ["renamed-repo-abc/README", "README"].into_iter().enumerate() {
            let archive = temp.path().join(format!("snapshot{}.tar.gz", i));
            write_archive(&archive, &[Member::File(name, b"stray")]);

            let err = ArchiveExtractor::new("tfutils")
                .extract(&archive, &dest, "alice", "myrepo")
                .unwrap_err();

            assert!(matches!(err, UpdateError::Archive(_)), "{name} should be rejected");
            assert!(!dest.join(name).exists());
        }
    }

    #[test]
    fn test_extract_corrupt_archive() {
        let temp = TempDir::new().unwrap();
        let archive = temp.path().join("corrupt.tar.gz");
        fs::write(&archive, b"this is not gzip").unwrap();

        let err = ArchiveExtractor::new("tfutils")
            .extract(&archive, &temp.path().join("dest"), "alice", "myrepo")
            .unwrap_err();
        assert!(matches!(err, UpdateError::Archive(_)));
    }

    #[test]
    fn test_extract_missing_archive() {
        let temp = TempDir::new().unwrap();
        let err = ArchiveExtractor::new("tfutils")
            .extract(
                &temp.path().join("nope.tar.gz"),
                &temp.path().join("dest"),
                "alice",
                "myrepo",
            )
            .unwrap_err();
        assert!(matches!(err, UpdateError::Archive(_)));
    }

    #[test]
    fn test_extract_stops_when_cancelled() {
        let temp = TempDir::new().unwrap();
        let archive = temp.path().join("snapshot.tar.gz");
        write_archive(&archive, &[Member::File("alice-myrepo-abc/a", b"a")]);

        let flag = Arc::new(AtomicBool::new(true));
        let dest = temp.path().join("dest");
        let err = ArchiveExtractor::new("tfutils")
            .with_cancel_flag(flag)
            .extract(&archive, &dest, "alice", "myrepo")
            .unwrap_err();

        assert!(matches!(err, UpdateError::Cancelled));
        assert!(!dest.join("tfutils/a").exists());
    }
}
