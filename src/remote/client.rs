use std::{
    io::{Read, Write},
    path::{Path, PathBuf},
    time::Duration,
};

use indicatif::{ProgressBar, ProgressStyle};
use serde::Deserialize;
use sha2::{Digest, Sha256};
use tempfile::NamedTempFile;

use super::traits::{RemoteRepository, SnapshotInfo};
use crate::commit::{CommitRecord, CommitWire};
use crate::error::{IoContext, Result, UpdateError};

const USER_AGENT: &str = concat!("snapshot-updater/", env!("CARGO_PKG_VERSION"));

/// Body of the commit-listing endpoint
#[derive(Debug, Deserialize)]
struct CommitList {
    commits: Vec<CommitWire>,
}

/// Client for a GitHub-style host over plain HTTP(S)
///
/// Commit listing: `{api_base}/commits/list/{user}/{repo}/{branch}`
/// Snapshots:      `{web_base}/{user}/{repo}/tarball/{reference}`
pub struct HttpRemote {
    agent: ureq::Agent,
    api_base: String,
    web_base: String,
    show_progress: bool,
}

impl HttpRemote {
    /// Create a new client with connect/read deadlines
    pub fn new(
        api_base: &str,
        web_base: &str,
        connect_timeout: Duration,
        read_timeout: Duration,
    ) -> Self {
        let agent = ureq::AgentBuilder::new()
            .timeout_connect(connect_timeout)
            .timeout_read(read_timeout)
            .build();

        Self {
            agent,
            api_base: api_base.trim_end_matches('/').to_string(),
            web_base: web_base.trim_end_matches('/').to_string(),
            show_progress: false,
        }
    }

    /// Draw a download progress bar on stderr
    pub fn with_progress(mut self, show_progress: bool) -> Self {
        self.show_progress = show_progress;
        self
    }

    fn commits_url(&self, user: &str, repo: &str, branch: &str) -> String {
        format!("{}/commits/list/{}/{}/{}", self.api_base, user, repo, branch)
    }

    fn snapshot_url(&self, user: &str, repo: &str, reference: &str) -> String {
        format!("{}/{}/{}/tarball/{}", self.web_base, user, repo, reference)
    }

    fn get(&self, url: &str) -> Result<ureq::Response> {
        tracing::debug!("GET {}", url);
        match self.agent.get(url).set("User-Agent", USER_AGENT).call() {
            Ok(resp) => Ok(resp),
            Err(ureq::Error::Status(code, _)) => Err(UpdateError::Transfer(format!(
                "GET {} returned HTTP {}",
                url, code
            ))),
            Err(ureq::Error::Transport(e)) => {
                Err(UpdateError::Transfer(format!("GET {} failed: {}", url, e)))
            }
        }
    }

    fn progress_bar(&self, total: Option<u64>) -> ProgressBar {
        if !self.show_progress {
            return ProgressBar::hidden();
        }
        let pb = ProgressBar::new(total.unwrap_or(0));
        if let Ok(style) = ProgressStyle::with_template(
            "  {msg} [{bar:30}] {bytes}/{total_bytes} {bytes_per_sec} ETA {eta}",
        ) {
            pb.set_style(style);
        }
        pb.set_message("snapshot");
        pb
    }
}

impl RemoteRepository for HttpRemote {
    fn list_commits(&self, user: &str, repo: &str, branch: &str) -> Result<Vec<CommitRecord>> {
        let url = self.commits_url(user, repo, branch);
        let body = self
            .get(&url)?
            .into_string()
            .map_err(|e| UpdateError::Transfer(format!("reading {} failed: {}", url, e)))?;

        let commits = parse_commit_list(&body)?;
        tracing::debug!("{} commits on {}/{}@{}", commits.len(), user, repo, branch);
        Ok(commits)
    }

    fn fetch_snapshot(
        &self,
        user: &str,
        repo: &str,
        reference: &str,
        dest: &Path,
    ) -> Result<SnapshotInfo> {
        let url = self.snapshot_url(user, repo, reference);
        tracing::info!("Downloading snapshot {} to {:?}", url, dest);

        let resp = self.get(&url)?;
        let expected = resp
            .header("Content-Length")
            .and_then(|v| v.parse::<u64>().ok());

        let dir = match dest.parent() {
            Some(parent) if !parent.as_os_str().is_empty() => parent.to_path_buf(),
            _ => PathBuf::from("."),
        };
        let mut temp = NamedTempFile::new_in(&dir)
            .fs_context(|| format!("Failed to create temp file in {:?}", dir))?;

        let pb = self.progress_bar(expected);
        let mut reader = resp.into_reader();
        let mut hasher = Sha256::new();
        let mut buf = [0u8; 64 * 1024];
        let mut written: u64 = 0;
        loop {
            let n = reader
                .read(&mut buf)
                .map_err(|e| UpdateError::Transfer(format!("reading {} failed: {}", url, e)))?;
            if n == 0 {
                break;
            }
            temp.write_all(&buf[..n])
                .fs_context(|| format!("Failed to write snapshot to {:?}", temp.path()))?;
            hasher.update(&buf[..n]);
            pb.inc(n as u64);
            written += n as u64;
        }
        pb.finish_and_clear();

        if let Some(expected) = expected {
            if written != expected {
                return Err(UpdateError::Transfer(format!(
                    "snapshot body truncated: got {} of {} bytes from {}",
                    written, expected, url
                )));
            }
        }

        temp.as_file()
            .sync_all()
            .fs_context(|| format!("Failed to sync {:?}", temp.path()))?;
        temp.persist(dest).map_err(|e| UpdateError::Filesystem {
            context: format!("Failed to move snapshot into {:?}", dest),
            source: e.error,
        })?;

        let sha256 = hex::encode(hasher.finalize());
        tracing::info!("Downloaded {} bytes (sha256 {})", written, sha256);

        Ok(SnapshotInfo {
            path: dest.to_path_buf(),
            bytes: written,
            sha256,
        })
    }
}

/// Parse a commit-listing body into records, latest first
pub fn parse_commit_list(body: &str) -> Result<Vec<CommitRecord>> {
    let list: CommitList = serde_json::from_str(body)
        .map_err(|e| UpdateError::Format(format!("invalid commit list: {}", e)))?;

    let mut commits = list
        .commits
        .into_iter()
        .map(CommitRecord::from_wire)
        .collect::<Result<Vec<_>>>()?;

    sort_latest_first(&mut commits);
    Ok(commits)
}

/// Stable sort by `(committed_at, id)`, descending
pub fn sort_latest_first(commits: &mut [CommitRecord]) {
    commits.sort_by(|a, b| {
        (b.committed_at(), b.id()).cmp(&(a.committed_at(), a.id()))
    });
}
