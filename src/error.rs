use std::path::PathBuf;

/// Errors produced by the update pipeline.
#[derive(Debug, thiserror::Error)]
pub enum UpdateError {
    /// Malformed persisted or remote JSON, or an unparseable timestamp.
    #[error("format error: {0}")]
    Format(String),

    /// Network or HTTP failure talking to the remote host.
    #[error("transfer error: {0}")]
    Transfer(String),

    /// Unreadable, malformed or path-escaping archive member.
    #[error("archive error: {0}")]
    Archive(String),

    /// Unable to create directories or read/write files.
    #[error("filesystem error: {context}: {source}")]
    Filesystem {
        context: String,
        #[source]
        source: std::io::Error,
    },

    /// Origin config does not name the requested branch type.
    #[error("config error: {0}")]
    Config(String),

    /// The tracked remote branch has no commits to deploy.
    #[error("remote branch '{0}' has no commits")]
    EmptyBranch(String),

    /// Another deploy holds the lock.
    #[error("deploy already in progress (lock held at {0:?})")]
    DeployInProgress(PathBuf),

    /// Deploy was interrupted between phases or archive members.
    #[error("deploy cancelled")]
    Cancelled,
}

pub type Result<T> = std::result::Result<T, UpdateError>;

/// Attach path context to I/O failures, mirroring `anyhow::Context`.
pub trait IoContext<T> {
    fn fs_context<F, S>(self, f: F) -> Result<T>
    where
        F: FnOnce() -> S,
        S: Into<String>;
}

impl<T> IoContext<T> for std::io::Result<T> {
    fn fs_context<F, S>(self, f: F) -> Result<T>
    where
        F: FnOnce() -> S,
        S: Into<String>,
    {
        self.map_err(|source| UpdateError::Filesystem {
            context: f().into(),
            source,
        })
    }
}
