use std::{
    collections::BTreeMap,
    env,
    path::{Path, PathBuf},
    time::Duration,
};

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

use crate::error::UpdateError;

/// Expand tilde (~) in path to user's home directory
fn expand_tilde(path: &Path) -> PathBuf {
    if let Some(s) = path.to_str() {
        if let Some(stripped) = s.strip_prefix("~/") {
            if let Some(home) = dirs::home_dir() {
                return home.join(stripped);
            }
        } else if s == "~" {
            if let Some(home) = dirs::home_dir() {
                return home;
            }
        }
    }
    path.to_path_buf()
}

/// Configuration for snapshot-updater
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct UpdaterConfig {
    /// Root of the installed tree that gets backed up and replaced
    pub install_root: PathBuf,
    /// Where snapshots are downloaded (default: `<install_root>/versions`)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub staging_dir: Option<PathBuf>,
    /// Where backups are written (default: `<install_root>/backups`)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub backup_dir: Option<PathBuf>,
    /// Applied-commit record (default: `<staging_dir>/versioninfo.json`)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub version_file: Option<PathBuf>,
    /// Origin config (default: `<staging_dir>/origin.json`)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub origin_file: Option<PathBuf>,
    /// Key into the origin's branch map
    #[serde(default = "defaults::branch_type")]
    pub branch_type: String,
    /// Base URL of the commit-listing API
    #[serde(default = "defaults::api_base")]
    pub api_base: String,
    /// Base URL snapshots are downloaded from
    #[serde(default = "defaults::web_base")]
    pub web_base: String,
    #[serde(default = "defaults::connect_timeout_secs")]
    pub connect_timeout_secs: u64,
    #[serde(default = "defaults::read_timeout_secs")]
    pub read_timeout_secs: u64,
}

impl UpdaterConfig {
    /// Config rooted at `install_root` with every other field defaulted
    pub fn for_install_root(install_root: impl Into<PathBuf>) -> Self {
        Self {
            install_root: install_root.into(),
            staging_dir: None,
            backup_dir: None,
            version_file: None,
            origin_file: None,
            branch_type: defaults::branch_type(),
            api_base: defaults::api_base(),
            web_base: defaults::web_base(),
            connect_timeout_secs: defaults::connect_timeout_secs(),
            read_timeout_secs: defaults::read_timeout_secs(),
        }
    }

    /// Load configuration from a config file and environment variables.
    ///
    /// Without an explicit path the default file is optional as long as
    /// `SNAPSHOT_UPDATER_INSTALL_ROOT` is set.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let mut config = match path {
            Some(path) => Self::load_from_file(path)?,
            None => {
                let config_path = Self::config_file_path()?;
                tracing::debug!("loading snapshot-updater config from {:?}", config_path);
                if config_path.exists() {
                    Self::load_from_file(&config_path)?
                } else if let Ok(root) = env::var("SNAPSHOT_UPDATER_INSTALL_ROOT") {
                    Self::for_install_root(expand_tilde(Path::new(&root)))
                } else {
                    anyhow::bail!("config file not found at {:?}", config_path);
                }
            }
        };

        config.apply_env_overrides()?;
        Ok(config)
    }

    fn apply_env_overrides(&mut self) -> Result<()> {
        if let Ok(path) = env::var("SNAPSHOT_UPDATER_INSTALL_ROOT") {
            self.install_root = expand_tilde(&PathBuf::from(path));
        }

        if let Ok(path) = env::var("SNAPSHOT_UPDATER_STAGING_DIR") {
            self.staging_dir = Some(expand_tilde(&PathBuf::from(path)));
        }

        if let Ok(path) = env::var("SNAPSHOT_UPDATER_BACKUP_DIR") {
            self.backup_dir = Some(expand_tilde(&PathBuf::from(path)));
        }

        if let Ok(branch_type) = env::var("SNAPSHOT_UPDATER_BRANCH_TYPE") {
            self.branch_type = branch_type;
        }

        if let Ok(url) = env::var("SNAPSHOT_UPDATER_API_BASE") {
            self.api_base = url;
        }

        if let Ok(url) = env::var("SNAPSHOT_UPDATER_WEB_BASE") {
            self.web_base = url;
        }

        if let Ok(secs) = env::var("SNAPSHOT_UPDATER_READ_TIMEOUT_SECS") {
            self.read_timeout_secs = secs
                .parse()
                .context("Failed to parse SNAPSHOT_UPDATER_READ_TIMEOUT_SECS as u64")?;
        }
        Ok(())
    }

    /// Load configuration from a file
    pub fn load_from_file(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {:?}", path))?;

        let mut config: UpdaterConfig = serde_yaml::from_str(&content)
            .with_context(|| format!("Failed to parse config file: {:?}", path))?;

        // Expand tildes in all path fields
        config.install_root = expand_tilde(&config.install_root);
        for field in [
            &mut config.staging_dir,
            &mut config.backup_dir,
            &mut config.version_file,
            &mut config.origin_file,
        ] {
            *field = field.as_deref().map(expand_tilde);
        }

        Ok(config)
    }

    /// Save configuration to file
    pub fn save(&self, path: &Path) -> Result<()> {
        // Ensure directory exists
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("Failed to create config directory: {:?}", parent))?;
        }

        let content = serde_yaml::to_string(self).context("Failed to serialize config")?;

        std::fs::write(path, content)
            .with_context(|| format!("Failed to write config file: {:?}", path))?;

        Ok(())
    }

    /// Get default config file path
    pub fn config_file_path() -> Result<PathBuf> {
        dirs::home_dir()
            .map(|home| home.join(".config/snapshot-updater/config.yaml"))
            .context("Could not determine home directory for config file")
    }

    /// Relative paths are taken relative to the install root
    fn resolve(&self, path: &Path) -> PathBuf {
        let path = expand_tilde(path);
        if path.is_absolute() {
            path
        } else {
            self.install_root.join(path)
        }
    }

    pub fn staging_dir(&self) -> PathBuf {
        match &self.staging_dir {
            Some(dir) => self.resolve(dir),
            None => self.install_root.join("versions"),
        }
    }

    pub fn backup_dir(&self) -> PathBuf {
        match &self.backup_dir {
            Some(dir) => self.resolve(dir),
            None => self.install_root.join("backups"),
        }
    }

    pub fn version_file(&self) -> PathBuf {
        match &self.version_file {
            Some(file) => self.resolve(file),
            None => self.staging_dir().join("versioninfo.json"),
        }
    }

    pub fn origin_file(&self) -> PathBuf {
        match &self.origin_file {
            Some(file) => self.resolve(file),
            None => self.staging_dir().join("origin.json"),
        }
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_secs(self.connect_timeout_secs)
    }

    pub fn read_timeout(&self) -> Duration {
        Duration::from_secs(self.read_timeout_secs)
    }

    /// Filesystem layout handed to the update coordinator
    pub fn layout(&self) -> std::result::Result<InstallLayout, UpdateError> {
        InstallLayout::new(&self.install_root, self.staging_dir(), self.backup_dir())
    }
}

mod defaults {
    pub(crate) fn branch_type() -> String {
        "master".to_string()
    }

    pub(crate) fn api_base() -> String {
        "http://github.com/api/v2/json".to_string()
    }

    pub(crate) fn web_base() -> String {
        "https://github.com".to_string()
    }

    pub(crate) fn connect_timeout_secs() -> u64 {
        15
    }

    pub(crate) fn read_timeout_secs() -> u64 {
        300
    }
}

/// Where the installation and its update artifacts live.
///
/// Snapshots are extracted into the parent of `install_root`, with their
/// top-level directory renamed to the install root's own name.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InstallLayout {
    install_root: PathBuf,
    staging_dir: PathBuf,
    backup_dir: PathBuf,
    extract_root: PathBuf,
    canonical_root: String,
}

impl InstallLayout {
    pub fn new(
        install_root: impl Into<PathBuf>,
        staging_dir: impl Into<PathBuf>,
        backup_dir: impl Into<PathBuf>,
    ) -> std::result::Result<Self, UpdateError> {
        let install_root = install_root.into();
        let canonical_root = install_root
            .file_name()
            .and_then(|name| name.to_str())
            .map(str::to_string)
            .ok_or_else(|| {
                UpdateError::Config(format!(
                    "install root {:?} has no usable directory name",
                    install_root
                ))
            })?;
        let extract_root = match install_root.parent() {
            Some(parent) if !parent.as_os_str().is_empty() => parent.to_path_buf(),
            _ => PathBuf::from("."),
        };

        Ok(Self {
            install_root,
            staging_dir: staging_dir.into(),
            backup_dir: backup_dir.into(),
            extract_root,
            canonical_root,
        })
    }

    pub fn install_root(&self) -> &Path {
        &self.install_root
    }

    pub fn staging_dir(&self) -> &Path {
        &self.staging_dir
    }

    pub fn backup_dir(&self) -> &Path {
        &self.backup_dir
    }

    pub fn extract_root(&self) -> &Path {
        &self.extract_root
    }

    pub fn canonical_root(&self) -> &str {
        &self.canonical_root
    }
}

/// Which remote repository the installation tracks (origin.json)
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OriginConfig {
    pub user: String,
    pub repo: String,
    #[serde(default)]
    pub branches: BTreeMap<String, String>,
}

impl OriginConfig {
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read origin config: {:?}", path))?;
        serde_json::from_str(&content)
            .with_context(|| format!("Failed to parse origin config: {:?}", path))
    }

    /// Branch name configured for `branch_type` (e.g. "master")
    pub fn branch(&self, branch_type: &str) -> std::result::Result<&str, UpdateError> {
        self.branches
            .get(branch_type)
            .map(String::as_str)
            .ok_or_else(|| {
                UpdateError::Config(format!(
                    "origin {}/{} has no '{}' branch configured",
                    self.user, self.repo, branch_type
                ))
            })
    }
}
