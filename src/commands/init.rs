use anyhow::Result;
use std::io::Write;
use std::path::Path;

use crate::config::UpdaterConfig;

/// Handle the init command
/// Write a default config for `install_root` and output its path
pub fn handle<W: Write>(
    config_path: &Path,
    install_root: &Path,
    force: bool,
    output: &mut W,
) -> Result<()> {
    if config_path.exists() && !force {
        anyhow::bail!(
            "config file {:?} already exists (use --force to overwrite)",
            config_path
        );
    }

    let config = UpdaterConfig::for_install_root(install_root);
    config.save(config_path)?;
    tracing::info!("Wrote config for {:?}", install_root);

    writeln!(output, "{}", config_path.display())?;
    Ok(())
}
