use anyhow::Result;
use std::io::Write;

use crate::config::OriginConfig;
use crate::coordinator::UpdateCoordinator;
use crate::remote::RemoteRepository;
use crate::storage::VersionStore;

/// Handle the deploy command
/// Output the backup archive path, or `up to date` when there is nothing to
/// deploy and `force` is not set
pub fn handle<R: RemoteRepository, V: VersionStore, W: Write>(
    coordinator: &mut UpdateCoordinator<R, V>,
    origin: &OriginConfig,
    output: &mut W,
    force: bool,
) -> Result<()> {
    if !force && !coordinator.check_for_updates(origin)? {
        writeln!(output, "up to date")?;
        return Ok(());
    }

    let report = coordinator.deploy_update(origin)?;
    tracing::info!(
        "Deployed {} ({} members from {} bytes, sha256 {})",
        report.commit,
        report.members_extracted,
        report.snapshot.bytes,
        report.snapshot.sha256
    );

    writeln!(output, "{}", report.backup_path.display())?;
    Ok(())
}
