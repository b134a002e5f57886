use anyhow::Result;
use std::io::Write;

use crate::config::OriginConfig;
use crate::coordinator::UpdateCoordinator;
use crate::remote::RemoteRepository;
use crate::storage::VersionStore;

/// Handle the check command
/// Output `true` if the tracked branch has a newer commit than the applied one
pub fn handle<R: RemoteRepository, V: VersionStore, W: Write>(
    coordinator: &mut UpdateCoordinator<R, V>,
    origin: &OriginConfig,
    output: &mut W,
) -> Result<()> {
    let available = coordinator.check_for_updates(origin)?;
    writeln!(output, "{}", available)?;
    Ok(())
}
