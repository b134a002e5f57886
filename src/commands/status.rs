use anyhow::Result;
use std::io::Write;

use crate::coordinator::UpdateCoordinator;
use crate::remote::RemoteRepository;
use crate::storage::VersionStore;

/// Handle the status command
/// Output the applied commit, without touching the network
pub fn handle<R: RemoteRepository, V: VersionStore, W: Write>(
    coordinator: &UpdateCoordinator<R, V>,
    output: &mut W,
) -> Result<()> {
    let baseline = coordinator.baseline()?;
    writeln!(output, "{}", baseline)?;
    Ok(())
}
