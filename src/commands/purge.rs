use anyhow::Result;
use std::io::Write;

use crate::coordinator::UpdateCoordinator;
use crate::remote::RemoteRepository;
use crate::storage::VersionStore;

/// Handle the purge command
/// Output each removed snapshot path
pub fn handle<R: RemoteRepository, V: VersionStore, W: Write>(
    coordinator: &UpdateCoordinator<R, V>,
    output: &mut W,
) -> Result<()> {
    for path in coordinator.purge_downloads()? {
        writeln!(output, "{}", path.display())?;
    }
    Ok(())
}
