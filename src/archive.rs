mod backup;
mod extract;
mod naming;

pub use backup::{purge_downloads, BackupArchiver};
pub use extract::ArchiveExtractor;
pub use naming::{local_now, snapshot_filename};
