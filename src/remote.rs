mod client;
mod traits;

pub use client::HttpRemote;
pub use traits::{RemoteRepository, SnapshotInfo};
