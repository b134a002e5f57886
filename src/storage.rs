mod filesystem;
mod state;
mod traits;

pub use filesystem::FileVersionStore;
pub use traits::VersionStore;
