pub mod check;
pub mod deploy;
pub mod init;
pub mod purge;
pub mod status;
