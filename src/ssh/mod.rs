pub mod client;
pub mod common;
pub mod policy;
pub mod scp;
pub mod session;
pub mod sftp;
pub mod ssh_session;
