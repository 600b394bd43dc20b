pub mod backup;
pub mod config;
pub mod error;
pub mod helper;
pub mod progress;
pub mod runner;
pub mod ssh;
pub mod transfer;

pub use config::credentials::{CredentialBundle, CredentialResolver, KeyFiles};
pub use error::{Category, Error, Result};
pub use progress::{ConsoleProgress, NoProgress, Progress, ProgressSink};
pub use ssh::policy::{HostKeyPolicy, TrustPolicy};
pub use ssh::session::{Handle, Session, SessionOptions, TransportTag};
pub use ssh::ssh_session::{CommandOutput, Endpoint, RemoteAttributes, RemoteEntry};
pub use transfer::{
    BatchPolicy, BatchReport, Direction, TransferDescriptor, TransferOptions, UploadLayout,
};
