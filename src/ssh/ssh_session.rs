use std::fmt;
use std::path::Path;
use std::time::Duration;

use async_trait::async_trait;

use crate::config::credentials::CredentialBundle;
use crate::error::Result;
use crate::progress::SharedProgress;
use crate::ssh::policy::HostKeyPolicy;
use crate::transfer::TransferOptions;

pub const DEFAULT_PORT: u16 = 22;

/// Address of the remote peer. The host is trimmed on construction and
/// never changes afterwards.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Endpoint {
    host: String,
    port: u16,
}

impl Endpoint {
    pub fn new(host: impl AsRef<str>, port: u16) -> Self {
        Self {
            host: host.as_ref().trim().to_string(),
            port,
        }
    }

    pub fn host(&self) -> &str {
        &self.host
    }

    pub fn port(&self) -> u16 {
        self.port
    }
}

impl fmt::Display for Endpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.host, self.port)
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CommandOutput {
    pub exit_status: Option<u32>,
    pub stdout: Vec<u8>,
    pub stderr: Vec<u8>,
}

impl CommandOutput {
    pub fn success(&self) -> bool {
        self.exit_status == Some(0)
    }

    pub fn stdout_lines(&self) -> Vec<String> {
        String::from_utf8_lossy(&self.stdout)
            .lines()
            .map(str::to_string)
            .collect()
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RemoteAttributes {
    pub size: Option<u64>,
    pub permissions: Option<u32>,
    pub uid: Option<u32>,
    pub gid: Option<u32>,
    pub atime: Option<u32>,
    pub mtime: Option<u32>,
    pub is_dir: bool,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RemoteEntry {
    pub name: String,
    pub attributes: RemoteAttributes,
}

/// Establishes one authenticated connection.
///
/// Implementations must report a refused host key as
/// `Error::HostKeyRejected` and refused credentials as
/// `Error::AuthenticationFailed`.
#[async_trait]
pub trait Connector: Send + Sync {
    async fn connect(
        &self,
        endpoint: &Endpoint,
        credentials: &CredentialBundle,
        policy: Box<dyn HostKeyPolicy>,
        timeout: Duration,
    ) -> Result<Box<dyn Connection>>;
}

/// An authenticated connection from which the three transport handles are
/// derived. Every handle must reuse this connection.
#[async_trait]
pub trait Connection: Send + Sync {
    fn command_handle(&self) -> Box<dyn CommandExec>;

    /// `None` when the underlying transport is no longer there.
    fn copy_handle(&self, progress: SharedProgress) -> Option<Box<dyn AcceleratedCopy>>;

    async fn open_transfer_handle(&self) -> Result<Box<dyn AttributeTransfer>>;
}

#[async_trait]
pub trait CommandExec: Send + Sync {
    /// Runs `command` and returns once its exit status and output are in.
    async fn exec(&self, command: &str) -> Result<CommandOutput>;

    /// Closes the connection shared by every handle.
    async fn close(&self) -> Result<()>;
}

/// SCP-style copy. Recursion is native on the download side.
#[async_trait]
pub trait AcceleratedCopy: Send + Sync {
    async fn get(
        &self,
        remote: &str,
        local: &Path,
        recursive: bool,
        options: &TransferOptions,
    ) -> Result<()>;

    async fn put(&self, local: &Path, remote: &str, options: &TransferOptions) -> Result<()>;

    async fn close(&self) -> Result<()>;
}

/// SFTP-style transfer with attribute inspection and no recursion.
#[async_trait]
pub trait AttributeTransfer: Send + Sync {
    async fn get(&self, remote: &str, local: &Path, options: &TransferOptions) -> Result<()>;

    async fn put(&self, local: &Path, remote: &str, options: &TransferOptions) -> Result<()>;

    async fn list_dir(&self, path: &str) -> Result<Vec<String>>;

    async fn list_dir_attr(&self, path: &str) -> Result<Vec<RemoteEntry>>;

    async fn stat(&self, path: &str) -> Result<RemoteAttributes>;

    async fn remove_dir(&self, path: &str) -> Result<()>;

    async fn remove_file(&self, path: &str) -> Result<()>;

    async fn close(&self) -> Result<()>;
}
