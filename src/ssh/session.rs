use std::fmt;
use std::future::Future;
use std::pin::Pin;
use std::str::FromStr;
use std::time::Duration;

use serde::Deserialize;
use tracing::{info, warn};

use super::client::RusshConnector;
use super::policy::{HostKeyPolicy, TrustPolicy};
use super::ssh_session::{
    AcceleratedCopy, AttributeTransfer, CommandExec, Connector, Endpoint,
};
use crate::config::credentials::CredentialResolver;
use crate::error::{Error, Result};
use crate::progress::{self, ConsoleProgress, ProgressSink, SharedProgress};

pub const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(5);

/// The only vocabulary callers use to pick a transport.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Deserialize, clap::ValueEnum)]
pub enum TransportTag {
    #[serde(rename = "ssh")]
    #[value(name = "ssh")]
    CommandExecution,
    #[serde(rename = "scp")]
    #[value(name = "scp")]
    AcceleratedCopy,
    #[serde(rename = "sftp")]
    #[value(name = "sftp")]
    AttributeTransfer,
}

impl TransportTag {
    pub fn as_str(self) -> &'static str {
        match self {
            TransportTag::CommandExecution => "ssh",
            TransportTag::AcceleratedCopy => "scp",
            TransportTag::AttributeTransfer => "sftp",
        }
    }
}

impl fmt::Display for TransportTag {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for TransportTag {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "ssh" => Ok(TransportTag::CommandExecution),
            "scp" => Ok(TransportTag::AcceleratedCopy),
            "sftp" => Ok(TransportTag::AttributeTransfer),
            other => Err(format!("unknown transport `{other}`, expected ssh, scp or sftp")),
        }
    }
}

/// A live handle as returned by [`Session::select`].
pub enum Handle<'a> {
    Command(&'a dyn CommandExec),
    /// `None` when the session runs without accelerated copy.
    Copy(Option<&'a dyn AcceleratedCopy>),
    Transfer(&'a dyn AttributeTransfer),
}

pub struct SessionOptions {
    pub connect_timeout: Duration,
    pub progress: SharedProgress,
}

impl Default for SessionOptions {
    fn default() -> Self {
        Self {
            connect_timeout: DEFAULT_CONNECT_TIMEOUT,
            progress: progress::shared(ConsoleProgress::stdout()),
        }
    }
}

pub type ScopedFuture<'s, T> = Pin<Box<dyn Future<Output = Result<T>> + 's>>;

/// One authenticated connection and the three handles derived from it.
pub struct Session {
    endpoint: Endpoint,
    command: Box<dyn CommandExec>,
    copy: Option<Box<dyn AcceleratedCopy>>,
    transfer: Box<dyn AttributeTransfer>,
    progress: SharedProgress,
    closed: bool,
}

impl Session {
    pub async fn open(
        endpoint: Endpoint,
        policy: TrustPolicy,
        credentials: &CredentialResolver,
    ) -> Result<Self> {
        Self::open_with(
            &RusshConnector,
            endpoint,
            policy.build(),
            credentials,
            SessionOptions::default(),
        )
        .await
    }

    pub async fn open_with(
        connector: &dyn Connector,
        endpoint: Endpoint,
        policy: Box<dyn HostKeyPolicy>,
        credentials: &CredentialResolver,
        options: SessionOptions,
    ) -> Result<Self> {
        let bundle = credentials.resolve()?;
        info!(host = %endpoint, user = bundle.username(), method = bundle.method(), "opening session");

        let connection = connector
            .connect(&endpoint, &bundle, policy, options.connect_timeout)
            .await?;

        let command = connection.command_handle();
        let copy = connection.copy_handle(options.progress.clone());
        if copy.is_none() {
            warn!(host = %endpoint, "transport is gone, continuing without scp");
        }
        let transfer = match connection.open_transfer_handle().await {
            Ok(transfer) => transfer,
            Err(e) => {
                command.close().await.ok();
                return Err(e);
            }
        };

        Ok(Self {
            endpoint,
            command,
            copy,
            transfer,
            progress: options.progress,
            closed: false,
        })
    }

    pub fn endpoint(&self) -> &Endpoint {
        &self.endpoint
    }

    pub fn is_closed(&self) -> bool {
        self.closed
    }

    /// Looks up the handle for `tag`. Never fails; an absent copy handle
    /// shows up as `Handle::Copy(None)`.
    pub fn select(&self, tag: TransportTag) -> Handle<'_> {
        match tag {
            TransportTag::CommandExecution => Handle::Command(self.command.as_ref()),
            TransportTag::AcceleratedCopy => Handle::Copy(self.copy.as_deref()),
            TransportTag::AttributeTransfer => Handle::Transfer(self.transfer.as_ref()),
        }
    }

    /// Replaces the sink fed by scp transfers.
    pub fn set_progress_sink(&self, sink: impl ProgressSink + 'static) {
        let mut current = self
            .progress
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        *current = Box::new(sink);
    }

    pub(crate) fn ensure_open(&self, tag: TransportTag) -> Result<()> {
        if self.closed {
            return Err(Error::TransportUnavailable(tag));
        }
        Ok(())
    }

    /// Closes sftp, scp and then the connection. Each step runs even if an
    /// earlier one failed; the first failure is returned. Later calls do
    /// nothing.
    pub async fn close(&mut self) -> Result<()> {
        if self.closed {
            return Ok(());
        }
        self.closed = true;

        let mut first_error = None;
        if let Err(e) = self.transfer.close().await {
            warn!(host = %self.endpoint, "closing sftp failed: {e}");
            first_error.get_or_insert(e);
        }
        if let Some(copy) = &self.copy {
            if let Err(e) = copy.close().await {
                warn!(host = %self.endpoint, "closing scp failed: {e}");
                first_error.get_or_insert(e);
            }
        }
        if let Err(e) = self.command.close().await {
            warn!(host = %self.endpoint, "closing connection failed: {e}");
            first_error.get_or_insert(e);
        }
        info!(host = %self.endpoint, "session closed");

        match first_error {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }

    /// Runs `f` and closes the session afterwards, whether `f` succeeded or
    /// not. An error from `f` wins over an error from closing.
    pub async fn scope<T, F>(mut self, f: F) -> Result<T>
    where
        F: for<'s> FnOnce(&'s Session) -> ScopedFuture<'s, T>,
    {
        let result = f(&self).await;
        let closed = self.close().await;
        match (result, closed) {
            (Err(e), _) => Err(e),
            (Ok(_), Err(e)) => Err(e),
            (Ok(value), Ok(())) => Ok(value),
        }
    }
}

impl Drop for Session {
    fn drop(&mut self) {
        if !self.closed {
            warn!(host = %self.endpoint, "session dropped without close()");
        }
    }
}
