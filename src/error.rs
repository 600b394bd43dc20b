use std::io;
use std::path::PathBuf;
use std::time::Duration;

use thiserror::Error;

use crate::ssh::session::TransportTag;

#[derive(Debug, Error)]
pub enum Error {
    #[error("credential file `{}` does not exist", path.display())]
    CredentialFileMissing { path: PathBuf },

    #[error("unable to load private key `{}`: {source}", path.display())]
    KeyDecrypt {
        path: PathBuf,
        #[source]
        source: russh_keys::Error,
    },

    #[error("invalid credentials supplied: specify either a username/password or an SSH private key file and passphrase")]
    InsufficientCredentials,

    #[error("host key for {host} was rejected")]
    HostKeyRejected { host: String },

    #[error("authentication failed for user `{user}`")]
    AuthenticationFailed { user: String },

    #[error("connection to {host} timed out after {timeout:?}")]
    ConnectTimeout { host: String, timeout: Duration },

    #[error("{0} transport is not available on this session")]
    TransportUnavailable(TransportTag),

    #[error("{tag} transport does not support {operation}")]
    UnsupportedTransport {
        tag: TransportTag,
        operation: &'static str,
    },

    #[error("remote `{path}`: {source}")]
    Remote {
        path: String,
        #[source]
        source: io::Error,
    },

    #[error("local `{}`: {source}", path.display())]
    Local {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("protocol error: {0}")]
    Protocol(String),

    #[error("ssh error: {0}")]
    Ssh(#[from] russh::Error),

    #[error("io error: {0}")]
    Io(#[from] io::Error),
}

/// Broad failure classes, enough for a caller to decide whether retrying
/// makes sense.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Category {
    Credential,
    Connection,
    Io,
    Capability,
}

impl Error {
    pub fn category(&self) -> Category {
        match self {
            Error::CredentialFileMissing { .. }
            | Error::KeyDecrypt { .. }
            | Error::InsufficientCredentials
            | Error::AuthenticationFailed { .. } => Category::Credential,
            Error::HostKeyRejected { .. } | Error::ConnectTimeout { .. } | Error::Ssh(_) => {
                Category::Connection
            }
            Error::TransportUnavailable(_) | Error::UnsupportedTransport { .. } => {
                Category::Capability
            }
            Error::Remote { .. } | Error::Local { .. } | Error::Protocol(_) | Error::Io(_) => {
                Category::Io
            }
        }
    }

    /// The `io::ErrorKind` behind an I/O-class failure.
    pub fn io_kind(&self) -> Option<io::ErrorKind> {
        match self {
            Error::Remote { source, .. } | Error::Local { source, .. } | Error::Io(source) => {
                Some(source.kind())
            }
            _ => None,
        }
    }

    pub fn is_not_found(&self) -> bool {
        self.io_kind() == Some(io::ErrorKind::NotFound)
    }

    pub fn is_retryable(&self) -> bool {
        match self {
            Error::ConnectTimeout { .. } | Error::Ssh(_) => true,
            Error::Remote { source, .. } | Error::Local { source, .. } | Error::Io(source) => {
                !matches!(
                    source.kind(),
                    io::ErrorKind::NotFound | io::ErrorKind::PermissionDenied
                )
            }
            _ => false,
        }
    }

    pub(crate) fn remote(path: impl Into<String>, kind: io::ErrorKind, message: impl Into<String>) -> Self {
        Error::Remote {
            path: path.into(),
            source: io::Error::new(kind, message.into()),
        }
    }

    pub(crate) fn local(path: impl Into<PathBuf>, source: io::Error) -> Self {
        Error::Local {
            path: path.into(),
            source,
        }
    }
}

pub type Result<T, E = Error> = std::result::Result<T, E>;
