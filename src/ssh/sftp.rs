use std::io;
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use russh::client;
use russh_sftp::client::error::Error as SftpError;
use russh_sftp::client::SftpSession;
use russh_sftp::protocol::{FileAttributes, StatusCode};
use tokio::fs::File;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWriteExt, BufReader};
use tracing::debug;

use super::client::ClientHandler;
use super::ssh_session::{AttributeTransfer, RemoteAttributes, RemoteEntry};
use crate::error::{Error, Result};
use crate::helper::{local_name, remote_basename, remote_join};
use crate::transfer::TransferOptions;

/// SFTP subsystem channel on the shared connection.
pub struct SftpClient {
    session: SftpSession,
}

impl SftpClient {
    pub async fn open(handle: &client::Handle<ClientHandler>) -> Result<Self> {
        let mut channel = handle.channel_open_session().await?;
        channel.request_subsystem(true, "sftp").await?;
        let session = SftpSession::new(channel.into_stream())
            .await
            .map_err(|e| sftp_error("sftp", e))?;
        Ok(Self { session })
    }

    async fn is_remote_dir(&self, path: &str) -> bool {
        self.session
            .metadata(path)
            .await
            .map(|meta| meta.is_dir())
            .unwrap_or(false)
    }
}

#[async_trait]
impl AttributeTransfer for SftpClient {
    async fn get(&self, remote: &str, local: &Path, options: &TransferOptions) -> Result<()> {
        let target: PathBuf = if local.is_dir() {
            local.join(remote_basename(remote))
        } else {
            local.to_path_buf()
        };
        debug!(remote, local = %target.display(), "sftp get");

        let metadata = self
            .session
            .metadata(remote)
            .await
            .map_err(|e| sftp_error(remote, e))?;
        reject_directory(remote, &attributes(&metadata))?;

        let remote_file = self
            .session
            .open(remote)
            .await
            .map_err(|e| sftp_error(remote, e))?;
        copy_to_local(remote_file, remote, &target, options.chunk_size).await
    }

    async fn put(&self, local: &Path, remote: &str, options: &TransferOptions) -> Result<()> {
        let target = if self.is_remote_dir(remote).await {
            remote_join(remote, &local_name(local))
        } else {
            remote.to_string()
        };
        debug!(local = %local.display(), remote = %target, "sftp put");

        let local_file = File::open(local).await.map_err(|e| Error::local(local, e))?;
        let mut reader = BufReader::with_capacity(options.chunk_size.max(1), local_file);
        let mut remote_file = self
            .session
            .create(target.as_str())
            .await
            .map_err(|e| sftp_error(&target, e))?;

        tokio::io::copy_buf(&mut reader, &mut remote_file)
            .await
            .map_err(|e| Error::Remote {
                path: target.clone(),
                source: e,
            })?;
        remote_file.shutdown().await.map_err(|e| Error::Remote {
            path: target.clone(),
            source: e,
        })?;
        Ok(())
    }

    async fn list_dir(&self, path: &str) -> Result<Vec<String>> {
        let entries = self
            .session
            .read_dir(path)
            .await
            .map_err(|e| sftp_error(path, e))?;
        Ok(entries
            .map(|entry| entry.file_name())
            .filter(|name| name != "." && name != "..")
            .collect())
    }

    async fn list_dir_attr(&self, path: &str) -> Result<Vec<RemoteEntry>> {
        let entries = self
            .session
            .read_dir(path)
            .await
            .map_err(|e| sftp_error(path, e))?;
        Ok(entries
            .filter(|entry| entry.file_name() != "." && entry.file_name() != "..")
            .map(|entry| RemoteEntry {
                name: entry.file_name(),
                attributes: attributes(&entry.metadata()),
            })
            .collect())
    }

    async fn stat(&self, path: &str) -> Result<RemoteAttributes> {
        let metadata = self
            .session
            .metadata(path)
            .await
            .map_err(|e| sftp_error(path, e))?;
        Ok(attributes(&metadata))
    }

    async fn remove_dir(&self, path: &str) -> Result<()> {
        self.session
            .remove_dir(path)
            .await
            .map_err(|e| sftp_error(path, e))
    }

    async fn remove_file(&self, path: &str) -> Result<()> {
        self.session
            .remove_file(path)
            .await
            .map_err(|e| sftp_error(path, e))
    }

    async fn close(&self) -> Result<()> {
        self.session.close().await.map_err(|e| sftp_error("sftp", e))
    }
}

/// sftp `open` succeeds on a directory on some servers; only the read fails.
fn reject_directory(remote: &str, attributes: &RemoteAttributes) -> Result<()> {
    if attributes.is_dir {
        return Err(Error::remote(
            remote,
            io::ErrorKind::Other,
            "is a directory, sftp downloads single files only",
        ));
    }
    Ok(())
}

/// Streams `reader` into a new file at `target`. Read failures are blamed on
/// the remote path, write failures on the local one. A partial file is removed.
async fn copy_to_local<R>(reader: R, remote: &str, target: &Path, chunk_size: usize) -> Result<()>
where
    R: AsyncRead + Unpin,
{
    let mut local_file = File::create(target)
        .await
        .map_err(|e| Error::local(target, e))?;
    let result = fill(reader, &mut local_file, remote, target, chunk_size).await;
    if result.is_err() {
        drop(local_file);
        tokio::fs::remove_file(target).await.ok();
    }
    result
}

async fn fill<R>(
    mut reader: R,
    local_file: &mut File,
    remote: &str,
    target: &Path,
    chunk_size: usize,
) -> Result<()>
where
    R: AsyncRead + Unpin,
{
    let mut buf = vec![0u8; chunk_size.max(1)];
    loop {
        let n = reader.read(&mut buf).await.map_err(|e| Error::Remote {
            path: remote.to_string(),
            source: e,
        })?;
        if n == 0 {
            break;
        }
        local_file
            .write_all(&buf[..n])
            .await
            .map_err(|e| Error::local(target, e))?;
    }
    local_file.flush().await.map_err(|e| Error::local(target, e))
}

fn attributes(meta: &FileAttributes) -> RemoteAttributes {
    RemoteAttributes {
        size: meta.size,
        permissions: meta.permissions,
        uid: meta.uid,
        gid: meta.gid,
        atime: meta.atime,
        mtime: meta.mtime,
        is_dir: meta.is_dir(),
    }
}

fn sftp_error(path: &str, err: SftpError) -> Error {
    let kind = match &err {
        SftpError::Status(status) => match status.status_code {
            StatusCode::NoSuchFile => io::ErrorKind::NotFound,
            StatusCode::PermissionDenied => io::ErrorKind::PermissionDenied,
            _ => io::ErrorKind::Other,
        },
        _ => io::ErrorKind::Other,
    };
    Error::remote(path, kind, err.to_string())
}
