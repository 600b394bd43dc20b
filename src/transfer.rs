//! Upload and download over whichever transfer handle the caller picks.
//!
//! The scp handle recurses natively on download; the sftp handle does not,
//! and a recursive request against it downloads only what a plain get would.
//! Batches walk their items strictly one after the other.

use std::io;
use std::path::{Path, PathBuf};

use serde::Deserialize;
use tracing::{debug, warn};

use crate::error::{Error, Result};
use crate::helper::{local_name, quote, remote_join};
use crate::ssh::session::{Handle, Session, TransportTag};
use crate::ssh::ssh_session::{AttributeTransfer, RemoteAttributes, RemoteEntry};

pub const DEFAULT_CHUNK_SIZE: usize = 32 * 1024;

/// What a batch does after one item fails.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BatchPolicy {
    /// Attempt every item regardless.
    #[default]
    Continue,
    /// Stop at the first failure; later items are not attempted.
    AbortOnError,
}

/// Where files found by a recursive upload end up remotely.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum UploadLayout {
    /// Every file goes to the destination path as given, whatever its depth
    /// in the local tree. Files with the same name overwrite each other.
    #[default]
    Flat,
    /// Local subdirectories are recreated under the destination.
    Mirror,
}

#[derive(Debug, Clone)]
pub struct TransferOptions {
    /// scp only: carry modification and access times across.
    pub preserve_times: bool,
    pub chunk_size: usize,
    pub on_error: BatchPolicy,
    pub layout: UploadLayout,
}

impl Default for TransferOptions {
    fn default() -> Self {
        Self {
            preserve_times: false,
            chunk_size: DEFAULT_CHUNK_SIZE,
            on_error: BatchPolicy::default(),
            layout: UploadLayout::default(),
        }
    }
}

#[derive(Debug)]
pub struct ItemOutcome {
    pub item: String,
    pub result: Result<()>,
}

/// Per-item results of a batch, in the order the items were attempted.
#[derive(Debug, Default)]
pub struct BatchReport {
    pub items: Vec<ItemOutcome>,
    /// Set when `BatchPolicy::AbortOnError` cut the batch short.
    pub aborted: bool,
}

impl BatchReport {
    fn record(&mut self, item: impl Into<String>, result: Result<()>, policy: BatchPolicy) -> bool {
        let item = item.into();
        let failed = result.is_err();
        if let Err(e) = &result {
            warn!(item = %item, "batch item failed: {e}");
        }
        self.items.push(ItemOutcome { item, result });
        if failed && policy == BatchPolicy::AbortOnError {
            self.aborted = true;
            return false;
        }
        true
    }

    pub fn is_success(&self) -> bool {
        !self.aborted && self.items.iter().all(|outcome| outcome.result.is_ok())
    }

    pub fn succeeded(&self) -> impl Iterator<Item = &str> {
        self.items
            .iter()
            .filter(|outcome| outcome.result.is_ok())
            .map(|outcome| outcome.item.as_str())
    }

    pub fn failures(&self) -> impl Iterator<Item = (&str, &Error)> {
        self.items.iter().filter_map(|outcome| match &outcome.result {
            Ok(()) => None,
            Err(e) => Some((outcome.item.as_str(), e)),
        })
    }

    /// Collapses the report into the first failure, if any.
    pub fn into_result(self) -> Result<()> {
        match self.items.into_iter().find_map(|outcome| outcome.result.err()) {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    Upload,
    Download,
}

/// One caller request, built per call.
#[derive(Debug, Clone)]
pub struct TransferDescriptor {
    pub direction: Direction,
    pub tag: TransportTag,
    pub sources: Vec<String>,
    pub destination: String,
    pub recursive: bool,
    pub options: TransferOptions,
}

impl Session {
    pub async fn download_one(
        &self,
        tag: TransportTag,
        source: &str,
        destination: &Path,
        recursive: bool,
        options: &TransferOptions,
    ) -> Result<()> {
        self.ensure_open(tag)?;
        debug!(%tag, source, destination = %destination.display(), recursive, "download");

        match self.select(tag) {
            Handle::Copy(Some(scp)) => scp.get(source, destination, recursive, options).await,
            Handle::Copy(None) => Err(Error::TransportUnavailable(tag)),
            Handle::Transfer(sftp) => {
                if recursive {
                    warn!(source, "sftp has no recursive download, fetching `{source}` as a single file");
                }
                sftp.get(source, destination, options).await
            }
            Handle::Command(_) => Err(Error::UnsupportedTransport {
                tag,
                operation: "download",
            }),
        }
    }

    pub async fn download_many<S: AsRef<str>>(
        &self,
        tag: TransportTag,
        sources: &[S],
        destination: &Path,
        recursive: bool,
        options: &TransferOptions,
    ) -> BatchReport {
        let mut report = BatchReport::default();
        for source in sources {
            let source = source.as_ref();
            let result = self
                .download_one(tag, source, destination, recursive, options)
                .await;
            if !report.record(source, result, options.on_error) {
                break;
            }
        }
        report
    }

    pub async fn upload_one(
        &self,
        tag: TransportTag,
        source: &Path,
        destination: &str,
        options: &TransferOptions,
    ) -> Result<()> {
        self.ensure_open(tag)?;
        debug!(%tag, source = %source.display(), destination, "upload");

        match self.select(tag) {
            Handle::Copy(Some(scp)) => scp.put(source, destination, options).await,
            Handle::Copy(None) => Err(Error::TransportUnavailable(tag)),
            Handle::Transfer(sftp) => sftp.put(source, destination, options).await,
            Handle::Command(_) => Err(Error::UnsupportedTransport {
                tag,
                operation: "upload",
            }),
        }
    }

    /// Uploads files as they are and, when `recursive` is set, every file
    /// below each directory, depth first in name order.
    ///
    /// With the default [`UploadLayout::Flat`] each of those files is sent to
    /// `destination` itself, so a tree collapses into one remote location.
    /// [`UploadLayout::Mirror`] keeps the relative paths instead.
    pub async fn upload_many<P: AsRef<Path>>(
        &self,
        tag: TransportTag,
        sources: &[P],
        destination: &str,
        recursive: bool,
        options: &TransferOptions,
    ) -> BatchReport {
        let mut report = BatchReport::default();
        // (local path, remote destination for it), popped from the back.
        let mut pending: Vec<(PathBuf, String)> = sources
            .iter()
            .rev()
            .map(|source| (source.as_ref().to_path_buf(), destination.to_string()))
            .collect();

        while let Some((path, remote)) = pending.pop() {
            let item = path.display().to_string();

            if path.is_file() {
                let result = self.upload_one(tag, &path, &remote, options).await;
                if !report.record(item, result, options.on_error) {
                    break;
                }
                continue;
            }

            if !path.is_dir() {
                let missing = Error::local(
                    &path,
                    io::Error::new(io::ErrorKind::NotFound, "no such file or directory"),
                );
                if !report.record(item, Err(missing), options.on_error) {
                    break;
                }
                continue;
            }

            if !recursive {
                warn!(path = %item, "skipping directory, recursive upload not requested");
                continue;
            }

            let children = match self.expand_directory(tag, &path, &remote, options).await {
                Ok(children) => children,
                Err(e) => {
                    if !report.record(item, Err(e), options.on_error) {
                        break;
                    }
                    continue;
                }
            };
            pending.extend(children.into_iter().rev());
        }
        report
    }

    /// Lists a local directory for `upload_many`, creating the matching
    /// remote directory first when mirroring. Symlinked subdirectories are
    /// skipped; linked files are uploaded.
    async fn expand_directory(
        &self,
        tag: TransportTag,
        dir: &Path,
        remote: &str,
        options: &TransferOptions,
    ) -> Result<Vec<(PathBuf, String)>> {
        let mut entries = Vec::new();
        let mut read_dir = tokio::fs::read_dir(dir)
            .await
            .map_err(|e| Error::local(dir, e))?;
        while let Some(entry) = read_dir
            .next_entry()
            .await
            .map_err(|e| Error::local(dir, e))?
        {
            let path = entry.path();
            let is_link = entry
                .file_type()
                .await
                .map_err(|e| Error::local(&path, e))?
                .is_symlink();
            // Linked directories are not descended into, a link back to an
            // ancestor would never end.
            if is_link && path.is_dir() {
                warn!(path = %path.display(), "skipping symlinked directory");
                continue;
            }
            entries.push(path);
        }
        entries.sort();

        let remote_dir = match options.layout {
            UploadLayout::Flat => remote.to_string(),
            UploadLayout::Mirror => {
                let remote_dir = remote_join(remote, &local_name(dir));
                self.make_remote_dir(tag, &remote_dir).await?;
                remote_dir
            }
        };

        Ok(entries
            .into_iter()
            .map(|entry| (entry, remote_dir.clone()))
            .collect())
    }

    async fn make_remote_dir(&self, tag: TransportTag, path: &str) -> Result<()> {
        let Handle::Command(ssh) = self.select(TransportTag::CommandExecution) else {
            return Err(Error::TransportUnavailable(tag));
        };
        let output = ssh.exec(&format!("mkdir -p {}", quote(path))).await?;
        if !output.success() {
            return Err(Error::remote(
                path,
                io::ErrorKind::Other,
                String::from_utf8_lossy(&output.stderr).trim().to_string(),
            ));
        }
        Ok(())
    }

    /// Runs a descriptor through `upload_many` or `download_many`.
    pub async fn transfer(&self, descriptor: &TransferDescriptor) -> BatchReport {
        match descriptor.direction {
            Direction::Upload => {
                let sources: Vec<PathBuf> = descriptor.sources.iter().map(PathBuf::from).collect();
                self.upload_many(
                    descriptor.tag,
                    &sources,
                    &descriptor.destination,
                    descriptor.recursive,
                    &descriptor.options,
                )
                .await
            }
            Direction::Download => {
                self.download_many(
                    descriptor.tag,
                    &descriptor.sources,
                    Path::new(&descriptor.destination),
                    descriptor.recursive,
                    &descriptor.options,
                )
                .await
            }
        }
    }

    fn sftp(&self) -> Result<&dyn AttributeTransfer> {
        let tag = TransportTag::AttributeTransfer;
        self.ensure_open(tag)?;
        match self.select(tag) {
            Handle::Transfer(sftp) => Ok(sftp),
            _ => Err(Error::TransportUnavailable(tag)),
        }
    }

    pub async fn list_directory(&self, path: &str) -> Result<Vec<String>> {
        self.sftp()?.list_dir(path).await
    }

    pub async fn list_attributes(&self, path: &str) -> Result<Vec<RemoteEntry>> {
        self.sftp()?.list_dir_attr(path).await
    }

    pub async fn stat(&self, path: &str) -> Result<RemoteAttributes> {
        self.sftp()?.stat(path).await
    }

    pub async fn remove_directory(&self, path: &str) -> Result<()> {
        self.sftp()?.remove_dir(path).await
    }

    pub async fn remove_directories<S: AsRef<str>>(&self, paths: &[S], policy: BatchPolicy) -> BatchReport {
        let mut report = BatchReport::default();
        for path in paths {
            let path = path.as_ref();
            let result = self.remove_directory(path).await;
            if !report.record(path, result, policy) {
                break;
            }
        }
        report
    }

    pub async fn remove_file(&self, path: &str) -> Result<()> {
        self.sftp()?.remove_file(path).await
    }

    pub async fn remove_files<S: AsRef<str>>(&self, paths: &[S], policy: BatchPolicy) -> BatchReport {
        let mut report = BatchReport::default();
        for path in paths {
            let path = path.as_ref();
            let result = self.remove_file(path).await;
            if !report.record(path, result, policy) {
                break;
            }
        }
        report
    }
}
