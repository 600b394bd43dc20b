//! Canned recipes for pulling data off an Android-style device.

use std::path::Path;

use crate::error::Result;
use crate::helper::quote;
use crate::ssh::session::{Session, TransportTag};
use crate::ssh::ssh_session::CommandOutput;
use crate::transfer::{BatchReport, TransferOptions};

pub const DEFAULT_MEDIA_DIRECTORIES: &[&str] = &[
    "/sdcard/DCIM",
    "/sdcard/Pictures",
    "/sdcard/Movies",
    "/sdcard/Music",
    "/sdcard/Ringtones",
];

pub const DEFAULT_DOCUMENT_DIRECTORIES: &[&str] = &["/sdcard/Download"];

pub const DEFAULT_NEW_DIRECTORIES: &[&str] = &["/sdcard/Download/HelloWorld"];

impl Session {
    /// Recursively downloads media folders into `destination`.
    /// `None` uses [`DEFAULT_MEDIA_DIRECTORIES`].
    pub async fn backup_media_directories(
        &self,
        tag: TransportTag,
        sources: Option<&[&str]>,
        destination: &Path,
        options: &TransferOptions,
    ) -> BatchReport {
        let sources = sources.unwrap_or(DEFAULT_MEDIA_DIRECTORIES);
        self.download_many(tag, sources, destination, true, options)
            .await
    }

    /// Same as [`Session::backup_media_directories`] for documents.
    pub async fn backup_document_directories(
        &self,
        tag: TransportTag,
        sources: Option<&[&str]>,
        destination: &Path,
        options: &TransferOptions,
    ) -> BatchReport {
        let sources = sources.unwrap_or(DEFAULT_DOCUMENT_DIRECTORIES);
        self.download_many(tag, sources, destination, true, options)
            .await
    }

    pub async fn create_directories(&self, paths: Option<&[&str]>) -> Result<Vec<CommandOutput>> {
        let commands = mkdir_commands(paths.unwrap_or(DEFAULT_NEW_DIRECTORIES));
        self.run(&commands).await
    }
}

fn mkdir_commands(paths: &[&str]) -> Vec<String> {
    paths
        .iter()
        .map(|path| format!("mkdir -p {}", quote(path)))
        .collect()
}
