//! An in-memory stand-in for a remote host, plugged in through `Connector`.
#![allow(dead_code)]

use std::collections::{BTreeMap, BTreeSet};
use std::io;
use std::path::Path;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use async_trait::async_trait;
use ssh_courier_lib::progress::{self, NoProgress, Progress, SharedProgress};
use ssh_courier_lib::ssh::policy::AutoAcceptPolicy;
use ssh_courier_lib::ssh::ssh_session::{
    AcceleratedCopy, AttributeTransfer, CommandExec, Connection, Connector,
};
use ssh_courier_lib::{
    CommandOutput, CredentialBundle, CredentialResolver, Endpoint, Error, HostKeyPolicy,
    RemoteAttributes, RemoteEntry, Result, Session, SessionOptions, TransferOptions,
};

#[derive(Default)]
pub struct RemoteFs {
    pub files: BTreeMap<String, Vec<u8>>,
    pub dirs: BTreeSet<String>,
}

impl RemoteFs {
    pub fn add_dir(&mut self, path: &str) {
        let mut current = String::new();
        for part in path.split('/').filter(|part| !part.is_empty()) {
            current.push('/');
            current.push_str(part);
            self.dirs.insert(current.clone());
        }
    }

    pub fn add_file(&mut self, path: &str, contents: &[u8]) {
        self.add_dir(parent(path));
        self.files.insert(path.to_string(), contents.to_vec());
    }

    fn is_dir(&self, path: &str) -> bool {
        path == "/" || self.dirs.contains(path.trim_end_matches('/'))
    }

    fn children(&self, dir: &str) -> Vec<(String, bool)> {
        let dir = dir.trim_end_matches('/');
        let dirs = self.dirs.iter().map(|d| (d, true));
        let files = self.files.keys().map(|f| (f, false));
        dirs.chain(files)
            .filter(|(path, _)| parent(path) == dir || (dir.is_empty() && parent(path) == "/"))
            .map(|(path, is_dir)| (basename(path).to_string(), is_dir))
            .collect()
    }

    fn write(&mut self, local: &Path, remote: &str) -> Result<String> {
        let data = std::fs::read(local).map_err(|source| Error::Local {
            path: local.to_path_buf(),
            source,
        })?;
        let target = if self.is_dir(remote) {
            let name = local.file_name().unwrap().to_string_lossy();
            format!("{}/{}", remote.trim_end_matches('/'), name)
        } else {
            remote.to_string()
        };
        if !self.is_dir(parent(&target)) {
            return Err(remote_error(&target, io::ErrorKind::NotFound));
        }
        self.files.insert(target.clone(), data);
        Ok(target)
    }
}

pub fn parent(path: &str) -> &str {
    match path.trim_end_matches('/').rsplit_once('/') {
        Some(("", _)) | None => "/",
        Some((parent, _)) => parent,
    }
}

pub fn basename(path: &str) -> &str {
    let trimmed = path.trim_end_matches('/');
    trimmed.rsplit('/').next().unwrap_or(trimmed)
}

fn remote_error(path: &str, kind: io::ErrorKind) -> Error {
    Error::Remote {
        path: path.to_string(),
        source: io::Error::new(kind, format!("{path}: {kind:?}")),
    }
}

fn write_local(path: &Path, data: &[u8]) -> Result<()> {
    if let Some(dir) = path.parent() {
        std::fs::create_dir_all(dir).map_err(|source| Error::Local {
            path: dir.to_path_buf(),
            source,
        })?;
    }
    std::fs::write(path, data).map_err(|source| Error::Local {
        path: path.to_path_buf(),
        source,
    })
}

#[derive(Default)]
pub struct State {
    pub remote: RemoteFs,
    pub exec_log: Vec<String>,
    /// Remote paths written, in order, with the transport that wrote them.
    pub writes: Vec<(&'static str, String)>,
    pub reads: Vec<(&'static str, String)>,
    pub connects: usize,
    pub handles_derived: usize,
    pub ssh_closes: usize,
    pub scp_closes: usize,
    pub sftp_closes: usize,
}

pub type SharedState = Arc<Mutex<State>>;

fn lock(state: &SharedState) -> MutexGuard<'_, State> {
    state.lock().unwrap()
}

pub struct MockConnector {
    pub state: SharedState,
    reject_auth: bool,
    copy_available: bool,
}

impl MockConnector {
    pub fn new() -> Self {
        Self {
            state: SharedState::default(),
            reject_auth: false,
            copy_available: true,
        }
    }

    pub fn rejecting_auth(mut self) -> Self {
        self.reject_auth = true;
        self
    }

    pub fn without_copy(mut self) -> Self {
        self.copy_available = false;
        self
    }

    pub fn state(&self) -> MutexGuard<'_, State> {
        lock(&self.state)
    }

    pub fn with_remote(self, f: impl FnOnce(&mut RemoteFs)) -> Self {
        f(&mut self.state().remote);
        self
    }

    pub async fn open(&self) -> Result<Session> {
        self.open_with_progress(progress::shared(NoProgress)).await
    }

    pub async fn open_with_progress(&self, progress: SharedProgress) -> Result<Session> {
        let options = SessionOptions {
            connect_timeout: Duration::from_secs(1),
            progress,
        };
        Session::open_with(
            self,
            Endpoint::new("10.0.0.5", 22),
            Box::new(AutoAcceptPolicy),
            &CredentialResolver::password("bob", "secret"),
            options,
        )
        .await
    }
}

#[async_trait]
impl Connector for MockConnector {
    async fn connect(
        &self,
        endpoint: &Endpoint,
        credentials: &CredentialBundle,
        _policy: Box<dyn HostKeyPolicy>,
        _timeout: Duration,
    ) -> Result<Box<dyn Connection>> {
        lock(&self.state).connects += 1;
        if self.reject_auth {
            return Err(Error::AuthenticationFailed {
                user: credentials.username().to_string(),
            });
        }
        Ok(Box::new(MockConnection {
            state: self.state.clone(),
            endpoint: endpoint.clone(),
            copy_available: self.copy_available,
        }))
    }
}

struct MockConnection {
    state: SharedState,
    endpoint: Endpoint,
    copy_available: bool,
}

#[async_trait]
impl Connection for MockConnection {
    fn command_handle(&self) -> Box<dyn CommandExec> {
        lock(&self.state).handles_derived += 1;
        Box::new(MockCommand {
            state: self.state.clone(),
        })
    }

    fn copy_handle(&self, progress: SharedProgress) -> Option<Box<dyn AcceleratedCopy>> {
        if !self.copy_available {
            return None;
        }
        lock(&self.state).handles_derived += 1;
        Some(Box::new(MockCopy {
            state: self.state.clone(),
            endpoint: self.endpoint.clone(),
            progress,
        }))
    }

    async fn open_transfer_handle(&self) -> Result<Box<dyn AttributeTransfer>> {
        lock(&self.state).handles_derived += 1;
        Ok(Box::new(MockSftp {
            state: self.state.clone(),
        }))
    }
}

struct MockCommand {
    state: SharedState,
}

#[async_trait]
impl CommandExec for MockCommand {
    async fn exec(&self, command: &str) -> Result<CommandOutput> {
        let mut state = lock(&self.state);
        state.exec_log.push(command.to_string());

        let output = |status: u32, stdout: &str, stderr: &str| CommandOutput {
            exit_status: Some(status),
            stdout: stdout.as_bytes().to_vec(),
            stderr: stderr.as_bytes().to_vec(),
        };

        if command == "disconnect" {
            return Err(Error::Ssh(russh::Error::Disconnect));
        }
        if let Some(text) = command.strip_prefix("echo ") {
            return Ok(output(0, &format!("{text}\n"), ""));
        }
        if let Some(path) = command.strip_prefix("mkdir -p ") {
            state.remote.add_dir(path.trim_matches('\''));
            return Ok(output(0, "", ""));
        }
        match command {
            "true" => Ok(output(0, "", "")),
            "false" => Ok(output(1, "", "")),
            _ => Ok(output(127, "", "command not found\n")),
        }
    }

    async fn close(&self) -> Result<()> {
        lock(&self.state).ssh_closes += 1;
        Ok(())
    }
}

struct MockCopy {
    state: SharedState,
    endpoint: Endpoint,
    progress: SharedProgress,
}

#[async_trait]
impl AcceleratedCopy for MockCopy {
    async fn get(
        &self,
        remote: &str,
        local: &Path,
        recursive: bool,
        _options: &TransferOptions,
    ) -> Result<()> {
        let mut state = lock(&self.state);
        state.reads.push(("scp", remote.to_string()));

        if let Some(data) = state.remote.files.get(remote) {
            let target = if local.is_dir() {
                local.join(basename(remote))
            } else {
                local.to_path_buf()
            };
            return write_local(&target, data);
        }
        if !state.remote.is_dir(remote) {
            return Err(remote_error(remote, io::ErrorKind::NotFound));
        }
        if !recursive {
            return Err(remote_error(remote, io::ErrorKind::Other));
        }

        let root = local.join(basename(remote));
        std::fs::create_dir_all(&root).map_err(|source| Error::Local {
            path: root.clone(),
            source,
        })?;
        let prefix = format!("{}/", remote.trim_end_matches('/'));
        for (path, data) in &state.remote.files {
            if let Some(relative) = path.strip_prefix(&prefix) {
                write_local(&root.join(relative), data)?;
            }
        }
        Ok(())
    }

    async fn put(&self, local: &Path, remote: &str, _options: &TransferOptions) -> Result<()> {
        let target = {
            let mut state = lock(&self.state);
            let target = state.remote.write(local, remote)?;
            state.writes.push(("scp", target.clone()));
            target
        };

        let total = std::fs::metadata(local).map(|meta| meta.len()).unwrap_or(0);
        let event = Progress {
            file: &target,
            total,
            sent: total,
            peer: &self.endpoint,
        };
        self.progress.lock().unwrap().on_progress(&event);
        Ok(())
    }

    async fn close(&self) -> Result<()> {
        lock(&self.state).scp_closes += 1;
        Ok(())
    }
}

struct MockSftp {
    state: SharedState,
}

#[async_trait]
impl AttributeTransfer for MockSftp {
    async fn get(&self, remote: &str, local: &Path, _options: &TransferOptions) -> Result<()> {
        let mut state = lock(&self.state);
        state.reads.push(("sftp", remote.to_string()));
        let Some(data) = state.remote.files.get(remote) else {
            let kind = if state.remote.is_dir(remote) {
                io::ErrorKind::Other
            } else {
                io::ErrorKind::NotFound
            };
            return Err(remote_error(remote, kind));
        };
        let target = if local.is_dir() {
            local.join(basename(remote))
        } else {
            local.to_path_buf()
        };
        write_local(&target, data)
    }

    async fn put(&self, local: &Path, remote: &str, _options: &TransferOptions) -> Result<()> {
        let mut state = lock(&self.state);
        let target = state.remote.write(local, remote)?;
        state.writes.push(("sftp", target));
        Ok(())
    }

    async fn list_dir(&self, path: &str) -> Result<Vec<String>> {
        let state = lock(&self.state);
        if !state.remote.is_dir(path) {
            return Err(remote_error(path, io::ErrorKind::NotFound));
        }
        Ok(state
            .remote
            .children(path)
            .into_iter()
            .map(|(name, _)| name)
            .collect())
    }

    async fn list_dir_attr(&self, path: &str) -> Result<Vec<RemoteEntry>> {
        let state = lock(&self.state);
        if !state.remote.is_dir(path) {
            return Err(remote_error(path, io::ErrorKind::NotFound));
        }
        let dir = path.trim_end_matches('/');
        Ok(state
            .remote
            .children(path)
            .into_iter()
            .map(|(name, is_dir)| {
                let size = state
                    .remote
                    .files
                    .get(&format!("{dir}/{name}"))
                    .map(|data| data.len() as u64);
                RemoteEntry {
                    name,
                    attributes: RemoteAttributes {
                        size,
                        is_dir,
                        ..RemoteAttributes::default()
                    },
                }
            })
            .collect())
    }

    async fn stat(&self, path: &str) -> Result<RemoteAttributes> {
        let state = lock(&self.state);
        if let Some(data) = state.remote.files.get(path) {
            return Ok(RemoteAttributes {
                size: Some(data.len() as u64),
                permissions: Some(0o100644),
                ..RemoteAttributes::default()
            });
        }
        if state.remote.is_dir(path) {
            return Ok(RemoteAttributes {
                permissions: Some(0o040755),
                is_dir: true,
                ..RemoteAttributes::default()
            });
        }
        Err(remote_error(path, io::ErrorKind::NotFound))
    }

    async fn remove_dir(&self, path: &str) -> Result<()> {
        let mut state = lock(&self.state);
        if !state.remote.is_dir(path) {
            return Err(remote_error(path, io::ErrorKind::NotFound));
        }
        if !state.remote.children(path).is_empty() {
            return Err(remote_error(path, io::ErrorKind::Other));
        }
        state.remote.dirs.remove(path.trim_end_matches('/'));
        Ok(())
    }

    async fn remove_file(&self, path: &str) -> Result<()> {
        let mut state = lock(&self.state);
        match state.remote.files.remove(path) {
            Some(_) => Ok(()),
            None => Err(remote_error(path, io::ErrorKind::NotFound)),
        }
    }

    async fn close(&self) -> Result<()> {
        lock(&self.state).sftp_closes += 1;
        Ok(())
    }
}
