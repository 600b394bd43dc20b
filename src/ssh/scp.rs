//! SCP source/sink protocol spoken over an `exec` channel running `scp -t`
//! (upload) or `scp -f` (download) on the remote host.

use std::fs::{FileTimes, Metadata};
use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, UNIX_EPOCH};

use async_trait::async_trait;
use russh::client;
use tokio::fs::File;
use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncReadExt, AsyncWrite, AsyncWriteExt, BufReader};
use tracing::{debug, warn};

use super::client::ClientHandler;
use super::ssh_session::{AcceleratedCopy, Endpoint};
use crate::error::{Error, Result};
use crate::helper::{local_name, quote};
use crate::progress::{self, Progress, SharedProgress};
use crate::transfer::TransferOptions;

pub struct ScpClient {
    session: Arc<client::Handle<ClientHandler>>,
    peer: Endpoint,
    progress: SharedProgress,
}

impl ScpClient {
    pub fn new(
        session: Arc<client::Handle<ClientHandler>>,
        peer: Endpoint,
        progress: SharedProgress,
    ) -> Self {
        Self {
            session,
            peer,
            progress,
        }
    }

    fn reporter(&self) -> Reporter<'_> {
        Reporter::new(&self.progress, &self.peer)
    }
}

#[async_trait]
impl AcceleratedCopy for ScpClient {
    async fn get(
        &self,
        remote: &str,
        local: &Path,
        recursive: bool,
        options: &TransferOptions,
    ) -> Result<()> {
        let command = source_command(remote, recursive, options.preserve_times);
        debug!(%command, local = %local.display(), "scp get");

        let mut channel = self.session.channel_open_session().await?;
        channel.exec(true, command).await?;
        let (reader, mut writer) = tokio::io::split(channel.into_stream());
        let mut reader = BufReader::new(reader);

        receive(&mut reader, &mut writer, remote, local, options, &self.reporter()).await?;
        writer.shutdown().await.ok();
        Ok(())
    }

    async fn put(&self, local: &Path, remote: &str, options: &TransferOptions) -> Result<()> {
        let command = sink_command(remote, options.preserve_times);
        debug!(%command, local = %local.display(), "scp put");

        let mut channel = self.session.channel_open_session().await?;
        channel.exec(true, command).await?;
        let (reader, mut writer) = tokio::io::split(channel.into_stream());
        let mut reader = BufReader::new(reader);

        send_file(&mut reader, &mut writer, local, remote, options, &self.reporter()).await?;
        writer.shutdown().await.ok();
        Ok(())
    }

    async fn close(&self) -> Result<()> {
        // Every copy runs on its own channel, which is gone once the call
        // returns. The connection itself belongs to the command handle.
        Ok(())
    }
}

pub(crate) struct Reporter<'a> {
    progress: &'a SharedProgress,
    peer: &'a Endpoint,
}

impl<'a> Reporter<'a> {
    pub(crate) fn new(progress: &'a SharedProgress, peer: &'a Endpoint) -> Self {
        Self { progress, peer }
    }

    fn report(&self, file: &str, total: u64, sent: u64) {
        progress::report(
            self.progress,
            &Progress {
                file,
                total,
                sent,
                peer: self.peer,
            },
        );
    }
}

fn sink_command(remote: &str, preserve_times: bool) -> String {
    let flags = if preserve_times { " -p" } else { "" };
    format!("scp -t{flags} {}", quote(remote))
}

fn source_command(remote: &str, recursive: bool, preserve_times: bool) -> String {
    let mut command = String::from("scp -f");
    if recursive {
        command.push_str(" -r");
    }
    if preserve_times {
        command.push_str(" -p");
    }
    format!("{command} {}", quote(remote))
}

/// Uploads one regular file, acting as the scp source.
pub(crate) async fn send_file<R, W>(
    reader: &mut R,
    writer: &mut W,
    local: &Path,
    remote: &str,
    options: &TransferOptions,
    reporter: &Reporter<'_>,
) -> Result<()>
where
    R: AsyncBufRead + Unpin + Send,
    W: AsyncWrite + Unpin + Send,
{
    read_ack(reader, remote).await?;

    let mut file = File::open(local).await.map_err(|e| Error::local(local, e))?;
    let metadata = file.metadata().await.map_err(|e| Error::local(local, e))?;
    if !metadata.is_file() {
        return Err(Error::local(
            local,
            io::Error::new(io::ErrorKind::InvalidInput, "not a regular file"),
        ));
    }
    let name = local_name(local);
    let size = metadata.len();

    if options.preserve_times {
        let (mtime, atime) = file_times(&metadata);
        send_line(writer, &format!("T{mtime} 0 {atime} 0")).await?;
        read_ack(reader, remote).await?;
    }

    send_line(writer, &format!("C{:04o} {} {}", file_mode(&metadata), size, name)).await?;
    read_ack(reader, remote).await?;

    let mut buf = vec![0u8; options.chunk_size.max(1)];
    let mut sent = 0u64;
    reporter.report(&name, size, sent);
    loop {
        let n = file.read(&mut buf).await.map_err(|e| Error::local(local, e))?;
        if n == 0 {
            break;
        }
        writer.write_all(&buf[..n]).await?;
        sent += n as u64;
        reporter.report(&name, size, sent);
    }
    if sent != size {
        return Err(Error::local(
            local,
            io::Error::new(io::ErrorKind::UnexpectedEof, "file changed size during upload"),
        ));
    }

    writer.write_all(&[0]).await?;
    writer.flush().await?;
    read_ack(reader, remote).await
}

/// Downloads whatever the scp source sends, files and (when recursive)
/// directories, under `local`.
pub(crate) async fn receive<R, W>(
    reader: &mut R,
    writer: &mut W,
    remote: &str,
    local: &Path,
    options: &TransferOptions,
    reporter: &Reporter<'_>,
) -> Result<()>
where
    R: AsyncBufRead + Unpin + Send,
    W: AsyncWrite + Unpin + Send,
{
    let mut dirs: Vec<PathBuf> = Vec::new();
    let mut times: Option<(u64, u64)> = None;
    let mut entries = 0usize;

    send_ack(writer).await?;
    loop {
        let mut line = Vec::new();
        if reader.read_until(b'\n', &mut line).await? == 0 {
            break;
        }
        if line[0] == b'C' || line[0] == b'D' {
            entries += 1;
        }
        let code = line[0];
        let rest = String::from_utf8_lossy(&line[1..]);
        let rest = rest.trim_end_matches('\n');

        match code {
            b'C' => {
                let (mode, size, name) = parse_header(rest)?;
                let target = target_path(local, &dirs, &name);
                send_ack(writer).await?;
                receive_file(reader, &target, &name, mode, size, options, reporter).await?;
                read_ack(reader, remote).await?;
                if let Some((mtime, atime)) = times.take() {
                    set_file_times(&target, mtime, atime);
                }
                send_ack(writer).await?;
            }
            b'D' => {
                let (_, _, name) = parse_header(rest)?;
                let target = target_path(local, &dirs, &name);
                tokio::fs::create_dir_all(&target)
                    .await
                    .map_err(|e| Error::local(&target, e))?;
                debug!(dir = %target.display(), "scp enter directory");
                dirs.push(target);
                times = None;
                send_ack(writer).await?;
            }
            b'E' => {
                dirs.pop();
                send_ack(writer).await?;
            }
            b'T' => {
                times = Some(parse_times(rest)?);
                send_ack(writer).await?;
            }
            1 | 2 => return Err(remote_error(remote, rest)),
            other => {
                return Err(Error::Protocol(format!(
                    "unexpected scp record {:?}",
                    char::from(other)
                )))
            }
        }
    }

    // A source that cannot start (no scp binary, bad shell) just hangs up.
    if entries == 0 {
        return Err(Error::remote(
            remote,
            io::ErrorKind::Other,
            "remote scp ended without sending anything, is scp installed on the host?",
        ));
    }
    if !dirs.is_empty() {
        return Err(Error::Protocol(format!(
            "stream ended inside directory `{}`",
            remote
        )));
    }
    Ok(())
}

async fn receive_file<R>(
    reader: &mut R,
    target: &Path,
    name: &str,
    mode: u32,
    size: u64,
    options: &TransferOptions,
    reporter: &Reporter<'_>,
) -> Result<()>
where
    R: AsyncBufRead + Unpin + Send,
{
    let mut file = File::create(target).await.map_err(|e| Error::local(target, e))?;
    let mut buf = vec![0u8; options.chunk_size.max(1)];
    let mut remaining = size;

    reporter.report(name, size, 0);
    while remaining > 0 {
        let want = remaining.min(buf.len() as u64) as usize;
        let n = reader.read(&mut buf[..want]).await?;
        if n == 0 {
            return Err(Error::Protocol(format!(
                "stream ended with {remaining} bytes of `{name}` outstanding"
            )));
        }
        file.write_all(&buf[..n]).await.map_err(|e| Error::local(target, e))?;
        remaining -= n as u64;
        reporter.report(name, size, size - remaining);
    }
    file.flush().await.map_err(|e| Error::local(target, e))?;
    set_file_mode(target, mode).await;
    Ok(())
}

async fn send_line<W: AsyncWrite + Unpin>(writer: &mut W, line: &str) -> Result<()> {
    writer.write_all(line.as_bytes()).await?;
    writer.write_all(b"\n").await?;
    writer.flush().await?;
    Ok(())
}

async fn send_ack<W: AsyncWrite + Unpin>(writer: &mut W) -> Result<()> {
    writer.write_all(&[0]).await?;
    writer.flush().await?;
    Ok(())
}

async fn read_ack<R: AsyncBufRead + Unpin>(reader: &mut R, remote: &str) -> Result<()> {
    let mut code = [0u8; 1];
    if reader.read(&mut code).await? == 0 {
        return Err(Error::Protocol("remote scp closed the stream".into()));
    }
    match code[0] {
        0 => Ok(()),
        1 | 2 => {
            let mut message = Vec::new();
            reader.read_until(b'\n', &mut message).await?;
            let message = String::from_utf8_lossy(&message);
            Err(remote_error(remote, message.trim_end()))
        }
        other => Err(Error::Protocol(format!(
            "unexpected scp response byte {other:#04x}"
        ))),
    }
}

fn remote_error(remote: &str, message: &str) -> Error {
    let message = message.trim_start_matches("scp: ").trim_end();
    let kind = if message.contains("No such file or directory") {
        io::ErrorKind::NotFound
    } else if message.contains("Permission denied") {
        io::ErrorKind::PermissionDenied
    } else {
        io::ErrorKind::Other
    };
    Error::remote(remote, kind, message)
}

/// `C0644 1234 name` / `D0755 0 name` without the leading record byte.
fn parse_header(rest: &str) -> Result<(u32, u64, String)> {
    let mut parts = rest.splitn(3, ' ');
    let (Some(mode), Some(size), Some(name)) = (parts.next(), parts.next(), parts.next()) else {
        return Err(Error::Protocol(format!("malformed scp header {rest:?}")));
    };
    let mode = u32::from_str_radix(mode, 8)
        .map_err(|_| Error::Protocol(format!("bad mode in scp header {rest:?}")))?;
    let size = size
        .parse()
        .map_err(|_| Error::Protocol(format!("bad size in scp header {rest:?}")))?;
    if name.is_empty() || name == "." || name == ".." || name.contains('/') {
        return Err(Error::Protocol(format!("refusing scp entry name {name:?}")));
    }
    Ok((mode, size, name.to_string()))
}

/// `T<mtime> 0 <atime> 0` without the leading record byte.
fn parse_times(rest: &str) -> Result<(u64, u64)> {
    let fields: Vec<&str> = rest.split(' ').collect();
    match fields.as_slice() {
        [mtime, _, atime, _] => {
            let mtime = mtime.parse().ok();
            let atime = atime.parse().ok();
            mtime
                .zip(atime)
                .ok_or_else(|| Error::Protocol(format!("bad scp times {rest:?}")))
        }
        _ => Err(Error::Protocol(format!("bad scp times {rest:?}"))),
    }
}

/// Where an incoming entry lands: inside `local` when it is an existing
/// directory, as `local` itself otherwise; nested entries go under the
/// directory currently being received.
fn target_path(local: &Path, dirs: &[PathBuf], name: &str) -> PathBuf {
    match dirs.last() {
        Some(dir) => dir.join(name),
        None if local.is_dir() => local.join(name),
        None => local.to_path_buf(),
    }
}

fn file_times(metadata: &Metadata) -> (u64, u64) {
    let secs = |t: io::Result<std::time::SystemTime>| {
        t.ok()
            .and_then(|t| t.duration_since(UNIX_EPOCH).ok())
            .map(|d| d.as_secs())
            .unwrap_or(0)
    };
    (secs(metadata.modified()), secs(metadata.accessed()))
}

#[cfg(unix)]
fn file_mode(metadata: &Metadata) -> u32 {
    use std::os::unix::fs::PermissionsExt;
    metadata.permissions().mode() & 0o7777
}

#[cfg(not(unix))]
fn file_mode(_metadata: &Metadata) -> u32 {
    0o644
}

#[cfg(unix)]
async fn set_file_mode(target: &Path, mode: u32) {
    use std::os::unix::fs::PermissionsExt;
    let permissions = std::fs::Permissions::from_mode(mode & 0o7777);
    if let Err(e) = tokio::fs::set_permissions(target, permissions).await {
        warn!(path = %target.display(), "unable to set mode {mode:o}: {e}");
    }
}

#[cfg(not(unix))]
async fn set_file_mode(_target: &Path, _mode: u32) {}

fn set_file_times(target: &Path, mtime: u64, atime: u64) {
    let times = FileTimes::new()
        .set_modified(UNIX_EPOCH + Duration::from_secs(mtime))
        .set_accessed(UNIX_EPOCH + Duration::from_secs(atime));
    let result = std::fs::File::options()
        .write(true)
        .open(target)
        .and_then(|file| file.set_times(times));
    if let Err(e) = result {
        warn!(path = %target.display(), "unable to set file times: {e}");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::progress::{shared, NoProgress};
    use tokio::io::{duplex, split, AsyncReadExt, AsyncWriteExt};

    async fn read_line(stream: &mut (impl tokio::io::AsyncRead + Unpin)) -> String {
        let mut line = Vec::new();
        let mut byte = [0u8; 1];
        loop {
            stream.read_exact(&mut byte).await.unwrap();
            if byte[0] == b'\n' {
                break;
            }
            line.push(byte[0]);
        }
        String::from_utf8(line).unwrap()
    }

    async fn expect_ack(stream: &mut (impl tokio::io::AsyncRead + Unpin)) {
        let mut byte = [0xffu8; 1];
        stream.read_exact(&mut byte).await.unwrap();
        assert_eq!(byte[0], 0);
    }

    #[test]
    fn test_commands_quote_paths() {
        assert_eq!(sink_command("/remote/dst", false), "scp -t /remote/dst");
        assert_eq!(
            source_command("/sdcard/My Music", true, true),
            "scp -f -r -p '/sdcard/My Music'"
        );
    }

    #[test]
    fn test_parse_header() {
        assert_eq!(
            parse_header("0644 12 holiday photo.jpg").unwrap(),
            (0o644, 12, "holiday photo.jpg".to_string())
        );
        assert!(matches!(parse_header("0644 12 ../etc"), Err(Error::Protocol(_))));
        assert!(matches!(parse_header("0644 12 a/b"), Err(Error::Protocol(_))));
        assert!(matches!(parse_header("garbage"), Err(Error::Protocol(_))));
    }

    #[test]
    fn test_remote_error_kinds() {
        let err = remote_error("/missing", "scp: /missing: No such file or directory");
        assert!(err.is_not_found());
        let err = remote_error("/root", "scp: /root/x: Permission denied");
        assert_eq!(err.io_kind(), Some(io::ErrorKind::PermissionDenied));
    }

    #[tokio::test]
    async fn test_send_file_speaks_sink_protocol() {
        let dir = tempfile::tempdir().unwrap();
        let local = dir.path().join("f1.txt");
        std::fs::write(&local, b"hello world").unwrap();

        let (client, mut server) = duplex(4096);
        let remote = tokio::spawn(async move {
            server.write_all(&[0]).await.unwrap();
            let header = read_line(&mut server).await;
            server.write_all(&[0]).await.unwrap();
            let mut body = vec![0u8; 11];
            server.read_exact(&mut body).await.unwrap();
            expect_ack(&mut server).await;
            server.write_all(&[0]).await.unwrap();
            (header, body)
        });

        let (reader, mut writer) = split(client);
        let mut reader = BufReader::new(reader);
        let progress = shared(NoProgress);
        let peer = Endpoint::new("10.0.0.5", 22);
        let options = TransferOptions::default();
        send_file(
            &mut reader,
            &mut writer,
            &local,
            "/remote/dst",
            &options,
            &Reporter::new(&progress, &peer),
        )
        .await
        .unwrap();

        let (header, body) = remote.await.unwrap();
        assert!(header.starts_with('C'));
        assert!(header.ends_with(" 11 f1.txt"));
        assert_eq!(body, b"hello world");
    }

    #[tokio::test]
    async fn test_receive_recursive_tree() {
        let dir = tempfile::tempdir().unwrap();
        let (client, mut server) = duplex(4096);
        let remote = tokio::spawn(async move {
            expect_ack(&mut server).await;
            server.write_all(b"D0755 0 DCIM\n").await.unwrap();
            expect_ack(&mut server).await;
            server.write_all(b"C0644 5 a.jpg\n").await.unwrap();
            expect_ack(&mut server).await;
            server.write_all(b"hello\0").await.unwrap();
            expect_ack(&mut server).await;
            server.write_all(b"E\n").await.unwrap();
            expect_ack(&mut server).await;
        });

        let (reader, mut writer) = split(client);
        let mut reader = BufReader::new(reader);
        let progress = shared(NoProgress);
        let peer = Endpoint::new("10.0.0.5", 22);
        receive(
            &mut reader,
            &mut writer,
            "/sdcard/DCIM",
            dir.path(),
            &TransferOptions::default(),
            &Reporter::new(&progress, &peer),
        )
        .await
        .unwrap();
        remote.await.unwrap();

        let content = std::fs::read(dir.path().join("DCIM").join("a.jpg")).unwrap();
        assert_eq!(content, b"hello");
    }

    #[tokio::test]
    async fn test_receive_rejects_silent_source() {
        let dir = tempfile::tempdir().unwrap();
        let (client, mut server) = duplex(4096);
        let remote = tokio::spawn(async move {
            expect_ack(&mut server).await;
            drop(server);
        });

        let (reader, mut writer) = split(client);
        let mut reader = BufReader::new(reader);
        let progress = shared(NoProgress);
        let peer = Endpoint::new("10.0.0.5", 22);
        let result = receive(
            &mut reader,
            &mut writer,
            "/sdcard/DCIM",
            dir.path(),
            &TransferOptions::default(),
            &Reporter::new(&progress, &peer),
        )
        .await;
        remote.await.unwrap();

        let err = result.unwrap_err();
        assert!(matches!(err, Error::Remote { ref path, .. } if path == "/sdcard/DCIM"));
        assert_eq!(std::fs::read_dir(dir.path()).unwrap().count(), 0);
    }

    #[tokio::test]
    async fn test_receive_rejects_truncated_directory() {
        let dir = tempfile::tempdir().unwrap();
        let (client, mut server) = duplex(4096);
        let remote = tokio::spawn(async move {
            expect_ack(&mut server).await;
            server.write_all(b"D0755 0 DCIM\n").await.unwrap();
            expect_ack(&mut server).await;
        });

        let (reader, mut writer) = split(client);
        let mut reader = BufReader::new(reader);
        let progress = shared(NoProgress);
        let peer = Endpoint::new("10.0.0.5", 22);
        let result = receive(
            &mut reader,
            &mut writer,
            "/sdcard/DCIM",
            dir.path(),
            &TransferOptions::default(),
            &Reporter::new(&progress, &peer),
        )
        .await;
        remote.await.unwrap();

        assert!(matches!(result, Err(Error::Protocol(_))));
    }

    #[tokio::test]
    async fn test_receive_reports_missing_source() {
        let dir = tempfile::tempdir().unwrap();
        let (client, mut server) = duplex(4096);
        let remote = tokio::spawn(async move {
            expect_ack(&mut server).await;
            server
                .write_all(b"\x01scp: /missing: No such file or directory\n")
                .await
                .unwrap();
        });

        let (reader, mut writer) = split(client);
        let mut reader = BufReader::new(reader);
        let progress = shared(NoProgress);
        let peer = Endpoint::new("10.0.0.5", 22);
        let err = receive(
            &mut reader,
            &mut writer,
            "/missing",
            dir.path(),
            &TransferOptions::default(),
            &Reporter::new(&progress, &peer),
        )
        .await
        .unwrap_err();
        remote.await.unwrap();

        assert!(err.is_not_found());
    }
}
