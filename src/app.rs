use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::{ArgAction, Parser, Subcommand};
use ssh_courier_lib::config::app_config::{read_config, Config, Server};
use ssh_courier_lib::progress::{self, ConsoleProgress};
use ssh_courier_lib::ssh::client::RusshConnector;
use ssh_courier_lib::ssh::ssh_session::DEFAULT_PORT;
use ssh_courier_lib::{
    BatchPolicy, BatchReport, CredentialResolver, Endpoint, Error, KeyFiles, Session,
    SessionOptions, TransferOptions, TransportTag, TrustPolicy, UploadLayout,
};
use tracing::{debug, info};

#[derive(Parser, Debug)]
#[command(name = "ssh-courier", version, about)]
pub struct Cli {
    /// Server name from the config file, or a host address
    pub target: String,

    #[arg(long)]
    pub port: Option<u16>,

    #[arg(short = 'u', long)]
    pub username: Option<String>,

    #[arg(short = 'p', long, conflicts_with = "ask_password")]
    pub password: Option<String>,

    /// Prompt for the password instead of taking it from the command line
    #[arg(long)]
    pub ask_password: bool,

    /// Private key file
    #[arg(long)]
    pub key: Option<PathBuf>,

    /// Public key file, checked for existence when given
    #[arg(long, requires = "key")]
    pub pubkey: Option<PathBuf>,

    #[arg(long)]
    pub passphrase: Option<String>,

    /// What to do with a host key that is not in known_hosts
    #[arg(long, value_enum)]
    pub policy: Option<TrustPolicy>,

    #[arg(short = 't', long, value_enum)]
    pub transport: Option<TransportTag>,

    #[arg(long)]
    pub config: Option<PathBuf>,

    /// More logging on stderr, repeat for more
    #[arg(short = 'v', long, action = ArgAction::Count)]
    pub verbose: u8,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Run commands one after another
    Exec {
        #[arg(required = true)]
        commands: Vec<String>,
    },
    Upload {
        #[command(flatten)]
        batch: BatchArgs,
        /// Recreate local subdirectories remotely instead of uploading flat
        #[arg(long, requires = "recursive")]
        mirror: bool,
        #[arg(required = true, num_args = 1..)]
        sources: Vec<PathBuf>,
        destination: String,
    },
    Download {
        #[command(flatten)]
        batch: BatchArgs,
        #[arg(required = true, num_args = 1..)]
        sources: Vec<String>,
        destination: PathBuf,
    },
    /// List a remote directory over sftp
    Ls {
        #[arg(short = 'l')]
        long: bool,
        path: String,
    },
    Stat {
        path: String,
    },
    Rm {
        #[arg(long)]
        abort_on_error: bool,
        #[arg(required = true)]
        paths: Vec<String>,
    },
    Rmdir {
        #[arg(long)]
        abort_on_error: bool,
        #[arg(required = true)]
        paths: Vec<String>,
    },
    /// Create remote directories, /sdcard/Download/HelloWorld by default
    Mkdir {
        paths: Vec<String>,
    },
    /// Pull the media folders of an Android device
    BackupMedia {
        #[arg(long = "source")]
        sources: Vec<String>,
        destination: PathBuf,
    },
    /// Pull /sdcard/Download of an Android device
    BackupDocuments {
        #[arg(long = "source")]
        sources: Vec<String>,
        destination: PathBuf,
    },
}

#[derive(clap::Args, Debug, Clone, Copy)]
pub struct BatchArgs {
    #[arg(short = 'r', long)]
    pub recursive: bool,
    /// Keep modification times (scp only)
    #[arg(long)]
    pub preserve: bool,
    #[arg(long)]
    pub abort_on_error: bool,
}

impl BatchArgs {
    fn options(self, layout: UploadLayout) -> TransferOptions {
        TransferOptions {
            preserve_times: self.preserve,
            on_error: batch_policy(self.abort_on_error),
            layout,
            ..TransferOptions::default()
        }
    }
}

fn batch_policy(abort_on_error: bool) -> BatchPolicy {
    if abort_on_error {
        BatchPolicy::AbortOnError
    } else {
        BatchPolicy::Continue
    }
}

/// Connects, runs the command and closes. `Ok(false)` means the command ran
/// but something in it failed.
pub async fn run(cli: Cli) -> Result<bool> {
    let config = read_config(cli.config.as_deref())?;
    let server = config.find_server(&cli.target).cloned();
    if let Some(server) = &server {
        debug!(name = %server.name, "using configured server");
    }

    let endpoint = Endpoint::new(
        server.as_ref().map_or(cli.target.as_str(), |s| s.ip.as_str()),
        cli.port
            .or(server.as_ref().map(|s| s.port))
            .unwrap_or(DEFAULT_PORT),
    );
    let policy = cli
        .policy
        .or(server.as_ref().and_then(|s| s.policy))
        .unwrap_or_default();
    let tag = cli
        .transport
        .or(config.default_transport)
        .unwrap_or(TransportTag::AcceleratedCopy);

    let resolver = credentials(&cli, server.as_ref(), &endpoint)?;
    let session = Session::open_with(
        &RusshConnector,
        endpoint.clone(),
        policy.build(),
        &resolver,
        session_options(&config),
    )
    .await
    .with_context(|| format!("Unable to open a session to {endpoint}"))?;
    info!(host = %endpoint, %tag, "connected");

    let command = cli.command;
    let success = session
        .scope(|session| Box::pin(dispatch(session, tag, command)))
        .await?;
    Ok(success)
}

fn session_options(config: &Config) -> SessionOptions {
    SessionOptions {
        connect_timeout: config.connect_timeout(),
        progress: progress::shared(ConsoleProgress::stdout()),
    }
}

fn credentials(cli: &Cli, server: Option<&Server>, endpoint: &Endpoint) -> Result<CredentialResolver> {
    let username = cli
        .username
        .clone()
        .or_else(|| server.and_then(|s| s.user.clone()));

    let password = if cli.ask_password {
        let prompt = format!(
            "{}@{}'s password: ",
            username.as_deref().unwrap_or_default(),
            endpoint.host()
        );
        Some(rpassword::prompt_password(prompt).context("Unable to read password")?)
    } else {
        cli.password.clone()
    };

    let private_key = cli
        .key
        .clone()
        .or_else(|| server.and_then(Server::private_key_path))
        .or_else(|| if password.is_none() { find_best_key() } else { None });
    let public_key = cli
        .pubkey
        .clone()
        .or_else(|| server.and_then(Server::public_key_path));

    let key_files = private_key.map(|private_key| {
        let mut files = KeyFiles::new(private_key);
        if let Some(public_key) = public_key {
            files = files.public_key(public_key);
        }
        if let Some(passphrase) = &cli.passphrase {
            files = files.passphrase(passphrase.as_str());
        }
        files
    });

    load_with_passphrase(username, password, key_files)
}

/// Asks for the passphrase once if the key turns out to be encrypted.
fn load_with_passphrase(
    username: Option<String>,
    password: Option<String>,
    key_files: Option<KeyFiles>,
) -> Result<CredentialResolver> {
    match CredentialResolver::new(username.clone(), password.clone(), key_files.clone()) {
        Err(Error::KeyDecrypt {
            path,
            source: russh_keys::Error::KeyIsEncrypted,
        }) => {
            let passphrase = rpassword::prompt_password(format!(
                "Enter passphrase for key {}: ",
                path.display()
            ))
            .context("Unable to read passphrase")?;
            let key_files = key_files.map(|files| files.passphrase(passphrase));
            CredentialResolver::new(username, password, key_files).map_err(Into::into)
        }
        result => result.map_err(Into::into),
    }
}

async fn dispatch(
    session: &Session,
    tag: TransportTag,
    command: Command,
) -> ssh_courier_lib::Result<bool> {
    match command {
        Command::Exec { commands } => {
            let outputs = session.run(&commands).await?;
            for (command, output) in commands.iter().zip(&outputs) {
                if !output.success() {
                    eprintln!(
                        "`{command}` exited with {:?}: {}",
                        output.exit_status,
                        String::from_utf8_lossy(&output.stderr).trim()
                    );
                }
            }
            Ok(outputs.iter().all(|output| output.success()))
        }
        Command::Upload {
            batch,
            mirror,
            sources,
            destination,
        } => {
            let layout = if mirror {
                UploadLayout::Mirror
            } else {
                UploadLayout::Flat
            };
            let report = session
                .upload_many(tag, &sources, &destination, batch.recursive, &batch.options(layout))
                .await;
            Ok(summarize(&report))
        }
        Command::Download {
            batch,
            sources,
            destination,
        } => {
            let report = session
                .download_many(
                    tag,
                    &sources,
                    &destination,
                    batch.recursive,
                    &batch.options(UploadLayout::default()),
                )
                .await;
            Ok(summarize(&report))
        }
        Command::Ls { long, path } => {
            if long {
                for entry in session.list_attributes(&path).await? {
                    let attrs = &entry.attributes;
                    println!(
                        "{}{:>6o} {:>12} {}",
                        if attrs.is_dir { 'd' } else { '-' },
                        attrs.permissions.unwrap_or_default() & 0o7777,
                        attrs.size.unwrap_or_default(),
                        entry.name
                    );
                }
            } else {
                for name in session.list_directory(&path).await? {
                    println!("{name}");
                }
            }
            Ok(true)
        }
        Command::Stat { path } => {
            let attrs = session.stat(&path).await?;
            println!("path:        {path}");
            println!("type:        {}", if attrs.is_dir { "directory" } else { "file" });
            println!("size:        {}", attrs.size.unwrap_or_default());
            println!("permissions: {:o}", attrs.permissions.unwrap_or_default() & 0o7777);
            println!("uid/gid:     {}/{}", attrs.uid.unwrap_or_default(), attrs.gid.unwrap_or_default());
            println!("mtime:       {}", attrs.mtime.unwrap_or_default());
            Ok(true)
        }
        Command::Rm {
            abort_on_error,
            paths,
        } => {
            let report = session.remove_files(&paths, batch_policy(abort_on_error)).await;
            Ok(summarize(&report))
        }
        Command::Rmdir {
            abort_on_error,
            paths,
        } => {
            let report = session
                .remove_directories(&paths, batch_policy(abort_on_error))
                .await;
            Ok(summarize(&report))
        }
        Command::Mkdir { paths } => {
            let paths = as_strs(&paths);
            let outputs = session.create_directories(non_empty(&paths)).await?;
            Ok(outputs.iter().all(|output| output.success()))
        }
        Command::BackupMedia {
            sources,
            destination,
        } => {
            let sources = as_strs(&sources);
            let report = session
                .backup_media_directories(tag, non_empty(&sources), &destination, &TransferOptions::default())
                .await;
            Ok(summarize(&report))
        }
        Command::BackupDocuments {
            sources,
            destination,
        } => {
            let sources = as_strs(&sources);
            let report = session
                .backup_document_directories(tag, non_empty(&sources), &destination, &TransferOptions::default())
                .await;
            Ok(summarize(&report))
        }
    }
}

fn as_strs(values: &[String]) -> Vec<&str> {
    values.iter().map(String::as_str).collect()
}

fn non_empty<'a>(values: &'a [&'a str]) -> Option<&'a [&'a str]> {
    (!values.is_empty()).then_some(values)
}

fn summarize(report: &BatchReport) -> bool {
    for (item, error) in report.failures() {
        eprintln!("{item}: {error}");
    }
    if report.aborted {
        eprintln!("stopped after the first failure");
    }
    report.is_success()
}

fn find_best_key() -> Option<PathBuf> {
    let home_dir = dirs::home_dir()?;
    let ssh_dir = home_dir.join(".ssh");

    let key_priorities = [
        "id_ecdsa",     // ecdsa-sha2-nistp256
        "id_ecdsa_384", // ecdsa-sha2-nistp384
        "id_ecdsa_521", // ecdsa-sha2-nistp521
        "id_ed25519",   // ssh-ed25519
        "id_rsa",       // rsa-sha2-256, rsa-sha2-512, ssh-rsa
    ];

    key_priorities
        .iter()
        .map(|key_name| ssh_dir.join(key_name))
        .find(|key_path| key_path.exists())
}
