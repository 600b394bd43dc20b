use std::env;
use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use russh_keys::key::KeyPair;
use russh_keys::load_secret_key;
use tracing::debug;
use zeroize::Zeroizing;

use crate::error::{Error, Result};

/// Key files as named by the caller. The public key is optional, but if it is
/// declared it has to exist just like the private key.
#[derive(Clone)]
pub struct KeyFiles {
    pub private_key: PathBuf,
    pub public_key: Option<PathBuf>,
    pub passphrase: Option<Zeroizing<String>>,
}

impl KeyFiles {
    pub fn new(private_key: impl Into<PathBuf>) -> Self {
        Self {
            private_key: private_key.into(),
            public_key: None,
            passphrase: None,
        }
    }

    pub fn public_key(mut self, path: impl Into<PathBuf>) -> Self {
        self.public_key = Some(path.into());
        self
    }

    pub fn passphrase(mut self, passphrase: impl Into<String>) -> Self {
        self.passphrase = Some(Zeroizing::new(passphrase.into()));
        self
    }
}

/// Authentication material for exactly one method.
#[derive(Clone)]
pub enum CredentialBundle {
    Password {
        username: String,
        password: Zeroizing<String>,
    },
    Key {
        username: String,
        key: Arc<KeyPair>,
        private_key_path: PathBuf,
        public_key_path: Option<PathBuf>,
        passphrase: Option<Zeroizing<String>>,
    },
}

impl CredentialBundle {
    pub fn username(&self) -> &str {
        match self {
            CredentialBundle::Password { username, .. } | CredentialBundle::Key { username, .. } => {
                username
            }
        }
    }

    pub fn method(&self) -> &'static str {
        match self {
            CredentialBundle::Password { .. } => "password",
            CredentialBundle::Key { .. } => "publickey",
        }
    }
}

impl fmt::Debug for CredentialBundle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CredentialBundle::Password { username, .. } => f
                .debug_struct("Password")
                .field("username", username)
                .finish_non_exhaustive(),
            CredentialBundle::Key {
                username,
                private_key_path,
                public_key_path,
                ..
            } => f
                .debug_struct("Key")
                .field("username", username)
                .field("private_key_path", private_key_path)
                .field("public_key_path", public_key_path)
                .finish_non_exhaustive(),
        }
    }
}

struct LoadedKey {
    key: Arc<KeyPair>,
    files: KeyFiles,
}

/// Holds whatever the caller supplied. Key files are checked and decrypted
/// on construction; whether the inputs add up to a usable method is only
/// decided by [`CredentialResolver::resolve`] when a session opens.
pub struct CredentialResolver {
    username: Option<String>,
    password: Option<Zeroizing<String>>,
    key: Option<LoadedKey>,
}

impl CredentialResolver {
    pub fn new(
        username: Option<String>,
        password: Option<String>,
        key_files: Option<KeyFiles>,
    ) -> Result<Self> {
        let key = match key_files {
            Some(files) => Some(load_key(files)?),
            None => None,
        };
        Ok(Self {
            username: username.filter(|u| !u.is_empty()),
            password: password.map(Zeroizing::new),
            key,
        })
    }

    pub fn password(username: impl Into<String>, password: impl Into<String>) -> Self {
        Self {
            username: Some(username.into()),
            password: Some(Zeroizing::new(password.into())),
            key: None,
        }
    }

    pub fn key(username: Option<String>, files: KeyFiles) -> Result<Self> {
        Self::new(username, None, Some(files))
    }

    /// Picks the method: key material first, then username/password.
    pub fn resolve(&self) -> Result<CredentialBundle> {
        if let Some(loaded) = &self.key {
            let username = self
                .username
                .clone()
                .or_else(local_username)
                .ok_or(Error::InsufficientCredentials)?;
            return Ok(CredentialBundle::Key {
                username,
                key: loaded.key.clone(),
                private_key_path: loaded.files.private_key.clone(),
                public_key_path: loaded.files.public_key.clone(),
                passphrase: loaded.files.passphrase.clone(),
            });
        }

        match (&self.username, &self.password) {
            (Some(username), Some(password)) => Ok(CredentialBundle::Password {
                username: username.clone(),
                password: password.clone(),
            }),
            _ => Err(Error::InsufficientCredentials),
        }
    }
}

fn load_key(files: KeyFiles) -> Result<LoadedKey> {
    ensure_exists(&files.private_key)?;
    if let Some(public_key) = &files.public_key {
        ensure_exists(public_key)?;
    }

    let passphrase = files.passphrase.as_ref().map(|p| p.as_str());
    let key = load_secret_key(&files.private_key, passphrase).map_err(|source| Error::KeyDecrypt {
        path: files.private_key.clone(),
        source,
    })?;
    debug!(path = %files.private_key.display(), "loaded private key");

    Ok(LoadedKey {
        key: Arc::new(key),
        files,
    })
}

fn ensure_exists(path: &Path) -> Result<()> {
    if path.exists() {
        Ok(())
    } else {
        Err(Error::CredentialFileMissing {
            path: path.to_path_buf(),
        })
    }
}

fn local_username() -> Option<String> {
    env::var("USER")
        .or_else(|_| env::var("USERNAME"))
        .ok()
        .filter(|u| !u.is_empty())
}
