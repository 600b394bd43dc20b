use std::borrow::Cow;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};

pub static CONFIG_DIR: &str = ".config/ssh-courier";
pub static CONFIG_FILE: &str = "config.toml";

pub fn get_file_path(file_name: &str) -> Result<PathBuf> {
    let mut config_dir: PathBuf = if cfg!(debug_assertions) {
        ".".into() // current running dir
    } else {
        dirs::home_dir().context("Unable to reach user's home directory.")?
    };

    config_dir.push(CONFIG_DIR);
    config_dir.push(file_name);
    Ok(config_dir)
}

/// Expands a leading `~/` against the home directory.
pub fn expand_home(path: &Path) -> PathBuf {
    match (path.strip_prefix("~"), dirs::home_dir()) {
        (Ok(rest), Some(home)) => home.join(rest),
        _ => path.to_path_buf(),
    }
}

/// Joins remote paths with `/` whatever the local platform is.
pub fn remote_join(dir: &str, name: &str) -> String {
    if dir.is_empty() {
        name.to_string()
    } else if dir.ends_with('/') {
        format!("{dir}{name}")
    } else {
        format!("{dir}/{name}")
    }
}

pub fn remote_basename(path: &str) -> &str {
    let trimmed = path.trim_end_matches('/');
    trimmed.rsplit('/').next().unwrap_or(trimmed)
}

/// Quotes a remote path for a POSIX shell command line.
pub fn quote(path: &str) -> Cow<'_, str> {
    shell_escape::unix::escape(Cow::Borrowed(path))
}

/// Local base name as the remote side will see it.
pub fn local_name(path: &Path) -> String {
    path.file_name()
        .map(|name| name.to_string_lossy().into_owned())
        .unwrap_or_else(|| path.to_string_lossy().into_owned())
}
