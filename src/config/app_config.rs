use anyhow::{Context, Result};
use serde::Deserialize;
use std::{fs, path::Path, path::PathBuf, time::Duration};

use crate::helper::{expand_home, get_file_path, CONFIG_FILE};
use crate::ssh::policy::TrustPolicy;
use crate::ssh::session::{TransportTag, DEFAULT_CONNECT_TIMEOUT};
use crate::ssh::ssh_session::DEFAULT_PORT;

fn default_port() -> u16 {
    DEFAULT_PORT
}

#[derive(Deserialize, Debug, Clone, PartialEq)]
pub struct Server {
    pub name: String,
    pub ip: String,
    #[serde(default = "default_port")]
    pub port: u16,
    pub user: Option<String>,
    pub private_key: Option<PathBuf>,
    pub public_key: Option<PathBuf>,
    pub policy: Option<TrustPolicy>,
}

impl Server {
    pub fn private_key_path(&self) -> Option<PathBuf> {
        self.private_key.as_deref().map(expand_home)
    }

    pub fn public_key_path(&self) -> Option<PathBuf> {
        self.public_key.as_deref().map(expand_home)
    }
}

#[derive(Deserialize, Debug, Default)]
pub struct Config {
    pub connect_timeout_secs: Option<u64>,
    pub default_transport: Option<TransportTag>,
    #[serde(default)]
    pub servers: Vec<Server>,
}

impl Config {
    pub fn connect_timeout(&self) -> Duration {
        self.connect_timeout_secs
            .map(Duration::from_secs)
            .unwrap_or(DEFAULT_CONNECT_TIMEOUT)
    }

    /// Looks a server up by name, falling back to its address.
    pub fn find_server(&self, target: &str) -> Option<&Server> {
        self.servers
            .iter()
            .find(|server| server.name == target)
            .or_else(|| self.servers.iter().find(|server| server.ip == target))
    }
}

/**
    check if config file and it's directory exists
*/
pub fn ensure_config_exists() -> Result<PathBuf> {
    let config_file_path = get_file_path(CONFIG_FILE)?;
    if let Some(config_dir) = config_file_path.parent() {
        if !config_dir.exists() {
            fs::create_dir_all(config_dir).context(format!(
                "Failed to create config directory at {:?}",
                config_dir
            ))?;
        }
    }

    if !config_file_path.exists() {
        fs::File::create(&config_file_path).context(format!(
            "Failed to create config file at {:?}",
            config_file_path
        ))?;
    }

    Ok(config_file_path)
}

/**
    read toml format config
    from "~/.config/ssh-courier/config.toml" unless a path is given
*/
pub fn read_config(path: Option<&Path>) -> Result<Config> {
    let config_path = match path {
        Some(path) => path.to_path_buf(),
        None => ensure_config_exists()?,
    };

    let config_str = fs::read_to_string(&config_path)
        .with_context(|| format!("Unable to read ssh-courier's config file at {:?}", config_path))?;

    parse_config(&config_str)
}

fn parse_config(config_str: &str) -> Result<Config> {
    // Check if the config file content is empty
    if config_str.trim().is_empty() {
        return Ok(Config::default());
    }

    toml::from_str(config_str).context("Failed to parse ssh-courier's config file.")
}
