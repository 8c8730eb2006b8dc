//! Configuration management

use anyhow::{bail, Context, Result};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::duration::parse_duration;

/// Environment variable holding the SSH password
pub const PASSWORD_ENV: &str = "NODECTL_PASSWORD";

/// Defaults read from `~/.config/nodectl/config.toml`
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// SSH user name
    pub user: Option<String>,

    /// SSH port for nodes that do not name one
    pub port: Option<u16>,

    /// Private key file
    pub identity: Option<PathBuf>,

    /// Per-command timeout, e.g. "30s" or "2m"
    pub timeout: Option<String>,

    /// Cap on simultaneously contacted nodes
    pub max_concurrency: Option<usize>,

    /// Named node lists, used on the command line as `@name`
    pub groups: HashMap<String, Vec<String>>,
}

impl Config {
    /// Load configuration from `path`, or from the default location if it exists
    pub fn load(path: Option<&Path>) -> Result<Self> {
        match path {
            Some(p) => Self::load_from_file(p),
            None => match default_path() {
                Some(p) if p.is_file() => Self::load_from_file(&p),
                _ => Ok(Self::default()),
            },
        }
    }

    /// Load from configuration file
    fn load_from_file(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config {}", path.display()))?;

        toml::from_str(&content)
            .with_context(|| format!("Failed to parse config {}", path.display()))
    }

    /// Configured command timeout, if any
    pub fn command_timeout(&self) -> Result<Option<Duration>> {
        self.timeout
            .as_deref()
            .map(|t| parse_duration(t).map_err(|e| anyhow::anyhow!("Invalid timeout in config: {}", e)))
            .transpose()
    }

    /// Flatten node arguments into host strings
    ///
    /// Each argument may hold several comma-separated entries; `@name` expands
    /// to the hosts of group `name`.
    pub fn expand_nodes(&self, nodes: &[String]) -> Result<Vec<String>> {
        let mut hosts = Vec::new();
        for entry in nodes.iter().flat_map(|n| n.split(',')) {
            let entry = entry.trim();
            if entry.is_empty() {
                continue;
            }
            match entry.strip_prefix('@') {
                Some(group) => match self.groups.get(group) {
                    Some(members) => hosts.extend(members.iter().cloned()),
                    None => bail!("Unknown node group '{}'", group),
                },
                None => hosts.push(entry.to_string()),
            }
        }

        if hosts.is_empty() {
            bail!("Node list is empty");
        }
        Ok(hosts)
    }
}

/// `~/.config/nodectl/config.toml`
pub fn default_path() -> Option<PathBuf> {
    dirs::home_dir().map(|home| home.join(".config").join("nodectl").join("config.toml"))
}

/// Get secret from environment variable or file
///
/// Supports both direct environment variables and file-based secrets (Docker/Kubernetes pattern).
/// If `VAR_NAME` is not found, tries `VAR_NAME_FILE` which should point to a file containing the secret.
///
/// # Examples
///
/// ```no_run
/// std::env::set_var("NODECTL_PASSWORD_FILE", "/run/secrets/ssh_password");
/// let password = get_secret("NODECTL_PASSWORD");
/// ```
pub fn get_secret(var_name: &str) -> Option<String> {
    // Try environment variable first
    if let Ok(value) = std::env::var(var_name) {
        return Some(value);
    }

    // Try file-based secret (Docker secrets / Kubernetes)
    let file_var = format!("{}_FILE", var_name);
    if let Ok(path) = std::env::var(&file_var) {
        if let Ok(contents) = std::fs::read_to_string(&path) {
            return Some(contents.trim().to_string());
        }
    }

    None
}
