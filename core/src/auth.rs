//! SSH credential resolution
//!
//! Builds one immutable [`ClientConfig`] per operation from an explicit
//! priority chain: password, identity file, ssh-agent, then the default key
//! files under `~/.ssh`. Everything the resolver reads from the environment is
//! captured up front in a [`ResolverEnv`], so the result depends only on its
//! inputs.

use russh::keys::PrivateKey;
use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

use crate::{Error, Result};

/// Default key files tried when no explicit credential is given
pub const DEFAULT_KEY_FILES: [&str; 3] = ["id_rsa", "id_ed25519", "id_ecdsa"];

/// Default time allowed for dial + handshake + authentication
pub const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(30);

/// Login name used when neither the options nor the environment name one
pub const FALLBACK_USER: &str = "root";

/// Credentials supplied by the caller
#[derive(Clone, Default)]
pub struct CredentialOptions {
    /// Login name; empty means "resolve from the environment"
    pub username: Option<String>,
    pub password: Option<String>,
    pub identity: Option<PathBuf>,
}

impl fmt::Debug for CredentialOptions {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CredentialOptions")
            .field("username", &self.username)
            .field("password", &self.password.as_ref().map(|_| "<redacted>"))
            .field("identity", &self.identity)
            .finish()
    }
}

/// Process environment as seen by the resolver
#[derive(Debug, Clone, Default)]
pub struct ResolverEnv {
    pub home_dir: Option<PathBuf>,
    /// Value of `SSH_AUTH_SOCK`
    pub agent_socket: Option<PathBuf>,
    /// Value of `USER` (or `USERNAME` on Windows)
    pub user: Option<String>,
}

impl ResolverEnv {
    /// Capture the current process environment
    pub fn from_process() -> Self {
        let user = ["USER", "USERNAME"]
            .iter()
            .filter_map(|var| std::env::var(var).ok())
            .find(|value| !value.is_empty());

        Self {
            home_dir: dirs::home_dir(),
            agent_socket: std::env::var_os("SSH_AUTH_SOCK")
                .filter(|value| !value.is_empty())
                .map(PathBuf::from),
            user,
        }
    }

    fn ssh_dir(&self) -> Option<PathBuf> {
        self.home_dir.as_ref().map(|home| home.join(".ssh"))
    }
}

/// One entry of the authentication chain
#[derive(Clone)]
pub enum AuthMethod {
    Password(String),
    PrivateKey { path: PathBuf, key: Arc<PrivateKey> },
    Agent { socket: PathBuf },
}

impl AuthMethod {
    /// Short label for logs
    pub fn label(&self) -> String {
        match self {
            AuthMethod::Password(_) => "password".to_string(),
            AuthMethod::PrivateKey { path, .. } => format!("key {}", path.display()),
            AuthMethod::Agent { socket } => format!("agent {}", socket.display()),
        }
    }
}

impl fmt::Debug for AuthMethod {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AuthMethod::Password(_) => f.write_str("Password(<redacted>)"),
            AuthMethod::PrivateKey { path, .. } => {
                f.debug_struct("PrivateKey").field("path", path).finish()
            }
            AuthMethod::Agent { socket } => f.debug_struct("Agent").field("socket", socket).finish(),
        }
    }
}

/// Server host key verification
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HostKeyPolicy {
    AcceptAny,
    /// Only keys listed in this known_hosts file are accepted
    KnownHosts(PathBuf),
}

/// Immutable client configuration shared by every host task
#[derive(Debug, Clone)]
pub struct ClientConfig {
    pub username: String,
    pub auth_methods: Vec<AuthMethod>,
    pub host_key_policy: HostKeyPolicy,
    pub connect_timeout: Duration,
}

impl ClientConfig {
    /// Login name for a host, honouring a `user@host` override
    pub fn username_for<'a>(&'a self, host_user: Option<&'a str>) -> &'a str {
        host_user.unwrap_or(&self.username)
    }
}

/// Build the client configuration for one operation
///
/// # Arguments
///
/// * `options` - Credentials supplied by the caller
/// * `env` - Snapshot of the process environment
///
/// # Errors
///
/// [`Error::NoAuthMethodAvailable`] when the chain ends up empty.
pub fn resolve(options: &CredentialOptions, env: &ResolverEnv) -> Result<ClientConfig> {
    let mut auth_methods = Vec::new();

    let password = options.password.as_ref().filter(|p| !p.is_empty());
    if let Some(password) = password {
        auth_methods.push(AuthMethod::Password(password.clone()));
    }

    if let Some(identity) = &options.identity {
        match load_key(identity) {
            Ok(key) => auth_methods.push(AuthMethod::PrivateKey {
                path: identity.clone(),
                key: Arc::new(key),
            }),
            Err(e) => warn!(path = %identity.display(), error = %e, "Skipping identity file"),
        }
    }

    // Agent and default keys are only consulted when nothing explicit was given
    if password.is_none() && options.identity.is_none() {
        if let Some(socket) = env.agent_socket.as_ref().filter(|s| agent_usable(s)) {
            debug!(socket = %socket.display(), "Using ssh-agent");
            auth_methods.push(AuthMethod::Agent {
                socket: socket.clone(),
            });
        }

        if let Some(ssh_dir) = env.ssh_dir() {
            for name in DEFAULT_KEY_FILES {
                let path = ssh_dir.join(name);
                if !path.exists() {
                    continue;
                }
                match load_key(&path) {
                    Ok(key) => auth_methods.push(AuthMethod::PrivateKey {
                        path,
                        key: Arc::new(key),
                    }),
                    Err(e) => debug!(path = %path.display(), error = %e, "Ignoring default key"),
                }
            }
        }
    }

    if auth_methods.is_empty() {
        return Err(Error::NoAuthMethodAvailable);
    }

    let username = options
        .username
        .clone()
        .filter(|u| !u.is_empty())
        .or_else(|| env.user.clone())
        .unwrap_or_else(|| FALLBACK_USER.to_string());

    let host_key_policy = match env.ssh_dir().map(|dir| dir.join("known_hosts")) {
        Some(path) => match std::fs::read_to_string(&path) {
            Ok(content) => match parse_known_hosts(&content) {
                Ok(()) => HostKeyPolicy::KnownHosts(path),
                Err(e) => {
                    warn!(
                        path = %path.display(),
                        error = %e,
                        "Unusable known_hosts, host keys will not be checked"
                    );
                    HostKeyPolicy::AcceptAny
                }
            },
            Err(_) => HostKeyPolicy::AcceptAny,
        },
        None => HostKeyPolicy::AcceptAny,
    };

    info!(
        user = %username,
        methods = ?auth_methods.iter().map(AuthMethod::label).collect::<Vec<_>>(),
        host_keys = ?host_key_policy,
        "Resolved SSH client configuration"
    );

    Ok(ClientConfig {
        username,
        auth_methods,
        host_key_policy,
        connect_timeout: DEFAULT_CONNECT_TIMEOUT,
    })
}

fn load_key(path: &Path) -> Result<PrivateKey> {
    let content = std::fs::read_to_string(path).map_err(|e| {
        Error::AuthConfigError(format!("Failed to read key {}: {}", path.display(), e))
    })?;
    russh::keys::decode_secret_key(&content, None).map_err(|e| {
        Error::AuthConfigError(format!("Failed to decode key {}: {}", path.display(), e))
    })
}

/// Check every entry of a known_hosts file: `[marker] hosts key-type base64-key [comment]`
fn parse_known_hosts(content: &str) -> std::result::Result<(), String> {
    for (index, line) in content.lines().enumerate() {
        let line = line.trim();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }

        let mut fields = line.split_whitespace().peekable();
        if let Some(marker) = fields.next_if(|f| f.starts_with('@')) {
            if marker != "@cert-authority" && marker != "@revoked" {
                return Err(format!("line {}: unknown marker {}", index + 1, marker));
            }
        }

        let (Some(_hosts), Some(_key_type), Some(key)) = (fields.next(), fields.next(), fields.next())
        else {
            return Err(format!("line {}: missing fields", index + 1));
        };
        russh::keys::parse_public_key_base64(key)
            .map_err(|e| format!("line {}: {}", index + 1, e))?;
    }
    Ok(())
}

fn agent_usable(socket: &Path) -> bool {
    cfg!(unix) && socket.exists()
}
