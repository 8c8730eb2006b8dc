//! SSH transport built on russh
//!
//! Each exec session is served by a pump task that owns the russh channel and
//! shuttles bytes between it and the engine's [`RemoteSession`] pipe.

use async_trait::async_trait;
use russh::client::{self, AuthResult, Handle, Msg};
use russh::keys::key::PrivateKeyWithHashAlg;
use russh::keys::{Algorithm, HashAlg, PrivateKey, PublicKey};
use russh::{Channel, ChannelMsg, Disconnect, Sig};
use std::path::Path;
use std::sync::Arc;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tracing::{debug, info, instrument, warn};

use crate::auth::{AuthMethod, ClientConfig, HostKeyPolicy};
use crate::target::HostTarget;
use crate::transport::{
    pending_controls, Connection, Connector, RemoteEnd, RemoteSession, SessionControl, SessionExit,
};
use crate::{Error, Result};

/// Size of each read from the engine side of the pipe
const PUMP_CHUNK: usize = 32 * 1024;

/// Connects to hosts over SSH
#[derive(Clone, Default)]
pub struct SshConnector {
    config: Arc<client::Config>,
}

impl SshConnector {
    pub fn new() -> Self {
        Self::default()
    }
}

/// Host key check for russh
struct HostKeyVerifier {
    host: String,
    port: u16,
    policy: HostKeyPolicy,
}

impl client::Handler for HostKeyVerifier {
    type Error = russh::Error;

    async fn check_server_key(
        &mut self,
        server_public_key: &PublicKey,
    ) -> std::result::Result<bool, Self::Error> {
        match &self.policy {
            HostKeyPolicy::AcceptAny => Ok(true),
            HostKeyPolicy::KnownHosts(path) => {
                match russh::keys::check_known_hosts_path(&self.host, self.port, server_public_key, path)
                {
                    Ok(true) => Ok(true),
                    Ok(false) => {
                        warn!(host = %self.host, port = self.port, "Host key not found in known_hosts");
                        Ok(false)
                    }
                    Err(e) => {
                        warn!(host = %self.host, port = self.port, error = %e, "Host key verification failed");
                        Ok(false)
                    }
                }
            }
        }
    }
}

#[async_trait]
impl Connector for SshConnector {
    #[instrument(skip(self, config), fields(host = %target))]
    async fn connect(
        &self,
        target: &HostTarget,
        config: &ClientConfig,
    ) -> Result<Box<dyn Connection>> {
        let username = config.username_for(target.user.as_deref()).to_string();

        let handshake = async {
            let handler = HostKeyVerifier {
                host: target.host.clone(),
                port: target.port,
                policy: config.host_key_policy.clone(),
            };
            let mut handle = client::connect(self.config.clone(), target.addr(), handler)
                .await
                .map_err(|e| Error::ConnectionError(format!("SSH connection failed: {}", e)))?;

            authenticate(&mut handle, &username, &config.auth_methods).await?;
            Ok::<_, Error>(handle)
        };

        let handle = tokio::time::timeout(config.connect_timeout, handshake)
            .await
            .map_err(|_| Error::Timeout(config.connect_timeout))??;

        info!(user = %username, "SSH session established");
        Ok(Box::new(SshConnection { handle }))
    }
}

/// Try each method in order until the server accepts one
async fn authenticate(
    handle: &mut Handle<HostKeyVerifier>,
    username: &str,
    methods: &[AuthMethod],
) -> Result<()> {
    let mut last_error = String::from("no methods tried");

    for method in methods {
        let outcome = match method {
            AuthMethod::Password(password) => handle
                .authenticate_password(username, password)
                .await
                .map_err(|e| e.to_string()),
            AuthMethod::PrivateKey { key, .. } => handle
                .authenticate_publickey(
                    username,
                    PrivateKeyWithHashAlg::new(key.clone(), hash_alg_for(key)),
                )
                .await
                .map_err(|e| e.to_string()),
            AuthMethod::Agent { socket } => authenticate_agent(handle, username, socket).await,
        };

        match outcome {
            Ok(AuthResult::Success) => {
                debug!(method = %method.label(), "Authenticated");
                return Ok(());
            }
            Ok(_) => {
                debug!(method = %method.label(), "Rejected by server");
                last_error = format!("{} rejected", method.label());
            }
            Err(e) => {
                debug!(method = %method.label(), error = %e, "Authentication error");
                last_error = format!("{}: {}", method.label(), e);
            }
        }
    }

    Err(Error::ConnectionError(format!(
        "SSH authentication failed: {}",
        last_error
    )))
}

/// RSA keys need rsa-sha2-256 on modern servers; other key types carry their own
fn hash_alg_for(key: &PrivateKey) -> Option<HashAlg> {
    match key.algorithm() {
        Algorithm::Rsa { .. } => Some(HashAlg::Sha256),
        _ => None,
    }
}

#[cfg(unix)]
async fn authenticate_agent(
    handle: &mut Handle<HostKeyVerifier>,
    username: &str,
    socket: &Path,
) -> std::result::Result<AuthResult, String> {
    use russh::keys::agent::client::AgentClient;

    let mut agent = AgentClient::connect_uds(socket)
        .await
        .map_err(|e| format!("failed to reach agent: {}", e))?;
    let identities = agent
        .request_identities()
        .await
        .map_err(|e| format!("failed to list agent keys: {}", e))?;

    let mut result = Err("agent holds no keys".to_string());
    for identity in identities {
        let hash_alg = match identity.algorithm() {
            Algorithm::Rsa { .. } => Some(HashAlg::Sha256),
            _ => None,
        };
        result = handle
            .authenticate_publickey_with(username, identity, hash_alg, &mut agent)
            .await
            .map_err(|e| e.to_string());
        if matches!(result, Ok(AuthResult::Success)) {
            break;
        }
    }
    result
}

#[cfg(not(unix))]
async fn authenticate_agent(
    _handle: &mut Handle<HostKeyVerifier>,
    _username: &str,
    socket: &Path,
) -> std::result::Result<AuthResult, String> {
    Err(format!("agent socket {} is not supported on this platform", socket.display()))
}

/// Authenticated SSH connection
pub struct SshConnection {
    handle: Handle<HostKeyVerifier>,
}

#[async_trait]
impl Connection for SshConnection {
    async fn open_exec(&self, command: &str) -> Result<RemoteSession> {
        let channel = self
            .handle
            .channel_open_session()
            .await
            .map_err(|e| Error::ConnectionError(format!("Failed to open channel: {}", e)))?;

        channel
            .exec(true, command)
            .await
            .map_err(|e| Error::ConnectionError(format!("Failed to start command: {}", e)))?;

        let (session, remote) = RemoteSession::pair();
        tokio::spawn(pump(channel, remote));
        Ok(session)
    }

    async fn close(&self) {
        if let Err(e) = self
            .handle
            .disconnect(Disconnect::ByApplication, "", "English")
            .await
        {
            debug!(error = %e, "Disconnect failed");
        }
    }
}

/// Shuttle bytes between the channel and the engine until the channel closes
async fn pump(mut channel: Channel<Msg>, remote: RemoteEnd) {
    let RemoteEnd {
        io,
        mut control,
        exit,
    } = remote;
    let (mut reader, mut writer) = tokio::io::split(io);
    let mut exit = exit;

    let mut buf = vec![0u8; PUMP_CHUNK];
    let mut stdin_open = true;
    let mut control_open = true;
    let mut report = SessionExit::default();

    loop {
        tokio::select! {
            // Queued kills go out before an abandoned session is torn down
            biased;

            request = control.recv(), if control_open => {
                match request {
                    Some(request) => apply_control(&channel, request).await,
                    None => control_open = false,
                }
            }
            _ = exit.closed() => {
                // Engine abandoned the session
                for request in pending_controls(&mut control) {
                    apply_control(&channel, request).await;
                }
                let _ = channel.close().await;
                return;
            }
            read = reader.read(&mut buf), if stdin_open => {
                match read {
                    Ok(0) | Err(_) => {
                        stdin_open = false;
                        let _ = channel.eof().await;
                    }
                    Ok(n) => {
                        if channel.data(&buf[..n]).await.is_err() {
                            stdin_open = false;
                        }
                    }
                }
            }
            msg = channel.wait() => {
                match msg {
                    Some(ChannelMsg::Data { data }) => {
                        let _ = writer.write_all(&data).await;
                    }
                    Some(ChannelMsg::ExtendedData { data, ext }) => {
                        if ext == 1 {
                            report.stderr.extend_from_slice(&data);
                        }
                    }
                    Some(ChannelMsg::ExitStatus { exit_status }) => {
                        report.exit_status = Some(exit_status);
                    }
                    Some(ChannelMsg::ExitSignal { signal_name, .. }) => {
                        report.exit_signal = Some(format!("{:?}", signal_name));
                    }
                    Some(ChannelMsg::Eof) => {
                        let _ = writer.shutdown().await;
                    }
                    Some(ChannelMsg::Close) | None => break,
                    _ => {}
                }
            }
        }
    }

    let _ = writer.shutdown().await;
    let _ = exit.send(Ok(report));
}

async fn apply_control(channel: &Channel<Msg>, request: SessionControl) {
    match request {
        SessionControl::Kill => {
            if let Err(e) = channel.signal(Sig::KILL).await {
                debug!(error = %e, "Signal request failed");
            }
        }
    }
}
