//! Transport seam between the engine and the remote-shell library
//!
//! The engine only ever sees a [`Connector`] (dial + authenticate), a
//! [`Connection`] (open exec sessions) and a [`RemoteSession`]: a byte pipe to
//! the remote command's stdin/stdout plus a control channel and an exit report.
//! Implementations drive the other end of the pipe, a [`RemoteEnd`].

use async_trait::async_trait;
use std::io;
use std::pin::Pin;
use std::task::{Context, Poll};
use tokio::io::{AsyncRead, AsyncWrite, DuplexStream, ReadBuf};
use tokio::sync::{mpsc, oneshot};

use crate::auth::ClientConfig;
use crate::target::HostTarget;
use crate::{Error, Result};

/// Buffer size of the in-process pipe behind a session
pub const SESSION_BUFFER: usize = 64 * 1024;

/// Dials and authenticates one host
#[async_trait]
pub trait Connector: Send + Sync {
    async fn connect(&self, target: &HostTarget, config: &ClientConfig)
        -> Result<Box<dyn Connection>>;
}

/// An authenticated connection to one host
#[async_trait]
pub trait Connection: Send + Sync {
    /// Start `command` in a new exec session
    async fn open_exec(&self, command: &str) -> Result<RemoteSession>;

    /// Tear the connection down
    async fn close(&self) {}
}

/// Out-of-band requests from the engine to the transport
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionControl {
    /// Deliver SIGKILL to the remote command
    Kill,
}

/// Requests still queued when the engine abandoned its session
///
/// A session dropped right after a request closes the exit report and leaves
/// the request in the queue; transports drain it before tearing down.
pub fn pending_controls(control: &mut mpsc::UnboundedReceiver<SessionControl>) -> Vec<SessionControl> {
    let mut pending = Vec::new();
    while let Ok(request) = control.try_recv() {
        pending.push(request);
    }
    pending
}

/// How the remote command ended
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SessionExit {
    pub exit_status: Option<u32>,
    /// Signal name when the command was killed
    pub exit_signal: Option<String>,
    pub stderr: Vec<u8>,
}

impl SessionExit {
    pub fn success(&self) -> bool {
        self.exit_status == Some(0)
    }

    pub fn stderr_text(&self) -> String {
        String::from_utf8_lossy(&self.stderr).trim().to_string()
    }
}

/// Engine side of an exec session
///
/// Reads yield the remote stdout, writes feed the remote stdin and
/// `shutdown()` sends EOF.
pub struct RemoteSession {
    io: DuplexStream,
    control: mpsc::UnboundedSender<SessionControl>,
    exit: oneshot::Receiver<Result<SessionExit>>,
}

/// Transport side of an exec session
pub struct RemoteEnd {
    /// Reads yield what the engine wrote; writes become the engine's stdout
    pub io: DuplexStream,
    pub control: mpsc::UnboundedReceiver<SessionControl>,
    pub exit: oneshot::Sender<Result<SessionExit>>,
}

impl RemoteSession {
    /// Create a connected session/remote pair
    pub fn pair() -> (RemoteSession, RemoteEnd) {
        let (local, remote) = tokio::io::duplex(SESSION_BUFFER);
        let (control_tx, control_rx) = mpsc::unbounded_channel();
        let (exit_tx, exit_rx) = oneshot::channel();

        (
            RemoteSession {
                io: local,
                control: control_tx,
                exit: exit_rx,
            },
            RemoteEnd {
                io: remote,
                control: control_rx,
                exit: exit_tx,
            },
        )
    }

    /// Ask the remote side to kill the command.
    ///
    /// Best effort: many servers ignore signal requests on exec channels.
    pub fn kill(&self) -> bool {
        self.control.send(SessionControl::Kill).is_ok()
    }

    /// Wait for the exit report while keeping the pipe open
    pub async fn wait(&mut self) -> Result<SessionExit> {
        match (&mut self.exit).await {
            Ok(exit) => exit,
            Err(_) => Err(Error::ConnectionError(
                "session closed without an exit report".to_string(),
            )),
        }
    }

    /// Drop the pipe (EOF both ways) and wait for the exit report
    pub async fn finish(self) -> Result<SessionExit> {
        let RemoteSession { io, control, exit } = self;
        drop(io);
        let report = exit.await;
        drop(control);
        match report {
            Ok(exit) => exit,
            Err(_) => Err(Error::ConnectionError(
                "session closed without an exit report".to_string(),
            )),
        }
    }
}

impl AsyncRead for RemoteSession {
    fn poll_read(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        Pin::new(&mut self.io).poll_read(cx, buf)
    }
}

impl AsyncWrite for RemoteSession {
    fn poll_write(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        Pin::new(&mut self.io).poll_write(cx, buf)
    }

    fn poll_flush(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.io).poll_flush(cx)
    }

    fn poll_shutdown(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.io).poll_shutdown(cx)
    }
}

impl RemoteEnd {
    /// Report the exit of the remote command. Ignored if the engine is gone.
    pub fn exit(self, status: u32, stderr: impl Into<Vec<u8>>) {
        let _ = self.exit.send(Ok(SessionExit {
            exit_status: Some(status),
            exit_signal: None,
            stderr: stderr.into(),
        }));
    }
}
