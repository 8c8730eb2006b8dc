//! SCP sink-mode file push
//!
//! The remote side runs `scp -t <dir>` and answers every phase with a single
//! status byte. The sender must not move past a phase until that byte has
//! been read, otherwise the sink parses a corrupted frame.
//!
//! ```text
//!   remote -> 0x00                        initial ack
//!   local  -> C0644 <size> <name>\n       header
//!   remote -> 0x00                        header ack
//!   local  -> <size bytes> 0x00           body + terminator
//!   remote -> 0x00                        final ack
//! ```
//!
//! A non-zero status (1 = error, 2 = fatal) is followed by a message
//! terminated by `\n`.

use std::path::Path;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::time::Instant;
use tracing::{debug, instrument, warn};

use crate::transport::Connection;
use crate::{Error, Result, TransferTask};

/// Body chunk size
pub const CHUNK_SIZE: usize = 32 * 1024;

/// Minimum spacing between progress reports
pub const PROGRESS_INTERVAL: Duration = Duration::from_millis(100);

/// Longest error message read after a non-zero status byte
pub const MAX_ACK_MESSAGE: usize = 1024;

/// How long to wait for the sink to exit after a protocol failure
const STDERR_DRAIN_TIMEOUT: Duration = Duration::from_secs(5);

/// Handshake phases, in order
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    WaitInitialAck,
    SendHeader,
    WaitHeaderAck,
    StreamBody,
    SendTerminator,
    WaitFinalAck,
    Done,
}

impl Phase {
    fn describe(self) -> &'static str {
        match self {
            Phase::WaitInitialAck => "initial acknowledgement",
            Phase::SendHeader => "sending header",
            Phase::WaitHeaderAck => "header acknowledgement",
            Phase::StreamBody => "streaming file body",
            Phase::SendTerminator => "sending end-of-data marker",
            Phase::WaitFinalAck => "final acknowledgement",
            Phase::Done => "done",
        }
    }
}

/// The `C` record announcing a file
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileHeader {
    pub mode: u32,
    pub size: u64,
    pub name: String,
}

impl FileHeader {
    pub fn new(mode: u32, size: u64, name: impl Into<String>) -> Result<Self> {
        let name = name.into();
        if name.is_empty() || name.contains('\n') || name.contains('/') {
            return Err(Error::InvalidSource(format!(
                "file name {:?} cannot be sent in a transfer header",
                name
            )));
        }
        Ok(Self { mode, size, name })
    }

    pub fn encode(&self) -> String {
        format!("C{:04o} {} {}\n", self.mode & 0o7777, self.size, self.name)
    }
}

/// Read one status byte; non-zero becomes a [`Error::ProtocolError`]
pub async fn read_ack<R>(reader: &mut R) -> Result<()>
where
    R: AsyncRead + Unpin,
{
    let code = reader
        .read_u8()
        .await
        .map_err(|e| Error::protocol(None, format!("failed to read response: {}", e)))?;

    if code == 0 {
        return Ok(());
    }

    let mut message = Vec::new();
    while message.len() < MAX_ACK_MESSAGE {
        match reader.read_u8().await {
            Ok(b'\n') | Err(_) => break,
            Ok(byte) => message.push(byte),
        }
    }
    let message = String::from_utf8_lossy(&message).trim().to_string();

    let severity = if code == 1 { "error" } else { "fatal error" };
    Err(Error::protocol(
        Some(code),
        format!("remote {} ({}): {}", severity, code, message),
    ))
}

/// Run the sender side of the handshake over `stream`
///
/// Streams exactly `header.size` bytes from `source`. `on_progress` receives
/// the cumulative byte count at most every [`PROGRESS_INTERVAL`] while
/// streaming, and always once more with the final total.
///
/// Returns the number of body bytes written.
pub async fn send_file<S, R, F>(
    stream: &mut S,
    source: &mut R,
    header: &FileHeader,
    mut on_progress: F,
) -> Result<u64>
where
    S: AsyncRead + AsyncWrite + Unpin,
    R: AsyncRead + Unpin,
    F: FnMut(u64),
{
    let mut phase = Phase::WaitInitialAck;
    let mut written: u64 = 0;

    loop {
        debug!(phase = ?phase, "Transfer phase");
        match phase {
            Phase::WaitInitialAck => {
                read_ack(stream).await.map_err(|e| in_phase(phase, e))?;
                phase = Phase::SendHeader;
            }
            Phase::SendHeader => {
                write_all(stream, header.encode().as_bytes(), phase).await?;
                phase = Phase::WaitHeaderAck;
            }
            Phase::WaitHeaderAck => {
                read_ack(stream).await.map_err(|e| in_phase(phase, e))?;
                phase = Phase::StreamBody;
            }
            Phase::StreamBody => {
                written = stream_body(stream, source, header.size, &mut on_progress).await?;
                on_progress(written);
                phase = Phase::SendTerminator;
            }
            Phase::SendTerminator => {
                write_all(stream, &[0], phase).await?;
                phase = Phase::WaitFinalAck;
            }
            Phase::WaitFinalAck => {
                read_ack(stream).await.map_err(|e| in_phase(phase, e))?;
                phase = Phase::Done;
            }
            Phase::Done => return Ok(written),
        }
    }
}

async fn stream_body<S, R, F>(
    stream: &mut S,
    source: &mut R,
    size: u64,
    on_progress: &mut F,
) -> Result<u64>
where
    S: AsyncWrite + Unpin,
    R: AsyncRead + Unpin,
    F: FnMut(u64),
{
    let mut buf = vec![0u8; CHUNK_SIZE];
    let mut written: u64 = 0;
    let mut last_report = Instant::now();

    while written < size {
        let want = (size - written).min(CHUNK_SIZE as u64) as usize;
        let n = source.read(&mut buf[..want]).await?;
        if n == 0 {
            return Err(Error::Io(std::io::Error::new(
                std::io::ErrorKind::UnexpectedEof,
                format!("source ended after {} of {} bytes", written, size),
            )));
        }

        write_all(stream, &buf[..n], Phase::StreamBody).await?;
        written += n as u64;

        if last_report.elapsed() > PROGRESS_INTERVAL {
            on_progress(written);
            last_report = Instant::now();
        }
    }

    Ok(written)
}

async fn write_all<S>(stream: &mut S, bytes: &[u8], phase: Phase) -> Result<()>
where
    S: AsyncWrite + Unpin,
{
    stream
        .write_all(bytes)
        .await
        .map_err(|e| Error::protocol(None, format!("{} failed: {}", phase.describe(), e)))
}

fn in_phase(phase: Phase, err: Error) -> Error {
    match err {
        Error::ProtocolError { code, message } => Error::ProtocolError {
            code,
            message: format!("{}: {}", phase.describe(), message),
        },
        other => other,
    }
}

/// Remote command that receives a file into `dest_dir`
pub fn sink_command(dest_dir: &str) -> String {
    let dir = if dest_dir.is_empty() { "." } else { dest_dir };
    format!("scp -t {}", shell_words::quote(dir))
}

/// Push `task.source_path` to one host over a fresh session
///
/// On a protocol failure the sink's stderr, if any, is appended to the error.
#[instrument(skip(connection, task, on_progress), fields(source = %task.source_path.display(), dest = %task.dest_dir))]
pub async fn upload<F>(connection: &dyn Connection, task: &TransferTask, on_progress: F) -> Result<u64>
where
    F: FnMut(u64),
{
    let name = task
        .file_name()
        .ok_or_else(|| Error::InvalidSource(format!("{} has no file name", task.source_path.display())))?;
    let header = FileHeader::new(task.mode, task.file_size, name)?;

    let mut source = open_source(&task.source_path).await?;
    let mut session = connection.open_exec(&sink_command(&task.dest_dir)).await?;

    match send_file(&mut session, &mut source, &header, on_progress).await {
        Ok(written) => {
            let _ = session.shutdown().await;
            let exit = session.finish().await?;
            match exit.exit_status {
                Some(0) | None => Ok(written),
                Some(status) => Err(Error::CommandError(format!(
                    "remote sink exited with status {}: {}",
                    status,
                    exit.stderr_text()
                ))),
            }
        }
        Err(err) => {
            let _ = session.shutdown().await;
            let stderr = match tokio::time::timeout(STDERR_DRAIN_TIMEOUT, session.finish()).await {
                Ok(Ok(exit)) => exit.stderr_text(),
                Ok(Err(_)) => String::new(),
                Err(_) => {
                    warn!("Remote sink did not exit after protocol failure");
                    String::new()
                }
            };
            Err(with_stderr(err, &stderr))
        }
    }
}

async fn open_source(path: &Path) -> Result<tokio::fs::File> {
    tokio::fs::File::open(path)
        .await
        .map_err(|e| Error::InvalidSource(format!("failed to open {}: {}", path.display(), e)))
}

fn with_stderr(err: Error, stderr: &str) -> Error {
    if stderr.is_empty() {
        return err;
    }
    match err {
        Error::ProtocolError { code, message } => Error::ProtocolError {
            code,
            message: format!("{} (remote stderr: {})", message, stderr),
        },
        other => other,
    }
}
