//! XXH64 integrity verification
//!
//! Digests are rendered as 16 lowercase hex characters, seed 0. The remote
//! digest comes from `xxhsum`/`xxh64sum` when the host has one; otherwise the
//! file is streamed back with `cat` and hashed locally.

use std::path::Path;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWriteExt};
use tracing::{debug, instrument, warn};
use xxhash_rust::xxh64::Xxh64;

use crate::transport::Connection;
use crate::{ChecksumResult, Error, Result};

/// Read size used when hashing a stream
pub const HASH_CHUNK: usize = 64 * 1024;

/// Render a digest the way the remote tools print it
pub fn format_digest(digest: u64) -> String {
    format!("{:016x}", digest)
}

/// Hash everything `reader` yields
pub async fn digest_reader<R>(reader: &mut R) -> Result<String>
where
    R: AsyncRead + Unpin,
{
    let mut hasher = Xxh64::new(0);
    let mut buf = vec![0u8; HASH_CHUNK];
    loop {
        let n = reader.read(&mut buf).await?;
        if n == 0 {
            break;
        }
        hasher.update(&buf[..n]);
    }
    Ok(format_digest(hasher.digest()))
}

/// Digest of a local file
pub async fn local_digest(path: &Path) -> Result<String> {
    let mut file = tokio::fs::File::open(path).await.map_err(|e| {
        Error::InvalidSource(format!("failed to open {}: {}", path.display(), e))
    })?;
    digest_reader(&mut file).await
}

/// Command that prints the digest of `remote_path` with whichever tool exists
pub fn digest_command(remote_path: &str) -> String {
    let quoted = shell_words::quote(remote_path);
    format!(
        "xxhsum {q} 2>/dev/null || xxh64sum {q} 2>/dev/null",
        q = quoted
    )
}

/// First token of the tool output if it looks like a digest
fn parse_tool_output(stdout: &str) -> Option<String> {
    let token = stdout.split_whitespace().next()?;
    if token.len() == 16 && token.chars().all(|c| c.is_ascii_hexdigit()) {
        Some(token.to_string())
    } else {
        None
    }
}

/// Digest of a file on the remote host
#[instrument(skip(connection))]
pub async fn remote_digest(connection: &dyn Connection, remote_path: &str) -> Result<String> {
    match tool_digest(connection, remote_path).await {
        Ok(Some(digest)) => return Ok(digest),
        Ok(None) => debug!("No remote hash tool, streaming file back"),
        Err(e) => debug!(error = %e, "Remote hash tool failed, streaming file back"),
    }
    streamed_digest(connection, remote_path).await
}

async fn tool_digest(connection: &dyn Connection, remote_path: &str) -> Result<Option<String>> {
    let mut session = connection.open_exec(&digest_command(remote_path)).await?;
    let _ = session.shutdown().await;

    let mut stdout = Vec::new();
    session.read_to_end(&mut stdout).await?;
    let exit = session.wait().await?;

    if !exit.success() {
        return Ok(None);
    }
    Ok(parse_tool_output(&String::from_utf8_lossy(&stdout)))
}

async fn streamed_digest(connection: &dyn Connection, remote_path: &str) -> Result<String> {
    let command = format!("cat {}", shell_words::quote(remote_path));
    let mut session = connection.open_exec(&command).await?;
    let _ = session.shutdown().await;

    let digest = digest_reader(&mut session).await?;
    let exit = session.wait().await?;
    if !exit.success() {
        return Err(Error::CommandError(format!(
            "failed to read back {}: {}",
            remote_path,
            exit.stderr_text()
        )));
    }
    Ok(digest)
}

/// Compare the remote copy against `local`
///
/// Never fails: problems computing the remote digest are recorded in the
/// result and count as a mismatch.
pub async fn verify(connection: &dyn Connection, remote_path: &str, local: &str) -> ChecksumResult {
    match remote_digest(connection, remote_path).await {
        Ok(remote) => {
            let result = ChecksumResult::compare(local, &remote);
            if !result.verified {
                warn!(remote_path, local, remote = %remote, "Checksum mismatch");
            }
            result
        }
        Err(e) => {
            warn!(remote_path, error = %e, "Could not compute remote checksum");
            ChecksumResult::failed(local, e.to_string())
        }
    }
}
