//! Shared types

use serde::Serialize;
use std::collections::HashMap;
use std::fmt;
use std::path::PathBuf;
use std::time::Duration;

use crate::error::ErrorKind;

/// Permission bits sent in the transfer header when none are given
pub const DEFAULT_FILE_MODE: u32 = 0o644;

/// Default per-command timeout
pub const DEFAULT_COMMAND_TIMEOUT: Duration = Duration::from_secs(30);

/// A file push to every host
#[derive(Debug, Clone)]
pub struct TransferTask {
    /// Local file to send
    pub source_path: PathBuf,
    /// Remote directory the file lands in (keeps its base name)
    pub dest_dir: String,
    /// Size measured once before fan-out
    pub file_size: u64,
    /// Permission bits sent in the header
    pub mode: u32,
    /// Compare digests after the handshake completes
    pub verify: bool,
}

impl TransferTask {
    /// Build a task for `source_path`. The size is filled in by the engine.
    pub fn new(source_path: impl Into<PathBuf>, dest_dir: impl Into<String>) -> Self {
        Self {
            source_path: source_path.into(),
            dest_dir: dest_dir.into(),
            file_size: 0,
            mode: DEFAULT_FILE_MODE,
            verify: false,
        }
    }

    pub fn with_verify(mut self, verify: bool) -> Self {
        self.verify = verify;
        self
    }

    pub fn with_mode(mut self, mode: u32) -> Self {
        self.mode = mode;
        self
    }

    /// Base name of the source file as sent in the header
    pub fn file_name(&self) -> Option<String> {
        self.source_path
            .file_name()
            .map(|name| name.to_string_lossy().into_owned())
    }

    /// Remote path of the delivered file
    pub fn remote_path(&self) -> Option<String> {
        let name = self.file_name()?;
        let dir = self.dest_dir.trim_end_matches('/');
        Some(if self.dest_dir.is_empty() {
            name
        } else if dir.is_empty() {
            format!("/{}", name)
        } else {
            format!("{}/{}", dir, name)
        })
    }
}

/// A shell command run on every host
#[derive(Debug, Clone)]
pub struct CommandTask {
    pub command: String,
    /// Prefix the command with the elevation keyword
    pub use_elevation: bool,
    pub timeout: Duration,
}

impl CommandTask {
    pub fn new(command: impl Into<String>) -> Self {
        Self {
            command: command.into(),
            use_elevation: false,
            timeout: DEFAULT_COMMAND_TIMEOUT,
        }
    }

    pub fn with_elevation(mut self, use_elevation: bool) -> Self {
        self.use_elevation = use_elevation;
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }
}

/// The operation fanned out to every host
#[derive(Debug, Clone)]
pub enum Operation {
    Transfer(TransferTask),
    Command(CommandTask),
}

/// Result of comparing local and remote digests
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ChecksumResult {
    pub local_digest: String,
    pub remote_digest: String,
    pub verified: bool,
    /// Why the remote digest could not be computed
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl ChecksumResult {
    pub fn compare(local_digest: &str, remote_digest: &str) -> Self {
        Self {
            local_digest: local_digest.to_string(),
            remote_digest: remote_digest.to_string(),
            verified: local_digest == remote_digest,
            error: None,
        }
    }

    pub fn failed(local_digest: &str, error: impl Into<String>) -> Self {
        Self {
            local_digest: local_digest.to_string(),
            remote_digest: String::new(),
            verified: false,
            error: Some(error.into()),
        }
    }
}

/// What a successful host task produced
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Completion {
    Command {
        exit_code: i32,
        stdout: String,
        stderr: String,
    },
    Transfer {
        bytes: u64,
        #[serde(skip_serializing_if = "Option::is_none")]
        checksum: Option<ChecksumResult>,
    },
}

/// Outcome of one host task
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum NodeOutcome {
    Success {
        #[serde(rename = "duration_ms", serialize_with = "as_millis")]
        duration: Duration,
        #[serde(flatten)]
        completion: Completion,
    },
    Failure {
        kind: ErrorKind,
        message: String,
    },
    Timeout {
        #[serde(rename = "elapsed_ms", serialize_with = "as_millis")]
        elapsed: Duration,
    },
}

/// Summary bucket of an outcome
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NodeStatus {
    Succeeded,
    Failed,
    TimedOut,
}

impl NodeOutcome {
    pub fn failure(kind: ErrorKind, message: impl Into<String>) -> Self {
        NodeOutcome::Failure {
            kind,
            message: message.into(),
        }
    }

    /// Non-zero exit codes count as failures even though the command ran.
    pub fn status(&self) -> NodeStatus {
        match self {
            NodeOutcome::Success {
                completion: Completion::Command { exit_code, .. },
                ..
            } if *exit_code != 0 => NodeStatus::Failed,
            NodeOutcome::Success { .. } => NodeStatus::Succeeded,
            NodeOutcome::Failure { .. } => NodeStatus::Failed,
            NodeOutcome::Timeout { .. } => NodeStatus::TimedOut,
        }
    }

    pub fn is_success(&self) -> bool {
        self.status() == NodeStatus::Succeeded
    }

    pub fn exit_code(&self) -> Option<i32> {
        match self {
            NodeOutcome::Success {
                completion: Completion::Command { exit_code, .. },
                ..
            } => Some(*exit_code),
            _ => None,
        }
    }

    pub fn checksum(&self) -> Option<&ChecksumResult> {
        match self {
            NodeOutcome::Success {
                completion: Completion::Transfer { checksum, .. },
                ..
            } => checksum.as_ref(),
            _ => None,
        }
    }
}

impl fmt::Display for NodeOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            NodeOutcome::Success {
                duration,
                completion: Completion::Command { exit_code, .. },
            } => write!(f, "exit code {} ({:.2}s)", exit_code, duration.as_secs_f64()),
            NodeOutcome::Success {
                duration,
                completion: Completion::Transfer { bytes, checksum },
            } => {
                write!(f, "{} bytes in {:.2}s", bytes, duration.as_secs_f64())?;
                match checksum {
                    Some(c) if c.verified => write!(f, ", checksum verified"),
                    Some(c) => match &c.error {
                        Some(error) => write!(f, ", checksum unavailable: {}", error),
                        None => write!(f, ", checksum mismatch"),
                    },
                    None => Ok(()),
                }
            }
            NodeOutcome::Failure { message, .. } => f.write_str(message),
            NodeOutcome::Timeout { elapsed } => {
                write!(f, "timed out after {:.2}s", elapsed.as_secs_f64())
            }
        }
    }
}

/// Success / failure / timeout counts
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct Summary {
    pub succeeded: usize,
    pub failed: usize,
    pub timed_out: usize,
}

impl Summary {
    pub fn total(&self) -> usize {
        self.succeeded + self.failed + self.timed_out
    }

    pub fn as_tuple(&self) -> (usize, usize, usize) {
        (self.succeeded, self.failed, self.timed_out)
    }
}

/// Aggregate returned by the engine
#[derive(Debug, Clone, Default, Serialize)]
pub struct OperationResult {
    /// Hosts in the order they were requested
    pub hosts: Vec<String>,
    pub outcomes: HashMap<String, NodeOutcome>,
    #[serde(rename = "total_duration_ms", serialize_with = "as_millis")]
    pub total_duration: Duration,
    /// Digest of the source file when verification was requested
    #[serde(skip_serializing_if = "Option::is_none")]
    pub local_digest: Option<String>,
}

impl OperationResult {
    pub fn summary(&self) -> Summary {
        let mut summary = Summary::default();
        for outcome in self.outcomes.values() {
            match outcome.status() {
                NodeStatus::Succeeded => summary.succeeded += 1,
                NodeStatus::Failed => summary.failed += 1,
                NodeStatus::TimedOut => summary.timed_out += 1,
            }
        }
        summary
    }

    /// Outcomes in requested order
    pub fn ordered(&self) -> impl Iterator<Item = (&str, &NodeOutcome)> + '_ {
        self.hosts
            .iter()
            .filter_map(|host| self.outcomes.get(host).map(|o| (host.as_str(), o)))
    }

    pub fn get(&self, host: &str) -> Option<&NodeOutcome> {
        self.outcomes.get(host)
    }

    /// Hosts whose transfer completed but failed verification
    pub fn checksum_mismatches(&self) -> Vec<&str> {
        self.ordered()
            .filter(|(_, outcome)| outcome.checksum().is_some_and(|c| !c.verified))
            .map(|(host, _)| host)
            .collect()
    }

    /// Every host succeeded and every requested verification passed
    pub fn all_succeeded(&self) -> bool {
        let summary = self.summary();
        summary.failed == 0 && summary.timed_out == 0 && self.checksum_mismatches().is_empty()
    }

    pub(crate) fn insert(&mut self, host: String, outcome: NodeOutcome) {
        self.outcomes.insert(host, outcome);
    }
}

fn as_millis<S: serde::Serializer>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
    serializer.serialize_u64(duration.as_millis() as u64)
}
