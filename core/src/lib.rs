//! Core library for nodectl
//!
//! This crate runs one operation (a shell command or a file push) against
//! many hosts over SSH at once and reports a per-host outcome for each.

pub mod auth;
pub mod checksum;
pub mod error;
pub mod events;
pub mod exec;
pub mod fanout;
pub mod ssh;
pub mod target;
pub mod task;
pub mod transfer;
pub mod transport;
pub mod types;

// Re-exports
pub use auth::{AuthMethod, ClientConfig, CredentialOptions, HostKeyPolicy, ResolverEnv};
pub use error::{Error, ErrorKind, Result};
pub use events::{EventKind, EventSink, NodeEvent};
pub use fanout::{Engine, OperationOptions};
pub use ssh::SshConnector;
pub use target::HostTarget;
pub use transport::{Connection, Connector, RemoteEnd, RemoteSession, SessionExit};
pub use types::{
    ChecksumResult, CommandTask, Completion, NodeOutcome, NodeStatus, Operation,
    OperationResult, Summary, TransferTask,
};
pub use tokio_util::sync::CancellationToken;
