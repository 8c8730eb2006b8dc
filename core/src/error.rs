//! Error types

use serde::{Deserialize, Serialize};
use std::time::Duration;
use thiserror::Error;

/// Result type alias
pub type Result<T> = std::result::Result<T, Error>;

/// Main error type
#[derive(Debug, Error)]
pub enum Error {
    #[error("No usable SSH authentication method (provide a password, an identity file, or run ssh-agent)")]
    NoAuthMethodAvailable,

    #[error("Authentication configuration error: {0}")]
    AuthConfigError(String),

    #[error("Connection error: {0}")]
    ConnectionError(String),

    #[error("Protocol error: {message}")]
    ProtocolError {
        /// Acknowledgement byte sent by the remote side, if any
        code: Option<u8>,
        message: String,
    },

    #[error("Command error: {0}")]
    CommandError(String),

    #[error("Timed out after {0:?}")]
    Timeout(Duration),

    #[error("Invalid source file: {0}")]
    InvalidSource(String),

    #[error("Operation cancelled")]
    Cancelled {
        /// Hosts that finished before the cancellation was observed
        partial: Box<crate::OperationResult>,
    },

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl Error {
    pub(crate) fn protocol(code: Option<u8>, message: impl Into<String>) -> Self {
        Error::ProtocolError {
            code,
            message: message.into(),
        }
    }

    /// Classification used when the error is folded into a per-host outcome
    pub fn kind(&self) -> ErrorKind {
        match self {
            Error::NoAuthMethodAvailable | Error::AuthConfigError(_) => ErrorKind::AuthConfig,
            Error::ConnectionError(_) => ErrorKind::Connection,
            Error::ProtocolError { .. } => ErrorKind::Protocol,
            Error::CommandError(_) => ErrorKind::Command,
            Error::Timeout(_) | Error::Cancelled { .. } => ErrorKind::Timeout,
            Error::InvalidSource(_) | Error::Io(_) => ErrorKind::Io,
        }
    }
}

/// Per-host failure classification
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    AuthConfig,
    Connection,
    Protocol,
    Command,
    Timeout,
    Io,
    /// The host task itself panicked or was aborted
    Internal,
}

impl std::fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            ErrorKind::AuthConfig => "auth",
            ErrorKind::Connection => "connection",
            ErrorKind::Protocol => "protocol",
            ErrorKind::Command => "command",
            ErrorKind::Timeout => "timeout",
            ErrorKind::Io => "io",
            ErrorKind::Internal => "internal",
        };
        f.write_str(name)
    }
}
