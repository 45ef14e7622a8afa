//! Typed error hierarchy for tandem-dl
//!
//! Every error carries enough context to decide whether it is fatal to a
//! datagram, a connection, or a whole download.

use std::fmt;
use std::path::PathBuf;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::types::GroupId;

/// Main error type for the download engine
#[derive(Debug, Error)]
pub enum EngineError {
    /// Network-related errors (connection, timeout, send/receive)
    #[error("Network error: {message}")]
    Network {
        kind: NetworkErrorKind,
        message: String,
        retryable: bool,
    },

    /// Malformed or policy-violating wire input; fatal to the connection
    #[error("Protocol error: {message}")]
    Protocol {
        kind: ProtocolErrorKind,
        message: String,
    },

    /// Download-fatal condition, reported in the final download result
    #[error("Download aborted ({code}): {message}")]
    Abort { code: ErrorCode, message: String },

    /// Storage/filesystem errors
    #[error("Storage error at {path:?}: {message}")]
    Storage {
        kind: StorageErrorKind,
        path: PathBuf,
        message: String,
    },

    /// Invalid input from the caller
    #[error("Invalid input for '{field}': {message}")]
    InvalidInput {
        field: &'static str,
        message: String,
    },

    /// Download not found
    #[error("Download not found: {0}")]
    NotFound(GroupId),

    /// Invalid state transition
    #[error("Invalid state: cannot {action} while {current_state}")]
    InvalidState {
        action: &'static str,
        current_state: String,
    },

    /// Engine is shutting down
    #[error("Engine is shutting down")]
    Shutdown,

    /// Internal error (bug)
    #[error("Internal error: {0}")]
    Internal(String),
}

/// Network error subtypes
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NetworkErrorKind {
    /// Connection refused
    ConnectionRefused,
    /// Connection reset or closed early
    ConnectionReset,
    /// Operation timed out
    Timeout,
    /// Socket send failed
    Send,
    /// Socket receive failed
    Receive,
    /// Server not reachable
    Unreachable,
    /// Other network error
    Other,
}

/// Storage error subtypes
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StorageErrorKind {
    /// File/directory not found
    NotFound,
    /// Permission denied
    PermissionDenied,
    /// Write outside the allocated length
    OutOfRange,
    /// I/O error
    Io,
}

/// Protocol error subtypes
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProtocolErrorKind {
    /// Invalid URL
    InvalidUrl,
    /// Bencode parsing error
    BencodeParse,
    /// Malformed KRPC message
    Krpc,
    /// UDP tracker packet error
    UdpTracker,
    /// BitTorrent extension message error
    ExtensionMessage,
    /// Peer Exchange (PEX) error
    PexError,
    /// Metadata exchange error (BEP 9)
    MetadataError,
}

/// Final result code of a download
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorCode {
    Finished,
    UnknownError,
    TimeOut,
    ResourceNotFound,
    MaxFileNotFound,
    NetworkProblem,
    InProgress,
    CannotResume,
    FilenameMismatch,
    LengthMismatch,
    ChecksumError,
    BencodeParseError,
    Removed,
}

impl ErrorCode {
    /// Numeric exit status for this code
    pub fn as_u8(self) -> u8 {
        match self {
            Self::Finished => 0,
            Self::UnknownError => 1,
            Self::TimeOut => 2,
            Self::ResourceNotFound => 3,
            Self::MaxFileNotFound => 4,
            Self::NetworkProblem => 6,
            Self::InProgress => 7,
            Self::CannotResume => 8,
            Self::FilenameMismatch => 13,
            Self::LengthMismatch => 14,
            Self::ChecksumError => 32,
            Self::BencodeParseError => 26,
            Self::Removed => 31,
        }
    }
}

impl fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Finished => "finished",
            Self::UnknownError => "unknown error",
            Self::TimeOut => "timeout",
            Self::ResourceNotFound => "resource not found",
            Self::MaxFileNotFound => "too many resources not found",
            Self::NetworkProblem => "network problem",
            Self::InProgress => "in progress",
            Self::CannotResume => "cannot resume",
            Self::FilenameMismatch => "filename mismatch",
            Self::LengthMismatch => "length mismatch",
            Self::ChecksumError => "checksum error",
            Self::BencodeParseError => "bencode parse error",
            Self::Removed => "removed",
        };
        write!(f, "{} {}", self.as_u8(), name)
    }
}

impl EngineError {
    /// Check if this error is retryable
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::Network { retryable, .. } => *retryable,
            Self::Storage { kind, .. } => matches!(kind, StorageErrorKind::Io),
            Self::Protocol { kind, .. } => matches!(kind, ProtocolErrorKind::UdpTracker),
            _ => false,
        }
    }

    /// Result code this error maps to when it ends a download
    pub fn error_code(&self) -> ErrorCode {
        match self {
            Self::Abort { code, .. } => *code,
            Self::Network {
                kind: NetworkErrorKind::Timeout,
                ..
            } => ErrorCode::TimeOut,
            Self::Network { .. } => ErrorCode::NetworkProblem,
            Self::Storage {
                kind: StorageErrorKind::NotFound,
                ..
            } => ErrorCode::ResourceNotFound,
            Self::Protocol {
                kind: ProtocolErrorKind::BencodeParse,
                ..
            } => ErrorCode::BencodeParseError,
            _ => ErrorCode::UnknownError,
        }
    }

    /// Create a network error
    pub fn network(kind: NetworkErrorKind, message: impl Into<String>) -> Self {
        let retryable = matches!(
            kind,
            NetworkErrorKind::Timeout
                | NetworkErrorKind::ConnectionReset
                | NetworkErrorKind::Unreachable
                | NetworkErrorKind::Send
                | NetworkErrorKind::Receive
        );
        Self::Network {
            kind,
            message: message.into(),
            retryable,
        }
    }

    /// Create a storage error
    pub fn storage(
        kind: StorageErrorKind,
        path: impl Into<PathBuf>,
        message: impl Into<String>,
    ) -> Self {
        Self::Storage {
            kind,
            path: path.into(),
            message: message.into(),
        }
    }

    /// Create a protocol error
    pub fn protocol(kind: ProtocolErrorKind, message: impl Into<String>) -> Self {
        Self::Protocol {
            kind,
            message: message.into(),
        }
    }

    /// Create a download-fatal abort error
    pub fn abort(code: ErrorCode, message: impl Into<String>) -> Self {
        Self::Abort {
            code,
            message: message.into(),
        }
    }

    /// Create an invalid input error
    pub fn invalid_input(field: &'static str, message: impl Into<String>) -> Self {
        Self::InvalidInput {
            field,
            message: message.into(),
        }
    }
}

/// Result type alias for engine operations
pub type Result<T> = std::result::Result<T, EngineError>;

impl From<std::io::Error> for EngineError {
    fn from(err: std::io::Error) -> Self {
        use std::io::ErrorKind;
        match err.kind() {
            ErrorKind::TimedOut | ErrorKind::WouldBlock => {
                Self::network(NetworkErrorKind::Timeout, err.to_string())
            }
            ErrorKind::ConnectionRefused => {
                Self::network(NetworkErrorKind::ConnectionRefused, err.to_string())
            }
            ErrorKind::ConnectionReset | ErrorKind::ConnectionAborted | ErrorKind::BrokenPipe => {
                Self::network(NetworkErrorKind::ConnectionReset, err.to_string())
            }
            ErrorKind::NotFound => Self::storage(StorageErrorKind::NotFound, "", err.to_string()),
            ErrorKind::PermissionDenied => {
                Self::storage(StorageErrorKind::PermissionDenied, "", err.to_string())
            }
            _ => Self::storage(StorageErrorKind::Io, "", err.to_string()),
        }
    }
}

impl From<url::ParseError> for EngineError {
    fn from(err: url::ParseError) -> Self {
        Self::Protocol {
            kind: ProtocolErrorKind::InvalidUrl,
            message: err.to_string(),
        }
    }
}
