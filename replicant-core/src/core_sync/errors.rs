/*
    errors.rs - Error types for the synchronization subsystem

    Taxonomy:
    - stale update        -> not an error, dropped by the client
    - gap                 -> not an error, turned into a resync request
    - decode error        -> CommunicationError inside a StreamError
    - authentication      -> offline, no retry
    - exhausted retries   -> offline
    - network/server      -> retried with backoff
    - protocol misuse     -> SyncError::ProtocolMisuse, logged loudly
*/

use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;

use super::types::Version;

/// Errors raised by the synchronization subsystem
#[derive(Debug, Error)]
pub enum SyncError {
    /// Durable local store failed
    #[error("Storage error: {0}")]
    Storage(#[from] StorageError),

    /// Network or transport level failure
    #[error("Transport error: {0}")]
    Transport(String),

    /// Server answered with an unexpected status
    #[error("Server responded with status {status}: {message}")]
    Http { status: u16, message: String },

    /// Server cannot replay changes since this version
    #[error("Version {0} is too old to replay, a full resync is required")]
    VersionTooOld(Version),

    /// Payload could not be decoded
    #[error("Decode error: {0}")]
    Decode(String),

    /// A caller broke the usage contract of a component
    #[error("Protocol misuse: {0}")]
    ProtocolMisuse(String),

    /// Operation needs an online client
    #[error("Client is offline")]
    Offline,
}

impl From<serde_json::Error> for SyncError {
    fn from(e: serde_json::Error) -> Self {
        SyncError::Decode(e.to_string())
    }
}

impl From<reqwest::Error> for SyncError {
    fn from(e: reqwest::Error) -> Self {
        match e.status() {
            Some(status) => SyncError::Http {
                status: status.as_u16(),
                message: e.to_string(),
            },
            None => SyncError::Transport(e.to_string()),
        }
    }
}

/// Result type for sync operations
pub type Result<T> = std::result::Result<T, SyncError>;

/// Errors of the durable local store
#[derive(Debug, Error)]
pub enum StorageError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(String),

    #[error("Invalid key: {0}")]
    InvalidKey(String),
}

impl From<serde_json::Error> for StorageError {
    fn from(e: serde_json::Error) -> Self {
        StorageError::Serialization(e.to_string())
    }
}

/// Structured error as reported by the server: `{"type": ..., "msg": ...}`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CommunicationError {
    #[serde(rename = "type")]
    pub kind: String,
    pub msg: String,
}

impl CommunicationError {
    /// Error type the server uses for a missing or expired login.
    pub const AUTH_REQUIRED: &'static str = "auth_required";

    pub fn new(kind: impl Into<String>, msg: impl Into<String>) -> Self {
        Self {
            kind: kind.into(),
            msg: msg.into(),
        }
    }

    /// Wrap text that is not a structured error (HTML pages from proxies etc).
    pub fn unknown(msg: impl Into<String>) -> Self {
        Self::new("Unknown Error", msg)
    }

    pub fn is_auth_required(&self) -> bool {
        self.kind == Self::AUTH_REQUIRED
    }
}

impl fmt::Display for CommunicationError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.kind, self.msg)
    }
}

/// Coarse origin of a stream error, derived from the HTTP status
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorType {
    /// 4xx
    Client,
    /// 5xx, network failures, unexpected end of stream
    Server,
    /// No usable status code
    Unknown,
}

impl ErrorType {
    pub fn from_status(status: Option<u16>) -> Self {
        match status {
            Some(code) if (400..500).contains(&code) => ErrorType::Client,
            Some(code) if code >= 500 => ErrorType::Server,
            _ => ErrorType::Unknown,
        }
    }
}

impl fmt::Display for ErrorType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ErrorType::Client => write!(f, "Client"),
            ErrorType::Server => write!(f, "Server"),
            ErrorType::Unknown => write!(f, "Unknown"),
        }
    }
}

/// Error surfaced by a stream connection, at most once per connection
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("{error_type} error: {message}")]
pub struct StreamError {
    pub error_type: ErrorType,
    pub content: Option<CommunicationError>,
    pub message: String,
}

impl StreamError {
    pub fn new(
        error_type: ErrorType,
        content: Option<CommunicationError>,
        message: impl Into<String>,
    ) -> Self {
        Self {
            error_type,
            content,
            message: message.into(),
        }
    }

    /// Client error carrying an `auth_required` payload.
    pub fn is_auth_failure(&self) -> bool {
        self.error_type == ErrorType::Client
            && self.content.as_ref().is_some_and(CommunicationError::is_auth_required)
    }
}
