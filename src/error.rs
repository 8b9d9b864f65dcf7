//! Error types for cursor establishment.

use crate::types::ShardId;
use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;

/// Result type alias for cursor establishment operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Error classification codes shared by transport failures and shard replies.
///
/// Codes travel on the wire as their numeric form (see [`ErrorCode::raw`]);
/// codes this crate does not know are preserved as [`ErrorCode::Unknown`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ErrorCode {
    InternalError,
    BadValue,
    HostUnreachable,
    HostNotFound,
    UnknownError,
    FailedToParse,
    Unauthorized,
    NamespaceNotFound,
    CursorNotFound,
    ExceededTimeLimit,
    ShardNotFound,
    NetworkTimeout,
    CallbackCanceled,
    ShutdownInProgress,
    PrimarySteppedDown,
    ExecutorBusy,
    SocketException,
    NotWritablePrimary,
    InterruptedAtShutdown,
    InterruptedDueToReplStateChange,
    NotPrimaryNoSecondaryOk,
    NotPrimaryOrSecondary,
    /// A code not modelled by this crate.
    Unknown(i32),
}

/// Error codes that indicate transient unavailability of a shard.
///
/// A shard failing with one of these may be left out of the result when the
/// caller allows partial results.
pub const RETRIABLE_ERROR_CODES: &[ErrorCode] = &[
    ErrorCode::NotWritablePrimary,
    ErrorCode::NotPrimaryNoSecondaryOk,
    ErrorCode::NotPrimaryOrSecondary,
    ErrorCode::InterruptedDueToReplStateChange,
    ErrorCode::PrimarySteppedDown,
    ErrorCode::HostUnreachable,
    ErrorCode::HostNotFound,
    ErrorCode::NetworkTimeout,
    ErrorCode::SocketException,
    ErrorCode::InterruptedAtShutdown,
    ErrorCode::ShutdownInProgress,
];

impl ErrorCode {
    /// Whether this code belongs to the retriable set.
    ///
    /// Must agree with [`RETRIABLE_ERROR_CODES`].
    pub const fn is_retriable(self) -> bool {
        matches!(
            self,
            ErrorCode::NotWritablePrimary
                | ErrorCode::NotPrimaryNoSecondaryOk
                | ErrorCode::NotPrimaryOrSecondary
                | ErrorCode::InterruptedDueToReplStateChange
                | ErrorCode::PrimarySteppedDown
                | ErrorCode::HostUnreachable
                | ErrorCode::HostNotFound
                | ErrorCode::NetworkTimeout
                | ErrorCode::SocketException
                | ErrorCode::InterruptedAtShutdown
                | ErrorCode::ShutdownInProgress
        )
    }

    /// Numeric wire form of the code.
    pub const fn raw(self) -> i32 {
        match self {
            ErrorCode::InternalError => 1,
            ErrorCode::BadValue => 2,
            ErrorCode::HostUnreachable => 6,
            ErrorCode::HostNotFound => 7,
            ErrorCode::UnknownError => 8,
            ErrorCode::FailedToParse => 9,
            ErrorCode::Unauthorized => 13,
            ErrorCode::NamespaceNotFound => 26,
            ErrorCode::CursorNotFound => 43,
            ErrorCode::ExceededTimeLimit => 50,
            ErrorCode::ShardNotFound => 70,
            ErrorCode::NetworkTimeout => 89,
            ErrorCode::CallbackCanceled => 90,
            ErrorCode::ShutdownInProgress => 91,
            ErrorCode::PrimarySteppedDown => 189,
            ErrorCode::ExecutorBusy => 462,
            ErrorCode::SocketException => 9001,
            ErrorCode::NotWritablePrimary => 10107,
            ErrorCode::InterruptedAtShutdown => 11600,
            ErrorCode::InterruptedDueToReplStateChange => 11602,
            ErrorCode::NotPrimaryNoSecondaryOk => 13435,
            ErrorCode::NotPrimaryOrSecondary => 13436,
            ErrorCode::Unknown(raw) => raw,
        }
    }

    /// Decode a numeric wire code.
    pub const fn from_raw(raw: i32) -> Self {
        match raw {
            1 => ErrorCode::InternalError,
            2 => ErrorCode::BadValue,
            6 => ErrorCode::HostUnreachable,
            7 => ErrorCode::HostNotFound,
            8 => ErrorCode::UnknownError,
            9 => ErrorCode::FailedToParse,
            13 => ErrorCode::Unauthorized,
            26 => ErrorCode::NamespaceNotFound,
            43 => ErrorCode::CursorNotFound,
            50 => ErrorCode::ExceededTimeLimit,
            70 => ErrorCode::ShardNotFound,
            89 => ErrorCode::NetworkTimeout,
            90 => ErrorCode::CallbackCanceled,
            91 => ErrorCode::ShutdownInProgress,
            189 => ErrorCode::PrimarySteppedDown,
            462 => ErrorCode::ExecutorBusy,
            9001 => ErrorCode::SocketException,
            10107 => ErrorCode::NotWritablePrimary,
            11600 => ErrorCode::InterruptedAtShutdown,
            11602 => ErrorCode::InterruptedDueToReplStateChange,
            13435 => ErrorCode::NotPrimaryNoSecondaryOk,
            13436 => ErrorCode::NotPrimaryOrSecondary,
            other => ErrorCode::Unknown(other),
        }
    }
}

impl fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ErrorCode::Unknown(raw) => write!(f, "Location{}", raw),
            other => fmt::Debug::fmt(other, f),
        }
    }
}

/// Main error type for cursor establishment.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum Error {
    /// The command never produced a reply: connection, deadline or
    /// scheduling failure.
    #[error("transport error ({code}): {message}")]
    Transport { code: ErrorCode, message: String },

    /// The shard answered with an error reply.
    #[error("remote error ({code}): {message}")]
    Remote { code: ErrorCode, message: String },

    /// The shard answered but the reply is not a usable cursor response.
    #[error("malformed cursor response ({code}): {reason}")]
    MalformedResponse { code: ErrorCode, reason: String },

    /// A best-effort close-cursor submission failed.
    #[error("cleanup submission failed: {0}")]
    CleanupSubmission(String),

    /// The executor refused new work (backpressure).
    #[error("executor busy: too many in-flight commands ({pending})")]
    ExecutorBusy { pending: usize },

    /// No host is registered for the shard.
    #[error("shard not found: {0}")]
    ShardNotFound(ShardId),

    /// The same shard was targeted twice in one establish call.
    #[error("duplicate shard in establish request: {0}")]
    DuplicateShard(ShardId),

    /// A namespace string is not of the form `db.collection`.
    #[error("invalid namespace: {0}")]
    InvalidNamespace(String),

    /// A host string is not of the form `host:port`.
    #[error("invalid host: {0}")]
    InvalidHost(String),

    /// Command encoding failed.
    #[error("serialization error: {0}")]
    Serialization(String),

    /// Generic internal error.
    #[error("internal error: {0}")]
    Internal(String),
}

impl Error {
    /// Build a transport error.
    pub fn transport(code: ErrorCode, message: impl Into<String>) -> Self {
        Error::Transport {
            code,
            message: message.into(),
        }
    }

    /// Build a remote error.
    pub fn remote(code: ErrorCode, message: impl Into<String>) -> Self {
        Error::Remote {
            code,
            message: message.into(),
        }
    }

    /// Build a malformed response error.
    pub fn malformed(code: ErrorCode, reason: impl Into<String>) -> Self {
        Error::MalformedResponse {
            code,
            reason: reason.into(),
        }
    }

    /// The classification code of this error.
    pub fn code(&self) -> ErrorCode {
        match self {
            Error::Transport { code, .. }
            | Error::Remote { code, .. }
            | Error::MalformedResponse { code, .. } => *code,
            Error::CleanupSubmission(_) => ErrorCode::CallbackCanceled,
            Error::ExecutorBusy { .. } => ErrorCode::ExecutorBusy,
            Error::ShardNotFound(_) => ErrorCode::ShardNotFound,
            Error::DuplicateShard(_) | Error::InvalidNamespace(_) | Error::InvalidHost(_) => {
                ErrorCode::BadValue
            }
            Error::Serialization(_) => ErrorCode::FailedToParse,
            Error::Internal(_) => ErrorCode::InternalError,
        }
    }

    /// Whether the error's classification is in the retriable set.
    pub fn is_retriable(&self) -> bool {
        self.code().is_retriable()
    }
}

impl From<bincode::Error> for Error {
    fn from(e: bincode::Error) -> Self {
        Error::Serialization(e.to_string())
    }
}
