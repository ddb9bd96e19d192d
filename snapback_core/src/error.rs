//! The closed error taxonomy and its wire envelope.
//!
//! Remote server-client interaction needs a way for a server to raise an
//! error with the client without giving the server free rein to fabricate
//! arbitrary failures, so the set of kinds is closed: anything outside it
//! parses as `invalid_response`.

use serde::{Deserialize, Serialize};

pub type Result<T, E = Error> = std::result::Result<T, E>;

#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// Referenced key, session, backup or resume id is absent.
    #[error("not found: {0}")]
    NotFound(String),

    /// A backup already exists at this normalised date and the session was
    /// not started with `allow_overwrite`.
    #[error("duplicate backup: {0}")]
    DuplicateBackup(String),

    /// Name or id collision on creation.
    #[error("already exists: {0}")]
    AlreadyExists(String),

    /// Session completed, discarded, or never existed.
    #[error("session closed: {0}")]
    SessionClosed(String),

    /// Caller violated an input contract.
    #[error("invalid arguments: {0}")]
    InvalidArguments(String),

    /// The server detected an impossible or unreconcilable sequence.
    /// Not recoverable; abort and discard.
    #[error("protocol error: {0}")]
    Protocol(String),

    /// The client could not parse a server reply.
    #[error("invalid response: {0}")]
    InvalidResponse(String),

    /// Unexpected server fault; the server logs hold the cause.
    #[error("internal error: {0}")]
    Internal(String),

    /// Credentials rejected.
    #[error("authentication failed: {0}")]
    AuthenticationFailed(String),
}

impl Error {
    /// The wire name of this error kind.
    pub fn name(&self) -> &'static str {
        match self {
            Error::NotFound(_) => "not_found",
            Error::DuplicateBackup(_) => "duplicate_backup",
            Error::AlreadyExists(_) => "already_exists",
            Error::SessionClosed(_) => "session_closed",
            Error::InvalidArguments(_) => "invalid_arguments",
            Error::Protocol(_) => "protocol_error",
            Error::InvalidResponse(_) => "invalid_response",
            Error::Internal(_) => "internal",
            Error::AuthenticationFailed(_) => "authentication_failed",
        }
    }

    /// Status code when this error is carried over HTTP.
    pub fn http_status(&self) -> u16 {
        match self {
            Error::NotFound(_) => 404,
            Error::DuplicateBackup(_) => 409,
            Error::AlreadyExists(_) => 409,
            Error::SessionClosed(_) => 410,
            Error::InvalidArguments(_) => 422,
            Error::Protocol(_) => 400,
            Error::InvalidResponse(_) => 502,
            Error::Internal(_) => 500,
            Error::AuthenticationFailed(_) => 401,
        }
    }

    fn message(&self) -> &str {
        match self {
            Error::NotFound(m)
            | Error::DuplicateBackup(m)
            | Error::AlreadyExists(m)
            | Error::SessionClosed(m)
            | Error::InvalidArguments(m)
            | Error::Protocol(m)
            | Error::InvalidResponse(m)
            | Error::Internal(m)
            | Error::AuthenticationFailed(m) => m,
        }
    }
}

impl From<std::io::Error> for Error {
    fn from(err: std::io::Error) -> Self {
        match err.kind() {
            std::io::ErrorKind::NotFound => Error::NotFound(err.to_string()),
            std::io::ErrorKind::AlreadyExists => Error::AlreadyExists(err.to_string()),
            _ => Error::Internal(err.to_string()),
        }
    }
}

impl From<serde_json::Error> for Error {
    fn from(err: serde_json::Error) -> Self {
        Error::Internal(err.to_string())
    }
}

/// The `{"name": ..., "message": ...}` envelope errors travel in on the wire.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RemoteError {
    pub name: String,
    pub message: String,
}

impl From<&Error> for RemoteError {
    fn from(err: &Error) -> Self {
        RemoteError {
            name: err.name().to_string(),
            message: err.message().to_string(),
        }
    }
}

impl From<RemoteError> for Error {
    fn from(remote: RemoteError) -> Self {
        let message = remote.message;
        match remote.name.as_str() {
            "not_found" => Error::NotFound(message),
            "duplicate_backup" => Error::DuplicateBackup(message),
            "already_exists" => Error::AlreadyExists(message),
            "session_closed" => Error::SessionClosed(message),
            "invalid_arguments" => Error::InvalidArguments(message),
            "protocol_error" => Error::Protocol(message),
            "invalid_response" => Error::InvalidResponse(message),
            "internal" => Error::Internal(message),
            "authentication_failed" => Error::AuthenticationFailed(message),
            other => Error::InvalidResponse(format!("unknown error kind {other:?}: {message}")),
        }
    }
}
