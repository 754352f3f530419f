//! Error types for the Backend Protocol client and worker.
//!
//! Server-reported failures arrive on the wire as small integer codes inside
//! an `ER` frame. They are mapped onto [`ServerError`] through a fixed table;
//! everything else (transport failures, malformed frames, bad endpoint URLs,
//! failing user callbacks) is represented by the top-level [`Error`].

use std::io;

use thiserror::Error;

/// Result alias used across the crate.
pub type Result<T, E = Error> = std::result::Result<T, E>;

/// Semantic error kinds reported by the server in `ER` frames.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Error)]
pub enum ServerError {
    #[error("400: Bad request")]
    BadRequest,

    #[error("402: Unauthorized")]
    Unauthorized,

    #[error("403: Forbidden")]
    Forbidden,

    #[error("451: Invalid channel name")]
    InvalidChannelName,

    #[error("454: Channel not found")]
    ChannelNotFound,

    #[error("597: Internal error")]
    InternalServerError,

    #[error("598: End of file")]
    UnexpectedEndOfStream,

    /// Code missing from the table, or a reply that made no sense.
    #[error("Unknown server error")]
    UnknownServerError,
}

impl ServerError {
    /// Code used by the server when an `ER` frame carries no code at all.
    pub const DEFAULT_CODE: u16 = 597;

    /// Look up the error kind for a wire code.
    ///
    /// Returns `None` for codes that are not part of the table; callers
    /// decide whether that means [`ServerError::UnknownServerError`].
    pub fn from_code(code: u16) -> Option<Self> {
        match code {
            400 => Some(Self::BadRequest),
            402 => Some(Self::Unauthorized),
            403 => Some(Self::Forbidden),
            451 => Some(Self::InvalidChannelName),
            454 => Some(Self::ChannelNotFound),
            597 => Some(Self::InternalServerError),
            598 => Some(Self::UnexpectedEndOfStream),
            _ => None,
        }
    }

    /// Map the textual code field of an `ER` frame.
    ///
    /// Anything that does not parse or is unmapped becomes
    /// [`ServerError::UnknownServerError`].
    pub fn from_field(field: &str) -> Self {
        field
            .trim()
            .parse::<u16>()
            .ok()
            .and_then(Self::from_code)
            .unwrap_or(Self::UnknownServerError)
    }

    /// Wire code of this kind, if it has one.
    pub fn code(&self) -> Option<u16> {
        match self {
            Self::BadRequest => Some(400),
            Self::Unauthorized => Some(402),
            Self::Forbidden => Some(403),
            Self::InvalidChannelName => Some(451),
            Self::ChannelNotFound => Some(454),
            Self::InternalServerError => Some(597),
            Self::UnexpectedEndOfStream => Some(598),
            Self::UnknownServerError => None,
        }
    }

    /// Whether retrying with the same credentials can never succeed.
    pub fn is_fatal(&self) -> bool {
        matches!(self, Self::Unauthorized)
    }
}

/// Top-level error type.
#[derive(Debug, Error)]
pub enum Error {
    /// The server answered with an error frame (or an unusable reply).
    #[error("Server error {0}")]
    Server(#[from] ServerError),

    /// Transport failure: refused, reset, broken pipe, timeout or EOF.
    #[error("Connection error: {0}")]
    Connection(#[source] io::Error),

    /// Malformed frame or payload.
    #[error("Protocol error: {0}")]
    Protocol(String),

    /// The endpoint URL could not be used.
    #[error("Invalid endpoint: {0}")]
    InvalidEndpoint(String),

    /// A worker callback failed and no exception handler absorbed it.
    #[error("Handler error: {0}")]
    Handler(anyhow::Error),
}

impl Error {
    /// Build a connection error for an elapsed deadline.
    pub(crate) fn timed_out(what: &str) -> Self {
        Error::Connection(io::Error::new(
            io::ErrorKind::TimedOut,
            format!("{} timed out", what),
        ))
    }

    /// True when this is a transport error caused by an elapsed deadline.
    pub fn is_timeout(&self) -> bool {
        matches!(self, Error::Connection(e) if matches!(e.kind(), io::ErrorKind::TimedOut | io::ErrorKind::WouldBlock))
    }

    /// True for any transport-level failure.
    pub fn is_connection(&self) -> bool {
        matches!(self, Error::Connection(_))
    }

    /// The server error kind, if this is one.
    pub fn server_error(&self) -> Option<ServerError> {
        match self {
            Error::Server(kind) => Some(*kind),
            _ => None,
        }
    }
}

impl From<io::Error> for Error {
    fn from(err: io::Error) -> Self {
        Error::Connection(err)
    }
}

impl From<serde_json::Error> for Error {
    fn from(err: serde_json::Error) -> Self {
        Error::Protocol(format!("Invalid JSON payload: {}", err))
    }
}
