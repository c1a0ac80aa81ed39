//! Unified error types for the wshub core crate.
//!
//! [`Error`] is the taxonomy shared by the whole runtime; every variant
//! that can reach a client maps to a stable numeric payload code via
//! [`Error::code()`]. The dispatcher converts handler errors into
//! `sys.error` messages carrying that code, so the `Display` strings
//! here are client-visible.

use thiserror::Error;

use crate::protocol::codes;

/// A wire frame that could not be turned into a valid [`Message`](crate::Message).
///
/// These are surfaced on a connection's error stream and never reach
/// the handler path.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ProtocolError {
    /// The text frame was not valid JSON.
    #[error("Invalid message: not valid JSON: {0}")]
    NotJson(String),

    /// The JSON root was not an object.
    #[error("Invalid message: root must be a JSON object")]
    NotAnObject,

    /// The `e` field was missing, empty, or not a string.
    #[error("Invalid message: event name is missing or empty")]
    MissingEvent,

    /// The `p` field was present but not a JSON object.
    #[error("Invalid message: payload must be a JSON object")]
    InvalidPayload,

    /// The `v` field named a protocol version outside the supported set.
    #[error("Unsupported protocol version: {0}")]
    UnsupportedVersion(String),

    /// A binary frame arrived on a text-only protocol.
    #[error("Invalid message: binary frames are not supported")]
    BinaryFrame,
}

impl ProtocolError {
    /// The stable payload error code for this failure.
    pub fn code(&self) -> u16 {
        match self {
            Self::UnsupportedVersion(_) => codes::UNSUPPORTED_VERSION,
            _ => codes::INVALID_MESSAGE,
        }
    }
}

/// Top-level error taxonomy for the wshub runtime.
#[derive(Error, Debug)]
pub enum Error {
    /// A malformed or version-inadmissible wire message.
    #[error(transparent)]
    Protocol(#[from] ProtocolError),

    /// The handler requires authentication and the session has none.
    #[error("Authentication required")]
    AuthRequired,

    /// Credential verification failed.
    #[error("Authentication failed: {0}")]
    AuthFailed(String),

    /// A reconnection token failed revalidation.
    #[error("Token expired")]
    TokenExpired,

    /// No session with the given ID (or it has been closed).
    #[error("Session not found: {0}")]
    SessionNotFound(String),

    /// The session already has a live connection attached.
    #[error("Session duplicate: {0}")]
    SessionDuplicate(String),

    /// No handler is registered for the event.
    #[error("Handler not found: {0}")]
    HandlerNotFound(String),

    /// A payload field failed schema validation or binding.
    #[error("Validation failed for field: {field}")]
    Validation {
        /// The first offending payload field.
        field: String,
    },

    /// The sender exceeded its message budget.
    #[error("Rate limit exceeded")]
    RateLimited,

    /// No room with the given ID.
    #[error("Room not found: {0}")]
    RoomNotFound(String),

    /// The room is at its configured capacity.
    #[error("Room is full: {0}")]
    RoomFull(String),

    /// The session is not allowed to perform the operation.
    #[error("Forbidden: {0}")]
    Forbidden(String),

    /// The connection is closed; no further sends are possible.
    #[error("Connection closed")]
    ConnectionClosed,

    /// A low-level I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Catch-all for faults that must stay opaque to clients.
    #[error("Internal error: {0}")]
    Internal(String),
}

impl Error {
    /// Shorthand for a validation failure on one field.
    pub fn validation(field: impl Into<String>) -> Self {
        Self::Validation {
            field: field.into(),
        }
    }

    /// The stable payload error code carried by `sys.error` replies.
    ///
    /// Internal and I/O faults deliberately collapse to
    /// [`codes::INTERNAL_ERROR`]; clients only ever see the opaque code.
    pub fn code(&self) -> u16 {
        match self {
            Self::Protocol(e) => e.code(),
            Self::AuthRequired => codes::AUTH_REQUIRED,
            Self::AuthFailed(_) => codes::AUTH_FAILED,
            Self::TokenExpired => codes::TOKEN_EXPIRED,
            Self::SessionNotFound(_) => codes::SESSION_NOT_FOUND,
            Self::SessionDuplicate(_) => codes::SESSION_DUPLICATE,
            Self::HandlerNotFound(_) => codes::HANDLER_NOT_FOUND,
            Self::Validation { .. } => codes::VALIDATION_FAILED,
            Self::RateLimited => codes::RATE_LIMIT_EXCEEDED,
            Self::RoomNotFound(_) | Self::RoomFull(_) => codes::ROOM_NOT_FOUND,
            Self::Forbidden(_) => codes::FORBIDDEN,
            Self::ConnectionClosed | Self::Io(_) | Self::Internal(_) => codes::INTERNAL_ERROR,
        }
    }
}
