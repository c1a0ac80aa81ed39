//! Stable numeric error codes and WebSocket close codes.
//!
//! Payload codes travel in `sys.error` payloads (`{"code": …}`) and are
//! part of the public protocol; close codes are used on the WebSocket
//! close frame itself.

/// Unknown error.
pub const UNKNOWN: u16 = 1000;

/// Invalid protocol / malformed message.
pub const INVALID_MESSAGE: u16 = 1001;

/// Unsupported protocol version.
pub const UNSUPPORTED_VERSION: u16 = 1002;

/// Authentication required.
pub const AUTH_REQUIRED: u16 = 1003;

/// Authentication failed.
pub const AUTH_FAILED: u16 = 1004;

/// Token expired.
pub const TOKEN_EXPIRED: u16 = 1005;

/// Session not found.
pub const SESSION_NOT_FOUND: u16 = 1006;

/// Session duplicate.
pub const SESSION_DUPLICATE: u16 = 1007;

/// Handler not found.
pub const HANDLER_NOT_FOUND: u16 = 1008;

/// Validation failed.
pub const VALIDATION_FAILED: u16 = 1009;

/// Rate limit exceeded.
pub const RATE_LIMIT_EXCEEDED: u16 = 1010;

/// Room not found.
pub const ROOM_NOT_FOUND: u16 = 1011;

/// Forbidden.
pub const FORBIDDEN: u16 = 1012;

/// Internal error (always opaque to clients).
pub const INTERNAL_ERROR: u16 = 1500;

/// WebSocket close codes used by the server.
pub mod close {
    /// Normal closure.
    pub const NORMAL: u16 = 1000;

    /// Server going away (shutdown).
    pub const GOING_AWAY: u16 = 1001;

    /// Protocol error.
    pub const PROTOCOL_ERROR: u16 = 1002;

    /// Message too large.
    pub const MESSAGE_TOO_LARGE: u16 = 1009;

    /// Internal server error.
    pub const INTERNAL: u16 = 1011;

    /// Authentication required but no token supplied.
    pub const AUTH_REQUIRED: u16 = 4001;

    /// Authentication failed.
    pub const AUTH_FAILED: u16 = 4002;

    /// Connection displaced by a reconnection to the same session.
    pub const SESSION_DUPLICATE: u16 = 4003;

    /// Heartbeat liveness lost.
    pub const INACTIVITY_TIMEOUT: u16 = 4004;

    /// Suspended session expired and was reaped.
    pub const SESSION_EXPIRED: u16 = 4005;
}
