//! Pluggable authentication.
//!
//! The runtime never verifies credentials itself; it extracts a token
//! during the upgrade, hands it to the configured [`Authenticator`],
//! and acts on the outcome. Implementations typically check a JWT or
//! look the token up in a session store.

use std::collections::HashMap;
use std::net::SocketAddr;

use async_trait::async_trait;
use serde_json::Value;
use thiserror::Error;

use crate::id::ConnectionId;
use crate::protocol::codes;

/// What the runtime knows about a connection at handshake time.
#[derive(Debug, Clone)]
pub struct HandshakeInfo {
    pub connection_id: ConnectionId,
    pub remote_addr: Option<SocketAddr>,
    /// The request path the upgrade arrived on.
    pub path: String,
}

/// A successful authentication.
#[derive(Debug, Clone, Default)]
pub struct AuthGrant {
    /// Identity to attach to the session.
    pub user_id: Option<String>,
    /// Extra attributes merged into the session metadata.
    pub metadata: HashMap<String, Value>,
}

impl AuthGrant {
    pub fn for_user(user_id: impl Into<String>) -> Self {
        Self {
            user_id: Some(user_id.into()),
            metadata: HashMap::new(),
        }
    }
}

/// A rejected authentication, with the payload code to report.
#[derive(Debug, Clone, Error)]
#[error("{message}")]
pub struct AuthError {
    pub code: u16,
    pub message: String,
}

impl AuthError {
    pub fn failed(message: impl Into<String>) -> Self {
        Self {
            code: codes::AUTH_FAILED,
            message: message.into(),
        }
    }

    pub fn expired() -> Self {
        Self {
            code: codes::TOKEN_EXPIRED,
            message: "Token expired".to_string(),
        }
    }
}

/// Credential verifier plugged into the handshake and the reconnection
/// path.
#[async_trait]
pub trait Authenticator: Send + Sync {
    /// Verify a token presented during the handshake.
    ///
    /// `token` is `None` when the client supplied none and the server
    /// does not require auth; implementations may still grant an
    /// anonymous session in that case.
    async fn authenticate(
        &self,
        info: &HandshakeInfo,
        token: Option<&str>,
    ) -> Result<AuthGrant, AuthError>;

    /// Cheap token re-check used on reconnection when
    /// `revalidate_token_on_reconnect` is set.
    async fn validate_token(&self, _token: &str) -> bool {
        true
    }

    /// Pull a token out of the upgrade request. The default reads the
    /// `token` query parameter and the `Authorization: Bearer …` header.
    fn extract_token(&self, uri: &str, authorization: Option<&str>) -> Option<String> {
        default_extract_token(uri, authorization)
    }
}

/// Default token extraction: `?token=` query parameter first, then the
/// `Authorization: Bearer` header.
pub fn default_extract_token(uri: &str, authorization: Option<&str>) -> Option<String> {
    if let Some(query) = uri.splitn(2, '?').nth(1) {
        for pair in query.split('&') {
            if let Some(value) = pair.strip_prefix("token=") {
                if !value.is_empty() {
                    return Some(value.to_string());
                }
            }
        }
    }
    authorization
        .and_then(|header| header.strip_prefix("Bearer "))
        .map(str::trim)
        .filter(|token| !token.is_empty())
        .map(str::to_string)
}
