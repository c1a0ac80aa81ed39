use std::collections::HashMap;
use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Server configuration.
///
/// Every field has a default so a config file (or a plain
/// `ServerConfig::default()`) only needs to name what it overrides.
/// Durations are millisecond integers on the wire with [`Duration`]
/// accessors for the runtime.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ServerConfig {
    /// Bind address for bound mode.
    #[serde(default = "default_host")]
    pub host: String,

    /// Bind port for bound mode. Port 0 asks the OS for a free port.
    #[serde(default = "default_port")]
    pub port: u16,

    /// HTTP path that accepts WebSocket upgrades.
    #[serde(default = "default_path")]
    pub path: String,

    /// Protocol version stamped on messages that omit `v`.
    #[serde(default = "default_protocol_version")]
    pub protocol_version: String,

    /// Versions accepted from clients. The current version is always
    /// included.
    #[serde(default = "default_supported_versions")]
    pub supported_versions: Vec<String>,

    /// Oldest admissible version, compared component-wise.
    #[serde(default)]
    pub minimum_version: Option<String>,

    /// Interval between `sys.ping` probes.
    #[serde(default = "default_heartbeat_interval_ms")]
    pub heartbeat_interval_ms: u64,

    /// How long to wait for `sys.pong` before suspending the session.
    #[serde(default = "default_heartbeat_timeout_ms")]
    pub heartbeat_timeout_ms: u64,

    /// How long a suspended session stays reconnectable.
    #[serde(default = "default_session_suspend_timeout_ms")]
    pub session_suspend_timeout_ms: u64,

    /// Sweep interval of the suspended-session reaper.
    #[serde(default = "default_session_cleanup_interval_ms")]
    pub session_cleanup_interval_ms: u64,

    /// Refuse connections that carry no auth token.
    #[serde(default)]
    pub require_auth: bool,

    /// Budget for the authenticator during the handshake.
    #[serde(default = "default_auth_timeout_ms")]
    pub auth_timeout_ms: u64,

    /// Re-validate the token on `sys.reconnect.request`.
    #[serde(default)]
    pub revalidate_token_on_reconnect: bool,

    /// Maximum inbound message size in bytes.
    #[serde(default = "default_max_message_size")]
    pub max_message_size: usize,

    /// Reserved: permessage-deflate negotiation is not performed by the
    /// current transport.
    #[serde(default)]
    pub enable_compression: bool,

    /// Extra headers applied to the `101` upgrade response
    /// (`Access-Control-Allow-Origin` and friends).
    #[serde(default)]
    pub cors_headers: HashMap<String, String>,

    /// Create rooms on first `join`.
    #[serde(default = "default_true")]
    pub auto_create_rooms: bool,

    /// Delete rooms when the last member leaves.
    #[serde(default = "default_true")]
    pub auto_delete_empty_rooms: bool,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
            path: default_path(),
            protocol_version: default_protocol_version(),
            supported_versions: default_supported_versions(),
            minimum_version: None,
            heartbeat_interval_ms: default_heartbeat_interval_ms(),
            heartbeat_timeout_ms: default_heartbeat_timeout_ms(),
            session_suspend_timeout_ms: default_session_suspend_timeout_ms(),
            session_cleanup_interval_ms: default_session_cleanup_interval_ms(),
            require_auth: false,
            auth_timeout_ms: default_auth_timeout_ms(),
            revalidate_token_on_reconnect: false,
            max_message_size: default_max_message_size(),
            enable_compression: false,
            cors_headers: HashMap::new(),
            auto_create_rooms: true,
            auto_delete_empty_rooms: true,
        }
    }
}

impl ServerConfig {
    pub fn bind_addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    pub fn heartbeat_interval(&self) -> Duration {
        Duration::from_millis(self.heartbeat_interval_ms)
    }

    pub fn heartbeat_timeout(&self) -> Duration {
        Duration::from_millis(self.heartbeat_timeout_ms)
    }

    pub fn session_suspend_timeout(&self) -> Duration {
        Duration::from_millis(self.session_suspend_timeout_ms)
    }

    pub fn session_cleanup_interval(&self) -> Duration {
        Duration::from_millis(self.session_cleanup_interval_ms)
    }

    pub fn auth_timeout(&self) -> Duration {
        Duration::from_millis(self.auth_timeout_ms)
    }
}

fn default_host() -> String {
    "127.0.0.1".to_string()
}

fn default_port() -> u16 {
    8080
}

fn default_path() -> String {
    "/ws".to_string()
}

fn default_protocol_version() -> String {
    "1.0".to_string()
}

fn default_supported_versions() -> Vec<String> {
    vec![default_protocol_version()]
}

fn default_heartbeat_interval_ms() -> u64 {
    30_000
}

fn default_heartbeat_timeout_ms() -> u64 {
    5_000
}

fn default_session_suspend_timeout_ms() -> u64 {
    60_000
}

fn default_session_cleanup_interval_ms() -> u64 {
    10_000
}

fn default_auth_timeout_ms() -> u64 {
    10_000
}

fn default_max_message_size() -> usize {
    1_048_576
}

fn default_true() -> bool {
    true
}
