//! Parsing and validation of inbound text frames.

use std::collections::HashSet;

use serde_json::Value;

use super::{version, Message};
use crate::config::ServerConfig;
use crate::errors::ProtocolError;

/// Frame parser bound to the server's version policy.
///
/// Messages without a `v` field are accepted and stamped with the
/// current version; messages naming a version outside the supported
/// set (or below the minimum) are rejected.
#[derive(Debug, Clone)]
pub struct Codec {
    current: String,
    supported: HashSet<String>,
    minimum: Option<String>,
}

impl Codec {
    pub fn new(
        current: impl Into<String>,
        supported: impl IntoIterator<Item = String>,
        minimum: Option<String>,
    ) -> Self {
        let current = current.into();
        let mut supported: HashSet<String> = supported.into_iter().collect();
        // The current version is always admissible.
        supported.insert(current.clone());
        Self {
            current,
            supported,
            minimum,
        }
    }

    pub fn from_config(config: &ServerConfig) -> Self {
        Self::new(
            config.protocol_version.clone(),
            config.supported_versions.iter().cloned(),
            config.minimum_version.clone(),
        )
    }

    pub fn current_version(&self) -> &str {
        &self.current
    }

    /// Whether a client-supplied version is acceptable.
    pub fn is_admissible(&self, v: &str) -> bool {
        if !self.supported.contains(v) {
            return false;
        }
        match &self.minimum {
            Some(min) => version::is_at_least(v, min),
            None => true,
        }
    }

    /// Parse a text frame into a validated [`Message`].
    pub fn parse(&self, text: &str) -> Result<Message, ProtocolError> {
        let value: Value =
            serde_json::from_str(text).map_err(|e| ProtocolError::NotJson(e.to_string()))?;
        let obj = value.as_object().ok_or(ProtocolError::NotAnObject)?;

        let event = match obj.get("e") {
            Some(Value::String(s)) if !s.is_empty() => s.clone(),
            _ => return Err(ProtocolError::MissingEvent),
        };

        let version = match obj.get("v") {
            None => self.current.clone(),
            Some(Value::String(v)) if self.is_admissible(v) => v.clone(),
            Some(Value::String(v)) => return Err(ProtocolError::UnsupportedVersion(v.clone())),
            Some(other) => return Err(ProtocolError::UnsupportedVersion(other.to_string())),
        };

        let payload = match obj.get("p") {
            None | Some(Value::Null) => serde_json::Map::new(),
            Some(Value::Object(map)) => map.clone(),
            Some(_) => return Err(ProtocolError::InvalidPayload),
        };

        let correlation_id = obj.get("c").and_then(Value::as_str).map(str::to_string);
        let timestamp = obj
            .get("t")
            .and_then(Value::as_i64)
            .unwrap_or_else(Message::now_millis);

        // Any other top-level fields are tolerated and dropped.
        Ok(Message {
            version,
            event,
            payload,
            correlation_id,
            timestamp,
        })
    }
}
