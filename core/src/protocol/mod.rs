//! Wire protocol: the [`Message`] unit, the [`Codec`](codec::Codec)
//! that parses and validates frames, version comparison, and the stable
//! numeric codes.
//!
//! One message is one JSON object per WebSocket text frame, with short
//! keys to keep frames compact:
//!
//! ```json
//! { "v": "1.0", "e": "chat.send", "p": { "text": "hi" }, "c": "r1", "t": 1712345678901 }
//! ```

pub mod codec;
pub mod codes;
pub mod version;

use chrono::Utc;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

pub use codec::Codec;

/// Reserved event names (prefix `sys.`).
pub mod events {
    /// Server → client, sent once the handshake completes.
    pub const SESSION_CREATED: &str = "sys.session.created";
    /// Server → client, sent after a successful reconnection.
    pub const SESSION_RESTORED: &str = "sys.session.restored";
    /// Server → client, best-effort notice before suspension.
    pub const SESSION_SUSPENDED: &str = "sys.session.suspended";
    /// Server → client, best-effort notice before the session closes.
    pub const SESSION_CLOSED: &str = "sys.session.closed";
    /// Server → client liveness probe.
    pub const PING: &str = "sys.ping";
    /// Client → server liveness reply.
    pub const PONG: &str = "sys.pong";
    /// Client → server request to rebind to an existing session.
    pub const RECONNECT_REQUEST: &str = "sys.reconnect.request";
    /// Server → client notice that the connection is being dropped.
    pub const DISCONNECT: &str = "sys.disconnect";
    /// Server → client error report.
    pub const ERROR: &str = "sys.error";
}

/// A single wire message.
///
/// `correlation_id` is omitted from the wire when absent; the timestamp
/// is always emitted. Deserialization goes through
/// [`Codec::parse`](codec::Codec::parse), which validates structure and
/// version admissibility; the `Deserialize` impl here is for trusted
/// inputs (tests, pub/sub payloads).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Message {
    /// Protocol version (`v`).
    #[serde(rename = "v")]
    pub version: String,

    /// Event name (`e`); never empty.
    #[serde(rename = "e")]
    pub event: String,

    /// Payload object (`p`); may be empty.
    #[serde(rename = "p", default)]
    pub payload: Map<String, Value>,

    /// Correlation id (`c`) tying a reply to a request.
    #[serde(rename = "c", default, skip_serializing_if = "Option::is_none")]
    pub correlation_id: Option<String>,

    /// Milliseconds since the Unix epoch (`t`).
    #[serde(rename = "t", default = "Message::now_millis")]
    pub timestamp: i64,
}

impl Message {
    /// Build a message with an empty payload, stamped now.
    pub fn new(version: impl Into<String>, event: impl Into<String>) -> Self {
        Self {
            version: version.into(),
            event: event.into(),
            payload: Map::new(),
            correlation_id: None,
            timestamp: Self::now_millis(),
        }
    }

    /// Replace the payload.
    pub fn with_payload(mut self, payload: Map<String, Value>) -> Self {
        self.payload = payload;
        self
    }

    /// Replace the payload from a JSON value.
    ///
    /// A non-object value is wrapped under a `"value"` key so the
    /// payload stays an object.
    pub fn with_json_payload(mut self, value: Value) -> Self {
        self.payload = into_payload(value);
        self
    }

    /// Attach a correlation id.
    pub fn with_correlation(mut self, id: impl Into<String>) -> Self {
        self.correlation_id = Some(id.into());
        self
    }

    /// Build the auto-reply to `request`: event `{event}.response`, same
    /// protocol version, same correlation id.
    pub fn response_to(request: &Self, payload: Map<String, Value>) -> Self {
        Self {
            version: request.version.clone(),
            event: format!("{}.response", request.event),
            payload,
            correlation_id: request.correlation_id.clone(),
            timestamp: Self::now_millis(),
        }
    }

    /// Build a `sys.error` message.
    ///
    /// The correlation id of the failed request is echoed so clients can
    /// resolve a pending request as a failure.
    pub fn error(
        version: impl Into<String>,
        code: u16,
        message: impl Into<String>,
        details: Option<Value>,
        correlation_id: Option<String>,
    ) -> Self {
        let mut payload = Map::new();
        payload.insert("code".to_string(), Value::from(code));
        payload.insert("message".to_string(), Value::from(message.into()));
        if let Some(details) = details {
            payload.insert("details".to_string(), details);
        }
        Self {
            version: version.into(),
            event: events::ERROR.to_string(),
            payload,
            correlation_id,
            timestamp: Self::now_millis(),
        }
    }

    /// Serialize to the compact wire form.
    pub fn encode(&self) -> String {
        // A Map<String, Value> cannot fail to serialize.
        serde_json::to_string(self).unwrap()
    }

    /// Current time in milliseconds since the Unix epoch.
    pub fn now_millis() -> i64 {
        Utc::now().timestamp_millis()
    }
}

/// Coerce a JSON value into a payload object.
pub fn into_payload(value: Value) -> Map<String, Value> {
    match value {
        Value::Object(map) => map,
        Value::Null => Map::new(),
        other => {
            let mut map = Map::new();
            map.insert("value".to_string(), other);
            map
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn encode_uses_short_keys() {
        let msg = Message::new("1.0", "util.echo")
            .with_json_payload(json!({"msg": "hi"}))
            .with_correlation("r1");
        let value: Value = serde_json::from_str(&msg.encode()).unwrap();
        assert_eq!(value["v"], "1.0");
        assert_eq!(value["e"], "util.echo");
        assert_eq!(value["p"]["msg"], "hi");
        assert_eq!(value["c"], "r1");
        assert!(value["t"].is_i64());
    }

    #[test]
    fn correlation_id_omitted_when_absent() {
        let msg = Message::new("1.0", "tick");
        let value: Value = serde_json::from_str(&msg.encode()).unwrap();
        assert!(value.get("c").is_none());
        // Timestamp is always emitted.
        assert!(value.get("t").is_some());
    }

    #[test]
    fn response_to_echoes_version_and_correlation() {
        let request = Message::new("1.0", "transfer").with_correlation("r7");
        let reply = Message::response_to(&request, into_payload(json!({"ok": true})));
        assert_eq!(reply.event, "transfer.response");
        assert_eq!(reply.version, "1.0");
        assert_eq!(reply.correlation_id.as_deref(), Some("r7"));
        assert_eq!(reply.payload["ok"], true);
    }

    #[test]
    fn error_message_shape() {
        let msg = Message::error("1.0", 1009, "Validation failed for field: amount", None, None);
        assert_eq!(msg.event, "sys.error");
        assert_eq!(msg.payload["code"], 1009);
        assert_eq!(
            msg.payload["message"],
            "Validation failed for field: amount"
        );
        assert!(msg.payload.get("details").is_none());
    }

    #[test]
    fn into_payload_wraps_scalars() {
        assert!(into_payload(json!(null)).is_empty());
        let wrapped = into_payload(json!(42));
        assert_eq!(wrapped["value"], 42);
    }
}
