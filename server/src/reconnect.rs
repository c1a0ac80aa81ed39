//! Handling of `sys.reconnect.request`: rebinding a new connection to
//! an existing session.
//!
//! The swap itself is atomic inside [`SessionRegistry::reconnect`];
//! this module does the protocol around it: request validation, token
//! revalidation, notifying and closing the displaced connection, and
//! emitting `sys.session.restored`. Two racing requests for the same
//! session resolve last-writer-wins with every displaced connection
//! closed, so the session always ends with exactly one attached
//! connection.

use std::sync::Arc;

use serde_json::{Map, Value};
use tracing::{debug, info};

use wshub_core::auth::Authenticator;
use wshub_core::errors::Error;
use wshub_core::id::SessionId;
use wshub_core::metrics::MetricsSink;
use wshub_core::protocol::{codes, events, Message};

use crate::connection::Connection;
use crate::heartbeat::Heartbeat;
use crate::session::{Session, SessionRegistry};

pub struct Reconnector {
    sessions: Arc<SessionRegistry>,
    heartbeat: Arc<Heartbeat>,
    authenticator: Option<Arc<dyn Authenticator>>,
    revalidate_token: bool,
    metrics: Arc<dyn MetricsSink>,
}

impl Reconnector {
    pub fn new(
        sessions: Arc<SessionRegistry>,
        heartbeat: Arc<Heartbeat>,
        authenticator: Option<Arc<dyn Authenticator>>,
        revalidate_token: bool,
        metrics: Arc<dyn MetricsSink>,
    ) -> Self {
        Self {
            sessions,
            heartbeat,
            authenticator,
            revalidate_token,
            metrics,
        }
    }

    /// Process one reconnection request arriving on `connection`.
    ///
    /// Returns the restored session on success; on failure the client
    /// has been answered with the appropriate `sys.error` and the
    /// connection keeps its current session.
    pub async fn handle(
        &self,
        connection: &Arc<Connection>,
        message: &Message,
    ) -> Option<Arc<Session>> {
        let Some(claimed) = message.payload.get("sessionId").and_then(Value::as_str) else {
            self.reject(connection, message, &Error::validation("sessionId"));
            return None;
        };
        let session_id = SessionId::from(claimed);

        if self.sessions.get(&session_id).is_none() {
            debug!("reconnect to unknown session {session_id}");
            self.reject(
                connection,
                message,
                &Error::SessionNotFound(session_id.to_string()),
            );
            return None;
        }

        if self.revalidate_token {
            if let Some(authenticator) = &self.authenticator {
                let token = message.payload.get("token").and_then(Value::as_str);
                let valid = match token {
                    Some(token) => authenticator.validate_token(token).await,
                    None => false,
                };
                if !valid {
                    debug!("reconnect to {session_id} rejected: token failed revalidation");
                    self.reject(connection, message, &Error::TokenExpired);
                    return None;
                }
            }
        }

        let Some((session, displaced)) = self.sessions.reconnect(&session_id, connection.clone())
        else {
            self.reject(
                connection,
                message,
                &Error::SessionNotFound(session_id.to_string()),
            );
            return None;
        };

        if let Some(old) = displaced {
            let notice = Message::new(message.version.clone(), events::DISCONNECT)
                .with_json_payload(serde_json::json!({"reason": "replaced_by_reconnection"}));
            let _ = old.send(&notice);
            old.close(codes::close::SESSION_DUPLICATE, "session duplicate");
            info!(
                "connection {} displaced from session {session_id}",
                old.id()
            );
        }

        let snapshot = session.snapshot();
        let mut payload = Map::new();
        payload.insert(
            "sessionId".to_string(),
            Value::from(snapshot.id.as_str()),
        );
        if let Some(user_id) = snapshot.user_id {
            payload.insert("userId".to_string(), Value::from(user_id));
        }
        // Message payloads are plain JSON-serializable data.
        payload.insert(
            "rooms".to_string(),
            serde_json::to_value(&snapshot.rooms).unwrap(),
        );
        payload.insert(
            "metadata".to_string(),
            serde_json::to_value(&snapshot.metadata).unwrap(),
        );
        let mut restored =
            Message::new(message.version.clone(), events::SESSION_RESTORED).with_payload(payload);
        restored.correlation_id = message.correlation_id.clone();
        if connection.send(&restored).is_ok() {
            self.metrics.message_sent(events::SESSION_RESTORED);
        }

        self.heartbeat.monitor(session_id);
        Some(session)
    }

    fn reject(&self, connection: &Arc<Connection>, request: &Message, error: &Error) {
        self.metrics.error(error.code());
        let reply = Message::error(
            request.version.clone(),
            error.code(),
            error.to_string(),
            None,
            request.correlation_id.clone(),
        );
        let _ = connection.send(&reply);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use serde_json::json;
    use std::collections::HashMap;
    use std::time::Duration;
    use wshub_core::auth::{AuthError, AuthGrant, HandshakeInfo};
    use wshub_core::config::ServerConfig;
    use wshub_core::id::{ConnectionId, RoomId};
    use wshub_core::metrics::NoopMetrics;

    use crate::connection::{SocketCommand, SocketHandle};

    struct RejectAllTokens;

    #[async_trait]
    impl Authenticator for RejectAllTokens {
        async fn authenticate(
            &self,
            _info: &HandshakeInfo,
            _token: Option<&str>,
        ) -> Result<AuthGrant, AuthError> {
            Ok(AuthGrant::default())
        }

        async fn validate_token(&self, _token: &str) -> bool {
            false
        }
    }

    struct Fixture {
        sessions: Arc<SessionRegistry>,
        heartbeat: Arc<Heartbeat>,
    }

    fn fixture() -> Fixture {
        let sessions = Arc::new(SessionRegistry::new(
            &ServerConfig::default(),
            Arc::new(NoopMetrics),
        ));
        let heartbeat = Arc::new(Heartbeat::new(
            Duration::from_secs(30),
            Duration::from_secs(5),
            "1.0",
            sessions.clone(),
        ));
        Fixture {
            sessions,
            heartbeat,
        }
    }

    fn reconnector(f: &Fixture, authenticator: Option<Arc<dyn Authenticator>>, revalidate: bool) -> Reconnector {
        Reconnector::new(
            f.sessions.clone(),
            f.heartbeat.clone(),
            authenticator,
            revalidate,
            Arc::new(NoopMetrics),
        )
    }

    fn connection() -> (Arc<Connection>, SocketHandle) {
        Connection::new(ConnectionId::generate())
    }

    fn request(session_id: &str) -> Message {
        Message::new("1.0", events::RECONNECT_REQUEST)
            .with_json_payload(json!({"sessionId": session_id}))
            .with_correlation("rc1")
    }

    async fn next_json(handle: &mut SocketHandle) -> Value {
        match handle.next_command().await.unwrap() {
            SocketCommand::Frame(text) => serde_json::from_str(&text).unwrap(),
            other => panic!("expected frame, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn restores_session_with_rooms_and_metadata() {
        let f = fixture();
        let reconnector = reconnector(&f, None, false);

        let session = f.sessions.create(
            Some("u1".into()),
            None,
            HashMap::from([("plan".to_string(), json!("pro"))]),
        );
        session.lock().rooms.insert(RoomId::from("general"));

        let (conn, mut handle) = connection();
        let restored = reconnector
            .handle(&conn, &request(session.id().as_str()))
            .await
            .unwrap();
        assert_eq!(restored.id(), session.id());
        assert!(restored.is_active());
        assert!(f.heartbeat.is_monitored(session.id()));

        let value = next_json(&mut handle).await;
        assert_eq!(value["e"], "sys.session.restored");
        assert_eq!(value["p"]["sessionId"], session.id().as_str());
        assert_eq!(value["p"]["userId"], "u1");
        assert_eq!(value["p"]["rooms"], json!(["general"]));
        assert_eq!(value["p"]["metadata"]["plan"], "pro");
        assert_eq!(value["c"], "rc1");
    }

    #[tokio::test]
    async fn unknown_session_gets_1006() {
        let f = fixture();
        let reconnector = reconnector(&f, None, false);
        let (conn, mut handle) = connection();

        assert!(reconnector.handle(&conn, &request("missing")).await.is_none());
        let value = next_json(&mut handle).await;
        assert_eq!(value["e"], "sys.error");
        assert_eq!(value["p"]["code"], 1006);
        assert_eq!(value["c"], "rc1");
        assert!(!conn.is_closed());
    }

    #[tokio::test]
    async fn missing_session_id_is_a_validation_error() {
        let f = fixture();
        let reconnector = reconnector(&f, None, false);
        let (conn, mut handle) = connection();

        let message =
            Message::new("1.0", events::RECONNECT_REQUEST).with_json_payload(json!({}));
        assert!(reconnector.handle(&conn, &message).await.is_none());
        let value = next_json(&mut handle).await;
        assert_eq!(value["p"]["code"], 1009);
    }

    #[tokio::test]
    async fn failed_revalidation_gets_1005() {
        let f = fixture();
        let reconnector = reconnector(&f, Some(Arc::new(RejectAllTokens)), true);
        let session = f.sessions.create(None, None, HashMap::new());
        let (conn, mut handle) = connection();

        let message = Message::new("1.0", events::RECONNECT_REQUEST)
            .with_json_payload(json!({"sessionId": session.id().as_str(), "token": "stale"}));
        assert!(reconnector.handle(&conn, &message).await.is_none());
        let value = next_json(&mut handle).await;
        assert_eq!(value["p"]["code"], 1005);
        // The session is untouched and still reconnectable.
        assert!(f.sessions.get(session.id()).is_some());
    }

    #[tokio::test]
    async fn displaced_connection_is_notified_then_closed() {
        let f = fixture();
        let reconnector = reconnector(&f, None, false);

        let (old, mut old_handle) = connection();
        let session = f.sessions.create(None, Some(old.clone()), HashMap::new());

        let (new, mut new_handle) = connection();
        reconnector
            .handle(&new, &request(session.id().as_str()))
            .await
            .unwrap();

        // The old connection sees the disconnect notice, then the close.
        let value = next_json(&mut old_handle).await;
        assert_eq!(value["e"], "sys.disconnect");
        assert_eq!(value["p"]["reason"], "replaced_by_reconnection");
        match old_handle.next_command().await.unwrap() {
            SocketCommand::Close(info) => {
                assert_eq!(info.code, codes::close::SESSION_DUPLICATE)
            }
            other => panic!("expected close, got {other:?}"),
        }

        // Exactly one connection is attached afterwards.
        assert_eq!(session.connection().unwrap().id(), new.id());
        let value = next_json(&mut new_handle).await;
        assert_eq!(value["e"], "sys.session.restored");
    }
}
