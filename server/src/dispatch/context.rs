//! The view a handler gets of one invocation.

use std::sync::Arc;

use serde::de::DeserializeOwned;
use serde_json::{Map, Value};
use tracing::debug;

use wshub_core::errors::Error;
use wshub_core::id::RoomId;
use wshub_core::metrics::MetricsSink;
use wshub_core::protocol::Message;

use crate::connection::Connection;
use crate::rooms::RoomRegistry;
use crate::session::Session;

/// Session, connection and message of one dispatch, plus the reply and
/// fan-out operations handlers use.
#[derive(Clone)]
pub struct Context {
    pub session: Arc<Session>,
    pub connection: Arc<Connection>,
    pub message: Message,
    rooms: Arc<RoomRegistry>,
    metrics: Arc<dyn MetricsSink>,
}

impl Context {
    pub(crate) fn new(
        session: Arc<Session>,
        connection: Arc<Connection>,
        message: Message,
        rooms: Arc<RoomRegistry>,
        metrics: Arc<dyn MetricsSink>,
    ) -> Self {
        Self {
            session,
            connection,
            message,
            rooms,
            metrics,
        }
    }

    pub fn event(&self) -> &str {
        &self.message.event
    }

    pub fn payload(&self) -> &Map<String, Value> {
        &self.message.payload
    }

    /// The room registry, for joins and leaves from handlers.
    pub fn rooms(&self) -> &Arc<RoomRegistry> {
        &self.rooms
    }

    /// Send a correlated reply: same protocol version and correlation
    /// id as the request.
    pub fn reply(&self, event: &str, payload: Value) -> Result<(), Error> {
        let mut message =
            Message::new(self.message.version.clone(), event).with_json_payload(payload);
        message.correlation_id = self.message.correlation_id.clone();
        self.send(message)
    }

    /// Send an uncorrelated event to the invoking session.
    pub fn emit(&self, event: &str, payload: Value) -> Result<(), Error> {
        let message = Message::new(self.message.version.clone(), event).with_json_payload(payload);
        self.send(message)
    }

    /// Send a `sys.error` carrying the request's correlation id.
    pub fn error(&self, code: u16, message: &str, details: Option<Value>) -> Result<(), Error> {
        self.metrics.error(code);
        let message = Message::error(
            self.message.version.clone(),
            code,
            message,
            details,
            self.message.correlation_id.clone(),
        );
        self.send(message)
    }

    /// Send a fully-formed message verbatim.
    pub fn send(&self, message: Message) -> Result<(), Error> {
        self.connection.send(&message)?;
        self.metrics.message_sent(&message.event);
        Ok(())
    }

    /// Broadcast to a room, excluding the invoking session. Returns the
    /// delivered count.
    pub fn broadcast_to_room(&self, room: &RoomId, event: &str, payload: Value) -> usize {
        let message = Message::new(self.message.version.clone(), event).with_json_payload(payload);
        self.rooms.broadcast(room, &message, Some(self.session.id()))
    }

    /// Deserialize the payload into a domain type; structural failures
    /// are reported as validation errors.
    pub fn bind<T: DeserializeOwned>(&self) -> Result<T, Error> {
        serde_json::from_value(Value::Object(self.message.payload.clone())).map_err(|e| {
            debug!("payload binding failed for {}: {e}", self.message.event);
            Error::validation("payload")
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde::Deserialize;
    use serde_json::json;
    use std::collections::HashMap;
    use wshub_core::config::ServerConfig;
    use wshub_core::id::ConnectionId;
    use wshub_core::metrics::NoopMetrics;

    use crate::connection::{SocketCommand, SocketHandle};
    use crate::session::SessionRegistry;

    fn context() -> (Context, SocketHandle) {
        let sessions = Arc::new(SessionRegistry::new(
            &ServerConfig::default(),
            Arc::new(NoopMetrics),
        ));
        let rooms = Arc::new(RoomRegistry::new(
            sessions.clone(),
            true,
            true,
            Arc::new(NoopMetrics),
        ));
        let (conn, handle) = Connection::new(ConnectionId::generate());
        let session = sessions.create(None, Some(conn.clone()), HashMap::new());
        let message = Message::new("1.0", "util.echo")
            .with_json_payload(json!({"msg": "hi", "n": 3}))
            .with_correlation("r1");
        (
            Context::new(session, conn, message, rooms, Arc::new(NoopMetrics)),
            handle,
        )
    }

    async fn next_json(handle: &mut SocketHandle) -> Value {
        match handle.next_command().await.unwrap() {
            SocketCommand::Frame(text) => serde_json::from_str(&text).unwrap(),
            other => panic!("expected frame, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn reply_carries_request_correlation() {
        let (ctx, mut handle) = context();
        ctx.reply("util.echo.response", json!({"echo": "hi"})).unwrap();
        let value = next_json(&mut handle).await;
        assert_eq!(value["e"], "util.echo.response");
        assert_eq!(value["c"], "r1");
        assert_eq!(value["v"], "1.0");
    }

    #[tokio::test]
    async fn emit_has_no_correlation() {
        let (ctx, mut handle) = context();
        ctx.emit("news.update", json!({"headline": "x"})).unwrap();
        let value = next_json(&mut handle).await;
        assert_eq!(value["e"], "news.update");
        assert!(value.get("c").is_none());
    }

    #[tokio::test]
    async fn error_includes_code_and_correlation() {
        let (ctx, mut handle) = context();
        ctx.error(1012, "Forbidden: nope", Some(json!({"hint": "ask"})))
            .unwrap();
        let value = next_json(&mut handle).await;
        assert_eq!(value["e"], "sys.error");
        assert_eq!(value["p"]["code"], 1012);
        assert_eq!(value["p"]["details"]["hint"], "ask");
        assert_eq!(value["c"], "r1");
    }

    #[tokio::test]
    async fn bind_deserializes_payload() {
        #[derive(Deserialize)]
        struct Echo {
            msg: String,
            n: u32,
        }
        let (ctx, _handle) = context();
        let echo: Echo = ctx.bind().unwrap();
        assert_eq!(echo.msg, "hi");
        assert_eq!(echo.n, 3);
    }

    #[tokio::test]
    async fn bind_reports_structural_failure_as_validation() {
        #[derive(Deserialize, Debug)]
        struct Wrong {
            #[allow(dead_code)]
            missing: String,
        }
        let (ctx, _handle) = context();
        let err = ctx.bind::<Wrong>().unwrap_err();
        assert!(matches!(err, Error::Validation { .. }));
        assert_eq!(err.code(), 1009);
    }

    #[tokio::test]
    async fn broadcast_excludes_invoker() {
        let (ctx, _handle) = context();
        let room = RoomId::from("general");
        ctx.rooms().join(&room, &ctx.session);
        // The invoking session is the only member, so nothing is delivered.
        assert_eq!(ctx.broadcast_to_room(&room, "chat.message", json!({})), 0);
    }
}
