//! A single transport connection.
//!
//! A [`Connection`] wraps one WebSocket. Outbound sends are enqueued on
//! a channel consumed by the socket task ([`socket::drive_socket`]), so
//! sending never blocks a handler; the task owns the socket exclusively
//! and resolves the done-signal exactly once with the close code.
//!
//! [`Connection::new`] returns the connection together with its
//! [`SocketHandle`]. The runtime hands the handle to `drive_socket`;
//! tests can keep it and observe outbound frames directly, which makes
//! handler code testable without any real socket.

pub mod registry;
mod socket;

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use tokio::sync::{mpsc, watch};

use wshub_core::errors::Error;
use wshub_core::id::{ConnectionId, SessionId};
use wshub_core::protocol::Message;

pub use registry::ConnectionRegistry;
pub use socket::{drive_socket, Inbound};

/// Close code and reason a connection terminated with.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CloseInfo {
    pub code: u16,
    pub reason: String,
}

impl CloseInfo {
    pub fn new(code: u16, reason: impl Into<String>) -> Self {
        Self {
            code,
            reason: reason.into(),
        }
    }

    /// Abnormal closure (1006): the socket went away without a close
    /// handshake.
    pub fn abnormal() -> Self {
        Self::new(1006, "abnormal closure")
    }
}

/// What a connection asks its socket task to do next.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SocketCommand {
    /// Write a text frame.
    Frame(String),
    /// Send a close frame and terminate.
    Close(CloseInfo),
}

/// A live transport connection.
pub struct Connection {
    id: ConnectionId,
    connected_at: DateTime<Utc>,
    session: Mutex<Option<SessionId>>,
    closed: AtomicBool,
    outbound: mpsc::UnboundedSender<SocketCommand>,
    done: watch::Receiver<Option<CloseInfo>>,
}

impl Connection {
    /// Create a connection and the handle its socket task drives.
    pub fn new(id: ConnectionId) -> (Arc<Self>, SocketHandle) {
        let (outbound, commands) = mpsc::unbounded_channel();
        let (done_tx, done_rx) = watch::channel(None);
        let connection = Arc::new(Self {
            id,
            connected_at: Utc::now(),
            session: Mutex::new(None),
            closed: AtomicBool::new(false),
            outbound,
            done: done_rx,
        });
        let handle = SocketHandle {
            commands,
            done: done_tx,
            connection: Arc::downgrade(&connection),
        };
        (connection, handle)
    }

    pub fn id(&self) -> &ConnectionId {
        &self.id
    }

    pub fn connected_at(&self) -> DateTime<Utc> {
        self.connected_at
    }

    /// The session this connection is currently attached to, if any.
    pub fn session_id(&self) -> Option<SessionId> {
        self.session.lock().clone()
    }

    pub(crate) fn bind_session(&self, id: &SessionId) {
        *self.session.lock() = Some(id.clone());
    }

    pub(crate) fn unbind_session(&self) {
        *self.session.lock() = None;
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    /// Serialize and enqueue a message.
    pub fn send(&self, message: &Message) -> Result<(), Error> {
        self.send_raw(message.encode())
    }

    /// Enqueue an already-serialized text frame.
    pub fn send_raw(&self, text: String) -> Result<(), Error> {
        if self.is_closed() {
            return Err(Error::ConnectionClosed);
        }
        self.outbound
            .send(SocketCommand::Frame(text))
            .map_err(|_| Error::ConnectionClosed)
    }

    /// Request closure with the given code. Idempotent; the first call
    /// wins and further sends fail immediately.
    pub fn close(&self, code: u16, reason: impl Into<String>) {
        if self.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        let _ = self
            .outbound
            .send(SocketCommand::Close(CloseInfo::new(code, reason)));
    }

    /// Wait for the connection to terminate and return the close info.
    ///
    /// Resolves for every caller; safe to await from multiple tasks.
    pub async fn done(&self) -> CloseInfo {
        let mut rx = self.done.clone();
        loop {
            if let Some(info) = rx.borrow_and_update().clone() {
                return info;
            }
            if rx.changed().await.is_err() {
                // Socket task dropped without completing.
                return CloseInfo::abnormal();
            }
        }
    }
}

impl std::fmt::Debug for Connection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Connection")
            .field("id", &self.id)
            .field("session", &*self.session.lock())
            .field("closed", &self.is_closed())
            .finish()
    }
}

/// The socket side of a [`Connection`]: commands to execute and the
/// done-signal to resolve.
pub struct SocketHandle {
    commands: mpsc::UnboundedReceiver<SocketCommand>,
    done: watch::Sender<Option<CloseInfo>>,
    connection: Weak<Connection>,
}

impl SocketHandle {
    /// Next command to execute, or `None` once the connection is gone.
    pub async fn next_command(&mut self) -> Option<SocketCommand> {
        self.commands.recv().await
    }

    /// Resolve the done-signal and mark the connection closed. Called
    /// exactly once by whoever drives the socket.
    pub fn complete(&self, info: CloseInfo) {
        if let Some(connection) = self.connection.upgrade() {
            connection.closed.store(true, Ordering::Release);
        }
        let _ = self.done.send(Some(info));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::Value;
    use wshub_core::protocol::codes::close;

    #[tokio::test]
    async fn send_enqueues_serialized_frame() {
        let (conn, mut handle) = Connection::new(ConnectionId::generate());
        let msg = Message::new("1.0", "util.echo").with_correlation("r1");
        conn.send(&msg).unwrap();

        match handle.next_command().await.unwrap() {
            SocketCommand::Frame(text) => {
                let value: Value = serde_json::from_str(&text).unwrap();
                assert_eq!(value["e"], "util.echo");
                assert_eq!(value["c"], "r1");
            }
            other => panic!("expected frame, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn send_on_closed_connection_fails() {
        let (conn, _handle) = Connection::new(ConnectionId::generate());
        conn.close(close::NORMAL, "bye");
        let err = conn.send(&Message::new("1.0", "x")).unwrap_err();
        assert!(matches!(err, Error::ConnectionClosed));
    }

    #[tokio::test]
    async fn close_is_idempotent() {
        let (conn, mut handle) = Connection::new(ConnectionId::generate());
        conn.close(close::NORMAL, "first");
        conn.close(close::GOING_AWAY, "second");

        match handle.next_command().await.unwrap() {
            SocketCommand::Close(info) => {
                assert_eq!(info.code, close::NORMAL);
                assert_eq!(info.reason, "first");
            }
            other => panic!("expected close, got {other:?}"),
        }
        // Only the first close was enqueued.
        drop(conn);
        assert!(handle.next_command().await.is_none());
    }

    #[tokio::test]
    async fn done_resolves_with_close_info() {
        let (conn, handle) = Connection::new(ConnectionId::generate());
        let waiter = {
            let conn = conn.clone();
            tokio::spawn(async move { conn.done().await })
        };
        handle.complete(CloseInfo::new(close::SESSION_DUPLICATE, "displaced"));
        let info = waiter.await.unwrap();
        assert_eq!(info.code, close::SESSION_DUPLICATE);
        assert!(conn.is_closed());

        // Late waiters resolve immediately.
        let info = conn.done().await;
        assert_eq!(info.reason, "displaced");
    }

    #[tokio::test]
    async fn session_binding_round_trip() {
        let (conn, _handle) = Connection::new(ConnectionId::generate());
        assert!(conn.session_id().is_none());
        let sid = SessionId::generate();
        conn.bind_session(&sid);
        assert_eq!(conn.session_id(), Some(sid));
        conn.unbind_session();
        assert!(conn.session_id().is_none());
    }
}
