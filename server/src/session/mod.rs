//! Sessions: logical identities that outlive transport connections.

pub mod registry;

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use parking_lot::{Mutex, MutexGuard};
use serde::Serialize;
use serde_json::Value;

use wshub_core::errors::Error;
use wshub_core::id::{ConnectionId, RoomId, SessionId};
use wshub_core::protocol::Message;

use crate::connection::Connection;

pub use registry::SessionRegistry;

/// Lifecycle state of a session.
///
/// `Closed` is terminal; a session is `Active` exactly when a live
/// connection is attached.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum SessionState {
    Active,
    Suspended,
    Closed,
}

impl SessionState {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Active => "active",
            Self::Suspended => "suspended",
            Self::Closed => "closed",
        }
    }
}

pub(crate) struct SessionInner {
    pub(crate) state: SessionState,
    pub(crate) user_id: Option<String>,
    pub(crate) connection: Option<Arc<Connection>>,
    pub(crate) rooms: HashSet<RoomId>,
    pub(crate) metadata: HashMap<String, Value>,
    pub(crate) last_activity: DateTime<Utc>,
    pub(crate) suspended_at: Option<DateTime<Utc>>,
}

/// A logical session.
///
/// All mutable fields live behind one mutex; registries take it only
/// for short, non-awaiting critical sections. Handlers get a
/// single-writer view through the per-session dispatch ordering, so
/// reads here are cheap snapshots.
pub struct Session {
    id: SessionId,
    created_at: DateTime<Utc>,
    inner: Mutex<SessionInner>,
    // Serializes dispatcher invocations for this session across
    // connection swaps; the read pump holds it for each dispatch.
    dispatch_gate: tokio::sync::Mutex<()>,
}

impl Session {
    pub(crate) fn new(
        id: SessionId,
        user_id: Option<String>,
        connection: Option<Arc<Connection>>,
        metadata: HashMap<String, Value>,
    ) -> Arc<Self> {
        let now = Utc::now();
        // A session without a connection starts suspended: the
        // attached-iff-active invariant holds from birth.
        let (state, suspended_at) = match connection {
            Some(_) => (SessionState::Active, None),
            None => (SessionState::Suspended, Some(now)),
        };
        let session = Arc::new(Self {
            id: id.clone(),
            created_at: now,
            inner: Mutex::new(SessionInner {
                state,
                user_id,
                connection,
                rooms: HashSet::new(),
                metadata,
                last_activity: now,
                suspended_at,
            }),
            dispatch_gate: tokio::sync::Mutex::new(()),
        });
        if let Some(connection) = session.connection() {
            connection.bind_session(&id);
        }
        session
    }

    pub fn id(&self) -> &SessionId {
        &self.id
    }

    pub fn created_at(&self) -> DateTime<Utc> {
        self.created_at
    }

    pub fn state(&self) -> SessionState {
        self.inner.lock().state
    }

    pub fn is_active(&self) -> bool {
        self.state() == SessionState::Active
    }

    pub fn is_closed(&self) -> bool {
        self.state() == SessionState::Closed
    }

    pub fn user_id(&self) -> Option<String> {
        self.inner.lock().user_id.clone()
    }

    /// The currently attached connection; `Some` iff the session is
    /// active.
    pub fn connection(&self) -> Option<Arc<Connection>> {
        self.inner.lock().connection.clone()
    }

    pub fn rooms(&self) -> Vec<RoomId> {
        self.inner.lock().rooms.iter().cloned().collect()
    }

    pub fn in_room(&self, room: &RoomId) -> bool {
        self.inner.lock().rooms.contains(room)
    }

    pub fn metadata(&self) -> HashMap<String, Value> {
        self.inner.lock().metadata.clone()
    }

    pub fn get_metadata(&self, key: &str) -> Option<Value> {
        self.inner.lock().metadata.get(key).cloned()
    }

    pub fn set_metadata(&self, key: impl Into<String>, value: Value) {
        self.inner.lock().metadata.insert(key.into(), value);
    }

    pub fn last_activity(&self) -> DateTime<Utc> {
        self.inner.lock().last_activity
    }

    pub fn suspended_at(&self) -> Option<DateTime<Utc>> {
        self.inner.lock().suspended_at
    }

    /// Record activity now.
    pub fn touch(&self) {
        self.inner.lock().last_activity = Utc::now();
    }

    /// Send a message over the attached connection.
    pub fn send(&self, message: &Message) -> Result<(), Error> {
        match self.connection() {
            Some(connection) => connection.send(message),
            None => Err(Error::ConnectionClosed),
        }
    }

    /// Read-only snapshot for listing and `sys.session.restored`.
    pub fn snapshot(&self) -> SessionSnapshot {
        let inner = self.inner.lock();
        let mut rooms: Vec<RoomId> = inner.rooms.iter().cloned().collect();
        rooms.sort();
        SessionSnapshot {
            id: self.id.clone(),
            state: inner.state,
            user_id: inner.user_id.clone(),
            connection_id: inner.connection.as_ref().map(|c| c.id().clone()),
            rooms,
            metadata: inner.metadata.clone(),
            created_at: self.created_at,
            last_activity: inner.last_activity,
            suspended_at: inner.suspended_at,
        }
    }

    pub(crate) fn lock(&self) -> MutexGuard<'_, SessionInner> {
        self.inner.lock()
    }

    pub(crate) fn dispatch_gate(&self) -> &tokio::sync::Mutex<()> {
        &self.dispatch_gate
    }
}

impl std::fmt::Debug for Session {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let inner = self.inner.lock();
        f.debug_struct("Session")
            .field("id", &self.id)
            .field("state", &inner.state)
            .field("user_id", &inner.user_id)
            .field("rooms", &inner.rooms.len())
            .finish()
    }
}

/// Serializable point-in-time view of a session.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionSnapshot {
    pub id: SessionId,
    pub state: SessionState,
    pub user_id: Option<String>,
    pub connection_id: Option<ConnectionId>,
    pub rooms: Vec<RoomId>,
    pub metadata: HashMap<String, Value>,
    pub created_at: DateTime<Utc>,
    pub last_activity: DateTime<Utc>,
    pub suspended_at: Option<DateTime<Utc>>,
}
