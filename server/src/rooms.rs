//! Rooms: named sets of session ids used for fan-out.
//!
//! Rooms hold session ids, never connections. That indirection is what
//! lets a reconnected session keep receiving broadcasts: membership is
//! untouched by socket churn, and delivery resolves the current
//! connection at send time.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use parking_lot::{Mutex, RwLock};
use serde::Serialize;
use serde_json::Value;
use tracing::debug;

use wshub_core::id::{RoomId, SessionId};
use wshub_core::metrics::MetricsSink;
use wshub_core::protocol::Message;

use crate::callback::invoke_all;
use crate::session::{Session, SessionRegistry};

/// Options applied when a room is created explicitly.
#[derive(Debug, Clone, Default)]
pub struct RoomOptions {
    /// Maximum member count; 0 means unbounded.
    pub max_members: usize,
    pub metadata: HashMap<String, Value>,
}

struct Room {
    members: HashSet<SessionId>,
    max_members: usize,
    created_at: DateTime<Utc>,
    metadata: HashMap<String, Value>,
}

impl Room {
    fn new(options: RoomOptions) -> Self {
        Self {
            members: HashSet::new(),
            max_members: options.max_members,
            created_at: Utc::now(),
            metadata: options.metadata,
        }
    }

    fn is_full(&self) -> bool {
        self.max_members > 0 && self.members.len() >= self.max_members
    }
}

/// Read-only view of a room.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RoomInfo {
    pub id: RoomId,
    pub members: Vec<SessionId>,
    pub max_members: usize,
    pub created_at: DateTime<Utc>,
    pub metadata: HashMap<String, Value>,
}

/// Callback observing a join or leave.
pub type RoomCallback = Arc<dyn Fn(&RoomId, &Arc<Session>) + Send + Sync>;

pub struct RoomRegistry {
    rooms: Mutex<HashMap<RoomId, Room>>,
    sessions: Arc<SessionRegistry>,
    auto_create: bool,
    auto_delete: bool,
    joined: RwLock<Vec<RoomCallback>>,
    left: RwLock<Vec<RoomCallback>>,
    metrics: Arc<dyn MetricsSink>,
}

impl RoomRegistry {
    pub fn new(
        sessions: Arc<SessionRegistry>,
        auto_create: bool,
        auto_delete: bool,
        metrics: Arc<dyn MetricsSink>,
    ) -> Self {
        Self {
            rooms: Mutex::new(HashMap::new()),
            sessions,
            auto_create,
            auto_delete,
            joined: RwLock::new(Vec::new()),
            left: RwLock::new(Vec::new()),
            metrics,
        }
    }

    /// Create a room explicitly. Returns false if it already exists.
    pub fn create(&self, id: impl Into<RoomId>, options: RoomOptions) -> bool {
        let id = id.into();
        let mut rooms = self.rooms.lock();
        if rooms.contains_key(&id) {
            return false;
        }
        rooms.insert(id, Room::new(options));
        true
    }

    /// Add a session to a room, updating both sides of the membership.
    ///
    /// Auto-creates the room unless disabled. Returns false when the
    /// room is full (capacity reached) or missing with auto-create off;
    /// in both cases neither side is modified.
    pub fn join(&self, id: &RoomId, session: &Arc<Session>) -> bool {
        {
            let mut rooms = self.rooms.lock();
            let room = if self.auto_create {
                rooms
                    .entry(id.clone())
                    .or_insert_with(|| Room::new(RoomOptions::default()))
            } else {
                match rooms.get_mut(id) {
                    Some(room) => room,
                    None => {
                        debug!("join rejected: room {id} does not exist");
                        return false;
                    }
                }
            };
            if room.members.contains(session.id()) {
                return true;
            }
            if room.is_full() {
                debug!("join rejected: room {id} is full");
                return false;
            }
            room.members.insert(session.id().clone());
            session.lock().rooms.insert(id.clone());
        }
        self.metrics.room_joined();
        invoke_all_room(&self.joined.read(), id, session);
        true
    }

    /// Remove a session from a room, updating both sides. Leave
    /// callbacks fire before a now-empty room is auto-deleted.
    pub fn leave(&self, id: &RoomId, session: &Arc<Session>) -> bool {
        let emptied = {
            let mut rooms = self.rooms.lock();
            let Some(room) = rooms.get_mut(id) else {
                return false;
            };
            if !room.members.remove(session.id()) {
                return false;
            }
            session.lock().rooms.remove(id);
            room.members.is_empty()
        };
        self.metrics.room_left();
        invoke_all_room(&self.left.read(), id, session);

        if emptied && self.auto_delete {
            let mut rooms = self.rooms.lock();
            // Only delete if nobody joined while callbacks ran.
            if rooms.get(id).is_some_and(|room| room.members.is_empty()) {
                rooms.remove(id);
                debug!("room {id} auto-deleted");
            }
        }
        true
    }

    /// Remove a session from every room it is in; used on session close.
    pub fn leave_all(&self, session: &Arc<Session>) {
        for id in session.rooms() {
            self.leave(&id, session);
        }
    }

    /// Room-side sweep for a session that is already closed (its own
    /// membership set is cleared by the session registry). No leave
    /// callbacks fire; the session is gone.
    pub fn remove_session(&self, id: &SessionId) {
        let mut rooms = self.rooms.lock();
        let mut emptied = Vec::new();
        for (room_id, room) in rooms.iter_mut() {
            if room.members.remove(id) && room.members.is_empty() {
                emptied.push(room_id.clone());
            }
        }
        if self.auto_delete {
            for room_id in emptied {
                rooms.remove(&room_id);
            }
        }
    }

    /// Deliver a message to every member with an active connection.
    ///
    /// The member set is snapshotted at call time: joins and leaves
    /// racing the broadcast may or may not be reflected, which is
    /// acceptable; delivery never fails the broadcast. Returns the
    /// number of members actually transmitted to.
    pub fn broadcast(
        &self,
        id: &RoomId,
        message: &Message,
        exclude: Option<&SessionId>,
    ) -> usize {
        let members: Vec<SessionId> = {
            let rooms = self.rooms.lock();
            match rooms.get(id) {
                Some(room) => room.members.iter().cloned().collect(),
                None => return 0,
            }
        };

        let mut delivered = 0;
        for member in members {
            if exclude == Some(&member) {
                continue;
            }
            let Some(session) = self.sessions.get(&member) else {
                continue;
            };
            let Some(connection) = session.connection() else {
                continue;
            };
            match connection.send(message) {
                Ok(()) => {
                    delivered += 1;
                    self.metrics.message_sent(&message.event);
                }
                Err(e) => debug!("broadcast to session {member} failed: {e}"),
            }
        }
        delivered
    }

    pub fn contains(&self, id: &RoomId) -> bool {
        self.rooms.lock().contains_key(id)
    }

    pub fn members(&self, id: &RoomId) -> Option<Vec<SessionId>> {
        self.rooms
            .lock()
            .get(id)
            .map(|room| room.members.iter().cloned().collect())
    }

    pub fn info(&self, id: &RoomId) -> Option<RoomInfo> {
        self.rooms.lock().get(id).map(|room| RoomInfo {
            id: id.clone(),
            members: room.members.iter().cloned().collect(),
            max_members: room.max_members,
            created_at: room.created_at,
            metadata: room.metadata.clone(),
        })
    }

    pub fn room_ids(&self) -> Vec<RoomId> {
        self.rooms.lock().keys().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.rooms.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.rooms.lock().is_empty()
    }

    pub fn on_joined(&self, callback: RoomCallback) {
        self.joined.write().push(callback);
    }

    pub fn on_left(&self, callback: RoomCallback) {
        self.left.write().push(callback);
    }
}

fn invoke_all_room(callbacks: &[RoomCallback], id: &RoomId, session: &Arc<Session>) {
    let pair = (id.clone(), session.clone());
    let adapted: Vec<Arc<dyn Fn(&(RoomId, Arc<Session>)) + Send + Sync>> = callbacks
        .iter()
        .map(|callback| {
            let callback = callback.clone();
            Arc::new(move |arg: &(RoomId, Arc<Session>)| callback(&arg.0, &arg.1))
                as Arc<dyn Fn(&(RoomId, Arc<Session>)) + Send + Sync>
        })
        .collect();
    invoke_all("room", &adapted, &pair);
}
