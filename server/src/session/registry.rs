//! Session registry: creation, lookup, the reconnect/suspend/close
//! transitions, and the suspended-session reaper.
//!
//! Every transition runs under the registry lock, then the session's
//! own lock (always in that order), so `reconnect` and `close` are
//! atomic per session id. Nothing awaits inside a critical section;
//! all sends are channel pushes.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use parking_lot::{Mutex, RwLock};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use wshub_core::config::ServerConfig;
use wshub_core::id::{ConnectionId, SessionId};
use wshub_core::metrics::MetricsSink;
use wshub_core::protocol::{codes, events, Message};

use super::{Session, SessionState};
use crate::callback::invoke_all;
use crate::connection::Connection;

/// Callback observing a session after a lifecycle transition.
pub type SessionCallback = Arc<dyn Fn(&Arc<Session>) + Send + Sync>;

#[derive(Default)]
struct SessionCallbacks {
    created: Vec<SessionCallback>,
    suspended: Vec<SessionCallback>,
    reconnected: Vec<SessionCallback>,
    closed: Vec<SessionCallback>,
}

struct RegistryInner {
    sessions: HashMap<SessionId, Arc<Session>>,
    by_user: HashMap<String, Vec<SessionId>>,
}

pub struct SessionRegistry {
    inner: Mutex<RegistryInner>,
    callbacks: RwLock<SessionCallbacks>,
    suspend_timeout: Duration,
    protocol_version: String,
    metrics: Arc<dyn MetricsSink>,
}

impl SessionRegistry {
    pub fn new(config: &ServerConfig, metrics: Arc<dyn MetricsSink>) -> Self {
        Self {
            inner: Mutex::new(RegistryInner {
                sessions: HashMap::new(),
                by_user: HashMap::new(),
            }),
            callbacks: RwLock::new(SessionCallbacks::default()),
            suspend_timeout: config.session_suspend_timeout(),
            protocol_version: config.protocol_version.clone(),
            metrics,
        }
    }

    /// Create and register a session.
    ///
    /// With a connection the session starts active; without one it
    /// starts suspended (reconnectable until the reaper expires it).
    pub fn create(
        &self,
        user_id: Option<String>,
        connection: Option<Arc<Connection>>,
        metadata: HashMap<String, serde_json::Value>,
    ) -> Arc<Session> {
        let id = SessionId::generate();
        let session = Session::new(id.clone(), user_id.clone(), connection, metadata);
        {
            let mut inner = self.inner.lock();
            inner.sessions.insert(id.clone(), session.clone());
            if let Some(user) = user_id {
                inner.by_user.entry(user).or_default().push(id.clone());
            }
        }
        debug!("session {id} created");
        self.metrics.session_created();
        invoke_all("session-created", &self.callbacks.read().created, &session);
        session
    }

    pub fn get(&self, id: &SessionId) -> Option<Arc<Session>> {
        self.inner.lock().sessions.get(id).cloned()
    }

    pub fn by_user(&self, user_id: &str) -> Vec<Arc<Session>> {
        let inner = self.inner.lock();
        inner
            .by_user
            .get(user_id)
            .map(|ids| {
                ids.iter()
                    .filter_map(|id| inner.sessions.get(id).cloned())
                    .collect()
            })
            .unwrap_or_default()
    }

    pub fn count(&self) -> usize {
        self.inner.lock().sessions.len()
    }

    pub fn sessions(&self) -> Vec<Arc<Session>> {
        self.inner.lock().sessions.values().cloned().collect()
    }

    /// Atomically bind `new_connection` to an existing session.
    ///
    /// Returns `None` if the session is absent or closed. On success
    /// the session is active with `new_connection` attached and the
    /// previously attached connection (if any) is returned detached —
    /// the caller owns notifying and closing it. If `new_connection`
    /// was still bound to another session (the handshake placeholder),
    /// that session is closed as part of the same critical section.
    pub fn reconnect(
        &self,
        id: &SessionId,
        new_connection: Arc<Connection>,
    ) -> Option<(Arc<Session>, Option<Arc<Connection>>)> {
        let (session, displaced, abandoned) = {
            let mut inner = self.inner.lock();
            let session = inner.sessions.get(id).cloned()?;

            // The placeholder session the connection got at handshake
            // time is superseded by the restored one.
            let mut abandoned = None;
            if let Some(previous_id) = new_connection.session_id() {
                if previous_id != *id {
                    abandoned = remove_locked(&mut inner, &previous_id);
                    if let Some(previous) = &abandoned {
                        let mut guard = previous.lock();
                        guard.connection = None;
                        guard.state = SessionState::Closed;
                        guard.rooms.clear();
                        guard.suspended_at = None;
                    }
                }
            }

            let displaced = {
                let mut guard = session.lock();
                if guard.state == SessionState::Closed {
                    return None;
                }
                let displaced = guard.connection.take();
                if let Some(old) = &displaced {
                    old.unbind_session();
                }
                guard.connection = Some(new_connection.clone());
                guard.state = SessionState::Active;
                guard.suspended_at = None;
                guard.last_activity = Utc::now();
                displaced
            };
            new_connection.bind_session(id);
            (session, displaced, abandoned)
        };

        if let Some(abandoned) = abandoned {
            debug!("session {} abandoned by reconnecting connection", abandoned.id());
            self.metrics.session_closed();
            invoke_all("session-closed", &self.callbacks.read().closed, &abandoned);
        }

        info!("session {id} reconnected");
        self.metrics.session_reconnected();
        invoke_all(
            "session-reconnected",
            &self.callbacks.read().reconnected,
            &session,
        );
        Some((session, displaced))
    }

    /// Transition an active session to suspended, detaching (but not
    /// closing) its connection. No-op on suspended or closed sessions.
    pub fn suspend(&self, id: &SessionId) -> bool {
        let Some(session) = self.get(id) else {
            return false;
        };
        self.suspend_session(&session, None).is_some()
    }

    /// Suspend only if `connection_id` is still the attached
    /// connection; returns it detached. Used by the socket-done path
    /// and the heartbeat so a displaced connection cannot suspend a
    /// session that has already reconnected elsewhere.
    pub fn suspend_if_attached(
        &self,
        id: &SessionId,
        connection_id: &ConnectionId,
    ) -> Option<Arc<Connection>> {
        let session = self.get(id)?;
        self.suspend_session(&session, Some(connection_id))
    }

    fn suspend_session(
        &self,
        session: &Arc<Session>,
        required_connection: Option<&ConnectionId>,
    ) -> Option<Arc<Connection>> {
        let detached = {
            let mut guard = session.lock();
            if guard.state != SessionState::Active {
                return None;
            }
            if let Some(required) = required_connection {
                match &guard.connection {
                    Some(attached) if attached.id() == required => {}
                    _ => return None,
                }
            }
            let detached = guard.connection.take();
            if let Some(connection) = &detached {
                let notice =
                    Message::new(self.protocol_version.clone(), events::SESSION_SUSPENDED);
                let _ = connection.send(&notice);
                connection.unbind_session();
            }
            guard.state = SessionState::Suspended;
            guard.suspended_at = Some(Utc::now());
            detached
        };

        info!("session {} suspended", session.id());
        self.metrics.session_suspended();
        invoke_all(
            "session-suspended",
            &self.callbacks.read().suspended,
            session,
        );
        // Room membership is intentionally preserved for reconnection.
        detached
    }

    /// Close a session for good: terminal state, attached connection
    /// closed with `code`/`reason`, session-side room membership
    /// cleared, user index updated. Idempotent.
    pub fn close(&self, id: &SessionId, code: u16, reason: &str) -> bool {
        let (session, connection) = {
            let mut inner = self.inner.lock();
            let Some(session) = remove_locked(&mut inner, id) else {
                return false;
            };
            let connection = {
                let mut guard = session.lock();
                if guard.state == SessionState::Closed {
                    return false;
                }
                guard.state = SessionState::Closed;
                guard.rooms.clear();
                guard.suspended_at = None;
                let connection = guard.connection.take();
                if let Some(attached) = &connection {
                    attached.unbind_session();
                }
                connection
            };
            (session, connection)
        };

        if let Some(connection) = connection {
            let mut notice = Message::new(self.protocol_version.clone(), events::SESSION_CLOSED);
            if !reason.is_empty() {
                notice
                    .payload
                    .insert("reason".to_string(), serde_json::Value::from(reason));
            }
            let _ = connection.send(&notice);
            connection.close(code, reason);
        }

        info!("session {id} closed: code={code} reason={reason:?}");
        self.metrics.session_closed();
        invoke_all("session-closed", &self.callbacks.read().closed, &session);
        true
    }

    /// Close every session; used on shutdown.
    pub fn close_all(&self, code: u16, reason: &str) {
        let ids: Vec<SessionId> = self.inner.lock().sessions.keys().cloned().collect();
        for id in ids {
            self.close(&id, code, reason);
        }
    }

    pub fn on_created(&self, callback: SessionCallback) {
        self.callbacks.write().created.push(callback);
    }

    pub fn on_suspended(&self, callback: SessionCallback) {
        self.callbacks.write().suspended.push(callback);
    }

    pub fn on_reconnected(&self, callback: SessionCallback) {
        self.callbacks.write().reconnected.push(callback);
    }

    pub fn on_closed(&self, callback: SessionCallback) {
        self.callbacks.write().closed.push(callback);
    }

    /// One reaper sweep: close every suspended session older than the
    /// suspend timeout. Returns how many were reaped.
    pub fn reap_expired(&self) -> usize {
        let now = Utc::now();
        let expired: Vec<SessionId> = {
            let inner = self.inner.lock();
            inner
                .sessions
                .values()
                .filter(|session| {
                    let guard = session.lock();
                    guard.state == SessionState::Suspended
                        && guard.suspended_at.is_some_and(|since| {
                            now.signed_duration_since(since)
                                .to_std()
                                .unwrap_or_default()
                                >= self.suspend_timeout
                        })
                })
                .map(|session| session.id().clone())
                .collect()
        };
        for id in &expired {
            self.close(id, codes::close::SESSION_EXPIRED, "session expired");
        }
        expired.len()
    }

    /// Spawn the periodic reaper.
    pub fn spawn_reaper(
        self: &Arc<Self>,
        interval: Duration,
        shutdown: CancellationToken,
    ) -> JoinHandle<()> {
        let registry = self.clone();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    _ = shutdown.cancelled() => break,
                    _ = ticker.tick() => {
                        let reaped = registry.reap_expired();
                        if reaped > 0 {
                            info!("reaper closed {reaped} expired session(s)");
                        }
                    }
                }
            }
        })
    }
}

fn remove_locked(inner: &mut RegistryInner, id: &SessionId) -> Option<Arc<Session>> {
    let session = inner.sessions.remove(id)?;
    if let Some(user) = session.lock().user_id.clone() {
        if let Some(ids) = inner.by_user.get_mut(&user) {
            ids.retain(|existing| existing != id);
            if ids.is_empty() {
                inner.by_user.remove(&user);
            }
        }
    }
    Some(session)
}
