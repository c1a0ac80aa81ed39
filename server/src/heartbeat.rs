//! Liveness detection via application-level ping/pong events.
//!
//! Every `interval` the monitor sends `sys.ping {t}` to each monitored
//! session with an attached connection and arms a per-session pong
//! timer. A `sys.pong` before the timer cancels it; a timer firing (or
//! a failed ping send, treated identically) invokes the timeout handler
//! with the session and the connection observed at ping time. The
//! server wires that handler to suspend-if-attached plus closing the
//! stale socket with the inactivity close code.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use parking_lot::{Mutex, RwLock};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use wshub_core::id::{ConnectionId, SessionId};
use wshub_core::protocol::{events, Message};

use crate::session::SessionRegistry;

/// Handler invoked when a monitored session misses its pong deadline.
pub type TimeoutHandler = Arc<dyn Fn(&SessionId, &ConnectionId) + Send + Sync>;

/// Liveness bookkeeping for one monitored session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HeartbeatStatus {
    pub last_ping_at: Option<DateTime<Utc>>,
    pub last_pong_at: Option<DateTime<Utc>>,
    /// Pong deadlines missed since the last pong.
    pub missed_pongs: u32,
    /// Whether a pong timer is currently armed.
    pub awaiting_pong: bool,
}

struct Entry {
    last_ping_at: Option<DateTime<Utc>>,
    last_pong_at: Option<DateTime<Utc>>,
    missed_pongs: u32,
    timer: Option<JoinHandle<()>>,
}

impl Entry {
    fn new() -> Self {
        Self {
            last_ping_at: None,
            last_pong_at: None,
            missed_pongs: 0,
            timer: None,
        }
    }
}

pub struct Heartbeat {
    interval: Duration,
    timeout: Duration,
    protocol_version: String,
    sessions: Arc<SessionRegistry>,
    entries: Mutex<HashMap<SessionId, Entry>>,
    on_timeout: RwLock<Option<TimeoutHandler>>,
}

impl Heartbeat {
    pub fn new(
        interval: Duration,
        timeout: Duration,
        protocol_version: impl Into<String>,
        sessions: Arc<SessionRegistry>,
    ) -> Self {
        Self {
            interval,
            timeout,
            protocol_version: protocol_version.into(),
            sessions,
            entries: Mutex::new(HashMap::new()),
            on_timeout: RwLock::new(None),
        }
    }

    pub fn set_timeout_handler(&self, handler: TimeoutHandler) {
        *self.on_timeout.write() = Some(handler);
    }

    /// Start monitoring a session. Idempotent.
    pub fn monitor(&self, id: SessionId) {
        self.entries.lock().entry(id).or_insert_with(Entry::new);
    }

    /// Stop monitoring; cancels any pending pong timer.
    pub fn unmonitor(&self, id: &SessionId) {
        if let Some(entry) = self.entries.lock().remove(id) {
            if let Some(timer) = entry.timer {
                timer.abort();
            }
        }
    }

    pub fn is_monitored(&self, id: &SessionId) -> bool {
        self.entries.lock().contains_key(id)
    }

    pub fn monitored_count(&self) -> usize {
        self.entries.lock().len()
    }

    /// Current liveness bookkeeping for a monitored session.
    pub fn status(&self, id: &SessionId) -> Option<HeartbeatStatus> {
        self.entries.lock().get(id).map(|entry| HeartbeatStatus {
            last_ping_at: entry.last_ping_at,
            last_pong_at: entry.last_pong_at,
            missed_pongs: entry.missed_pongs,
            awaiting_pong: entry.timer.is_some(),
        })
    }

    /// Record a pong. Cancels the pending timer and resets the missed
    /// counter; a pong arriving after its timer already fired has no
    /// effect beyond bookkeeping.
    pub fn on_pong(&self, id: &SessionId) {
        let mut entries = self.entries.lock();
        if let Some(entry) = entries.get_mut(id) {
            if let Some(timer) = entry.timer.take() {
                timer.abort();
            }
            entry.missed_pongs = 0;
            entry.last_pong_at = Some(Utc::now());
        }
    }

    /// One sweep: ping every monitored session that has an attached
    /// connection and arm its pong timer.
    pub fn tick(self: &Arc<Self>) {
        let ids: Vec<SessionId> = self.entries.lock().keys().cloned().collect();
        for id in ids {
            let Some(session) = self.sessions.get(&id) else {
                // Session is gone; drop the entry.
                self.unmonitor(&id);
                continue;
            };
            let Some(connection) = session.connection() else {
                // Suspended sessions are not probed.
                continue;
            };

            let mut ping = Message::new(self.protocol_version.clone(), events::PING);
            ping.payload
                .insert("t".to_string(), serde_json::Value::from(ping.timestamp));

            let connection_id = connection.id().clone();
            if connection.send(&ping).is_err() {
                // A dead socket counts as a missed pong.
                debug!("heartbeat ping to session {id} failed; treating as timeout");
                self.expire(&id, &connection_id);
                continue;
            }

            let mut entries = self.entries.lock();
            let Some(entry) = entries.get_mut(&id) else {
                continue;
            };
            entry.last_ping_at = Some(Utc::now());
            if let Some(previous) = entry.timer.take() {
                previous.abort();
            }
            let monitor = self.clone();
            let session_id = id.clone();
            let timeout = self.timeout;
            entry.timer = Some(tokio::spawn(async move {
                tokio::time::sleep(timeout).await;
                monitor.expire(&session_id, &connection_id);
            }));
        }
    }

    /// Pong deadline missed for `id` while `connection_id` was attached.
    fn expire(&self, id: &SessionId, connection_id: &ConnectionId) {
        {
            let mut entries = self.entries.lock();
            let Some(entry) = entries.get_mut(id) else {
                return;
            };
            entry.missed_pongs += 1;
            entry.timer = None;
        }
        debug!("heartbeat timeout for session {id}");
        let handler = self.on_timeout.read().clone();
        if let Some(handler) = handler {
            handler(id, connection_id);
        }
    }

    /// Spawn the periodic ping loop.
    pub fn run(self: &Arc<Self>, shutdown: CancellationToken) -> JoinHandle<()> {
        let monitor = self.clone();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(monitor.interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    _ = shutdown.cancelled() => break,
                    _ = ticker.tick() => monitor.tick(),
                }
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use wshub_core::config::ServerConfig;
    use wshub_core::id::ConnectionId;
    use wshub_core::metrics::NoopMetrics;
    use wshub_core::protocol::codes::close;

    use crate::connection::{Connection, SocketCommand};

    fn fixture(timeout: Duration) -> (Arc<SessionRegistry>, Arc<Heartbeat>) {
        let sessions = Arc::new(SessionRegistry::new(
            &ServerConfig::default(),
            Arc::new(NoopMetrics),
        ));
        let heartbeat = Arc::new(Heartbeat::new(
            Duration::from_secs(30),
            timeout,
            "1.0",
            sessions.clone(),
        ));
        (sessions, heartbeat)
    }

    #[tokio::test]
    async fn tick_sends_ping_with_timestamp() {
        let (sessions, heartbeat) = fixture(Duration::from_secs(5));
        let (conn, mut handle) = Connection::new(ConnectionId::generate());
        let session = sessions.create(None, Some(conn), HashMap::new());
        heartbeat.monitor(session.id().clone());

        heartbeat.tick();
        match handle.next_command().await.unwrap() {
            SocketCommand::Frame(text) => {
                let value: serde_json::Value = serde_json::from_str(&text).unwrap();
                assert_eq!(value["e"], "sys.ping");
                assert!(value["p"]["t"].is_i64());
            }
            other => panic!("expected ping frame, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn pong_cancels_the_timer() {
        let (sessions, heartbeat) = fixture(Duration::from_millis(50));
        let (conn, _handle) = Connection::new(ConnectionId::generate());
        let session = sessions.create(None, Some(conn), HashMap::new());
        heartbeat.monitor(session.id().clone());

        let fired = Arc::new(AtomicUsize::new(0));
        {
            let fired = fired.clone();
            heartbeat.set_timeout_handler(Arc::new(move |_, _| {
                fired.fetch_add(1, Ordering::SeqCst);
            }));
        }

        heartbeat.tick();
        let status = heartbeat.status(session.id()).unwrap();
        assert!(status.awaiting_pong);
        assert!(status.last_ping_at.is_some());

        heartbeat.on_pong(session.id());
        let status = heartbeat.status(session.id()).unwrap();
        assert!(!status.awaiting_pong);
        assert!(status.last_pong_at.is_some());
        assert_eq!(status.missed_pongs, 0);

        tokio::time::sleep(Duration::from_millis(120)).await;
        assert_eq!(fired.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn missed_pong_invokes_timeout_handler() {
        let (sessions, heartbeat) = fixture(Duration::from_millis(30));
        let (conn, _handle) = Connection::new(ConnectionId::generate());
        let session = sessions.create(None, Some(conn.clone()), HashMap::new());
        heartbeat.monitor(session.id().clone());

        let observed = Arc::new(parking_lot::Mutex::new(None));
        {
            let observed = observed.clone();
            heartbeat.set_timeout_handler(Arc::new(move |sid, cid| {
                *observed.lock() = Some((sid.clone(), cid.clone()));
            }));
        }

        heartbeat.tick();
        tokio::time::sleep(Duration::from_millis(120)).await;
        let (sid, cid) = observed.lock().clone().unwrap();
        assert_eq!(&sid, session.id());
        assert_eq!(&cid, conn.id());
    }

    #[tokio::test]
    async fn failed_ping_send_counts_as_timeout() {
        let (sessions, heartbeat) = fixture(Duration::from_secs(5));
        let (conn, _handle) = Connection::new(ConnectionId::generate());
        let session = sessions.create(None, Some(conn.clone()), HashMap::new());
        heartbeat.monitor(session.id().clone());

        // Dead socket: send fails immediately, no timer wait.
        conn.close(close::NORMAL, "gone");

        let fired = Arc::new(AtomicUsize::new(0));
        {
            let fired = fired.clone();
            heartbeat.set_timeout_handler(Arc::new(move |_, _| {
                fired.fetch_add(1, Ordering::SeqCst);
            }));
        }
        heartbeat.tick();
        assert_eq!(fired.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn unmonitored_sessions_are_not_probed() {
        let (sessions, heartbeat) = fixture(Duration::from_millis(30));
        let (conn, _handle) = Connection::new(ConnectionId::generate());
        let session = sessions.create(None, Some(conn), HashMap::new());
        heartbeat.monitor(session.id().clone());
        assert!(heartbeat.is_monitored(session.id()));

        heartbeat.unmonitor(session.id());
        assert!(!heartbeat.is_monitored(session.id()));

        let fired = Arc::new(AtomicUsize::new(0));
        {
            let fired = fired.clone();
            heartbeat.set_timeout_handler(Arc::new(move |_, _| {
                fired.fetch_add(1, Ordering::SeqCst);
            }));
        }
        heartbeat.tick();
        tokio::time::sleep(Duration::from_millis(80)).await;
        assert_eq!(fired.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn suspended_sessions_are_skipped() {
        let (sessions, heartbeat) = fixture(Duration::from_millis(30));
        let (conn, _handle) = Connection::new(ConnectionId::generate());
        let session = sessions.create(None, Some(conn), HashMap::new());
        heartbeat.monitor(session.id().clone());
        sessions.suspend(session.id());

        let fired = Arc::new(AtomicUsize::new(0));
        {
            let fired = fired.clone();
            heartbeat.set_timeout_handler(Arc::new(move |_, _| {
                fired.fetch_add(1, Ordering::SeqCst);
            }));
        }
        heartbeat.tick();
        tokio::time::sleep(Duration::from_millis(80)).await;
        // Still monitored but not probed while detached.
        assert!(heartbeat.is_monitored(session.id()));
        assert_eq!(fired.load(Ordering::SeqCst), 0);
    }
}
