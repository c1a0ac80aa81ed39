//! Registry of live connections.

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::{Mutex, RwLock};

use wshub_core::id::ConnectionId;
use wshub_core::metrics::MetricsSink;

use super::Connection;
use crate::callback::invoke_all;

/// Callback fired when a connection is registered or removed.
pub type ConnectionCallback = Arc<dyn Fn(&Arc<Connection>) + Send + Sync>;

/// Tracks every live connection so the server can iterate them and
/// close them on shutdown. Connections register on upgrade and are
/// removed once their socket task finishes.
pub struct ConnectionRegistry {
    connections: Mutex<HashMap<ConnectionId, Arc<Connection>>>,
    opened: RwLock<Vec<ConnectionCallback>>,
    closed: RwLock<Vec<ConnectionCallback>>,
    metrics: Arc<dyn MetricsSink>,
}

impl ConnectionRegistry {
    pub fn new(metrics: Arc<dyn MetricsSink>) -> Self {
        Self {
            connections: Mutex::new(HashMap::new()),
            opened: RwLock::new(Vec::new()),
            closed: RwLock::new(Vec::new()),
            metrics,
        }
    }

    pub fn insert(&self, connection: Arc<Connection>) {
        self.connections
            .lock()
            .insert(connection.id().clone(), connection.clone());
        self.metrics.connection_opened();
        invoke_all("connection-opened", &self.opened.read(), &connection);
    }

    pub fn remove(&self, id: &ConnectionId) -> Option<Arc<Connection>> {
        let connection = self.connections.lock().remove(id)?;
        self.metrics.connection_closed();
        invoke_all("connection-closed", &self.closed.read(), &connection);
        Some(connection)
    }

    pub fn get(&self, id: &ConnectionId) -> Option<Arc<Connection>> {
        self.connections.lock().get(id).cloned()
    }

    pub fn len(&self) -> usize {
        self.connections.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.connections.lock().is_empty()
    }

    pub fn on_opened(&self, callback: ConnectionCallback) {
        self.opened.write().push(callback);
    }

    pub fn on_closed(&self, callback: ConnectionCallback) {
        self.closed.write().push(callback);
    }

    /// Close every connection, e.g. on shutdown with "going away".
    pub fn close_all(&self, code: u16, reason: &str) {
        let connections: Vec<Arc<Connection>> =
            self.connections.lock().values().cloned().collect();
        for connection in connections {
            connection.close(code, reason);
        }
    }
}
