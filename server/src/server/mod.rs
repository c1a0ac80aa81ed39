//! The server facade: composition, accept loop, handshake, and the
//! per-connection read pump.

mod handshake;

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpListener;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use wshub_core::auth::{Authenticator, HandshakeInfo};
use wshub_core::config::ServerConfig;
use wshub_core::errors::Error;
use wshub_core::id::{ConnectionId, RoomId};
use wshub_core::metrics::{MetricsSink, NoopMetrics};
use wshub_core::protocol::{codes, events, Codec, Message};
use wshub_core::pubsub::{ChannelMessage, PubSub, CHANNEL_BROADCAST, CHANNEL_ROOM_PATTERN, CHANNEL_ROOM_PREFIX};

use crate::connection::{drive_socket, Connection, ConnectionRegistry, Inbound};
use crate::dispatch::Dispatcher;
use crate::heartbeat::Heartbeat;
use crate::reconnect::Reconnector;
use crate::rooms::RoomRegistry;
use crate::session::SessionRegistry;

/// Fluent construction of a [`Server`].
pub struct ServerBuilder {
    config: ServerConfig,
    authenticator: Option<Arc<dyn Authenticator>>,
    pubsub: Option<Arc<dyn PubSub>>,
    metrics: Option<Arc<dyn MetricsSink>>,
}

impl ServerBuilder {
    pub fn new(config: ServerConfig) -> Self {
        Self {
            config,
            authenticator: None,
            pubsub: None,
            metrics: None,
        }
    }

    pub fn authenticator(mut self, authenticator: Arc<dyn Authenticator>) -> Self {
        self.authenticator = Some(authenticator);
        self
    }

    pub fn pubsub(mut self, pubsub: Arc<dyn PubSub>) -> Self {
        self.pubsub = Some(pubsub);
        self
    }

    pub fn metrics(mut self, metrics: Arc<dyn MetricsSink>) -> Self {
        self.metrics = Some(metrics);
        self
    }

    pub fn build(self) -> Arc<Server> {
        let config = self.config;
        let metrics = self.metrics.unwrap_or_else(|| Arc::new(NoopMetrics));
        let codec = Arc::new(Codec::from_config(&config));
        let connections = Arc::new(ConnectionRegistry::new(metrics.clone()));
        let sessions = Arc::new(SessionRegistry::new(&config, metrics.clone()));
        let rooms = Arc::new(RoomRegistry::new(
            sessions.clone(),
            config.auto_create_rooms,
            config.auto_delete_empty_rooms,
            metrics.clone(),
        ));
        let heartbeat = Arc::new(Heartbeat::new(
            config.heartbeat_interval(),
            config.heartbeat_timeout(),
            config.protocol_version.clone(),
            sessions.clone(),
        ));
        let dispatcher = Arc::new(Dispatcher::new(rooms.clone(), metrics.clone()));
        let reconnector = Arc::new(Reconnector::new(
            sessions.clone(),
            heartbeat.clone(),
            self.authenticator.clone(),
            config.revalidate_token_on_reconnect,
            metrics.clone(),
        ));

        // Closing a session sweeps its room memberships and stops its
        // heartbeat; suspension stops the heartbeat until reconnection.
        {
            let rooms = rooms.clone();
            let heartbeat = heartbeat.clone();
            sessions.on_closed(Arc::new(move |session| {
                rooms.remove_session(session.id());
                heartbeat.unmonitor(session.id());
            }));
        }
        {
            let heartbeat = heartbeat.clone();
            sessions.on_suspended(Arc::new(move |session| {
                heartbeat.unmonitor(session.id());
            }));
        }
        // A missed pong suspends the session and closes the stale
        // socket. The compare-and-suspend keeps a displaced connection
        // from suspending a session that already reconnected.
        {
            let sessions = sessions.clone();
            heartbeat.set_timeout_handler(Arc::new(move |session_id, connection_id| {
                if let Some(stale) = sessions.suspend_if_attached(session_id, connection_id) {
                    stale.close(codes::close::INACTIVITY_TIMEOUT, "inactivity timeout");
                }
            }));
        }

        Arc::new(Server {
            config,
            codec,
            connections,
            sessions,
            rooms,
            heartbeat,
            dispatcher,
            reconnector,
            authenticator: self.authenticator,
            pubsub: self.pubsub,
            metrics,
            shutdown: CancellationToken::new(),
            started: AtomicBool::new(false),
            finalized: AtomicBool::new(false),
            local_addr: Mutex::new(None),
            tasks: Mutex::new(Vec::new()),
        })
    }
}

/// The composed runtime.
///
/// Two ways to feed it connections:
/// - **bound**: [`Server::serve`] opens its own TCP listener;
/// - **detached**: call [`Server::start`] once, then route each
///   pre-accepted stream (your own listener, TLS acceptor, in-memory
///   duplex) into [`Server::handle_stream`].
pub struct Server {
    config: ServerConfig,
    codec: Arc<Codec>,
    connections: Arc<ConnectionRegistry>,
    sessions: Arc<SessionRegistry>,
    rooms: Arc<RoomRegistry>,
    heartbeat: Arc<Heartbeat>,
    dispatcher: Arc<Dispatcher>,
    reconnector: Arc<Reconnector>,
    authenticator: Option<Arc<dyn Authenticator>>,
    pubsub: Option<Arc<dyn PubSub>>,
    metrics: Arc<dyn MetricsSink>,
    shutdown: CancellationToken,
    started: AtomicBool,
    finalized: AtomicBool,
    local_addr: Mutex<Option<SocketAddr>>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl Server {
    pub fn builder(config: ServerConfig) -> ServerBuilder {
        ServerBuilder::new(config)
    }

    /// Build with defaults: no authenticator, no pub/sub, no metrics.
    pub fn new(config: ServerConfig) -> Arc<Self> {
        Self::builder(config).build()
    }

    pub fn config(&self) -> &ServerConfig {
        &self.config
    }

    pub fn dispatcher(&self) -> &Arc<Dispatcher> {
        &self.dispatcher
    }

    pub fn rooms(&self) -> &Arc<RoomRegistry> {
        &self.rooms
    }

    pub fn sessions(&self) -> &Arc<SessionRegistry> {
        &self.sessions
    }

    pub fn connections(&self) -> &Arc<ConnectionRegistry> {
        &self.connections
    }

    pub fn heartbeat(&self) -> &Arc<Heartbeat> {
        &self.heartbeat
    }

    /// The bound address once [`serve`](Self::serve) has bound its
    /// listener; useful with port 0.
    pub fn local_addr(&self) -> Option<SocketAddr> {
        *self.local_addr.lock()
    }

    /// Launch the background tasks (heartbeat, reaper, pub/sub bridge).
    /// Idempotent; [`serve`](Self::serve) calls it automatically.
    pub fn start(&self) {
        if self.started.swap(true, Ordering::AcqRel) {
            return;
        }
        let mut tasks = self.tasks.lock();
        tasks.push(self.heartbeat.run(self.shutdown.clone()));
        tasks.push(
            self.sessions
                .spawn_reaper(self.config.session_cleanup_interval(), self.shutdown.clone()),
        );
        if let Some(pubsub) = &self.pubsub {
            tasks.push(self.spawn_pubsub_bridge(pubsub.clone()));
        }
    }

    /// Bound mode: bind the configured address and accept until
    /// shutdown.
    pub async fn serve(self: &Arc<Self>) -> Result<(), Error> {
        let listener = TcpListener::bind(self.config.bind_addr()).await?;
        let addr = listener.local_addr()?;
        *self.local_addr.lock() = Some(addr);
        self.start();
        info!("listening on {addr}{}", self.config.path);

        loop {
            tokio::select! {
                _ = self.shutdown.cancelled() => break,
                accepted = listener.accept() => match accepted {
                    Ok((stream, peer)) => {
                        let server = self.clone();
                        tokio::spawn(async move {
                            if let Err(e) = server.handle_stream(stream, Some(peer)).await {
                                debug!("connection from {peer} ended: {e}");
                            }
                        });
                    }
                    Err(e) => warn!("accept failed: {e}"),
                },
            }
        }

        self.finalize().await;
        Ok(())
    }

    /// Detached mode: perform the WebSocket upgrade and run the full
    /// connection lifecycle on a pre-routed stream. Returns once the
    /// connection has terminated.
    pub async fn handle_stream<S>(
        &self,
        stream: S,
        remote_addr: Option<SocketAddr>,
    ) -> Result<(), Error>
    where
        S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
    {
        let (ws, token) =
            handshake::accept_upgrade(stream, &self.config, self.authenticator.as_ref()).await?;

        let connection_id = ConnectionId::generate();
        let (connection, handle) = Connection::new(connection_id.clone());
        let (inbound_tx, mut inbound_rx) = mpsc::unbounded_channel();
        self.connections.insert(connection.clone());
        tokio::spawn(drive_socket(
            ws,
            connection.clone(),
            handle,
            self.codec.clone(),
            inbound_tx,
        ));

        let result = self
            .run_connection(connection.clone(), &mut inbound_rx, token, remote_addr)
            .await;
        self.connections.remove(&connection_id);
        result
    }

    /// Handshake steps after the upgrade, then the read pump.
    async fn run_connection(
        &self,
        connection: Arc<Connection>,
        inbound: &mut mpsc::UnboundedReceiver<Inbound>,
        token: Option<String>,
        remote_addr: Option<SocketAddr>,
    ) -> Result<(), Error> {
        if self.config.require_auth && token.is_none() {
            debug!("connection {} rejected: no token", connection.id());
            connection.close(codes::close::AUTH_REQUIRED, "authentication required");
            connection.done().await;
            return Ok(());
        }

        let mut user_id = None;
        let mut metadata = HashMap::new();
        if let (Some(authenticator), Some(token)) = (&self.authenticator, token.as_deref()) {
            let info = HandshakeInfo {
                connection_id: connection.id().clone(),
                remote_addr,
                path: self.config.path.clone(),
            };
            let verdict = tokio::time::timeout(
                self.config.auth_timeout(),
                authenticator.authenticate(&info, Some(token)),
            )
            .await;
            match verdict {
                Ok(Ok(grant)) => {
                    user_id = grant.user_id;
                    metadata = grant.metadata;
                }
                Ok(Err(e)) => {
                    debug!("connection {} failed auth: {e}", connection.id());
                    self.metrics.error(e.code);
                    connection.close(codes::close::AUTH_FAILED, e.message);
                    connection.done().await;
                    return Ok(());
                }
                Err(_) => {
                    debug!("connection {} auth timed out", connection.id());
                    connection.close(codes::close::AUTH_FAILED, "authentication timed out");
                    connection.done().await;
                    return Ok(());
                }
            }
        }

        let mut session =
            self.sessions
                .create(user_id.clone(), Some(connection.clone()), metadata);
        self.heartbeat.monitor(session.id().clone());

        let mut created = Message::new(self.codec.current_version(), events::SESSION_CREATED);
        created.payload.insert(
            "sessionId".to_string(),
            serde_json::Value::from(session.id().as_str()),
        );
        if let Some(user_id) = &user_id {
            created
                .payload
                .insert("userId".to_string(), serde_json::Value::from(user_id.clone()));
        }
        if connection.send(&created).is_ok() {
            self.metrics.message_sent(events::SESSION_CREATED);
        }
        info!(
            "session {} established on connection {}",
            session.id(),
            connection.id()
        );

        // Read pump: inbound order, one dispatch at a time per session.
        loop {
            tokio::select! {
                _ = self.shutdown.cancelled() => break,
                event = inbound.recv() => match event {
                    None => break,
                    Some(Inbound::Message(message)) => match message.event.as_str() {
                        events::PONG => {
                            self.metrics.message_received(events::PONG);
                            session.touch();
                            self.heartbeat.on_pong(session.id());
                        }
                        events::RECONNECT_REQUEST => {
                            self.metrics.message_received(events::RECONNECT_REQUEST);
                            if let Some(restored) =
                                self.reconnector.handle(&connection, &message).await
                            {
                                // The pump now serves the restored
                                // session; the handshake placeholder was
                                // closed by the registry.
                                session = restored;
                            }
                        }
                        _ => {
                            // A displaced connection may still have
                            // queued frames; they no longer speak for
                            // the session.
                            if connection.session_id().as_ref() != Some(session.id()) {
                                debug!(
                                    "dropping {} from displaced connection {}",
                                    message.event,
                                    connection.id()
                                );
                                continue;
                            }
                            let _serialized = session.dispatch_gate().lock().await;
                            self.dispatcher
                                .dispatch(session.clone(), connection.clone(), message)
                                .await;
                        }
                    },
                    Some(Inbound::Invalid(error)) => {
                        debug!("connection {}: {error}", connection.id());
                        self.metrics.error(error.code());
                        let reply = Message::error(
                            self.codec.current_version(),
                            error.code(),
                            error.to_string(),
                            None,
                            None,
                        );
                        let _ = connection.send(&reply);
                    }
                },
            }
        }

        // The socket is gone: suspend (not close) so the client can
        // reconnect, unless a reconnection already moved the session to
        // another connection or the session was closed meanwhile.
        self.sessions
            .suspend_if_attached(session.id(), connection.id());
        Ok(())
    }

    /// Cancel the accept loop, close every connection with "going
    /// away", stop heartbeat and reaper, and close all sessions.
    pub async fn shutdown(&self) {
        self.finalize().await;
    }

    async fn finalize(&self) {
        if self.finalized.swap(true, Ordering::AcqRel) {
            return;
        }
        info!("server shutting down");
        self.shutdown.cancel();
        self.sessions
            .close_all(codes::close::GOING_AWAY, "server shutting down");
        self.connections
            .close_all(codes::close::GOING_AWAY, "server shutting down");
        if let Some(pubsub) = &self.pubsub {
            pubsub.close().await;
        }
        let tasks: Vec<JoinHandle<()>> = std::mem::take(&mut *self.tasks.lock());
        for task in tasks {
            task.abort();
        }
    }

    fn spawn_pubsub_bridge(&self, pubsub: Arc<dyn PubSub>) -> JoinHandle<()> {
        let sessions = self.sessions.clone();
        let rooms = self.rooms.clone();
        let metrics = self.metrics.clone();
        let shutdown = self.shutdown.clone();
        tokio::spawn(async move {
            let mut broadcasts = match pubsub.subscribe(CHANNEL_BROADCAST).await {
                Ok(rx) => rx,
                Err(e) => {
                    warn!("pub/sub subscribe {CHANNEL_BROADCAST} failed: {e}");
                    return;
                }
            };
            let mut room_casts = match pubsub.subscribe(CHANNEL_ROOM_PATTERN).await {
                Ok(rx) => rx,
                Err(e) => {
                    warn!("pub/sub subscribe {CHANNEL_ROOM_PATTERN} failed: {e}");
                    return;
                }
            };

            loop {
                tokio::select! {
                    _ = shutdown.cancelled() => break,
                    item = broadcasts.recv() => match item {
                        None => break,
                        Some(ChannelMessage { message, .. }) => {
                            for session in sessions.sessions() {
                                if let Some(connection) = session.connection() {
                                    if connection.send(&message).is_ok() {
                                        metrics.message_sent(&message.event);
                                    }
                                }
                            }
                        }
                    },
                    item = room_casts.recv() => match item {
                        None => break,
                        Some(ChannelMessage { channel, message }) => {
                            let mut message = message;
                            let room = message
                                .payload
                                .remove("_roomId")
                                .and_then(|v| v.as_str().map(str::to_string))
                                .or_else(|| {
                                    channel
                                        .strip_prefix(CHANNEL_ROOM_PREFIX)
                                        .map(str::to_string)
                                });
                            match room {
                                Some(room) => {
                                    rooms.broadcast(&RoomId::from(room.as_str()), &message, None);
                                }
                                None => debug!("room broadcast on {channel} without _roomId"),
                            }
                        }
                    },
                }
            }
        })
    }
}
