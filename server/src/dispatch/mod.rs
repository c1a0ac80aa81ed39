//! Event dispatch: registrations, middleware chain, auth gate, schema
//! validation, handler invocation and auto-reply.
//!
//! Per session only one dispatch runs at a time (the read pump awaits
//! each one), so handlers see their session's fields single-writer.
//! Everything a handler throws is caught here and converted into a
//! `sys.error` reply; a handler fault never terminates the connection
//! or the session.

mod context;
pub mod middleware;

use std::collections::{HashMap, HashSet};
use std::future::Future;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::pin::Pin;
use std::sync::Arc;

use futures_util::FutureExt;
use parking_lot::RwLock;
use serde_json::{json, Map, Value};
use tracing::{debug, warn};

use wshub_core::errors::Error;
use wshub_core::metrics::MetricsSink;
use wshub_core::protocol::{codes, Message};

use crate::connection::Connection;
use crate::rooms::RoomRegistry;
use crate::session::Session;

pub use context::Context;
pub use middleware::{rate_limit, Middleware, MiddlewareVerdict};

/// What a handler returns.
pub enum Reply {
    /// No automatic reply.
    None,
    /// Send this message verbatim.
    Message(Message),
    /// Wrap as `{event}.response` with the request's correlation id.
    Payload(Map<String, Value>),
}

impl Reply {
    /// Payload reply from a JSON value (non-objects are wrapped under
    /// `"value"`).
    pub fn payload(value: Value) -> Self {
        Self::Payload(wshub_core::protocol::into_payload(value))
    }
}

type HandlerFuture = Pin<Box<dyn Future<Output = Result<Reply, Error>> + Send>>;

/// Boxed async handler.
pub type HandlerFn = Arc<dyn Fn(Context) -> HandlerFuture + Send + Sync>;

/// Handler invoked when a session error escapes a handler; it owns any
/// reply it wants to make.
pub type ErrorHandler = Arc<dyn Fn(&Context, &Error) + Send + Sync>;

/// Predicate over a single payload field.
pub type Predicate = Arc<dyn Fn(&Value) -> bool + Send + Sync>;

/// Ordered field predicates evaluated before a handler runs.
#[derive(Clone, Default)]
pub struct Schema {
    fields: Vec<(String, Predicate)>,
}

impl Schema {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn field<F>(mut self, name: impl Into<String>, predicate: F) -> Self
    where
        F: Fn(&Value) -> bool + Send + Sync + 'static,
    {
        self.fields.push((name.into(), Arc::new(predicate)));
        self
    }

    /// Name of the first failing field, if any. Predicates are
    /// untrusted: a panic counts as a failure of that field.
    pub fn first_failure(&self, payload: &Map<String, Value>) -> Option<String> {
        for (name, predicate) in &self.fields {
            let value = payload.get(name).cloned().unwrap_or(Value::Null);
            let passed = catch_unwind(AssertUnwindSafe(|| predicate(&value))).unwrap_or(false);
            if !passed {
                return Some(name.clone());
            }
        }
        None
    }
}

/// A handler registration for one event name.
#[derive(Clone)]
pub struct EventHandler {
    event: String,
    handler: HandlerFn,
    versions: HashSet<String>,
    requires_auth: bool,
    schema: Option<Schema>,
}

impl EventHandler {
    pub fn new<F, Fut>(event: impl Into<String>, handler: F) -> Self
    where
        F: Fn(Context) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<Reply, Error>> + Send + 'static,
    {
        Self {
            event: event.into(),
            handler: Arc::new(move |ctx| Box::pin(handler(ctx))),
            versions: HashSet::new(),
            requires_auth: false,
            schema: None,
        }
    }

    /// Restrict to specific protocol versions. An empty set (the
    /// default) accepts any version.
    pub fn versions<I, S>(mut self, versions: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.versions = versions.into_iter().map(Into::into).collect();
        self
    }

    /// Only dispatch for authenticated sessions.
    pub fn requires_auth(mut self) -> Self {
        self.requires_auth = true;
        self
    }

    pub fn schema(mut self, schema: Schema) -> Self {
        self.schema = Some(schema);
        self
    }
}

pub struct Dispatcher {
    handlers: RwLock<HashMap<String, Vec<EventHandler>>>,
    middlewares: RwLock<Vec<Middleware>>,
    not_found: RwLock<Option<HandlerFn>>,
    error_handler: RwLock<Option<ErrorHandler>>,
    rooms: Arc<RoomRegistry>,
    metrics: Arc<dyn MetricsSink>,
}

impl Dispatcher {
    pub fn new(rooms: Arc<RoomRegistry>, metrics: Arc<dyn MetricsSink>) -> Self {
        Self {
            handlers: RwLock::new(HashMap::new()),
            middlewares: RwLock::new(Vec::new()),
            not_found: RwLock::new(None),
            error_handler: RwLock::new(None),
            rooms,
            metrics,
        }
    }

    /// Register a plain handler for an event.
    pub fn on<F, Fut>(&self, event: impl Into<String>, handler: F)
    where
        F: Fn(Context) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<Reply, Error>> + Send + 'static,
    {
        self.register(EventHandler::new(event, handler));
    }

    /// Register a configured [`EventHandler`].
    pub fn register(&self, handler: EventHandler) {
        self.handlers
            .write()
            .entry(handler.event.clone())
            .or_default()
            .push(handler);
    }

    pub fn add_middleware(&self, middleware: Middleware) {
        self.middlewares.write().push(middleware);
    }

    pub fn set_not_found_handler<F, Fut>(&self, handler: F)
    where
        F: Fn(Context) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<Reply, Error>> + Send + 'static,
    {
        *self.not_found.write() = Some(Arc::new(move |ctx| Box::pin(handler(ctx))));
    }

    pub fn set_error_handler(&self, handler: ErrorHandler) {
        *self.error_handler.write() = Some(handler);
    }

    /// Run one inbound message through the full chain.
    pub async fn dispatch(
        &self,
        session: Arc<Session>,
        connection: Arc<Connection>,
        message: Message,
    ) {
        self.metrics.message_received(&message.event);
        session.touch();
        let ctx = Context::new(
            session,
            connection,
            message,
            self.rooms.clone(),
            self.metrics.clone(),
        );

        // 1. Global middlewares; a blocking middleware owns any reply.
        let middlewares: Vec<Middleware> = self.middlewares.read().clone();
        for middleware in middlewares {
            if matches!(middleware(ctx.clone()).await, MiddlewareVerdict::Block) {
                debug!("dispatch of {} blocked by middleware", ctx.event());
                return;
            }
        }

        // 2. Resolve the handler by event name and protocol version. A
        // registration naming the message's version wins over a
        // version-agnostic one regardless of registration order; the
        // first version-agnostic registration is the fallback.
        let registration = {
            let handlers = self.handlers.read();
            handlers.get(ctx.event()).and_then(|candidates| {
                candidates
                    .iter()
                    .find(|handler| handler.versions.contains(&ctx.message.version))
                    .or_else(|| candidates.iter().find(|handler| handler.versions.is_empty()))
                    .cloned()
            })
        };
        let Some(registration) = registration else {
            let not_found = self.not_found.read().clone();
            match not_found {
                Some(handler) => self.invoke(&ctx, &handler).await,
                None => self.send_error(&ctx, &Error::HandlerNotFound(ctx.event().to_string())),
            }
            return;
        };

        // 3. Auth gate.
        if registration.requires_auth && ctx.session.user_id().is_none() {
            self.send_error(&ctx, &Error::AuthRequired);
            return;
        }

        // 4. Schema validation.
        if let Some(schema) = &registration.schema {
            if let Some(field) = schema.first_failure(ctx.payload()) {
                self.send_error(&ctx, &Error::validation(field));
                return;
            }
        }

        // 5. Invoke and auto-reply.
        self.invoke(&ctx, &registration.handler).await;
    }

    async fn invoke(&self, ctx: &Context, handler: &HandlerFn) {
        let outcome = AssertUnwindSafe(handler(ctx.clone())).catch_unwind().await;
        match outcome {
            Ok(Ok(reply)) => self.deliver_reply(ctx, reply),
            Ok(Err(error)) => self.handle_error(ctx, error),
            Err(_) => {
                warn!("handler for {} panicked", ctx.event());
                self.handle_error(ctx, Error::Internal("handler panicked".to_string()));
            }
        }
    }

    fn deliver_reply(&self, ctx: &Context, reply: Reply) {
        let message = match reply {
            Reply::None => return,
            Reply::Message(message) => message,
            Reply::Payload(payload) => Message::response_to(&ctx.message, payload),
        };
        if let Err(e) = ctx.send(message) {
            debug!("reply to {} not delivered: {e}", ctx.event());
        }
    }

    fn handle_error(&self, ctx: &Context, error: Error) {
        if matches!(error, Error::Validation { .. }) {
            self.send_error(ctx, &error);
            return;
        }
        let handler = self.error_handler.read().clone();
        match handler {
            Some(handler) => {
                if catch_unwind(AssertUnwindSafe(|| handler(ctx, &error))).is_err() {
                    warn!("error handler panicked for {}", ctx.event());
                }
            }
            None => self.send_error(ctx, &error),
        }
    }

    /// Reply `sys.error` with the taxonomy code, echoing the request's
    /// correlation id. Internal faults stay opaque.
    fn send_error(&self, ctx: &Context, error: &Error) {
        let (code, message) = match error {
            Error::Internal(_) | Error::Io(_) | Error::ConnectionClosed => {
                (codes::INTERNAL_ERROR, "Internal error".to_string())
            }
            other => (other.code(), other.to_string()),
        };
        let details = match error {
            Error::Validation { field } => Some(json!({ "field": field })),
            _ => None,
        };
        self.metrics.error(code);
        let reply = Message::error(
            ctx.message.version.clone(),
            code,
            message,
            details,
            ctx.message.correlation_id.clone(),
        );
        if ctx.connection.send(&reply).is_err() {
            debug!("error reply for {} not delivered", ctx.event());
        } else {
            self.metrics.message_sent(&reply.event);
        }
    }
}
