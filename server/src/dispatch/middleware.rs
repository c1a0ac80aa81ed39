//! Global middlewares run before handler resolution.

use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::Mutex;

use wshub_core::id::SessionId;
use wshub_core::protocol::codes;

use super::Context;

/// Whether dispatch continues past a middleware.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MiddlewareVerdict {
    Continue,
    /// End dispatch silently; the middleware owns any reply.
    Block,
}

type MiddlewareFuture = Pin<Box<dyn Future<Output = MiddlewareVerdict> + Send>>;

/// Boxed async middleware.
pub type Middleware = Arc<dyn Fn(Context) -> MiddlewareFuture + Send + Sync>;

struct Bucket {
    count: u32,
    window_start: Instant,
}

/// Fixed-window rate limiter keyed by session.
///
/// A session exceeding `max_messages` within `window` gets a
/// `sys.error` with code 1010 and the message is dropped before
/// handler resolution.
pub fn rate_limit(max_messages: u32, window: Duration) -> Middleware {
    let buckets: Arc<Mutex<HashMap<SessionId, Bucket>>> = Arc::new(Mutex::new(HashMap::new()));
    Arc::new(move |ctx: Context| {
        let buckets = buckets.clone();
        Box::pin(async move {
            let over_budget = {
                let now = Instant::now();
                let mut buckets = buckets.lock();
                let bucket = buckets
                    .entry(ctx.session.id().clone())
                    .or_insert_with(|| Bucket {
                        count: 0,
                        window_start: now,
                    });
                if now.duration_since(bucket.window_start) >= window {
                    bucket.count = 0;
                    bucket.window_start = now;
                }
                bucket.count += 1;
                bucket.count > max_messages
            };
            if over_budget {
                let _ = ctx.error(
                    codes::RATE_LIMIT_EXCEEDED,
                    "Rate limit exceeded",
                    None,
                );
                MiddlewareVerdict::Block
            } else {
                MiddlewareVerdict::Continue
            }
        })
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::collections::HashMap;
    use wshub_core::config::ServerConfig;
    use wshub_core::id::ConnectionId;
    use wshub_core::metrics::NoopMetrics;
    use wshub_core::protocol::Message;

    use crate::connection::{Connection, SocketCommand};
    use crate::rooms::RoomRegistry;
    use crate::session::SessionRegistry;

    fn context() -> (Context, crate::connection::SocketHandle) {
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
        let message = Message::new("1.0", "chat.send").with_json_payload(json!({}));
        (
            Context::new(session, conn, message, rooms, Arc::new(NoopMetrics)),
            handle,
        )
    }

    #[tokio::test]
    async fn allows_up_to_the_budget() {
        let limiter = rate_limit(3, Duration::from_secs(60));
        let (ctx, _handle) = context();
        for _ in 0..3 {
            assert_eq!(limiter(ctx.clone()).await, MiddlewareVerdict::Continue);
        }
        assert_eq!(limiter(ctx.clone()).await, MiddlewareVerdict::Block);
    }

    #[tokio::test]
    async fn blocked_sender_receives_rate_limit_error() {
        let limiter = rate_limit(1, Duration::from_secs(60));
        let (ctx, mut handle) = context();
        limiter(ctx.clone()).await;
        limiter(ctx.clone()).await;

        // Skip nothing: the only queued frame is the 1010 error.
        match handle.next_command().await.unwrap() {
            SocketCommand::Frame(text) => {
                let value: serde_json::Value = serde_json::from_str(&text).unwrap();
                assert_eq!(value["e"], "sys.error");
                assert_eq!(value["p"]["code"], 1010);
            }
            other => panic!("expected frame, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn window_reset_restores_budget() {
        let limiter = rate_limit(1, Duration::from_millis(30));
        let (ctx, _handle) = context();
        assert_eq!(limiter(ctx.clone()).await, MiddlewareVerdict::Continue);
        assert_eq!(limiter(ctx.clone()).await, MiddlewareVerdict::Block);
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(limiter(ctx.clone()).await, MiddlewareVerdict::Continue);
    }

    #[tokio::test]
    async fn sessions_are_limited_independently() {
        let limiter = rate_limit(1, Duration::from_secs(60));
        let (ctx_a, _ha) = context();
        let (ctx_b, _hb) = context();
        assert_eq!(limiter(ctx_a.clone()).await, MiddlewareVerdict::Continue);
        assert_eq!(limiter(ctx_a).await, MiddlewareVerdict::Block);
        assert_eq!(limiter(ctx_b).await, MiddlewareVerdict::Continue);
    }
}
