//! WebSocket session runtime.
//!
//! Accepts WebSocket upgrades, keeps logical *sessions* alive across
//! socket drops, routes typed events to registered handlers, and fans
//! messages out through rooms. See [`Server`] for the entry point.

mod callback;

pub mod connection;
pub mod dispatch;
pub mod heartbeat;
pub mod reconnect;
pub mod rooms;
pub mod server;
pub mod session;

pub use connection::{Connection, ConnectionRegistry};
pub use dispatch::{Context, Dispatcher, EventHandler, Middleware, MiddlewareVerdict, Reply, Schema};
pub use heartbeat::{Heartbeat, HeartbeatStatus};
pub use rooms::{RoomOptions, RoomRegistry};
pub use server::{Server, ServerBuilder};
pub use session::{Session, SessionRegistry, SessionState};

pub use wshub_core as core;
pub use wshub_core::{Error, Message, ProtocolError, ServerConfig};
