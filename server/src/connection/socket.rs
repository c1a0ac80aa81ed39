//! The task that owns a WebSocket and bridges it to a [`Connection`].

use std::sync::Arc;

use futures_util::{SinkExt, StreamExt};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::protocol::CloseFrame;
use tokio_tungstenite::tungstenite::{Error as WsError, Message as WsMessage};
use tokio_tungstenite::WebSocketStream;
use tracing::debug;

use wshub_core::protocol::codes::close;
use wshub_core::protocol::Codec;
use wshub_core::{Message, ProtocolError};

use super::{CloseInfo, Connection, SocketCommand, SocketHandle};

/// A decoded inbound event, or a frame the codec rejected.
///
/// Invalid frames are surfaced here (the connection's error stream) and
/// never reach the handler path; a single bad frame does not terminate
/// the connection.
#[derive(Debug)]
pub enum Inbound {
    Message(Message),
    Invalid(ProtocolError),
}

/// Drive `ws` until either side closes.
///
/// Frames arriving from the peer are parsed through `codec` and pushed
/// onto `inbound`; commands enqueued on the connection are written out.
/// On exit the connection's done-signal resolves with the close info
/// and `inbound` is dropped, which ends the read pump.
pub async fn drive_socket<S>(
    ws: WebSocketStream<S>,
    connection: Arc<Connection>,
    mut handle: SocketHandle,
    codec: Arc<Codec>,
    inbound: mpsc::UnboundedSender<Inbound>,
) where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let conn_id = connection.id().clone();
    let (mut sink, mut stream) = ws.split();

    let info = loop {
        tokio::select! {
            command = handle.next_command() => match command {
                Some(SocketCommand::Frame(text)) => {
                    if let Err(e) = sink.send(WsMessage::Text(text)).await {
                        debug!("connection {conn_id}: write failed: {e}");
                        break CloseInfo::abnormal();
                    }
                }
                Some(SocketCommand::Close(info)) => {
                    let frame = CloseFrame {
                        code: info.code.into(),
                        reason: info.reason.clone().into(),
                    };
                    let _ = sink.send(WsMessage::Close(Some(frame))).await;
                    break info;
                }
                // Connection dropped entirely.
                None => break CloseInfo::new(close::NORMAL, ""),
            },

            frame = stream.next() => match frame {
                Some(Ok(WsMessage::Text(text))) => {
                    let event = match codec.parse(&text) {
                        Ok(message) => Inbound::Message(message),
                        Err(e) => Inbound::Invalid(e),
                    };
                    if inbound.send(event).is_err() {
                        break CloseInfo::new(close::GOING_AWAY, "reader gone");
                    }
                }
                Some(Ok(WsMessage::Binary(_))) => {
                    let _ = inbound.send(Inbound::Invalid(ProtocolError::BinaryFrame));
                }
                Some(Ok(WsMessage::Ping(data))) => {
                    let _ = sink.send(WsMessage::Pong(data)).await;
                }
                Some(Ok(WsMessage::Pong(_))) => {}
                Some(Ok(WsMessage::Close(frame))) => {
                    break frame
                        .map(|f| CloseInfo::new(f.code.into(), f.reason.to_string()))
                        .unwrap_or_else(|| CloseInfo::new(close::NORMAL, ""));
                }
                Some(Ok(WsMessage::Frame(_))) => {}
                Some(Err(WsError::Capacity(e))) => {
                    debug!("connection {conn_id}: oversized message: {e}");
                    break CloseInfo::new(close::MESSAGE_TOO_LARGE, "message too large");
                }
                Some(Err(e)) => {
                    debug!("connection {conn_id}: socket error: {e}");
                    break CloseInfo::abnormal();
                }
                None => break CloseInfo::abnormal(),
            },
        }
    };

    // Flush any pending close frame; errors here are expected when the
    // peer is already gone.
    let _ = sink.close().await;

    debug!(
        "connection {conn_id} terminated: code={} reason={:?}",
        info.code, info.reason
    );
    handle.complete(info);
}
