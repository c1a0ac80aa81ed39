//! WebSocket upgrade acceptance: path check, CORS response headers,
//! token capture, message-size limits.

use std::sync::Arc;

use parking_lot::Mutex;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio_tungstenite::tungstenite::handshake::server::{ErrorResponse, Request, Response};
use tokio_tungstenite::tungstenite::http::{HeaderName, HeaderValue, StatusCode};
use tokio_tungstenite::tungstenite::protocol::WebSocketConfig;
use tokio_tungstenite::{accept_hdr_async_with_config, WebSocketStream};
use tracing::debug;

use wshub_core::auth::{default_extract_token, Authenticator};
use wshub_core::config::ServerConfig;
use wshub_core::errors::Error;

/// Accept a WebSocket upgrade on a raw stream.
///
/// The handshake callback rejects requests whose path is not the
/// configured WebSocket path, applies the configured CORS headers to
/// the `101` response, and captures the auth token from the request
/// (query parameter or `Authorization` header, or the authenticator's
/// own extraction). Returns the upgraded stream and the token.
pub(crate) async fn accept_upgrade<S>(
    stream: S,
    config: &ServerConfig,
    authenticator: Option<&Arc<dyn Authenticator>>,
) -> Result<(WebSocketStream<S>, Option<String>), Error>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let mut ws_config = WebSocketConfig::default();
    ws_config.max_message_size = Some(config.max_message_size);
    ws_config.max_frame_size = Some(config.max_message_size);

    let captured_token: Arc<Mutex<Option<String>>> = Arc::new(Mutex::new(None));
    let callback = {
        let captured_token = captured_token.clone();
        let expected_path = config.path.clone();
        let cors_headers = config.cors_headers.clone();
        let authenticator = authenticator.cloned();
        move |request: &Request, mut response: Response| -> Result<Response, ErrorResponse> {
            if request.uri().path() != expected_path {
                debug!(
                    "upgrade rejected: path {} != {expected_path}",
                    request.uri().path()
                );
                let mut rejection = ErrorResponse::new(Some("not found".to_string()));
                *rejection.status_mut() = StatusCode::NOT_FOUND;
                return Err(rejection);
            }

            let uri = request.uri().to_string();
            let authorization = request
                .headers()
                .get("Authorization")
                .and_then(|value| value.to_str().ok());
            let token = match &authenticator {
                Some(authenticator) => authenticator.extract_token(&uri, authorization),
                None => default_extract_token(&uri, authorization),
            };
            *captured_token.lock() = token;

            for (name, value) in &cors_headers {
                if let (Ok(name), Ok(value)) = (
                    name.parse::<HeaderName>(),
                    value.parse::<HeaderValue>(),
                ) {
                    response.headers_mut().insert(name, value);
                }
            }
            Ok(response)
        }
    };

    let ws = accept_hdr_async_with_config(stream, callback, Some(ws_config))
        .await
        .map_err(|e| Error::Internal(format!("websocket upgrade failed: {e}")))?;

    let token = captured_token.lock().take();
    Ok((ws, token))
}
