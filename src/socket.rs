//! Authenticated socket creation.
//!
//! [`create_authenticated_socket`] dials the Home Assistant WebSocket
//! endpoint, runs the `auth` handshake and hands back a socket that is ready
//! for commands.  Transient failures are retried according to
//! [`ConnectionOptions::setup_retry`]; rejected credentials never are.

use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use reqwest::Url;
use tokio::net::TcpStream;
use tokio::time::Instant as TokioInstant;
use tokio_tungstenite::{
    connect_async,
    tungstenite::{client::IntoClientRequest, protocol::Message},
};

use crate::{
    auth::AuthProvider,
    error::{HassLinkError, Result},
    models::{AuthMessage, ConnectionOptions, ServerMessage},
    timeouts::HassLinkTimeouts,
};

/// Client WebSocket over plain TCP or TLS.
pub type WebSocketStream =
    tokio_tungstenite::WebSocketStream<tokio_tungstenite::MaybeTlsStream<TcpStream>>;

/// Path of the WebSocket API below the Home Assistant base URL.
pub const WEBSOCKET_PATH: &str = "/api/websocket";

/// A socket that completed the `auth` handshake.
pub struct AuthenticatedSocket {
    pub(crate) stream: WebSocketStream,
    /// Server version reported during the handshake
    pub ha_version: Option<String>,
}

impl AuthenticatedSocket {
    /// Take the raw authenticated stream.
    pub fn into_stream(self) -> WebSocketStream {
        self.stream
    }
}

impl std::fmt::Debug for AuthenticatedSocket {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AuthenticatedSocket")
            .field("ha_version", &self.ha_version)
            .finish()
    }
}

/// Resolve the WebSocket endpoint for `options`.
///
/// `http(s)://host` maps to `ws(s)://host/api/websocket`.  A `ws(s)://` URL
/// with a path is used as given.  An explicit `ws_url` override wins, but a
/// plain `ws://` override under an `https://` base is refused.
pub fn resolve_ws_url(options: &ConnectionOptions) -> Result<String> {
    let raw = options.url.trim();
    if raw.is_empty() {
        return Err(HassLinkError::HostRequired);
    }

    let base = Url::parse(raw).map_err(|e| {
        HassLinkError::ConfigurationError(format!("Invalid Home Assistant URL '{}': {}", raw, e))
    })?;
    if base.host_str().map_or(true, str::is_empty) {
        return Err(HassLinkError::HostRequired);
    }

    if let Some(override_url) = options.ws_url.as_deref() {
        let parsed = Url::parse(override_url.trim()).map_err(|e| {
            HassLinkError::ConfigurationError(format!(
                "Invalid WebSocket URL '{}': {}",
                override_url, e
            ))
        })?;
        match parsed.scheme() {
            "ws" | "wss" => {},
            other => {
                return Err(HassLinkError::ConfigurationError(format!(
                    "WebSocket URL must use ws:// or wss:// (found '{}')",
                    other
                )));
            },
        }
        if base.scheme() == "https" && parsed.scheme() == "ws" {
            return Err(HassLinkError::InsecureDowngrade);
        }
        return Ok(parsed.to_string());
    }

    let mut ws_url = base.clone();
    let ws_scheme = match base.scheme() {
        "http" | "ws" => "ws",
        "https" | "wss" => "wss",
        other => {
            return Err(HassLinkError::ConfigurationError(format!(
                "Unsupported URL scheme '{}'; expected http(s) or ws(s)",
                other
            )));
        },
    };
    ws_url.set_scheme(ws_scheme).map_err(|_| {
        HassLinkError::ConfigurationError("Failed to set WebSocket URL scheme".to_string())
    })?;
    ws_url.set_fragment(None);

    let keep_path = matches!(base.scheme(), "ws" | "wss") && base.path() != "/";
    if !keep_path {
        ws_url.set_path(WEBSOCKET_PATH);
        ws_url.set_query(None);
    }

    Ok(ws_url.to_string())
}

/// Dial and authenticate, retrying transient failures.
///
/// `options.setup_retry` is the retry budget: `0` means a single attempt,
/// `-1` retries forever, `n` allows `n` retries spaced by
/// `options.setup_retry_delay()`.  Fatal errors end the loop immediately:
/// `auth_invalid` or a failed token refresh yields
/// [`HassLinkError::InvalidAuth`].  An exhausted budget yields
/// [`HassLinkError::CannotConnect`].
pub async fn create_authenticated_socket(
    options: &ConnectionOptions,
    auth: &dyn AuthProvider,
    timeouts: &HassLinkTimeouts,
) -> Result<AuthenticatedSocket> {
    let url = resolve_ws_url(options)?;
    let mut tries_left = options.setup_retry;

    loop {
        match connect_once(&url, auth, timeouts).await {
            Ok(socket) => return Ok(socket),
            Err(e) if e.is_fatal() => {
                log::warn!("[hass-link] Not retrying: {}", e);
                return Err(e);
            },
            Err(e) => {
                if tries_left == 0 {
                    log::warn!("[hass-link] Giving up connecting to {}: {}", url, e);
                    return Err(HassLinkError::CannotConnect(e.to_string()));
                }
                if tries_left > 0 {
                    tries_left -= 1;
                }
                log::info!(
                    "[hass-link] Connection attempt failed ({}); retrying in {:?}",
                    e,
                    options.setup_retry_delay()
                );
                tokio::time::sleep(options.setup_retry_delay()).await;
            },
        }
    }
}

async fn connect_once(
    url: &str,
    auth: &dyn AuthProvider,
    timeouts: &HassLinkTimeouts,
) -> Result<AuthenticatedSocket> {
    log::debug!("[hass-link] Connecting to {}", url);
    let mut stream = establish_ws(url, timeouts.connection_timeout).await?;

    if auth.expired() {
        log::debug!("[hass-link] Access token expired, refreshing before auth");
        if let Err(e) = auth.refresh_access_token().await {
            let _ = stream.close(None).await;
            return Err(match e {
                HassLinkError::InvalidAuth(msg) => HassLinkError::InvalidAuth(msg),
                other => HassLinkError::InvalidAuth(format!("Token refresh failed: {}", other)),
            });
        }
    }

    let ha_version = send_auth_and_wait(&mut stream, auth, timeouts.auth_timeout).await?;
    log::info!(
        "[hass-link] Authenticated (Home Assistant {})",
        ha_version.as_deref().unwrap_or("unknown")
    );
    Ok(AuthenticatedSocket { stream, ha_version })
}

async fn establish_ws(url: &str, connection_timeout: Duration) -> Result<WebSocketStream> {
    let request = url.into_client_request().map_err(|e| {
        HassLinkError::WebSocketError(format!("Failed to build WebSocket request: {}", e))
    })?;

    let connect_result = if HassLinkTimeouts::is_no_timeout(connection_timeout) {
        Ok(connect_async(request).await)
    } else {
        tokio::time::timeout(connection_timeout, connect_async(request)).await
    };

    match connect_result {
        Ok(Ok((stream, _response))) => Ok(stream),
        Ok(Err(tokio_tungstenite::tungstenite::error::Error::Http(response))) => {
            Err(HassLinkError::WebSocketError(format!(
                "WebSocket upgrade refused: HTTP {}",
                response.status().as_u16()
            )))
        },
        Ok(Err(e)) => Err(HassLinkError::WebSocketError(format!("Connection failed: {}", e))),
        Err(_) => Err(HassLinkError::TimeoutError(format!(
            "Connection timeout ({:?})",
            connection_timeout
        ))),
    }
}

/// Send `auth` and wait for `auth_ok` / `auth_invalid`.
///
/// Returns the server version from `auth_ok`, falling back to the one
/// announced in `auth_required`.
async fn send_auth_and_wait(
    stream: &mut WebSocketStream,
    auth: &dyn AuthProvider,
    auth_timeout: Duration,
) -> Result<Option<String>> {
    let payload = serde_json::to_string(&AuthMessage::auth(auth.access_token()))?;
    stream.send(Message::Text(payload.into())).await.map_err(|e| {
        HassLinkError::WebSocketError(format!("Failed to send auth message: {}", e))
    })?;

    let mut announced_version: Option<String> = None;
    let deadline = TokioInstant::now() + auth_timeout;
    loop {
        let remaining = deadline.saturating_duration_since(TokioInstant::now());
        if remaining.is_zero() {
            return Err(HassLinkError::TimeoutError(format!(
                "Authentication timeout ({:?})",
                auth_timeout
            )));
        }

        match tokio::time::timeout(remaining, stream.next()).await {
            Ok(Some(Ok(Message::Text(text)))) => match serde_json::from_str::<ServerMessage>(&text) {
                Ok(ServerMessage::AuthOk { ha_version }) => {
                    return Ok(ha_version.or(announced_version));
                },
                Ok(ServerMessage::AuthInvalid { message }) => {
                    let _ = stream.close(None).await;
                    return Err(HassLinkError::InvalidAuth(
                        message.unwrap_or_else(|| "auth_invalid".to_string()),
                    ));
                },
                Ok(ServerMessage::AuthRequired { ha_version }) => {
                    announced_version = ha_version;
                },
                Ok(other) => {
                    log::debug!("[hass-link] Ignoring {:?} during handshake", other);
                },
                Err(e) => {
                    log::debug!("[hass-link] Unparseable frame during handshake: {}", e);
                },
            },
            Ok(Some(Ok(Message::Ping(payload)))) => {
                let _ = stream.send(Message::Pong(payload)).await;
            },
            Ok(Some(Ok(Message::Pong(_) | Message::Binary(_) | Message::Frame(_)))) => {},
            Ok(Some(Ok(Message::Close(_)))) | Ok(None) => {
                return Err(HassLinkError::WebSocketError(
                    "Connection closed during authentication".to_string(),
                ));
            },
            Ok(Some(Err(e))) => {
                return Err(HassLinkError::WebSocketError(format!(
                    "WebSocket error during authentication: {}",
                    e
                )));
            },
            Err(_) => {
                return Err(HassLinkError::TimeoutError(format!(
                    "Authentication timeout ({:?})",
                    auth_timeout
                )));
            },
        }
    }
}
