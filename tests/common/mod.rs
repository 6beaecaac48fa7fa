#![allow(dead_code)]
//! In-process mock of the Home Assistant WebSocket endpoint.
//!
//! Every accepted socket is handed to the test as a [`MockClient`], which
//! scripts the server side of the conversation frame by frame.

use futures_util::{SinkExt, StreamExt};
use hass_link::{Connection, ConnectionOptions, EventHandlers, HassLinkTimeouts};
use serde_json::{json, Value};
use std::time::Duration;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
use tokio_tungstenite::tungstenite::protocol::{CloseFrame, Message};
use tokio_tungstenite::WebSocketStream;

pub const TEST_TIMEOUT: Duration = Duration::from_secs(5);
pub const HA_VERSION: &str = "2024.1.0";

pub struct MockServer {
    url: String,
    incoming: mpsc::UnboundedReceiver<MockClient>,
    _accept_task: JoinHandle<()>,
}

impl MockServer {
    pub async fn start() -> Self {
        let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind mock server");
        let url = format!("http://{}", listener.local_addr().expect("local addr"));
        let (tx, incoming) = mpsc::unbounded_channel();

        let accept_task = tokio::spawn(async move {
            while let Ok((stream, _)) = listener.accept().await {
                match tokio_tungstenite::accept_async(stream).await {
                    Ok(ws) => {
                        if tx.send(MockClient { ws }).is_err() {
                            return;
                        }
                    },
                    Err(e) => eprintln!("mock server: upgrade failed: {}", e),
                }
            }
        });

        Self {
            url,
            incoming,
            _accept_task: accept_task,
        }
    }

    pub fn url(&self) -> String {
        self.url.clone()
    }

    /// Next socket opened by the client; panics after [`TEST_TIMEOUT`].
    pub async fn accept(&mut self) -> MockClient {
        tokio::time::timeout(TEST_TIMEOUT, self.incoming.recv())
            .await
            .expect("timed out waiting for a client socket")
            .expect("mock server stopped")
    }

    /// Next socket opened within `within`, if any.
    pub async fn try_accept(&mut self, within: Duration) -> Option<MockClient> {
        tokio::time::timeout(within, self.incoming.recv()).await.ok().flatten()
    }
}

pub struct MockClient {
    ws: WebSocketStream<TcpStream>,
}

impl MockClient {
    /// Run the server side of the auth phase; returns the presented token.
    pub async fn handshake(&mut self, accept: bool) -> String {
        self.send_json(json!({"type": "auth_required", "ha_version": HA_VERSION}))
            .await;
        let auth = self.recv_json().await;
        assert_eq!(auth["type"], "auth", "first client frame must be auth: {}", auth);
        assert!(auth.get("id").is_none(), "auth carries no id");

        if accept {
            self.send_json(json!({"type": "auth_ok", "ha_version": HA_VERSION}))
                .await;
        } else {
            self.send_json(json!({"type": "auth_invalid", "message": "Invalid access token"}))
                .await;
        }
        auth["access_token"].as_str().unwrap_or_default().to_string()
    }

    pub async fn send_json(&mut self, value: Value) {
        self.ws
            .send(Message::Text(value.to_string().into()))
            .await
            .expect("mock send");
    }

    /// Next JSON text frame from the client.
    pub async fn recv_json(&mut self) -> Value {
        loop {
            let frame = tokio::time::timeout(TEST_TIMEOUT, self.ws.next())
                .await
                .expect("timed out waiting for a client frame");
            match frame {
                Some(Ok(Message::Text(text))) => {
                    return serde_json::from_str(&text).expect("client sent invalid JSON");
                },
                Some(Ok(Message::Close(_))) | None => panic!("client closed the socket"),
                Some(Ok(_)) => continue,
                Some(Err(e)) => panic!("socket error: {}", e),
            }
        }
    }

    /// Answer command `id` with a successful result.
    pub async fn reply_ok(&mut self, id: u64, result: Value) {
        self.send_json(json!({"id": id, "type": "result", "success": true, "result": result}))
            .await;
    }

    /// `true` if the client closes the socket within [`TEST_TIMEOUT`].
    pub async fn expect_closed(&mut self) -> bool {
        loop {
            match tokio::time::timeout(TEST_TIMEOUT, self.ws.next()).await {
                Ok(Some(Ok(Message::Close(_)))) | Ok(None) | Ok(Some(Err(_))) => return true,
                Ok(Some(Ok(_))) => continue,
                Err(_) => return false,
            }
        }
    }

    /// Close with a proper close frame.
    pub async fn close(mut self, code: u16, reason: &str) {
        let frame = CloseFrame {
            code: CloseCode::from(code),
            reason: reason.to_string().into(),
        };
        let _ = self.ws.close(Some(frame)).await;
    }
}

/// Options pointing at `server` with millisecond backoff.
pub fn fast_options(server: &MockServer) -> ConnectionOptions {
    ConnectionOptions::new(server.url())
        .with_setup_retry_delay_ms(10)
        .with_reconnect_delay_step_ms(20)
        .with_max_reconnect_delay_ms(100)
}

pub fn test_timeouts() -> HassLinkTimeouts {
    HassLinkTimeouts::builder()
        .connection_timeout_secs(2)
        .auth_timeout_secs(2)
        .build()
}

/// Connect a client to `server` and complete the handshake on the mock side.
pub async fn connect(
    server: &mut MockServer,
    options: ConnectionOptions,
    handlers: EventHandlers,
) -> (Connection, MockClient) {
    let connecting = Connection::builder()
        .options(options)
        .access_token("test-token")
        .timeouts(test_timeouts())
        .event_handlers(handlers)
        .connect();

    let (connection, client) = tokio::join!(connecting, async {
        let mut client = server.accept().await;
        client.handshake(true).await;
        client
    });
    (connection.expect("connect"), client)
}

/// Poll `condition` until it holds; panics after [`TEST_TIMEOUT`].
pub async fn wait_for(what: &str, condition: impl Fn() -> bool) {
    let deadline = tokio::time::Instant::now() + TEST_TIMEOUT;
    while !condition() {
        if tokio::time::Instant::now() >= deadline {
            panic!("timed out waiting for {}", what);
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}
