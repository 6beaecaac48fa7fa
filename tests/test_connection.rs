//! Connection, subscription and reconnection behaviour against a mock
//! Home Assistant server.

mod common;

use async_trait::async_trait;
use common::{connect, fast_options, test_timeouts, wait_for, MockServer, HA_VERSION};
use hass_link::{
    AuthProvider, Connection, ConnectionEventKind, ConnectionState, ErrorCode, ErrorDetail,
    EventHandlers, HassCommand, HassLinkError, Result,
};
use serde_json::{json, Value};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

fn event_sink() -> (Arc<Mutex<Vec<Value>>>, impl Fn(Value) + Send + Sync + 'static) {
    let seen = Arc::new(Mutex::new(Vec::new()));
    let sink = seen.clone();
    (seen, move |event| sink.lock().unwrap().push(event))
}

#[tokio::test]
async fn test_get_states_round_trip() {
    let mut server = MockServer::start().await;
    let options = fast_options(&server);
    let (conn, mut client) = connect(&mut server, options, EventHandlers::new()).await;

    assert_eq!(conn.state(), ConnectionState::Connected);
    assert_eq!(conn.ha_version().as_deref(), Some(HA_VERSION));

    let (states, _) = tokio::join!(conn.get_states(), async {
        let request = client.recv_json().await;
        assert_eq!(request, json!({"type": "get_states", "id": 1}));
        client
            .reply_ok(1, json!([{"entity_id": "sun.sun", "state": "above_horizon"}]))
            .await;
    });

    assert_eq!(
        states.unwrap(),
        json!([{"entity_id": "sun.sun", "state": "above_horizon"}])
    );
}

#[tokio::test]
async fn test_command_ids_increase_from_one() {
    let mut server = MockServer::start().await;
    let options = fast_options(&server);
    let (conn, mut client) = connect(&mut server, options, EventHandlers::new()).await;

    for expected in 1..=3u64 {
        let (result, _) = tokio::join!(conn.get_config(), async {
            let request = client.recv_json().await;
            assert_eq!(request["id"], expected);
            client.reply_ok(expected, json!({"version": HA_VERSION})).await;
        });
        result.unwrap();
    }
}

#[tokio::test]
async fn test_failed_result_surfaces_server_error() {
    let mut server = MockServer::start().await;
    let options = fast_options(&server);
    let (conn, mut client) = connect(&mut server, options, EventHandlers::new()).await;

    let (result, _) = tokio::join!(conn.call_service("light", "explode", None), async {
        let request = client.recv_json().await;
        assert_eq!(
            request,
            json!({"type": "call_service", "domain": "light", "service": "explode", "id": 1})
        );
        client
            .send_json(json!({
                "id": 1,
                "type": "result",
                "success": false,
                "error": {"code": "not_found", "message": "Service not found."}
            }))
            .await;
    });

    match result {
        Err(HassLinkError::CommandFailed(detail)) => {
            assert_eq!(detail, ErrorDetail::new("not_found", "Service not found."));
        },
        other => panic!("Expected CommandFailed, got {:?}", other),
    }
}

#[tokio::test]
async fn test_integer_error_code_is_propagated() {
    let mut server = MockServer::start().await;
    let options = fast_options(&server);
    let (conn, mut client) = connect(&mut server, options, EventHandlers::new()).await;

    let (result, _) = tokio::join!(conn.get_states(), async {
        client.recv_json().await;
        client
            .send_json(json!({
                "id": 1,
                "type": "result",
                "success": false,
                "error": {"code": 3, "message": "Entity not found"}
            }))
            .await;
    });

    match result {
        Err(HassLinkError::CommandFailed(detail)) => {
            assert_eq!(detail, ErrorDetail::new(ErrorCode::Number(3), "Entity not found"));
        },
        other => panic!("Expected CommandFailed, got {:?}", other),
    }
}

#[tokio::test]
async fn test_undecodable_result_rejects_request() {
    let mut server = MockServer::start().await;
    let options = fast_options(&server);
    let (conn, mut client) = connect(&mut server, options, EventHandlers::new()).await;

    let (result, _) = tokio::join!(conn.get_config(), async {
        client.recv_json().await;
        client
            .send_json(json!({"id": 1, "type": "result", "success": "sometimes"}))
            .await;
    });
    assert!(matches!(result, Err(HassLinkError::SerializationError(_))), "got {:?}", result);

    // The socket stays usable.
    let (pinged, _) = tokio::join!(conn.ping(), async {
        assert_eq!(client.recv_json().await, json!({"type": "ping", "id": 2}));
        client.send_json(json!({"id": 2, "type": "pong"})).await;
    });
    pinged.unwrap();
}

#[tokio::test]
async fn test_ping_resolves_on_pong() {
    let mut server = MockServer::start().await;
    let options = fast_options(&server);
    let (conn, mut client) = connect(&mut server, options, EventHandlers::new()).await;

    let (result, _) = tokio::join!(conn.ping(), async {
        assert_eq!(client.recv_json().await, json!({"type": "ping", "id": 1}));
        client.send_json(json!({"id": 1, "type": "pong"})).await;
    });
    result.unwrap();
}

#[tokio::test]
async fn test_custom_command_passes_through() {
    let mut server = MockServer::start().await;
    let options = fast_options(&server);
    let (conn, mut client) = connect(&mut server, options, EventHandlers::new()).await;

    let command = HassCommand::custom(json!({"type": "config/area_registry/list"})).unwrap();
    let (result, _) = tokio::join!(conn.send_message(command), async {
        assert_eq!(
            client.recv_json().await,
            json!({"type": "config/area_registry/list", "id": 1})
        );
        client.send_json(json!({"id": 1, "type": "result", "success": true})).await;
    });
    assert_eq!(result.unwrap(), Value::Null, "missing result resolves to null");
}

#[tokio::test]
async fn test_socket_loss_rejects_pending_and_fires_disconnected() {
    let mut server = MockServer::start().await;
    let disconnects = Arc::new(AtomicUsize::new(0));
    let d = disconnects.clone();
    let handlers = EventHandlers::new().on_disconnected(move |_| {
        d.fetch_add(1, Ordering::SeqCst);
    });
    let options = fast_options(&server);
    let (conn, mut client) = connect(&mut server, options, handlers).await;

    let (result, _) = tokio::join!(conn.get_states(), async {
        client.recv_json().await;
        drop(client);
    });

    assert!(matches!(result, Err(HassLinkError::ConnectionLost)), "got {:?}", result);
    wait_for("disconnected event", || disconnects.load(Ordering::SeqCst) == 1).await;
    assert_ne!(conn.state(), ConnectionState::Closed);
}

#[tokio::test]
async fn test_server_close_frame_code_is_reported() {
    let mut server = MockServer::start().await;
    let reason_code = Arc::new(Mutex::new(None));
    let r = reason_code.clone();
    let handlers = EventHandlers::new().on_disconnected(move |reason| {
        *r.lock().unwrap() = reason.code;
    });
    let options = fast_options(&server);
    let (_conn, client) = connect(&mut server, options, handlers).await;

    client.close(1001, "Home Assistant is shutting down").await;
    wait_for("disconnect reason", || reason_code.lock().unwrap().is_some()).await;
    assert_eq!(*reason_code.lock().unwrap(), Some(1001));
}

#[tokio::test]
async fn test_requests_while_reconnecting_fail_fast() {
    let mut server = MockServer::start().await;
    let options = fast_options(&server);
    let (conn, client) = connect(&mut server, options, EventHandlers::new()).await;

    drop(client);
    // Hold the replacement socket without completing its handshake.
    let _pending = server.accept().await;
    wait_for("retrying state", || conn.state() == ConnectionState::DisconnectedRetrying).await;

    let result = conn.get_states().await;
    assert!(matches!(result, Err(HassLinkError::ConnectionLost)), "got {:?}", result);
}

#[tokio::test]
async fn test_subscription_survives_reconnect() {
    let mut server = MockServer::start().await;
    let ready = Arc::new(AtomicUsize::new(0));
    let r = ready.clone();
    let handlers = EventHandlers::new().on_ready(move || {
        r.fetch_add(1, Ordering::SeqCst);
    });
    let options = fast_options(&server);
    let (conn, mut client) = connect(&mut server, options, handlers).await;

    // get_states takes id 1 so the subscription lands on id 2.
    let (states, _) = tokio::join!(conn.get_states(), async {
        client.recv_json().await;
        client.reply_ok(1, json!([])).await;
    });
    states.unwrap();

    let (events, callback) = event_sink();
    let (subscription, _) = tokio::join!(conn.subscribe_events(callback, Some("state_changed")), async {
        assert_eq!(
            client.recv_json().await,
            json!({"type": "subscribe_events", "event_type": "state_changed", "id": 2})
        );
        client.reply_ok(2, Value::Null).await;
    });
    let subscription = subscription.unwrap();

    client
        .send_json(json!({"id": 2, "type": "event", "event": {"n": 1}}))
        .await;
    wait_for("first event", || events.lock().unwrap().len() == 1).await;

    // Lose the socket; the subscription is replayed on the new one as id 1.
    drop(client);
    let mut client = server.accept().await;
    client.handshake(true).await;
    assert_eq!(
        client.recv_json().await,
        json!({"type": "subscribe_events", "event_type": "state_changed", "id": 1})
    );
    client.reply_ok(1, Value::Null).await;

    wait_for("ready event", || ready.load(Ordering::SeqCst) == 1).await;
    assert_eq!(conn.state(), ConnectionState::Connected);

    client
        .send_json(json!({"id": 1, "type": "event", "event": {"n": 2}}))
        .await;
    wait_for("event after reconnect", || events.lock().unwrap().len() == 2).await;
    assert_eq!(*events.lock().unwrap(), vec![json!({"n": 1}), json!({"n": 2})]);

    let listed = conn.list_subscriptions().await;
    assert_eq!(listed.len(), 1);
    assert_eq!(listed[0].key, subscription.id());
    assert_eq!(listed[0].protocol_id, Some(1));

    let (unsubscribed, _) = tokio::join!(subscription.unsubscribe(), async {
        assert_eq!(
            client.recv_json().await,
            json!({"type": "unsubscribe_events", "subscription": 1, "id": 2})
        );
        client.reply_ok(2, Value::Null).await;
    });
    unsubscribed.unwrap();
    assert!(conn.list_subscriptions().await.is_empty());
}

#[tokio::test]
async fn test_unsubscribe_twice_sends_one_frame() {
    let mut server = MockServer::start().await;
    let options = fast_options(&server);
    let (conn, mut client) = connect(&mut server, options, EventHandlers::new()).await;

    let (events, callback) = event_sink();
    let (subscription, _) = tokio::join!(conn.subscribe_events(callback, None), async {
        assert_eq!(client.recv_json().await, json!({"type": "subscribe_events", "id": 1}));
        client.reply_ok(1, Value::Null).await;
    });
    let subscription = subscription.unwrap();

    let (first, _) = tokio::join!(subscription.unsubscribe(), async {
        assert_eq!(
            client.recv_json().await,
            json!({"type": "unsubscribe_events", "subscription": 1, "id": 2})
        );
        // An event already in flight when the unsubscribe went out.
        client
            .send_json(json!({"id": 1, "type": "event", "event": {"late": true}}))
            .await;
        client.reply_ok(2, Value::Null).await;
    });
    first.unwrap();
    assert!(events.lock().unwrap().is_empty());

    subscription.unsubscribe().await.unwrap();
    assert!(!subscription.is_active());

    // The next frame the server sees is the ping, not another unsubscribe.
    let (pinged, _) = tokio::join!(conn.ping(), async {
        assert_eq!(client.recv_json().await, json!({"type": "ping", "id": 3}));
        client.send_json(json!({"id": 3, "type": "pong"})).await;
    });
    pinged.unwrap();
}

#[tokio::test]
async fn test_event_for_unknown_id_is_unsubscribed() {
    let mut server = MockServer::start().await;
    let options = fast_options(&server);
    let (_conn, mut client) = connect(&mut server, options, EventHandlers::new()).await;

    client
        .send_json(json!({"id": 99, "type": "event", "event": {"stale": true}}))
        .await;
    assert_eq!(
        client.recv_json().await,
        json!({"type": "unsubscribe_events", "subscription": 99, "id": 1})
    );
}

#[tokio::test]
async fn test_failed_subscribe_returns_server_error() {
    let mut server = MockServer::start().await;
    let options = fast_options(&server);
    let (conn, mut client) = connect(&mut server, options, EventHandlers::new()).await;

    let (_, callback) = event_sink();
    let (result, _) = tokio::join!(conn.subscribe_events(callback, Some("secret")), async {
        client.recv_json().await;
        client
            .send_json(json!({
                "id": 1,
                "type": "result",
                "success": false,
                "error": {"code": "unauthorized", "message": "Unauthorized"}
            }))
            .await;
    });

    assert!(matches!(result, Err(HassLinkError::CommandFailed(_))), "got {:?}", result);
    assert!(conn.list_subscriptions().await.is_empty());
}

#[tokio::test]
async fn test_auth_invalid_on_connect_is_not_retried() {
    let mut server = MockServer::start().await;
    let options = fast_options(&server).with_setup_retry(3);

    let connecting = Connection::builder()
        .options(options)
        .access_token("wrong")
        .timeouts(test_timeouts())
        .connect();
    let (result, _) = tokio::join!(connecting, async {
        let mut client = server.accept().await;
        assert_eq!(client.handshake(false).await, "wrong");
    });

    match result {
        Err(err @ HassLinkError::InvalidAuth(_)) => assert_eq!(err.code(), Some(2)),
        other => panic!("Expected InvalidAuth, got {:?}", other),
    }
    assert!(
        server.try_accept(Duration::from_millis(200)).await.is_none(),
        "no retry after auth_invalid"
    );
}

#[tokio::test]
async fn test_setup_retry_recovers_from_dropped_handshake() {
    let mut server = MockServer::start().await;
    let options = fast_options(&server).with_setup_retry(1);

    let connecting = Connection::builder()
        .options(options)
        .access_token("test-token")
        .timeouts(test_timeouts())
        .connect();
    let (result, _client) = tokio::join!(connecting, async {
        drop(server.accept().await);
        let mut client = server.accept().await;
        client.handshake(true).await;
        client
    });

    let conn = result.expect("second attempt succeeds");
    assert_eq!(conn.state(), ConnectionState::Connected);
}

#[tokio::test]
async fn test_auth_invalid_during_reconnect_closes() {
    let mut server = MockServer::start().await;
    let errors = Arc::new(Mutex::new(Vec::new()));
    let e = errors.clone();
    let handlers = EventHandlers::new().on_reconnect_error(move |err| {
        e.lock().unwrap().push(err.clone());
    });
    let options = fast_options(&server);
    let (conn, client) = connect(&mut server, options, handlers).await;

    drop(client);
    let mut client = server.accept().await;
    client.handshake(false).await;

    wait_for("reconnect-error", || !errors.lock().unwrap().is_empty()).await;
    assert!(matches!(errors.lock().unwrap()[0], HassLinkError::InvalidAuth(_)));
    assert_eq!(conn.state(), ConnectionState::Closed);
    assert!(matches!(conn.get_states().await, Err(HassLinkError::Closed)));
    assert!(
        server.try_accept(Duration::from_millis(200)).await.is_none(),
        "closed connections never redial"
    );
}

#[tokio::test]
async fn test_max_reconnect_attempts_gives_up() {
    let mut server = MockServer::start().await;
    let errors = Arc::new(Mutex::new(Vec::new()));
    let e = errors.clone();
    let handlers = EventHandlers::new().on_reconnect_error(move |err| {
        e.lock().unwrap().push(err.clone());
    });
    let options = fast_options(&server).with_max_reconnect_attempts(Some(1));
    let (conn, client) = connect(&mut server, options, handlers).await;

    drop(client);
    drop(server.accept().await);

    wait_for("reconnect-error", || !errors.lock().unwrap().is_empty()).await;
    assert!(matches!(errors.lock().unwrap()[0], HassLinkError::CannotConnect(_)));
    assert_eq!(conn.state(), ConnectionState::Closed);
}

#[tokio::test]
async fn test_close_suppresses_reconnect() {
    let mut server = MockServer::start().await;
    let disconnects = Arc::new(AtomicUsize::new(0));
    let d = disconnects.clone();
    let handlers = EventHandlers::new().on_disconnected(move |_| {
        d.fetch_add(1, Ordering::SeqCst);
    });
    let options = fast_options(&server);
    let (conn, mut client) = connect(&mut server, options, handlers).await;

    conn.close().await;
    assert_eq!(conn.state(), ConnectionState::Closed);
    assert!(client.expect_closed().await, "client closes its socket");
    assert!(server.try_accept(Duration::from_millis(200)).await.is_none());
    assert_eq!(disconnects.load(Ordering::SeqCst), 0, "deliberate close is not a disconnect");

    assert!(matches!(conn.ping().await, Err(HassLinkError::Closed)));
    conn.close().await;
}

#[tokio::test]
async fn test_event_listener_can_be_removed() {
    let mut server = MockServer::start().await;
    let options = fast_options(&server);
    let (conn, client) = connect(&mut server, options, EventHandlers::new()).await;

    let hits = Arc::new(AtomicUsize::new(0));
    let h = hits.clone();
    let id = conn.add_event_listener(ConnectionEventKind::Disconnected, move |_| {
        h.fetch_add(1, Ordering::SeqCst);
    });
    assert!(conn.remove_event_listener(id));

    let fired = Arc::new(AtomicBool::new(false));
    let f = fired.clone();
    conn.add_event_listener(ConnectionEventKind::Disconnected, move |_| {
        f.store(true, Ordering::SeqCst);
    });

    drop(client);
    wait_for("remaining listener", || fired.load(Ordering::SeqCst)).await;
    assert_eq!(hits.load(Ordering::SeqCst), 0);
}

/// Provider whose token starts out expired.
struct ExpiringToken {
    token: Mutex<String>,
    expired: AtomicBool,
    refreshes: AtomicUsize,
}

#[async_trait]
impl AuthProvider for ExpiringToken {
    fn access_token(&self) -> String {
        self.token.lock().unwrap().clone()
    }

    fn expired(&self) -> bool {
        self.expired.load(Ordering::SeqCst)
    }

    async fn refresh_access_token(&self) -> Result<()> {
        self.refreshes.fetch_add(1, Ordering::SeqCst);
        *self.token.lock().unwrap() = "fresh-token".to_string();
        self.expired.store(false, Ordering::SeqCst);
        Ok(())
    }
}

#[tokio::test]
async fn test_expired_token_is_refreshed_before_auth() {
    let mut server = MockServer::start().await;
    let provider = Arc::new(ExpiringToken {
        token: Mutex::new("stale-token".to_string()),
        expired: AtomicBool::new(true),
        refreshes: AtomicUsize::new(0),
    });

    let connecting = Connection::builder()
        .options(fast_options(&server))
        .auth_provider(provider.clone())
        .timeouts(test_timeouts())
        .connect();
    let (result, presented) = tokio::join!(connecting, async {
        let mut client = server.accept().await;
        client.handshake(true).await
    });

    result.unwrap();
    assert_eq!(presented, "fresh-token");
    assert_eq!(provider.refreshes.load(Ordering::SeqCst), 1);
}

/// Provider whose refresh is always rejected.
struct RevokedToken;

#[async_trait]
impl AuthProvider for RevokedToken {
    fn access_token(&self) -> String {
        "revoked".to_string()
    }

    fn expired(&self) -> bool {
        true
    }

    async fn refresh_access_token(&self) -> Result<()> {
        Err(HassLinkError::NetworkError("refresh endpoint unreachable".to_string()))
    }
}

#[tokio::test]
async fn test_failed_refresh_is_invalid_auth() {
    let mut server = MockServer::start().await;
    let connecting = Connection::builder()
        .options(fast_options(&server).with_setup_retry(2))
        .auth(RevokedToken)
        .timeouts(test_timeouts())
        .connect();
    let (result, _client) = tokio::join!(connecting, server.accept());

    assert!(matches!(result, Err(HassLinkError::InvalidAuth(_))), "got {:?}", result);
}
