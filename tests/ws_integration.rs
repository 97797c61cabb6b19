// ============================================================================
// WEBSOCKET INTEGRATION TESTS - Real connections against a running server
// ============================================================================

use design_canvas_backend::{create_app, CollabHub, DatabaseManager, HubConfig, SharedHub};
use futures::{SinkExt, StreamExt};
use serde_json::{json, Value};
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpStream;
use tokio_tungstenite::tungstenite::protocol::Message;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};

type WsClient = WebSocketStream<MaybeTlsStream<TcpStream>>;

const CANVAS_ID: &str = "itest-canvas";

/// Boot the app on an ephemeral port with an in-memory store and one
/// seeded public canvas.
async fn spawn_server(dev_mode: bool) -> (String, SharedHub) {
    let db = Arc::new(DatabaseManager::new_in_memory().await.unwrap());
    db.create_canvas(
        Some(CANVAS_ID.to_string()),
        "alice",
        "Integration Canvas",
        true,
    )
    .await
    .unwrap();

    let config = HubConfig {
        dev_mode,
        ..HubConfig::default()
    };
    let hub = CollabHub::new(config, db);
    hub.clone().start().await;

    let app = create_app(hub.clone());
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });

    (format!("127.0.0.1:{}", addr.port()), hub)
}

async fn connect(addr: &str, user_id: &str) -> WsClient {
    let url = format!("ws://{}/ws?userId={}&canvasId={}", addr, user_id, CANVAS_ID);
    let (client, _response) = connect_async(url).await.unwrap();
    client
}

/// Next JSON text frame within the timeout, skipping transport frames.
async fn recv_json(client: &mut WsClient, timeout: Duration) -> Option<Value> {
    let deadline = tokio::time::Instant::now() + timeout;

    loop {
        let remaining = deadline.saturating_duration_since(tokio::time::Instant::now());
        if remaining.is_zero() {
            return None;
        }

        match tokio::time::timeout(remaining, client.next()).await {
            Ok(Some(Ok(Message::Text(text)))) => {
                return serde_json::from_str(&text).ok();
            }
            Ok(Some(Ok(Message::Close(_)))) | Ok(None) => return None,
            Ok(Some(Ok(_))) => continue,
            Ok(Some(Err(_))) => return None,
            Err(_) => return None,
        }
    }
}

/// Read frames until one of the wanted type arrives.
async fn recv_until(client: &mut WsClient, kind: &str, timeout: Duration) -> Option<Value> {
    let deadline = tokio::time::Instant::now() + timeout;

    loop {
        let remaining = deadline.saturating_duration_since(tokio::time::Instant::now());
        if remaining.is_zero() {
            return None;
        }
        match recv_json(client, remaining).await {
            Some(frame) if frame["type"] == kind => return Some(frame),
            Some(_) => continue,
            None => return None,
        }
    }
}

async fn send(client: &mut WsClient, frame: Value) {
    client
        .send(Message::Text(frame.to_string()))
        .await
        .unwrap();
}

#[tokio::test]
async fn test_admission_delivers_sync_then_announces_joins() {
    let (addr, _hub) = spawn_server(true).await;

    let mut alice = connect(&addr, "alice").await;
    let sync = recv_until(&mut alice, "CANVAS_SYNC", Duration::from_secs(2))
        .await
        .expect("no CANVAS_SYNC on admission");
    assert_eq!(sync["payload"]["canvas"]["id"], CANVAS_ID);
    assert!(sync["payload"]["shapes"].as_array().unwrap().is_empty());

    recv_until(&mut alice, "ACTIVE_USERS", Duration::from_secs(2))
        .await
        .expect("no ACTIVE_USERS after admission");

    // a second user joins: alice hears about it
    let mut bob = connect(&addr, "bob").await;
    recv_until(&mut bob, "CANVAS_SYNC", Duration::from_secs(2))
        .await
        .unwrap();

    let join = recv_until(&mut alice, "USER_JOIN", Duration::from_secs(2))
        .await
        .expect("no USER_JOIN for peer");
    assert_eq!(join["payload"]["user"]["userId"], "bob");

    let users = recv_until(&mut alice, "ACTIVE_USERS", Duration::from_secs(2))
        .await
        .expect("no refreshed ACTIVE_USERS");
    let listed = users["payload"]["users"].as_array().unwrap();
    assert!(listed.iter().any(|u| u["userId"] == "bob"));
}

#[tokio::test]
async fn test_cursor_fanout_reaches_peer_but_not_sender() {
    let (addr, _hub) = spawn_server(true).await;

    let mut alice = connect(&addr, "alice").await;
    recv_until(&mut alice, "ACTIVE_USERS", Duration::from_secs(2)).await;
    let mut bob = connect(&addr, "bob").await;
    recv_until(&mut bob, "ACTIVE_USERS", Duration::from_secs(2)).await;

    send(
        &mut alice,
        json!({"type": "CURSOR_MOVE", "payload": {"x": 10.0, "y": 20.0}, "userId": "spoofed"}),
    )
    .await;

    let cursor = recv_until(&mut bob, "CURSOR_MOVE", Duration::from_secs(2))
        .await
        .expect("peer never saw the cursor");
    // identity comes from the session, not the payload
    assert_eq!(cursor["payload"]["userId"], "alice");
    assert_eq!(cursor["payload"]["x"], 10.0);
    assert!(cursor["payload"]["color"].as_str().unwrap().starts_with('#'));

    // the sender receives no echo of its own cursor
    assert!(
        recv_until(&mut alice, "CURSOR_MOVE", Duration::from_millis(300))
            .await
            .is_none()
    );
}

#[tokio::test]
async fn test_lock_contention_rejects_with_snapshot() {
    let (addr, hub) = spawn_server(true).await;

    let mut alice = connect(&addr, "alice").await;
    recv_until(&mut alice, "ACTIVE_USERS", Duration::from_secs(2)).await;
    let mut bob = connect(&addr, "bob").await;
    recv_until(&mut bob, "ACTIVE_USERS", Duration::from_secs(2)).await;

    // alice creates and locks a shape
    send(
        &mut alice,
        json!({"type": "SHAPE_CREATE", "payload": {
            "type": "rectangle", "x": 10.0, "y": 20.0, "width": 100.0, "height": 50.0
        }}),
    )
    .await;
    let created = recv_until(&mut alice, "SHAPE_CREATE", Duration::from_secs(2))
        .await
        .expect("creator missed the create broadcast");
    let shape_id = created["payload"]["shape"]["id"].as_str().unwrap().to_string();

    send(
        &mut alice,
        json!({"type": "SHAPE_UPDATE", "payload": {
            "shapeId": shape_id, "updates": {"isLocked": true}
        }}),
    )
    .await;
    let locked = recv_until(&mut alice, "SHAPE_UPDATE", Duration::from_secs(2))
        .await
        .expect("no lock broadcast");
    assert_eq!(locked["payload"]["shape"]["lockedBy"], "alice");

    // bob tries to move the locked shape
    recv_until(&mut bob, "SHAPE_UPDATE", Duration::from_secs(2)).await;
    send(
        &mut bob,
        json!({"type": "SHAPE_UPDATE", "payload": {
            "shapeId": shape_id, "updates": {"x": 100.0}
        }}),
    )
    .await;

    let error = recv_until(&mut bob, "ERROR", Duration::from_secs(2))
        .await
        .expect("no conflict error");
    assert_eq!(
        error["payload"]["message"],
        "Shape is locked by another user"
    );

    let snapshot = recv_until(&mut bob, "SHAPE_UPDATE", Duration::from_secs(2))
        .await
        .expect("no authoritative snapshot");
    assert_eq!(snapshot["payload"]["shape"]["x"], 10.0);

    // persisted state is untouched
    let persisted = hub.db.get_shape_by_id(&shape_id).await.unwrap().unwrap();
    assert_eq!(persisted.x, 10.0);
    assert_eq!(persisted.locked_by.as_deref(), Some("alice"));
}

#[tokio::test]
async fn test_batch_update_limit_over_the_wire() {
    let (addr, _hub) = spawn_server(true).await;

    let mut alice = connect(&addr, "alice").await;
    recv_until(&mut alice, "ACTIVE_USERS", Duration::from_secs(2)).await;

    let oversized: Vec<Value> = (0..101)
        .map(|i| json!({"id": format!("s{}", i), "data": {"x": 1.0}}))
        .collect();
    send(
        &mut alice,
        json!({"type": "SHAPES_BATCH_UPDATE", "payload": {"updates": oversized}}),
    )
    .await;

    let error = recv_until(&mut alice, "ERROR", Duration::from_secs(2))
        .await
        .expect("oversized batch was not rejected");
    assert_eq!(
        error["payload"]["message"],
        "Batch updates limited to 100 items"
    );
}

#[tokio::test]
async fn test_unknown_types_are_ignored_and_ping_answers() {
    let (addr, _hub) = spawn_server(true).await;

    let mut alice = connect(&addr, "alice").await;
    recv_until(&mut alice, "ACTIVE_USERS", Duration::from_secs(2)).await;

    send(&mut alice, json!({"type": "NOT_A_REAL_TYPE", "payload": {}})).await;
    send(&mut alice, json!({"type": "PING"})).await;

    // the unknown frame produced no error; the ping got its pong
    let reply = recv_json(&mut alice, Duration::from_secs(2))
        .await
        .expect("no reply to PING");
    assert_eq!(reply["type"], "PONG");
}

#[tokio::test]
async fn test_invalid_canvas_id_closes_with_policy_code() {
    let (addr, _hub) = spawn_server(true).await;

    let url = format!("ws://{}/ws?userId=alice&canvasId=ab", addr);
    let (mut client, _) = connect_async(url).await.unwrap();

    // an ERROR frame, then a close with code 1008
    let mut saw_error = false;
    let mut close_code = None;
    while let Ok(Some(Ok(message))) =
        tokio::time::timeout(Duration::from_secs(2), client.next()).await
    {
        match message {
            Message::Text(text) => {
                let frame: Value = serde_json::from_str(&text).unwrap();
                if frame["type"] == "ERROR" {
                    saw_error = true;
                }
            }
            Message::Close(Some(frame)) => {
                close_code = Some(u16::from(frame.code));
                break;
            }
            _ => {}
        }
    }

    assert!(saw_error);
    assert_eq!(close_code, Some(1008));
}

#[tokio::test]
async fn test_missing_credentials_rejected_outside_dev_mode() {
    let (addr, _hub) = spawn_server(false).await;

    let url = format!("ws://{}/ws?userId=alice&canvasId={}", addr, CANVAS_ID);
    let (mut client, _) = connect_async(url).await.unwrap();

    let mut close_code = None;
    while let Ok(Some(Ok(message))) =
        tokio::time::timeout(Duration::from_secs(2), client.next()).await
    {
        if let Message::Close(Some(frame)) = message {
            close_code = Some(u16::from(frame.code));
            break;
        }
    }

    assert_eq!(close_code, Some(1008));
}

#[tokio::test]
async fn test_stats_endpoint_reports_connections() {
    let (addr, _hub) = spawn_server(true).await;

    let mut alice = connect(&addr, "alice").await;
    recv_until(&mut alice, "ACTIVE_USERS", Duration::from_secs(2)).await;

    let response = reqwest::get(format!("http://{}/api/ws/stats", addr))
        .await
        .unwrap();
    assert_eq!(response.status(), 200);

    let body: Value = response.json().await.unwrap();
    assert_eq!(body["websocket_stats"]["total_connections"], 1);
    assert_eq!(
        body["websocket_stats"]["connections_per_canvas"][CANVAS_ID],
        1
    );
}

#[tokio::test]
async fn test_disconnect_broadcasts_leave_and_releases_locks() {
    let (addr, hub) = spawn_server(true).await;

    let mut alice = connect(&addr, "alice").await;
    recv_until(&mut alice, "ACTIVE_USERS", Duration::from_secs(2)).await;
    let mut bob = connect(&addr, "bob").await;
    recv_until(&mut bob, "ACTIVE_USERS", Duration::from_secs(2)).await;

    send(
        &mut alice,
        json!({"type": "SHAPE_CREATE", "payload": {
            "type": "circle", "x": 0.0, "y": 0.0, "radius": 10.0
        }}),
    )
    .await;
    let created = recv_until(&mut alice, "SHAPE_CREATE", Duration::from_secs(2))
        .await
        .unwrap();
    let shape_id = created["payload"]["shape"]["id"].as_str().unwrap().to_string();
    send(
        &mut alice,
        json!({"type": "SHAPE_UPDATE", "payload": {
            "shapeId": shape_id, "updates": {"isLocked": true}
        }}),
    )
    .await;
    recv_until(&mut bob, "SHAPE_UPDATE", Duration::from_secs(2)).await;

    // alice drops her connection; the release precedes the leave frame
    alice.close(None).await.unwrap();

    let unlocked = recv_until(&mut bob, "SHAPE_UPDATE", Duration::from_secs(2))
        .await
        .expect("no lock release broadcast");
    assert!(unlocked["payload"]["shape"]["lockedBy"].is_null());

    let leave = recv_until(&mut bob, "USER_LEAVE", Duration::from_secs(2))
        .await
        .expect("no USER_LEAVE after disconnect");
    assert_eq!(leave["payload"]["userId"], "alice");

    let persisted = hub.db.get_shape_by_id(&shape_id).await.unwrap().unwrap();
    assert!(persisted.locked_by.is_none());
}
