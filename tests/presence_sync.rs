// ============================================================================
// PRESENCE & SYNC TESTS - TTL eviction, active users and reconnect snapshots
// ============================================================================

mod common;

use chrono::Utc;
use common::*;
use design_canvas_backend::database::PresenceRecord;
use design_canvas_backend::{presence, websocket, HubConfig, ServerMessage};

fn presence_row(user_id: &str, connection_id: &str, heartbeat_age_secs: i64) -> PresenceRecord {
    PresenceRecord {
        user_id: user_id.to_string(),
        canvas_id: CANVAS_ID.to_string(),
        cursor_x: 1.0,
        cursor_y: 2.0,
        viewport_x: None,
        viewport_y: None,
        viewport_zoom: None,
        selected_object_ids: vec![],
        color: "#FF2D95".to_string(),
        connection_id: connection_id.to_string(),
        last_heartbeat: Utc::now() - chrono::Duration::seconds(heartbeat_age_secs),
        is_active: true,
    }
}

#[tokio::test]
async fn test_stale_presence_is_absent_from_active_users() {
    let hub = test_hub(HubConfig::default(), &["alice", "bob"]).await;

    hub.db.upsert_presence(&presence_row("alice", "c-a", 0)).await.unwrap();
    hub.db.upsert_presence(&presence_row("bob", "c-b", 60)).await.unwrap();

    let users = hub
        .db
        .get_active_users(CANVAS_ID, hub.heartbeat_cutoff())
        .await
        .unwrap();

    assert_eq!(users.len(), 1);
    assert_eq!(users[0].user_id, "alice");
}

#[tokio::test]
async fn test_cleanup_tick_evicts_and_rebroadcasts() {
    let hub = test_hub(HubConfig::default(), &["alice", "bob"]).await;
    let mut rx_a = join(&hub, "c-a", "alice").await;

    hub.db.upsert_presence(&presence_row("alice", "c-a", 0)).await.unwrap();
    hub.db.upsert_presence(&presence_row("bob", "c-b", 120)).await.unwrap();

    hub.presence_cleanup_tick().await;

    // bob's row is gone from the store
    let remaining = hub
        .db
        .get_active_presence(CANVAS_ID, Utc::now() - chrono::Duration::seconds(3600))
        .await
        .unwrap();
    assert_eq!(remaining.len(), 1);

    // subscribers of the affected canvas got a fresh user list
    let frames = drain(&mut rx_a);
    assert!(frames.iter().any(|m| matches!(
        m,
        ServerMessage::ActiveUsers { users } if users.len() == 1 && users[0].user_id == "alice"
    )));
}

#[tokio::test]
async fn test_sync_snapshot_is_self_consistent() {
    let hub = test_hub(HubConfig::default(), &["alice", "bob"]).await;
    let mut rx_a = join(&hub, "c-a", "alice").await;
    let alice = user(&hub, "alice").await;

    presence::upsert_initial_presence(&hub, "c-a", &alice, CANVAS_ID)
        .await
        .unwrap();
    create_rectangle(&hub, "alice", 0.0, 0.0).await;
    let doomed = create_rectangle(&hub, "alice", 5.0, 5.0).await;
    hub.db.delete_shape(&doomed.id).await.unwrap();

    websocket::send_canvas_sync(&hub, "c-a", CANVAS_ID)
        .await
        .unwrap();

    let frames = drain(&mut rx_a);
    let sync = frames
        .iter()
        .find_map(|m| match m {
            ServerMessage::CanvasSync {
                canvas,
                shapes,
                active_users,
            } => Some((canvas, shapes, active_users)),
            _ => None,
        })
        .expect("no CANVAS_SYNC frame");

    let (canvas, shapes, active_users) = sync;
    assert_eq!(canvas.id, CANVAS_ID);

    // soft-deleted shapes are excluded, the rest belong to this canvas
    assert_eq!(shapes.len(), 1);
    assert!(shapes.iter().all(|s| s.canvas_id == canvas.id));

    // every listed user has a live presence row
    let rows = hub
        .db
        .get_active_presence(CANVAS_ID, hub.heartbeat_cutoff())
        .await
        .unwrap();
    for listed in active_users {
        assert!(rows.iter().any(|r| r.user_id == listed.user_id));
    }
}

#[tokio::test]
async fn test_reconnect_flow_rebuilds_state_for_requester() {
    let hub = test_hub(HubConfig::default(), &["alice", "bob"]).await;
    let rx_a = join(&hub, "c-a1", "alice").await;
    let mut rx_b = join(&hub, "c-b", "bob").await;
    let alice = user(&hub, "alice").await;
    let bob = user(&hub, "bob").await;

    presence::upsert_initial_presence(&hub, "c-a1", &alice, CANVAS_ID)
        .await
        .unwrap();
    presence::upsert_initial_presence(&hub, "c-b", &bob, CANVAS_ID)
        .await
        .unwrap();
    create_rectangle(&hub, "alice", 0.0, 0.0).await;
    create_rectangle(&hub, "alice", 10.0, 10.0).await;
    drain(&mut rx_b);

    // alice's socket drops
    drop(rx_a);
    let session = hub.registry.unregister("c-a1").await.unwrap();
    hub.handle_departure(&session).await;

    let after_leave = drain(&mut rx_b);
    assert!(after_leave
        .iter()
        .any(|m| matches!(m, ServerMessage::UserLeave { user_id, .. } if user_id == "alice")));
    assert!(after_leave
        .iter()
        .any(|m| matches!(m, ServerMessage::ActiveUsers { .. })));

    // alice reconnects on a new connection and requests a sync
    let mut rx_a2 = join(&hub, "c-a2", "alice").await;
    presence::upsert_initial_presence(&hub, "c-a2", &alice, CANVAS_ID)
        .await
        .unwrap();
    websocket::send_canvas_sync(&hub, "c-a2", CANVAS_ID)
        .await
        .unwrap();

    let frames = drain(&mut rx_a2);
    let found = frames.iter().any(|m| match m {
        ServerMessage::CanvasSync {
            shapes,
            active_users,
            ..
        } => shapes.len() == 2 && active_users.iter().any(|u| u.user_id == "bob"),
        _ => false,
    });
    assert!(found, "reconnect sync missing shapes or peer user");
}

#[tokio::test]
async fn test_switch_canvas_moves_presence_and_announces() {
    let hub = test_hub(HubConfig::default(), &["alice", "bob"]).await;
    let mut rx_a = join(&hub, "c-a", "alice").await;
    let mut rx_b = join(&hub, "c-b", "bob").await;
    let alice = user(&hub, "alice").await;
    let bob = user(&hub, "bob").await;

    presence::upsert_initial_presence(&hub, "c-a", &alice, CANVAS_ID)
        .await
        .unwrap();
    presence::upsert_initial_presence(&hub, "c-b", &bob, CANVAS_ID)
        .await
        .unwrap();

    // a second public canvas to move to
    hub.db
        .create_canvas(Some("other-canvas".to_string()), "alice", "Other", true)
        .await
        .unwrap();
    drain(&mut rx_a);
    drain(&mut rx_b);

    let payload: design_canvas_backend::events::SwitchCanvasPayload =
        serde_json::from_value(serde_json::json!({"canvasId": "other-canvas"})).unwrap();
    let new_canvas = websocket::handle_switch_canvas(&hub, "c-a", &alice, CANVAS_ID, payload)
        .await
        .unwrap();
    assert_eq!(new_canvas, "other-canvas");

    // bob saw alice leave
    let bob_frames = drain(&mut rx_b);
    assert!(bob_frames
        .iter()
        .any(|m| matches!(m, ServerMessage::UserLeave { user_id, .. } if user_id == "alice")));

    // alice got the switch confirmation and a sync for the new canvas
    let alice_frames = drain(&mut rx_a);
    assert!(alice_frames
        .iter()
        .any(|m| matches!(m, ServerMessage::CanvasSwitched { canvas_id } if canvas_id == "other-canvas")));
    assert!(alice_frames.iter().any(|m| matches!(
        m,
        ServerMessage::CanvasSync { canvas, .. } if canvas.id == "other-canvas"
    )));

    // her presence row moved with her
    let rows = hub
        .db
        .get_active_presence("other-canvas", hub.heartbeat_cutoff())
        .await
        .unwrap();
    assert!(rows.iter().any(|r| r.user_id == "alice"));
    let old_rows = hub
        .db
        .get_active_presence(CANVAS_ID, hub.heartbeat_cutoff())
        .await
        .unwrap();
    assert!(!old_rows.iter().any(|r| r.user_id == "alice"));
}
