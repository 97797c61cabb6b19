// ============================================================================
// PRESENCE - Cursor fan-out, liveness rows and active-user aggregation
// ============================================================================

use crate::database::{PresenceRecord, UserRecord};
use crate::events::{CursorMovePayload, PresenceUpdatePayload, ServerMessage};
use crate::hub::{CollabHub, Priority};
use chrono::Utc;
use tracing::{debug, warn};

fn presence_row(
    connection_id: &str,
    user: &UserRecord,
    canvas_id: &str,
    cursor: (f64, f64),
) -> PresenceRecord {
    PresenceRecord {
        user_id: user.id.clone(),
        canvas_id: canvas_id.to_string(),
        cursor_x: cursor.0,
        cursor_y: cursor.1,
        viewport_x: None,
        viewport_y: None,
        viewport_zoom: None,
        selected_object_ids: Vec::new(),
        color: user.avatar_color.clone(),
        connection_id: connection_id.to_string(),
        last_heartbeat: Utc::now(),
        is_active: true,
    }
}

/// First presence row of a freshly admitted session, cursor at origin.
pub async fn upsert_initial_presence(
    hub: &CollabHub,
    connection_id: &str,
    user: &UserRecord,
    canvas_id: &str,
) -> Result<(), sqlx::Error> {
    hub.db
        .upsert_presence(&presence_row(connection_id, user, canvas_id, (0.0, 0.0)))
        .await
}

/// CURSOR_MOVE: throttled fan-out plus a fire-and-forget presence write.
/// The broadcast never waits on the store; upsert errors are only logged.
pub async fn handle_cursor_move(
    hub: &CollabHub,
    connection_id: &str,
    user: &UserRecord,
    canvas_id: &str,
    payload: CursorMovePayload,
) {
    if !hub.cursor_gate.admit(connection_id.to_string()).await {
        return;
    }

    // the lock sweep reads this to spare actively working holders
    hub.touch_activity(&user.id).await;

    hub.broadcast(
        canvas_id,
        ServerMessage::CursorMove {
            user_id: user.id.clone(),
            username: user.username.clone(),
            display_name: user.display_name.clone(),
            email: user.email.clone(),
            color: user.avatar_color.clone(),
            x: payload.x,
            y: payload.y,
        },
        Some(connection_id),
        Priority::Low,
    )
    .await;

    let mut row = presence_row(connection_id, user, canvas_id, (payload.x, payload.y));
    row.viewport_x = payload.viewport_x;
    row.viewport_y = payload.viewport_y;
    row.viewport_zoom = payload.viewport_zoom;

    let db = hub.db.clone();
    tokio::spawn(async move {
        if let Err(e) = db.upsert_presence(&row).await {
            warn!("Presence upsert failed for {}: {}", row.connection_id, e);
        }
    });
}

/// PRESENCE_UPDATE: selection changes persist synchronously, then fan out
/// at low priority.
pub async fn handle_presence_update(
    hub: &CollabHub,
    connection_id: &str,
    user: &UserRecord,
    canvas_id: &str,
    payload: PresenceUpdatePayload,
) -> Result<(), String> {
    let existing = hub
        .db
        .get_active_presence(canvas_id, hub.heartbeat_cutoff())
        .await
        .map_err(|e| format!("Failed to read presence: {}", e))?
        .into_iter()
        .find(|row| row.user_id == user.id);

    let mut row = match existing {
        Some(row) => row,
        None => presence_row(connection_id, user, canvas_id, (0.0, 0.0)),
    };
    row.connection_id = connection_id.to_string();
    row.selected_object_ids = payload.selected_object_ids.clone();
    row.is_active = payload.is_active;
    row.last_heartbeat = Utc::now();

    hub.db
        .upsert_presence(&row)
        .await
        .map_err(|e| format!("Failed to write presence: {}", e))?;

    debug!(
        "Presence update from {}: {} selected",
        user.id,
        payload.selected_object_ids.len()
    );

    hub.broadcast(
        canvas_id,
        ServerMessage::PresenceUpdate {
            user_id: user.id.clone(),
            selected_object_ids: payload.selected_object_ids,
            is_active: payload.is_active,
        },
        Some(connection_id),
        Priority::Low,
    )
    .await;

    Ok(())
}

/// PING: refresh the liveness row and answer the requester directly.
pub async fn handle_ping(hub: &CollabHub, connection_id: &str) {
    if let Err(e) = hub.db.refresh_heartbeat(connection_id).await {
        debug!("Heartbeat refresh failed for {}: {}", connection_id, e);
    }
    hub.registry.mark_alive(connection_id).await;
    hub.send_to_connection(
        connection_id,
        ServerMessage::pong(Some(Utc::now().timestamp_millis())),
    )
    .await;
}

// ============================================================================
// TESTS
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::auth::Identity;
    use crate::config::HubConfig;
    use crate::database::DatabaseManager;
    use crate::hub::SharedHub;
    use crate::registry::{Session, SocketCommand};
    use std::sync::Arc;
    use tokio::sync::mpsc;

    async fn hub_with_two_users() -> (SharedHub, String, mpsc::UnboundedReceiver<SocketCommand>) {
        let db = Arc::new(DatabaseManager::new_in_memory().await.unwrap());
        for name in ["alice", "bob"] {
            db.get_or_create_user(&Identity {
                user_id: name.to_string(),
                username: name.to_string(),
                email: format!("{}@example.com", name),
                display_name: name.to_string(),
            })
            .await
            .unwrap();
        }
        let canvas = db
            .create_canvas(None, "alice", "Presence Canvas", true)
            .await
            .unwrap();

        let hub = CollabHub::new(HubConfig::default(), db);

        let alice = hub.db.get_user_by_id("alice").await.unwrap().unwrap();
        let bob = hub.db.get_user_by_id("bob").await.unwrap().unwrap();

        let (tx_a, _rx_a) = mpsc::unbounded_channel();
        hub.registry
            .register(Session::new(
                "c-a".to_string(),
                alice,
                canvas.id.clone(),
                tx_a,
            ))
            .await;
        let (tx_b, rx_b) = mpsc::unbounded_channel();
        hub.registry
            .register(Session::new(
                "c-b".to_string(),
                bob,
                canvas.id.clone(),
                tx_b,
            ))
            .await;

        (hub, canvas.id, rx_b)
    }

    fn cursor(x: f64, y: f64) -> CursorMovePayload {
        CursorMovePayload {
            x,
            y,
            viewport_x: None,
            viewport_y: None,
            viewport_zoom: None,
        }
    }

    #[tokio::test]
    async fn test_cursor_move_fans_out_to_peer_only() {
        let (hub, canvas_id, mut rx_b) = hub_with_two_users().await;
        let alice = hub.db.get_user_by_id("alice").await.unwrap().unwrap();

        handle_cursor_move(&hub, "c-a", &alice, &canvas_id, cursor(10.0, 20.0)).await;
        hub.flush_tick().await;

        match rx_b.try_recv() {
            Ok(SocketCommand::Frame(ServerMessage::CursorMove { user_id, color, x, .. })) => {
                assert_eq!(user_id, "alice");
                assert_eq!(color, alice.avatar_color);
                assert_eq!(x, 10.0);
            }
            other => panic!("expected cursor frame, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_cursor_move_is_throttled_per_connection() {
        let (hub, canvas_id, mut rx_b) = hub_with_two_users().await;
        let alice = hub.db.get_user_by_id("alice").await.unwrap().unwrap();

        // burst of moves without any gap: only the first passes the gate
        for i in 0..5 {
            handle_cursor_move(&hub, "c-a", &alice, &canvas_id, cursor(i as f64, 0.0)).await;
        }
        hub.flush_tick().await;

        let mut received = 0;
        while rx_b.try_recv().is_ok() {
            received += 1;
        }
        assert_eq!(received, 1);
    }

    #[tokio::test]
    async fn test_cursor_move_stamps_activity() {
        let (hub, canvas_id, _rx_b) = hub_with_two_users().await;
        let alice = hub.db.get_user_by_id("alice").await.unwrap().unwrap();

        assert!(hub.last_activity("alice").await.is_none());
        handle_cursor_move(&hub, "c-a", &alice, &canvas_id, cursor(1.0, 1.0)).await;
        assert!(hub.last_activity("alice").await.is_some());
    }

    #[tokio::test]
    async fn test_presence_update_persists_selection() {
        let (hub, canvas_id, mut rx_b) = hub_with_two_users().await;
        let alice = hub.db.get_user_by_id("alice").await.unwrap().unwrap();

        upsert_initial_presence(&hub, "c-a", &alice, &canvas_id)
            .await
            .unwrap();

        handle_presence_update(
            &hub,
            "c-a",
            &alice,
            &canvas_id,
            PresenceUpdatePayload {
                selected_object_ids: vec!["s1".to_string(), "s2".to_string()],
                is_active: true,
            },
        )
        .await
        .unwrap();

        let rows = hub
            .db
            .get_active_presence(&canvas_id, hub.heartbeat_cutoff())
            .await
            .unwrap();
        let alice_row = rows.iter().find(|r| r.user_id == "alice").unwrap();
        assert_eq!(alice_row.selected_object_ids.len(), 2);

        hub.flush_tick().await;
        assert!(matches!(
            rx_b.try_recv(),
            Ok(SocketCommand::Frame(ServerMessage::PresenceUpdate { .. }))
        ));
    }

    #[tokio::test]
    async fn test_ping_answers_requester_with_pong() {
        let (hub, canvas_id, _rx_b) = hub_with_two_users().await;
        let alice = hub.db.get_user_by_id("alice").await.unwrap().unwrap();
        upsert_initial_presence(&hub, "c-a", &alice, &canvas_id)
            .await
            .unwrap();

        // replace alice's channel so we can observe her frames
        let session = hub.registry.unregister("c-a").await.unwrap();
        let (tx, mut rx) = mpsc::unbounded_channel();
        hub.registry
            .register(Session::new(
                "c-a".to_string(),
                session.user,
                canvas_id.clone(),
                tx,
            ))
            .await;

        handle_ping(&hub, "c-a").await;
        assert!(matches!(
            rx.try_recv(),
            Ok(SocketCommand::Frame(ServerMessage::Pong { .. }))
        ));
    }
}
