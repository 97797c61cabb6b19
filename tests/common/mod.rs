// ============================================================================
// TEST FIXTURES - Shared setup for hub integration tests
// ============================================================================

#![allow(dead_code)]

use design_canvas_backend::auth::Identity;
use design_canvas_backend::database::{DatabaseManager, ShapeRecord, UserRecord};
use design_canvas_backend::events::ShapeData;
use design_canvas_backend::hub::{CollabHub, SharedHub};
use design_canvas_backend::registry::{Session, SocketCommand};
use design_canvas_backend::{HubConfig, ServerMessage};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;

pub const CANVAS_ID: &str = "test-canvas";

pub fn identity(user_id: &str) -> Identity {
    Identity {
        user_id: user_id.to_string(),
        username: user_id.to_string(),
        email: format!("{}@example.com", user_id),
        display_name: format!("User {}", user_id),
    }
}

/// Hub over an in-memory store with a seeded public canvas and the given
/// users already known to the store.
pub async fn test_hub(config: HubConfig, users: &[&str]) -> SharedHub {
    let db = Arc::new(DatabaseManager::new_in_memory().await.unwrap());
    for user_id in users {
        db.get_or_create_user(&identity(user_id)).await.unwrap();
    }
    db.create_canvas(
        Some(CANVAS_ID.to_string()),
        users.first().copied().unwrap_or("owner"),
        "Test Canvas",
        true,
    )
    .await
    .unwrap();

    CollabHub::new(config, db)
}

/// Register an in-memory session and hand back its frame receiver.
pub async fn join(
    hub: &SharedHub,
    connection_id: &str,
    user_id: &str,
) -> mpsc::UnboundedReceiver<SocketCommand> {
    let user = hub.db.get_user_by_id(user_id).await.unwrap().unwrap();
    let (tx, rx) = mpsc::unbounded_channel();
    hub.registry
        .register(Session::new(
            connection_id.to_string(),
            user,
            CANVAS_ID.to_string(),
            tx,
        ))
        .await;
    rx
}

pub async fn user(hub: &SharedHub, user_id: &str) -> UserRecord {
    hub.db.get_user_by_id(user_id).await.unwrap().unwrap()
}

/// Collect every frame currently sitting in a receiver.
pub fn drain(rx: &mut mpsc::UnboundedReceiver<SocketCommand>) -> Vec<ServerMessage> {
    let mut collected = Vec::new();
    while let Ok(command) = rx.try_recv() {
        if let SocketCommand::Frame(message) = command {
            collected.push(message);
        }
    }
    collected
}

pub async fn create_rectangle(hub: &SharedHub, creator: &str, x: f64, y: f64) -> ShapeRecord {
    let data: ShapeData = serde_json::from_value(serde_json::json!({
        "type": "rectangle", "x": x, "y": y, "width": 100.0, "height": 50.0
    }))
    .unwrap();
    hub.db.create_shape(CANVAS_ID, creator, &data).await.unwrap()
}

/// Config with short timings so lock expiry scenarios run in tens of
/// milliseconds instead of seconds.
pub fn fast_config() -> HubConfig {
    HubConfig {
        lock_ttl: Duration::from_millis(100),
        lock_sweep_interval: Duration::from_millis(20),
        batch_interval: Duration::from_millis(5),
        cursor_throttle: Duration::from_millis(25),
        shape_throttle: Duration::from_millis(33),
        ..HubConfig::default()
    }
}
