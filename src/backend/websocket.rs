// ============================================================================
// WEBSOCKET HANDLER - Session lifecycle and message routing for the hub
// ============================================================================

use crate::app_state::AppState;
use crate::auth::{resolve_identity, validate_jwt, Credentials};
use crate::database::UserRecord;
use crate::events::{
    self, ActiveUser, CanvasUpdatePayload, CursorMovePayload, InboundFrame, PresenceUpdatePayload,
    ServerMessage, SwitchCanvasPayload,
};
use crate::hub::{Priority, SharedHub};
use crate::presence;
use crate::registry::{Session, SocketCommand};
use crate::shape_handlers;

use axum::{
    extract::{
        ws::{CloseFrame, Message, WebSocket, WebSocketUpgrade},
        Query, State,
    },
    http::{HeaderMap, StatusCode},
    response::Response,
};
use axum_extra::extract::CookieJar;
use futures::{sink::SinkExt, stream::StreamExt};
use serde::Deserialize;
use std::borrow::Cow;
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};

// WebSocket close codes used by the hub.
const CLOSE_POLICY: u16 = 1008;
const CLOSE_INTERNAL: u16 = 1011;

#[derive(Debug, Deserialize)]
pub struct ConnectParams {
    pub token: Option<String>,
    #[serde(rename = "canvasId")]
    pub canvas_id: Option<String>,
    #[serde(rename = "userId")]
    pub user_id: Option<String>,
}

// ============================================================================
// UPGRADE HANDLER
// ============================================================================

/// WebSocket upgrade endpoint. Route: GET /ws
/// Credentials and canvas id come from the URL; full admission runs on
/// the upgraded socket so failures can use proper close codes.
pub async fn websocket_handler(
    ws: WebSocketUpgrade,
    State(state): State<AppState>,
    Query(params): Query<ConnectParams>,
    headers: HeaderMap,
    cookie_jar: CookieJar,
) -> Response {
    let protocol_header = headers
        .get("sec-websocket-protocol")
        .and_then(|v| v.to_str().ok())
        .map(|v| v.to_string());
    let cookie_token = cookie_jar.get("auth_token").map(|c| c.value().to_string());

    let credentials =
        extract_credentials(params.token, protocol_header, cookie_token, params.user_id);
    let canvas_id = params.canvas_id.unwrap_or_default();

    ws.on_upgrade(move |socket| handle_connection(socket, state.hub, credentials, canvas_id))
}

/// Pick the credential source in priority order: token query parameter,
/// `Bearer.<token>` sub-protocol, auth cookie, dev-mode userId.
fn extract_credentials(
    query_token: Option<String>,
    protocol_header: Option<String>,
    cookie_token: Option<String>,
    dev_user_id: Option<String>,
) -> Credentials {
    if let Some(token) = query_token {
        return Credentials::Token(token);
    }

    if let Some(header) = protocol_header {
        for protocol in header.split(',') {
            if let Some(token) = protocol.trim().strip_prefix("Bearer.") {
                return Credentials::Token(token.to_string());
            }
        }
    }

    if let Some(token) = cookie_token {
        return Credentials::Token(token);
    }

    match dev_user_id {
        Some(user_id) => Credentials::DevUserId(user_id),
        None => Credentials::Missing,
    }
}

fn generate_connection_id(user_id: &str) -> String {
    use std::collections::hash_map::DefaultHasher;
    use std::hash::{Hash, Hasher};

    let mut hasher = DefaultHasher::new();
    user_id.hash(&mut hasher);
    let unique = uuid::Uuid::new_v4().to_string()[..8].to_string();

    format!("conn-{:x}-{}", hasher.finish(), unique)
}

// ============================================================================
// CONNECTION HANDLING
// ============================================================================

/// Reject an un-admitted socket: one ERROR frame, then close.
async fn reject(mut socket: WebSocket, code: u16, message: &str) {
    warn!("Admission rejected ({}): {}", code, message);

    if let Ok(json) = serde_json::to_string(&ServerMessage::error(message)) {
        let _ = socket.send(Message::Text(json)).await;
    }
    let _ = socket
        .send(Message::Close(Some(CloseFrame {
            code,
            reason: Cow::from(message.to_string()),
        })))
        .await;
}

async fn handle_connection(
    socket: WebSocket,
    hub: SharedHub,
    credentials: Credentials,
    canvas_id: String,
) {
    // --- admission -------------------------------------------------------
    if events::validate_canvas_id(&canvas_id).is_err() {
        return reject(socket, CLOSE_POLICY, "Invalid canvas id").await;
    }

    let identity = match resolve_identity(&credentials, hub.config.dev_mode) {
        Ok(identity) => identity,
        Err(message) => return reject(socket, CLOSE_POLICY, &message).await,
    };

    match hub.db.check_access(&canvas_id, &identity.user_id).await {
        Ok(true) => {}
        Ok(false) => return reject(socket, CLOSE_POLICY, "Canvas access denied").await,
        Err(e) => {
            error!("Access check failed: {}", e);
            return reject(socket, CLOSE_INTERNAL, "Internal server error").await;
        }
    }

    let user = match hub.db.get_or_create_user(&identity).await {
        Ok(user) => user,
        Err(e) => {
            error!("User lookup failed: {}", e);
            return reject(socket, CLOSE_INTERNAL, "Internal server error").await;
        }
    };

    let connection_id = generate_connection_id(&user.id);
    info!(
        "User {} ({}) joined canvas {} as {}",
        user.display_name, user.id, canvas_id, connection_id
    );

    // --- socket plumbing -------------------------------------------------
    let (mut ws_sender, mut ws_receiver) = socket.split();
    let (tx, mut rx) = mpsc::unbounded_channel::<SocketCommand>();

    let writer_connection_id = connection_id.clone();
    let writer_task = tokio::spawn(async move {
        while let Some(command) = rx.recv().await {
            match command {
                SocketCommand::Frame(message) => match serde_json::to_string(&message) {
                    Ok(json) => {
                        if ws_sender.send(Message::Text(json)).await.is_err() {
                            break;
                        }
                    }
                    Err(e) => error!("Failed to serialize frame: {}", e),
                },
                SocketCommand::Ping => {
                    if ws_sender.send(Message::Ping(Vec::new())).await.is_err() {
                        break;
                    }
                }
                SocketCommand::Close { code } => {
                    let _ = ws_sender
                        .send(Message::Close(Some(CloseFrame {
                            code,
                            reason: Cow::from(""),
                        })))
                        .await;
                    break;
                }
            }
        }
        debug!("Writer task ended for {}", writer_connection_id);
    });

    // --- registration, never left half-done ------------------------------
    hub.registry
        .register(Session::new(
            connection_id.clone(),
            user.clone(),
            canvas_id.clone(),
            tx.clone(),
        ))
        .await;

    if let Err(e) = presence::upsert_initial_presence(&hub, &connection_id, &user, &canvas_id).await
    {
        error!("Initial presence write failed: {}", e);
        hub.registry.unregister(&connection_id).await;
        let _ = tx.send(SocketCommand::Frame(ServerMessage::error(
            "Internal server error",
        )));
        let _ = tx.send(SocketCommand::Close {
            code: CLOSE_INTERNAL,
        });
        return;
    }

    if let Err(message) = send_canvas_sync(&hub, &connection_id, &canvas_id).await {
        error!("Initial sync failed for {}: {}", connection_id, message);
        hub.registry.unregister(&connection_id).await;
        if let Err(e) = hub.db.remove_presence_by_connection(&connection_id).await {
            warn!("Presence rollback failed: {}", e);
        }
        let _ = tx.send(SocketCommand::Frame(ServerMessage::error(message.clone())));
        let _ = tx.send(SocketCommand::Close {
            code: CLOSE_INTERNAL,
        });
        return;
    }

    hub.broadcast(
        &canvas_id,
        ServerMessage::UserJoin {
            user: active_user_for(&user),
        },
        Some(&connection_id),
        Priority::High,
    )
    .await;
    hub.broadcast_active_users(&canvas_id).await;

    // --- read loop --------------------------------------------------------
    // The session's canvas can change via SWITCH_CANVAS; this local copy
    // stays in sync with the registry entry.
    let mut current_canvas = canvas_id;

    while let Some(message) = ws_receiver.next().await {
        match message {
            Ok(Message::Text(text)) => {
                match dispatch_frame(&hub, &connection_id, &user, &current_canvas, &text).await {
                    Ok(Some(new_canvas)) => current_canvas = new_canvas,
                    Ok(None) => {}
                    Err(message) => {
                        debug!("Rejected frame from {}: {}", connection_id, message);
                        hub.send_to_connection(
                            &connection_id,
                            ServerMessage::error_with_code(message, "VALIDATION"),
                        )
                        .await;
                    }
                }
            }
            Ok(Message::Pong(_)) => {
                hub.registry.mark_alive(&connection_id).await;
                if let Err(e) = hub.db.refresh_heartbeat(&connection_id).await {
                    debug!("Heartbeat refresh failed: {}", e);
                }
            }
            Ok(Message::Ping(_)) => {
                // transport answers with a pong; still counts as liveness
                hub.registry.mark_alive(&connection_id).await;
            }
            Ok(Message::Close(_)) => {
                info!("Connection {} closed by client", connection_id);
                break;
            }
            Ok(Message::Binary(_)) => {
                warn!("Unexpected binary frame from {}", connection_id);
            }
            Err(e) => {
                debug!("WebSocket error on {}: {}", connection_id, e);
                break;
            }
        }
    }

    // --- disconnect path --------------------------------------------------
    if let Some(session) = hub.registry.unregister(&connection_id).await {
        hub.handle_departure(&session).await;
    }
    writer_task.abort();
}

// ============================================================================
// MESSAGE ROUTER
// ============================================================================

/// Route one inbound frame. Identity and canvas always come from the
/// session, never from the payload. Returns the new canvas id after a
/// successful SWITCH_CANVAS.
async fn dispatch_frame(
    hub: &SharedHub,
    connection_id: &str,
    user: &UserRecord,
    canvas_id: &str,
    text: &str,
) -> Result<Option<String>, String> {
    let frame: InboundFrame =
        serde_json::from_str(text).map_err(|e| format!("Invalid message: {}", e))?;

    match frame.kind.as_str() {
        "PING" => {
            presence::handle_ping(hub, connection_id).await;
        }

        "CURSOR_MOVE" => {
            let payload: CursorMovePayload = serde_json::from_value(frame.payload)
                .map_err(|e| format!("Invalid cursor payload: {}", e))?;
            presence::handle_cursor_move(hub, connection_id, user, canvas_id, payload).await;
        }

        "SHAPE_CREATE" => {
            shape_handlers::handle_shape_create(hub, user, canvas_id, frame.payload).await?;
        }

        "SHAPE_UPDATE" => {
            shape_handlers::handle_shape_update(hub, connection_id, user, canvas_id, frame.payload)
                .await?;
        }

        "SHAPE_DELETE" => {
            shape_handlers::handle_shape_delete(hub, user, canvas_id, frame.payload).await?;
        }

        "SHAPES_BATCH_UPDATE" => {
            shape_handlers::handle_batch_update(hub, connection_id, user, canvas_id, frame.payload)
                .await?;
        }

        "CANVAS_SYNC_REQUEST" | "RECONNECT_REQUEST" => {
            send_canvas_sync(hub, connection_id, canvas_id).await?;
        }

        "PRESENCE_UPDATE" => {
            let payload: PresenceUpdatePayload = serde_json::from_value(frame.payload)
                .map_err(|e| format!("Invalid presence payload: {}", e))?;
            presence::handle_presence_update(hub, connection_id, user, canvas_id, payload).await?;
        }

        "CANVAS_UPDATE" => {
            handle_canvas_update(hub, user, canvas_id, frame.payload).await?;
        }

        "SWITCH_CANVAS" => {
            let payload: SwitchCanvasPayload = serde_json::from_value(frame.payload)
                .map_err(|e| format!("Invalid switch payload: {}", e))?;
            let new_canvas =
                handle_switch_canvas(hub, connection_id, user, canvas_id, payload).await?;
            return Ok(Some(new_canvas));
        }

        unknown => {
            debug!("Ignoring unknown message type: {}", unknown);
        }
    }

    Ok(None)
}

// ============================================================================
// SYNC, CANVAS AND SWITCH HANDLERS
// ============================================================================

fn active_user_for(user: &UserRecord) -> ActiveUser {
    ActiveUser {
        user_id: user.id.clone(),
        username: user.username.clone(),
        display_name: user.display_name.clone(),
        email: user.email.clone(),
        color: user.avatar_color.clone(),
        cursor_x: 0.0,
        cursor_y: 0.0,
        selected_object_ids: Vec::new(),
        is_active: true,
    }
}

/// Assemble the point-in-time snapshot and reply to the requester only.
/// The three reads are issued concurrently.
pub async fn send_canvas_sync(
    hub: &SharedHub,
    connection_id: &str,
    canvas_id: &str,
) -> Result<(), String> {
    let (canvas, shapes, active_users) = tokio::join!(
        hub.caches.get_canvas(&hub.db, canvas_id),
        hub.caches.get_shapes(&hub.db, canvas_id),
        hub.db.get_active_users(canvas_id, hub.heartbeat_cutoff()),
    );

    let canvas = canvas
        .map_err(|e| format!("Failed to load canvas: {}", e))?
        .ok_or_else(|| format!("Canvas not found: {}", canvas_id))?;
    let shapes = shapes.map_err(|e| format!("Failed to load shapes: {}", e))?;
    let active_users = active_users.map_err(|e| format!("Failed to load users: {}", e))?;

    hub.send_to_connection(
        connection_id,
        ServerMessage::CanvasSync {
            canvas,
            shapes,
            active_users,
        },
    )
    .await;

    let db = hub.db.clone();
    let canvas_id = canvas_id.to_string();
    tokio::spawn(async move {
        if let Err(e) = db.update_last_accessed(&canvas_id).await {
            debug!("last_accessed update failed: {}", e);
        }
    });

    Ok(())
}

/// CANVAS_UPDATE: persist the whitelisted fields and tell everyone,
/// including the sender.
pub async fn handle_canvas_update(
    hub: &SharedHub,
    user: &UserRecord,
    canvas_id: &str,
    payload: serde_json::Value,
) -> Result<(), String> {
    let request: CanvasUpdatePayload =
        serde_json::from_value(payload).map_err(|e| format!("Invalid canvas payload: {}", e))?;

    if request.updates.is_empty() {
        return Err("No updatable canvas fields supplied".to_string());
    }
    request.updates.validate()?;

    let updated = hub
        .db
        .update_canvas(canvas_id, &request.updates)
        .await
        .map_err(|e| format!("Failed to update canvas: {}", e))?;
    if updated.is_none() {
        return Err(format!("Canvas not found: {}", canvas_id));
    }

    info!("Canvas {} updated by {}", canvas_id, user.id);
    hub.caches.invalidate_canvas(canvas_id).await;

    hub.broadcast(
        canvas_id,
        ServerMessage::CanvasUpdate {
            canvas_id: canvas_id.to_string(),
            updates: request.updates,
        },
        None,
        Priority::High,
    )
    .await;

    Ok(())
}

/// SWITCH_CANVAS: re-target a live session without reconnecting.
pub async fn handle_switch_canvas(
    hub: &SharedHub,
    connection_id: &str,
    user: &UserRecord,
    old_canvas_id: &str,
    payload: SwitchCanvasPayload,
) -> Result<String, String> {
    let new_canvas_id = payload.canvas_id;

    events::validate_canvas_id(&new_canvas_id)?;
    if new_canvas_id == old_canvas_id {
        return Err("Already subscribed to this canvas".to_string());
    }

    match hub.db.check_access(&new_canvas_id, &user.id).await {
        Ok(true) => {}
        Ok(false) => return Err("Canvas access denied".to_string()),
        Err(e) => return Err(format!("Access check failed: {}", e)),
    }

    // leave the old canvas
    if let Err(e) = hub.db.remove_presence_by_connection(connection_id).await {
        warn!("Presence removal on switch failed: {}", e);
    }
    if !hub.registry.switch_canvas(connection_id, &new_canvas_id).await {
        return Err("Session no longer registered".to_string());
    }

    hub.broadcast(
        old_canvas_id,
        ServerMessage::UserLeave {
            user_id: user.id.clone(),
            display_name: user.display_name.clone(),
            color: user.avatar_color.clone(),
        },
        None,
        Priority::High,
    )
    .await;
    hub.broadcast_active_users(old_canvas_id).await;

    // join the new one
    presence::upsert_initial_presence(hub, connection_id, user, &new_canvas_id)
        .await
        .map_err(|e| format!("Presence write failed: {}", e))?;

    hub.broadcast(
        &new_canvas_id,
        ServerMessage::UserJoin {
            user: active_user_for(user),
        },
        Some(connection_id),
        Priority::High,
    )
    .await;
    hub.broadcast_active_users(&new_canvas_id).await;

    hub.send_to_connection(
        connection_id,
        ServerMessage::CanvasSwitched {
            canvas_id: new_canvas_id.clone(),
        },
    )
    .await;
    send_canvas_sync(hub, connection_id, &new_canvas_id).await?;

    info!(
        "Connection {} switched from {} to {}",
        connection_id, old_canvas_id, new_canvas_id
    );
    Ok(new_canvas_id)
}

// ============================================================================
// HTTP SURFACE - stats and live user lists
// ============================================================================

fn authorize_http(
    cookie_jar: &CookieJar,
    params: &StatsParams,
    dev_mode: bool,
) -> Result<(), StatusCode> {
    let token = params
        .token
        .clone()
        .or_else(|| cookie_jar.get("auth_token").map(|c| c.value().to_string()));

    match token {
        Some(token) => validate_jwt(&token)
            .map(|_| ())
            .map_err(|_| StatusCode::UNAUTHORIZED),
        None if dev_mode => Ok(()),
        None => Err(StatusCode::UNAUTHORIZED),
    }
}

#[derive(Debug, Deserialize)]
pub struct StatsParams {
    pub token: Option<String>,
}

/// GET /api/ws/stats - connection counts for monitoring.
pub async fn websocket_stats_handler(
    State(state): State<AppState>,
    Query(params): Query<StatsParams>,
    cookie_jar: CookieJar,
) -> Result<axum::Json<serde_json::Value>, StatusCode> {
    authorize_http(&cookie_jar, &params, state.hub.config.dev_mode)?;

    let stats = state.hub.registry.stats().await;
    Ok(axum::Json(serde_json::json!({
        "websocket_stats": stats
    })))
}

/// GET /api/canvas/:id/users - live users of one canvas.
pub async fn canvas_users_handler(
    axum::extract::Path(canvas_id): axum::extract::Path<String>,
    State(state): State<AppState>,
    Query(params): Query<StatsParams>,
    cookie_jar: CookieJar,
) -> Result<axum::Json<serde_json::Value>, StatusCode> {
    authorize_http(&cookie_jar, &params, state.hub.config.dev_mode)?;

    let users = state.hub.registry.canvas_users(&canvas_id).await;
    Ok(axum::Json(serde_json::json!({
        "canvasId": canvas_id,
        "users": users,
    })))
}

// ============================================================================
// TESTS
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_credential_priority_order() {
        let creds = extract_credentials(
            Some("query-token".to_string()),
            Some("Bearer.header-token".to_string()),
            Some("cookie-token".to_string()),
            Some("dev-user".to_string()),
        );
        assert!(matches!(creds, Credentials::Token(t) if t == "query-token"));

        let creds = extract_credentials(
            None,
            Some("chat, Bearer.header-token".to_string()),
            Some("cookie-token".to_string()),
            None,
        );
        assert!(matches!(creds, Credentials::Token(t) if t == "header-token"));

        let creds = extract_credentials(None, None, Some("cookie-token".to_string()), None);
        assert!(matches!(creds, Credentials::Token(t) if t == "cookie-token"));

        let creds = extract_credentials(None, None, None, Some("dev-user".to_string()));
        assert!(matches!(creds, Credentials::DevUserId(u) if u == "dev-user"));

        let creds = extract_credentials(None, None, None, None);
        assert!(matches!(creds, Credentials::Missing));
    }

    #[test]
    fn test_connection_ids_are_unique_per_call() {
        let first = generate_connection_id("alice");
        let second = generate_connection_id("alice");

        assert!(first.starts_with("conn-"));
        assert_ne!(first, second);
    }
}
