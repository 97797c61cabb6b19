// ============================================================================
// SHAPE HANDLERS - Create, update, delete and batch mutation of shapes
// ============================================================================

use crate::database::UserRecord;
use crate::events::{
    ServerMessage, ShapeData, ShapeDeletePayload, ShapeUpdatePayload, ShapesBatchUpdatePayload,
};
use crate::hub::{CollabHub, Priority};
use crate::locks::{self, LockRequest};
use chrono::Utc;
use tracing::{debug, info};

/// SHAPE_CREATE: validate, persist on top of the z stack, broadcast to
/// everyone including the creator so all clients see the authoritative
/// record.
pub async fn handle_shape_create(
    hub: &CollabHub,
    user: &UserRecord,
    canvas_id: &str,
    payload: serde_json::Value,
) -> Result<(), String> {
    let data: ShapeData =
        serde_json::from_value(payload).map_err(|e| format!("Invalid shape payload: {}", e))?;
    data.validate()?;

    let shape = hub
        .db
        .create_shape(canvas_id, &user.id, &data)
        .await
        .map_err(|e| format!("Failed to create shape: {}", e))?;

    info!(
        "Shape {} ({}) created by {} on canvas {}",
        shape.id, shape.shape_type, user.id, canvas_id
    );

    hub.caches.invalidate_shape(canvas_id, &shape.id).await;
    hub.broadcast(
        canvas_id,
        ServerMessage::ShapeCreate { shape },
        None,
        Priority::High,
    )
    .await;

    Ok(())
}

/// SHAPE_UPDATE: run the lock state machine, desugar `isLocked`, persist,
/// then broadcast. Lock transitions go out immediately; plain geometry
/// traffic is gated per shape and batched.
pub async fn handle_shape_update(
    hub: &CollabHub,
    connection_id: &str,
    user: &UserRecord,
    canvas_id: &str,
    payload: serde_json::Value,
) -> Result<(), String> {
    let request: ShapeUpdatePayload =
        serde_json::from_value(payload).map_err(|e| format!("Invalid update payload: {}", e))?;
    request.updates.validate()?;

    let Some(current) = hub
        .db
        .get_shape_by_id(&request.shape_id)
        .await
        .map_err(|e| format!("Failed to load shape: {}", e))?
    else {
        return Err(format!("Shape not found: {}", request.shape_id));
    };

    let lock_request = LockRequest::from_flag(request.updates.is_locked);
    let lock_write = match locks::decide(
        &current,
        lock_request,
        &user.id,
        Utc::now(),
        hub.config.lock_ttl,
    ) {
        Ok(write) => write,
        Err(conflict) => {
            debug!(
                "Rejected update on {} from {}: locked by {}",
                current.id, user.id, conflict.held_by
            );
            reject_with_snapshot(hub, connection_id, current).await;
            return Ok(());
        }
    };

    let is_lock_transition = request.updates.is_lock_transition();

    let Some(shape) = hub
        .db
        .update_shape(&request.shape_id, &user.id, &request.updates, lock_write)
        .await
        .map_err(|e| format!("Failed to update shape: {}", e))?
    else {
        return Err(format!("Shape not found: {}", request.shape_id));
    };

    hub.caches.invalidate_shape(canvas_id, &shape.id).await;

    if is_lock_transition {
        // lock and unlock frames bypass the shape throttle
        hub.broadcast(
            canvas_id,
            ServerMessage::ShapeUpdate { shape },
            None,
            Priority::High,
        )
        .await;
        return Ok(());
    }

    let gate_key = (canvas_id.to_string(), shape.id.clone());
    if hub.shape_gate.admit(gate_key).await {
        hub.broadcast(
            canvas_id,
            ServerMessage::ShapeUpdate { shape },
            None,
            Priority::Low,
        )
        .await;
    } else {
        // write persisted above; only the broadcast is coalesced away
        debug!("Shape {} update broadcast throttled", shape.id);
    }

    Ok(())
}

/// SHAPE_DELETE: soft-delete one id or a list, then announce the ids.
pub async fn handle_shape_delete(
    hub: &CollabHub,
    user: &UserRecord,
    canvas_id: &str,
    payload: serde_json::Value,
) -> Result<(), String> {
    let request: ShapeDeletePayload =
        serde_json::from_value(payload).map_err(|e| format!("Invalid delete payload: {}", e))?;

    let ids = request.ids();
    if ids.is_empty() {
        return Err("shapeId or shapeIds required".to_string());
    }

    let deleted = hub
        .db
        .delete_shapes(&ids)
        .await
        .map_err(|e| format!("Failed to delete shapes: {}", e))?;
    if deleted.is_empty() {
        return Err("No matching shapes found".to_string());
    }

    info!(
        "{} deleted {} shapes on canvas {}",
        user.id,
        deleted.len(),
        canvas_id
    );

    for shape_id in &deleted {
        hub.caches.invalidate_shape(canvas_id, shape_id).await;
    }
    hub.broadcast(
        canvas_id,
        ServerMessage::ShapeDelete { shape_ids: deleted },
        None,
        Priority::High,
    )
    .await;

    Ok(())
}

/// SHAPES_BATCH_UPDATE: bounded list of `{id, data}` entries. Every entry
/// passes the same validation and lock checks as a single update; the
/// resulting shape list goes out as one broadcast to all subscribers.
pub async fn handle_batch_update(
    hub: &CollabHub,
    connection_id: &str,
    user: &UserRecord,
    canvas_id: &str,
    payload: serde_json::Value,
) -> Result<(), String> {
    let request: ShapesBatchUpdatePayload =
        serde_json::from_value(payload).map_err(|e| format!("Invalid batch payload: {}", e))?;

    if request.updates.len() > hub.config.max_batch_update {
        return Err(format!(
            "Batch updates limited to {} items",
            hub.config.max_batch_update
        ));
    }

    // validate everything before touching the store
    for entry in &request.updates {
        entry.data.validate()?;
    }

    let now = Utc::now();
    let mut writable = Vec::with_capacity(request.updates.len());
    for entry in request.updates {
        let Some(current) = hub
            .db
            .get_shape_by_id(&entry.id)
            .await
            .map_err(|e| format!("Failed to load shape: {}", e))?
        else {
            debug!("Batch entry skipped, shape {} missing", entry.id);
            continue;
        };

        match locks::decide(
            &current,
            LockRequest::from_flag(entry.data.is_locked),
            &user.id,
            now,
            hub.config.lock_ttl,
        ) {
            Ok(lock_write) => writable.push((entry.id, entry.data, lock_write)),
            Err(conflict) => {
                debug!(
                    "Batch entry for {} rejected: locked by {}",
                    current.id, conflict.held_by
                );
                reject_with_snapshot(hub, connection_id, current).await;
            }
        }
    }

    if writable.is_empty() {
        return Ok(());
    }

    let shapes = hub
        .db
        .batch_update_shapes(writable, &user.id)
        .await
        .map_err(|e| format!("Failed to apply batch update: {}", e))?;

    for shape in &shapes {
        hub.caches.invalidate_shape(canvas_id, &shape.id).await;
    }
    hub.broadcast(
        canvas_id,
        ServerMessage::ShapesBatchUpdate { shapes },
        None,
        Priority::High,
    )
    .await;

    Ok(())
}

/// Conflict reply: an ERROR plus the authoritative shape snapshot so the
/// caller can roll back its optimistic change. Only the caller sees this.
async fn reject_with_snapshot(
    hub: &CollabHub,
    connection_id: &str,
    shape: crate::database::ShapeRecord,
) {
    hub.send_to_connection(
        connection_id,
        ServerMessage::error_with_code("Shape is locked by another user", "CONFLICT"),
    )
    .await;
    hub.send_to_connection(connection_id, ServerMessage::ShapeUpdate { shape })
        .await;
}

// ============================================================================
// TESTS
// ============================================================================
