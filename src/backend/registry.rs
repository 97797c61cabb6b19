// ============================================================================
// REGISTRY - In-memory sessions and per-canvas subscription fabric
// ============================================================================

use crate::database::UserRecord;
use crate::events::ServerMessage;
use chrono::{DateTime, Utc};
use std::collections::{HashMap, HashSet};
use tokio::sync::{mpsc, RwLock};
use tracing::{debug, warn};

/// Commands consumed by a connection's writer task.
#[derive(Debug, Clone)]
pub enum SocketCommand {
    Frame(ServerMessage),
    Ping,
    Close { code: u16 },
}

/// One live authenticated connection, bound to exactly one canvas.
/// Sessions are in-memory only and referenced by connection id everywhere.
#[derive(Debug, Clone)]
pub struct Session {
    pub connection_id: String,
    pub user: UserRecord,
    pub canvas_id: String,
    pub sender: mpsc::UnboundedSender<SocketCommand>,
    pub is_alive: bool,
    pub connected_at: DateTime<Utc>,
}

impl Session {
    pub fn new(
        connection_id: String,
        user: UserRecord,
        canvas_id: String,
        sender: mpsc::UnboundedSender<SocketCommand>,
    ) -> Self {
        Self {
            connection_id,
            user,
            canvas_id,
            sender,
            is_alive: true,
            connected_at: Utc::now(),
        }
    }
}

#[derive(Debug, Default)]
struct RegistryInner {
    connections: HashMap<String, Session>,
    canvas_subscribers: HashMap<String, HashSet<String>>,
}

/// Holds `connection_id → Session` and `canvas_id → connections` under one
/// lock so both maps always change together.
#[derive(Debug, Default)]
pub struct SessionRegistry {
    inner: RwLock<RegistryInner>,
}

#[derive(Debug, Clone, serde::Serialize)]
pub struct RegistryStats {
    pub total_connections: usize,
    pub active_canvases: usize,
    pub connections_per_canvas: HashMap<String, usize>,
}

impl SessionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn register(&self, session: Session) {
        let mut inner = self.inner.write().await;

        inner
            .canvas_subscribers
            .entry(session.canvas_id.clone())
            .or_default()
            .insert(session.connection_id.clone());
        inner
            .connections
            .insert(session.connection_id.clone(), session);
    }

    /// Remove a connection from both maps; returns the session for the
    /// disconnect path.
    pub async fn unregister(&self, connection_id: &str) -> Option<Session> {
        let mut inner = self.inner.write().await;

        let session = inner.connections.remove(connection_id)?;
        if let Some(subscribers) = inner.canvas_subscribers.get_mut(&session.canvas_id) {
            subscribers.remove(connection_id);
            if subscribers.is_empty() {
                inner.canvas_subscribers.remove(&session.canvas_id);
            }
        }

        debug!(
            "Unregistered connection {} from canvas {}",
            connection_id, session.canvas_id
        );
        Some(session)
    }

    /// Re-target a live session to another canvas without reconnecting.
    pub async fn switch_canvas(&self, connection_id: &str, new_canvas_id: &str) -> bool {
        let mut inner = self.inner.write().await;

        let Some(old_canvas_id) = inner
            .connections
            .get(connection_id)
            .map(|s| s.canvas_id.clone())
        else {
            return false;
        };

        if let Some(subscribers) = inner.canvas_subscribers.get_mut(&old_canvas_id) {
            subscribers.remove(connection_id);
            if subscribers.is_empty() {
                inner.canvas_subscribers.remove(&old_canvas_id);
            }
        }
        inner
            .canvas_subscribers
            .entry(new_canvas_id.to_string())
            .or_default()
            .insert(connection_id.to_string());
        if let Some(session) = inner.connections.get_mut(connection_id) {
            session.canvas_id = new_canvas_id.to_string();
        }

        true
    }

    pub async fn session(&self, connection_id: &str) -> Option<Session> {
        self.inner.read().await.connections.get(connection_id).cloned()
    }

    pub async fn sender_for(
        &self,
        connection_id: &str,
    ) -> Option<mpsc::UnboundedSender<SocketCommand>> {
        self.inner
            .read()
            .await
            .connections
            .get(connection_id)
            .map(|s| s.sender.clone())
    }

    /// Subscribers of a canvas with open channels, optionally skipping one
    /// connection (the sender of a broadcast).
    pub async fn subscribers(
        &self,
        canvas_id: &str,
        exclude: Option<&str>,
    ) -> Vec<(String, mpsc::UnboundedSender<SocketCommand>)> {
        let inner = self.inner.read().await;

        let Some(ids) = inner.canvas_subscribers.get(canvas_id) else {
            return Vec::new();
        };

        ids.iter()
            .filter(|id| exclude != Some(id.as_str()))
            .filter_map(|id| inner.connections.get(id))
            .filter(|session| !session.sender.is_closed())
            .map(|session| (session.connection_id.clone(), session.sender.clone()))
            .collect()
    }

    /// Number of open sessions a user holds anywhere on the hub.
    /// Multi-tab: a user goes offline only when this reaches zero.
    pub async fn user_session_count(&self, user_id: &str) -> usize {
        self.inner
            .read()
            .await
            .connections
            .values()
            .filter(|s| s.user.id == user_id && !s.sender.is_closed())
            .count()
    }

    /// Canvases that currently have at least one subscriber; drives the
    /// lock sweep.
    pub async fn canvases_with_subscribers(&self) -> Vec<String> {
        self.inner
            .read()
            .await
            .canvas_subscribers
            .keys()
            .cloned()
            .collect()
    }

    pub async fn mark_alive(&self, connection_id: &str) {
        if let Some(session) = self
            .inner
            .write()
            .await
            .connections
            .get_mut(connection_id)
        {
            session.is_alive = true;
        }
    }

    /// One heartbeat tick: sessions that never answered the previous ping
    /// are told to close; everyone else is pinged and marked pending.
    /// Returns the connection ids that were terminated.
    pub async fn heartbeat_cycle(&self) -> Vec<String> {
        let mut inner = self.inner.write().await;
        let mut terminated = Vec::new();

        for session in inner.connections.values_mut() {
            if session.is_alive {
                session.is_alive = false;
                let _ = session.sender.send(SocketCommand::Ping);
            } else {
                warn!(
                    "Session {} missed heartbeat, terminating",
                    session.connection_id
                );
                let _ = session.sender.send(SocketCommand::Close { code: 1000 });
                terminated.push(session.connection_id.clone());
            }
        }

        terminated
    }

    /// Drop sessions whose channel is already closed; backstop for
    /// connections that died without running the disconnect path.
    pub async fn cleanup_stale(&self) -> Vec<Session> {
        let stale_ids: Vec<String> = {
            let inner = self.inner.read().await;
            inner
                .connections
                .values()
                .filter(|s| s.sender.is_closed())
                .map(|s| s.connection_id.clone())
                .collect()
        };

        let mut removed = Vec::with_capacity(stale_ids.len());
        for connection_id in stale_ids {
            if let Some(session) = self.unregister(&connection_id).await {
                removed.push(session);
            }
        }
        removed
    }

    /// Ask every connection to close; used for graceful shutdown.
    pub async fn close_all(&self, code: u16) {
        let inner = self.inner.read().await;
        for session in inner.connections.values() {
            let _ = session.sender.send(SocketCommand::Close { code });
        }
    }

    pub async fn stats(&self) -> RegistryStats {
        let inner = self.inner.read().await;

        RegistryStats {
            total_connections: inner.connections.len(),
            active_canvases: inner.canvas_subscribers.len(),
            connections_per_canvas: inner
                .canvas_subscribers
                .iter()
                .map(|(canvas_id, ids)| (canvas_id.clone(), ids.len()))
                .collect(),
        }
    }

    /// Live users of one canvas with their colors, for the HTTP surface.
    pub async fn canvas_users(&self, canvas_id: &str) -> Vec<UserRecord> {
        let inner = self.inner.read().await;

        let Some(ids) = inner.canvas_subscribers.get(canvas_id) else {
            return Vec::new();
        };

        let mut seen = HashSet::new();
        ids.iter()
            .filter_map(|id| inner.connections.get(id))
            .filter(|session| seen.insert(session.user.id.clone()))
            .map(|session| session.user.clone())
            .collect()
    }
}

// ============================================================================
// TESTS
// ============================================================================
