// ============================================================================
// HUB - Per-canvas realtime coordinator: broadcast, timers, shutdown
// ============================================================================

use crate::cache::CanvasCaches;
use crate::config::HubConfig;
use crate::database::DatabaseManager;
use crate::events::ServerMessage;
use crate::locks;
use crate::registry::{Session, SessionRegistry, SocketCommand};
use crate::throttle::{BatchQueues, ThrottleGate};
use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{watch, Mutex, RwLock};
use tokio::time::Instant;
use tracing::{debug, error, info, warn};

/// Broadcast delivery class. High frames are flushed through immediately;
/// low frames ride the per-recipient batch until the next frame tick.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Priority {
    High,
    Low,
}

/// Owns every process-local routing structure and the four periodic
/// loops. Constructed once at startup with explicit dependencies; all
/// timers stop on shutdown.
pub struct CollabHub {
    pub config: HubConfig,
    pub db: Arc<DatabaseManager>,
    pub caches: CanvasCaches,
    pub registry: SessionRegistry,
    pub batches: BatchQueues,
    pub cursor_gate: ThrottleGate<String>,
    pub shape_gate: ThrottleGate<(String, String)>,
    /// user id → last cursor activity, read by the lock sweep.
    activity: RwLock<HashMap<String, Instant>>,
    shutdown_tx: watch::Sender<bool>,
    tasks: Mutex<Vec<tokio::task::JoinHandle<()>>>,
}

pub type SharedHub = Arc<CollabHub>;

impl CollabHub {
    pub fn new(config: HubConfig, db: Arc<DatabaseManager>) -> SharedHub {
        let (shutdown_tx, _) = watch::channel(false);

        Arc::new(Self {
            caches: CanvasCaches::new(config.cache_ttl),
            cursor_gate: ThrottleGate::new(config.cursor_throttle),
            shape_gate: ThrottleGate::new(config.shape_throttle),
            registry: SessionRegistry::new(),
            batches: BatchQueues::new(),
            activity: RwLock::new(HashMap::new()),
            shutdown_tx,
            tasks: Mutex::new(Vec::new()),
            config,
            db,
        })
    }

    // ========================================================================
    // ACTIVITY TRACKING
    // ========================================================================

    pub async fn touch_activity(&self, user_id: &str) {
        self.activity
            .write()
            .await
            .insert(user_id.to_string(), Instant::now());
    }

    pub async fn last_activity(&self, user_id: &str) -> Option<Instant> {
        self.activity.read().await.get(user_id).copied()
    }

    pub async fn clear_activity(&self, user_id: &str) {
        self.activity.write().await.remove(user_id);
    }

    // ========================================================================
    // BROADCAST
    // ========================================================================

    /// Fan a message out to every subscriber of a canvas, skipping the
    /// excluded connection and closed sockets.
    pub async fn broadcast(
        &self,
        canvas_id: &str,
        message: ServerMessage,
        exclude: Option<&str>,
        priority: Priority,
    ) {
        let recipients = self.registry.subscribers(canvas_id, exclude).await;

        for (connection_id, sender) in recipients {
            match priority {
                Priority::High => {
                    self.batches
                        .send_flushed(&connection_id, &sender, message.clone())
                        .await;
                }
                Priority::Low => {
                    self.batches.enqueue(&connection_id, message.clone()).await;
                }
            }
        }
    }

    /// High-priority direct send to a single connection, preserving the
    /// recipient's FIFO order.
    pub async fn send_to_connection(&self, connection_id: &str, message: ServerMessage) {
        if let Some(sender) = self.registry.sender_for(connection_id).await {
            self.batches
                .send_flushed(connection_id, &sender, message)
                .await;
        }
    }

    /// Assemble the live user list of a canvas and broadcast it to every
    /// subscriber.
    pub async fn broadcast_active_users(&self, canvas_id: &str) {
        match self
            .db
            .get_active_users(canvas_id, self.heartbeat_cutoff())
            .await
        {
            Ok(users) => {
                self.broadcast(
                    canvas_id,
                    ServerMessage::ActiveUsers { users },
                    None,
                    Priority::High,
                )
                .await;
            }
            Err(e) => error!("Failed to load active users for {}: {}", canvas_id, e),
        }
    }

    pub fn heartbeat_cutoff(&self) -> DateTime<Utc> {
        Utc::now() - chrono_duration(self.config.presence_ttl)
    }

    fn lock_cutoff(&self) -> DateTime<Utc> {
        Utc::now() - chrono_duration(self.config.lock_ttl)
    }

    // ========================================================================
    // DISCONNECT PATH
    // ========================================================================

    /// Shared teardown after a session left the registry, used by the
    /// socket close path and the stale-connection sweep.
    pub async fn handle_departure(&self, session: &Session) {
        let connection_id = &session.connection_id;
        let user = &session.user;
        let canvas_id = &session.canvas_id;

        self.batches.remove(connection_id).await;
        self.cursor_gate.forget(&connection_id.to_string()).await;

        if let Err(e) = self.db.remove_presence_by_connection(connection_id).await {
            warn!("Failed to remove presence for {}: {}", connection_id, e);
        }

        // last session of this user anywhere: offline + release locks here
        if self.registry.user_session_count(&user.id).await == 0 {
            if let Err(e) = self.db.set_user_online(&user.id, false).await {
                warn!("Failed to mark {} offline: {}", user.id, e);
            }
            self.clear_activity(&user.id).await;

            match self.db.unlock_shapes_by_user(&user.id, canvas_id).await {
                Ok(released) => {
                    for shape in released {
                        self.caches.invalidate_shape(canvas_id, &shape.id).await;
                        self.broadcast(
                            canvas_id,
                            ServerMessage::ShapeUpdate { shape },
                            None,
                            Priority::High,
                        )
                        .await;
                    }
                }
                Err(e) => warn!("Failed to release locks for {}: {}", user.id, e),
            }
        }

        self.broadcast(
            canvas_id,
            ServerMessage::UserLeave {
                user_id: user.id.clone(),
                display_name: user.display_name.clone(),
                color: user.avatar_color.clone(),
            },
            None,
            Priority::High,
        )
        .await;
        self.broadcast_active_users(canvas_id).await;

        info!(
            "Connection {} (user {}) left canvas {}",
            connection_id, user.id, canvas_id
        );
    }

    // ========================================================================
    // TIMER LOOPS
    // ========================================================================

    /// Spawn the batch flush, lock sweep, presence cleanup and heartbeat
    /// loops. Each loop exits on the shutdown signal.
    pub async fn start(self: Arc<Self>) {
        let mut tasks = self.tasks.lock().await;

        tasks.push(spawn_loop(
            self.clone(),
            self.config.batch_interval,
            |hub| async move { hub.flush_tick().await },
        ));
        tasks.push(spawn_loop(
            self.clone(),
            self.config.lock_sweep_interval,
            |hub| async move { hub.lock_sweep_tick().await },
        ));
        tasks.push(spawn_loop(
            self.clone(),
            self.config.presence_cleanup_interval,
            |hub| async move { hub.presence_cleanup_tick().await },
        ));
        tasks.push(spawn_loop(
            self.clone(),
            self.config.heartbeat_interval,
            |hub| async move { hub.heartbeat_tick().await },
        ));

        info!("Collab hub started with {} timer loops", tasks.len());
    }

    /// Stop the timers, flush what is still queued and close every socket
    /// with a normal-closure code.
    pub async fn shutdown(&self) {
        info!("Shutting down collab hub");
        let _ = self.shutdown_tx.send(true);

        let tasks: Vec<_> = self.tasks.lock().await.drain(..).collect();
        for task in tasks {
            if let Err(e) = task.await {
                debug!("Timer loop ended with join error: {}", e);
            }
        }

        self.flush_tick().await;
        self.registry.close_all(1000).await;
    }

    pub fn shutdown_signal(&self) -> watch::Receiver<bool> {
        self.shutdown_tx.subscribe()
    }

    /// Frame tick: hand every queued low-priority message to its
    /// recipient. Only copies and channel writes, never store I/O.
    pub async fn flush_tick(&self) {
        let senders: HashMap<String, tokio::sync::mpsc::UnboundedSender<SocketCommand>> = {
            let mut map = HashMap::new();
            for canvas_id in self.registry.canvases_with_subscribers().await {
                for (connection_id, sender) in self.registry.subscribers(&canvas_id, None).await {
                    map.insert(connection_id, sender);
                }
            }
            map
        };

        self.batches.flush_with(&senders).await;
    }

    /// Release expired locks on every canvas that has subscribers, but
    /// only when the holder's cursor has also been idle for the TTL.
    pub async fn lock_sweep_tick(&self) {
        let cutoff = self.lock_cutoff();

        for canvas_id in self.registry.canvases_with_subscribers().await {
            let expired = match self.db.get_expired_locks(&canvas_id, cutoff).await {
                Ok(shapes) => shapes,
                Err(e) => {
                    error!("Lock sweep query failed for {}: {}", canvas_id, e);
                    continue;
                }
            };

            for shape in expired {
                let holder = match &shape.locked_by {
                    Some(holder) => holder.clone(),
                    None => continue,
                };

                if !locks::holder_idle(self.last_activity(&holder).await, self.config.lock_ttl) {
                    debug!(
                        "Keeping expired lock on {} for active holder {}",
                        shape.id, holder
                    );
                    continue;
                }

                match self.db.clear_lock(&shape.id).await {
                    Ok(Some(released)) => {
                        info!("Lock sweep released shape {} held by {}", released.id, holder);
                        self.caches.invalidate_shape(&canvas_id, &released.id).await;
                        self.broadcast(
                            &canvas_id,
                            ServerMessage::ShapeUpdate { shape: released },
                            None,
                            Priority::High,
                        )
                        .await;
                    }
                    Ok(None) => {}
                    Err(e) => error!("Failed to release lock on {}: {}", shape.id, e),
                }
            }
        }
    }

    /// Evict presence rows that stopped heartbeating and refresh the user
    /// lists of the affected canvases.
    pub async fn presence_cleanup_tick(&self) {
        let cutoff = self.heartbeat_cutoff();

        match self.db.cleanup_stale_presence(cutoff).await {
            Ok(canvases) => {
                for canvas_id in canvases {
                    info!("Evicted stale presence on canvas {}", canvas_id);
                    self.broadcast_active_users(&canvas_id).await;
                }
            }
            Err(e) => error!("Presence cleanup failed: {}", e),
        }
    }

    /// Ping all sessions, terminate the ones that missed the previous
    /// cycle, and sweep registry entries whose channels already died.
    pub async fn heartbeat_tick(&self) {
        let terminated = self.registry.heartbeat_cycle().await;
        if !terminated.is_empty() {
            info!("Heartbeat terminated {} stale sessions", terminated.len());
        }

        for session in self.registry.cleanup_stale().await {
            self.handle_departure(&session).await;
        }
    }
}

fn chrono_duration(duration: Duration) -> chrono::Duration {
    chrono::Duration::from_std(duration).unwrap_or_else(|_| chrono::Duration::seconds(0))
}

fn spawn_loop<F, Fut>(
    hub: SharedHub,
    period: Duration,
    tick: F,
) -> tokio::task::JoinHandle<()>
where
    F: Fn(SharedHub) -> Fut + Send + 'static,
    Fut: std::future::Future<Output = ()> + Send + 'static,
{
    let mut shutdown = hub.shutdown_signal();

    tokio::spawn(async move {
        let mut interval = tokio::time::interval(period);
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

        loop {
            tokio::select! {
                _ = interval.tick() => tick(hub.clone()).await,
                _ = shutdown.changed() => break,
            }
        }
    })
}

// ============================================================================
// TESTS
// ============================================================================
