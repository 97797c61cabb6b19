// ============================================================================
// THROTTLE - Per-sender rate gates and per-recipient broadcast batching
// ============================================================================

use crate::events::ServerMessage;
use crate::registry::SocketCommand;
use std::collections::{HashMap, VecDeque};
use std::hash::Hash;
use std::time::Duration;
use tokio::sync::{mpsc, Mutex};
use tokio::time::Instant;
use tracing::debug;

/// Minimum-gap gate over a keyed stream. `admit` answers whether an event
/// may pass now and, if so, consumes the slot.
#[derive(Debug)]
pub struct ThrottleGate<K> {
    min_gap: Duration,
    last_pass: Mutex<HashMap<K, Instant>>,
}

impl<K> ThrottleGate<K>
where
    K: Eq + Hash + Clone,
{
    pub fn new(min_gap: Duration) -> Self {
        Self {
            min_gap,
            last_pass: Mutex::new(HashMap::new()),
        }
    }

    pub async fn admit(&self, key: K) -> bool {
        let now = Instant::now();
        let mut last_pass = self.last_pass.lock().await;

        match last_pass.get(&key) {
            Some(last) if now.duration_since(*last) < self.min_gap => false,
            _ => {
                last_pass.insert(key, now);
                true
            }
        }
    }

    /// Drop bookkeeping for a key, e.g. when its connection goes away.
    pub async fn forget(&self, key: &K) {
        self.last_pass.lock().await.remove(key);
    }

    /// Drop bookkeeping matching a predicate (canvas/shape keyed gates).
    pub async fn forget_matching(&self, predicate: impl Fn(&K) -> bool) {
        self.last_pass.lock().await.retain(|key, _| !predicate(key));
    }
}

// ============================================================================
// BATCH QUEUES
// ============================================================================

/// Per-recipient FIFO queues for low-priority traffic, flushed on the
/// frame tick. High-priority sends route through `send_flushed` so the
/// pending batch drains first and per-connection order stays FIFO.
#[derive(Debug, Default)]
pub struct BatchQueues {
    queues: Mutex<HashMap<String, VecDeque<ServerMessage>>>,
}

impl BatchQueues {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a low-priority message for one recipient.
    pub async fn enqueue(&self, connection_id: &str, message: ServerMessage) {
        self.queues
            .lock()
            .await
            .entry(connection_id.to_string())
            .or_default()
            .push_back(message);
    }

    /// Send a high-priority message, draining the recipient's pending
    /// batch first. Everything happens under the queue lock; channel
    /// sends never block.
    pub async fn send_flushed(
        &self,
        connection_id: &str,
        sender: &mpsc::UnboundedSender<SocketCommand>,
        message: ServerMessage,
    ) {
        let mut queues = self.queues.lock().await;

        if let Some(queue) = queues.get_mut(connection_id) {
            for queued in queue.drain(..) {
                let _ = sender.send(SocketCommand::Frame(queued));
            }
        }
        let _ = sender.send(SocketCommand::Frame(message));
    }

    /// Frame tick: drain every queue into its recipient, in arrival
    /// order. Recipients missing from `senders` have disconnected since
    /// enqueue; their queues are dropped.
    pub async fn flush_with(
        &self,
        senders: &HashMap<String, mpsc::UnboundedSender<SocketCommand>>,
    ) {
        let mut queues = self.queues.lock().await;

        queues.retain(|connection_id, queue| {
            let Some(sender) = senders.get(connection_id) else {
                debug!(
                    "Dropping {} queued messages for vanished connection {}",
                    queue.len(),
                    connection_id
                );
                return false;
            };

            for message in queue.drain(..) {
                let _ = sender.send(SocketCommand::Frame(message));
            }
            true
        });
    }

    /// Forget a recipient's queue on disconnect.
    pub async fn remove(&self, connection_id: &str) {
        self.queues.lock().await.remove(connection_id);
    }

    pub async fn queued_len(&self, connection_id: &str) -> usize {
        self.queues
            .lock()
            .await
            .get(connection_id)
            .map(|q| q.len())
            .unwrap_or(0)
    }
}

// ============================================================================
// TESTS
// ============================================================================
