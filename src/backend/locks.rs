// ============================================================================
// LOCKS - Shape lock state machine with activity-gated expiry
// ============================================================================

use crate::database::{LockWrite, ShapeRecord};
use chrono::{DateTime, Utc};
use std::time::Duration;
use tokio::time::Instant;

/// Lock state of a shape at a point in time. A lock older than the TTL is
/// expired: still recorded in the store, but no longer enforceable.
#[derive(Debug, Clone, PartialEq)]
pub enum LockState {
    Unlocked,
    Held { by: String, since: DateTime<Utc> },
    Expired { by: String, since: DateTime<Utc> },
}

/// What the client asked for via `updates.isLocked`.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum LockRequest {
    Lock,
    Unlock,
    None,
}

impl LockRequest {
    pub fn from_flag(is_locked: Option<bool>) -> Self {
        match is_locked {
            Some(true) => LockRequest::Lock,
            Some(false) => LockRequest::Unlock,
            None => LockRequest::None,
        }
    }
}

/// Mutation rejected because another user holds a live lock.
#[derive(Debug, Clone, PartialEq)]
pub struct LockConflict {
    pub held_by: String,
}

pub fn lock_state(shape: &ShapeRecord, now: DateTime<Utc>, ttl: Duration) -> LockState {
    match (&shape.locked_at, &shape.locked_by) {
        (Some(since), Some(by)) => {
            let age = now.signed_duration_since(*since);
            let ttl = chrono::Duration::from_std(ttl).unwrap_or_else(|_| chrono::Duration::seconds(5));
            if age > ttl {
                LockState::Expired {
                    by: by.clone(),
                    since: *since,
                }
            } else {
                LockState::Held {
                    by: by.clone(),
                    since: *since,
                }
            }
        }
        _ => LockState::Unlocked,
    }
}

/// Run the transition table for one mutation request. `Ok` carries the
/// lock columns to persist alongside the mutation; `Err` means the caller
/// gets an ERROR frame plus the authoritative shape snapshot.
pub fn decide(
    shape: &ShapeRecord,
    request: LockRequest,
    actor: &str,
    now: DateTime<Utc>,
    ttl: Duration,
) -> Result<LockWrite, LockConflict> {
    let state = lock_state(shape, now, ttl);

    match request {
        LockRequest::Lock => match &state {
            // free, own refresh, or stealable expired lock
            LockState::Unlocked => Ok(LockWrite::Set {
                at: now,
                by: actor.to_string(),
            }),
            LockState::Held { by, .. } | LockState::Expired { by, .. } if by == actor => {
                Ok(LockWrite::Set {
                    at: now,
                    by: actor.to_string(),
                })
            }
            LockState::Expired { .. } => Ok(LockWrite::Set {
                at: now,
                by: actor.to_string(),
            }),
            LockState::Held { by, .. } => Err(LockConflict {
                held_by: by.clone(),
            }),
        },

        LockRequest::Unlock => match &state {
            LockState::Unlocked => Ok(LockWrite::Clear),
            LockState::Held { by, .. } if by == actor => Ok(LockWrite::Clear),
            LockState::Expired { .. } => Ok(LockWrite::Clear),
            LockState::Held { by, .. } => Err(LockConflict {
                held_by: by.clone(),
            }),
        },

        // plain mutation: blocked only by someone else's live lock
        LockRequest::None => match &state {
            LockState::Held { by, .. } if by != actor => Err(LockConflict {
                held_by: by.clone(),
            }),
            _ => Ok(LockWrite::Keep),
        },
    }
}

/// Activity gate for the sweep: an expired lock is only released when its
/// holder has also been idle for the full TTL. A holder with no recorded
/// cursor activity counts as idle.
pub fn holder_idle(last_activity: Option<Instant>, ttl: Duration) -> bool {
    match last_activity {
        Some(at) => at.elapsed() >= ttl,
        None => true,
    }
}

// ============================================================================
// TESTS
// ============================================================================
