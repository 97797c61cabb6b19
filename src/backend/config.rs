// ============================================================================
// CONFIG - Timing and limit configuration for the realtime hub
// ============================================================================

use std::env;
use std::time::Duration;

/// All timing knobs and limits that drive hub behaviour.
///
/// Defaults match the protocol contract the frontend is built against;
/// every value can be overridden through the environment (seconds or
/// milliseconds as indicated by the variable name).
#[derive(Debug, Clone)]
pub struct HubConfig {
    /// Interval between server pings; a session that misses a full cycle
    /// is terminated.
    pub heartbeat_interval: Duration,
    /// Presence rows with a heartbeat older than this are evicted.
    pub presence_ttl: Duration,
    /// A shape lock counts as expired after this much time.
    pub lock_ttl: Duration,
    /// Minimum gap between cursor broadcasts per connection.
    pub cursor_throttle: Duration,
    /// Minimum gap between non-lock shape update broadcasts per shape.
    pub shape_throttle: Duration,
    /// Batched (low-priority) messages are flushed on this tick.
    pub batch_interval: Duration,
    /// How often stale presence rows are swept from the store.
    pub presence_cleanup_interval: Duration,
    /// How often expired locks are checked for release.
    pub lock_sweep_interval: Duration,
    /// TTL for the read caches over the store.
    pub cache_ttl: Duration,
    /// Upper bound on entries in a SHAPES_BATCH_UPDATE request.
    pub max_batch_update: usize,
    /// Accept a bare userId query parameter instead of a token.
    pub dev_mode: bool,
}

impl Default for HubConfig {
    fn default() -> Self {
        Self {
            heartbeat_interval: Duration::from_secs(30),
            presence_ttl: Duration::from_secs(30),
            lock_ttl: Duration::from_secs(5),
            cursor_throttle: Duration::from_millis(25),
            shape_throttle: Duration::from_millis(33),
            batch_interval: Duration::from_millis(16),
            presence_cleanup_interval: Duration::from_secs(60),
            lock_sweep_interval: Duration::from_secs(1),
            cache_ttl: Duration::from_secs(5),
            max_batch_update: 100,
            dev_mode: false,
        }
    }
}

impl HubConfig {
    /// Build the configuration from environment variables, falling back to
    /// the defaults for anything unset or unparsable.
    pub fn from_env() -> Self {
        let defaults = Self::default();

        Self {
            heartbeat_interval: env_secs("WS_HEARTBEAT_SECS", defaults.heartbeat_interval),
            presence_ttl: env_secs("PRESENCE_TTL_SECS", defaults.presence_ttl),
            lock_ttl: env_secs("LOCK_TTL_SECS", defaults.lock_ttl),
            cursor_throttle: env_millis("CURSOR_THROTTLE_MS", defaults.cursor_throttle),
            shape_throttle: env_millis("SHAPE_THROTTLE_MS", defaults.shape_throttle),
            batch_interval: env_millis("BATCH_INTERVAL_MS", defaults.batch_interval),
            presence_cleanup_interval: env_secs(
                "PRESENCE_CLEANUP_SECS",
                defaults.presence_cleanup_interval,
            ),
            lock_sweep_interval: env_secs("LOCK_SWEEP_SECS", defaults.lock_sweep_interval),
            cache_ttl: env_secs("CACHE_TTL_SECS", defaults.cache_ttl),
            max_batch_update: env::var("MAX_BATCH_UPDATE")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(defaults.max_batch_update),
            dev_mode: env::var("DEV_MODE")
                .map(|v| v == "1" || v.eq_ignore_ascii_case("true"))
                .unwrap_or(false),
        }
    }
}

fn env_secs(name: &str, default: Duration) -> Duration {
    env::var(name)
        .ok()
        .and_then(|v| v.parse::<u64>().ok())
        .map(Duration::from_secs)
        .unwrap_or(default)
}

fn env_millis(name: &str, default: Duration) -> Duration {
    env::var(name)
        .ok()
        .and_then(|v| v.parse::<u64>().ok())
        .map(Duration::from_millis)
        .unwrap_or(default)
}

// ============================================================================
// TESTS
// ============================================================================
