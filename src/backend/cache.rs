// ============================================================================
// CACHE - Bounded TTL read caches over the canvas store
// ============================================================================

use crate::database::{CanvasRecord, DatabaseManager, ShapeRecord};
use std::collections::HashMap;
use std::hash::Hash;
use std::time::{Duration, Instant};
use tokio::sync::RwLock;
use tracing::debug;

/// A small time-to-live cache. Entries expire `ttl` after insertion and
/// are dropped lazily on access; writers invalidate explicitly.
#[derive(Debug)]
pub struct TtlCache<K, V> {
    ttl: Duration,
    entries: RwLock<HashMap<K, (V, Instant)>>,
}

impl<K, V> TtlCache<K, V>
where
    K: Eq + Hash + Clone,
    V: Clone,
{
    pub fn new(ttl: Duration) -> Self {
        Self {
            ttl,
            entries: RwLock::new(HashMap::new()),
        }
    }

    pub async fn get(&self, key: &K) -> Option<V> {
        {
            let entries = self.entries.read().await;
            if let Some((value, inserted_at)) = entries.get(key) {
                if inserted_at.elapsed() < self.ttl {
                    return Some(value.clone());
                }
            } else {
                return None;
            }
        }

        // Entry exists but is stale; drop it.
        self.entries.write().await.remove(key);
        None
    }

    pub async fn insert(&self, key: K, value: V) {
        self.entries.write().await.insert(key, (value, Instant::now()));
    }

    pub async fn invalidate(&self, key: &K) {
        self.entries.write().await.remove(key);
    }

    pub async fn len(&self) -> usize {
        self.entries.read().await.len()
    }
}

// ============================================================================
// CANVAS CACHES
// ============================================================================

/// The three read caches the realtime path leans on: canvas metadata,
/// shape lists per canvas, and individual shapes. Every shape or canvas
/// write invalidates the affected keys before the change is broadcast.
#[derive(Debug)]
pub struct CanvasCaches {
    canvases: TtlCache<String, CanvasRecord>,
    shape_lists: TtlCache<String, Vec<ShapeRecord>>,
    shapes: TtlCache<String, ShapeRecord>,
}

impl CanvasCaches {
    pub fn new(ttl: Duration) -> Self {
        Self {
            canvases: TtlCache::new(ttl),
            shape_lists: TtlCache::new(ttl),
            shapes: TtlCache::new(ttl),
        }
    }

    pub async fn get_canvas(
        &self,
        db: &DatabaseManager,
        canvas_id: &str,
    ) -> Result<Option<CanvasRecord>, sqlx::Error> {
        if let Some(canvas) = self.canvases.get(&canvas_id.to_string()).await {
            return Ok(Some(canvas));
        }

        let canvas = db.find_canvas_by_id(canvas_id).await?;
        if let Some(canvas) = &canvas {
            self.canvases
                .insert(canvas_id.to_string(), canvas.clone())
                .await;
        }
        Ok(canvas)
    }

    pub async fn get_shapes(
        &self,
        db: &DatabaseManager,
        canvas_id: &str,
    ) -> Result<Vec<ShapeRecord>, sqlx::Error> {
        if let Some(shapes) = self.shape_lists.get(&canvas_id.to_string()).await {
            debug!("shape list cache hit for canvas {}", canvas_id);
            return Ok(shapes);
        }

        let shapes = db.get_shapes(canvas_id).await?;
        self.shape_lists
            .insert(canvas_id.to_string(), shapes.clone())
            .await;
        Ok(shapes)
    }

    pub async fn get_shape(
        &self,
        db: &DatabaseManager,
        shape_id: &str,
    ) -> Result<Option<ShapeRecord>, sqlx::Error> {
        if let Some(shape) = self.shapes.get(&shape_id.to_string()).await {
            return Ok(Some(shape));
        }

        let shape = db.get_shape_by_id(shape_id).await?;
        if let Some(shape) = &shape {
            self.shapes.insert(shape_id.to_string(), shape.clone()).await;
        }
        Ok(shape)
    }

    /// Invalidate after any shape write on a canvas.
    pub async fn invalidate_shape(&self, canvas_id: &str, shape_id: &str) {
        self.shape_lists.invalidate(&canvas_id.to_string()).await;
        self.shapes.invalidate(&shape_id.to_string()).await;
    }

    /// Invalidate after canvas metadata writes or bulk shape changes.
    pub async fn invalidate_canvas(&self, canvas_id: &str) {
        self.canvases.invalidate(&canvas_id.to_string()).await;
        self.shape_lists.invalidate(&canvas_id.to_string()).await;
    }
}

// ============================================================================
// TESTS
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_ttl_cache_expires_entries() {
        let cache: TtlCache<String, i32> = TtlCache::new(Duration::from_millis(30));

        cache.insert("a".to_string(), 1).await;
        assert_eq!(cache.get(&"a".to_string()).await, Some(1));

        tokio::time::sleep(Duration::from_millis(40)).await;
        assert_eq!(cache.get(&"a".to_string()).await, None);
        assert_eq!(cache.len().await, 0);
    }

    #[tokio::test]
    async fn test_invalidate_removes_entry() {
        let cache: TtlCache<String, i32> = TtlCache::new(Duration::from_secs(60));

        cache.insert("a".to_string(), 1).await;
        cache.invalidate(&"a".to_string()).await;
        assert_eq!(cache.get(&"a".to_string()).await, None);
    }

    #[tokio::test]
    async fn test_canvas_caches_serve_and_invalidate() {
        use crate::auth::Identity;

        let db = DatabaseManager::new_in_memory().await.unwrap();
        db.get_or_create_user(&Identity {
            user_id: "owner".to_string(),
            username: "owner".to_string(),
            email: "owner@example.com".to_string(),
            display_name: "Owner".to_string(),
        })
        .await
        .unwrap();
        let canvas = db
            .create_canvas(None, "owner", "Cached", true)
            .await
            .unwrap();

        let caches = CanvasCaches::new(Duration::from_secs(60));

        let shape_data: crate::events::ShapeData = serde_json::from_value(serde_json::json!({
            "type": "circle", "x": 1.0, "y": 2.0, "radius": 5.0
        }))
        .unwrap();
        let shape = db.create_shape(&canvas.id, "owner", &shape_data).await.unwrap();

        // warm the list cache, then create a second shape behind its back
        let cached = caches.get_shapes(&db, &canvas.id).await.unwrap();
        assert_eq!(cached.len(), 1);

        db.create_shape(&canvas.id, "owner", &shape_data).await.unwrap();
        let still_cached = caches.get_shapes(&db, &canvas.id).await.unwrap();
        assert_eq!(still_cached.len(), 1);

        // invalidation makes the new shape visible
        caches.invalidate_shape(&canvas.id, &shape.id).await;
        let fresh = caches.get_shapes(&db, &canvas.id).await.unwrap();
        assert_eq!(fresh.len(), 2);
    }
}
