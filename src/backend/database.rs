// ============================================================================
// DATABASE MODULE - SQLite persistence for users, canvases, shapes, presence
// ============================================================================

use crate::auth::{avatar_color_for, Identity};
use crate::events::{ActiveUser, CanvasUpdates, ShapeData, ShapeUpdates};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::sqlite::{SqlitePool, SqlitePoolOptions, SqliteRow};
use sqlx::Row;
use uuid::Uuid;

// ============================================================================
// RECORDS
// ============================================================================

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UserRecord {
    pub id: String,
    pub username: String,
    pub email: String,
    pub display_name: String,
    pub avatar_color: String,
    pub is_online: bool,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CanvasRecord {
    pub id: String,
    pub owner_id: String,
    pub name: String,
    pub is_public: bool,
    pub background_color: String,
    pub viewport_x: f64,
    pub viewport_y: f64,
    pub viewport_zoom: f64,
    pub grid_enabled: bool,
    pub grid_size: f64,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ShapeRecord {
    pub id: String,
    pub canvas_id: String,
    #[serde(rename = "type")]
    pub shape_type: String,
    pub x: f64,
    pub y: f64,
    pub width: Option<f64>,
    pub height: Option<f64>,
    pub radius: Option<f64>,
    pub rotation: f64,
    pub fill: Option<String>,
    pub stroke: Option<String>,
    pub stroke_width: Option<f64>,
    pub opacity: Option<f64>,
    pub border_radius: Option<f64>,
    pub text_content: Option<String>,
    pub font_size: Option<f64>,
    pub font_family: Option<String>,
    pub z_index: i64,
    pub is_visible: bool,
    pub locked_at: Option<DateTime<Utc>>,
    pub locked_by: Option<String>,
    pub created_by: String,
    pub last_modified_by: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PresenceRecord {
    pub user_id: String,
    pub canvas_id: String,
    pub cursor_x: f64,
    pub cursor_y: f64,
    pub viewport_x: Option<f64>,
    pub viewport_y: Option<f64>,
    pub viewport_zoom: Option<f64>,
    #[serde(default)]
    pub selected_object_ids: Vec<String>,
    pub color: String,
    pub connection_id: String,
    pub last_heartbeat: DateTime<Utc>,
    pub is_active: bool,
}

/// Rectangular region for viewport-limited shape queries.
#[derive(Debug, Clone, Copy)]
pub struct ViewportBounds {
    pub min_x: f64,
    pub min_y: f64,
    pub max_x: f64,
    pub max_y: f64,
}

/// How a shape write treats the lock columns. Both columns always move
/// together so the two fields are never set independently.
#[derive(Debug, Clone, PartialEq)]
pub enum LockWrite {
    Keep,
    Set { at: DateTime<Utc>, by: String },
    Clear,
}

// ============================================================================
// DATABASE MANAGER
// ============================================================================

#[derive(Debug)]
pub struct DatabaseManager {
    pool: SqlitePool,
}

impl DatabaseManager {
    /// Open (or create) the on-disk database and run schema setup.
    pub async fn new() -> Result<Self, Box<dyn std::error::Error>> {
        std::fs::create_dir_all("data").ok();

        let database_url = std::env::var("DATABASE_URL")
            .unwrap_or_else(|_| "sqlite:data/canvas.db?mode=rwc".to_string());
        let pool = SqlitePool::connect(&database_url).await?;

        let manager = Self { pool };
        manager.init_database().await?;

        Ok(manager)
    }

    /// In-memory database for tests. A single connection keeps every
    /// query on the same memory database.
    pub async fn new_in_memory() -> Result<Self, Box<dyn std::error::Error>> {
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect("sqlite::memory:")
            .await?;

        let manager = Self { pool };
        manager.init_database().await?;

        Ok(manager)
    }

    async fn init_database(&self) -> Result<(), Box<dyn std::error::Error>> {
        // SQLite does not enforce foreign keys by default
        sqlx::query("PRAGMA foreign_keys = ON")
            .execute(&self.pool)
            .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS users (
                id TEXT PRIMARY KEY,
                username TEXT NOT NULL,
                email TEXT NOT NULL,
                display_name TEXT NOT NULL,
                avatar_color TEXT NOT NULL,
                is_online BOOLEAN NOT NULL DEFAULT FALSE,
                is_deleted BOOLEAN NOT NULL DEFAULT FALSE,
                created_at TEXT NOT NULL,
                updated_at TEXT NOT NULL
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS canvases (
                id TEXT PRIMARY KEY,
                owner_id TEXT NOT NULL,
                name TEXT NOT NULL,
                is_public BOOLEAN NOT NULL DEFAULT FALSE,
                background_color TEXT NOT NULL DEFAULT '#FFFFFF',
                viewport_x REAL NOT NULL DEFAULT 0,
                viewport_y REAL NOT NULL DEFAULT 0,
                viewport_zoom REAL NOT NULL DEFAULT 1,
                grid_enabled BOOLEAN NOT NULL DEFAULT FALSE,
                grid_size REAL NOT NULL DEFAULT 20,
                is_deleted BOOLEAN NOT NULL DEFAULT FALSE,
                last_accessed_at TEXT NOT NULL,
                created_at TEXT NOT NULL,
                updated_at TEXT NOT NULL
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS canvas_objects (
                id TEXT PRIMARY KEY,
                canvas_id TEXT NOT NULL,
                type TEXT NOT NULL,
                x REAL NOT NULL,
                y REAL NOT NULL,
                width REAL,
                height REAL,
                radius REAL,
                rotation REAL NOT NULL DEFAULT 0,
                fill TEXT,
                stroke TEXT,
                stroke_width REAL,
                opacity REAL,
                border_radius REAL,
                text_content TEXT,
                font_size REAL,
                font_family TEXT,
                z_index INTEGER NOT NULL DEFAULT 0,
                is_visible BOOLEAN NOT NULL DEFAULT TRUE,
                is_deleted BOOLEAN NOT NULL DEFAULT FALSE,
                locked_at TEXT,
                locked_by TEXT,
                created_by TEXT NOT NULL,
                last_modified_by TEXT NOT NULL,
                created_at TEXT NOT NULL,
                updated_at TEXT NOT NULL,
                FOREIGN KEY (canvas_id) REFERENCES canvases (id)
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            "CREATE INDEX IF NOT EXISTS idx_objects_canvas ON canvas_objects (canvas_id, is_deleted)",
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            "CREATE INDEX IF NOT EXISTS idx_objects_locked ON canvas_objects (canvas_id, locked_at)",
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS presence (
                user_id TEXT NOT NULL,
                canvas_id TEXT NOT NULL,
                cursor_x REAL NOT NULL DEFAULT 0,
                cursor_y REAL NOT NULL DEFAULT 0,
                viewport_x REAL,
                viewport_y REAL,
                viewport_zoom REAL,
                selected_object_ids TEXT NOT NULL DEFAULT '[]',
                color TEXT NOT NULL,
                connection_id TEXT NOT NULL,
                last_heartbeat TEXT NOT NULL,
                is_active BOOLEAN NOT NULL DEFAULT TRUE,
                PRIMARY KEY (user_id, canvas_id)
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            "CREATE INDEX IF NOT EXISTS idx_presence_heartbeat ON presence (last_heartbeat)",
        )
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    // ========================================================================
    // USERS
    // ========================================================================

    /// Look up a user by id, inserting the row on first authenticated
    /// appearance. The avatar color is assigned exactly once.
    pub async fn get_or_create_user(&self, identity: &Identity) -> Result<UserRecord, sqlx::Error> {
        if let Some(mut user) = self.get_user_by_id(&identity.user_id).await? {
            if user.avatar_color.is_empty() {
                user.avatar_color = avatar_color_for(&identity.user_id);
                sqlx::query("UPDATE users SET avatar_color = ?, updated_at = ? WHERE id = ?")
                    .bind(&user.avatar_color)
                    .bind(Utc::now())
                    .bind(&user.id)
                    .execute(&self.pool)
                    .await?;
            }
            return Ok(user);
        }

        let now = Utc::now();
        let user = UserRecord {
            id: identity.user_id.clone(),
            username: identity.username.clone(),
            email: identity.email.clone(),
            display_name: identity.display_name.clone(),
            avatar_color: avatar_color_for(&identity.user_id),
            is_online: true,
            created_at: now,
            updated_at: now,
        };

        sqlx::query(
            r#"
            INSERT INTO users (id, username, email, display_name, avatar_color, is_online, created_at, updated_at)
            VALUES (?, ?, ?, ?, ?, TRUE, ?, ?)
            "#,
        )
        .bind(&user.id)
        .bind(&user.username)
        .bind(&user.email)
        .bind(&user.display_name)
        .bind(&user.avatar_color)
        .bind(user.created_at)
        .bind(user.updated_at)
        .execute(&self.pool)
        .await?;

        Ok(user)
    }

    pub async fn get_user_by_id(&self, user_id: &str) -> Result<Option<UserRecord>, sqlx::Error> {
        let row = sqlx::query("SELECT * FROM users WHERE id = ? AND is_deleted = FALSE")
            .bind(user_id)
            .fetch_optional(&self.pool)
            .await?;

        row.map(|r| map_user_row(&r)).transpose()
    }

    pub async fn set_user_online(&self, user_id: &str, online: bool) -> Result<(), sqlx::Error> {
        sqlx::query("UPDATE users SET is_online = ?, updated_at = ? WHERE id = ?")
            .bind(online)
            .bind(Utc::now())
            .bind(user_id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    // ========================================================================
    // CANVASES
    // ========================================================================

    /// Single authority for session admission: owner or public canvas,
    /// never a soft-deleted one.
    pub async fn check_access(&self, canvas_id: &str, user_id: &str) -> Result<bool, sqlx::Error> {
        let row = sqlx::query(
            "SELECT owner_id, is_public FROM canvases WHERE id = ? AND is_deleted = FALSE",
        )
        .bind(canvas_id)
        .fetch_optional(&self.pool)
        .await?;

        Ok(match row {
            Some(row) => {
                let owner_id: String = row.try_get("owner_id")?;
                let is_public: bool = row.try_get("is_public")?;
                is_public || owner_id == user_id
            }
            None => false,
        })
    }

    pub async fn find_canvas_by_id(
        &self,
        canvas_id: &str,
    ) -> Result<Option<CanvasRecord>, sqlx::Error> {
        let row = sqlx::query("SELECT * FROM canvases WHERE id = ? AND is_deleted = FALSE")
            .bind(canvas_id)
            .fetch_optional(&self.pool)
            .await?;

        row.map(|r| map_canvas_row(&r)).transpose()
    }

    /// Used by the HTTP sibling and by tests to seed canvases.
    pub async fn create_canvas(
        &self,
        id: Option<String>,
        owner_id: &str,
        name: &str,
        is_public: bool,
    ) -> Result<CanvasRecord, sqlx::Error> {
        let now = Utc::now();
        let canvas = CanvasRecord {
            id: id.unwrap_or_else(|| Uuid::new_v4().to_string()),
            owner_id: owner_id.to_string(),
            name: name.to_string(),
            is_public,
            background_color: "#FFFFFF".to_string(),
            viewport_x: 0.0,
            viewport_y: 0.0,
            viewport_zoom: 1.0,
            grid_enabled: false,
            grid_size: 20.0,
            created_at: now,
            updated_at: now,
        };

        sqlx::query(
            r#"
            INSERT INTO canvases (id, owner_id, name, is_public, background_color,
                                  viewport_x, viewport_y, viewport_zoom, grid_enabled, grid_size,
                                  last_accessed_at, created_at, updated_at)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(&canvas.id)
        .bind(&canvas.owner_id)
        .bind(&canvas.name)
        .bind(canvas.is_public)
        .bind(&canvas.background_color)
        .bind(canvas.viewport_x)
        .bind(canvas.viewport_y)
        .bind(canvas.viewport_zoom)
        .bind(canvas.grid_enabled)
        .bind(canvas.grid_size)
        .bind(now)
        .bind(now)
        .bind(now)
        .execute(&self.pool)
        .await?;

        Ok(canvas)
    }

    /// Apply the whitelisted canvas mutations and return the fresh record.
    pub async fn update_canvas(
        &self,
        canvas_id: &str,
        updates: &CanvasUpdates,
    ) -> Result<Option<CanvasRecord>, sqlx::Error> {
        if let Some(background_color) = &updates.background_color {
            sqlx::query(
                "UPDATE canvases SET background_color = ?, updated_at = ? WHERE id = ? AND is_deleted = FALSE",
            )
            .bind(background_color)
            .bind(Utc::now())
            .bind(canvas_id)
            .execute(&self.pool)
            .await?;
        }

        self.find_canvas_by_id(canvas_id).await
    }

    pub async fn update_last_accessed(&self, canvas_id: &str) -> Result<(), sqlx::Error> {
        sqlx::query("UPDATE canvases SET last_accessed_at = ? WHERE id = ?")
            .bind(Utc::now())
            .bind(canvas_id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    // ========================================================================
    // SHAPES
    // ========================================================================

    pub async fn get_shapes(&self, canvas_id: &str) -> Result<Vec<ShapeRecord>, sqlx::Error> {
        let rows = sqlx::query(
            r#"
            SELECT * FROM canvas_objects
            WHERE canvas_id = ? AND is_deleted = FALSE
            ORDER BY z_index ASC, created_at ASC
            "#,
        )
        .bind(canvas_id)
        .fetch_all(&self.pool)
        .await?;

        rows.iter().map(map_shape_row).collect()
    }

    pub async fn get_shapes_in_viewport(
        &self,
        canvas_id: &str,
        bounds: ViewportBounds,
        limit: i64,
    ) -> Result<Vec<ShapeRecord>, sqlx::Error> {
        let rows = sqlx::query(
            r#"
            SELECT * FROM canvas_objects
            WHERE canvas_id = ? AND is_deleted = FALSE
              AND x <= ? AND x + COALESCE(width, COALESCE(radius, 0) * 2) >= ?
              AND y <= ? AND y + COALESCE(height, COALESCE(radius, 0) * 2) >= ?
            ORDER BY z_index ASC
            LIMIT ?
            "#,
        )
        .bind(canvas_id)
        .bind(bounds.max_x)
        .bind(bounds.min_x)
        .bind(bounds.max_y)
        .bind(bounds.min_y)
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;

        rows.iter().map(map_shape_row).collect()
    }

    pub async fn get_shape_by_id(&self, shape_id: &str) -> Result<Option<ShapeRecord>, sqlx::Error> {
        let row = sqlx::query("SELECT * FROM canvas_objects WHERE id = ? AND is_deleted = FALSE")
            .bind(shape_id)
            .fetch_optional(&self.pool)
            .await?;

        row.map(|r| map_shape_row(&r)).transpose()
    }

    /// Insert a new shape. Without an explicit z index the shape lands on
    /// top of the canvas stack.
    pub async fn create_shape(
        &self,
        canvas_id: &str,
        user_id: &str,
        data: &ShapeData,
    ) -> Result<ShapeRecord, sqlx::Error> {
        let z_index = match data.z_index {
            Some(z) => z,
            None => {
                let row = sqlx::query(
                    "SELECT COALESCE(MAX(z_index), 0) AS top FROM canvas_objects WHERE canvas_id = ? AND is_deleted = FALSE",
                )
                .bind(canvas_id)
                .fetch_one(&self.pool)
                .await?;
                row.try_get::<i64, _>("top")? + 1
            }
        };

        let now = Utc::now();
        let shape = ShapeRecord {
            id: data
                .id
                .clone()
                .unwrap_or_else(|| Uuid::new_v4().to_string()),
            canvas_id: canvas_id.to_string(),
            shape_type: data.shape_type.clone(),
            x: data.x,
            y: data.y,
            width: data.width,
            height: data.height,
            radius: data.radius,
            rotation: data.rotation,
            fill: data.fill.clone(),
            stroke: data.stroke.clone(),
            stroke_width: data.stroke_width,
            opacity: data.opacity,
            border_radius: data.border_radius,
            text_content: data.text_content.clone(),
            font_size: data.font_size,
            font_family: data.font_family.clone(),
            z_index,
            is_visible: data.is_visible,
            locked_at: None,
            locked_by: None,
            created_by: user_id.to_string(),
            last_modified_by: user_id.to_string(),
            created_at: now,
            updated_at: now,
        };

        sqlx::query(
            r#"
            INSERT INTO canvas_objects (id, canvas_id, type, x, y, width, height, radius,
                                        rotation, fill, stroke, stroke_width, opacity, border_radius,
                                        text_content, font_size, font_family, z_index, is_visible,
                                        created_by, last_modified_by, created_at, updated_at)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(&shape.id)
        .bind(&shape.canvas_id)
        .bind(&shape.shape_type)
        .bind(shape.x)
        .bind(shape.y)
        .bind(shape.width)
        .bind(shape.height)
        .bind(shape.radius)
        .bind(shape.rotation)
        .bind(&shape.fill)
        .bind(&shape.stroke)
        .bind(shape.stroke_width)
        .bind(shape.opacity)
        .bind(shape.border_radius)
        .bind(&shape.text_content)
        .bind(shape.font_size)
        .bind(&shape.font_family)
        .bind(shape.z_index)
        .bind(shape.is_visible)
        .bind(&shape.created_by)
        .bind(&shape.last_modified_by)
        .bind(shape.created_at)
        .bind(shape.updated_at)
        .execute(&self.pool)
        .await?;

        Ok(shape)
    }

    /// Read-modify-write a shape with last-writer-wins semantics. Lock
    /// columns only move as instructed by `lock`.
    pub async fn update_shape(
        &self,
        shape_id: &str,
        user_id: &str,
        updates: &ShapeUpdates,
        lock: LockWrite,
    ) -> Result<Option<ShapeRecord>, sqlx::Error> {
        let Some(mut shape) = self.get_shape_by_id(shape_id).await? else {
            return Ok(None);
        };

        apply_updates(&mut shape, updates);
        match lock {
            LockWrite::Keep => {}
            LockWrite::Set { at, by } => {
                shape.locked_at = Some(at);
                shape.locked_by = Some(by);
            }
            LockWrite::Clear => {
                shape.locked_at = None;
                shape.locked_by = None;
            }
        }
        shape.last_modified_by = user_id.to_string();
        shape.updated_at = Utc::now();

        sqlx::query(
            r#"
            UPDATE canvas_objects
            SET x = ?, y = ?, width = ?, height = ?, radius = ?, rotation = ?,
                fill = ?, stroke = ?, stroke_width = ?, opacity = ?, border_radius = ?,
                text_content = ?, font_size = ?, font_family = ?, z_index = ?, is_visible = ?,
                locked_at = ?, locked_by = ?, last_modified_by = ?, updated_at = ?
            WHERE id = ?
            "#,
        )
        .bind(shape.x)
        .bind(shape.y)
        .bind(shape.width)
        .bind(shape.height)
        .bind(shape.radius)
        .bind(shape.rotation)
        .bind(&shape.fill)
        .bind(&shape.stroke)
        .bind(shape.stroke_width)
        .bind(shape.opacity)
        .bind(shape.border_radius)
        .bind(&shape.text_content)
        .bind(shape.font_size)
        .bind(&shape.font_family)
        .bind(shape.z_index)
        .bind(shape.is_visible)
        .bind(shape.locked_at)
        .bind(&shape.locked_by)
        .bind(&shape.last_modified_by)
        .bind(shape.updated_at)
        .bind(&shape.id)
        .execute(&self.pool)
        .await?;

        Ok(Some(shape))
    }

    pub async fn delete_shape(&self, shape_id: &str) -> Result<bool, sqlx::Error> {
        let result = sqlx::query(
            "UPDATE canvas_objects SET is_deleted = TRUE, updated_at = ? WHERE id = ? AND is_deleted = FALSE",
        )
        .bind(Utc::now())
        .bind(shape_id)
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected() > 0)
    }

    /// Soft-delete several shapes, returning the ids that actually existed.
    pub async fn delete_shapes(&self, shape_ids: &[String]) -> Result<Vec<String>, sqlx::Error> {
        let mut deleted = Vec::with_capacity(shape_ids.len());
        for shape_id in shape_ids {
            if self.delete_shape(shape_id).await? {
                deleted.push(shape_id.clone());
            }
        }
        Ok(deleted)
    }

    /// Apply a list of pre-checked batch entries. Missing shapes are
    /// skipped; the updated records come back in request order.
    pub async fn batch_update_shapes(
        &self,
        entries: Vec<(String, ShapeUpdates, LockWrite)>,
        user_id: &str,
    ) -> Result<Vec<ShapeRecord>, sqlx::Error> {
        let mut updated = Vec::with_capacity(entries.len());
        for (shape_id, updates, lock) in entries {
            if let Some(shape) = self.update_shape(&shape_id, user_id, &updates, lock).await? {
                updated.push(shape);
            }
        }
        Ok(updated)
    }

    // ========================================================================
    // LOCKS
    // ========================================================================

    pub async fn get_expired_locks(
        &self,
        canvas_id: &str,
        older_than: DateTime<Utc>,
    ) -> Result<Vec<ShapeRecord>, sqlx::Error> {
        let rows = sqlx::query(
            r#"
            SELECT * FROM canvas_objects
            WHERE canvas_id = ? AND is_deleted = FALSE
              AND locked_at IS NOT NULL AND locked_at < ?
            "#,
        )
        .bind(canvas_id)
        .bind(older_than)
        .fetch_all(&self.pool)
        .await?;

        rows.iter().map(map_shape_row).collect()
    }

    /// Clear one lock and return the refreshed record.
    pub async fn clear_lock(&self, shape_id: &str) -> Result<Option<ShapeRecord>, sqlx::Error> {
        sqlx::query(
            "UPDATE canvas_objects SET locked_at = NULL, locked_by = NULL, updated_at = ? WHERE id = ?",
        )
        .bind(Utc::now())
        .bind(shape_id)
        .execute(&self.pool)
        .await?;

        self.get_shape_by_id(shape_id).await
    }

    /// Release every lock a user holds on a canvas; used on disconnect.
    pub async fn unlock_shapes_by_user(
        &self,
        user_id: &str,
        canvas_id: &str,
    ) -> Result<Vec<ShapeRecord>, sqlx::Error> {
        let rows = sqlx::query(
            "SELECT id FROM canvas_objects WHERE canvas_id = ? AND locked_by = ? AND is_deleted = FALSE",
        )
        .bind(canvas_id)
        .bind(user_id)
        .fetch_all(&self.pool)
        .await?;

        let mut released = Vec::with_capacity(rows.len());
        for row in rows {
            let shape_id: String = row.try_get("id")?;
            if let Some(shape) = self.clear_lock(&shape_id).await? {
                released.push(shape);
            }
        }
        Ok(released)
    }

    // ========================================================================
    // PRESENCE
    // ========================================================================

    /// Insert-or-update keyed on (user, canvas); shared with the HTTP
    /// sync endpoint, serialized by the upsert itself.
    pub async fn upsert_presence(&self, row: &PresenceRecord) -> Result<(), sqlx::Error> {
        let selected = serde_json::to_string(&row.selected_object_ids).unwrap_or_else(|_| "[]".to_string());

        sqlx::query(
            r#"
            INSERT INTO presence (user_id, canvas_id, cursor_x, cursor_y,
                                  viewport_x, viewport_y, viewport_zoom,
                                  selected_object_ids, color, connection_id,
                                  last_heartbeat, is_active)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            ON CONFLICT (user_id, canvas_id) DO UPDATE SET
                cursor_x = excluded.cursor_x,
                cursor_y = excluded.cursor_y,
                viewport_x = COALESCE(excluded.viewport_x, presence.viewport_x),
                viewport_y = COALESCE(excluded.viewport_y, presence.viewport_y),
                viewport_zoom = COALESCE(excluded.viewport_zoom, presence.viewport_zoom),
                selected_object_ids = excluded.selected_object_ids,
                color = excluded.color,
                connection_id = excluded.connection_id,
                last_heartbeat = excluded.last_heartbeat,
                is_active = excluded.is_active
            "#,
        )
        .bind(&row.user_id)
        .bind(&row.canvas_id)
        .bind(row.cursor_x)
        .bind(row.cursor_y)
        .bind(row.viewport_x)
        .bind(row.viewport_y)
        .bind(row.viewport_zoom)
        .bind(selected)
        .bind(&row.color)
        .bind(&row.connection_id)
        .bind(row.last_heartbeat)
        .bind(row.is_active)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    /// Remove the presence row of a closing connection; returns the
    /// affected (user, canvas) pair for follow-up broadcasts.
    pub async fn remove_presence_by_connection(
        &self,
        connection_id: &str,
    ) -> Result<Option<(String, String)>, sqlx::Error> {
        let row = sqlx::query(
            "SELECT user_id, canvas_id FROM presence WHERE connection_id = ?",
        )
        .bind(connection_id)
        .fetch_optional(&self.pool)
        .await?;

        let Some(row) = row else {
            return Ok(None);
        };
        let user_id: String = row.try_get("user_id")?;
        let canvas_id: String = row.try_get("canvas_id")?;

        sqlx::query("DELETE FROM presence WHERE connection_id = ?")
            .bind(connection_id)
            .execute(&self.pool)
            .await?;

        Ok(Some((user_id, canvas_id)))
    }

    /// Refresh liveness for a connection, e.g. on a heartbeat pong.
    pub async fn refresh_heartbeat(&self, connection_id: &str) -> Result<(), sqlx::Error> {
        sqlx::query("UPDATE presence SET last_heartbeat = ? WHERE connection_id = ?")
            .bind(Utc::now())
            .bind(connection_id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    pub async fn get_active_presence(
        &self,
        canvas_id: &str,
        since_heartbeat: DateTime<Utc>,
    ) -> Result<Vec<PresenceRecord>, sqlx::Error> {
        let rows = sqlx::query(
            "SELECT * FROM presence WHERE canvas_id = ? AND last_heartbeat >= ?",
        )
        .bind(canvas_id)
        .bind(since_heartbeat)
        .fetch_all(&self.pool)
        .await?;

        rows.iter().map(map_presence_row).collect()
    }

    /// Presence joined with user display fields for ACTIVE_USERS frames.
    pub async fn get_active_users(
        &self,
        canvas_id: &str,
        since_heartbeat: DateTime<Utc>,
    ) -> Result<Vec<ActiveUser>, sqlx::Error> {
        let rows = sqlx::query(
            r#"
            SELECT p.user_id, p.cursor_x, p.cursor_y, p.selected_object_ids,
                   p.color, p.is_active,
                   u.username, u.display_name, u.email
            FROM presence p
            JOIN users u ON u.id = p.user_id
            WHERE p.canvas_id = ? AND p.last_heartbeat >= ?
            ORDER BY u.display_name ASC
            "#,
        )
        .bind(canvas_id)
        .bind(since_heartbeat)
        .fetch_all(&self.pool)
        .await?;

        rows.iter()
            .map(|row| {
                let selected_raw: String = row.try_get("selected_object_ids")?;
                Ok(ActiveUser {
                    user_id: row.try_get("user_id")?,
                    username: row.try_get("username")?,
                    display_name: row.try_get("display_name")?,
                    email: row.try_get("email")?,
                    color: row.try_get("color")?,
                    cursor_x: row.try_get("cursor_x")?,
                    cursor_y: row.try_get("cursor_y")?,
                    selected_object_ids: serde_json::from_str(&selected_raw).unwrap_or_default(),
                    is_active: row.try_get("is_active")?,
                })
            })
            .collect()
    }

    /// Delete rows whose heartbeat is too old; returns the affected
    /// canvas ids so their user lists can be re-broadcast.
    pub async fn cleanup_stale_presence(
        &self,
        older_than: DateTime<Utc>,
    ) -> Result<Vec<String>, sqlx::Error> {
        let rows = sqlx::query("SELECT DISTINCT canvas_id FROM presence WHERE last_heartbeat < ?")
            .bind(older_than)
            .fetch_all(&self.pool)
            .await?;

        let canvases: Vec<String> = rows
            .iter()
            .map(|r| r.try_get::<String, _>("canvas_id"))
            .collect::<Result<_, _>>()?;

        if !canvases.is_empty() {
            sqlx::query("DELETE FROM presence WHERE last_heartbeat < ?")
                .bind(older_than)
                .execute(&self.pool)
                .await?;
        }

        Ok(canvases)
    }
}

// ============================================================================
// ROW MAPPING
// ============================================================================

fn map_user_row(row: &SqliteRow) -> Result<UserRecord, sqlx::Error> {
    Ok(UserRecord {
        id: row.try_get("id")?,
        username: row.try_get("username")?,
        email: row.try_get("email")?,
        display_name: row.try_get("display_name")?,
        avatar_color: row.try_get("avatar_color")?,
        is_online: row.try_get("is_online")?,
        created_at: row.try_get("created_at")?,
        updated_at: row.try_get("updated_at")?,
    })
}

fn map_canvas_row(row: &SqliteRow) -> Result<CanvasRecord, sqlx::Error> {
    Ok(CanvasRecord {
        id: row.try_get("id")?,
        owner_id: row.try_get("owner_id")?,
        name: row.try_get("name")?,
        is_public: row.try_get("is_public")?,
        background_color: row.try_get("background_color")?,
        viewport_x: row.try_get("viewport_x")?,
        viewport_y: row.try_get("viewport_y")?,
        viewport_zoom: row.try_get("viewport_zoom")?,
        grid_enabled: row.try_get("grid_enabled")?,
        grid_size: row.try_get("grid_size")?,
        created_at: row.try_get("created_at")?,
        updated_at: row.try_get("updated_at")?,
    })
}

fn map_shape_row(row: &SqliteRow) -> Result<ShapeRecord, sqlx::Error> {
    Ok(ShapeRecord {
        id: row.try_get("id")?,
        canvas_id: row.try_get("canvas_id")?,
        shape_type: row.try_get("type")?,
        x: row.try_get("x")?,
        y: row.try_get("y")?,
        width: row.try_get("width")?,
        height: row.try_get("height")?,
        radius: row.try_get("radius")?,
        rotation: row.try_get("rotation")?,
        fill: row.try_get("fill")?,
        stroke: row.try_get("stroke")?,
        stroke_width: row.try_get("stroke_width")?,
        opacity: row.try_get("opacity")?,
        border_radius: row.try_get("border_radius")?,
        text_content: row.try_get("text_content")?,
        font_size: row.try_get("font_size")?,
        font_family: row.try_get("font_family")?,
        z_index: row.try_get("z_index")?,
        is_visible: row.try_get("is_visible")?,
        locked_at: row.try_get("locked_at")?,
        locked_by: row.try_get("locked_by")?,
        created_by: row.try_get("created_by")?,
        last_modified_by: row.try_get("last_modified_by")?,
        created_at: row.try_get("created_at")?,
        updated_at: row.try_get("updated_at")?,
    })
}

fn map_presence_row(row: &SqliteRow) -> Result<PresenceRecord, sqlx::Error> {
    let selected_raw: String = row.try_get("selected_object_ids")?;

    Ok(PresenceRecord {
        user_id: row.try_get("user_id")?,
        canvas_id: row.try_get("canvas_id")?,
        cursor_x: row.try_get("cursor_x")?,
        cursor_y: row.try_get("cursor_y")?,
        viewport_x: row.try_get("viewport_x")?,
        viewport_y: row.try_get("viewport_y")?,
        viewport_zoom: row.try_get("viewport_zoom")?,
        selected_object_ids: serde_json::from_str(&selected_raw).unwrap_or_default(),
        color: row.try_get("color")?,
        connection_id: row.try_get("connection_id")?,
        last_heartbeat: row.try_get("last_heartbeat")?,
        is_active: row.try_get("is_active")?,
    })
}

fn apply_updates(shape: &mut ShapeRecord, updates: &ShapeUpdates) {
    if let Some(x) = updates.x {
        shape.x = x;
    }
    if let Some(y) = updates.y {
        shape.y = y;
    }
    if let Some(width) = updates.width {
        shape.width = Some(width);
    }
    if let Some(height) = updates.height {
        shape.height = Some(height);
    }
    if let Some(radius) = updates.radius {
        shape.radius = Some(radius);
    }
    if let Some(rotation) = updates.rotation {
        shape.rotation = rotation;
    }
    if let Some(fill) = &updates.fill {
        shape.fill = Some(fill.clone());
    }
    if let Some(stroke) = &updates.stroke {
        shape.stroke = Some(stroke.clone());
    }
    if let Some(stroke_width) = updates.stroke_width {
        shape.stroke_width = Some(stroke_width);
    }
    if let Some(opacity) = updates.opacity {
        shape.opacity = Some(opacity);
    }
    if let Some(border_radius) = updates.border_radius {
        shape.border_radius = Some(border_radius);
    }
    if let Some(text_content) = &updates.text_content {
        shape.text_content = Some(text_content.clone());
    }
    if let Some(font_size) = updates.font_size {
        shape.font_size = Some(font_size);
    }
    if let Some(font_family) = &updates.font_family {
        shape.font_family = Some(font_family.clone());
    }
    if let Some(z_index) = updates.z_index {
        shape.z_index = z_index;
    }
    if let Some(is_visible) = updates.is_visible {
        shape.is_visible = is_visible;
    }
}

// ============================================================================
// TESTS
// ============================================================================
