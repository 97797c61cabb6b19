// ============================================================================
// EVENTS - Wire protocol for client-server canvas communication
// ============================================================================

use crate::database::{CanvasRecord, ShapeRecord};
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::sync::OnceLock;

pub const SHAPE_TYPES: &[&str] = &["rectangle", "circle", "text", "line", "polygon", "image"];

const MAX_COORDINATE: f64 = 1_000_000.0;
const MAX_TEXT_LENGTH: usize = 10_000;

// ============================================================================
// INBOUND FRAMES
// ============================================================================

/// Envelope for every inbound message.
///
/// Clients may also send `userId`, `canvasId` and `timestamp`, but those are
/// never read: the authenticated session is the only source for them.
/// Unknown `type` values are ignored without an error.
#[derive(Debug, Clone, Deserialize)]
pub struct InboundFrame {
    #[serde(rename = "type")]
    pub kind: String,
    #[serde(default)]
    pub payload: serde_json::Value,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CursorMovePayload {
    pub x: f64,
    pub y: f64,
    pub viewport_x: Option<f64>,
    pub viewport_y: Option<f64>,
    pub viewport_zoom: Option<f64>,
}

fn default_true() -> bool {
    true
}

/// Full shape description as sent with SHAPE_CREATE.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ShapeData {
    #[serde(default)]
    pub id: Option<String>,
    #[serde(rename = "type")]
    pub shape_type: String,
    pub x: f64,
    pub y: f64,
    pub width: Option<f64>,
    pub height: Option<f64>,
    pub radius: Option<f64>,
    #[serde(default)]
    pub rotation: f64,
    pub fill: Option<String>,
    pub stroke: Option<String>,
    pub stroke_width: Option<f64>,
    pub opacity: Option<f64>,
    pub border_radius: Option<f64>,
    pub text_content: Option<String>,
    pub font_size: Option<f64>,
    pub font_family: Option<String>,
    pub z_index: Option<i64>,
    #[serde(default = "default_true")]
    pub is_visible: bool,
}

/// Partial shape mutation as sent with SHAPE_UPDATE and batch entries.
/// `is_locked` is wire-only convenience; it is desugared to the durable
/// `locked_at`/`locked_by` pair before persistence.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ShapeUpdates {
    pub x: Option<f64>,
    pub y: Option<f64>,
    pub width: Option<f64>,
    pub height: Option<f64>,
    pub radius: Option<f64>,
    pub rotation: Option<f64>,
    pub fill: Option<String>,
    pub stroke: Option<String>,
    pub stroke_width: Option<f64>,
    pub opacity: Option<f64>,
    pub border_radius: Option<f64>,
    pub text_content: Option<String>,
    pub font_size: Option<f64>,
    pub font_family: Option<String>,
    pub z_index: Option<i64>,
    pub is_visible: Option<bool>,
    pub is_locked: Option<bool>,
}

impl ShapeUpdates {
    /// True when the request touches anything besides the lock flag.
    pub fn has_non_lock_fields(&self) -> bool {
        self.x.is_some()
            || self.y.is_some()
            || self.width.is_some()
            || self.height.is_some()
            || self.radius.is_some()
            || self.rotation.is_some()
            || self.fill.is_some()
            || self.stroke.is_some()
            || self.stroke_width.is_some()
            || self.opacity.is_some()
            || self.border_radius.is_some()
            || self.text_content.is_some()
            || self.font_size.is_some()
            || self.font_family.is_some()
            || self.z_index.is_some()
            || self.is_visible.is_some()
    }

    /// True when the request changes lock state.
    pub fn is_lock_transition(&self) -> bool {
        self.is_locked.is_some()
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ShapeUpdatePayload {
    pub shape_id: String,
    pub updates: ShapeUpdates,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ShapeDeletePayload {
    pub shape_id: Option<String>,
    pub shape_ids: Option<Vec<String>>,
}

impl ShapeDeletePayload {
    /// Single id and id-list forms collapse to one list.
    pub fn ids(&self) -> Vec<String> {
        match (&self.shape_id, &self.shape_ids) {
            (_, Some(ids)) if !ids.is_empty() => ids.clone(),
            (Some(id), _) => vec![id.clone()],
            _ => Vec::new(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BatchUpdateEntry {
    pub id: String,
    pub data: ShapeUpdates,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ShapesBatchUpdatePayload {
    pub updates: Vec<BatchUpdateEntry>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PresenceUpdatePayload {
    #[serde(default)]
    pub selected_object_ids: Vec<String>,
    #[serde(default = "default_true")]
    pub is_active: bool,
}

/// Whitelisted canvas mutations. Unknown fields on the wire are dropped by
/// construction; only the fields below ever reach the store.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CanvasUpdates {
    pub background_color: Option<String>,
}

impl CanvasUpdates {
    pub fn is_empty(&self) -> bool {
        self.background_color.is_none()
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CanvasUpdatePayload {
    pub updates: CanvasUpdates,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SwitchCanvasPayload {
    pub canvas_id: String,
}

// ============================================================================
// OUTBOUND MESSAGES
// ============================================================================

/// One active participant of a canvas, as shown in user lists and cursors.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ActiveUser {
    pub user_id: String,
    pub username: String,
    pub display_name: String,
    pub email: String,
    pub color: String,
    pub cursor_x: f64,
    pub cursor_y: f64,
    #[serde(default)]
    pub selected_object_ids: Vec<String>,
    pub is_active: bool,
}

/// Messages sent from server to client, tagged with `type` and carrying
/// their data under `payload`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", content = "payload")]
pub enum ServerMessage {
    #[serde(rename = "PONG")]
    Pong { timestamp: Option<i64> },

    #[serde(rename = "CANVAS_SYNC")]
    #[serde(rename_all = "camelCase")]
    CanvasSync {
        canvas: CanvasRecord,
        shapes: Vec<ShapeRecord>,
        active_users: Vec<ActiveUser>,
    },

    #[serde(rename = "SHAPE_CREATE")]
    ShapeCreate { shape: ShapeRecord },

    #[serde(rename = "SHAPE_UPDATE")]
    ShapeUpdate { shape: ShapeRecord },

    #[serde(rename = "SHAPE_DELETE")]
    #[serde(rename_all = "camelCase")]
    ShapeDelete { shape_ids: Vec<String> },

    #[serde(rename = "SHAPES_BATCH_UPDATE")]
    ShapesBatchUpdate { shapes: Vec<ShapeRecord> },

    #[serde(rename = "CURSOR_MOVE")]
    #[serde(rename_all = "camelCase")]
    CursorMove {
        user_id: String,
        username: String,
        display_name: String,
        email: String,
        color: String,
        x: f64,
        y: f64,
    },

    #[serde(rename = "PRESENCE_UPDATE")]
    #[serde(rename_all = "camelCase")]
    PresenceUpdate {
        user_id: String,
        selected_object_ids: Vec<String>,
        is_active: bool,
    },

    #[serde(rename = "ACTIVE_USERS")]
    ActiveUsers { users: Vec<ActiveUser> },

    #[serde(rename = "USER_JOIN")]
    UserJoin { user: ActiveUser },

    #[serde(rename = "USER_LEAVE")]
    #[serde(rename_all = "camelCase")]
    UserLeave {
        user_id: String,
        display_name: String,
        color: String,
    },

    #[serde(rename = "CANVAS_UPDATE")]
    #[serde(rename_all = "camelCase")]
    CanvasUpdate {
        canvas_id: String,
        updates: CanvasUpdates,
    },

    #[serde(rename = "CANVAS_SWITCHED")]
    #[serde(rename_all = "camelCase")]
    CanvasSwitched { canvas_id: String },

    #[serde(rename = "ERROR")]
    Error {
        message: String,
        #[serde(skip_serializing_if = "Option::is_none")]
        code: Option<String>,
    },
}

impl ServerMessage {
    pub fn pong(timestamp: Option<i64>) -> Self {
        ServerMessage::Pong { timestamp }
    }

    pub fn error(message: impl Into<String>) -> Self {
        ServerMessage::Error {
            message: message.into(),
            code: None,
        }
    }

    pub fn error_with_code(message: impl Into<String>, code: impl Into<String>) -> Self {
        ServerMessage::Error {
            message: message.into(),
            code: Some(code.into()),
        }
    }
}

// ============================================================================
// VALIDATION
// ============================================================================

static CANVAS_ID_RE: OnceLock<Regex> = OnceLock::new();
static COLOR_RE: OnceLock<Regex> = OnceLock::new();

fn canvas_id_re() -> &'static Regex {
    CANVAS_ID_RE.get_or_init(|| Regex::new(r"^[A-Za-z0-9_-]{3,100}$").unwrap())
}

fn color_re() -> &'static Regex {
    COLOR_RE.get_or_init(|| {
        Regex::new(r"^#([0-9A-Fa-f]{3}|[0-9A-Fa-f]{6}|[0-9A-Fa-f]{8})$").unwrap()
    })
}

/// Canvas ids are url-safe slugs; canonical UUIDs match the same class.
pub fn validate_canvas_id(canvas_id: &str) -> Result<(), String> {
    if canvas_id_re().is_match(canvas_id) {
        Ok(())
    } else {
        Err("Invalid canvas id".to_string())
    }
}

pub fn validate_color(value: &str) -> Result<(), String> {
    if color_re().is_match(value) {
        Ok(())
    } else {
        Err(format!("Invalid color value: {}", value))
    }
}

fn check_coordinate(name: &str, value: f64) -> Result<(), String> {
    if !value.is_finite() || value.abs() > MAX_COORDINATE {
        return Err(format!("{} out of range", name));
    }
    Ok(())
}

fn check_positive_dimension(name: &str, value: f64) -> Result<(), String> {
    if !value.is_finite() || value <= 0.0 || value > MAX_COORDINATE {
        return Err(format!("{} must be positive and within bounds", name));
    }
    Ok(())
}

fn check_opacity(value: f64) -> Result<(), String> {
    if !(0.0..=1.0).contains(&value) {
        return Err("opacity must be between 0 and 1".to_string());
    }
    Ok(())
}

fn check_text(value: &str) -> Result<(), String> {
    if value.chars().count() > MAX_TEXT_LENGTH {
        return Err(format!(
            "textContent exceeds {} characters",
            MAX_TEXT_LENGTH
        ));
    }
    Ok(())
}

impl ShapeData {
    pub fn validate(&self) -> Result<(), String> {
        if !SHAPE_TYPES.contains(&self.shape_type.as_str()) {
            return Err(format!("Unknown shape type: {}", self.shape_type));
        }

        check_coordinate("x", self.x)?;
        check_coordinate("y", self.y)?;

        if let Some(width) = self.width {
            check_positive_dimension("width", width)?;
        }
        if let Some(height) = self.height {
            check_positive_dimension("height", height)?;
        }
        if let Some(radius) = self.radius {
            check_positive_dimension("radius", radius)?;
        }
        if let Some(border_radius) = self.border_radius {
            if !border_radius.is_finite() || border_radius < 0.0 {
                return Err("borderRadius must not be negative".to_string());
            }
        }
        if let Some(opacity) = self.opacity {
            check_opacity(opacity)?;
        }
        if let Some(text) = &self.text_content {
            check_text(text)?;
        }
        if let Some(fill) = &self.fill {
            validate_color(fill)?;
        }
        if let Some(stroke) = &self.stroke {
            validate_color(stroke)?;
        }

        Ok(())
    }
}

impl ShapeUpdates {
    pub fn validate(&self) -> Result<(), String> {
        if let Some(x) = self.x {
            check_coordinate("x", x)?;
        }
        if let Some(y) = self.y {
            check_coordinate("y", y)?;
        }
        if let Some(width) = self.width {
            check_positive_dimension("width", width)?;
        }
        if let Some(height) = self.height {
            check_positive_dimension("height", height)?;
        }
        if let Some(radius) = self.radius {
            check_positive_dimension("radius", radius)?;
        }
        if let Some(border_radius) = self.border_radius {
            if !border_radius.is_finite() || border_radius < 0.0 {
                return Err("borderRadius must not be negative".to_string());
            }
        }
        if let Some(opacity) = self.opacity {
            check_opacity(opacity)?;
        }
        if let Some(text) = &self.text_content {
            check_text(text)?;
        }
        if let Some(fill) = &self.fill {
            validate_color(fill)?;
        }
        if let Some(stroke) = &self.stroke {
            validate_color(stroke)?;
        }

        Ok(())
    }
}

impl CanvasUpdates {
    pub fn validate(&self) -> Result<(), String> {
        if let Some(color) = &self.background_color {
            validate_color(color)?;
        }
        Ok(())
    }
}

// ============================================================================
// TESTS
// ============================================================================
