// ============================================================================
// AUTH - Token verification and identity resolution for hub admission
// ============================================================================

use jsonwebtoken::{decode, DecodingKey, Validation};
use serde::{Deserialize, Serialize};
use std::env;

// Fallback secret for local development; deployments set JWT_SECRET.
const DEFAULT_JWT_SECRET: &[u8] = b"design-canvas-dev-secret-change-me";

// Neon palette for cursor and avatar colors. Assignment is by user id hash
// so a user keeps the same color across sessions and canvases.
pub const NEON_PALETTE: &[&str] = &[
    "#FF2D95", // Neon Pink
    "#00F0FF", // Electric Cyan
    "#39FF14", // Neon Green
    "#FFE600", // Laser Yellow
    "#FF6B00", // Neon Orange
    "#B026FF", // Electric Purple
    "#04D9FF", // Vivid Sky
    "#FF3131", // Neon Red
    "#0FFF95", // Spring Neon
    "#F3F315", // Acid Lime
    "#FF61F6", // Hot Magenta
    "#7DF9FF", // Glow Blue
];

/// Claims carried by the bearer token issued by the external signer.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Claims {
    pub user_id: String,
    pub email: String,
    pub display_name: String,
    #[serde(default)]
    pub username: Option<String>,
    pub exp: usize,
}

impl Claims {
    /// Username claim with fallback to the local part of the email.
    pub fn username_or_default(&self) -> String {
        match &self.username {
            Some(name) if !name.is_empty() => name.clone(),
            _ => self
                .email
                .split('@')
                .next()
                .unwrap_or(self.email.as_str())
                .to_string(),
        }
    }
}

fn jwt_secret() -> Vec<u8> {
    env::var("JWT_SECRET")
        .map(|s| s.into_bytes())
        .unwrap_or_else(|_| DEFAULT_JWT_SECRET.to_vec())
}

/// Validate a bearer token and return its claims.
/// Signature and expiry checks are handled by the jsonwebtoken validation.
pub fn validate_jwt(token: &str) -> Result<Claims, jsonwebtoken::errors::Error> {
    decode::<Claims>(
        token,
        &DecodingKey::from_secret(&jwt_secret()),
        &Validation::default(),
    )
    .map(|data| data.claims)
}

/// How the client identified itself on the connection URL.
#[derive(Debug, Clone)]
pub enum Credentials {
    /// Bearer token from query parameter, sub-protocol or cookie.
    Token(String),
    /// Development fallback: a bare user id.
    DevUserId(String),
    Missing,
}

/// Resolved identity after admission checks.
#[derive(Debug, Clone)]
pub struct Identity {
    pub user_id: String,
    pub username: String,
    pub email: String,
    pub display_name: String,
}

/// Resolve credentials to an identity. Tokens are always accepted; the
/// bare-userId fallback only when dev mode is enabled.
pub fn resolve_identity(credentials: &Credentials, dev_mode: bool) -> Result<Identity, String> {
    match credentials {
        Credentials::Token(token) => {
            let claims =
                validate_jwt(token).map_err(|e| format!("Invalid authentication token: {}", e))?;
            Ok(Identity {
                username: claims.username_or_default(),
                user_id: claims.user_id,
                email: claims.email,
                display_name: claims.display_name,
            })
        }
        Credentials::DevUserId(user_id) if dev_mode => Ok(Identity {
            user_id: user_id.clone(),
            username: user_id.clone(),
            email: format!("{}@dev.local", user_id),
            display_name: user_id.clone(),
        }),
        Credentials::DevUserId(_) => Err("userId connections require dev mode".to_string()),
        Credentials::Missing => Err("Authentication required".to_string()),
    }
}

// ============================================================================
// AVATAR COLORS
// ============================================================================

/// FNV-1a hash for stable, well-distributed palette assignment.
fn fnv_hash(input: &str) -> u32 {
    const FNV_OFFSET_BASIS: u32 = 2166136261;
    const FNV_PRIME: u32 = 16777619;

    let mut hash = FNV_OFFSET_BASIS;
    for byte in input.bytes() {
        hash ^= byte as u32;
        hash = hash.wrapping_mul(FNV_PRIME);
    }
    hash
}

/// Deterministic palette color for a user id.
pub fn avatar_color_for(user_id: &str) -> String {
    let index = (fnv_hash(user_id) as usize) % NEON_PALETTE.len();
    NEON_PALETTE[index].to_string()
}

// ============================================================================
// TESTS
// ============================================================================
