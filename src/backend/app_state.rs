// ============================================================================
// APP_STATE - Centralized application state for axum handlers
// ============================================================================

use crate::hub::SharedHub;

/// Shared state handed to every handler via the State extractor. The hub
/// owns the database handle, caches, registry and timer loops; cloning is
/// a cheap Arc clone.
#[derive(Clone)]
pub struct AppState {
    pub hub: SharedHub,
}

impl AppState {
    pub fn new(hub: SharedHub) -> Self {
        Self { hub }
    }
}
