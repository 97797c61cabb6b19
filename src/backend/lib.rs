// ============================================================================
// LIB.RS - Library exports for the realtime canvas backend
// Makes internal modules available to integration tests
// ============================================================================

pub mod app_state;
pub mod auth;
pub mod cache;
pub mod config;
pub mod database;
pub mod events;
pub mod hub;
pub mod locks;
pub mod presence;
pub mod registry;
pub mod shape_handlers;
pub mod throttle;
pub mod websocket;

// Re-export the types integration tests touch most
pub use app_state::AppState;
pub use config::HubConfig;
pub use database::DatabaseManager;
pub use events::ServerMessage;
pub use hub::{CollabHub, SharedHub};

use axum::{routing::get, Router};
use tower::ServiceBuilder;
use tower_http::trace::TraceLayer;

/// Build the application router. Shared by `main` and the integration
/// tests so both exercise the same routes.
pub fn create_app(hub: SharedHub) -> Router {
    let state = AppState::new(hub);

    Router::new()
        .route("/ws", get(websocket::websocket_handler))
        .route("/api/ws/stats", get(websocket::websocket_stats_handler))
        .route(
            "/api/canvas/:canvas_id/users",
            get(websocket::canvas_users_handler),
        )
        .with_state(state)
        .layer(ServiceBuilder::new().layer(TraceLayer::new_for_http()))
}
