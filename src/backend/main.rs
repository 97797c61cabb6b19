// ============================================================================
// MAIN - Entry point for the realtime design-canvas backend
// ============================================================================

use std::sync::Arc;

mod app_state;
mod auth;
mod cache;
mod config;
mod database;
mod events;
mod hub;
mod locks;
mod presence;
mod registry;
mod shape_handlers;
mod throttle;
mod websocket;

use app_state::AppState;
use axum::{routing::get, Router};
use config::HubConfig;
use database::DatabaseManager;
use hub::CollabHub;
use tower::ServiceBuilder;
use tower_http::trace::TraceLayer;

#[tokio::main]
async fn main() {
    dotenvy::dotenv().ok();

    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_target(true)
        .init();

    tracing::info!("Starting design canvas backend");

    let hub_config = HubConfig::from_env();
    if hub_config.dev_mode {
        tracing::warn!("DEV_MODE is enabled: bare userId connections are accepted");
    }

    // SQLite persistence
    let db = match DatabaseManager::new().await {
        Ok(db) => {
            tracing::info!("Database ready");
            Arc::new(db)
        }
        Err(e) => {
            tracing::error!("Failed to initialize database: {:?}", e);
            panic!("Database initialization failed");
        }
    };

    // Seed a public playground canvas so dev-mode clients can connect
    // against a fresh database.
    if hub_config.dev_mode {
        match db.find_canvas_by_id("playground").await {
            Ok(None) => {
                let seeded = db
                    .create_canvas(Some("playground".to_string()), "dev", "Playground", true)
                    .await;
                match seeded {
                    Ok(canvas) => tracing::info!("Seeded dev canvas {}", canvas.id),
                    Err(e) => tracing::warn!("Failed to seed dev canvas: {}", e),
                }
            }
            Ok(Some(_)) => {}
            Err(e) => tracing::warn!("Dev canvas lookup failed: {}", e),
        }
    }

    // Realtime hub with its timer loops
    let hub = CollabHub::new(hub_config, db);
    hub.clone().start().await;

    let state = AppState::new(hub.clone());
    let app = Router::new()
        .route("/ws", get(websocket::websocket_handler))
        .route("/api/ws/stats", get(websocket::websocket_stats_handler))
        .route(
            "/api/canvas/:canvas_id/users",
            get(websocket::canvas_users_handler),
        )
        .with_state(state)
        .layer(ServiceBuilder::new().layer(TraceLayer::new_for_http()));

    let bind_addr =
        std::env::var("BIND_ADDR").unwrap_or_else(|_| "0.0.0.0:3000".to_string());
    let listener = match tokio::net::TcpListener::bind(&bind_addr).await {
        Ok(listener) => listener,
        Err(e) => {
            tracing::error!("Failed to bind {}: {}", bind_addr, e);
            panic!("Listener bind failed");
        }
    };
    tracing::info!("Listening on {}", bind_addr);

    let serve_result = axum::serve(listener, app)
        .with_graceful_shutdown(async {
            let _ = tokio::signal::ctrl_c().await;
            tracing::info!("Shutdown signal received");
        })
        .await;

    if let Err(e) = serve_result {
        tracing::error!("Server error: {}", e);
    }

    // Stop timers, flush batches, close sockets with a normal closure.
    hub.shutdown().await;
    tracing::info!("Design canvas backend stopped");
}
