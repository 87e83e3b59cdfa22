//! Router assembly for the labgate HTTP API.
//!
//! [`build_router`] wires all handler functions to their routes with
//! CORS and tracing middleware layers.

use axum::routing::{get, post};
use axum::Router;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;

use crate::handlers;
use crate::state::AppState;

/// Builds the complete axum router with all API routes.
///
/// Routes use axum 0.8 `/{param}` path syntax.
pub fn build_router(state: AppState) -> Router {
    Router::new()
        // Sessions
        .route(
            "/sessions",
            get(handlers::sessions::list_sessions).post(handlers::sessions::create_session),
        )
        .route(
            "/sessions/{id}",
            get(handlers::sessions::get_session).delete(handlers::sessions::end_session),
        )
        .route(
            "/sessions/{id}/heartbeat",
            post(handlers::sessions::heartbeat),
        )
        .route("/sessions/{id}/connect", get(handlers::ws::connect))
        // Equipment locks
        .route("/locks", get(handlers::locks::list_locks))
        .route(
            "/equipment/{id}/lock",
            get(handlers::locks::lock_status)
                .post(handlers::locks::acquire_lock)
                .delete(handlers::locks::release_lock),
        )
        .route(
            "/equipment/{id}/lock/renew",
            post(handlers::locks::renew_lock),
        )
        .route(
            "/equipment/{id}/lock/cancel",
            post(handlers::locks::cancel_lock),
        )
        .route(
            "/equipment/{id}/lock/force-release",
            post(handlers::locks::force_release),
        )
        .route("/equipment/{id}/queue", get(handlers::locks::list_queue))
        .route("/equipment/{id}/events", get(handlers::locks::list_events))
        // Permission gate
        .route(
            "/equipment/{id}/commands/authorize",
            post(handlers::commands::authorize_command),
        )
        .layer(CorsLayer::permissive())
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}
