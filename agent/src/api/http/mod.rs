//! HTTP API handlers

mod exec;
mod health;
mod legacy;

use axum::{
    routing::{get, post},
    Router,
};
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;

use crate::AppState;

/// Prefix every route is served under
pub const BASE_PATH: &str = "/dockin/opagent";

/// Create the HTTP router with all routes
pub fn create_router(state: AppState) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    let api_routes = Router::new()
        // Health check
        .route("/health", get(health::health_check))
        // Direct streaming endpoints
        .route(
            "/exec/serverexec",
            get(exec::server_exec).post(exec::server_exec),
        )
        .route(
            "/attach/serverattach",
            get(exec::server_attach).post(exec::server_attach),
        )
        // Two-step token flow
        .route("/exec/prepare", post(exec::prepare_exec))
        .route("/attach/prepare", post(exec::prepare_attach))
        .route("/exec/{token}", get(exec::serve_prepared_exec))
        .route("/attach/{token}", get(exec::serve_prepared_attach))
        // Pod-addressed legacy endpoints
        .route("/exec/common", post(legacy::common_exec))
        .route("/exec/ssh", get(legacy::ssh));

    Router::new()
        .nest(BASE_PATH, api_routes)
        .layer(TraceLayer::new_for_http())
        .layer(cors)
        .with_state(state)
}
