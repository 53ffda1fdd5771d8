//! HTTP surface

pub mod debug;
pub mod error;
pub mod extract;
pub mod handlers;

use axum::extract::DefaultBodyLimit;
use axum::routing::{get, post};
use axum::Router;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;

use crate::state_manager::AppState;

pub use error::ApiError;

/// Multipart framing and text fields on top of the image itself
const BODY_OVERHEAD_BYTES: usize = 1024 * 1024;

pub fn router(state: AppState) -> Router {
    let body_limit = state.resources.limits().max_image_bytes + BODY_OVERHEAD_BYTES;

    Router::new()
        .route("/api/locate", post(handlers::locate))
        .route("/api/locate_result", get(handlers::locate_result))
        .route("/api/chat", post(handlers::chat))
        .route("/api/place_image", get(handlers::place_image))
        .route("/api/debug/geo", get(debug::geo_probe))
        .route("/api/debug/jobs", get(debug::jobs))
        .route("/api/debug/job", get(debug::job))
        .route("/health", get(handlers::health))
        .route("/metrics", get(handlers::metrics_handler))
        .layer(DefaultBodyLimit::max(body_limit))
        .layer(CorsLayer::permissive())
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}
