use std::sync::Arc;

use axum::{
    extract::DefaultBodyLimit,
    routing::{get, post},
    Router,
};
use tower::ServiceBuilder;
use tower_http::trace::TraceLayer;

use super::handlers;
use super::ApiState;

/// Room for the multipart framing and the text fields around the image.
const MULTIPART_OVERHEAD_BYTES: usize = 64 * 1024;

pub fn create_router(state: Arc<ApiState>) -> Router {
    let body_limit = state
        .config
        .max_file_size
        .saturating_add(MULTIPART_OVERHEAD_BYTES);

    let middleware = ServiceBuilder::new()
        .layer(TraceLayer::new_for_http())
        .layer(DefaultBodyLimit::max(body_limit));

    Router::new()
        .route("/api/remove-background", post(handlers::remove_background))
        .route("/api/usage", get(handlers::get_usage))
        .route("/api/usage/history", get(handlers::usage_history))
        .route("/api/status", get(handlers::service_status))
        .route("/health", get(handlers::health_check))
        .with_state(state)
        .layer(middleware)
}
