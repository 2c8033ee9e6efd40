pub mod config;
pub mod error;
pub mod models;
pub mod routes;
pub mod services;

use axum::extract::DefaultBodyLimit;
use axum::routing::post;
use axum::Router;
use services::classifier::ZeroShotModel;
use std::sync::Arc;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;

/// Room for multipart boundaries and headers around a maximum-size file.
const MULTIPART_OVERHEAD: usize = 64 * 1024;

/// Process-wide state, built once at startup and never mutated.
#[derive(Clone)]
pub struct AppState {
    pub model: Arc<dyn ZeroShotModel>,
}

impl AppState {
    pub fn new(model: Arc<dyn ZeroShotModel>) -> Self {
        Self { model }
    }
}

pub fn construct_router(state: AppState) -> Router {
    Router::new()
        .route("/classify/", post(routes::classify::classify_waste))
        .layer(DefaultBodyLimit::max(
            routes::classify::MAX_FILE_SIZE + MULTIPART_OVERHEAD,
        ))
        // Mirrors any origin and allows credentials. Restrict before exposing publicly.
        .layer(CorsLayer::very_permissive())
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}
