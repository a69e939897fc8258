pub mod deploy;
pub mod models;
pub mod vram;

use std::sync::Arc;

use axum::http::StatusCode;
use axum::routing::{get, post};
use axum::Router;

use crate::AppState;

pub fn routes(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/vram", get(vram::snapshot))
        .route("/vram/stream", get(vram::stream))
        .route("/vram/aggregated", get(vram::aggregated))
        .route("/models", get(models::list))
        .route("/deploy", post(deploy::deploy))
        .route("/spindown", post(deploy::spindown))
        .route("/optimize", post(deploy::optimize))
        .fallback(not_found)
        .with_state(state)
}

async fn not_found() -> (StatusCode, &'static str) {
    (StatusCode::NOT_FOUND, "not found")
}
