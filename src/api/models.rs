use std::sync::Arc;

use axum::extract::State;
use axum::response::IntoResponse;
use axum::Json;
use serde::Serialize;

use crate::AppState;

#[derive(Debug, Serialize)]
struct ModelSummary {
    model_id: String,
    container_id: String,
    container_name: String,
    port: u16,
    running: bool,
}

#[derive(Debug, Serialize)]
struct ModelsResponse {
    total: usize,
    running: usize,
    max_allowed: usize,
    models: Vec<ModelSummary>,
}

/// GET /models — deployment list with count, running-count, max-allowed.
pub async fn list(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    let deployments = state.registry.list(&state.driver).await;
    let running = deployments.iter().filter(|d| d.running).count();
    let models = deployments
        .into_iter()
        .map(|d| ModelSummary {
            model_id: d.model_id,
            container_id: d.container_id,
            container_name: d.container_name,
            port: d.port,
            running: d.running,
        })
        .collect::<Vec<_>>();

    Json(ModelsResponse {
        total: models.len(),
        running,
        max_allowed: state.config.max_concurrent_models,
        models,
    })
}
