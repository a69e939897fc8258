use std::sync::Arc;

use axum::extract::State;
use axum::http::StatusCode;
use axum::response::IntoResponse;
use axum::Json;
use serde::{Deserialize, Serialize};

use crate::AppState;

#[derive(Debug, Deserialize, Default)]
pub struct DeployRequest {
    #[serde(default)]
    model_id: String,
    hf_token: Option<String>,
    port: Option<u16>,
}

#[derive(Debug, Serialize)]
struct DeployResponse {
    success: bool,
    message: String,
    container_id: Option<String>,
    port: Option<u16>,
}

/// POST /deploy — always returns HTTP 200; `success` signals the outcome.
pub async fn deploy(
    State(state): State<Arc<AppState>>,
    body: Option<Json<DeployRequest>>,
) -> impl IntoResponse {
    let request = body.map(|Json(r)| r).unwrap_or_default();
    let outcome = state
        .lifecycle
        .deploy(
            &request.model_id,
            request.hf_token.as_deref(),
            request.port,
            None,
            None,
        )
        .await;

    Json(DeployResponse {
        success: outcome.success,
        message: outcome.message,
        container_id: outcome.container_id,
        port: outcome.port,
    })
}

#[derive(Debug, Deserialize, Default)]
pub struct SpindownRequest {
    model_id: Option<String>,
    container_id: Option<String>,
}

#[derive(Debug, Serialize)]
struct SpindownResponse {
    success: bool,
    message: String,
}

/// POST /spindown — requires at least one of `model_id` / `container_id`.
pub async fn spindown(
    State(state): State<Arc<AppState>>,
    body: Option<Json<SpindownRequest>>,
) -> impl IntoResponse {
    let request = body.map(|Json(r)| r).unwrap_or_default();
    if request.model_id.is_none() && request.container_id.is_none() {
        return (
            StatusCode::BAD_REQUEST,
            Json(SpindownResponse {
                success: false,
                message: "model_id or container_id is required".to_string(),
            }),
        );
    }

    let success = state
        .lifecycle
        .spindown(request.model_id.as_deref(), request.container_id.as_deref())
        .await;

    (
        StatusCode::OK,
        Json(SpindownResponse {
            success,
            message: if success {
                "spun down".to_string()
            } else {
                "no matching deployment found".to_string()
            },
        }),
    )
}

/// POST /optimize — no body; returns the list of restarted container names.
pub async fn optimize(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    let restarted = state.optimizer.optimize().await;
    Json(serde_json::json!({ "restarted": restarted }))
}
